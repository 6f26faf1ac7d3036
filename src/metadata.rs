//! Collection and item metadata documents for an event.

use std::num::NonZeroU32;

use serde::Serialize;

use crate::error::{Error, Result};

/// File name of the collection descriptor inside the pinned directory.
pub const COLLECTION_FILE: &str = "collection.json";

/// Largest supply a single event may declare.
pub const MAX_SUPPLY: u32 = 10_000;

/// Fields describing the collection to generate.
#[derive(Debug, Clone)]
pub struct MetadataRequest {
    pub name: String,
    pub space_label: String,
    pub description: String,
    /// Image location embedded in every descriptor.
    pub image: String,
    pub count: NonZeroU32,
}

/// A named file ready for pinning.
#[derive(Debug, Clone, PartialEq)]
pub struct Payload {
    pub filename: String,
    pub bytes: Vec<u8>,
}

#[derive(Serialize)]
struct CollectionDescriptor<'a> {
    name: &'a str,
    space: &'a str,
    description: &'a str,
    image: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
}

#[derive(Serialize)]
struct ItemDescriptor<'a> {
    name: String,
    description: &'a str,
    image: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
}

/// Validate a requested item count against `1..=MAX_SUPPLY`.
pub fn supply(n: i64) -> Result<NonZeroU32> {
    u32::try_from(n)
        .ok()
        .filter(|&n| n <= MAX_SUPPLY)
        .and_then(NonZeroU32::new)
        .ok_or_else(|| {
            Error::InvalidRequest(format!("supply must be between 1 and {MAX_SUPPLY}, got {n}"))
        })
}

/// File name of item `index`'s descriptor.
pub fn item_file(index: u32) -> String {
    format!("{index}.json")
}

/// Build `collection.json` followed by `1.json ..= count.json`.
pub fn build(req: &MetadataRequest) -> Vec<Payload> {
    let count = req.count.get();
    let mut payloads = Vec::with_capacity(count.min(MAX_SUPPLY) as usize + 1);
    let collection = CollectionDescriptor {
        name: &req.name,
        space: &req.space_label,
        description: &req.description,
        image: &req.image,
        kind: "collection",
    };
    payloads.push(Payload {
        filename: COLLECTION_FILE.to_string(),
        bytes: to_json(&collection),
    });
    for i in 1..=count {
        let item = ItemDescriptor {
            name: format!("{} #{}", req.name, i),
            description: &req.description,
            image: &req.image,
            kind: "nft",
        };
        payloads.push(Payload {
            filename: item_file(i),
            bytes: to_json(&item),
        });
    }
    payloads
}

fn to_json<T: Serialize>(value: &T) -> Vec<u8> {
    // Structs of borrowed strings always serialize.
    serde_json::to_vec_pretty(value).unwrap_or_default()
}
