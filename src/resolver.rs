//! Resolution of the ordered metadata URI list for a pinned directory.
//!
//! The gateway listing is advisory: it is used only when it names exactly the
//! item files that were uploaded. Otherwise the URIs are constructed from the
//! folder URL, which is always the right shape but unverified.

use std::{collections::BTreeSet, sync::OnceLock};

use regex::Regex;

use crate::{
    metadata::item_file,
    pinning::{PinnedDirectory, PinningBackend},
};

/// Which strategy produced a [`Resolution`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Taken from the pinning service's directory listing.
    Listing,
    /// Built from the folder URL without verification (degraded mode).
    Constructed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// Exactly `count` URIs; entry `i - 1` addresses item `i`.
    pub uris: Vec<String>,
    pub strategy: Strategy,
}

impl Resolution {
    pub fn degraded(&self) -> bool {
        self.strategy == Strategy::Constructed
    }
}

/// Resolve the metadata URIs of the `count` items pinned under `dir`.
pub async fn resolve<P: PinningBackend>(backend: &P, dir: &PinnedDirectory, count: u32) -> Resolution {
    let folder_url = backend.folder_url(dir);
    match backend.list_directory(dir).await {
        Ok(hrefs) => {
            if let Some(uris) = from_listing(&folder_url, &hrefs, count) {
                tracing::info!(folder = %dir.folder(), count, "resolved metadata URIs from listing");
                return Resolution {
                    uris,
                    strategy: Strategy::Listing,
                };
            }
            tracing::warn!(
                folder = %dir.folder(),
                count,
                listed = hrefs.len(),
                "directory listing did not match uploaded items; constructing URIs"
            );
        }
        Err(e) => {
            tracing::warn!(folder = %dir.folder(), %e, "directory listing failed; constructing URIs");
        }
    }
    Resolution {
        uris: constructed(&folder_url, count),
        strategy: Strategy::Constructed,
    }
}

/// Accept a listing only when its item files are exactly `1.json ..= count.json`.
pub fn from_listing(folder_url: &str, hrefs: &[String], count: u32) -> Option<Vec<String>> {
    let indices: BTreeSet<u32> = hrefs
        .iter()
        .filter_map(|href| item_index(href))
        .collect();
    let expected = (1..=count).collect::<BTreeSet<u32>>();
    if count == 0 || indices != expected {
        return None;
    }
    Some(
        indices
            .into_iter()
            .map(|i| format!("{folder_url}{}", item_file(i)))
            .collect(),
    )
}

/// URIs built by index, without checking that they exist.
pub fn constructed(folder_url: &str, count: u32) -> Vec<String> {
    (1..=count)
        .map(|i| format!("{folder_url}{}", item_file(i)))
        .collect()
}

/// Index of a listing entry named `<digits>.json`. Entries with query strings,
/// nested path segments, or any other name are rejected.
fn item_index(href: &str) -> Option<u32> {
    static ITEM: OnceLock<Regex> = OnceLock::new();
    let re = ITEM.get_or_init(|| Regex::new(r"^([0-9]+)\.json$").expect("static item pattern"));
    let caps = re.captures(href)?;
    let index: u32 = caps[1].parse().ok()?;
    (index > 0).then_some(index)
}
