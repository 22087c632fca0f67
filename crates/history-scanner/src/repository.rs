//! Persistence seam for [`Scan`] records.

use std::collections::HashMap;

use async_trait::async_trait;
use henyey_common::Url;
use parking_lot::RwLock;

use crate::error::RepositoryError;
use crate::scan::Scan;

/// Stores scans and answers "where did each chain stop".
#[async_trait]
pub trait ScanRepository: Send + Sync {
    async fn save(&self, scans: &[Scan]) -> Result<(), RepositoryError>;

    /// The most recent scan of `url`.
    async fn find_latest_by_url(&self, url: &Url) -> Result<Option<Scan>, RepositoryError>;

    /// The most recent scan of every archive ever scanned.
    async fn find_latest(&self) -> Result<Vec<Scan>, RepositoryError>;
}

/// Keeps the latest scan per archive from a list of scans.
///
/// A later scan replaces an earlier one when its `end_date` is not older,
/// so among equal dates the last saved wins.
pub fn latest_per_url<'a>(scans: impl IntoIterator<Item = &'a Scan>) -> Vec<Scan> {
    let mut latest: HashMap<&Url, &Scan> = HashMap::new();
    for scan in scans {
        match latest.get(&scan.base_url) {
            Some(current) if current.end_date > scan.end_date => {}
            _ => {
                latest.insert(&scan.base_url, scan);
            }
        }
    }
    let mut result: Vec<Scan> = latest.into_values().cloned().collect();
    result.sort_by(|a, b| a.base_url.cmp(&b.base_url));
    result
}

/// Repository held entirely in memory.
#[derive(Debug, Default)]
pub struct InMemoryScanRepository {
    scans: RwLock<Vec<Scan>>,
}

impl InMemoryScanRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every scan saved so far, in save order.
    pub fn all(&self) -> Vec<Scan> {
        self.scans.read().clone()
    }
}

#[async_trait]
impl ScanRepository for InMemoryScanRepository {
    async fn save(&self, scans: &[Scan]) -> Result<(), RepositoryError> {
        self.scans.write().extend_from_slice(scans);
        Ok(())
    }

    async fn find_latest_by_url(&self, url: &Url) -> Result<Option<Scan>, RepositoryError> {
        let scans = self.scans.read();
        Ok(latest_per_url(scans.iter().filter(|scan| &scan.base_url == url))
            .into_iter()
            .next())
    }

    async fn find_latest(&self) -> Result<Vec<Scan>, RepositoryError> {
        Ok(latest_per_url(self.scans.read().iter()))
    }
}
