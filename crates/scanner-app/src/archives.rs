//! Archive list taken from the configuration file.

use async_trait::async_trait;
use henyey_common::Url;
use henyey_history_scanner::{CoordinatorError, HistoryArchiveService};

/// Serves a fixed list of archive URLs.
#[derive(Debug, Clone, Default)]
pub struct ConfiguredArchives {
    urls: Vec<Url>,
}

impl ConfiguredArchives {
    /// Duplicates are dropped, keeping the first occurrence.
    pub fn new(urls: Vec<Url>) -> Self {
        let mut unique = Vec::with_capacity(urls.len());
        for url in urls {
            if !unique.contains(&url) {
                unique.push(url);
            }
        }
        Self { urls: unique }
    }
}

#[async_trait]
impl HistoryArchiveService for ConfiguredArchives {
    async fn get_history_archive_urls(&self) -> Result<Vec<Url>, CoordinatorError> {
        if self.urls.is_empty() {
            return Err(CoordinatorError::Archives(
                "no history archives configured".to_string(),
            ));
        }
        Ok(self.urls.clone())
    }
}
