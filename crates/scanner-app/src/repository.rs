//! Scan history kept in a single JSON file.
//!
//! The whole history is loaded when the store is opened and rewritten on
//! every save. Writes go to a sibling temporary file that is then renamed
//! over the store, so a crash never leaves a truncated file behind.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use henyey_common::Url;
use henyey_history_scanner::repository::latest_per_url;
use henyey_history_scanner::{RepositoryError, Scan, ScanRepository};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// [`ScanRepository`] backed by a JSON array of [`Scan`] records.
#[derive(Debug)]
pub struct JsonFileScanRepository {
    path: PathBuf,
    scans: Mutex<Vec<Scan>>,
}

impl JsonFileScanRepository {
    /// Open the store at `path`. A missing file is an empty store.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, RepositoryError> {
        let path = path.as_ref().to_path_buf();
        let scans = match tokio::fs::read(&path).await {
            Ok(content) if content.iter().all(u8::is_ascii_whitespace) => Vec::new(),
            Ok(content) => serde_json::from_slice(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        info!(path = %path.display(), scans = scans.len(), "Opened scan store");
        Ok(Self {
            path,
            scans: Mutex::new(scans),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, scans: &[Scan]) -> Result<(), RepositoryError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_vec_pretty(scans)?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(path = %self.path.display(), scans = scans.len(), "Scan store written");
        Ok(())
    }
}

#[async_trait]
impl ScanRepository for JsonFileScanRepository {
    async fn save(&self, scans: &[Scan]) -> Result<(), RepositoryError> {
        if scans.is_empty() {
            return Ok(());
        }
        let mut stored = self.scans.lock().await;
        let mut updated = stored.clone();
        updated.extend_from_slice(scans);
        self.persist(&updated).await?;
        *stored = updated;
        Ok(())
    }

    async fn find_latest_by_url(&self, url: &Url) -> Result<Option<Scan>, RepositoryError> {
        let scans = self.scans.lock().await;
        Ok(latest_per_url(scans.iter().filter(|scan| &scan.base_url == url))
            .into_iter()
            .next())
    }

    async fn find_latest(&self) -> Result<Vec<Scan>, RepositoryError> {
        Ok(latest_per_url(self.scans.lock().await.iter()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use henyey_history_scanner::ScanError;

    fn scan(url: &str, hours: i64, latest: u32) -> Scan {
        let init = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let end = init + Duration::hours(hours);
        Scan {
            scan_chain_init_date: init,
            start_date: end,
            end_date: end,
            base_url: Url::new(url).unwrap(),
            from_ledger: 0,
            to_ledger: 1_000,
            latest_scanned_ledger: latest,
            latest_scanned_ledger_header_hash: None,
            concurrency: 25,
            is_slow_archive: false,
            error: None,
        }
    }

    #[tokio::test]
    async fn test_missing_file_is_an_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let repo = JsonFileScanRepository::open(dir.path().join("scans.json"))
            .await
            .unwrap();
        assert!(repo.find_latest().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_scans_survive_reopening() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("scans.json");

        let mut failed = scan("https://b.example", 2, 127);
        failed.error = Some(
            ScanError::verification("https://b.example/ledger/00/00/00/ledger-000000bf.xdr.gz", "hash mismatch")
                .with_checkpoint(191),
        );
        {
            let repo = JsonFileScanRepository::open(&path).await.unwrap();
            repo.save(&[scan("https://a.example", 1, 63), failed.clone()])
                .await
                .unwrap();
            repo.save(&[scan("https://a.example", 3, 255)]).await.unwrap();
        }

        let repo = JsonFileScanRepository::open(&path).await.unwrap();
        let latest = repo.find_latest().await.unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].latest_scanned_ledger, 255);
        assert_eq!(latest[1], failed);

        let b = Url::new("https://b.example").unwrap();
        let found = repo.find_latest_by_url(&b).await.unwrap().unwrap();
        assert_eq!(found.error.unwrap().checkpoint, Some(191));
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_corrupt_store_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scans.json");
        std::fs::write(&path, b"{ not json").unwrap();
        let err = JsonFileScanRepository::open(&path).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Serialization(_)));
    }
}
