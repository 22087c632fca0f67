//! Policies turning archives and their scan history into jobs.

use std::collections::HashMap;

use henyey_common::Url;
use tracing::{debug, info};

use crate::repository::latest_per_url;
use crate::scan::{Scan, ScanJob};

pub trait ScanScheduler: Send + Sync {
    /// One job per archive in `archives`, in the same order.
    fn schedule(&self, archives: &[Url], previous_scans: &[Scan]) -> Vec<ScanJob>;
}

fn latest_by_url(previous_scans: &[Scan]) -> HashMap<Url, Scan> {
    latest_per_url(previous_scans)
        .into_iter()
        .map(|scan| (scan.base_url.clone(), scan))
        .collect()
}

/// Continue every known chain; start chains for unknown archives.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContinueAllScans;

impl ScanScheduler for ContinueAllScans {
    fn schedule(&self, archives: &[Url], previous_scans: &[Scan]) -> Vec<ScanJob> {
        let latest = latest_by_url(previous_scans);
        archives
            .iter()
            .map(|url| match latest.get(url) {
                Some(previous) => ScanJob::continue_scan_chain(previous),
                None => ScanJob::new_scan_chain(url.clone()),
            })
            .collect()
    }
}

/// Like [`ContinueAllScans`], but guarantees at least one new chain per
/// round: when every archive already has a chain, the oldest chain is
/// restarted from scratch.
#[derive(Debug, Clone, Copy, Default)]
pub struct RestartAtLeastOneScan;

impl ScanScheduler for RestartAtLeastOneScan {
    fn schedule(&self, archives: &[Url], previous_scans: &[Scan]) -> Vec<ScanJob> {
        let mut jobs = ContinueAllScans.schedule(archives, previous_scans);
        if jobs.iter().any(ScanJob::is_new_scan_chain) {
            return jobs;
        }

        let oldest = jobs
            .iter()
            .enumerate()
            .filter_map(|(index, job)| job.chain_init_date.map(|date| (index, date)))
            .min_by_key(|&(_, date)| date)
            .map(|(index, _)| index);
        if let Some(index) = oldest {
            info!(url = %jobs[index].url, "Restarting oldest scan chain");
            jobs[index] = ScanJob::new_scan_chain(jobs[index].url.clone());
        }
        debug!(jobs = jobs.len(), "Scan jobs scheduled");
        jobs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn scan(url: &str, init_day: u32, latest: u32) -> Scan {
        let init = Utc.with_ymd_and_hms(2024, 1, init_day, 0, 0, 0).unwrap();
        Scan {
            scan_chain_init_date: init,
            start_date: init,
            end_date: init,
            base_url: Url::new(url).unwrap(),
            from_ledger: 0,
            to_ledger: latest,
            latest_scanned_ledger: latest,
            latest_scanned_ledger_header_hash: None,
            concurrency: 10,
            is_slow_archive: false,
            error: None,
        }
    }

    fn urls(raw: &[&str]) -> Vec<Url> {
        raw.iter().map(|u| Url::new(u).unwrap()).collect()
    }

    #[test]
    fn test_continue_all_scans() {
        let archives = urls(&["https://a.example", "https://b.example"]);
        let previous = [scan("https://a.example", 3, 127)];
        let jobs = ContinueAllScans.schedule(&archives, &previous);
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].from_ledger, Some(128));
        assert!(jobs[1].is_new_scan_chain());
    }

    #[test]
    fn test_restart_keeps_chains_when_a_new_one_starts() {
        let archives = urls(&["https://a.example", "https://b.example"]);
        let previous = [scan("https://a.example", 3, 127)];
        let jobs = RestartAtLeastOneScan.schedule(&archives, &previous);
        assert!(!jobs[0].is_new_scan_chain());
        assert!(jobs[1].is_new_scan_chain());
    }

    #[test]
    fn test_restart_oldest_chain() {
        let archives = urls(&["https://a.example", "https://b.example", "https://c.example"]);
        let previous = [
            scan("https://a.example", 5, 127),
            scan("https://b.example", 2, 191),
            scan("https://c.example", 9, 255),
        ];
        let jobs = RestartAtLeastOneScan.schedule(&archives, &previous);
        let restarted: Vec<_> = jobs.iter().filter(|j| j.is_new_scan_chain()).collect();
        assert_eq!(restarted.len(), 1);
        assert_eq!(restarted[0].url.as_str(), "https://b.example");
        assert_eq!(jobs[0].from_ledger, Some(128));
        assert_eq!(jobs[2].from_ledger, Some(256));
    }

    #[test]
    fn test_empty_archive_list() {
        assert!(RestartAtLeastOneScan.schedule(&[], &[]).is_empty());
    }
}
