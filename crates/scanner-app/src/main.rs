//! history-scanner: verify Stellar history archives.
//!
//! # Usage
//!
//! ```text
//! history-scanner --config scanner.toml scan
//! history-scanner --config scanner.toml scan --loop 3600
//! history-scanner scan-archive https://history.stellar.org/prd/core-live/core_live_001 --to 1000000
//! history-scanner latest
//! history-scanner sample-config > scanner.toml
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use henyey_common::Url;
use henyey_history_scanner::{Scan, ScanJob, ScanRepository};
use henyey_scanner_app::{
    build_coordinator, JsonFileScanRepository, LogConfig, LogFormat, ScannerConfig,
};

/// Scan and verify Stellar history archives
#[derive(Parser)]
#[command(name = "history-scanner")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging (debug level)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log output format (defaults to the configured format)
    #[arg(long, global = true)]
    log_format: Option<CliLogFormat>,

    #[command(subcommand)]
    command: Commands,
}

/// Log output format for CLI
#[derive(Clone, Copy, Debug, Default, clap::ValueEnum)]
enum CliLogFormat {
    #[default]
    Text,
    Json,
}

impl From<CliLogFormat> for LogFormat {
    fn from(fmt: CliLogFormat) -> Self {
        match fmt {
            CliLogFormat::Text => LogFormat::Text,
            CliLogFormat::Json => LogFormat::Json,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Scan every configured archive once, continuing previous chains
    Scan {
        /// Keep scanning, pausing this many seconds between rounds
        #[arg(long = "loop", value_name = "SECONDS")]
        interval: Option<u64>,
    },

    /// Scan a single archive and store the result
    ScanArchive {
        /// Base URL of the history archive
        url: String,

        /// First ledger to verify; starts a new chain
        #[arg(long)]
        from: Option<u32>,

        /// Last ledger to verify (defaults to the archive's latest ledger)
        #[arg(long)]
        to: Option<u32>,

        /// Parallel requests (defaults to a benchmark of the archive)
        #[arg(long)]
        concurrency: Option<usize>,

        /// Ignore the stored chain of this archive and start a new one
        #[arg(long)]
        restart: bool,
    },

    /// Print the latest stored scan of every archive, or of one
    Latest {
        /// Only this archive
        url: Option<String>,
    },

    /// Print a sample configuration file
    SampleConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::SampleConfig = cli.command {
        return cmd_sample_config();
    }

    let config = load_config(&cli)?;
    init_logging(&cli, &config)?;
    config.validate().context("invalid configuration")?;

    match cli.command {
        Commands::Scan { interval } => cmd_scan(config, interval.map(Duration::from_secs)).await,
        Commands::ScanArchive {
            url,
            from,
            to,
            concurrency,
            restart,
        } => cmd_scan_archive(config, &url, from, to, concurrency, restart).await,
        Commands::Latest { url } => cmd_latest(config, url.as_deref()).await,
        Commands::SampleConfig => cmd_sample_config(),
    }
}

/// Initialize logging. Command line flags win over the configuration.
fn init_logging(cli: &Cli, config: &ScannerConfig) -> anyhow::Result<()> {
    let level = if cli.verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    let format = match cli.log_format {
        Some(format) => format.into(),
        None => config.logging.format.parse::<LogFormat>()?,
    };

    let log_config = match format {
        LogFormat::Text => LogConfig::default(),
        LogFormat::Json => LogConfig::json(),
    }
    .with_level(level);
    henyey_scanner_app::logging::init(&log_config)?;

    tracing::debug!("Logging initialized");
    Ok(())
}

/// Load configuration from file or use defaults.
fn load_config(cli: &Cli) -> anyhow::Result<ScannerConfig> {
    match cli.config {
        Some(ref path) => ScannerConfig::from_file_with_env(path)
            .with_context(|| format!("failed to load configuration from {}", path.display())),
        None => {
            let mut config = ScannerConfig::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }
}

/// Scan command handler.
async fn cmd_scan(config: ScannerConfig, interval: Option<Duration>) -> anyhow::Result<()> {
    let coordinator = build_coordinator(&config).await?;

    loop {
        let scans = coordinator.perform_scans().await?;
        for scan in &scans {
            log_scan(scan);
        }

        let Some(interval) = interval else {
            return Ok(());
        };
        tracing::info!(seconds = interval.as_secs(), "Waiting for next scan round");
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, stopping");
                return Ok(());
            }
        }
    }
}

/// Scan-archive command handler.
async fn cmd_scan_archive(
    config: ScannerConfig,
    url: &str,
    from: Option<u32>,
    to: Option<u32>,
    concurrency: Option<usize>,
    restart: bool,
) -> anyhow::Result<()> {
    let url = Url::new(url).with_context(|| format!("invalid archive URL {url:?}"))?;
    let coordinator = build_coordinator(&config).await?;

    let previous = if restart || from.is_some() {
        None
    } else {
        coordinator.repository().find_latest_by_url(&url).await?
    };
    let job = match previous {
        Some(ref scan) => {
            tracing::info!(
                latest_scanned_ledger = scan.latest_scanned_ledger,
                "Continuing stored scan chain"
            );
            ScanJob::continue_scan_chain(scan)
        }
        None => ScanJob::new_scan_chain(url),
    }
    .with_from_ledger(from)
    .with_to_ledger(to)
    .with_concurrency(concurrency);

    let scan = coordinator.perform_scan(job).await?;
    println!("{}", serde_json::to_string_pretty(&scan)?);
    if let Some(error) = scan.error {
        anyhow::bail!("scan stopped at ledger {}: {error}", scan.latest_scanned_ledger);
    }
    Ok(())
}

/// Latest command handler.
async fn cmd_latest(config: ScannerConfig, url: Option<&str>) -> anyhow::Result<()> {
    let repository = JsonFileScanRepository::open(&config.storage.path).await?;
    let scans = match url {
        Some(url) => {
            let url = Url::new(url).with_context(|| format!("invalid archive URL {url:?}"))?;
            repository.find_latest_by_url(&url).await?.into_iter().collect()
        }
        None => repository.find_latest().await?,
    };
    println!("{}", serde_json::to_string_pretty(&scans)?);
    Ok(())
}

fn cmd_sample_config() -> anyhow::Result<()> {
    let sample = ScannerConfig::sample_config();
    println!("{}", sample);
    Ok(())
}

fn log_scan(scan: &Scan) {
    match &scan.error {
        None => tracing::info!(
            url = %scan.base_url,
            latest_scanned_ledger = scan.latest_scanned_ledger,
            to_ledger = scan.to_ledger,
            "Archive verified"
        ),
        Some(error) => tracing::warn!(
            url = %scan.base_url,
            latest_scanned_ledger = scan.latest_scanned_ledger,
            checkpoint = ?error.checkpoint,
            error = %error,
            "Archive has errors"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_scan_archive() {
        let cli = Cli::try_parse_from([
            "history-scanner",
            "--log-format",
            "json",
            "scan-archive",
            "https://history.example.org/a",
            "--from",
            "64",
            "--concurrency",
            "8",
        ])
        .unwrap();
        assert!(matches!(cli.log_format, Some(CliLogFormat::Json)));
        match cli.command {
            Commands::ScanArchive {
                url,
                from,
                to,
                concurrency,
                restart,
            } => {
                assert_eq!(url, "https://history.example.org/a");
                assert_eq!(from, Some(64));
                assert_eq!(to, None);
                assert_eq!(concurrency, Some(8));
                assert!(!restart);
            }
            _ => panic!("expected scan-archive"),
        }
    }

    #[test]
    fn test_parse_scan_loop() {
        let cli = Cli::try_parse_from(["history-scanner", "scan", "--loop", "600", "-v"]).unwrap();
        assert!(cli.verbose);
        assert!(matches!(cli.command, Commands::Scan { interval: Some(600) }));
    }
}
