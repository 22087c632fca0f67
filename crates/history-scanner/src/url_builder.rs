//! Archive file locations.
//!
//! Checkpoint files are sharded by the first three bytes of the checkpoint
//! number in 8-digit hex, buckets by the first three bytes of their hash:
//!
//! ```text
//! {category}/{xx}/{yy}/{zz}/{category}-{xxyyzzww}.{ext}
//! bucket/{aa}/{bb}/{cc}/bucket-{hash}.xdr.gz
//! ```

use std::fmt;

use henyey_common::{Hash256, Url};

/// Path of the archive's latest state file, relative to the archive root.
pub const ROOT_HAS_PATH: &str = ".well-known/stellar-history.json";

/// Per-checkpoint file categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Category {
    /// The checkpoint's History Archive State (JSON).
    History,
    /// Ledger header history entries.
    Ledger,
    /// Transaction sets.
    Transactions,
    /// Transaction result sets.
    Results,
}

impl Category {
    /// Categories whose files are gzipped XDR record streams.
    pub const XDR: [Category; 3] = [Category::Ledger, Category::Transactions, Category::Results];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::History => "history",
            Category::Ledger => "ledger",
            Category::Transactions => "transactions",
            Category::Results => "results",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Category::History => "json",
            _ => "xdr.gz",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builds file URLs below an archive root.
pub struct UrlBuilder;

impl UrlBuilder {
    /// Relative path of a checkpoint file.
    ///
    /// ```
    /// use henyey_history_scanner::{Category, UrlBuilder};
    ///
    /// assert_eq!(
    ///     UrlBuilder::checkpoint_path(Category::Ledger, 63),
    ///     "ledger/00/00/00/ledger-0000003f.xdr.gz"
    /// );
    /// assert_eq!(
    ///     UrlBuilder::checkpoint_path(Category::History, 0x01ab_cd3f),
    ///     "history/01/ab/cd/history-01abcd3f.json"
    /// );
    /// ```
    pub fn checkpoint_path(category: Category, checkpoint: u32) -> String {
        let hex = format!("{:08x}", checkpoint);
        format!(
            "{cat}/{}/{}/{}/{cat}-{hex}.{ext}",
            &hex[0..2],
            &hex[2..4],
            &hex[4..6],
            cat = category.as_str(),
            hex = hex,
            ext = category.extension(),
        )
    }

    pub fn bucket_path(hash: &Hash256) -> String {
        let hex = hash.to_hex();
        format!(
            "bucket/{}/{}/{}/bucket-{}.xdr.gz",
            &hex[0..2],
            &hex[2..4],
            &hex[4..6],
            hex
        )
    }

    pub fn checkpoint_url(base: &Url, category: Category, checkpoint: u32) -> Url {
        base.join(&Self::checkpoint_path(category, checkpoint))
    }

    pub fn has_url(base: &Url, checkpoint: u32) -> Url {
        Self::checkpoint_url(base, Category::History, checkpoint)
    }

    pub fn bucket_url(base: &Url, hash: &Hash256) -> Url {
        base.join(&Self::bucket_path(hash))
    }

    pub fn root_has_url(base: &Url) -> Url {
        base.join(ROOT_HAS_PATH)
    }
}
