//! Common value types for the henyey history archive scanner.
//!
//! This crate holds the small, dependency-light types shared by the scanner
//! library and its application shell:
//!
//! - [`Hash256`]: a SHA-256 digest with hex conversion and XDR hashing helpers
//! - [`Sha256Hasher`]: an incremental hasher usable as an [`std::io::Write`] sink
//! - [`Url`]: a validated, absolute archive URL without a trailing slash

pub mod types;
pub mod url;

pub use types::{Hash256, Sha256Hasher};
pub use url::{Url, UrlError};

/// Re-export stellar-xdr for convenience
pub use stellar_xdr;
