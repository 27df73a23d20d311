pub mod config;
pub mod error;
pub mod stable_key;
pub mod types;

pub use config::Config;
pub use error::{CivicScanError, CivicScanResult};
pub use stable_key::{canonical_url, stable_key, KeyFields};
pub use types::*;
