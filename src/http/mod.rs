//! Outbound HTTP: the canonical-string-signed client and its three
//! per-purpose facades.

pub mod facades;
pub mod signed;

pub use facades::{CvmClient, ResultSubmission, ResultsClient, ValueReport, ValuesClient};
pub use signed::SignedHttpClient;
