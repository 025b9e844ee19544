//! `coverlink-linkage`: census / coverage-survey person record linkage.
//!
//! Pure engine crate: receives pre-loaded, standardized records and returns
//! linked clusters, clerical-review clusters and residuals. No CLI
//! dependencies.

pub mod blocking;
pub mod cluster;
pub mod config;
pub mod crow;
pub mod engine;
pub mod error;
pub mod evidence;
pub mod model;
pub mod review;
pub mod scoring;
pub mod table;

pub use config::LinkConfig;
pub use engine::{load_csv_records, parse_manifest_ids, run, run_with_review};
pub use error::LinkError;
pub use model::{LinkInput, LinkResult, Record, Source};
pub use review::{load_review_decisions, ReviewDecision};
