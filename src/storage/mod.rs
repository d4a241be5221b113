//! Capability interfaces for the two external services, plus their backends.
//!
//! The engine never holds ambient client handles: both capabilities are
//! dependency-injected as `Arc<dyn Trait>`, constructed lazily by the
//! session only when a stage actually needs them.

pub mod clickhouse;
pub mod memory;
pub mod s3;
pub mod traits;

pub use clickhouse::ClickHouseBackend;
pub use memory::{MemoryIndex, MemoryObjectStore};
pub use s3::S3Backend;
pub use traits::{CandidateBlocks, DeleteFailure, Listing, ObjectStore, OrphanTotals, ReferenceIndex};
