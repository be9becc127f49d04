pub mod cache;
pub mod metadata;
pub mod parquet;

pub use cache::{BarCache, CacheLayer};
pub use metadata::MetadataStore;
pub use parquet::{ParquetStore, StorageStats};
