pub mod partition;
pub mod raw;

// Re-export the storage surface (e.g. `use crate::archive::PartitionStore`).
pub use partition::{FsPartitionStore, PartitionStore};
pub use raw::{FsRawArchive, RawArchive};
