// Blob storage: full payloads keyed by absolute resource URL.

pub mod disk;
pub mod memory;
pub mod traits;
