// Engine: interception, range virtualization, region transfers and metadata consistency.

pub mod availability;
pub mod interceptor;
pub mod metadata;
pub mod notify;
pub mod offline;
pub mod range;
pub mod stats;
pub mod status;
pub mod transfer;
pub mod worker;
