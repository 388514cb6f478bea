// Data source abstraction: origin access for region downloads and forwarded misses.

pub mod http_source;
pub mod traits;
