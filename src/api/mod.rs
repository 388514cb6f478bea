// App-facing API surface (bridged to the Flutter shell).

pub mod offline_api;
pub mod simple;
