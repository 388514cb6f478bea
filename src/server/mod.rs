// Local HTTP proxy: the map renderer fetches tile archives through here.

pub mod handler;
