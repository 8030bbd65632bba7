#[macro_use]
pub mod metrics;

pub mod caching;
pub mod client;
pub mod config;
pub mod logging;
pub mod transport;
pub mod types;
pub mod utils;

#[cfg(test)]
mod test;

pub use client::FetchCache;
