//! Capacity stats collection for federated storage shares.
//!
//! Reads UGR-style configuration files declaring storage shares, runs
//! the matching protocol collector (DAV, S3, Azure) against each one
//! concurrently, and publishes the resulting stats to memcached, to
//! stdout, or as a StAR accounting document.

pub mod collectors;
pub mod config;
pub mod dispatch;
pub mod errors;
pub mod memcache;
pub mod output;
pub mod share;
pub mod validate;
pub mod xml;
