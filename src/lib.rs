//! Pull-through cache for bug and test trackers.
//!
//! Items are read from a local cache while fresh and fetched from their
//! tracker otherwise. Comments on test failures can be mined for bug tags
//! (`test01: bsc#1234`) which are kept in a cached tag index.

pub mod bugrefs;
pub mod cache;
pub mod config;
pub mod error;
pub mod repository;
pub mod tracker;

pub use error::{Error, Result};
