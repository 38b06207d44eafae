//! Core domain types shared across the Cairn crates.
//!
//! This crate defines the canonical data model used by the volume and
//! dispatch layers:
//! - Block hashes and locators
//! - Service and per-volume configuration
//! - Shared constants

pub mod config;
pub mod error;
pub mod locator;

pub use config::{Config, DispatchConfig, VolumeConfig};
pub use error::{Error, Result};
pub use locator::{BlockHash, Locator};

/// Maximum block size: 64 MiB.
pub const BLOCK_SIZE: u64 = 64 * 1024 * 1024;

/// Hex MD5 of the empty block.
pub const EMPTY_BLOCK_HASH: &str = "d41d8cd98f00b204e9800998ecf8427e";
