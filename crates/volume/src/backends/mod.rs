//! Per-provider bucket adapters.

pub mod azure;
pub mod s3;
