//! Cryptographic utilities
//!
//! This module provides:
//! - The 32-byte `Hash` identifier used for blocks and transactions
//! - SHA-256 hashing

pub mod hash;

pub use hash::{sha256, sha256_hex, Hash, HashParseError, HASH_SIZE};
