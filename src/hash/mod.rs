//! Hash computation and integrity verification module
//!
//! Provides MD5, SHA-1 and SHA-256 digests with multi-algorithm
//! streaming support for single-pass copy-and-hash operations.

mod digest;

pub use digest::*;
