//! Keel Core
//!
//! Shared utilities for the Keel resource streaming engine: fast hash collections,
//! stable string hashing, logging setup and profiling scopes.

pub mod alloc;
pub mod hash;
pub mod logging;
pub mod profiling;
