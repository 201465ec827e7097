//! Property-based tests for the instancing cache.
//!
//! Run with: `cargo test --test property`

mod instancing;
