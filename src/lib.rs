//! Instance-deduplication cache for scene composition.
//!
//! A composed scene is a tree of prim indexes identified by absolute
//! hierarchical paths. Indexes declared *instanceable* that compose
//! identically share one canonical subtree, a *master* (`/__Master_<n>`),
//! instead of being composed once per occurrence. This crate provides the
//! cache that makes that sharing work:
//!
//! - Assigns each instanceable prim index to a master, creating one the
//!   first time an instancing fingerprint ([`InstanceKey`]) is seen.
//! - Batches registration/unregistration churn and reconciles it in a
//!   single [`InstanceCache::process_changes`] pass that reports new,
//!   retargeted, and released masters in an [`InstanceChanges`] record.
//! - Answers the path queries needed to navigate between instances and
//!   masters, including nested instancing (masters whose own prims are
//!   instances of deeper masters).
//!
//! Flow: composition threads register instanceable indexes concurrently
//! (cheap, staged behind a short-held lock); the host then quiesces
//! composition, flushes with `process_changes`, and reads the maps through
//! the query methods.
//!
//! The composition engine itself lives in the host. Its contract with this
//! crate is the [`PrimIndex`] trait: a path, an instanceable flag, and the
//! composition inputs hashed into the instancing key.
//!
//! Set `INSTANCE_CACHE_DETERMINISTIC_MASTERS=1` to make master assignment
//! repeatable across runs at some extra cost per batch.

pub mod cache;
pub mod changes;
mod config;
pub mod key;
pub mod path;
mod verify;

pub use cache::{InstanceCache, MASTER_PATH_PREFIX};
pub use changes::InstanceChanges;
pub use key::{InstanceKey, PrimIndex};
pub use path::{ScenePath, ScenePathError};
