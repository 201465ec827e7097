//! Instancing equivalence keys.
//!
//! Two prim indexes may share one composed master iff they would compose to
//! identical content. The host's composition engine knows which inputs
//! determine that, so the cache only asks it to feed those inputs into a
//! hasher; the resulting digest is the instancing key. Keys are compared by
//! digest equality, so the host must hash every input that can change
//! composed results.

use std::fmt;

use crate::path::ScenePath;

/// Domain separation tag mixed into every instancing key. Changing it
/// invalidates any equivalence assumptions made against older digests.
const KEY_DOMAIN_TAG: &[u8] = b"instance-cache-key-v1:blake3";

/// A composed prim index, as seen by the cache.
///
/// The cache never retains an implementation of this trait; it only keeps
/// the index's path and instancing key.
pub trait PrimIndex {
    /// Absolute path this index was composed at.
    fn path(&self) -> &ScenePath;

    /// Whether the host declared this index shareable via instancing.
    fn is_instanceable(&self) -> bool;

    /// Feeds every composition input that determines instancing equivalence
    /// into `hasher`. Indexes that feed identical bytes are assigned to the
    /// same master.
    fn hash_instancing_structure(&self, hasher: &mut blake3::Hasher);
}

/// Opaque identifier for an instancing equivalence class.
///
/// A 32-byte domain-tagged BLAKE3 digest of the index's instancing
/// structure. The digest is stable across runs for identical inputs.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceKey([u8; 32]);

impl InstanceKey {
    /// Computes the key for a prim index.
    ///
    /// Registration calls this before taking any lock; hashing the
    /// composition structure is the expensive part of registering.
    pub fn of(index: &impl PrimIndex) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(KEY_DOMAIN_TAG);
        index.hash_instancing_structure(&mut hasher);
        InstanceKey(*hasher.finalize().as_bytes())
    }
}

impl fmt::Debug for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InstanceKey(")?;
        for byte in &self.0[..6] {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "..)")
    }
}
