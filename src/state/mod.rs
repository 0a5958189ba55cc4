//! The in-memory layers that sit between the public map surface and the
//! chunked b-tree: the optimistic [`pending`] layer for locally issued,
//! not-yet-acknowledged mutations, and the [`sequenced`] layer caching
//! acknowledged reads and unflushed acknowledged mutations.

pub mod pending;
pub mod sequenced;

/// A sequence number assigned by the ordering service
pub type SequenceNumber = i64;

/// The synthetic sequence number used for mutations applied while the map
/// is detached from an ordering service
pub const UNSEQUENCED: SequenceNumber = -1;

/// The outcome of probing one in-memory layer for a key.
///
/// A layer either holds a live value, knows the key is gone (deleted or
/// dominated by a clear), or holds no information at all. Only a `Miss`
/// falls through to the next layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<V> {
	/// The layer holds a live value for the key
	Found(V),
	/// The layer knows the key was deleted or cleared
	Tombstone,
	/// The layer holds no information about the key
	Miss,
}
