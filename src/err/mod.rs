use thiserror::Error;

/// The errors surfaced by the partial map core.
///
/// Local reads and writes never fail because of remote state; every variant
/// here is either a boundary validation failure, a blob service failure, or
/// a protocol violation in the sequenced op stream.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
	/// A key was rejected at the public boundary
	#[error("Invalid key: keys must be non-empty strings")]
	InvalidKey,

	/// The tree was constructed with an unusable order
	#[error("Invalid b-tree order {0}: the order must be at least 2")]
	InvalidOrder(u32),

	/// The blob service failed to upload or resolve a chunk
	#[error("The blob store is unavailable: {message}")]
	StorageUnavailable {
		message: String,
	},

	/// A chunk resolved to bytes that do not parse as a b-tree node
	#[error("The chunk `{handle}` is corrupt and cannot be decoded")]
	CorruptNode {
		handle: String,
	},

	/// The sequenced stream carried an op this client cannot decode
	#[error("Unknown operation received in the sequenced op stream")]
	UnknownOp,

	/// A value or state payload failed to (de)serialize
	#[error("Serialization error: {0}")]
	Bincode(#[from] bincode::Error),

	/// An internal invariant was broken
	#[error("Unreachable code reached: {0}")]
	Unreachable(&'static str),
}
