use crate::blob::{Handle, Val};
use crate::err::Error;
use crate::tree::Key;
use serde::{Deserialize, Serialize};

/// The identifier under which the host stores a map's summary blob
pub const HIVE_BLOB_NAME: &str = "hive";

/// The single named blob from which a client hydrates a map: the tree
/// order, the root, and the garbage collection frontier.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MapSummary {
	pub order: u32,
	pub root: SummaryRoot,
	pub handles: Vec<Handle>,
}

/// A summarized root: a handle to a persisted chunk, or, for empty and
/// tiny maps summarized at attach time, a single inline leaf with
/// pre-encoded values.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum SummaryRoot {
	Handle(Handle),
	Inline {
		keys: Vec<Key>,
		values: Vec<Val>,
	},
}

impl MapSummary {
	pub fn encode(&self) -> Result<Val, Error> {
		Ok(bincode::serialize(self)?)
	}

	pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
		bincode::deserialize(bytes).map_err(|_| Error::CorruptNode {
			handle: HIVE_BLOB_NAME.to_string(),
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_summary_roundtrip() {
		let summary = MapSummary {
			order: 32,
			root: SummaryRoot::Inline {
				keys: vec!["a".to_string()],
				values: vec![vec![1, 2, 3]],
			},
			handles: Vec::new(),
		};
		let decoded = MapSummary::decode(&summary.encode().unwrap()).unwrap();
		assert_eq!(summary, decoded);
	}

	#[test]
	fn test_corrupt_summary_is_rejected() {
		assert!(matches!(
			MapSummary::decode(b"\xffgarbage"),
			Err(Error::CorruptNode {
				..
			})
		));
	}
}
