use crate::blob::Val;
use crate::err::Error;
use crate::state::SequenceNumber;
use crate::tree::{Key, TreeUpdate};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// One operation in the totally ordered stream shared by every client of a
/// map. Values travel pre-encoded; only the applying client decodes them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum Op {
	Set {
		key: Key,
		value: Val,
	},
	Delete {
		key: Key,
	},
	Clear,
	Flush {
		update: TreeUpdate,
		ref_sequence_number: SequenceNumber,
	},
}

impl Op {
	pub fn encode(&self) -> Result<Val, Error> {
		Ok(bincode::serialize(self)?)
	}

	/// Decodes an op off the wire. Anything that does not parse is a
	/// protocol violation, not a storage failure.
	pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
		bincode::deserialize(bytes).map_err(|_| Error::UnknownOp)
	}
}

impl Display for Op {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		match self {
			Op::Set {
				key,
				..
			} => write!(f, "SET {key}"),
			Op::Delete {
				key,
			} => write!(f, "DELETE {key}"),
			Op::Clear => write!(f, "CLEAR"),
			Op::Flush {
				ref_sequence_number,
				..
			} => write!(f, "FLUSH <= {ref_sequence_number}"),
		}
	}
}

/// An op as delivered by the ordering service: the op itself, the sequence
/// number the service assigned, and whether this client submitted it.
#[derive(Clone, Debug)]
pub struct SequencedOp {
	pub sequence_number: SequenceNumber,
	pub op: Op,
	pub local: bool,
}

/// Encodes a user value for an op or an inline summary leaf
pub(crate) fn encode_value<V>(value: &V) -> Result<Val, Error>
where
	V: Serialize,
{
	Ok(bincode::serialize(value)?)
}

/// Decodes a user value received in an op or an inline summary leaf
pub(crate) fn decode_value<V>(bytes: &[u8]) -> Result<V, Error>
where
	V: DeserializeOwned,
{
	Ok(bincode::deserialize(bytes)?)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_op_wire_roundtrip() {
		let op = Op::Set {
			key: "k".to_string(),
			value: encode_value(&42).unwrap(),
		};
		let decoded = Op::decode(&op.encode().unwrap()).unwrap();
		assert_eq!(op, decoded);
	}

	#[test]
	fn test_garbage_is_an_unknown_op() {
		assert!(matches!(Op::decode(b"\xff\xff\xff\xff garbage"), Err(Error::UnknownOp)));
	}
}
