//! The public surface of the collaborative partial map: reads layered over
//! the pending and sequenced caches and the chunked tree, op submission and
//! application, leader-driven compaction, and summary production.

pub mod leader;
pub mod op;
pub mod summary;

use crate::blob::{BlobStore, Handle};
use crate::cnf;
use crate::err::Error;
use crate::map::leader::{LeaderTracker, LeaderTransition};
use crate::map::op::{decode_value, encode_value, Op, SequencedOp};
use crate::map::summary::{MapSummary, SummaryRoot};
use crate::state::pending::PendingState;
use crate::state::sequenced::SequencedState;
use crate::state::{Lookup, SequenceNumber, UNSEQUENCED};
use crate::tree::{ChunkedBTree, Key};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{HashMap, HashSet};

/// The contract of the enclosing host runtime: it owns connectivity and
/// forwards locally issued ops to the ordering service.
pub trait Host: Send + Sync {
	/// Submits a locally issued op to the ordering service
	fn submit_local_op(&self, op: Op);
	/// Whether this map is attached to an ordering service
	fn is_attached(&self) -> bool;
	/// The sequence number of the last op this client has processed
	fn last_sequence_number(&self) -> SequenceNumber;
}

/// Notifications emitted to the host as the map changes
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum MapEvent {
	ValueChanged {
		key: Key,
		local: bool,
	},
	Clear {
		local: bool,
	},
	StartFlush,
	Flush {
		is_leader: bool,
	},
}

/// Tunables of a map instance; the defaults come from [`crate::cnf`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MapConfig {
	/// Upper bound (exclusive) on the entries of any tree node
	pub order: u32,
	/// Soft bound on the resident key count
	pub cache_size_hint: usize,
	/// Unflushed changes the leader accumulates before compacting
	pub flush_threshold: usize,
}

impl Default for MapConfig {
	fn default() -> Self {
		Self {
			order: *cnf::BTREE_ORDER,
			cache_size_hint: *cnf::CACHE_SIZE_HINT,
			flush_threshold: *cnf::FLUSH_THRESHOLD,
		}
	}
}

/// Where an outstanding flush currently stands
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushState {
	/// No flush is in flight
	Idle,
	/// Chunk uploads are in progress
	Uploading,
	/// The flush op has been submitted but not yet locally sequenced
	AwaitingAck,
}

/// A distributed key/value container whose working set stays small in
/// memory while the authoritative dataset lives as a chunked b-tree in an
/// external blob store.
pub struct PartialMap<V, H>
where
	H: Host,
{
	config: MapConfig,
	host: H,
	tree: ChunkedBTree<V>,
	pending: PendingState<V>,
	sequenced: SequencedState<V>,
	leader: LeaderTracker,
	flush_state: FlushState,
	last_flush_ref_seq: SequenceNumber,
	events: Option<channel::Sender<MapEvent>>,
}

impl<V, H> PartialMap<V, H>
where
	V: Clone + Serialize + DeserializeOwned + Send + Sync,
	H: Host,
{
	pub fn new(config: MapConfig, host: H) -> Result<Self, Error> {
		Ok(Self {
			tree: ChunkedBTree::new(config.order)?,
			config,
			host,
			pending: PendingState::new(),
			sequenced: SequencedState::new(),
			leader: LeaderTracker::new(None),
			flush_state: FlushState::Idle,
			last_flush_ref_seq: UNSEQUENCED,
			events: None,
		})
	}

	/// Opens a channel carrying [`MapEvent`] notifications, replacing any
	/// previously opened one
	pub fn events(&mut self) -> channel::Receiver<MapEvent> {
		let (sender, receiver) = channel::unbounded();
		self.events = Some(sender);
		receiver
	}

	/// Reads a key through the pending layer, the sequenced layer, and
	/// finally the chunked tree. A tree hit is cached for later reads.
	pub async fn get<S>(&mut self, blobs: &S, key: &str) -> Result<Option<V>, Error>
	where
		S: BlobStore,
	{
		match self.pending.get(key) {
			Lookup::Found(v) => return Ok(Some(v)),
			Lookup::Tombstone => return Ok(None),
			Lookup::Miss => (),
		}
		match self.sequenced.get(key) {
			Lookup::Found(v) => return Ok(Some(v)),
			Lookup::Tombstone => return Ok(None),
			Lookup::Miss => (),
		}
		let value = self.tree.get(blobs, key).await?;
		if let Some(v) = &value {
			self.sequenced.cache(key.to_string(), v.clone());
			self.evict_working_set();
		}
		Ok(value)
	}

	/// Whether the key is present, consulting the same three layers as
	/// [`Self::get`]
	pub async fn has<S>(&mut self, blobs: &S, key: &str) -> Result<bool, Error>
	where
		S: BlobStore,
	{
		match self.pending.get(key) {
			Lookup::Found(_) => return Ok(true),
			Lookup::Tombstone => return Ok(false),
			Lookup::Miss => (),
		}
		match self.sequenced.get(key) {
			Lookup::Found(_) => return Ok(true),
			Lookup::Tombstone => return Ok(false),
			Lookup::Miss => (),
		}
		self.tree.has(blobs, key).await
	}

	/// Records a mapping. When attached the mutation is optimistic: it is
	/// visible to local reads immediately and submitted to the ordering
	/// service for everyone else.
	pub fn set(&mut self, key: Key, value: V) -> Result<(), Error> {
		check_key(&key)?;
		if self.host.is_attached() {
			let encoded = encode_value(&value)?;
			self.pending.set(key.clone(), value);
			self.host.submit_local_op(Op::Set {
				key: key.clone(),
				value: encoded,
			});
		} else {
			self.sequenced.set(key.clone(), value, UNSEQUENCED);
		}
		self.emit(MapEvent::ValueChanged {
			key,
			local: true,
		});
		Ok(())
	}

	/// Removes a mapping
	pub fn delete(&mut self, key: Key) -> Result<(), Error> {
		check_key(&key)?;
		if self.host.is_attached() {
			self.pending.delete(key.clone());
			self.host.submit_local_op(Op::Delete {
				key: key.clone(),
			});
		} else {
			self.sequenced.delete(key.clone(), UNSEQUENCED);
		}
		self.emit(MapEvent::ValueChanged {
			key,
			local: true,
		});
		Ok(())
	}

	/// Removes every mapping
	pub fn clear(&mut self) {
		if self.host.is_attached() {
			self.pending.clear();
			self.host.submit_local_op(Op::Clear);
		} else {
			self.tree = self.tree.clear();
			self.sequenced.clear();
		}
		self.emit(MapEvent::Clear {
			local: true,
		});
	}

	/// Applies one op from the totally ordered stream. Every client applies
	/// the same ops in the same order; after any non-flush op the leader
	/// re-evaluates the flush gate.
	pub async fn process<S>(&mut self, blobs: &S, message: SequencedOp) -> Result<(), Error>
	where
		S: BlobStore,
	{
		let SequencedOp {
			sequence_number,
			op,
			local,
		} = message;
		#[cfg(debug_assertions)]
		debug!("applying {op} at sequence {sequence_number}");
		match op {
			Op::Set {
				key,
				value,
			} => {
				let value: V = decode_value(&value)?;
				self.sequenced.set(key.clone(), value, sequence_number);
				if local {
					self.pending.ack_modify(&key);
				} else {
					self.emit(MapEvent::ValueChanged {
						key,
						local: false,
					});
				}
			}
			Op::Delete {
				key,
			} => {
				self.sequenced.delete(key.clone(), sequence_number);
				if local {
					self.pending.ack_modify(&key);
				} else {
					self.emit(MapEvent::ValueChanged {
						key,
						local: false,
					});
				}
			}
			Op::Clear => {
				self.tree = self.tree.clear();
				self.sequenced.clear();
				if local {
					self.pending.ack_clear();
				} else {
					self.emit(MapEvent::Clear {
						local: false,
					});
				}
			}
			Op::Flush {
				update,
				ref_sequence_number,
			} => {
				if local {
					// Our outstanding flush came back, stale or not
					self.flush_state = FlushState::Idle;
				}
				if ref_sequence_number > self.last_flush_ref_seq {
					self.last_flush_ref_seq = ref_sequence_number;
					self.sequenced.flush(ref_sequence_number);
					self.tree = self.tree.update(&update);
					self.evict_working_set();
					self.emit(MapEvent::Flush {
						is_leader: self.leader.is_leader(),
					});
				} else {
					// A concurrent flush from a former leader
					debug!("ignoring stale flush at reference sequence {ref_sequence_number}");
				}
				return Ok(());
			}
		}
		self.maybe_flush(blobs).await;
		Ok(())
	}

	/// Records a quorum member joining; a promotion re-checks the flush gate
	pub async fn client_joined<S>(
		&mut self,
		blobs: &S,
		client_id: String,
		join_sequence_number: SequenceNumber,
	) where
		S: BlobStore,
	{
		if let Some(LeaderTransition::Promoted) =
			self.leader.client_joined(client_id, join_sequence_number)
		{
			self.maybe_flush(blobs).await;
		}
	}

	/// Records a quorum member leaving; a promotion re-checks the flush gate
	pub async fn client_left<S>(&mut self, blobs: &S, client_id: &str)
	where
		S: BlobStore,
	{
		if let Some(LeaderTransition::Promoted) = self.leader.client_left(client_id) {
			self.maybe_flush(blobs).await;
		}
	}

	pub fn set_local_client(&mut self, client_id: String) {
		self.leader.set_local(client_id);
	}

	pub fn is_leader(&self) -> bool {
		self.leader.is_leader()
	}

	pub fn flush_state(&self) -> FlushState {
		self.flush_state
	}

	/// The number of keys with acknowledged mutations not yet represented
	/// in a persisted tree root
	pub fn unflushed_change_count(&self) -> usize {
		self.sequenced.unflushed_change_count()
	}

	/// The resident key count across the sequenced cache and the loaded
	/// portion of the tree
	pub fn working_set_size(&self) -> usize {
		self.sequenced.size() + self.tree.working_set_size()
	}

	/// Packs the map into a single inline leaf for the attach summary.
	/// Attach-time maps are guaranteed small, so nothing is uploaded.
	pub fn get_attach_summary(&self) -> Result<MapSummary, Error> {
		let (updates, deletes) = self.sequenced.get_flushable_changes();
		self.inline_summary(updates, deletes)
	}

	/// Summarizes the persisted tree. Sequenced ops not yet flushed are not
	/// part of a summary; clients catch up on them through the op stream.
	pub fn summarize(&self) -> Result<MapSummary, Error> {
		match self.tree.persisted_root() {
			Some(root) => Ok(MapSummary {
				order: self.tree.order(),
				root: SummaryRoot::Handle(root.clone()),
				handles: self.tree.all_handles(),
			}),
			// A tree that never flushed is still fully resident
			None => self.inline_summary(HashMap::new(), HashSet::new()),
		}
	}

	/// Hydrates the map from a summary blob
	pub fn load(&mut self, bytes: &[u8]) -> Result<(), Error> {
		let summary = MapSummary::decode(bytes)?;
		self.tree = match summary.root {
			SummaryRoot::Handle(root) => {
				ChunkedBTree::load(summary.order, root, summary.handles)?
			}
			SummaryRoot::Inline {
				keys,
				values,
			} => {
				let values = values
					.iter()
					.map(|bytes| decode_value(bytes))
					.collect::<Result<Vec<V>, Error>>()?;
				ChunkedBTree::with_entries(summary.order, keys, values)?
			}
		};
		Ok(())
	}

	/// Every blob handle reachable from the current tree root
	pub fn get_gc_data(&self) -> Vec<Handle> {
		self.tree.all_handles()
	}

	fn inline_summary(
		&self,
		updates: HashMap<Key, V>,
		deletes: HashSet<Key>,
	) -> Result<MapSummary, Error> {
		let (keys, values) = self.tree.flush_sync(updates, deletes)?;
		let values = values.iter().map(encode_value).collect::<Result<Vec<_>, Error>>()?;
		Ok(MapSummary {
			order: self.tree.order(),
			root: SummaryRoot::Inline {
				keys,
				values,
			},
			handles: Vec::new(),
		})
	}

	/// Starts a flush when this client leads, enough changes accumulated,
	/// and no flush is already in flight
	async fn maybe_flush<S>(&mut self, blobs: &S)
	where
		S: BlobStore,
	{
		if !self.leader.is_leader()
			|| self.flush_state != FlushState::Idle
			|| self.sequenced.unflushed_change_count() <= self.config.flush_threshold
		{
			return;
		}
		self.start_flush(blobs).await;
	}

	async fn start_flush<S>(&mut self, blobs: &S)
	where
		S: BlobStore,
	{
		debug_assert!(self.leader.is_leader(), "only the leader may start a flush");
		self.flush_state = FlushState::Uploading;
		self.emit(MapEvent::StartFlush);
		let (updates, deletes) = self.sequenced.get_flushable_changes();
		let ref_sequence_number = self.host.last_sequence_number();
		match self.tree.flush(blobs, updates, deletes).await {
			Ok(update) => {
				self.host.submit_local_op(Op::Flush {
					update,
					ref_sequence_number,
				});
				self.flush_state = FlushState::AwaitingAck;
			}
			Err(e) => {
				// Nothing was applied locally, so the map is unharmed; the
				// next applied op re-evaluates the gate
				warn!("flush abandoned: {e}");
				self.flush_state = FlushState::Idle;
			}
		}
	}

	/// The eviction engine: when a cache insertion pushes the working set
	/// past the hint and enough of it is reclaimable, free half the hint
	/// from the sequenced cache and ask the tree to release as much again.
	fn evict_working_set(&mut self) {
		let hint = self.config.cache_size_hint;
		let tree_resident = self.tree.working_set_size();
		let resident = self.sequenced.size() + tree_resident;
		if resident <= hint {
			return;
		}
		// Resolved tree chunks reload from their handles, so they are
		// always reclaimable; sequenced entries only when not modified
		let evictable = self.sequenced.evictable_len() + tree_resident;
		if evictable <= hint / 2 {
			return;
		}
		let target = hint / 2;
		let keep = self.sequenced.size().saturating_sub(target);
		self.sequenced.evict(keep);
		self.tree.evict(target);
	}

	fn emit(&self, event: MapEvent) {
		if let Some(sender) = &self.events {
			if sender.try_send(event).is_err() {
				debug!("map event dropped: the receiver is gone");
			}
		}
	}
}

fn check_key(key: &str) -> Result<(), Error> {
	if key.is_empty() {
		return Err(Error::InvalidKey);
	}
	Ok(())
}
