use crate::state::Lookup;
use crate::tree::Key;
use std::collections::HashMap;

/// The record of locally issued, not-yet-acknowledged mutations.
///
/// A key is present iff the local client has outstanding unacknowledged
/// writes for it; reads through this state are authoritative with respect
/// to the local client's own causal view. Every mutation, including a
/// clear, bumps one monotone update counter so that a later set can be
/// distinguished from an earlier clear.
pub struct PendingState<V> {
	entries: HashMap<Key, PendingEntry<V>>,
	update_counter: u64,
	pending_clear_count: u32,
	latest_clear_seq: u64,
}

struct PendingEntry<V> {
	latest_value: Option<V>,
	is_deleted: bool,
	update_seq: u64,
	unacked: u32,
}

impl<V> Default for PendingState<V> {
	fn default() -> Self {
		Self {
			entries: HashMap::new(),
			update_counter: 0,
			pending_clear_count: 0,
			latest_clear_seq: 0,
		}
	}
}

impl<V> PendingState<V>
where
	V: Clone,
{
	pub fn new() -> Self {
		Self::default()
	}

	/// Records a locally issued set
	pub fn set(&mut self, key: Key, value: V) {
		self.update_counter += 1;
		let update_seq = self.update_counter;
		let entry = self.entries.entry(key).or_insert_with(|| PendingEntry {
			latest_value: None,
			is_deleted: false,
			update_seq,
			unacked: 0,
		});
		entry.latest_value = Some(value);
		entry.is_deleted = false;
		entry.update_seq = update_seq;
		entry.unacked += 1;
	}

	/// Records a locally issued delete
	pub fn delete(&mut self, key: Key) {
		self.update_counter += 1;
		let update_seq = self.update_counter;
		let entry = self.entries.entry(key).or_insert_with(|| PendingEntry {
			latest_value: None,
			is_deleted: true,
			update_seq,
			unacked: 0,
		});
		entry.latest_value = None;
		entry.is_deleted = true;
		entry.update_seq = update_seq;
		entry.unacked += 1;
	}

	/// Records a locally issued clear
	pub fn clear(&mut self) {
		self.update_counter += 1;
		self.pending_clear_count += 1;
		self.latest_clear_seq = self.update_counter;
	}

	/// Answers a read as if all pending mutations had committed
	pub fn get(&self, key: &str) -> Lookup<V> {
		match self.entries.get(key) {
			Some(entry) => match &entry.latest_value {
				Some(v) if !entry.is_deleted && entry.update_seq > self.latest_clear_seq => {
					Lookup::Found(v.clone())
				}
				_ => Lookup::Tombstone,
			},
			// A pending clear dominates every key without a newer pending set
			None if self.pending_clear_count > 0 => Lookup::Tombstone,
			None => Lookup::Miss,
		}
	}

	/// Acknowledges one local set or delete for the key. The entry is
	/// evicted once every local write for the key has been acknowledged.
	pub fn ack_modify(&mut self, key: &str) {
		if let Some(entry) = self.entries.get_mut(key) {
			entry.unacked = entry.unacked.saturating_sub(1);
			if entry.unacked == 0 {
				self.entries.remove(key);
			}
		}
	}

	/// Acknowledges one local clear
	pub fn ack_clear(&mut self) {
		self.pending_clear_count = self.pending_clear_count.saturating_sub(1);
	}

	/// The number of keys with pending writes
	pub fn size(&self) -> usize {
		self.entries.len()
	}
}
