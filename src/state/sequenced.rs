use crate::state::{Lookup, SequenceNumber};
use crate::tree::Key;
use std::collections::{HashMap, HashSet, VecDeque};

/// The cache of acknowledged reads and unflushed acknowledged mutations.
///
/// Entries double as a read-through cache over the chunked tree and as the
/// source of the next flush: `ops` keeps every acknowledged mutation that
/// is not yet represented in a persisted tree root, and `modified` is the
/// set of keys those ops touch. An entry may be evicted only if its key is
/// not in `modified`; a modified key without a live entry still answers
/// reads as a tombstone.
pub struct SequencedState<V> {
	entries: HashMap<Key, V>,
	/// Insertion order of `entries`, walked by the eviction engine
	arrival: VecDeque<Key>,
	/// Acknowledged mutations in sequence order
	ops: Vec<(SequenceNumber, Key, Option<V>)>,
	modified: HashSet<Key>,
}

impl<V> Default for SequencedState<V> {
	fn default() -> Self {
		Self {
			entries: HashMap::new(),
			arrival: VecDeque::new(),
			ops: Vec::new(),
			modified: HashSet::new(),
		}
	}
}

impl<V> SequencedState<V>
where
	V: Clone,
{
	pub fn new() -> Self {
		Self::default()
	}

	/// Inserts a read-through entry; no mutation is implied
	pub fn cache(&mut self, key: Key, value: V) {
		if self.entries.insert(key.clone(), value).is_none() {
			self.arrival.push_back(key);
		}
	}

	/// Records an acknowledged set
	pub fn set(&mut self, key: Key, value: V, sequence_number: SequenceNumber) {
		self.ops.push((sequence_number, key.clone(), Some(value.clone())));
		self.modified.insert(key.clone());
		self.cache(key, value);
	}

	/// Records an acknowledged delete
	pub fn delete(&mut self, key: Key, sequence_number: SequenceNumber) {
		self.ops.push((sequence_number, key.clone(), None));
		self.entries.remove(&key);
		self.modified.insert(key);
	}

	pub fn get(&self, key: &str) -> Lookup<V> {
		match self.entries.get(key) {
			Some(v) => Lookup::Found(v.clone()),
			None if self.modified.contains(key) => Lookup::Tombstone,
			None => Lookup::Miss,
		}
	}

	/// Collapses the op log into a last-writer-wins snapshot without
	/// mutating internal state
	pub fn get_flushable_changes(&self) -> (HashMap<Key, V>, HashSet<Key>) {
		let mut updates = HashMap::new();
		let mut deletes = HashSet::new();
		for (_, key, value) in &self.ops {
			match value {
				Some(v) => {
					deletes.remove(key);
					updates.insert(key.clone(), v.clone());
				}
				None => {
					updates.remove(key);
					deletes.insert(key.clone());
				}
			}
		}
		(updates, deletes)
	}

	/// Drops every op already represented in a flushed tree root and
	/// rebuilds `modified` from the ops that remain
	pub fn flush(&mut self, ref_sequence_number: SequenceNumber) {
		self.ops.retain(|(seq, _, _)| *seq > ref_sequence_number);
		self.modified = self.ops.iter().map(|(_, key, _)| key.clone()).collect();
	}

	pub fn clear(&mut self) {
		self.entries.clear();
		self.arrival.clear();
		self.ops.clear();
		self.modified.clear();
	}

	/// The number of keys with unflushed acknowledged mutations
	pub fn unflushed_change_count(&self) -> usize {
		self.modified.len()
	}

	/// The number of live cache entries
	pub fn size(&self) -> usize {
		self.entries.len()
	}

	/// The number of entries the eviction engine is allowed to drop
	pub fn evictable_len(&self) -> usize {
		self.entries.keys().filter(|key| !self.modified.contains(*key)).count()
	}

	/// Drops non-modified entries in insertion order until at most
	/// `max_entries` remain; returns the number of entries dropped
	pub fn evict(&mut self, max_entries: usize) -> usize {
		let mut dropped = 0;
		let mut scanned = 0;
		let bound = self.arrival.len();
		while self.entries.len() > max_entries && scanned < bound {
			scanned += 1;
			let Some(key) = self.arrival.pop_front() else {
				break;
			};
			if !self.entries.contains_key(&key) {
				// Stale arrival record for an entry already removed
				continue;
			}
			if self.modified.contains(&key) {
				self.arrival.push_back(key);
				continue;
			}
			self.entries.remove(&key);
			dropped += 1;
		}
		dropped
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::state::Lookup;

	#[test]
	fn test_cache_and_get() {
		let mut state = SequencedState::new();
		state.cache("a".to_string(), 1);
		assert_eq!(state.get("a"), Lookup::Found(1));
		assert_eq!(state.get("b"), Lookup::Miss);
		assert_eq!(state.unflushed_change_count(), 0);
	}

	#[test]
	fn test_delete_leaves_tombstone() {
		let mut state = SequencedState::new();
		state.set("a".to_string(), 1, 10);
		state.delete("a".to_string(), 11);
		assert_eq!(state.get("a"), Lookup::Tombstone);
		assert_eq!(state.unflushed_change_count(), 1);
	}

	#[test]
	fn test_flushable_changes_are_last_writer_wins() {
		let mut state = SequencedState::new();
		state.set("a".to_string(), 1, 10);
		state.delete("a".to_string(), 11);
		state.set("a".to_string(), 2, 12);
		state.set("b".to_string(), 3, 13);
		state.delete("b".to_string(), 14);
		let (updates, deletes) = state.get_flushable_changes();
		assert_eq!(updates.get("a"), Some(&2));
		assert!(!updates.contains_key("b"));
		assert!(deletes.contains("b"));
		assert!(!deletes.contains("a"));
	}

	#[test]
	fn test_flush_retains_later_ops() {
		let mut state = SequencedState::new();
		state.set("a".to_string(), 1, 10);
		state.set("b".to_string(), 2, 20);
		state.flush(15);
		assert_eq!(state.unflushed_change_count(), 1);
		// The entry survives as a plain cache entry
		assert_eq!(state.get("a"), Lookup::Found(1));
		let (updates, _) = state.get_flushable_changes();
		assert!(!updates.contains_key("a"));
		assert!(updates.contains_key("b"));
	}

	#[test]
	fn test_evict_skips_modified_entries() {
		let mut state = SequencedState::new();
		state.cache("a".to_string(), 1);
		state.set("b".to_string(), 2, 10);
		state.cache("c".to_string(), 3);
		let dropped = state.evict(1);
		assert_eq!(dropped, 2);
		assert_eq!(state.get("a"), Lookup::Miss);
		assert_eq!(state.get("c"), Lookup::Miss);
		// The modified entry may not be evicted
		assert_eq!(state.get("b"), Lookup::Found(2));
		// After a flush covering it, the entry becomes evictable
		state.flush(10);
		state.evict(0);
		assert_eq!(state.get("b"), Lookup::Miss);
	}

	#[test]
	fn test_clear_empties_everything() {
		let mut state = SequencedState::new();
		state.set("a".to_string(), 1, 10);
		state.cache("b".to_string(), 2);
		state.clear();
		assert_eq!(state.size(), 0);
		assert_eq!(state.unflushed_change_count(), 0);
		assert_eq!(state.get("a"), Lookup::Miss);
	}
}
