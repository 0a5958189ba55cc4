//! The chunked b-tree: an immutable, lazily loaded sorted map over string
//! keys whose nodes are individually persisted as blobs.
//!
//! Every structural edit returns a new tree value sharing all unchanged
//! nodes with its predecessor, and records the handles of the chunks the
//! edit superseded. A flush uploads every structurally new node and returns
//! the handle-set delta; applying that delta with [`ChunkedBTree::update`]
//! swaps the root for an unresolved reference to the new persisted root, so
//! the working set is rebuilt lazily as keys are read back.

mod node;

use crate::blob::{BlobStore, Handle};
use crate::err::Error;
use async_recursion::async_recursion;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use self::node::{child_index, BTreeNode, NodeData, NodeRef};
use std::sync::Arc;

/// A map key. Keys are non-empty and compared bytewise.
pub type Key = String;

/// The handle-set delta produced by a flush and applied by every client
/// when the corresponding flush op arrives.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeUpdate {
	pub new_root: Handle,
	pub new_handles: Vec<Handle>,
	pub deleted_handles: Vec<Handle>,
}

/// Aggregate shape of a tree, gathered by full traversal
#[derive(Debug, Default, PartialEq, Eq)]
pub struct TreeStatistics {
	pub keys_count: u64,
	pub max_depth: u32,
	pub nodes_count: u32,
}

/// The set of every handle reachable from the root, kept as an ordered
/// multiset: content addressing can make distinct tree revisions share a
/// chunk, and the garbage collection frontier needs the counts to survive
/// an add/remove of the same handle.
#[derive(Clone, Default)]
struct HandleMultiset(BTreeMap<Handle, usize>);

impl HandleMultiset {
	fn insert(&mut self, handle: Handle) {
		*self.0.entry(handle).or_insert(0) += 1;
	}

	fn remove(&mut self, handle: &Handle) {
		match self.0.get_mut(handle) {
			Some(count) if *count > 1 => *count -= 1,
			Some(_) => {
				self.0.remove(handle);
			}
			None => {
				warn!("removing untracked handle {handle} from the tree handle set");
			}
		}
	}

	fn iter(&self) -> impl Iterator<Item = &Handle> {
		self.0.iter().flat_map(|(handle, count)| std::iter::repeat(handle).take(*count))
	}
}

enum SetResult<V> {
	Replaced(NodeRef<V>),
	Split(NodeRef<V>, Key, NodeRef<V>),
}

enum DeleteResult<V> {
	Unchanged,
	Replaced(NodeRef<V>),
	Removed,
}

/// An immutable sorted map over string keys, chunked into individually
/// persisted nodes of at most `order - 1` entries.
#[derive(Clone)]
pub struct ChunkedBTree<V> {
	order: u32,
	root: NodeRef<V>,
	handles: HandleMultiset,
}

impl<V> ChunkedBTree<V>
where
	V: Clone + Serialize + DeserializeOwned + Send + Sync,
{
	/// Creates an empty tree
	pub fn new(order: u32) -> Result<Self, Error> {
		if order < 2 {
			return Err(Error::InvalidOrder(order));
		}
		Ok(Self {
			order,
			root: NodeRef::loaded(BTreeNode::empty_leaf()),
			handles: HandleMultiset::default(),
		})
	}

	/// Hydrates a tree from a persisted root and its reachable handle set
	pub fn load(order: u32, root: Handle, handles: Vec<Handle>) -> Result<Self, Error> {
		if order < 2 {
			return Err(Error::InvalidOrder(order));
		}
		let mut set = HandleMultiset::default();
		for handle in handles {
			set.insert(handle);
		}
		Ok(Self {
			order,
			root: NodeRef::lazy(root),
			handles: set,
		})
	}

	/// Hydrates a tree from an inline leaf. Callers guarantee the entry
	/// count is small; this is only used for attach-time summaries.
	pub fn with_entries(order: u32, keys: Vec<Key>, values: Vec<V>) -> Result<Self, Error> {
		if order < 2 {
			return Err(Error::InvalidOrder(order));
		}
		if keys.len() != values.len() {
			return Err(Error::Unreachable("inline leaf keys and values differ in length"));
		}
		Ok(Self {
			order,
			root: NodeRef::loaded(BTreeNode::Leaf {
				keys,
				values,
			}),
			handles: HandleMultiset::default(),
		})
	}

	pub fn order(&self) -> u32 {
		self.order
	}

	/// The handle of the persisted root, if the current root has been
	/// flushed rather than built in memory
	pub fn persisted_root(&self) -> Option<&Handle> {
		match &self.root {
			NodeRef::Lazy(lazy) => Some(lazy.handle()),
			NodeRef::Loaded(_) => None,
		}
	}

	pub async fn get<S>(&self, blobs: &S, key: &str) -> Result<Option<V>, Error>
	where
		S: BlobStore,
	{
		self.get_in(blobs, &self.root, key).await
	}

	pub async fn has<S>(&self, blobs: &S, key: &str) -> Result<bool, Error>
	where
		S: BlobStore,
	{
		self.has_in(blobs, &self.root, key).await
	}

	/// Returns a tree containing the mapping. The handle of every resolved
	/// chunk superseded by a rebuilt node is pushed onto `deleted`.
	pub async fn set<S>(
		&self,
		blobs: &S,
		key: Key,
		value: V,
		deleted: &mut Vec<Handle>,
	) -> Result<Self, Error>
	where
		S: BlobStore,
	{
		let root = match self.set_in(blobs, &self.root, &key, value, deleted).await? {
			SetResult::Replaced(root) => root,
			SetResult::Split(left, separator, right) => NodeRef::loaded(BTreeNode::Interior {
				keys: vec![separator],
				children: vec![left, right],
			}),
		};
		Ok(Self {
			order: self.order,
			root,
			handles: self.handles.clone(),
		})
	}

	/// Returns a tree without the mapping; deleting an absent key returns
	/// the receiver unchanged and records nothing.
	pub async fn delete<S>(
		&self,
		blobs: &S,
		key: &str,
		deleted: &mut Vec<Handle>,
	) -> Result<Self, Error>
	where
		S: BlobStore,
	{
		let root = match self.delete_in(blobs, &self.root, key, deleted).await? {
			DeleteResult::Unchanged => return Ok(self.clone()),
			DeleteResult::Replaced(root) => root,
			DeleteResult::Removed => NodeRef::loaded(BTreeNode::empty_leaf()),
		};
		Ok(Self {
			order: self.order,
			root,
			handles: self.handles.clone(),
		})
	}

	/// Applies all pending updates and deletes, uploads every structurally
	/// new node, and returns the handle-set delta. The receiver itself is
	/// left untouched; clients adopt the result through [`Self::update`]
	/// when the flush op comes back sequenced.
	pub async fn flush<S>(
		&self,
		blobs: &S,
		updates: HashMap<Key, V>,
		deletes: HashSet<Key>,
	) -> Result<TreeUpdate, Error>
	where
		S: BlobStore,
	{
		let mut deleted_handles = Vec::new();
		let mut tree = self.clone();
		for (key, value) in updates {
			tree = tree.set(blobs, key, value, &mut deleted_handles).await?;
		}
		for key in deletes {
			tree = tree.delete(blobs, &key, &mut deleted_handles).await?;
		}
		let mut new_handles = Vec::new();
		let new_root = tree.upload_in(blobs, &tree.root, &mut new_handles).await?;
		Ok(TreeUpdate {
			new_root,
			new_handles,
			deleted_handles,
		})
	}

	/// Packs the tree's entries merged with the given changes into a single
	/// sorted inline leaf, without uploading anything. Only valid while the
	/// whole tree is resident, which the attach path guarantees.
	pub fn flush_sync(
		&self,
		updates: HashMap<Key, V>,
		deletes: HashSet<Key>,
	) -> Result<(Vec<Key>, Vec<V>), Error> {
		let mut entries = BTreeMap::new();
		Self::collect_resident(&self.root, &mut entries)?;
		for (key, value) in updates {
			entries.insert(key, value);
		}
		for key in deletes {
			entries.remove(&key);
		}
		Ok(entries.into_iter().unzip())
	}

	/// Applies a flush delta: the root becomes an unresolved reference to
	/// the new persisted root, and the handle set is reconciled.
	pub fn update(&self, update: &TreeUpdate) -> Self {
		let mut handles = self.handles.clone();
		for handle in &update.new_handles {
			handles.insert(handle.clone());
		}
		for handle in &update.deleted_handles {
			handles.remove(handle);
		}
		Self {
			order: self.order,
			root: NodeRef::lazy(update.new_root.clone()),
			handles,
		}
	}

	/// An empty tree of the same order
	pub fn clear(&self) -> Self {
		Self {
			order: self.order,
			root: NodeRef::loaded(BTreeNode::empty_leaf()),
			handles: HandleMultiset::default(),
		}
	}

	/// Discards resolved chunks, deepest first, until at least `count_hint`
	/// resident keys have been released; returns the number released.
	/// Nodes built in memory are not evictable.
	pub fn evict(&self, count_hint: usize) -> usize {
		let mut remaining = count_hint;
		Self::evict_in(&self.root, &mut remaining).0
	}

	/// The number of keys currently materialized in memory
	pub fn working_set_size(&self) -> usize {
		Self::resident_keys(&self.root)
	}

	/// Every handle reachable from the root, with multiplicity; the
	/// garbage collection frontier
	pub fn all_handles(&self) -> Vec<Handle> {
		self.handles.iter().cloned().collect()
	}

	/// Walks the whole tree, resolving every chunk
	pub async fn statistics<S>(&self, blobs: &S) -> Result<TreeStatistics, Error>
	where
		S: BlobStore,
	{
		let mut stats = TreeStatistics::default();
		let mut queue = VecDeque::new();
		queue.push_back((self.root.clone(), 1u32));
		while let Some((node, depth)) = queue.pop_front() {
			let resolved = node.node(blobs).await?;
			stats.nodes_count += 1;
			stats.max_depth = stats.max_depth.max(depth);
			match &*resolved {
				BTreeNode::Leaf {
					keys,
					..
				} => stats.keys_count += keys.len() as u64,
				BTreeNode::Interior {
					children,
					..
				} => {
					for child in children {
						queue.push_back((child.clone(), depth + 1));
					}
				}
			}
		}
		Ok(stats)
	}

	#[async_recursion]
	async fn get_in<S>(&self, blobs: &S, node: &NodeRef<V>, key: &str) -> Result<Option<V>, Error>
	where
		S: BlobStore,
	{
		match &*node.node(blobs).await? {
			BTreeNode::Leaf {
				keys,
				values,
			} => Ok(keys
				.binary_search_by(|k| k.as_str().cmp(key))
				.ok()
				.map(|i| values[i].clone())),
			BTreeNode::Interior {
				keys,
				children,
			} => self.get_in(blobs, &children[child_index(keys, key)], key).await,
		}
	}

	#[async_recursion]
	async fn has_in<S>(&self, blobs: &S, node: &NodeRef<V>, key: &str) -> Result<bool, Error>
	where
		S: BlobStore,
	{
		match &*node.node(blobs).await? {
			BTreeNode::Leaf {
				keys,
				..
			} => Ok(keys.binary_search_by(|k| k.as_str().cmp(key)).is_ok()),
			BTreeNode::Interior {
				keys,
				children,
			} => self.has_in(blobs, &children[child_index(keys, key)], key).await,
		}
	}

	#[async_recursion]
	async fn set_in<S>(
		&self,
		blobs: &S,
		node: &NodeRef<V>,
		key: &str,
		value: V,
		deleted: &mut Vec<Handle>,
	) -> Result<SetResult<V>, Error>
	where
		S: BlobStore,
	{
		let resolved = node.node(blobs).await?;
		let result = match &*resolved {
			BTreeNode::Leaf {
				keys,
				values,
			} => {
				let mut keys = keys.clone();
				let mut values = values.clone();
				match keys.binary_search_by(|k| k.as_str().cmp(key)) {
					// An existing key takes the new value in place
					Ok(i) => values[i] = value,
					Err(i) => {
						keys.insert(i, key.to_string());
						values.insert(i, value);
					}
				}
				if keys.len() < self.order as usize {
					SetResult::Replaced(NodeRef::loaded(BTreeNode::Leaf {
						keys,
						values,
					}))
				} else {
					// The separator is the first key of the right half
					let mid = (keys.len() + 1) / 2;
					let right_keys = keys.split_off(mid);
					let right_values = values.split_off(mid);
					let separator = right_keys[0].clone();
					SetResult::Split(
						NodeRef::loaded(BTreeNode::Leaf {
							keys,
							values,
						}),
						separator,
						NodeRef::loaded(BTreeNode::Leaf {
							keys: right_keys,
							values: right_values,
						}),
					)
				}
			}
			BTreeNode::Interior {
				keys,
				children,
			} => {
				let idx = child_index(keys, key);
				let outcome = self.set_in(blobs, &children[idx], key, value, deleted).await?;
				let mut keys = keys.clone();
				let mut children = children.clone();
				match outcome {
					SetResult::Replaced(child) => children[idx] = child,
					SetResult::Split(left, separator, right) => {
						children[idx] = left;
						children.insert(idx + 1, right);
						keys.insert(idx, separator);
					}
				}
				if keys.len() < self.order as usize {
					SetResult::Replaced(NodeRef::loaded(BTreeNode::Interior {
						keys,
						children,
					}))
				} else {
					// Promote the middle key of the overfull key list
					let mid = keys.len() / 2;
					let right_keys = keys.split_off(mid + 1);
					let separator =
						keys.pop().ok_or(Error::Unreachable("interior split without keys"))?;
					let right_children = children.split_off(mid + 1);
					SetResult::Split(
						NodeRef::loaded(BTreeNode::Interior {
							keys,
							children,
						}),
						separator,
						NodeRef::loaded(BTreeNode::Interior {
							keys: right_keys,
							children: right_children,
						}),
					)
				}
			}
		};
		// The chunk this rebuilt node supersedes joins the flush delta
		if let NodeRef::Lazy(lazy) = node {
			deleted.push(lazy.handle().clone());
		}
		Ok(result)
	}

	#[async_recursion]
	async fn delete_in<S>(
		&self,
		blobs: &S,
		node: &NodeRef<V>,
		key: &str,
		deleted: &mut Vec<Handle>,
	) -> Result<DeleteResult<V>, Error>
	where
		S: BlobStore,
	{
		let resolved = node.node(blobs).await?;
		let result = match &*resolved {
			BTreeNode::Leaf {
				keys,
				values,
			} => match keys.binary_search_by(|k| k.as_str().cmp(key)) {
				Err(_) => DeleteResult::Unchanged,
				Ok(_) if keys.len() == 1 => DeleteResult::Removed,
				Ok(i) => {
					let mut keys = keys.clone();
					let mut values = values.clone();
					keys.remove(i);
					values.remove(i);
					DeleteResult::Replaced(NodeRef::loaded(BTreeNode::Leaf {
						keys,
						values,
					}))
				}
			},
			BTreeNode::Interior {
				keys,
				children,
			} => {
				let idx = child_index(keys, key);
				match self.delete_in(blobs, &children[idx], key, deleted).await? {
					DeleteResult::Unchanged => DeleteResult::Unchanged,
					DeleteResult::Replaced(child) => {
						let mut children = children.clone();
						children[idx] = child;
						DeleteResult::Replaced(NodeRef::loaded(BTreeNode::Interior {
							keys: keys.clone(),
							children,
						}))
					}
					// An emptied child is spliced out together with the
					// adjacent separator; no rebalancing is performed
					DeleteResult::Removed if children.len() == 1 => DeleteResult::Removed,
					DeleteResult::Removed => {
						let mut keys = keys.clone();
						let mut children = children.clone();
						children.remove(idx);
						keys.remove(idx.saturating_sub(1));
						DeleteResult::Replaced(NodeRef::loaded(BTreeNode::Interior {
							keys,
							children,
						}))
					}
				}
			}
		};
		if !matches!(result, DeleteResult::Unchanged) {
			if let NodeRef::Lazy(lazy) = node {
				deleted.push(lazy.handle().clone());
			}
		}
		Ok(result)
	}

	/// Uploads the subtree bottom-up. An unchanged persisted chunk re-emits
	/// its existing handle without a re-upload.
	#[async_recursion]
	async fn upload_in<S>(
		&self,
		blobs: &S,
		node: &NodeRef<V>,
		new_handles: &mut Vec<Handle>,
	) -> Result<Handle, Error>
	where
		S: BlobStore,
	{
		match node {
			NodeRef::Lazy(lazy) => Ok(lazy.handle().clone()),
			NodeRef::Loaded(loaded) => {
				let data = match &**loaded {
					BTreeNode::Leaf {
						keys,
						values,
					} => NodeData::Leaf {
						keys: keys.clone(),
						values: values.clone(),
					},
					BTreeNode::Interior {
						keys,
						children,
					} => {
						let mut handles = Vec::with_capacity(children.len());
						for child in children {
							handles.push(self.upload_in(blobs, child, new_handles).await?);
						}
						NodeData::Interior {
							keys: keys.clone(),
							children: handles,
						}
					}
				};
				let handle = blobs.upload(bincode::serialize(&data)?).await?;
				new_handles.push(handle.clone());
				Ok(handle)
			}
		}
	}

	fn collect_resident(node: &NodeRef<V>, out: &mut BTreeMap<Key, V>) -> Result<(), Error> {
		let resolved = match node {
			NodeRef::Loaded(loaded) => Arc::clone(loaded),
			NodeRef::Lazy(lazy) => lazy
				.cached()
				.ok_or(Error::Unreachable("synchronous flush on a partially loaded tree"))?,
		};
		match &*resolved {
			BTreeNode::Leaf {
				keys,
				values,
			} => {
				for (key, value) in keys.iter().zip(values.iter()) {
					out.insert(key.clone(), value.clone());
				}
			}
			BTreeNode::Interior {
				children,
				..
			} => {
				for child in children {
					Self::collect_resident(child, out)?;
				}
			}
		}
		Ok(())
	}

	fn resident_keys(node: &NodeRef<V>) -> usize {
		let resolved = match node {
			NodeRef::Loaded(loaded) => Arc::clone(loaded),
			NodeRef::Lazy(lazy) => match lazy.cached() {
				Some(resolved) => resolved,
				None => return 0,
			},
		};
		match &*resolved {
			BTreeNode::Leaf {
				keys,
				..
			} => keys.len(),
			BTreeNode::Interior {
				children,
				..
			} => children.iter().map(Self::resident_keys).sum(),
		}
	}

	/// Post-order sweep; returns the released key count and whether the
	/// subtree is now entirely non-resident.
	fn evict_in(node: &NodeRef<V>, remaining: &mut usize) -> (usize, bool) {
		match node {
			NodeRef::Loaded(loaded) => {
				let mut released = 0;
				if let BTreeNode::Interior {
					children,
					..
				} = &**loaded
				{
					for child in children {
						if *remaining == 0 {
							break;
						}
						released += Self::evict_in(child, remaining).0;
					}
				}
				// A node built in memory has no handle to fall back to
				(released, false)
			}
			NodeRef::Lazy(lazy) => {
				let Some(resolved) = lazy.cached() else {
					return (0, true);
				};
				match &*resolved {
					BTreeNode::Leaf {
						keys,
						..
					} => {
						if *remaining == 0 {
							return (0, false);
						}
						lazy.clear_slot();
						let released = keys.len();
						*remaining = remaining.saturating_sub(released);
						(released, true)
					}
					BTreeNode::Interior {
						children,
						..
					} => {
						let mut released = 0;
						for child in children {
							if *remaining == 0 {
								break;
							}
							released += Self::evict_in(child, remaining).0;
						}
						// Dropping the slot would drop resolved children
						// with it, so only clear once they are all gone
						let clear = children.iter().all(|child| {
							matches!(child, NodeRef::Lazy(lazy) if lazy.cached().is_none())
						});
						if clear {
							lazy.clear_slot();
						}
						(released, clear)
					}
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::blob::MemoryBlobStore;
	use rand::prelude::SliceRandom;
	use rand::thread_rng;
	use std::collections::BTreeSet;
	use test_log::test;

	const PASSAGE: &str = "the hive keeps its working set small while the authoritative \
		dataset lives in an external store as a content addressed chunked tree of sorted \
		keys and values where several clients apply edits concurrently through a totally \
		ordered stream of operations and one elected client periodically compacts the \
		outstanding log into a new snapshot that other clients adopt lazily as they read";

	async fn set(
		tree: &ChunkedBTree<i32>,
		blobs: &MemoryBlobStore,
		key: &str,
		value: i32,
	) -> ChunkedBTree<i32> {
		let mut deleted = Vec::new();
		tree.set(blobs, key.to_string(), value, &mut deleted).await.unwrap()
	}

	fn multiset(handles: &[Handle]) -> BTreeMap<Handle, usize> {
		let mut set = BTreeMap::new();
		for handle in handles {
			*set.entry(handle.clone()).or_insert(0) += 1;
		}
		set
	}

	#[test]
	fn test_order_validation() {
		assert!(matches!(ChunkedBTree::<i32>::new(0), Err(Error::InvalidOrder(0))));
		assert!(matches!(ChunkedBTree::<i32>::new(1), Err(Error::InvalidOrder(1))));
		assert!(ChunkedBTree::<i32>::new(2).is_ok());
	}

	#[test(tokio::test)]
	async fn test_small_order_root_split() {
		let blobs = MemoryBlobStore::new();
		let mut tree = ChunkedBTree::new(3).unwrap();
		tree = set(&tree, &blobs, "a", 1).await;
		tree = set(&tree, &blobs, "b", 2).await;
		tree = set(&tree, &blobs, "c", 3).await;
		assert_eq!(tree.get(&blobs, "b").await.unwrap(), Some(2));
		tree = set(&tree, &blobs, "d", 4).await;
		let stats = tree.statistics(&blobs).await.unwrap();
		// The root is an interior node with a single separator key
		assert_eq!(
			stats,
			TreeStatistics {
				keys_count: 4,
				max_depth: 2,
				nodes_count: 3,
			}
		);
		for (key, value) in [("a", 1), ("b", 2), ("c", 3), ("d", 4)] {
			assert_eq!(tree.get(&blobs, key).await.unwrap(), Some(value));
		}
		assert_eq!(tree.get(&blobs, "e").await.unwrap(), None);
	}

	#[test(tokio::test)]
	async fn test_replacing_a_value_does_not_split() {
		let blobs = MemoryBlobStore::new();
		let mut tree = ChunkedBTree::new(3).unwrap();
		tree = set(&tree, &blobs, "a", 1).await;
		tree = set(&tree, &blobs, "b", 2).await;
		for value in 3..20 {
			tree = set(&tree, &blobs, "b", value).await;
		}
		assert_eq!(tree.get(&blobs, "b").await.unwrap(), Some(19));
		let stats = tree.statistics(&blobs).await.unwrap();
		assert_eq!(stats.keys_count, 2);
		assert_eq!(stats.nodes_count, 1);
	}

	#[test(tokio::test)]
	async fn test_word_corpus_set_get_delete() {
		let blobs = MemoryBlobStore::new();
		let words: BTreeSet<&str> = PASSAGE.split_whitespace().collect();
		let mut tree = ChunkedBTree::new(4).unwrap();
		let mut deleted = Vec::new();
		for word in &words {
			tree = tree
				.set(&blobs, word.to_string(), word.to_string(), &mut deleted)
				.await
				.unwrap();
		}
		for word in &words {
			assert_eq!(tree.get(&blobs, word).await.unwrap(), Some(word.to_string()));
		}
		assert_eq!(tree.statistics(&blobs).await.unwrap().keys_count, words.len() as u64);
		tree.check_invariants(&blobs).await;
		for word in &words {
			tree = tree.delete(&blobs, word, &mut deleted).await.unwrap();
			assert!(!tree.has(&blobs, word).await.unwrap());
			tree.check_invariants(&blobs).await;
		}
		let stats = tree.statistics(&blobs).await.unwrap();
		assert_eq!(stats.keys_count, 0);
		assert_eq!(stats.nodes_count, 1);
	}

	#[test(tokio::test)]
	async fn test_random_insertions() {
		let blobs = MemoryBlobStore::new();
		let mut samples: Vec<usize> = (0..250).collect();
		samples.shuffle(&mut thread_rng());
		let mut tree = ChunkedBTree::new(7).unwrap();
		let mut deleted = Vec::new();
		for i in &samples {
			let key = format!("key{i:03}");
			tree = tree.set(&blobs, key.clone(), *i as i32, &mut deleted).await.unwrap();
			assert_eq!(tree.get(&blobs, &key).await.unwrap(), Some(*i as i32));
		}
		assert_eq!(tree.statistics(&blobs).await.unwrap().keys_count, 250);
		tree.check_invariants(&blobs).await;
	}

	#[test(tokio::test)]
	async fn test_flush_update_then_read_all() {
		let blobs = MemoryBlobStore::new();
		let base: ChunkedBTree<i32> = ChunkedBTree::new(32).unwrap();
		let updates: HashMap<Key, i32> =
			(0..1000).map(|i| (format!("{i:03}"), i)).collect();
		let out = base.flush(&blobs, updates, HashSet::new()).await.unwrap();
		assert!(out.deleted_handles.is_empty());
		let tree = base.update(&out);
		// Nothing is resident until keys are read back
		assert_eq!(tree.working_set_size(), 0);
		for i in 0..1000 {
			assert_eq!(tree.get(&blobs, &format!("{i:03}")).await.unwrap(), Some(i));
		}
		assert_eq!(tree.working_set_size(), 1000);
		assert_eq!(multiset(&tree.all_handles()), multiset(&out.new_handles));
		assert_eq!(tree.statistics(&blobs).await.unwrap().keys_count, 1000);
		tree.check_invariants(&blobs).await;
	}

	#[test(tokio::test)]
	async fn test_delete_absent_key_is_a_noop() {
		let blobs = MemoryBlobStore::new();
		let mut tree = ChunkedBTree::new(3).unwrap();
		tree = set(&tree, &blobs, "a", 1).await;
		tree = set(&tree, &blobs, "b", 2).await;
		let before = tree.working_set_size();
		let mut deleted = Vec::new();
		let after = tree.delete(&blobs, "missing", &mut deleted).await.unwrap();
		assert!(deleted.is_empty());
		assert_eq!(after.working_set_size(), before);
		assert_eq!(after.get(&blobs, "a").await.unwrap(), Some(1));
	}

	#[test(tokio::test)]
	async fn test_update_reconciles_the_handle_set() {
		let blobs = MemoryBlobStore::new();
		let base: ChunkedBTree<i32> = ChunkedBTree::new(4).unwrap();
		let updates: HashMap<Key, i32> = (0..100).map(|i| (format!("{i:03}"), i)).collect();
		let u1 = base.flush(&blobs, updates, HashSet::new()).await.unwrap();
		let t1 = base.update(&u1);

		// Rewrite a handful of keys through the persisted tree
		let updates: HashMap<Key, i32> = (0..5).map(|i| (format!("{i:03}"), -i)).collect();
		let u2 = t1.flush(&blobs, updates, HashSet::new()).await.unwrap();
		assert!(!u2.new_handles.is_empty());
		assert!(!u2.deleted_handles.is_empty());
		let t2 = t1.update(&u2);

		// all_handles == (old + new) - deleted, with multiplicity
		let mut expected = multiset(&t1.all_handles());
		for handle in &u2.new_handles {
			*expected.entry(handle.clone()).or_insert(0) += 1;
		}
		for handle in &u2.deleted_handles {
			match expected.get_mut(handle) {
				Some(count) if *count > 1 => *count -= 1,
				Some(_) => {
					expected.remove(handle);
				}
				None => panic!("deleted handle {handle} was never tracked"),
			}
		}
		assert_eq!(multiset(&t2.all_handles()), expected);

		for i in 0..5 {
			assert_eq!(t2.get(&blobs, &format!("{i:03}")).await.unwrap(), Some(-i));
		}
		for i in 5..100 {
			assert_eq!(t2.get(&blobs, &format!("{i:03}")).await.unwrap(), Some(i));
		}
	}

	#[test(tokio::test)]
	async fn test_evict_releases_resident_keys() {
		let blobs = MemoryBlobStore::new();
		let base: ChunkedBTree<i32> = ChunkedBTree::new(5).unwrap();
		let updates: HashMap<Key, i32> = (0..200).map(|i| (format!("{i:03}"), i)).collect();
		let out = base.flush(&blobs, updates, HashSet::new()).await.unwrap();
		let tree = base.update(&out);
		for i in 0..200 {
			tree.get(&blobs, &format!("{i:03}")).await.unwrap();
		}
		assert_eq!(tree.working_set_size(), 200);

		let reads_before = blobs.reads();
		let released = tree.evict(100);
		assert!(released >= 100);
		assert!(tree.working_set_size() <= 100);

		// Evicted chunks resolve again on demand
		for i in 0..200 {
			assert_eq!(tree.get(&blobs, &format!("{i:03}")).await.unwrap(), Some(i));
		}
		assert_eq!(tree.working_set_size(), 200);
		assert!(blobs.reads() > reads_before);

		// A zero hint releases nothing
		assert_eq!(tree.evict(0), 0);
	}

	#[test(tokio::test)]
	async fn test_deletes_splice_out_emptied_nodes() {
		let blobs = MemoryBlobStore::new();
		let mut tree = ChunkedBTree::new(3).unwrap();
		for (i, key) in ["a", "b", "c", "d", "e", "f"].iter().enumerate() {
			tree = set(&tree, &blobs, key, i as i32).await;
		}
		let before = tree.statistics(&blobs).await.unwrap();
		assert!(before.nodes_count > 1);

		let mut deleted = Vec::new();
		tree = tree.delete(&blobs, "a", &mut deleted).await.unwrap();
		tree = tree.delete(&blobs, "b", &mut deleted).await.unwrap();
		let after = tree.statistics(&blobs).await.unwrap();
		assert_eq!(after.keys_count, 4);
		assert!(after.nodes_count < before.nodes_count);
		for (key, value) in [("c", 2), ("d", 3), ("e", 4), ("f", 5)] {
			assert_eq!(tree.get(&blobs, key).await.unwrap(), Some(value));
		}
	}

	#[test(tokio::test)]
	async fn test_deleting_through_a_persisted_tree_records_chunks() {
		let blobs = MemoryBlobStore::new();
		let base: ChunkedBTree<i32> = ChunkedBTree::new(4).unwrap();
		let updates: HashMap<Key, i32> = (0..50).map(|i| (format!("{i:02}"), i)).collect();
		let out = base.flush(&blobs, updates, HashSet::new()).await.unwrap();
		let tree = base.update(&out);

		let mut deleted = Vec::new();
		let tree = tree.delete(&blobs, "25", &mut deleted).await.unwrap();
		// The rebuilt path supersedes at least the root and one leaf
		assert!(deleted.len() >= 2);
		assert_eq!(tree.get(&blobs, "25").await.unwrap(), None);
		assert_eq!(tree.get(&blobs, "24").await.unwrap(), Some(24));
	}

	#[test(tokio::test)]
	async fn test_flush_sync_packs_a_sorted_inline_leaf() {
		let blobs = MemoryBlobStore::new();
		let mut tree = ChunkedBTree::new(32).unwrap();
		tree = set(&tree, &blobs, "b", 2).await;
		tree = set(&tree, &blobs, "d", 4).await;
		let updates: HashMap<Key, i32> = [("a".to_string(), 1), ("c".to_string(), 3)].into();
		let deletes: HashSet<Key> = ["d".to_string()].into();
		let (keys, values) = tree.flush_sync(updates, deletes).unwrap();
		assert_eq!(keys, vec!["a".to_string(), "b".to_string(), "c".to_string()]);
		assert_eq!(values, vec![1, 2, 3]);
	}

	#[test(tokio::test)]
	async fn test_flush_sync_rejects_partially_loaded_trees() {
		let blobs = MemoryBlobStore::new();
		let base: ChunkedBTree<i32> = ChunkedBTree::new(4).unwrap();
		let updates: HashMap<Key, i32> = (0..10).map(|i| (format!("{i}"), i)).collect();
		let out = base.flush(&blobs, updates, HashSet::new()).await.unwrap();
		let tree = base.update(&out);
		assert!(matches!(
			tree.flush_sync(HashMap::new(), HashSet::new()),
			Err(Error::Unreachable(_))
		));
	}

	#[test(tokio::test)]
	async fn test_clear_returns_an_empty_tree_of_the_same_order() {
		let blobs = MemoryBlobStore::new();
		let mut tree = ChunkedBTree::new(3).unwrap();
		tree = set(&tree, &blobs, "a", 1).await;
		let cleared = tree.clear();
		assert_eq!(cleared.order(), 3);
		assert_eq!(cleared.working_set_size(), 0);
		assert!(cleared.all_handles().is_empty());
		assert_eq!(cleared.get(&blobs, "a").await.unwrap(), None);
	}

	#[test(tokio::test)]
	async fn test_corrupt_chunk_surfaces_as_an_error() {
		let blobs = MemoryBlobStore::new();
		let handle = blobs.upload(b"not a node".to_vec()).await.unwrap();
		let tree: ChunkedBTree<i32> =
			ChunkedBTree::load(4, handle.clone(), vec![handle]).unwrap();
		assert!(matches!(
			tree.get(&blobs, "a").await,
			Err(Error::CorruptNode {
				..
			})
		));
	}

	#[test]
	fn test_node_blob_shape() {
		let data: NodeData<i32> = NodeData::Leaf {
			keys: vec!["a".to_string(), "b".to_string()],
			values: vec![1, 2],
		};
		let bytes = bincode::serialize(&data).unwrap();
		let handle = Handle::new("test".to_string());
		match BTreeNode::<i32>::from_blob(&handle, &bytes).unwrap() {
			BTreeNode::Leaf {
				keys,
				values,
			} => {
				assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
				assert_eq!(values, vec![1, 2]);
			}
			BTreeNode::Interior {
				..
			} => panic!("expected a leaf"),
		}
	}
}

#[cfg(test)]
impl<V> ChunkedBTree<V>
where
	V: Clone + Serialize + DeserializeOwned + Send + Sync,
{
	/// Walks every node checking the structural invariants
	async fn check_invariants<S>(&self, blobs: &S)
	where
		S: BlobStore,
	{
		let mut queue = VecDeque::new();
		queue.push_back((self.root.clone(), true));
		while let Some((node, is_root)) = queue.pop_front() {
			let resolved = node.node(blobs).await.unwrap();
			match &*resolved {
				BTreeNode::Leaf {
					keys,
					values,
				} => {
					assert_eq!(keys.len(), values.len());
					assert!(is_root || !keys.is_empty(), "a non-root leaf may not be empty");
					assert!((keys.len() as u32) < self.order, "leaf fan-out reached the order");
					assert!(keys.windows(2).all(|w| w[0] < w[1]), "leaf keys must ascend");
				}
				BTreeNode::Interior {
					keys,
					children,
				} => {
					assert_eq!(keys.len(), children.len() - 1);
					assert!(!children.is_empty(), "an interior node may not be childless");
					assert!((keys.len() as u32) < self.order, "interior fan-out reached the order");
					assert!(keys.windows(2).all(|w| w[0] < w[1]), "separators must ascend");
					for child in children {
						queue.push_back((child.clone(), false));
					}
				}
			}
		}
	}
}
