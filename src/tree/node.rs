use crate::blob::{BlobStore, Handle};
use crate::err::Error;
use crate::tree::Key;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};

/// A reference to a b-tree node: either a node resident in memory that has
/// never been persisted, or a lazily resolved persisted chunk.
#[derive(Clone)]
pub(super) enum NodeRef<V> {
	Loaded(Arc<BTreeNode<V>>),
	Lazy(Arc<LazyNode<V>>),
}

impl<V> NodeRef<V> {
	pub(super) fn loaded(node: BTreeNode<V>) -> Self {
		Self::Loaded(Arc::new(node))
	}

	pub(super) fn lazy(handle: Handle) -> Self {
		Self::Lazy(Arc::new(LazyNode::new(handle)))
	}
}

impl<V> NodeRef<V>
where
	V: DeserializeOwned,
{
	/// Resolves this reference to a concrete node, fetching the chunk on
	/// first access
	pub(super) async fn node<S>(&self, blobs: &S) -> Result<Arc<BTreeNode<V>>, Error>
	where
		S: BlobStore,
	{
		match self {
			Self::Loaded(node) => Ok(Arc::clone(node)),
			Self::Lazy(lazy) => lazy.resolve(blobs).await,
		}
	}
}

/// One b-tree node. Keys within a node are strictly increasing; an interior
/// node holds exactly `children.len() - 1` keys, and `keys[i]` is the
/// minimum key of `children[i + 1]`.
pub(super) enum BTreeNode<V> {
	Leaf {
		keys: Vec<Key>,
		values: Vec<V>,
	},
	Interior {
		keys: Vec<Key>,
		children: Vec<NodeRef<V>>,
	},
}

impl<V> BTreeNode<V> {
	pub(super) fn empty_leaf() -> Self {
		Self::Leaf {
			keys: Vec::new(),
			values: Vec::new(),
		}
	}
}

impl<V> BTreeNode<V>
where
	V: DeserializeOwned,
{
	/// Decodes a persisted chunk. The shape tag distinguishes the two
	/// variants; interior children hydrate as unresolved lazy references.
	pub(super) fn from_blob(handle: &Handle, bytes: &[u8]) -> Result<Self, Error> {
		let data: NodeData<V> =
			bincode::deserialize(bytes).map_err(|_| Error::CorruptNode {
				handle: handle.to_string(),
			})?;
		Ok(match data {
			NodeData::Leaf {
				keys,
				values,
			} => Self::Leaf {
				keys,
				values,
			},
			NodeData::Interior {
				keys,
				children,
			} => Self::Interior {
				keys,
				children: children.into_iter().map(NodeRef::lazy).collect(),
			},
		})
	}
}

/// The persisted form of a node. A leaf carries its values inline; an
/// interior node carries the handles of its children.
#[derive(Serialize, Deserialize)]
pub(super) enum NodeData<V> {
	Leaf {
		keys: Vec<Key>,
		values: Vec<V>,
	},
	Interior {
		keys: Vec<Key>,
		children: Vec<Handle>,
	},
}

/// A persisted node addressed by its handle, resolved to a concrete node on
/// first access. Eviction clears the slot and reverts the wrapper to
/// handle-only; the lock is never held across a suspension point.
pub(super) struct LazyNode<V> {
	handle: Handle,
	slot: RwLock<Option<Arc<BTreeNode<V>>>>,
}

impl<V> LazyNode<V> {
	pub(super) fn new(handle: Handle) -> Self {
		Self {
			handle,
			slot: RwLock::new(None),
		}
	}

	pub(super) fn handle(&self) -> &Handle {
		&self.handle
	}

	/// The resolved node, if this wrapper is currently materialized
	pub(super) fn cached(&self) -> Option<Arc<BTreeNode<V>>> {
		self.slot.read().expect("lazy node lock poisoned").clone()
	}

	/// Drops the resolved node, reverting the wrapper to handle-only
	pub(super) fn clear_slot(&self) {
		self.slot.write().expect("lazy node lock poisoned").take();
	}
}

impl<V> LazyNode<V>
where
	V: DeserializeOwned,
{
	pub(super) async fn resolve<S>(&self, blobs: &S) -> Result<Arc<BTreeNode<V>>, Error>
	where
		S: BlobStore,
	{
		if let Some(node) = self.cached() {
			return Ok(node);
		}
		let bytes = blobs.resolve(&self.handle).await?;
		let node = Arc::new(BTreeNode::from_blob(&self.handle, &bytes)?);
		let mut slot = self.slot.write().expect("lazy node lock poisoned");
		Ok(slot.get_or_insert_with(|| node).clone())
	}
}

/// The index of the child subtree a key routes to: the first position
/// whose separator is strictly greater than the key, or the last child.
pub(super) fn child_index(keys: &[Key], key: &str) -> usize {
	keys.iter().position(|k| key < k.as_str()).unwrap_or(keys.len())
}
