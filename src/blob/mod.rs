//! The module defining the blob service contract.
//!
//! Every b-tree chunk and every summary blob is persisted through the
//! [`BlobStore`] trait. The core never inspects handle contents: a handle is
//! created by uploading serialized bytes, resolved back to those bytes, and
//! compared for deduplicated bookkeeping. Handle equality implies content
//! equality.

use crate::err::Error;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt::{self, Debug, Display, Formatter};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

/// The raw bytes of a persisted blob
pub type Val = Vec<u8>;

/// An opaque, comparable identifier for a persisted blob
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Handle(String);

impl Handle {
	pub(crate) fn new(id: String) -> Self {
		Self(id)
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl Display for Handle {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl Debug for Handle {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		// The full content id is noisy in traces
		write!(f, "Handle({:.8})", self.0)
	}
}

/// The contract of the external blob service.
///
/// Uploads and resolutions are the only suspension points of the core, so
/// the futures are boxed to keep callers object-safe and `Send`.
pub trait BlobStore: Send + Sync {
	/// Persists the given bytes and returns the handle addressing them
	fn upload(&self, bytes: Val) -> BoxFuture<'_, Result<Handle, Error>>;
	/// Resolves a handle back to the bytes it addresses
	fn resolve<'a>(&'a self, handle: &'a Handle) -> BoxFuture<'a, Result<Val, Error>>;
}

/// An in-process, content-addressed blob store.
///
/// Blobs are addressed by the hex digest of their content, so identical
/// chunks deduplicate. The store is cheaply clonable and shared, and it
/// counts uploads and resolutions so tests can observe cache behaviour.
#[derive(Clone, Default)]
pub struct MemoryBlobStore(Arc<Inner>);

#[derive(Default)]
struct Inner {
	blobs: RwLock<HashMap<Handle, Val>>,
	reads: AtomicUsize,
	writes: AtomicUsize,
}

impl MemoryBlobStore {
	pub fn new() -> Self {
		Self::default()
	}

	/// The number of resolutions served so far
	pub fn reads(&self) -> usize {
		self.0.reads.load(Ordering::Relaxed)
	}

	/// The number of uploads stored so far
	pub fn writes(&self) -> usize {
		self.0.writes.load(Ordering::Relaxed)
	}

	/// The number of distinct blobs currently stored
	pub fn len(&self) -> usize {
		self.0.blobs.read().expect("blob store lock poisoned").len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

impl BlobStore for MemoryBlobStore {
	fn upload(&self, bytes: Val) -> BoxFuture<'_, Result<Handle, Error>> {
		Box::pin(async move {
			let handle = Handle::new(hex::encode(Sha256::digest(&bytes)));
			self.0.writes.fetch_add(1, Ordering::Relaxed);
			let mut blobs = self.0.blobs.write().expect("blob store lock poisoned");
			blobs.insert(handle.clone(), bytes);
			Ok(handle)
		})
	}

	fn resolve<'a>(&'a self, handle: &'a Handle) -> BoxFuture<'a, Result<Val, Error>> {
		Box::pin(async move {
			self.0.reads.fetch_add(1, Ordering::Relaxed);
			let blobs = self.0.blobs.read().expect("blob store lock poisoned");
			blobs.get(handle).cloned().ok_or_else(|| Error::StorageUnavailable {
				message: format!("no blob stored for handle {handle}"),
			})
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn test_upload_resolve_roundtrip() {
		let store = MemoryBlobStore::new();
		let handle = store.upload(b"hello".to_vec()).await.unwrap();
		assert_eq!(store.resolve(&handle).await.unwrap(), b"hello".to_vec());
		assert_eq!(store.reads(), 1);
		assert_eq!(store.writes(), 1);
	}

	#[tokio::test]
	async fn test_content_addressing_deduplicates() {
		let store = MemoryBlobStore::new();
		let h1 = store.upload(b"same".to_vec()).await.unwrap();
		let h2 = store.upload(b"same".to_vec()).await.unwrap();
		let h3 = store.upload(b"other".to_vec()).await.unwrap();
		assert_eq!(h1, h2);
		assert_ne!(h1, h3);
		assert_eq!(store.len(), 2);
	}

	#[tokio::test]
	async fn test_missing_handle_is_unavailable() {
		let store = MemoryBlobStore::new();
		let handle = Handle::new("no-such-blob".to_string());
		match store.resolve(&handle).await {
			Err(Error::StorageUnavailable {
				..
			}) => {}
			other => panic!("expected StorageUnavailable, got {other:?}"),
		}
	}
}
