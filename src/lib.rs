//! A collaborative partial map: a distributed key/value container whose
//! working set is kept small in memory while the authoritative dataset
//! lives as a content-addressed, chunked b-tree in an external blob store.
//!
//! Multiple clients apply edits concurrently through a totally ordered op
//! stream; one elected client periodically compacts the outstanding log
//! into a new tree snapshot that the other clients adopt lazily. The host
//! runtime that sequences ops, the blob service that stores chunks, and
//! leader election transport are consumed through the contracts in
//! [`map::Host`] and [`blob::BlobStore`].

#[macro_use]
extern crate tracing;

#[macro_use]
mod mac;

pub mod blob;
pub mod cnf;
pub mod err;
pub mod map;
pub mod state;
pub mod tree;
