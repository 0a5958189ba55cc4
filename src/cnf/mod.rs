use once_cell::sync::Lazy;

/// The maximum number of entries a b-tree node may hold before it splits.
/// Must be at least 2.
pub static BTREE_ORDER: Lazy<u32> = lazy_env_parse!("HIVEMAP_BTREE_ORDER", u32, 32);

/// Soft upper bound on the number of keys kept resident in memory across
/// the sequenced cache and the loaded portion of the chunked tree.
pub static CACHE_SIZE_HINT: Lazy<usize> =
	lazy_env_parse!("HIVEMAP_CACHE_SIZE_HINT", usize, 5000);

/// Number of unflushed sequenced changes the leader accumulates before it
/// compacts them into a new persisted tree root.
pub static FLUSH_THRESHOLD: Lazy<usize> =
	lazy_env_parse!("HIVEMAP_FLUSH_THRESHOLD", usize, 1000);
