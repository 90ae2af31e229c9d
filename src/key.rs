//! Deterministic serialization of fetch arguments into cache keys.
//!
//! Every cache entry is addressed by a string key derived from the fetch arguments via [`encode`]. The encoding is
//! plain JSON, which is stable for structurally equal values and trivially distinguishes a bare scalar from a
//! one-element tuple (`5` vs `[5]`). The engine treats keys as opaque; [`decode`] recovers the original arguments
//! when a fetch is actually dispatched.

use serde::{Serialize, de::DeserializeOwned};

/// Serializes fetch arguments into a deterministic string key.
///
/// Two structurally equal values always produce the same key. Arguments are restricted to JSON-expressible values;
/// anything `serde_json` cannot represent (e.g. a map with non-string keys) is rejected.
pub fn encode<A: Serialize>(args: &A) -> Result<String, serde_json::Error> {
	serde_json::to_string(args)
}

/// Recovers the fetch arguments from a key produced by [`encode`].
pub fn decode<A: DeserializeOwned>(key: &str) -> Result<A, serde_json::Error> {
	serde_json::from_str(key)
}
