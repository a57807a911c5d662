// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! With `std` we use the standard library's `HashMap`. Without it we fall back to `hashbrown`
//! keyed with a `SipHasher` which `possiblyrandom` seeds whenever the platform offers entropy, so
//! peer-influenced keys (HTLC ids, outpoints) can't be used to degrade lookups.

#[cfg(feature = "std")]
mod tables {
	pub use std::collections::{HashMap, HashSet};

	/// Builds a new [`HashMap`].
	pub fn new_hash_map<K, V>() -> HashMap<K, V> {
		HashMap::new()
	}
	/// Builds a new [`HashMap`] with the given capacity.
	pub fn hash_map_with_capacity<K, V>(cap: usize) -> HashMap<K, V> {
		HashMap::with_capacity(cap)
	}

	/// Builds a new [`HashSet`].
	pub fn new_hash_set<K>() -> HashSet<K> {
		HashSet::new()
	}
}

#[cfg(not(feature = "std"))]
mod tables {
	#![allow(deprecated)] // hash::SipHasher was deprecated in favor of something only in std.
	use core::hash::{BuildHasher, SipHasher};

	#[derive(Clone, Copy)]
	/// A [`BuildHasher`] which uses `possiblyrandom` to opportunistically randomize its keys.
	pub struct RandomState {
		k0: u64,
		k1: u64,
	}

	impl RandomState {
		/// Constructs a new [`RandomState`], random if the target platform allows it.
		pub fn new() -> RandomState {
			let mut keys = [0; 16];
			possiblyrandom::getpossiblyrandom(&mut keys);

			let mut k0_bytes = [0; 8];
			let mut k1_bytes = [0; 8];
			k0_bytes.copy_from_slice(&keys[..8]);
			k1_bytes.copy_from_slice(&keys[8..]);
			RandomState { k0: u64::from_le_bytes(k0_bytes), k1: u64::from_le_bytes(k1_bytes) }
		}
	}

	impl Default for RandomState {
		fn default() -> RandomState {
			RandomState::new()
		}
	}

	impl BuildHasher for RandomState {
		type Hasher = SipHasher;
		fn build_hasher(&self) -> SipHasher {
			SipHasher::new_with_keys(self.k0, self.k1)
		}
	}

	/// The HashMap type used in this crate.
	pub type HashMap<K, V> = hashbrown::HashMap<K, V, RandomState>;

	/// Builds a new [`HashMap`].
	pub fn new_hash_map<K, V>() -> HashMap<K, V> {
		HashMap::with_hasher(RandomState::new())
	}
	/// Builds a new [`HashMap`] with the given capacity.
	pub fn hash_map_with_capacity<K, V>(cap: usize) -> HashMap<K, V> {
		HashMap::with_capacity_and_hasher(cap, RandomState::new())
	}

	/// The HashSet type used in this crate.
	pub type HashSet<K> = hashbrown::HashSet<K, RandomState>;

	/// Builds a new [`HashSet`].
	pub fn new_hash_set<K>() -> HashSet<K> {
		HashSet::with_hasher(RandomState::new())
	}
}

pub use tables::*;
