// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

#![crate_name = "lightning_channel"]

//! Rust-Lightning-style channel core: the commitment/revocation state machine for a single
//! bilateral payment channel, the key and script machinery it is built on, and the watchtower-side
//! assembly of justice transactions sweeping a revoked commitment.
//!
//! The crate does no I/O. Chain access, script interpretation, signing and
//! persistence are all reached through the narrow traits in [`chain`] and [`sign`], so a
//! [`ln::channel_handle::ChannelHandle`] can be driven by any runtime.
//!
//! Most users want to start with [`ln::channel_handle::ChannelHandle`] for the channel side and
//! [`chain::justice::JusticeAssembler`] for the watchtower side.

#![cfg_attr(not(any(test, feature = "_test_utils")), deny(missing_docs))]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(rustdoc::private_intra_doc_links)]
#![forbid(unsafe_code)]
#![cfg_attr(not(any(test, feature = "std", feature = "_test_utils")), no_std)]

#[cfg(any(test, feature = "std"))]
extern crate core;

#[macro_use]
extern crate alloc;

pub extern crate bitcoin;

#[cfg(any(test, feature = "_test_utils"))]
extern crate regex;

#[macro_use]
pub mod util;
pub mod chain;
pub mod ln;
pub mod sign;

pub(crate) mod crypto;

mod sync;

#[allow(unused_imports)]
mod prelude {
	pub use alloc::{boxed::Box, string::String, vec, vec::Vec};
	pub use alloc::borrow::ToOwned;
	pub use alloc::string::ToString;

	pub use crate::util::hash_tables::*;
}
