// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Various wrapper types (most around 32-byte arrays) for use in lightning.

use bitcoin::hashes::sha256::Hash as Sha256;
use bitcoin::hashes::Hash as _;
use bitcoin::hex::DisplayHex;
use bitcoin::OutPoint;

use core::fmt;

/// A unique 32-byte identifier for a channel.
///
/// Before the funding transaction is known the opener picks a random temporary id. Once the
/// funding outpoint is known, the id is the funding txid XOR'd with the output index in its
/// last two bytes.
#[derive(Hash, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ChannelId(pub [u8; 32]);

impl ChannelId {
	/// Create the funding-outpoint based channel id.
	pub fn v1_from_funding_outpoint(outpoint: OutPoint) -> Self {
		let mut res = outpoint.txid.to_byte_array();
		res[30] ^= ((outpoint.vout >> 8) & 0xff) as u8;
		res[31] ^= ((outpoint.vout >> 0) & 0xff) as u8;
		Self(res)
	}

	/// Create a temporary channel id from the given entropy.
	pub fn temporary_from_entropy(entropy: [u8; 32]) -> Self {
		Self(entropy)
	}

	/// Generic constructor; create a new channel ID from the provided data.
	pub fn from_bytes(data: [u8; 32]) -> Self {
		Self(data)
	}

	/// Check whether ID is consisting of all zeros (uninitialized)
	pub fn is_zero(&self) -> bool {
		self.0[..] == [0; 32]
	}
}

impl fmt::Display for ChannelId {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{}", self.0[..].as_hex())
	}
}

impl fmt::Debug for ChannelId {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "ChannelId({})", self.0[..].as_hex())
	}
}

/// The payment hash is the hash of the [`PaymentPreimage`] which is the value used to lock
/// funds in an HTLC.
#[derive(Hash, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct PaymentHash(pub [u8; 32]);

impl fmt::Display for PaymentHash {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{}", self.0[..].as_hex())
	}
}

/// The payment preimage is the "secret key" which is used to claim the funds of an HTLC on-chain
/// or in a lightning channel.
#[derive(Hash, Copy, Clone, PartialEq, Eq, Debug)]
pub struct PaymentPreimage(pub [u8; 32]);

impl fmt::Display for PaymentPreimage {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{}", self.0[..].as_hex())
	}
}

impl From<PaymentPreimage> for PaymentHash {
	fn from(value: PaymentPreimage) -> Self {
		PaymentHash(Sha256::hash(&value.0).to_byte_array())
	}
}
