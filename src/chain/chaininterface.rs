// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Traits and constants which allow interfacing with the network broadcast of transactions.
//!
//! Includes traits for broadcasting transactions as well as the fee-rate floor every
//! transaction built by this crate respects.

use bitcoin::transaction::Transaction;

/// The minimum feerate we are allowed to send, as specify by LND's implementation.
pub const FEERATE_FLOOR_SATS_PER_KW: u32 = 253;

/// An interface to send a transaction to the Bitcoin network.
///
/// Broadcasting is fire-and-forget: implementations must not block on the network, and failures
/// to relay are their own business to retry.
pub trait BroadcasterInterface {
	/// Sends a list of transactions out to (hopefully) be mined.
	///
	/// Transactions are given in dependency order, so any transaction spending an output of
	/// another appears after it.
	fn broadcast_transactions(&self, txs: &[&Transaction]);
}
