// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Structs and traits which allow a channel to interact with the blockchain and with durable
//! storage.

use bitcoin::script::{Script, ScriptBuf};
use bitcoin::transaction::{OutPoint, Transaction};
use bitcoin::Amount;

use crate::chain::channelmonitor::ChannelMonitorUpdate;
use crate::ln::chan_utils::CounterpartyCommitmentSecrets;
use crate::ln::types::ChannelId;

#[allow(unused_imports)]
use crate::prelude::*;

pub mod chaininterface;
pub mod channelmonitor;
pub mod justice;

/// Script verification flags every transaction we construct must pass: P2SH, DERSIG,
/// NULLDUMMY, CHECKLOCKTIMEVERIFY, CHECKSEQUENCEVERIFY and WITNESS.
pub const STANDARD_SCRIPT_VERIFY_FLAGS: u32 = (1 << 0) | (1 << 2) | (1 << 4) | (1 << 9) | (1 << 10) | (1 << 11);

/// A script interpreter, used to check witnesses before anything is handed to a
/// [`BroadcasterInterface`].
///
/// [`BroadcasterInterface`]: chaininterface::BroadcasterInterface
pub trait ScriptVerifier {
	/// Checks that input `input_index` of `tx` satisfies `script_pubkey` holding `amount`, under
	/// the given script verification `flags`.
	fn verify_script(
		&self, script_pubkey: &Script, amount: Amount, tx: &Transaction, input_index: usize, flags: u32,
	) -> Result<(), ()>;
}

/// Supplies the per-commitment secret our counterparty revealed for a given commitment.
///
/// If the secret can't be produced, a breach of that commitment can't be remedied.
pub trait RevocationSecretSource {
	/// Returns the secret for the backwards-counting `commitment_number`, if it was revealed.
	fn get_secret(&self, commitment_number: u64) -> Option<[u8; 32]>;
}

impl RevocationSecretSource for CounterpartyCommitmentSecrets {
	fn get_secret(&self, commitment_number: u64) -> Option<[u8; 32]> {
		CounterpartyCommitmentSecrets::get_secret(self, commitment_number)
	}
}

/// A transaction output watched by a [`Filter`] for spending transactions.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct WatchedOutput {
	/// The outpoint of the output.
	pub outpoint: OutPoint,
	/// Spending condition of the transaction output.
	pub script_pubkey: ScriptBuf,
}

/// The `Filter` trait defines behavior for indicating chain activity of interest pertaining to
/// channels.
///
/// This is useful in order to have a chain-watch service only tell us about transactions which
/// could be a commitment (or breach) of one of our channels.
pub trait Filter {
	/// Registers interest in spends of a transaction output.
	///
	/// The funding output of every channel is registered once funding is negotiated, so any
	/// commitment transaction, current or revoked, is reported.
	fn register_output(&self, output: WatchedOutput);
}

/// An enum representing the status of a channel monitor update persistence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelMonitorUpdateStatus {
	/// The update has been durably persisted and any message referencing it may be sent.
	Completed,
	/// The update could not be persisted. Messages referencing it must never be sent, and the
	/// channel should be closed from the latest state which *was* persisted.
	UnrecoverableError,
}

/// Durably stores the updates a channel generates.
///
/// Every [`ChannelMonitorUpdate`] is persisted before any message depending on it is returned to
/// the caller, and the update recording our revocation is persisted before the revocation secret
/// leaves the channel.
pub trait Persist {
	/// Persists `update` for the channel with the given `channel_id`.
	fn persist_channel_update(
		&self, channel_id: ChannelId, update: &ChannelMonitorUpdate,
	) -> ChannelMonitorUpdateStatus;
}

/// A counterparty commitment transaction observed on chain, as delivered by a chain-watch
/// service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BreachedCommitment {
	/// The confirmed commitment transaction.
	pub tx: Transaction,
	/// The height of the block which confirmed [`Self::tx`].
	pub confirmation_height: u32,
}
