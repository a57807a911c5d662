// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The updates a [`Channel`] hands to its [`Persist`] implementation.
//!
//! Each [`ChannelMonitorUpdate`] is the durable record of one state transition. Applied in
//! `update_id` order they are enough to rebuild everything needed to close the channel on chain
//! or punish a revoked counterparty commitment.
//!
//! [`Channel`]: crate::ln::channel::Channel
//! [`Persist`]: crate::chain::Persist

use bitcoin::secp256k1::PublicKey;
use bitcoin::Txid;

use crate::ln::chan_utils::{ChannelTransactionParameters, HTLCOutputInCommitment, HolderCommitmentTransaction};
use crate::ln::types::ChannelId;

#[allow(unused_imports)]
use crate::prelude::*;

/// An update generated by the underlying channel itself which contains some new information the
/// persistence layer should be made aware of.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelMonitorUpdate {
	/// The sequence number of this update. Updates *must* be persisted in order, starting at 1
	/// for the first update of a channel.
	pub update_id: u64,
	/// The channel this update applies to.
	pub channel_id: ChannelId,
	/// The steps making up this update, in the order they happened.
	pub updates: Vec<ChannelMonitorUpdateStep>,
}

/// One piece of new channel state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelMonitorUpdateStep {
	/// The static channel parameters, recorded once funding has been negotiated.
	ChannelFunded {
		/// Both parties' base points, delays and the funding outpoint.
		channel_parameters: ChannelTransactionParameters,
	},
	/// A new holder commitment, signed by our counterparty. This is what we broadcast if we
	/// force-close.
	LatestHolderCommitmentTxInfo {
		/// The commitment together with our counterparty's signatures.
		commitment_tx: HolderCommitmentTransaction,
	},
	/// A new counterparty commitment we signed. If it is ever revoked and then broadcast, this
	/// is what a justice transaction is built from.
	LatestCounterpartyCommitmentTxInfo {
		/// The txid of the commitment.
		commitment_txid: Txid,
		/// The non-dust HTLC outputs of the commitment, in output order.
		htlc_outputs: Vec<HTLCOutputInCommitment>,
		/// The backwards-counting commitment number.
		commitment_number: u64,
		/// Our counterparty's per-commitment point for this commitment.
		their_per_commitment_point: PublicKey,
		/// The value of our counterparty's `to_local` output, zero if trimmed.
		to_broadcaster_value_sat: u64,
		/// The value of our `to_remote` output, zero if trimmed.
		to_countersignatory_value_sat: u64,
		/// The feerate the commitment was built at.
		feerate_per_kw: u32,
	},
	/// Our counterparty revoked one of their commitments.
	CommitmentSecret {
		/// The backwards-counting commitment number which was revoked.
		idx: u64,
		/// The per-commitment secret.
		secret: [u8; 32],
	},
	/// We are about to reveal the secret for one of our own commitments. Once this is persisted
	/// we must never broadcast that commitment.
	HolderRevocation {
		/// The backwards-counting commitment number being revoked.
		idx: u64,
	},
	/// The channel was closed.
	ChannelForceClosed {
		/// Whether the latest holder commitment should be broadcast. It isn't when a commitment
		/// is already known to be confirmed.
		should_broadcast: bool,
	},
}

impl ChannelMonitorUpdate {
	/// Whether this update records one of our revocations, and so must be durable before the
	/// secret is sent.
	pub fn reveals_holder_secret(&self) -> bool {
		self.updates.iter().any(|step| matches!(step, ChannelMonitorUpdateStep::HolderRevocation { .. }))
	}
}
