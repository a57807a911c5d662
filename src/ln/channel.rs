// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The commitment/revocation state machine of a single channel.
//!
//! A [`Channel`] tracks both parties' commitment transactions, every HTLC in flight and the
//! revocation window between them. Each state transition which must survive a restart is
//! returned as a [`ChannelMonitorUpdate`] alongside the message to send, and the caller must
//! persist the former before sending the latter. [`ChannelHandle`] does this for you.
//!
//! [`ChannelHandle`]: crate::ln::channel_handle::ChannelHandle

use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::secp256k1::{self, PublicKey, Secp256k1, SecretKey};
use bitcoin::transaction::{OutPoint, Transaction};
use bitcoin::Amount;

use crate::chain::chaininterface::FEERATE_FLOOR_SATS_PER_KW;
use crate::chain::channelmonitor::{ChannelMonitorUpdate, ChannelMonitorUpdateStep};
use crate::crypto::utils::p2wsh_sighash;
use crate::ln::chan_utils::{
	commit_tx_fee_sat, htlc_countersignatory_sighash_type, second_stage_tx_fee_sat,
	ChannelPublicKeys, ChannelTransactionParameters, CommitmentTransaction,
	CounterpartyCommitmentSecrets, HTLCOutputInCommitment, HolderCommitmentTransaction,
	TxCreationKeys,
};
use crate::ln::msgs;
use crate::ln::types::{ChannelId, PaymentHash, PaymentPreimage};
use crate::sign::ecdsa::EcdsaChannelSigner;
use crate::util::config::{ChannelConfig, ChannelHandshakeLimits, UserConfig};
use crate::util::errors::APIError;
use crate::util::logger::{Logger, WithContext};

#[allow(unused_imports)]
use crate::prelude::*;

use core::ops::Deref;
use core::{cmp, fmt, mem};

/// The commitment number of the first commitment transaction of a channel. Commitment numbers
/// count down from here.
pub const INITIAL_COMMITMENT_NUMBER: u64 = (1 << 48) - 1;

/// The value of each of the two anchor outputs of an anchor channel's commitment transaction.
pub const ANCHOR_OUTPUT_VALUE_SATOSHI: u64 = 330;

/// The smallest dust limit either side may announce. Below this a P2WSH output with the
/// commitment's largest script would be non-standard.
pub const MIN_CHAN_DUST_LIMIT_SATOSHIS: u64 = 354;

/// The longest `to_self_delay` we accept by default. Two weeks of blocks.
pub const MAX_LOCAL_BREAKDOWN_TIMEOUT: u16 = 2 * 6 * 24 * 7;

/// Values at or above this are interpreted as timestamps by `OP_CHECKLOCKTIMEVERIFY`.
const LOCKTIME_THRESHOLD: u32 = 500_000_000;

/// The lifecycle of a [`Channel`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
	/// Parameters and funding are being negotiated, or `channel_ready` has not yet been exchanged
	/// in both directions.
	Opening,
	/// Both sides have exchanged `channel_ready` and HTLCs may be added.
	Active,
	/// We force-closed and our commitment transaction is waiting to confirm.
	Closing,
	/// The channel is closed on chain.
	Closed,
}

/// An error which resulted from processing a message or user request.
#[derive(Clone, PartialEq, Eq)]
pub enum ChannelError {
	/// The request was refused but the channel is unchanged and may continue operating.
	Ignore(APIError),
	/// Our counterparty's signature on our new commitment transaction doesn't verify.
	InvalidCommitSig,
	/// One of our counterparty's HTLC signatures doesn't verify. No part of the commitment was
	/// accepted.
	InvalidHTLCSig {
		/// The position of the failing signature within the `commitment_signed` message.
		htlc_index: usize,
	},
	/// Our counterparty revealed a per-commitment secret which doesn't match what we expected.
	InvalidRevocation(String),
	/// Our counterparty violated the protocol and the channel must be force-closed.
	Close(String),
}

impl ChannelError {
	pub(crate) fn close(err: String) -> Self {
		ChannelError::Close(err)
	}

	/// Whether the channel can no longer be used and must be force-closed.
	pub fn is_fatal(&self) -> bool {
		!matches!(self, ChannelError::Ignore(_))
	}
}

impl fmt::Debug for ChannelError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			&ChannelError::Ignore(ref e) => write!(f, "Ignore: {}", e),
			&ChannelError::InvalidCommitSig => f.write_str("Invalid commitment tx signature from peer"),
			&ChannelError::InvalidHTLCSig { htlc_index } => {
				write!(f, "Invalid HTLC tx signature from peer at index {}", htlc_index)
			},
			&ChannelError::InvalidRevocation(ref e) => write!(f, "Invalid revocation: {}", e),
			&ChannelError::Close(ref e) => write!(f, "Close: {}", e),
		}
	}
}

impl fmt::Display for ChannelError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		fmt::Debug::fmt(self, f)
	}
}

macro_rules! secp_check {
	($res: expr, $err: expr) => {
		match $res {
			Ok(thing) => thing,
			Err(_) => return Err($err),
		}
	};
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum InboundHTLCRemovalReason {
	Fail(Vec<u8>),
	Fulfill(PaymentPreimage),
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum InboundHTLCState {
	/// Offered by remote, to be included in next local commitment tx. I.e., the remote sent an
	/// update_add_htlc message for this HTLC.
	RemoteAnnounced,
	/// Included in a received commitment_signed message, but the remote side hasn't yet revoked
	/// their previous state, which we need them to do before we accept this HTLC.
	/// We also have not yet included this HTLC in a commitment_signed message.
	AwaitingRemoteRevokeToAnnounce,
	/// Included in a received commitment_signed message and the remote side has revoked their
	/// previous state, but we haven't yet sent a commitment_signed including this HTLC.
	///
	/// Implies that we need to send a commitment_signed before the HTLC is committed.
	AwaitingAnnouncedRemoteRevoke,
	/// Irrevocably included in both commitment transactions.
	Committed,
	/// Removed by us and a new commitment_signed was sent (if we were AwaitingRemoteRevoke when we
	/// created it we would have put it in the holding cell instead). When they next revoke_and_ack
	/// we'll drop it.
	/// Note that we have to keep an eye on the HTLC until we've received a broadcastable
	/// commitment transaction without it as otherwise we'll have to force-close the channel to
	/// claim it before the timeout (obviously doesn't apply to revoked HTLCs that we can't claim
	/// anyway). That said, ChannelMonitor does this for us (see
	/// ChannelMonitor::should_claim_htlcs_on_chain) so we actually remove the HTLC from our own
	/// local state before then, once we're sure that the next commitment_signed and
	/// ChannelMonitor::provide_latest_local_commitment_tx will not include this HTLC.
	LocalRemoved(InboundHTLCRemovalReason),
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct InboundHTLCOutput {
	htlc_id: u64,
	amount_msat: u64,
	cltv_expiry: u32,
	payment_hash: PaymentHash,
	state: InboundHTLCState,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum OutboundHTLCOutcome {
	Success(PaymentPreimage),
	Failure(Vec<u8>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum OutboundHTLCState {
	/// Added by us and included in a commitment_signed (if we were AwaitingRemoteRevoke when we
	/// created it we would have put it in the holding cell instead). When they next revoke_and_ack
	/// we will promote to Committed (note that they may not accept it until the next time we
	/// revoke, but we don't really care about that).
	LocalAnnounced,
	Committed,
	/// Remote removed this (outbound) HTLC. We're waiting on their commitment_signed to finalize
	/// the change (though they'll need to revoke before we fail the payment).
	RemoteRemoved(OutboundHTLCOutcome),
	/// Remote removed this and sent a commitment_signed (implying we've revoke_and_ack'ed it), but
	/// the remote side hasn't yet revoked their previous state, which we need them to do before we
	/// can do any backwards failing. Implies AwaitingRemoteRevoke.
	/// We also have not yet removed this HTLC in a commitment_signed message, and are waiting on a
	/// remote revoke_and_ack on a previous state before we can do so.
	AwaitingRemoteRevokeToRemove(OutboundHTLCOutcome),
	/// Remote removed this and sent a commitment_signed (implying we've revoke_and_ack'ed it), but
	/// the remote side hasn't yet revoked their previous state, which we need them to do before we
	/// can do any backwards failing. Implies AwaitingRemoteRevoke.
	/// We have removed this HTLC in our latest commitment_signed and are now just waiting on a
	/// revoke_and_ack to drop completely.
	AwaitingRemovedRemoteRevoke(OutboundHTLCOutcome),
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct OutboundHTLCOutput {
	htlc_id: u64,
	amount_msat: u64,
	cltv_expiry: u32,
	payment_hash: PaymentHash,
	state: OutboundHTLCState,
}

/// See AwaitingRemoteRevoke ChannelState for more info
#[derive(Clone, Debug, PartialEq, Eq)]
enum HTLCUpdateAwaitingACK {
	AddHTLC {
		amount_msat: u64,
		cltv_expiry: u32,
		payment_hash: PaymentHash,
	},
	ClaimHTLC {
		payment_preimage: PaymentPreimage,
		htlc_id: u64,
	},
	FailHTLC {
		htlc_id: u64,
		reason: Vec<u8>,
	},
}

/// One side's commitment transaction together with the balances it was built from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Commitment {
	/// The height of this commitment, counting up from zero for the commitment built at funding.
	pub height: u64,
	/// Our balance, excluding HTLCs and before the commitment fee is taken.
	pub holder_balance_msat: u64,
	/// Our counterparty's balance, excluding HTLCs and before the commitment fee is taken.
	pub counterparty_balance_msat: u64,
	/// Everything the commitment pays to miners, including value trimmed as dust.
	pub fee_sat: u64,
	/// The commitment transaction.
	pub tx: CommitmentTransaction,
	/// Our counterparty's signature, only present on our own commitments.
	pub counterparty_sig: Option<Signature>,
	/// Our counterparty's HTLC signatures, in output order, only present on our own commitments.
	pub counterparty_htlc_sigs: Vec<Signature>,
	/// Every HTLC in the commitment. Those with an output come first, in output order, followed
	/// by the ones trimmed as dust.
	pub htlcs: Vec<HTLCOutputInCommitment>,
}

impl Commitment {
	/// The backwards-counting commitment number.
	pub fn commitment_number(&self) -> u64 {
		self.tx.commitment_number()
	}
}

struct CommitmentStats {
	tx: CommitmentTransaction,
	total_fee_sat: u64,
	htlcs_included: Vec<HTLCOutputInCommitment>,
	local_balance_msat: u64,
	remote_balance_msat: u64,
}

/// What we can currently send and receive over a channel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AvailableBalances {
	/// Our balance, less any HTLCs we have offered which haven't yet been resolved.
	pub balance_msat: u64,
	/// What our counterparty could send us, ignoring fees.
	pub inbound_capacity_msat: u64,
	/// What we could send in total, ignoring fees and HTLC count limits.
	pub outbound_capacity_msat: u64,
	/// The largest HTLC we could offer right now.
	pub next_outbound_htlc_limit_msat: u64,
	/// The smallest HTLC our counterparty accepts which isn't dust on both commitments.
	pub next_outbound_htlc_minimum_msat: u64,
}

/// An inbound HTLC which was irrevocably committed by a `revoke_and_ack`, and may now be claimed
/// or failed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommittedHTLC {
	/// The counterparty-assigned HTLC id.
	pub htlc_id: u64,
	/// The HTLC value.
	pub amount_msat: u64,
	/// The payment hash the HTLC is locked to.
	pub payment_hash: PaymentHash,
	/// The absolute block height at which the HTLC times out.
	pub cltv_expiry: u32,
}

/// Everything that changed when our counterparty revoked a commitment.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RevokeAndACKResult {
	/// Inbound HTLCs now irrevocably committed.
	pub accepted_htlcs: Vec<CommittedHTLC>,
	/// Outbound HTLCs our counterparty claimed, now irrevocably removed.
	pub claimed_htlcs: Vec<(u64, PaymentPreimage)>,
	/// Outbound HTLCs our counterparty failed, now irrevocably removed.
	pub failed_htlcs: Vec<(u64, Vec<u8>)>,
	/// update_add_htlc messages freed from the holding cell.
	pub update_add_htlcs: Vec<msgs::UpdateAddHTLC>,
	/// update_fulfill_htlc messages freed from the holding cell.
	pub update_fulfill_htlcs: Vec<msgs::UpdateFulfillHTLC>,
	/// update_fail_htlc messages freed from the holding cell.
	pub update_fail_htlcs: Vec<msgs::UpdateFailHTLC>,
	/// Holding cell HTLC additions which could no longer be sent.
	pub holding_cell_failed_htlcs: Vec<(PaymentHash, APIError)>,
	/// Whether we now owe our counterparty a new commitment_signed.
	pub require_commitment: bool,
}

/// The result of force-closing a [`Channel`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShutdownResult {
	/// The update recording the closure. `None` if the channel was never funded.
	pub monitor_update: Option<ChannelMonitorUpdate>,
	/// Our latest commitment transaction, fully signed, to broadcast.
	pub holder_commitment_tx: Option<Transaction>,
	/// Outbound HTLCs our counterparty never received a signed commitment for, queued or offered.
	pub dropped_outbound_htlcs: Vec<PaymentHash>,
}

/// A bilateral payment channel.
pub struct Channel<SP: EcdsaChannelSigner> {
	channel_id: ChannelId,
	temporary_channel_id: ChannelId,
	state: ChannelState,
	is_outbound: bool,
	anchors: bool,
	secp_ctx: Secp256k1<secp256k1::All>,
	channel_value_satoshis: u64,
	feerate_per_kw: u32,

	holder_signer: SP,
	holder_config: ChannelConfig,
	handshake_limits: ChannelHandshakeLimits,
	counterparty_config: Option<ChannelConfig>,
	counterparty_pubkeys: Option<ChannelPublicKeys>,
	channel_transaction_parameters: Option<ChannelTransactionParameters>,

	value_to_self_msat: u64,
	pending_inbound_htlcs: Vec<InboundHTLCOutput>,
	pending_outbound_htlcs: Vec<OutboundHTLCOutput>,
	holding_cell_htlc_updates: Vec<HTLCUpdateAwaitingACK>,
	next_holder_htlc_id: u64,
	// Outbound HTLCs with an id below this are in a counterparty commitment we signed.
	signed_holder_htlc_id_bound: u64,
	next_counterparty_htlc_id: u64,

	// Both count down from INITIAL_COMMITMENT_NUMBER and name the latest commitment each side
	// holds a signature for.
	cur_holder_commitment_transaction_number: u64,
	cur_counterparty_commitment_transaction_number: u64,
	counterparty_prev_commitment_point: Option<PublicKey>,
	counterparty_cur_commitment_point: Option<PublicKey>,
	counterparty_next_commitment_point: Option<PublicKey>,
	commitment_secrets: CounterpartyCommitmentSecrets,

	holder_commitment: Option<Commitment>,
	counterparty_commitment: Option<Commitment>,

	awaiting_remote_revoke: bool,
	owes_revocation: bool,
	need_commitment: bool,
	channel_ready_sent: bool,
	channel_ready_received: bool,

	latest_monitor_update_id: u64,
}

impl<SP: EcdsaChannelSigner> Channel<SP> {
	/// Creates a channel we fund, to be announced with [`Self::get_open_channel`].
	pub fn new_outbound(
		config: &UserConfig, holder_signer: SP, temporary_channel_id: ChannelId,
		channel_value_satoshis: u64, push_msat: u64, feerate_per_kw: u32,
	) -> Result<Channel<SP>, APIError> {
		let holder_config = config.channel_config;
		if channel_value_satoshis < config.handshake_limits.min_funding_satoshis {
			return Err(APIError::APIMisuseError { err: format!("Funding must be at least {} sat", config.handshake_limits.min_funding_satoshis) });
		}
		if push_msat > channel_value_satoshis * 1000 {
			return Err(APIError::APIMisuseError { err: format!("Push value ({}) was larger than channel_value ({})", push_msat, channel_value_satoshis * 1000) });
		}
		if holder_config.channel_reserve_satoshis > channel_value_satoshis {
			return Err(APIError::APIMisuseError { err: format!("Our channel_reserve_satoshis ({}) exceeds the channel value", holder_config.channel_reserve_satoshis) });
		}
		if holder_config.dust_limit_satoshis < MIN_CHAN_DUST_LIMIT_SATOSHIS {
			return Err(APIError::APIMisuseError { err: format!("Our dust limit ({}) is below the minimum of {}", holder_config.dust_limit_satoshis, MIN_CHAN_DUST_LIMIT_SATOSHIS) });
		}
		if feerate_per_kw < FEERATE_FLOOR_SATS_PER_KW {
			return Err(APIError::APIMisuseError { err: format!("Feerate {} is below the floor of {}", feerate_per_kw, FEERATE_FLOOR_SATS_PER_KW) });
		}
		let anchors = config.negotiate_anchors_zero_fee_htlc_tx;
		let value_to_self_msat = channel_value_satoshis * 1000 - push_msat;
		let initial_fee_msat = (commit_tx_fee_sat(feerate_per_kw, 0, anchors) + anchor_outputs_value(anchors)) * 1000;
		if value_to_self_msat < initial_fee_msat {
			return Err(APIError::APIMisuseError { err: format!("Funding amount ({}) can't even pay the initial commitment fee", value_to_self_msat / 1000) });
		}

		Ok(Self::new(
			config, holder_signer, temporary_channel_id, true, anchors, channel_value_satoshis,
			value_to_self_msat, feerate_per_kw,
		))
	}

	/// Creates a channel our counterparty funds, from their `open_channel`.
	pub fn new_from_req(
		config: &UserConfig, holder_signer: SP, msg: &msgs::OpenChannel,
	) -> Result<Channel<SP>, ChannelError> {
		let limits = &config.handshake_limits;
		if msg.funding_satoshis < limits.min_funding_satoshis {
			return Err(ChannelError::close(format!("Funding satoshis ({}) is less than the user specified limit ({})", msg.funding_satoshis, limits.min_funding_satoshis)));
		}
		if msg.push_msat > msg.funding_satoshis * 1000 {
			return Err(ChannelError::close(format!("push_msat {} was larger than channel amount minus reserve ({})", msg.push_msat, msg.funding_satoshis * 1000)));
		}
		if msg.anchors && !config.negotiate_anchors_zero_fee_htlc_tx {
			return Err(ChannelError::close("Peer requested anchor outputs, which we don't support".to_owned()));
		}
		if msg.feerate_per_kw < FEERATE_FLOOR_SATS_PER_KW {
			return Err(ChannelError::close(format!("Peer's feerate much too low. Actual: {}. Our expected lower limit: {}", msg.feerate_per_kw, FEERATE_FLOOR_SATS_PER_KW)));
		}
		let counterparty_config = ChannelConfig {
			dust_limit_satoshis: msg.dust_limit_satoshis,
			channel_reserve_satoshis: msg.channel_reserve_satoshis,
			max_htlc_value_in_flight_msat: msg.max_htlc_value_in_flight_msat,
			htlc_minimum_msat: msg.htlc_minimum_msat,
			max_accepted_htlcs: msg.max_accepted_htlcs,
			to_self_delay: msg.to_self_delay,
		};
		limits.check_counterparty_config(&counterparty_config, msg.funding_satoshis)
			.map_err(|e| ChannelError::close(format!("Rejecting open_channel: {}", e)))?;
		if config.channel_config.channel_reserve_satoshis > msg.funding_satoshis {
			return Err(ChannelError::close(format!("Our channel_reserve_satoshis ({}) exceeds the channel value ({})", config.channel_config.channel_reserve_satoshis, msg.funding_satoshis)));
		}
		let funder_value_msat = msg.funding_satoshis * 1000 - msg.push_msat;
		let initial_fee_msat = (commit_tx_fee_sat(msg.feerate_per_kw, 0, msg.anchors) + anchor_outputs_value(msg.anchors)) * 1000;
		if funder_value_msat < initial_fee_msat {
			return Err(ChannelError::close(format!("Funding amount ({}) can't even pay fee for initial commitment transaction fee of {}.", funder_value_msat / 1000, initial_fee_msat / 1000)));
		}

		let mut chan = Self::new(
			config, holder_signer, msg.temporary_channel_id, false, msg.anchors, msg.funding_satoshis,
			msg.push_msat, msg.feerate_per_kw,
		);
		chan.counterparty_config = Some(counterparty_config);
		chan.counterparty_pubkeys = Some(ChannelPublicKeys {
			funding_pubkey: msg.funding_pubkey,
			revocation_basepoint: msg.revocation_basepoint,
			payment_point: msg.payment_point,
			delayed_payment_basepoint: msg.delayed_payment_basepoint,
			htlc_basepoint: msg.htlc_basepoint,
		});
		chan.counterparty_cur_commitment_point = Some(msg.first_per_commitment_point);
		Ok(chan)
	}

	fn new(
		config: &UserConfig, holder_signer: SP, temporary_channel_id: ChannelId, is_outbound: bool,
		anchors: bool, channel_value_satoshis: u64, value_to_self_msat: u64, feerate_per_kw: u32,
	) -> Channel<SP> {
		Channel {
			channel_id: temporary_channel_id,
			temporary_channel_id,
			state: ChannelState::Opening,
			is_outbound,
			anchors,
			secp_ctx: Secp256k1::new(),
			channel_value_satoshis,
			feerate_per_kw,

			holder_signer,
			holder_config: config.channel_config,
			handshake_limits: config.handshake_limits,
			counterparty_config: None,
			counterparty_pubkeys: None,
			channel_transaction_parameters: None,

			value_to_self_msat,
			pending_inbound_htlcs: Vec::new(),
			pending_outbound_htlcs: Vec::new(),
			holding_cell_htlc_updates: Vec::new(),
			next_holder_htlc_id: 0,
			signed_holder_htlc_id_bound: 0,
			next_counterparty_htlc_id: 0,

			cur_holder_commitment_transaction_number: INITIAL_COMMITMENT_NUMBER,
			cur_counterparty_commitment_transaction_number: INITIAL_COMMITMENT_NUMBER,
			counterparty_prev_commitment_point: None,
			counterparty_cur_commitment_point: None,
			counterparty_next_commitment_point: None,
			commitment_secrets: CounterpartyCommitmentSecrets::new(),

			holder_commitment: None,
			counterparty_commitment: None,

			awaiting_remote_revoke: false,
			owes_revocation: false,
			need_commitment: false,
			channel_ready_sent: false,
			channel_ready_received: false,

			latest_monitor_update_id: 0,
		}
	}

	/// The channel id. This is the temporary id until funding is negotiated.
	pub fn channel_id(&self) -> ChannelId {
		self.channel_id
	}

	/// The id the channel was opened with.
	pub fn temporary_channel_id(&self) -> ChannelId {
		self.temporary_channel_id
	}

	/// Where the channel is in its lifecycle.
	pub fn state(&self) -> ChannelState {
		self.state
	}

	/// Whether we funded the channel.
	pub fn is_outbound(&self) -> bool {
		self.is_outbound
	}

	/// The total channel capacity.
	pub fn get_value_satoshis(&self) -> u64 {
		self.channel_value_satoshis
	}

	/// Our balance, excluding HTLCs in flight.
	pub fn get_value_to_self_msat(&self) -> u64 {
		self.value_to_self_msat
	}

	/// The feerate of both commitment transactions.
	pub fn get_feerate_per_kw(&self) -> u32 {
		self.feerate_per_kw
	}

	/// Our signer.
	pub fn get_signer(&self) -> &SP {
		&self.holder_signer
	}

	/// The complete channel parameters, once funding is negotiated.
	pub fn get_channel_parameters(&self) -> Option<&ChannelTransactionParameters> {
		self.channel_transaction_parameters.as_ref()
	}

	/// The funding outpoint, once known.
	pub fn get_funding_outpoint(&self) -> Option<OutPoint> {
		self.channel_transaction_parameters.as_ref().map(|params| params.funding_outpoint)
	}

	/// Our latest commitment transaction, signed by our counterparty.
	pub fn holder_commitment(&self) -> Option<&Commitment> {
		self.holder_commitment.as_ref()
	}

	/// The latest commitment transaction we signed for our counterparty.
	pub fn counterparty_commitment(&self) -> Option<&Commitment> {
		self.counterparty_commitment.as_ref()
	}

	/// The per-commitment secrets our counterparty revealed so far.
	pub fn counterparty_commitment_secrets(&self) -> &CounterpartyCommitmentSecrets {
		&self.commitment_secrets
	}

	/// The backwards-counting number of our latest commitment.
	pub fn get_cur_holder_commitment_transaction_number(&self) -> u64 {
		self.cur_holder_commitment_transaction_number
	}

	/// The backwards-counting number of our counterparty's latest commitment.
	pub fn get_cur_counterparty_commitment_transaction_number(&self) -> u64 {
		self.cur_counterparty_commitment_transaction_number
	}

	/// Whether we sent a commitment_signed which our counterparty hasn't yet revoked the
	/// previous state for.
	pub fn is_awaiting_remote_revoke(&self) -> bool {
		self.awaiting_remote_revoke
	}

	/// Whether we accepted a commitment_signed and still need to revoke our previous state.
	pub fn owes_revocation(&self) -> bool {
		self.owes_revocation
	}

	/// Whether there are changes our counterparty's commitment doesn't reflect yet.
	pub fn needs_commitment(&self) -> bool {
		self.need_commitment
	}

	/// The number of HTLCs, in either direction, not yet fully removed.
	pub fn pending_htlc_count(&self) -> usize {
		self.pending_inbound_htlcs.len() + self.pending_outbound_htlcs.len()
	}

	/// The number of updates waiting for a revoke_and_ack before they can be sent.
	pub fn holding_cell_len(&self) -> usize {
		self.holding_cell_htlc_updates.len()
	}

	/// The id of the latest [`ChannelMonitorUpdate`] this channel generated.
	pub fn get_latest_monitor_update_id(&self) -> u64 {
		self.latest_monitor_update_id
	}

	fn build_monitor_update(&mut self, updates: Vec<ChannelMonitorUpdateStep>) -> ChannelMonitorUpdate {
		self.latest_monitor_update_id += 1;
		ChannelMonitorUpdate { update_id: self.latest_monitor_update_id, channel_id: self.channel_id, updates }
	}

	fn counterparty_config(&self) -> Result<&ChannelConfig, ChannelError> {
		self.counterparty_config.as_ref()
			.ok_or_else(|| ChannelError::close("Counterparty parameters are not yet known".to_owned()))
	}

	fn funded_parameters(&self) -> Result<&ChannelTransactionParameters, ChannelError> {
		self.channel_transaction_parameters.as_ref()
			.ok_or_else(|| ChannelError::close("Channel is not yet funded".to_owned()))
	}

	fn is_funded(&self) -> bool {
		self.holder_commitment.is_some() && self.counterparty_commitment.is_some()
	}

	fn holder_per_commitment_point(&self, commitment_number: u64) -> Result<PublicKey, ChannelError> {
		self.holder_signer.get_per_commitment_point(commitment_number, &self.secp_ctx)
			.map_err(|e| ChannelError::close(format!("Failed to get our per-commitment point: {}", e)))
	}

	// Open and accept

	/// Builds the open_channel message for a channel we fund.
	pub fn get_open_channel(&self) -> Result<msgs::OpenChannel, ChannelError> {
		if !self.is_outbound {
			return Err(ChannelError::Ignore(APIError::APIMisuseError { err: "Tried to open a channel for an inbound channel?".to_owned() }));
		}
		if self.counterparty_config.is_some() {
			return Err(ChannelError::Ignore(APIError::APIMisuseError { err: "Cannot generate an open_channel after we've moved forward".to_owned() }));
		}
		let keys = self.holder_signer.pubkeys();
		Ok(msgs::OpenChannel {
			temporary_channel_id: self.temporary_channel_id,
			funding_satoshis: self.channel_value_satoshis,
			push_msat: self.channel_value_satoshis * 1000 - self.value_to_self_msat,
			dust_limit_satoshis: self.holder_config.dust_limit_satoshis,
			max_htlc_value_in_flight_msat: self.holder_config.max_htlc_value_in_flight_msat,
			channel_reserve_satoshis: self.holder_config.channel_reserve_satoshis,
			htlc_minimum_msat: self.holder_config.htlc_minimum_msat,
			feerate_per_kw: self.feerate_per_kw,
			to_self_delay: self.holder_config.to_self_delay,
			max_accepted_htlcs: self.holder_config.max_accepted_htlcs,
			funding_pubkey: keys.funding_pubkey,
			revocation_basepoint: keys.revocation_basepoint,
			payment_point: keys.payment_point,
			delayed_payment_basepoint: keys.delayed_payment_basepoint,
			htlc_basepoint: keys.htlc_basepoint,
			first_per_commitment_point: self.holder_per_commitment_point(INITIAL_COMMITMENT_NUMBER)?,
			anchors: self.anchors,
		})
	}

	/// Builds the accept_channel message for a channel our counterparty funds.
	pub fn accept_inbound_channel(&self) -> Result<msgs::AcceptChannel, ChannelError> {
		if self.is_outbound {
			return Err(ChannelError::Ignore(APIError::APIMisuseError { err: "Tried to send accept_channel for an outbound channel?".to_owned() }));
		}
		if self.channel_transaction_parameters.is_some() {
			return Err(ChannelError::Ignore(APIError::APIMisuseError { err: "Tried to send accept_channel after funding".to_owned() }));
		}
		let keys = self.holder_signer.pubkeys();
		Ok(msgs::AcceptChannel {
			temporary_channel_id: self.temporary_channel_id,
			dust_limit_satoshis: self.holder_config.dust_limit_satoshis,
			max_htlc_value_in_flight_msat: self.holder_config.max_htlc_value_in_flight_msat,
			channel_reserve_satoshis: self.holder_config.channel_reserve_satoshis,
			htlc_minimum_msat: self.holder_config.htlc_minimum_msat,
			to_self_delay: self.holder_config.to_self_delay,
			max_accepted_htlcs: self.holder_config.max_accepted_htlcs,
			funding_pubkey: keys.funding_pubkey,
			revocation_basepoint: keys.revocation_basepoint,
			payment_point: keys.payment_point,
			delayed_payment_basepoint: keys.delayed_payment_basepoint,
			htlc_basepoint: keys.htlc_basepoint,
			first_per_commitment_point: self.holder_per_commitment_point(INITIAL_COMMITMENT_NUMBER)?,
		})
	}

	/// Handles our counterparty's accept_channel for a channel we fund.
	pub fn accept_channel(&mut self, msg: &msgs::AcceptChannel) -> Result<(), ChannelError> {
		if !self.is_outbound {
			return Err(ChannelError::close("Got an accept_channel message from an inbound peer".to_owned()));
		}
		if self.counterparty_config.is_some() {
			return Err(ChannelError::close("Got an accept_channel message at a strange time".to_owned()));
		}
		let counterparty_config = ChannelConfig {
			dust_limit_satoshis: msg.dust_limit_satoshis,
			channel_reserve_satoshis: msg.channel_reserve_satoshis,
			max_htlc_value_in_flight_msat: msg.max_htlc_value_in_flight_msat,
			htlc_minimum_msat: msg.htlc_minimum_msat,
			max_accepted_htlcs: msg.max_accepted_htlcs,
			to_self_delay: msg.to_self_delay,
		};
		self.handshake_limits.check_counterparty_config(&counterparty_config, self.channel_value_satoshis)
			.map_err(|e| ChannelError::close(format!("Rejecting accept_channel: {}", e)))?;
		self.counterparty_config = Some(counterparty_config);
		self.counterparty_pubkeys = Some(ChannelPublicKeys {
			funding_pubkey: msg.funding_pubkey,
			revocation_basepoint: msg.revocation_basepoint,
			payment_point: msg.payment_point,
			delayed_payment_basepoint: msg.delayed_payment_basepoint,
			htlc_basepoint: msg.htlc_basepoint,
		});
		self.counterparty_cur_commitment_point = Some(msg.first_per_commitment_point);
		Ok(())
	}

	// Funding

	fn set_funding_outpoint(&mut self, funding_outpoint: OutPoint) -> Result<(), ChannelError> {
		let counterparty_config = *self.counterparty_config()?;
		let counterparty_pubkeys = self.counterparty_pubkeys.clone()
			.ok_or_else(|| ChannelError::close("Counterparty keys are not yet known".to_owned()))?;
		let params = ChannelTransactionParameters {
			holder_pubkeys: self.holder_signer.pubkeys().clone(),
			holder_selected_contest_delay: self.holder_config.to_self_delay,
			is_outbound_from_holder: self.is_outbound,
			counterparty_pubkeys,
			counterparty_selected_contest_delay: counterparty_config.to_self_delay,
			funding_outpoint,
			channel_value_satoshis: self.channel_value_satoshis,
			anchors: self.anchors,
		};
		self.holder_signer.provide_channel_parameters(&params);
		self.channel_transaction_parameters = Some(params);
		self.channel_id = ChannelId::v1_from_funding_outpoint(funding_outpoint);
		Ok(())
	}

	fn initial_counterparty_commitment<L: Deref>(&self, logger: &L) -> Result<(Commitment, Signature), ChannelError>
	where
		L::Target: Logger,
	{
		let point = self.counterparty_cur_commitment_point
			.ok_or_else(|| ChannelError::close("Counterparty's first per-commitment point is unknown".to_owned()))?;
		let keys = self.build_remote_transaction_keys(&point)?;
		let stats = self.build_commitment_transaction(INITIAL_COMMITMENT_NUMBER, &keys, false, true, logger)?;
		let (signature, _) = self.holder_signer.sign_counterparty_commitment(&stats.tx, &self.secp_ctx)
			.map_err(|e| ChannelError::close(format!("Failed to sign counterparty's initial commitment: {}", e)))?;
		Ok((self.commitment_from_stats(stats, None, Vec::new()), signature))
	}

	fn initial_holder_commitment<L: Deref>(&self, sig: &Signature, logger: &L) -> Result<(Commitment, HolderCommitmentTransaction), ChannelError>
	where
		L::Target: Logger,
	{
		let point = self.holder_per_commitment_point(INITIAL_COMMITMENT_NUMBER)?;
		let keys = self.build_holder_transaction_keys(&point)?;
		let stats = self.build_commitment_transaction(INITIAL_COMMITMENT_NUMBER, &keys, true, false, logger)?;
		self.verify_holder_commitment_sig(&stats.tx, sig)?;
		let holder_tx = self.holder_commitment_tx(&stats.tx, *sig, Vec::new())?;
		self.holder_signer.validate_holder_commitment(&holder_tx)
			.map_err(|_| ChannelError::close("Failed to validate our commitment".to_owned()))?;
		Ok((self.commitment_from_stats(stats, Some(*sig), Vec::new()), holder_tx))
	}

	fn funding_monitor_update(&mut self, holder_tx: HolderCommitmentTransaction) -> Result<ChannelMonitorUpdate, ChannelError> {
		let channel_parameters = self.funded_parameters()?.clone();
		let counterparty_step = match self.counterparty_commitment.as_ref() {
			Some(commitment) => counterparty_commitment_step(commitment),
			None => return Err(ChannelError::close("Missing counterparty initial commitment".to_owned())),
		};
		Ok(self.build_monitor_update(vec![
			ChannelMonitorUpdateStep::ChannelFunded { channel_parameters },
			ChannelMonitorUpdateStep::LatestHolderCommitmentTxInfo { commitment_tx: holder_tx },
			counterparty_step,
		]))
	}

	/// Records the funding outpoint of a channel we fund and signs our counterparty's initial
	/// commitment transaction.
	pub fn get_funding_created<L: Deref>(&mut self, funding_outpoint: OutPoint, logger: &L) -> Result<msgs::FundingCreated, ChannelError>
	where
		L::Target: Logger,
	{
		if !self.is_outbound {
			return Err(ChannelError::Ignore(APIError::APIMisuseError { err: "Tried to create funding_created for an inbound channel".to_owned() }));
		}
		if self.counterparty_config.is_none() || self.channel_transaction_parameters.is_some() {
			return Err(ChannelError::Ignore(APIError::APIMisuseError { err: "Tried to get a funding_created messsage at a time other than immediately after initial handshake completion".to_owned() }));
		}
		let funding_output_index = u16::try_from(funding_outpoint.vout).map_err(|_| ChannelError::Ignore(
			APIError::APIMisuseError { err: "Funding output index must fit in 16 bits".to_owned() }))?;
		self.set_funding_outpoint(funding_outpoint)?;
		let (commitment, signature) = self.initial_counterparty_commitment(logger)?;
		let logger = WithContext::from(logger, None, Some(self.channel_id), None);
		log_info!(logger, "Generated funding_created for peer for channel {}", &self.channel_id);
		self.counterparty_commitment = Some(commitment);
		Ok(msgs::FundingCreated {
			temporary_channel_id: self.temporary_channel_id,
			funding_txid: funding_outpoint.txid,
			funding_output_index,
			signature,
		})
	}

	/// Handles funding_created for a channel our counterparty funds, checking their signature on
	/// our initial commitment transaction and signing theirs.
	pub fn funding_created<L: Deref>(&mut self, msg: &msgs::FundingCreated, logger: &L) -> Result<(msgs::FundingSigned, ChannelMonitorUpdate), ChannelError>
	where
		L::Target: Logger,
	{
		if self.is_outbound {
			return Err(ChannelError::close("Received funding_created for an outbound channel?".to_owned()));
		}
		if self.counterparty_config.is_none() || self.channel_transaction_parameters.is_some() {
			return Err(ChannelError::close("Received funding_created after we got the channel!".to_owned()));
		}
		self.set_funding_outpoint(OutPoint { txid: msg.funding_txid, vout: msg.funding_output_index as u32 })?;
		let (holder_commitment, holder_tx) = self.initial_holder_commitment(&msg.signature, logger)?;
		let (counterparty_commitment, signature) = self.initial_counterparty_commitment(logger)?;

		self.holder_commitment = Some(holder_commitment);
		self.counterparty_commitment = Some(counterparty_commitment);
		let monitor_update = self.funding_monitor_update(holder_tx)?;
		let logger = WithContext::from(logger, None, Some(self.channel_id), None);
		log_info!(logger, "Generated funding_signed for peer for channel {}", &self.channel_id);
		Ok((msgs::FundingSigned { channel_id: self.channel_id, signature }, monitor_update))
	}

	/// Handles funding_signed for a channel we fund, checking our counterparty's signature on our
	/// initial commitment transaction. Once the returned update is persisted the funding
	/// transaction may be broadcast.
	pub fn funding_signed<L: Deref>(&mut self, msg: &msgs::FundingSigned, logger: &L) -> Result<ChannelMonitorUpdate, ChannelError>
	where
		L::Target: Logger,
	{
		if !self.is_outbound {
			return Err(ChannelError::close("Received funding_signed for an inbound channel?".to_owned()));
		}
		if self.channel_transaction_parameters.is_none() || self.holder_commitment.is_some() {
			return Err(ChannelError::close("Received funding_signed in strange state!".to_owned()));
		}
		let (holder_commitment, holder_tx) = self.initial_holder_commitment(&msg.signature, logger)?;
		self.holder_commitment = Some(holder_commitment);
		let monitor_update = self.funding_monitor_update(holder_tx)?;
		let logger = WithContext::from(logger, None, Some(self.channel_id), None);
		log_info!(logger, "Received funding_signed from peer for channel {}", &self.channel_id);
		Ok(monitor_update)
	}

	/// Builds our channel_ready, handing our counterparty the per-commitment point of our next
	/// commitment so they can sign it.
	pub fn get_channel_ready(&mut self) -> Result<msgs::ChannelReady, ChannelError> {
		if !self.is_funded() {
			return Err(ChannelError::Ignore(APIError::ChannelUnavailable { err: "Cannot send channel_ready before funding is negotiated".to_owned() }));
		}
		let next_per_commitment_point = self.holder_per_commitment_point(INITIAL_COMMITMENT_NUMBER - 1)?;
		self.channel_ready_sent = true;
		self.check_channel_ready();
		Ok(msgs::ChannelReady { channel_id: self.channel_id, next_per_commitment_point })
	}

	/// Handles our counterparty's channel_ready.
	pub fn channel_ready<L: Deref>(&mut self, msg: &msgs::ChannelReady, logger: &L) -> Result<(), ChannelError>
	where
		L::Target: Logger,
	{
		if !self.is_funded() {
			return Err(ChannelError::close("Peer sent a channel_ready before funding was negotiated".to_owned()));
		}
		if self.channel_ready_received {
			if self.counterparty_next_commitment_point != Some(msg.next_per_commitment_point)
				&& self.cur_counterparty_commitment_transaction_number == INITIAL_COMMITMENT_NUMBER
			{
				return Err(ChannelError::close("Peer sent a reconnect channel_ready with a different point".to_owned()));
			}
			return Ok(());
		}
		self.counterparty_next_commitment_point = Some(msg.next_per_commitment_point);
		self.channel_ready_received = true;
		self.check_channel_ready();
		let logger = WithContext::from(logger, None, Some(self.channel_id), None);
		log_info!(logger, "Received channel_ready from peer for channel {}", &self.channel_id);
		Ok(())
	}

	fn check_channel_ready(&mut self) {
		if self.state == ChannelState::Opening && self.channel_ready_sent && self.channel_ready_received {
			self.state = ChannelState::Active;
		}
	}

	// Commitment construction

	fn build_holder_transaction_keys(&self, per_commitment_point: &PublicKey) -> Result<TxCreationKeys, ChannelError> {
		let params = self.funded_parameters()?;
		TxCreationKeys::from_channel_static_keys(per_commitment_point, &params.holder_pubkeys, &params.counterparty_pubkeys, &self.secp_ctx)
			.map_err(|e| ChannelError::close(format!("Failed to derive our commitment keys: {}", e)))
	}

	fn build_remote_transaction_keys(&self, per_commitment_point: &PublicKey) -> Result<TxCreationKeys, ChannelError> {
		let params = self.funded_parameters()?;
		TxCreationKeys::from_channel_static_keys(per_commitment_point, &params.counterparty_pubkeys, &params.holder_pubkeys, &self.secp_ctx)
			.map_err(|e| ChannelError::close(format!("Failed to derive counterparty's commitment keys: {}", e)))
	}

	/// Transaction nomenclature is somewhat confusing here as there are many different cases - a
	/// transaction is referred to as "a's transaction" implying that a will be able to broadcast
	/// the transaction. Thus, b will generally be sending a signature over such a transaction to
	/// a, and a can revoke the transaction by providing b the relevant per_commitment_secret. As
	/// such, a transaction is generally the result of b increasing the amount paid to a (or adding
	/// an HTLC to a).
	/// @local is used only to convert relevant internal structures which refer to remote vs local
	/// to decide value of outputs and direction of HTLCs.
	/// @generated_by_local is used to determine *which* HTLCs to include - noting that the HTLC
	/// state may indicate that one peer has informed the other that they'd like to add an HTLC but
	/// have not yet committed it. Such HTLCs will only be included in transactions which are being
	/// generated by the peer which proposed adding the HTLCs, and thus we need to understand both
	/// which peer generated this transaction and "to whom" this transaction flows.
	fn build_commitment_transaction<L: Deref>(
		&self, commitment_number: u64, keys: &TxCreationKeys, local: bool, generated_by_local: bool, logger: &L,
	) -> Result<CommitmentStats, ChannelError>
	where
		L::Target: Logger,
	{
		let logger = WithContext::from(logger, None, Some(self.channel_id), None);
		let params = self.funded_parameters()?;
		let counterparty_config = self.counterparty_config()?;
		let mut included_dust_htlcs: Vec<(HTLCOutputInCommitment, ())> = Vec::new();
		let mut included_non_dust_htlcs: Vec<(HTLCOutputInCommitment, ())> = Vec::new();

		let broadcaster_dust_limit_satoshis =
			if local { self.holder_config.dust_limit_satoshis } else { counterparty_config.dust_limit_satoshis };
		let mut remote_htlc_total_msat = 0;
		let mut local_htlc_total_msat = 0;
		let mut value_to_self_msat_offset = 0i64;

		let feerate_per_kw = self.feerate_per_kw;

		log_trace!(logger, "Building commitment transaction number {} for channel {} for {}, generated by {} with fee {}...",
			commitment_number, &self.channel_id,
			if local { "us" } else { "remote" }, if generated_by_local { "us" } else { "remote" }, feerate_per_kw);

		macro_rules! add_htlc_output {
			($htlc: expr, $outbound: expr, $state_name: expr) => {
				let htlc_in_tx = HTLCOutputInCommitment {
					offered: $outbound == local,
					amount_msat: $htlc.amount_msat,
					cltv_expiry: $htlc.cltv_expiry,
					payment_hash: $htlc.payment_hash,
					transaction_output_index: None,
				};
				if !htlc_in_tx.is_dust(broadcaster_dust_limit_satoshis, feerate_per_kw, self.anchors) {
					log_trace!(logger, "   ...including {} {} HTLC {} (hash {}) with value {}",
						if $outbound { "outbound" } else { "inbound" }, $state_name, $htlc.htlc_id, &$htlc.payment_hash, $htlc.amount_msat);
					included_non_dust_htlcs.push((htlc_in_tx, ()));
				} else {
					log_trace!(logger, "   ...including {} {} dust HTLC {} (hash {}) with value {} due to dust limit",
						if $outbound { "outbound" } else { "inbound" }, $state_name, $htlc.htlc_id, &$htlc.payment_hash, $htlc.amount_msat);
					included_dust_htlcs.push((htlc_in_tx, ()));
				}
			}
		}

		for htlc in self.pending_inbound_htlcs.iter() {
			let (include, state_name) = match htlc.state {
				InboundHTLCState::RemoteAnnounced => (!generated_by_local, "RemoteAnnounced"),
				InboundHTLCState::AwaitingRemoteRevokeToAnnounce => (!generated_by_local, "AwaitingRemoteRevokeToAnnounce"),
				InboundHTLCState::AwaitingAnnouncedRemoteRevoke => (true, "AwaitingAnnouncedRemoteRevoke"),
				InboundHTLCState::Committed => (true, "Committed"),
				InboundHTLCState::LocalRemoved(_) => (!generated_by_local, "LocalRemoved"),
			};

			if include {
				add_htlc_output!(htlc, false, state_name);
				remote_htlc_total_msat += htlc.amount_msat;
			} else {
				log_trace!(logger, "   ...not including inbound HTLC {} (hash {}) with value {} due to state ({})",
					htlc.htlc_id, &htlc.payment_hash, htlc.amount_msat, state_name);
				match &htlc.state {
					&InboundHTLCState::LocalRemoved(ref reason) => {
						if generated_by_local {
							if let &InboundHTLCRemovalReason::Fulfill(_) = reason {
								value_to_self_msat_offset += htlc.amount_msat as i64;
							}
						}
					},
					_ => {},
				}
			}
		}

		for htlc in self.pending_outbound_htlcs.iter() {
			let (include, state_name) = match htlc.state {
				OutboundHTLCState::LocalAnnounced => (generated_by_local, "LocalAnnounced"),
				OutboundHTLCState::Committed => (true, "Committed"),
				OutboundHTLCState::RemoteRemoved(_) => (generated_by_local, "RemoteRemoved"),
				OutboundHTLCState::AwaitingRemoteRevokeToRemove(_) => (generated_by_local, "AwaitingRemoteRevokeToRemove"),
				OutboundHTLCState::AwaitingRemovedRemoteRevoke(_) => (false, "AwaitingRemovedRemoteRevoke"),
			};

			if include {
				add_htlc_output!(htlc, true, state_name);
				local_htlc_total_msat += htlc.amount_msat;
			} else {
				log_trace!(logger, "   ...not including outbound HTLC {} (hash {}) with value {} due to state ({})",
					htlc.htlc_id, &htlc.payment_hash, htlc.amount_msat, state_name);
				match htlc.state {
					OutboundHTLCState::AwaitingRemoteRevokeToRemove(OutboundHTLCOutcome::Success(_))
						| OutboundHTLCState::AwaitingRemovedRemoteRevoke(OutboundHTLCOutcome::Success(_)) => {
						value_to_self_msat_offset -= htlc.amount_msat as i64;
					},
					OutboundHTLCState::RemoteRemoved(OutboundHTLCOutcome::Success(_)) => {
						if !generated_by_local {
							value_to_self_msat_offset -= htlc.amount_msat as i64;
						}
					},
					_ => {},
				}
			}
		}

		let value_to_self_msat: i64 = self.value_to_self_msat as i64 - local_htlc_total_msat as i64 + value_to_self_msat_offset;
		let value_to_remote_msat: i64 = (self.channel_value_satoshis * 1000) as i64
			- self.value_to_self_msat as i64 - remote_htlc_total_msat as i64 - value_to_self_msat_offset;
		if value_to_self_msat < 0 || value_to_remote_msat < 0 {
			return Err(ChannelError::close(format!(
				"Commitment {} would leave a negative balance ({} / {})", commitment_number, value_to_self_msat, value_to_remote_msat)));
		}

		let total_fee_sat = commit_tx_fee_sat(feerate_per_kw, included_non_dust_htlcs.len(), self.anchors);
		let funder_costs_sat = (total_fee_sat + anchor_outputs_value(self.anchors)) as i64;
		let (value_to_self, value_to_remote) = if self.is_outbound {
			(value_to_self_msat / 1000 - funder_costs_sat, value_to_remote_msat / 1000)
		} else {
			(value_to_self_msat / 1000, value_to_remote_msat / 1000 - funder_costs_sat)
		};

		let mut value_to_a = if local { value_to_self } else { value_to_remote };
		let mut value_to_b = if local { value_to_remote } else { value_to_self };

		if value_to_a >= (broadcaster_dust_limit_satoshis as i64) {
			log_trace!(logger, "   ...including {} output with value {}", if local { "to_local" } else { "to_remote" }, value_to_a);
		} else {
			value_to_a = 0;
		}

		if value_to_b >= (broadcaster_dust_limit_satoshis as i64) {
			log_trace!(logger, "   ...including {} output with value {}", if local { "to_remote" } else { "to_local" }, value_to_b);
		} else {
			value_to_b = 0;
		}

		let (broadcaster_funding_key, countersignatory_funding_key, directed) = if local {
			(params.holder_pubkeys.funding_pubkey, params.counterparty_pubkeys.funding_pubkey, params.as_holder_broadcastable())
		} else {
			(params.counterparty_pubkeys.funding_pubkey, params.holder_pubkeys.funding_pubkey, params.as_counterparty_broadcastable())
		};
		let tx = CommitmentTransaction::new_with_auxiliary_htlc_data(
			commitment_number, value_to_a as u64, value_to_b as u64, broadcaster_funding_key,
			countersignatory_funding_key, keys.clone(), feerate_per_kw, &mut included_non_dust_htlcs, &directed,
		);

		let mut htlcs_included: Vec<HTLCOutputInCommitment> =
			included_non_dust_htlcs.into_iter().map(|(htlc, _)| htlc).collect();
		htlcs_included.extend(included_dust_htlcs.into_iter().map(|(htlc, _)| htlc));

		let outputs_sat: u64 = tx.trust().built_transaction().transaction.output.iter().map(|txout| txout.value.to_sat()).sum();
		Ok(CommitmentStats {
			tx,
			total_fee_sat: self.channel_value_satoshis.saturating_sub(outputs_sat),
			htlcs_included,
			local_balance_msat: value_to_self_msat as u64,
			remote_balance_msat: value_to_remote_msat as u64,
		})
	}

	fn commitment_from_stats(&self, stats: CommitmentStats, counterparty_sig: Option<Signature>, counterparty_htlc_sigs: Vec<Signature>) -> Commitment {
		Commitment {
			height: INITIAL_COMMITMENT_NUMBER - stats.tx.commitment_number(),
			holder_balance_msat: stats.local_balance_msat,
			counterparty_balance_msat: stats.remote_balance_msat,
			fee_sat: stats.total_fee_sat,
			tx: stats.tx,
			counterparty_sig,
			counterparty_htlc_sigs,
			htlcs: stats.htlcs_included,
		}
	}

	fn holder_commitment_tx(&self, tx: &CommitmentTransaction, sig: Signature, htlc_sigs: Vec<Signature>) -> Result<HolderCommitmentTransaction, ChannelError> {
		let params = self.funded_parameters()?;
		Ok(HolderCommitmentTransaction::new(
			tx.clone(), sig, htlc_sigs, &params.holder_pubkeys.funding_pubkey, &params.counterparty_pubkeys.funding_pubkey,
		))
	}

	fn verify_holder_commitment_sig(&self, tx: &CommitmentTransaction, sig: &Signature) -> Result<(), ChannelError> {
		let params = self.funded_parameters()?;
		let sighash = tx.trust().built_transaction()
			.get_sighash_all(&params.funding_redeemscript(), self.channel_value_satoshis)
			.ok_or_else(|| ChannelError::close("Failed to compute our commitment sighash".to_owned()))?;
		secp_check!(self.secp_ctx.verify_ecdsa(&sighash, sig, &params.counterparty_pubkeys.funding_pubkey), ChannelError::InvalidCommitSig);
		Ok(())
	}

	/// Our latest commitment transaction with both signatures, ready to broadcast.
	pub fn get_signed_holder_commitment_tx(&self) -> Result<Transaction, ChannelError> {
		let commitment = self.holder_commitment.as_ref()
			.ok_or_else(|| ChannelError::Ignore(APIError::ChannelUnavailable { err: "Channel is not yet funded".to_owned() }))?;
		let counterparty_sig = commitment.counterparty_sig
			.ok_or_else(|| ChannelError::close("Our commitment is missing our counterparty's signature".to_owned()))?;
		let holder_tx = self.holder_commitment_tx(&commitment.tx, counterparty_sig, commitment.counterparty_htlc_sigs.clone())?;
		let holder_sig = self.holder_signer.sign_holder_commitment(&holder_tx, &self.secp_ctx)
			.map_err(|e| ChannelError::close(format!("Failed to sign our commitment transaction: {}", e)))?;
		Ok(holder_tx.add_holder_sig(&self.funded_parameters()?.funding_redeemscript(), holder_sig))
	}

	// Balances

	fn htlc_is_dust(&self, amount_msat: u64, offered: bool, local: bool) -> bool {
		let dust_limit_satoshis = if local {
			self.holder_config.dust_limit_satoshis
		} else {
			self.counterparty_config.map_or(self.holder_config.dust_limit_satoshis, |config| config.dust_limit_satoshis)
		};
		amount_msat / 1000 < dust_limit_satoshis + second_stage_tx_fee_sat(self.feerate_per_kw, offered, self.anchors)
	}

	/// The fee the funder pays on the next `local` (or remote) commitment, counting every HTLC not
	/// yet fully removed plus `extra_nondust_htlcs`, and including the anchor outputs.
	fn next_commit_tx_fee_msat(&self, local: bool, include_holding_cell: bool, extra_nondust_htlcs: usize) -> u64 {
		let mut nondust_htlcs = extra_nondust_htlcs;
		nondust_htlcs += self.pending_inbound_htlcs.iter()
			.filter(|htlc| !self.htlc_is_dust(htlc.amount_msat, !local, local)).count();
		nondust_htlcs += self.pending_outbound_htlcs.iter()
			.filter(|htlc| !self.htlc_is_dust(htlc.amount_msat, local, local)).count();
		if include_holding_cell {
			nondust_htlcs += self.holding_cell_htlc_updates.iter().filter(|update| match update {
				&HTLCUpdateAwaitingACK::AddHTLC { amount_msat, .. } => !self.htlc_is_dust(*amount_msat, local, local),
				_ => false,
			}).count();
		}
		(commit_tx_fee_sat(self.feerate_per_kw, nondust_htlcs, self.anchors) + anchor_outputs_value(self.anchors)) * 1000
	}

	/// The smallest HTLC which gets an output on at least one of the two commitments.
	fn min_nondust_htlc_msat(&self) -> u64 {
		let counterparty_dust_limit = self.counterparty_config
			.map_or(self.holder_config.dust_limit_satoshis, |config| config.dust_limit_satoshis);
		let on_holder = self.holder_config.dust_limit_satoshis + second_stage_tx_fee_sat(self.feerate_per_kw, true, self.anchors);
		let on_counterparty = counterparty_dust_limit + second_stage_tx_fee_sat(self.feerate_per_kw, false, self.anchors);
		cmp::min(on_holder, on_counterparty) * 1000
	}

	fn holding_cell_add_stats(&self) -> (usize, u64) {
		self.holding_cell_htlc_updates.iter().fold((0, 0), |(count, value), update| match update {
			&HTLCUpdateAwaitingACK::AddHTLC { amount_msat, .. } => (count + 1, value + amount_msat),
			_ => (count, value),
		})
	}

	fn pending_outbound_stats(&self) -> (usize, u64) {
		let (holding_count, holding_value) = self.holding_cell_add_stats();
		let value: u64 = self.pending_outbound_htlcs.iter().map(|htlc| htlc.amount_msat).sum();
		(self.pending_outbound_htlcs.len() + holding_count, value + holding_value)
	}

	/// Outbound HTLCs our counterparty claimed but which haven't yet been settled into
	/// `value_to_self_msat`.
	fn removed_outbound_success_msat(&self) -> u64 {
		self.pending_outbound_htlcs.iter().filter(|htlc| match htlc.state {
			OutboundHTLCState::RemoteRemoved(OutboundHTLCOutcome::Success(_))
				| OutboundHTLCState::AwaitingRemoteRevokeToRemove(OutboundHTLCOutcome::Success(_))
				| OutboundHTLCState::AwaitingRemovedRemoteRevoke(OutboundHTLCOutcome::Success(_)) => true,
			_ => false,
		}).map(|htlc| htlc.amount_msat).sum()
	}

	/// What we can currently send and receive.
	pub fn get_available_balances(&self) -> AvailableBalances {
		let counterparty_config = match self.counterparty_config {
			Some(config) => config,
			None => return AvailableBalances { balance_msat: self.value_to_self_msat, ..Default::default() },
		};
		let (outbound_count, pending_outbound_msat) = self.pending_outbound_stats();
		let pending_inbound_msat: u64 = self.pending_inbound_htlcs.iter().map(|htlc| htlc.amount_msat).sum();

		let balance_msat = self.value_to_self_msat.saturating_sub(pending_outbound_msat);
		let outbound_capacity_msat = balance_msat.saturating_sub(counterparty_config.channel_reserve_satoshis * 1000);
		let remote_balance_msat = (self.channel_value_satoshis * 1000)
			.saturating_sub(self.value_to_self_msat)
			.saturating_sub(pending_inbound_msat);
		let inbound_capacity_msat = remote_balance_msat.saturating_sub(self.holder_config.channel_reserve_satoshis * 1000);

		let mut available_capacity_msat = outbound_capacity_msat;
		if self.is_outbound {
			// We pay the fee for the new HTLC's output on our own commitment.
			let fee_msat = self.next_commit_tx_fee_msat(true, true, 1);
			available_capacity_msat = available_capacity_msat.saturating_sub(fee_msat);
		} else {
			// Our counterparty must be able to pay for the new HTLC's output on their commitment.
			let fee_msat = self.next_commit_tx_fee_msat(false, true, 1);
			if remote_balance_msat < fee_msat + self.holder_config.channel_reserve_satoshis * 1000 {
				available_capacity_msat = 0;
			}
		}
		let in_flight_left_msat = counterparty_config.max_htlc_value_in_flight_msat.saturating_sub(pending_outbound_msat);
		available_capacity_msat = cmp::min(available_capacity_msat, in_flight_left_msat);
		if outbound_count + 1 > counterparty_config.max_accepted_htlcs as usize {
			available_capacity_msat = 0;
		}

		AvailableBalances {
			balance_msat,
			inbound_capacity_msat,
			outbound_capacity_msat,
			next_outbound_htlc_limit_msat: available_capacity_msat,
			next_outbound_htlc_minimum_msat: cmp::max(cmp::max(counterparty_config.htlc_minimum_msat, 1), self.min_nondust_htlc_msat()),
		}
	}

	// HTLC updates

	/// Adds an HTLC we offer. Returns the update_add_htlc to send, or `None` if the HTLC was put
	/// in the holding cell because we're waiting on our counterparty's revoke_and_ack.
	///
	/// The HTLC is checked against our counterparty's limits and our balance, so on success it is
	/// never rejected by a conforming counterparty.
	pub fn send_htlc<L: Deref>(
		&mut self, amount_msat: u64, payment_hash: PaymentHash, cltv_expiry: u32, logger: &L,
	) -> Result<Option<msgs::UpdateAddHTLC>, APIError>
	where
		L::Target: Logger,
	{
		if self.state != ChannelState::Active {
			return Err(APIError::ChannelUnavailable { err: "Cannot send HTLC until channel is fully established and we haven't started shutting down".to_owned() });
		}
		let counterparty_config = match self.counterparty_config {
			Some(config) => config,
			None => return Err(APIError::ChannelUnavailable { err: "Channel is not yet established".to_owned() }),
		};
		if cltv_expiry >= LOCKTIME_THRESHOLD {
			return Err(APIError::APIMisuseError { err: format!("CLTV expiry {} is a timestamp, not a block height", cltv_expiry) });
		}
		let htlc_minimum_msat = cmp::max(counterparty_config.htlc_minimum_msat, 1);
		if amount_msat < htlc_minimum_msat {
			return Err(APIError::HTLCBelowMinimum { amount_msat, htlc_minimum_msat });
		}
		let dust_limit_msat = self.min_nondust_htlc_msat();
		if amount_msat < dust_limit_msat {
			return Err(APIError::DustHTLC { amount_msat, dust_limit_msat });
		}
		let (outbound_count, pending_outbound_msat) = self.pending_outbound_stats();
		if outbound_count + 1 > counterparty_config.max_accepted_htlcs as usize {
			return Err(APIError::TooManyHTLCs { max_accepted_htlcs: counterparty_config.max_accepted_htlcs });
		}
		if pending_outbound_msat.saturating_add(amount_msat) > counterparty_config.max_htlc_value_in_flight_msat {
			return Err(APIError::MaxPendingAmountExceeded { max_htlc_value_in_flight_msat: counterparty_config.max_htlc_value_in_flight_msat });
		}
		let available_msat = self.get_available_balances().next_outbound_htlc_limit_msat;
		if amount_msat > available_msat {
			return Err(APIError::InsufficientBalance { available_msat, requested_msat: amount_msat });
		}

		let logger = WithContext::from(logger, None, Some(self.channel_id), Some(payment_hash));
		if self.awaiting_remote_revoke {
			log_debug!(logger, "Putting HTLC in holding cell as we're awaiting a revoke_and_ack");
			self.holding_cell_htlc_updates.push(HTLCUpdateAwaitingACK::AddHTLC { amount_msat, cltv_expiry, payment_hash });
			return Ok(None);
		}

		let htlc_id = self.next_holder_htlc_id;
		log_debug!(logger, "Adding outbound HTLC {} with value {}", htlc_id, amount_msat);
		self.pending_outbound_htlcs.push(OutboundHTLCOutput {
			htlc_id,
			amount_msat,
			cltv_expiry,
			payment_hash,
			state: OutboundHTLCState::LocalAnnounced,
		});
		self.next_holder_htlc_id += 1;
		self.need_commitment = true;
		Ok(Some(msgs::UpdateAddHTLC { channel_id: self.channel_id, htlc_id, amount_msat, payment_hash, cltv_expiry }))
	}

	/// Handles an update_add_htlc from our counterparty.
	pub fn update_add_htlc<L: Deref>(&mut self, msg: &msgs::UpdateAddHTLC, logger: &L) -> Result<(), ChannelError>
	where
		L::Target: Logger,
	{
		if self.state != ChannelState::Active {
			return Err(ChannelError::close("Got add HTLC message when channel was not in an operational state".to_owned()));
		}
		let counterparty_config = *self.counterparty_config()?;
		if msg.amount_msat > self.channel_value_satoshis * 1000 {
			return Err(ChannelError::close("Remote side tried to send more than the total value of the channel".to_owned()));
		}
		if msg.amount_msat == 0 {
			return Err(ChannelError::close("Remote side tried to send a 0-msat HTLC".to_owned()));
		}
		if msg.amount_msat < self.holder_config.htlc_minimum_msat {
			return Err(ChannelError::close(format!("Remote side tried to send less than our minimum HTLC value. Lower limit: ({}). Actual: ({})", self.holder_config.htlc_minimum_msat, msg.amount_msat)));
		}

		let inbound_count = self.pending_inbound_htlcs.len();
		let pending_inbound_msat: u64 = self.pending_inbound_htlcs.iter().map(|htlc| htlc.amount_msat).sum();
		if inbound_count + 1 > self.holder_config.max_accepted_htlcs as usize {
			return Err(ChannelError::close(format!("Remote tried to push more than our max accepted HTLCs ({})", self.holder_config.max_accepted_htlcs)));
		}
		if pending_inbound_msat.saturating_add(msg.amount_msat) > self.holder_config.max_htlc_value_in_flight_msat {
			return Err(ChannelError::close(format!("Remote HTLC add would put them over our max HTLC value ({})", self.holder_config.max_htlc_value_in_flight_msat)));
		}

		// Check that the remote can afford to pay for this HTLC on-chain at the current
		// feerate_per_kw, while maintaining their channel reserve as BOLT 2 requires.
		let pending_value_to_self_msat = self.value_to_self_msat + pending_inbound_msat - self.removed_outbound_success_msat();
		let pending_remote_value_msat = (self.channel_value_satoshis * 1000).saturating_sub(pending_value_to_self_msat);
		if pending_remote_value_msat < msg.amount_msat {
			return Err(ChannelError::close("Remote HTLC add would overdraw remaining funds".to_owned()));
		}
		let candidate_nondust = usize::from(!self.htlc_is_dust(msg.amount_msat, true, false));
		let remote_commit_tx_fee_msat = if self.is_outbound { 0 } else { self.next_commit_tx_fee_msat(false, false, candidate_nondust) };
		if pending_remote_value_msat - msg.amount_msat < remote_commit_tx_fee_msat {
			return Err(ChannelError::close("Remote HTLC add would not leave enough to pay for fees".to_owned()));
		}
		if pending_remote_value_msat - msg.amount_msat - remote_commit_tx_fee_msat < self.holder_config.channel_reserve_satoshis * 1000 {
			return Err(ChannelError::close("Remote HTLC add would put them under remote reserve value".to_owned()));
		}
		if self.is_outbound {
			// Check that they won't violate our local required channel reserve by adding this HTLC.
			let candidate_nondust = usize::from(!self.htlc_is_dust(msg.amount_msat, false, true));
			let local_commit_tx_fee_msat = self.next_commit_tx_fee_msat(true, false, candidate_nondust);
			let pending_outbound_msat: u64 = self.pending_outbound_htlcs.iter().map(|htlc| htlc.amount_msat).sum();
			if self.value_to_self_msat.saturating_sub(pending_outbound_msat) < counterparty_config.channel_reserve_satoshis * 1000 + local_commit_tx_fee_msat {
				return Err(ChannelError::close("Cannot accept HTLC that would put our balance under counterparty-announced channel reserve value".to_owned()));
			}
		}
		if self.next_counterparty_htlc_id != msg.htlc_id {
			return Err(ChannelError::close(format!("Remote skipped HTLC ID (skipped ID: {})", self.next_counterparty_htlc_id)));
		}
		if msg.cltv_expiry >= LOCKTIME_THRESHOLD {
			return Err(ChannelError::close("Remote provided CLTV expiry in seconds instead of block height".to_owned()));
		}

		let logger = WithContext::from(logger, None, Some(self.channel_id), Some(msg.payment_hash));
		log_debug!(logger, "Received inbound HTLC {} with value {}", msg.htlc_id, msg.amount_msat);
		self.next_counterparty_htlc_id += 1;
		self.pending_inbound_htlcs.push(InboundHTLCOutput {
			htlc_id: msg.htlc_id,
			amount_msat: msg.amount_msat,
			cltv_expiry: msg.cltv_expiry,
			payment_hash: msg.payment_hash,
			state: InboundHTLCState::RemoteAnnounced,
		});
		Ok(())
	}

	fn check_inbound_removable(&self, htlc_id: u64) -> Result<&InboundHTLCOutput, ChannelError> {
		if self.state != ChannelState::Active {
			return Err(ChannelError::Ignore(APIError::ChannelUnavailable { err: "Cannot settle HTLCs while the channel is not active".to_owned() }));
		}
		let htlc = self.pending_inbound_htlcs.iter().find(|htlc| htlc.htlc_id == htlc_id)
			.ok_or_else(|| ChannelError::Ignore(APIError::APIMisuseError { err: "Unable to find a pending HTLC which matched the given HTLC ID".to_owned() }))?;
		match htlc.state {
			InboundHTLCState::Committed => {},
			InboundHTLCState::LocalRemoved(_) => {
				return Err(ChannelError::Ignore(APIError::APIMisuseError { err: format!("HTLC {} was already removed", htlc_id) }));
			},
			_ => {
				return Err(ChannelError::Ignore(APIError::APIMisuseError { err: format!("HTLC {} is not yet irrevocably committed", htlc_id) }));
			},
		}
		let already_queued = self.holding_cell_htlc_updates.iter().any(|update| match update {
			&HTLCUpdateAwaitingACK::ClaimHTLC { htlc_id: queued_id, .. }
				| &HTLCUpdateAwaitingACK::FailHTLC { htlc_id: queued_id, .. } => queued_id == htlc_id,
			_ => false,
		});
		if already_queued {
			return Err(ChannelError::Ignore(APIError::APIMisuseError { err: format!("HTLC {} already has a pending removal", htlc_id) }));
		}
		Ok(htlc)
	}

	/// Claims an inbound HTLC with its preimage. Returns the update_fulfill_htlc to send, or
	/// `None` if it was put in the holding cell.
	pub fn fulfill_htlc<L: Deref>(
		&mut self, htlc_id: u64, payment_preimage: PaymentPreimage, logger: &L,
	) -> Result<Option<msgs::UpdateFulfillHTLC>, ChannelError>
	where
		L::Target: Logger,
	{
		let payment_hash = self.check_inbound_removable(htlc_id)?.payment_hash;
		if PaymentHash::from(payment_preimage) != payment_hash {
			return Err(ChannelError::Ignore(APIError::APIMisuseError { err: format!("Preimage does not match the payment hash of HTLC {}", htlc_id) }));
		}
		let logger = WithContext::from(logger, None, Some(self.channel_id), Some(payment_hash));
		if self.awaiting_remote_revoke {
			log_trace!(logger, "Placing claim for HTLC ID {} in holding cell", htlc_id);
			self.holding_cell_htlc_updates.push(HTLCUpdateAwaitingACK::ClaimHTLC { payment_preimage, htlc_id });
			return Ok(None);
		}
		log_trace!(logger, "Upgrading HTLC {} to LocalRemoved with a Fulfill", htlc_id);
		self.set_inbound_removed(htlc_id, InboundHTLCRemovalReason::Fulfill(payment_preimage));
		Ok(Some(msgs::UpdateFulfillHTLC { channel_id: self.channel_id, htlc_id, payment_preimage }))
	}

	/// Fails an inbound HTLC. Returns the update_fail_htlc to send, or `None` if it was put in
	/// the holding cell.
	pub fn fail_htlc<L: Deref>(&mut self, htlc_id: u64, reason: Vec<u8>, logger: &L) -> Result<Option<msgs::UpdateFailHTLC>, ChannelError>
	where
		L::Target: Logger,
	{
		let payment_hash = self.check_inbound_removable(htlc_id)?.payment_hash;
		let logger = WithContext::from(logger, None, Some(self.channel_id), Some(payment_hash));
		if self.awaiting_remote_revoke {
			log_trace!(logger, "Placing failure for HTLC ID {} in holding cell", htlc_id);
			self.holding_cell_htlc_updates.push(HTLCUpdateAwaitingACK::FailHTLC { htlc_id, reason });
			return Ok(None);
		}
		log_trace!(logger, "Failing HTLC ID {} back with a update_fail_htlc message", htlc_id);
		self.set_inbound_removed(htlc_id, InboundHTLCRemovalReason::Fail(reason.clone()));
		Ok(Some(msgs::UpdateFailHTLC { channel_id: self.channel_id, htlc_id, reason }))
	}

	fn set_inbound_removed(&mut self, htlc_id: u64, reason: InboundHTLCRemovalReason) {
		if let Some(htlc) = self.pending_inbound_htlcs.iter_mut().find(|htlc| htlc.htlc_id == htlc_id) {
			htlc.state = InboundHTLCState::LocalRemoved(reason);
			self.need_commitment = true;
		}
	}

	/// Marks an outbound HTLC as removed by the remote side and returns its value.
	fn mark_outbound_htlc_removed(&mut self, htlc_id: u64, check_preimage: Option<PaymentPreimage>, outcome: OutboundHTLCOutcome) -> Result<u64, ChannelError> {
		for htlc in self.pending_outbound_htlcs.iter_mut() {
			if htlc.htlc_id == htlc_id {
				if let Some(payment_preimage) = check_preimage {
					if PaymentHash::from(payment_preimage) != htlc.payment_hash {
						return Err(ChannelError::close(format!("Remote tried to fulfill HTLC ({}) with an incorrect preimage", htlc_id)));
					}
				}
				match htlc.state {
					OutboundHTLCState::LocalAnnounced => {
						return Err(ChannelError::close(format!("Remote tried to fulfill/fail HTLC ({}) before it had been committed", htlc_id)));
					},
					OutboundHTLCState::Committed => {
						htlc.state = OutboundHTLCState::RemoteRemoved(outcome);
					},
					OutboundHTLCState::AwaitingRemoteRevokeToRemove(_)
						| OutboundHTLCState::AwaitingRemovedRemoteRevoke(_)
						| OutboundHTLCState::RemoteRemoved(_) => {
						return Err(ChannelError::close(format!("Remote tried to fulfill/fail HTLC ({}) that they'd already fulfilled/failed", htlc_id)));
					},
				}
				return Ok(htlc.amount_msat);
			}
		}
		Err(ChannelError::close("Remote tried to fulfill/fail an HTLC we couldn't find".to_owned()))
	}

	/// Handles our counterparty claiming an HTLC we offered. Returns the HTLC value.
	pub fn update_fulfill_htlc(&mut self, msg: &msgs::UpdateFulfillHTLC) -> Result<u64, ChannelError> {
		if self.state != ChannelState::Active {
			return Err(ChannelError::close("Got fulfill HTLC message when channel was not in an operational state".to_owned()));
		}
		self.mark_outbound_htlc_removed(msg.htlc_id, Some(msg.payment_preimage), OutboundHTLCOutcome::Success(msg.payment_preimage))
	}

	/// Handles our counterparty failing an HTLC we offered.
	pub fn update_fail_htlc(&mut self, msg: &msgs::UpdateFailHTLC) -> Result<(), ChannelError> {
		if self.state != ChannelState::Active {
			return Err(ChannelError::close("Got fail HTLC message when channel was not in an operational state".to_owned()));
		}
		self.mark_outbound_htlc_removed(msg.htlc_id, None, OutboundHTLCOutcome::Failure(msg.reason.clone()))?;
		Ok(())
	}

	// Commitment exchange

	/// Handles a commitment_signed for our next commitment transaction.
	///
	/// Every signature is checked before any state changes, so on error the channel still holds
	/// its previous commitment. On success our previous commitment must be revoked with
	/// [`Self::revoke_current_commitment`].
	pub fn commitment_signed<L: Deref>(&mut self, msg: &msgs::CommitmentSigned, logger: &L) -> Result<ChannelMonitorUpdate, ChannelError>
	where
		L::Target: Logger,
	{
		if self.state != ChannelState::Active {
			return Err(ChannelError::close("Got commitment signed message when channel was not in an operational state".to_owned()));
		}
		if self.owes_revocation {
			return Err(ChannelError::close("Peer sent commitment_signed before we revoked our previous commitment".to_owned()));
		}

		let commitment_number = self.cur_holder_commitment_transaction_number - 1;
		let per_commitment_point = self.holder_per_commitment_point(commitment_number)?;
		let keys = self.build_holder_transaction_keys(&per_commitment_point)?;
		let stats = self.build_commitment_transaction(commitment_number, &keys, true, false, logger)?;
		self.verify_holder_commitment_sig(&stats.tx, &msg.signature)?;

		let logger = WithContext::from(logger, None, Some(self.channel_id), None);
		if msg.htlc_signatures.len() != stats.tx.htlcs().len() {
			return Err(ChannelError::close(format!("Got wrong number of HTLC signatures ({}) from remote. It must be {}", msg.htlc_signatures.len(), stats.tx.htlcs().len())));
		}

		{
			let params = self.funded_parameters()?;
			let directed = params.as_holder_broadcastable();
			let trusted_tx = stats.tx.trust();
			let sighash_type = htlc_countersignatory_sighash_type(self.anchors);
			for (idx, (htlc, sig)) in stats.tx.htlcs().iter().zip(msg.htlc_signatures.iter()).enumerate() {
				let (htlc_tx, htlc_redeemscript) = trusted_tx.htlc_transaction(&directed, htlc)
					.ok_or_else(|| ChannelError::close("Failed to build an HTLC transaction".to_owned()))?;
				let htlc_sighash = p2wsh_sighash(&htlc_tx, 0, &htlc_redeemscript, Amount::from_sat(htlc.amount_msat / 1000), sighash_type)
					.ok_or_else(|| ChannelError::close("Failed to compute an HTLC sighash".to_owned()))?;
				log_trace!(logger, "Checking HTLC tx signature {} by key {} against tx {} (sighash {}) with redeemscript {}",
					log_bytes!(sig.serialize_compact()[..]), log_pubkey!(keys.countersignatory_htlc_key),
					log_tx!(htlc_tx), log_bytes!(htlc_sighash[..]), log_bytes!(htlc_redeemscript.as_bytes()));
				secp_check!(self.secp_ctx.verify_ecdsa(&htlc_sighash, sig, &keys.countersignatory_htlc_key), ChannelError::InvalidHTLCSig { htlc_index: idx });
			}
		}

		let holder_tx = self.holder_commitment_tx(&stats.tx, msg.signature, msg.htlc_signatures.clone())?;
		self.holder_signer.validate_holder_commitment(&holder_tx)
			.map_err(|_| ChannelError::close("Failed to validate our commitment".to_owned()))?;

		for htlc in self.pending_inbound_htlcs.iter_mut() {
			if let InboundHTLCState::RemoteAnnounced = htlc.state {
				log_trace!(logger, "Updating HTLC {} to AwaitingRemoteRevokeToAnnounce due to commitment_signed in channel {}.",
					&htlc.payment_hash, &self.channel_id);
				htlc.state = InboundHTLCState::AwaitingRemoteRevokeToAnnounce;
				self.need_commitment = true;
			}
		}
		for htlc in self.pending_outbound_htlcs.iter_mut() {
			if let OutboundHTLCState::RemoteRemoved(ref mut outcome) = htlc.state {
				log_trace!(logger, "Updating HTLC {} to AwaitingRemoteRevokeToRemove due to commitment_signed in channel {}.",
					&htlc.payment_hash, &self.channel_id);
				let outcome = mem::replace(outcome, OutboundHTLCOutcome::Failure(Vec::new()));
				htlc.state = OutboundHTLCState::AwaitingRemoteRevokeToRemove(outcome);
				self.need_commitment = true;
			}
		}

		let commitment = self.commitment_from_stats(stats, Some(msg.signature), msg.htlc_signatures.clone());
		log_debug!(logger, "Received valid commitment_signed for our commitment {} with {} HTLCs", commitment.height, commitment.htlcs.len());
		self.holder_commitment = Some(commitment);
		self.cur_holder_commitment_transaction_number = commitment_number;
		self.owes_revocation = true;

		Ok(self.build_monitor_update(vec![ChannelMonitorUpdateStep::LatestHolderCommitmentTxInfo { commitment_tx: holder_tx }]))
	}

	/// Revokes our previous commitment, handing our counterparty its per-commitment secret and
	/// the point for our next commitment.
	///
	/// The returned update must be durably persisted before the message is sent: once the secret
	/// is out, broadcasting the revoked commitment forfeits the channel.
	pub fn revoke_current_commitment<L: Deref>(&mut self, logger: &L) -> Result<(msgs::RevokeAndACK, ChannelMonitorUpdate), ChannelError>
	where
		L::Target: Logger,
	{
		if !self.owes_revocation {
			return Err(ChannelError::Ignore(APIError::APIMisuseError { err: "No commitment is waiting to be revoked".to_owned() }));
		}
		let revoked_number = self.cur_holder_commitment_transaction_number + 1;
		let next_per_commitment_point = self.holder_per_commitment_point(self.cur_holder_commitment_transaction_number - 1)?;
		let per_commitment_secret = self.holder_signer.release_commitment_secret(revoked_number)
			.map_err(|e| ChannelError::close(format!("Failed to release our commitment secret: {}", e)))?;
		self.owes_revocation = false;

		let logger = WithContext::from(logger, None, Some(self.channel_id), None);
		log_debug!(logger, "Revoking our commitment {}", INITIAL_COMMITMENT_NUMBER - revoked_number);
		let monitor_update = self.build_monitor_update(vec![ChannelMonitorUpdateStep::HolderRevocation { idx: revoked_number }]);
		Ok((msgs::RevokeAndACK { channel_id: self.channel_id, per_commitment_secret, next_per_commitment_point }, monitor_update))
	}

	/// Signs our counterparty's next commitment transaction, covering every update since the
	/// last one.
	///
	/// Fails with [`APIError::NoChanges`] if there is nothing new to sign, and with
	/// [`APIError::ChannelUnavailable`] while we're still waiting on a revoke_and_ack.
	pub fn send_commitment<L: Deref>(&mut self, logger: &L) -> Result<(msgs::CommitmentSigned, ChannelMonitorUpdate), ChannelError>
	where
		L::Target: Logger,
	{
		if self.state != ChannelState::Active {
			return Err(ChannelError::Ignore(APIError::ChannelUnavailable { err: "Cannot create commitment tx until channel is fully established".to_owned() }));
		}
		if self.awaiting_remote_revoke {
			return Err(ChannelError::Ignore(APIError::ChannelUnavailable { err: "Cannot create commitment tx until remote revokes their previous commitment".to_owned() }));
		}
		if !self.need_commitment {
			return Err(ChannelError::Ignore(APIError::NoChanges));
		}
		let per_commitment_point = self.counterparty_next_commitment_point
			.ok_or_else(|| ChannelError::Ignore(APIError::ChannelUnavailable { err: "Waiting on our counterparty's next per-commitment point".to_owned() }))?;
		let keys = self.build_remote_transaction_keys(&per_commitment_point)?;

		// Promoting these changes which HTLCs the counterparty's commitment carries, so it has to
		// happen before we build it. Undo it if signing fails.
		let saved_inbound = self.pending_inbound_htlcs.clone();
		let saved_outbound = self.pending_outbound_htlcs.clone();
		self.promote_for_counterparty_commitment(logger);

		let commitment_number = self.cur_counterparty_commitment_transaction_number - 1;
		let signed = self.build_commitment_transaction(commitment_number, &keys, false, true, logger)
			.and_then(|stats| {
				self.holder_signer.sign_counterparty_commitment(&stats.tx, &self.secp_ctx)
					.map(|(signature, htlc_signatures)| (stats, signature, htlc_signatures))
					.map_err(|e| ChannelError::Ignore(APIError::ChannelUnavailable { err: format!("Failed to sign counterparty commitment: {}", e) }))
			});
		let (stats, signature, htlc_signatures) = match signed {
			Ok(res) => res,
			Err(e) => {
				self.pending_inbound_htlcs = saved_inbound;
				self.pending_outbound_htlcs = saved_outbound;
				return Err(e);
			},
		};

		let logger = WithContext::from(logger, None, Some(self.channel_id), None);
		let commitment = self.commitment_from_stats(stats, None, Vec::new());
		log_debug!(logger, "Signed counterparty commitment {} ({}) with {} HTLC signatures",
			commitment.height, commitment.tx.trust().txid(), htlc_signatures.len());
		let step = counterparty_commitment_step(&commitment);
		self.counterparty_commitment = Some(commitment);
		self.cur_counterparty_commitment_transaction_number = commitment_number;
		self.counterparty_prev_commitment_point = self.counterparty_cur_commitment_point.take();
		self.counterparty_cur_commitment_point = self.counterparty_next_commitment_point.take();
		self.awaiting_remote_revoke = true;
		self.need_commitment = false;
		self.signed_holder_htlc_id_bound = self.next_holder_htlc_id;

		let monitor_update = self.build_monitor_update(vec![step]);
		Ok((msgs::CommitmentSigned { channel_id: self.channel_id, signature, htlc_signatures }, monitor_update))
	}

	fn promote_for_counterparty_commitment<L: Deref>(&mut self, logger: &L)
	where
		L::Target: Logger,
	{
		let logger = WithContext::from(logger, None, Some(self.channel_id), None);
		for htlc in self.pending_inbound_htlcs.iter_mut() {
			if let InboundHTLCState::AwaitingRemoteRevokeToAnnounce = htlc.state {
				log_trace!(logger, " ...promoting inbound AwaitingRemoteRevokeToAnnounce {} to AwaitingAnnouncedRemoteRevoke", &htlc.payment_hash);
				htlc.state = InboundHTLCState::AwaitingAnnouncedRemoteRevoke;
			}
		}
		for htlc in self.pending_outbound_htlcs.iter_mut() {
			if let OutboundHTLCState::AwaitingRemoteRevokeToRemove(ref mut outcome) = htlc.state {
				log_trace!(logger, " ...promoting outbound AwaitingRemoteRevokeToRemove {} to AwaitingRemovedRemoteRevoke", &htlc.payment_hash);
				let outcome = mem::replace(outcome, OutboundHTLCOutcome::Failure(Vec::new()));
				htlc.state = OutboundHTLCState::AwaitingRemovedRemoteRevoke(outcome);
			}
		}
	}

	/// Handles our counterparty revoking their previous commitment.
	///
	/// The revealed secret is checked against the point we hold for that commitment and against
	/// every secret received before it, and nothing changes unless both checks pass.
	pub fn revoke_and_ack<L: Deref>(&mut self, msg: &msgs::RevokeAndACK, logger: &L) -> Result<(RevokeAndACKResult, ChannelMonitorUpdate), ChannelError>
	where
		L::Target: Logger,
	{
		if self.state != ChannelState::Active {
			return Err(ChannelError::close("Got revoke/ACK message when channel was not in an operational state".to_owned()));
		}
		if !self.awaiting_remote_revoke {
			return Err(ChannelError::close("Received an unexpected revoke_and_ack".to_owned()));
		}
		let secret = secp_check!(SecretKey::from_slice(&msg.per_commitment_secret),
			ChannelError::InvalidRevocation("Peer provided an invalid per commitment secret".to_owned()));
		let expected_point = self.counterparty_prev_commitment_point
			.ok_or_else(|| ChannelError::close("Missing the point of the commitment being revoked".to_owned()))?;
		if PublicKey::from_secret_key(&self.secp_ctx, &secret) != expected_point {
			return Err(ChannelError::InvalidRevocation("Got a revoke commitment secret which didn't correspond to their current pubkey".to_owned()));
		}
		let revoked_number = self.cur_counterparty_commitment_transaction_number + 1;
		self.commitment_secrets.provide_secret(revoked_number, msg.per_commitment_secret)
			.map_err(|e| ChannelError::InvalidRevocation(format!("Previous secrets did not match new one: {}", e)))?;
		self.holder_signer.validate_counterparty_revocation(revoked_number, &secret)
			.map_err(|_| ChannelError::close("Failed to validate revocation from peer".to_owned()))?;

		let monitor_update = self.build_monitor_update(vec![ChannelMonitorUpdateStep::CommitmentSecret {
			idx: revoked_number,
			secret: msg.per_commitment_secret,
		}]);
		self.counterparty_prev_commitment_point = None;
		self.counterparty_next_commitment_point = Some(msg.next_per_commitment_point);
		self.awaiting_remote_revoke = false;

		let mut result = RevokeAndACKResult::default();
		{
			let logger = WithContext::from(logger, None, Some(self.channel_id), None);
			log_trace!(logger, "Updating HTLCs on receipt of RAA in channel {}...", &self.channel_id);

			// Take references explicitly so that we can hold multiple references to self.
			let pending_inbound_htlcs: &mut Vec<_> = &mut self.pending_inbound_htlcs;
			let pending_outbound_htlcs: &mut Vec<_> = &mut self.pending_outbound_htlcs;
			let value_to_self_msat = &mut self.value_to_self_msat;
			let mut require_commitment = false;

			// We really shouldnt have two passes here, but retain gives a non-mutable ref
			pending_inbound_htlcs.retain(|htlc| {
				if let &InboundHTLCState::LocalRemoved(ref reason) = &htlc.state {
					log_trace!(logger, " ...removing inbound LocalRemoved {}", &htlc.payment_hash);
					if let &InboundHTLCRemovalReason::Fulfill(_) = reason {
						*value_to_self_msat += htlc.amount_msat;
					}
					false
				} else {
					true
				}
			});
			pending_outbound_htlcs.retain(|htlc| {
				if let &OutboundHTLCState::AwaitingRemovedRemoteRevoke(ref outcome) = &htlc.state {
					log_trace!(logger, " ...removing outbound AwaitingRemovedRemoteRevoke {}", &htlc.payment_hash);
					match outcome {
						OutboundHTLCOutcome::Success(preimage) => {
							*value_to_self_msat -= htlc.amount_msat;
							result.claimed_htlcs.push((htlc.htlc_id, *preimage));
						},
						OutboundHTLCOutcome::Failure(reason) => {
							result.failed_htlcs.push((htlc.htlc_id, reason.clone()));
						},
					}
					false
				} else {
					true
				}
			});
			for htlc in pending_inbound_htlcs.iter_mut() {
				if let InboundHTLCState::AwaitingRemoteRevokeToAnnounce = htlc.state {
					log_trace!(logger, " ...promoting inbound AwaitingRemoteRevokeToAnnounce {} to AwaitingAnnouncedRemoteRevoke", &htlc.payment_hash);
					htlc.state = InboundHTLCState::AwaitingAnnouncedRemoteRevoke;
					require_commitment = true;
				} else if let InboundHTLCState::AwaitingAnnouncedRemoteRevoke = htlc.state {
					log_trace!(logger, " ...promoting inbound AwaitingAnnouncedRemoteRevoke {} to Committed", &htlc.payment_hash);
					htlc.state = InboundHTLCState::Committed;
					result.accepted_htlcs.push(CommittedHTLC {
						htlc_id: htlc.htlc_id,
						amount_msat: htlc.amount_msat,
						payment_hash: htlc.payment_hash,
						cltv_expiry: htlc.cltv_expiry,
					});
				}
			}
			for htlc in pending_outbound_htlcs.iter_mut() {
				if let OutboundHTLCState::LocalAnnounced = htlc.state {
					log_trace!(logger, " ...promoting outbound LocalAnnounced {} to Committed", &htlc.payment_hash);
					htlc.state = OutboundHTLCState::Committed;
				}
				if let OutboundHTLCState::AwaitingRemoteRevokeToRemove(ref mut outcome) = htlc.state {
					log_trace!(logger, " ...promoting outbound AwaitingRemoteRevokeToRemove {} to AwaitingRemovedRemoteRevoke", &htlc.payment_hash);
					let outcome = mem::replace(outcome, OutboundHTLCOutcome::Failure(Vec::new()));
					htlc.state = OutboundHTLCState::AwaitingRemovedRemoteRevoke(outcome);
					require_commitment = true;
				}
			}
			if require_commitment {
				self.need_commitment = true;
			}
		}

		self.free_holding_cell_htlcs(&mut result, logger);
		result.require_commitment = self.need_commitment;
		Ok((result, monitor_update))
	}

	fn free_holding_cell_htlcs<L: Deref>(&mut self, result: &mut RevokeAndACKResult, logger: &L)
	where
		L::Target: Logger,
	{
		if self.holding_cell_htlc_updates.is_empty() {
			return;
		}
		let updates = mem::take(&mut self.holding_cell_htlc_updates);
		{
			let logger = WithContext::from(logger, None, Some(self.channel_id), None);
			log_trace!(logger, "Freeing holding cell with {} HTLC updates in channel {}", updates.len(), &self.channel_id);
		}
		for update in updates {
			match update {
				HTLCUpdateAwaitingACK::AddHTLC { amount_msat, cltv_expiry, payment_hash } => {
					match self.send_htlc(amount_msat, payment_hash, cltv_expiry, logger) {
						Ok(Some(msg)) => result.update_add_htlcs.push(msg),
						Ok(None) => {},
						Err(e) => {
							let logger = WithContext::from(logger, None, Some(self.channel_id), Some(payment_hash));
							log_info!(logger, "Failed to send HTLC with payment_hash {} due to {} in channel {}", &payment_hash, e, &self.channel_id);
							result.holding_cell_failed_htlcs.push((payment_hash, e));
						},
					}
				},
				HTLCUpdateAwaitingACK::ClaimHTLC { payment_preimage, htlc_id } => {
					match self.fulfill_htlc(htlc_id, payment_preimage, logger) {
						Ok(Some(msg)) => result.update_fulfill_htlcs.push(msg),
						Ok(None) => {},
						Err(e) => {
							let logger = WithContext::from(logger, None, Some(self.channel_id), None);
							log_error!(logger, "Failed to claim HTLC {} from the holding cell: {}", htlc_id, e);
						},
					}
				},
				HTLCUpdateAwaitingACK::FailHTLC { htlc_id, reason } => {
					match self.fail_htlc(htlc_id, reason, logger) {
						Ok(Some(msg)) => result.update_fail_htlcs.push(msg),
						Ok(None) => {},
						Err(e) => {
							let logger = WithContext::from(logger, None, Some(self.channel_id), None);
							log_error!(logger, "Failed to fail HTLC {} from the holding cell: {}", htlc_id, e);
						},
					}
				},
			}
		}
	}

	// Closing

	/// Force-closes the channel, discarding anything we queued but never offered, and returns our
	/// latest commitment transaction to broadcast.
	pub fn force_close<L: Deref>(&mut self, logger: &L) -> Result<ShutdownResult, ChannelError>
	where
		L::Target: Logger,
	{
		if self.state == ChannelState::Closing || self.state == ChannelState::Closed {
			return Err(ChannelError::Ignore(APIError::ChannelUnavailable { err: "Channel is already closing".to_owned() }));
		}
		let logger = WithContext::from(logger, None, Some(self.channel_id), None);
		let mut dropped_outbound_htlcs = Vec::new();
		let signed_bound = self.signed_holder_htlc_id_bound;
		self.pending_outbound_htlcs.retain(|htlc| {
			if matches!(htlc.state, OutboundHTLCState::LocalAnnounced) && htlc.htlc_id >= signed_bound {
				log_trace!(logger, " ...dropping outbound HTLC {} we never signed for", htlc.htlc_id);
				dropped_outbound_htlcs.push(htlc.payment_hash);
				false
			} else {
				true
			}
		});
		self.pending_inbound_htlcs.retain(|htlc| {
			if let InboundHTLCState::RemoteAnnounced = htlc.state {
				log_trace!(logger, " ...dropping inbound HTLC {} we never committed to", htlc.htlc_id);
				false
			} else {
				true
			}
		});
		for update in mem::take(&mut self.holding_cell_htlc_updates) {
			if let HTLCUpdateAwaitingACK::AddHTLC { payment_hash, .. } = update {
				dropped_outbound_htlcs.push(payment_hash);
			}
		}
		self.need_commitment = false;
		self.state = ChannelState::Closing;

		let (holder_commitment_tx, monitor_update) = if self.is_funded() {
			let tx = match self.get_signed_holder_commitment_tx() {
				Ok(tx) => {
					log_info!(logger, "Force-closing channel {} with commitment {}", &self.channel_id, tx.compute_txid());
					Some(tx)
				},
				Err(e) => {
					log_error!(logger, "Force-closing channel {} without a commitment to broadcast: {}", &self.channel_id, e);
					None
				},
			};
			let update = self.build_monitor_update(vec![ChannelMonitorUpdateStep::ChannelForceClosed { should_broadcast: true }]);
			(tx, Some(update))
		} else {
			log_info!(logger, "Closing unfunded channel {}", &self.channel_id);
			self.state = ChannelState::Closed;
			(None, None)
		};
		Ok(ShutdownResult { monitor_update, holder_commitment_tx, dropped_outbound_htlcs })
	}

	/// Marks a closing channel closed once its closing transaction has confirmed.
	pub fn closing_tx_confirmed(&mut self) -> Result<(), ChannelError> {
		if self.state != ChannelState::Closing {
			return Err(ChannelError::Ignore(APIError::APIMisuseError { err: "Channel is not closing".to_owned() }));
		}
		self.state = ChannelState::Closed;
		Ok(())
	}
}

fn anchor_outputs_value(anchors: bool) -> u64 {
	if anchors { ANCHOR_OUTPUT_VALUE_SATOSHI * 2 } else { 0 }
}

fn counterparty_commitment_step(commitment: &Commitment) -> ChannelMonitorUpdateStep {
	let trusted_tx = commitment.tx.trust();
	ChannelMonitorUpdateStep::LatestCounterpartyCommitmentTxInfo {
		commitment_txid: trusted_tx.txid(),
		htlc_outputs: commitment.tx.htlcs().clone(),
		commitment_number: commitment.tx.commitment_number(),
		their_per_commitment_point: trusted_tx.keys().per_commitment_point,
		to_broadcaster_value_sat: commitment.tx.to_broadcaster_value_sat(),
		to_countersignatory_value_sat: commitment.tx.to_countersignatory_value_sat(),
		feerate_per_kw: commitment.tx.feerate_per_kw(),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::util::test_channel_signer::TestChannelSigner;
	use crate::util::test_utils::{self, TestLogger};

	use bitcoin::hashes::Hash;
	use bitcoin::Txid;

	fn outbound_channel(config: &UserConfig) -> Channel<TestChannelSigner> {
		Channel::new_outbound(
			config, TestChannelSigner::new(test_utils::in_memory_signer(1)),
			ChannelId::temporary_from_entropy([3; 32]), 100_000, 20_000_000, 1000,
		).unwrap()
	}

	fn funded_channels(
		alice_config: &UserConfig, bob_config: &UserConfig, logger: &TestLogger,
	) -> (Channel<TestChannelSigner>, Channel<TestChannelSigner>) {
		let mut alice = outbound_channel(alice_config);
		let open_channel = alice.get_open_channel().unwrap();
		let mut bob = Channel::new_from_req(
			bob_config, TestChannelSigner::new(test_utils::in_memory_signer(2)), &open_channel,
		).unwrap();
		alice.accept_channel(&bob.accept_inbound_channel().unwrap()).unwrap();

		let funding_outpoint = OutPoint { txid: Txid::from_byte_array([42; 32]), vout: 0 };
		let funding_created = alice.get_funding_created(funding_outpoint, &logger).unwrap();
		let (funding_signed, _) = bob.funding_created(&funding_created, &logger).unwrap();
		alice.funding_signed(&funding_signed, &logger).unwrap();

		let alice_ready = alice.get_channel_ready().unwrap();
		let bob_ready = bob.get_channel_ready().unwrap();
		alice.channel_ready(&bob_ready, &logger).unwrap();
		bob.channel_ready(&alice_ready, &logger).unwrap();
		(alice, bob)
	}

	fn payment_hash(byte: u8) -> PaymentHash {
		PaymentHash::from(PaymentPreimage([byte; 32]))
	}

	#[test]
	fn test_outbound_channel_parameter_checks() {
		let config = UserConfig::default();
		let signer = || TestChannelSigner::new(test_utils::in_memory_signer(1));
		let temporary_channel_id = ChannelId::temporary_from_entropy([3; 32]);

		match Channel::new_outbound(&config, signer(), temporary_channel_id, 999, 0, 1000) {
			Err(APIError::APIMisuseError { err }) => assert!(err.contains("Funding must be at least 1000 sat")),
			_ => panic!("expected the funding minimum to be enforced"),
		}
		match Channel::new_outbound(&config, signer(), temporary_channel_id, 100_000, 100_000_001, 1000) {
			Err(APIError::APIMisuseError { err }) => assert!(err.contains("Push value")),
			_ => panic!("expected an oversized push to be refused"),
		}
		match Channel::new_outbound(&config, signer(), temporary_channel_id, 100_000, 0, FEERATE_FLOOR_SATS_PER_KW - 1) {
			Err(APIError::APIMisuseError { err }) => assert!(err.contains("below the floor")),
			_ => panic!("expected a feerate below the floor to be refused"),
		}

		let mut low_dust_config = UserConfig::default();
		low_dust_config.channel_config.dust_limit_satoshis = MIN_CHAN_DUST_LIMIT_SATOSHIS - 1;
		assert!(Channel::new_outbound(&low_dust_config, signer(), temporary_channel_id, 100_000, 0, 1000).is_err());

		// Everything pushed leaves nothing to pay the initial commitment fee with.
		match Channel::new_outbound(&config, signer(), temporary_channel_id, 100_000, 100_000_000, 1000) {
			Err(APIError::APIMisuseError { err }) => assert!(err.contains("can't even pay")),
			_ => panic!("expected the funder to need the initial fee"),
		}
	}

	#[test]
	fn test_inbound_channel_rejects_unwanted_parameters() {
		let alice = outbound_channel(&UserConfig::default());
		let open_channel = alice.get_open_channel().unwrap();
		let bob_signer = || TestChannelSigner::new(test_utils::in_memory_signer(2));

		let mut anchors_open = open_channel.clone();
		anchors_open.anchors = true;
		match Channel::new_from_req(&UserConfig::default(), bob_signer(), &anchors_open) {
			Err(ChannelError::Close(err)) => assert!(err.contains("anchor outputs")),
			_ => panic!("anchor channels must be opted into"),
		}

		let mut slow_open = open_channel.clone();
		slow_open.to_self_delay = MAX_LOCAL_BREAKDOWN_TIMEOUT + 1;
		match Channel::new_from_req(&UserConfig::default(), bob_signer(), &slow_open) {
			Err(ChannelError::Close(err)) => assert!(err.contains("to_self_delay")),
			_ => panic!("expected an overlong to_self_delay to be refused"),
		}

		let bob = Channel::new_from_req(&UserConfig::default(), bob_signer(), &open_channel).unwrap();
		assert!(!bob.is_outbound());
		assert_eq!(bob.get_value_to_self_msat(), 20_000_000);
		assert_eq!(bob.state(), ChannelState::Opening);
	}

	#[test]
	fn test_balances_before_and_after_accept() {
		let logger = TestLogger::new();
		let config = UserConfig::default();
		let alice = outbound_channel(&config);
		assert_eq!(alice.get_available_balances(), AvailableBalances { balance_msat: 80_000_000, ..Default::default() });

		let (alice, bob) = funded_channels(&config, &config, &logger);
		let initial_fee_msat = commit_tx_fee_sat(1000, 1, false) * 1000;
		let alice_balances = alice.get_available_balances();
		assert_eq!(alice_balances.balance_msat, 80_000_000);
		assert_eq!(alice_balances.outbound_capacity_msat, 70_000_000);
		assert_eq!(alice_balances.inbound_capacity_msat, 10_000_000);
		assert_eq!(alice_balances.next_outbound_htlc_limit_msat, 70_000_000 - initial_fee_msat);

		let bob_balances = bob.get_available_balances();
		assert_eq!(bob_balances.balance_msat, 20_000_000);
		assert_eq!(bob_balances.outbound_capacity_msat, 10_000_000);
		assert_eq!(bob_balances.inbound_capacity_msat, 70_000_000);
		assert_eq!(bob_balances.next_outbound_htlc_limit_msat, 10_000_000);
		assert_eq!(bob_balances.next_outbound_htlc_minimum_msat, alice_balances.next_outbound_htlc_minimum_msat);
	}

	#[test]
	fn test_send_htlc_before_open() {
		let logger = TestLogger::new();
		let mut alice = outbound_channel(&UserConfig::default());
		match alice.send_htlc(1_000_000, payment_hash(1), 700_000, &&logger) {
			Err(APIError::ChannelUnavailable { .. }) => {},
			_ => panic!("HTLCs can't be sent before the channel is open"),
		}
		assert_eq!(alice.pending_htlc_count(), 0);
	}

	#[test]
	fn test_send_htlc_checks_counterparty_limits_in_order() {
		let logger = TestLogger::new();
		let mut bob_config = UserConfig::default();
		bob_config.channel_config.htlc_minimum_msat = 1_100_000;
		bob_config.channel_config.max_accepted_htlcs = 3;
		bob_config.channel_config.max_htlc_value_in_flight_msat = 30_000_000;
		let (mut alice, _bob) = funded_channels(&UserConfig::default(), &bob_config, &logger);

		// 1_000_000 is dust too, but the minimum is checked first.
		assert_eq!(alice.send_htlc(1_000_000, payment_hash(1), 700_000, &&logger),
			Err(APIError::HTLCBelowMinimum { amount_msat: 1_000_000, htlc_minimum_msat: 1_100_000 }));
		let dust_limit_msat = alice.get_available_balances().next_outbound_htlc_minimum_msat;
		assert_eq!(dust_limit_msat, (546 + second_stage_tx_fee_sat(1000, true, false)) * 1000);
		assert_eq!(alice.send_htlc(1_150_000, payment_hash(1), 700_000, &&logger),
			Err(APIError::DustHTLC { amount_msat: 1_150_000, dust_limit_msat }));
		match alice.send_htlc(5_000_000, payment_hash(1), LOCKTIME_THRESHOLD, &&logger) {
			Err(APIError::APIMisuseError { err }) => assert!(err.contains("timestamp")),
			_ => panic!("expected a timestamp CLTV to be refused"),
		}

		assert!(alice.send_htlc(10_000_000, payment_hash(1), 700_000, &&logger).unwrap().is_some());
		assert!(alice.send_htlc(10_000_000, payment_hash(2), 700_000, &&logger).unwrap().is_some());
		assert_eq!(alice.send_htlc(15_000_000, payment_hash(3), 700_000, &&logger),
			Err(APIError::MaxPendingAmountExceeded { max_htlc_value_in_flight_msat: 30_000_000 }));
		let msg = alice.send_htlc(10_000_000, payment_hash(3), 700_000, &&logger).unwrap().unwrap();
		assert_eq!(msg.htlc_id, 2);

		// The count limit trips before either value limit.
		assert_eq!(alice.send_htlc(50_000_000, payment_hash(4), 700_000, &&logger),
			Err(APIError::TooManyHTLCs { max_accepted_htlcs: 3 }));
		assert_eq!(alice.pending_htlc_count(), 3);
		assert!(alice.needs_commitment());
	}

	#[test]
	fn test_send_htlc_insufficient_balance() {
		let logger = TestLogger::new();
		let config = UserConfig::default();
		let (mut alice, _bob) = funded_channels(&config, &config, &logger);

		let available_msat = 70_000_000 - commit_tx_fee_sat(1000, 1, false) * 1000;
		assert_eq!(alice.send_htlc(75_000_000, payment_hash(1), 700_000, &&logger),
			Err(APIError::InsufficientBalance { available_msat, requested_msat: 75_000_000 }));
		assert_eq!(alice.pending_htlc_count(), 0);

		alice.send_htlc(available_msat, payment_hash(1), 700_000, &&logger).unwrap().unwrap();
		assert_eq!(alice.get_available_balances().next_outbound_htlc_limit_msat, 0);
	}

	#[test]
	fn test_update_add_htlc_with_skipped_id() {
		let logger = TestLogger::new();
		let config = UserConfig::default();
		let (_alice, mut bob) = funded_channels(&config, &config, &logger);

		let msg = msgs::UpdateAddHTLC {
			channel_id: bob.channel_id(), htlc_id: 1, amount_msat: 5_000_000, payment_hash: payment_hash(1),
			cltv_expiry: 700_000,
		};
		match bob.update_add_htlc(&msg, &&logger) {
			Err(ChannelError::Close(err)) => assert!(err.contains("skipped HTLC ID")),
			_ => panic!("a skipped HTLC id must close the channel"),
		}
		assert_eq!(bob.pending_htlc_count(), 0);
	}

	#[test]
	fn test_commitment_signed_before_revocation() {
		let logger = TestLogger::new();
		let config = UserConfig::default();
		let (mut alice, mut bob) = funded_channels(&config, &config, &logger);

		let update_add = alice.send_htlc(5_000_000, payment_hash(1), 700_000, &&logger).unwrap().unwrap();
		bob.update_add_htlc(&update_add, &&logger).unwrap();
		let (commitment_signed, _) = alice.send_commitment(&&logger).unwrap();
		assert_eq!(alice.send_commitment(&&logger).map(|_| ()),
			Err(ChannelError::Ignore(APIError::ChannelUnavailable {
				err: "Cannot create commitment tx until remote revokes their previous commitment".to_owned(),
			})));

		bob.commitment_signed(&commitment_signed, &&logger).unwrap();
		assert!(bob.owes_revocation());
		match bob.commitment_signed(&commitment_signed, &&logger) {
			Err(ChannelError::Close(err)) => assert!(err.contains("before we revoked")),
			_ => panic!("a second commitment_signed must wait for our revocation"),
		}
	}

	#[test]
	fn test_bad_revocation_changes_nothing() {
		let logger = TestLogger::new();
		let config = UserConfig::default();
		let (mut alice, mut bob) = funded_channels(&config, &config, &logger);

		let update_add = alice.send_htlc(5_000_000, payment_hash(1), 700_000, &&logger).unwrap().unwrap();
		bob.update_add_htlc(&update_add, &&logger).unwrap();
		let (commitment_signed, _) = alice.send_commitment(&&logger).unwrap();
		bob.commitment_signed(&commitment_signed, &&logger).unwrap();
		let (revoke_and_ack, _) = bob.revoke_current_commitment(&&logger).unwrap();

		let update_id = alice.get_latest_monitor_update_id();
		let bad_revoke_and_ack = msgs::RevokeAndACK { per_commitment_secret: [1; 32], ..revoke_and_ack.clone() };
		match alice.revoke_and_ack(&bad_revoke_and_ack, &&logger) {
			Err(ChannelError::InvalidRevocation(_)) => {},
			_ => panic!("a secret for the wrong point must be refused"),
		}
		assert!(alice.is_awaiting_remote_revoke());
		assert_eq!(alice.get_latest_monitor_update_id(), update_id);
		assert!(alice.counterparty_commitment_secrets().get_secret(INITIAL_COMMITMENT_NUMBER).is_none());

		let (result, monitor_update) = alice.revoke_and_ack(&revoke_and_ack, &&logger).unwrap();
		assert!(result.accepted_htlcs.is_empty());
		assert_eq!(monitor_update.update_id, update_id + 1);
		assert!(!alice.is_awaiting_remote_revoke());
		assert_eq!(alice.counterparty_commitment_secrets().get_secret(INITIAL_COMMITMENT_NUMBER),
			Some(revoke_and_ack.per_commitment_secret));

		// Nothing is outstanding now, so a replay is a protocol violation.
		match alice.revoke_and_ack(&revoke_and_ack, &&logger) {
			Err(ChannelError::Close(err)) => assert!(err.contains("unexpected revoke_and_ack")),
			_ => panic!("an unsolicited revoke_and_ack must close the channel"),
		}
	}

	#[test]
	fn test_revocation_mismatch_leaves_signer_state() {
		let logger = TestLogger::new();
		let config = UserConfig::default();
		let (mut alice, mut bob) = funded_channels(&config, &config, &logger);

		let update_add = alice.send_htlc(5_000_000, payment_hash(1), 700_000, &&logger).unwrap().unwrap();
		bob.update_add_htlc(&update_add, &&logger).unwrap();
		let (commitment_signed, _) = alice.send_commitment(&&logger).unwrap();
		bob.commitment_signed(&commitment_signed, &&logger).unwrap();
		let (bob_revoke_and_ack, _) = bob.revoke_current_commitment(&&logger).unwrap();
		let (commitment_signed, _) = bob.send_commitment(&&logger).unwrap();
		alice.revoke_and_ack(&bob_revoke_and_ack, &&logger).unwrap();
		alice.commitment_signed(&commitment_signed, &&logger).unwrap();
		let (alice_revoke_and_ack, _) = alice.revoke_current_commitment(&&logger).unwrap();
		bob.revoke_and_ack(&alice_revoke_and_ack, &&logger).unwrap();
		assert_eq!(alice.get_signer().get_enforcement_state().last_counterparty_revoked_commitment, INITIAL_COMMITMENT_NUMBER);

		// Replace the stored secret so bob's next one can't be derived from it.
		alice.commitment_secrets = CounterpartyCommitmentSecrets::new();
		alice.commitment_secrets.provide_secret(INITIAL_COMMITMENT_NUMBER, [7; 32]).unwrap();

		let update_add = alice.send_htlc(5_000_000, payment_hash(2), 700_000, &&logger).unwrap().unwrap();
		bob.update_add_htlc(&update_add, &&logger).unwrap();
		let (commitment_signed, _) = alice.send_commitment(&&logger).unwrap();
		bob.commitment_signed(&commitment_signed, &&logger).unwrap();
		let (revoke_and_ack, _) = bob.revoke_current_commitment(&&logger).unwrap();

		match alice.revoke_and_ack(&revoke_and_ack, &&logger) {
			Err(ChannelError::InvalidRevocation(err)) => assert!(err.contains("did not match")),
			_ => panic!("a secret inconsistent with earlier ones must be refused"),
		}
		assert!(alice.is_awaiting_remote_revoke());
		assert_eq!(alice.get_signer().get_enforcement_state().last_counterparty_revoked_commitment, INITIAL_COMMITMENT_NUMBER);
	}

	#[test]
	fn test_force_close_drops_unsigned_proposals() {
		let logger = TestLogger::new();
		let config = UserConfig::default();
		let (mut alice, mut bob) = funded_channels(&config, &config, &logger);

		let hash = payment_hash(1);
		let update_add = alice.send_htlc(10_000_000, hash, 700_000, &&logger).unwrap().unwrap();
		bob.update_add_htlc(&update_add, &&logger).unwrap();
		assert_eq!(alice.pending_htlc_count(), 1);
		assert_eq!(bob.pending_htlc_count(), 1);

		let shutdown = alice.force_close(&&logger).unwrap();
		assert_eq!(shutdown.dropped_outbound_htlcs, vec![hash]);
		assert!(shutdown.holder_commitment_tx.is_some());
		assert_eq!(alice.pending_htlc_count(), 0);
		assert_eq!(alice.get_available_balances().balance_msat, 80_000_000);

		let shutdown = bob.force_close(&&logger).unwrap();
		assert!(shutdown.dropped_outbound_htlcs.is_empty());
		assert_eq!(bob.pending_htlc_count(), 0);
		logger.assert_log_contains("lightning_channel::ln::channel", "dropping outbound HTLC 0 we never signed for", 1);
		logger.assert_log_contains("lightning_channel::ln::channel", "dropping inbound HTLC 0 we never committed to", 1);
	}

	#[test]
	fn test_anchor_channel_commitments() {
		let logger = TestLogger::new();
		let mut config = UserConfig::default();
		config.negotiate_anchors_zero_fee_htlc_tx = true;
		let (alice, bob) = funded_channels(&config, &config, &logger);

		let fee_sat = commit_tx_fee_sat(1000, 0, true);
		let alice_commitment = alice.holder_commitment().unwrap();
		assert_eq!(alice_commitment.fee_sat, fee_sat);
		assert_eq!(alice_commitment.tx.to_broadcaster_value_sat(), 80_000 - fee_sat - 2 * ANCHOR_OUTPUT_VALUE_SATOSHI);
		assert_eq!(alice_commitment.tx.to_countersignatory_value_sat(), 20_000);
		assert_eq!(alice_commitment.tx.trust().built_transaction().transaction.output.len(), 4);

		// The funder pays for the anchors on both commitments.
		let bob_commitment = bob.holder_commitment().unwrap();
		assert_eq!(bob_commitment.tx.to_broadcaster_value_sat(), 20_000);
		assert_eq!(bob_commitment.tx.to_countersignatory_value_sat(), 80_000 - fee_sat - 2 * ANCHOR_OUTPUT_VALUE_SATOSHI);
	}

	#[test]
	fn test_force_close_unfunded_channel() {
		let logger = TestLogger::new();
		let mut alice = outbound_channel(&UserConfig::default());
		let shutdown = alice.force_close(&&logger).unwrap();
		assert_eq!(shutdown.monitor_update, None);
		assert_eq!(shutdown.holder_commitment_tx, None);
		assert_eq!(alice.state(), ChannelState::Closed);
		assert!(alice.force_close(&&logger).is_err());
		assert!(alice.closing_tx_confirmed().is_err());
	}
}
