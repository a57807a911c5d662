// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! A thread-safe wrapper around a [`Channel`] which persists every state transition before
//! releasing the messages depending on it.
//!
//! Every method locks the channel for its whole duration, so concurrent callers see each
//! operation either fully applied or not at all. If an update can't be persisted, or the
//! counterparty violates the protocol, the channel is force-closed and our latest commitment
//! transaction is broadcast.

use bitcoin::transaction::OutPoint;

use crate::chain::chaininterface::BroadcasterInterface;
use crate::chain::channelmonitor::ChannelMonitorUpdate;
use crate::chain::{ChannelMonitorUpdateStatus, Filter, Persist, WatchedOutput};
use crate::ln::channel::{AvailableBalances, Channel, ChannelError, ChannelState, RevokeAndACKResult};
use crate::ln::msgs;
use crate::ln::types::{ChannelId, PaymentHash, PaymentPreimage};
use crate::sign::ecdsa::EcdsaChannelSigner;
use crate::sync::Mutex;
use crate::util::errors::APIError;
use crate::util::logger::{Logger, WithContext};

#[allow(unused_imports)]
use crate::prelude::*;

use core::fmt;
use core::mem;
use core::ops::Deref;

/// An error returned by a [`ChannelHandle`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandleError {
	/// The channel refused the operation. If [`ChannelError::is_fatal`], the channel has been
	/// force-closed.
	Channel(ChannelError),
	/// The update with the given id could not be persisted. The message depending on it was not
	/// released and the channel has been force-closed.
	PersistFailed {
		/// The id of the update which failed to persist.
		update_id: u64,
	},
	/// A previous holder of the channel lock panicked.
	LockPoisoned,
}

impl fmt::Display for HandleError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			HandleError::Channel(e) => write!(f, "{}", e),
			HandleError::PersistFailed { update_id } => write!(f, "Failed to persist channel update {}", update_id),
			HandleError::LockPoisoned => f.write_str("Channel lock poisoned"),
		}
	}
}

impl From<APIError> for HandleError {
	fn from(e: APIError) -> Self {
		HandleError::Channel(ChannelError::Ignore(e))
	}
}

macro_rules! try_chan_op {
	($self: ident, $chan: ident, $res: expr) => {
		match $res {
			Ok(res) => res,
			Err(e) => return Err($self.handle_error(&mut *$chan, e)),
		}
	};
}

/// Owns a [`Channel`] and drives it against a [`Persist`] implementation, a
/// [`BroadcasterInterface`] and, optionally, a [`Filter`] which is told about the funding output.
pub struct ChannelHandle<SP: EcdsaChannelSigner, B: Deref, P: Deref, F: Deref, L: Deref>
where
	B::Target: BroadcasterInterface,
	P::Target: Persist,
	F::Target: Filter,
	L::Target: Logger,
{
	channel: Mutex<Channel<SP>>,
	broadcaster: B,
	persister: P,
	chain_source: Option<F>,
	logger: L,
}

impl<SP: EcdsaChannelSigner, B: Deref, P: Deref, F: Deref, L: Deref> ChannelHandle<SP, B, P, F, L>
where
	B::Target: BroadcasterInterface,
	P::Target: Persist,
	F::Target: Filter,
	L::Target: Logger,
{
	/// Wraps `channel`.
	pub fn new(channel: Channel<SP>, broadcaster: B, persister: P, chain_source: Option<F>, logger: L) -> Self {
		ChannelHandle { channel: Mutex::new(channel), broadcaster, persister, chain_source, logger }
	}

	fn lock(&self) -> Result<crate::sync::MutexGuard<'_, Channel<SP>>, HandleError> {
		self.channel.lock().map_err(|_| HandleError::LockPoisoned)
	}

	/// Runs `f` with shared access to the channel.
	pub fn with_channel<R, G: FnOnce(&Channel<SP>) -> R>(&self, f: G) -> Result<R, HandleError> {
		let chan = self.lock()?;
		Ok(f(&chan))
	}

	/// The current channel id.
	pub fn channel_id(&self) -> Result<ChannelId, HandleError> {
		self.with_channel(|chan| chan.channel_id())
	}

	/// The channel's lifecycle state.
	pub fn state(&self) -> Result<ChannelState, HandleError> {
		self.with_channel(|chan| chan.state())
	}

	/// See [`Channel::get_available_balances`].
	pub fn get_available_balances(&self) -> Result<AvailableBalances, HandleError> {
		self.with_channel(|chan| chan.get_available_balances())
	}

	fn persist(&self, chan: &mut Channel<SP>, update: ChannelMonitorUpdate) -> Result<(), HandleError> {
		let logger = WithContext::from(&self.logger, None, Some(update.channel_id), None);
		match self.persister.persist_channel_update(update.channel_id, &update) {
			ChannelMonitorUpdateStatus::Completed => {
				log_trace!(logger, "Persisted update {} with {} steps", update.update_id, update.updates.len());
				Ok(())
			},
			ChannelMonitorUpdateStatus::UnrecoverableError => {
				log_error!(logger, "Failed to persist update {}, force-closing channel {}", update.update_id, &update.channel_id);
				self.close_channel(chan, false);
				Err(HandleError::PersistFailed { update_id: update.update_id })
			},
		}
	}

	fn close_channel(&self, chan: &mut Channel<SP>, persist_closure: bool) {
		let shutdown = match chan.force_close(&self.logger) {
			Ok(shutdown) => shutdown,
			Err(_) => return,
		};
		if let Some(tx) = shutdown.holder_commitment_tx {
			self.broadcaster.broadcast_transactions(&[&tx]);
		}
		if let Some(update) = shutdown.monitor_update {
			if persist_closure {
				match self.persister.persist_channel_update(update.channel_id, &update) {
					ChannelMonitorUpdateStatus::Completed => {},
					ChannelMonitorUpdateStatus::UnrecoverableError => {
						let logger = WithContext::from(&self.logger, None, Some(update.channel_id), None);
						log_error!(logger, "Failed to persist force-close update {} for channel {}", update.update_id, &update.channel_id);
					},
				}
			}
		}
	}

	fn handle_error(&self, chan: &mut Channel<SP>, err: ChannelError) -> HandleError {
		if err.is_fatal() {
			let logger = WithContext::from(&self.logger, None, Some(chan.channel_id()), None);
			log_error!(logger, "Force-closing channel {}: {}", &chan.channel_id(), err);
			self.close_channel(chan, true);
		}
		HandleError::Channel(err)
	}

	fn watch_funding_output(&self, chan: &Channel<SP>) {
		if let (Some(chain_source), Some(params)) = (self.chain_source.as_ref(), chan.get_channel_parameters()) {
			chain_source.register_output(WatchedOutput {
				outpoint: params.funding_outpoint,
				script_pubkey: params.funding_redeemscript().to_p2wsh(),
			});
		}
	}

	/// See [`Channel::get_open_channel`].
	pub fn get_open_channel(&self) -> Result<msgs::OpenChannel, HandleError> {
		let mut chan = self.lock()?;
		Ok(try_chan_op!(self, chan, chan.get_open_channel()))
	}

	/// See [`Channel::accept_inbound_channel`].
	pub fn accept_inbound_channel(&self) -> Result<msgs::AcceptChannel, HandleError> {
		let mut chan = self.lock()?;
		Ok(try_chan_op!(self, chan, chan.accept_inbound_channel()))
	}

	/// See [`Channel::accept_channel`].
	pub fn accept_channel(&self, msg: &msgs::AcceptChannel) -> Result<(), HandleError> {
		let mut chan = self.lock()?;
		try_chan_op!(self, chan, chan.accept_channel(msg));
		Ok(())
	}

	/// See [`Channel::get_funding_created`].
	pub fn get_funding_created(&self, funding_outpoint: OutPoint) -> Result<msgs::FundingCreated, HandleError> {
		let mut chan = self.lock()?;
		Ok(try_chan_op!(self, chan, chan.get_funding_created(funding_outpoint, &self.logger)))
	}

	/// Handles funding_created, persisting the funded channel before returning our funding_signed.
	pub fn funding_created(&self, msg: &msgs::FundingCreated) -> Result<msgs::FundingSigned, HandleError> {
		let mut chan = self.lock()?;
		let (funding_signed, update) = try_chan_op!(self, chan, chan.funding_created(msg, &self.logger));
		self.persist(&mut chan, update)?;
		self.watch_funding_output(&chan);
		Ok(funding_signed)
	}

	/// Handles funding_signed. Once this returns the funding transaction may be broadcast.
	pub fn funding_signed(&self, msg: &msgs::FundingSigned) -> Result<(), HandleError> {
		let mut chan = self.lock()?;
		let update = try_chan_op!(self, chan, chan.funding_signed(msg, &self.logger));
		self.persist(&mut chan, update)?;
		self.watch_funding_output(&chan);
		Ok(())
	}

	/// See [`Channel::get_channel_ready`].
	pub fn get_channel_ready(&self) -> Result<msgs::ChannelReady, HandleError> {
		let mut chan = self.lock()?;
		Ok(try_chan_op!(self, chan, chan.get_channel_ready()))
	}

	/// See [`Channel::channel_ready`].
	pub fn channel_ready(&self, msg: &msgs::ChannelReady) -> Result<(), HandleError> {
		let mut chan = self.lock()?;
		try_chan_op!(self, chan, chan.channel_ready(msg, &self.logger));
		Ok(())
	}

	/// See [`Channel::send_htlc`].
	pub fn send_htlc(
		&self, amount_msat: u64, payment_hash: PaymentHash, cltv_expiry: u32,
	) -> Result<Option<msgs::UpdateAddHTLC>, HandleError> {
		let mut chan = self.lock()?;
		Ok(chan.send_htlc(amount_msat, payment_hash, cltv_expiry, &self.logger)?)
	}

	/// See [`Channel::update_add_htlc`].
	pub fn update_add_htlc(&self, msg: &msgs::UpdateAddHTLC) -> Result<(), HandleError> {
		let mut chan = self.lock()?;
		try_chan_op!(self, chan, chan.update_add_htlc(msg, &self.logger));
		Ok(())
	}

	/// See [`Channel::fulfill_htlc`].
	pub fn fulfill_htlc(
		&self, htlc_id: u64, payment_preimage: PaymentPreimage,
	) -> Result<Option<msgs::UpdateFulfillHTLC>, HandleError> {
		let mut chan = self.lock()?;
		Ok(try_chan_op!(self, chan, chan.fulfill_htlc(htlc_id, payment_preimage, &self.logger)))
	}

	/// See [`Channel::fail_htlc`].
	pub fn fail_htlc(&self, htlc_id: u64, reason: Vec<u8>) -> Result<Option<msgs::UpdateFailHTLC>, HandleError> {
		let mut chan = self.lock()?;
		Ok(try_chan_op!(self, chan, chan.fail_htlc(htlc_id, reason, &self.logger)))
	}

	/// See [`Channel::update_fulfill_htlc`].
	pub fn update_fulfill_htlc(&self, msg: &msgs::UpdateFulfillHTLC) -> Result<u64, HandleError> {
		let mut chan = self.lock()?;
		Ok(try_chan_op!(self, chan, chan.update_fulfill_htlc(msg)))
	}

	/// See [`Channel::update_fail_htlc`].
	pub fn update_fail_htlc(&self, msg: &msgs::UpdateFailHTLC) -> Result<(), HandleError> {
		let mut chan = self.lock()?;
		try_chan_op!(self, chan, chan.update_fail_htlc(msg));
		Ok(())
	}

	/// Signs our counterparty's next commitment, persisting it before returning the message.
	pub fn send_commitment(&self) -> Result<msgs::CommitmentSigned, HandleError> {
		let mut chan = self.lock()?;
		let (commitment_signed, update) = try_chan_op!(self, chan, chan.send_commitment(&self.logger));
		self.persist(&mut chan, update)?;
		Ok(commitment_signed)
	}

	fn maybe_send_commitment(&self, chan: &mut Channel<SP>) -> Result<Option<msgs::CommitmentSigned>, HandleError> {
		if !chan.needs_commitment() || chan.is_awaiting_remote_revoke() || chan.state() != ChannelState::Active {
			return Ok(None);
		}
		match chan.send_commitment(&self.logger) {
			Ok((commitment_signed, update)) => {
				self.persist(chan, update)?;
				Ok(Some(commitment_signed))
			},
			Err(ChannelError::Ignore(e)) => {
				let logger = WithContext::from(&self.logger, None, Some(chan.channel_id()), None);
				log_debug!(logger, "Not sending commitment_signed yet: {}", e);
				Ok(None)
			},
			Err(e) => Err(self.handle_error(chan, e)),
		}
	}

	/// Handles a commitment_signed, returning our revoke_and_ack and, if we have changes of our
	/// own pending, our commitment_signed. Send them in that order.
	///
	/// The new commitment is persisted first, then the revocation of the previous one. The
	/// revocation secret is never returned unless both succeed.
	pub fn commitment_signed(
		&self, msg: &msgs::CommitmentSigned,
	) -> Result<(msgs::RevokeAndACK, Option<msgs::CommitmentSigned>), HandleError> {
		let mut chan = self.lock()?;
		let update = try_chan_op!(self, chan, chan.commitment_signed(msg, &self.logger));
		self.persist(&mut chan, update)?;
		let (revoke_and_ack, revocation_update) = try_chan_op!(self, chan, chan.revoke_current_commitment(&self.logger));
		debug_assert!(revocation_update.reveals_holder_secret());
		self.persist(&mut chan, revocation_update)?;
		let commitment_signed = self.maybe_send_commitment(&mut chan)?;
		Ok((revoke_and_ack, commitment_signed))
	}

	/// Handles a revoke_and_ack. If it freed queued updates or promoted HTLCs our counterparty
	/// hasn't yet signed for, the returned [`msgs::CommitmentUpdate`] carries them along with our
	/// new commitment_signed.
	pub fn revoke_and_ack(
		&self, msg: &msgs::RevokeAndACK,
	) -> Result<(RevokeAndACKResult, Option<msgs::CommitmentUpdate>), HandleError> {
		let mut chan = self.lock()?;
		let (mut result, update) = try_chan_op!(self, chan, chan.revoke_and_ack(msg, &self.logger));
		self.persist(&mut chan, update)?;
		let commitment_update = self.maybe_send_commitment(&mut chan)?.map(|commitment_signed| {
			msgs::CommitmentUpdate {
				update_add_htlcs: mem::take(&mut result.update_add_htlcs),
				update_fulfill_htlcs: mem::take(&mut result.update_fulfill_htlcs),
				update_fail_htlcs: mem::take(&mut result.update_fail_htlcs),
				commitment_signed,
			}
		});
		Ok((result, commitment_update))
	}

	/// Force-closes the channel, broadcasting our latest commitment transaction, and returns the
	/// payment hashes of the outbound HTLCs our counterparty never got a signed commitment for.
	///
	/// The commitment is broadcast even if recording the closure fails, in which case
	/// [`HandleError::PersistFailed`] is returned.
	pub fn force_close(&self) -> Result<Vec<PaymentHash>, HandleError> {
		let mut chan = self.lock()?;
		let shutdown = try_chan_op!(self, chan, chan.force_close(&self.logger));
		if let Some(tx) = shutdown.holder_commitment_tx {
			self.broadcaster.broadcast_transactions(&[&tx]);
		}
		if let Some(update) = shutdown.monitor_update {
			self.persist(&mut chan, update)?;
		}
		Ok(shutdown.dropped_outbound_htlcs)
	}

	/// See [`Channel::closing_tx_confirmed`].
	pub fn closing_tx_confirmed(&self) -> Result<(), HandleError> {
		let mut chan = self.lock()?;
		try_chan_op!(self, chan, chan.closing_tx_confirmed());
		Ok(())
	}
}
