// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Various user-configurable channel limits and settings which a [`Channel`] and the
//! [`JusticeAssembler`] apply for you.
//!
//! [`Channel`]: crate::ln::channel::Channel
//! [`JusticeAssembler`]: crate::chain::justice::JusticeAssembler

use crate::ln::channel::{MAX_LOCAL_BREAKDOWN_TIMEOUT, MIN_CHAN_DUST_LIMIT_SATOSHIS};
use crate::ln::chan_utils::MAX_HTLCS;

/// The limits one side of a channel imposes on what its counterparty may do on the commitment
/// transactions the side holds. Each party announces its own in `open_channel`/`accept_channel`
/// and they are fixed for the lifetime of the channel.
///
/// Default::default() provides sane defaults.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ChannelConfig {
	/// Outputs below this value are trimmed from commitment transactions we hold.
	///
	/// Default value: 546.
	pub dust_limit_satoshis: u64,
	/// The amount our counterparty must always keep to themselves, ensuring they have something
	/// to lose if they broadcast a revoked state.
	///
	/// Default value: 10_000.
	pub channel_reserve_satoshis: u64,
	/// The maximum total value of HTLCs our counterparty may have pending to us at any time.
	///
	/// Default value: u64::max_value.
	pub max_htlc_value_in_flight_msat: u64,
	/// The smallest HTLC we will accept.
	///
	/// Default value: 1.
	pub htlc_minimum_msat: u64,
	/// The maximum number of HTLCs our counterparty may have pending to us at any time.
	///
	/// Default value: 50.
	pub max_accepted_htlcs: u16,
	/// The number of blocks our counterparty must wait to claim their balance from a commitment
	/// transaction they broadcast, ie the window we have to punish a revoked broadcast.
	///
	/// Default value: 144.
	pub to_self_delay: u16,
}

impl Default for ChannelConfig {
	fn default() -> Self {
		ChannelConfig {
			dust_limit_satoshis: 546,
			channel_reserve_satoshis: 10_000,
			max_htlc_value_in_flight_msat: u64::max_value(),
			htlc_minimum_msat: 1,
			max_accepted_htlcs: 50,
			to_self_delay: 144,
		}
	}
}

/// Bounds we apply to the [`ChannelConfig`] our counterparty announces.
///
/// Use 0/<type>::max_value() as appropriate to skip checking.
#[derive(Copy, Clone, Debug)]
pub struct ChannelHandshakeLimits {
	/// Minimum allowed satoshis when a channel is funded, this is supplied by the sender and so
	/// only applies to inbound channels.
	///
	/// Default value: 1000.
	pub min_funding_satoshis: u64,
	/// The counterparty sets a limit on the minimum size of HTLCs we can send to them. This allows
	/// you to limit the maximum minimum-size they can require.
	///
	/// Default value: u64::max_value.
	pub max_htlc_minimum_msat: u64,
	/// The counterparty will require we keep a certain amount to ourselves at all times. This
	/// limits how much that can be.
	///
	/// Default value: u64::max_value.
	pub max_channel_reserve_satoshis: u64,
	/// The smallest `max_accepted_htlcs` we tolerate.
	///
	/// Default value: 1.
	pub min_max_accepted_htlcs: u16,
	/// The largest dust limit we tolerate. A large dust limit lets the counterparty trim a large
	/// share of the channel to fees.
	///
	/// Default value: 10_000.
	pub max_dust_limit_satoshis: u64,
	/// The longest we're willing to wait to claim money back to us.
	///
	/// Default value: 2016.
	pub their_to_self_delay: u16,
}

impl Default for ChannelHandshakeLimits {
	fn default() -> Self {
		ChannelHandshakeLimits {
			min_funding_satoshis: 1000,
			max_htlc_minimum_msat: u64::max_value(),
			max_channel_reserve_satoshis: u64::max_value(),
			min_max_accepted_htlcs: 1,
			max_dust_limit_satoshis: 10_000,
			their_to_self_delay: MAX_LOCAL_BREAKDOWN_TIMEOUT,
		}
	}
}

impl ChannelHandshakeLimits {
	/// Checks the counterparty's announced config against these limits, returning a description
	/// of the first violation.
	pub fn check_counterparty_config(&self, config: &ChannelConfig, channel_value_satoshis: u64) -> Result<(), &'static str> {
		if config.dust_limit_satoshis < MIN_CHAN_DUST_LIMIT_SATOSHIS {
			return Err("dust_limit_satoshis is below the protocol minimum");
		}
		if config.dust_limit_satoshis > self.max_dust_limit_satoshis {
			return Err("dust_limit_satoshis is larger than we accept");
		}
		if config.htlc_minimum_msat > self.max_htlc_minimum_msat {
			return Err("htlc_minimum_msat is larger than we accept");
		}
		if config.htlc_minimum_msat >= channel_value_satoshis * 1000 {
			return Err("htlc_minimum_msat is larger than the channel");
		}
		if config.channel_reserve_satoshis > self.max_channel_reserve_satoshis {
			return Err("channel_reserve_satoshis is larger than we accept");
		}
		if config.channel_reserve_satoshis > channel_value_satoshis {
			return Err("channel_reserve_satoshis is larger than the channel");
		}
		if config.max_accepted_htlcs < self.min_max_accepted_htlcs {
			return Err("max_accepted_htlcs is smaller than we accept");
		}
		if config.max_accepted_htlcs > MAX_HTLCS {
			return Err("max_accepted_htlcs is above the protocol maximum");
		}
		if config.to_self_delay > self.their_to_self_delay {
			return Err("to_self_delay is longer than we accept");
		}
		if config.to_self_delay == 0 {
			return Err("to_self_delay must be non-zero");
		}
		Ok(())
	}
}

/// How a watchtower builds justice transactions.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct JusticeConfig {
	/// If one of the revoked outputs can't be given a valid witness, sweep the remaining ones
	/// anyway instead of giving up on the whole breach.
	///
	/// Default value: true.
	pub allow_partial_sweep: bool,
}

impl Default for JusticeConfig {
	fn default() -> Self {
		JusticeConfig { allow_partial_sweep: true }
	}
}

/// Top-level config which holds the per-channel and watchtower config structs.
///
/// Default::default() provides sane defaults for most configurations.
#[derive(Copy, Clone, Debug)]
pub struct UserConfig {
	/// The limits we announce to our counterparty on channels we open or accept.
	pub channel_config: ChannelConfig,
	/// The bounds we enforce on our counterparty's announced limits.
	pub handshake_limits: ChannelHandshakeLimits,
	/// Whether to open channels with (or accept channels requesting) anchor outputs and
	/// zero-fee second-level HTLC transactions.
	///
	/// Default value: false.
	pub negotiate_anchors_zero_fee_htlc_tx: bool,
	/// Justice transaction construction settings.
	pub justice_config: JusticeConfig,
}

impl Default for UserConfig {
	fn default() -> Self {
		UserConfig {
			channel_config: ChannelConfig::default(),
			handshake_limits: ChannelHandshakeLimits::default(),
			negotiate_anchors_zero_fee_htlc_tx: false,
			justice_config: JusticeConfig::default(),
		}
	}
}
