// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Error types live here.

#[allow(unused_imports)]
use crate::prelude::*;

use core::fmt;

/// Indicates an error on the client's part (usually some variant of attempting to use too-low or
/// too-high values). None of these leave the channel in a modified state.
#[derive(Clone, PartialEq, Eq)]
pub enum APIError {
	/// Indicates the API was wholly misused (see err for more). Cases where these can be returned
	/// are documented, but generally indicates some precondition of a function was violated.
	APIMisuseError {
		/// A human-readable error message
		err: String,
	},
	/// We were unable to complete the request as the channel is in a state which does not allow
	/// it, eg it is not yet open, is closing, or is waiting on a revocation from our counterparty.
	ChannelUnavailable {
		/// A human-readable error message
		err: String,
	},
	/// Adding the HTLC would leave the sender below its channel reserve (or unable to pay the
	/// commitment transaction fee, if it is the channel funder).
	InsufficientBalance {
		/// The most we could have sent right now.
		available_msat: u64,
		/// The amount which was requested.
		requested_msat: u64,
	},
	/// Adding the HTLC would push the number of HTLCs in flight to the counterparty beyond the
	/// limit they set.
	TooManyHTLCs {
		/// The counterparty's `max_accepted_htlcs`.
		max_accepted_htlcs: u16,
	},
	/// The HTLC amount is below the dust limit on both commitment transactions and would only
	/// ever be burned to fees.
	DustHTLC {
		/// The amount which was requested.
		amount_msat: u64,
		/// The smallest amount which would appear as an output on at least one of the two
		/// commitment transactions.
		dust_limit_msat: u64,
	},
	/// The HTLC amount is below the counterparty's `htlc_minimum_msat`.
	HTLCBelowMinimum {
		/// The amount which was requested.
		amount_msat: u64,
		/// The counterparty's minimum.
		htlc_minimum_msat: u64,
	},
	/// Adding the HTLC would exceed the counterparty's `max_htlc_value_in_flight_msat`.
	MaxPendingAmountExceeded {
		/// The counterparty's in-flight cap.
		max_htlc_value_in_flight_msat: u64,
	},
	/// A new commitment was requested, but nothing has changed since the last one we signed.
	NoChanges,
}

impl fmt::Debug for APIError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match *self {
			APIError::APIMisuseError { ref err } => write!(f, "Misuse error: {}", err),
			APIError::ChannelUnavailable { ref err } => write!(f, "Channel unavailable: {}", err),
			APIError::InsufficientBalance { available_msat, requested_msat } => write!(
				f,
				"Insufficient balance: requested {} msat, only {} msat available",
				requested_msat, available_msat
			),
			APIError::TooManyHTLCs { max_accepted_htlcs } => {
				write!(f, "Cannot push more than their max accepted HTLCs ({})", max_accepted_htlcs)
			},
			APIError::DustHTLC { amount_msat, dust_limit_msat } => write!(
				f,
				"HTLC of {} msat is below the dust limit of {} msat",
				amount_msat, dust_limit_msat
			),
			APIError::HTLCBelowMinimum { amount_msat, htlc_minimum_msat } => write!(
				f,
				"Cannot send less than their minimum HTLC value ({} < {})",
				amount_msat, htlc_minimum_msat
			),
			APIError::MaxPendingAmountExceeded { max_htlc_value_in_flight_msat } => write!(
				f,
				"Cannot send value that would put us over the max HTLC value in flight our peer will accept ({})",
				max_htlc_value_in_flight_msat
			),
			APIError::NoChanges => {
				f.write_str("Cannot create a commitment with no changes since the last one")
			},
		}
	}
}

impl fmt::Display for APIError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		fmt::Debug::fmt(self, f)
	}
}
