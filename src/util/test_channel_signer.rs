// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

use crate::ln::chan_utils::{
	ChannelPublicKeys, ChannelTransactionParameters, CommitmentTransaction, HolderCommitmentTransaction,
	TrustedCommitmentTransaction,
};
use crate::sign::ecdsa::EcdsaChannelSigner;
use crate::sign::{ChannelSigner, InMemorySigner, SignDescriptor, SignError};
use crate::sync::{Arc, Mutex, MutexGuard};

use core::cmp;

use bitcoin::secp256k1;
use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use bitcoin::transaction::Transaction;

#[allow(unused_imports)]
use crate::prelude::*;

/// Initial value for revoked commitment downward counter
pub const INITIAL_REVOKED_COMMITMENT_NUMBER: u64 = 1 << 48;

/// A signer that enforces some policy checks. They include:
///
/// - When signing, the holder transaction has not been revoked
/// - When revoking, the holder transaction has not been signed
/// - The holder commitment number is monotonic and without gaps
/// - The revoked holder commitment number is monotonic and without gaps
/// - There is at least one unrevoked holder transaction at all times
/// - The counterparty commitment number is monotonic and without gaps
/// - The pre-derived keys and pre-built transaction in CommitmentTransaction were correctly built
///
/// Signing a revoked holder commitment is refused with [`SignError::Unavailable`] rather than a
/// panic so that tests can observe the refusal.
pub struct TestChannelSigner {
	pub inner: InMemorySigner,
	/// Channel state used for policy enforcement
	pub state: Arc<Mutex<EnforcementState>>,
	/// When `true` (the default), the signer will respond immediately with signatures. When `false`,
	/// the signer will return an error indicating that it is unavailable.
	pub available: Arc<Mutex<bool>>,
}

impl PartialEq for TestChannelSigner {
	fn eq(&self, o: &Self) -> bool {
		Arc::ptr_eq(&self.state, &o.state)
	}
}

impl TestChannelSigner {
	/// Construct a TestChannelSigner
	pub fn new(inner: InMemorySigner) -> Self {
		Self { inner, state: Arc::new(Mutex::new(EnforcementState::new())), available: Arc::new(Mutex::new(true)) }
	}

	pub fn get_enforcement_state(&self) -> MutexGuard<EnforcementState> {
		self.state.lock().unwrap()
	}

	/// Marks the signer's availability.
	///
	/// When `true`, methods are forwarded to the underlying signer as normal. When `false`,
	/// signing methods return [`SignError::Unavailable`].
	pub fn set_available(&self, available: bool) {
		*self.available.lock().unwrap() = available;
	}

	fn is_available(&self) -> bool {
		*self.available.lock().unwrap()
	}

	fn verify_counterparty_commitment_tx<'a, T: secp256k1::Verification>(
		&self, commitment_tx: &'a CommitmentTransaction, secp_ctx: &Secp256k1<T>,
	) -> TrustedCommitmentTransaction<'a> {
		commitment_tx
			.verify(
				&self.inner.get_channel_parameters().unwrap().as_counterparty_broadcastable(),
				self.inner.counterparty_pubkeys().unwrap(),
				self.inner.pubkeys(),
				secp_ctx,
			)
			.expect("derived different per-tx keys or built transaction")
	}

	fn verify_holder_commitment_tx<'a, T: secp256k1::Verification>(
		&self, commitment_tx: &'a CommitmentTransaction, secp_ctx: &Secp256k1<T>,
	) -> TrustedCommitmentTransaction<'a> {
		commitment_tx
			.verify(
				&self.inner.get_channel_parameters().unwrap().as_holder_broadcastable(),
				self.inner.pubkeys(),
				self.inner.counterparty_pubkeys().unwrap(),
				secp_ctx,
			)
			.expect("derived different per-tx keys or built transaction")
	}
}

impl ChannelSigner for TestChannelSigner {
	fn get_per_commitment_point(
		&self, idx: u64, secp_ctx: &Secp256k1<secp256k1::All>,
	) -> Result<PublicKey, SignError> {
		self.inner.get_per_commitment_point(idx, secp_ctx)
	}

	fn release_commitment_secret(&self, idx: u64) -> Result<[u8; 32], SignError> {
		{
			let mut state = self.state.lock().unwrap();
			assert!(idx == state.last_holder_revoked_commitment || idx == state.last_holder_revoked_commitment - 1, "can only revoke the current or next unrevoked commitment - trying {}, last revoked {}", idx, state.last_holder_revoked_commitment);
			assert!(idx > state.last_holder_commitment, "cannot revoke the last holder commitment - attempted to revoke {} last commitment {}", idx, state.last_holder_commitment);
			state.last_holder_revoked_commitment = idx;
		}
		self.inner.release_commitment_secret(idx)
	}

	fn validate_holder_commitment(&self, holder_tx: &HolderCommitmentTransaction) -> Result<(), ()> {
		let mut state = self.state.lock().unwrap();
		let idx = holder_tx.commitment_number();
		assert!(idx == state.last_holder_commitment || idx == state.last_holder_commitment - 1, "expecting to validate the current or next holder commitment - trying {}, current {}", idx, state.last_holder_commitment);
		state.last_holder_commitment = idx;
		Ok(())
	}

	fn validate_counterparty_revocation(&self, idx: u64, _secret: &SecretKey) -> Result<(), ()> {
		if !self.is_available() {
			return Err(());
		}
		let mut state = self.state.lock().unwrap();
		assert!(idx == state.last_counterparty_revoked_commitment || idx == state.last_counterparty_revoked_commitment - 1, "expecting to validate the current or next counterparty revocation - trying {}, current {}", idx, state.last_counterparty_revoked_commitment);
		state.last_counterparty_revoked_commitment = idx;
		Ok(())
	}

	fn pubkeys(&self) -> &ChannelPublicKeys {
		self.inner.pubkeys()
	}

	fn provide_channel_parameters(&mut self, channel_parameters: &ChannelTransactionParameters) {
		self.inner.provide_channel_parameters(channel_parameters)
	}

	fn sign_with_descriptor(
		&self, tx: &Transaction, descriptor: &SignDescriptor, secp_ctx: &Secp256k1<secp256k1::All>,
	) -> Result<Signature, SignError> {
		if !self.is_available() {
			return Err(SignError::Unavailable);
		}
		self.inner.sign_with_descriptor(tx, descriptor, secp_ctx)
	}
}

impl EcdsaChannelSigner for TestChannelSigner {
	fn sign_counterparty_commitment(
		&self, commitment_tx: &CommitmentTransaction, secp_ctx: &Secp256k1<secp256k1::All>,
	) -> Result<(Signature, Vec<Signature>), SignError> {
		self.verify_counterparty_commitment_tx(commitment_tx, secp_ctx);

		{
			if !self.is_available() {
				return Err(SignError::Unavailable);
			}
			let mut state = self.state.lock().unwrap();
			let actual_commitment_number = commitment_tx.commitment_number();
			let last_commitment_number = state.last_counterparty_commitment;
			// These commitment numbers are backwards counting.  We expect either the same as the previously encountered,
			// or the next one.
			assert!(last_commitment_number == actual_commitment_number || last_commitment_number - 1 == actual_commitment_number, "{} doesn't come after {}", actual_commitment_number, last_commitment_number);
			// Ensure that the counterparty doesn't get more than two broadcastable commitments -
			// the last and the one we are trying to sign
			assert!(actual_commitment_number >= state.last_counterparty_revoked_commitment - 2, "cannot sign a commitment if second to last wasn't revoked - signing {} revoked {}", actual_commitment_number, state.last_counterparty_revoked_commitment);
			state.last_counterparty_commitment = cmp::min(last_commitment_number, actual_commitment_number)
		}

		self.inner.sign_counterparty_commitment(commitment_tx, secp_ctx)
	}

	fn sign_holder_commitment(
		&self, commitment_tx: &HolderCommitmentTransaction, secp_ctx: &Secp256k1<secp256k1::All>,
	) -> Result<Signature, SignError> {
		if !self.is_available() {
			return Err(SignError::Unavailable);
		}
		let trusted_tx = self.verify_holder_commitment_tx(commitment_tx, secp_ctx);
		let commitment_number = trusted_tx.commitment_number();
		{
			let state = self.state.lock().unwrap();
			if state.last_holder_revoked_commitment - 1 != commitment_number && state.last_holder_revoked_commitment - 2 != commitment_number {
				return Err(SignError::Unavailable);
			}
		}
		self.inner.sign_holder_commitment(commitment_tx, secp_ctx)
	}
}

/// The state used by [`TestChannelSigner`] in order to enforce policy checks
#[derive(Clone)]
pub struct EnforcementState {
	/// The last counterparty commitment number we signed, backwards counting
	pub last_counterparty_commitment: u64,
	/// The last counterparty commitment they revoked, backwards counting
	pub last_counterparty_revoked_commitment: u64,
	/// The last holder commitment number we revoked, backwards counting
	pub last_holder_revoked_commitment: u64,
	/// The last validated holder commitment number, backwards counting
	pub last_holder_commitment: u64,
}

impl EnforcementState {
	/// Enforcement state for a new channel
	pub fn new() -> Self {
		EnforcementState {
			last_counterparty_commitment: INITIAL_REVOKED_COMMITMENT_NUMBER,
			last_counterparty_revoked_commitment: INITIAL_REVOKED_COMMITMENT_NUMBER,
			last_holder_revoked_commitment: INITIAL_REVOKED_COMMITMENT_NUMBER,
			last_holder_commitment: INITIAL_REVOKED_COMMITMENT_NUMBER,
		}
	}
}
