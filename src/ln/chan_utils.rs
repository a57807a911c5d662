// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Various utilities for building scripts and deriving keys related to channels. These are
//! largely of interest for those implementing the [`sign`] traits or a watchtower by hand.
//!
//! [`sign`]: crate::sign

use bitcoin::absolute::LockTime;
use bitcoin::hashes::hash160::Hash as Hash160;
use bitcoin::hashes::ripemd160::Hash as Ripemd160;
use bitcoin::hashes::sha256::Hash as Sha256;
use bitcoin::hashes::{Hash, HashEngine};
use bitcoin::opcodes;
use bitcoin::script::{Builder, Script, ScriptBuf};
use bitcoin::sighash::EcdsaSighashType;
use bitcoin::transaction::{OutPoint, Transaction, TxIn, TxOut, Version};
use bitcoin::{Amount, Sequence, Txid, WPubkeyHash, Witness};

use bitcoin::secp256k1::{self, ecdsa::Signature, Message, PublicKey, Scalar, Secp256k1, SecretKey};

use crate::crypto::fixed_time_eq;
use crate::crypto::utils::{p2wsh_sighash, sign};
use crate::ln::channel::{ANCHOR_OUTPUT_VALUE_SATOSHI, INITIAL_COMMITMENT_NUMBER};
use crate::ln::types::{PaymentHash, PaymentPreimage};
use crate::util::transaction_utils::sort_outputs;

use crate::prelude::*;
use core::cmp;
use core::fmt;
use core::ops::Deref;

/// Maximum number of one-way in-flight HTLC (protocol-level value).
pub const MAX_HTLCS: u16 = 483;
/// The weight of a BIP141 witnessScript for a BOLT3's "offered HTLC output" on a commitment transaction, non-anchor variant.
pub const OFFERED_HTLC_SCRIPT_WEIGHT: usize = 133;
/// The weight of a BIP141 witnessScript for a BOLT3's "offered HTLC output" on a commitment transaction, anchor variant.
pub const OFFERED_HTLC_SCRIPT_WEIGHT_ANCHORS: usize = 136;

/// The weight of a BIP141 witnessScript for a BOLT3's "received HTLC output" can vary in function of its CLTV argument value.
/// We define a range that encompasses both its non-anchors and anchors variants.
pub(crate) const MIN_ACCEPTED_HTLC_SCRIPT_WEIGHT: usize = 136;
/// The weight of a BIP141 witnessScript for a BOLT3's "received HTLC output" can vary in function of its CLTV argument value.
/// We define a range that encompasses both its non-anchors and anchors variants.
/// This is the maximum post-anchor value.
pub const MAX_ACCEPTED_HTLC_SCRIPT_WEIGHT: usize = 143;

/// The weight of a commitment transaction without any HTLC outputs.
pub const COMMITMENT_TX_BASE_WEIGHT: u64 = 724;
/// The weight of a commitment transaction with anchor outputs but no HTLC outputs.
pub const COMMITMENT_TX_BASE_ANCHOR_WEIGHT: u64 = 1124;
/// The weight each non-dust HTLC output adds to a commitment transaction.
pub const COMMITMENT_TX_WEIGHT_PER_HTLC: u64 = 172;

/// Gets the weight for an HTLC-Success transaction.
#[inline]
pub fn htlc_success_tx_weight(anchors: bool) -> u64 {
	const HTLC_SUCCESS_TX_WEIGHT: u64 = 703;
	const HTLC_SUCCESS_ANCHOR_TX_WEIGHT: u64 = 706;
	if anchors { HTLC_SUCCESS_ANCHOR_TX_WEIGHT } else { HTLC_SUCCESS_TX_WEIGHT }
}

/// Gets the weight for an HTLC-Timeout transaction.
#[inline]
pub fn htlc_timeout_tx_weight(anchors: bool) -> u64 {
	const HTLC_TIMEOUT_TX_WEIGHT: u64 = 663;
	const HTLC_TIMEOUT_ANCHOR_TX_WEIGHT: u64 = 666;
	if anchors { HTLC_TIMEOUT_ANCHOR_TX_WEIGHT } else { HTLC_TIMEOUT_TX_WEIGHT }
}

/// The fee the second-level transaction for an HTLC pays, which on non-anchor channels is
/// carved out of the HTLC value and thus counts towards whether the HTLC is dust.
#[inline]
pub fn second_stage_tx_fee_sat(feerate_per_kw: u32, offered: bool, anchors: bool) -> u64 {
	if anchors {
		0
	} else if offered {
		feerate_per_kw as u64 * htlc_timeout_tx_weight(false) / 1000
	} else {
		feerate_per_kw as u64 * htlc_success_tx_weight(false) / 1000
	}
}

/// The fee a commitment transaction carrying `num_htlcs` non-dust HTLC outputs pays.
#[inline]
pub fn commit_tx_fee_sat(feerate_per_kw: u32, num_htlcs: usize, anchors: bool) -> u64 {
	let base_weight = if anchors { COMMITMENT_TX_BASE_ANCHOR_WEIGHT } else { COMMITMENT_TX_BASE_WEIGHT };
	feerate_per_kw as u64 * (base_weight + num_htlcs as u64 * COMMITMENT_TX_WEIGHT_PER_HTLC) / 1000
}

/// Describes the type of HTLC claim as determined by analyzing the witness.
#[derive(PartialEq, Eq, Debug)]
pub enum HTLCClaim {
	/// Claims an offered output on a commitment transaction through the timeout path.
	OfferedTimeout,
	/// Claims an offered output on a commitment transaction through the success path.
	OfferedPreimage,
	/// Claims an accepted output on a commitment transaction through the timeout path.
	AcceptedTimeout,
	/// Claims an accepted output on a commitment transaction through the success path.
	AcceptedPreimage,
	/// Claims an offered/accepted output on a commitment transaction through the revocation path.
	Revocation,
}

impl HTLCClaim {
	/// Check if a given input witness attempts to claim a HTLC.
	pub fn from_witness(witness: &Witness) -> Option<Self> {
		let witness_script = witness.last()?;
		let second_to_last = witness.second_to_last()?;
		let is_offered_len = witness_script.len() == OFFERED_HTLC_SCRIPT_WEIGHT
			|| witness_script.len() == OFFERED_HTLC_SCRIPT_WEIGHT_ANCHORS;
		let is_accepted_len = witness_script.len() >= MIN_ACCEPTED_HTLC_SCRIPT_WEIGHT
			&& witness_script.len() <= MAX_ACCEPTED_HTLC_SCRIPT_WEIGHT;
		if !is_offered_len && !is_accepted_len {
			return None;
		}
		// The offered anchor script and the shortest accepted script share a length, so both
		// readings are tried.
		match (witness.len(), second_to_last.len()) {
			// <revocation sig> <revocationpubkey> <witness_script>
			(3, 33) => Some(Self::Revocation),
			// <remotehtlcsig> <payment_preimage> <witness_script>
			(3, 32) if is_offered_len => Some(Self::OfferedPreimage),
			// 0 <remotehtlcsig> <localhtlcsig> <> <witness_script>
			(5, 0) if is_offered_len => Some(Self::OfferedTimeout),
			// <remotehtlcsig> <> <witness_script>
			(3, 0) if is_accepted_len => Some(Self::AcceptedTimeout),
			// 0 <remotehtlcsig> <localhtlcsig> <payment_preimage> <witness_script>
			(5, 32) if is_accepted_len => Some(Self::AcceptedPreimage),
			_ => None,
		}
	}
}

/// Describes how a witness spends a revokeable (`to_local` or second-level HTLC) output.
#[derive(PartialEq, Eq, Debug)]
pub enum TxoutClaim {
	/// Spent by the revocation key.
	Revocation,
	/// Spent by the broadcaster after the contest delay.
	Delayed,
}

impl TxoutClaim {
	/// Check if a given input witness spends a revokeable output.
	pub fn from_witness(witness: &Witness) -> Option<Self> {
		if witness.len() != 3 {
			return None;
		}
		let witness_script = witness.last()?;
		if witness_script.len() > REVOKEABLE_REDEEMSCRIPT_MAX_LENGTH
			|| witness_script.first() != Some(&opcodes::all::OP_IF.to_u8())
		{
			return None;
		}
		match witness.second_to_last()? {
			[1] => Some(Self::Revocation),
			[] => Some(Self::Delayed),
			_ => None,
		}
	}
}

/// An error deriving a per-commitment key.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum KeyDerivationError {
	/// The tweak was zero or not a valid scalar (ie at least the curve order).
	InvalidTweak,
	/// Applying the tweak produced the point at infinity or a zero private key.
	InvalidKey,
}

impl fmt::Debug for KeyDerivationError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match *self {
			KeyDerivationError::InvalidTweak => f.write_str("Tweak is zero or out of range"),
			KeyDerivationError::InvalidKey => f.write_str("Tweaked key is invalid"),
		}
	}
}

impl fmt::Display for KeyDerivationError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		fmt::Debug::fmt(self, f)
	}
}

/// An error updating the revocation state of a channel.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum RevocationLedgerError {
	/// The provided secret does not derive the secrets we already hold, so at least one of them
	/// was not produced from the same seed.
	RevocationMismatch {
		/// The commitment number the secret was provided for.
		idx: u64,
	},
	/// A secret was requested for release out of order.
	OutOfOrder {
		/// The only commitment number which may be released next.
		expected: u64,
		/// The commitment number which was requested.
		requested: u64,
	},
}

impl fmt::Debug for RevocationLedgerError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match *self {
			RevocationLedgerError::RevocationMismatch { idx } => {
				write!(f, "Commitment secret for {} is inconsistent with previously provided secrets", idx)
			},
			RevocationLedgerError::OutOfOrder { expected, requested } => {
				write!(f, "Requested release of commitment secret {} but the next releasable is {}", requested, expected)
			},
		}
	}
}

impl fmt::Display for RevocationLedgerError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		fmt::Debug::fmt(self, f)
	}
}

// Various functions for key derivation and transaction creation for use within channels. Primarily
// used in Channel and the JusticeAssembler.

/// Build the commitment secret from the seed and the commitment number
pub fn build_commitment_secret(commitment_seed: &[u8; 32], idx: u64) -> [u8; 32] {
	let mut res: [u8; 32] = commitment_seed.clone();
	for i in 0..48 {
		let bitpos = 47 - i;
		if idx & (1 << bitpos) == (1 << bitpos) {
			res[bitpos / 8] ^= 1 << (bitpos & 7);
			res = Sha256::hash(&res).to_byte_array();
		}
	}
	res
}

/// Produces our per-commitment secrets from a single seed.
///
/// Secrets may be computed for any commitment number, but are only *released* (ie handed to our
/// counterparty as a revocation) in strictly descending commitment number order with no gaps,
/// which is the only order the counterparty's [`CounterpartyCommitmentSecrets`] can compact.
pub struct CommitmentSecretProducer {
	commitment_seed: [u8; 32],
	next_release: u64,
}

impl CommitmentSecretProducer {
	/// Creates a producer which has not yet released any secret.
	pub fn new(commitment_seed: [u8; 32]) -> Self {
		Self { commitment_seed, next_release: INITIAL_COMMITMENT_NUMBER }
	}

	/// The secret for the backwards-counting commitment number `idx`.
	pub fn at_index(&self, idx: u64) -> [u8; 32] {
		build_commitment_secret(&self.commitment_seed, idx)
	}

	/// The secret for the commitment at `height`, counting up from zero.
	pub fn at_height(&self, height: u64) -> [u8; 32] {
		self.at_index(INITIAL_COMMITMENT_NUMBER - height)
	}

	/// The per-commitment point for the backwards-counting commitment number `idx`.
	pub fn point_at_index<T: secp256k1::Signing>(
		&self, secp_ctx: &Secp256k1<T>, idx: u64,
	) -> Result<PublicKey, KeyDerivationError> {
		let secret_key = SecretKey::from_slice(&self.at_index(idx)).map_err(|_| KeyDerivationError::InvalidKey)?;
		Ok(PublicKey::from_secret_key(secp_ctx, &secret_key))
	}

	/// Releases the secret for `idx`, which must be the next in sequence.
	pub fn release(&mut self, idx: u64) -> Result<[u8; 32], RevocationLedgerError> {
		if idx != self.next_release {
			return Err(RevocationLedgerError::OutOfOrder { expected: self.next_release, requested: idx });
		}
		let secret = self.at_index(idx);
		self.next_release = self.next_release.saturating_sub(1);
		Ok(secret)
	}

	/// The next commitment number [`Self::release`] will accept.
	pub fn next_release_index(&self) -> u64 {
		self.next_release
	}
}

/// Implements the per-commitment secret storage scheme from
/// [BOLT 3](https://github.com/lightning/bolts/blob/dcbf8583976df087c79c3ce0b535311212e6812d/03-transactions.md#efficient-per-commitment-secret-storage).
///
/// Allows us to keep track of all of the revocation secrets of our counterparty in just 50*32 bytes
/// or so.
#[derive(Clone)]
pub struct CounterpartyCommitmentSecrets {
	old_secrets: [([u8; 32], u64); 49],
}

impl Eq for CounterpartyCommitmentSecrets {}
impl PartialEq for CounterpartyCommitmentSecrets {
	fn eq(&self, other: &Self) -> bool {
		self.old_secrets.iter().zip(other.old_secrets.iter())
			.all(|((secret, idx), (o_secret, o_idx))| secret == o_secret && idx == o_idx)
	}
}

impl CounterpartyCommitmentSecrets {
	/// Creates a new empty `CounterpartyCommitmentSecrets` structure.
	pub fn new() -> Self {
		Self { old_secrets: [([0; 32], 1 << 48); 49] }
	}

	#[inline]
	fn place_secret(idx: u64) -> u8 {
		for i in 0..48 {
			if idx & (1 << i) == (1 << i) {
				return i;
			}
		}
		48
	}

	/// Returns the minimum index of all stored secrets. Note that indexes start
	/// at 1 << 48 and get decremented by one for each new secret.
	pub fn get_min_seen_secret(&self) -> u64 {
		self.old_secrets.iter().map(|&(_, idx)| idx).min().unwrap_or(1 << 48)
	}

	#[inline]
	fn derive_secret(secret: [u8; 32], bits: u8, idx: u64) -> [u8; 32] {
		let mut res: [u8; 32] = secret;
		for i in 0..bits {
			let bitpos = bits - 1 - i;
			if idx & (1 << bitpos) == (1 << bitpos) {
				res[(bitpos / 8) as usize] ^= 1 << (bitpos & 7);
				res = Sha256::hash(&res).to_byte_array();
			}
		}
		res
	}

	/// Inserts the `secret` at `idx`. Returns `Ok(())` if the secret was generated in accordance
	/// with BOLT 3 and is consistent with previous secrets. Nothing is stored on error.
	pub fn provide_secret(&mut self, idx: u64, secret: [u8; 32]) -> Result<(), RevocationLedgerError> {
		let pos = Self::place_secret(idx);
		for i in 0..pos {
			let (old_secret, old_idx) = self.old_secrets[i as usize];
			if !fixed_time_eq(&Self::derive_secret(secret, pos, old_idx), &old_secret) {
				return Err(RevocationLedgerError::RevocationMismatch { idx });
			}
		}
		if self.get_min_seen_secret() <= idx {
			return Ok(());
		}
		self.old_secrets[pos as usize] = (secret, idx);
		Ok(())
	}

	/// Returns the secret at `idx`.
	/// Returns `None` if `idx` is < [`CounterpartyCommitmentSecrets::get_min_seen_secret`].
	pub fn get_secret(&self, idx: u64) -> Option<[u8; 32]> {
		for i in 0..self.old_secrets.len() {
			if (idx & (!((1 << i) - 1))) == self.old_secrets[i].1 {
				return Some(Self::derive_secret(self.old_secrets[i].0, i as u8, idx));
			}
		}
		debug_assert!(idx < self.get_min_seen_secret());
		None
	}
}

fn tweak_scalar(tweak: &[u8; 32]) -> Result<Scalar, KeyDerivationError> {
	if tweak == &[0; 32] {
		return Err(KeyDerivationError::InvalidTweak);
	}
	Scalar::from_be_bytes(*tweak).map_err(|_| KeyDerivationError::InvalidTweak)
}

fn per_commitment_tweak(per_commitment_point: &PublicKey, base_point: &PublicKey) -> [u8; 32] {
	let mut sha = Sha256::engine();
	sha.input(&per_commitment_point.serialize());
	sha.input(&base_point.serialize());
	Sha256::from_engine(sha).to_byte_array()
}

/// Adds `tweak` to a private key. A zero tweak is refused as it would make the derived key equal
/// to the base key.
pub fn tweak_private_key(base_secret: &SecretKey, tweak: &[u8; 32]) -> Result<SecretKey, KeyDerivationError> {
	base_secret.add_tweak(&tweak_scalar(tweak)?).map_err(|_| KeyDerivationError::InvalidKey)
}

/// Adds `tweak`·G to a public key, the public equivalent of [`tweak_private_key`].
pub fn tweak_public_key<T: secp256k1::Verification>(
	secp_ctx: &Secp256k1<T>, base_point: &PublicKey, tweak: &[u8; 32],
) -> Result<PublicKey, KeyDerivationError> {
	base_point.add_exp_tweak(secp_ctx, &tweak_scalar(tweak)?).map_err(|_| KeyDerivationError::InvalidKey)
}

/// Computes the single tweak `SHA256(per_commitment_point || base_point)` which derives a
/// per-commitment key from a base key.
pub fn derive_single_tweak(per_commitment_point: &PublicKey, base_point: &PublicKey) -> [u8; 32] {
	per_commitment_tweak(per_commitment_point, base_point)
}

/// Derives a per-commitment-transaction private key (eg an htlc key or delayed_payment key)
/// from the base secret and the per_commitment_point.
pub fn derive_private_key<T: secp256k1::Signing>(
	secp_ctx: &Secp256k1<T>, per_commitment_point: &PublicKey, base_secret: &SecretKey,
) -> Result<SecretKey, KeyDerivationError> {
	let base_point = PublicKey::from_secret_key(&secp_ctx, &base_secret);
	tweak_private_key(base_secret, &per_commitment_tweak(per_commitment_point, &base_point))
}

/// Derives a per-commitment-transaction public key (eg an htlc key or a delayed_payment key)
/// from the base point and the per_commitment_key. This is the public equivalent of
/// derive_private_key - using only public keys to derive a public key instead of private keys.
pub fn derive_public_key<T: secp256k1::Verification>(
	secp_ctx: &Secp256k1<T>, per_commitment_point: &PublicKey, base_point: &PublicKey,
) -> Result<PublicKey, KeyDerivationError> {
	tweak_public_key(secp_ctx, base_point, &per_commitment_tweak(per_commitment_point, base_point))
}

/// Derives a per-commitment-transaction revocation key from its constituent parts.
///
/// Only the cheating participant owns a valid witness to propagate a revoked
/// commitment transaction, thus per_commitment_secret always come from cheater
/// and revocation_base_secret always come from punisher, which is the broadcaster
/// of the transaction spending with this key knowledge.
pub fn derive_private_revocation_key<T: secp256k1::Signing>(
	secp_ctx: &Secp256k1<T>, per_commitment_secret: &SecretKey,
	countersignatory_revocation_base_secret: &SecretKey,
) -> Result<SecretKey, KeyDerivationError> {
	let countersignatory_revocation_base_point = PublicKey::from_secret_key(&secp_ctx, &countersignatory_revocation_base_secret);
	let per_commitment_point = PublicKey::from_secret_key(&secp_ctx, &per_commitment_secret);

	let rev_append_commit_hash_key = per_commitment_tweak(&countersignatory_revocation_base_point, &per_commitment_point);
	let commit_append_rev_hash_key = per_commitment_tweak(&per_commitment_point, &countersignatory_revocation_base_point);

	let countersignatory_contrib = countersignatory_revocation_base_secret
		.mul_tweak(&tweak_scalar(&rev_append_commit_hash_key)?)
		.map_err(|_| KeyDerivationError::InvalidKey)?;
	let broadcaster_contrib = per_commitment_secret
		.mul_tweak(&tweak_scalar(&commit_append_rev_hash_key)?)
		.map_err(|_| KeyDerivationError::InvalidKey)?;
	tweak_private_key(&countersignatory_contrib, &broadcaster_contrib.secret_bytes())
}

/// Derives a per-commitment-transaction revocation public key from its constituent parts. This is
/// the public equivalend of derive_private_revocation_key - using only public keys to derive a
/// public key instead of private keys.
///
/// Only the cheating participant owns a valid witness to propagate a revoked
/// commitment transaction, thus per_commitment_point always come from cheater
/// and revocation_base_point always come from punisher, which is the broadcaster
/// of the transaction spending with this key knowledge.
pub fn derive_public_revocation_key<T: secp256k1::Verification>(
	secp_ctx: &Secp256k1<T>, per_commitment_point: &PublicKey,
	countersignatory_revocation_base_point: &PublicKey,
) -> Result<PublicKey, KeyDerivationError> {
	let rev_append_commit_hash_key = per_commitment_tweak(countersignatory_revocation_base_point, per_commitment_point);
	let commit_append_rev_hash_key = per_commitment_tweak(per_commitment_point, countersignatory_revocation_base_point);

	let countersignatory_contrib = countersignatory_revocation_base_point
		.mul_tweak(&secp_ctx, &tweak_scalar(&rev_append_commit_hash_key)?)
		.map_err(|_| KeyDerivationError::InvalidKey)?;
	let broadcaster_contrib = per_commitment_point
		.mul_tweak(&secp_ctx, &tweak_scalar(&commit_append_rev_hash_key)?)
		.map_err(|_| KeyDerivationError::InvalidKey)?;
	countersignatory_contrib.combine(&broadcaster_contrib).map_err(|_| KeyDerivationError::InvalidKey)
}

/// The set of public keys which are used in the creation of one commitment transaction.
/// These are derived from the channel base keys and per-commitment data.
///
/// A broadcaster key is provided from potential broadcaster of the computed transaction.
/// A countersignatory key is coming from a protocol participant unable to broadcast the
/// transaction.
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct TxCreationKeys {
	/// The broadcaster's per-commitment public key which was used to derive the other keys.
	pub per_commitment_point: PublicKey,
	/// The revocation key which is used to allow the broadcaster of the commitment
	/// transaction to provide their counterparty the ability to punish them if they broadcast
	/// an old state.
	pub revocation_key: PublicKey,
	/// Broadcaster's HTLC Key
	pub broadcaster_htlc_key: PublicKey,
	/// Countersignatory's HTLC Key
	pub countersignatory_htlc_key: PublicKey,
	/// Broadcaster's Payment Key (which isn't allowed to be spent from for some delay)
	pub broadcaster_delayed_payment_key: PublicKey,
}

/// One counterparty's public keys which do not change over the life of a channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelPublicKeys {
	/// The public key which is used to sign all commitment transactions, as it appears in the
	/// on-chain channel lock-in 2-of-2 multisig output.
	pub funding_pubkey: PublicKey,
	/// The base point which is used (with derive_public_revocation_key) to derive per-commitment
	/// revocation keys. This is combined with the per-commitment-secret generated by the
	/// counterparty to create a secret which the counterparty can reveal to revoke previous
	/// states.
	pub revocation_basepoint: PublicKey,
	/// The public key on which the non-broadcaster (ie the countersignatory) receives an immediately
	/// spendable primary channel balance on the broadcaster's commitment transaction. This key is
	/// static across every commitment transaction.
	pub payment_point: PublicKey,
	/// The base point which is used (with derive_public_key) to derive a per-commitment payment
	/// public key which receives non-HTLC-encumbered funds which are only available for spending
	/// after some delay (or can be claimed via the revocation path).
	pub delayed_payment_basepoint: PublicKey,
	/// The base point which is used (with derive_public_key) to derive a per-commitment public key
	/// which is used to encumber HTLC-in-flight outputs.
	pub htlc_basepoint: PublicKey,
}

impl TxCreationKeys {
	/// Create per-state keys from channel base points and the per-commitment point.
	/// Key set is asymmetric and can't be used as part of counter-signatory set of transactions.
	pub fn derive_new<T: secp256k1::Verification>(
		secp_ctx: &Secp256k1<T>, per_commitment_point: &PublicKey,
		broadcaster_delayed_payment_base: &PublicKey, broadcaster_htlc_base: &PublicKey,
		countersignatory_revocation_base: &PublicKey, countersignatory_htlc_base: &PublicKey,
	) -> Result<TxCreationKeys, KeyDerivationError> {
		Ok(TxCreationKeys {
			per_commitment_point: per_commitment_point.clone(),
			revocation_key: derive_public_revocation_key(&secp_ctx, &per_commitment_point, &countersignatory_revocation_base)?,
			broadcaster_htlc_key: derive_public_key(&secp_ctx, &per_commitment_point, &broadcaster_htlc_base)?,
			countersignatory_htlc_key: derive_public_key(&secp_ctx, &per_commitment_point, &countersignatory_htlc_base)?,
			broadcaster_delayed_payment_key: derive_public_key(&secp_ctx, &per_commitment_point, &broadcaster_delayed_payment_base)?,
		})
	}

	/// Generate per-state keys from channel static keys.
	/// Key set is asymmetric and can't be used as part of counter-signatory set of transactions.
	pub fn from_channel_static_keys<T: secp256k1::Verification>(
		per_commitment_point: &PublicKey, broadcaster_keys: &ChannelPublicKeys,
		countersignatory_keys: &ChannelPublicKeys, secp_ctx: &Secp256k1<T>,
	) -> Result<TxCreationKeys, KeyDerivationError> {
		TxCreationKeys::derive_new(
			&secp_ctx,
			&per_commitment_point,
			&broadcaster_keys.delayed_payment_basepoint,
			&broadcaster_keys.htlc_basepoint,
			&countersignatory_keys.revocation_basepoint,
			&countersignatory_keys.htlc_basepoint,
		)
	}
}

/// The maximum length of a script returned by get_revokeable_redeemscript.
// Calculated as 6 bytes of opcodes, 1 byte push plus 2 bytes for contest_delay, and two public
// keys of 33 bytes (+ 1 push).
pub const REVOKEABLE_REDEEMSCRIPT_MAX_LENGTH: usize = 6 + 3 + 34 * 2;

/// A script either spendable by the revocation
/// key or the broadcaster_delayed_payment_key and satisfying the relative-locktime OP_CSV constrain.
/// Encumbering a `to_holder` output on a commitment transaction or 2nd-stage HTLC transactions.
pub fn get_revokeable_redeemscript(
	revocation_key: &PublicKey, contest_delay: u16, broadcaster_delayed_payment_key: &PublicKey,
) -> ScriptBuf {
	let res = Builder::new()
		.push_opcode(opcodes::all::OP_IF)
		.push_slice(revocation_key.serialize())
		.push_opcode(opcodes::all::OP_ELSE)
		.push_int(contest_delay as i64)
		.push_opcode(opcodes::all::OP_CSV)
		.push_opcode(opcodes::all::OP_DROP)
		.push_slice(broadcaster_delayed_payment_key.serialize())
		.push_opcode(opcodes::all::OP_ENDIF)
		.push_opcode(opcodes::all::OP_CHECKSIG)
		.into_script();
	debug_assert!(res.len() <= REVOKEABLE_REDEEMSCRIPT_MAX_LENGTH);
	res
}

/// Information about an HTLC as it appears in a commitment transaction
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HTLCOutputInCommitment {
	/// Whether the HTLC was "offered" (ie outbound in relation to this commitment transaction).
	/// Note that this is not the same as whether it is outbound *from us*. To determine that you
	/// need to compare this value to whether the commitment transaction in question is that of
	/// the counterparty or our own.
	pub offered: bool,
	/// The value, in msat, of the HTLC. The value as it appears in the commitment transaction is
	/// this divided by 1000.
	pub amount_msat: u64,
	/// The CLTV lock-time at which this HTLC expires.
	pub cltv_expiry: u32,
	/// The hash of the preimage which unlocks this HTLC.
	pub payment_hash: PaymentHash,
	/// The position within the commitment transactions' outputs. This may be None if the value is
	/// below the dust limit (in which case no output appears in the commitment transaction and the
	/// value is spent to additional transaction fees).
	pub transaction_output_index: Option<u32>,
}

impl HTLCOutputInCommitment {
	/// Whether the HTLC is trimmed from a commitment transaction with the given dust limit and
	/// feerate.
	pub fn is_dust(&self, broadcaster_dust_limit_sat: u64, feerate_per_kw: u32, anchors: bool) -> bool {
		let threshold_sat = broadcaster_dust_limit_sat + second_stage_tx_fee_sat(feerate_per_kw, self.offered, anchors);
		self.amount_msat / 1000 < threshold_sat
	}
}

#[inline]
pub(crate) fn get_htlc_redeemscript_with_explicit_keys(
	htlc: &HTLCOutputInCommitment, anchors: bool, broadcaster_htlc_key: &PublicKey,
	countersignatory_htlc_key: &PublicKey, revocation_key: &PublicKey,
) -> ScriptBuf {
	let payment_hash160 = Ripemd160::hash(&htlc.payment_hash.0[..]).to_byte_array();
	let revocation_key_hash = Hash160::hash(&revocation_key.serialize()).to_byte_array();
	let bldr = Builder::new()
		.push_opcode(opcodes::all::OP_DUP)
		.push_opcode(opcodes::all::OP_HASH160)
		.push_slice(revocation_key_hash)
		.push_opcode(opcodes::all::OP_EQUAL)
		.push_opcode(opcodes::all::OP_IF)
		.push_opcode(opcodes::all::OP_CHECKSIG)
		.push_opcode(opcodes::all::OP_ELSE)
		.push_slice(countersignatory_htlc_key.serialize())
		.push_opcode(opcodes::all::OP_SWAP)
		.push_opcode(opcodes::all::OP_SIZE)
		.push_int(32)
		.push_opcode(opcodes::all::OP_EQUAL);
	let mut bldr = if htlc.offered {
		bldr.push_opcode(opcodes::all::OP_NOTIF)
			.push_opcode(opcodes::all::OP_DROP)
			.push_int(2)
			.push_opcode(opcodes::all::OP_SWAP)
			.push_slice(broadcaster_htlc_key.serialize())
			.push_int(2)
			.push_opcode(opcodes::all::OP_CHECKMULTISIG)
			.push_opcode(opcodes::all::OP_ELSE)
			.push_opcode(opcodes::all::OP_HASH160)
			.push_slice(payment_hash160)
			.push_opcode(opcodes::all::OP_EQUALVERIFY)
			.push_opcode(opcodes::all::OP_CHECKSIG)
			.push_opcode(opcodes::all::OP_ENDIF)
	} else {
		bldr.push_opcode(opcodes::all::OP_IF)
			.push_opcode(opcodes::all::OP_HASH160)
			.push_slice(payment_hash160)
			.push_opcode(opcodes::all::OP_EQUALVERIFY)
			.push_int(2)
			.push_opcode(opcodes::all::OP_SWAP)
			.push_slice(broadcaster_htlc_key.serialize())
			.push_int(2)
			.push_opcode(opcodes::all::OP_CHECKMULTISIG)
			.push_opcode(opcodes::all::OP_ELSE)
			.push_opcode(opcodes::all::OP_DROP)
			.push_int(htlc.cltv_expiry as i64)
			.push_opcode(opcodes::all::OP_CLTV)
			.push_opcode(opcodes::all::OP_DROP)
			.push_opcode(opcodes::all::OP_CHECKSIG)
			.push_opcode(opcodes::all::OP_ENDIF)
	};
	if anchors {
		bldr = bldr
			.push_opcode(opcodes::all::OP_PUSHNUM_1)
			.push_opcode(opcodes::all::OP_CSV)
			.push_opcode(opcodes::all::OP_DROP);
	}
	bldr.push_opcode(opcodes::all::OP_ENDIF).into_script()
}

/// Gets the witness redeemscript for an HTLC output in a commitment transaction. Note that htlc
/// does not need to have its previous_output_index filled.
#[inline]
pub fn get_htlc_redeemscript(htlc: &HTLCOutputInCommitment, anchors: bool, keys: &TxCreationKeys) -> ScriptBuf {
	get_htlc_redeemscript_with_explicit_keys(
		htlc, anchors, &keys.broadcaster_htlc_key, &keys.countersignatory_htlc_key, &keys.revocation_key,
	)
}

/// Gets the redeemscript for a funding output from the two funding public keys.
/// Note that the order of funding public keys does not matter.
pub fn make_funding_redeemscript(broadcaster: &PublicKey, countersignatory: &PublicKey) -> ScriptBuf {
	let broadcaster_funding_key = broadcaster.serialize();
	let countersignatory_funding_key = countersignatory.serialize();

	let builder = Builder::new().push_opcode(opcodes::all::OP_PUSHNUM_2);
	if broadcaster_funding_key[..] < countersignatory_funding_key[..] {
		builder.push_slice(broadcaster_funding_key).push_slice(countersignatory_funding_key)
	} else {
		builder.push_slice(countersignatory_funding_key).push_slice(broadcaster_funding_key)
	}
	.push_opcode(opcodes::all::OP_PUSHNUM_2)
	.push_opcode(opcodes::all::OP_CHECKMULTISIG)
	.into_script()
}

/// The sighash type the countersignatory signs second-level HTLC transactions with. With anchors
/// the broadcaster may attach fee inputs and outputs, which the countersignatory's signature
/// must allow.
#[inline]
pub fn htlc_countersignatory_sighash_type(anchors: bool) -> EcdsaSighashType {
	if anchors { EcdsaSighashType::SinglePlusAnyoneCanPay } else { EcdsaSighashType::All }
}

/// Builds an unsigned HTLC-Success or HTLC-Timeout transaction from the given channel and HTLC
/// parameters. This is used to fetch the transaction which needs signing, and can be used to
/// construct an HTLC transaction which is broadcastable given a counterparty HTLC signature.
///
/// Returns `None` if htlc.transaction_output_index is `None` (as such HTLCs do not appear in the
/// commitment transaction).
pub fn build_htlc_transaction(
	commitment_txid: &Txid, feerate_per_kw: u32, contest_delay: u16, htlc: &HTLCOutputInCommitment,
	anchors: bool, broadcaster_delayed_payment_key: &PublicKey, revocation_key: &PublicKey,
) -> Option<Transaction> {
	let txins = vec![build_htlc_input(commitment_txid, htlc, anchors)?];
	let txouts = vec![build_htlc_output(
		feerate_per_kw, contest_delay, htlc, anchors, broadcaster_delayed_payment_key, revocation_key,
	)];

	Some(Transaction {
		version: Version::TWO,
		lock_time: LockTime::from_consensus(if htlc.offered { htlc.cltv_expiry } else { 0 }),
		input: txins,
		output: txouts,
	})
}

pub(crate) fn build_htlc_input(commitment_txid: &Txid, htlc: &HTLCOutputInCommitment, anchors: bool) -> Option<TxIn> {
	Some(TxIn {
		previous_output: OutPoint { txid: commitment_txid.clone(), vout: htlc.transaction_output_index? },
		script_sig: ScriptBuf::new(),
		sequence: Sequence(if anchors { 1 } else { 0 }),
		witness: Witness::new(),
	})
}

pub(crate) fn build_htlc_output(
	feerate_per_kw: u32, contest_delay: u16, htlc: &HTLCOutputInCommitment, anchors: bool,
	broadcaster_delayed_payment_key: &PublicKey, revocation_key: &PublicKey,
) -> TxOut {
	let total_fee = second_stage_tx_fee_sat(feerate_per_kw, htlc.offered, anchors);
	let output_value = (htlc.amount_msat / 1000).saturating_sub(total_fee);

	TxOut {
		script_pubkey: get_revokeable_redeemscript(revocation_key, contest_delay, broadcaster_delayed_payment_key).to_p2wsh(),
		value: Amount::from_sat(output_value),
	}
}

/// Returns the witness required to satisfy and spend a HTLC input.
pub fn build_htlc_input_witness(
	local_sig: &Signature, remote_sig: &Signature, preimage: &Option<PaymentPreimage>,
	redeem_script: &Script, anchors: bool,
) -> Witness {
	let mut witness = Witness::new();
	// First push the multisig dummy, note that due to BIP147 (NULLDUMMY) it must be a zero-length element.
	witness.push(vec![]);
	witness.push_ecdsa_signature(&bitcoin::ecdsa::Signature {
		signature: *remote_sig,
		sighash_type: htlc_countersignatory_sighash_type(anchors),
	});
	witness.push_ecdsa_signature(&bitcoin::ecdsa::Signature::sighash_all(*local_sig));
	if let Some(preimage) = preimage {
		witness.push(preimage.0.to_vec());
	} else {
		// Due to BIP146 (MINIMALIF) this must be a zero-length element to relay.
		witness.push(vec![]);
	}
	witness.push(redeem_script.to_bytes());
	witness
}

/// Returns the witness spending a counterparty's HTLC output directly from their commitment
/// transaction: the preimage path for HTLCs they offered, or the timeout path (`preimage` of
/// `None`) for HTLCs they received.
pub fn build_counterparty_htlc_witness(
	sig: &Signature, preimage: &Option<PaymentPreimage>, redeem_script: &Script,
) -> Witness {
	let mut witness = Witness::new();
	witness.push_ecdsa_signature(&bitcoin::ecdsa::Signature::sighash_all(*sig));
	match preimage {
		Some(preimage) => witness.push(preimage.0.to_vec()),
		None => witness.push(vec![]),
	}
	witness.push(redeem_script.to_bytes());
	witness
}

/// Returns the witness spending a revoked `to_local` (or second-level HTLC) output through the
/// revocation branch.
pub fn build_revoked_to_local_witness(sig: &Signature, redeem_script: &Script) -> Witness {
	let mut witness = Witness::new();
	witness.push_ecdsa_signature(&bitcoin::ecdsa::Signature::sighash_all(*sig));
	witness.push(vec![1]);
	witness.push(redeem_script.to_bytes());
	witness
}

/// Returns the witness spending a `to_local` output through the delayed branch, once the
/// contest delay has passed.
pub fn build_delayed_to_local_witness(sig: &Signature, redeem_script: &Script) -> Witness {
	let mut witness = Witness::new();
	witness.push_ecdsa_signature(&bitcoin::ecdsa::Signature::sighash_all(*sig));
	witness.push(vec![]);
	witness.push(redeem_script.to_bytes());
	witness
}

/// Returns the witness spending a revoked HTLC output on a commitment transaction through the
/// revocation branch.
pub fn build_revoked_htlc_witness(sig: &Signature, revocation_key: &PublicKey, redeem_script: &Script) -> Witness {
	let mut witness = Witness::new();
	witness.push_ecdsa_signature(&bitcoin::ecdsa::Signature::sighash_all(*sig));
	witness.push(revocation_key.serialize());
	witness.push(redeem_script.to_bytes());
	witness
}

/// Returns the witness spending the countersignatory's balance output.
pub fn build_to_countersignatory_witness(sig: &Signature, payment_point: &PublicKey, anchors: bool) -> Witness {
	let mut witness = Witness::new();
	witness.push_ecdsa_signature(&bitcoin::ecdsa::Signature::sighash_all(*sig));
	if anchors {
		witness.push(get_to_countersignatory_with_anchors_redeemscript(payment_point).as_bytes());
	} else {
		witness.push(payment_point.serialize());
	}
	witness
}

/// Gets the witnessScript for the to_remote output when anchors are enabled.
#[inline]
pub fn get_to_countersignatory_with_anchors_redeemscript(payment_point: &PublicKey) -> ScriptBuf {
	Builder::new()
		.push_slice(payment_point.serialize())
		.push_opcode(opcodes::all::OP_CHECKSIGVERIFY)
		.push_int(1)
		.push_opcode(opcodes::all::OP_CSV)
		.into_script()
}

/// Gets the scriptPubKey paying the countersignatory's balance on a commitment transaction.
pub fn get_counterparty_payment_script(payment_point: &PublicKey, anchors: bool) -> ScriptBuf {
	if anchors {
		get_to_countersignatory_with_anchors_redeemscript(payment_point).to_p2wsh()
	} else {
		ScriptBuf::new_p2wpkh(&WPubkeyHash::hash(&payment_point.serialize()))
	}
}

/// Gets the witnessScript for an anchor output from the funding public key.
/// The witness in the spending input must be:
/// <BIP 143 funding_signature>
/// After 16 blocks of confirmation, an alternative satisfying witness could be:
/// <>
/// (empty vector required to satisfy compliance with MINIMALIF-standard rule)
#[inline]
pub fn get_anchor_redeemscript(funding_pubkey: &PublicKey) -> ScriptBuf {
	Builder::new()
		.push_slice(funding_pubkey.serialize())
		.push_opcode(opcodes::all::OP_CHECKSIG)
		.push_opcode(opcodes::all::OP_IFDUP)
		.push_opcode(opcodes::all::OP_NOTIF)
		.push_int(16)
		.push_opcode(opcodes::all::OP_CSV)
		.push_opcode(opcodes::all::OP_ENDIF)
		.into_script()
}

/// Locates the output with an anchor script paying to `funding_pubkey` within `commitment_tx`.
pub fn get_anchor_output<'a>(commitment_tx: &'a Transaction, funding_pubkey: &PublicKey) -> Option<(u32, &'a TxOut)> {
	let anchor_script = get_anchor_redeemscript(funding_pubkey).to_p2wsh();
	commitment_tx.output.iter().enumerate()
		.find(|(_, txout)| txout.script_pubkey == anchor_script)
		.map(|(idx, txout)| (idx as u32, txout))
}

/// Per-channel data used to build transactions in conjunction with the per-commitment data
/// ([`CommitmentTransaction`]). The fields are organized by holder/counterparty and are only
/// complete once the funding outpoint is known.
///
/// Normally, this is converted to the broadcaster/countersignatory-organized
/// [`DirectedChannelTransactionParameters`] before use, via the as_holder_broadcastable and
/// as_counterparty_broadcastable functions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelTransactionParameters {
	/// Holder public keys
	pub holder_pubkeys: ChannelPublicKeys,
	/// The contest delay selected by the holder, which applies to counterparty-broadcast transactions
	pub holder_selected_contest_delay: u16,
	/// Whether the holder is the initiator of this channel.
	/// This is an input to the commitment number obscure factor computation.
	pub is_outbound_from_holder: bool,
	/// Counterparty public keys
	pub counterparty_pubkeys: ChannelPublicKeys,
	/// The contest delay selected by the counterparty, which applies to holder-broadcast transactions
	pub counterparty_selected_contest_delay: u16,
	/// The funding outpoint
	pub funding_outpoint: OutPoint,
	/// The value of the funding output.
	pub channel_value_satoshis: u64,
	/// Are anchors (zero fee HTLC transaction variant) used for this channel.
	pub anchors: bool,
}

impl ChannelTransactionParameters {
	/// Convert the holder/counterparty parameters to broadcaster/countersignatory-organized parameters,
	/// given that the holder is the broadcaster.
	pub fn as_holder_broadcastable(&self) -> DirectedChannelTransactionParameters {
		DirectedChannelTransactionParameters { inner: self, holder_is_broadcaster: true }
	}

	/// Convert the holder/counterparty parameters to broadcaster/countersignatory-organized parameters,
	/// given that the counterparty is the broadcaster.
	pub fn as_counterparty_broadcastable(&self) -> DirectedChannelTransactionParameters {
		DirectedChannelTransactionParameters { inner: self, holder_is_broadcaster: false }
	}

	/// The 2-of-2 script locking the funding output.
	pub fn funding_redeemscript(&self) -> ScriptBuf {
		make_funding_redeemscript(&self.holder_pubkeys.funding_pubkey, &self.counterparty_pubkeys.funding_pubkey)
	}
}

/// Static channel fields used to build transactions given per-commitment fields, organized by
/// broadcaster/countersignatory.
///
/// This is derived from the holder/counterparty-organized ChannelTransactionParameters via the
/// as_holder_broadcastable and as_counterparty_broadcastable functions.
pub struct DirectedChannelTransactionParameters<'a> {
	inner: &'a ChannelTransactionParameters,
	holder_is_broadcaster: bool,
}

impl<'a> DirectedChannelTransactionParameters<'a> {
	/// Get the channel pubkeys for the broadcaster
	pub fn broadcaster_pubkeys(&self) -> &'a ChannelPublicKeys {
		if self.holder_is_broadcaster { &self.inner.holder_pubkeys } else { &self.inner.counterparty_pubkeys }
	}

	/// Get the channel pubkeys for the countersignatory
	pub fn countersignatory_pubkeys(&self) -> &'a ChannelPublicKeys {
		if self.holder_is_broadcaster { &self.inner.counterparty_pubkeys } else { &self.inner.holder_pubkeys }
	}

	/// Get the contest delay applicable to the transactions.
	/// Note that the contest delay was selected by the countersignatory.
	pub fn contest_delay(&self) -> u16 {
		if self.holder_is_broadcaster {
			self.inner.counterparty_selected_contest_delay
		} else {
			self.inner.holder_selected_contest_delay
		}
	}

	/// Whether the channel is outbound from the broadcaster.
	///
	/// The boolean representing the side that initiated the channel is
	/// an input to the commitment number obscure factor computation.
	pub fn is_outbound(&self) -> bool {
		if self.holder_is_broadcaster { self.inner.is_outbound_from_holder } else { !self.inner.is_outbound_from_holder }
	}

	/// The funding outpoint
	pub fn funding_outpoint(&self) -> OutPoint {
		self.inner.funding_outpoint
	}

	/// Whether to use anchors for this channel
	pub fn anchors(&self) -> bool {
		self.inner.anchors
	}
}

/// Information needed to build and sign a holder's commitment transaction.
///
/// The transaction is only signed once we are ready to broadcast.
#[derive(Clone, Debug)]
pub struct HolderCommitmentTransaction {
	inner: CommitmentTransaction,
	/// Our counterparty's signature for the transaction
	pub counterparty_sig: Signature,
	/// All non-dust counterparty HTLC signatures, in the order they appear in the transaction
	pub counterparty_htlc_sigs: Vec<Signature>,
	// Which order the signatures should go in when constructing the final commitment tx witness.
	// The user should be able to reconstruct this themselves, so we don't bother to expose it.
	holder_sig_first: bool,
}

impl Deref for HolderCommitmentTransaction {
	type Target = CommitmentTransaction;

	fn deref(&self) -> &Self::Target {
		&self.inner
	}
}

impl Eq for HolderCommitmentTransaction {}
impl PartialEq for HolderCommitmentTransaction {
	// We dont care whether we are signed in equality comparison
	fn eq(&self, o: &Self) -> bool {
		self.inner == o.inner
	}
}

impl HolderCommitmentTransaction {
	/// Create a new holder transaction with the given counterparty signatures.
	/// The funding keys are used to figure out which signature should go first when building the transaction for broadcast.
	pub fn new(
		commitment_tx: CommitmentTransaction, counterparty_sig: Signature,
		counterparty_htlc_sigs: Vec<Signature>, holder_funding_key: &PublicKey,
		counterparty_funding_key: &PublicKey,
	) -> Self {
		Self {
			inner: commitment_tx,
			counterparty_sig,
			counterparty_htlc_sigs,
			holder_sig_first: holder_funding_key.serialize()[..] < counterparty_funding_key.serialize()[..],
		}
	}

	/// Completes the funding input witness with our own signature.
	pub fn add_holder_sig(&self, funding_redeemscript: &Script, holder_sig: Signature) -> Transaction {
		// First push the multisig dummy, note that due to BIP147 (NULLDUMMY) it must be a zero-length element.
		let mut tx = self.inner.built.transaction.clone();
		let witness = &mut tx.input[0].witness;
		witness.push(Vec::new());

		let holder_sig = bitcoin::ecdsa::Signature::sighash_all(holder_sig);
		let counterparty_sig = bitcoin::ecdsa::Signature::sighash_all(self.counterparty_sig);
		if self.holder_sig_first {
			witness.push_ecdsa_signature(&holder_sig);
			witness.push_ecdsa_signature(&counterparty_sig);
		} else {
			witness.push_ecdsa_signature(&counterparty_sig);
			witness.push_ecdsa_signature(&holder_sig);
		}

		witness.push(funding_redeemscript.as_bytes());
		tx
	}
}

/// A pre-built Bitcoin commitment transaction and its txid.
#[derive(Clone, Debug)]
pub struct BuiltCommitmentTransaction {
	/// The commitment transaction
	pub transaction: Transaction,
	/// The txid for the commitment transaction.
	///
	/// This is provided as a performance optimization, instead of calling transaction.compute_txid()
	/// multiple times.
	pub txid: Txid,
}

impl BuiltCommitmentTransaction {
	/// Get the SIGHASH_ALL sighash value of the transaction.
	///
	/// This can be used to verify a signature.
	pub fn get_sighash_all(&self, funding_redeemscript: &Script, channel_value_satoshis: u64) -> Option<Message> {
		p2wsh_sighash(&self.transaction, 0, funding_redeemscript, Amount::from_sat(channel_value_satoshis), EcdsaSighashType::All)
	}

	/// Sign a transaction, either because we are counter-signing the counterparty's transaction or
	/// because we are about to broadcast a holder transaction.
	pub fn sign<T: secp256k1::Signing>(
		&self, funding_key: &SecretKey, funding_redeemscript: &Script, channel_value_satoshis: u64,
		secp_ctx: &Secp256k1<T>,
	) -> Option<Signature> {
		let sighash = self.get_sighash_all(funding_redeemscript, channel_value_satoshis)?;
		Some(sign(secp_ctx, &sighash, funding_key))
	}
}

/// This class tracks the per-transaction information needed to build a commitment transaction and will
/// actually build it and sign.  It is used for holder transactions that we sign only when needed
/// and for transactions we sign for the counterparty.
///
/// This class can be used inside a signer implementation to generate a signature given the relevant
/// secret key.
#[derive(Clone, Debug)]
pub struct CommitmentTransaction {
	commitment_number: u64,
	to_broadcaster_value_sat: u64,
	to_countersignatory_value_sat: u64,
	feerate_per_kw: u32,
	htlcs: Vec<HTLCOutputInCommitment>,
	anchors: bool,
	// A cache of the parties' pubkeys required to construct the transaction, see doc for trust()
	keys: TxCreationKeys,
	// For access to the pre-built transaction, see doc for trust()
	built: BuiltCommitmentTransaction,
}

impl Eq for CommitmentTransaction {}
impl PartialEq for CommitmentTransaction {
	fn eq(&self, o: &Self) -> bool {
		let eq = self.commitment_number == o.commitment_number
			&& self.to_broadcaster_value_sat == o.to_broadcaster_value_sat
			&& self.to_countersignatory_value_sat == o.to_countersignatory_value_sat
			&& self.feerate_per_kw == o.feerate_per_kw
			&& self.htlcs == o.htlcs
			&& self.anchors == o.anchors
			&& self.keys == o.keys;
		if eq {
			debug_assert_eq!(self.built.transaction, o.built.transaction);
			debug_assert_eq!(self.built.txid, o.built.txid);
		}
		eq
	}
}

impl CommitmentTransaction {
	/// Construct an object of the class while assigning transaction output indices to HTLCs.
	///
	/// Populates HTLCOutputInCommitment.transaction_output_index in htlcs_with_aux.
	///
	/// The generic T allows the caller to match the HTLC output index with auxiliary data.
	/// This auxiliary data is not stored in this object.
	///
	/// Only include HTLCs that are above the dust limit for the channel.
	pub fn new_with_auxiliary_htlc_data<T>(
		commitment_number: u64, to_broadcaster_value_sat: u64, to_countersignatory_value_sat: u64,
		broadcaster_funding_key: PublicKey, countersignatory_funding_key: PublicKey,
		keys: TxCreationKeys, feerate_per_kw: u32,
		htlcs_with_aux: &mut Vec<(HTLCOutputInCommitment, T)>,
		channel_parameters: &DirectedChannelTransactionParameters,
	) -> CommitmentTransaction {
		let anchors = channel_parameters.anchors();
		// Sort outputs and populate output indices while keeping track of the auxiliary data
		let (outputs, htlcs) = Self::internal_build_outputs(
			&keys, to_broadcaster_value_sat, to_countersignatory_value_sat, htlcs_with_aux,
			channel_parameters, &broadcaster_funding_key, &countersignatory_funding_key,
		);

		let (obscured_commitment_transaction_number, txins) = Self::internal_build_inputs(commitment_number, channel_parameters);
		let transaction = Self::make_transaction(obscured_commitment_transaction_number, txins, outputs);
		let txid = transaction.compute_txid();
		CommitmentTransaction {
			commitment_number,
			to_broadcaster_value_sat,
			to_countersignatory_value_sat,
			feerate_per_kw,
			htlcs,
			anchors,
			keys,
			built: BuiltCommitmentTransaction { transaction, txid },
		}
	}

	fn internal_rebuild_transaction(
		&self, keys: &TxCreationKeys, channel_parameters: &DirectedChannelTransactionParameters,
		broadcaster_funding_key: &PublicKey, countersignatory_funding_key: &PublicKey,
	) -> BuiltCommitmentTransaction {
		let (obscured_commitment_transaction_number, txins) = Self::internal_build_inputs(self.commitment_number, channel_parameters);

		let mut htlcs_with_aux = self.htlcs.iter().map(|h| (h.clone(), ())).collect();
		let (outputs, _) = Self::internal_build_outputs(
			keys, self.to_broadcaster_value_sat, self.to_countersignatory_value_sat, &mut htlcs_with_aux,
			channel_parameters, broadcaster_funding_key, countersignatory_funding_key,
		);

		let transaction = Self::make_transaction(obscured_commitment_transaction_number, txins, outputs);
		let txid = transaction.compute_txid();
		BuiltCommitmentTransaction { transaction, txid }
	}

	fn make_transaction(obscured_commitment_transaction_number: u64, txins: Vec<TxIn>, outputs: Vec<TxOut>) -> Transaction {
		Transaction {
			version: Version::TWO,
			lock_time: LockTime::from_consensus(
				((0x20 as u32) << 8 * 3) | ((obscured_commitment_transaction_number & 0xffffffu64) as u32),
			),
			input: txins,
			output: outputs,
		}
	}

	// This is used in two cases:
	// - initial sorting of outputs / HTLCs in the constructor, in which case T is auxiliary data the
	//   caller needs to have sorted together with the HTLCs so it can keep track of the output index
	// - building of a bitcoin transaction during a verify() call, in which case T is just ()
	fn internal_build_outputs<T>(
		keys: &TxCreationKeys, to_broadcaster_value_sat: u64, to_countersignatory_value_sat: u64,
		htlcs_with_aux: &mut Vec<(HTLCOutputInCommitment, T)>,
		channel_parameters: &DirectedChannelTransactionParameters,
		broadcaster_funding_key: &PublicKey, countersignatory_funding_key: &PublicKey,
	) -> (Vec<TxOut>, Vec<HTLCOutputInCommitment>) {
		let countersignatory_pubkeys = channel_parameters.countersignatory_pubkeys();
		let contest_delay = channel_parameters.contest_delay();
		let anchors = channel_parameters.anchors();

		let mut txouts: Vec<(TxOut, Option<&mut HTLCOutputInCommitment>)> = Vec::new();

		if to_countersignatory_value_sat > 0 {
			txouts.push((
				TxOut {
					script_pubkey: get_counterparty_payment_script(&countersignatory_pubkeys.payment_point, anchors),
					value: Amount::from_sat(to_countersignatory_value_sat),
				},
				None,
			))
		}

		if to_broadcaster_value_sat > 0 {
			let redeem_script = get_revokeable_redeemscript(
				&keys.revocation_key,
				contest_delay,
				&keys.broadcaster_delayed_payment_key,
			);
			txouts.push((
				TxOut {
					script_pubkey: redeem_script.to_p2wsh(),
					value: Amount::from_sat(to_broadcaster_value_sat),
				},
				None,
			));
		}

		if anchors {
			if to_broadcaster_value_sat > 0 || !htlcs_with_aux.is_empty() {
				let anchor_script = get_anchor_redeemscript(broadcaster_funding_key);
				txouts.push((
					TxOut {
						script_pubkey: anchor_script.to_p2wsh(),
						value: Amount::from_sat(ANCHOR_OUTPUT_VALUE_SATOSHI),
					},
					None,
				));
			}

			if to_countersignatory_value_sat > 0 || !htlcs_with_aux.is_empty() {
				let anchor_script = get_anchor_redeemscript(countersignatory_funding_key);
				txouts.push((
					TxOut {
						script_pubkey: anchor_script.to_p2wsh(),
						value: Amount::from_sat(ANCHOR_OUTPUT_VALUE_SATOSHI),
					},
					None,
				));
			}
		}

		let mut htlcs = Vec::with_capacity(htlcs_with_aux.len());
		for (htlc, _) in htlcs_with_aux {
			let script = get_htlc_redeemscript(&htlc, anchors, &keys);
			let txout = TxOut {
				script_pubkey: script.to_p2wsh(),
				value: Amount::from_sat(htlc.amount_msat / 1000),
			};
			txouts.push((txout, Some(htlc)));
		}

		// Sort output in BIP-69 order (amount, scriptPubkey).  Tie-breaks based on HTLC
		// CLTV expiration height.
		sort_outputs(&mut txouts, |a, b| {
			if let &Some(ref a_htlcout) = a {
				if let &Some(ref b_htlcout) = b {
					a_htlcout.cltv_expiry.cmp(&b_htlcout.cltv_expiry)
						// Note that due to hash collisions, we have to have a fallback comparison
						// here!
						.then(a_htlcout.payment_hash.0.cmp(&b_htlcout.payment_hash.0))
				// For non-HTLC outputs, if they're copying our SPK we don't really care if we
				// close the channel due to mismatches - they're doing something dumb:
				} else { cmp::Ordering::Equal }
			} else { cmp::Ordering::Equal }
		});

		let mut outputs = Vec::with_capacity(txouts.len());
		for (idx, out) in txouts.drain(..).enumerate() {
			if let Some(htlc) = out.1 {
				htlc.transaction_output_index = Some(idx as u32);
				htlcs.push(htlc.clone());
			}
			outputs.push(out.0);
		}
		(outputs, htlcs)
	}

	fn internal_build_inputs(commitment_number: u64, channel_parameters: &DirectedChannelTransactionParameters) -> (u64, Vec<TxIn>) {
		let broadcaster_pubkeys = channel_parameters.broadcaster_pubkeys();
		let countersignatory_pubkeys = channel_parameters.countersignatory_pubkeys();
		let commitment_transaction_number_obscure_factor = get_commitment_transaction_number_obscure_factor(
			&broadcaster_pubkeys.payment_point,
			&countersignatory_pubkeys.payment_point,
			channel_parameters.is_outbound(),
		);

		let obscured_commitment_transaction_number =
			commitment_transaction_number_obscure_factor ^ (INITIAL_COMMITMENT_NUMBER - commitment_number);

		let txins = vec![TxIn {
			previous_output: channel_parameters.funding_outpoint(),
			script_sig: ScriptBuf::new(),
			sequence: Sequence(((0x80 as u32) << 8 * 3) | ((obscured_commitment_transaction_number >> 3 * 8) as u32)),
			witness: Witness::new(),
		}];
		(obscured_commitment_transaction_number, txins)
	}

	/// The backwards-counting commitment number
	pub fn commitment_number(&self) -> u64 {
		self.commitment_number
	}

	/// The value to be sent to the broadcaster
	pub fn to_broadcaster_value_sat(&self) -> u64 {
		self.to_broadcaster_value_sat
	}

	/// The value to be sent to the counterparty
	pub fn to_countersignatory_value_sat(&self) -> u64 {
		self.to_countersignatory_value_sat
	}

	/// The feerate paid per 1000-weight-unit in this commitment transaction.
	pub fn feerate_per_kw(&self) -> u32 {
		self.feerate_per_kw
	}

	/// The non-dust HTLCs (direction, amt, height expiration, hash, transaction output index)
	/// which were included in this commitment transaction in output order.
	/// The transaction index is always populated.
	pub fn htlcs(&self) -> &Vec<HTLCOutputInCommitment> {
		&self.htlcs
	}

	/// Trust our pre-built transaction and derived transaction creation public keys.
	///
	/// Applies a wrapper which allows access to these fields.
	///
	/// This should only be used if you fully trust the builder of this object.  It should not
	/// be used by an external signer - instead use the verify function.
	pub fn trust(&self) -> TrustedCommitmentTransaction {
		TrustedCommitmentTransaction { inner: self }
	}

	/// Verify our pre-built transaction and derived transaction creation public keys.
	///
	/// Applies a wrapper which allows access to these fields.
	///
	/// An external validating signer must call this method before signing
	/// or using the built transaction.
	pub fn verify<T: secp256k1::Verification>(
		&self, channel_parameters: &DirectedChannelTransactionParameters,
		broadcaster_keys: &ChannelPublicKeys, countersignatory_keys: &ChannelPublicKeys,
		secp_ctx: &Secp256k1<T>,
	) -> Result<TrustedCommitmentTransaction, ()> {
		// This is the only field of the key cache that we trust
		let per_commitment_point = self.keys.per_commitment_point;
		let keys = TxCreationKeys::from_channel_static_keys(&per_commitment_point, broadcaster_keys, countersignatory_keys, secp_ctx)
			.map_err(|_| ())?;
		if keys != self.keys {
			return Err(());
		}
		let tx = self.internal_rebuild_transaction(
			&keys, channel_parameters, &broadcaster_keys.funding_pubkey, &countersignatory_keys.funding_pubkey,
		);
		if self.built.transaction != tx.transaction || self.built.txid != tx.txid {
			return Err(());
		}
		Ok(TrustedCommitmentTransaction { inner: self })
	}
}

/// A wrapper on CommitmentTransaction indicating that the derived fields (the built bitcoin
/// transaction and the transaction creation keys) are trusted.
///
/// See trust() and verify() functions on CommitmentTransaction.
///
/// This structure implements Deref.
pub struct TrustedCommitmentTransaction<'a> {
	inner: &'a CommitmentTransaction,
}

impl<'a> Deref for TrustedCommitmentTransaction<'a> {
	type Target = CommitmentTransaction;

	fn deref(&self) -> &Self::Target {
		self.inner
	}
}

impl<'a> TrustedCommitmentTransaction<'a> {
	/// The transaction ID of the built Bitcoin transaction
	pub fn txid(&self) -> Txid {
		self.inner.built.txid
	}

	/// The pre-built Bitcoin commitment transaction
	pub fn built_transaction(&self) -> &'a BuiltCommitmentTransaction {
		&self.inner.built
	}

	/// The pre-calculated transaction creation public keys.
	pub fn keys(&self) -> &'a TxCreationKeys {
		&self.inner.keys
	}

	/// Should anchors be used.
	pub fn anchors(&self) -> bool {
		self.inner.anchors
	}

	/// Builds the unsigned second-level transaction for one of our HTLCs along with the witness
	/// script of the output it spends.
	pub fn htlc_transaction(
		&self, channel_parameters: &DirectedChannelTransactionParameters, htlc: &HTLCOutputInCommitment,
	) -> Option<(Transaction, ScriptBuf)> {
		let keys = &self.inner.keys;
		let htlc_tx = build_htlc_transaction(
			&self.inner.built.txid, self.inner.feerate_per_kw, channel_parameters.contest_delay(), htlc,
			self.anchors(), &keys.broadcaster_delayed_payment_key, &keys.revocation_key,
		)?;
		let htlc_redeemscript = get_htlc_redeemscript(htlc, self.anchors(), keys);
		Some((htlc_tx, htlc_redeemscript))
	}
}

/// Commitment transaction numbers which appear in the transactions themselves are XOR'd with a
/// shared secret first. This prevents on-chain observers from discovering how many commitment
/// transactions occurred in a channel before it was closed.
///
/// This function gets the shared secret from relevant channel public keys and can be used to
/// "decrypt" the commitment transaction number given a commitment transaction on-chain.
pub fn get_commitment_transaction_number_obscure_factor(
	broadcaster_payment_basepoint: &PublicKey, countersignatory_payment_basepoint: &PublicKey,
	outbound_from_broadcaster: bool,
) -> u64 {
	let mut sha = Sha256::engine();

	if outbound_from_broadcaster {
		sha.input(&broadcaster_payment_basepoint.serialize());
		sha.input(&countersignatory_payment_basepoint.serialize());
	} else {
		sha.input(&countersignatory_payment_basepoint.serialize());
		sha.input(&broadcaster_payment_basepoint.serialize());
	}
	let res = Sha256::from_engine(sha).to_byte_array();

	((res[26] as u64) << 5 * 8)
		| ((res[27] as u64) << 4 * 8)
		| ((res[28] as u64) << 3 * 8)
		| ((res[29] as u64) << 2 * 8)
		| ((res[30] as u64) << 1 * 8)
		| ((res[31] as u64) << 0 * 8)
}

/// Recovers the backwards-counting commitment number from a confirmed commitment transaction.
/// Returns `None` if the transaction doesn't carry the commitment number encoding.
pub fn commitment_number_from_tx(tx: &Transaction, obscure_factor: u64) -> Option<u64> {
	if tx.input.len() != 1 {
		return None;
	}
	let sequence = tx.input[0].sequence.0;
	let lock_time = tx.lock_time.to_consensus_u32();
	if sequence >> 8 * 3 != 0x80 || lock_time >> 8 * 3 != 0x20 {
		return None;
	}
	let obscured = (((sequence & 0xffffff) as u64) << 3 * 8) | ((lock_time & 0xffffff) as u64);
	INITIAL_COMMITMENT_NUMBER.checked_sub(obscured ^ obscure_factor)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::ln::channel::INITIAL_COMMITMENT_NUMBER;
	use bitcoin::hex::FromHex;
	use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};

	fn secret_from_hex(hex: &str) -> [u8; 32] {
		<[u8; 32]>::from_hex(hex).unwrap()
	}

	fn dummy_pubkeys(secp_ctx: &Secp256k1<secp256k1::All>, seed: u8) -> ChannelPublicKeys {
		let key = |i: u8| PublicKey::from_secret_key(secp_ctx, &SecretKey::from_slice(&[seed.wrapping_add(i); 32]).unwrap());
		ChannelPublicKeys {
			funding_pubkey: key(0),
			revocation_basepoint: key(1),
			payment_point: key(2),
			delayed_payment_basepoint: key(3),
			htlc_basepoint: key(4),
		}
	}

	fn dummy_parameters(secp_ctx: &Secp256k1<secp256k1::All>, anchors: bool) -> ChannelTransactionParameters {
		ChannelTransactionParameters {
			holder_pubkeys: dummy_pubkeys(secp_ctx, 10),
			holder_selected_contest_delay: 144,
			is_outbound_from_holder: false,
			counterparty_pubkeys: dummy_pubkeys(secp_ctx, 20),
			counterparty_selected_contest_delay: 144,
			funding_outpoint: OutPoint { txid: Txid::all_zeros(), vout: 0 },
			channel_value_satoshis: 10_000_000,
			anchors,
		}
	}

	#[test]
	fn test_key_derivation() {
		// Test vectors from BOLT 3 Appendix E:
		let secp_ctx = Secp256k1::new();

		let base_secret = SecretKey::from_slice(&secret_from_hex("000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f")).unwrap();
		let per_commitment_secret = SecretKey::from_slice(&secret_from_hex("1f1e1d1c1b1a191817161514131211100f0e0d0c0b0a09080706050403020100")).unwrap();

		let base_point = PublicKey::from_secret_key(&secp_ctx, &base_secret);
		assert_eq!(base_point.serialize()[..], Vec::<u8>::from_hex("036d6caac248af96f6afa7f904f550253a0f3ef3f5aa2fe6838a95b216691468e2").unwrap()[..]);

		let per_commitment_point = PublicKey::from_secret_key(&secp_ctx, &per_commitment_secret);
		assert_eq!(per_commitment_point.serialize()[..], Vec::<u8>::from_hex("025f7117a78150fe2ef97db7cfc83bd57b2e2c0d0dd25eaf467a4a1c2a45ce1486").unwrap()[..]);

		assert_eq!(derive_public_key(&secp_ctx, &per_commitment_point, &base_point).unwrap().serialize()[..],
				Vec::<u8>::from_hex("0235f2dbfaa89b57ec7b055afe29849ef7ddfeb1cefdb9ebdc43f5494984db29e5").unwrap()[..]);

		assert_eq!(derive_private_key(&secp_ctx, &per_commitment_point, &base_secret).unwrap(),
				SecretKey::from_slice(&secret_from_hex("cbced912d3b21bf196a766651e436aff192362621ce317704ea2f75d87e7be0f")).unwrap());

		assert_eq!(derive_public_revocation_key(&secp_ctx, &per_commitment_point, &base_point).unwrap().serialize()[..],
				Vec::<u8>::from_hex("02916e326636d19c33f13e8c0c3a03dd157f332f3e99c317c141dd865eb01f8ff0").unwrap()[..]);

		assert_eq!(derive_private_revocation_key(&secp_ctx, &per_commitment_secret, &base_secret).unwrap(),
				SecretKey::from_slice(&secret_from_hex("d09ffff62ddb2297ab000cc85bcb4283fdeb6aa052affbc9dddcf33b61078110")).unwrap());
	}

	#[test]
	fn test_revocation_keys_agree() {
		let secp_ctx = Secp256k1::new();
		for i in 1..8u8 {
			let rev_base_secret = SecretKey::from_slice(&[i; 32]).unwrap();
			let per_commitment_secret = SecretKey::from_slice(&[0x40 + i; 32]).unwrap();
			let rev_base_point = PublicKey::from_secret_key(&secp_ctx, &rev_base_secret);
			let per_commitment_point = PublicKey::from_secret_key(&secp_ctx, &per_commitment_secret);

			let revocation_secret = derive_private_revocation_key(&secp_ctx, &per_commitment_secret, &rev_base_secret).unwrap();
			let revocation_point = derive_public_revocation_key(&secp_ctx, &per_commitment_point, &rev_base_point).unwrap();
			assert_eq!(PublicKey::from_secret_key(&secp_ctx, &revocation_secret), revocation_point);

			let htlc_secret = derive_private_key(&secp_ctx, &per_commitment_point, &rev_base_secret).unwrap();
			let htlc_point = derive_public_key(&secp_ctx, &per_commitment_point, &rev_base_point).unwrap();
			assert_eq!(PublicKey::from_secret_key(&secp_ctx, &htlc_secret), htlc_point);
		}
	}

	#[test]
	fn test_zero_tweak_is_rejected() {
		let secp_ctx = Secp256k1::new();
		let base_secret = SecretKey::from_slice(&[3; 32]).unwrap();
		let base_point = PublicKey::from_secret_key(&secp_ctx, &base_secret);
		assert_eq!(tweak_private_key(&base_secret, &[0; 32]), Err(KeyDerivationError::InvalidTweak));
		assert_eq!(tweak_public_key(&secp_ctx, &base_point, &[0; 32]), Err(KeyDerivationError::InvalidTweak));
		// A tweak at or above the curve order isn't a scalar either.
		assert_eq!(tweak_private_key(&base_secret, &[0xff; 32]), Err(KeyDerivationError::InvalidTweak));

		let mut tweak = [0; 32];
		tweak[31] = 1;
		let tweaked = tweak_private_key(&base_secret, &tweak).unwrap();
		assert_eq!(PublicKey::from_secret_key(&secp_ctx, &tweaked), tweak_public_key(&secp_ctx, &base_point, &tweak).unwrap());
	}

	#[test]
	fn test_commitment_secret_generation() {
		// Test vectors from BOLT 3 Appendix D:
		let vectors = [
			([0u8; 32], 281474976710655, "02a40c85b6f28da08dfdbe0926c53fab2de6d28c10301f8f7c4073d5e42e3148"),
			([0xffu8; 32], 281474976710655, "7cc854b54e3e0dcdb010d7a3fee464a9687be6e8db3be6854c475621e007a5dc"),
			([0xffu8; 32], 0xaaaaaaaaaaa, "56f4008fb007ca9acf0e15b054d5c9fd12ee06cea347914ddbaed70d1c13a528"),
			([0xffu8; 32], 0x555555555555, "9015daaeb06dba4ccc05b91b2f73bd54405f2be9f217fbacd3c5ac2e62327d31"),
			([0x01u8; 32], 1, "915c75942a26bb3a433a8ce2cb0427c29ec6c1775cfc78328b57f6ba7bfeaa9c"),
		];
		for (seed, idx, expected) in vectors.iter() {
			assert_eq!(build_commitment_secret(seed, *idx), secret_from_hex(expected));
		}
	}

	// Feeds `secrets` (starting at the first commitment number) into a fresh store, checking every
	// stored secret stays retrievable. If `fails_at` is set, that insertion must be rejected and
	// leave the store untouched.
	fn check_secret_sequence(secrets: &[&str], fails_at: Option<usize>) {
		let mut store = CounterpartyCommitmentSecrets::new();
		let mut idx = INITIAL_COMMITMENT_NUMBER;
		for (i, hex) in secrets.iter().enumerate() {
			let secret = secret_from_hex(hex);
			if fails_at == Some(i) {
				let before = store.clone();
				assert_eq!(store.provide_secret(idx, secret), Err(RevocationLedgerError::RevocationMismatch { idx }));
				assert!(store == before);
				return;
			}
			store.provide_secret(idx, secret).unwrap();
			let mut check_idx = INITIAL_COMMITMENT_NUMBER;
			for expected in secrets[..=i].iter() {
				assert_eq!(store.get_secret(check_idx).unwrap(), secret_from_hex(expected));
				check_idx -= 1;
			}
			assert_eq!(store.get_min_seen_secret(), check_idx + 1);
			assert!(store.get_secret(check_idx).is_none());
			idx -= 1;
		}
		assert!(fails_at.is_none());
	}

	const CORRECT_SECRETS: [&str; 8] = [
		"7cc854b54e3e0dcdb010d7a3fee464a9687be6e8db3be6854c475621e007a5dc",
		"c7518c8ae4660ed02894df8976fa1a3659c1a8b4b5bec0c4b872abeba4cb8964",
		"2273e227a5b7449b6e70f1fb4652864038b1cbf9cd7c043a7d6456b7fc275ad8",
		"27cddaa5624534cb6cb9d7da077cf2b22ab21e9b506fd4998a51d54502e99116",
		"c65716add7aa98ba7acb236352d665cab17345fe45b55fb879ff80e6bd0c41dd",
		"969660042a28f32d9be17344e09374b379962d03db1574df5a8a5a47e19ce3f2",
		"a5a64476122ca0925fb344bdc1854c1c0a59fc614298e50a33e331980a220f32",
		"05cde6323d949933f7f7b78776bcc1ea6d9b31447732e3802e1f7ac44b650e17",
	];

	#[test]
	fn test_per_commitment_storage() {
		// Test vectors from BOLT 3 Appendix D:
		check_secret_sequence(&CORRECT_SECRETS, None);

		// insert_secret #1 incorrect
		let mut secrets = CORRECT_SECRETS;
		secrets[0] = "02a40c85b6f28da08dfdbe0926c53fab2de6d28c10301f8f7c4073d5e42e3148";
		check_secret_sequence(&secrets, Some(1));

		// insert_secret #2 incorrect (#1 derived from incorrect)
		let mut secrets = CORRECT_SECRETS;
		secrets[0] = "02a40c85b6f28da08dfdbe0926c53fab2de6d28c10301f8f7c4073d5e42e3148";
		secrets[1] = "dddc3a8d14fddf2b68fa8c7fbad2748274937479dd0f8930d5ebb4ab6bd866a3";
		check_secret_sequence(&secrets, Some(3));

		// insert_secret #3 incorrect
		let mut secrets = CORRECT_SECRETS;
		secrets[2] = "c51a18b13e8527e579ec56365482c62f180b7d5760b46e9477dae59e87ed423a";
		check_secret_sequence(&secrets, Some(3));

		// insert_secret #4 incorrect (1,2,3 derived from incorrect)
		let mut secrets = CORRECT_SECRETS;
		secrets[0] = "02a40c85b6f28da08dfdbe0926c53fab2de6d28c10301f8f7c4073d5e42e3148";
		secrets[1] = "dddc3a8d14fddf2b68fa8c7fbad2748274937479dd0f8930d5ebb4ab6bd866a3";
		secrets[2] = "c51a18b13e8527e579ec56365482c62f180b7d5760b46e9477dae59e87ed423a";
		secrets[3] = "ba65d7b0ef55a3ba300d4e87af29868f394f8f138d78a7011669c79b37b936f4";
		check_secret_sequence(&secrets, Some(7));

		// insert_secret #5 incorrect
		let mut secrets = CORRECT_SECRETS;
		secrets[4] = "631373ad5f9ef654bb3dade742d09504c567edd24320d2fcd68e3cc47e2ff6a6";
		check_secret_sequence(&secrets, Some(5));

		// insert_secret #6 incorrect (5 derived from incorrect)
		let mut secrets = CORRECT_SECRETS;
		secrets[4] = "631373ad5f9ef654bb3dade742d09504c567edd24320d2fcd68e3cc47e2ff6a6";
		secrets[5] = "b7e76a83668bde38b373970155c868a653304308f9896692f904a23731224bb1";
		check_secret_sequence(&secrets, Some(7));

		// insert_secret #7 incorrect
		let mut secrets = CORRECT_SECRETS;
		secrets[6] = "e7971de736e01da8ed58b94c2fc216cb1dca9e326f3a96e7194fe8ea8af6c0a3";
		check_secret_sequence(&secrets, Some(7));

		// insert_secret #8 incorrect
		let mut secrets = CORRECT_SECRETS;
		secrets[7] = "a7efbc61aac46d34f77778bac22c8a20c6a46ca460addc49009bda875ec88fa4";
		check_secret_sequence(&secrets, Some(7));
	}

	#[test]
	fn test_producer_feeds_independent_store() {
		let mut producer = CommitmentSecretProducer::new([0x42; 32]);
		let mut store = CounterpartyCommitmentSecrets::new();
		for height in 0..1000u64 {
			let idx = INITIAL_COMMITMENT_NUMBER - height;
			let secret = producer.release(idx).unwrap();
			assert_eq!(secret, producer.at_height(height));
			store.provide_secret(idx, secret).unwrap();
		}
		for height in 0..1000u64 {
			assert_eq!(store.get_secret(INITIAL_COMMITMENT_NUMBER - height), Some(producer.at_height(height)));
		}
		assert!(store.get_secret(INITIAL_COMMITMENT_NUMBER - 1000).is_none());
	}

	#[test]
	fn test_producer_refuses_gaps() {
		let mut producer = CommitmentSecretProducer::new([7; 32]);
		assert_eq!(
			producer.release(INITIAL_COMMITMENT_NUMBER - 1),
			Err(RevocationLedgerError::OutOfOrder { expected: INITIAL_COMMITMENT_NUMBER, requested: INITIAL_COMMITMENT_NUMBER - 1 })
		);
		producer.release(INITIAL_COMMITMENT_NUMBER).unwrap();
		// Re-releasing is refused as well.
		assert!(producer.release(INITIAL_COMMITMENT_NUMBER).is_err());
		assert_eq!(producer.next_release_index(), INITIAL_COMMITMENT_NUMBER - 1);
	}

	#[test]
	fn test_store_rejects_foreign_secret() {
		let producer = CommitmentSecretProducer::new([1; 32]);
		let other = CommitmentSecretProducer::new([2; 32]);
		let mut store = CounterpartyCommitmentSecrets::new();
		store.provide_secret(INITIAL_COMMITMENT_NUMBER, producer.at_index(INITIAL_COMMITMENT_NUMBER)).unwrap();
		// Index ...654 is placed at position 1 and must derive the secret at ...655.
		let idx = INITIAL_COMMITMENT_NUMBER - 1;
		assert_eq!(store.provide_secret(idx, other.at_index(idx)), Err(RevocationLedgerError::RevocationMismatch { idx }));
		store.provide_secret(idx, producer.at_index(idx)).unwrap();
	}

	#[test]
	fn test_scripts_are_deterministic() {
		let secp_ctx = Secp256k1::new();
		let keys = dummy_pubkeys(&secp_ctx, 1);
		let a = get_revokeable_redeemscript(&keys.revocation_basepoint, 144, &keys.delayed_payment_basepoint);
		let b = get_revokeable_redeemscript(&keys.revocation_basepoint, 144, &keys.delayed_payment_basepoint);
		assert_eq!(a, b);
		assert!(a.len() <= REVOKEABLE_REDEEMSCRIPT_MAX_LENGTH);

		let htlc = HTLCOutputInCommitment {
			offered: true, amount_msat: 1_000_000, cltv_expiry: 500_000,
			payment_hash: PaymentHash([9; 32]), transaction_output_index: None,
		};
		let offered = get_htlc_redeemscript_with_explicit_keys(&htlc, false, &keys.htlc_basepoint, &keys.payment_point, &keys.revocation_basepoint);
		assert_eq!(offered.len(), OFFERED_HTLC_SCRIPT_WEIGHT);
		let offered_anchors = get_htlc_redeemscript_with_explicit_keys(&htlc, true, &keys.htlc_basepoint, &keys.payment_point, &keys.revocation_basepoint);
		assert_eq!(offered_anchors.len(), OFFERED_HTLC_SCRIPT_WEIGHT_ANCHORS);

		let received = HTLCOutputInCommitment { offered: false, ..htlc };
		let received_script = get_htlc_redeemscript_with_explicit_keys(&received, false, &keys.htlc_basepoint, &keys.payment_point, &keys.revocation_basepoint);
		assert!(received_script.len() >= MIN_ACCEPTED_HTLC_SCRIPT_WEIGHT && received_script.len() <= MAX_ACCEPTED_HTLC_SCRIPT_WEIGHT);
		assert_ne!(received_script, offered);

		// Funding scripts don't depend on which side asks.
		assert_eq!(make_funding_redeemscript(&keys.funding_pubkey, &keys.htlc_basepoint),
			make_funding_redeemscript(&keys.htlc_basepoint, &keys.funding_pubkey));
	}

	#[test]
	fn test_anchors() {
		let secp_ctx = Secp256k1::new();
		let mut channel_parameters = dummy_parameters(&secp_ctx, false);
		let holder_pubkeys = channel_parameters.holder_pubkeys.clone();
		let counterparty_pubkeys = channel_parameters.counterparty_pubkeys.clone();
		let per_commitment_secret = SecretKey::from_slice(&secret_from_hex("1f1e1d1c1b1a191817161514131211100f0e0d0c0b0a09080706050403020100")).unwrap();
		let per_commitment_point = PublicKey::from_secret_key(&secp_ctx, &per_commitment_secret);
		let keys = TxCreationKeys::from_channel_static_keys(&per_commitment_point, &holder_pubkeys, &counterparty_pubkeys, &secp_ctx).unwrap();

		let mut htlcs_with_aux: Vec<(_, ())> = Vec::new();

		// Generate broadcaster and counterparty outputs
		let tx = CommitmentTransaction::new_with_auxiliary_htlc_data(
			0, 1000, 2000, holder_pubkeys.funding_pubkey, counterparty_pubkeys.funding_pubkey,
			keys.clone(), 1, &mut htlcs_with_aux, &channel_parameters.as_holder_broadcastable(),
		);
		assert_eq!(tx.built.transaction.output.len(), 2);
		assert_eq!(tx.built.transaction.output[1].script_pubkey, get_counterparty_payment_script(&counterparty_pubkeys.payment_point, false));

		// Generate broadcaster and counterparty outputs as well as two anchors
		channel_parameters.anchors = true;
		let tx = CommitmentTransaction::new_with_auxiliary_htlc_data(
			0, 1000, 2000, holder_pubkeys.funding_pubkey, counterparty_pubkeys.funding_pubkey,
			keys.clone(), 1, &mut htlcs_with_aux, &channel_parameters.as_holder_broadcastable(),
		);
		assert_eq!(tx.built.transaction.output.len(), 4);
		assert_eq!(tx.built.transaction.output[3].script_pubkey, get_to_countersignatory_with_anchors_redeemscript(&counterparty_pubkeys.payment_point).to_p2wsh());
		assert!(get_anchor_output(&tx.built.transaction, &holder_pubkeys.funding_pubkey).is_some());
		assert!(get_anchor_output(&tx.built.transaction, &counterparty_pubkeys.funding_pubkey).is_some());

		// Generate broadcaster output and anchor
		let tx = CommitmentTransaction::new_with_auxiliary_htlc_data(
			0, 3000, 0, holder_pubkeys.funding_pubkey, counterparty_pubkeys.funding_pubkey,
			keys.clone(), 1, &mut htlcs_with_aux, &channel_parameters.as_holder_broadcastable(),
		);
		assert_eq!(tx.built.transaction.output.len(), 2);
		assert!(get_anchor_output(&tx.built.transaction, &counterparty_pubkeys.funding_pubkey).is_none());

		let received_htlc = HTLCOutputInCommitment {
			offered: false,
			amount_msat: 400000,
			cltv_expiry: 100,
			payment_hash: PaymentHash([42; 32]),
			transaction_output_index: None,
		};

		let offered_htlc = HTLCOutputInCommitment {
			offered: true,
			amount_msat: 600000,
			cltv_expiry: 100,
			payment_hash: PaymentHash([43; 32]),
			transaction_output_index: None,
		};

		// Generate broadcaster output and received and offered HTLC outputs, w/o anchors
		channel_parameters.anchors = false;
		let tx = CommitmentTransaction::new_with_auxiliary_htlc_data(
			0, 3000, 0, holder_pubkeys.funding_pubkey, counterparty_pubkeys.funding_pubkey,
			keys.clone(), 1, &mut vec![(received_htlc.clone(), ()), (offered_htlc.clone(), ())],
			&channel_parameters.as_holder_broadcastable(),
		);
		assert_eq!(tx.built.transaction.output.len(), 3);
		assert_eq!(tx.built.transaction.output[0].script_pubkey, get_htlc_redeemscript(&received_htlc, false, &keys).to_p2wsh());
		assert_eq!(tx.built.transaction.output[1].script_pubkey, get_htlc_redeemscript(&offered_htlc, false, &keys).to_p2wsh());
		assert_eq!(tx.htlcs()[0].transaction_output_index, Some(0));
		assert_eq!(tx.htlcs()[1].transaction_output_index, Some(1));

		// Generate broadcaster output and received and offered HTLC outputs, with anchors
		channel_parameters.anchors = true;
		let tx = CommitmentTransaction::new_with_auxiliary_htlc_data(
			0, 3000, 0, holder_pubkeys.funding_pubkey, counterparty_pubkeys.funding_pubkey,
			keys.clone(), 1, &mut vec![(received_htlc.clone(), ()), (offered_htlc.clone(), ())],
			&channel_parameters.as_holder_broadcastable(),
		);
		assert_eq!(tx.built.transaction.output.len(), 5);
		assert_eq!(tx.built.transaction.output[2].script_pubkey, get_htlc_redeemscript(&received_htlc, true, &keys).to_p2wsh());
		assert_eq!(tx.built.transaction.output[3].script_pubkey, get_htlc_redeemscript(&offered_htlc, true, &keys).to_p2wsh());
	}

	#[test]
	fn test_verify_detects_tampering() {
		let secp_ctx = Secp256k1::new();
		let channel_parameters = dummy_parameters(&secp_ctx, false);
		let holder_pubkeys = &channel_parameters.holder_pubkeys;
		let counterparty_pubkeys = &channel_parameters.counterparty_pubkeys;
		let per_commitment_point = PublicKey::from_secret_key(&secp_ctx, &SecretKey::from_slice(&[5; 32]).unwrap());
		let keys = TxCreationKeys::from_channel_static_keys(&per_commitment_point, holder_pubkeys, counterparty_pubkeys, &secp_ctx).unwrap();
		let directed = channel_parameters.as_holder_broadcastable();
		let tx = CommitmentTransaction::new_with_auxiliary_htlc_data(
			INITIAL_COMMITMENT_NUMBER - 3, 5000, 4000, holder_pubkeys.funding_pubkey,
			counterparty_pubkeys.funding_pubkey, keys, 253, &mut Vec::<(_, ())>::new(), &directed,
		);
		assert!(tx.verify(&directed, holder_pubkeys, counterparty_pubkeys, &secp_ctx).is_ok());
		// Swapping the roles derives different keys.
		assert!(tx.verify(&directed, counterparty_pubkeys, holder_pubkeys, &secp_ctx).is_err());
	}

	#[test]
	fn test_commitment_number_obscuring_round_trips() {
		let secp_ctx = Secp256k1::new();
		let channel_parameters = dummy_parameters(&secp_ctx, false);
		let holder_pubkeys = &channel_parameters.holder_pubkeys;
		let counterparty_pubkeys = &channel_parameters.counterparty_pubkeys;
		let per_commitment_point = PublicKey::from_secret_key(&secp_ctx, &SecretKey::from_slice(&[5; 32]).unwrap());
		let keys = TxCreationKeys::from_channel_static_keys(&per_commitment_point, counterparty_pubkeys, holder_pubkeys, &secp_ctx).unwrap();
		let directed = channel_parameters.as_counterparty_broadcastable();
		let factor = get_commitment_transaction_number_obscure_factor(
			&counterparty_pubkeys.payment_point, &holder_pubkeys.payment_point, directed.is_outbound(),
		);
		// The factor is symmetric in who computes it, as long as the opener's point goes first.
		assert_eq!(factor, get_commitment_transaction_number_obscure_factor(
			&holder_pubkeys.payment_point, &counterparty_pubkeys.payment_point, !directed.is_outbound(),
		));
		for height in [0u64, 1, 2, 1000, 0xffffff, 0x1000001] {
			let tx = CommitmentTransaction::new_with_auxiliary_htlc_data(
				INITIAL_COMMITMENT_NUMBER - height, 5000, 4000, counterparty_pubkeys.funding_pubkey,
				holder_pubkeys.funding_pubkey, keys.clone(), 253, &mut Vec::<(_, ())>::new(), &directed,
			);
			assert_eq!(commitment_number_from_tx(&tx.trust().built_transaction().transaction, factor),
				Some(INITIAL_COMMITMENT_NUMBER - height));
		}
	}

	#[test]
	fn test_htlc_claim_classification() {
		let secp_ctx = Secp256k1::new();
		let keys = dummy_pubkeys(&secp_ctx, 1);
		let sig = sign(&secp_ctx, &Message::from_digest([1; 32]), &SecretKey::from_slice(&[1; 32]).unwrap());
		let offered = HTLCOutputInCommitment {
			offered: true, amount_msat: 1_000_000, cltv_expiry: 500_000,
			payment_hash: PaymentHash([9; 32]), transaction_output_index: Some(0),
		};
		let received = HTLCOutputInCommitment { offered: false, ..offered.clone() };
		let offered_script = get_htlc_redeemscript_with_explicit_keys(&offered, false, &keys.htlc_basepoint, &keys.payment_point, &keys.revocation_basepoint);
		let received_script = get_htlc_redeemscript_with_explicit_keys(&received, false, &keys.htlc_basepoint, &keys.payment_point, &keys.revocation_basepoint);

		let timeout = build_htlc_input_witness(&sig, &sig, &None, &offered_script, false);
		assert_eq!(HTLCClaim::from_witness(&timeout), Some(HTLCClaim::OfferedTimeout));
		let success = build_htlc_input_witness(&sig, &sig, &Some(PaymentPreimage([3; 32])), &received_script, false);
		assert_eq!(HTLCClaim::from_witness(&success), Some(HTLCClaim::AcceptedPreimage));
		let revoked = build_revoked_htlc_witness(&sig, &keys.revocation_basepoint, &offered_script);
		assert_eq!(HTLCClaim::from_witness(&revoked), Some(HTLCClaim::Revocation));
		let counterparty_preimage = build_counterparty_htlc_witness(&sig, &Some(PaymentPreimage([3; 32])), &offered_script);
		assert_eq!(HTLCClaim::from_witness(&counterparty_preimage), Some(HTLCClaim::OfferedPreimage));

		let to_local = get_revokeable_redeemscript(&keys.revocation_basepoint, 144, &keys.delayed_payment_basepoint);
		assert_eq!(TxoutClaim::from_witness(&build_revoked_to_local_witness(&sig, &to_local)), Some(TxoutClaim::Revocation));
		assert_eq!(TxoutClaim::from_witness(&build_delayed_to_local_witness(&sig, &to_local)), Some(TxoutClaim::Delayed));
		assert_eq!(HTLCClaim::from_witness(&build_revoked_to_local_witness(&sig, &to_local)), None);
	}

	#[test]
	fn test_dust_threshold_includes_second_stage_fee() {
		let htlc = HTLCOutputInCommitment {
			offered: true, amount_msat: 2_000_000, cltv_expiry: 0,
			payment_hash: PaymentHash([0; 32]), transaction_output_index: None,
		};
		// 546 + 663 * 2000 / 1000 = 1872 sat, so 2000 sat is kept...
		assert!(!htlc.is_dust(546, 2000, false));
		// ...but not at a higher feerate...
		assert!(htlc.is_dust(546, 3000, false));
		// ...unless the second-stage transactions are zero-fee.
		assert!(!htlc.is_dust(546, 3000, true));
		assert_eq!(commit_tx_fee_sat(253, 0, false), 183);
		assert_eq!(commit_tx_fee_sat(253, 2, true), (253 * (1124 + 2 * 172)) / 1000);
	}
}
