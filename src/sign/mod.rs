// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Provides keys to channels and defines the interface for signing their transactions.
//!
//! Every signature this crate produces goes through a [`SignDescriptor`], which names the base
//! key, how it is tweaked for the commitment in question, and the output being spent. The
//! [`ChannelSigner`] trait turns a descriptor into a signature, [`compute_input_script`] turns
//! the signature into a complete witness for one specific script branch, and [`verify_input`]
//! runs the result through a [`ScriptVerifier`].

use bitcoin::opcodes;
use bitcoin::script::{Script, ScriptBuf};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::transaction::{Transaction, TxOut};
use bitcoin::Witness;

use bitcoin::hashes::sha256::Hash as Sha256;
use bitcoin::hashes::{Hash, HashEngine};
use bitcoin::secp256k1;
use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::secp256k1::{Message, PublicKey, Secp256k1, SecretKey};

use crate::chain::{ScriptVerifier, STANDARD_SCRIPT_VERIFY_FLAGS};
use crate::crypto::utils::{hkdf_extract_expand_6x, p2wsh_sighash, sighash_to_message, sign};
use crate::ln::chan_utils::{
	self, build_counterparty_htlc_witness, build_delayed_to_local_witness,
	build_htlc_input_witness, build_revoked_htlc_witness, build_revoked_to_local_witness,
	build_to_countersignatory_witness, derive_private_revocation_key,
	derive_public_revocation_key, htlc_countersignatory_sighash_type, tweak_private_key,
	tweak_public_key, ChannelPublicKeys, ChannelTransactionParameters, CommitmentSecretProducer,
	CommitmentTransaction, HolderCommitmentTransaction, KeyDerivationError,
	RevocationLedgerError,
};
use crate::ln::types::PaymentPreimage;
use crate::sync::Mutex;

#[allow(unused_imports)]
use crate::prelude::*;
use core::fmt;

pub mod batch;
pub mod ecdsa;

use crate::sign::batch::SignRequest;
use crate::sign::ecdsa::EcdsaChannelSigner;

/// The number of signing threads an [`InMemorySigner`] uses for the HTLC signatures of one
/// commitment unless told otherwise.
pub const DEFAULT_MAX_SIGNING_WORKERS: usize = 4;

/// Names one of the five per-channel base keys a signer holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum KeyFamily {
	/// The key in the 2-of-2 funding output.
	Funding,
	/// The revocation base key, used (doubly tweaked) to punish a counterparty's revoked state.
	Revocation,
	/// The static key our counterparty pays our balance to.
	Payment,
	/// The base key of our delayed `to_local` and second-level HTLC outputs.
	DelayedPayment,
	/// The base key of our HTLC signatures.
	Htlc,
}

/// How the base key named by a [`SignDescriptor`] is turned into the key that signs.
#[derive(Clone, PartialEq, Eq)]
pub enum SigningTweak {
	/// Sign with the base key itself.
	None,
	/// Add this scalar to the base key, as for per-commitment payment, delayed and HTLC keys.
	/// See [`chan_utils::derive_single_tweak`].
	Single([u8; 32]),
	/// Combine the (revocation) base key with the revealed per-commitment secret, as for the
	/// revocation key of a breached commitment.
	Double(SecretKey),
}

impl fmt::Debug for SigningTweak {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			SigningTweak::None => f.write_str("None"),
			SigningTweak::Single(tweak) => write!(f, "Single({})", log_bytes!(tweak[..])),
			SigningTweak::Double(_) => f.write_str("Double(..)"),
		}
	}
}

/// Everything needed to produce one input signature.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignDescriptor {
	/// The base key to sign with.
	pub key_family: KeyFamily,
	/// How [`Self::key_family`] is tweaked before signing.
	pub tweak: SigningTweak,
	/// The witness script of the output being spent. For P2WPKH outputs this is ignored.
	pub witness_script: ScriptBuf,
	/// The output being spent.
	pub output: TxOut,
	/// The index of the input spending [`Self::output`] in the signed transaction.
	pub input_index: usize,
	/// The sighash flag committed to by the signature.
	pub sighash_type: EcdsaSighashType,
}

impl SignDescriptor {
	/// The BIP 143 message this descriptor signs within `tx`.
	pub fn sighash(&self, tx: &Transaction) -> Result<Message, SignError> {
		if self.output.script_pubkey.is_p2wpkh() {
			SighashCache::new(tx)
				.p2wpkh_signature_hash(self.input_index, &self.output.script_pubkey, self.output.value, self.sighash_type)
				.map(sighash_to_message)
				.map_err(|_| SignError::SighashFailed { input_index: self.input_index })
		} else {
			p2wsh_sighash(tx, self.input_index, &self.witness_script, self.output.value, self.sighash_type)
				.ok_or(SignError::SighashFailed { input_index: self.input_index })
		}
	}
}

/// An error producing or checking a signature.
#[derive(Clone, PartialEq, Eq)]
pub enum SignError {
	/// The descriptor's tweak was zero or out of range.
	InvalidTweak,
	/// Tweaking produced an invalid key.
	InvalidKey,
	/// No sighash could be computed, usually because the input index is out of range.
	SighashFailed {
		/// The input index named by the descriptor.
		input_index: usize,
	},
	/// The requested witness needs a signature with a different sighash flag.
	UnsupportedSighashType,
	/// The signer is missing state it needs, or refused to sign.
	Unavailable,
	/// A revocation secret could not be released.
	Revocation(RevocationLedgerError),
	/// The assembled witness failed script verification.
	InvalidWitness {
		/// The index of the failing input.
		input_index: usize,
	},
}

impl From<KeyDerivationError> for SignError {
	fn from(e: KeyDerivationError) -> Self {
		match e {
			KeyDerivationError::InvalidTweak => SignError::InvalidTweak,
			KeyDerivationError::InvalidKey => SignError::InvalidKey,
		}
	}
}

impl fmt::Debug for SignError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match *self {
			SignError::InvalidTweak => f.write_str("Signing tweak is zero or out of range"),
			SignError::InvalidKey => f.write_str("Tweaked signing key is invalid"),
			SignError::SighashFailed { input_index } => write!(f, "Unable to compute sighash for input {}", input_index),
			SignError::UnsupportedSighashType => f.write_str("Witness requires a SIGHASH_ALL signature"),
			SignError::Unavailable => f.write_str("Signer is unavailable"),
			SignError::Revocation(ref e) => write!(f, "Unable to release revocation secret: {:?}", e),
			SignError::InvalidWitness { input_index } => write!(f, "Witness for input {} failed verification", input_index),
		}
	}
}

impl fmt::Display for SignError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		fmt::Debug::fmt(self, f)
	}
}

/// The script branch a witness satisfies. The stack items each branch expects differ, and
/// getting them wrong only shows up as a script failure, so each branch is named explicitly.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SpendPath {
	/// The revocation branch of a revoked `to_local`, second-level or HTLC output. The descriptor
	/// must carry a [`SigningTweak::Double`] on [`KeyFamily::Revocation`].
	Revoke,
	/// The delayed branch of our own `to_local` or second-level output, once the contest delay
	/// has passed.
	Delayed,
	/// Our second-level HTLC-Success transaction, spending an HTLC our counterparty offered us
	/// on our commitment.
	HtlcSuccess {
		/// Our counterparty's signature on the second-level transaction.
		counterparty_sig: Signature,
		/// The preimage claiming the HTLC.
		preimage: PaymentPreimage,
		/// Whether the channel uses anchor outputs.
		anchors: bool,
	},
	/// Our second-level HTLC-Timeout transaction, spending an HTLC we offered on our commitment.
	HtlcTimeout {
		/// Our counterparty's signature on the second-level transaction.
		counterparty_sig: Signature,
		/// Whether the channel uses anchor outputs.
		anchors: bool,
	},
	/// Claiming an HTLC we were offered directly from our counterparty's commitment.
	CounterpartyHtlcSuccess {
		/// The preimage claiming the HTLC.
		preimage: PaymentPreimage,
	},
	/// Timing out an HTLC we offered directly from our counterparty's commitment.
	CounterpartyHtlcTimeout,
	/// Our balance output on our counterparty's commitment.
	ToRemote {
		/// Whether the channel uses anchor outputs.
		anchors: bool,
	},
}

fn is_revokeable_script(script: &Script) -> bool {
	script.as_bytes().first() == Some(&opcodes::all::OP_IF.to_u8())
}

/// Derives the secret key a descriptor signs with from its base key.
pub fn derive_signing_key<T: secp256k1::Signing>(
	secp_ctx: &Secp256k1<T>, base_secret: &SecretKey, tweak: &SigningTweak,
) -> Result<SecretKey, SignError> {
	match tweak {
		SigningTweak::None => Ok(*base_secret),
		SigningTweak::Single(tweak) => Ok(tweak_private_key(base_secret, tweak)?),
		SigningTweak::Double(per_commitment_secret) => {
			Ok(derive_private_revocation_key(secp_ctx, per_commitment_secret, base_secret)?)
		},
	}
}

/// Derives the public key a descriptor signs with from its base point, the public counterpart
/// of [`derive_signing_key`].
pub fn derive_signing_pubkey<T: secp256k1::Signing + secp256k1::Verification>(
	secp_ctx: &Secp256k1<T>, base_point: &PublicKey, tweak: &SigningTweak,
) -> Result<PublicKey, SignError> {
	match tweak {
		SigningTweak::None => Ok(*base_point),
		SigningTweak::Single(tweak) => Ok(tweak_public_key(secp_ctx, base_point, tweak)?),
		SigningTweak::Double(per_commitment_secret) => {
			let per_commitment_point = PublicKey::from_secret_key(secp_ctx, per_commitment_secret);
			Ok(derive_public_revocation_key(secp_ctx, &per_commitment_point, base_point)?)
		},
	}
}

/// Looks up the base point of a key family.
pub fn base_point(pubkeys: &ChannelPublicKeys, key_family: KeyFamily) -> &PublicKey {
	match key_family {
		KeyFamily::Funding => &pubkeys.funding_pubkey,
		KeyFamily::Revocation => &pubkeys.revocation_basepoint,
		KeyFamily::Payment => &pubkeys.payment_point,
		KeyFamily::DelayedPayment => &pubkeys.delayed_payment_basepoint,
		KeyFamily::Htlc => &pubkeys.htlc_basepoint,
	}
}

/// A trait to handle the keys of a single channel.
///
/// Implementations hold the channel's base secrets and the seed of its per-commitment secrets.
/// Signing of commitment transactions themselves lives in [`EcdsaChannelSigner`].
pub trait ChannelSigner {
	/// Gets the per-commitment point for a specific commitment number
	///
	/// Note that the commitment number starts at `(1 << 48) - 1` and counts backwards.
	fn get_per_commitment_point(
		&self, idx: u64, secp_ctx: &Secp256k1<secp256k1::All>,
	) -> Result<PublicKey, SignError>;

	/// Gets the commitment secret for a specific commitment number as part of the revocation
	/// process.
	///
	/// An external signer implementation should error here if the commitment was already signed
	/// and should refuse to sign it in the future. Secrets are released strictly in order.
	fn release_commitment_secret(&self, idx: u64) -> Result<[u8; 32], SignError>;

	/// Validate the counterparty's signatures on the holder commitment transaction and HTLCs.
	///
	/// This is required in order for the signer to make sure that releasing a commitment
	/// secret won't leave us without a broadcastable holder transaction.
	fn validate_holder_commitment(&self, holder_tx: &HolderCommitmentTransaction) -> Result<(), ()>;

	/// Validate the counterparty's revocation.
	///
	/// This is required in order for the signer to make sure that the state has moved
	/// forward and it is safe to sign the next counterparty commitment.
	fn validate_counterparty_revocation(&self, idx: u64, secret: &SecretKey) -> Result<(), ()>;

	/// Returns the holder's channel public keys and basepoints.
	fn pubkeys(&self) -> &ChannelPublicKeys;

	/// Set the counterparty static channel data, including basepoints,
	/// `counterparty_selected`/`holder_selected_contest_delay` and funding outpoint.
	///
	/// This data is static, and will never change for a channel once set.
	fn provide_channel_parameters(&mut self, channel_parameters: &ChannelTransactionParameters);

	/// Signs the input described by `descriptor` within `tx`.
	fn sign_with_descriptor(
		&self, tx: &Transaction, descriptor: &SignDescriptor, secp_ctx: &Secp256k1<secp256k1::All>,
	) -> Result<Signature, SignError>;
}

/// Assembles the witness for `path` around a signature made over `descriptor`.
pub fn witness_for_path(
	descriptor: &SignDescriptor, path: &SpendPath, sig: &Signature, signing_pubkey: &PublicKey,
) -> Result<Witness, SignError> {
	if descriptor.sighash_type != EcdsaSighashType::All {
		return Err(SignError::UnsupportedSighashType);
	}
	let script = &descriptor.witness_script;
	Ok(match path {
		SpendPath::Revoke => {
			if is_revokeable_script(script) {
				build_revoked_to_local_witness(sig, script)
			} else {
				build_revoked_htlc_witness(sig, signing_pubkey, script)
			}
		},
		SpendPath::Delayed => build_delayed_to_local_witness(sig, script),
		SpendPath::HtlcSuccess { counterparty_sig, preimage, anchors } => {
			build_htlc_input_witness(sig, counterparty_sig, &Some(*preimage), script, *anchors)
		},
		SpendPath::HtlcTimeout { counterparty_sig, anchors } => {
			build_htlc_input_witness(sig, counterparty_sig, &None, script, *anchors)
		},
		SpendPath::CounterpartyHtlcSuccess { preimage } => {
			build_counterparty_htlc_witness(sig, &Some(*preimage), script)
		},
		SpendPath::CounterpartyHtlcTimeout => build_counterparty_htlc_witness(sig, &None, script),
		SpendPath::ToRemote { anchors } => build_to_countersignatory_witness(sig, signing_pubkey, *anchors),
	})
}

/// Signs `descriptor` and assembles the complete witness satisfying `path`.
pub fn compute_input_script<S: ChannelSigner + ?Sized>(
	signer: &S, tx: &Transaction, descriptor: &SignDescriptor, path: &SpendPath,
	secp_ctx: &Secp256k1<secp256k1::All>,
) -> Result<Witness, SignError> {
	let sig = signer.sign_with_descriptor(tx, descriptor, secp_ctx)?;
	let signing_pubkey = derive_signing_pubkey(
		secp_ctx, base_point(signer.pubkeys(), descriptor.key_family), &descriptor.tweak,
	)?;
	witness_for_path(descriptor, path, &sig, &signing_pubkey)
}

/// Runs input `input_index` of `tx`, spending `prev_out`, through `verifier`.
pub fn verify_input<V: ScriptVerifier + ?Sized>(
	verifier: &V, tx: &Transaction, input_index: usize, prev_out: &TxOut,
) -> Result<(), SignError> {
	verifier
		.verify_script(&prev_out.script_pubkey, prev_out.value, tx, input_index, STANDARD_SCRIPT_VERIFY_FLAGS)
		.map_err(|_| SignError::InvalidWitness { input_index })
}

/// A simple implementation of [`ChannelSigner`] and [`EcdsaChannelSigner`] that just keeps the
/// private keys in memory.
pub struct InMemorySigner {
	/// Holder secret key in the 2-of-2 multisig script of a channel. This key also backs the
	/// holder's anchor output in a commitment transaction, if one is present.
	funding_key: SecretKey,
	/// Holder secret key for blinded revocation pubkey.
	revocation_base_key: SecretKey,
	/// Holder secret key used for our balance in counterparty-broadcasted commitment transactions.
	payment_key: SecretKey,
	/// Holder secret key used in an HTLC transaction.
	delayed_payment_base_key: SecretKey,
	/// Holder HTLC secret key used in commitment transaction HTLC outputs.
	htlc_base_key: SecretKey,
	/// Commitment seed.
	commitment_secrets: Mutex<CommitmentSecretProducer>,
	/// Holder public keys and basepoints.
	holder_channel_pubkeys: ChannelPublicKeys,
	/// Counterparty public keys and counterparty/holder `selected_contest_delay`, populated on
	/// channel acceptance.
	channel_parameters: Option<ChannelTransactionParameters>,
	/// The identifier this signer's keys were derived from.
	channel_keys_id: [u8; 32],
	max_signing_workers: usize,
}

impl InMemorySigner {
	/// Creates a new [`InMemorySigner`].
	pub fn new<C: secp256k1::Signing>(
		secp_ctx: &Secp256k1<C>, funding_key: SecretKey, revocation_base_key: SecretKey,
		payment_key: SecretKey, delayed_payment_base_key: SecretKey, htlc_base_key: SecretKey,
		commitment_seed: [u8; 32], channel_keys_id: [u8; 32],
	) -> InMemorySigner {
		let from_secret = |s: &SecretKey| PublicKey::from_secret_key(secp_ctx, s);
		let holder_channel_pubkeys = ChannelPublicKeys {
			funding_pubkey: from_secret(&funding_key),
			revocation_basepoint: from_secret(&revocation_base_key),
			payment_point: from_secret(&payment_key),
			delayed_payment_basepoint: from_secret(&delayed_payment_base_key),
			htlc_basepoint: from_secret(&htlc_base_key),
		};
		InMemorySigner {
			funding_key,
			revocation_base_key,
			payment_key,
			delayed_payment_base_key,
			htlc_base_key,
			commitment_secrets: Mutex::new(CommitmentSecretProducer::new(commitment_seed)),
			holder_channel_pubkeys,
			channel_parameters: None,
			channel_keys_id,
			max_signing_workers: DEFAULT_MAX_SIGNING_WORKERS,
		}
	}

	/// Derives all of a channel's keys from a 32-byte `seed` and a per-channel `channel_keys_id`.
	///
	/// Distinct ids yield independent keys, so one seed can back any number of channels.
	pub fn from_seed<C: secp256k1::Signing>(
		secp_ctx: &Secp256k1<C>, seed: &[u8; 32], channel_keys_id: [u8; 32],
	) -> Result<InMemorySigner, SignError> {
		let mut sha = Sha256::engine();
		sha.input(seed);
		sha.input(&channel_keys_id);
		let ikm = Sha256::from_engine(sha).to_byte_array();
		let (funding, revocation, payment, delayed, htlc, commitment_seed) =
			hkdf_extract_expand_6x(b"lightning-channel keys", &ikm);
		let key = |bytes: [u8; 32]| SecretKey::from_slice(&bytes).map_err(|_| SignError::InvalidKey);
		Ok(InMemorySigner::new(
			secp_ctx, key(funding)?, key(revocation)?, key(payment)?, key(delayed)?, key(htlc)?,
			commitment_seed, channel_keys_id,
		))
	}

	/// Caps the number of threads used to sign the HTLC transactions of one commitment.
	pub fn set_max_signing_workers(&mut self, max_signing_workers: usize) {
		self.max_signing_workers = max_signing_workers.max(1);
	}

	/// Returns the counterparty's pubkeys if the channel parameters have been provided.
	pub fn counterparty_pubkeys(&self) -> Option<&ChannelPublicKeys> {
		self.channel_parameters.as_ref().map(|params| &params.counterparty_pubkeys)
	}

	/// Returns the channel parameters if they have been provided.
	pub fn get_channel_parameters(&self) -> Option<&ChannelTransactionParameters> {
		self.channel_parameters.as_ref()
	}

	/// The identifier this signer's keys were derived from.
	pub fn channel_keys_id(&self) -> [u8; 32] {
		self.channel_keys_id
	}

	fn base_secret(&self, key_family: KeyFamily) -> &SecretKey {
		match key_family {
			KeyFamily::Funding => &self.funding_key,
			KeyFamily::Revocation => &self.revocation_base_key,
			KeyFamily::Payment => &self.payment_key,
			KeyFamily::DelayedPayment => &self.delayed_payment_base_key,
			KeyFamily::Htlc => &self.htlc_base_key,
		}
	}
}

impl ChannelSigner for InMemorySigner {
	fn get_per_commitment_point(
		&self, idx: u64, secp_ctx: &Secp256k1<secp256k1::All>,
	) -> Result<PublicKey, SignError> {
		let producer = self.commitment_secrets.lock().map_err(|_| SignError::Unavailable)?;
		Ok(producer.point_at_index(secp_ctx, idx)?)
	}

	fn release_commitment_secret(&self, idx: u64) -> Result<[u8; 32], SignError> {
		let mut producer = self.commitment_secrets.lock().map_err(|_| SignError::Unavailable)?;
		producer.release(idx).map_err(SignError::Revocation)
	}

	fn validate_holder_commitment(&self, _holder_tx: &HolderCommitmentTransaction) -> Result<(), ()> {
		Ok(())
	}

	fn validate_counterparty_revocation(&self, _idx: u64, _secret: &SecretKey) -> Result<(), ()> {
		Ok(())
	}

	fn pubkeys(&self) -> &ChannelPublicKeys {
		&self.holder_channel_pubkeys
	}

	fn provide_channel_parameters(&mut self, channel_parameters: &ChannelTransactionParameters) {
		if let Some(existing) = &self.channel_parameters {
			debug_assert!(existing == channel_parameters, "Channel parameters must not change");
			return;
		}
		debug_assert_eq!(channel_parameters.holder_pubkeys, self.holder_channel_pubkeys);
		self.channel_parameters = Some(channel_parameters.clone());
	}

	fn sign_with_descriptor(
		&self, tx: &Transaction, descriptor: &SignDescriptor, secp_ctx: &Secp256k1<secp256k1::All>,
	) -> Result<Signature, SignError> {
		let signing_key = derive_signing_key(secp_ctx, self.base_secret(descriptor.key_family), &descriptor.tweak)?;
		let sighash = descriptor.sighash(tx)?;
		Ok(sign(secp_ctx, &sighash, &signing_key))
	}
}

impl EcdsaChannelSigner for InMemorySigner {
	fn sign_counterparty_commitment(
		&self, commitment_tx: &CommitmentTransaction, secp_ctx: &Secp256k1<secp256k1::All>,
	) -> Result<(Signature, Vec<Signature>), SignError> {
		let channel_parameters = self.channel_parameters.as_ref().ok_or(SignError::Unavailable)?;
		let trusted_tx = commitment_tx.trust();
		let keys = trusted_tx.keys();

		let funding_redeemscript = channel_parameters.funding_redeemscript();
		let commitment_sig = trusted_tx
			.built_transaction()
			.sign(&self.funding_key, &funding_redeemscript, channel_parameters.channel_value_satoshis, secp_ctx)
			.ok_or(SignError::SighashFailed { input_index: 0 })?;

		let directed = channel_parameters.as_counterparty_broadcastable();
		let htlc_tweak = chan_utils::derive_single_tweak(&keys.per_commitment_point, &self.holder_channel_pubkeys.htlc_basepoint);
		let mut requests = Vec::with_capacity(commitment_tx.htlcs().len());
		for htlc in commitment_tx.htlcs() {
			let (htlc_tx, htlc_redeemscript) = trusted_tx
				.htlc_transaction(&directed, htlc)
				.ok_or(SignError::SighashFailed { input_index: 0 })?;
			let output = TxOut {
				value: bitcoin::Amount::from_sat(htlc.amount_msat / 1000),
				script_pubkey: htlc_redeemscript.to_p2wsh(),
			};
			requests.push(SignRequest {
				tx: htlc_tx,
				descriptor: SignDescriptor {
					key_family: KeyFamily::Htlc,
					tweak: SigningTweak::Single(htlc_tweak),
					witness_script: htlc_redeemscript,
					output,
					input_index: 0,
					sighash_type: htlc_countersignatory_sighash_type(trusted_tx.anchors()),
				},
			});
		}
		let htlc_sigs = batch::sign_all(self, &requests, self.max_signing_workers, secp_ctx)?;

		Ok((commitment_sig, htlc_sigs))
	}

	fn sign_holder_commitment(
		&self, commitment_tx: &HolderCommitmentTransaction, secp_ctx: &Secp256k1<secp256k1::All>,
	) -> Result<Signature, SignError> {
		let channel_parameters = self.channel_parameters.as_ref().ok_or(SignError::Unavailable)?;
		let funding_redeemscript = channel_parameters.funding_redeemscript();
		let trusted_tx = commitment_tx.trust();
		trusted_tx
			.built_transaction()
			.sign(&self.funding_key, &funding_redeemscript, channel_parameters.channel_value_satoshis, secp_ctx)
			.ok_or(SignError::SighashFailed { input_index: 0 })
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::chain::ScriptVerifier;
	use crate::ln::chan_utils::{
		get_htlc_redeemscript, get_revokeable_redeemscript, HTLCOutputInCommitment, TxCreationKeys,
	};
	use crate::ln::channel::INITIAL_COMMITMENT_NUMBER;
	use crate::ln::types::PaymentHash;
	use crate::util::test_utils::{self, ConsensusScriptVerifier};

	use bitcoin::absolute::LockTime;
	use bitcoin::transaction::{OutPoint, TxIn, Version};
	use bitcoin::{Amount, Sequence, Txid};

	fn spending_tx(prev: OutPoint, lock_time: u32, sequence: u32) -> Transaction {
		Transaction {
			version: Version::TWO,
			lock_time: LockTime::from_consensus(lock_time),
			input: vec![TxIn { previous_output: prev, script_sig: ScriptBuf::new(), sequence: Sequence(sequence), witness: Witness::new() }],
			output: vec![TxOut { value: Amount::from_sat(90_000), script_pubkey: test_utils::sweep_script() }],
		}
	}

	fn prev_outpoint() -> OutPoint {
		OutPoint { txid: Txid::from_byte_array([0x11; 32]), vout: 0 }
	}

	#[test]
	fn zero_single_tweak_is_refused() {
		let secp_ctx = Secp256k1::new();
		let signer = test_utils::in_memory_signer(1);
		let tx = spending_tx(prev_outpoint(), 0, 0);
		let descriptor = SignDescriptor {
			key_family: KeyFamily::Htlc,
			tweak: SigningTweak::Single([0; 32]),
			witness_script: ScriptBuf::new(),
			output: TxOut { value: Amount::from_sat(100_000), script_pubkey: ScriptBuf::new() },
			input_index: 0,
			sighash_type: EcdsaSighashType::All,
		};
		assert_eq!(signer.sign_with_descriptor(&tx, &descriptor, &secp_ctx), Err(SignError::InvalidTweak));
	}

	#[test]
	fn sighash_for_missing_input() {
		let secp_ctx = Secp256k1::new();
		let signer = test_utils::in_memory_signer(1);
		let tx = spending_tx(prev_outpoint(), 0, 0);
		let descriptor = SignDescriptor {
			key_family: KeyFamily::Payment,
			tweak: SigningTweak::None,
			witness_script: ScriptBuf::new(),
			output: TxOut { value: Amount::from_sat(100_000), script_pubkey: ScriptBuf::new() },
			input_index: 3,
			sighash_type: EcdsaSighashType::All,
		};
		assert_eq!(signer.sign_with_descriptor(&tx, &descriptor, &secp_ctx), Err(SignError::SighashFailed { input_index: 3 }));
	}

	#[test]
	fn signer_keys_are_per_channel() {
		let secp_ctx = Secp256k1::new();
		let a = InMemorySigner::from_seed(&secp_ctx, &[1; 32], [0; 32]).unwrap();
		let b = InMemorySigner::from_seed(&secp_ctx, &[1; 32], [1; 32]).unwrap();
		let a_again = InMemorySigner::from_seed(&secp_ctx, &[1; 32], [0; 32]).unwrap();
		assert_ne!(a.pubkeys(), b.pubkeys());
		assert_eq!(a.pubkeys(), a_again.pubkeys());
		assert_eq!(a.get_per_commitment_point(INITIAL_COMMITMENT_NUMBER, &secp_ctx).unwrap(),
			a_again.get_per_commitment_point(INITIAL_COMMITMENT_NUMBER, &secp_ctx).unwrap());
	}

	#[test]
	fn released_secrets_match_points() {
		let secp_ctx = Secp256k1::new();
		let signer = test_utils::in_memory_signer(2);
		for idx in (INITIAL_COMMITMENT_NUMBER - 3..=INITIAL_COMMITMENT_NUMBER).rev() {
			let point = signer.get_per_commitment_point(idx, &secp_ctx).unwrap();
			let secret = signer.release_commitment_secret(idx).unwrap();
			assert_eq!(PublicKey::from_secret_key(&secp_ctx, &SecretKey::from_slice(&secret).unwrap()), point);
		}
		assert!(matches!(signer.release_commitment_secret(INITIAL_COMMITMENT_NUMBER - 10), Err(SignError::Revocation(_))));
	}

	// Keys for an HTLC output on a commitment broadcast by `broadcaster`, plus the per-commitment
	// secret behind it so the revocation path can be exercised.
	struct HtlcFixture {
		broadcaster: InMemorySigner,
		countersignatory: InMemorySigner,
		per_commitment_secret: SecretKey,
		keys: TxCreationKeys,
	}

	fn htlc_fixture() -> HtlcFixture {
		let secp_ctx = Secp256k1::new();
		let broadcaster = test_utils::in_memory_signer(3);
		let countersignatory = test_utils::in_memory_signer(4);
		let per_commitment_secret = SecretKey::from_slice(&[0x55; 32]).unwrap();
		let per_commitment_point = PublicKey::from_secret_key(&secp_ctx, &per_commitment_secret);
		let keys = TxCreationKeys::from_channel_static_keys(
			&per_commitment_point, broadcaster.pubkeys(), countersignatory.pubkeys(), &secp_ctx,
		).unwrap();
		HtlcFixture { broadcaster, countersignatory, per_commitment_secret, keys }
	}

	const PREIMAGE: PaymentPreimage = PaymentPreimage([0x42; 32]);
	const CLTV_EXPIRY: u32 = 500;

	fn received_htlc() -> HTLCOutputInCommitment {
		HTLCOutputInCommitment {
			offered: false,
			amount_msat: 100_000_000,
			cltv_expiry: CLTV_EXPIRY,
			payment_hash: PaymentHash::from(PREIMAGE),
			transaction_output_index: Some(0),
		}
	}

	// The countersignatory claims an HTLC they were offered (received by the broadcaster's
	// counterparty) directly from the broadcaster's commitment.
	fn claim_offered_htlc(
		fixture: &HtlcFixture, preimage: &[u8], tweak: SigningTweak, verifier: &ConsensusScriptVerifier,
	) -> Result<(), SignError> {
		let secp_ctx = Secp256k1::new();
		let htlc = HTLCOutputInCommitment { offered: true, ..received_htlc() };
		let script = get_htlc_redeemscript(&htlc, false, &fixture.keys);
		let output = TxOut { value: Amount::from_sat(100_000), script_pubkey: script.to_p2wsh() };
		let mut tx = spending_tx(prev_outpoint(), 0, 0);
		let descriptor = SignDescriptor {
			key_family: KeyFamily::Htlc,
			tweak,
			witness_script: script.clone(),
			output: output.clone(),
			input_index: 0,
			sighash_type: EcdsaSighashType::All,
		};
		let sig = fixture.countersignatory.sign_with_descriptor(&tx, &descriptor, &secp_ctx)?;
		let mut witness = Witness::new();
		witness.push_ecdsa_signature(&bitcoin::ecdsa::Signature::sighash_all(sig));
		witness.push(preimage);
		witness.push(script.as_bytes());
		tx.input[0].witness = witness;
		verify_input(verifier, &tx, 0, &output)
	}

	#[test]
	fn spend_matrix_preimage_and_tweak() {
		let fixture = htlc_fixture();
		let verifier = ConsensusScriptVerifier;
		let tweak = SigningTweak::Single(chan_utils::derive_single_tweak(
			&fixture.keys.per_commitment_point, &fixture.countersignatory.pubkeys().htlc_basepoint,
		));
		// Correct preimage, tweak and key.
		assert_eq!(claim_offered_htlc(&fixture, &PREIMAGE.0, tweak.clone(), &verifier), Ok(()));
		// A 31-byte preimage takes the timeout branch, which a single signature can't satisfy.
		assert_eq!(claim_offered_htlc(&fixture, &PREIMAGE.0[..31], tweak.clone(), &verifier),
			Err(SignError::InvalidWitness { input_index: 0 }));
		// Signing with the untweaked base key doesn't match the per-commitment HTLC key.
		assert_eq!(claim_offered_htlc(&fixture, &PREIMAGE.0, SigningTweak::None, &verifier),
			Err(SignError::InvalidWitness { input_index: 0 }));
	}

	#[test]
	fn spend_matrix_timelocks() {
		let secp_ctx = Secp256k1::new();
		let fixture = htlc_fixture();
		let verifier = ConsensusScriptVerifier;

		// The countersignatory times out an HTLC it offered (received by the broadcaster) once
		// the CLTV expiry has been reached.
		let htlc = received_htlc();
		let script = get_htlc_redeemscript(&htlc, false, &fixture.keys);
		let output = TxOut { value: Amount::from_sat(100_000), script_pubkey: script.to_p2wsh() };
		let tweak = SigningTweak::Single(chan_utils::derive_single_tweak(
			&fixture.keys.per_commitment_point, &fixture.countersignatory.pubkeys().htlc_basepoint,
		));
		let timeout_with_locktime = |lock_time: u32| {
			let mut tx = spending_tx(prev_outpoint(), lock_time, 0);
			let descriptor = SignDescriptor {
				key_family: KeyFamily::Htlc,
				tweak: tweak.clone(),
				witness_script: script.clone(),
				output: output.clone(),
				input_index: 0,
				sighash_type: EcdsaSighashType::All,
			};
			tx.input[0].witness = compute_input_script(
				&fixture.countersignatory, &tx, &descriptor, &SpendPath::CounterpartyHtlcTimeout, &secp_ctx,
			).unwrap();
			verify_input(&verifier, &tx, 0, &output)
		};
		assert_eq!(timeout_with_locktime(CLTV_EXPIRY), Ok(()));
		assert_eq!(timeout_with_locktime(CLTV_EXPIRY - 1), Err(SignError::InvalidWitness { input_index: 0 }));

		// The broadcaster claims its to_local output only after the contest delay.
		let to_self_delay = 144;
		let to_local = get_revokeable_redeemscript(&fixture.keys.revocation_key, to_self_delay, &fixture.keys.broadcaster_delayed_payment_key);
		let output = TxOut { value: Amount::from_sat(100_000), script_pubkey: to_local.to_p2wsh() };
		let delayed_with_sequence = |sequence: u32| {
			let mut tx = spending_tx(prev_outpoint(), 0, sequence);
			let descriptor = SignDescriptor {
				key_family: KeyFamily::DelayedPayment,
				tweak: SigningTweak::Single(chan_utils::derive_single_tweak(
					&fixture.keys.per_commitment_point, &fixture.broadcaster.pubkeys().delayed_payment_basepoint,
				)),
				witness_script: to_local.clone(),
				output: output.clone(),
				input_index: 0,
				sighash_type: EcdsaSighashType::All,
			};
			tx.input[0].witness = compute_input_script(&fixture.broadcaster, &tx, &descriptor, &SpendPath::Delayed, &secp_ctx).unwrap();
			verify_input(&verifier, &tx, 0, &output)
		};
		assert_eq!(delayed_with_sequence(to_self_delay as u32), Ok(()));
		assert_eq!(delayed_with_sequence(to_self_delay as u32 - 1), Err(SignError::InvalidWitness { input_index: 0 }));
	}

	#[test]
	fn revocation_path_spends_without_delay() {
		let secp_ctx = Secp256k1::new();
		let fixture = htlc_fixture();
		let verifier = ConsensusScriptVerifier;
		let to_local = get_revokeable_redeemscript(&fixture.keys.revocation_key, 144, &fixture.keys.broadcaster_delayed_payment_key);
		let htlc_script = get_htlc_redeemscript(&received_htlc(), false, &fixture.keys);
		for script in [to_local, htlc_script] {
			let output = TxOut { value: Amount::from_sat(100_000), script_pubkey: script.to_p2wsh() };
			let mut tx = spending_tx(prev_outpoint(), 0, 0);
			let descriptor = SignDescriptor {
				key_family: KeyFamily::Revocation,
				tweak: SigningTweak::Double(fixture.per_commitment_secret),
				witness_script: script,
				output: output.clone(),
				input_index: 0,
				sighash_type: EcdsaSighashType::All,
			};
			tx.input[0].witness = compute_input_script(&fixture.countersignatory, &tx, &descriptor, &SpendPath::Revoke, &secp_ctx).unwrap();
			assert_eq!(verify_input(&verifier, &tx, 0, &output), Ok(()));

			// Without the revealed secret the base key alone is useless.
			let descriptor = SignDescriptor { tweak: SigningTweak::None, ..descriptor };
			tx.input[0].witness = compute_input_script(&fixture.countersignatory, &tx, &descriptor, &SpendPath::Revoke, &secp_ctx).unwrap();
			assert!(verifier.verify_script(&output.script_pubkey, output.value, &tx, 0, STANDARD_SCRIPT_VERIFY_FLAGS).is_err());
		}
	}

	#[test]
	fn witness_requires_sighash_all() {
		let secp_ctx = Secp256k1::new();
		let fixture = htlc_fixture();
		let tx = spending_tx(prev_outpoint(), 0, 0);
		let descriptor = SignDescriptor {
			key_family: KeyFamily::Payment,
			tweak: SigningTweak::None,
			witness_script: ScriptBuf::new(),
			output: TxOut { value: Amount::from_sat(100_000), script_pubkey: chan_utils::get_counterparty_payment_script(&fixture.countersignatory.pubkeys().payment_point, false) },
			input_index: 0,
			sighash_type: EcdsaSighashType::SinglePlusAnyoneCanPay,
		};
		assert_eq!(
			compute_input_script(&fixture.countersignatory, &tx, &descriptor, &SpendPath::ToRemote { anchors: false }, &secp_ctx),
			Err(SignError::UnsupportedSighashType)
		);
	}
}
