// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Builds justice transactions sweeping every output of a revoked counterparty commitment.
//!
//! A [`JusticeKit`] records what a watcher needs to know about one counterparty commitment
//! ahead of time: the keys and HTLCs it was built from, where swept funds go, and what fee and
//! reward to pay. When a [`BreachedCommitment`] is reported and its revocation secret is known,
//! [`JusticeAssembler::respond_to_breach`] locates each revoked output, signs it through the
//! revocation path, checks every witness against a [`ScriptVerifier`] and broadcasts the result.

use bitcoin::absolute::LockTime;
use bitcoin::script::{Script, ScriptBuf};
use bitcoin::secp256k1::{self, PublicKey, Secp256k1, SecretKey};
use bitcoin::sighash::EcdsaSighashType;
use bitcoin::transaction::{OutPoint, Transaction, TxIn, TxOut, Version};
use bitcoin::{Amount, Sequence, Witness};

use crate::chain::chaininterface::BroadcasterInterface;
use crate::chain::channelmonitor::ChannelMonitorUpdateStep;
use crate::chain::{BreachedCommitment, RevocationSecretSource, ScriptVerifier};
use crate::ln::chan_utils::{
	commitment_number_from_tx, get_commitment_transaction_number_obscure_factor,
	get_counterparty_payment_script, get_htlc_redeemscript, get_revokeable_redeemscript,
	get_to_countersignatory_with_anchors_redeemscript, ChannelTransactionParameters,
	HTLCOutputInCommitment, KeyDerivationError, TxCreationKeys, REVOKEABLE_REDEEMSCRIPT_MAX_LENGTH,
};
use crate::ln::types::ChannelId;
use crate::sign::{
	compute_input_script, verify_input, ChannelSigner, KeyFamily, SignDescriptor, SignError,
	SigningTweak, SpendPath,
};
use crate::util::config::JusticeConfig;
use crate::util::logger::{Logger, WithContext};
use crate::util::transaction_utils::{sort_inputs, sort_outputs};

#[allow(unused_imports)]
use crate::prelude::*;

use core::cmp;
use core::fmt;
use core::ops::Deref;

const WITNESS_SCALE_FACTOR: u64 = 4;

/// Outputs of a justice transaction must be at least this large to relay.
pub const SWEEP_DUST_LIMIT_SATOSHIS: u64 = 546;

// number_of_witness_elements + sig_length + revocation_sig + true_length + op_true + witness_script_length + witness_script
pub(crate) const WEIGHT_REVOKED_OUTPUT: u64 = 1 + 1 + 73 + 1 + 1 + 1 + REVOKEABLE_REDEEMSCRIPT_MAX_LENGTH as u64;

pub(crate) fn weight_revoked_offered_htlc(anchors: bool) -> u64 {
	// number_of_witness_elements + sig_length + revocation_sig + revocation_pubkey_length + revocationpubkey + witness_script_length + witness_script
	const WEIGHT_REVOKED_OFFERED_HTLC: u64 = 1 + 1 + 73 + 1 + 33 + 1 + 133;
	const WEIGHT_REVOKED_OFFERED_HTLC_ANCHORS: u64 = WEIGHT_REVOKED_OFFERED_HTLC + 3; // + OP_1 + OP_CSV + OP_DROP
	if anchors { WEIGHT_REVOKED_OFFERED_HTLC_ANCHORS } else { WEIGHT_REVOKED_OFFERED_HTLC }
}

pub(crate) fn weight_revoked_received_htlc(anchors: bool) -> u64 {
	// number_of_witness_elements + sig_length + revocation_sig + revocation_pubkey_length + revocationpubkey + witness_script_length + witness_script
	const WEIGHT_REVOKED_RECEIVED_HTLC: u64 = 1 + 1 + 73 + 1 + 33 + 1 + 139;
	const WEIGHT_REVOKED_RECEIVED_HTLC_ANCHORS: u64 = WEIGHT_REVOKED_RECEIVED_HTLC + 3; // + OP_1 + OP_CSV + OP_DROP
	if anchors { WEIGHT_REVOKED_RECEIVED_HTLC_ANCHORS } else { WEIGHT_REVOKED_RECEIVED_HTLC }
}

pub(crate) fn weight_to_remote(anchors: bool) -> u64 {
	// number_of_witness_elements + sig_length + sig + pubkey_length + pubkey
	const WEIGHT_P2WPKH_TO_REMOTE: u64 = 1 + 1 + 73 + 1 + 33;
	// number_of_witness_elements + sig_length + sig + witness_script_length + witness_script
	const WEIGHT_TO_REMOTE_ANCHORS: u64 = 1 + 1 + 73 + 1 + 37;
	if anchors { WEIGHT_TO_REMOTE_ANCHORS } else { WEIGHT_P2WPKH_TO_REMOTE }
}

/// The weight of a justice transaction spending inputs with the given witness weights to the
/// given output scripts.
pub fn justice_tx_weight<'a, I: Iterator<Item = u64>, O: Iterator<Item = &'a Script>>(
	witness_weights: I, output_scripts: O,
) -> u64 {
	let mut inputs_weight = 0;
	let mut witnesses_weight = 2; // count segwit flags
	for witness_weight in witness_weights {
		// previous_out_point: 36 bytes ; var_int: 1 byte ; sequence: 4 bytes
		inputs_weight += 41 * WITNESS_SCALE_FACTOR;
		witnesses_weight += witness_weight;
	}
	// version: 4 bytes ; count_tx_in: 1 byte ; count_tx_out: 1 byte ; lock_time: 4 bytes
	let transaction_weight = 10 * WITNESS_SCALE_FACTOR;
	// value: 8 bytes ; var_int: 1 byte ; pk_script: `script.len()`
	let output_weight: u64 = output_scripts.map(|script| (8 + 1 + script.len() as u64) * WITNESS_SCALE_FACTOR).sum();
	inputs_weight + witnesses_weight + transaction_weight + output_weight
}

/// The fee and reward terms agreed with the victim for sweeping a breach.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SweepPolicy {
	/// The feerate the justice transaction pays, in satoshis per 1000 weight units.
	pub feerate_per_kw: u32,
	/// A flat reward paid to the watcher's reward script.
	pub reward_base_sat: u64,
	/// A reward proportional to the swept value, in millionths.
	pub reward_rate_ppm: u32,
}

impl SweepPolicy {
	/// The fee paid by a transaction of `weight`.
	pub fn fee_sat(&self, weight: u64) -> u64 {
		weight * self.feerate_per_kw as u64 / 1000
	}

	/// The reward owed for sweeping `total_in_sat`, or zero if it would be too small to relay.
	pub fn reward_sat(&self, total_in_sat: u64) -> u64 {
		let proportional = (total_in_sat as u128 * self.reward_rate_ppm as u128 / 1_000_000) as u64;
		let reward = self.reward_base_sat.saturating_add(proportional);
		if reward < SWEEP_DUST_LIMIT_SATOSHIS { 0 } else { reward }
	}
}

/// Identifies one output of a breached commitment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BreachedOutputKind {
	/// The breacher's own, revoked, balance.
	RevokedToLocal,
	/// Our balance. It isn't revoked but is swept along with everything else.
	ToRemote,
	/// An HTLC the breacher offered, at the given output index.
	RevokedOfferedHtlc {
		/// The output index on the breached commitment.
		output_index: u32,
	},
	/// An HTLC the breacher received, at the given output index.
	RevokedReceivedHtlc {
		/// The output index on the breached commitment.
		output_index: u32,
	},
}

/// Everything a watcher needs to punish one specific counterparty commitment, should it ever be
/// revoked and then broadcast.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JusticeKit {
	/// The channel the commitment belongs to.
	pub channel_id: ChannelId,
	/// Where the swept funds go.
	pub sweep_script: ScriptBuf,
	/// Where the watcher's reward goes, if it takes one.
	pub reward_script: Option<ScriptBuf>,
	/// Fee and reward terms.
	pub policy: SweepPolicy,
	/// The backwards-counting commitment number of the commitment.
	pub commitment_number: u64,
	/// The breacher's per-commitment point for the commitment.
	pub per_commitment_point: PublicKey,
	/// The factor the commitment number is obscured with on chain.
	pub obscure_factor: u64,
	/// The breacher's delayed payment base point.
	pub breacher_delayed_payment_basepoint: PublicKey,
	/// The breacher's HTLC base point.
	pub breacher_htlc_basepoint: PublicKey,
	/// Our revocation base point.
	pub victim_revocation_basepoint: PublicKey,
	/// Our HTLC base point.
	pub victim_htlc_basepoint: PublicKey,
	/// Our static payment point.
	pub victim_payment_point: PublicKey,
	/// The delay on the breacher's `to_local` output.
	pub to_self_delay: u16,
	/// Whether the channel uses anchor outputs.
	pub anchors: bool,
	/// The non-dust HTLCs of the commitment with their output indices.
	pub htlcs: Vec<HTLCOutputInCommitment>,
	/// The value of the breacher's `to_local` output, zero if it was trimmed.
	pub to_local_value_sat: u64,
	/// The value of our `to_remote` output, zero if it was trimmed.
	pub to_remote_value_sat: u64,
}

impl JusticeKit {
	/// Builds a kit from a counterparty commitment recorded in a
	/// [`ChannelMonitorUpdateStep::LatestCounterpartyCommitmentTxInfo`], with `channel_parameters`
	/// organized from our (the victim's) point of view.
	///
	/// Returns `None` for any other kind of step.
	pub fn from_counterparty_commitment(
		channel_id: ChannelId, channel_parameters: &ChannelTransactionParameters,
		step: &ChannelMonitorUpdateStep, sweep_script: ScriptBuf, reward_script: Option<ScriptBuf>,
		policy: SweepPolicy,
	) -> Option<JusticeKit> {
		match step {
			ChannelMonitorUpdateStep::LatestCounterpartyCommitmentTxInfo {
				htlc_outputs, commitment_number, their_per_commitment_point,
				to_broadcaster_value_sat, to_countersignatory_value_sat, ..
			} => {
				let breacher = &channel_parameters.counterparty_pubkeys;
				let victim = &channel_parameters.holder_pubkeys;
				Some(JusticeKit {
					channel_id,
					sweep_script,
					reward_script,
					policy,
					commitment_number: *commitment_number,
					per_commitment_point: *their_per_commitment_point,
					obscure_factor: get_commitment_transaction_number_obscure_factor(
						&breacher.payment_point, &victim.payment_point,
						!channel_parameters.is_outbound_from_holder,
					),
					breacher_delayed_payment_basepoint: breacher.delayed_payment_basepoint,
					breacher_htlc_basepoint: breacher.htlc_basepoint,
					victim_revocation_basepoint: victim.revocation_basepoint,
					victim_htlc_basepoint: victim.htlc_basepoint,
					victim_payment_point: victim.payment_point,
					to_self_delay: channel_parameters.holder_selected_contest_delay,
					anchors: channel_parameters.anchors,
					htlcs: htlc_outputs.clone(),
					to_local_value_sat: *to_broadcaster_value_sat,
					to_remote_value_sat: *to_countersignatory_value_sat,
				})
			},
			_ => None,
		}
	}
}

/// An output which could not be given a valid witness and was left out of the sweep.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FailedOutput {
	/// The output on the breached commitment.
	pub outpoint: OutPoint,
	/// What kind of output it is.
	pub kind: BreachedOutputKind,
	/// Why its witness failed.
	pub error: SignError,
}

/// A signed, verified justice transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JusticeTransaction {
	/// The transaction, as broadcast.
	pub tx: Transaction,
	/// The fee it pays.
	pub fee_sat: u64,
	/// The value paid to the reward script.
	pub reward_sat: u64,
	/// The value paid to the sweep script.
	pub sweep_sat: u64,
	/// Outputs left out because their witness failed. Always empty unless
	/// [`JusticeConfig::allow_partial_sweep`] is set.
	pub failed_outputs: Vec<FailedOutput>,
}

/// An error building a justice transaction.
#[derive(Clone, PartialEq, Eq)]
pub enum JusticeError {
	/// An output the kit expects on the breached commitment isn't there.
	OutputNotFound {
		/// The missing output.
		output: BreachedOutputKind,
	},
	/// The secret for the breached commitment hasn't been revealed to us.
	MissingRevocationSecret {
		/// The commitment number the secret was looked up for.
		commitment_number: u64,
	},
	/// The secret we hold does not match the commitment's per-commitment point.
	InvalidRevocationSecret,
	/// The broadcast transaction is not the commitment the kit describes.
	CommitmentMismatch {
		/// The commitment number the kit describes.
		expected: u64,
		/// The commitment number decoded from the transaction, if any.
		found: Option<u64>,
	},
	/// The swept value can't cover the fee and reward.
	InsufficientFunds {
		/// The total value of all swept outputs.
		total_in_sat: u64,
		/// The fee the transaction would pay.
		fee_sat: u64,
		/// The reward the transaction would pay.
		reward_sat: u64,
	},
	/// A witness failed to sign or verify and partial sweeps are disallowed.
	InvalidWitness {
		/// The output whose witness failed.
		outpoint: OutPoint,
		/// Why it failed.
		error: SignError,
	},
	/// Every output failed, so there is nothing left to sweep.
	NoSweepableOutputs,
	/// Deriving the commitment's keys failed.
	KeyDerivation(KeyDerivationError),
}

impl From<KeyDerivationError> for JusticeError {
	fn from(e: KeyDerivationError) -> Self {
		JusticeError::KeyDerivation(e)
	}
}

impl fmt::Debug for JusticeError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			JusticeError::OutputNotFound { output } => write!(f, "Expected {:?} output not found on breached commitment", output),
			JusticeError::MissingRevocationSecret { commitment_number } => write!(f, "No revocation secret known for commitment {}", commitment_number),
			JusticeError::InvalidRevocationSecret => f.write_str("Revocation secret doesn't match the commitment's per-commitment point"),
			JusticeError::CommitmentMismatch { expected, found } => write!(f, "Expected commitment {} but transaction encodes {:?}", expected, found),
			JusticeError::InsufficientFunds { total_in_sat, fee_sat, reward_sat } => {
				write!(f, "Swept value {} sat can't cover fee {} sat and reward {} sat", total_in_sat, fee_sat, reward_sat)
			},
			JusticeError::InvalidWitness { outpoint, error } => write!(f, "Witness for {} failed: {}", outpoint, error),
			JusticeError::NoSweepableOutputs => f.write_str("No outputs left to sweep"),
			JusticeError::KeyDerivation(e) => write!(f, "Unable to derive commitment keys: {}", e),
		}
	}
}

impl fmt::Display for JusticeError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		fmt::Debug::fmt(self, f)
	}
}

struct BreachedOutput {
	outpoint: OutPoint,
	prev_out: TxOut,
	witness_script: ScriptBuf,
	kind: BreachedOutputKind,
	key_family: KeyFamily,
	tweak: SigningTweak,
	path: SpendPath,
	sequence: Sequence,
	witness_weight: u64,
}

impl BreachedOutput {
	fn descriptor(&self, input_index: usize) -> SignDescriptor {
		SignDescriptor {
			key_family: self.key_family,
			tweak: self.tweak.clone(),
			witness_script: self.witness_script.clone(),
			output: self.prev_out.clone(),
			input_index,
			sighash_type: EcdsaSighashType::All,
		}
	}
}

/// Locates every output of a breached commitment the kit describes.
fn locate_outputs<C: secp256k1::Verification>(
	breach: &BreachedCommitment, kit: &JusticeKit, per_commitment_secret: &SecretKey,
	secp_ctx: &Secp256k1<C>,
) -> Result<Vec<BreachedOutput>, JusticeError> {
	let keys = TxCreationKeys::derive_new(
		secp_ctx, &kit.per_commitment_point, &kit.breacher_delayed_payment_basepoint,
		&kit.breacher_htlc_basepoint, &kit.victim_revocation_basepoint, &kit.victim_htlc_basepoint,
	)?;
	let txid = breach.tx.compute_txid();
	let find_by_script = |script_pubkey: &Script| {
		breach.tx.output.iter().position(|txout| txout.script_pubkey == *script_pubkey)
	};

	let mut outputs = Vec::with_capacity(2 + kit.htlcs.len());
	if kit.to_local_value_sat > 0 {
		let witness_script = get_revokeable_redeemscript(&keys.revocation_key, kit.to_self_delay, &keys.broadcaster_delayed_payment_key);
		let vout = find_by_script(&witness_script.to_p2wsh())
			.ok_or(JusticeError::OutputNotFound { output: BreachedOutputKind::RevokedToLocal })?;
		outputs.push(BreachedOutput {
			outpoint: OutPoint { txid, vout: vout as u32 },
			prev_out: breach.tx.output[vout].clone(),
			witness_script,
			kind: BreachedOutputKind::RevokedToLocal,
			key_family: KeyFamily::Revocation,
			tweak: SigningTweak::Double(*per_commitment_secret),
			path: SpendPath::Revoke,
			sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
			witness_weight: WEIGHT_REVOKED_OUTPUT,
		});
	}
	if kit.to_remote_value_sat > 0 {
		let script_pubkey = get_counterparty_payment_script(&kit.victim_payment_point, kit.anchors);
		let vout = find_by_script(&script_pubkey)
			.ok_or(JusticeError::OutputNotFound { output: BreachedOutputKind::ToRemote })?;
		let witness_script = if kit.anchors {
			get_to_countersignatory_with_anchors_redeemscript(&kit.victim_payment_point)
		} else {
			ScriptBuf::new()
		};
		outputs.push(BreachedOutput {
			outpoint: OutPoint { txid, vout: vout as u32 },
			prev_out: breach.tx.output[vout].clone(),
			witness_script,
			kind: BreachedOutputKind::ToRemote,
			key_family: KeyFamily::Payment,
			tweak: SigningTweak::None,
			path: SpendPath::ToRemote { anchors: kit.anchors },
			sequence: if kit.anchors { Sequence(1) } else { Sequence::ENABLE_RBF_NO_LOCKTIME },
			witness_weight: weight_to_remote(kit.anchors),
		});
	}
	for htlc in kit.htlcs.iter() {
		let output_index = match htlc.transaction_output_index {
			Some(idx) => idx,
			None => continue,
		};
		let kind = if htlc.offered {
			BreachedOutputKind::RevokedOfferedHtlc { output_index }
		} else {
			BreachedOutputKind::RevokedReceivedHtlc { output_index }
		};
		let witness_script = get_htlc_redeemscript(htlc, kit.anchors, &keys);
		let prev_out = breach.tx.output.get(output_index as usize)
			.filter(|txout| txout.script_pubkey == witness_script.to_p2wsh())
			.ok_or(JusticeError::OutputNotFound { output: kind })?;
		outputs.push(BreachedOutput {
			outpoint: OutPoint { txid, vout: output_index },
			prev_out: prev_out.clone(),
			witness_script,
			kind,
			key_family: KeyFamily::Revocation,
			tweak: SigningTweak::Double(*per_commitment_secret),
			path: SpendPath::Revoke,
			sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
			witness_weight: if htlc.offered {
				weight_revoked_offered_htlc(kit.anchors)
			} else {
				weight_revoked_received_htlc(kit.anchors)
			},
		});
	}
	Ok(outputs)
}

/// Builds, signs and broadcasts justice transactions.
pub struct JusticeAssembler<B: Deref, L: Deref>
where
	B::Target: BroadcasterInterface,
	L::Target: Logger,
{
	broadcaster: B,
	logger: L,
	config: JusticeConfig,
	secp_ctx: Secp256k1<secp256k1::All>,
}

impl<B: Deref, L: Deref> JusticeAssembler<B, L>
where
	B::Target: BroadcasterInterface,
	L::Target: Logger,
{
	/// Creates a new assembler.
	pub fn new(broadcaster: B, logger: L, config: JusticeConfig) -> Self {
		JusticeAssembler { broadcaster, logger, config, secp_ctx: Secp256k1::new() }
	}

	/// Sweeps every output of `breach` described by `kit` to the kit's sweep (and reward)
	/// scripts, and broadcasts the result.
	///
	/// Every witness is checked with `verifier` first. An output whose witness fails is dropped
	/// and the remaining ones are swept if [`JusticeConfig::allow_partial_sweep`] is set;
	/// otherwise the whole sweep fails with [`JusticeError::InvalidWitness`].
	pub fn respond_to_breach<R: RevocationSecretSource + ?Sized, S: ChannelSigner + ?Sized, V: ScriptVerifier + ?Sized>(
		&self, breach: &BreachedCommitment, kit: &JusticeKit, secrets: &R, signer: &S, verifier: &V,
	) -> Result<JusticeTransaction, JusticeError> {
		let logger = WithContext::from(&self.logger, None, Some(kit.channel_id), None);

		let found = commitment_number_from_tx(&breach.tx, kit.obscure_factor);
		if found != Some(kit.commitment_number) {
			return Err(JusticeError::CommitmentMismatch { expected: kit.commitment_number, found });
		}
		let secret = secrets.get_secret(kit.commitment_number)
			.ok_or(JusticeError::MissingRevocationSecret { commitment_number: kit.commitment_number })?;
		let per_commitment_secret = SecretKey::from_slice(&secret).map_err(|_| JusticeError::InvalidRevocationSecret)?;
		if PublicKey::from_secret_key(&self.secp_ctx, &per_commitment_secret) != kit.per_commitment_point {
			return Err(JusticeError::InvalidRevocationSecret);
		}

		let mut outputs = locate_outputs(breach, kit, &per_commitment_secret, &self.secp_ctx)?;
		log_info!(logger, "Found {} outputs to sweep on revoked commitment {} confirmed at height {}",
			outputs.len(), breach.tx.compute_txid(), breach.confirmation_height);

		let mut failed_outputs = Vec::new();
		loop {
			if outputs.is_empty() {
				return Err(JusticeError::NoSweepableOutputs);
			}
			let total_in_sat: u64 = outputs.iter().map(|output| output.prev_out.value.to_sat()).sum();
			let reward_sat = match kit.reward_script {
				Some(_) => kit.policy.reward_sat(total_in_sat),
				None => 0,
			};
			let reward_script = kit.reward_script.as_ref().filter(|_| reward_sat > 0);
			let weight = justice_tx_weight(
				outputs.iter().map(|output| output.witness_weight),
				core::iter::once(kit.sweep_script.as_script()).chain(reward_script.map(|script| script.as_script())),
			);
			let fee_sat = kit.policy.fee_sat(weight);
			let sweep_sat = total_in_sat.checked_sub(fee_sat)
				.and_then(|value| value.checked_sub(reward_sat))
				.filter(|value| *value >= SWEEP_DUST_LIMIT_SATOSHIS)
				.ok_or(JusticeError::InsufficientFunds { total_in_sat, fee_sat, reward_sat })?;

			let mut txins: Vec<(TxIn, usize)> = outputs.iter().enumerate().map(|(idx, output)| (TxIn {
				previous_output: output.outpoint,
				script_sig: ScriptBuf::new(),
				sequence: output.sequence,
				witness: Witness::new(),
			}, idx)).collect();
			sort_inputs(&mut txins);
			let mut txouts: Vec<(TxOut, ())> = vec![(TxOut { value: Amount::from_sat(sweep_sat), script_pubkey: kit.sweep_script.clone() }, ())];
			if let Some(script) = reward_script {
				txouts.push((TxOut { value: Amount::from_sat(reward_sat), script_pubkey: script.clone() }, ()));
			}
			sort_outputs(&mut txouts, |_, _| cmp::Ordering::Equal);

			// Inputs were just reordered, so every descriptor is bound to the position its
			// output landed at.
			let input_order: Vec<usize> = txins.iter().map(|(_, idx)| *idx).collect();
			let mut tx = Transaction {
				version: Version::TWO,
				lock_time: LockTime::ZERO,
				input: txins.into_iter().map(|(txin, _)| txin).collect(),
				output: txouts.into_iter().map(|(txout, _)| txout).collect(),
			};

			let mut witness_failures: Vec<(usize, SignError)> = Vec::new();
			for (input_index, output_idx) in input_order.iter().enumerate() {
				let output = &outputs[*output_idx];
				match compute_input_script(signer, &tx, &output.descriptor(input_index), &output.path, &self.secp_ctx) {
					Ok(witness) => tx.input[input_index].witness = witness,
					Err(e) => witness_failures.push((*output_idx, e)),
				}
			}
			for (input_index, output_idx) in input_order.iter().enumerate() {
				if tx.input[input_index].witness.is_empty() {
					continue;
				}
				if let Err(e) = verify_input(verifier, &tx, input_index, &outputs[*output_idx].prev_out) {
					witness_failures.push((*output_idx, e));
				}
			}

			if witness_failures.is_empty() {
				log_info!(logger, "Broadcasting {} sweeping {} sat with {} sat fee and {} sat reward",
					log_tx!(tx), sweep_sat, fee_sat, reward_sat);
				self.broadcaster.broadcast_transactions(&[&tx]);
				return Ok(JusticeTransaction { tx, fee_sat, reward_sat, sweep_sat, failed_outputs });
			}

			if !self.config.allow_partial_sweep {
				witness_failures.sort_unstable_by_key(|(idx, _)| outputs[*idx].outpoint);
				let (idx, error) = witness_failures.swap_remove(0);
				log_error!(logger, "Witness for revoked output {} failed ({}), refusing to sweep a partial breach",
					outputs[idx].outpoint, error);
				return Err(JusticeError::InvalidWitness { outpoint: outputs[idx].outpoint, error });
			}

			witness_failures.sort_unstable_by(|a, b| b.0.cmp(&a.0));
			for (idx, error) in witness_failures {
				let output = outputs.remove(idx);
				log_error!(logger, "Dropping {:?} output {} from justice transaction: {}", output.kind, output.outpoint, error);
				failed_outputs.push(FailedOutput { outpoint: output.outpoint, kind: output.kind, error });
			}
		}
	}
}
