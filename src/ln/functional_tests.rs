// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Tests that stand up a pair of channels, drive the full message exchange between them, and
//! check the resulting commitments, persisted updates and broadcasts.

use crate::chain::channelmonitor::ChannelMonitorUpdateStep;
use crate::chain::justice::{JusticeAssembler, JusticeError, JusticeKit, SweepPolicy};
use crate::chain::{BreachedCommitment, ChannelMonitorUpdateStatus};
use crate::ln::channel::{ChannelError, ChannelState, INITIAL_COMMITMENT_NUMBER};
use crate::ln::channel_handle::HandleError;
use crate::ln::functional_test_utils::*;
use crate::sync::Arc;
use crate::util::config::JusticeConfig;
use crate::util::errors::APIError;
use crate::util::test_utils::{self, ConsensusScriptVerifier, TestBroadcaster, TestLogger};

use bitcoin::transaction::Transaction;

use crate::prelude::*;

const CHANNEL_MODULE: &str = "lightning_channel::ln::channel";
const HANDLE_MODULE: &str = "lightning_channel::ln::channel_handle";

fn spends_funding(tx: &Transaction) -> bool {
	tx.input.len() == 1 && tx.input[0].previous_output == funding_outpoint()
}

#[test]
fn test_channel_open_and_ready() {
	let (alice, bob) = create_chan_between_nodes(&test_default_channel_config());
	assert_eq!(alice.handle.state().unwrap(), ChannelState::Active);
	assert_eq!(bob.handle.state().unwrap(), ChannelState::Active);
	assert_eq!(alice.handle.with_channel(|chan| chan.get_value_to_self_msat()).unwrap(), 80_000_000);
	assert_eq!(bob.handle.with_channel(|chan| chan.get_value_to_self_msat()).unwrap(), 20_000_000);
	check_commitment_balances(&alice);
	check_commitment_balances(&bob);

	// Both sides watch the funding output so a revoked broadcast is always noticed.
	for node in [&alice, &bob] {
		let watched = node.chain_source.watched_outputs.lock().unwrap();
		assert_eq!(watched.len(), 1);
		assert!(watched.iter().any(|(outpoint, script)| *outpoint == funding_outpoint() && script.is_p2wsh()));
	}

	let updates = alice.persisted_updates();
	assert_eq!(updates.len(), 1);
	assert_eq!(updates[0].update_id, 1);
	assert!(matches!(updates[0].updates[0], ChannelMonitorUpdateStep::ChannelFunded { .. }));
	assert!(matches!(updates[0].updates[1], ChannelMonitorUpdateStep::LatestHolderCommitmentTxInfo { .. }));
	assert!(matches!(updates[0].updates[2], ChannelMonitorUpdateStep::LatestCounterpartyCommitmentTxInfo { commitment_number: INITIAL_COMMITMENT_NUMBER, .. }));

	alice.logger.assert_log_contains(CHANNEL_MODULE, "Received funding_signed from peer", 1);
	bob.logger.assert_log_contains(CHANNEL_MODULE, "Generated funding_signed for peer", 1);
	alice.logger.assert_log_contains(CHANNEL_MODULE, "Received channel_ready from peer", 1);
	bob.logger.assert_log_contains(CHANNEL_MODULE, "Received channel_ready from peer", 1);
}

#[test]
fn test_htlc_locked_in_only_after_both_revocations() {
	let (alice, bob) = create_chan_between_nodes(&test_default_channel_config());
	let (payment_preimage, payment_hash) = get_payment_preimage_hash(1);

	let update_add = alice.handle.send_htlc(10_000_000, payment_hash, TEST_CLTV_EXPIRY).unwrap().unwrap();
	assert_eq!(update_add.htlc_id, 0);
	bob.handle.update_add_htlc(&update_add).unwrap();
	let commitment_signed = alice.handle.send_commitment().unwrap();
	check_added_monitors(&alice, 1);
	assert!(alice.handle.with_channel(|chan| chan.is_awaiting_remote_revoke()).unwrap());
	alice.logger.assert_log_regex(
		CHANNEL_MODULE, regex::Regex::new(r"^Signed counterparty commitment 1 \([0-9a-f]{64}\) with 1 HTLC signatures$").unwrap(), 1);

	let (bob_raa, bob_cs) = bob.handle.commitment_signed(&commitment_signed).unwrap();
	let bob_cs = bob_cs.unwrap();
	check_added_monitors(&bob, 3);
	// Bob holds a commitment with the HTLC, but Alice can still broadcast one without it.
	let err = bob.handle.fulfill_htlc(0, payment_preimage).unwrap_err();
	assert!(matches!(err, HandleError::Channel(ChannelError::Ignore(APIError::APIMisuseError { .. }))));

	let (alice_result, alice_update) = alice.handle.revoke_and_ack(&bob_raa).unwrap();
	assert!(alice_update.is_none());
	assert!(alice_result.accepted_htlcs.is_empty());
	let (alice_raa, alice_cs) = alice.handle.commitment_signed(&bob_cs).unwrap();
	assert!(alice_cs.is_none());
	check_added_monitors(&alice, 3);

	// Alice revoked the commitment without the HTLC but Bob still has to see that revocation.
	let err = bob.handle.fulfill_htlc(0, payment_preimage).unwrap_err();
	assert!(matches!(err, HandleError::Channel(ChannelError::Ignore(APIError::APIMisuseError { .. }))));

	let (bob_result, bob_update) = bob.handle.revoke_and_ack(&alice_raa).unwrap();
	assert!(bob_update.is_none());
	assert_eq!(bob_result.accepted_htlcs.len(), 1);
	assert_eq!(bob_result.accepted_htlcs[0].htlc_id, 0);
	assert_eq!(bob_result.accepted_htlcs[0].cltv_expiry, TEST_CLTV_EXPIRY);
	assert!(!bob_result.require_commitment);

	for node in [&alice, &bob] {
		node.handle.with_channel(|chan| {
			assert_eq!(chan.get_cur_holder_commitment_transaction_number(), INITIAL_COMMITMENT_NUMBER - 1);
			assert_eq!(chan.get_cur_counterparty_commitment_transaction_number(), INITIAL_COMMITMENT_NUMBER - 1);
			assert_eq!(chan.holder_commitment().unwrap().height, 1);
			assert_eq!(chan.pending_htlc_count(), 1);
			assert!(!chan.is_awaiting_remote_revoke());
			assert!(!chan.owes_revocation());
		}).unwrap();
		check_commitment_balances(node);
	}
	assert!(bob.handle.fulfill_htlc(0, payment_preimage).unwrap().is_some());
}

#[test]
fn test_claim_moves_balance() {
	let (alice, bob) = create_chan_between_nodes(&test_default_channel_config());
	let (htlc, payment_preimage) = route_payment(&alice, &bob, 10_000_000, 1);
	assert_eq!(alice.handle.get_available_balances().unwrap().balance_msat, 70_000_000);

	claim_payment(&alice, &bob, htlc.htlc_id, payment_preimage);
	assert_eq!(alice.handle.with_channel(|chan| chan.get_value_to_self_msat()).unwrap(), 70_000_000);
	assert_eq!(bob.handle.with_channel(|chan| chan.get_value_to_self_msat()).unwrap(), 30_000_000);
	for node in [&alice, &bob] {
		assert_eq!(node.handle.with_channel(|chan| chan.pending_htlc_count()).unwrap(), 0);
		check_commitment_balances(node);
	}
	// add, claim: two full exchanges, two commitments each.
	assert_eq!(alice.handle.with_channel(|chan| chan.holder_commitment().unwrap().height).unwrap(), 2);
}

#[test]
fn test_fail_restores_balance() {
	let (alice, bob) = create_chan_between_nodes(&test_default_channel_config());
	let (htlc, _) = route_payment(&alice, &bob, 10_000_000, 1);
	fail_payment(&alice, &bob, htlc.htlc_id, vec![0x40, 0x0f]);

	assert_eq!(alice.handle.with_channel(|chan| chan.get_value_to_self_msat()).unwrap(), 80_000_000);
	assert_eq!(bob.handle.with_channel(|chan| chan.get_value_to_self_msat()).unwrap(), 20_000_000);
	for node in [&alice, &bob] {
		assert_eq!(node.handle.with_channel(|chan| chan.pending_htlc_count()).unwrap(), 0);
		check_commitment_balances(node);
	}
}

#[test]
fn test_payments_in_both_directions() {
	let (alice, bob) = create_chan_between_nodes(&test_default_channel_config());
	let (to_bob, to_bob_preimage) = route_payment(&alice, &bob, 15_000_000, 1);
	let (to_alice, to_alice_preimage) = route_payment(&bob, &alice, 5_000_000, 2);
	check_commitment_balances(&alice);
	check_commitment_balances(&bob);

	claim_payment(&alice, &bob, to_bob.htlc_id, to_bob_preimage);
	claim_payment(&bob, &alice, to_alice.htlc_id, to_alice_preimage);
	assert_eq!(alice.handle.with_channel(|chan| chan.get_value_to_self_msat()).unwrap(), 70_000_000);
	assert_eq!(bob.handle.with_channel(|chan| chan.get_value_to_self_msat()).unwrap(), 30_000_000);
	check_commitment_balances(&alice);
	check_commitment_balances(&bob);
}

#[test]
fn test_holding_cell_released_on_revoke_and_ack() {
	let (alice, bob) = create_chan_between_nodes(&test_default_channel_config());
	let (_, first_hash) = get_payment_preimage_hash(1);
	let (_, second_hash) = get_payment_preimage_hash(2);

	let first_add = alice.handle.send_htlc(10_000_000, first_hash, TEST_CLTV_EXPIRY).unwrap().unwrap();
	bob.handle.update_add_htlc(&first_add).unwrap();
	let first_cs = alice.handle.send_commitment().unwrap();

	// Alice can't offer anything new until Bob revokes, so the second HTLC waits.
	assert!(alice.handle.send_htlc(7_000_000, second_hash, TEST_CLTV_EXPIRY).unwrap().is_none());
	assert_eq!(alice.handle.with_channel(|chan| chan.holding_cell_len()).unwrap(), 1);
	assert_eq!(alice.handle.get_available_balances().unwrap().balance_msat, 63_000_000);
	let err = alice.handle.send_commitment().unwrap_err();
	assert!(matches!(err, HandleError::Channel(ChannelError::Ignore(APIError::ChannelUnavailable { .. }))));

	let (bob_raa, bob_cs) = bob.handle.commitment_signed(&first_cs).unwrap();
	let (alice_result, commitment_update) = alice.handle.revoke_and_ack(&bob_raa).unwrap();
	assert!(alice_result.holding_cell_failed_htlcs.is_empty());
	let commitment_update = commitment_update.unwrap();
	assert_eq!(commitment_update.update_add_htlcs.len(), 1);
	assert_eq!(commitment_update.update_add_htlcs[0].htlc_id, 1);
	assert_eq!(commitment_update.update_add_htlcs[0].payment_hash, second_hash);
	assert_eq!(alice.handle.with_channel(|chan| chan.holding_cell_len()).unwrap(), 0);

	let (alice_raa, alice_cs) = alice.handle.commitment_signed(&bob_cs.unwrap()).unwrap();
	assert!(alice_cs.is_none());

	bob.handle.update_add_htlc(&commitment_update.update_add_htlcs[0]).unwrap();
	let (bob_raa, bob_cs) = bob.handle.commitment_signed(&commitment_update.commitment_signed).unwrap();
	// Bob is still waiting on Alice's revocation of the first exchange.
	assert!(bob_cs.is_none());
	let (bob_result, bob_update) = bob.handle.revoke_and_ack(&alice_raa).unwrap();
	assert_eq!(bob_result.accepted_htlcs.len(), 1);
	assert_eq!(bob_result.accepted_htlcs[0].payment_hash, first_hash);
	assert!(bob_result.require_commitment);
	let bob_update = bob_update.unwrap();
	assert!(bob_update.update_add_htlcs.is_empty());

	let (alice_result, alice_update) = alice.handle.revoke_and_ack(&bob_raa).unwrap();
	assert!(alice_update.is_none());
	assert!(alice_result.accepted_htlcs.is_empty());
	let (alice_raa, alice_cs) = alice.handle.commitment_signed(&bob_update.commitment_signed).unwrap();
	assert!(alice_cs.is_none());
	let (bob_result, _) = bob.handle.revoke_and_ack(&alice_raa).unwrap();
	assert_eq!(bob_result.accepted_htlcs.len(), 1);
	assert_eq!(bob_result.accepted_htlcs[0].payment_hash, second_hash);

	for node in [&alice, &bob] {
		assert_eq!(node.handle.with_channel(|chan| chan.pending_htlc_count()).unwrap(), 2);
		check_commitment_balances(node);
	}
	alice.logger.assert_log_contains(CHANNEL_MODULE, "Putting HTLC in holding cell", 1);
}

#[test]
fn test_invalid_htlc_signature_rejects_whole_commitment() {
	let (alice, bob) = create_chan_between_nodes(&test_default_channel_config());
	let (_, payment_hash) = get_payment_preimage_hash(1);
	let update_add = alice.handle.send_htlc(10_000_000, payment_hash, TEST_CLTV_EXPIRY).unwrap().unwrap();
	bob.handle.update_add_htlc(&update_add).unwrap();
	let mut commitment_signed = alice.handle.send_commitment().unwrap();
	assert_eq!(commitment_signed.htlc_signatures.len(), 1);
	// A valid signature, just not over the HTLC transaction.
	commitment_signed.htlc_signatures[0] = commitment_signed.signature;

	let initial_txid = bob.handle.with_channel(|chan| chan.holder_commitment().unwrap().tx.trust().txid()).unwrap();
	let err = bob.handle.commitment_signed(&commitment_signed).unwrap_err();
	assert_eq!(err, HandleError::Channel(ChannelError::InvalidHTLCSig { htlc_index: 0 }));

	// Nothing of the rejected commitment was kept, and the initial one was broadcast.
	bob.handle.with_channel(|chan| {
		assert_eq!(chan.state(), ChannelState::Closing);
		assert_eq!(chan.get_cur_holder_commitment_transaction_number(), INITIAL_COMMITMENT_NUMBER);
		assert_eq!(chan.holder_commitment().unwrap().height, 0);
		assert!(!chan.owes_revocation());
	}).unwrap();
	let broadcast = bob.tx_broadcaster.txn_broadcast();
	assert_eq!(broadcast.len(), 1);
	assert!(spends_funding(&broadcast[0]));
	assert_eq!(broadcast[0].compute_txid(), initial_txid);
	check_added_monitors(&bob, 1);
	assert!(matches!(bob.persisted_updates().last().unwrap().updates[..], [ChannelMonitorUpdateStep::ChannelForceClosed { should_broadcast: true }]));
	bob.logger.assert_log_contains(HANDLE_MODULE, "Force-closing channel", 1);
}

#[test]
fn test_invalid_commitment_signature() {
	let (alice, bob) = create_chan_between_nodes(&test_default_channel_config());
	let (_, payment_hash) = get_payment_preimage_hash(1);
	let update_add = alice.handle.send_htlc(10_000_000, payment_hash, TEST_CLTV_EXPIRY).unwrap().unwrap();
	bob.handle.update_add_htlc(&update_add).unwrap();
	let mut commitment_signed = alice.handle.send_commitment().unwrap();
	commitment_signed.signature = commitment_signed.htlc_signatures[0];

	let err = bob.handle.commitment_signed(&commitment_signed).unwrap_err();
	assert_eq!(err, HandleError::Channel(ChannelError::InvalidCommitSig));
	assert_eq!(bob.handle.state().unwrap(), ChannelState::Closing);
	assert_eq!(bob.tx_broadcaster.txn_broadcast().len(), 1);
}

#[test]
fn test_persist_failure_withholds_revocation() {
	let (alice, bob) = create_chan_between_nodes(&test_default_channel_config());
	let (_, payment_hash) = get_payment_preimage_hash(1);
	let update_add = alice.handle.send_htlc(10_000_000, payment_hash, TEST_CLTV_EXPIRY).unwrap().unwrap();
	bob.handle.update_add_htlc(&update_add).unwrap();
	let commitment_signed = alice.handle.send_commitment().unwrap();

	bob.persister.set_update_ret(ChannelMonitorUpdateStatus::UnrecoverableError);
	let err = bob.handle.commitment_signed(&commitment_signed).unwrap_err();
	assert_eq!(err, HandleError::PersistFailed { update_id: 2 });

	// No revoke_and_ack was handed out and the channel closed on its own.
	assert_eq!(bob.handle.state().unwrap(), ChannelState::Closing);
	assert_eq!(bob.persisted_updates().len(), 1);
	let broadcast = bob.tx_broadcaster.txn_broadcast();
	assert_eq!(broadcast.len(), 1);
	assert!(spends_funding(&broadcast[0]));
	assert_eq!(bob.signer_state.lock().unwrap().last_holder_revoked_commitment, crate::util::test_channel_signer::INITIAL_REVOKED_COMMITMENT_NUMBER);
	bob.logger.assert_log_contains(HANDLE_MODULE, "Failed to persist update 2", 1);
}

#[test]
fn test_force_close_broadcasts_latest_commitment() {
	let (alice, bob) = create_chan_between_nodes(&test_default_channel_config());
	route_payment(&alice, &bob, 10_000_000, 1);

	let (_, queued_hash) = get_payment_preimage_hash(2);
	let update_add = alice.handle.send_htlc(5_000_000, get_payment_preimage_hash(3).1, TEST_CLTV_EXPIRY).unwrap().unwrap();
	bob.handle.update_add_htlc(&update_add).unwrap();
	alice.handle.send_commitment().unwrap();
	check_added_monitors(&alice, 1);
	assert!(alice.handle.send_htlc(5_000_000, queued_hash, TEST_CLTV_EXPIRY).unwrap().is_none());

	let latest_txid = alice.handle.with_channel(|chan| chan.holder_commitment().unwrap().tx.trust().txid()).unwrap();
	let dropped = alice.handle.force_close().unwrap();
	assert_eq!(dropped, vec![queued_hash]);
	check_added_monitors(&alice, 1);
	assert!(matches!(alice.persisted_updates().last().unwrap().updates[..], [ChannelMonitorUpdateStep::ChannelForceClosed { should_broadcast: true }]));

	let broadcast = alice.tx_broadcaster.txn_broadcast();
	assert_eq!(broadcast.len(), 1);
	assert!(spends_funding(&broadcast[0]));
	assert_eq!(broadcast[0].compute_txid(), latest_txid);
	// The one HTLC committed on both sides has an output, the one Bob never signed for doesn't.
	assert_eq!(broadcast[0].output.len(), 3);

	let err = alice.handle.send_htlc(5_000_000, get_payment_preimage_hash(4).1, TEST_CLTV_EXPIRY).unwrap_err();
	assert!(matches!(err, HandleError::Channel(ChannelError::Ignore(APIError::ChannelUnavailable { .. }))));
	let err = alice.handle.force_close().unwrap_err();
	assert!(matches!(err, HandleError::Channel(ChannelError::Ignore(APIError::ChannelUnavailable { .. }))));
	assert!(alice.tx_broadcaster.txn_broadcast().is_empty());

	alice.handle.closing_tx_confirmed().unwrap();
	assert_eq!(alice.handle.state().unwrap(), ChannelState::Closed);
}

#[test]
fn test_force_close_broadcasts_despite_persist_failure() {
	let (alice, _bob) = create_chan_between_nodes(&test_default_channel_config());
	assert_eq!(alice.persisted_updates().len(), 1);

	alice.persister.set_update_ret(ChannelMonitorUpdateStatus::UnrecoverableError);
	let err = alice.handle.force_close().unwrap_err();
	assert_eq!(err, HandleError::PersistFailed { update_id: 2 });
	assert_eq!(alice.handle.state().unwrap(), ChannelState::Closing);
	check_added_monitors(&alice, 0);

	let broadcast = alice.tx_broadcaster.txn_broadcast();
	assert_eq!(broadcast.len(), 1);
	assert!(spends_funding(&broadcast[0]));
	alice.logger.assert_log_contains(HANDLE_MODULE, "Failed to persist update 2", 1);
}

#[test]
fn test_fatal_error_logs_unpersisted_closure() {
	let (alice, bob) = create_chan_between_nodes(&test_default_channel_config());
	let (_, payment_hash) = get_payment_preimage_hash(1);
	let mut update_add = alice.handle.send_htlc(5_000_000, payment_hash, TEST_CLTV_EXPIRY).unwrap().unwrap();
	update_add.htlc_id = 1;

	bob.persister.set_update_ret(ChannelMonitorUpdateStatus::UnrecoverableError);
	let err = bob.handle.update_add_htlc(&update_add).unwrap_err();
	assert!(matches!(err, HandleError::Channel(ChannelError::Close(_))));
	assert_eq!(bob.handle.state().unwrap(), ChannelState::Closing);

	let broadcast = bob.tx_broadcaster.txn_broadcast();
	assert_eq!(broadcast.len(), 1);
	assert!(spends_funding(&broadcast[0]));
	assert_eq!(bob.persisted_updates().len(), 1);
	bob.logger.assert_log_contains(HANDLE_MODULE, "Failed to persist force-close update 2", 1);
}

#[test]
fn test_revoked_commitment_broadcast_is_swept() {
	let (alice, bob) = create_chan_between_nodes(&test_default_channel_config());
	// Bob signs his initial commitment while it is still current.
	let revoked_tx = bob.handle.with_channel(|chan| chan.get_signed_holder_commitment_tx()).unwrap().unwrap();

	let counterparty_step = alice.persisted_updates().iter()
		.flat_map(|update| update.updates.iter())
		.find(|step| matches!(step, ChannelMonitorUpdateStep::LatestCounterpartyCommitmentTxInfo { commitment_number, .. } if *commitment_number == INITIAL_COMMITMENT_NUMBER))
		.cloned()
		.unwrap();
	let channel_parameters = alice.handle.with_channel(|chan| chan.get_channel_parameters().cloned()).unwrap().unwrap();
	let policy = SweepPolicy { feerate_per_kw: 2500, reward_base_sat: 0, reward_rate_ppm: 0 };
	let kit = JusticeKit::from_counterparty_commitment(
		alice.channel_id(), &channel_parameters, &counterparty_step, test_utils::sweep_script(), None, policy,
	).unwrap();
	let breach = BreachedCommitment { tx: revoked_tx.clone(), confirmation_height: 800_000 };

	let broadcaster = TestBroadcaster::new();
	let logger = TestLogger::new();
	let assembler = JusticeAssembler::new(&broadcaster, &logger, JusticeConfig::default());

	// Not revoked yet, so there is nothing to punish.
	let res = alice.handle.with_channel(|chan| {
		assembler.respond_to_breach(&breach, &kit, chan.counterparty_commitment_secrets(), chan.get_signer(), &ConsensusScriptVerifier)
	}).unwrap();
	assert!(matches!(res, Err(JusticeError::MissingRevocationSecret { commitment_number: INITIAL_COMMITMENT_NUMBER })));

	route_payment(&alice, &bob, 10_000_000, 1);

	let justice = alice.handle.with_channel(|chan| {
		assembler.respond_to_breach(&breach, &kit, chan.counterparty_commitment_secrets(), chan.get_signer(), &ConsensusScriptVerifier)
	}).unwrap().unwrap();
	let revoked_txid = revoked_tx.compute_txid();
	assert_eq!(justice.tx.input.len(), 2);
	assert!(justice.tx.input.iter().all(|txin| txin.previous_output.txid == revoked_txid));
	assert!(justice.failed_outputs.is_empty());
	let total_in: u64 = revoked_tx.output.iter().map(|txout| txout.value.to_sat()).sum();
	assert_eq!(justice.sweep_sat + justice.fee_sat, total_in);
	assert_eq!(justice.tx.output.len(), 1);
	assert_eq!(justice.tx.output[0].script_pubkey, test_utils::sweep_script());
	assert_eq!(broadcaster.txn_broadcast(), vec![justice.tx]);
}

#[test]
fn test_unavailable_signer_defers_commitment() {
	let (alice, bob) = create_chan_between_nodes(&test_default_channel_config());
	let (htlc, payment_preimage) = route_payment(&alice, &bob, 10_000_000, 1);
	let update_fulfill = bob.handle.fulfill_htlc(htlc.htlc_id, payment_preimage).unwrap().unwrap();

	bob.set_signer_available(false);
	let err = bob.handle.send_commitment().unwrap_err();
	assert!(matches!(err, HandleError::Channel(ChannelError::Ignore(APIError::ChannelUnavailable { .. }))));
	bob.handle.with_channel(|chan| {
		assert_eq!(chan.state(), ChannelState::Active);
		assert!(chan.needs_commitment());
		assert!(!chan.is_awaiting_remote_revoke());
		assert_eq!(chan.get_cur_counterparty_commitment_transaction_number(), INITIAL_COMMITMENT_NUMBER - 1);
	}).unwrap();
	check_added_monitors(&bob, 0);
	assert!(bob.tx_broadcaster.txn_broadcast().is_empty());

	bob.set_signer_available(true);
	alice.handle.update_fulfill_htlc(&update_fulfill).unwrap();
	let commitment_signed = bob.handle.send_commitment().unwrap();
	check_added_monitors(&bob, 1);
	let (_, alice_result) = commitment_signed_dance(&bob, &alice, &commitment_signed);
	assert_eq!(alice_result.claimed_htlcs, vec![(htlc.htlc_id, payment_preimage)]);
	check_commitment_balances(&alice);
	check_commitment_balances(&bob);
}

#[test]
fn test_concurrent_htlc_sends() {
	let (alice, bob) = create_chan_between_nodes(&test_default_channel_config());
	let alice = Arc::new(alice);

	let threads: Vec<_> = (0..4u8).map(|i| {
		let alice = Arc::clone(&alice);
		std::thread::spawn(move || {
			let (_, payment_hash) = get_payment_preimage_hash(10 + i);
			alice.handle.send_htlc(2_000_000, payment_hash, TEST_CLTV_EXPIRY).unwrap().unwrap()
		})
	}).collect();
	let mut update_adds: Vec<_> = threads.into_iter().map(|thread| thread.join().unwrap()).collect();
	update_adds.sort_unstable_by_key(|update_add| update_add.htlc_id);
	assert_eq!(update_adds.iter().map(|update_add| update_add.htlc_id).collect::<Vec<_>>(), vec![0, 1, 2, 3]);

	for update_add in update_adds.iter() {
		bob.handle.update_add_htlc(update_add).unwrap();
	}
	let commitment_signed = alice.handle.send_commitment().unwrap();
	assert_eq!(commitment_signed.htlc_signatures.len(), 4);
	check_added_monitors(&alice, 1);
	let (_, bob_result) = commitment_signed_dance(&alice, &bob, &commitment_signed);
	assert_eq!(bob_result.accepted_htlcs.len(), 4);
	check_commitment_balances(&alice);
	check_commitment_balances(&bob);
}

#[test]
fn test_dust_htlc_has_no_output() {
	let (alice, bob) = create_chan_between_nodes(&test_default_channel_config());
	let min_nondust_msat = alice.handle.get_available_balances().unwrap().next_outbound_htlc_minimum_msat;
	let (_, payment_hash) = get_payment_preimage_hash(1);
	let err = alice.handle.send_htlc(min_nondust_msat - 1, payment_hash, TEST_CLTV_EXPIRY).unwrap_err();
	assert_eq!(err, HandleError::Channel(ChannelError::Ignore(APIError::DustHTLC { amount_msat: min_nondust_msat - 1, dust_limit_msat: min_nondust_msat })));

	// Trimmed on Bob's commitment, where the received HTLC's second-stage fee is higher, but not
	// on Alice's.
	route_payment(&alice, &bob, min_nondust_msat, 1);
	let alice_outputs = alice.handle.with_channel(|chan| chan.holder_commitment().unwrap().tx.htlcs().len()).unwrap();
	let bob_outputs = bob.handle.with_channel(|chan| chan.holder_commitment().unwrap().tx.htlcs().len()).unwrap();
	assert_eq!(alice_outputs, 1);
	assert_eq!(bob_outputs, 0);
	for node in [&alice, &bob] {
		assert_eq!(node.handle.with_channel(|chan| chan.holder_commitment().unwrap().htlcs.len()).unwrap(), 1);
		check_commitment_balances(node);
	}
}
