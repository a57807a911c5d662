// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! A bunch of useful utilities for building two-party channel tests and driving the message
//! exchange between them.

use crate::chain::channelmonitor::ChannelMonitorUpdate;
use crate::ln::channel::{Channel, CommittedHTLC, RevokeAndACKResult};
use crate::ln::channel_handle::ChannelHandle;
use crate::ln::msgs;
use crate::ln::types::{ChannelId, PaymentHash, PaymentPreimage};
use crate::sync::Arc;
use crate::util::config::UserConfig;
use crate::util::test_channel_signer::{EnforcementState, TestChannelSigner};
use crate::util::test_utils::{self, TestBroadcaster, TestChainSource, TestLogger, TestPersister};

use bitcoin::hashes::Hash;
use bitcoin::transaction::OutPoint;
use bitcoin::Txid;

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::prelude::*;

/// The feerate every test channel is opened at.
pub const TEST_FEERATE_PER_KW: u32 = 1000;

/// A CLTV expiry comfortably below the timestamp threshold.
pub const TEST_CLTV_EXPIRY: u32 = 700_000;

pub type TestChannelHandle =
	ChannelHandle<TestChannelSigner, Arc<TestBroadcaster>, Arc<TestPersister>, Arc<TestChainSource>, Arc<TestLogger>>;

pub struct Node {
	pub handle: TestChannelHandle,
	pub signer_state: Arc<crate::sync::Mutex<EnforcementState>>,
	pub signer_available: Arc<crate::sync::Mutex<bool>>,
	pub tx_broadcaster: Arc<TestBroadcaster>,
	pub persister: Arc<TestPersister>,
	pub chain_source: Arc<TestChainSource>,
	pub logger: Arc<TestLogger>,
	checked_updates: AtomicUsize,
}

impl Node {
	fn new(channel: Channel<TestChannelSigner>, logger: Arc<TestLogger>) -> Node {
		let signer_state = Arc::clone(&channel.get_signer().state);
		let signer_available = Arc::clone(&channel.get_signer().available);
		let tx_broadcaster = Arc::new(TestBroadcaster::new());
		let persister = Arc::new(TestPersister::new());
		let chain_source = Arc::new(TestChainSource::new());
		let handle = ChannelHandle::new(
			channel, Arc::clone(&tx_broadcaster), Arc::clone(&persister), Some(Arc::clone(&chain_source)),
			Arc::clone(&logger),
		);
		Node {
			handle, signer_state, signer_available, tx_broadcaster, persister, chain_source, logger,
			checked_updates: AtomicUsize::new(0),
		}
	}

	pub fn channel_id(&self) -> ChannelId {
		self.handle.channel_id().unwrap()
	}

	/// Every update this node persisted so far.
	pub fn persisted_updates(&self) -> Vec<ChannelMonitorUpdate> {
		self.persister.persisted_updates(&self.channel_id())
	}

	pub fn set_signer_available(&self, available: bool) {
		*self.signer_available.lock().unwrap() = available;
	}
}

/// Checks that `count` updates were persisted since the last check.
pub fn check_added_monitors(node: &Node, count: usize) {
	let total = node.persisted_updates().len();
	let checked = node.checked_updates.swap(total, Ordering::AcqRel);
	assert_eq!(total - checked, count, "Unexpected number of persisted updates");
}

pub fn test_default_channel_config() -> UserConfig {
	UserConfig::default()
}

pub fn get_payment_preimage_hash(byte: u8) -> (PaymentPreimage, PaymentHash) {
	let payment_preimage = PaymentPreimage([byte; 32]);
	(payment_preimage, PaymentHash::from(payment_preimage))
}

pub fn funding_outpoint() -> OutPoint {
	OutPoint { txid: Txid::from_byte_array([42; 32]), vout: 0 }
}

/// Opens a channel of `channel_value_sat` between two fresh nodes, pushing `push_msat` from the
/// funder to its counterparty, and exchanges channel_ready both ways.
pub fn create_chan_between_nodes_with_value(
	config: &UserConfig, channel_value_sat: u64, push_msat: u64,
) -> (Node, Node) {
	let alice_signer = TestChannelSigner::new(test_utils::in_memory_signer(1));
	let bob_signer = TestChannelSigner::new(test_utils::in_memory_signer(2));
	let temporary_channel_id = ChannelId::temporary_from_entropy([3; 32]);

	let alice_chan = Channel::new_outbound(
		config, alice_signer, temporary_channel_id, channel_value_sat, push_msat, TEST_FEERATE_PER_KW,
	).unwrap();
	let alice = Node::new(alice_chan, Arc::new(TestLogger::with_id("alice".to_owned())));
	let open_channel = alice.handle.get_open_channel().unwrap();

	let bob_chan = Channel::new_from_req(config, bob_signer, &open_channel).unwrap();
	let bob = Node::new(bob_chan, Arc::new(TestLogger::with_id("bob".to_owned())));
	let accept_channel = bob.handle.accept_inbound_channel().unwrap();
	alice.handle.accept_channel(&accept_channel).unwrap();

	let funding_created = alice.handle.get_funding_created(funding_outpoint()).unwrap();
	check_added_monitors(&alice, 0);
	let funding_signed = bob.handle.funding_created(&funding_created).unwrap();
	check_added_monitors(&bob, 1);
	alice.handle.funding_signed(&funding_signed).unwrap();
	check_added_monitors(&alice, 1);
	assert_eq!(alice.channel_id(), bob.channel_id());

	let alice_ready = alice.handle.get_channel_ready().unwrap();
	let bob_ready = bob.handle.get_channel_ready().unwrap();
	bob.handle.channel_ready(&alice_ready).unwrap();
	alice.handle.channel_ready(&bob_ready).unwrap();
	(alice, bob)
}

pub fn create_chan_between_nodes(config: &UserConfig) -> (Node, Node) {
	create_chan_between_nodes_with_value(config, 100_000, 20_000_000)
}

/// Delivers `commitment_signed` from `sender` to `receiver` and completes the exchange until
/// neither side owes the other anything. Returns what each side's final revoke_and_ack handling
/// produced, sender first.
pub fn commitment_signed_dance(
	sender: &Node, receiver: &Node, commitment_signed: &msgs::CommitmentSigned,
) -> (RevokeAndACKResult, RevokeAndACKResult) {
	let (receiver_raa, receiver_cs) = receiver.handle.commitment_signed(commitment_signed).unwrap();
	let receiver_cs = receiver_cs.expect("receiver should reply with its own commitment_signed");
	check_added_monitors(receiver, 3);

	let (sender_result, sender_update) = sender.handle.revoke_and_ack(&receiver_raa).unwrap();
	assert!(sender_update.is_none());
	let (sender_raa, sender_cs) = sender.handle.commitment_signed(&receiver_cs).unwrap();
	assert!(sender_cs.is_none());
	check_added_monitors(sender, 3);

	let (receiver_result, receiver_update) = receiver.handle.revoke_and_ack(&sender_raa).unwrap();
	assert!(receiver_update.is_none());
	check_added_monitors(receiver, 1);
	(sender_result, receiver_result)
}

/// Offers an HTLC from `origin` to `dest` and locks it into both commitments. Returns the HTLC
/// as `dest` sees it along with its preimage.
pub fn route_payment(origin: &Node, dest: &Node, amount_msat: u64, preimage_byte: u8) -> (CommittedHTLC, PaymentPreimage) {
	let (payment_preimage, payment_hash) = get_payment_preimage_hash(preimage_byte);
	let update_add = origin.handle.send_htlc(amount_msat, payment_hash, TEST_CLTV_EXPIRY).unwrap()
		.expect("HTLC should be sent immediately");
	dest.handle.update_add_htlc(&update_add).unwrap();
	let commitment_signed = origin.handle.send_commitment().unwrap();
	check_added_monitors(origin, 1);

	let (origin_result, dest_result) = commitment_signed_dance(origin, dest, &commitment_signed);
	assert!(origin_result.accepted_htlcs.is_empty());
	assert_eq!(dest_result.accepted_htlcs.len(), 1);
	let accepted = dest_result.accepted_htlcs[0].clone();
	assert_eq!(accepted.payment_hash, payment_hash);
	assert_eq!(accepted.amount_msat, amount_msat);
	(accepted, payment_preimage)
}

/// Claims an HTLC `dest` accepted from `origin`.
pub fn claim_payment(origin: &Node, dest: &Node, htlc_id: u64, payment_preimage: PaymentPreimage) {
	let update_fulfill = dest.handle.fulfill_htlc(htlc_id, payment_preimage).unwrap()
		.expect("claim should be sent immediately");
	origin.handle.update_fulfill_htlc(&update_fulfill).unwrap();
	let commitment_signed = dest.handle.send_commitment().unwrap();
	check_added_monitors(dest, 1);

	let (_, origin_result) = commitment_signed_dance(dest, origin, &commitment_signed);
	assert_eq!(origin_result.claimed_htlcs, vec![(htlc_id, payment_preimage)]);
}

/// Fails an HTLC `dest` accepted from `origin` back with `reason`.
pub fn fail_payment(origin: &Node, dest: &Node, htlc_id: u64, reason: Vec<u8>) {
	let update_fail = dest.handle.fail_htlc(htlc_id, reason.clone()).unwrap()
		.expect("failure should be sent immediately");
	origin.handle.update_fail_htlc(&update_fail).unwrap();
	let commitment_signed = dest.handle.send_commitment().unwrap();
	check_added_monitors(dest, 1);

	let (_, origin_result) = commitment_signed_dance(dest, origin, &commitment_signed);
	assert_eq!(origin_result.failed_htlcs, vec![(htlc_id, reason)]);
}

/// Asserts that every msat of the channel is accounted for on `node`'s latest commitment: the
/// two balances plus every HTLC add up to the capacity, and the outputs plus the fee do too.
pub fn check_commitment_balances(node: &Node) {
	node.handle.with_channel(|chan| {
		let capacity_sat = chan.get_value_satoshis();
		for commitment in [chan.holder_commitment(), chan.counterparty_commitment()] {
			let commitment = commitment.unwrap();
			let htlcs_msat: u64 = commitment.htlcs.iter().map(|htlc| htlc.amount_msat).sum();
			assert_eq!(commitment.holder_balance_msat + commitment.counterparty_balance_msat + htlcs_msat, capacity_sat * 1000);
			let trusted_tx = commitment.tx.trust();
			let outputs_sat: u64 = trusted_tx.built_transaction().transaction.output.iter()
				.map(|txout| txout.value.to_sat()).sum();
			assert_eq!(outputs_sat + commitment.fee_sat, capacity_sat);
		}
	}).unwrap();
}
