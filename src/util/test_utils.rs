// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

use crate::chain::chaininterface::BroadcasterInterface;
use crate::chain::channelmonitor::ChannelMonitorUpdate;
use crate::chain::{ChannelMonitorUpdateStatus, Filter, Persist, ScriptVerifier, WatchedOutput};
use crate::ln::chan_utils::ChannelTransactionParameters;
use crate::ln::types::ChannelId;
use crate::sign::{ChannelSigner, InMemorySigner};
use crate::sync::Mutex;
use crate::util::logger::{Level, Logger, Record};

use bitcoin::hashes::Hash;
use bitcoin::script::{Script, ScriptBuf};
use bitcoin::secp256k1::{PublicKey, Secp256k1};
use bitcoin::transaction::{OutPoint, Transaction};
use bitcoin::{Amount, Txid, WPubkeyHash};

use crate::prelude::*;

/// A signer whose keys are all derived from `seed_byte`, so two calls with the same byte yield the
/// same keys.
pub fn in_memory_signer(seed_byte: u8) -> InMemorySigner {
	let secp_ctx = Secp256k1::signing_only();
	InMemorySigner::from_seed(&secp_ctx, &[seed_byte; 32], [seed_byte; 32]).unwrap()
}

/// Static parameters for a channel `holder` would see with `counterparty`, funded by `holder`.
pub fn channel_parameters(
	holder: &InMemorySigner, counterparty: &InMemorySigner, channel_value_satoshis: u64, anchors: bool,
) -> ChannelTransactionParameters {
	ChannelTransactionParameters {
		holder_pubkeys: holder.pubkeys().clone(),
		holder_selected_contest_delay: 144,
		is_outbound_from_holder: true,
		counterparty_pubkeys: counterparty.pubkeys().clone(),
		counterparty_selected_contest_delay: 144,
		funding_outpoint: OutPoint { txid: Txid::from_byte_array([42; 32]), vout: 0 },
		channel_value_satoshis,
		anchors,
	}
}

pub fn sweep_script() -> ScriptBuf {
	ScriptBuf::new_p2wpkh(&WPubkeyHash::from_byte_array([1; 20]))
}

pub fn reward_script() -> ScriptBuf {
	ScriptBuf::new_p2wpkh(&WPubkeyHash::from_byte_array([2; 20]))
}

/// Runs libbitcoinconsensus against each input.
pub struct ConsensusScriptVerifier;

impl ScriptVerifier for ConsensusScriptVerifier {
	fn verify_script(
		&self, script_pubkey: &Script, amount: Amount, tx: &Transaction, input_index: usize, flags: u32,
	) -> Result<(), ()> {
		let serialized_tx = bitcoin::consensus::serialize(tx);
		script_pubkey.verify_with_flags(input_index, amount, &serialized_tx, flags).map_err(|_| ())
	}
}

pub struct TestBroadcaster {
	pub txn_broadcasted: Mutex<Vec<Transaction>>,
}

impl TestBroadcaster {
	pub fn new() -> TestBroadcaster {
		TestBroadcaster { txn_broadcasted: Mutex::new(Vec::new()) }
	}

	pub fn txn_broadcast(&self) -> Vec<Transaction> {
		self.txn_broadcasted.lock().unwrap().split_off(0)
	}
}

impl BroadcasterInterface for TestBroadcaster {
	fn broadcast_transactions(&self, txs: &[&Transaction]) {
		for tx in txs {
			let lock_time = tx.lock_time.to_consensus_u32();
			assert!(lock_time < 1_500_000_000);
		}
		let owned_txs: Vec<Transaction> = txs.iter().map(|tx| (*tx).clone()).collect();
		self.txn_broadcasted.lock().unwrap().extend(owned_txs);
	}
}

pub struct TestPersister {
	/// The updates persisted so far, per channel, in the order they arrived.
	pub updates: Mutex<HashMap<ChannelId, Vec<ChannelMonitorUpdate>>>,
	/// If set, every later persist returns this status without recording the update.
	pub update_ret: Mutex<Option<ChannelMonitorUpdateStatus>>,
}

impl TestPersister {
	pub fn new() -> Self {
		TestPersister { updates: Mutex::new(new_hash_map()), update_ret: Mutex::new(None) }
	}

	pub fn set_update_ret(&self, ret: ChannelMonitorUpdateStatus) {
		*self.update_ret.lock().unwrap() = Some(ret);
	}

	pub fn persisted_updates(&self, channel_id: &ChannelId) -> Vec<ChannelMonitorUpdate> {
		self.updates.lock().unwrap().get(channel_id).cloned().unwrap_or_default()
	}
}

impl Persist for TestPersister {
	fn persist_channel_update(
		&self, channel_id: ChannelId, update: &ChannelMonitorUpdate,
	) -> ChannelMonitorUpdateStatus {
		if let Some(ret) = *self.update_ret.lock().unwrap() {
			return ret;
		}
		let mut updates = self.updates.lock().unwrap();
		let channel_updates = updates.entry(channel_id).or_insert_with(Vec::new);
		if let Some(last) = channel_updates.last() {
			assert_eq!(last.update_id + 1, update.update_id, "Updates must be persisted in order");
		}
		channel_updates.push(update.clone());
		ChannelMonitorUpdateStatus::Completed
	}
}

pub struct TestChainSource {
	pub watched_outputs: Mutex<HashSet<(OutPoint, ScriptBuf)>>,
}

impl TestChainSource {
	pub fn new() -> Self {
		TestChainSource { watched_outputs: Mutex::new(new_hash_set()) }
	}
}

impl Filter for TestChainSource {
	fn register_output(&self, output: WatchedOutput) {
		self.watched_outputs.lock().unwrap().insert((output.outpoint, output.script_pubkey));
	}
}

pub struct TestLogger {
	level: Level,
	id: String,
	pub lines: Mutex<HashMap<(&'static str, String), usize>>,
	pub context: Mutex<HashMap<(&'static str, Option<PublicKey>, Option<ChannelId>), usize>>,
}

impl TestLogger {
	pub fn new() -> TestLogger {
		Self::with_id("".to_owned())
	}
	pub fn with_id(id: String) -> TestLogger {
		TestLogger { level: Level::Trace, id, lines: Mutex::new(new_hash_map()), context: Mutex::new(new_hash_map()) }
	}
	pub fn enable(&mut self, level: Level) {
		self.level = level;
	}
	pub fn assert_log(&self, module: &str, line: String, count: usize) {
		let log_entries = self.lines.lock().unwrap();
		assert_eq!(log_entries.get(&(module, line)), Some(&count));
	}

	/// Search for the number of occurrence of the logged lines which
	/// 1. belongs to the specified module and
	/// 2. contains `line` in it.
	/// And asserts if the number of occurrences is the same with the given `count`
	pub fn assert_log_contains(&self, module: &str, line: &str, count: usize) {
		let log_entries = self.lines.lock().unwrap();
		let l: usize = log_entries
			.iter()
			.filter(|&(&(ref m, ref l), _c)| *m == module && l.contains(line))
			.map(|(_, c)| c)
			.sum();
		assert_eq!(l, count)
	}

	/// Search for the number of occurrences of logged lines which
	/// 1. belong to the specified module and
	/// 2. match the given regex pattern.
	/// Assert that the number of occurrences equals the given `count`
	pub fn assert_log_regex(&self, module: &str, pattern: regex::Regex, count: usize) {
		let log_entries = self.lines.lock().unwrap();
		let l: usize = log_entries
			.iter()
			.filter(|&(&(ref m, ref l), _c)| *m == module && pattern.is_match(&l))
			.map(|(_, c)| c)
			.sum();
		assert_eq!(l, count)
	}

	pub fn assert_log_context_contains(
		&self, module: &str, peer_id: Option<PublicKey>, channel_id: Option<ChannelId>, count: usize,
	) {
		let context_entries = self.context.lock().unwrap();
		let l = context_entries.get(&(module, peer_id, channel_id)).unwrap();
		assert_eq!(*l, count)
	}
}

impl Logger for TestLogger {
	fn log(&self, record: Record) {
		let context =
			format!("{} {} [{}:{}]", self.id, record.level, record.module_path, record.line);
		let s = format!("{:<55} {}", context, record.args);
		*self
			.lines
			.lock()
			.unwrap()
			.entry((record.module_path, format!("{}", record.args)))
			.or_insert(0) += 1;
		*self
			.context
			.lock()
			.unwrap()
			.entry((record.module_path, record.peer_id, record.channel_id))
			.or_insert(0) += 1;
		if record.level >= self.level {
			std::println!("{}", s);
		}
	}
}
