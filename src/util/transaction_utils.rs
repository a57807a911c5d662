// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! BIP 69 (lexicographic) ordering of transaction inputs and outputs.

use bitcoin::hashes::Hash;
use bitcoin::transaction::{TxIn, TxOut};

use crate::prelude::*;
use core::cmp::Ordering;

/// Sorts outputs by value, then by scriptPubKey, deferring to `tie_breaker` on the auxiliary data
/// when both match.
pub fn sort_outputs<T, C: Fn(&T, &T) -> Ordering>(outputs: &mut Vec<(TxOut, T)>, tie_breaker: C) {
	outputs.sort_unstable_by(|a, b| {
		a.0.value.cmp(&b.0.value).then_with(|| {
			a.0.script_pubkey[..].cmp(&b.0.script_pubkey[..]).then_with(|| tie_breaker(&a.1, &b.1))
		})
	});
}

/// Sorts inputs by previous txid (in the reversed, displayed byte order) and then by output
/// index, carrying the auxiliary data along.
pub fn sort_inputs<T>(inputs: &mut Vec<(TxIn, T)>) {
	inputs.sort_unstable_by(|a, b| {
		let a_txid = a.0.previous_output.txid.to_byte_array();
		let b_txid = b.0.previous_output.txid.to_byte_array();
		a_txid.iter().rev().cmp(b_txid.iter().rev())
			.then_with(|| a.0.previous_output.vout.cmp(&b.0.previous_output.vout))
	});
}

#[cfg(test)]
mod tests {
	use super::*;

	use bitcoin::hashes::Hash;
	use bitcoin::hex::FromHex;
	use bitcoin::script::{Builder, ScriptBuf};
	use bitcoin::transaction::{OutPoint, TxOut};
	use bitcoin::{Amount, Sequence, Txid, Witness};

	#[test]
	fn sort_output_by_value() {
		let txout1 = TxOut {
			value: Amount::from_sat(100),
			script_pubkey: Builder::new().push_int(0).into_script(),
		};
		let txout1_ = txout1.clone();

		let txout2 = TxOut {
			value: Amount::from_sat(99),
			script_pubkey: Builder::new().push_int(0).into_script(),
		};
		let txout2_ = txout2.clone();

		let mut outputs = vec![(txout1, "ignore"), (txout2, "ignore")];
		sort_outputs(&mut outputs, |_, _| {
			unreachable!();
		});

		assert_eq!(&outputs, &vec![(txout2_, "ignore"), (txout1_, "ignore")]);
	}

	#[test]
	fn sort_output_by_script_pubkey() {
		let txout1 = TxOut {
			value: Amount::from_sat(100),
			script_pubkey: Builder::new().push_int(3).into_script(),
		};
		let txout1_ = txout1.clone();

		let txout2 = TxOut {
			value: Amount::from_sat(100),
			script_pubkey: Builder::new().push_int(1).push_int(2).into_script(),
		};
		let txout2_ = txout2.clone();

		let mut outputs = vec![(txout1, "ignore"), (txout2, "ignore")];
		sort_outputs(&mut outputs, |_, _| {
			unreachable!();
		});

		assert_eq!(&outputs, &vec![(txout2_, "ignore"), (txout1_, "ignore")]);
	}

	#[test]
	fn sort_output_tie_breaker_test() {
		let txout1 = TxOut {
			value: Amount::from_sat(100),
			script_pubkey: Builder::new().push_int(1).push_int(2).into_script(),
		};
		let txout1_ = txout1.clone();

		let txout2 = txout1.clone();
		let txout2_ = txout1.clone();

		let mut outputs = vec![(txout1, 420), (txout2, 69)];
		sort_outputs(&mut outputs, |a, b| a.cmp(b));

		assert_eq!(&outputs, &vec![(txout2_, 69), (txout1_, 420)]);
	}

	fn script_from_hex(hex_str: &str) -> ScriptBuf {
		ScriptBuf::from(Vec::<u8>::from_hex(hex_str).unwrap())
	}

	macro_rules! bip_txout_tests {
		($($name:ident: $value:expr,)*) => {
			$(
				#[test]
				fn $name() {
					let expected_raw: Vec<(u64, &str)> = $value;
					let expected: Vec<(TxOut, &str)> = expected_raw.iter()
						.map(|txout_raw| TxOut {
							value: Amount::from_sat(txout_raw.0),
							script_pubkey: script_from_hex(txout_raw.1)
						}).map(|txout| (txout, "ignore"))
					.collect();

					let mut outputs = expected.clone();
					outputs.reverse(); // prep it

					sort_outputs(&mut outputs, |_, _| { unreachable!(); });

					assert_eq!(outputs, expected);
				}
			)*
		}
	}

	const TXOUT1: [(u64, &str); 2] = [
		(400057456, "76a9144a5fba237213a062f6f57978f796390bdcf8d01588ac"),
		(40000000000, "76a9145be32612930b8323add2212a4ec03c1562084f8488ac"),
	];
	const TXOUT2: [(u64, &str); 2] = [
		(100000000, "41046a0765b5865641ce08dd39690aade26dfbf5511430ca428a3089261361cef170e3929a68aee3d8d4848b0c5111b0a37b82b86ad559fd2a745b44d8e8d9dfdc0cac"),
		(2400000000, "41044a656f065871a353f216ca26cef8dde2f03e8c16202d2e8ad769f02032cb86a5eb5e56842e92e19141d60a01928f8dd2c875a390f67c1f6c94cfc617c0ea45afac"),
	];
	bip_txout_tests! {
		bip69_txout_test_1: TXOUT1.to_vec(),
		bip69_txout_test_2: TXOUT2.to_vec(),
	}

	fn txin(txid_hex: &str, vout: u32) -> TxIn {
		TxIn {
			previous_output: OutPoint { txid: txid_hex.parse::<Txid>().unwrap(), vout },
			script_sig: ScriptBuf::new(),
			sequence: Sequence::MAX,
			witness: Witness::new(),
		}
	}

	#[test]
	fn sort_input_by_displayed_txid_then_vout() {
		// Txids parse from their displayed (reversed) form, which is the order inputs sort in.
		let a = "0e53ec5dfb2cb8a71fec32dc9a634a35b7e24799295ddd5278217822e0b31f57";
		let b = "26aa6e6d8b9e49bb0630aac301db6757c02e3619feb4ee0eea81eb1672947024";
		let c = "28e0fdd185542f2c6ea19030b0796051e7772b6026dd5ddccd7a2f93b73e6fc2";

		let mut inputs = vec![(txin(c, 0), 'c'), (txin(a, 1), 'x'), (txin(b, 0), 'b'), (txin(a, 0), 'a')];
		sort_inputs(&mut inputs);
		let order: Vec<char> = inputs.iter().map(|(_, tag)| *tag).collect();
		assert_eq!(order, vec!['a', 'x', 'b', 'c']);
		assert_eq!(inputs[0].0.previous_output.txid, Txid::from_byte_array({
			let mut bytes = <[u8; 32]>::from_hex(a).unwrap();
			bytes.reverse();
			bytes
		}));
	}
}
