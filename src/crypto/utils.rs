use bitcoin::hashes::hmac::{Hmac, HmacEngine};
use bitcoin::hashes::sha256::Hash as Sha256;
use bitcoin::hashes::{Hash, HashEngine};
use bitcoin::secp256k1::{ecdsa::Signature, Message, Secp256k1, SecretKey, Signing};
use bitcoin::script::Script;
use bitcoin::sighash::{EcdsaSighashType, SegwitV0Sighash, SighashCache};
use bitcoin::{Amount, Transaction};

macro_rules! hkdf_extract_expand {
	($salt: expr, $ikm: expr) => {{
		let mut hmac = HmacEngine::<Sha256>::new($salt);
		hmac.input($ikm);
		let prk = Hmac::from_engine(hmac).to_byte_array();
		let mut hmac = HmacEngine::<Sha256>::new(&prk[..]);
		hmac.input(&[1; 1]);
		let t1 = Hmac::from_engine(hmac).to_byte_array();
		let mut hmac = HmacEngine::<Sha256>::new(&prk[..]);
		hmac.input(&t1);
		hmac.input(&[2; 1]);
		(t1, Hmac::from_engine(hmac).to_byte_array(), prk)
	}};
	($salt: expr, $ikm: expr, 6) => {{
		let (k1, k2, prk) = hkdf_extract_expand!($salt, $ikm);

		let mut hmac = HmacEngine::<Sha256>::new(&prk[..]);
		hmac.input(&k2);
		hmac.input(&[3; 1]);
		let k3 = Hmac::from_engine(hmac).to_byte_array();

		let mut hmac = HmacEngine::<Sha256>::new(&prk[..]);
		hmac.input(&k3);
		hmac.input(&[4; 1]);
		let k4 = Hmac::from_engine(hmac).to_byte_array();

		let mut hmac = HmacEngine::<Sha256>::new(&prk[..]);
		hmac.input(&k4);
		hmac.input(&[5; 1]);
		let k5 = Hmac::from_engine(hmac).to_byte_array();

		let mut hmac = HmacEngine::<Sha256>::new(&prk[..]);
		hmac.input(&k5);
		hmac.input(&[6; 1]);
		let k6 = Hmac::from_engine(hmac).to_byte_array();

		(k1, k2, k3, k4, k5, k6)
	}};
}

/// Expands `ikm` into six independent 32-byte keys.
pub fn hkdf_extract_expand_6x(
	salt: &[u8], ikm: &[u8],
) -> ([u8; 32], [u8; 32], [u8; 32], [u8; 32], [u8; 32], [u8; 32]) {
	hkdf_extract_expand!(salt, ikm, 6)
}

#[inline]
pub fn sign<C: Signing>(ctx: &Secp256k1<C>, msg: &Message, sk: &SecretKey) -> Signature {
	#[cfg(feature = "grind_signatures")]
	let sig = ctx.sign_ecdsa_low_r(msg, sk);
	#[cfg(not(feature = "grind_signatures"))]
	let sig = ctx.sign_ecdsa(msg, sk);
	sig
}

#[inline]
pub fn sighash_to_message(sighash: SegwitV0Sighash) -> Message {
	Message::from_digest(sighash.to_byte_array())
}

/// The BIP 143 message for input `input_index` of `tx` spending a P2WSH output of `value` locked
/// by `witness_script`, or `None` if the index is out of range.
pub fn p2wsh_sighash(
	tx: &Transaction, input_index: usize, witness_script: &Script, value: Amount,
	sighash_type: EcdsaSighashType,
) -> Option<Message> {
	SighashCache::new(tx)
		.p2wsh_signature_hash(input_index, witness_script, value, sighash_type)
		.ok()
		.map(sighash_to_message)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn hkdf_outputs_are_distinct() {
		let (k1, k2, k3, k4, k5, k6) = hkdf_extract_expand_6x(b"salt", &[42; 32]);
		let keys = [k1, k2, k3, k4, k5, k6];
		for i in 0..keys.len() {
			for j in (i + 1)..keys.len() {
				assert_ne!(keys[i], keys[j]);
			}
		}
		assert_eq!(hkdf_extract_expand_6x(b"salt", &[42; 32]).0, k1);
	}

	#[test]
	fn sighash_out_of_range_input() {
		use bitcoin::absolute::LockTime;
		use bitcoin::transaction::Version;
		let tx = Transaction { version: Version::TWO, lock_time: LockTime::ZERO, input: Vec::new(), output: Vec::new() };
		assert!(p2wsh_sighash(&tx, 0, Script::new(), Amount::from_sat(1), EcdsaSighashType::All).is_none());
	}

	#[test]
	#[cfg(feature = "grind_signatures")]
	fn ground_signatures_are_low_r() {
		let secp_ctx = Secp256k1::new();
		let sk = SecretKey::from_slice(&[7; 32]).unwrap();
		for i in 0..16u8 {
			let sig = sign(&secp_ctx, &Message::from_digest([i; 32]), &sk);
			assert!(sig.serialize_compact()[0] < 0x80);
			assert!(sig.serialize_der().len() <= 70);
		}
	}
}
