// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Signs many independent inputs at once, spreading the work over a bounded set of threads when
//! `std` is available.
//!
//! A commitment with many HTLCs needs one signature per second-level transaction, each of which
//! only depends on its own [`SignRequest`]. [`sign_all`] returns the signatures in request order
//! and fails as a whole if any request fails, reporting the same error a sequential pass would.

use bitcoin::secp256k1;
use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::secp256k1::Secp256k1;
use bitcoin::transaction::Transaction;

use crate::sign::{ChannelSigner, SignDescriptor, SignError};

pub use crate::sync::MaybeSync;

#[allow(unused_imports)]
use crate::prelude::*;

/// One transaction input to sign.
#[derive(Clone, Debug)]
pub struct SignRequest {
	/// The transaction containing the input.
	pub tx: Transaction,
	/// Describes the input within [`Self::tx`] and the key to sign it with.
	pub descriptor: SignDescriptor,
}

/// Signs every request with `signer`, using at most `max_workers` threads.
///
/// On failure, the error of the lowest-indexed failing request is returned and no signatures
/// are. Once any request fails no further requests are started.
pub fn sign_all<S: ChannelSigner + MaybeSync + ?Sized>(
	signer: &S, requests: &[SignRequest], max_workers: usize, secp_ctx: &Secp256k1<secp256k1::All>,
) -> Result<Vec<Signature>, SignError> {
	let workers = max_workers.max(1).min(requests.len());
	#[cfg(feature = "std")]
	{
		if workers > 1 {
			return sign_parallel(signer, requests, workers, secp_ctx);
		}
	}
	#[cfg(not(feature = "std"))]
	let _ = workers;
	requests
		.iter()
		.map(|request| signer.sign_with_descriptor(&request.tx, &request.descriptor, secp_ctx))
		.collect()
}

#[cfg(feature = "std")]
fn sign_parallel<S: ChannelSigner + MaybeSync + ?Sized>(
	signer: &S, requests: &[SignRequest], workers: usize, secp_ctx: &Secp256k1<secp256k1::All>,
) -> Result<Vec<Signature>, SignError> {
	use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

	// Requests are claimed in index order, so every request below the highest claimed one has
	// been attempted by the time the threads exit.
	let next_request = AtomicUsize::new(0);
	let failed = AtomicBool::new(false);

	let per_worker: Vec<Vec<(usize, Result<Signature, SignError>)>> = std::thread::scope(|scope| {
		let handles: Vec<_> = (0..workers)
			.map(|_| {
				scope.spawn(|| {
					let mut signed = Vec::new();
					while !failed.load(Ordering::Acquire) {
						let idx = next_request.fetch_add(1, Ordering::AcqRel);
						let request = match requests.get(idx) {
							Some(request) => request,
							None => break,
						};
						let res = signer.sign_with_descriptor(&request.tx, &request.descriptor, secp_ctx);
						if res.is_err() {
							failed.store(true, Ordering::Release);
						}
						signed.push((idx, res));
					}
					signed
				})
			})
			.collect();
		handles
			.into_iter()
			.map(|handle| handle.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
			.collect()
	});

	let mut sigs: Vec<Option<Signature>> = vec![None; requests.len()];
	let mut first_err: Option<(usize, SignError)> = None;
	for (idx, res) in per_worker.into_iter().flatten() {
		match res {
			Ok(sig) => sigs[idx] = Some(sig),
			Err(e) => {
				if first_err.as_ref().map_or(true, |(err_idx, _)| idx < *err_idx) {
					first_err = Some((idx, e));
				}
			},
		}
	}
	if let Some((_, e)) = first_err {
		return Err(e);
	}
	sigs.into_iter().map(|sig| sig.ok_or(SignError::Unavailable)).collect()
}
