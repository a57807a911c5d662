#[cfg(feature = "std")]
pub use std::sync::{Arc, Mutex, MutexGuard};

#[cfg(not(feature = "std"))]
mod nostd_sync;
#[cfg(not(feature = "std"))]
pub use nostd_sync::*;

/// Marker for types which must be [`Sync`] when threads are available.
#[cfg(feature = "std")]
pub trait MaybeSync: Sync {}
#[cfg(feature = "std")]
impl<T: Sync + ?Sized> MaybeSync for T {}

/// Marker for types which must be `Sync` when threads are available.
#[cfg(not(feature = "std"))]
pub trait MaybeSync {}
#[cfg(not(feature = "std"))]
impl<T: ?Sized> MaybeSync for T {}
