pub use ::alloc::sync::Arc;
use core::cell::{RefCell, RefMut};
use core::ops::{Deref, DerefMut};

pub type LockResult<Guard> = Result<Guard, ()>;

/// A single-threaded stand-in for [`std::sync::Mutex`]. A re-entrant lock attempt is reported as
/// an error rather than panicking.
pub struct Mutex<T: ?Sized> {
	inner: RefCell<T>,
}

#[must_use = "if unused the Mutex will immediately unlock"]
pub struct MutexGuard<'a, T: ?Sized + 'a> {
	lock: RefMut<'a, T>,
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
	type Target = T;

	fn deref(&self) -> &T {
		self.lock.deref()
	}
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
	fn deref_mut(&mut self) -> &mut T {
		self.lock.deref_mut()
	}
}

impl<T> Mutex<T> {
	pub fn new(inner: T) -> Mutex<T> {
		Mutex { inner: RefCell::new(inner) }
	}

	pub fn lock<'a>(&'a self) -> LockResult<MutexGuard<'a, T>> {
		match self.inner.try_borrow_mut() {
			Ok(lock) => Ok(MutexGuard { lock }),
			Err(_) => Err(()),
		}
	}

	#[allow(unused)]
	pub fn into_inner(self) -> LockResult<T> {
		Ok(self.inner.into_inner())
	}
}
