use core::sync::atomic::{AtomicU64, Ordering};

use bit_field::BitField;
use hermit_sync::RawSpinMutex;
use lock_api::RawMutex;

use crate::scheduler::CoreId;

/// Boot phase of the kernel. Strictly monotonic.
///
/// The per-core lock bitmaps become authoritative once `Ready` is reached;
/// before that the system is effectively single-threaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum InitState {
	PowerUp,
	Boot,
	Memory,
	Ready,
}

/// A global lock expressed as a bitmap of holding cores.
///
/// The outer spinlock is the cheap predicate other subsystems test: it is
/// held exactly while the bitmap is non-empty. Writers take the inner
/// spinlock for the read-modify-write and touch the outer lock only when
/// the bitmap crosses zero. All mutations route through [`set`],
/// [`clear`] or [`update`].
///
/// [`set`]: LockSet::set
/// [`clear`]: LockSet::clear
/// [`update`]: LockSet::update
pub(crate) struct LockSet {
	outer: RawSpinMutex,
	inner: RawSpinMutex,
	cores: AtomicU64,
}

impl LockSet {
	pub const fn new() -> Self {
		Self {
			outer: RawSpinMutex::INIT,
			inner: RawSpinMutex::INIT,
			cores: AtomicU64::new(0),
		}
	}

	/// Whether any core currently holds the lock.
	#[inline]
	pub fn is_locked(&self) -> bool {
		self.outer.is_locked()
	}

	/// Snapshot of the holder bitmap.
	pub fn mask(&self) -> u64 {
		self.cores.load(Ordering::SeqCst)
	}

	/// Mark `core_id` as a holder of the lock.
	pub fn set(&self, core_id: CoreId) {
		self.inner.lock();

		let old = self.cores.load(Ordering::SeqCst);
		let mut new = old;
		new.set_bit(core_id as usize, true);
		if old == 0 {
			debug_assert!(!self.outer.is_locked(), "lock held while bitmap was empty");
			self.outer.lock();
		}
		self.cores.store(new, Ordering::SeqCst);

		unsafe { self.inner.unlock() };
	}

	/// Drop `core_id` from the holder bitmap.
	pub fn clear(&self, core_id: CoreId) {
		self.inner.lock();

		let old = self.cores.load(Ordering::SeqCst);
		let mut new = old;
		new.set_bit(core_id as usize, false);
		self.cores.store(new, Ordering::SeqCst);
		if old != 0 && new == 0 {
			debug_assert!(self.outer.is_locked(), "bitmap set while lock was free");
			unsafe { self.outer.unlock() };
		}

		unsafe { self.inner.unlock() };
	}

	/// Make `core_id`'s bit reflect `held`.
	pub fn update(&self, core_id: CoreId, held: bool) {
		if held {
			self.set(core_id);
		} else {
			self.clear(core_id);
		}
	}

	/// Whether the lock is held and the calling core is not among the holders.
	///
	/// Before `InitState::Ready` the bitmap is not yet authoritative and the
	/// answer is always `false`. An empty bitmap with the outer lock held is
	/// only legal from interrupt context: an ISR may take the outer lock
	/// without registering a core bit.
	pub fn held_elsewhere(&self, me: CoreId, init_state: InitState, in_interrupt: bool) -> bool {
		self.inner.lock();

		let mask = self.cores.load(Ordering::SeqCst);
		let held = if init_state < InitState::Ready {
			false
		} else if mask != 0 {
			debug_assert!(self.outer.is_locked(), "bitmap set while lock was free");
			!mask.get_bit(me as usize)
		} else {
			debug_assert!(
				!self.outer.is_locked() || in_interrupt,
				"lock held without a holder outside interrupt context"
			);
			false
		};

		unsafe { self.inner.unlock() };

		held
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn outer_lock_follows_zero_crossings() {
		let lock = LockSet::new();
		assert!(!lock.is_locked());

		lock.set(0);
		assert!(lock.is_locked());
		assert_eq!(lock.mask(), 0b1);

		// A second holder must not retake the outer lock.
		lock.set(3);
		assert!(lock.is_locked());
		assert_eq!(lock.mask(), 0b1001);

		lock.clear(0);
		assert!(lock.is_locked(), "lock released while core 3 still holds it");

		lock.clear(3);
		assert!(!lock.is_locked());
		assert_eq!(lock.mask(), 0);
	}

	#[test]
	fn update_is_idempotent() {
		let lock = LockSet::new();
		lock.update(1, true);
		lock.update(1, true);
		assert_eq!(lock.mask(), 0b10);
		lock.update(1, false);
		lock.update(1, false);
		assert_eq!(lock.mask(), 0);
		assert!(!lock.is_locked());
	}

	#[test]
	fn held_elsewhere_ignores_own_bit() {
		let lock = LockSet::new();
		lock.set(1);
		assert!(!lock.held_elsewhere(1, InitState::Ready, false));
		assert!(lock.held_elsewhere(0, InitState::Ready, false));
	}

	#[test]
	fn held_elsewhere_is_false_during_boot() {
		let lock = LockSet::new();
		lock.set(1);
		// The bitmap is not authoritative until the kernel is up.
		assert!(!lock.held_elsewhere(0, InitState::Boot, false));
		assert!(!lock.held_elsewhere(0, InitState::PowerUp, false));
		assert!(lock.held_elsewhere(0, InitState::Ready, false));
	}

	#[test]
	fn free_lock_is_never_held_elsewhere() {
		let lock = LockSet::new();
		assert!(!lock.held_elsewhere(0, InitState::Ready, false));
		assert!(!lock.held_elsewhere(0, InitState::Ready, true));
	}
}
