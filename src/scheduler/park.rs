use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use crossbeam_utils::{Backoff, CachePadded};
use thiserror::Error;

use crate::scheduler::{CoreId, Platform};

/// Spin budget while waiting for a core to acknowledge a pause request.
const PARK_SPIN_LIMIT: usize = 100_000;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParkError {
	/// The target core never acknowledged the pause request.
	#[error("core {0} did not quiesce")]
	NoResponse(CoreId),
	/// Resume was issued for a core that is not paused.
	#[error("core {0} is not paused")]
	NotPaused(CoreId),
}

#[derive(Default)]
struct ParkSlot {
	/// A pause has been requested and not yet withdrawn.
	requested: AtomicBool,
	/// The core acknowledged the request and spins in its check-in loop.
	parked: AtomicBool,
}

/// Cross-core quiesce handshake.
///
/// One slot per core. The pausing side posts a request and kicks the
/// target through [`Platform::wakeup_core`]; the target's interrupt or
/// idle path polls [`check_in`] and spins there until the request is
/// withdrawn by [`resume`]. While a core is parked its assigned queue may
/// be mutated safely from the outside.
///
/// [`check_in`]: ParkTable::check_in
/// [`resume`]: ParkTable::resume
pub struct ParkTable {
	slots: Box<[CachePadded<ParkSlot>]>,
}

impl ParkTable {
	pub fn new(core_count: usize) -> Self {
		let mut slots = Vec::with_capacity(core_count);
		slots.resize_with(core_count, CachePadded::default);
		Self {
			slots: slots.into_boxed_slice(),
		}
	}

	/// Stop `core_id` in a known safe state.
	///
	/// Blocks until the target core has entered its check-in loop. The spin
	/// is bounded; a core that never responds yields [`ParkError::NoResponse`],
	/// which callers treat as a fatal programming error.
	pub fn pause<P: Platform>(&self, core_id: CoreId, platform: &P) -> Result<(), ParkError> {
		let slot = &self.slots[core_id as usize];
		debug_assert!(
			!slot.requested.load(Ordering::SeqCst),
			"pause request for core {core_id} already outstanding"
		);

		// A previous cycle may not have drained yet; wait for the core to
		// leave its old check-in loop before posting a new request.
		let backoff = Backoff::new();
		let mut budget = PARK_SPIN_LIMIT;
		while slot.parked.load(Ordering::SeqCst) {
			if budget == 0 {
				return Err(ParkError::NoResponse(core_id));
			}
			budget -= 1;
			backoff.snooze();
		}

		trace!("Pausing core {core_id}");
		slot.requested.store(true, Ordering::SeqCst);
		platform.wakeup_core(core_id);

		let backoff = Backoff::new();
		let mut budget = PARK_SPIN_LIMIT;
		while !slot.parked.load(Ordering::SeqCst) {
			if budget == 0 {
				slot.requested.store(false, Ordering::SeqCst);
				return Err(ParkError::NoResponse(core_id));
			}
			budget -= 1;
			backoff.snooze();
		}

		Ok(())
	}

	/// Let a paused core continue.
	///
	/// Only withdraws the request; the target core leaves its check-in loop
	/// on its own and runs its dispatcher, so any queue reshuffle done under
	/// the pause takes effect there.
	pub fn resume(&self, core_id: CoreId) -> Result<(), ParkError> {
		let slot = &self.slots[core_id as usize];
		if !slot.requested.load(Ordering::SeqCst) || !slot.parked.load(Ordering::SeqCst) {
			return Err(ParkError::NotPaused(core_id));
		}

		trace!("Resuming core {core_id}");
		slot.requested.store(false, Ordering::SeqCst);

		Ok(())
	}

	/// Poll entry for the core itself.
	///
	/// Returns `true` while the core must keep spinning. Intended usage from
	/// the target core's interrupt or idle path:
	///
	/// ```ignore
	/// while park_table.check_in(core_id) {
	///     core::hint::spin_loop();
	/// }
	/// ```
	pub fn check_in(&self, core_id: CoreId) -> bool {
		let slot = &self.slots[core_id as usize];
		if slot.requested.load(Ordering::SeqCst) {
			slot.parked.store(true, Ordering::SeqCst);
			true
		} else if slot.parked.load(Ordering::SeqCst) {
			slot.parked.store(false, Ordering::SeqCst);
			false
		} else {
			false
		}
	}

	/// Whether `core_id` currently sits in its check-in loop.
	pub fn is_parked(&self, core_id: CoreId) -> bool {
		self.slots[core_id as usize].parked.load(Ordering::SeqCst)
	}
}

#[cfg(test)]
mod tests {
	use std::prelude::v1::*;
	use std::sync::Arc;
	use std::sync::atomic::AtomicU32;
	use std::thread;

	use super::*;

	struct KickCounter(AtomicU32);

	impl Platform for KickCounter {
		fn core_id(&self) -> CoreId {
			0
		}

		fn wakeup_core(&self, _core_id: CoreId) {
			self.0.fetch_add(1, Ordering::SeqCst);
		}

		fn in_interrupt(&self) -> bool {
			false
		}
	}

	/// Platform double whose kick parks the target synchronously, standing in
	/// for the IPI handler of a real port.
	struct SyncParker {
		table: Arc<ParkTable>,
	}

	impl Platform for SyncParker {
		fn core_id(&self) -> CoreId {
			0
		}

		fn wakeup_core(&self, core_id: CoreId) {
			self.table.check_in(core_id);
		}

		fn in_interrupt(&self) -> bool {
			false
		}
	}

	#[test]
	fn polled_pause_cycle() {
		let table = Arc::new(ParkTable::new(2));
		let platform = SyncParker {
			table: Arc::clone(&table),
		};

		// Nothing requested: the core passes straight through.
		assert!(!table.check_in(1));

		table.pause(1, &platform).unwrap();
		assert!(table.is_parked(1));

		table.resume(1).unwrap();
		// The core leaves the check-in loop on its next poll.
		assert!(!table.check_in(1));
		assert!(!table.is_parked(1));
	}

	#[test]
	fn handshake_between_two_threads() {
		let table = Arc::new(ParkTable::new(2));
		let platform = KickCounter(AtomicU32::new(0));
		let polling = Arc::new(AtomicBool::new(false));

		let remote = thread::spawn({
			let table = Arc::clone(&table);
			let polling = Arc::clone(&polling);
			move || {
				polling.store(true, Ordering::SeqCst);
				let mut cycles = 0u32;
				// Poll until one full pause cycle has been observed.
				loop {
					if table.check_in(1) {
						while table.check_in(1) {
							core::hint::spin_loop();
						}
						cycles += 1;
						break;
					}
					core::hint::spin_loop();
				}
				cycles
			}
		});

		// The pause spin is bounded; wait until the remote side polls.
		while !polling.load(Ordering::SeqCst) {
			thread::yield_now();
		}

		table.pause(1, &platform).unwrap();
		assert!(table.is_parked(1));
		assert_eq!(platform.0.load(Ordering::SeqCst), 1);
		table.resume(1).unwrap();

		assert_eq!(remote.join().unwrap(), 1);
		assert!(!table.is_parked(1));
	}

	#[test]
	fn pause_times_out_without_a_responder() {
		let table = ParkTable::new(1);
		let platform = KickCounter(AtomicU32::new(0));

		assert_eq!(table.pause(0, &platform), Err(ParkError::NoResponse(0)));
		// The request must be withdrawn again, otherwise the core would park
		// the next time it checks in.
		assert!(!table.check_in(0));
	}

	#[test]
	fn resume_requires_a_paused_core() {
		let table = ParkTable::new(1);
		assert_eq!(table.resume(0), Err(ParkError::NotPaused(0)));
	}
}
