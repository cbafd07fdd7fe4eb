//! Priority scheduler core of a Rust-based real-time kernel.
//!
//! This crate implements the ready-to-run admission machinery of a
//! preemptive, priority-based kernel: the role queues a runnable task can
//! live in, the per-core assigned queues whose heads are the running tasks,
//! the global scheduler/IRQ lock bitmaps, and the cross-core pause
//! handshake needed to mutate a remote core's queue safely. Context-switch
//! execution, timers and wait queues stay with the embedding kernel; the
//! scheduler tells its caller *whether* to switch, never *how*.
//!
//! The `smp` feature (on by default) selects the multi-core variant.
//! Without it the crate builds the uniprocessor scheduler with a single
//! unified run queue.

#![no_std]

#[macro_use]
extern crate alloc;
#[macro_use]
extern crate log;
#[cfg(test)]
#[macro_use]
extern crate std;

pub mod scheduler;

#[cfg(feature = "smp")]
pub use crate::scheduler::lockset::InitState;
#[cfg(feature = "smp")]
pub use crate::scheduler::park::{ParkError, ParkTable};
pub use crate::scheduler::task::{
	CoreSet, HIGH_PRIO, IDLE_PRIO, LOW_PRIO, NO_PRIORITIES, NORMAL_PRIO, Priority,
	PriorityTaskQueue, Task, TaskFlags, TaskHandle, TaskId, TaskStatus,
};
pub use crate::scheduler::{CoreId, MAX_CORES, Platform, Scheduler, next_task_id};
