use alloc::collections::LinkedList;
use alloc::rc::Rc;
use core::cell::RefCell;
use core::fmt;
use core::num::NonZeroU64;

use bit_field::BitField;
use bitflags::bitflags;

use crate::scheduler::CoreId;

/// Returns the most significant bit.
///
/// # Examples
///
/// ```ignore
/// assert_eq!(msb(0), None);
/// assert_eq!(msb(1), Some(0));
/// assert_eq!(msb(u64::MAX), Some(63));
/// ```
#[inline]
fn msb(n: u64) -> Option<u32> {
	NonZeroU64::new(n).map(|n| u64::BITS - 1 - n.leading_zeros())
}

/// The status of the task - used for scheduling
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TaskStatus {
	/// Not linked into any queue.
	Invalid,
	/// Runnable, not executing, not attached to a core.
	Ready,
	/// Executing on the core recorded in the TCB.
	Running,
	/// Runnable and attached to a specific core's queue behind its runner.
	Assigned,
	/// Runnable but withheld while a scheduler or IRQ lock forbids dispatch.
	Pending,
}

/// Unique identifier for a task (i.e. `pid`).
#[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Clone, Copy)]
pub struct TaskId(i32);

impl TaskId {
	pub const fn into(self) -> i32 {
		self.0
	}

	pub const fn from(x: i32) -> Self {
		TaskId(x)
	}
}

impl fmt::Display for TaskId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Priority of a task
#[derive(PartialEq, Eq, PartialOrd, Ord, Debug, Clone, Copy)]
pub struct Priority(u8);

impl Priority {
	pub const fn into(self) -> u8 {
		self.0
	}

	pub const fn from(x: u8) -> Self {
		Priority(x)
	}
}

impl fmt::Display for Priority {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

#[allow(dead_code)]
pub const HIGH_PRIO: Priority = Priority::from(3);
pub const NORMAL_PRIO: Priority = Priority::from(2);
#[allow(dead_code)]
pub const LOW_PRIO: Priority = Priority::from(1);
pub const IDLE_PRIO: Priority = Priority::from(0);

/// Maximum number of priorities
pub const NO_PRIORITIES: usize = 31;

bitflags! {
	/// Scheduling-relevant flag bits of a task.
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct TaskFlags: u8 {
		/// The task is pinned to the core recorded in its TCB.
		const CORE_PINNED = 0b0000_0001;
	}
}

/// Set of cores a task may be dispatched on.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct CoreSet(u64);

impl CoreSet {
	/// A mask admitting every core.
	pub const ALL: CoreSet = CoreSet(u64::MAX);

	/// A mask admitting exactly one core.
	pub fn single(core_id: CoreId) -> Self {
		let mut mask = 0u64;
		mask.set_bit(core_id as usize, true);
		CoreSet(mask)
	}

	#[inline]
	pub fn contains(&self, core_id: CoreId) -> bool {
		self.0.get_bit(core_id as usize)
	}

	pub fn insert(&mut self, core_id: CoreId) {
		self.0.set_bit(core_id as usize, true);
	}

	pub fn remove(&mut self, core_id: CoreId) {
		self.0.set_bit(core_id as usize, false);
	}

	#[inline]
	pub fn is_empty(&self) -> bool {
		self.0 == 0
	}
}

impl fmt::Debug for CoreSet {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "CoreSet({:#b})", self.0)
	}
}

/// A lightweight, copyable reference to a task.
#[derive(Copy, Clone, Debug)]
pub struct TaskHandle {
	id: TaskId,
	priority: Priority,
	#[cfg(feature = "smp")]
	core_id: CoreId,
}

impl TaskHandle {
	pub fn new(id: TaskId, priority: Priority, #[cfg(feature = "smp")] core_id: CoreId) -> Self {
		Self {
			id,
			priority,
			#[cfg(feature = "smp")]
			core_id,
		}
	}

	#[cfg(feature = "smp")]
	pub fn get_core_id(&self) -> CoreId {
		self.core_id
	}

	pub fn get_id(&self) -> TaskId {
		self.id
	}

	pub fn get_priority(&self) -> Priority {
		self.priority
	}
}

impl Ord for TaskHandle {
	fn cmp(&self, other: &Self) -> core::cmp::Ordering {
		self.id.cmp(&other.id)
	}
}

impl PartialOrd for TaskHandle {
	fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
		Some(self.cmp(other))
	}
}

impl PartialEq for TaskHandle {
	fn eq(&self, other: &Self) -> bool {
		self.id == other.id
	}
}

impl Eq for TaskHandle {}

/// A task control block
pub struct Task {
	/// The ID of this context
	pub id: TaskId,
	/// Status of a task, e.g. if the task is ready or running
	pub status: TaskStatus,
	/// Task priority,
	pub prio: Priority,
	/// ID of the core this task is running or assigned on.
	///
	/// Meaningful only while `status` is `Running` or `Assigned`.
	pub core_id: CoreId,
	/// Set of cores this task may be dispatched on
	pub affinity: CoreSet,
	/// Scheduling-relevant flag bits
	pub flags: TaskFlags,
	/// Scheduler-lock nesting depth; positive while this task forbids dispatch
	pub lock_count: u32,
	/// IRQ-lock nesting depth
	pub irq_count: u32,
}

impl Task {
	pub fn new(id: TaskId, prio: Priority, affinity: CoreSet) -> Task {
		debug!("Creating new task {id} with priority {prio}");

		Task {
			id,
			status: TaskStatus::Invalid,
			prio,
			core_id: 0,
			affinity,
			flags: TaskFlags::empty(),
			lock_count: 0,
			irq_count: 0,
		}
	}

	/// Creates the idle task of `core_id`. It is born running and never leaves its core.
	pub fn new_idle(id: TaskId, core_id: CoreId) -> Task {
		debug!("Creating idle task {id} for core {core_id}");

		Task {
			id,
			status: TaskStatus::Running,
			prio: IDLE_PRIO,
			core_id,
			affinity: CoreSet::single(core_id),
			flags: TaskFlags::CORE_PINNED,
			lock_count: 0,
			irq_count: 0,
		}
	}

	#[inline]
	pub fn is_pinned(&self) -> bool {
		self.flags.contains(TaskFlags::CORE_PINNED)
	}

	pub fn handle(&self) -> TaskHandle {
		TaskHandle::new(
			self.id,
			self.prio,
			#[cfg(feature = "smp")]
			self.core_id,
		)
	}
}

/// Realize a priority queue for tasks
///
/// Tasks are ordered by descending priority; among tasks of equal priority
/// the queue is FIFO. The head of a dispatch queue is the task currently
/// executing on the queue's core.
pub struct PriorityTaskQueue {
	queues: [LinkedList<Rc<RefCell<Task>>>; NO_PRIORITIES],
	prio_bitmap: u64,
}

impl PriorityTaskQueue {
	/// Creates an empty priority queue for tasks
	pub const fn new() -> PriorityTaskQueue {
		const EMPTY_LIST: LinkedList<Rc<RefCell<Task>>> = LinkedList::new();
		PriorityTaskQueue {
			queues: [EMPTY_LIST; NO_PRIORITIES],
			prio_bitmap: 0,
		}
	}

	/// Add a task by its priority to the queue.
	///
	/// A task with the same priority as an already queued one is placed
	/// behind it. Returns `true` iff the new task became the queue head.
	pub fn push(&mut self, task: Rc<RefCell<Task>>) -> bool {
		let i = task.borrow().prio.into() as usize;
		debug_assert!(i < NO_PRIORITIES, "Priority {i} is too high");

		let new_head = match msb(self.prio_bitmap) {
			Some(m) => i as u32 > m,
			None => true,
		};

		self.prio_bitmap |= 1 << i;
		self.queues[i].push_back(task);

		new_head
	}

	/// The task at the front of the queue, i.e. the one with the highest priority.
	pub fn head(&self) -> Option<Rc<RefCell<Task>>> {
		let i = msb(self.prio_bitmap)?;
		self.queues[i as usize].front().cloned()
	}

	fn pop_from_queue(&mut self, queue_index: usize) -> Option<Rc<RefCell<Task>>> {
		let task = self.queues[queue_index].pop_front();
		if self.queues[queue_index].is_empty() {
			self.prio_bitmap &= !(1 << queue_index as u64);
		}

		task
	}

	/// Pop the task with the highest priority from the queue
	pub fn pop(&mut self) -> Option<Rc<RefCell<Task>>> {
		if let Some(i) = msb(self.prio_bitmap) {
			return self.pop_from_queue(i as usize);
		}

		None
	}

	/// Remove a specific task from the priority queue.
	///
	/// Returns `true` if the task was linked here.
	pub fn remove(&mut self, task: &Rc<RefCell<Task>>) -> bool {
		let queue_index = task.borrow().prio.into() as usize;
		debug_assert!(
			queue_index < NO_PRIORITIES,
			"Priority {queue_index} is too high"
		);

		let queue = &mut self.queues[queue_index];
		let Some(task_index) = queue.iter().position(|queued| Rc::ptr_eq(queued, task)) else {
			return false;
		};

		// Calling remove is unstable: https://github.com/rust-lang/rust/issues/69210
		let mut split_list = queue.split_off(task_index);
		split_list.pop_front();
		queue.append(&mut split_list);
		if queue.is_empty() {
			self.prio_bitmap &= !(1 << queue_index as u64);
		}

		true
	}

	/// Returns true if the queue is empty.
	pub fn is_empty(&self) -> bool {
		self.prio_bitmap == 0
	}

	/// Checks if the given task is linked into this queue.
	pub fn contains(&self, task: &Rc<RefCell<Task>>) -> bool {
		self.iter().any(|queued| Rc::ptr_eq(queued, task))
	}

	/// Number of queued tasks.
	pub fn len(&self) -> usize {
		self.queues.iter().map(LinkedList::len).sum()
	}

	/// Iterates all tasks in queue order: descending priority, FIFO among equals.
	pub fn iter(&self) -> impl Iterator<Item = &Rc<RefCell<Task>>> {
		self.queues.iter().rev().flat_map(|queue| queue.iter())
	}
}
