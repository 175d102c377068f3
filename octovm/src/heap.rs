use std::fmt::{self, Debug, Formatter};

use bitflags::bitflags;
use derivative::Derivative;

bitflags! {
	/// Per-object GC bits. Only one flag exists today; this mirrors the
	/// source VM's `HeapValueFlags { GC_MARKED = 0x01 }` rather than a plain
	/// `bool`, so a future flag (e.g. pinned) is an additive change.
	#[derive(Debug, Copy, Clone, Eq, PartialEq)]
	struct SlotFlags: u8 {
		const MARKED = 0x01;
	}
}

/// A non-owning identifier for a [`HeapObject`]. Stable across the object's
/// lifetime; never reused for a different object even if the underlying slot
/// is recycled after a sweep (the generation counter changes).
///
/// `Ord` compares by slot index, giving a stable "address order" for `CMP`
/// without exposing a real pointer.
#[derive(Debug, Copy, Clone, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct HeapId {
	index: u32,
	generation: u32,
}

impl HeapId {
	/// Opaque identity, for display purposes only (`ECHO`'s
	/// `reference<0xADDR>` rendering of a non-string payload).
	pub fn raw(&self) -> u64 {
		((self.generation as u64) << 32) | self.index as u64
	}
}

/// The closed universe of payload kinds a [`HeapObject`] can hold. The
/// discriminant *is* the type tag; there is no separate runtime type-info
/// lookup. Adding a new heap-allocated kind (array, object, ...) is a local
/// change here plus to whatever the mark phase needs to recurse into it.
#[derive(Debug, Clone, PartialEq)]
pub enum HeapPayload {
	String(Box<str>),
}

impl HeapPayload {
	pub fn as_str(&self) -> Option<&str> {
		match self {
			HeapPayload::String(s) => Some(s),
		}
	}
}

struct Slot {
	generation: u32,
	state: SlotState,
}

enum SlotState {
	Free { next_free: Option<u32> },
	Occupied { payload: HeapPayload, flags: SlotFlags, prev: Option<u32>, next: Option<u32> },
}

/// A pool of boxed, typed heap payloads linked in insertion order, collected
/// by mark-sweep.
///
/// The mark phase is *not* the heap's job: `sweep` only frees whatever is
/// unmarked at the time it's called. The caller (`VM::collect_garbage`) is
/// responsible for walking its roots and calling [`Heap::mark`] first.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Heap {
	#[derivative(Debug = "ignore")]
	slots: Vec<Slot>,
	head: Option<u32>,
	free_head: Option<u32>,
	object_count: usize,
}

impl Heap {
	pub fn new() -> Self {
		Self { slots: Vec::new(), head: None, free_head: None, object_count: 0 }
	}

	pub fn object_count(&self) -> usize {
		self.object_count
	}

	/// Links a new, unmarked node at the list head and returns its identity.
	fn alloc(&mut self, payload: HeapPayload) -> HeapId {
		let next = self.head;

		let index = if let Some(free_index) = self.free_head {
			let slot = &mut self.slots[free_index as usize];
			let SlotState::Free { next_free } = slot.state else {
				unreachable!("free list must only reference free slots")
			};
			self.free_head = next_free;
			slot.generation = slot.generation.wrapping_add(1);
			slot.state = SlotState::Occupied { payload, flags: SlotFlags::empty(), prev: None, next };
			free_index
		} else {
			let index = self.slots.len() as u32;
			self.slots.push(Slot {
				generation: 0,
				state: SlotState::Occupied { payload, flags: SlotFlags::empty(), prev: None, next },
			});
			index
		};

		if let Some(next_index) = next {
			if let SlotState::Occupied { prev, .. } = &mut self.slots[next_index as usize].state {
				*prev = Some(index);
			}
		}

		self.head = Some(index);
		self.object_count += 1;
		HeapId { index, generation: self.slots[index as usize].generation }
	}

	/// `STORE_STATIC_STRING` (and any future allocating instruction that
	/// wants a string payload) goes through here.
	pub fn alloc_string(&mut self, value: impl Into<Box<str>>) -> HeapId {
		self.alloc(HeapPayload::String(value.into()))
	}

	pub fn payload(&self, id: HeapId) -> Option<&HeapPayload> {
		let slot = self.slots.get(id.index as usize)?;
		if slot.generation != id.generation {
			return None;
		}
		match &slot.state {
			SlotState::Occupied { payload, .. } => Some(payload),
			SlotState::Free { .. } => None,
		}
	}

	pub fn mark(&mut self, id: HeapId) {
		if let Some(slot) = self.slots.get_mut(id.index as usize) {
			if slot.generation == id.generation {
				if let SlotState::Occupied { flags, .. } = &mut slot.state {
					flags.insert(SlotFlags::MARKED);
				}
			}
		}
	}

	pub fn is_marked(&self, id: HeapId) -> bool {
		match self.slots.get(id.index as usize) {
			Some(slot) if slot.generation == id.generation => match &slot.state {
				SlotState::Occupied { flags, .. } => flags.contains(SlotFlags::MARKED),
				SlotState::Free { .. } => false,
			},
			_ => false,
		}
	}

	/// Clears the mark bit on every live object. Callers that re-mark from
	/// roots each collection cycle call this first; `sweep` itself never
	/// touches a survivor's mark bit, so a bare repeated `sweep()` with no
	/// intervening `unmark_all`/mark pass is a true no-op.
	pub fn unmark_all(&mut self) {
		let mut current = self.head;
		while let Some(index) = current {
			let idx = index as usize;
			match &mut self.slots[idx].state {
				SlotState::Occupied { flags, next, .. } => {
					flags.remove(SlotFlags::MARKED);
					current = *next;
				},
				SlotState::Free { .. } => unreachable!("linked list must only contain occupied slots"),
			}
		}
	}

	/// Single pass: unlink and free every object whose mark bit is clear.
	/// Leaves survivors' mark bits untouched — unmarking is the caller's job
	/// (see [`Heap::unmark_all`]) so that calling `sweep` twice with no
	/// intervening allocation or mark change is equivalent to calling it
	/// once.
	#[cfg_attr(feature = "tracing", tracing::instrument(skip_all))]
	pub fn sweep(&mut self) {
		let mut current = self.head;
		let mut collected = 0usize;

		while let Some(index) = current {
			let idx = index as usize;
			let (next, prev, marked) = match &self.slots[idx].state {
				SlotState::Occupied { flags, prev, next, .. } => (*next, *prev, flags.contains(SlotFlags::MARKED)),
				SlotState::Free { .. } => unreachable!("linked list must only contain occupied slots"),
			};

			if !marked {
				self.unlink(idx, prev, next);
				self.slots[idx].state = SlotState::Free { next_free: self.free_head };
				self.free_head = Some(index);
				self.object_count -= 1;
				collected += 1;
			}

			current = next;
		}

		#[cfg(feature = "tracing")]
		tracing::debug!(collected, survivors = self.object_count, "heap swept");
		#[cfg(not(feature = "tracing"))]
		let _ = collected;
	}

	fn unlink(&mut self, idx: usize, prev: Option<u32>, next: Option<u32>) {
		match prev {
			Some(p) => {
				if let SlotState::Occupied { next: n, .. } = &mut self.slots[p as usize].state {
					*n = next;
				}
			},
			None => self.head = next,
		}
		if let Some(n) = next {
			if let SlotState::Occupied { prev: pr, .. } = &mut self.slots[n as usize].state {
				*pr = prev;
			}
		}
	}

	/// Insertion order, newest-first, matching the underlying linked list.
	pub fn iter(&self) -> impl Iterator<Item = (HeapId, &HeapPayload)> {
		HeapIter { heap: self, current: self.head }
	}
}

impl Default for Heap {
	fn default() -> Self {
		Self::new()
	}
}

struct HeapIter<'h> {
	heap: &'h Heap,
	current: Option<u32>,
}

impl<'h> Iterator for HeapIter<'h> {
	type Item = (HeapId, &'h HeapPayload);

	fn next(&mut self) -> Option<Self::Item> {
		let index = self.current?;
		let slot = &self.heap.slots[index as usize];
		match &slot.state {
			SlotState::Occupied { payload, next, .. } => {
				self.current = *next;
				Some((HeapId { index, generation: slot.generation }, payload))
			},
			SlotState::Free { .. } => None,
		}
	}
}

impl Debug for HeapPayload {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		match self {
			HeapPayload::String(s) => write!(f, "String({s:?})"),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn alloc_roundtrips_payload() {
		let mut heap = Heap::new();
		let id = heap.alloc_string("hi");
		assert_eq!(heap.payload(id).and_then(HeapPayload::as_str), Some("hi"));
	}

	#[test]
	fn sweep_frees_unmarked_and_keeps_marked() {
		let mut heap = Heap::new();
		let kept = heap.alloc_string("kept");
		let dropped = heap.alloc_string("dropped");
		heap.mark(kept);

		heap.sweep();

		assert!(heap.payload(kept).is_some());
		assert!(heap.payload(dropped).is_none());
		assert_eq!(heap.object_count(), 1);
	}

	#[test]
	fn sweep_is_idempotent() {
		let mut heap = Heap::new();
		let kept = heap.alloc_string("kept");
		heap.mark(kept);
		heap.sweep();
		let count_after_first = heap.object_count();

		// No intervening allocation or mark change: `sweep` never clears a
		// survivor's mark bit on its own, so this second call must be a
		// true no-op rather than collecting `kept`.
		heap.sweep();

		assert_eq!(heap.object_count(), count_after_first);
		assert!(heap.payload(kept).is_some());
	}

	#[test]
	fn unmark_all_then_sweep_collects_objects_not_remarked() {
		let mut heap = Heap::new();
		let kept = heap.alloc_string("kept");
		heap.mark(kept);
		heap.sweep();

		// Simulates a second collection cycle: unmark everything, re-mark
		// only the roots still reachable, then sweep.
		heap.unmark_all();
		heap.mark(kept);
		heap.sweep();
		assert!(heap.payload(kept).is_some());

		heap.unmark_all();
		heap.sweep();
		assert!(heap.payload(kept).is_none());
	}

	#[test]
	fn stale_heap_id_does_not_alias_recycled_slot() {
		let mut heap = Heap::new();
		let first = heap.alloc_string("first");
		heap.sweep(); // unmarked, collected
		let second = heap.alloc_string("second"); // recycles the freed slot

		assert_ne!(first, second);
		assert!(heap.payload(first).is_none());
		assert_eq!(heap.payload(second).and_then(HeapPayload::as_str), Some("second"));
	}

	#[test]
	fn iter_yields_newest_first() {
		let mut heap = Heap::new();
		heap.alloc_string("a");
		heap.alloc_string("b");
		let names: Vec<_> = heap.iter().filter_map(|(_, p)| p.as_str()).collect();
		assert_eq!(names, vec!["b", "a"]);
	}
}
