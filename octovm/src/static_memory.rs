use fxhash::FxHashMap;

use crate::heap::{Heap, HeapId};
use crate::value::Value;

/// An append-only constant pool, addressed by 16-bit index, populated at
/// load time by the `STORE_STATIC_*` opcodes.
///
/// String constants are interned: storing the same UTF-8 byte sequence
/// twice yields the same underlying [`HeapId`] (the dedup map below), even
/// though each occurrence still appends its own static-memory slot, since
/// each `STORE_STATIC_STRING` is an independent producer-visible constant.
#[derive(Debug, Default)]
pub struct StaticMemory {
	entries: Vec<Value>,
	interned_strings: FxHashMap<Box<str>, HeapId>,
}

impl StaticMemory {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn store(&mut self, value: Value) -> u16 {
		let index = self.entries.len();
		self.entries.push(value);
		index as u16
	}

	/// `STORE_STATIC_STRING`: intern `s` in `heap` and append a `HeapRef`
	/// slot referencing it. Heap objects created here are ordinary heap
	/// objects (not a second, never-swept ownership domain) — they're simply
	/// always reachable as mark roots, so a sweep never actually reclaims
	/// them.
	pub fn store_string(&mut self, heap: &mut Heap, s: &str) -> u16 {
		let id = match self.interned_strings.get(s) {
			Some(&id) => id,
			None => {
				let id = heap.alloc_string(s);
				self.interned_strings.insert(Box::from(s), id);
				id
			},
		};
		self.store(Value::HeapRef(Some(id)))
	}

	pub fn get(&self, index: u16) -> Option<&Value> {
		self.entries.get(index as usize)
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	pub fn iter(&self) -> impl Iterator<Item = &Value> {
		self.entries.iter()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::heap::HeapPayload;

	#[test]
	fn store_string_interns_identical_bytes_to_one_object() {
		let mut heap = Heap::new();
		let mut statics = StaticMemory::new();

		let first = statics.store_string(&mut heap, "hi");
		let second = statics.store_string(&mut heap, "hi");

		assert_ne!(first, second, "each occurrence still gets its own static slot");
		let Value::HeapRef(Some(a)) = *statics.get(first).unwrap() else { panic!() };
		let Value::HeapRef(Some(b)) = *statics.get(second).unwrap() else { panic!() };
		assert_eq!(a, b, "identical byte sequences intern to the same heap object");
		assert_eq!(heap.object_count(), 1);
	}

	#[test]
	fn string_roundtrips_verbatim() {
		let mut heap = Heap::new();
		let mut statics = StaticMemory::new();
		let index = statics.store_string(&mut heap, "hello, world");
		let Value::HeapRef(Some(id)) = *statics.get(index).unwrap() else { panic!() };
		assert_eq!(heap.payload(id).and_then(HeapPayload::as_str), Some("hello, world"));
	}
}
