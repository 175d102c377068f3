use paste::paste;

use crate::error::RuntimeError;
use crate::value::Value;

pub const REGISTER_COUNT: usize = 8;

/// The three-state comparison-flags word set by `CMP`/`CMPZ` and read by the
/// conditional jumps. Deliberately not a bitflags set: these are mutually
/// exclusive observable states, never an OR of bits (there is no `LESS`
/// state — the producer must swap operands to encode less-than).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum Flags {
	#[default]
	None,
	Equal,
	Greater,
}

macro_rules! define_register_accessors {
	($($index:literal),*) => {
		paste! {
			impl Registers {
				$(
					#[doc = concat!("Direct accessor for `r", $index, "`.")]
					#[inline]
					pub fn [<r $index>](&self) -> Value {
						self.slots[$index]
					}

					#[doc = concat!("Direct mutator for `r", $index, "`.")]
					#[inline]
					pub fn [<set_r $index>](&mut self, value: Value) {
						self.slots[$index] = value;
					}
				)*
			}
		}
	};
}

/// Eight addressable [`Value`] slots (`r0..r7`) plus the comparison-flags
/// word — a ninth, conceptually separate, register.
#[derive(Debug, Copy, Clone)]
pub struct Registers {
	slots: [Value; REGISTER_COUNT],
	pub flags: Flags,
}

define_register_accessors!(0, 1, 2, 3, 4, 5, 6, 7);

impl Registers {
	pub fn new() -> Self {
		Self { slots: [Value::I32(0); REGISTER_COUNT], flags: Flags::None }
	}

	/// Bytecode addresses registers by a raw 1-byte index; only `0..8` is
	/// valid (the producer's contract), but an out-of-range index is
	/// reported rather than indexing out of bounds.
	pub fn get(&self, index: u8) -> Result<Value, RuntimeError> {
		self.slots.get(index as usize).copied().ok_or(RuntimeError::InvalidRegister(index))
	}

	pub fn set(&mut self, index: u8, value: Value) -> Result<(), RuntimeError> {
		let slot = self.slots.get_mut(index as usize).ok_or(RuntimeError::InvalidRegister(index))?;
		*slot = value;
		Ok(())
	}

	pub fn iter(&self) -> impl Iterator<Item = &Value> {
		self.slots.iter()
	}
}

impl Default for Registers {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn named_accessors_match_indexed_access() {
		let mut regs = Registers::new();
		regs.set(3, Value::I32(99)).unwrap();
		match regs.r3() {
			Value::I32(v) => assert_eq!(v, 99),
			other => panic!("unexpected {other:?}"),
		}
	}

	#[test]
	fn out_of_range_register_is_an_error() {
		let regs = Registers::new();
		assert_eq!(regs.get(8).unwrap_err(), RuntimeError::InvalidRegister(8));
	}

	#[test]
	fn flags_default_to_none() {
		assert_eq!(Registers::new().flags, Flags::None);
	}
}
