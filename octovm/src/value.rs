use std::fmt::{self, Display, Formatter};

use crate::error::RuntimeError;
use crate::heap::HeapId;

/// Ordinal ordering used by arithmetic result-type promotion: `I32 < I64 <
/// F32 < F64 < Bool < HeapRef < Function < Address`. Only the first four
/// orderings matter for promotion; the rest exist so the ordering is total
/// and stable.
#[derive(Debug, Copy, Clone, Eq, PartialEq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Tag {
	I32,
	I64,
	F32,
	F64,
	Bool,
	HeapRef,
	Function,
	Address,
}

/// `(address, arity)` — the pair a `CALL` validates against and jumps to.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FunctionDescriptor {
	pub address: u32,
	pub arity: u8,
}

/// The VM's single value representation: a tagged sum with exactly one
/// active payload per tag, copied by value on every push/pop/register move.
#[derive(Debug, Copy, Clone)]
pub enum Value {
	I32(i32),
	I64(i64),
	F32(f32),
	F64(f64),
	Bool(bool),
	/// `None` is the distinguished null reference.
	HeapRef(Option<HeapId>),
	Function(FunctionDescriptor),
	/// An absolute bytecode offset, as loaded via `STORE_STATIC_ADDRESS`.
	Address(u32),
}

impl Value {
	pub fn tag(&self) -> Tag {
		match self {
			Value::I32(_) => Tag::I32,
			Value::I64(_) => Tag::I64,
			Value::F32(_) => Tag::F32,
			Value::F64(_) => Tag::F64,
			Value::Bool(_) => Tag::Bool,
			Value::HeapRef(_) => Tag::HeapRef,
			Value::Function(_) => Tag::Function,
			Value::Address(_) => Tag::Address,
		}
	}

	/// Stable, contractual strings used in error messages. Case and spelling
	/// matter: scenario tests match these literally.
	pub fn type_name(&self) -> &'static str {
		match self {
			Value::I32(_) => "int32",
			Value::I64(_) => "int64",
			Value::F32(_) => "float",
			Value::F64(_) => "double",
			Value::Bool(_) => "boolean",
			Value::HeapRef(_) => "reference",
			Value::Function(_) => "function",
			Value::Address(_) => "undefined",
		}
	}

	/// Widens/truncates a numeric value to `i64`. Floats truncate via a
	/// C-style cast (`as i64`), not round-to-nearest. Defined only for the
	/// four numeric tags; anything else is a conversion error.
	pub fn as_i64(&self) -> Result<i64, RuntimeError> {
		match *self {
			Value::I32(v) => Ok(v as i64),
			Value::I64(v) => Ok(v),
			Value::F32(v) => Ok(v as i64),
			Value::F64(v) => Ok(v as i64),
			_ => Err(RuntimeError::NoConversion { from: self.type_name(), to: "Int64" }),
		}
	}

	/// Widens a numeric value to `f64` exactly. Defined only for the four
	/// numeric tags; anything else is a conversion error.
	pub fn as_f64(&self) -> Result<f64, RuntimeError> {
		match *self {
			Value::I32(v) => Ok(v as f64),
			Value::I64(v) => Ok(v as f64),
			Value::F32(v) => Ok(v as f64),
			Value::F64(v) => Ok(v),
			_ => Err(RuntimeError::NoConversion { from: self.type_name(), to: "Double" }),
		}
	}

	pub fn is_integral_or_bool(&self) -> bool {
		matches!(self, Value::I32(_) | Value::I64(_) | Value::Bool(_))
	}

	pub fn is_floating(&self) -> bool {
		matches!(self, Value::F32(_) | Value::F64(_))
	}

	pub fn is_heap_ref(&self) -> bool {
		matches!(self, Value::HeapRef(_))
	}

	pub fn is_function(&self) -> bool {
		matches!(self, Value::Function(_))
	}

	/// `CMP`'s "compare as i64" path also accepts booleans (`false = 0, true
	/// = 1`), unlike the public `AsI64` contract in the host-facing API.
	pub(crate) fn as_i64_with_bool(&self) -> Result<i64, RuntimeError> {
		match *self {
			Value::Bool(b) => Ok(b as i64),
			_ => self.as_i64(),
		}
	}

	/// Numeric zero, or a null reference. Functions are never "zero".
	pub(crate) fn is_nonzero_testable_zero(&self) -> Result<bool, RuntimeError> {
		match self {
			Value::I32(v) => Ok(*v == 0),
			Value::I64(v) => Ok(*v == 0),
			Value::F32(v) => Ok(*v == 0.0),
			Value::F64(v) => Ok(*v == 0.0),
			Value::Bool(b) => Ok(!*b),
			Value::HeapRef(r) => Ok(r.is_none()),
			Value::Function(_) => Ok(false),
			Value::Address(_) => Err(RuntimeError::NotNonzeroTestable { type_name: self.type_name() }),
		}
	}
}

impl Display for Tag {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		fmt::Debug::fmt(self, f)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn numeric_tag_promotion_order() {
		assert!(Tag::I32 < Tag::I64);
		assert!(Tag::I64 < Tag::F32);
		assert!(Tag::F32 < Tag::F64);
	}

	#[test]
	fn type_names_match_contract() {
		assert_eq!(Value::I32(0).type_name(), "int32");
		assert_eq!(Value::I64(0).type_name(), "int64");
		assert_eq!(Value::F32(0.0).type_name(), "float");
		assert_eq!(Value::F64(0.0).type_name(), "double");
		assert_eq!(Value::Bool(true).type_name(), "boolean");
		assert_eq!(Value::HeapRef(None).type_name(), "reference");
		assert_eq!(Value::Function(FunctionDescriptor { address: 0, arity: 0 }).type_name(), "function");
		assert_eq!(Value::Address(0).type_name(), "undefined");
	}

	#[test]
	fn as_i64_truncates_floats() {
		assert_eq!(Value::F64(3.9).as_i64().unwrap(), 3);
		assert_eq!(Value::F64(-3.9).as_i64().unwrap(), -3);
	}

	#[test]
	fn as_i64_rejects_non_numeric() {
		let err = Value::Bool(true).as_i64().unwrap_err();
		assert_eq!(err, RuntimeError::NoConversion { from: "boolean", to: "Int64" });
	}

	#[test]
	fn negative_zero_double_is_zero() {
		assert!(Value::F64(-0.0).is_nonzero_testable_zero().unwrap());
	}
}
