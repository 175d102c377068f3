use std::fmt::Write as _;
use std::io;

use crate::heap::{Heap, HeapId, HeapPayload};
use crate::value::Value;

/// The abstract character-output collaborator `ECHO`/`ECHO_NEWLINE` write
/// through. The core never hardcodes standard output; the embedding host
/// supplies a concrete sink (the reference CLI writes to stdout).
///
/// Blanket-implemented for anything that's already [`io::Write`], so a host
/// can hand the VM a `Vec<u8>`, a file, or stdout directly.
pub trait EchoSink {
	fn write_echo(&mut self, text: &str) -> io::Result<()>;
}

impl<W: io::Write> EchoSink for W {
	fn write_echo(&mut self, text: &str) -> io::Result<()> {
		self.write_all(text.as_bytes())
	}
}

/// Renders `value` exactly as `ECHO` must print it, appending to `out`.
///
/// - Numeric tags: native decimal formatting.
/// - `Bool`: `true`/`false`.
/// - `HeapRef`: `null` if absent; the UTF-8 bytes verbatim if the referenced
///   payload is a string; otherwise `reference<0xADDR>`.
/// - `Function`: `function<ADDRESSu, ARITYu>`.
/// - `Address`: `address<VALUEu>`.
pub(crate) fn format_value(value: &Value, heap: &Heap, out: &mut String) {
	match value {
		Value::I32(v) => {
			let _ = write!(out, "{v}");
		},
		Value::I64(v) => {
			let _ = write!(out, "{v}");
		},
		Value::F32(v) => {
			let _ = write!(out, "{v}");
		},
		Value::F64(v) => {
			let _ = write!(out, "{v}");
		},
		Value::Bool(v) => {
			let _ = write!(out, "{v}");
		},
		Value::HeapRef(None) => out.push_str("null"),
		Value::HeapRef(Some(id)) => format_heap_ref(*id, heap, out),
		Value::Function(descriptor) => {
			let _ = write!(out, "function<{}u, {}u>", descriptor.address, descriptor.arity);
		},
		Value::Address(address) => {
			let _ = write!(out, "address<{address}u>");
		},
	}
}

fn format_heap_ref(id: HeapId, heap: &Heap, out: &mut String) {
	match heap.payload(id).and_then(HeapPayload::as_str) {
		Some(s) => out.push_str(s),
		None => {
			let _ = write!(out, "reference<{:#x}>", id.raw());
		},
	}
}
