//! A register-based virtual machine for a compact bytecode format: tagged
//! numeric/boolean/heap-reference/function/address values, eight general
//! purpose registers plus a three-state comparison-flags word, an operand
//! stack, a mark-sweep heap, and an append-only static constant pool.
//!
//! The crate is a library only — it never touches a filesystem, a process
//! exit code, or standard output directly. An embedding host constructs a
//! [`BytecodeStream`] over whatever bytes it has (a file it read, a
//! memory-mapped region, an in-memory buffer), supplies an [`EchoSink`] for
//! `ECHO`/`ECHO_NEWLINE` to write through, and drives a [`VM`] to completion.

mod bytecode;
mod echo;
mod error;
mod heap;
mod opcode;
mod registers;
mod stack;
mod static_memory;
mod value;
mod vm;

pub use bytecode::{BytecodeStream, FromByteStream};
pub use echo::EchoSink;
pub use error::{ArithmeticOp, LoadError, RuntimeError};
pub use heap::{Heap, HeapId, HeapPayload};
pub use opcode::Opcode;
pub use registers::{Flags, Registers, REGISTER_COUNT};
pub use stack::Stack;
pub use static_memory::StaticMemory;
pub use value::{FunctionDescriptor, Tag, Value};
pub use vm::VM;
