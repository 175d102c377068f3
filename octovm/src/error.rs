use std::fmt::{self, Display, Formatter};

/// The complete runtime-error taxonomy. Every variant renders to exactly the
/// user-visible text the fail-stop protocol prints (`runtime error: <Display>`);
/// the wording is contractual, not cosmetic, since scenario tests match it
/// verbatim.
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeError {
	/// `AsI64`/`AsF64` called on a value outside the four numeric tags.
	NoConversion { from: &'static str, to: &'static str },
	/// `CALL` where the callee's declared arity doesn't match `argc`.
	WrongArity { expected: u8, received: u8 },
	/// `CALL` with more than eight arguments.
	TooManyArguments,
	/// `CALL` on a register that doesn't hold a `Function`.
	NotInvocable { type_name: &'static str },
	/// `CMP` between operand tags with no defined ordering.
	NotComparable { lhs: &'static str, rhs: &'static str },
	/// `CMPZ` on a tag with no defined notion of zero.
	NotNonzeroTestable { type_name: &'static str },
	/// `ADD`/`SUB`/`MUL` between operand tags with no defined arithmetic.
	ArithmeticTypeMismatch { op: ArithmeticOp, lhs: &'static str, rhs: &'static str },
	/// A register that must hold an `Address` (`JMP`/`JE`/`JNE`/`JG`/`JGE`)
	/// holds something else.
	NotAnAddress { type_name: &'static str },
	/// The fetched opcode byte has no handler.
	UnknownInstruction { opcode: u8, location: u32 },
	/// `POP`, or an indexed read, past the stack pointer.
	StackUnderflow,
	/// A register index outside `0..8`.
	InvalidRegister(u8),
	/// A `LOAD_STATIC` index past the end of static memory.
	InvalidStaticIndex(u16),
	/// The echo sink reported an I/O failure.
	EchoFailed(String),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ArithmeticOp {
	Add,
	Sub,
	Mul,
}

impl ArithmeticOp {
	fn verb(self) -> &'static str {
		match self {
			ArithmeticOp::Add => "add",
			ArithmeticOp::Sub => "subtract",
			ArithmeticOp::Mul => "multiply",
		}
	}
}

impl Display for RuntimeError {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		match self {
			RuntimeError::NoConversion { from, to } => write!(f, "no conversion from '{from}' to '{to}'"),
			RuntimeError::WrongArity { expected, received } => {
				write!(f, "expected {expected} parameters, received {received}")
			},
			RuntimeError::TooManyArguments => write!(f, "maximum number of arguments exceeded"),
			RuntimeError::NotInvocable { type_name } => write!(f, "cannot invoke type '{type_name}' as a function"),
			RuntimeError::NotComparable { lhs, rhs } => write!(f, "cannot compare '{lhs}' with '{rhs}'"),
			RuntimeError::NotNonzeroTestable { type_name } => {
				write!(f, "cannot determine if type '{type_name}' is nonzero")
			},
			RuntimeError::ArithmeticTypeMismatch { op, lhs, rhs } => {
				write!(f, "cannot {} types '{}' and '{}'", op.verb(), lhs, rhs)
			},
			RuntimeError::NotAnAddress { type_name } => write!(f, "cannot jump to type '{type_name}'"),
			RuntimeError::UnknownInstruction { opcode, location } => {
				write!(f, "unknown instruction '{opcode}' referenced at location: 0x{location:08x}")
			},
			RuntimeError::StackUnderflow => write!(f, "stack underflow"),
			RuntimeError::InvalidRegister(index) => write!(f, "invalid register '{index}'"),
			RuntimeError::InvalidStaticIndex(index) => write!(f, "invalid static memory index '{index}'"),
			RuntimeError::EchoFailed(message) => write!(f, "{message}"),
		}
	}
}

impl std::error::Error for RuntimeError {}

/// Errors that can occur before a single instruction has been dispatched —
/// distinct from [`RuntimeError`], which is the in-VM, fail-stop taxonomy.
/// Loading a bytecode file that doesn't exist, for instance, never reaches
/// the VM at all.
#[derive(Debug)]
pub enum LoadError {
	Io(std::io::Error),
}

impl From<std::io::Error> for LoadError {
	fn from(value: std::io::Error) -> Self {
		Self::Io(value)
	}
}

impl Display for LoadError {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		match self {
			LoadError::Io(err) => write!(f, "{err}"),
		}
	}
}

impl std::error::Error for LoadError {
	fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
		match self {
			LoadError::Io(err) => Some(err),
		}
	}
}
