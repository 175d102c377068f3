use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use octovm::{BytecodeStream, LoadError, VM};
use tracing_subscriber::EnvFilter;

/// Loads a bytecode file and runs it on octovm.
#[derive(Parser)]
#[command(version, about)]
struct Args {
	/// Bytecode file to execute.
	#[arg(default_value = "bytecode.bin")]
	path: PathBuf,

	/// Increase log verbosity (-v, -vv). Overridden by `RUST_LOG` if set.
	#[arg(short, long, action = clap::ArgAction::Count)]
	verbose: u8,
}

fn setup_tracing(verbose: u8) {
	let default_directive = match verbose {
		0 => "warn",
		1 => "info",
		_ => "debug",
	};
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
	tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

#[cfg(feature = "mmap")]
fn read_bytecode(path: &Path) -> Result<BytecodeStream, LoadError> {
	let file = std::fs::File::open(path)?;
	// SAFETY: the file is not concurrently truncated by another process for
	// the lifetime of this mapping; this binary holds the only handle to it.
	let map = unsafe { memmap2::Mmap::map(&file)? };
	// `BytecodeStream` wraps the mapping directly: no copy of the file's
	// bytes into a fresh `Vec`, which is the entire point of mapping it.
	Ok(BytecodeStream::new(map))
}

#[cfg(not(feature = "mmap"))]
fn read_bytecode(path: &Path) -> Result<BytecodeStream, LoadError> {
	let bytes = std::fs::read(path)?;
	Ok(BytecodeStream::new(bytes))
}

fn main() -> ExitCode {
	let args = Args::parse();
	setup_tracing(args.verbose);

	let stream = match read_bytecode(&args.path) {
		Ok(stream) => stream,
		Err(err) => {
			eprintln!("failed to read {}: {err}", args.path.display());
			return ExitCode::FAILURE;
		},
	};

	tracing::info!(path = %args.path.display(), bytes = stream.size(), "loaded bytecode");

	let mut vm = VM::new(stream, io::stdout());
	vm.execute();
	let _ = io::stdout().flush();

	ExitCode::SUCCESS
}
