//! Annotated disassembly of 32-bit PPC and i386 Mach-O executables.
//!
//! A [`processor::Processor`] loads an image, pairs the symbolic and plain
//! listings produced for each text section, and runs a register simulator
//! over every function to comment loads, calls and Objective-C message
//! sends. The [`deobfuscate`] module finds and patches anti-disassembly
//! NOP sequences.

pub mod arch;
pub mod command;
pub mod comments;
pub mod demangle;
pub mod deobfuscate;
pub mod disasm;
pub mod error;
pub mod fat;
pub mod header;
pub mod helpers;
pub mod lines;
pub mod machine;
pub mod macho;
pub mod objc;
pub mod options;
pub mod output;
pub mod processor;
pub mod progress;
pub mod search;
pub mod sections;
pub mod state;
pub mod syscalls;

pub use error::{ProcessError, ProcessResult};
pub use machine::Arch;
pub use macho::MachO;
pub use options::{LineChoicePolicy, ProcOptions};
pub use processor::Processor;
