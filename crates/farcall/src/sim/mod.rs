//! # Simulated Target
//!
//! A complete in-memory target process: sparse memory, loadable images with
//! native exports, remote threads, worker threads, and an assembler whose
//! "machine code" is a small bytecode the simulated threads interpret.
//!
//! It implements every collaborator trait, so a [`Process`](crate::Process)
//! attached to it runs the real call protocol end to end.
//!
//! ```rust,no_run
//! use farcall::sim::{SimModule, SimProcess, SimValue};
//! use farcall::Bitness;
//!
//! let target = SimProcess::new(Bitness::X64);
//! target.load(SimModule::new("lib.dll").export("Add", |f| {
//!     Ok(SimValue::Int(f.i32(0)?.wrapping_add(f.i32(1)?) as u32 as u64))
//! })).unwrap();
//! let process = target.attach().unwrap();
//! ```

pub mod asm;
pub mod isa;
pub mod memory;
pub mod module;
pub mod process;

pub use asm::SimAsmFactory;
pub use asm::SimAssembler;
pub use memory::SimMemory;
pub use module::NativeFn;
pub use module::SimArg;
pub use module::SimFrame;
pub use module::SimModule;
pub use module::SimValue;
pub use process::SimProcess;
