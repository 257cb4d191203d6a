//! # farcall
//!
//! Call exported functions inside another, already attached process and read back
//! what they return.
//!
//! ## Architecture
//!
//! farcall owns the invocation protocol and nothing below it. Everything that
//! touches the target is a collaborator behind a trait:
//!
//! - **ProcessMemory / ProcessCore**: raw memory access, liveness and bitness
//! - **RemoteThreads**: run code in a new target thread or an existing one, and wait
//! - **AsmFactory / CallAssembler**: emit a calling-convention-correct call stub
//! - **ModuleProvider** (from [farmod]): scan loaded images, unmap them
//!
//! A [`Process`] ties one set of collaborators to one module registry.
//!
//! ## Protocol
//!
//! A remote call is a linear pipeline; each step fails with its own [`CallError`]:
//!
//! 1. validate the request
//! 2. resolve `module!symbol` through the registry
//! 3. pick an assembler for the target's bitness
//! 4. allocate the shared region and copy argument payloads into it
//! 5. lower the arguments and assemble the stub
//! 6. execute the stub and wait for its completion signal
//! 7. read the return value
//! 8. copy data-pointer buffers back to the caller
//!
//! ## Example
//!
//! ```rust,no_run
//! use farcall::{ArgValue, CallConv, RemoteCall, ReturnKind};
//!
//! # async fn example(process: &farcall::Process) -> Result<(), farcall::CallError> {
//! let mut args = [ArgValue::from(5i32), ArgValue::from(7i32)];
//! let mut out = [0u8; 4];
//!
//! RemoteCall::new("lib.dll", "Add")
//!     .convention(CallConv::Cdecl)
//!     .returns(ReturnKind::Int32)
//!     .invoke(process, &mut args, &mut out)
//!     .await?;
//!
//! assert_eq!(i32::from_le_bytes(out), 12);
//! # Ok(())
//! # }
//! ```
//!
//! The [`sim`] module provides a complete in-memory target for tests.

pub mod call;
pub mod error;
pub mod process;
pub mod rpc;
pub mod sim;
pub mod stub;
pub mod traits;

pub use call::CallOptions;
pub use call::ExecContext;
pub use call::PreparedCall;
pub use call::RemoteCall;
pub use error::CallError;
pub use error::ExecError;
pub use error::status;
pub use process::Process;
pub use stub::CallConv;
pub use stub::CallStub;
pub use stub::ReturnKind;
pub use stub::StubArg;
pub use traits::AsmFactory;
pub use traits::Bitness;
pub use traits::CallAssembler;
pub use traits::ProcessCore;
pub use traits::ProcessMemory;
pub use traits::Protection;
pub use traits::RemoteThreads;
pub use traits::ThreadId;

pub use farmod::ModuleProvider;
pub use farmod::ModuleRecord;
pub use farmod::ModuleRegistry;
pub use farmod::ModuleType;
pub use farmod::ScanKind;
pub use farmod::SearchMode;
pub use farmod::Symbol;
pub use farval::ArgKind;
pub use farval::ArgValue;
