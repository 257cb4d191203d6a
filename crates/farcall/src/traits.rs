//! # Collaborator Traits
//!
//! The seams between the call protocol and the machinery that touches a real
//! target. A platform backend implements all of them for its process handle; the
//! [`sim`](crate::sim) module implements them in memory.
//!
//! Memory access is synchronous. Remote execution is async, because waiting on a
//! target thread is the one step that can block for an unbounded time.

use std::time::Duration;

use async_trait::async_trait;
use farmod::ModuleType;

use crate::error::ExecError;
use crate::stub::CallStub;

/// Pointer width of the target.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Bitness {
    X86,
    X64,
}

impl Bitness {
    pub fn pointer_size(self) -> usize {
        match self {
            Self::X86 => 4,
            Self::X64 => 8,
        }
    }

    /// The module type native to a process of this bitness.
    pub fn module_type(self) -> ModuleType {
        match self {
            Self::X86 => ModuleType::Mod32,
            Self::X64 => ModuleType::Mod64,
        }
    }

    /// Highest address a pointer of this width can hold.
    pub fn max_address(self) -> u64 {
        match self {
            Self::X86 => u64::from(u32::MAX),
            Self::X64 => u64::MAX,
        }
    }
}

/// Identifies a thread in the target.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(pub u32);

impl std::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tid:{}", self.0)
    }
}

/// Page protection for target allocations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protection {
    ReadWrite,
    ReadWriteExecute,
}

/// Raw memory access into the target.
pub trait ProcessMemory: Send + Sync {
    /// Fills `buf` from `address`. Fails if any byte of the range is unmapped.
    fn read(&self, address: u64, buf: &mut [u8]) -> anyhow::Result<()>;

    fn write(&self, address: u64, data: &[u8]) -> anyhow::Result<()>;

    /// Allocates at least `size` zeroed bytes and returns the base address.
    fn allocate(&self, size: usize, protection: Protection) -> anyhow::Result<u64>;

    /// Releases an allocation by its base address.
    fn free(&self, address: u64) -> anyhow::Result<()>;
}

/// Identity and liveness of the target.
pub trait ProcessCore: ProcessMemory {
    fn pid(&self) -> u32;

    /// False once the target has exited or the handle was closed.
    fn is_alive(&self) -> bool;

    fn bitness(&self) -> anyhow::Result<Bitness>;
}

/// Running code in the target.
///
/// Both methods wait for the thread routine to return and yield its exit code.
/// A timeout must come back as [`ExecError::Timeout`] and nothing else.
#[async_trait]
pub trait RemoteThreads: Send + Sync {
    /// Starts a new thread at `entry` with `param` as its only argument.
    async fn exec_in_new_thread(&self, entry: u64, param: u64, timeout: Option<Duration>) -> Result<u64, ExecError>;

    /// Runs `entry(param)` on an existing thread and waits for it.
    async fn exec_in_thread(
        &self,
        thread: ThreadId,
        entry: u64,
        param: u64,
        timeout: Option<Duration>,
    ) -> Result<u64, ExecError>;
}

/// Hands out assemblers. Asked once per call, never cached across processes.
pub trait AsmFactory: Send + Sync {
    fn assembler(&self, bitness: Bitness) -> anyhow::Result<Box<dyn CallAssembler>>;
}

/// Emits the machine code of one call stub.
pub trait CallAssembler: Send {
    fn bitness(&self) -> Bitness;

    /// Encodes the stub. Fails if the call shape cannot be expressed for the target.
    fn assemble(&mut self, stub: &CallStub) -> anyhow::Result<Vec<u8>>;
}
