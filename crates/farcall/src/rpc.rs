//! # RPC Environment
//!
//! The memory a single remote call shares with the target.
//!
//! ## Layout
//!
//! ```text
//! data region (read/write)
//! +0x000  RET    return register, stored by the stub (8 bytes)
//! +0x008  ERR    thread last-error value (4 bytes)
//! +0x010  DONE   completion flag, written last
//! +0x100  ARGS   [return buffer] [payload 0] [payload 1] ...
//!
//! code region (read/write/execute)
//! +0x000  the assembled stub
//! ```
//!
//! Payloads are placed in argument order, each aligned to [`PAYLOAD_ALIGN`]. When an
//! aggregate is returned by value, its buffer comes first at `ARGS`.
//!
//! ## Lifetime
//!
//! An `RpcEnvironment` is a guard: dropping it frees both regions, whichever way the
//! call ended. The one exception is a call that timed out. The target thread may
//! still be running the stub, so the regions are abandoned rather than freed.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use anyhow::Context;
use anyhow::bail;
use farval::ArgValue;
use tracing::debug;
use tracing::warn;

use crate::traits::ProcessMemory;
use crate::traits::Protection;

pub const RET_OFFSET: u64 = 0x00;
pub const ERR_OFFSET: u64 = 0x08;
pub const DONE_OFFSET: u64 = 0x10;
pub const ARGS_OFFSET: u64 = 0x100;

/// Width of the return slot. Results wider than this go through a buffer.
pub const RET_SLOT_SIZE: usize = 8;

/// Smallest data region ever allocated.
pub const MIN_REGION_SIZE: usize = 0x1000;

pub const PAYLOAD_ALIGN: usize = 0x10;

/// Value the stub stores at `DONE` once every result is in place.
pub const DONE_SIGNAL: u64 = 1;

fn align(len: usize) -> usize {
    len.div_ceil(PAYLOAD_ALIGN) * PAYLOAD_ALIGN
}

/// The shared regions of one remote call.
pub struct RpcEnvironment {
    memory: Arc<dyn ProcessMemory>,
    data: u64,
    data_size: usize,
    ret_reserve: usize,
    code: Option<(u64, usize)>,
    abandoned: AtomicBool,
}

impl RpcEnvironment {
    /// Allocates a data region large enough for every payload in `args` plus
    /// `ret_reserve` bytes of return buffer.
    pub fn create(memory: Arc<dyn ProcessMemory>, args: &[ArgValue], ret_reserve: usize) -> anyhow::Result<Self> {
        let payloads: usize = args.iter().map(|arg| align(arg.payload_len())).sum();
        let data_size = (ARGS_OFFSET as usize + align(ret_reserve) + payloads).max(MIN_REGION_SIZE);

        let data = memory
            .allocate(data_size, Protection::ReadWrite)
            .context("allocating the data region")?;
        debug!(data = format_args!("{data:#x}"), size = data_size, "rpc environment allocated");

        Ok(Self {
            memory,
            data,
            data_size,
            ret_reserve,
            code: None,
            abandoned: AtomicBool::new(false),
        })
    }

    /// Base of the data region. This is the stub thread's parameter.
    pub fn base(&self) -> u64 {
        self.data
    }

    pub fn size(&self) -> usize {
        self.data_size
    }

    pub fn ret_slot(&self) -> u64 {
        self.data + RET_OFFSET
    }

    pub fn err_slot(&self) -> u64 {
        self.data + ERR_OFFSET
    }

    pub fn done_flag(&self) -> u64 {
        self.data + DONE_OFFSET
    }

    pub fn args_area(&self) -> u64 {
        self.data + ARGS_OFFSET
    }

    /// The by-value return buffer, if one was reserved.
    pub fn ret_buffer(&self) -> Option<u64> {
        (self.ret_reserve > 0).then(|| self.args_area())
    }

    /// Entry point of the installed stub.
    pub fn code(&self) -> Option<u64> {
        self.code.map(|(address, _)| address)
    }

    /// Copies each argument's payload into the argument area.
    ///
    /// Returns one entry per argument: the target address of its copy, or `None`
    /// for kinds that are passed as immediates.
    pub fn write_payloads(&self, args: &[ArgValue]) -> anyhow::Result<Vec<Option<u64>>> {
        let mut cursor = self.args_area() + align(self.ret_reserve) as u64;
        let end = self.data + self.data_size as u64;

        let mut placed = Vec::with_capacity(args.len());
        for (index, arg) in args.iter().enumerate() {
            let Some(payload) = arg.payload() else {
                placed.push(None);
                continue;
            };
            if cursor + payload.len() as u64 > end {
                bail!("argument {index} does not fit in the data region");
            }
            self.memory
                .write(cursor, &payload)
                .with_context(|| format!("writing argument {index} payload"))?;
            placed.push(Some(cursor));
            cursor += align(payload.len()) as u64;
        }

        Ok(placed)
    }

    /// Places the stub's code in a fresh executable region, replacing any earlier one.
    pub fn install_code(&mut self, code: &[u8]) -> anyhow::Result<u64> {
        if code.is_empty() {
            bail!("assembler produced no code");
        }
        if let Some((old, _)) = self.code.take() {
            self.memory.free(old).context("releasing the previous stub")?;
        }

        let address = self
            .memory
            .allocate(code.len(), Protection::ReadWriteExecute)
            .context("allocating the code region")?;
        self.code = Some((address, code.len()));
        self.memory.write(address, code).context("writing the stub")?;
        Ok(address)
    }

    /// Clears the result slots and the completion flag before an execution.
    pub fn arm(&self) -> anyhow::Result<()> {
        self.memory.write(self.data, &[0u8; ARGS_OFFSET as usize])
    }

    pub fn is_done(&self) -> anyhow::Result<bool> {
        Ok(self.read_u64(DONE_OFFSET)? == DONE_SIGNAL)
    }

    pub fn read_u64(&self, offset: u64) -> anyhow::Result<u64> {
        let mut raw = [0u8; 8];
        self.memory.read(self.data + offset, &mut raw)?;
        Ok(u64::from_le_bytes(raw))
    }

    /// The last-error value the stub captured after the call.
    pub fn last_error(&self) -> anyhow::Result<u32> {
        let mut raw = [0u8; 4];
        self.memory.read(self.err_slot(), &mut raw)?;
        Ok(u32::from_le_bytes(raw))
    }

    /// Gives up ownership of the regions. The target may still be using them.
    pub fn abandon(&self) {
        self.abandoned.store(true, Ordering::Release);
    }

    pub fn is_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::Acquire)
    }
}

impl Drop for RpcEnvironment {
    fn drop(&mut self) {
        if self.is_abandoned() {
            warn!(
                data = format_args!("{:#x}", self.data),
                code = ?self.code.map(|(a, _)| format!("{a:#x}")),
                "leaking rpc regions still in use by the target"
            );
            return;
        }

        if let Some((code, _)) = self.code.take() {
            if let Err(e) = self.memory.free(code) {
                warn!(error = %e, "failed to release the code region");
            }
        }
        if let Err(e) = self.memory.free(self.data) {
            warn!(error = %e, "failed to release the data region");
        }
        debug!(data = format_args!("{:#x}", self.data), "rpc environment released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimMemory;

    fn memory() -> Arc<SimMemory> {
        Arc::new(SimMemory::new(0x10_0000, u64::from(u32::MAX)))
    }

    #[test]
    fn test_payloads_are_aligned_in_argument_order() {
        let mem = memory();
        let args = [
            ArgValue::from(1i32),
            ArgValue::from("abc"),
            ArgValue::out_buffer(3),
            ArgValue::wide("hi"),
        ];
        let env = RpcEnvironment::create(mem.clone(), &args, 0).unwrap();
        let placed = env.write_payloads(&args).unwrap();

        let base = env.args_area();
        assert_eq!(placed, vec![None, Some(base), Some(base + 0x10), Some(base + 0x20)]);

        let mut text = [0u8; 4];
        mem.read(base, &mut text).unwrap();
        assert_eq!(&text, b"abc\0");

        let mut wide = [0u8; 6];
        mem.read(base + 0x20, &mut wide).unwrap();
        assert_eq!(wide, [b'h', 0, b'i', 0, 0, 0]);
    }

    #[test]
    fn test_return_buffer_comes_first() {
        let mem = memory();
        let args = [ArgValue::out_buffer(4)];
        let env = RpcEnvironment::create(mem, &args, 24).unwrap();
        let placed = env.write_payloads(&args).unwrap();

        assert_eq!(env.ret_buffer(), Some(env.args_area()));
        assert_eq!(placed, vec![Some(env.args_area() + 0x20)]);
    }

    #[test]
    fn test_region_grows_with_payloads() {
        let mem = memory();
        let args = [ArgValue::out_buffer(0x3000)];
        let env = RpcEnvironment::create(mem, &args, 0).unwrap();
        assert!(env.size() >= ARGS_OFFSET as usize + 0x3000);
        assert!(env.write_payloads(&args).is_ok());
    }

    #[test]
    fn test_drop_releases_both_regions() {
        let mem = memory();
        {
            let mut env = RpcEnvironment::create(mem.clone(), &[], 0).unwrap();
            env.install_code(&[0x90; 16]).unwrap();
            assert_eq!(mem.allocation_count(), 2);
        }
        assert_eq!(mem.allocation_count(), 0);
    }

    #[test]
    fn test_abandoned_environment_is_not_freed() {
        let mem = memory();
        {
            let env = RpcEnvironment::create(mem.clone(), &[], 0).unwrap();
            env.abandon();
        }
        assert_eq!(mem.allocation_count(), 1);
    }

    #[test]
    fn test_arm_clears_completion_flag() {
        let mem = memory();
        let env = RpcEnvironment::create(mem.clone(), &[], 0).unwrap();
        mem.write(env.done_flag(), &DONE_SIGNAL.to_le_bytes()).unwrap();
        assert!(env.is_done().unwrap());

        env.arm().unwrap();
        assert!(!env.is_done().unwrap());
    }
}
