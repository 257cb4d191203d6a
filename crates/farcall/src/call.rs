//! # Remote Call Orchestration
//!
//! Drives one call through the protocol steps, in order:
//!
//! ```text
//! validate -> resolve -> select assembler -> prepare region -> assemble
//!          -> execute -> read result -> sync outputs
//! ```
//!
//! The first five steps build a [`PreparedCall`], which owns the call's shared
//! regions. The last three run against it. A prepared call can be executed again,
//! on any context, without redoing the first five steps.
//!
//! No step after preparation touches the caller's buffers unless the function
//! actually ran: a call that fails before execution leaves `ret` and every
//! argument exactly as they were.

use std::time::Duration;

use anyhow::anyhow;
use farmod::Symbol;
use farval::ArgKind;
use farval::ArgValue;
use tracing::debug;
use tracing::warn;

use crate::error::CallError;
use crate::error::ExecError;
use crate::error::Result;
use crate::process::Process;
use crate::rpc::RET_OFFSET;
use crate::rpc::RET_SLOT_SIZE;
use crate::rpc::RpcEnvironment;
use crate::stub::CallConv;
use crate::stub::CallStub;
use crate::stub::ReturnKind;
use crate::stub::StubArg;
use crate::traits::Bitness;
use crate::traits::ThreadId;

/// Where the stub runs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ExecContext {
    /// A fresh target thread, created for this call and gone after it.
    #[default]
    NewThread,
    /// An existing target thread, borrowed for the duration of the call.
    Thread(ThreadId),
}

/// Per-call knobs. The default runs on a new thread, waits forever, and reads
/// large results by value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CallOptions {
    pub context: ExecContext,
    pub timeout: Option<Duration>,
    /// The callee returns a pointer to its result instead of filling a hidden buffer.
    /// Ignored for results that fit in the return slot.
    pub by_reference: bool,
}

impl CallOptions {
    pub fn in_thread(mut self, thread: ThreadId) -> Self {
        self.context = ExecContext::Thread(thread);
        self
    }

    pub fn timeout(mut self, limit: Duration) -> Self {
        self.timeout = Some(limit);
        self
    }

    pub fn by_reference(mut self, by_reference: bool) -> Self {
        self.by_reference = by_reference;
        self
    }
}

/// A remote call description, reusable across processes.
#[derive(Clone, Debug)]
pub struct RemoteCall {
    module: String,
    symbol: Symbol,
    conv: CallConv,
    ret: ReturnKind,
    options: CallOptions,
}

impl RemoteCall {
    pub fn new(module: impl Into<String>, symbol: impl Into<Symbol>) -> Self {
        Self {
            module: module.into(),
            symbol: symbol.into(),
            conv: CallConv::default(),
            ret: ReturnKind::default(),
            options: CallOptions::default(),
        }
    }

    pub fn convention(mut self, conv: CallConv) -> Self {
        self.conv = conv;
        self
    }

    pub fn returns(mut self, ret: ReturnKind) -> Self {
        self.ret = ret;
        self
    }

    pub fn options(mut self, options: CallOptions) -> Self {
        self.options = options;
        self
    }

    pub fn by_reference(mut self) -> Self {
        self.options.by_reference = true;
        self
    }

    pub fn in_thread(mut self, thread: ThreadId) -> Self {
        self.options.context = ExecContext::Thread(thread);
        self
    }

    pub fn timeout(mut self, limit: Duration) -> Self {
        self.options.timeout = Some(limit);
        self
    }

    /// Runs the whole protocol.
    ///
    /// `ret.len()` is the result size. On success `ret` holds the result and every
    /// data-pointer argument holds what the callee left in its copy.
    pub async fn invoke(&self, process: &Process, args: &mut [ArgValue], ret: &mut [u8]) -> Result<()> {
        let prepared = self.prepare(process, args, ret.len())?;
        prepared.execute(self.options.context, self.options.timeout).await?;
        prepared.retrieve(ret)?;
        prepared.sync_outputs(args)
    }

    /// Runs the steps up to and including assembly.
    ///
    /// Nothing is executed in the target yet; dropping the result releases the
    /// regions it allocated.
    pub fn prepare<'p>(&self, process: &'p Process, args: &[ArgValue], ret_size: usize) -> Result<PreparedCall<'p>> {
        // Validate.
        if !process.is_valid() {
            return Err(CallError::InvalidArgument("target process is not running"));
        }
        if self.module.trim().is_empty() {
            return Err(CallError::InvalidArgument("empty module name"));
        }
        if self.symbol.is_empty() {
            return Err(CallError::InvalidArgument("empty symbol"));
        }

        // Resolve.
        let export = process
            .modules()
            .get_export(&self.module, &self.symbol)
            .map_err(|cause| CallError::SymbolNotFound {
                module: self.module.clone(),
                symbol: self.symbol.clone(),
                cause,
            })?;
        debug!(module = %self.module, symbol = %self.symbol, address = format_args!("{:#x}", export.address), "export resolved");

        // Select assembler.
        let bitness = process.bitness();
        let mut assembler = process.asm().assembler(bitness).map_err(CallError::AssemblyFailed)?;
        if assembler.bitness() != bitness {
            return Err(CallError::AssemblyFailed(anyhow!(
                "assembler targets {:?}, process is {:?}",
                assembler.bitness(),
                bitness
            )));
        }

        // Prepare the shared region.
        let by_reference = self.options.by_reference && ret_size > RET_SLOT_SIZE;
        let ret_reserve = if ret_size > RET_SLOT_SIZE && !by_reference { ret_size } else { 0 };
        let mut env = RpcEnvironment::create(process.memory().clone(), args, ret_reserve)
            .map_err(CallError::EnvironmentSetupFailed)?;
        let placed = env.write_payloads(args).map_err(CallError::EnvironmentSetupFailed)?;

        // Assemble.
        let stub = CallStub {
            function: export.address,
            conv: self.conv,
            args: lower(args, &placed).map_err(CallError::AssemblyFailed)?,
            ret: self.ret,
            ret_buffer: env.ret_buffer(),
            ret_slot: env.ret_slot(),
            last_error_slot: env.err_slot(),
            done_flag: env.done_flag(),
        };
        let code = assembler.assemble(&stub).map_err(CallError::AssemblyFailed)?;
        let entry = env.install_code(&code).map_err(CallError::AssemblyFailed)?;
        debug!(entry = format_args!("{entry:#x}"), len = code.len(), "stub installed");

        Ok(PreparedCall {
            process,
            env,
            entry,
            placed,
            shape: args.iter().map(|arg| (arg.kind(), arg.payload_len())).collect(),
            ret_size,
            by_reference,
            bitness,
        })
    }
}

/// Turns argument values into stub arguments, using the addresses their payloads
/// were copied to.
fn lower(args: &[ArgValue], placed: &[Option<u64>]) -> anyhow::Result<Vec<StubArg>> {
    args.iter()
        .zip(placed)
        .enumerate()
        .map(|(index, (arg, address))| -> anyhow::Result<StubArg> {
            let copied = || address.ok_or_else(|| anyhow!("argument {index} has no copy in the target"));
            Ok(match arg {
                ArgValue::Int { bits, width, .. } => StubArg::Int { value: *bits, width: *width },
                ArgValue::Float(v) => StubArg::Float(*v),
                ArgValue::Double(v) => StubArg::Double(*v),
                ArgValue::Pointer(p) => StubArg::Pointer(*p),
                ArgValue::NarrowStr(_) | ArgValue::WideStr(_) | ArgValue::DataPtr(_) => StubArg::Pointer(copied()?),
                ArgValue::DataStruct(buf) => StubArg::Struct {
                    address: copied()?,
                    len: u32::try_from(buf.len())?,
                },
            })
        })
        .collect()
}

/// A call that is resolved, marshalled and assembled, and can be executed.
pub struct PreparedCall<'p> {
    process: &'p Process,
    env: RpcEnvironment,
    entry: u64,
    placed: Vec<Option<u64>>,
    /// Kind and payload length of each argument as marshalled.
    shape: Vec<(ArgKind, usize)>,
    ret_size: usize,
    by_reference: bool,
    bitness: Bitness,
}

impl PreparedCall<'_> {
    pub fn entry(&self) -> u64 {
        self.entry
    }

    pub fn environment(&self) -> &RpcEnvironment {
        &self.env
    }

    /// Runs the stub and waits for it. Returns the thread routine's exit code.
    ///
    /// The completion flag is cleared before and checked after, so a stub that
    /// returned without signalling counts as a failure.
    pub async fn execute(&self, context: ExecContext, timeout: Option<Duration>) -> Result<u64> {
        if self.env.is_abandoned() {
            return Err(CallError::InvalidArgument("call was abandoned after a timeout"));
        }
        self.env.arm().map_err(CallError::EnvironmentSetupFailed)?;

        let threads = self.process.threads();
        let outcome = match context {
            ExecContext::NewThread => threads.exec_in_new_thread(self.entry, self.env.base(), timeout).await,
            ExecContext::Thread(tid) => threads.exec_in_thread(tid, self.entry, self.env.base(), timeout).await,
        };

        let exit_code = match outcome {
            Ok(code) => code,
            Err(ExecError::Timeout(limit)) => {
                warn!(?context, ?limit, "remote call timed out");
                self.env.abandon();
                return Err(CallError::Timeout(limit));
            }
            Err(e) => return Err(CallError::ExecutionFailed(e)),
        };

        let done = self
            .env
            .is_done()
            .map_err(|e| CallError::ExecutionFailed(ExecError::Wait(format!("{e:#}"))))?;
        if !done {
            return Err(CallError::ExecutionFailed(ExecError::Fault(
                "stub returned without signalling completion".into(),
            )));
        }

        debug!(?context, exit_code, "remote call completed");
        Ok(exit_code)
    }

    /// Copies the result of the last execution into `ret`.
    ///
    /// Results that fit the return slot are read from it. Larger results are read
    /// from the by-value buffer, or through the returned pointer when the call was
    /// prepared by reference.
    pub fn retrieve(&self, ret: &mut [u8]) -> Result<()> {
        if ret.is_empty() {
            return Ok(());
        }
        if ret.len() != self.ret_size {
            return Err(CallError::InvalidArgument("result buffer size differs from the prepared call"));
        }

        let memory = self.process.memory();
        let source = if ret.len() <= RET_SLOT_SIZE {
            self.env.ret_slot()
        } else if self.by_reference {
            let raw = self.env.read_u64(RET_OFFSET).map_err(CallError::ResultReadFailed)?;
            let pointer = raw & self.bitness.max_address();
            if pointer == 0 {
                return Err(CallError::ResultReadFailed(anyhow!("callee returned a null result pointer")));
            }
            pointer
        } else {
            self.env
                .ret_buffer()
                .ok_or_else(|| CallError::ResultReadFailed(anyhow!("no return buffer was reserved")))?
        };

        memory.read(source, ret).map_err(CallError::ResultReadFailed)
    }

    /// Refreshes every data-pointer argument from its copy in the target.
    ///
    /// `args` must have the kinds and payload lengths the call was prepared with.
    /// All buffers are attempted; the first failure is reported.
    pub fn sync_outputs(&self, args: &mut [ArgValue]) -> Result<()> {
        if args.len() != self.shape.len() {
            return Err(CallError::InvalidArgument("argument count differs from the prepared call"));
        }
        let same_shape = args
            .iter()
            .zip(&self.shape)
            .all(|(arg, &(kind, len))| arg.kind() == kind && arg.payload_len() == len);
        if !same_shape {
            return Err(CallError::InvalidArgument("argument kinds or sizes differ from the prepared call"));
        }

        let memory = self.process.memory();
        let mut first_failure = None;
        for (index, (arg, address)) in args.iter_mut().zip(&self.placed).enumerate() {
            let Some(buf) = arg.data_mut() else { continue };
            let synced = match address {
                Some(address) => memory.read(*address, buf),
                None => Err(anyhow!("argument was not marshalled as a buffer")),
            };
            if let Err(cause) = synced {
                warn!(index, error = %cause, "output argument not synchronized");
                if first_failure.is_none() {
                    first_failure = Some(CallError::OutputSyncFailed { index, cause });
                }
            }
        }

        first_failure.map_or(Ok(()), Err)
    }

    /// The last-error value the callee left behind.
    pub fn last_error(&self) -> Result<u32> {
        self.env.last_error().map_err(CallError::ResultReadFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lower_uses_payload_addresses() {
        let args = [
            ArgValue::from(-1i8),
            ArgValue::from("x"),
            ArgValue::Pointer(0xdead),
            ArgValue::DataStruct(vec![0; 12]),
            ArgValue::from(2.5f64),
        ];
        let placed = [None, Some(0x100), None, Some(0x200), None];
        let lowered = lower(&args, &placed).unwrap();

        assert_eq!(lowered, vec![
            StubArg::Int { value: u64::MAX, width: 1 },
            StubArg::Pointer(0x100),
            StubArg::Pointer(0xdead),
            StubArg::Struct { address: 0x200, len: 12 },
            StubArg::Double(2.5),
        ]);
    }

    #[test]
    fn test_lower_rejects_unplaced_payload() {
        assert!(lower(&[ArgValue::out_buffer(4)], &[None]).is_err());
    }

    #[test]
    fn test_options_builder() {
        let options = CallOptions::default()
            .in_thread(ThreadId(7))
            .timeout(Duration::from_millis(5))
            .by_reference(true);
        assert_eq!(options.context, ExecContext::Thread(ThreadId(7)));
        assert_eq!(options.timeout, Some(Duration::from_millis(5)));
        assert!(options.by_reference);
        assert_eq!(CallOptions::default().context, ExecContext::NewThread);
    }
}
