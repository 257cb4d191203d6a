//! The simulated target process.
//!
//! ## Threads
//!
//! A new remote thread is a blocking task on the tokio pool. A worker (an
//! existing thread the caller can borrow) is a dedicated OS thread fed through a
//! job channel. A fault kills the thread it happened on, as it would in a real
//! target: a worker that faulted never runs another job.
//!
//! ## Execution
//!
//! A thread starts by decoding the stub at its entry point and then runs it
//! instruction by instruction against the simulated address space.

use std::any::Any;
use std::panic;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::time::Duration;

use anyhow::Context;
use anyhow::anyhow;
use anyhow::bail;
use async_trait::async_trait;
use dashmap::DashMap;
use farmod::ModuleProvider;
use farmod::ModuleRecord;
use farmod::ScanKind;
use rand::Rng;
use tokio::sync::oneshot;
use tracing::debug;
use tracing::trace;

use crate::error::ExecError;
use crate::process;
use crate::process::Process;
use crate::sim::asm::SimAsmFactory;
use crate::sim::isa;
use crate::sim::isa::Instr;
use crate::sim::memory::PAGE_SIZE;
use crate::sim::memory::SimMemory;
use crate::sim::module::NativeFn;
use crate::sim::module::SimArg;
use crate::sim::module::SimExport;
use crate::sim::module::SimFrame;
use crate::sim::module::SimModule;
use crate::sim::module::SimValue;
use crate::stub::ReturnKind;
use crate::stub::StubArg;
use crate::traits::Bitness;
use crate::traits::ProcessCore;
use crate::traits::ProcessMemory;
use crate::traits::Protection;
use crate::traits::RemoteThreads;
use crate::traits::ThreadId;

const IMAGE_STRIDE: u64 = 0x10_0000;
const EXPORT_STRIDE: usize = 0x10;
const CODE_RVA: usize = 0x1000;

struct Layout {
    main: u64,
    images: u64,
    heap: u64,
    heap_limit: u64,
}

impl Layout {
    fn for_bitness(bitness: Bitness) -> Self {
        // Randomize the heap a little so nothing can depend on fixed addresses.
        let slide = rand::thread_rng().gen_range(0..0x100u64) * 0x1_0000;
        match bitness {
            Bitness::X86 => Self {
                main: 0x0040_0000,
                images: 0x1000_0000,
                heap: 0x2000_0000 + slide,
                heap_limit: 0x7FFE_FFFF,
            },
            Bitness::X64 => Self {
                main: 0x1_4000_0000,
                images: 0x7FF8_0000_0000,
                heap: 0x0200_0000_0000 + slide,
                heap_limit: 0x7FFF_FFFE_FFFF,
            },
        }
    }
}

struct Image {
    record: ModuleRecord,
    hidden: bool,
    functions: Vec<u64>,
}

struct Job {
    entry: u64,
    param: u64,
    reply: oneshot::Sender<Result<u64, ExecError>>,
}

struct Worker {
    jobs: mpsc::Sender<Job>,
    alive: Arc<AtomicBool>,
}

struct SimInner {
    pid: u32,
    bitness: Bitness,
    alive: AtomicBool,
    memory: SimMemory,
    functions: DashMap<u64, NativeFn>,
    images: DashMap<u64, Image>,
    main_base: u64,
    next_image: AtomicU64,
    workers: DashMap<ThreadId, Worker>,
    next_tid: AtomicU32,
    threads_created: AtomicU64,
}

/// An in-memory target process. Cloning yields another handle to the same process.
#[derive(Clone)]
pub struct SimProcess {
    inner: Arc<SimInner>,
}

impl SimProcess {
    /// Creates a running process with only its main image (`app.exe`) loaded.
    pub fn new(bitness: Bitness) -> Self {
        let layout = Layout::for_bitness(bitness);
        let pid = rand::thread_rng().gen_range(0x100..0x4000u32) * 4;

        let inner = Arc::new(SimInner {
            pid,
            bitness,
            alive: AtomicBool::new(true),
            memory: SimMemory::new(layout.heap, layout.heap_limit),
            functions: DashMap::new(),
            images: DashMap::new(),
            main_base: layout.main,
            next_image: AtomicU64::new(layout.images),
            workers: DashMap::new(),
            next_tid: AtomicU32::new(pid + 4),
            threads_created: AtomicU64::new(0),
        });

        let main = ModuleRecord::new(r"C:\sim\app.exe", layout.main, PAGE_SIZE as u32, bitness.module_type());
        if inner.memory.map_image(layout.main, PAGE_SIZE).is_ok() {
            inner.images.insert(layout.main, Image { record: main, hidden: false, functions: Vec::new() });
        }
        Self { inner }
    }

    /// Attaches a [`Process`] to this target with the simulated assembler.
    pub fn attach(&self) -> process::Result<Process> {
        Process::attach(Arc::new(self.clone()), Arc::new(SimAsmFactory))
    }

    pub fn main_base(&self) -> u64 {
        self.inner.main_base
    }

    /// Remote threads started so far. Workers are not counted.
    pub fn threads_created(&self) -> u64 {
        self.inner.threads_created.load(Ordering::SeqCst)
    }

    /// Live heap allocations in the target.
    pub fn allocation_count(&self) -> usize {
        self.inner.memory.allocation_count()
    }

    /// Kills the process. Every later memory access and execution fails.
    pub fn terminate(&self) {
        self.inner.alive.store(false, Ordering::SeqCst);
        self.inner.workers.clear();
        debug!(pid = self.inner.pid, "target terminated");
    }

    /// Maps an image and registers its exports.
    pub fn load(&self, module: SimModule) -> anyhow::Result<ModuleRecord> {
        self.inner.ensure_alive()?;
        let size = (CODE_RVA + module.exports.len() * EXPORT_STRIDE).div_ceil(PAGE_SIZE) * PAGE_SIZE;
        let base = self.inner.next_image.fetch_add(IMAGE_STRIDE, Ordering::Relaxed);
        self.inner.memory.map_image(base, size)?;

        let mut record = ModuleRecord::new(module.path, base, size as u32, self.inner.bitness.module_type());
        let mut functions = Vec::new();
        for (index, export) in module.exports.into_iter().enumerate() {
            let rva = (CODE_RVA + index * EXPORT_STRIDE) as u32;
            record = match export {
                SimExport::Native { name, ordinal, func } => {
                    self.inner.functions.insert(base + u64::from(rva), func);
                    functions.push(base + u64::from(rva));
                    match (name, ordinal) {
                        (Some(name), _) => record.with_export(name, rva)?,
                        (None, Some(ordinal)) => record.with_ordinal(ordinal, rva)?,
                        (None, None) => record,
                    }
                }
                SimExport::Forward { name, module: target, symbol } => record.with_forward(name, target, symbol)?,
            };
        }

        debug!(module = %record.name, base = format_args!("{base:#x}"), "image loaded");
        self.inner.images.insert(base, Image { record: record.clone(), hidden: module.hidden, functions });
        Ok(record)
    }

    /// Starts a worker thread that remote calls can borrow.
    pub fn spawn_worker(&self) -> anyhow::Result<ThreadId> {
        self.inner.ensure_alive()?;
        let tid = self.inner.next_thread_id();
        let (jobs, queue) = mpsc::channel();
        let alive = Arc::new(AtomicBool::new(true));

        let process = Arc::downgrade(&self.inner);
        let flag = alive.clone();
        std::thread::Builder::new()
            .name(format!("sim-worker-{}", tid.0))
            .spawn(move || worker_loop(process, queue, flag, tid))
            .context("spawning worker thread")?;

        self.inner.workers.insert(tid, Worker { jobs, alive });
        debug!(%tid, "worker thread started");
        Ok(tid)
    }

    /// True while the worker can take jobs.
    pub fn worker_alive(&self, tid: ThreadId) -> bool {
        self.inner
            .workers
            .get(&tid)
            .is_some_and(|w| w.alive.load(Ordering::SeqCst))
    }
}

impl SimInner {
    fn ensure_alive(&self) -> anyhow::Result<()> {
        if !self.alive.load(Ordering::SeqCst) {
            bail!("process {} has exited", self.pid);
        }
        Ok(())
    }

    fn next_thread_id(&self) -> ThreadId {
        ThreadId(self.next_tid.fetch_add(4, Ordering::Relaxed))
    }

    /// Runs the stub at `entry` to completion. An `Err` is a fault in the thread.
    fn run_stub(&self, entry: u64, param: u64) -> anyhow::Result<u64> {
        self.ensure_alive()?;
        if !self.memory.is_executable(entry) {
            bail!("access violation executing {entry:#x}");
        }
        let program = isa::decode(&self.memory.read_to_end(entry)?).context("illegal instruction")?;
        if program.bitness != self.bitness {
            bail!("{:?} stub cannot run in a {:?} process", program.bitness, self.bitness);
        }
        trace!(entry = format_args!("{entry:#x}"), param = format_args!("{param:#x}"), "stub started");

        // Fresh thread state: both return registers start out zero.
        let mut rax = 0u64;
        let mut xmm0 = 0f64;
        let mut last_error = 0u32;

        for instr in program.instrs {
            match instr {
                Instr::Call { target, args, .. } => {
                    let func = self
                        .functions
                        .get(&target)
                        .map(|f| f.value().clone())
                        .ok_or_else(|| anyhow!("access violation calling {target:#x}"))?;
                    let args = args.iter().map(|a| self.load_arg(a)).collect::<anyhow::Result<Vec<_>>>()?;

                    let mut frame = SimFrame::new(args, &self.memory, self.bitness);
                    match func(&mut frame)? {
                        SimValue::Void => {}
                        SimValue::Int(v) => rax = v,
                        SimValue::Float(v) => xmm0 = v,
                    }
                    last_error = frame.last_error;
                }
                Instr::SaveRet { kind, address } => {
                    let bytes = match kind {
                        ReturnKind::Void => Vec::new(),
                        ReturnKind::Int32 => (rax as u32).to_le_bytes().to_vec(),
                        ReturnKind::Int64 | ReturnKind::Struct => rax.to_le_bytes().to_vec(),
                        ReturnKind::Float => (xmm0 as f32).to_le_bytes().to_vec(),
                        ReturnKind::Double => xmm0.to_le_bytes().to_vec(),
                    };
                    self.memory.write(address, &bytes)?;
                }
                Instr::SaveLastError { address } => self.memory.write(address, &last_error.to_le_bytes())?,
                Instr::Signal { address, value } => self.memory.write(address, &value.to_le_bytes())?,
                Instr::Exit => break,
            }
        }

        Ok(rax)
    }

    fn load_arg(&self, arg: &StubArg) -> anyhow::Result<SimArg> {
        Ok(match *arg {
            StubArg::Int { value, .. } => SimArg::Int(value),
            StubArg::Pointer(p) => SimArg::Int(p),
            StubArg::Float(v) => SimArg::Float(v),
            StubArg::Double(v) => SimArg::Double(v),
            StubArg::Struct { address, len } => {
                let mut bytes = vec![0; len as usize];
                self.memory.read(address, &mut bytes)?;
                SimArg::Bytes(bytes)
            }
        })
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown exception".to_string())
}

fn worker_loop(process: Weak<SimInner>, queue: mpsc::Receiver<Job>, alive: Arc<AtomicBool>, tid: ThreadId) {
    while let Ok(job) = queue.recv() {
        let Some(inner) = process.upgrade() else { break };
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| inner.run_stub(job.entry, job.param)));

        let reply = match outcome {
            Ok(Ok(code)) => Ok(code),
            Ok(Err(fault)) => Err(ExecError::Fault(format!("{fault:#}"))),
            Err(payload) => Err(ExecError::Fault(panic_message(payload))),
        };
        let faulted = reply.is_err();
        if faulted {
            alive.store(false, Ordering::SeqCst);
        }
        // The caller may have stopped waiting.
        let _ = job.reply.send(reply);
        if faulted {
            debug!(%tid, "worker thread died");
            return;
        }
    }
    alive.store(false, Ordering::SeqCst);
}

// ============================================================================
//  COLLABORATOR TRAITS
// ============================================================================

impl ProcessMemory for SimProcess {
    fn read(&self, address: u64, buf: &mut [u8]) -> anyhow::Result<()> {
        self.inner.ensure_alive()?;
        self.inner.memory.read(address, buf)
    }

    fn write(&self, address: u64, data: &[u8]) -> anyhow::Result<()> {
        self.inner.ensure_alive()?;
        self.inner.memory.write(address, data)
    }

    fn allocate(&self, size: usize, protection: Protection) -> anyhow::Result<u64> {
        self.inner.ensure_alive()?;
        self.inner.memory.allocate(size, protection)
    }

    fn free(&self, address: u64) -> anyhow::Result<()> {
        self.inner.ensure_alive()?;
        self.inner.memory.free(address)
    }
}

impl ProcessCore for SimProcess {
    fn pid(&self) -> u32 {
        self.inner.pid
    }

    fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::SeqCst)
    }

    fn bitness(&self) -> anyhow::Result<Bitness> {
        Ok(self.inner.bitness)
    }
}

impl ModuleProvider for SimProcess {
    fn scan(&self, kind: ScanKind) -> anyhow::Result<Vec<ModuleRecord>> {
        self.inner.ensure_alive()?;
        Ok(self
            .inner
            .images
            .iter()
            .filter(|image| kind == ScanKind::AddressSpace || !image.hidden)
            .map(|image| image.record.clone())
            .collect())
    }

    fn main_image_base(&self) -> anyhow::Result<u64> {
        Ok(self.inner.main_base)
    }

    fn unload_image(&self, record: &ModuleRecord) -> anyhow::Result<()> {
        self.inner.ensure_alive()?;
        if record.base == self.inner.main_base {
            bail!("the main image cannot be unloaded");
        }
        let (_, image) = self
            .inner
            .images
            .remove(&record.base)
            .ok_or_else(|| anyhow!("no image mapped at {:#x}", record.base))?;
        for function in image.functions {
            self.inner.functions.remove(&function);
        }
        self.inner.memory.unmap_image(record.base)?;
        debug!(module = %record.name, "image unloaded");
        Ok(())
    }
}

#[async_trait]
impl RemoteThreads for SimProcess {
    async fn exec_in_new_thread(&self, entry: u64, param: u64, timeout: Option<Duration>) -> Result<u64, ExecError> {
        self.inner.ensure_alive().map_err(ExecError::Spawn)?;
        let tid = self.inner.next_thread_id();
        self.inner.threads_created.fetch_add(1, Ordering::SeqCst);
        debug!(%tid, entry = format_args!("{entry:#x}"), "remote thread created");

        let inner = self.inner.clone();
        let handle = tokio::task::spawn_blocking(move || inner.run_stub(entry, param));
        let joined = match timeout {
            Some(limit) => tokio::time::timeout(limit, handle)
                .await
                .map_err(|_| ExecError::Timeout(limit))?,
            None => handle.await,
        };

        match joined {
            Ok(result) => result.map_err(|fault| ExecError::Fault(format!("{fault:#}"))),
            Err(e) if e.is_panic() => Err(ExecError::Fault(panic_message(e.into_panic()))),
            Err(e) => Err(ExecError::Wait(e.to_string())),
        }
    }

    async fn exec_in_thread(
        &self,
        thread: ThreadId,
        entry: u64,
        param: u64,
        timeout: Option<Duration>,
    ) -> Result<u64, ExecError> {
        let (jobs, alive) = {
            let worker = self.inner.workers.get(&thread).ok_or(ExecError::NoSuchThread(thread))?;
            (worker.jobs.clone(), worker.alive.clone())
        };
        if !alive.load(Ordering::SeqCst) {
            return Err(ExecError::ThreadExited(thread));
        }

        let (reply, result) = oneshot::channel();
        jobs.send(Job { entry, param, reply }).map_err(|_| ExecError::ThreadExited(thread))?;

        let received = match timeout {
            Some(limit) => tokio::time::timeout(limit, result)
                .await
                .map_err(|_| ExecError::Timeout(limit))?,
            None => result.await,
        };
        received.map_err(|_| ExecError::ThreadExited(thread))?
    }
}
