//! # Process
//!
//! An attached target: its collaborators plus the one module registry that
//! belongs to it.

use std::sync::Arc;

use farmod::ModuleProvider;
use farmod::ModuleRegistry;
use farmod::Symbol;
use farval::ArgValue;
use tracing::info;

use crate::call::CallOptions;
use crate::call::RemoteCall;
use crate::stub::CallConv;
use crate::stub::ReturnKind;
use crate::traits::AsmFactory;
use crate::traits::Bitness;
use crate::traits::ProcessCore;
use crate::traits::ProcessMemory;
use crate::traits::RemoteThreads;

/// Attach failures.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("process {0} is not running")]
    NotRunning(u32),
    #[error("could not determine target bitness: {0:#}")]
    Bitness(anyhow::Error),
    #[error("initial module scan failed: {0}")]
    Modules(#[from] farmod::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// An attached target process.
pub struct Process {
    core: Arc<dyn ProcessCore>,
    memory: Arc<dyn ProcessMemory>,
    threads: Arc<dyn RemoteThreads>,
    asm: Arc<dyn AsmFactory>,
    modules: ModuleRegistry,
    bitness: Bitness,
}

impl Process {
    /// Attaches to a target and populates its registry from the loader list.
    pub fn attach<T>(target: Arc<T>, asm: Arc<dyn AsmFactory>) -> Result<Self>
    where
        T: ProcessCore + RemoteThreads + ModuleProvider + 'static,
    {
        if !target.is_alive() {
            return Err(Error::NotRunning(target.pid()));
        }
        let bitness = target.bitness().map_err(Error::Bitness)?;

        let modules = ModuleRegistry::new(target.clone(), bitness.module_type());
        let count = modules.refresh()?;
        info!(pid = target.pid(), ?bitness, modules = count, "attached");

        Ok(Self {
            core: target.clone(),
            memory: target.clone(),
            threads: target,
            asm,
            modules,
            bitness,
        })
    }

    pub fn pid(&self) -> u32 {
        self.core.pid()
    }

    pub fn bitness(&self) -> Bitness {
        self.bitness
    }

    /// True while the target is alive.
    pub fn is_valid(&self) -> bool {
        self.core.is_alive()
    }

    pub fn modules(&self) -> &ModuleRegistry {
        &self.modules
    }

    pub fn memory(&self) -> &Arc<dyn ProcessMemory> {
        &self.memory
    }

    pub(crate) fn threads(&self) -> &Arc<dyn RemoteThreads> {
        &self.threads
    }

    pub(crate) fn asm(&self) -> &Arc<dyn AsmFactory> {
        &self.asm
    }

    /// Calls `module!symbol` on a new thread with no timeout.
    ///
    /// The result is copied into `ret` (its length is the result size), and every
    /// data-pointer argument is refreshed from the target. See [`RemoteCall`] for
    /// the other options.
    #[allow(clippy::too_many_arguments)]
    pub async fn remote_call(
        &self,
        module: &str,
        symbol: impl Into<Symbol>,
        conv: CallConv,
        args: &mut [ArgValue],
        ret: &mut [u8],
        ret_kind: ReturnKind,
        by_reference: bool,
    ) -> crate::error::Result<()> {
        RemoteCall::new(module, symbol)
            .convention(conv)
            .returns(ret_kind)
            .options(CallOptions::default().by_reference(by_reference))
            .invoke(self, args, ret)
            .await
    }
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.pid())
            .field("bitness", &self.bitness)
            .field("modules", &self.modules.len())
            .finish()
    }
}
