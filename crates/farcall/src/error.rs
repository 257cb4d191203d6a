//! # Error Definitions
//!
//! One variant per protocol step. Every failure is a value returned to the caller;
//! nothing here terminates the controller.

use std::time::Duration;

use farmod::Symbol;

use crate::traits::ThreadId;

/// Failures reported by a [`RemoteThreads`](crate::traits::RemoteThreads) collaborator.
///
/// Kept apart from `CallError` so a timeout can never be mistaken for a crash.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// The wait gave up. The target thread may still be running.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    /// The target thread faulted (access violation, unhandled exception, ...).
    #[error("target thread faulted: {0}")]
    Fault(String),
    /// The execution context thread is gone.
    #[error("target thread {0} has exited")]
    ThreadExited(ThreadId),
    /// No such thread in the target.
    #[error("no thread {0} in the target")]
    NoSuchThread(ThreadId),
    /// The remote thread could not be started.
    #[error("could not start remote thread: {0:#}")]
    Spawn(anyhow::Error),
    /// The wait primitive itself failed.
    #[error("wait failed: {0}")]
    Wait(String),
}

/// Remote call failures, one per protocol step.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    /// A required handle or specifier is missing or malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// The module is not registered or does not export the symbol.
    #[error("symbol not found: {module}!{symbol}")]
    SymbolNotFound {
        module: String,
        symbol: Symbol,
        #[source]
        cause: farmod::Error,
    },
    /// The shared argument/result region could not be established.
    #[error("rpc environment setup failed: {0:#}")]
    EnvironmentSetupFailed(anyhow::Error),
    /// The call shape cannot be encoded for the target, or the stub could not be placed.
    #[error("call assembly failed: {0:#}")]
    AssemblyFailed(anyhow::Error),
    /// The stub did not run to completion.
    #[error("remote execution failed: {0}")]
    ExecutionFailed(#[source] ExecError),
    /// The caller's timeout elapsed before the stub signalled completion.
    #[error("remote execution timed out after {0:?}")]
    Timeout(Duration),
    /// The result could not be read back after a completed call.
    #[error("reading the call result failed: {0:#}")]
    ResultReadFailed(anyhow::Error),
    /// The call ran and its result was read, but an output buffer could not be copied back.
    #[error("call executed but output argument {index} could not be synchronized: {cause:#}")]
    OutputSyncFailed { index: usize, cause: anyhow::Error },
}

impl CallError {
    /// The integer status of this failure. Success is `0`.
    pub fn code(&self) -> i32 {
        match self {
            Self::InvalidArgument(_) => -1,
            Self::SymbolNotFound { .. } => -2,
            Self::EnvironmentSetupFailed(_) => -3,
            Self::AssemblyFailed(_) => -4,
            Self::ExecutionFailed(_) => -5,
            Self::ResultReadFailed(_) => -6,
            Self::OutputSyncFailed { .. } => -7,
            Self::Timeout(_) => -8,
        }
    }

    /// True if the remote function ran to completion despite this error.
    pub fn executed(&self) -> bool {
        matches!(self, Self::OutputSyncFailed { .. })
    }
}

impl From<ExecError> for CallError {
    fn from(e: ExecError) -> Self {
        match e {
            ExecError::Timeout(limit) => Self::Timeout(limit),
            other => Self::ExecutionFailed(other),
        }
    }
}

/// A specialized Result type for remote calls.
pub type Result<T> = std::result::Result<T, CallError>;

/// Flattens a call result into its integer status: `0` or a negative error code.
pub fn status<T>(result: &Result<T>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(e) => e.code(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_distinct_and_negative() {
        let errors = [
            CallError::InvalidArgument("x"),
            CallError::SymbolNotFound {
                module: "m".into(),
                symbol: "s".into(),
                cause: farmod::Error::ModuleNotFound("m".into()),
            },
            CallError::EnvironmentSetupFailed(anyhow::anyhow!("x")),
            CallError::AssemblyFailed(anyhow::anyhow!("x")),
            CallError::ExecutionFailed(ExecError::Fault("x".into())),
            CallError::ResultReadFailed(anyhow::anyhow!("x")),
            CallError::OutputSyncFailed { index: 0, cause: anyhow::anyhow!("x") },
            CallError::Timeout(Duration::from_millis(1)),
        ];

        let mut codes: Vec<i32> = errors.iter().map(CallError::code).collect();
        assert!(codes.iter().all(|&c| c < 0));
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
        assert_eq!(errors.iter().filter(|e| e.executed()).count(), 1);
    }

    #[test]
    fn test_timeout_stays_distinct_from_failure() {
        let timeout: CallError = ExecError::Timeout(Duration::from_secs(1)).into();
        assert!(matches!(timeout, CallError::Timeout(_)));

        let fault: CallError = ExecError::Fault("boom".into()).into();
        assert!(matches!(fault, CallError::ExecutionFailed(ExecError::Fault(_))));
    }

    #[test]
    fn test_status_of_success_is_zero() {
        assert_eq!(status(&Ok::<_, CallError>(())), 0);
        assert_eq!(status::<()>(&Err(CallError::InvalidArgument("x"))), -1);
    }
}
