//! # farmod
//!
//! The module registry of one attached target process.
//!
//! ## Architecture
//!
//! A `ModuleRegistry` maps `(base name, module type)` keys to immutable
//! [`ModuleRecord`]s. Records come from two places:
//!
//! - **Scans**: a [`ModuleProvider`] walks the target's loader list (or sweeps its
//!   address space) and reports what it finds.
//! - **Manual registration**: images the caller mapped itself, which no scan will see.
//!
//! Lookups hand out a [`Module`]: an `Arc` snapshot of the record plus an opaque
//! [`ModuleId`]. The id is checked on every use, so a handle that outlived an
//! `unlink`, `unload` or `reset` is rejected instead of dangling.
//!
//! ## Export Resolution
//!
//! `get_export` turns `(module, symbol)` into an absolute address in the target,
//! following forwarded exports through the registry.

pub mod handles;
pub mod record;
pub mod registry;

#[cfg(test)]
mod tests;

pub use handles::ModuleId;
pub use handles::ModuleKey;
pub use record::ExportEntry;
pub use record::ExportTable;
pub use record::ModuleRecord;
pub use record::ModuleType;
pub use record::Symbol;
pub use registry::ExportData;
pub use registry::Module;
pub use registry::ModuleProvider;
pub use registry::ModuleRegistry;
pub use registry::ScanKind;
pub use registry::SearchMode;

/// Registry errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No record matches the module name (and type filter).
    #[error("module not found: {0}")]
    ModuleNotFound(String),
    /// The module exists but does not export the symbol.
    #[error("symbol {symbol} not exported by {module}")]
    SymbolNotFound { module: String, symbol: Symbol },
    /// A chain of forwarded exports did not terminate.
    #[error("forwarded export {module}!{symbol} exceeds the forwarding depth")]
    ForwardLoop { module: String, symbol: Symbol },
    /// A record with the same key is already registered.
    #[error("module {name} ({ty:?}) is already registered")]
    AlreadyRegistered { name: String, ty: ModuleType },
    /// An ordinal-only export would take an ordinal another ordinal-only export holds.
    #[error("ordinal #{0} is already exported")]
    OrdinalTaken(u16),
    /// The ordinal lies below the table's ordinal base.
    #[error("ordinal #{ordinal} is below the ordinal base {base}")]
    OrdinalBelowBase { ordinal: u16, base: u16 },
    /// Every ordinal from the base up to `u16::MAX` is in use.
    #[error("export table has no free ordinal")]
    OrdinalsExhausted,
    /// The handle no longer refers to a live record.
    #[error("stale module handle: {0}")]
    StaleHandle(ModuleId),
    /// The operation needs the target process, but the registry is detached.
    #[error("registry has no module provider")]
    NoProvider,
    /// The module provider failed.
    #[error("module provider failed: {0:#}")]
    Provider(anyhow::Error),
}

/// Specialized `Result` for registry operations.
pub type Result<T> = std::result::Result<T, Error>;
