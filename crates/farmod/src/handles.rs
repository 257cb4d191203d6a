//! Type-safe handles for registry entries.
//!
//! Callers never hold a reference into registry storage. They hold a key plus the
//! serial number the entry was stored under; if the entry is removed or replaced,
//! the serial stops matching and the handle is dead.

use crate::record::ModuleType;

/// The identity of a registry slot: normalized base name plus module type.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ModuleKey {
    /// Lower-cased base filename (e.g. `"kernel32.dll"`).
    pub name: String,
    pub ty: ModuleType,
}

impl ModuleKey {
    /// Builds a key from any path or name, normalizing it to a lower-cased base filename.
    pub fn new(name: &str, ty: ModuleType) -> Self {
        Self { name: normalize(name), ty }
    }
}

/// Handle to one stored module record.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ModuleId {
    pub(crate) key: ModuleKey,
    pub(crate) serial: u64,
}

impl ModuleId {
    pub fn key(&self) -> &ModuleKey {
        &self.key
    }
}

impl std::fmt::Display for ModuleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{:?}#{}", self.key.name, self.key.ty, self.serial)
    }
}

/// Base filename of a Windows or POSIX style path.
pub fn base_name(path: &str) -> &str {
    path.rsplit(['\\', '/']).next().unwrap_or(path)
}

/// Lower-cased base filename; the registry's case-insensitive key form.
pub fn normalize(name: &str) -> String {
    base_name(name).to_lowercase()
}
