//! # Module Records
//!
//! One record describes one image in the target: where it lives and what it exports.
//! Records are built once (by a scan or by the caller) and never mutated after they
//! enter the registry.

use std::collections::BTreeMap;
use std::collections::HashMap;

use crate::Error;
use crate::Result;
use crate::handles::ModuleKey;
use crate::handles::base_name;

/// Image bitness.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ModuleType {
    Mod32,
    Mod64,
}

impl ModuleType {
    /// The other bitness; used as the fallback when no type filter is given.
    pub fn other(self) -> Self {
        match self {
            Self::Mod32 => Self::Mod64,
            Self::Mod64 => Self::Mod32,
        }
    }
}

/// An export identifier: a name or an ordinal.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Symbol {
    Name(String),
    Ordinal(u16),
}

impl Symbol {
    /// True for an empty name. Ordinals are never empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Name(name) if name.is_empty())
    }
}

/// `"#12"` parses as ordinal 12; anything else is a name.
impl From<&str> for Symbol {
    fn from(text: &str) -> Self {
        text.strip_prefix('#')
            .and_then(|digits| digits.parse().ok())
            .map_or_else(|| Self::Name(text.to_string()), Self::Ordinal)
    }
}

impl From<String> for Symbol {
    fn from(text: String) -> Self {
        Self::from(text.as_str())
    }
}

impl From<u16> for Symbol {
    fn from(ordinal: u16) -> Self {
        Self::Ordinal(ordinal)
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Name(name) => f.write_str(name),
            Self::Ordinal(ordinal) => write!(f, "#{}", ordinal),
        }
    }
}

/// Where an export points.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExportEntry {
    /// Code or data at `base + rva`.
    Rva(u32),
    /// Forwarded to another module's export (e.g. `NTDLL.RtlAllocateHeap`).
    Forward { module: String, symbol: Symbol },
}

/// Exports of one image, addressable by name or ordinal.
///
/// Names resolve to slots and slots resolve to entries, as in a PE export
/// directory. A slot's ordinal is its index plus the table's ordinal base, so
/// rebasing shifts every ordinal at once.
///
/// Named exports get the next free slot. An ordinal-only export always keeps the
/// ordinal it asks for: if a named export was sitting there, that name moves to a
/// fresh slot. Two ordinal-only exports never share an ordinal.
#[derive(Clone, Debug)]
pub struct ExportTable {
    base: u16,
    by_name: HashMap<String, u16>,
    by_index: BTreeMap<u16, ExportEntry>,
}

impl Default for ExportTable {
    fn default() -> Self {
        Self::with_base(1)
    }
}

impl ExportTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base(base: u16) -> Self {
        Self { base, by_name: HashMap::new(), by_index: BTreeMap::new() }
    }

    /// The ordinal of slot 0.
    pub fn base(&self) -> u16 {
        self.base
    }

    /// Moves every ordinal so that slot 0 becomes `base`.
    pub fn set_base(&mut self, base: u16) -> Result<()> {
        let last = self.by_index.keys().next_back().copied().unwrap_or(0);
        if base.checked_add(last).is_none() {
            return Err(Error::OrdinalsExhausted);
        }
        self.base = base;
        Ok(())
    }

    /// Adds a named export and returns its ordinal. Re-adding a name replaces its
    /// entry in place.
    pub fn insert_named(&mut self, name: impl Into<String>, entry: ExportEntry) -> Result<u16> {
        let name = name.into();
        if let Some(&index) = self.by_name.get(&name) {
            self.by_index.insert(index, entry);
            return Ok(self.base + index);
        }

        let index = self.free_index()?;
        self.by_name.insert(name, index);
        self.by_index.insert(index, entry);
        Ok(self.base + index)
    }

    /// Adds an export reachable only by ordinal.
    pub fn insert_ordinal(&mut self, ordinal: u16, entry: ExportEntry) -> Result<()> {
        let index = ordinal
            .checked_sub(self.base)
            .ok_or(Error::OrdinalBelowBase { ordinal, base: self.base })?;

        if self.by_index.contains_key(&index) {
            let holder = self.by_name.iter().find(|(_, slot)| **slot == index).map(|(name, _)| name.clone());
            let Some(name) = holder else {
                return Err(Error::OrdinalTaken(ordinal));
            };
            let fresh = self.free_index()?;
            if let Some(moved) = self.by_index.remove(&index) {
                self.by_index.insert(fresh, moved);
            }
            self.by_name.insert(name, fresh);
        }

        self.by_index.insert(index, entry);
        Ok(())
    }

    /// Export names are case-sensitive.
    pub fn lookup(&self, symbol: &Symbol) -> Option<&ExportEntry> {
        match symbol {
            Symbol::Name(name) => self.by_name.get(name).and_then(|index| self.by_index.get(index)),
            Symbol::Ordinal(ordinal) => ordinal.checked_sub(self.base).and_then(|index| self.by_index.get(&index)),
        }
    }

    pub fn len(&self) -> usize {
        self.by_index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_index.is_empty()
    }

    /// Named exports and their ordinals, in no particular order.
    pub fn names(&self) -> impl Iterator<Item = (&str, u16)> {
        self.by_name.iter().map(|(name, index)| (name.as_str(), self.base + index))
    }

    /// The slot after the highest one in use, or the lowest gap once that runs
    /// past `u16::MAX`.
    fn free_index(&self) -> Result<u16> {
        let limit = u16::MAX - self.base;
        let next = match self.by_index.keys().next_back() {
            None => Some(0),
            Some(last) => last.checked_add(1).filter(|index| *index <= limit),
        };
        next.or_else(|| (0..=limit).find(|index| !self.by_index.contains_key(index)))
            .ok_or(Error::OrdinalsExhausted)
    }
}

/// A loaded (or manually mapped) image in the target.
#[derive(Clone, Debug)]
pub struct ModuleRecord {
    /// Base filename as reported by the target (original case).
    pub name: String,
    pub full_path: String,
    pub base: u64,
    pub size: u32,
    pub ty: ModuleType,
    /// Registered by the caller rather than discovered by a scan.
    pub manual: bool,
    pub exports: ExportTable,
}

impl ModuleRecord {
    pub fn new(full_path: impl Into<String>, base: u64, size: u32, ty: ModuleType) -> Self {
        let full_path = full_path.into();
        Self {
            name: base_name(&full_path).to_string(),
            full_path,
            base,
            size,
            ty,
            manual: false,
            exports: ExportTable::new(),
        }
    }

    /// Marks the record as manually registered.
    pub fn manual(mut self) -> Self {
        self.manual = true;
        self
    }

    /// Rebases the export table; see [`ExportTable::set_base`].
    pub fn with_ordinal_base(mut self, base: u16) -> Result<Self> {
        self.exports.set_base(base)?;
        Ok(self)
    }

    pub fn with_export(mut self, name: impl Into<String>, rva: u32) -> Result<Self> {
        self.exports.insert_named(name, ExportEntry::Rva(rva))?;
        Ok(self)
    }

    pub fn with_ordinal(mut self, ordinal: u16, rva: u32) -> Result<Self> {
        self.exports.insert_ordinal(ordinal, ExportEntry::Rva(rva))?;
        Ok(self)
    }

    /// Adds a named export that forwards to `module!symbol`.
    pub fn with_forward(
        mut self,
        name: impl Into<String>,
        module: impl Into<String>,
        symbol: impl Into<Symbol>,
    ) -> Result<Self> {
        let entry = ExportEntry::Forward { module: module.into(), symbol: symbol.into() };
        self.exports.insert_named(name, entry)?;
        Ok(self)
    }

    pub fn key(&self) -> ModuleKey {
        ModuleKey::new(&self.name, self.ty)
    }

    pub fn contains(&self, address: u64) -> bool {
        address >= self.base && address - self.base < u64::from(self.size)
    }

    pub fn export(&self, symbol: &Symbol) -> Option<&ExportEntry> {
        self.exports.lookup(symbol)
    }
}
