//! # Module Registry
//!
//! Concurrent map of module records for one attached process.
//!
//! ## Locking Discipline
//!
//! Entries live in a `DashMap`, so lookups and mutations never take a global lock.
//! Each record is an immutable `Arc`: a lookup racing a mutation sees either the
//! whole old record or the whole new one, never a half-written export table.
//! Check-and-insert goes through the map's entry API and is atomic per key.
//! `reset` clears shard by shard; it is not a snapshot barrier for lookups that
//! are already in flight.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::debug;

use crate::Error;
use crate::Result;
use crate::handles::ModuleId;
use crate::handles::ModuleKey;
use crate::handles::normalize;
use crate::record::ExportEntry;
use crate::record::ModuleRecord;
use crate::record::ModuleType;
use crate::record::Symbol;

/// Forwarded exports are followed at most this many hops.
pub const MAX_FORWARD_DEPTH: usize = 8;

/// How `get_module` matches the requested name.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SearchMode {
    /// Compare against the record's full image path.
    FullPath,
    /// Compare base filenames only.
    BaseName,
    /// Sweep the target's address space for mapped images first, then match by base name.
    AddressScan,
}

/// What a provider scan should walk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanKind {
    /// The target's loader module list.
    LoaderList,
    /// Every mapped image in the target's address space, including unlinked ones.
    AddressSpace,
}

/// The target-process side of the registry: discovers and unmaps images.
///
/// Implemented by whatever owns the attached process.
pub trait ModuleProvider: Send + Sync {
    /// Reports the images currently visible to the given scan.
    fn scan(&self, kind: ScanKind) -> anyhow::Result<Vec<ModuleRecord>>;

    /// Base address of the process's main executable image.
    fn main_image_base(&self) -> anyhow::Result<u64>;

    /// Asks the target to release the image.
    fn unload_image(&self, record: &ModuleRecord) -> anyhow::Result<()>;
}

/// A lookup result: a live handle plus a snapshot of the record.
#[derive(Clone, Debug)]
pub struct Module {
    pub id: ModuleId,
    pub record: Arc<ModuleRecord>,
}

impl std::ops::Deref for Module {
    type Target = ModuleRecord;

    fn deref(&self) -> &ModuleRecord {
        &self.record
    }
}

/// A resolved export.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExportData {
    /// Absolute address in the target.
    pub address: u64,
    /// Base name of the module that finally provided the address.
    pub module: String,
    /// True if at least one forwarder was followed.
    pub forwarded: bool,
}

struct Slot {
    serial: u64,
    record: Arc<ModuleRecord>,
}

/// Registry of the modules of one attached process.
pub struct ModuleRegistry {
    modules: DashMap<ModuleKey, Slot>,
    provider: Option<Arc<dyn ModuleProvider>>,
    default_type: ModuleType,
    main_base: AtomicU64,
    next_serial: AtomicU64,
}

impl ModuleRegistry {
    /// Creates an empty registry backed by a provider.
    ///
    /// `default_type` is the process-native module type, preferred when a lookup
    /// does not filter by type.
    pub fn new(provider: Arc<dyn ModuleProvider>, default_type: ModuleType) -> Self {
        Self::with_provider(Some(provider), default_type)
    }

    /// Creates a registry with no target behind it. Only manual records can be added.
    pub fn detached(default_type: ModuleType) -> Self {
        Self::with_provider(None, default_type)
    }

    fn with_provider(provider: Option<Arc<dyn ModuleProvider>>, default_type: ModuleType) -> Self {
        Self {
            modules: DashMap::new(),
            provider,
            default_type,
            main_base: AtomicU64::new(0),
            next_serial: AtomicU64::new(1),
        }
    }

    pub fn default_type(&self) -> ModuleType {
        self.default_type
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Re-reads the loader list.
    ///
    /// Scanned records are replaced by what the scan reports (and dropped if the scan
    /// no longer reports them). Manual records are never touched. Returns the number
    /// of records in the registry afterwards.
    pub fn refresh(&self) -> Result<usize> {
        let provider = self.provider()?;
        let records = provider.scan(ScanKind::LoaderList).map_err(Error::Provider)?;
        let main_base = provider.main_image_base().map_err(Error::Provider)?;

        let seen: HashSet<ModuleKey> = records.iter().map(ModuleRecord::key).collect();
        self.merge(records);
        self.modules.retain(|key, slot| slot.record.manual || seen.contains(key));
        self.main_base.store(main_base, Ordering::Release);

        debug!(modules = self.modules.len(), main_base, "registry refreshed");
        Ok(self.modules.len())
    }

    /// Looks up a module by name.
    ///
    /// With no type filter the registry's default type is tried first, then the other.
    pub fn get_module(&self, name: &str, mode: SearchMode, ty: Option<ModuleType>) -> Result<Module> {
        if mode == SearchMode::AddressScan {
            self.address_scan()?;
        }

        let types = match ty {
            Some(ty) => [Some(ty), None],
            None => [Some(self.default_type), Some(self.default_type.other())],
        };

        for ty in types.into_iter().flatten() {
            let Some(module) = self.lookup(&ModuleKey::new(name, ty)) else { continue };
            if mode == SearchMode::FullPath && !module.full_path.eq_ignore_ascii_case(name) {
                continue;
            }
            return Ok(module);
        }

        Err(Error::ModuleNotFound(name.to_string()))
    }

    /// The process's main executable image.
    pub fn get_main_module(&self) -> Result<Module> {
        let mut base = self.main_base.load(Ordering::Acquire);
        if base == 0 {
            if let Some(provider) = &self.provider {
                base = provider.main_image_base().map_err(Error::Provider)?;
                self.main_base.store(base, Ordering::Release);
            }
        }

        self.modules
            .iter()
            .find(|entry| !entry.record.manual && entry.record.base == base)
            .map(|entry| Module {
                id: ModuleId { key: entry.key().clone(), serial: entry.serial },
                record: entry.record.clone(),
            })
            .ok_or_else(|| Error::ModuleNotFound("<main module>".into()))
    }

    /// Snapshot of every registered module as `(name, type, module)`.
    ///
    /// Order follows the map's iteration order and is not stable across mutations.
    pub fn get_all_modules(&self, mode: SearchMode) -> Result<Vec<(String, ModuleType, Module)>> {
        if mode == SearchMode::AddressScan {
            self.address_scan()?;
        }

        Ok(self.modules
            .iter()
            .map(|entry| {
                let id = ModuleId { key: entry.key().clone(), serial: entry.serial };
                (entry.key().name.clone(), entry.key().ty, Module { id, record: entry.record.clone() })
            })
            .collect())
    }

    /// Resolves `module!symbol` to an absolute address, following forwarders.
    pub fn get_export(&self, module: &str, symbol: &Symbol) -> Result<ExportData> {
        let mut module_name = module.to_string();
        let mut symbol = symbol.clone();

        for depth in 0..=MAX_FORWARD_DEPTH {
            let found = self.get_module(&module_name, SearchMode::BaseName, None)?;
            let entry = found.export(&symbol).ok_or_else(|| Error::SymbolNotFound {
                module: found.name.clone(),
                symbol: symbol.clone(),
            })?;

            match entry {
                ExportEntry::Rva(rva) => {
                    return Ok(ExportData {
                        address: found.base + u64::from(*rva),
                        module: found.name.clone(),
                        forwarded: depth > 0,
                    });
                }
                ExportEntry::Forward { module, symbol: next } => {
                    debug!(from = %found.name, to = %module, symbol = %next, "following forwarded export");
                    module_name = forwarder_module(module);
                    symbol = next.clone();
                }
            }
        }

        Err(Error::ForwardLoop { module: module_name, symbol })
    }

    /// Registers an image the caller mapped itself.
    ///
    /// Fails without touching the registry if the key is already taken.
    pub fn add_manual_module(&self, record: ModuleRecord) -> Result<Module> {
        let record = Arc::new(record.manual());
        let key = record.key();

        match self.modules.entry(key.clone()) {
            Entry::Occupied(_) => Err(Error::AlreadyRegistered { name: key.name, ty: key.ty }),
            Entry::Vacant(vacant) => {
                let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
                vacant.insert(Slot { serial, record: record.clone() });
                debug!(module = %key.name, base = record.base, "manual module registered");
                Ok(Module { id: ModuleId { key, serial }, record })
            }
        }
    }

    /// Removes a manual record by name and type. Scanned records are left alone.
    pub fn remove_manual_module(&self, name: &str, ty: ModuleType) -> bool {
        self.modules
            .remove_if(&ModuleKey::new(name, ty), |_, slot| slot.record.manual)
            .is_some()
    }

    /// Returns the live record behind a handle.
    pub fn resolve(&self, id: &ModuleId) -> Option<Arc<ModuleRecord>> {
        self.modules
            .get(&id.key)
            .filter(|slot| slot.serial == id.serial)
            .map(|slot| slot.record.clone())
    }

    /// Forgets a record without touching the target. Returns false for a dead handle.
    pub fn unlink(&self, id: &ModuleId) -> bool {
        let removed = self.modules
            .remove_if(&id.key, |_, slot| slot.serial == id.serial)
            .is_some();
        if removed {
            debug!(module = %id, "module unlinked");
        }
        removed
    }

    /// Asks the target to unmap the image, then forgets the record.
    ///
    /// If the target refuses, the error is returned and the record stays registered,
    /// since the image is still mapped.
    pub fn unload(&self, id: &ModuleId) -> Result<()> {
        let record = self.resolve(id).ok_or_else(|| Error::StaleHandle(id.clone()))?;
        self.provider()?.unload_image(&record).map_err(Error::Provider)?;
        self.unlink(id);
        Ok(())
    }

    /// Drops every record, scanned and manual.
    pub fn reset(&self) {
        self.modules.clear();
        self.main_base.store(0, Ordering::Release);
        debug!("registry reset");
    }

    fn provider(&self) -> Result<&Arc<dyn ModuleProvider>> {
        self.provider.as_ref().ok_or(Error::NoProvider)
    }

    fn lookup(&self, key: &ModuleKey) -> Option<Module> {
        self.modules.get(key).map(|slot| Module {
            id: ModuleId { key: key.clone(), serial: slot.serial },
            record: slot.record.clone(),
        })
    }

    fn address_scan(&self) -> Result<()> {
        let records = self.provider()?.scan(ScanKind::AddressSpace).map_err(Error::Provider)?;
        self.merge(records);
        Ok(())
    }

    /// Inserts scanned records. A scanned record replaces a scanned one only if the
    /// image moved or changed size; manual records always win.
    fn merge(&self, records: Vec<ModuleRecord>) {
        for mut record in records {
            record.manual = false;
            let key = record.key();

            match self.modules.entry(key) {
                Entry::Occupied(mut occupied) => {
                    let current = &occupied.get().record;
                    if current.manual || (current.base == record.base && current.size == record.size) {
                        continue;
                    }
                    let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
                    occupied.insert(Slot { serial, record: Arc::new(record) });
                }
                Entry::Vacant(vacant) => {
                    let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
                    vacant.insert(Slot { serial, record: Arc::new(record) });
                }
            }
        }
    }
}

/// Forwarder strings name modules without an extension (`NTDLL.RtlFoo`).
fn forwarder_module(name: &str) -> String {
    let name = normalize(name);
    if name.contains('.') { name } else { format!("{}.dll", name) }
}
