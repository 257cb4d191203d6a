//! Registry tests against a scripted provider.

use std::sync::Arc;
use std::sync::Barrier;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use crate::*;

const MAIN_BASE: u64 = 0x0040_0000;

/// Provider serving a fixed loader list plus images only an address sweep finds.
struct ScriptedProvider {
    loader: Mutex<Vec<ModuleRecord>>,
    hidden: Vec<ModuleRecord>,
    refuse_unload: AtomicBool,
    unloaded: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    fn new() -> Self {
        let main = ModuleRecord::new(r"C:\app\app.exe", MAIN_BASE, 0x10000, ModuleType::Mod64)
            .with_export("main", 0x1000)
            .unwrap();
        let lib = ModuleRecord::new(r"C:\app\lib.dll", 0x1000_0000, 0x4000, ModuleType::Mod64)
            .with_export("Add", 0x1100)
            .and_then(|r| r.with_ordinal(40, 0x1200))
            .and_then(|r| r.with_forward("OldAdd", "LIB", "Add"))
            .and_then(|r| r.with_forward("Spin", "lib.dll", "Spin"))
            .unwrap();
        let lib32 = ModuleRecord::new(r"C:\app\x86\lib.dll", 0x2000_0000, 0x4000, ModuleType::Mod32)
            .with_export("Add", 0x900)
            .unwrap();
        let hidden = ModuleRecord::new(r"C:\tmp\ghost.dll", 0x3000_0000, 0x1000, ModuleType::Mod64)
            .with_export("Boo", 0x10)
            .unwrap();

        Self {
            loader: Mutex::new(vec![main, lib, lib32]),
            hidden: vec![hidden],
            refuse_unload: AtomicBool::new(false),
            unloaded: Mutex::new(Vec::new()),
        }
    }
}

impl ModuleProvider for ScriptedProvider {
    fn scan(&self, kind: ScanKind) -> anyhow::Result<Vec<ModuleRecord>> {
        let mut records = self.loader.lock().unwrap().clone();
        if kind == ScanKind::AddressSpace {
            records.extend(self.hidden.iter().cloned());
        }
        Ok(records)
    }

    fn main_image_base(&self) -> anyhow::Result<u64> {
        Ok(MAIN_BASE)
    }

    fn unload_image(&self, record: &ModuleRecord) -> anyhow::Result<()> {
        if self.refuse_unload.load(Ordering::SeqCst) {
            anyhow::bail!("image {} is pinned", record.name);
        }
        self.unloaded.lock().unwrap().push(record.name.clone());
        Ok(())
    }
}

fn registry() -> (Arc<ScriptedProvider>, ModuleRegistry) {
    let provider = Arc::new(ScriptedProvider::new());
    let registry = ModuleRegistry::new(provider.clone(), ModuleType::Mod64);
    registry.refresh().unwrap();
    (provider, registry)
}

// ============================================================================
//  LOOKUP
// ============================================================================

#[test]
fn test_lookup_is_case_insensitive() {
    let (_, reg) = registry();
    let module = reg.get_module("LIB.DLL", SearchMode::BaseName, None).unwrap();
    assert_eq!(module.base, 0x1000_0000);
    assert_eq!(module.ty, ModuleType::Mod64);
}

#[test]
fn test_type_filter_selects_bitness() {
    let (_, reg) = registry();
    let module = reg.get_module("lib.dll", SearchMode::BaseName, Some(ModuleType::Mod32)).unwrap();
    assert_eq!(module.base, 0x2000_0000);

    let detached = ModuleRegistry::detached(ModuleType::Mod64);
    detached.add_manual_module(ModuleRecord::new("only32.dll", 0x5000, 0x100, ModuleType::Mod32)).unwrap();
    let fallback = detached.get_module("only32.dll", SearchMode::BaseName, None).unwrap();
    assert_eq!(fallback.ty, ModuleType::Mod32);
    assert!(detached.get_module("only32.dll", SearchMode::BaseName, Some(ModuleType::Mod64)).is_err());
}

#[test]
fn test_full_path_mode_compares_whole_path() {
    let (_, reg) = registry();
    assert!(reg.get_module(r"c:\APP\lib.dll", SearchMode::FullPath, None).is_ok());
    assert!(matches!(
        reg.get_module(r"D:\elsewhere\lib.dll", SearchMode::FullPath, None),
        Err(Error::ModuleNotFound(_))
    ));
}

#[test]
fn test_address_scan_finds_unlinked_images() {
    let (_, reg) = registry();
    assert!(reg.get_module("ghost.dll", SearchMode::BaseName, None).is_err());

    let ghost = reg.get_module("ghost.dll", SearchMode::AddressScan, None).unwrap();
    assert_eq!(ghost.base, 0x3000_0000);
    assert_eq!(reg.get_all_modules(SearchMode::BaseName).unwrap().len(), 4);
}

#[test]
fn test_main_module() {
    let (_, reg) = registry();
    let main = reg.get_main_module().unwrap();
    assert_eq!(main.name, "app.exe");
}

#[test]
fn test_get_all_modules_reports_keys() {
    let (_, reg) = registry();
    let all = reg.get_all_modules(SearchMode::BaseName).unwrap();
    assert_eq!(all.len(), 3);
    assert!(all.iter().any(|(name, ty, _)| name == "lib.dll" && *ty == ModuleType::Mod32));
}

// ============================================================================
//  EXPORTS
// ============================================================================

#[test]
fn test_export_resolves_to_absolute_address() {
    let (_, reg) = registry();
    let export = reg.get_export("lib.dll", &"Add".into()).unwrap();
    assert_eq!(export.address, 0x1000_1100);
    assert!(!export.forwarded);

    let by_ordinal = reg.get_export("lib.dll", &Symbol::Ordinal(40)).unwrap();
    assert_eq!(by_ordinal.address, 0x1000_1200);
}

#[test]
fn test_forwarded_export_is_followed() {
    let (_, reg) = registry();
    let export = reg.get_export("lib.dll", &"OldAdd".into()).unwrap();
    assert_eq!(export.address, 0x1000_1100);
    assert!(export.forwarded);
}

#[test]
fn test_forward_cycle_is_bounded() {
    let (_, reg) = registry();
    assert!(matches!(reg.get_export("lib.dll", &"Spin".into()), Err(Error::ForwardLoop { .. })));
}

#[test]
fn test_missing_module_and_symbol() {
    let (_, reg) = registry();
    assert!(matches!(reg.get_export("missing.dll", &"Add".into()), Err(Error::ModuleNotFound(_))));
    assert!(matches!(reg.get_export("lib.dll", &"Nope".into()), Err(Error::SymbolNotFound { .. })));
}

// ============================================================================
//  MUTATION
// ============================================================================

#[test]
fn test_duplicate_manual_registration_keeps_original() {
    let reg = ModuleRegistry::detached(ModuleType::Mod64);
    let mapped = ModuleRecord::new("mapped.dll", 0x7000_0000, 0x1000, ModuleType::Mod64)
        .with_export("F", 0x10)
        .unwrap();
    let first = reg.add_manual_module(mapped).unwrap();

    let dup = reg.add_manual_module(ModuleRecord::new("MAPPED.dll", 0x7100_0000, 0x1000, ModuleType::Mod64));
    assert!(matches!(dup, Err(Error::AlreadyRegistered { .. })));

    let again = reg.get_module("mapped.dll", SearchMode::BaseName, None).unwrap();
    assert_eq!(again.id, first.id);
    assert_eq!(again.base, 0x7000_0000);
    assert_eq!(reg.get_export("mapped.dll", &"F".into()).unwrap().address, 0x7000_0010);
}

#[test]
fn test_manual_collides_with_scanned_record() {
    let (_, reg) = registry();
    let dup = reg.add_manual_module(ModuleRecord::new("lib.dll", 0x9000_0000, 0x1000, ModuleType::Mod64));
    assert!(matches!(dup, Err(Error::AlreadyRegistered { .. })));
    assert_eq!(reg.get_module("lib.dll", SearchMode::BaseName, None).unwrap().base, 0x1000_0000);
}

#[test]
fn test_refresh_keeps_manual_records() {
    let (provider, reg) = registry();
    reg.add_manual_module(ModuleRecord::new("mapped.dll", 0x7000_0000, 0x1000, ModuleType::Mod64)).unwrap();

    provider.loader.lock().unwrap().retain(|r| r.name != "lib.dll" || r.ty != ModuleType::Mod64);
    reg.refresh().unwrap();

    assert!(reg.get_module("mapped.dll", SearchMode::BaseName, None).unwrap().manual);
    assert_eq!(reg.get_module("lib.dll", SearchMode::BaseName, None).unwrap().ty, ModuleType::Mod32);
}

#[test]
fn test_remove_manual_module_ignores_scanned() {
    let (_, reg) = registry();
    reg.add_manual_module(ModuleRecord::new("mapped.dll", 0x7000_0000, 0x1000, ModuleType::Mod64)).unwrap();

    assert!(!reg.remove_manual_module("lib.dll", ModuleType::Mod64));
    assert!(reg.remove_manual_module("Mapped.DLL", ModuleType::Mod64));
    assert!(!reg.remove_manual_module("mapped.dll", ModuleType::Mod64));
}

#[test]
fn test_unlink_invalidates_handle() {
    let (provider, reg) = registry();
    let lib = reg.get_module("lib.dll", SearchMode::BaseName, None).unwrap();

    assert!(reg.unlink(&lib.id));
    assert!(!reg.unlink(&lib.id));
    assert!(reg.resolve(&lib.id).is_none());
    assert!(provider.unloaded.lock().unwrap().is_empty());
    // The 32-bit image is now the only candidate.
    assert_eq!(reg.get_module("lib.dll", SearchMode::BaseName, None).unwrap().ty, ModuleType::Mod32);
}

#[test]
fn test_unload_asks_the_target() {
    let (provider, reg) = registry();
    let lib = reg.get_module("lib.dll", SearchMode::BaseName, Some(ModuleType::Mod64)).unwrap();

    reg.unload(&lib.id).unwrap();
    assert_eq!(*provider.unloaded.lock().unwrap(), vec!["lib.dll".to_string()]);
    assert!(matches!(reg.unload(&lib.id), Err(Error::StaleHandle(_))));
}

#[test]
fn test_failed_unload_is_surfaced_and_keeps_record() {
    let (provider, reg) = registry();
    provider.refuse_unload.store(true, Ordering::SeqCst);
    let lib = reg.get_module("lib.dll", SearchMode::BaseName, None).unwrap();

    assert!(matches!(reg.unload(&lib.id), Err(Error::Provider(_))));
    assert!(reg.resolve(&lib.id).is_some());
}

#[test]
fn test_unload_without_provider() {
    let reg = ModuleRegistry::detached(ModuleType::Mod64);
    let module = reg.add_manual_module(ModuleRecord::new("m.dll", 0x1000, 0x100, ModuleType::Mod64)).unwrap();
    assert!(matches!(reg.unload(&module.id), Err(Error::NoProvider)));
}

#[test]
fn test_reset_empties_until_repopulated() {
    let (_, reg) = registry();
    let lib = reg.get_module("lib.dll", SearchMode::BaseName, None).unwrap();
    reg.add_manual_module(ModuleRecord::new("mapped.dll", 0x7000_0000, 0x1000, ModuleType::Mod64)).unwrap();

    reg.reset();

    assert!(reg.is_empty());
    assert!(reg.get_module("lib.dll", SearchMode::BaseName, None).is_err());
    assert!(reg.get_module("mapped.dll", SearchMode::BaseName, None).is_err());
    assert!(reg.get_export("lib.dll", &"Add".into()).is_err());
    assert!(reg.resolve(&lib.id).is_none());

    reg.refresh().unwrap();
    assert!(reg.get_export("lib.dll", &"Add".into()).is_ok());
    // A handle from before the reset stays dead even though the key is back.
    assert!(reg.resolve(&lib.id).is_none());
}

// ============================================================================
//  CONCURRENCY
// ============================================================================

#[test]
fn test_racing_manual_registration_has_one_winner() {
    let reg = ModuleRegistry::detached(ModuleType::Mod64);
    let start = Barrier::new(16);

    let results: Vec<(u64, Result<Module>)> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..16u64)
            .map(|i| {
                let (reg, start) = (&reg, &start);
                s.spawn(move || {
                    let base = 0x7000_0000 + i * 0x1_0000;
                    let record = ModuleRecord::new("race.dll", base, 0x1000, ModuleType::Mod64)
                        .manual()
                        .with_export("F", 0x10)
                        .unwrap();
                    start.wait();
                    (base, reg.add_manual_module(record))
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let winners: Vec<u64> = results.iter().filter(|(_, r)| r.is_ok()).map(|(base, _)| *base).collect();
    assert_eq!(winners.len(), 1);
    assert!(
        results
            .iter()
            .filter(|(_, r)| r.is_err())
            .all(|(_, r)| matches!(r, Err(Error::AlreadyRegistered { .. })))
    );

    let stored = reg.get_module("race.dll", SearchMode::BaseName, None).unwrap();
    assert_eq!(stored.base, winners[0]);
    assert_eq!(reg.get_export("race.dll", &"F".into()).unwrap().address, winners[0] + 0x10);
    assert_eq!(reg.len(), 1);
}

#[test]
fn test_lookups_see_whole_records_while_reregistering() {
    let reg = ModuleRegistry::detached(ModuleType::Mod64);
    let old = ModuleRecord::new("swap.dll", 0x7000_0000, 0x1000, ModuleType::Mod64)
        .with_export("F", 0x10)
        .unwrap();
    let new = ModuleRecord::new("swap.dll", 0x7100_0000, 0x1000, ModuleType::Mod64)
        .with_export("F", 0x20)
        .and_then(|r| r.with_export("G", 0x30))
        .unwrap();
    reg.add_manual_module(old.clone()).unwrap();
    let done = AtomicBool::new(false);

    std::thread::scope(|s| {
        s.spawn(|| {
            for round in 0..500 {
                reg.remove_manual_module("swap.dll", ModuleType::Mod64);
                let next = if round % 2 == 0 { new.clone() } else { old.clone() };
                reg.add_manual_module(next).unwrap();
            }
            done.store(true, Ordering::SeqCst);
        });

        for _ in 0..4 {
            s.spawn(|| {
                while !done.load(Ordering::SeqCst) {
                    let Ok(module) = reg.get_module("swap.dll", SearchMode::BaseName, None) else { continue };
                    match module.base {
                        0x7000_0000 => {
                            assert_eq!(module.exports.len(), 1);
                            assert_eq!(module.export(&"F".into()), Some(&ExportEntry::Rva(0x10)));
                        }
                        0x7100_0000 => {
                            assert_eq!(module.exports.len(), 2);
                            assert_eq!(module.export(&"F".into()), Some(&ExportEntry::Rva(0x20)));
                        }
                        other => panic!("unexpected base {other:#x}"),
                    }
                }
            });
        }
    });
}

#[test]
fn test_lookups_during_reset_and_refresh() {
    let (_, reg) = registry();
    let done = AtomicBool::new(false);

    std::thread::scope(|s| {
        s.spawn(|| {
            for _ in 0..200 {
                reg.reset();
                reg.refresh().unwrap();
            }
            done.store(true, Ordering::SeqCst);
        });

        for _ in 0..4 {
            s.spawn(|| {
                while !done.load(Ordering::SeqCst) {
                    match reg.get_export("lib.dll", &"Add".into()) {
                        Ok(export) => assert_eq!(export.address, 0x1000_1100),
                        Err(err) => assert!(matches!(err, Error::ModuleNotFound(_)), "{err}"),
                    }
                    if let Ok(lib) = reg.get_module("lib.dll", SearchMode::BaseName, Some(ModuleType::Mod64)) {
                        assert_eq!(lib.exports.len(), 4);
                        assert_eq!(lib.export(&Symbol::Ordinal(40)), Some(&ExportEntry::Rva(0x1200)));
                    }
                }
            });
        }
    });

    assert!(reg.get_export("lib.dll", &"Add".into()).is_ok());
}
