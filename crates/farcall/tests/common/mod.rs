//! Shared fixture: a simulated target with one library of test exports.

#![allow(dead_code)]

use std::time::Duration;

use anyhow::anyhow;
use farcall::Bitness;
use farcall::Process;
use farcall::sim::SimModule;
use farcall::sim::SimProcess;
use farcall::sim::SimValue;
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .try_init();
}

/// `lib.dll` with one export per behavior the suite needs.
pub fn library() -> SimModule {
    SimModule::new(r"C:\sim\lib.dll")
        .export("Add", |f| Ok(SimValue::Int(f.i32(0)?.wrapping_add(f.i32(1)?) as u32 as u64)))
        .export("Wide", |f| Ok(SimValue::Int(f.u64(0)?.wrapping_add(f.u64(1)?))))
        .export("Fill", |f| {
            let (out, len) = (f.ptr(0)?, f.u64(1)? as usize);
            let pattern: Vec<u8> = (0..len).map(|i| i as u8).collect();
            f.write(out, &pattern)?;
            Ok(SimValue::Void)
        })
        .export("MakeRect", |f| {
            let (out, x, y) = (f.ptr(0)?, f.i32(1)?, f.i32(2)?);
            let rect: Vec<u8> = [x, y, x + 10, y + 10].iter().flat_map(|v| v.to_le_bytes()).collect();
            f.write(out, &rect)?;
            Ok(SimValue::Int(out))
        })
        .export("GetConfig", |f| {
            let config = f.alloc(24)?;
            f.write(config, &(1..=24).collect::<Vec<u8>>())?;
            Ok(SimValue::Int(config))
        })
        .export("Scale", |f| Ok(SimValue::Float(f.f64(0)? * f64::from(f.f32(1)?))))
        .export("Half", |f| Ok(SimValue::Float(f64::from(f.f32(0)? / 2.0))))
        .export("Len", |f| Ok(SimValue::Int(f.read_cstr(f.ptr(0)?)?.len() as u64)))
        .export("WLen", |f| Ok(SimValue::Int(f.read_wstr(f.ptr(0)?)?.chars().count() as u64)))
        .export("SumStruct", |f| {
            let sum: i32 = f.bytes(0)?
                .chunks_exact(4)
                .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .sum();
            Ok(SimValue::Int(sum as u32 as u64))
        })
        .export("Pack", |f| {
            let v = f.u64(0)?;
            Ok(SimValue::Int((v & 0xFFFF_FFFF) + (v >> 32)))
        })
        .export("SetErr", |f| {
            f.set_last_error(5);
            Ok(SimValue::Int(0))
        })
        .export("Crash", |_| Err(anyhow!("access violation writing 0x0")))
        .export("Boom", |_| panic!("unhandled exception"))
        .export("Hang", |_| {
            std::thread::sleep(Duration::from_millis(300));
            Ok(SimValue::Int(1))
        })
        .export_ordinal(7, |_| Ok(SimValue::Int(77)))
        .forward("OldAdd", "lib", "Add")
}

/// A running target with `lib.dll` loaded, and a process attached to it.
pub fn fixture(bitness: Bitness) -> (SimProcess, Process) {
    init_tracing();
    let target = SimProcess::new(bitness);
    target.load(library()).unwrap();
    let process = target.attach().unwrap();
    (target, process)
}
