//! Simulated images and the native functions they export.

use std::sync::Arc;

use anyhow::anyhow;
use anyhow::bail;

use crate::sim::memory::SimMemory;
use crate::traits::Bitness;
use crate::traits::ProcessMemory;
use crate::traits::Protection;

/// A function body in the simulated target.
pub type NativeFn = Arc<dyn Fn(&mut SimFrame<'_>) -> anyhow::Result<SimValue> + Send + Sync>;

/// What a native function leaves in the return register.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SimValue {
    Void,
    Int(u64),
    Float(f64),
}

/// An argument as the callee sees it.
#[derive(Debug, Clone, PartialEq)]
pub enum SimArg {
    /// Integers and pointers, widened to 64 bits.
    Int(u64),
    Float(f32),
    Double(f64),
    /// An aggregate copied onto the callee's stack.
    Bytes(Vec<u8>),
}

/// The callee's view of one call: its arguments and the target's memory.
pub struct SimFrame<'a> {
    args: Vec<SimArg>,
    memory: &'a SimMemory,
    bitness: Bitness,
    pub(crate) last_error: u32,
}

impl<'a> SimFrame<'a> {
    pub(crate) fn new(args: Vec<SimArg>, memory: &'a SimMemory, bitness: Bitness) -> Self {
        Self { args, memory, bitness, last_error: 0 }
    }

    pub fn args(&self) -> &[SimArg] {
        &self.args
    }

    pub fn bitness(&self) -> Bitness {
        self.bitness
    }

    fn arg(&self, index: usize) -> anyhow::Result<&SimArg> {
        self.args.get(index).ok_or_else(|| anyhow!("argument {index} was not passed"))
    }

    pub fn u64(&self, index: usize) -> anyhow::Result<u64> {
        match self.arg(index)? {
            SimArg::Int(v) => Ok(*v),
            other => bail!("argument {index} is not an integer: {other:?}"),
        }
    }

    pub fn i32(&self, index: usize) -> anyhow::Result<i32> {
        Ok(self.u64(index)? as i32)
    }

    pub fn u32(&self, index: usize) -> anyhow::Result<u32> {
        Ok(self.u64(index)? as u32)
    }

    /// A pointer argument, truncated to the target's pointer width.
    pub fn ptr(&self, index: usize) -> anyhow::Result<u64> {
        Ok(self.u64(index)? & self.bitness.max_address())
    }

    pub fn f32(&self, index: usize) -> anyhow::Result<f32> {
        match self.arg(index)? {
            SimArg::Float(v) => Ok(*v),
            other => bail!("argument {index} is not a float: {other:?}"),
        }
    }

    pub fn f64(&self, index: usize) -> anyhow::Result<f64> {
        match self.arg(index)? {
            SimArg::Double(v) => Ok(*v),
            other => bail!("argument {index} is not a double: {other:?}"),
        }
    }

    pub fn bytes(&self, index: usize) -> anyhow::Result<&[u8]> {
        match self.arg(index)? {
            SimArg::Bytes(v) => Ok(v),
            other => bail!("argument {index} is not an aggregate: {other:?}"),
        }
    }

    pub fn read(&self, address: u64, len: usize) -> anyhow::Result<Vec<u8>> {
        let mut buf = vec![0; len];
        self.memory.read(address, &mut buf)?;
        Ok(buf)
    }

    pub fn write(&self, address: u64, data: &[u8]) -> anyhow::Result<()> {
        self.memory.write(address, data)
    }

    /// Reads a NUL-terminated narrow string.
    pub fn read_cstr(&self, address: u64) -> anyhow::Result<Vec<u8>> {
        let mut out = Vec::new();
        loop {
            let b = self.read(address + out.len() as u64, 1)?[0];
            if b == 0 {
                return Ok(out);
            }
            out.push(b);
        }
    }

    /// Reads a NUL-terminated UTF-16 string.
    pub fn read_wstr(&self, address: u64) -> anyhow::Result<String> {
        let mut units = Vec::new();
        loop {
            let raw = self.read(address + 2 * units.len() as u64, 2)?;
            let unit = u16::from_le_bytes([raw[0], raw[1]]);
            if unit == 0 {
                return Ok(String::from_utf16(&units)?);
            }
            units.push(unit);
        }
    }

    /// Allocates memory in the target, as a callee's own heap allocation would.
    pub fn alloc(&self, size: usize) -> anyhow::Result<u64> {
        self.memory.allocate(size, Protection::ReadWrite)
    }

    pub fn set_last_error(&mut self, code: u32) {
        self.last_error = code;
    }
}

pub(crate) enum SimExport {
    Native { name: Option<String>, ordinal: Option<u16>, func: NativeFn },
    Forward { name: String, module: String, symbol: String },
}

/// Builder for an image to load into a [`SimProcess`](crate::sim::SimProcess).
pub struct SimModule {
    pub(crate) path: String,
    pub(crate) exports: Vec<SimExport>,
    pub(crate) hidden: bool,
}

impl SimModule {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into(), exports: Vec::new(), hidden: false }
    }

    pub fn export<F>(mut self, name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&mut SimFrame<'_>) -> anyhow::Result<SimValue> + Send + Sync + 'static,
    {
        self.exports.push(SimExport::Native { name: Some(name.into()), ordinal: None, func: Arc::new(func) });
        self
    }

    /// Exports a function by ordinal only.
    pub fn export_ordinal<F>(mut self, ordinal: u16, func: F) -> Self
    where
        F: Fn(&mut SimFrame<'_>) -> anyhow::Result<SimValue> + Send + Sync + 'static,
    {
        self.exports.push(SimExport::Native { name: None, ordinal: Some(ordinal), func: Arc::new(func) });
        self
    }

    /// Exports `name` as a forwarder to `module.symbol`.
    pub fn forward(mut self, name: impl Into<String>, module: impl Into<String>, symbol: impl Into<String>) -> Self {
        self.exports.push(SimExport::Forward { name: name.into(), module: module.into(), symbol: symbol.into() });
        self
    }

    /// Leaves the image off the loader list, so only an address-space scan finds it.
    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }
}
