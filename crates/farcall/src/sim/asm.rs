//! Assembler for the simulated target.
//!
//! Enforces the same encodability limits a real x86/x64 emitter has: 32-bit
//! operands on x86, and an object pointer for `thiscall`.

use anyhow::bail;

use crate::rpc::DONE_SIGNAL;
use crate::sim::isa::Emitter;
use crate::stub::CallConv;
use crate::stub::CallStub;
use crate::stub::ReturnKind;
use crate::stub::StubArg;
use crate::traits::AsmFactory;
use crate::traits::Bitness;
use crate::traits::CallAssembler;

/// Hands out [`SimAssembler`]s for either bitness.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimAsmFactory;

impl AsmFactory for SimAsmFactory {
    fn assembler(&self, bitness: Bitness) -> anyhow::Result<Box<dyn CallAssembler>> {
        Ok(Box::new(SimAssembler::new(bitness)))
    }
}

#[derive(Debug, Clone)]
pub struct SimAssembler {
    bitness: Bitness,
}

impl SimAssembler {
    pub fn new(bitness: Bitness) -> Self {
        Self { bitness }
    }
}

impl CallAssembler for SimAssembler {
    fn bitness(&self) -> Bitness {
        self.bitness
    }

    fn assemble(&mut self, stub: &CallStub) -> anyhow::Result<Vec<u8>> {
        let limit = self.bitness.max_address();
        if let Some(address) = stub.addresses().find(|&a| a > limit) {
            bail!("address {address:#x} does not fit a {:?} operand", self.bitness);
        }

        let mut args = Vec::with_capacity(stub.args.len() + 1);
        args.extend(stub.ret_buffer.map(StubArg::Pointer));
        args.extend_from_slice(&stub.args);

        // x64 has one calling convention; the tag only matters on x86.
        let conv = match self.bitness {
            Bitness::X64 => CallConv::Cdecl,
            Bitness::X86 => stub.conv,
        };
        if conv == CallConv::ThisCall && !matches!(args.first(), Some(StubArg::Pointer(_) | StubArg::Int { .. })) {
            bail!("thiscall needs an object pointer as its first argument");
        }
        if args.len() > usize::from(u8::MAX) {
            bail!("too many arguments: {}", args.len());
        }

        let mut e = Emitter::new(self.bitness);
        e.call(conv, stub.function, &args);
        if stub.ret != ReturnKind::Void {
            e.save_ret(stub.ret, stub.ret_slot);
        }
        e.save_last_error(stub.last_error_slot);
        e.signal(stub.done_flag, DONE_SIGNAL);
        e.exit();
        Ok(e.into_bytes())
    }
}
