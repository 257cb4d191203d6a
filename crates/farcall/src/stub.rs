//! # Call Stubs
//!
//! The assembler-facing description of one remote call: which function, which
//! convention, which lowered arguments, and where the stub must leave its results.
//!
//! Every argument here is already a register-sized value or a pointer into the
//! shared region; payload copying happened before a `CallStub` is built.

/// Calling convention of the callee. On x64 every convention collapses to the
/// single platform ABI.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum CallConv {
    #[default]
    Cdecl,
    StdCall,
    /// First argument is the object pointer, passed in a register on x86.
    ThisCall,
    /// First two integer arguments in registers on x86.
    FastCall,
}

/// How the callee hands back its result.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ReturnKind {
    Void,
    #[default]
    Int32,
    Int64,
    Float,
    Double,
    /// An aggregate: returned through a hidden buffer, or as a pointer.
    Struct,
}

/// One lowered argument.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum StubArg {
    /// Integer immediate; `value` is already widened to 64 bits.
    Int { value: u64, width: u8 },
    Float(f32),
    Double(f64),
    Pointer(u64),
    /// Aggregate passed by value, copied onto the stack from `address`.
    Struct { address: u64, len: u32 },
}

impl StubArg {
    /// The target address this argument carries, if any.
    pub fn address(&self) -> Option<u64> {
        match self {
            Self::Pointer(address) | Self::Struct { address, .. } => Some(*address),
            _ => None,
        }
    }
}

/// Everything an assembler needs to emit a call stub.
#[derive(Clone, Debug, PartialEq)]
pub struct CallStub {
    pub function: u64,
    pub conv: CallConv,
    pub args: Vec<StubArg>,
    pub ret: ReturnKind,
    /// Hidden first argument for aggregates returned by value.
    pub ret_buffer: Option<u64>,
    /// Where to store the return register.
    pub ret_slot: u64,
    /// Where to store the thread's last-error value after the call.
    pub last_error_slot: u64,
    /// Set to [`DONE_SIGNAL`](crate::rpc::DONE_SIGNAL) as the stub's final act.
    pub done_flag: u64,
}

impl CallStub {
    /// Every target address the stub will embed, in emission order.
    pub fn addresses(&self) -> impl Iterator<Item = u64> + '_ {
        [self.function]
            .into_iter()
            .chain(self.ret_buffer)
            .chain(self.args.iter().filter_map(StubArg::address))
            .chain([self.ret_slot, self.last_error_slot, self.done_flag])
    }
}
