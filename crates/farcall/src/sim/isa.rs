//! # Stub Bytecode
//!
//! The instruction set the simulated target executes in place of machine code.
//!
//! ## Format
//!
//! - **Header**: `[Magic: 3b "FCS"][Bitness: 1b]`
//! - **Instructions**: `[Op: 1b][Operands]`
//! - **Call arguments**: `[Tag: 1b][Data: N]`
//!
//! All integers are Little-Endian. A program ends at the first `Exit`; anything
//! after it (page padding) is never decoded.

use crate::stub::CallConv;
use crate::stub::ReturnKind;
use crate::stub::StubArg;
use crate::traits::Bitness;

const MAGIC: &[u8; 3] = b"FCS";

/// Bytecode decoding errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("bad stub magic")]
    BadMagic,
    #[error("invalid opcode {0:#04x}")]
    InvalidOp(u8),
    #[error("invalid argument tag {0:#04x}")]
    InvalidTag(u8),
    #[error("invalid operand {what}: {value:#04x}")]
    InvalidOperand { what: &'static str, value: u8 },
    #[error("stub ends before its exit instruction")]
    UnexpectedEnd,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Opcodes.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// `[conv: 1b][target: 8b][argc: 1b][args...]`
    Call = 0x01,
    /// `[kind: 1b][address: 8b]`
    SaveRet = 0x02,
    /// `[address: 8b]`
    SaveLastError = 0x03,
    /// `[address: 8b][value: 8b]`
    Signal = 0x04,
    Exit = 0x05,
}

impl Op {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Op::Call),
            0x02 => Some(Op::SaveRet),
            0x03 => Some(Op::SaveLastError),
            0x04 => Some(Op::Signal),
            0x05 => Some(Op::Exit),
            _ => None,
        }
    }
}

/// Call argument tags.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    /// `[width: 1b][value: 8b]`
    Int = 0x10,
    F32 = 0x11,
    F64 = 0x12,
    Ptr = 0x13,
    /// `[address: 8b][len: 4b]`
    Struct = 0x14,
}

impl Tag {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x10 => Some(Tag::Int),
            0x11 => Some(Tag::F32),
            0x12 => Some(Tag::F64),
            0x13 => Some(Tag::Ptr),
            0x14 => Some(Tag::Struct),
            _ => None,
        }
    }
}

/// One decoded instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Instr {
    Call { conv: CallConv, target: u64, args: Vec<StubArg> },
    SaveRet { kind: ReturnKind, address: u64 },
    SaveLastError { address: u64 },
    Signal { address: u64, value: u64 },
    Exit,
}

/// A decoded stub.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub bitness: Bitness,
    pub instrs: Vec<Instr>,
}

fn bitness_to_u8(bitness: Bitness) -> u8 {
    match bitness {
        Bitness::X86 => 32,
        Bitness::X64 => 64,
    }
}

fn conv_to_u8(conv: CallConv) -> u8 {
    match conv {
        CallConv::Cdecl => 0,
        CallConv::StdCall => 1,
        CallConv::ThisCall => 2,
        CallConv::FastCall => 3,
    }
}

fn ret_to_u8(kind: ReturnKind) -> u8 {
    match kind {
        ReturnKind::Void => 0,
        ReturnKind::Int32 => 1,
        ReturnKind::Int64 => 2,
        ReturnKind::Float => 3,
        ReturnKind::Double => 4,
        ReturnKind::Struct => 5,
    }
}

// ============================================================================
//  ENCODER
// ============================================================================

/// Appends instructions to a byte buffer.
#[derive(Debug, Clone)]
pub struct Emitter {
    buf: Vec<u8>,
}

impl Emitter {
    pub fn new(bitness: Bitness) -> Self {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(MAGIC);
        buf.push(bitness_to_u8(bitness));
        Self { buf }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    fn op(&mut self, op: Op) {
        self.buf.push(op as u8);
    }

    fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn call(&mut self, conv: CallConv, target: u64, args: &[StubArg]) {
        self.op(Op::Call);
        self.buf.push(conv_to_u8(conv));
        self.u64(target);
        self.buf.push(args.len() as u8);
        for arg in args {
            match *arg {
                StubArg::Int { value, width } => {
                    self.buf.push(Tag::Int as u8);
                    self.buf.push(width);
                    self.u64(value);
                }
                StubArg::Float(v) => {
                    self.buf.push(Tag::F32 as u8);
                    self.buf.extend_from_slice(&v.to_le_bytes());
                }
                StubArg::Double(v) => {
                    self.buf.push(Tag::F64 as u8);
                    self.buf.extend_from_slice(&v.to_le_bytes());
                }
                StubArg::Pointer(p) => {
                    self.buf.push(Tag::Ptr as u8);
                    self.u64(p);
                }
                StubArg::Struct { address, len } => {
                    self.buf.push(Tag::Struct as u8);
                    self.u64(address);
                    self.buf.extend_from_slice(&len.to_le_bytes());
                }
            }
        }
    }

    pub fn save_ret(&mut self, kind: ReturnKind, address: u64) {
        self.op(Op::SaveRet);
        self.buf.push(ret_to_u8(kind));
        self.u64(address);
    }

    pub fn save_last_error(&mut self, address: u64) {
        self.op(Op::SaveLastError);
        self.u64(address);
    }

    pub fn signal(&mut self, address: u64, value: u64) {
        self.op(Op::Signal);
        self.u64(address);
        self.u64(value);
    }

    pub fn exit(&mut self) {
        self.op(Op::Exit);
    }
}

// ============================================================================
//  DECODER
// ============================================================================

/// Bounds-checked reader over stub bytes.
#[derive(Debug, Clone)]
pub struct Decoder<'a> {
    buf: &'a [u8],
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.buf.len() { return Err(Error::UnexpectedEnd); }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> { Ok(self.read_array::<1>()?[0]) }

    fn u32(&mut self) -> Result<u32> { Ok(u32::from_le_bytes(self.read_array()?)) }

    fn u64(&mut self) -> Result<u64> { Ok(u64::from_le_bytes(self.read_array()?)) }

    fn header(&mut self) -> Result<Bitness> {
        if self.read_bytes(MAGIC.len()).map_err(|_| Error::BadMagic)? != MAGIC {
            return Err(Error::BadMagic);
        }
        match self.u8()? {
            32 => Ok(Bitness::X86),
            64 => Ok(Bitness::X64),
            value => Err(Error::InvalidOperand { what: "bitness", value }),
        }
    }

    fn conv(&mut self) -> Result<CallConv> {
        match self.u8()? {
            0 => Ok(CallConv::Cdecl),
            1 => Ok(CallConv::StdCall),
            2 => Ok(CallConv::ThisCall),
            3 => Ok(CallConv::FastCall),
            value => Err(Error::InvalidOperand { what: "convention", value }),
        }
    }

    fn ret_kind(&mut self) -> Result<ReturnKind> {
        match self.u8()? {
            0 => Ok(ReturnKind::Void),
            1 => Ok(ReturnKind::Int32),
            2 => Ok(ReturnKind::Int64),
            3 => Ok(ReturnKind::Float),
            4 => Ok(ReturnKind::Double),
            5 => Ok(ReturnKind::Struct),
            value => Err(Error::InvalidOperand { what: "return kind", value }),
        }
    }

    fn arg(&mut self) -> Result<StubArg> {
        let b = self.u8()?;
        match Tag::from_u8(b).ok_or(Error::InvalidTag(b))? {
            Tag::Int => {
                let width = self.u8()?;
                Ok(StubArg::Int { width, value: self.u64()? })
            }
            Tag::F32 => Ok(StubArg::Float(f32::from_le_bytes(self.read_array()?))),
            Tag::F64 => Ok(StubArg::Double(f64::from_le_bytes(self.read_array()?))),
            Tag::Ptr => Ok(StubArg::Pointer(self.u64()?)),
            Tag::Struct => {
                let address = self.u64()?;
                Ok(StubArg::Struct { address, len: self.u32()? })
            }
        }
    }

    /// Decodes one instruction.
    pub fn instr(&mut self) -> Result<Instr> {
        let b = self.u8()?;
        match Op::from_u8(b).ok_or(Error::InvalidOp(b))? {
            Op::Call => {
                let conv = self.conv()?;
                let target = self.u64()?;
                let argc = self.u8()?;
                let args = (0..argc).map(|_| self.arg()).collect::<Result<Vec<_>>>()?;
                Ok(Instr::Call { conv, target, args })
            }
            Op::SaveRet => {
                let kind = self.ret_kind()?;
                Ok(Instr::SaveRet { kind, address: self.u64()? })
            }
            Op::SaveLastError => Ok(Instr::SaveLastError { address: self.u64()? }),
            Op::Signal => {
                let address = self.u64()?;
                Ok(Instr::Signal { address, value: self.u64()? })
            }
            Op::Exit => Ok(Instr::Exit),
        }
    }
}

/// Decodes a whole stub, up to and including its `Exit`.
pub fn decode(bytes: &[u8]) -> Result<Program> {
    let mut dec = Decoder::new(bytes);
    let bitness = dec.header()?;

    let mut instrs = Vec::new();
    loop {
        let instr = dec.instr()?;
        let done = instr == Instr::Exit;
        instrs.push(instr);
        if done {
            return Ok(Program { bitness, instrs });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_program_decodes_what_was_emitted() {
        let args = [
            StubArg::Int { value: 5, width: 4 },
            StubArg::Float(1.5),
            StubArg::Struct { address: 0x2000, len: 24 },
        ];
        let mut e = Emitter::new(Bitness::X86);
        e.call(CallConv::StdCall, 0x1000, &args);
        e.save_ret(ReturnKind::Int32, 0x3000);
        e.signal(0x3010, 1);
        e.exit();

        let mut bytes = e.into_bytes();
        bytes.extend_from_slice(&[0; 32]);

        let program = decode(&bytes).unwrap();
        assert_eq!(program.bitness, Bitness::X86);
        assert_eq!(program.instrs, vec![
            Instr::Call { conv: CallConv::StdCall, target: 0x1000, args: args.to_vec() },
            Instr::SaveRet { kind: ReturnKind::Int32, address: 0x3000 },
            Instr::Signal { address: 0x3010, value: 1 },
            Instr::Exit,
        ]);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert_eq!(decode(&[0; 16]), Err(Error::BadMagic));
        assert_eq!(decode(b"FC"), Err(Error::BadMagic));
        assert_eq!(decode(b"FCS\x40\x77"), Err(Error::InvalidOp(0x77)));
        assert_eq!(decode(b"FCS\x40\x03\x00"), Err(Error::UnexpectedEnd));

        let mut e = Emitter::new(Bitness::X64);
        e.save_last_error(0x10);
        assert_eq!(decode(&e.into_bytes()), Err(Error::UnexpectedEnd));
    }
}
