//! The error taxonomy used across every compilation and execution stage.
//!
//! One enum, hand-written `Display`, no derive macro — every stage wraps its own
//! message-carrying error into an `AnvilError` variant at its boundary.

use std::fmt;

#[derive(Debug, Clone)]
pub enum LowerError {
    UnresolvedLocal { id: u32 },
    UnresolvedParam { index: u8 },
    UncomputableSize { what: String },
}

#[derive(Debug, Clone)]
pub enum LinkError {
    UndefinedSymbol { name: String },
    DanglingLabel { label_id: u32 },
    UnknownFunction { id: u16 },
    NotAFunction { name: String },
    InvalidNativeId { id: u64 },
}

#[derive(Debug, Clone)]
pub enum DecodeError {
    UnknownOpcode { byte: u8, offset: usize },
    TruncatedOperand { offset: usize },
}

#[derive(Debug, Clone)]
pub enum RuntimeError {
    StackOverflow,
    StackUnderflow,
    DivisionByZero,
    InvalidNativeId { id: u64 },
    Native(NativeError),
    Err { offset: usize },
}

#[derive(Debug, Clone)]
pub struct NativeError {
    pub id: u64,
    pub status: i32,
}

#[derive(Debug, Clone)]
pub enum AnvilError {
    Lower(LowerError),
    Link(LinkError),
    Decode(DecodeError),
    Runtime(RuntimeError),
    Native(NativeError),
    Asm(String),
}

impl fmt::Display for LowerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LowerError::UnresolvedLocal { id } => write!(f, "unresolved local #{}", id),
            LowerError::UnresolvedParam { index } => write!(f, "unresolved parameter #{}", index),
            LowerError::UncomputableSize { what } => {
                write!(f, "could not compute byte size of {}", what)
            }
        }
    }
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkError::UndefinedSymbol { name } => write!(f, "undefined symbol '{}'", name),
            LinkError::DanglingLabel { label_id } => {
                write!(f, "label {} referenced but never defined", label_id)
            }
            LinkError::UnknownFunction { id } => write!(f, "no function with id {}", id),
            LinkError::NotAFunction { name } => {
                write!(f, "'{}' is not callable via CALL_UI64 (not a bytecode function)", name)
            }
            LinkError::InvalidNativeId { id } => {
                write!(f, "native function id {} has no registered callback", id)
            }
        }
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::UnknownOpcode { byte, offset } => {
                write!(f, "unknown opcode 0x{:02x} at offset {}", byte, offset)
            }
            DecodeError::TruncatedOperand { offset } => {
                write!(f, "truncated operand at offset {}", offset)
            }
        }
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::StackOverflow => write!(f, "stack overflow"),
            RuntimeError::StackUnderflow => write!(f, "stack underflow"),
            RuntimeError::DivisionByZero => write!(f, "division by zero"),
            RuntimeError::InvalidNativeId { id } => write!(f, "invalid native function id {}", id),
            RuntimeError::Native(e) => write!(f, "{}", e),
            RuntimeError::Err { offset } => write!(f, "ERR marker hit at offset {}", offset),
        }
    }
}

impl fmt::Display for NativeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "native function {} returned status {}", self.id, self.status)
    }
}

impl fmt::Display for AnvilError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnvilError::Lower(e) => write!(f, "lowering error: {}", e),
            AnvilError::Link(e) => write!(f, "link error: {}", e),
            AnvilError::Decode(e) => write!(f, "decode error: {}", e),
            AnvilError::Runtime(e) => write!(f, "runtime error: {}", e),
            AnvilError::Native(e) => write!(f, "native error: {}", e),
            AnvilError::Asm(msg) => write!(f, "assembler error: {}", msg),
        }
    }
}

impl std::error::Error for AnvilError {}

impl From<LowerError> for AnvilError {
    fn from(e: LowerError) -> Self {
        AnvilError::Lower(e)
    }
}

impl From<LinkError> for AnvilError {
    fn from(e: LinkError) -> Self {
        AnvilError::Link(e)
    }
}

impl From<DecodeError> for AnvilError {
    fn from(e: DecodeError) -> Self {
        AnvilError::Decode(e)
    }
}

impl From<RuntimeError> for AnvilError {
    fn from(e: RuntimeError) -> Self {
        match e {
            RuntimeError::Native(native) => AnvilError::Native(native),
            other => AnvilError::Runtime(other),
        }
    }
}

impl From<NativeError> for AnvilError {
    fn from(e: NativeError) -> Self {
        AnvilError::Native(e)
    }
}
