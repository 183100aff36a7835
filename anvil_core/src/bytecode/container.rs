//! An append-only, in-place-patchable byte buffer addressable by byte offset —
//! the per-function instruction stream.

use crate::error::DecodeError;

#[derive(Debug, Clone, Default)]
pub struct Bytecode {
    bytes: Vec<u8>,
}

impl Bytecode {
    pub fn new() -> Self {
        Bytecode { bytes: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// Appends a single fixed-size instruction's encoded bytes. Returns the byte
    /// offset of the first byte appended.
    pub fn append(&mut self, bytes: &[u8]) -> usize {
        let offset = self.bytes.len();
        self.bytes.extend_from_slice(bytes);
        offset
    }

    /// Appends several byte sequences back to back (e.g. an opcode followed by a
    /// separately-built operand tail). Returns the starting offset and the total
    /// number of bytes appended.
    pub fn append_many(&mut self, chunks: &[&[u8]]) -> (usize, usize) {
        let offset = self.bytes.len();
        let mut total = 0;
        for chunk in chunks {
            self.bytes.extend_from_slice(chunk);
            total += chunk.len();
        }
        (offset, total)
    }

    /// Reads `N` bytes starting at `offset`. Reads that run past the end of the
    /// buffer are padded with the `ERR` opcode byte (`0xff`), so a generic
    /// "fetch up to 10 bytes" decode step never panics on a malformed tail.
    pub fn read<const N: usize>(&self, offset: usize) -> [u8; N] {
        let mut out = [0xffu8; N];
        for i in 0..N {
            if let Some(&b) = self.bytes.get(offset + i) {
                out[i] = b;
            }
        }
        out
    }

    /// Overwrites `bytes.len()` bytes in place starting at `offset`. Only valid
    /// when `offset` and the length exactly match a previously appended
    /// instruction.
    pub fn patch(&mut self, offset: usize, bytes: &[u8]) {
        self.bytes[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// Inserts `n` zero bytes at `offset`, shifting everything after it forward.
    /// Used only by certain lowering fixups that need to widen an already-emitted
    /// region; not used by the linker, which patches in place.
    pub fn insert_padding(&mut self, offset: usize, n: usize) {
        let tail = self.bytes.split_off(offset);
        self.bytes.resize(offset + n, 0);
        self.bytes.extend(tail);
    }

    pub fn has_instruction(&self, offset: usize) -> bool {
        offset < self.bytes.len()
    }

    /// Reads the opcode byte at `offset`, surfacing a [`DecodeError`] if it is not
    /// a recognized opcode.
    pub fn decode_opcode(&self, offset: usize) -> Result<crate::bytecode::opcode::Opcode, DecodeError> {
        if !self.has_instruction(offset) {
            return Err(DecodeError::TruncatedOperand { offset });
        }
        crate::bytecode::opcode::Opcode::from_u8(self.bytes[offset])
            .map_err(|byte| DecodeError::UnknownOpcode { byte, offset })
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.bytes
    }
}

impl From<Vec<u8>> for Bytecode {
    fn from(bytes: Vec<u8>) -> Self {
        Bytecode { bytes }
    }
}
