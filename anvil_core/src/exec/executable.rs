//! [`Executable`]: the linker's output — one concatenated [`Bytecode`] buffer
//! plus the native-function callback table it was linked against.

use crate::bytecode::Bytecode;
use crate::native::NativeFn;

/// A fully linked program: every function's bytecode concatenated in
/// `FunctionId` order, with every `JMPR`/`JRZ`/`JRNZ` displacement and
/// `CALL_UI64` target already resolved to concrete byte offsets inside this
/// one buffer. Read-only once built; safe to share by reference across
/// independently executing VMs (§5).
#[derive(Debug, Clone)]
pub struct Executable {
    code: Bytecode,
    natives: Vec<NativeFn>,
    /// `FunctionId` (index) -> absolute byte offset of that function's first
    /// instruction in `code`. Kept around for tests and diagnostics; the VM
    /// itself only ever needs a single starting offset.
    function_starts: Vec<u64>,
}

impl Executable {
    pub fn new(code: Bytecode, natives: Vec<NativeFn>, function_starts: Vec<u64>) -> Self {
        Executable {
            code,
            natives,
            function_starts,
        }
    }

    pub fn code(&self) -> &Bytecode {
        &self.code
    }

    pub fn natives(&self) -> &[NativeFn] {
        &self.natives
    }

    pub fn function_starts(&self) -> &[u64] {
        &self.function_starts
    }
}
