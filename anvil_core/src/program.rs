//! The function table: named, `FunctionId`-addressed units produced by lowering
//! and consumed by the linker.

use std::collections::HashMap;

use crate::bytecode::Bytecode;
use crate::error::LinkError;
use crate::native::NativeId;

/// A 16-bit index into a [`Program`], stable across lowering and linking and
/// also the order functions are concatenated in during linking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FunctionId(pub u16);

/// Per-function map from a lowering-assigned call-site id to the callee's name.
/// This indirection lets the lowerer emit `CALL_UI64` operands before every
/// target function necessarily exists yet; the linker resolves names to concrete
/// addresses in one pass over the whole program.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    call_sites: HashMap<u64, String>,
}

impl SymbolTable {
    pub fn new() -> Self {
        SymbolTable::default()
    }

    pub fn record(&mut self, call_site_id: u64, callee_name: impl Into<String>) {
        self.call_sites.insert(call_site_id, callee_name.into());
    }

    pub fn resolve(&self, call_site_id: u64) -> Result<&str, LinkError> {
        self.call_sites
            .get(&call_site_id)
            .map(String::as_str)
            .ok_or(LinkError::UndefinedSymbol {
                name: format!("<call site {}>", call_site_id),
            })
    }
}

#[derive(Debug, Clone)]
pub enum FunctionBody {
    Bytecode {
        code: Bytecode,
        symbols: SymbolTable,
    },
    Native(NativeId),
}

/// Metadata carried only during lowering and consumed by the VM to size frames;
/// irrelevant once an `Executable` exists.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameLayout {
    pub input_size: usize,
    pub output_size: usize,
    pub locals_size: usize,
}

#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    pub body: FunctionBody,
    pub layout: FrameLayout,
}

impl Function {
    pub fn new_bytecode(name: impl Into<String>, code: Bytecode, layout: FrameLayout) -> Self {
        Function {
            name: name.into(),
            body: FunctionBody::Bytecode {
                code,
                symbols: SymbolTable::new(),
            },
            layout,
        }
    }

    pub fn new_native(name: impl Into<String>, id: NativeId, layout: FrameLayout) -> Self {
        Function {
            name: name.into(),
            body: FunctionBody::Native(id),
            layout,
        }
    }

    pub fn code(&self) -> Option<&Bytecode> {
        match &self.body {
            FunctionBody::Bytecode { code, .. } => Some(code),
            FunctionBody::Native(_) => None,
        }
    }

    pub fn code_mut(&mut self) -> Option<&mut Bytecode> {
        match &mut self.body {
            FunctionBody::Bytecode { code, .. } => Some(code),
            FunctionBody::Native(_) => None,
        }
    }

    pub fn symbols(&self) -> Option<&SymbolTable> {
        match &self.body {
            FunctionBody::Bytecode { symbols, .. } => Some(symbols),
            FunctionBody::Native(_) => None,
        }
    }

    pub fn symbols_mut(&mut self) -> Option<&mut SymbolTable> {
        match &mut self.body {
            FunctionBody::Bytecode { symbols, .. } => Some(symbols),
            FunctionBody::Native(_) => None,
        }
    }
}

/// An ordered collection of [`Function`]s, addressed by [`FunctionId`]. Names are
/// unique within a program.
#[derive(Debug, Clone, Default)]
pub struct Program {
    functions: Vec<Function>,
    by_name: HashMap<String, FunctionId>,
}

impl Program {
    pub fn new() -> Self {
        Program::default()
    }

    pub fn add_function(&mut self, function: Function) -> FunctionId {
        let id = FunctionId(self.functions.len() as u16);
        self.by_name.insert(function.name.clone(), id);
        self.functions.push(function);
        id
    }

    pub fn get_function(&self, id: FunctionId) -> &Function {
        &self.functions[id.0 as usize]
    }

    pub fn get_function_mut(&mut self, id: FunctionId) -> &mut Function {
        &mut self.functions[id.0 as usize]
    }

    pub fn find_by_name(&self, name: &str) -> Option<FunctionId> {
        self.by_name.get(name).copied()
    }

    pub fn functions(&self) -> impl Iterator<Item = (FunctionId, &Function)> {
        self.functions
            .iter()
            .enumerate()
            .map(|(i, f)| (FunctionId(i as u16), f))
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}
