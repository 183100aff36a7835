pub mod asm;
pub mod ast;
pub mod bytecode;
pub mod error;
pub mod exec;
pub mod link;
pub mod lower;
pub mod native;
pub mod program;
pub mod types;
pub mod vm;

pub use ast::{BinOp, Expr, FunctionDecl, LocalId, TypedProgram};
pub use bytecode::{Bytecode, Opcode};
pub use error::AnvilError;
pub use exec::{preprocess, DirectThreadedExecutable, Executable};
pub use link::link;
pub use lower::lower;
pub use native::{NativeFn, NativeId, NativeTable};
pub use program::{Function, FunctionId, Program};
pub use types::Type;
pub use vm::{run, run_from, MachineState};
