pub mod container;
pub mod opcode;

pub use container::Bytecode;
pub use opcode::{
    read_i16, read_i32, read_i64, read_i8, read_u16, read_u32, read_u64, read_u8, Opcode,
};
