//! The linked, executable forms of a [`crate::program::Program`]: the flat
//! [`Executable`] the linker produces, and the [`threading::DirectThreadedExecutable`]
//! the VM runs, rewritten so every opcode byte has become a 2-byte handler offset.

mod executable;
pub mod threading;

pub use executable::Executable;
pub use threading::{preprocess, DirectThreadedExecutable};
