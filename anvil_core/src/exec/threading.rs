//! The direct-threading preprocessor (§4.F): rewrites a linked [`Executable`]
//! so every instruction's 1-byte opcode becomes a 2-byte "handler offset",
//! leaving its operand bytes untouched but shifted one byte later.
//!
//! Safe Rust has neither computed-goto nor guaranteed tail calls, so this
//! crate's dispatch loop is an ordinary `match` over that handler offset
//! (see [`crate::vm::run_from`]) rather than a literal jump table — the
//! uniform rewrite below is what the spec calls "direct threading" for this
//! VM, and it's still worth doing: every operand that encodes a byte offset
//! (`CALL_UI64`'s absolute target, `JMPR_I32`/`JRNZ_REG_I32`/`JRZ_REG_I32`'s
//! relative deltas) must be remapped to account for the widened instructions
//! between the old offset and the new one, and getting that remap right once
//! here is what lets the dispatch loop treat ip arithmetic as plain numbers.
//!
//! For an original byte offset `x`, `shift(x)` is the number of instruction
//! start offsets strictly less than `x`, and `new_position(x) = x + shift(x)`.
//! Every instruction start widens by exactly one byte (the opcode byte
//! becomes a 2-byte handler offset), so `shift` is simply "how many
//! instructions precede this position" — computed once as a sorted table of
//! instruction starts and queried by binary search.

use crate::bytecode::{Bytecode, Opcode};
use crate::exec::Executable;
use crate::native::NativeFn;

/// The VM's actual input: every opcode byte rewritten to a 2-byte handler
/// offset, with every absolute/relative byte-offset operand remapped to
/// match. Produced once per [`Executable`] and then run any number of times.
#[derive(Debug, Clone)]
pub struct DirectThreadedExecutable {
    code: Bytecode,
    natives: Vec<NativeFn>,
    function_starts: Vec<u64>,
}

impl DirectThreadedExecutable {
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

/// Instruction start offsets of `code`, in ascending order.
fn instruction_starts(code: &Bytecode) -> Vec<usize> {
    let mut starts = Vec::new();
    let mut offset = 0usize;
    while code.has_instruction(offset) {
        starts.push(offset);
        let op = code
            .decode_opcode(offset)
            .expect("a linked Executable's code is fully validated opcode-by-opcode");
        offset += op.size_of() as usize;
    }
    starts
}

/// `shift(x)`: count of instruction starts strictly less than `x`.
fn shift(starts: &[usize], x: usize) -> usize {
    starts.partition_point(|&start| start < x)
}

fn new_position(starts: &[usize], x: usize) -> u64 {
    (x + shift(starts, x)) as u64
}

/// Rewrites `executable` into its direct-threaded form.
pub fn preprocess(executable: &Executable) -> DirectThreadedExecutable {
    let code = executable.code();
    let starts = instruction_starts(code);
    let raw = code.as_slice();

    let mut out = Bytecode::new();
    for (i, &start) in starts.iter().enumerate() {
        let op = code.decode_opcode(start).expect("validated above");
        let total = op.size_of() as usize;
        let operand = &raw[start + 1..start + total];

        let handler_offset = op as u8 as u16;
        let mut rewritten = Vec::with_capacity(2 + operand.len());
        rewritten.extend_from_slice(&handler_offset.to_le_bytes());

        match op {
            Opcode::JmprI32 => {
                let delta = i32::from_le_bytes(operand.try_into().unwrap());
                let target = (start as i64 + delta as i64) as usize;
                let new_source = start + i; // this instruction's own new start
                let new_target = new_position(&starts, target);
                let new_delta = new_target as i64 - new_source as i64;
                rewritten.extend_from_slice(
                    &i32::try_from(new_delta)
                        .expect("threaded function bodies fit in i32 byte range")
                        .to_le_bytes(),
                );
            }
            Opcode::JrnzRegI32 | Opcode::JrzRegI32 => {
                let reg = operand[0];
                let delta = i32::from_le_bytes(operand[1..5].try_into().unwrap());
                let target = (start as i64 + delta as i64) as usize;
                let new_source = start + i;
                let new_target = new_position(&starts, target);
                let new_delta = new_target as i64 - new_source as i64;
                rewritten.push(reg);
                rewritten.extend_from_slice(
                    &i32::try_from(new_delta)
                        .expect("threaded function bodies fit in i32 byte range")
                        .to_le_bytes(),
                );
            }
            Opcode::CallUi64 => {
                let target = u64::from_le_bytes(operand.try_into().unwrap()) as usize;
                let new_target = new_position(&starts, target);
                rewritten.extend_from_slice(&new_target.to_le_bytes());
            }
            _ => rewritten.extend_from_slice(operand),
        }

        out.append(&rewritten);
    }

    let function_starts = executable
        .function_starts()
        .iter()
        .map(|&start| new_position(&starts, start as usize))
        .collect();

    DirectThreadedExecutable {
        code: out,
        natives: executable.natives().to_vec(),
        function_starts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bc(ops: &[(Opcode, &[u8])]) -> Bytecode {
        let mut code = Bytecode::new();
        for (op, operand) in ops {
            let mut bytes = vec![*op as u8];
            bytes.extend_from_slice(operand);
            code.append(&bytes);
        }
        code
    }

    #[test]
    fn every_opcode_byte_becomes_a_two_byte_handler_offset() {
        let code = bc(&[(Opcode::Nop, &[]), (Opcode::Exit, &[])]);
        let exec = Executable::new(code, Vec::new(), vec![0]);
        let direct = preprocess(&exec);
        assert_eq!(direct.code().len(), 2 + 2);
        let first: [u8; 2] = direct.code().read(0);
        assert_eq!(u16::from_le_bytes(first), Opcode::Nop as u8 as u16);
        let second: [u8; 2] = direct.code().read(2);
        assert_eq!(u16::from_le_bytes(second), Opcode::Exit as u8 as u16);
    }

    #[test]
    fn jmpr_delta_is_remapped_across_widened_instructions() {
        // [JMPR +6 (skips the Nop)] [Nop] [Exit]
        // original offsets: 0 (jmpr, 5 bytes), 5 (nop, 1 byte), 6 (exit, 1 byte)
        let code = bc(&[
            (Opcode::JmprI32, &6i32.to_le_bytes()),
            (Opcode::Nop, &[]),
            (Opcode::Exit, &[]),
        ]);
        let exec = Executable::new(code, Vec::new(), vec![0]);
        let direct = preprocess(&exec);
        // threaded offsets: jmpr at 0 (6 bytes), nop at 6 (2 bytes), exit at 8 (2 bytes)
        let bytes: [u8; 6] = direct.code().read(0);
        let delta = i32::from_le_bytes(bytes[2..6].try_into().unwrap());
        assert_eq!(delta, 8); // 0 + 8 == new position of Exit
    }

    #[test]
    fn call_target_is_remapped_to_absolute_threaded_offset() {
        // function 0: [RET_UI8] (2 bytes, original offset 0)
        // function 1: [CALL_UI64 -> 0] [RET_UI8] (original offsets 2, 11)
        let mut code = Bytecode::new();
        code.append(&[Opcode::RetUi8 as u8, 0]);
        let mut call = vec![Opcode::CallUi64 as u8];
        call.extend_from_slice(&0u64.to_le_bytes());
        code.append(&call);
        code.append(&[Opcode::RetUi8 as u8, 0]);

        let exec = Executable::new(code, Vec::new(), vec![0, 2]);
        let direct = preprocess(&exec);

        // threaded: ret(0..3), call(3..13), ret(13..16)
        let call_bytes: [u8; 9] = direct.code().read(3);
        let target = u64::from_le_bytes(call_bytes[1..9].try_into().unwrap());
        assert_eq!(target, direct.function_starts()[0]);
        assert_eq!(direct.function_starts()[0], 0);
        assert_eq!(direct.function_starts()[1], 3);
    }
}
