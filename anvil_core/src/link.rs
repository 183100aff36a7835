//! The linker: resolves the symbolic labels and call-site ids left behind by
//! [`crate::lower`] into the concrete relative displacements and absolute byte
//! offsets a [`crate::exec::Executable`] needs.
//!
//! Per function: a label sweep records every `LBL_UI32`'s byte offset and
//! erases it to `NOP`s, then a fixup sweep rewrites every `JMPR_I32` /
//! `JRNZ_REG_I32` / `JRZ_REG_I32` to a relative delta and every `CALL_UI64` to
//! an intermediate `(function_id << 32) | 0` encoding. Concatenation then
//! replaces that intermediate form with the callee's real absolute offset in
//! the linked buffer, and validates every `CALL_NATIVE_UI64` id against the
//! supplied native table.

use std::collections::HashMap;

use crate::bytecode::{Bytecode, Opcode};
use crate::error::LinkError;
use crate::exec::Executable;
use crate::native::NativeTable;
use crate::program::{FunctionBody, FunctionId, Program};

/// Byte offset of a label within the function that defines it.
type LabelTable = HashMap<u32, usize>;

fn label_sweep(code: &mut Bytecode) -> Result<LabelTable, LinkError> {
    let mut labels = LabelTable::new();
    let mut offset = 0usize;
    while code.has_instruction(offset) {
        let op = code
            .decode_opcode(offset)
            .map_err(|_| LinkError::DanglingLabel { label_id: 0 })?;
        if op == Opcode::LblUi32 {
            let bytes: [u8; 5] = code.read(offset);
            let id = u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
            labels.insert(id, offset);
            code.patch(offset, &[Opcode::Nop as u8; 5]);
        }
        offset += op.size_of() as usize;
    }
    Ok(labels)
}

fn fixup_sweep(
    code: &mut Bytecode,
    labels: &LabelTable,
    symbols: &crate::program::SymbolTable,
    program: &Program,
    function_ids: &HashMap<String, FunctionId>,
) -> Result<(), LinkError> {
    let mut offset = 0usize;
    while code.has_instruction(offset) {
        let op = code
            .decode_opcode(offset)
            .expect("label sweep already validated every opcode in this buffer");
        match op {
            Opcode::JmprI32 => {
                let bytes: [u8; 5] = code.read(offset);
                let label_id = u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
                let target = *labels
                    .get(&label_id)
                    .ok_or(LinkError::DanglingLabel { label_id })?;
                let delta = target as i64 - offset as i64;
                let delta = i32::try_from(delta).expect("function bodies fit in i32 byte range");
                let mut patched = [0u8; 5];
                patched[0] = bytes[0];
                patched[1..5].copy_from_slice(&delta.to_le_bytes());
                code.patch(offset, &patched);
            }
            Opcode::JrnzRegI32 | Opcode::JrzRegI32 => {
                let bytes: [u8; 6] = code.read(offset);
                let label_id = u32::from_le_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);
                let target = *labels
                    .get(&label_id)
                    .ok_or(LinkError::DanglingLabel { label_id })?;
                let delta = target as i64 - offset as i64;
                let delta = i32::try_from(delta).expect("function bodies fit in i32 byte range");
                let mut patched = [0u8; 6];
                patched[0] = bytes[0];
                patched[1] = bytes[1];
                patched[2..6].copy_from_slice(&delta.to_le_bytes());
                code.patch(offset, &patched);
            }
            Opcode::CallUi64 => {
                let bytes: [u8; 9] = code.read(offset);
                let call_site_id = u64::from_le_bytes(bytes[1..9].try_into().unwrap());
                let callee = symbols.resolve(call_site_id)?;
                let callee_id = *function_ids
                    .get(callee)
                    .ok_or_else(|| LinkError::UndefinedSymbol { name: callee.to_string() })?;
                if matches!(program.get_function(callee_id).body, FunctionBody::Native(_)) {
                    return Err(LinkError::NotAFunction { name: callee.to_string() });
                }
                let encoded = (callee_id.0 as u64) << 32;
                let mut patched = [0u8; 9];
                patched[0] = bytes[0];
                patched[1..9].copy_from_slice(&encoded.to_le_bytes());
                code.patch(offset, &patched);
            }
            _ => {}
        }
        offset += op.size_of() as usize;
    }
    Ok(())
}

/// Links a [`Program`] against a host-supplied [`NativeTable`] into an
/// [`Executable`]. The native table's registration order becomes the
/// executable's native-function index space; `CALL_NATIVE_UI64` operands in
/// `program` are validated (not rewritten — lowering already emits the
/// symbol's eventual native id indirectly via the function table) against it.
pub fn link(program: &Program, natives: &NativeTable) -> Result<Executable, LinkError> {
    let function_ids: HashMap<String, FunctionId> = program
        .functions()
        .map(|(id, f)| (f.name.clone(), id))
        .collect();

    let mut bodies: Vec<Bytecode> = Vec::with_capacity(program.len());

    for (_, function) in program.functions() {
        match &function.body {
            FunctionBody::Bytecode { code, symbols } => {
                let mut code = code.clone();
                let labels = label_sweep(&mut code)?;
                fixup_sweep(&mut code, &labels, symbols, program, &function_ids)?;
                bodies.push(code);
            }
            FunctionBody::Native(id) => {
                if natives.get(*id).is_none() {
                    return Err(LinkError::InvalidNativeId { id: id.0 });
                }
                bodies.push(Bytecode::new());
            }
        }
    }

    let mut function_starts: Vec<u64> = Vec::with_capacity(bodies.len());
    let mut cursor: u64 = 0;
    for body in &bodies {
        function_starts.push(cursor);
        cursor += body.len() as u64;
    }

    let mut linked = Bytecode::new();
    for body in &bodies {
        linked.append(body.as_slice());
    }

    resolve_call_targets(&mut linked, &function_starts)?;

    Ok(Executable::new(linked, natives.callbacks().to_vec(), function_starts))
}

/// Concatenation's final pass: every `CALL_UI64` operand currently holds the
/// intermediate `(function_id << 32) | 0` form the fixup sweep produced;
/// rewrite it to the callee's real absolute offset in the concatenated buffer.
fn resolve_call_targets(linked: &mut Bytecode, function_starts: &[u64]) -> Result<(), LinkError> {
    let mut offset = 0usize;
    while linked.has_instruction(offset) {
        let op = linked
            .decode_opcode(offset)
            .expect("every opcode byte in a linked buffer was validated during fixup");
        if op == Opcode::CallUi64 {
            let bytes: [u8; 9] = linked.read(offset);
            let encoded = u64::from_le_bytes(bytes[1..9].try_into().unwrap());
            let function_id = (encoded >> 32) as u16;
            let start = *function_starts
                .get(function_id as usize)
                .ok_or(LinkError::UnknownFunction { id: function_id })?;
            let mut patched = [0u8; 9];
            patched[0] = bytes[0];
            patched[1..9].copy_from_slice(&start.to_le_bytes());
            linked.patch(offset, &patched);
        }
        offset += op.size_of() as usize;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Opcode;
    use crate::program::{FrameLayout, Function};

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
    fn label_sweep_erases_labels_to_nops_and_records_offsets() {
        let mut code = bc(&[
            (Opcode::Nop, &[]),
            (Opcode::LblUi32, &7u32.to_le_bytes()),
            (Opcode::Exit, &[]),
        ]);
        let labels = label_sweep(&mut code).unwrap();
        assert_eq!(labels.get(&7), Some(&1));
        for i in 1..=5 {
            assert_eq!(code.decode_opcode(i).unwrap(), Opcode::Nop);
        }
    }

    #[test]
    fn jmpr_is_rewritten_to_a_signed_delta() {
        let mut code = bc(&[
            (Opcode::JmprI32, &0u32.to_le_bytes()),
            (Opcode::Nop, &[]),
            (Opcode::LblUi32, &0u32.to_le_bytes()),
        ]);
        let labels = label_sweep(&mut code).unwrap();
        let symbols = crate::program::SymbolTable::new();
        let program = Program::new();
        let ids = HashMap::new();
        fixup_sweep(&mut code, &labels, &symbols, &program, &ids).unwrap();
        let bytes: [u8; 5] = code.read(0);
        let delta = i32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
        assert_eq!(delta, 6);
    }

    #[test]
    fn dangling_label_is_a_link_error() {
        let mut code = bc(&[(Opcode::JmprI32, &99u32.to_le_bytes())]);
        let labels = label_sweep(&mut code).unwrap();
        let symbols = crate::program::SymbolTable::new();
        let program = Program::new();
        let ids = HashMap::new();
        assert!(fixup_sweep(&mut code, &labels, &symbols, &program, &ids).is_err());
    }

    #[test]
    fn link_resolves_cross_function_call_to_callee_start() {
        let mut program = Program::new();

        let mut callee_code = Bytecode::new();
        callee_code.append(&[Opcode::RetUi8 as u8, 0]);
        program.add_function(Function::new_bytecode(
            "callee",
            callee_code,
            FrameLayout::default(),
        ));

        let mut caller_code = Bytecode::new();
        let mut call_bytes = vec![Opcode::CallUi64 as u8];
        call_bytes.extend_from_slice(&0u64.to_le_bytes());
        caller_code.append(&call_bytes);
        caller_code.append(&[Opcode::RetUi8 as u8, 0]);
        let mut caller = Function::new_bytecode("caller", caller_code, FrameLayout::default());
        caller.symbols_mut().unwrap().record(0, "callee");
        program.add_function(caller);

        let natives = NativeTable::new();
        let executable = link(&program, &natives).unwrap();

        let callee_start = executable.function_starts()[0];
        let caller_start = executable.function_starts()[1];
        let call_offset = caller_start as usize;
        let bytes: [u8; 9] = executable.code().read(call_offset);
        assert_eq!(bytes[0], Opcode::CallUi64 as u8);
        let target = u64::from_le_bytes(bytes[1..9].try_into().unwrap());
        assert_eq!(target, callee_start);
    }

    #[test]
    fn undefined_symbol_is_a_link_error() {
        let mut program = Program::new();
        let mut caller_code = Bytecode::new();
        let mut call_bytes = vec![Opcode::CallUi64 as u8];
        call_bytes.extend_from_slice(&0u64.to_le_bytes());
        caller_code.append(&call_bytes);
        let mut caller = Function::new_bytecode("caller", caller_code, FrameLayout::default());
        caller.symbols_mut().unwrap().record(0, "missing");
        program.add_function(caller);

        let natives = NativeTable::new();
        assert!(link(&program, &natives).is_err());
    }
}
