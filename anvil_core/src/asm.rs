//! A line-oriented text format for already-linked bytecode: one instruction
//! per line, mnemonic first, then its operands as whitespace-separated
//! decimal integers. No labels — `CALL_UI64`'s operand is already the
//! absolute byte offset a linked [`Executable`] would carry, so this format
//! bypasses lowering and linking entirely (§4.I, §4.J).
//!
//! Grounded in the original bytecode text format's parser: same mnemonics,
//! same "mnemonic then decimal fields" shape, same "no labels in an
//! executable" rule.

use crate::bytecode::{Bytecode, Opcode};
use crate::exec::Executable;

fn mnemonic(op: Opcode) -> &'static str {
    use Opcode::*;
    match op {
        Nop => "NOP",
        AddRegRegReg => "ADD_REG_REG_REG",
        SubRegRegReg => "SUB_REG_REG_REG",
        MulRegRegReg => "MUL_REG_REG_REG",
        DivRegRegReg => "DIV_REG_REG_REG",
        ModRegRegReg => "MOD_REG_REG_REG",
        AddRegRegUi8 => "ADD_REG_REG_UI8",
        SubRegRegUi8 => "SUB_REG_REG_UI8",
        AndRegRegReg => "AND_REG_REG_REG",
        OrRegRegReg => "OR_REG_REG_REG",
        AndRegRegUi8 => "AND_REG_REG_UI8",
        GtRegRegReg => "GT_REG_REG_REG",
        GteRegRegReg => "GTE_REG_REG_REG",
        LtRegRegReg => "LT_REG_REG_REG",
        LteRegRegReg => "LTE_REG_REG_REG",
        EqRegRegReg => "EQ_REG_REG_REG",
        NeqRegRegReg => "NEQ_REG_REG_REG",
        MvRegSp => "MV_REG_SP",
        MvRegIp => "MV_REG_IP",
        MvRegUi8 => "MV_REG_UI8",
        MvRegUi16 => "MV_REG_UI16",
        MvRegUi32 => "MV_REG_UI32",
        MvRegUi64 => "MV_REG_UI64",
        MvRegI8 => "MV_REG_I8",
        MvRegI16 => "MV_REG_I16",
        MvRegI32 => "MV_REG_I32",
        MvRegI64 => "MV_REG_I64",
        Mv8RegReg => "MV8_REG_REG",
        Mv16RegReg => "MV16_REG_REG",
        Mv32RegReg => "MV32_REG_REG",
        Mv64RegReg => "MV64_REG_REG",
        Mv8LocReg => "MV8_LOC_REG",
        Mv16LocReg => "MV16_LOC_REG",
        Mv32LocReg => "MV32_LOC_REG",
        Mv64LocReg => "MV64_LOC_REG",
        Mv8RegLoc => "MV8_REG_LOC",
        Mv16RegLoc => "MV16_REG_LOC",
        Mv32RegLoc => "MV32_REG_LOC",
        Mv64RegLoc => "MV64_REG_LOC",
        Push8Reg => "PUSH8_REG",
        Push16Reg => "PUSH16_REG",
        Push32Reg => "PUSH32_REG",
        Push64Reg => "PUSH64_REG",
        Pop8Reg => "POP8_REG",
        Pop16Reg => "POP16_REG",
        Pop32Reg => "POP32_REG",
        Pop64Reg => "POP64_REG",
        JmprI32 => "JMPR_I32",
        JrnzRegI32 => "JRNZ_REG_I32",
        JrzRegI32 => "JRZ_REG_I32",
        CallUi64 => "CALL_UI64",
        CallNativeUi64 => "CALL_NATIVE_UI64",
        RetUi8 => "RET_UI8",
        LblUi32 => "LBL_UI32",
        SallocRegUi8 => "SALLOC_REG_UI8",
        SdeallocUi8 => "SDEALLOC_UI8",
        Exit => "EXIT",
        Err => "ERR",
    }
}

fn op_from_mnemonic(name: &str) -> Result<Opcode, String> {
    use Opcode::*;
    Ok(match name {
        "NOP" => Nop,
        "ADD_REG_REG_REG" => AddRegRegReg,
        "SUB_REG_REG_REG" => SubRegRegReg,
        "MUL_REG_REG_REG" => MulRegRegReg,
        "DIV_REG_REG_REG" => DivRegRegReg,
        "MOD_REG_REG_REG" => ModRegRegReg,
        "ADD_REG_REG_UI8" => AddRegRegUi8,
        "SUB_REG_REG_UI8" => SubRegRegUi8,
        "AND_REG_REG_REG" => AndRegRegReg,
        "OR_REG_REG_REG" => OrRegRegReg,
        "AND_REG_REG_UI8" => AndRegRegUi8,
        "GT_REG_REG_REG" => GtRegRegReg,
        "GTE_REG_REG_REG" => GteRegRegReg,
        "LT_REG_REG_REG" => LtRegRegReg,
        "LTE_REG_REG_REG" => LteRegRegReg,
        "EQ_REG_REG_REG" => EqRegRegReg,
        "NEQ_REG_REG_REG" => NeqRegRegReg,
        "MV_REG_SP" => MvRegSp,
        "MV_REG_IP" => MvRegIp,
        "MV_REG_UI8" => MvRegUi8,
        "MV_REG_UI16" => MvRegUi16,
        "MV_REG_UI32" => MvRegUi32,
        "MV_REG_UI64" => MvRegUi64,
        "MV_REG_I8" => MvRegI8,
        "MV_REG_I16" => MvRegI16,
        "MV_REG_I32" => MvRegI32,
        "MV_REG_I64" => MvRegI64,
        "MV8_REG_REG" => Mv8RegReg,
        "MV16_REG_REG" => Mv16RegReg,
        "MV32_REG_REG" => Mv32RegReg,
        "MV64_REG_REG" => Mv64RegReg,
        "MV8_LOC_REG" => Mv8LocReg,
        "MV16_LOC_REG" => Mv16LocReg,
        "MV32_LOC_REG" => Mv32LocReg,
        "MV64_LOC_REG" => Mv64LocReg,
        "MV8_REG_LOC" => Mv8RegLoc,
        "MV16_REG_LOC" => Mv16RegLoc,
        "MV32_REG_LOC" => Mv32RegLoc,
        "MV64_REG_LOC" => Mv64RegLoc,
        "PUSH8_REG" => Push8Reg,
        "PUSH16_REG" => Push16Reg,
        "PUSH32_REG" => Push32Reg,
        "PUSH64_REG" => Push64Reg,
        "POP8_REG" => Pop8Reg,
        "POP16_REG" => Pop16Reg,
        "POP32_REG" => Pop32Reg,
        "POP64_REG" => Pop64Reg,
        "JMPR_I32" => JmprI32,
        "JRNZ_REG_I32" => JrnzRegI32,
        "JRZ_REG_I32" => JrzRegI32,
        "CALL_UI64" => CallUi64,
        "CALL_NATIVE_UI64" => CallNativeUi64,
        "RET_UI8" => RetUi8,
        "LBL_UI32" => {
            return Err("labels are not valid in an already-linked executable".to_string())
        }
        "SALLOC_REG_UI8" => SallocRegUi8,
        "SDEALLOC_UI8" => SdeallocUi8,
        "EXIT" => Exit,
        "ERR" => Err,
        other => return std::result::Result::Err(format!("unknown mnemonic '{}'", other)),
    })
}

/// Number of raw operand *bytes* a mnemonic line carries — one whitespace-
/// separated unsigned decimal token (0-255) per byte, written in little-endian
/// order for multi-byte fields. Mirrors the original parser, which reads every
/// operand a single byte at a time regardless of the field's eventual width or
/// signedness (a signed field is just bytes later reinterpreted by the VM).
fn operand_byte_count(op: Opcode) -> usize {
    op.size_of() as usize - 1
}

/// Assembles one instruction line into `code`: mnemonic, then one decimal byte
/// (0-255) per remaining operand byte, mirroring the original parser's
/// per-byte `parse_uint8` chain.
fn parse_line(line: &str, code: &mut Bytecode) -> Result<(), String> {
    let mut fields = line.split_whitespace();
    let mnemonic = match fields.next() {
        Some(m) => m,
        None => return Ok(()), // blank line
    };
    let op = op_from_mnemonic(mnemonic)?;
    let operand_bytes = operand_byte_count(op);

    let mut bytes = vec![op as u8];
    for _ in 0..operand_bytes {
        let raw = fields
            .next()
            .ok_or_else(|| format!("{}: missing operand byte", mnemonic))?;
        let value: u8 = raw
            .parse()
            .map_err(|_| format!("{}: invalid operand byte '{}'", mnemonic, raw))?;
        bytes.push(value);
    }
    if fields.next().is_some() {
        return std::result::Result::Err(format!("{}: too many operand bytes", mnemonic));
    }
    code.append(&bytes);
    Ok(())
}

/// Parses a whole already-linked program, one instruction per non-blank line,
/// `#`-prefixed lines treated as comments. There is no linking step here: the
/// caller's `CALL_UI64` operands must already be absolute byte offsets.
pub fn parse(text: &str) -> Result<Executable, String> {
    let mut code = Bytecode::new();
    for (lineno, raw_line) in text.lines().enumerate() {
        let line = raw_line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        parse_line(line, &mut code).map_err(|e| format!("line {}: {}", lineno + 1, e))?;
    }
    Ok(Executable::new(code, Vec::new(), vec![0]))
}

/// Renders `executable`'s code back to the text format. Round-trips with
/// [`parse`] modulo whitespace and comments.
pub fn disassemble(executable: &Executable) -> String {
    let code = executable.code();
    let mut out = String::new();
    let mut offset = 0usize;
    while code.has_instruction(offset) {
        let op = match code.decode_opcode(offset) {
            Ok(op) => op,
            Err(_) => break,
        };
        let total = op.size_of() as usize;
        let raw = code.read::<16>(offset);
        let operand = &raw[1..total];

        out.push_str(mnemonic(op));
        for &byte in operand {
            out.push(' ');
            out.push_str(&byte.to_string());
        }
        out.push('\n');
        offset += total;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Renders a little-endian immediate as the space-separated decimal bytes
    /// the text format expects, e.g. `mv_reg_i64_line(0, 42)` => "MV_REG_I64 0 42 0 0 0 0 0 0 0".
    fn mv_reg_i64_line(reg: u8, value: i64) -> String {
        let mut line = format!("MV_REG_I64 {}", reg);
        for byte in value.to_le_bytes() {
            line.push_str(&format!(" {}", byte));
        }
        line
    }

    #[test]
    fn assembles_a_simple_program() {
        let text = format!("{}\nRET_UI8 0\n", mv_reg_i64_line(0, 42));
        let executable = parse(&text).unwrap();
        assert_eq!(executable.code().len(), 10 + 2);
    }

    #[test]
    fn blank_lines_and_comments_are_skipped() {
        let text = "# a comment\n\nMV_REG_UI8 0 7  # trailing comment\nRET_UI8 0\n";
        let executable = parse(text).unwrap();
        assert_eq!(executable.code().len(), 3 + 2);
    }

    #[test]
    fn unknown_mnemonic_is_an_error() {
        assert!(parse("FROB 1 2 3\n").is_err());
    }

    #[test]
    fn label_mnemonic_is_rejected_in_executable_text() {
        assert!(parse("LBL_UI32 1\n").is_err());
    }

    #[test]
    fn missing_operand_bytes_are_an_error() {
        assert!(parse("MV_REG_I64 0 42\n").is_err());
    }

    #[test]
    fn assemble_then_disassemble_round_trips() {
        let text = format!(
            "{}\nADD_REG_REG_REG 0 1 1\nRET_UI8 0\n",
            mv_reg_i64_line(1, -7)
        );
        let executable = parse(&text).unwrap();
        let rendered = disassemble(&executable);
        let reparsed = parse(&rendered).unwrap();
        assert_eq!(executable.code().as_slice(), reparsed.code().as_slice());
    }
}
