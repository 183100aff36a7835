//! Lowering: walks a typed [`crate::ast::Expr`] tree and emits bytecode into a
//! [`Program`], leaving jumps and calls symbolic for the linker to resolve.

use std::collections::HashMap;

use crate::ast::{BinOp, Expr, FunctionDecl, LocalId, TypedProgram};
use crate::bytecode::{Bytecode, Opcode};
use crate::error::LowerError;
use crate::program::{FrameLayout, Function, Program, SymbolTable};
use crate::types::Type;
use crate::vm::{FP_REG, RET_REG, SP_REG};

/// Per-function emit state. A fresh instance is created for every
/// [`FunctionDecl`]; nothing here survives across functions.
struct Lowerer<'f> {
    decl: &'f FunctionDecl,
    code: Bytecode,
    next_register: u8,
    next_label: u32,
    next_call_site: u64,
    symbols: SymbolTable,
    local_frame_offset: HashMap<u32, u16>,
    cumulative_offset: u16,
    peak_locals: u16,
    param_magnitude: Vec<u16>,
    input_size: usize,
}

impl<'f> Lowerer<'f> {
    fn new(decl: &'f FunctionDecl) -> Self {
        let input_size: usize = decl.params.iter().map(Type::byte_size).sum();
        let mut prefix = 0usize;
        let mut param_magnitude = Vec::with_capacity(decl.params.len());
        for p in &decl.params {
            param_magnitude.push((16 + input_size - prefix) as u16);
            prefix += p.byte_size();
        }
        Lowerer {
            decl,
            code: Bytecode::new(),
            next_register: 1, // register 0 is RET_REG
            next_label: 0,
            next_call_site: 0,
            symbols: SymbolTable::new(),
            local_frame_offset: HashMap::new(),
            cumulative_offset: 0,
            peak_locals: 0,
            param_magnitude,
            input_size,
        }
    }

    /// Allocates the next transient register. Registers are never reused within
    /// a function (a plain bump allocator), so this refuses to hand out anything
    /// at or past `SP_REG` — the three dedicated slots (`sp`/`fp`/`ip`) must stay
    /// unaliased, and the register file itself has exactly 64 slots.
    fn fresh_reg(&mut self) -> Result<u8, LowerError> {
        let r = self.next_register;
        if r >= SP_REG {
            return Err(LowerError::UncomputableSize {
                what: "function body exhausted the 64-register file".into(),
            });
        }
        self.next_register += 1;
        Ok(r)
    }

    fn fresh_label(&mut self) -> u32 {
        let id = self.next_label;
        self.next_label += 1;
        id
    }

    fn local_offset(&self, id: LocalId) -> Result<u16, LowerError> {
        self.local_frame_offset
            .get(&id.0)
            .copied()
            .ok_or(LowerError::UnresolvedLocal { id: id.0 })
    }

    fn u8_offset(offset: u16) -> Result<u8, LowerError> {
        u8::try_from(offset).map_err(|_| LowerError::UncomputableSize {
            what: "frame offset exceeds the 8-bit immediate range".into(),
        })
    }

    // ---- raw emit helpers ---------------------------------------------

    fn emit_op(&mut self, op: Opcode, operand: &[u8]) -> usize {
        let mut bytes = Vec::with_capacity(1 + operand.len());
        bytes.push(op as u8);
        bytes.extend_from_slice(operand);
        self.code.append(&bytes)
    }

    fn emit_mv_reg_imm(&mut self, reg: u8, value: u64, ty: &Type) {
        let (op, n) = match (ty.byte_size(), ty.is_signed()) {
            (1, false) => (Opcode::MvRegUi8, 1),
            (1, true) => (Opcode::MvRegI8, 1),
            (2, false) => (Opcode::MvRegUi16, 2),
            (2, true) => (Opcode::MvRegI16, 2),
            (4, false) => (Opcode::MvRegUi32, 4),
            (4, true) => (Opcode::MvRegI32, 4),
            (8, false) => (Opcode::MvRegUi64, 8),
            (8, true) => (Opcode::MvRegI64, 8),
            _ => unreachable!("byte_size() is always 1/2/4/8 for scalar literal types"),
        };
        let mut operand = Vec::with_capacity(1 + n);
        operand.push(reg);
        operand.extend_from_slice(&value.to_le_bytes()[..n]);
        self.emit_op(op, &operand);
    }

    fn emit_add_fp(&mut self, r_addr: u8, offset: u16) -> Result<(), LowerError> {
        let imm = Self::u8_offset(offset)?;
        self.emit_op(Opcode::AddRegRegUi8, &[r_addr, FP_REG, imm]);
        Ok(())
    }

    fn emit_sub_fp(&mut self, r_addr: u8, magnitude: u16) -> Result<(), LowerError> {
        let imm = Self::u8_offset(magnitude)?;
        self.emit_op(Opcode::SubRegRegUi8, &[r_addr, FP_REG, imm]);
        Ok(())
    }

    /// (reg <- [addr], [addr] <- reg, push reg) opcodes for a scalar width.
    fn width_opcodes(ty: &Type) -> Result<(Opcode, Opcode, Opcode), LowerError> {
        Ok(match ty.byte_size() {
            1 => (Opcode::Mv8RegLoc, Opcode::Mv8LocReg, Opcode::Push8Reg),
            2 => (Opcode::Mv16RegLoc, Opcode::Mv16LocReg, Opcode::Push16Reg),
            4 => (Opcode::Mv32RegLoc, Opcode::Mv32LocReg, Opcode::Push32Reg),
            8 => (Opcode::Mv64RegLoc, Opcode::Mv64LocReg, Opcode::Push64Reg),
            _ => {
                return Err(LowerError::UncomputableSize {
                    what: "non-scalar width in a scalar load/store/push".into(),
                })
            }
        })
    }

    fn emit_mv_reg_loc(&mut self, ty: &Type, r_dst: u8, r_addr: u8) -> Result<(), LowerError> {
        let (reg_loc, _, _) = Self::width_opcodes(ty)?;
        self.emit_op(reg_loc, &[r_dst, r_addr]);
        Ok(())
    }

    fn emit_mv_loc_reg(&mut self, ty: &Type, r_addr: u8, r_src: u8) -> Result<(), LowerError> {
        let (_, loc_reg, _) = Self::width_opcodes(ty)?;
        self.emit_op(loc_reg, &[r_addr, r_src]);
        Ok(())
    }

    fn emit_push(&mut self, ty: &Type, r_src: u8) -> Result<(), LowerError> {
        let (_, _, push) = Self::width_opcodes(ty)?;
        self.emit_op(push, &[r_src]);
        Ok(())
    }

    fn emit_push64_scratch(&mut self, reg: u8) {
        self.emit_op(Opcode::Push64Reg, &[reg]);
    }

    fn emit_pop64_scratch(&mut self, reg: u8) {
        self.emit_op(Opcode::Pop64Reg, &[reg]);
    }

    fn emit_binop(&mut self, op: BinOp, dst: u8, a: u8, b: u8) {
        let opcode = match op {
            BinOp::Add => Opcode::AddRegRegReg,
            BinOp::Sub => Opcode::SubRegRegReg,
            BinOp::Mul => Opcode::MulRegRegReg,
            BinOp::Div => Opcode::DivRegRegReg,
            BinOp::Mod => Opcode::ModRegRegReg,
            BinOp::And => Opcode::AndRegRegReg,
            BinOp::Or => Opcode::OrRegRegReg,
            BinOp::Gt => Opcode::GtRegRegReg,
            BinOp::Gte => Opcode::GteRegRegReg,
            BinOp::Lt => Opcode::LtRegRegReg,
            BinOp::Lte => Opcode::LteRegRegReg,
            BinOp::Eq => Opcode::EqRegRegReg,
            BinOp::Neq => Opcode::NeqRegRegReg,
        };
        self.emit_op(opcode, &[dst, a, b]);
    }

    fn emit_label(&mut self, id: u32) {
        self.emit_op(Opcode::LblUi32, &id.to_le_bytes());
    }

    fn emit_jmpr(&mut self, label: u32) {
        self.emit_op(Opcode::JmprI32, &label.to_le_bytes());
    }

    fn emit_jrz(&mut self, reg: u8, label: u32) {
        let mut operand = vec![reg];
        operand.extend_from_slice(&label.to_le_bytes());
        self.emit_op(Opcode::JrzRegI32, &operand);
    }

    fn emit_salloc(&mut self, r_dst: u8, n: u16) -> Result<(), LowerError> {
        let n8 = Self::u8_offset(n)?;
        self.emit_op(Opcode::SallocRegUi8, &[r_dst, n8]);
        Ok(())
    }

    fn emit_sdealloc(&mut self, n: u16) -> Result<(), LowerError> {
        let n8 = Self::u8_offset(n)?;
        self.emit_op(Opcode::SdeallocUi8, &[n8]);
        Ok(())
    }

    // ---- expression lowering -------------------------------------------

    /// Evaluates `lhs` then `rhs`, spilling `lhs`'s value across `rhs`'s
    /// evaluation. Registers are never saved across `CALL`/`RET`, so if `rhs`
    /// contains a nested call it would otherwise be free to clobber whatever
    /// register held `lhs`'s value.
    fn lower_pair(&mut self, lhs: &Expr, rhs: &Expr) -> Result<(u8, u8), LowerError> {
        let r_lhs = self.lower_expr(lhs)?;
        self.emit_push64_scratch(r_lhs);
        let r_rhs = self.lower_expr(rhs)?;
        let r_lhs2 = self.fresh_reg()?;
        self.emit_pop64_scratch(r_lhs2);
        Ok((r_lhs2, r_rhs))
    }

    /// Evaluates a list of operands left to right, each spilled to the stack
    /// immediately and reloaded (in reverse) once every operand has been
    /// produced, so later operands' calls can never clobber earlier ones.
    fn lower_operands(&mut self, exprs: &[Expr]) -> Result<Vec<(u8, Type)>, LowerError> {
        if exprs.is_empty() {
            return Ok(Vec::new());
        }
        let mut tys = Vec::with_capacity(exprs.len());
        for e in exprs {
            let r = self.lower_expr(e)?;
            self.emit_push64_scratch(r);
            tys.push(e.ty());
        }
        let mut regs = vec![0u8; exprs.len()];
        for i in (0..exprs.len()).rev() {
            let r = self.fresh_reg()?;
            self.emit_pop64_scratch(r);
            regs[i] = r;
        }
        Ok(regs.into_iter().zip(tys).collect())
    }

    fn store_scalar_local(&mut self, id: LocalId, ty: &Type, r: u8) -> Result<(), LowerError> {
        let offset = self.local_offset(id)?;
        let r_addr = self.fresh_reg()?;
        self.emit_add_fp(r_addr, offset)?;
        self.emit_mv_loc_reg(ty, r_addr, r)?;
        Ok(())
    }

    fn store_tuple_elements(
        &mut self,
        elements: &[Expr],
        elem_tys: &[Type],
        base_offset: u16,
    ) -> Result<(), LowerError> {
        let mut offset = base_offset;
        for (elem, ety) in elements.iter().zip(elem_tys) {
            let r = self.lower_expr(elem)?;
            let r_addr = self.fresh_reg()?;
            self.emit_add_fp(r_addr, offset)?;
            self.emit_mv_loc_reg(ety, r_addr, r)?;
            offset += ety.byte_size() as u16;
        }
        Ok(())
    }

    fn lower_let_or_assign(&mut self, id: LocalId, value: &Expr) -> Result<u8, LowerError> {
        let ty = self.decl.local_ty(id).clone();
        match (value, &ty) {
            (Expr::Tuple { elements, .. }, Type::Tuple(elem_tys)) => {
                let base = self.local_offset(id)?;
                self.store_tuple_elements(elements, elem_tys, base)?;
            }
            _ => {
                let r = self.lower_expr(value)?;
                self.store_scalar_local(id, &ty, r)?;
            }
        }
        Ok(RET_REG)
    }

    fn lower_destructure(
        &mut self,
        value: &Expr,
        targets: &[Option<LocalId>],
    ) -> Result<u8, LowerError> {
        let (elements, elem_tys) = match value {
            Expr::Tuple {
                elements,
                ty: Type::Tuple(elem_tys),
            } => (elements, elem_tys),
            _ => {
                return Err(LowerError::UncomputableSize {
                    what: "destructuring of a non-literal tuple value".into(),
                })
            }
        };
        for ((elem, ety), target) in elements.iter().zip(elem_tys).zip(targets) {
            match target {
                Some(id) => {
                    let r = self.lower_expr(elem)?;
                    self.store_scalar_local(*id, ety, r)?;
                }
                None => {
                    // Wildcard: evaluated for side effects, result discarded.
                    self.lower_expr(elem)?;
                }
            }
        }
        Ok(RET_REG)
    }

    fn lower_block(&mut self, decls: &[LocalId], body: &[Expr]) -> Result<u8, LowerError> {
        let locals_size: u16 = decls
            .iter()
            .map(|id| self.decl.local_ty(*id).byte_size() as u16)
            .sum();

        let mut offset = self.cumulative_offset;
        for id in decls {
            self.local_frame_offset.insert(id.0, offset);
            offset += self.decl.local_ty(*id).byte_size() as u16;
        }
        self.cumulative_offset += locals_size;
        self.peak_locals = self.peak_locals.max(self.cumulative_offset);

        let r_scratch = self.fresh_reg()?;
        self.emit_salloc(r_scratch, locals_size)?;

        let mut last = RET_REG;
        for stmt in body {
            last = self.lower_expr(stmt)?;
        }

        self.emit_sdealloc(locals_size)?;
        self.cumulative_offset -= locals_size;
        Ok(last)
    }

    fn lower_if(
        &mut self,
        cond: &Expr,
        then_branch: &Expr,
        else_branch: &Expr,
    ) -> Result<u8, LowerError> {
        let l_next = self.fresh_label();
        let l_end = self.fresh_label();
        let r_cond = self.lower_expr(cond)?;
        self.emit_jrz(r_cond, l_next);

        let r_result = self.fresh_reg()?;
        let r_then = self.lower_expr(then_branch)?;
        self.emit_op(Opcode::Mv64RegReg, &[r_result, r_then]);
        self.emit_jmpr(l_end);

        self.emit_label(l_next);
        let r_else = self.lower_expr(else_branch)?;
        self.emit_op(Opcode::Mv64RegReg, &[r_result, r_else]);

        self.emit_label(l_end);
        Ok(r_result)
    }

    fn lower_while(&mut self, cond: &Expr, body: &Expr) -> Result<u8, LowerError> {
        let l_top = self.fresh_label();
        let l_end = self.fresh_label();
        self.emit_label(l_top);
        let r_cond = self.lower_expr(cond)?;
        self.emit_jrz(r_cond, l_end);
        self.lower_expr(body)?;
        self.emit_jmpr(l_top);
        self.emit_label(l_end);
        Ok(RET_REG)
    }

    fn lower_call(&mut self, callee: &str, args: &[Expr], native: bool) -> Result<u8, LowerError> {
        let operands = self.lower_operands(args)?;
        for (reg, ty) in &operands {
            self.emit_push(ty, *reg)?;
        }
        let call_site_id = self.next_call_site;
        self.next_call_site += 1;
        self.symbols.record(call_site_id, callee);
        let opcode = if native {
            Opcode::CallNativeUi64
        } else {
            Opcode::CallUi64
        };
        self.emit_op(opcode, &call_site_id.to_le_bytes());
        let r_result = self.fresh_reg()?;
        self.emit_op(Opcode::Mv64RegReg, &[r_result, RET_REG]);
        Ok(r_result)
    }

    fn lower_expr(&mut self, expr: &Expr) -> Result<u8, LowerError> {
        match expr {
            Expr::Literal { value, ty } => {
                let r = self.fresh_reg()?;
                self.emit_mv_reg_imm(r, *value, ty);
                Ok(r)
            }
            Expr::Local { id, ty } => {
                let offset = self.local_offset(*id)?;
                let r_addr = self.fresh_reg()?;
                self.emit_add_fp(r_addr, offset)?;
                let r = self.fresh_reg()?;
                self.emit_mv_reg_loc(ty, r, r_addr)?;
                Ok(r)
            }
            Expr::Param { index, ty } => {
                let magnitude = *self
                    .param_magnitude
                    .get(*index as usize)
                    .ok_or(LowerError::UnresolvedParam { index: *index })?;
                let r_addr = self.fresh_reg()?;
                self.emit_sub_fp(r_addr, magnitude)?;
                let r = self.fresh_reg()?;
                self.emit_mv_reg_loc(ty, r, r_addr)?;
                Ok(r)
            }
            Expr::Tuple { .. } => Err(LowerError::UncomputableSize {
                what: "a bare tuple value outside a let-binding or destructure".into(),
            }),
            Expr::Destructure { value, targets } => self.lower_destructure(value, targets),
            Expr::BinOp { op, lhs, rhs } => {
                let (r_lhs, r_rhs) = self.lower_pair(lhs, rhs)?;
                let r_dst = self.fresh_reg()?;
                self.emit_binop(*op, r_dst, r_lhs, r_rhs);
                Ok(r_dst)
            }
            Expr::Let { id, value } => self.lower_let_or_assign(*id, value),
            Expr::Assign { id, value } => self.lower_let_or_assign(*id, value),
            Expr::Block { decls, body } => self.lower_block(decls, body),
            Expr::If {
                cond,
                then_branch,
                else_branch,
            } => self.lower_if(cond, then_branch, else_branch),
            Expr::While { cond, body } => self.lower_while(cond, body),
            Expr::Call {
                callee,
                args,
                native,
                ..
            } => self.lower_call(callee, args, *native),
        }
    }
}

/// Lowers one function declaration into a [`Function`] with symbolic labels and
/// call-site ids still in place.
fn lower_function(decl: &FunctionDecl) -> Result<Function, LowerError> {
    let mut lowerer = Lowerer::new(decl);
    let r_result = lowerer.lower_expr(&decl.body)?;
    if r_result != RET_REG {
        lowerer.emit_op(Opcode::Mv64RegReg, &[RET_REG, r_result]);
    }
    let input_size = lowerer.input_size;
    let in_size_u8 = u8::try_from(input_size).map_err(|_| LowerError::UncomputableSize {
        what: "input size exceeds the 8-bit RET_UI8 operand range".into(),
    })?;
    lowerer.emit_op(Opcode::RetUi8, &[in_size_u8]);

    let mut function = Function::new_bytecode(
        decl.name.clone(),
        lowerer.code,
        FrameLayout {
            input_size,
            output_size: decl.return_ty.byte_size(),
            locals_size: lowerer.peak_locals as usize,
        },
    );
    if let Some(symbols) = function.symbols_mut() {
        *symbols = lowerer.symbols;
    }
    Ok(function)
}

/// Lowers every function in a [`TypedProgram`] into a [`Program`] ready for the
/// linker.
pub fn lower(typed: &TypedProgram) -> Result<Program, LowerError> {
    let mut program = Program::new();
    for decl in &typed.functions {
        program.add_function(lower_function(decl)?);
    }
    Ok(program)
}
