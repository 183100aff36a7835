//! The register + stack machine state and its direct-threaded dispatch loop.
//!
//! There is no heap: every value a running program touches lives either in a
//! register or in the byte stack. The dispatch loop itself is a `loop` over a
//! `match` on the (already opcode-rewritten) handler offset produced by
//! [`crate::exec::threading::preprocess`] — in safe Rust without computed-goto
//! or guaranteed tail calls, that match *is* the direct-threaded contract; see
//! the module-level note in `exec::threading`.

use crate::bytecode::Opcode;
use crate::error::{NativeError, RuntimeError};
use crate::exec::DirectThreadedExecutable;

/// Number of logical 64-bit register slots in the machine's register file.
pub const NUM_REGISTERS: usize = 64;

/// Default byte capacity of the data stack.
pub const DEFAULT_STACK_SIZE: usize = 8 * 1024;

/// Conventional return-value register.
pub const RET_REG: u8 = 0;
/// Stack pointer: a byte index into the data stack.
pub const SP_REG: u8 = 61;
/// Frame pointer: a byte index into the data stack.
pub const FP_REG: u8 = 62;
/// Instruction pointer: a byte index into the linked, direct-threaded code.
/// Mirrors the dispatch loop's local `ip` at the start of every instruction so
/// `MV_REG_IP` has something to read from.
pub const IP_REG: u8 = 63;

/// Sentinel return address pushed beneath the entry function's frame. No real
/// instruction ever lives at this offset, so popping it back into `ip` is how
/// the dispatch loop recognizes the outermost `RET_UI8` and stops instead of
/// jumping into garbage.
const HALT_IP: u64 = u64::MAX;

/// The register file and data stack a single [`DirectThreadedExecutable`]
/// executes against. Owned exclusively by the thread running it (§5); there is
/// no shared mutable state between instructions.
#[derive(Debug, Clone)]
pub struct MachineState {
    pub registers: [u64; NUM_REGISTERS],
    stack: Vec<u8>,
}

impl MachineState {
    pub fn new() -> Self {
        Self::with_stack_size(DEFAULT_STACK_SIZE)
    }

    pub fn with_stack_size(stack_size: usize) -> Self {
        MachineState {
            registers: [0u64; NUM_REGISTERS],
            stack: vec![0u8; stack_size],
        }
    }

    pub fn sp(&self) -> u64 {
        self.registers[SP_REG as usize]
    }

    pub fn fp(&self) -> u64 {
        self.registers[FP_REG as usize]
    }

    pub fn ret_value(&self) -> u64 {
        self.registers[RET_REG as usize]
    }

    fn stack_capacity(&self) -> u64 {
        self.stack.len() as u64
    }

    // ---- stack primitives (§4.G) ---------------------------------------

    fn push8(&mut self, value: u8) -> Result<(), RuntimeError> {
        let sp = self.sp();
        if sp >= self.stack_capacity() {
            return Err(RuntimeError::StackOverflow);
        }
        self.stack[sp as usize] = value;
        self.registers[SP_REG as usize] = sp + 1;
        Ok(())
    }

    fn push16(&mut self, value: u16) -> Result<(), RuntimeError> {
        self.push_bytes(&value.to_le_bytes())
    }

    fn push32(&mut self, value: u32) -> Result<(), RuntimeError> {
        self.push_bytes(&value.to_le_bytes())
    }

    fn push64(&mut self, value: u64) -> Result<(), RuntimeError> {
        self.push_bytes(&value.to_le_bytes())
    }

    fn push_bytes(&mut self, bytes: &[u8]) -> Result<(), RuntimeError> {
        let sp = self.sp();
        let end = sp + bytes.len() as u64;
        if end > self.stack_capacity() {
            return Err(RuntimeError::StackOverflow);
        }
        self.stack[sp as usize..end as usize].copy_from_slice(bytes);
        self.registers[SP_REG as usize] = end;
        Ok(())
    }

    fn pop8(&mut self) -> Result<u8, RuntimeError> {
        let sp = self.sp();
        if sp < 1 {
            return Err(RuntimeError::StackUnderflow);
        }
        self.registers[SP_REG as usize] = sp - 1;
        Ok(self.stack[(sp - 1) as usize])
    }

    fn pop16(&mut self) -> Result<u16, RuntimeError> {
        let bytes = self.pop_bytes(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn pop32(&mut self) -> Result<u32, RuntimeError> {
        let bytes = self.pop_bytes(4)?;
        Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn pop64(&mut self) -> Result<u64, RuntimeError> {
        let bytes = self.pop_bytes(8)?;
        Ok(u64::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn pop_bytes(&mut self, n: u64) -> Result<Vec<u8>, RuntimeError> {
        let sp = self.sp();
        if sp < n {
            return Err(RuntimeError::StackUnderflow);
        }
        let start = (sp - n) as usize;
        self.registers[SP_REG as usize] = sp - n;
        Ok(self.stack[start..sp as usize].to_vec())
    }

    fn read_loc(&self, addr: u64, width: u8) -> u64 {
        let addr = addr as usize;
        match width {
            1 => self.stack[addr] as u64,
            2 => u16::from_le_bytes(self.stack[addr..addr + 2].try_into().unwrap()) as u64,
            4 => u32::from_le_bytes(self.stack[addr..addr + 4].try_into().unwrap()) as u64,
            8 => u64::from_le_bytes(self.stack[addr..addr + 8].try_into().unwrap()),
            _ => unreachable!("register/stack widths are always 1/2/4/8"),
        }
    }

    fn write_loc(&mut self, addr: u64, width: u8, value: u64) {
        let addr = addr as usize;
        match width {
            1 => self.stack[addr] = value as u8,
            2 => self.stack[addr..addr + 2].copy_from_slice(&(value as u16).to_le_bytes()),
            4 => self.stack[addr..addr + 4].copy_from_slice(&(value as u32).to_le_bytes()),
            8 => self.stack[addr..addr + 8].copy_from_slice(&value.to_le_bytes()),
            _ => unreachable!("register/stack widths are always 1/2/4/8"),
        }
    }

    /// The native ABI's view of the current frame: everything from the base
    /// of the stack up to (but not including) `sp`. A native callback
    /// addresses its own arguments relative to `fp`, exactly as bytecode does.
    fn stack_mut(&mut self) -> &mut [u8] {
        &mut self.stack
    }
}

impl Default for MachineState {
    fn default() -> Self {
        Self::new()
    }
}

/// The handler table the direct-threading preprocessor asks the VM to expose
/// (§4.F). Handler offsets in this VM are the identity map on the opcode
/// byte: the preprocessor's 2-byte "offset to handler" *is* the opcode value,
/// zero-extended. That keeps `vm_init`/`preprocess` honest about the
/// handler-table contract while the actual dispatch below is a `match`, per
/// the safe-Rust reading of §4.G's dispatch requirement.
pub fn vm_init() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut b: u16 = 0;
    while b < 256 {
        table[b as usize] = b;
        b += 1;
    }
    table
}

pub fn handler_offset(op: Opcode) -> u16 {
    op as u8 as u16
}

/// Runs a [`DirectThreadedExecutable`] starting at byte offset `0` of its
/// code. This is the entry point `anvil_cli` drives for flat, text-assembled
/// programs (§4.J), which have no enclosing function at all.
pub fn run(executable: &DirectThreadedExecutable) -> Result<MachineState, RuntimeError> {
    run_from(executable, 0)
}

/// Runs a [`DirectThreadedExecutable`] starting at an arbitrary (already
/// direct-threaded) byte offset — used by tests driving a specific function
/// out of a multi-function linked program (§8 scenario 6).
pub fn run_from(
    executable: &DirectThreadedExecutable,
    entry_offset: usize,
) -> Result<MachineState, RuntimeError> {
    let mut state = MachineState::new();
    // Bootstrap frame: a sentinel caller so the entry function's own RET_UI8
    // needs no special-casing — it just pops this frame like any other.
    // Pushed in the same order CALL_UI64 pushes a real frame (fp, then ip),
    // so RET_UI8's pop-ip-then-pop-fp order lands HALT_IP in `return_ip`.
    state.push64(0)?;
    state.push64(HALT_IP)?;
    state.registers[FP_REG as usize] = state.sp();

    let mut ip: usize = entry_offset;

    loop {
        if ip as u64 == HALT_IP {
            return Ok(state);
        }

        let handler_bytes = executable.code().read::<2>(ip);
        let handler_offset = u16::from_le_bytes(handler_bytes);
        let op = Opcode::from_u8(handler_offset as u8)
            .map_err(|_| RuntimeError::Err { offset: ip })?;
        let raw_size = op.size_of() as usize;
        // +1: direct-threaded instructions are one byte longer than their
        // pre-threading encoding (the opcode byte became a 2-byte handler
        // offset). The operand bytes themselves are unchanged and sit right
        // after the 2-byte handler offset.
        let threaded_size = raw_size + 1;
        let operand_at = ip + 2;

        let mut next_ip = ip + threaded_size;

        macro_rules! operand {
            ($n:expr) => {
                executable.code().read::<$n>(operand_at)
            };
        }

        match op {
            Opcode::Nop => {}

            Opcode::AddRegRegReg => binop3(&mut state, operand!(3), |a, b| a.wrapping_add(b)),
            Opcode::SubRegRegReg => binop3(&mut state, operand!(3), |a, b| a.wrapping_sub(b)),
            Opcode::MulRegRegReg => binop3(&mut state, operand!(3), |a, b| a.wrapping_mul(b)),
            Opcode::DivRegRegReg => {
                let bytes = operand!(3);
                let a = state.registers[bytes[1] as usize] as i64;
                let b = state.registers[bytes[2] as usize] as i64;
                if b == 0 {
                    return Err(RuntimeError::DivisionByZero);
                }
                state.registers[bytes[0] as usize] = a.wrapping_div(b) as u64;
            }
            Opcode::ModRegRegReg => {
                let bytes = operand!(3);
                let a = state.registers[bytes[1] as usize];
                let b = state.registers[bytes[2] as usize];
                if b == 0 {
                    return Err(RuntimeError::DivisionByZero);
                }
                state.registers[bytes[0] as usize] = a % b;
            }
            Opcode::AddRegRegUi8 => binop_imm(&mut state, operand!(3), |a, imm| a.wrapping_add(imm as u64)),
            Opcode::SubRegRegUi8 => binop_imm(&mut state, operand!(3), |a, imm| a.wrapping_sub(imm as u64)),

            Opcode::AndRegRegReg => binop3(&mut state, operand!(3), |a, b| a & b),
            Opcode::OrRegRegReg => binop3(&mut state, operand!(3), |a, b| a | b),
            Opcode::AndRegRegUi8 => binop_imm(&mut state, operand!(3), |a, imm| a & imm as u64),

            Opcode::GtRegRegReg => cmp3(&mut state, operand!(3), |a, b| a > b),
            Opcode::GteRegRegReg => cmp3(&mut state, operand!(3), |a, b| a >= b),
            Opcode::LtRegRegReg => cmp3(&mut state, operand!(3), |a, b| a < b),
            Opcode::LteRegRegReg => cmp3(&mut state, operand!(3), |a, b| a <= b),
            Opcode::EqRegRegReg => {
                let bytes = operand!(3);
                let a = state.registers[bytes[1] as usize];
                let b = state.registers[bytes[2] as usize];
                state.registers[bytes[0] as usize] = (a == b) as u64;
            }
            Opcode::NeqRegRegReg => {
                let bytes = operand!(3);
                let a = state.registers[bytes[1] as usize];
                let b = state.registers[bytes[2] as usize];
                state.registers[bytes[0] as usize] = (a != b) as u64;
            }

            Opcode::MvRegSp => {
                let bytes = operand!(1);
                state.registers[bytes[0] as usize] = state.sp();
            }
            Opcode::MvRegIp => {
                let bytes = operand!(1);
                state.registers[bytes[0] as usize] = ip as u64;
            }

            Opcode::MvRegUi8 => {
                let bytes = operand!(2);
                state.registers[bytes[0] as usize] = bytes[1] as u64;
            }
            Opcode::MvRegUi16 => {
                let bytes = operand!(3);
                state.registers[bytes[0] as usize] =
                    u16::from_le_bytes([bytes[1], bytes[2]]) as u64;
            }
            Opcode::MvRegUi32 => {
                let bytes = operand!(5);
                state.registers[bytes[0] as usize] =
                    u32::from_le_bytes(bytes[1..5].try_into().unwrap()) as u64;
            }
            Opcode::MvRegUi64 => {
                let bytes = operand!(9);
                state.registers[bytes[0] as usize] =
                    u64::from_le_bytes(bytes[1..9].try_into().unwrap());
            }
            Opcode::MvRegI8 => {
                let bytes = operand!(2);
                state.registers[bytes[0] as usize] = (bytes[1] as i8) as i64 as u64;
            }
            Opcode::MvRegI16 => {
                let bytes = operand!(3);
                state.registers[bytes[0] as usize] =
                    i16::from_le_bytes([bytes[1], bytes[2]]) as i64 as u64;
            }
            Opcode::MvRegI32 => {
                let bytes = operand!(5);
                state.registers[bytes[0] as usize] =
                    i32::from_le_bytes(bytes[1..5].try_into().unwrap()) as i64 as u64;
            }
            Opcode::MvRegI64 => {
                let bytes = operand!(9);
                state.registers[bytes[0] as usize] =
                    i64::from_le_bytes(bytes[1..9].try_into().unwrap()) as u64;
            }

            Opcode::Mv8RegReg => mv_reg_reg(&mut state, operand!(2), 1),
            Opcode::Mv16RegReg => mv_reg_reg(&mut state, operand!(2), 2),
            Opcode::Mv32RegReg => mv_reg_reg(&mut state, operand!(2), 4),
            Opcode::Mv64RegReg => mv_reg_reg(&mut state, operand!(2), 8),

            Opcode::Mv8LocReg => mv_loc_reg(&mut state, operand!(2), 1),
            Opcode::Mv16LocReg => mv_loc_reg(&mut state, operand!(2), 2),
            Opcode::Mv32LocReg => mv_loc_reg(&mut state, operand!(2), 4),
            Opcode::Mv64LocReg => mv_loc_reg(&mut state, operand!(2), 8),

            Opcode::Mv8RegLoc => mv_reg_loc(&mut state, operand!(2), 1),
            Opcode::Mv16RegLoc => mv_reg_loc(&mut state, operand!(2), 2),
            Opcode::Mv32RegLoc => mv_reg_loc(&mut state, operand!(2), 4),
            Opcode::Mv64RegLoc => mv_reg_loc(&mut state, operand!(2), 8),

            Opcode::Push8Reg => {
                let bytes = operand!(1);
                let value = state.registers[bytes[0] as usize] as u8;
                state.push8(value)?;
            }
            Opcode::Push16Reg => {
                let bytes = operand!(1);
                let value = state.registers[bytes[0] as usize] as u16;
                state.push16(value)?;
            }
            Opcode::Push32Reg => {
                let bytes = operand!(1);
                let value = state.registers[bytes[0] as usize] as u32;
                state.push32(value)?;
            }
            Opcode::Push64Reg => {
                let bytes = operand!(1);
                let value = state.registers[bytes[0] as usize];
                state.push64(value)?;
            }
            Opcode::Pop8Reg => {
                let bytes = operand!(1);
                let value = state.pop8()?;
                state.registers[bytes[0] as usize] = value as u64;
            }
            Opcode::Pop16Reg => {
                let bytes = operand!(1);
                let value = state.pop16()?;
                state.registers[bytes[0] as usize] = value as u64;
            }
            Opcode::Pop32Reg => {
                let bytes = operand!(1);
                let value = state.pop32()?;
                state.registers[bytes[0] as usize] = value as u64;
            }
            Opcode::Pop64Reg => {
                let bytes = operand!(1);
                let value = state.pop64()?;
                state.registers[bytes[0] as usize] = value;
            }

            Opcode::JmprI32 => {
                let bytes = operand!(4);
                let delta = i32::from_le_bytes(bytes);
                next_ip = (ip as i64 + delta as i64) as usize;
            }
            Opcode::JrnzRegI32 => {
                let bytes = operand!(5);
                let test = state.registers[bytes[0] as usize];
                if test != 0 {
                    let delta = i32::from_le_bytes(bytes[1..5].try_into().unwrap());
                    next_ip = (ip as i64 + delta as i64) as usize;
                }
            }
            Opcode::JrzRegI32 => {
                let bytes = operand!(5);
                let test = state.registers[bytes[0] as usize];
                if test == 0 {
                    let delta = i32::from_le_bytes(bytes[1..5].try_into().unwrap());
                    next_ip = (ip as i64 + delta as i64) as usize;
                }
            }

            Opcode::CallUi64 => {
                let bytes = operand!(8);
                let target = u64::from_le_bytes(bytes) as usize;
                state.push64(state.fp())?;
                state.push64(next_ip as u64)?;
                state.registers[FP_REG as usize] = state.sp();
                next_ip = target;
            }
            Opcode::CallNativeUi64 => {
                let bytes = operand!(8);
                let id = u64::from_le_bytes(bytes);
                let native = executable
                    .natives()
                    .get(id as usize)
                    .copied()
                    .ok_or(RuntimeError::InvalidNativeId { id })?;
                let status = {
                    let stack = state.stack_mut();
                    native(&mut state.registers, stack)
                };
                if status != 0 {
                    return Err(RuntimeError::Native(NativeError { id, status }));
                }
            }
            Opcode::RetUi8 => {
                let bytes = operand!(1);
                let in_size = bytes[0] as u64;
                state.registers[SP_REG as usize] = state.fp();
                let return_ip = state.pop64()?;
                let saved_fp = state.pop64()?;
                state.registers[FP_REG as usize] = saved_fp;
                state.registers[SP_REG as usize] = state.sp() - in_size;
                next_ip = return_ip as usize;
            }

            Opcode::LblUi32 => {
                // Never reaches a linked executable; the linker erases every
                // label to NOPs before the preprocessor ever sees the buffer.
                return Err(RuntimeError::Err { offset: ip });
            }

            Opcode::SallocRegUi8 => {
                let bytes = operand!(2);
                state.registers[bytes[0] as usize] = state.sp();
                let new_sp = state.sp() + bytes[1] as u64;
                if new_sp > state.stack_capacity() {
                    return Err(RuntimeError::StackOverflow);
                }
                state.registers[SP_REG as usize] = new_sp;
            }
            Opcode::SdeallocUi8 => {
                let bytes = operand!(1);
                let n = bytes[0] as u64;
                if state.sp() < n {
                    return Err(RuntimeError::StackUnderflow);
                }
                state.registers[SP_REG as usize] -= n;
            }

            Opcode::Exit => return Ok(state),
            Opcode::Err => return Err(RuntimeError::Err { offset: ip }),
        }

        state.registers[IP_REG as usize] = next_ip as u64;
        ip = next_ip;
    }
}

fn binop3(state: &mut MachineState, bytes: [u8; 3], f: impl Fn(i64, i64) -> i64) {
    let a = state.registers[bytes[1] as usize] as i64;
    let b = state.registers[bytes[2] as usize] as i64;
    state.registers[bytes[0] as usize] = f(a, b) as u64;
}

fn binop_imm(state: &mut MachineState, bytes: [u8; 3], f: impl Fn(u64, u8) -> u64) {
    let a = state.registers[bytes[1] as usize];
    let imm = bytes[2];
    state.registers[bytes[0] as usize] = f(a, imm);
}

fn cmp3(state: &mut MachineState, bytes: [u8; 3], f: impl Fn(i64, i64) -> bool) {
    let a = state.registers[bytes[1] as usize] as i64;
    let b = state.registers[bytes[2] as usize] as i64;
    state.registers[bytes[0] as usize] = f(a, b) as u64;
}

fn mv_reg_reg(state: &mut MachineState, bytes: [u8; 2], width: u8) {
    let mask: u64 = if width == 8 {
        u64::MAX
    } else {
        (1u64 << (width as u32 * 8)) - 1
    };
    let value = state.registers[bytes[1] as usize] & mask;
    state.registers[bytes[0] as usize] = value;
}

fn mv_loc_reg(state: &mut MachineState, bytes: [u8; 2], width: u8) {
    let addr = state.registers[bytes[0] as usize];
    let value = state.registers[bytes[1] as usize];
    state.write_loc(addr, width, value);
}

fn mv_reg_loc(state: &mut MachineState, bytes: [u8; 2], width: u8) {
    let addr = state.registers[bytes[1] as usize];
    let value = state.read_loc(addr, width);
    state.registers[bytes[0] as usize] = value;
}
