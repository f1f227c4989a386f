use std::rc::Rc;

use crate::error::Error;
use crate::error::*;
use crate::instance::{FuncKind, Instance, TableTarget};
use crate::leb128::{read_leb128, read_sleb128};
use crate::module::Function;
use crate::stack::{OperandStack, WasmValue};

/// Maximum call depth. A call at depth > limit traps before any frame
/// setup; an embedder entry at exactly the limit still runs.
pub const CALL_STACK_LIMIT: u32 = 2048;

// Trap raised by a callee; the embedder only ever observes the pair below.
const CALLEE_TRAP: &str = "callee trapped";

/// What `execute` hands back: `trapped` implies no value; otherwise a value
/// is present iff the function's result arity is 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionResult {
    pub trapped: bool,
    pub value: Option<WasmValue>,
}

impl ExecutionResult {
    pub fn trap() -> Self {
        Self { trapped: true, value: None }
    }
    pub fn none() -> Self {
        Self { trapped: false, value: None }
    }
    pub fn value(v: WasmValue) -> Self {
        Self { trapped: false, value: Some(v) }
    }
}

/// Invokes a function in the instance's index space: internal bodies run in
/// the interpreter, imported callables through their host thunk with
/// depth+1. The caller guarantees |args| equals the parameter count.
pub fn execute(instance: &Rc<Instance>, func_idx: usize, args: &[WasmValue], depth: u32) -> ExecutionResult {
    if depth > CALL_STACK_LIMIT {
        return ExecutionResult::trap();
    }

    match &instance.functions[func_idx].kind {
        FuncKind::Host { thunk } => thunk.as_ref()(instance, args, depth + 1),
        FuncKind::Wasm { func_idx } => {
            let func = &instance.module.functions[*func_idx as usize];
            debug_assert_eq!(args.len(), func.ty.params.len());

            // Parameters first, declared locals zero-initialized after them
            let mut locals = vec![WasmValue::default(); func.locals.len()];
            locals[..args.len()].copy_from_slice(args);
            let mut stack = OperandStack::with_capacity(func.max_stack_height as usize);

            match interpret(instance, func, &mut locals, &mut stack, depth) {
                Ok(()) => match func.ty.result {
                    Some(_) => ExecutionResult::value(stack.pop()),
                    None => ExecutionResult::none(),
                },
                Err(_) => ExecutionResult::trap(),
            }
        }
    }
}

// ---------------- Interpreter ----------------

struct Label {
    target_pc: usize,
    /// Operand stack height at label entry.
    stack_height: usize,
    /// Number of operands a branch to this label carries.
    arity: usize,
    is_loop: bool,
}

/// Pops labels down to the branch target, preserving the branch operands,
/// and returns the continuation pc. A loop label survives its own branch.
fn take_branch(labels: &mut Vec<Label>, stack: &mut OperandStack, label_idx: u32) -> usize {
    let idx = labels.len() - 1 - label_idx as usize;
    let (target_pc, stack_height, arity, is_loop) = {
        let l = &labels[idx];
        (l.target_pc, l.stack_height, l.arity, l.is_loop)
    };
    stack.unwind(stack_height, arity);
    if is_loop {
        labels.truncate(idx + 1);
    } else {
        labels.truncate(idx);
    }
    target_pc
}

#[inline]
fn mem_imm(bytes: &[u8], pc: &mut usize) -> Result<u32, Error> {
    let _align: u32 = read_leb128(bytes, pc)?;
    read_leb128(bytes, pc)
}

macro_rules! load {
    ($inst:expr, $stack:expr, $bytes:expr, $pc:expr, $method:ident, $from:ident) => {{
        let offset = mem_imm($bytes, &mut $pc)?;
        let ptr = $stack.pop().as_u32();
        let mem = $inst.memory.as_ref().unwrap();
        let v = mem.borrow().$method(ptr, offset).map_err(Error::Trap)?;
        $stack.push(WasmValue::$from(v));
    }};
    ($inst:expr, $stack:expr, $bytes:expr, $pc:expr, $method:ident, $from:ident, $cast:ty) => {{
        let offset = mem_imm($bytes, &mut $pc)?;
        let ptr = $stack.pop().as_u32();
        let mem = $inst.memory.as_ref().unwrap();
        let v = mem.borrow().$method(ptr, offset).map_err(Error::Trap)?;
        $stack.push(WasmValue::$from(v as $cast));
    }};
}

macro_rules! store {
    ($inst:expr, $stack:expr, $bytes:expr, $pc:expr, $method:ident, $as:ident $(as $cast:ty)?) => {{
        let offset = mem_imm($bytes, &mut $pc)?;
        let v = $stack.pop().$as() $(as $cast)?;
        let ptr = $stack.pop().as_u32();
        let mem = $inst.memory.as_ref().unwrap();
        mem.borrow_mut().$method(ptr, offset, v).map_err(Error::Trap)?;
    }};
}

macro_rules! unop {
    ($stack:expr, $as:ident, $from:ident, $f:expr) => {{
        let a = $stack.pop().$as();
        $stack.push(WasmValue::$from(($f)(a)));
    }};
}

macro_rules! unop_trap {
    ($stack:expr, $as:ident, $from:ident, $f:expr) => {{
        let a = $stack.pop().$as();
        $stack.push(WasmValue::$from(($f)(a).map_err(Error::Trap)?));
    }};
}

macro_rules! binop {
    ($stack:expr, $as:ident, $from:ident, $f:expr) => {{
        let b = $stack.pop().$as();
        let a = $stack.pop().$as();
        $stack.push(WasmValue::$from(($f)(a, b)));
    }};
}

macro_rules! binop_trap {
    ($stack:expr, $as:ident, $from:ident, $f:expr) => {{
        let b = $stack.pop().$as();
        let a = $stack.pop().$as();
        $stack.push(WasmValue::$from(($f)(a, b).map_err(Error::Trap)?));
    }};
}

macro_rules! cmp {
    ($stack:expr, $as:ident, $op:tt) => {{
        let b = $stack.pop().$as();
        let a = $stack.pop().$as();
        $stack.push(WasmValue::from_u32((a $op b) as u32));
    }};
}

/// Runs one function body to completion or trap. The operand stack and
/// locals belong to this activation; nested calls get frames of their own
/// through `execute`.
fn interpret(
    instance: &Rc<Instance>,
    func: &Function,
    locals: &mut [WasmValue],
    stack: &mut OperandStack,
    depth: u32,
) -> Result<(), Error> {
    let module = &instance.module;
    let bytes: &[u8] = &module.bytes;
    let code_end = func.body.end;
    let mut pc = func.body.start;

    // The implicit function label; branching to it is `return`.
    let mut labels: Vec<Label> = Vec::with_capacity(8);
    labels.push(Label {
        target_pc: code_end - 1,
        stack_height: 0,
        arity: func.ty.result_count() as usize,
        is_loop: false,
    });

    loop {
        let op_pc = pc;
        let op = bytes[pc];
        pc += 1;
        match op {
            0x00 => return Err(Error::Trap(UNREACHABLE)), // unreachable
            0x01 => {}                                    // nop
            0x02 => {
                // block
                let arity = (bytes[pc] != 0x40) as usize;
                pc += 1;
                let end_pc = module.block_ends[&op_pc];
                labels.push(Label {
                    target_pc: end_pc + 1,
                    stack_height: stack.len(),
                    arity,
                    is_loop: false,
                });
            }
            0x03 => {
                // loop: the branch target is the loop body itself
                pc += 1;
                labels.push(Label {
                    target_pc: pc,
                    stack_height: stack.len(),
                    arity: 0,
                    is_loop: true,
                });
            }
            0x04 => {
                // if
                let arity = (bytes[pc] != 0x40) as usize;
                pc += 1;
                let jumps = module.if_jumps[&op_pc];
                let cond = stack.pop().as_u32();
                labels.push(Label {
                    target_pc: jumps.end_offset + 1,
                    stack_height: stack.len(),
                    arity,
                    is_loop: false,
                });
                if cond == 0 {
                    pc = if jumps.else_offset != jumps.end_offset {
                        jumps.else_offset + 1
                    } else {
                        // No else arm: land on the end, which pops the label
                        jumps.end_offset
                    };
                }
            }
            0x05 => {
                // else reached by falling out of the then-arm: skip to end
                pc = module.block_ends[&op_pc];
            }
            0x0b => {
                // end
                if labels.len() <= 1 {
                    return Ok(());
                }
                labels.pop();
            }
            0x0c => {
                // br
                let label_idx: u32 = read_leb128(bytes, &mut pc)?;
                pc = take_branch(&mut labels, stack, label_idx);
                if labels.is_empty() {
                    return Ok(());
                }
            }
            0x0d => {
                // br_if
                let label_idx: u32 = read_leb128(bytes, &mut pc)?;
                if stack.pop().as_u32() != 0 {
                    pc = take_branch(&mut labels, stack, label_idx);
                    if labels.is_empty() {
                        return Ok(());
                    }
                }
            }
            0x0e => {
                // br_table
                let n_targets: u32 = read_leb128(bytes, &mut pc)?;
                let mut targets: Vec<u32> = Vec::with_capacity(n_targets as usize);
                for _ in 0..n_targets {
                    targets.push(read_leb128(bytes, &mut pc)?);
                }
                let default_target: u32 = read_leb128(bytes, &mut pc)?;
                let i = stack.pop().as_u32();
                let chosen = targets.get(i as usize).copied().unwrap_or(default_target);
                pc = take_branch(&mut labels, stack, chosen);
                if labels.is_empty() {
                    return Ok(());
                }
            }
            0x0f => {
                // return
                let arity = labels[0].arity;
                stack.unwind(0, arity);
                return Ok(());
            }
            0x10 => {
                // call
                let func_idx: u32 = read_leb128(bytes, &mut pc)?;
                let n_params = instance.functions[func_idx as usize].ty.params.len();
                let result = execute(instance, func_idx as usize, stack.top_slice(n_params), depth + 1);
                stack.drop_n(n_params);
                if result.trapped {
                    return Err(Error::Trap(CALLEE_TRAP));
                }
                if let Some(v) = result.value {
                    stack.push(v);
                }
            }
            0x11 => {
                // call_indirect: trap order is bounds, empty slot, type
                let type_idx: u32 = read_leb128(bytes, &mut pc)?;
                pc += 1; // table index, fixed 0
                let elem_idx = stack.pop().as_u32();
                let expected = &module.types[type_idx as usize];

                let table = instance.table.as_ref().unwrap();
                let entry = table.borrow().get(elem_idx).map_err(Error::Trap)?;
                let entry = entry.ok_or(Error::Trap(UNINITIALIZED_ELEM))?;
                if entry.ty != *expected {
                    return Err(Error::Trap(INDIRECT_CALL_MISMATCH));
                }

                let n_params = entry.ty.params.len();
                let args = stack.top_slice(n_params);
                let result = match &entry.target {
                    TableTarget::Instance { owner, func_idx } => match owner.upgrade() {
                        Some(owner) => execute(&owner, *func_idx as usize, args, depth + 1),
                        None => return Err(Error::Trap(UNINITIALIZED_ELEM)),
                    },
                    TableTarget::Host { thunk } => thunk.as_ref()(instance, args, depth + 1),
                };
                stack.drop_n(n_params);
                if result.trapped {
                    return Err(Error::Trap(CALLEE_TRAP));
                }
                if let Some(v) = result.value {
                    stack.push(v);
                }
            }
            0x1a => {
                stack.pop(); // drop
            }
            0x1b => {
                // select
                let c = stack.pop().as_u32();
                let b = stack.pop();
                let a = stack.pop();
                stack.push(if c != 0 { a } else { b });
            }
            0x20 => {
                let idx: u32 = read_leb128(bytes, &mut pc)?;
                stack.push(locals[idx as usize]);
            }
            0x21 => {
                let idx: u32 = read_leb128(bytes, &mut pc)?;
                locals[idx as usize] = stack.pop();
            }
            0x22 => {
                let idx: u32 = read_leb128(bytes, &mut pc)?;
                locals[idx as usize] = stack.peek(0);
            }
            0x23 => {
                let idx: u32 = read_leb128(bytes, &mut pc)?;
                stack.push(instance.globals[idx as usize].borrow().value);
            }
            0x24 => {
                let idx: u32 = read_leb128(bytes, &mut pc)?;
                instance.globals[idx as usize].borrow_mut().value = stack.pop();
            }
            // Memory loads
            0x28 => load!(instance, stack, bytes, pc, load_u32, from_u32),
            0x29 => load!(instance, stack, bytes, pc, load_u64, from_u64),
            0x2a => load!(instance, stack, bytes, pc, load_f32, from_f32),
            0x2b => load!(instance, stack, bytes, pc, load_f64, from_f64),
            0x2c => load!(instance, stack, bytes, pc, load_i8, from_i32, i32),
            0x2d => load!(instance, stack, bytes, pc, load_u8, from_u32, u32),
            0x2e => load!(instance, stack, bytes, pc, load_i16, from_i32, i32),
            0x2f => load!(instance, stack, bytes, pc, load_u16, from_u32, u32),
            0x30 => load!(instance, stack, bytes, pc, load_i8, from_i64, i64),
            0x31 => load!(instance, stack, bytes, pc, load_u8, from_u64, u64),
            0x32 => load!(instance, stack, bytes, pc, load_i16, from_i64, i64),
            0x33 => load!(instance, stack, bytes, pc, load_u16, from_u64, u64),
            0x34 => load!(instance, stack, bytes, pc, load_i32, from_i64, i64),
            0x35 => load!(instance, stack, bytes, pc, load_u32, from_u64, u64),
            // Memory stores
            0x36 => store!(instance, stack, bytes, pc, store_u32, as_u32),
            0x37 => store!(instance, stack, bytes, pc, store_u64, as_u64),
            0x38 => store!(instance, stack, bytes, pc, store_f32, as_f32),
            0x39 => store!(instance, stack, bytes, pc, store_f64, as_f64),
            0x3a => store!(instance, stack, bytes, pc, store_u8, as_u32 as u8),
            0x3b => store!(instance, stack, bytes, pc, store_u16, as_u32 as u16),
            0x3c => store!(instance, stack, bytes, pc, store_u8, as_u64 as u8),
            0x3d => store!(instance, stack, bytes, pc, store_u16, as_u64 as u16),
            0x3e => store!(instance, stack, bytes, pc, store_u32, as_u64 as u32),
            0x3f => {
                // memory.size
                pc += 1;
                let mem = instance.memory.as_ref().unwrap();
                let size = mem.borrow().size();
                stack.push(WasmValue::from_u32(size));
            }
            0x40 => {
                // memory.grow
                pc += 1;
                let delta = stack.pop().as_u32();
                let mem = instance.memory.as_ref().unwrap();
                let old = mem.borrow_mut().grow(delta);
                stack.push(WasmValue::from_u32(old));
            }
            // Constants
            0x41 => {
                let v: i32 = read_sleb128(bytes, &mut pc)?;
                stack.push(WasmValue::from_i32(v));
            }
            0x42 => {
                let v: i64 = read_sleb128(bytes, &mut pc)?;
                stack.push(WasmValue::from_i64(v));
            }
            0x43 => {
                let bits = u32::from_le_bytes(bytes[pc..pc + 4].try_into().unwrap());
                pc += 4;
                stack.push(WasmValue::from_f32_bits(bits));
            }
            0x44 => {
                let bits = u64::from_le_bytes(bytes[pc..pc + 8].try_into().unwrap());
                pc += 8;
                stack.push(WasmValue::from_f64_bits(bits));
            }
            // i32 comparisons
            0x45 => unop!(stack, as_u32, from_u32, |a: u32| (a == 0) as u32), // eqz
            0x46 => cmp!(stack, as_u32, ==),
            0x47 => cmp!(stack, as_u32, !=),
            0x48 => cmp!(stack, as_i32, <),
            0x49 => cmp!(stack, as_u32, <),
            0x4a => cmp!(stack, as_i32, >),
            0x4b => cmp!(stack, as_u32, >),
            0x4c => cmp!(stack, as_i32, <=),
            0x4d => cmp!(stack, as_u32, <=),
            0x4e => cmp!(stack, as_i32, >=),
            0x4f => cmp!(stack, as_u32, >=),
            // i64 comparisons
            0x50 => unop!(stack, as_u64, from_u32, |a: u64| (a == 0) as u32), // eqz
            0x51 => cmp!(stack, as_u64, ==),
            0x52 => cmp!(stack, as_u64, !=),
            0x53 => cmp!(stack, as_i64, <),
            0x54 => cmp!(stack, as_u64, <),
            0x55 => cmp!(stack, as_i64, >),
            0x56 => cmp!(stack, as_u64, >),
            0x57 => cmp!(stack, as_i64, <=),
            0x58 => cmp!(stack, as_u64, <=),
            0x59 => cmp!(stack, as_i64, >=),
            0x5a => cmp!(stack, as_u64, >=),
            // f32 comparisons
            0x5b => cmp!(stack, as_f32, ==),
            0x5c => cmp!(stack, as_f32, !=),
            0x5d => cmp!(stack, as_f32, <),
            0x5e => cmp!(stack, as_f32, >),
            0x5f => cmp!(stack, as_f32, <=),
            0x60 => cmp!(stack, as_f32, >=),
            // f64 comparisons
            0x61 => cmp!(stack, as_f64, ==),
            0x62 => cmp!(stack, as_f64, !=),
            0x63 => cmp!(stack, as_f64, <),
            0x64 => cmp!(stack, as_f64, >),
            0x65 => cmp!(stack, as_f64, <=),
            0x66 => cmp!(stack, as_f64, >=),
            // i32 arithmetic
            0x67 => unop!(stack, as_u32, from_u32, |a: u32| a.leading_zeros()),
            0x68 => unop!(stack, as_u32, from_u32, |a: u32| a.trailing_zeros()),
            0x69 => unop!(stack, as_u32, from_u32, |a: u32| a.count_ones()),
            0x6a => binop!(stack, as_u32, from_u32, |a: u32, b: u32| a.wrapping_add(b)),
            0x6b => binop!(stack, as_u32, from_u32, |a: u32, b: u32| a.wrapping_sub(b)),
            0x6c => binop!(stack, as_u32, from_u32, |a: u32, b: u32| a.wrapping_mul(b)),
            0x6d => binop_trap!(stack, as_i32, from_i32, i32_div_s),
            0x6e => binop_trap!(stack, as_u32, from_u32, u32_div),
            0x6f => binop_trap!(stack, as_i32, from_i32, i32_rem_s),
            0x70 => binop_trap!(stack, as_u32, from_u32, u32_rem),
            0x71 => binop!(stack, as_u32, from_u32, |a: u32, b: u32| a & b),
            0x72 => binop!(stack, as_u32, from_u32, |a: u32, b: u32| a | b),
            0x73 => binop!(stack, as_u32, from_u32, |a: u32, b: u32| a ^ b),
            0x74 => binop!(stack, as_u32, from_u32, |a: u32, b: u32| a.wrapping_shl(b)),
            0x75 => binop!(stack, as_i32, from_i32, |a: i32, b: i32| a.wrapping_shr(b as u32 & 31)),
            0x76 => binop!(stack, as_u32, from_u32, |a: u32, b: u32| a.wrapping_shr(b)),
            0x77 => binop!(stack, as_u32, from_u32, |a: u32, b: u32| a.rotate_left(b)),
            0x78 => binop!(stack, as_u32, from_u32, |a: u32, b: u32| a.rotate_right(b)),
            // i64 arithmetic
            0x79 => unop!(stack, as_u64, from_u64, |a: u64| a.leading_zeros() as u64),
            0x7a => unop!(stack, as_u64, from_u64, |a: u64| a.trailing_zeros() as u64),
            0x7b => unop!(stack, as_u64, from_u64, |a: u64| a.count_ones() as u64),
            0x7c => binop!(stack, as_u64, from_u64, |a: u64, b: u64| a.wrapping_add(b)),
            0x7d => binop!(stack, as_u64, from_u64, |a: u64, b: u64| a.wrapping_sub(b)),
            0x7e => binop!(stack, as_u64, from_u64, |a: u64, b: u64| a.wrapping_mul(b)),
            0x7f => binop_trap!(stack, as_i64, from_i64, i64_div_s),
            0x80 => binop_trap!(stack, as_u64, from_u64, u64_div),
            0x81 => binop_trap!(stack, as_i64, from_i64, i64_rem_s),
            0x82 => binop_trap!(stack, as_u64, from_u64, u64_rem),
            0x83 => binop!(stack, as_u64, from_u64, |a: u64, b: u64| a & b),
            0x84 => binop!(stack, as_u64, from_u64, |a: u64, b: u64| a | b),
            0x85 => binop!(stack, as_u64, from_u64, |a: u64, b: u64| a ^ b),
            0x86 => binop!(stack, as_u64, from_u64, |a: u64, b: u64| a.wrapping_shl(b as u32)),
            0x87 => binop!(stack, as_i64, from_i64, |a: i64, b: i64| a.wrapping_shr(b as u32 & 63)),
            0x88 => binop!(stack, as_u64, from_u64, |a: u64, b: u64| a.wrapping_shr(b as u32)),
            0x89 => binop!(stack, as_u64, from_u64, |a: u64, b: u64| a.rotate_left(b as u32)),
            0x8a => binop!(stack, as_u64, from_u64, |a: u64, b: u64| a.rotate_right(b as u32)),
            // f32 arithmetic
            0x8b => unop!(stack, as_f32, from_f32, |a: f32| a.abs()),
            0x8c => unop!(stack, as_f32, from_f32, |a: f32| -a),
            0x8d => unop!(stack, as_f32, from_f32, |a: f32| a.ceil()),
            0x8e => unop!(stack, as_f32, from_f32, |a: f32| a.floor()),
            0x8f => unop!(stack, as_f32, from_f32, |a: f32| a.trunc()),
            0x90 => unop!(stack, as_f32, from_f32, |a: f32| a.round_ties_even()),
            0x91 => unop!(stack, as_f32, from_f32, |a: f32| a.sqrt()),
            0x92 => binop!(stack, as_f32, from_f32, |a: f32, b: f32| a + b),
            0x93 => binop!(stack, as_f32, from_f32, |a: f32, b: f32| a - b),
            0x94 => binop!(stack, as_f32, from_f32, |a: f32, b: f32| a * b),
            0x95 => binop!(stack, as_f32, from_f32, |a: f32, b: f32| a / b),
            0x96 => binop!(stack, as_f32, from_f32, f32_min),
            0x97 => binop!(stack, as_f32, from_f32, f32_max),
            0x98 => binop!(stack, as_f32, from_f32, |a: f32, b: f32| a.copysign(b)),
            // f64 arithmetic
            0x99 => unop!(stack, as_f64, from_f64, |a: f64| a.abs()),
            0x9a => unop!(stack, as_f64, from_f64, |a: f64| -a),
            0x9b => unop!(stack, as_f64, from_f64, |a: f64| a.ceil()),
            0x9c => unop!(stack, as_f64, from_f64, |a: f64| a.floor()),
            0x9d => unop!(stack, as_f64, from_f64, |a: f64| a.trunc()),
            0x9e => unop!(stack, as_f64, from_f64, |a: f64| a.round_ties_even()),
            0x9f => unop!(stack, as_f64, from_f64, |a: f64| a.sqrt()),
            0xa0 => binop!(stack, as_f64, from_f64, |a: f64, b: f64| a + b),
            0xa1 => binop!(stack, as_f64, from_f64, |a: f64, b: f64| a - b),
            0xa2 => binop!(stack, as_f64, from_f64, |a: f64, b: f64| a * b),
            0xa3 => binop!(stack, as_f64, from_f64, |a: f64, b: f64| a / b),
            0xa4 => binop!(stack, as_f64, from_f64, f64_min),
            0xa5 => binop!(stack, as_f64, from_f64, f64_max),
            0xa6 => binop!(stack, as_f64, from_f64, |a: f64, b: f64| a.copysign(b)),
            // Conversions
            0xa7 => unop!(stack, as_u64, from_u32, |a: u64| a as u32), // i32.wrap_i64
            0xa8 => unop_trap!(stack, as_f32, from_i32, |a: f32| trunc_i32(a as f64)),
            0xa9 => unop_trap!(stack, as_f32, from_u32, |a: f32| trunc_u32(a as f64)),
            0xaa => unop_trap!(stack, as_f64, from_i32, trunc_i32),
            0xab => unop_trap!(stack, as_f64, from_u32, trunc_u32),
            0xac => unop!(stack, as_i32, from_i64, |a: i32| a as i64), // i64.extend_i32_s
            0xad => unop!(stack, as_u32, from_u64, |a: u32| a as u64), // i64.extend_i32_u
            0xae => unop_trap!(stack, as_f32, from_i64, |a: f32| trunc_i64(a as f64)),
            0xaf => unop_trap!(stack, as_f32, from_u64, |a: f32| trunc_u64(a as f64)),
            0xb0 => unop_trap!(stack, as_f64, from_i64, trunc_i64),
            0xb1 => unop_trap!(stack, as_f64, from_u64, trunc_u64),
            0xb2 => unop!(stack, as_i32, from_f32, |a: i32| a as f32),
            0xb3 => unop!(stack, as_u32, from_f32, |a: u32| a as f32),
            0xb4 => unop!(stack, as_i64, from_f32, |a: i64| a as f32),
            0xb5 => unop!(stack, as_u64, from_f32, |a: u64| a as f32),
            0xb6 => unop!(stack, as_f64, from_f32, |a: f64| a as f32), // f32.demote_f64
            0xb7 => unop!(stack, as_i32, from_f64, |a: i32| a as f64),
            0xb8 => unop!(stack, as_u32, from_f64, |a: u32| a as f64),
            0xb9 => unop!(stack, as_i64, from_f64, |a: i64| a as f64),
            0xba => unop!(stack, as_u64, from_f64, |a: u64| a as f64),
            0xbb => unop!(stack, as_f32, from_f64, |a: f32| a as f64), // f64.promote_f32
            0xbc => unop!(stack, as_f32_bits, from_u32, |a: u32| a),   // i32.reinterpret_f32
            0xbd => unop!(stack, as_f64_bits, from_u64, |a: u64| a),   // i64.reinterpret_f64
            0xbe => unop!(stack, as_u32, from_f32_bits, |a: u32| a),   // f32.reinterpret_i32
            0xbf => unop!(stack, as_u64, from_f64_bits, |a: u64| a),   // f64.reinterpret_i64
            _ => return Err(Error::Malformed(UNKNOWN_INSTRUCTION)),
        }
    }
}

// ---------------- Trapping integer helpers ----------------

fn i32_div_s(a: i32, b: i32) -> Result<i32, &'static str> {
    if b == 0 {
        Err(DIVIDE_BY_ZERO)
    } else if a == i32::MIN && b == -1 {
        Err(INTEGER_OVERFLOW)
    } else {
        Ok(a.wrapping_div(b))
    }
}

fn i64_div_s(a: i64, b: i64) -> Result<i64, &'static str> {
    if b == 0 {
        Err(DIVIDE_BY_ZERO)
    } else if a == i64::MIN && b == -1 {
        Err(INTEGER_OVERFLOW)
    } else {
        Ok(a.wrapping_div(b))
    }
}

fn u32_div(a: u32, b: u32) -> Result<u32, &'static str> {
    if b == 0 { Err(DIVIDE_BY_ZERO) } else { Ok(a / b) }
}

fn u64_div(a: u64, b: u64) -> Result<u64, &'static str> {
    if b == 0 { Err(DIVIDE_BY_ZERO) } else { Ok(a / b) }
}

// rem of INT_MIN by -1 is 0, not a trap
fn i32_rem_s(a: i32, b: i32) -> Result<i32, &'static str> {
    if b == 0 { Err(DIVIDE_BY_ZERO) } else { Ok(a.wrapping_rem(b)) }
}

fn i64_rem_s(a: i64, b: i64) -> Result<i64, &'static str> {
    if b == 0 { Err(DIVIDE_BY_ZERO) } else { Ok(a.wrapping_rem(b)) }
}

fn u32_rem(a: u32, b: u32) -> Result<u32, &'static str> {
    if b == 0 { Err(DIVIDE_BY_ZERO) } else { Ok(a % b) }
}

fn u64_rem(a: u64, b: u64) -> Result<u64, &'static str> {
    if b == 0 { Err(DIVIDE_BY_ZERO) } else { Ok(a % b) }
}

// ---------------- Float helpers ----------------

// Truncations compare in f64, which represents every relevant bound
// exactly (f32 inputs are widened losslessly first).

fn trunc_i32(v: f64) -> Result<i32, &'static str> {
    if v.is_nan() {
        return Err(INVALID_CONV_TO_INT);
    }
    let t = v.trunc();
    if t < -2147483648.0 || t > 2147483647.0 {
        return Err(INTEGER_OVERFLOW);
    }
    Ok(t as i32)
}

fn trunc_u32(v: f64) -> Result<u32, &'static str> {
    if v.is_nan() {
        return Err(INVALID_CONV_TO_INT);
    }
    let t = v.trunc();
    if t < 0.0 || t > 4294967295.0 {
        return Err(INTEGER_OVERFLOW);
    }
    Ok(t as u32)
}

fn trunc_i64(v: f64) -> Result<i64, &'static str> {
    if v.is_nan() {
        return Err(INVALID_CONV_TO_INT);
    }
    let t = v.trunc();
    // 2^63 - 1 is not representable in f64; the first out-of-range value
    // on the high side is exactly 2^63.
    if t < -9223372036854775808.0 || t >= 9223372036854775808.0 {
        return Err(INTEGER_OVERFLOW);
    }
    Ok(t as i64)
}

fn trunc_u64(v: f64) -> Result<u64, &'static str> {
    if v.is_nan() {
        return Err(INVALID_CONV_TO_INT);
    }
    let t = v.trunc();
    if t < 0.0 || t >= 18446744073709551616.0 {
        return Err(INTEGER_OVERFLOW);
    }
    Ok(t as u64)
}

// min/max propagate NaN and order signed zeros, unlike the std float min/max

fn f32_min(a: f32, b: f32) -> f32 {
    if a.is_nan() || b.is_nan() {
        f32::NAN
    } else if a == 0.0 && b == 0.0 {
        if a.is_sign_negative() || b.is_sign_negative() { -0.0 } else { 0.0 }
    } else if a < b {
        a
    } else {
        b
    }
}

fn f32_max(a: f32, b: f32) -> f32 {
    if a.is_nan() || b.is_nan() {
        f32::NAN
    } else if a == 0.0 && b == 0.0 {
        if a.is_sign_positive() || b.is_sign_positive() { 0.0 } else { -0.0 }
    } else if a > b {
        a
    } else {
        b
    }
}

fn f64_min(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        f64::NAN
    } else if a == 0.0 && b == 0.0 {
        if a.is_sign_negative() || b.is_sign_negative() { -0.0 } else { 0.0 }
    } else if a < b {
        a
    } else {
        b
    }
}

fn f64_max(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        f64::NAN
    } else if a == 0.0 && b == 0.0 {
        if a.is_sign_positive() || b.is_sign_positive() { 0.0 } else { -0.0 }
    } else if a > b {
        a
    } else {
        b
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_division_traps() {
        assert_eq!(i32_div_s(7, -2), Ok(-3));
        assert_eq!(i32_div_s(1, 0), Err(DIVIDE_BY_ZERO));
        assert_eq!(i32_div_s(i32::MIN, -1), Err(INTEGER_OVERFLOW));
        assert_eq!(i64_div_s(i64::MIN, -1), Err(INTEGER_OVERFLOW));
    }

    #[test]
    fn remainder_of_min_by_minus_one_is_zero() {
        assert_eq!(i32_rem_s(i32::MIN, -1), Ok(0));
        assert_eq!(i64_rem_s(i64::MIN, -1), Ok(0));
        assert_eq!(i32_rem_s(5, 0), Err(DIVIDE_BY_ZERO));
    }

    #[test]
    fn truncation_bounds() {
        assert_eq!(trunc_i32(2147483647.9), Ok(i32::MAX));
        assert_eq!(trunc_i32(-2147483648.9), Ok(i32::MIN));
        assert_eq!(trunc_i32(2147483648.0), Err(INTEGER_OVERFLOW));
        assert_eq!(trunc_i32(f64::NAN), Err(INVALID_CONV_TO_INT));
        assert_eq!(trunc_u32(-0.9), Ok(0));
        assert_eq!(trunc_u32(-1.0), Err(INTEGER_OVERFLOW));
        assert_eq!(trunc_i64(9223372036854775808.0), Err(INTEGER_OVERFLOW));
        assert_eq!(trunc_u64(18446744073709549568.0), Ok(18446744073709549568));
        assert_eq!(trunc_u64(18446744073709551616.0), Err(INTEGER_OVERFLOW));
    }

    #[test]
    fn float_min_max_zero_and_nan() {
        assert!(f32_min(f32::NAN, 1.0).is_nan());
        assert!(f64_max(1.0, f64::NAN).is_nan());
        assert!(f32_min(0.0, -0.0).is_sign_negative());
        assert!(f64_max(-0.0, 0.0).is_sign_positive());
        assert_eq!(f64_min(1.5, 2.5), 1.5);
        assert_eq!(f32_max(1.5, 2.5), 2.5);
    }
}
