//! Bytecode to register code.
//!
//! The operand stack is simulated while translating: loads and constants
//! stay symbolic so a run of arithmetic becomes a few three-address ops.
//! A stack value is written to its own slot before anything that can reach
//! the runtime and at every join point. A compiled frame is therefore laid
//! out exactly like an interpreted one wherever it can be inspected, thrown
//! through, or handed back to the interpreter.

use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};

use thiserror::Error;

use super::code::{CompiledCode, Compare, Cond, Conversion, DivOp, FloatOp, IntOp, Op, Operand, Width};
use crate::{
    descriptor::FieldType,
    runtime::{
        Class, ConstantPoolInfo, Method, Slot,
        instructions::{self as inst, instruction_length, read_i16, read_i32, read_u16, switch_operands},
        interpreter::resolve,
        verifier::{FrameState, StackMaps},
    },
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    #[error("method has no code")]
    NoCode,
    #[error("method has not been verified")]
    NotVerified,
    #[error("method is {size} bytes, the limit is {limit}")]
    TooLarge { size: usize, limit: usize },
    #[error("unsupported instruction {opcode:#04x} at pc {pc}")]
    Unsupported { opcode: u8, pc: usize },
    #[error("malformed code at pc {0}")]
    Malformed(usize),
    #[error("method has breakpoints")]
    Watched,
}

/// Where a simulated stack slot's value lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Entry {
    /// In the slot itself. Also the second half of wide values.
    Stack,
    Local(u16),
    Const(Slot),
}

pub(crate) fn compile(method: &Arc<Method>, max_size: usize) -> Result<CompiledCode, CompileError> {
    let code = method.code().ok_or(CompileError::NoCode)?;
    let maps = method.stack_maps.get().ok_or(CompileError::NotVerified)?;
    let class = method.declaring_class().ok_or(CompileError::NoCode)?;
    let bytes = &*code.code;
    if bytes.len() > max_size {
        return Err(CompileError::TooLarge {
            size: bytes.len(),
            limit: max_size,
        });
    }
    let mut leaders = branch_targets(bytes, maps)?;
    leaders.extend(code.exception_table.iter().map(|item| item.handler_pc as usize));

    let mut compiler = Compiler::new(method, class, bytes, code.max_locals);
    let mut bc_to_op = vec![u32::MAX; bytes.len()];
    let mut dead = false;
    let mut pc = 0;
    while pc < bytes.len() {
        let length = instruction_length(bytes, pc).ok_or(CompileError::Malformed(pc))?;
        let Some(state) = maps.at(pc) else {
            dead = true;
            pc += length;
            continue;
        };
        if dead || leaders.contains(&pc) {
            if !dead {
                compiler.flush();
            }
            compiler.reset(state.depth());
        }
        bc_to_op[pc] = compiler.ops.len() as u32;
        compiler.begin(pc, state);
        dead = !compiler.instruction()?;
        pc += length;
    }
    Ok(compiler.finish(bc_to_op))
}

/// Reachable branch and switch targets.
fn branch_targets(code: &[u8], maps: &StackMaps) -> Result<BTreeSet<usize>, CompileError> {
    let malformed = |pc| CompileError::Malformed(pc);
    let target = |pc: usize, delta: i64| usize::try_from(pc as i64 + delta).map_err(|_| malformed(pc));
    let mut targets = BTreeSet::new();
    let mut pc = 0;
    while pc < code.len() {
        let length = instruction_length(code, pc).ok_or(malformed(pc))?;
        if maps.is_reachable(pc) {
            match code[pc] {
                inst::IFEQ..=inst::IF_ACMPNE | inst::GOTO | inst::IFNULL | inst::IFNONNULL => {
                    let delta = read_i16(code, pc + 1).ok_or(malformed(pc))?;
                    targets.insert(target(pc, delta as i64)?);
                }
                inst::GOTO_W => {
                    let delta = read_i32(code, pc + 1).ok_or(malformed(pc))?;
                    targets.insert(target(pc, delta as i64)?);
                }
                inst::TABLESWITCH => {
                    let at = pc + 1 + switch_operands(pc);
                    let word = |i: usize| read_i32(code, at + 4 * i).ok_or(malformed(pc));
                    let (low, high) = (word(1)?, word(2)?);
                    targets.insert(target(pc, word(0)? as i64)?);
                    for i in 0..(high as i64 - low as i64 + 1).max(0) as usize {
                        targets.insert(target(pc, word(3 + i)? as i64)?);
                    }
                }
                inst::LOOKUPSWITCH => {
                    let at = pc + 1 + switch_operands(pc);
                    let word = |i: usize| read_i32(code, at + 4 * i).ok_or(malformed(pc));
                    targets.insert(target(pc, word(0)? as i64)?);
                    for i in 0..word(1)?.max(0) as usize {
                        targets.insert(target(pc, word(3 + 2 * i)? as i64)?);
                    }
                }
                _ => {}
            }
        }
        pc += length;
    }
    Ok(targets)
}

struct Compiler<'m> {
    method: &'m Arc<Method>,
    class: Arc<Class>,
    code: &'m [u8],
    max_locals: u16,
    pc: usize,
    state: Option<&'m FrameState>,
    stack: Vec<Entry>,
    /// Depths held in their slot when the current instruction started.
    stored: Vec<bool>,
    ops: Vec<Op>,
    pc_map: Vec<u32>,
    record_of: Vec<u32>,
    records: Vec<Box<[u16]>>,
    record_index: HashMap<Box<[u16]>, u32>,
    /// Ops whose jump target is still a bytecode pc.
    fixups: Vec<usize>,
}

impl<'m> Compiler<'m> {
    fn new(method: &'m Arc<Method>, class: Arc<Class>, code: &'m [u8], max_locals: u16) -> Self {
        Self {
            method,
            class,
            code,
            max_locals,
            pc: 0,
            state: None,
            stack: Vec::new(),
            stored: Vec::new(),
            ops: Vec::new(),
            pc_map: Vec::new(),
            record_of: Vec::new(),
            records: Vec::new(),
            record_index: HashMap::new(),
            fixups: Vec::new(),
        }
    }

    fn begin(&mut self, pc: usize, state: &'m FrameState) {
        self.pc = pc;
        self.state = Some(state);
        self.stored = self.stack.iter().map(|entry| *entry == Entry::Stack).collect();
    }

    fn reset(&mut self, depth: usize) {
        self.stack = vec![Entry::Stack; depth];
    }

    fn finish(mut self, bc_to_op: Vec<u32>) -> CompiledCode {
        for &index in &self.fixups {
            let resolved = |target: u32| bc_to_op.get(target as usize).copied().unwrap_or(u32::MAX);
            match &mut self.ops[index] {
                Op::If { target, .. } | Op::Goto { target, .. } => *target = resolved(*target),
                _ => {}
            }
        }
        CompiledCode::new(self.ops, self.pc_map, bc_to_op, self.record_of, self.records)
    }

    fn emit(&mut self, op: Op) {
        let record = self.record();
        self.ops.push(op);
        self.pc_map.push(self.pc as u32);
        self.record_of.push(record);
    }

    /// Reference slots that hold their value if the frame stops at the op
    /// being emitted.
    fn record(&mut self) -> u32 {
        let max_locals = self.max_locals as usize;
        let slots: Box<[u16]> = match self.state {
            Some(state) => state
                .ref_slots(max_locals)
                .filter(|&slot| slot < max_locals || self.is_stored(slot - max_locals))
                .map(|slot| slot as u16)
                .collect(),
            None => Box::new([]),
        };
        if let Some(&index) = self.record_index.get(&slots) {
            return index;
        }
        let index = self.records.len() as u32;
        self.records.push(slots.clone());
        self.record_index.insert(slots, index);
        index
    }

    fn is_stored(&self, depth: usize) -> bool {
        match self.stack.get(depth) {
            Some(entry) => *entry == Entry::Stack,
            None => self.stored.get(depth).copied().unwrap_or(false),
        }
    }

    fn slot_of(&self, depth: usize) -> u16 {
        self.max_locals + depth as u16
    }

    /// Slot the next pushed value goes to.
    fn top(&self) -> u16 {
        self.slot_of(self.stack.len())
    }

    fn operand(&self, entry: Entry, depth: usize) -> Operand {
        match entry {
            Entry::Stack => Operand::Slot(self.slot_of(depth)),
            Entry::Local(index) => Operand::Slot(index),
            Entry::Const(value) => Operand::Const(value),
        }
    }

    fn push(&mut self, entry: Entry) {
        self.stack.push(entry);
    }

    fn push_wide(&mut self, entry: Entry) {
        self.stack.push(entry);
        self.stack.push(Entry::Stack);
    }

    fn push_result(&mut self, wide: bool) {
        if wide {
            self.push_wide(Entry::Stack);
        } else {
            self.push(Entry::Stack);
        }
    }

    fn pop(&mut self) -> Operand {
        let entry = self.stack.pop().unwrap_or(Entry::Stack);
        self.operand(entry, self.stack.len())
    }

    fn pop_wide(&mut self) -> Operand {
        self.stack.pop();
        self.pop()
    }

    fn pop_sized(&mut self, wide: bool) -> Operand {
        if wide { self.pop_wide() } else { self.pop() }
    }

    fn materialize(&mut self, depth: usize) {
        let entry = self.stack[depth];
        if entry != Entry::Stack {
            let src = self.operand(entry, depth);
            self.emit(Op::Move {
                dst: self.slot_of(depth),
                src,
            });
            self.stack[depth] = Entry::Stack;
        }
    }

    /// Stores every simulated stack value into its slot.
    fn flush(&mut self) {
        for depth in 0..self.stack.len() {
            self.materialize(depth);
        }
    }

    /// Stores stack values that still read local `index`, which is about
    /// to change.
    fn flush_local(&mut self, index: u16) {
        for depth in 0..self.stack.len() {
            if self.stack[depth] == Entry::Local(index) {
                self.materialize(depth);
            }
        }
    }

    fn u8_operand(&self) -> u8 {
        self.code.get(self.pc + 1).copied().unwrap_or(0)
    }

    fn u16_operand(&self) -> Result<u16, CompileError> {
        read_u16(self.code, self.pc + 1).ok_or(CompileError::Malformed(self.pc))
    }

    fn branch_target(&self, delta: i64) -> Result<u32, CompileError> {
        u32::try_from(self.pc as i64 + delta).map_err(|_| CompileError::Malformed(self.pc))
    }

    fn unsupported(&self) -> CompileError {
        CompileError::Unsupported {
            opcode: self.code[self.pc],
            pc: self.pc,
        }
    }

    fn load(&mut self, index: u16, wide: bool) {
        if wide {
            self.push_wide(Entry::Local(index));
        } else {
            self.push(Entry::Local(index));
        }
    }

    fn store(&mut self, index: u16, wide: bool) {
        let src = self.pop_sized(wide);
        self.flush_local(index);
        if wide {
            self.flush_local(index + 1);
        }
        self.emit(Op::Move { dst: index, src });
    }

    fn int_op(&mut self, op: IntOp) {
        let b = self.pop();
        let a = self.pop();
        let dst = self.top();
        self.emit(Op::Int { op, dst, a, b });
        self.push(Entry::Stack);
    }

    fn long_op(&mut self, op: IntOp) {
        let b = match op {
            IntOp::Shl | IntOp::Shr | IntOp::Ushr => self.pop(),
            _ => self.pop_wide(),
        };
        let a = self.pop_wide();
        let dst = self.top();
        self.emit(Op::Long { op, dst, a, b });
        self.push_wide(Entry::Stack);
    }

    fn float_op(&mut self, op: FloatOp, wide: bool) {
        let b = self.pop_sized(wide);
        let a = self.pop_sized(wide);
        let dst = self.top();
        self.emit(if wide {
            Op::Double { op, dst, a, b }
        } else {
            Op::Float { op, dst, a, b }
        });
        self.push_result(wide);
    }

    fn divide(&mut self, width: Width, op: DivOp) {
        let wide = width == Width::Long;
        let b = self.pop_sized(wide);
        let a = self.pop_sized(wide);
        self.flush();
        let dst = self.top();
        self.emit(Op::Divide { width, op, dst, a, b });
        self.push_result(wide);
    }

    fn negate(&mut self, width: Width) {
        let wide = matches!(width, Width::Long | Width::Double);
        let a = self.pop_sized(wide);
        let dst = self.top();
        self.emit(Op::Negate { width, dst, a });
        self.push_result(wide);
    }

    fn convert(&mut self, conversion: Conversion) {
        use Conversion::*;
        let wide_in = matches!(conversion, L2I | L2F | L2D | D2I | D2L | D2F);
        let wide_out = matches!(conversion, I2L | I2D | L2D | F2L | F2D | D2L);
        let a = self.pop_sized(wide_in);
        let dst = self.top();
        self.emit(Op::Convert { conversion, dst, a });
        self.push_result(wide_out);
    }

    fn compare(&mut self, compare: Compare) {
        let wide = !matches!(compare, Compare::FloatL | Compare::FloatG);
        let b = self.pop_sized(wide);
        let a = self.pop_sized(wide);
        let dst = self.top();
        self.emit(Op::Compare { compare, dst, a, b });
        self.push(Entry::Stack);
    }

    fn branch(&mut self, cond: Cond, a: Operand, b: Operand) -> Result<(), CompileError> {
        self.flush();
        let delta = read_i16(self.code, self.pc + 1).ok_or(CompileError::Malformed(self.pc))?;
        let target = self.branch_target(delta as i64)?;
        self.fixups.push(self.ops.len());
        self.emit(Op::If {
            cond,
            a,
            b,
            target,
            poll: target as usize <= self.pc,
        });
        Ok(())
    }

    fn goto(&mut self, delta: i64) -> Result<(), CompileError> {
        self.flush();
        let target = self.branch_target(delta)?;
        self.fixups.push(self.ops.len());
        self.emit(Op::Goto {
            target,
            poll: target as usize <= self.pc,
        });
        Ok(())
    }

    /// Rearranges the top `from.len() - grow` slots; the shuffles only
    /// move whole slots.
    fn permute(&mut self, consumed: usize, from: &[u8]) {
        self.flush();
        let depth = self.stack.len() - consumed;
        self.emit(Op::Permute {
            base: self.slot_of(depth),
            from: from.into(),
        });
        self.stack.truncate(depth);
        self.stack.resize(depth + from.len(), Entry::Stack);
    }

    fn ldc(&mut self, index: u16) -> Result<(), CompileError> {
        match self.class.constant(index) {
            Some(ConstantPoolInfo::Integer(v)) => self.push(Entry::Const(*v as u32 as Slot)),
            Some(ConstantPoolInfo::Float(v)) => self.push(Entry::Const(v.to_bits() as Slot)),
            Some(ConstantPoolInfo::Long(v)) => self.push_wide(Entry::Const(*v as Slot)),
            Some(ConstantPoolInfo::Double(v)) => self.push_wide(Entry::Const(v.to_bits())),
            Some(ConstantPoolInfo::String(_) | ConstantPoolInfo::Class(_)) => {
                self.flush();
                let dst = self.top();
                self.emit(Op::Ldc { dst, index });
                self.push(Entry::Stack);
            }
            _ => return Err(self.unsupported()),
        }
        Ok(())
    }

    fn field_is_wide(&self, index: u16) -> Result<bool, CompileError> {
        match self.class.constant(index) {
            Some(ConstantPoolInfo::Fieldref(field)) => Ok(field.name_and_type.descriptor.is_long()),
            _ => Err(CompileError::Malformed(self.pc)),
        }
    }

    fn array_load(&mut self, wide: bool) {
        let index = self.pop();
        let array = self.pop();
        self.flush();
        let dst = self.top();
        self.emit(Op::ArrayLoad { dst, array, index });
        self.push_result(wide);
    }

    fn array_store(&mut self, wide: bool) {
        let value = self.pop_sized(wide);
        let index = self.pop();
        let array = self.pop();
        self.flush();
        self.emit(Op::ArrayStore { array, index, value });
    }

    fn invoke(&mut self, op: u8, index: u16) -> Result<(), CompileError> {
        let method_ref = match self.class.constant(index) {
            Some(ConstantPoolInfo::Methodref(r) | ConstantPoolInfo::InterfaceMethodref(r)) => r,
            _ => return Err(CompileError::Malformed(self.pc)),
        };
        let descriptor = &method_ref.name_and_type.descriptor;
        let arg_slots = descriptor.parameter_slots() + usize::from(op != inst::INVOKESTATIC);
        let returns = descriptor.return_type.as_ref().map(FieldType::is_long);
        self.flush();
        let sp = self.stack.len() as u16;
        let call = self.call(op, index, sp);
        self.emit(call);
        let depth = self.stack.len().saturating_sub(arg_slots);
        self.stack.truncate(depth);
        if let Some(wide) = returns {
            self.push_result(wide);
        }
        Ok(())
    }

    /// Binds the call statically when the target cannot vary, or guards on
    /// the receiver class the interpreter saw at this site.
    fn call(&self, op: u8, index: u16, sp: u16) -> Op {
        let generic = Op::Invoke { op, index, sp };
        let Some(
            ConstantPoolInfo::Methodref(method_ref) | ConstantPoolInfo::InterfaceMethodref(method_ref),
        ) = self.class.constant(index)
        else {
            return generic;
        };
        let Some(method) = method_ref.resolved.get() else {
            return generic;
        };
        if method.is_static() != (op == inst::INVOKESTATIC) {
            return generic;
        }
        let direct = |method: Arc<Method>| Op::InvokeDirect { op, index, sp, method };
        match op {
            inst::INVOKESTATIC => return direct(Arc::clone(method)),
            inst::INVOKESPECIAL => return direct(resolve::select_special(&self.class, method)),
            inst::INVOKEVIRTUAL if method.is_private() || method.is_final() => {
                return direct(Arc::clone(method));
            }
            inst::INVOKEVIRTUAL => {
                if let Some(class) = method_ref.class.class.get()
                    && class.is_final()
                    && let Ok(target) = resolve::select_virtual(class, method)
                {
                    return direct(target);
                }
            }
            _ => {}
        }
        let Some(expected) = self.method.profile.single_receiver(self.pc as u32) else {
            return generic;
        };
        let target = if op == inst::INVOKEINTERFACE {
            resolve::select_interface(&expected, method)
        } else {
            resolve::select_virtual(&expected, method)
        };
        match target {
            Ok(target) => Op::InvokeGuarded {
                op,
                index,
                sp,
                expected,
                target,
            },
            Err(_) => generic,
        }
    }

    /// Translates the instruction at `self.pc`. False when control does not
    /// fall through to the next instruction.
    fn instruction(&mut self) -> Result<bool, CompileError> {
        let op = self.code[self.pc];
        match op {
            inst::NOP => {}
            inst::ACONST_NULL => self.push(Entry::Const(0)),
            inst::ICONST_M1..=inst::ICONST_5 => {
                self.push(Entry::Const((op as i32 - inst::ICONST_0 as i32) as u32 as Slot))
            }
            inst::LCONST_0 | inst::LCONST_1 => self.push_wide(Entry::Const((op - inst::LCONST_0) as Slot)),
            inst::FCONST_0..=inst::FCONST_2 => {
                self.push(Entry::Const(((op - inst::FCONST_0) as f32).to_bits() as Slot))
            }
            inst::DCONST_0 | inst::DCONST_1 => {
                self.push_wide(Entry::Const(((op - inst::DCONST_0) as f64).to_bits()))
            }
            inst::BIPUSH => self.push(Entry::Const(self.u8_operand() as i8 as i32 as u32 as Slot)),
            inst::SIPUSH => {
                let value = self.u16_operand()? as i16;
                self.push(Entry::Const(value as i32 as u32 as Slot));
            }
            inst::LDC => self.ldc(self.u8_operand() as u16)?,
            inst::LDC_W | inst::LDC2_W => self.ldc(self.u16_operand()?)?,

            inst::ILOAD | inst::FLOAD | inst::ALOAD => self.load(self.u8_operand() as u16, false),
            inst::LLOAD | inst::DLOAD => self.load(self.u8_operand() as u16, true),
            inst::ILOAD_0..=inst::ILOAD_3 => self.load((op - inst::ILOAD_0) as u16, false),
            inst::LLOAD_0..=inst::LLOAD_3 => self.load((op - inst::LLOAD_0) as u16, true),
            inst::FLOAD_0..=inst::FLOAD_3 => self.load((op - inst::FLOAD_0) as u16, false),
            inst::DLOAD_0..=inst::DLOAD_3 => self.load((op - inst::DLOAD_0) as u16, true),
            inst::ALOAD_0..=inst::ALOAD_3 => self.load((op - inst::ALOAD_0) as u16, false),
            inst::IALOAD | inst::FALOAD | inst::AALOAD | inst::BALOAD | inst::CALOAD | inst::SALOAD => {
                self.array_load(false)
            }
            inst::LALOAD | inst::DALOAD => self.array_load(true),

            inst::ISTORE | inst::FSTORE | inst::ASTORE => self.store(self.u8_operand() as u16, false),
            inst::LSTORE | inst::DSTORE => self.store(self.u8_operand() as u16, true),
            inst::ISTORE_0..=inst::ISTORE_3 => self.store((op - inst::ISTORE_0) as u16, false),
            inst::LSTORE_0..=inst::LSTORE_3 => self.store((op - inst::LSTORE_0) as u16, true),
            inst::FSTORE_0..=inst::FSTORE_3 => self.store((op - inst::FSTORE_0) as u16, false),
            inst::DSTORE_0..=inst::DSTORE_3 => self.store((op - inst::DSTORE_0) as u16, true),
            inst::ASTORE_0..=inst::ASTORE_3 => self.store((op - inst::ASTORE_0) as u16, false),
            inst::IASTORE | inst::FASTORE | inst::AASTORE | inst::BASTORE | inst::CASTORE | inst::SASTORE => {
                self.array_store(false)
            }
            inst::LASTORE | inst::DASTORE => self.array_store(true),

            inst::POP => {
                self.stack.pop();
            }
            inst::POP2 => {
                let depth = self.stack.len().saturating_sub(2);
                self.stack.truncate(depth);
            }
            inst::DUP => match self.stack.last().copied() {
                Some(Entry::Stack) => {
                    let src = Operand::Slot(self.slot_of(self.stack.len() - 1));
                    let dst = self.top();
                    self.emit(Op::Move { dst, src });
                    self.push(Entry::Stack);
                }
                Some(entry) => self.push(entry),
                None => return Err(CompileError::Malformed(self.pc)),
            },
            inst::DUP_X1 => self.permute(2, &[1, 0, 1]),
            inst::DUP_X2 => self.permute(3, &[2, 0, 1, 2]),
            inst::DUP2 => self.permute(2, &[0, 1, 0, 1]),
            inst::DUP2_X1 => self.permute(3, &[1, 2, 0, 1, 2]),
            inst::DUP2_X2 => self.permute(4, &[2, 3, 0, 1, 2, 3]),
            inst::SWAP => self.permute(2, &[1, 0]),

            inst::IADD => self.int_op(IntOp::Add),
            inst::ISUB => self.int_op(IntOp::Sub),
            inst::IMUL => self.int_op(IntOp::Mul),
            inst::IAND => self.int_op(IntOp::And),
            inst::IOR => self.int_op(IntOp::Or),
            inst::IXOR => self.int_op(IntOp::Xor),
            inst::ISHL => self.int_op(IntOp::Shl),
            inst::ISHR => self.int_op(IntOp::Shr),
            inst::IUSHR => self.int_op(IntOp::Ushr),
            inst::LADD => self.long_op(IntOp::Add),
            inst::LSUB => self.long_op(IntOp::Sub),
            inst::LMUL => self.long_op(IntOp::Mul),
            inst::LAND => self.long_op(IntOp::And),
            inst::LOR => self.long_op(IntOp::Or),
            inst::LXOR => self.long_op(IntOp::Xor),
            inst::LSHL => self.long_op(IntOp::Shl),
            inst::LSHR => self.long_op(IntOp::Shr),
            inst::LUSHR => self.long_op(IntOp::Ushr),
            inst::FADD => self.float_op(FloatOp::Add, false),
            inst::FSUB => self.float_op(FloatOp::Sub, false),
            inst::FMUL => self.float_op(FloatOp::Mul, false),
            inst::FDIV => self.float_op(FloatOp::Div, false),
            inst::FREM => self.float_op(FloatOp::Rem, false),
            inst::DADD => self.float_op(FloatOp::Add, true),
            inst::DSUB => self.float_op(FloatOp::Sub, true),
            inst::DMUL => self.float_op(FloatOp::Mul, true),
            inst::DDIV => self.float_op(FloatOp::Div, true),
            inst::DREM => self.float_op(FloatOp::Rem, true),
            inst::IDIV => self.divide(Width::Int, DivOp::Div),
            inst::IREM => self.divide(Width::Int, DivOp::Rem),
            inst::LDIV => self.divide(Width::Long, DivOp::Div),
            inst::LREM => self.divide(Width::Long, DivOp::Rem),
            inst::INEG => self.negate(Width::Int),
            inst::LNEG => self.negate(Width::Long),
            inst::FNEG => self.negate(Width::Float),
            inst::DNEG => self.negate(Width::Double),
            inst::IINC => {
                let local = self.u8_operand() as u16;
                let delta = self.code.get(self.pc + 2).copied().unwrap_or(0) as i8 as i32;
                self.flush_local(local);
                self.emit(Op::Increment { local, delta });
            }

            inst::I2L => self.convert(Conversion::I2L),
            inst::I2F => self.convert(Conversion::I2F),
            inst::I2D => self.convert(Conversion::I2D),
            inst::L2I => self.convert(Conversion::L2I),
            inst::L2F => self.convert(Conversion::L2F),
            inst::L2D => self.convert(Conversion::L2D),
            inst::F2I => self.convert(Conversion::F2I),
            inst::F2L => self.convert(Conversion::F2L),
            inst::F2D => self.convert(Conversion::F2D),
            inst::D2I => self.convert(Conversion::D2I),
            inst::D2L => self.convert(Conversion::D2L),
            inst::D2F => self.convert(Conversion::D2F),
            inst::I2B => self.convert(Conversion::I2B),
            inst::I2C => self.convert(Conversion::I2C),
            inst::I2S => self.convert(Conversion::I2S),
            inst::LCMP => self.compare(Compare::Long),
            inst::FCMPL => self.compare(Compare::FloatL),
            inst::FCMPG => self.compare(Compare::FloatG),
            inst::DCMPL => self.compare(Compare::DoubleL),
            inst::DCMPG => self.compare(Compare::DoubleG),

            inst::IFEQ..=inst::IFLE => {
                let a = self.pop();
                self.branch(int_cond(op - inst::IFEQ), a, Operand::Const(0))?;
            }
            inst::IF_ICMPEQ..=inst::IF_ICMPLE => {
                let b = self.pop();
                let a = self.pop();
                self.branch(int_cond(op - inst::IF_ICMPEQ), a, b)?;
            }
            inst::IF_ACMPEQ | inst::IF_ACMPNE => {
                let b = self.pop();
                let a = self.pop();
                let cond = if op == inst::IF_ACMPEQ { Cond::RefEq } else { Cond::RefNe };
                self.branch(cond, a, b)?;
            }
            inst::IFNULL | inst::IFNONNULL => {
                let a = self.pop();
                let cond = if op == inst::IFNULL { Cond::RefEq } else { Cond::RefNe };
                self.branch(cond, a, Operand::Const(0))?;
            }
            inst::GOTO => {
                let delta = read_i16(self.code, self.pc + 1).ok_or(CompileError::Malformed(self.pc))?;
                self.goto(delta as i64)?;
                return Ok(false);
            }
            inst::GOTO_W => {
                let delta = read_i32(self.code, self.pc + 1).ok_or(CompileError::Malformed(self.pc))?;
                self.goto(delta as i64)?;
                return Ok(false);
            }
            inst::TABLESWITCH | inst::LOOKUPSWITCH => {
                let key = self.pop();
                self.flush();
                self.emit(Op::Switch {
                    pc: self.pc as u32,
                    key,
                });
                return Ok(false);
            }

            inst::IRETURN | inst::FRETURN | inst::ARETURN => {
                let value = self.pop();
                self.emit(Op::Return { value: Some(value) });
                return Ok(false);
            }
            inst::LRETURN | inst::DRETURN => {
                let value = self.pop_wide();
                self.emit(Op::Return { value: Some(value) });
                return Ok(false);
            }
            inst::RETURN => {
                self.emit(Op::Return { value: None });
                return Ok(false);
            }
            inst::ATHROW => {
                let object = self.pop();
                self.flush();
                self.emit(Op::Throw { object });
                return Ok(false);
            }

            inst::GETSTATIC => {
                let index = self.u16_operand()?;
                let wide = self.field_is_wide(index)?;
                self.flush();
                let dst = self.top();
                self.emit(Op::GetStatic { dst, index });
                self.push_result(wide);
            }
            inst::PUTSTATIC => {
                let index = self.u16_operand()?;
                let wide = self.field_is_wide(index)?;
                self.flush();
                let value = self.pop_sized(wide);
                self.emit(Op::PutStatic { index, value });
            }
            inst::GETFIELD => {
                let index = self.u16_operand()?;
                let wide = self.field_is_wide(index)?;
                let object = self.pop();
                self.flush();
                let dst = self.top();
                self.emit(Op::GetField { dst, index, object });
                self.push_result(wide);
            }
            inst::PUTFIELD => {
                let index = self.u16_operand()?;
                let wide = self.field_is_wide(index)?;
                let value = self.pop_sized(wide);
                let object = self.pop();
                self.flush();
                self.emit(Op::PutField { index, object, value });
            }
            inst::INVOKEVIRTUAL | inst::INVOKESPECIAL | inst::INVOKESTATIC | inst::INVOKEINTERFACE => {
                self.invoke(op, self.u16_operand()?)?;
            }
            inst::NEW => {
                let index = self.u16_operand()?;
                self.flush();
                let dst = self.top();
                self.emit(Op::New { dst, index });
                self.push(Entry::Stack);
            }
            inst::NEWARRAY => {
                let length = self.pop();
                self.flush();
                let dst = self.top();
                let atype = self.u8_operand();
                self.emit(Op::NewArray { dst, atype, length });
                self.push(Entry::Stack);
            }
            inst::ANEWARRAY => {
                let index = self.u16_operand()?;
                let length = self.pop();
                self.flush();
                let dst = self.top();
                self.emit(Op::NewReferenceArray { dst, index, length });
                self.push(Entry::Stack);
            }
            inst::MULTIANEWARRAY => {
                let index = self.u16_operand()?;
                let dimensions = self.code.get(self.pc + 3).copied().unwrap_or(0) as usize;
                let mut lengths: Vec<Operand> = (0..dimensions).map(|_| self.pop()).collect();
                lengths.reverse();
                self.flush();
                let dst = self.top();
                self.emit(Op::NewMultiArray {
                    dst,
                    index,
                    lengths: lengths.into(),
                });
                self.push(Entry::Stack);
            }
            inst::ARRAYLENGTH => {
                let array = self.pop();
                self.flush();
                let dst = self.top();
                self.emit(Op::ArrayLength { dst, array });
                self.push(Entry::Stack);
            }
            inst::CHECKCAST => {
                let index = self.u16_operand()?;
                self.flush();
                let object = Operand::Slot(self.slot_of(self.stack.len().saturating_sub(1)));
                self.emit(Op::CheckCast { index, object });
            }
            inst::INSTANCEOF => {
                let index = self.u16_operand()?;
                let object = self.pop();
                self.flush();
                let dst = self.top();
                self.emit(Op::InstanceOf { dst, index, object });
                self.push(Entry::Stack);
            }
            inst::MONITORENTER | inst::MONITOREXIT => {
                let object = self.pop();
                self.flush();
                self.emit(if op == inst::MONITORENTER {
                    Op::MonitorEnter { object }
                } else {
                    Op::MonitorExit { object }
                });
            }
            inst::WIDE => return self.wide(),
            _ => return Err(self.unsupported()),
        }
        Ok(true)
    }

    fn wide(&mut self) -> Result<bool, CompileError> {
        let op = self.code.get(self.pc + 1).copied().unwrap_or(0);
        let index = read_u16(self.code, self.pc + 2).ok_or(CompileError::Malformed(self.pc))?;
        match op {
            inst::ILOAD | inst::FLOAD | inst::ALOAD => self.load(index, false),
            inst::LLOAD | inst::DLOAD => self.load(index, true),
            inst::ISTORE | inst::FSTORE | inst::ASTORE => self.store(index, false),
            inst::LSTORE | inst::DSTORE => self.store(index, true),
            inst::IINC => {
                let delta = read_i16(self.code, self.pc + 4).ok_or(CompileError::Malformed(self.pc))?;
                self.flush_local(index);
                self.emit(Op::Increment {
                    local: index,
                    delta: delta as i32,
                });
            }
            _ => return Err(self.unsupported()),
        }
        Ok(true)
    }
}

/// Condition of `ifeq`..`ifle` and `if_icmpeq`..`if_icmple` by offset.
fn int_cond(offset: u8) -> Cond {
    match offset {
        0 => Cond::Eq,
        1 => Cond::Ne,
        2 => Cond::Lt,
        3 => Cond::Ge,
        4 => Cond::Gt,
        _ => Cond::Le,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::{
        class::{ClassBuilder, class_file},
        consts::MethodAccessFlag,
        error::{LoadingError, VmResult},
        runtime::{
            class_loader::define_class,
            verifier::{ClassHierarchy, OBJECT, verify_class},
        },
    };

    struct Classes(HashMap<String, Arc<Class>>);

    impl ClassHierarchy for Classes {
        fn load(&self, name: &str) -> VmResult<Arc<Class>> {
            self.0
                .get(name)
                .cloned()
                .ok_or_else(|| LoadingError::NotFound(name.to_string()).into())
        }
    }

    fn verified(builder: &ClassBuilder) -> Arc<Class> {
        let mut object = ClassBuilder::new(OBJECT);
        object.no_super_class();
        let object = define_class(&class_file(OBJECT, &object.build()).unwrap(), None, Vec::new()).unwrap();
        let file = class_file("T", &builder.build()).unwrap();
        let class = define_class(&file, Some(Arc::clone(&object)), Vec::new()).unwrap();
        let classes = Classes(HashMap::from([
            (OBJECT.to_string(), object),
            ("T".to_string(), Arc::clone(&class)),
        ]));
        verify_class(&class, &classes).unwrap();
        class
    }

    fn compiled(builder: &ClassBuilder, name: &str, descriptor: &str) -> Result<CompiledCode, CompileError> {
        let class = verified(builder);
        let method = Arc::clone(class.declared_method(name, descriptor).unwrap());
        compile(&method, 8000)
    }

    #[test]
    fn test_pure_arithmetic_folds_into_one_op() {
        let mut builder = ClassBuilder::new("T");
        builder.method(MethodAccessFlag::STATIC, "add", "(II)I", |code| {
            code.iload(0).iload(1).op(inst::IADD).ireturn();
        });
        let code = compiled(&builder, "add", "(II)I").unwrap();
        assert_eq!(code.len(), 2);
        assert!(matches!(
            code.ops[0],
            Op::Int {
                op: IntOp::Add,
                dst: 2,
                a: Operand::Slot(0),
                b: Operand::Slot(1)
            }
        ));
        assert!(matches!(code.ops[1], Op::Return { value: Some(Operand::Slot(2)) }));
    }

    #[test]
    fn test_loop_targets_are_patched_to_ops() {
        let mut builder = ClassBuilder::new("T");
        builder.method(MethodAccessFlag::STATIC, "sum", "(I)I", |code| {
            let top = code.new_label();
            let done = code.new_label();
            code.iconst(0).istore(1);
            code.bind(top).iload(0).branch(inst::IFLE, done);
            code.iload(1).iload(0).op(inst::IADD).istore(1);
            code.iinc(0, -1).goto(top);
            code.bind(done).iload(1).ireturn();
        });
        let code = compiled(&builder, "sum", "(I)I").unwrap();
        // loop head `iload_0` at pc 2, exit `iload_1` at pc 16
        let (head, exit) = (code.op_at(2), code.op_at(16));
        let mut saw_back_edge = false;
        for op in code.ops.iter() {
            match op {
                Op::Goto { target, poll } => {
                    assert_eq!(*target as usize, head);
                    assert!(*poll);
                    saw_back_edge = true;
                }
                Op::If { target, poll, .. } => {
                    assert_eq!(*target as usize, exit);
                    assert!(!*poll);
                }
                _ => {}
            }
        }
        assert!(saw_back_edge);
    }

    #[test]
    fn test_store_materializes_pending_loads() {
        let mut builder = ClassBuilder::new("T");
        builder.method(MethodAccessFlag::STATIC, "old", "(I)I", |code| {
            code.iload(0).iconst(7).istore(0).ireturn();
        });
        let code = compiled(&builder, "old", "(I)I").unwrap();
        // the loaded value is saved before local 0 changes
        assert!(matches!(
            code.ops[0],
            Op::Move {
                dst: 1,
                src: Operand::Slot(0)
            }
        ));
        assert!(matches!(code.ops.last(), Some(Op::Return { value: Some(Operand::Slot(1)) })));
    }

    #[test]
    fn test_calls_see_arguments_in_slots() {
        let mut builder = ClassBuilder::new("T");
        builder
            .method(MethodAccessFlag::STATIC, "id", "(I)I", |code| {
                code.iload(0).ireturn();
            })
            .method(MethodAccessFlag::STATIC, "twice", "(I)I", |code| {
                code.iload(0).invokestatic("T", "id", "(I)I").ireturn();
            });
        let code = compiled(&builder, "twice", "(I)I").unwrap();
        assert!(matches!(code.ops[0], Op::Move { dst: 1, src: Operand::Slot(0) }));
        // unresolved until the interpreter has run the call once
        assert!(matches!(code.ops[1], Op::Invoke { sp: 1, .. }));
        assert!(matches!(code.ops[2], Op::Return { value: Some(Operand::Slot(1)) }));
    }

    #[test]
    fn test_reference_records_follow_stored_values() {
        let mut builder = ClassBuilder::new("T");
        builder.method(MethodAccessFlag::STATIC, "keep", "(Ljava/lang/Object;)Ljava/lang/Object;", |code| {
            code.aload(0).new_object(OBJECT).op(inst::POP).areturn();
        });
        let code = compiled(&builder, "keep", "(Ljava/lang/Object;)Ljava/lang/Object;").unwrap();
        let new = code.ops.iter().position(|op| matches!(op, Op::New { .. })).unwrap();
        assert_eq!(code.ref_slots(new), &[0, 1]);
    }

    #[test]
    fn test_rejects_oversized_methods() {
        let mut builder = ClassBuilder::new("T");
        builder.method(MethodAccessFlag::STATIC, "f", "()V", |code| {
            for _ in 0..10 {
                code.op(inst::NOP);
            }
            code.vreturn();
        });
        let class = verified(&builder);
        let method = Arc::clone(class.declared_method("f", "()V").unwrap());
        assert_eq!(
            compile(&method, 4).unwrap_err(),
            CompileError::TooLarge { size: 11, limit: 4 }
        );
    }
}
