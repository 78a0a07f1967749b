//! Type-state dataflow verification of method bodies.
//!
//! Every instruction start reachable from the entry point or an exception
//! handler gets an entry state; states are merged at control-flow joins
//! until nothing changes. The resulting per-pc states double as the
//! reference maps the collector and the compiler use.

mod types;

use std::sync::Arc;

use log::debug;

pub use types::VerificationType;
pub(crate) use types::{ClassHierarchy, OBJECT};
use types::{is_assignable, merge};

use crate::{
    consts::array_type,
    error::{LinkageError, VmError, VmResult},
    runtime::{
        Class, ConstantPoolInfo, Method, MethodRef,
        instructions::{self as inst, instruction_length, read_i16, read_i32, read_u16, switch_operands},
    },
};

use VerificationType as VT;

/// Verified entry state of every reachable instruction.
#[derive(Debug)]
pub struct StackMaps {
    frames: Vec<Option<FrameState>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FrameState {
    pub(crate) locals: Box<[VerificationType]>,
    pub(crate) stack: Box<[VerificationType]>,
}

impl StackMaps {
    pub(crate) fn at(&self, pc: usize) -> Option<&FrameState> {
        self.frames.get(pc).and_then(Option::as_ref)
    }

    pub(crate) fn is_reachable(&self, pc: usize) -> bool {
        self.at(pc).is_some()
    }
}

impl FrameState {
    pub(crate) fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Frame slot indices holding references: locals first, then the
    /// operand stack starting at `max_locals`.
    pub(crate) fn ref_slots(&self, max_locals: usize) -> impl Iterator<Item = usize> + '_ {
        let locals = self
            .locals
            .iter()
            .enumerate()
            .filter(|(_, t)| t.is_reference())
            .map(|(i, _)| i);
        let stack = self
            .stack
            .iter()
            .enumerate()
            .filter(|(_, t)| t.is_reference())
            .map(move |(i, _)| max_locals + i);
        locals.chain(stack)
    }
}

/// Verifies every method with a body and attaches its stack maps.
pub(crate) fn verify_class(class: &Arc<Class>, hierarchy: &dyn ClassHierarchy) -> VmResult<()> {
    for method in &class.methods {
        if method.code.is_none() {
            continue;
        }
        let maps = MethodVerifier::new(hierarchy, class, method)?.run()?;
        let _ = method.stack_maps.set(Arc::new(maps));
    }
    debug!("verified {}", class.name);
    Ok(())
}

enum Failure {
    Verify(String),
    Vm(VmError),
}

impl From<VmError> for Failure {
    fn from(err: VmError) -> Self {
        Failure::Vm(err)
    }
}

type Step<T> = Result<T, Failure>;

fn fail<T>(message: impl Into<String>) -> Step<T> {
    Err(Failure::Verify(message.into()))
}

#[derive(Debug, Clone, PartialEq)]
struct State {
    locals: Vec<VT>,
    stack: Vec<VT>,
    /// Set in a constructor until the superclass constructor is invoked.
    this_uninit: bool,
}

struct MethodVerifier<'a> {
    hierarchy: &'a dyn ClassHierarchy,
    class: &'a Class,
    method: &'a Method,
    code: &'a [u8],
    max_stack: usize,
    starts: Vec<bool>,
    states: Vec<Option<State>>,
    worklist: Vec<usize>,
    queued: Vec<bool>,
}

impl<'a> MethodVerifier<'a> {
    fn new(
        hierarchy: &'a dyn ClassHierarchy,
        class: &'a Class,
        method: &'a Method,
    ) -> VmResult<Self> {
        let Some(code) = method.code() else {
            return Err(VmError::Internal(format!("{method} has no code")));
        };
        let code_bytes: &[u8] = &code.code;
        let mut verifier = Self {
            hierarchy,
            class,
            method,
            code: code_bytes,
            max_stack: code.max_stack as usize,
            starts: vec![false; code_bytes.len()],
            states: vec![None; code_bytes.len()],
            worklist: Vec::new(),
            queued: vec![false; code_bytes.len()],
        };

        if code_bytes.len() > u16::MAX as usize {
            return Err(verifier.error(0, "code too long"));
        }
        let mut pc = 0;
        while pc < code_bytes.len() {
            verifier.starts[pc] = true;
            match instruction_length(code_bytes, pc) {
                Some(len) => pc += len,
                None => {
                    return Err(verifier.error(
                        pc,
                        format!("illegal or truncated instruction {:#04x}", code_bytes[pc]),
                    ));
                }
            }
        }
        Ok(verifier)
    }

    fn error(&self, pc: usize, message: impl Into<String>) -> VmError {
        LinkageError::Verify {
            class: self.class.name.to_string(),
            method: self.method.name.to_string(),
            descriptor: self.method.raw_descriptor.to_string(),
            pc: pc as u32,
            message: message.into(),
        }
        .into()
    }

    fn lift(&self, pc: usize, failure: Failure) -> VmError {
        match failure {
            Failure::Verify(message) => self.error(pc, message),
            Failure::Vm(err) => err,
        }
    }

    fn initial_state(&self) -> VmResult<State> {
        let max_locals = self.method.code().map_or(0, |c| c.max_locals as usize);
        let mut locals = Vec::with_capacity(max_locals);
        let mut this_uninit = false;
        if !self.method.is_static() {
            if self.method.is_constructor() && &*self.class.name != OBJECT {
                locals.push(VT::UninitializedThis);
                this_uninit = true;
            } else {
                locals.push(VT::Reference(Arc::clone(&self.class.name)));
            }
        }
        for parameter in &self.method.descriptor.parameters {
            let t = VT::from_field_type(parameter);
            let wide = t.is_category2();
            locals.push(t);
            if wide {
                locals.push(VT::Top);
            }
        }
        if locals.len() > max_locals {
            return Err(self.error(0, "arguments exceed max_locals"));
        }
        locals.resize(max_locals, VT::Top);
        Ok(State {
            locals,
            stack: Vec::new(),
            this_uninit,
        })
    }

    fn check_handlers(&self) -> VmResult<()> {
        let Some(code) = self.method.code() else {
            return Ok(());
        };
        for handler in &code.exception_table {
            let start = handler.start_pc as usize;
            let end = handler.end_pc as usize;
            let target = handler.handler_pc as usize;
            let valid = start < end
                && end <= self.code.len()
                && self.starts.get(start) == Some(&true)
                && (end == self.code.len() || self.starts[end])
                && self.starts.get(target) == Some(&true);
            if !valid {
                return Err(self.error(target, "bad exception handler range"));
            }
        }
        Ok(())
    }

    fn run(mut self) -> VmResult<StackMaps> {
        self.check_handlers()?;
        let initial = self.initial_state()?;
        self.states[0] = Some(initial);
        self.worklist.push(0);
        self.queued[0] = true;

        while let Some(pc) = self.worklist.pop() {
            self.queued[pc] = false;
            let Some(before) = self.states[pc].clone() else {
                continue;
            };
            let mut after = before.clone();
            let successors = self
                .execute(pc, &mut after)
                .map_err(|f| self.lift(pc, f))?;
            self.propagate_to_handlers(pc, &before, &after)
                .map_err(|f| self.lift(pc, f))?;
            for target in successors {
                self.merge_into(target, &after)
                    .map_err(|f| self.lift(pc, f))?;
            }
        }

        let frames = self
            .states
            .into_iter()
            .map(|state| {
                state.map(|s| FrameState {
                    locals: s.locals.into_boxed_slice(),
                    stack: s.stack.into_boxed_slice(),
                })
            })
            .collect();
        Ok(StackMaps { frames })
    }

    fn propagate_to_handlers(&mut self, pc: usize, before: &State, after: &State) -> Step<()> {
        let method = self.method;
        let Some(code) = method.code() else {
            return Ok(());
        };
        let mut targets = Vec::new();
        for handler in code.exception_table.iter().filter(|h| h.covers(pc)) {
            let catch_type = match &handler.catch_type {
                Some(class) => VT::Reference(Arc::clone(&class.name)),
                None => VT::reference("java/lang/Throwable"),
            };
            let mut locals = Vec::with_capacity(before.locals.len());
            for (a, b) in before.locals.iter().zip(&after.locals) {
                locals.push(merge(self.hierarchy, a, b)?);
            }
            targets.push((
                handler.handler_pc as usize,
                State {
                    locals,
                    stack: vec![catch_type],
                    this_uninit: before.this_uninit || after.this_uninit,
                },
            ));
        }
        for (target, state) in targets {
            self.merge_into(target, &state)?;
        }
        Ok(())
    }

    fn merge_into(&mut self, target: usize, incoming: &State) -> Step<()> {
        if self.starts.get(target) != Some(&true) {
            return fail(format!("branch target {target} is not an instruction"));
        }
        let changed = match &self.states[target] {
            None => {
                self.states[target] = Some(incoming.clone());
                true
            }
            Some(existing) => {
                if existing.stack.len() != incoming.stack.len() {
                    return fail(format!("inconsistent stack height at {target}"));
                }
                let mut merged = existing.clone();
                for (slot, t) in merged.locals.iter_mut().zip(&incoming.locals) {
                    *slot = merge(self.hierarchy, slot, t)?;
                }
                for (slot, t) in merged.stack.iter_mut().zip(&incoming.stack) {
                    let m = merge(self.hierarchy, slot, t)?;
                    if m == VT::Top && *slot != VT::Top {
                        return fail(format!(
                            "incompatible stack types {slot} and {t} at {target}"
                        ));
                    }
                    *slot = m;
                }
                merged.this_uninit |= incoming.this_uninit;
                let changed = &merged != existing;
                self.states[target] = Some(merged);
                changed
            }
        };
        if changed && !self.queued[target] {
            self.queued[target] = true;
            self.worklist.push(target);
        }
        Ok(())
    }

    fn u8_at(&self, at: usize) -> u8 {
        self.code.get(at).copied().unwrap_or(0)
    }

    fn u16_at(&self, at: usize) -> u16 {
        read_u16(self.code, at).unwrap_or(0)
    }

    fn branch_target(&self, pc: usize, offset: i64) -> Step<usize> {
        let target = pc as i64 + offset;
        if target < 0 || target as usize >= self.code.len() {
            return fail(format!("branch target {target} out of range"));
        }
        Ok(target as usize)
    }

    fn constant(&self, index: u16) -> Step<&'a ConstantPoolInfo> {
        match self.class.constant(index) {
            Some(c) => Ok(c),
            None => fail(format!("bad constant pool index {index}")),
        }
    }

    fn class_constant(&self, index: u16) -> Step<Arc<str>> {
        match self.constant(index)? {
            ConstantPoolInfo::Class(info) => Ok(Arc::clone(&info.name)),
            other => fail(format!("expected class constant, found {other:?}")),
        }
    }

    /// Runs one instruction on `state` and returns its successors.
    fn execute(&self, pc: usize, state: &mut State) -> Step<Vec<usize>> {
        let code = self.code;
        let op = code[pc];
        let len = instruction_length(code, pc).unwrap_or(1);
        let next = pc + len;
        let h = self.hierarchy;
        let mut f = FrameOps {
            state,
            hierarchy: h,
            max_stack: self.max_stack,
        };

        macro_rules! binary {
            ($t:expr) => {{
                f.pop_expect(&$t)?;
                f.pop_expect(&$t)?;
                f.push($t)?;
            }};
        }
        macro_rules! convert {
            ($from:expr, $to:expr) => {{
                f.pop_expect(&$from)?;
                f.push($to)?;
            }};
        }

        match op {
            inst::NOP => {}
            inst::ACONST_NULL => f.push(VT::Null)?,
            inst::ICONST_M1..=inst::ICONST_5 | inst::BIPUSH | inst::SIPUSH => f.push(VT::Int)?,
            inst::LCONST_0 | inst::LCONST_1 => f.push(VT::Long)?,
            inst::FCONST_0..=inst::FCONST_2 => f.push(VT::Float)?,
            inst::DCONST_0 | inst::DCONST_1 => f.push(VT::Double)?,
            inst::LDC | inst::LDC_W => {
                let index = if op == inst::LDC {
                    self.u8_at(pc + 1) as u16
                } else {
                    self.u16_at(pc + 1)
                };
                let t = match self.constant(index)? {
                    ConstantPoolInfo::Integer(_) => VT::Int,
                    ConstantPoolInfo::Float(_) => VT::Float,
                    ConstantPoolInfo::String(_) => VT::reference("java/lang/String"),
                    ConstantPoolInfo::Class(_) => VT::reference("java/lang/Class"),
                    other => return fail(format!("ldc of unsupported constant {other:?}")),
                };
                f.push(t)?;
            }
            inst::LDC2_W => {
                let t = match self.constant(self.u16_at(pc + 1))? {
                    ConstantPoolInfo::Long(_) => VT::Long,
                    ConstantPoolInfo::Double(_) => VT::Double,
                    other => return fail(format!("ldc2_w of unsupported constant {other:?}")),
                };
                f.push(t)?;
            }

            inst::ILOAD => f.load(self.u8_at(pc + 1) as usize, &VT::Int)?,
            inst::LLOAD => f.load(self.u8_at(pc + 1) as usize, &VT::Long)?,
            inst::FLOAD => f.load(self.u8_at(pc + 1) as usize, &VT::Float)?,
            inst::DLOAD => f.load(self.u8_at(pc + 1) as usize, &VT::Double)?,
            inst::ALOAD => f.load_reference(self.u8_at(pc + 1) as usize)?,
            inst::ILOAD_0..=inst::ILOAD_3 => f.load((op - inst::ILOAD_0) as usize, &VT::Int)?,
            inst::LLOAD_0..=inst::LLOAD_3 => f.load((op - inst::LLOAD_0) as usize, &VT::Long)?,
            inst::FLOAD_0..=inst::FLOAD_3 => f.load((op - inst::FLOAD_0) as usize, &VT::Float)?,
            inst::DLOAD_0..=inst::DLOAD_3 => f.load((op - inst::DLOAD_0) as usize, &VT::Double)?,
            inst::ALOAD_0..=inst::ALOAD_3 => f.load_reference((op - inst::ALOAD_0) as usize)?,

            inst::IALOAD => f.array_load(&["[I"], VT::Int)?,
            inst::LALOAD => f.array_load(&["[J"], VT::Long)?,
            inst::FALOAD => f.array_load(&["[F"], VT::Float)?,
            inst::DALOAD => f.array_load(&["[D"], VT::Double)?,
            inst::BALOAD => f.array_load(&["[B", "[Z"], VT::Int)?,
            inst::CALOAD => f.array_load(&["[C"], VT::Int)?,
            inst::SALOAD => f.array_load(&["[S"], VT::Int)?,
            inst::AALOAD => {
                f.pop_expect(&VT::Int)?;
                let array = f.pop_reference()?;
                let component = match &array {
                    VT::Null => VT::Null,
                    t => match t.component() {
                        Some(c) if c.is_reference() => c,
                        _ => return fail(format!("aaload on {t}")),
                    },
                };
                f.push(component)?;
            }

            inst::ISTORE => f.store(self.u8_at(pc + 1) as usize, VT::Int)?,
            inst::LSTORE => f.store(self.u8_at(pc + 1) as usize, VT::Long)?,
            inst::FSTORE => f.store(self.u8_at(pc + 1) as usize, VT::Float)?,
            inst::DSTORE => f.store(self.u8_at(pc + 1) as usize, VT::Double)?,
            inst::ASTORE => f.store_reference(self.u8_at(pc + 1) as usize)?,
            inst::ISTORE_0..=inst::ISTORE_3 => f.store((op - inst::ISTORE_0) as usize, VT::Int)?,
            inst::LSTORE_0..=inst::LSTORE_3 => f.store((op - inst::LSTORE_0) as usize, VT::Long)?,
            inst::FSTORE_0..=inst::FSTORE_3 => {
                f.store((op - inst::FSTORE_0) as usize, VT::Float)?
            }
            inst::DSTORE_0..=inst::DSTORE_3 => {
                f.store((op - inst::DSTORE_0) as usize, VT::Double)?
            }
            inst::ASTORE_0..=inst::ASTORE_3 => f.store_reference((op - inst::ASTORE_0) as usize)?,

            inst::IASTORE => f.array_store(&["[I"], VT::Int)?,
            inst::LASTORE => f.array_store(&["[J"], VT::Long)?,
            inst::FASTORE => f.array_store(&["[F"], VT::Float)?,
            inst::DASTORE => f.array_store(&["[D"], VT::Double)?,
            inst::BASTORE => f.array_store(&["[B", "[Z"], VT::Int)?,
            inst::CASTORE => f.array_store(&["[C"], VT::Int)?,
            inst::SASTORE => f.array_store(&["[S"], VT::Int)?,
            inst::AASTORE => {
                f.pop_reference()?;
                f.pop_expect(&VT::Int)?;
                let array = f.pop_reference()?;
                if array != VT::Null && !array.component().is_some_and(|c| c.is_reference()) {
                    return fail(format!("aastore on {array}"));
                }
            }

            inst::POP => f.pop_words(1)?,
            inst::POP2 => f.pop_words(2)?,
            inst::DUP => f.dup(1, 0)?,
            inst::DUP_X1 => f.dup(1, 1)?,
            inst::DUP_X2 => f.dup(1, 2)?,
            inst::DUP2 => f.dup(2, 0)?,
            inst::DUP2_X1 => f.dup(2, 1)?,
            inst::DUP2_X2 => f.dup(2, 2)?,
            inst::SWAP => f.swap()?,

            inst::IADD | inst::ISUB | inst::IMUL | inst::IDIV | inst::IREM | inst::IAND
            | inst::IOR | inst::IXOR | inst::ISHL | inst::ISHR | inst::IUSHR => binary!(VT::Int),
            inst::LADD | inst::LSUB | inst::LMUL | inst::LDIV | inst::LREM | inst::LAND
            | inst::LOR | inst::LXOR => binary!(VT::Long),
            inst::FADD | inst::FSUB | inst::FMUL | inst::FDIV | inst::FREM => binary!(VT::Float),
            inst::DADD | inst::DSUB | inst::DMUL | inst::DDIV | inst::DREM => binary!(VT::Double),
            inst::LSHL | inst::LSHR | inst::LUSHR => {
                f.pop_expect(&VT::Int)?;
                f.pop_expect(&VT::Long)?;
                f.push(VT::Long)?;
            }
            inst::INEG => convert!(VT::Int, VT::Int),
            inst::LNEG => convert!(VT::Long, VT::Long),
            inst::FNEG => convert!(VT::Float, VT::Float),
            inst::DNEG => convert!(VT::Double, VT::Double),
            inst::IINC => {
                f.load(self.u8_at(pc + 1) as usize, &VT::Int)?;
                f.pop_expect(&VT::Int)?;
            }

            inst::I2L => convert!(VT::Int, VT::Long),
            inst::I2F => convert!(VT::Int, VT::Float),
            inst::I2D => convert!(VT::Int, VT::Double),
            inst::L2I => convert!(VT::Long, VT::Int),
            inst::L2F => convert!(VT::Long, VT::Float),
            inst::L2D => convert!(VT::Long, VT::Double),
            inst::F2I => convert!(VT::Float, VT::Int),
            inst::F2L => convert!(VT::Float, VT::Long),
            inst::F2D => convert!(VT::Float, VT::Double),
            inst::D2I => convert!(VT::Double, VT::Int),
            inst::D2L => convert!(VT::Double, VT::Long),
            inst::D2F => convert!(VT::Double, VT::Float),
            inst::I2B | inst::I2C | inst::I2S => convert!(VT::Int, VT::Int),

            inst::LCMP => {
                f.pop_expect(&VT::Long)?;
                f.pop_expect(&VT::Long)?;
                f.push(VT::Int)?;
            }
            inst::FCMPL | inst::FCMPG => {
                f.pop_expect(&VT::Float)?;
                f.pop_expect(&VT::Float)?;
                f.push(VT::Int)?;
            }
            inst::DCMPL | inst::DCMPG => {
                f.pop_expect(&VT::Double)?;
                f.pop_expect(&VT::Double)?;
                f.push(VT::Int)?;
            }

            inst::IFEQ..=inst::IFLE => {
                f.pop_expect(&VT::Int)?;
                let target = self.branch_target(pc, self.branch16(pc))?;
                return Ok(vec![target, self.fallthrough(next)?]);
            }
            inst::IF_ICMPEQ..=inst::IF_ICMPLE => {
                f.pop_expect(&VT::Int)?;
                f.pop_expect(&VT::Int)?;
                let target = self.branch_target(pc, self.branch16(pc))?;
                return Ok(vec![target, self.fallthrough(next)?]);
            }
            inst::IF_ACMPEQ | inst::IF_ACMPNE => {
                f.pop_reference()?;
                f.pop_reference()?;
                let target = self.branch_target(pc, self.branch16(pc))?;
                return Ok(vec![target, self.fallthrough(next)?]);
            }
            inst::IFNULL | inst::IFNONNULL => {
                f.pop_reference()?;
                let target = self.branch_target(pc, self.branch16(pc))?;
                return Ok(vec![target, self.fallthrough(next)?]);
            }
            inst::GOTO => return Ok(vec![self.branch_target(pc, self.branch16(pc))?]),
            inst::GOTO_W => {
                let offset = read_i32(code, pc + 1).unwrap_or(0) as i64;
                return Ok(vec![self.branch_target(pc, offset)?]);
            }
            inst::JSR | inst::JSR_W | inst::RET => {
                return fail("subroutines (jsr/ret) are not supported");
            }
            inst::TABLESWITCH => {
                f.pop_expect(&VT::Int)?;
                let base = switch_operands(pc);
                let default = read_i32(code, base).unwrap_or(0) as i64;
                let low = read_i32(code, base + 4).unwrap_or(0) as i64;
                let high = read_i32(code, base + 8).unwrap_or(0) as i64;
                let mut targets = vec![self.branch_target(pc, default)?];
                for i in 0..(high - low + 1) as usize {
                    let offset = read_i32(code, base + 12 + i * 4).unwrap_or(0) as i64;
                    targets.push(self.branch_target(pc, offset)?);
                }
                return Ok(targets);
            }
            inst::LOOKUPSWITCH => {
                f.pop_expect(&VT::Int)?;
                let base = switch_operands(pc);
                let default = read_i32(code, base).unwrap_or(0) as i64;
                let pairs = read_i32(code, base + 4).unwrap_or(0) as usize;
                let mut targets = vec![self.branch_target(pc, default)?];
                let mut previous = None;
                for i in 0..pairs {
                    let key = read_i32(code, base + 8 + i * 8).unwrap_or(0);
                    if previous.is_some_and(|p| p >= key) {
                        return fail("lookupswitch keys are not sorted");
                    }
                    previous = Some(key);
                    let offset = read_i32(code, base + 12 + i * 8).unwrap_or(0) as i64;
                    targets.push(self.branch_target(pc, offset)?);
                }
                return Ok(targets);
            }

            inst::IRETURN..=inst::ARETURN => {
                let expected = match &self.method.descriptor.return_type {
                    Some(t) => VT::from_field_type(t),
                    None => return fail("value return from void method"),
                };
                let matches_op = match op {
                    inst::IRETURN => expected == VT::Int,
                    inst::LRETURN => expected == VT::Long,
                    inst::FRETURN => expected == VT::Float,
                    inst::DRETURN => expected == VT::Double,
                    _ => expected.is_reference(),
                };
                if !matches_op {
                    return fail(format!("wrong return instruction for {expected}"));
                }
                f.pop_expect(&expected)?;
                return Ok(Vec::new());
            }
            inst::RETURN => {
                if self.method.descriptor.return_type.is_some() {
                    return fail("void return from non-void method");
                }
                if f.state.this_uninit {
                    return fail("constructor returns before calling super constructor");
                }
                return Ok(Vec::new());
            }

            inst::GETSTATIC | inst::PUTSTATIC | inst::GETFIELD | inst::PUTFIELD => {
                self.field_access(op, self.u16_at(pc + 1), &mut f)?;
            }
            inst::INVOKEVIRTUAL | inst::INVOKESPECIAL | inst::INVOKESTATIC
            | inst::INVOKEINTERFACE => {
                self.invoke(pc, op, &mut f)?;
            }
            inst::INVOKEDYNAMIC => return fail("invokedynamic is not supported"),

            inst::NEW => {
                let name = self.class_constant(self.u16_at(pc + 1))?;
                if name.starts_with('[') {
                    return fail(format!("new of array type {name}"));
                }
                let fresh = VT::Uninitialized(pc as u32);
                if f.state.stack.contains(&fresh) {
                    return fail("uninitialized object from a previous iteration on the stack");
                }
                for local in f.state.locals.iter_mut().filter(|l| **l == fresh) {
                    *local = VT::Top;
                }
                f.push(fresh)?;
            }
            inst::NEWARRAY => {
                let name = match self.u8_at(pc + 1) {
                    array_type::T_BOOLEAN => "[Z",
                    array_type::T_CHAR => "[C",
                    array_type::T_FLOAT => "[F",
                    array_type::T_DOUBLE => "[D",
                    array_type::T_BYTE => "[B",
                    array_type::T_SHORT => "[S",
                    array_type::T_INT => "[I",
                    array_type::T_LONG => "[J",
                    atype => return fail(format!("bad newarray type {atype}")),
                };
                f.pop_expect(&VT::Int)?;
                f.push(VT::reference(name))?;
            }
            inst::ANEWARRAY => {
                let component = self.class_constant(self.u16_at(pc + 1))?;
                f.pop_expect(&VT::Int)?;
                let name = if component.starts_with('[') {
                    format!("[{component}")
                } else {
                    format!("[L{component};")
                };
                f.push(VT::reference(&name))?;
            }
            inst::MULTIANEWARRAY => {
                let name = self.class_constant(self.u16_at(pc + 1))?;
                let dimensions = self.u8_at(pc + 3) as usize;
                let rank = name.bytes().take_while(|b| *b == b'[').count();
                if dimensions == 0 || dimensions > rank {
                    return fail(format!("multianewarray of {dimensions} dimensions on {name}"));
                }
                for _ in 0..dimensions {
                    f.pop_expect(&VT::Int)?;
                }
                f.push(VT::Reference(name))?;
            }
            inst::ARRAYLENGTH => {
                let array = f.pop_reference()?;
                if array != VT::Null && array.component().is_none() {
                    return fail(format!("arraylength on {array}"));
                }
                f.push(VT::Int)?;
            }
            inst::ATHROW => {
                f.pop_expect(&VT::reference("java/lang/Throwable"))?;
                return Ok(Vec::new());
            }
            inst::CHECKCAST => {
                let name = self.class_constant(self.u16_at(pc + 1))?;
                f.pop_initialized_reference()?;
                f.push(VT::Reference(name))?;
            }
            inst::INSTANCEOF => {
                self.class_constant(self.u16_at(pc + 1))?;
                f.pop_initialized_reference()?;
                f.push(VT::Int)?;
            }
            inst::MONITORENTER | inst::MONITOREXIT => {
                f.pop_initialized_reference()?;
            }

            inst::WIDE => {
                let op = self.u8_at(pc + 1);
                let index = self.u16_at(pc + 2) as usize;
                match op {
                    inst::ILOAD => f.load(index, &VT::Int)?,
                    inst::LLOAD => f.load(index, &VT::Long)?,
                    inst::FLOAD => f.load(index, &VT::Float)?,
                    inst::DLOAD => f.load(index, &VT::Double)?,
                    inst::ALOAD => f.load_reference(index)?,
                    inst::ISTORE => f.store(index, VT::Int)?,
                    inst::LSTORE => f.store(index, VT::Long)?,
                    inst::FSTORE => f.store(index, VT::Float)?,
                    inst::DSTORE => f.store(index, VT::Double)?,
                    inst::ASTORE => f.store_reference(index)?,
                    inst::IINC => {
                        f.load(index, &VT::Int)?;
                        f.pop_expect(&VT::Int)?;
                    }
                    _ => return fail("subroutines (jsr/ret) are not supported"),
                }
            }

            _ => return fail(format!("illegal opcode {op:#04x}")),
        }
        Ok(vec![self.fallthrough(next)?])
    }

    fn branch16(&self, pc: usize) -> i64 {
        read_i16(self.code, pc + 1).unwrap_or(0) as i64
    }

    fn fallthrough(&self, next: usize) -> Step<usize> {
        if next >= self.code.len() {
            return fail("execution falls off the end of the code");
        }
        Ok(next)
    }

    fn field_access(&self, op: u8, index: u16, f: &mut FrameOps<'_>) -> Step<()> {
        let ConstantPoolInfo::Fieldref(field) = self.constant(index)? else {
            return fail(format!("constant {index} is not a field reference"));
        };
        let ty = VT::from_field_type(&field.name_and_type.descriptor);
        let owner = VT::Reference(Arc::clone(&field.class.name));
        match op {
            inst::GETSTATIC => f.push(ty)?,
            inst::PUTSTATIC => {
                f.pop_expect(&ty)?;
            }
            inst::GETFIELD => {
                let receiver = f.pop_initialized_reference()?;
                f.check_assignable(&receiver, &owner)?;
                f.push(ty)?;
            }
            _ => {
                f.pop_expect(&ty)?;
                let receiver = f.pop_reference()?;
                if receiver == VT::UninitializedThis {
                    // constructors may set their own fields before super()
                    if field.class.name != self.class.name {
                        return fail("putfield on uninitialized this of another class");
                    }
                } else {
                    if receiver.is_uninitialized() {
                        return fail("putfield on uninitialized object");
                    }
                    f.check_assignable(&receiver, &owner)?;
                }
            }
        }
        Ok(())
    }

    fn method_ref(&self, op: u8, index: u16) -> Step<&'a MethodRef> {
        match (op, self.constant(index)?) {
            (inst::INVOKEINTERFACE, ConstantPoolInfo::InterfaceMethodref(m)) => Ok(m),
            (inst::INVOKEVIRTUAL, ConstantPoolInfo::Methodref(m)) => Ok(m),
            (
                inst::INVOKESPECIAL | inst::INVOKESTATIC,
                ConstantPoolInfo::Methodref(m) | ConstantPoolInfo::InterfaceMethodref(m),
            ) => Ok(m),
            (_, other) => fail(format!("bad method reference {other:?}")),
        }
    }

    fn is_superclass_or_self(&self, name: &str) -> bool {
        let mut current = Some(self.class);
        while let Some(class) = current {
            if &*class.name == name {
                return true;
            }
            current = class.super_class.as_deref();
        }
        false
    }

    fn invoke(&self, pc: usize, op: u8, f: &mut FrameOps<'_>) -> Step<()> {
        let method = self.method_ref(op, self.u16_at(pc + 1))?;
        let name = &*method.name_and_type.name;
        let descriptor = &method.name_and_type.descriptor;
        let is_init = name == "<init>";
        if name.starts_with('<') && !(is_init && op == inst::INVOKESPECIAL) {
            return fail(format!("illegal call to {name}"));
        }
        if is_init && descriptor.return_type.is_some() {
            return fail("constructor must return void");
        }
        if op == inst::INVOKEINTERFACE {
            let count = self.u8_at(pc + 3) as usize;
            if count != descriptor.parameter_slots() + 1 || self.u8_at(pc + 4) != 0 {
                return fail("bad invokeinterface count");
            }
        }

        for parameter in descriptor.parameters.iter().rev() {
            f.pop_expect(&VT::from_field_type(parameter))?;
        }

        let owner = &method.class.name;
        if op != inst::INVOKESTATIC {
            if is_init {
                let receiver = f.pop_reference()?;
                let initialized = match &receiver {
                    VT::Uninitialized(new_pc) => {
                        let new_pc = *new_pc as usize;
                        let created = read_u16(self.code, new_pc + 1)
                            .filter(|_| self.code.get(new_pc) == Some(&inst::NEW))
                            .map(|index| self.class_constant(index))
                            .transpose()?;
                        if created.as_deref() != Some(&**owner) {
                            return fail(format!(
                                "constructor of {owner} invoked on a new {}",
                                created.as_deref().unwrap_or("?")
                            ));
                        }
                        VT::Reference(Arc::clone(owner))
                    }
                    VT::UninitializedThis => {
                        let super_name = self.class.super_class.as_ref().map(|s| &s.name);
                        if *owner != self.class.name && super_name != Some(owner) {
                            return fail(format!(
                                "constructor of {owner} invoked on uninitialized this"
                            ));
                        }
                        f.state.this_uninit = false;
                        VT::Reference(Arc::clone(&self.class.name))
                    }
                    other => return fail(format!("constructor invoked on initialized {other}")),
                };
                for slot in f.state.locals.iter_mut().chain(f.state.stack.iter_mut()) {
                    if *slot == receiver {
                        *slot = initialized.clone();
                    }
                }
            } else {
                let receiver = f.pop_initialized_reference()?;
                match op {
                    inst::INVOKESPECIAL => {
                        let direct_interface =
                            self.class.interfaces.iter().any(|i| i.name == *owner);
                        if !self.is_superclass_or_self(owner) && !direct_interface {
                            return fail(format!(
                                "invokespecial of {owner}.{name} outside the superclass chain"
                            ));
                        }
                        f.check_assignable(&receiver, &VT::Reference(Arc::clone(&self.class.name)))?;
                    }
                    inst::INVOKEVIRTUAL => {
                        f.check_assignable(&receiver, &VT::Reference(Arc::clone(owner)))?;
                    }
                    _ => {}
                }
            }
        }

        if let Some(return_type) = &descriptor.return_type {
            f.push(VT::from_field_type(return_type))?;
        }
        Ok(())
    }
}

/// Stack and local operations on one state.
struct FrameOps<'s> {
    state: &'s mut State,
    hierarchy: &'s dyn ClassHierarchy,
    max_stack: usize,
}

impl FrameOps<'_> {
    fn push(&mut self, t: VT) -> Step<()> {
        let wide = t.is_category2();
        let needed = if wide { 2 } else { 1 };
        if self.state.stack.len() + needed > self.max_stack {
            return fail("operand stack overflow");
        }
        self.state.stack.push(t);
        if wide {
            self.state.stack.push(VT::Top);
        }
        Ok(())
    }

    fn pop(&mut self) -> Step<VT> {
        match self.state.stack.pop() {
            Some(t) => Ok(t),
            None => fail("operand stack underflow"),
        }
    }

    fn check_assignable(&self, from: &VT, to: &VT) -> Step<()> {
        if from.is_uninitialized() || !is_assignable(self.hierarchy, from, to)? {
            return fail(format!("expected {to}, found {from}"));
        }
        Ok(())
    }

    fn pop_expect(&mut self, expected: &VT) -> Step<VT> {
        if expected.is_category2() {
            if self.pop()? != VT::Top {
                return fail(format!("expected {expected} on the stack"));
            }
            let value = self.pop()?;
            if value != *expected {
                return fail(format!("expected {expected}, found {value}"));
            }
            return Ok(value);
        }
        let value = self.pop()?;
        if expected.is_reference() {
            self.check_assignable(&value, expected)?;
        } else if value != *expected {
            return fail(format!("expected {expected}, found {value}"));
        }
        Ok(value)
    }

    fn pop_reference(&mut self) -> Step<VT> {
        let value = self.pop()?;
        if !value.is_reference() {
            return fail(format!("expected a reference, found {value}"));
        }
        Ok(value)
    }

    fn pop_initialized_reference(&mut self) -> Step<VT> {
        let value = self.pop_reference()?;
        if value.is_uninitialized() {
            return fail(format!("use of {value}"));
        }
        Ok(value)
    }

    fn local(&self, index: usize) -> Step<&VT> {
        match self.state.locals.get(index) {
            Some(t) => Ok(t),
            None => fail(format!("local {index} out of range")),
        }
    }

    fn load(&mut self, index: usize, expected: &VT) -> Step<()> {
        let t = self.local(index)?;
        if t != expected {
            return fail(format!("local {index} holds {t}, expected {expected}"));
        }
        if expected.is_category2() && self.local(index + 1)? != &VT::Top {
            return fail(format!("local {} is not the second half of {expected}", index + 1));
        }
        self.push(expected.clone())
    }

    fn load_reference(&mut self, index: usize) -> Step<()> {
        let t = self.local(index)?.clone();
        if !t.is_reference() {
            return fail(format!("local {index} holds {t}, expected a reference"));
        }
        self.push(t)
    }

    fn store(&mut self, index: usize, t: VT) -> Step<()> {
        let value = self.pop_expect(&t)?;
        self.set_local(index, value)
    }

    fn store_reference(&mut self, index: usize) -> Step<()> {
        let value = self.pop_reference()?;
        self.set_local(index, value)
    }

    fn set_local(&mut self, index: usize, t: VT) -> Step<()> {
        let wide = t.is_category2();
        let last = if wide { index + 1 } else { index };
        if last >= self.state.locals.len() {
            return fail(format!("local {last} out of range"));
        }
        // storing into the second half of a wide value destroys it
        if index > 0 && self.state.locals[index - 1].is_category2() {
            self.state.locals[index - 1] = VT::Top;
        }
        self.state.locals[index] = t;
        if wide {
            self.state.locals[index + 1] = VT::Top;
        }
        Ok(())
    }

    fn array_load(&mut self, arrays: &[&str], element: VT) -> Step<()> {
        self.pop_expect(&VT::Int)?;
        let array = self.pop_reference()?;
        self.check_array(&array, arrays)?;
        self.push(element)
    }

    fn array_store(&mut self, arrays: &[&str], element: VT) -> Step<()> {
        self.pop_expect(&element)?;
        self.pop_expect(&VT::Int)?;
        let array = self.pop_reference()?;
        self.check_array(&array, arrays)
    }

    fn check_array(&self, array: &VT, accepted: &[&str]) -> Step<()> {
        match array {
            VT::Null => Ok(()),
            VT::Reference(name) if accepted.contains(&&**name) => Ok(()),
            other => fail(format!("expected {} array, found {other}", accepted[0])),
        }
    }

    /// `true` when the slot at `index` is the second half of a wide value.
    fn splits_wide(&self, index: usize) -> bool {
        index > 0
            && index < self.state.stack.len()
            && self.state.stack[index] == VT::Top
            && self.state.stack[index - 1].is_category2()
    }

    fn pop_words(&mut self, words: usize) -> Step<()> {
        let len = self.state.stack.len();
        if len < words {
            return fail("operand stack underflow");
        }
        if self.splits_wide(len - words) {
            return fail("pop splits a wide value");
        }
        self.state.stack.truncate(len - words);
        Ok(())
    }

    /// Copies the top `words` slots and inserts the copy `depth` slots
    /// below them (`dup`, `dup_x1`, ..., `dup2_x2`).
    fn dup(&mut self, words: usize, depth: usize) -> Step<()> {
        let len = self.state.stack.len();
        if len < words + depth {
            return fail("operand stack underflow");
        }
        if self.splits_wide(len - words) || self.splits_wide(len - words - depth) {
            return fail("dup splits a wide value");
        }
        if len + words > self.max_stack {
            return fail("operand stack overflow");
        }
        let copied: Vec<VT> = self.state.stack[len - words..].to_vec();
        let at = len - words - depth;
        self.state.stack.splice(at..at, copied);
        Ok(())
    }

    fn swap(&mut self) -> Step<()> {
        let len = self.state.stack.len();
        if len < 2 {
            return fail("operand stack underflow");
        }
        let top = &self.state.stack[len - 1];
        let below = &self.state.stack[len - 2];
        if top.is_category2() || *top == VT::Top || below.is_category2() || *below == VT::Top {
            return fail("swap of a wide value");
        }
        self.state.stack.swap(len - 1, len - 2);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::{
        class::{ClassBuilder, class_file},
        consts::MethodAccessFlag,
        error::LoadingError,
        runtime::class_loader::define_class,
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

    fn object() -> Arc<Class> {
        let mut builder = ClassBuilder::new(OBJECT);
        builder
            .no_super_class()
            .method(MethodAccessFlag::PUBLIC, "<init>", "()V", |code| {
                code.vreturn();
            });
        let file = class_file(OBJECT, &builder.build()).unwrap();
        define_class(&file, None, Vec::new()).unwrap()
    }

    fn verify(builder: &ClassBuilder) -> VmResult<Arc<Class>> {
        let object = object();
        let file = class_file("T", &builder.build()).unwrap();
        let class = define_class(&file, Some(Arc::clone(&object)), Vec::new())?;
        let classes = Classes(HashMap::from([
            (OBJECT.to_string(), object),
            ("T".to_string(), Arc::clone(&class)),
        ]));
        verify_class(&class, &classes)?;
        Ok(class)
    }

    fn verify_error(builder: &ClassBuilder) -> String {
        match verify(builder) {
            Err(VmError::Linkage(LinkageError::Verify { message, .. })) => message,
            other => panic!("expected a verify error, got {other:?}"),
        }
    }

    fn maps(class: &Class, name: &str, descriptor: &str) -> Arc<StackMaps> {
        let method = class.declared_method(name, descriptor).unwrap();
        Arc::clone(method.stack_maps.get().unwrap())
    }

    #[test]
    fn test_straight_line() {
        let mut builder = ClassBuilder::new("T");
        builder.method(MethodAccessFlag::STATIC, "add", "(II)I", |code| {
            code.iload(0).iload(1).op(inst::IADD).ireturn();
        });
        let class = verify(&builder).unwrap();
        let maps = maps(&class, "add", "(II)I");
        let frame = maps.at(2).unwrap();
        assert_eq!(&*frame.stack, &[VT::Int, VT::Int]);
        assert_eq!(&*frame.locals, &[VT::Int, VT::Int]);
        assert!(maps.at(1).is_some());
    }

    #[test]
    fn test_reference_slots() {
        let mut builder = ClassBuilder::new("T");
        builder.method(MethodAccessFlag::PUBLIC, "self", "()Ljava/lang/Object;", |code| {
            code.aload(0).areturn();
        });
        let class = verify(&builder).unwrap();
        let maps = maps(&class, "self", "()Ljava/lang/Object;");
        let frame = maps.at(1).unwrap();
        assert_eq!(frame.ref_slots(1).collect::<Vec<_>>(), vec![0, 1]);
    }

    #[test]
    fn test_loop_merges() {
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
        verify(&builder).unwrap();
    }

    #[test]
    fn test_stack_underflow() {
        let mut builder = ClassBuilder::new("T");
        builder.method(MethodAccessFlag::STATIC, "f", "()V", |code| {
            code.op(inst::IADD).vreturn();
        });
        assert!(verify_error(&builder).contains("underflow"));
    }

    #[test]
    fn test_bad_return_type() {
        let mut builder = ClassBuilder::new("T");
        builder.method(MethodAccessFlag::STATIC, "f", "()I", |code| {
            code.fconst(0.0).ireturn();
        });
        assert_eq!(verify_error(&builder), "expected int, found float");
    }

    #[test]
    fn test_falls_off_end() {
        let mut builder = ClassBuilder::new("T");
        builder.method(MethodAccessFlag::STATIC, "f", "()V", |code| {
            code.iconst(0).pop();
        });
        assert!(verify_error(&builder).contains("falls off"));
    }

    #[test]
    fn test_inconsistent_stack_height() {
        let mut builder = ClassBuilder::new("T");
        builder.method(MethodAccessFlag::STATIC, "f", "(I)V", |code| {
            let join = code.new_label();
            code.iload(0).branch(inst::IFEQ, join);
            code.iconst(1);
            code.bind(join).vreturn();
        });
        assert!(verify_error(&builder).contains("inconsistent stack height"));
    }

    #[test]
    fn test_constructor_must_call_super() {
        let mut builder = ClassBuilder::new("T");
        builder.method(MethodAccessFlag::PUBLIC, "<init>", "()V", |code| {
            code.vreturn();
        });
        assert!(verify_error(&builder).contains("super constructor"));

        let mut builder = ClassBuilder::new("T");
        builder.method(MethodAccessFlag::PUBLIC, "<init>", "()V", |code| {
            code.super_init(OBJECT).vreturn();
        });
        verify(&builder).unwrap();
    }

    #[test]
    fn test_new_and_initialize() {
        let mut builder = ClassBuilder::new("T");
        builder.method(MethodAccessFlag::STATIC, "make", "()Ljava/lang/Object;", |code| {
            code.new_object("T")
                .dup()
                .invokespecial("T", "<init>", "()V")
                .areturn();
        });
        let class = verify(&builder).unwrap();
        let maps = maps(&class, "make", "()Ljava/lang/Object;");
        // areturn follows new (3), dup (1) and invokespecial (3)
        assert_eq!(&*maps.at(7).unwrap().stack, &[VT::reference("T")]);
        assert_eq!(&*maps.at(4).unwrap().stack, &[VT::Uninitialized(0), VT::Uninitialized(0)]);
    }

    #[test]
    fn test_use_before_initialization() {
        let mut builder = ClassBuilder::new("T");
        builder.method(MethodAccessFlag::STATIC, "f", "()I", |code| {
            code.new_object("T")
                .invokevirtual(OBJECT, "hashCode", "()I")
                .ireturn();
        });
        assert!(verify_error(&builder).contains("uninitialized(0)"));
    }

    #[test]
    fn test_wrong_constructor_target() {
        let mut builder = ClassBuilder::new("T");
        builder.method(MethodAccessFlag::STATIC, "f", "()V", |code| {
            code.new_object("T")
                .invokespecial(OBJECT, "<init>", "()V")
                .vreturn();
        });
        assert!(verify_error(&builder).contains("invoked on a new T"));
    }

    #[test]
    fn test_handler_state() {
        let mut builder = ClassBuilder::new("T");
        builder.method(MethodAccessFlag::STATIC, "f", "()V", |code| {
            let start = code.new_label();
            let end = code.new_label();
            let handler = code.new_label();
            code.try_catch(start, end, handler, None);
            code.bind(start).iconst(1).pop();
            code.bind(end).vreturn();
            code.bind(handler).astore(0).vreturn();
        });
        let class = verify(&builder).unwrap();
        let maps = maps(&class, "f", "()V");
        assert_eq!(
            &*maps.at(3).unwrap().stack,
            &[VT::reference("java/lang/Throwable")]
        );
    }

    #[test]
    fn test_rejects_subroutines() {
        let mut builder = ClassBuilder::new("T");
        builder.method(MethodAccessFlag::STATIC, "f", "()V", |code| {
            code.raw(&[inst::JSR, 0, 3]).vreturn();
        });
        assert!(verify_error(&builder).contains("jsr"));
    }

    #[test]
    fn test_dup_splits_long() {
        let mut builder = ClassBuilder::new("T");
        builder.method(MethodAccessFlag::STATIC, "f", "()V", |code| {
            code.lconst(0).dup().vreturn();
        });
        assert!(verify_error(&builder).contains("splits"));
    }
}
