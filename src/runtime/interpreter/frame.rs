use std::sync::Arc;

use paste::paste;

use crate::runtime::{
    Class, Method, Reference, Slot, TraceEntry, Value,
    interpreter::instructions,
    jit::CompiledCode,
};

/// Activation of one method. Locals come first in `slots`, then the
/// operand stack, so stack depth `d` lives at `max_locals + d` in both
/// tiers.
pub(crate) struct Frame {
    pub(crate) method: Arc<Method>,
    pub(crate) class: Arc<Class>,
    pub(crate) code: Arc<[u8]>,
    pub(crate) slots: Box<[Slot]>,
    pub(crate) max_locals: usize,
    /// Next instruction when interpreted. Compiled frames keep it current
    /// at calls and handler entries so they can fall back to interpreting.
    pub(crate) pc: usize,
    /// Operand stack depth.
    pub(crate) sp: usize,
    pub(crate) compiled: Option<Arc<CompiledCode>>,
    /// Current op in `compiled`.
    pub(crate) ip: usize,
    /// Monitor taken on entry by a synchronized method.
    pub(crate) monitor: Option<Reference>,
}

macro_rules! typed_stack_ops {
    ($($name:ident: $ty:ty, $to_slot:expr, $from_slot:expr;)*) => {
        paste! {
            $(
                #[inline]
                pub(crate) fn [<push_ $name>](&mut self, value: $ty) {
                    self.push($to_slot(value));
                }

                #[inline]
                pub(crate) fn [<pop_ $name>](&mut self) -> $ty {
                    $from_slot(self.pop())
                }
            )*
        }
    };
}

impl Frame {
    /// A frame for `method`, which must have a body.
    pub(crate) fn new(method: Arc<Method>, class: Arc<Class>, compiled: Option<Arc<CompiledCode>>) -> Option<Frame> {
        let code = method.code()?;
        let frame = Frame {
            code: Arc::clone(&code.code),
            slots: vec![0; code.frame_slots()].into_boxed_slice(),
            max_locals: code.max_locals as usize,
            pc: 0,
            sp: 0,
            compiled,
            ip: 0,
            monitor: None,
            method,
            class,
        };
        Some(frame)
    }

    #[inline]
    pub(crate) fn push(&mut self, value: Slot) {
        self.slots[self.max_locals + self.sp] = value;
        self.sp += 1;
    }

    #[inline]
    pub(crate) fn pop(&mut self) -> Slot {
        self.sp -= 1;
        self.slots[self.max_locals + self.sp]
    }

    /// Stack entry `depth` slots below the top; 0 is the top.
    #[inline]
    pub(crate) fn peek(&self, depth: usize) -> Slot {
        self.slots[self.max_locals + self.sp - 1 - depth]
    }

    #[inline]
    pub(crate) fn push_wide(&mut self, value: Slot) {
        self.push(value);
        self.push(0);
    }

    #[inline]
    pub(crate) fn pop_wide(&mut self) -> Slot {
        self.sp -= 2;
        self.slots[self.max_locals + self.sp]
    }

    typed_stack_ops! {
        int: i32, |v: i32| v as u32 as Slot, |s: Slot| s as u32 as i32;
        float: f32, |v: f32| v.to_bits() as Slot, |s: Slot| f32::from_bits(s as u32);
        reference: Reference, |v: Reference| v as Slot, |s: Slot| s as Reference;
    }

    #[inline]
    pub(crate) fn push_long(&mut self, value: i64) {
        self.push_wide(value as Slot);
    }

    #[inline]
    pub(crate) fn pop_long(&mut self) -> i64 {
        self.pop_wide() as i64
    }

    #[inline]
    pub(crate) fn push_double(&mut self, value: f64) {
        self.push_wide(value.to_bits());
    }

    #[inline]
    pub(crate) fn pop_double(&mut self) -> f64 {
        f64::from_bits(self.pop_wide())
    }

    pub(crate) fn push_value(&mut self, value: Value) {
        if value.is_wide() {
            self.push_wide(value.to_slot());
        } else {
            self.push(value.to_slot());
        }
    }

    /// Removes `count` argument slots from the top of the stack.
    pub(crate) fn pop_args(&mut self, count: usize) -> &[Slot] {
        self.sp -= count;
        let start = self.max_locals + self.sp;
        &self.slots[start..start + count]
    }

    /// Bytecode position of the current instruction.
    pub(crate) fn current_pc(&self) -> u32 {
        match &self.compiled {
            Some(code) => code.pc_at(self.ip),
            None => self.pc as u32,
        }
    }

    /// Moves past the call instruction the frame is stopped at.
    pub(crate) fn resume_after_call(&mut self) {
        let length = match self.code.get(self.pc) {
            Some(&instructions::INVOKEINTERFACE) => 5,
            _ => 3,
        };
        self.pc += length;
        if self.compiled.is_some() {
            self.ip += 1;
        }
    }

    pub(crate) fn resume_at_handler(&mut self, handler_pc: usize, exception: Reference) {
        self.sp = 0;
        self.push_reference(exception);
        self.pc = handler_pc;
        if let Some(code) = &self.compiled {
            self.ip = code.op_at(handler_pc);
        }
    }

    /// References the frame holds at its current position, per the
    /// verifier's map for interpreted frames and the safepoint records for
    /// compiled ones.
    pub(crate) fn collect_roots(&self, roots: &mut Vec<Reference>) {
        let slots: Box<dyn Iterator<Item = usize>> = match &self.compiled {
            Some(code) => Box::new(code.ref_slots(self.ip).iter().map(|&s| s as usize)),
            None => match self.method.stack_maps.get().and_then(|m| m.at(self.pc)) {
                Some(state) => Box::new(state.ref_slots(self.max_locals).collect::<Vec<_>>().into_iter()),
                None => return,
            },
        };
        roots.extend(
            slots
                .filter_map(|slot| self.slots.get(slot))
                .map(|&value| value as Reference)
                .filter(|&r| r != 0),
        );
    }

    pub(crate) fn trace_entry(&self) -> TraceEntry {
        TraceEntry {
            method: Arc::clone(&self.method),
            pc: self.current_pc(),
        }
    }
}

/// A thread's frames plus the local references held by natives and by
/// multi-step allocations in progress.
#[derive(Default)]
pub(crate) struct CallStack {
    pub(crate) frames: Vec<Frame>,
    pub(crate) locals: Vec<Reference>,
}

impl CallStack {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Every reference the thread holds. `current` is a frame taken off the
    /// stack while it runs.
    pub(crate) fn roots(&self, current: Option<&Frame>) -> Vec<Reference> {
        let mut roots = self.locals.clone();
        for frame in self.frames.iter().chain(current) {
            frame.collect_roots(&mut roots);
        }
        roots
    }

    /// Innermost frame first.
    pub(crate) fn trace(&self, current: Option<&Frame>) -> Vec<TraceEntry> {
        current
            .into_iter()
            .chain(self.frames.iter().rev())
            .map(Frame::trace_entry)
            .collect()
    }

    /// Keeps `reference` alive until the locals are truncated again.
    pub(crate) fn hold(&mut self, reference: Reference) -> Reference {
        if reference != 0 {
            self.locals.push(reference);
        }
        reference
    }
}
