use std::sync::Arc;

use crate::runtime::{Class, Method, Slot};

/// Where an op reads a value from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Operand {
    /// Frame slot: a local, or operand stack depth `d` at `max_locals + d`.
    Slot(u16),
    Const(Slot),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IntOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Ushr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FloatOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Width {
    Int,
    Long,
    Float,
    Double,
}

/// Integer division or remainder, which may throw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DivOp {
    Div,
    Rem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Conversion {
    I2L,
    I2F,
    I2D,
    L2I,
    L2F,
    L2D,
    F2I,
    F2L,
    F2D,
    D2I,
    D2L,
    D2F,
    I2B,
    I2C,
    I2S,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Compare {
    Long,
    FloatL,
    FloatG,
    DoubleL,
    DoubleG,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Cond {
    Eq,
    Ne,
    Lt,
    Ge,
    Gt,
    Le,
    RefEq,
    RefNe,
}

/// One register-code operation. Ops that call into the runtime run with
/// every live stack value stored in its frame slot.
#[derive(Debug, Clone)]
pub(crate) enum Op {
    Move {
        dst: u16,
        src: Operand,
    },
    Int {
        op: IntOp,
        dst: u16,
        a: Operand,
        b: Operand,
    },
    Long {
        op: IntOp,
        dst: u16,
        a: Operand,
        b: Operand,
    },
    Float {
        op: FloatOp,
        dst: u16,
        a: Operand,
        b: Operand,
    },
    Double {
        op: FloatOp,
        dst: u16,
        a: Operand,
        b: Operand,
    },
    Divide {
        width: Width,
        op: DivOp,
        dst: u16,
        a: Operand,
        b: Operand,
    },
    Negate {
        width: Width,
        dst: u16,
        a: Operand,
    },
    Convert {
        conversion: Conversion,
        dst: u16,
        a: Operand,
    },
    Compare {
        compare: Compare,
        dst: u16,
        a: Operand,
        b: Operand,
    },
    Increment {
        local: u16,
        delta: i32,
    },
    /// `slots[base + i] = old slots[base + from[i]]`, the stack shuffles.
    Permute {
        base: u16,
        from: Box<[u8]>,
    },
    /// Jumps to op `target` when the condition holds. Backward targets poll.
    If {
        cond: Cond,
        a: Operand,
        b: Operand,
        target: u32,
        poll: bool,
    },
    Goto {
        target: u32,
        poll: bool,
    },
    /// The switch instruction at bytecode `pc`.
    Switch {
        pc: u32,
        key: Operand,
    },
    Return {
        value: Option<Operand>,
    },
    Throw {
        object: Operand,
    },
    Ldc {
        dst: u16,
        index: u16,
    },
    ArrayLoad {
        dst: u16,
        array: Operand,
        index: Operand,
    },
    ArrayStore {
        array: Operand,
        index: Operand,
        value: Operand,
    },
    ArrayLength {
        dst: u16,
        array: Operand,
    },
    NewArray {
        dst: u16,
        atype: u8,
        length: Operand,
    },
    NewReferenceArray {
        dst: u16,
        index: u16,
        length: Operand,
    },
    NewMultiArray {
        dst: u16,
        index: u16,
        lengths: Box<[Operand]>,
    },
    New {
        dst: u16,
        index: u16,
    },
    GetStatic {
        dst: u16,
        index: u16,
    },
    PutStatic {
        index: u16,
        value: Operand,
    },
    GetField {
        dst: u16,
        index: u16,
        object: Operand,
    },
    PutField {
        index: u16,
        object: Operand,
        value: Operand,
    },
    CheckCast {
        index: u16,
        object: Operand,
    },
    InstanceOf {
        dst: u16,
        index: u16,
        object: Operand,
    },
    MonitorEnter {
        object: Operand,
    },
    MonitorExit {
        object: Operand,
    },
    /// Full resolution and dispatch of the `invoke*` instruction `op`.
    Invoke {
        op: u8,
        index: u16,
        sp: u16,
    },
    /// A call whose target does not depend on the receiver class.
    InvokeDirect {
        op: u8,
        index: u16,
        sp: u16,
        method: Arc<Method>,
    },
    /// A call to `target` when the receiver is exactly `expected`, full
    /// dispatch otherwise.
    InvokeGuarded {
        op: u8,
        index: u16,
        sp: u16,
        expected: Arc<Class>,
        target: Arc<Method>,
    },
}

/// Compiled form of one method plus the metadata that ties it back to the
/// bytecode.
#[derive(Debug)]
pub struct CompiledCode {
    pub(crate) ops: Box<[Op]>,
    /// Bytecode pc each op came from.
    pc_map: Box<[u32]>,
    /// First op of the instruction at each pc; `u32::MAX` inside
    /// instructions and for unreachable code.
    bc_to_op: Box<[u32]>,
    /// Index into `records` for each op.
    record_of: Box<[u32]>,
    /// Distinct sets of frame slots holding references.
    records: Box<[Box<[u16]>]>,
}

impl CompiledCode {
    pub(crate) fn new(
        ops: Vec<Op>,
        pc_map: Vec<u32>,
        bc_to_op: Vec<u32>,
        record_of: Vec<u32>,
        records: Vec<Box<[u16]>>,
    ) -> Self {
        debug_assert_eq!(ops.len(), pc_map.len());
        debug_assert_eq!(ops.len(), record_of.len());
        Self {
            ops: ops.into(),
            pc_map: pc_map.into(),
            bc_to_op: bc_to_op.into(),
            record_of: record_of.into(),
            records: records.into(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.ops.len()
    }

    /// Bytecode pc of op `ip`.
    pub(crate) fn pc_at(&self, ip: usize) -> u32 {
        self.pc_map.get(ip).copied().unwrap_or(0)
    }

    /// First op of the instruction at `pc`.
    pub(crate) fn op_at(&self, pc: usize) -> usize {
        self.bc_to_op.get(pc).map_or(usize::MAX, |&op| op as usize)
    }

    /// Frame slots holding references while the frame is stopped at op `ip`.
    pub(crate) fn ref_slots(&self, ip: usize) -> &[u16] {
        self.record_of
            .get(ip)
            .and_then(|&record| self.records.get(record as usize))
            .map_or(&[][..], |slots| &slots[..])
    }
}
