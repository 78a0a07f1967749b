use std::sync::Arc;

use super::CpClassInfo;

#[derive(Debug)]
pub struct CodeAttribute {
    pub(crate) max_stack: u16,
    pub(crate) max_locals: u16,
    pub(crate) code: Arc<[u8]>,
    pub(crate) exception_table: Vec<ExceptionTableItem>,
    pub(crate) line_numbers: Vec<LineNumberTableItem>,
}

impl CodeAttribute {
    pub(crate) fn line_number(&self, pc: usize) -> Option<u16> {
        self.line_numbers
            .iter()
            .filter(|item| item.start_pc as usize <= pc)
            .max_by_key(|item| item.start_pc)
            .map(|item| item.line_number)
    }

    /// Size of a frame's slot array: locals followed by the operand stack.
    pub(crate) fn frame_slots(&self) -> usize {
        self.max_locals as usize + self.max_stack as usize
    }
}

#[derive(Debug)]
pub struct LineNumberTableItem {
    pub(crate) start_pc: u16,
    pub(crate) line_number: u16,
}

#[derive(Debug)]
pub struct ExceptionTableItem {
    pub(crate) start_pc: u16,
    pub(crate) end_pc: u16,
    pub(crate) handler_pc: u16,
    pub(crate) catch_type: Option<CpClassInfo>,
}

impl ExceptionTableItem {
    pub(crate) fn covers(&self, pc: usize) -> bool {
        self.start_pc as usize <= pc && pc < self.end_pc as usize
    }
}

/// Initial value of a static field from its `ConstantValue` attribute.
#[derive(Debug, Clone)]
pub enum ConstantValue {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(Arc<str>),
}
