use std::collections::HashMap;

use crate::{
    class::mutf8::encode_modified_utf8,
    consts::{
        CLASS_MAGIC, ClassAccessFlag, FieldAccessFlag, MAX_MAJOR_VERSION, MethodAccessFlag,
    },
    descriptor::MethodDescriptor,
    runtime::instructions as inst,
};

/// Deduplicating constant-pool writer.
#[derive(Default)]
struct ConstantPoolBuilder {
    bytes: Vec<u8>,
    index: HashMap<Vec<u8>, u16>,
    next: u16,
}

impl ConstantPoolBuilder {
    fn new() -> Self {
        Self {
            next: 1,
            ..Default::default()
        }
    }

    fn add(&mut self, entry: Vec<u8>, wide: bool) -> u16 {
        if let Some(&index) = self.index.get(&entry) {
            return index;
        }
        let index = self.next;
        self.next += if wide { 2 } else { 1 };
        self.bytes.extend_from_slice(&entry);
        self.index.insert(entry, index);
        index
    }

    fn utf8(&mut self, s: &str) -> u16 {
        let encoded = encode_modified_utf8(s);
        let mut entry = vec![1];
        entry.extend_from_slice(&(encoded.len() as u16).to_be_bytes());
        entry.extend_from_slice(&encoded);
        self.add(entry, false)
    }

    fn indexed(&mut self, tag: u8, indices: &[u16]) -> u16 {
        let mut entry = vec![tag];
        for index in indices {
            entry.extend_from_slice(&index.to_be_bytes());
        }
        self.add(entry, false)
    }

    fn class(&mut self, name: &str) -> u16 {
        let name = self.utf8(name);
        self.indexed(7, &[name])
    }

    fn string(&mut self, s: &str) -> u16 {
        let s = self.utf8(s);
        self.indexed(8, &[s])
    }

    fn integer(&mut self, v: i32) -> u16 {
        let mut entry = vec![3];
        entry.extend_from_slice(&v.to_be_bytes());
        self.add(entry, false)
    }

    fn float(&mut self, v: f32) -> u16 {
        let mut entry = vec![4];
        entry.extend_from_slice(&v.to_bits().to_be_bytes());
        self.add(entry, false)
    }

    fn long(&mut self, v: i64) -> u16 {
        let mut entry = vec![5];
        entry.extend_from_slice(&v.to_be_bytes());
        self.add(entry, true)
    }

    fn double(&mut self, v: f64) -> u16 {
        let mut entry = vec![6];
        entry.extend_from_slice(&v.to_bits().to_be_bytes());
        self.add(entry, true)
    }

    fn name_and_type(&mut self, name: &str, descriptor: &str) -> u16 {
        let name = self.utf8(name);
        let descriptor = self.utf8(descriptor);
        self.indexed(12, &[name, descriptor])
    }

    fn member_ref(&mut self, tag: u8, class: &str, name: &str, descriptor: &str) -> u16 {
        let class = self.class(class);
        let name_and_type = self.name_and_type(name, descriptor);
        self.indexed(tag, &[class, name_and_type])
    }
}

struct Member {
    access_flags: u16,
    name: u16,
    descriptor: u16,
    attributes: Vec<(u16, Vec<u8>)>,
}

impl Member {
    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.access_flags.to_be_bytes());
        out.extend_from_slice(&self.name.to_be_bytes());
        out.extend_from_slice(&self.descriptor.to_be_bytes());
        write_attributes(out, &self.attributes);
    }
}

fn write_attributes(out: &mut Vec<u8>, attributes: &[(u16, Vec<u8>)]) {
    out.extend_from_slice(&(attributes.len() as u16).to_be_bytes());
    for (name, info) in attributes {
        out.extend_from_slice(&name.to_be_bytes());
        out.extend_from_slice(&(info.len() as u32).to_be_bytes());
        out.extend_from_slice(info);
    }
}

/// Assembles a class file.
///
/// ```
/// use jvm_engine::class::ClassBuilder;
/// use jvm_engine::consts::MethodAccessFlag;
///
/// let mut builder = ClassBuilder::new("demo/Adder");
/// builder.method(
///     MethodAccessFlag::PUBLIC | MethodAccessFlag::STATIC,
///     "add",
///     "(II)I",
///     |code| {
///         code.iload(0).iload(1).op(jvm_engine::runtime::instructions::IADD).ireturn();
///     },
/// );
/// let bytes = builder.build();
/// assert_eq!(&bytes[..4], &[0xCA, 0xFE, 0xBA, 0xBE]);
/// ```
pub struct ClassBuilder {
    pool: ConstantPoolBuilder,
    access_flags: ClassAccessFlag,
    this_class: u16,
    super_class: u16,
    interfaces: Vec<u16>,
    fields: Vec<Member>,
    methods: Vec<Member>,
    attributes: Vec<(u16, Vec<u8>)>,
}

impl ClassBuilder {
    /// A public class extending `java/lang/Object`.
    pub fn new(name: &str) -> Self {
        let mut pool = ConstantPoolBuilder::new();
        let this_class = pool.class(name);
        let super_class = pool.class("java/lang/Object");
        Self {
            pool,
            access_flags: ClassAccessFlag::PUBLIC | ClassAccessFlag::SUPER,
            this_class,
            super_class,
            interfaces: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            attributes: Vec::new(),
        }
    }

    pub fn access(&mut self, flags: ClassAccessFlag) -> &mut Self {
        self.access_flags = flags;
        self
    }

    pub fn super_class(&mut self, name: &str) -> &mut Self {
        self.super_class = self.pool.class(name);
        self
    }

    /// Only `java/lang/Object` has no superclass.
    pub fn no_super_class(&mut self) -> &mut Self {
        self.super_class = 0;
        self
    }

    pub fn interface(&mut self, name: &str) -> &mut Self {
        let index = self.pool.class(name);
        self.interfaces.push(index);
        self
    }

    pub fn source_file(&mut self, file: &str) -> &mut Self {
        let name = self.pool.utf8("SourceFile");
        let value = self.pool.utf8(file);
        self.attributes.push((name, value.to_be_bytes().to_vec()));
        self
    }

    pub fn field(&mut self, flags: FieldAccessFlag, name: &str, descriptor: &str) -> &mut Self {
        let member = Member {
            access_flags: flags.bits(),
            name: self.pool.utf8(name),
            descriptor: self.pool.utf8(descriptor),
            attributes: Vec::new(),
        };
        self.fields.push(member);
        self
    }

    /// A static field with a `ConstantValue` of type int.
    pub fn constant_int_field(&mut self, flags: FieldAccessFlag, name: &str, value: i32) -> &mut Self {
        let attribute = self.pool.utf8("ConstantValue");
        let constant = self.pool.integer(value);
        let member = Member {
            access_flags: flags.bits(),
            name: self.pool.utf8(name),
            descriptor: self.pool.utf8("I"),
            attributes: vec![(attribute, constant.to_be_bytes().to_vec())],
        };
        self.fields.push(member);
        self
    }

    /// A method with a body; `body` emits its bytecode.
    pub fn method(
        &mut self,
        flags: MethodAccessFlag,
        name: &str,
        descriptor: &str,
        body: impl FnOnce(&mut CodeBuilder),
    ) -> &mut Self {
        let parameter_slots = descriptor
            .parse::<MethodDescriptor>()
            .map(|d| d.parameter_slots())
            .unwrap_or(0);
        let receiver = usize::from(!flags.contains(MethodAccessFlag::STATIC));
        let mut code = CodeBuilder::new(&mut self.pool, (parameter_slots + receiver) as u16);
        body(&mut code);
        let code_attribute = code.finish();
        let attribute = self.pool.utf8("Code");
        let member = Member {
            access_flags: flags.bits(),
            name: self.pool.utf8(name),
            descriptor: self.pool.utf8(descriptor),
            attributes: vec![(attribute, code_attribute)],
        };
        self.methods.push(member);
        self
    }

    /// A method without a body (`native` or `abstract`).
    pub fn declare_method(
        &mut self,
        flags: MethodAccessFlag,
        name: &str,
        descriptor: &str,
    ) -> &mut Self {
        let member = Member {
            access_flags: flags.bits(),
            name: self.pool.utf8(name),
            descriptor: self.pool.utf8(descriptor),
            attributes: Vec::new(),
        };
        self.methods.push(member);
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.pool.bytes.len() + 256);
        out.extend_from_slice(&CLASS_MAGIC.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());
        out.extend_from_slice(&MAX_MAJOR_VERSION.to_be_bytes());
        out.extend_from_slice(&self.pool.next.to_be_bytes());
        out.extend_from_slice(&self.pool.bytes);
        out.extend_from_slice(&self.access_flags.bits().to_be_bytes());
        out.extend_from_slice(&self.this_class.to_be_bytes());
        out.extend_from_slice(&self.super_class.to_be_bytes());
        out.extend_from_slice(&(self.interfaces.len() as u16).to_be_bytes());
        for interface in &self.interfaces {
            out.extend_from_slice(&interface.to_be_bytes());
        }
        out.extend_from_slice(&(self.fields.len() as u16).to_be_bytes());
        for field in &self.fields {
            field.write(&mut out);
        }
        out.extend_from_slice(&(self.methods.len() as u16).to_be_bytes());
        for method in &self.methods {
            method.write(&mut out);
        }
        write_attributes(&mut out, &self.attributes);
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

struct Fixup {
    /// pc of the branching instruction; offsets are relative to it
    from: usize,
    /// where the offset is written
    at: usize,
    label: Label,
    wide: bool,
}

struct Handler {
    start: Label,
    end: Label,
    handler: Label,
    catch_type: u16,
}

/// Emits one method body. Branch targets are symbolic [`Label`]s resolved
/// when the body is finished.
pub struct CodeBuilder<'a> {
    pool: &'a mut ConstantPoolBuilder,
    code: Vec<u8>,
    labels: Vec<Option<usize>>,
    fixups: Vec<Fixup>,
    handlers: Vec<Handler>,
    lines: Vec<(u16, u16)>,
    max_stack: u16,
    max_locals: u16,
}

macro_rules! local_ops {
    ($($name:ident => $short:ident, $long:ident, $slots:expr;)*) => {
        $(
            pub fn $name(&mut self, index: u16) -> &mut Self {
                self.local(inst::$short, inst::$long, index, $slots)
            }
        )*
    };
}

macro_rules! simple_ops {
    ($($name:ident => $op:ident;)*) => {
        $(
            pub fn $name(&mut self) -> &mut Self {
                self.op(inst::$op)
            }
        )*
    };
}

impl<'a> CodeBuilder<'a> {
    fn new(pool: &'a mut ConstantPoolBuilder, argument_slots: u16) -> Self {
        Self {
            pool,
            code: Vec::new(),
            labels: Vec::new(),
            fixups: Vec::new(),
            handlers: Vec::new(),
            lines: Vec::new(),
            max_stack: 16,
            max_locals: argument_slots,
        }
    }

    pub fn pc(&self) -> usize {
        self.code.len()
    }

    pub fn max_stack(&mut self, max_stack: u16) -> &mut Self {
        self.max_stack = max_stack;
        self
    }

    /// Local slots are otherwise derived from the loads and stores emitted.
    pub fn max_locals(&mut self, max_locals: u16) -> &mut Self {
        self.max_locals = self.max_locals.max(max_locals);
        self
    }

    pub fn op(&mut self, opcode: u8) -> &mut Self {
        self.code.push(opcode);
        self
    }

    /// Appends raw bytes, for hand-crafted (possibly invalid) sequences.
    pub fn raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.code.extend_from_slice(bytes);
        self
    }

    pub fn op_u8(&mut self, opcode: u8, operand: u8) -> &mut Self {
        self.code.extend_from_slice(&[opcode, operand]);
        self
    }

    pub fn op_u16(&mut self, opcode: u8, operand: u16) -> &mut Self {
        self.code.push(opcode);
        self.code.extend_from_slice(&operand.to_be_bytes());
        self
    }

    pub fn line(&mut self, line: u16) -> &mut Self {
        self.lines.push((self.code.len() as u16, line));
        self
    }

    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Binds `label` to the current pc.
    pub fn bind(&mut self, label: Label) -> &mut Self {
        self.labels[label.0] = Some(self.code.len());
        self
    }

    pub fn branch(&mut self, opcode: u8, label: Label) -> &mut Self {
        let from = self.code.len();
        let wide = opcode == inst::GOTO_W;
        self.code.push(opcode);
        self.fixups.push(Fixup {
            from,
            at: from + 1,
            label,
            wide,
        });
        self.code
            .extend_from_slice(if wide { &[0; 4] } else { &[0; 2] });
        self
    }

    pub fn goto(&mut self, label: Label) -> &mut Self {
        self.branch(inst::GOTO, label)
    }

    fn switch_header(&mut self, opcode: u8, default: Label) -> usize {
        let from = self.code.len();
        self.code.push(opcode);
        while self.code.len() % 4 != 0 {
            self.code.push(0);
        }
        self.fixups.push(Fixup {
            from,
            at: self.code.len(),
            label: default,
            wide: true,
        });
        self.code.extend_from_slice(&[0; 4]);
        from
    }

    pub fn tableswitch(&mut self, low: i32, default: Label, targets: &[Label]) -> &mut Self {
        let from = self.switch_header(inst::TABLESWITCH, default);
        let high = low + targets.len() as i32 - 1;
        self.code.extend_from_slice(&low.to_be_bytes());
        self.code.extend_from_slice(&high.to_be_bytes());
        for &label in targets {
            self.fixups.push(Fixup {
                from,
                at: self.code.len(),
                label,
                wide: true,
            });
            self.code.extend_from_slice(&[0; 4]);
        }
        self
    }

    /// `pairs` must be sorted by key.
    pub fn lookupswitch(&mut self, default: Label, pairs: &[(i32, Label)]) -> &mut Self {
        let from = self.switch_header(inst::LOOKUPSWITCH, default);
        self.code
            .extend_from_slice(&(pairs.len() as i32).to_be_bytes());
        for &(key, label) in pairs {
            self.code.extend_from_slice(&key.to_be_bytes());
            self.fixups.push(Fixup {
                from,
                at: self.code.len(),
                label,
                wide: true,
            });
            self.code.extend_from_slice(&[0; 4]);
        }
        self
    }

    /// Registers a handler for `[start, end)`; `None` catches everything.
    pub fn try_catch(
        &mut self,
        start: Label,
        end: Label,
        handler: Label,
        catch_type: Option<&str>,
    ) -> &mut Self {
        let catch_type = catch_type.map(|c| self.pool.class(c)).unwrap_or(0);
        self.handlers.push(Handler {
            start,
            end,
            handler,
            catch_type,
        });
        self
    }

    fn local(&mut self, short: u8, long: u8, index: u16, slots: u16) -> &mut Self {
        self.max_locals = self.max_locals.max(index + slots);
        if index <= 3 {
            self.op(short + index as u8)
        } else if index <= u8::MAX as u16 {
            self.op_u8(long, index as u8)
        } else {
            self.op(inst::WIDE).op_u16(long, index)
        }
    }

    local_ops! {
        iload => ILOAD_0, ILOAD, 1;
        lload => LLOAD_0, LLOAD, 2;
        fload => FLOAD_0, FLOAD, 1;
        dload => DLOAD_0, DLOAD, 2;
        aload => ALOAD_0, ALOAD, 1;
        istore => ISTORE_0, ISTORE, 1;
        lstore => LSTORE_0, LSTORE, 2;
        fstore => FSTORE_0, FSTORE, 1;
        dstore => DSTORE_0, DSTORE, 2;
        astore => ASTORE_0, ASTORE, 1;
    }

    simple_ops! {
        aconst_null => ACONST_NULL;
        ireturn => IRETURN;
        lreturn => LRETURN;
        freturn => FRETURN;
        dreturn => DRETURN;
        areturn => ARETURN;
        vreturn => RETURN;
        athrow => ATHROW;
        dup => DUP;
        pop => POP;
        arraylength => ARRAYLENGTH;
        monitorenter => MONITORENTER;
        monitorexit => MONITOREXIT;
    }

    pub fn iinc(&mut self, index: u16, delta: i16) -> &mut Self {
        self.max_locals = self.max_locals.max(index + 1);
        if index <= u8::MAX as u16 && i8::try_from(delta).is_ok() {
            self.code
                .extend_from_slice(&[inst::IINC, index as u8, delta as i8 as u8]);
        } else {
            self.code.extend_from_slice(&[inst::WIDE, inst::IINC]);
            self.code.extend_from_slice(&index.to_be_bytes());
            self.code.extend_from_slice(&delta.to_be_bytes());
        }
        self
    }

    /// Pushes an int using the shortest encoding.
    pub fn iconst(&mut self, value: i32) -> &mut Self {
        match value {
            -1..=5 => self.op((inst::ICONST_0 as i32 + value) as u8),
            -128..=127 => self.op_u8(inst::BIPUSH, value as i8 as u8),
            -32768..=32767 => self.op_u16(inst::SIPUSH, value as i16 as u16),
            _ => {
                let index = self.pool.integer(value);
                self.ldc_index(index)
            }
        }
    }

    pub fn lconst(&mut self, value: i64) -> &mut Self {
        match value {
            0 | 1 => self.op(inst::LCONST_0 + value as u8),
            _ => {
                let index = self.pool.long(value);
                self.op_u16(inst::LDC2_W, index)
            }
        }
    }

    pub fn fconst(&mut self, value: f32) -> &mut Self {
        if value == 0.0 && value.is_sign_positive() {
            self.op(inst::FCONST_0)
        } else if value == 1.0 {
            self.op(inst::FCONST_1)
        } else if value == 2.0 {
            self.op(inst::FCONST_2)
        } else {
            let index = self.pool.float(value);
            self.ldc_index(index)
        }
    }

    pub fn dconst(&mut self, value: f64) -> &mut Self {
        if value == 0.0 && value.is_sign_positive() {
            self.op(inst::DCONST_0)
        } else if value == 1.0 {
            self.op(inst::DCONST_1)
        } else {
            let index = self.pool.double(value);
            self.op_u16(inst::LDC2_W, index)
        }
    }

    pub fn ldc_string(&mut self, value: &str) -> &mut Self {
        let index = self.pool.string(value);
        self.ldc_index(index)
    }

    pub fn ldc_class(&mut self, class: &str) -> &mut Self {
        let index = self.pool.class(class);
        self.ldc_index(index)
    }

    fn ldc_index(&mut self, index: u16) -> &mut Self {
        if index <= u8::MAX as u16 {
            self.op_u8(inst::LDC, index as u8)
        } else {
            self.op_u16(inst::LDC_W, index)
        }
    }

    pub fn new_object(&mut self, class: &str) -> &mut Self {
        let index = self.pool.class(class);
        self.op_u16(inst::NEW, index)
    }

    /// `atype` is one of [`crate::consts::array_type`].
    pub fn newarray(&mut self, atype: u8) -> &mut Self {
        self.op_u8(inst::NEWARRAY, atype)
    }

    pub fn anewarray(&mut self, component: &str) -> &mut Self {
        let index = self.pool.class(component);
        self.op_u16(inst::ANEWARRAY, index)
    }

    pub fn multianewarray(&mut self, class: &str, dimensions: u8) -> &mut Self {
        let index = self.pool.class(class);
        self.op_u16(inst::MULTIANEWARRAY, index);
        self.code.push(dimensions);
        self
    }

    pub fn checkcast(&mut self, class: &str) -> &mut Self {
        let index = self.pool.class(class);
        self.op_u16(inst::CHECKCAST, index)
    }

    pub fn instanceof(&mut self, class: &str) -> &mut Self {
        let index = self.pool.class(class);
        self.op_u16(inst::INSTANCEOF, index)
    }

    fn field_op(&mut self, opcode: u8, class: &str, name: &str, descriptor: &str) -> &mut Self {
        let index = self.pool.member_ref(9, class, name, descriptor);
        self.op_u16(opcode, index)
    }

    pub fn getfield(&mut self, class: &str, name: &str, descriptor: &str) -> &mut Self {
        self.field_op(inst::GETFIELD, class, name, descriptor)
    }

    pub fn putfield(&mut self, class: &str, name: &str, descriptor: &str) -> &mut Self {
        self.field_op(inst::PUTFIELD, class, name, descriptor)
    }

    pub fn getstatic(&mut self, class: &str, name: &str, descriptor: &str) -> &mut Self {
        self.field_op(inst::GETSTATIC, class, name, descriptor)
    }

    pub fn putstatic(&mut self, class: &str, name: &str, descriptor: &str) -> &mut Self {
        self.field_op(inst::PUTSTATIC, class, name, descriptor)
    }

    pub fn invokevirtual(&mut self, class: &str, name: &str, descriptor: &str) -> &mut Self {
        let index = self.pool.member_ref(10, class, name, descriptor);
        self.op_u16(inst::INVOKEVIRTUAL, index)
    }

    pub fn invokespecial(&mut self, class: &str, name: &str, descriptor: &str) -> &mut Self {
        let index = self.pool.member_ref(10, class, name, descriptor);
        self.op_u16(inst::INVOKESPECIAL, index)
    }

    pub fn invokestatic(&mut self, class: &str, name: &str, descriptor: &str) -> &mut Self {
        let index = self.pool.member_ref(10, class, name, descriptor);
        self.op_u16(inst::INVOKESTATIC, index)
    }

    pub fn invokeinterface(&mut self, class: &str, name: &str, descriptor: &str) -> &mut Self {
        let index = self.pool.member_ref(11, class, name, descriptor);
        let count = descriptor
            .parse::<MethodDescriptor>()
            .map(|d| d.parameter_slots() + 1)
            .unwrap_or(1);
        self.op_u16(inst::INVOKEINTERFACE, index);
        self.code.extend_from_slice(&[count as u8, 0]);
        self
    }

    /// Calls the superclass no-argument constructor on local 0.
    pub fn super_init(&mut self, super_class: &str) -> &mut Self {
        self.aload(0).invokespecial(super_class, "<init>", "()V")
    }

    fn finish(self) -> Vec<u8> {
        let mut code = self.code;
        for fixup in &self.fixups {
            let target = self.labels[fixup.label.0].unwrap_or(0);
            let offset = target as i64 - fixup.from as i64;
            if fixup.wide {
                code[fixup.at..fixup.at + 4].copy_from_slice(&(offset as i32).to_be_bytes());
            } else {
                code[fixup.at..fixup.at + 2].copy_from_slice(&(offset as i16).to_be_bytes());
            }
        }

        let mut out = Vec::with_capacity(code.len() + 32);
        out.extend_from_slice(&self.max_stack.to_be_bytes());
        out.extend_from_slice(&self.max_locals.to_be_bytes());
        out.extend_from_slice(&(code.len() as u32).to_be_bytes());
        out.extend_from_slice(&code);
        out.extend_from_slice(&(self.handlers.len() as u16).to_be_bytes());
        for handler in &self.handlers {
            for label in [handler.start, handler.end, handler.handler] {
                let pc = self.labels[label.0].unwrap_or(0) as u16;
                out.extend_from_slice(&pc.to_be_bytes());
            }
            out.extend_from_slice(&handler.catch_type.to_be_bytes());
        }

        let mut attributes = Vec::new();
        if !self.lines.is_empty() {
            let mut table = Vec::with_capacity(2 + self.lines.len() * 4);
            table.extend_from_slice(&(self.lines.len() as u16).to_be_bytes());
            for (pc, line) in &self.lines {
                table.extend_from_slice(&pc.to_be_bytes());
                table.extend_from_slice(&line.to_be_bytes());
            }
            attributes.push((self.pool.utf8("LineNumberTable"), table));
        }
        write_attributes(&mut out, &attributes);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::class_file;

    fn code_of(bytes: &[u8]) -> Vec<u8> {
        let class = class_file("T", bytes).unwrap();
        let method = &class.methods[0];
        let attribute = class
            .find_attribute(&method.attributes, "Code")
            .unwrap()
            .unwrap();
        let length = u32::from_be_bytes(attribute.info[4..8].try_into().unwrap()) as usize;
        attribute.info[8..8 + length].to_vec()
    }

    #[test]
    fn test_backward_branch() {
        let mut builder = ClassBuilder::new("T");
        builder.method(MethodAccessFlag::STATIC, "loop", "()V", |code| {
            let top = code.new_label();
            code.bind(top).goto(top);
        });
        let code = code_of(&builder.build());
        assert_eq!(code, vec![inst::GOTO, 0, 0]);
    }

    #[test]
    fn test_forward_branch_and_constants() {
        let mut builder = ClassBuilder::new("T");
        builder.method(MethodAccessFlag::STATIC, "f", "(I)I", |code| {
            let skip = code.new_label();
            code.iload(0).branch(inst::IFEQ, skip);
            code.iconst(300).ireturn();
            code.bind(skip).iconst(-1).ireturn();
        });
        let code = code_of(&builder.build());
        assert_eq!(
            code,
            vec![
                inst::ILOAD_0,
                inst::IFEQ,
                0,
                7,
                inst::SIPUSH,
                1,
                44,
                inst::IRETURN,
                inst::ICONST_M1,
                inst::IRETURN
            ]
        );
    }

    #[test]
    fn test_switch_alignment() {
        let mut builder = ClassBuilder::new("T");
        builder.method(MethodAccessFlag::STATIC, "s", "(I)I", |code| {
            let a = code.new_label();
            let dflt = code.new_label();
            code.iload(0).tableswitch(0, dflt, &[a]);
            code.bind(a).iconst(1).ireturn();
            code.bind(dflt).iconst(0).ireturn();
        });
        let code = code_of(&builder.build());
        // opcode at pc 1, padding to pc 4
        assert_eq!(code[1], inst::TABLESWITCH);
        assert_eq!(&code[2..4], &[0, 0]);
        assert_eq!(
            inst::instruction_length(&code, 1),
            Some(4 + 12 + 4 - 1)
        );
        let default = i32::from_be_bytes(code[4..8].try_into().unwrap());
        assert_eq!(default, 22 - 1);
    }

    #[test]
    fn test_max_locals_tracks_wide_values() {
        let mut builder = ClassBuilder::new("T");
        builder.method(MethodAccessFlag::STATIC, "f", "()V", |code| {
            code.lconst(5).lstore(4).vreturn();
        });
        let class = class_file("T", &builder.build()).unwrap();
        let method = &class.methods[0];
        let info = &class
            .find_attribute(&method.attributes, "Code")
            .unwrap()
            .unwrap()
            .info;
        assert_eq!(u16::from_be_bytes([info[2], info[3]]), 6);
    }
}
