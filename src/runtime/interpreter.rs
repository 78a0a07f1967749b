//! The bytecode interpreter, the tier every method starts in.
//!
//! [`InterpreterEnv::execute`] runs one frame until it calls, returns,
//! throws or needs a class initialized; [`call::run`] moves between frames.
//! The slow paths (resolution, allocation, dispatch) are methods on
//! [`InterpreterEnv`] so compiled code takes exactly the same ones.

use std::sync::{Arc, atomic::Ordering};

use crate::{
    consts::array_type,
    error::{VmError, VmResult},
    runtime::{
        Class, ConstantPoolInfo, Exception, Method, Reference, ResolvedField, Slot, Value, debug,
        thread::ThreadEnv,
    },
};

pub(crate) mod arith;
pub(crate) mod call;
pub(crate) mod frame;
pub mod instructions;
pub(crate) mod objects;
pub(crate) mod resolve;

pub(crate) use call::{initialize_class, invoke_method};
pub(crate) use frame::{CallStack, Frame};

use instructions as inst;

/// Why a frame stopped executing.
#[derive(Debug)]
pub(crate) enum Next {
    /// Call the method, whose arguments are on top of the operand stack.
    Invoke(Arc<Method>),
    Return(Option<Slot>),
    /// Initialize the class, then execute the current instruction again.
    Initialize(Arc<Class>),
    Exception(Exception),
}

impl From<Exception> for Next {
    fn from(exception: Exception) -> Self {
        Next::Exception(exception)
    }
}

/// Result of a slow path: a value, or the reason the frame has to stop.
pub(crate) type Step<T> = Result<T, Next>;

pub(crate) struct InterpreterEnv<'a> {
    pub(crate) env: &'a ThreadEnv,
    pub(crate) stack: &'a mut CallStack,
    pub(crate) frame: &'a mut Frame,
}

#[inline]
fn u8_at(code: &[u8], at: usize) -> u8 {
    code[at]
}

#[inline]
fn u16_at(code: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([code[at], code[at + 1]])
}

#[inline]
fn i16_at(code: &[u8], at: usize) -> i16 {
    u16_at(code, at) as i16
}

#[inline]
fn i32_at(code: &[u8], at: usize) -> i32 {
    i32::from_be_bytes([code[at], code[at + 1], code[at + 2], code[at + 3]])
}

#[inline]
fn offset(pc: usize, delta: i32) -> usize {
    (pc as isize + delta as isize) as usize
}

/// Target of the `tableswitch` at `pc` for `key`.
pub(crate) fn table_switch_target(code: &[u8], pc: usize, key: i32) -> usize {
    let base = inst::switch_operands(pc);
    let default = i32_at(code, base);
    let low = i32_at(code, base + 4);
    let high = i32_at(code, base + 8);
    if key < low || key > high {
        return offset(pc, default);
    }
    let index = (key as i64 - low as i64) as usize;
    offset(pc, i32_at(code, base + 12 + index * 4))
}

/// Target of the `lookupswitch` at `pc` for `key`. Pairs are sorted by key.
pub(crate) fn lookup_switch_target(code: &[u8], pc: usize, key: i32) -> usize {
    let base = inst::switch_operands(pc);
    let default = i32_at(code, base);
    let pairs = i32_at(code, base + 4).max(0) as usize;
    let (mut low, mut high) = (0, pairs);
    while low < high {
        let mid = (low + high) / 2;
        let at = base + 8 + mid * 8;
        let candidate = i32_at(code, at);
        match candidate.cmp(&key) {
            std::cmp::Ordering::Equal => return offset(pc, i32_at(code, at + 4)),
            std::cmp::Ordering::Less => low = mid + 1,
            std::cmp::Ordering::Greater => high = mid,
        }
    }
    offset(pc, default)
}

/// Class name of the primitive array `newarray` creates for `atype`.
pub(crate) fn primitive_array_name(atype: u8) -> Option<&'static str> {
    Some(match atype {
        array_type::T_BOOLEAN => "[Z",
        array_type::T_CHAR => "[C",
        array_type::T_FLOAT => "[F",
        array_type::T_DOUBLE => "[D",
        array_type::T_BYTE => "[B",
        array_type::T_SHORT => "[S",
        array_type::T_INT => "[I",
        array_type::T_LONG => "[J",
        _ => return None,
    })
}

impl<'a> InterpreterEnv<'a> {
    pub(crate) fn new(env: &'a ThreadEnv, stack: &'a mut CallStack, frame: &'a mut Frame) -> Self {
        Self { env, stack, frame }
    }

    pub(crate) fn execute(&mut self) -> Next {
        macro_rules! except {
            ($expr:expr $(,)?) => {
                match $expr {
                    ::std::result::Result::Ok(val) => val,
                    ::std::result::Result::Err(err) => {
                        return Next::Exception(err);
                    }
                }
            };
        }
        macro_rules! step {
            ($expr:expr $(,)?) => {
                match $expr {
                    ::std::result::Result::Ok(val) => val,
                    ::std::result::Result::Err(next) => {
                        return next;
                    }
                }
            };
        }
        macro_rules! binary {
            ($pop:ident, $push:ident, |$a:ident, $b:ident| $result:expr) => {{
                let $b = self.frame.$pop();
                let $a = self.frame.$pop();
                self.frame.$push($result);
            }};
        }
        macro_rules! unary {
            ($pop:ident, $push:ident, |$a:ident| $result:expr) => {{
                let $a = self.frame.$pop();
                self.frame.$push($result);
            }};
        }
        macro_rules! shift {
            ($pop:ident, $push:ident, $op:path) => {{
                let b = self.frame.pop_int();
                let a = self.frame.$pop();
                self.frame.$push($op(a, b));
            }};
        }
        macro_rules! divide {
            ($pop:ident, $push:ident, $op:path) => {{
                let b = self.frame.$pop();
                let a = self.frame.$pop();
                match $op(a, b) {
                    Some(result) => self.frame.$push(result),
                    None => return Next::Exception(self.divide_by_zero()),
                }
            }};
        }

        let code = Arc::clone(&self.frame.code);
        loop {
            let pc = self.frame.pc;
            if self.env.global.debugger.is_attached() && is_watched(self.env, &self.frame.method) {
                debug::on_instruction(self.env, self.stack, self.frame);
            }
            let op = code[pc];
            let mut next = pc + inst::instruction_length(&code, pc).unwrap_or(1);

            macro_rules! branch {
                ($cond:expr) => {
                    if $cond {
                        let target = offset(pc, i16_at(&code, pc + 1) as i32);
                        self.jump(pc, target);
                        continue;
                    }
                };
            }

            match op {
                inst::NOP => {}

                // constants
                inst::ACONST_NULL => self.frame.push(0),
                inst::ICONST_M1..=inst::ICONST_5 => {
                    self.frame.push_int(op as i32 - inst::ICONST_0 as i32)
                }
                inst::LCONST_0 | inst::LCONST_1 => self.frame.push_long((op - inst::LCONST_0) as i64),
                inst::FCONST_0..=inst::FCONST_2 => self.frame.push_float((op - inst::FCONST_0) as f32),
                inst::DCONST_0 | inst::DCONST_1 => {
                    self.frame.push_double((op - inst::DCONST_0) as f64)
                }
                inst::BIPUSH => self.frame.push_int(u8_at(&code, pc + 1) as i8 as i32),
                inst::SIPUSH => self.frame.push_int(i16_at(&code, pc + 1) as i32),
                inst::LDC => {
                    let value = step!(self.ldc(u8_at(&code, pc + 1) as u16));
                    self.frame.push_value(value);
                }
                inst::LDC_W | inst::LDC2_W => {
                    let value = step!(self.ldc(u16_at(&code, pc + 1)));
                    self.frame.push_value(value);
                }

                // locals
                inst::ILOAD | inst::FLOAD | inst::ALOAD => self.load(u8_at(&code, pc + 1) as usize),
                inst::LLOAD | inst::DLOAD => self.load_wide(u8_at(&code, pc + 1) as usize),
                inst::ILOAD_0..=inst::ALOAD_3 => {
                    let n = (op - inst::ILOAD_0) as usize;
                    match n / 4 {
                        1 | 3 => self.load_wide(n % 4),
                        _ => self.load(n % 4),
                    }
                }
                inst::ISTORE | inst::FSTORE | inst::ASTORE => self.store(u8_at(&code, pc + 1) as usize),
                inst::LSTORE | inst::DSTORE => self.store_wide(u8_at(&code, pc + 1) as usize),
                inst::ISTORE_0..=inst::ASTORE_3 => {
                    let n = (op - inst::ISTORE_0) as usize;
                    match n / 4 {
                        1 | 3 => self.store_wide(n % 4),
                        _ => self.store(n % 4),
                    }
                }
                inst::IINC => self.iinc(
                    u8_at(&code, pc + 1) as usize,
                    u8_at(&code, pc + 2) as i8 as i32,
                ),
                inst::WIDE => {
                    let index = u16_at(&code, pc + 2) as usize;
                    match u8_at(&code, pc + 1) {
                        inst::IINC => self.iinc(index, i16_at(&code, pc + 4) as i32),
                        inst::ILOAD | inst::FLOAD | inst::ALOAD => self.load(index),
                        inst::LLOAD | inst::DLOAD => self.load_wide(index),
                        inst::ISTORE | inst::FSTORE | inst::ASTORE => self.store(index),
                        inst::LSTORE | inst::DSTORE => self.store_wide(index),
                        other => return self.unsupported(other),
                    }
                }

                // arrays
                inst::IALOAD | inst::FALOAD | inst::AALOAD | inst::BALOAD | inst::CALOAD | inst::SALOAD => {
                    let index = self.frame.pop_int();
                    let array = self.frame.pop_reference();
                    let value = except!(objects::array_load(self.env, self.stack, self.frame, array, index));
                    self.frame.push(value);
                }
                inst::LALOAD | inst::DALOAD => {
                    let index = self.frame.pop_int();
                    let array = self.frame.pop_reference();
                    let value = except!(objects::array_load(self.env, self.stack, self.frame, array, index));
                    self.frame.push_wide(value);
                }
                inst::IASTORE | inst::FASTORE | inst::AASTORE | inst::BASTORE | inst::CASTORE | inst::SASTORE => {
                    let value = self.frame.pop();
                    let index = self.frame.pop_int();
                    let array = self.frame.pop_reference();
                    except!(objects::array_store(self.env, self.stack, self.frame, array, index, value));
                }
                inst::LASTORE | inst::DASTORE => {
                    let value = self.frame.pop_wide();
                    let index = self.frame.pop_int();
                    let array = self.frame.pop_reference();
                    except!(objects::array_store(self.env, self.stack, self.frame, array, index, value));
                }
                inst::ARRAYLENGTH => {
                    let array = self.frame.pop_reference();
                    let length = except!(objects::array_length(self.env, self.stack, self.frame, array));
                    self.frame.push_int(length);
                }
                inst::NEWARRAY => {
                    let length = self.frame.pop_int();
                    let array = step!(self.new_primitive_array(u8_at(&code, pc + 1), length));
                    self.frame.push_reference(array);
                }
                inst::ANEWARRAY => {
                    let length = self.frame.pop_int();
                    let array = step!(self.new_reference_array(u16_at(&code, pc + 1), length));
                    self.frame.push_reference(array);
                }
                inst::MULTIANEWARRAY => {
                    let dimensions = u8_at(&code, pc + 3) as usize;
                    let mut lengths = vec![0; dimensions];
                    for length in lengths.iter_mut().rev() {
                        *length = self.frame.pop_int();
                    }
                    let array = step!(self.new_multi_array(u16_at(&code, pc + 1), &lengths));
                    self.frame.push_reference(array);
                }

                // operand stack
                inst::POP => {
                    self.frame.pop();
                }
                inst::POP2 => {
                    self.frame.pop_wide();
                }
                inst::DUP => self.frame.push(self.frame.peek(0)),
                inst::DUP_X1 => {
                    let (v1, v2) = (self.frame.pop(), self.frame.pop());
                    self.push_all(&[v1, v2, v1]);
                }
                inst::DUP_X2 => {
                    let (v1, v2, v3) = (self.frame.pop(), self.frame.pop(), self.frame.pop());
                    self.push_all(&[v1, v3, v2, v1]);
                }
                inst::DUP2 => {
                    let (v1, v2) = (self.frame.pop(), self.frame.pop());
                    self.push_all(&[v2, v1, v2, v1]);
                }
                inst::DUP2_X1 => {
                    let (v1, v2, v3) = (self.frame.pop(), self.frame.pop(), self.frame.pop());
                    self.push_all(&[v2, v1, v3, v2, v1]);
                }
                inst::DUP2_X2 => {
                    let (v1, v2) = (self.frame.pop(), self.frame.pop());
                    let (v3, v4) = (self.frame.pop(), self.frame.pop());
                    self.push_all(&[v2, v1, v4, v3, v2, v1]);
                }
                inst::SWAP => {
                    let (v1, v2) = (self.frame.pop(), self.frame.pop());
                    self.push_all(&[v1, v2]);
                }

                // arithmetic
                inst::IADD => binary!(pop_int, push_int, |a, b| a.wrapping_add(b)),
                inst::LADD => binary!(pop_long, push_long, |a, b| a.wrapping_add(b)),
                inst::FADD => binary!(pop_float, push_float, |a, b| a + b),
                inst::DADD => binary!(pop_double, push_double, |a, b| a + b),
                inst::ISUB => binary!(pop_int, push_int, |a, b| a.wrapping_sub(b)),
                inst::LSUB => binary!(pop_long, push_long, |a, b| a.wrapping_sub(b)),
                inst::FSUB => binary!(pop_float, push_float, |a, b| a - b),
                inst::DSUB => binary!(pop_double, push_double, |a, b| a - b),
                inst::IMUL => binary!(pop_int, push_int, |a, b| a.wrapping_mul(b)),
                inst::LMUL => binary!(pop_long, push_long, |a, b| a.wrapping_mul(b)),
                inst::FMUL => binary!(pop_float, push_float, |a, b| a * b),
                inst::DMUL => binary!(pop_double, push_double, |a, b| a * b),
                inst::IDIV => divide!(pop_int, push_int, arith::idiv),
                inst::LDIV => divide!(pop_long, push_long, arith::ldiv),
                inst::FDIV => binary!(pop_float, push_float, |a, b| a / b),
                inst::DDIV => binary!(pop_double, push_double, |a, b| a / b),
                inst::IREM => divide!(pop_int, push_int, arith::irem),
                inst::LREM => divide!(pop_long, push_long, arith::lrem),
                inst::FREM => binary!(pop_float, push_float, |a, b| arith::frem(a, b)),
                inst::DREM => binary!(pop_double, push_double, |a, b| arith::drem(a, b)),
                inst::INEG => unary!(pop_int, push_int, |a| a.wrapping_neg()),
                inst::LNEG => unary!(pop_long, push_long, |a| a.wrapping_neg()),
                inst::FNEG => unary!(pop_float, push_float, |a| -a),
                inst::DNEG => unary!(pop_double, push_double, |a| -a),
                inst::ISHL => shift!(pop_int, push_int, arith::ishl),
                inst::ISHR => shift!(pop_int, push_int, arith::ishr),
                inst::IUSHR => shift!(pop_int, push_int, arith::iushr),
                inst::LSHL => shift!(pop_long, push_long, arith::lshl),
                inst::LSHR => shift!(pop_long, push_long, arith::lshr),
                inst::LUSHR => shift!(pop_long, push_long, arith::lushr),
                inst::IAND => binary!(pop_int, push_int, |a, b| a & b),
                inst::LAND => binary!(pop_long, push_long, |a, b| a & b),
                inst::IOR => binary!(pop_int, push_int, |a, b| a | b),
                inst::LOR => binary!(pop_long, push_long, |a, b| a | b),
                inst::IXOR => binary!(pop_int, push_int, |a, b| a ^ b),
                inst::LXOR => binary!(pop_long, push_long, |a, b| a ^ b),

                // conversions
                inst::I2L => unary!(pop_int, push_long, |a| a as i64),
                inst::I2F => unary!(pop_int, push_float, |a| a as f32),
                inst::I2D => unary!(pop_int, push_double, |a| a as f64),
                inst::L2I => unary!(pop_long, push_int, |a| a as i32),
                inst::L2F => unary!(pop_long, push_float, |a| a as f32),
                inst::L2D => unary!(pop_long, push_double, |a| a as f64),
                inst::F2I => unary!(pop_float, push_int, |a| arith::f2i(a)),
                inst::F2L => unary!(pop_float, push_long, |a| arith::f2l(a)),
                inst::F2D => unary!(pop_float, push_double, |a| a as f64),
                inst::D2I => unary!(pop_double, push_int, |a| arith::d2i(a)),
                inst::D2L => unary!(pop_double, push_long, |a| arith::d2l(a)),
                inst::D2F => unary!(pop_double, push_float, |a| a as f32),
                inst::I2B => unary!(pop_int, push_int, |a| a as i8 as i32),
                inst::I2C => unary!(pop_int, push_int, |a| a as u16 as i32),
                inst::I2S => unary!(pop_int, push_int, |a| a as i16 as i32),

                // comparisons
                inst::LCMP => binary!(pop_long, push_int, |a, b| arith::lcmp(a, b)),
                inst::FCMPL => binary!(pop_float, push_int, |a, b| arith::fcmp(a, b, -1)),
                inst::FCMPG => binary!(pop_float, push_int, |a, b| arith::fcmp(a, b, 1)),
                inst::DCMPL => binary!(pop_double, push_int, |a, b| arith::fcmp(a, b, -1)),
                inst::DCMPG => binary!(pop_double, push_int, |a, b| arith::fcmp(a, b, 1)),

                // control
                inst::IFEQ => branch!(self.frame.pop_int() == 0),
                inst::IFNE => branch!(self.frame.pop_int() != 0),
                inst::IFLT => branch!(self.frame.pop_int() < 0),
                inst::IFGE => branch!(self.frame.pop_int() >= 0),
                inst::IFGT => branch!(self.frame.pop_int() > 0),
                inst::IFLE => branch!(self.frame.pop_int() <= 0),
                inst::IF_ICMPEQ..=inst::IF_ICMPLE => {
                    let b = self.frame.pop_int();
                    let a = self.frame.pop_int();
                    branch!(match op {
                        inst::IF_ICMPEQ => a == b,
                        inst::IF_ICMPNE => a != b,
                        inst::IF_ICMPLT => a < b,
                        inst::IF_ICMPGE => a >= b,
                        inst::IF_ICMPGT => a > b,
                        _ => a <= b,
                    });
                }
                inst::IF_ACMPEQ | inst::IF_ACMPNE => {
                    let b = self.frame.pop_reference();
                    let a = self.frame.pop_reference();
                    branch!((a == b) == (op == inst::IF_ACMPEQ));
                }
                inst::IFNULL => branch!(self.frame.pop_reference() == 0),
                inst::IFNONNULL => branch!(self.frame.pop_reference() != 0),
                inst::GOTO => branch!(true),
                inst::GOTO_W => {
                    let target = offset(pc, i32_at(&code, pc + 1));
                    self.jump(pc, target);
                    continue;
                }
                inst::TABLESWITCH => {
                    let key = self.frame.pop_int();
                    next = table_switch_target(&code, pc, key);
                    if next <= pc {
                        self.jump(pc, next);
                        continue;
                    }
                }
                inst::LOOKUPSWITCH => {
                    let key = self.frame.pop_int();
                    next = lookup_switch_target(&code, pc, key);
                    if next <= pc {
                        self.jump(pc, next);
                        continue;
                    }
                }
                inst::IRETURN | inst::FRETURN | inst::ARETURN => {
                    return Next::Return(Some(self.frame.pop()));
                }
                inst::LRETURN | inst::DRETURN => return Next::Return(Some(self.frame.pop_wide())),
                inst::RETURN => return Next::Return(None),
                inst::ATHROW => {
                    let throwable = self.frame.pop_reference();
                    return Next::Exception(objects::athrow(self.env, self.stack, self.frame, throwable));
                }

                // fields
                inst::GETSTATIC => {
                    let field = step!(self.static_field(u16_at(&code, pc + 1)));
                    let value = field.class.get_static(field.slot);
                    self.push_typed(&field, value);
                }
                inst::PUTSTATIC => {
                    let field = step!(self.static_field(u16_at(&code, pc + 1)));
                    let value = self.pop_typed(&field);
                    field.class.set_static(field.slot, value);
                }
                inst::GETFIELD => {
                    let field = step!(self.instance_field(u16_at(&code, pc + 1)));
                    let object = self.frame.pop_reference();
                    let value = except!(objects::get_field(self.env, self.stack, self.frame, object, field.slot));
                    self.push_typed(&field, value);
                }
                inst::PUTFIELD => {
                    let field = step!(self.instance_field(u16_at(&code, pc + 1)));
                    let value = self.pop_typed(&field);
                    let object = self.frame.pop_reference();
                    except!(objects::put_field(self.env, self.stack, self.frame, object, field.slot, value));
                }

                // calls
                inst::INVOKEVIRTUAL | inst::INVOKESPECIAL | inst::INVOKESTATIC | inst::INVOKEINTERFACE => {
                    return self.invoke(op, u16_at(&code, pc + 1), pc);
                }

                // objects
                inst::NEW => {
                    let object = step!(self.new_instance(u16_at(&code, pc + 1)));
                    self.frame.push_reference(object);
                }
                inst::CHECKCAST => {
                    let object = self.frame.peek(0) as Reference;
                    step!(self.check_cast(u16_at(&code, pc + 1), object));
                }
                inst::INSTANCEOF => {
                    let object = self.frame.pop_reference();
                    let result = step!(self.instance_of(u16_at(&code, pc + 1), object));
                    self.frame.push_int(result as i32);
                }
                inst::MONITORENTER => {
                    let object = self.frame.pop_reference();
                    except!(objects::monitor_enter(self.env, self.stack, Some(&*self.frame), object));
                }
                inst::MONITOREXIT => {
                    let object = self.frame.pop_reference();
                    except!(objects::monitor_exit(self.env, self.stack, Some(&*self.frame), object));
                }

                // rejected by the verifier; reaching one is an engine bug
                other => return self.unsupported(other),
            }
            self.frame.pc = next;
        }
    }

    #[inline]
    fn load(&mut self, index: usize) {
        self.frame.push(self.frame.slots[index]);
    }

    #[inline]
    fn load_wide(&mut self, index: usize) {
        self.frame.push_wide(self.frame.slots[index]);
    }

    #[inline]
    fn store(&mut self, index: usize) {
        self.frame.slots[index] = self.frame.pop();
    }

    #[inline]
    fn store_wide(&mut self, index: usize) {
        self.frame.slots[index] = self.frame.pop_wide();
        self.frame.slots[index + 1] = 0;
    }

    #[inline]
    fn iinc(&mut self, index: usize, delta: i32) {
        let value = self.frame.slots[index] as u32 as i32;
        self.frame.slots[index] = value.wrapping_add(delta) as u32 as Slot;
    }

    fn push_all(&mut self, values: &[Slot]) {
        for &value in values {
            self.frame.push(value);
        }
    }

    fn push_typed(&mut self, field: &ResolvedField, value: Slot) {
        if field.ty.is_long() {
            self.frame.push_wide(value);
        } else {
            self.frame.push(value);
        }
    }

    fn pop_typed(&mut self, field: &ResolvedField) -> Slot {
        if field.ty.is_long() {
            self.frame.pop_wide()
        } else {
            self.frame.pop()
        }
    }

    /// Transfers control to `target`. Backward branches count towards
    /// compilation and poll for a safepoint.
    fn jump(&mut self, pc: usize, target: usize) {
        self.frame.pc = target;
        if target <= pc {
            self.back_edge();
        }
    }

    pub(crate) fn back_edge(&mut self) {
        let config = &self.env.global.config;
        if config.jit_enabled() && self.frame.method.profile.tick(config.jit_threshold) {
            self.env.global.jit.enqueue(&self.frame.method);
        }
        let (stack, frame) = (&*self.stack, &*self.frame);
        self.env.poll(&|| stack.roots(Some(frame)));
    }

    fn unsupported(&mut self, op: u8) -> Next {
        self.raise(VmError::Internal(format!(
            "unsupported instruction {op:#04x} at pc {} in {}",
            self.frame.pc, self.frame.method
        )))
    }

    pub(crate) fn raise(&mut self, error: VmError) -> Next {
        Next::Exception(objects::raise(self.env, self.stack, Some(&*self.frame), error))
    }

    pub(crate) fn vm<T>(&mut self, result: VmResult<T>) -> Step<T> {
        result.map_err(|error| self.raise(error))
    }

    pub(crate) fn divide_by_zero(&mut self) -> Exception {
        objects::throw_new(
            self.env,
            self.stack,
            Some(&*self.frame),
            "java/lang/ArithmeticException",
            Some("/ by zero"),
        )
    }

    pub(crate) fn ldc(&mut self, index: u16) -> Step<Value> {
        let class = Arc::clone(&self.frame.class);
        let constant = self.vm(class.constant_or_err(index))?;
        let value = match constant {
            ConstantPoolInfo::Integer(v) => Value::Int(*v),
            ConstantPoolInfo::Float(v) => Value::Float(*v),
            ConstantPoolInfo::Long(v) => Value::Long(*v),
            ConstantPoolInfo::Double(v) => Value::Double(*v),
            ConstantPoolInfo::String(info) => match info.interned.get() {
                Some(&string) => Value::Reference(string),
                None => {
                    let string = objects::intern(self.env, self.stack, Some(&*self.frame), &info.value)?;
                    let _ = info.interned.set(string);
                    Value::Reference(string)
                }
            },
            ConstantPoolInfo::Class(info) => {
                let target = self.vm(resolve::load_class(self.env, &class, info))?;
                Value::Reference(objects::mirror_of(self.env, self.stack, Some(&*self.frame), &target)?)
            }
            other => {
                return Err(self.raise(VmError::Internal(format!(
                    "{}: cannot load constant {other:?}",
                    class.name
                ))));
            }
        };
        Ok(value)
    }

    pub(crate) fn static_field(&mut self, index: u16) -> Step<ResolvedField> {
        let class = Arc::clone(&self.frame.class);
        let field = self.vm(resolve::field(self.env, &class, index, true))?;
        if resolve::needs_initialization(self.env, &field.class) {
            return Err(Next::Initialize(Arc::clone(&field.class)));
        }
        Ok(field)
    }

    pub(crate) fn instance_field(&mut self, index: u16) -> Step<ResolvedField> {
        let class = Arc::clone(&self.frame.class);
        self.vm(resolve::field(self.env, &class, index, false))
    }

    pub(crate) fn new_instance(&mut self, index: u16) -> Step<Reference> {
        let current = Arc::clone(&self.frame.class);
        let class = self.vm(resolve::class(self.env, &current, index))?;
        if resolve::needs_initialization(self.env, &class) {
            return Err(Next::Initialize(class));
        }
        Ok(objects::new_object(self.env, self.stack, Some(&*self.frame), &class)?)
    }

    pub(crate) fn new_primitive_array(&mut self, atype: u8, length: i32) -> Step<Reference> {
        let Some(name) = primitive_array_name(atype) else {
            return Err(self.raise(VmError::Internal(format!("bad array type {atype}"))));
        };
        let class = self.vm(self.env.global.registry.resolve(name))?;
        Ok(objects::new_array(self.env, self.stack, Some(&*self.frame), &class, length)?)
    }

    pub(crate) fn new_reference_array(&mut self, index: u16, length: i32) -> Step<Reference> {
        let current = Arc::clone(&self.frame.class);
        let component = self.vm(resolve::class(self.env, &current, index))?;
        let class = self.vm(self.env.global.registry.array_class_of(&component))?;
        Ok(objects::new_array(self.env, self.stack, Some(&*self.frame), &class, length)?)
    }

    pub(crate) fn new_multi_array(&mut self, index: u16, lengths: &[i32]) -> Step<Reference> {
        let current = Arc::clone(&self.frame.class);
        let class = self.vm(resolve::class(self.env, &current, index))?;
        Ok(objects::new_multi_array(self.env, self.stack, Some(&*self.frame), &class, lengths)?)
    }

    pub(crate) fn check_cast(&mut self, index: u16, object: Reference) -> Step<()> {
        if object == 0 {
            return Ok(());
        }
        let current = Arc::clone(&self.frame.class);
        let class = self.vm(resolve::class(self.env, &current, index))?;
        Ok(objects::check_cast(self.env, self.stack, self.frame, object, &class)?)
    }

    pub(crate) fn instance_of(&mut self, index: u16, object: Reference) -> Step<bool> {
        if object == 0 {
            return Ok(false);
        }
        let current = Arc::clone(&self.frame.class);
        let class = self.vm(resolve::class(self.env, &current, index))?;
        Ok(objects::instance_of(self.env, object, &class)?)
    }

    /// The `invoke*` instruction `op` at `pc`. Arguments stay on the stack
    /// for [`call::invoke`] to take.
    pub(crate) fn invoke(&mut self, op: u8, index: u16, pc: usize) -> Next {
        match self.select_target(op, index, pc) {
            Ok(method) => Next::Invoke(method),
            Err(next) => next,
        }
    }

    fn select_target(&mut self, op: u8, index: u16, pc: usize) -> Step<Arc<Method>> {
        let current = Arc::clone(&self.frame.class);
        let method = self.vm(resolve::method(self.env, &current, index))?;
        if op == inst::INVOKESTATIC {
            self.vm(resolve::expect_static(&method, true))?;
            let class = self.vm(
                method
                    .declaring_class()
                    .ok_or_else(|| VmError::Internal(format!("{method} outlived its class"))),
            )?;
            if resolve::needs_initialization(self.env, &class) {
                return Err(Next::Initialize(class));
            }
            return Ok(method);
        }
        self.vm(resolve::expect_static(&method, false))?;
        let receiver = self.frame.peek(method.arg_slots - 1) as Reference;
        if receiver == 0 {
            return Err(objects::null_pointer(self.env, self.stack, Some(&*self.frame)).into());
        }
        if op == inst::INVOKESPECIAL {
            return Ok(resolve::select_special(&current, &method));
        }
        let class = Arc::clone(&objects::deref(self.env, receiver)?.class);
        if self.env.global.config.jit_enabled() {
            self.frame.method.profile.record_receiver(pc as u32, &class);
        }
        let selected = if op == inst::INVOKEINTERFACE {
            resolve::select_interface(&class, &method)
        } else {
            resolve::select_virtual(&class, &method)
        };
        self.vm(selected)
    }
}

/// Whether the current thread stops for the debugger before each
/// instruction of `method`.
pub(crate) fn is_watched(env: &ThreadEnv, method: &Method) -> bool {
    env.thread.single_step.load(Ordering::Relaxed) || method.has_breakpoints.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn switch_code(pc: usize, words: &[i32]) -> Vec<u8> {
        let mut code = vec![inst::NOP; pc];
        code.push(inst::TABLESWITCH);
        while code.len() % 4 != 0 {
            code.push(0);
        }
        for word in words {
            code.extend_from_slice(&word.to_be_bytes());
        }
        code
    }

    #[test]
    fn test_table_switch_target() {
        // default +100, keys 1..=3
        let code = switch_code(1, &[100, 1, 3, 10, 20, 30]);
        assert_eq!(table_switch_target(&code, 1, 0), 101);
        assert_eq!(table_switch_target(&code, 1, 1), 11);
        assert_eq!(table_switch_target(&code, 1, 3), 31);
        assert_eq!(table_switch_target(&code, 1, 4), 101);
        assert_eq!(table_switch_target(&code, 1, i32::MIN), 101);
    }

    #[test]
    fn test_lookup_switch_target() {
        let mut code = switch_code(0, &[50, 3, -5, 8, 0, 12, 1000, 16]);
        code[0] = inst::LOOKUPSWITCH;
        assert_eq!(lookup_switch_target(&code, 0, -5), 8);
        assert_eq!(lookup_switch_target(&code, 0, 0), 12);
        assert_eq!(lookup_switch_target(&code, 0, 1000), 16);
        assert_eq!(lookup_switch_target(&code, 0, 7), 50);
    }

    #[test]
    fn test_primitive_array_names() {
        assert_eq!(primitive_array_name(array_type::T_INT), Some("[I"));
        assert_eq!(primitive_array_name(array_type::T_BOOLEAN), Some("[Z"));
        assert_eq!(primitive_array_name(3), None);
    }
}
