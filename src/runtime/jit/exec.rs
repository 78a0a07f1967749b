//! Runs register code. Anything beyond arithmetic and control flow goes
//! through the interpreter's helpers, with the frame's `ip`, `pc` and `sp`
//! brought up to date first so it looks like an interpreted frame stopped
//! at the same instruction.

use std::sync::Arc;

use super::code::{CompiledCode, Compare, Cond, Conversion, DivOp, FloatOp, IntOp, Op, Operand, Width};
use crate::runtime::{
    Reference, Slot,
    instructions as inst,
    interpreter::{
        InterpreterEnv, Next, arith,
        frame::{CallStack, Frame},
        lookup_switch_target, objects, resolve, table_switch_target,
    },
    thread::ThreadEnv,
};

#[inline]
fn read(slots: &[Slot], operand: Operand) -> Slot {
    match operand {
        Operand::Slot(slot) => slots[slot as usize],
        Operand::Const(value) => value,
    }
}

#[inline]
fn int(slot: Slot) -> i32 {
    slot as u32 as i32
}

#[inline]
fn float(slot: Slot) -> f32 {
    f32::from_bits(slot as u32)
}

fn int_op(op: IntOp, a: i32, b: i32) -> i32 {
    match op {
        IntOp::Add => a.wrapping_add(b),
        IntOp::Sub => a.wrapping_sub(b),
        IntOp::Mul => a.wrapping_mul(b),
        IntOp::And => a & b,
        IntOp::Or => a | b,
        IntOp::Xor => a ^ b,
        IntOp::Shl => arith::ishl(a, b),
        IntOp::Shr => arith::ishr(a, b),
        IntOp::Ushr => arith::iushr(a, b),
    }
}

/// Shift distances are ints, other right operands longs.
fn long_op(op: IntOp, a: i64, b: Slot) -> i64 {
    match op {
        IntOp::Add => a.wrapping_add(b as i64),
        IntOp::Sub => a.wrapping_sub(b as i64),
        IntOp::Mul => a.wrapping_mul(b as i64),
        IntOp::And => a & b as i64,
        IntOp::Or => a | b as i64,
        IntOp::Xor => a ^ b as i64,
        IntOp::Shl => arith::lshl(a, int(b)),
        IntOp::Shr => arith::lshr(a, int(b)),
        IntOp::Ushr => arith::lushr(a, int(b)),
    }
}

fn float_op(op: FloatOp, a: f32, b: f32) -> f32 {
    match op {
        FloatOp::Add => a + b,
        FloatOp::Sub => a - b,
        FloatOp::Mul => a * b,
        FloatOp::Div => a / b,
        FloatOp::Rem => arith::frem(a, b),
    }
}

fn double_op(op: FloatOp, a: f64, b: f64) -> f64 {
    match op {
        FloatOp::Add => a + b,
        FloatOp::Sub => a - b,
        FloatOp::Mul => a * b,
        FloatOp::Div => a / b,
        FloatOp::Rem => arith::drem(a, b),
    }
}

fn convert(conversion: Conversion, a: Slot) -> Slot {
    match conversion {
        Conversion::I2L => int(a) as i64 as Slot,
        Conversion::I2F => (int(a) as f32).to_bits() as Slot,
        Conversion::I2D => (int(a) as f64).to_bits(),
        Conversion::L2I => a as i64 as i32 as u32 as Slot,
        Conversion::L2F => (a as i64 as f32).to_bits() as Slot,
        Conversion::L2D => (a as i64 as f64).to_bits(),
        Conversion::F2I => arith::f2i(float(a)) as u32 as Slot,
        Conversion::F2L => arith::f2l(float(a)) as Slot,
        Conversion::F2D => (float(a) as f64).to_bits(),
        Conversion::D2I => arith::d2i(f64::from_bits(a)) as u32 as Slot,
        Conversion::D2L => arith::d2l(f64::from_bits(a)) as Slot,
        Conversion::D2F => (f64::from_bits(a) as f32).to_bits() as Slot,
        Conversion::I2B => int(a) as i8 as i32 as u32 as Slot,
        Conversion::I2C => int(a) as u16 as i32 as u32 as Slot,
        Conversion::I2S => int(a) as i16 as i32 as u32 as Slot,
    }
}

fn compare(compare: Compare, a: Slot, b: Slot) -> i32 {
    match compare {
        Compare::Long => arith::lcmp(a as i64, b as i64),
        Compare::FloatL => arith::fcmp(float(a), float(b), -1),
        Compare::FloatG => arith::fcmp(float(a), float(b), 1),
        Compare::DoubleL => arith::fcmp(f64::from_bits(a), f64::from_bits(b), -1),
        Compare::DoubleG => arith::fcmp(f64::from_bits(a), f64::from_bits(b), 1),
    }
}

fn holds(cond: Cond, a: Slot, b: Slot) -> bool {
    let (x, y) = (int(a), int(b));
    match cond {
        Cond::Eq => x == y,
        Cond::Ne => x != y,
        Cond::Lt => x < y,
        Cond::Ge => x >= y,
        Cond::Gt => x > y,
        Cond::Le => x <= y,
        Cond::RefEq => a as Reference == b as Reference,
        Cond::RefNe => a as Reference != b as Reference,
    }
}

/// Runs `frame` from op `frame.ip` until it calls, returns, throws or needs
/// a class initialized.
pub(crate) fn execute(env: &ThreadEnv, stack: &mut CallStack, frame: &mut Frame, code: &CompiledCode) -> Next {
    let mut ip = frame.ip;

    macro_rules! sync {
        () => {
            frame.ip = ip;
            frame.pc = code.pc_at(ip) as usize;
        };
    }
    macro_rules! step {
        ($expr:expr $(,)?) => {
            match $expr {
                ::std::result::Result::Ok(val) => val,
                ::std::result::Result::Err(next) => return next,
            }
        };
    }
    macro_rules! except {
        ($expr:expr $(,)?) => {
            match $expr {
                ::std::result::Result::Ok(val) => val,
                ::std::result::Result::Err(err) => return Next::Exception(err),
            }
        };
    }
    macro_rules! helpers {
        () => {
            InterpreterEnv::new(env, stack, frame)
        };
    }
    macro_rules! jump {
        ($target:expr, $poll:expr) => {{
            ip = $target as usize;
            if $poll {
                sync!();
                let (stack, frame) = (&*stack, &*frame);
                env.poll(&|| stack.roots(Some(frame)));
            }
            continue;
        }};
    }

    loop {
        let slots: &mut [Slot] = &mut frame.slots;
        match &code.ops[ip] {
            Op::Move { dst, src } => slots[*dst as usize] = read(slots, *src),
            Op::Int { op, dst, a, b } => {
                let result = int_op(*op, int(read(slots, *a)), int(read(slots, *b)));
                slots[*dst as usize] = result as u32 as Slot;
            }
            Op::Long { op, dst, a, b } => {
                let result = long_op(*op, read(slots, *a) as i64, read(slots, *b));
                slots[*dst as usize] = result as Slot;
            }
            Op::Float { op, dst, a, b } => {
                let result = float_op(*op, float(read(slots, *a)), float(read(slots, *b)));
                slots[*dst as usize] = result.to_bits() as Slot;
            }
            Op::Double { op, dst, a, b } => {
                let result = double_op(
                    *op,
                    f64::from_bits(read(slots, *a)),
                    f64::from_bits(read(slots, *b)),
                );
                slots[*dst as usize] = result.to_bits();
            }
            Op::Divide { width, op, dst, a, b } => {
                let (a, b) = (read(slots, *a), read(slots, *b));
                let result = match (width, op) {
                    (Width::Long, DivOp::Div) => arith::ldiv(a as i64, b as i64).map(|v| v as Slot),
                    (Width::Long, DivOp::Rem) => arith::lrem(a as i64, b as i64).map(|v| v as Slot),
                    (_, DivOp::Div) => arith::idiv(int(a), int(b)).map(|v| v as u32 as Slot),
                    (_, DivOp::Rem) => arith::irem(int(a), int(b)).map(|v| v as u32 as Slot),
                };
                match result {
                    Some(value) => slots[*dst as usize] = value,
                    None => {
                        sync!();
                        return Next::Exception(helpers!().divide_by_zero());
                    }
                }
            }
            Op::Negate { width, dst, a } => {
                let a = read(slots, *a);
                slots[*dst as usize] = match width {
                    Width::Int => int(a).wrapping_neg() as u32 as Slot,
                    Width::Long => (a as i64).wrapping_neg() as Slot,
                    Width::Float => (-float(a)).to_bits() as Slot,
                    Width::Double => (-f64::from_bits(a)).to_bits(),
                };
            }
            Op::Convert { conversion, dst, a } => slots[*dst as usize] = convert(*conversion, read(slots, *a)),
            Op::Compare { compare: kind, dst, a, b } => {
                let result = compare(*kind, read(slots, *a), read(slots, *b));
                slots[*dst as usize] = result as u32 as Slot;
            }
            Op::Increment { local, delta } => {
                let slot = &mut slots[*local as usize];
                *slot = int(*slot).wrapping_add(*delta) as u32 as Slot;
            }
            Op::Permute { base, from } => {
                let base = *base as usize;
                let values: Vec<Slot> = from.iter().map(|&i| slots[base + i as usize]).collect();
                slots[base..base + values.len()].copy_from_slice(&values);
            }
            Op::If { cond, a, b, target, poll } => {
                if holds(*cond, read(slots, *a), read(slots, *b)) {
                    jump!(*target, *poll);
                }
            }
            Op::Goto { target, poll } => jump!(*target, *poll),
            Op::Switch { pc, key } => {
                let (pc, key) = (*pc as usize, int(read(slots, *key)));
                let target = match frame.code[pc] {
                    inst::TABLESWITCH => table_switch_target(&frame.code, pc, key),
                    _ => lookup_switch_target(&frame.code, pc, key),
                };
                jump!(code.op_at(target), target <= pc);
            }
            Op::Return { value } => {
                let value = value.map(|operand| read(slots, operand));
                sync!();
                return Next::Return(value);
            }
            Op::Throw { object } => {
                let object = read(slots, *object) as Reference;
                sync!();
                return Next::Exception(objects::athrow(env, stack, frame, object));
            }
            Op::Ldc { dst, index } => {
                sync!();
                let value = step!(helpers!().ldc(*index));
                frame.slots[*dst as usize] = value.to_slot();
            }
            Op::ArrayLoad { dst, array, index } => {
                let (array, index) = (read(slots, *array) as Reference, int(read(slots, *index)));
                sync!();
                let value = except!(objects::array_load(env, stack, frame, array, index));
                frame.slots[*dst as usize] = value;
            }
            Op::ArrayStore { array, index, value } => {
                let array = read(slots, *array) as Reference;
                let (index, value) = (int(read(slots, *index)), read(slots, *value));
                sync!();
                except!(objects::array_store(env, stack, frame, array, index, value));
            }
            Op::ArrayLength { dst, array } => {
                let array = read(slots, *array) as Reference;
                sync!();
                let length = except!(objects::array_length(env, stack, frame, array));
                frame.slots[*dst as usize] = length as u32 as Slot;
            }
            Op::NewArray { dst, atype, length } => {
                let length = int(read(slots, *length));
                sync!();
                let array = step!(helpers!().new_primitive_array(*atype, length));
                frame.slots[*dst as usize] = array as Slot;
            }
            Op::NewReferenceArray { dst, index, length } => {
                let length = int(read(slots, *length));
                sync!();
                let array = step!(helpers!().new_reference_array(*index, length));
                frame.slots[*dst as usize] = array as Slot;
            }
            Op::NewMultiArray { dst, index, lengths } => {
                let lengths: Vec<i32> = lengths.iter().map(|&length| int(read(slots, length))).collect();
                sync!();
                let array = step!(helpers!().new_multi_array(*index, &lengths));
                frame.slots[*dst as usize] = array as Slot;
            }
            Op::New { dst, index } => {
                sync!();
                let object = step!(helpers!().new_instance(*index));
                frame.slots[*dst as usize] = object as Slot;
            }
            Op::GetStatic { dst, index } => {
                sync!();
                let field = step!(helpers!().static_field(*index));
                frame.slots[*dst as usize] = field.class.get_static(field.slot);
            }
            Op::PutStatic { index, value } => {
                let value = read(slots, *value);
                sync!();
                let field = step!(helpers!().static_field(*index));
                field.class.set_static(field.slot, value);
            }
            Op::GetField { dst, index, object } => {
                let object = read(slots, *object) as Reference;
                sync!();
                let field = step!(helpers!().instance_field(*index));
                let value = except!(objects::get_field(env, stack, frame, object, field.slot));
                frame.slots[*dst as usize] = value;
            }
            Op::PutField { index, object, value } => {
                let (object, value) = (read(slots, *object) as Reference, read(slots, *value));
                sync!();
                let field = step!(helpers!().instance_field(*index));
                except!(objects::put_field(env, stack, frame, object, field.slot, value));
            }
            Op::CheckCast { index, object } => {
                let object = read(slots, *object) as Reference;
                sync!();
                step!(helpers!().check_cast(*index, object));
            }
            Op::InstanceOf { dst, index, object } => {
                let object = read(slots, *object) as Reference;
                sync!();
                let result = step!(helpers!().instance_of(*index, object));
                frame.slots[*dst as usize] = result as Slot;
            }
            Op::MonitorEnter { object } => {
                let object = read(slots, *object) as Reference;
                sync!();
                except!(objects::monitor_enter(env, stack, Some(&*frame), object));
            }
            Op::MonitorExit { object } => {
                let object = read(slots, *object) as Reference;
                sync!();
                except!(objects::monitor_exit(env, stack, Some(&*frame), object));
            }
            Op::Invoke { op, index, sp } => {
                sync!();
                frame.sp = *sp as usize;
                let pc = frame.pc;
                return helpers!().invoke(*op, *index, pc);
            }
            Op::InvokeDirect { op, index, sp, method } => {
                sync!();
                frame.sp = *sp as usize;
                if *op == inst::INVOKESTATIC {
                    // not yet initialized here: take the full path
                    if let Some(class) = method.declaring_class()
                        && resolve::needs_initialization(env, &class)
                    {
                        let pc = frame.pc;
                        return helpers!().invoke(*op, *index, pc);
                    }
                    return Next::Invoke(Arc::clone(method));
                }
                if frame.peek(method.arg_slots - 1) as Reference == 0 {
                    return Next::Exception(objects::null_pointer(env, stack, Some(&*frame)));
                }
                return Next::Invoke(Arc::clone(method));
            }
            Op::InvokeGuarded {
                op,
                index,
                sp,
                expected,
                target,
            } => {
                sync!();
                frame.sp = *sp as usize;
                let receiver = frame.peek(target.arg_slots - 1) as Reference;
                if receiver != 0
                    && let Ok(object) = objects::deref(env, receiver)
                    && Arc::ptr_eq(&object.class, expected)
                {
                    return Next::Invoke(Arc::clone(target));
                }
                let pc = frame.pc;
                return helpers!().invoke(*op, *index, pc);
            }
        }
        ip += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_ops_wrap_and_mask_shifts() {
        assert_eq!(int_op(IntOp::Add, i32::MAX, 1), i32::MIN);
        assert_eq!(int_op(IntOp::Mul, 0x10000, 0x10000), 0);
        assert_eq!(int_op(IntOp::Shl, 1, 33), 2);
        assert_eq!(int_op(IntOp::Ushr, -1, 28), 0xf);
        assert_eq!(long_op(IntOp::Shl, 1, 65), 2);
        assert_eq!(long_op(IntOp::Sub, i64::MIN, 1), i64::MAX);
    }

    #[test]
    fn test_conversions_follow_java() {
        assert_eq!(convert(Conversion::I2B, 0x1ff), u32::MAX as Slot);
        assert_eq!(convert(Conversion::I2C, (-1i32) as u32 as Slot), 0xffff);
        assert_eq!(convert(Conversion::F2I, f32::NAN.to_bits() as Slot), 0);
        assert_eq!(convert(Conversion::D2L, f64::INFINITY.to_bits()), i64::MAX as Slot);
        assert_eq!(convert(Conversion::L2I, 0x1_0000_0005), 5);
    }

    #[test]
    fn test_float_compare_nan() {
        let nan = f32::NAN.to_bits() as Slot;
        let one = 1.0f32.to_bits() as Slot;
        assert_eq!(compare(Compare::FloatL, nan, one), -1);
        assert_eq!(compare(Compare::FloatG, nan, one), 1);
        assert_eq!(compare(Compare::Long, (-1i64) as Slot, 0), -1);
    }

    #[test]
    fn test_conditions() {
        let minus_one = (-1i32) as u32 as Slot;
        assert!(holds(Cond::Lt, minus_one, 0));
        assert!(holds(Cond::RefNe, 7, 0));
        assert!(!holds(Cond::RefEq, 7, 0));
    }
}
