//! The compiled tier must be observably identical to the interpreter.

mod common;

use std::cell::RefCell;

use common::{config, vm_with};
use jvm_engine::{
    Exception, ThreadContext, Value, Vm,
    class::ClassBuilder,
    consts::{FieldAccessFlag, MethodAccessFlag, array_type},
    runtime::instructions as inst,
};
use proptest::{
    prelude::*,
    test_runner::{Config, TestRunner},
};

const CLASS: &str = "Arith";

const METHODS: &[(&str, &str)] = &[
    ("<init>", "()V"),
    ("idiv", "(II)I"),
    ("irem", "(II)I"),
    ("ldiv", "(JJ)J"),
    ("lrem", "(JJ)J"),
    ("fdiv", "(FF)F"),
    ("ddiv", "(DD)D"),
    ("mix", "(II)I"),
    ("lmix", "(JI)J"),
    ("d2i", "(D)I"),
    ("f2l", "(F)J"),
    ("sum", "(I)I"),
    ("count", "()I"),
    ("probe", "(I)I"),
    ("scaled", "(I)I"),
    ("point", "(II)I"),
];

fn arith() -> ClassBuilder {
    let mut class = ClassBuilder::new(CLASS);
    let stat = MethodAccessFlag::PUBLIC | MethodAccessFlag::STATIC;
    class
        .field(FieldAccessFlag::PRIVATE | FieldAccessFlag::STATIC, "count", "I")
        .field(FieldAccessFlag::PRIVATE, "x", "I")
        .method(MethodAccessFlag::PUBLIC, "<init>", "()V", |code| {
            code.super_init("java/lang/Object").vreturn();
        })
        .method(stat, "idiv", "(II)I", |code| {
            code.iload(0).iload(1).op(inst::IDIV).ireturn();
        })
        .method(stat, "irem", "(II)I", |code| {
            code.iload(0).iload(1).op(inst::IREM).ireturn();
        })
        .method(stat, "ldiv", "(JJ)J", |code| {
            code.lload(0).lload(2).op(inst::LDIV).lreturn();
        })
        .method(stat, "lrem", "(JJ)J", |code| {
            code.lload(0).lload(2).op(inst::LREM).lreturn();
        })
        .method(stat, "fdiv", "(FF)F", |code| {
            code.fload(0).fload(1).op(inst::FDIV).freturn();
        })
        .method(stat, "ddiv", "(DD)D", |code| {
            code.dload(0).dload(2).op(inst::DDIV).dreturn();
        })
        // (short) ((a * 31 + b) ^ (a >>> b) - (-b << a))
        .method(stat, "mix", "(II)I", |code| {
            code.iload(0).iconst(31).op(inst::IMUL).iload(1).op(inst::IADD);
            code.iload(0).iload(1).op(inst::IUSHR).op(inst::IXOR);
            code.iload(1).op(inst::INEG).iload(0).op(inst::ISHL).op(inst::ISUB);
            code.op(inst::I2S).ireturn();
        })
        // (a >> s) * 7 + (a << s) ^ (a >>> 3)
        .method(stat, "lmix", "(JI)J", |code| {
            code.lload(0).iload(2).op(inst::LSHR).lconst(7).op(inst::LMUL);
            code.lload(0).iload(2).op(inst::LSHL).op(inst::LADD);
            code.lload(0).iconst(3).op(inst::LUSHR).op(inst::LXOR).lreturn();
        })
        .method(stat, "d2i", "(D)I", |code| {
            code.dload(0).op(inst::D2I).ireturn();
        })
        .method(stat, "f2l", "(F)J", |code| {
            code.fload(0).op(inst::F2L).lreturn();
        })
        // total of i * i below n, counting iterations in a static
        .method(stat, "sum", "(I)I", |code| {
            let top = code.new_label();
            let done = code.new_label();
            code.iconst(0).istore(1).iconst(0).istore(2);
            code.bind(top).iload(2).iload(0).branch(inst::IF_ICMPGE, done);
            code.iload(1).iload(2).iload(2).op(inst::IMUL).op(inst::IADD).istore(1);
            code.getstatic(CLASS, "count", "I").iconst(1).op(inst::IADD);
            code.putstatic(CLASS, "count", "I");
            code.iinc(2, 1).goto(top);
            code.bind(done).iload(1).ireturn();
        })
        .method(stat, "count", "()I", |code| {
            code.getstatic(CLASS, "count", "I").ireturn();
        })
        // stores and reads back a[i] of an int[4]; -1 when out of bounds
        .method(stat, "probe", "(I)I", |code| {
            let start = code.new_label();
            let end = code.new_label();
            let handler = code.new_label();
            code.iconst(4).newarray(array_type::T_INT).astore(1);
            code.bind(start);
            code.aload(1).iload(0).iconst(7).op(inst::IASTORE);
            code.aload(1).iload(0).op(inst::IALOAD).ireturn();
            code.bind(end);
            code.bind(handler).pop().iconst(-1).ireturn();
            code.try_catch(start, end, handler, Some("java/lang/ArrayIndexOutOfBoundsException"));
        })
        .method(MethodAccessFlag::PUBLIC, "scaled", "(I)I", |code| {
            code.aload(0).getfield(CLASS, "x", "I").iload(1).op(inst::IMUL).ireturn();
        })
        .method(stat, "point", "(II)I", |code| {
            code.new_object(CLASS).dup().invokespecial(CLASS, "<init>", "()V").astore(2);
            code.aload(2).iload(0).putfield(CLASS, "x", "I");
            code.aload(2).iload(1).invokevirtual(CLASS, "scaled", "(I)I").ireturn();
        });
    class
}

/// What a call observably did. Floating-point results compare by bits
/// except that every NaN is the same.
#[derive(Debug, PartialEq)]
enum Outcome {
    Returned(Option<(u8, u64)>),
    Threw(String),
}

fn outcome(ctx: &ThreadContext, result: Result<Option<Value>, Exception>) -> Outcome {
    match result {
        Ok(value) => Outcome::Returned(value.map(|value| match value {
            Value::Int(v) => (0, v as u32 as u64),
            Value::Long(v) => (1, v as u64),
            Value::Float(v) if v.is_nan() => (2, u64::MAX),
            Value::Float(v) => (2, v.to_bits() as u64),
            Value::Double(v) if v.is_nan() => (3, u64::MAX),
            Value::Double(v) => (3, v.to_bits()),
            Value::Reference(_) => panic!("unexpected reference result"),
        })),
        Err(Exception::Java(throwable)) => {
            Outcome::Threw(ctx.class_name(throwable).unwrap_or_default())
        }
        Err(Exception::Vm(err)) => panic!("engine error: {err}"),
    }
}

/// The same class in two VMs: one interpreting, one with every method
/// compiled up front.
struct Tiers {
    interpreted: ThreadContext,
    compiled: ThreadContext,
    _vms: (Vm, Vm),
}

impl Tiers {
    fn new() -> Self {
        let class = arith();
        let interpreted = vm_with(config(), &[(CLASS, &class)]);
        let compiled = vm_with(config(), &[(CLASS, &class)]);
        for (name, descriptor) in METHODS {
            compiled.compile(CLASS, name, descriptor).expect("compiles");
        }
        assert_eq!(compiled.jit_stats().compiled, METHODS.len());
        Self {
            interpreted: interpreted.attach_current_thread("interpreted"),
            compiled: compiled.attach_current_thread("compiled"),
            _vms: (interpreted, compiled),
        }
    }

    /// Runs the call in both tiers and returns the shared outcome.
    fn call(&mut self, name: &str, descriptor: &str, args: &[Value]) -> Outcome {
        let expected = self.interpreted.invoke_static(CLASS, name, descriptor, args);
        let expected = outcome(&self.interpreted, expected);
        let actual = self.compiled.invoke_static(CLASS, name, descriptor, args);
        let actual = outcome(&self.compiled, actual);
        assert_eq!(expected, actual, "{name}{descriptor} with {args:?}");
        self.interpreted.clear_locals();
        self.compiled.clear_locals();
        expected
    }
}

fn int(value: i32) -> Outcome {
    Outcome::Returned(Some((0, value as u32 as u64)))
}

fn long(value: i64) -> Outcome {
    Outcome::Returned(Some((1, value as u64)))
}

fn threw(class: &str) -> Outcome {
    Outcome::Threw(class.to_string())
}

#[test]
fn test_division_edge_cases() {
    let mut tiers = Tiers::new();
    let (i, l) = (Value::Int, Value::Long);

    assert_eq!(tiers.call("idiv", "(II)I", &[i(i32::MIN), i(-1)]), int(i32::MIN));
    assert_eq!(tiers.call("irem", "(II)I", &[i(i32::MIN), i(-1)]), int(0));
    assert_eq!(tiers.call("idiv", "(II)I", &[i(-7), i(2)]), int(-3));
    assert_eq!(tiers.call("irem", "(II)I", &[i(-7), i(2)]), int(-1));
    assert_eq!(
        tiers.call("idiv", "(II)I", &[i(1), i(0)]),
        threw("java.lang.ArithmeticException")
    );
    assert_eq!(
        tiers.call("irem", "(II)I", &[i(1), i(0)]),
        threw("java.lang.ArithmeticException")
    );

    assert_eq!(tiers.call("ldiv", "(JJ)J", &[l(i64::MIN), l(-1)]), long(i64::MIN));
    assert_eq!(tiers.call("lrem", "(JJ)J", &[l(i64::MIN), l(-1)]), long(0));
    assert_eq!(
        tiers.call("ldiv", "(JJ)J", &[l(5), l(0)]),
        threw("java.lang.ArithmeticException")
    );

    let negative_infinity = Outcome::Returned(Some((3, f64::NEG_INFINITY.to_bits())));
    let d = Value::Double;
    assert_eq!(tiers.call("ddiv", "(DD)D", &[d(-1.0), d(0.0)]), negative_infinity);
    assert_eq!(tiers.call("ddiv", "(DD)D", &[d(1.0), d(-0.0)]), negative_infinity);
    assert_eq!(
        tiers.call("fdiv", "(FF)F", &[Value::Float(0.0), Value::Float(0.0)]),
        Outcome::Returned(Some((2, u64::MAX)))
    );
}

#[test]
fn test_conversions_saturate() {
    let mut tiers = Tiers::new();
    let d = Value::Double;
    assert_eq!(tiers.call("d2i", "(D)I", &[d(f64::NAN)]), int(0));
    assert_eq!(tiers.call("d2i", "(D)I", &[d(1e300)]), int(i32::MAX));
    assert_eq!(tiers.call("d2i", "(D)I", &[d(-1e300)]), int(i32::MIN));
    assert_eq!(tiers.call("d2i", "(D)I", &[d(-2.9)]), int(-2));
    assert_eq!(
        tiers.call("f2l", "(F)J", &[Value::Float(f32::INFINITY)]),
        long(i64::MAX)
    );
}

#[test]
fn test_array_bounds() {
    let mut tiers = Tiers::new();
    for index in -2..6 {
        let expected = if (0..4).contains(&index) { 7 } else { -1 };
        assert_eq!(tiers.call("probe", "(I)I", &[Value::Int(index)]), int(expected));
    }
}

#[test]
fn test_objects_and_virtual_calls() {
    let mut tiers = Tiers::new();
    assert_eq!(
        tiers.call("point", "(II)I", &[Value::Int(6), Value::Int(7)]),
        int(42)
    );
}

#[test]
fn test_tiers_agree() {
    let tiers = RefCell::new(Tiers::new());
    let mut runner = TestRunner::new(Config {
        cases: 200,
        ..Config::default()
    });

    runner
        .run(&(any::<i32>(), any::<i32>()), |(a, b)| {
            let mut tiers = tiers.borrow_mut();
            let args = [Value::Int(a), Value::Int(b)];
            tiers.call("idiv", "(II)I", &args);
            tiers.call("irem", "(II)I", &args);
            tiers.call("mix", "(II)I", &args);
            Ok(())
        })
        .unwrap();

    runner
        .run(&(any::<i64>(), any::<i64>(), any::<i32>()), |(a, b, shift)| {
            let mut tiers = tiers.borrow_mut();
            let args = [Value::Long(a), Value::Long(b)];
            tiers.call("ldiv", "(JJ)J", &args);
            tiers.call("lrem", "(JJ)J", &args);
            tiers.call("lmix", "(JI)J", &[Value::Long(a), Value::Int(shift)]);
            Ok(())
        })
        .unwrap();

    runner
        .run(&(any::<f64>(), any::<f64>(), any::<f32>()), |(a, b, f)| {
            let mut tiers = tiers.borrow_mut();
            tiers.call("ddiv", "(DD)D", &[Value::Double(a), Value::Double(b)]);
            tiers.call("fdiv", "(FF)F", &[Value::Float(f), Value::Float(b as f32)]);
            tiers.call("d2i", "(D)I", &[Value::Double(a)]);
            tiers.call("f2l", "(F)J", &[Value::Float(f)]);
            Ok(())
        })
        .unwrap();

    runner
        .run(&(0..200i32, -8..8i32), |(n, index)| {
            let mut tiers = tiers.borrow_mut();
            tiers.call("sum", "(I)I", &[Value::Int(n)]);
            let count = tiers.call("count", "()I", &[]);
            prop_assert!(matches!(count, Outcome::Returned(Some((0, _)))));
            tiers.call("probe", "(I)I", &[Value::Int(index)]);
            Ok(())
        })
        .unwrap();
}
