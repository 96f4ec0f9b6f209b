mod common;

use rstest::rstest;

use escalar::cfg::{BinOp, DebugValue, FuncBuilder, Ty};
use escalar::ea::{Config, NsrReason};
use escalar::interp::{Exit, Heap, RtValue, Thrown};
use escalar::program::Program;

use common::{
    allocation_count, assert_equivalent, assert_equivalent_with, init, int, monitor_count, optimize,
};

#[rstest]
#[case(1, 2)]
#[case(i32::MAX, 0)]
#[case(-5, i32::MIN)]
fn deoptimization_rebuilds_eliminated_objects(#[case] a: i32, #[case] b: i32) {
    init();

    let mut program = Program::new();
    let point = program.add_class("Point", None, &[("x", Ty::Int), ("y", Ty::Int)]);
    let x = program.field(point, "x").unwrap();
    let y = program.field(point, "y").unwrap();

    let mut builder = FuncBuilder::new(&program, &[Ty::Int, Ty::Int], Some(Ty::Int));
    let a_param = builder.param(0);
    let b_param = builder.param(1);
    let obj = builder.new_object(point);
    builder.store_field(obj, x, a_param);
    builder.store_field(obj, y, b_param);
    let safepoint = builder.safepoint(&[obj, a_param]);
    let lhs = builder.load_field(obj, x);
    let rhs = builder.load_field(obj, y);
    let diff = builder.binary(BinOp::Sub, lhs, rhs);
    builder.ret(Some(diff));
    let body = builder.finish();

    let (optimized, report) = optimize(&program, &body, &Config::default());

    assert_eq!(report.eliminated, [obj]);

    let recipes = &optimized.safepoints[safepoint];
    assert_eq!(recipes.objects.len(), 1);
    assert_eq!(recipes.locals[0], DebugValue::Object(0));
    assert_eq!(recipes.objects[0].fields.len(), 2);

    let (expected, actual) = assert_equivalent_with(
        &program,
        &body,
        &optimized,
        &[int(a), int(b)],
        Some(safepoint),
        Default::default,
    );

    assert_eq!(expected.heap.allocations, 1);
    assert_eq!(actual.heap.allocations, 0);
    assert_eq!(actual.heap.rematerialized, 1);

    assert_equivalent(&program, &body, &optimized, &[int(a), int(b)]);
}

#[rstest]
fn uncommon_traps_describe_eliminated_objects(#[values(0, 1)] trap: i32) {
    init();

    let mut program = Program::new();
    let counter = program.add_class("Counter", None, &[("count", Ty::Long)]);
    let count = program.field(counter, "count").unwrap();

    let mut builder = FuncBuilder::new(&program, &[Ty::Int, Ty::Long], Some(Ty::Long));
    let cond = builder.param(0);
    let start = builder.param(1);
    let obj = builder.new_object(counter);
    builder.store_field(obj, count, start);
    let trap_block = builder.create_block("trap");
    let ok_block = builder.create_block("ok");
    builder.branch(cond, trap_block, ok_block);

    builder.switch_to(trap_block);
    let safepoint = builder.deopt(&[obj]);

    builder.switch_to(ok_block);
    let loaded = builder.load_field(obj, count);
    builder.ret(Some(loaded));
    let body = builder.finish();

    let (optimized, report) = optimize(&program, &body, &Config::default());

    assert_eq!(report.eliminated, [obj]);
    assert_eq!(optimized.safepoints[safepoint].objects.len(), 1);

    let args = [int(trap), RtValue::Long(1 << 40)];
    let (_, actual) = assert_equivalent(&program, &body, &optimized, &args);

    match actual.exit {
        Exit::Deopt(ref state) => {
            assert_eq!(trap, 1);
            assert_eq!(state.safepoint, safepoint);
            assert_eq!(actual.heap.rematerialized, 1);
        }

        Exit::Return(_) => assert_eq!(trap, 0),
        ref exit => panic!("unexpected exit {exit:?}"),
    }
}

#[test]
fn cyclic_objects_share_recipes() {
    init();

    let mut program = Program::new();
    let node = program.add_class("Node", None, &[("next", Ty::Ref), ("value", Ty::Int)]);
    let next = program.field(node, "next").unwrap();
    let value = program.field(node, "value").unwrap();

    let mut builder = FuncBuilder::new(&program, &[Ty::Int], Some(Ty::Int));
    let param = builder.param(0);
    let first = builder.new_object(node);
    let second = builder.new_object(node);
    builder.store_field(first, next, second);
    builder.store_field(second, next, first);
    builder.store_field(second, value, param);
    let safepoint = builder.safepoint(&[first, second]);
    let loaded_next = builder.load_field(first, next);
    let loaded = builder.load_field(loaded_next, value);
    builder.ret(Some(loaded));
    let body = builder.finish();

    let (optimized, report) = optimize(&program, &body, &Config::default());

    assert_eq!(report.eliminated.len(), 2);
    assert_eq!(allocation_count(&optimized), 0);
    assert_eq!(optimized.safepoints[safepoint].objects.len(), 2);

    let (_, actual) = assert_equivalent_with(
        &program,
        &body,
        &optimized,
        &[int(6)],
        Some(safepoint),
        Default::default,
    );

    assert_eq!(actual.heap.rematerialized, 2);
}

#[rstest]
#[case::eliminated_object(false)]
#[case::kept_object(true)]
fn elided_locks_are_taken_again_on_deoptimization(
    #[case] unknown_index: bool,
    #[values(false, true)] deopt: bool,
) {
    init();

    let program = Program::new();
    let mut builder = FuncBuilder::new(&program, &[Ty::Int], Some(Ty::Int));
    let param = builder.param(0);
    let len = builder.int(4);
    let zero = builder.int(0);
    let index = if unknown_index { param } else { zero };
    let arr = builder.new_array(Ty::Int, len);
    builder.monitor_enter(arr);
    builder.store_elem(arr, index, param);
    let safepoint = builder.safepoint(&[arr]);
    builder.monitor_exit(arr);
    let loaded = builder.load_elem(arr, index, Ty::Int);
    builder.ret(Some(loaded));
    let body = builder.finish();

    let (optimized, report) = optimize(&program, &body, &Config::default());

    assert_eq!(report.eliminated_locks, 2);
    assert_eq!(monitor_count(&optimized), 0);
    assert!(optimized.safepoints[safepoint].monitors[0].eliminated);

    if unknown_index {
        assert_eq!(report.reason(arr), Some(NsrReason::UnknownIndex));
        assert_eq!(allocation_count(&optimized), 1);
    } else {
        assert_eq!(report.eliminated, [arr]);
    }

    let (expected, actual) = assert_equivalent_with(
        &program,
        &body,
        &optimized,
        &[int(2)],
        deopt.then_some(safepoint),
        Default::default,
    );

    if deopt {
        let (Exit::Deopt(expected_state), Exit::Deopt(actual_state)) = (&expected.exit, &actual.exit)
        else {
            panic!("both runs should deoptimize");
        };

        let locks = |heap: &Heap, value: RtValue| {
            heap.objects[value.to_ref().unwrap()].locks
        };

        assert_eq!(locks(&expected.heap, expected_state.monitors[0]), 1);
        assert_eq!(locks(&actual.heap, actual_state.monitors[0]), 1);
    }
}

#[test]
fn locks_on_escaping_objects_stay() {
    init();

    let mut program = Program::new();
    let lock = program.add_class("Lock", None, &[]);
    let global = program.add_global("lock", Ty::Ref);

    let mut builder = FuncBuilder::new(&program, &[], None);
    let obj = builder.new_object(lock);
    builder.store_global(global, obj);
    builder.monitor_enter(obj);
    builder.safepoint(&[]);
    builder.monitor_exit(obj);
    builder.ret(None);
    let body = builder.finish();

    let (optimized, report) = optimize(&program, &body, &Config::default());

    assert_eq!(report.eliminated_locks, 0);
    assert_eq!(report.reason(obj), Some(NsrReason::GlobalEscape));
    assert_eq!(monitor_count(&optimized), 2);

    assert_equivalent(&program, &body, &optimized, &[]);
}

#[test]
fn disabled_lock_elision_keeps_locked_objects() {
    init();

    let mut program = Program::new();
    let lock = program.add_class("Lock", None, &[("state", Ty::Int)]);
    let state = program.field(lock, "state").unwrap();

    let mut builder = FuncBuilder::new(&program, &[Ty::Int], Some(Ty::Int));
    let param = builder.param(0);
    let obj = builder.new_object(lock);
    builder.monitor_enter(obj);
    builder.store_field(obj, state, param);
    builder.monitor_exit(obj);
    let loaded = builder.load_field(obj, state);
    builder.ret(Some(loaded));
    let body = builder.finish();

    let config = Config::default().with_eliminate_locks(false);
    let (optimized, report) = optimize(&program, &body, &config);

    assert_eq!(report.reason(obj), Some(NsrReason::Locked));
    assert_eq!(report.eliminated_locks, 0);
    assert_eq!(monitor_count(&optimized), 2);

    assert_equivalent(&program, &body, &optimized, &[int(3)]);
}

#[derive(Debug, Clone, Copy)]
enum Locking {
    ExitOnly,
    ExitTwice,
    EnterOnOnePath,
}

#[rstest]
fn unmatched_exits_keep_their_monitors(
    #[values(Locking::ExitOnly, Locking::ExitTwice, Locking::EnterOnOnePath)] locking: Locking,
    #[values(0, 1)] cond: i32,
) {
    init();

    let mut program = Program::new();
    let lock = program.add_class("Lock", None, &[("state", Ty::Int)]);
    let state = program.field(lock, "state").unwrap();

    let mut builder = FuncBuilder::new(&program, &[Ty::Int], Some(Ty::Int));
    let param = builder.param(0);
    let obj = builder.new_object(lock);
    builder.store_field(obj, state, param);

    match locking {
        Locking::ExitOnly => {
            builder.monitor_exit(obj);
        }

        Locking::ExitTwice => {
            builder.monitor_enter(obj);
            builder.monitor_exit(obj);
            builder.monitor_exit(obj);
        }

        Locking::EnterOnOnePath => {
            let locked = builder.create_block("locked");
            let join = builder.create_block("join");
            builder.branch(param, locked, join);

            builder.switch_to(locked);
            builder.monitor_enter(obj);
            builder.br(join);

            builder.switch_to(join);
            builder.monitor_exit(obj);
        }
    }

    let loaded = builder.load_field(obj, state);
    builder.ret(Some(loaded));
    let body = builder.finish();

    let monitors = monitor_count(&body);
    let (optimized, report) = optimize(&program, &body, &Config::default());

    assert_eq!(report.reason(obj), Some(NsrReason::Locked));
    assert_eq!(report.eliminated_locks, 0);
    assert_eq!(monitor_count(&optimized), monitors);

    let (expected, _) = assert_equivalent(&program, &body, &optimized, &[int(cond)]);

    let throws = match locking {
        Locking::EnterOnOnePath => cond == 0,
        _ => true,
    };

    if throws {
        assert_eq!(expected.exit, Exit::Threw(Thrown::IllegalMonitorState));
    }
}

#[rstest]
fn nested_locks_are_taken_again_on_deoptimization(#[values(false, true)] deopt: bool) {
    init();

    let mut program = Program::new();
    let lock = program.add_class("Lock", None, &[("state", Ty::Int)]);
    let state = program.field(lock, "state").unwrap();

    let mut builder = FuncBuilder::new(&program, &[Ty::Int], Some(Ty::Int));
    let param = builder.param(0);
    let obj = builder.new_object(lock);
    builder.monitor_enter(obj);
    builder.monitor_enter(obj);
    builder.store_field(obj, state, param);
    let safepoint = builder.safepoint(&[]);
    builder.monitor_exit(obj);
    builder.monitor_exit(obj);
    let loaded = builder.load_field(obj, state);
    builder.ret(Some(loaded));
    let body = builder.finish();

    let (optimized, report) = optimize(&program, &body, &Config::default());

    assert_eq!(report.eliminated, [obj]);
    assert_eq!(report.eliminated_locks, 4);
    assert_eq!(monitor_count(&optimized), 0);

    let monitors = &optimized.safepoints[safepoint].monitors;
    assert_eq!(monitors.len(), 2);
    assert!(monitors.iter().all(|monitor| monitor.eliminated));

    let (expected, actual) = assert_equivalent_with(
        &program,
        &body,
        &optimized,
        &[int(8)],
        deopt.then_some(safepoint),
        Default::default,
    );

    if let (Exit::Deopt(expected_state), Exit::Deopt(actual_state)) = (&expected.exit, &actual.exit) {
        let locks = |heap: &Heap, value: RtValue| heap.objects[value.to_ref().unwrap()].locks;

        assert_eq!(locks(&expected.heap, expected_state.monitors[1]), 2);
        assert_eq!(locks(&actual.heap, actual_state.monitors[1]), 2);
    } else {
        assert!(!deopt);
    }
}
