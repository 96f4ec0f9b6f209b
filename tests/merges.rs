mod common;

use rstest::rstest;

use escalar::cfg::{FuncBody, FuncBuilder, InstId, SafepointId, Ty};
use escalar::ea::{self, Config, Irreducible, NsrReason, Outcome};
use escalar::program::{CalleeKind, ClassId, FieldId, GlobalId, Program};

use common::{
    allocation_count, assert_equivalent, assert_equivalent_with, init, int, optimize, TestHost,
};

fn point_program() -> (Program, ClassId, FieldId) {
    let mut program = Program::new();
    let point = program.add_class("Point", None, &[("x", Ty::Int), ("y", Ty::Int)]);
    let x = program.field(point, "x").unwrap();

    (program, point, x)
}

struct Diamond {
    body: FuncBody,
    phi: InstId,
    leaves: [InstId; 2],
    safepoint: SafepointId,
}

/// `p = cond ? new Point(arg) : new Point(7)`, observed by a safepoint and a field load.
fn diamond(program: &Program, point: ClassId, x: FieldId) -> Diamond {
    let mut builder = FuncBuilder::new(program, &[Ty::Int, Ty::Int], Some(Ty::Int));
    let cond = builder.param(0);
    let arg = builder.param(1);
    let then_block = builder.create_block("then");
    let else_block = builder.create_block("else");
    let join = builder.create_block("join");
    builder.branch(cond, then_block, else_block);

    builder.switch_to(then_block);
    let a = builder.new_object(point);
    builder.store_field(a, x, arg);
    builder.br(join);

    builder.switch_to(else_block);
    let b = builder.new_object(point);
    let seven = builder.int(7);
    builder.store_field(b, x, seven);
    builder.br(join);

    builder.switch_to(join);
    let phi = builder.phi(Ty::Ref, &[(then_block, a), (else_block, b)]);
    let safepoint = builder.safepoint(&[phi, arg]);
    let loaded = builder.load_field(phi, x);
    builder.ret(Some(loaded));

    Diamond {
        body: builder.finish(),
        phi,
        leaves: [a, b],
        safepoint,
    }
}

#[rstest]
fn diamonds_are_reduced(#[values(0, 1)] cond: i32, #[values(false, true)] deopt: bool) {
    init();

    let (program, point, x) = point_program();
    let diamond = diamond(&program, point, x);
    let (optimized, report) = optimize(&program, &diamond.body, &Config::default());

    assert_eq!(report.outcome, Outcome::Reduced);
    assert_eq!(report.reduced_merges, [diamond.phi]);
    assert_eq!((report.rounds, report.rolled_back), (1, 0));
    assert_eq!(report.eliminated.len(), 2);
    assert_eq!(allocation_count(&optimized), 0);

    let deopt_at = deopt.then_some(diamond.safepoint);
    let (_, actual) = assert_equivalent_with(
        &program,
        &diamond.body,
        &optimized,
        &[int(cond), int(-12)],
        deopt_at,
        Default::default,
    );

    assert_eq!(actual.heap.allocations, 0);
    assert_eq!(actual.heap.rematerialized, usize::from(deopt));
}

#[test]
fn disabled_merge_reduction_keeps_the_leaves() {
    init();

    let (program, point, x) = point_program();
    let diamond = diamond(&program, point, x);
    let config = Config::default().with_reduce_merges(false);
    let (optimized, report) = optimize(&program, &diamond.body, &config);

    assert!(report.reduced_merges.is_empty());
    assert!(report
        .irreducible_merges
        .contains(&(diamond.phi, Irreducible::Disabled)));

    for leaf in diamond.leaves {
        assert_eq!(report.reason(leaf), Some(NsrReason::IrreducibleMerge));
    }

    assert_equivalent(&program, &diamond.body, &optimized, &[int(1), int(3)]);
}

#[test]
fn merges_left_after_the_last_round_are_blacklisted() {
    init();

    let (program, point, x) = point_program();
    let diamond = diamond(&program, point, x);
    let config = Config::default().with_max_rounds(0);
    let (optimized, report) = optimize(&program, &diamond.body, &config);

    assert!(report.reduced_merges.is_empty());
    assert!(report
        .irreducible_merges
        .contains(&(diamond.phi, Irreducible::Blacklisted)));
    assert_eq!(allocation_count(&optimized), 2);

    for leaf in diamond.leaves {
        assert_eq!(report.reason(leaf), Some(NsrReason::IrreducibleMerge));
    }

    assert_equivalent(&program, &diamond.body, &optimized, &[int(0), int(3)]);
}

#[rstest]
fn nested_merges_are_reduced(
    #[values(0, 1)] c1: i32,
    #[values(0, 1)] c2: i32,
    #[values(0, 1)] c3: i32,
    #[values(false, true)] deopt: bool,
) {
    init();

    let (program, point, x) = point_program();
    let mut builder = FuncBuilder::new(&program, &[Ty::Int, Ty::Int, Ty::Int], Some(Ty::Int));
    let conds = [builder.param(0), builder.param(1), builder.param(2)];

    let leaf = |builder: &mut FuncBuilder<'_>, value: i32| {
        let obj = builder.new_object(point);
        let value = builder.int(value);
        builder.store_field(obj, x, value);

        obj
    };

    let l1 = builder.create_block("l1");
    let r1 = builder.create_block("r1");
    let l2 = builder.create_block("l2");
    let r2 = builder.create_block("r2");
    let l3 = builder.create_block("l3");
    let r3 = builder.create_block("r3");
    let m3 = builder.create_block("m3");
    let m2 = builder.create_block("m2");
    let m1 = builder.create_block("m1");
    builder.branch(conds[0], l1, r1);

    builder.switch_to(l1);
    let a = leaf(&mut builder, 1);
    builder.br(m1);

    builder.switch_to(r1);
    builder.branch(conds[1], l2, r2);

    builder.switch_to(l2);
    let b = leaf(&mut builder, 2);
    builder.br(m2);

    builder.switch_to(r2);
    builder.branch(conds[2], l3, r3);

    builder.switch_to(l3);
    let c = leaf(&mut builder, 3);
    builder.br(m3);

    builder.switch_to(r3);
    let d = leaf(&mut builder, 4);
    builder.br(m3);

    builder.switch_to(m3);
    let p3 = builder.phi(Ty::Ref, &[(l3, c), (r3, d)]);
    builder.br(m2);

    builder.switch_to(m2);
    let p2 = builder.phi(Ty::Ref, &[(l2, b), (m3, p3)]);
    builder.br(m1);

    builder.switch_to(m1);
    let p1 = builder.phi(Ty::Ref, &[(l1, a), (m2, p2)]);
    let safepoint = builder.safepoint(&[p1]);
    let loaded = builder.load_field(p1, x);
    builder.ret(Some(loaded));
    let body = builder.finish();

    let (optimized, report) = optimize(&program, &body, &Config::default());

    assert_eq!(report.reduced_merges.len(), 3);
    assert_eq!(report.eliminated.len(), 4);
    assert_eq!(allocation_count(&optimized), 0);

    let deopt_at = deopt.then_some(safepoint);
    let (_, actual) = assert_equivalent_with(
        &program,
        &body,
        &optimized,
        &[int(c1), int(c2), int(c3)],
        deopt_at,
        Default::default,
    );

    assert_eq!(actual.heap.rematerialized, usize::from(deopt));
}

/// Merges a published object with a local one; the published one is written through a
/// global either before the branch or after the merge.
fn published_merge(
    program: &Program,
    point: ClassId,
    x: FieldId,
    global: GlobalId,
    store_after: bool,
) -> (FuncBody, InstId, InstId) {
    let mut builder = FuncBuilder::new(program, &[Ty::Int], Some(Ty::Int));
    let cond = builder.param(0);
    let forty_two = builder.int(42);
    let a = builder.new_object(point);
    builder.store_global(global, a);

    let overwrite = |builder: &mut FuncBuilder<'_>| {
        let shared = builder.load_global(global);
        builder.store_field(shared, x, forty_two);
    };

    if !store_after {
        overwrite(&mut builder);
    }

    let then_block = builder.create_block("then");
    let else_block = builder.create_block("else");
    let join = builder.create_block("join");
    builder.branch(cond, then_block, else_block);

    builder.switch_to(then_block);
    builder.br(join);

    builder.switch_to(else_block);
    let b = builder.new_object(point);
    let seven = builder.int(7);
    builder.store_field(b, x, seven);
    builder.br(join);

    builder.switch_to(join);
    let phi = builder.phi(Ty::Ref, &[(then_block, a), (else_block, b)]);

    if store_after {
        overwrite(&mut builder);
    }

    let loaded = builder.load_field(phi, x);
    builder.ret(Some(loaded));

    (builder.finish(), phi, b)
}

#[rstest]
#[case::store_before_the_branch(false)]
#[case::store_after_the_merge(true)]
fn stores_through_aliases_block_reduction(#[case] store_after: bool) {
    init();

    let (mut program, point, x) = point_program();
    let global = program.add_global("shared", Ty::Ref);
    let (body, phi, local) = published_merge(&program, point, x, global, store_after);

    let (optimized, report) = optimize(&program, &body, &Config::default());

    if store_after {
        assert!(report
            .irreducible_merges
            .contains(&(phi, Irreducible::Clobbered)));
        assert_eq!(report.reason(local), Some(NsrReason::IrreducibleMerge));
        assert_eq!(allocation_count(&optimized), 2);
    } else {
        assert_eq!(report.reduced_merges, [phi]);
        assert_eq!(report.eliminated, [local]);
        assert_eq!(allocation_count(&optimized), 1);
    }

    for cond in [0, 1] {
        assert_equivalent(&program, &body, &optimized, &[int(cond)]);
    }
}

#[rstest]
fn null_checks_of_merges_are_reduced(#[values(0, 1)] cond: i32, #[values(false, true)] deopt: bool) {
    init();

    let (program, point, x) = point_program();
    let mut builder = FuncBuilder::new(&program, &[Ty::Int], Some(Ty::Int));
    let cond_param = builder.param(0);
    let null = builder.null();
    let then_block = builder.create_block("then");
    let else_block = builder.create_block("else");
    let join = builder.create_block("join");
    builder.branch(cond_param, then_block, else_block);

    builder.switch_to(then_block);
    let obj = builder.new_object(point);
    builder.store_field(obj, x, cond_param);
    builder.br(join);

    builder.switch_to(else_block);
    builder.br(join);

    builder.switch_to(join);
    let phi = builder.phi(Ty::Ref, &[(then_block, obj), (else_block, null)]);
    let safepoint = builder.safepoint(&[phi]);
    let is_null = builder.ref_eq(phi, null);
    builder.ret(Some(is_null));
    let body = builder.finish();

    let (optimized, report) = optimize(&program, &body, &Config::default());

    assert_eq!(report.reduced_merges, [phi]);
    assert_eq!(report.eliminated, [obj]);

    assert_equivalent_with(
        &program,
        &body,
        &optimized,
        &[int(cond)],
        deopt.then_some(safepoint),
        Default::default,
    );
}

#[rstest]
fn merges_across_exception_edges_are_reduced(#[values(false, true)] throws: bool) {
    init();

    let (mut program, point, x) = point_program();
    let failure = program.add_class("Failure", None, &[]);
    let risky = program.add_callee("risky", vec![], None, CalleeKind::Opaque);

    let mut builder = FuncBuilder::new(&program, &[Ty::Int], Some(Ty::Int));
    let arg = builder.param(0);
    let normal = builder.create_block("normal");
    let unwind = builder.create_block("unwind");
    let join = builder.create_block("join");
    let a = builder.new_object(point);
    builder.store_field(a, x, arg);
    builder.invoke(risky, &[], &[a], normal, unwind);

    builder.switch_to(normal);
    builder.br(join);

    builder.switch_to(unwind);
    builder.exception();
    let b = builder.new_object(point);
    let two = builder.int(2);
    builder.store_field(b, x, two);
    builder.br(join);

    builder.switch_to(join);
    let phi = builder.phi(Ty::Ref, &[(normal, a), (unwind, b)]);
    let loaded = builder.load_field(phi, x);
    builder.ret(Some(loaded));
    let body = builder.finish();

    let (optimized, report) = optimize(&program, &body, &Config::default());

    assert_eq!(report.reduced_merges, [phi]);
    assert_eq!(report.eliminated.len(), 2);

    let host = || {
        if throws {
            TestHost::throwing(risky, failure)
        } else {
            TestHost::default()
        }
    };

    let (expected, actual) =
        assert_equivalent_with(&program, &body, &optimized, &[int(40)], None, host);

    assert_eq!(expected.host.calls.len(), 1);
    assert_eq!(actual.heap.allocations, 0);
}

#[rstest]
#[case::field_loads_only(false)]
#[case::type_check(true)]
fn polymorphic_merges(#[case] type_check: bool) {
    init();

    let mut program = Program::new();
    let base = program.add_class("Base", None, &[("x", Ty::Int)]);
    let derived = program.add_class("Derived", Some(base), &[("y", Ty::Int)]);
    let x = program.field(base, "x").unwrap();

    let mut builder = FuncBuilder::new(&program, &[Ty::Int], Some(Ty::Int));
    let cond = builder.param(0);
    let then_block = builder.create_block("then");
    let else_block = builder.create_block("else");
    let join = builder.create_block("join");
    builder.branch(cond, then_block, else_block);

    builder.switch_to(then_block);
    let a = builder.new_object(base);
    let one = builder.int(1);
    builder.store_field(a, x, one);
    builder.br(join);

    builder.switch_to(else_block);
    let b = builder.new_object(derived);
    let two = builder.int(2);
    builder.store_field(b, x, two);
    builder.br(join);

    builder.switch_to(join);
    let phi = builder.phi(Ty::Ref, &[(then_block, a), (else_block, b)]);
    let mut result = builder.load_field(phi, x);

    if type_check {
        let is_derived = builder.instance_of(phi, derived);
        result = builder.add(result, is_derived);
    }

    builder.ret(Some(result));
    let body = builder.finish();

    let (optimized, report) = optimize(&program, &body, &Config::default());

    if type_check {
        assert!(report
            .irreducible_merges
            .contains(&(phi, Irreducible::Polymorphic)));
        assert_eq!(allocation_count(&optimized), 2);
    } else {
        assert_eq!(report.reduced_merges, [phi]);
        assert_eq!(allocation_count(&optimized), 0);
    }

    for cond in [0, 1] {
        assert_equivalent(&program, &body, &optimized, &[int(cond)]);
    }
}

#[test]
fn reduced_bodies_are_stable() {
    init();

    let (mut program, point, x) = point_program();
    let global = program.add_global("published", Ty::Ref);

    let mut builder = FuncBuilder::new(&program, &[Ty::Int], Some(Ty::Int));
    let cond = builder.param(0);
    let then_block = builder.create_block("then");
    let else_block = builder.create_block("else");
    let join = builder.create_block("join");
    builder.branch(cond, then_block, else_block);

    builder.switch_to(then_block);
    let a = builder.new_object(point);
    let one = builder.int(1);
    builder.store_field(a, x, one);
    builder.store_global(global, a);
    builder.br(join);

    builder.switch_to(else_block);
    let b = builder.new_object(point);
    let two = builder.int(2);
    builder.store_field(b, x, two);
    builder.br(join);

    builder.switch_to(join);
    let phi = builder.phi(Ty::Ref, &[(then_block, a), (else_block, b)]);
    let safepoint = builder.safepoint(&[phi]);
    let loaded = builder.load_field(phi, x);
    builder.ret(Some(loaded));
    let body = builder.finish();

    let (once, first) = optimize(&program, &body, &Config::default());

    assert_eq!(first.reduced_merges, [phi]);
    assert_eq!(first.eliminated, [b]);
    assert_eq!(first.reason(a), Some(NsrReason::GlobalEscape));

    let mut twice = once.clone();
    let second = ea::run(&program, &mut twice, &Config::default().with_verify(true));

    assert_eq!(second.outcome, Outcome::NothingToDo);
    assert!(second.eliminated.is_empty());
    assert_eq!(twice.to_string(), once.to_string());

    for cond in [0, 1] {
        for deopt_at in [None, Some(safepoint)] {
            assert_equivalent_with(&program, &body, &twice, &[int(cond)], deopt_at, Default::default);
        }
    }
}
