#![allow(dead_code)]

use anyhow::Result;
use hashbrown::HashSet;

use escalar::cfg::{FuncBody, InstKind, SafepointId, Shape};
use escalar::ea::{self, Config, Report};
use escalar::interp::{CallOutcome, Exit, Heap, Host, Interpreter, RtValue};
use escalar::program::{CalleeId, ClassId, Program};

pub fn init() {
    let _ = pretty_env_logger::try_init();
}

/// Records every call and returns default values, optionally throwing from selected callees.
#[derive(Default)]
pub struct TestHost {
    pub calls: Vec<(CalleeId, Vec<RtValue>)>,
    pub throwing: HashSet<CalleeId>,
    pub exception_class: Option<ClassId>,
}

impl TestHost {
    pub fn throwing(callee: CalleeId, exception_class: ClassId) -> Self {
        Self {
            throwing: [callee].into_iter().collect(),
            exception_class: Some(exception_class),
            ..Default::default()
        }
    }
}

impl Host for TestHost {
    fn call(
        &mut self,
        program: &Program,
        heap: &mut Heap,
        callee: CalleeId,
        args: &[RtValue],
    ) -> Result<CallOutcome> {
        self.calls.push((callee, args.to_vec()));

        if let (true, Some(class_id)) = (self.throwing.contains(&callee), self.exception_class) {
            let exception = heap.alloc(program, Shape::Instance(class_id));

            return Ok(CallOutcome::Throw(RtValue::Ref(exception)));
        }

        Ok(CallOutcome::Return(
            program.callees[callee].ret.map(|ty| ty.default_value().into()),
        ))
    }
}

pub struct Run {
    pub exit: Exit,
    pub heap: Heap,
    pub host: TestHost,
}

pub fn execute(
    program: &Program,
    body: &FuncBody,
    args: &[RtValue],
    deopt_at: Option<SafepointId>,
    host: TestHost,
) -> Run {
    let mut heap = Heap::new();
    let mut host = host;
    let mut interpreter = Interpreter::new(program, body);

    if let Some(safepoint_id) = deopt_at {
        interpreter = interpreter.force_deopt(safepoint_id);
    }

    let exit = interpreter
        .run(&mut heap, &mut host, args)
        .unwrap_or_else(|e| panic!("execution failed: {e:#}\n{body}"));

    Run { exit, heap, host }
}

/// Runs the pass on a copy of `body` with verification on.
pub fn optimize(program: &Program, body: &FuncBody, config: &Config) -> (FuncBody, Report) {
    let mut optimized = body.clone();
    let report = ea::run(program, &mut optimized, &config.clone().with_verify(true));
    optimized
        .verify(program)
        .unwrap_or_else(|e| panic!("the optimized body is malformed: {e}\n{optimized}"));

    (optimized, report)
}

pub fn allocation_count(body: &FuncBody) -> usize {
    body.blocks
        .values()
        .flat_map(|block| &block.body)
        .filter(|&&inst_id| {
            matches!(
                body.insts[inst_id].kind,
                InstKind::New(_) | InstKind::NewArray { .. }
            )
        })
        .count()
}

pub fn monitor_count(body: &FuncBody) -> usize {
    body.blocks
        .values()
        .flat_map(|block| &block.body)
        .filter(|&&inst_id| {
            matches!(
                body.insts[inst_id].kind,
                InstKind::MonitorEnter(_) | InstKind::MonitorExit(_)
            )
        })
        .count()
}

/// Compares two runs: their exits, every global, and the arguments every call received.
pub fn assert_same(program: &Program, expected: &Run, actual: &Run) {
    assert!(
        expected.exit.equiv(&expected.heap, &actual.exit, &actual.heap),
        "exits differ: {:?} vs {:?}",
        expected.exit,
        actual.exit,
    );

    for global_id in program.globals.keys() {
        assert!(
            expected.heap.equiv(
                expected.heap.global(program, global_id),
                &actual.heap,
                actual.heap.global(program, global_id),
            ),
            "global {} differs",
            program.globals[global_id].name,
        );
    }

    assert_eq!(expected.host.calls.len(), actual.host.calls.len(), "call counts differ");

    for ((expected_callee, expected_args), (actual_callee, actual_args)) in
        expected.host.calls.iter().zip(&actual.host.calls)
    {
        assert_eq!(expected_callee, actual_callee);
        assert_eq!(expected_args.len(), actual_args.len());

        for (&lhs, &rhs) in expected_args.iter().zip(actual_args) {
            assert!(
                expected.heap.equiv(lhs, &actual.heap, rhs),
                "arguments to {} differ",
                program.callees[*expected_callee].name,
            );
        }
    }
}

/// Runs both bodies on `args` and checks that they behave the same.
///
/// Returns the runs of the original and the optimized body.
pub fn assert_equivalent(
    program: &Program,
    original: &FuncBody,
    optimized: &FuncBody,
    args: &[RtValue],
) -> (Run, Run) {
    assert_equivalent_with(program, original, optimized, args, None, TestHost::default)
}

pub fn assert_equivalent_with(
    program: &Program,
    original: &FuncBody,
    optimized: &FuncBody,
    args: &[RtValue],
    deopt_at: Option<SafepointId>,
    host: impl Fn() -> TestHost,
) -> (Run, Run) {
    let expected = execute(program, original, args, deopt_at, host());
    let actual = execute(program, optimized, args, deopt_at, host());
    assert_same(program, &expected, &actual);

    (expected, actual)
}

pub fn int(value: i32) -> RtValue {
    RtValue::Int(value)
}
