use std::{cell::RefCell, rc::Rc, time::Duration};

use tagrun::{
    ast::{build::*, Flavor, Node},
    config::RuntimeConfig,
    connection::Transcript,
    interpreter::Value,
    runtime::Runtime,
};

fn runtime_with(config: RuntimeConfig) -> (Rc<Runtime>, Rc<RefCell<Transcript>>) {
    let transcript = Rc::new(RefCell::new(Transcript::new()));
    let runtime = Runtime::new(config, transcript.clone());
    (runtime, transcript)
}

fn runtime() -> (Rc<Runtime>, Rc<RefCell<Transcript>>) {
    runtime_with(RuntimeConfig::default())
}

/// Runs `program` to completion and returns the transcript.
fn run(program: Rc<Node>) -> Transcript {
    let (runtime, transcript) = runtime();
    runtime.interpret(&program);
    runtime.shutdown();
    transcript.take()
}

fn echo(text: &str) -> Rc<Node> {
    apply("echo", vec![string(text)])
}

fn tag_new(name: &str) -> Rc<Node> {
    send(ident("Tag"), "new", vec![string(name)])
}

fn sleep(seconds: f64) -> Rc<Node> {
    apply("sleep", vec![float(seconds)])
}

fn number(runtime: &Runtime, name: &str) -> f64 {
    match runtime.global(name) {
        Some(Value::Float(v)) => v,
        other => panic!("{name} should be a number, found {other:?}"),
    }
}

/// Busy cycles cost a millisecond of virtual time each, so clock readings are
/// checked against a window.
fn assert_now_near(runtime: &Runtime, seconds: f64) {
    let now = runtime.scheduler().now().as_secs_f64();
    assert!(
        (seconds..seconds + 0.1).contains(&now),
        "clock at {now}s, expected about {seconds}s"
    );
}

#[test]
fn test_toplevel_results_are_reported() {
    let transcript = run(toplevel(vec![float(1.0), float(2.0), float(3.0)]));
    assert_eq!(transcript.on("result"), vec!["1", "2", "3"]);
    assert!(transcript.on("error").is_empty());
}

#[test]
fn test_quiet_runtime_reports_nothing() {
    let (runtime, transcript) = runtime_with(RuntimeConfig {
        report_results: false,
        ..RuntimeConfig::default()
    });
    runtime.interpret(&toplevel(vec![float(1.0), echo("x")]));
    assert!(transcript.borrow().on("result").is_empty());
    assert_eq!(transcript.borrow().on("output"), vec!["x"]);
}

#[test]
fn test_semicolon_statements_interleave() {
    let transcript = run(toplevel(vec![
        comma(scope(vec![echo("a1"), echo("a2")])),
        comma(scope(vec![echo("b1"), echo("b2")])),
    ]));
    assert_eq!(transcript.on("output"), vec!["a1", "b1", "a2", "b2"]);
}

#[test]
fn test_pipe_does_not_yield() {
    let transcript = run(toplevel(vec![
        comma(scope(vec![pipe(echo("a1"), echo("a2"))])),
        comma(scope(vec![echo("b1"), echo("b2")])),
    ]));
    assert_eq!(transcript.on("output"), vec!["a1", "a2", "b1", "b2"]);
}

#[test]
fn test_and_waits_for_both_sides() {
    let transcript = run(toplevel(vec![
        and(echo("left"), echo("right")),
        echo("after"),
    ]));
    let output = transcript.on("output");
    assert_eq!(output.len(), 3);
    assert!(output[..2].contains(&"left".to_string()));
    assert!(output[..2].contains(&"right".to_string()));
    assert_eq!(output[2], "after");
}

#[test]
fn test_concurrent_sets_both_run() {
    let (runtime, transcript) = runtime();
    runtime.interpret(&toplevel(vec![
        declare("a", call(Some(ident("Object")), "clone", None)),
        and(
            send(ident("a"), "set", vec![float(1.0)]),
            send(ident("a"), "set", vec![float(2.0)]),
        ),
        send(ident("a"), "get", vec![]),
    ]));
    let results = transcript.borrow().on("result");
    let last = results.last().cloned().unwrap_or_default();
    assert!(last == "1" || last == "2", "unexpected {last}");
    assert!(transcript.borrow().on("error").is_empty());
    runtime.shutdown();
}

#[test]
fn test_stopping_a_tag_ends_its_loop() {
    let (runtime, transcript) = runtime();
    runtime.interpret(&toplevel(vec![
        declare("x", float(0.0)),
        comma(tagged(ident("mytag"), loop_(increment("x")))),
        apply("yield", vec![]),
        apply("yield", vec![]),
        send(ident("mytag"), "stop", vec![]),
    ]));

    assert_eq!(runtime.scheduler().live_jobs(), 0);
    let Some(Value::Float(x)) = runtime.global("x") else {
        panic!("x should be a number");
    };
    assert!(x > 0.0);
    assert!(transcript.borrow().on("error").is_empty());

    let tag = runtime
        .lobby()
        .lookup("mytag")
        .and_then(|value| value.as_tag())
        .expect("mytag should have been created");
    let tags = runtime.scheduler().tags().borrow();
    assert_eq!(tags.enters(tag), 1);
    assert_eq!(tags.leaves(tag), 1);
}

#[test]
fn test_stop_payload_is_the_statement_value() {
    let transcript = run(toplevel(vec![declare(
        "r",
        tagged(
            ident("mytag"),
            scope(vec![
                send(ident("mytag"), "stop", vec![float(42.0)]),
                echo("unreachable"),
            ]),
        ),
    )]));
    assert_eq!(transcript.on("result"), vec!["42"]);
    assert!(transcript.on("output").is_empty());
}

#[test]
fn test_stop_is_idempotent() {
    let transcript = run(toplevel(vec![
        declare("t", tag_new("t")),
        send(ident("t"), "stop", vec![]),
        send(ident("t"), "stop", vec![]),
        float(1.0),
    ]));
    assert_eq!(transcript.on("result"), vec!["Tag<t>", "1"]);
    assert!(transcript.on("error").is_empty());
}

#[test]
fn test_tag_is_popped_when_body_throws() {
    let (runtime, _transcript) = runtime();
    let value = runtime.eval(&sequence(vec![
        declare("t", tag_new("t")),
        try_(tagged(ident("t"), throw(float(1.0))), None, noop()),
        send(ident("t"), "leaveCount", vec![]),
    ]));
    assert_eq!(value.expect("eval should succeed"), Value::Float(1.0));
    runtime.shutdown();
}

#[test]
fn test_blocked_tag_skips_statements() {
    let transcript = run(toplevel(vec![
        declare("t", tag_new("t")),
        send(ident("t"), "block", vec![float(7.0)]),
        tagged(ident("t"), echo("blocked")),
        send(ident("t"), "unblock", vec![]),
        tagged(ident("t"), echo("ran")),
    ]));
    assert_eq!(transcript.on("output"), vec!["ran"]);
    assert_eq!(transcript.on("result"), vec!["Tag<t>", "7"]);
}

#[test]
fn test_freeze_shifts_sleep_deadline() {
    let (runtime, transcript) = runtime();
    runtime.interpret(&toplevel(vec![
        declare("woke", float(0.0)),
        comma(tagged(
            ident("t"),
            scope(vec![
                apply("sleep", vec![float(10.0)]),
                assign("woke", apply("time", vec![])),
            ]),
        )),
        apply("sleep", vec![float(2.0)]),
        send(ident("t"), "freeze", vec![]),
        apply("sleep", vec![float(5.0)]),
        send(ident("t"), "unfreeze", vec![]),
    ]));
    let woke = number(&runtime, "woke");
    assert!((15.0..15.1).contains(&woke), "woke at {woke}");
    assert_now_near(&runtime, 15.0);
    assert!(transcript.borrow().on("error").is_empty());
}

#[test]
fn test_timeout_stops_slow_expression() {
    let (runtime, transcript) = runtime();
    runtime.interpret(&toplevel(vec![
        apply(
            "timeout",
            vec![
                float(1.0),
                scope(vec![apply("sleep", vec![float(5.0)]), echo("late")]),
            ],
        ),
        echo("after"),
    ]));
    assert_eq!(transcript.borrow().on("output"), vec!["after"]);
    assert_now_near(&runtime, 1.0);
    assert_eq!(runtime.scheduler().live_jobs(), 0);
}

#[test]
fn test_timeout_returns_fast_value() {
    let (runtime, transcript) = runtime();
    runtime.interpret(&toplevel(vec![apply("timeout", vec![float(5.0), float(3.0)])]));
    assert_eq!(transcript.borrow().on("result"), vec!["3"]);
    assert!(runtime.scheduler().now() < Duration::from_secs(5));
    assert_eq!(runtime.scheduler().live_jobs(), 0);
}

#[test]
fn test_try_catch_binds_thrown_value() {
    let transcript = run(toplevel(vec![try_(
        throw(string("boom")),
        Some("e"),
        apply("echo", vec![ident("e")]),
    )]));
    assert_eq!(transcript.on("output"), vec!["boom"]);
    assert!(transcript.on("error").is_empty());
}

#[test]
fn test_errors_do_not_stop_the_program() {
    let transcript = run(toplevel(vec![
        throw(float(3.0)),
        ident("undefinedThing"),
        float(1.0),
    ]));
    assert_eq!(
        transcript.on("error"),
        vec!["!!! 3", "!!! lookup failed: undefinedThing"]
    );
    assert_eq!(transcript.on("result"), vec!["1"]);
}

#[test]
fn test_error_backtrace() {
    let transcript = run(toplevel(vec![
        declare("f", function(&[], throw(string("x")))),
        apply("f", vec![]),
    ]));
    assert_eq!(
        transcript.on("error"),
        vec!["!!! \"x\"", "!!!    called from: f"]
    );
}

#[test]
fn test_stray_flow_signals_are_reported() {
    let transcript = run(toplevel(vec![
        break_(),
        return_(Some(float(1.0))),
        float(2.0),
    ]));
    assert_eq!(
        transcript.on("error"),
        vec![
            "!!! break: outside a loop",
            "!!! return: outside a function"
        ]
    );
    assert_eq!(transcript.on("result"), vec!["2"]);
}

#[test]
fn test_linked_child_error_reaches_scope() {
    let transcript = run(toplevel(vec![scope(vec![
        comma(ident("undefinedName")),
        echo("x"),
    ])]));
    assert_eq!(transcript.on("output"), vec!["x"]);
    assert_eq!(
        transcript.on("error"),
        vec!["!!! lookup failed: undefinedName"]
    );
}

#[test]
fn test_lazy_routine_evaluates_argument_on_demand() {
    let twice = lazy_function(sequence(vec![
        send(call_msg(), "evalArgAt", vec![float(0.0)]),
        send(call_msg(), "evalArgAt", vec![float(0.0)]),
    ]));
    let transcript = run(toplevel(vec![
        declare("n", float(0.0)),
        declare("twice", twice),
        apply("twice", vec![increment("n")]),
        ident("n"),
    ]));
    assert_eq!(transcript.on("result").last().map(String::as_str), Some("2"));
}

#[test]
fn test_code_apply() {
    let add = function(
        &["a", "b"],
        return_(Some(send(ident("a"), "+", vec![ident("b")]))),
    );
    let (runtime, transcript) = runtime();
    runtime.interpret(&toplevel(vec![
        apply("setSlot", vec![string("add"), add]),
        send(
            apply("getSlot", vec![string("add")]),
            "apply",
            vec![list(vec![float(1.0), float(2.0)])],
        ),
    ]));
    assert_eq!(transcript.borrow().on("result").last().map(String::as_str), Some("3"));

    let add = runtime.lobby().lookup("add").expect("add should be a slot");
    let sum = runtime
        .apply(&add, vec![Value::Float(4.0), Value::Float(5.0)])
        .expect("apply should succeed");
    assert_eq!(sum, Value::Float(9.0));

    let error = runtime.apply(&Value::Float(1.0), vec![]).unwrap_err();
    assert!(error.to_string().contains("expected a Code"));
    runtime.shutdown();
}

#[test]
fn test_concurrent_foreach_joins() {
    let transcript = run(toplevel(vec![
        foreach(
            Flavor::Comma,
            "i",
            list(vec![float(1.0), float(2.0), float(3.0)]),
            apply("echo", vec![ident("i")]),
        ),
        echo("done"),
    ]));
    assert_eq!(transcript.on("output"), vec!["1", "2", "3", "done"]);
}

#[test]
fn test_at_runs_on_edges() {
    let (runtime, transcript) = runtime();
    runtime.execute(&toplevel(vec![
        declare("x", float(0.0)),
        at(
            send(ident("x"), ">", vec![float(2.0)]),
            echo("high"),
            Some(echo("low")),
        ),
        assign("x", float(5.0)),
        apply("yield", vec![]),
        apply("yield", vec![]),
        assign("x", float(0.0)),
    ]));
    runtime.step(30);
    assert_eq!(transcript.borrow().on("output"), vec!["high", "low"]);
    runtime.shutdown();
}

#[test]
fn test_every_ticks_until_stopped() {
    let (runtime, _transcript) = runtime();
    runtime.interpret(&toplevel(vec![
        declare("n", float(0.0)),
        comma(tagged(
            ident("ticker"),
            every(Flavor::Semicolon, float(1.0), scope(vec![increment("n")])),
        )),
        apply("sleep", vec![float(3.5)]),
        send(ident("ticker"), "stop", vec![]),
    ]));
    assert_eq!(runtime.global("n"), Some(Value::Float(4.0)));
    assert_now_near(&runtime, 3.5);
    assert_eq!(runtime.scheduler().live_jobs(), 0);
}

#[test]
fn test_scope_tag_terminates_inheriting_jobs() {
    let (runtime, transcript) = runtime();
    runtime.interpret(&toplevel(vec![scope(vec![
        send(ident("Tag"), "scope", vec![]),
        at(ident("true"), echo("on"), None),
        apply("yield", vec![]),
        apply("yield", vec![]),
    ])]));
    assert_eq!(transcript.borrow().on("output"), vec!["on"]);
    assert_eq!(runtime.scheduler().live_jobs(), 0);
}

#[test]
fn test_detach_outlives_statement() {
    let transcript = run(toplevel(vec![
        apply(
            "detach",
            vec![scope(vec![apply("sleep", vec![float(1.0)]), echo("late")])],
        ),
        echo("now"),
    ]));
    assert_eq!(transcript.on("output"), vec!["now", "late"]);
}

#[test]
fn test_non_interruptible_refuses_to_sleep() {
    let transcript = run(toplevel(vec![apply(
        "nonInterruptible",
        vec![apply("sleep", vec![float(1.0)])],
    )]));
    let errors = transcript.on("error");
    assert_eq!(
        errors.first().map(String::as_str),
        Some("!!! scheduling error: cannot sleep in non-interruptible mode")
    );
}

#[test]
fn test_program_from_json() {
    let program = toplevel(vec![
        declare("x", float(2.0)),
        apply("echo", vec![send(ident("x"), "*", vec![float(21.0)])]),
    ]);
    let json = serde_json::to_string(&program).expect("serialize");
    let decoded: Node = serde_json::from_str(&json).expect("deserialize");
    let transcript = run(Rc::new(decoded));
    assert_eq!(transcript.on("output"), vec!["42"]);
}

#[test]
fn test_timeout_interrupts_busy_loop() {
    let (runtime, transcript) = runtime();
    runtime.interpret(&toplevel(vec![
        declare("n", float(0.0)),
        apply("timeout", vec![float(1.0), loop_(increment("n"))]),
        echo("after"),
    ]));
    assert_eq!(transcript.borrow().on("output"), vec!["after"]);
    assert!(number(&runtime, "n") > 100.0);
    assert_now_near(&runtime, 1.0);
    assert_eq!(runtime.scheduler().live_jobs(), 0);
}

#[test]
fn test_sleeper_stops_busy_tagged_loop() {
    let (runtime, transcript) = runtime();
    runtime.interpret(&toplevel(vec![
        declare("x", float(0.0)),
        comma(tagged(ident("mytag"), loop_(increment("x")))),
        sleep(1.0),
        send(ident("mytag"), "stop", vec![]),
    ]));
    assert_eq!(runtime.scheduler().live_jobs(), 0);
    assert!(number(&runtime, "x") > 100.0);
    assert_now_near(&runtime, 1.0);
    assert!(transcript.borrow().on("error").is_empty());
}

#[test]
fn test_real_time_sleep_waits_on_the_wall_clock() {
    let (runtime, transcript) = runtime_with(RuntimeConfig {
        real_time: true,
        ..RuntimeConfig::default()
    });
    let started = std::time::Instant::now();
    runtime.interpret(&toplevel(vec![
        declare("x", float(0.0)),
        comma(tagged(ident("mytag"), loop_(increment("x")))),
        sleep(0.05),
        send(ident("mytag"), "stop", vec![]),
        echo("done"),
    ]));
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert!(runtime.scheduler().now() >= Duration::from_millis(50));
    assert_eq!(transcript.borrow().on("output"), vec!["done"]);
    assert_eq!(runtime.scheduler().live_jobs(), 0);
}

#[test]
fn test_lazy_argument_forwarded_to_lazy_routine() {
    let (runtime, transcript) = runtime();
    runtime.interpret(&toplevel(vec![
        declare(
            "g",
            lazy_function(send(call_msg(), "evalArgAt", vec![float(0.0)])),
        ),
        declare(
            "f",
            lazy_function(apply(
                "g",
                vec![send(call_msg(), "evalArgAt", vec![float(0.0)])],
            )),
        ),
        apply("f", vec![float(42.0)]),
    ]));
    assert!(transcript.borrow().on("error").is_empty());
    assert_eq!(
        transcript.borrow().on("result").last().map(String::as_str),
        Some("42")
    );
    runtime.shutdown();
}

#[test]
fn test_and_side_dies_when_other_side_throws() {
    let (runtime, transcript) = runtime();
    runtime.interpret(&toplevel(vec![
        try_(
            and(
                scope(vec![sleep(1.0), echo("left")]),
                throw(string("e")),
            ),
            None,
            echo("caught"),
        ),
        sleep(2.0),
        echo("end"),
    ]));
    assert_eq!(transcript.borrow().on("output"), vec!["caught", "end"]);
    assert_eq!(runtime.scheduler().live_jobs(), 0);
}

#[test]
fn test_scope_children_die_when_scope_throws() {
    let transcript = run(toplevel(vec![
        try_(
            scope(vec![
                comma(scope(vec![sleep(1.0), echo("late")])),
                throw(string("e")),
            ]),
            None,
            echo("caught"),
        ),
        sleep(2.0),
        echo("end"),
    ]));
    assert_eq!(transcript.on("output"), vec!["caught", "end"]);
}

#[test]
fn test_concurrent_foreach_failure_stops_siblings() {
    let transcript = run(toplevel(vec![
        try_(
            foreach(
                Flavor::Comma,
                "i",
                list(vec![float(1.0), float(2.0)]),
                if_(
                    send(ident("i"), "==", vec![float(1.0)]),
                    throw(string("e")),
                    Some(scope(vec![sleep(1.0), echo("slow")])),
                ),
            ),
            None,
            echo("caught"),
        ),
        sleep(2.0),
        echo("end"),
    ]));
    assert_eq!(transcript.on("output"), vec!["caught", "end"]);
    assert!(transcript.on("error").is_empty());
}

#[test]
fn test_timeout_and_scope_tags_are_released() {
    let (runtime, transcript) = runtime();
    runtime.interpret(&toplevel(vec![
        declare("n", float(0.0)),
        while_(
            Flavor::Semicolon,
            send(ident("n"), "<", vec![float(50.0)]),
            scope(vec![
                apply("timeout", vec![float(5.0), increment("n")]),
                send(ident("Tag"), "scope", vec![]),
            ]),
        ),
    ]));
    assert!(transcript.borrow().on("error").is_empty());
    assert_eq!(number(&runtime, "n"), 50.0);
    assert_eq!(runtime.scheduler().tags().borrow().live(), 1);
    assert_eq!(runtime.scheduler().live_jobs(), 0);
}

#[test]
fn test_continue_skips_rest_of_iteration() {
    let transcript = run(toplevel(vec![
        foreach(
            Flavor::Semicolon,
            "i",
            list(vec![float(1.0), float(2.0), float(3.0)]),
            scope(vec![
                if_(send(ident("i"), "==", vec![float(2.0)]), continue_(), None),
                apply("echo", vec![ident("i")]),
            ]),
        ),
        declare("n", float(0.0)),
        while_(
            Flavor::Semicolon,
            send(ident("n"), "<", vec![float(3.0)]),
            scope(vec![
                increment("n"),
                if_(send(ident("n"), "==", vec![float(1.0)]), continue_(), None),
                apply("echo", vec![send(ident("n"), "*", vec![float(10.0)])]),
            ]),
        ),
    ]));
    assert_eq!(transcript.on("output"), vec!["1", "3", "20", "30"]);
    assert!(transcript.on("error").is_empty());
}

#[test]
fn test_block_interrupts_running_tagged_statement() {
    let transcript = run(toplevel(vec![
        declare("t", tag_new("t")),
        declare("r", float(0.0)),
        comma(assign(
            "r",
            tagged(ident("t"), scope(vec![sleep(1.0), echo("unreachable")])),
        )),
        sleep(0.5),
        send(ident("t"), "block", vec![float(7.0)]),
        tagged(ident("t"), echo("skipped")),
        send(ident("t"), "unblock", vec![]),
        apply("echo", vec![ident("r")]),
    ]));
    assert_eq!(transcript.on("output"), vec!["7"]);
    assert!(transcript.on("error").is_empty());
}

#[test]
fn test_block_unwinds_to_the_outer_tag() {
    let (runtime, transcript) = runtime();
    runtime.interpret(&toplevel(vec![
        declare("outer", tag_new("outer")),
        declare("inner", tag_new("inner")),
        declare("r", float(0.0)),
        comma(assign(
            "r",
            tagged(
                ident("outer"),
                scope(vec![
                    tagged(ident("inner"), scope(vec![sleep(1.0), echo("unreachable")])),
                    echo("after inner"),
                ]),
            ),
        )),
        sleep(0.5),
        send(ident("outer"), "block", vec![float(3.0)]),
        sleep(1.0),
        apply("echo", vec![ident("r")]),
        send(ident("inner"), "leaveCount", vec![]),
    ]));
    assert_eq!(transcript.borrow().on("output"), vec!["3"]);
    assert_eq!(
        transcript.borrow().on("result").last().map(String::as_str),
        Some("1")
    );
    assert_eq!(runtime.scheduler().live_jobs(), 0);
}

#[test]
fn test_job_freezing_its_own_tag_waits_for_thaw() {
    let (runtime, transcript) = runtime();
    runtime.interpret(&toplevel(vec![
        declare("t", tag_new("t")),
        comma(scope(vec![
            sleep(1.0),
            send(ident("t"), "unfreeze", vec![]),
        ])),
        tagged(
            ident("t"),
            scope(vec![send(ident("t"), "freeze", vec![]), echo("thawed")]),
        ),
    ]));
    assert_eq!(transcript.borrow().on("output"), vec!["thawed"]);
    assert!(runtime.scheduler().now() >= Duration::from_secs(1));
    assert_eq!(runtime.scheduler().live_jobs(), 0);
}

#[test]
fn test_do_evaluates_body_on_target() {
    let transcript = run(toplevel(vec![
        declare("o", call(Some(ident("Object")), "clone", None)),
        declare(
            "r",
            do_(
                ident("o"),
                vec![apply("setSlot", vec![string("x"), float(1.0)])],
            ),
        ),
        send(ident("o"), "getSlot", vec![string("x")]),
        send(ident("r"), "==", vec![ident("o")]),
    ]));
    let results = transcript.on("result");
    assert_eq!(results[results.len() - 2..], ["1", "true"]);
    assert!(transcript.on("error").is_empty());
}

#[test]
fn test_bare_throw_rethrows_caught_error() {
    let transcript = run(toplevel(vec![
        try_(
            try_(throw(string("inner")), None, rethrow()),
            Some("e"),
            apply("echo", vec![ident("e")]),
        ),
        rethrow(),
    ]));
    assert_eq!(transcript.on("output"), vec!["inner"]);
    assert_eq!(
        transcript.on("error"),
        vec!["!!! throw: no exception to rethrow"]
    );
}

#[test]
fn test_pipe_inside_yielding_sequence() {
    let transcript = run(toplevel(vec![
        comma(scope(vec![pipe(echo("a1"), echo("a2")), echo("a3")])),
        comma(scope(vec![echo("b1"), echo("b2"), echo("b3")])),
    ]));
    assert_eq!(
        transcript.on("output"),
        vec!["a1", "a2", "b1", "a3", "b2", "b3"]
    );
}
