use std::time::Duration;

use acp_bridge_sandbox::{
    ExternalCall, ExternalFunction, ExternalParam, RunnerState, SandboxConfig, SandboxError,
    ScriptRunner,
};
use serde_json::{json, Value};

fn externals() -> Vec<ExternalFunction> {
    vec![
        ExternalFunction::new(
            "read_file",
            vec![
                ExternalParam::required("path"),
                ExternalParam::optional("line", Value::Null),
                ExternalParam::optional("limit", Value::Null),
            ],
        ),
        ExternalFunction::new(
            "run_command",
            vec![
                ExternalParam::required("command"),
                ExternalParam::optional("args", json!([])),
                ExternalParam::optional("cwd", Value::Null),
            ],
        ),
    ]
}

fn load(source: &str) -> ScriptRunner {
    load_with(source, SandboxConfig::default())
}

fn load_with(source: &str, config: SandboxConfig) -> ScriptRunner {
    match ScriptRunner::new(source, externals(), &config) {
        Ok(runner) => runner,
        Err(err) => panic!("script rejected: {err}"),
    }
}

fn suspended(state: RunnerState) -> ExternalCall {
    match state {
        RunnerState::Suspended(call) => call,
        other => panic!("expected suspension, got {other:?}"),
    }
}

fn completed(state: RunnerState) -> Value {
    match state {
        RunnerState::Completed(value) => value,
        other => panic!("expected completion, got {other:?}"),
    }
}

fn failed(state: RunnerState) -> SandboxError {
    match state {
        RunnerState::Failed(err) => err,
        other => panic!("expected failure, got {other:?}"),
    }
}

#[test]
fn two_external_calls_suspend_and_resume_twice() {
    let mut runner = load(
        "x = read_file(\"a.txt\")\ny = run_command(\"wc\", [\"-l\", \"a.txt\"])\nprint(x + y)\n",
    );

    let first = suspended(runner.run());
    assert_eq!(first.function, "read_file");
    assert_eq!(
        Value::Object(first.arguments.clone()),
        json!({"path": "a.txt", "line": null, "limit": null})
    );

    let second = suspended(
        runner
            .resume(first.token, Ok(json!("hello")))
            .expect("resume read_file"),
    );
    assert_eq!(second.function, "run_command");
    assert_eq!(
        Value::Object(second.arguments.clone()),
        json!({"command": "wc", "args": ["-l", "a.txt"], "cwd": null})
    );
    assert_ne!(first.token, second.token);

    let result = completed(
        runner
            .resume(second.token, Ok(json!("1")))
            .expect("resume run_command"),
    );
    assert_eq!(result, Value::Null);
    assert_eq!(runner.output(), "hello1\n");
}

#[test]
fn resumed_values_reach_the_script_unmodified() {
    let mut runner = load(
        r#"data = read_file(path="cfg.json")
return {"keys": sorted(data.keys()), "n": data["n"] * 2, "nested": data["nested"]}
"#,
    );
    let call = suspended(runner.run());
    let result = completed(
        runner
            .resume(
                call.token,
                Ok(json!({"n": 21, "nested": [1, 2.5, null, true, "s"]})),
            )
            .expect("resume"),
    );
    assert_eq!(
        result,
        json!({"keys": ["n", "nested"], "n": 42, "nested": [1, 2.5, null, true, "s"]})
    );
}

#[test]
fn disallowed_import_is_rejected_before_running() {
    let err = ScriptRunner::new(
        "import os\nx = read_file(\"a.txt\")\n",
        externals(),
        &SandboxConfig::default(),
    )
    .expect_err("validation should fail");
    match err {
        SandboxError::Validation { violations } => {
            assert_eq!(violations.len(), 1);
            assert_eq!(violations[0].line, 1);
            assert_eq!(violations[0].message, "import of module `os` is not allowed");
        }
        other => panic!("expected validation error, got {other:?}"),
    }
}

#[test]
fn deeply_nested_source_is_rejected_before_running() {
    let source = format!("x = {}{}\n", "[".repeat(50_000), "]".repeat(50_000));
    let err = ScriptRunner::new(&source, externals(), &SandboxConfig::default())
        .expect_err("validation should fail");
    match err {
        SandboxError::Validation { violations } => {
            assert_eq!(violations.len(), 1);
            assert!(violations[0].message.contains("too many nested levels"));
        }
        other => panic!("expected validation error, got {other:?}"),
    }
}

#[test]
fn tool_errors_are_catchable() {
    let mut runner = load(
        r#"try:
    x = read_file("missing.txt")
except ToolError as e:
    x = "fallback: " + str(e)
return x
"#,
    );
    let call = suspended(runner.run());
    let result = completed(
        runner
            .resume(call.token, Err("not found: missing.txt".to_string()))
            .expect("resume with error"),
    );
    assert_eq!(result, json!("fallback: not found: missing.txt"));
}

#[test]
fn uncaught_tool_error_fails_with_line() {
    let mut runner = load("x = 1\ny = read_file(\"missing.txt\")\n");
    let call = suspended(runner.run());
    let err = failed(
        runner
            .resume(call.token, Err("boom".to_string()))
            .expect("resume"),
    );
    assert_eq!(
        err,
        SandboxError::Runtime {
            kind: "ToolError".to_string(),
            message: "boom".to_string(),
            line: 2,
        }
    );
}

#[test]
fn external_calls_suspend_inside_functions() {
    let mut runner = load(
        r#"def lines(path):
    text = read_file(path)
    return text.splitlines()

total = 0
for name in ["a", "b"]:
    total += len(lines(name + ".txt"))
return total
"#,
    );
    let first = suspended(runner.run());
    assert_eq!(first.arguments.get("path"), Some(&json!("a.txt")));
    let second = suspended(
        runner
            .resume(first.token, Ok(json!("1\n2\n3")))
            .expect("resume a"),
    );
    assert_eq!(second.arguments.get("path"), Some(&json!("b.txt")));
    let result = completed(runner.resume(second.token, Ok(json!("x"))).expect("resume b"));
    assert_eq!(result, json!(4));
}

#[test]
fn wrong_and_reused_tokens_are_invalid() {
    let mut runner = load("x = read_file(\"a.txt\")\ny = read_file(\"b.txt\")\n");
    let first = suspended(runner.run());

    let err = runner
        .resume(first.token + 1000, Ok(json!("nope")))
        .expect_err("wrong token");
    assert_eq!(
        err,
        SandboxError::InvalidContinuation {
            token: first.token + 1000
        }
    );
    // The runner is still waiting on the original call.
    assert_eq!(runner.pending().map(|call| call.token), Some(first.token));

    let second = suspended(runner.resume(first.token, Ok(json!("a"))).expect("resume"));
    let err = runner
        .resume(first.token, Ok(json!("again")))
        .expect_err("reused token");
    assert_eq!(err, SandboxError::InvalidContinuation { token: first.token });

    completed(runner.resume(second.token, Ok(json!("b"))).expect("resume"));
    let err = runner
        .resume(second.token, Ok(json!("late")))
        .expect_err("token after completion");
    assert_eq!(err, SandboxError::InvalidContinuation { token: second.token });
}

#[test]
fn resume_without_suspension_is_rejected() {
    let mut runner = load("return 1\n");
    assert_eq!(completed(runner.run()), json!(1));
    assert_eq!(
        runner.resume(7, Ok(Value::Null)),
        Err(SandboxError::NotSuspended)
    );
}

#[test]
fn cancel_releases_the_pending_continuation() {
    let mut runner = load("x = read_file(\"a.txt\")\nprint(x)\n");
    let call = suspended(runner.run());
    runner.cancel();
    assert_eq!(runner.state(), &RunnerState::Cancelled);
    assert_eq!(
        runner.resume(call.token, Ok(json!("late"))),
        Err(SandboxError::InvalidContinuation { token: call.token })
    );
    assert_eq!(runner.output(), "");
}

#[test]
fn cancel_handle_stops_a_running_script() {
    let mut runner = load_with(
        "while True:\n    pass\n",
        SandboxConfig {
            max_steps: u64::MAX,
            max_duration_ms: 60_000,
            ..SandboxConfig::default()
        },
    );
    let handle = runner.cancel_handle();
    let worker = std::thread::spawn(move || runner.run());
    std::thread::sleep(Duration::from_millis(20));
    handle.cancel();
    let state = worker.join().expect("runner thread");
    assert_eq!(state, RunnerState::Cancelled);
}

#[test]
fn step_budget_is_enforced() {
    let mut runner = load_with(
        "i = 0\nwhile True:\n    i += 1\n",
        SandboxConfig {
            max_steps: 10_000,
            ..SandboxConfig::default()
        },
    );
    let err = failed(runner.run());
    assert!(
        matches!(&err, SandboxError::BudgetExceeded { reason } if reason.contains("step budget")),
        "{err:?}"
    );
    assert!(runner.steps() > 10_000);
}

#[test]
fn oversized_padding_exhausts_the_step_budget() {
    let sources = [
        "return len('a'.ljust(999999999999))",
        "return '1'.zfill(999999999999)",
        "return 'a'.center(999999999999, '*')",
        "return f'{1:>999999999999}'",
        "return '%999999999999d' % 1",
        "return '{:.999999999999f}'.format(1.5)",
    ];
    for source in sources {
        let mut runner = load(&format!("{source}\n"));
        let err = failed(runner.run());
        assert!(
            matches!(
                &err,
                SandboxError::BudgetExceeded { reason } if reason.contains("step budget")
            ),
            "{source}: {err:?}"
        );
    }
    let mut runner = load("return len('a'.rjust(200)) + len(f'{7:>100}')\n");
    assert_eq!(completed(runner.run()), json!(300));
}

#[test]
fn time_budget_is_enforced() {
    let mut runner = load_with(
        "while True:\n    pass\n",
        SandboxConfig {
            max_steps: u64::MAX,
            max_duration_ms: 20,
            ..SandboxConfig::default()
        },
    );
    let err = failed(runner.run());
    assert!(
        matches!(&err, SandboxError::BudgetExceeded { reason } if reason.contains("time budget")),
        "{err:?}"
    );
}

#[test]
fn time_spent_suspended_does_not_count() {
    let mut runner = load_with(
        "x = read_file(\"a.txt\")\nreturn x\n",
        SandboxConfig {
            max_duration_ms: 50,
            ..SandboxConfig::default()
        },
    );
    let call = suspended(runner.run());
    std::thread::sleep(Duration::from_millis(120));
    let result = completed(runner.resume(call.token, Ok(json!("ok"))).expect("resume"));
    assert_eq!(result, json!("ok"));
    assert!(runner.elapsed() < Duration::from_millis(50));
}

#[test]
fn output_is_capped() {
    let mut runner = load_with(
        "for i in range(100):\n    print(\"0123456789\")\nreturn \"done\"\n",
        SandboxConfig {
            max_output_bytes: 25,
            ..SandboxConfig::default()
        },
    );
    assert_eq!(completed(runner.run()), json!("done"));
    assert_eq!(runner.output(), "0123456789\n0123456789\n012");
    assert!(runner.output_truncated());
}

#[test]
fn runtime_errors_carry_kind_and_line() {
    let mut runner = load("values = [1, 2, 3]\n\nx = values[1] / 0\n");
    let err = failed(runner.run());
    assert_eq!(
        err,
        SandboxError::Runtime {
            kind: "ZeroDivisionError".to_string(),
            message: "division by zero".to_string(),
            line: 3,
        }
    );
}

#[test]
fn recursion_is_bounded() {
    let mut runner = load("def f(n):\n    return f(n + 1)\nf(0)\n");
    let err = failed(runner.run());
    assert!(
        matches!(&err, SandboxError::Runtime { kind, .. } if kind == "RecursionError"),
        "{err:?}"
    );
}

#[test]
fn deeply_nested_values_fail_with_recursion_error() {
    let config = SandboxConfig {
        max_steps: 100_000_000,
        max_duration_ms: 60_000,
        ..SandboxConfig::default()
    };
    for tail in ["print(a)", "return a == b", "return a < b", "return a"] {
        let source = format!(
            "a = []\nb = []\nfor i in range(200000):\n    a = [a]\n    b = [b]\n{tail}\n"
        );
        let mut runner = load_with(&source, config.clone());
        let err = failed(runner.run());
        assert!(
            matches!(&err, SandboxError::Runtime { kind, .. } if kind == "RecursionError"),
            "{tail}: {err:?}"
        );
    }
}

#[test]
fn self_referencing_containers_print_ellipsis() {
    let mut runner = load(
        "a = [1]\na.append(a)\nd = {}\nd['d'] = d\nprint(a, d)\nreturn repr(a)\n",
    );
    assert_eq!(completed(runner.run()), json!("[1, [...]]"));
    assert_eq!(runner.output(), "[1, [...]] {'d': {...}}\n");

    let mut runner = load("a = []\na.append(a)\nreturn a\n");
    let err = failed(runner.run());
    assert!(
        matches!(&err, SandboxError::Runtime { kind, message, .. }
            if kind == "ValueError" && message.contains("Circular reference")),
        "{err:?}"
    );
}

#[test]
fn round_handles_extreme_arguments() {
    let mut runner = load("return [round(5, -2**62 - 2**62), round(2.675, 2), round(0.125, 2)]\n");
    assert_eq!(completed(runner.run()), json!([0, 2.67, 0.12]));

    let mut runner = load("return round(1e300)\n");
    let err = failed(runner.run());
    assert!(
        matches!(&err, SandboxError::Runtime { kind, .. } if kind == "OverflowError"),
        "{err:?}"
    );
}

#[test]
fn non_json_results_fail() {
    let mut runner = load("def f():\n    pass\nreturn f\n");
    let err = failed(runner.run());
    assert!(
        matches!(&err, SandboxError::Runtime { kind, .. } if kind == "TypeError"),
        "{err:?}"
    );
}

#[test]
fn external_arguments_are_bound_by_name() {
    let mut runner = load("read_file(\"a.txt\", limit=5)\n");
    let call = suspended(runner.run());
    assert_eq!(
        Value::Object(call.arguments),
        json!({"path": "a.txt", "line": null, "limit": 5})
    );

    let mut runner = load("read_file(\"a.txt\", bogus=1)\n");
    let err = failed(runner.run());
    assert!(
        matches!(&err, SandboxError::Runtime { kind, message, .. }
            if kind == "TypeError" && message.contains("unexpected keyword argument 'bogus'")),
        "{err:?}"
    );
}

#[test]
fn external_calls_from_key_functions_are_rejected() {
    let mut runner = load(
        "def key(name):\n    return read_file(name)\nreturn sorted([\"a\", \"b\"], key=key)\n",
    );
    let err = failed(runner.run());
    assert!(
        matches!(&err, SandboxError::Runtime { kind, .. } if kind == "RuntimeError"),
        "{err:?}"
    );
}

#[test]
fn language_tour() {
    let source = r#"import json
from json import dumps

def fib(n):
    a, b = 0, 1
    for _ in range(n):
        a, b = b, a + b
    return a

nums = [fib(i) for i in range(10) if i % 2 == 0]
print(nums)

counts = {}
for word in "b a b c b".split():
    counts[word] = counts.get(word, 0) + 1

def by_count(item):
    return -item[1]

print(sorted(counts.items(), key=by_count))

name = "x"
print(f"{3.14159:.2f}|{name:>3}|{42:05d}")

try:
    data = json.loads('{"b": 1, "a": [true, null]}')
    print(data["a"], dumps(data, sort_keys=True))
except ValueError as e:
    print("bad")

try:
    json.loads("{oops")
except json.JSONDecodeError:
    print("decode error")

text = "%s has %d items" % ("list", len(nums))
print(text.upper(), text.startswith("list"))

total = 0
i = 0
while True:
    i += 1
    if i > 10:
        break
    if i % 2:
        continue
    total += i
print(total, 7 // 2, -7 // 2, 2 ** 10, 10 / 4)

print(1 < 2 < 3, "a" in "cat", [1, 2][::-1], (1,), max([3, 9, 2]), min(4, 1, key=abs))
print(round(2.675, 2), round(7.5), abs(-3), sum([1.5, 2]), int("12") + 1)

label = "even" if total % 2 == 0 else "odd"
pairs = [f"{k}={v}" for k, v in enumerate(["p", "q"], 1)]
print(label, ", ".join(pairs), "-".join(reversed(["a", "b", "c"])))

return {"fib": nums[-1], "ok": isinstance(nums, list)}
"#;
    let mut runner = load(source);
    let result = completed(runner.run());
    assert_eq!(result, json!({"fib": 21, "ok": true}));
    insta::assert_snapshot!(runner.output(), @r###"
    [0, 1, 3, 8, 21]
    [('b', 3), ('a', 1), ('c', 1)]
    3.14|  x|00042
    [True, None] {"a": [true, null], "b": 1}
    decode error
    LIST HAS 5 ITEMS True
    30 3 -4 1024 2.5
    True True [2, 1] (1,) 9 1
    2.67 8 3 3.5 13
    even 1=p, 2=q c-b-a
    "###);
}
