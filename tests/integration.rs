//! Integration tests: run real processes through the chain
//!
//! Usage:
//!   cargo test --test integration
//!   EMX_CLITEST_DEBUG=1 cargo test --test integration   # echo process output
//!
//! These drive `sh`, so they only run on Unix.

#![cfg(unix)]

use emx_clitest::{runner, ChainError, ErrorKind, ProcessOptions, LAUNCH_FAILURE_CODE};
use serde_json::json;

fn expect_eq(actual: &str, expected: &str) -> Result<(), ChainError> {
    if actual == expected {
        Ok(())
    } else {
        Err(ChainError::assertion(
            format!("Expected {:?} to equal {:?}", actual, expected),
            "strictEqual",
            actual,
            expected,
        ))
    }
}

#[tokio::test]
async fn spawn_asserts_stdout_and_code() {
    let ctx = runner()
        .spawn("sh -c 'echo hi'")
        .stdout("hi")
        .not_stderr("error")
        .code(0)
        .await
        .unwrap();
    assert_eq!(ctx.result.stdout, "hi");
    assert_eq!(ctx.result.code, Some(0));
}

#[tokio::test]
async fn spawn_with_explicit_args_is_not_split() {
    runner()
        .spawn_with("printf", ["%s|%s", "a b", "c"], ProcessOptions::new())
        .stdout("a b|c")
        .code(0)
        .await
        .unwrap();
}

#[tokio::test]
async fn missing_binary_is_an_assertable_outcome() {
    let ctx = runner()
        .spawn("definitely-not-a-real-binary-xyz --version")
        .code(LAUNCH_FAILURE_CODE)
        .stderr("definitely-not-a-real-binary-xyz")
        .await
        .unwrap();
    assert!(ctx.result.stdout.is_empty());
}

#[tokio::test]
async fn non_zero_exit_fails_code_check() {
    let err = runner().spawn("sh -c 'exit 3'").code(0).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Assertion);
    assert_eq!(err.message, "Expected exitCode to be 0 but got 3");
    assert_eq!(err.step.as_deref(), Some("code"));
    let location = err.location.unwrap();
    assert!(location.file().ends_with("integration.rs"));
}

#[tokio::test]
async fn output_is_stripped_of_ansi_and_final_newline() {
    runner()
        .spawn(r#"sh -c "printf '\033[31mred\033[0m\n'""#)
        .expect("plain text", |ctx| expect_eq(&ctx.result.stdout, "red"))
        .await
        .unwrap();
}

#[tokio::test]
async fn file_checked_before_mkdir_fails() {
    let err = runner()
        .tmpdir()
        .file("a/b")
        .mkdir("a/b")
        .await
        .unwrap_err();
    assert_eq!(err.message, "Expected a/b to be exists");
    assert_eq!(err.step.as_deref(), Some("file"));
}

#[tokio::test]
async fn mkdir_then_file() {
    let ctx = runner()
        .tmpdir()
        .mkdir("a/b")
        .file("a/b")
        .not_file("a/c")
        .rm("a")
        .not_file("a/b")
        .await
        .unwrap();
    assert!(ctx.log.contains("> mkdir a/b\n> file a/b\n"));
}

#[tokio::test]
async fn interactive_prompt() {
    runner()
        .spawn(r#"sh -c 'echo "name?"; read name; echo "hello $name"'"#)
        .wait_stdout(r"name\?")
        .write("world")
        .wait_stdout("hello world")
        .stdout("hello world")
        .code(0)
        .await
        .unwrap();
}

#[tokio::test]
async fn kill_terminates_long_running_process() {
    let ctx = runner()
        .spawn("sh -c 'echo ready; exec sleep 30'")
        .wait_stdout("ready")
        .kill()
        .wait_close()
        .code(143)
        .await
        .unwrap();
    assert_eq!(ctx.result.stdout, "ready");
}

#[tokio::test(flavor = "multi_thread")]
async fn dropping_context_kills_running_process() {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    use std::time::Duration;

    let ctx = runner()
        .spawn("sh -c 'echo ready; exec sleep 30'")
        .wait_stdout("ready")
        .await
        .unwrap();
    let pid = Pid::from_raw(ctx.active().unwrap().pid().unwrap() as i32);
    assert!(kill(pid, None).is_ok());
    drop(ctx);

    let mut alive = true;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        // fails with ESRCH once the child is killed and reaped
        if kill(pid, None).is_err() {
            alive = false;
            break;
        }
    }
    assert!(!alive, "pid {} still alive after the context was dropped", pid);
}

#[tokio::test]
async fn wait_fails_when_process_closes_first() {
    let err = runner()
        .spawn("sh -c 'echo starting; exit 1'")
        .wait_stdout("listening")
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::WaitClosed);
    assert_eq!(err.step.as_deref(), Some("wait"));
}

#[tokio::test]
async fn env_reaches_process() {
    runner()
        .env("GREETING", "hey")
        .spawn("sh -c 'echo $GREETING'")
        .stdout("hey")
        .await
        .unwrap();
}

#[tokio::test]
async fn shell_runs_in_cwd_and_fails_on_non_zero() {
    runner()
        .tmpdir()
        .shell("mkdir -p out && echo '{\"name\": \"demo\"}' > out/package.json")
        .file_matches("out/package.json", json!({"name": "demo"}))
        .not_file_matches("out/package.json", "version")
        .await
        .unwrap();

    let err = runner().shell("exit 3").await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::CommandFailed);
}

#[tokio::test]
async fn fork_receives_messages() {
    const CHILD: &str = r#"
printf '{"type":"progress"}\n' >&3
printf '{"type":"ready","port":3000}\n' >&3
echo done
"#;
    let ctx = runner()
        .tmpdir()
        .tap(|ctx| std::fs::write(ctx.cwd.join("child.sh"), CHILD).unwrap())
        .fork_with("child.sh", Vec::<String>::new(), ProcessOptions::new().runtime("sh"))
        .wait_message(Some(json!({"type": "ready"}).into()))
        .wait_close()
        .stdout("done")
        .code(0)
        .await
        .unwrap();
    assert_eq!(ctx.last_message, Some(json!({"type": "ready", "port": 3000})));
}

#[tokio::test]
async fn timer_measures_steps() {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    let seen = Arc::new(Mutex::new(Duration::ZERO));
    let sink = Arc::clone(&seen);
    runner()
        .time("nap")
        .sleep(Duration::from_millis(20))
        .time_end("nap", move |d| *sink.lock().unwrap() = d)
        .await
        .unwrap();
    assert!(*seen.lock().unwrap() >= Duration::from_millis(20));
}
