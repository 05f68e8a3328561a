//! Integration tests for exec'd processes: stdio, signals, delete and id rules.

use std::io::Cursor;
use std::time::Duration;

use capsule::{
    BoundedWriter, BufferWriter, CapsuleError, ProcessError, ProcessState, SinkError, Stdio,
};
use capsule_test_utils::{command, running_container, shell};
use futures::future::join_all;
use futures::FutureExt;

// ============================================================================
// STDIO TESTS
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn exec_streams_stdout_and_stderr_separately() {
    let (_vm, container) = running_container("stdio").await.unwrap();
    let out = BufferWriter::new();
    let err = BufferWriter::new();

    let process = container
        .exec(
            "split",
            shell("echo out; echo err >&2; exit 7"),
            Stdio::new().stdout(out.clone()).stderr(err.clone()),
        )
        .await
        .unwrap();
    assert_eq!(process.state(), ProcessState::Created);
    process.start().await.unwrap();

    assert_eq!(process.wait().await.unwrap(), 7);
    assert_eq!(process.state(), ProcessState::Exited(7));
    assert_eq!(out.contents(), "out\n");
    assert_eq!(err.contents(), "err\n");
    assert!(process.stdio_error().is_none());

    container.force_stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn stdin_is_forwarded_and_closed() {
    let (_vm, container) = running_container("stdin").await.unwrap();
    let out = BufferWriter::new();

    let process = container
        .exec(
            "cat",
            command(["cat"]),
            Stdio::new()
                .stdin(Cursor::new(b"hello capsule".to_vec()))
                .stdout(out.clone()),
        )
        .await
        .unwrap();
    process.start().await.unwrap();

    assert_eq!(process.wait().await.unwrap(), 0);
    assert_eq!(out.contents(), "hello capsule");

    container.force_stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn full_sink_drops_output_but_process_finishes() {
    let (_vm, container) = running_container("bounded").await.unwrap();
    let sink = BoundedWriter::new(1024);
    let accepted = sink.buffer();

    let process = container
        .exec(
            "flood",
            shell("head -c 200000 /dev/zero"),
            Stdio::new().stdout(sink),
        )
        .await
        .unwrap();
    process.start().await.unwrap();

    assert_eq!(process.wait().await.unwrap(), 0);
    assert_eq!(process.stdio_error(), Some(SinkError::Full { capacity: 1024 }));
    assert!(accepted.len() <= 1024);

    container.force_stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn terminal_process_gets_a_tty() {
    let (_vm, container) = running_container("tty-box").await.unwrap();
    let out = BufferWriter::new();

    let process = container
        .exec(
            "tty",
            shell("tty").terminal(true),
            Stdio::new().stdout(out.clone()),
        )
        .await
        .unwrap();
    assert!(process.is_terminal());
    process.start().await.unwrap();
    process.resize(40, 120).await.unwrap();

    assert_eq!(process.wait().await.unwrap(), 0);
    assert!(out.contents().starts_with("/dev/pts/"), "got {:?}", out.contents());

    container.force_stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn exit_is_reported_while_a_child_holds_stdout() {
    let (_vm, container) = running_container("leftover").await.unwrap();
    let out = BufferWriter::new();
    let process = container
        .exec("bg", shell("sleep 20 & echo hi"), Stdio::new().stdout(out.clone()))
        .await
        .unwrap();
    process.start().await.unwrap();

    let code = tokio::time::timeout(Duration::from_secs(5), process.wait())
        .await
        .expect("wait blocked on the background child")
        .unwrap();
    assert_eq!(code, 0);
    assert_eq!(process.state(), ProcessState::Exited(0));
    assert_eq!(out.contents(), "hi\n");

    // Cleanup is the same as for any exited process.
    process.kill(9).await.unwrap();
    process.delete().await.unwrap();
    assert_eq!(process.state(), ProcessState::Deleted);

    container.force_stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn resize_requires_terminal() {
    let (_vm, container) = running_container("no-tty").await.unwrap();
    let process = container
        .exec("plain", shell("true"), Stdio::new())
        .await
        .unwrap();

    let err = process.resize(24, 80).await.unwrap_err();
    assert!(matches!(err, CapsuleError::Process(ProcessError::InvalidConfig(_))));

    container.force_stop().await.unwrap();
}

// ============================================================================
// SIGNAL TESTS
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn killed_process_reports_signal_exit_code() {
    let (_vm, container) = running_container("signals").await.unwrap();
    let process = container
        .exec("sleeper", shell("exec sleep 3600"), Stdio::new())
        .await
        .unwrap();
    process.start().await.unwrap();

    process.kill(9).await.unwrap();
    assert_eq!(process.wait().await.unwrap(), 137);

    // Signalling an exited process is a no-op.
    process.kill(9).await.unwrap();

    container.force_stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn killing_a_created_process_exits_it() {
    let (_vm, container) = running_container("unborn").await.unwrap();
    let process = container
        .exec("never", shell("true"), Stdio::new())
        .await
        .unwrap();

    process.kill(15).await.unwrap();
    assert_eq!(process.wait().await.unwrap(), 143);
    assert_eq!(process.state(), ProcessState::Exited(143));

    container.force_stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_waiters_see_the_same_code() {
    let (_vm, container) = running_container("waiters").await.unwrap();
    let process = container
        .exec("short", shell("sleep 0.2; exit 5"), Stdio::new())
        .await
        .unwrap();

    let waiters: Vec<_> = (0..8)
        .map(|_| {
            let process = process.clone();
            tokio::spawn(async move { process.wait().await })
        })
        .collect();
    process.start().await.unwrap();

    for waiter in waiters {
        assert_eq!(waiter.await.unwrap().unwrap(), 5);
    }
    assert_eq!(process.exit_code(), Some(5));

    container.force_stop().await.unwrap();
}

// ============================================================================
// START FAILURE TESTS
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn failed_start_leaves_process_created() {
    let (_vm, container) = running_container("badexec").await.unwrap();
    let process = container
        .exec("missing", command(["/nonexistent/capsule-binary"]), Stdio::new())
        .await
        .unwrap();

    let err = process.start().await.unwrap_err();
    assert!(matches!(err, CapsuleError::Process(ProcessError::StartFailed { .. })));
    assert_eq!(process.state(), ProcessState::Created);
    assert!(process.last_error().is_some());

    process.delete().await.unwrap();
    assert_eq!(process.state(), ProcessState::Deleted);

    container.force_stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn start_twice_fails() {
    let (_vm, container) = running_container("twice").await.unwrap();
    let process = container
        .exec("sleeper", shell("exec sleep 3600"), Stdio::new())
        .await
        .unwrap();
    process.start().await.unwrap();

    let err = process.start().await.unwrap_err();
    assert!(matches!(err, CapsuleError::Process(ProcessError::StartFailed { .. })));

    container.force_stop().await.unwrap();
}

// ============================================================================
// DELETE AND ID TESTS
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn delete_requires_exit() {
    let (_vm, container) = running_container("deleting").await.unwrap();
    let process = container
        .exec("sleeper", shell("exec sleep 3600"), Stdio::new())
        .await
        .unwrap();
    process.start().await.unwrap();

    let err = process.delete().await.unwrap_err();
    assert!(matches!(err, CapsuleError::Process(ProcessError::NotExited(_))));

    process.force_delete().await.unwrap();
    assert_eq!(process.state(), ProcessState::Deleted);
    assert!(container.process("sleeper").is_none());

    let err = process.delete().await.unwrap_err();
    assert!(matches!(err, CapsuleError::Process(ProcessError::NotFound(_))));
    let err = process.kill(9).await.unwrap_err();
    assert!(matches!(err, CapsuleError::Process(ProcessError::NotFound(_))));

    container.force_stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn deleting_unstarted_process_wakes_waiters() {
    let (_vm, container) = running_container("orphan-wait").await.unwrap();
    let process = container
        .exec("idle", shell("true"), Stdio::new())
        .await
        .unwrap();

    let waiter = {
        let process = process.clone();
        tokio::spawn(async move { process.wait().await })
    };
    process.delete().await.unwrap();

    let err = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, CapsuleError::Process(ProcessError::NotFound(_))));

    container.force_stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn process_ids_are_never_reused() {
    let (_vm, container) = running_container("ids").await.unwrap();

    // The init process holds the container id.
    let err = container
        .exec("ids", shell("true"), Stdio::new())
        .await
        .unwrap_err();
    assert!(matches!(err, CapsuleError::Process(ProcessError::AlreadyExists(_))));

    let first = container
        .exec("job", shell("true"), Stdio::new())
        .await
        .unwrap();
    let err = container
        .exec("job", shell("true"), Stdio::new())
        .await
        .unwrap_err();
    assert!(matches!(err, CapsuleError::Process(ProcessError::AlreadyExists(_))));

    first.start().await.unwrap();
    first.wait().await.unwrap();
    first.delete().await.unwrap();

    let err = container
        .exec("job", shell("true"), Stdio::new())
        .await
        .unwrap_err();
    assert!(matches!(err, CapsuleError::Process(ProcessError::AlreadyExists(ref id)) if id == "job"));

    let err = container
        .exec("", shell("true"), Stdio::new())
        .await
        .unwrap_err();
    assert!(matches!(err, CapsuleError::Process(ProcessError::InvalidConfig(_))));

    container.force_stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_execs_of_one_id_have_one_winner() {
    let (_vm, container) = running_container("contended").await.unwrap();

    let attempts = (0..16).map(|_| container.exec("shared", shell("true"), Stdio::new()));
    let results = join_all(attempts).await;

    assert_eq!(results.iter().filter(|result| result.is_ok()).count(), 1);
    for err in results.iter().filter_map(|result| result.as_ref().err()) {
        assert!(
            matches!(err, CapsuleError::Process(ProcessError::AlreadyExists(id)) if id == "shared"),
            "unexpected error: {err}"
        );
    }
    assert_eq!(container.exec_ids(), vec!["shared".to_string()]);

    container.force_stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn abandoned_exec_is_cleaned_up() {
    let (_vm, container) = running_container("abandon").await.unwrap();

    // Poll once, then drop: the caller never receives the handle.
    let pending = container
        .exec("lost", shell("true"), Stdio::new())
        .now_or_never();
    assert!(pending.is_none());

    // Give the detached registration time to create and delete the process.
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert!(container.process("lost").is_none());
    assert!(container.exec_ids().is_empty());
    let err = container
        .exec("lost", shell("true"), Stdio::new())
        .await
        .unwrap_err();
    assert!(matches!(err, CapsuleError::Process(ProcessError::AlreadyExists(_))));

    container.force_stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_exec_frees_its_id() {
    let (_vm, container) = running_container("retry").await.unwrap();

    let err = container
        .exec("job", shell("true").cwd("relative/dir"), Stdio::new())
        .await
        .unwrap_err();
    assert!(matches!(err, CapsuleError::Process(ProcessError::InvalidConfig(_))));

    let process = container
        .exec("job", shell("true"), Stdio::new())
        .await
        .unwrap();
    process.start().await.unwrap();
    assert_eq!(process.wait().await.unwrap(), 0);
    assert_eq!(container.exec_ids(), vec!["job".to_string()]);

    container.force_stop().await.unwrap();
}
