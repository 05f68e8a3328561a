//! Environment and identity resolution, observed from inside processes.

use std::path::Path;

use capsule::{
    BufferWriter, CapsuleError, LinuxContainer, LinuxProcess, PasswdFile, ProcessConfig,
    ProcessError, Stdio, User,
};
use capsule_shared::constants::env::DEFAULT_PATH;
use capsule_test_utils::{current_user, is_root, running_container, shell};

async fn output_of(container: &LinuxContainer, id: &str, config: ProcessConfig) -> String {
    let out = BufferWriter::new();
    let process: LinuxProcess = container
        .exec(id, config, Stdio::new().stdout(out.clone()))
        .await
        .unwrap();
    process.start().await.unwrap();
    assert_eq!(process.wait().await.unwrap(), 0, "{id} failed");
    out.contents()
}

// ============================================================================
// DEFAULTS
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn defaults_are_injected() {
    let (_vm, container) = running_container("env-defaults").await.unwrap();

    let path = output_of(&container, "path", shell("echo \"$PATH\"")).await;
    assert_eq!(path.trim_end(), DEFAULT_PATH);

    let term = output_of(&container, "term", shell("echo \"${TERM-<unset>}\"")).await;
    assert_eq!(term.trim_end(), "<unset>");

    // HOME comes from the container's passwd entry for the uid.
    let expected_home = PasswdFile::load(Path::new("/"))
        .unwrap()
        .entries()
        .iter()
        .find(|entry| entry.uid == current_user().uid)
        .map(|entry| entry.home.clone())
        .filter(|home| !home.is_empty())
        .unwrap_or_else(|| "<unset>".to_string());
    let home = output_of(&container, "home", shell("echo \"${HOME-<unset>}\"")).await;
    assert_eq!(home.trim_end(), expected_home);

    container.force_stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn caller_entries_win() {
    let (_vm, container) = running_container("env-override").await.unwrap();

    let config = shell("echo \"$HOME:$PATH:$GREETING\"")
        .env("HOME", "/custom")
        .env("PATH", "/opt/bin:/bin:/usr/bin")
        .env("GREETING", "hello");
    let out = output_of(&container, "override", config).await;
    assert_eq!(out.trim_end(), "/custom:/opt/bin:/bin:/usr/bin:hello");

    container.force_stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn terminal_processes_get_term() {
    let (_vm, container) = running_container("env-term").await.unwrap();

    let out = output_of(&container, "tty", shell("echo \"$TERM\"").terminal(true)).await;
    assert_eq!(out.trim_end(), "xterm");

    let out = output_of(
        &container,
        "tty-custom",
        shell("echo \"$TERM\"").terminal(true).env("TERM", "vt100"),
    )
    .await;
    assert_eq!(out.trim_end(), "vt100");

    container.force_stop().await.unwrap();
}

// ============================================================================
// IDENTITY
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn process_runs_as_requested_uid() {
    if !is_root() {
        eprintln!("skipping: switching identity needs root");
        return;
    }
    let (_vm, container) = running_container("identity").await.unwrap();

    let out = output_of(&container, "uid1", shell("id -u; id -g").user(User::new(1, 1))).await;
    assert_eq!(out, "1\n1\n");

    let out = output_of(&container, "root", shell("id -u").user(User::named("root"))).await;
    assert_eq!(out, "0\n");

    container.force_stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_username_is_rejected() {
    let (_vm, container) = running_container("identity-unknown").await.unwrap();

    let err = container
        .exec(
            "ghost",
            shell("true").user(User::named("capsule-no-such-user")),
            Stdio::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CapsuleError::Process(ProcessError::InvalidConfig(_))));
    assert!(container.process("ghost").is_none());

    container.force_stop().await.unwrap();
}
