//! Many processes multiplexed over one container session.

use std::io::Write as _;
use std::sync::Arc;
use std::time::Duration;

use capsule::{BufferWriter, SinkError, Stdio, Writer};
use capsule_test_utils::{command, running_container, shell};
use futures::future::try_join_all;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

// ============================================================================
// TEST FIXTURES
// ============================================================================

/// Sink that hashes everything written to it.
#[derive(Clone, Default)]
struct HashWriter {
    state: Arc<Mutex<(Sha256, usize)>>,
}

impl HashWriter {
    fn digest(&self) -> String {
        hex::encode(self.state.lock().0.clone().finalize())
    }

    fn bytes(&self) -> usize {
        self.state.lock().1
    }
}

impl Writer for HashWriter {
    fn write(&mut self, data: &[u8]) -> Result<(), SinkError> {
        let mut state = self.state.lock();
        state.0.update(data);
        state.1 += data.len();
        Ok(())
    }
}

/// Sink that takes its time with every chunk.
struct SlowWriter {
    delay: Duration,
}

impl Writer for SlowWriter {
    fn write(&mut self, _data: &[u8]) -> Result<(), SinkError> {
        std::thread::sleep(self.delay);
        Ok(())
    }
}

// ============================================================================
// FAN-OUT TESTS
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn many_execs_share_one_session() {
    let (_vm, container) = running_container("fanout").await.unwrap();

    let runs = (0..81).map(|i| {
        let container = &container;
        async move {
            let out = BufferWriter::new();
            let process = container
                .exec(
                    &format!("exec-{i}"),
                    shell(&format!("echo {i}")),
                    Stdio::new().stdout(out.clone()),
                )
                .await?;
            process.start().await?;
            let code = process.wait().await?;
            Ok::<_, capsule::CapsuleError>((i, code, out.contents()))
        }
    });

    let results = try_join_all(runs).await.unwrap();
    assert_eq!(results.len(), 81);
    for (i, code, output) in results {
        assert_eq!(code, 0, "exec-{i}");
        assert_eq!(output, format!("{i}\n"), "exec-{i}");
    }
    assert_eq!(container.exec_ids().len(), 81);

    container.force_stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn large_outputs_arrive_intact() {
    const SIZE: usize = 4 * 1024 * 1024;

    let mut file = tempfile::NamedTempFile::new().unwrap();
    let payload: Vec<u8> = (0..SIZE).map(|i| (i * 31 % 251) as u8).collect();
    file.write_all(&payload).unwrap();
    file.flush().unwrap();
    let expected = hex::encode(Sha256::digest(&payload));
    let path = file.path().to_string_lossy().into_owned();

    let (_vm, container) = running_container("hashing").await.unwrap();
    let runs = (0..8).map(|i| {
        let container = &container;
        let path = path.clone();
        async move {
            let sink = HashWriter::default();
            let process = container
                .exec(
                    &format!("cat-{i}"),
                    command(["cat", path.as_str()]),
                    Stdio::new().stdout(sink.clone()),
                )
                .await?;
            process.start().await?;
            let code = process.wait().await?;
            Ok::<_, capsule::CapsuleError>((code, sink))
        }
    });

    for (code, sink) in try_join_all(runs).await.unwrap() {
        assert_eq!(code, 0);
        assert_eq!(sink.bytes(), SIZE);
        assert_eq!(sink.digest(), expected);
    }

    container.force_stop().await.unwrap();
}

// ============================================================================
// BACKPRESSURE TESTS
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn slow_sink_does_not_stall_other_processes() {
    let (_vm, container) = running_container("backpressure").await.unwrap();

    let slow = container
        .exec(
            "slow",
            shell("head -c 1048576 /dev/zero"),
            Stdio::new().stdout(SlowWriter {
                delay: Duration::from_millis(25),
            }),
        )
        .await
        .unwrap();
    slow.start().await.unwrap();

    let out = BufferWriter::new();
    let fast = container
        .exec("fast", shell("echo fast"), Stdio::new().stdout(out.clone()))
        .await
        .unwrap();
    fast.start().await.unwrap();

    let code = tokio::time::timeout(Duration::from_secs(5), fast.wait())
        .await
        .expect("fast process stalled behind a slow sink")
        .unwrap();
    assert_eq!(code, 0);
    assert_eq!(out.contents(), "fast\n");
    assert!(slow.exit_code().is_none(), "slow sink finished too early to prove anything");

    assert_eq!(slow.wait().await.unwrap(), 0);
    container.force_stop().await.unwrap();
}
