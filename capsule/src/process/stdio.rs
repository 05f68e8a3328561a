//! Stdio wiring between the guest and the caller's sources and sinks.
//!
//! Output: one Attach stream per process carries stdout and stderr chunks.
//! A router task splits them into two bounded channels, each drained into
//! its [`Writer`] on a blocking thread. A writer that blocks fills its
//! channel, which stops the router reading, which closes the HTTP/2 window
//! for this process only.
//!
//! Input: a blocking reader feeds the SendInput client stream.

use std::io::Read;

use capsule_shared::{InputChunk, StreamKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::{CapsuleError, SinkError};
use crate::portal::interfaces::{OutputStream, ProcessInterface};
use crate::sink::{DiscardWriter, Writer};

const STDIN_CHUNK_SIZE: usize = 32 * 1024;
const STDIN_BUFFER: usize = 4;

/// Where a process reads input from and writes output to.
///
/// Defaults to no stdin (`/dev/null` in the guest) and discarded output.
pub struct Stdio {
    pub(crate) stdin: Option<Box<dyn Read + Send>>,
    pub(crate) stdout: Box<dyn Writer>,
    pub(crate) stderr: Box<dyn Writer>,
}

impl Default for Stdio {
    fn default() -> Self {
        Self {
            stdin: None,
            stdout: Box::new(DiscardWriter),
            stderr: Box::new(DiscardWriter),
        }
    }
}

impl Stdio {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stdin(mut self, reader: impl Read + Send + 'static) -> Self {
        self.stdin = Some(Box::new(reader));
        self
    }

    pub fn stdout(mut self, writer: impl Writer) -> Self {
        self.stdout = Box::new(writer);
        self
    }

    pub fn stderr(mut self, writer: impl Writer) -> Self {
        self.stderr = Box::new(writer);
        self
    }
}

impl std::fmt::Debug for Stdio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stdio")
            .field("stdin", &self.stdin.is_some())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Output
// ============================================================================

/// How output delivery ended.
#[derive(Debug, Default)]
pub(crate) struct OutputReport {
    /// First failure of either sink. Later output of that stream was dropped.
    pub sink_error: Option<SinkError>,
    /// The attach stream broke before the guest finished it.
    pub transport_error: Option<CapsuleError>,
}

/// Deliver the attach stream into the sinks.
///
/// The returned task completes once both sinks have seen every chunk and
/// been closed.
pub(crate) fn spawn_output(
    process_id: String,
    mut stream: OutputStream,
    stdout: Box<dyn Writer>,
    stderr: Box<dyn Writer>,
    buffer: usize,
) -> JoinHandle<OutputReport> {
    tokio::spawn(async move {
        let (out_tx, out_rx) = mpsc::channel::<Vec<u8>>(buffer.max(1));
        let (err_tx, err_rx) = mpsc::channel::<Vec<u8>>(buffer.max(1));
        let out_sink = tokio::task::spawn_blocking(move || drain_into(out_rx, stdout));
        let err_sink = tokio::task::spawn_blocking(move || drain_into(err_rx, stderr));

        let mut report = OutputReport::default();
        let mut chunks = 0u64;
        loop {
            match stream.message().await {
                Ok(Some(chunk)) => {
                    chunks += 1;
                    let tx = match chunk.stream() {
                        StreamKind::Stdout => &out_tx,
                        StreamKind::Stderr => &err_tx,
                    };
                    // A closed channel means the sink thread died; its
                    // join result below reports it.
                    let _ = tx.send(chunk.data).await;
                }
                Ok(None) => break,
                Err(status) => {
                    tracing::debug!(
                        process_id = %process_id,
                        error = %status,
                        chunks,
                        "Attach stream broke"
                    );
                    report.transport_error = Some(status.into());
                    break;
                }
            }
        }
        drop(out_tx);
        drop(err_tx);

        for sink in [out_sink, err_sink] {
            let failure = match sink.await {
                Ok(failure) => failure,
                Err(e) => Some(SinkError::Io(format!("sink thread failed: {}", e))),
            };
            if report.sink_error.is_none() {
                report.sink_error = failure;
            }
        }

        tracing::trace!(process_id = %process_id, chunks, "Output delivered");
        report
    })
}

/// Feed chunks to `writer` until the channel closes.
///
/// After a write error the rest of the stream is consumed and dropped so
/// the process never blocks on a full pipe.
fn drain_into(mut rx: mpsc::Receiver<Vec<u8>>, mut writer: Box<dyn Writer>) -> Option<SinkError> {
    let mut failure = None;
    while let Some(chunk) = rx.blocking_recv() {
        if failure.is_some() {
            continue;
        }
        if let Err(e) = writer.write(&chunk) {
            failure = Some(e);
        }
    }
    if let Err(e) = writer.close() {
        failure.get_or_insert(e);
    }
    failure
}

// ============================================================================
// Input
// ============================================================================

/// Forward `reader` into the process stdin until EOF, then close it.
pub(crate) fn spawn_input(
    mut process: ProcessInterface,
    container_id: String,
    process_id: String,
    mut reader: Box<dyn Read + Send>,
) -> JoinHandle<()> {
    let (tx, rx) = mpsc::channel::<InputChunk>(STDIN_BUFFER);

    let chunk = {
        let container_id = container_id.clone();
        let process_id = process_id.clone();
        move |data: Vec<u8>, close: bool| InputChunk {
            container_id: container_id.clone(),
            process_id: process_id.clone(),
            data,
            close,
        }
    };

    tokio::task::spawn_blocking(move || {
        let mut buf = vec![0u8; STDIN_CHUNK_SIZE];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.blocking_send(chunk(buf[..n].to_vec(), false)).is_err() {
                        return;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "Stdin source failed, closing stdin");
                    break;
                }
            }
        }
        let _ = tx.blocking_send(chunk(Vec::new(), true));
    });

    tokio::spawn(async move {
        if let Err(e) = process.send_input(ReceiverStream::new(rx)).await {
            tracing::warn!(
                container_id = %container_id,
                process_id = %process_id,
                error = %e,
                "SendInput failed"
            );
        }
    })
}
