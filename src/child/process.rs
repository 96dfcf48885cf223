//! Child MCP servers running as local subprocesses
//!
//! stdout carries newline-delimited JSON-RPC, stdin takes our messages one per
//! line, and stderr is only logged.

use std::{process::Stdio, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde_json::Value;
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, ChildStdout, Command},
    sync::{mpsc, oneshot, watch, Mutex},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, info, warn};

use super::{ChildError, ChildEvent, ChildHandle, ChildLauncher, ChildLink, ExitInfo};
use crate::config::ServerDescriptor;

/// How long stdout may stay open after the process itself has exited.
const STDOUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Longest stdout line accepted from a child.
const MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessLauncher;

impl ProcessLauncher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ChildLauncher for ProcessLauncher {
    async fn start(&self, descriptor: &ServerDescriptor) -> Result<ChildLink, ChildError> {
        let mut child = Command::new(&descriptor.command)
            .args(&descriptor.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ChildError::Spawn {
                command: descriptor.command.clone(),
                source,
            })?;

        let pid = child.id();
        info!(server_id = %descriptor.id, pid = ?pid, command = %descriptor.command, "child spawned");

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = oneshot::channel();
        let (exited_tx, exited_rx) = watch::channel(None);

        let reader = child.stdout.take().map(|stdout| {
            tokio::spawn(read_messages(
                descriptor.id.clone(),
                stdout,
                events_tx.clone(),
            ))
        });
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_stderr(descriptor.id.clone(), stderr));
        }

        let handle = Arc::new(ChildProcess {
            server_id: descriptor.id.clone(),
            pid,
            stdin: Mutex::new(child.stdin.take()),
            stop_tx: std::sync::Mutex::new(Some(stop_tx)),
            exited: exited_rx,
        });

        tokio::spawn(supervise(
            descriptor.id.clone(),
            child,
            reader,
            stop_rx,
            events_tx,
            exited_tx,
        ));

        Ok(ChildLink {
            handle,
            events: events_rx,
        })
    }
}

pub struct ChildProcess {
    server_id: String,
    pid: Option<u32>,
    stdin: Mutex<Option<ChildStdin>>,
    stop_tx: std::sync::Mutex<Option<oneshot::Sender<Duration>>>,
    exited: watch::Receiver<Option<ExitInfo>>,
}

#[async_trait]
impl ChildHandle for ChildProcess {
    async fn send(&self, message: &Value) -> Result<(), ChildError> {
        if self.exited.borrow().is_some() {
            return Err(ChildError::WriteError);
        }

        let mut line = serde_json::to_vec(message).map_err(|_| ChildError::WriteError)?;
        line.push(b'\n');

        // The writer is taken out while a write is in flight. If the caller
        // gives up halfway, the half-written frame closes stdin for good.
        let mut stdin = self.stdin.lock().await;
        let Some(mut writer) = stdin.take() else {
            return Err(ChildError::WriteError);
        };

        let written = async {
            writer.write_all(&line).await?;
            writer.flush().await
        }
        .await;

        if let Err(err) = written {
            debug!(server_id = %self.server_id, error = %err, "child stdin closed");
            return Err(ChildError::WriteError);
        }

        *stdin = Some(writer);
        Ok(())
    }

    async fn stop(&self, grace: Duration) {
        let stop_tx = self
            .stop_tx
            .lock()
            .ok()
            .and_then(|mut stop_tx| stop_tx.take());
        if let Some(stop_tx) = stop_tx {
            let _ = stop_tx.send(grace);
        }

        // EOF on stdin is the polite shutdown request for stdio servers. A
        // writer blocked on a full pipe holds the lock until the signal lands.
        if let Ok(mut stdin) = self.stdin.try_lock() {
            stdin.take();
        }

        let mut exited = self.exited.clone();
        let waited = timeout(grace + STDOUT_DRAIN_TIMEOUT * 2, async {
            exited.wait_for(Option::is_some).await.map(|_| ())
        })
        .await;
        if waited.is_err() {
            warn!(server_id = %self.server_id, "child did not report exit after stop");
        }
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }
}

async fn supervise(
    server_id: String,
    mut child: Child,
    reader: Option<JoinHandle<()>>,
    stop_rx: oneshot::Receiver<Duration>,
    events: mpsc::UnboundedSender<ChildEvent>,
    exited: watch::Sender<Option<ExitInfo>>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        Ok(grace) = stop_rx => terminate(&server_id, &mut child, grace).await,
    };

    let exit = match status {
        Ok(status) => exit_info(status),
        Err(err) => {
            warn!(server_id = %server_id, error = %err, "failed to collect child exit status");
            ExitInfo::default()
        }
    };

    if let Some(mut reader) = reader {
        if timeout(STDOUT_DRAIN_TIMEOUT, &mut reader).await.is_err() {
            debug!(server_id = %server_id, "stdout still open after exit, abandoning reader");
            reader.abort();
        }
    }

    info!(server_id = %server_id, exit = %exit, "child exited");
    let _ = exited.send(Some(exit));
    let _ = events.send(ChildEvent::Exited(exit));
}

async fn terminate(
    server_id: &str,
    child: &mut Child,
    grace: Duration,
) -> std::io::Result<std::process::ExitStatus> {
    #[cfg(unix)]
    if let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) {
        use nix::{
            sys::signal::{kill, Signal},
            unistd::Pid,
        };

        if let Err(err) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
            debug!(server_id = %server_id, error = %err, "SIGTERM failed");
        }
    }

    match timeout(grace, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            warn!(server_id = %server_id, grace_ms = grace.as_millis(), "child ignored termination, killing");
            child.kill().await?;
            child.wait().await
        }
    }
}

fn exit_info(status: std::process::ExitStatus) -> ExitInfo {
    #[cfg(unix)]
    let signal = std::os::unix::process::ExitStatusExt::signal(&status);
    #[cfg(not(unix))]
    let signal = None;

    ExitInfo {
        code: status.code(),
        signal,
    }
}

async fn read_messages(
    server_id: String,
    stdout: ChildStdout,
    events: mpsc::UnboundedSender<ChildEvent>,
) {
    let mut reader = BufReader::new(stdout);
    let mut line = Vec::new();

    loop {
        match read_bounded_line(&mut reader, &mut line, MAX_LINE_BYTES).await {
            Ok(LineRead::Eof) => break,
            Ok(LineRead::Line) => {}
            Ok(LineRead::Oversized) => {
                warn!(server_id = %server_id, max_bytes = MAX_LINE_BYTES, "skipping oversized line from child");
                continue;
            }
            Err(err) => {
                warn!(server_id = %server_id, error = %err, "failed to read child stdout");
                break;
            }
        }

        for message in parse_line(&server_id, &line) {
            if events.send(ChildEvent::Message(message)).is_err() {
                return;
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum LineRead {
    Line,
    Oversized,
    Eof,
}

/// Reads one line into `line`, keeping at most `max` bytes of content. The
/// rest of a longer line is consumed and discarded.
async fn read_bounded_line<R>(reader: &mut R, line: &mut Vec<u8>, max: usize) -> std::io::Result<LineRead>
where
    R: AsyncBufRead + Unpin,
{
    line.clear();
    let limit = u64::try_from(max).unwrap_or(u64::MAX).saturating_add(1);
    let read = (&mut *reader).take(limit).read_until(b'\n', line).await?;
    if read == 0 {
        return Ok(LineRead::Eof);
    }

    if line.len() > max && line.last() != Some(&b'\n') {
        line.clear();
        skip_rest_of_line(reader).await?;
        return Ok(LineRead::Oversized);
    }

    Ok(LineRead::Line)
}

async fn skip_rest_of_line<R>(reader: &mut R) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let buffer = reader.fill_buf().await?;
        if buffer.is_empty() {
            return Ok(());
        }
        match buffer.iter().position(|byte| *byte == b'\n') {
            Some(end) => {
                reader.consume(end + 1);
                return Ok(());
            }
            None => {
                let len = buffer.len();
                reader.consume(len);
            }
        }
    }
}

/// Malformed lines are logged and dropped; a batch yields its objects.
fn parse_line(server_id: &str, line: &[u8]) -> Vec<Value> {
    let trimmed = line.trim_ascii();
    if trimmed.is_empty() {
        return Vec::new();
    }

    match serde_json::from_slice::<Value>(trimmed) {
        Ok(Value::Object(object)) => vec![Value::Object(object)],
        Ok(Value::Array(batch)) => batch.into_iter().filter(Value::is_object).collect(),
        Ok(_) | Err(_) => {
            warn!(
                server_id = %server_id,
                line = %String::from_utf8_lossy(trimmed),
                "skipping malformed line from child"
            );
            Vec::new()
        }
    }
}

async fn drain_stderr(server_id: String, stderr: impl AsyncRead + Unpin) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => debug!(server_id = %server_id, "stderr: {line}"),
            Ok(None) | Err(_) => break,
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use serde_json::json;

    use super::*;

    fn descriptor(command: &str, args: &[&str]) -> ServerDescriptor {
        ServerDescriptor {
            id: "test".to_string(),
            display_name: "Test".to_string(),
            command: command.to_string(),
            args: args.iter().map(|arg| arg.to_string()).collect(),
        }
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<ChildEvent>) -> ChildEvent {
        timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event before timeout")
            .expect("event channel open")
    }

    #[tokio::test]
    async fn messages_round_trip_through_pipes() {
        let ChildLink { handle, mut events } = ProcessLauncher::new()
            .start(&descriptor("cat", &[]))
            .await
            .expect("cat spawns");

        let message = json!({"jsonrpc": "2.0", "id": 7, "method": "ping"});
        handle.send(&message).await.expect("send succeeds");

        assert_eq!(next_event(&mut events).await, ChildEvent::Message(message));

        handle.stop(Duration::from_secs(1)).await;
        assert!(matches!(next_event(&mut events).await, ChildEvent::Exited(_)));
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped() {
        let script = r#"echo 'not json'; echo 42; echo '{"jsonrpc":"2.0","method":"notifications/message"}'"#;
        let ChildLink { mut events, .. } = ProcessLauncher::new()
            .start(&descriptor("sh", &["-c", script]))
            .await
            .expect("sh spawns");

        assert_eq!(
            next_event(&mut events).await,
            ChildEvent::Message(json!({"jsonrpc": "2.0", "method": "notifications/message"}))
        );
        assert_eq!(
            next_event(&mut events).await,
            ChildEvent::Exited(ExitInfo {
                code: Some(0),
                signal: None
            })
        );
    }

    #[tokio::test]
    async fn exit_code_is_reported_and_writes_fail_afterwards() {
        let ChildLink { handle, mut events } = ProcessLauncher::new()
            .start(&descriptor("sh", &["-c", "exit 3"]))
            .await
            .expect("sh spawns");

        assert_eq!(
            next_event(&mut events).await,
            ChildEvent::Exited(ExitInfo {
                code: Some(3),
                signal: None
            })
        );

        let err = handle
            .send(&json!({"jsonrpc": "2.0", "method": "ping"}))
            .await
            .expect_err("write after exit must fail");
        assert!(matches!(err, ChildError::WriteError));
    }

    #[tokio::test]
    async fn stop_terminates_processes_that_ignore_stdin() {
        let ChildLink { handle, mut events } = ProcessLauncher::new()
            .start(&descriptor("sleep", &["30"]))
            .await
            .expect("sleep spawns");

        handle.stop(Duration::from_secs(1)).await;

        let ChildEvent::Exited(exit) = next_event(&mut events).await else {
            panic!("expected exit event");
        };
        assert_eq!(exit.signal, Some(15));
    }

    #[tokio::test]
    async fn stop_is_not_held_up_by_a_blocked_write() {
        let ChildLink { handle, mut events } = ProcessLauncher::new()
            .start(&descriptor("sleep", &["30"]))
            .await
            .expect("sleep spawns");

        // Far larger than a pipe buffer; `sleep` never reads it.
        let blob = json!({"jsonrpc": "2.0", "method": "notifications/message", "params": {"data": "x".repeat(512 * 1024)}});
        let writer = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.send(&blob).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!writer.is_finished());

        timeout(Duration::from_secs(5), handle.stop(Duration::from_millis(200)))
            .await
            .expect("stop completes while the write is blocked");

        assert!(matches!(next_event(&mut events).await, ChildEvent::Exited(_)));
        let written = timeout(Duration::from_secs(5), writer)
            .await
            .expect("writer unblocks")
            .expect("writer joins");
        assert!(matches!(written, Err(ChildError::WriteError)));
    }

    #[tokio::test]
    async fn oversized_lines_are_skipped() {
        let input: &[u8] = b"{\"a\":1}\n0123456789abcdef\n{\"b\":2}";
        let mut reader = BufReader::new(input);
        let mut line = Vec::new();

        let mut reads = Vec::new();
        loop {
            let read = read_bounded_line(&mut reader, &mut line, 10)
                .await
                .expect("in-memory read");
            if read == LineRead::Eof {
                break;
            }
            reads.push((read, String::from_utf8_lossy(&line).into_owned()));
        }

        assert_eq!(
            reads,
            vec![
                (LineRead::Line, "{\"a\":1}\n".to_string()),
                (LineRead::Oversized, String::new()),
                (LineRead::Line, "{\"b\":2}".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn missing_command_fails_to_spawn() {
        let result = ProcessLauncher::new()
            .start(&descriptor("/nonexistent/mcp-server", &[]))
            .await;

        assert!(matches!(result, Err(ChildError::Spawn { .. })));
    }
}
