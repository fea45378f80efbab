use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use partyline_protocol::ServerMessage;
use portable_pty::{CommandBuilder, MasterPty, NativePtySystem, PtySize, PtySystem};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, warn};

use crate::config::{PartyConfig, SessionMode};
use crate::credentials::GEMINI_API_KEY_ENV;
use crate::error::PartyError;
use crate::registry::PeerRegistry;

/// Placeholder in batch command templates, replaced per merged prompt with
/// the path of a temp file holding the prompt text.
pub const PROMPT_FILE_PLACEHOLDER: &str = "{prompt_file}";

/// How long a child gets to exit after SIGTERM before it is killed.
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

const OUTPUT_STREAM: &str = "stdout";

/// The hosted process, behind whichever transport the session mode needs.
/// Everything above this enum is oblivious to PTY vs. pipes.
pub enum AgentChannel {
    Raw(Arc<RawByteChannel>),
    Line(Arc<LineChannel>),
}

impl AgentChannel {
    pub fn start(config: &PartyConfig, registry: Arc<PeerRegistry>) -> Result<Self, PartyError> {
        let command = config.resolved_command();
        match config.mode {
            SessionMode::Interactive => Ok(Self::Raw(Arc::new(RawByteChannel::spawn(
                &command,
                config.project_dir.as_deref(),
                registry,
            )?))),
            SessionMode::Batch => Ok(Self::Line(Arc::new(LineChannel::start(
                &command,
                &config.ready_marker,
                config.project_dir.clone(),
                registry,
            )?))),
        }
    }

    /// Flips to true when the hosted process is gone. `None` for per-prompt
    /// batch channels, which have no long-lived child to watch.
    pub fn exit_signal(&self) -> Option<watch::Receiver<bool>> {
        match self {
            Self::Raw(raw) => Some(raw.exit_signal()),
            Self::Line(line) => line.exit_signal(),
        }
    }

    pub async fn shutdown(&self) {
        match self {
            Self::Raw(raw) => raw.shutdown().await,
            Self::Line(line) => line.shutdown().await,
        }
    }
}

/// Interactive-mode transport: the agent runs under a pseudo-terminal and
/// peers exchange raw byte streams with it.
pub struct RawByteChannel {
    writer: std::sync::Mutex<Option<Box<dyn std::io::Write + Send>>>,
    child: std::sync::Mutex<Option<Box<dyn portable_pty::Child + Send + Sync>>>,
    master: std::sync::Mutex<Option<Box<dyn MasterPty + Send>>>,
    exit_rx: watch::Receiver<bool>,
}

impl RawByteChannel {
    /// Spawn `command` under a new PTY via `sh -c` and start pumping its
    /// output to every registered peer as `output_bytes` chunks.
    pub fn spawn(
        command: &str,
        project_dir: Option<&Path>,
        registry: Arc<PeerRegistry>,
    ) -> Result<Self, PartyError> {
        let pty_system = NativePtySystem::default();
        let pair = pty_system
            .openpty(PtySize {
                rows: 24,
                cols: 80,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PartyError::Pty(e.to_string()))?;

        let mut cmd = CommandBuilder::new("sh");
        cmd.arg("-c");
        cmd.arg(command);
        cmd.env("TERM", "xterm-256color");
        // the collaborator credential never reaches the hosted process
        cmd.env_remove(GEMINI_API_KEY_ENV);
        if let Some(dir) = project_dir {
            cmd.cwd(dir);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PartyError::ProcessStart(e.to_string()))?;
        drop(pair.slave); // close slave side in parent

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PartyError::Pty(e.to_string()))?;
        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PartyError::Pty(e.to_string()))?;
        let master = pair.master;

        let (chunk_tx, mut chunk_rx) = mpsc::channel::<Vec<u8>>(64);
        let (exit_tx, exit_rx) = watch::channel(false);

        // Background thread reads PTY output and sends chunks. EOF or a
        // read error is the liveness signal that the process is gone.
        std::thread::spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if chunk_tx.blocking_send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                }
            }
            let _ = exit_tx.send(true);
        });

        tokio::spawn(async move {
            while let Some(data) = chunk_rx.recv().await {
                registry
                    .broadcast(&ServerMessage::OutputBytes {
                        stream: OUTPUT_STREAM.to_string(),
                        data,
                    })
                    .await;
            }
        });

        Ok(Self {
            writer: std::sync::Mutex::new(Some(writer)),
            child: std::sync::Mutex::new(Some(child)),
            master: std::sync::Mutex::new(Some(master)),
            exit_rx,
        })
    }

    /// Forward raw peer input to the PTY. Writes from concurrent peers are
    /// serialized by the writer lock so interleaved chunks never tear.
    pub fn write_bytes(&self, data: &[u8]) -> Result<(), PartyError> {
        let mut writer = self.writer.lock().unwrap();
        let Some(writer) = writer.as_mut() else {
            return Err(PartyError::ProcessWrite(
                "agent process has stopped".to_string(),
            ));
        };
        writer
            .write_all(data)
            .map_err(|e| PartyError::ProcessWrite(e.to_string()))?;
        writer
            .flush()
            .map_err(|e| PartyError::ProcessWrite(e.to_string()))?;
        Ok(())
    }

    pub fn exit_signal(&self) -> watch::Receiver<bool> {
        self.exit_rx.clone()
    }

    /// Terminate the child: SIGTERM, a bounded grace period, then kill.
    /// Safe to call more than once.
    pub async fn shutdown(&self) {
        self.writer.lock().unwrap().take();
        let child = self.child.lock().unwrap().take();
        let Some(mut child) = child else { return };

        if let Ok(Some(status)) = child.try_wait() {
            debug!("agent process already exited with code {}", status.exit_code());
        } else {
            if let Some(pid) = child.process_id() {
                unsafe {
                    libc::kill(pid as libc::pid_t, libc::SIGTERM);
                }
            }
            let deadline = tokio::time::Instant::now() + TERMINATE_GRACE;
            loop {
                match child.try_wait() {
                    Ok(Some(status)) => {
                        debug!("agent process exited with code {}", status.exit_code());
                        break;
                    }
                    Ok(None) if tokio::time::Instant::now() < deadline => {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                    _ => {
                        warn!("agent process ignored SIGTERM, killing");
                        let _ = child.kill();
                        let _ = child.try_wait();
                        break;
                    }
                }
            }
        }
        // dropping the master releases the PTY and unblocks the reader thread
        self.master.lock().unwrap().take();
    }
}

impl Drop for RawByteChannel {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.lock().unwrap().take() {
            let _ = child.kill();
        }
    }
}

#[derive(Debug)]
enum LineMode {
    /// One short-lived agent invocation per merged prompt.
    PerPrompt { template: String },
    /// A single long-lived agent fed prompts over stdin.
    LongLived,
}

/// Batch-mode transport: merged prompts go in as lines, agent output comes
/// back as `output` line events.
#[derive(Debug)]
pub struct LineChannel {
    registry: Arc<PeerRegistry>,
    ready: Arc<AtomicBool>,
    mode: LineMode,
    project_dir: Option<PathBuf>,
    submit_lock: Mutex<()>,
    stdin: Mutex<Option<ChildStdin>>,
    child: Mutex<Option<tokio::process::Child>>,
    exit_rx: Option<watch::Receiver<bool>>,
}

impl LineChannel {
    /// Templates containing `{prompt_file}` run per prompt; anything else is
    /// exec'd once and fed prompts over stdin.
    pub fn start(
        command: &str,
        ready_marker: &str,
        project_dir: Option<PathBuf>,
        registry: Arc<PeerRegistry>,
    ) -> Result<Self, PartyError> {
        if command.contains(PROMPT_FILE_PLACEHOLDER) {
            Ok(Self::per_prompt(command, project_dir, registry))
        } else {
            Self::spawn_long_lived(command, ready_marker, project_dir, registry)
        }
    }

    fn per_prompt(
        template: &str,
        project_dir: Option<PathBuf>,
        registry: Arc<PeerRegistry>,
    ) -> Self {
        Self {
            registry,
            ready: Arc::new(AtomicBool::new(true)),
            mode: LineMode::PerPrompt {
                template: template.to_string(),
            },
            project_dir,
            submit_lock: Mutex::new(()),
            stdin: Mutex::new(None),
            child: Mutex::new(None),
            exit_rx: None,
        }
    }

    fn spawn_long_lived(
        command: &str,
        ready_marker: &str,
        project_dir: Option<PathBuf>,
        registry: Arc<PeerRegistry>,
    ) -> Result<Self, PartyError> {
        let mut parts = command.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| PartyError::ProcessStart("empty agent command".to_string()))?;
        let mut cmd = Command::new(program);
        cmd.args(parts)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env_remove(GEMINI_API_KEY_ENV);
        if let Some(dir) = &project_dir {
            cmd.current_dir(dir);
        }
        let mut child = cmd
            .spawn()
            .map_err(|e| PartyError::ProcessStart(e.to_string()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PartyError::ProcessStart("agent stdin not piped".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PartyError::ProcessStart("agent stdout not piped".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| PartyError::ProcessStart("agent stderr not piped".to_string()))?;

        let ready = Arc::new(AtomicBool::new(true));
        let (exit_tx, exit_rx) = watch::channel(false);

        tokio::spawn(forward_lines(
            registry.clone(),
            stdout,
            Some((ready.clone(), ready_marker.to_string())),
            Some(exit_tx),
        ));
        tokio::spawn(forward_lines(registry.clone(), stderr, None, None));

        Ok(Self {
            registry,
            ready,
            mode: LineMode::LongLived,
            project_dir,
            submit_lock: Mutex::new(()),
            stdin: Mutex::new(Some(stdin)),
            child: Mutex::new(Some(child)),
            exit_rx: Some(exit_rx),
        })
    }

    /// Whether the agent is believed idle. The debounce pipeline holds
    /// batches until this is true.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn exit_signal(&self) -> Option<watch::Receiver<bool>> {
        self.exit_rx.clone()
    }

    /// Hand one merged prompt to the agent. Submissions are serialized;
    /// any failure forces the channel back to ready so the pipeline cannot
    /// wedge behind a broken process.
    pub async fn submit(&self, text: &str) -> Result<(), PartyError> {
        let _guard = self.submit_lock.lock().await;
        self.ready.store(false, Ordering::SeqCst);
        match &self.mode {
            LineMode::PerPrompt { template } => {
                let res = self.run_invocation(template, text).await;
                self.ready.store(true, Ordering::SeqCst);
                res
            }
            LineMode::LongLived => {
                // on success the ready marker in the output flips us back
                let res = self.write_prompt_line(text).await;
                if res.is_err() {
                    self.ready.store(true, Ordering::SeqCst);
                }
                res
            }
        }
    }

    async fn run_invocation(&self, template: &str, text: &str) -> Result<(), PartyError> {
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(text.as_bytes())?;
        file.write_all(b"\n")?;
        file.flush()?;
        let command = template.replace(PROMPT_FILE_PLACEHOLDER, &file.path().display().to_string());
        debug!("running agent invocation: {command}");

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env_remove(GEMINI_API_KEY_ENV)
            .kill_on_drop(true);
        if let Some(dir) = &self.project_dir {
            cmd.current_dir(dir);
        }
        let mut child = cmd
            .spawn()
            .map_err(|e| PartyError::ProcessStart(e.to_string()))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PartyError::ProcessStart("agent stdout not piped".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| PartyError::ProcessStart("agent stderr not piped".to_string()))?;
        let out_task = tokio::spawn(forward_lines(self.registry.clone(), stdout, None, None));
        let err_task = tokio::spawn(forward_lines(self.registry.clone(), stderr, None, None));

        let status = child
            .wait()
            .await
            .map_err(|e| PartyError::ProcessWrite(e.to_string()))?;
        let _ = out_task.await;
        let _ = err_task.await;
        debug!("agent invocation exited with {status}");
        Ok(())
    }

    async fn write_prompt_line(&self, text: &str) -> Result<(), PartyError> {
        let mut stdin = self.stdin.lock().await;
        let Some(stdin) = stdin.as_mut() else {
            return Err(PartyError::ProcessWrite("agent stdin is closed".to_string()));
        };
        let mut payload = text.trim_end().to_string();
        payload.push('\n');
        stdin
            .write_all(payload.as_bytes())
            .await
            .map_err(|e| PartyError::ProcessWrite(e.to_string()))?;
        stdin
            .flush()
            .await
            .map_err(|e| PartyError::ProcessWrite(e.to_string()))?;
        Ok(())
    }

    /// Close stdin so a well-behaved agent exits on EOF, then SIGTERM with
    /// the usual grace period. Safe to call more than once.
    pub async fn shutdown(&self) {
        self.stdin.lock().await.take();
        let Some(mut child) = self.child.lock().await.take() else {
            return;
        };

        if let Ok(Some(status)) = child.try_wait() {
            debug!("agent process already exited with {status}");
            return;
        }
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }
        match tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
            Ok(Ok(status)) => debug!("agent process exited with {status}"),
            Ok(Err(err)) => warn!("error waiting for agent process: {err}"),
            Err(_) => {
                warn!("agent process ignored SIGTERM, killing");
                let _ = child.kill().await;
            }
        }
    }
}

/// Stream child output lines to every peer, optionally watching for the
/// ready marker and reporting end-of-stream.
async fn forward_lines<R>(
    registry: Arc<PeerRegistry>,
    reader: R,
    readiness: Option<(Arc<AtomicBool>, String)>,
    exit_tx: Option<watch::Sender<bool>>,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if let Some((ready, marker)) = &readiness
            && (marker.is_empty() || line.trim_end().ends_with(marker.as_str()))
        {
            ready.store(true, Ordering::SeqCst);
        }
        registry.broadcast(&ServerMessage::Output { text: line }).await;
    }
    if let Some(exit_tx) = exit_tx {
        let _ = exit_tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    async fn registry_with_peer() -> (Arc<PeerRegistry>, mpsc::Receiver<String>) {
        let registry = Arc::new(PeerRegistry::new("host"));
        let (tx, rx) = mpsc::channel(crate::registry::OUTBOUND_QUEUE);
        registry.register("observer", tx).await;
        (registry, rx)
    }

    async fn next_message(rx: &mut mpsc::Receiver<String>) -> ServerMessage {
        let line = timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for message")
            .expect("peer channel closed");
        serde_json::from_str(&line).expect("valid server message")
    }

    /// Collect output until `needle` shows up in the byte stream.
    async fn wait_for_output_bytes(rx: &mut mpsc::Receiver<String>, needle: &[u8]) -> Vec<u8> {
        let mut seen = Vec::new();
        loop {
            if let ServerMessage::OutputBytes { data, .. } = next_message(rx).await {
                seen.extend_from_slice(&data);
                if seen.windows(needle.len()).any(|w| w == needle) {
                    return seen;
                }
            }
        }
    }

    async fn wait_for_output_line(rx: &mut mpsc::Receiver<String>, needle: &str) -> String {
        loop {
            if let ServerMessage::Output { text } = next_message(rx).await
                && text.contains(needle)
            {
                return text;
            }
        }
    }

    #[tokio::test]
    async fn raw_channel_streams_pty_output_and_signals_exit() {
        let (registry, mut rx) = registry_with_peer().await;
        let raw = RawByteChannel::spawn("printf party-ok", None, registry).expect("spawn");

        wait_for_output_bytes(&mut rx, b"party-ok").await;

        let mut exit = raw.exit_signal();
        timeout(WAIT, exit.wait_for(|exited| *exited))
            .await
            .expect("exit signal timed out")
            .expect("exit watch closed");
        raw.shutdown().await;
    }

    #[tokio::test]
    async fn raw_channel_write_reaches_child() {
        let (registry, mut rx) = registry_with_peer().await;
        let raw = RawByteChannel::spawn("cat", None, registry).expect("spawn");

        raw.write_bytes(b"echo-me\n").expect("write");
        wait_for_output_bytes(&mut rx, b"echo-me").await;

        raw.shutdown().await;
        // idempotent, and writes now fail cleanly
        raw.shutdown().await;
        assert!(raw.write_bytes(b"late\n").is_err());
    }

    #[tokio::test]
    async fn per_prompt_channel_runs_template() {
        let (registry, mut rx) = registry_with_peer().await;
        let line = LineChannel::start("cat {prompt_file}", ">", None, registry).expect("start");

        assert!(line.is_ready());
        line.submit("fix the flaky test").await.expect("submit");
        let text = wait_for_output_line(&mut rx, "fix the flaky test").await;
        assert_eq!(text, "fix the flaky test");
        assert!(line.is_ready());
        line.shutdown().await;
    }

    #[tokio::test]
    async fn per_prompt_channel_forwards_stderr() {
        let (registry, mut rx) = registry_with_peer().await;
        let line =
            LineChannel::start("cat {prompt_file} >&2", ">", None, registry).expect("start");

        line.submit("loud failure").await.expect("submit");
        wait_for_output_line(&mut rx, "loud failure").await;
        line.shutdown().await;
    }

    #[tokio::test]
    async fn long_lived_channel_marks_ready_on_marker() {
        let (registry, mut rx) = registry_with_peer().await;
        // `sh` runs each stdin line, so a submitted command that prints the
        // marker exercises the readiness round-trip.
        let line = LineChannel::start("sh", ">", None, registry).expect("start");

        assert!(line.is_ready());
        line.submit("echo done; echo '>'").await.expect("submit");
        wait_for_output_line(&mut rx, "done").await;
        wait_for_output_line(&mut rx, ">").await;
        assert!(line.is_ready());
        line.shutdown().await;
    }

    #[tokio::test]
    async fn long_lived_marker_matches_as_line_suffix() {
        let (registry, mut rx) = registry_with_peer().await;
        let line = LineChannel::start("sh", ">", None, registry).expect("start");

        // REPLs print the prompt right after output on the same line; the
        // marker only has to end the line, not be the whole line.
        line.submit("echo 'all done> '").await.expect("submit");
        wait_for_output_line(&mut rx, "all done").await;
        assert!(line.is_ready());
        line.shutdown().await;
    }

    #[tokio::test]
    async fn long_lived_channel_signals_exit_on_eof() {
        let (registry, _rx) = registry_with_peer().await;
        let line = LineChannel::start("sh", ">", None, registry).expect("start");

        line.submit("exit 0").await.expect("submit");
        let mut exit = line.exit_signal().expect("long-lived channel has exit signal");
        timeout(WAIT, exit.wait_for(|exited| *exited))
            .await
            .expect("exit signal timed out")
            .expect("exit watch closed");
        line.shutdown().await;
    }

    #[tokio::test]
    async fn long_lived_spawn_failure_is_process_start() {
        let registry = Arc::new(PeerRegistry::new("host"));
        let err = LineChannel::start("/nonexistent-agent-binary-xyz", ">", None, registry)
            .expect_err("spawn must fail");
        assert!(matches!(err, PartyError::ProcessStart(_)));
    }

    #[tokio::test]
    async fn submit_failure_forces_ready() {
        let (registry, _rx) = registry_with_peer().await;
        let line = LineChannel::start("sh", ">", None, registry).expect("start");
        line.submit("exit 0").await.expect("submit");
        let mut exit = line.exit_signal().expect("exit signal");
        let _ = timeout(WAIT, exit.wait_for(|exited| *exited)).await;
        line.shutdown().await;

        // stdin is gone now; the failed submit must not leave ready stuck false
        let err = line.submit("anyone there?").await;
        assert!(err.is_err());
        assert!(line.is_ready());
    }
}
