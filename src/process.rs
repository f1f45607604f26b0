//! Spawning yt-dlp / ffmpeg and feeding their output to a line callback.

use bytes::BytesMut;
use std::collections::HashMap;
use std::ffi::OsString;
use std::io;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::codec::{Decoder, FramedRead};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::locks::resilient_lock;

/// Upper bound on the secondary stream text kept for the trailing diagnostic.
const MAX_DIAGNOSTIC_BYTES: u64 = 64 * 1024;

/// How long stderr may stay open after the tool itself has exited.
const DIAGNOSTICS_GRACE: Duration = Duration::from_secs(1);

/// Which pipe carries the lines the caller cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrimaryStream {
    #[default]
    Stdout,
    /// ffmpeg writes its `-stats` output to stderr.
    Stderr,
}

/// Returned by the line callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineControl {
    Continue,
    /// Kill the process now; no further output lines are delivered.
    Stop,
}

/// What the line callback receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputLine<'a> {
    /// One line of the primary stream.
    Line(&'a str),
    /// Everything the tool wrote to stderr, delivered once after it exits.
    Diagnostics(&'a str),
    /// The process has exited. Always the last thing delivered.
    End,
}

impl<'a> OutputLine<'a> {
    pub fn text(&self) -> Option<&'a str> {
        match self {
            OutputLine::Line(text) | OutputLine::Diagnostics(text) => Some(text),
            OutputLine::End => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The primary stream ran to its end and the process exited.
    Exited(ExitStatus),
    /// The callback asked to stop and the process was killed.
    Stopped,
}

/// Every child process currently running, so shutdown can kill them all.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    state: Mutex<RegistryState>,
}

#[derive(Debug, Default)]
struct RegistryState {
    next_id: u64,
    closed: bool,
    running: HashMap<u64, CancellationToken>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of processes currently registered.
    pub fn len(&self) -> usize {
        resilient_lock(&self.state).running.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Refuses any further registrations and signals every running process
    /// to be killed. Returns how many were signalled.
    pub fn kill_all(&self) -> usize {
        let mut state = resilient_lock(&self.state);
        state.closed = true;
        for token in state.running.values() {
            token.cancel();
        }
        state.running.len()
    }

    fn register(self: &Arc<Self>) -> Result<Registration> {
        let mut state = resilient_lock(&self.state);
        if state.closed {
            return Err(Error::Cancelled);
        }
        let id = state.next_id;
        state.next_id += 1;
        let token = CancellationToken::new();
        state.running.insert(id, token.clone());
        Ok(Registration { registry: Arc::clone(self), id, token })
    }
}

/// Removes its process from the registry however `run` exits.
struct Registration {
    registry: Arc<ProcessRegistry>,
    id: u64,
    token: CancellationToken,
}

impl Drop for Registration {
    fn drop(&mut self) {
        resilient_lock(&self.registry.state).running.remove(&self.id);
    }
}

/// Runs external tools one at a time per caller, streaming their output.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    registry: Arc<ProcessRegistry>,
}

enum Pumped {
    Drained,
    Stopped,
    Cancelled,
}

impl ProcessRunner {
    pub fn new(registry: Arc<ProcessRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    /// Runs `program` to completion, handing each line of the `primary`
    /// stream to `on_line` as it arrives.
    ///
    /// When stdout is primary and the callback never stopped, whatever the
    /// tool wrote to stderr follows as a single [`OutputLine::Diagnostics`].
    /// [`OutputLine::End`] is delivered once the process has been reaped.
    ///
    /// Fails with [`Error::Cancelled`] if the registry was shut down before or
    /// while the process ran.
    pub async fn run<F>(
        &self,
        program: &Path,
        args: &[OsString],
        primary: PrimaryStream,
        mut on_line: F,
    ) -> Result<RunOutcome>
    where
        F: FnMut(OutputLine<'_>) -> LineControl,
    {
        let registration = self.registry.register()?;
        let token = registration.token.clone();

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| Error::Spawn { program: program.to_path_buf(), source })?;

        let name = program
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        tracing::debug!("Started {} (pid {:?}) with {:?}", name, child.id(), args);

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("stdout was not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| io::Error::other("stderr was not captured"))?;

        // The other pipe is drained alongside so the child never blocks on it.
        let (pumped, collector) = match primary {
            PrimaryStream::Stdout => {
                let collector = tokio::spawn(collect_text(stderr));
                let mut lines = FramedRead::new(stdout, LineCodec::default());
                let pumped = pump(&name, &mut lines, &token, &mut on_line).await;
                (pumped, Some(collector))
            }
            PrimaryStream::Stderr => {
                let discard = tokio::spawn(async move {
                    let mut stdout = stdout;
                    let _ = tokio::io::copy(&mut stdout, &mut tokio::io::sink()).await;
                });
                let mut lines = FramedRead::new(stderr, LineCodec::default());
                let pumped = pump(&name, &mut lines, &token, &mut on_line).await;
                discard.abort();
                (pumped, None)
            }
        };

        let pumped = match pumped {
            Ok(pumped) => pumped,
            Err(e) => {
                abort_collector(collector);
                reap(&name, &mut child).await;
                return Err(e);
            }
        };

        let outcome = match pumped {
            Pumped::Drained => {
                // The primary stream closing does not mean the tool is done.
                let status = tokio::select! {
                    status = child.wait() => status,
                    _ = token.cancelled() => {
                        abort_collector(collector);
                        reap(&name, &mut child).await;
                        return Err(Error::Cancelled);
                    }
                };
                let status = match status {
                    Ok(status) => status,
                    Err(e) => {
                        abort_collector(collector);
                        return Err(e.into());
                    }
                };

                if let Some(collector) = collector {
                    let diagnostics = finish_diagnostics(collector, &token).await;
                    if let Some(text) = diagnostics.as_deref().map(str::trim_end) {
                        if !text.is_empty() {
                            tracing::debug!("[{}] {}", name, text);
                            // The process is already reaped; the answer changes nothing.
                            let _ = on_line(OutputLine::Diagnostics(text));
                        }
                    }
                }
                RunOutcome::Exited(status)
            }
            Pumped::Stopped => {
                abort_collector(collector);
                reap(&name, &mut child).await;
                RunOutcome::Stopped
            }
            Pumped::Cancelled => {
                abort_collector(collector);
                reap(&name, &mut child).await;
                return Err(Error::Cancelled);
            }
        };

        tracing::debug!("{} finished: {:?}", name, outcome);
        on_line(OutputLine::End);
        Ok(outcome)
    }
}

async fn pump<R, F>(
    name: &str,
    lines: &mut FramedRead<R, LineCodec>,
    token: &CancellationToken,
    on_line: &mut F,
) -> Result<Pumped>
where
    R: AsyncRead + Unpin,
    F: FnMut(OutputLine<'_>) -> LineControl,
{
    loop {
        let next = tokio::select! {
            _ = token.cancelled() => return Ok(Pumped::Cancelled),
            next = lines.next() => next,
        };
        match next {
            Some(line) => {
                let line = line?;
                tracing::debug!("[{}] {}", name, line);
                if on_line(OutputLine::Line(&line)) == LineControl::Stop {
                    return Ok(Pumped::Stopped);
                }
            }
            None => return Ok(Pumped::Drained),
        }
    }
}

/// Kills and waits for the child; an already-exited child is fine.
async fn reap(name: &str, child: &mut tokio::process::Child) {
    if let Err(e) = child.kill().await {
        tracing::debug!("{} had already exited: {}", name, e);
    }
}

fn abort_collector(collector: Option<JoinHandle<String>>) {
    if let Some(collector) = collector {
        collector.abort();
    }
}

/// Stderr text of a tool that has exited. A grandchild still holding the pipe
/// only gets [`DIAGNOSTICS_GRACE`] before the text is given up on.
async fn finish_diagnostics(
    mut collector: JoinHandle<String>,
    token: &CancellationToken,
) -> Option<String> {
    let text = tokio::select! {
        text = &mut collector => text.ok(),
        _ = tokio::time::sleep(DIAGNOSTICS_GRACE) => None,
        _ = token.cancelled() => None,
    };
    collector.abort();
    text
}

async fn collect_text<R>(reader: R) -> String
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let mut limited = reader.take(MAX_DIAGNOSTIC_BYTES);
    if let Err(e) = limited.read_to_end(&mut buf).await {
        tracing::debug!("Failed to read diagnostics: {}", e);
    }
    let mut rest = limited.into_inner();
    let _ = tokio::io::copy(&mut rest, &mut tokio::io::sink()).await;
    String::from_utf8_lossy(&buf).into_owned()
}

/// Splits on `\n`, `\r` or `\r\n`.
///
/// ffmpeg redraws its stats line with a bare carriage return, so `\r` must end
/// a line on its own.
#[derive(Debug, Default)]
pub struct LineCodec {
    next_index: usize,
    after_cr: bool,
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<String>> {
        if self.after_cr && !buf.is_empty() {
            if buf[0] == b'\n' {
                let _ = buf.split_to(1);
            }
            self.after_cr = false;
        }

        let Some(offset) = buf[self.next_index..]
            .iter()
            .position(|b| *b == b'\n' || *b == b'\r')
        else {
            self.next_index = buf.len();
            return Ok(None);
        };

        let end = self.next_index + offset;
        self.after_cr = buf[end] == b'\r';
        self.next_index = 0;
        let line = buf.split_to(end + 1);
        Ok(Some(String::from_utf8_lossy(&line[..end]).into_owned()))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> io::Result<Option<String>> {
        if let Some(line) = self.decode(buf)? {
            return Ok(Some(line));
        }
        if buf.is_empty() {
            return Ok(None);
        }
        self.next_index = 0;
        let line = buf.split_to(buf.len());
        Ok(Some(String::from_utf8_lossy(&line).into_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(input: &[u8]) -> Vec<String> {
        let mut codec = LineCodec::default();
        let mut buf = BytesMut::from(input);
        let mut out = Vec::new();
        while let Some(line) = codec.decode_eof(&mut buf).unwrap() {
            out.push(line);
        }
        out
    }

    #[test]
    fn codec_splits_on_every_line_ending() {
        assert_eq!(decode_all(b"a\nb\r\nc\rd"), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn codec_handles_crlf_split_across_reads() {
        let mut codec = LineCodec::default();
        let mut buf = BytesMut::from(&b"first\r"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("first"));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(b"\nsecond\n");
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("second"));
    }

    #[test]
    fn codec_keeps_partial_line_until_more_data() {
        let mut codec = LineCodec::default();
        let mut buf = BytesMut::from(&b"size=  1kB"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(b" speed=1x\r");
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("size=  1kB speed=1x"));
    }

    #[test]
    fn closed_registry_refuses_new_processes() {
        let registry = Arc::new(ProcessRegistry::new());
        let held = registry.register().unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.kill_all(), 1);
        assert!(held.token.is_cancelled());
        assert!(matches!(registry.register(), Err(Error::Cancelled)));
        drop(held);
        assert!(registry.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn run_delivers_lines_diagnostics_then_end() {
        let runner = ProcessRunner::new(Arc::new(ProcessRegistry::new()));
        let args: Vec<OsString> = vec!["-c".into(), "echo one; echo two; echo oops >&2".into()];
        let mut seen = Vec::new();
        let outcome = runner
            .run(Path::new("/bin/sh"), &args, PrimaryStream::Stdout, |line| {
                seen.push(format!("{:?}", line));
                LineControl::Continue
            })
            .await
            .unwrap();
        assert!(matches!(outcome, RunOutcome::Exited(status) if status.success()));
        assert_eq!(
            seen,
            vec![
                r#"Line("one")"#.to_string(),
                r#"Line("two")"#.to_string(),
                r#"Diagnostics("oops")"#.to_string(),
                "End".to_string(),
            ]
        );
        assert!(runner.registry().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stop_kills_the_process_and_skips_diagnostics() {
        let runner = ProcessRunner::new(Arc::new(ProcessRegistry::new()));
        let args: Vec<OsString> =
            vec!["-c".into(), "echo first; echo noise >&2; sleep 30; echo never".into()];
        let mut seen = Vec::new();
        let started = std::time::Instant::now();
        let outcome = runner
            .run(Path::new("/bin/sh"), &args, PrimaryStream::Stdout, |line| {
                seen.push(line.text().map(str::to_string));
                LineControl::Stop
            })
            .await
            .unwrap();
        assert_eq!(outcome, RunOutcome::Stopped);
        assert_eq!(seen, vec![Some("first".to_string()), None]);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn kill_all_reaches_a_tool_that_closed_stdout() {
        let runner = ProcessRunner::new(Arc::new(ProcessRegistry::new()));
        let task = tokio::spawn({
            let runner = runner.clone();
            async move {
                let args: Vec<OsString> = vec!["-c".into(), "exec 1>&-; exec sleep 20".into()];
                runner
                    .run(Path::new("/bin/sh"), &args, PrimaryStream::Stdout, |_| LineControl::Continue)
                    .await
            }
        });

        while runner.registry().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        // Let the tool get past closing stdout.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let started = std::time::Instant::now();
        assert_eq!(runner.registry().kill_all(), 1);
        let result = task.await.unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(runner.registry().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stray_grandchild_holding_stderr_does_not_stall_the_run() {
        let runner = ProcessRunner::new(Arc::new(ProcessRegistry::new()));
        let args: Vec<OsString> = vec!["-c".into(), "sleep 20 >/dev/null & echo done".into()];
        let mut seen = Vec::new();
        let started = std::time::Instant::now();
        let outcome = runner
            .run(Path::new("/bin/sh"), &args, PrimaryStream::Stdout, |line| {
                seen.push(format!("{:?}", line));
                LineControl::Continue
            })
            .await
            .unwrap();
        assert!(matches!(outcome, RunOutcome::Exited(status) if status.success()));
        assert_eq!(seen, vec![r#"Line("done")"#.to_string(), "End".to_string()]);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let runner = ProcessRunner::new(Arc::new(ProcessRegistry::new()));
        let result = runner
            .run(
                Path::new("/definitely/not/a/tool"),
                &[],
                PrimaryStream::Stdout,
                |_| LineControl::Continue,
            )
            .await;
        assert!(matches!(result, Err(Error::Spawn { .. })));
        assert!(runner.registry().is_empty());
    }
}
