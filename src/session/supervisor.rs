//! Child process supervision for decoder, tuner and player processes.
//!
//! Each session owns its own `Supervisor`; there is no process-wide registry.
//! Output is pumped by tokio tasks into a bounded line channel, so reading
//! decoder logs never blocks frame pulling.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const LINE_CHANNEL_CAPACITY: usize = 256;

pub type ProcessId = u64;

#[derive(Debug, thiserror::Error)]
#[error("failed to spawn '{program}': {source}")]
pub struct SpawnError {
    pub program: String,
    #[source]
    pub source: std::io::Error,
}

/// Identifies one supervised process. The argv is fixed once spawned.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    id: ProcessId,
    argv: Arc<[String]>,
}

impl ProcessHandle {
    #[cfg(test)]
    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub fn program(&self) -> &str {
        self.argv.first().map(String::as_str).unwrap_or("")
    }
}

#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    pub working_dir: Option<PathBuf>,
    /// stderr 行并入行流
    pub merge_stderr: bool,
    /// stdout 作为原始字节流交给调用者，不参与行流
    pub raw_stdout: bool,
    pub pipe_stdin: bool,
}

/// Lazy, finite sequence of output lines. Ends when every captured pipe has
/// closed; cannot be restarted.
pub struct LineStream {
    rx: mpsc::Receiver<String>,
}

impl LineStream {
    pub async fn next_line(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

pub struct Spawned {
    pub handle: ProcessHandle,
    pub lines: LineStream,
    pub stdout: Option<ChildStdout>,
    pub stdin: Option<ChildStdin>,
}

struct Tracked {
    argv: Arc<[String]>,
    child: Child,
    exit: Option<ExitStatus>,
    pumps: Vec<JoinHandle<()>>,
}

#[derive(Default)]
pub struct Supervisor {
    next_id: ProcessId,
    processes: HashMap<ProcessId, Tracked>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a child process. Returns as soon as the OS has created it.
    pub fn spawn(
        &mut self,
        argv: &[String],
        options: &SpawnOptions,
    ) -> Result<Spawned, SpawnError> {
        let Some((program, args)) = argv.split_first() else {
            return Err(SpawnError {
                program: String::new(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty argv"),
            });
        };

        let mut command = Command::new(program);
        command
            .args(args)
            .stdout(Stdio::piped())
            .stderr(if options.merge_stderr { Stdio::piped() } else { Stdio::null() })
            .stdin(if options.pipe_stdin { Stdio::piped() } else { Stdio::null() })
            .kill_on_drop(true);
        if let Some(dir) = &options.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|source| SpawnError {
            program: program.clone(),
            source,
        })?;

        let (tx, rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
        let mut pumps = Vec::new();
        let mut raw_stdout = None;

        if let Some(stdout) = child.stdout.take() {
            if options.raw_stdout {
                raw_stdout = Some(stdout);
            } else {
                pumps.push(pump_lines(stdout, program.clone(), tx.clone()));
            }
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(pump_lines(stderr, program.clone(), tx.clone()));
        }
        drop(tx);

        let stdin = child.stdin.take();

        let id = self.next_id;
        self.next_id += 1;
        let argv: Arc<[String]> = argv.into();

        log::info!("Spawned process #{} (pid {:?}): {}", id, child.id(), argv.join(" "));

        self.processes.insert(
            id,
            Tracked {
                argv: argv.clone(),
                child,
                exit: None,
                pumps,
            },
        );

        Ok(Spawned {
            handle: ProcessHandle { id, argv },
            lines: LineStream { rx },
            stdout: raw_stdout,
            stdin,
        })
    }

    /// Kill and reap. Killing a process that already exited is a no-op that
    /// returns its recorded status.
    pub async fn kill(&mut self, handle: &ProcessHandle) -> Option<ExitStatus> {
        let tracked = self.processes.get_mut(&handle.id)?;
        if let Some(status) = tracked.exit {
            return Some(status);
        }

        if let Err(e) = tracked.child.start_kill() {
            // 进程已自行退出，仍需 wait 回收
            log::debug!("start_kill on #{} failed: {}", handle.id, e);
        }
        let status = match tracked.child.wait().await {
            Ok(status) => Some(status),
            Err(e) => {
                log::warn!("Failed to reap process #{} ({}): {}", handle.id, tracked.argv[0], e);
                None
            }
        };
        tracked.exit = status;
        for pump in tracked.pumps.drain(..) {
            pump.abort();
        }

        log::info!("Process #{} ({}) stopped: {:?}", handle.id, tracked.argv[0], status);
        status
    }

    /// Non-blocking exit status poll.
    pub fn exit_status(&mut self, handle: &ProcessHandle) -> Option<ExitStatus> {
        let tracked = self.processes.get_mut(&handle.id)?;
        if tracked.exit.is_none() {
            match tracked.child.try_wait() {
                Ok(status) => tracked.exit = status,
                Err(e) => log::warn!("try_wait on #{} failed: {}", handle.id, e),
            }
        }
        tracked.exit
    }

    /// Number of tracked processes that have not been observed to exit.
    #[cfg(test)]
    pub fn running_count(&mut self) -> usize {
        let mut running = 0;
        for tracked in self.processes.values_mut() {
            if tracked.exit.is_some() {
                continue;
            }
            match tracked.child.try_wait() {
                Ok(None) => running += 1,
                Ok(status) => tracked.exit = status,
                Err(_) => {}
            }
        }
        running
    }

    /// Kill every tracked process, newest first, and forget them.
    pub async fn shutdown(&mut self) {
        let mut ids: Vec<ProcessId> = self.processes.keys().copied().collect();
        ids.sort_unstable_by(|a, b| b.cmp(a));
        for id in ids {
            let argv = self.processes[&id].argv.clone();
            self.kill(&ProcessHandle { id, argv }).await;
        }
        self.processes.clear();
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        for (id, tracked) in self.processes.iter_mut() {
            if tracked.exit.is_none() {
                log::warn!("Supervisor dropped with live process #{} ({})", id, tracked.argv[0]);
                let _ = tracked.child.start_kill();
            }
            for pump in tracked.pumps.drain(..) {
                pump.abort();
            }
        }
    }
}

/// Forward lines until the pipe closes. Once the reader side is gone the
/// pipe keeps being drained so the child never blocks on a full pipe.
fn pump_lines<R>(reader: R, program: String, tx: mpsc::Sender<String>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::with_capacity(256);
        let mut forwarding = true;
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf)
                        .trim_end_matches(['\r', '\n'])
                        .to_string();
                    log::debug!("[{}] {}", program, line);
                    if forwarding && tx.send(line).await.is_err() {
                        forwarding = false;
                    }
                }
                Err(e) => {
                    log::warn!("[{}] output read error: {}", program, e);
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".into(), "-c".into(), script.into()]
    }

    fn merged() -> SpawnOptions {
        SpawnOptions { merge_stderr: true, ..Default::default() }
    }

    #[tokio::test]
    async fn merges_stdout_and_stderr_lines() {
        let mut supervisor = Supervisor::new();
        let mut spawned = supervisor
            .spawn(&sh("echo out; sleep 0.1; echo err 1>&2"), &merged())
            .unwrap();

        let mut lines = Vec::new();
        while let Some(line) = spawned.lines.next_line().await {
            lines.push(line);
        }
        assert_eq!(lines, vec!["out".to_string(), "err".to_string()]);
    }

    #[tokio::test]
    async fn missing_executable_is_spawn_error() {
        let mut supervisor = Supervisor::new();
        let err = supervisor
            .spawn(&["/nonexistent/decoder-binary".to_string()], &merged())
            .err()
            .unwrap();
        assert_eq!(err.program, "/nonexistent/decoder-binary");
        assert_eq!(supervisor.running_count(), 0);
    }

    #[tokio::test]
    async fn empty_argv_is_spawn_error() {
        let mut supervisor = Supervisor::new();
        assert!(supervisor.spawn(&[], &merged()).is_err());
    }

    #[tokio::test]
    async fn kill_is_idempotent() {
        let mut supervisor = Supervisor::new();
        let spawned = supervisor.spawn(&sh("exec sleep 30"), &merged()).unwrap();
        assert!(supervisor.exit_status(&spawned.handle).is_none());

        let first = supervisor.kill(&spawned.handle).await;
        assert!(first.is_some());
        assert!(!first.unwrap().success());
        let second = supervisor.kill(&spawned.handle).await;
        assert_eq!(first, second);
        assert_eq!(supervisor.exit_status(&spawned.handle), first);
        assert_eq!(supervisor.running_count(), 0);
    }

    #[tokio::test]
    async fn killing_an_exited_process_is_not_an_error() {
        let mut supervisor = Supervisor::new();
        let mut spawned = supervisor.spawn(&sh("echo done"), &merged()).unwrap();
        while spawned.lines.next_line().await.is_some() {}
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let status = supervisor.kill(&spawned.handle).await;
        assert!(status.unwrap().success());
    }

    #[tokio::test]
    async fn kill_ends_line_stream() {
        let mut supervisor = Supervisor::new();
        let mut spawned = supervisor
            .spawn(&sh("echo booting; exec sleep 30"), &merged())
            .unwrap();
        assert_eq!(spawned.lines.next_line().await.as_deref(), Some("booting"));

        supervisor.kill(&spawned.handle).await;
        assert!(spawned.lines.next_line().await.is_none());
    }

    #[tokio::test]
    async fn raw_stdout_is_handed_over() {
        let mut supervisor = Supervisor::new();
        let options = SpawnOptions { merge_stderr: true, raw_stdout: true, ..Default::default() };
        let mut spawned = supervisor
            .spawn(&sh("printf 'abcd'; echo 'Tuned to 99.5' 1>&2"), &options)
            .unwrap();

        let mut raw = Vec::new();
        spawned.stdout.take().unwrap().read_to_end(&mut raw).await.unwrap();
        assert_eq!(raw, b"abcd");
        assert_eq!(spawned.lines.next_line().await.as_deref(), Some("Tuned to 99.5"));
    }

    #[tokio::test]
    async fn shutdown_kills_everything() {
        let mut supervisor = Supervisor::new();
        let a = supervisor.spawn(&sh("exec sleep 30"), &merged()).unwrap();
        let b = supervisor.spawn(&sh("exec sleep 30"), &merged()).unwrap();
        assert_eq!(supervisor.running_count(), 2);
        assert_ne!(a.handle.id(), b.handle.id());

        supervisor.shutdown().await;
        assert_eq!(supervisor.running_count(), 0);
        assert!(supervisor.exit_status(&a.handle).is_none());
    }

    #[tokio::test]
    async fn working_dir_is_applied() {
        let dir = tempfile::tempdir().unwrap();
        let mut supervisor = Supervisor::new();
        let options = SpawnOptions {
            working_dir: Some(dir.path().to_path_buf()),
            merge_stderr: true,
            ..Default::default()
        };
        let mut spawned = supervisor.spawn(&sh("pwd"), &options).unwrap();
        let line = spawned.lines.next_line().await.unwrap();
        assert_eq!(
            std::fs::canonicalize(line).unwrap(),
            std::fs::canonicalize(dir.path()).unwrap()
        );
    }
}
