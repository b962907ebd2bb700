//! Process execution and management.
//!
//! This module contains the `Supervisor`, which starts and stops registry
//! entries. Starting spawns the configured command in its own process group,
//! forwards stdout/stderr into the entry's output sink and leaves a detached
//! task behind that reaps the child when it exits. Stopping either launches
//! the configured stop command or sends SIGTERM. Neither operation waits for
//! the process to actually go away; the liveness poller handles deaths the
//! supervisor did not cause.
//!
//! `start` and `stop` are synchronous but spawn Tokio tasks, so they must be
//! called from within a runtime.

use std::io::{self, Write};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::errors::{Result, SupervisorError};
use crate::output::{OutputSink, StreamKind};
use crate::poller::{ProcessTable, SysinfoTable};
use crate::process::{AppSpec, ManagedProcess, ProcessStatus, ProcessView, RunState};
use crate::registry::Registry;

/// Starts and stops the entries of a shared [`Registry`].
#[derive(Debug, Clone)]
pub struct Supervisor {
    registry: Arc<Registry>,
}

impl Supervisor {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    #[cfg(test)]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Launches entry `id` and returns its updated view.
    ///
    /// A spawn failure leaves the entry in `Error` and is returned to the
    /// caller.
    pub fn start(&self, id: usize) -> Result<ProcessView> {
        let process = self.entry(id)?;
        let name = process.name();
        process
            .update(RunState::begin_start)
            .map_err(|status| SupervisorError::AlreadyActive {
                name: name.to_string(),
                status: status.to_string(),
            })?;
        info!(app = %name, command = %shell_words::join(process.spec().start_command()), "starting");

        match spawn_app(process) {
            Ok(pid) => {
                process.update(|state| state.mark_running(pid));
                info!(app = %name, pid, "started");
                Ok(process.view())
            }
            Err(source) => {
                process.update(RunState::mark_spawn_failed);
                warn!(app = %name, error = %source, "spawn failed");
                process.sink().note(format!("failed to start: {}", source));
                Err(SupervisorError::Spawn {
                    name: name.to_string(),
                    source,
                })
            }
        }
    }

    /// Stops entry `id` and returns its updated view.
    ///
    /// With a stop command configured, the command is launched and not
    /// awaited. Otherwise SIGTERM is sent to the recorded pid. On failure the
    /// status is left as it was.
    pub fn stop(&self, id: usize) -> Result<ProcessView> {
        let process = self.entry(id)?;
        let name = process.name();

        if let Some(stop_command) = process.spec().stop_command() {
            let pid = spawn_stop_command(process, stop_command).map_err(|source| {
                warn!(app = %name, error = %source, "stop command failed to spawn");
                SupervisorError::StopCommand {
                    name: name.to_string(),
                    source,
                }
            })?;
            info!(app = %name, stop_pid = pid, "stop command launched");
        } else {
            let pid = process.pid().ok_or_else(|| SupervisorError::NotRunning {
                name: name.to_string(),
            })?;
            send_terminate(pid).map_err(|source| {
                warn!(app = %name, pid, error = %source, "failed to send SIGTERM");
                SupervisorError::Signal {
                    name: name.to_string(),
                    pid,
                    source,
                }
            })?;
            info!(app = %name, pid, "sent SIGTERM");
        }

        process.update(RunState::mark_stopped);
        Ok(process.view())
    }

    /// Stops every `Running` entry, then waits at most `timeout` for their
    /// processes to leave the process table.
    pub async fn shutdown_all(&self, timeout: Duration) {
        let mut pending = Vec::new();
        for (id, process) in self.registry.iter() {
            if process.status() != ProcessStatus::Running {
                continue;
            }
            let pid = process.pid();
            match self.stop(id) {
                Ok(_) => pending.extend(pid),
                Err(err) => {
                    warn!(app = %process.name(), error = %err, "stop during shutdown failed")
                }
            }
        }
        if pending.is_empty() {
            return;
        }

        let mut table = SysinfoTable::new();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match table.live_pids(&pending) {
                Ok(live) => pending.retain(|pid| live.contains(pid)),
                Err(err) => {
                    warn!(error = %err, "cannot confirm shutdown");
                    return;
                }
            }
            if pending.is_empty() {
                debug!("all processes exited");
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(remaining = ?pending, "shutdown timed out");
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    fn entry(&self, id: usize) -> Result<&ManagedProcess> {
        self.registry
            .get(id)
            .ok_or(SupervisorError::UnknownProcess(id))
    }
}

fn build_command(spec: &AppSpec, argv: &[String]) -> Command {
    let mut command = Command::new(&argv[0]);
    command.args(&argv[1..]);
    if let Some(cwd) = &spec.cwd {
        command.current_dir(cwd);
    }
    // Inherited environment stays; overrides replace colliding keys.
    command.envs(spec.env().iter().map(|(k, v)| (k.as_str(), v.as_str())));
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    command
}

fn spawn_app(process: &ManagedProcess) -> io::Result<u32> {
    let mut command = build_command(process.spec(), process.spec().start_command());
    command.kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    let mut child = command.spawn()?;
    let pid = child
        .id()
        .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "child exited before its pid was read"))?;
    attach_output(&mut child, process.sink());

    let sink = process.sink().clone();
    let name = process.name().to_string();
    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) => {
                debug!(app = %name, pid, %status, "process exited");
                sink.note(describe_exit(status));
            }
            Err(err) => warn!(app = %name, pid, error = %err, "failed to wait for process"),
        }
    });
    Ok(pid)
}

fn spawn_stop_command(process: &ManagedProcess, argv: &[String]) -> io::Result<u32> {
    let mut command = build_command(process.spec(), argv);
    let mut child = command.spawn()?;
    let pid = child.id().unwrap_or(0);
    attach_output(&mut child, process.sink());

    let name = process.name().to_string();
    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) => debug!(app = %name, %status, "stop command finished"),
            Err(err) => warn!(app = %name, error = %err, "failed to wait for stop command"),
        }
    });
    Ok(pid)
}

fn attach_output(child: &mut Child, sink: &OutputSink) {
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(forward_output(stdout, sink.for_stream(StreamKind::Stdout)));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_output(stderr, sink.for_stream(StreamKind::Stderr)));
    }
}

async fn forward_output<R>(reader: R, mut sink: OutputSink)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::with_capacity(256);
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let _ = sink.write_all(&buf);
            }
            Err(err) => {
                debug!(app = %sink.label(), error = %err, "output stream closed");
                break;
            }
        }
    }
    let _ = sink.flush();
}

fn describe_exit(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("process exited with code {}", code),
        None => "process exited by signal".to_string(),
    }
}

#[cfg(unix)]
fn send_terminate(pid: u32) -> io::Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .ok()
        .filter(|pid| *pid > 1)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "invalid pid"))?;
    // The pid decides success; the group (same id, see `process_group(0)`)
    // is signalled so wrapped children go down too.
    if unsafe { libc::kill(pid, libc::SIGTERM) } != 0 {
        return Err(io::Error::last_os_error());
    }
    unsafe {
        libc::kill(-pid, libc::SIGTERM);
    }
    Ok(())
}

#[cfg(not(unix))]
fn send_terminate(_pid: u32) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "signals are only supported on unix; configure a stop_command",
    ))
}

#[cfg(all(test, unix))]
mod tests {
    use std::os::unix::process::ExitStatusExt;
    use std::path::Path;
    use std::time::Instant;

    use super::*;
    use crate::output::LogFeed;

    fn argv(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn supervisor(specs: Vec<AppSpec>) -> (Supervisor, LogFeed) {
        let feed = LogFeed::new(1000);
        let registry = Registry::from_specs(specs, &feed);
        (Supervisor::new(Arc::new(registry)), feed)
    }

    fn sleep_spec(name: &str, secs: &str) -> AppSpec {
        AppSpec::new(name, argv(&["sleep", secs])).unwrap()
    }

    fn alive(pid: u32) -> bool {
        SysinfoTable::new().live_pids(&[pid]).unwrap().contains(&pid)
    }

    async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        check()
    }

    fn feed_has(feed: &LogFeed, label: &str, text: &str) -> bool {
        feed.window(0, usize::MAX)
            .iter()
            .any(|line| &*line.label == label && line.text == text)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn start_runs_process_visible_in_table() {
        let (supervisor, _feed) = supervisor(vec![sleep_spec("sleep", "10")]);
        let view = supervisor.start(0).unwrap();
        assert_eq!(view.status, ProcessStatus::Running);
        let pid = view.pid.unwrap();
        assert!(pid > 0);

        let mut system = sysinfo::System::new();
        let target = [sysinfo::Pid::from_u32(pid)];
        system.refresh_processes(sysinfo::ProcessesToUpdate::Some(&target), true);
        let found = system.process(target[0]).expect("process in table");
        assert!(found.name().to_string_lossy().contains("sleep"));

        supervisor.stop(0).unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stop_without_stop_command_terminates_process() {
        let (supervisor, _feed) = supervisor(vec![sleep_spec("sleep", "10")]);
        let pid = supervisor.start(0).unwrap().pid.unwrap();

        let view = supervisor.stop(0).unwrap();
        assert_eq!(view.status, ProcessStatus::Stopped);
        assert_eq!(view.pid, None);
        assert!(wait_until(|| !alive(pid)).await);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stop_command_runs_in_cwd_with_env_and_is_not_awaited() {
        let dir = tempfile::tempdir().unwrap();
        let spec = sleep_spec("svc", "10")
            .with_cwd(dir.path())
            .with_env("MARK", "stopped-by-hook")
            .with_stop_command(argv(&["sh", "-c", "echo $MARK > marker.txt; sleep 5"]));
        let (supervisor, _feed) = supervisor(vec![spec]);
        let pid = supervisor.start(0).unwrap().pid.unwrap();

        let started = Instant::now();
        let view = supervisor.stop(0).unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(view.status, ProcessStatus::Stopped);
        assert_eq!(view.pid, None);

        let marker = dir.path().join("marker.txt");
        let read = |path: &Path| std::fs::read_to_string(path).unwrap_or_default();
        assert!(wait_until(|| read(&marker).trim() == "stopped-by-hook").await);

        // The hook above does not touch the original process.
        assert!(alive(pid));
        send_terminate(pid).unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn spawn_failure_marks_error_and_reports() {
        let spec = AppSpec::new("ghost", argv(&["/definitely/not/a/binary"])).unwrap();
        let (supervisor, feed) = supervisor(vec![spec]);
        let err = supervisor.start(0).unwrap_err();
        assert!(matches!(err, SupervisorError::Spawn { ref name, .. } if name == "ghost"));

        let view = supervisor.registry().view(0).unwrap();
        assert_eq!(view.status, ProcessStatus::Error);
        assert_eq!(view.pid, None);
        assert!(feed
            .window(0, usize::MAX)
            .iter()
            .any(|line| line.text.starts_with("failed to start")));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn start_is_refused_while_running() {
        let (supervisor, _feed) = supervisor(vec![sleep_spec("sleep", "10")]);
        let pid = supervisor.start(0).unwrap().pid;
        let err = supervisor.start(0).unwrap_err();
        assert!(matches!(err, SupervisorError::AlreadyActive { .. }));
        assert_eq!(supervisor.registry().view(0).unwrap().pid, pid);
        supervisor.stop(0).unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stop_failures_leave_status_unchanged() {
        let (supervisor, _feed) = supervisor(vec![sleep_spec("sleep", "10")]);
        let err = supervisor.stop(0).unwrap_err();
        assert!(matches!(err, SupervisorError::NotRunning { .. }));
        assert_eq!(
            supervisor.registry().view(0).unwrap().status,
            ProcessStatus::Stopped
        );

        assert!(matches!(
            supervisor.stop(9),
            Err(SupervisorError::UnknownProcess(9))
        ));
        assert!(matches!(
            supervisor.start(9),
            Err(SupervisorError::UnknownProcess(9))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn output_is_labeled_and_exit_is_noted() {
        let spec = AppSpec::new("echoer", argv(&["sh", "-c", "echo hello; echo oops >&2"]))
            .unwrap()
            .with_env("HOME", "/custom/home");
        let other = AppSpec::new("env", argv(&["sh", "-c", "echo $HOME"]))
            .unwrap()
            .with_env("HOME", "/custom/home");
        let (supervisor, feed) = supervisor(vec![spec, other]);
        supervisor.start(0).unwrap();
        supervisor.start(1).unwrap();

        assert!(wait_until(|| feed_has(&feed, "echoer", "process exited with code 0")).await);
        assert!(wait_until(|| feed_has(&feed, "env", "/custom/home")).await);
        assert!(feed_has(&feed, "echoer", "hello"));
        let lines = feed.window(0, usize::MAX);
        let oops = lines.iter().find(|line| line.text == "oops").unwrap();
        assert_eq!(oops.stream, StreamKind::Stderr);
        assert_eq!(&*oops.label, "echoer");

        // Natural exit does not change status; that is the poller's job.
        assert_eq!(
            supervisor.registry().view(0).unwrap().status,
            ProcessStatus::Running
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn shutdown_all_stops_running_entries() {
        let (supervisor, _feed) = supervisor(vec![
            sleep_spec("a", "10"),
            sleep_spec("b", "10"),
            sleep_spec("c", "10"),
        ]);
        let a = supervisor.start(0).unwrap().pid.unwrap();
        let c = supervisor.start(2).unwrap().pid.unwrap();

        supervisor.shutdown_all(Duration::from_secs(3)).await;

        for view in supervisor.registry().views() {
            assert_eq!(view.status, ProcessStatus::Stopped);
            assert_eq!(view.pid, None);
        }
        assert!(!alive(a));
        assert!(!alive(c));
    }

    #[test]
    fn describe_exit_mentions_code() {
        assert_eq!(
            describe_exit(ExitStatus::from_raw(3 << 8)),
            "process exited with code 3"
        );
        assert_eq!(
            describe_exit(ExitStatus::from_raw(libc::SIGTERM)),
            "process exited by signal"
        );
    }
}
