//! Liveness polling.
//!
//! Processes can die without the supervisor noticing: they crash, exit on
//! their own or get killed from another terminal. On a fixed interval the
//! [`LivenessPoller`] asks the OS process table about every `Running` entry
//! and moves the ones that are gone to `Error`. Entries in any other status
//! are never touched.
//!
//! The check is by pid only. If the OS hands the same pid to an unrelated
//! process between the death and the next tick, the entry keeps looking
//! alive.

use std::collections::HashSet;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::events::Event;
use crate::registry::Registry;

/// Source of truth for which pids are alive.
pub trait ProcessTable: Send {
    /// Returns the subset of `pids` that denote live processes.
    fn live_pids(&mut self, pids: &[u32]) -> io::Result<HashSet<u32>>;
}

/// [`ProcessTable`] backed by `sysinfo`. Zombies count as dead.
pub struct SysinfoTable {
    system: System,
}

impl SysinfoTable {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl Default for SysinfoTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable for SysinfoTable {
    fn live_pids(&mut self, pids: &[u32]) -> io::Result<HashSet<u32>> {
        let targets: Vec<Pid> = pids.iter().copied().map(Pid::from_u32).collect();
        self.system
            .refresh_processes(ProcessesToUpdate::Some(&targets), true);
        Ok(pids
            .iter()
            .copied()
            .filter(|pid| {
                self.system
                    .process(Pid::from_u32(*pid))
                    .is_some_and(|p| p.status() != sysinfo::ProcessStatus::Zombie)
            })
            .collect())
    }
}

pub struct LivenessPoller<T> {
    registry: Arc<Registry>,
    table: T,
}

impl<T: ProcessTable> LivenessPoller<T> {
    pub fn new(registry: Arc<Registry>, table: T) -> Self {
        Self { registry, table }
    }

    /// Runs one scan and returns `(index, pid)` of entries moved to `Error`.
    ///
    /// A failed table query is logged and the whole cycle skipped.
    pub fn poll_once(&mut self) -> Vec<(usize, u32)> {
        let running = self.registry.running();
        if running.is_empty() {
            return Vec::new();
        }
        let pids: Vec<u32> = running.iter().map(|(_, pid)| *pid).collect();
        let live = match self.table.live_pids(&pids) {
            Ok(live) => live,
            Err(err) => {
                warn!(error = %err, "process table query failed; skipping poll");
                return Vec::new();
            }
        };

        let mut lost = Vec::new();
        for (id, pid) in running {
            if live.contains(&pid) {
                continue;
            }
            let Some(process) = self.registry.get(id) else {
                continue;
            };
            // Only if nothing changed the entry since the snapshot above.
            if process.update(|state| state.mark_lost(pid)) {
                warn!(app = %process.name(), pid, "process is no longer running");
                process
                    .sink()
                    .note(format!("process {} is no longer running", pid));
                lost.push((id, pid));
            }
        }
        lost
    }
}

impl<T: ProcessTable + 'static> LivenessPoller<T> {
    /// Polls every `interval` until the task is aborted or `events` closes.
    pub fn spawn(mut self, interval: Duration, events: mpsc::Sender<Event>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            debug!(interval_ms = interval.as_millis() as u64, "liveness poller started");
            loop {
                ticker.tick().await;
                for (id, pid) in self.poll_once() {
                    if events.send(Event::ProcessLost { id, pid }).await.is_err() {
                        return;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::output::LogFeed;
    use crate::process::{AppSpec, ProcessStatus};

    #[derive(Clone, Default)]
    struct FakeTable {
        alive: Arc<Mutex<HashSet<u32>>>,
        fail: Arc<Mutex<bool>>,
    }

    impl ProcessTable for FakeTable {
        fn live_pids(&mut self, pids: &[u32]) -> io::Result<HashSet<u32>> {
            if *self.fail.lock().unwrap() {
                return Err(io::Error::new(io::ErrorKind::Other, "proc unavailable"));
            }
            let alive = self.alive.lock().unwrap();
            Ok(pids.iter().copied().filter(|p| alive.contains(p)).collect())
        }
    }

    fn registry(names: &[&str]) -> (Arc<Registry>, LogFeed) {
        let feed = LogFeed::new(100);
        let specs = names
            .iter()
            .map(|name| AppSpec::new(*name, vec!["sleep".into(), "30".into()]).unwrap())
            .collect();
        (Arc::new(Registry::from_specs(specs, &feed)), feed)
    }

    fn set_running(registry: &Registry, id: usize, pid: u32) {
        registry.get(id).unwrap().update(|state| {
            state.begin_start().unwrap();
            state.mark_running(pid);
        });
    }

    #[test]
    fn vanished_running_entry_becomes_error() {
        let (registry, feed) = registry(&["a", "b"]);
        set_running(&registry, 0, 100);
        set_running(&registry, 1, 200);
        let table = FakeTable::default();
        table.alive.lock().unwrap().insert(200);

        let mut poller = LivenessPoller::new(registry.clone(), table);
        assert_eq!(poller.poll_once(), vec![(0, 100)]);

        let a = registry.view(0).unwrap();
        assert_eq!((a.status, a.pid), (ProcessStatus::Error, None));
        let b = registry.view(1).unwrap();
        assert_eq!((b.status, b.pid), (ProcessStatus::Running, Some(200)));
        assert!(feed
            .window(0, 10)
            .iter()
            .any(|l| &*l.label == "a" && l.text == "process 100 is no longer running"));

        // Already Error: not reported again.
        assert!(poller.poll_once().is_empty());
    }

    #[test]
    fn stopped_and_error_entries_are_never_touched() {
        let (registry, _feed) = registry(&["stopped", "error", "starting"]);
        registry.get(1).unwrap().update(|state| {
            state.begin_start().unwrap();
            state.mark_spawn_failed();
        });
        registry.get(2).unwrap().update(|state| state.begin_start().unwrap());

        let mut poller = LivenessPoller::new(registry.clone(), FakeTable::default());
        assert!(poller.poll_once().is_empty());
        let statuses: Vec<_> = registry.views().into_iter().map(|v| v.status).collect();
        assert_eq!(
            statuses,
            vec![
                ProcessStatus::Stopped,
                ProcessStatus::Error,
                ProcessStatus::Starting
            ]
        );
    }

    #[test]
    fn failed_query_skips_the_cycle() {
        let (registry, _feed) = registry(&["a"]);
        set_running(&registry, 0, 100);
        let table = FakeTable::default();
        *table.fail.lock().unwrap() = true;

        let mut poller = LivenessPoller::new(registry.clone(), table.clone());
        assert!(poller.poll_once().is_empty());
        assert_eq!(registry.view(0).unwrap().status, ProcessStatus::Running);

        *table.fail.lock().unwrap() = false;
        assert_eq!(poller.poll_once(), vec![(0, 100)]);
    }

    #[test]
    fn sysinfo_table_sees_self_but_not_bogus_pid() {
        let me = std::process::id();
        let bogus = u32::MAX - 7;
        let live = SysinfoTable::new().live_pids(&[me, bogus]).unwrap();
        assert!(live.contains(&me));
        assert!(!live.contains(&bogus));
    }

    #[tokio::test]
    async fn spawned_poller_reports_lost_processes() {
        let (registry, _feed) = registry(&["a"]);
        set_running(&registry, 0, 100);
        let (tx, mut rx) = mpsc::channel(8);
        let handle = LivenessPoller::new(registry.clone(), FakeTable::default())
            .spawn(Duration::from_millis(10), tx);

        match rx.recv().await {
            Some(Event::ProcessLost { id, pid }) => assert_eq!((id, pid), (0, 100)),
            other => panic!("unexpected event {:?}", other),
        }
        handle.abort();
        assert_eq!(registry.view(0).unwrap().status, ProcessStatus::Error);
    }
}

#[cfg(all(test, unix))]
mod live_tests {
    use std::time::Instant;

    use super::*;
    use crate::output::LogFeed;
    use crate::process::{AppSpec, ProcessStatus, ProcessView};
    use crate::runner::Supervisor;

    fn supervisor(specs: Vec<AppSpec>) -> Supervisor {
        let feed = LogFeed::new(1000);
        Supervisor::new(Arc::new(Registry::from_specs(specs, &feed)))
    }

    fn sleep_spec(name: &str, secs: &str) -> AppSpec {
        AppSpec::new(name, vec!["sleep".into(), secs.into()]).unwrap()
    }

    async fn poll_until_error(poller: &mut LivenessPoller<SysinfoTable>, id: usize) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if poller.poll_once().iter().any(|(lost, _)| *lost == id) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn killed_out_of_band_becomes_error() {
        let supervisor = supervisor(vec![sleep_spec("victim", "30"), sleep_spec("bystander", "30")]);
        let pid = supervisor.start(0).unwrap().pid.unwrap();
        supervisor.start(1).unwrap();

        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGKILL);
        }

        let mut poller = LivenessPoller::new(supervisor.registry().clone(), SysinfoTable::new());
        assert!(poll_until_error(&mut poller, 0).await);
        let victim = supervisor.registry().view(0).unwrap();
        assert_eq!((victim.status, victim.pid), (ProcessStatus::Error, None));
        assert_eq!(
            supervisor.registry().view(1).unwrap().status,
            ProcessStatus::Running
        );
        supervisor.stop(1).unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn natural_exit_is_detected_and_stop_is_not() {
        let supervisor = supervisor(vec![sleep_spec("short", "1"), sleep_spec("stopped", "30")]);
        supervisor.start(0).unwrap();
        supervisor.start(1).unwrap();
        supervisor.stop(1).unwrap();

        let mut poller = LivenessPoller::new(supervisor.registry().clone(), SysinfoTable::new());
        assert_eq!(
            supervisor.registry().view(0).unwrap().status,
            ProcessStatus::Running
        );
        assert!(poll_until_error(&mut poller, 0).await);
        assert_eq!(
            supervisor.registry().view(1).unwrap().status,
            ProcessStatus::Stopped
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_cycles_never_tear_state() {
        let names: Vec<String> = (0..6).map(|n| format!("app{n}")).collect();
        let supervisor = supervisor(names.iter().map(|n| sleep_spec(n, "30")).collect());
        let (tx, _rx) = mpsc::channel(64);
        let poller = LivenessPoller::new(supervisor.registry().clone(), SysinfoTable::new())
            .spawn(Duration::from_millis(20), tx);

        let consistent = |view: &ProcessView| match view.status {
            ProcessStatus::Running => view.pid.is_some(),
            ProcessStatus::Starting => true,
            ProcessStatus::Stopped | ProcessStatus::Error => view.pid.is_none(),
        };

        let checker = {
            let registry = supervisor.registry().clone();
            tokio::spawn(async move {
                for _ in 0..200 {
                    for view in registry.views() {
                        assert!(consistent(&view), "torn state: {:?}", view);
                    }
                    tokio::time::sleep(Duration::from_millis(2)).await;
                }
            })
        };

        let workers: Vec<_> = (0..names.len())
            .map(|id| {
                let supervisor = supervisor.clone();
                tokio::spawn(async move {
                    for _ in 0..5 {
                        let view = supervisor.start(id).unwrap();
                        assert_eq!(view.status, ProcessStatus::Running);
                        tokio::time::sleep(Duration::from_millis(15)).await;
                        let view = supervisor.stop(id).unwrap();
                        assert_eq!((view.status, view.pid), (ProcessStatus::Stopped, None));
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.await.unwrap();
        }
        checker.await.unwrap();
        poller.abort();

        for view in supervisor.registry().views() {
            assert!(consistent(&view));
            assert_eq!(view.status, ProcessStatus::Stopped);
        }
    }
}
