//! The ordered set of managed processes for this session.
//!
//! Built once from configuration and never resized afterwards, so the entry
//! list itself needs no lock; each entry guards its own status/pid pair.
//! Callers refer to entries by index and re-read them on every use.

use tracing::warn;

use crate::config::AppConfig;
use crate::errors::ConfigError;
use crate::output::{LogFeed, StreamKind};
use crate::process::{AppSpec, ManagedProcess, ProcessStatus, ProcessView};

#[derive(Debug, Default)]
pub struct Registry {
    entries: Vec<ManagedProcess>,
}

impl Registry {
    /// Builds entries for every valid `[[app]]`, in order.
    ///
    /// Invalid entries are skipped and their errors returned; they never stop
    /// the remaining entries from loading.
    pub fn build(apps: &[AppConfig], feed: &LogFeed) -> (Self, Vec<ConfigError>) {
        let mut specs = Vec::with_capacity(apps.len());
        let mut errors = Vec::new();
        for app in apps {
            match AppSpec::from_config(app) {
                Ok(spec) => specs.push(spec),
                Err(err) => {
                    warn!(error = %err, "skipping application");
                    errors.push(err);
                }
            }
        }
        (Self::from_specs(specs, feed), errors)
    }

    pub fn from_specs(specs: Vec<AppSpec>, feed: &LogFeed) -> Self {
        let entries = specs
            .into_iter()
            .map(|spec| {
                let sink = feed.sink(spec.name.as_str(), StreamKind::Stdout);
                ManagedProcess::new(spec, sink)
            })
            .collect();
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: usize) -> Option<&ManagedProcess> {
        self.entries.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &ManagedProcess)> {
        self.entries.iter().enumerate()
    }

    pub fn view(&self, id: usize) -> Option<ProcessView> {
        self.get(id).map(ManagedProcess::view)
    }

    pub fn views(&self) -> Vec<ProcessView> {
        self.entries.iter().map(ManagedProcess::view).collect()
    }

    /// `(index, pid)` of every entry currently `Running`.
    pub fn running(&self) -> Vec<(usize, u32)> {
        self.iter()
            .filter_map(|(id, process)| {
                let state = process.state();
                match (state.status(), state.pid()) {
                    (ProcessStatus::Running, Some(pid)) => Some((id, pid)),
                    _ => None,
                }
            })
            .collect()
    }
}
