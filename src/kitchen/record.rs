// src/kitchen/record.rs

//! Build history in the state store
//!
//! A [`BuildRecorder`] owns one `Build` transaction per kitchen run. It
//! moves the transaction to running, logs step outcomes through
//! [`RecordingPipeline`], appends an application revision for every pack
//! and finally settles the transaction as completed, failed or cancelled.
//! Old transactions are cleaned up when a new one starts.

use crate::error::Result;
use crate::progress::{Pipeline, StepStatus};
use crate::recipe::{Pack, Recipe, Target};
use crate::store::{
    AppCommand, LogLevel, Revision, Store, TransactionStatus, TransactionType,
};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};

/// Channel local builds are recorded under
pub const LOCAL_CHANNEL: &str = "devel";

pub struct BuildRecorder<'s> {
    store: &'s Store,
    id: u32,
}

impl<'s> BuildRecorder<'s> {
    /// Open a running `Build` transaction for `recipe`
    pub fn begin(store: &'s Store, recipe: &Recipe, target: &Target, action: &str) -> Result<Self> {
        let description = format!("{} {} for {}", action, recipe.project.version, target);
        let mut guard = store.lock();
        guard.transaction_cleanup()?;
        let id = guard.add_transaction(TransactionType::Build, &recipe.project.name, Some(&description))?;
        guard.set_transaction_state(id, TransactionStatus::Running)?;
        guard.unlock()?;
        info!("Transaction {}: {} {}", id, recipe.project.name, description);
        Ok(Self { store, id })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn log(&self, level: LogLevel, message: &str) -> Result<()> {
        let mut guard = self.store.lock();
        guard.add_transaction_log(self.id, level, message)?;
        guard.unlock()
    }

    /// Append a revision per pack; `packs` are the files emitted for
    /// `recipe.packs`, in the same order
    pub fn record_packs(&self, recipe: &Recipe, packs: &[PathBuf]) -> Result<()> {
        let mut guard = self.store.lock();
        for (pack, path) in recipe.packs.iter().zip(packs) {
            if guard.application(&pack.name).is_none() {
                guard.add_application(&pack.name, app_commands(pack), Vec::new())?;
            }
            let number = guard
                .application(&pack.name)
                .and_then(|app| app.latest_revision())
                .map_or(1, |latest| latest.revision + 1);
            let revision = revision_for(&recipe.project.version, number, path)?;
            guard.add_revision(&pack.name, revision)?;
            guard.add_transaction_state(self.id, &pack.name, Some(LOCAL_CHANNEL), number)?;
            guard.add_transaction_log(
                self.id,
                LogLevel::Info,
                &format!("packed {} revision {}", pack.name, number),
            )?;
        }
        guard.unlock()
    }

    pub fn complete(self) -> Result<()> {
        self.settle(TransactionStatus::Completed, None)
    }

    pub fn fail(self, message: &str) -> Result<()> {
        self.settle(TransactionStatus::Failed, Some(message.to_string()))
    }

    pub fn cancel(self, signal: i32) -> Result<()> {
        self.settle(
            TransactionStatus::Cancelled,
            Some(format!("cancelled by signal {}", signal)),
        )
    }

    fn settle(self, state: TransactionStatus, message: Option<String>) -> Result<()> {
        let mut guard = self.store.lock();
        if let Some(message) = message {
            guard.add_transaction_log(self.id, LogLevel::Error, &message)?;
        }
        guard.complete_transaction(self.id, state)?;
        guard.unlock()?;
        info!("Transaction {} {}", self.id, state.as_str());
        Ok(())
    }
}

fn app_commands(pack: &Pack) -> Vec<AppCommand> {
    pack.commands
        .iter()
        .map(|c| AppCommand {
            name: c.name.clone(),
            path: c.path.clone(),
            arguments: (!c.arguments.is_empty()).then(|| c.arguments.join(" ")),
            command_type: c.command_type.as_str().to_string(),
        })
        .collect()
}

/// Split `major.minor.patch[-tag]`; missing or non-numeric parts are 0
fn parse_version(version: &str) -> (i64, i64, i64, Option<String>) {
    let (core, tag) = match version.split_once(|c| c == '-' || c == '+') {
        Some((core, tag)) => (core, Some(tag.to_string())),
        None => (version, None),
    };
    let mut numbers = core.split('.').map(|n| n.trim().parse::<i64>().unwrap_or(0));
    (
        numbers.next().unwrap_or(0),
        numbers.next().unwrap_or(0),
        numbers.next().unwrap_or(0),
        tag.filter(|t| !t.is_empty()),
    )
}

fn revision_for(version: &str, number: i64, pack: &Path) -> Result<Revision> {
    let (major, minor, patch, tag) = parse_version(version);
    Ok(Revision {
        channel: LOCAL_CHANNEL.to_string(),
        major,
        minor,
        patch,
        revision: number,
        tag,
        size: fs::metadata(pack)?.len() as i64,
        created: chrono::Utc::now().timestamp(),
    })
}

/// Pipeline that also logs finished and failed steps to a transaction
pub struct RecordingPipeline<'a, 's> {
    inner: &'a dyn Pipeline,
    recorder: &'a BuildRecorder<'s>,
    working: Mutex<HashSet<String>>,
}

impl<'a, 's> RecordingPipeline<'a, 's> {
    pub fn new(inner: &'a dyn Pipeline, recorder: &'a BuildRecorder<'s>) -> Self {
        Self {
            inner,
            recorder,
            working: Mutex::new(HashSet::new()),
        }
    }

    fn record(&self, stage: &str, status: StepStatus) {
        let mut working = self.working.lock().unwrap_or_else(|e| e.into_inner());
        let entry = match status {
            StepStatus::Working => {
                working.insert(stage.to_string());
                None
            }
            // cached steps are reported done without having run
            StepStatus::Done if working.remove(stage) => {
                Some((LogLevel::Info, format!("{} completed", stage)))
            }
            StepStatus::Failed => {
                working.remove(stage);
                Some((LogLevel::Error, format!("{} failed", stage)))
            }
            _ => None,
        };
        drop(working);
        if let Some((level, message)) = entry {
            if let Err(e) = self.recorder.log(level, &message) {
                warn!("Failed to record {}: {}", stage, e);
            }
        }
    }
}

impl Pipeline for RecordingPipeline<'_, '_> {
    fn begin(&self, stages: &[String]) {
        self.inner.begin(stages);
    }

    fn update(&self, stage: &str, status: StepStatus) {
        self.record(stage, status);
        self.inner.update(stage, status);
    }

    fn finish(&self, failure_log: Option<&Path>) {
        self.inner.finish(failure_log);
    }
}
