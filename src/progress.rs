// src/progress.rs

//! Staged pipeline view of a build
//!
//! A build is shown as a fixed list of stages (one per step plus the
//! setup and pack phases), each in one of four states. Implementations:
//! - `CliPipeline`: a spinner per stage using indicatif
//! - `LogPipeline`: one tracing line per transition
//! - `SilentPipeline`: records transitions, used in tests and scripts
//!
//! On failure the footer names the build log.

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Waiting,
    Working,
    Done,
    Failed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Waiting => "waiting",
            StepStatus::Working => "working",
            StepStatus::Done => "done",
            StepStatus::Failed => "failed",
        }
    }
}

/// Core trait for the pipeline view
///
/// Implementations are `Send + Sync` so stage updates may come from the
/// remote-build waiter threads.
pub trait Pipeline: Send + Sync {
    /// Declare the stages; every stage starts `Waiting`
    fn begin(&self, stages: &[String]);

    fn update(&self, stage: &str, status: StepStatus);

    /// Close the view; `failure_log` is set when the build failed
    fn finish(&self, failure_log: Option<&Path>);
}

fn footer(failure_log: Option<&Path>) -> Option<String> {
    failure_log.map(|log| format!("Build failed, see {} for details", log.display()))
}

/// Silent pipeline that remembers every transition
#[derive(Debug, Default)]
pub struct SilentPipeline {
    state: Mutex<SilentState>,
}

#[derive(Debug, Default)]
struct SilentState {
    stages: Vec<(String, StepStatus)>,
    footer: Option<String>,
    finished: bool,
}

impl SilentPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self, stage: &str) -> Option<StepStatus> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .stages
            .iter()
            .find(|(name, _)| name == stage)
            .map(|(_, status)| *status)
    }

    pub fn stages(&self) -> Vec<(String, StepStatus)> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.stages.clone()
    }

    pub fn footer(&self) -> Option<String> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.footer.clone()
    }

    pub fn is_finished(&self) -> bool {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.finished
    }
}

impl Pipeline for SilentPipeline {
    fn begin(&self, stages: &[String]) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.stages = stages
            .iter()
            .map(|s| (s.clone(), StepStatus::Waiting))
            .collect();
        state.finished = false;
        state.footer = None;
    }

    fn update(&self, stage: &str, status: StepStatus) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match state.stages.iter_mut().find(|(name, _)| name == stage) {
            Some(entry) => entry.1 = status,
            None => state.stages.push((stage.to_string(), status)),
        }
    }

    fn finish(&self, failure_log: Option<&Path>) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.finished = true;
        state.footer = footer(failure_log);
    }
}

/// Logging pipeline
///
/// Logs each transition at info level. Used when stdout is not a terminal.
#[derive(Debug, Default)]
pub struct LogPipeline {
    name: String,
}

impl LogPipeline {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Pipeline for LogPipeline {
    fn begin(&self, stages: &[String]) {
        info!("{}: {} stages", self.name, stages.len());
    }

    fn update(&self, stage: &str, status: StepStatus) {
        info!("{}: {} {}", self.name, stage, status.as_str());
    }

    fn finish(&self, failure_log: Option<&Path>) {
        match footer(failure_log) {
            Some(text) => error!("{}: {}", self.name, text),
            None => info!("{}: complete", self.name),
        }
    }
}

/// Terminal pipeline with one spinner line per stage
pub struct CliPipeline {
    multi: MultiProgress,
    bars: Mutex<Vec<(String, ProgressBar)>>,
}

impl Default for CliPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl CliPipeline {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: Mutex::new(Vec::new()),
        }
    }

    fn style(status: StepStatus) -> ProgressStyle {
        let template = match status {
            StepStatus::Waiting => "  {prefix:.dim} {msg:.dim}",
            StepStatus::Working => "{spinner:.cyan} {prefix} {msg}",
            StepStatus::Done => "{prefix:.green} {msg}",
            StepStatus::Failed => "{prefix:.red} {msg:.red}",
        };
        ProgressStyle::default_spinner()
            .template(template)
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
    }

    fn marker(status: StepStatus) -> &'static str {
        match status {
            StepStatus::Waiting => "·",
            StepStatus::Working => "",
            StepStatus::Done => "✓",
            StepStatus::Failed => "✗",
        }
    }

    fn apply(bar: &ProgressBar, status: StepStatus) {
        bar.set_style(Self::style(status));
        bar.set_prefix(Self::marker(status));
        match status {
            StepStatus::Working => bar.enable_steady_tick(Duration::from_millis(100)),
            StepStatus::Done | StepStatus::Failed => bar.disable_steady_tick(),
            StepStatus::Waiting => {}
        }
        bar.tick();
    }
}

impl Pipeline for CliPipeline {
    fn begin(&self, stages: &[String]) {
        let mut bars = self.bars.lock().unwrap_or_else(|e| e.into_inner());
        for stage in stages {
            let bar = self.multi.add(ProgressBar::new_spinner());
            bar.set_message(stage.clone());
            Self::apply(&bar, StepStatus::Waiting);
            bars.push((stage.clone(), bar));
        }
    }

    fn update(&self, stage: &str, status: StepStatus) {
        let mut bars = self.bars.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((_, bar)) = bars.iter().find(|(name, _)| name == stage) {
            Self::apply(bar, status);
            return;
        }
        let bar = self.multi.add(ProgressBar::new_spinner());
        bar.set_message(stage.to_string());
        Self::apply(&bar, status);
        bars.push((stage.to_string(), bar));
    }

    fn finish(&self, failure_log: Option<&Path>) {
        let bars = self.bars.lock().unwrap_or_else(|e| e.into_inner());
        for (_, bar) in bars.iter() {
            bar.disable_steady_tick();
            bar.abandon();
        }
        if let Some(text) = footer(failure_log) {
            let _ = self.multi.println(text);
        }
    }
}

/// Pick the pipeline for the current output
pub fn for_terminal(name: &str, interactive: bool) -> Box<dyn Pipeline> {
    if interactive {
        Box::new(CliPipeline::new())
    } else {
        Box::new(LogPipeline::new(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn stages() -> Vec<String> {
        vec!["zlib/config".to_string(), "zlib/build".to_string()]
    }

    #[test]
    fn test_silent_pipeline_tracks_transitions() {
        let pipeline = SilentPipeline::new();
        pipeline.begin(&stages());
        assert_eq!(pipeline.status("zlib/build"), Some(StepStatus::Waiting));

        pipeline.update("zlib/config", StepStatus::Working);
        pipeline.update("zlib/config", StepStatus::Done);
        pipeline.update("zlib/build", StepStatus::Failed);
        assert_eq!(pipeline.status("zlib/config"), Some(StepStatus::Done));
        assert_eq!(pipeline.status("zlib/build"), Some(StepStatus::Failed));
        assert!(!pipeline.is_finished());

        pipeline.finish(Some(&PathBuf::from("/tmp/build.log")));
        assert!(pipeline.is_finished());
        assert!(pipeline.footer().unwrap().contains("/tmp/build.log"));
    }

    #[test]
    fn test_unknown_stage_is_appended() {
        let pipeline = SilentPipeline::new();
        pipeline.begin(&stages());
        pipeline.update("pack", StepStatus::Working);
        assert_eq!(pipeline.stages().len(), 3);
    }

    #[test]
    fn test_success_has_no_footer() {
        let pipeline = SilentPipeline::new();
        pipeline.begin(&stages());
        pipeline.finish(None);
        assert!(pipeline.footer().is_none());
    }

    #[test]
    fn test_cli_and_log_pipelines_accept_updates() {
        for pipeline in [for_terminal("bake", true), for_terminal("bake", false)] {
            pipeline.begin(&stages());
            pipeline.update("zlib/config", StepStatus::Working);
            pipeline.update("zlib/config", StepStatus::Done);
            pipeline.finish(None);
        }
    }
}
