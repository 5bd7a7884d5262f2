// src/commands/run.rs

//! Run command - build every part of a recipe
//!
//! Each run is recorded as a `Build` transaction in the state store.

use super::Session;
use crate::container::default_runtime;
use crate::kitchen::{BuildRecorder, KitchenOptions, RecordingPipeline};
use crate::progress;
use anyhow::{Context, Result};
use std::io::IsTerminal;
use tracing::info;

/// Command-line overrides of the configured build options
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOverrides {
    pub unconfined: bool,
    pub network: bool,
    pub pack: bool,
}

pub fn cmd_run(session: &Session, overrides: RunOverrides) -> Result<()> {
    let mut options = KitchenOptions::from_config(&session.config)?;
    if overrides.unconfined {
        options.confined = false;
    }
    if overrides.network {
        options.allow_network = true;
    }

    let kitchen = session.kitchen(options)?;
    let name = kitchen.recipe().project.name.clone();
    let store = session.ingredient_store()?;
    let runtime = default_runtime(kitchen.is_confined());
    let pipeline = progress::for_terminal(&name, std::io::stderr().is_terminal());

    let state = session.state_store()?;
    let recorder = BuildRecorder::begin(&state, kitchen.recipe(), kitchen.target(), "build")
        .context("Failed to record the build")?;

    info!(
        "Building {} for {} ({} runtime)",
        name,
        kitchen.target(),
        runtime.name()
    );
    let result = {
        let recording = RecordingPipeline::new(pipeline.as_ref(), &recorder);
        kitchen
            .run(runtime.as_ref(), &store, &recording, &session.cancel)
            .with_context(|| format!("Failed to build {}", name))
    }
    .and_then(|()| {
        println!("Build of {} complete", name);
        if overrides.pack {
            super::pack::pack_kitchen(session, &kitchen, None, true, &recorder)?;
        }
        Ok(())
    });
    super::settle(recorder, result)
}
