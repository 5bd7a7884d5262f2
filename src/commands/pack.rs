// src/commands/pack.rs

//! Pack command - emit packs from the install tree

use super::Session;
use crate::kitchen::{BuildRecorder, Kitchen, KitchenOptions};
use crate::packager::SigningKeyPair;
use anyhow::{Context, Result};
use std::path::Path;

pub fn cmd_pack(session: &Session, output: Option<&Path>, sign: bool) -> Result<()> {
    let options = KitchenOptions::from_config(&session.config)?;
    let kitchen = session.kitchen(options)?;
    let state = session.state_store()?;
    let recorder = BuildRecorder::begin(&state, kitchen.recipe(), kitchen.target(), "pack")
        .context("Failed to record the pack")?;
    let result = pack_kitchen(session, &kitchen, output, sign, &recorder);
    super::settle(recorder, result)
}

pub(super) fn pack_kitchen(
    session: &Session,
    kitchen: &Kitchen,
    output: Option<&Path>,
    sign: bool,
    recorder: &BuildRecorder<'_>,
) -> Result<()> {
    let key = if sign {
        let path = session.config.signing_key();
        Some(
            SigningKeyPair::load_or_generate(&path)
                .with_context(|| format!("Failed to load signing key {}", path.display()))?,
        )
    } else {
        None
    };

    let packs = kitchen
        .pack(key.as_ref(), output)
        .with_context(|| format!("Failed to pack {}", kitchen.recipe().project.name))?;
    for pack in &packs {
        println!("Created {}", pack.display());
    }
    recorder
        .record_packs(kitchen.recipe(), &packs)
        .context("Failed to record the packs")
}
