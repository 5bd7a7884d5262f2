// src/commands/fetch.rs

//! Fetch command - resolve ingredients and download sources

use super::Session;
use crate::kitchen::KitchenOptions;
use anyhow::{Context, Result};

pub fn cmd_fetch(session: &Session) -> Result<()> {
    let options = KitchenOptions::from_config(&session.config)?;
    let kitchen = session.kitchen(options)?;
    let store = session.ingredient_store()?;
    let mut cache = kitchen.cache()?;

    let report = kitchen
        .fetch(&store, &mut cache)
        .with_context(|| format!("Failed to fetch ingredients of {}", kitchen.recipe().project.name))?;

    println!(
        "Fetched {} ingredient(s), {} toolchain(s), {} host pack(s), {} source(s) for {}",
        report.ingredients,
        report.toolchains,
        report.host_packs.len(),
        report.sources,
        kitchen.target()
    );
    Ok(())
}
