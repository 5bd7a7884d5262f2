// src/commands/clean.rs

//! Clean command - invalidate build state

use super::Session;
use crate::kitchen::{CleanScope, KitchenOptions, layout};
use anyhow::{Context, Result};

pub fn cmd_clean(session: &Session, target: Option<&str>, purge: bool) -> Result<()> {
    if purge {
        let kitchen_dir = session.config.kitchen_dir();
        let removed = layout::purge(&kitchen_dir)
            .with_context(|| format!("Failed to remove {}", kitchen_dir.display()))?;
        if removed {
            println!("Removed {}", kitchen_dir.display());
        } else {
            println!("Nothing to purge");
        }
        return Ok(());
    }

    let options = KitchenOptions::from_config(&session.config)?;
    let kitchen = session.kitchen(options)?;
    match kitchen.clean(target)? {
        CleanScope::All => println!("Invalidated every step of {}", kitchen.recipe().project.name),
        CleanScope::Part(part) => println!("Invalidated part {}", part),
        CleanScope::Step { part, step } => {
            println!("Invalidated {}/{} and the steps depending on it", part, step)
        }
    }
    Ok(())
}
