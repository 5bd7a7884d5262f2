// src/commands/init.rs

//! Init command - write a recipe scaffold

use super::DEFAULT_RECIPE;
use crate::config;
use crate::recipe::{self, Pack, PackType, Part, Platform, Recipe, Step, StepType};
use anyhow::{Context, Result, bail};
use std::fs;
use std::path::Path;

/// Recipe names only allow letters, `_` and `-`
fn sanitize_name(name: &str) -> String {
    let name: String = name
        .chars()
        .filter(|c| c.is_ascii_alphabetic() || *c == '_' || *c == '-')
        .collect();
    if name.is_empty() {
        "project".to_string()
    } else {
        name
    }
}

/// The recipe written by `bake init`
pub fn scaffold(name: &str) -> Recipe {
    let name = sanitize_name(name);
    let user = config::user();
    let mut recipe = Recipe::default();
    recipe.project.name = name.clone();
    recipe.project.summary = format!("{} built with bake", name);
    recipe.project.version = "0.1.0".to_string();
    recipe.project.author = user.clone();
    recipe.project.email = format!("{}@localhost", user);
    recipe.platforms = vec![Platform {
        name: recipe::host_platform().to_string(),
        toolchain: None,
        architectures: vec![recipe::host_arch().to_string()],
    }];
    recipe.parts = vec![Part {
        name: name.clone(),
        steps: vec![Step {
            name: "build".to_string(),
            step_type: StepType::Script,
            script: Some("echo \"replace with the build commands of $CHEF_PROJECT_DIR\"".to_string()),
            ..Default::default()
        }],
        ..Default::default()
    }];
    recipe.packs = vec![Pack {
        name,
        pack_type: PackType::Application,
        ..Default::default()
    }];
    recipe
}

pub fn cmd_init(name: Option<&str>, force: bool) -> Result<()> {
    let cwd = std::env::current_dir().context("Failed to read the current directory")?;
    let path = cwd.join(DEFAULT_RECIPE);
    if path.exists() && !force {
        bail!("{} already exists; use --force to overwrite", path.display());
    }

    let name = match name {
        Some(name) => name.to_string(),
        None => cwd
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
    };
    write_scaffold(&path, &name)?;
    println!("Wrote {}", path.display());
    Ok(())
}

fn write_scaffold(path: &Path, name: &str) -> Result<()> {
    let recipe = scaffold(name);
    let yaml = recipe::emit(&recipe)?;
    fs::write(path, yaml).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("zlib-1.3"), "zlib-");
        assert_eq!(sanitize_name("123"), "project");
        assert_eq!(sanitize_name("my_app"), "my_app");
    }

    #[test]
    fn test_scaffold_is_a_valid_recipe() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(DEFAULT_RECIPE);
        write_scaffold(&path, "hello").unwrap();
        let recipe = recipe::parse_recipe_file(&path).unwrap();
        assert_eq!(recipe.project.name, "hello");
        assert_eq!(recipe.parts.len(), 1);
        assert_eq!(recipe.packs[0].pack_type, PackType::Application);
    }
}
