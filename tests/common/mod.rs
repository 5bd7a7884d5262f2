// tests/common/mod.rs

//! Shared helpers for the integration tests.

#![allow(dead_code)]

use bake::container::{HostRuntime, ResourceLimits};
use bake::ingredients::IngredientStore;
use bake::progress::SilentPipeline;
use bake::recipe::{self, Recipe, Target};
use bake::{CancelToken, Kitchen, KitchenOptions};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub const PROJECT_HEADER: &str = "project:
  name: greeter
  summary: Writes a greeting
  version: 1.0.0
  author: Jane Doe
  email: jane@example.com
";

/// A project directory with a recipe, plus a private kitchen directory
pub struct Fixture {
    pub dir: TempDir,
    pub recipe_path: PathBuf,
}

impl Fixture {
    /// Write `body` below the project header as `project/recipe.yaml`
    pub fn new(body: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let project = dir.path().join("project");
        fs::create_dir_all(&project).unwrap();
        let recipe_path = project.join("recipe.yaml");
        fs::write(&recipe_path, format!("{}\n{}", PROJECT_HEADER, body)).unwrap();
        Self { dir, recipe_path }
    }

    pub fn project_dir(&self) -> PathBuf {
        self.dir.path().join("project")
    }

    pub fn kitchen_dir(&self) -> PathBuf {
        self.dir.path().join("kitchen")
    }

    pub fn recipe(&self) -> Recipe {
        recipe::parse_recipe_file(&self.recipe_path).unwrap()
    }

    pub fn options(&self) -> KitchenOptions {
        KitchenOptions {
            kitchen_dir: self.kitchen_dir(),
            confined: false,
            limits: ResourceLimits::default(),
            allow_network: false,
            step_timeout: None,
            user: "chef".to_string(),
        }
    }

    pub fn kitchen(&self) -> Kitchen {
        Kitchen::open(&self.recipe_path, self.recipe(), Target::host(), self.options()).unwrap()
    }

    /// Run every step on the host
    pub fn run(&self, kitchen: &Kitchen) -> bake::Result<()> {
        let store = IngredientStore::new(self.dir.path().join("store"));
        kitchen.run(
            &HostRuntime,
            &store,
            &SilentPipeline::new(),
            &CancelToken::new(),
        )
    }

    /// How many times a step appended to its `runs-<name>` counter
    pub fn runs(&self, name: &str) -> usize {
        count_lines(&self.project_dir().join(format!("runs-{}", name)))
    }
}

fn count_lines(path: &Path) -> usize {
    fs::read_to_string(path)
        .map(|s| s.lines().count())
        .unwrap_or(0)
}

/// A script step that records each execution in the project directory
pub fn counting_step(name: &str, depends: &[&str], extra: &str) -> String {
    let mut step = format!("      - name: {}\n        type: script\n", name);
    if !depends.is_empty() {
        step.push_str(&format!("        depends: [{}]\n", depends.join(", ")));
    }
    step.push_str("        script: |\n");
    step.push_str(&format!(
        "          echo run >> \"$CHEF_PROJECT_DIR/runs-{}\"\n",
        name
    ));
    for line in extra.lines() {
        step.push_str(&format!("          {}\n", line));
    }
    step
}
