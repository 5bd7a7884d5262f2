// src/commands/mod.rs
//! Command handlers for the bake CLI

mod clean;
mod fetch;
mod init;
mod pack;
mod remote;
mod run;

pub use clean::cmd_clean;
pub use fetch::cmd_fetch;
pub use init::cmd_init;
pub use pack::cmd_pack;
pub use remote::{
    cmd_remote_build, cmd_remote_download, cmd_remote_info, cmd_remote_init, cmd_remote_list,
    cmd_remote_resume,
};
pub use run::{RunOverrides, cmd_run};

use crate::cli::{Cli, Commands, RemoteCommands};
use crate::config::BakeConfig;
use crate::ingredients::IngredientStore;
use crate::kitchen::{BuildRecorder, Kitchen, KitchenOptions};
use crate::recipe::{self, Recipe, Target};
use crate::signal::CancelToken;
use crate::store::Store;
use anyhow::{Context, Result, bail};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Recipe file looked for first when none is given
pub const DEFAULT_RECIPE: &str = "recipe.yaml";

/// Shared state of one invocation
pub struct Session {
    pub config: BakeConfig,
    recipe: Option<PathBuf>,
    cross_compile: Option<String>,
    pub cancel: CancelToken,
}

impl Session {
    pub fn new(config: BakeConfig, cli: &Cli, cancel: CancelToken) -> Self {
        Self {
            config,
            recipe: cli.recipe.clone(),
            cross_compile: cli.cross_compile.clone(),
            cancel,
        }
    }

    /// Path of the recipe this invocation works on
    pub fn recipe_path(&self) -> Result<PathBuf> {
        let cwd = std::env::current_dir().context("Failed to read the current directory")?;
        find_recipe(self.recipe.as_deref(), &cwd)
    }

    pub fn load(&self) -> Result<(PathBuf, Recipe, Target)> {
        let path = self.recipe_path()?;
        let recipe = recipe::parse_recipe_file(&path)
            .with_context(|| format!("Failed to load recipe {}", path.display()))?;
        let target = resolve_target(&recipe, self.cross_compile.as_deref())?;
        debug!("Building {} for {}", recipe.project.name, target);
        Ok((path, recipe, target))
    }

    pub fn kitchen(&self, options: KitchenOptions) -> Result<Kitchen> {
        let (path, recipe, target) = self.load()?;
        Kitchen::open(&path, recipe, target, options)
            .with_context(|| format!("Failed to open the kitchen of {}", path.display()))
    }

    /// Open the state store that keeps the build history
    pub fn state_store(&self) -> Result<Store> {
        let path = self.config.state_db();
        Store::open(&path)
            .with_context(|| format!("Failed to open the state store {}", path.display()))
    }

    pub fn ingredient_store(&self) -> Result<IngredientStore> {
        let mut store = IngredientStore::new(self.config.store_dir());
        for location in &self.config.ingredient_sources {
            store = store
                .with_location(location)
                .with_context(|| format!("Invalid ingredient source {}", location))?;
        }
        Ok(store)
    }
}

/// Locate the recipe: the explicit path, `recipe.yaml`, or the only
/// `.yaml` file in `dir`
pub fn find_recipe(explicit: Option<&Path>, dir: &Path) -> Result<PathBuf> {
    if let Some(path) = explicit {
        if !path.is_file() {
            bail!("Recipe {} does not exist", path.display());
        }
        return Ok(path.to_path_buf());
    }
    let default = dir.join(DEFAULT_RECIPE);
    if default.is_file() {
        return Ok(default);
    }

    let pattern = dir.join("*.yaml");
    let candidates: Vec<PathBuf> = glob::glob(&pattern.to_string_lossy())
        .context("Invalid recipe search pattern")?
        .filter_map(|entry| entry.ok())
        .filter(|path| path.is_file())
        .collect();
    match candidates.as_slice() {
        [only] => Ok(only.clone()),
        [] => bail!(
            "No recipe found in {}; run `bake init` or pass --recipe",
            dir.display()
        ),
        _ => bail!(
            "Several recipes found in {}; choose one with --recipe",
            dir.display()
        ),
    }
}

/// Target from the `--cross-compile` value, checked against the recipe
pub fn resolve_target(recipe: &Recipe, cross_compile: Option<&str>) -> Result<Target> {
    let (platform, arch) = match cross_compile {
        Some(value) => {
            let (platform, arch) = recipe::parse_cross_compile(value)?;
            (platform, Some(arch))
        }
        None => (None, None),
    };
    Ok(recipe::validate_target(
        recipe,
        platform.as_deref(),
        arch.as_deref(),
    )?)
}

/// Run the parsed command line
pub fn dispatch(cli: Cli, cancel: CancelToken) -> Result<()> {
    let config = BakeConfig::load().context("Failed to load configuration")?;
    let session = Session::new(config, &cli, cancel);

    match cli.command {
        Some(Commands::Init { name, force }) => cmd_init(name.as_deref(), force),
        Some(Commands::Fetch) => cmd_fetch(&session),
        None => cmd_run(&session, RunOverrides::default()),
        Some(Commands::Run {
            unconfined,
            network,
            pack,
        }) => cmd_run(
            &session,
            RunOverrides {
                unconfined,
                network,
                pack,
            },
        ),
        Some(Commands::Clean { target, purge }) => cmd_clean(&session, target.as_deref(), purge),
        Some(Commands::Pack { output, no_sign }) => cmd_pack(&session, output.as_deref(), !no_sign),
        Some(Commands::Remote { command }) => match command {
            RemoteCommands::Init { url } => cmd_remote_init(&url),
            RemoteCommands::Build { archs } => cmd_remote_build(&session, &archs),
            RemoteCommands::Resume { jobs } => cmd_remote_resume(&session, &jobs),
            RemoteCommands::Download { job, output } => {
                cmd_remote_download(&session, &job, output.as_deref())
            }
            RemoteCommands::List => cmd_remote_list(&session),
            RemoteCommands::Info { agent } => cmd_remote_info(&session, &agent),
        },
    }
}

/// Signal that interrupted the command, if any
fn cancel_signal(err: &anyhow::Error) -> Option<i32> {
    err.chain().find_map(|cause| match cause.downcast_ref::<crate::Error>() {
        Some(crate::Error::Cancelled(sig)) => Some(*sig),
        _ => None,
    })
}

/// Settle a recorded transaction from the command's outcome
///
/// A failure to record a failed build is only logged so the build error
/// is what the caller sees.
fn settle(recorder: BuildRecorder<'_>, result: Result<()>) -> Result<()> {
    let err = match result {
        Ok(()) => return recorder.complete().context("Failed to record the build"),
        Err(err) => err,
    };
    let settled = match cancel_signal(&err) {
        Some(sig) => recorder.cancel(sig),
        None => recorder.fail(&format!("{:#}", err)),
    };
    if let Err(e) = settled {
        warn!("Failed to record the failed build: {}", e);
    }
    Err(err)
}

/// Process exit code for a failed command
///
/// Runs interrupted by a signal exit with the negated signal number.
pub fn exit_code(err: &anyhow::Error) -> i32 {
    cancel_signal(err).map_or(1, |sig| -sig)
}
