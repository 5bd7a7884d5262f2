// src/kitchen/mod.rs

//! Kitchen: the per-recipe build workspace
//!
//! A kitchen ties one recipe to its state on disk and drives a build:
//!
//! 1. **Fetch**: resolve ingredients and toolchains through the ingredient
//!    store, unpack them into the chef tree, and download part sources
//! 2. **Compose**: stage the rootfs from the declared layers
//! 3. **Cook**: create the container and run every step in order
//! 4. **Pack**: emit the recipe's packs from the install tree
//!
//! Commands record each build as a transaction in the state store through
//! [`record::BuildRecorder`].
//!
//! Every phase is incremental; completed work is remembered in the build
//! cache until `clean` invalidates it.

pub mod environment;
pub mod layout;
pub mod record;
pub mod scheduler;
pub mod sources;
pub mod systems;

pub use environment::{BuildEnvironment, GuestPaths};
pub use layout::KitchenLayout;
pub use record::{BuildRecorder, RecordingPipeline};
pub use scheduler::{SchedulerOptions, StepScheduler};

use crate::cache::{self, BuildCache};
use crate::config::BakeConfig;
use crate::container::{Capabilities, Container, ContainerOptions, ContainerRuntime, ResourceLimits};
use crate::error::{Error, Result};
use crate::ingredients::{IngredientQuery, IngredientStore};
use crate::layers::activation::GuestStyle;
use crate::layers::rootfs::{Bootstrap, NoBootstrap, PackageManagerBootstrap};
use crate::layers::{Layer, LayerComposer};
use crate::packager::{Packager, SigningKeyPair};
use crate::policy::Policy;
use crate::progress::{Pipeline, StepStatus};
use crate::recipe::{Ingredient, IngredientKind, Recipe, Target};
use crate::signal::CancelToken;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Guest directory the project is bound to
pub const PROJECT_GUEST_DIR: &str = "/chef/project";

/// Cache key recording that the environment hooks ran
pub const HOOKS_KEY: &str = "setup_hooks";

/// Host directories shared read-only with containers that have no base rootfs
const HOST_SYSTEM_DIRS: &[&str] = &["/usr", "/bin", "/sbin", "/lib", "/lib64", "/etc"];

/// Stage names of the phases around the steps
pub const FETCH_STAGE: &str = "fetch";
pub const COMPOSE_STAGE: &str = "compose";

#[derive(Debug, Clone)]
pub struct KitchenOptions {
    pub kitchen_dir: PathBuf,
    /// Run steps in a container; recipes may still opt out
    pub confined: bool,
    pub limits: ResourceLimits,
    pub allow_network: bool,
    pub step_timeout: Option<Duration>,
    pub user: String,
}

impl KitchenOptions {
    pub fn from_config(config: &BakeConfig) -> Result<Self> {
        Ok(Self {
            kitchen_dir: config.kitchen_dir(),
            confined: config.confined,
            limits: config.limits()?,
            allow_network: config.allow_network,
            step_timeout: config.step_timeout(),
            user: crate::config::user(),
        })
    }
}

/// What `fetch` brought into the kitchen
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchReport {
    /// Host-ingredient packs layered into the rootfs
    pub host_packs: Vec<PathBuf>,
    pub ingredients: usize,
    pub toolchains: usize,
    pub sources: usize,
}

/// What `clean` invalidated
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanScope {
    All,
    Part(String),
    Step { part: String, step: String },
}

pub struct Kitchen {
    recipe: Recipe,
    project_dir: PathBuf,
    target: Target,
    layout: KitchenLayout,
    options: KitchenOptions,
}

impl Kitchen {
    /// Open the kitchen of the recipe at `recipe_path`, creating its tree
    pub fn open(
        recipe_path: &Path,
        recipe: Recipe,
        target: Target,
        options: KitchenOptions,
    ) -> Result<Self> {
        let layout = KitchenLayout::resolve(&options.kitchen_dir, recipe_path, &recipe.project.name)?;
        layout.setup(&cache::fingerprint(&recipe, &target))?;
        let project_dir = recipe_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let project_dir = fs::canonicalize(&project_dir)?;
        debug!(
            "Kitchen {} for {} at {}",
            layout.uuid,
            recipe.project.name,
            layout.root.display()
        );
        Ok(Self {
            recipe,
            project_dir,
            target,
            layout,
            options,
        })
    }

    pub fn recipe(&self) -> &Recipe {
        &self.recipe
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn layout(&self) -> &KitchenLayout {
        &self.layout
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    /// Whether steps run inside a container
    pub fn is_confined(&self) -> bool {
        self.options.confined && self.recipe.is_confined()
    }

    pub fn cache(&self) -> Result<BuildCache> {
        BuildCache::open(self.layout.cache_file(), &self.recipe, &self.target)
    }

    fn ingredient_target(&self, ingredient: &Ingredient) -> Target {
        match ingredient.kind {
            IngredientKind::Host => Target::host(),
            IngredientKind::Build | IngredientKind::Runtime => self.target.clone(),
        }
    }

    /// Resolve and unpack ingredients and toolchains, download sources
    pub fn fetch(&self, store: &IngredientStore, cache: &mut BuildCache) -> Result<FetchReport> {
        let mut report = FetchReport::default();

        for ingredient in self.recipe.ingredients() {
            let query = IngredientQuery::from_ingredient(ingredient, &self.ingredient_target(ingredient))?;
            let (key, path) = store.ensure(&query)?;
            match ingredient.kind {
                IngredientKind::Host => report.host_packs.push(path),
                IngredientKind::Build => {
                    let marker = format!("ingredient:{}", key);
                    if !cache.has_key(&marker) {
                        store.unpack(&key, &self.layout.ingredients(), &ingredient.include_filters)?;
                        cache.set_key(&marker, true)?;
                        info!("Unpacked ingredient {}", key);
                    }
                    report.ingredients += 1;
                }
                IngredientKind::Runtime => report.ingredients += 1,
            }
        }

        let mut toolchains = BTreeMap::new();
        for part in &self.recipe.parts {
            if let Some(toolchain) = scheduler::resolve_toolchain(&self.recipe, part, &self.target)? {
                toolchains.insert(toolchain.to_string(), toolchain);
            }
        }
        for toolchain in toolchains.values() {
            let (key, _) = store.ensure(&IngredientQuery::from_toolchain(toolchain))?;
            let marker = format!("toolchain:{}", key);
            let dest = self.layout.toolchains().join(&toolchain.name);
            if !cache.has_key(&marker) || !dest.is_dir() {
                store.unpack(&key, &dest, &[])?;
                cache.set_key(&marker, true)?;
                info!("Unpacked toolchain {}", key);
            }
            report.toolchains += 1;
        }

        for part in &self.recipe.parts {
            let dest = self.layout.data().join("sources").join(&part.name);
            if sources::fetch_part(part, &dest)? {
                report.sources += 1;
            }
        }
        Ok(report)
    }

    /// Layers of the build rootfs
    pub fn layers(&self, host_packs: &[PathBuf]) -> Result<Vec<Layer>> {
        let mut layers = Vec::new();
        if !self.recipe.environment.host.base {
            for dir in HOST_SYSTEM_DIRS {
                if Path::new(dir).exists() {
                    layers.push(Layer::HostDirectory {
                        host: PathBuf::from(dir),
                        guest: PathBuf::from(dir),
                        readonly: true,
                    });
                }
            }
        }
        for pack in host_packs {
            layers.push(Layer::package(pack)?);
        }
        layers.push(Layer::HostDirectory {
            host: self.project_dir.clone(),
            guest: PathBuf::from(PROJECT_GUEST_DIR),
            readonly: false,
        });
        Ok(layers)
    }

    fn bootstrap(&self) -> Result<Box<dyn Bootstrap>> {
        let host = &self.recipe.environment.host;
        if self.is_confined() && host.base && !host.packages.is_empty() {
            Ok(Box::new(PackageManagerBootstrap::detect()?))
        } else {
            Ok(Box::new(NoBootstrap))
        }
    }

    fn container_options(&self, layers: Vec<Layer>) -> ContainerOptions {
        let mut options = ContainerOptions::new(self.layout.ns())
            .with_layers(layers)
            .with_limits(self.options.limits);
        options.wait_timeout = self.options.step_timeout;
        if self.is_confined() {
            options = options.with_policy(Policy::build_default(self.options.allow_network));
            if options.uid != 0 {
                options.capabilities.insert(Capabilities::USERNS);
            }
        }
        if self.options.allow_network {
            options.capabilities.insert(Capabilities::NETWORK);
        }
        options
    }

    /// Run the whole build: fetch, compose and cook
    ///
    /// The pipeline shows one stage per step; on failure its footer names
    /// the build log.
    pub fn run(
        &self,
        runtime: &dyn ContainerRuntime,
        store: &IngredientStore,
        pipeline: &dyn Pipeline,
        cancel: &CancelToken,
    ) -> Result<()> {
        let mut stages = vec![FETCH_STAGE.to_string(), COMPOSE_STAGE.to_string()];
        stages.extend(scheduler::stages(&self.recipe));
        pipeline.begin(&stages);

        let log = self.layout.reset_log()?;
        let result = self.cook(runtime, store, pipeline, cancel, &log);
        match &result {
            Ok(()) => pipeline.finish(None),
            Err(e) => {
                let _ = fs::OpenOptions::new()
                    .append(true)
                    .open(&log)
                    .and_then(|mut f| std::io::Write::write_all(&mut f, format!("error: {}\n", e).as_bytes()));
                pipeline.finish(Some(&log));
            }
        }
        result
    }

    fn cook(
        &self,
        runtime: &dyn ContainerRuntime,
        store: &IngredientStore,
        pipeline: &dyn Pipeline,
        cancel: &CancelToken,
        log: &Path,
    ) -> Result<()> {
        let mut cache = self.cache()?;

        pipeline.update(FETCH_STAGE, StepStatus::Working);
        let report = self
            .fetch(store, &mut cache)
            .inspect_err(|_| pipeline.update(FETCH_STAGE, StepStatus::Failed))?;
        pipeline.update(FETCH_STAGE, StepStatus::Done);
        cancel.check()?;

        pipeline.update(COMPOSE_STAGE, StepStatus::Working);
        let layers = self
            .layers(&report.host_packs)
            .inspect_err(|_| pipeline.update(COMPOSE_STAGE, StepStatus::Failed))?;
        let host_packages = if self.is_confined() {
            self.recipe.environment.host.packages.clone()
        } else {
            if !self.recipe.environment.host.packages.is_empty() {
                warn!("Unconfined build, host packages must already be installed");
            }
            Vec::new()
        };
        let composer = LayerComposer::new(self.layout.ns())
            .with_bootstrap(self.bootstrap()?)
            .with_host_packages(host_packages)
            .with_style(if self.target.platform == "windows" {
                GuestStyle::Windows
            } else {
                GuestStyle::Posix
            });
        let composed = composer
            .compose(&layers, &mut cache)
            .inspect_err(|_| pipeline.update(COMPOSE_STAGE, StepStatus::Failed))?;
        pipeline.update(COMPOSE_STAGE, StepStatus::Done);
        cancel.check()?;

        for part in &self.recipe.parts {
            fs::create_dir_all(self.layout.build().join(&part.name))?;
            fs::create_dir_all(self.layout.data().join("sources").join(&part.name))?;
        }

        let id = format!("bake-{}", self.layout.uuid.split('-').next().unwrap_or("build"));
        let mut container = runtime.create(&id, self.container_options(layers))?;
        info!("Cooking {} in {} container", self.recipe.project.name, runtime.name());

        let result = self.cook_in(container.as_mut(), &mut cache, pipeline, cancel, log, composed.rootfs_prepared);
        if let Err(e) = container.destroy() {
            warn!("Failed to destroy container {}: {}", id, e);
        }
        result
    }

    fn cook_in(
        &self,
        container: &mut dyn Container,
        cache: &mut BuildCache,
        pipeline: &dyn Pipeline,
        cancel: &CancelToken,
        log: &Path,
        rootfs_prepared: bool,
    ) -> Result<()> {
        let paths = if self.is_confined() {
            GuestPaths::confined(&container.chef_root())
        } else {
            GuestPaths::unconfined(&self.layout, &self.project_dir)
        };
        let options = SchedulerOptions {
            user: self.options.user.clone(),
            step_timeout: self.options.step_timeout,
            ..Default::default()
        };
        let scheduler = StepScheduler::new(&self.recipe, &self.target, paths, log, pipeline)
            .with_cancel(cancel.clone())
            .with_options(options);

        if rootfs_prepared || !cache.has_key(HOOKS_KEY) {
            self.run_hooks(&scheduler, container, cache)?;
        }
        scheduler.run(container, cache)
    }

    /// Run the environment setup hook once per composed rootfs
    fn run_hooks(
        &self,
        scheduler: &StepScheduler<'_>,
        container: &mut dyn Container,
        cache: &mut BuildCache,
    ) -> Result<()> {
        let hooks = &self.recipe.environment.hooks;
        let script = if self.target.platform == "windows" {
            hooks.powershell.as_ref()
        } else {
            hooks.bash.as_ref()
        };
        if let Some(script) = script {
            info!("Running environment setup hook");
            scheduler.run_hook(container, script)?;
        }
        cache.set_key(HOOKS_KEY, true)
    }

    /// Emit the recipe's packs into `out_dir`, the kitchen output by default
    pub fn pack(&self, key: Option<&SigningKeyPair>, out_dir: Option<&Path>) -> Result<Vec<PathBuf>> {
        let mut packager = Packager::new(&self.recipe, &self.target);
        if let Some(key) = key {
            packager = packager.with_signing_key(key);
        }
        let out_dir = out_dir.map_or_else(|| self.layout.output(), Path::to_path_buf);
        packager.pack_all(&self.layout.install(), &out_dir)
    }

    /// Invalidate build state
    ///
    /// `what` names a part, a `part/step` pair or a step name unique across
    /// parts. Without it every step and the rootfs setup are invalidated and
    /// the build and install trees emptied.
    pub fn clean(&self, what: Option<&str>) -> Result<CleanScope> {
        let mut cache = self.cache()?;
        let Some(what) = what else {
            cache.invalidate_all()?;
            for dir in [self.layout.build(), self.layout.install()] {
                if dir.exists() {
                    fs::remove_dir_all(&dir)?;
                }
                fs::create_dir_all(&dir)?;
            }
            info!("Invalidated all steps of {}", self.recipe.project.name);
            return Ok(CleanScope::All);
        };

        let scope = self.clean_scope(what)?;
        match &scope {
            CleanScope::Part(part) => {
                cache.mark_part_incomplete(part)?;
                let build = self.layout.build().join(part);
                if build.exists() {
                    fs::remove_dir_all(&build)?;
                }
                info!("Invalidated part {}", part);
            }
            CleanScope::Step { part, step } => {
                cache.mark_step_incomplete(part, step)?;
                info!("Invalidated step {}/{} and its dependents", part, step);
            }
            CleanScope::All => {}
        }
        Ok(scope)
    }

    fn clean_scope(&self, what: &str) -> Result<CleanScope> {
        if let Some((part, step)) = what.split_once('/') {
            let found = self
                .recipe
                .find_part(part)
                .and_then(|p| p.find_step(step))
                .is_some();
            return if found {
                Ok(CleanScope::Step {
                    part: part.to_string(),
                    step: step.to_string(),
                })
            } else {
                Err(Error::NotFound(format!("step '{}'", what)))
            };
        }
        if self.recipe.find_part(what).is_some() {
            return Ok(CleanScope::Part(what.to_string()));
        }
        let owners: Vec<&str> = self
            .recipe
            .parts
            .iter()
            .filter(|p| p.find_step(what).is_some())
            .map(|p| p.name.as_str())
            .collect();
        match owners.as_slice() {
            [] => Err(Error::NotFound(format!("part or step '{}'", what))),
            [part] => Ok(CleanScope::Step {
                part: part.to_string(),
                step: what.to_string(),
            }),
            _ => Err(Error::Usage(format!(
                "step '{}' exists in parts {}; use part/step",
                what,
                owners.join(", ")
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::{Part, Step, StepType};
    use tempfile::TempDir;

    fn step(name: &str, depends: &[&str]) -> Step {
        Step {
            name: name.to_string(),
            step_type: StepType::Script,
            script: Some("true".to_string()),
            depends: depends.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn recipe() -> Recipe {
        let mut recipe = Recipe::default();
        recipe.project.name = "demo".to_string();
        recipe.parts = vec![
            Part {
                name: "lib".to_string(),
                steps: vec![step("config", &[]), step("build", &["config"])],
                ..Default::default()
            },
            Part {
                name: "app".to_string(),
                steps: vec![step("build", &[]), step("test", &["build"])],
                ..Default::default()
            },
        ];
        recipe
    }

    fn kitchen(dir: &TempDir) -> Kitchen {
        let recipe_path = dir.path().join("project/recipe.yaml");
        fs::create_dir_all(recipe_path.parent().unwrap()).unwrap();
        fs::write(&recipe_path, "").unwrap();
        let options = KitchenOptions {
            kitchen_dir: dir.path().join("kitchen"),
            confined: false,
            limits: ResourceLimits::default(),
            allow_network: false,
            step_timeout: None,
            user: "chef".to_string(),
        };
        Kitchen::open(&recipe_path, recipe(), Target::host(), options).unwrap()
    }

    #[test]
    fn test_open_sets_up_tree() {
        let dir = TempDir::new().unwrap();
        let kitchen = kitchen(&dir);
        assert!(kitchen.layout().install().is_dir());
        assert!(kitchen.layout().hash_file().is_file());
        assert_eq!(kitchen.project_dir(), fs::canonicalize(dir.path().join("project")).unwrap());
        assert!(!kitchen.is_confined());
    }

    #[test]
    fn test_clean_scopes() {
        let dir = TempDir::new().unwrap();
        let kitchen = kitchen(&dir);
        assert_eq!(kitchen.clean_scope("lib").unwrap(), CleanScope::Part("lib".to_string()));
        assert_eq!(
            kitchen.clean_scope("test").unwrap(),
            CleanScope::Step {
                part: "app".to_string(),
                step: "test".to_string()
            }
        );
        assert_eq!(
            kitchen.clean_scope("lib/build").unwrap(),
            CleanScope::Step {
                part: "lib".to_string(),
                step: "build".to_string()
            }
        );
        assert!(matches!(kitchen.clean_scope("build"), Err(Error::Usage(_))));
        assert!(matches!(kitchen.clean_scope("nothing"), Err(Error::NotFound(_))));
        assert!(matches!(kitchen.clean_scope("lib/nothing"), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_clean_step_invalidates_dependents() {
        let dir = TempDir::new().unwrap();
        let kitchen = kitchen(&dir);
        {
            let mut cache = kitchen.cache().unwrap();
            for (part, step) in [("lib", "config"), ("lib", "build"), ("app", "build")] {
                cache.mark_step_complete(part, step).unwrap();
            }
        }
        kitchen.clean(Some("lib/config")).unwrap();
        let cache = kitchen.cache().unwrap();
        assert!(!cache.is_step_complete("lib", "config"));
        assert!(!cache.is_step_complete("lib", "build"));
        assert!(cache.is_step_complete("app", "build"));

        kitchen.clean(None).unwrap();
        assert!(!kitchen.cache().unwrap().is_step_complete("app", "build"));
    }

    #[test]
    fn test_layers_bind_project() {
        let dir = TempDir::new().unwrap();
        let kitchen = kitchen(&dir);
        let layers = kitchen.layers(&[]).unwrap();
        let project = layers.last().unwrap();
        assert_eq!(
            project.bind_mount().unwrap().target,
            PathBuf::from(PROJECT_GUEST_DIR)
        );
        assert!(project.bind_mount().unwrap().writable);
    }

    #[test]
    fn test_container_options_for_unconfined() {
        let dir = TempDir::new().unwrap();
        let kitchen = kitchen(&dir);
        let options = kitchen.container_options(Vec::new());
        assert!(options.policy.is_none());
        assert_eq!(options.staging_dir, kitchen.layout().ns());
    }
}
