// src/kitchen/scheduler.rs

//! Step scheduler
//!
//! Parts run in declaration order and steps within a part run in
//! declaration order; `depends` only drives invalidation. A step already
//! recorded in the build cache is skipped. The first failing step halts
//! the build without being marked complete, and no later part runs.
//!
//! Every command writes into the build log below a `=== part/step ===`
//! header. While a command runs the scheduler polls for its exit, for
//! cancellation and for the step timeout, and samples resource usage in
//! the background.

use crate::cache::BuildCache;
use crate::container::monitor::{Monitor, SAMPLE_INTERVAL};
use crate::container::{Container, ProcessHandle, SpawnSpec};
use crate::error::{Error, Result};
use crate::kitchen::environment::{self, EnvironmentContext, GuestPaths};
use crate::kitchen::systems::{self, Invocation, StepContext};
use crate::progress::{Pipeline, StepStatus};
use crate::recipe::{IngredientRef, Part, Recipe, Source, Step, Target};
use crate::signal::CancelToken;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Part toolchain value naming the target platform's toolchain
pub const PLATFORM_TOOLCHAIN: &str = "platform";

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Cache key recording that a part's source script ran
pub fn source_key(part: &str) -> String {
    format!("source:{}", part)
}

/// Stage name of a step in the pipeline view
pub fn stage_name(part: &str, step: &str) -> String {
    format!("{}/{}", part, step)
}

/// Every step of the recipe as a pipeline stage, in run order
pub fn stages(recipe: &Recipe) -> Vec<String> {
    recipe
        .parts
        .iter()
        .flat_map(|part| part.steps.iter().map(|s| stage_name(&part.name, &s.name)))
        .collect()
}

/// Resolve a part's toolchain into a concrete ingredient reference
///
/// `platform` selects the toolchain of the target platform; any other
/// value must be a `publisher/name@channel[/version]` reference.
pub fn resolve_toolchain(
    recipe: &Recipe,
    part: &Part,
    target: &Target,
) -> Result<Option<IngredientRef>> {
    let Some(toolchain) = part.toolchain.as_deref() else {
        return Ok(None);
    };
    if toolchain == PLATFORM_TOOLCHAIN {
        let platform = recipe.find_platform(&target.platform).ok_or_else(|| {
            Error::validation(
                format!("part '{}'", part.name),
                format!("toolchain 'platform' but platform '{}' is not declared", target.platform),
            )
        })?;
        return platform.toolchain.clone().map(Some).ok_or_else(|| {
            Error::validation(
                format!("part '{}'", part.name),
                format!("platform '{}' declares no toolchain", platform.name),
            )
        });
    }
    toolchain
        .parse::<IngredientRef>()
        .map(Some)
        .map_err(|e| Error::validation(format!("part '{}'", part.name), e))
}

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub user: String,
    pub jobs: usize,
    /// Upper bound for one command; `None` waits forever
    pub step_timeout: Option<Duration>,
    pub monitor_interval: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            user: crate::config::user(),
            jobs: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            step_timeout: None,
            monitor_interval: SAMPLE_INTERVAL,
        }
    }
}

pub struct StepScheduler<'a> {
    recipe: &'a Recipe,
    target: &'a Target,
    paths: GuestPaths,
    /// Host path of the build log
    log: PathBuf,
    pipeline: &'a dyn Pipeline,
    cancel: CancelToken,
    options: SchedulerOptions,
}

impl<'a> StepScheduler<'a> {
    pub fn new(
        recipe: &'a Recipe,
        target: &'a Target,
        paths: GuestPaths,
        log: impl Into<PathBuf>,
        pipeline: &'a dyn Pipeline,
    ) -> Self {
        Self {
            recipe,
            target,
            paths,
            log: log.into(),
            pipeline,
            cancel: CancelToken::new(),
            options: SchedulerOptions::default(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_options(mut self, options: SchedulerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn log_path(&self) -> &Path {
        &self.log
    }

    /// Run every part; stops at the first failure
    pub fn run(&self, container: &mut dyn Container, cache: &mut BuildCache) -> Result<()> {
        for part in &self.recipe.parts {
            self.run_part(container, cache, part)?;
        }
        Ok(())
    }

    /// Run the environment setup hook from the project directory
    pub fn run_hook(&self, container: &mut dyn Container, script: &str) -> Result<()> {
        self.cancel.check()?;
        self.log_header("hooks")?;
        let part = Part {
            name: "hooks".to_string(),
            ..Default::default()
        };
        let step = Step {
            name: "setup".to_string(),
            step_type: crate::recipe::StepType::Script,
            script: Some(script.to_string()),
            ..Default::default()
        };
        self.run_step(container, &part, &step, None)
    }

    pub fn run_part(
        &self,
        container: &mut dyn Container,
        cache: &mut BuildCache,
        part: &Part,
    ) -> Result<()> {
        let toolchain = resolve_toolchain(self.recipe, part, self.target)?;
        let toolchain_dir = toolchain
            .as_ref()
            .map(|t| self.paths.toolchain_dir(&t.name));
        if let Some(toolchain) = &toolchain {
            debug!("Part {} uses toolchain {}", part.name, toolchain);
        }

        if let Source::Script(script) = &part.source {
            let key = source_key(&part.name);
            if !cache.has_key(&key) {
                self.cancel.check()?;
                self.log_header(&format!("{} (source)", part.name))?;
                let source = Step {
                    name: "source".to_string(),
                    step_type: crate::recipe::StepType::Script,
                    script: Some(script.clone()),
                    ..Default::default()
                };
                self.run_step(container, part, &source, toolchain_dir.as_deref())?;
                cache.set_key(&key, true)?;
            }
        }

        for step in &part.steps {
            let stage = stage_name(&part.name, &step.name);
            if cache.is_step_complete(&part.name, &step.name) {
                debug!("Step {} is complete, skipping", stage);
                self.pipeline.update(&stage, StepStatus::Done);
                continue;
            }
            self.cancel.check()?;

            info!("Running {} ({})", stage, step.step_type.as_str());
            self.pipeline.update(&stage, StepStatus::Working);
            self.log_header(&stage)?;

            match self.run_step(container, part, step, toolchain_dir.as_deref()) {
                Ok(()) => {
                    cache.mark_step_complete(&part.name, &step.name)?;
                    self.pipeline.update(&stage, StepStatus::Done);
                }
                Err(e) => {
                    self.pipeline.update(&stage, StepStatus::Failed);
                    let _ = self.append_log(&format!("{} failed: {}\n", stage, e));
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn run_step(
        &self,
        container: &mut dyn Container,
        part: &Part,
        step: &Step,
        toolchain_dir: Option<&Path>,
    ) -> Result<()> {
        let source_dir = self.paths.source_dir(part);
        let build_dir = self.paths.build_dir(&part.name);
        let ctx = StepContext {
            source_dir: &source_dir,
            build_dir: &build_dir,
            install_dir: &self.paths.install,
            ingredients_dir: &self.paths.ingredients,
            toolchain_dir,
            target: self.target,
            in_tree: part.steps.iter().any(|s| s.options.make.in_tree),
            jobs: self.options.jobs,
            powershell: self.target.platform == "windows",
        };
        let env = environment::compose(&EnvironmentContext {
            user: &self.options.user,
            paths: &self.paths,
            part,
            step,
            target: self.target,
            toolchain: toolchain_dir,
        });

        let stage = stage_name(&part.name, &step.name);
        for invocation in systems::plan(step, &ctx)? {
            let code = self.run_invocation(container, &stage, invocation, &env);
            self.report_denials(container, &stage);
            let code = code?;
            if code != 0 {
                return Err(Error::StepFailed { step: stage, code });
            }
        }
        Ok(())
    }

    fn run_invocation(
        &self,
        container: &mut dyn Container,
        stage: &str,
        invocation: Invocation,
        env: &[(String, String)],
    ) -> Result<i32> {
        let mut vars = env.to_vec();
        for (key, value) in invocation.env {
            match vars.iter_mut().find(|(k, _)| *k == key) {
                Some(entry) => entry.1 = value,
                None => vars.push((key, value)),
            }
        }
        let spec = SpawnSpec::new(invocation.program)
            .args(invocation.args)
            .env(vars)
            .cwd(invocation.cwd)
            .log(&self.log);
        self.append_log(&format!("$ {}\n", spec.command_line()))?;

        let mut handle = container.spawn(&spec)?;
        let monitor = Monitor::start_with_interval(
            stage.to_string(),
            container.stats_source(),
            self.options.monitor_interval,
        );
        let result = self.wait(container, &mut handle);
        let peak = monitor.stop();
        debug!(
            "{}: peak {} bytes, {} processes over {} samples",
            stage, peak.memory_bytes, peak.process_count, peak.samples
        );
        result
    }

    /// Wait for the process, honouring cancellation and the step timeout
    fn wait(&self, container: &mut dyn Container, handle: &mut ProcessHandle) -> Result<i32> {
        let start = Instant::now();
        loop {
            if let Some(code) = container.try_wait(handle)? {
                return Ok(code);
            }
            if let Some(signal) = self.cancel.signal() {
                warn!("Cancelled by signal {}, stopping process {}", signal, handle.pid);
                container.kill(handle)?;
                let _ = self.append_log(&format!("cancelled by signal {}\n", signal));
                return Err(Error::Cancelled(signal));
            }
            if let Some(limit) = self.options.step_timeout {
                if start.elapsed() > limit {
                    container.kill(handle)?;
                    return Err(Error::ContainerError(format!(
                        "process {} timed out after {:?}",
                        handle.pid, limit
                    )));
                }
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    fn report_denials(&self, container: &dyn Container, stage: &str) {
        let Some(policy) = container.policy() else {
            return;
        };
        let ring = policy.events();
        for event in ring.drain() {
            warn!(
                "{}: policy denied {} '{}' (hook {}, mask {:#x})",
                stage, event.comm, event.name, event.hook_id, event.required_mask
            );
            let _ = self.append_log(&format!(
                "policy denied {} '{}' (hook {})\n",
                event.comm, event.name, event.hook_id
            ));
        }
        if ring.dropped() > 0 {
            warn!("{}: {} policy events dropped", stage, ring.dropped());
        }
    }

    fn log_header(&self, phase: &str) -> Result<()> {
        self.append_log(&format!("=== {} ===\n", phase))
    }

    fn append_log(&self, text: &str) -> Result<()> {
        if let Some(parent) = self.log.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log)?;
        file.write_all(text.as_bytes())?;
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::container::{ContainerOptions, ContainerRuntime, HostRuntime, StatsSource};
    use crate::policy::key::FsResolver;
    use crate::policy::{Policy, PolicyEvaluator};
    use crate::progress::SilentPipeline;
    use crate::recipe::{Platform, StepType};
    use std::fs;
    use tempfile::TempDir;

    fn script(name: &str, body: &str, depends: &[&str]) -> Step {
        Step {
            name: name.to_string(),
            step_type: StepType::Script,
            script: Some(body.to_string()),
            depends: depends.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn recipe(steps: Vec<Step>) -> Recipe {
        let mut recipe = Recipe::default();
        recipe.project.name = "demo".to_string();
        recipe.parts = vec![Part {
            name: "app".to_string(),
            steps,
            ..Default::default()
        }];
        recipe
    }

    struct Fixture {
        dir: TempDir,
        paths: GuestPaths,
        log: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let chef = dir.path().join("ns/chef");
        let paths = GuestPaths {
            project: dir.path().join("project"),
            ..GuestPaths::confined(&chef)
        };
        for d in [&paths.project, &paths.install, &paths.build_dir("app")] {
            fs::create_dir_all(d).unwrap();
        }
        let log = dir.path().join("build.log");
        Fixture { dir, paths, log }
    }

    fn container(f: &Fixture) -> Box<dyn Container> {
        HostRuntime
            .create("sched-test", ContainerOptions::new(f.dir.path().join("ns")))
            .unwrap()
    }

    #[test]
    fn test_steps_run_in_order_and_are_cached() {
        let f = fixture();
        let recipe = recipe(vec![
            script("one", "echo one >> \"$CHEF_INSTALL_DIR/order\"", &[]),
            script("two", "echo two >> \"$CHEF_INSTALL_DIR/order\"", &["one"]),
        ]);
        let target = Target::host();
        let mut cache = BuildCache::open(f.dir.path().join("cache.json"), &recipe, &target).unwrap();
        let pipeline = SilentPipeline::new();
        pipeline.begin(&stages(&recipe));
        let scheduler = StepScheduler::new(&recipe, &target, f.paths.clone(), &f.log, &pipeline);

        let mut c = container(&f);
        scheduler.run(c.as_mut(), &mut cache).unwrap();
        assert_eq!(
            fs::read_to_string(f.paths.install.join("order")).unwrap(),
            "one\ntwo\n"
        );
        assert!(cache.is_step_complete("app", "two"));
        assert_eq!(pipeline.status("app/two"), Some(StepStatus::Done));

        // second run skips everything
        scheduler.run(c.as_mut(), &mut cache).unwrap();
        assert_eq!(
            fs::read_to_string(f.paths.install.join("order")).unwrap(),
            "one\ntwo\n"
        );
        c.destroy().unwrap();

        let log = fs::read_to_string(&f.log).unwrap();
        assert!(log.contains("=== app/one ==="));
        assert!(log.contains("=== app/two ==="));
    }

    #[test]
    fn test_failure_halts_and_is_not_marked() {
        let f = fixture();
        let recipe = recipe(vec![
            script("one", "echo building", &[]),
            script("two", "echo broken >&2; exit 3", &[]),
            script("three", "touch \"$CHEF_INSTALL_DIR/three\"", &[]),
        ]);
        let target = Target::host();
        let mut cache = BuildCache::open(f.dir.path().join("cache.json"), &recipe, &target).unwrap();
        let pipeline = SilentPipeline::new();
        let scheduler = StepScheduler::new(&recipe, &target, f.paths.clone(), &f.log, &pipeline);

        let mut c = container(&f);
        let err = scheduler.run(c.as_mut(), &mut cache).unwrap_err();
        c.destroy().unwrap();
        assert!(matches!(err, Error::StepFailed { ref step, code: 3 } if step == "app/two"));
        assert!(cache.is_step_complete("app", "one"));
        assert!(!cache.is_step_complete("app", "two"));
        assert!(!f.paths.install.join("three").exists());
        assert_eq!(pipeline.status("app/two"), Some(StepStatus::Failed));

        let log = fs::read_to_string(&f.log).unwrap();
        assert!(log.contains("broken"));
    }

    /// Host container that consults a policy before every spawn
    struct Guarded {
        inner: Box<dyn Container>,
        evaluator: PolicyEvaluator,
    }

    impl Container for Guarded {
        fn id(&self) -> &str {
            self.inner.id()
        }

        fn rootfs(&self) -> &Path {
            self.inner.rootfs()
        }

        fn chef_root(&self) -> PathBuf {
            self.inner.chef_root()
        }

        fn spawn(&mut self, spec: &SpawnSpec) -> Result<ProcessHandle> {
            let cwd = spec.cwd.as_deref().unwrap_or(Path::new("/"));
            self.evaluator.check_spawn(&spec.path, None, cwd)?;
            self.inner.spawn(spec)
        }

        fn try_wait(&mut self, handle: &mut ProcessHandle) -> Result<Option<i32>> {
            self.inner.try_wait(handle)
        }

        fn kill(&mut self, handle: &ProcessHandle) -> Result<()> {
            self.inner.kill(handle)
        }

        fn stats_source(&self) -> StatsSource {
            self.inner.stats_source()
        }

        fn policy(&self) -> Option<&PolicyEvaluator> {
            Some(&self.evaluator)
        }

        fn destroy(self: Box<Self>) -> Result<()> {
            self.inner.destroy()
        }
    }

    #[test]
    fn test_refused_spawn_is_logged() {
        let f = fixture();
        let guest = f.dir.path().join("guest");
        fs::create_dir_all(guest.join("bin")).unwrap();
        fs::write(guest.join("bin/sh"), "").unwrap();
        let evaluator =
            PolicyEvaluator::install(&Policy::new(), 5, &guest, Box::new(FsResolver)).unwrap();

        let recipe = recipe(vec![script("one", "true", &[])]);
        let target = Target::host();
        let mut cache = BuildCache::open(f.dir.path().join("cache.json"), &recipe, &target).unwrap();
        let pipeline = SilentPipeline::new();
        let scheduler = StepScheduler::new(&recipe, &target, f.paths.clone(), &f.log, &pipeline);

        let mut c: Box<dyn Container> = Box::new(Guarded {
            inner: container(&f),
            evaluator,
        });
        let err = scheduler.run(c.as_mut(), &mut cache).unwrap_err();
        assert!(matches!(err, Error::PolicyDenied { ref target, .. } if target == "/bin/sh"));
        assert!(c.policy().unwrap().events().drain().is_empty());
        c.destroy().unwrap();

        assert!(!cache.is_step_complete("app", "one"));
        let log = fs::read_to_string(&f.log).unwrap();
        assert!(log.contains("policy denied sh 'sh'"), "{log}");
    }

    #[test]
    fn test_cancellation_stops_running_step() {
        let f = fixture();
        let recipe = recipe(vec![script("slow", "sleep 30", &[])]);
        let target = Target::host();
        let mut cache = BuildCache::open(f.dir.path().join("cache.json"), &recipe, &target).unwrap();
        let pipeline = SilentPipeline::new();
        let cancel = CancelToken::new();
        let scheduler = StepScheduler::new(&recipe, &target, f.paths.clone(), &f.log, &pipeline)
            .with_cancel(cancel.clone());

        let trigger = cancel.clone();
        let waker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(200));
            trigger.cancel(libc::SIGINT);
        });
        let mut c = container(&f);
        let start = Instant::now();
        let err = scheduler.run(c.as_mut(), &mut cache).unwrap_err();
        waker.join().unwrap();
        c.destroy().unwrap();
        assert!(matches!(err, Error::Cancelled(sig) if sig == libc::SIGINT));
        assert!(start.elapsed() < Duration::from_secs(20));
        assert!(!cache.is_step_complete("app", "slow"));
    }

    #[test]
    fn test_step_timeout() {
        let f = fixture();
        let recipe = recipe(vec![script("slow", "sleep 30", &[])]);
        let target = Target::host();
        let mut cache = BuildCache::open(f.dir.path().join("cache.json"), &recipe, &target).unwrap();
        let pipeline = SilentPipeline::new();
        let scheduler = StepScheduler::new(&recipe, &target, f.paths.clone(), &f.log, &pipeline)
            .with_options(SchedulerOptions {
                step_timeout: Some(Duration::from_millis(200)),
                ..Default::default()
            });
        let mut c = container(&f);
        let err = scheduler.run(c.as_mut(), &mut cache).unwrap_err();
        c.destroy().unwrap();
        assert!(matches!(err, Error::ContainerError(_)));
    }

    #[test]
    fn test_resolve_platform_toolchain() {
        let mut recipe = recipe(Vec::new());
        let target = Target {
            platform: "linux".to_string(),
            arch: "amd64".to_string(),
        };
        recipe.parts[0].toolchain = Some("platform".to_string());
        assert!(resolve_toolchain(&recipe, &recipe.parts[0], &target).is_err());

        recipe.platforms = vec![Platform {
            name: "linux".to_string(),
            toolchain: Some("acme/gcc@stable".parse().unwrap()),
            architectures: vec!["amd64".to_string()],
        }];
        let resolved = resolve_toolchain(&recipe, &recipe.parts[0], &target)
            .unwrap()
            .unwrap();
        assert_eq!(resolved.name, "gcc");

        recipe.parts[0].toolchain = Some("acme/clang@edge/17".to_string());
        let explicit = resolve_toolchain(&recipe, &recipe.parts[0], &target)
            .unwrap()
            .unwrap();
        assert_eq!(explicit.version.as_deref(), Some("17"));

        recipe.parts[0].toolchain = None;
        assert!(resolve_toolchain(&recipe, &recipe.parts[0], &target).unwrap().is_none());
    }

    #[test]
    fn test_script_source_runs_once() {
        let f = fixture();
        let mut recipe = recipe(vec![script("list", "ls > \"$CHEF_INSTALL_DIR/listing\"", &[])]);
        recipe.parts[0].source = Source::Script("echo generated > gen.c".to_string());
        let source_dir = f.paths.source_dir(&recipe.parts[0]);
        fs::create_dir_all(&source_dir).unwrap();

        let target = Target::host();
        let mut cache = BuildCache::open(f.dir.path().join("cache.json"), &recipe, &target).unwrap();
        let pipeline = SilentPipeline::new();
        let scheduler = StepScheduler::new(&recipe, &target, f.paths.clone(), &f.log, &pipeline);
        let mut c = container(&f);
        scheduler.run(c.as_mut(), &mut cache).unwrap();
        c.destroy().unwrap();
        assert!(source_dir.join("gen.c").exists());
        assert!(cache.has_key(&source_key("app")));
        assert!(fs::read_to_string(f.paths.install.join("listing")).unwrap().contains("gen.c"));
    }
}
