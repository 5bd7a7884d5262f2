// src/kitchen/environment.rs

//! Paths and environment seen by build commands
//!
//! The environment is layered: the base set (user, home, system paths),
//! then ingredient and toolchain overrides, then the step's own `env`,
//! which always wins.

use crate::kitchen::layout::KitchenLayout;
use crate::recipe::{Part, Source, Step, Target};
use std::path::{Path, PathBuf};

pub const SYSTEM_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";
pub const SYSTEM_LIBRARY_PATH: &str = "/usr/local/lib";

/// The chef tree as the payload sees it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestPaths {
    pub chef: PathBuf,
    pub project: PathBuf,
    pub install: PathBuf,
    pub toolchains: PathBuf,
    pub ingredients: PathBuf,
    pub build: PathBuf,
    pub data: PathBuf,
}

impl GuestPaths {
    /// Paths below the container's chef root; the project is bound in
    pub fn confined(chef_root: &Path) -> Self {
        Self {
            chef: chef_root.to_path_buf(),
            project: chef_root.join("project"),
            install: chef_root.join("install"),
            toolchains: chef_root.join("toolchains"),
            ingredients: chef_root.join("ingredients"),
            build: chef_root.join("build"),
            data: chef_root.join("data"),
        }
    }

    /// Host paths for builds that run without a container
    pub fn unconfined(layout: &KitchenLayout, project_dir: &Path) -> Self {
        Self {
            project: project_dir.to_path_buf(),
            ..Self::confined(&layout.chef())
        }
    }

    pub fn build_dir(&self, part: &str) -> PathBuf {
        self.build.join(part)
    }

    /// Where a part's sources live
    pub fn source_dir(&self, part: &Part) -> PathBuf {
        match &part.source {
            Source::Path(path) => {
                let relative = path.trim_start_matches("./");
                if relative.is_empty() || relative == "." {
                    self.project.clone()
                } else {
                    self.project.join(relative)
                }
            }
            _ => self.data.join("sources").join(&part.name),
        }
    }

    pub fn toolchain_dir(&self, name: &str) -> PathBuf {
        self.toolchains.join(name)
    }
}

/// Ordered variable set where later assignments replace earlier ones
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildEnvironment {
    vars: Vec<(String, String)>,
}

impl BuildEnvironment {
    /// USER, HOME, PATH and LD_LIBRARY_PATH
    pub fn base(user: &str, home: &Path) -> Self {
        let mut env = Self::default();
        env.set("USER", user);
        env.set("HOME", home.display().to_string());
        env.set("PATH", SYSTEM_PATH);
        env.set("LD_LIBRARY_PATH", SYSTEM_LIBRARY_PATH);
        env
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self.vars.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value,
            None => self.vars.push((key.to_string(), value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Put `dir` in front of a colon-separated list
    pub fn prepend(&mut self, key: &str, dir: &Path) {
        let dir = dir.display().to_string();
        let value = match self.get(key) {
            Some(current) if !current.is_empty() => format!("{}:{}", dir, current),
            _ => dir,
        };
        self.set(key, value);
    }

    fn append_flag(&mut self, key: &str, flag: String) {
        let value = match self.get(key) {
            Some(current) if !current.is_empty() => format!("{} {}", current, flag),
            _ => flag,
        };
        self.set(key, value);
    }

    /// Make the merged ingredient tree visible to compilers and pkg-config
    pub fn with_ingredients(&mut self, root: &Path, target: &Target) {
        self.prepend("PATH", &root.join("bin"));
        self.prepend("LD_LIBRARY_PATH", &root.join("lib"));
        self.prepend("PKG_CONFIG_PATH", &root.join("share/pkgconfig"));
        self.prepend("PKG_CONFIG_PATH", &root.join("lib/pkgconfig"));
        if target.is_cross() {
            self.set("PKG_CONFIG_SYSROOT_DIR", root.display().to_string());
            if let Some(path) = self.get("PKG_CONFIG_PATH").map(str::to_string) {
                self.set("PKG_CONFIG_LIBDIR", path);
            }
        }
        self.append_flag("CFLAGS", format!("-I{}", root.join("include").display()));
        self.append_flag("CXXFLAGS", format!("-I{}", root.join("include").display()));
        self.append_flag("LDFLAGS", format!("-L{}", root.join("lib").display()));
    }

    pub fn with_toolchain(&mut self, dir: &Path) {
        self.prepend("PATH", &dir.join("bin"));
        self.prepend("LD_LIBRARY_PATH", &dir.join("lib"));
        self.set("CHEF_TOOLCHAIN", dir.display().to_string());
    }

    /// Variables describing the build for scripts
    pub fn with_chef(&mut self, paths: &GuestPaths, part: &Part, target: &Target) {
        self.set("CHEF_PROJECT_DIR", paths.project.display().to_string());
        self.set("CHEF_SOURCE_DIR", paths.source_dir(part).display().to_string());
        self.set("CHEF_BUILD_DIR", paths.build_dir(&part.name).display().to_string());
        self.set("CHEF_INSTALL_DIR", paths.install.display().to_string());
        self.set("CHEF_TARGET_PLATFORM", target.platform.clone());
        self.set("CHEF_TARGET_ARCH", target.arch.clone());
    }

    pub fn apply_step(&mut self, step: &Step) {
        for (key, value) in &step.env {
            self.set(key, value.clone());
        }
    }

    pub fn vars(&self) -> &[(String, String)] {
        &self.vars
    }

    pub fn into_vars(self) -> Vec<(String, String)> {
        self.vars
    }
}

/// Everything the environment of one step depends on
pub struct EnvironmentContext<'a> {
    pub user: &'a str,
    pub paths: &'a GuestPaths,
    pub part: &'a Part,
    pub step: &'a Step,
    pub target: &'a Target,
    pub toolchain: Option<&'a Path>,
}

/// The complete environment of a step
pub fn compose(ctx: &EnvironmentContext<'_>) -> Vec<(String, String)> {
    let mut env = BuildEnvironment::base(ctx.user, &ctx.paths.chef);
    env.with_ingredients(&ctx.paths.ingredients, ctx.target);
    if let Some(toolchain) = ctx.toolchain {
        env.with_toolchain(toolchain);
    }
    env.with_chef(ctx.paths, ctx.part, ctx.target);
    env.apply_step(ctx.step);
    env.into_vars()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(arch: &str) -> Target {
        Target {
            platform: "linux".to_string(),
            arch: arch.to_string(),
        }
    }

    fn part() -> Part {
        Part {
            name: "zlib".to_string(),
            source: Source::Path("src/zlib".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_base_environment() {
        let env = BuildEnvironment::base("jane", Path::new("/chef"));
        assert_eq!(env.get("USER"), Some("jane"));
        assert_eq!(env.get("HOME"), Some("/chef"));
        assert_eq!(env.get("PATH"), Some(SYSTEM_PATH));
        assert_eq!(env.get("LD_LIBRARY_PATH"), Some("/usr/local/lib"));
    }

    #[test]
    fn test_step_env_wins() {
        let paths = GuestPaths::confined(Path::new("/chef"));
        let part = part();
        let step = Step {
            name: "build".to_string(),
            env: vec![
                ("PATH".to_string(), "/opt/bin".to_string()),
                ("CC".to_string(), "clang".to_string()),
            ],
            ..Default::default()
        };
        let target = target(crate::recipe::host_arch());
        let vars = compose(&EnvironmentContext {
            user: "jane",
            paths: &paths,
            part: &part,
            step: &step,
            target: &target,
            toolchain: Some(Path::new("/chef/toolchains/gcc")),
        });
        let get = |k: &str| vars.iter().find(|(key, _)| key == k).map(|(_, v)| v.as_str());
        assert_eq!(get("PATH"), Some("/opt/bin"));
        assert_eq!(get("CC"), Some("clang"));
        assert_eq!(get("CHEF_TOOLCHAIN"), Some("/chef/toolchains/gcc"));
        assert_eq!(get("CHEF_SOURCE_DIR"), Some("/chef/project/src/zlib"));
        assert_eq!(get("CHEF_BUILD_DIR"), Some("/chef/build/zlib"));
        assert!(get("PKG_CONFIG_PATH").unwrap().starts_with("/chef/ingredients/lib/pkgconfig"));
        assert!(get("PKG_CONFIG_SYSROOT_DIR").is_none());
    }

    #[test]
    fn test_cross_sets_sysroot() {
        let mut env = BuildEnvironment::base("jane", Path::new("/chef"));
        let arch = if crate::recipe::host_arch() == "riscv64" { "arm64" } else { "riscv64" };
        env.with_ingredients(Path::new("/chef/ingredients"), &target(arch));
        assert_eq!(env.get("PKG_CONFIG_SYSROOT_DIR"), Some("/chef/ingredients"));
        assert_eq!(env.get("PKG_CONFIG_LIBDIR"), env.get("PKG_CONFIG_PATH"));
    }

    #[test]
    fn test_source_dirs() {
        let paths = GuestPaths::confined(Path::new("/chef"));
        let mut part = part();
        part.source = Source::Path(".".to_string());
        assert_eq!(paths.source_dir(&part), PathBuf::from("/chef/project"));
        part.source = Source::Url("https://example.org/z.tar.gz".to_string());
        assert_eq!(paths.source_dir(&part), PathBuf::from("/chef/data/sources/zlib"));
    }
}
