// src/kitchen/systems.rs

//! Command lines for generators and build systems
//!
//! Every part is configured out of tree into its own build directory and
//! installed with `DESTDIR` pointing at the shared install tree, using `/`
//! as the prefix. Consumers of the packs relocate through the pkg-config
//! sysroot.

use crate::error::{Error, Result};
use crate::recipe::{Step, StepType, Target, normalize_arch};
use std::path::{Path, PathBuf};

pub const INSTALL_PREFIX: &str = "/";

/// One command of a step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    /// Added on top of the step environment
    pub env: Vec<(String, String)>,
}

impl Invocation {
    fn new(program: &str, cwd: &Path) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            cwd: cwd.to_path_buf(),
            env: Vec::new(),
        }
    }

    fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    fn destdir(mut self, install: &Path) -> Self {
        self.env
            .push(("DESTDIR".to_string(), install.display().to_string()));
        self
    }
}

/// Directories and target a step runs against
#[derive(Debug, Clone)]
pub struct StepContext<'a> {
    pub source_dir: &'a Path,
    pub build_dir: &'a Path,
    pub install_dir: &'a Path,
    pub ingredients_dir: &'a Path,
    pub toolchain_dir: Option<&'a Path>,
    pub target: &'a Target,
    /// Whether the part builds inside its source tree
    pub in_tree: bool,
    pub jobs: usize,
    /// Scripts run with PowerShell instead of sh
    pub powershell: bool,
}

impl StepContext<'_> {
    fn work_dir(&self) -> &Path {
        if self.in_tree {
            self.source_dir
        } else {
            self.build_dir
        }
    }
}

/// GNU triplet for an architecture on Linux
pub fn gnu_triplet(arch: &str) -> Option<&'static str> {
    match normalize_arch(arch) {
        "amd64" => Some("x86_64-linux-gnu"),
        "i386" => Some("i686-linux-gnu"),
        "arm64" => Some("aarch64-linux-gnu"),
        "armhf" => Some("arm-linux-gnueabihf"),
        "riscv64" => Some("riscv64-linux-gnu"),
        _ => None,
    }
}

fn cmake_processor(arch: &str) -> &str {
    match normalize_arch(arch) {
        "amd64" => "x86_64",
        "i386" => "i686",
        "arm64" => "aarch64",
        "armhf" => "arm",
        other => other,
    }
}

fn cmake_system(platform: &str) -> String {
    let mut chars = platform.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// The commands a step runs, in order
pub fn plan(step: &Step, ctx: &StepContext<'_>) -> Result<Vec<Invocation>> {
    match step.step_type {
        StepType::Script => plan_script(step, ctx),
        StepType::Generate => plan_generate(step, ctx),
        StepType::Build => plan_build(step, ctx),
    }
}

fn require_system<'s>(step: &'s Step) -> Result<&'s str> {
    step.system.as_deref().ok_or_else(|| {
        Error::validation(
            format!("step '{}'", step.name),
            format!("{} steps require 'system'", step.step_type.as_str()),
        )
    })
}

fn plan_script(step: &Step, ctx: &StepContext<'_>) -> Result<Vec<Invocation>> {
    let script = step
        .script
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| Error::validation(format!("step '{}'", step.name), "empty script"))?;
    let invocation = if ctx.powershell {
        Invocation::new("powershell.exe", ctx.source_dir).args([
            "-NoProfile",
            "-NonInteractive",
            "-Command",
            script,
        ])
    } else {
        Invocation::new("/bin/sh", ctx.source_dir).args(["-e", "-c", script])
    };
    Ok(vec![invocation.destdir(ctx.install_dir)])
}

fn plan_generate(step: &Step, ctx: &StepContext<'_>) -> Result<Vec<Invocation>> {
    let system = require_system(step)?;
    let cross = ctx.target.is_cross();
    let invocation = match system {
        "configure" => {
            let script = ctx.source_dir.join("configure");
            let mut inv = Invocation::new(&script.display().to_string(), ctx.work_dir())
                .arg(format!("--prefix={}", INSTALL_PREFIX));
            if cross {
                let triplet = gnu_triplet(&ctx.target.arch).ok_or_else(|| {
                    Error::UnsupportedTarget {
                        platform: ctx.target.platform.clone(),
                        arch: ctx.target.arch.clone(),
                        reason: "no GNU triplet for this architecture".to_string(),
                    }
                })?;
                inv = inv.arg(format!("--host={}", triplet));
            }
            inv
        }
        "cmake" => {
            let mut inv = Invocation::new("cmake", ctx.build_dir)
                .arg("-S")
                .arg(ctx.source_dir.display().to_string())
                .arg("-B")
                .arg(ctx.build_dir.display().to_string())
                .arg(format!("-DCMAKE_INSTALL_PREFIX={}", INSTALL_PREFIX))
                .arg(format!("-DCMAKE_PREFIX_PATH={}", ctx.ingredients_dir.display()));
            if let Some(toolchain) = ctx.toolchain_dir {
                inv = inv.arg(format!("-DCMAKE_FIND_ROOT_PATH={}", toolchain.display()));
            }
            if cross {
                inv = inv
                    .arg(format!("-DCMAKE_SYSTEM_NAME={}", cmake_system(&ctx.target.platform)))
                    .arg(format!(
                        "-DCMAKE_SYSTEM_PROCESSOR={}",
                        cmake_processor(&ctx.target.arch)
                    ));
            }
            inv
        }
        "meson" => {
            let mut inv = Invocation::new("meson", ctx.build_dir)
                .arg("setup")
                .arg(ctx.build_dir.display().to_string())
                .arg(ctx.source_dir.display().to_string())
                .arg(format!("--prefix={}", INSTALL_PREFIX));
            if let Some(cross_file) = &step.options.meson.cross_file {
                let path = ctx.source_dir.join(cross_file);
                inv = inv.arg(format!("--cross-file={}", path.display()));
            }
            // wraps resolve through the ingredient tree, never a download
            if !step.options.meson.wraps.is_empty() {
                let pkgconfig = ctx.ingredients_dir.join("lib/pkgconfig");
                inv = inv
                    .arg("--wrap-mode=nodownload")
                    .arg(format!("--pkg-config-path={}", pkgconfig.display()));
            }
            inv
        }
        other => {
            return Err(Error::validation(
                format!("step '{}'", step.name),
                format!("unknown generator '{}'", other),
            ));
        }
    };
    Ok(vec![invocation.args(step.arguments.iter().cloned())])
}

fn plan_build(step: &Step, ctx: &StepContext<'_>) -> Result<Vec<Invocation>> {
    let system = require_system(step)?;
    let jobs = ctx.jobs.max(1).to_string();
    let extra = step.arguments.iter().cloned();
    let invocations = match system {
        "make" => {
            let make = &step.options.make;
            let dir = if make.in_tree {
                ctx.source_dir
            } else {
                ctx.build_dir
            };
            let mut build = Invocation::new("make", dir);
            if make.parallel {
                build = build.arg(format!("-j{}", jobs));
            }
            vec![
                build.args(extra),
                Invocation::new("make", dir)
                    .arg("install")
                    .arg(format!("DESTDIR={}", ctx.install_dir.display()))
                    .destdir(ctx.install_dir),
            ]
        }
        "ninja" => vec![
            Invocation::new("ninja", ctx.build_dir)
                .arg("-C")
                .arg(ctx.build_dir.display().to_string())
                .arg(format!("-j{}", jobs))
                .args(extra),
            Invocation::new("ninja", ctx.build_dir)
                .arg("-C")
                .arg(ctx.build_dir.display().to_string())
                .arg("install")
                .destdir(ctx.install_dir),
        ],
        "meson" => vec![
            Invocation::new("meson", ctx.build_dir)
                .arg("compile")
                .arg("-C")
                .arg(ctx.build_dir.display().to_string())
                .args(extra),
            Invocation::new("meson", ctx.build_dir)
                .arg("install")
                .arg("-C")
                .arg(ctx.build_dir.display().to_string())
                .destdir(ctx.install_dir),
        ],
        "cmake" => vec![
            Invocation::new("cmake", ctx.build_dir)
                .arg("--build")
                .arg(ctx.build_dir.display().to_string())
                .arg("--parallel")
                .arg(jobs)
                .args(extra),
            Invocation::new("cmake", ctx.build_dir)
                .arg("--install")
                .arg(ctx.build_dir.display().to_string())
                .destdir(ctx.install_dir),
        ],
        other => {
            return Err(Error::validation(
                format!("step '{}'", step.name),
                format!("unknown build system '{}'", other),
            ));
        }
    };
    Ok(invocations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::{MakeOptions, MesonWrap};

    struct Dirs {
        source: PathBuf,
        build: PathBuf,
        install: PathBuf,
        ingredients: PathBuf,
    }

    fn dirs() -> Dirs {
        Dirs {
            source: PathBuf::from("/chef/project"),
            build: PathBuf::from("/chef/build/zlib"),
            install: PathBuf::from("/chef/install"),
            ingredients: PathBuf::from("/chef/ingredients"),
        }
    }

    fn ctx<'a>(dirs: &'a Dirs, target: &'a Target) -> StepContext<'a> {
        StepContext {
            source_dir: &dirs.source,
            build_dir: &dirs.build,
            install_dir: &dirs.install,
            ingredients_dir: &dirs.ingredients,
            toolchain_dir: None,
            target,
            in_tree: false,
            jobs: 4,
            powershell: false,
        }
    }

    fn step(step_type: StepType, system: &str) -> Step {
        Step {
            name: "s".to_string(),
            step_type,
            system: Some(system.to_string()),
            ..Default::default()
        }
    }

    fn cross_target() -> Target {
        let arch = if crate::recipe::host_arch() == "arm64" { "riscv64" } else { "arm64" };
        Target {
            platform: "linux".to_string(),
            arch: arch.to_string(),
        }
    }

    #[test]
    fn test_configure_native_and_cross() {
        let dirs = dirs();
        let host = Target::host();
        let mut configure = step(StepType::Generate, "configure");
        configure.arguments = vec!["--disable-static".to_string()];

        let plan_native = plan(&configure, &ctx(&dirs, &host)).unwrap();
        assert_eq!(plan_native.len(), 1);
        assert_eq!(plan_native[0].program, "/chef/project/configure");
        assert_eq!(plan_native[0].cwd, dirs.build);
        assert_eq!(plan_native[0].args, vec!["--prefix=/", "--disable-static"]);

        let cross = cross_target();
        let plan_cross = plan(&configure, &ctx(&dirs, &cross)).unwrap();
        assert!(plan_cross[0].args.iter().any(|a| a.starts_with("--host=")));
    }

    #[test]
    fn test_make_parallel_and_install() {
        let dirs = dirs();
        let host = Target::host();
        let make = step(StepType::Build, "make");
        let invocations = plan(&make, &ctx(&dirs, &host)).unwrap();
        assert_eq!(invocations[0].args, vec!["-j4"]);
        assert_eq!(invocations[1].args, vec!["install", "DESTDIR=/chef/install"]);

        let mut serial = make.clone();
        serial.options.make = MakeOptions {
            in_tree: true,
            parallel: false,
        };
        let invocations = plan(&serial, &ctx(&dirs, &host)).unwrap();
        assert!(invocations[0].args.is_empty());
        assert_eq!(invocations[0].cwd, dirs.source);
    }

    #[test]
    fn test_meson_generate_with_wraps() {
        let dirs = dirs();
        let host = Target::host();
        let mut meson = step(StepType::Generate, "meson");
        meson.options.meson.cross_file = Some("cross/arm64.ini".to_string());
        meson.options.meson.wraps = vec![MesonWrap {
            name: "zlib".to_string(),
            ingredient: "acme/zlib".to_string(),
        }];
        let invocations = plan(&meson, &ctx(&dirs, &host)).unwrap();
        let args = &invocations[0].args;
        assert_eq!(args[0], "setup");
        assert!(args.contains(&"--prefix=/".to_string()));
        assert!(args.contains(&"--cross-file=/chef/project/cross/arm64.ini".to_string()));
        assert!(args.contains(&"--wrap-mode=nodownload".to_string()));
    }

    #[test]
    fn test_cmake_cross_and_install_destdir() {
        let dirs = dirs();
        let cross = cross_target();
        let generate = plan(&step(StepType::Generate, "cmake"), &ctx(&dirs, &cross)).unwrap();
        assert!(generate[0].args.contains(&"-DCMAKE_INSTALL_PREFIX=/".to_string()));
        assert!(generate[0].args.contains(&"-DCMAKE_SYSTEM_NAME=Linux".to_string()));

        let build = plan(&step(StepType::Build, "cmake"), &ctx(&dirs, &cross)).unwrap();
        assert_eq!(build.len(), 2);
        assert_eq!(build[1].args[0], "--install");
        assert_eq!(
            build[1].env,
            vec![("DESTDIR".to_string(), "/chef/install".to_string())]
        );
    }

    #[test]
    fn test_script_step() {
        let dirs = dirs();
        let host = Target::host();
        let script = Step {
            name: "gen".to_string(),
            step_type: StepType::Script,
            script: Some("echo hi".to_string()),
            ..Default::default()
        };
        let invocations = plan(&script, &ctx(&dirs, &host)).unwrap();
        assert_eq!(invocations[0].program, "/bin/sh");
        assert_eq!(invocations[0].args, vec!["-e", "-c", "echo hi"]);
        assert_eq!(invocations[0].cwd, dirs.source);
    }

    #[test]
    fn test_unknown_system_fails() {
        let dirs = dirs();
        let host = Target::host();
        assert!(plan(&step(StepType::Build, "scons"), &ctx(&dirs, &host)).is_err());
        assert!(plan(&step(StepType::Generate, "make"), &ctx(&dirs, &host)).is_err());
    }

    #[test]
    fn test_gnu_triplet() {
        assert_eq!(gnu_triplet("x86_64"), Some("x86_64-linux-gnu"));
        assert_eq!(gnu_triplet("armhf"), Some("arm-linux-gnueabihf"));
        assert_eq!(gnu_triplet("sparc"), None);
    }
}
