// src/layers/activation.rs

//! Activation scripts for extracted packs
//!
//! `chef/activate.sh` (or `activate.ps1` on Windows guests) prepends every
//! non-application pack's bin, include and lib directories to the search
//! paths and appends its compiler and linker flags. Paths in the script are
//! always guest paths.

use crate::error::Result;
use crate::layers::PackageInfo;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

/// How paths look inside the guest
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum GuestStyle {
    #[default]
    Posix,
    Windows,
}

impl GuestStyle {
    pub fn chef_root(&self) -> &'static str {
        match self {
            GuestStyle::Posix => "/chef",
            GuestStyle::Windows => "C:\\chef",
        }
    }

    /// Join rootfs-relative components under the guest root
    pub fn guest_path(&self, relative: &Path) -> String {
        let root = match self {
            GuestStyle::Posix => "",
            GuestStyle::Windows => "C:",
        };
        let sep = self.separator();
        let mut out = root.to_string();
        for component in relative.components() {
            if let std::path::Component::Normal(part) = component {
                out.push(sep);
                out.push_str(&part.to_string_lossy());
            }
        }
        out
    }

    fn separator(&self) -> char {
        match self {
            GuestStyle::Posix => '/',
            GuestStyle::Windows => '\\',
        }
    }

    pub fn script_name(&self) -> &'static str {
        match self {
            GuestStyle::Posix => "activate.sh",
            GuestStyle::Windows => "activate.ps1",
        }
    }
}

/// Package directories, resolved to guest paths
#[derive(Debug, Default, PartialEq, Eq)]
struct Activation {
    path: Vec<String>,
    include: Vec<String>,
    lib: Vec<String>,
    cflags: Vec<String>,
    ldflags: Vec<String>,
}

impl Activation {
    fn collect(packages: &[PackageInfo], style: GuestStyle) -> Self {
        let mut out = Activation::default();
        for pkg in packages.iter().filter(|p| !p.is_application()) {
            let base = pkg.install_dir();
            let resolve = |dir: &String| style.guest_path(&base.join(dir));
            let opts = &pkg.options;
            if opts.bin_dirs.is_empty() {
                out.path.push(style.guest_path(&base.join("bin")));
            }
            out.path.extend(opts.bin_dirs.iter().map(resolve));
            out.include.extend(opts.inc_dirs.iter().map(resolve));
            out.lib.extend(opts.lib_dirs.iter().map(resolve));
            out.cflags.extend(opts.compiler_flags.iter().cloned());
            out.ldflags.extend(opts.linker_flags.iter().cloned());
        }
        out
    }
}

fn render_posix(act: &Activation) -> String {
    let mut script = String::from("# Generated by bake; sourced before every build command\n");
    let mut prepend = |var: &str, dirs: &[String]| {
        if !dirs.is_empty() {
            let _ = writeln!(script, "export {var}=\"{}${{{var}:+:${var}}}\"", dirs.join(":"));
        }
    };
    prepend("PATH", &act.path);
    prepend("CPATH", &act.include);
    prepend("LIBRARY_PATH", &act.lib);
    prepend("LD_LIBRARY_PATH", &act.lib);
    if !act.cflags.is_empty() {
        let flags = act.cflags.join(" ");
        let _ = writeln!(script, "export CFLAGS=\"${{CFLAGS:+$CFLAGS }}{flags}\"");
        let _ = writeln!(script, "export CXXFLAGS=\"${{CXXFLAGS:+$CXXFLAGS }}{flags}\"");
    }
    if !act.ldflags.is_empty() {
        let _ = writeln!(
            script,
            "export LDFLAGS=\"${{LDFLAGS:+$LDFLAGS }}{}\"",
            act.ldflags.join(" ")
        );
    }
    script
}

fn render_powershell(act: &Activation) -> String {
    let mut script = String::from("# Generated by bake; dot-sourced before every build command\n");
    let mut prepend = |var: &str, dirs: &[String]| {
        if !dirs.is_empty() {
            let _ = writeln!(script, "$env:{var} = \"{};\" + $env:{var}", dirs.join(";"));
        }
    };
    prepend("PATH", &act.path);
    prepend("INCLUDE", &act.include);
    prepend("LIB", &act.lib);
    if !act.cflags.is_empty() {
        let _ = writeln!(script, "$env:CL = \"$env:CL {}\"", act.cflags.join(" "));
    }
    if !act.ldflags.is_empty() {
        let _ = writeln!(script, "$env:LINK = \"$env:LINK {}\"", act.ldflags.join(" "));
    }
    script
}

/// Script text activating `packages`
pub fn render(packages: &[PackageInfo], style: GuestStyle) -> String {
    let act = Activation::collect(packages, style);
    match style {
        GuestStyle::Posix => render_posix(&act),
        GuestStyle::Windows => render_powershell(&act),
    }
}

/// Write the activation script under `<root>/chef` and return its host path
pub fn write(root: &Path, packages: &[PackageInfo], style: GuestStyle) -> Result<PathBuf> {
    let dir = root.join("chef");
    fs::create_dir_all(&dir)?;
    let path = dir.join(style.script_name());
    fs::write(&path, render(packages, style))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::{IngredientOptions, PackType};
    use tempfile::TempDir;

    fn zlib() -> PackageInfo {
        PackageInfo {
            publisher: "acme".to_string(),
            name: "zlib".to_string(),
            version: "1.3".to_string(),
            pack_type: PackType::Ingredient,
            options: IngredientOptions {
                bin_dirs: vec!["bin".to_string()],
                inc_dirs: vec!["include".to_string()],
                lib_dirs: vec!["lib".to_string()],
                compiler_flags: vec!["-DZLIB".to_string()],
                linker_flags: vec!["-lz".to_string()],
            },
        }
    }

    fn app() -> PackageInfo {
        PackageInfo {
            publisher: "acme".to_string(),
            name: "editor".to_string(),
            version: "2.0".to_string(),
            pack_type: PackType::Application,
            options: IngredientOptions::default(),
        }
    }

    #[test]
    fn test_guest_paths() {
        let rel = Path::new("chef/pkgs/acme/zlib/1.3/bin");
        assert_eq!(GuestStyle::Posix.guest_path(rel), "/chef/pkgs/acme/zlib/1.3/bin");
        assert_eq!(
            GuestStyle::Windows.guest_path(rel),
            "C:\\chef\\pkgs\\acme\\zlib\\1.3\\bin"
        );
    }

    #[test]
    fn test_posix_script_skips_applications() {
        let script = render(&[zlib(), app()], GuestStyle::Posix);
        assert!(script.contains("export PATH=\"/chef/pkgs/acme/zlib/1.3/bin${PATH:+:$PATH}\""));
        assert!(script.contains("export CPATH=\"/chef/pkgs/acme/zlib/1.3/include"));
        assert!(script.contains("-DZLIB"));
        assert!(script.contains("-lz"));
        assert!(!script.contains("editor"));
    }

    #[test]
    fn test_powershell_uses_guest_drive() {
        let dir = TempDir::new().unwrap();
        let path = write(dir.path(), &[zlib()], GuestStyle::Windows).unwrap();
        assert!(path.ends_with("chef/activate.ps1"));
        let script = fs::read_to_string(path).unwrap();
        assert!(script.contains("$env:PATH = \"C:\\chef\\pkgs\\acme\\zlib\\1.3\\bin;\" + $env:PATH"));
        assert!(script.contains("$env:INCLUDE"));
    }

    #[test]
    fn test_empty_activation() {
        let script = render(&[], GuestStyle::Posix);
        assert_eq!(script.lines().count(), 1);
    }
}
