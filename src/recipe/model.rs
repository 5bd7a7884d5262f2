// src/recipe/model.rs

//! Typed recipe model
//!
//! A recipe is built once by the parser and treated as immutable afterwards.
//! Ordering is significant everywhere: parts, steps and packs are executed
//! and emitted in declaration order.

use std::fmt;
use std::str::FromStr;

/// Root aggregate produced by the parser
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Recipe {
    pub project: Project,
    pub platforms: Vec<Platform>,
    pub environment: Environment,
    pub parts: Vec<Part>,
    pub packs: Vec<Pack>,
}

impl Recipe {
    pub fn find_part(&self, name: &str) -> Option<&Part> {
        self.parts.iter().find(|p| p.name == name)
    }

    pub fn find_platform(&self, name: &str) -> Option<&Platform> {
        self.platforms.iter().find(|p| p.name == name)
    }

    /// All declared ingredients across host, build and runtime sets
    pub fn ingredients(&self) -> impl Iterator<Item = &Ingredient> {
        self.environment
            .host
            .ingredients
            .iter()
            .chain(self.environment.build.ingredients.iter())
            .chain(self.environment.runtime.ingredients.iter())
    }

    pub fn find_ingredient(&self, name: &str) -> Option<&Ingredient> {
        self.ingredients().find(|i| i.name == name)
    }

    /// Whether build steps run inside the confined container
    pub fn is_confined(&self) -> bool {
        self.environment.build.confinement
    }
}

/// Project metadata; every field except the optional ones is required
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Project {
    pub name: String,
    pub summary: String,
    pub description: Option<String>,
    pub icon: Option<String>,
    pub version: String,
    pub license: Option<String>,
    pub eula: Option<String>,
    pub author: String,
    pub email: String,
    pub url: Option<String>,
}

/// A build target platform and the architectures it supports
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Platform {
    pub name: String,
    pub toolchain: Option<IngredientRef>,
    pub architectures: Vec<String>,
}

impl Platform {
    pub fn supports_arch(&self, arch: &str) -> bool {
        self.architectures.is_empty()
            || self
                .architectures
                .iter()
                .any(|a| normalize_arch(a) == normalize_arch(arch))
    }
}

/// Reference to a versioned ingredient: `publisher/name@channel[/version]`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IngredientRef {
    pub publisher: String,
    pub name: String,
    pub channel: String,
    pub version: Option<String>,
}

impl IngredientRef {
    /// `publisher/name` form used as the ingredient's recipe name
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.publisher, self.name)
    }
}

impl fmt::Display for IngredientRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.publisher, self.name, self.channel)?;
        if let Some(version) = &self.version {
            write!(f, "/{version}")?;
        }
        Ok(())
    }
}

impl FromStr for IngredientRef {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (full_name, rest) = s
            .split_once('@')
            .ok_or_else(|| format!("toolchain '{s}' must be publisher/name@channel"))?;
        let (publisher, name) = split_publisher(full_name)
            .ok_or_else(|| format!("toolchain '{s}' must name a publisher"))?;
        let (channel, version) = match rest.split_once('/') {
            Some((channel, version)) => (channel, Some(version.to_string())),
            None => (rest, None),
        };
        if channel.is_empty() {
            return Err(format!("toolchain '{s}' has an empty channel"));
        }
        Ok(Self {
            publisher: publisher.to_string(),
            name: name.to_string(),
            channel: channel.to_string(),
            version: version.filter(|v| !v.is_empty()),
        })
    }
}

/// Split `publisher/name` into its parts
pub fn split_publisher(full_name: &str) -> Option<(&str, &str)> {
    let (publisher, name) = full_name.split_once('/')?;
    if publisher.is_empty() || name.is_empty() || name.contains('/') {
        return None;
    }
    Some((publisher, name))
}

/// Where an ingredient materialises
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum IngredientKind {
    /// Unpacked into the rootfs, visible to build tools
    Host,
    /// Unpacked into the per-build ingredients directory
    #[default]
    Build,
    /// Shipped alongside the produced packs
    Runtime,
}

impl IngredientKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngredientKind::Host => "host",
            IngredientKind::Build => "build",
            IngredientKind::Runtime => "runtime",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ingredient {
    /// `publisher/name`
    pub name: String,
    pub channel: String,
    /// None means latest in channel
    pub version: Option<String>,
    pub include_filters: Vec<String>,
    pub kind: IngredientKind,
}

impl Ingredient {
    pub fn publisher(&self) -> Option<&str> {
        split_publisher(&self.name).map(|(p, _)| p)
    }

    pub fn package(&self) -> Option<&str> {
        split_publisher(&self.name).map(|(_, n)| n)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Hooks {
    pub bash: Option<String>,
    pub powershell: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSection {
    /// Use a base rootfs for the container
    pub base: bool,
    pub ingredients: Vec<Ingredient>,
    /// Host distribution packages bootstrapped into the rootfs
    pub packages: Vec<String>,
}

impl Default for HostSection {
    fn default() -> Self {
        Self {
            base: true,
            ingredients: Vec::new(),
            packages: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildSection {
    pub confinement: bool,
    pub ingredients: Vec<Ingredient>,
}

impl Default for BuildSection {
    fn default() -> Self {
        Self {
            confinement: true,
            ingredients: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeSection {
    pub ingredients: Vec<Ingredient>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
    pub hooks: Hooks,
    pub host: HostSection,
    pub build: BuildSection,
    pub runtime: RuntimeSection,
}

/// Where a part's sources come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// Relative to the recipe directory
    Path(String),
    /// https URL of an archive
    Url(String),
    Git {
        url: String,
        branch: Option<String>,
        commit: Option<String>,
    },
    /// Inline script that produces the sources
    Script(String),
}

impl Default for Source {
    fn default() -> Self {
        Source::Path(".".to_string())
    }
}

impl Source {
    pub fn type_name(&self) -> &'static str {
        match self {
            Source::Path(_) => "path",
            Source::Url(_) => "url",
            Source::Git { .. } => "git",
            Source::Script(_) => "script",
        }
    }
}

/// A unit of work with its own sources and steps
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Part {
    pub name: String,
    pub source: Source,
    /// Ingredient reference, or `platform` for the target platform's toolchain
    pub toolchain: Option<String>,
    pub steps: Vec<Step>,
}

impl Part {
    pub fn find_step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum StepType {
    Generate,
    #[default]
    Build,
    Script,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::Generate => "generate",
            StepType::Build => "build",
            StepType::Script => "script",
        }
    }
}

impl FromStr for StepType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "generate" => Ok(StepType::Generate),
            "build" => Ok(StepType::Build),
            "script" => Ok(StepType::Script),
            _ => Err(format!("invalid step type: {s}")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MesonWrap {
    pub name: String,
    /// Name of a declared ingredient providing the subproject
    pub ingredient: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MesonOptions {
    pub cross_file: Option<String>,
    pub wraps: Vec<MesonWrap>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MakeOptions {
    pub in_tree: bool,
    pub parallel: bool,
}

impl Default for MakeOptions {
    fn default() -> Self {
        Self {
            in_tree: false,
            parallel: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SystemOptions {
    pub meson: MesonOptions,
    pub make: MakeOptions,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Step {
    pub name: String,
    pub step_type: StepType,
    /// Generator or build system; optional only for script steps
    pub system: Option<String>,
    /// Sibling step names; used for invalidation, not ordering
    pub depends: Vec<String>,
    pub arguments: Vec<String>,
    /// Declared environment, order preserved
    pub env: Vec<(String, String)>,
    pub options: SystemOptions,
    pub script: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum PackType {
    Bootloader,
    OsBase,
    #[default]
    Ingredient,
    Content,
    Application,
    Toolchain,
}

impl PackType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PackType::Bootloader => "bootloader",
            PackType::OsBase => "os",
            PackType::Ingredient => "ingredient",
            PackType::Content => "content",
            PackType::Application => "application",
            PackType::Toolchain => "toolchain",
        }
    }
}

impl FromStr for PackType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "bootloader" => Ok(PackType::Bootloader),
            "os" => Ok(PackType::OsBase),
            "ingredient" => Ok(PackType::Ingredient),
            "content" => Ok(PackType::Content),
            "application" => Ok(PackType::Application),
            "toolchain" => Ok(PackType::Toolchain),
            _ => Err(format!("invalid pack type: {s}")),
        }
    }
}

/// Metadata consumed by packages that depend on an ingredient pack
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct IngredientOptions {
    #[serde(default)]
    pub bin_dirs: Vec<String>,
    #[serde(default)]
    pub inc_dirs: Vec<String>,
    #[serde(default)]
    pub lib_dirs: Vec<String>,
    #[serde(default)]
    pub compiler_flags: Vec<String>,
    #[serde(default)]
    pub linker_flags: Vec<String>,
}

impl IngredientOptions {
    pub fn is_empty(&self) -> bool {
        self.bin_dirs.is_empty()
            && self.inc_dirs.is_empty()
            && self.lib_dirs.is_empty()
            && self.compiler_flags.is_empty()
            && self.linker_flags.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandType {
    #[default]
    Executable,
    Daemon,
}

impl CommandType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandType::Executable => "executable",
            CommandType::Daemon => "daemon",
        }
    }
}

impl FromStr for CommandType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "executable" => Ok(CommandType::Executable),
            "daemon" => Ok(CommandType::Daemon),
            _ => Err(format!("invalid command type: {s}")),
        }
    }
}

/// An entry point exported by an application pack
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PackCommand {
    pub name: String,
    pub path: String,
    #[serde(rename = "type")]
    pub command_type: CommandType,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub system_libs: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pack {
    pub name: String,
    pub pack_type: PackType,
    /// Glob-like include patterns over install-relative paths
    pub filters: Vec<String>,
    pub options: IngredientOptions,
    pub commands: Vec<PackCommand>,
}

/// Canonical architecture name
///
/// Accepts the common aliases so `x86_64`, `x64` and `amd64` compare equal.
pub fn normalize_arch(arch: &str) -> &str {
    match arch {
        "x86_64" | "x64" | "amd64" => "amd64",
        "aarch64" | "arm64" => "arm64",
        "i386" | "i686" | "x86" => "i386",
        "arm" | "armhf" | "armv7" => "armhf",
        "riscv64" | "rv64" => "riscv64",
        other => other,
    }
}

/// Architecture of the running host, in canonical form
pub fn host_arch() -> &'static str {
    normalize_arch(std::env::consts::ARCH)
}

/// Platform name of the running host
pub fn host_platform() -> &'static str {
    match std::env::consts::OS {
        "macos" => "macos",
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ingredient_ref_parse() {
        let r: IngredientRef = "vali/clang@stable/17.0.1".parse().unwrap();
        assert_eq!(r.publisher, "vali");
        assert_eq!(r.name, "clang");
        assert_eq!(r.channel, "stable");
        assert_eq!(r.version.as_deref(), Some("17.0.1"));
        assert_eq!(r.to_string(), "vali/clang@stable/17.0.1");

        let r: IngredientRef = "vali/gcc@devel".parse().unwrap();
        assert!(r.version.is_none());
        assert_eq!(r.full_name(), "vali/gcc");
    }

    #[test]
    fn test_ingredient_ref_rejects_malformed() {
        assert!("clang@stable".parse::<IngredientRef>().is_err());
        assert!("vali/clang".parse::<IngredientRef>().is_err());
        assert!("vali/clang@".parse::<IngredientRef>().is_err());
    }

    #[test]
    fn test_normalize_arch_aliases() {
        assert_eq!(normalize_arch("x86_64"), "amd64");
        assert_eq!(normalize_arch("aarch64"), "arm64");
        assert_eq!(normalize_arch("x86"), "i386");
        assert_eq!(normalize_arch("sparc"), "sparc");
    }

    #[test]
    fn test_platform_supports_arch() {
        let platform = Platform {
            name: "linux".into(),
            toolchain: None,
            architectures: vec!["amd64".into(), "arm64".into()],
        };
        assert!(platform.supports_arch("x86_64"));
        assert!(platform.supports_arch("arm64"));
        assert!(!platform.supports_arch("x86"));
    }

    #[test]
    fn test_pack_type_round_trip() {
        for t in [
            PackType::Bootloader,
            PackType::OsBase,
            PackType::Ingredient,
            PackType::Content,
            PackType::Application,
            PackType::Toolchain,
        ] {
            assert_eq!(t.as_str().parse::<PackType>().unwrap(), t);
        }
    }
}
