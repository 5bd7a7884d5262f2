// src/recipe/validate.rs

//! Structural validation and target selection

use crate::error::{Error, Result};
use crate::recipe::model::{
    host_arch, host_platform, normalize_arch, PackType, Part, Recipe, Source, StepType,
};
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

/// Generators accepted by GENERATE steps
pub const GENERATE_SYSTEMS: &[&str] = &["configure", "cmake", "meson"];
/// Build systems accepted by BUILD steps
pub const BUILD_SYSTEMS: &[&str] = &["make", "ninja", "meson", "cmake"];

static NAME_PATTERN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Za-z_-]+$").unwrap());

/// Whether a name satisfies the recipe name charset `[A-Za-z_-]+`
pub fn is_valid_name(name: &str) -> bool {
    NAME_PATTERN.is_match(name)
}

/// The resolved build target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub platform: String,
    /// Canonical architecture name (see `normalize_arch`)
    pub arch: String,
}

impl Target {
    pub fn host() -> Self {
        Self {
            platform: host_platform().to_string(),
            arch: host_arch().to_string(),
        }
    }

    pub fn is_cross(&self) -> bool {
        self.platform != host_platform() || self.arch != host_arch()
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.platform, self.arch)
    }
}

/// Parse a `--cross-compile` value: `[platform/]arch`
pub fn parse_cross_compile(value: &str) -> Result<(Option<String>, String)> {
    let (platform, arch) = match value.split_once('/') {
        Some((platform, arch)) => (Some(platform.to_string()), arch),
        None => (None, value),
    };
    if arch.is_empty() || platform.as_deref() == Some("") {
        return Err(Error::Usage(format!(
            "--cross-compile expects [platform/]arch, got '{value}'"
        )));
    }
    Ok((platform, arch.to_string()))
}

/// Select the build target
///
/// Unspecified values default to the host. When the recipe declares
/// platforms, the chosen platform must be among them and the architecture
/// must be in that platform's architecture set.
pub fn validate_target(
    recipe: &Recipe,
    platform: Option<&str>,
    arch: Option<&str>,
) -> Result<Target> {
    let platform = platform.unwrap_or(host_platform());
    let arch = normalize_arch(arch.unwrap_or(host_arch()));

    if !recipe.platforms.is_empty() {
        let declared = recipe.find_platform(platform).ok_or_else(|| Error::UnsupportedTarget {
            platform: platform.to_string(),
            arch: arch.to_string(),
            reason: "platform is not declared by the recipe".to_string(),
        })?;
        if !declared.supports_arch(arch) {
            return Err(Error::UnsupportedTarget {
                platform: platform.to_string(),
                arch: arch.to_string(),
                reason: format!(
                    "unsupported architecture (supported: {})",
                    declared.architectures.join(", ")
                ),
            });
        }
    }

    Ok(Target {
        platform: platform.to_string(),
        arch: arch.to_string(),
    })
}

/// Validate a parsed recipe
pub fn validate_recipe(recipe: &Recipe) -> Result<()> {
    validate_project(recipe)?;

    let mut platforms = HashSet::new();
    for platform in &recipe.platforms {
        if !platforms.insert(platform.name.as_str()) {
            return Err(Error::validation(
                format!("platform '{}'", platform.name),
                "declared more than once",
            ));
        }
    }

    for ingredient in recipe.ingredients() {
        if ingredient.publisher().is_none() {
            return Err(Error::validation(
                format!("ingredient '{}'", ingredient.name),
                "name must be publisher/name",
            ));
        }
    }

    let mut parts = HashSet::new();
    for part in &recipe.parts {
        if !is_valid_name(&part.name) {
            return Err(Error::validation(
                format!("part '{}'", part.name),
                "name must match [A-Za-z_-]+",
            ));
        }
        if !parts.insert(part.name.as_str()) {
            return Err(Error::validation(
                format!("part '{}'", part.name),
                "declared more than once",
            ));
        }
        if let Source::Url(url) = &part.source {
            let parsed = url::Url::parse(url).map_err(|e| {
                Error::validation(format!("part '{}'", part.name), format!("invalid url: {e}"))
            })?;
            if parsed.scheme() != "https" {
                return Err(Error::validation(
                    format!("part '{}'", part.name),
                    "url sources must use https",
                ));
            }
        }
        validate_steps(recipe, part)?;
    }

    for pack in &recipe.packs {
        if !pack.commands.is_empty() && pack.pack_type != PackType::Application {
            return Err(Error::validation(
                format!("pack '{}'", pack.name),
                "commands are only allowed on application packs",
            ));
        }
    }

    Ok(())
}

fn validate_project(recipe: &Recipe) -> Result<()> {
    let project = &recipe.project;
    let required = [
        ("name", &project.name),
        ("summary", &project.summary),
        ("version", &project.version),
        ("author", &project.author),
        ("email", &project.email),
    ];
    for (field, value) in required {
        if value.trim().is_empty() {
            return Err(Error::validation("project", format!("'{field}' is required")));
        }
    }
    if !is_valid_name(&project.name) {
        return Err(Error::validation(
            "project",
            format!("name '{}' must match [A-Za-z_-]+", project.name),
        ));
    }
    Ok(())
}

fn validate_steps(recipe: &Recipe, part: &Part) -> Result<()> {
    let mut names = HashSet::new();
    for step in &part.steps {
        let entity = format!("step '{}/{}'", part.name, step.name);
        if !is_valid_name(&step.name) {
            return Err(Error::validation(entity, "name must match [A-Za-z_-]+"));
        }
        if !names.insert(step.name.as_str()) {
            return Err(Error::validation(entity, "declared more than once"));
        }

        match (step.step_type, step.system.as_deref()) {
            (StepType::Script, _) => {
                if step.script.as_deref().unwrap_or("").trim().is_empty() {
                    return Err(Error::validation(entity, "script steps require 'script'"));
                }
            }
            (_, None) => {
                return Err(Error::validation(
                    entity,
                    format!("{} steps require 'system'", step.step_type.as_str()),
                ));
            }
            (StepType::Generate, Some(system)) if !GENERATE_SYSTEMS.contains(&system) => {
                return Err(Error::validation(entity, format!("unknown generator '{system}'")));
            }
            (StepType::Build, Some(system)) if !BUILD_SYSTEMS.contains(&system) => {
                return Err(Error::validation(
                    entity,
                    format!("unknown build system '{system}'"),
                ));
            }
            _ => {}
        }

        for wrap in &step.options.meson.wraps {
            if recipe.find_ingredient(&wrap.ingredient).is_none() {
                return Err(Error::validation(
                    entity,
                    format!(
                        "meson wrap '{}' references undeclared ingredient '{}'",
                        wrap.name, wrap.ingredient
                    ),
                ));
            }
        }
    }

    for step in &part.steps {
        for dependency in &step.depends {
            if dependency == &step.name || part.find_step(dependency).is_none() {
                return Err(Error::validation(
                    format!("step '{}/{}'", part.name, step.name),
                    format!("depends on unknown step '{dependency}'"),
                ));
            }
        }
    }

    if let Some(cycle_at) = find_cycle(part) {
        return Err(Error::validation(
            format!("part '{}'", part.name),
            format!("step dependencies form a cycle through '{cycle_at}'"),
        ));
    }

    Ok(())
}

/// Detect a dependency cycle among a part's steps
fn find_cycle(part: &Part) -> Option<String> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit<'a>(
        part: &'a Part,
        name: &'a str,
        marks: &mut HashMap<&'a str, Mark>,
    ) -> Option<String> {
        match marks.get(name) {
            Some(Mark::Done) => return None,
            Some(Mark::Visiting) => return Some(name.to_string()),
            None => {}
        }
        marks.insert(name, Mark::Visiting);
        if let Some(step) = part.find_step(name) {
            for dependency in &step.depends {
                if let Some(found) = visit(part, dependency, marks) {
                    return Some(found);
                }
            }
        }
        marks.insert(name, Mark::Done);
        None
    }

    let mut marks = HashMap::new();
    part.steps
        .iter()
        .find_map(|step| visit(part, &step.name, &mut marks))
}
