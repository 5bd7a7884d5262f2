// src/recipe/parser.rs

//! Recipe parser
//!
//! A pushdown state machine over the YAML event stream. Each nesting level
//! pushes a frame carrying the context it represents and, for mappings, the
//! key currently awaiting a value. Entities under construction live in a
//! single staging struct; the closing `MappingEnd` of an entity runs its
//! finalizer, which moves the staged value into its owner and resets the
//! slot.
//!
//! Unknown keys inside a known mapping are rejected immediately so typos
//! (`sytem:`) never silently fall back to defaults.

use crate::error::{Error, Result};
use crate::recipe::events::{tokenize, Event, EventKind};
use crate::recipe::model::{
    CommandType, Ingredient, IngredientKind, MesonWrap, Pack, PackCommand, PackType, Part,
    Platform, Recipe, Source, Step, StepType,
};
use crate::recipe::validate::validate_recipe;
use std::fs;
use std::path::Path;
use tracing::debug;

/// Parse and validate a recipe
pub fn parse_recipe(buffer: &str) -> Result<Recipe> {
    let recipe = parse(buffer)?;
    validate_recipe(&recipe)?;
    Ok(recipe)
}

/// Parse and validate a recipe file
pub fn parse_recipe_file(path: &Path) -> Result<Recipe> {
    let content = fs::read_to_string(path)
        .map_err(|e| Error::IoError(format!("failed to read recipe {}: {}", path.display(), e)))?;
    parse_recipe(&content)
}

/// Parse a recipe without running validation
pub fn parse(buffer: &str) -> Result<Recipe> {
    let events = tokenize(buffer)?;
    let mut machine = Machine::default();
    for event in &events {
        machine.feed(event)?;
    }
    machine.finish()
}

/// Accepted spellings of true
const TRUE_WORDS: &[&str] = &["y", "Y", "yes", "Yes", "YES", "true", "True", "TRUE", "on", "On", "ON"];
/// Accepted spellings of false
const FALSE_WORDS: &[&str] = &["n", "N", "no", "No", "NO", "false", "False", "FALSE", "off", "Off", "OFF"];

/// Interpret a YAML scalar as a boolean using the extended word set
pub fn parse_bool(value: &str) -> Option<bool> {
    if TRUE_WORDS.contains(&value) {
        Some(true)
    } else if FALSE_WORDS.contains(&value) {
        Some(false)
    } else {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OptionList {
    BinDirs,
    IncDirs,
    LibDirs,
    CompilerFlags,
    LinkerFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Context {
    Root,
    Project,
    Platforms,
    Platform,
    PlatformArchitectures,
    Environment,
    Hooks,
    Host,
    HostPackages,
    Build,
    Runtime,
    Ingredients(IngredientKind),
    Ingredient(IngredientKind),
    IncludeFilters,
    Parts,
    Part,
    Source,
    Steps,
    Step,
    StepDepends,
    StepArguments,
    StepEnv,
    Meson,
    MesonWraps,
    MesonWrap,
    Make,
    Packs,
    Pack,
    PackFilters,
    PackOptions,
    PackOptionList(OptionList),
    Commands,
    Command,
    CommandArguments,
}

impl Context {
    fn name(&self) -> &'static str {
        match self {
            Context::Root => "recipe",
            Context::Project => "project",
            Context::Platforms | Context::Platform => "platforms",
            Context::PlatformArchitectures => "architectures",
            Context::Environment => "environment",
            Context::Hooks => "hooks",
            Context::Host => "host",
            Context::HostPackages => "packages",
            Context::Build => "build",
            Context::Runtime => "runtime",
            Context::Ingredients(_) | Context::Ingredient(_) => "ingredients",
            Context::IncludeFilters => "include-filters",
            Context::Parts | Context::Part => "recipes",
            Context::Source => "source",
            Context::Steps | Context::Step => "steps",
            Context::StepDepends => "depends",
            Context::StepArguments | Context::CommandArguments => "arguments",
            Context::StepEnv => "env",
            Context::Meson => "meson",
            Context::MesonWraps | Context::MesonWrap => "wraps",
            Context::Make => "make",
            Context::Packs | Context::Pack => "packs",
            Context::PackFilters => "filters",
            Context::PackOptions => "options",
            Context::PackOptionList(_) => "option-list",
            Context::Commands | Context::Command => "commands",
        }
    }

    fn is_sequence(&self) -> bool {
        matches!(
            self,
            Context::Platforms
                | Context::PlatformArchitectures
                | Context::HostPackages
                | Context::Ingredients(_)
                | Context::IncludeFilters
                | Context::Parts
                | Context::Steps
                | Context::StepDepends
                | Context::StepArguments
                | Context::MesonWraps
                | Context::Packs
                | Context::PackFilters
                | Context::PackOptionList(_)
                | Context::Commands
                | Context::CommandArguments
        )
    }
}

/// What a key in a mapping expects as its value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Node {
    Scalar,
    Mapping(Context),
    Sequence(Context),
}

fn key_node(ctx: Context, key: &str) -> Option<Node> {
    use Context as C;
    use Node::{Mapping, Scalar, Sequence};

    let node = match (ctx, key) {
        (C::Root, "project") => Mapping(C::Project),
        (C::Root, "platforms") => Sequence(C::Platforms),
        (C::Root, "environment") => Mapping(C::Environment),
        (C::Root, "recipes") => Sequence(C::Parts),
        (C::Root, "packs") => Sequence(C::Packs),

        (
            C::Project,
            "name" | "summary" | "description" | "icon" | "version" | "license" | "eula"
            | "author" | "email" | "url",
        ) => Scalar,

        (C::Platform, "name" | "toolchain") => Scalar,
        (C::Platform, "architectures") => Sequence(C::PlatformArchitectures),

        (C::Environment, "hooks") => Mapping(C::Hooks),
        (C::Environment, "host") => Mapping(C::Host),
        (C::Environment, "build") => Mapping(C::Build),
        (C::Environment, "runtime") => Mapping(C::Runtime),
        (C::Hooks, "bash" | "powershell") => Scalar,
        (C::Host, "base") => Scalar,
        (C::Host, "ingredients") => Sequence(C::Ingredients(IngredientKind::Host)),
        (C::Host, "packages") => Sequence(C::HostPackages),
        (C::Build, "confinement") => Scalar,
        (C::Build, "ingredients") => Sequence(C::Ingredients(IngredientKind::Build)),
        (C::Runtime, "ingredients") => Sequence(C::Ingredients(IngredientKind::Runtime)),
        (C::Ingredient(_), "name" | "channel" | "version") => Scalar,
        (C::Ingredient(_), "include-filters") => Sequence(C::IncludeFilters),

        (C::Part, "name" | "path" | "toolchain") => Scalar,
        (C::Part, "source") => Mapping(C::Source),
        (C::Part, "steps") => Sequence(C::Steps),
        (
            C::Source,
            "type" | "path" | "url" | "git-url" | "git-branch" | "git-commit" | "script",
        ) => Scalar,

        (C::Step, "name" | "type" | "system" | "script") => Scalar,
        (C::Step, "depends") => Sequence(C::StepDepends),
        (C::Step, "arguments") => Sequence(C::StepArguments),
        (C::Step, "env") => Mapping(C::StepEnv),
        (C::Step, "meson") => Mapping(C::Meson),
        (C::Step, "make") => Mapping(C::Make),
        (C::StepEnv, _) => Scalar,
        (C::Meson, "cross-file") => Scalar,
        (C::Meson, "wraps") => Sequence(C::MesonWraps),
        (C::MesonWrap, "name" | "ingredient") => Scalar,
        (C::Make, "in-tree" | "parallel") => Scalar,

        (C::Pack, "name" | "type") => Scalar,
        (C::Pack, "filters") => Sequence(C::PackFilters),
        (C::Pack, "options") => Mapping(C::PackOptions),
        (C::Pack, "commands") => Sequence(C::Commands),
        (C::PackOptions, "bin-dirs") => Sequence(C::PackOptionList(OptionList::BinDirs)),
        (C::PackOptions, "inc-dirs") => Sequence(C::PackOptionList(OptionList::IncDirs)),
        (C::PackOptions, "lib-dirs") => Sequence(C::PackOptionList(OptionList::LibDirs)),
        (C::PackOptions, "compiler-flags") => {
            Sequence(C::PackOptionList(OptionList::CompilerFlags))
        }
        (C::PackOptions, "linker-flags") => Sequence(C::PackOptionList(OptionList::LinkerFlags)),
        (C::Command, "name" | "path" | "type" | "description" | "icon" | "system-libs") => Scalar,
        (C::Command, "arguments") => Sequence(C::CommandArguments),

        _ => return None,
    };
    Some(node)
}

/// Element context for sequences whose items are mappings
fn element_mapping(ctx: Context) -> Option<Context> {
    match ctx {
        Context::Platforms => Some(Context::Platform),
        Context::Ingredients(kind) => Some(Context::Ingredient(kind)),
        Context::Parts => Some(Context::Part),
        Context::Steps => Some(Context::Step),
        Context::MesonWraps => Some(Context::MesonWrap),
        Context::Packs => Some(Context::Pack),
        Context::Commands => Some(Context::Command),
        _ => None,
    }
}

#[derive(Debug)]
struct Frame {
    context: Context,
    /// Key awaiting its value (mappings only)
    key: Option<String>,
}

#[derive(Debug, Default)]
struct SourceDraft {
    kind: Option<String>,
    path: Option<String>,
    url: Option<String>,
    git_url: Option<String>,
    git_branch: Option<String>,
    git_commit: Option<String>,
    script: Option<String>,
}

/// Entities currently under construction
#[derive(Debug, Default)]
struct Staging {
    platform: Platform,
    ingredient: Ingredient,
    part: Part,
    part_path: Option<String>,
    part_has_source: bool,
    source: SourceDraft,
    step: Step,
    step_has_type: bool,
    wrap: MesonWrap,
    pack: Pack,
    pack_has_type: bool,
    command: PackCommand,
}

#[derive(Debug, Default)]
struct Machine {
    recipe: Recipe,
    stack: Vec<Frame>,
    staging: Staging,
    documents: usize,
    saw_root: bool,
    line: usize,
}

impl Machine {
    fn feed(&mut self, event: &Event) -> Result<()> {
        self.line = event.line;
        match &event.kind {
            EventKind::StreamStart | EventKind::StreamEnd | EventKind::DocumentEnd => Ok(()),
            EventKind::DocumentStart => {
                self.documents += 1;
                if self.documents > 1 {
                    return Err(self.error("a recipe must be a single YAML document"));
                }
                Ok(())
            }
            EventKind::MappingStart => self.open(true),
            EventKind::SequenceStart => self.open(false),
            EventKind::MappingEnd | EventKind::SequenceEnd => self.close(),
            EventKind::Scalar(value) => self.scalar(value),
        }
    }

    fn finish(self) -> Result<Recipe> {
        if !self.saw_root {
            return Err(Error::parse(self.line, "recipe", "document is empty"));
        }
        Ok(self.recipe)
    }

    fn context_path(&self) -> String {
        if self.stack.is_empty() {
            return "recipe".to_string();
        }
        let mut names: Vec<&str> = Vec::new();
        for frame in &self.stack {
            let name = frame.context.name();
            if names.last() != Some(&name) {
                names.push(name);
            }
        }
        names.join(".")
    }

    fn error(&self, message: impl Into<String>) -> Error {
        Error::parse(self.line, self.context_path(), message)
    }

    fn open(&mut self, is_mapping: bool) -> Result<()> {
        let child = match self.stack.last() {
            None => {
                if !is_mapping {
                    return Err(self.error("recipe root must be a mapping"));
                }
                self.saw_root = true;
                Context::Root
            }
            Some(frame) if frame.context.is_sequence() => {
                match (is_mapping, element_mapping(frame.context)) {
                    (true, Some(element)) => element,
                    _ => {
                        return Err(self.error(format!(
                            "unexpected {} in {} list",
                            if is_mapping { "mapping" } else { "sequence" },
                            frame.context.name()
                        )));
                    }
                }
            }
            Some(frame) => {
                let key = frame
                    .key
                    .clone()
                    .ok_or_else(|| self.error("mapping keys must be scalars"))?;
                match (key_node(frame.context, &key), is_mapping) {
                    (Some(Node::Mapping(ctx)), true) => ctx,
                    (Some(Node::Sequence(ctx)), false) => ctx,
                    (Some(Node::Scalar), _) => {
                        return Err(self.error(format!("'{key}' expects a scalar value")));
                    }
                    (Some(Node::Mapping(_)), false) => {
                        return Err(self.error(format!("'{key}' expects a mapping")));
                    }
                    (Some(Node::Sequence(_)), true) => {
                        return Err(self.error(format!("'{key}' expects a list")));
                    }
                    (None, _) => return Err(self.error(format!("unknown key '{key}'"))),
                }
            }
        };

        self.begin(child);
        self.stack.push(Frame {
            context: child,
            key: None,
        });
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let frame = self
            .stack
            .pop()
            .ok_or_else(|| self.error("unbalanced end of node"))?;
        if frame.key.is_some() {
            return Err(self.error("mapping key without a value"));
        }
        self.finalize(frame.context)?;
        if let Some(parent) = self.stack.last_mut() {
            parent.key = None;
        }
        Ok(())
    }

    fn scalar(&mut self, value: &str) -> Result<()> {
        let (context, pending) = match self.stack.last() {
            Some(frame) => (frame.context, frame.key.clone()),
            None => return Err(self.error("recipe root must be a mapping")),
        };

        if context.is_sequence() {
            return self.push_item(context, value);
        }

        match pending {
            None => {
                if key_node(context, value).is_none() {
                    return Err(self.error(format!("unknown key '{value}'")));
                }
                if let Some(frame) = self.stack.last_mut() {
                    frame.key = Some(value.to_string());
                }
                Ok(())
            }
            Some(key) => {
                if key_node(context, &key) != Some(Node::Scalar) {
                    return Err(self.error(format!("'{key}' does not take a scalar value")));
                }
                self.assign(context, &key, value)?;
                if let Some(frame) = self.stack.last_mut() {
                    frame.key = None;
                }
                Ok(())
            }
        }
    }

    /// Reset the staging slot for an entity that is about to be built
    fn begin(&mut self, ctx: Context) {
        let staging = &mut self.staging;
        match ctx {
            Context::Platform => staging.platform = Platform::default(),
            Context::Ingredient(kind) => {
                staging.ingredient = Ingredient {
                    kind,
                    ..Ingredient::default()
                }
            }
            Context::Part => {
                staging.part = Part::default();
                staging.part_path = None;
                staging.part_has_source = false;
            }
            Context::Source => staging.source = SourceDraft::default(),
            Context::Step => {
                staging.step = Step::default();
                staging.step_has_type = false;
            }
            Context::MesonWrap => staging.wrap = MesonWrap::default(),
            Context::Pack => {
                staging.pack = Pack::default();
                staging.pack_has_type = false;
            }
            Context::Command => staging.command = PackCommand::default(),
            _ => {}
        }
    }

    fn bool_value(&self, key: &str, value: &str) -> Result<bool> {
        parse_bool(value)
            .ok_or_else(|| self.error(format!("'{key}' expects a boolean, got '{value}'")))
    }

    fn assign(&mut self, ctx: Context, key: &str, value: &str) -> Result<()> {
        let text = value.to_string();
        let optional = if value.is_empty() { None } else { Some(text.clone()) };

        match ctx {
            Context::Project => {
                let project = &mut self.recipe.project;
                match key {
                    "name" => project.name = text,
                    "summary" => project.summary = text,
                    "description" => project.description = optional,
                    "icon" => project.icon = optional,
                    "version" => project.version = text,
                    "license" => project.license = optional,
                    "eula" => project.eula = optional,
                    "author" => project.author = text,
                    "email" => project.email = text,
                    "url" => project.url = optional,
                    _ => unreachable!("key table and assignment out of sync"),
                }
            }
            Context::Platform => match key {
                "name" => self.staging.platform.name = text,
                "toolchain" => {
                    self.staging.platform.toolchain = match optional {
                        Some(reference) => Some(reference.parse().map_err(|e: String| self.error(e))?),
                        None => None,
                    }
                }
                _ => unreachable!("key table and assignment out of sync"),
            },
            Context::Hooks => match key {
                "bash" => self.recipe.environment.hooks.bash = optional,
                "powershell" => self.recipe.environment.hooks.powershell = optional,
                _ => unreachable!("key table and assignment out of sync"),
            },
            Context::Host => self.recipe.environment.host.base = self.bool_value(key, value)?,
            Context::Build => {
                self.recipe.environment.build.confinement = self.bool_value(key, value)?
            }
            Context::Ingredient(_) => match key {
                "name" => self.staging.ingredient.name = text,
                "channel" => self.staging.ingredient.channel = text,
                "version" => self.staging.ingredient.version = optional,
                _ => unreachable!("key table and assignment out of sync"),
            },
            Context::Part => match key {
                "name" => self.staging.part.name = text,
                "path" => self.staging.part_path = optional,
                "toolchain" => self.staging.part.toolchain = optional,
                _ => unreachable!("key table and assignment out of sync"),
            },
            Context::Source => {
                let source = &mut self.staging.source;
                match key {
                    "type" => {
                        if !matches!(value, "path" | "url" | "git" | "script") {
                            return Err(self.error(format!("invalid source type '{value}'")));
                        }
                        source.kind = optional;
                    }
                    "path" => source.path = optional,
                    "url" => source.url = optional,
                    "git-url" => source.git_url = optional,
                    "git-branch" => source.git_branch = optional,
                    "git-commit" => source.git_commit = optional,
                    "script" => source.script = optional,
                    _ => unreachable!("key table and assignment out of sync"),
                }
            }
            Context::Step => match key {
                "name" => self.staging.step.name = text,
                "type" => {
                    self.staging.step.step_type =
                        value.parse::<StepType>().map_err(|e| self.error(e))?;
                    self.staging.step_has_type = true;
                }
                "system" => self.staging.step.system = optional,
                "script" => self.staging.step.script = optional,
                _ => unreachable!("key table and assignment out of sync"),
            },
            Context::StepEnv => self.staging.step.env.push((key.to_string(), text)),
            Context::Meson => self.staging.step.options.meson.cross_file = optional,
            Context::MesonWrap => match key {
                "name" => self.staging.wrap.name = text,
                "ingredient" => self.staging.wrap.ingredient = text,
                _ => unreachable!("key table and assignment out of sync"),
            },
            Context::Make => {
                let flag = self.bool_value(key, value)?;
                let make = &mut self.staging.step.options.make;
                match key {
                    "in-tree" => make.in_tree = flag,
                    "parallel" => make.parallel = flag,
                    _ => unreachable!("key table and assignment out of sync"),
                }
            }
            Context::Pack => match key {
                "name" => self.staging.pack.name = text,
                "type" => {
                    self.staging.pack.pack_type =
                        value.parse::<PackType>().map_err(|e| self.error(e))?;
                    self.staging.pack_has_type = true;
                }
                _ => unreachable!("key table and assignment out of sync"),
            },
            Context::Command => match key {
                "name" => self.staging.command.name = text,
                "path" => self.staging.command.path = text,
                "type" => {
                    self.staging.command.command_type =
                        value.parse::<CommandType>().map_err(|e| self.error(e))?
                }
                "description" => self.staging.command.description = optional,
                "icon" => self.staging.command.icon = optional,
                "system-libs" => self.staging.command.system_libs = self.bool_value(key, value)?,
                _ => unreachable!("key table and assignment out of sync"),
            },
            other => {
                return Err(self.error(format!("unexpected scalar in {}", other.name())));
            }
        }
        Ok(())
    }

    fn push_item(&mut self, ctx: Context, value: &str) -> Result<()> {
        let item = value.to_string();
        match ctx {
            Context::PlatformArchitectures => self.staging.platform.architectures.push(item),
            Context::HostPackages => self.recipe.environment.host.packages.push(item),
            Context::IncludeFilters => self.staging.ingredient.include_filters.push(item),
            Context::StepDepends => self.staging.step.depends.push(item),
            Context::StepArguments => self.staging.step.arguments.push(item),
            Context::PackFilters => self.staging.pack.filters.push(item),
            Context::CommandArguments => self.staging.command.arguments.push(item),
            Context::PackOptionList(list) => {
                let options = &mut self.staging.pack.options;
                match list {
                    OptionList::BinDirs => options.bin_dirs.push(item),
                    OptionList::IncDirs => options.inc_dirs.push(item),
                    OptionList::LibDirs => options.lib_dirs.push(item),
                    OptionList::CompilerFlags => options.compiler_flags.push(item),
                    OptionList::LinkerFlags => options.linker_flags.push(item),
                }
            }
            other => {
                return Err(self.error(format!(
                    "{} entries must be mappings, got '{value}'",
                    other.name()
                )));
            }
        }
        Ok(())
    }

    fn require(&self, present: bool, field: &str) -> Result<()> {
        if present {
            Ok(())
        } else {
            Err(self.error(format!("missing required field '{field}'")))
        }
    }

    /// Move a completed entity into its owner and reset the staging slot
    fn finalize(&mut self, ctx: Context) -> Result<()> {
        match ctx {
            Context::Platform => {
                self.require(!self.staging.platform.name.is_empty(), "name")?;
                let platform = std::mem::take(&mut self.staging.platform);
                self.recipe.platforms.push(platform);
            }
            Context::Ingredient(kind) => {
                self.require(!self.staging.ingredient.name.is_empty(), "name")?;
                self.require(!self.staging.ingredient.channel.is_empty(), "channel")?;
                let ingredient = std::mem::take(&mut self.staging.ingredient);
                let environment = &mut self.recipe.environment;
                match kind {
                    IngredientKind::Host => environment.host.ingredients.push(ingredient),
                    IngredientKind::Build => environment.build.ingredients.push(ingredient),
                    IngredientKind::Runtime => environment.runtime.ingredients.push(ingredient),
                }
            }
            Context::Source => {
                let draft = std::mem::take(&mut self.staging.source);
                self.staging.part.source = self.build_source(draft)?;
                self.staging.part_has_source = true;
            }
            Context::Step => {
                self.require(!self.staging.step.name.is_empty(), "name")?;
                self.require(self.staging.step_has_type, "type")?;
                let step = std::mem::take(&mut self.staging.step);
                self.staging.part.steps.push(step);
            }
            Context::MesonWrap => {
                self.require(!self.staging.wrap.name.is_empty(), "name")?;
                self.require(!self.staging.wrap.ingredient.is_empty(), "ingredient")?;
                let wrap = std::mem::take(&mut self.staging.wrap);
                self.staging.step.options.meson.wraps.push(wrap);
            }
            Context::Part => {
                self.require(!self.staging.part.name.is_empty(), "name")?;
                if let Some(path) = self.staging.part_path.take() {
                    if self.staging.part_has_source {
                        return Err(self.error("'path' and 'source' are mutually exclusive"));
                    }
                    self.staging.part.source = Source::Path(path);
                }
                let part = std::mem::take(&mut self.staging.part);
                debug!("Parsed part '{}' with {} steps", part.name, part.steps.len());
                self.recipe.parts.push(part);
            }
            Context::Command => {
                self.require(!self.staging.command.name.is_empty(), "name")?;
                self.require(!self.staging.command.path.is_empty(), "path")?;
                let command = std::mem::take(&mut self.staging.command);
                self.staging.pack.commands.push(command);
            }
            Context::Pack => {
                self.require(!self.staging.pack.name.is_empty(), "name")?;
                self.require(self.staging.pack_has_type, "type")?;
                let pack = std::mem::take(&mut self.staging.pack);
                self.recipe.packs.push(pack);
            }
            _ => {}
        }
        Ok(())
    }

    fn build_source(&self, draft: SourceDraft) -> Result<Source> {
        let kind = match draft.kind.as_deref() {
            Some(kind) => kind,
            None if draft.git_url.is_some() => "git",
            None if draft.url.is_some() => "url",
            None if draft.script.is_some() => "script",
            None => "path",
        };
        let source = match kind {
            "path" => Source::Path(draft.path.unwrap_or_else(|| ".".to_string())),
            "url" => Source::Url(
                draft
                    .url
                    .ok_or_else(|| self.error("url source requires 'url'"))?,
            ),
            "git" => Source::Git {
                url: draft
                    .git_url
                    .or(draft.url)
                    .ok_or_else(|| self.error("git source requires 'git-url'"))?,
                branch: draft.git_branch,
                commit: draft.git_commit,
            },
            _ => Source::Script(
                draft
                    .script
                    .ok_or_else(|| self.error("script source requires 'script'"))?,
            ),
        };
        Ok(source)
    }
}
