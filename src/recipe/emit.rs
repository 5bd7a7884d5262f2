// src/recipe/emit.rs

//! Serialize a recipe back to YAML
//!
//! Output uses the same keys the parser accepts, so a parsed recipe emitted
//! and parsed again compares equal. Optional fields that are unset are
//! omitted.

use crate::error::{Error, Result};
use crate::recipe::model::{Ingredient, Pack, Part, Recipe, Source, Step};
use serde_yaml::{Mapping, Value};

/// Render a recipe as a YAML document
pub fn emit(recipe: &Recipe) -> Result<String> {
    let mut root = Mapping::new();
    root.insert(key("project"), project(recipe));
    if !recipe.platforms.is_empty() {
        let platforms = recipe
            .platforms
            .iter()
            .map(|p| {
                let mut m = Mapping::new();
                m.insert(key("name"), text(&p.name));
                if let Some(toolchain) = &p.toolchain {
                    m.insert(key("toolchain"), text(&toolchain.to_string()));
                }
                m.insert(key("architectures"), list(&p.architectures));
                Value::Mapping(m)
            })
            .collect();
        root.insert(key("platforms"), Value::Sequence(platforms));
    }
    root.insert(key("environment"), environment(recipe));
    if !recipe.parts.is_empty() {
        root.insert(
            key("recipes"),
            Value::Sequence(recipe.parts.iter().map(part).collect()),
        );
    }
    if !recipe.packs.is_empty() {
        root.insert(
            key("packs"),
            Value::Sequence(recipe.packs.iter().map(pack).collect()),
        );
    }

    serde_yaml::to_string(&Value::Mapping(root))
        .map_err(|e| Error::IoError(format!("failed to serialize recipe: {e}")))
}

fn key(name: &str) -> Value {
    Value::String(name.to_string())
}

fn text(value: &str) -> Value {
    Value::String(value.to_string())
}

fn list(values: &[String]) -> Value {
    Value::Sequence(values.iter().map(|v| text(v)).collect())
}

fn insert_opt(map: &mut Mapping, name: &str, value: &Option<String>) {
    if let Some(value) = value {
        map.insert(key(name), text(value));
    }
}

fn insert_list(map: &mut Mapping, name: &str, values: &[String]) {
    if !values.is_empty() {
        map.insert(key(name), list(values));
    }
}

fn project(recipe: &Recipe) -> Value {
    let p = &recipe.project;
    let mut m = Mapping::new();
    m.insert(key("name"), text(&p.name));
    m.insert(key("summary"), text(&p.summary));
    insert_opt(&mut m, "description", &p.description);
    insert_opt(&mut m, "icon", &p.icon);
    m.insert(key("version"), text(&p.version));
    insert_opt(&mut m, "license", &p.license);
    insert_opt(&mut m, "eula", &p.eula);
    m.insert(key("author"), text(&p.author));
    m.insert(key("email"), text(&p.email));
    insert_opt(&mut m, "url", &p.url);
    Value::Mapping(m)
}

fn ingredients(items: &[Ingredient]) -> Value {
    Value::Sequence(
        items
            .iter()
            .map(|i| {
                let mut m = Mapping::new();
                m.insert(key("name"), text(&i.name));
                m.insert(key("channel"), text(&i.channel));
                insert_opt(&mut m, "version", &i.version);
                insert_list(&mut m, "include-filters", &i.include_filters);
                Value::Mapping(m)
            })
            .collect(),
    )
}

fn environment(recipe: &Recipe) -> Value {
    let env = &recipe.environment;
    let mut m = Mapping::new();

    let mut hooks = Mapping::new();
    insert_opt(&mut hooks, "bash", &env.hooks.bash);
    insert_opt(&mut hooks, "powershell", &env.hooks.powershell);
    if !hooks.is_empty() {
        m.insert(key("hooks"), Value::Mapping(hooks));
    }

    let mut host = Mapping::new();
    host.insert(key("base"), Value::Bool(env.host.base));
    if !env.host.ingredients.is_empty() {
        host.insert(key("ingredients"), ingredients(&env.host.ingredients));
    }
    insert_list(&mut host, "packages", &env.host.packages);
    m.insert(key("host"), Value::Mapping(host));

    let mut build = Mapping::new();
    build.insert(key("confinement"), Value::Bool(env.build.confinement));
    if !env.build.ingredients.is_empty() {
        build.insert(key("ingredients"), ingredients(&env.build.ingredients));
    }
    m.insert(key("build"), Value::Mapping(build));

    if !env.runtime.ingredients.is_empty() {
        let mut runtime = Mapping::new();
        runtime.insert(key("ingredients"), ingredients(&env.runtime.ingredients));
        m.insert(key("runtime"), Value::Mapping(runtime));
    }

    Value::Mapping(m)
}

fn part(part: &Part) -> Value {
    let mut m = Mapping::new();
    m.insert(key("name"), text(&part.name));
    insert_opt(&mut m, "toolchain", &part.toolchain);

    let mut source = Mapping::new();
    source.insert(key("type"), text(part.source.type_name()));
    match &part.source {
        Source::Path(path) => {
            source.insert(key("path"), text(path));
        }
        Source::Url(url) => {
            source.insert(key("url"), text(url));
        }
        Source::Git {
            url,
            branch,
            commit,
        } => {
            source.insert(key("git-url"), text(url));
            insert_opt(&mut source, "git-branch", branch);
            insert_opt(&mut source, "git-commit", commit);
        }
        Source::Script(script) => {
            source.insert(key("script"), text(script));
        }
    }
    m.insert(key("source"), Value::Mapping(source));

    if !part.steps.is_empty() {
        m.insert(
            key("steps"),
            Value::Sequence(part.steps.iter().map(step).collect()),
        );
    }
    Value::Mapping(m)
}

fn step(step: &Step) -> Value {
    let mut m = Mapping::new();
    m.insert(key("name"), text(&step.name));
    m.insert(key("type"), text(step.step_type.as_str()));
    insert_opt(&mut m, "system", &step.system);
    insert_opt(&mut m, "script", &step.script);
    insert_list(&mut m, "depends", &step.depends);
    insert_list(&mut m, "arguments", &step.arguments);

    if !step.env.is_empty() {
        let mut env = Mapping::new();
        for (name, value) in &step.env {
            env.insert(key(name), text(value));
        }
        m.insert(key("env"), Value::Mapping(env));
    }

    let meson = &step.options.meson;
    if meson.cross_file.is_some() || !meson.wraps.is_empty() {
        let mut mm = Mapping::new();
        insert_opt(&mut mm, "cross-file", &meson.cross_file);
        if !meson.wraps.is_empty() {
            let wraps = meson
                .wraps
                .iter()
                .map(|w| {
                    let mut wm = Mapping::new();
                    wm.insert(key("name"), text(&w.name));
                    wm.insert(key("ingredient"), text(&w.ingredient));
                    Value::Mapping(wm)
                })
                .collect();
            mm.insert(key("wraps"), Value::Sequence(wraps));
        }
        m.insert(key("meson"), Value::Mapping(mm));
    }

    let mut make = Mapping::new();
    make.insert(key("in-tree"), Value::Bool(step.options.make.in_tree));
    make.insert(key("parallel"), Value::Bool(step.options.make.parallel));
    m.insert(key("make"), Value::Mapping(make));

    Value::Mapping(m)
}

fn pack(pack: &Pack) -> Value {
    let mut m = Mapping::new();
    m.insert(key("name"), text(&pack.name));
    m.insert(key("type"), text(pack.pack_type.as_str()));
    insert_list(&mut m, "filters", &pack.filters);

    if !pack.options.is_empty() {
        let o = &pack.options;
        let mut om = Mapping::new();
        insert_list(&mut om, "bin-dirs", &o.bin_dirs);
        insert_list(&mut om, "inc-dirs", &o.inc_dirs);
        insert_list(&mut om, "lib-dirs", &o.lib_dirs);
        insert_list(&mut om, "compiler-flags", &o.compiler_flags);
        insert_list(&mut om, "linker-flags", &o.linker_flags);
        m.insert(key("options"), Value::Mapping(om));
    }

    if !pack.commands.is_empty() {
        let commands = pack
            .commands
            .iter()
            .map(|c| {
                let mut cm = Mapping::new();
                cm.insert(key("name"), text(&c.name));
                cm.insert(key("path"), text(&c.path));
                cm.insert(key("type"), text(c.command_type.as_str()));
                insert_list(&mut cm, "arguments", &c.arguments);
                insert_opt(&mut cm, "description", &c.description);
                insert_opt(&mut cm, "icon", &c.icon);
                cm.insert(key("system-libs"), Value::Bool(c.system_libs));
                Value::Mapping(cm)
            })
            .collect();
        m.insert(key("commands"), Value::Sequence(commands));
    }

    Value::Mapping(m)
}
