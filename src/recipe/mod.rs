// src/recipe/mod.rs

//! Recipe system for building packages from source
//!
//! A recipe describes a project, the platforms it targets, the ingredients
//! its build environment needs, the parts (each with its own source and
//! ordered steps) and the packs produced from the install tree.
//!
//! # Culinary Terminology
//!
//! - **Recipe**: the build specification
//! - **Part**: a unit of work with its own source and steps
//! - **Ingredient**: an external package consumed by the build
//! - **Kitchen**: the per-recipe build workspace
//! - **Pack**: an artifact produced from the install tree
//!
//! # Example Recipe
//!
//! ```yaml
//! project:
//!   name: hello
//!   summary: Greets people
//!   version: 1.0.0
//!   author: Jane
//!   email: jane@example.com
//! recipes:
//!   - name: hello
//!     steps:
//!       - name: greet
//!         type: script
//!         script: echo hi > /chef/install/greet
//! packs:
//!   - name: hello
//!     type: application
//! ```

pub mod emit;
pub mod events;
pub mod model;
pub mod parser;
pub mod validate;

pub use emit::emit;
pub use model::{
    CommandType, Environment, Hooks, Ingredient, IngredientKind, IngredientOptions,
    IngredientRef, MakeOptions, MesonOptions, MesonWrap, Pack, PackCommand, PackType, Part,
    Platform, Project, Recipe, Source, Step, StepType, SystemOptions, host_arch, host_platform,
    normalize_arch,
};
pub use parser::{parse, parse_recipe, parse_recipe_file};
pub use validate::{Target, parse_cross_compile, validate_recipe, validate_target};
