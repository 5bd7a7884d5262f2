// src/cli/mod.rs
//! CLI definitions for bake
//!
//! This module contains the command-line interface definitions using clap.
//! The command implementations are in the `commands` module.
//!
//! - `init` - write a recipe scaffold
//! - `fetch` - resolve ingredients, toolchains and sources
//! - `run` - build every part (the default when no command is given)
//! - `clean` - invalidate build state
//! - `pack` - emit packs from the install tree
//! - `remote` - build on a remote build service

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

mod remote;

pub use remote::RemoteCommands;

#[derive(Parser, Debug)]
#[command(name = "bake")]
#[command(author = "Bake Contributors")]
#[command(about = "Build packages from recipes in confined kitchens", long_about = None)]
#[command(version, disable_version_flag = true)]
pub struct Cli {
    /// Print version
    #[arg(short = 'v', long = "version", action = ArgAction::Version)]
    pub version: Option<bool>,

    /// Build for another target: [platform/]arch (also -cc)
    #[arg(long = "cross-compile", global = true, value_name = "[PLATFORM/]ARCH")]
    pub cross_compile: Option<String>,

    /// Recipe file (default: recipe.yaml, or the only .yaml file here)
    #[arg(short = 'r', long, global = true, value_name = "PATH")]
    pub recipe: Option<PathBuf>,

    /// Log debug output
    #[arg(long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write a recipe scaffold into the current directory
    Init {
        /// Project name (default: the directory name)
        name: Option<String>,

        /// Overwrite an existing recipe
        #[arg(long)]
        force: bool,
    },

    /// Resolve ingredients and toolchains, download sources
    Fetch,

    /// Build every part of the recipe
    Run {
        /// Run steps directly on the host
        #[arg(long)]
        unconfined: bool,

        /// Give the build network access
        #[arg(long)]
        network: bool,

        /// Emit packs after a successful build
        #[arg(long)]
        pack: bool,
    },

    /// Invalidate build state
    Clean {
        /// Part name, part/step, or a step name unique across parts
        target: Option<String>,

        /// Delete every kitchen
        #[arg(long)]
        purge: bool,
    },

    /// Emit the recipe's packs from the install tree
    Pack {
        /// Output directory (default: the kitchen output directory)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Do not sign the packs
        #[arg(long)]
        no_sign: bool,
    },

    /// Build on a remote build service
    Remote {
        #[command(subcommand)]
        command: RemoteCommands,
    },
}

/// Rewrite the short cross-compile spelling `-cc` into `--cross-compile`
///
/// clap has no multi-character short flags.
pub fn normalize_args<I>(args: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    args.into_iter()
        .map(|arg| {
            if arg == "-cc" {
                "--cross-compile".to_string()
            } else if let Some(value) = arg.strip_prefix("-cc=") {
                format!("--cross-compile={}", value)
            } else {
                arg
            }
        })
        .collect()
}
