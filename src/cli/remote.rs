// src/cli/remote.rs
//! Remote build commands

use clap::Subcommand;
use std::path::PathBuf;

#[derive(Subcommand, Debug)]
pub enum RemoteCommands {
    /// Set the remote build service URL
    Init {
        /// Base URL of the build service
        url: String,
    },

    /// Upload the project and build it remotely
    Build {
        /// Architectures to build (default: the target architecture)
        #[arg(long, value_delimiter = ',')]
        archs: Vec<String>,
    },

    /// Wait for previously dispatched jobs
    Resume {
        /// Job identifiers printed by `remote build`
        #[arg(required = true)]
        jobs: Vec<String>,
    },

    /// Download the artifacts of a finished job
    Download {
        job: String,

        /// Output directory (default: current directory)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List build agents
    List,

    /// Show a build agent
    Info {
        agent: String,
    },
}
