// src/remote/protocol.rs

//! Messages exchanged with a remote build service
//!
//! Everything is JSON. Enum values travel in upper case (`BUILDING`,
//! `ARM64`) so agents written in other languages can match them directly.

use crate::recipe::normalize_arch;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildStatus {
    #[default]
    Unknown,
    Queued,
    Sourcing,
    Building,
    Packing,
    Done,
    Failed,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Unknown => "unknown",
            BuildStatus::Queued => "queued",
            BuildStatus::Sourcing => "sourcing",
            BuildStatus::Building => "building",
            BuildStatus::Packing => "packing",
            BuildStatus::Done => "done",
            BuildStatus::Failed => "failed",
        }
    }

    /// No further transitions happen after a terminal status
    pub fn is_terminal(&self) -> bool {
        matches!(self, BuildStatus::Done | BuildStatus::Failed)
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Architecture {
    X86,
    X64,
    Armhf,
    Arm64,
    Riscv64,
}

impl Architecture {
    /// Map a recipe architecture name, aliases included
    pub fn from_arch(arch: &str) -> Option<Self> {
        match normalize_arch(arch) {
            "i386" => Some(Architecture::X86),
            "amd64" => Some(Architecture::X64),
            "armhf" => Some(Architecture::Armhf),
            "arm64" => Some(Architecture::Arm64),
            "riscv64" => Some(Architecture::Riscv64),
            _ => None,
        }
    }

    /// Canonical recipe name of the architecture
    pub fn as_arch(&self) -> &'static str {
        match self {
            Architecture::X86 => "i386",
            Architecture::X64 => "amd64",
            Architecture::Armhf => "armhf",
            Architecture::Arm64 => "arm64",
            Architecture::Riscv64 => "riscv64",
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_arch())
    }
}

/// Reply to a bundle upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResponse {
    pub bundle_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRequest {
    pub bundle_id: String,
    /// Recipe path relative to the bundle root
    pub recipe: String,
    pub platform: String,
    pub arch: Architecture,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildResponse {
    pub job_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub job_id: String,
    #[serde(default)]
    pub status: BuildStatus,
    pub arch: Architecture,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactResponse {
    pub job_id: String,
    #[serde(default)]
    pub urls: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub name: String,
    #[serde(default)]
    pub online: bool,
    #[serde(default)]
    pub architectures: Vec<Architecture>,
    #[serde(default)]
    pub active_jobs: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}
