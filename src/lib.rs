// src/lib.rs

//! bake: confined package builds
//!
//! Builds software from declarative recipes inside isolated kitchens and
//! emits signed packs from the install tree.
//!
//! # Architecture
//!
//! - Recipes: YAML documents parsed into a strongly typed model
//! - Kitchens: one workspace per recipe under `~/.chef/kitchen`, with a
//!   build cache that makes every step incremental
//! - Layers: the build rootfs is composed from a base, ingredient packs and
//!   host directories
//! - Containers: steps run in a namespace container on Linux, an HCS
//!   compute system on Windows, or directly on the host when unconfined
//! - Policy: file, network and mount rules the payload is held to
//! - Packs: reproducible, optionally signed archives of the install tree

pub mod cache;
pub mod cli;
pub mod commands;
pub mod config;
pub mod container;
mod error;
pub mod hash;
pub mod ingredients;
pub mod kitchen;
pub mod layers;
pub mod packager;
pub mod policy;
pub mod progress;
pub mod recipe;
pub mod remote;
pub mod signal;
pub mod store;

pub use cache::BuildCache;
pub use config::BakeConfig;
pub use error::{Error, ErrorCategory, Result};
pub use hash::{Hash, HashAlgorithm};
pub use kitchen::{Kitchen, KitchenOptions};
pub use progress::{Pipeline, StepStatus};
pub use recipe::{Recipe, Target};
pub use signal::CancelToken;
pub use store::Store;
