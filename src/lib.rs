//! dubcore - build orchestration core for package-based D projects
//!
//! Plans per-target build settings over a resolved dependency graph, drives
//! compilation and linking with a content-keyed artifact cache, optionally
//! runs the produced executable, and rebuilds on source changes in watch
//! mode. Package resolution and recipe parsing happen upstream and hand this
//! core a read-only [`Project`].

pub mod cache;
pub mod compiler;
pub mod error;
pub mod generate;
pub mod project;
pub mod types;
pub mod watch;

pub use error::BuildError;
pub use generate::{
    create_generator, plan, BuildGenerator, BuildMode, GeneratorSettings, Plan, ProjectGenerator,
    TargetInfo,
};
pub use project::{Dependency, Package, PackageRecipe, Project};
pub use types::{BuildOptions, BuildPlatform, BuildSettings, TargetType};
