//! Project generators. The build generator is the concrete backend driven by
//! this core; IDE project emitters plug in behind the same dispatch but ship
//! separately.

pub mod build;
pub mod hooks;
pub mod planner;

use crate::compiler::{Compiler, OutputCallback};
use crate::error::{BuildError, Result};
use crate::project::Project;
use crate::types::BuildPlatform;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub use build::BuildGenerator;
pub use planner::{plan, Plan, TargetInfo};

/// How sources are grouped into compiler invocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BuildMode {
    /// Compile all sources to one object, then link (default).
    #[default]
    Separate,
    /// One invocation compiles and links everything.
    AllAtOnce,
    /// Compile every source to its own object, then link.
    SingleFile,
}

impl BuildMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildMode::Separate => "separate",
            BuildMode::AllAtOnce => "allAtOnce",
            BuildMode::SingleFile => "singleFile",
        }
    }
}

/// Everything a generator needs to know about one generation request.
#[derive(Clone)]
pub struct GeneratorSettings {
    pub platform: BuildPlatform,
    pub compiler: Arc<dyn Compiler>,
    pub config: String,
    pub build_type: String,
    pub build_mode: BuildMode,
    pub combined: bool,
    pub run: bool,
    pub force: bool,
    pub direct: bool,
    pub rdmd: bool,
    pub temp_build: bool,
    pub parallel_build: bool,
    pub watch: bool,
    pub run_args: Vec<String>,
    pub compile_callback: Option<OutputCallback>,
    pub link_callback: Option<OutputCallback>,
    pub run_callback: Option<OutputCallback>,
}

impl GeneratorSettings {
    pub fn new(platform: BuildPlatform, compiler: Arc<dyn Compiler>) -> Self {
        Self {
            platform,
            compiler,
            config: String::new(),
            build_type: "debug".to_string(),
            build_mode: BuildMode::default(),
            combined: false,
            run: false,
            force: false,
            direct: false,
            rdmd: false,
            temp_build: false,
            parallel_build: false,
            watch: false,
            run_args: Vec::new(),
            compile_callback: None,
            link_callback: None,
            run_callback: None,
        }
    }
}

#[async_trait]
pub trait ProjectGenerator: Send {
    /// Plan and generate for the project; returns the exit code to propagate
    /// (non-zero only for executed targets).
    async fn generate(&mut self, project: &Project, settings: &GeneratorSettings) -> Result<i32>;
}

/// Map a generator type name to a concrete generator.
pub fn create_generator(name: &str) -> Result<Box<dyn ProjectGenerator>> {
    match name {
        "build" => Ok(Box::new(BuildGenerator::new())),
        // IDE project emitters are separate backends, not part of this core.
        "visuald" | "sublimetext" | "cmake" => Err(BuildError::UnknownGenerator {
            name: name.to_string(),
        }),
        _ => Err(BuildError::UnknownGenerator {
            name: name.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_the_build_generator_is_compiled_in() {
        assert!(create_generator("build").is_ok());
        assert!(create_generator("visuald").is_err());
        assert!(create_generator("bogus").is_err());
    }
}
