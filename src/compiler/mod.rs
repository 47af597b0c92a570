//! Abstract interface over a native compiler. The build executor talks to
//! compilers exclusively through [`Compiler`]; concrete drivers translate the
//! merged build settings into command lines.

pub mod dmd;

use crate::error::{BuildError, Result};
use crate::types::{BuildPlatform, BuildSettings};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub use dmd::DmdCompiler;

/// How an invocation is split across compile and link phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationStyle {
    /// One invocation compiles and links; linker flags fold into the
    /// command line.
    CommandLine,
    /// Compile now, link later; linker inputs stay structured.
    CommandLineSeparate,
    /// As `CommandLineSeparate`, with source files folded into the flag list
    /// as well.
    CommandLineSeparateSourceFiles,
}

/// Receives `(exit_status, combined stdout+stderr)` when the caller wants to
/// handle tool output itself instead of failing on non-zero exits.
pub type OutputCallback = Arc<dyn Fn(i32, &str) + Send + Sync>;

#[async_trait]
pub trait Compiler: Send + Sync {
    /// Canonical compiler id, e.g. "dmd".
    fn name(&self) -> &'static str;

    /// Normalize structured settings (versions, import paths, options) into
    /// raw flags for the given invocation style.
    fn prepare_build_settings(
        &self,
        settings: &mut BuildSettings,
        platform: &BuildPlatform,
        style: InvocationStyle,
    );

    /// Inject the output-path flags for the planned target type. `obj_path`
    /// overrides the artifact path for intermediate object compiles.
    fn set_target(
        &self,
        settings: &mut BuildSettings,
        platform: &BuildPlatform,
        obj_path: Option<&Path>,
    );

    /// Run one compile. Without a callback a non-zero exit is
    /// [`BuildError::CompileFailed`]; with one, the status and captured
    /// output are delivered and no error is raised.
    async fn invoke(
        &self,
        settings: &BuildSettings,
        platform: &BuildPlatform,
        output: Option<&OutputCallback>,
    ) -> Result<()>;

    /// Link pre-produced object files. Failure policy as for [`invoke`].
    ///
    /// [`invoke`]: Compiler::invoke
    async fn invoke_linker(
        &self,
        settings: &BuildSettings,
        platform: &BuildPlatform,
        objects: &[PathBuf],
        output: Option<&OutputCallback>,
    ) -> Result<()>;

    /// Reverse-fold known dflags back into the options bitmask so later
    /// stages can reason about them structurally.
    fn extract_build_options(&self, settings: &mut BuildSettings);
}

/// Resolve a concrete driver from a compiler id or binary name.
pub fn compiler_for_id(id: &str) -> Result<Arc<dyn Compiler>> {
    let base = Path::new(id)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(id);
    if base.contains("dmd") {
        Ok(Arc::new(DmdCompiler::new()))
    } else {
        Err(BuildError::UnknownCompiler { id: id.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_dmd_variants() {
        assert!(compiler_for_id("dmd").is_ok());
        assert!(compiler_for_id("/opt/dmd-2.108/bin/dmd").is_ok());
        assert!(compiler_for_id("gdc").is_err());
    }
}
