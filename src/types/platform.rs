use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Platform tuple a build is planned and compiled for. The tag vectors follow
/// the compiler's own predefined version identifiers, most specific first
/// (e.g. `["linux", "posix"]`, `["osx", "posix"]`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildPlatform {
    pub platform: Vec<String>,
    pub architecture: Vec<String>,
    /// Canonical compiler id, e.g. "dmd".
    pub compiler: String,
    pub compiler_binary: PathBuf,
    /// Frontend version as a single number, e.g. 2108 for v2.108.
    pub frontend_version: u32,
}

impl BuildPlatform {
    pub fn host(compiler: &str, compiler_binary: PathBuf, frontend_version: u32) -> Self {
        let platform = if cfg!(target_os = "windows") {
            vec!["windows".to_string()]
        } else if cfg!(target_os = "macos") {
            vec!["osx".to_string(), "posix".to_string()]
        } else {
            vec!["linux".to_string(), "posix".to_string()]
        };
        let architecture = vec![std::env::consts::ARCH.to_string()];
        Self {
            platform,
            architecture,
            compiler: compiler.to_string(),
            compiler_binary,
            frontend_version,
        }
    }

    pub fn is_windows(&self) -> bool {
        self.platform.iter().any(|p| p == "windows")
    }

    pub fn is_macos(&self) -> bool {
        self.platform.iter().any(|p| p == "osx")
    }

    /// Most specific platform tag, used in build-ID strings.
    pub fn platform_tag(&self) -> &str {
        self.platform.first().map(String::as_str).unwrap_or("unknown")
    }

    pub fn arch_tag(&self) -> &str {
        self.architecture
            .first()
            .map(String::as_str)
            .unwrap_or("unknown")
    }

    /// Object file suffix for this platform.
    pub fn obj_suffix(&self) -> &'static str {
        if self.is_windows() {
            ".obj"
        } else {
            ".o"
        }
    }
}
