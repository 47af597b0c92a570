use crate::error::{BuildError, Result};
use crate::types::platform::BuildPlatform;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Kind of artifact a target produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum TargetType {
    /// Resolved during planning: executable if a main source file is set,
    /// otherwise a library.
    #[default]
    Autodetect,
    /// No artifact; the package only contributes settings.
    None,
    Executable,
    /// Generic library, narrowed to static or source during planning.
    Library,
    StaticLibrary,
    DynamicLibrary,
    /// Sources are compiled into the depending target.
    SourceLibrary,
    Object,
}

impl TargetType {
    /// True for types that make the compiler emit a linked artifact.
    pub fn is_binary(&self) -> bool {
        matches!(
            self,
            TargetType::Executable | TargetType::StaticLibrary | TargetType::DynamicLibrary
        )
    }

    /// Platform file name of the emitted artifact, `None` for types without
    /// one.
    pub fn output_file_name(&self, name: &str, platform: &BuildPlatform) -> Option<String> {
        match self {
            TargetType::Executable => Some(if platform.is_windows() {
                format!("{name}.exe")
            } else {
                name.to_string()
            }),
            TargetType::StaticLibrary => Some(if platform.is_windows() {
                format!("{name}.lib")
            } else {
                format!("lib{name}.a")
            }),
            TargetType::DynamicLibrary => Some(if platform.is_windows() {
                format!("{name}.dll")
            } else if platform.is_macos() {
                format!("lib{name}.dylib")
            } else {
                format!("lib{name}.so")
            }),
            TargetType::Object => Some(format!("{name}{}", platform.obj_suffix())),
            _ => None,
        }
    }
}

bitflags! {
    /// Structured compile options. The planner and drivers prefer these over
    /// raw dflags so flags can be reasoned about after merging.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BuildOptions: u32 {
        const DEBUG_MODE          = 1 << 0;
        const RELEASE_MODE        = 1 << 1;
        const COVERAGE            = 1 << 2;
        const DEBUG_INFO          = 1 << 3;
        const DEBUG_INFO_C        = 1 << 4;
        const ALWAYS_STACK_FRAME  = 1 << 5;
        const STACK_STOMPING      = 1 << 6;
        const INLINE              = 1 << 7;
        const NO_BOUNDS_CHECK     = 1 << 8;
        const OPTIMIZE            = 1 << 9;
        const PROFILE             = 1 << 10;
        const UNITTESTS           = 1 << 11;
        const VERBOSE             = 1 << 12;
        const SYNTAX_ONLY         = 1 << 13;
        const WARNINGS            = 1 << 14;
        const WARNINGS_AS_ERRORS  = 1 << 15;
        const IGNORE_DEPRECATIONS = 1 << 16;
        const DEPRECATION_WARNINGS = 1 << 17;
        const DEPRECATION_ERRORS  = 1 << 18;
        const PROPERTY            = 1 << 19;
        const PIC                 = 1 << 20;
    }
}

impl BuildOptions {
    /// Options a target passes down to its dependencies. ABI-affecting flags
    /// (PIC, unit tests, coverage, debug info) must agree across the link.
    pub fn inheritable() -> BuildOptions {
        BuildOptions::DEBUG_MODE
            | BuildOptions::RELEASE_MODE
            | BuildOptions::COVERAGE
            | BuildOptions::DEBUG_INFO
            | BuildOptions::DEBUG_INFO_C
            | BuildOptions::ALWAYS_STACK_FRAME
            | BuildOptions::STACK_STOMPING
            | BuildOptions::INLINE
            | BuildOptions::NO_BOUNDS_CHECK
            | BuildOptions::OPTIMIZE
            | BuildOptions::PROFILE
            | BuildOptions::UNITTESTS
            | BuildOptions::WARNINGS
            | BuildOptions::WARNINGS_AS_ERRORS
            | BuildOptions::IGNORE_DEPRECATIONS
            | BuildOptions::DEPRECATION_WARNINGS
            | BuildOptions::DEPRECATION_ERRORS
            | BuildOptions::PROPERTY
            | BuildOptions::PIC
    }
}

mod options_serde {
    use super::BuildOptions;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(opts: &BuildOptions, s: S) -> Result<S::Ok, S::Error> {
        opts.bits().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<BuildOptions, D::Error> {
        Ok(BuildOptions::from_bits_truncate(u32::deserialize(d)?))
    }
}

/// Merged bag of compile and link inputs for one target. Produced per
/// configuration by the package recipe, then grown by the planner and finally
/// consumed (as a copy) by the build executor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BuildSettings {
    pub target_type: TargetType,
    pub target_path: PathBuf,
    pub target_name: String,
    pub working_directory: PathBuf,
    pub main_source_file: Option<PathBuf>,
    pub source_files: Vec<PathBuf>,
    pub import_files: Vec<PathBuf>,
    pub string_import_files: Vec<PathBuf>,
    pub versions: Vec<String>,
    pub debug_versions: Vec<String>,
    pub dflags: Vec<String>,
    pub lflags: Vec<String>,
    pub libs: Vec<String>,
    pub import_paths: Vec<PathBuf>,
    pub string_import_paths: Vec<PathBuf>,
    pub copy_files: Vec<String>,
    pub pre_build_commands: Vec<String>,
    pub post_build_commands: Vec<String>,
    pub pre_generate_commands: Vec<String>,
    pub post_generate_commands: Vec<String>,
    #[serde(with = "options_serde")]
    pub options: BuildOptions,
}

fn add_unique<T: PartialEq + Clone>(dst: &mut Vec<T>, src: &[T]) {
    for item in src {
        if !dst.contains(item) {
            dst.push(item.clone());
        }
    }
}

impl BuildSettings {
    pub fn add_versions(&mut self, versions: &[String]) {
        add_unique(&mut self.versions, versions);
    }

    pub fn add_debug_versions(&mut self, versions: &[String]) {
        add_unique(&mut self.debug_versions, versions);
    }

    pub fn add_import_paths(&mut self, paths: &[PathBuf]) {
        add_unique(&mut self.import_paths, paths);
    }

    pub fn add_string_import_paths(&mut self, paths: &[PathBuf]) {
        add_unique(&mut self.string_import_paths, paths);
    }

    pub fn add_source_files(&mut self, files: &[PathBuf]) {
        add_unique(&mut self.source_files, files);
    }

    pub fn add_libs(&mut self, libs: &[String]) {
        add_unique(&mut self.libs, libs);
    }

    pub fn add_dflags(&mut self, flags: &[String]) {
        self.dflags.extend(flags.iter().cloned());
    }

    pub fn add_lflags(&mut self, flags: &[String]) {
        self.lflags.extend(flags.iter().cloned());
    }

    /// Overlay a configuration block from the recipe onto the base settings.
    /// Scalars override when set, sequences append.
    pub fn apply_overlay(&mut self, overlay: &BuildSettings) {
        if overlay.target_type != TargetType::Autodetect {
            self.target_type = overlay.target_type;
        }
        if !overlay.target_name.is_empty() {
            self.target_name = overlay.target_name.clone();
        }
        if overlay.target_path != PathBuf::new() {
            self.target_path = overlay.target_path.clone();
        }
        if overlay.working_directory != PathBuf::new() {
            self.working_directory = overlay.working_directory.clone();
        }
        if overlay.main_source_file.is_some() {
            self.main_source_file = overlay.main_source_file.clone();
        }
        self.add_source_files(&overlay.source_files);
        add_unique(&mut self.import_files, &overlay.import_files);
        add_unique(&mut self.string_import_files, &overlay.string_import_files);
        self.add_versions(&overlay.versions);
        self.add_debug_versions(&overlay.debug_versions);
        self.add_dflags(&overlay.dflags);
        self.add_lflags(&overlay.lflags);
        self.add_libs(&overlay.libs);
        self.add_import_paths(&overlay.import_paths);
        self.add_string_import_paths(&overlay.string_import_paths);
        add_unique(&mut self.copy_files, &overlay.copy_files);
        self.pre_build_commands
            .extend(overlay.pre_build_commands.iter().cloned());
        self.post_build_commands
            .extend(overlay.post_build_commands.iter().cloned());
        self.pre_generate_commands
            .extend(overlay.pre_generate_commands.iter().cloned());
        self.post_generate_commands
            .extend(overlay.post_generate_commands.iter().cloned());
        self.options |= overlay.options;
    }

    /// Fold settings a binary dependency exposes to its dependents: compile
    /// inputs that must agree across the link, but never the dependency's own
    /// compiled sources or import files (only its eventual artifact is
    /// linked). Pre-built linker files listed by a static library do
    /// propagate, since the parent performs that link.
    pub fn merge_from_dependency(&mut self, dep: &BuildSettings) {
        self.add_versions(&dep.versions);
        self.add_debug_versions(&dep.debug_versions);
        self.add_import_paths(&dep.import_paths);
        self.add_string_import_paths(&dep.string_import_paths);
        self.add_libs(&dep.libs);
        add_unique(&mut self.dflags, &dep.dflags);
        add_unique(&mut self.lflags, &dep.lflags);
        if dep.target_type == TargetType::StaticLibrary {
            let linker_inputs: Vec<PathBuf> = dep
                .source_files
                .iter()
                .filter(|f| is_linker_file(f))
                .cloned()
                .collect();
            self.add_source_files(&linker_inputs);
        }
    }

    /// Fold the settings of a package absorbed into this target, sources
    /// included.
    pub fn merge_from_absorbed(&mut self, dep: &BuildSettings) {
        self.add_versions(&dep.versions);
        self.add_debug_versions(&dep.debug_versions);
        self.add_import_paths(&dep.import_paths);
        self.add_string_import_paths(&dep.string_import_paths);
        self.add_libs(&dep.libs);
        add_unique(&mut self.dflags, &dep.dflags);
        add_unique(&mut self.lflags, &dep.lflags);
        self.add_source_files(&dep.source_files);
        add_unique(&mut self.import_files, &dep.import_files);
        add_unique(&mut self.string_import_files, &dep.string_import_files);
        add_unique(&mut self.copy_files, &dep.copy_files);
    }

    /// Apply the named build type as an options bundle.
    pub fn apply_build_type(&mut self, build_type: &str) -> Result<()> {
        let opts = match build_type {
            "plain" => BuildOptions::empty(),
            "debug" => BuildOptions::DEBUG_MODE | BuildOptions::DEBUG_INFO,
            "release" => {
                BuildOptions::RELEASE_MODE | BuildOptions::OPTIMIZE | BuildOptions::INLINE
            }
            "release-debug" => {
                BuildOptions::RELEASE_MODE
                    | BuildOptions::OPTIMIZE
                    | BuildOptions::INLINE
                    | BuildOptions::DEBUG_INFO
            }
            "release-nobounds" => {
                BuildOptions::RELEASE_MODE
                    | BuildOptions::OPTIMIZE
                    | BuildOptions::INLINE
                    | BuildOptions::NO_BOUNDS_CHECK
            }
            "unittest" => {
                BuildOptions::UNITTESTS | BuildOptions::DEBUG_MODE | BuildOptions::DEBUG_INFO
            }
            "unittest-cov" => {
                BuildOptions::UNITTESTS
                    | BuildOptions::COVERAGE
                    | BuildOptions::DEBUG_MODE
                    | BuildOptions::DEBUG_INFO
            }
            "cov" => BuildOptions::COVERAGE | BuildOptions::DEBUG_INFO,
            "profile" => {
                BuildOptions::PROFILE
                    | BuildOptions::OPTIMIZE
                    | BuildOptions::INLINE
                    | BuildOptions::DEBUG_INFO
            }
            "syntax" => BuildOptions::SYNTAX_ONLY,
            other => {
                return Err(BuildError::planning(format!(
                    "unknown build type: {other}"
                )))
            }
        };
        self.options |= opts;
        Ok(())
    }
}

/// Pre-built artifacts passed through to the linker untouched.
pub fn is_linker_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("o" | "obj" | "a" | "lib" | "res" | "so" | "dylib" | "dll")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_overrides_scalars_and_appends_lists() {
        let mut base = BuildSettings {
            target_name: "app".to_string(),
            versions: vec!["A".to_string()],
            ..Default::default()
        };
        let overlay = BuildSettings {
            target_type: TargetType::Executable,
            versions: vec!["A".to_string(), "B".to_string()],
            ..Default::default()
        };
        base.apply_overlay(&overlay);
        assert_eq!(base.target_type, TargetType::Executable);
        assert_eq!(base.target_name, "app");
        assert_eq!(base.versions, vec!["A".to_string(), "B".to_string()]);
    }

    #[test]
    fn dependency_merge_excludes_sources() {
        let mut parent = BuildSettings::default();
        let dep = BuildSettings {
            source_files: vec![PathBuf::from("dep/src/a.d")],
            versions: vec!["DepVer".to_string()],
            libs: vec!["z".to_string()],
            ..Default::default()
        };
        parent.merge_from_dependency(&dep);
        assert!(parent.source_files.is_empty());
        assert_eq!(parent.versions, vec!["DepVer".to_string()]);
        assert_eq!(parent.libs, vec!["z".to_string()]);
    }

    #[test]
    fn linker_file_detection() {
        assert!(is_linker_file(Path::new("libfoo.a")));
        assert!(is_linker_file(Path::new("x/y/z.o")));
        assert!(is_linker_file(Path::new("w.lib")));
        assert!(!is_linker_file(Path::new("app.d")));
    }

    #[test]
    fn unknown_build_type_is_rejected() {
        let mut bs = BuildSettings::default();
        assert!(bs.apply_build_type("debug").is_ok());
        assert!(bs.apply_build_type("no-such-type").is_err());
    }

    #[test]
    fn output_file_names() {
        let platform = BuildPlatform {
            platform: vec!["linux".to_string(), "posix".to_string()],
            architecture: vec!["x86_64".to_string()],
            compiler: "dmd".to_string(),
            compiler_binary: PathBuf::from("dmd"),
            frontend_version: 2108,
        };
        assert_eq!(
            TargetType::Executable.output_file_name("foo", &platform),
            Some("foo".to_string())
        );
        assert_eq!(
            TargetType::StaticLibrary.output_file_name("foo", &platform),
            Some("libfoo.a".to_string())
        );
        assert_eq!(TargetType::SourceLibrary.output_file_name("foo", &platform), None);
    }
}
