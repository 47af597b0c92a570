//! DMD driver: translates merged build settings into dmd command lines and
//! runs the compile and link phases.

use crate::error::{BuildError, Result};
use crate::types::settings::TargetType;
use crate::types::{BuildOptions, BuildPlatform, BuildSettings};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;

use super::{Compiler, InvocationStyle, OutputCallback};

const OPTION_FLAGS: &[(BuildOptions, &str)] = &[
    (BuildOptions::DEBUG_MODE, "-debug"),
    (BuildOptions::RELEASE_MODE, "-release"),
    (BuildOptions::COVERAGE, "-cov"),
    (BuildOptions::DEBUG_INFO, "-g"),
    (BuildOptions::DEBUG_INFO_C, "-gc"),
    (BuildOptions::ALWAYS_STACK_FRAME, "-gs"),
    (BuildOptions::STACK_STOMPING, "-gx"),
    (BuildOptions::INLINE, "-inline"),
    (BuildOptions::NO_BOUNDS_CHECK, "-boundscheck=off"),
    (BuildOptions::OPTIMIZE, "-O"),
    (BuildOptions::PROFILE, "-profile"),
    (BuildOptions::UNITTESTS, "-unittest"),
    (BuildOptions::VERBOSE, "-v"),
    (BuildOptions::SYNTAX_ONLY, "-o-"),
    (BuildOptions::WARNINGS, "-wi"),
    (BuildOptions::WARNINGS_AS_ERRORS, "-w"),
    (BuildOptions::IGNORE_DEPRECATIONS, "-d"),
    (BuildOptions::DEPRECATION_WARNINGS, "-dw"),
    (BuildOptions::DEPRECATION_ERRORS, "-de"),
    (BuildOptions::PROPERTY, "-property"),
    (BuildOptions::PIC, "-fPIC"),
];

#[derive(Debug, Clone, Default)]
pub struct DmdCompiler;

impl DmdCompiler {
    pub fn new() -> Self {
        Self
    }

    fn option_flags(options: BuildOptions) -> Vec<String> {
        OPTION_FLAGS
            .iter()
            .filter(|(opt, _)| options.contains(*opt))
            .map(|(_, flag)| flag.to_string())
            .collect()
    }

    async fn run_tool(
        &self,
        binary: &Path,
        args: Vec<String>,
        target: &str,
        output: Option<&OutputCallback>,
        link_phase: bool,
    ) -> Result<()> {
        debug!("{} {}", binary.display(), args.join(" "));
        let mut cmd = Command::new(binary);
        cmd.args(&args);
        if let Some(cb) = output {
            let out = cmd.output().await.map_err(|e| BuildError::Spawn {
                program: binary.display().to_string(),
                source: e,
            })?;
            let mut text = String::from_utf8_lossy(&out.stdout).into_owned();
            text.push_str(&String::from_utf8_lossy(&out.stderr));
            cb(out.status.code().unwrap_or(-1), &text);
            Ok(())
        } else {
            let status = cmd.status().await.map_err(|e| BuildError::Spawn {
                program: binary.display().to_string(),
                source: e,
            })?;
            if status.success() {
                Ok(())
            } else {
                let code = status.code().unwrap_or(-1);
                Err(if link_phase {
                    BuildError::LinkFailed {
                        target: target.to_string(),
                        code,
                    }
                } else {
                    BuildError::CompileFailed {
                        target: target.to_string(),
                        code,
                    }
                })
            }
        }
    }
}

#[async_trait]
impl Compiler for DmdCompiler {
    fn name(&self) -> &'static str {
        "dmd"
    }

    fn prepare_build_settings(
        &self,
        settings: &mut BuildSettings,
        platform: &BuildPlatform,
        style: InvocationStyle,
    ) {
        let mut flags = Vec::new();
        flags.extend(Self::option_flags(settings.options));
        for v in settings.versions.drain(..) {
            flags.push(format!("-version={v}"));
        }
        for v in settings.debug_versions.drain(..) {
            flags.push(format!("-debug={v}"));
        }
        for p in settings.import_paths.drain(..) {
            flags.push(format!("-I{}", p.display()));
        }
        for p in settings.string_import_paths.drain(..) {
            flags.push(format!("-J{}", p.display()));
        }
        for lib in settings.libs.drain(..) {
            if platform.is_windows() {
                settings.lflags.push(format!("{lib}.lib"));
            } else {
                settings.lflags.push(format!("-l{lib}"));
            }
        }
        match style {
            InvocationStyle::CommandLine => {
                // Single-shot invocation links too, so linker flags ride
                // along on the compiler command line.
                for f in settings.lflags.drain(..) {
                    flags.push(format!("-L{f}"));
                }
            }
            InvocationStyle::CommandLineSeparate => {}
            InvocationStyle::CommandLineSeparateSourceFiles => {
                for s in settings.source_files.drain(..) {
                    flags.push(s.display().to_string());
                }
            }
        }
        // dflags now carry everything except sources and the link inputs.
        settings.dflags.append(&mut flags);
    }

    fn set_target(
        &self,
        settings: &mut BuildSettings,
        platform: &BuildPlatform,
        obj_path: Option<&Path>,
    ) {
        match settings.target_type {
            TargetType::StaticLibrary => settings.dflags.push("-lib".to_string()),
            TargetType::DynamicLibrary => settings.dflags.push("-shared".to_string()),
            TargetType::Object => settings.dflags.push("-c".to_string()),
            _ => {}
        }
        if settings.options.contains(BuildOptions::SYNTAX_ONLY) {
            if !settings.dflags.iter().any(|f| f == "-o-") {
                settings.dflags.push("-o-".to_string());
            }
            return;
        }
        let out = match obj_path {
            Some(p) => p.to_path_buf(),
            None => {
                let file_name = settings
                    .target_type
                    .output_file_name(&settings.target_name, platform)
                    .unwrap_or_else(|| settings.target_name.clone());
                settings.target_path.join(file_name)
            }
        };
        settings.dflags.push(format!("-of{}", out.display()));
    }

    async fn invoke(
        &self,
        settings: &BuildSettings,
        platform: &BuildPlatform,
        output: Option<&OutputCallback>,
    ) -> Result<()> {
        let mut args = settings.dflags.clone();
        args.extend(settings.source_files.iter().map(|s| s.display().to_string()));
        self.run_tool(
            &platform.compiler_binary,
            args,
            &settings.target_name,
            output,
            false,
        )
        .await
    }

    async fn invoke_linker(
        &self,
        settings: &BuildSettings,
        platform: &BuildPlatform,
        objects: &[PathBuf],
        output: Option<&OutputCallback>,
    ) -> Result<()> {
        let mut args = settings.dflags.clone();
        args.extend(objects.iter().map(|o| o.display().to_string()));
        args.extend(settings.source_files.iter().map(|s| s.display().to_string()));
        args.extend(settings.lflags.iter().map(|f| format!("-L{f}")));
        self.run_tool(
            &platform.compiler_binary,
            args,
            &settings.target_name,
            output,
            true,
        )
        .await
    }

    fn extract_build_options(&self, settings: &mut BuildSettings) {
        let mut rest = Vec::with_capacity(settings.dflags.len());
        for flag in settings.dflags.drain(..) {
            let known = OPTION_FLAGS
                .iter()
                .find(|(_, f)| *f == flag.as_str() || (flag == "-noboundscheck" && *f == "-boundscheck=off"));
            match known {
                Some((opt, _)) => settings.options |= *opt,
                None => rest.push(flag),
            }
        }
        settings.dflags = rest;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linux_platform() -> BuildPlatform {
        BuildPlatform {
            platform: vec!["linux".to_string(), "posix".to_string()],
            architecture: vec!["x86_64".to_string()],
            compiler: "dmd".to_string(),
            compiler_binary: PathBuf::from("dmd"),
            frontend_version: 2108,
        }
    }

    #[test]
    fn prepare_folds_versions_and_paths() {
        let mut bs = BuildSettings {
            versions: vec!["Have_foo".to_string()],
            import_paths: vec![PathBuf::from("source")],
            options: BuildOptions::DEBUG_INFO,
            ..Default::default()
        };
        DmdCompiler::new().prepare_build_settings(
            &mut bs,
            &linux_platform(),
            InvocationStyle::CommandLineSeparate,
        );
        assert!(bs.versions.is_empty());
        assert!(bs.import_paths.is_empty());
        assert!(bs.dflags.contains(&"-version=Have_foo".to_string()));
        assert!(bs.dflags.contains(&"-Isource".to_string()));
        assert!(bs.dflags.contains(&"-g".to_string()));
    }

    #[test]
    fn extract_round_trips_known_flags() {
        let mut bs = BuildSettings {
            dflags: vec!["-g".to_string(), "-unittest".to_string(), "-Xcustom".to_string()],
            ..Default::default()
        };
        DmdCompiler::new().extract_build_options(&mut bs);
        assert!(bs.options.contains(BuildOptions::DEBUG_INFO));
        assert!(bs.options.contains(BuildOptions::UNITTESTS));
        assert_eq!(bs.dflags, vec!["-Xcustom".to_string()]);
    }

    #[test]
    fn set_target_emits_of_flag() {
        let mut bs = BuildSettings {
            target_type: TargetType::Executable,
            target_name: "app".to_string(),
            target_path: PathBuf::from("/out"),
            ..Default::default()
        };
        DmdCompiler::new().set_target(&mut bs, &linux_platform(), None);
        assert!(bs.dflags.contains(&"-of/out/app".to_string()));
    }

    #[test]
    fn static_library_gets_lib_flag() {
        let mut bs = BuildSettings {
            target_type: TargetType::StaticLibrary,
            target_name: "x".to_string(),
            target_path: PathBuf::from("/out"),
            ..Default::default()
        };
        DmdCompiler::new().set_target(&mut bs, &linux_platform(), None);
        assert!(bs.dflags.contains(&"-lib".to_string()));
        assert!(bs.dflags.contains(&"-of/out/libx.a".to_string()));
    }
}
