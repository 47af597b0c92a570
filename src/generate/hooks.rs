//! Execution of user-defined hook commands (pre/post generate and build) with
//! the exported build environment.

use crate::error::{BuildError, Result};
use crate::project::{Package, Project};
use crate::types::{BuildSettings, TargetType};
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info};

use super::GeneratorSettings;

/// Environment list consumed by hook commands, both as documentation of the
/// build and as the recursion guard when a hook re-invokes the tool.
pub const PACKAGES_USED_VAR: &str = "DUB_PACKAGES_USED";

fn bool_var(value: bool) -> String {
    if value { "TRUE" } else { "" }.to_string()
}

fn join_paths(paths: &[std::path::PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

fn target_type_name(tt: TargetType) -> &'static str {
    match tt {
        TargetType::Autodetect => "autodetect",
        TargetType::None => "none",
        TargetType::Executable => "executable",
        TargetType::Library => "library",
        TargetType::StaticLibrary => "staticLibrary",
        TargetType::DynamicLibrary => "dynamicLibrary",
        TargetType::SourceLibrary => "sourceLibrary",
        TargetType::Object => "object",
    }
}

/// Quote an argument so a POSIX shell reads it as one word.
pub fn escape_shell_arg(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./=:".contains(c))
    {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// Packages the current process was already invoked for, read back from the
/// environment so a hook that re-runs the tool does not recurse forever.
pub fn packages_already_used() -> HashSet<String> {
    std::env::var(PACKAGES_USED_VAR)
        .unwrap_or_default()
        .split(',')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Assemble the hook environment for one package of one target.
pub fn hook_environment(
    project: &Project,
    settings: &GeneratorSettings,
    pack: &Package,
    build_settings: &BuildSettings,
    config: &str,
    dependency_chain: &[String],
) -> Vec<(String, String)> {
    let platform = &settings.platform;
    let root = project.root_package();

    let mut used: Vec<String> = std::env::var(PACKAGES_USED_VAR)
        .unwrap_or_default()
        .split(',')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    for name in dependency_chain {
        if !used.iter().any(|u| u == name) {
            used.push(name.clone());
        }
    }

    let run_args = settings
        .run_args
        .iter()
        .map(|a| escape_shell_arg(a))
        .collect::<Vec<_>>()
        .join(" ");

    vec![
        ("DFLAGS".to_string(), build_settings.dflags.join(" ")),
        ("LFLAGS".to_string(), build_settings.lflags.join(" ")),
        ("VERSIONS".to_string(), build_settings.versions.join(" ")),
        ("LIBS".to_string(), build_settings.libs.join(" ")),
        (
            "IMPORT_PATHS".to_string(),
            join_paths(&build_settings.import_paths),
        ),
        (
            "STRING_IMPORT_PATHS".to_string(),
            join_paths(&build_settings.string_import_paths),
        ),
        (
            "DC".to_string(),
            platform.compiler_binary.display().to_string(),
        ),
        ("DC_BASE".to_string(), platform.compiler.clone()),
        (
            "D_FRONTEND_VER".to_string(),
            platform.frontend_version.to_string(),
        ),
        (
            "DUB_PLATFORM".to_string(),
            platform.platform_tag().to_string(),
        ),
        ("DUB_ARCH".to_string(), platform.arch_tag().to_string()),
        (
            "DUB_TARGET_TYPE".to_string(),
            target_type_name(build_settings.target_type).to_string(),
        ),
        (
            "DUB_TARGET_PATH".to_string(),
            build_settings.target_path.display().to_string(),
        ),
        (
            "DUB_TARGET_NAME".to_string(),
            build_settings.target_name.clone(),
        ),
        (
            "DUB_WORKING_DIRECTORY".to_string(),
            build_settings.working_directory.display().to_string(),
        ),
        (
            "DUB_MAIN_SOURCE_FILE".to_string(),
            build_settings
                .main_source_file
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
        ),
        ("DUB_CONFIG".to_string(), config.to_string()),
        ("DUB_BUILD_TYPE".to_string(), settings.build_type.clone()),
        (
            "DUB_BUILD_MODE".to_string(),
            settings.build_mode.as_str().to_string(),
        ),
        ("DUB_PACKAGE".to_string(), pack.name.clone()),
        (
            "DUB_PACKAGE_DIR".to_string(),
            pack.path.display().to_string(),
        ),
        ("DUB_ROOT_PACKAGE".to_string(), root.name.clone()),
        (
            "DUB_ROOT_PACKAGE_DIR".to_string(),
            root.path.display().to_string(),
        ),
        ("DUB_COMBINED".to_string(), bool_var(settings.combined)),
        ("DUB_RUN".to_string(), bool_var(settings.run)),
        ("DUB_FORCE".to_string(), bool_var(settings.force)),
        ("DUB_DIRECT".to_string(), bool_var(settings.direct)),
        ("DUB_RDMD".to_string(), bool_var(settings.rdmd)),
        ("DUB_TEMP_BUILD".to_string(), bool_var(settings.temp_build)),
        (
            "DUB_PARALLEL_BUILD".to_string(),
            bool_var(settings.parallel_build),
        ),
        ("DUB_RUN_ARGS".to_string(), run_args),
        (PACKAGES_USED_VAR.to_string(), used.join(",")),
    ]
}

/// Run a list of hook commands through the shell in `cwd`. The first failing
/// command aborts the list.
pub async fn run_commands(
    commands: &[String],
    cwd: &Path,
    env: &[(String, String)],
) -> Result<()> {
    for command in commands {
        debug!("running command: {command}");
        let mut cmd = if cfg!(windows) {
            let mut c = tokio::process::Command::new("cmd.exe");
            c.arg("/C").arg(command);
            c
        } else {
            let mut c = tokio::process::Command::new("sh");
            c.arg("-c").arg(command);
            c
        };
        cmd.current_dir(cwd);
        for (key, value) in env {
            cmd.env(key, value);
        }
        let status = cmd.status().await.map_err(|e| BuildError::Spawn {
            program: command.clone(),
            source: e,
        })?;
        if !status.success() {
            return Err(BuildError::BuildCommandFailed {
                command: command.clone(),
                code: status.code().unwrap_or(-1),
            });
        }
    }
    Ok(())
}

/// Announce and run one hook phase, downgrading failures to warnings per the
/// recoverability policy for user hooks.
pub async fn run_hook(
    phase: &str,
    commands: &[String],
    cwd: &Path,
    env: &[(String, String)],
) -> bool {
    if commands.is_empty() {
        return true;
    }
    info!("Running {phase} commands...");
    match run_commands(commands, cwd, env).await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!("{phase} command failed: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_leaves_plain_args_alone() {
        assert_eq!(escape_shell_arg("--verbose"), "--verbose");
        assert_eq!(escape_shell_arg("a b"), "'a b'");
        assert_eq!(escape_shell_arg("it's"), r"'it'\''s'");
        assert_eq!(escape_shell_arg(""), "''");
    }
}
