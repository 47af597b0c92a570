//! Target configuration planner: turns the resolved dependency graph and the
//! generator settings into per-binary-target descriptors with fully merged
//! build settings.

use crate::error::{BuildError, Result};
use crate::project::{Package, Project};
use crate::types::{BuildOptions, BuildSettings, TargetType};
use indexmap::IndexMap;
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::{debug, warn};

use super::{hooks, GeneratorSettings};

/// Per-binary-target descriptor produced by planning.
#[derive(Debug, Clone)]
pub struct TargetInfo {
    /// Root package of this target.
    pub pack: String,
    /// Packages whose sources are folded into this target; the root package
    /// of the target is always first.
    pub packages: Vec<String>,
    /// Chosen configuration name.
    pub config: String,
    pub build_settings: BuildSettings,
    /// All transitive dependencies that are targets themselves.
    pub dependencies: Vec<String>,
    /// Dependencies to link against, ordered so a dependency always comes
    /// after every target that depends on it.
    pub link_dependencies: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Plan {
    pub targets: IndexMap<String, TargetInfo>,
    pub main_files: Vec<PathBuf>,
}

/// Targets that survive planning: everything except absorbed source
/// libraries and settings-only packages. The root always survives.
fn is_target_kind(tt: TargetType) -> bool {
    !matches!(tt, TargetType::SourceLibrary | TargetType::None)
}

fn sanitize_identifier(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn expand_str(s: &str, vars: &[(String, String)]) -> String {
    let mut out = s.to_string();
    for (name, value) in vars {
        out = out
            .replace(&format!("${{{name}}}"), value)
            .replace(&format!("${name}"), value);
    }
    out
}

fn expand_path(p: &mut PathBuf, vars: &[(String, String)]) {
    let s = p.display().to_string();
    if s.contains('$') {
        *p = PathBuf::from(expand_str(&s, vars));
    }
}

/// Expand `$PACKAGE_DIR`-style build variables in paths and commands.
fn expand_build_variables(bs: &mut BuildSettings, pack: &Package, project: &Project) {
    let mut vars: Vec<(String, String)> = vec![
        (
            "ROOT_PACKAGE_DIR".to_string(),
            project.root_package().path.display().to_string(),
        ),
        ("PACKAGE_DIR".to_string(), pack.path.display().to_string()),
    ];
    for dep in project.packages() {
        vars.push((
            format!("{}_PACKAGE_DIR", dep.name),
            dep.path.display().to_string(),
        ));
    }

    expand_path(&mut bs.target_path, &vars);
    expand_path(&mut bs.working_directory, &vars);
    if let Some(main) = bs.main_source_file.as_mut() {
        expand_path(main, &vars);
    }
    for list in [
        &mut bs.source_files,
        &mut bs.import_files,
        &mut bs.string_import_files,
        &mut bs.import_paths,
        &mut bs.string_import_paths,
    ] {
        for p in list.iter_mut() {
            expand_path(p, &vars);
        }
    }
    for list in [
        &mut bs.copy_files,
        &mut bs.lflags,
        &mut bs.dflags,
        &mut bs.pre_generate_commands,
        &mut bs.post_generate_commands,
        &mut bs.pre_build_commands,
        &mut bs.post_build_commands,
    ] {
        for s in list.iter_mut() {
            if s.contains('$') {
                *s = expand_str(s, &vars);
            }
        }
    }
}

/// Names of `pack` and its reachable dependencies, used for the hook
/// recursion guard.
fn dependency_chain(project: &Project, pack: &Package) -> Vec<String> {
    let mut chain = vec![pack.name.clone()];
    let mut i = 0;
    while i < chain.len() {
        if let Some(p) = project.package(&chain[i]) {
            for dep in p.dependencies.keys() {
                if project.package(dep).is_some() && !chain.contains(dep) {
                    chain.push(dep.clone());
                }
            }
        }
        i += 1;
    }
    chain
}

fn collect_dependencies(
    project: &Project,
    targets: &mut IndexMap<String, TargetInfo>,
    visited: &mut HashSet<String>,
    acc: &str,
    pack: &str,
) -> Result<()> {
    let Some(package) = project.package(pack) else {
        return Ok(());
    };
    // BTreeMap iteration makes the lexicographic visiting order, and with it
    // the plan, deterministic.
    for (dep_name, dep_spec) in &package.dependencies {
        let Some(_dep_pack) = project.package(dep_name) else {
            if dep_spec.optional {
                continue;
            }
            return Err(BuildError::MissingDependency {
                package: pack.to_string(),
                name: dep_name.clone(),
            });
        };
        if dep_spec.optional && !project.is_selected(dep_name) {
            debug!("skipping optional dependency {dep_name}");
            continue;
        }

        let dep_tt = targets[dep_name.as_str()].build_settings.target_type;

        if !is_target_kind(dep_tt) {
            // Absorbed into the first target that reaches it; its own
            // dependencies keep accumulating into the same target.
            if visited.insert(dep_name.clone()) {
                targets[acc].packages.push(dep_name.clone());
                collect_dependencies(project, targets, visited, acc, dep_name)?;
            }
            continue;
        }

        // Separate target: gather its own subtree first so its link
        // dependencies are complete when merged below.
        if visited.insert(dep_name.clone()) {
            collect_dependencies(project, targets, visited, dep_name, dep_name)?;
        }

        // Executables cannot be linked into a dependent.
        if dep_tt == TargetType::Executable {
            continue;
        }

        let ti = &mut targets[acc];
        if !ti.dependencies.contains(dep_name) {
            ti.dependencies.push(dep_name.clone());
        }
        if !ti.link_dependencies.contains(dep_name) {
            ti.link_dependencies.push(dep_name.clone());
        }
        if dep_tt == TargetType::StaticLibrary {
            // The parent links the static library's own link dependencies;
            // keep them after their dependents.
            let dep_links = targets[dep_name.as_str()].link_dependencies.clone();
            let ti = &mut targets[acc];
            ti.link_dependencies.retain(|d| !dep_links.contains(d));
            ti.link_dependencies.extend(dep_links);
        }
    }
    Ok(())
}

/// Compute the target set and merged build settings for `project`.
pub async fn plan(project: &Project, settings: &GeneratorSettings) -> Result<Plan> {
    let order = project.topological_order()?;
    let root_name = project.root_package().name.clone();

    // 1. shallow configuration of every package
    let mut targets: IndexMap<String, TargetInfo> = IndexMap::new();
    for pack in &order {
        let config = pack.select_configuration(&settings.config);
        let config_name = config.clone().unwrap_or_else(|| "default".to_string());
        let mut bs = pack.build_settings(config.as_deref());
        if let Some(main) = bs.main_source_file.clone() {
            if !bs.source_files.contains(&main) {
                bs.source_files.push(main);
            }
        }
        expand_build_variables(&mut bs, pack, project);
        targets.insert(
            pack.name.clone(),
            TargetInfo {
                pack: pack.name.clone(),
                packages: vec![pack.name.clone()],
                config: config_name,
                build_settings: bs,
                dependencies: Vec::new(),
                link_dependencies: Vec::new(),
            },
        );
    }

    // 2. pre-generate hooks, suppressed when this process was itself spawned
    // by a hook for the same package
    let already_used = hooks::packages_already_used();
    for pack in &order {
        let commands = targets[pack.name.as_str()]
            .build_settings
            .pre_generate_commands
            .clone();
        if commands.is_empty() {
            continue;
        }
        if already_used.contains(&pack.name) {
            debug!("suppressing recursive pre-generate hook for {}", pack.name);
            continue;
        }
        let chain = dependency_chain(project, pack);
        let env = {
            let ti = &targets[pack.name.as_str()];
            hooks::hook_environment(project, settings, pack, &ti.build_settings, &ti.config, &chain)
        };
        hooks::run_hook("pre-generate", &commands, &pack.path, &env).await;
    }

    // 3. target-type determination
    for pack in &order {
        let is_root = pack.name == root_name;
        let ti = &mut targets[pack.name.as_str()];
        let bs = &mut ti.build_settings;
        if bs.target_type == TargetType::Autodetect {
            bs.target_type = if bs.main_source_file.is_some() {
                TargetType::Executable
            } else {
                TargetType::Library
            };
        }
        match bs.target_type {
            TargetType::Library => {
                bs.target_type = if !is_root && settings.combined {
                    TargetType::SourceLibrary
                } else {
                    TargetType::StaticLibrary
                };
            }
            TargetType::DynamicLibrary if !is_root => {
                warn!(
                    "{} declares a dynamic library; building as static library instead",
                    pack.name
                );
                bs.target_type = TargetType::StaticLibrary;
            }
            _ => {}
        }
        if bs.source_files.is_empty() && is_target_kind(bs.target_type) {
            warn!(
                "configuration {} of package {} contains no source files; target type set to none",
                ti.config, pack.name
            );
            *bs = BuildSettings {
                target_type: TargetType::None,
                target_name: bs.target_name.clone(),
                target_path: bs.target_path.clone(),
                ..Default::default()
            };
        }
        if bs.target_type == TargetType::DynamicLibrary {
            bs.options |= BuildOptions::PIC;
        }
    }

    {
        let root_tt = targets[root_name.as_str()].build_settings.target_type;
        if !root_tt.is_binary() {
            return Err(BuildError::planning(format!(
                "main package {root_name} has target type {root_tt:?}; cannot build it"
            )));
        }
    }

    // 5. dependency collection, depth first from the root
    let mut visited = HashSet::new();
    visited.insert(root_name.clone());
    collect_dependencies(project, &mut targets, &mut visited, &root_name, &root_name)?;

    // 6. downward inheritance of versions and inheritable options
    for pack in &order {
        let (versions, debug_versions, inherited) = {
            let bs = &targets[pack.name.as_str()].build_settings;
            (
                bs.versions.clone(),
                bs.debug_versions.clone(),
                bs.options & BuildOptions::inheritable(),
            )
        };
        for (dep_name, dep_spec) in &pack.dependencies {
            if project.package(dep_name).is_none()
                || (dep_spec.optional && !project.is_selected(dep_name))
            {
                continue;
            }
            let child = &mut targets[dep_name.as_str()].build_settings;
            child.add_versions(&versions);
            child.add_debug_versions(&debug_versions);
            child.options |= inherited;
        }
    }

    // 7. synthesized version identifiers for direct dependencies
    for ti in targets.values_mut() {
        let mut deps: Vec<&String> = ti.packages.iter().chain(ti.dependencies.iter()).collect();
        deps.sort();
        deps.dedup();
        let versions: Vec<String> = deps
            .into_iter()
            .map(|name| format!("Have_{}", sanitize_identifier(name)))
            .collect();
        ti.build_settings.add_versions(&versions);
    }

    // 8. upward inheritance of full build settings, leaves first; binary
    // dependencies fold before absorbed packages
    for pack in order.iter().rev() {
        let name = pack.name.as_str();
        let dep_names = targets[name].dependencies.clone();
        for dep in &dep_names {
            let dep_bs = targets[dep.as_str()].build_settings.clone();
            targets[name].build_settings.merge_from_dependency(&dep_bs);
        }
        let absorbed: Vec<String> = targets[name].packages[1..].to_vec();
        for abs in &absorbed {
            let abs_bs = targets[abs.as_str()].build_settings.clone();
            targets[name].build_settings.merge_from_absorbed(&abs_bs);
        }
    }

    // 9. root string-import override
    {
        let root_bs = targets[root_name.as_str()].build_settings.clone();
        for (name, ti) in targets.iter_mut() {
            if *name == root_name || ti.build_settings.string_import_paths.is_empty() {
                continue;
            }
            for file in ti.build_settings.string_import_files.iter_mut() {
                let Some(base) = file.file_name() else { continue };
                if let Some(root_file) = root_bs
                    .string_import_files
                    .iter()
                    .find(|rf| rf.file_name() == Some(base))
                {
                    if *file != *root_file {
                        *file = root_file.clone();
                    }
                }
            }
            let mut paths = root_bs.string_import_paths.clone();
            for p in std::mem::take(&mut ti.build_settings.string_import_paths) {
                if !paths.contains(&p) {
                    paths.push(p);
                }
            }
            ti.build_settings.string_import_paths = paths;
        }
    }

    // 10. purge absorbed and settings-only entries
    targets.retain(|name, ti| {
        *name == root_name
            || (is_target_kind(ti.build_settings.target_type) && visited.contains(name))
    });

    // 11. build-type settings, then fold recognizable dflags back into the
    // options mask
    for ti in targets.values_mut() {
        ti.build_settings.apply_build_type(&settings.build_type)?;
        settings
            .compiler
            .extract_build_options(&mut ti.build_settings);
    }

    let main_files = targets
        .values()
        .filter_map(|ti| ti.build_settings.main_source_file.clone())
        .collect();

    Ok(Plan {
        targets,
        main_files,
    })
}
