//! Build generator: compiles targets bottom-up with a content-keyed artifact
//! cache, optionally runs the produced executable, and rebuilds on source
//! changes in watch mode.

use crate::cache;
use crate::error::{BuildError, Result};
use crate::project::{Package, Project};
use crate::types::settings::is_linker_file;
use crate::types::{BuildOptions, BuildSettings, TargetType};
use crate::watch::{FileWatcher, WaitOutcome};
use async_trait::async_trait;
use indexmap::IndexMap;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::planner::{plan, Plan, TargetInfo};
use super::{hooks, BuildMode, GeneratorSettings, ProjectGenerator};
use crate::compiler::InvocationStyle;

pub struct BuildGenerator {
    /// Temporary files and directories, removed in reverse order when the
    /// generator finishes, successfully or not.
    temp_files: Vec<PathBuf>,
}

impl Default for BuildGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl BuildGenerator {
    pub fn new() -> Self {
        Self {
            temp_files: Vec::new(),
        }
    }

    fn cleanup(&mut self) {
        for path in std::mem::take(&mut self.temp_files).into_iter().rev() {
            let res = if path.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            if let Err(e) = res {
                debug!("failed to remove {}: {e}", path.display());
            }
        }
    }

    async fn generate_inner(
        &mut self,
        project: &Project,
        settings: &GeneratorSettings,
        plan: &Plan,
    ) -> Result<i32> {
        let root_artifact = self.build_all(project, settings, plan).await?;

        self.run_post_generate_hooks(project, settings, plan).await;

        let root = &plan.targets[project.root_package().name.as_str()];
        if settings.run && root.build_settings.target_type == TargetType::Executable {
            let artifact = root_artifact.ok_or_else(|| {
                BuildError::planning("no executable was produced for the root package")
            })?;
            if settings.watch {
                return self.run_with_watch(project, settings, plan, artifact).await;
            }
            return run_target(settings, &root.build_settings, &artifact).await;
        }
        Ok(0)
    }

    /// Build every target, dependencies before dependents. Returns the root
    /// artifact path, if the root produces one.
    async fn build_all(
        &mut self,
        project: &Project,
        settings: &GeneratorSettings,
        plan: &Plan,
    ) -> Result<Option<PathBuf>> {
        let root_name = project.root_package().name.clone();
        let root_tt = plan.targets[root_name.as_str()].build_settings.target_type;

        let mut artifacts: HashMap<String, PathBuf> = HashMap::new();

        // rdmd compiles the whole dependency closure itself, and a static
        // library archive does not need its dependencies built first.
        let order = if settings.rdmd || root_tt == TargetType::StaticLibrary {
            vec![root_name.clone()]
        } else {
            build_order(&plan.targets, &root_name)
        };

        for name in &order {
            let artifact = self
                .build_target(project, settings, plan, name, &artifacts)
                .await?;
            if let Some(artifact) = artifact {
                artifacts.insert(name.clone(), artifact);
            }
        }

        Ok(artifacts.get(root_name.as_str()).cloned())
    }

    /// Build one target with its link-dependency artifacts resolved.
    async fn build_target(
        &mut self,
        project: &Project,
        settings: &GeneratorSettings,
        plan: &Plan,
        name: &str,
        artifacts: &HashMap<String, PathBuf>,
    ) -> Result<Option<PathBuf>> {
        let ti = &plan.targets[name];
        let pack = project
            .package(&ti.pack)
            .ok_or_else(|| BuildError::planning(format!("unknown package {}", ti.pack)))?;
        let mut bs = ti.build_settings.clone();

        // Link-dependency outputs become link inputs, except for static
        // libraries, which only track them for up-to-date checking.
        let mut additional_dep_files: Vec<PathBuf> = Vec::new();
        let do_link = bs.target_type != TargetType::StaticLibrary
            && !bs.options.contains(BuildOptions::SYNTAX_ONLY);
        for ldep in &ti.link_dependencies {
            let Some(dep_artifact) = artifacts.get(ldep.as_str()) else {
                continue;
            };
            if do_link && is_linker_file(dep_artifact) {
                bs.add_source_files(std::slice::from_ref(dep_artifact));
            } else {
                additional_dep_files.push(dep_artifact.clone());
            }
        }

        let (artifact, cached) = if settings.rdmd {
            (self.build_with_rdmd(project, settings, ti, pack, bs.clone()).await?, false)
        } else if settings.direct || bs.options.contains(BuildOptions::SYNTAX_ONLY) {
            let artifact = self
                .perform_direct_build(project, settings, ti, pack, bs.clone(), settings.temp_build)
                .await?;
            (artifact, false)
        } else {
            self.perform_cached_build(project, settings, ti, pack, bs.clone(), &additional_dep_files)
                .await?
        };

        if !cached {
            let env = hooks::hook_environment(project, settings, pack, &bs, &ti.config, &[]);
            hooks::run_hook("post-build", &bs.post_build_commands, &pack.path, &env).await;
        }

        Ok(artifact)
    }

    /// Default build strategy: compile into a build-ID-keyed cache directory
    /// under the package, then hard-link the artifact out.
    async fn perform_cached_build(
        &mut self,
        project: &Project,
        settings: &GeneratorSettings,
        ti: &TargetInfo,
        pack: &Package,
        mut bs: BuildSettings,
        additional_dep_files: &[PathBuf],
    ) -> Result<(Option<PathBuf>, bool)> {
        let build_id = cache::compute_build_id(&ti.config, &settings.build_type, &settings.platform, &bs);
        let cache_dir = pack.path.join(".dub").join("build").join(&build_id);

        let Some(file_name) = bs
            .target_type
            .output_file_name(&bs.target_name, &settings.platform)
        else {
            // Nothing is emitted; still run the compiler for its diagnostics.
            self.invoke_compiler(settings, &mut bs, None).await?;
            return Ok((None, false));
        };
        let cached_artifact = cache_dir.join(&file_name);
        let final_artifact = bs.target_path.join(&file_name);

        let inputs = up_to_date_inputs(project, ti, &bs, additional_dep_files);
        if !settings.force && cache::is_up_to_date(&cached_artifact, &inputs) {
            info!(
                "{} {}: target for configuration [{}] is up to date.",
                pack.name, pack.version, ti.config
            );
            debug!("Using existing build in {}.", cache_dir.display());
            hard_link_or_copy(&cached_artifact, &final_artifact)?;
            return Ok((Some(final_artifact), true));
        }

        if settings.temp_build || !is_writable_dir(&pack.path) {
            let artifact = self
                .perform_direct_build(project, settings, ti, pack, bs, true)
                .await?;
            return Ok((artifact, false));
        }

        std::fs::create_dir_all(&cache_dir).map_err(|e| BuildError::io(&cache_dir, e))?;

        let env = hooks::hook_environment(project, settings, pack, &bs, &ti.config, &[]);
        hooks::run_hook("pre-build", &bs.pre_build_commands, &pack.path, &env).await;

        info!("Building {} {} [{}]...", pack.name, pack.version, ti.config);
        let copy_dest = bs.target_path.clone();
        bs.target_path = cache_dir.clone();
        self.invoke_compiler(settings, &mut bs, Some(&cached_artifact))
            .await?;
        self.perform_copy_files(pack, &bs.copy_files, &copy_dest);

        hard_link_or_copy(&cached_artifact, &final_artifact)?;
        Ok((Some(final_artifact), false))
    }

    /// Build straight into the configured target path (or a tracked temp
    /// directory), bypassing the cache.
    async fn perform_direct_build(
        &mut self,
        project: &Project,
        settings: &GeneratorSettings,
        ti: &TargetInfo,
        pack: &Package,
        mut bs: BuildSettings,
        use_temp: bool,
    ) -> Result<Option<PathBuf>> {
        let cwd = std::env::current_dir().map_err(|e| BuildError::io(".", e))?;
        relativize_paths(&mut bs, &cwd);

        if use_temp {
            let base = std::env::temp_dir().join("dub");
            std::fs::create_dir_all(&base).map_err(|e| BuildError::io(&base, e))?;
            let tmp = tempfile::Builder::new()
                .tempdir_in(&base)
                .map_err(|e| BuildError::io(&base, e))?
                .into_path();
            self.temp_files.push(tmp.clone());
            bs.target_path = tmp;
        }

        let env = hooks::hook_environment(project, settings, pack, &bs, &ti.config, &[]);
        hooks::run_hook("pre-build", &bs.pre_build_commands, &pack.path, &env).await;

        info!("Building {} {} [{}]...", pack.name, pack.version, ti.config);
        let artifact = bs
            .target_type
            .output_file_name(&bs.target_name, &settings.platform)
            .map(|f| bs.target_path.join(f));
        self.invoke_compiler(settings, &mut bs, artifact.as_deref()).await?;
        let copy_dest = bs.target_path.clone();
        self.perform_copy_files(pack, &bs.copy_files, &copy_dest);

        if use_temp {
            if let Some(a) = &artifact {
                self.temp_files.push(a.clone());
            }
            for pattern in &bs.copy_files {
                if let Some(base) = Path::new(pattern).file_name() {
                    self.temp_files.push(bs.target_path.join(base));
                }
            }
        }
        Ok(artifact)
    }

    /// All-in-one build through rdmd, which chases imports itself.
    async fn build_with_rdmd(
        &mut self,
        project: &Project,
        settings: &GeneratorSettings,
        ti: &TargetInfo,
        pack: &Package,
        mut bs: BuildSettings,
    ) -> Result<Option<PathBuf>> {
        let main = bs.main_source_file.clone().ok_or_else(|| {
            BuildError::planning(format!(
                "{} has no main source file; rdmd requires one",
                pack.name
            ))
        })?;

        let env = hooks::hook_environment(project, settings, pack, &bs, &ti.config, &[]);
        hooks::run_hook("pre-build", &bs.pre_build_commands, &pack.path, &env).await;

        info!("Building {} {} [{}] with rdmd...", pack.name, pack.version, ti.config);

        let artifact = bs
            .target_type
            .output_file_name(&bs.target_name, &settings.platform)
            .map(|f| bs.target_path.join(f));

        bs.source_files.retain(|f| is_linker_file(f));
        settings.compiler.prepare_build_settings(
            &mut bs,
            &settings.platform,
            InvocationStyle::CommandLine,
        );

        let rdmd = rdmd_binary(&settings.platform.compiler_binary);
        let mut args = vec![
            "--build-only".to_string(),
            format!("--compiler={}", settings.platform.compiler_binary.display()),
        ];
        args.extend(bs.dflags.iter().cloned());
        if let Some(a) = &artifact {
            args.push(format!("-of{}", a.display()));
        }
        args.push(main.display().to_string());

        debug!("{} {}", rdmd.display(), args.join(" "));
        let status = tokio::process::Command::new(&rdmd)
            .args(&args)
            .status()
            .await
            .map_err(|e| BuildError::Spawn {
                program: rdmd.display().to_string(),
                source: e,
            })?;
        if !status.success() {
            return Err(BuildError::CompileFailed {
                target: bs.target_name.clone(),
                code: status.code().unwrap_or(-1),
            });
        }
        Ok(artifact)
    }

    /// Dispatch one target build across the three build modes.
    async fn invoke_compiler(
        &mut self,
        settings: &GeneratorSettings,
        bs: &mut BuildSettings,
        artifact: Option<&Path>,
    ) -> Result<()> {
        let platform = &settings.platform;
        let compiler = &settings.compiler;
        let has_binary = bs
            .target_type
            .output_file_name(&bs.target_name, platform)
            .is_some()
            && !bs.options.contains(BuildOptions::SYNTAX_ONLY);

        let all_at_once = settings.build_mode == BuildMode::AllAtOnce
            || compiler.name() != "dmd"
            || !has_binary
            || bs.target_type == TargetType::StaticLibrary;

        let result = if settings.build_mode == BuildMode::SingleFile {
            self.build_single_file(settings, bs.clone()).await
        } else if all_at_once {
            let mut b = bs.clone();
            compiler.prepare_build_settings(&mut b, platform, InvocationStyle::CommandLine);
            if has_binary {
                compiler.set_target(&mut b, platform, None);
            }
            compiler
                .invoke(&b, platform, settings.compile_callback.as_ref())
                .await
        } else {
            self.build_separate(settings, bs.clone()).await
        };

        if result.is_err() {
            if let Some(artifact) = artifact {
                let _ = std::fs::remove_file(artifact);
            }
        }
        result
    }

    /// Separate mode: compile all sources into one temporary object in the
    /// target directory, then link it.
    async fn build_separate(
        &mut self,
        settings: &GeneratorSettings,
        bs: BuildSettings,
    ) -> Result<()> {
        let platform = &settings.platform;
        let compiler = &settings.compiler;

        let obj_path = bs
            .target_path
            .join(format!("{}{}", bs.target_name, platform.obj_suffix()));

        let mut compile_bs = bs.clone();
        compile_bs.lflags.clear();
        compile_bs
            .source_files
            .retain(|f| !is_linker_file(f));
        compiler.prepare_build_settings(
            &mut compile_bs,
            platform,
            InvocationStyle::CommandLineSeparate,
        );
        compile_bs.target_type = TargetType::Object;
        compiler.set_target(&mut compile_bs, platform, Some(&obj_path));
        compiler
            .invoke(&compile_bs, platform, settings.compile_callback.as_ref())
            .await?;

        let mut link_bs = bs;
        link_bs.source_files.retain(|f| is_linker_file(f));
        compiler.prepare_build_settings(&mut link_bs, platform, InvocationStyle::CommandLineSeparate);
        compiler.set_target(&mut link_bs, platform, None);
        compiler
            .invoke_linker(
                &link_bs,
                platform,
                std::slice::from_ref(&obj_path),
                settings.link_callback.as_ref(),
            )
            .await
    }

    /// Single-file mode: every source compiles to its own object, optionally
    /// across a worker pool, then everything links in one step.
    async fn build_single_file(
        &mut self,
        settings: &GeneratorSettings,
        bs: BuildSettings,
    ) -> Result<()> {
        let platform = settings.platform.clone();
        let compiler = settings.compiler.clone();

        let sources: Vec<PathBuf> = bs
            .source_files
            .iter()
            .filter(|f| !is_linker_file(f))
            .cloned()
            .collect();
        let mut objects: Vec<PathBuf> = vec![PathBuf::new(); sources.len()];

        let mut template = bs.clone();
        template.source_files.clear();
        template.lflags.clear();
        compiler.prepare_build_settings(
            &mut template,
            &platform,
            InvocationStyle::CommandLineSeparate,
        );
        template.target_type = TargetType::Object;

        if settings.parallel_build && sources.len() > 1 {
            // Index-disjoint output slots; workers share nothing else.
            let workers = num_cpus::get().max(1);
            let mut join: JoinSet<(usize, Result<()>)> = JoinSet::new();
            let mut next = 0usize;
            let mut failure: Option<BuildError> = None;
            loop {
                while failure.is_none() && next < sources.len() && join.len() < workers {
                    let src = sources[next].clone();
                    let obj = bs.target_path.join(object_file_name(&src, &platform));
                    objects[next] = obj.clone();
                    let mut sbs = template.clone();
                    sbs.source_files = vec![src];
                    let compiler = compiler.clone();
                    let platform = platform.clone();
                    let cb = settings.compile_callback.clone();
                    let index = next;
                    join.spawn(async move {
                        compiler.set_target(&mut sbs, &platform, Some(&obj));
                        (index, compiler.invoke(&sbs, &platform, cb.as_ref()).await)
                    });
                    next += 1;
                }
                match join.join_next().await {
                    Some(Ok((_, Err(e)))) => {
                        failure.get_or_insert(e);
                    }
                    Some(Ok((_, Ok(())))) => {}
                    Some(Err(e)) => {
                        failure.get_or_insert(BuildError::planning(format!(
                            "compile worker panicked: {e}"
                        )));
                    }
                    None => break,
                }
            }
            if let Some(e) = failure {
                return Err(e);
            }
        } else {
            for (i, src) in sources.iter().enumerate() {
                let obj = bs.target_path.join(object_file_name(src, &platform));
                objects[i] = obj.clone();
                let mut sbs = template.clone();
                sbs.source_files = vec![src.clone()];
                compiler.set_target(&mut sbs, &platform, Some(&obj));
                compiler
                    .invoke(&sbs, &platform, settings.compile_callback.as_ref())
                    .await?;
            }
        }

        let mut link_bs = bs;
        link_bs.source_files.retain(|f| is_linker_file(f));
        compiler.prepare_build_settings(&mut link_bs, &platform, InvocationStyle::CommandLineSeparate);
        compiler.set_target(&mut link_bs, &platform, None);
        compiler
            .invoke_linker(&link_bs, &platform, &objects, settings.link_callback.as_ref())
            .await
    }

    /// Copy-file handling: wildcard patterns match against a recursive walk
    /// of the package; failures never abort the build.
    fn perform_copy_files(&mut self, pack: &Package, copy_files: &[String], dest: &Path) {
        for pattern in copy_files {
            let is_pattern = pattern.contains(['*', '?', '{', '[']);
            if is_pattern {
                let mut matched = false;
                for entry in WalkDir::new(&pack.path)
                    .into_iter()
                    .filter_map(|e| e.ok())
                    .filter(|e| e.file_type().is_file())
                {
                    let rel = match entry.path().strip_prefix(&pack.path) {
                        Ok(r) => r,
                        Err(_) => continue,
                    };
                    let rel_str = rel.to_string_lossy().replace('\\', "/");
                    if glob_match(pattern, &rel_str) {
                        matched = true;
                        copy_into(entry.path(), dest);
                    }
                }
                if !matched {
                    warn!("copyFiles pattern {pattern} matched nothing");
                }
            } else {
                let src = if Path::new(pattern).is_absolute() {
                    PathBuf::from(pattern)
                } else {
                    pack.path.join(pattern)
                };
                copy_into(&src, dest);
            }
        }
    }

    async fn run_post_generate_hooks(
        &mut self,
        project: &Project,
        settings: &GeneratorSettings,
        plan: &Plan,
    ) {
        let already_used = hooks::packages_already_used();
        for ti in plan.targets.values() {
            if ti.build_settings.post_generate_commands.is_empty() {
                continue;
            }
            if already_used.contains(&ti.pack) {
                debug!("suppressing recursive post-generate hook for {}", ti.pack);
                continue;
            }
            let Some(pack) = project.package(&ti.pack) else {
                continue;
            };
            let env =
                hooks::hook_environment(project, settings, pack, &ti.build_settings, &ti.config, &[]);
            hooks::run_hook(
                "post-generate",
                &ti.build_settings.post_generate_commands,
                &pack.path,
                &env,
            )
            .await;
        }
    }

    /// Run, observe, rebuild: the child and the watched sources are waited on
    /// together; a clean exit ends the loop, a change triggers a rebuild and
    /// respawn.
    async fn run_with_watch(
        &mut self,
        project: &Project,
        settings: &GeneratorSettings,
        plan: &Plan,
        mut artifact: PathBuf,
    ) -> Result<i32> {
        let mut watcher = FileWatcher::new()?;
        for ti in plan.targets.values() {
            let bs = &ti.build_settings;
            for file in bs
                .source_files
                .iter()
                .chain(bs.import_files.iter())
                .chain(bs.string_import_files.iter())
            {
                if file.exists() {
                    watcher.add_file(file)?;
                } else {
                    warn!("not watching missing file {}", file.display());
                }
            }
        }

        let root_bs = &plan.targets[project.root_package().name.as_str()].build_settings;
        loop {
            let mut child = spawn_target(settings, root_bs, &artifact)?;
            match watcher.wait_child(&mut child).await? {
                WaitOutcome::ChildExit(code) => return Ok(code),
                WaitOutcome::Changed => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    // Some networked filesystems report the change before the
                    // writer's data is visible.
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    watcher.read_changes();
                    loop {
                        match self.build_all(project, settings, plan).await {
                            Ok(Some(new_artifact)) => {
                                artifact = new_artifact;
                                break;
                            }
                            Ok(None) => {
                                return Err(BuildError::planning(
                                    "rebuild produced no executable",
                                ))
                            }
                            Err(e) => {
                                tracing::error!("Build failed: {e}. Waiting for changes...");
                                watcher.wait().await?;
                                tokio::time::sleep(Duration::from_millis(1)).await;
                                watcher.read_changes();
                            }
                        }
                    }
                }
            }
        }
    }
}

#[async_trait]
impl ProjectGenerator for BuildGenerator {
    async fn generate(&mut self, project: &Project, settings: &GeneratorSettings) -> Result<i32> {
        let plan = plan(project, settings).await?;
        let result = self.generate_inner(project, settings, &plan).await;
        self.cleanup();
        result
    }
}

/// Post-order walk over target dependencies: every target appears after all
/// of its dependencies.
fn build_order(targets: &IndexMap<String, TargetInfo>, root: &str) -> Vec<String> {
    fn visit(
        targets: &IndexMap<String, TargetInfo>,
        name: &str,
        seen: &mut Vec<String>,
        out: &mut Vec<String>,
    ) {
        if seen.iter().any(|s| s == name) {
            return;
        }
        seen.push(name.to_string());
        if let Some(ti) = targets.get(name) {
            for dep in &ti.dependencies {
                visit(targets, dep, seen, out);
            }
            out.push(name.to_string());
        }
    }
    let mut seen = Vec::new();
    let mut out = Vec::new();
    visit(targets, root, &mut seen, &mut out);
    out
}

/// Every file whose modification forces a rebuild of this target.
fn up_to_date_inputs(
    project: &Project,
    ti: &TargetInfo,
    bs: &BuildSettings,
    additional_dep_files: &[PathBuf],
) -> Vec<PathBuf> {
    let mut inputs: Vec<PathBuf> = Vec::new();
    inputs.extend(bs.source_files.iter().cloned());
    inputs.extend(bs.import_files.iter().cloned());
    inputs.extend(bs.string_import_files.iter().cloned());
    for pack_name in &ti.packages {
        if let Some(pack) = project.package(pack_name) {
            inputs.push(pack.recipe_path.clone());
        }
    }
    inputs.extend(additional_dep_files.iter().cloned());
    if ti.pack == project.root_package().name {
        if let Some(manifest) = project.selections_path() {
            inputs.push(manifest.to_path_buf());
        }
    }
    inputs
}

fn is_writable_dir(dir: &Path) -> bool {
    tempfile::Builder::new()
        .prefix(".dub-probe")
        .tempfile_in(dir)
        .is_ok()
}

fn hard_link_or_copy(src: &Path, dst: &Path) -> Result<()> {
    if src == dst {
        return Ok(());
    }
    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent).map_err(|e| BuildError::io(parent, e))?;
    }
    if dst.exists() {
        std::fs::remove_file(dst).map_err(|e| BuildError::io(dst, e))?;
    }
    if std::fs::hard_link(src, dst).is_err() {
        std::fs::copy(src, dst).map_err(|e| BuildError::io(dst, e))?;
    }
    Ok(())
}

/// Copy one file or directory below `target_dir`, hard-linking where the
/// filesystem allows. Failures only warn.
fn copy_into(src: &Path, target_dir: &Path) {
    let Some(base) = src.file_name() else {
        return;
    };
    let dst = target_dir.join(base);
    let result = if src.is_dir() {
        copy_dir_recursive(src, &dst)
    } else {
        hard_link_or_copy(src, &dst)
    };
    if let Err(e) = result {
        warn!("failed to copy {}: {e}", src.display());
    }
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    std::fs::create_dir_all(dst).map_err(|e| BuildError::io(dst, e))?;
    for entry in WalkDir::new(src).min_depth(1).into_iter().filter_map(|e| e.ok()) {
        let rel = entry
            .path()
            .strip_prefix(src)
            .expect("walkdir yields children of its root");
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target).map_err(|e| BuildError::io(&target, e))?;
        } else {
            hard_link_or_copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Wildcard match supporting `*`, `?` and `[...]` classes; separators are
/// never crossed by a wildcard.
fn glob_match(pattern: &str, text: &str) -> bool {
    fn inner(p: &[char], t: &[char]) -> bool {
        match p.split_first() {
            None => t.is_empty(),
            Some(('*', rest)) => {
                for skip in 0..=t.len() {
                    if skip > 0 && t[skip - 1] == '/' {
                        break;
                    }
                    if inner(rest, &t[skip..]) {
                        return true;
                    }
                }
                false
            }
            Some(('?', rest)) => match t.split_first() {
                Some((c, trest)) if *c != '/' => inner(rest, trest),
                _ => false,
            },
            Some(('[', rest)) => {
                let Some(close) = rest.iter().position(|c| *c == ']') else {
                    return matches!(t.split_first(), Some(('[', _)))
                        && inner(rest, &t[1..]);
                };
                let (class, after) = rest.split_at(close);
                match t.split_first() {
                    Some((c, trest)) if class.contains(c) => inner(&after[1..], trest),
                    _ => false,
                }
            }
            Some((c, rest)) => match t.split_first() {
                Some((tc, trest)) if tc == c => inner(rest, trest),
                _ => false,
            },
        }
    }
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    inner(&p, &t)
}

/// Filename-safe object name for a source compiled beside unrelated sources:
/// the normalized absolute path with separators turned into dots.
fn object_file_name(source: &Path, platform: &crate::types::BuildPlatform) -> String {
    let abs = if source.is_absolute() {
        source.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|c| c.join(source))
            .unwrap_or_else(|_| source.to_path_buf())
    };
    let mut name = String::new();
    for comp in abs.components() {
        use std::path::Component;
        match comp {
            Component::RootDir | Component::Prefix(_) => {}
            Component::Normal(part) => {
                if !name.is_empty() {
                    name.push('.');
                }
                name.push_str(&part.to_string_lossy());
            }
            _ => {}
        }
    }
    name.push_str(platform.obj_suffix());
    name
}

fn rdmd_binary(compiler_binary: &Path) -> PathBuf {
    let name = if cfg!(windows) { "rdmd.exe" } else { "rdmd" };
    compiler_binary
        .parent()
        .map(|dir| dir.join(name))
        .filter(|p| p.exists())
        .unwrap_or_else(|| PathBuf::from(name))
}

/// Shorten command lines by making every path relative to the working
/// directory where possible.
fn relativize_paths(bs: &mut BuildSettings, cwd: &Path) {
    fn relativize(p: &mut PathBuf, cwd: &Path) {
        if let Ok(rel) = p.strip_prefix(cwd) {
            if rel != Path::new("") {
                *p = rel.to_path_buf();
            }
        }
    }
    for list in [
        &mut bs.source_files,
        &mut bs.import_files,
        &mut bs.string_import_files,
        &mut bs.import_paths,
        &mut bs.string_import_paths,
    ] {
        for p in list.iter_mut() {
            relativize(p, cwd);
        }
    }
    if let Some(main) = bs.main_source_file.as_mut() {
        relativize(main, cwd);
    }
}

fn spawn_target(
    settings: &GeneratorSettings,
    bs: &BuildSettings,
    artifact: &Path,
) -> Result<tokio::process::Child> {
    let exe = normalize_exe_path(artifact);
    let mut cmd = tokio::process::Command::new(&exe);
    cmd.args(&settings.run_args);
    if bs.working_directory != PathBuf::new() {
        cmd.current_dir(&bs.working_directory);
    }
    cmd.spawn().map_err(|e| BuildError::Spawn {
        program: exe.display().to_string(),
        source: e,
    })
}

/// A bare file name would be looked up on PATH; anchor it to the current
/// directory instead.
fn normalize_exe_path(artifact: &Path) -> PathBuf {
    if artifact.is_absolute() || artifact.components().count() > 1 {
        artifact.to_path_buf()
    } else {
        Path::new(".").join(artifact)
    }
}

/// Run the built executable in its working directory and hand back its exit
/// code.
async fn run_target(
    settings: &GeneratorSettings,
    bs: &BuildSettings,
    artifact: &Path,
) -> Result<i32> {
    let exe = normalize_exe_path(artifact);
    info!(
        "Running {} {}",
        exe.display(),
        settings
            .run_args
            .iter()
            .map(|a| hooks::escape_shell_arg(a))
            .collect::<Vec<_>>()
            .join(" ")
    );
    let mut cmd = tokio::process::Command::new(&exe);
    cmd.args(&settings.run_args);
    if bs.working_directory != PathBuf::new() {
        cmd.current_dir(&bs.working_directory);
    }
    if let Some(cb) = &settings.run_callback {
        let out = cmd.output().await.map_err(|e| BuildError::Spawn {
            program: exe.display().to_string(),
            source: e,
        })?;
        let mut text = String::from_utf8_lossy(&out.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&out.stderr));
        let code = out.status.code().unwrap_or(-1);
        cb(code, &text);
        Ok(code)
    } else {
        let status = cmd.status().await.map_err(|e| BuildError::Spawn {
            program: exe.display().to_string(),
            source: e,
        })?;
        let code = status.code().unwrap_or(-1);
        if code != 0 {
            return Err(BuildError::RunFailed {
                program: exe.display().to_string(),
                code,
            });
        }
        Ok(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_matches_within_a_directory() {
        assert!(glob_match("assets/*.png", "assets/logo.png"));
        assert!(!glob_match("assets/*.png", "assets/sub/logo.png"));
        assert!(glob_match("data/config.?", "data/config.d"));
        assert!(glob_match("[ab]*.txt", "a1.txt"));
        assert!(!glob_match("[ab]*.txt", "c1.txt"));
    }

    #[test]
    fn object_names_flatten_the_path() {
        let platform = crate::types::BuildPlatform {
            platform: vec!["linux".to_string()],
            architecture: vec!["x86_64".to_string()],
            compiler: "dmd".to_string(),
            compiler_binary: PathBuf::from("dmd"),
            frontend_version: 2108,
        };
        let name = object_file_name(Path::new("/home/me/proj/source/app.d"), &platform);
        assert_eq!(name, "home.me.proj.source.app.d.o");
    }

    #[test]
    fn bare_executables_are_anchored() {
        assert_eq!(normalize_exe_path(Path::new("app")), PathBuf::from("./app"));
        assert_eq!(
            normalize_exe_path(Path::new("/abs/app")),
            PathBuf::from("/abs/app")
        );
    }
}
