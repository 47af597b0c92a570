use async_trait::async_trait;
use dubcore::compiler::{Compiler, DmdCompiler, InvocationStyle, OutputCallback};
use dubcore::error::Result;
use dubcore::{
    create_generator, BuildPlatform, BuildSettings, Dependency, GeneratorSettings, Package,
    PackageRecipe, Project, TargetType,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Stand-in driver: translates settings exactly like the real one but
/// fabricates the output file instead of running a compiler.
struct FakeCompiler {
    inner: DmdCompiler,
    compiles: AtomicUsize,
    links: AtomicUsize,
    command_lines: Mutex<Vec<Vec<String>>>,
}

impl FakeCompiler {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: DmdCompiler::new(),
            compiles: AtomicUsize::new(0),
            links: AtomicUsize::new(0),
            command_lines: Mutex::new(Vec::new()),
        })
    }

    fn output_path(args: &[String]) -> Option<PathBuf> {
        args.iter()
            .find_map(|f| f.strip_prefix("-of").map(PathBuf::from))
    }

    fn record_and_touch(&self, args: Vec<String>) -> Result<()> {
        if let Some(out) = Self::output_path(&args) {
            if let Some(parent) = out.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(&out, b"artifact").unwrap();
        }
        self.command_lines.lock().unwrap().push(args);
        Ok(())
    }

    fn total_invocations(&self) -> usize {
        self.compiles.load(Ordering::SeqCst) + self.links.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Compiler for FakeCompiler {
    fn name(&self) -> &'static str {
        "dmd"
    }

    fn prepare_build_settings(
        &self,
        settings: &mut BuildSettings,
        platform: &BuildPlatform,
        style: InvocationStyle,
    ) {
        self.inner.prepare_build_settings(settings, platform, style);
    }

    fn set_target(
        &self,
        settings: &mut BuildSettings,
        platform: &BuildPlatform,
        obj_path: Option<&Path>,
    ) {
        self.inner.set_target(settings, platform, obj_path);
    }

    async fn invoke(
        &self,
        settings: &BuildSettings,
        _platform: &BuildPlatform,
        _output: Option<&OutputCallback>,
    ) -> Result<()> {
        self.compiles.fetch_add(1, Ordering::SeqCst);
        let mut args = settings.dflags.clone();
        args.extend(settings.source_files.iter().map(|s| s.display().to_string()));
        self.record_and_touch(args)
    }

    async fn invoke_linker(
        &self,
        settings: &BuildSettings,
        _platform: &BuildPlatform,
        objects: &[PathBuf],
        _output: Option<&OutputCallback>,
    ) -> Result<()> {
        self.links.fetch_add(1, Ordering::SeqCst);
        let mut args = settings.dflags.clone();
        args.extend(objects.iter().map(|o| o.display().to_string()));
        args.extend(settings.source_files.iter().map(|s| s.display().to_string()));
        self.record_and_touch(args)
    }

    fn extract_build_options(&self, settings: &mut BuildSettings) {
        self.inner.extract_build_options(settings);
    }
}

fn platform() -> BuildPlatform {
    BuildPlatform {
        platform: vec!["linux".to_string(), "posix".to_string()],
        architecture: vec!["x86_64".to_string()],
        compiler: "dmd".to_string(),
        compiler_binary: PathBuf::from("dmd"),
        frontend_version: 2108,
    }
}

struct Fixture {
    _dir: TempDir,
    root: PathBuf,
    out: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("proj");
        let out = dir.path().join("out");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::create_dir_all(&out).unwrap();
        Self {
            _dir: dir,
            root,
            out,
        }
    }

    /// Create a package directory with one source file per name given.
    fn package(&self, name: &str, deps: &[&str], tt: TargetType) -> Package {
        let dir = self.root.join(name);
        let source_dir = dir.join("source");
        std::fs::create_dir_all(&source_dir).unwrap();
        let source = source_dir.join(format!("{name}.d"));
        std::fs::write(&source, format!("module {name};\n")).unwrap();
        let recipe_path = dir.join("dub.json");
        std::fs::write(&recipe_path, "{}").unwrap();

        let main = if tt == TargetType::Executable {
            Some(source.clone())
        } else {
            None
        };
        Package {
            name: name.to_string(),
            version: "1.0.0".to_string(),
            path: dir,
            recipe_path,
            dependencies: deps
                .iter()
                .map(|d| {
                    (
                        d.to_string(),
                        Dependency {
                            version_spec: "*".to_string(),
                            optional: false,
                        },
                    )
                })
                .collect::<BTreeMap<_, _>>(),
            recipe: PackageRecipe {
                base: BuildSettings {
                    target_type: tt,
                    target_path: self.out.clone(),
                    main_source_file: main,
                    source_files: vec![source],
                    ..Default::default()
                },
                configurations: Default::default(),
            },
        }
    }

    fn settings(&self, compiler: Arc<FakeCompiler>) -> GeneratorSettings {
        GeneratorSettings::new(platform(), compiler)
    }
}

async fn build(project: &Project, settings: &GeneratorSettings) -> Result<i32> {
    let mut generator = create_generator("build").unwrap();
    generator.generate(project, settings).await
}

#[tokio::test]
async fn trivial_executable_builds_into_the_cache() {
    let fx = Fixture::new();
    let project = Project::new(fx.package("foo", &[], TargetType::Executable), vec![]);
    let compiler = FakeCompiler::new();
    let settings = fx.settings(compiler.clone());

    build(&project, &settings).await.unwrap();

    // One cache entry under the package, artifact linked into the target path.
    let cache_root = fx.root.join("foo").join(".dub").join("build");
    let entries: Vec<_> = std::fs::read_dir(&cache_root)
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    assert_eq!(entries.len(), 1);
    assert!(entries[0].join("foo").is_file());
    assert!(fx.out.join("foo").is_file());
    // Separate mode: one compile, one link.
    assert_eq!(compiler.compiles.load(Ordering::SeqCst), 1);
    assert_eq!(compiler.links.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn second_build_is_a_cache_hit() {
    let fx = Fixture::new();
    let project = Project::new(fx.package("foo", &[], TargetType::Executable), vec![]);
    let compiler = FakeCompiler::new();
    let settings = fx.settings(compiler.clone());

    build(&project, &settings).await.unwrap();
    let after_first = compiler.total_invocations();
    build(&project, &settings).await.unwrap();

    assert_eq!(compiler.total_invocations(), after_first);
    assert!(fx.out.join("foo").is_file());
}

#[tokio::test]
async fn force_invalidates_the_cache() {
    let fx = Fixture::new();
    let project = Project::new(fx.package("foo", &[], TargetType::Executable), vec![]);
    let compiler = FakeCompiler::new();
    let mut settings = fx.settings(compiler.clone());

    build(&project, &settings).await.unwrap();
    let after_first = compiler.total_invocations();

    settings.force = true;
    build(&project, &settings).await.unwrap();
    assert!(compiler.total_invocations() > after_first);
}

#[tokio::test]
async fn changed_source_triggers_a_rebuild() {
    let fx = Fixture::new();
    let project = Project::new(fx.package("foo", &[], TargetType::Executable), vec![]);
    let compiler = FakeCompiler::new();
    let settings = fx.settings(compiler.clone());

    build(&project, &settings).await.unwrap();
    let after_first = compiler.total_invocations();

    // Stamp the source newer than the cached artifact.
    let source = fx.root.join("foo").join("source").join("foo.d");
    let f = std::fs::OpenOptions::new().write(true).open(&source).unwrap();
    f.set_modified(std::time::SystemTime::now() + std::time::Duration::from_secs(0))
        .unwrap();
    let cache_root = fx.root.join("foo").join(".dub").join("build");
    let entry = std::fs::read_dir(&cache_root).unwrap().next().unwrap().unwrap();
    let artifact = entry.path().join("foo");
    let a = std::fs::OpenOptions::new().write(true).open(&artifact).unwrap();
    a.set_modified(std::time::SystemTime::now() - std::time::Duration::from_secs(600))
        .unwrap();

    build(&project, &settings).await.unwrap();
    assert!(compiler.total_invocations() > after_first);
}

#[tokio::test]
async fn dependencies_build_before_dependents() {
    let fx = Fixture::new();
    let project = Project::new(
        fx.package("app", &["libx"], TargetType::Executable),
        vec![fx.package("libx", &[], TargetType::Library)],
    );
    let compiler = FakeCompiler::new();
    let settings = fx.settings(compiler.clone());

    build(&project, &settings).await.unwrap();

    let lines = compiler.command_lines.lock().unwrap();
    let libx_build = lines
        .iter()
        .position(|args| args.iter().any(|a| a.ends_with("liblibx.a")))
        .expect("libx was never built");
    let app_link = lines
        .iter()
        .position(|args| {
            args.iter().any(|a| a.starts_with("-of") && a.ends_with("/app"))
                && args.iter().any(|a| a.contains("liblibx.a"))
        })
        .expect("app was never linked against libx");
    assert!(libx_build < app_link);
    // The dependency's artifact feeds the dependent's link line.
    assert!(fx.out.join("liblibx.a").is_file());
    assert!(fx.out.join("app").is_file());
}

#[tokio::test]
async fn static_library_root_skips_dependency_builds() {
    let fx = Fixture::new();
    let project = Project::new(
        fx.package("mylib", &["dep"], TargetType::Library),
        vec![fx.package("dep", &[], TargetType::Library)],
    );
    let compiler = FakeCompiler::new();
    let settings = fx.settings(compiler.clone());

    build(&project, &settings).await.unwrap();

    // Only the root archive is produced.
    assert!(fx.out.join("libmylib.a").is_file());
    assert!(!fx.out.join("libdep.a").exists());
}

#[tokio::test]
async fn direct_build_bypasses_the_cache() {
    let fx = Fixture::new();
    let project = Project::new(fx.package("foo", &[], TargetType::Executable), vec![]);
    let compiler = FakeCompiler::new();
    let mut settings = fx.settings(compiler.clone());
    settings.direct = true;

    build(&project, &settings).await.unwrap();

    assert!(fx.out.join("foo").is_file());
    assert!(!fx.root.join("foo").join(".dub").exists());
}

#[tokio::test]
async fn single_file_mode_compiles_each_source_separately() {
    let fx = Fixture::new();
    let mut root = fx.package("foo", &[], TargetType::Executable);
    // Add a second source file.
    let extra = fx.root.join("foo").join("source").join("util.d");
    std::fs::write(&extra, "module util;\n").unwrap();
    root.recipe.base.source_files.push(extra);
    let project = Project::new(root, vec![]);

    let compiler = FakeCompiler::new();
    let mut settings = fx.settings(compiler.clone());
    settings.build_mode = dubcore::BuildMode::SingleFile;

    build(&project, &settings).await.unwrap();

    // Two per-source compiles plus one link.
    assert_eq!(compiler.compiles.load(Ordering::SeqCst), 2);
    assert_eq!(compiler.links.load(Ordering::SeqCst), 1);
    let lines = compiler.command_lines.lock().unwrap();
    let link_args = lines.last().unwrap();
    assert!(link_args.iter().any(|a| a.ends_with(".d.o")));
}

#[tokio::test]
async fn copy_files_land_next_to_the_artifact() {
    let fx = Fixture::new();
    let mut root = fx.package("foo", &[], TargetType::Executable);
    let assets = fx.root.join("foo").join("assets");
    std::fs::create_dir_all(&assets).unwrap();
    std::fs::write(assets.join("banner.txt"), "hi").unwrap();
    std::fs::write(assets.join("skip.dat"), "no").unwrap();
    root.recipe.base.copy_files.push("assets/*.txt".to_string());
    let project = Project::new(root, vec![]);

    let compiler = FakeCompiler::new();
    let settings = fx.settings(compiler.clone());
    build(&project, &settings).await.unwrap();

    assert!(fx.out.join("banner.txt").is_file());
    assert!(!fx.out.join("skip.dat").exists());
}

#[cfg(unix)]
#[tokio::test]
async fn pre_build_commands_see_the_hook_environment() {
    let fx = Fixture::new();
    let mut root = fx.package("foo", &[], TargetType::Executable);
    root.recipe
        .base
        .pre_build_commands
        .push("printf '%s' \"$DUB_PACKAGE\" > hook.out".to_string());
    let project = Project::new(root, vec![]);

    let compiler = FakeCompiler::new();
    let settings = fx.settings(compiler.clone());
    build(&project, &settings).await.unwrap();

    let out = std::fs::read_to_string(fx.root.join("foo").join("hook.out")).unwrap();
    assert_eq!(out, "foo");
}

#[tokio::test]
async fn failed_hook_does_not_abort_the_build() {
    let fx = Fixture::new();
    let mut root = fx.package("foo", &[], TargetType::Executable);
    root.recipe.base.pre_build_commands.push("exit 3".to_string());
    let project = Project::new(root, vec![]);

    let compiler = FakeCompiler::new();
    let settings = fx.settings(compiler.clone());
    build(&project, &settings).await.unwrap();
    assert!(fx.out.join("foo").is_file());
}

#[tokio::test]
async fn build_ids_separate_configurations() {
    let fx = Fixture::new();
    let project = Project::new(fx.package("foo", &[], TargetType::Executable), vec![]);
    let compiler = FakeCompiler::new();
    let mut settings = fx.settings(compiler.clone());

    build(&project, &settings).await.unwrap();
    settings.build_type = "release".to_string();
    build(&project, &settings).await.unwrap();

    let cache_root = fx.root.join("foo").join(".dub").join("build");
    let entries: Vec<String> = std::fs::read_dir(&cache_root)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().any(|e| e.contains("-debug-")));
    assert!(entries.iter().any(|e| e.contains("-release-")));
}
