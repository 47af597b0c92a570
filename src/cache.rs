//! Content-keyed build identification and mtime-based up-to-date checking.
//!
//! The build-ID digests everything that changes the bytes the compiler emits;
//! source and import file contents deliberately stay out of the key because
//! they feed the up-to-date check via modification times instead.

use crate::types::{BuildPlatform, BuildSettings};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, warn};

fn feed(hasher: &mut Sha256, item: &str) {
    hasher.update(item.as_bytes());
    hasher.update([0u8]);
}

/// Derive the cache directory name for one target build:
/// `<config>-<buildType>-<platform>-<arch>-<compiler>_<frontend>-<hexdigest>`.
pub fn compute_build_id(
    config: &str,
    build_type: &str,
    platform: &BuildPlatform,
    settings: &BuildSettings,
) -> String {
    let mut hasher = Sha256::new();
    feed(&mut hasher, config);
    for tag in &platform.platform {
        feed(&mut hasher, tag);
    }
    for tag in &platform.architecture {
        feed(&mut hasher, tag);
    }
    feed(&mut hasher, &platform.compiler);
    feed(&mut hasher, &platform.frontend_version.to_string());
    for v in &settings.versions {
        feed(&mut hasher, v);
    }
    for v in &settings.debug_versions {
        feed(&mut hasher, v);
    }
    for f in &settings.dflags {
        feed(&mut hasher, f);
    }
    for f in &settings.lflags {
        feed(&mut hasher, f);
    }
    feed(&mut hasher, &settings.options.bits().to_string());
    for p in &settings.string_import_paths {
        feed(&mut hasher, &p.display().to_string());
    }
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        hex.push_str(&format!("{byte:02x}"));
    }
    format!(
        "{}-{}-{}-{}-{}_{}-{}",
        config,
        build_type,
        platform.platform_tag(),
        platform.arch_tag(),
        platform.compiler,
        platform.frontend_version,
        hex
    )
}

/// Decide whether a cached artifact is newer than all of its input files.
///
/// A missing input forces a rebuild (which then fails cleanly in the
/// compiler); an input stamped in the future is reported but does not force
/// one.
pub fn is_up_to_date(artifact: &Path, inputs: &[PathBuf]) -> bool {
    let artifact_mtime = match std::fs::metadata(artifact).and_then(|m| m.modified()) {
        Ok(t) => t,
        Err(_) => {
            debug!("no cached artifact at {}", artifact.display());
            return false;
        }
    };
    let now = SystemTime::now();
    for input in inputs {
        let mtime = match std::fs::metadata(input).and_then(|m| m.modified()) {
            Ok(t) => t,
            Err(_) => {
                debug!("input {} missing, rebuilding", input.display());
                return false;
            }
        };
        if mtime > now {
            warn!(
                "modification time of {} is in the future, check the system clock",
                input.display()
            );
            continue;
        }
        if mtime > artifact_mtime {
            debug!("{} is newer than {}", input.display(), artifact.display());
            return false;
        }
    }
    true
}
