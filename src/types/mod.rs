pub mod platform;
pub mod settings;

pub use platform::BuildPlatform;
pub use settings::{BuildOptions, BuildSettings, TargetType};
