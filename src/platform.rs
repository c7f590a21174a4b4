//! Names of the cooked content flavours a running game can mount.

use strum::{EnumString, IntoStaticStr, VariantArray};
use tracing::info;

use crate::Config;
use crate::level_streaming::StreamingWorld;

use Platform::*;
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, IntoStaticStr, VariantArray)]
pub enum Platform {
    Windows,
    Mac,
    Linux,
    Android,
    IOS,
    HTML5,
    PS4,
    XboxOne,
}
impl clap::ValueEnum for Platform {
    fn value_variants<'a>() -> &'a [Self] {
        Self::VARIANTS
    }
    fn to_possible_value(&self) -> Option<clap::builder::PossibleValue> {
        let name: &'static str = self.into();
        Some(clap::builder::PossibleValue::new(name))
    }
}

impl Platform {
    pub fn host() -> Self {
        match std::env::consts::OS {
            "windows" => Windows,
            "macos" => Mac,
            "android" => Android,
            "ios" => IOS,
            _ => Linux,
        }
    }
    pub fn name(self) -> &'static str {
        self.into()
    }
    /// Desktop platforms cook as `<Name>NoEditor`.
    pub fn cooked_name(self) -> String {
        match self {
            Windows | Mac | Linux => format!("{}NoEditor", self.name()),
            _ => self.name().to_string(),
        }
    }
}

fn is_editor_world(world: &StreamingWorld) -> bool {
    world.is_play_in_editor() || !world.streaming_levels_prefix().is_empty()
}

/// `Editor` for play-in-editor worlds, `<cooked platform>_<engine version>`
/// for everything else.
pub fn cooked_platform_name_for(world: &StreamingWorld, platform: Platform, engine_version: &str) -> String {
    if is_editor_world(world) {
        return "Editor".to_string();
    }
    info!(target: "pakloader", "Engine version: {engine_version}");
    format!("{}_{engine_version}", platform.cooked_name())
}

pub fn cooked_platform_name(world: &StreamingWorld, engine_version: &str) -> String {
    cooked_platform_name_for(world, Platform::host(), engine_version)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookedPlatforms {
    /// Empty when uncooked content works on every version.
    pub engine_version: String,
    pub platforms: Vec<String>,
}

pub fn cooked_platform_names(world: &StreamingWorld, config: &Config) -> CookedPlatforms {
    if is_editor_world(world) {
        return CookedPlatforms {
            engine_version: String::new(),
            platforms: vec!["Editor".to_string()],
        };
    }
    let platforms = if config.target_platforms.is_empty() {
        vec![Platform::host().cooked_name()]
    } else {
        config.target_platforms.clone()
    };
    info!(target: "pakloader", "Cooked engine version: {}", config.engine_version);
    for platform in &platforms {
        info!(target: "pakloader", "Cooked target: {platform}");
    }
    CookedPlatforms {
        engine_version: config.engine_version.clone(),
        platforms,
    }
}
