use std::{
    fs::File,
    io::Read,
    path::{Path, PathBuf},
};

use anyhow::Context;
use serde::Deserialize;

use crate::app::Cli;

const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct MediaLayout {
    pub rate: f64,
    pub paused: bool,
}

impl Default for MediaLayout {
    fn default() -> Self {
        Self {
            rate: 1.0,
            paused: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct FrameLayout {
    pub positioned_player: bool,

    pub media: Vec<MediaLayout>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub preferences: Option<PathBuf>,

    pub frames: Vec<FrameLayout>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            preferences: None,
            frames: vec![FrameLayout {
                positioned_player: false,
                media: vec![MediaLayout::default()],
            }],
        }
    }
}

impl Config {
    pub fn read(file: &mut impl Read) -> anyhow::Result<Self> {
        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .context("Failed to read config file")?;

        let config: Self = toml::from_str(&contents).context("Failed to parse config file")?;
        if config.frames.is_empty() {
            anyhow::bail!("Config must describe at least the top-level frame");
        }
        Ok(config)
    }

    pub fn read_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let mut file = File::open(path).context("Failed to open config file")?;
        Self::read(&mut file)
    }

    pub fn from_cli_args(args: &Cli) -> anyhow::Result<Self> {
        let mut config = match &args.config {
            Some(config_path) => Self::read_path(config_path)?,
            None => {
                let default_config = PathBuf::from(DEFAULT_CONFIG_PATH);
                if default_config.exists() {
                    log::info!("Using default config file {DEFAULT_CONFIG_PATH}");
                    Self::read_path(default_config)?
                } else {
                    log::warn!("No config file found; using a single frame with one video");
                    Config::default()
                }
            }
        };
        if let Some(preferences) = &args.preferences {
            config.preferences = Some(preferences.clone());
        }
        Ok(config)
    }
}
