use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

use crate::metadata::{DEFAULT_SUBTITLE_FORMAT, DEFAULT_TITLE_FORMAT};

#[derive(Debug, Deserialize)]
pub struct Settings {
    /// Serial device the display is attached to.
    #[serde(default = "default_port")]
    pub port: String,
    /// Fetch now-playing metadata from the session media player; when off,
    /// the display shows a clock instead.
    #[serde(default = "default_use_metadata")]
    pub use_metadata: bool,
    /// strftime pattern for the clock title line.
    #[serde(default = "default_title_format")]
    pub title_format: String,
    /// strftime pattern for the clock subtitle line.
    #[serde(default = "default_subtitle_format")]
    pub subtitle_format: String,
}

fn default_port() -> String {
    "/dev/ttyACM0".to_string()
}

fn default_use_metadata() -> bool {
    true
}

fn default_title_format() -> String {
    DEFAULT_TITLE_FORMAT.to_string()
}

fn default_subtitle_format() -> String {
    DEFAULT_SUBTITLE_FORMAT.to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port: default_port(),
            use_metadata: default_use_metadata(),
            title_format: default_title_format(),
            subtitle_format: default_subtitle_format(),
        }
    }
}

impl Settings {
    pub fn load() -> Self {
        let path = Self::config_path();
        if !path.exists() {
            return Self::default();
        }

        match fs::read_to_string(&path) {
            Ok(content) => Self::parse(&content),
            Err(_) => Self::default(),
        }
    }

    fn parse(content: &str) -> Self {
        toml::from_str(content).unwrap_or_default()
    }

    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("glowcast")
            .join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_gives_defaults() {
        let settings = Settings::parse("");
        assert_eq!(settings.port, "/dev/ttyACM0");
        assert!(settings.use_metadata);
        assert_eq!(settings.title_format, "%I:%M %p");
        assert_eq!(settings.subtitle_format, "%a, %x");
    }

    #[test]
    fn partial_config_overrides_only_named_keys() {
        let settings = Settings::parse("port = \"/dev/ttyUSB1\"\nuse_metadata = false\n");
        assert_eq!(settings.port, "/dev/ttyUSB1");
        assert!(!settings.use_metadata);
        assert_eq!(settings.title_format, "%I:%M %p");
    }

    #[test]
    fn malformed_config_falls_back_to_defaults() {
        let settings = Settings::parse("port = [this is not toml");
        assert_eq!(settings.port, "/dev/ttyACM0");
    }
}
