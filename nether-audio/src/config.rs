//! Audio configuration (~/.config/Nethercore/audio.toml)
//!
//! [`AudioConfig`] is the persisted, sectioned form. The engine consumes the
//! flattened [`AudioSettings`] view, and compares two of them to decide
//! whether a change needs a pipeline reconfigure or can be applied live.

use std::path::{Path, PathBuf};

use nether_pcm::RawCodec;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const CONFIG_FILE: &str = "audio.toml";

/// Persisted audio configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AudioConfig {
    /// PCM output settings
    #[serde(default)]
    pub output: OutputConfig,
    /// Bitstream passthrough settings
    #[serde(default)]
    pub passthrough: PassthroughConfig,
    /// Rarely needed overrides
    #[serde(default)]
    pub advanced: AdvancedConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Output device name (default: "default")
    #[serde(default = "default_device")]
    pub device: String,
    /// Forced channel setting, 0..=10 (default: 1, stereo)
    #[serde(default = "default_channels")]
    pub channels: u8,
    /// Spread stereo sources over all forced channels (default: false)
    #[serde(default)]
    pub stereo_upmix: bool,
    /// Master volume (default: 1.0, range: 0.0-1.0)
    #[serde(default = "default_volume")]
    pub master_volume: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassthroughConfig {
    /// Device used for bitstream output (default: "default")
    #[serde(default = "default_device")]
    pub device: String,
    #[serde(default)]
    pub ac3: bool,
    #[serde(default)]
    pub eac3: bool,
    #[serde(default)]
    pub dts: bool,
    #[serde(default)]
    pub dtshd: bool,
    #[serde(default)]
    pub truehd: bool,
    /// The receiver accepts multichannel LPCM (default: true)
    #[serde(default = "default_true")]
    pub multichannel_lpcm: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AdvancedConfig {
    /// Open the sink at this rate regardless of the source
    #[serde(default)]
    pub forced_sample_rate: Option<u32>,
}

fn default_device() -> String {
    "default".to_string()
}
fn default_channels() -> u8 {
    1
}
fn default_volume() -> f32 {
    1.0
}
fn default_true() -> bool {
    true
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            device: default_device(),
            channels: default_channels(),
            stereo_upmix: false,
            master_volume: default_volume(),
        }
    }
}

impl Default for PassthroughConfig {
    fn default() -> Self {
        Self {
            device: default_device(),
            ac3: false,
            eac3: false,
            dts: false,
            dtshd: false,
            truehd: false,
            multichannel_lpcm: default_true(),
        }
    }
}

/// Flattened settings as seen by the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioSettings {
    pub device: String,
    pub channels: u8,
    pub stereo_upmix: bool,
    pub master_volume: f32,
    pub passthrough_device: String,
    pub ac3_passthrough: bool,
    pub eac3_passthrough: bool,
    pub dts_passthrough: bool,
    pub dtshd_passthrough: bool,
    pub truehd_passthrough: bool,
    pub multichannel_lpcm: bool,
    pub forced_sample_rate: Option<u32>,
}

impl Default for AudioSettings {
    fn default() -> Self {
        AudioConfig::default().settings()
    }
}

impl AudioConfig {
    pub fn settings(&self) -> AudioSettings {
        AudioSettings {
            device: self.output.device.clone(),
            channels: self.output.channels,
            stereo_upmix: self.output.stereo_upmix,
            master_volume: self.output.master_volume.clamp(0.0, 1.0),
            passthrough_device: self.passthrough.device.clone(),
            ac3_passthrough: self.passthrough.ac3,
            eac3_passthrough: self.passthrough.eac3,
            dts_passthrough: self.passthrough.dts,
            dtshd_passthrough: self.passthrough.dtshd,
            truehd_passthrough: self.passthrough.truehd,
            multichannel_lpcm: self.passthrough.multichannel_lpcm,
            forced_sample_rate: self.advanced.forced_sample_rate,
        }
    }
}

impl AudioSettings {
    /// Whether a bitstream of `codec` may be passed to the sink untouched.
    pub fn passthrough_enabled(&self, codec: RawCodec) -> bool {
        match codec {
            RawCodec::Ac3 => self.ac3_passthrough,
            RawCodec::Eac3 => self.eac3_passthrough,
            RawCodec::Dts => self.dts_passthrough,
            RawCodec::DtsHd => self.dtshd_passthrough,
            RawCodec::TrueHd => self.truehd_passthrough,
            RawCodec::Aac => false,
        }
    }

    /// Dotted names of every key that differs from `other`.
    pub fn changed_keys(&self, other: &AudioSettings) -> Vec<&'static str> {
        let mut keys = Vec::new();
        let mut check = |changed: bool, key: &'static str| {
            if changed {
                keys.push(key);
            }
        };
        check(self.device != other.device, "output.device");
        check(self.channels != other.channels, "output.channels");
        check(self.stereo_upmix != other.stereo_upmix, "output.stereo_upmix");
        check(
            self.master_volume != other.master_volume,
            "output.master_volume",
        );
        check(
            self.passthrough_device != other.passthrough_device,
            "passthrough.device",
        );
        check(self.ac3_passthrough != other.ac3_passthrough, "passthrough.ac3");
        check(
            self.eac3_passthrough != other.eac3_passthrough,
            "passthrough.eac3",
        );
        check(self.dts_passthrough != other.dts_passthrough, "passthrough.dts");
        check(
            self.dtshd_passthrough != other.dtshd_passthrough,
            "passthrough.dtshd",
        );
        check(
            self.truehd_passthrough != other.truehd_passthrough,
            "passthrough.truehd",
        );
        check(
            self.multichannel_lpcm != other.multichannel_lpcm,
            "passthrough.multichannel_lpcm",
        );
        check(
            self.forced_sample_rate != other.forced_sample_rate,
            "advanced.forced_sample_rate",
        );
        keys
    }

    /// True if switching to `other` needs the pipeline rebuilt. Master
    /// volume is applied live.
    pub fn requires_reconfigure(&self, other: &AudioSettings) -> bool {
        self.changed_keys(other)
            .iter()
            .any(|&key| key != "output.master_volume")
    }
}

/// Returns the platform-specific configuration directory.
///
/// On Windows: `%APPDATA%\Nethercore\config`
/// On macOS: `~/Library/Application Support/io.nethercore.Nethercore`
/// On Linux: `~/.config/Nethercore`
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("io.nethercore", "", "Nethercore")
        .map(|dirs| dirs.config_dir().to_path_buf())
}

/// Loads `audio.toml` from the config directory.
///
/// Returns default values if the file doesn't exist or cannot be parsed.
pub fn load() -> AudioConfig {
    config_dir()
        .and_then(|dir| load_from(&dir.join(CONFIG_FILE)).ok())
        .unwrap_or_default()
}

/// Loads a configuration file, reporting why it could not be read.
pub fn load_from(path: &Path) -> Result<AudioConfig, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&content)?)
}

/// Saves to `audio.toml` in the config directory, creating it if needed.
pub fn save(config: &AudioConfig) -> Result<(), ConfigError> {
    let dir = config_dir().ok_or(ConfigError::NoConfigDirectory)?;
    std::fs::create_dir_all(&dir)?;
    save_to(config, &dir.join(CONFIG_FILE))
}

pub fn save_to(config: &AudioConfig, path: &Path) -> Result<(), ConfigError> {
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AudioConfig::default();
        assert_eq!(config.output.device, "default");
        assert_eq!(config.output.channels, 1);
        assert_eq!(config.output.master_volume, 1.0);
        assert!(config.passthrough.multichannel_lpcm);
        assert!(!config.passthrough.ac3);
        assert_eq!(config.advanced.forced_sample_rate, None);
    }

    #[test]
    fn test_partial_file_parses() {
        let config: AudioConfig = toml::from_str(
            r#"
            [passthrough]
            ac3 = true
            "#,
        )
        .unwrap();
        assert!(config.passthrough.ac3);
        assert_eq!(config.passthrough.device, "default");
        assert_eq!(config.output, OutputConfig::default());
    }

    #[test]
    fn test_save_and_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);

        let mut config = AudioConfig::default();
        config.output.channels = 8;
        config.advanced.forced_sample_rate = Some(48000);
        save_to(&config, &path).unwrap();

        assert_eq!(load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_load_from_reports_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        assert!(matches!(load_from(&path), Err(ConfigError::Io(_))));

        std::fs::write(&path, "output = 3").unwrap();
        assert!(matches!(load_from(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_changed_keys() {
        let a = AudioSettings::default();
        let mut b = a.clone();
        assert!(a.changed_keys(&b).is_empty());

        b.channels = 8;
        b.dts_passthrough = true;
        assert_eq!(
            a.changed_keys(&b),
            vec!["output.channels", "passthrough.dts"]
        );
        assert!(a.requires_reconfigure(&b));
    }

    #[test]
    fn test_volume_is_live() {
        let a = AudioSettings::default();
        let mut b = a.clone();
        b.master_volume = 0.5;
        assert_eq!(a.changed_keys(&b), vec!["output.master_volume"]);
        assert!(!a.requires_reconfigure(&b));
    }

    #[test]
    fn test_passthrough_enabled() {
        let mut config = AudioConfig::default();
        config.passthrough.eac3 = true;
        let settings = config.settings();
        assert!(settings.passthrough_enabled(RawCodec::Eac3));
        assert!(!settings.passthrough_enabled(RawCodec::Ac3));
        assert!(!settings.passthrough_enabled(RawCodec::Aac));
    }
}
