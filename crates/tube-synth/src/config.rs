use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use tube_core::backend::AudioConfig;
use tube_core::mic::MicConfig;
use tube_core::pressure_model::PressureConfig;
use tube_core::router::AudioSource;
use tube_core::TubeParams;

/// Everything the binary reads from its TOML file. Every section and
/// field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub source: AudioSource,
    pub audio: AudioConfig,
    pub tube: TubeParams,
    pub pressure: PressureConfig,
    pub mic: MicConfig,
}

impl AppConfig {
    /// Load `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Self = toml::from_str(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        info!(path = %path.display(), "config loaded");
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tube_core::targets::ProfileKind;

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn test_partial_file_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
source = "pressure"

[audio]
block_size = 1024

[tube]
tube_length = 1.5

[pressure]
num_freqs = 4
animated = false

[pressure.targets]
profile = "bimodal"

[mic.compressor]
ratio = 2.0
"#
        )
        .unwrap();

        let config = AppConfig::load(file.path()).unwrap();
        assert_eq!(config.source, AudioSource::Pressure);
        assert_eq!(config.audio.block_size, 1024);
        assert_eq!(config.audio.sample_rate, 44_100);
        assert_eq!(config.tube.tube_length, 1.5);
        assert_eq!(config.tube.speed_of_sound, 343.0);
        assert_eq!(config.pressure.num_freqs, 4);
        assert!(!config.pressure.animated);
        assert_eq!(config.pressure.targets.profile, ProfileKind::Bimodal);
        assert_eq!(config.mic.compressor.ratio, 2.0);
        assert_eq!(config.mic.compressor.threshold_db, -30.0);
    }

    #[test]
    fn test_bad_file_names_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "source = 42").unwrap();
        let err = AppConfig::load(file.path()).unwrap_err();
        assert!(format!("{err:#}").contains("parsing config"), "{err:#}");
    }
}
