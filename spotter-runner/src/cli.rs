//! Command line arguments

use clap::Parser;
use spotter_core::{PipelineMode, SpotterConfig};
use std::path::PathBuf;

#[derive(Parser, Debug, Default)]
#[command(name = "spotter")]
#[command(about = "Camera people detection with optional accelerator offload", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// Offload the middle layers to the accelerator
    #[arg(long, conflicts_with = "software")]
    pub hybrid: bool,

    /// Run the whole network in software
    #[arg(long)]
    pub software: bool,

    /// Process the input image directory instead of the camera
    #[arg(long)]
    pub static_images: bool,

    /// Developer mode: console logging and time log files
    #[arg(long)]
    pub dev: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long)]
    pub log_level: Option<String>,
}

impl Cli {
    /// File values, then `SPOTTER_*` variables, then flags.
    pub fn resolve_config(&self) -> anyhow::Result<SpotterConfig> {
        let mut config = match &self.config {
            Some(path) => SpotterConfig::from_file(path)?,
            None => SpotterConfig::default(),
        };
        config.apply_env();
        self.apply_overrides(&mut config);
        config.validate()?;
        Ok(config)
    }

    pub fn apply_overrides(&self, config: &mut SpotterConfig) {
        if self.hybrid {
            config.app.pipeline = PipelineMode::Hybrid;
        } else if self.software {
            config.app.pipeline = PipelineMode::Software;
        }
        if self.static_images {
            config.app.static_images = true;
        }
        if self.dev {
            config.app.dev_mode = true;
        }
        if let Some(level) = &self.log_level {
            config.app.log_level = level.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flags() {
        let cli = Cli::parse_from(["spotter", "--hybrid", "--static-images", "--log-level", "debug"]);
        assert!(cli.hybrid);
        assert!(cli.static_images);
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        assert!(Cli::try_parse_from(["spotter", "--hybrid", "--software"]).is_err());
    }

    #[test]
    fn test_flags_override_config() {
        let cli = Cli::parse_from(["spotter", "--hybrid", "--dev"]);
        let mut config = SpotterConfig::default();
        cli.apply_overrides(&mut config);
        assert_eq!(config.app.pipeline, PipelineMode::Hybrid);
        assert!(config.app.dev_mode);
        assert!(!config.app.static_images);
    }

    #[test]
    fn test_resolve_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spotter.toml");
        std::fs::write(
            &path,
            "[app]\nlocation = \"lab\"\ncapture_interval_secs = 2\n\n[mqtt]\naddress = \"broker\"\n",
        )
        .unwrap();

        let cli = Cli {
            config: Some(path),
            software: true,
            ..Cli::default()
        };
        let config = cli.resolve_config().unwrap();
        assert_eq!(config.app.location, "lab");
        assert_eq!(config.app.pipeline, PipelineMode::Software);
        assert_eq!(config.capture_interval(), Some(std::time::Duration::from_secs(2)));
    }
}
