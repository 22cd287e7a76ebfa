use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::acquire::AcquirerPolicy;
use crate::pipeline::PipelineConfig;
use crate::sink::OutputOptions;
use crate::source::{SourceDescriptor, SourceOptions, StreamOptions};

const DEFAULT_SCALE: f64 = 1.0;
const DEFAULT_LOG_LEVEL: &str = "info";

pub const CONFIG_ENV: &str = "FRAMEPIPE_CONFIG";

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct SettingsFile {
    source: Option<SourceConfigFile>,
    stream: Option<StreamConfigFile>,
    output: Option<OutputConfigFile>,
    processing: Option<ProcessingConfigFile>,
    acquirer: Option<AcquirerConfigFile>,
    log_level: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct SourceConfigFile {
    device: Option<u32>,
    stream: Option<String>,
    file: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct StreamConfigFile {
    width: Option<u32>,
    height: Option<u32>,
    latency_ms: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct OutputConfigFile {
    record_path: Option<PathBuf>,
    retransmit_location: Option<String>,
    display: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ProcessingConfigFile {
    scale: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct AcquirerConfigFile {
    max_consecutive_failures: Option<u32>,
}

/// Candidate sources. More than one may be set; see `SourceDescriptor::select`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceSettings {
    pub device: Option<u32>,
    pub stream: Option<String>,
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub source: SourceSettings,
    pub stream: StreamOptions,
    pub outputs: OutputOptions,
    pub scale: f64,
    pub max_consecutive_failures: u32,
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            source: SourceSettings::default(),
            stream: StreamOptions::default(),
            outputs: OutputOptions::default(),
            scale: DEFAULT_SCALE,
            max_consecutive_failures: AcquirerPolicy::default().max_consecutive_failures,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

impl Settings {
    /// Defaults, then the file named by `FRAMEPIPE_CONFIG`, then `FRAMEPIPE_*`
    /// environment overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Like `load`, but an explicit `config_path` takes precedence over
    /// `FRAMEPIPE_CONFIG`.
    pub fn load_from(config_path: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var(CONFIG_ENV)
            .ok()
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from);
        let file_cfg = match config_path.map(Path::to_path_buf).or(env_path) {
            Some(path) => read_config_file(&path)?,
            None => SettingsFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: SettingsFile) -> Self {
        let defaults = Self::default();
        let source = file.source.unwrap_or_default();
        let stream = file.stream.unwrap_or_default();
        let output = file.output.unwrap_or_default();
        Self {
            source: SourceSettings {
                device: source.device,
                stream: source.stream,
                file: source.file,
            },
            stream: StreamOptions {
                width: stream.width.unwrap_or(defaults.stream.width),
                height: stream.height.unwrap_or(defaults.stream.height),
                latency_ms: stream.latency_ms.unwrap_or(defaults.stream.latency_ms),
            },
            outputs: OutputOptions {
                display: output.display.unwrap_or(false),
                record_path: output.record_path,
                retransmit_location: output.retransmit_location,
            },
            scale: file
                .processing
                .and_then(|processing| processing.scale)
                .unwrap_or(defaults.scale),
            max_consecutive_failures: file
                .acquirer
                .and_then(|acquirer| acquirer.max_consecutive_failures)
                .unwrap_or(defaults.max_consecutive_failures),
            log_level: file.log_level.unwrap_or(defaults.log_level),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(device) = env_value("FRAMEPIPE_DEVICE") {
            let index: u32 = device
                .parse()
                .map_err(|_| anyhow!("FRAMEPIPE_DEVICE must be a device index"))?;
            self.source.device = Some(index);
        }
        if let Some(url) = env_value("FRAMEPIPE_STREAM_URL") {
            self.source.stream = Some(url);
        }
        if let Some(path) = env_value("FRAMEPIPE_FILE") {
            self.source.file = Some(PathBuf::from(path));
        }
        if let Some(path) = env_value("FRAMEPIPE_RECORD_PATH") {
            self.outputs.record_path = Some(PathBuf::from(path));
        }
        if let Some(location) = env_value("FRAMEPIPE_RETRANSMIT_LOCATION") {
            self.outputs.retransmit_location = Some(location);
        }
        if let Some(display) = env_value("FRAMEPIPE_DISPLAY") {
            self.outputs.display = parse_bool(&display)
                .ok_or_else(|| anyhow!("FRAMEPIPE_DISPLAY must be true or false"))?;
        }
        if let Some(scale) = env_value("FRAMEPIPE_SCALE") {
            self.scale = scale
                .parse()
                .map_err(|_| anyhow!("FRAMEPIPE_SCALE must be a number"))?;
        }
        if let Some(level) = env_value("FRAMEPIPE_LOG_LEVEL") {
            self.log_level = level;
        }
        Ok(())
    }

    /// Checked again by the binary after command-line overrides.
    pub fn validate(&self) -> Result<()> {
        if !(self.scale.is_finite() && self.scale > 0.0) {
            return Err(anyhow!(
                "scale must be a positive number (got {})",
                self.scale
            ));
        }
        if self.max_consecutive_failures == 0 {
            return Err(anyhow!("acquirer max_consecutive_failures must be greater than zero"));
        }
        if self.stream.width == 0 || self.stream.height == 0 {
            return Err(anyhow!("stream width and height must be greater than zero"));
        }
        Ok(())
    }

    pub fn source_descriptor(&self) -> Result<SourceDescriptor> {
        SourceDescriptor::select(
            self.source.device,
            self.source.stream.as_deref(),
            self.source.file.as_deref(),
        )
    }

    pub fn source_options(&self) -> SourceOptions {
        SourceOptions {
            stream: self.stream.clone(),
            acquirer: AcquirerPolicy {
                max_consecutive_failures: self.max_consecutive_failures,
                ..AcquirerPolicy::default()
            },
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            scale: self.scale,
            outputs: self.outputs.clone(),
            ..PipelineConfig::default()
        }
    }
}

fn read_config_file(path: &Path) -> Result<SettingsFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
