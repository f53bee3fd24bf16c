//! Driver configuration
//!
//! Loaded from an optional TOML file and overridden by command line flags:
//!
//! ```toml
//! start = 100
//! step = 100
//! ceiling = 1000
//! sla_ms = 500
//! step_secs = 120
//! cpu = "kubectl"
//!
//! [generator]
//! url_file = "urls.txt"
//! expect = '"status":"ok"'
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;

use loadstep_gen::GeneratorConfig;
use serde::{Deserialize, Serialize};

use crate::error::{DriverError, Result};

/// Where per-step CPU figures come from
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CpuMode {
    /// Capacity-weighted `kubectl top nodes`
    Kubectl,
    /// `/proc/stat` of the machine running the driver
    Local,
    /// No CPU column values
    #[default]
    None,
}

impl FromStr for CpuMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "kubectl" | "cluster" => Ok(Self::Kubectl),
            "local" => Ok(Self::Local),
            "none" | "off" => Ok(Self::None),
            _ => Err(format!(
                "Invalid CPU mode '{}'. Use 'kubectl', 'local' or 'none'.",
                s
            )),
        }
    }
}

/// Complete driver configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Concurrency of the first step
    #[serde(default = "default_start")]
    pub start: usize,

    /// Concurrency increment between steps
    #[serde(default = "default_step")]
    pub step: usize,

    /// Last concurrency allowed
    #[serde(default)]
    pub ceiling: Option<usize>,

    /// 95th percentile latency limit of the primary URL, in milliseconds
    #[serde(default)]
    pub sla_ms: Option<u64>,

    /// Duration of each step in seconds
    #[serde(default = "default_step_secs")]
    pub step_secs: u64,

    /// CPU sampling mode
    #[serde(default)]
    pub cpu: CpuMode,

    /// Leave control-plane nodes out of the cluster CPU average
    #[serde(default)]
    pub exclude_masters: bool,

    /// Directory receiving the log and CSV reports
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Also write the step history as JSON
    #[serde(default)]
    pub json: bool,

    /// Generator settings shared by every step
    #[serde(default)]
    pub generator: GeneratorConfig,
}

fn default_start() -> usize {
    100
}

fn default_step() -> usize {
    100
}

fn default_step_secs() -> u64 {
    120
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            start: default_start(),
            step: default_step(),
            ceiling: None,
            sla_ms: None,
            step_secs: default_step_secs(),
            cpu: CpuMode::default(),
            exclude_masters: false,
            output_dir: default_output_dir(),
            json: false,
            generator: GeneratorConfig::default(),
        }
    }
}

impl DriverConfig {
    /// Read a TOML configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| DriverError::ConfigFile {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&content)?)
    }

    /// Check the stepping parameters
    pub fn validate(&self) -> Result<()> {
        if self.start == 0 {
            return Err(DriverError::ZeroStart);
        }
        if self.step == 0 {
            return Err(DriverError::ZeroStep);
        }
        if self.step_secs == 0 {
            return Err(DriverError::ZeroStepDuration);
        }
        if let Some(ceiling) = self.ceiling {
            if ceiling <= self.start {
                return Err(DriverError::CeilingBelowStart {
                    start: self.start,
                    ceiling,
                });
            }
        }
        if self.sla_ms == Some(0) {
            return Err(DriverError::ZeroSla);
        }
        Ok(())
    }

    /// Generator configuration of the first step, used to check the targets
    pub fn first_step(&self) -> GeneratorConfig {
        self.generator.for_step(self.start, self.step_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DriverConfig::default();
        assert_eq!(config.start, 100);
        assert_eq!(config.step, 100);
        assert_eq!(config.step_secs, 120);
        assert_eq!(config.output_dir, PathBuf::from("output"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_with_generator_section() {
        let config: DriverConfig = toml::from_str(
            r#"
            start = 50
            ceiling = 400
            sla_ms = 500
            cpu = "local"

            [generator]
            url = "http://10.0.0.5:8070/ocr"
            expect = "ok"

            [generator.transport]
            keep_alive = false
            "#,
        )
        .unwrap();

        assert_eq!(config.start, 50);
        assert_eq!(config.step, 100);
        assert_eq!(config.ceiling, Some(400));
        assert_eq!(config.cpu, CpuMode::Local);
        assert_eq!(config.generator.expect.as_deref(), Some("ok"));
        assert!(!config.generator.transport.keep_alive);
        assert_eq!(config.generator.transport.read_timeout_ms, 5000);

        let first = config.first_step();
        assert_eq!(first.concurrency, 50);
        assert_eq!(first.duration_secs, Some(120));
    }

    #[test]
    fn test_validation() {
        let ceiling = DriverConfig {
            start: 100,
            ceiling: Some(100),
            ..Default::default()
        };
        assert!(matches!(
            ceiling.validate(),
            Err(DriverError::CeilingBelowStart { .. })
        ));

        let step = DriverConfig {
            step: 0,
            ..Default::default()
        };
        assert!(matches!(step.validate(), Err(DriverError::ZeroStep)));

        let secs = DriverConfig {
            step_secs: 0,
            ..Default::default()
        };
        assert!(matches!(secs.validate(), Err(DriverError::ZeroStepDuration)));
    }

    #[test]
    fn test_cpu_mode_from_str() {
        assert_eq!("kubectl".parse::<CpuMode>().unwrap(), CpuMode::Kubectl);
        assert_eq!("NONE".parse::<CpuMode>().unwrap(), CpuMode::None);
        assert!("gpu".parse::<CpuMode>().is_err());
    }
}
