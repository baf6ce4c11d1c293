use clap::ValueEnum;
use config::{Config, ConfigError, Environment, File};
use m_teng::{ChannelSelection, ConnectionConfig, TestCurve};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE_NAME: &str = "m-teng.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Keithley 2600 SMU over LAN
    #[default]
    Keithley,
    /// Arduino TENG board over Bluetooth LE
    Arduino,
    /// Generated test curve, no hardware needed
    Synthetic,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub device: DeviceConfig,
    pub measurement: MeasurementConfig,
    pub synthetic: SyntheticConfig,
    pub console: ConsoleConfig,
}

impl AppConfig {
    /// Validate all configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.device.validate()?;
        self.measurement.validate()?;
        self.synthetic
            .curve()
            .validate()
            .map_err(|e| ConfigError::Message(format!("Invalid synthetic curve: {e}")))?;
        Ok(())
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct DeviceConfig {
    pub backend: BackendKind,
    pub host: String,
    pub port: u16,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub beep_on_connect: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            host: "192.168.1.50".to_string(),
            port: 5025,
            connect_timeout_ms: 5000,
            read_timeout_ms: 10000,
            write_timeout_ms: 5000,
            beep_on_connect: true,
        }
    }
}

impl DeviceConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::Message("device.host must not be empty".to_string()));
        }
        if self.connect_timeout_ms == 0 || self.read_timeout_ms == 0 || self.write_timeout_ms == 0
        {
            return Err(ConfigError::Message(
                "device timeouts must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn connection(&self) -> ConnectionConfig {
        ConnectionConfig {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            read_timeout: Duration::from_millis(self.read_timeout_ms),
            write_timeout: Duration::from_millis(self.write_timeout_ms),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct MeasurementConfig {
    /// Seconds between two readings
    pub interval: f64,
    /// Readings per batch for `count`
    pub count: usize,
    /// Seconds between two completion polls / previews
    pub poll_interval: f64,
    pub channels: ChannelSelection,
    pub beep_when_done: bool,
}

impl Default for MeasurementConfig {
    fn default() -> Self {
        Self {
            interval: 0.05,
            count: 5000,
            poll_interval: 0.5,
            channels: ChannelSelection::Both,
            beep_when_done: true,
        }
    }
}

impl MeasurementConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.interval > 0.0) || !self.interval.is_finite() {
            return Err(ConfigError::Message(format!(
                "measurement.interval must be positive, got: {}",
                self.interval
            )));
        }
        if !(self.poll_interval > 0.0) || !self.poll_interval.is_finite() {
            return Err(ConfigError::Message(format!(
                "measurement.poll_interval must be positive, got: {}",
                self.poll_interval
            )));
        }
        if self.count == 0 {
            return Err(ConfigError::Message(
                "measurement.count must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn poll_cadence(&self) -> Duration {
        Duration::from_secs_f64(self.poll_interval)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct SyntheticConfig {
    pub period: f64,
    pub peak_width: f64,
    pub amplitude: f64,
    pub bias: f64,
    /// Factor turning the curve into a current in A
    pub current_scale: f64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        let curve = TestCurve::default();
        Self {
            period: curve.period,
            peak_width: curve.peak_width,
            amplitude: curve.amplitude,
            bias: curve.bias,
            current_scale: 1e-9,
        }
    }
}

impl SyntheticConfig {
    pub fn curve(&self) -> TestCurve {
        TestCurve::new(self.period, self.peak_width, self.amplitude, self.bias)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ConsoleConfig {
    pub verbosity: String,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            verbosity: "info".to_string(),
        }
    }
}

/// Places searched for a config file when none is given, in order.
pub fn default_config_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from(CONFIG_FILE_NAME)];
    if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME") {
        paths.push(PathBuf::from(xdg).join(CONFIG_FILE_NAME));
    }
    if let Some(home) = std::env::var_os("HOME") {
        paths.push(PathBuf::from(home).join(".config").join(CONFIG_FILE_NAME));
    }
    paths
}

/// Load configuration from defaults, the first config file found and
/// `M_TENG__SECTION__KEY` environment overrides, in that order.
pub fn load_config(config_path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    load_config_from(config_path, &default_config_paths(), "M_TENG")
}

fn load_config_from(
    config_path: Option<&Path>,
    search_paths: &[PathBuf],
    env_prefix: &str,
) -> Result<AppConfig, ConfigError> {
    let mut builder = Config::builder().add_source(Config::try_from(&AppConfig::default())?);

    match config_path {
        Some(path) if path.exists() => {
            builder = builder.add_source(File::from(path));
        }
        Some(path) => {
            return Err(ConfigError::Message(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
        None => {
            if let Some(path) = search_paths.iter().find(|p| p.exists()) {
                log::debug!("Using config file {}", path.display());
                builder = builder.add_source(File::from(path.as_path()));
            }
        }
    }

    builder = builder.add_source(
        Environment::with_prefix(env_prefix)
            .separator("__")
            .try_parsing(true),
    );

    let app_config = builder.build()?.try_deserialize::<AppConfig>()?;
    app_config.validate()?;
    Ok(app_config)
}

/// Write `config` as TOML, refusing to overwrite an existing file.
pub fn save_config(config: &AppConfig, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    if path.exists() {
        return Err(format!("{} already exists", path.display()).into());
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, toml::to_string_pretty(config)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("m-teng-{name}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.measurement.interval, 0.05);
        assert_eq!(config.device.port, 5025);
        assert_eq!(config.synthetic.curve(), TestCurve::default());
    }

    #[test]
    fn test_no_file_falls_back_to_defaults() {
        let config = load_config_from(None, &[], "M_TENG_TEST_NONE").unwrap();
        assert_eq!(config.measurement.count, 5000);
        assert_eq!(config.device.backend, BackendKind::Keithley);
    }

    #[test]
    fn test_partial_file_overrides_defaults() {
        let dir = temp_dir("partial");
        let path = dir.join(CONFIG_FILE_NAME);
        fs::write(
            &path,
            "[device]\nbackend = \"synthetic\"\n\n[measurement]\ncount = 20\nchannels = \"voltage\"\n",
        )
        .unwrap();

        let search = [dir.join("missing.toml"), path.clone()];
        let config = load_config_from(None, &search, "M_TENG_TEST_PARTIAL").unwrap();
        assert_eq!(config.device.backend, BackendKind::Synthetic);
        assert_eq!(config.measurement.count, 20);
        assert_eq!(config.measurement.channels, ChannelSelection::Voltage);
        assert_eq!(config.measurement.interval, 0.05);
        assert_eq!(config.console.verbosity, "info");

        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let path = Path::new("/nonexistent/m-teng.toml");
        let result = load_config_from(Some(path), &[], "M_TENG_TEST_MISSING");
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let dir = temp_dir("invalid");
        let path = dir.join(CONFIG_FILE_NAME);
        fs::write(&path, "[measurement]\ninterval = 0.0\n").unwrap();
        assert!(load_config_from(Some(&path), &[], "M_TENG_TEST_INVALID").is_err());

        fs::write(&path, "[synthetic]\npeak_width = -1.0\n").unwrap();
        assert!(load_config_from(Some(&path), &[], "M_TENG_TEST_INVALID").is_err());

        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_save_then_load() {
        let dir = temp_dir("save");
        let path = dir.join("nested").join(CONFIG_FILE_NAME);
        let mut config = AppConfig::default();
        config.measurement.count = 42;
        config.device.backend = BackendKind::Synthetic;

        save_config(&config, &path).unwrap();
        assert!(save_config(&config, &path).is_err());

        let loaded = load_config_from(Some(&path), &[], "M_TENG_TEST_SAVE").unwrap();
        assert_eq!(loaded.measurement.count, 42);
        assert_eq!(loaded.device.backend, BackendKind::Synthetic);

        fs::remove_dir_all(dir).unwrap();
    }
}
