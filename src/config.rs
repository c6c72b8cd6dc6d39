use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

use crate::cli::Cli;

/// Benchmark configuration.
///
/// Every field has a default, so an empty TOML file (or no file at all) is a
/// valid configuration. Command line flags are applied on top of the file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub endpoint: EndpointConfig,
    #[serde(default)]
    pub load: LoadConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub input: InputConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    #[serde(default = "default_ip")]
    pub ip: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>, // If not provided, the first model the server lists is used
    #[serde(default = "default_timeout")]
    pub timeout: u64, // Initial per-request timeout in seconds
    #[serde(default = "default_timeout_increment")]
    pub timeout_increment: u64, // Seconds added to the timeout each time a request times out
    #[serde(default = "default_health_check_timeout")]
    pub health_check_timeout: u64, // Total time to wait for server readiness in seconds (0 = disabled)
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_rounds: Option<usize>, // Unbounded resubmission when unset
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    #[serde(default)]
    pub temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub regex: Option<String>,
    /// Additional request fields, passed through after backend name translation
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptSet {
    English,
    TraditionalChinese,
    #[default]
    All,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InputConfig {
    /// JSONL prompt file; the built-in question set is used when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
    #[serde(default)]
    pub set: PromptSet,
    #[serde(default)]
    pub shuffle: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_size: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default)]
    pub format: OutputFormat,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
    #[serde(default)]
    pub quiet: bool,
    #[serde(default)]
    pub include_responses: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_log: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: LogLevel,
    /// Per-module log level overrides (e.g., ["hyper=info", "reqwest=warn"])
    #[serde(default)]
    pub filter: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn to_level_filter(&self) -> log::LevelFilter {
        match self {
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Console,
    Json,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            ip: default_ip(),
            port: default_port(),
            model: None,
            timeout: default_timeout(),
            timeout_increment: default_timeout_increment(),
            health_check_timeout: default_health_check_timeout(),
            health_check_interval: default_health_check_interval(),
        }
    }
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_rounds: None,
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            stop: None,
            max_tokens: None,
            regex: None,
            extra: Map::new(),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_threads: default_worker_threads(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            filter: Vec::new(),
        }
    }
}

fn default_ip() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    9000
}

fn default_timeout() -> u64 {
    120
}

fn default_timeout_increment() -> u64 {
    10
}

fn default_health_check_timeout() -> u64 {
    0 // Disabled by default
}

fn default_health_check_interval() -> u64 {
    5
}

fn default_batch_size() -> usize {
    1
}

fn default_worker_threads() -> usize {
    num_cpus::get()
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

impl EndpointConfig {
    /// Base URL of the OpenAI-compatible API, e.g. `http://127.0.0.1:9000/v1`
    pub fn base_url(&self) -> String {
        format!("http://{}:{}/v1", self.ip, self.port)
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let config = Self::parse_file(path)?;
        config.validate()?;
        Ok(config)
    }

    fn parse_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config {}: {}", path.display(), e))?;
        Ok(toml::from_str(&contents)?)
    }

    /// Build the effective configuration: the optional TOML file, then any
    /// flags given on the command line.
    pub fn from_cli(cli: &Cli) -> anyhow::Result<Self> {
        let mut config = match &cli.config {
            Some(path) => Self::parse_file(path)?,
            None => Config::default(),
        };

        if let Some(ip) = &cli.ip {
            config.endpoint.ip = ip.clone();
        }
        if let Some(port) = cli.port {
            config.endpoint.port = port;
        }
        if let Some(batch_size) = cli.batch_size {
            config.load.batch_size = batch_size;
        }
        if let Some(input) = &cli.input {
            config.input.file = Some(input.clone());
        }
        if let Some(format) = cli.format {
            config.output.format = format;
        }
        if let Some(output) = &cli.output {
            config.output.file = Some(output.clone());
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.endpoint.ip.trim().is_empty() {
            anyhow::bail!("endpoint ip must not be empty");
        }

        if self.endpoint.timeout == 0 {
            anyhow::bail!("timeout must be greater than 0");
        }

        if self.endpoint.health_check_timeout > 0 && self.endpoint.health_check_interval == 0 {
            anyhow::bail!(
                "health_check_interval must be greater than 0 when health_check_timeout is set"
            );
        }

        if self.load.batch_size == 0 {
            anyhow::bail!("batch_size must be greater than 0");
        }

        if let Some(0) = self.load.max_rounds {
            anyhow::bail!("max_rounds must be greater than 0");
        }

        if self.generation.temperature < 0.0 {
            anyhow::bail!("temperature must not be negative");
        }

        if let Some(0) = self.input.sample_size {
            anyhow::bail!("sample_size must be greater than 0");
        }

        if self.runtime.worker_threads == 0 {
            anyhow::bail!("worker_threads must be greater than 0");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::io::Write;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.endpoint.ip, "127.0.0.1");
        assert_eq!(config.endpoint.port, 9000);
        assert_eq!(config.endpoint.timeout, 120);
        assert_eq!(config.endpoint.timeout_increment, 10);
        assert_eq!(config.load.batch_size, 1);
        assert!(config.load.max_rounds.is_none());
        assert_eq!(config.generation.temperature, 0.0);
        assert_eq!(config.input.set, PromptSet::All);
        assert_eq!(config.output.format, OutputFormat::Console);
        assert!(config.validate().is_ok());
        assert_eq!(config.endpoint.base_url(), "http://127.0.0.1:9000/v1");
    }

    #[test]
    fn test_parse_full_config() {
        let config: Config = toml::from_str(
            r#"
            [endpoint]
            ip = "10.0.0.5"
            port = 30000
            timeout = 30
            timeout_increment = 5

            [load]
            batch_size = 16
            max_rounds = 3

            [generation]
            temperature = 0.7
            stop = ["\n\n"]
            max_tokens = 512

            [generation.extra]
            top_p = 0.95

            [input]
            set = "traditional_chinese"
            shuffle = true

            [output]
            format = "json"

            [log]
            level = "debug"
            filter = ["hyper=info"]
            "#,
        )
        .unwrap();

        assert_eq!(config.endpoint.base_url(), "http://10.0.0.5:30000/v1");
        assert_eq!(config.load.batch_size, 16);
        assert_eq!(config.load.max_rounds, Some(3));
        assert_eq!(config.generation.max_tokens, Some(512));
        assert_eq!(config.generation.stop, Some(vec!["\n\n".to_string()]));
        assert_eq!(
            config.generation.extra.get("top_p"),
            Some(&serde_json::json!(0.95))
        );
        assert_eq!(config.input.set, PromptSet::TraditionalChinese);
        assert_eq!(config.output.format, OutputFormat::Json);
        assert_eq!(config.log.level.to_level_filter(), log::LevelFilter::Debug);
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        config.load.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.endpoint.timeout = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.load.max_rounds = Some(0);
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.generation.temperature = -0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_health_check_interval_validation() {
        let mut config = Config::default();
        config.endpoint.health_check_interval = 0;
        // Readiness polling is off, so the interval is unused
        assert!(config.validate().is_ok());

        config.endpoint.health_check_timeout = 60;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("health_check_interval"));

        config.endpoint.health_check_interval = 2;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_cli_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[endpoint]\nip = \"10.1.1.1\"\nport = 8000\n[load]\nbatch_size = 2").unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let cli = Cli::parse_from([
            "chat-bench",
            "--config",
            path.as_str(),
            "--port",
            "9100",
            "--batch_size",
            "8",
        ]);
        let config = Config::from_cli(&cli).unwrap();

        assert_eq!(config.endpoint.ip, "10.1.1.1");
        assert_eq!(config.endpoint.port, 9100);
        assert_eq!(config.load.batch_size, 8);
    }

    #[test]
    fn test_load_validates() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[load]\nbatch_size = 0").unwrap();
        assert!(Config::load(file.path()).is_err());

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[load]\nbatch_size = 4").unwrap();
        assert_eq!(Config::load(file.path()).unwrap().load.batch_size, 4);
    }

    #[test]
    fn test_cli_without_file() {
        let cli = Cli::parse_from(["chat-bench", "--ip", "192.168.0.2"]);
        let config = Config::from_cli(&cli).unwrap();
        assert_eq!(config.endpoint.ip, "192.168.0.2");
        assert_eq!(config.endpoint.port, 9000);
        assert_eq!(config.load.batch_size, 1);

        let cli = Cli::parse_from(["chat-bench", "--batch_size", "0"]);
        assert!(Config::from_cli(&cli).is_err());
    }

    #[test]
    fn test_cli_batch_size_spellings() {
        let cli = Cli::parse_from(["chat-bench", "--batch-size", "4"]);
        assert_eq!(cli.batch_size, Some(4));
        assert_eq!(Config::from_cli(&cli).unwrap().load.batch_size, 4);

        let cli = Cli::parse_from(["chat-bench", "--batch_size", "6"]);
        assert_eq!(Config::from_cli(&cli).unwrap().load.batch_size, 6);
    }
}
