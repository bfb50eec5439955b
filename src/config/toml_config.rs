use crate::adapters::table::parse_date;
use crate::adapters::tushare::{DEFAULT_ENDPOINT, DEFAULT_INDICES};
use crate::app::pipelines::download_pipeline::SUPPORTED_FORMATS;
use crate::core::ConfigProvider;
use crate::domain::model::{AdjustMode, DateRange, FetchSettings};
use crate::research::proposal::ActionSelection;
use crate::utils::error::{EtlError, Result};
use crate::utils::validation::{self, Validate};
use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TomlConfig {
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub source: SourceConfig,
    pub download: DownloadConfig,
    #[serde(default)]
    pub transform: TransformConfig,
    pub load: LoadConfig,
    pub monitoring: Option<MonitoringConfig>,
    pub llm: Option<LlmConfig>,
    pub research: Option<ResearchConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub token: String,
    pub timeout_seconds: Option<u64>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            token: String::new(),
            timeout_seconds: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    pub start_date: String,
    /// 未設定時為今天
    pub end_date: Option<String>,
    #[serde(default = "default_list_statuses")]
    pub list_statuses: Vec<String>,
    #[serde(default = "default_indices")]
    pub indices: Vec<String>,
    pub calls_per_minute: Option<u32>,
    pub max_workers: Option<usize>,
    pub max_retries: Option<u32>,
    pub base_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformConfig {
    #[serde(default = "default_adjust_mode")]
    pub adjust_mode: String,
    #[serde(default = "default_cutoff_date")]
    pub cutoff_date: String,
    #[serde(default = "default_sample_instrument")]
    pub sample_instrument: String,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            adjust_mode: default_adjust_mode(),
            cutoff_date: default_cutoff_date(),
            sample_instrument: default_sample_instrument(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadConfig {
    pub output_path: String,
    #[serde(default = "default_dataset_name")]
    pub dataset_name: String,
    pub output_formats: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub api_url: String,
    #[serde(default)]
    pub api_key: String,
    pub model: String,
    pub timeout_seconds: Option<u64>,
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchConfig {
    #[serde(default = "default_action_selection")]
    pub action_selection: String,
    pub reward_metric: Option<String>,
    pub seed: Option<u64>,
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_list_statuses() -> Vec<String> {
    ["L", "D", "P"].iter().map(|s| s.to_string()).collect()
}

fn default_indices() -> Vec<String> {
    DEFAULT_INDICES.iter().map(|s| s.to_string()).collect()
}

fn default_adjust_mode() -> String {
    "forward".to_string()
}

fn default_cutoff_date() -> String {
    "2008-12-29".to_string()
}

fn default_sample_instrument() -> String {
    "SH600519".to_string()
}

fn default_dataset_name() -> String {
    "daily_pv".to_string()
}

fn default_action_selection() -> String {
    "bandit".to_string()
}

fn config_date(field: &str, value: &str) -> Result<NaiveDate> {
    parse_date(value).ok_or_else(|| EtlError::InvalidConfigValueError {
        field: field.to_string(),
        value: value.to_string(),
        reason: "Expected YYYYMMDD or YYYY-MM-DD".to_string(),
    })
}

impl TomlConfig {
    /// 從 TOML 檔案載入配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path).map_err(EtlError::IoError)?;
        Self::from_toml_str(&content)
    }

    /// 從 TOML 字串解析配置
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let processed_content = Self::substitute_env_vars(content)?;

        toml::from_str(&processed_content).map_err(|e| EtlError::ConfigValidationError {
            field: "toml_parsing".to_string(),
            message: format!("TOML parsing error: {}", e),
        })
    }

    /// 替換環境變數 (例如 ${TUSHARE_TOKEN})，未設定的變數保持原樣
    fn substitute_env_vars(content: &str) -> Result<String> {
        let re = Regex::new(r"\$\{([^}]+)\}").map_err(|e| EtlError::ConfigError {
            message: format!("Invalid substitution pattern: {}", e),
        })?;

        let result = re.replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            std::env::var(var_name).unwrap_or_else(|_| format!("${{{}}}", var_name))
        });

        Ok(result.to_string())
    }

    /// 驗證配置的合理性
    pub fn validate_config(&self) -> Result<()> {
        validation::validate_url("source.endpoint", &self.source.endpoint)?;
        validation::validate_non_empty_string("pipeline.name", &self.pipeline.name)?;

        if self.source.token.trim().is_empty() || self.source.token.starts_with("${") {
            return Err(EtlError::MissingConfigError {
                field: "source.token".to_string(),
            });
        }

        self.date_range()?;
        self.cutoff_date()?;
        self.transform.adjust_mode.parse::<AdjustMode>()?;

        if let Some(rate) = self.download.calls_per_minute {
            validation::validate_positive_number("download.calls_per_minute", rate as usize, 1)?;
        }
        if let Some(workers) = self.download.max_workers {
            validation::validate_positive_number("download.max_workers", workers, 1)?;
        }
        if let Some(retries) = self.download.max_retries {
            validation::validate_range("download.max_retries", retries, 1, 20)?;
        }
        if self.download.list_statuses.is_empty() {
            return Err(EtlError::ConfigValidationError {
                field: "download.list_statuses".to_string(),
                message: "At least one listing status is required".to_string(),
            });
        }

        validation::validate_path("load.output_path", &self.load.output_path)?;
        validation::validate_non_empty_string("load.dataset_name", &self.load.dataset_name)?;
        if self.load.output_formats.is_empty() {
            return Err(EtlError::ConfigValidationError {
                field: "load.output_formats".to_string(),
                message: "At least one output format is required".to_string(),
            });
        }
        for format in &self.load.output_formats {
            validation::validate_one_of("load.output_formats", format, &SUPPORTED_FORMATS)?;
        }

        if let Some(llm) = &self.llm {
            validation::validate_url("llm.api_url", &llm.api_url)?;
            validation::validate_non_empty_string("llm.model", &llm.model)?;
        }
        if let Some(research) = &self.research {
            research.action_selection.parse::<ActionSelection>()?;
        }

        Ok(())
    }

    pub fn token(&self) -> &str {
        &self.source.token
    }

    pub fn endpoint(&self) -> &str {
        &self.source.endpoint
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.source.timeout_seconds.unwrap_or(30))
    }

    /// 取得監控設定
    pub fn monitoring_enabled(&self) -> bool {
        self.monitoring.as_ref().map(|m| m.enabled).unwrap_or(false)
    }
}

impl ConfigProvider for TomlConfig {
    fn output_path(&self) -> &str {
        &self.load.output_path
    }

    fn dataset_name(&self) -> &str {
        &self.load.dataset_name
    }

    fn output_formats(&self) -> &[String] {
        &self.load.output_formats
    }

    fn date_range(&self) -> Result<DateRange> {
        let start = config_date("download.start_date", &self.download.start_date)?;
        let end = match &self.download.end_date {
            Some(end) => config_date("download.end_date", end)?,
            None => chrono::Local::now().date_naive(),
        };
        DateRange::new(start, end)
    }

    fn cutoff_date(&self) -> Result<NaiveDate> {
        config_date("transform.cutoff_date", &self.transform.cutoff_date)
    }

    fn adjust_mode(&self) -> AdjustMode {
        self.transform.adjust_mode.parse().unwrap_or_default()
    }

    fn list_statuses(&self) -> &[String] {
        &self.download.list_statuses
    }

    fn target_indices(&self) -> &[String] {
        &self.download.indices
    }

    fn fetch_settings(&self) -> FetchSettings {
        let defaults = FetchSettings::default();
        FetchSettings {
            calls_per_minute: self
                .download
                .calls_per_minute
                .unwrap_or(defaults.calls_per_minute),
            max_workers: self.download.max_workers.unwrap_or(defaults.max_workers),
            max_retries: self.download.max_retries.unwrap_or(defaults.max_retries),
            base_delay: self
                .download
                .base_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.base_delay),
        }
    }

    fn sample_instrument(&self) -> &str {
        &self.transform.sample_instrument
    }
}

impl Validate for TomlConfig {
    fn validate(&self) -> Result<()> {
        self.validate_config()
    }
}
