use thiserror::Error;

#[derive(Error, Debug)]
pub enum EtlError {
    #[error("Zip operation failed: {0}")]
    ZipError(#[from] zip::result::ZipError),

    #[error("API request failed: {0}")]
    ApiError(#[from] reqwest::Error),

    #[error("CSV processing error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("DataFrame operation failed: {0}")]
    DataFrameError(#[from] polars::prelude::PolarsError),

    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    #[error("Configuration validation failed for '{field}': {message}")]
    ConfigValidationError { field: String, message: String },

    #[error("Invalid value '{value}' for '{field}': {reason}")]
    InvalidConfigValueError {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Missing required configuration: {field}")]
    MissingConfigError { field: String },

    #[error("Data processing error: {message}")]
    ProcessingError { message: String },

    #[error("Transformation failed at stage '{stage}': {details}")]
    TransformationError { stage: String, details: String },

    #[error("Validation error: {message}")]
    ValidationError { message: String },

    #[error("Malformed data in {path}: {reason}")]
    FormatError { path: String, reason: String },

    #[error("Remote API '{api}' returned code {code}: {message}")]
    RemoteApiError {
        api: String,
        code: i64,
        message: String,
    },

    #[error("Giving up on {target} after {attempts} attempts: {last_error}")]
    RetryExhausted {
        target: String,
        attempts: u32,
        last_error: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    Network,
    Data,
    Storage,
    Processing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl EtlError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            EtlError::ConfigError { .. }
            | EtlError::ConfigValidationError { .. }
            | EtlError::InvalidConfigValueError { .. }
            | EtlError::MissingConfigError { .. } => ErrorCategory::Configuration,
            EtlError::ApiError(_) | EtlError::RemoteApiError { .. } | EtlError::RetryExhausted { .. } => {
                ErrorCategory::Network
            }
            EtlError::CsvError(_)
            | EtlError::SerializationError(_)
            | EtlError::FormatError { .. }
            | EtlError::ValidationError { .. } => ErrorCategory::Data,
            EtlError::IoError(_) | EtlError::ZipError(_) => ErrorCategory::Storage,
            EtlError::ProcessingError { .. }
            | EtlError::TransformationError { .. }
            | EtlError::DataFrameError(_) => ErrorCategory::Processing,
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self.category() {
            ErrorCategory::Network => ErrorSeverity::Medium,
            ErrorCategory::Data | ErrorCategory::Processing => ErrorSeverity::High,
            ErrorCategory::Configuration => ErrorSeverity::High,
            ErrorCategory::Storage => ErrorSeverity::Critical,
        }
    }

    pub fn recovery_suggestion(&self) -> String {
        match self {
            EtlError::ApiError(_) => "檢查網路連線與 API 端點是否可用後重試".to_string(),
            EtlError::RemoteApiError { code, .. } if *code == 40203 => {
                "已超過 API 呼叫頻率上限，請降低 calls_per_minute 後重試".to_string()
            }
            EtlError::RemoteApiError { .. } => "檢查 API token 與帳號權限".to_string(),
            EtlError::RetryExhausted { .. } => {
                "降低並發數或呼叫頻率，或稍後再次執行".to_string()
            }
            EtlError::MissingConfigError { field } => format!("請在配置中提供 '{}'", field),
            EtlError::InvalidConfigValueError { field, .. }
            | EtlError::ConfigValidationError { field, .. } => {
                format!("請修正配置項 '{}'", field)
            }
            EtlError::ConfigError { .. } => "檢查 TOML 配置檔格式".to_string(),
            EtlError::FormatError { path, .. } => {
                format!("確認 {} 是由本工具或相容工具產生的檔案", path)
            }
            EtlError::CsvError(_) | EtlError::SerializationError(_) => {
                "檢查輸入檔案的欄位與編碼".to_string()
            }
            EtlError::IoError(_) | EtlError::ZipError(_) => {
                "檢查檔案路徑、權限與磁碟空間".to_string()
            }
            EtlError::ValidationError { .. } => "檢查輸入資料是否符合預期格式".to_string(),
            EtlError::DataFrameError(_) => "檢查欄位型別是否一致，例如日期與價格欄".to_string(),
            EtlError::ProcessingError { .. } | EtlError::TransformationError { .. } => {
                "使用 --verbose 重新執行以取得詳細日誌".to_string()
            }
        }
    }

    pub fn user_friendly_message(&self) -> String {
        match self.category() {
            ErrorCategory::Configuration => format!("配置錯誤: {}", self),
            ErrorCategory::Network => format!("資料來源存取失敗: {}", self),
            ErrorCategory::Data => format!("資料格式錯誤: {}", self),
            ErrorCategory::Storage => format!("檔案讀寫失敗: {}", self),
            ErrorCategory::Processing => format!("處理失敗: {}", self),
        }
    }

    /// CLI 退出碼，依嚴重程度決定
    pub fn exit_code(&self) -> i32 {
        match self.severity() {
            ErrorSeverity::Low => 0,
            ErrorSeverity::Medium => 2,
            ErrorSeverity::High => 1,
            ErrorSeverity::Critical => 3,
        }
    }
}

pub type Result<T> = std::result::Result<T, EtlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_and_exit_code() {
        let err = EtlError::RetryExhausted {
            target: "000001.SZ".to_string(),
            attempts: 5,
            last_error: "timeout".to_string(),
        };
        assert_eq!(err.category(), ErrorCategory::Network);
        assert_eq!(err.exit_code(), 2);

        let err = EtlError::MissingConfigError {
            field: "source.token".to_string(),
        };
        assert_eq!(err.severity(), ErrorSeverity::High);
        assert!(err.recovery_suggestion().contains("source.token"));
    }

    #[test]
    fn test_io_error_is_critical() {
        let err: EtlError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert_eq!(err.severity(), ErrorSeverity::Critical);
        assert_eq!(err.exit_code(), 3);
        assert!(err.user_friendly_message().contains("gone"));
    }

    #[test]
    fn test_polars_error_is_processing() {
        let err: EtlError = polars::prelude::PolarsError::ColumnNotFound("$close".into()).into();
        assert_eq!(err.category(), ErrorCategory::Processing);
        assert_eq!(err.exit_code(), 1);
        assert!(err.to_string().contains("$close"));
    }
}
