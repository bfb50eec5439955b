use crate::domain::model::{
    AdjFactor, AdjustMode, DateRange, FetchSettings, InstrumentInfo, RawDaily, RawSeries,
    TransformResult,
};
use crate::utils::error::Result;
use async_trait::async_trait;
use chrono::NaiveDate;

/// 以相對路徑讀寫位元組的儲存後端
pub trait Storage: Send + Sync {
    fn read_file(&self, path: &str) -> impl std::future::Future<Output = Result<Vec<u8>>> + Send;
    fn write_file(
        &self,
        path: &str,
        data: &[u8],
    ) -> impl std::future::Future<Output = Result<()>> + Send;
    fn exists(&self, path: &str) -> impl std::future::Future<Output = bool> + Send;
    /// 目錄下直接子項目的名稱，已排序
    fn list_dir(&self, path: &str)
        -> impl std::future::Future<Output = Result<Vec<String>>> + Send;
}

impl<T: Storage + ?Sized> Storage for &T {
    fn read_file(&self, path: &str) -> impl std::future::Future<Output = Result<Vec<u8>>> + Send {
        (**self).read_file(path)
    }

    fn write_file(
        &self,
        path: &str,
        data: &[u8],
    ) -> impl std::future::Future<Output = Result<()>> + Send {
        (**self).write_file(path, data)
    }

    fn exists(&self, path: &str) -> impl std::future::Future<Output = bool> + Send {
        (**self).exists(path)
    }

    fn list_dir(&self, path: &str)
        -> impl std::future::Future<Output = Result<Vec<String>>> + Send {
        (**self).list_dir(path)
    }
}

pub trait ConfigProvider: Send + Sync {
    fn output_path(&self) -> &str;
    fn dataset_name(&self) -> &str;
    fn output_formats(&self) -> &[String];
    fn date_range(&self) -> Result<DateRange>;
    fn cutoff_date(&self) -> Result<NaiveDate>;
    fn adjust_mode(&self) -> AdjustMode;
    fn list_statuses(&self) -> &[String];
    fn target_indices(&self) -> &[String];
    fn fetch_settings(&self) -> FetchSettings;
    fn sample_instrument(&self) -> &str;
}

#[async_trait]
pub trait Pipeline: Send + Sync {
    async fn extract(&self) -> Result<Vec<RawSeries>>;
    async fn transform(&self, data: Vec<RawSeries>) -> Result<TransformResult>;
    async fn load(&self, result: TransformResult) -> Result<String>;
}

/// 行情資料來源
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    async fn ping(&self) -> Result<()>;
    async fn list_stocks(&self, statuses: &[String]) -> Result<Vec<InstrumentInfo>>;
    async fn daily(&self, ts_code: &str, range: &DateRange) -> Result<Vec<RawDaily>>;
    async fn adj_factor(&self, ts_code: &str, range: &DateRange) -> Result<Vec<AdjFactor>>;
    async fn index_daily(&self, ts_code: &str, range: &DateRange) -> Result<Vec<RawDaily>>;
}

/// 以 JSON 物件回覆的對話模型
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete_json(&self, system_prompt: &str, user_prompt: &str)
        -> Result<serde_json::Value>;
}
