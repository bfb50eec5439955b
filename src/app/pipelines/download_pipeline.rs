use crate::adapters::qlib_bin::QlibBinStore;
use crate::adapters::table;
use crate::core::adjust::{adjust_index, adjust_stock};
use crate::core::audit::render_rows;
use crate::core::downloader::RateLimitedFetcher;
use crate::core::{ConfigProvider, MarketDataSource, Pipeline, RawSeries, Storage, TransformResult};
use crate::domain::model::{InstrumentInfo, InstrumentKind, PvTable};
use crate::utils::error::{EtlError, Result};

/// 樣本標的在日誌中顯示的末尾列數
const SAMPLE_TAIL: usize = 5;

pub const FORMAT_CSV: &str = "csv";
pub const FORMAT_ZIP: &str = "zip";
pub const FORMAT_QLIB: &str = "qlib";
pub const SUPPORTED_FORMATS: [&str; 3] = [FORMAT_CSV, FORMAT_ZIP, FORMAT_QLIB];

/// 下載、複權並寫出完整資料集
pub struct DownloadPipeline<S: Storage, C: ConfigProvider, M: MarketDataSource> {
    pub(crate) storage: S,
    pub(crate) config: C,
    pub(crate) source: M,
}

impl<S: Storage, C: ConfigProvider, M: MarketDataSource> DownloadPipeline<S, C, M> {
    pub fn new(storage: S, config: C, source: M) -> Self {
        Self {
            storage,
            config,
            source,
        }
    }

    fn index_universe(&self) -> Vec<InstrumentInfo> {
        self.config
            .target_indices()
            .iter()
            .map(|code| InstrumentInfo {
                ts_code: code.clone(),
                name: code.clone(),
                list_date: None,
                kind: InstrumentKind::Index,
            })
            .collect()
    }

    fn log_summary(&self, table: &PvTable) {
        let (rows, columns) = table.shape();
        tracing::info!("📐 Dataset shape: {} rows x {} columns", rows, columns);
        if let Some((start, end)) = table.date_range() {
            tracing::info!("📅 Date range: {} ~ {}", start, end);
        }
        tracing::info!("🏷️ Instruments: {}", table.instruments().len());

        let sample = self.config.sample_instrument();
        let rows = table.instrument_rows(sample);
        if rows.is_empty() {
            tracing::info!("Sample instrument {} not present", sample);
        } else {
            let tail = &rows[rows.len().saturating_sub(SAMPLE_TAIL)..];
            tracing::info!(
                "🔍 Last {} rows of {}:\n{}",
                tail.len(),
                sample,
                render_rows(tail.iter().copied())
            );
        }
    }
}

#[async_trait::async_trait]
impl<S: Storage, C: ConfigProvider, M: MarketDataSource> Pipeline for DownloadPipeline<S, C, M> {
    async fn extract(&self) -> Result<Vec<RawSeries>> {
        self.source.ping().await?;

        let range = self.config.date_range()?;
        let mut universe = self.source.list_stocks(self.config.list_statuses()).await?;
        tracing::info!("📋 {} stocks listed", universe.len());
        universe.extend(self.index_universe());

        let fetcher = RateLimitedFetcher::new(self.config.fetch_settings())?;
        let report = fetcher
            .download_universe(&self.source, &universe, &range)
            .await;

        if !report.failed.is_empty() {
            tracing::warn!(
                "⚠️ {} instruments failed or returned nothing: {}",
                report.failed.len(),
                crate::utils::report::sample(&report.failed, 10)
            );
        }
        if report.series.is_empty() {
            return Err(EtlError::ProcessingError {
                message: format!(
                    "No instrument could be downloaded for {} ~ {}",
                    range.start, range.end
                ),
            });
        }
        Ok(report.series)
    }

    async fn transform(&self, data: Vec<RawSeries>) -> Result<TransformResult> {
        let mode = self.config.adjust_mode();
        let mut result = TransformResult::default();
        let mut parts = Vec::with_capacity(data.len());

        for series in data {
            let adjusted = match series.kind {
                InstrumentKind::Stock => {
                    adjust_stock(&series.ts_code, &series.daily, &series.factors, mode)
                }
                InstrumentKind::Index => adjust_index(&series.ts_code, &series.daily),
            };
            match adjusted {
                Ok(Some(rows)) => {
                    result.succeeded.push(series.ts_code);
                    parts.push(rows);
                }
                Ok(None) => result.failed.push(series.ts_code),
                Err(e) => {
                    tracing::warn!("⚠️ Failed to adjust {}: {}", series.ts_code, e);
                    result.failed.push(series.ts_code);
                }
            }
        }

        let mut table = PvTable::from_parts(parts);
        let cutoff = self.config.cutoff_date()?;
        table.retain_from(cutoff);
        result.dropped_rows = table.drop_empty_rows();
        tracing::info!(
            "🔄 Adjusted {} instruments ({:?}), {} skipped, {} empty rows dropped after {}",
            result.succeeded.len(),
            mode,
            result.failed.len(),
            result.dropped_rows,
            cutoff
        );

        self.log_summary(&table);
        result.table = table;
        Ok(result)
    }

    async fn load(&self, result: TransformResult) -> Result<String> {
        if result.table.is_empty() {
            return Err(EtlError::ProcessingError {
                message: "Nothing to write: the transformed dataset is empty".to_string(),
            });
        }

        let name = self.config.dataset_name();
        let mut written = Vec::new();
        for format in self.config.output_formats() {
            match format.as_str() {
                FORMAT_CSV => {
                    written.push(table::write_table(&self.storage, &result.table, name, false).await?)
                }
                FORMAT_ZIP => {
                    written.push(table::write_table(&self.storage, &result.table, name, true).await?)
                }
                FORMAT_QLIB => {
                    QlibBinStore::new(&self.storage).dump_table(&result.table).await?;
                    written.push("features/".to_string());
                }
                other => {
                    return Err(EtlError::InvalidConfigValueError {
                        field: "load.output_formats".to_string(),
                        value: other.to_string(),
                        reason: format!("expected one of {:?}", SUPPORTED_FORMATS),
                    })
                }
            }
        }

        Ok(written
            .iter()
            .map(|p| format!("{}/{}", self.config.output_path(), p))
            .collect::<Vec<_>>()
            .join(", "))
    }
}
