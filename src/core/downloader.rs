use crate::domain::model::{DateRange, FetchSettings, InstrumentInfo, InstrumentKind, RawSeries};
use crate::domain::ports::MarketDataSource;
use crate::utils::error::{EtlError, Result};
use futures::stream::{self, StreamExt};
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::future::Future;
use std::num::NonZeroU32;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

/// 每完成多少個標的輸出一次進度
const PROGRESS_EVERY: usize = 100;

/// 每 `60s / n` 放行一次，不允許突發，任意一分鐘內最多 n 次
fn pacing_quota(per_minute: NonZeroU32) -> Quota {
    Quota::per_minute(per_minute).allow_burst(NonZeroU32::MIN)
}

/// 限流、限並發並帶指數退避重試的 API 呼叫器
pub struct RateLimitedFetcher {
    settings: FetchSettings,
    semaphore: Semaphore,
    limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
}

#[derive(Debug, Default)]
pub struct DownloadReport {
    pub series: Vec<RawSeries>,
    pub failed: Vec<String>,
    pub elapsed: Duration,
}

impl RateLimitedFetcher {
    pub fn new(settings: FetchSettings) -> Result<Self> {
        let per_minute = NonZeroU32::new(settings.calls_per_minute).ok_or_else(|| {
            EtlError::InvalidConfigValueError {
                field: "download.calls_per_minute".to_string(),
                value: settings.calls_per_minute.to_string(),
                reason: "Rate must be at least 1 call per minute".to_string(),
            }
        })?;
        if settings.max_workers == 0 {
            return Err(EtlError::InvalidConfigValueError {
                field: "download.max_workers".to_string(),
                value: "0".to_string(),
                reason: "At least one worker is required".to_string(),
            });
        }

        Ok(Self {
            settings,
            semaphore: Semaphore::new(settings.max_workers),
            limiter: RateLimiter::direct(pacing_quota(per_minute)),
        })
    }

    pub fn settings(&self) -> &FetchSettings {
        &self.settings
    }

    /// 以 `calls_per_minute` 估算總耗時
    pub fn estimate(&self, api_calls: usize) -> Duration {
        let minutes = api_calls as f64 / self.settings.calls_per_minute as f64;
        Duration::from_secs_f64(minutes * 60.0)
    }

    /// 執行一次呼叫，失敗時等待 `base_delay * 2^attempt` 後重試。
    /// 等待期間不佔用並發名額。
    pub async fn call<T, F, Fut>(&self, target: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.settings.max_retries.max(1);
        let mut last_error = String::new();

        for attempt in 0..attempts {
            let outcome = {
                let _permit = self
                    .semaphore
                    .acquire()
                    .await
                    .map_err(|e| EtlError::ProcessingError {
                        message: format!("Fetcher semaphore closed: {}", e),
                    })?;
                self.limiter.until_ready().await;
                op().await
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(e) => {
                    last_error = e.to_string();
                    if attempt + 1 < attempts {
                        let wait = self.settings.base_delay.saturating_mul(2u32.saturating_pow(attempt));
                        tracing::warn!(
                            "⚠️ API call for {} failed (attempt {}/{}): {}. Retrying in {:?}",
                            target,
                            attempt + 1,
                            attempts,
                            e,
                            wait
                        );
                        tokio::time::sleep(wait).await;
                    }
                }
            }
        }

        tracing::error!("❌ API call for {} failed after {} attempts", target, attempts);
        Err(EtlError::RetryExhausted {
            target: target.to_string(),
            attempts,
            last_error,
        })
    }

    async fn fetch_one<S>(
        &self,
        source: &S,
        info: &InstrumentInfo,
        range: &DateRange,
    ) -> Result<Option<RawSeries>>
    where
        S: MarketDataSource + ?Sized,
    {
        let code = info.ts_code.as_str();
        let (daily, factors) = match info.kind {
            InstrumentKind::Stock => {
                let daily = self.call(code, || source.daily(code, range)).await?;
                if daily.is_empty() {
                    return Ok(None);
                }
                let factors = self.call(code, || source.adj_factor(code, range)).await?;
                (daily, factors)
            }
            InstrumentKind::Index => {
                let daily = self.call(code, || source.index_daily(code, range)).await?;
                (daily, Vec::new())
            }
        };

        if daily.is_empty() {
            return Ok(None);
        }
        Ok(Some(RawSeries {
            ts_code: info.ts_code.clone(),
            kind: info.kind,
            daily,
            factors,
        }))
    }

    /// 並行下載整個標的池；單一標的失敗只記錄不會中止
    pub async fn download_universe<S>(
        &self,
        source: &S,
        instruments: &[InstrumentInfo],
        range: &DateRange,
    ) -> DownloadReport
    where
        S: MarketDataSource + ?Sized,
    {
        let started = Instant::now();
        let stocks = instruments
            .iter()
            .filter(|i| i.kind == InstrumentKind::Stock)
            .count();
        let api_calls = stocks * 2 + (instruments.len() - stocks);
        tracing::info!(
            "📊 Estimated {} API calls, about {:.1} minutes at {} calls/min",
            api_calls,
            self.estimate(api_calls).as_secs_f64() / 60.0,
            self.settings.calls_per_minute
        );
        tracing::info!(
            "🚀 Downloading {} instruments with {} workers",
            instruments.len(),
            self.settings.max_workers
        );

        let mut report = DownloadReport::default();
        let jobs: Vec<_> = instruments
            .iter()
            .map(|info| async move { (info, self.fetch_one(source, info, range).await) })
            .collect();
        let mut results = stream::iter(jobs).buffer_unordered(self.settings.max_workers);

        let mut done = 0usize;
        while let Some((info, outcome)) = results.next().await {
            done += 1;
            match outcome {
                Ok(Some(series)) => report.series.push(series),
                Ok(None) => {
                    tracing::debug!("{} returned no rows", info.ts_code);
                    report.failed.push(info.ts_code.clone());
                }
                Err(e) => {
                    tracing::warn!("⚠️ {} failed: {}", info.ts_code, e);
                    report.failed.push(info.ts_code.clone());
                }
            }
            if done % PROGRESS_EVERY == 0 {
                tracing::info!("📥 Progress: {}/{}", done, instruments.len());
            }
        }

        report.failed.sort();
        report.elapsed = started.elapsed();
        tracing::info!(
            "✅ Download finished in {:.1}s: {} succeeded, {} failed or empty",
            report.elapsed.as_secs_f64(),
            report.series.len(),
            report.failed.len()
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::{AdjFactor, RawDaily};
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    fn fast_settings(max_retries: u32) -> FetchSettings {
        FetchSettings {
            calls_per_minute: 60_000,
            max_workers: 4,
            max_retries,
            base_delay: Duration::from_millis(1),
        }
    }

    fn range() -> DateRange {
        DateRange::new(
            NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2020, 1, 31).unwrap(),
        )
        .unwrap()
    }

    fn bar() -> RawDaily {
        RawDaily {
            trade_date: NaiveDate::from_ymd_opt(2020, 1, 2).unwrap(),
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            vol: 1.0,
            amount: 1.0,
        }
    }

    struct FakeSource {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MarketDataSource for FakeSource {
        async fn ping(&self) -> Result<()> {
            Ok(())
        }

        async fn list_stocks(&self, _statuses: &[String]) -> Result<Vec<InstrumentInfo>> {
            Ok(Vec::new())
        }

        async fn daily(&self, ts_code: &str, _range: &DateRange) -> Result<Vec<RawDaily>> {
            self.calls.lock().unwrap().push(format!("daily:{}", ts_code));
            match ts_code {
                "000002.SZ" => Ok(Vec::new()),
                "000003.SZ" => Err(EtlError::ProcessingError {
                    message: "boom".to_string(),
                }),
                _ => Ok(vec![bar()]),
            }
        }

        async fn adj_factor(&self, ts_code: &str, _range: &DateRange) -> Result<Vec<AdjFactor>> {
            self.calls.lock().unwrap().push(format!("adj:{}", ts_code));
            Ok(Vec::new())
        }

        async fn index_daily(&self, ts_code: &str, _range: &DateRange) -> Result<Vec<RawDaily>> {
            self.calls.lock().unwrap().push(format!("index:{}", ts_code));
            Ok(vec![bar()])
        }
    }

    fn info(code: &str, kind: InstrumentKind) -> InstrumentInfo {
        InstrumentInfo {
            ts_code: code.to_string(),
            name: code.to_string(),
            list_date: None,
            kind,
        }
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let fetcher = RateLimitedFetcher::new(fast_settings(3)).unwrap();
        let counter = AtomicU32::new(0);
        let counter = &counter;
        let value = fetcher
            .call("x", move || async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(EtlError::ProcessingError {
                        message: "flaky".to_string(),
                    })
                } else {
                    Ok(42)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 42);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausted() {
        let fetcher = RateLimitedFetcher::new(fast_settings(2)).unwrap();
        let err = fetcher
            .call("600000.SH", || async {
                Err::<(), _>(EtlError::ProcessingError {
                    message: "down".to_string(),
                })
            })
            .await
            .unwrap_err();
        match err {
            EtlError::RetryExhausted {
                target, attempts, ..
            } => {
                assert_eq!(target, "600000.SH");
                assert_eq!(attempts, 2);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_rejects_zero_rate() {
        let mut settings = fast_settings(1);
        settings.calls_per_minute = 0;
        assert!(RateLimitedFetcher::new(settings).is_err());
    }

    #[test]
    fn test_estimate() {
        let mut settings = fast_settings(1);
        settings.calls_per_minute = 200;
        let fetcher = RateLimitedFetcher::new(settings).unwrap();
        assert_eq!(fetcher.estimate(400), Duration::from_secs(120));
    }

    #[test]
    fn test_quota_has_no_burst() {
        let quota = pacing_quota(NonZeroU32::new(2).unwrap());
        assert_eq!(quota.burst_size().get(), 1);
        assert_eq!(quota.replenish_interval(), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_calls_are_paced_from_the_first_request() {
        let mut settings = fast_settings(1);
        // 每 50ms 一次
        settings.calls_per_minute = 1_200;
        let fetcher = RateLimitedFetcher::new(settings).unwrap();

        let started = Instant::now();
        for _ in 0..3 {
            fetcher.call("x", || async { Ok(()) }).await.unwrap();
        }
        assert!(
            started.elapsed() >= Duration::from_millis(90),
            "3 calls finished in {:?}",
            started.elapsed()
        );
    }

    #[tokio::test]
    async fn test_download_empty_universe() {
        let fetcher = RateLimitedFetcher::new(fast_settings(1)).unwrap();
        let source = FakeSource {
            calls: Mutex::new(Vec::new()),
        };

        let report = fetcher.download_universe(&source, &[], &range()).await;

        assert!(report.series.is_empty());
        assert!(report.failed.is_empty());
        assert!(source.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_one_failing_instrument_does_not_stop_the_rest() {
        let fetcher = RateLimitedFetcher::new(fast_settings(2)).unwrap();
        let source = FakeSource {
            calls: Mutex::new(Vec::new()),
        };
        let universe = vec![
            info("000003.SZ", InstrumentKind::Stock),
            info("600000.SH", InstrumentKind::Stock),
            info("600001.SH", InstrumentKind::Stock),
        ];

        let report = fetcher.download_universe(&source, &universe, &range()).await;

        let mut codes: Vec<&str> = report.series.iter().map(|s| s.ts_code.as_str()).collect();
        codes.sort();
        assert_eq!(codes, vec!["600000.SH", "600001.SH"]);
        assert_eq!(report.failed, vec!["000003.SZ"]);
        let calls = source.calls.lock().unwrap();
        // 失敗的標的重試到上限
        assert_eq!(calls.iter().filter(|c| *c == "daily:000003.SZ").count(), 2);
        assert!(!calls.contains(&"adj:000003.SZ".to_string()));
    }

    #[tokio::test]
    async fn test_download_universe_collects_failures() {
        let fetcher = RateLimitedFetcher::new(fast_settings(1)).unwrap();
        let source = FakeSource {
            calls: Mutex::new(Vec::new()),
        };
        let universe = vec![
            info("000001.SZ", InstrumentKind::Stock),
            info("000002.SZ", InstrumentKind::Stock),
            info("000003.SZ", InstrumentKind::Stock),
            info("000300.SH", InstrumentKind::Index),
        ];

        let report = fetcher.download_universe(&source, &universe, &range()).await;

        assert_eq!(report.series.len(), 2);
        assert_eq!(report.failed, vec!["000002.SZ", "000003.SZ"]);
        let calls = source.calls.lock().unwrap();
        assert!(calls.contains(&"adj:000001.SZ".to_string()));
        assert!(calls.contains(&"index:000300.SH".to_string()));
        assert!(!calls.contains(&"adj:000002.SZ".to_string()));
    }
}
