//! 二進位目錄維護：長度檢查、標的清單修復與重建、資料子集

use crate::adapters::qlib_bin::{InstrumentSpan, QlibBinStore, INSTRUMENTS_PATH};
use crate::domain::model::{Field, PvTable};
use crate::domain::ports::Storage;
use crate::utils::error::{EtlError, Result};
use chrono::NaiveDate;
use polars::prelude::*;
use regex::Regex;
use std::collections::BTreeSet;
use std::fmt::Write;

const BACKUP_SUFFIX: &str = ".backup";

#[derive(Debug, Clone, Default)]
pub struct LengthReport {
    pub calendar_days: usize,
    pub calendar_range: Option<(NaiveDate, NaiveDate)>,
    pub instruments_listed: usize,
    pub lengths: Vec<(String, usize)>,
    pub missing: Vec<String>,
}

impl LengthReport {
    fn values(&self) -> Float64Chunked {
        Float64Chunked::from_vec(
            "length".into(),
            self.lengths.iter().map(|(_, l)| *l as f64).collect(),
        )
    }

    pub fn mean(&self) -> Option<f64> {
        self.values().mean()
    }

    pub fn median(&self) -> Option<f64> {
        self.values().median()
    }

    /// 母體標準差
    pub fn std(&self) -> Option<f64> {
        self.values().std(0)
    }

    pub fn min(&self) -> Option<usize> {
        self.lengths.iter().map(|(_, l)| *l).min()
    }

    pub fn max(&self) -> Option<usize> {
        self.lengths.iter().map(|(_, l)| *l).max()
    }

    /// 樣本數少於日曆長度的標的數
    pub fn incomplete(&self) -> usize {
        self.lengths
            .iter()
            .filter(|(_, l)| *l < self.calendar_days)
            .count()
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "1. 交易日曆: 共 {} 個交易日", self.calendar_days);
        if let Some((start, end)) = self.calendar_range {
            let _ = writeln!(out, "   {} ~ {}", start, end);
        }
        let _ = writeln!(out, "2. 標的清單: 共 {} 個標的", self.instruments_listed);
        let _ = writeln!(out, "3. 抽查 {} 個標的的 close 長度", self.lengths.len());
        for (code, len) in self.lengths.iter().take(10) {
            let warn = if *len > self.calendar_days {
                " (超過日曆長度!)"
            } else {
                ""
            };
            let _ = writeln!(out, "   {}: {} 個數據點{}", code, len, warn);
        }
        if !self.missing.is_empty() {
            let _ = writeln!(out, "   缺少 close 檔案: {}", self.missing.join(", "));
        }
        if let (Some(mean), Some(median), Some(min), Some(max), Some(std)) =
            (self.mean(), self.median(), self.min(), self.max(), self.std())
        {
            let total = self.lengths.len();
            let incomplete = self.incomplete();
            let _ = writeln!(out, "4. 長度統計:");
            let _ = writeln!(out, "   平均長度: {:.1}", mean);
            let _ = writeln!(out, "   中位數長度: {:.1}", median);
            let _ = writeln!(out, "   最小長度: {}", min);
            let _ = writeln!(out, "   最大長度: {}", max);
            let _ = writeln!(out, "   標準差: {:.1}", std);
            let _ = writeln!(
                out,
                "   數據不完整的標的: {}/{} ({:.1}%)",
                incomplete,
                total,
                incomplete as f64 / total as f64 * 100.0
            );
        }
        out
    }
}

/// 比較日曆長度與前 `limit` 個標的 close 檔的樣本數
pub async fn check_data_length<S: Storage>(store: &QlibBinStore<S>, limit: usize) -> Result<LengthReport> {
    let calendar = store.read_calendar().await?;
    let spans = store.read_instruments().await?;

    let mut report = LengthReport {
        calendar_days: calendar.len(),
        calendar_range: calendar.first().zip(calendar.last()).map(|(s, e)| (*s, *e)),
        instruments_listed: spans.len(),
        ..Default::default()
    };

    for (i, span) in spans.iter().take(limit).enumerate() {
        match store.read_feature(&span.code, Field::Close.name()).await? {
            Some(series) => report.lengths.push((span.code.clone(), series.values.len())),
            None => report.missing.push(span.code.clone()),
        }
        if (i + 1) % 20 == 0 {
            tracing::debug!("Checked {} instruments", i + 1);
        }
    }
    Ok(report)
}

#[derive(Debug, Clone)]
pub struct FixReport {
    pub codes: Vec<String>,
    pub backup: Option<String>,
}

/// 從任意格式的 all.txt 取出代碼並以預設區間重寫
pub async fn fix_instruments<S: Storage>(
    store: &QlibBinStore<S>,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<FixReport> {
    let storage = store.storage();
    let content = storage.read_file(INSTRUMENTS_PATH).await?;

    let backup_path = format!("{}{}", INSTRUMENTS_PATH, BACKUP_SUFFIX);
    let backup = if storage.exists(&backup_path).await {
        None
    } else {
        storage.write_file(&backup_path, &content).await?;
        tracing::info!("📦 Backed up instruments file to {}", backup_path);
        Some(backup_path)
    };

    let pattern = Regex::new(r"(?i)[a-z]{2}\d{6}").map_err(|e| EtlError::ProcessingError {
        message: format!("Invalid instrument pattern: {}", e),
    })?;
    let text = String::from_utf8_lossy(&content);
    let codes: BTreeSet<String> = pattern
        .find_iter(&text)
        .map(|m| m.as_str().to_lowercase())
        .collect();
    let codes: Vec<String> = codes.into_iter().collect();

    let spans: Vec<InstrumentSpan> = codes
        .iter()
        .map(|code| InstrumentSpan {
            code: code.clone(),
            start,
            end,
        })
        .collect();
    store.write_instruments(&spans).await?;
    tracing::info!("✅ Rewrote instruments file with {} codes", codes.len());

    Ok(FixReport { codes, backup })
}

/// 依 close 特徵檔的首末有效值重新計算每個標的的真實區間
pub async fn rebuild_instruments<S: Storage>(store: &QlibBinStore<S>) -> Result<Vec<InstrumentSpan>> {
    let calendar = store.read_calendar().await?;
    let mut spans = Vec::new();

    for dir in store.feature_dirs().await? {
        let Some(series) = store.read_feature(&dir, Field::Close.name()).await? else {
            tracing::warn!("⚠️ {} has no close feature, skipped", dir);
            continue;
        };
        let first = series.values.iter().position(|v| !v.is_nan());
        let last = series.values.iter().rposition(|v| !v.is_nan());
        let (Some(first), Some(last)) = (first, last) else {
            tracing::warn!("⚠️ {} close feature is all NaN, skipped", dir);
            continue;
        };
        let (Some(start), Some(end)) = (
            calendar.get(series.start_index + first),
            calendar.get(series.start_index + last),
        ) else {
            tracing::warn!("⚠️ {} runs past the calendar end, skipped", dir);
            continue;
        };
        spans.push(InstrumentSpan {
            code: dir.to_uppercase(),
            start: *start,
            end: *end,
        });
    }

    store.write_instruments(&spans).await?;
    tracing::info!("✅ Rebuilt instruments file with {} entries", spans.len());
    Ok(spans)
}

#[derive(Debug, Clone)]
pub struct SubsetOptions {
    pub cutoff: NaiveDate,
    pub debug_start: NaiveDate,
    pub debug_end: NaiveDate,
    pub debug_instruments: usize,
}

impl Default for SubsetOptions {
    fn default() -> Self {
        Self {
            cutoff: NaiveDate::from_ymd_opt(2008, 12, 29).unwrap_or_default(),
            debug_start: NaiveDate::from_ymd_opt(2018, 1, 1).unwrap_or_default(),
            debug_end: NaiveDate::from_ymd_opt(2019, 12, 31).unwrap_or_default(),
            debug_instruments: 100,
        }
    }
}

/// 產生 (完整資料, 除錯資料)
pub fn subset(table: &PvTable, options: &SubsetOptions) -> Result<(PvTable, PvTable)> {
    if options.debug_start > options.debug_end {
        return Err(EtlError::ValidationError {
            message: format!(
                "Debug window start {} is after end {}",
                options.debug_start, options.debug_end
            ),
        });
    }

    let mut full = table.clone();
    full.retain_from(options.cutoff);
    full.drop_empty_rows();

    let mut debug_table = full.clone();
    debug_table.retain_between(options.debug_start, options.debug_end);
    let keep: BTreeSet<String> = debug_table
        .instruments()
        .into_iter()
        .take(options.debug_instruments)
        .collect();
    debug_table.retain_instruments(&keep);

    tracing::info!(
        "✂️ Full subset {} rows, debug subset {} rows / {} instruments",
        full.len(),
        debug_table.len(),
        keep.len()
    );
    Ok((full, debug_table))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::PvRow;

    fn row(y: i32, m: u32, d: u32, code: &str) -> PvRow {
        let mut r = PvRow::empty(NaiveDate::from_ymd_opt(y, m, d).unwrap(), code);
        r.close = Some(1.0);
        r
    }

    #[test]
    fn test_length_stats() {
        let report = LengthReport {
            calendar_days: 4,
            lengths: vec![("a".into(), 4), ("b".into(), 2), ("c".into(), 3)],
            ..Default::default()
        };
        assert_eq!(report.mean(), Some(3.0));
        assert_eq!(report.median(), Some(3.0));
        assert_eq!(report.min(), Some(2));
        assert_eq!(report.max(), Some(4));
        assert_eq!(report.incomplete(), 2);
        assert!((report.std().unwrap() - (2.0f64 / 3.0).sqrt()).abs() < 1e-9);
        assert!(report.render().contains("2/3"));

        let even = LengthReport {
            lengths: vec![("a".into(), 4), ("b".into(), 1)],
            ..Default::default()
        };
        assert_eq!(even.median(), Some(2.5));
        assert_eq!(LengthReport::default().mean(), None);
    }

    #[test]
    fn test_subset() {
        let table = PvTable::new(vec![
            row(2008, 1, 2, "SH600000"),
            row(2018, 5, 2, "SH600000"),
            row(2018, 5, 2, "SZ000001"),
            row(2020, 5, 2, "SZ000002"),
        ]);
        let options = SubsetOptions {
            debug_instruments: 1,
            ..Default::default()
        };
        let (full, debug) = subset(&table, &options).unwrap();
        assert_eq!(full.len(), 3);
        assert_eq!(debug.instruments(), vec!["SH600000"]);
        assert_eq!(debug.len(), 1);
    }

    #[test]
    fn test_subset_rejects_inverted_window() {
        let options = SubsetOptions {
            debug_start: NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(),
            debug_end: NaiveDate::from_ymd_opt(2019, 1, 1).unwrap(),
            ..Default::default()
        };
        assert!(subset(&PvTable::default(), &options).is_err());
    }
}
