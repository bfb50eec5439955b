//! 研究框架使用的二進位特徵目錄
//!
//! ```text
//! <root>/calendars/day.txt
//! <root>/instruments/all.txt            code<TAB>start<TAB>end
//! <root>/features/<code>/<field>.day.bin
//! ```
//!
//! 每個 `.bin` 檔是 little-endian `f32`：第一個值為首筆資料在日曆中的索引，
//! 之後每個日曆日一個值直到該標的最後一日，缺值為 NaN。

use crate::adapters::table::parse_date;
use crate::domain::model::{Field, PvRow, PvTable};
use crate::domain::ports::Storage;
use crate::utils::error::{EtlError, Result};
use chrono::NaiveDate;
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

pub const CALENDAR_PATH: &str = "calendars/day.txt";
pub const INSTRUMENTS_PATH: &str = "instruments/all.txt";
pub const FEATURES_DIR: &str = "features";
const FREQ: &str = "day";

pub fn feature_path(code: &str, field_name: &str) -> String {
    format!(
        "{}/{}/{}.{}.bin",
        FEATURES_DIR,
        code.to_lowercase(),
        field_name,
        FREQ
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentSpan {
    pub code: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl InstrumentSpan {
    pub fn to_line(&self) -> String {
        format!(
            "{}\t{}\t{}",
            self.code,
            self.start.format("%Y-%m-%d"),
            self.end.format("%Y-%m-%d")
        )
    }

    pub fn parse_line(line: &str) -> Option<Self> {
        let mut parts = line.split('\t').map(str::trim);
        let code = parts.next().filter(|c| !c.is_empty())?;
        let start = parse_date(parts.next()?)?;
        let end = parse_date(parts.next()?)?;
        Some(Self {
            code: code.to_string(),
            start,
            end,
        })
    }
}

/// 單一特徵檔內容
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureSeries {
    pub start_index: usize,
    pub values: Vec<f32>,
}

impl FeatureSeries {
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity((self.values.len() + 1) * 4);
        bytes.extend_from_slice(&(self.start_index as f32).to_le_bytes());
        for v in &self.values {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        bytes
    }

    pub fn decode(bytes: &[u8], path: &str) -> Result<Self> {
        if bytes.len() < 4 || bytes.len() % 4 != 0 {
            return Err(EtlError::FormatError {
                path: path.to_string(),
                reason: format!("{} bytes is not a whole number of f32 values", bytes.len()),
            });
        }
        let mut floats = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]));
        let header = floats.next().unwrap_or(f32::NAN);
        if !header.is_finite() || header < 0.0 || header.fract() != 0.0 {
            return Err(EtlError::FormatError {
                path: path.to_string(),
                reason: format!("invalid calendar start index {}", header),
            });
        }
        Ok(Self {
            start_index: header as usize,
            values: floats.collect(),
        })
    }

    /// 最後一個樣本在日曆中的索引
    pub fn end_index(&self) -> Option<usize> {
        (!self.values.is_empty()).then(|| self.start_index + self.values.len() - 1)
    }
}

#[derive(Debug, Clone, Default)]
pub struct DumpSummary {
    pub calendar_days: usize,
    pub instruments: usize,
    pub files: usize,
}

pub struct QlibBinStore<S: Storage> {
    storage: S,
}

impl<S: Storage> QlibBinStore<S> {
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub async fn read_calendar(&self) -> Result<Vec<NaiveDate>> {
        let bytes = self.storage.read_file(CALENDAR_PATH).await?;
        let text = String::from_utf8_lossy(&bytes);
        text.lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(|l| {
                parse_date(l).ok_or_else(|| EtlError::FormatError {
                    path: CALENDAR_PATH.to_string(),
                    reason: format!("bad calendar date '{}'", l),
                })
            })
            .collect()
    }

    pub async fn write_calendar(&self, dates: &[NaiveDate]) -> Result<()> {
        let mut text = String::new();
        for d in dates {
            text.push_str(&d.format("%Y-%m-%d").to_string());
            text.push('\n');
        }
        self.storage.write_file(CALENDAR_PATH, text.as_bytes()).await
    }

    /// 無法解析的行會被略過並記錄
    pub async fn read_instruments(&self) -> Result<Vec<InstrumentSpan>> {
        let bytes = self.storage.read_file(INSTRUMENTS_PATH).await?;
        let text = String::from_utf8_lossy(&bytes);
        let mut spans = Vec::new();
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            match InstrumentSpan::parse_line(line) {
                Some(span) => spans.push(span),
                None => tracing::warn!("⚠️ Skipping malformed instruments line: {:?}", line),
            }
        }
        Ok(spans)
    }

    pub async fn write_instruments(&self, spans: &[InstrumentSpan]) -> Result<()> {
        let mut text = String::new();
        for span in spans {
            text.push_str(&span.to_line());
            text.push('\n');
        }
        self.storage.write_file(INSTRUMENTS_PATH, text.as_bytes()).await
    }

    /// 檔案不存在時回傳 None
    pub async fn read_feature(&self, code: &str, field_name: &str) -> Result<Option<FeatureSeries>> {
        let path = feature_path(code, field_name);
        if !self.storage.exists(&path).await {
            return Ok(None);
        }
        let bytes = self.storage.read_file(&path).await?;
        FeatureSeries::decode(&bytes, &path).map(Some)
    }

    pub async fn write_feature(&self, code: &str, field_name: &str, series: &FeatureSeries) -> Result<()> {
        self.storage
            .write_file(&feature_path(code, field_name), &series.encode())
            .await
    }

    /// features/ 底下的標的目錄名稱
    pub async fn feature_dirs(&self) -> Result<Vec<String>> {
        if !self.storage.exists(FEATURES_DIR).await {
            return Ok(Vec::new());
        }
        self.storage.list_dir(FEATURES_DIR).await
    }

    /// 將長表寫成日曆、標的清單與逐欄位特徵檔
    pub async fn dump_table(&self, table: &PvTable) -> Result<DumpSummary> {
        let calendar = table.dates();
        let positions: HashMap<NaiveDate, usize> =
            calendar.iter().enumerate().map(|(i, d)| (*d, i)).collect();
        self.write_calendar(&calendar).await?;

        let groups = table.group_by_instrument();
        let mut codes: Vec<&str> = groups.keys().copied().collect();
        codes.sort_unstable();

        let mut spans = Vec::with_capacity(codes.len());
        let mut files = 0;
        for code in codes {
            let rows = &groups[code];
            let (first, last) = match (rows.first(), rows.last()) {
                (Some(f), Some(l)) => (f, l),
                _ => continue,
            };
            let start = positions[&first.datetime];
            let end = positions[&last.datetime];

            for field in Field::ALL {
                let mut values = vec![f32::NAN; end - start + 1];
                for row in rows {
                    if let Some(v) = row.get(field) {
                        values[positions[&row.datetime] - start] = v;
                    }
                }
                self.write_feature(code, field.name(), &FeatureSeries { start_index: start, values })
                    .await?;
                files += 1;
            }
            spans.push(InstrumentSpan {
                code: code.to_string(),
                start: first.datetime,
                end: last.datetime,
            });
        }
        self.write_instruments(&spans).await?;

        tracing::info!(
            "💾 Dumped {} instruments over {} calendar days ({} feature files)",
            spans.len(),
            calendar.len(),
            files
        );
        Ok(DumpSummary {
            calendar_days: calendar.len(),
            instruments: spans.len(),
            files,
        })
    }

    /// 由二進位目錄重建長表；缺少 factor 檔時因子為 1.0
    pub async fn load_table(&self) -> Result<PvTable> {
        let calendar = self.read_calendar().await?;
        let spans = self.read_instruments().await?;
        let mut rows = Vec::new();

        for span in &spans {
            let mut by_date: BTreeMap<NaiveDate, PvRow> = BTreeMap::new();
            let mut has_factor = false;

            for field in Field::ALL {
                let Some(series) = self.read_feature(&span.code, field.name()).await? else {
                    continue;
                };
                has_factor |= field == Field::Factor;
                for (offset, value) in series.values.iter().enumerate() {
                    let Some(date) = calendar.get(series.start_index + offset) else {
                        tracing::warn!(
                            "⚠️ {} {} runs past the calendar end",
                            span.code,
                            field.name()
                        );
                        break;
                    };
                    if value.is_nan() {
                        continue;
                    }
                    by_date
                        .entry(*date)
                        .or_insert_with(|| PvRow::empty(*date, span.code.as_str()))
                        .set(field, Some(*value));
                }
            }

            if by_date.is_empty() {
                tracing::warn!("⚠️ {} has no feature data", span.code);
                continue;
            }
            rows.extend(by_date.into_values().map(|mut row| {
                if !has_factor {
                    row.factor = Some(1.0);
                }
                row
            }));
        }

        Ok(PvTable::new(rows))
    }
}

/// 單一標的 CSV 解析結果
#[derive(Debug)]
struct SymbolFrame {
    symbol: String,
    dates: Vec<NaiveDate>,
    columns: BTreeMap<String, Vec<f32>>,
}

#[derive(Debug, Default)]
pub struct ConvertSummary {
    pub converted: usize,
    pub skipped: Vec<String>,
    pub calendar_days: usize,
}

/// 欄位名與代碼會成為特徵檔路徑的一段
fn is_path_safe(name: &str) -> bool {
    !name.is_empty() && !name.contains(['/', '\\']) && !name.contains("..")
}

/// 解析 `date,symbol,<numeric...>` 格式的單一標的 CSV
fn parse_symbol_csv(path: &Path) -> Result<SymbolFrame> {
    let display = path.display().to_string();
    let mut reader = csv::Reader::from_path(path)?;
    let headers = reader.headers()?.clone();
    let date_idx = headers
        .iter()
        .position(|h| h == "date")
        .ok_or_else(|| EtlError::FormatError {
            path: display.clone(),
            reason: "missing 'date' column".to_string(),
        })?;
    let symbol_idx = headers
        .iter()
        .position(|h| h == "symbol")
        .ok_or_else(|| EtlError::FormatError {
            path: display.clone(),
            reason: "missing 'symbol' column".to_string(),
        })?;
    let value_cols: Vec<(usize, String)> = headers
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != date_idx && *i != symbol_idx)
        .map(|(i, h)| (i, h.trim().trim_start_matches('$').to_lowercase()))
        .collect();
    if let Some((_, bad)) = value_cols.iter().find(|(_, name)| !is_path_safe(name)) {
        return Err(EtlError::FormatError {
            path: display,
            reason: format!("column name '{}' cannot be used as a feature file name", bad),
        });
    }

    let mut symbol = None;
    let mut by_date: BTreeMap<NaiveDate, Vec<f32>> = BTreeMap::new();
    for record in reader.records() {
        let record = record?;
        let Some(date) = record.get(date_idx).and_then(parse_date) else {
            continue;
        };
        if symbol.is_none() {
            symbol = record
                .get(symbol_idx)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string);
        }
        let values = value_cols
            .iter()
            .map(|(i, _)| {
                record
                    .get(*i)
                    .and_then(crate::adapters::table::parse_value)
                    .unwrap_or(f32::NAN)
            })
            .collect();
        by_date.insert(date, values);
    }

    let symbol = symbol.ok_or_else(|| EtlError::FormatError {
        path: display.clone(),
        reason: "no rows with a valid date and symbol".to_string(),
    })?;
    if !is_path_safe(&symbol) {
        return Err(EtlError::FormatError {
            path: display,
            reason: format!("symbol '{}' cannot be used as a directory name", symbol),
        });
    }

    let dates: Vec<NaiveDate> = by_date.keys().copied().collect();
    let mut columns: BTreeMap<String, Vec<f32>> = BTreeMap::new();
    for (pos, (_, name)) in value_cols.iter().enumerate() {
        columns.insert(name.clone(), by_date.values().map(|v| v[pos]).collect());
    }

    Ok(SymbolFrame {
        symbol,
        dates,
        columns,
    })
}

/// 將目錄下每個標的一檔的 CSV 轉成二進位目錄，所有標的對齊聯集日曆
pub async fn convert_csv_dir<S: Storage>(
    input_dir: &Path,
    store: &QlibBinStore<S>,
    workers: usize,
) -> Result<ConvertSummary> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(input_dir)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.extension().map(|e| e == "csv").unwrap_or(false))
        .collect();
    files.sort();
    tracing::info!("🔍 Found {} CSV files in {}", files.len(), input_dir.display());

    let mut summary = ConvertSummary::default();
    let mut frames = Vec::new();
    let mut parsed = stream::iter(files)
        .map(|path| async move {
            let outcome = tokio::task::spawn_blocking({
                let path = path.clone();
                move || parse_symbol_csv(&path)
            })
            .await;
            (path, outcome)
        })
        .buffer_unordered(workers.max(1));

    while let Some((path, outcome)) = parsed.next().await {
        match outcome {
            Ok(Ok(frame)) => frames.push(frame),
            Ok(Err(e)) => {
                tracing::warn!("⚠️ Skipping {}: {}", path.display(), e);
                summary.skipped.push(path.display().to_string());
            }
            Err(e) => {
                tracing::warn!("⚠️ Worker for {} failed: {}", path.display(), e);
                summary.skipped.push(path.display().to_string());
            }
        }
    }
    frames.sort_by(|a, b| a.symbol.cmp(&b.symbol));
    summary.skipped.sort();

    let calendar: Vec<NaiveDate> = frames
        .iter()
        .flat_map(|f| f.dates.iter().copied())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let positions: HashMap<NaiveDate, usize> =
        calendar.iter().enumerate().map(|(i, d)| (*d, i)).collect();
    store.write_calendar(&calendar).await?;

    let mut spans = Vec::new();
    for frame in &frames {
        let (Some(first), Some(last)) = (frame.dates.first(), frame.dates.last()) else {
            continue;
        };
        let start = positions[first];
        let end = positions[last];
        for (name, values) in &frame.columns {
            let mut aligned = vec![f32::NAN; end - start + 1];
            for (date, value) in frame.dates.iter().zip(values) {
                aligned[positions[date] - start] = *value;
            }
            store
                .write_feature(&frame.symbol, name, &FeatureSeries { start_index: start, values: aligned })
                .await?;
        }
        spans.push(InstrumentSpan {
            code: frame.symbol.to_uppercase(),
            start: *first,
            end: *last,
        });
    }
    store.write_instruments(&spans).await?;

    summary.converted = spans.len();
    summary.calendar_days = calendar.len();
    tracing::info!(
        "✅ Converted {} symbols over {} trading days ({} skipped)",
        summary.converted,
        summary.calendar_days,
        summary.skipped.len()
    );
    Ok(summary)
}
