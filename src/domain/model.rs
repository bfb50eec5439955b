use crate::utils::error::{EtlError, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// 標的代碼轉換：`000001.SZ` -> `SZ000001`
pub fn ts_code_to_qlib(ts_code: &str) -> Result<String> {
    match ts_code.split_once('.') {
        Some((symbol, exchange)) if !symbol.is_empty() && !exchange.is_empty() => {
            Ok(format!("{}{}", exchange.to_uppercase(), symbol))
        }
        _ => Err(EtlError::ValidationError {
            message: format!("Instrument code '{}' has no exchange suffix", ts_code),
        }),
    }
}

/// 標的代碼轉換：`SZ000001` -> `000001.SZ`
pub fn qlib_to_ts_code(code: &str) -> Result<String> {
    if code.len() < 3 || !code.is_char_boundary(2) {
        return Err(EtlError::ValidationError {
            message: format!("Instrument code '{}' is too short", code),
        });
    }
    let (exchange, symbol) = code.split_at(2);
    Ok(format!("{}.{}", symbol, exchange.to_uppercase()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstrumentKind {
    Stock,
    Index,
}

impl InstrumentKind {
    /// 依代碼前綴判斷股票或指數 (SZ399 開頭為深市指數)
    pub fn classify(code: &str) -> Self {
        let upper = code.to_uppercase();
        if upper.starts_with("SZ399") {
            return InstrumentKind::Index;
        }
        if ["SH6", "SZ0", "SZ3", "BJ"].iter().any(|p| upper.starts_with(p)) {
            InstrumentKind::Stock
        } else {
            InstrumentKind::Index
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Field {
    Open,
    Close,
    High,
    Low,
    Volume,
    Factor,
}

impl Field {
    /// 資料集標準欄位順序
    pub const ALL: [Field; 6] = [
        Field::Open,
        Field::Close,
        Field::High,
        Field::Low,
        Field::Volume,
        Field::Factor,
    ];

    pub const PRICES: [Field; 4] = [Field::Open, Field::Close, Field::High, Field::Low];

    /// 不含 `$` 前綴的特徵名稱，即二進位檔名
    pub fn name(&self) -> &'static str {
        match self {
            Field::Open => "open",
            Field::Close => "close",
            Field::High => "high",
            Field::Low => "low",
            Field::Volume => "volume",
            Field::Factor => "factor",
        }
    }

    pub fn column(&self) -> &'static str {
        match self {
            Field::Open => "$open",
            Field::Close => "$close",
            Field::High => "$high",
            Field::Low => "$low",
            Field::Volume => "$volume",
            Field::Factor => "$factor",
        }
    }

    pub fn from_column(column: &str) -> Option<Self> {
        let name = column.trim_start_matches('$');
        Field::ALL.iter().copied().find(|f| f.name() == name)
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column())
    }
}

/// 單一 (日期, 標的) 的行情列
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PvRow {
    pub datetime: NaiveDate,
    pub instrument: String,
    pub open: Option<f32>,
    pub close: Option<f32>,
    pub high: Option<f32>,
    pub low: Option<f32>,
    pub volume: Option<f32>,
    pub factor: Option<f32>,
}

impl PvRow {
    pub fn empty(datetime: NaiveDate, instrument: impl Into<String>) -> Self {
        Self {
            datetime,
            instrument: instrument.into(),
            open: None,
            close: None,
            high: None,
            low: None,
            volume: None,
            factor: None,
        }
    }

    pub fn get(&self, field: Field) -> Option<f32> {
        let value = match field {
            Field::Open => self.open,
            Field::Close => self.close,
            Field::High => self.high,
            Field::Low => self.low,
            Field::Volume => self.volume,
            Field::Factor => self.factor,
        };
        value.filter(|v| !v.is_nan())
    }

    pub fn set(&mut self, field: Field, value: Option<f32>) {
        let value = value.filter(|v| !v.is_nan());
        match field {
            Field::Open => self.open = value,
            Field::Close => self.close = value,
            Field::High => self.high = value,
            Field::Low => self.low = value,
            Field::Volume => self.volume = value,
            Field::Factor => self.factor = value,
        }
    }

    pub fn is_empty(&self) -> bool {
        Field::ALL.iter().all(|f| self.get(*f).is_none())
    }

    pub fn is_complete(&self) -> bool {
        Field::ALL.iter().all(|f| self.get(*f).is_some())
    }

    fn key(&self) -> (NaiveDate, &str) {
        (self.datetime, self.instrument.as_str())
    }
}

/// 以 (datetime, instrument) 排序的長表
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PvTable {
    rows: Vec<PvRow>,
}

impl PvTable {
    pub fn new(mut rows: Vec<PvRow>) -> Self {
        rows.sort_by(|a, b| a.key().cmp(&b.key()));
        Self { rows }
    }

    pub fn from_parts(parts: Vec<Vec<PvRow>>) -> Self {
        Self::new(parts.into_iter().flatten().collect())
    }

    pub fn rows(&self) -> &[PvRow] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<PvRow> {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// (rows, columns)
    pub fn shape(&self) -> (usize, usize) {
        (self.rows.len(), Field::ALL.len())
    }

    pub fn instruments(&self) -> Vec<String> {
        let set: BTreeSet<&str> = self.rows.iter().map(|r| r.instrument.as_str()).collect();
        set.into_iter().map(str::to_string).collect()
    }

    pub fn dates(&self) -> Vec<NaiveDate> {
        let set: BTreeSet<NaiveDate> = self.rows.iter().map(|r| r.datetime).collect();
        set.into_iter().collect()
    }

    pub fn date_range(&self) -> Option<(NaiveDate, NaiveDate)> {
        match (self.rows.first(), self.rows.last()) {
            (Some(first), Some(last)) => Some((first.datetime, last.datetime)),
            _ => None,
        }
    }

    /// 取得某標的全部列，依日期排序
    pub fn instrument_rows(&self, instrument: &str) -> Vec<&PvRow> {
        self.rows.iter().filter(|r| r.instrument == instrument).collect()
    }

    pub fn series(&self, instrument: &str, field: Field) -> Vec<(NaiveDate, Option<f32>)> {
        self.rows
            .iter()
            .filter(|r| r.instrument == instrument)
            .map(|r| (r.datetime, r.get(field)))
            .collect()
    }

    /// 一次分組所有標的，避免對每個標的重複掃描
    pub fn group_by_instrument(&self) -> HashMap<&str, Vec<&PvRow>> {
        let mut groups: HashMap<&str, Vec<&PvRow>> = HashMap::new();
        for row in &self.rows {
            groups.entry(row.instrument.as_str()).or_default().push(row);
        }
        groups
    }

    pub fn retain_from(&mut self, start: NaiveDate) {
        self.rows.retain(|r| r.datetime >= start);
    }

    pub fn retain_between(&mut self, start: NaiveDate, end: NaiveDate) {
        self.rows.retain(|r| r.datetime >= start && r.datetime <= end);
    }

    pub fn retain_instruments(&mut self, keep: &BTreeSet<String>) {
        self.rows.retain(|r| keep.contains(&r.instrument));
    }

    pub fn drop_empty_rows(&mut self) -> usize {
        let before = self.rows.len();
        self.rows.retain(|r| !r.is_empty());
        before - self.rows.len()
    }

    pub fn head(&self, n: usize) -> &[PvRow] {
        &self.rows[..n.min(self.rows.len())]
    }

    pub fn tail(&self, n: usize) -> &[PvRow] {
        &self.rows[self.rows.len().saturating_sub(n)..]
    }
}

/// 供應商原始日線 (vol 單位為手，amount 單位為千元)
#[derive(Debug, Clone, PartialEq)]
pub struct RawDaily {
    pub trade_date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub vol: f64,
    pub amount: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdjFactor {
    pub trade_date: NaiveDate,
    pub adj_factor: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentInfo {
    pub ts_code: String,
    pub name: String,
    pub list_date: Option<String>,
    pub kind: InstrumentKind,
}

/// 單一標的的下載結果
#[derive(Debug, Clone)]
pub struct RawSeries {
    pub ts_code: String,
    pub kind: InstrumentKind,
    pub daily: Vec<RawDaily>,
    pub factors: Vec<AdjFactor>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self> {
        if start > end {
            return Err(EtlError::ValidationError {
                message: format!("Start date {} is after end date {}", start, end),
            });
        }
        Ok(Self { start, end })
    }

    /// 供應商日期格式 `YYYYMMDD`
    pub fn start_compact(&self) -> String {
        self.start.format("%Y%m%d").to_string()
    }

    pub fn end_compact(&self) -> String {
        self.end.format("%Y%m%d").to_string()
    }
}

/// 複權方式：前復權以最新日為 1.0，後復權以最早日為 1.0
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdjustMode {
    #[default]
    Forward,
    Backward,
}

impl std::str::FromStr for AdjustMode {
    type Err = EtlError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "forward" | "qfq" => Ok(AdjustMode::Forward),
            "backward" | "hfq" => Ok(AdjustMode::Backward),
            other => Err(EtlError::ValidationError {
                message: format!("Unknown adjust mode '{}'", other),
            }),
        }
    }
}

/// 下載節流設定
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FetchSettings {
    pub calls_per_minute: u32,
    pub max_workers: usize,
    pub max_retries: u32,
    pub base_delay: std::time::Duration,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            calls_per_minute: 500,
            max_workers: 10,
            max_retries: 5,
            base_delay: std::time::Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TransformResult {
    pub table: PvTable,
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
    pub dropped_rows: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_code_conversion() {
        assert_eq!(ts_code_to_qlib("000001.SZ").unwrap(), "SZ000001");
        assert_eq!(ts_code_to_qlib("600519.SH").unwrap(), "SH600519");
        assert!(ts_code_to_qlib("600519").is_err());
        assert_eq!(qlib_to_ts_code("SH000300").unwrap(), "000300.SH");
        assert_eq!(qlib_to_ts_code("sz000001").unwrap(), "000001.SZ");
    }

    #[test]
    fn test_classify() {
        assert_eq!(InstrumentKind::classify("SH600519"), InstrumentKind::Stock);
        assert_eq!(InstrumentKind::classify("SZ000001"), InstrumentKind::Stock);
        assert_eq!(InstrumentKind::classify("SZ300750"), InstrumentKind::Stock);
        assert_eq!(InstrumentKind::classify("BJ430047"), InstrumentKind::Stock);
        assert_eq!(InstrumentKind::classify("SH000300"), InstrumentKind::Index);
        assert_eq!(InstrumentKind::classify("SZ399001"), InstrumentKind::Index);
        assert_eq!(InstrumentKind::classify("sh600000"), InstrumentKind::Stock);
    }

    #[test]
    fn test_field_columns() {
        assert_eq!(Field::from_column("$volume"), Some(Field::Volume));
        assert_eq!(Field::from_column("factor"), Some(Field::Factor));
        assert_eq!(Field::from_column("$adjclose"), None);
        assert_eq!(Field::ALL.map(|f| f.column()).join(","), "$open,$close,$high,$low,$volume,$factor");
    }

    #[test]
    fn test_table_sorted_by_date_then_instrument() {
        let table = PvTable::new(vec![
            PvRow::empty(date(2020, 1, 3), "SZ000001"),
            PvRow::empty(date(2020, 1, 2), "SZ000001"),
            PvRow::empty(date(2020, 1, 2), "SH600000"),
        ]);
        let keys: Vec<(NaiveDate, &str)> = table.rows().iter().map(|r| (r.datetime, r.instrument.as_str())).collect();
        assert_eq!(
            keys,
            vec![
                (date(2020, 1, 2), "SH600000"),
                (date(2020, 1, 2), "SZ000001"),
                (date(2020, 1, 3), "SZ000001"),
            ]
        );
        assert_eq!(table.instruments(), vec!["SH600000", "SZ000001"]);
        assert_eq!(table.date_range(), Some((date(2020, 1, 2), date(2020, 1, 3))));
    }

    #[test]
    fn test_nan_is_missing() {
        let mut row = PvRow::empty(date(2020, 1, 2), "SH600000");
        row.set(Field::Close, Some(f32::NAN));
        assert!(row.is_empty());
        row.close = Some(f32::NAN);
        assert_eq!(row.get(Field::Close), None);
    }

    #[test]
    fn test_drop_empty_rows() {
        let mut full = PvRow::empty(date(2020, 1, 2), "SH600000");
        full.close = Some(10.0);
        let mut table = PvTable::new(vec![full, PvRow::empty(date(2020, 1, 2), "SZ000001")]);
        assert_eq!(table.drop_empty_rows(), 1);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_adjust_mode_parse() {
        assert_eq!("qfq".parse::<AdjustMode>().unwrap(), AdjustMode::Forward);
        assert_eq!("Backward".parse::<AdjustMode>().unwrap(), AdjustMode::Backward);
        assert!("none".parse::<AdjustMode>().is_err());
    }

    #[test]
    fn test_date_range_rejects_inverted() {
        assert!(DateRange::new(date(2020, 1, 2), date(2020, 1, 1)).is_err());
        let range = DateRange::new(date(1999, 1, 1), date(2025, 7, 25)).unwrap();
        assert_eq!(range.start_compact(), "19990101");
        assert_eq!(range.end_compact(), "20250725");
    }
}
