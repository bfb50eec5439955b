//! 單一資料集審核

use crate::adapters::frame;
use crate::core::adjust::{monotonicity, Monotonicity};
use crate::domain::model::{Field, InstrumentKind, PvRow, PvTable};
use crate::utils::error::Result;
use crate::utils::report::{sample, section, Checklist};
use crate::utils::stats::Describe;
use polars::prelude::DataFrame;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::fmt::Write;

/// 價格違規比例上限
pub const MAX_PRICE_VIOLATION_RATE: f64 = 0.0001;
/// 相對容差，吸收 f32 四捨五入誤差
const PRICE_TOLERANCE: f32 = 1e-5;

#[derive(Debug, Clone)]
pub struct AuditOptions {
    pub sample_size: usize,
    pub seed: Option<u64>,
    pub sample_instrument: String,
    pub preview_rows: usize,
}

impl Default for AuditOptions {
    fn default() -> Self {
        Self {
            sample_size: 500,
            seed: None,
            sample_instrument: "SH600519".to_string(),
            preview_rows: 5,
        }
    }
}

#[derive(Debug)]
pub struct AuditReport {
    pub checks: Checklist,
    pub text: String,
}

/// 依代碼分為 (股票, 指數)
pub fn split_instruments(instruments: &[String]) -> (Vec<String>, Vec<String>) {
    instruments
        .iter()
        .cloned()
        .partition(|code| InstrumentKind::classify(code) == InstrumentKind::Stock)
}

pub fn sample_codes(codes: &[String], n: usize, seed: Option<u64>) -> Vec<String> {
    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let mut picked: Vec<String> = codes.choose_multiple(&mut rng, n.min(codes.len())).cloned().collect();
    picked.sort();
    picked
}

/// 回傳因子序列不是非遞減的標的
pub fn factor_violations(table: &PvTable, codes: &[String]) -> Vec<String> {
    let groups = table.group_by_instrument();
    codes
        .iter()
        .filter(|code| {
            groups
                .get(code.as_str())
                .map(|rows| {
                    let mono: Monotonicity = monotonicity(rows.iter().map(|r| r.get(Field::Factor)));
                    !mono.is_valid_stock_factor()
                })
                .unwrap_or(false)
        })
        .cloned()
        .collect()
}

/// 指數中因子不等於 1.0 的值 (標的, 值)
pub fn index_factor_anomalies(table: &PvTable) -> Vec<(String, f32)> {
    table
        .rows()
        .iter()
        .filter(|r| InstrumentKind::classify(&r.instrument) == InstrumentKind::Index)
        .filter_map(|r| r.get(Field::Factor).map(|f| (r, f)))
        .filter(|(_, f)| *f != 1.0)
        .map(|(r, f)| (r.instrument.clone(), f))
        .collect()
}

fn outside(value: f32, low: f32, high: f32) -> bool {
    let slack = PRICE_TOLERANCE * high.abs().max(1.0);
    value > high + slack || value < low - slack
}

/// (違規列數, 受檢列數)
pub fn price_violations(table: &PvTable) -> (usize, usize) {
    let mut checked = 0;
    let mut violations = 0;
    for row in table.rows() {
        let (Some(open), Some(close), Some(high), Some(low)) = (
            row.get(Field::Open),
            row.get(Field::Close),
            row.get(Field::High),
            row.get(Field::Low),
        ) else {
            continue;
        };
        checked += 1;
        if outside(open, low, high) || outside(close, low, high) {
            violations += 1;
        }
    }
    (violations, checked)
}

pub fn missing_counts(frame: &DataFrame) -> Result<Vec<(Field, usize)>> {
    Field::ALL
        .iter()
        .map(|f| Ok((*f, frame.column(f.column())?.null_count())))
        .collect()
}

pub fn describe_field(frame: &DataFrame, field: Field) -> Result<Option<Describe>> {
    Describe::from_column(frame.column(field.column())?)
}

fn fmt_value(v: Option<f32>) -> String {
    v.map(|v| format!("{:.4}", v)).unwrap_or_else(|| "NaN".to_string())
}

pub fn render_rows<'a>(rows: impl IntoIterator<Item = &'a PvRow>) -> String {
    let mut out = format!("{:<12}{:<12}", "datetime", "instrument");
    for field in Field::ALL {
        out.push_str(&format!("{:>16}", field.column()));
    }
    out.push('\n');
    for row in rows {
        out.push_str(&format!("{:<12}{:<12}", row.datetime, row.instrument));
        for field in Field::ALL {
            out.push_str(&format!("{:>16}", fmt_value(row.get(field))));
        }
        out.push('\n');
    }
    out
}

pub fn audit_table(table: &PvTable, options: &AuditOptions) -> Result<AuditReport> {
    let frame = frame::to_frame(table)?;
    let mut checks = Checklist::new();
    let mut text = String::new();

    // 1. 結構
    let _ = writeln!(text, "{}", section("1. 數據結構"));
    let (rows, cols) = table.shape();
    let instruments = table.instruments();
    let _ = writeln!(text, "形狀: ({}, {})", rows, cols);
    let _ = writeln!(text, "列名: {}", Field::ALL.map(|f| f.column()).join(", "));
    match table.date_range() {
        Some((start, end)) => {
            let _ = writeln!(
                text,
                "日期範圍: {} ~ {} (共 {} 個交易日)",
                start,
                end,
                table.dates().len()
            );
        }
        None => {
            let _ = writeln!(text, "日期範圍: (空)");
        }
    }
    let _ = writeln!(text, "標的數量: {}", instruments.len());
    checks.check(
        "數據非空",
        !table.is_empty(),
        format!("共 {} 行", rows),
        "數據表為空",
        None,
    );

    // 2. 標的分類
    let (stocks, indices) = split_instruments(&instruments);
    let _ = writeln!(text, "{}", section("2. 標的代碼"));
    let _ = writeln!(text, "股票數量: {}  樣例: {}", stocks.len(), sample(&stocks, 10));
    let _ = writeln!(text, "指數數量: {}  樣例: {}", indices.len(), sample(&indices, 10));

    // 3. 因子
    let _ = writeln!(text, "{}", section("3. 複權因子 ($factor)"));
    if stocks.is_empty() {
        checks.skip("股票因子單調性", "沒有股票數據");
    } else {
        let sampled = sample_codes(&stocks, options.sample_size, options.seed);
        let bad = factor_violations(table, &sampled);
        let _ = writeln!(text, "抽查 {} 隻股票的 $factor 單調性", sampled.len());
        checks.check(
            "股票因子單調性",
            bad.is_empty(),
            format!("抽樣的 {} 隻股票因子均為單調非遞減", sampled.len()),
            format!("{}/{} 隻抽樣股票因子非單調", bad.len(), sampled.len()),
            Some(format!("  - 樣例: {}", sample(&bad, 10))),
        );
    }

    if indices.is_empty() {
        checks.skip("指數因子", "沒有指數數據");
    } else {
        let anomalies = index_factor_anomalies(table);
        let mut affected: Vec<String> = anomalies.iter().map(|(c, _)| c.clone()).collect();
        affected.sort();
        affected.dedup();
        let details = Describe::from_values(anomalies.iter().map(|(_, v)| f64::from(*v)))?
            .map(|d| format!("  - 涉及指數: {}\n{}", sample(&affected, 10), d.render()));
        checks.check(
            "指數因子",
            anomalies.is_empty(),
            "所有指數的 $factor 均為 1.0",
            format!("{} 個指數值不等於 1.0", anomalies.len()),
            details,
        );
    }

    // 4. 價格與成交量
    let _ = writeln!(text, "{}", section("4. 價格與成交量"));
    let (violations, checked) = price_violations(table);
    let rate = if checked == 0 {
        0.0
    } else {
        violations as f64 / checked as f64
    };
    checks.check(
        "價格合理性",
        rate < MAX_PRICE_VIOLATION_RATE,
        format!("open/close 均在 [low, high] 之內 ({} 行)", checked),
        format!("{}/{} 行 open/close 超出 [low, high] (比例 {:.6})", violations, checked, rate),
        None,
    );
    let negative_volume = table
        .rows()
        .iter()
        .filter(|r| r.get(Field::Volume).map(|v| v < 0.0).unwrap_or(false))
        .count();
    checks.check(
        "成交量非負",
        negative_volume == 0,
        "所有成交量均 >= 0",
        format!("{} 行成交量為負", negative_volume),
        None,
    );

    // 5. 分佈
    let _ = writeln!(text, "{}", section("5. 欄位分佈"));
    for field in Field::ALL {
        let _ = writeln!(text, "\n--- {} ---", field.column());
        match describe_field(&frame, field)? {
            Some(d) => {
                let _ = writeln!(text, "{}", d.render());
            }
            None => {
                let _ = writeln!(text, "(無有效值)");
            }
        }
    }

    // 6. 缺失值
    let _ = writeln!(text, "{}", section("6. 缺失值"));
    for (field, missing) in missing_counts(&frame)? {
        let _ = writeln!(text, "{:<10}{:>12}", field.column(), missing);
    }

    // 7. 抽樣
    let _ = writeln!(text, "{}", section("7. 數據抽樣"));
    let _ = writeln!(text, "--- 前 {} 行 ---", options.preview_rows);
    let _ = write!(text, "{}", render_rows(table.head(options.preview_rows)));
    let _ = writeln!(text, "--- 後 {} 行 ---", options.preview_rows);
    let _ = write!(text, "{}", render_rows(table.tail(options.preview_rows)));
    let sample_rows = table.instrument_rows(&options.sample_instrument);
    if sample_rows.is_empty() {
        let _ = writeln!(text, "[WARNING] 數據中沒有 {}", options.sample_instrument);
    } else {
        let skip = sample_rows.len().saturating_sub(options.preview_rows);
        let _ = writeln!(text, "--- {} 最新數據 ---", options.sample_instrument);
        let _ = write!(text, "{}", render_rows(sample_rows.into_iter().skip(skip)));
    }

    // 結論
    let _ = writeln!(text, "{}", checks.render());
    let _ = writeln!(text, "{}", section("審核結論"));
    let _ = write!(text, "{}", checks.render_summary());
    let verdict = if checks.all_passed() {
        "數據通過全部檢查"
    } else {
        "數據存在問題，請檢查上方 [FAIL] 項目"
    };
    let _ = writeln!(text, "{}", verdict);

    Ok(AuditReport { checks, text })
}
