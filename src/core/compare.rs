//! 新舊資料集比對

use crate::adapters::frame::{self, new_column, PRESENT_COLUMN};
use crate::core::audit::{
    factor_violations, index_factor_anomalies, render_rows, sample_codes, split_instruments,
};
use crate::domain::model::{Field, PvRow, PvTable};
use crate::utils::error::Result;
use crate::utils::report::{sample, section, Checklist};
use crate::utils::stats::Describe;
use chrono::NaiveDate;
use polars::prelude::*;
use std::collections::BTreeSet;
use std::fmt::Write;

/// 允許的平均絕對百分比誤差 (%)
pub const MAX_MAPE_PERCENT: f64 = 2.0;

#[derive(Debug, Clone)]
pub struct CompareOptions {
    pub sample_size: usize,
    pub seed: Option<u64>,
    pub sample_instruments: Vec<String>,
    pub preview_rows: usize,
}

impl Default for CompareOptions {
    fn default() -> Self {
        Self {
            sample_size: 200,
            seed: None,
            sample_instruments: vec!["SH600000".to_string(), "SZ000002".to_string()],
            preview_rows: 10,
        }
    }
}

#[derive(Debug, Default)]
pub struct CompareSummary {
    pub lost_instruments: Vec<String>,
    pub added_instruments: Vec<String>,
    pub missing_dates: Vec<NaiveDate>,
    pub overlap_rows: usize,
    pub mape: Vec<(Field, f64)>,
    pub lost_values: Vec<(Field, usize)>,
    pub filled_values: Vec<(Field, usize)>,
}

#[derive(Debug)]
pub struct CompareReport {
    pub checks: Checklist,
    pub summary: CompareSummary,
    pub text: String,
}

fn old_f64(field: Field) -> Expr {
    col(field.column()).cast(DataType::Float64)
}

fn new_f64(field: Field) -> Expr {
    col(new_column(field)).cast(DataType::Float64)
}

/// 在新舊兩側所有欄位都齊全的重疊列上計算各欄位 MAPE (%)，分母為 0 時以 1 代替
pub fn mape_by_field(aligned: &DataFrame) -> Result<Vec<(Field, f64)>> {
    let complete = Field::ALL
        .iter()
        .fold(col(PRESENT_COLUMN).is_not_null(), |acc, field| {
            acc.and(col(field.column()).is_not_null())
                .and(col(new_column(*field)).is_not_null())
        });
    let rows = aligned.clone().lazy().filter(complete).collect()?;
    if rows.height() == 0 {
        return Ok(Vec::new());
    }

    let errors: Vec<Expr> = Field::ALL
        .iter()
        .map(|field| {
            let old = old_f64(*field);
            let denom = when(old.clone().eq(lit(0.0)))
                .then(lit(1.0))
                .otherwise(old.clone().abs());
            ((new_f64(*field) - old).abs() / denom)
                .mean()
                .alias(field.name())
        })
        .collect();
    let means = rows.lazy().select(errors).collect()?;

    Field::ALL
        .iter()
        .map(|field| Ok((*field, frame::scalar(&means, field.name())?.unwrap_or(0.0) * 100.0)))
        .collect()
}

/// 舊有值新缺失、舊缺失新有值的筆數
fn value_changes(aligned: &DataFrame) -> Result<(Vec<(Field, usize)>, Vec<(Field, usize)>)> {
    let mut exprs = Vec::new();
    for field in Field::ALL {
        let old = col(field.column());
        let new = col(new_column(field));
        exprs.push(
            old.clone()
                .is_not_null()
                .and(new.clone().is_null())
                .cast(DataType::Float64)
                .sum()
                .alias(format!("lost:{}", field.name())),
        );
        exprs.push(
            old.is_null()
                .and(new.is_not_null())
                .cast(DataType::Float64)
                .sum()
                .alias(format!("filled:{}", field.name())),
        );
    }
    let counts = aligned.clone().lazy().select(exprs).collect()?;

    let count = |name: String| -> Result<usize> {
        Ok(frame::scalar(&counts, &name)?.unwrap_or(0.0) as usize)
    };
    let mut lost = Vec::new();
    let mut filled = Vec::new();
    for field in Field::ALL {
        lost.push((field, count(format!("lost:{}", field.name()))?));
        filled.push((field, count(format!("filled:{}", field.name()))?));
    }
    Ok((lost, filled))
}

/// 重疊列上 new_close * new_factor 與 old_close 的絕對與相對差
fn close_diffs(aligned: &DataFrame) -> Result<DataFrame> {
    let abs_diff = (new_f64(Field::Close) * new_f64(Field::Factor) - old_f64(Field::Close)).abs();
    let diffs = aligned
        .clone()
        .lazy()
        .filter(col(PRESENT_COLUMN).is_not_null())
        .select([
            abs_diff.clone().alias("abs_diff"),
            (abs_diff / old_f64(Field::Close).abs()).alias("rel_diff"),
        ])
        .collect()?;
    Ok(diffs)
}

fn date_set(table: &PvTable) -> BTreeSet<NaiveDate> {
    table.dates().into_iter().collect()
}

fn instrument_set(table: &PvTable) -> BTreeSet<String> {
    table.instruments().into_iter().collect()
}

fn describe_line(label: &str, table: &PvTable) -> String {
    let range = table
        .date_range()
        .map(|(s, e)| format!("{} ~ {}", s, e))
        .unwrap_or_else(|| "(空)".to_string());
    format!(
        "{}: 形狀 {:?}, 日期 {}, 交易日 {}, 標的 {}",
        label,
        table.shape(),
        range,
        table.dates().len(),
        table.instruments().len()
    )
}

fn factor_checks(
    checks: &mut Checklist,
    label: &str,
    table: &PvTable,
    options: &CompareOptions,
) {
    let (stocks, indices) = split_instruments(&table.instruments());
    if stocks.is_empty() {
        checks.skip(format!("{} 股票因子單調性", label), "沒有股票數據");
    } else {
        let sampled = sample_codes(&stocks, options.sample_size, options.seed);
        let bad = factor_violations(table, &sampled);
        checks.check(
            format!("{} 股票因子單調性", label),
            bad.is_empty(),
            format!("抽樣的 {} 隻股票因子均為單調非遞減", sampled.len()),
            format!("{}/{} 隻抽樣股票因子非單調", bad.len(), sampled.len()),
            Some(format!("  - 樣例: {}", sample(&bad, 10))),
        );
    }
    if indices.is_empty() {
        checks.skip(format!("{} 指數因子", label), "沒有指數數據");
    } else {
        let anomalies = index_factor_anomalies(table);
        checks.check(
            format!("{} 指數因子", label),
            anomalies.is_empty(),
            "指數 $factor 均為 1.0",
            format!("{} 個指數值不等於 1.0", anomalies.len()),
            None,
        );
    }
}

pub fn compare_tables(
    old: &PvTable,
    new: &PvTable,
    options: &CompareOptions,
) -> Result<CompareReport> {
    let mut checks = Checklist::new();
    let mut summary = CompareSummary::default();
    let mut text = String::new();

    // 1. 基本資訊
    let _ = writeln!(text, "{}", section("1. 基本資訊"));
    let _ = writeln!(text, "{}", describe_line("原始數據", old));
    let _ = writeln!(text, "{}", describe_line("新數據", new));
    let growth = new.len() as i64 - old.len() as i64;
    let _ = writeln!(text, "數據點變化: {:+}", growth);

    // 2. 標的
    let old_inst = instrument_set(old);
    let new_inst = instrument_set(new);
    summary.lost_instruments = old_inst.difference(&new_inst).cloned().collect();
    summary.added_instruments = new_inst.difference(&old_inst).cloned().collect();
    let _ = writeln!(text, "{}", section("2. 標的"));
    let _ = writeln!(
        text,
        "丟失標的: {} {}",
        summary.lost_instruments.len(),
        sample(&summary.lost_instruments, 10)
    );
    let _ = writeln!(
        text,
        "新增標的: {} {}",
        summary.added_instruments.len(),
        sample(&summary.added_instruments, 10)
    );
    checks.check(
        "新數據標的池為舊數據的超集",
        summary.lost_instruments.is_empty(),
        format!("是: 新({}) vs 舊({})", new_inst.len(), old_inst.len()),
        format!("否! 新數據丟失了 {} 個標的", summary.lost_instruments.len()),
        Some(format!("  - 丟失代碼樣例: {}", sample(&summary.lost_instruments, 5))),
    );

    // 3. 日期
    let _ = writeln!(text, "{}", section("3. 日期覆蓋"));
    let old_dates = date_set(old);
    let new_dates = date_set(new);
    match (old.date_range(), new.date_range()) {
        (Some((old_start, old_end)), Some((new_start, new_end))) => {
            checks.check(
                "新數據日期範圍覆蓋舊數據",
                new_start <= old_start && new_end >= old_end,
                format!("是: 新({}~{}) vs 舊({}~{})", new_start, new_end, old_start, old_end),
                "否!",
                Some(format!(
                    "  - 新範圍: {} ~ {}\n  - 舊範圍: {} ~ {}",
                    new_start, new_end, old_start, old_end
                )),
            );
            summary.missing_dates = old_dates.difference(&new_dates).copied().collect();
            checks.check(
                "舊日期範圍內無交易日丟失",
                summary.missing_dates.is_empty(),
                "舊範圍內的所有交易日都存在於新數據中",
                format!("新數據在舊日期範圍內丟失了 {} 個交易日", summary.missing_dates.len()),
                Some(format!("  - 丟失日期樣例: {}", sample(&summary.missing_dates, 5))),
            );
        }
        _ => {
            checks.skip("新數據日期範圍覆蓋舊數據", "至少一側數據為空");
            checks.skip("舊日期範圍內無交易日丟失", "至少一側數據為空");
        }
    }

    // 4. 公共網格
    let common_dates: BTreeSet<NaiveDate> = old_dates.intersection(&new_dates).copied().collect();
    let common_inst: BTreeSet<&String> = old_inst.intersection(&new_inst).collect();
    let grid = PvTable::new(
        old.rows()
            .iter()
            .filter(|r| common_dates.contains(&r.datetime) && common_inst.contains(&r.instrument))
            .filter(|r| !r.is_empty())
            .cloned()
            .collect(),
    );
    let aligned = frame::align(&grid, new)?;
    summary.overlap_rows = aligned.height() - aligned.column(PRESENT_COLUMN)?.null_count();
    let _ = writeln!(text, "{}", section("4. 重疊數據數值差異"));
    let _ = writeln!(
        text,
        "共同交易日 {}，共同標的 {}，重疊記錄 {}",
        common_dates.len(),
        common_inst.len(),
        summary.overlap_rows
    );

    summary.mape = mape_by_field(&aligned)?;
    if summary.mape.is_empty() {
        checks.skip("數值相似度 (MAPE)", "沒有完整的重疊記錄");
    }
    for (field, mape) in &summary.mape {
        checks.check(
            format!("列 '{}' 的數值相似度", field.column()),
            *mape < MAX_MAPE_PERCENT,
            format!("高度相似, MAPE = {:.4}%", mape),
            format!("差異過大, MAPE = {:.4}%", mape),
            None,
        );
    }

    // 5. 複權關係
    let _ = writeln!(text, "{}", section("5. 複權關係: new_close * new_factor ≈ old_close"));
    let diffs = close_diffs(&aligned)?;
    match Describe::from_column(diffs.column("abs_diff")?)? {
        Some(d) => {
            let _ = writeln!(text, "--- abs_diff ---\n{}", d.render());
        }
        None => {
            let _ = writeln!(text, "(沒有可比較的收盤價)");
        }
    }
    if let Some(d) = Describe::from_column(diffs.column("rel_diff")?)? {
        let _ = writeln!(text, "--- rel_diff ---\n{}", d.render());
    }
    for code in &options.sample_instruments {
        let rows: Vec<&PvRow> = new
            .instrument_rows(code)
            .into_iter()
            .filter(|r| common_dates.contains(&r.datetime))
            .collect();
        if rows.is_empty() {
            let _ = writeln!(text, "[INFO] {} 不在公共數據集中", code);
            continue;
        }
        let skip = rows.len().saturating_sub(options.preview_rows);
        let _ = writeln!(text, "--- 抽樣 {} (新數據) ---", code);
        let _ = write!(text, "{}", render_rows(rows.into_iter().skip(skip)));
    }

    // 6. 因子
    factor_checks(&mut checks, "原始數據", old, options);
    factor_checks(&mut checks, "新數據", new, options);

    // 7. 缺失值模式
    let _ = writeln!(text, "{}", section("7. 公共數據集上的缺失值對比"));
    let (lost_values, filled_values) = value_changes(&aligned)?;
    for ((field, lost), (_, filled)) in lost_values.iter().zip(&filled_values) {
        let _ = writeln!(
            text,
            "{:<10} 舊有值新缺失: {:>10}   舊缺失新有值: {:>10}",
            field.column(),
            lost,
            filled
        );
    }
    summary.lost_values = lost_values;
    summary.filled_values = filled_values;

    // 結論
    let _ = writeln!(text, "{}", checks.render());
    let _ = writeln!(text, "{}", section("最終比對報告"));
    let _ = write!(text, "{}", checks.render_summary());
    let verdict = if checks.all_passed() {
        "結論: [高度兼容] 新數據通過所有檢查，可以安全替換"
    } else {
        "結論: [存在風險] 請檢查上方 [FAIL] 項目後再替換"
    };
    let _ = writeln!(text, "{}", verdict);

    Ok(CompareReport {
        checks,
        summary,
        text,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(day: u32, code: &str, close: f32, factor: f32) -> PvRow {
        PvRow {
            datetime: NaiveDate::from_ymd_opt(2020, 1, day).unwrap(),
            instrument: code.to_string(),
            open: Some(close),
            close: Some(close),
            high: Some(close + 1.0),
            low: Some(close - 1.0),
            volume: Some(100.0),
            factor: Some(factor),
        }
    }

    #[test]
    fn test_mape_zero_denominator() {
        let mut old = row(2, "SH600000", 10.0, 1.0);
        old.volume = Some(0.0);
        let mut new = row(2, "SH600000", 11.0, 1.0);
        new.volume = Some(0.5);
        let aligned = frame::align(&PvTable::new(vec![old]), &PvTable::new(vec![new])).unwrap();
        let mape = mape_by_field(&aligned).unwrap();
        assert_eq!(mape[1].0, Field::Close);
        assert!((mape[1].1 - 10.0).abs() < 1e-6);
        assert!((mape[4].1 - 50.0).abs() < 1e-6);
        assert_eq!(mape[5].1, 0.0);
    }

    #[test]
    fn test_identical_tables_pass() {
        let table = PvTable::new(vec![
            row(2, "SH600000", 10.0, 1.0),
            row(3, "SH600000", 10.5, 1.0),
            row(2, "SH000300", 4000.0, 1.0),
        ]);
        let options = CompareOptions {
            seed: Some(3),
            ..Default::default()
        };
        let report = compare_tables(&table, &table, &options).unwrap();
        assert!(report.checks.all_passed(), "{}", report.text);
        assert_eq!(report.summary.overlap_rows, 3);
        assert!(report.summary.lost_values.iter().all(|(_, n)| *n == 0));
    }

    #[test]
    fn test_detects_lost_instruments_and_dates() {
        let old = PvTable::new(vec![
            row(2, "SH600000", 10.0, 1.0),
            row(3, "SH600000", 10.0, 1.0),
            row(3, "SZ000002", 20.0, 1.0),
        ]);
        let mut partial = row(2, "SH600000", 10.0, 1.0);
        partial.volume = None;
        let new = PvTable::new(vec![partial, row(2, "SZ000001", 5.0, 1.0)]);

        let report = compare_tables(&old, &new, &CompareOptions::default()).unwrap();
        assert_eq!(report.summary.lost_instruments, vec!["SZ000002"]);
        assert_eq!(report.summary.added_instruments, vec!["SZ000001"]);
        assert_eq!(
            report.summary.missing_dates,
            vec![NaiveDate::from_ymd_opt(2020, 1, 3).unwrap()]
        );
        assert_eq!(report.summary.lost_values[4], (Field::Volume, 1));
        assert!(!report.checks.all_passed());
    }

    #[test]
    fn test_mape_skips_incomplete_rows() {
        let old = PvTable::new(vec![row(2, "SH600000", 10.0, 1.0), row(3, "SH600000", 10.0, 1.0)]);
        let mut broken = row(3, "SH600000", 100.0, 1.0);
        broken.open = None;
        let new = PvTable::new(vec![row(2, "SH600000", 10.0, 1.0), broken]);
        let aligned = frame::align(&old, &new).unwrap();
        let mape = mape_by_field(&aligned).unwrap();
        assert!(mape.iter().all(|(_, v)| *v == 0.0), "{:?}", mape);

        let (lost, filled) = value_changes(&aligned).unwrap();
        assert_eq!(lost[0], (Field::Open, 1));
        assert!(filled.iter().all(|(_, n)| *n == 0));
    }

    #[test]
    fn test_close_times_factor_matches_old_close() {
        let old = PvTable::new(vec![row(2, "SH600000", 10.0, 1.0)]);
        let new = PvTable::new(vec![row(2, "SH600000", 5.0, 2.0)]);
        let report = compare_tables(&old, &new, &CompareOptions::default()).unwrap();
        assert!(report.text.contains("--- abs_diff ---"));
        let diffs = close_diffs(&frame::align(&old, &new).unwrap()).unwrap();
        assert_eq!(frame::f64_values(&diffs, "abs_diff").unwrap(), vec![Some(0.0)]);
    }
}
