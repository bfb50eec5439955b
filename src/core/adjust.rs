//! 複權因子計算與單調性檢查
//!
//! 供應商的累積複權因子隨時間遞增。前復權以最後一個交易日的因子為基準
//! (`$factor` 最新日為 1.0)，後復權以第一個交易日為基準。兩種方式下
//! 有效的股票 `$factor` 序列都是非遞減的。

use crate::adapters::frame::{self, day_number};
use crate::adapters::table::{DATETIME_COLUMN, INSTRUMENT_COLUMN};
use crate::domain::model::{ts_code_to_qlib, AdjFactor, AdjustMode, PvRow, RawDaily};
use crate::utils::error::{EtlError, Result};
use polars::prelude::*;

/// 一手為 100 股
const SHARES_PER_LOT: f64 = 100.0;
/// 指數成交額單位為千元
const AMOUNT_UNIT: f64 = 1000.0;
/// 合併時的原始累積因子欄
const RAW_FACTOR: &str = "adj_factor";

/// 股票複權。回傳 `Ok(None)` 代表此標的應被略過 (無行情或基準因子無效)。
pub fn adjust_stock(
    ts_code: &str,
    daily: &[RawDaily],
    factors: &[AdjFactor],
    mode: AdjustMode,
) -> Result<Option<Vec<PvRow>>> {
    let instrument = ts_code_to_qlib(ts_code)?;
    if daily.is_empty() {
        return Ok(None);
    }

    let mut daily: Vec<&RawDaily> = daily.iter().collect();
    daily.sort_by_key(|d| d.trade_date);

    let raw_factors = if factors.is_empty() {
        vec![1.0; daily.len()]
    } else {
        merge_factors(&instrument, &daily, factors)?
    };

    let anchor = match mode {
        AdjustMode::Forward => raw_factors.last().copied(),
        AdjustMode::Backward => raw_factors.first().copied(),
    }
    .unwrap_or(f64::NAN);

    if anchor == 0.0 || !anchor.is_finite() {
        tracing::warn!("⚠️ {} has no usable anchor factor ({}), skipped", ts_code, anchor);
        return Ok(None);
    }

    let rows = daily
        .iter()
        .zip(raw_factors)
        .map(|(d, adj)| {
            let factor = adj / anchor;
            let volume = d.vol * SHARES_PER_LOT / factor;
            PvRow {
                datetime: d.trade_date,
                instrument: instrument.clone(),
                open: finite(d.open * factor),
                close: finite(d.close * factor),
                high: finite(d.high * factor),
                low: finite(d.low * factor),
                volume: Some(if volume.is_finite() { volume as f32 } else { 0.0 }),
                factor: finite(factor),
            }
        })
        .collect();

    Ok(Some(rows))
}

/// 指數不複權，成交量改用成交額
pub fn adjust_index(ts_code: &str, daily: &[RawDaily]) -> Result<Option<Vec<PvRow>>> {
    let instrument = ts_code_to_qlib(ts_code)?;
    if daily.is_empty() {
        return Ok(None);
    }

    let mut rows: Vec<PvRow> = daily
        .iter()
        .map(|d| PvRow {
            datetime: d.trade_date,
            instrument: instrument.clone(),
            open: finite(d.open),
            close: finite(d.close),
            high: finite(d.high),
            low: finite(d.low),
            volume: finite(d.amount * AMOUNT_UNIT),
            factor: Some(1.0),
        })
        .collect();
    rows.sort_by_key(|r| r.datetime);
    Ok(Some(rows))
}

/// 以交易日左接複權因子，缺口在標的內先向前、再向後填補
fn merge_factors(instrument: &str, daily: &[&RawDaily], factors: &[AdjFactor]) -> Result<Vec<f64>> {
    // 同一天有多筆時取最後一筆
    let mut factors: Vec<&AdjFactor> = factors.iter().collect();
    factors.sort_by_key(|f| f.trade_date);
    factors.reverse();
    factors.dedup_by_key(|f| f.trade_date);

    let bars = DataFrame::new(vec![Column::new(
        DATETIME_COLUMN.into(),
        daily.iter().map(|d| day_number(d.trade_date)).collect::<Vec<i32>>(),
    )])?;
    let adj = DataFrame::new(vec![
        Column::new(
            DATETIME_COLUMN.into(),
            factors.iter().map(|f| day_number(f.trade_date)).collect::<Vec<i32>>(),
        ),
        Column::new(
            RAW_FACTOR.into(),
            factors
                .iter()
                .map(|f| Some(f.adj_factor).filter(|v| v.is_finite()))
                .collect::<Vec<Option<f64>>>(),
        ),
    ])?;

    let merged = bars
        .lazy()
        .with_column(lit(instrument).alias(INSTRUMENT_COLUMN))
        .join(
            adj.lazy(),
            [col(DATETIME_COLUMN)],
            [col(DATETIME_COLUMN)],
            JoinArgs::new(JoinType::Left),
        );
    let filled = frame::fill_by_instrument(merged, &[RAW_FACTOR]).collect()?;
    if filled.height() != daily.len() {
        return Err(EtlError::TransformationError {
            stage: "adjust".to_string(),
            details: format!(
                "{} has {} bars but {} merged rows",
                instrument,
                daily.len(),
                filled.height()
            ),
        });
    }

    Ok(frame::f64_values(&filled, RAW_FACTOR)?
        .into_iter()
        .map(|v| v.unwrap_or(f64::NAN))
        .collect())
}

fn finite(value: f64) -> Option<f32> {
    if value.is_finite() {
        Some(value as f32)
    } else {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Monotonicity {
    NonDecreasing,
    NonIncreasing,
    Constant,
    Neither,
}

impl Monotonicity {
    /// 股票因子可接受的方向
    pub fn is_valid_stock_factor(&self) -> bool {
        matches!(self, Monotonicity::NonDecreasing | Monotonicity::Constant)
    }
}

/// 判斷序列方向，忽略缺值
pub fn monotonicity<I>(values: I) -> Monotonicity
where
    I: IntoIterator<Item = Option<f32>>,
{
    let mut up = false;
    let mut down = false;
    let mut prev: Option<f32> = None;

    for value in values.into_iter().flatten().filter(|v| !v.is_nan()) {
        if let Some(p) = prev {
            if value > p {
                up = true;
            } else if value < p {
                down = true;
            }
        }
        prev = Some(value);
    }

    match (up, down) {
        (false, false) => Monotonicity::Constant,
        (true, false) => Monotonicity::NonDecreasing,
        (false, true) => Monotonicity::NonIncreasing,
        (true, true) => Monotonicity::Neither,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2020, 1, d).unwrap()
    }

    fn bar(d: u32, close: f64) -> RawDaily {
        RawDaily {
            trade_date: day(d),
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            vol: 10.0,
            amount: 5.0,
        }
    }

    fn adj(d: u32, v: f64) -> AdjFactor {
        AdjFactor {
            trade_date: day(d),
            adj_factor: v,
        }
    }

    #[test]
    fn test_forward_anchor_is_latest() {
        let daily = vec![bar(3, 10.0), bar(2, 10.0)];
        let factors = vec![adj(2, 1.0), adj(3, 2.0)];
        let rows = adjust_stock("600000.SH", &daily, &factors, AdjustMode::Forward)
            .unwrap()
            .unwrap();

        assert_eq!(rows[0].datetime, day(2));
        assert_eq!(rows[0].instrument, "SH600000");
        assert_eq!(rows[0].factor, Some(0.5));
        assert_eq!(rows[0].close, Some(5.0));
        assert_eq!(rows[0].volume, Some(2000.0));
        assert_eq!(rows[1].factor, Some(1.0));
        assert_eq!(rows[1].volume, Some(1000.0));
    }

    #[test]
    fn test_backward_anchor_is_earliest() {
        let daily = vec![bar(2, 10.0), bar(3, 10.0)];
        let factors = vec![adj(2, 1.0), adj(3, 2.0)];
        let rows = adjust_stock("600000.SH", &daily, &factors, AdjustMode::Backward)
            .unwrap()
            .unwrap();

        assert_eq!(rows[0].factor, Some(1.0));
        assert_eq!(rows[1].factor, Some(2.0));
        assert_eq!(rows[1].close, Some(20.0));
        let mono = monotonicity(rows.iter().map(|r| r.factor));
        assert_eq!(mono, Monotonicity::NonDecreasing);
    }

    #[test]
    fn test_missing_factors_default_to_one() {
        let rows = adjust_stock("000001.SZ", &[bar(2, 10.0)], &[], AdjustMode::Forward)
            .unwrap()
            .unwrap();
        assert_eq!(rows[0].factor, Some(1.0));
        assert_eq!(rows[0].close, Some(10.0));
    }

    #[test]
    fn test_gaps_are_filled() {
        let daily = vec![bar(2, 10.0), bar(3, 10.0), bar(6, 10.0), bar(7, 10.0)];
        let factors = vec![adj(3, 2.0), adj(7, 4.0)];
        let rows = adjust_stock("000001.SZ", &daily, &factors, AdjustMode::Forward)
            .unwrap()
            .unwrap();
        let f: Vec<Option<f32>> = rows.iter().map(|r| r.factor).collect();
        assert_eq!(f, vec![Some(0.5), Some(0.5), Some(0.5), Some(1.0)]);
    }

    #[test]
    fn test_leading_gap_takes_first_factor_and_duplicates_keep_last() {
        let daily = vec![bar(2, 10.0), bar(3, 10.0), bar(6, 10.0)];
        let factors = vec![adj(3, 1.0), adj(3, 2.0), adj(6, f64::NAN)];
        let rows = adjust_stock("000001.SZ", &daily, &factors, AdjustMode::Backward)
            .unwrap()
            .unwrap();
        let f: Vec<Option<f32>> = rows.iter().map(|r| r.factor).collect();
        assert_eq!(f, vec![Some(1.0), Some(1.0), Some(1.0)]);
        assert_eq!(rows[2].close, Some(10.0));
    }

    #[test]
    fn test_zero_anchor_skips_instrument() {
        let daily = vec![bar(2, 10.0)];
        let factors = vec![adj(2, 0.0)];
        let out = adjust_stock("000001.SZ", &daily, &factors, AdjustMode::Forward).unwrap();
        assert!(out.is_none());
    }

    #[test]
    fn test_no_overlap_skips_instrument() {
        let out = adjust_stock("000001.SZ", &[bar(2, 10.0)], &[adj(9, 1.0)], AdjustMode::Forward)
            .unwrap();
        assert!(out.is_none());
    }

    #[test]
    fn test_index_uses_amount() {
        let rows = adjust_index("000300.SH", &[bar(2, 4000.0)]).unwrap().unwrap();
        assert_eq!(rows[0].instrument, "SH000300");
        assert_eq!(rows[0].factor, Some(1.0));
        assert_eq!(rows[0].close, Some(4000.0));
        assert_eq!(rows[0].volume, Some(5000.0));
    }

    #[test]
    fn test_bad_code_is_error() {
        assert!(adjust_index("000300", &[bar(2, 1.0)]).is_err());
    }

    #[test]
    fn test_monotonicity() {
        assert_eq!(monotonicity(vec![Some(1.0), None, Some(2.0)]), Monotonicity::NonDecreasing);
        assert_eq!(monotonicity(vec![Some(2.0), Some(1.0)]), Monotonicity::NonIncreasing);
        assert_eq!(monotonicity(vec![Some(1.0), Some(1.0)]), Monotonicity::Constant);
        assert_eq!(monotonicity(vec![Some(1.0), Some(2.0), Some(1.5)]), Monotonicity::Neither);
        assert_eq!(monotonicity(Vec::new()), Monotonicity::Constant);
        assert!(Monotonicity::Constant.is_valid_stock_factor());
        assert!(!Monotonicity::NonIncreasing.is_valid_stock_factor());
    }
}
