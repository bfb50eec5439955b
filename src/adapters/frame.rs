//! 長表的 polars 視圖：轉成 DataFrame、以標的分組填補、對齊新舊兩表

use crate::adapters::table::{DATETIME_COLUMN, INSTRUMENT_COLUMN};
use crate::domain::model::{Field, PvTable};
use crate::utils::error::Result;
use chrono::{Datelike, NaiveDate};
use polars::prelude::*;

/// 對齊後標記新表是否有該列
pub const PRESENT_COLUMN: &str = "new:present";

/// 日期以 CE 起算的天數存放
pub fn day_number(date: NaiveDate) -> i32 {
    date.num_days_from_ce()
}

/// 對齊後新表欄位的名稱
pub fn new_column(field: Field) -> String {
    format!("new:{}", field.column())
}

pub fn to_frame(table: &PvTable) -> Result<DataFrame> {
    let rows = table.rows();
    let mut columns = vec![
        Column::new(
            DATETIME_COLUMN.into(),
            rows.iter().map(|r| day_number(r.datetime)).collect::<Vec<i32>>(),
        ),
        Column::new(
            INSTRUMENT_COLUMN.into(),
            rows.iter().map(|r| r.instrument.as_str()).collect::<Vec<&str>>(),
        ),
    ];
    for field in Field::ALL {
        columns.push(Column::new(
            field.column().into(),
            rows.iter().map(|r| r.get(field)).collect::<Vec<Option<f32>>>(),
        ));
    }
    Ok(DataFrame::new(columns)?)
}

/// 各標的內依日期先向前填補，再以第一個有效值回填開頭
pub fn fill_by_instrument(frame: LazyFrame, columns: &[&str]) -> LazyFrame {
    let filled: Vec<Expr> = columns
        .iter()
        .map(|name| {
            col(*name)
                .forward_fill(None)
                .backward_fill(None)
                .over([col(INSTRUMENT_COLUMN)])
        })
        .collect();
    frame
        .sort([INSTRUMENT_COLUMN, DATETIME_COLUMN], SortMultipleOptions::default())
        .with_columns(filled)
}

/// 以 (datetime, instrument) 把新表左接到舊表，新表欄位改名為 `new:<欄位>`
pub fn align(old: &PvTable, new: &PvTable) -> Result<DataFrame> {
    let mut right = vec![
        col(DATETIME_COLUMN),
        col(INSTRUMENT_COLUMN),
        lit(true).alias(PRESENT_COLUMN),
    ];
    right.extend(Field::ALL.iter().map(|f| col(f.column()).alias(new_column(*f))));

    let keys = [col(DATETIME_COLUMN), col(INSTRUMENT_COLUMN)];
    let joined = to_frame(old)?
        .lazy()
        .join(
            to_frame(new)?.lazy().select(right),
            keys.clone(),
            keys,
            JoinArgs::new(JoinType::Left),
        )
        .collect()?;
    Ok(joined)
}

/// 數值欄轉成 f64，缺值保留為 None
pub fn f64_values(frame: &DataFrame, name: &str) -> Result<Vec<Option<f64>>> {
    let series = frame
        .column(name)?
        .as_materialized_series()
        .cast(&DataType::Float64)?;
    let values = series.f64()?.into_iter().collect();
    Ok(values)
}

/// 單列結果 (例如聚合後) 的第一個值
pub fn scalar(frame: &DataFrame, name: &str) -> Result<Option<f64>> {
    Ok(f64_values(frame, name)?.into_iter().next().flatten())
}
