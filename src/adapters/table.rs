//! 長表檔案：CSV 或內含單一 CSV 的 ZIP

use crate::domain::model::{Field, PvRow, PvTable};
use crate::domain::ports::Storage;
use crate::utils::error::{EtlError, Result};
use chrono::{NaiveDate, NaiveDateTime};
use std::io::{Cursor, Read, Write};
use zip::write::{SimpleFileOptions, ZipWriter};
use zip::CompressionMethod;

pub const DATETIME_COLUMN: &str = "datetime";
pub const INSTRUMENT_COLUMN: &str = "instrument";

pub fn header() -> Vec<&'static str> {
    let mut cols = vec![DATETIME_COLUMN, INSTRUMENT_COLUMN];
    cols.extend(Field::ALL.iter().map(|f| f.column()));
    cols
}

pub fn write_csv(table: &PvTable) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(header())?;

    for row in table.rows() {
        let mut record = vec![row.datetime.format("%Y-%m-%d").to_string(), row.instrument.clone()];
        record.extend(
            Field::ALL
                .iter()
                .map(|f| row.get(*f).map(|v| v.to_string()).unwrap_or_default()),
        );
        writer.write_record(&record)?;
    }

    writer
        .into_inner()
        .map_err(|e| EtlError::ProcessingError {
            message: format!("Failed to flush CSV writer: {}", e),
        })
}

/// 依欄位名稱讀取，缺少的數值欄視為全缺值
pub fn read_csv(bytes: &[u8], path: &str) -> Result<PvTable> {
    let mut reader = csv::Reader::from_reader(bytes);
    let headers = reader.headers()?.clone();
    let position = |name: &str| headers.iter().position(|h| h.trim() == name);

    let date_idx = position(DATETIME_COLUMN).ok_or_else(|| EtlError::FormatError {
        path: path.to_string(),
        reason: "missing 'datetime' column".to_string(),
    })?;
    let inst_idx = position(INSTRUMENT_COLUMN).ok_or_else(|| EtlError::FormatError {
        path: path.to_string(),
        reason: "missing 'instrument' column".to_string(),
    })?;
    let field_idx: Vec<(Field, usize)> = Field::ALL
        .iter()
        .filter_map(|f| position(f.column()).map(|i| (*f, i)))
        .collect();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let raw_date = record.get(date_idx).unwrap_or_default();
        let datetime = parse_date(raw_date).ok_or_else(|| EtlError::FormatError {
            path: path.to_string(),
            reason: format!("unparseable datetime '{}'", raw_date),
        })?;
        let mut row = PvRow::empty(datetime, record.get(inst_idx).unwrap_or_default().trim());
        for (field, idx) in &field_idx {
            row.set(*field, parse_value(record.get(*idx).unwrap_or_default()));
        }
        rows.push(row);
    }

    Ok(PvTable::new(rows))
}

/// `<name>.zip` 內含 `<name>.csv`
pub fn write_zip(table: &PvTable, name: &str) -> Result<Vec<u8>> {
    let csv_bytes = write_csv(table)?;
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    zip.start_file(format!("{}.csv", name), options)?;
    zip.write_all(&csv_bytes)?;
    let cursor = zip.finish()?;
    Ok(cursor.into_inner())
}

/// 取出壓縮檔中第一個 `.csv` 項目的內容
pub fn zip_entry(bytes: &[u8], path: &str) -> Result<Vec<u8>> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))?;
    let entry = archive
        .file_names()
        .find(|name| name.ends_with(".csv"))
        .map(str::to_string)
        .ok_or_else(|| EtlError::FormatError {
            path: path.to_string(),
            reason: "archive holds no .csv entry".to_string(),
        })?;

    let mut content = Vec::new();
    archive.by_name(&entry)?.read_to_end(&mut content)?;
    Ok(content)
}

pub fn read_zip(bytes: &[u8], path: &str) -> Result<PvTable> {
    read_csv(&zip_entry(bytes, path)?, path)
}

/// 依副檔名讀取表格檔
pub fn decode(bytes: &[u8], path: &str) -> Result<PvTable> {
    if path.ends_with(".zip") {
        read_zip(bytes, path)
    } else {
        read_csv(bytes, path)
    }
}

pub async fn read_table<S: Storage>(storage: &S, path: &str) -> Result<PvTable> {
    let bytes = storage.read_file(path).await?;
    decode(&bytes, path)
}

/// 寫出 `<name>.csv` 或 `<name>.zip`，回傳相對路徑
pub async fn write_table<S: Storage>(
    storage: &S,
    table: &PvTable,
    name: &str,
    zipped: bool,
) -> Result<String> {
    let (path, bytes) = if zipped {
        (format!("{}.zip", name), write_zip(table, name)?)
    } else {
        (format!("{}.csv", name), write_csv(table)?)
    };
    storage.write_file(&path, &bytes).await?;
    tracing::info!("💾 Wrote {} rows to {}", table.len(), path);
    Ok(path)
}

pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%Y%m%d"))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
                .ok()
                .map(|dt| dt.date())
        })
}

pub fn parse_value(raw: &str) -> Option<f32> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    raw.parse::<f32>().ok().filter(|v| !v.is_nan())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_table() -> PvTable {
        let date = NaiveDate::from_ymd_opt(2020, 1, 2).unwrap();
        let mut a = PvRow::empty(date, "SH600000");
        a.open = Some(10.5);
        a.close = Some(11.0);
        a.factor = Some(1.0);
        let b = PvRow::empty(date, "SZ000001");
        PvTable::new(vec![a, b])
    }

    #[test]
    fn test_csv_layout() {
        let bytes = write_csv(&sample_table()).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next().unwrap(),
            "datetime,instrument,$open,$close,$high,$low,$volume,$factor"
        );
        assert_eq!(lines.next().unwrap(), "2020-01-02,SH600000,10.5,11,,,,1");
        assert_eq!(lines.next().unwrap(), "2020-01-02,SZ000001,,,,,,");
    }

    #[test]
    fn test_read_csv_with_reordered_and_missing_columns() {
        let text = "instrument,datetime,$close\nSH600000,2020-01-03 00:00:00,12.5\nSH600000,2020-01-02,nan\n";
        let table = read_csv(text.as_bytes(), "x.csv").unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.rows()[0].close, None);
        assert_eq!(table.rows()[1].close, Some(12.5));
        assert_eq!(table.rows()[1].factor, None);
    }

    #[test]
    fn test_read_csv_requires_index_columns() {
        let err = read_csv(b"date,symbol\n2020-01-02,a\n", "bad.csv").unwrap_err();
        assert!(matches!(err, EtlError::FormatError { .. }));
    }

    #[test]
    fn test_zip_holds_named_csv() {
        let bytes = write_zip(&sample_table(), "daily_pv").unwrap();
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes.clone())).unwrap();
        assert_eq!(archive.len(), 1);
        assert_eq!(archive.by_index(0).unwrap().name(), "daily_pv.csv");

        let table = decode(&bytes, "daily_pv.zip").unwrap();
        assert_eq!(table, sample_table());
    }
}
