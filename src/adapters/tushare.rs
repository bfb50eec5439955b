use crate::domain::model::{AdjFactor, DateRange, InstrumentInfo, InstrumentKind, RawDaily};
use crate::domain::ports::MarketDataSource;
use crate::utils::error::{EtlError, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::time::Duration;

pub const DEFAULT_ENDPOINT: &str = "http://api.tushare.pro";

/// 預設追蹤的指數：滬深300、中證100、中證500
pub const DEFAULT_INDICES: [&str; 3] = ["000300.SH", "000903.SH", "000905.SH"];

const DAILY_FIELDS: &str = "ts_code,trade_date,open,high,low,close,vol,amount";

/// Tushare Pro HTTP 介面
pub struct TushareSource {
    client: Client,
    token: String,
    endpoint: String,
}

#[derive(Debug, Deserialize)]
struct ApiEnvelope {
    code: i64,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    data: Option<ApiTable>,
}

#[derive(Debug, Default, Deserialize)]
struct ApiTable {
    #[serde(default)]
    fields: Vec<String>,
    #[serde(default)]
    items: Vec<Vec<Value>>,
}

impl TushareSource {
    pub fn new(token: &str, endpoint: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            token: token.to_string(),
            endpoint: endpoint.to_string(),
        })
    }

    async fn request(&self, api_name: &str, params: Value, fields: &str) -> Result<ApiTable> {
        let body = json!({
            "api_name": api_name,
            "token": self.token,
            "params": params,
            "fields": fields,
        });
        tracing::debug!("Tushare request: api_name={}, params={}", api_name, params);

        let envelope: ApiEnvelope = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if envelope.code != 0 {
            return Err(EtlError::RemoteApiError {
                api: api_name.to_string(),
                code: envelope.code,
                message: envelope.msg.unwrap_or_default(),
            });
        }
        Ok(envelope.data.unwrap_or_default())
    }

    async fn bars(&self, api_name: &str, ts_code: &str, range: &DateRange) -> Result<Vec<RawDaily>> {
        let params = json!({
            "ts_code": ts_code,
            "start_date": range.start_compact(),
            "end_date": range.end_compact(),
        });
        let table = self.request(api_name, params, DAILY_FIELDS).await?;
        let idx = FieldIndex::new(&table.fields);

        table
            .items
            .iter()
            .map(|row| {
                Ok(RawDaily {
                    trade_date: parse_trade_date(&idx.get_str(row, "trade_date")?)?,
                    open: idx.get_f64(row, "open")?,
                    high: idx.get_f64(row, "high")?,
                    low: idx.get_f64(row, "low")?,
                    close: idx.get_f64(row, "close")?,
                    vol: idx.get_f64(row, "vol")?,
                    amount: idx.get_f64(row, "amount")?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl MarketDataSource for TushareSource {
    async fn ping(&self) -> Result<()> {
        let params = json!({
            "exchange": "SSE",
            "start_date": "20200101",
            "end_date": "20200101",
        });
        self.request("trade_cal", params, "exchange,cal_date,is_open")
            .await?;
        tracing::info!("✅ Tushare connection OK");
        Ok(())
    }

    async fn list_stocks(&self, statuses: &[String]) -> Result<Vec<InstrumentInfo>> {
        let mut seen = HashSet::new();
        let mut stocks = Vec::new();

        for status in statuses {
            let params = json!({ "exchange": "", "list_status": status });
            let table = self
                .request("stock_basic", params, "ts_code,name,list_date")
                .await?;
            let idx = FieldIndex::new(&table.fields);
            let before = stocks.len();

            for row in &table.items {
                let ts_code = idx.get_str(row, "ts_code")?;
                if !seen.insert(ts_code.clone()) {
                    continue;
                }
                stocks.push(InstrumentInfo {
                    name: idx.get_str(row, "name").unwrap_or_default(),
                    list_date: idx.get_str(row, "list_date").ok(),
                    kind: InstrumentKind::Stock,
                    ts_code,
                });
            }
            tracing::debug!("list_status={} added {} stocks", status, stocks.len() - before);
        }

        Ok(stocks)
    }

    async fn daily(&self, ts_code: &str, range: &DateRange) -> Result<Vec<RawDaily>> {
        self.bars("daily", ts_code, range).await
    }

    async fn adj_factor(&self, ts_code: &str, range: &DateRange) -> Result<Vec<AdjFactor>> {
        let params = json!({
            "ts_code": ts_code,
            "start_date": range.start_compact(),
            "end_date": range.end_compact(),
        });
        let table = self
            .request("adj_factor", params, "ts_code,trade_date,adj_factor")
            .await?;
        let idx = FieldIndex::new(&table.fields);

        table
            .items
            .iter()
            .map(|row| {
                Ok(AdjFactor {
                    trade_date: parse_trade_date(&idx.get_str(row, "trade_date")?)?,
                    adj_factor: idx.get_f64(row, "adj_factor")?,
                })
            })
            .collect()
    }

    async fn index_daily(&self, ts_code: &str, range: &DateRange) -> Result<Vec<RawDaily>> {
        self.bars("index_daily", ts_code, range).await
    }
}

pub fn default_indices() -> Vec<InstrumentInfo> {
    DEFAULT_INDICES
        .iter()
        .map(|code| InstrumentInfo {
            ts_code: code.to_string(),
            name: code.to_string(),
            list_date: None,
            kind: InstrumentKind::Index,
        })
        .collect()
}

struct FieldIndex {
    names: Vec<String>,
}

impl FieldIndex {
    fn new(fields: &[String]) -> Self {
        Self {
            names: fields.to_vec(),
        }
    }

    fn index_of(&self, name: &str) -> Result<usize> {
        self.names
            .iter()
            .position(|n| n == name)
            .ok_or_else(|| EtlError::ValidationError {
                message: format!("Field '{}' not found in response", name),
            })
    }

    fn get_str(&self, row: &[Value], name: &str) -> Result<String> {
        let idx = self.index_of(name)?;
        match row.get(idx) {
            Some(Value::String(s)) => Ok(s.clone()),
            Some(Value::Null) | None => Err(EtlError::ValidationError {
                message: format!("Missing value for field '{}'", name),
            }),
            Some(other) => Ok(other.to_string()),
        }
    }

    /// null 視為缺值 (NaN)
    fn get_f64(&self, row: &[Value], name: &str) -> Result<f64> {
        let idx = self.index_of(name)?;
        match row.get(idx) {
            Some(Value::Null) | None => Ok(f64::NAN),
            Some(v) => v.as_f64().ok_or_else(|| EtlError::ValidationError {
                message: format!("Field '{}' is not numeric: {}", name, v),
            }),
        }
    }
}

fn parse_trade_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y%m%d").map_err(|e| EtlError::ValidationError {
        message: format!("Failed to parse trade_date '{}': {}", s, e),
    })
}
