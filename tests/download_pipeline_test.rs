use httpmock::prelude::*;
use pv_etl::adapters::qlib_bin::QlibBinStore;
use pv_etl::adapters::table;
use pv_etl::utils::error::EtlError;
use pv_etl::{DownloadPipeline, EtlEngine, LocalStorage, TomlConfig, TushareSource};
use serde_json::json;
use std::io::Read;
use std::time::Duration;
use tempfile::TempDir;

fn job_config(endpoint: &str, output: &str, formats: &str) -> TomlConfig {
    let content = format!(
        r#"
[pipeline]
name = "daily-pv-test"

[source]
endpoint = '{endpoint}'
token = "test-token"

[download]
start_date = "20200101"
end_date = "20200110"
list_statuses = ["L"]
indices = ["000300.SH"]
calls_per_minute = 60000
max_workers = 2
max_retries = 1
base_delay_ms = 1

[transform]
adjust_mode = "forward"
cutoff_date = "2020-01-01"
sample_instrument = "SH600000"

[load]
output_path = '{output}'
output_formats = {formats}
"#
    );
    TomlConfig::from_toml_str(&content).unwrap()
}

fn ok_table(fields: &[&str], items: serde_json::Value) -> serde_json::Value {
    json!({
        "request_id": "test",
        "code": 0,
        "msg": "",
        "data": { "fields": fields, "items": items }
    })
}

const DAILY_FIELDS: [&str; 8] = [
    "ts_code",
    "trade_date",
    "open",
    "high",
    "low",
    "close",
    "vol",
    "amount",
];

#[tokio::test]
async fn test_download_writes_csv_zip_and_features() {
    let server = MockServer::start();
    let temp_dir = TempDir::new().unwrap();
    let output = temp_dir.path().to_string_lossy().to_string();

    let ping_mock = server.mock(|when, then| {
        when.method(POST)
            .path("/")
            .json_body_partial(r#"{"api_name": "trade_cal"}"#);
        then.status(200).json_body(ok_table(
            &["exchange", "cal_date", "is_open"],
            json!([["SSE", "20200101", 0]]),
        ));
    });

    let list_mock = server.mock(|when, then| {
        when.method(POST)
            .path("/")
            .json_body_partial(r#"{"api_name": "stock_basic", "params": {"list_status": "L"}}"#);
        then.status(200).json_body(ok_table(
            &["ts_code", "name", "list_date"],
            json!([
                ["600000.SH", "浦發銀行", "19991110"],
                ["000001.SZ", "平安銀行", "19910403"]
            ]),
        ));
    });

    let daily_mock = server.mock(|when, then| {
        when.method(POST).path("/").json_body_partial(
            r#"{"api_name": "daily", "params": {"ts_code": "600000.SH"}}"#,
        );
        then.status(200).json_body(ok_table(
            &DAILY_FIELDS,
            json!([
                ["600000.SH", "20200103", 11.0, 12.0, 10.5, 11.0, 2000.0, 22000.0],
                ["600000.SH", "20200102", 10.0, 10.5, 9.5, 10.0, 1000.0, 10000.0]
            ]),
        ));
    });

    // 停牌標的沒有任何行情
    let empty_mock = server.mock(|when, then| {
        when.method(POST).path("/").json_body_partial(
            r#"{"api_name": "daily", "params": {"ts_code": "000001.SZ"}}"#,
        );
        then.status(200).json_body(ok_table(&DAILY_FIELDS, json!([])));
    });

    let factor_mock = server.mock(|when, then| {
        when.method(POST).path("/").json_body_partial(
            r#"{"api_name": "adj_factor", "params": {"ts_code": "600000.SH"}}"#,
        );
        then.status(200).json_body(ok_table(
            &["ts_code", "trade_date", "adj_factor"],
            json!([
                ["600000.SH", "20200102", 2.0],
                ["600000.SH", "20200103", 4.0]
            ]),
        ));
    });

    let index_mock = server.mock(|when, then| {
        when.method(POST).path("/").json_body_partial(
            r#"{"api_name": "index_daily", "params": {"ts_code": "000300.SH"}}"#,
        );
        then.status(200).json_body(ok_table(
            &DAILY_FIELDS,
            json!([["000300.SH", "20200102", 4100.0, 4150.0, 4080.0, 4140.0, 1.0e8, 2.0e8]]),
        ));
    });

    let config = job_config(&server.url("/"), &output, r#"["csv", "zip", "qlib"]"#);
    let source = TushareSource::new(config.token(), config.endpoint(), Duration::from_secs(5)).unwrap();
    let storage = LocalStorage::new(output.clone());
    let engine = EtlEngine::new(DownloadPipeline::new(storage, config, source));

    let result = engine.run().await;
    assert!(result.is_ok(), "pipeline failed: {:?}", result.err());
    let written = result.unwrap();
    assert!(written.contains("daily_pv.csv"));
    assert!(written.contains("daily_pv.zip"));
    assert!(written.contains("features/"));

    ping_mock.assert();
    list_mock.assert();
    daily_mock.assert();
    empty_mock.assert();
    factor_mock.assert();
    index_mock.assert();

    // CSV: 前復權後最新日的因子為 1.0
    let csv_bytes = std::fs::read(temp_dir.path().join("daily_pv.csv")).unwrap();
    let dataset = table::read_csv(&csv_bytes, "daily_pv.csv").unwrap();
    assert_eq!(dataset.instruments(), vec!["SH000300", "SH600000"]);
    assert_eq!(dataset.len(), 3);

    let stock = dataset.instrument_rows("SH600000");
    assert_eq!(stock.len(), 2);
    assert_eq!(stock[0].factor, Some(0.5));
    assert_eq!(stock[0].close, Some(5.0));
    assert_eq!(stock[1].factor, Some(1.0));
    assert_eq!(stock[1].close, Some(11.0));

    let index = dataset.instrument_rows("SH000300");
    assert_eq!(index[0].factor, Some(1.0));
    assert_eq!(index[0].close, Some(4140.0));

    // ZIP 內含同名 CSV
    let zip_file = std::fs::File::open(temp_dir.path().join("daily_pv.zip")).unwrap();
    let mut archive = zip::ZipArchive::new(zip_file).unwrap();
    assert_eq!(archive.len(), 1);
    let mut content = String::new();
    archive
        .by_name("daily_pv.csv")
        .unwrap()
        .read_to_string(&mut content)
        .unwrap();
    assert!(content.starts_with("datetime,instrument,$open,$close,$high,$low,$volume,$factor"));

    // 二進位目錄可以還原成同一張表
    let store = QlibBinStore::new(LocalStorage::new(output.clone()));
    assert_eq!(store.read_calendar().await.unwrap().len(), 2);
    let spans = store.read_instruments().await.unwrap();
    assert_eq!(spans.len(), 2);
    assert!(temp_dir
        .path()
        .join("features/sh600000/close.day.bin")
        .exists());

    let restored = store.load_table().await.unwrap();
    assert_eq!(restored.len(), dataset.len());
    assert_eq!(restored.instrument_rows("SH600000")[0].close, Some(5.0));
}

#[tokio::test]
async fn test_download_stops_when_token_is_rejected() {
    let server = MockServer::start();
    let temp_dir = TempDir::new().unwrap();
    let output = temp_dir.path().to_string_lossy().to_string();

    let ping_mock = server.mock(|when, then| {
        when.method(POST)
            .path("/")
            .json_body_partial(r#"{"api_name": "trade_cal"}"#);
        then.status(200).json_body(json!({
            "code": 40101,
            "msg": "token invalid",
            "data": null
        }));
    });
    let list_mock = server.mock(|when, then| {
        when.method(POST)
            .path("/")
            .json_body_partial(r#"{"api_name": "stock_basic"}"#);
        then.status(200).json_body(ok_table(&["ts_code"], json!([])));
    });

    let config = job_config(&server.url("/"), &output, r#"["csv"]"#);
    let source = TushareSource::new(config.token(), config.endpoint(), Duration::from_secs(5)).unwrap();
    let engine = EtlEngine::new(DownloadPipeline::new(LocalStorage::new(output), config, source));

    let err = engine.run().await.unwrap_err();
    match &err {
        EtlError::RemoteApiError { api, code, message } => {
            assert_eq!(api, "trade_cal");
            assert_eq!(*code, 40101);
            assert_eq!(message, "token invalid");
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(err.exit_code(), 2);

    ping_mock.assert();
    assert_eq!(list_mock.hits(), 0);
    assert!(!temp_dir.path().join("daily_pv.csv").exists());
}

#[tokio::test]
async fn test_download_with_server_error_exhausts_retries() {
    let server = MockServer::start();
    let temp_dir = TempDir::new().unwrap();
    let output = temp_dir.path().to_string_lossy().to_string();

    server.mock(|when, then| {
        when.method(POST)
            .path("/")
            .json_body_partial(r#"{"api_name": "trade_cal"}"#);
        then.status(200).json_body(ok_table(&["cal_date"], json!([])));
    });
    server.mock(|when, then| {
        when.method(POST)
            .path("/")
            .json_body_partial(r#"{"api_name": "stock_basic"}"#);
        then.status(200).json_body(ok_table(
            &["ts_code", "name", "list_date"],
            json!([["600000.SH", "浦發銀行", "19991110"]]),
        ));
    });
    let daily_mock = server.mock(|when, then| {
        when.method(POST)
            .path("/")
            .json_body_partial(r#"{"api_name": "daily"}"#);
        then.status(500).body("Internal Server Error");
    });
    let index_mock = server.mock(|when, then| {
        when.method(POST)
            .path("/")
            .json_body_partial(r#"{"api_name": "index_daily"}"#);
        then.status(500).body("Internal Server Error");
    });

    let config = job_config(&server.url("/"), &output, r#"["csv"]"#);
    let source = TushareSource::new(config.token(), config.endpoint(), Duration::from_secs(5)).unwrap();
    let engine = EtlEngine::new(DownloadPipeline::new(LocalStorage::new(output), config, source));

    // 所有標的都失敗時整個作業失敗
    let err = engine.run().await.unwrap_err();
    assert!(matches!(err, EtlError::ProcessingError { .. }), "got {:?}", err);
    assert_eq!(daily_mock.hits(), 1);
    assert_eq!(index_mock.hits(), 1);
}
