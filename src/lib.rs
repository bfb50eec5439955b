pub mod adapters;
pub mod app;
pub mod config;
pub mod core;
pub mod domain;
pub mod research;
pub mod utils;

pub use config::cli::LocalStorage;
pub use config::toml_config::TomlConfig;
#[cfg(feature = "cli")]
pub use config::CliConfig;

pub use adapters::qlib_bin::QlibBinStore;
pub use adapters::tushare::TushareSource;
pub use app::pipelines::DownloadPipeline;
pub use core::etl::EtlEngine;
pub use domain::model::{PvRow, PvTable};
pub use utils::error::{EtlError, Result};
