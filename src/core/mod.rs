pub mod adjust;
pub mod audit;
pub mod compare;
pub mod downloader;
pub mod etl;
pub mod repair;
pub mod workspace;

pub use crate::domain::model::{PvTable, RawSeries, TransformResult};
pub use crate::domain::ports::{ConfigProvider, MarketDataSource, Pipeline, Storage};
pub use crate::utils::error::Result;
