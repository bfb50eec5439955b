pub mod download_pipeline;

pub use download_pipeline::DownloadPipeline;
