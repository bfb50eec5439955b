use crate::core::Pipeline;
use crate::utils::error::Result;
use crate::utils::monitor::SystemMonitor;
use std::time::Instant;

pub struct EtlEngine<P: Pipeline> {
    pipeline: P,
    monitor: SystemMonitor,
}

impl<P: Pipeline> EtlEngine<P> {
    pub fn new(pipeline: P) -> Self {
        Self::new_with_monitoring(pipeline, false)
    }

    pub fn new_with_monitoring(pipeline: P, monitor_enabled: bool) -> Self {
        Self {
            pipeline,
            monitor: SystemMonitor::new(monitor_enabled),
        }
    }

    pub async fn run(&self) -> Result<String> {
        let started = Instant::now();
        tracing::info!("🚀 Starting ETL process...");
        self.monitor.log_stats("start");

        // Extract
        tracing::info!("📥 Extracting data...");
        let raw_data = self.pipeline.extract().await?;
        tracing::info!("📥 Extracted {} instrument series", raw_data.len());
        self.monitor.log_stats("extract");

        // Transform
        tracing::info!("🔄 Transforming data...");
        let result = self.pipeline.transform(raw_data).await?;
        tracing::info!(
            "🔄 Transformed into {} rows ({} instruments failed)",
            result.table.len(),
            result.failed.len()
        );
        self.monitor.log_stats("transform");

        // Load
        tracing::info!("💾 Loading data...");
        let output_path = self.pipeline.load(result).await?;
        tracing::info!("💾 Output saved to: {}", output_path);
        self.monitor.log_stats("load");

        tracing::info!("⏱️ ETL finished in {:.1}s", started.elapsed().as_secs_f64());
        self.monitor.log_final_stats();
        Ok(output_path)
    }
}
