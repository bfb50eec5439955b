use clap::Parser;
use pv_etl::adapters::qlib_bin::{convert_csv_dir, QlibBinStore};
use pv_etl::adapters::table;
use pv_etl::config::{CliConfig, Command, DistributeArgs, WorkspaceCommand};
use pv_etl::core::audit::{audit_table, AuditOptions};
use pv_etl::core::compare::{compare_tables, CompareOptions};
use pv_etl::core::repair::{self, SubsetOptions};
use pv_etl::core::workspace::{self, DistributeOptions};
use pv_etl::domain::model::PvTable;
use pv_etl::utils::error::{EtlError, Result};
use pv_etl::utils::{logger, validation, validation::Validate};
use pv_etl::{DownloadPipeline, EtlEngine, LocalStorage, TomlConfig, TushareSource};
use std::path::Path;

async fn read_table_file(path: &Path) -> Result<PvTable> {
    let bytes = tokio::fs::read(path).await?;
    table::decode(&bytes, &path.display().to_string())
}

fn cli_date(field: &str, value: &str) -> Result<chrono::NaiveDate> {
    validation::validate_date(field, value, "%Y-%m-%d")
}

/// 檢查項有失敗時轉成錯誤，讓退出碼反映結果
fn verdict(failed: usize, what: &str) -> Result<String> {
    if failed > 0 {
        return Err(EtlError::ValidationError {
            message: format!("{} found {} failed checks", what, failed),
        });
    }
    Ok(format!("{} passed", what))
}

async fn run_download(config_path: &Path, monitor: bool) -> Result<String> {
    let config = TomlConfig::from_file(config_path)?;

    // 驗證配置
    if let Err(e) = config.validate() {
        tracing::error!("❌ Configuration validation failed: {}", e);
        tracing::error!("💡 Suggestion: {}", e.recovery_suggestion());
        return Err(e);
    }
    tracing::info!(
        "📋 Loaded job '{}' {} ({})",
        config.pipeline.name,
        config.pipeline.version,
        config.pipeline.description
    );

    let monitor_enabled = monitor || config.monitoring_enabled();
    if monitor_enabled {
        tracing::info!("🔍 System monitoring enabled");
    }

    let source = TushareSource::new(config.token(), config.endpoint(), config.timeout())?;
    let storage = LocalStorage::new(config.load.output_path.clone());
    let pipeline = DownloadPipeline::new(storage, config, source);

    let engine = EtlEngine::new_with_monitoring(pipeline, monitor_enabled);
    engine.run().await
}

async fn run_workspaces(command: WorkspaceCommand) -> Result<String> {
    match command {
        WorkspaceCommand::Distribute(DistributeArgs {
            root,
            source,
            debug_source,
            marker,
            templates,
            no_backup,
        }) => {
            let report = workspace::distribute(&DistributeOptions {
                workspace_root: root,
                source,
                debug_source,
                marker,
                template_dirs: templates,
                backup: !no_backup,
            })?;
            for (dir, reason) in &report.errors {
                eprintln!("⚠️ {}: {}", dir.display(), reason);
            }
            Ok(format!(
                "Scanned {} directories: {} workspaces and {} templates updated, {} backups, {} errors",
                report.scanned_dirs,
                report.updated.len(),
                report.templates.len(),
                report.backups,
                report.errors.len()
            ))
        }
        WorkspaceCommand::Diagnose {
            root,
            target,
            cleanup,
            dry_run,
        } => {
            let report = workspace::diagnose(&root, &target)?;
            for (path, diagnosis) in &report.corrupted {
                println!("{}: {:?}", path.display(), diagnosis);
            }
            let mut message = format!(
                "Checked {} files, {} corrupted",
                report.checked,
                report.corrupted.len()
            );
            if cleanup && !report.corrupted.is_empty() {
                let cleaned = workspace::cleanup(&report.corrupted_paths(), dry_run);
                message.push_str(&format!(
                    ", {} {}",
                    cleaned.deleted.len(),
                    if cleaned.dry_run { "would be deleted" } else { "deleted" }
                ));
            }
            Ok(message)
        }
        WorkspaceCommand::Cleanup { paths, dry_run } => {
            let report = workspace::cleanup(&paths, dry_run);
            for (path, reason) in &report.failed {
                eprintln!("⚠️ {}: {}", path.display(), reason);
            }
            Ok(format!(
                "{}{} deleted, {} missing, {} failed",
                if report.dry_run { "[DRY RUN] " } else { "" },
                report.deleted.len(),
                report.missing.len(),
                report.failed.len()
            ))
        }
    }
}

async fn run(config: CliConfig) -> Result<String> {
    match config.command {
        Command::Download { config: path } => run_download(&path, config.monitor).await,
        Command::ConvertCsv {
            input,
            output,
            workers,
        } => {
            validation::validate_positive_number("workers", workers, 1)?;
            let store = QlibBinStore::new(LocalStorage::new(output.clone()));
            let summary = convert_csv_dir(&input, &store, workers).await?;
            if !summary.skipped.is_empty() {
                tracing::warn!("⚠️ Skipped files: {}", summary.skipped.join(", "));
            }
            Ok(format!(
                "Converted {} symbols over {} calendar days into {}",
                summary.converted, summary.calendar_days, output
            ))
        }
        Command::Export {
            input,
            output,
            name,
            zip,
        } => {
            let store = QlibBinStore::new(LocalStorage::new(input));
            let table = store.load_table().await?;
            let storage = LocalStorage::new(output.clone());
            let path = table::write_table(&storage, &table, &name, zip).await?;
            Ok(format!("Exported {} rows to {}/{}", table.len(), output, path))
        }
        Command::Audit {
            input,
            sample_size,
            seed,
            sample_instrument,
        } => {
            let table = read_table_file(&input).await?;
            let options = AuditOptions {
                sample_size,
                seed,
                sample_instrument,
                ..Default::default()
            };
            let report = audit_table(&table, &options)?;
            println!("{}", report.text);
            verdict(report.checks.failed(), "Audit")
        }
        Command::Compare {
            old,
            new,
            sample_size,
            seed,
        } => {
            let (old_table, new_table) = tokio::try_join!(read_table_file(&old), read_table_file(&new))?;
            let options = CompareOptions {
                sample_size,
                seed,
                ..Default::default()
            };
            let report = compare_tables(&old_table, &new_table, &options)?;
            println!("{}", report.text);
            verdict(report.checks.failed(), "Comparison")
        }
        Command::CheckLength { dir, limit } => {
            let store = QlibBinStore::new(LocalStorage::new(dir));
            let report = repair::check_data_length(&store, limit).await?;
            println!("{}", report.render());
            Ok(format!(
                "{} of {} checked instruments are shorter than the calendar",
                report.incomplete(),
                report.lengths.len()
            ))
        }
        Command::FixInstruments {
            dir,
            start,
            end,
            rebuild,
        } => {
            let store = QlibBinStore::new(LocalStorage::new(dir));
            if rebuild {
                let spans = repair::rebuild_instruments(&store).await?;
                return Ok(format!("Rebuilt instruments file with {} entries", spans.len()));
            }
            let start = cli_date("start", &start)?;
            let end = cli_date("end", &end)?;
            let report = repair::fix_instruments(&store, start, end).await?;
            if let Some(backup) = &report.backup {
                println!("📦 Backup written to {}", backup);
            }
            Ok(format!("Rewrote instruments file with {} codes", report.codes.len()))
        }
        Command::Subset {
            input,
            output,
            cutoff,
            debug_start,
            debug_end,
            debug_instruments,
            name,
            zip,
        } => {
            let table = read_table_file(&input).await?;
            let options = SubsetOptions {
                cutoff: cli_date("cutoff", &cutoff)?,
                debug_start: cli_date("debug_start", &debug_start)?,
                debug_end: cli_date("debug_end", &debug_end)?,
                debug_instruments,
            };
            let (full, debug) = repair::subset(&table, &options)?;
            let storage = LocalStorage::new(output.clone());
            let full_path = table::write_table(&storage, &full, &name, zip).await?;
            let debug_path = table::write_table(&storage, &debug, &format!("{}_debug", name), zip).await?;
            Ok(format!(
                "Wrote {}/{} ({} rows) and {}/{} ({} rows)",
                output,
                full_path,
                full.len(),
                output,
                debug_path,
                debug.len()
            ))
        }
        Command::Workspaces(command) => run_workspaces(command).await,
    }
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let config = CliConfig::parse();

    // 初始化日誌
    logger::init(config.verbose, config.log_json);

    tracing::info!("Starting pv-etl CLI");
    if config.verbose {
        tracing::debug!("CLI config: {:?}", config);
    }

    match run(config).await {
        Ok(message) => {
            tracing::info!("✅ {}", message);
            println!("✅ {}", message);
        }
        Err(e) => {
            // 記錄詳細錯誤信息
            tracing::error!(
                "❌ Job failed: {} (Category: {:?}, Severity: {:?})",
                e,
                e.category(),
                e.severity()
            );
            tracing::error!("💡 Recovery suggestion: {}", e.recovery_suggestion());

            // 輸出用戶友好的錯誤信息
            eprintln!("❌ {}", e.user_friendly_message());
            eprintln!("💡 建議: {}", e.recovery_suggestion());

            // 根據錯誤嚴重程度決定退出碼
            let exit_code = e.exit_code();
            if exit_code > 0 {
                std::process::exit(exit_code);
            }
        }
    }

    Ok(())
}
