pub mod cli;
pub mod toml_config;

#[cfg(feature = "cli")]
use clap::{Args, Parser, Subcommand};
#[cfg(feature = "cli")]
use std::path::PathBuf;

#[cfg(feature = "cli")]
#[derive(Debug, Clone, Parser)]
#[command(name = "pv-etl")]
#[command(about = "Build, audit and repair a daily price/volume dataset")]
pub struct CliConfig {
    #[arg(long, global = true, help = "Enable verbose output")]
    pub verbose: bool,

    #[arg(long, global = true, help = "Log system resource usage per phase")]
    pub monitor: bool,

    #[arg(long, global = true, help = "Emit logs as JSON lines")]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[cfg(feature = "cli")]
#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// 下載全市場日線並輸出資料集
    Download {
        #[arg(long, short)]
        config: PathBuf,
    },
    /// 將逐檔 CSV 轉為二進位特徵目錄
    ConvertCsv {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        output: String,
        #[arg(long, default_value = "4")]
        workers: usize,
    },
    /// 將二進位特徵目錄匯出為資料表
    Export {
        #[arg(long)]
        input: String,
        #[arg(long)]
        output: String,
        #[arg(long, default_value = "daily_pv")]
        name: String,
        #[arg(long)]
        zip: bool,
    },
    /// 稽核單一資料表
    Audit {
        #[arg(long)]
        input: PathBuf,
        #[arg(long, default_value = "500")]
        sample_size: usize,
        #[arg(long)]
        seed: Option<u64>,
        #[arg(long, default_value = "SH600519")]
        sample_instrument: String,
    },
    /// 比較新舊資料表
    Compare {
        #[arg(long)]
        old: PathBuf,
        #[arg(long)]
        new: PathBuf,
        #[arg(long, default_value = "200")]
        sample_size: usize,
        #[arg(long)]
        seed: Option<u64>,
    },
    /// 檢查日曆與各標的資料長度
    CheckLength {
        #[arg(long)]
        dir: String,
        #[arg(long, default_value = "50")]
        limit: usize,
    },
    /// 修復或重建 instruments/all.txt
    FixInstruments {
        #[arg(long)]
        dir: String,
        #[arg(long, default_value = "1999-12-07")]
        start: String,
        #[arg(long, default_value = "2025-07-15")]
        end: String,
        #[arg(long, help = "Recompute spans from the close features instead")]
        rebuild: bool,
    },
    /// 產生完整與除錯用的資料子集
    Subset {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        output: String,
        #[arg(long, default_value = "2008-12-29")]
        cutoff: String,
        #[arg(long, default_value = "2018-01-01")]
        debug_start: String,
        #[arg(long, default_value = "2019-12-31")]
        debug_end: String,
        #[arg(long, default_value = "100")]
        debug_instruments: usize,
        #[arg(long, default_value = "daily_pv")]
        name: String,
        #[arg(long)]
        zip: bool,
    },
    /// 研究工作區維護
    #[command(subcommand)]
    Workspaces(WorkspaceCommand),
}

#[cfg(feature = "cli")]
#[derive(Debug, Clone, Subcommand)]
pub enum WorkspaceCommand {
    Distribute(DistributeArgs),
    Diagnose {
        #[arg(long)]
        root: PathBuf,
        #[arg(long, default_value = "result.csv")]
        target: String,
        #[arg(long, help = "Delete the corrupted files that were found")]
        cleanup: bool,
        #[arg(long)]
        dry_run: bool,
    },
    Cleanup {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        #[arg(long)]
        dry_run: bool,
    },
}

#[cfg(feature = "cli")]
#[derive(Debug, Clone, Args)]
pub struct DistributeArgs {
    #[arg(long)]
    pub root: PathBuf,
    #[arg(long)]
    pub source: PathBuf,
    #[arg(long)]
    pub debug_source: Option<PathBuf>,
    #[arg(long, default_value = "factor.py")]
    pub marker: String,
    #[arg(long = "template")]
    pub templates: Vec<PathBuf>,
    #[arg(long)]
    pub no_backup: bool,
}

#[cfg(all(test, feature = "cli"))]
mod tests {
    use super::*;

    #[test]
    fn test_parse_download() {
        let cli = CliConfig::parse_from(["pv-etl", "--verbose", "download", "-c", "job.toml"]);
        assert!(cli.verbose);
        assert!(matches!(cli.command, Command::Download { ref config } if config == &PathBuf::from("job.toml")));
    }

    #[test]
    fn test_parse_workspace_distribute() {
        let cli = CliConfig::parse_from([
            "pv-etl",
            "workspaces",
            "distribute",
            "--root",
            "/ws",
            "--source",
            "daily_pv.csv",
            "--template",
            "tpl/a",
            "--template",
            "tpl/debug",
            "--monitor",
        ]);
        assert!(cli.monitor);
        match cli.command {
            Command::Workspaces(WorkspaceCommand::Distribute(args)) => {
                assert_eq!(args.templates.len(), 2);
                assert_eq!(args.marker, "factor.py");
                assert!(!args.no_backup);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
