//! 研究工作區維護：分發資料檔、診斷結果檔、清理損壞檔案

use crate::adapters::table::{self, DATETIME_COLUMN, INSTRUMENT_COLUMN};
use crate::utils::error::{EtlError, Result};
use std::fs;
use std::path::{Path, PathBuf};

const BACKUP_SUFFIX: &str = ".backup";

#[derive(Debug, Clone)]
pub struct DistributeOptions {
    pub workspace_root: PathBuf,
    pub source: PathBuf,
    pub debug_source: Option<PathBuf>,
    /// 標記檔，存在時該子目錄才需要資料
    pub marker: String,
    pub template_dirs: Vec<PathBuf>,
    pub backup: bool,
}

#[derive(Debug, Default)]
pub struct DistributeReport {
    pub scanned_dirs: usize,
    pub updated: Vec<PathBuf>,
    pub templates: Vec<PathBuf>,
    pub backups: usize,
    pub errors: Vec<(PathBuf, String)>,
}

fn sorted_subdirs(root: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs: Vec<PathBuf> = fs::read_dir(root)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    dirs.sort();
    Ok(dirs)
}

fn file_name_of(path: &Path) -> Result<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| EtlError::ValidationError {
            message: format!("{} has no file name", path.display()),
        })
}

/// 複製並視需要先備份目標；回傳是否建立了備份
fn copy_with_backup(source: &Path, target: &Path, backup: bool) -> Result<bool> {
    let mut backed_up = false;
    if backup && target.exists() {
        let mut backup_path = target.as_os_str().to_owned();
        backup_path.push(BACKUP_SUFFIX);
        let backup_path = PathBuf::from(backup_path);
        if !backup_path.exists() {
            fs::copy(target, &backup_path)?;
            backed_up = true;
        }
    }
    fs::copy(source, target)?;
    Ok(backed_up)
}

pub fn distribute(options: &DistributeOptions) -> Result<DistributeReport> {
    if !options.source.is_file() {
        return Err(EtlError::ValidationError {
            message: format!("Source file not found: {}", options.source.display()),
        });
    }
    if !options.workspace_root.is_dir() {
        return Err(EtlError::ValidationError {
            message: format!(
                "Workspace root not found: {}",
                options.workspace_root.display()
            ),
        });
    }
    let target_name = file_name_of(&options.source)?;
    let mut report = DistributeReport::default();

    for dir in sorted_subdirs(&options.workspace_root)? {
        report.scanned_dirs += 1;
        if !dir.join(&options.marker).exists() {
            continue;
        }
        let target = dir.join(&target_name);
        match copy_with_backup(&options.source, &target, options.backup) {
            Ok(backed_up) => {
                report.backups += usize::from(backed_up);
                report.updated.push(target);
            }
            Err(e) => {
                tracing::warn!("⚠️ Failed to update {}: {}", dir.display(), e);
                report.errors.push((dir.clone(), e.to_string()));
            }
        }
        if report.scanned_dirs % 100 == 0 {
            tracing::info!(
                "📂 Scanned {} directories, updated {}",
                report.scanned_dirs,
                report.updated.len()
            );
        }
    }

    for template in &options.template_dirs {
        if !template.is_dir() {
            tracing::debug!("Template dir {} does not exist, skipped", template.display());
            continue;
        }
        let is_debug = template.to_string_lossy().contains("debug");
        let source = match (&options.debug_source, is_debug) {
            (Some(debug), true) => debug,
            (None, true) => {
                tracing::warn!(
                    "⚠️ No debug source given, using the full file for {}",
                    template.display()
                );
                &options.source
            }
            _ => &options.source,
        };
        let target = template.join(&target_name);
        match copy_with_backup(source, &target, options.backup) {
            Ok(backed_up) => {
                report.backups += usize::from(backed_up);
                report.templates.push(target);
            }
            Err(e) => report.errors.push((template.clone(), e.to_string())),
        }
    }

    tracing::info!(
        "✅ Distributed to {} workspaces and {} templates ({} errors)",
        report.updated.len(),
        report.templates.len(),
        report.errors.len()
    );
    Ok(report)
}

#[derive(Debug, Clone, PartialEq)]
pub enum Diagnosis {
    Healthy,
    WrongIndex { columns: Vec<String> },
    Unreadable { reason: String },
}

#[derive(Debug, Default)]
pub struct DiagnoseReport {
    pub checked: usize,
    pub corrupted: Vec<(PathBuf, Diagnosis)>,
}

impl DiagnoseReport {
    pub fn corrupted_paths(&self) -> Vec<PathBuf> {
        self.corrupted.iter().map(|(p, _)| p.clone()).collect()
    }
}

fn is_zip(path: &Path) -> bool {
    path.extension().map(|e| e == "zip").unwrap_or(false)
}

/// 壓縮檔先取出其中的 CSV
fn csv_bytes(path: &Path) -> Result<Vec<u8>> {
    let bytes = fs::read(path)?;
    if is_zip(path) {
        table::zip_entry(&bytes, &path.display().to_string())
    } else {
        Ok(bytes)
    }
}

/// 結果表的前兩欄必須是 `datetime,instrument`
pub fn diagnose_file(path: &Path) -> Diagnosis {
    let bytes = match csv_bytes(path) {
        Ok(b) => b,
        Err(e) => {
            return Diagnosis::Unreadable {
                reason: e.to_string(),
            }
        }
    };
    let mut reader = csv::Reader::from_reader(bytes.as_slice());
    let columns: Vec<String> = match reader.headers() {
        Ok(h) => h.iter().map(|c| c.trim().to_string()).collect(),
        Err(e) => {
            return Diagnosis::Unreadable {
                reason: e.to_string(),
            }
        }
    };
    if columns.len() < 2 || columns[0] != DATETIME_COLUMN || columns[1] != INSTRUMENT_COLUMN {
        return Diagnosis::WrongIndex { columns };
    }
    match table::read_csv(&bytes, &path.display().to_string()) {
        Ok(_) => Diagnosis::Healthy,
        Err(e) => Diagnosis::Unreadable {
            reason: e.to_string(),
        },
    }
}

/// 檢查每個工作區子目錄中的 `target_name`
pub fn diagnose(workspace_root: &Path, target_name: &str) -> Result<DiagnoseReport> {
    let mut report = DiagnoseReport::default();
    for dir in sorted_subdirs(workspace_root)? {
        let target = dir.join(target_name);
        if !target.is_file() {
            continue;
        }
        report.checked += 1;
        let diagnosis = diagnose_file(&target);
        match &diagnosis {
            Diagnosis::Healthy => continue,
            Diagnosis::WrongIndex { columns } => {
                tracing::warn!("⚠️ Wrong index in {}: {:?}", target.display(), columns)
            }
            Diagnosis::Unreadable { reason } => {
                tracing::warn!("⚠️ Cannot read {}: {}", target.display(), reason)
            }
        }
        report.corrupted.push((target, diagnosis));
    }
    Ok(report)
}

#[derive(Debug, Default)]
pub struct CleanupReport {
    pub deleted: Vec<PathBuf>,
    pub missing: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, String)>,
    pub dry_run: bool,
}

pub fn cleanup(paths: &[PathBuf], dry_run: bool) -> CleanupReport {
    let mut report = CleanupReport {
        dry_run,
        ..Default::default()
    };
    for path in paths {
        if !path.exists() {
            report.missing.push(path.clone());
            continue;
        }
        if dry_run {
            tracing::info!("[DRY RUN] would delete {}", path.display());
            report.deleted.push(path.clone());
            continue;
        }
        match fs::remove_file(path) {
            Ok(()) => {
                tracing::info!("🗑️ Deleted {}", path.display());
                report.deleted.push(path.clone());
            }
            Err(e) => report.failed.push((path.clone(), e.to_string())),
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::{PvRow, PvTable};
    use tempfile::TempDir;

    #[test]
    fn test_diagnose_file() {
        let dir = TempDir::new().unwrap();
        let good = dir.path().join("good.csv");
        fs::write(&good, "datetime,instrument,factor\n2020-01-02,SH600000,1.0\n").unwrap();
        assert_eq!(diagnose_file(&good), Diagnosis::Healthy);

        let wrong = dir.path().join("wrong.csv");
        fs::write(&wrong, "instrument,datetime\nSH600000,2020-01-02\n").unwrap();
        assert!(matches!(diagnose_file(&wrong), Diagnosis::WrongIndex { .. }));

        let broken = dir.path().join("broken.zip");
        fs::write(&broken, b"not a zip").unwrap();
        assert!(matches!(diagnose_file(&broken), Diagnosis::Unreadable { .. }));
    }

    #[test]
    fn test_diagnose_zipped_result() {
        let dir = TempDir::new().unwrap();
        let date = chrono::NaiveDate::from_ymd_opt(2020, 1, 2).unwrap();
        let mut row = PvRow::empty(date, "SH600000");
        row.close = Some(10.0);
        let bytes = table::write_zip(&PvTable::new(vec![row]), "result").unwrap();
        let zipped = dir.path().join("result.zip");
        fs::write(&zipped, bytes).unwrap();
        assert_eq!(diagnose_file(&zipped), Diagnosis::Healthy);

        let bad_rows = dir.path().join("bad_rows.zip");
        let mut zip = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        zip.start_file("bad_rows.csv", zip::write::SimpleFileOptions::default())
            .unwrap();
        std::io::Write::write_all(&mut zip, b"datetime,instrument\nnot-a-date,SH600000\n").unwrap();
        fs::write(&bad_rows, zip.finish().unwrap().into_inner()).unwrap();
        assert!(matches!(diagnose_file(&bad_rows), Diagnosis::Unreadable { .. }));
    }

    #[test]
    fn test_cleanup_dry_run_keeps_files() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("result.csv");
        fs::write(&file, "x").unwrap();
        let ghost = dir.path().join("ghost.csv");

        let report = cleanup(&[file.clone(), ghost.clone()], true);
        assert_eq!(report.deleted, vec![file.clone()]);
        assert_eq!(report.missing, vec![ghost]);
        assert!(file.exists());

        let report = cleanup(&[file.clone()], false);
        assert_eq!(report.deleted.len(), 1);
        assert!(!file.exists());
    }
}
