use crate::domain::ports::Storage;
use crate::utils::error::Result;
use std::fs;
use std::path::{Path, PathBuf};

/// 以本機目錄為根的儲存後端
#[derive(Debug, Clone)]
pub struct LocalStorage {
    base_path: String,
}

impl LocalStorage {
    pub fn new(base_path: impl Into<String>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    pub fn full_path(&self, path: &str) -> PathBuf {
        Path::new(&self.base_path).join(path)
    }
}

impl Storage for LocalStorage {
    async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let data = fs::read(self.full_path(path))?;
        Ok(data)
    }

    async fn write_file(&self, path: &str, data: &[u8]) -> Result<()> {
        let full_path = self.full_path(path);

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(full_path, data)?;
        Ok(())
    }

    async fn exists(&self, path: &str) -> bool {
        self.full_path(path).exists()
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<String>> {
        let mut names: Vec<String> = fs::read_dir(self.full_path(path))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_creates_parents_and_lists() {
        let dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(dir.path().to_string_lossy());

        storage.write_file("features/sh600000/close.day.bin", b"abcd").await.unwrap();
        storage.write_file("features/sz000001/close.day.bin", b"abcd").await.unwrap();

        assert!(storage.exists("features/sh600000/close.day.bin").await);
        assert!(!storage.exists("features/sh600001").await);
        assert_eq!(
            storage.list_dir("features").await.unwrap(),
            vec!["sh600000", "sz000001"]
        );
        assert_eq!(
            storage.read_file("features/sh600000/close.day.bin").await.unwrap(),
            b"abcd"
        );
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(dir.path().to_string_lossy());

        let result = tokio_test::block_on(storage.read_file("calendars/day.txt"));
        assert!(matches!(result, Err(crate::utils::error::EtlError::IoError(_))));
        assert!(tokio_test::block_on(storage.list_dir("features")).is_err());
    }
}
