use std::{
    collections::BTreeMap,
    fmt, fs, io,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
};

use thiserror::Error;

/// 儲存操作可能發生的錯誤類型。
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Key is invalid: {0}")]
    InvalidKey(String),
    #[error("Key not found: {0}")]
    NotFound(String),
    #[error("Lock poisoned")]
    LockPoisoned,
}

/// 儲存操作的結果類型，封裝 [`StorageError`]。
pub type Result<T> = std::result::Result<T, StorageError>;

/// 定義持久化儲存所需實現的 API。
///
/// key 為以 `/` 分隔的相對路徑，帳戶設定、金鑰與憑證記錄
/// 都透過這層介面讀寫，方便在測試中以記憶體實作替換。
pub trait Storage: Send + Sync + fmt::Debug {
    /// 讀取指定 key 的內容，key 不存在時回傳 [`StorageError::NotFound`]。
    fn read(&self, key: &str) -> Result<Vec<u8>>;

    /// 將資料寫入指定 key，必要的父層目錄會自動建立。
    fn write(&self, key: &str, value: &[u8]) -> Result<()>;

    /// 刪除指定 key；key 不存在時視為已刪除，不回報錯誤。
    fn remove(&self, key: &str) -> Result<()>;

    /// 檢查指定 key 是否存在。
    fn exists(&self, key: &str) -> Result<bool>;

    /// 列出直接位於 `prefix` 之下的所有 key，依字典序排序。
    fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// 驗證 key 格式：非空、不含控制字元或反斜線、
/// 不以 `/` 開頭結尾、每個節點不得為 `.` 或 `..`。
fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(StorageError::InvalidKey("empty key".to_string()));
    }
    if key.contains('\0') || key.contains('\n') || key.contains('\r') || key.contains('\\') {
        return Err(StorageError::InvalidKey(format!(
            "invalid characters in key: {}",
            key
        )));
    }
    if key.starts_with('/') || key.ends_with('/') || key.contains("//") {
        return Err(StorageError::InvalidKey(format!(
            "malformed path in key: {}",
            key
        )));
    }
    for component in key.split('/') {
        if component == "." || component == ".." {
            return Err(StorageError::InvalidKey(format!(
                "relative component in key: {}",
                key
            )));
        }
    }
    Ok(())
}

/// 基於檔案系統的儲存實作，每個 key 對應根目錄下的一個檔案。
///
/// 寫入的檔案在 Unix 上以 `0o600` 權限建立，金鑰材料不會被其他
/// 使用者讀取。
#[derive(Debug)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    /// 開啟（必要時建立）以 `root` 為根目錄的儲存。
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        fs::create_dir_all(&root)?;
        Ok(Self {
            root: root.as_ref().to_path_buf(),
        })
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }
}

impl Storage for FileStorage {
    fn read(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.resolve(key)?;
        match fs::read(&path) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, key: &str, value: &[u8]) -> Result<()> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        #[cfg(unix)]
        {
            use std::io::Write;
            use std::os::unix::fs::OpenOptionsExt;
            let mut file = fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&path)?;
            file.write_all(value)?;
        }
        #[cfg(not(unix))]
        {
            fs::write(&path, value)?;
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let path = self.resolve(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn exists(&self, key: &str) -> Result<bool> {
        let path = self.resolve(key)?;
        Ok(path.is_file())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let dir = self.resolve(prefix)?;
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    keys.push(format!("{}/{}", prefix, name));
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// 基於記憶體的儲存實作，供測試使用。
#[derive(Debug, Default)]
pub struct MemStorage {
    data: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemStorage {
    fn read(&self, key: &str) -> Result<Vec<u8>> {
        validate_key(key)?;
        let data = self.data.read().map_err(|_| StorageError::LockPoisoned)?;
        data.get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    fn write(&self, key: &str, value: &[u8]) -> Result<()> {
        validate_key(key)?;
        self.data
            .write()
            .map_err(|_| StorageError::LockPoisoned)?
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        self.data
            .write()
            .map_err(|_| StorageError::LockPoisoned)?
            .remove(key);
        Ok(())
    }

    fn exists(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        let data = self.data.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(data.contains_key(key))
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        validate_key(prefix)?;
        let data = self.data.read().map_err(|_| StorageError::LockPoisoned)?;
        let dir = format!("{}/", prefix);
        Ok(data
            .keys()
            .filter(|k| {
                k.strip_prefix(&dir)
                    .is_some_and(|rest| !rest.is_empty() && !rest.contains('/'))
            })
            .cloned()
            .collect())
    }
}
