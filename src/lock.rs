use std::{
    fs::{self, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    process,
};

use log::warn;
use thiserror::Error;

/// 鎖定檔相關的錯誤類型。
#[derive(Debug, Error)]
pub enum LockError {
    /// 鎖定檔已存在，代表另一次執行正在進行中。
    /// 既有的檔案不會被移動或刪除。
    #[error("Lock file already held: {}", .0.display())]
    Held(PathBuf),
    /// 鎖定檔無法建立或寫入。
    #[error("Cannot write lock file: {0}")]
    Unwritable(#[from] io::Error),
}

/// 諮詢式的單一實例鎖。
///
/// 取得時建立鎖定檔並寫入本行程的識別碼（十進位文字）；
/// 釋放發生在值被捨棄時，涵蓋所有正常結束與錯誤回傳路徑。
/// 行程被強制終止時檔案會殘留，需人工清除。這只是約定層面的
/// 互斥，不假設任何核心層級的排他機制。
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
}

impl LockGuard {
    /// 嘗試取得鎖。
    ///
    /// # 錯誤
    ///
    /// 鎖定檔已存在回傳 [`LockError::Held`]；建立或寫入失敗回傳
    /// [`LockError::Unwritable`]。
    pub fn acquire<P: AsRef<Path>>(path: P) -> Result<Self, LockError> {
        let path = path.as_ref().to_path_buf();

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(LockError::Held(path));
            }
            Err(e) => return Err(e.into()),
        };

        if let Err(e) = file.write_all(process::id().to_string().as_bytes()) {
            // 寫入失敗時撤回剛建立的檔案
            let _ = fs::remove_file(&path);
            return Err(e.into());
        }

        Ok(LockGuard { path })
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("failed to remove lock file {}: {}", self.path.display(), e);
            }
        }
    }
}
