//! 檔案型金鑰庫。
//!
//! 提供兩類持久化物件：具名金鑰容器（開啟即得、缺席即建）與
//! 憑證記錄（以 friendly name 歸檔，記錄綁定的私鑰名稱）。
//! 兩個獨立的內容脈絡（使用者、機器）對應儲存中的兩個前綴，
//! 彼此完全隔離。

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    base64,
    certificate::{Certificate, CertificateError},
    key_pair::{KeyAlgorithm, KeyError, KeyPair},
    storage::{Storage, StorageError},
};

/// 金鑰庫操作可能發生的錯誤類型。
#[derive(Debug, Error)]
pub enum KeystoreError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Key error: {0}")]
    Key(#[from] KeyError),
    #[error("Certificate error: {0}")]
    Certificate(#[from] CertificateError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Certificate public key does not match the supplied private key")]
    KeyMismatch,
}

type Result<T> = std::result::Result<T, KeystoreError>;

/// 金鑰庫的內容脈絡：個別使用者或整台機器。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreContext {
    User,
    Machine,
}

impl StoreContext {
    fn prefix(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Machine => "machine",
        }
    }
}

/// 金鑰容器的使用政策。
///
/// 檔案型金鑰庫不強制這些旗標，僅如實記錄，
/// 讓讀取方能得知金鑰當初的建立意圖。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyPolicy {
    pub exportable: bool,
    pub allow_plaintext_export: bool,
    pub all_usages: bool,
}

impl Default for KeyPolicy {
    fn default() -> Self {
        Self {
            exportable: true,
            allow_plaintext_export: true,
            all_usages: true,
        }
    }
}

/// 具名金鑰容器的持久化格式。
#[derive(Debug, Serialize, Deserialize)]
struct KeyRecord {
    name: String,
    policy: KeyPolicy,
    pem: String,
}

/// 具名金鑰容器的操作介面。
#[derive(Debug)]
pub struct KeyStore<'s> {
    storage: &'s dyn Storage,
    context: StoreContext,
}

impl<'s> KeyStore<'s> {
    pub fn new(storage: &'s dyn Storage, context: StoreContext) -> Self {
        Self { storage, context }
    }

    /// 金鑰名稱可能含有空白或斜線，編碼後才能作為儲存 key。
    fn path(&self, name: &str) -> String {
        format!(
            "{}/keys/{}.json",
            self.context.prefix(),
            base64::encode_url(name)
        )
    }

    /// 開啟既有的具名金鑰，不存在時回傳 `None`。
    pub fn open(&self, name: &str) -> Result<Option<KeyPair>> {
        match self.storage.read(&self.path(name)) {
            Ok(data) => {
                let record: KeyRecord = serde_json::from_slice(&data)?;
                Ok(Some(KeyPair::from_pem(record.pem.as_bytes())?))
            }
            Err(StorageError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// 開啟具名金鑰；不存在時依指定演算法建立並持久化。
    ///
    /// 既有金鑰直接回傳，即使演算法與參數不符；
    /// 是否重建由呼叫方決定。
    pub fn open_or_create(&self, name: &str, algorithm: KeyAlgorithm) -> Result<KeyPair> {
        if let Some(existing) = self.open(name)? {
            return Ok(existing);
        }
        self.create(name, algorithm)
    }

    /// 強制建立一把新的具名金鑰，覆蓋既有內容。
    pub fn create(&self, name: &str, algorithm: KeyAlgorithm) -> Result<KeyPair> {
        let key = KeyPair::generate(algorithm)?;
        let record = KeyRecord {
            name: name.to_string(),
            policy: KeyPolicy::default(),
            pem: key.to_pem()?,
        };
        self.storage
            .write(&self.path(name), serde_json::to_vec(&record)?.as_slice())?;
        Ok(key)
    }

    /// 刪除具名金鑰；不存在時視為已刪除。
    pub fn delete(&self, name: &str) -> Result<()> {
        Ok(self.storage.remove(&self.path(name))?)
    }
}

/// 一筆已安裝的憑證記錄：憑證本體加上綁定的私鑰名稱與比對
/// 所需的中繼資料。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateRecord {
    pub friendly_name: String,
    pub key_name: String,
    pub thumbprint: String,
    pub not_after: i64,
    pub key_algorithm: String,
    pub key_bits: u32,
    pub cert_pem: String,
}

impl CertificateRecord {
    /// 還原憑證物件。
    pub fn certificate(&self) -> std::result::Result<Certificate, CertificateError> {
        Certificate::from_pem(&self.cert_pem)
    }
}

/// 憑證記錄的操作介面。
#[derive(Debug)]
pub struct CertStore<'s> {
    storage: &'s dyn Storage,
    context: StoreContext,
}

impl<'s> CertStore<'s> {
    pub fn new(storage: &'s dyn Storage, context: StoreContext) -> Self {
        Self { storage, context }
    }

    fn dir(&self, friendly_name: &str) -> String {
        format!(
            "{}/certs/{}",
            self.context.prefix(),
            base64::encode_url(friendly_name)
        )
    }

    /// 安裝一張憑證並綁定其私鑰。
    ///
    /// # 錯誤
    ///
    /// 憑證公鑰與給定私鑰不符時回傳 [`KeystoreError::KeyMismatch`]，
    /// 記錄不會寫入。
    pub fn install(
        &self,
        certificate: &Certificate,
        friendly_name: &str,
        key_name: &str,
        key: &KeyPair,
    ) -> Result<CertificateRecord> {
        if !certificate.public_key_matches(key)? {
            return Err(KeystoreError::KeyMismatch);
        }

        let record = CertificateRecord {
            friendly_name: friendly_name.to_string(),
            key_name: key_name.to_string(),
            thumbprint: certificate.thumbprint(),
            not_after: certificate.not_after()?.timestamp(),
            key_algorithm: key.algorithm.name().to_string(),
            key_bits: key.algorithm.bits(),
            cert_pem: certificate.to_pem(),
        };

        let path = format!("{}/{}.json", self.dir(friendly_name), record.thumbprint);
        self.storage.write(&path, serde_json::to_vec(&record)?.as_slice())?;
        Ok(record)
    }

    /// 列出指定 friendly name 下的所有記錄。
    ///
    /// 排序規則：`not_after` 由新到舊，相同時以 thumbprint
    /// 的字典序決定，確保選擇結果可重現。
    pub fn records(&self, friendly_name: &str) -> Result<Vec<CertificateRecord>> {
        let mut records = Vec::new();
        for key in self.storage.list(&self.dir(friendly_name))? {
            let record: CertificateRecord = serde_json::from_slice(&self.storage.read(&key)?)?;
            records.push(record);
        }
        records.sort_by(|a, b| {
            b.not_after
                .cmp(&a.not_after)
                .then_with(|| a.thumbprint.cmp(&b.thumbprint))
        });
        Ok(records)
    }

    /// 取得指定 friendly name 目前有效的記錄（排序後的第一筆）。
    pub fn find_current(&self, friendly_name: &str) -> Result<Option<CertificateRecord>> {
        Ok(self.records(friendly_name)?.into_iter().next())
    }

    /// 取回記錄綁定的私鑰，金鑰已被刪除時回傳 `None`。
    pub fn key_for(&self, record: &CertificateRecord) -> Result<Option<KeyPair>> {
        KeyStore::new(self.storage, self.context).open(&record.key_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{certificate::test_support::TestCert, storage::MemStorage};

    fn rsa_key() -> KeyPair {
        KeyPair::generate(KeyAlgorithm::Rsa(2048)).unwrap()
    }

    #[test]
    fn test_open_or_create_is_stable() {
        let storage = MemStorage::new();
        let keys = KeyStore::new(&storage, StoreContext::User);

        let first = keys
            .open_or_create("acct - ca", KeyAlgorithm::Rsa(2048))
            .unwrap();
        let second = keys
            .open_or_create("acct - ca", KeyAlgorithm::Rsa(2048))
            .unwrap();
        assert!(first.pkey.public_eq(&second.pkey));
    }

    #[test]
    fn test_create_replaces_existing_key() {
        let storage = MemStorage::new();
        let keys = KeyStore::new(&storage, StoreContext::User);

        let first = keys.open_or_create("name", KeyAlgorithm::Rsa(2048)).unwrap();
        let second = keys.create("name", KeyAlgorithm::Rsa(2048)).unwrap();
        assert!(!first.pkey.public_eq(&second.pkey));
    }

    #[test]
    fn test_contexts_are_isolated() {
        let storage = MemStorage::new();
        let user = KeyStore::new(&storage, StoreContext::User);
        let machine = KeyStore::new(&storage, StoreContext::Machine);

        user.create("shared-name", KeyAlgorithm::Rsa(2048)).unwrap();
        assert!(machine.open("shared-name").unwrap().is_none());
    }

    #[test]
    fn test_install_rejects_foreign_key() {
        let storage = MemStorage::new();
        let certs = CertStore::new(&storage, StoreContext::User);

        let cert_key = rsa_key();
        let other_key = rsa_key();
        let cert =
            Certificate::from_der(TestCert::new("example.com").build(&cert_key)).unwrap();

        assert!(matches!(
            certs.install(&cert, "example.com - ca", "key-name", &other_key),
            Err(KeystoreError::KeyMismatch)
        ));
        assert!(certs.find_current("example.com - ca").unwrap().is_none());
    }

    #[test]
    fn test_selection_prefers_latest_not_after() {
        let storage = MemStorage::new();
        let certs = CertStore::new(&storage, StoreContext::User);
        let friendly = "example.com - ca";

        let old_key = rsa_key();
        let mut old_profile = TestCert::new("example.com");
        old_profile.days = 10;
        let old = Certificate::from_der(old_profile.build(&old_key)).unwrap();
        certs.install(&old, friendly, "old-key", &old_key).unwrap();

        let new_key = rsa_key();
        let mut new_profile = TestCert::new("example.com");
        new_profile.days = 90;
        let new = Certificate::from_der(new_profile.build(&new_key)).unwrap();
        certs.install(&new, friendly, "new-key", &new_key).unwrap();

        let current = certs.find_current(friendly).unwrap().unwrap();
        assert_eq!(current.key_name, "new-key");
        assert_eq!(certs.records(friendly).unwrap().len(), 2);

        let bound = certs.key_for(&current).unwrap();
        assert!(bound.is_none(), "金鑰尚未存入金鑰庫");
    }

    #[test]
    fn test_key_for_returns_bound_key() {
        let storage = MemStorage::new();
        let keys = KeyStore::new(&storage, StoreContext::User);
        let certs = CertStore::new(&storage, StoreContext::User);

        let key = keys
            .open_or_create("example.com - ca", KeyAlgorithm::Rsa(2048))
            .unwrap();
        let cert = Certificate::from_der(TestCert::new("example.com").build(&key)).unwrap();
        let record = certs
            .install(&cert, "example.com - ca", "example.com - ca", &key)
            .unwrap();

        let bound = certs.key_for(&record).unwrap().unwrap();
        assert!(bound.pkey.public_eq(&key.pkey));
    }
}
