use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::{base64, key_pair::KeyPair};

/// JWK 相關操作的錯誤類型。
#[derive(Debug, Error)]
pub enum JwkError {
    /// 金鑰不是 RSA，無法轉換為帳戶 JWK。
    #[error("Account key must be RSA, got: {0}")]
    NotRsa(String),
    /// 讀取金鑰參數失敗。
    #[error("Failed to read key components: {0}")]
    KeyComponents(String),
    /// 序列化錯誤。
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// 帳戶金鑰的 JSON Web Key 表示。
///
/// 帳戶金鑰固定為 RSA，公開參數 `n`、`e` 以 URL 安全 Base64 編碼。
#[derive(Debug, Clone, Serialize)]
pub struct Jwk {
    kty: &'static str,
    e: String,
    n: String,
}

impl Jwk {
    /// 由金鑰對建立 JWK。
    ///
    /// # 錯誤
    ///
    /// 金鑰不是 RSA 時回傳 [`JwkError::NotRsa`]。
    pub fn from_key_pair(key_pair: &KeyPair) -> Result<Self, JwkError> {
        let (n, e) = key_pair
            .rsa_public_components()
            .map_err(|err| match err {
                crate::key_pair::KeyError::UnsupportedAlgorithm(name) => JwkError::NotRsa(name),
                other => JwkError::KeyComponents(other.to_string()),
            })?;

        Ok(Jwk {
            kty: "RSA",
            e: base64::encode_url(e),
            n: base64::encode_url(n),
        })
    }

    /// 轉為 JWS header 中 `jwk` 欄位使用的 JSON 值。
    pub fn to_value(&self) -> Value {
        json!({
            "kty": self.kty,
            "e": self.e,
            "n": self.n,
        })
    }

    /// thumbprint 計算所用的標準 JSON 表示。
    ///
    /// 欄位固定依 `e`、`kty`、`n` 的順序輸出且不含任何空白，
    /// 這個位元組序列是 thumbprint 穩定性的前提。
    pub fn canonical_json(&self) -> String {
        format!(
            r#"{{"e":"{}","kty":"{}","n":"{}"}}"#,
            self.e, self.kty, self.n
        )
    }
}
