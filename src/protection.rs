use serde_json::{json, Value};
use thiserror::Error;

use crate::{
    base64,
    jwk::{Jwk, JwkError},
    nonce::{NonceError, NonceT},
};

/// 建立保護標頭時可能產生的錯誤類型。
#[derive(Debug, Error)]
pub enum ProtectionError {
    /// JSON 序列化錯誤
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// nonce 相關錯誤
    #[error("Nonce error: {0}")]
    Nonce(#[from] NonceError),
    /// JWK 相關錯誤
    #[error("JWK error: {0}")]
    Jwk(#[from] JwkError),
}

type Result<T> = std::result::Result<T, ProtectionError>;

/// 一組可直接放入簽名本體的標頭：明文標頭與保護標頭。
///
/// 明文標頭為 `{alg, jwk}`；保護標頭在其上加入 `nonce`
/// 後以 URL 安全 Base64 編碼。
#[derive(Debug)]
pub struct SignedHeaders {
    /// 明文標頭的 JSON 值。
    pub header: Value,
    /// 保護標頭的 URL 安全 Base64 編碼字串。
    pub protected_b64: String,
}

/// 保護標頭產生器，持有 nonce 來源與帳戶金鑰的 JWK。
pub struct Protection<'a> {
    nonce: &'a dyn NonceT,
    jwk: Jwk,
}

impl<'a> Protection<'a> {
    /// 建立一個新的 [`Protection`] 實例。
    ///
    /// 帳戶金鑰固定為 RSA，演算法因此固定為 `RS256`。
    pub fn new(nonce: &'a dyn NonceT, jwk: Jwk) -> Self {
        Self { nonce, jwk }
    }

    /// 產生一組標頭。
    ///
    /// 每次呼叫都會向 nonce 來源取得全新的值；明文標頭不含 nonce，
    /// 保護標頭帶有 nonce。
    ///
    /// # Errors
    ///
    /// 取得 nonce 失敗時回傳 [`ProtectionError::Nonce`]。
    pub fn create_headers(&self) -> Result<SignedHeaders> {
        let jwk_value = self.jwk.to_value();
        let header = json!({
            "alg": "RS256",
            "jwk": jwk_value.clone(),
        });

        let nonce = self.nonce.get()?;
        let protected = json!({
            "alg": "RS256",
            "jwk": jwk_value,
            "nonce": nonce,
        });
        let protected_b64 = base64::encode_url(serde_json::to_string(&protected)?);

        Ok(SignedHeaders {
            header,
            protected_b64,
        })
    }
}
