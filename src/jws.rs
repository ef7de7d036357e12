//! 簽名請求本體的組裝。
//!
//! 請求本體帶有四個欄位：`header`（明文標頭，含演算法與 JWK）、
//! `protected`（加上 nonce 後編碼的保護標頭）、`payload` 與
//! `signature`，後三者皆為 URL 安全 Base64 字串。

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// 與簽名本體相關的錯誤。
#[derive(Debug, Error)]
pub enum JwsError {
    /// JSON 序列化過程中發生錯誤時回傳此錯誤。
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// 一筆完整的簽名請求本體。
#[derive(Debug, Serialize)]
pub struct SignedBody {
    /// 明文標頭，內容為 `{alg, jwk}`。
    pub header: Value,
    /// 保護標頭（明文標頭加 nonce）的 URL 安全 Base64 編碼。
    pub protected: String,
    /// 請求負載的 URL 安全 Base64 編碼。
    pub payload: String,
    /// `protected || "." || payload` 的 RS256 簽名，URL 安全 Base64 編碼。
    pub signature: String,
}

impl SignedBody {
    /// 將簽名本體序列化為 JSON 字串，作為 HTTP 請求本體送出。
    pub fn to_json(&self) -> Result<String, JwsError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_body_serialization() {
        let body = SignedBody {
            header: json!({"alg": "RS256", "jwk": {"kty": "RSA"}}),
            protected: "cA".to_string(),
            payload: "cQ".to_string(),
            signature: "cg".to_string(),
        };
        let serialized = body.to_json().unwrap();
        assert!(serialized.contains(r#""header":{"alg":"RS256""#));
        assert!(serialized.contains(r#""protected":"cA""#));
        assert!(serialized.contains(r#""payload":"cQ""#));
        assert!(serialized.contains(r#""signature":"cg""#));
    }
}
