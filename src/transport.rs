//! 簽名請求的傳輸層。
//!
//! 每一次簽名 POST 都會：取得全新 nonce、組裝標頭與負載、
//! 以帳戶金鑰完成 RS256 簽名後送出。伺服器回傳的問題文件
//! （problem document）會被解讀為型別化的 [`ProblemKind`]，
//! 讓上層能對特定錯誤（無效信箱、nonce 過期等）做出反應。

use std::{cell::RefCell, collections::VecDeque};

use log::debug;
use reqwest::blocking::Client;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::{
    base64,
    jwk::{Jwk, JwkError},
    jws::{JwsError, SignedBody},
    key_pair::KeyPair,
    nonce::{NonceError, NonceT},
    protection::{Protection, ProtectionError},
    signature::{create_signature, SignatureError},
};

/// 所有對外請求使用的 User-Agent 標頭值。
pub(crate) const USER_AGENT: &str = concat!("acmekeep/", env!("CARGO_PKG_VERSION"));

/// 伺服器問題文件對應的型別化錯誤種類。
///
/// 對應規則：取問題文件 `type` 欄位最後一個 `:` 之後的片段；
/// 未列舉的種類以原字串保留在 [`ProblemKind::Unknown`] 中。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProblemKind {
    InvalidEmail,
    Malformed,
    Unauthorized,
    BadNonce,
    Unknown(String),
}

impl ProblemKind {
    /// 由問題文件的 `type` 欄位解析錯誤種類。
    pub fn from_type(type_field: &str) -> Self {
        let token = type_field.rsplit(':').next().unwrap_or(type_field);
        match token {
            "invalidEmail" => Self::InvalidEmail,
            "malformed" => Self::Malformed,
            "unauthorized" => Self::Unauthorized,
            "badNonce" => Self::BadNonce,
            other => Self::Unknown(other.to_string()),
        }
    }
}

impl std::fmt::Display for ProblemKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidEmail => write!(f, "invalidEmail"),
            Self::Malformed => write!(f, "malformed"),
            Self::Unauthorized => write!(f, "unauthorized"),
            Self::BadNonce => write!(f, "badNonce"),
            Self::Unknown(token) => write!(f, "{}", token),
        }
    }
}

/// 傳輸層可能產生的錯誤。
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Nonce error: {0}")]
    Nonce(#[from] NonceError),
    #[error("Protection error: {0}")]
    Protection(#[from] ProtectionError),
    #[error("Signature error: {0}")]
    Signature(#[from] SignatureError),
    #[error("JWS error: {0}")]
    Jws(#[from] JwsError),
    #[error("JWK error: {0}")]
    Jwk(#[from] JwkError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    /// 伺服器回傳非 2xx 狀態碼與問題文件。
    #[error("Server rejected request ({status}): {kind}: {detail}")]
    Problem {
        kind: ProblemKind,
        detail: String,
        status: u16,
    },
}

impl TransportError {
    /// 若此錯誤帶有問題文件，回傳其種類。
    pub fn problem_kind(&self) -> Option<&ProblemKind> {
        match self {
            Self::Problem { kind, .. } => Some(kind),
            _ => None,
        }
    }
}

type Result<T> = std::result::Result<T, TransportError>;

/// 定義傳輸層的行為，讓上層模組能在測試中以模擬實作替換。
pub trait Transport {
    /// 送出簽名 POST，回傳 JSON 回應本體。
    ///
    /// `resource` 會被填入負載的 `resource` 欄位後才編碼簽名。
    fn signed(&self, url: &str, resource: &str, payload: Value) -> Result<Value>;

    /// 送出簽名 POST，回傳原始位元組回應本體（憑證簽發使用）。
    fn signed_raw(&self, url: &str, resource: &str, payload: Value) -> Result<Vec<u8>>;

    /// 不簽名的 GET，回傳 JSON 回應本體（輪詢挑戰狀態使用）。
    fn get_json(&self, url: &str) -> Result<Value>;

    /// 不簽名的 GET，回傳原始位元組（抓取簽發者憑證使用）。
    fn get_raw(&self, url: &str) -> Result<Vec<u8>>;
}

/// 問題文件的欄位，解析失敗的欄位以空字串代替。
#[derive(Debug, Deserialize)]
struct ProblemDocument {
    #[serde(rename = "type", default)]
    type_field: String,
    #[serde(default)]
    detail: String,
}

/// 以 `reqwest` 實作的傳輸層。
pub struct HttpTransport {
    client: Client,
    nonce: Box<dyn NonceT>,
    key: KeyPair,
    jwk: Jwk,
}

impl HttpTransport {
    /// 建立傳輸層實例。
    ///
    /// # 參數
    ///
    /// - `nonce`: nonce 來源，一般為指向目錄 URL 的 [`crate::nonce::HttpNonce`]。
    /// - `key`: 帳戶金鑰，必須是 RSA。
    pub fn new(nonce: Box<dyn NonceT>, key: KeyPair) -> Result<Self> {
        let jwk = Jwk::from_key_pair(&key)?;
        Ok(Self {
            client: Client::builder()
                .user_agent(USER_AGENT)
                .build()
                .unwrap_or_default(),
            nonce,
            key,
            jwk,
        })
    }

    /// 組裝完整的簽名本體 JSON 字串。
    fn build_body(&self, resource: &str, mut payload: Value) -> Result<String> {
        if let Some(object) = payload.as_object_mut() {
            object.insert("resource".to_string(), Value::String(resource.to_string()));
        }
        let payload_b64 = base64::encode_url(serde_json::to_string(&payload)?);

        let headers = Protection::new(self.nonce.as_ref(), self.jwk.clone()).create_headers()?;
        let signature = create_signature(&headers.protected_b64, &payload_b64, &self.key)?;

        Ok(SignedBody {
            header: headers.header,
            protected: headers.protected_b64,
            payload: payload_b64,
            signature,
        }
        .to_json()?)
    }

    /// 送出簽名 POST 並回傳成功的回應；非 2xx 時解析問題文件。
    fn post_signed(
        &self,
        url: &str,
        resource: &str,
        payload: Value,
    ) -> Result<reqwest::blocking::Response> {
        let body = self.build_body(resource, payload)?;
        debug!("POST {} (resource: {})", url, resource);

        let response = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .body(body)
            .send()?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let text = response.text()?;
        let document: ProblemDocument = serde_json::from_str(&text).unwrap_or(ProblemDocument {
            type_field: String::new(),
            detail: text,
        });
        Err(TransportError::Problem {
            kind: ProblemKind::from_type(&document.type_field),
            detail: document.detail,
            status: status.as_u16(),
        })
    }

    fn get(&self, url: &str) -> Result<reqwest::blocking::Response> {
        debug!("GET {}", url);
        let response = self.client.get(url).send()?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let text = response.text()?;
        let document: ProblemDocument = serde_json::from_str(&text).unwrap_or(ProblemDocument {
            type_field: String::new(),
            detail: text,
        });
        Err(TransportError::Problem {
            kind: ProblemKind::from_type(&document.type_field),
            detail: document.detail,
            status: status.as_u16(),
        })
    }
}

impl Transport for HttpTransport {
    fn signed(&self, url: &str, resource: &str, payload: Value) -> Result<Value> {
        Ok(self.post_signed(url, resource, payload)?.json()?)
    }

    fn signed_raw(&self, url: &str, resource: &str, payload: Value) -> Result<Vec<u8>> {
        Ok(self.post_signed(url, resource, payload)?.bytes()?.to_vec())
    }

    fn get_json(&self, url: &str) -> Result<Value> {
        Ok(self.get(url)?.json()?)
    }

    fn get_raw(&self, url: &str) -> Result<Vec<u8>> {
        Ok(self.get(url)?.bytes()?.to_vec())
    }
}

/// 模擬回應的種類。
#[derive(Debug, Clone)]
pub enum MockReply {
    Json(Value),
    Raw(Vec<u8>),
    Problem(ProblemKind, String),
}

/// 被記錄下來的一筆請求，供測試檢查互動次序與內容。
#[derive(Debug, Clone)]
pub struct MockRequest {
    pub method: &'static str,
    pub url: String,
    pub resource: Option<String>,
    pub payload: Option<Value>,
}

/// 模擬傳輸實作，依序回放預先排入的回應並記錄所有請求。
#[derive(Debug, Default)]
pub struct MockTransport {
    replies: RefCell<VecDeque<MockReply>>,
    pub requests: RefCell<Vec<MockRequest>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// 排入一筆 JSON 回應。
    pub fn push_json(&self, value: Value) {
        self.replies.borrow_mut().push_back(MockReply::Json(value));
    }

    /// 排入一筆原始位元組回應。
    pub fn push_raw(&self, bytes: Vec<u8>) {
        self.replies.borrow_mut().push_back(MockReply::Raw(bytes));
    }

    /// 排入一筆問題文件錯誤。
    pub fn push_problem(&self, kind: ProblemKind, detail: &str) {
        self.replies
            .borrow_mut()
            .push_back(MockReply::Problem(kind, detail.to_string()));
    }

    fn pop(&self, request: MockRequest) -> Result<MockReply> {
        self.requests.borrow_mut().push(request);
        self.replies.borrow_mut().pop_front().ok_or_else(|| {
            TransportError::Problem {
                kind: ProblemKind::Unknown("mockExhausted".to_string()),
                detail: "no queued reply".to_string(),
                status: 0,
            }
        })
    }

    fn expect_json(&self, reply: MockReply) -> Result<Value> {
        match reply {
            MockReply::Json(value) => Ok(value),
            MockReply::Problem(kind, detail) => Err(TransportError::Problem {
                kind,
                detail,
                status: 400,
            }),
            MockReply::Raw(_) => Err(TransportError::Problem {
                kind: ProblemKind::Unknown("mockMismatch".to_string()),
                detail: "expected JSON reply".to_string(),
                status: 0,
            }),
        }
    }

    fn expect_raw(&self, reply: MockReply) -> Result<Vec<u8>> {
        match reply {
            MockReply::Raw(bytes) => Ok(bytes),
            MockReply::Problem(kind, detail) => Err(TransportError::Problem {
                kind,
                detail,
                status: 400,
            }),
            MockReply::Json(_) => Err(TransportError::Problem {
                kind: ProblemKind::Unknown("mockMismatch".to_string()),
                detail: "expected raw reply".to_string(),
                status: 0,
            }),
        }
    }
}

impl Transport for MockTransport {
    fn signed(&self, url: &str, resource: &str, payload: Value) -> Result<Value> {
        let reply = self.pop(MockRequest {
            method: "signed",
            url: url.to_string(),
            resource: Some(resource.to_string()),
            payload: Some(payload),
        })?;
        self.expect_json(reply)
    }

    fn signed_raw(&self, url: &str, resource: &str, payload: Value) -> Result<Vec<u8>> {
        let reply = self.pop(MockRequest {
            method: "signed_raw",
            url: url.to_string(),
            resource: Some(resource.to_string()),
            payload: Some(payload),
        })?;
        self.expect_raw(reply)
    }

    fn get_json(&self, url: &str) -> Result<Value> {
        let reply = self.pop(MockRequest {
            method: "get_json",
            url: url.to_string(),
            resource: None,
            payload: None,
        })?;
        self.expect_json(reply)
    }

    fn get_raw(&self, url: &str) -> Result<Vec<u8>> {
        let reply = self.pop(MockRequest {
            method: "get_raw",
            url: url.to_string(),
            resource: None,
            payload: None,
        })?;
        self.expect_raw(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_problem_kind_from_type() {
        assert_eq!(
            ProblemKind::from_type("urn:acme:error:badNonce"),
            ProblemKind::BadNonce
        );
        assert_eq!(
            ProblemKind::from_type("urn:ietf:params:acme:error:malformed"),
            ProblemKind::Malformed
        );
        assert_eq!(
            ProblemKind::from_type("urn:acme:error:invalidEmail"),
            ProblemKind::InvalidEmail
        );
        assert_eq!(
            ProblemKind::from_type("urn:acme:error:unauthorized"),
            ProblemKind::Unauthorized
        );
        assert_eq!(
            ProblemKind::from_type("urn:acme:error:rateLimited"),
            ProblemKind::Unknown("rateLimited".to_string())
        );
        assert_eq!(
            ProblemKind::from_type("weird"),
            ProblemKind::Unknown("weird".to_string())
        );
    }

    #[test]
    fn test_mock_transport_records_requests() {
        let transport = MockTransport::new();
        transport.push_json(json!({"ok": true}));

        let reply = transport
            .signed("https://ca.example/new-reg", "new-reg", json!({"a": 1}))
            .unwrap();
        assert_eq!(reply["ok"], true);

        let requests = transport.requests.borrow();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].resource.as_deref(), Some("new-reg"));
    }

    #[test]
    fn test_mock_transport_replays_problem() {
        let transport = MockTransport::new();
        transport.push_problem(ProblemKind::BadNonce, "stale");

        let err = transport
            .signed("https://ca.example/new-reg", "new-reg", json!({}))
            .unwrap_err();
        assert_eq!(err.problem_kind(), Some(&ProblemKind::BadNonce));
    }
}
