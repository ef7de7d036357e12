use std::{fs, io, path::PathBuf, thread, time::Duration};

use log::{info, warn};
use openssl::sha::sha256;
use serde::Deserialize;
use thiserror::Error;

use crate::{
    base64,
    directory::Directory,
    payload::{ChallengeResponse, NewAuthorization, PayloadT},
    transport::{Transport, TransportError},
};

/// 與挑戰流程相關的錯誤類型。
#[derive(Debug, Error)]
pub enum ChallengeError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Unsupported challenge type: {0}")]
    UnsupportedType(String),
    #[error("No {0} challenge offered for this identifier")]
    MissingChallenge(String),
    #[error("Challenge is not pending: {0}")]
    NotPending(String),
    #[error("Challenge failed: {0}")]
    Invalid(String),
    #[error("Challenge still pending after {0} polls")]
    Timeout(u32),
    #[error("Invalid payload: {0}")]
    Payload(String),
    #[error("Challenge handler error: {0}")]
    Handler(#[from] io::Error),
}

type Result<T> = std::result::Result<T, ChallengeError>;

/// 支援的挑戰類型。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeType {
    Http01,
    Dns01,
}

impl ChallengeType {
    /// 根據字串回傳對應的挑戰類型。
    ///
    /// # 錯誤
    ///
    /// 不支援的類型回傳 [`ChallengeError::UnsupportedType`]。
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "http-01" => Ok(Self::Http01),
            "dns-01" => Ok(Self::Dns01),
            other => Err(ChallengeError::UnsupportedType(other.to_string())),
        }
    }

    /// 挑戰類型的字串表示。
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http01 => "http-01",
            Self::Dns01 => "dns-01",
        }
    }
}

/// 挑戰在伺服器端的狀態。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChallengeStatus {
    Pending,
    Processing,
    Valid,
    Invalid,
    Other(String),
}

impl ChallengeStatus {
    fn from_str(s: &str) -> Self {
        match s {
            "pending" => Self::Pending,
            "processing" => Self::Processing,
            "valid" => Self::Valid,
            "invalid" => Self::Invalid,
            other => Self::Other(other.to_string()),
        }
    }

    /// 是否仍在等待驗證（輪詢應繼續）。
    fn in_progress(&self) -> bool {
        matches!(self, Self::Pending | Self::Processing)
    }

    fn as_str(&self) -> &str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Valid => "valid",
            Self::Invalid => "invalid",
            Self::Other(s) => s,
        }
    }
}

/// 部署與清理挑戰素材的能力介面。
///
/// 對 `http-01`，selector 是原始 token，value 是 key authorization；
/// 對 `dns-01`，selector 是 `_acme-challenge.<domain>`，value 是
/// key authorization 的 SHA-256 經 URL 安全 Base64 編碼後的字串。
/// `cleanup` 額外收到挑戰的最終狀態字串。
pub trait ChallengeHandler {
    fn deploy(&self, domain: &str, selector: &str, value: &str) -> io::Result<()>;
    fn cleanup(&self, domain: &str, selector: &str, value: &str, status: &str) -> io::Result<()>;
}

/// 預設的 `http-01` 處理器：在 well-known 目錄下放置與刪除
/// token 檔案，內容為 ASCII 的 key authorization。
#[derive(Debug)]
pub struct WellKnownHandler {
    root: PathBuf,
}

impl WellKnownHandler {
    /// `root` 應指向對外可見的 `/.well-known/acme-challenge/` 目錄。
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ChallengeHandler for WellKnownHandler {
    fn deploy(&self, _domain: &str, selector: &str, value: &str) -> io::Result<()> {
        fs::create_dir_all(&self.root)?;
        fs::write(self.root.join(selector), value.as_bytes())
    }

    fn cleanup(&self, _domain: &str, selector: &str, _value: &str, _status: &str) -> io::Result<()> {
        match fs::remove_file(self.root.join(selector)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

/// 預設的 `dns-01` 處理器：印出設定 TXT 記錄的指引後即返回，
/// 實際的記錄發布交由操作者完成。
#[derive(Debug, Default)]
pub struct DnsPromptHandler;

impl ChallengeHandler for DnsPromptHandler {
    fn deploy(&self, _domain: &str, selector: &str, value: &str) -> io::Result<()> {
        println!("Create a DNS TXT record before validation continues:");
        println!("  name:  {}", selector);
        println!("  value: {}", value);
        println!("Allow time for DNS propagation before the record is queried.");
        Ok(())
    }

    fn cleanup(&self, _domain: &str, selector: &str, _value: &str, status: &str) -> io::Result<()> {
        println!(
            "Validation finished ({}); the TXT record {} can be removed.",
            status, selector
        );
        Ok(())
    }
}

/// 授權回應中的單筆挑戰。
#[derive(Debug, Deserialize)]
struct ChallengeEntry {
    #[serde(rename = "type")]
    type_: String,
    token: Option<String>,
    status: Option<String>,
    // 舊式方言的挑戰地址欄位是 `uri`，新式是 `url`
    uri: Option<String>,
    url: Option<String>,
}

impl ChallengeEntry {
    fn location(&self) -> Option<&str> {
        self.uri.as_deref().or(self.url.as_deref())
    }

    fn status(&self) -> ChallengeStatus {
        ChallengeStatus::from_str(self.status.as_deref().unwrap_or(""))
    }
}

#[derive(Debug, Deserialize)]
struct AuthorizationResponse {
    #[serde(default)]
    challenges: Vec<ChallengeEntry>,
}

#[derive(Debug, Deserialize)]
struct ChallengeUpdate {
    status: Option<String>,
    error: Option<ProblemDetail>,
}

#[derive(Debug, Deserialize)]
struct ProblemDetail {
    #[serde(default)]
    detail: String,
}

/// 逐一識別項驅動授權流程的協調器。
///
/// 狀態機：請求授權 → 若已有 valid 挑戰則直接完成（快取命中）→
/// 依設定類型挑選挑戰 → 部署 → 回應 → 輪詢至終結狀態 → 清理。
pub struct Authorizer<'a> {
    transport: &'a dyn Transport,
    new_authz_url: String,
    thumbprint: String,
    challenge_type: ChallengeType,
    handler: &'a dyn ChallengeHandler,
    poll_interval: Duration,
    poll_limit: Option<u32>,
}

impl<'a> Authorizer<'a> {
    pub fn new(
        transport: &'a dyn Transport,
        directory: &Directory,
        thumbprint: impl Into<String>,
        challenge_type: ChallengeType,
        handler: &'a dyn ChallengeHandler,
    ) -> Self {
        Self {
            transport,
            new_authz_url: directory.new_authz.clone(),
            thumbprint: thumbprint.into(),
            challenge_type,
            handler,
            poll_interval: Duration::from_secs(1),
            poll_limit: None,
        }
    }

    /// 調整輪詢間隔（預設 1 秒）。
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// 設定輪詢次數上限；`None` 表示不設限，
    /// 由伺服器的終結狀態決定結束。
    pub fn poll_limit(mut self, limit: Option<u32>) -> Self {
        self.poll_limit = limit;
        self
    }

    /// 計算指定 token 的 key authorization：`token.thumbprint`。
    pub fn key_authorization(&self, token: &str) -> String {
        format!("{}.{}", token, self.thumbprint)
    }

    /// 為單一 DNS 名稱完成授權。
    pub fn authorize(&self, domain: &str) -> Result<()> {
        let payload = NewAuthorization::new(domain);
        payload
            .validate()
            .map_err(|e| ChallengeError::Payload(e.to_string()))?;

        let response =
            self.transport
                .signed(&self.new_authz_url, "new-authz", payload.to_value()?)?;
        let authorization: AuthorizationResponse = serde_json::from_value(response)?;

        // 任一挑戰已是 valid 即為快取的授權，不需要任何部署動作
        if authorization
            .challenges
            .iter()
            .any(|c| c.status() == ChallengeStatus::Valid)
        {
            info!("authorization for {} already valid, skipping challenge", domain);
            return Ok(());
        }

        let picked = authorization
            .challenges
            .iter()
            .find(|c| c.type_ == self.challenge_type.as_str())
            .ok_or_else(|| {
                ChallengeError::MissingChallenge(self.challenge_type.as_str().to_string())
            })?;

        let status = picked.status();
        if status != ChallengeStatus::Pending {
            return Err(ChallengeError::NotPending(status.as_str().to_string()));
        }

        let token = picked
            .token
            .clone()
            .ok_or_else(|| ChallengeError::Payload("challenge has no token".to_string()))?;
        let challenge_url = picked
            .location()
            .ok_or_else(|| ChallengeError::Payload("challenge has no address".to_string()))?
            .to_string();

        let key_authorization = self.key_authorization(&token);
        let (selector, value) = match self.challenge_type {
            ChallengeType::Http01 => (token.clone(), key_authorization.clone()),
            ChallengeType::Dns01 => (
                format!("_acme-challenge.{}", domain),
                dns_txt_value(&key_authorization),
            ),
        };

        self.handler.deploy(domain, &selector, &value)?;
        info!("challenge material for {} deployed ({})", domain, selector);

        let outcome = self.respond_and_poll(&challenge_url, &key_authorization);

        let final_status = match &outcome {
            Ok(()) => "valid".to_string(),
            Err(ChallengeError::Invalid(_)) => "invalid".to_string(),
            Err(ChallengeError::NotPending(status)) => status.clone(),
            Err(_) => "error".to_string(),
        };
        if let Err(e) = self
            .handler
            .cleanup(domain, &selector, &value, &final_status)
        {
            warn!("challenge cleanup for {} failed: {}", domain, e);
        }

        outcome
    }

    /// 回應挑戰並輪詢至終結狀態。
    fn respond_and_poll(&self, challenge_url: &str, key_authorization: &str) -> Result<()> {
        let payload = ChallengeResponse::new(key_authorization);
        payload
            .validate()
            .map_err(|e| ChallengeError::Payload(e.to_string()))?;

        let response = self
            .transport
            .signed(challenge_url, "challenge", payload.to_value()?)?;
        let mut update: ChallengeUpdate = serde_json::from_value(response)?;
        let mut polls = 0u32;

        loop {
            let status = ChallengeStatus::from_str(update.status.as_deref().unwrap_or(""));
            match status {
                ChallengeStatus::Valid => return Ok(()),
                ChallengeStatus::Invalid => {
                    let detail = update.error.map(|e| e.detail).unwrap_or_default();
                    return Err(ChallengeError::Invalid(detail));
                }
                status if status.in_progress() => {
                    if let Some(limit) = self.poll_limit {
                        if polls >= limit {
                            return Err(ChallengeError::Timeout(polls));
                        }
                    }
                    polls += 1;
                    thread::sleep(self.poll_interval);
                    // 狀態查詢是不簽名的 GET；伺服器端狀態單調推進
                    update = serde_json::from_value(self.transport.get_json(challenge_url)?)?;
                }
                other => return Err(ChallengeError::NotPending(other.as_str().to_string())),
            }
        }
    }
}

/// 計算 `dns-01` 的 TXT 記錄值：key authorization 的 SHA-256
/// 經 URL 安全 Base64 編碼。
pub fn dns_txt_value(key_authorization: &str) -> String {
    base64::encode_url(sha256(key_authorization.as_bytes()))
}
