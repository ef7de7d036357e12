use serde_json::Value;
use thiserror::Error;

use crate::transport::{Transport, TransportError};

/// 處理目錄操作時可能發生的錯誤類型。
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// 目錄抓取失敗。
    #[error("Failed to fetch directory: {0}")]
    Fetch(#[from] TransportError),
    /// 目錄缺少必要欄位。
    #[error("Directory is missing field: {0}")]
    MissingField(&'static str),
}

type Result<T> = std::result::Result<T, DirectoryError>;

/// 憑證機構支援的目錄方言。
///
/// 舊式方言使用連字號欄位名（`new-reg`、`new-authz`、`new-cert`），
/// 新式方言使用駝峰欄位名（`newAccount`、`newAuthz`、`newOrder`）。
/// 實務上只有 `Acme1Boulder` 被完整驗證過，其餘兩種屬於盡力支援。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Acme1Boulder,
    Acme2Boulder,
    Acme1,
}

/// 正規化後的目錄端點集合。
///
/// 每次執行只抓取一次，之後不再變動。舊式 boulder 方言的
/// `account`、`authz`、`order` 端點由對應的 `new-` URL 合成。
#[derive(Debug, Clone)]
pub struct Directory {
    /// 目錄本身的 URL，同時是 nonce HEAD 請求的目標。
    pub url: String,
    pub new_account: String,
    pub new_authz: String,
    pub new_order: String,
    pub key_change: Option<String>,
    pub revoke_cert: Option<String>,
    pub account: Option<String>,
    pub authz: Option<String>,
    pub order: Option<String>,
    pub terms_of_service: Option<String>,
}

impl Directory {
    /// 從指定 URL 抓取目錄並依方言正規化。
    pub fn fetch(transport: &dyn Transport, url: &str, dialect: Dialect) -> Result<Self> {
        let value = transport.get_json(url)?;
        Self::from_value(url, dialect, &value)
    }

    /// 由已取得的 JSON 值建立目錄，抓取與解析分離以便測試。
    ///
    /// # 錯誤
    ///
    /// 註冊、授權或簽發端點缺席時回傳 [`DirectoryError::MissingField`]。
    pub fn from_value(url: &str, dialect: Dialect, value: &Value) -> Result<Self> {
        let field = |name: &str| value.get(name).and_then(Value::as_str).map(str::to_string);

        match dialect {
            Dialect::Acme1Boulder | Dialect::Acme1 => {
                let new_account =
                    field("new-reg").ok_or(DirectoryError::MissingField("new-reg"))?;
                let new_authz =
                    field("new-authz").ok_or(DirectoryError::MissingField("new-authz"))?;
                let new_order =
                    field("new-cert").ok_or(DirectoryError::MissingField("new-cert"))?;

                // 只有 boulder 提供可由 new- URL 推導的查詢端點
                let (account, authz, order) = if dialect == Dialect::Acme1Boulder {
                    (
                        derive_sibling(&new_account),
                        derive_sibling(&new_authz),
                        derive_sibling(&new_order),
                    )
                } else {
                    (None, None, None)
                };

                Ok(Directory {
                    url: url.to_string(),
                    new_account,
                    new_authz,
                    new_order,
                    key_change: field("key-change"),
                    revoke_cert: field("revoke-cert"),
                    account,
                    authz,
                    order,
                    terms_of_service: value
                        .get("meta")
                        .and_then(|meta| meta.get("terms-of-service"))
                        .and_then(Value::as_str)
                        .map(str::to_string),
                })
            }
            Dialect::Acme2Boulder => Ok(Directory {
                url: url.to_string(),
                new_account: field("newAccount")
                    .ok_or(DirectoryError::MissingField("newAccount"))?,
                new_authz: field("newAuthz").ok_or(DirectoryError::MissingField("newAuthz"))?,
                new_order: field("newOrder").ok_or(DirectoryError::MissingField("newOrder"))?,
                key_change: field("keyChange"),
                revoke_cert: field("revokeCert"),
                account: field("account"),
                authz: field("authz"),
                order: field("order"),
                terms_of_service: value
                    .get("meta")
                    .and_then(|meta| meta.get("termsOfService"))
                    .and_then(Value::as_str)
                    .map(str::to_string),
            }),
        }
    }
}

/// 以 `new-` URL 合成對應的查詢端點：將最後一個路徑節點去掉
/// `new-` 前綴並補上結尾斜線（`…/new-reg` 變為 `…/reg/`）。
///
/// 最後節點不以 `new-` 開頭時無從推導，回傳 `None`。
fn derive_sibling(new_url: &str) -> Option<String> {
    let (base, segment) = new_url.rsplit_once('/')?;
    let stripped = segment.strip_prefix("new-")?;
    Some(format!("{}/{}/", base, stripped))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn legacy_fixture() -> Value {
        json!({
            "new-reg": "https://x/acme/new-reg",
            "new-authz": "https://x/acme/new-authz",
            "new-cert": "https://x/acme/new-cert",
            "key-change": "https://x/acme/key-change",
            "revoke-cert": "https://x/acme/revoke-cert",
            "meta": { "terms-of-service": "https://x/terms/v1" }
        })
    }

    #[test]
    fn test_legacy_boulder_normalization() {
        let dir =
            Directory::from_value("https://x/directory", Dialect::Acme1Boulder, &legacy_fixture())
                .unwrap();

        assert_eq!(dir.new_account, "https://x/acme/new-reg");
        assert_eq!(dir.new_authz, "https://x/acme/new-authz");
        assert_eq!(dir.new_order, "https://x/acme/new-cert");
        assert_eq!(dir.account.as_deref(), Some("https://x/acme/reg/"));
        assert_eq!(dir.authz.as_deref(), Some("https://x/acme/authz/"));
        assert_eq!(dir.order.as_deref(), Some("https://x/acme/cert/"));
        assert_eq!(dir.terms_of_service.as_deref(), Some("https://x/terms/v1"));
        assert_eq!(dir.key_change.as_deref(), Some("https://x/acme/key-change"));
    }

    #[test]
    fn test_plain_acme1_does_not_synthesize() {
        let dir =
            Directory::from_value("https://x/directory", Dialect::Acme1, &legacy_fixture()).unwrap();
        assert!(dir.account.is_none());
        assert!(dir.authz.is_none());
        assert!(dir.order.is_none());
    }

    #[test]
    fn test_modern_fields_copied_verbatim() {
        let fixture = json!({
            "newAccount": "https://x/acme/new-acct",
            "newNonce": "https://x/acme/new-nonce",
            "newAuthz": "https://x/acme/new-authz",
            "newOrder": "https://x/acme/new-order",
            "keyChange": "https://x/acme/key-change",
            "revokeCert": "https://x/acme/revoke-cert",
            "meta": { "termsOfService": "https://x/terms/v2" }
        });
        let dir =
            Directory::from_value("https://x/directory", Dialect::Acme2Boulder, &fixture).unwrap();

        assert_eq!(dir.new_account, "https://x/acme/new-acct");
        assert_eq!(dir.new_order, "https://x/acme/new-order");
        assert_eq!(dir.terms_of_service.as_deref(), Some("https://x/terms/v2"));
        assert!(dir.account.is_none());
    }

    #[test]
    fn test_missing_endpoint_rejected() {
        let fixture = json!({ "new-reg": "https://x/acme/new-reg" });
        assert!(matches!(
            Directory::from_value("https://x/directory", Dialect::Acme1Boulder, &fixture),
            Err(DirectoryError::MissingField("new-authz"))
        ));
    }

    #[test]
    fn test_derive_sibling_requires_new_prefix() {
        assert_eq!(derive_sibling("https://x/acme/reg"), None);
        assert_eq!(
            derive_sibling("https://x/acme/new-cert").as_deref(),
            Some("https://x/acme/cert/")
        );
    }
}
