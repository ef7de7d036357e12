//! 帳戶生命週期管理：本地設定檔、註冊建立與更新、
//! 以及啟用自動修復時的自癒行為。

use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::{
    base64,
    directory::Directory,
    payload::{NewRegistration, PayloadT},
    storage::{Storage, StorageError},
    transport::{ProblemKind, Transport, TransportError},
};

/// 帳戶操作可能發生的錯誤類型。
#[derive(Debug, Error)]
pub enum AccountError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Terms of service not accepted: {0}")]
    TermsNotAccepted(String),
    #[error("Directory has no account endpoint, cannot update registration")]
    NoAccountEndpoint,
    #[error("Local account config has no id")]
    MissingAccountId,
    #[error("Invalid payload: {0}")]
    Payload(String),
}

type Result<T> = std::result::Result<T, AccountError>;

/// 本地帳戶設定檔。
///
/// 伺服器回傳的欄位原樣保留在 `extra` 中；`agreement` 與 `contact`
/// 由客戶端強制覆寫，維持「agreement 等於目錄當前條款、contact
/// 等於使用者給定集合」的不變量。
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AccountConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contact: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agreement: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AccountConfig {
    /// 伺服器端帳戶識別碼的字串形式（數字與字串皆可能出現）。
    pub fn id_string(&self) -> Option<String> {
        match &self.id {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// 比較兩個聯絡集合是否相等（袋相等：不計順序、計入重複）。
fn contact_bag_equal(a: &[String], b: &[String]) -> bool {
    let mut left: Vec<&String> = a.iter().collect();
    let mut right: Vec<&String> = b.iter().collect();
    left.sort();
    right.sort();
    left == right
}

/// 帳戶管理器，負責設定檔的載入與持久化以及註冊的生命週期。
pub struct AccountManager<'a> {
    transport: &'a dyn Transport,
    storage: &'a dyn Storage,
    directory: &'a Directory,
    identifier: String,
    contact: Vec<String>,
    accept_terms: bool,
    auto_fix: bool,
}

impl<'a> AccountManager<'a> {
    /// 建立帳戶管理器。
    ///
    /// # 參數
    ///
    /// - `identifier`: 帳戶識別名，對應設定檔檔名。
    /// - `contact`: 使用者給定的聯絡集合（`mailto:` 前綴可省略）。
    /// - `accept_terms`: 是否同意目錄公告的服務條款。
    /// - `auto_fix`: 是否允許自癒（重試與重新註冊）。
    pub fn new(
        transport: &'a dyn Transport,
        storage: &'a dyn Storage,
        directory: &'a Directory,
        identifier: impl Into<String>,
        contact: Vec<String>,
        accept_terms: bool,
        auto_fix: bool,
    ) -> Self {
        Self {
            transport,
            storage,
            directory,
            identifier: identifier.into(),
            contact,
            accept_terms,
            auto_fix,
        }
    }

    /// 設定檔的儲存 key：`accounts/<b64u(CA-URL)>/<identifier>.json`。
    fn config_path(&self) -> String {
        format!(
            "accounts/{}/{}.json",
            base64::encode_url(&self.directory.url),
            self.identifier
        )
    }

    /// 正規化後的聯絡集合（補足 `mailto:` 前綴）。
    fn normalized_contact(&self) -> Vec<String> {
        NewRegistration::new(&self.contact, None).contact
    }

    /// 載入本地設定檔，不存在時回傳 `None`。
    pub fn load(&self) -> Result<Option<AccountConfig>> {
        match self.storage.read(&self.config_path()) {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(StorageError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn persist(&self, config: &AccountConfig) -> Result<()> {
        self.storage
            .write(&self.config_path(), serde_json::to_vec_pretty(config)?.as_slice())?;
        Ok(())
    }

    /// 確保帳戶已註冊且與目前設定一致。
    ///
    /// 流程：無本地設定（或要求重置）時建立註冊；否則檢查條款
    /// 與聯絡集合，任一過期即發出恰好一次更新請求。
    pub fn ensure(&self, reset: bool) -> Result<AccountConfig> {
        let existing = if reset { None } else { self.load()? };

        let mut config = match existing {
            None => return self.create(false),
            Some(config) => config,
        };

        let terms = self.directory.terms_of_service.clone();
        let terms_stale = terms.is_some() && config.agreement != terms;
        if terms_stale && !self.accept_terms {
            return Err(AccountError::TermsNotAccepted(terms.unwrap_or_default()));
        }

        let contact = self.normalized_contact();
        let contact_stale = !contact_bag_equal(&config.contact, &contact);

        if terms_stale || contact_stale {
            if terms_stale {
                config.agreement = terms;
            }
            config.contact = contact;
            return self.update(config, false);
        }

        Ok(config)
    }

    /// 建立新註冊並持久化回應。
    ///
    /// `agreement` 以目錄當前條款覆寫後才寫入設定檔。
    fn create(&self, contact_cleared: bool) -> Result<AccountConfig> {
        let terms = self.directory.terms_of_service.clone();
        if terms.is_some() && !self.accept_terms {
            return Err(AccountError::TermsNotAccepted(terms.unwrap_or_default()));
        }

        let contact = if contact_cleared {
            Vec::new()
        } else {
            self.normalized_contact()
        };
        let payload = NewRegistration::new(&contact, terms.clone());
        payload
            .validate()
            .map_err(|e| AccountError::Payload(e.to_string()))?;

        let result = self.transport.signed(
            &self.directory.new_account,
            "new-reg",
            payload.to_value()?,
        );

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                // 無效信箱時清空聯絡集合重試一次
                if !contact_cleared
                    && self.auto_fix
                    && e.problem_kind() == Some(&ProblemKind::InvalidEmail)
                {
                    warn!("registration rejected the contact set, retrying without contact");
                    return self.create(true);
                }
                return Err(e.into());
            }
        };

        let mut config: AccountConfig = serde_json::from_value(response)?;
        config.agreement = terms;
        config.contact = contact;
        self.persist(&config)?;
        info!("account {} registered", self.identifier);
        Ok(config)
    }

    /// 更新既有註冊並持久化回應。
    fn update(&self, mut config: AccountConfig, contact_cleared: bool) -> Result<AccountConfig> {
        let base = self
            .directory
            .account
            .as_deref()
            .ok_or(AccountError::NoAccountEndpoint)?;
        let id = config.id_string().ok_or(AccountError::MissingAccountId)?;
        let url = format!("{}{}", base, id);

        let result = self
            .transport
            .signed(&url, "reg", serde_json::to_value(&config)?);

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                // 無效信箱時清空聯絡集合重試一次
                if !contact_cleared
                    && self.auto_fix
                    && e.problem_kind() == Some(&ProblemKind::InvalidEmail)
                {
                    warn!("registration update rejected the contact set, retrying without contact");
                    config.contact = Vec::new();
                    return self.update(config, true);
                }
                // 本地狀態與伺服器端不一致時放棄舊綁定、重新註冊。
                // 這會捨棄伺服器端既有的帳戶連結，屬於已知的風險行為。
                if self.auto_fix
                    && matches!(
                        e.problem_kind(),
                        Some(&ProblemKind::Malformed) | Some(&ProblemKind::Unauthorized)
                    )
                {
                    warn!(
                        "registration update failed ({}), discarding local state and re-registering",
                        e
                    );
                    return self.create(false);
                }
                return Err(e.into());
            }
        };

        let mut updated: AccountConfig = serde_json::from_value(response)?;
        updated.agreement = config.agreement;
        updated.contact = config.contact;
        if updated.id.is_none() {
            updated.id = config.id;
        }
        self.persist(&updated)?;
        info!("account {} updated", self.identifier);
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        directory::Dialect,
        storage::MemStorage,
        transport::MockTransport,
    };
    use serde_json::json;

    const TERMS: &str = "https://x/terms/v1";

    fn directory(with_terms: bool) -> Directory {
        let mut fixture = json!({
            "new-reg": "https://x/acme/new-reg",
            "new-authz": "https://x/acme/new-authz",
            "new-cert": "https://x/acme/new-cert"
        });
        if with_terms {
            fixture["meta"] = json!({ "terms-of-service": TERMS });
        }
        Directory::from_value("https://x/directory", Dialect::Acme1Boulder, &fixture).unwrap()
    }

    fn manager<'a>(
        transport: &'a MockTransport,
        storage: &'a MemStorage,
        directory: &'a Directory,
        contact: &[&str],
        accept_terms: bool,
        auto_fix: bool,
    ) -> AccountManager<'a> {
        AccountManager::new(
            transport,
            storage,
            directory,
            "default",
            contact.iter().map(|s| s.to_string()).collect(),
            accept_terms,
            auto_fix,
        )
    }

    #[test]
    fn test_first_run_without_accepting_terms() {
        let transport = MockTransport::new();
        let storage = MemStorage::new();
        let dir = directory(true);

        let err = manager(&transport, &storage, &dir, &["a@x.example"], false, false)
            .ensure(false)
            .unwrap_err();

        assert!(matches!(err, AccountError::TermsNotAccepted(ref t) if t == TERMS));
        // 不發出任何請求，也不寫入任何設定
        assert!(transport.requests.borrow().is_empty());
        assert!(storage.list("accounts").unwrap().is_empty());
        assert!(!storage
            .exists(&format!(
                "accounts/{}/default.json",
                crate::base64::encode_url("https://x/directory")
            ))
            .unwrap());
    }

    #[test]
    fn test_first_run_creates_registration() {
        let transport = MockTransport::new();
        transport.push_json(json!({
            "id": 12345,
            "contact": ["mailto:a@x.example"],
            "agreement": TERMS,
            "createdAt": "2026-01-01T00:00:00Z"
        }));
        let storage = MemStorage::new();
        let dir = directory(true);

        let config = manager(&transport, &storage, &dir, &["a@x.example"], true, false)
            .ensure(false)
            .unwrap();

        assert_eq!(config.agreement.as_deref(), Some(TERMS));
        assert_eq!(config.contact, vec!["mailto:a@x.example".to_string()]);
        assert_eq!(config.id_string().as_deref(), Some("12345"));
        // 伺服器的其餘欄位原樣保留
        assert_eq!(config.extra["createdAt"], "2026-01-01T00:00:00Z");

        let requests = transport.requests.borrow();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].url, "https://x/acme/new-reg");
        assert_eq!(requests[0].resource.as_deref(), Some("new-reg"));
        assert_eq!(requests[0].payload.as_ref().unwrap()["agreement"], TERMS);

        // 設定檔已落地
        let path = format!(
            "accounts/{}/default.json",
            crate::base64::encode_url("https://x/directory")
        );
        let saved: AccountConfig =
            serde_json::from_slice(&storage.read(&path).unwrap()).unwrap();
        assert_eq!(saved.agreement.as_deref(), Some(TERMS));
    }

    #[test]
    fn test_unchanged_state_makes_no_requests() {
        let transport = MockTransport::new();
        transport.push_json(json!({ "id": 1, "agreement": TERMS }));
        let storage = MemStorage::new();
        let dir = directory(true);

        manager(&transport, &storage, &dir, &["a@x.example"], true, false)
            .ensure(false)
            .unwrap();
        assert_eq!(transport.requests.borrow().len(), 1);

        // 第二次執行：條款與聯絡集合皆一致，不該有任何請求
        manager(&transport, &storage, &dir, &["a@x.example"], true, false)
            .ensure(false)
            .unwrap();
        assert_eq!(transport.requests.borrow().len(), 1);
    }

    #[test]
    fn test_contact_change_issues_exactly_one_update() {
        let transport = MockTransport::new();
        transport.push_json(json!({ "id": 77, "agreement": TERMS }));
        let storage = MemStorage::new();
        let dir = directory(true);

        manager(&transport, &storage, &dir, &["a@x.example"], true, false)
            .ensure(false)
            .unwrap();

        transport.push_json(json!({ "id": 77, "agreement": TERMS }));
        let config = manager(&transport, &storage, &dir, &["b@x.example"], true, false)
            .ensure(false)
            .unwrap();

        let requests = transport.requests.borrow();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].url, "https://x/acme/reg/77");
        assert_eq!(requests[1].resource.as_deref(), Some("reg"));
        assert_eq!(config.contact, vec!["mailto:b@x.example".to_string()]);
    }

    #[test]
    fn test_contact_comparison_ignores_order() {
        let transport = MockTransport::new();
        transport.push_json(json!({ "id": 5, "agreement": TERMS }));
        let storage = MemStorage::new();
        let dir = directory(true);

        manager(
            &transport,
            &storage,
            &dir,
            &["a@x.example", "b@x.example"],
            true,
            false,
        )
        .ensure(false)
        .unwrap();

        manager(
            &transport,
            &storage,
            &dir,
            &["b@x.example", "a@x.example"],
            true,
            false,
        )
        .ensure(false)
        .unwrap();
        assert_eq!(transport.requests.borrow().len(), 1);
    }

    #[test]
    fn test_invalid_email_self_heal() {
        let transport = MockTransport::new();
        transport.push_problem(ProblemKind::InvalidEmail, "bad address");
        transport.push_json(json!({ "id": 9, "agreement": TERMS }));
        let storage = MemStorage::new();
        let dir = directory(true);

        let config = manager(&transport, &storage, &dir, &["broken"], true, true)
            .ensure(false)
            .unwrap();

        let requests = transport.requests.borrow();
        assert_eq!(requests.len(), 2);
        // 重試的註冊已清空聯絡集合
        assert!(requests[1].payload.as_ref().unwrap().get("contact").is_none());
        assert!(config.contact.is_empty());
    }

    #[test]
    fn test_invalid_email_update_self_heal() {
        let transport = MockTransport::new();
        transport.push_json(json!({ "id": 77, "agreement": TERMS }));
        let storage = MemStorage::new();
        let dir = directory(true);

        manager(&transport, &storage, &dir, &["a@x.example"], true, true)
            .ensure(false)
            .unwrap();

        // 聯絡集合變更觸發更新，更新被拒絕後清空聯絡集合重試一次
        transport.push_problem(ProblemKind::InvalidEmail, "bad address");
        transport.push_json(json!({ "id": 77, "agreement": TERMS }));

        let config = manager(&transport, &storage, &dir, &["broken"], true, true)
            .ensure(false)
            .unwrap();

        let requests = transport.requests.borrow();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[1].resource.as_deref(), Some("reg"));
        assert_eq!(requests[2].resource.as_deref(), Some("reg"));
        assert_eq!(requests[2].url, "https://x/acme/reg/77");
        // 重試的更新已清空聯絡集合
        assert!(requests[2].payload.as_ref().unwrap().get("contact").is_none());
        assert!(config.contact.is_empty());
    }

    #[test]
    fn test_invalid_email_fatal_without_auto_fix() {
        let transport = MockTransport::new();
        transport.push_problem(ProblemKind::InvalidEmail, "bad address");
        let storage = MemStorage::new();
        let dir = directory(true);

        let err = manager(&transport, &storage, &dir, &["broken"], true, false)
            .ensure(false)
            .unwrap_err();
        assert!(matches!(
            err,
            AccountError::Transport(TransportError::Problem { kind: ProblemKind::InvalidEmail, .. })
        ));
    }

    #[test]
    fn test_unauthorized_update_falls_back_to_create() {
        let transport = MockTransport::new();
        transport.push_json(json!({ "id": 3, "agreement": TERMS }));
        let storage = MemStorage::new();
        let dir = directory(true);

        manager(&transport, &storage, &dir, &["a@x.example"], true, true)
            .ensure(false)
            .unwrap();

        // 更新被拒絕後退回重新註冊
        transport.push_problem(ProblemKind::Unauthorized, "unknown registration");
        transport.push_json(json!({ "id": 4, "agreement": TERMS }));

        let config = manager(&transport, &storage, &dir, &["b@x.example"], true, true)
            .ensure(false)
            .unwrap();

        let requests = transport.requests.borrow();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[1].resource.as_deref(), Some("reg"));
        assert_eq!(requests[2].resource.as_deref(), Some("new-reg"));
        assert_eq!(config.id_string().as_deref(), Some("4"));
    }

    #[test]
    fn test_explicit_reset_recreates() {
        let transport = MockTransport::new();
        transport.push_json(json!({ "id": 1, "agreement": TERMS }));
        let storage = MemStorage::new();
        let dir = directory(true);

        manager(&transport, &storage, &dir, &["a@x.example"], true, false)
            .ensure(false)
            .unwrap();

        transport.push_json(json!({ "id": 2, "agreement": TERMS }));
        let config = manager(&transport, &storage, &dir, &["a@x.example"], true, false)
            .ensure(true)
            .unwrap();
        assert_eq!(config.id_string().as_deref(), Some("2"));

        let requests = transport.requests.borrow();
        assert_eq!(requests[1].resource.as_deref(), Some("new-reg"));
    }

    #[test]
    fn test_no_terms_directory_registers_without_agreement() {
        let transport = MockTransport::new();
        transport.push_json(json!({ "id": 8 }));
        let storage = MemStorage::new();
        let dir = directory(false);

        let config = manager(&transport, &storage, &dir, &["a@x.example"], false, false)
            .ensure(false)
            .unwrap();
        assert!(config.agreement.is_none());

        let requests = transport.requests.borrow();
        assert!(requests[0].payload.as_ref().unwrap().get("agreement").is_none());
    }
}
