use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::error::Error;

/// 定義所有請求負載必須實作的功能。
///
/// 實作者須可序列化為 JSON 值並提供自定義的驗證邏輯。
/// `resource` 欄位不屬於負載本身，由傳輸層在送出前統一填入。
pub trait PayloadT: Serialize {
    /// 將負載轉換成 JSON 值。
    ///
    /// # 錯誤
    ///
    /// 若序列化失敗，則回傳 [`serde_json::Error`]。
    fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    /// 驗證負載資料是否符合預期的規範。
    ///
    /// # 錯誤
    ///
    /// 若驗證失敗，則回傳對應的錯誤。
    fn validate(&self) -> Result<(), Box<dyn Error>>;
}

/// 建立新帳戶所需的負載資料。
///
/// 包含聯絡資訊與目前同意的服務條款 URL；兩者皆為選填，
/// 條款 URL 缺席時表示目錄沒有公告條款。
#[derive(Debug, Serialize, Deserialize)]
pub struct NewRegistration {
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub contact: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agreement: Option<String>,
}

impl NewRegistration {
    /// 建立一個新的 `NewRegistration` 實例。
    ///
    /// `contact` 內不以 `mailto:` 開頭的項目會自動補足前綴。
    pub fn new(contact: &[String], agreement: Option<String>) -> Self {
        let contact = contact
            .iter()
            .map(|entry| {
                if entry.contains(':') {
                    entry.clone()
                } else {
                    format!("mailto:{}", entry)
                }
            })
            .collect();

        NewRegistration { contact, agreement }
    }
}

impl PayloadT for NewRegistration {
    /// 驗證新帳戶負載：聯絡項目必須帶有 URI scheme。
    fn validate(&self) -> Result<(), Box<dyn Error>> {
        for entry in &self.contact {
            if !entry.contains(':') {
                return Err(format!("Contact entry has no scheme: {}", entry).into());
            }
        }
        Ok(())
    }
}

/// 識別項，描述一個待驗證的 DNS 名稱。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identifier {
    #[serde(rename = "type")]
    pub type_: String,
    pub value: String,
}

impl Identifier {
    /// 建立一個 DNS 類型的識別項。
    pub fn dns(name: &str) -> Self {
        Identifier {
            type_: "dns".to_string(),
            value: name.to_string(),
        }
    }
}

/// 請求新授權時所需的負載資料。
#[derive(Debug, Serialize, Deserialize)]
pub struct NewAuthorization {
    pub identifier: Identifier,
}

impl NewAuthorization {
    /// 為指定的 DNS 名稱建立授權請求負載。
    pub fn new(name: &str) -> Self {
        NewAuthorization {
            identifier: Identifier::dns(name),
        }
    }
}

impl PayloadT for NewAuthorization {
    /// 驗證授權負載：識別項類型必須為 `"dns"` 且值不得為空。
    fn validate(&self) -> Result<(), Box<dyn Error>> {
        if self.identifier.type_ != "dns" {
            return Err("Identifier type must be 'dns'".into());
        }
        if self.identifier.value.is_empty() {
            return Err("Identifier value cannot be empty".into());
        }
        Ok(())
    }
}

/// 回應挑戰時所需的負載資料，內容為 key authorization 字串。
#[derive(Debug, Serialize, Deserialize)]
pub struct ChallengeResponse {
    #[serde(rename = "keyAuthorization")]
    pub key_authorization: String,
}

impl ChallengeResponse {
    pub fn new(key_authorization: impl Into<String>) -> Self {
        ChallengeResponse {
            key_authorization: key_authorization.into(),
        }
    }
}

impl PayloadT for ChallengeResponse {
    /// 驗證挑戰回應負載：key authorization 必須是 `token.thumbprint` 形式。
    fn validate(&self) -> Result<(), Box<dyn Error>> {
        if !self.key_authorization.contains('.') {
            return Err("Key authorization must contain '.'".into());
        }
        Ok(())
    }
}

/// 送出憑證簽署請求時所需的負載資料。
///
/// `csr` 為 PKCS#10 DER 的 URL 安全 Base64 編碼（不含填充）。
#[derive(Debug, Serialize, Deserialize)]
pub struct NewCertificate {
    pub csr: String,
}

impl NewCertificate {
    /// 由 DER 編碼的 CSR 建立負載。
    pub fn new(csr_der: &[u8]) -> Self {
        NewCertificate {
            csr: crate::base64::encode_url(csr_der),
        }
    }
}

impl PayloadT for NewCertificate {
    /// 驗證憑證請求負載：CSR 不得為空。
    fn validate(&self) -> Result<(), Box<dyn Error>> {
        if self.csr.is_empty() {
            return Err("CSR cannot be empty".into());
        }
        Ok(())
    }
}
