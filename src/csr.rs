use openssl::{
    asn1::{Asn1Object, Asn1OctetString},
    nid::Nid,
    stack::Stack,
    x509::{
        extension::{ExtendedKeyUsage, KeyUsage, SubjectAlternativeName},
        X509Extension, X509NameBuilder, X509Req,
    },
};
use thiserror::Error;

use crate::{
    der::{self, DerError},
    key_pair::KeyPair,
};

// 擴展金鑰用途以 OID 數字表示而非名稱；
// 名稱形式會隨系統地區設定變動，OID 不會。
const OID_SERVER_AUTH: &str = "1.3.6.1.5.5.7.3.1";
const OID_CLIENT_AUTH: &str = "1.3.6.1.5.5.7.3.2";
const OID_TLS_FEATURE: &str = "1.3.6.1.5.5.7.1.24";

/// 建立憑證簽署請求過程中可能發生的錯誤。
#[derive(Debug, Error)]
pub enum CsrError {
    #[error("OpenSSL error: {0}")]
    OpenSsl(#[from] openssl::error::ErrorStack),
    #[error("DER error: {0}")]
    Der(#[from] DerError),
    #[error("Primary name cannot be empty")]
    EmptyPrimary,
}

type Result<T> = std::result::Result<T, CsrError>;

/// PKCS#10 憑證簽署請求建構器。
///
/// 主體為 `CN=<primary>`；SubjectAltName 含主名稱與所有附加名稱；
/// KeyUsage（critical）固定為數位簽章加金鑰加密，ExtendedKeyUsage
/// 固定為伺服器與客戶端驗證；OCSP must-staple 為選配。
pub struct CsrBuilder {
    primary: String,
    sans: Vec<String>,
    must_staple: bool,
}

impl CsrBuilder {
    /// 以主名稱建立建構器。
    pub fn new(primary: impl Into<String>) -> Self {
        CsrBuilder {
            primary: primary.into(),
            sans: Vec::new(),
            must_staple: false,
        }
    }

    /// 附加一個 SAN 名稱。
    pub fn san(mut self, dns_name: &str) -> Self {
        self.sans.push(dns_name.to_string());
        self
    }

    /// 附加多個 SAN 名稱。
    pub fn sans<I: IntoIterator<Item = S>, S: Into<String>>(mut self, names: I) -> Self {
        self.sans.extend(names.into_iter().map(Into::into));
        self
    }

    /// 是否加入 OCSP must-staple 擴展。
    pub fn must_staple(mut self, enabled: bool) -> Self {
        self.must_staple = enabled;
        self
    }

    /// 以指定金鑰簽署並輸出 DER 編碼的請求。
    ///
    /// 摘要演算法由金鑰決定：RSA 與 P-256 用 SHA-256，P-384 用 SHA-384。
    pub fn build(&self, key: &KeyPair) -> Result<Vec<u8>> {
        if self.primary.is_empty() {
            return Err(CsrError::EmptyPrimary);
        }

        let mut req_builder = X509Req::builder()?;
        req_builder.set_version(0)?;

        let mut name = X509NameBuilder::new()?;
        name.append_entry_by_nid(Nid::COMMONNAME, &self.primary)?;
        let name = name.build();
        req_builder.set_subject_name(&name)?;

        let mut extensions = Stack::new()?;

        let mut key_usage = KeyUsage::new();
        key_usage.critical().digital_signature().key_encipherment();
        extensions.push(key_usage.build()?)?;

        let mut extended = ExtendedKeyUsage::new();
        extended.other(OID_SERVER_AUTH).other(OID_CLIENT_AUTH);
        extensions.push(extended.build()?)?;

        let mut san = SubjectAlternativeName::new();
        san.dns(&self.primary);
        for entry in &self.sans {
            san.dns(entry);
        }
        extensions.push(san.build(&req_builder.x509v3_context(None))?)?;

        if self.must_staple {
            let oid = Asn1Object::from_str(OID_TLS_FEATURE)?;
            let value = der::sequence(&[der::integer(&[0x05])]);
            let contents = Asn1OctetString::new_from_bytes(&value)?;
            extensions.push(X509Extension::new_from_der(&oid, false, &contents)?)?;
        }

        req_builder.add_extensions(&extensions)?;
        req_builder.set_pubkey(&key.pkey)?;
        req_builder.sign(&key.pkey, key.algorithm.digest())?;

        Ok(req_builder.build().to_der()?)
    }
}
