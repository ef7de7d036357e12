use chrono::{DateTime, Utc};
use openssl::{sha::sha256, x509::X509};
use thiserror::Error;
use x509_parser::prelude::*;

use crate::{
    key_pair::KeyPair,
    pem,
    transport::Transport,
};

/// 憑證相關操作可能出現的錯誤類型。
#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("Failed to parse certificate: {0}")]
    Parse(String),
    #[error("OpenSSL error: {0}")]
    OpenSsl(#[from] openssl::error::ErrorStack),
    #[error("Invalid validity timestamp")]
    InvalidTimestamp,
    #[error("Issuer certificate unreachable: {0}")]
    IssuerUnreachable(String),
}

type Result<T> = std::result::Result<T, CertificateError>;

// 沿 AIA 鏈向上抓取簽發者憑證的層數上限
const MAX_CHAIN_DEPTH: usize = 4;

/// X.509 憑證封裝，以 DER 位元組為正本，
/// 查詢時即時解析所需欄位。
#[derive(Debug, Clone)]
pub struct Certificate {
    der: Vec<u8>,
}

impl Certificate {
    /// 由 DER 位元組建立憑證，建立時即驗證可解析。
    pub fn from_der(der: Vec<u8>) -> Result<Self> {
        X509Certificate::from_der(&der).map_err(|e| CertificateError::Parse(e.to_string()))?;
        Ok(Certificate { der })
    }

    /// 由 PEM 文字建立憑證。
    pub fn from_pem(pem_text: &str) -> Result<Self> {
        let cert = X509::from_pem(pem_text.as_bytes())?;
        Self::from_der(cert.to_der()?)
    }

    /// 憑證的 DER 位元組。
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// 憑證的 PEM 表示。
    pub fn to_pem(&self) -> String {
        pem::certificate(&self.der)
    }

    /// 憑證 DER 的 SHA-256 縮影，小寫十六進位字串。
    ///
    /// 用於在同一 friendly name 下區分不同版本的憑證，
    /// 也是排序時的決定性次要鍵。
    pub fn thumbprint(&self) -> String {
        hex(&sha256(&self.der))
    }

    fn parse(&self) -> Result<X509Certificate<'_>> {
        let (_, cert) = X509Certificate::from_der(&self.der)
            .map_err(|e| CertificateError::Parse(e.to_string()))?;
        Ok(cert)
    }

    /// 憑證的到期時間。
    pub fn not_after(&self) -> Result<DateTime<Utc>> {
        let timestamp = self.parse()?.validity().not_after.timestamp();
        DateTime::from_timestamp(timestamp, 0).ok_or(CertificateError::InvalidTimestamp)
    }

    /// 主體的 Common Name。
    pub fn subject_common_name(&self) -> Result<Option<String>> {
        Ok(self
            .parse()?
            .subject()
            .iter_common_name()
            .next()
            .and_then(|attr| attr.as_str().ok())
            .map(str::to_string))
    }

    /// SubjectAltName 擴展中的所有 DNS 名稱。
    pub fn dns_names(&self) -> Result<Vec<String>> {
        let cert = self.parse()?;
        let san = cert
            .subject_alternative_name()
            .map_err(|e| CertificateError::Parse(e.to_string()))?;

        let mut names = Vec::new();
        if let Some(extension) = san {
            for name in &extension.value.general_names {
                if let GeneralName::DNSName(dns) = name {
                    names.push(dns.to_string());
                }
            }
        }
        Ok(names)
    }

    /// 憑證是否帶有 OCSP must-staple（TLS feature）擴展。
    pub fn has_must_staple(&self) -> Result<bool> {
        Ok(self
            .parse()?
            .extensions()
            .iter()
            .any(|ext| ext.oid.to_id_string() == "1.3.6.1.5.5.7.1.24"))
    }

    /// 從 Authority Information Access 擴展取出 CA Issuers 條目的 URL。
    pub fn ca_issuers_url(&self) -> Result<Option<String>> {
        let cert = self.parse()?;
        for extension in cert.extensions() {
            if let ParsedExtension::AuthorityInfoAccess(aia) = extension.parsed_extension() {
                for desc in &aia.accessdescs {
                    if desc.access_method.to_id_string() == "1.3.6.1.5.5.7.48.2" {
                        if let GeneralName::URI(uri) = &desc.access_location {
                            return Ok(Some(uri.to_string()));
                        }
                    }
                }
            }
        }
        Ok(None)
    }

    /// 憑證的公鑰是否與給定金鑰對相符。
    pub fn public_key_matches(&self, key: &KeyPair) -> Result<bool> {
        let cert = X509::from_der(&self.der)?;
        Ok(cert.public_key()?.public_eq(&key.pkey))
    }
}

/// 沿著 AIA 的 CA Issuers 條目向上抓取簽發者鏈。
///
/// 回傳由近到遠的簽發者憑證，不含葉憑證本身；葉憑證沒有
/// AIA 條目時回傳空向量。
///
/// # 錯誤
///
/// 抓取失敗時回傳 [`CertificateError::IssuerUnreachable`]。
pub fn fetch_issuer_chain(transport: &dyn Transport, leaf: &Certificate) -> Result<Vec<Certificate>> {
    let mut chain = Vec::new();
    let mut current = leaf.clone();

    for _ in 0..MAX_CHAIN_DEPTH {
        let url = match current.ca_issuers_url()? {
            Some(url) => url,
            None => break,
        };
        let der = transport
            .get_raw(&url)
            .map_err(|e| CertificateError::IssuerUnreachable(format!("{}: {}", url, e)))?;
        let issuer = Certificate::from_der(der)?;
        chain.push(issuer.clone());
        current = issuer;
    }

    Ok(chain)
}

/// 小寫十六進位編碼。
fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}


#[cfg(test)]
mod tests {
    use super::{test_support::TestCert, *};
    use crate::{
        key_pair::{KeyAlgorithm, KeyPair},
        transport::MockTransport,
    };
    use chrono::Utc;

    fn test_key() -> KeyPair {
        KeyPair::generate(KeyAlgorithm::Rsa(2048)).unwrap()
    }

    #[test]
    fn test_parse_round_trip_and_names() {
        let key = test_key();
        let mut profile = TestCert::new("example.com");
        profile.sans = vec!["example.com", "www.example.com"];
        let cert = Certificate::from_der(profile.build(&key)).unwrap();

        assert_eq!(
            cert.subject_common_name().unwrap().as_deref(),
            Some("example.com")
        );
        assert_eq!(
            cert.dns_names().unwrap(),
            vec!["example.com".to_string(), "www.example.com".to_string()]
        );
        assert!(cert.public_key_matches(&key).unwrap());

        let restored = Certificate::from_pem(&cert.to_pem()).unwrap();
        assert_eq!(restored.thumbprint(), cert.thumbprint());
    }

    #[test]
    fn test_not_after_window() {
        let key = test_key();
        let mut profile = TestCert::new("example.com");
        profile.days = 30;
        let cert = Certificate::from_der(profile.build(&key)).unwrap();

        let remaining = cert.not_after().unwrap() - Utc::now();
        assert!(remaining.num_days() >= 29 && remaining.num_days() <= 30);
    }

    #[test]
    fn test_must_staple_detection() {
        let key = test_key();
        let plain = Certificate::from_der(TestCert::new("a.example").build(&key)).unwrap();
        assert!(!plain.has_must_staple().unwrap());

        let mut profile = TestCert::new("a.example");
        profile.must_staple = true;
        let stapled = Certificate::from_der(profile.build(&key)).unwrap();
        assert!(stapled.has_must_staple().unwrap());
    }

    #[test]
    fn test_issuer_chain_fetch() {
        let issuer_key = test_key();
        let issuer_der = TestCert::new("Test CA").build(&issuer_key);

        let leaf_key = test_key();
        let mut profile = TestCert::new("example.com");
        profile.aia_url = Some("http://ca.example/issuer.der");
        let leaf = Certificate::from_der(profile.build(&leaf_key)).unwrap();

        let transport = MockTransport::new();
        transport.push_raw(issuer_der.clone());

        let chain = fetch_issuer_chain(&transport, &leaf).unwrap();
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].der(), issuer_der.as_slice());

        let requests = transport.requests.borrow();
        assert_eq!(requests[0].url, "http://ca.example/issuer.der");
    }

    #[test]
    fn test_issuer_unreachable() {
        let key = test_key();
        let mut profile = TestCert::new("example.com");
        profile.aia_url = Some("http://ca.example/missing.der");
        let leaf = Certificate::from_der(profile.build(&key)).unwrap();

        let transport = MockTransport::new();
        let err = fetch_issuer_chain(&transport, &leaf).unwrap_err();
        assert!(matches!(err, CertificateError::IssuerUnreachable(_)));
    }

    #[test]
    fn test_no_aia_means_empty_chain() {
        let key = test_key();
        let leaf = Certificate::from_der(TestCert::new("example.com").build(&key)).unwrap();
        let transport = MockTransport::new();
        assert!(fetch_issuer_chain(&transport, &leaf).unwrap().is_empty());
    }
}
