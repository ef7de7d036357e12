//! 憑證生命週期管理。
//!
//! 對每一個憑證請求判定三種處置：沿用既有憑證（reuse）、以原金鑰
//! 續簽（renew）、或連同金鑰一併重發（reissue）。先前的憑證以
//! friendly name 在金鑰庫中定位；新簽發的憑證連同金鑰綁定一起
//! 裝回同一個位置，讓綁定該名稱的服務無須重新設定。

use chrono::{Duration, Utc};
use log::info;
use thiserror::Error;

use crate::{
    base64,
    certificate::{Certificate, CertificateError},
    challenge::{Authorizer, ChallengeError},
    csr::{CsrBuilder, CsrError},
    directory::Directory,
    key_pair::{KeyAlgorithm, KeyError},
    keystore::{CertStore, CertificateRecord, KeyStore, KeystoreError, StoreContext},
    payload::{NewCertificate, PayloadT},
    storage::Storage,
    transport::{Transport, TransportError},
};

/// 生命週期操作可能發生的錯誤類型。
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("Keystore error: {0}")]
    Keystore(#[from] KeystoreError),
    #[error("Certificate error: {0}")]
    Certificate(#[from] CertificateError),
    #[error("Challenge error: {0}")]
    Challenge(#[from] ChallengeError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("CSR error: {0}")]
    Csr(#[from] CsrError),
    #[error("Key error: {0}")]
    Key(#[from] KeyError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("No prior certificate found for renewal: {0}")]
    CertNotFound(String),
    #[error("Invalid payload: {0}")]
    Payload(String),
}

type Result<T> = std::result::Result<T, LifecycleError>;

/// 重發的起因，用於診斷訊息。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReissueCause {
    NoPriorCertificate,
    NoBoundKey,
    SanMismatch,
    AlgorithmMismatch,
    KeySizeMismatch,
    Requested,
}

/// 憑證請求的處置決定。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// 既有憑證完全符合要求，不需任何網路操作。
    Reuse,
    /// 名稱與金鑰皆符合，僅效期不足，以原金鑰續簽。
    Renew,
    /// 金鑰或名稱集合已不符（或被明確要求），重新產生金鑰並簽發。
    Reissue(ReissueCause),
}

/// 生命週期管理器。
pub struct Lifecycle<'a> {
    storage: &'a dyn Storage,
    context: StoreContext,
    transport: &'a dyn Transport,
    directory: &'a Directory,
    ca_tag: String,
    algorithm: KeyAlgorithm,
    renew_days: i64,
    rotate_key: bool,
    force_reissue: bool,
    must_staple: bool,
}

impl<'a> Lifecycle<'a> {
    pub fn new(
        storage: &'a dyn Storage,
        context: StoreContext,
        transport: &'a dyn Transport,
        directory: &'a Directory,
        algorithm: KeyAlgorithm,
        renew_days: i64,
    ) -> Self {
        Self {
            storage,
            context,
            transport,
            directory,
            ca_tag: base64::encode_url(&directory.url),
            algorithm,
            renew_days,
            rotate_key: false,
            force_reissue: false,
            must_staple: false,
        }
    }

    /// 續簽時也更換私鑰。
    pub fn rotate_key(mut self, enabled: bool) -> Self {
        self.rotate_key = enabled;
        self
    }

    /// 無視既有狀態，強制重發。
    pub fn force_reissue(mut self, enabled: bool) -> Self {
        self.force_reissue = enabled;
        self
    }

    /// 新簽發的憑證是否要求 OCSP must-staple。
    pub fn must_staple(mut self, enabled: bool) -> Self {
        self.must_staple = enabled;
        self
    }

    /// 此憑證在金鑰庫中的 friendly name：`"<primary> - <CA 標記>"`。
    ///
    /// CA 標記是目錄 URL 的 URL 安全 Base64 編碼，不同 CA 簽出的
    /// 憑證因此互不干擾。
    pub fn friendly_name(&self, primary: &str) -> String {
        format!("{} - {}", primary, self.ca_tag)
    }

    /// 判定指定請求的處置方式。
    pub fn verify(&self, primary: &str, sans: &[String]) -> Result<Decision> {
        if self.force_reissue {
            return Ok(Decision::Reissue(ReissueCause::Requested));
        }

        let certs = CertStore::new(self.storage, self.context);
        let record = match certs.find_current(&self.friendly_name(primary))? {
            Some(record) => record,
            None => return Ok(Decision::Reissue(ReissueCause::NoPriorCertificate)),
        };

        let key = match certs.key_for(&record)? {
            Some(key) => key,
            None => return Ok(Decision::Reissue(ReissueCause::NoBoundKey)),
        };

        let certificate = record.certificate()?;

        let mut expected: Vec<String> = std::iter::once(primary.to_string())
            .chain(sans.iter().cloned())
            .collect();
        expected.sort();
        let mut actual = certificate.dns_names()?;
        actual.sort();
        if expected != actual {
            return Ok(Decision::Reissue(ReissueCause::SanMismatch));
        }

        if key.algorithm.name() != self.algorithm.name() {
            return Ok(Decision::Reissue(ReissueCause::AlgorithmMismatch));
        }
        if matches!(self.algorithm, KeyAlgorithm::Rsa(_))
            && key.algorithm.bits() != self.algorithm.bits()
        {
            return Ok(Decision::Reissue(ReissueCause::KeySizeMismatch));
        }

        if certificate.not_after()? <= Utc::now() + Duration::days(self.renew_days) {
            return Ok(Decision::Renew);
        }

        Ok(Decision::Reuse)
    }

    /// 走完授權、簽發並安裝憑證。
    ///
    /// 先逐一（依宣告順序）為主名稱與每個 SAN 完成授權，再依處置
    /// 決定金鑰與請求內容，最後把簽回的憑證與金鑰綁定裝入金鑰庫。
    pub fn sign(
        &self,
        authorizer: &Authorizer,
        primary: &str,
        sans: &[String],
        decision: Decision,
    ) -> Result<CertificateRecord> {
        let friendly = self.friendly_name(primary);
        let certs = CertStore::new(self.storage, self.context);

        if decision == Decision::Reuse {
            return certs
                .find_current(&friendly)?
                .ok_or(LifecycleError::CertNotFound(friendly));
        }

        authorizer.authorize(primary)?;
        for san in sans {
            authorizer.authorize(san)?;
        }

        let keys = KeyStore::new(self.storage, self.context);
        let (key, key_name, builder) = match decision {
            Decision::Renew if !self.rotate_key => {
                let record = certs
                    .find_current(&friendly)?
                    .ok_or_else(|| LifecycleError::CertNotFound(friendly.clone()))?;
                let key = certs
                    .key_for(&record)?
                    .ok_or_else(|| LifecycleError::CertNotFound(record.key_name.clone()))?;

                // 續簽請求沿襲既有憑證的主體、名稱集合與擴展
                let prior = record.certificate()?;
                let cn = prior
                    .subject_common_name()?
                    .unwrap_or_else(|| primary.to_string());
                let extra: Vec<String> = prior
                    .dns_names()?
                    .into_iter()
                    .filter(|name| *name != cn)
                    .collect();
                let builder = CsrBuilder::new(cn)
                    .sans(extra)
                    .must_staple(prior.has_must_staple()?);
                (key, record.key_name.clone(), builder)
            }
            _ => {
                // 重發與金鑰輪換一律產生全新金鑰，既有的具名金鑰被覆蓋
                let key = keys.create(&friendly, self.algorithm)?;
                let builder = CsrBuilder::new(primary)
                    .sans(sans.iter().cloned())
                    .must_staple(self.must_staple);
                (key, friendly.clone(), builder)
            }
        };

        let csr_der = builder.build(&key)?;
        let payload = NewCertificate::new(&csr_der);
        payload
            .validate()
            .map_err(|e| LifecycleError::Payload(e.to_string()))?;

        let response =
            self.transport
                .signed_raw(&self.directory.new_order, "new-cert", payload.to_value()?)?;
        let certificate = Certificate::from_der(response)?;

        let record = certs.install(&certificate, &friendly, &key_name, &key)?;
        info!(
            "certificate for {} installed as {} (expires {})",
            primary,
            friendly,
            certificate.not_after()?
        );
        Ok(record)
    }
}
