use openssl::{
    ec::{EcGroup, EcKey},
    error::ErrorStack,
    hash::MessageDigest,
    nid::Nid,
    pkey::{Id, PKey, Private},
    rsa::Rsa,
    sha::sha256,
};
use thiserror::Error;

use crate::{
    base64,
    jwk::{Jwk, JwkError},
    pem::{self, PemError},
};

/// 金鑰相關操作的錯誤列舉。
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("OpenSSL error: {0}")]
    OpenSsl(#[from] ErrorStack),
    #[error("PEM error: {0}")]
    Pem(#[from] PemError),
    #[error("JWK error: {0}")]
    Jwk(#[from] JwkError),
    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("Invalid RSA key size: {0} (expected a multiple of 64 in 2048..=4096)")]
    InvalidKeySize(u32),
}

type Result<T> = std::result::Result<T, KeyError>;

/// 憑證與帳戶金鑰支援的演算法。
///
/// RSA 的位元數可設定，必須是 64 的倍數且落在 2048 到 4096 之間；
/// 兩條 EC 曲線的長度是固定的。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAlgorithm {
    Rsa(u32),
    EcdsaP256,
    EcdsaP384,
}

impl KeyAlgorithm {
    /// 檢查演算法參數是否合法。
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Rsa(bits) if *bits % 64 != 0 || !(2048..=4096).contains(bits) => {
                Err(KeyError::InvalidKeySize(*bits))
            }
            _ => Ok(()),
        }
    }

    /// 演算法名稱，用於記錄與比對。
    pub fn name(&self) -> &'static str {
        match self {
            Self::Rsa(_) => "RSA",
            Self::EcdsaP256 => "ECDSA-P256",
            Self::EcdsaP384 => "ECDSA-P384",
        }
    }

    /// 金鑰長度（位元）。
    pub fn bits(&self) -> u32 {
        match self {
            Self::Rsa(bits) => *bits,
            Self::EcdsaP256 => 256,
            Self::EcdsaP384 => 384,
        }
    }

    /// 由名稱與位元數還原演算法，供讀回已儲存的記錄使用。
    pub fn from_parts(name: &str, bits: u32) -> Result<Self> {
        match name {
            "RSA" => Ok(Self::Rsa(bits)),
            "ECDSA-P256" => Ok(Self::EcdsaP256),
            "ECDSA-P384" => Ok(Self::EcdsaP384),
            other => Err(KeyError::UnsupportedAlgorithm(other.to_string())),
        }
    }

    /// 此演算法簽名時使用的訊息摘要：RSA 與 P-256 用 SHA-256，
    /// P-384 用 SHA-384。
    pub fn digest(&self) -> MessageDigest {
        match self {
            Self::Rsa(_) | Self::EcdsaP256 => MessageDigest::sha256(),
            Self::EcdsaP384 => MessageDigest::sha384(),
        }
    }
}

/// 表示一組非對稱金鑰對，內部以 OpenSSL 的 `PKey` 封裝。
#[derive(Debug, Clone)]
pub struct KeyPair {
    /// 金鑰演算法與長度。
    pub algorithm: KeyAlgorithm,
    /// 私鑰（公鑰可由其派生）。
    pub pkey: PKey<Private>,
}

impl KeyPair {
    /// 依指定演算法產生一組新的金鑰對。
    ///
    /// # 錯誤
    ///
    /// RSA 位元數不合法時回傳 [`KeyError::InvalidKeySize`]。
    pub fn generate(algorithm: KeyAlgorithm) -> Result<Self> {
        algorithm.validate()?;
        let pkey = match algorithm {
            KeyAlgorithm::Rsa(bits) => {
                let rsa = Rsa::generate(bits)?;
                PKey::from_rsa(rsa)?
            }
            KeyAlgorithm::EcdsaP256 => {
                let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
                PKey::from_ec_key(EcKey::generate(&group)?)?
            }
            KeyAlgorithm::EcdsaP384 => {
                let group = EcGroup::from_curve_name(Nid::SECP384R1)?;
                PKey::from_ec_key(EcKey::generate(&group)?)?
            }
        };
        Ok(Self { algorithm, pkey })
    }

    /// 由 PEM 格式的私鑰資料還原金鑰對，演算法從金鑰內容判讀。
    ///
    /// # 錯誤
    ///
    /// 金鑰不是 RSA 或支援的 EC 曲線時回傳
    /// [`KeyError::UnsupportedAlgorithm`]。
    pub fn from_pem(pem_data: &[u8]) -> Result<Self> {
        let pkey = PKey::private_key_from_pem(pem_data)?;
        let algorithm = match pkey.id() {
            Id::RSA => KeyAlgorithm::Rsa(pkey.rsa()?.size() * 8),
            Id::EC => match pkey.ec_key()?.group().curve_name() {
                Some(Nid::X9_62_PRIME256V1) => KeyAlgorithm::EcdsaP256,
                Some(Nid::SECP384R1) => KeyAlgorithm::EcdsaP384,
                other => {
                    return Err(KeyError::UnsupportedAlgorithm(format!(
                        "EC curve {:?}",
                        other
                    )))
                }
            },
            other => return Err(KeyError::UnsupportedAlgorithm(format!("{:?}", other))),
        };
        Ok(Self { algorithm, pkey })
    }

    /// 將私鑰匯出為 PEM 文字：RSA 輸出 PKCS#1，EC 輸出 RFC 5915。
    pub fn to_pem(&self) -> Result<String> {
        match self.algorithm {
            KeyAlgorithm::Rsa(_) => Ok(pem::rsa_private_key(self.pkey.rsa()?.as_ref())?),
            KeyAlgorithm::EcdsaP256 | KeyAlgorithm::EcdsaP384 => {
                Ok(pem::ec_private_key(self.pkey.ec_key()?.as_ref())?)
            }
        }
    }

    /// 取出 RSA 公鑰的 (n, e) 參數，供 JWK 序列化使用。
    ///
    /// # 錯誤
    ///
    /// 非 RSA 金鑰回傳 [`KeyError::UnsupportedAlgorithm`]。
    pub fn rsa_public_components(&self) -> Result<(Vec<u8>, Vec<u8>)> {
        if !matches!(self.algorithm, KeyAlgorithm::Rsa(_)) {
            return Err(KeyError::UnsupportedAlgorithm(
                self.algorithm.name().to_string(),
            ));
        }
        let rsa = self.pkey.rsa()?;
        Ok((rsa.n().to_vec(), rsa.e().to_vec()))
    }

    /// 計算金鑰的 JWK thumbprint。
    ///
    /// 對 JWK 的標準 JSON 表示取 SHA-256，再以 URL 安全 Base64 輸出。
    /// 同一把金鑰在任何一次執行中都會得到相同的結果。
    pub fn thumbprint(&self) -> Result<String> {
        let jwk = Jwk::from_key_pair(self)?;
        let hash = sha256(jwk.canonical_json().as_bytes());
        Ok(base64::encode_url(hash))
    }
}
