use std::error::Error;

use openssl::{hash::MessageDigest, sign::Signer};

use crate::{base64, key_pair::KeyPair};

/// 簽名操作可能遇到的錯誤類型。
#[derive(Debug)]
pub enum SignatureError {
    /// 簽名過程中發生錯誤，附帶錯誤訊息。
    SigningError(String),
    /// 帳戶金鑰不是 RSA，無法進行 RS256 簽名。
    UnsupportedAlgorithm(String),
}

impl std::fmt::Display for SignatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            SignatureError::SigningError(msg) => write!(f, "Signing error: {}", msg),
            SignatureError::UnsupportedAlgorithm(alg) => {
                write!(f, "Unsupported algorithm: {}", alg)
            }
        }
    }
}

impl Error for SignatureError {}

/// 對 JWS 簽名輸入 `protected || "." || payload` 進行 RS256 簽名。
///
/// 輸入是兩段已完成 URL 安全 Base64 編碼的字串；輸出同樣以
/// URL 安全 Base64 編碼。
///
/// # 參數
///
/// - `protected_b64`: 已編碼的保護標頭。
/// - `payload_b64`: 已編碼的請求負載。
/// - `key_pair`: 帳戶金鑰，必須是 RSA。
///
/// # 回傳
///
/// 成功時回傳簽名的 URL 安全 Base64 字串，失敗時回傳 `SignatureError`。
pub fn create_signature(
    protected_b64: &str,
    payload_b64: &str,
    key_pair: &KeyPair,
) -> Result<String, SignatureError> {
    if !matches!(key_pair.algorithm, crate::key_pair::KeyAlgorithm::Rsa(_)) {
        return Err(SignatureError::UnsupportedAlgorithm(
            key_pair.algorithm.name().to_string(),
        ));
    }

    let signing_input = format!("{}.{}", protected_b64, payload_b64);

    // RSA 金鑰的 Signer 預設即為 PKCS#1 v1.5 填充，符合 RS256
    let mut signer = Signer::new(MessageDigest::sha256(), &key_pair.pkey)
        .map_err(|e| SignatureError::SigningError(e.to_string()))?;
    signer
        .update(signing_input.as_bytes())
        .map_err(|e| SignatureError::SigningError(e.to_string()))?;
    let signature = signer
        .sign_to_vec()
        .map_err(|e| SignatureError::SigningError(e.to_string()))?;

    Ok(base64::encode_url(signature))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_pair::KeyAlgorithm;
    use openssl::{hash::MessageDigest, sign::Verifier};

    #[test]
    fn test_signature_verifies_with_public_key() {
        let key = KeyPair::generate(KeyAlgorithm::Rsa(2048)).unwrap();
        let signature_b64 = create_signature("cHJvdGVjdGVk", "cGF5bG9hZA", &key).unwrap();
        let signature = crate::base64::decode_url(&signature_b64).unwrap();

        let mut verifier = Verifier::new(MessageDigest::sha256(), &key.pkey).unwrap();
        verifier.update(b"cHJvdGVjdGVk.cGF5bG9hZA").unwrap();
        assert!(verifier.verify(&signature).unwrap());
    }

    #[test]
    fn test_non_rsa_key_rejected() {
        let key = KeyPair::generate(KeyAlgorithm::EcdsaP256).unwrap();
        assert!(matches!(
            create_signature("a", "b", &key),
            Err(SignatureError::UnsupportedAlgorithm(_))
        ));
    }
}
