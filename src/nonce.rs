use reqwest::blocking::Client;
use thiserror::Error;

/// 取得 Replay-Nonce 時可能發生的錯誤狀況。
#[derive(Error, Debug)]
pub enum NonceError {
    /// 請求過程中發生錯誤時回傳此錯誤。
    #[error("Failed to make request: {0}")]
    RequestFailed(#[from] reqwest::Error),
    /// 回應中缺少 `Replay-Nonce` 標頭時回傳此錯誤。
    #[error("No Replay-Nonce header found in response")]
    NoNonce,
    /// 標頭值無法轉換成字串時回傳此錯誤。
    #[error("Invalid header value: {0}")]
    InvalidHeaderValue(#[from] reqwest::header::ToStrError),
}

/// 定義取得 nonce 的行為。
///
/// 每一次簽名請求都會透過這個介面取得全新的 nonce，
/// 不重複使用先前回應附帶的值。
pub trait NonceT {
    /// 嘗試取得 nonce，回傳包含 nonce 字串或錯誤的 `Result`。
    fn get(&self) -> Result<String, NonceError>;
}

/// 以 HTTP HEAD 請求取得 `Replay-Nonce` 的實作。
///
/// 任何會附帶 `Replay-Nonce` 標頭的 URL 都可使用，一般設定為
/// 目錄 URL 本身。
#[derive(Debug)]
pub struct HttpNonce {
    client: Client,
    url: String,
}

impl HttpNonce {
    /// 建立一個新的 `HttpNonce` 實例，向給定的 URL 發送請求。
    pub fn new(url: impl Into<String>) -> Self {
        HttpNonce {
            client: Client::builder()
                .user_agent(crate::transport::USER_AGENT)
                .build()
                .unwrap_or_default(),
            url: url.into(),
        }
    }
}

impl NonceT for HttpNonce {
    /// 透過 HTTP HEAD 請求取得回應中的 `Replay-Nonce` 標頭。
    ///
    /// 若標頭不存在，回傳 [`NonceError::NoNonce`]。
    fn get(&self) -> Result<String, NonceError> {
        let response = self.client.head(&self.url).send()?;

        match response.headers().get("Replay-Nonce") {
            Some(nonce) => Ok(nonce.to_str()?.to_string()),
            None => Err(NonceError::NoNonce),
        }
    }
}

/// 模擬 nonce 實作，在測試中提供固定的值。
#[derive(Debug, Clone)]
pub struct MockNonce {
    value: String,
}

impl MockNonce {
    /// 建立一個新的 `MockNonce` 實例，並指定固定的 nonce 值。
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
        }
    }
}

impl NonceT for MockNonce {
    fn get(&self) -> Result<String, NonceError> {
        Ok(self.value.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_nonce() {
        let nonce = MockNonce::new("test-nonce-123");
        assert_eq!(nonce.get().unwrap(), "test-nonce-123");
    }
}
