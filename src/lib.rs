//! # ACME 憑證自動維護庫
//!
//! 本庫面向無人值守的排程執行：給定一組 DNS 名稱，透過 ACME
//! 協議向憑證機構取得並更新 X.509 伺服器憑證，金鑰材料保存在
//! 檔案型金鑰庫中。更新採「原位」方式進行：新憑證裝回同一個
//! friendly name 位置並綁定其私鑰，綁定該憑證的服務不需要重新設定。
//!
//! ## 主要模組
//!
//! - **client**: 驅動器與組態建構器，逐域名執行
//!   「檢查 → 授權 → 簽發 → 安裝」管線。
//! - **lifecycle**: 憑證生命週期判定（沿用、續簽、重發）與
//!   簽發安裝流程。
//! - **account**: 帳戶設定檔的持久化、註冊建立與更新、
//!   啟用自動修復時的自癒行為。
//! - **challenge**: 授權與挑戰狀態機，透過部署/清理回呼
//!   與外部環境互動，支援 `http-01` 與 `dns-01`。
//! - **transport** / **directory** / **nonce**: 簽名請求的傳輸、
//!   方言感知的目錄解析、Replay-Nonce 的取得。
//! - **keystore** / **storage**: 具名金鑰容器與憑證記錄，
//!   建立在可替換的儲存介面之上。
//! - **csr** / **der** / **pem** / **base64**: PKCS#10 請求建構與
//!   各式編碼基元。
//!
//! ## 使用方式
//!
//! ```no_run
//! use acmekeep::client::ClientBuilder;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = ClientBuilder::new("https://ca.example/directory")
//!         .domains(&["example.com", "www.example.com"])
//!         .contact(["ops@example.com"])
//!         .accept_terms(true)
//!         .build()?;
//!
//!     for summary in client.run()? {
//!         println!("{}: {:?}", summary.primary, summary.decision);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! 更多細節請參考各模組的文檔。

pub mod account;
pub mod base64;
pub mod certificate;
pub mod challenge;
pub mod client;
pub mod csr;
pub mod der;
pub mod directory;
pub mod jwk;
pub mod jws;
pub mod key_pair;
pub mod keystore;
pub mod lifecycle;
pub mod lock;
pub mod nonce;
pub mod payload;
pub mod pem;
pub mod protection;
pub mod signature;
pub mod storage;
pub mod transport;
