//! 最小化的 DER 編碼器。
//!
//! 僅涵蓋金鑰匯出與憑證請求擴展所需的型別：INTEGER、OCTET STRING、
//! BIT STRING、SEQUENCE、OBJECT IDENTIFIER 與 context-specific 標籤。
//! 所有函式都回傳完整的 TLV（tag、length、value）位元組串，
//! 組合式型別直接串接已編碼完成的子元素。

use thiserror::Error;

/// DER 編碼過程中可能發生的錯誤情形。
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DerError {
    /// OID 字串格式不正確（少於兩個節點、含非數字、或前兩節點超出範圍）。
    #[error("Invalid object identifier: {0}")]
    InvalidOid(String),

    /// context-specific 標籤編號超過單一位元組可表示的範圍。
    #[error("Context tag out of range: {0}")]
    TagOutOfRange(u8),
}

type Result<T> = std::result::Result<T, DerError>;

/// 編碼 DER 長度欄位。
///
/// 長度小於 128 使用短格式（單一位元組）；否則使用長格式：
/// 首位元組為 `0x80 | n`，後接 n 個 big-endian 長度位元組，n 取最小值。
fn length(len: usize) -> Vec<u8> {
    if len < 128 {
        return vec![len as u8];
    }
    let mut bytes = Vec::new();
    let mut remaining = len;
    while remaining > 0 {
        bytes.push((remaining & 0xFF) as u8);
        remaining >>= 8;
    }
    bytes.reverse();
    let mut out = Vec::with_capacity(1 + bytes.len());
    out.push(0x80 | bytes.len() as u8);
    out.extend_from_slice(&bytes);
    out
}

/// 組合 tag、length 與 value 為完整的 TLV。
fn tlv(tag: u8, value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + value.len());
    out.push(tag);
    out.extend_from_slice(&length(value.len()));
    out.extend_from_slice(value);
    out
}

/// 編碼非負 INTEGER。
///
/// 輸入為無號 big-endian 數值（例如 OpenSSL `BigNum::to_vec` 的輸出）。
/// 先移除前導零位元組；全零輸入編碼為單一 `0x00`；
/// 首個有效位元組的最高位為 1 時插入一個 `0x00` 以維持正號。
/// 負數不在輸入域內，介面僅接受無號數值。
pub fn integer(magnitude: &[u8]) -> Vec<u8> {
    let mut start = 0;
    while start < magnitude.len() && magnitude[start] == 0 {
        start += 1;
    }
    let significant = &magnitude[start..];

    if significant.is_empty() {
        return tlv(0x02, &[0x00]);
    }

    if significant[0] & 0x80 != 0 {
        let mut value = Vec::with_capacity(1 + significant.len());
        value.push(0x00);
        value.extend_from_slice(significant);
        tlv(0x02, &value)
    } else {
        tlv(0x02, significant)
    }
}

/// 編碼 OCTET STRING。
pub fn octet_string(content: &[u8]) -> Vec<u8> {
    tlv(0x04, content)
}

/// 編碼 BIT STRING，前置一個值恆為 `0` 的未用位元數位元組。
pub fn bit_string(content: &[u8]) -> Vec<u8> {
    let mut value = Vec::with_capacity(1 + content.len());
    value.push(0x00);
    value.extend_from_slice(content);
    tlv(0x03, &value)
}

/// 編碼 SEQUENCE，子元素必須已是編碼完成的 TLV。
pub fn sequence(children: &[Vec<u8>]) -> Vec<u8> {
    let content: Vec<u8> = children.iter().flatten().copied().collect();
    tlv(0x30, &content)
}

/// 編碼 constructed 形式的 context-specific 標籤 `[n]`，
/// 用於 RFC 5915 金鑰結構中的 CHOICE 欄位。
pub fn context(tag: u8, content: &[u8]) -> Result<Vec<u8>> {
    if tag > 0x1E {
        return Err(DerError::TagOutOfRange(tag));
    }
    Ok(tlv(0xA0 | tag, content))
}

/// 編碼 primitive 形式的 context-specific 標籤 `[n]`，
/// 用於 GeneralName 一類 IMPLICIT 標記的基本型別。
pub fn context_implicit(tag: u8, content: &[u8]) -> Result<Vec<u8>> {
    if tag > 0x1E {
        return Err(DerError::TagOutOfRange(tag));
    }
    Ok(tlv(0x80 | tag, content))
}

/// 編碼 OBJECT IDENTIFIER，輸入為點分字串（例如 `"1.2.840.10045.3.1.7"`）。
///
/// # 錯誤
///
/// 節點少於兩個、含非數字內容、或前兩節點超出 X.690 規定範圍時
/// 回傳 [`DerError::InvalidOid`]。
pub fn oid(dotted: &str) -> Result<Vec<u8>> {
    let arcs: Vec<u64> = dotted
        .split('.')
        .map(|part| part.parse::<u64>())
        .collect::<std::result::Result<_, _>>()
        .map_err(|_| DerError::InvalidOid(dotted.to_string()))?;

    if arcs.len() < 2 || arcs[0] > 2 || (arcs[0] < 2 && arcs[1] > 39) {
        return Err(DerError::InvalidOid(dotted.to_string()));
    }

    let mut value = Vec::new();
    value.extend_from_slice(&base128(arcs[0] * 40 + arcs[1]));
    for arc in &arcs[2..] {
        value.extend_from_slice(&base128(*arc));
    }
    Ok(tlv(0x06, &value))
}

/// 以 base-128 形式編碼單一 OID 節點，僅末位元組的最高位為 0。
fn base128(mut arc: u64) -> Vec<u8> {
    let mut bytes = vec![(arc & 0x7F) as u8];
    arc >>= 7;
    while arc > 0 {
        bytes.push(0x80 | (arc & 0x7F) as u8);
        arc >>= 7;
    }
    bytes.reverse();
    bytes
}
