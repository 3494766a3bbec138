//! 请求签名与 ID 混淆。
//!
//! 这里的两个算法都是服务端协议的一部分：输出必须逐字节一致，
//! 任何大小写或数值上的偏差都会导致请求被服务端静默拒绝。

use std::fmt;

use md5::{Digest, Md5};
use serde::Serialize;
use serde::ser::SerializeMap;
use time::OffsetDateTime;

const HASH_SEED: u64 = 0x1505_1505;
const MASK_31: u64 = 0x7fff_ffff;
const MIN_ID_LEN: usize = 20;

pub fn md5_hex(s: &str) -> String {
    hex::encode(Md5::digest(s.as_bytes()))
}

/// 由原始 bookId / chapterUid 生成 URL 与请求体中使用的混淆标识（即 bookHash）。
pub fn obfuscate_id(raw: &str) -> String {
    let h = md5_hex(raw);
    let mut result = String::with_capacity(32);
    result.push_str(&h[..3]);

    let (chunks, type_flag) = if !raw.is_empty() && raw.bytes().all(|b| b.is_ascii_digit()) {
        let chunks: Vec<String> = raw
            .as_bytes()
            .chunks(9)
            .map(|chunk| {
                // 每段最多 9 位十进制数字，u64 足够
                let value = chunk
                    .iter()
                    .fold(0u64, |acc, d| acc * 10 + u64::from(d - b'0'));
                format!("{value:x}")
            })
            .collect();
        (chunks, '3')
    } else {
        let joined: String = raw.chars().map(|c| format!("{:x}", c as u32)).collect();
        (vec![joined], '4')
    };

    result.push(type_flag);
    result.push('2');
    result.push_str(&h[h.len() - 2..]);

    for (i, chunk) in chunks.iter().enumerate() {
        result.push_str(&format!("{:02x}", chunk.len()));
        result.push_str(chunk);
        if i + 1 < chunks.len() {
            result.push('g');
        }
    }

    if result.len() < MIN_ID_LEN {
        let missing = MIN_ID_LEN - result.len();
        result.push_str(&h[..missing]);
    }

    let tail = md5_hex(&result);
    result.push_str(&tail[..3]);
    result
}

/// 请求参数值。`sc`/`st` 在请求体中是数字，其余为字符串。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ParamValue {
    Text(String),
    Int(i64),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Text(s) => f.write_str(s),
            ParamValue::Int(v) => write!(f, "{v}"),
        }
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::Text(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        ParamValue::Text(value)
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        ParamValue::Int(value)
    }
}

/// 保序参数表；序列化为 JSON 对象时保持插入顺序。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignedParams {
    pairs: Vec<(String, ParamValue)>,
}

impl SignedParams {
    pub fn push(&mut self, key: &str, value: impl Into<ParamValue>) {
        self.pairs.push((key.to_string(), value.into()));
    }

    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.pairs.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn pairs(&self) -> &[(String, ParamValue)] {
        &self.pairs
    }
}

impl Serialize for SignedParams {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.pairs.len()))?;
        for (k, v) in &self.pairs {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

fn join_query<K: AsRef<str>, V: fmt::Display>(params: &[(K, V)]) -> String {
    let mut out = String::new();
    for (i, (k, v)) in params.iter().enumerate() {
        if i > 0 {
            out.push('&');
        }
        out.push_str(k.as_ref());
        out.push('=');
        out.push_str(&v.to_string());
    }
    out
}

/// 按调用方给定的键顺序拼成 `k1=v1&k2=v2`，再计算 31 位滚动哈希。
pub fn sign_request<K: AsRef<str>, V: fmt::Display>(params: &[(K, V)]) -> String {
    rolling_hash(&join_query(params))
}

fn rolling_hash(s: &str) -> String {
    let cps: Vec<u64> = s.chars().map(|c| u64::from(u32::from(c))).collect();
    let len = cps.len();
    let mut a = HASH_SEED;
    let mut b = HASH_SEED;

    let mut i = len;
    // 从最后一个字符开始两两向前，下标到 0 或 1 为止
    while i >= 2 {
        let idx = i - 1;
        a = (a ^ (cps[idx] << ((len - idx) % 30))) & MASK_31;
        b = (b ^ (cps[idx - 1] << (idx % 30))) & MASK_31;
        i -= 2;
    }

    format!("{:x}", a + b)
}

/// 章节正文请求参数（未签名部分的固定键序）。
pub fn build_chapter_request(
    book_id: &str,
    chapter_id: &str,
    session_token_a: &str,
    session_token_b: &str,
) -> SignedParams {
    let timestamp = OffsetDateTime::now_utc().unix_timestamp();
    build_chapter_request_at(
        book_id,
        chapter_id,
        session_token_a,
        session_token_b,
        timestamp,
        random_nonce(),
    )
}

pub fn build_chapter_request_at(
    book_id: &str,
    chapter_id: &str,
    session_token_a: &str,
    session_token_b: &str,
    timestamp: i64,
    nonce: u64,
) -> SignedParams {
    let mut params = SignedParams::default();
    params.push("b", obfuscate_id(book_id));
    params.push("c", obfuscate_id(chapter_id));
    params.push("ct", timestamp.to_string());
    params.push("pc", obfuscate_id(session_token_b));
    params.push("prevChapter", "false");
    params.push("ps", session_token_a);
    params.push("r", nonce.to_string());
    params.push("sc", 0i64);
    params.push("st", 0i64);

    let signature = sign_request(params.pairs());
    params.push("s", signature);
    params
}

/// `r` 字段：[0, 10000) 内随机整数的平方。
fn random_nonce() -> u64 {
    let seed = uuid::Uuid::new_v4().as_u128();
    let base = (seed % 10_000) as u64;
    base * base
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("3300107269", "0eb32540813ab9066g019237")]
    #[case("123", "2023270027b202cb962a56f")]
    #[case("822000", "c6332d305c8af0c631210b4")]
    #[case("1234567890123456789", "d7c329b0775bcd15g06bc614eg019204")]
    #[case("1700000000", "24932c107a21fe80g010f72")]
    #[case("CB_abc", "25042180c43425f616263fc5")]
    #[case("a", "0cc426102610cc175b9c64e")]
    #[case("", "d41427e00d41d8cd98f055d")]
    #[case("psvts值", "f6842720e7073767473503c435")]
    fn obfuscate_id_golden(#[case] raw: &str, #[case] expected: &str) {
        assert_eq!(obfuscate_id(raw), expected);
    }

    #[test]
    fn obfuscate_id_is_stable() {
        let first = obfuscate_id("3300107269");
        for _ in 0..5 {
            assert_eq!(obfuscate_id("3300107269"), first);
        }
    }

    #[rstest]
    #[case("", "2a0a2a0a")]
    #[case("a", "2a0a2a0a")]
    #[case("ab", "2a0a2b88")]
    #[case("abc", "2a0a2a50")]
    #[case("hello world", "2a0abc8e")]
    #[case("测试签名", "2a07f81a")]
    fn rolling_hash_golden(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(rolling_hash(input), expected);
    }

    #[test]
    fn sign_request_uses_caller_key_order() {
        let params = [("b", "1"), ("c", "2")];
        assert_eq!(sign_request(&params), "2a0a292a");
        let swapped = [("c", "2"), ("b", "1")];
        assert_ne!(sign_request(&swapped), sign_request(&params));
    }

    #[test]
    fn chapter_request_has_fixed_layout_and_signature() {
        let params =
            build_chapter_request_at("3300107269", "42", "psv-token", "1700000123", 1_700_000_000, 1_234_321);
        let keys: Vec<&str> = params.pairs().iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(
            keys,
            ["b", "c", "ct", "pc", "prevChapter", "ps", "r", "sc", "st", "s"]
        );
        assert_eq!(
            params.get("b"),
            Some(&ParamValue::Text("0eb32540813ab9066g019237".to_string()))
        );
        assert_eq!(params.get("sc"), Some(&ParamValue::Int(0)));
        assert_eq!(params.get("s"), Some(&ParamValue::Text("537dc7e8".to_string())));
    }

    #[test]
    fn signed_params_serialize_in_order_with_numeric_reserved_fields() {
        let params = build_chapter_request_at("1", "2", "a", "b", 10, 4);
        let json = serde_json::to_string(&params).unwrap();
        assert!(json.starts_with(r#"{"b":""#));
        assert!(json.contains(r#""sc":0,"st":0,"s":""#));
    }

    #[test]
    fn nonce_is_a_square_below_bound() {
        for _ in 0..20 {
            let r = random_nonce();
            let root = (r as f64).sqrt().round() as u64;
            assert_eq!(root * root, r);
            assert!(root < 10_000);
        }
    }
}
