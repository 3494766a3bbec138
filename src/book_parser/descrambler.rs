//! 章节正文解扰。
//!
//! 服务端返回的每段正文前 32 个字符为填充；拼接后再丢弃首字符，
//! 按串尾字符推导出的下标表做若干次两两交换，得到 base64 文本。
//! 解码后的文本中可能残留按 Latin-1 逐字节展开的 UTF-8 序列，最后一步负责修复。

use base64::Engine;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use thiserror::Error;

use crate::download::models::BookFormat;

const PART_PADDING: usize = 32;
const MAX_SWAP_ENTRIES: usize = 10;

// 补位必须完整：截断的正文要报错，不能解出半章写入磁盘
const CONTENT_B64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_padding_mode(DecodePaddingMode::RequireCanonical)
        .with_decode_allow_trailing_bits(true),
);

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("正文 base64 解码失败: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("正文分片数量不符: 期望 {expected}，实际 {actual}")]
    PartCount { expected: usize, actual: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledChapter {
    pub content: String,
    pub stylesheet: Option<String>,
}

/// 按书籍格式组装章节：epub 取第 0/1/3 段为正文、第 2 段为样式表；txt 两段拼接。
pub fn assemble<S: AsRef<str>>(
    format: BookFormat,
    raw_parts: &[S],
) -> Result<AssembledChapter, DecodeError> {
    let expected = format.part_count();
    if raw_parts.len() != expected {
        return Err(DecodeError::PartCount {
            expected,
            actual: raw_parts.len(),
        });
    }

    match format {
        BookFormat::Epub => {
            let content = descramble(&[
                raw_parts[0].as_ref(),
                raw_parts[1].as_ref(),
                raw_parts[3].as_ref(),
            ])?;
            let stylesheet = descramble(&[raw_parts[2].as_ref()])?;
            Ok(AssembledChapter {
                content,
                stylesheet: Some(stylesheet),
            })
        }
        BookFormat::Txt => Ok(AssembledChapter {
            content: descramble(raw_parts)?,
            stylesheet: None,
        }),
    }
}

pub fn descramble<S: AsRef<str>>(parts: &[S]) -> Result<String, DecodeError> {
    let mut chars: Vec<char> = parts
        .iter()
        .flat_map(|p| p.as_ref().chars().skip(PART_PADDING))
        .skip(1)
        .collect();

    let swaps = swap_table(&chars);
    apply_swaps(&mut chars, &swaps);

    let encoded: String = chars
        .into_iter()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '='))
        .collect();
    let bytes = CONTENT_B64.decode(encoded.as_bytes())?;

    Ok(repair_utf8_runs(&decode_utf8_ignoring_invalid(&bytes)))
}

fn swap_table(t: &[char]) -> Vec<usize> {
    let len = t.len();
    if len < 4 {
        return Vec::new();
    }
    if len < 11 {
        return vec![0, 2];
    }

    let n = len.div_ceil(10).min(4);
    let mut digits = String::new();
    for c in t[len - n..].iter().rev() {
        digits.push_str(&binary_as_base4(*c as u32).to_string());
    }

    let m = (len - n - 2) as u128;
    let step = m.to_string().len();
    let mut arr = Vec::with_capacity(MAX_SWAP_ENTRIES);
    let mut i = 0;
    while arr.len() < MAX_SWAP_ENTRIES && i + step < digits.len() {
        let end = (i + 1 + step).min(digits.len());
        arr.push(window_mod(&digits[i..i + step], m));
        arr.push(window_mod(&digits[i + 1..end], m));
        i += step;
    }
    arr
}

/// 把码点的二进制表示当作四进制数读取。
fn binary_as_base4(cp: u32) -> u64 {
    (0..32)
        .rev()
        .skip_while(|bit| cp >> bit == 0)
        .fold(0u64, |acc, bit| acc * 4 + u64::from((cp >> bit) & 1))
}

fn window_mod(window: &str, m: u128) -> usize {
    // 窗口内全部为十进制数字
    let value = window
        .bytes()
        .fold(0u128, |acc, d| acc * 10 + u128::from(d - b'0'));
    (value % m) as usize
}

fn apply_swaps(chars: &mut [char], arr: &[usize]) {
    for pair in arr.chunks_exact(2).rev() {
        for k in [1, 0] {
            chars.swap(pair[1] + k, pair[0] + k);
        }
    }
}

/// UTF-8 解码，非法字节直接丢弃（不替换为 U+FFFD）。
fn decode_utf8_ignoring_invalid(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    for chunk in bytes.utf8_chunks() {
        out.push_str(chunk.valid());
    }
    out
}

fn is_continuation(c: char) -> bool {
    matches!(c as u32, 0x80..=0xBF)
}

/// 把形如 `[C0-DF][80-BF]`、`[E0-EF][80-BF]{2}`、`[F0-F7][80-BF]{3}` 的字符序列
/// 当作 UTF-8 字节重新组合。无法组成合法字符（代理区、越界）的序列保持原样。
fn repair_utf8_runs(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;

    while i < chars.len() {
        let lead = chars[i] as u32;
        let run = match lead {
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => 0,
        };

        if run > 0
            && i + run <= chars.len()
            && chars[i + 1..i + run].iter().all(|c| is_continuation(*c))
        {
            let tail = chars[i + 1..i + run]
                .iter()
                .fold(0u32, |acc, c| (acc << 6) | (*c as u32 & 0x3F));
            let cp = match run {
                2 => ((lead & 0x1F) << 6) | tail,
                3 => ((lead & 0x0F) << 12) | tail,
                _ => ((lead & 0x07) << 18) | tail,
            };
            let repaired = char::from_u32(cp).filter(|_| run != 4 || cp >= 0x1_0000);
            match repaired {
                Some(ch) => out.push(ch),
                None => out.extend(&chars[i..i + run]),
            }
            i += run;
            continue;
        }

        out.push(chars[i]);
        i += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const TXT_PARTS: [&str; 2] = [
        "0123456789abcdef0123456789abcdefXPHA+56ys5LiMK6MI5Omjjui1tzwvcD48cD5IZWx",
        "fedcba9876543210fedcba9876543210sbywg5LiW55WuAMOwwp/CmgIAIGFuZCDDpMK4wq0hPC9wPg==",
    ];

    const EPUB_PARTS: [&str; 4] = [
        "0123456789abcdef0123456789abcdefXPGg++uW6j+exPWzvaDE",
        "fedcba9876543210fedcba9876543210+CAAroKPHi8atly",
        "fedcba9876543210fedcba9876543210YcCIHWQRle5aHB7tZWk50OiAyZW07IH0=",
        "0123456789abcdef0123456789abcdefBvDwwvcD4=",
    ];

    #[test]
    fn txt_fixture_decodes_with_supplementary_repair() {
        let chapter = assemble(BookFormat::Txt, &TXT_PARTS).unwrap();
        assert_eq!(chapter.content, "<p>第一章 风起</p><p>Hello, 世界 😀 and 中!</p>");
        assert_eq!(chapter.stylesheet, None);
        // 修复后的补充平面字符在 UTF-16 中占一个代理对
        let emoji = chapter.content.chars().find(|c| *c as u32 > 0xFFFF).unwrap();
        assert_eq!(emoji.len_utf16(), 2);
    }

    #[test]
    fn epub_fixture_splits_content_and_stylesheet() {
        let chapter = assemble(BookFormat::Epub, &EPUB_PARTS).unwrap();
        assert_eq!(chapter.content, "<h1>序章</h1><p>𠀋字 ok</p>");
        assert_eq!(chapter.stylesheet.as_deref(), Some("p { text-indent: 2em; }"));
    }

    #[test]
    fn wrong_part_count_is_rejected() {
        let err = assemble(BookFormat::Epub, &TXT_PARTS).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::PartCount {
                expected: 4,
                actual: 2
            }
        ));
    }

    #[test]
    fn truncated_payload_is_a_decode_error() {
        // 只剩 5 个 base64 字符，无法组成完整字节
        let part = format!("{}X{}", "p".repeat(32), "QUJDR");
        assert!(matches!(descramble(&[part]), Err(DecodeError::Base64(_))));
    }

    #[rstest]
    #[case("QUI")]
    #[case("QUJDRA")]
    #[case("QUJDREU")]
    fn missing_padding_is_a_decode_error(#[case] payload: &str) {
        let part = format!("{}X{}", "p".repeat(32), payload);
        assert!(matches!(descramble(&[part]), Err(DecodeError::Base64(_))));
    }

    #[test]
    fn padded_short_payload_decodes() {
        // "QUI=" 经 [0, 2] 两次交换后为 "I=QU"
        let part = format!("{}X{}", "p".repeat(32), "I=QU");
        assert_eq!(descramble(&[part]).unwrap(), "AB");
    }

    #[rstest]
    #[case("abc", vec![])]
    #[case("abcdefg", vec![0, 2])]
    #[case("abcdefghijk", vec![5, 1, 1, 1, 1, 2, 2, 5, 5, 1])]
    #[case("QUJDREVGR0hJSktMTU5PUFFSU1RVVldYWVo=", vec![13, 6, 1, 15, 22, 20, 5, 24, 13, 7])]
    fn swap_table_vectors(#[case] input: &str, #[case] expected: Vec<usize>) {
        let chars: Vec<char> = input.chars().collect();
        assert_eq!(swap_table(&chars), expected);
    }

    #[test]
    fn binary_digits_read_as_base4() {
        // 'a' = 0b1100001，按四进制读为 1100001
        assert_eq!(binary_as_base4('a' as u32), 5121);
        assert_eq!(binary_as_base4(1), 1);
        assert_eq!(binary_as_base4(2), 4);
    }

    #[rstest]
    #[case("\u{C3}\u{A9}", "é")]
    #[case("\u{E4}\u{B8}\u{AD}文", "中文")]
    #[case("x\u{F0}\u{9F}\u{98}\u{80}y", "x😀y")]
    #[case("\u{C3}x", "\u{C3}x")]
    #[case("\u{ED}\u{A0}\u{80}", "\u{ED}\u{A0}\u{80}")]
    fn repair_runs(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(repair_utf8_runs(input), expected);
    }

    #[test]
    fn invalid_utf8_bytes_are_dropped() {
        assert_eq!(decode_utf8_ignoring_invalid(b"ab\xffc\xe4\xb8"), "abc");
    }
}
