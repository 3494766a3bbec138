//! 书籍 ID/链接解析与规范化。
//!
//! 接受纯数字 ID、`CB_` 开头的导入书 ID，或带 `bookId=` 参数的链接。

use regex::Regex;
use std::sync::OnceLock;

static RE_URL: OnceLock<Regex> = OnceLock::new();
static RE_QS: OnceLock<Regex> = OnceLock::new();
static RE_PLAIN: OnceLock<Regex> = OnceLock::new();

fn re_url() -> &'static Regex {
    RE_URL.get_or_init(|| Regex::new(r"https?://\S+").expect("compile RE_URL"))
}

fn re_qs() -> &'static Regex {
    RE_QS.get_or_init(|| {
        Regex::new(r"(?i)[?&](?:book_id|bookId)=([0-9A-Za-z_]+)").expect("compile RE_QS")
    })
}

fn re_plain() -> &'static Regex {
    RE_PLAIN.get_or_init(|| Regex::new(r"^(?:[0-9]+|CB_[0-9A-Za-z]+)$").expect("compile RE_PLAIN"))
}

pub fn parse_book_id(input: &str) -> Option<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }

    if re_plain().is_match(trimmed) {
        return Some(trimmed.to_string());
    }

    // 粘贴的文本里可能夹着链接，先把链接抠出来
    let target = re_url()
        .find(trimmed)
        .map(|m| m.as_str())
        .unwrap_or(trimmed);

    re_qs()
        .captures(target)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("3300107269", Some("3300107269"))]
    #[case("  822000 \n", Some("822000"))]
    #[case("CB_3Yx4qV", Some("CB_3Yx4qV"))]
    #[case("https://weread.qq.com/web/bookDetail?bookId=3300107269", Some("3300107269"))]
    #[case("看这本 https://example.com/share?from=app&bookId=CB_12ab 不错", Some("CB_12ab"))]
    #[case("", None)]
    #[case("三体", None)]
    fn book_ids_are_normalized(#[case] input: &str, #[case] expected: Option<&str>) {
        assert_eq!(parse_book_id(input).as_deref(), expected);
    }
}
