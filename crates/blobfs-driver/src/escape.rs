//! Reversible escaping of keys and metadata.
//!
//! Characters a backend can't store are replaced by `__0x<hex>__` tokens.
//! A literal `__0x` in the input has its first `_` escaped too, so
//! [`hex_unescape`] never decodes text that wasn't produced by
//! [`hex_escape`] and the round trip is lossless for every string.

use std::borrow::Cow;
use std::fmt::Write;

const TOKEN_START: &str = "__0x";
const TOKEN_END: &str = "__";

/// Replace every char for which `should_escape(chars, i)` holds with a
/// `__0x<hex>__` token.
pub fn hex_escape<F>(s: &str, should_escape: F) -> Cow<'_, str>
where
    F: Fn(&[char], usize) -> bool,
{
    let chars: Vec<char> = s.chars().collect();
    let mut out: Option<String> = None;

    for i in 0..chars.len() {
        if should_escape(&chars, i) || starts_token(&chars, i) {
            let out = out.get_or_insert_with(|| chars[..i].iter().collect());
            let _ = write!(out, "{}{:x}{}", TOKEN_START, chars[i] as u32, TOKEN_END);
        } else if let Some(out) = out.as_mut() {
            out.push(chars[i]);
        }
    }

    match out {
        Some(out) => Cow::Owned(out),
        None => Cow::Borrowed(s),
    }
}

fn starts_token(chars: &[char], i: usize) -> bool {
    chars.len() >= i + 4 && chars[i..i + 4] == ['_', '_', '0', 'x']
}

/// Reverse [`hex_escape`]. Text that doesn't form a well-formed token
/// passes through unchanged.
pub fn hex_unescape(s: &str) -> Cow<'_, str> {
    if !s.contains(TOKEN_START) {
        return Cow::Borrowed(s);
    }

    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(pos) = rest.find(TOKEN_START) {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + TOKEN_START.len()..];
        let digits = after.bytes().take_while(u8::is_ascii_hexdigit).count();

        let decoded = if digits > 0 && after[digits..].starts_with(TOKEN_END) {
            u32::from_str_radix(&after[..digits], 16)
                .ok()
                .and_then(char::from_u32)
        } else {
            None
        };

        match decoded {
            Some(c) => {
                out.push(c);
                rest = &after[digits + TOKEN_END.len()..];
            }
            None => {
                out.push_str(TOKEN_START);
                rest = after;
            }
        }
    }
    out.push_str(rest);

    Cow::Owned(out)
}

/// True when `chars[i]` is the last `.` of a `.` or `..` path segment.
///
/// URL and filesystem path handling both resolve such segments, so the
/// drivers escape them to keep keys like `a/../b` distinct from `b`.
pub fn is_dot_segment_end(chars: &[char], i: usize) -> bool {
    if chars[i] != '.' || (i + 1 < chars.len() && chars[i + 1] != '/') {
        return false;
    }
    let start = if i > 0 && chars[i - 1] == '.' { i - 1 } else { i };
    start == 0 || chars[start - 1] == '/'
}

/// Percent-encode one path segment: unreserved characters and
/// `$&+:=@` are kept, everything else becomes `%XX` (uppercase).
pub fn path_escape(s: &str) -> Cow<'_, str> {
    fn keep(b: u8) -> bool {
        b.is_ascii_alphanumeric()
            || matches!(
                b,
                b'-' | b'_' | b'.' | b'~' | b'$' | b'&' | b'+' | b':' | b'=' | b'@'
            )
    }

    if s.bytes().all(keep) {
        return Cow::Borrowed(s);
    }

    let mut out = String::with_capacity(s.len() * 3);
    for b in s.bytes() {
        if keep(b) {
            out.push(b as char);
        } else {
            let _ = write!(out, "%{:02X}", b);
        }
    }
    Cow::Owned(out)
}

/// Percent-decode `s`, returning it unchanged when it isn't valid
/// percent-encoded UTF-8.
pub fn url_unescape(s: &str) -> Cow<'_, str> {
    match urlencoding::decode(s) {
        Ok(decoded) => decoded,
        Err(_) => Cow::Borrowed(s),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn control_chars(chars: &[char], i: usize) -> bool {
        (chars[i] as u32) < 32
    }

    #[test]
    fn test_hex_escape() {
        assert_eq!(hex_escape("plain/key.txt", control_chars), "plain/key.txt");
        assert_eq!(hex_escape("a\nb", control_chars), "a__0xa__b");
        assert_eq!(hex_escape("\u{1}", control_chars), "__0x1__");
        assert_eq!(hex_escape("a/b", |c, i| c[i] == '/'), "a__0x2f__b");
    }

    #[test]
    fn test_literal_token_is_escaped() {
        let escaped = hex_escape("__0x41__", control_chars);
        assert_eq!(escaped, "__0x5f___0x41__");
        assert_eq!(hex_unescape(&escaped), "__0x41__");
    }

    #[test]
    fn test_hex_unescape_passes_malformed_tokens() {
        for s in [
            "__0x",
            "__0x__",
            "__0xzz__",
            "__0x41_",
            "__0x41",
            "_0x41__",
            "__0xffffffffff__",
            "__0xd800__",
            "a__0x2f",
        ] {
            assert_eq!(hex_unescape(s), s, "{s}");
        }
        assert_eq!(hex_unescape("x__0x__0x41__"), "x__0xA");
        assert_eq!(hex_unescape("__0x1F600__"), "😀");
    }

    #[test]
    fn test_dot_segments() {
        let check = |s: &str| -> Vec<usize> {
            let chars: Vec<char> = s.chars().collect();
            (0..chars.len()).filter(|&i| is_dot_segment_end(&chars, i)).collect()
        };
        assert_eq!(check("."), vec![0]);
        assert_eq!(check(".."), vec![1]);
        assert_eq!(check("a/./b"), vec![2]);
        assert_eq!(check("a/../b"), vec![3]);
        assert_eq!(check("a/.."), vec![3]);
        assert!(check("...").is_empty());
        assert!(check(".hidden").is_empty());
        assert!(check("a./b").is_empty());
        assert!(check("file.txt").is_empty());
    }

    #[test]
    fn test_path_escape() {
        assert_eq!(path_escape("Key-1_a.b~"), "Key-1_a.b~");
        assert_eq!(path_escape("a b/c"), "a%20b%2Fc");
        assert_eq!(path_escape("user@host:1=x&y+z$"), "user@host:1=x&y+z$");
        assert_eq!(path_escape("ü"), "%C3%BC");
        assert_eq!(url_unescape("a%20b%2Fc"), "a b/c");
        assert_eq!(url_unescape("100%"), "100%");
        assert_eq!(url_unescape("%ff"), "%ff");
    }

    proptest! {
        #[test]
        fn prop_hex_escape_round_trip(s in r"\PC*|[_0x/.a-f\x00-\x1f]*") {
            let escaped = hex_escape(&s, |chars, i| control_chars(chars, i) || chars[i] == '/');
            let unescaped = hex_unescape(&escaped);
            prop_assert_eq!(unescaped.as_ref(), s.as_str());
        }

        #[test]
        fn prop_path_escape_round_trip(s in r"\PC*") {
            let escaped = path_escape(&s);
            let unescaped = url_unescape(&escaped);
            prop_assert_eq!(unescaped.as_ref(), s.as_str());
        }
    }
}
