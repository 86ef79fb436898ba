//! List string codec.
//!
//! A list's string form is its elements separated by whitespace, each
//! element brace-quoted or backslash-escaped as needed so that
//! `split(merge(xs)) == xs` for every sequence of strings.

use super::parse::{backslash, is_space};

/// Split a list's string form into its elements.
pub fn split(text: &str) -> Result<Vec<String>, String> {
    let bytes = text.as_bytes();
    let mut items = Vec::new();
    let mut i = 0;

    loop {
        while i < bytes.len() && is_space(bytes[i]) {
            i += 1;
        }
        if i >= bytes.len() {
            return Ok(items);
        }

        match bytes[i] {
            b'{' => {
                let start = i + 1;
                let mut depth = 1;
                i += 1;
                while i < bytes.len() && depth > 0 {
                    match bytes[i] {
                        b'\\' => i += 1,
                        b'{' => depth += 1,
                        b'}' => depth -= 1,
                        _ => {}
                    }
                    i += 1;
                }
                if depth > 0 {
                    return Err("unmatched open brace in list".into());
                }
                items.push(text[start..i - 1].to_owned());
                check_separator(text, i, "braces")?;
            }
            b'"' => {
                let mut elem = String::new();
                i += 1;
                loop {
                    match bytes.get(i) {
                        None => return Err("unmatched open quote in list".into()),
                        Some(b'"') => break,
                        Some(b'\\') => {
                            let (s, n) = backslash(&text[i..]);
                            elem.push_str(&s);
                            i += n;
                        }
                        Some(_) => {
                            let ch = next_char(text, i);
                            elem.push(ch);
                            i += ch.len_utf8();
                        }
                    }
                }
                i += 1;
                items.push(elem);
                check_separator(text, i, "quotes")?;
            }
            _ => {
                let mut elem = String::new();
                while i < bytes.len() && !is_space(bytes[i]) {
                    if bytes[i] == b'\\' {
                        let (s, n) = backslash(&text[i..]);
                        elem.push_str(&s);
                        i += n;
                    } else {
                        let ch = next_char(text, i);
                        elem.push(ch);
                        i += ch.len_utf8();
                    }
                }
                items.push(elem);
            }
        }
    }
}

fn next_char(text: &str, i: usize) -> char {
    text[i..].chars().next().unwrap_or('\0')
}

fn check_separator(text: &str, i: usize, what: &str) -> Result<(), String> {
    match text.as_bytes().get(i) {
        None => Ok(()),
        Some(&b) if is_space(b) => Ok(()),
        Some(_) => {
            let tail: String = text[i..].chars().take_while(|c| !c.is_whitespace()).collect();
            Err(format!(
                "list element in {what} followed by \"{tail}\" instead of space"
            ))
        }
    }
}

/// Join elements into a list string, quoting each as needed.
pub fn merge<I, S>(items: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out = String::new();
    for (n, item) in items.into_iter().enumerate() {
        if n > 0 {
            out.push(' ');
        }
        quote_element(item.as_ref(), n == 0, &mut out);
    }
    out
}

fn is_special(c: char) -> bool {
    matches!(
        c,
        '{' | '}' | '[' | ']' | '$' | ';' | '"' | '\\' | ' ' | '\t' | '\n' | '\r' | '\x0b' | '\x0c'
    )
}

/// Quote one element.  A leading `#` is only significant on the first
/// element, where it would otherwise read back as a comment.
pub fn quote_element(elem: &str, first: bool, out: &mut String) {
    if elem.is_empty() {
        out.push_str("{}");
        return;
    }
    let hash = first && elem.starts_with('#');
    if !hash && !elem.chars().any(is_special) {
        out.push_str(elem);
        return;
    }
    if can_brace(elem) {
        out.push('{');
        out.push_str(elem);
        out.push('}');
        return;
    }
    for (i, c) in elem.chars().enumerate() {
        match c {
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            '\x0b' => out.push_str("\\v"),
            '\x0c' => out.push_str("\\f"),
            '#' if i == 0 && hash => out.push_str("\\#"),
            c if is_special(c) => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
}

/// Braces work when they balance (skipping escaped characters the way
/// `split` does) and the element does not end in an odd backslash.
fn can_brace(elem: &str) -> bool {
    let bytes = elem.as_bytes();
    let mut depth = 0i32;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => {
                if i + 1 == bytes.len() {
                    return false;
                }
                i += 1;
            }
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            _ => {}
        }
        i += 1;
    }
    depth == 0
}

// ── Tests ─────────────────────────────────────────────────────────────────────
