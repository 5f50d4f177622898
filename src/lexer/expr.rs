//! Expression tokens, shared by both syntaxes.

use super::TokenKind;

#[derive(Debug)]
pub(super) enum ScanError {
    UnterminatedString(usize),
    UnexpectedChar(char, usize),
}

pub(crate) fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_'
}

pub(crate) fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Byte offset where the identifier starting at `at` ends.
pub(super) fn ident_end(src: &str, at: usize) -> usize {
    let rest = &src[at..];
    at + rest.find(|c: char| !is_ident_char(c)).unwrap_or(rest.len())
}

/// Scans the token starting at `at`, which must not be whitespace or the
/// end of input. Returns the token and the offset just past it.
pub(super) fn scan(src: &str, at: usize) -> Result<(TokenKind, usize), ScanError> {
    let rest = &src[at..];
    let Some(c) = rest.chars().next() else {
        return Err(ScanError::UnexpectedChar('\0', at));
    };

    if c == '"' || c == '\'' {
        return scan_string(src, at, c);
    }
    if c.is_ascii_digit() {
        return Ok(scan_number(src, at));
    }
    if is_ident_start(c) {
        let end = ident_end(src, at);
        return Ok((keyword_or_ident(&src[at..end]), end));
    }

    let two = match rest.get(..2) {
        Some("==") => Some(TokenKind::EqEq),
        Some("!=") => Some(TokenKind::NotEq),
        Some("<=") => Some(TokenKind::Le),
        Some(">=") => Some(TokenKind::Ge),
        Some("//") => Some(TokenKind::SlashSlash),
        _ => None,
    };
    if let Some(kind) = two {
        return Ok((kind, at + 2));
    }

    let kind = match c {
        '<' => TokenKind::Lt,
        '>' => TokenKind::Gt,
        '+' => TokenKind::Plus,
        '-' => TokenKind::Minus,
        '*' => TokenKind::Star,
        '/' => TokenKind::Slash,
        '%' => TokenKind::Percent,
        '~' => TokenKind::Tilde,
        '|' => TokenKind::Pipe,
        '.' => TokenKind::Dot,
        ',' => TokenKind::Comma,
        ':' => TokenKind::Colon,
        '=' => TokenKind::Assign,
        '(' => TokenKind::LParen,
        ')' => TokenKind::RParen,
        '[' => TokenKind::LBracket,
        ']' => TokenKind::RBracket,
        '{' => TokenKind::LBrace,
        '}' => TokenKind::RBrace,
        other => return Err(ScanError::UnexpectedChar(other, at)),
    };
    Ok((kind, at + c.len_utf8()))
}

fn keyword_or_ident(word: &str) -> TokenKind {
    match word {
        "and" => TokenKind::And,
        "or" => TokenKind::Or,
        "not" => TokenKind::Not,
        "in" => TokenKind::In,
        "is" => TokenKind::Is,
        "true" | "True" => TokenKind::True,
        "false" | "False" => TokenKind::False,
        "none" | "None" | "null" => TokenKind::None,
        _ => TokenKind::Ident(word.to_string()),
    }
}

fn scan_string(src: &str, at: usize, quote: char) -> Result<(TokenKind, usize), ScanError> {
    let mut s = String::new();
    let mut chars = src[at + 1..].char_indices();
    while let Some((i, c)) = chars.next() {
        if c == quote {
            return Ok((TokenKind::Str(s), at + 1 + i + 1));
        }
        if c == '\\' {
            match chars.next() {
                Some((_, 'n')) => s.push('\n'),
                Some((_, 't')) => s.push('\t'),
                Some((_, 'r')) => s.push('\r'),
                Some((_, '0')) => s.push('\0'),
                Some((_, esc)) => s.push(esc),
                None => break,
            }
        } else {
            s.push(c);
        }
    }
    Err(ScanError::UnterminatedString(at))
}

fn scan_number(src: &str, at: usize) -> (TokenKind, usize) {
    let bytes = src.as_bytes();
    let digits = |mut p: usize| {
        while p < bytes.len() && (bytes[p].is_ascii_digit() || bytes[p] == b'_') {
            p += 1;
        }
        p
    };

    let mut end = digits(at);
    let mut is_float = false;
    if end + 1 < bytes.len() && bytes[end] == b'.' && bytes[end + 1].is_ascii_digit() {
        is_float = true;
        end = digits(end + 1);
    }
    if end < bytes.len() && (bytes[end] == b'e' || bytes[end] == b'E') {
        let mut p = end + 1;
        if p < bytes.len() && (bytes[p] == b'+' || bytes[p] == b'-') {
            p += 1;
        }
        if p < bytes.len() && bytes[p].is_ascii_digit() {
            is_float = true;
            end = digits(p);
        }
    }

    let text: String = src[at..end].chars().filter(|c| *c != '_').collect();
    let kind = if is_float {
        TokenKind::Float(text.parse().unwrap_or(f64::NAN))
    } else {
        match text.parse::<i64>() {
            Ok(i) => TokenKind::Int(i),
            Err(_) => TokenKind::Float(text.parse().unwrap_or(f64::INFINITY)),
        }
    };
    (kind, end)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn one(src: &str) -> TokenKind {
        scan(src, 0).unwrap().0
    }

    #[test]
    fn strings_decode_escapes() {
        assert_eq!(one(r#""a\n\"b\"""#), TokenKind::Str("a\n\"b\"".into()));
        assert_eq!(one(r"'it\'s'"), TokenKind::Str("it's".into()));
        assert!(matches!(scan("'open", 0), Err(ScanError::UnterminatedString(0))));
    }

    #[test]
    fn numbers() {
        assert_eq!(one("42"), TokenKind::Int(42));
        assert_eq!(one("1_000"), TokenKind::Int(1000));
        assert_eq!(one("2.5"), TokenKind::Float(2.5));
        assert_eq!(one("1e3"), TokenKind::Float(1000.0));
        // `0.name` is an index followed by a property, not a float.
        assert_eq!(scan("0.name", 0).unwrap(), (TokenKind::Int(0), 1));
    }

    #[test]
    fn keywords_and_operators() {
        assert_eq!(one("None"), TokenKind::None);
        assert_eq!(one("null"), TokenKind::None);
        assert_eq!(one("endfor"), TokenKind::Ident("endfor".into()));
        assert_eq!(scan("//2", 0).unwrap(), (TokenKind::SlashSlash, 2));
        assert!(matches!(scan("?", 0), Err(ScanError::UnexpectedChar('?', 0))));
    }
}
