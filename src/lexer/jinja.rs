//! `{{ }}` / `{% %}` / `{# #}` front end.

use super::{trim_line_tail, Lexer, TokenKind};
use crate::error::LexError;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Tag {
    Var,
    Block,
    Comment,
}

impl<'a> Lexer<'a> {
    pub(super) fn lex_jinja(&mut self) -> Result<(), LexError> {
        if self.lstrip_next {
            self.lstrip_next = false;
            self.cursor = self.skip_ws(self.cursor, true);
        }
        let src = self.src;
        let start = self.cursor;
        let rest = &src[start..];

        let Some(open) = find_open(rest).map(|i| start + i) else {
            self.push_text(rest.to_string(), start, src.len());
            self.cursor = src.len();
            return Ok(());
        };
        let tag = match &src[open..open + 2] {
            "{{" => Tag::Var,
            "{%" => Tag::Block,
            _ => Tag::Comment,
        };
        let strip_before = src[open + 2..].starts_with('-');

        // Scan the tag first: its tokens go after the text, but the text's
        // trimming depends on where the tag ends.
        let mark = self.pending.len();
        let scanned = match tag {
            Tag::Comment => self.scan_comment(open),
            Tag::Var => self.scan_tag(open, "}}"),
            Tag::Block => self.scan_tag(open, "%}"),
        };
        let (end, strip_after) = match scanned {
            Ok(found) => found,
            Err(e) => {
                self.pending.truncate(mark);
                return Err(e);
            }
        };
        let tag_tokens: Vec<_> = self.pending.drain(mark..).collect();

        let standalone = if tag == Tag::Var {
            None
        } else {
            self.alone_on_line(open, end)
        };
        let mut text = src[start..open].to_string();
        if strip_before {
            let keep = text.trim_end().len();
            text.truncate(keep);
        } else if standalone.is_some() {
            trim_line_tail(&mut text);
        }
        let mut resume = end;
        if strip_after {
            self.lstrip_next = true;
        } else if let Some(after_line) = standalone {
            resume = after_line;
        }

        self.push_text(text, start, open);
        let is_raw = tag == Tag::Block
            && tag_tokens.len() == 3
            && matches!(&tag_tokens[1].kind, TokenKind::Ident(name) if name == "raw");
        self.pending.extend(tag_tokens);
        self.cursor = resume;

        if is_raw {
            self.lex_raw_body(open)?;
        }
        Ok(())
    }

    /// Queues the tokens of a `{{ }}` or `{% %}` tag opened at `open`.
    /// Returns the offset after the closer and whether it carried `-`.
    fn scan_tag(&mut self, open: usize, close: &'static str) -> Result<(usize, bool), LexError> {
        let (start_kind, end_kind, open_str) = if close == "}}" {
            (TokenKind::InterpStart, TokenKind::InterpEnd, "{{")
        } else {
            (TokenKind::DirectiveStart, TokenKind::DirectiveEnd, "{%")
        };
        let mut p = open + 2;
        if self.src[p..].starts_with('-') {
            p += 1;
        }
        self.push(start_kind, open, p);

        let mut depth = 0usize;
        loop {
            p = self.skip_ws(p, true);
            let rest = &self.src[p..];
            if rest.is_empty() {
                return Err(LexError::Unterminated {
                    open: open_str,
                    close,
                    pos: self.position(open),
                });
            }
            if depth == 0 {
                if rest.starts_with('-') && rest[1..].starts_with(close) {
                    self.push(end_kind, p, p + 3);
                    return Ok((p + 3, true));
                }
                if rest.starts_with(close) {
                    self.push(end_kind, p, p + 2);
                    return Ok((p + 2, false));
                }
            }
            let (kind, end) = self.scan_expr_token(p)?;
            match kind {
                TokenKind::LBrace | TokenKind::LBracket | TokenKind::LParen => depth += 1,
                TokenKind::RBrace | TokenKind::RBracket | TokenKind::RParen => {
                    depth = depth.saturating_sub(1);
                }
                _ => {}
            }
            p = end;
        }
    }

    fn scan_comment(&mut self, open: usize) -> Result<(usize, bool), LexError> {
        let body = open + 2;
        let Some(close) = self.src[body..].find("#}").map(|i| body + i) else {
            return Err(LexError::Unterminated {
                open: "{#",
                close: "#}",
                pos: self.position(open),
            });
        };
        let strip_after = close > body && self.src[..close].ends_with('-');
        self.push(TokenKind::Comment, open, close + 2);
        Ok((close + 2, strip_after))
    }

    /// After `{% raw %}`: queues the verbatim body and the `endraw` tag.
    fn lex_raw_body(&mut self, raw_open: usize) -> Result<(), LexError> {
        let src = self.src;
        let body_start = self.cursor;
        let mut search = body_start;
        let (close_open, close_end, strip_before, strip_after) = loop {
            let Some(tag) = src[search..].find("{%").map(|i| search + i) else {
                return Err(LexError::UnterminatedBlock {
                    construct: "raw",
                    closer: "{% endraw %}",
                    pos: self.position(raw_open),
                });
            };
            if let Some((end, before, after)) = match_endraw(src, tag) {
                break (tag, end, before, after);
            }
            search = tag + 2;
        };

        let standalone = self.alone_on_line(close_open, close_end);
        let mut body = src[body_start..close_open].to_string();
        if strip_before {
            let keep = body.trim_end().len();
            body.truncate(keep);
        } else if standalone.is_some() {
            trim_line_tail(&mut body);
        }
        // The body is literal even when empty, so it is queued as-is.
        if !body.is_empty() {
            self.push(TokenKind::Text(body), body_start, close_open);
        }
        let name_at = src[close_open..close_end].find("endraw").map_or(close_open, |i| close_open + i);
        self.push(TokenKind::DirectiveStart, close_open, close_open + 2);
        self.push(TokenKind::Ident("endraw".to_string()), name_at, name_at + 6);
        self.push(TokenKind::DirectiveEnd, close_end - 2, close_end);

        self.cursor = close_end;
        if strip_after {
            self.lstrip_next = true;
        } else if let Some(after_line) = standalone {
            self.cursor = after_line;
        }
        Ok(())
    }
}

/// Offset of the first `{{`, `{%` or `{#` in `s`.
fn find_open(s: &str) -> Option<usize> {
    let bytes = s.as_bytes();
    (0..bytes.len().saturating_sub(1))
        .find(|&i| bytes[i] == b'{' && matches!(bytes[i + 1], b'{' | b'%' | b'#'))
}

/// Matches `{%-? endraw -?%}` at `at`, returning its end offset and the
/// strip flags on either side.
fn match_endraw(src: &str, at: usize) -> Option<(usize, bool, bool)> {
    let mut p = at + 2;
    let strip_before = src[p..].starts_with('-');
    if strip_before {
        p += 1;
    }
    let rest = src[p..].trim_start();
    p = src.len() - rest.len();
    let rest = rest.strip_prefix("endraw")?;
    p += "endraw".len();
    let trimmed = rest.trim_start();
    p += rest.len() - trimmed.len();
    let (strip_after, close_len) = if trimmed.starts_with("-%}") {
        (true, 3)
    } else if trimmed.starts_with("%}") {
        (false, 2)
    } else {
        return None;
    };
    Some((p + close_len, strip_before, strip_after))
}
