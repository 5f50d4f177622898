//! `$name` / `${expr}` / `@directive` front end.

use super::expr::{ident_end, is_ident_char, is_ident_start};
use super::{trim_line_tail, Lexer, TokenKind, NATIVE_DIRECTIVES};
use crate::error::LexError;

/// How a scanned construct interacts with the whitespace around it.
enum Shape {
    /// Interpolations and macro calls: never trim.
    Inline,
    /// Directives and `@#` comments: own their line when alone on it.
    Line,
    /// `@raw`/`@comment` bodies: the opener owns its line when alone on
    /// it; the scanner already decided where the closer's line ends.
    Enclosing { opener_end: usize },
}

enum Marker {
    Braced,
    Bare,
    LineComment,
    Directive(String),
    Call,
    Unknown(String),
}

/// Directives that never take arguments.
const BARE_DIRECTIVES: &[&str] = &["else", "end", "break", "continue"];

impl<'a> Lexer<'a> {
    pub(super) fn lex_native(&mut self) -> Result<(), LexError> {
        let src = self.src;
        let start = self.cursor;
        let mut text = String::new();
        let mut p = start;

        let (at, marker) = loop {
            let Some(at) = src[p..].find(['$', '@']).map(|i| p + i) else {
                text.push_str(&src[p..]);
                self.push_text(text, start, src.len());
                self.cursor = src.len();
                return Ok(());
            };
            text.push_str(&src[p..at]);
            match self.classify(at) {
                Some(marker) => break (at, marker),
                None => {
                    // `$$` and `@@` collapse to one character; any other
                    // marker that starts nothing is itself literal.
                    let ch = &src[at..at + 1];
                    text.push_str(ch);
                    p = if src[at + 1..].starts_with(ch) { at + 2 } else { at + 1 };
                }
            }
        };

        let mark = self.pending.len();
        let (shape, end) = match self.scan_marker(at, marker) {
            Ok(scanned) => scanned,
            Err(e) => {
                self.pending.truncate(mark);
                return Err(e);
            }
        };
        let tokens: Vec<_> = self.pending.drain(mark..).collect();

        let resume = match shape {
            Shape::Inline => end,
            Shape::Line => match self.alone_on_line(at, end) {
                Some(after_line) => {
                    trim_line_tail(&mut text);
                    after_line
                }
                None => end,
            },
            Shape::Enclosing { opener_end } => {
                if self.alone_on_line(at, opener_end).is_some() {
                    trim_line_tail(&mut text);
                }
                end
            }
        };

        self.push_text(text, start, at);
        self.pending.extend(tokens);
        self.cursor = resume;
        Ok(())
    }

    /// Decides what the `$` or `@` at `at` starts, if anything.
    fn classify(&self, at: usize) -> Option<Marker> {
        let src = self.src;
        let next = src[at + 1..].chars().next();
        if src[at..].starts_with('$') {
            return match next {
                Some('{') => Some(Marker::Braced),
                Some(c) if is_ident_start(c) => Some(Marker::Bare),
                _ => None,
            };
        }

        if src[..at].chars().next_back().is_some_and(is_ident_char) {
            return None;
        }
        match next {
            Some('#') => Some(Marker::LineComment),
            Some(c) if is_ident_start(c) => {
                let word_end = ident_end(src, at + 1);
                let word = &src[at + 1..word_end];
                if NATIVE_DIRECTIVES.contains(&word) {
                    Some(Marker::Directive(word.to_string()))
                } else if self.call_shaped(word_end) {
                    Some(Marker::Call)
                } else if self.line_leading(at) {
                    Some(Marker::Unknown(word.to_string()))
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// `name(` or `name.member(` right after the identifier ending at `at`.
    fn call_shaped(&self, at: usize) -> bool {
        let rest = &self.src[at..];
        if rest.starts_with('(') {
            return true;
        }
        match rest.strip_prefix('.') {
            Some(member) if member.starts_with(is_ident_start) => {
                self.src[ident_end(self.src, at + 1)..].starts_with('(')
            }
            _ => false,
        }
    }

    fn line_leading(&self, at: usize) -> bool {
        let line_start = self.src[..at].rfind('\n').map_or(0, |i| i + 1);
        self.src[line_start..at].chars().all(|c| c == ' ' || c == '\t')
    }

    fn scan_marker(&mut self, at: usize, marker: Marker) -> Result<(Shape, usize), LexError> {
        match marker {
            Marker::Braced => Ok((Shape::Inline, self.scan_braced(at)?)),
            Marker::Bare => Ok((Shape::Inline, self.scan_bare(at))),
            Marker::Call => Ok((Shape::Inline, self.scan_call(at)?)),
            Marker::LineComment => {
                let end = self.src[at..].find('\n').map_or(self.src.len(), |i| at + i);
                self.push(TokenKind::Comment, at, end);
                Ok((Shape::Line, end))
            }
            Marker::Unknown(name) => {
                let name_end = at + 1 + name.len();
                self.push(TokenKind::DirectiveStart, at, at + 1);
                self.push(TokenKind::Ident(name), at + 1, name_end);
                self.push(TokenKind::DirectiveEnd, name_end, name_end);
                Ok((Shape::Line, name_end))
            }
            Marker::Directive(name) => match name.as_str() {
                "raw" | "comment" => self.scan_enclosing(at, name),
                _ => Ok((Shape::Line, self.scan_directive(at, name)?)),
            },
        }
    }

    /// `${ expr }`; braces inside the expression nest.
    fn scan_braced(&mut self, at: usize) -> Result<usize, LexError> {
        self.push(TokenKind::InterpStart, at, at + 2);
        let mut depth = 0usize;
        let mut p = at + 2;
        loop {
            p = self.skip_ws(p, true);
            if p >= self.src.len() {
                return Err(LexError::Unterminated {
                    open: "${",
                    close: "}",
                    pos: self.position(at),
                });
            }
            if depth == 0 && self.src[p..].starts_with('}') {
                self.push(TokenKind::InterpEnd, p, p + 1);
                return Ok(p + 1);
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

    /// `$name.path | filter(args) | filter`
    fn scan_bare(&mut self, at: usize) -> usize {
        let src = self.src;
        self.push(TokenKind::InterpStart, at, at + 1);
        let mut p = self.push_ident(at + 1);
        while let Some(member) = src[p..].strip_prefix('.') {
            if !member.starts_with(is_ident_start) {
                break;
            }
            self.push(TokenKind::Dot, p, p + 1);
            p = self.push_ident(p + 1);
        }

        loop {
            let pipe = self.skip_ws(p, false);
            if !src[pipe..].starts_with('|') || src[pipe + 1..].starts_with('|') {
                break;
            }
            let name = self.skip_ws(pipe + 1, false);
            if !src[name..].starts_with(is_ident_start) {
                break;
            }
            self.push(TokenKind::Pipe, pipe, pipe + 1);
            p = self.push_ident(name);
            if src[p..].starts_with('(') {
                let mark = self.pending.len();
                match self.scan_group(p) {
                    Ok(end) => p = end,
                    // An unclosed `(` after a bare filter reads as text.
                    Err(_) => {
                        self.pending.truncate(mark);
                        break;
                    }
                }
            }
        }
        self.push(TokenKind::InterpEnd, p, p);
        p
    }

    /// `@name(args)` or `@ns.name(args)` as an interpolation.
    fn scan_call(&mut self, at: usize) -> Result<usize, LexError> {
        self.push(TokenKind::InterpStart, at, at + 1);
        let mut p = self.push_ident(at + 1);
        if self.src[p..].starts_with('.') {
            self.push(TokenKind::Dot, p, p + 1);
            p = self.push_ident(p + 1);
        }
        let end = self.scan_group(p)?;
        self.push(TokenKind::InterpEnd, end, end);
        Ok(end)
    }

    /// `@keyword args...` up to the end of the line. A line break inside
    /// open brackets continues the directive.
    fn scan_directive(&mut self, at: usize, name: String) -> Result<usize, LexError> {
        let name_end = at + 1 + name.len();
        let bare = BARE_DIRECTIVES.contains(&name.as_str());
        self.push(TokenKind::DirectiveStart, at, at + 1);
        self.push(TokenKind::Ident(name), at + 1, name_end);
        if bare {
            self.push(TokenKind::DirectiveEnd, name_end, name_end);
            return Ok(name_end);
        }

        let mut stack: Vec<(&'static str, &'static str, usize)> = Vec::new();
        let mut p = name_end;
        loop {
            p = self.skip_ws(p, !stack.is_empty());
            let at_line_end = p >= self.src.len() || self.src[p..].starts_with('\n');
            if at_line_end {
                if let Some(&(open, close, offset)) = stack.last() {
                    return Err(LexError::Unterminated {
                        open,
                        close,
                        pos: self.position(offset),
                    });
                }
                self.push(TokenKind::DirectiveEnd, p, p);
                return Ok(p);
            }
            let (kind, end) = self.scan_expr_token(p)?;
            match kind {
                TokenKind::LParen => stack.push(("(", ")", p)),
                TokenKind::LBracket => stack.push(("[", "]", p)),
                TokenKind::LBrace => stack.push(("{", "}", p)),
                TokenKind::RParen | TokenKind::RBracket | TokenKind::RBrace => {
                    stack.pop();
                }
                _ => {}
            }
            p = end;
        }
    }

    /// `@raw ... @end` (verbatim body) and `@comment ... @end` (dropped).
    fn scan_enclosing(&mut self, at: usize, name: String) -> Result<(Shape, usize), LexError> {
        let src = self.src;
        let opener_end = at + 1 + name.len();
        let body_start = self.alone_on_line(at, opener_end).unwrap_or(opener_end);

        let Some(close) = find_end(src, body_start) else {
            return Err(LexError::UnterminatedBlock {
                construct: if name == "raw" { "raw" } else { "comment" },
                closer: "@end",
                pos: self.position(at),
            });
        };
        let close_end = close + "@end".len();
        let closer_line = self.alone_on_line(close, close_end);
        let resume = closer_line.unwrap_or(close_end);

        if name == "raw" {
            let mut body = src[body_start..close].to_string();
            if closer_line.is_some() {
                trim_line_tail(&mut body);
            }
            self.push(TokenKind::DirectiveStart, at, at + 1);
            self.push(TokenKind::Ident(name), at + 1, opener_end);
            self.push(TokenKind::DirectiveEnd, opener_end, opener_end);
            self.push_text(body, body_start, close);
            self.push(TokenKind::DirectiveStart, close, close + 1);
            self.push(TokenKind::Ident("end".to_string()), close + 1, close_end);
            self.push(TokenKind::DirectiveEnd, close_end, close_end);
        } else {
            self.push(TokenKind::Comment, at, close_end);
        }
        Ok((Shape::Enclosing { opener_end }, resume))
    }

    fn push_ident(&mut self, at: usize) -> usize {
        let end = ident_end(self.src, at);
        self.push(TokenKind::Ident(self.src[at..end].to_string()), at, end);
        end
    }
}

/// Offset of the `@end` closing a raw or comment body starting at `from`.
fn find_end(src: &str, from: usize) -> Option<usize> {
    let mut search = from;
    while let Some(found) = src[search..].find("@end").map(|i| search + i) {
        let after = &src[found + 4..];
        let word_before = src[..found].chars().next_back().is_some_and(is_ident_char);
        if !word_before && !after.starts_with(is_ident_char) {
            return Some(found);
        }
        search = found + 4;
    }
    None
}
