//! Tokenizer for both surface syntaxes.
//!
//! The lexer works one construct at a time: each call to
//! [`Lexer::next_token`] either hands out a queued token or scans the next
//! stretch of literal text plus the construct that ends it. Trim decisions
//! need to see the whole construct (and its line) before the preceding text
//! is emitted, which is why a construct is scanned in one go.

mod expr;
mod jinja;
mod native;

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{LexError, Position};

use expr::is_ident_char;

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Text(String),
    Comment,
    InterpStart, // {{  ${  $name  @name(
    InterpEnd,   // }}  }
    DirectiveStart, // {%  @
    DirectiveEnd,   // %}  end of line

    // Keywords
    And,
    Or,
    Not,
    In,
    Is,
    True,
    False,
    None,

    // Symbols
    Dot,
    Comma,
    Colon,
    Pipe,
    Tilde,
    Assign,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Plus,
    Minus,
    Star,
    Slash,
    SlashSlash,
    Percent,
    EqEq,
    NotEq,
    Lt,
    Gt,
    Le,
    Ge,

    // Data
    Ident(String),
    Str(String),
    Int(i64),
    Float(f64),
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TokenKind::Text(_) => "text",
            TokenKind::Comment => "comment",
            TokenKind::InterpStart => "start of interpolation",
            TokenKind::InterpEnd => "end of interpolation",
            TokenKind::DirectiveStart => "start of directive",
            TokenKind::DirectiveEnd => "end of directive",
            TokenKind::And => "`and`",
            TokenKind::Or => "`or`",
            TokenKind::Not => "`not`",
            TokenKind::In => "`in`",
            TokenKind::Is => "`is`",
            TokenKind::True => "`true`",
            TokenKind::False => "`false`",
            TokenKind::None => "`none`",
            TokenKind::Dot => "`.`",
            TokenKind::Comma => "`,`",
            TokenKind::Colon => "`:`",
            TokenKind::Pipe => "`|`",
            TokenKind::Tilde => "`~`",
            TokenKind::Assign => "`=`",
            TokenKind::LParen => "`(`",
            TokenKind::RParen => "`)`",
            TokenKind::LBracket => "`[`",
            TokenKind::RBracket => "`]`",
            TokenKind::LBrace => "`{`",
            TokenKind::RBrace => "`}`",
            TokenKind::Plus => "`+`",
            TokenKind::Minus => "`-`",
            TokenKind::Star => "`*`",
            TokenKind::Slash => "`/`",
            TokenKind::SlashSlash => "`//`",
            TokenKind::Percent => "`%`",
            TokenKind::EqEq => "`==`",
            TokenKind::NotEq => "`!=`",
            TokenKind::Lt => "`<`",
            TokenKind::Gt => "`>`",
            TokenKind::Le => "`<=`",
            TokenKind::Ge => "`>=`",
            TokenKind::Ident(name) => return write!(f, "identifier `{name}`"),
            TokenKind::Str(_) => "string literal",
            TokenKind::Int(_) | TokenKind::Float(_) => "number",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token<'a> {
    pub kind: TokenKind,
    pub lexeme: &'a str,
    pub pos: Position,
}

/// Which surface syntax a template is written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Syntax {
    /// Pick from the markers present in the source.
    #[default]
    Auto,
    #[serde(alias = "luma")]
    Native,
    #[serde(alias = "jinja2")]
    Jinja,
}

impl FromStr for Syntax {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Syntax::Auto),
            "native" | "luma" => Ok(Syntax::Native),
            "jinja" | "jinja2" => Ok(Syntax::Jinja),
            other => Err(format!("unknown syntax `{other}` (expected auto, native or jinja)")),
        }
    }
}

impl fmt::Display for Syntax {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Syntax::Auto => "auto",
            Syntax::Native => "native",
            Syntax::Jinja => "jinja",
        })
    }
}

/// Directive names the native syntax recognizes after `@`.
pub(crate) const NATIVE_DIRECTIVES: &[&str] = &[
    "if", "elif", "else", "for", "end", "macro", "call", "let", "set", "block", "extends", "import",
    "include", "autoescape", "filter", "raw", "comment", "with", "break", "continue",
];

/// Resolves `auto` to a concrete syntax.
///
/// Jinja markers (`{{`, `{%`, `{#`) select jinja. A document that also
/// carries native markers (`${` or a line-leading `@directive`) is rejected
/// instead of guessed.
pub fn detect_syntax(source: &str) -> Result<Syntax, LexError> {
    let jinja = ["{{", "{%", "{#"].iter().any(|m| source.contains(m));
    let native = first_native_marker(source);
    match (jinja, native) {
        (true, Some(offset)) => Err(LexError::MixedSyntax {
            pos: LineIndex::new(source).position(source, offset),
        }),
        (true, None) => Ok(Syntax::Jinja),
        (false, _) => Ok(Syntax::Native),
    }
}

fn first_native_marker(source: &str) -> Option<usize> {
    let braced = source.find("${");
    let mut offset = 0;
    let mut directive = None;
    for line in source.split_inclusive('\n') {
        let indent = line.len() - line.trim_start_matches([' ', '\t']).len();
        if let Some(rest) = line[indent..].strip_prefix('@') {
            let word_len = rest.find(|c: char| !is_ident_char(c)).unwrap_or(rest.len());
            if NATIVE_DIRECTIVES.contains(&&rest[..word_len]) {
                directive = Some(offset + indent);
                break;
            }
        }
        offset += line.len();
    }
    match (braced, directive) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// Byte offsets of line starts, for turning offsets into positions.
#[derive(Debug, Clone)]
struct LineIndex {
    starts: Vec<usize>,
}

impl LineIndex {
    fn new(src: &str) -> Self {
        let mut starts = vec![0];
        starts.extend(src.match_indices('\n').map(|(i, _)| i + 1));
        Self { starts }
    }

    fn position(&self, src: &str, offset: usize) -> Position {
        let line = self.starts.partition_point(|&s| s <= offset);
        let start = self.starts[line.saturating_sub(1)];
        let column = src[start..offset.min(src.len())].chars().count() + 1;
        Position::new(line, column)
    }
}

pub struct Lexer<'a> {
    src: &'a str,
    cursor: usize,
    syntax: Syntax,
    pending: VecDeque<Token<'a>>,
    lines: LineIndex,
    lstrip_next: bool,
}

impl<'a> Lexer<'a> {
    /// Creates a lexer, resolving [`Syntax::Auto`] up front.
    pub fn new(src: &'a str, syntax: Syntax) -> Result<Self, LexError> {
        let syntax = match syntax {
            Syntax::Auto => detect_syntax(src)?,
            explicit => explicit,
        };
        Ok(Self {
            src,
            cursor: 0,
            syntax,
            pending: VecDeque::new(),
            lines: LineIndex::new(src),
            lstrip_next: false,
        })
    }

    /// The resolved syntax; never [`Syntax::Auto`].
    pub fn syntax(&self) -> Syntax {
        self.syntax
    }

    pub fn next_token(&mut self) -> Result<Option<Token<'a>>, LexError> {
        loop {
            if let Some(token) = self.pending.pop_front() {
                return Ok(Some(token));
            }
            if self.cursor >= self.src.len() {
                return Ok(None);
            }
            match self.syntax {
                Syntax::Jinja => self.lex_jinja()?,
                Syntax::Native | Syntax::Auto => self.lex_native()?,
            }
        }
    }

    /// Position of the end of input, for end-of-template diagnostics.
    pub fn end_position(&self) -> Position {
        self.position(self.src.len())
    }

    fn position(&self, offset: usize) -> Position {
        self.lines.position(self.src, offset)
    }

    fn push(&mut self, kind: TokenKind, start: usize, end: usize) {
        let pos = self.position(start);
        self.pending.push_back(Token {
            kind,
            lexeme: &self.src[start..end],
            pos,
        });
    }

    fn push_text(&mut self, text: String, start: usize, end: usize) {
        if !text.is_empty() {
            self.push(TokenKind::Text(text), start, end);
        }
    }

    /// If the construct spanning `open..end` is the only non-whitespace
    /// content of its line(s), returns the offset just past its line break.
    fn alone_on_line(&self, open: usize, end: usize) -> Option<usize> {
        let line_start = self.src[..open].rfind('\n').map_or(0, |i| i + 1);
        if !self.src[line_start..open].chars().all(|c| c == ' ' || c == '\t') {
            return None;
        }
        let rest = &self.src[end..];
        let line_end = rest.find('\n');
        let tail = &rest[..line_end.unwrap_or(rest.len())];
        if !tail.chars().all(|c| c == ' ' || c == '\t' || c == '\r') {
            return None;
        }
        Some(line_end.map_or(self.src.len(), |i| end + i + 1))
    }

    /// Skips whitespace from `at`; line breaks only when `newlines` is set.
    fn skip_ws(&self, at: usize, newlines: bool) -> usize {
        let rest = &self.src[at..];
        let trimmed =
            rest.trim_start_matches(|c: char| c == ' ' || c == '\t' || c == '\r' || (newlines && c.is_whitespace()));
        at + (rest.len() - trimmed.len())
    }

    /// Scans one expression token at `at` and queues it.
    fn scan_expr_token(&mut self, at: usize) -> Result<(TokenKind, usize), LexError> {
        let (kind, end) = expr::scan(self.src, at).map_err(|e| match e {
            expr::ScanError::UnterminatedString(offset) => LexError::UnterminatedString {
                pos: self.position(offset),
            },
            expr::ScanError::UnexpectedChar(ch, offset) => LexError::UnexpectedChar {
                ch,
                pos: self.position(offset),
            },
        })?;
        self.push(kind.clone(), at, end);
        Ok((kind, end))
    }

    /// Scans a parenthesized group starting at the `(` at `at`, queueing its
    /// tokens. Returns the offset after the matching `)`.
    fn scan_group(&mut self, at: usize) -> Result<usize, LexError> {
        let mut depth = 0usize;
        let mut p = at;
        loop {
            p = self.skip_ws(p, true);
            if p >= self.src.len() {
                return Err(LexError::Unterminated {
                    open: "(",
                    close: ")",
                    pos: self.position(at),
                });
            }
            let (kind, end) = self.scan_expr_token(p)?;
            p = end;
            match kind {
                TokenKind::LParen | TokenKind::LBracket | TokenKind::LBrace => depth += 1,
                TokenKind::RParen | TokenKind::RBracket | TokenKind::RBrace => {
                    depth = depth.saturating_sub(1);
                    if depth == 0 {
                        return Ok(p);
                    }
                }
                _ => {}
            }
        }
    }
}

/// Drops trailing spaces and tabs, the part of a line a standalone
/// directive owns.
fn trim_line_tail(text: &mut String) {
    let keep = text.trim_end_matches([' ', '\t']).len();
    text.truncate(keep);
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn kinds(src: &str, syntax: Syntax) -> Vec<TokenKind> {
        let mut lexer = Lexer::new(src, syntax).unwrap();
        let mut out = Vec::new();
        while let Some(token) = lexer.next_token().unwrap() {
            out.push(token.kind);
        }
        out
    }

    fn text(s: &str) -> TokenKind {
        TokenKind::Text(s.to_string())
    }

    fn ident(s: &str) -> TokenKind {
        TokenKind::Ident(s.to_string())
    }

    #[test]
    fn detects_jinja_markers() {
        assert_eq!(detect_syntax("Hello {{ name }}").unwrap(), Syntax::Jinja);
        assert_eq!(detect_syntax("{# note #}").unwrap(), Syntax::Jinja);
        assert_eq!(detect_syntax("Hello $name").unwrap(), Syntax::Native);
        assert_eq!(detect_syntax("plain text").unwrap(), Syntax::Native);
    }

    #[test]
    fn mixed_markers_are_rejected() {
        let err = detect_syntax("{{ a }}\n@if b\n@end").unwrap_err();
        assert_eq!(err, LexError::MixedSyntax { pos: Position::new(2, 1) });
        assert!(detect_syntax("{{ a }} costs ${price}").is_err());
        // `$word` and mid-line `@` are ordinary text in a jinja document.
        assert_eq!(detect_syntax("{{ a }} $HOME me@if.com").unwrap(), Syntax::Jinja);
    }

    #[test]
    fn syntax_parses_from_strings() {
        assert_eq!("jinja2".parse::<Syntax>().unwrap(), Syntax::Jinja);
        assert_eq!("luma".parse::<Syntax>().unwrap(), Syntax::Native);
        assert!("mustache".parse::<Syntax>().is_err());
    }

    #[test]
    fn positions_are_one_based() {
        let mut lexer = Lexer::new("ab\n  {{ x }}", Syntax::Jinja).unwrap();
        let first = lexer.next_token().unwrap().unwrap();
        assert_eq!(first.pos, Position::new(1, 1));
        let start = lexer.next_token().unwrap().unwrap();
        assert_eq!(start.kind, TokenKind::InterpStart);
        assert_eq!(start.pos, Position::new(2, 3));
        let name = lexer.next_token().unwrap().unwrap();
        assert_eq!(name.lexeme, "x");
        assert_eq!(name.pos, Position::new(2, 6));
    }

    #[test]
    fn jinja_block_tags_alone_on_a_line_trim() {
        let src = "a\n  {% if x %}  \nb\n{% endif %}\nc";
        assert_eq!(
            kinds(src, Syntax::Jinja),
            vec![
                text("a\n"),
                TokenKind::DirectiveStart,
                ident("if"),
                ident("x"),
                TokenKind::DirectiveEnd,
                text("b\n"),
                TokenKind::DirectiveStart,
                ident("endif"),
                TokenKind::DirectiveEnd,
                text("c"),
            ]
        );
    }

    #[test]
    fn jinja_inline_tags_keep_whitespace() {
        let src = "{% for i in xs %}{{ i }} {% endfor %}\n";
        let tokens = kinds(src, Syntax::Jinja);
        assert_eq!(tokens.last(), Some(&text("\n")));
        assert!(tokens.contains(&text(" ")));
    }

    #[test]
    fn jinja_dash_strips_whitespace() {
        let src = "a  \n {%- if x -%}  \n  b";
        assert_eq!(
            kinds(src, Syntax::Jinja),
            vec![
                text("a"),
                TokenKind::DirectiveStart,
                ident("if"),
                ident("x"),
                TokenKind::DirectiveEnd,
                text("b"),
            ]
        );
    }

    #[test]
    fn jinja_nested_braces_do_not_close_interpolation() {
        let tokens = kinds("{{ {'a': {'b': 1}} }}", Syntax::Jinja);
        assert_eq!(tokens.first(), Some(&TokenKind::InterpStart));
        assert_eq!(tokens.last(), Some(&TokenKind::InterpEnd));
        assert_eq!(tokens.iter().filter(|t| **t == TokenKind::RBrace).count(), 2);
    }

    #[test]
    fn jinja_raw_body_is_verbatim() {
        let src = "{% raw %}{{ not parsed }}{% endraw %}";
        assert_eq!(
            kinds(src, Syntax::Jinja),
            vec![
                TokenKind::DirectiveStart,
                ident("raw"),
                TokenKind::DirectiveEnd,
                text("{{ not parsed }}"),
                TokenKind::DirectiveStart,
                ident("endraw"),
                TokenKind::DirectiveEnd,
            ]
        );
    }

    #[test]
    fn jinja_unterminated_tag_reports_opening_position() {
        let mut lexer = Lexer::new("ok\n{% if x", Syntax::Jinja).unwrap();
        let _ = lexer.next_token();
        let err = lexer.next_token().unwrap_err();
        assert_eq!(
            err,
            LexError::Unterminated {
                open: "{%",
                close: "%}",
                pos: Position::new(2, 1)
            }
        );
    }

    #[test]
    fn native_bare_interpolation_with_dots_and_filters() {
        let src = "Hi $user.name | upper!";
        assert_eq!(
            kinds(src, Syntax::Native),
            vec![
                text("Hi "),
                TokenKind::InterpStart,
                ident("user"),
                TokenKind::Dot,
                ident("name"),
                TokenKind::Pipe,
                ident("upper"),
                TokenKind::InterpEnd,
                text("!"),
            ]
        );
    }

    #[test]
    fn native_sentence_dot_is_text() {
        let tokens = kinds("Bye $name.", Syntax::Native);
        assert_eq!(tokens.last(), Some(&text(".")));
    }

    #[test]
    fn native_escapes_and_lone_markers() {
        assert_eq!(kinds("$$5 and @@x, $5, a@b", Syntax::Native), vec![text("$5 and @x, $5, a@b")]);
    }

    #[test]
    fn native_directive_lines_trim() {
        let src = "@if show\nVisible\n  @end  \nafter";
        assert_eq!(
            kinds(src, Syntax::Native),
            vec![
                TokenKind::DirectiveStart,
                ident("if"),
                ident("show"),
                TokenKind::DirectiveEnd,
                text("Visible\n"),
                TokenKind::DirectiveStart,
                ident("end"),
                TokenKind::DirectiveEnd,
                text("after"),
            ]
        );
    }

    #[test]
    fn native_inline_end_does_not_trim() {
        let tokens = kinds("x @end tail\n", Syntax::Native);
        assert_eq!(tokens.first(), Some(&text("x ")));
        assert_eq!(tokens.last(), Some(&text(" tail\n")));
    }

    #[test]
    fn native_macro_call_is_an_interpolation() {
        assert_eq!(
            kinds("@greet(\"Bo\")", Syntax::Native),
            vec![
                TokenKind::InterpStart,
                ident("greet"),
                TokenKind::LParen,
                TokenKind::Str("Bo".into()),
                TokenKind::RParen,
                TokenKind::InterpEnd,
            ]
        );
    }

    #[test]
    fn native_unterminated_brace_is_a_lex_error() {
        let mut lexer = Lexer::new("a ${x + 1", Syntax::Native).unwrap();
        let err = lexer.next_token().unwrap_err();
        assert_eq!(
            err,
            LexError::Unterminated {
                open: "${",
                close: "}",
                pos: Position::new(1, 3)
            }
        );
    }

    #[test]
    fn native_comments_vanish_with_their_line() {
        let src = "a\n@# note\n@comment\nignored $x\n@end\nb";
        assert_eq!(
            kinds(src, Syntax::Native),
            vec![text("a\n"), TokenKind::Comment, TokenKind::Comment, text("b")]
        );
    }
}
