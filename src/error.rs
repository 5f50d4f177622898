//! Error taxonomy for every stage of the pipeline.
//!
//! Each stage has its own error enum so callers can tell a malformed marker
//! from a grammar violation from a failed render. [`Error`] unifies them for
//! the top-level API.

use std::fmt;

use thiserror::Error;

/// 1-based line and column of a point in template source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Position {
    pub line: usize,
    pub column: usize,
}

impl Position {
    pub const fn new(line: usize, column: usize) -> Self {
        Self { line, column }
    }
}

impl Default for Position {
    fn default() -> Self {
        Self { line: 1, column: 1 }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// Malformed markers and characters the tokenizer cannot place.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LexError {
    #[error("unterminated `{open}` at {pos}: missing `{close}`")]
    Unterminated {
        open: &'static str,
        close: &'static str,
        pos: Position,
    },

    #[error("unterminated {construct} block at {pos}: missing `{closer}`")]
    UnterminatedBlock {
        construct: &'static str,
        closer: &'static str,
        pos: Position,
    },

    #[error("unterminated string literal at {pos}")]
    UnterminatedString { pos: Position },

    #[error("unexpected character `{ch}` at {pos}")]
    UnexpectedChar { ch: char, pos: Position },

    #[error("template mixes native and jinja syntax (native marker at {pos}); pass an explicit syntax")]
    MixedSyntax { pos: Position },
}

impl LexError {
    pub fn position(&self) -> Position {
        match self {
            LexError::Unterminated { pos, .. }
            | LexError::UnterminatedBlock { pos, .. }
            | LexError::UnterminatedString { pos }
            | LexError::UnexpectedChar { pos, .. }
            | LexError::MixedSyntax { pos } => *pos,
        }
    }
}

/// Grammar violations and directive nesting errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("expected {expected}, found {found} at {pos}")]
    UnexpectedToken {
        expected: String,
        found: String,
        pos: Position,
    },

    #[error("unexpected end of template, expected {expected}")]
    UnexpectedEof { expected: String, pos: Position },

    #[error("unknown directive `{name}` at {pos}")]
    UnknownDirective { name: String, pos: Position },

    #[error("`{directive}` opened at {pos} is never closed (expected `{closer}`)")]
    Unclosed {
        directive: &'static str,
        closer: String,
        pos: Position,
    },

    #[error("expected `{expected}`, found `{found}` at {pos}")]
    MismatchedCloser {
        expected: String,
        found: String,
        pos: Position,
    },

    #[error("`{closer}` at {pos} has no open directive to close")]
    StrayCloser { closer: String, pos: Position },

    #[error("unterminated string literal at {pos}")]
    UnterminatedString { pos: Position },

    #[error("invalid autoescape mode at {pos}: expected true, false or \"html\"")]
    InvalidAutoescape { pos: Position },

    #[error("only macros can be called, at {pos}")]
    NotCallable { pos: Position },

    #[error("nesting too deep (limit {limit}) at {pos}")]
    TooDeep { limit: usize, pos: Position },
}

impl ParseError {
    pub fn position(&self) -> Position {
        match self {
            ParseError::UnexpectedToken { pos, .. }
            | ParseError::UnexpectedEof { pos, .. }
            | ParseError::UnknownDirective { pos, .. }
            | ParseError::Unclosed { pos, .. }
            | ParseError::MismatchedCloser { pos, .. }
            | ParseError::StrayCloser { pos, .. }
            | ParseError::UnterminatedString { pos }
            | ParseError::InvalidAutoescape { pos }
            | ParseError::NotCallable { pos }
            | ParseError::TooDeep { pos, .. } => *pos,
        }
    }
}

/// Problems found while turning a valid AST into a [`Template`](crate::Template).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompileError {
    #[error("unknown filter `{name}` at {pos}")]
    UnknownFilter { name: String, pos: Position },

    #[error("unknown test `{name}` at {pos}")]
    UnknownTest { name: String, pos: Position },

    #[error("macro `{name}` defined twice (second definition at {pos})")]
    DuplicateMacro { name: String, pos: Position },

    #[error("block `{name}` defined twice (second definition at {pos})")]
    DuplicateBlock { name: String, pos: Position },

    #[error("macro `{macro_name}` declares parameter `{param}` twice at {pos}")]
    DuplicateParameter {
        macro_name: String,
        param: String,
        pos: Position,
    },

    #[error("macro `{macro_name}`: parameter `{param}` without a default follows a defaulted one at {pos}")]
    RequiredAfterDefault {
        macro_name: String,
        param: String,
        pos: Position,
    },

    #[error("`extends` at {pos} must appear once, at the top level of the template")]
    MisplacedExtends { pos: Position },
}

impl CompileError {
    pub fn position(&self) -> Position {
        match self {
            CompileError::UnknownFilter { pos, .. }
            | CompileError::UnknownTest { pos, .. }
            | CompileError::DuplicateMacro { pos, .. }
            | CompileError::DuplicateBlock { pos, .. }
            | CompileError::DuplicateParameter { pos, .. }
            | CompileError::RequiredAfterDefault { pos, .. }
            | CompileError::MisplacedExtends { pos } => *pos,
        }
    }
}

/// Failures while executing a compiled template. A render that fails
/// produces no output.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RenderError {
    #[error("`{keyword}` outside of a loop at {pos}")]
    LoopControlOutsideLoop { keyword: &'static str, pos: Position },

    #[error("unknown filter `{name}` at {pos}")]
    UnknownFilter { name: String, pos: Position },

    #[error("unknown test `{name}` at {pos}")]
    UnknownTest { name: String, pos: Position },

    #[error("unknown macro `{name}` at {pos}")]
    UnknownMacro { name: String, pos: Position },

    #[error("type error at {pos}: {message}")]
    Type { message: String, pos: Position },

    #[error("filter `{name}` failed at {pos}: {message}")]
    Filter {
        name: String,
        message: String,
        pos: Position,
    },

    #[error("macro `{name}` takes {expected} argument(s), {given} given at {pos}")]
    Arity {
        name: String,
        expected: usize,
        given: usize,
        pos: Position,
    },

    #[error("cannot load template `{path}` at {pos}: {message}")]
    Loader {
        path: String,
        message: String,
        pos: Position,
    },

    #[error("template `{path}` loaded at {pos} is invalid: {message}")]
    InvalidTemplate {
        path: String,
        message: String,
        pos: Position,
    },

    #[error("template `{path}` includes itself at {pos}")]
    Cycle { path: String, pos: Position },

    #[error("recursion limit of {limit} exceeded at {pos}")]
    RecursionLimit { limit: usize, pos: Position },
}

impl RenderError {
    pub fn position(&self) -> Position {
        match self {
            RenderError::LoopControlOutsideLoop { pos, .. }
            | RenderError::UnknownFilter { pos, .. }
            | RenderError::UnknownTest { pos, .. }
            | RenderError::UnknownMacro { pos, .. }
            | RenderError::Type { pos, .. }
            | RenderError::Filter { pos, .. }
            | RenderError::Arity { pos, .. }
            | RenderError::Loader { pos, .. }
            | RenderError::InvalidTemplate { pos, .. }
            | RenderError::Cycle { pos, .. }
            | RenderError::RecursionLimit { pos, .. } => *pos,
        }
    }
}

/// Raised by a [`Loader`](crate::Loader) that cannot produce a template.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    #[error("template not found: {0}")]
    NotFound(String),

    #[error("no loader configured to resolve `{0}`")]
    NoLoader(String),

    #[error("failed to load `{path}`: {message}")]
    Failed { path: String, message: String },
}

/// Any error the engine can produce.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    #[error("lex error: {0}")]
    Lex(#[from] LexError),

    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("compile error: {0}")]
    Compile(#[from] CompileError),

    #[error("render error: {0}")]
    Render(#[from] RenderError),

    #[error(transparent)]
    Load(#[from] LoadError),
}

impl Error {
    /// Source position of the failure, when one is known.
    pub fn position(&self) -> Option<Position> {
        match self {
            Error::Lex(e) => Some(e.position()),
            Error::Parse(e) => Some(e.position()),
            Error::Compile(e) => Some(e.position()),
            Error::Render(e) => Some(e.position()),
            Error::Load(_) => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_carry_positions() {
        let err = Error::from(ParseError::Unclosed {
            directive: "if",
            closer: "@end".to_string(),
            pos: Position::new(3, 1),
        });
        assert_eq!(
            err.to_string(),
            "parse error: `if` opened at 3:1 is never closed (expected `@end`)"
        );
        assert_eq!(err.position(), Some(Position::new(3, 1)));
    }

    #[test]
    fn load_errors_have_no_position() {
        let err = Error::from(LoadError::NotFound("base.html".into()));
        assert_eq!(err.position(), None);
        assert_eq!(err.to_string(), "template not found: base.html");
    }
}
