//! Recursive-descent parser shared by both syntaxes.
//!
//! The token stream already hides the surface differences except for
//! closers: native closes everything with `@end`, jinja with
//! `end<construct>`. Expression parsing is plain precedence climbing.

use std::collections::VecDeque;

use crate::ast::*;
use crate::error::{Error, LexError, ParseError, Position};
use crate::lexer::{Lexer, Syntax, Token, TokenKind};
use crate::value::Value;

type PResult<T> = Result<T, Error>;

/// Deepest nesting of directives and expression operators a template may
/// use. Later stages recurse over the tree too, so this keeps all of them
/// inside an ordinary thread stack.
pub const MAX_NESTING: usize = 64;

pub struct Parser<'a> {
    lexer: Lexer<'a>,
    buffer: VecDeque<Token<'a>>,
    depth: usize,
}

impl<'a> Parser<'a> {
    pub fn new(input: &'a str, syntax: Syntax) -> PResult<Self> {
        Ok(Self {
            lexer: Lexer::new(input, syntax)?,
            buffer: VecDeque::new(),
            depth: 0,
        })
    }

    /// The resolved syntax of the source being parsed.
    pub fn syntax(&self) -> Syntax {
        self.lexer.syntax()
    }

    fn peek(&mut self, n: usize) -> PResult<Option<&Token<'a>>> {
        while self.buffer.len() <= n {
            match self.lexer.next_token().map_err(lex_error)? {
                Some(token) => self.buffer.push_back(token),
                None => return Ok(None),
            }
        }
        Ok(self.buffer.get(n))
    }

    fn peek_kind(&mut self, n: usize) -> PResult<Option<&TokenKind>> {
        Ok(self.peek(n)?.map(|t| &t.kind))
    }

    fn consume(&mut self) -> PResult<Option<Token<'a>>> {
        if let Some(token) = self.buffer.pop_front() {
            return Ok(Some(token));
        }
        self.lexer.next_token().map_err(lex_error)
    }

    /// Next token, or an end-of-input error naming what was expected.
    fn next(&mut self, expected: &str) -> PResult<Token<'a>> {
        match self.consume()? {
            Some(token) => Ok(token),
            None => Err(self.eof(expected)),
        }
    }

    fn expect(&mut self, kind: TokenKind, expected: &str) -> PResult<Token<'a>> {
        let token = self.next(expected)?;
        if token.kind == kind {
            Ok(token)
        } else {
            Err(unexpected(&token, expected))
        }
    }

    fn eat(&mut self, kind: &TokenKind) -> PResult<bool> {
        if self.peek_kind(0)? == Some(kind) {
            self.consume()?;
            return Ok(true);
        }
        Ok(false)
    }

    fn expect_ident(&mut self, expected: &str) -> PResult<(String, Position)> {
        let token = self.next(expected)?;
        match token.kind {
            TokenKind::Ident(name) => Ok((name, token.pos)),
            _ => Err(unexpected(&token, expected)),
        }
    }

    fn end_directive(&mut self) -> PResult<()> {
        self.expect(TokenKind::DirectiveEnd, "end of directive")?;
        Ok(())
    }

    /// Goes one nesting level deeper. Callers restore `depth` on success.
    fn descend(&mut self) -> PResult<()> {
        self.depth += 1;
        if self.depth <= MAX_NESTING {
            return Ok(());
        }
        let pos = match self.peek(0)? {
            Some(token) => token.pos,
            None => self.lexer.end_position(),
        };
        Err(ParseError::TooDeep {
            limit: MAX_NESTING,
            pos,
        }
        .into())
    }

    fn eof(&self, expected: &str) -> Error {
        ParseError::UnexpectedEof {
            expected: expected.to_string(),
            pos: self.lexer.end_position(),
        }
        .into()
    }

    /// Name of the directive at the front of the stream, if one is there.
    fn peek_directive(&mut self) -> PResult<Option<String>> {
        if self.peek_kind(0)? != Some(&TokenKind::DirectiveStart) {
            return Ok(None);
        }
        match self.peek_kind(1)? {
            Some(TokenKind::Ident(name)) => Ok(Some(name.clone())),
            _ => Ok(None),
        }
    }

    fn is_terminator(&self, name: &str) -> bool {
        match self.syntax() {
            Syntax::Jinja => matches!(name, "else" | "elif") || name.starts_with("end"),
            Syntax::Native | Syntax::Auto => matches!(name, "else" | "elif" | "end"),
        }
    }

    fn closer(&self, construct: &str) -> String {
        match self.syntax() {
            Syntax::Jinja => format!("end{construct}"),
            Syntax::Native | Syntax::Auto => "end".to_string(),
        }
    }

    /// How a directive name is spelled in messages.
    fn spelled(&self, name: &str) -> String {
        match self.syntax() {
            Syntax::Jinja => name.to_string(),
            Syntax::Native | Syntax::Auto => format!("@{name}"),
        }
    }

    pub fn parse(&mut self) -> PResult<Ast> {
        let nodes = self.parse_nodes()?;
        // parse_nodes only stops early at a closer nothing opened.
        if let Some(start) = self.consume()? {
            let name = self.peek_directive_name()?;
            return Err(ParseError::StrayCloser {
                closer: self.spelled(&name),
                pos: start.pos,
            }
            .into());
        }
        Ok(nodes)
    }

    fn peek_directive_name(&mut self) -> PResult<String> {
        match self.peek_kind(0)? {
            Some(TokenKind::Ident(name)) => Ok(name.clone()),
            _ => Ok(String::new()),
        }
    }

    /// Parses nodes until end of input or a closer / branch directive.
    fn parse_nodes(&mut self) -> PResult<Vec<Node>> {
        let mut nodes = Vec::new();
        loop {
            if let Some(name) = self.peek_directive()? {
                if self.is_terminator(&name) {
                    break;
                }
            }
            let Some(token) = self.consume()? else {
                break;
            };
            match token.kind {
                TokenKind::Text(s) => nodes.push(Node::Text(s)),
                TokenKind::Comment => nodes.push(Node::Comment),
                TokenKind::InterpStart => {
                    let expr = self.parse_expr()?;
                    self.expect(TokenKind::InterpEnd, "end of interpolation")?;
                    nodes.push(Node::Interpolation { expr, pos: token.pos });
                }
                TokenKind::DirectiveStart => nodes.push(self.parse_directive(token.pos)?),
                _ => return Err(unexpected(&token, "text, interpolation or directive")),
            }
        }
        Ok(nodes)
    }

    fn parse_directive(&mut self, pos: Position) -> PResult<Node> {
        self.descend()?;
        let node = self.parse_directive_body(pos)?;
        self.depth -= 1;
        Ok(node)
    }

    fn parse_directive_body(&mut self, pos: Position) -> PResult<Node> {
        let (name, _) = self.expect_ident("directive name")?;
        match name.as_str() {
            "if" => self.parse_if(pos),
            "for" => self.parse_for(pos),
            "macro" => self.parse_macro(pos),
            "call" => self.parse_call_block(pos),
            "let" | "set" => {
                let (name, _) = self.expect_ident("variable name")?;
                self.expect(TokenKind::Assign, "`=`")?;
                let expr = self.parse_expr()?;
                self.end_directive()?;
                Ok(Node::Let { name, expr, pos })
            }
            "block" => {
                let (name, _) = self.expect_ident("block name")?;
                self.end_directive()?;
                let body = self.parse_nodes()?;
                self.expect_closer("block", pos)?;
                Ok(Node::Block { name, body, pos })
            }
            "extends" => {
                let path = self.parse_expr()?;
                self.end_directive()?;
                Ok(Node::Extends { path, pos })
            }
            "include" => {
                let path = self.parse_expr()?;
                self.end_directive()?;
                Ok(Node::Include { path, pos })
            }
            "import" => {
                let path = self.parse_expr()?;
                let as_kw = self.next("`as`")?;
                if !matches!(&as_kw.kind, TokenKind::Ident(kw) if kw == "as") {
                    return Err(unexpected(&as_kw, "`as`"));
                }
                let (alias, _) = self.expect_ident("import alias")?;
                self.end_directive()?;
                Ok(Node::Import { path, alias, pos })
            }
            "autoescape" => self.parse_autoescape(pos),
            "filter" => {
                let filters = self.parse_filter_chain()?;
                self.end_directive()?;
                let body = self.parse_nodes()?;
                self.expect_closer("filter", pos)?;
                Ok(Node::FilterBlock { filters, body, pos })
            }
            "raw" => {
                self.end_directive()?;
                let body = match self.peek_kind(0)? {
                    Some(TokenKind::Text(_)) => match self.consume()?.map(|t| t.kind) {
                        Some(TokenKind::Text(s)) => s,
                        _ => String::new(),
                    },
                    _ => String::new(),
                };
                self.expect_closer("raw", pos)?;
                Ok(Node::Raw(body))
            }
            "with" => self.parse_with(pos),
            "break" => {
                self.end_directive()?;
                Ok(Node::Break(pos))
            }
            "continue" => {
                self.end_directive()?;
                Ok(Node::Continue(pos))
            }
            _ => Err(ParseError::UnknownDirective { name, pos }.into()),
        }
    }

    /// Consumes the closer of `construct`, opened at `open`.
    fn expect_closer(&mut self, construct: &'static str, open: Position) -> PResult<()> {
        let expected = self.closer(construct);
        let Some(start) = self.consume()? else {
            return Err(ParseError::Unclosed {
                directive: construct,
                closer: self.spelled(&expected),
                pos: open,
            }
            .into());
        };
        let (found, pos) = self.expect_ident("closing directive")?;
        if found != expected {
            return Err(ParseError::MismatchedCloser {
                expected: self.spelled(&expected),
                found: self.spelled(&found),
                pos,
            }
            .into());
        }
        if self.syntax() == Syntax::Jinja && matches!(construct, "block" | "macro") {
            if let Some(TokenKind::Ident(_)) = self.peek_kind(0)? {
                self.consume()?;
            }
        }
        debug_assert!(start.kind == TokenKind::DirectiveStart);
        self.end_directive()
    }

    /// Consumes `else` when it is the next directive.
    fn parse_else(&mut self) -> PResult<Option<Vec<Node>>> {
        if self.peek_directive()?.as_deref() != Some("else") {
            return Ok(None);
        }
        self.consume()?;
        self.consume()?;
        self.end_directive()?;
        Ok(Some(self.parse_nodes()?))
    }

    fn parse_if(&mut self, pos: Position) -> PResult<Node> {
        let condition = self.parse_expr()?;
        self.end_directive()?;
        let body = self.parse_nodes()?;
        let mut branches = vec![(condition, body)];

        while self.peek_directive()?.as_deref() == Some("elif") {
            self.consume()?;
            self.consume()?;
            let cond = self.parse_expr()?;
            self.end_directive()?;
            branches.push((cond, self.parse_nodes()?));
        }
        let else_body = self.parse_else()?;
        self.expect_closer("if", pos)?;

        Ok(Node::If {
            branches,
            else_body,
            pos,
        })
    }

    fn parse_for(&mut self, pos: Position) -> PResult<Node> {
        let (first, _) = self.expect_ident("loop variable")?;
        let binding = if self.eat(&TokenKind::Comma)? {
            let (second, _) = self.expect_ident("second loop variable")?;
            Binding::Pair(first, second)
        } else {
            Binding::Single(first)
        };
        self.expect(TokenKind::In, "`in`")?;
        let iterable = self.parse_expr()?;
        self.end_directive()?;

        let body = self.parse_nodes()?;
        let else_body = self.parse_else()?;
        self.expect_closer("for", pos)?;

        Ok(Node::For {
            binding,
            iterable,
            body,
            else_body,
            pos,
        })
    }

    fn parse_macro(&mut self, pos: Position) -> PResult<Node> {
        let (name, _) = self.expect_ident("macro name")?;
        self.expect(TokenKind::LParen, "`(`")?;
        let mut params = Vec::new();
        while !self.eat(&TokenKind::RParen)? {
            let (param, _) = self.expect_ident("parameter name")?;
            let default = if self.eat(&TokenKind::Assign)? {
                Some(self.parse_expr()?)
            } else {
                None
            };
            params.push(Param { name: param, default });
            if !self.eat(&TokenKind::Comma)? {
                self.expect(TokenKind::RParen, "`,` or `)`")?;
                break;
            }
        }
        self.end_directive()?;
        let body = self.parse_nodes()?;
        self.expect_closer("macro", pos)?;
        Ok(Node::Macro {
            name,
            params,
            body,
            pos,
        })
    }

    fn parse_call_block(&mut self, pos: Position) -> PResult<Node> {
        let Expr::Call { callee, args } = self.parse_expr()? else {
            return Err(ParseError::NotCallable { pos }.into());
        };
        self.end_directive()?;
        let body = self.parse_nodes()?;
        self.expect_closer("call", pos)?;
        Ok(Node::Call {
            callee: *callee,
            args,
            body,
            pos,
        })
    }

    fn parse_autoescape(&mut self, pos: Position) -> PResult<Node> {
        let mode = match self.peek_kind(0)? {
            Some(TokenKind::DirectiveEnd) | Some(TokenKind::True) => AutoescapeMode::Html,
            Some(TokenKind::False) => AutoescapeMode::Off,
            Some(TokenKind::Str(s)) => match s.to_ascii_lowercase().as_str() {
                "html" | "true" => AutoescapeMode::Html,
                "off" | "none" | "false" => AutoescapeMode::Off,
                _ => return Err(ParseError::InvalidAutoescape { pos }.into()),
            },
            Some(TokenKind::None) => AutoescapeMode::Off,
            _ => return Err(ParseError::InvalidAutoescape { pos }.into()),
        };
        if self.peek_kind(0)? != Some(&TokenKind::DirectiveEnd) {
            self.consume()?;
        }
        self.end_directive()?;
        let body = self.parse_nodes()?;
        self.expect_closer("autoescape", pos)?;
        Ok(Node::Autoescape { mode, body, pos })
    }

    fn parse_filter_chain(&mut self) -> PResult<Vec<FilterCall>> {
        let mut filters = Vec::new();
        loop {
            let (name, _) = self.expect_ident("filter name")?;
            let args = if self.eat(&TokenKind::LParen)? {
                self.parse_args()?
            } else {
                Vec::new()
            };
            filters.push(FilterCall { name, args });
            if !self.eat(&TokenKind::Pipe)? {
                return Ok(filters);
            }
        }
    }

    fn parse_with(&mut self, pos: Position) -> PResult<Node> {
        let mut bindings = Vec::new();
        while let Some(TokenKind::Ident(_)) = self.peek_kind(0)? {
            let (name, _) = self.expect_ident("variable name")?;
            self.expect(TokenKind::Assign, "`=`")?;
            bindings.push((name, self.parse_expr()?));
            if !self.eat(&TokenKind::Comma)? {
                break;
            }
        }
        self.end_directive()?;
        let body = self.parse_nodes()?;
        self.expect_closer("with", pos)?;
        Ok(Node::With { bindings, body, pos })
    }

    // Expressions, loosest binding first.

    fn parse_expr(&mut self) -> PResult<Expr> {
        self.descend()?;
        let expr = self.parse_conditional()?;
        self.depth -= 1;
        Ok(expr)
    }

    fn parse_conditional(&mut self) -> PResult<Expr> {
        let then = self.parse_or()?;
        if !self.eat_word("if")? {
            return Ok(then);
        }
        let cond = self.parse_or()?;
        let otherwise = if self.eat_word("else")? {
            Some(Box::new(self.parse_expr()?))
        } else {
            None
        };
        Ok(Expr::Conditional {
            then: Box::new(then),
            cond: Box::new(cond),
            otherwise,
        })
    }

    /// `if` and `else` are plain identifiers to the lexer.
    fn eat_word(&mut self, word: &str) -> PResult<bool> {
        if matches!(self.peek_kind(0)?, Some(TokenKind::Ident(w)) if w == word) {
            self.consume()?;
            return Ok(true);
        }
        Ok(false)
    }

    fn parse_or(&mut self) -> PResult<Expr> {
        let mark = self.depth;
        let mut lhs = self.parse_and()?;
        while self.eat(&TokenKind::Or)? {
            self.descend()?;
            let rhs = self.parse_and()?;
            lhs = Expr::Binary(BinOp::Or, Box::new(lhs), Box::new(rhs));
        }
        self.depth = mark;
        Ok(lhs)
    }

    fn parse_and(&mut self) -> PResult<Expr> {
        let mark = self.depth;
        let mut lhs = self.parse_comparison()?;
        while self.eat(&TokenKind::And)? {
            self.descend()?;
            let rhs = self.parse_comparison()?;
            lhs = Expr::Binary(BinOp::And, Box::new(lhs), Box::new(rhs));
        }
        self.depth = mark;
        Ok(lhs)
    }

    fn parse_comparison(&mut self) -> PResult<Expr> {
        let mark = self.depth;
        let mut lhs = self.parse_concat()?;
        loop {
            let op = match self.peek_kind(0)?.cloned() {
                Some(TokenKind::EqEq) => BinOp::Eq,
                Some(TokenKind::NotEq) => BinOp::Ne,
                Some(TokenKind::Lt) => BinOp::Lt,
                Some(TokenKind::Gt) => BinOp::Gt,
                Some(TokenKind::Le) => BinOp::Le,
                Some(TokenKind::Ge) => BinOp::Ge,
                Some(TokenKind::In) => BinOp::In,
                Some(TokenKind::Not) => {
                    if self.peek_kind(1)? != Some(&TokenKind::In) {
                        break;
                    }
                    self.consume()?;
                    BinOp::NotIn
                }
                Some(TokenKind::Is) => {
                    self.consume()?;
                    self.descend()?;
                    lhs = self.parse_test(lhs)?;
                    continue;
                }
                _ => break,
            };
            self.consume()?;
            self.descend()?;
            let rhs = self.parse_concat()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        self.depth = mark;
        Ok(lhs)
    }

    /// After `is`: `[not] name[(args)]`.
    fn parse_test(&mut self, base: Expr) -> PResult<Expr> {
        let negated = self.eat(&TokenKind::Not)?;
        let token = self.next("test name")?;
        let name = match token.kind {
            TokenKind::Ident(name) => name,
            // `is none`, `is null`, `is true`
            TokenKind::None | TokenKind::True | TokenKind::False => token.lexeme.to_ascii_lowercase(),
            _ => return Err(unexpected(&token, "test name")),
        };
        let args = if self.eat(&TokenKind::LParen)? {
            self.parse_args()?
        } else {
            Vec::new()
        };
        Ok(Expr::Test {
            base: Box::new(base),
            name,
            args,
            negated,
        })
    }

    fn parse_concat(&mut self) -> PResult<Expr> {
        let mark = self.depth;
        let mut lhs = self.parse_additive()?;
        while self.eat(&TokenKind::Tilde)? {
            self.descend()?;
            let rhs = self.parse_additive()?;
            lhs = Expr::Binary(BinOp::Concat, Box::new(lhs), Box::new(rhs));
        }
        self.depth = mark;
        Ok(lhs)
    }

    fn parse_additive(&mut self) -> PResult<Expr> {
        let mark = self.depth;
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = match self.peek_kind(0)? {
                Some(TokenKind::Plus) => BinOp::Add,
                Some(TokenKind::Minus) => BinOp::Sub,
                _ => break,
            };
            self.consume()?;
            self.descend()?;
            let rhs = self.parse_multiplicative()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        self.depth = mark;
        Ok(lhs)
    }

    fn parse_multiplicative(&mut self) -> PResult<Expr> {
        let mark = self.depth;
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek_kind(0)? {
                Some(TokenKind::Star) => BinOp::Mul,
                Some(TokenKind::Slash) => BinOp::Div,
                Some(TokenKind::SlashSlash) => BinOp::FloorDiv,
                Some(TokenKind::Percent) => BinOp::Rem,
                _ => break,
            };
            self.consume()?;
            self.descend()?;
            let rhs = self.parse_unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        self.depth = mark;
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> PResult<Expr> {
        let op = if self.eat(&TokenKind::Not)? {
            UnaryOp::Not
        } else if self.eat(&TokenKind::Minus)? {
            UnaryOp::Neg
        } else {
            return self.parse_postfix();
        };
        self.descend()?;
        let operand = self.parse_unary()?;
        self.depth -= 1;
        Ok(Expr::Unary(op, Box::new(operand)))
    }

    fn parse_postfix(&mut self) -> PResult<Expr> {
        let mark = self.depth;
        let mut expr = self.parse_primary()?;

        // Handle suffixes: .attr, .0, [key], (args), | filter
        loop {
            if matches!(
                self.peek_kind(0)?,
                Some(TokenKind::Dot | TokenKind::LBracket | TokenKind::LParen | TokenKind::Pipe)
            ) {
                self.descend()?;
            }
            match self.peek_kind(0)? {
                Some(TokenKind::Dot) => {
                    self.consume()?;
                    let token = self.next("attribute name")?;
                    expr = match token.kind {
                        TokenKind::Ident(attr) => property(expr, Expr::string(attr)),
                        TokenKind::Int(i) => property(expr, Expr::Literal(Value::Int(i))),
                        // `items.0.1` arrives as `items`, `.`, `0.1`.
                        TokenKind::Float(_) => {
                            let mut expr = expr;
                            for part in token.lexeme.split('.') {
                                let Ok(i) = part.parse::<i64>() else {
                                    return Err(unexpected(&token, "attribute name"));
                                };
                                expr = property(expr, Expr::Literal(Value::Int(i)));
                            }
                            expr
                        }
                        _ => return Err(unexpected(&token, "attribute name")),
                    };
                }
                Some(TokenKind::LBracket) => {
                    self.consume()?;
                    let key = self.parse_expr()?;
                    self.expect(TokenKind::RBracket, "`]`")?;
                    expr = property(expr, key);
                }
                Some(TokenKind::LParen) => {
                    let open = self.next("`(`")?;
                    if !is_callable(&expr) {
                        return Err(ParseError::NotCallable { pos: open.pos }.into());
                    }
                    let args = self.parse_args()?;
                    expr = Expr::Call {
                        callee: Box::new(expr),
                        args,
                    };
                }
                Some(TokenKind::Pipe) => {
                    self.consume()?;
                    let (name, _) = self.expect_ident("filter name")?;
                    let args = if self.eat(&TokenKind::LParen)? {
                        self.parse_args()?
                    } else {
                        Vec::new()
                    };
                    expr = Expr::Filter {
                        base: Box::new(expr),
                        name,
                        args,
                    };
                }
                _ => {
                    self.depth = mark;
                    return Ok(expr);
                }
            }
        }
    }

    /// Argument list after an opening `(`, through the closing `)`.
    fn parse_args(&mut self) -> PResult<Vec<Expr>> {
        let mut args = Vec::new();
        while !self.eat(&TokenKind::RParen)? {
            args.push(self.parse_expr()?);
            if !self.eat(&TokenKind::Comma)? {
                self.expect(TokenKind::RParen, "`,` or `)`")?;
                break;
            }
        }
        Ok(args)
    }

    fn parse_primary(&mut self) -> PResult<Expr> {
        let token = self.next("expression")?;
        let expr = match token.kind {
            TokenKind::Str(s) => Expr::Literal(Value::String(s)),
            TokenKind::Int(i) => Expr::Literal(Value::Int(i)),
            TokenKind::Float(f) => Expr::Literal(Value::Float(f)),
            TokenKind::True => Expr::Literal(Value::Bool(true)),
            TokenKind::False => Expr::Literal(Value::Bool(false)),
            TokenKind::None => Expr::Literal(Value::Null),
            TokenKind::Ident(name) => Expr::Var(name),
            TokenKind::LParen => {
                let e = self.parse_expr()?;
                self.expect(TokenKind::RParen, "`)`")?;
                e
            }
            TokenKind::LBracket => {
                let mut items = Vec::new();
                while !self.eat(&TokenKind::RBracket)? {
                    items.push(self.parse_expr()?);
                    if !self.eat(&TokenKind::Comma)? {
                        self.expect(TokenKind::RBracket, "`,` or `]`")?;
                        break;
                    }
                }
                Expr::List(items)
            }
            TokenKind::LBrace => {
                let mut entries = Vec::new();
                while !self.eat(&TokenKind::RBrace)? {
                    let key = self.parse_expr()?;
                    self.expect(TokenKind::Colon, "`:`")?;
                    entries.push((key, self.parse_expr()?));
                    if !self.eat(&TokenKind::Comma)? {
                        self.expect(TokenKind::RBrace, "`,` or `}`")?;
                        break;
                    }
                }
                Expr::Dict(entries)
            }
            _ => return Err(unexpected(&token, "expression")),
        };
        Ok(expr)
    }
}

/// Parses a whole template in one go.
pub fn parse(source: &str, syntax: Syntax) -> PResult<(Ast, Syntax)> {
    let mut parser = Parser::new(source, syntax)?;
    let ast = parser.parse()?;
    Ok((ast, parser.syntax()))
}

fn property(base: Expr, key: Expr) -> Expr {
    Expr::Property(Box::new(base), Box::new(key))
}

/// Variables and `base.name` may be called; the runtime decides what
/// the name resolves to.
fn is_callable(expr: &Expr) -> bool {
    match expr {
        Expr::Var(_) => true,
        Expr::Property(_, key) => matches!(**key, Expr::Literal(Value::String(_))),
        _ => false,
    }
}

fn unexpected(token: &Token<'_>, expected: &str) -> Error {
    ParseError::UnexpectedToken {
        expected: expected.to_string(),
        found: token.kind.to_string(),
        pos: token.pos,
    }
    .into()
}

fn lex_error(e: LexError) -> Error {
    match e {
        LexError::UnterminatedString { pos } => ParseError::UnterminatedString { pos }.into(),
        other => other.into(),
    }
}
