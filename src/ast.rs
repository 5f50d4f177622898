use crate::error::Position;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Rem,
    Concat, // ~
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    In,
    NotIn,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    List(Vec<Expr>),
    Dict(Vec<(Expr, Expr)>),
    Var(String),
    Property(Box<Expr>, Box<Expr>), // foo.bar, foo['bar'], foo[0]
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Unary(UnaryOp, Box<Expr>),
    Filter {
        base: Box<Expr>,
        name: String,
        args: Vec<Expr>,
    },
    Test {
        base: Box<Expr>,
        name: String,
        args: Vec<Expr>,
        negated: bool,
    },
    Call {
        callee: Box<Expr>, // Var(name) or Property(Var(alias), name)
        args: Vec<Expr>,
    },
    Conditional {
        then: Box<Expr>,
        cond: Box<Expr>,
        otherwise: Option<Box<Expr>>,
    },
}

impl Expr {
    pub fn string(s: impl Into<String>) -> Self {
        Expr::Literal(Value::String(s.into()))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Binding {
    Single(String),
    Pair(String, String), // for key, value in ...
}

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub default: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FilterCall {
    pub name: String,
    pub args: Vec<Expr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoescapeMode {
    Html,
    Off,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Text(String),
    Interpolation {
        expr: Expr,
        pos: Position,
    },
    If {
        branches: Vec<(Expr, Vec<Node>)>, // if and elifs, in order
        else_body: Option<Vec<Node>>,
        pos: Position,
    },
    For {
        binding: Binding,
        iterable: Expr,
        body: Vec<Node>,
        else_body: Option<Vec<Node>>,
        pos: Position,
    },
    Macro {
        name: String,
        params: Vec<Param>,
        body: Vec<Node>,
        pos: Position,
    },
    Call {
        callee: Expr,
        args: Vec<Expr>,
        body: Vec<Node>, // rendered by the macro through `caller()`
        pos: Position,
    },
    Let {
        name: String,
        expr: Expr,
        pos: Position,
    },
    Block {
        name: String,
        body: Vec<Node>,
        pos: Position,
    },
    Extends {
        path: Expr,
        pos: Position,
    },
    Import {
        path: Expr,
        alias: String,
        pos: Position,
    },
    Include {
        path: Expr,
        pos: Position,
    },
    Autoescape {
        mode: AutoescapeMode,
        body: Vec<Node>,
        pos: Position,
    },
    FilterBlock {
        filters: Vec<FilterCall>,
        body: Vec<Node>,
        pos: Position,
    },
    Raw(String),
    Comment,
    Break(Position),
    Continue(Position),
    With {
        bindings: Vec<(String, Expr)>,
        body: Vec<Node>,
        pos: Position,
    },
}

pub type Ast = Vec<Node>;
