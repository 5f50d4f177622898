//! Lowers a parsed AST into an immutable, reusable [`Template`].
//!
//! Compilation hoists macro and block definitions into lookup tables,
//! merges adjacent literal text, drops comments and runs the static checks
//! (filter and test names, macro signatures, `extends` placement). No I/O
//! happens here; `extends`, `include` and `import` resolve at render time.

use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use crate::ast::{AutoescapeMode, Ast, Binding, Expr, FilterCall, Node, Param};
use crate::error::{CompileError, Position};
use crate::filters::FilterRegistry;
use crate::lexer::Syntax;

/// Executable form of a template node.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Instr {
    Text(String),
    Print {
        expr: Expr,
        pos: Position,
    },
    If {
        branches: Vec<(Expr, Vec<Instr>)>,
        otherwise: Option<Vec<Instr>>,
        pos: Position,
    },
    For {
        binding: Binding,
        iterable: Expr,
        body: Vec<Instr>,
        otherwise: Option<Vec<Instr>>,
        pos: Position,
    },
    /// `call m(args)`; the body becomes the macro's `caller()`.
    CallBlock {
        callee: Expr,
        args: Vec<Expr>,
        caller: Arc<Macro>,
        pos: Position,
    },
    Let {
        name: String,
        expr: Expr,
        pos: Position,
    },
    With {
        bindings: Vec<(String, Expr)>,
        body: Vec<Instr>,
        pos: Position,
    },
    /// Placeholder; the body lives in the block table so children can
    /// override it.
    Block {
        name: String,
    },
    Include {
        path: Expr,
        pos: Position,
    },
    Import {
        path: Expr,
        alias: String,
        pos: Position,
    },
    Autoescape {
        enabled: bool,
        body: Vec<Instr>,
        pos: Position,
    },
    Filter {
        filters: Vec<FilterCall>,
        body: Vec<Instr>,
        pos: Position,
    },
    Break(Position),
    Continue(Position),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Macro {
    pub name: String,
    pub params: Vec<Param>,
    pub body: Vec<Instr>,
    pub pos: Position,
}

/// A compiled template. Immutable, `Send + Sync`, and independent of the
/// source text it came from.
#[derive(Debug, Clone)]
pub struct Template {
    pub(crate) name: Option<String>,
    pub(crate) syntax: Syntax,
    pub(crate) body: Vec<Instr>,
    pub(crate) macros: FxHashMap<String, Arc<Macro>>,
    pub(crate) blocks: FxHashMap<String, Arc<Vec<Instr>>>,
    pub(crate) parent: Option<(Expr, Position)>,
}

impl Template {
    /// Name the template was loaded or compiled under, if any.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// The concrete syntax the source was written in.
    pub fn syntax(&self) -> Syntax {
        self.syntax
    }

    /// Macros defined in this template, sorted.
    pub fn macro_names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.macros.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Blocks defined in this template, sorted.
    pub fn block_names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.blocks.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Whether the template `extends` another one.
    pub fn has_parent(&self) -> bool {
        self.parent.is_some()
    }

    /// Renders with the default engine: built-in filters, no loader, no
    /// autoescaping. Use [`Engine::render`](crate::Engine::render) for
    /// anything else.
    pub fn render(&self, context: &crate::Context) -> crate::Result<String> {
        crate::engine::default_engine().render(self, context)
    }
}

/// Compiles a parsed template against the filters and tests in `registry`.
#[tracing::instrument(level = "debug", skip_all, fields(name = name.as_deref().unwrap_or("<inline>"), nodes = ast.len()))]
pub(crate) fn compile(
    ast: Ast,
    syntax: Syntax,
    name: Option<String>,
    registry: &FilterRegistry,
) -> Result<Template, CompileError> {
    let mut compiler = Compiler {
        registry,
        macros: FxHashMap::default(),
        blocks: FxHashMap::default(),
        parent: None,
    };
    let body = compiler.compile_nodes(ast, true)?;
    debug!(
        macros = compiler.macros.len(),
        blocks = compiler.blocks.len(),
        extends = compiler.parent.is_some(),
        "compiled template"
    );
    Ok(Template {
        name,
        syntax,
        body,
        macros: compiler.macros,
        blocks: compiler.blocks,
        parent: compiler.parent,
    })
}

struct Compiler<'r> {
    registry: &'r FilterRegistry,
    macros: FxHashMap<String, Arc<Macro>>,
    blocks: FxHashMap<String, Arc<Vec<Instr>>>,
    parent: Option<(Expr, Position)>,
}

impl Compiler<'_> {
    fn compile_nodes(&mut self, nodes: Vec<Node>, top_level: bool) -> Result<Vec<Instr>, CompileError> {
        let mut out = Vec::with_capacity(nodes.len());
        for node in nodes {
            match node {
                Node::Text(s) | Node::Raw(s) => push_text(&mut out, s),
                Node::Comment => {}
                Node::Interpolation { expr, pos } => {
                    self.check_expr(&expr, pos)?;
                    out.push(Instr::Print { expr, pos });
                }
                Node::If {
                    branches,
                    else_body,
                    pos,
                } => {
                    let mut compiled = Vec::with_capacity(branches.len());
                    for (cond, body) in branches {
                        self.check_expr(&cond, pos)?;
                        compiled.push((cond, self.compile_nodes(body, false)?));
                    }
                    out.push(Instr::If {
                        branches: compiled,
                        otherwise: self.compile_optional(else_body)?,
                        pos,
                    });
                }
                Node::For {
                    binding,
                    iterable,
                    body,
                    else_body,
                    pos,
                } => {
                    self.check_expr(&iterable, pos)?;
                    out.push(Instr::For {
                        binding,
                        iterable,
                        body: self.compile_nodes(body, false)?,
                        otherwise: self.compile_optional(else_body)?,
                        pos,
                    });
                }
                Node::Macro {
                    name,
                    params,
                    body,
                    pos,
                } => {
                    let compiled = self.compile_macro(name, params, body, pos)?;
                    if self.macros.contains_key(&compiled.name) {
                        return Err(CompileError::DuplicateMacro {
                            name: compiled.name,
                            pos,
                        });
                    }
                    self.macros.insert(compiled.name.clone(), Arc::new(compiled));
                }
                Node::Call {
                    callee,
                    args,
                    body,
                    pos,
                } => {
                    self.check_expr(&callee, pos)?;
                    self.check_exprs(&args, pos)?;
                    let caller = Macro {
                        name: "caller".to_string(),
                        params: Vec::new(),
                        body: self.compile_nodes(body, false)?,
                        pos,
                    };
                    out.push(Instr::CallBlock {
                        callee,
                        args,
                        caller: Arc::new(caller),
                        pos,
                    });
                }
                Node::Let { name, expr, pos } => {
                    self.check_expr(&expr, pos)?;
                    out.push(Instr::Let { name, expr, pos });
                }
                Node::With { bindings, body, pos } => {
                    for (_, expr) in &bindings {
                        self.check_expr(expr, pos)?;
                    }
                    out.push(Instr::With {
                        bindings,
                        body: self.compile_nodes(body, false)?,
                        pos,
                    });
                }
                Node::Block { name, body, pos } => {
                    let body = self.compile_nodes(body, false)?;
                    if self.blocks.contains_key(&name) {
                        return Err(CompileError::DuplicateBlock { name, pos });
                    }
                    self.blocks.insert(name.clone(), Arc::new(body));
                    out.push(Instr::Block { name });
                }
                Node::Extends { path, pos } => {
                    if !top_level || self.parent.is_some() {
                        return Err(CompileError::MisplacedExtends { pos });
                    }
                    self.check_expr(&path, pos)?;
                    self.parent = Some((path, pos));
                }
                Node::Include { path, pos } => {
                    self.check_expr(&path, pos)?;
                    out.push(Instr::Include { path, pos });
                }
                Node::Import { path, alias, pos } => {
                    self.check_expr(&path, pos)?;
                    out.push(Instr::Import { path, alias, pos });
                }
                Node::Autoescape { mode, body, pos } => out.push(Instr::Autoescape {
                    enabled: mode == AutoescapeMode::Html,
                    body: self.compile_nodes(body, false)?,
                    pos,
                }),
                Node::FilterBlock { filters, body, pos } => {
                    for filter in &filters {
                        self.check_filter(&filter.name, pos)?;
                        self.check_exprs(&filter.args, pos)?;
                    }
                    out.push(Instr::Filter {
                        filters,
                        body: self.compile_nodes(body, false)?,
                        pos,
                    });
                }
                Node::Break(pos) => out.push(Instr::Break(pos)),
                Node::Continue(pos) => out.push(Instr::Continue(pos)),
            }
        }
        Ok(out)
    }

    fn compile_optional(&mut self, nodes: Option<Vec<Node>>) -> Result<Option<Vec<Instr>>, CompileError> {
        nodes.map(|nodes| self.compile_nodes(nodes, false)).transpose()
    }

    fn compile_macro(
        &mut self,
        name: String,
        params: Vec<Param>,
        body: Vec<Node>,
        pos: Position,
    ) -> Result<Macro, CompileError> {
        let mut seen = FxHashSet::default();
        let mut defaulted = false;
        for param in &params {
            if !seen.insert(param.name.as_str()) {
                return Err(CompileError::DuplicateParameter {
                    macro_name: name,
                    param: param.name.clone(),
                    pos,
                });
            }
            match &param.default {
                Some(default) => {
                    self.check_expr(default, pos)?;
                    defaulted = true;
                }
                None if defaulted => {
                    return Err(CompileError::RequiredAfterDefault {
                        macro_name: name,
                        param: param.name.clone(),
                        pos,
                    });
                }
                None => {}
            }
        }
        let body = self.compile_nodes(body, false)?;
        Ok(Macro {
            name,
            params,
            body,
            pos,
        })
    }

    fn check_exprs(&self, exprs: &[Expr], pos: Position) -> Result<(), CompileError> {
        exprs.iter().try_for_each(|e| self.check_expr(e, pos))
    }

    fn check_filter(&self, name: &str, pos: Position) -> Result<(), CompileError> {
        if self.registry.has_filter(name) {
            Ok(())
        } else {
            Err(CompileError::UnknownFilter {
                name: name.to_string(),
                pos,
            })
        }
    }

    /// Checks every filter and test name used in `expr`.
    fn check_expr(&self, expr: &Expr, pos: Position) -> Result<(), CompileError> {
        match expr {
            Expr::Literal(_) | Expr::Var(_) => Ok(()),
            Expr::List(items) => self.check_exprs(items, pos),
            Expr::Dict(entries) => entries.iter().try_for_each(|(k, v)| {
                self.check_expr(k, pos)?;
                self.check_expr(v, pos)
            }),
            Expr::Property(base, key) | Expr::Binary(_, base, key) => {
                self.check_expr(base, pos)?;
                self.check_expr(key, pos)
            }
            Expr::Unary(_, operand) => self.check_expr(operand, pos),
            Expr::Filter { base, name, args } => {
                self.check_filter(name, pos)?;
                self.check_expr(base, pos)?;
                self.check_exprs(args, pos)
            }
            Expr::Test { base, name, args, .. } => {
                if !self.registry.has_test(name) {
                    return Err(CompileError::UnknownTest {
                        name: name.clone(),
                        pos,
                    });
                }
                self.check_expr(base, pos)?;
                self.check_exprs(args, pos)
            }
            Expr::Call { callee, args } => {
                self.check_expr(callee, pos)?;
                self.check_exprs(args, pos)
            }
            Expr::Conditional { then, cond, otherwise } => {
                self.check_expr(then, pos)?;
                self.check_expr(cond, pos)?;
                otherwise.as_deref().map_or(Ok(()), |e| self.check_expr(e, pos))
            }
        }
    }
}

/// Appends literal text, merging with a preceding text instruction.
fn push_text(out: &mut Vec<Instr>, text: String) {
    if text.is_empty() {
        return;
    }
    if let Some(Instr::Text(last)) = out.last_mut() {
        last.push_str(&text);
    } else {
        out.push(Instr::Text(text));
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::parser::parse;
    use pretty_assertions::assert_eq;

    fn compile_src(src: &str, syntax: Syntax) -> Result<Template, CompileError> {
        let (ast, syntax) = parse(src, syntax).unwrap();
        compile(ast, syntax, None, &FilterRegistry::new())
    }

    #[test]
    fn text_merges_and_comments_vanish() {
        let tpl = compile_src("a{# x #}b{% raw %}{{ c }}{% endraw %}", Syntax::Jinja).unwrap();
        assert_eq!(tpl.body, vec![Instr::Text("ab{{ c }}".into())]);
    }

    #[test]
    fn macros_are_hoisted_out_of_the_body() {
        let tpl = compile_src("@macro a()\nA\n@end\n@if x\n@macro b(n)\nB\n@end\n@end\n", Syntax::Native).unwrap();
        assert_eq!(tpl.macro_names(), vec!["a", "b"]);
        assert!(matches!(&tpl.body[..], [Instr::If { .. }]));
    }

    #[test]
    fn blocks_leave_a_placeholder() {
        let tpl = compile_src("<{% block title %}T{% endblock %}>", Syntax::Jinja).unwrap();
        assert_eq!(tpl.block_names(), vec!["title"]);
        assert_eq!(
            tpl.body,
            vec![
                Instr::Text("<".into()),
                Instr::Block { name: "title".into() },
                Instr::Text(">".into()),
            ]
        );
    }

    #[test]
    fn unknown_filter_and_test_names() {
        assert!(matches!(
            compile_src("${ x | shout }", Syntax::Native),
            Err(CompileError::UnknownFilter { ref name, .. }) if name == "shout"
        ));
        assert!(matches!(
            compile_src("{% if x is prime %}{% endif %}", Syntax::Jinja),
            Err(CompileError::UnknownTest { ref name, .. }) if name == "prime"
        ));
    }

    #[test]
    fn duplicate_definitions() {
        assert!(matches!(
            compile_src("@macro a()\n@end\n@macro a()\n@end\n", Syntax::Native),
            Err(CompileError::DuplicateMacro { .. })
        ));
        assert!(matches!(
            compile_src("{% block b %}{% endblock %}{% block b %}{% endblock %}", Syntax::Jinja),
            Err(CompileError::DuplicateBlock { .. })
        ));
    }

    #[test]
    fn macro_signatures_are_validated() {
        assert!(matches!(
            compile_src("@macro m(a, a)\n@end\n", Syntax::Native),
            Err(CompileError::DuplicateParameter { .. })
        ));
        assert!(matches!(
            compile_src("@macro m(a = 1, b)\n@end\n", Syntax::Native),
            Err(CompileError::RequiredAfterDefault { ref param, .. }) if param == "b"
        ));
    }

    #[test]
    fn extends_must_be_top_level_and_single() {
        assert!(compile_src("{% extends 'base' %}", Syntax::Jinja).unwrap().has_parent());
        assert!(matches!(
            compile_src("{% extends 'a' %}{% extends 'b' %}", Syntax::Jinja),
            Err(CompileError::MisplacedExtends { .. })
        ));
        assert!(matches!(
            compile_src("{% if x %}{% extends 'a' %}{% endif %}", Syntax::Jinja),
            Err(CompileError::MisplacedExtends { .. })
        ));
    }

    #[test]
    fn templates_are_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Template>();
    }
}
