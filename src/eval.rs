//! Executes compiled templates.
//!
//! Variables live in an arena of scopes. Each scope links to its parent:
//! another scope, the root context, or nothing at all (macro bodies, which
//! only see their parameters). Scopes are pushed and popped strictly LIFO,
//! so the arena is a stack whose links may skip entries.
//!
//! `break` and `continue` travel back up as [`Flow`] values. Loops consume
//! them; template, macro and `caller()` boundaries reject leftovers.

use std::collections::BTreeMap;
use std::ops::Deref;
use std::rc::Rc;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::ast::{BinOp, Binding, Expr, UnaryOp};
use crate::compiler::{Instr, Macro, Template};
use crate::engine::Engine;
use crate::error::{Error, Position, RenderError};
use crate::filters::escape_html;
use crate::value::{Context, Value};

/// Largest list `range` will build.
const RANGE_LIMIT: usize = 100_000;

/// A template being executed: the one the caller handed in, or one the
/// loader produced along the way.
#[derive(Clone)]
enum TplRef<'e> {
    Borrowed(&'e Template),
    Shared(Arc<Template>),
}

impl Deref for TplRef<'_> {
    type Target = Template;

    fn deref(&self) -> &Template {
        match self {
            TplRef::Borrowed(t) => t,
            TplRef::Shared(t) => t,
        }
    }
}

/// Import aliases visible to one template, by alias.
type Aliases<'e> = FxHashMap<String, Module<'e>>;

/// An imported template together with the aliases its own top-level
/// imports set up. Its macros resolve `alias.name` calls against those.
#[derive(Clone)]
struct Module<'e> {
    tpl: TplRef<'e>,
    imports: Rc<Aliases<'e>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Normal,
    Break(Position),
    Continue(Position),
}

type ScopeId = usize;

#[derive(Debug, Clone, Copy)]
enum Parent {
    Scope(ScopeId),
    Root,
    Isolated,
}

struct Scope {
    vars: FxHashMap<String, Value>,
    parent: Parent,
}

/// The body a macro renders through `caller()`, with the scope, template
/// and import aliases of its call site.
#[derive(Clone)]
struct Caller<'e> {
    body: Arc<Macro>,
    scope: Parent,
    tpl: TplRef<'e>,
    imports: Rc<Aliases<'e>>,
}

pub(crate) struct Evaluator<'e> {
    engine: &'e Engine,
    root: &'e Context,
    scopes: Vec<Scope>,
    current: Option<ScopeId>,
    autoescape: bool,
    /// Most-derived block bodies, by block name.
    overrides: FxHashMap<String, TplRef<'e>>,
    /// Aliases of the template whose code is running. Swapped on entry to
    /// an imported macro; copied on write so nothing leaks back out.
    imports: Rc<Aliases<'e>>,
    /// Paths on the active extends/include/import chain.
    stack: Vec<String>,
    callers: Vec<Caller<'e>>,
    macro_depth: usize,
}

impl<'e> Evaluator<'e> {
    pub fn new(engine: &'e Engine, root: &'e Context) -> Self {
        Self {
            engine,
            root,
            scopes: Vec::new(),
            current: None,
            autoescape: engine.config().autoescape,
            overrides: FxHashMap::default(),
            imports: Rc::default(),
            stack: Vec::new(),
            callers: Vec::new(),
            macro_depth: 0,
        }
    }

    /// Renders `template` into a fresh string. Nothing is returned on error.
    pub fn render(mut self, template: &'e Template) -> Result<String, RenderError> {
        let mut output = String::new();
        if let Some(name) = template.name() {
            self.stack.push(name.to_string());
        }
        self.render_template(TplRef::Borrowed(template), &mut output)?;
        Ok(output)
    }

    // Scopes

    fn push_scope(&mut self, parent: Parent) -> Option<ScopeId> {
        let previous = self.current;
        self.scopes.push(Scope {
            vars: FxHashMap::default(),
            parent,
        });
        self.current = Some(self.scopes.len() - 1);
        previous
    }

    fn pop_scope(&mut self, previous: Option<ScopeId>) {
        self.scopes.pop();
        self.current = previous;
    }

    /// Parent link for a scope nested in the current one.
    fn here(&self) -> Parent {
        self.current.map_or(Parent::Root, Parent::Scope)
    }

    fn set_local(&mut self, name: String, value: Value) {
        match self.current {
            Some(id) => {
                self.scopes[id].vars.insert(name, value);
            }
            // Top-level `let` with no scope yet: open one over the root.
            None => {
                self.push_scope(Parent::Root);
                if let Some(scope) = self.scopes.last_mut() {
                    scope.vars.insert(name, value);
                }
            }
        }
    }

    fn get_var(&self, name: &str) -> Value {
        let mut at = self.here();
        loop {
            match at {
                Parent::Scope(id) => {
                    let scope = &self.scopes[id];
                    if let Some(val) = scope.vars.get(name) {
                        return val.clone();
                    }
                    at = scope.parent;
                }
                Parent::Root => return self.root.get(name).cloned().unwrap_or_default(),
                Parent::Isolated => return Value::Undefined,
            }
        }
    }

    fn is_bound(&self, name: &str) -> bool {
        !self.get_var(name).is_undefined()
    }

    // Templates

    fn render_template(&mut self, tpl: TplRef<'e>, out: &mut String) -> Result<(), RenderError> {
        let Some((path_expr, pos)) = tpl.parent.clone() else {
            let flow = self.exec(&tpl, &tpl.body, out)?;
            return leftover(flow);
        };

        for name in tpl.blocks.keys() {
            self.overrides.entry(name.clone()).or_insert_with(|| tpl.clone());
        }
        // A child contributes its blocks plus top-level assignments and
        // imports; everything else at its top level is dropped.
        let mut scratch = String::new();
        for instr in &tpl.body {
            if matches!(instr, Instr::Let { .. } | Instr::Import { .. }) {
                self.exec(&tpl, std::slice::from_ref(instr), &mut scratch)?;
            }
        }

        let path = self.template_path(&tpl, &path_expr, pos)?;
        let parent = self.enter(&path, pos)?;
        debug!(child = tpl.name().unwrap_or("<inline>"), parent = %path, "extends");
        let result = self.render_template(TplRef::Shared(parent), out);
        self.stack.pop();
        result
    }

    fn template_path(&mut self, tpl: &TplRef<'e>, expr: &Expr, pos: Position) -> Result<String, RenderError> {
        match self.eval(tpl, expr, pos)? {
            Value::String(s) | Value::Safe(s) => Ok(s),
            other => Err(RenderError::Type {
                message: format!("template path must be a string, got {}", other.type_name()),
                pos,
            }),
        }
    }

    /// Loads `path` and pushes it on the active chain. The caller pops it.
    fn enter(&mut self, path: &str, pos: Position) -> Result<Arc<Template>, RenderError> {
        if self.stack.iter().any(|p| p == path) {
            return Err(RenderError::Cycle {
                path: path.to_string(),
                pos,
            });
        }
        if self.stack.len() >= self.engine.max_depth() {
            return Err(RenderError::RecursionLimit {
                limit: self.engine.max_depth(),
                pos,
            });
        }
        let template = self.engine.get_template(path).map_err(|e| match e {
            Error::Load(e) => RenderError::Loader {
                path: path.to_string(),
                message: e.to_string(),
                pos,
            },
            other => RenderError::InvalidTemplate {
                path: path.to_string(),
                message: other.to_string(),
                pos,
            },
        })?;
        self.stack.push(path.to_string());
        Ok(template)
    }

    fn import(&mut self, tpl: &TplRef<'e>, path: &Expr, alias: &str, pos: Position) -> Result<(), RenderError> {
        let module = self.load_module(tpl, path, pos)?;
        trace!(alias, "import");
        Rc::make_mut(&mut self.imports).insert(alias.to_string(), module);
        Ok(())
    }

    /// Loads an imported template and, recursively, its own top-level
    /// imports into a table private to it.
    fn load_module(&mut self, tpl: &TplRef<'e>, path: &Expr, pos: Position) -> Result<Module<'e>, RenderError> {
        let path = self.template_path(tpl, path, pos)?;
        let imported = TplRef::Shared(self.enter(&path, pos)?);
        trace!(path = %path, "load module");
        let mut aliases = Aliases::default();
        let mut result = Ok(());
        for instr in &imported.body {
            if let Instr::Import { path, alias, pos } = instr {
                match self.load_module(&imported, path, *pos) {
                    Ok(module) => {
                        aliases.insert(alias.clone(), module);
                    }
                    Err(e) => {
                        result = Err(e);
                        break;
                    }
                }
            }
        }
        self.stack.pop();
        result?;
        Ok(Module {
            tpl: imported,
            imports: Rc::new(aliases),
        })
    }

    fn include(&mut self, tpl: &TplRef<'e>, path: &Expr, pos: Position, out: &mut String) -> Result<(), RenderError> {
        let path = self.template_path(tpl, path, pos)?;
        let included = self.enter(&path, pos)?;
        trace!(path = %path, "include");
        let overrides = std::mem::take(&mut self.overrides);
        // The included template sees the includer's aliases but its own
        // imports stay with it.
        let imports = Rc::clone(&self.imports);
        let previous = self.push_scope(self.here());
        let result = self.render_template(TplRef::Shared(included), out);
        self.pop_scope(previous);
        self.imports = imports;
        self.overrides = overrides;
        self.stack.pop();
        result
    }

    // Instructions

    fn exec(&mut self, tpl: &TplRef<'e>, instrs: &[Instr], out: &mut String) -> Result<Flow, RenderError> {
        for instr in instrs {
            let flow = self.exec_one(tpl, instr, out)?;
            if flow != Flow::Normal {
                return Ok(flow);
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_one(&mut self, tpl: &TplRef<'e>, instr: &Instr, out: &mut String) -> Result<Flow, RenderError> {
        match instr {
            Instr::Text(s) => out.push_str(s),
            Instr::Print { expr, pos } => {
                let value = self.eval(tpl, expr, *pos)?;
                self.write_value(&value, out);
            }
            Instr::If {
                branches,
                otherwise,
                pos,
            } => {
                for (cond, body) in branches {
                    if self.eval(tpl, cond, *pos)?.is_truthy() {
                        return self.exec(tpl, body, out);
                    }
                }
                if let Some(body) = otherwise {
                    return self.exec(tpl, body, out);
                }
            }
            Instr::For {
                binding,
                iterable,
                body,
                otherwise,
                pos,
            } => return self.exec_for(tpl, binding, iterable, body, otherwise.as_deref(), *pos, out),
            Instr::CallBlock {
                callee,
                args,
                caller,
                pos,
            } => {
                let caller = Caller {
                    body: Arc::clone(caller),
                    scope: self.here(),
                    tpl: tpl.clone(),
                    imports: Rc::clone(&self.imports),
                };
                let value = self.call(tpl, callee, args, Some(caller), *pos)?;
                self.write_value(&value, out);
            }
            Instr::Let { name, expr, pos } => {
                let value = self.eval(tpl, expr, *pos)?;
                self.set_local(name.clone(), value);
            }
            Instr::With { bindings, body, pos } => {
                let mut values = Vec::with_capacity(bindings.len());
                for (name, expr) in bindings {
                    values.push((name.clone(), self.eval(tpl, expr, *pos)?));
                }
                let previous = self.push_scope(self.here());
                for (name, value) in values {
                    self.set_local(name, value);
                }
                let flow = self.exec(tpl, body, out);
                self.pop_scope(previous);
                return flow;
            }
            Instr::Block { name } => {
                let owner = self.overrides.get(name).cloned().unwrap_or_else(|| tpl.clone());
                let Some(body) = owner.blocks.get(name).cloned() else {
                    return Ok(Flow::Normal);
                };
                return self.exec(&owner, &body, out);
            }
            Instr::Include { path, pos } => self.include(tpl, path, *pos, out)?,
            Instr::Import { path, alias, pos } => self.import(tpl, path, alias, *pos)?,
            Instr::Autoescape { enabled, body, pos } => {
                trace!(enabled, at = %pos, "autoescape");
                let saved = std::mem::replace(&mut self.autoescape, *enabled);
                let flow = self.exec(tpl, body, out);
                self.autoescape = saved;
                return flow;
            }
            Instr::Filter { filters, body, pos } => {
                let mut buffer = String::new();
                let flow = self.exec(tpl, body, &mut buffer)?;
                let mut value = Value::Safe(buffer);
                for filter in filters {
                    let args = self.eval_all(tpl, &filter.args, *pos)?;
                    value = self.apply_filter(&filter.name, value, &args, *pos)?;
                }
                self.write_value(&value, out);
                return Ok(flow);
            }
            Instr::Break(pos) => return Ok(Flow::Break(*pos)),
            Instr::Continue(pos) => return Ok(Flow::Continue(*pos)),
        }
        Ok(Flow::Normal)
    }

    #[allow(clippy::too_many_arguments)]
    fn exec_for(
        &mut self,
        tpl: &TplRef<'e>,
        binding: &Binding,
        iterable: &Expr,
        body: &[Instr],
        otherwise: Option<&[Instr]>,
        pos: Position,
        out: &mut String,
    ) -> Result<Flow, RenderError> {
        let items = match self.eval(tpl, iterable, pos)? {
            Value::List(items) => items,
            Value::Map(map) => match binding {
                Binding::Single(_) => map.into_keys().map(Value::String).collect(),
                Binding::Pair(..) => map
                    .into_iter()
                    .map(|(k, v)| Value::List(vec![Value::String(k), v]))
                    .collect(),
            },
            Value::String(s) | Value::Safe(s) => s.chars().map(|c| Value::String(c.to_string())).collect(),
            Value::Undefined | Value::Null => Vec::new(),
            other => {
                return Err(RenderError::Type {
                    message: format!("cannot iterate over {}", other.type_name()),
                    pos,
                })
            }
        };

        if items.is_empty() {
            return match otherwise {
                Some(body) => self.exec(tpl, body, out),
                None => Ok(Flow::Normal),
            };
        }

        let length = items.len();
        for (i, item) in items.into_iter().enumerate() {
            let previous = self.push_scope(self.here());
            let flow = self
                .bind(binding, item, pos)
                .and_then(|()| {
                    self.set_local("loop".to_string(), loop_state(i, length));
                    self.exec(tpl, body, out)
                });
            self.pop_scope(previous);
            if let Flow::Break(_) = flow? {
                break;
            }
        }
        Ok(Flow::Normal)
    }

    fn bind(&mut self, binding: &Binding, item: Value, pos: Position) -> Result<(), RenderError> {
        match binding {
            Binding::Single(name) => self.set_local(name.clone(), item),
            Binding::Pair(first, second) => {
                let Value::List(pair) = item else {
                    return Err(RenderError::Type {
                        message: format!("cannot unpack {} into two names", item.type_name()),
                        pos,
                    });
                };
                if pair.len() != 2 {
                    return Err(RenderError::Type {
                        message: format!("cannot unpack {} items into two names", pair.len()),
                        pos,
                    });
                }
                let mut pair = pair.into_iter();
                self.set_local(first.clone(), pair.next().unwrap_or_default());
                self.set_local(second.clone(), pair.next().unwrap_or_default());
            }
        }
        Ok(())
    }

    fn write_value(&self, value: &Value, out: &mut String) {
        match value {
            Value::Safe(s) => out.push_str(s),
            other if self.autoescape => out.push_str(&escape_html(&other.to_string())),
            other => out.push_str(&other.to_string()),
        }
    }

    // Macros and built-in callables

    fn call(
        &mut self,
        tpl: &TplRef<'e>,
        callee: &Expr,
        args: &[Expr],
        caller: Option<Caller<'e>>,
        pos: Position,
    ) -> Result<Value, RenderError> {
        match callee {
            Expr::Var(name) => {
                if let Some(mac) = tpl.macros.get(name).cloned() {
                    let args = self.eval_all(tpl, args, pos)?;
                    return self.call_macro(tpl, &mac, args, caller, pos);
                }
                let args = self.eval_all(tpl, args, pos)?;
                match name.as_str() {
                    "caller" => self.call_caller(&args, pos),
                    "range" => range(&args).map_err(|message| RenderError::Type { message, pos }),
                    "pairs" => pairs(&args).map_err(|message| RenderError::Type { message, pos }),
                    _ => Err(RenderError::UnknownMacro {
                        name: name.clone(),
                        pos,
                    }),
                }
            }
            Expr::Property(base, key) => {
                let Expr::Literal(Value::String(method)) = key.as_ref() else {
                    return Err(not_callable(pos));
                };
                if let Expr::Var(alias) = base.as_ref() {
                    if !self.is_bound(alias) {
                        if let Some(module) = self.imports.get(alias).cloned() {
                            let Some(mac) = module.tpl.macros.get(method).cloned() else {
                                return Err(RenderError::UnknownMacro {
                                    name: format!("{alias}.{method}"),
                                    pos,
                                });
                            };
                            let args = self.eval_all(tpl, args, pos)?;
                            let saved = std::mem::replace(&mut self.imports, module.imports);
                            let result = self.call_macro(&module.tpl, &mac, args, caller, pos);
                            self.imports = saved;
                            return result;
                        }
                    }
                }
                let target = self.eval(tpl, base, pos)?;
                if !args.is_empty() {
                    return Err(RenderError::Arity {
                        name: method.clone(),
                        expected: 0,
                        given: args.len(),
                        pos,
                    });
                }
                map_view(target, method, pos)
            }
            _ => Err(not_callable(pos)),
        }
    }

    fn call_macro(
        &mut self,
        tpl: &TplRef<'e>,
        mac: &Arc<Macro>,
        args: Vec<Value>,
        caller: Option<Caller<'e>>,
        pos: Position,
    ) -> Result<Value, RenderError> {
        if args.len() > mac.params.len() {
            return Err(RenderError::Arity {
                name: mac.name.clone(),
                expected: mac.params.len(),
                given: args.len(),
                pos,
            });
        }
        if self.macro_depth >= self.engine.max_depth() {
            return Err(RenderError::RecursionLimit {
                limit: self.engine.max_depth(),
                pos,
            });
        }

        trace!(name = %mac.name, defined_at = %mac.pos, depth = self.macro_depth, "macro call");
        self.macro_depth += 1;
        let previous = self.push_scope(Parent::Isolated);
        let has_caller = caller.is_some();
        if let Some(caller) = caller {
            self.callers.push(caller);
        }

        let mut buffer = String::new();
        let result = self.bind_params(tpl, mac, args, pos).and_then(|()| {
            let flow = self.exec(tpl, &mac.body, &mut buffer)?;
            leftover(flow)
        });

        if has_caller {
            self.callers.pop();
        }
        self.pop_scope(previous);
        self.macro_depth -= 1;
        result?;
        Ok(Value::Safe(buffer))
    }

    fn bind_params(&mut self, tpl: &TplRef<'e>, mac: &Macro, args: Vec<Value>, pos: Position) -> Result<(), RenderError> {
        let mut args = args.into_iter();
        for param in &mac.params {
            let value = match (args.next(), &param.default) {
                (Some(value), _) => value,
                // Defaults see the parameters bound before them.
                (None, Some(default)) => self.eval(tpl, default, pos)?,
                (None, None) => Value::Undefined,
            };
            self.set_local(param.name.clone(), value);
        }
        Ok(())
    }

    fn call_caller(&mut self, args: &[Value], pos: Position) -> Result<Value, RenderError> {
        // While the body runs, `caller()` refers to the enclosing call block.
        let Some(caller) = self.callers.pop() else {
            return Err(RenderError::UnknownMacro {
                name: "caller".to_string(),
                pos,
            });
        };
        if !args.is_empty() {
            self.callers.push(caller);
            return Err(RenderError::Arity {
                name: "caller".to_string(),
                expected: 0,
                given: args.len(),
                pos,
            });
        }

        let previous = self.push_scope(caller.scope);
        let saved = std::mem::replace(&mut self.imports, Rc::clone(&caller.imports));
        let mut buffer = String::new();
        let result = self
            .exec(&caller.tpl, &caller.body.body, &mut buffer)
            .and_then(leftover);
        self.imports = saved;
        self.pop_scope(previous);
        self.callers.push(caller);
        result?;
        Ok(Value::Safe(buffer))
    }

    // Expressions

    fn eval_all(&mut self, tpl: &TplRef<'e>, exprs: &[Expr], pos: Position) -> Result<Vec<Value>, RenderError> {
        exprs.iter().map(|e| self.eval(tpl, e, pos)).collect()
    }

    fn eval(&mut self, tpl: &TplRef<'e>, expr: &Expr, pos: Position) -> Result<Value, RenderError> {
        match expr {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::List(items) => Ok(Value::List(self.eval_all(tpl, items, pos)?)),
            Expr::Dict(entries) => {
                let mut map = BTreeMap::new();
                for (k, v) in entries {
                    let key = self.eval(tpl, k, pos)?.to_string();
                    map.insert(key, self.eval(tpl, v, pos)?);
                }
                Ok(Value::Map(map))
            }
            Expr::Var(name) => Ok(self.get_var(name)),
            Expr::Property(base, key) => {
                let base = self.eval(tpl, base, pos)?;
                let key = self.eval(tpl, key, pos)?;
                Ok(base.get_item(&key))
            }
            Expr::Binary(BinOp::And, lhs, rhs) => {
                let lhs = self.eval(tpl, lhs, pos)?;
                if !lhs.is_truthy() {
                    return Ok(lhs);
                }
                self.eval(tpl, rhs, pos)
            }
            Expr::Binary(BinOp::Or, lhs, rhs) => {
                let lhs = self.eval(tpl, lhs, pos)?;
                if lhs.is_truthy() {
                    return Ok(lhs);
                }
                self.eval(tpl, rhs, pos)
            }
            Expr::Binary(op, lhs, rhs) => {
                let lhs = self.eval(tpl, lhs, pos)?;
                let rhs = self.eval(tpl, rhs, pos)?;
                binary(*op, &lhs, &rhs).map_err(|message| RenderError::Type { message, pos })
            }
            Expr::Unary(UnaryOp::Not, operand) => Ok(Value::Bool(!self.eval(tpl, operand, pos)?.is_truthy())),
            Expr::Unary(UnaryOp::Neg, operand) => self
                .eval(tpl, operand, pos)?
                .neg()
                .map_err(|message| RenderError::Type { message, pos }),
            Expr::Filter { base, name, args } => {
                let value = self.eval(tpl, base, pos)?;
                let args = self.eval_all(tpl, args, pos)?;
                self.apply_filter(name, value, &args, pos)
            }
            Expr::Test {
                base,
                name,
                args,
                negated,
            } => {
                let value = self.eval(tpl, base, pos)?;
                let args = self.eval_all(tpl, args, pos)?;
                match self.engine.registry().apply_test(name, &value, &args) {
                    None => Err(RenderError::UnknownTest {
                        name: name.clone(),
                        pos,
                    }),
                    Some(Err(message)) => Err(RenderError::Filter {
                        name: name.clone(),
                        message,
                        pos,
                    }),
                    Some(Ok(passed)) => Ok(Value::Bool(passed != *negated)),
                }
            }
            Expr::Call { callee, args } => self.call(tpl, callee, args, None, pos),
            Expr::Conditional { then, cond, otherwise } => {
                if self.eval(tpl, cond, pos)?.is_truthy() {
                    self.eval(tpl, then, pos)
                } else {
                    match otherwise {
                        Some(e) => self.eval(tpl, e, pos),
                        None => Ok(Value::Undefined),
                    }
                }
            }
        }
    }

    fn apply_filter(&self, name: &str, value: Value, args: &[Value], pos: Position) -> Result<Value, RenderError> {
        match self.engine.registry().apply_filter(name, value, args) {
            None => Err(RenderError::UnknownFilter {
                name: name.to_string(),
                pos,
            }),
            Some(result) => result.map_err(|message| RenderError::Filter {
                name: name.to_string(),
                message,
                pos,
            }),
        }
    }
}

/// Template and macro boundaries: loop control must not escape them.
fn leftover(flow: Flow) -> Result<(), RenderError> {
    match flow {
        Flow::Normal => Ok(()),
        Flow::Break(pos) => Err(RenderError::LoopControlOutsideLoop { keyword: "break", pos }),
        Flow::Continue(pos) => Err(RenderError::LoopControlOutsideLoop {
            keyword: "continue",
            pos,
        }),
    }
}

fn not_callable(pos: Position) -> RenderError {
    RenderError::Type {
        message: "value is not callable".to_string(),
        pos,
    }
}

fn binary(op: BinOp, lhs: &Value, rhs: &Value) -> Result<Value, String> {
    match op {
        BinOp::Add => lhs.add(rhs),
        BinOp::Sub => lhs.sub(rhs),
        BinOp::Mul => lhs.mul(rhs),
        BinOp::Div => lhs.div(rhs),
        BinOp::FloorDiv => lhs.floor_div(rhs),
        BinOp::Rem => lhs.rem(rhs),
        BinOp::Concat => {
            let joined = format!("{lhs}{rhs}");
            Ok(match (lhs, rhs) {
                (Value::Safe(_), Value::Safe(_)) => Value::Safe(joined),
                _ => Value::String(joined),
            })
        }
        BinOp::Eq => Ok(Value::Bool(lhs.loose_eq(rhs))),
        BinOp::Ne => Ok(Value::Bool(!lhs.loose_eq(rhs))),
        BinOp::Lt => Ok(Value::Bool(lhs.compare(rhs)?.is_lt())),
        BinOp::Gt => Ok(Value::Bool(lhs.compare(rhs)?.is_gt())),
        BinOp::Le => Ok(Value::Bool(lhs.compare(rhs)?.is_le())),
        BinOp::Ge => Ok(Value::Bool(lhs.compare(rhs)?.is_ge())),
        BinOp::In => Ok(Value::Bool(rhs.contains(lhs)?)),
        BinOp::NotIn => Ok(Value::Bool(!rhs.contains(lhs)?)),
        // Short-circuiting operators never reach here.
        BinOp::And => Ok(Value::Bool(lhs.is_truthy() && rhs.is_truthy())),
        BinOp::Or => Ok(Value::Bool(lhs.is_truthy() || rhs.is_truthy())),
    }
}

fn loop_state(i: usize, length: usize) -> Value {
    let int = |n: usize| Value::Int(i64::try_from(n).unwrap_or(i64::MAX));
    let mut state = BTreeMap::new();
    state.insert("index".to_string(), int(i + 1));
    state.insert("index0".to_string(), int(i));
    state.insert("first".to_string(), Value::Bool(i == 0));
    state.insert("last".to_string(), Value::Bool(i + 1 == length));
    state.insert("length".to_string(), int(length));
    state.insert("revindex".to_string(), int(length - i));
    state.insert("revindex0".to_string(), int(length - i - 1));
    Value::Map(state)
}

/// `range(stop)`, `range(start, stop)`, `range(start, stop, step)`.
fn range(args: &[Value]) -> Result<Value, String> {
    let ints = args
        .iter()
        .map(|a| a.as_i64().ok_or_else(|| format!("range expects integers, got {}", a.type_name())))
        .collect::<Result<Vec<_>, _>>()?;
    let (start, stop, step) = match ints[..] {
        [stop] => (0, stop, 1),
        [start, stop] => (start, stop, 1),
        [start, stop, step] => (start, stop, step),
        _ => return Err(format!("range takes 1 to 3 arguments, {} given", args.len())),
    };
    if step == 0 {
        return Err("range step must not be zero".to_string());
    }

    let span = if step > 0 {
        i128::from(stop) - i128::from(start)
    } else {
        i128::from(start) - i128::from(stop)
    };
    let count = if span <= 0 {
        0
    } else {
        let step = i128::from(step).abs();
        (span + step - 1) / step
    };
    if count > RANGE_LIMIT as i128 {
        return Err(format!("range of {count} items exceeds the limit of {RANGE_LIMIT}"));
    }
    let items = (0..count)
        .map(|k| Value::Int((i128::from(start) + k * i128::from(step)) as i64))
        .collect();
    Ok(Value::List(items))
}

/// `pairs(map)` lists `[key, value]`; `pairs(list)` lists `[index, item]`.
fn pairs(args: &[Value]) -> Result<Value, String> {
    match args {
        [Value::Map(map)] => Ok(Value::List(
            map.iter()
                .map(|(k, v)| Value::List(vec![Value::String(k.clone()), v.clone()]))
                .collect(),
        )),
        [Value::List(items)] => Ok(Value::List(
            items
                .iter()
                .enumerate()
                .map(|(i, v)| Value::List(vec![Value::from(i), v.clone()]))
                .collect(),
        )),
        [Value::Undefined | Value::Null] => Ok(Value::List(Vec::new())),
        [other] => Err(format!("pairs expects a map or list, got {}", other.type_name())),
        _ => Err(format!("pairs takes 1 argument, {} given", args.len())),
    }
}

/// `map.items()`, `map.keys()`, `map.values()`.
fn map_view(target: Value, method: &str, pos: Position) -> Result<Value, RenderError> {
    let map = match target {
        Value::Map(map) => map,
        Value::Undefined | Value::Null => BTreeMap::new(),
        other => {
            return Err(RenderError::Type {
                message: format!("{} has no method `{method}`", other.type_name()),
                pos,
            })
        }
    };
    let items = match method {
        "items" => map
            .into_iter()
            .map(|(k, v)| Value::List(vec![Value::String(k), v]))
            .collect(),
        "keys" => map.into_keys().map(Value::String).collect(),
        "values" => map.into_values().collect(),
        _ => {
            return Err(RenderError::UnknownMacro {
                name: method.to_string(),
                pos,
            })
        }
    };
    Ok(Value::List(items))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::lexer::Syntax;
    use pretty_assertions::assert_eq;

    fn render(src: &str, ctx: &Context) -> Result<String, RenderError> {
        let engine = Engine::new();
        let template = engine.compile_with(src, Syntax::Auto).unwrap();
        Evaluator::new(&engine, ctx).render(&template)
    }

    fn ok(src: &str, ctx: &Context) -> String {
        render(src, ctx).unwrap()
    }

    #[test]
    fn loop_state_is_visible_only_inside_the_body() {
        let ctx = Context::new().with("xs", vec!["a", "b", "c"]);
        assert_eq!(
            ok("{% for x in xs %}{{ loop.index }}/{{ loop.length }}{% if loop.last %}!{% endif %} {% endfor %}[{{ loop }}]", &ctx),
            "1/3 2/3 3/3! []"
        );
    }

    #[test]
    fn nested_loops_shadow_loop_state() {
        let ctx = Context::new().with("xs", vec![1, 2]);
        assert_eq!(
            ok("{% for a in xs %}{% for b in xs %}{{ loop.index0 }}{% endfor %}{{ loop.index }};{% endfor %}", &ctx),
            "011;012;"
        );
    }

    #[test]
    fn let_is_scoped_to_the_iteration() {
        let ctx = Context::new().with("xs", vec![1, 2]);
        assert_eq!(ok("@let y = 0\n@for x in xs\n@let y = x\n$y\n@end\n$y\n", &ctx), "1\n2\n0\n");
    }

    #[test]
    fn break_and_continue() {
        let ctx = Context::new().with("xs", vec![1, 2, 3, 4, 5]);
        let src = "@for i in xs\n@if i == 3\n@break\n@end\n$i\n@end\n";
        assert_eq!(ok(src, &ctx), "1\n2\n");
        let src = "@for i in xs\n@if i == 3\n@continue\n@end\n$i\n@end\n";
        assert_eq!(ok(src, &ctx), "1\n2\n4\n5\n");
    }

    #[test]
    fn loop_control_outside_a_loop_is_an_error() {
        let err = render("a\n@break\n", &Context::new()).unwrap_err();
        assert!(matches!(
            err,
            RenderError::LoopControlOutsideLoop { keyword: "break", pos } if pos.line == 2
        ));
    }

    #[test]
    fn loop_control_does_not_cross_macro_boundaries() {
        let src = "@macro m()\n@continue\n@end\n@for x in [1]\n@m()\n@end\n";
        assert!(matches!(
            render(src, &Context::new()),
            Err(RenderError::LoopControlOutsideLoop { keyword: "continue", .. })
        ));
    }

    #[test]
    fn macros_are_isolated_from_the_caller() {
        let ctx = Context::new().with("secret", "s3");
        let src = "@macro show(x)\n[$x|$secret]\n@end\n@show(1)\n";
        assert_eq!(ok(src, &ctx), "[1|]\n\n");
    }

    #[test]
    fn macro_defaults_and_arity() {
        let src = "{% macro m(a, b=a ~ '!') %}{{ a }}{{ b }}{% endmacro %}{{ m('x') }} {{ m('x', 'y') }}";
        assert_eq!(ok(src, &Context::new()), "xx! xy");
        assert!(matches!(
            render("{% macro m(a) %}{% endmacro %}{{ m(1, 2) }}", &Context::new()),
            Err(RenderError::Arity { expected: 1, given: 2, .. })
        ));
    }

    #[test]
    fn call_blocks_render_the_caller_in_the_call_site_scope() {
        let ctx = Context::new().with("who", "Bo");
        let src = "{% macro box() %}[{{ caller() }}]{% endmacro %}{% call box() %}hi {{ who }}{% endcall %}";
        assert_eq!(ok(src, &ctx), "[hi Bo]");
    }

    #[test]
    fn recursion_is_bounded() {
        let src = "{% macro f(n) %}{{ f(n + 1) }}{% endmacro %}{{ f(0) }}";
        assert!(matches!(
            render(src, &Context::new()),
            Err(RenderError::RecursionLimit { limit: 64, .. })
        ));
    }

    #[test]
    fn with_blocks_scope_their_bindings() {
        let ctx = Context::new().with("a", 1);
        assert_eq!(ok("{% with a = 2, b = a %}{{ a }}{{ b }}{% endwith %}{{ a }}{{ b }}", &ctx), "211");
    }

    #[test]
    fn builtin_callables() {
        let ctx = Context::new().with("m", Value::from_serialize(&serde_json::json!({"b": 2, "a": 1})).unwrap());
        assert_eq!(ok("{{ range(3) }} {{ range(5, 0, -2) }}", &ctx), "[0,1,2] [5,3,1]");
        assert_eq!(ok("{% for k, v in pairs(m) %}{{ k }}={{ v }};{% endfor %}", &ctx), "a=1;b=2;");
        assert_eq!(ok("{{ m.keys() }} {{ m.values() }}", &ctx), "[\"a\",\"b\"] [1,2]");
        assert!(matches!(
            render("{{ range(1000000) }}", &ctx),
            Err(RenderError::Type { .. })
        ));
    }

    #[test]
    fn and_or_yield_the_deciding_operand() {
        let ctx = Context::new().with("name", "");
        assert_eq!(ok("{{ name or 'anon' }} {{ 'x' and 2 }} {{ 0 and 1 }}", &ctx), "anon 2 0");
    }

    #[test]
    fn autoescape_blocks_toggle_escaping() {
        let ctx = Context::new().with("x", "<b>");
        assert_eq!(
            ok("{{ x }}{% autoescape true %}{{ x }}{{ x | safe }}{% endautoescape %}", &ctx),
            "<b>&lt;b&gt;<b>"
        );
    }

    #[test]
    fn filter_blocks_transform_their_output() {
        let ctx = Context::new().with("n", "bo");
        assert_eq!(ok("@filter upper | replace('O', '0')\nhi $n\n@end\n", &ctx), "HI B0\n");
    }

    #[test]
    fn type_errors_carry_the_position() {
        let ctx = Context::new().with("n", 1);
        let err = render("line\n  ${ n - 'a' }", &ctx).unwrap_err();
        assert!(matches!(err, RenderError::Type { pos, .. } if pos.line == 2));
    }
}
