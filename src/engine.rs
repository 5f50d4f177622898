//! The host embedding surface: configuration, filters, loader and the
//! compiled-template cache.

use std::collections::VecDeque;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::compiler::{self, Template};
use crate::error::{LoadError, Result};
use crate::eval::Evaluator;
use crate::filters::FilterRegistry;
use crate::lexer::Syntax;
use crate::loader::Loader;
use crate::parser;
use crate::value::{Context, Value};

/// Engine settings. Every field has a default, so partial JSON works.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Syntax used when none is given explicitly.
    pub syntax: Syntax,
    /// HTML-escape interpolated values unless they are marked safe.
    pub autoescape: bool,
    /// Deepest allowed chain of macro calls, or of
    /// `extends`/`include`/`import`.
    pub max_depth: usize,
    /// Compiled templates kept by [`Engine::get_template`]; 0 disables
    /// caching.
    pub cache_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            syntax: Syntax::Auto,
            autoescape: false,
            max_depth: 64,
            cache_size: 400,
        }
    }
}

impl Config {
    pub fn from_json(json: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[derive(Default)]
struct TemplateCache {
    entries: FxHashMap<String, Arc<Template>>,
    /// Insertion order, oldest first.
    order: VecDeque<String>,
}

impl TemplateCache {
    fn insert(&mut self, name: String, template: Arc<Template>, capacity: usize) {
        if capacity == 0 {
            return;
        }
        while self.order.len() >= capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
        if self.entries.insert(name.clone(), template).is_none() {
            self.order.push_back(name);
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}

/// Compiles and renders templates with one configuration.
///
/// An `Engine` is `Send + Sync`; share it behind an `Arc` to render from
/// several threads.
pub struct Engine {
    config: Config,
    registry: FilterRegistry,
    loader: Option<Arc<dyn Loader>>,
    cache: RwLock<TemplateCache>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("loader", &self.loader.is_some())
            .field("cached", &self.cache.read().entries.len())
            .finish()
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        Self {
            config,
            registry: FilterRegistry::new(),
            loader: None,
            cache: RwLock::new(TemplateCache::default()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &FilterRegistry {
        &self.registry
    }

    /// Compiles `source` in the configured syntax.
    pub fn compile(&self, source: &str) -> Result<Template> {
        self.compile_inner(source, self.config.syntax, None)
    }

    pub fn compile_with(&self, source: &str, syntax: Syntax) -> Result<Template> {
        self.compile_inner(source, syntax, None)
    }

    /// Compiles `source` under `name`, which is what cycle detection and
    /// error messages refer to.
    pub fn compile_named(&self, name: &str, source: &str) -> Result<Template> {
        self.compile_inner(source, self.config.syntax, Some(name.to_string()))
    }

    #[tracing::instrument(level = "debug", skip_all, fields(name = name.as_deref().unwrap_or("<inline>"), len = source.len()))]
    fn compile_inner(&self, source: &str, syntax: Syntax, name: Option<String>) -> Result<Template> {
        let (ast, resolved) = parser::parse(source, syntax)?;
        debug!(requested = %syntax, resolved = %resolved, "syntax resolved");
        Ok(compiler::compile(ast, resolved, name, &self.registry)?)
    }

    /// Loads, compiles and caches the template at `name` through the
    /// configured loader.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn get_template(&self, name: &str) -> Result<Arc<Template>> {
        if let Some(hit) = self.cache.read().entries.get(name) {
            trace!("template cache hit");
            return Ok(Arc::clone(hit));
        }
        let loader = self.loader.as_ref().ok_or_else(|| LoadError::NoLoader(name.to_string()))?;
        let source = loader.load(name)?;
        let template = Arc::new(self.compile_named(name, &source)?);
        self.cache
            .write()
            .insert(name.to_string(), Arc::clone(&template), self.config.cache_size);
        Ok(template)
    }

    /// Renders a compiled template against `context`.
    #[tracing::instrument(level = "debug", skip_all, fields(name = template.name().unwrap_or("<inline>")))]
    pub fn render(&self, template: &Template, context: &Context) -> Result<String> {
        Ok(Evaluator::new(self, context).render(template)?)
    }

    /// Compiles and renders in one step.
    pub fn render_str(&self, source: &str, context: &Context) -> Result<String> {
        let template = self.compile(source)?;
        self.render(&template, context)
    }

    /// Loads the template at `name` and renders it.
    pub fn render_template(&self, name: &str, context: &Context) -> Result<String> {
        let template = self.get_template(name)?;
        self.render(&template, context)
    }

    /// Adds or replaces a filter. Templates compiled earlier keep working
    /// and see the new filter when rendered by this engine.
    pub fn register_filter<F>(&mut self, name: impl Into<String>, func: F)
    where
        F: Fn(Value, &[Value]) -> std::result::Result<Value, String> + Send + Sync + 'static,
    {
        self.registry.register_filter(name, func);
    }

    pub fn register_test<F>(&mut self, name: impl Into<String>, func: F)
    where
        F: Fn(&Value, &[Value]) -> std::result::Result<bool, String> + Send + Sync + 'static,
    {
        self.registry.register_test(name, func);
    }

    /// Installs the loader used by `get_template`, `extends`, `include`
    /// and `import`. Drops every cached template.
    pub fn set_loader(&mut self, loader: impl Loader + 'static) {
        self.loader = Some(Arc::new(loader));
        self.clear_cache();
    }

    pub fn clear_cache(&self) {
        self.cache.write().clear();
    }

    pub(crate) fn max_depth(&self) -> usize {
        self.config.max_depth
    }
}

/// Shared engine behind the free functions and [`Template::render`].
pub(crate) fn default_engine() -> &'static Engine {
    static ENGINE: OnceLock<Engine> = OnceLock::new();
    ENGINE.get_or_init(Engine::new)
}
