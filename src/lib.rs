//! luma: a dual-syntax template engine with a sandboxed runtime.
//!
//! Templates are written in either of two surface syntaxes that compile to
//! the same tree and render identically:
//!
//! - **native**: `$name`, `${ expr | filter }`, and line directives such as
//!   `@if cond` … `@else` … `@end`, `@for x in xs` … `@end`, `@macro`,
//!   `@let`, `@include`. `$$` and `@@` are literal `$` and `@`.
//! - **jinja**: `{{ expr }}`, `{% tag %}` and `{# comment #}`, with `-`
//!   whitespace control on either side of a tag.
//!
//! [`Syntax::Auto`] picks one per template by looking at the first marker.
//! Mixing both in one template is an error.
//!
//! Pipeline:
//! - the lexer turns source text into tokens with line/column positions;
//! - the parser builds an AST;
//! - the compiler hoists macros and blocks into an immutable [`Template`]
//!   and checks filter names and macro signatures;
//! - the runtime walks the template against a read-only [`Context`].
//!
//! Rendering never touches the host beyond the [`Loader`] the host
//! installs. Templates cannot mutate the context; a macro only sees its
//! own arguments.
//!
//! ```
//! use luma::{render_str, Context};
//!
//! let ctx = Context::new().with("name", "World");
//! assert_eq!(render_str("Hello, $name!", &ctx).unwrap(), "Hello, World!");
//! assert_eq!(render_str("Hello, {{ name }}!", &ctx).unwrap(), "Hello, World!");
//! ```
//!
//! Use an [`Engine`] for anything beyond defaults: autoescaping, custom
//! filters and tests, and a loader for `extends`, `include` and `import`.

pub mod ast;
mod compiler;
mod engine;
mod error;
mod eval;
mod filters;
pub mod lexer;
mod loader;
pub mod parser;
mod value;

pub use compiler::Template;
pub use engine::{Config, Engine};
pub use error::{CompileError, Error, LexError, LoadError, ParseError, Position, RenderError, Result};
pub use filters::{escape_html, FilterRegistry};
pub use lexer::Syntax;
pub use loader::{Loader, MapLoader};
pub use value::{Context, Value};

/// Compiles `source` with the built-in filters and tests.
pub fn compile(source: &str, syntax: Syntax) -> Result<Template> {
    engine::default_engine().compile_with(source, syntax)
}

/// Renders a compiled template with default settings: no autoescaping and
/// no loader.
pub fn render(template: &Template, context: &Context) -> Result<String> {
    engine::default_engine().render(template, context)
}

/// Compiles `source`, detecting its syntax, and renders it.
pub fn render_str(source: &str, context: &Context) -> Result<String> {
    engine::default_engine().render_str(source, context)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn both_syntaxes_render_the_same_greeting() {
        let ctx = Context::new().with("name", "World");
        assert_eq!(render_str("Hello, $name!", &ctx).unwrap(), "Hello, World!");
        assert_eq!(render_str("Hello, {{ name }}!", &ctx).unwrap(), "Hello, World!");
    }

    #[test]
    fn compiled_templates_are_reusable() {
        let template = compile("${ value * 2 }", Syntax::Native).unwrap();
        assert_eq!(template.syntax(), Syntax::Native);
        for (value, expected) in [(21, "42"), (5, "10")] {
            let ctx = Context::new().with("value", value);
            assert_eq!(render(&template, &ctx).unwrap(), expected);
            assert_eq!(template.render(&ctx).unwrap(), expected);
        }
    }

    #[test]
    fn filter_chains_apply_left_to_right() {
        let out = render_str(r#"${ "HELLO WORLD" | lower | capitalize }"#, &Context::new()).unwrap();
        assert_eq!(out, "Hello world");
    }

    #[test]
    fn errors_surface_through_the_unified_type() {
        let err = render_str("@if x\nno end\n", &Context::new()).unwrap_err();
        assert!(matches!(err, Error::Parse(ParseError::Unclosed { .. })));
        assert_eq!(err.position().map(|p| p.line), Some(1));
    }

    #[test]
    fn templates_are_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Template>();
        assert_send_sync::<Context>();
    }
}
