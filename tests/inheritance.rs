use luma::{Context, Engine, Error, MapLoader, RenderError};
use pretty_assertions::assert_eq;

fn engine(templates: &[(&str, &str)]) -> Engine {
    let mut engine = Engine::new();
    engine.set_loader(templates.iter().copied().collect::<MapLoader>());
    engine
}

fn render_err(engine: &Engine, name: &str) -> RenderError {
    match engine.render_template(name, &Context::new()) {
        Err(Error::Render(e)) => e,
        other => panic!("expected a render error, got {other:?}"),
    }
}

// ── extends ──

#[test]
fn child_overrides_parent_blocks() {
    let e = engine(&[
        ("base", "<title>{% block title %}Default{% endblock %}</title>{% block body %}{% endblock %}"),
        ("page", "{% extends 'base' %}{% block title %}Home{% endblock %}ignored text"),
    ]);
    assert_eq!(e.render_template("page", &Context::new()).unwrap(), "<title>Home</title>");
    assert_eq!(e.render_template("base", &Context::new()).unwrap(), "<title>Default</title>");
}

#[test]
fn most_derived_block_wins_across_levels() {
    let e = engine(&[
        ("a", "[{% block x %}a{% endblock %}|{% block y %}a{% endblock %}]"),
        ("b", "{% extends 'a' %}{% block x %}b{% endblock %}{% block y %}b{% endblock %}"),
        ("c", "{% extends 'b' %}{% block x %}c{% endblock %}"),
    ]);
    assert_eq!(e.render_template("c", &Context::new()).unwrap(), "[c|b]");
}

#[test]
fn native_extends_with_top_level_let() {
    let e = engine(&[
        ("base", "@block head\n$title\n@end\nbody\n"),
        ("child", "@extends \"base\"\n@let title = \"Child\"\n"),
    ]);
    assert_eq!(e.render_template("child", &Context::new()).unwrap(), "Child\nbody\n");
}

#[test]
fn child_blocks_see_the_render_context() {
    let e = engine(&[
        ("base", "{% block main %}{% endblock %}"),
        ("child", "{% extends 'base' %}{% block main %}{% for x in xs %}{{ x }}{% endfor %}{% endblock %}"),
    ]);
    let ctx = Context::new().with("xs", vec![1, 2, 3]);
    assert_eq!(e.render_template("child", &ctx).unwrap(), "123");
}

#[test]
fn extends_cycles_are_detected() {
    let e = engine(&[("a", "{% extends 'b' %}"), ("b", "{% extends 'a' %}")]);
    assert!(matches!(render_err(&e, "a"), RenderError::Cycle { path, .. } if path == "a"));
}

// ── include ──

#[test]
fn include_sees_the_current_scope() {
    let e = engine(&[
        ("item", "<li>{{ x }}</li>"),
        ("list", "{% for x in xs %}{% include 'item' %}{% endfor %}"),
    ]);
    let ctx = Context::new().with("xs", vec!["a", "b"]);
    assert_eq!(e.render_template("list", &ctx).unwrap(), "<li>a</li><li>b</li>");
}

#[test]
fn include_path_may_be_an_expression() {
    let e = engine(&[("part-1", "one"), ("main", "{% include 'part-' ~ n %}")]);
    let ctx = Context::new().with("n", 1);
    assert_eq!(e.render_template("main", &ctx).unwrap(), "one");
}

#[test]
fn self_include_is_a_cycle() {
    let e = engine(&[("loop", "x{% include 'loop' %}")]);
    assert!(matches!(render_err(&e, "loop"), RenderError::Cycle { .. }));
}

#[test]
fn missing_include_reports_the_path() {
    let e = engine(&[("main", "a\n{% include 'gone' %}")]);
    let err = render_err(&e, "main");
    assert!(matches!(&err, RenderError::Loader { path, .. } if path == "gone"));
    assert_eq!(err.position().line, 2);
}

#[test]
fn broken_include_is_an_invalid_template() {
    let e = engine(&[("bad", "{% if x %}"), ("main", "{% include 'bad' %}")]);
    assert!(matches!(render_err(&e, "main"), RenderError::InvalidTemplate { path, .. } if path == "bad"));
}

#[test]
fn include_without_loader_fails() {
    let err = Engine::new().render_str("{% include 'x' %}", &Context::new()).unwrap_err();
    assert!(matches!(err, Error::Render(RenderError::Loader { .. })));
}

// ── import ──

#[test]
fn imported_macros_are_called_through_the_alias() {
    let e = engine(&[
        ("forms", "{% macro input(name, type='text') %}<input type=\"{{ type }}\" name=\"{{ name }}\">{% endmacro %}"),
        ("page", "{% import 'forms' as f %}{{ f.input('user') }}"),
    ]);
    assert_eq!(e.render_template("page", &Context::new()).unwrap(), "<input type=\"text\" name=\"user\">");
}

#[test]
fn native_import_and_call() {
    let e = engine(&[
        ("ui", "@macro badge(label)\n[$label]\n@end\n"),
        ("page", "@import \"ui\" as ui\n@ui.badge(\"new\")\n"),
    ]);
    assert_eq!(e.render_template("page", &Context::new()).unwrap(), "[new]\n\n");
}

#[test]
fn unknown_imported_macro() {
    let e = engine(&[("m", ""), ("page", "{% import 'm' as m %}{{ m.nope() }}")]);
    assert!(matches!(render_err(&e, "page"), RenderError::UnknownMacro { name, .. } if name == "m.nope"));
}

#[test]
fn imported_macros_keep_their_own_imports() {
    let e = engine(&[
        ("inner", "{% macro b() %}B{% endmacro %}"),
        ("outer", "{% import 'inner' as i %}{% macro a() %}A{{ i.b() }}{% endmacro %}"),
        ("page", "{% import 'outer' as o %}{{ o.a() }}"),
    ]);
    assert_eq!(e.render_template("page", &Context::new()).unwrap(), "AB");
}

#[test]
fn nested_imports_do_not_shadow_the_importers_alias() {
    let e = engine(&[
        ("a", "{% macro hi() %}A{% endmacro %}"),
        ("b", "{% macro hi() %}B{% endmacro %}"),
        ("lib", "{% import 'b' as m %}{% macro via() %}{{ m.hi() }}{% endmacro %}"),
        ("page", "{% import 'a' as m %}{% import 'lib' as l %}{{ m.hi() }}{{ l.via() }}{{ m.hi() }}"),
    ]);
    assert_eq!(e.render_template("page", &Context::new()).unwrap(), "ABA");
}

#[test]
fn imports_made_by_an_include_stay_inside_it() {
    let e = engine(&[
        ("a", "{% macro hi() %}A{% endmacro %}"),
        ("part", "{% import 'a' as m %}{{ m.hi() }}"),
        ("page", "{% include 'part' %}{{ m.hi() }}"),
    ]);
    assert!(matches!(render_err(&e, "page"), RenderError::UnknownMacro { name, .. } if name == "hi"));
}

#[test]
fn includes_see_the_includers_aliases() {
    let e = engine(&[
        ("a", "{% macro hi() %}A{% endmacro %}"),
        ("part", "{{ m.hi() }}"),
        ("page", "{% import 'a' as m %}{% include 'part' %}"),
    ]);
    assert_eq!(e.render_template("page", &Context::new()).unwrap(), "A");
}

#[test]
fn caller_bodies_resolve_aliases_at_the_call_site() {
    let e = engine(&[
        ("a", "{% macro hi() %}A{% endmacro %}"),
        ("b", "{% macro hi() %}B{% endmacro %}"),
        ("layout", "{% import 'b' as m %}{% macro wrap() %}[{{ caller() }}{{ m.hi() }}]{% endmacro %}"),
        ("page", "{% import 'a' as m %}{% import 'layout' as l %}{% call l.wrap() %}{{ m.hi() }}{% endcall %}"),
    ]);
    assert_eq!(e.render_template("page", &Context::new()).unwrap(), "[AB]");
}

// ── call blocks ──

#[test]
fn call_block_with_imported_macro() {
    let e = engine(&[
        ("layout", "{% macro card(title) %}<h1>{{ title }}</h1>{{ caller() }}{% endmacro %}"),
        ("page", "{% import 'layout' as l %}{% call l.card('T') %}body {{ who }}{% endcall %}"),
    ]);
    let ctx = Context::new().with("who", "me");
    assert_eq!(e.render_template("page", &ctx).unwrap(), "<h1>T</h1>body me");
}

#[test]
fn recursion_limit_applies_to_include_chains() {
    let mut templates: Vec<(String, String)> = (0..80).map(|i| (format!("t{i}"), format!("{{% include 't{}' %}}", i + 1))).collect();
    templates.push(("t80".to_string(), "end".to_string()));
    let mut e = Engine::new();
    e.set_loader(templates.into_iter().collect::<MapLoader>());
    assert!(matches!(render_err(&e, "t0"), RenderError::RecursionLimit { limit: 64, .. }));
}
