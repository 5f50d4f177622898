use luma::{render_str, Config, Context, Engine, Value};
use pretty_assertions::assert_eq;
use serde_json::json;

fn messages(pairs: &[(&str, &str)]) -> Context {
    let list: Vec<Value> = pairs
        .iter()
        .map(|(role, content)| Value::from(json!({"role": role, "content": content})))
        .collect();
    Context::new().with("messages", list)
}

// ── Edge cases ──

#[test]
fn empty_template_and_empty_list() {
    assert_eq!(render_str("", &Context::new()).unwrap(), "");
    let template = "{% for message in messages %}{{ message.content }}{% endfor %}";
    assert_eq!(render_str(template, &messages(&[])).unwrap(), "");
}

#[test]
fn plain_text_template_no_tags() {
    assert_eq!(render_str("Hello, world!", &Context::new()).unwrap(), "Hello, world!");
}

#[test]
fn context_var_outside_loop() {
    let ctx = Context::new().with("bos_token", "<s>").with("eos_token", "</s>");
    assert_eq!(render_str("{{ bos_token }}PROMPT{{ eos_token }}", &ctx).unwrap(), "<s>PROMPT</s>");
}

#[test]
fn dot_access_and_bracket_access_equivalent() {
    let ctx = messages(&[("user", "hi")]);
    let a = render_str("{% for message in messages %}{{ message.role }}{% endfor %}", &ctx).unwrap();
    let b = render_str("{% for message in messages %}{{ message['role'] }}{% endfor %}", &ctx).unwrap();
    assert_eq!(a, b);
    assert_eq!(a, "user");
}

#[test]
fn index_access_counts_from_either_end() {
    let ctx = Context::new().with("xs", vec!["a", "b", "c"]);
    assert_eq!(render_str("{{ xs[0] }}{{ xs[-1] }}{{ xs[9] }}", &ctx).unwrap(), "ac");
    assert_eq!(render_str("${ xs.1 }", &ctx).unwrap(), "b");
}

#[test]
fn loop_first_and_last() {
    let template = "{% for message in messages %}{% if loop.first %}[{% endif %}{{ message.role }}{% if loop.last %}]{% endif %}{% endfor %}";
    assert_eq!(render_str(template, &messages(&[("a", ""), ("b", ""), ("c", "")])).unwrap(), "[abc]");
    assert_eq!(render_str(template, &messages(&[("x", "")])).unwrap(), "[x]");
}

#[test]
fn or_operator_in_condition() {
    let template = "{% for message in messages %}{% if message.role == 'user' or message.role == 'assistant' %}Y{% else %}N{% endif %}{% endfor %}";
    let ctx = messages(&[("system", ""), ("user", ""), ("assistant", "")]);
    assert_eq!(render_str(template, &ctx).unwrap(), "NYY");
}

#[test]
fn string_concat_multiple_parts() {
    let ctx = messages(&[("x", "")]);
    let template = "{% for message in messages %}{{ 'A' + 'B' ~ 'C' + message.role + 'D' }}{% endfor %}";
    assert_eq!(render_str(template, &ctx).unwrap(), "ABCxD");
}

#[test]
fn string_plus_number_concatenates() {
    let ctx = Context::new().with("n", 3);
    assert_eq!(render_str("{{ 'n=' + n }} {{ n + 1.5 }}", &ctx).unwrap(), "n=3 4.5");
}

#[test]
fn integral_floats_display_without_fraction() {
    let ctx = Context::new().with("x", 21.0);
    assert_eq!(render_str("${ x * 2 } ${ 7 / 2 } ${ 6 / 3 }", &ctx).unwrap(), "42 3.5 2");
}

#[test]
fn elif_chain() {
    let template = r#"{% for message in messages %}{% if message.role == 'user' %}U{% elif message.role == 'system' %}S{% else %}O{% endif %}{% endfor %}"#;
    let ctx = messages(&[("user", ""), ("system", ""), ("tool", "")]);
    assert_eq!(render_str(template, &ctx).unwrap(), "USO");
}

#[test]
fn special_characters_pass_through_without_autoescape() {
    let ctx = messages(&[("user", "Hello <world> & \"friends\"")]);
    let template = "{% for message in messages %}{{ message.content }}{% endfor %}";
    assert_eq!(render_str(template, &ctx).unwrap(), "Hello <world> & \"friends\"");
}

#[test]
fn special_characters_escape_with_autoescape() {
    let engine = Engine::with_config(Config {
        autoescape: true,
        ..Config::default()
    });
    let ctx = Context::new().with("x", "<a href=\"#\">'&'</a>");
    assert_eq!(
        engine.render_str("$x|${ x | safe }", &ctx).unwrap(),
        "&lt;a href=&quot;#&quot;&gt;&#39;&amp;&#39;&lt;/a&gt;|<a href=\"#\">'&'</a>"
    );
}

#[test]
fn unicode_content() {
    let ctx = messages(&[("user", "こんにちは 🌍")]);
    let template = "{% for message in messages %}{{ message.content | upper }}{% endfor %}";
    assert_eq!(render_str(template, &ctx).unwrap(), "こんにちは 🌍");
    let ctx = Context::new().with("s", "héllo");
    assert_eq!(render_str("${ s | length } ${ s[1] }", &ctx).unwrap(), "5 é");
}

#[test]
fn missing_values_render_empty_and_take_defaults() {
    let ctx = Context::new().with("blank", "");
    assert_eq!(render_str("[$nope][${ nope.deeper }]", &ctx).unwrap(), "[][]");
    assert_eq!(render_str(r#"${ nope | default("d") }"#, &ctx).unwrap(), "d");
    assert_eq!(render_str(r#"${ blank | default("d") }|${ blank | default("d", true) }"#, &ctx).unwrap(), "|d");
    assert_eq!(render_str("${ nope | upper | length }", &ctx).unwrap(), "");
}

#[test]
fn escaped_markers_are_literal() {
    let ctx = Context::new().with("price", 5);
    assert_eq!(render_str("$$$price for @@home", &ctx).unwrap(), "$5 for @home");
    assert_eq!(render_str("mail me at a@b.com", &ctx).unwrap(), "mail me at a@b.com");
}

#[test]
fn raw_blocks_keep_markers() {
    let native = "@raw\n$x @if\n@end\n";
    assert_eq!(render_str(native, &Context::new()).unwrap(), "$x @if\n");
    let jinja = "{% raw %}{{ x }}{% endraw %}";
    assert_eq!(render_str(jinja, &Context::new()).unwrap(), "{{ x }}");
}

#[test]
fn whitespace_control_in_jinja() {
    let ctx = Context::new().with("xs", vec![1, 2]);
    assert_eq!(render_str("a  {%- for x in xs -%}  {{ x }}  {%- endfor %}  b", &ctx).unwrap(), "a12  b");
}
