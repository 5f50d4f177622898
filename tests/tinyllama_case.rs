use luma::{render_str, Context};
use serde_json::json;

const TINYLLAMA: &str = r#"
{% for message in messages %}
{% if message['role'] == 'user' %}
{{ '<|user|>\n' + message['content'] + eos_token }}
{% elif message['role'] == 'system' %}
{{ '<|system|>\n' + message['content'] + eos_token }}
{% elif message['role'] == 'assistant' %}
{{ '<|assistant|>\n'  + message['content'] + eos_token }}
{% endif %}
{% if loop.last and add_generation_prompt %}
{{ '<|assistant|>' }}
{% endif %}
{% endfor %}
"#;

fn chat(messages: serde_json::Value, eos: &str, prompt: bool) -> Context {
    Context::from_serialize(&json!({
        "messages": messages,
        "eos_token": eos,
        "add_generation_prompt": prompt,
    }))
    .unwrap()
}

#[test]
fn test_tinyllama_template_full_features() {
    let ctx = chat(
        json!([
            {"role": "system", "content": "You are a friendly AI."},
            {"role": "user", "content": "Hello!"},
        ]),
        "</s>",
        true,
    );

    let rendered = render_str(TINYLLAMA.trim(), &ctx).unwrap();
    let expected = "<|system|>\nYou are a friendly AI.</s>\n<|user|>\nHello!</s>\n<|assistant|>";
    assert_eq!(rendered.trim(), expected);
}

#[test]
fn test_add_generation_prompt_false() {
    let ctx = chat(json!([{"role": "user", "content": "Hi"}]), "</s>", false);

    let rendered = render_str(TINYLLAMA.trim(), &ctx).unwrap();
    assert!(rendered.contains("<|user|>"));
    assert!(!rendered.contains("<|assistant|>"), "Should NOT contain assistant prompt when flag is false");
}

#[test]
fn test_missing_flag_is_falsy() {
    let ctx = Context::from_serialize(&json!({
        "messages": [{"role": "user", "content": "Hi"}],
        "eos_token": "</s>",
    }))
    .unwrap();

    let rendered = render_str(TINYLLAMA.trim(), &ctx).unwrap();
    assert_eq!(rendered.trim(), "<|user|>\nHi</s>");
}

#[test]
fn test_custom_eos_token() {
    let template = "{% for message in messages %}\n{{ message['content'] + eos_token }}\n{% endfor %}";
    let ctx = chat(json!([{"role": "user", "content": "Hello"}]), "<|endoftext|>", false);

    let rendered = render_str(template, &ctx).unwrap();
    assert_eq!(rendered, "Hello<|endoftext|>\n");
}

#[test]
fn test_multi_turn_conversation() {
    let ctx = chat(
        json!([
            {"role": "system", "content": "You help."},
            {"role": "user", "content": "What is 2+2?"},
            {"role": "assistant", "content": "4"},
            {"role": "user", "content": "Thanks!"},
        ]),
        "</s>",
        true,
    );

    let rendered = render_str(TINYLLAMA.trim(), &ctx).unwrap();

    assert!(rendered.contains("<|system|>\nYou help.</s>"), "system msg");
    assert!(rendered.contains("<|user|>\nWhat is 2+2?</s>"), "user msg 1");
    assert!(rendered.contains("<|assistant|>\n4</s>"), "assistant msg");
    assert!(rendered.contains("<|user|>\nThanks!</s>"), "user msg 2");
    assert!(rendered.trim().ends_with("<|assistant|>"), "generation prompt at end");
}

#[test]
fn test_same_template_in_native_syntax() {
    let native = "\
@for message in messages
@if message.role == 'user'
${ '<|user|>\\n' + message.content + eos_token }
@elif message.role == 'system'
${ '<|system|>\\n' + message.content + eos_token }
@end
@if loop.last and add_generation_prompt
<|assistant|>
@end
@end
";
    let ctx = chat(
        json!([
            {"role": "system", "content": "You are a friendly AI."},
            {"role": "user", "content": "Hello!"},
        ]),
        "</s>",
        true,
    );

    let rendered = render_str(native, &ctx).unwrap();
    let expected = "<|system|>\nYou are a friendly AI.</s>\n<|user|>\nHello!</s>\n<|assistant|>\n";
    assert_eq!(rendered, expected);
}
