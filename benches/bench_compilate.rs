#![allow(
    clippy::tests_outside_test_module,
    clippy::unwrap_used,
    clippy::indexing_slicing,
    reason = "benchmark"
)]

use std::collections::BTreeMap;
use std::hint::black_box;

use compilate::{ArrayLoader, Context, Environment, Value};
use criterion::{Criterion, criterion_group, criterion_main};

const PROFILE_TEMPLATE: &str = "\
<h1>{{ user.name }}</h1>
{% if user.active %}<p>age: {{ user.age }}</p>{% endif %}
<ul>
{% for item in items %}\
<li{% if item.special %} class=\"special\"{% endif %}>\
{{ loop.index }}. {{ item.name }}: {{ item.value }}</li>
{% endfor %}\
</ul>";

// Deterministic pseudo-random contexts, same shape every run.
fn generate_contexts(count: usize) -> Vec<Context> {
    let mut seed: u64 = 0x2545_F491_4F6C_DD1D;
    let mut next = move || {
        seed ^= seed << 13;
        seed ^= seed >> 7;
        seed ^= seed << 17;
        seed
    };

    (0..count)
        .map(|i| {
            let json = serde_json::json!({
                "user": {
                    "name": format!("user-{i}"),
                    "age": 18 + (next() % 60),
                    "active": next() % 4 != 0,
                },
            });
            let mut ctx = Context::new();
            ctx.insert("user", json_to_value(&json["user"]));

            let items: Vec<Value> = (0..10)
                .map(|j| {
                    let mut item = BTreeMap::new();
                    item.insert("name".to_string(), Value::Str(format!("item-{j}")));
                    item.insert("value".to_string(), Value::Int((next() % 1000) as i64));
                    item.insert("special".to_string(), Value::Bool(next() % 5 == 0));
                    Value::Map(item)
                })
                .collect();
            ctx.insert("items", Value::Seq(items));
            ctx
        })
        .collect()
}

fn json_to_value(json: &serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::None,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => n
            .as_i64()
            .map(Value::Int)
            .unwrap_or_else(|| Value::Float(n.as_f64().unwrap_or_default())),
        serde_json::Value::String(s) => Value::Str(s.clone()),
        serde_json::Value::Array(items) => Value::Seq(items.iter().map(json_to_value).collect()),
        serde_json::Value::Object(entries) => Value::Map(
            entries
                .iter()
                .map(|(k, v)| (k.clone(), json_to_value(v)))
                .collect(),
        ),
    }
}

fn compilate_benchmark(c: &mut Criterion) {
    let mut loader = ArrayLoader::new();
    loader.insert("profile.html", PROFILE_TEMPLATE);
    let mut env = Environment::new();
    env.set_loader(Box::new(loader));

    let contexts = generate_contexts(100);

    let mut group = c.benchmark_group("Template Rendering");
    group.sample_size(50);

    group.bench_function("compilate_compile", |b| {
        b.iter(|| {
            let env = Environment::new();
            black_box(env.compile_source(PROFILE_TEMPLATE, "profile.html").unwrap());
        });
    });

    group.bench_function("compilate_render", |b| {
        b.iter(|| {
            for context in &contexts {
                black_box(env.render("profile.html", context).unwrap());
            }
        });
    });

    group.finish();
}

criterion_group!(benches, compilate_benchmark);
criterion_main!(benches);
