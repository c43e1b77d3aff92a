/// Benchmarks for output composition and the in-process publish path
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use pipeline_plugin::broker::MemoryBroker;
use pipeline_plugin::config::{PluginSettings, PluginVariant};
use pipeline_plugin::merger::{OutputMerger, OutputScheme};
use pipeline_plugin::PipelinePlugin;
use serde_json::{json, Map, Value};
use std::sync::Arc;

fn record(fields: usize) -> Value {
    let map: Map<String, Value> = (0..fields)
        .map(|i| (format!("field_{i}"), json!({"value": i, "label": "x"})))
        .collect();
    Value::Object(map)
}

fn bench_schemes(c: &mut Criterion) {
    let mut group = c.benchmark_group("OutputMerger");

    let schemes = vec![
        ("merge", OutputScheme::Merge),
        (
            "namespace",
            OutputScheme::Namespace {
                key: "field_0".to_string(),
            },
        ),
        ("result", OutputScheme::Result),
    ];

    for fields in [4, 64, 512] {
        let original = record(fields);
        let result = json!({"score": 0.93, "label": "positive"});

        for (name, scheme) in &schemes {
            let merger = OutputMerger::new(scheme.clone());
            group.bench_with_input(BenchmarkId::new(*name, fields), &fields, |b, _| {
                b.iter(|| black_box(merger.merge(black_box(&original), black_box(&result))))
            });
        }
    }

    group.finish();
}

fn bench_pipe(c: &mut Criterion) {
    let mut group = c.benchmark_group("Pipe");
    let rt = tokio::runtime::Runtime::new().unwrap();

    let mut settings =
        PluginSettings::new(PluginVariant::Service, "memory://bench", vec!["in".to_string()]);
    settings.output_pipes = vec!["out-a".to_string(), "out-b".to_string()];
    settings.output_scheme = Some("MERGE".to_string());

    let (plugin, _events) =
        PipelinePlugin::new(settings, Arc::new(MemoryBroker::new())).unwrap();
    rt.block_on(plugin.initialize()).unwrap();

    let original = record(16);
    let result = json!({"score": 0.5});

    group.bench_function("merge_two_outputs", |b| {
        b.to_async(&rt).iter(|| async {
            let outcome = plugin.pipe(black_box(&original), black_box(&result)).await;
            black_box(outcome)
        });
    });

    group.finish();
}

criterion_group!(benches, bench_schemes, bench_pipe);
criterion_main!(benches);
