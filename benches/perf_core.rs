use criterion::{black_box, criterion_group, criterion_main, Criterion};
use repo_atlas::cache::ChangeCache;
use repo_atlas::llm::{generate_key, ChatMessage, CompletionRequest, ToolDefinition};
use repo_atlas::scan::{scan, ScanOptions};
use serde_json::json;

fn synthetic_repo(file_count: usize) -> tempfile::TempDir {
    let temp = tempfile::tempdir().expect("tempdir");
    for i in 0..file_count {
        let dir = temp.path().join(format!("src/feature_{:03}", i % 50));
        std::fs::create_dir_all(&dir).expect("create feature dir");
        std::fs::write(
            dir.join(format!("file_{i:05}.rs")),
            format!("pub fn f{i}() -> usize {{ {i} }}\n").repeat(20),
        )
        .expect("write synthetic source");
    }
    temp
}

fn bench_scan(c: &mut Criterion) {
    let temp = synthetic_repo(2_000);
    let (previous, _) = scan(temp.path(), ScanOptions::default(), None).expect("initial scan");

    c.bench_function("scan_cold", |b| {
        b.iter(|| {
            let (files, _) = scan(temp.path(), ScanOptions::default(), None).expect("scan");
            black_box(files.len());
        });
    });

    c.bench_function("scan_warm_reuse", |b| {
        b.iter(|| {
            let (_, metrics) =
                scan(temp.path(), ScanOptions::default(), Some(&previous)).expect("scan");
            black_box(metrics.cached_files);
        });
    });

    let cache = ChangeCache::empty(temp.path());
    let agents: Vec<String> = ["structure", "dependencies", "data_flow"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    c.bench_function("detect_changes_2000", |b| {
        b.iter(|| black_box(cache.detect_changes(&previous, &agents).agents_to_run.len()));
    });
}

fn bench_generate_key(c: &mut Criterion) {
    let mut request = CompletionRequest::new("openai/gpt-4o-mini", "  You are an analyst.  ")
        .with_temperature(0.2)
        .with_max_tokens(4_096);
    for i in 0..20 {
        let context = format!("{}\n", "context ".repeat(500 + i));
        request = request.with_message(ChatMessage::user(context));
    }
    for name in ["read_file", "search", "list_dir"] {
        request = request.with_tool(ToolDefinition {
            name: name.to_string(),
            description: format!(" {name} tool "),
            parameters: json!({"type": "object", "properties": {"path": {"type": "string"}}}),
        });
    }

    c.bench_function("generate_key_large_request", |b| {
        b.iter(|| black_box(generate_key(black_box(&request)).expect("key")));
    });
}

criterion_group!(perf_core, bench_scan, bench_generate_key);
criterion_main!(perf_core);
