use criterion::{Criterion, black_box};
use otlpgw_core::SignalKind;
use otlpgw_wire::{
    BytecodeCompiledPathEvaluator, CompiledPathEvaluator, EvalScratch, FastWireCursor,
    OtlpPathCompiler, PathCompiler, PathStringPool, SchemaId, WireCursor,
};
use std::{env, sync::Arc, time::Duration};

/// 游标扫描与路径求值的基准。
///
/// # 设计背景（Why）
/// - 网关对每个入站报文至少执行一次整包扫描和若干次路径求值，两者的吞吐直接决定变更链路的开销下限。
///
/// # 逻辑解析（How）
/// - 夹具为 64 个 span、每个 span 4 个事件的 traces 请求；
/// - `cursor_scan_flat` 只遍历顶层字段，`cursor_scan_deep` 下钻每一个 LEN 字段，
///   `eval_event_names` 用 `[*]` 通配路径枚举全部事件名。
fn bench_cursor_scan(c: &mut Criterion, request: &[u8]) {
    c.bench_function("cursor_scan_flat", |b| {
        b.iter(|| {
            let mut cursor = FastWireCursor::new(black_box(request));
            let mut fields = 0usize;
            while cursor.next_field().unwrap_or(false) {
                fields += 1;
            }
            black_box(fields)
        });
    });

    c.bench_function("cursor_scan_deep", |b| {
        b.iter(|| {
            let mut cursor = FastWireCursor::new(black_box(request));
            let mut fields = 0usize;
            loop {
                match cursor.next_field() {
                    Ok(true) => {
                        fields += 1;
                        let _ = cursor.enter_message();
                    }
                    Ok(false) => {
                        if cursor.leave_message().is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
            black_box(fields)
        });
    });
}

fn bench_eval(c: &mut Criterion, request: &[u8]) {
    let pool = Arc::new(PathStringPool::new());
    let compiler = OtlpPathCompiler::new(Arc::clone(&pool));
    let evaluator = BytecodeCompiledPathEvaluator::new(pool);
    let path = compiler
        .compile(
            "scopeSpans[*].spans[*].events[*].name",
            &SchemaId::otlp_v1(),
            SignalKind::Traces,
        )
        .expect("bench path compiles");
    let mut scratch = EvalScratch::new();

    c.bench_function("eval_event_names", |b| {
        b.iter(|| {
            let mut total = 0usize;
            let count = evaluator
                .evaluate_all(
                    &path,
                    black_box(request),
                    0,
                    request.len(),
                    &mut scratch,
                    &mut |_, length, _| {
                        total += length;
                        true
                    },
                )
                .unwrap_or(0);
            black_box((count, total))
        });
    });
}

fn main() {
    let mut quick_mode = false;
    for arg in env::args().skip(1) {
        if arg == "--quick" {
            quick_mode = true;
        }
    }

    let mut criterion = Criterion::default();
    if quick_mode {
        criterion = criterion
            .sample_size(10)
            .warm_up_time(Duration::from_millis(100))
            .measurement_time(Duration::from_millis(250));
    }

    let request = traces_request(64, 4);
    bench_cursor_scan(&mut criterion, &request);
    bench_eval(&mut criterion, &request);
    criterion.final_summary();
}

fn varint(mut value: u64, out: &mut Vec<u8>) {
    while value >= 0x80 {
        out.push((value as u8 & 0x7F) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

fn len_field(field: u32, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 6);
    varint(u64::from(field << 3 | 2), &mut out);
    varint(body.len() as u64, &mut out);
    out.extend_from_slice(body);
    out
}

fn traces_request(spans: usize, events: usize) -> Vec<u8> {
    let mut scope = Vec::new();
    for span_index in 0..spans {
        let mut span = len_field(5, format!("span-{span_index}").as_bytes());
        for event_index in 0..events {
            span.extend(len_field(11, &len_field(2, format!("event-{event_index}").as_bytes())));
        }
        scope.extend(len_field(2, &span));
    }
    let attribute = [len_field(1, b"tenant_id"), len_field(2, &len_field(1, b"acme"))].concat();
    let resource = len_field(1, &len_field(1, &attribute));
    let container = [resource, len_field(2, &scope)].concat();
    len_field(1, &container)
}
