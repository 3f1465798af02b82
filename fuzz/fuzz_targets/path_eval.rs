#![no_main]

use std::sync::{Arc, OnceLock};

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use otlpgw_core::{PacketDescriptor, PacketRef, SignalKind};
use otlpgw_mutate::{ResourceAttributeSpanSelector, ValueSpanCollector, ValueSpanSelector};
use otlpgw_wire::{
    BytecodeCompiledPathEvaluator, CompiledPath, CompiledPathEvaluator, EvalScratch,
    FastWireCursor, OtlpPathCompiler, PathCompiler, PathStringPool, SchemaId,
};

const PATHS: [&str; 5] = [
    "resource.attributes.tenant_id",
    "scopeSpans[*].spans[*].name",
    "scopeSpans[*].spans[*].events[*].name",
    "scopeSpans[0].spans[0].status.code",
    "scopeSpans[*].spans[*].attributes[\"http.route\"]",
];

struct Fixture {
    evaluator: BytecodeCompiledPathEvaluator,
    paths: Vec<CompiledPath>,
}

fn fixture() -> &'static Fixture {
    static FIXTURE: OnceLock<Fixture> = OnceLock::new();
    FIXTURE.get_or_init(|| {
        let pool = Arc::new(PathStringPool::new());
        let compiler = OtlpPathCompiler::new(Arc::clone(&pool));
        let paths = PATHS
            .iter()
            .filter_map(|path| compiler.compile(path, &SchemaId::otlp_v1(), SignalKind::Traces).ok())
            .collect();
        Fixture {
            evaluator: BytecodeCompiledPathEvaluator::new(pool),
            paths,
        }
    })
}

/// 求值器 fuzz 用例：任意报文字节 + 路径选择。
///
/// - **Why**：求值器用显式栈解释字节码，畸形输入必须以 `EvalError`/`NoMatch` 结束，而不是越界或无限分叉；
/// - **What**：`evaluate` 与 `evaluate_all` 都必须返回，所有命中区间都在报文之内；
///   资源属性快速选择器在同一输入上也不得出错。
#[derive(Debug, Arbitrary)]
struct EvalCase {
    path: u8,
    payload: Vec<u8>,
}

fuzz_target!(|case: EvalCase| {
    let fixture = fixture();
    if fixture.paths.is_empty() {
        return;
    }
    let path = &fixture.paths[usize::from(case.path) % fixture.paths.len()];
    let len = case.payload.len();
    let mut scratch = EvalScratch::new();

    if let Ok(cursor) = FastWireCursor::over(&case.payload, 0, len) {
        let _ = fixture.evaluator.evaluate(path, &cursor, &mut scratch);
    }
    let _ = fixture.evaluator.evaluate_all(path, &case.payload, 0, len, &mut scratch, &mut |offset, length, _| {
        assert!(offset + length <= len, "match [{offset}, {}) escaped payload", offset + length);
        true
    });

    let packet = PacketRef::wrap(case.payload, PacketDescriptor::for_signal(SignalKind::Traces));
    let mut collector = ValueSpanCollector::with_capacity(16);
    let selector = ResourceAttributeSpanSelector::new("tenant_id");
    if let Ok(count) = selector.collect(&packet, &mut scratch, &mut collector) {
        assert_eq!(count, collector.count());
        for (offset, length) in collector.iter() {
            assert!((offset + length) as usize <= len);
        }
    }
});
