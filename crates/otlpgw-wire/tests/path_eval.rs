mod support;

use std::sync::Arc;

use otlpgw_core::SignalKind;
use otlpgw_wire::{
    BytecodeCompiledPathEvaluator, CompiledPathEvaluator, EvalResult, EvalScratch,
    FastWireCursor, MismatchCode, OtlpPathCompiler, PathCompiler, PathStringPool, SchemaId,
    ValueType, WireCursor,
};

struct Harness {
    compiler: OtlpPathCompiler,
    evaluator: BytecodeCompiledPathEvaluator,
}

impl Harness {
    fn new() -> Self {
        let pool = Arc::new(PathStringPool::new());
        Self {
            compiler: OtlpPathCompiler::new(Arc::clone(&pool)),
            evaluator: BytecodeCompiledPathEvaluator::new(pool),
        }
    }

    fn collect(&self, path: &str, region: &[u8], limit: usize) -> Vec<Vec<u8>> {
        let compiled = self
            .compiler
            .compile(path, &SchemaId::otlp_v1(), SignalKind::Traces)
            .expect("path compiles");
        let mut scratch = EvalScratch::new();
        let mut values = Vec::new();
        let count = self
            .evaluator
            .evaluate_all(
                &compiled,
                region,
                0,
                region.len(),
                &mut scratch,
                &mut |offset, length, _| {
                    values.push(region[offset..offset + length].to_vec());
                    values.len() < limit
                },
            )
            .expect("well-formed request");
        assert_eq!(count, values.len());
        values
    }
}

#[test]
fn resource_attribute_match_copies_value_into_scratch() {
    let harness = Harness::new();
    let request = support::traces_request();
    let path = harness
        .compiler
        .compile(
            "resource.attributes.tenant_id",
            &SchemaId::otlp_v1(),
            SignalKind::Traces,
        )
        .expect("compile");
    let mut scratch = EvalScratch::new();
    let cursor = FastWireCursor::new(&request);
    assert_eq!(
        harness.evaluator.evaluate(&path, &cursor, &mut scratch),
        EvalResult::MatchFound(ValueType::String)
    );
    assert_eq!(scratch.value(), b"black_list");
    let (offset, length) = scratch.last_span();
    assert_eq!(&request[offset..offset + length], b"black_list");
}

#[test]
fn absent_attribute_key_is_not_found() {
    let harness = Harness::new();
    let request = support::traces_request();
    let path = harness
        .compiler
        .compile(
            "resource.attributes[\"customer\"]",
            &SchemaId::otlp_v1(),
            SignalKind::Traces,
        )
        .expect("compile");
    let mut scratch = EvalScratch::new();
    assert_eq!(
        harness
            .evaluator
            .evaluate(&path, &FastWireCursor::new(&request), &mut scratch),
        EvalResult::NoMatch(MismatchCode::MapKeyNotFound)
    );
}

#[test]
fn wildcard_event_names_are_visited_depth_first_in_order() {
    let harness = Harness::new();
    let request = support::traces_request();
    let names = harness.collect(
        "scopeSpans[*].spans[*].events[*].name",
        &request,
        usize::MAX,
    );
    assert_eq!(names, vec![b"e1".to_vec(), b"e2".to_vec(), b"e3".to_vec()]);
}

#[test]
fn callback_returning_false_stops_after_that_match() {
    let harness = Harness::new();
    let request = support::traces_request();
    let names = harness.collect("scopeSpans[*].spans[*].events[*].name", &request, 1);
    assert_eq!(names, vec![b"e1".to_vec()]);
}

#[test]
fn first_occurrence_selectors_take_only_the_first_branch() {
    let harness = Harness::new();
    let request = support::traces_request();
    let names = harness.collect("scopeSpans[0].spans[0].name", &request, usize::MAX);
    // the implicit root still fans out over both resource containers
    assert_eq!(names, vec![b"checkout".to_vec(), b"audit".to_vec()]);
    let qualified = harness.collect(
        "resourceSpans[0].scopeSpans[*].spans[*].name",
        &request,
        usize::MAX,
    );
    assert_eq!(
        qualified,
        vec![b"checkout".to_vec(), b"payment".to_vec(), b"refund".to_vec()]
    );
}

#[test]
fn region_attribute_is_found_in_every_resource() {
    let harness = Harness::new();
    let request = support::traces_request();
    let regions = harness.collect("resource.attributes[\"region\"]", &request, usize::MAX);
    assert_eq!(regions, vec![b"eu-west".to_vec(), b"us-east".to_vec()]);
}

#[test]
fn status_code_and_timestamps_decode_as_numbers() {
    let harness = Harness::new();
    let request = support::traces_request();
    let schema = SchemaId::otlp_v1();
    let mut scratch = EvalScratch::new();
    let cursor = FastWireCursor::new(&request);

    let code = harness
        .compiler
        .compile("scopeSpans.spans.status.code", &schema, SignalKind::Traces)
        .expect("status code");
    assert_eq!(
        harness.evaluator.evaluate(&code, &cursor, &mut scratch),
        EvalResult::MatchFound(ValueType::Enum)
    );
    assert_eq!(scratch.number(), 1);

    let start = harness
        .compiler
        .compile("scopeSpans.spans.startTimeUnixNano", &schema, SignalKind::Traces)
        .expect("start time");
    assert!(harness.evaluator.evaluate(&start, &cursor, &mut scratch).is_match());
    assert_eq!(scratch.number(), 1_700_000_000_000_000_000);
}

#[test]
fn evaluation_respects_the_cursor_window() {
    let harness = Harness::new();
    let request = support::traces_request();
    let mut framed = vec![0xFF; 5];
    framed.extend_from_slice(&request);
    let path = harness
        .compiler
        .compile("resource.attributes.tenant_id", &SchemaId::otlp_v1(), SignalKind::Traces)
        .expect("compile");
    let mut cursor = FastWireCursor::default();
    cursor.reset(&framed, 5, request.len()).expect("window");
    let mut scratch = EvalScratch::new();
    assert!(harness.evaluator.evaluate(&path, &cursor, &mut scratch).is_match());
    assert!(scratch.last_span().0 >= 5);
}

#[test]
fn truncated_request_is_an_eval_error_not_a_panic() {
    let harness = Harness::new();
    let request = support::traces_request();
    let truncated = &request[..request.len() - 3];
    let path = harness
        .compiler
        .compile("scopeSpans[*].spans[*].name", &SchemaId::otlp_v1(), SignalKind::Traces)
        .expect("compile");
    let mut scratch = EvalScratch::new();
    let result = harness
        .evaluator
        .evaluate_all(&path, truncated, 0, truncated.len(), &mut scratch, &mut |_, _, _| true);
    assert!(result.is_err());
}
