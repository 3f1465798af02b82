//! OTLP 路径编译器。
//!
//! # 教案式说明
//! - **意图（Why）**：掩码/丢弃规则以人类可读的路径描述目标字段，编译器把它们一次性翻译为字节码，
//!   任何拼写错误、缺失的 map 键或未落在可读标量上的路径都在编译期失败，而不是在热路径上静默不命中；
//! - **逻辑（How）**：先按 `.` 切分段（尊重方括号与引号），再沿固定的 OTLP 消息形状逐段查表：
//!   消息字段产出 `EnterMsgField`（可带 `RepeatedAny`/`RepeatedFirst`）+ `EnterLenDelimited`，
//!   标量字段产出 `EnterMsgField` + `Read*` + `Halt`，属性 map 产出 `MapScanStringKey` + `ReadString` + `Halt`；
//! - **契约（What）**：首段若已是信号的根字段（如 `resourceSpans`）则原样使用，否则隐式补上根字段并遍历全部
//!   资源容器；段名首字母大小写与 snake_case 均可接受；失败以 [`CompileError`] 返回稳定错误码与字节位置。

use std::sync::Arc;

use otlpgw_core::SignalKind;
use thiserror::Error;

use crate::intern::PathStringPool;
use crate::path::{CompiledPath, PathOp, ValueType};
use crate::schema::{
    REQUEST_RESOURCE_CONTAINER, SchemaId, event, log_record, metric, resource,
    resource_container, scope, scope_container, span, status,
};

pub type CompileResult = Result<CompiledPath, CompileError>;

/// 编译失败的分类。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum CompileErrorCode {
    EmptyPath,
    /// 方括号不配对、不支持的方括号内容或空段。
    ParseError,
    UnknownField,
    MapKeyRequired,
    /// 路径在到达可读标量之前结束。
    IncompletePath,
    /// 终值字段之后仍有段。
    TrailingSegment,
    UnsupportedSchema,
}

impl CompileErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::EmptyPath => "EMPTY_PATH",
            Self::ParseError => "PARSE_ERROR",
            Self::UnknownField => "UNKNOWN_FIELD",
            Self::MapKeyRequired => "MAP_KEY_REQUIRED",
            Self::IncompletePath => "INCOMPLETE_PATH",
            Self::TrailingSegment => "TRAILING_SEGMENT",
            Self::UnsupportedSchema => "UNSUPPORTED_SCHEMA",
        }
    }
}

impl core::fmt::Display for CompileErrorCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 编译失败：错误码、说明与出错段在源路径中的字节偏移。
#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[error("{code}: {message} (at byte {position})")]
pub struct CompileError {
    pub code: CompileErrorCode,
    pub message: String,
    pub position: usize,
}

impl CompileError {
    fn new(code: CompileErrorCode, message: impl Into<String>, position: usize) -> Self {
        Self {
            code,
            message: message.into(),
            position,
        }
    }

    pub fn code(&self) -> &'static str {
        self.code.as_str()
    }
}

/// 路径编译契约。
pub trait PathCompiler: Send + Sync {
    fn compile(&self, source: &str, schema: &SchemaId, signal: SignalKind) -> CompileResult;
}

/// 针对 OTLP v1 traces/metrics/logs 形状的编译器。
#[derive(Clone, Debug)]
pub struct OtlpPathCompiler {
    pool: Arc<PathStringPool>,
}

impl OtlpPathCompiler {
    /// map 键驻留到 `pool`；求值器必须使用同一个池解析键。
    pub fn new(pool: Arc<PathStringPool>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Arc<PathStringPool> {
        &self.pool
    }
}

impl PathCompiler for OtlpPathCompiler {
    fn compile(&self, source: &str, schema: &SchemaId, signal: SignalKind) -> CompileResult {
        if !schema.is_otlp_v1() {
            return Err(CompileError::new(
                CompileErrorCode::UnsupportedSchema,
                format!("schema `{schema}` is not supported, expected `otlp/v1`"),
                0,
            ));
        }
        if source.trim().is_empty() {
            return Err(CompileError::new(
                CompileErrorCode::EmptyPath,
                "path is empty",
                0,
            ));
        }
        let segments = split_segments(source)?;
        let mut program = Vec::with_capacity(segments.len() * 3 + 3);
        let mut context = Context::Request;

        if lookup(context, signal, &segments[0].name).is_none() {
            program.extend([
                PathOp::EnterMsgField(REQUEST_RESOURCE_CONTAINER),
                PathOp::RepeatedAny,
                PathOp::EnterLenDelimited,
            ]);
            context = Context::ResourceContainer;
        }

        let mut index = 0;
        let mut terminal = None;
        while index < segments.len() {
            let segment = &segments[index];
            let step = lookup(context, signal, &segment.name).ok_or_else(|| {
                CompileError::new(
                    CompileErrorCode::UnknownField,
                    format!(
                        "unknown field `{}` in {} ({signal})",
                        segment.name,
                        context.as_str()
                    ),
                    segment.position,
                )
            })?;
            index += 1;
            match step {
                Step::Message {
                    field,
                    repeated,
                    next,
                } => {
                    if segment.key.is_some() {
                        return Err(CompileError::new(
                            CompileErrorCode::ParseError,
                            format!("`{}` is not a map and takes no key", segment.name),
                            segment.position,
                        ));
                    }
                    program.push(PathOp::EnterMsgField(field));
                    match (segment.repeat, repeated) {
                        (Repeat::None, _) => {}
                        (Repeat::Any, true) => program.push(PathOp::RepeatedAny),
                        (Repeat::First, true) => program.push(PathOp::RepeatedFirst),
                        (_, false) => {
                            return Err(CompileError::new(
                                CompileErrorCode::ParseError,
                                format!("`{}` is not a repeated field", segment.name),
                                segment.position,
                            ));
                        }
                    }
                    program.push(PathOp::EnterLenDelimited);
                    context = next;
                }
                Step::Terminal { field, read, value } => {
                    segment.expect_bare()?;
                    program.extend([PathOp::EnterMsgField(field), read, PathOp::Halt]);
                    terminal = Some(value);
                    break;
                }
                Step::AnyValue { field } => {
                    segment.expect_bare()?;
                    program.extend([
                        PathOp::EnterMsgField(field),
                        PathOp::EnterLenDelimited,
                        PathOp::ReadString,
                        PathOp::Halt,
                    ]);
                    terminal = Some(ValueType::String);
                    break;
                }
                Step::Map { field } => {
                    if segment.repeat != Repeat::None {
                        return Err(CompileError::new(
                            CompileErrorCode::ParseError,
                            format!("map `{}` takes a quoted key, not `[*]`/`[0]`", segment.name),
                            segment.position,
                        ));
                    }
                    let key = match &segment.key {
                        Some(key) => key.clone(),
                        None => {
                            let key = implicit_key(&segments[index..])?;
                            index = segments.len();
                            key.ok_or_else(|| {
                                CompileError::new(
                                    CompileErrorCode::MapKeyRequired,
                                    format!("map `{}` requires a key", segment.name),
                                    segment.position,
                                )
                            })?
                        }
                    };
                    if key.is_empty() {
                        return Err(CompileError::new(
                            CompileErrorCode::MapKeyRequired,
                            "map key is empty",
                            segment.position,
                        ));
                    }
                    program.extend([
                        PathOp::MapScanStringKey {
                            field,
                            key: self.pool.intern(&key),
                        },
                        PathOp::ReadString,
                        PathOp::Halt,
                    ]);
                    terminal = Some(ValueType::String);
                    break;
                }
            }
        }

        let Some(terminal) = terminal else {
            return Err(CompileError::new(
                CompileErrorCode::IncompletePath,
                format!(
                    "path ends in {} before reaching a readable field",
                    context.as_str()
                ),
                source.len(),
            ));
        };
        if let Some(extra) = segments.get(index) {
            return Err(CompileError::new(
                CompileErrorCode::TrailingSegment,
                format!("unexpected segment `{}` after terminal field", extra.name),
                extra.position,
            ));
        }
        Ok(CompiledPath::new(
            program,
            terminal,
            source,
            schema.clone(),
            signal,
        ))
    }
}

/// 隐式 map 键：剩余的裸段按 `.` 重新拼接（`attributes.service.name` 的键为 `service.name`）。
fn implicit_key(rest: &[Segment]) -> Result<Option<String>, CompileError> {
    if rest.is_empty() {
        return Ok(None);
    }
    let mut key = String::new();
    for segment in rest {
        segment.expect_bare()?;
        if !key.is_empty() {
            key.push('.');
        }
        key.push_str(&segment.name);
    }
    Ok(Some(key))
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Context {
    Request,
    ResourceContainer,
    Resource,
    ScopeContainer,
    Scope,
    Span,
    Event,
    Status,
    Metric,
    LogRecord,
}

impl Context {
    fn as_str(self) -> &'static str {
        match self {
            Self::Request => "export request",
            Self::ResourceContainer => "resource container",
            Self::Resource => "resource",
            Self::ScopeContainer => "scope container",
            Self::Scope => "instrumentation scope",
            Self::Span => "span",
            Self::Event => "span event",
            Self::Status => "span status",
            Self::Metric => "metric",
            Self::LogRecord => "log record",
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum Step {
    Message {
        field: u32,
        repeated: bool,
        next: Context,
    },
    Terminal {
        field: u32,
        read: PathOp,
        value: ValueType,
    },
    Map {
        field: u32,
    },
    /// `LogRecord.body`：进入 `AnyValue` 后读取字符串分支。
    AnyValue {
        field: u32,
    },
}

struct Field {
    name: &'static str,
    step: Step,
}

const fn message(name: &'static str, field: u32, repeated: bool, next: Context) -> Field {
    Field {
        name,
        step: Step::Message {
            field,
            repeated,
            next,
        },
    }
}

const fn string(name: &'static str, field: u32) -> Field {
    Field {
        name,
        step: Step::Terminal {
            field,
            read: PathOp::ReadString,
            value: ValueType::String,
        },
    }
}

const fn bytes(name: &'static str, field: u32) -> Field {
    Field {
        name,
        step: Step::Terminal {
            field,
            read: PathOp::ReadBytes,
            value: ValueType::Bytes,
        },
    }
}

const fn enumeration(name: &'static str, field: u32) -> Field {
    Field {
        name,
        step: Step::Terminal {
            field,
            read: PathOp::ReadEnum,
            value: ValueType::Enum,
        },
    }
}

const fn scalar(name: &'static str, field: u32) -> Field {
    Field {
        name,
        step: Step::Terminal {
            field,
            read: PathOp::ReadScalar,
            value: ValueType::Scalar,
        },
    }
}

const fn map(name: &'static str, field: u32) -> Field {
    Field {
        name,
        step: Step::Map { field },
    }
}

const TRACES_REQUEST: &[Field] = &[message(
    "resourceSpans",
    REQUEST_RESOURCE_CONTAINER,
    true,
    Context::ResourceContainer,
)];
const METRICS_REQUEST: &[Field] = &[message(
    "resourceMetrics",
    REQUEST_RESOURCE_CONTAINER,
    true,
    Context::ResourceContainer,
)];
const LOGS_REQUEST: &[Field] = &[message(
    "resourceLogs",
    REQUEST_RESOURCE_CONTAINER,
    true,
    Context::ResourceContainer,
)];

const RESOURCE_SPANS: &[Field] = &[
    message("resource", resource_container::RESOURCE, false, Context::Resource),
    message(
        "scopeSpans",
        resource_container::SCOPE_CONTAINER,
        true,
        Context::ScopeContainer,
    ),
    string("schemaUrl", resource_container::SCHEMA_URL),
];
const RESOURCE_METRICS: &[Field] = &[
    message("resource", resource_container::RESOURCE, false, Context::Resource),
    message(
        "scopeMetrics",
        resource_container::SCOPE_CONTAINER,
        true,
        Context::ScopeContainer,
    ),
    string("schemaUrl", resource_container::SCHEMA_URL),
];
const RESOURCE_LOGS: &[Field] = &[
    message("resource", resource_container::RESOURCE, false, Context::Resource),
    message(
        "scopeLogs",
        resource_container::SCOPE_CONTAINER,
        true,
        Context::ScopeContainer,
    ),
    string("schemaUrl", resource_container::SCHEMA_URL),
];

const RESOURCE: &[Field] = &[
    map("attributes", resource::ATTRIBUTES),
    scalar("droppedAttributesCount", resource::DROPPED_ATTRIBUTES_COUNT),
];

const SCOPE_SPANS: &[Field] = &[
    message("scope", scope_container::SCOPE, false, Context::Scope),
    message("spans", scope_container::ITEMS, true, Context::Span),
    string("schemaUrl", scope_container::SCHEMA_URL),
];
const SCOPE_METRICS: &[Field] = &[
    message("scope", scope_container::SCOPE, false, Context::Scope),
    message("metrics", scope_container::ITEMS, true, Context::Metric),
    string("schemaUrl", scope_container::SCHEMA_URL),
];
const SCOPE_LOGS: &[Field] = &[
    message("scope", scope_container::SCOPE, false, Context::Scope),
    message("logRecords", scope_container::ITEMS, true, Context::LogRecord),
    string("schemaUrl", scope_container::SCHEMA_URL),
];

const SCOPE: &[Field] = &[
    string("name", scope::NAME),
    string("version", scope::VERSION),
    map("attributes", scope::ATTRIBUTES),
    scalar("droppedAttributesCount", scope::DROPPED_ATTRIBUTES_COUNT),
];

const SPAN: &[Field] = &[
    bytes("traceId", span::TRACE_ID),
    bytes("spanId", span::SPAN_ID),
    string("traceState", span::TRACE_STATE),
    bytes("parentSpanId", span::PARENT_SPAN_ID),
    string("name", span::NAME),
    enumeration("kind", span::KIND),
    scalar("startTimeUnixNano", span::START_TIME_UNIX_NANO),
    scalar("endTimeUnixNano", span::END_TIME_UNIX_NANO),
    map("attributes", span::ATTRIBUTES),
    scalar("droppedAttributesCount", span::DROPPED_ATTRIBUTES_COUNT),
    message("events", span::EVENTS, true, Context::Event),
    scalar("droppedEventsCount", span::DROPPED_EVENTS_COUNT),
    scalar("droppedLinksCount", span::DROPPED_LINKS_COUNT),
    message("status", span::STATUS, false, Context::Status),
    scalar("flags", span::FLAGS),
];

const EVENT: &[Field] = &[
    scalar("timeUnixNano", event::TIME_UNIX_NANO),
    string("name", event::NAME),
    map("attributes", event::ATTRIBUTES),
    scalar("droppedAttributesCount", event::DROPPED_ATTRIBUTES_COUNT),
];

const STATUS: &[Field] = &[
    string("message", status::MESSAGE),
    enumeration("code", status::CODE),
];

const METRIC: &[Field] = &[
    string("name", metric::NAME),
    string("description", metric::DESCRIPTION),
    string("unit", metric::UNIT),
];

const LOG_RECORD: &[Field] = &[
    scalar("timeUnixNano", log_record::TIME_UNIX_NANO),
    enumeration("severityNumber", log_record::SEVERITY_NUMBER),
    string("severityText", log_record::SEVERITY_TEXT),
    Field {
        name: "body",
        step: Step::AnyValue {
            field: log_record::BODY,
        },
    },
    map("attributes", log_record::ATTRIBUTES),
    scalar("droppedAttributesCount", log_record::DROPPED_ATTRIBUTES_COUNT),
    scalar("flags", log_record::FLAGS),
    bytes("traceId", log_record::TRACE_ID),
    bytes("spanId", log_record::SPAN_ID),
    scalar("observedTimeUnixNano", log_record::OBSERVED_TIME_UNIX_NANO),
];

fn fields(context: Context, signal: SignalKind) -> &'static [Field] {
    match (context, signal) {
        (Context::Request, SignalKind::Traces) => TRACES_REQUEST,
        (Context::Request, SignalKind::Metrics) => METRICS_REQUEST,
        (Context::Request, SignalKind::Logs) => LOGS_REQUEST,
        (Context::ResourceContainer, SignalKind::Traces) => RESOURCE_SPANS,
        (Context::ResourceContainer, SignalKind::Metrics) => RESOURCE_METRICS,
        (Context::ResourceContainer, SignalKind::Logs) => RESOURCE_LOGS,
        (Context::ScopeContainer, SignalKind::Traces) => SCOPE_SPANS,
        (Context::ScopeContainer, SignalKind::Metrics) => SCOPE_METRICS,
        (Context::ScopeContainer, SignalKind::Logs) => SCOPE_LOGS,
        (Context::Resource, _) => RESOURCE,
        (Context::Scope, _) => SCOPE,
        (Context::Span, _) => SPAN,
        (Context::Event, _) => EVENT,
        (Context::Status, _) => STATUS,
        (Context::Metric, _) => METRIC,
        (Context::LogRecord, _) => LOG_RECORD,
    }
}

fn lookup(context: Context, signal: SignalKind, name: &str) -> Option<Step> {
    fields(context, signal)
        .iter()
        .find(|field| name_matches(name, field.name))
        .map(|field| field.step)
}

/// 忽略下划线与 ASCII 大小写比较段名：`scope_spans`、`ScopeSpans` 与 `scopeSpans` 等价。
fn name_matches(segment: &str, canonical: &str) -> bool {
    let mut lhs = segment.bytes().filter(|b| *b != b'_');
    let mut rhs = canonical.bytes();
    loop {
        match (lhs.next(), rhs.next()) {
            (None, None) => return true,
            (Some(a), Some(b)) if a.eq_ignore_ascii_case(&b) => {}
            _ => return false,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Repeat {
    None,
    Any,
    First,
}

#[derive(Clone, Debug)]
struct Segment {
    name: String,
    repeat: Repeat,
    key: Option<String>,
    position: usize,
}

impl Segment {
    fn expect_bare(&self) -> Result<(), CompileError> {
        if self.repeat == Repeat::None && self.key.is_none() {
            return Ok(());
        }
        Err(CompileError::new(
            CompileErrorCode::ParseError,
            format!("`{}` does not accept a bracket suffix", self.name),
            self.position,
        ))
    }
}

fn parse_error(message: impl Into<String>, position: usize) -> CompileError {
    CompileError::new(CompileErrorCode::ParseError, message, position)
}

/// 按顶层 `.` 切分；方括号内部与引号内部的 `.` 不参与切分。
fn split_segments(source: &str) -> Result<Vec<Segment>, CompileError> {
    let mut segments = Vec::new();
    let mut start = 0;
    let mut depth = 0usize;
    let mut quote: Option<u8> = None;
    let mut escaped = false;

    for (index, byte) in source.bytes().enumerate() {
        if let Some(open) = quote {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == open {
                quote = None;
            }
            continue;
        }
        match byte {
            b'"' | b'\'' if depth > 0 => quote = Some(byte),
            b'[' => depth += 1,
            b']' => {
                if depth == 0 {
                    return Err(parse_error("unbalanced `]`", index));
                }
                depth -= 1;
            }
            b'.' if depth == 0 => {
                segments.push(parse_segment(source, start, index)?);
                start = index + 1;
            }
            _ => {}
        }
    }
    if quote.is_some() {
        return Err(parse_error("unterminated quoted key", source.len()));
    }
    if depth > 0 {
        return Err(parse_error("unbalanced `[`", source.len()));
    }
    segments.push(parse_segment(source, start, source.len())?);
    Ok(segments)
}

fn parse_segment(source: &str, start: usize, end: usize) -> Result<Segment, CompileError> {
    let raw = &source[start..end];
    let position = start + (raw.len() - raw.trim_start().len());
    let token = raw.trim();
    if token.is_empty() {
        return Err(parse_error("empty segment", position));
    }
    let Some(open) = token.find('[') else {
        return Ok(Segment {
            name: token.to_owned(),
            repeat: Repeat::None,
            key: None,
            position,
        });
    };
    if !token.ends_with(']') {
        return Err(parse_error(
            "unexpected characters after `]`",
            position + token.len(),
        ));
    }
    let name = token[..open].trim_end();
    if name.is_empty() {
        return Err(parse_error("missing field name before `[`", position));
    }
    let inner = token[open + 1..token.len() - 1].trim();
    let (repeat, key) = match inner {
        "*" => (Repeat::Any, None),
        "0" => (Repeat::First, None),
        _ => {
            let key = unquote(inner).ok_or_else(|| {
                parse_error(
                    format!("unsupported bracket token `{inner}`"),
                    position + open,
                )
            })?;
            (Repeat::None, Some(key))
        }
    };
    Ok(Segment {
        name: name.to_owned(),
        repeat,
        key,
        position,
    })
}

/// 去掉成对的单/双引号并处理反斜杠转义。
fn unquote(token: &str) -> Option<String> {
    let quote = token.chars().next().filter(|c| *c == '"' || *c == '\'')?;
    let body = token.strip_prefix(quote)?.strip_suffix(quote)?;
    let mut key = String::with_capacity(body.len());
    let mut chars = body.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => key.push(chars.next()?),
            c if c == quote => return None,
            c => key.push(c),
        }
    }
    Some(key)
}
