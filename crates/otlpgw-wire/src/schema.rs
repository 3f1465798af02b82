//! OTLP v1 线格式字段号与模式标识。
//!
//! 字段号取自 `opentelemetry/proto` 的 v1 定义，编译器的字段表与资源属性选择器都引用这里的常量，
//! 避免在多处手写魔数。

use core::fmt;

/// 路径编译所针对的模式，例如 `otlp/v1`。
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct SchemaId {
    pub name: String,
    pub version: String,
}

impl SchemaId {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }

    /// 网关唯一支持的模式。
    pub fn otlp_v1() -> Self {
        Self::new("otlp", "v1")
    }

    /// 名称与版本均大小写不敏感地等于 `otlp` / `v1`。
    pub fn is_otlp_v1(&self) -> bool {
        self.name.eq_ignore_ascii_case("otlp") && self.version.eq_ignore_ascii_case("v1")
    }
}

impl Default for SchemaId {
    fn default() -> Self {
        Self::otlp_v1()
    }
}

impl fmt::Display for SchemaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.version)
    }
}

/// `Export*ServiceRequest.resource_{spans,metrics,logs}`。
pub const REQUEST_RESOURCE_CONTAINER: u32 = 1;

/// `Resource{Spans,Metrics,Logs}` 的字段。
pub mod resource_container {
    pub const RESOURCE: u32 = 1;
    pub const SCOPE_CONTAINER: u32 = 2;
    pub const SCHEMA_URL: u32 = 3;
}

/// `Resource` 的字段。
pub mod resource {
    pub const ATTRIBUTES: u32 = 1;
    pub const DROPPED_ATTRIBUTES_COUNT: u32 = 2;
}

/// `Scope{Spans,Metrics,Logs}` 的字段。
pub mod scope_container {
    pub const SCOPE: u32 = 1;
    pub const ITEMS: u32 = 2;
    pub const SCHEMA_URL: u32 = 3;
}

/// `InstrumentationScope` 的字段。
pub mod scope {
    pub const NAME: u32 = 1;
    pub const VERSION: u32 = 2;
    pub const ATTRIBUTES: u32 = 3;
    pub const DROPPED_ATTRIBUTES_COUNT: u32 = 4;
}

/// `Span` 的字段。
pub mod span {
    pub const TRACE_ID: u32 = 1;
    pub const SPAN_ID: u32 = 2;
    pub const TRACE_STATE: u32 = 3;
    pub const PARENT_SPAN_ID: u32 = 4;
    pub const NAME: u32 = 5;
    pub const KIND: u32 = 6;
    pub const START_TIME_UNIX_NANO: u32 = 7;
    pub const END_TIME_UNIX_NANO: u32 = 8;
    pub const ATTRIBUTES: u32 = 9;
    pub const DROPPED_ATTRIBUTES_COUNT: u32 = 10;
    pub const EVENTS: u32 = 11;
    pub const DROPPED_EVENTS_COUNT: u32 = 12;
    pub const LINKS: u32 = 13;
    pub const DROPPED_LINKS_COUNT: u32 = 14;
    pub const STATUS: u32 = 15;
    pub const FLAGS: u32 = 16;
}

/// `Span.Event` 的字段。
pub mod event {
    pub const TIME_UNIX_NANO: u32 = 1;
    pub const NAME: u32 = 2;
    pub const ATTRIBUTES: u32 = 3;
    pub const DROPPED_ATTRIBUTES_COUNT: u32 = 4;
}

/// `Status` 的字段（字段 1 已保留）。
pub mod status {
    pub const MESSAGE: u32 = 2;
    pub const CODE: u32 = 3;
}

/// `Metric` 的标识字段（数据点 oneof 不在路径范围内）。
pub mod metric {
    pub const NAME: u32 = 1;
    pub const DESCRIPTION: u32 = 2;
    pub const UNIT: u32 = 3;
}

/// `LogRecord` 的字段。
pub mod log_record {
    pub const TIME_UNIX_NANO: u32 = 1;
    pub const SEVERITY_NUMBER: u32 = 2;
    pub const SEVERITY_TEXT: u32 = 3;
    pub const BODY: u32 = 5;
    pub const ATTRIBUTES: u32 = 6;
    pub const DROPPED_ATTRIBUTES_COUNT: u32 = 7;
    pub const FLAGS: u32 = 8;
    pub const TRACE_ID: u32 = 9;
    pub const SPAN_ID: u32 = 10;
    pub const OBSERVED_TIME_UNIX_NANO: u32 = 11;
}

/// `KeyValue` 的字段。
pub mod key_value {
    pub const KEY: u32 = 1;
    pub const VALUE: u32 = 2;
}

/// `AnyValue` 的 oneof 分支。
pub mod any_value {
    pub const STRING_VALUE: u32 = 1;
    pub const BOOL_VALUE: u32 = 2;
    pub const INT_VALUE: u32 = 3;
    pub const DOUBLE_VALUE: u32 = 4;
    pub const ARRAY_VALUE: u32 = 5;
    pub const KVLIST_VALUE: u32 = 6;
    pub const BYTES_VALUE: u32 = 7;
}
