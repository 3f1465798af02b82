use core::fmt;

/// OTLP 信号种类。
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub enum SignalKind {
    #[default]
    Traces,
    Metrics,
    Logs,
}

impl SignalKind {
    pub const ALL: [SignalKind; 3] = [SignalKind::Traces, SignalKind::Metrics, SignalKind::Logs];

    /// 小写名称，与 OTLP 端点路径（`/v1/traces` 等）一致。
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Traces => "traces",
            Self::Metrics => "metrics",
            Self::Logs => "logs",
        }
    }

    /// 不区分大小写地解析信号名称，未知名称返回 `None`。
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(trimmed))
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 报文进入网关时的承载协议。
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub enum ProtocolKind {
    #[default]
    Unknown,
    OtlpHttpProtobuf,
    OtlpHttpJson,
    OtlpGrpc,
}

/// 报文元数据，随 [`PacketRef`](crate::PacketRef) 一起流转。
///
/// - `packet_id`：分配器内单调递增的报文编号；
/// - `request_id`：上游请求标识，用于把日志与审计串联起来；
/// - `ingest_nanos`：进入网关的单调时钟读数（纳秒），由接入层填写。
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PacketDescriptor {
    pub packet_id: u64,
    pub request_id: u64,
    pub signal: SignalKind,
    pub protocol: ProtocolKind,
    pub ingest_nanos: u64,
}

impl PacketDescriptor {
    pub fn new(packet_id: u64, request_id: u64, signal: SignalKind, protocol: ProtocolKind) -> Self {
        Self {
            packet_id,
            request_id,
            signal,
            protocol,
            ingest_nanos: 0,
        }
    }

    pub fn for_signal(signal: SignalKind) -> Self {
        Self {
            signal,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_request_id(mut self, request_id: u64) -> Self {
        self.request_id = request_id;
        self
    }

    #[must_use]
    pub fn with_ingest_nanos(mut self, ingest_nanos: u64) -> Self {
        self.ingest_nanos = ingest_nanos;
        self
    }
}
