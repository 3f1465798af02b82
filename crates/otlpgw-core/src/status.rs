use core::fmt;

/// 网关数据面统一使用的状态码。
///
/// # 教案式说明
/// - **意图 (Why)**：分配拒绝、重组失败、校验拒绝等结果最终都要映射为对外的 HTTP 语义，
///   集中定义可以避免各组件各自维护魔法数字。
/// - **契约 (What)**：[`StatusCode::as_u16`] 返回稳定数值，[`StatusCode::as_str`] 返回适合日志字段的
///   稳定标识；两者在版本之间保持不变。
/// - **风险 (Trade-offs)**：线格式常量（字段号、varint 掩码）不在此处定义，它们属于 `otlpgw-wire`。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum StatusCode {
    Ok,
    BadRequest,
    NotFound,
    Conflict,
    Gone,
    UnprocessableEntity,
    TooManyRequests,
    InternalError,
    ServiceUnavailable,
    InsufficientStorage,
}

impl StatusCode {
    /// 返回与 HTTP 对齐的数值状态码。
    pub const fn as_u16(self) -> u16 {
        match self {
            Self::Ok => 200,
            Self::BadRequest => 400,
            Self::NotFound => 404,
            Self::Conflict => 409,
            Self::Gone => 410,
            Self::UnprocessableEntity => 422,
            Self::TooManyRequests => 429,
            Self::InternalError => 500,
            Self::ServiceUnavailable => 503,
            Self::InsufficientStorage => 507,
        }
    }

    /// 返回用于结构化日志的稳定标识。
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::BadRequest => "bad_request",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::Gone => "gone",
            Self::UnprocessableEntity => "unprocessable_entity",
            Self::TooManyRequests => "too_many_requests",
            Self::InternalError => "internal_error",
            Self::ServiceUnavailable => "service_unavailable",
            Self::InsufficientStorage => "insufficient_storage",
        }
    }

    /// 是否属于服务端错误（5xx）。
    pub const fn is_server_error(self) -> bool {
        self.as_u16() >= 500
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.as_u16(), self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_codes_are_stable() {
        assert_eq!(StatusCode::Gone.as_u16(), 410);
        assert_eq!(StatusCode::UnprocessableEntity.as_u16(), 422);
        assert_eq!(StatusCode::InsufficientStorage.as_u16(), 507);
        assert!(StatusCode::ServiceUnavailable.is_server_error());
        assert!(!StatusCode::BadRequest.is_server_error());
        assert_eq!(StatusCode::Conflict.to_string(), "409 conflict");
    }
}
