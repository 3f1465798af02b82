//! 资源属性快速选择器。
//!
//! `resource.attributes[<key>]` 是最常见的掩码规则，这里绕开通用字节码解释器，直接按固定的 OTLP 结构扫描：
//! `请求 → ResourceXxx(1) → Resource(1) → KeyValue(1) → AnyValue(2) → string(1) | bytes(7)`。
//! 编码方式取自报文描述符的 `protocol`：protobuf/gRPC 只走 protobuf 扫描，HTTP/JSON 只走 JSON 扫描。
//! 协议未知时先按 protobuf 扫描；只有在扫描失败或顶层出现 `resourceXxx(1)` 以外的字段，
//! 且载荷以 `{` 或 `[` 开头（忽略前导空白）时，才改走感知字符串与花括号层级的 JSON 字节扫描。
//! 不能只看首字节：protobuf 请求以 `0x0A` 开头，随后的长度字节可能恰好是 `{`(123) 或 `[`(91)。
//! 两条路径都把畸形输入当作“未命中”，返回已收集到的区间。

use otlpgw_core::{PacketRef, ProtocolKind};
use otlpgw_wire::schema::{
    REQUEST_RESOURCE_CONTAINER, any_value, key_value, resource, resource_container,
};
use otlpgw_wire::{EvalScratch, FastWireCursor, WireCursor, WireError, WireType};

use crate::span::{SelectorError, ValueSpanCollector, ValueSpanSelector};

const JSON_KEY: &[u8] = b"\"key\"";
const JSON_STRING_VALUE: &[u8] = b"\"stringValue\"";
const JSON_BYTES_VALUE: &[u8] = b"\"bytesValue\"";

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResourceAttributeSpanSelector {
    key: Box<[u8]>,
}

impl ResourceAttributeSpanSelector {
    pub fn new(key: &str) -> Self {
        Self {
            key: key.as_bytes().into(),
        }
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// 返回 `true` 表示扫描到的顶层字段全部是资源容器，即载荷确实像一个 OTLP 导出请求。
    fn collect_protobuf(&self, packet: &PacketRef, collector: &mut ValueSpanCollector) -> bool {
        match self.scan_protobuf(packet, collector) {
            Ok(conforming) => conforming,
            Err(err) => {
                tracing::trace!(code = err.code(), position = err.position, "resource attribute scan stopped on malformed input");
                false
            }
        }
    }

    fn scan_protobuf(
        &self,
        packet: &PacketRef,
        collector: &mut ValueSpanCollector,
    ) -> Result<bool, WireError> {
        let mut cursor = FastWireCursor::over(packet.region(), packet.offset(), packet.length())?;
        let base = packet.offset();
        let mut conforming = true;
        while cursor.next_field()? {
            if !is_len(&cursor, REQUEST_RESOURCE_CONTAINER) {
                conforming = false;
                continue;
            }
            cursor.enter_message()?;
            while cursor.next_field()? {
                if !is_len(&cursor, resource_container::RESOURCE) {
                    continue;
                }
                cursor.enter_message()?;
                while cursor.next_field()? {
                    if !is_len(&cursor, resource::ATTRIBUTES) {
                        continue;
                    }
                    cursor.enter_message()?;
                    let done = self.scan_key_value(&mut cursor, base, collector)?;
                    cursor.leave_message()?;
                    if done {
                        return Ok(conforming);
                    }
                }
                cursor.leave_message()?;
            }
            cursor.leave_message()?;
        }
        Ok(conforming)
    }

    /// 在一个 KeyValue 内查找；返回 `true` 表示收集器已满。
    fn scan_key_value(
        &self,
        cursor: &mut FastWireCursor<'_>,
        base: usize,
        collector: &mut ValueSpanCollector,
    ) -> Result<bool, WireError> {
        let mut key_matched = false;
        while cursor.next_field()? {
            if is_len(cursor, key_value::KEY) {
                key_matched = cursor.slice_value() == &*self.key;
                continue;
            }
            if key_matched && is_len(cursor, key_value::VALUE) {
                cursor.enter_message()?;
                let mut full = false;
                while cursor.next_field()? {
                    let field = cursor.field_number();
                    if cursor.wire_type() == WireType::Len
                        && (field == any_value::STRING_VALUE || field == any_value::BYTES_VALUE)
                    {
                        full = !collector.add(cursor.value_offset() - base, cursor.value_length());
                        break;
                    }
                }
                cursor.leave_message()?;
                return Ok(full || collector.is_full());
            }
        }
        Ok(false)
    }

    fn scan_json(&self, json: &[u8], collector: &mut ValueSpanCollector) {
        let limit = json.len();
        let mut pos = 0;
        while pos < limit {
            let Some(key_field) = index_of(json, JSON_KEY, pos, limit) else {
                return;
            };
            let Some(key_start) = next_string_value(json, key_field + JSON_KEY.len(), limit) else {
                return;
            };
            let Some(key_end) = string_end(json, key_start + 1, limit) else {
                return;
            };
            if json[key_start + 1..key_end] != *self.key {
                pos = key_end + 1;
                continue;
            }
            let Some(object_start) = json[..=key_field].iter().rposition(|&b| b == b'{') else {
                pos = key_end + 1;
                continue;
            };
            let Some(object_end) = object_end(json, object_start, limit) else {
                return;
            };
            if let Some((field_at, field)) = index_of_either(json, key_end + 1, object_end)
                && let Some(value_start) = next_string_value(json, field_at + field.len(), object_end)
                && let Some(value_end) = string_end(json, value_start + 1, object_end)
                && !collector.add(value_start + 1, value_end - (value_start + 1))
            {
                return;
            }
            pos = object_end + 1;
        }
    }
}

impl ValueSpanSelector for ResourceAttributeSpanSelector {
    fn collect(
        &self,
        packet: &PacketRef,
        _scratch: &mut EvalScratch,
        collector: &mut ValueSpanCollector,
    ) -> Result<usize, SelectorError> {
        collector.reset();
        let payload = packet.payload();
        match packet.descriptor().protocol {
            ProtocolKind::OtlpHttpProtobuf | ProtocolKind::OtlpGrpc => {
                self.collect_protobuf(packet, collector);
            }
            ProtocolKind::OtlpHttpJson => self.scan_json(payload, collector),
            ProtocolKind::Unknown => {
                if !self.collect_protobuf(packet, collector) && looks_like_json(payload) {
                    collector.reset();
                    self.scan_json(payload, collector);
                }
            }
        }
        Ok(collector.count())
    }
}

fn is_len(cursor: &FastWireCursor<'_>, field: u32) -> bool {
    cursor.field_number() == field && cursor.wire_type() == WireType::Len
}

fn is_json_whitespace(byte: u8) -> bool {
    matches!(byte, b' ' | b'\n' | b'\r' | b'\t')
}

fn looks_like_json(payload: &[u8]) -> bool {
    payload
        .iter()
        .find(|&&b| !is_json_whitespace(b))
        .is_some_and(|&b| b == b'{' || b == b'[')
}

fn matches_at(src: &[u8], at: usize, pattern: &[u8], limit: usize) -> bool {
    at + pattern.len() <= limit && &src[at..at + pattern.len()] == pattern
}

fn index_of(src: &[u8], pattern: &[u8], from: usize, to: usize) -> Option<usize> {
    (from..to).find(|&at| matches_at(src, at, pattern, to))
}

fn index_of_either(src: &[u8], from: usize, to: usize) -> Option<(usize, &'static [u8])> {
    (from..to).find_map(|at| {
        if matches_at(src, at, JSON_STRING_VALUE, to) {
            Some((at, JSON_STRING_VALUE))
        } else if matches_at(src, at, JSON_BYTES_VALUE, to) {
            Some((at, JSON_BYTES_VALUE))
        } else {
            None
        }
    })
}

/// 跳过 `:` 与空白，返回下一个字符串值开引号的位置；值不是字符串时返回 `None`。
fn next_string_value(src: &[u8], from: usize, limit: usize) -> Option<usize> {
    let colon = (from..limit).find(|&i| src[i] == b':')?;
    let at = (colon + 1..limit).find(|&i| !is_json_whitespace(src[i]))?;
    (src[at] == b'"').then_some(at)
}

/// 从 `from` 开始寻找未转义的闭引号。
fn string_end(src: &[u8], from: usize, limit: usize) -> Option<usize> {
    let mut escaped = false;
    for (i, &b) in src.iter().enumerate().take(limit).skip(from) {
        if escaped {
            escaped = false;
        } else if b == b'\\' {
            escaped = true;
        } else if b == b'"' {
            return Some(i);
        }
    }
    None
}

fn object_end(src: &[u8], start: usize, limit: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in src.iter().enumerate().take(limit).skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}
