//! 变更引擎集成测试共用的报文夹具。
#![allow(dead_code)]

use otlpgw_core::{PacketDescriptor, PacketRef, SignalKind};

pub fn varint(mut value: u64, out: &mut Vec<u8>) {
    while value >= 0x80 {
        out.push((value as u8 & 0x7F) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

pub fn len_field(field: u32, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 6);
    varint(u64::from(field << 3 | 2), &mut out);
    varint(body.len() as u64, &mut out);
    out.extend_from_slice(body);
    out
}

pub fn message(field: u32, parts: &[Vec<u8>]) -> Vec<u8> {
    len_field(field, &parts.concat())
}

pub fn string_attribute(key: &str, value: &str) -> Vec<u8> {
    key_value(1, key, value)
}

fn key_value(field: u32, key: &str, value: &str) -> Vec<u8> {
    message(
        field,
        &[
            len_field(1, key.as_bytes()),
            message(2, &[len_field(1, value.as_bytes())]),
        ],
    )
}

/// `ExportTraceServiceRequest`：一个 resourceSpans，带给定资源属性，
/// 以及一个名为 `span_name`、携带 `span_attributes` 的 span。
pub fn traces_request(
    attributes: &[(&str, &str)],
    span_name: &str,
    span_attributes: &[(&str, &str)],
) -> Vec<u8> {
    let resource: Vec<Vec<u8>> = attributes
        .iter()
        .map(|(key, value)| string_attribute(key, value))
        .collect();
    let mut span = vec![len_field(1, &[0xAB; 16]), len_field(5, span_name.as_bytes())];
    span.extend(
        span_attributes
            .iter()
            .map(|(key, value)| key_value(9, key, value)),
    );
    let span = message(2, &span);
    message(1, &[message(1, &resource), message(2, &[span])])
}

/// 单层 LEN 消息：`0x0A <varint len> 0 1 2 ...`。
pub fn len_message(body_length: usize) -> Vec<u8> {
    let mut out = vec![0x0A];
    varint(body_length as u64, &mut out);
    out.extend((0..body_length).map(|i| i as u8));
    out
}

pub fn packet(bytes: Vec<u8>, signal: SignalKind) -> PacketRef {
    PacketRef::wrap(bytes, PacketDescriptor::for_signal(signal).with_request_id(7))
}

/// 在 `haystack` 中查找 `needle` 的首个位置。
pub fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}
