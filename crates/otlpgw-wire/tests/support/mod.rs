//! 测试用的最小 protobuf 编码器，只覆盖构造 OTLP 夹具所需的字段形态。
#![allow(dead_code)]

pub fn varint(mut value: u64, out: &mut Vec<u8>) {
    while value >= 0x80 {
        out.push((value as u8 & 0x7F) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

pub fn tag(field: u32, wire_type: u8, out: &mut Vec<u8>) {
    varint(u64::from(field << 3 | u32::from(wire_type)), out);
}

pub fn varint_field(field: u32, value: u64) -> Vec<u8> {
    let mut out = Vec::new();
    tag(field, 0, &mut out);
    varint(value, &mut out);
    out
}

pub fn fixed64_field(field: u32, value: u64) -> Vec<u8> {
    let mut out = Vec::new();
    tag(field, 1, &mut out);
    out.extend_from_slice(&value.to_le_bytes());
    out
}

pub fn len_field(field: u32, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    tag(field, 2, &mut out);
    varint(body.len() as u64, &mut out);
    out.extend_from_slice(body);
    out
}

pub fn message(field: u32, parts: &[Vec<u8>]) -> Vec<u8> {
    len_field(field, &parts.concat())
}

/// `KeyValue { key, value: AnyValue { string_value } }`，字段号为 `field`。
pub fn string_attribute(field: u32, key: &str, value: &str) -> Vec<u8> {
    message(
        field,
        &[
            len_field(1, key.as_bytes()),
            message(2, &[len_field(1, value.as_bytes())]),
        ],
    )
}

pub fn span(name: &str, events: &[&str]) -> Vec<u8> {
    let mut parts = vec![
        len_field(1, &[0xAB; 16]),
        len_field(5, name.as_bytes()),
        fixed64_field(7, 1_700_000_000_000_000_000),
    ];
    parts.extend(
        events
            .iter()
            .map(|event| message(11, &[len_field(2, event.as_bytes())])),
    );
    parts.push(message(15, &[len_field(2, b"ok"), varint_field(3, 1)]));
    message(2, &parts)
}

/// 两个 resourceSpans：第一个带 tenant_id / region 属性与两个 scopeSpans，第二个只有 region。
pub fn traces_request() -> Vec<u8> {
    let first = message(
        1,
        &[
            message(
                1,
                &[
                    string_attribute(1, "tenant_id", "black_list"),
                    string_attribute(1, "region", "eu-west"),
                ],
            ),
            message(2, &[span("checkout", &["e1"])]),
            message(2, &[span("payment", &["e2"]), span("refund", &[])]),
        ],
    );
    let second = message(
        1,
        &[
            message(1, &[string_attribute(1, "region", "us-east")]),
            message(2, &[span("audit", &["e3"])]),
        ],
    );
    [first, second].concat()
}
