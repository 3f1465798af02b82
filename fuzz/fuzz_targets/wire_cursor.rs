#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use otlpgw_wire::{FastWireCursor, WireCursor, WireType};

/// 游标 fuzz 用例：任意字节加一串遍历指令。
///
/// - **Why**：游标直接面对未经校验的入站字节，任何越界读或死循环都会打穿数据面；
/// - **How**：`window` 在报文内截取一段区间，`steps` 决定每次命中 LEN 字段时下钻、跳过还是回退；
/// - **What**：断言每个被报告的值区间都落在扫描区间之内，且遍历步数有界。
#[derive(Debug, Arbitrary)]
struct CursorCase {
    bytes: Vec<u8>,
    window: (u16, u16),
    steps: Vec<Step>,
}

#[derive(Debug, Arbitrary, Clone, Copy)]
enum Step {
    Next,
    Enter,
    Leave,
}

fuzz_target!(|case: CursorCase| {
    let len = case.bytes.len();
    let offset = usize::from(case.window.0) % (len + 1);
    let length = usize::from(case.window.1) % (len - offset + 1);
    let Ok(mut cursor) = FastWireCursor::over(&case.bytes, offset, length) else {
        return;
    };

    for step in case.steps.iter().copied().cycle().take(4096) {
        let on_field = match step {
            Step::Next => cursor.next_field(),
            Step::Enter if cursor.wire_type() == WireType::Len => cursor.enter_message().map(|()| false),
            Step::Enter => Ok(false),
            Step::Leave => cursor.leave_message().map(|()| false),
        };
        match on_field {
            Ok(true) => {}
            Ok(false) => continue,
            Err(_) => return,
        }
        let start = cursor.value_offset();
        let end = start + cursor.value_length();
        assert!(start >= offset && end <= offset + length, "value [{start}, {end}) escaped window");
        assert_eq!(cursor.slice_value().len(), cursor.value_length());
    }
});
