//! 只前进的 protobuf 线格式游标。
//!
//! # 教案式说明
//! - **意图（Why）**：在不分配、不反序列化的前提下逐字段遍历报文，让求值器与选择器只为真正关心的字段付费；
//! - **逻辑（How）**：[`FastWireCursor::next_field`] 解析 tag 与值的位置，LEN 字段默认整体跳过；
//!   调用 [`WireCursor::enter_message`] 才会把当前帧压栈并进入子消息，[`WireCursor::leave_message`] 弹栈后
//!   定位到子消息末尾；帧栈是定长数组，深度上限 [`MAX_FRAME_DEPTH`]；
//! - **契约（What）**：所有越界、截断、非法 tag 都以 [`WireError`] 返回，不会 panic，也不会读出区间之外的字节。

use crate::error::{WireError, WireErrorKind};
use crate::varint::{decode_varint32, decode_varint32_strict, decode_varint64};

/// 帧栈的固定深度。
pub const MAX_FRAME_DEPTH: usize = 32;

/// protobuf 线类型。组（3/4）已废弃，不在支持范围内。
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum WireType {
    #[default]
    Varint = 0,
    I64 = 1,
    Len = 2,
    I32 = 5,
}

impl WireType {
    /// 从 tag 低 3 位解析线类型。
    pub const fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            0 => Some(Self::Varint),
            1 => Some(Self::I64),
            2 => Some(Self::Len),
            5 => Some(Self::I32),
            _ => None,
        }
    }

    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

/// 线格式游标契约。
///
/// 求值器以 `&dyn WireCursor` 接收游标，只需要它给出底层区间与当前扫描窗口；
/// 字段级的访问器供选择器、测试与诊断工具逐字段检视报文。
pub trait WireCursor<'a> {
    /// 重新定位到 `region[offset..offset + length]`，清空帧栈。
    fn reset(&mut self, region: &'a [u8], offset: usize, length: usize) -> Result<(), WireError>;

    /// 前进到下一个字段；返回 `false` 表示当前帧已读完。
    fn next_field(&mut self) -> Result<bool, WireError>;

    fn field_number(&self) -> u32;
    fn wire_type(&self) -> WireType;
    /// 当前字段 tag 的起始偏移。
    fn field_start(&self) -> usize;
    /// 当前字段值的起始偏移（LEN 字段为长度前缀之后）。
    fn value_offset(&self) -> usize;
    /// 当前字段值的字节数。
    fn value_length(&self) -> usize;

    /// 以当前 LEN 字段为新帧下钻。
    fn enter_message(&mut self) -> Result<(), WireError>;
    /// 弹出最内层帧并定位到其末尾。
    fn leave_message(&mut self) -> Result<(), WireError>;

    fn read_varint32(&self) -> Result<u32, WireError>;
    fn read_varint64(&self) -> Result<u64, WireError>;
    fn read_fixed32(&self) -> Result<u32, WireError>;
    fn read_fixed64(&self) -> Result<u64, WireError>;

    /// 当前字段值的零拷贝切片。
    fn slice_value(&self) -> &'a [u8];

    /// 底层完整区间。
    fn region(&self) -> &'a [u8];
    /// 下一次 `next_field` 的起点。
    fn position(&self) -> usize;
    /// 当前帧的结束偏移。
    fn limit(&self) -> usize;
    /// 根帧的 `(offset, length)`。
    fn bounds(&self) -> (usize, usize);

    /// 当前帧剩余的字节数。
    fn remaining(&self) -> usize {
        self.limit().saturating_sub(self.position())
    }
}

/// 基于 `&[u8]` 的游标实现。
#[derive(Clone, Debug)]
pub struct FastWireCursor<'a> {
    region: &'a [u8],
    root_offset: usize,
    root_length: usize,
    pos: usize,
    limit: usize,
    frames: [usize; MAX_FRAME_DEPTH],
    depth: usize,
    field_number: u32,
    wire_type: WireType,
    field_start: usize,
    value_offset: usize,
    value_length: usize,
}

impl Default for FastWireCursor<'_> {
    fn default() -> Self {
        Self {
            region: &[],
            root_offset: 0,
            root_length: 0,
            pos: 0,
            limit: 0,
            frames: [0; MAX_FRAME_DEPTH],
            depth: 0,
            field_number: 0,
            wire_type: WireType::Varint,
            field_start: 0,
            value_offset: 0,
            value_length: 0,
        }
    }
}

impl<'a> FastWireCursor<'a> {
    /// 创建覆盖整个 `region` 的游标。
    pub fn new(region: &'a [u8]) -> Self {
        let mut cursor = Self::default();
        cursor.region = region;
        cursor.root_length = region.len();
        cursor.limit = region.len();
        cursor
    }

    /// 创建覆盖 `region[offset..offset + length]` 的游标。
    pub fn over(region: &'a [u8], offset: usize, length: usize) -> Result<Self, WireError> {
        let mut cursor = Self::default();
        cursor.reset(region, offset, length)?;
        Ok(cursor)
    }

    /// 当前嵌套深度（根帧为 0）。
    pub fn depth(&self) -> usize {
        self.depth
    }

    fn value_bytes(&self, width: usize) -> Result<&'a [u8], WireError> {
        if self.value_length < width {
            return Err(WireError::new(
                WireErrorKind::TruncatedFrame,
                self.value_offset,
            ));
        }
        Ok(&self.region[self.value_offset..self.value_offset + width])
    }
}

impl<'a> WireCursor<'a> for FastWireCursor<'a> {
    fn reset(&mut self, region: &'a [u8], offset: usize, length: usize) -> Result<(), WireError> {
        let end = offset
            .checked_add(length)
            .filter(|end| *end <= region.len())
            .ok_or(WireError::new(WireErrorKind::TruncatedFrame, offset))?;
        self.region = region;
        self.root_offset = offset;
        self.root_length = length;
        self.pos = offset;
        self.limit = end;
        self.depth = 0;
        self.field_number = 0;
        self.wire_type = WireType::Varint;
        self.field_start = offset;
        self.value_offset = offset;
        self.value_length = 0;
        Ok(())
    }

    fn next_field(&mut self) -> Result<bool, WireError> {
        if self.pos >= self.limit {
            return Ok(false);
        }
        let start = self.pos;
        let (tag, tag_len) = decode_varint32_strict(&self.region[start..self.limit], start)?;
        let field_number = tag >> 3;
        if tag == 0 || field_number == 0 {
            return Err(WireError::new(WireErrorKind::InvalidTag, start));
        }
        let wire_type = WireType::from_bits(tag & 0x07)
            .ok_or(WireError::new(WireErrorKind::UnsupportedWireType, start))?;
        let value_start = start + tag_len;
        let available = &self.region[value_start..self.limit];

        let (value_offset, value_length) = match wire_type {
            WireType::Varint => {
                let (_, consumed) = decode_varint64(available, value_start)?;
                (value_start, consumed)
            }
            WireType::I64 => (value_start, 8),
            WireType::I32 => (value_start, 4),
            WireType::Len => {
                let (length, prefix) = decode_varint32_strict(available, value_start)?;
                if length > i32::MAX as u32 {
                    return Err(WireError::new(WireErrorKind::TruncatedFrame, value_start));
                }
                (value_start + prefix, length as usize)
            }
        };
        if value_offset + value_length > self.limit {
            return Err(WireError::new(WireErrorKind::TruncatedFrame, value_offset));
        }

        self.field_number = field_number;
        self.wire_type = wire_type;
        self.field_start = start;
        self.value_offset = value_offset;
        self.value_length = value_length;
        self.pos = value_offset + value_length;
        Ok(true)
    }

    fn field_number(&self) -> u32 {
        self.field_number
    }

    fn wire_type(&self) -> WireType {
        self.wire_type
    }

    fn field_start(&self) -> usize {
        self.field_start
    }

    fn value_offset(&self) -> usize {
        self.value_offset
    }

    fn value_length(&self) -> usize {
        self.value_length
    }

    fn enter_message(&mut self) -> Result<(), WireError> {
        if self.wire_type != WireType::Len || self.field_number == 0 {
            return Err(WireError::new(
                WireErrorKind::UnsupportedWireType,
                self.field_start,
            ));
        }
        if self.depth == MAX_FRAME_DEPTH {
            return Err(WireError::new(WireErrorKind::NestingLimit, self.value_offset));
        }
        let end = self.value_offset + self.value_length;
        if end > self.limit {
            return Err(WireError::new(WireErrorKind::TruncatedFrame, self.value_offset));
        }
        self.frames[self.depth] = self.limit;
        self.depth += 1;
        self.limit = end;
        self.pos = self.value_offset;
        Ok(())
    }

    fn leave_message(&mut self) -> Result<(), WireError> {
        if self.depth == 0 {
            return Err(WireError::new(WireErrorKind::FrameStackUnderflow, self.pos));
        }
        self.depth -= 1;
        self.pos = self.limit;
        self.limit = self.frames[self.depth];
        Ok(())
    }

    fn read_varint32(&self) -> Result<u32, WireError> {
        self.expect_type(WireType::Varint)?;
        decode_varint32(self.slice_value(), self.value_offset).map(|(value, _)| value)
    }

    fn read_varint64(&self) -> Result<u64, WireError> {
        self.expect_type(WireType::Varint)?;
        decode_varint64(self.slice_value(), self.value_offset).map(|(value, _)| value)
    }

    fn read_fixed32(&self) -> Result<u32, WireError> {
        self.expect_type(WireType::I32)?;
        let bytes = self.value_bytes(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_fixed64(&self) -> Result<u64, WireError> {
        self.expect_type(WireType::I64)?;
        let bytes = self.value_bytes(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(raw))
    }

    fn slice_value(&self) -> &'a [u8] {
        &self.region[self.value_offset..self.value_offset + self.value_length]
    }

    fn region(&self) -> &'a [u8] {
        self.region
    }

    fn position(&self) -> usize {
        self.pos
    }

    fn limit(&self) -> usize {
        self.limit
    }

    fn bounds(&self) -> (usize, usize) {
        (self.root_offset, self.root_length)
    }
}

impl FastWireCursor<'_> {
    fn expect_type(&self, expected: WireType) -> Result<(), WireError> {
        if self.field_number == 0 || self.wire_type != expected {
            return Err(WireError::new(
                WireErrorKind::UnsupportedWireType,
                self.field_start,
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIXTURE: [u8; 18] = [
        0x08, 0x96, 0x01, // field 1 varint 150
        0x12, 0x05, b'H', b'e', b'l', b'l', b'o', // field 2 LEN "Hello"
        0x19, 1, 2, 3, 4, 5, 6, 7, // field 3 I64, one byte short on purpose below
    ];

    fn fixture() -> Vec<u8> {
        let mut bytes = FIXTURE.to_vec();
        bytes.push(8);
        bytes
    }

    #[test]
    fn walks_fields_in_order() {
        let bytes = fixture();
        let mut cursor = FastWireCursor::new(&bytes);

        assert!(cursor.next_field().expect("field 1"));
        assert_eq!(
            (cursor.field_number(), cursor.wire_type().as_u8(), cursor.value_length()),
            (1, 0, 2)
        );
        assert_eq!(cursor.read_varint32(), Ok(150));

        assert!(cursor.next_field().expect("field 2"));
        assert_eq!(
            (cursor.field_number(), cursor.wire_type().as_u8(), cursor.value_length()),
            (2, 2, 5)
        );
        assert_eq!(cursor.slice_value(), b"Hello");

        assert!(cursor.next_field().expect("field 3"));
        assert_eq!(
            (cursor.field_number(), cursor.wire_type().as_u8(), cursor.value_length()),
            (3, 1, 8)
        );
        assert_eq!(cursor.read_fixed64(), Ok(0x0807_0605_0403_0201));

        assert!(!cursor.next_field().expect("end of frame"));
        assert_eq!(cursor.remaining(), 0);
    }

    #[test]
    fn truncated_fixed64_is_reported() {
        let mut cursor = FastWireCursor::new(&FIXTURE);
        assert!(cursor.next_field().unwrap());
        assert!(cursor.next_field().unwrap());
        let err = cursor.next_field().unwrap_err();
        assert_eq!(err.kind, WireErrorKind::TruncatedFrame);
        assert_eq!(err.position, 11);
    }

    #[test]
    fn zero_tag_is_invalid() {
        let mut cursor = FastWireCursor::new(&[0x00, 0x01]);
        assert_eq!(cursor.next_field().unwrap_err().kind, WireErrorKind::InvalidTag);
    }

    #[test]
    fn group_wire_types_are_unsupported() {
        let mut cursor = FastWireCursor::new(&[0x0B]);
        assert_eq!(
            cursor.next_field().unwrap_err().kind,
            WireErrorKind::UnsupportedWireType
        );
    }

    #[test]
    fn negative_length_is_truncation() {
        // field 1 LEN with length 0xFFFFFFFF
        let bytes = [0x0A, 0xFF, 0xFF, 0xFF, 0xFF, 0x0F];
        let mut cursor = FastWireCursor::new(&bytes);
        assert_eq!(
            cursor.next_field().unwrap_err().kind,
            WireErrorKind::TruncatedFrame
        );
    }

    #[test]
    fn enter_and_leave_nested_message() {
        // field 1 { field 2 varint 1 }, field 3 varint 7
        let bytes = [0x0A, 0x02, 0x10, 0x01, 0x18, 0x07];
        let mut cursor = FastWireCursor::new(&bytes);
        assert!(cursor.next_field().unwrap());
        cursor.enter_message().expect("enter field 1");
        assert_eq!(cursor.depth(), 1);
        assert!(cursor.next_field().unwrap());
        assert_eq!(cursor.field_number(), 2);
        assert!(!cursor.next_field().unwrap());
        cursor.leave_message().expect("leave");
        assert!(cursor.next_field().unwrap());
        assert_eq!((cursor.field_number(), cursor.read_varint64()), (3, Ok(7)));
        assert_eq!(
            cursor.leave_message().unwrap_err().kind,
            WireErrorKind::FrameStackUnderflow
        );
    }

    #[test]
    fn enter_on_scalar_is_rejected() {
        let bytes = [0x08, 0x01];
        let mut cursor = FastWireCursor::new(&bytes);
        assert!(cursor.next_field().unwrap());
        assert_eq!(
            cursor.enter_message().unwrap_err().kind,
            WireErrorKind::UnsupportedWireType
        );
    }

    #[test]
    fn nesting_beyond_frame_depth_is_rejected() {
        let mut bytes = vec![0x08, 0x01];
        for _ in 0..=MAX_FRAME_DEPTH {
            let mut wrapped = vec![0x0A, bytes.len() as u8];
            wrapped.extend_from_slice(&bytes);
            bytes = wrapped;
        }
        let mut cursor = FastWireCursor::new(&bytes);
        let mut outcome = Ok(());
        for _ in 0..=MAX_FRAME_DEPTH {
            assert!(cursor.next_field().unwrap());
            outcome = cursor.enter_message();
            if outcome.is_err() {
                break;
            }
        }
        assert_eq!(outcome.unwrap_err().kind, WireErrorKind::NestingLimit);
    }

    #[test]
    fn reset_rejects_window_beyond_region() {
        let mut cursor = FastWireCursor::default();
        assert!(cursor.reset(&[1, 2, 3], 2, 2).is_err());
        cursor.reset(&[0xFF, 0x08, 0x01], 1, 2).expect("window");
        assert!(cursor.next_field().unwrap());
        assert_eq!(cursor.bounds(), (1, 2));
    }
}
