//! base-128 varint 的编码、解码与长度计算。
//!
//! 游标解析 tag/长度、求值器读取标量、重组引擎重写长度前缀都依赖这里的同一套实现，
//! 保证“写出的字节数”与“长度表给出的字节数”永远一致。

use crate::error::{WireError, WireErrorKind};

/// u32 varint 的最大字节数。
pub const MAX_VARINT32_BYTES: usize = 5;
/// u64 varint 的最大字节数。
pub const MAX_VARINT64_BYTES: usize = 10;

/// 编码 `value` 所需的字节数：`< 2^7` 为 1，`< 2^14` 为 2，`< 2^21` 为 3，`< 2^28` 为 4，其余为 5。
#[inline]
pub const fn varint_size(value: u32) -> usize {
    if value < 1 << 7 {
        1
    } else if value < 1 << 14 {
        2
    } else if value < 1 << 21 {
        3
    } else if value < 1 << 28 {
        4
    } else {
        5
    }
}

/// u64 版本的长度表，范围 1..=10。
#[inline]
pub const fn varint_size64(value: u64) -> usize {
    let bits = 64 - (value | 1).leading_zeros() as usize;
    bits.div_ceil(7)
}

/// 把 `value` 写入 `out` 开头，返回写入的字节数；`out` 不足时返回 `None` 且不写入任何字节。
pub fn encode_varint32(value: u32, out: &mut [u8]) -> Option<usize> {
    let size = varint_size(value);
    if out.len() < size {
        return None;
    }
    let mut remaining = value;
    for slot in out.iter_mut().take(size - 1) {
        *slot = (remaining as u8 & 0x7F) | 0x80;
        remaining >>= 7;
    }
    out[size - 1] = remaining as u8;
    Some(size)
}

/// 按宽度 `width` 写入 `value`，不足的高位以 `0x80` 续位填充（非最短编码）。
///
/// 长度前缀原地重写时需要保持原有字节数，此时即便新值可以更短也必须占满原宽度。
pub fn encode_varint32_padded(value: u32, width: usize, out: &mut [u8]) -> Option<usize> {
    if width == 0 || width > MAX_VARINT32_BYTES || width < varint_size(value) || out.len() < width {
        return None;
    }
    let mut remaining = value;
    for slot in out.iter_mut().take(width - 1) {
        *slot = (remaining as u8 & 0x7F) | 0x80;
        remaining >>= 7;
    }
    out[width - 1] = remaining as u8;
    Some(width)
}

/// 严格的 u32 解码：至多 5 字节且第 5 字节不得超出 32 位，用于 tag 与长度前缀。
///
/// 返回 `(value, consumed)`；`base` 仅用于错误定位。
pub fn decode_varint32_strict(buf: &[u8], base: usize) -> Result<(u32, usize), WireError> {
    let mut value: u32 = 0;
    for (index, byte) in buf.iter().copied().enumerate() {
        if index == MAX_VARINT32_BYTES - 1 && byte > 0x0F {
            return Err(WireError::new(WireErrorKind::VarintOverflow, base));
        }
        value |= u32::from(byte & 0x7F) << (7 * index);
        if byte & 0x80 == 0 {
            return Ok((value, index + 1));
        }
    }
    Err(WireError::new(WireErrorKind::TruncatedFrame, base + buf.len()))
}

/// 宽松的 u32 解码：兼容负数 int32 的 10 字节符号扩展编码，结果截断到低 32 位。
pub fn decode_varint32(buf: &[u8], base: usize) -> Result<(u32, usize), WireError> {
    let (value, consumed) = decode_varint64(buf, base)?;
    Ok((value as u32, consumed))
}

/// u64 解码，至多 10 字节；第 10 字节仍带续位时视为溢出。
pub fn decode_varint64(buf: &[u8], base: usize) -> Result<(u64, usize), WireError> {
    let mut value: u64 = 0;
    for (index, byte) in buf.iter().copied().enumerate() {
        if index == MAX_VARINT64_BYTES - 1 && byte > 0x01 {
            return Err(WireError::new(WireErrorKind::VarintOverflow, base));
        }
        value |= u64::from(byte & 0x7F) << (7 * index);
        if byte & 0x80 == 0 {
            return Ok((value, index + 1));
        }
    }
    Err(WireError::new(WireErrorKind::TruncatedFrame, base + buf.len()))
}
