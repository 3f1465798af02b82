//! 掩码写入器：标量实现与 32 字节分道实现。
//!
//! 两种实现对任意输入逐字节等价；分道实现只是把填充与拷贝拆成定长块，交给编译器自动向量化。

use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;

use crate::plan::InplaceMaskOp;

/// 分道宽度；短于该长度的操作直接走标量路径。
pub const LANE_WIDTH: usize = 32;

#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum MaskError {
    #[error("mask [{offset}, {offset}+{length}) exceeds buffer of {buffer} bytes")]
    OutOfBounds {
        offset: usize,
        length: usize,
        buffer: usize,
    },
}

impl MaskError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::OutOfBounds { .. } => "mask.out_of_bounds",
        }
    }
}

/// 掩码写入契约：在 `buffer` 上执行一次 [`InplaceMaskOp`]，永不改变长度。
pub trait MaskWriter: Send + Sync {
    fn mask(&self, buffer: &mut [u8], op: &InplaceMaskOp) -> Result<(), MaskError>;

    fn name(&self) -> &'static str;
}

/// 填充策略，由令牌形态决定。
enum Fill<'a> {
    Byte(u8),
    Copy(&'a [u8]),
}

fn fill_for(op: &InplaceMaskOp) -> Fill<'_> {
    match op.token_bytes() {
        None => Fill::Byte(op.mask_byte),
        Some([single]) => Fill::Byte(*single),
        Some(token) if token.len() == op.length as usize => Fill::Copy(token),
        // 长度不符的令牌退回掩码字节。
        Some(_) => Fill::Byte(op.mask_byte),
    }
}

fn target<'b>(buffer: &'b mut [u8], op: &InplaceMaskOp) -> Result<&'b mut [u8], MaskError> {
    let offset = op.absolute_offset as usize;
    let length = op.length as usize;
    let buffer_len = buffer.len();
    offset
        .checked_add(length)
        .and_then(|end| buffer.get_mut(offset..end))
        .ok_or(MaskError::OutOfBounds {
            offset,
            length,
            buffer: buffer_len,
        })
}

/// 逐字节实现。
#[derive(Clone, Copy, Debug, Default)]
pub struct ScalarMaskWriter;

impl MaskWriter for ScalarMaskWriter {
    fn mask(&self, buffer: &mut [u8], op: &InplaceMaskOp) -> Result<(), MaskError> {
        let region = target(buffer, op)?;
        match fill_for(op) {
            Fill::Byte(byte) => {
                for slot in region.iter_mut() {
                    *slot = byte;
                }
            }
            Fill::Copy(token) => {
                for (slot, byte) in region.iter_mut().zip(token) {
                    *slot = *byte;
                }
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "scalar"
    }
}

/// 以 [`LANE_WIDTH`] 字节为一道批量写入，尾部不足一道的部分逐字节处理。
#[derive(Clone, Copy, Debug, Default)]
pub struct LaneMaskWriter;

impl MaskWriter for LaneMaskWriter {
    fn mask(&self, buffer: &mut [u8], op: &InplaceMaskOp) -> Result<(), MaskError> {
        if (op.length as usize) < LANE_WIDTH {
            return ScalarMaskWriter.mask(buffer, op);
        }
        let region = target(buffer, op)?;
        match fill_for(op) {
            Fill::Byte(byte) => {
                let lane = [byte; LANE_WIDTH];
                let mut chunks = region.chunks_exact_mut(LANE_WIDTH);
                for chunk in &mut chunks {
                    chunk.copy_from_slice(&lane);
                }
                for slot in chunks.into_remainder() {
                    *slot = byte;
                }
            }
            Fill::Copy(token) => {
                let mut dst = region.chunks_exact_mut(LANE_WIDTH);
                let mut src = token.chunks_exact(LANE_WIDTH);
                for (chunk, lane) in (&mut dst).zip(&mut src) {
                    chunk.copy_from_slice(lane);
                }
                for (slot, byte) in dst.into_remainder().iter_mut().zip(src.remainder()) {
                    *slot = *byte;
                }
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "lanes"
    }
}

/// 写入器选择模式；未知文本按 `Auto` 处理。
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize)]
#[serde(from = "String")]
pub enum MaskWriterMode {
    #[default]
    Auto,
    On,
    Off,
}

impl MaskWriterMode {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "on" => Self::On,
            "off" => Self::Off,
            _ => Self::Auto,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::On => "on",
            Self::Off => "off",
        }
    }
}

impl From<String> for MaskWriterMode {
    fn from(raw: String) -> Self {
        Self::parse(&raw)
    }
}

/// 选择结果，附带诊断信息。
#[derive(Clone)]
pub struct MaskWriterSelection {
    pub writer: Arc<dyn MaskWriter>,
    pub requested: MaskWriterMode,
    pub effective: &'static str,
    pub lanes_available: bool,
}

impl std::fmt::Debug for MaskWriterSelection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaskWriterSelection")
            .field("requested", &self.requested)
            .field("effective", &self.effective)
            .field("lanes_available", &self.lanes_available)
            .finish()
    }
}

/// `Off` 选择标量实现，`On`/`Auto` 选择分道实现（分道实现不依赖特定指令集，总是可用）。
pub fn select_mask_writer(mode: MaskWriterMode) -> MaskWriterSelection {
    let writer: Arc<dyn MaskWriter> = match mode {
        MaskWriterMode::Off => Arc::new(ScalarMaskWriter),
        MaskWriterMode::On | MaskWriterMode::Auto => Arc::new(LaneMaskWriter),
    };
    let selection = MaskWriterSelection {
        effective: writer.name(),
        writer,
        requested: mode,
        lanes_available: true,
    };
    tracing::debug!(
        requested = mode.as_str(),
        effective = selection.effective,
        "mask writer selected"
    );
    selection
}
