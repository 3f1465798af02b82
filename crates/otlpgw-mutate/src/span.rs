//! 值区间收集：把“字段在哪里”与“怎么找到它”解耦。
//!
//! # 教案式说明
//! - **意图（Why）**：规划器只关心命中字段的字节区间 `[offset, offset + length)`，
//!   至于区间来自通用字节码求值还是资源属性快速扫描，对它是透明的；
//! - **逻辑（How）**：[`ValueSpanCollector`] 是定长的平行数组，满了以后 `add` 返回 `false`，
//!   选择器据此提前停止遍历，内存占用与报文大小无关；
//! - **契约（What）**：区间偏移相对于报文自身的载荷起点（即已减去 [`PacketRef::offset`]）。

use std::sync::Arc;

use thiserror::Error;

use otlpgw_core::PacketRef;
use otlpgw_wire::{
    CompiledPath, CompiledPathEvaluator, EvalResult, EvalScratch, FastWireCursor, ValueType,
    WireError,
};

/// 选择器在遍历报文时遇到的错误。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
pub enum SelectorError {
    #[error(transparent)]
    Wire(#[from] WireError),
}

impl SelectorError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Wire(err) => err.code(),
        }
    }
}

/// 定长区间收集器，由调用方持有并在报文之间复用。
#[derive(Clone, Debug)]
pub struct ValueSpanCollector {
    offsets: Box<[u32]>,
    lengths: Box<[u32]>,
    count: usize,
}

impl ValueSpanCollector {
    /// 容量至少为 1。
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            offsets: vec![0; capacity].into_boxed_slice(),
            lengths: vec![0; capacity].into_boxed_slice(),
            count: 0,
        }
    }

    pub fn reset(&mut self) {
        self.count = 0;
    }

    /// 追加一个区间；已满或区间超出 32 位时返回 `false`。
    pub fn add(&mut self, offset: usize, length: usize) -> bool {
        if self.count == self.offsets.len() {
            return false;
        }
        let (Ok(offset), Ok(length)) = (u32::try_from(offset), u32::try_from(length)) else {
            return false;
        };
        self.offsets[self.count] = offset;
        self.lengths[self.count] = length;
        self.count += 1;
        true
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_full(&self) -> bool {
        self.count == self.offsets.len()
    }

    pub fn capacity(&self) -> usize {
        self.offsets.len()
    }

    /// 第 `index` 个区间 `(offset, length)`。
    pub fn get(&self, index: usize) -> Option<(u32, u32)> {
        (index < self.count).then(|| (self.offsets[index], self.lengths[index]))
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.offsets[..self.count]
            .iter()
            .copied()
            .zip(self.lengths[..self.count].iter().copied())
    }
}

/// 值区间选择契约。
///
/// 实现必须无内部可变状态，以便同一个选择器被多个接入线程并发使用；
/// 遍历所需的临时状态全部放在调用方提供的 `scratch` 与 `collector` 中。
pub trait ValueSpanSelector: Send + Sync {
    /// 先清空 `collector`，再收集命中区间，返回命中数。
    fn collect(
        &self,
        packet: &PacketRef,
        scratch: &mut EvalScratch,
        collector: &mut ValueSpanCollector,
    ) -> Result<usize, SelectorError>;
}

/// 基于编译路径的选择器。
///
/// 终端类型为字符串/字节时收集全部命中区间；其它类型只回答“是否命中”（返回 0 或 1），供丢弃规则使用。
#[derive(Clone)]
pub struct CompiledPathFirstMatchSelector {
    evaluator: Arc<dyn CompiledPathEvaluator>,
    path: CompiledPath,
}

impl CompiledPathFirstMatchSelector {
    pub fn new(evaluator: Arc<dyn CompiledPathEvaluator>, path: CompiledPath) -> Self {
        Self { evaluator, path }
    }

    pub fn path(&self) -> &CompiledPath {
        &self.path
    }
}

impl std::fmt::Debug for CompiledPathFirstMatchSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledPathFirstMatchSelector")
            .field("path", &self.path.source())
            .finish_non_exhaustive()
    }
}

impl ValueSpanSelector for CompiledPathFirstMatchSelector {
    fn collect(
        &self,
        packet: &PacketRef,
        scratch: &mut EvalScratch,
        collector: &mut ValueSpanCollector,
    ) -> Result<usize, SelectorError> {
        collector.reset();
        let base = packet.offset();

        if !matches!(self.path.terminal(), ValueType::String | ValueType::Bytes) {
            let cursor = FastWireCursor::over(packet.region(), base, packet.length())?;
            return Ok(match self.evaluator.evaluate(&self.path, &cursor, scratch) {
                EvalResult::MatchFound(_) => 1,
                EvalResult::NoMatch(_) | EvalResult::EvalError { .. } => 0,
            });
        }

        self.evaluator.evaluate_all(
            &self.path,
            packet.region(),
            base,
            packet.length(),
            scratch,
            &mut |offset, length, _| collector.add(offset - base, length),
        )?;
        Ok(collector.count())
    }
}
