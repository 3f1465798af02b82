use std::sync::Arc;

use otlpgw_core::SignalKind;

use crate::intern::KeyId;
use crate::schema::SchemaId;

/// 路径字节码指令。
///
/// 指令序列由编译器生成，求值器按顺序解释；所有指令都只移动“当前消息窗口”或读取终值，
/// 从不修改底层字节。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum PathOp {
    /// 在当前消息中选中字段 `field`；后随 [`PathOp::RepeatedAny`] 时对每次出现分叉，
    /// 否则取第一次出现。
    EnterMsgField(u32),
    /// 修饰前一条 `EnterMsgField`：遍历全部出现。
    RepeatedAny,
    /// 修饰前一条 `EnterMsgField`：只取第一次出现。
    RepeatedFirst,
    /// 把当前窗口收窄到选中的 LEN 字段内部。
    EnterLenDelimited,
    /// 在当前消息的 `field` 重复 `KeyValue` 条目中查找键，命中后定位到其 `AnyValue`。
    MapScanStringKey { field: u32, key: KeyId },
    ReadString,
    ReadBytes,
    ReadBool,
    ReadEnum,
    /// 读取 varint / fixed32 / fixed64 标量。
    ReadScalar,
    Halt,
}

/// 终值类型。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ValueType {
    String,
    Bytes,
    Bool,
    Enum,
    Scalar,
}

impl ValueType {
    /// 终值是否是 LEN 编码（可被掩码改写）。
    pub const fn is_length_delimited(self) -> bool {
        matches!(self, Self::String | Self::Bytes)
    }
}

/// 路径可能命中的次数。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Cardinality {
    /// 至多一次。
    Optional,
    /// 路径中包含 `[*]`，可能命中多次。
    Repeated,
}

/// 编译完成的路径：不可变，可在线程间共享。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CompiledPath {
    program: Arc<[PathOp]>,
    terminal: ValueType,
    cardinality: Cardinality,
    source: Arc<str>,
    schema: SchemaId,
    signal: SignalKind,
}

impl CompiledPath {
    /// 直接由指令序列构造；基数由是否包含 [`PathOp::RepeatedAny`] 推导。
    pub fn new(
        program: Vec<PathOp>,
        terminal: ValueType,
        source: impl Into<Arc<str>>,
        schema: SchemaId,
        signal: SignalKind,
    ) -> Self {
        let cardinality = if program.contains(&PathOp::RepeatedAny) {
            Cardinality::Repeated
        } else {
            Cardinality::Optional
        };
        Self {
            program: program.into(),
            terminal,
            cardinality,
            source: source.into(),
            schema,
            signal,
        }
    }

    pub fn program(&self) -> &[PathOp] {
        &self.program
    }

    pub fn terminal(&self) -> ValueType {
        self.terminal
    }

    pub fn cardinality(&self) -> Cardinality {
        self.cardinality
    }

    /// 编译前的原始路径文本。
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn schema(&self) -> &SchemaId {
        &self.schema
    }

    pub fn signal(&self) -> SignalKind {
        self.signal
    }
}
