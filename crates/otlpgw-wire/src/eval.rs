//! 编译路径的字节码求值器。
//!
//! # 教案式说明
//! - **意图（Why）**：同一条编译路径会在每个报文上反复执行，求值器必须无堆分配、无递归，
//!   且对畸形输入只返回错误而不 panic；
//! - **逻辑（How）**：解释器在一个“分支”上顺序执行指令，分支由 `(pc, 消息窗口, 当前选中字段)` 描述。
//!   遇到 `EnterMsgField + RepeatedAny` 时把分叉点压入 [`EvalScratch`] 内的定长分叉栈，随后每次从栈顶
//!   取出下一次出现继续执行，因此结果按深度优先、出现顺序从左到右产生；分叉栈深度上限为
//!   [`MAX_TRAVERSAL_DEPTH`]，超出即视为错误；
//! - **契约（What）**：[`CompiledPathEvaluator::evaluate`] 只回答是否命中；
//!   [`CompiledPathEvaluator::evaluate_all`] 对每次命中调用回调，回调返回 `false` 时立即停止，
//!   返回值计入触发停止的那一次命中。
//!
//! # 风险提示（Trade-offs）
//! - LEN 终值会被复制进调用方提供的暂存区；超出容量时按“未命中”处理（[`MismatchCode::ScratchOverflow`]），
//!   调用方若需要更长的值应扩大暂存区而不是依赖错误。

use std::sync::Arc;

use crate::cursor::{FastWireCursor, WireCursor, WireType};
use crate::error::{WireError, WireErrorKind};
use crate::intern::PathStringPool;
use crate::path::{CompiledPath, PathOp, ValueType};
use crate::schema::key_value;
use crate::varint::decode_varint64;

/// 分叉栈的固定深度。
pub const MAX_TRAVERSAL_DEPTH: usize = 32;

/// 默认暂存区字节数。
pub const DEFAULT_SCRATCH_BYTES: usize = 4 * 1024;

/// 未命中的原因。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum MismatchCode {
    PathNotPresent,
    WireTypeMismatch,
    MapKeyNotFound,
    /// `[*]` 对应的重复字段一次都没有出现。
    RepeatedEmpty,
    ScratchOverflow,
    /// 编译路径引用的 map 键在求值器的驻留池中不存在。
    SchemaDriftDetected,
}

impl MismatchCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PathNotPresent => "PATH_NOT_PRESENT",
            Self::WireTypeMismatch => "WIRE_TYPE_MISMATCH",
            Self::MapKeyNotFound => "MAP_KEY_NOT_FOUND",
            Self::RepeatedEmpty => "REPEATED_EMPTY",
            Self::ScratchOverflow => "SCRATCH_OVERFLOW",
            Self::SchemaDriftDetected => "SCHEMA_DRIFT_DETECTED",
        }
    }
}

/// 单次求值的结果。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EvalResult {
    MatchFound(ValueType),
    NoMatch(MismatchCode),
    /// 报文畸形；`position` 为出错字节偏移。
    EvalError {
        code: WireErrorKind,
        position: usize,
    },
}

impl EvalResult {
    pub fn is_match(&self) -> bool {
        matches!(self, Self::MatchFound(_))
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct ForkFrame {
    field: u32,
    resume_pc: usize,
    start: usize,
    end: usize,
    scan_pos: usize,
    yielded: u32,
}

/// 调用方持有的求值暂存区。
///
/// 同一时刻只能被一个求值调用使用；按线程（或按 worker）各持一份，即可在热路径上避免分配。
pub struct EvalScratch {
    bytes: Box<[u8]>,
    value_len: usize,
    number: u64,
    span: (usize, usize),
    forks: [ForkFrame; MAX_TRAVERSAL_DEPTH],
    fork_len: usize,
}

impl EvalScratch {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SCRATCH_BYTES)
    }

    /// 指定 LEN 终值暂存区的容量。
    pub fn with_capacity(bytes: usize) -> Self {
        Self {
            bytes: vec![0u8; bytes].into_boxed_slice(),
            value_len: 0,
            number: 0,
            span: (0, 0),
            forks: [ForkFrame::default(); MAX_TRAVERSAL_DEPTH],
            fork_len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    /// 最近一次读取的 LEN 终值。
    pub fn value(&self) -> &[u8] {
        &self.bytes[..self.value_len]
    }

    /// 最近一次读取的数值终值（varint 或定长标量）。
    pub fn number(&self) -> u64 {
        self.number
    }

    /// 最近一次命中的 `(offset, length)`，偏移相对于底层区间。
    pub fn last_span(&self) -> (usize, usize) {
        self.span
    }

    fn reset(&mut self) {
        self.value_len = 0;
        self.number = 0;
        self.span = (0, 0);
        self.fork_len = 0;
    }

    fn store_bytes(&mut self, value: &[u8]) -> bool {
        let Some(slot) = self.bytes.get_mut(..value.len()) else {
            return false;
        };
        slot.copy_from_slice(value);
        self.value_len = value.len();
        true
    }

    fn push_fork(&mut self, frame: ForkFrame) -> Result<(), WireError> {
        if self.fork_len == MAX_TRAVERSAL_DEPTH {
            return Err(WireError::new(WireErrorKind::NestingLimit, frame.start));
        }
        self.forks[self.fork_len] = frame;
        self.fork_len += 1;
        Ok(())
    }
}

impl Default for EvalScratch {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for EvalScratch {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EvalScratch")
            .field("capacity", &self.bytes.len())
            .field("value_len", &self.value_len)
            .field("fork_len", &self.fork_len)
            .finish()
    }
}

/// 编译路径求值契约。
pub trait CompiledPathEvaluator: Send + Sync {
    /// 在游标的根窗口（[`WireCursor::bounds`]）上求值，只报告是否命中。
    fn evaluate(
        &self,
        path: &CompiledPath,
        cursor: &dyn WireCursor<'_>,
        scratch: &mut EvalScratch,
    ) -> EvalResult;

    /// 在 `region[offset..offset + length]` 上枚举全部命中，回调参数为
    /// `(value_offset, value_length, terminal)`，偏移相对于 `region`。
    fn evaluate_all(
        &self,
        path: &CompiledPath,
        region: &[u8],
        offset: usize,
        length: usize,
        scratch: &mut EvalScratch,
        on_match: &mut dyn FnMut(usize, usize, ValueType) -> bool,
    ) -> Result<usize, WireError>;
}

/// 基于显式分叉栈的解释器实现。
#[derive(Clone, Debug)]
pub struct BytecodeCompiledPathEvaluator {
    pool: Arc<PathStringPool>,
}

impl BytecodeCompiledPathEvaluator {
    /// `pool` 必须与编译路径时使用的驻留池相同。
    pub fn new(pool: Arc<PathStringPool>) -> Self {
        Self { pool }
    }
}

#[derive(Clone, Copy, Debug)]
struct Selected {
    wire_type: WireType,
    offset: usize,
    length: usize,
}

impl Selected {
    fn of(cursor: &FastWireCursor<'_>) -> Self {
        Self {
            wire_type: cursor.wire_type(),
            offset: cursor.value_offset(),
            length: cursor.value_length(),
        }
    }

    fn end(&self) -> usize {
        self.offset + self.length
    }
}

#[derive(Clone, Copy, Debug)]
struct Branch {
    pc: usize,
    start: usize,
    end: usize,
    selected: Option<Selected>,
    terminal: Option<(usize, usize)>,
}

enum Flow {
    Fork(ForkFrame),
    Match(usize, usize),
    Miss(MismatchCode),
}

enum Read {
    Value(usize, usize),
    Miss(MismatchCode),
}

struct Outcome {
    matches: usize,
    miss: MismatchCode,
}

impl BytecodeCompiledPathEvaluator {
    fn run(
        &self,
        path: &CompiledPath,
        region: &[u8],
        offset: usize,
        length: usize,
        scratch: &mut EvalScratch,
        sink: &mut dyn FnMut(usize, usize, ValueType) -> bool,
    ) -> Result<Outcome, WireError> {
        let end = offset
            .checked_add(length)
            .filter(|end| *end <= region.len())
            .ok_or(WireError::new(WireErrorKind::TruncatedFrame, offset))?;
        scratch.reset();

        let mut matches = 0;
        let mut miss = MismatchCode::PathNotPresent;
        let mut branch = Some(Branch {
            pc: 0,
            start: offset,
            end,
            selected: None,
            terminal: None,
        });
        while let Some(current) = branch {
            match self.step(path.program(), region, current, scratch)? {
                Flow::Fork(frame) => scratch.push_fork(frame)?,
                Flow::Match(value_offset, value_length) => {
                    matches += 1;
                    scratch.span = (value_offset, value_length);
                    if !sink(value_offset, value_length, path.terminal()) {
                        return Ok(Outcome { matches, miss });
                    }
                }
                Flow::Miss(code) => miss = code,
            }
            branch = next_branch(region, scratch, &mut miss)?;
        }
        Ok(Outcome { matches, miss })
    }

    fn step(
        &self,
        program: &[PathOp],
        region: &[u8],
        mut branch: Branch,
        scratch: &mut EvalScratch,
    ) -> Result<Flow, WireError> {
        loop {
            let Some(op) = program.get(branch.pc).copied() else {
                return Ok(Flow::Miss(MismatchCode::PathNotPresent));
            };
            match op {
                PathOp::EnterMsgField(field) => {
                    let modifier = program.get(branch.pc + 1).copied();
                    if modifier == Some(PathOp::RepeatedAny) {
                        return Ok(Flow::Fork(ForkFrame {
                            field,
                            resume_pc: branch.pc + 2,
                            start: branch.start,
                            end: branch.end,
                            scan_pos: branch.start,
                            yielded: 0,
                        }));
                    }
                    let Some((selected, _)) = find_field(region, branch.start, branch.end, field)?
                    else {
                        return Ok(Flow::Miss(MismatchCode::PathNotPresent));
                    };
                    branch.selected = Some(selected);
                    branch.pc += if modifier == Some(PathOp::RepeatedFirst) {
                        2
                    } else {
                        1
                    };
                }
                PathOp::RepeatedAny | PathOp::RepeatedFirst => branch.pc += 1,
                PathOp::EnterLenDelimited => match branch.selected.take() {
                    Some(selected) if selected.wire_type == WireType::Len => {
                        branch.start = selected.offset;
                        branch.end = selected.end();
                        branch.pc += 1;
                    }
                    Some(_) => return Ok(Flow::Miss(MismatchCode::WireTypeMismatch)),
                    None => return Ok(Flow::Miss(MismatchCode::PathNotPresent)),
                },
                PathOp::MapScanStringKey { field, key } => {
                    let Some(expected) = self.pool.resolve(key) else {
                        return Ok(Flow::Miss(MismatchCode::SchemaDriftDetected));
                    };
                    match scan_map(region, branch.start, branch.end, field, expected.as_bytes())? {
                        Some((start, end)) => {
                            branch.start = start;
                            branch.end = end;
                            branch.selected = None;
                            branch.pc += 1;
                        }
                        None => return Ok(Flow::Miss(MismatchCode::MapKeyNotFound)),
                    }
                }
                PathOp::ReadString | PathOp::ReadBytes => {
                    match read_len(region, &branch, scratch)? {
                        Read::Value(offset, length) => {
                            branch.terminal = Some((offset, length));
                            branch.pc += 1;
                        }
                        Read::Miss(code) => return Ok(Flow::Miss(code)),
                    }
                }
                PathOp::ReadBool | PathOp::ReadEnum | PathOp::ReadScalar => {
                    match read_number(op, region, &branch, scratch)? {
                        Read::Value(offset, length) => {
                            branch.terminal = Some((offset, length));
                            branch.pc += 1;
                        }
                        Read::Miss(code) => return Ok(Flow::Miss(code)),
                    }
                }
                PathOp::Halt => {
                    return Ok(match branch.terminal {
                        Some((offset, length)) => Flow::Match(offset, length),
                        None => Flow::Miss(MismatchCode::PathNotPresent),
                    });
                }
            }
        }
    }
}

impl CompiledPathEvaluator for BytecodeCompiledPathEvaluator {
    fn evaluate(
        &self,
        path: &CompiledPath,
        cursor: &dyn WireCursor<'_>,
        scratch: &mut EvalScratch,
    ) -> EvalResult {
        let (offset, length) = cursor.bounds();
        match self.run(path, cursor.region(), offset, length, scratch, &mut |_, _, _| false) {
            Ok(outcome) if outcome.matches > 0 => EvalResult::MatchFound(path.terminal()),
            Ok(outcome) => EvalResult::NoMatch(outcome.miss),
            Err(err) => {
                tracing::trace!(path = path.source(), code = err.code(), position = err.position, "path evaluation hit malformed input");
                EvalResult::EvalError {
                    code: err.kind,
                    position: err.position,
                }
            }
        }
    }

    fn evaluate_all(
        &self,
        path: &CompiledPath,
        region: &[u8],
        offset: usize,
        length: usize,
        scratch: &mut EvalScratch,
        on_match: &mut dyn FnMut(usize, usize, ValueType) -> bool,
    ) -> Result<usize, WireError> {
        self.run(path, region, offset, length, scratch, on_match)
            .map(|outcome| outcome.matches)
    }
}

/// 从分叉栈顶取出下一个待执行分支；耗尽的分叉点出栈。
fn next_branch(
    region: &[u8],
    scratch: &mut EvalScratch,
    miss: &mut MismatchCode,
) -> Result<Option<Branch>, WireError> {
    while scratch.fork_len > 0 {
        let top = &mut scratch.forks[scratch.fork_len - 1];
        match find_field(region, top.scan_pos, top.end, top.field)? {
            Some((selected, resume_at)) => {
                top.scan_pos = resume_at;
                top.yielded += 1;
                return Ok(Some(Branch {
                    pc: top.resume_pc,
                    start: top.start,
                    end: top.end,
                    selected: Some(selected),
                    terminal: None,
                }));
            }
            None => {
                if top.yielded == 0 {
                    *miss = MismatchCode::RepeatedEmpty;
                }
                scratch.fork_len -= 1;
            }
        }
    }
    Ok(None)
}

/// 在 `[start, end)` 中查找字段 `field` 的第一次出现，返回选中值与下一次扫描的起点。
fn find_field(
    region: &[u8],
    start: usize,
    end: usize,
    field: u32,
) -> Result<Option<(Selected, usize)>, WireError> {
    let mut cursor = FastWireCursor::over(region, start, end - start)?;
    while cursor.next_field()? {
        if cursor.field_number() == field {
            return Ok(Some((Selected::of(&cursor), cursor.position())));
        }
    }
    Ok(None)
}

fn find_wire_type(
    region: &[u8],
    start: usize,
    end: usize,
    wire_type: WireType,
) -> Result<Option<Selected>, WireError> {
    let mut cursor = FastWireCursor::over(region, start, end - start)?;
    while cursor.next_field()? {
        if cursor.wire_type() == wire_type {
            return Ok(Some(Selected::of(&cursor)));
        }
    }
    Ok(None)
}

/// 在 `field` 的 `KeyValue` 条目中查找键等于 `key` 的第一个条目，返回其 `AnyValue` 窗口。
fn scan_map(
    region: &[u8],
    start: usize,
    end: usize,
    field: u32,
    key: &[u8],
) -> Result<Option<(usize, usize)>, WireError> {
    let mut entries = FastWireCursor::over(region, start, end - start)?;
    while entries.next_field()? {
        if entries.field_number() != field || entries.wire_type() != WireType::Len {
            continue;
        }
        let mut pair =
            FastWireCursor::over(region, entries.value_offset(), entries.value_length())?;
        let mut key_matches = false;
        let mut value = None;
        while pair.next_field()? {
            if pair.wire_type() != WireType::Len {
                continue;
            }
            match pair.field_number() {
                key_value::KEY => key_matches = pair.slice_value() == key,
                key_value::VALUE => {
                    value = Some((pair.value_offset(), pair.value_offset() + pair.value_length()));
                }
                _ => {}
            }
        }
        if let (true, Some(window)) = (key_matches, value) {
            return Ok(Some(window));
        }
    }
    Ok(None)
}

fn read_len(region: &[u8], branch: &Branch, scratch: &mut EvalScratch) -> Result<Read, WireError> {
    let selected = match branch.selected {
        Some(selected) => selected,
        None => match find_wire_type(region, branch.start, branch.end, WireType::Len)? {
            Some(selected) => selected,
            None => return Ok(Read::Miss(MismatchCode::PathNotPresent)),
        },
    };
    if selected.wire_type != WireType::Len {
        return Ok(Read::Miss(MismatchCode::WireTypeMismatch));
    }
    if !scratch.store_bytes(&region[selected.offset..selected.end()]) {
        return Ok(Read::Miss(MismatchCode::ScratchOverflow));
    }
    Ok(Read::Value(selected.offset, selected.length))
}

fn read_number(
    op: PathOp,
    region: &[u8],
    branch: &Branch,
    scratch: &mut EvalScratch,
) -> Result<Read, WireError> {
    let selected = match branch.selected {
        Some(selected) => selected,
        None => match find_wire_type(region, branch.start, branch.end, WireType::Varint)? {
            Some(selected) => selected,
            None => return Ok(Read::Miss(MismatchCode::PathNotPresent)),
        },
    };
    let raw = &region[selected.offset..selected.end()];
    let value = match (selected.wire_type, op) {
        (WireType::Varint, _) => decode_varint64(raw, selected.offset)?.0,
        (WireType::I64, PathOp::ReadScalar) => {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(raw);
            u64::from_le_bytes(bytes)
        }
        (WireType::I32, PathOp::ReadScalar) => {
            let mut bytes = [0u8; 4];
            bytes.copy_from_slice(raw);
            u64::from(u32::from_le_bytes(bytes))
        }
        _ => return Ok(Read::Miss(MismatchCode::WireTypeMismatch)),
    };
    scratch.number = value;
    Ok(Read::Value(selected.offset, selected.length))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaId;
    use otlpgw_core::SignalKind;

    fn path(program: Vec<PathOp>, terminal: ValueType) -> CompiledPath {
        CompiledPath::new(program, terminal, "hand-built", SchemaId::otlp_v1(), SignalKind::Traces)
    }

    #[test]
    fn read_bool_decodes_varint_into_scratch() {
        // field 4 varint 1
        let region = [0x20, 0x01];
        let evaluator = BytecodeCompiledPathEvaluator::new(Arc::new(PathStringPool::new()));
        let mut scratch = EvalScratch::new();
        let program = path(
            vec![PathOp::EnterMsgField(4), PathOp::ReadBool, PathOp::Halt],
            ValueType::Bool,
        );
        let cursor = FastWireCursor::new(&region);
        assert_eq!(
            evaluator.evaluate(&program, &cursor, &mut scratch),
            EvalResult::MatchFound(ValueType::Bool)
        );
        assert_eq!(scratch.number(), 1);
        assert_eq!(scratch.last_span(), (1, 1));
    }

    #[test]
    fn fixed64_scalar_is_little_endian() {
        let mut region = vec![0x39];
        region.extend_from_slice(&42u64.to_le_bytes());
        let evaluator = BytecodeCompiledPathEvaluator::new(Arc::new(PathStringPool::new()));
        let mut scratch = EvalScratch::new();
        let program = path(
            vec![PathOp::EnterMsgField(7), PathOp::ReadScalar, PathOp::Halt],
            ValueType::Scalar,
        );
        assert!(
            evaluator
                .evaluate(&program, &FastWireCursor::new(&region), &mut scratch)
                .is_match()
        );
        assert_eq!(scratch.number(), 42);
    }

    #[test]
    fn string_longer_than_scratch_is_a_soft_miss() {
        let region = [0x0A, 0x04, b'a', b'b', b'c', b'd'];
        let evaluator = BytecodeCompiledPathEvaluator::new(Arc::new(PathStringPool::new()));
        let mut scratch = EvalScratch::with_capacity(3);
        let program = path(
            vec![PathOp::EnterMsgField(1), PathOp::ReadString, PathOp::Halt],
            ValueType::String,
        );
        assert_eq!(
            evaluator.evaluate(&program, &FastWireCursor::new(&region), &mut scratch),
            EvalResult::NoMatch(MismatchCode::ScratchOverflow)
        );
    }

    #[test]
    fn unknown_key_id_reports_schema_drift() {
        let compile_pool = PathStringPool::new();
        let key = compile_pool.intern("tenant_id");
        let evaluator = BytecodeCompiledPathEvaluator::new(Arc::new(PathStringPool::new()));
        let program = path(
            vec![
                PathOp::MapScanStringKey { field: 1, key },
                PathOp::ReadString,
                PathOp::Halt,
            ],
            ValueType::String,
        );
        let mut scratch = EvalScratch::new();
        assert_eq!(
            evaluator.evaluate(&program, &FastWireCursor::new(&[]), &mut scratch),
            EvalResult::NoMatch(MismatchCode::SchemaDriftDetected)
        );
    }

    #[test]
    fn entering_a_scalar_is_a_wire_type_mismatch() {
        let region = [0x08, 0x01];
        let evaluator = BytecodeCompiledPathEvaluator::new(Arc::new(PathStringPool::new()));
        let program = path(
            vec![
                PathOp::EnterMsgField(1),
                PathOp::EnterLenDelimited,
                PathOp::ReadString,
                PathOp::Halt,
            ],
            ValueType::String,
        );
        let mut scratch = EvalScratch::new();
        assert_eq!(
            evaluator.evaluate(&program, &FastWireCursor::new(&region), &mut scratch),
            EvalResult::NoMatch(MismatchCode::WireTypeMismatch)
        );
    }

    #[test]
    fn empty_repeated_field_is_reported() {
        let region = [0x08, 0x01];
        let evaluator = BytecodeCompiledPathEvaluator::new(Arc::new(PathStringPool::new()));
        let program = path(
            vec![
                PathOp::EnterMsgField(2),
                PathOp::RepeatedAny,
                PathOp::EnterLenDelimited,
                PathOp::ReadString,
                PathOp::Halt,
            ],
            ValueType::String,
        );
        let mut scratch = EvalScratch::new();
        assert_eq!(
            evaluator.evaluate(&program, &FastWireCursor::new(&region), &mut scratch),
            EvalResult::NoMatch(MismatchCode::RepeatedEmpty)
        );
    }

    #[test]
    fn malformed_input_surfaces_as_eval_error() {
        let region = [0x0A, 0x05, 0x01];
        let evaluator = BytecodeCompiledPathEvaluator::new(Arc::new(PathStringPool::new()));
        let program = path(
            vec![PathOp::EnterMsgField(1), PathOp::ReadString, PathOp::Halt],
            ValueType::String,
        );
        let mut scratch = EvalScratch::new();
        assert_eq!(
            evaluator.evaluate(&program, &FastWireCursor::new(&region), &mut scratch),
            EvalResult::EvalError {
                code: WireErrorKind::TruncatedFrame,
                position: 2
            }
        );
    }
}
