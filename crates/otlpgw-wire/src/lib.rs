#![deny(unsafe_code)]

//! `otlpgw-wire` 负责在不构建对象图的前提下定位 OTLP 报文中的字段。
//!
//! # 模块定位（Why）
//! - 网关只需要找到少数字段的值区间（资源属性、span 事件名、健康检查状态码），
//!   完整反序列化 protobuf 既浪费 CPU 又会放大内存占用；
//! - 路径表达式在启动或配置刷新时编译一次，运行期只做字节码解释，
//!   把“语法/字段名错误”全部前移到编译期。
//!
//! # 结构概览（How）
//! - [`cursor`]：只前进的 tag/value 扫描器，LEN 字段默认整体跳过，只有显式 `enter_message` 才下钻；
//! - [`varint`]：base-128 varint 的编码、解码与长度表，供游标和上层重组引擎共用；
//! - [`compiler`] + [`intern`]：把 `resource.attributes["tenant_id"]` 之类的路径编译为 [`CompiledPath`]；
//! - [`eval`]：显式栈的字节码解释器，支持 `[*]` 通配分叉、`[0]` 首个命中与字符串键 map 扫描。

pub mod compiler;
pub mod cursor;
mod error;
pub mod eval;
pub mod intern;
mod path;
pub mod schema;
pub mod varint;

pub use compiler::{CompileError, CompileErrorCode, CompileResult, OtlpPathCompiler, PathCompiler};
pub use cursor::{FastWireCursor, MAX_FRAME_DEPTH, WireCursor, WireType};
pub use error::{WireError, WireErrorKind};
pub use eval::{
    BytecodeCompiledPathEvaluator, CompiledPathEvaluator, EvalResult, EvalScratch, MismatchCode,
    MAX_TRAVERSAL_DEPTH,
};
pub use intern::{KeyId, PathStringPool};
pub use path::{Cardinality, CompiledPath, PathOp, ValueType};
pub use schema::SchemaId;
