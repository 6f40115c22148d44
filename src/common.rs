//! 全局基础类型与错误定义

use thiserror::Error;

// ── ID 类型别名 ───────────────────────────────────────────────────────────────

/// 数据源编号：按 `add_source` 注册顺序分配，0..N-1
pub type SourceId    = u32;
/// 线上布局指纹（CRC32）
pub type Fingerprint = u32;

// ── 枚举 ──────────────────────────────────────────────────────────────────────

/// 排序方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Order {
    Asc,
    Desc,
}

impl Order {
    /// 按方向调整比较结果
    pub fn apply(self, ord: std::cmp::Ordering) -> std::cmp::Ordering {
        match self {
            Self::Asc  => ord,
            Self::Desc => ord.reverse(),
        }
    }
}

impl std::fmt::Display for Order {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Asc  => write!(f, "asc"),
            Self::Desc => write!(f, "desc"),
        }
    }
}

/// NULL 的位置；与排序方向无关（绝对位置）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NullOrder {
    #[default]
    First,
    Last,
}

/// 记录 schema 与注册 schema 的匹配策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldMatching {
    /// 记录 schema 必须与注册的数据源 schema 完全一致
    #[default]
    Strict,
    /// 按字段名解析：多余字段丢弃，缺失字段视为 NULL
    Lenient,
}

// ── 错误 ──────────────────────────────────────────────────────────────────────

/// 配置校验错误，只在 `build()` 时产生
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("no source registered")]
    NoSources,
    #[error("duplicate source name: {0}")]
    DuplicateSource(String),
    #[error("duplicate field '{field}' in schema '{schema}'")]
    DuplicateField { schema: String, field: String },
    #[error("group-by fields not set")]
    GroupByNotSet,
    #[error("field '{0}' referenced more than once")]
    DuplicateReference(String),
    #[error("field '{field}' not present in source '{source_name}'")]
    FieldNotFound { field: String, source_name: String },
    #[error("field '{field}' has type {actual} in source '{source_name}', expected {expected}")]
    FieldTypeMismatch { field: String, source_name: String, expected: String, actual: String },
    #[error("group-by fields must be a prefix of the sort fields: {0}")]
    GroupByNotPrefixOfSort(String),
    #[error("source order is not allowed with a single source")]
    SourceOrderWithSingleSource,
    #[error("source order may appear only once")]
    DuplicateSourceOrder,
    #[error("source order must be the last common sort element")]
    SourceOrderNotLast,
    #[error("unknown source: {0}")]
    UnknownSource(String),
    #[error("secondary sort for '{0}' requires source order in the common sort")]
    SecondarySortWithoutSourceOrder(String),
    #[error("secondary sort for '{source_name}' repeats common sort field '{field}'")]
    SecondarySortDuplicatesCommon { source_name: String, field: String },
    #[error("source order is not allowed in a secondary sort")]
    SourceOrderInSecondarySort,
    #[error("rollup field '{0}' is not a group-by field")]
    RollupFieldNotInGroupBy(String),
    #[error("rollup requires an explicit sort")]
    RollupRequiresExplicitSort,
    #[error("partition field '{0}' is not a group-by field")]
    PartitionFieldNotInGroupBy(String),
    #[error("no comparator registered under '{0}'")]
    UnknownComparator(String),
    #[error("no object codec registered under '{0}'")]
    UnknownObjectCodec(String),
    #[error("invalid schema: {0}")]
    InvalidSchema(String),
    #[error("invalid sort spec: {0}")]
    InvalidSortSpec(String),
}

/// 单条记录序列化失败；输出流保持不变
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("field '{0}' is not nullable but has no value")]
    NullNotAllowed(String),
    #[error("field '{field}' expects {expected}, got {actual}")]
    TypeMismatch { field: String, expected: String, actual: String },
    #[error("record schema '{0}' does not belong to any source")]
    UnknownSource(String),
    #[error("record schema does not match source '{0}'")]
    SchemaMismatch(String),
    #[error("object codec '{codec}' failed on field '{field}': {reason}")]
    ObjectCodec { field: String, codec: String, reason: String },
}

/// 单条记录反序列化失败
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unexpected end of input at offset {0}")]
    Truncated(usize),
    #[error("varint overflow at offset {0}")]
    VarIntOverflow(usize),
    #[error("length {len} at offset {offset} exceeds remaining input")]
    InvalidLength { offset: usize, len: u64 },
    #[error("field '{field}': ordinal {ordinal} out of range")]
    InvalidOrdinal { field: String, ordinal: u64 },
    #[error("field '{0}': invalid utf-8")]
    InvalidUtf8(String),
    #[error("field '{field}': invalid boolean byte {byte:#04x}")]
    InvalidBoolean { field: String, byte: u8 },
    #[error("unknown source id {0}")]
    UnknownSource(u64),
    #[error("field '{field}' is {read} on the wire but {target} in the target schema")]
    TypeMismatch { field: String, read: String, target: String },
    #[error("object codec '{codec}' failed on field '{field}': {reason}")]
    ObjectCodec { field: String, codec: String, reason: String },
}

/// 统一错误类型
#[derive(Debug, Error)]
pub enum CoGroupError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("config json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("input not sorted by group fields at record #{0}")]
    UnsortedInput(u64),
    #[error("handler failed: {0}")]
    Handler(String),
}

pub type Result<T> = std::result::Result<T, CoGroupError>;
