//! 字段类型与运行时值

use std::any::Any;
use std::sync::Arc;

use crate::common::ConfigError;

/// 枚举类型：`tag` 标识类型，序号即 `variants` 的下标
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EnumType {
    pub tag:      String,
    pub variants: Vec<String>,
}

impl EnumType {
    pub fn new(tag: &str, variants: &[&str]) -> Self {
        Self { tag: tag.into(), variants: variants.iter().map(|v| (*v).to_string()).collect() }
    }

    pub fn ordinal_of(&self, variant: &str) -> Option<u32> {
        self.variants.iter().position(|v| v == variant).map(|p| p as u32)
    }
}

/// 字段的声明类型（封闭集合，编解码与比较器对其穷举匹配）
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum FieldType {
    /// zig-zag varint
    Int32,
    /// 定长 8 字节
    Int64,
    VarInt32,
    VarInt64,
    Float32,
    Float64,
    Utf8,
    Boolean,
    Enum(EnumType),
    Bytes,
    /// 由注册的 `ObjectCodec` 负责编解码
    Object { codec: String },
}

impl FieldType {
    pub fn object(codec: &str) -> Self { Self::Object { codec: codec.into() } }

    /// 定长类型的字节宽度；变长类型返回 None
    pub fn fixed_size(&self) -> Option<usize> {
        match self {
            Self::Int64 | Self::Float64 => Some(8),
            Self::Float32               => Some(4),
            Self::Boolean               => Some(1),
            _                           => None,
        }
    }

    /// 值与声明类型是否相容（NULL 另行处理）
    pub fn accepts(&self, value: &Value) -> bool {
        matches!(
            (self, value),
            (Self::Int32 | Self::VarInt32, Value::Int32(_))
                | (Self::Int64 | Self::VarInt64, Value::Int64(_))
                | (Self::Float32, Value::Float32(_))
                | (Self::Float64, Value::Float64(_))
                | (Self::Utf8, Value::Utf8(_))
                | (Self::Boolean, Value::Boolean(_))
                | (Self::Enum(_), Value::Enum(_))
                | (Self::Bytes, Value::Bytes(_))
                | (Self::Object { .. }, Value::Object(_))
        )
    }

    /// 类型的文本形式必须能原样解析回同一类型（配置 JSON 以文本保存类型）
    pub fn check_text_form(&self) -> Result<(), ConfigError> {
        let text = self.to_string();
        match text.parse::<Self>() {
            Ok(back) if back == *self => Ok(()),
            _ => Err(ConfigError::InvalidSchema(format!("type '{text}' has no unambiguous text form"))),
        }
    }

    fn parse_enum(body: &str) -> Option<EnumType> {
        let (tag, variants) = body.split_once(';')?;
        let tag = tag.trim();
        let variants: Vec<String> = variants.split('|').map(|v| v.trim().to_string()).collect();
        if tag.is_empty() || variants.iter().any(String::is_empty) {
            return None;
        }
        Some(EnumType { tag: tag.into(), variants })
    }
}

impl std::str::FromStr for FieldType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let ty = match s {
            "int"     => Self::Int32,
            "vint"    => Self::VarInt32,
            "long"    => Self::Int64,
            "vlong"   => Self::VarInt64,
            "float"   => Self::Float32,
            "double"  => Self::Float64,
            "string"  => Self::Utf8,
            "boolean" => Self::Boolean,
            "bytes"   => Self::Bytes,
            _ if s.starts_with("enum(") && s.ends_with(')') => {
                let body = &s[5..s.len() - 1];
                Self::Enum(Self::parse_enum(body).ok_or_else(|| {
                    ConfigError::InvalidSchema(format!("malformed enum type '{s}'"))
                })?)
            }
            _ => {
                let valid = !s.is_empty()
                    && s.chars().all(|c| !c.is_whitespace() && !matches!(c, ':' | ',' | '?' | '(' | ')'));
                if !valid {
                    return Err(ConfigError::InvalidSchema(format!("invalid type '{s}'")));
                }
                Self::Object { codec: s.into() }
            }
        };
        Ok(ty)
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int32            => write!(f, "int"),
            Self::Int64            => write!(f, "long"),
            Self::VarInt32         => write!(f, "vint"),
            Self::VarInt64         => write!(f, "vlong"),
            Self::Float32          => write!(f, "float"),
            Self::Float64          => write!(f, "double"),
            Self::Utf8             => write!(f, "string"),
            Self::Boolean          => write!(f, "boolean"),
            Self::Bytes            => write!(f, "bytes"),
            Self::Enum(e)          => write!(f, "enum({};{})", e.tag, e.variants.join("|")),
            Self::Object { codec } => write!(f, "{codec}"),
        }
    }
}

impl From<FieldType> for String {
    fn from(ty: FieldType) -> Self { ty.to_string() }
}

impl TryFrom<String> for FieldType {
    type Error = ConfigError;
    fn try_from(s: String) -> Result<Self, Self::Error> { s.parse() }
}

// ── Object 值 ─────────────────────────────────────────────────────────────────

/// 不透明对象值；具体类型只有对应的 `ObjectCodec` 知道
///
/// 相等性按内容：同一实例，或同一具体类型且 `T::eq` 为真。
#[derive(Clone)]
pub struct ObjectValue {
    value: Arc<dyn Any + Send + Sync>,
    eq:    fn(&(dyn Any + Send + Sync), &(dyn Any + Send + Sync)) -> bool,
}

impl ObjectValue {
    pub fn new<T: Any + PartialEq + Send + Sync>(value: T) -> Self {
        Self { value: Arc::new(value), eq: eq_as::<T> }
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> { self.value.downcast_ref::<T>() }
}

fn eq_as<T: Any + PartialEq>(a: &(dyn Any + Send + Sync), b: &(dyn Any + Send + Sync)) -> bool {
    match (a.downcast_ref::<T>(), b.downcast_ref::<T>()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

impl std::fmt::Debug for ObjectValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ObjectValue(..)")
    }
}

impl PartialEq for ObjectValue {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.value, &other.value) || (self.eq)(&*self.value, &*other.value)
    }
}

// ── 运行时值 ──────────────────────────────────────────────────────────────────

/// 字段值（运行时表示）；VarInt32/VarInt64 字段分别使用 Int32/Int64
#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Utf8(String),
    Boolean(bool),
    /// 枚举序号
    Enum(u32),
    Bytes(Vec<u8>),
    Object(ObjectValue),
}

impl Value {
    pub fn is_null(&self) -> bool { matches!(self, Self::Null) }

    /// 用于错误信息的类型名
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null       => "null",
            Self::Int32(_)   => "int32",
            Self::Int64(_)   => "int64",
            Self::Float32(_) => "float32",
            Self::Float64(_) => "float64",
            Self::Utf8(_)    => "utf8",
            Self::Boolean(_) => "boolean",
            Self::Enum(_)    => "enum",
            Self::Bytes(_)   => "bytes",
            Self::Object(_)  => "object",
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int32(v) => Some(i64::from(*v)),
            Self::Int64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self { Self::Utf8(s) => Some(s), _ => None }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self { Self::Bytes(b) => Some(b), _ => None }
    }
}

/// 浮点按位比较，NaN 与自身相等，保证编解码往返后可比较
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null)               => true,
            (Self::Int32(a), Self::Int32(b))       => a == b,
            (Self::Int64(a), Self::Int64(b))       => a == b,
            (Self::Float32(a), Self::Float32(b))   => a.to_bits() == b.to_bits(),
            (Self::Float64(a), Self::Float64(b))   => a.to_bits() == b.to_bits(),
            (Self::Utf8(a), Self::Utf8(b))         => a == b,
            (Self::Boolean(a), Self::Boolean(b))   => a == b,
            (Self::Enum(a), Self::Enum(b))         => a == b,
            (Self::Bytes(a), Self::Bytes(b))       => a == b,
            (Self::Object(a), Self::Object(b))     => a == b,
            _ => false,
        }
    }
}

impl From<i32> for Value { fn from(v: i32) -> Self { Self::Int32(v) } }
impl From<i64> for Value { fn from(v: i64) -> Self { Self::Int64(v) } }
impl From<f32> for Value { fn from(v: f32) -> Self { Self::Float32(v) } }
impl From<f64> for Value { fn from(v: f64) -> Self { Self::Float64(v) } }
impl From<bool> for Value { fn from(v: bool) -> Self { Self::Boolean(v) } }
impl From<&str> for Value { fn from(v: &str) -> Self { Self::Utf8(v.into()) } }
impl From<String> for Value { fn from(v: String) -> Self { Self::Utf8(v) } }
impl From<Vec<u8>> for Value { fn from(v: Vec<u8>) -> Self { Self::Bytes(v) } }

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null       => write!(f, "NULL"),
            Self::Int32(v)   => write!(f, "{v}"),
            Self::Int64(v)   => write!(f, "{v}"),
            Self::Float32(v) => write!(f, "{v}"),
            Self::Float64(v) => write!(f, "{v}"),
            Self::Utf8(s)    => write!(f, "{s}"),
            Self::Boolean(v) => write!(f, "{v}"),
            Self::Enum(v)    => write!(f, "#{v}"),
            Self::Bytes(b)   => write!(f, "{}", String::from_utf8_lossy(b)),
            Self::Object(_)  => write!(f, "<object>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_text_round_trip() {
        for text in ["int", "vint", "long", "vlong", "float", "double", "string",
                     "boolean", "bytes", "enum(Color;RED|GREEN)", "point"] {
            let ty: FieldType = text.parse().unwrap();
            assert_eq!(ty.to_string(), text);
        }
        assert_eq!("point".parse::<FieldType>().unwrap(), FieldType::object("point"));
    }

    #[test]
    fn malformed_types_rejected() {
        assert!("enum(Color)".parse::<FieldType>().is_err());
        assert!("enum(;A)".parse::<FieldType>().is_err());
        assert!("my type".parse::<FieldType>().is_err());
        assert!("".parse::<FieldType>().is_err());
    }

    #[test]
    fn types_without_faithful_text_form_rejected() {
        let bad = [
            FieldType::Enum(EnumType::new("Level", &["LO|W", "HIGH"])),
            FieldType::Enum(EnumType::new("Level", &[])),
            FieldType::Enum(EnumType::new("Le;vel", &["A"])),
            FieldType::Enum(EnumType::new("Level", &["A)"])),
            FieldType::Enum(EnumType::new("Level", &[" A"])),
            FieldType::object("my point"),
            FieldType::object("p:q"),
            FieldType::object("p?"),
            FieldType::object("int"),
            FieldType::object(""),
        ];
        for ty in bad {
            assert!(matches!(ty.check_text_form(), Err(ConfigError::InvalidSchema(_))), "{ty:?}");
        }
        FieldType::Enum(EnumType::new("Level", &["LOW", "HIGH"])).check_text_form().unwrap();
        FieldType::object("point").check_text_form().unwrap();
        FieldType::VarInt64.check_text_form().unwrap();
    }

    #[test]
    fn accepts_matches_value_kinds() {
        assert!(FieldType::VarInt32.accepts(&Value::Int32(1)));
        assert!(FieldType::VarInt64.accepts(&Value::Int64(1)));
        assert!(!FieldType::Int64.accepts(&Value::Int32(1)));
        assert!(!FieldType::Utf8.accepts(&Value::Null));
    }

    #[test]
    fn object_values_compare_by_content() {
        let a = Value::Object(ObjectValue::new((1i32, "x".to_string())));
        let b = Value::Object(ObjectValue::new((1i32, "x".to_string())));
        let c = Value::Object(ObjectValue::new((2i32, "x".to_string())));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(Value::Object(ObjectValue::new(1i32)), Value::Object(ObjectValue::new(1i64)));
    }

    #[test]
    fn nan_equals_itself() {
        assert_eq!(Value::Float64(f64::NAN), Value::Float64(f64::NAN));
        assert_ne!(Value::Float32(0.0), Value::Float32(-0.0));
    }
}
