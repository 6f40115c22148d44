//! 字段 Schema：有名、有序、不可变的字段列表
//!
//! 文本语法：`field1:type1,field2:type2?,...`，`?` 表示可为 NULL。

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::common::ConfigError;
use crate::field_type::FieldType;

// ── 字段定义 ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Field {
    pub name:       String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub nullable:   bool,
}

impl Field {
    pub fn new(name: &str, field_type: FieldType) -> Self {
        Self { name: name.into(), field_type, nullable: false }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true; self
    }
}

impl std::fmt::Display for Field {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}{}", self.name, self.field_type, if self.nullable { "?" } else { "" })
    }
}

// ── Field Schema ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "RawSchema")]
pub struct FieldSchema {
    name:   String,
    fields: Vec<Field>,
    #[serde(skip)]
    index:  HashMap<String, usize>,
}

#[derive(Deserialize)]
struct RawSchema {
    name:   String,
    fields: Vec<Field>,
}

impl TryFrom<RawSchema> for FieldSchema {
    type Error = ConfigError;
    fn try_from(raw: RawSchema) -> Result<Self, Self::Error> { Self::new(&raw.name, raw.fields) }
}

impl FieldSchema {
    /// 构建 schema；字段名重复或类型无法以文本保存时报错
    pub fn new(name: &str, fields: Vec<Field>) -> Result<Self, ConfigError> {
        let mut index = HashMap::with_capacity(fields.len());
        for (i, f) in fields.iter().enumerate() {
            f.field_type.check_text_form()?;
            if index.insert(f.name.clone(), i).is_some() {
                return Err(ConfigError::DuplicateField { schema: name.into(), field: f.name.clone() });
            }
        }
        Ok(Self { name: name.into(), fields, index })
    }

    /// 解析文本语法 `a:int,b:string?`
    pub fn parse(name: &str, text: &str) -> Result<Self, ConfigError> {
        let mut fields = Vec::new();
        for item in text.split(',') {
            let item = item.trim();
            let (fname, ty) = item.split_once(':')
                .ok_or_else(|| ConfigError::InvalidSchema(format!("expected name:type, got '{item}'")))?;
            let fname = fname.trim();
            if fname.is_empty() {
                return Err(ConfigError::InvalidSchema(format!("empty field name in '{item}'")));
            }
            let ty = ty.trim();
            let (ty, nullable) = match ty.strip_suffix('?') {
                Some(t) => (t, true),
                None    => (ty, false),
            };
            fields.push(Field { name: fname.into(), field_type: ty.parse()?, nullable });
        }
        Self::new(name, fields)
    }

    pub fn into_arc(self) -> Arc<Self> { Arc::new(self) }

    pub fn name(&self)     -> &str     { &self.name }
    pub fn fields(&self)   -> &[Field] { &self.fields }
    pub fn len(&self)      -> usize    { self.fields.len() }
    pub fn is_empty(&self) -> bool     { self.fields.is_empty() }

    pub fn field(&self, idx: usize) -> &Field { &self.fields[idx] }

    pub fn index_of(&self, name: &str) -> Option<usize> { self.index.get(name).copied() }

    pub fn field_by_name(&self, name: &str) -> Option<&Field> {
        self.index_of(name).map(|i| &self.fields[i])
    }

    pub fn contains(&self, name: &str) -> bool { self.index.contains_key(name) }

    /// 可为 NULL 的字段数，决定 null bitmap 的位数
    pub fn nullable_count(&self) -> usize { self.fields.iter().filter(|f| f.nullable).count() }
}

/// 只比较字段列表，schema 名不参与
impl PartialEq for FieldSchema {
    fn eq(&self, other: &Self) -> bool { self.fields == other.fields }
}

impl Eq for FieldSchema {}

impl std::fmt::Display for FieldSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, field) in self.fields.iter().enumerate() {
            if i > 0 { write!(f, ",")?; }
            write!(f, "{field}")?;
        }
        Ok(())
    }
}
