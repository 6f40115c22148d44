//! 可复用的可变记录，符合且仅符合一个 `FieldSchema`

use std::sync::Arc;

use crate::field_type::Value;
use crate::schema::FieldSchema;

#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    schema: Arc<FieldSchema>,
    values: Vec<Value>,
}

impl Record {
    /// 所有字段初始为 NULL
    pub fn new(schema: Arc<FieldSchema>) -> Self {
        let values = vec![Value::Null; schema.len()];
        Self { schema, values }
    }

    /// 按 schema 顺序给出全部值；数量不符时返回 None
    pub fn with_values(schema: Arc<FieldSchema>, values: Vec<Value>) -> Option<Self> {
        (values.len() == schema.len()).then_some(Self { schema, values })
    }

    pub fn schema(&self) -> &Arc<FieldSchema> { &self.schema }
    pub fn values(&self) -> &[Value]          { &self.values }

    pub fn get(&self, idx: usize) -> &Value { &self.values[idx] }

    pub fn get_mut(&mut self, idx: usize) -> &mut Value { &mut self.values[idx] }

    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.schema.index_of(name).map(|i| &self.values[i])
    }

    pub fn set(&mut self, idx: usize, value: impl Into<Value>) {
        self.values[idx] = value.into();
    }

    /// 字段不存在时返回 false
    pub fn set_by_name(&mut self, name: &str, value: impl Into<Value>) -> bool {
        match self.schema.index_of(name) {
            Some(i) => { self.values[i] = value.into(); true }
            None    => false,
        }
    }

    /// 切换到另一个 schema 并清空所有值；schema 相同（同一 Arc）时只清空
    pub fn reset(&mut self, schema: &Arc<FieldSchema>) {
        if !Arc::ptr_eq(&self.schema, schema) {
            self.schema = Arc::clone(schema);
            self.values.resize(schema.len(), Value::Null);
        }
        for v in &mut self.values { *v = Value::Null; }
    }

    /// 复制另一条记录的内容，尽量复用已有的字符串与字节缓冲
    pub fn copy_from(&mut self, other: &Record) {
        if !Arc::ptr_eq(&self.schema, &other.schema) {
            self.schema = Arc::clone(&other.schema);
        }
        self.values.resize(other.values.len(), Value::Null);
        for (dst, src) in self.values.iter_mut().zip(&other.values) {
            match (dst, src) {
                (Value::Utf8(d), Value::Utf8(s))   => { d.clear(); d.push_str(s); }
                (Value::Bytes(d), Value::Bytes(s)) => { d.clear(); d.extend_from_slice(s); }
                (d, s)                             => *d = s.clone(),
            }
        }
    }
}

impl std::fmt::Display for Record {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{{", self.schema.name())?;
        for (i, (field, v)) in self.schema.fields().iter().zip(&self.values).enumerate() {
            if i > 0 { write!(f, ", ")?; }
            write!(f, "{}={v}", field.name)?;
        }
        write!(f, "}}")
    }
}
