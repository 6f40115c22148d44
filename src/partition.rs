//! 分区键：同一组的记录无论来自哪个数据源都落到同一分区

use std::sync::Arc;

use crate::capability::ObjectCodec;
use crate::common::Result;
use crate::encoding::write_value;
use crate::layout::DerivedLayout;
use crate::record::Record;
use crate::schema::Field;

const FNV_OFFSET: u64 = 0xcbf29ce484222325;
const FNV_PRIME:  u64 = 0x100000001b3;

/// FNV-1a 64-bit
#[derive(Debug, Clone, Copy)]
struct Fnv1a(u64);

impl Fnv1a {
    fn new() -> Self { Self(FNV_OFFSET) }

    fn write(&mut self, bytes: &[u8]) {
        for b in bytes {
            self.0 ^= u64::from(*b);
            self.0 = self.0.wrapping_mul(FNV_PRIME);
        }
    }

    fn finish(self) -> u64 { self.0 }
}

/// 值前的标记字节，区分 NULL 与空值
const TAG_NULL:  u8 = 0;
const TAG_VALUE: u8 = 1;

pub struct PartitionKeyDeriver {
    layout: Arc<DerivedLayout>,
    /// 分区字段（取自 CommonSchema，可为 NULL 性按所有数据源合并）及其编解码器
    fields: Vec<(Field, Option<Arc<dyn ObjectCodec>>)>,
}

impl PartitionKeyDeriver {
    pub fn new(layout: Arc<DerivedLayout>) -> Self {
        let common = layout.common_schema();
        let fields = layout.partition_fields().iter()
            .filter_map(|name| common.index_of(name))
            .map(|i| (common.field(i).clone(), layout.common_codecs()[i].clone()))
            .collect();
        Self { layout, fields }
    }

    /// 分区字段的规范字节上的 FNV-1a 哈希，与字段在各数据源中的位置无关
    pub fn partition_key(&self, record: &Record) -> Result<u64> {
        let bound = self.layout.bind(record)?;
        let positions = self.layout.partition_to_source(bound.source);
        let mut hasher = Fnv1a::new();
        let mut buf = Vec::new();
        for ((field, codec), &pos) in self.fields.iter().zip(positions) {
            buf.clear();
            let value = bound.value(pos);
            if value.is_null() {
                buf.push(TAG_NULL);
            } else {
                buf.push(TAG_VALUE);
                write_value(&mut buf, field, codec.as_deref(), value)?;
            }
            hasher.write(&buf);
        }
        Ok(hasher.finish())
    }

    /// `num_partitions` 为 0 时视为 1
    pub fn partition(&self, record: &Record, num_partitions: u32) -> Result<u32> {
        let key = self.partition_key(record)?;
        Ok((key % u64::from(num_partitions.max(1))) as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{CoGroupError, EncodeError};
    use crate::config::ConfigBuilder;
    use crate::field_type::Value;
    use crate::schema::FieldSchema;

    fn layout() -> Arc<DerivedLayout> {
        let mut b = ConfigBuilder::new();
        b.add_source(FieldSchema::parse("users", "name:string,country:string?,city:string").unwrap())
         .add_source(FieldSchema::parse("orders", "city:string,amount:double,country:string").unwrap())
         .set_group_by(&["country", "city"]);
        b.build().unwrap()
    }

    fn rec(layout: &DerivedLayout, source: u32, values: Vec<Value>) -> Record {
        Record::with_values(Arc::clone(layout.source_schema(source)), values).unwrap()
    }

    #[test]
    fn same_group_same_key_across_sources() {
        let layout = layout();
        let deriver = PartitionKeyDeriver::new(Arc::clone(&layout));
        let user  = rec(&layout, 0, vec![Value::from("ana"), Value::from("ES"), Value::from("Madrid")]);
        let order = rec(&layout, 1, vec![Value::from("Madrid"), Value::Float64(3.0), Value::from("ES")]);
        assert_eq!(deriver.partition_key(&user).unwrap(), deriver.partition_key(&order).unwrap());
        assert_eq!(deriver.partition(&user, 16).unwrap(), deriver.partition(&order, 16).unwrap());

        let elsewhere = rec(&layout, 1, vec![Value::from("Paris"), Value::Float64(3.0), Value::from("ES")]);
        assert_ne!(deriver.partition_key(&user).unwrap(), deriver.partition_key(&elsewhere).unwrap());
    }

    #[test]
    fn null_differs_from_empty_string() {
        let layout = layout();
        let deriver = PartitionKeyDeriver::new(Arc::clone(&layout));
        let null  = rec(&layout, 0, vec![Value::from("a"), Value::Null, Value::from("x")]);
        let empty = rec(&layout, 0, vec![Value::from("a"), Value::from(""), Value::from("x")]);
        assert_ne!(deriver.partition_key(&null).unwrap(), deriver.partition_key(&empty).unwrap());
    }

    #[test]
    fn rollup_partitions_on_base_prefix() {
        let mut b = ConfigBuilder::new();
        b.add_source(FieldSchema::parse("s", "a:int,b:int").unwrap())
         .set_group_by(&["a", "b"])
         .set_order_by(crate::criteria::SortSpec::parse("a asc, b asc").unwrap())
         .set_rollup_from("a");
        let layout = b.build().unwrap();
        let deriver = PartitionKeyDeriver::new(Arc::clone(&layout));
        let x = rec(&layout, 0, vec![Value::Int32(1), Value::Int32(1)]);
        let y = rec(&layout, 0, vec![Value::Int32(1), Value::Int32(2)]);
        assert_eq!(deriver.partition_key(&x).unwrap(), deriver.partition_key(&y).unwrap());
        assert!(deriver.partition(&x, 0).unwrap() == 0);
    }

    #[test]
    fn type_errors_surface() {
        let layout = layout();
        let deriver = PartitionKeyDeriver::new(Arc::clone(&layout));
        let bad = rec(&layout, 0, vec![Value::from("a"), Value::Int32(1), Value::from("x")]);
        assert!(matches!(
            deriver.partition_key(&bad),
            Err(CoGroupError::Encode(EncodeError::TypeMismatch { .. }))
        ));
    }
}
