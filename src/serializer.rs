//! 记录的二进制编解码
//!
//! 线上格式：
//! ```text
//! ┌────────────────────────────────────────────┐
//! │ common null bitmap   (仅当有可为 NULL 字段) │
//! │ CommonSchema 字段     按 schema 顺序         │
//! │ source id (uvarint)   仅多数据源             │
//! │ specific null bitmap  (仅当有可为 NULL 字段) │
//! │ SpecificSchema[id] 字段                     │
//! └────────────────────────────────────────────┘
//! ```
//! NULL 字段只占 bitmap 中的一位，不写任何字节。

use std::collections::HashSet;
use std::sync::Arc;

use crate::capability::Capabilities;
use crate::common::{CoGroupError, ConfigError, DecodeError, EncodeError, Result, SourceId};
use crate::encoding::{bitmap_len, is_null_bit, null_bits, read_value, write_uvarint, write_value, ByteReader};
use crate::field_type::Value;
use crate::layout::{resolve_codecs, DerivedLayout, FieldCodecs};
use crate::record::Record;
use crate::schema::FieldSchema;

// ── FieldsWriter ──────────────────────────────────────────────────────────────

/// 按目标 schema 写一组字段（bitmap + 字段）
pub struct FieldsWriter {
    schema:    Arc<FieldSchema>,
    codecs:    FieldCodecs,
    null_bits: Vec<Option<usize>>,
}

impl FieldsWriter {
    pub fn new(schema: Arc<FieldSchema>, caps: &Capabilities) -> std::result::Result<Self, ConfigError> {
        let codecs = resolve_codecs(&schema, caps)?;
        Ok(Self::from_parts(schema, codecs))
    }

    fn from_parts(schema: Arc<FieldSchema>, codecs: FieldCodecs) -> Self {
        let null_bits = null_bits(&schema);
        Self { schema, codecs, null_bits }
    }

    pub fn schema(&self) -> &Arc<FieldSchema> { &self.schema }

    /// `translation[i]` 为目标 schema 第 i 个字段在 `record` 中的位置
    pub fn write(&self, record: &Record, translation: &[usize], out: &mut Vec<u8>) -> std::result::Result<(), EncodeError> {
        self.write_with(|i| record.get(translation[i]), out)
    }

    fn write_with<'v>(
        &self,
        value_at: impl Fn(usize) -> &'v Value,
        out:      &mut Vec<u8>,
    ) -> std::result::Result<(), EncodeError> {
        let bitmap_at = out.len();
        out.resize(bitmap_at + bitmap_len(self.schema.nullable_count()), 0);
        for (i, field) in self.schema.fields().iter().enumerate() {
            let value = value_at(i);
            if let (Some(bit), true) = (self.null_bits[i], value.is_null()) {
                out[bitmap_at + bit / 8] |= 1 << (bit % 8);
                continue;
            }
            write_value(out, field, self.codecs[i].as_deref(), value)?;
        }
        Ok(())
    }
}

// ── FieldsReader ──────────────────────────────────────────────────────────────

/// 读取以 `read` schema 编码的字段，输出为 `target` schema 的记录
///
/// 两者按字段名对应。`read` 中有而 `target` 中没有的字段照常解析后丢进私有暂存记录；
/// `target` 中有而 `read` 中没有的字段置为 NULL。
pub struct FieldsReader {
    read:      Arc<FieldSchema>,
    target:    Arc<FieldSchema>,
    codecs:    FieldCodecs,
    null_bits: Vec<Option<usize>>,
    lookup:    Vec<Option<usize>>,
    uncovered: Vec<usize>,
    scratch:   Record,
}

impl FieldsReader {
    pub fn new(read: Arc<FieldSchema>, target: Arc<FieldSchema>, caps: &Capabilities) -> Result<Self> {
        let codecs = resolve_codecs(&read, caps)?;
        let lookup = target_lookup(&read, &target)?;
        let uncovered = (0..target.len()).filter(|t| !lookup.contains(&Some(*t))).collect();
        let null_bits = null_bits(&read);
        let scratch = Record::new(Arc::clone(&read));
        Ok(Self { read, target, codecs, null_bits, lookup, uncovered, scratch })
    }

    pub fn read_into(&mut self, r: &mut ByteReader<'_>, target: &mut Record) -> std::result::Result<(), DecodeError> {
        if !Arc::ptr_eq(target.schema(), &self.target) {
            target.reset(&self.target);
        }
        let bitmap = r.read_slice(bitmap_len(self.read.nullable_count()))?;
        for (p, field) in self.read.fields().iter().enumerate() {
            let slot = match self.lookup[p] {
                Some(t) => target.get_mut(t),
                None    => self.scratch.get_mut(p),
            };
            match self.null_bits[p] {
                Some(bit) if is_null_bit(bitmap, bit) => *slot = Value::Null,
                _ => read_value(r, field, self.codecs[p].as_deref(), slot)?,
            }
        }
        for &t in &self.uncovered {
            *target.get_mut(t) = Value::Null;
        }
        Ok(())
    }

    pub fn deserialize(&mut self, bytes: &[u8]) -> Result<Record> {
        let mut record = Record::new(Arc::clone(&self.target));
        self.read_into(&mut ByteReader::new(bytes), &mut record)?;
        Ok(record)
    }
}

/// 读 schema 每个位置 → 目标 schema 的位置；同名不同类型视为不兼容
fn target_lookup(read: &FieldSchema, target: &FieldSchema) -> std::result::Result<Vec<Option<usize>>, DecodeError> {
    read.fields().iter()
        .map(|f| match target.index_of(&f.name) {
            Some(t) if target.field(t).field_type != f.field_type => Err(DecodeError::TypeMismatch {
                field:  f.name.clone(),
                read:   f.field_type.to_string(),
                target: target.field(t).field_type.to_string(),
            }),
            other => Ok(other),
        })
        .collect()
}

// ── RecordSerializer ──────────────────────────────────────────────────────────

/// 每个任务一个实例，不跨任务共享
pub struct RecordSerializer {
    layout:   Arc<DerivedLayout>,
    common:   FieldsWriter,
    specific: Vec<FieldsWriter>,
    /// 宽松模式下已报告过多余字段的 schema
    reported: HashSet<String>,
}

impl RecordSerializer {
    pub fn new(layout: Arc<DerivedLayout>) -> Self {
        let common = FieldsWriter::from_parts(
            Arc::clone(layout.common_schema()),
            layout.common_codecs().clone(),
        );
        let specific = (0..layout.num_sources() as SourceId)
            .map(|s| FieldsWriter::from_parts(
                Arc::clone(layout.specific_schema(s)),
                layout.specific_codecs(s).clone(),
            ))
            .collect();
        Self { layout, common, specific, reported: HashSet::new() }
    }

    /// 追加一条记录的编码到 `out`；失败时 `out` 保持原样
    pub fn serialize(&mut self, record: &Record, out: &mut Vec<u8>) -> Result<()> {
        let start = out.len();
        let res = self.write_record(record, out);
        if res.is_err() {
            out.truncate(start);
        }
        res.map_err(CoGroupError::from)
    }

    pub fn to_bytes(&mut self, record: &Record) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.serialize(record, &mut out)?;
        Ok(out)
    }

    fn write_record(&mut self, record: &Record, out: &mut Vec<u8>) -> std::result::Result<(), EncodeError> {
        let layout = &self.layout;
        let bound = layout.bind(record)?;
        let source = bound.source;

        if !bound.is_exact() && !self.reported.contains(record.schema().name()) {
            let extra: Vec<&str> = bound.extra_fields().collect();
            if !extra.is_empty() {
                log::debug!("source '{}': dropping fields {:?} not in the registered schema",
                    record.schema().name(), extra);
            }
            self.reported.insert(record.schema().name().to_string());
        }

        let common_pos = layout.common_to_source(source);
        // 公共字段只要任一数据源允许 NULL 就可为 NULL，这里按本数据源的声明再查一次
        let source_schema = layout.source_schema(source);
        for &pos in common_pos {
            let field = source_schema.field(pos);
            if !field.nullable && bound.value(pos).is_null() {
                return Err(EncodeError::NullNotAllowed(field.name.clone()));
            }
        }
        self.common.write_with(|i| bound.value(common_pos[i]), out)?;
        if layout.is_multi_source() {
            write_uvarint(out, u64::from(source));
            let specific_pos = layout.specific_to_source(source);
            self.specific[source as usize].write_with(|j| bound.value(specific_pos[j]), out)?;
        }
        Ok(())
    }
}

// ── RecordDeserializer ────────────────────────────────────────────────────────

/// 每个任务一个实例；公共字段先解进暂存区，读到数据源编号后再交换进目标记录
pub struct RecordDeserializer {
    layout:             Arc<DerivedLayout>,
    targets:            Vec<Arc<FieldSchema>>,
    /// 每个数据源：源字段位置 → 目标字段位置
    lookups:            Vec<Vec<Option<usize>>>,
    uncovered:          Vec<Vec<usize>>,
    common_null_bits:   Vec<Option<usize>>,
    specific_null_bits: Vec<Vec<Option<usize>>>,
    common_scratch:     Vec<Value>,
    /// 未使用字段的去处，按源字段位置索引
    discard:            Vec<Value>,
}

impl RecordDeserializer {
    /// 目标 schema 即各数据源注册的 schema
    pub fn new(layout: Arc<DerivedLayout>) -> Self {
        let targets = (0..layout.num_sources() as SourceId)
            .map(|s| Arc::clone(layout.source_schema(s)))
            .collect();
        let lookups = (0..layout.num_sources() as SourceId)
            .map(|s| (0..layout.source_schema(s).len()).map(Some).collect())
            .collect();
        Self::assemble(layout, targets, lookups)
    }

    /// 为每个数据源指定目标 schema（向后兼容读取）
    pub fn with_target_schemas(layout: Arc<DerivedLayout>, targets: Vec<Arc<FieldSchema>>) -> Result<Self> {
        if targets.len() != layout.num_sources() {
            return Err(ConfigError::InvalidSchema(format!(
                "expected {} target schemas, got {}", layout.num_sources(), targets.len(),
            )).into());
        }
        let lookups = targets.iter().enumerate()
            .map(|(s, t)| target_lookup(layout.source_schema(s as SourceId), t))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self::assemble(layout, targets, lookups))
    }

    fn assemble(layout: Arc<DerivedLayout>, targets: Vec<Arc<FieldSchema>>, lookups: Vec<Vec<Option<usize>>>) -> Self {
        let uncovered = targets.iter().zip(&lookups)
            .map(|(t, lookup)| (0..t.len()).filter(|i| !lookup.contains(&Some(*i))).collect())
            .collect();
        let common_null_bits = null_bits(layout.common_schema());
        let specific_null_bits = (0..layout.num_sources() as SourceId)
            .map(|s| null_bits(layout.specific_schema(s)))
            .collect();
        let common_scratch = vec![Value::Null; layout.common_schema().len()];
        let widest = (0..layout.num_sources() as SourceId)
            .map(|s| layout.source_schema(s).len())
            .max()
            .unwrap_or(0);
        Self {
            layout, targets, lookups, uncovered,
            common_null_bits, specific_null_bits, common_scratch,
            discard: vec![Value::Null; widest],
        }
    }

    pub fn target_schema(&self, source: SourceId) -> &Arc<FieldSchema> { &self.targets[source as usize] }

    /// 解码到可复用的记录中，返回消耗的字节数
    pub fn deserialize_into(&mut self, bytes: &[u8], record: &mut Record) -> Result<usize> {
        let layout = Arc::clone(&self.layout);
        let mut r = ByteReader::new(bytes);

        let common = layout.common_schema();
        let bitmap = r.read_slice(bitmap_len(common.nullable_count()))?;
        for (i, field) in common.fields().iter().enumerate() {
            let slot = &mut self.common_scratch[i];
            match self.common_null_bits[i] {
                Some(bit) if is_null_bit(bitmap, bit) => *slot = Value::Null,
                _ => read_value(&mut r, field, layout.common_codecs()[i].as_deref(), slot)?,
            }
        }

        let source = if layout.is_multi_source() {
            let id = r.read_uvarint()?;
            if id >= layout.num_sources() as u64 {
                return Err(DecodeError::UnknownSource(id).into());
            }
            id as SourceId
        } else {
            0
        };
        let s = source as usize;

        let target = &self.targets[s];
        if !Arc::ptr_eq(record.schema(), target) {
            record.reset(target);
        }
        let lookup = &self.lookups[s];
        for (i, &p) in layout.common_to_source(source).iter().enumerate() {
            if let Some(t) = lookup[p] {
                std::mem::swap(record.get_mut(t), &mut self.common_scratch[i]);
            }
        }

        let specific = layout.specific_schema(source);
        let codecs = layout.specific_codecs(source);
        let bitmap = r.read_slice(bitmap_len(specific.nullable_count()))?;
        for (j, (field, &p)) in specific.fields().iter().zip(layout.specific_to_source(source)).enumerate() {
            let slot = match lookup[p] {
                Some(t) => record.get_mut(t),
                None    => &mut self.discard[p],
            };
            match self.specific_null_bits[s][j] {
                Some(bit) if is_null_bit(bitmap, bit) => *slot = Value::Null,
                _ => read_value(&mut r, field, codecs[j].as_deref(), slot)?,
            }
        }

        for &t in &self.uncovered[s] {
            *record.get_mut(t) = Value::Null;
        }
        Ok(r.position())
    }

    pub fn deserialize(&mut self, bytes: &[u8]) -> Result<Record> {
        let mut record = Record::new(Arc::clone(&self.targets[0]));
        self.deserialize_into(bytes, &mut record)?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::SerdeJsonCodec;
    use crate::common::FieldMatching;
    use crate::config::ConfigBuilder;
    use crate::criteria::SortSpec;
    use crate::field_type::ObjectValue;

    fn schema(name: &str, text: &str) -> Arc<FieldSchema> {
        FieldSchema::parse(name, text).unwrap().into_arc()
    }

    fn record(schema: &Arc<FieldSchema>, values: Vec<Value>) -> Record {
        Record::with_values(Arc::clone(schema), values).unwrap()
    }

    fn single_layout(text: &str, group: &[&str]) -> Arc<DerivedLayout> {
        let mut b = ConfigBuilder::new();
        b.add_source(FieldSchema::parse("s", text).unwrap()).set_group_by(group);
        b.build().unwrap()
    }

    #[test]
    fn single_source_wire_bytes() {
        let layout = single_layout("a:int,b:string?,c:long", &["a"]);
        let s = layout.source_schema(0);
        let mut ser = RecordSerializer::new(Arc::clone(&layout));

        let bytes = ser.to_bytes(&record(s, vec![Value::Int32(-1), Value::from("hi"), Value::Int64(2)])).unwrap();
        assert_eq!(bytes, [0x00, 0x01, 0x02, b'h', b'i', 0, 0, 0, 0, 0, 0, 0, 2]);

        let bytes = ser.to_bytes(&record(s, vec![Value::Int32(3), Value::Null, Value::Int64(2)])).unwrap();
        assert_eq!(bytes, [0x01, 0x06, 0, 0, 0, 0, 0, 0, 0, 2]);

        let mut de = RecordDeserializer::new(Arc::clone(&layout));
        let back = de.deserialize(&bytes).unwrap();
        assert_eq!(back.values(), &[Value::Int32(3), Value::Null, Value::Int64(2)]);
    }

    #[test]
    fn multi_source_round_trip_with_reused_record() {
        let mut b = ConfigBuilder::new();
        b.add_source(FieldSchema::parse("users", "name:string,country:string,age:vint?").unwrap())
         .add_source(FieldSchema::parse("orders", "country:string,amount:double").unwrap())
         .set_group_by(&["country"]);
        let layout = b.build().unwrap();
        let users  = layout.source_schema(0);
        let orders = layout.source_schema(1);

        let mut ser = RecordSerializer::new(Arc::clone(&layout));
        let mut de  = RecordDeserializer::new(Arc::clone(&layout));
        let mut slot = Record::new(Arc::clone(users));

        let inputs = [
            record(users, vec![Value::from("ana"), Value::from("ES"), Value::Null]),
            record(orders, vec![Value::from("ES"), Value::Float64(9.5)]),
            record(users, vec![Value::from("bo"), Value::from("US"), Value::Int32(-40)]),
        ];
        for input in &inputs {
            let bytes = ser.to_bytes(input).unwrap();
            let used = de.deserialize_into(&bytes, &mut slot).unwrap();
            assert_eq!(used, bytes.len());
            assert_eq!(&slot, input);
        }
    }

    #[test]
    fn encode_errors_leave_buffer_untouched() {
        let layout = single_layout("a:int,b:string", &["a"]);
        let s = layout.source_schema(0);
        let mut ser = RecordSerializer::new(Arc::clone(&layout));
        let mut out = vec![0xEE];

        let err = ser.serialize(&record(s, vec![Value::Int32(1), Value::Null]), &mut out).unwrap_err();
        assert!(matches!(err, CoGroupError::Encode(EncodeError::NullNotAllowed(f)) if f == "b"));
        assert_eq!(out, [0xEE]);

        let err = ser.serialize(&record(s, vec![Value::Int64(1), Value::from("x")]), &mut out).unwrap_err();
        assert!(matches!(err, CoGroupError::Encode(EncodeError::TypeMismatch { .. })));
        assert_eq!(out, [0xEE]);

        ser.serialize(&record(s, vec![Value::Int32(1), Value::from("x")]), &mut out).unwrap();
        assert_eq!(out[0], 0xEE);
        assert_eq!(de_values(&layout, &out[1..]), vec![Value::Int32(1), Value::from("x")]);
    }

    #[test]
    fn common_null_rejected_for_source_declaring_non_nullable() {
        let mut b = ConfigBuilder::new();
        b.add_source(FieldSchema::parse("a", "k:int,x:string").unwrap())
         .add_source(FieldSchema::parse("b", "k:int?,y:string").unwrap())
         .set_group_by(&["k"]);
        let layout = b.build().unwrap();
        assert!(layout.common_schema().field(0).nullable);

        let mut ser = RecordSerializer::new(Arc::clone(&layout));
        let mut out = Vec::new();
        let err = ser.serialize(&record(layout.source_schema(0), vec![Value::Null, Value::from("v")]), &mut out).unwrap_err();
        assert!(matches!(err, CoGroupError::Encode(EncodeError::NullNotAllowed(f)) if f == "k"));
        assert!(out.is_empty());

        // b 声明 k 可为 NULL
        ser.serialize(&record(layout.source_schema(1), vec![Value::Null, Value::from("w")]), &mut out).unwrap();
        assert_eq!(de_values(&layout, &out), vec![Value::Null, Value::from("w")]);
    }

    fn de_values(layout: &Arc<DerivedLayout>, bytes: &[u8]) -> Vec<Value> {
        RecordDeserializer::new(Arc::clone(layout)).deserialize(bytes).unwrap().values().to_vec()
    }

    #[test]
    fn truncated_and_bad_source_id_rejected() {
        let mut b = ConfigBuilder::new();
        b.add_source(FieldSchema::parse("a", "k:int").unwrap())
         .add_source(FieldSchema::parse("b", "k:int").unwrap())
         .set_group_by(&["k"]);
        let layout = b.build().unwrap();
        let mut de = RecordDeserializer::new(Arc::clone(&layout));

        assert!(matches!(de.deserialize(&[0x02, 0x07]), Err(CoGroupError::Decode(DecodeError::UnknownSource(7)))));
        assert!(matches!(de.deserialize(&[0x02]), Err(CoGroupError::Decode(DecodeError::Truncated(_)))));
    }

    #[test]
    fn backward_compatible_read_with_target_schema() {
        let layout = single_layout("a:int,old:string,b:long?", &["a"]);
        let s = layout.source_schema(0);
        let bytes = RecordSerializer::new(Arc::clone(&layout))
            .to_bytes(&record(s, vec![Value::Int32(7), Value::from("gone"), Value::Int64(5)]))
            .unwrap();

        let target = schema("s", "b:long?,a:int,fresh:string?");
        let mut de = RecordDeserializer::with_target_schemas(Arc::clone(&layout), vec![Arc::clone(&target)]).unwrap();
        let back = de.deserialize(&bytes).unwrap();
        assert_eq!(back.values(), &[Value::Int64(5), Value::Int32(7), Value::Null]);

        let wrong = schema("s", "a:long");
        assert!(matches!(
            RecordDeserializer::with_target_schemas(Arc::clone(&layout), vec![wrong]),
            Err(CoGroupError::Decode(DecodeError::TypeMismatch { .. }))
        ));
    }

    #[test]
    fn fields_reader_discards_unused() {
        let caps = Capabilities::new();
        let read = schema("r", "x:int,skip:string,y:bytes?");
        let writer = FieldsWriter::new(Arc::clone(&read), &caps).unwrap();
        let mut bytes = Vec::new();
        let rec = record(&read, vec![Value::Int32(1), Value::from("zzz"), Value::Bytes(vec![1, 2])]);
        writer.write(&rec, &[0, 1, 2], &mut bytes).unwrap();

        let mut reader = FieldsReader::new(read, schema("t", "y:bytes?,x:int"), &caps).unwrap();
        let out = reader.deserialize(&bytes).unwrap();
        assert_eq!(out.values(), &[Value::Bytes(vec![1, 2]), Value::Int32(1)]);
    }

    #[test]
    fn object_fields_use_registered_codec() {
        #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
        struct Point { x: i32, y: i32 }

        let mut b = ConfigBuilder::new();
        b.add_source(FieldSchema::parse("s", "id:int,p:point?").unwrap())
         .set_group_by(&["id"])
         .with_object_codec("point", Arc::new(SerdeJsonCodec::<Point>::new()));
        let layout = b.build().unwrap();
        let s = layout.source_schema(0);

        let input = record(s, vec![Value::Int32(1), Value::Object(ObjectValue::new(Point { x: 3, y: 4 }))]);
        let bytes = RecordSerializer::new(Arc::clone(&layout)).to_bytes(&input).unwrap();
        let back = RecordDeserializer::new(Arc::clone(&layout)).deserialize(&bytes).unwrap();
        match back.get(1) {
            Value::Object(o) => assert_eq!(o.downcast_ref::<Point>(), Some(&Point { x: 3, y: 4 })),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn lenient_matching_drops_extra_and_nulls_missing() {
        let mut b = ConfigBuilder::new();
        b.add_source(FieldSchema::parse("s", "a:int,b:string?").unwrap())
         .set_group_by(&["a"])
         .set_field_matching(FieldMatching::Lenient);
        let layout = b.build().unwrap();

        let duck = record(&schema("s", "zzz:long,a:int"), vec![Value::Int64(1), Value::Int32(4)]);
        let bytes = RecordSerializer::new(Arc::clone(&layout)).to_bytes(&duck).unwrap();
        assert_eq!(de_values(&layout, &bytes), vec![Value::Int32(4), Value::Null]);
    }

    #[test]
    fn strict_matching_rejects_foreign_schema() {
        let layout = single_layout("a:int", &["a"]);
        let foreign = record(&schema("s", "a:int,b:int"), vec![Value::Int32(1), Value::Int32(2)]);
        let err = RecordSerializer::new(Arc::clone(&layout)).to_bytes(&foreign).unwrap_err();
        assert!(matches!(err, CoGroupError::Encode(EncodeError::SchemaMismatch(_))));
    }

    #[test]
    fn sort_spec_does_not_change_single_source_field_set() {
        let mut b = ConfigBuilder::new();
        b.add_source(FieldSchema::parse("s", "a:int,b:int").unwrap())
         .set_group_by(&["b"])
         .set_order_by(SortSpec::parse("b desc").unwrap());
        let layout = b.build().unwrap();
        let s = layout.source_schema(0);
        let bytes = RecordSerializer::new(Arc::clone(&layout))
            .to_bytes(&record(s, vec![Value::Int32(1), Value::Int32(2)]))
            .unwrap();
        // b 在前
        assert_eq!(bytes, [0x04, 0x02]);
    }
}
