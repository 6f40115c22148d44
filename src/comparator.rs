//! 记录比较：对象模式（`Record`）与字节模式（已编码记录）
//!
//! 两种模式先把每个字段归约为同一个 `FieldKey`，再用同一个函数比较，
//! 因此对任意记录 a、b 都有
//! `sign(compare_records(a, b)) == sign(compare_encoded(ser(a), ser(b)))`。
//!
//! ```text
//! 公共排序字段 0..k   ── NULL 策略（绝对，不随 DESC 翻转）→ 自定义比较器 / 默认顺序 → DESC 取反
//! 数据源顺序标记      ── 比较数据源编号
//! 二级排序字段        ── 仅当两条记录属于同一数据源
//! ```

use std::borrow::Cow;
use std::cmp::Ordering;
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};

use crate::capability::ObjectCodec;
use crate::common::{DecodeError, EncodeError, NullOrder, Result, SourceId};
use crate::encoding::{
    bitmap_len, is_null_bit, null_bits, read_payload, read_value, unzigzag32, unzigzag64, ByteReader,
};
use crate::field_type::{FieldType, Value};
use crate::layout::{BoundRecord, DerivedLayout, SortField};
use crate::record::Record;
use crate::schema::{Field, FieldSchema};

// ── 字段键 ────────────────────────────────────────────────────────────────────

/// 默认顺序下的可比较形式
#[derive(Debug)]
enum FieldKey<'a> {
    Int(i64),
    F32(f32),
    F64(f64),
    Bool(bool),
    Ordinal(u32),
    Bytes(Cow<'a, [u8]>),
}

fn cmp_keys(a: &FieldKey<'_>, b: &FieldKey<'_>) -> Ordering {
    match (a, b) {
        (FieldKey::Int(x), FieldKey::Int(y))         => x.cmp(y),
        (FieldKey::F32(x), FieldKey::F32(y))         => x.total_cmp(y),
        (FieldKey::F64(x), FieldKey::F64(y))         => x.total_cmp(y),
        (FieldKey::Bool(x), FieldKey::Bool(y))       => x.cmp(y),
        (FieldKey::Ordinal(x), FieldKey::Ordinal(y)) => x.cmp(y),
        (FieldKey::Bytes(x), FieldKey::Bytes(y))     => x.as_ref().cmp(y.as_ref()),
        // 同一字段两侧类型一致，不会走到这里
        _ => Ordering::Equal,
    }
}

fn value_key<'v>(field: &Field, codec: Option<&dyn ObjectCodec>, value: &'v Value) -> std::result::Result<FieldKey<'v>, EncodeError> {
    Ok(match (&field.field_type, value) {
        (FieldType::Int32 | FieldType::VarInt32, Value::Int32(v)) => FieldKey::Int(i64::from(*v)),
        (FieldType::Int64 | FieldType::VarInt64, Value::Int64(v)) => FieldKey::Int(*v),
        (FieldType::Float32, Value::Float32(v)) => FieldKey::F32(*v),
        (FieldType::Float64, Value::Float64(v)) => FieldKey::F64(*v),
        (FieldType::Boolean, Value::Boolean(v)) => FieldKey::Bool(*v),
        (FieldType::Enum(_), Value::Enum(v))    => FieldKey::Ordinal(*v),
        (FieldType::Utf8, Value::Utf8(s))       => FieldKey::Bytes(Cow::Borrowed(s.as_bytes())),
        (FieldType::Bytes, Value::Bytes(b))     => FieldKey::Bytes(Cow::Borrowed(b)),
        (FieldType::Object { codec: tag }, Value::Object(obj)) => {
            let object_err = |reason: String| EncodeError::ObjectCodec {
                field: field.name.clone(), codec: tag.clone(), reason,
            };
            let codec = codec.ok_or_else(|| object_err("codec not resolved".into()))?;
            let mut buf = Vec::new();
            codec.encode(obj, &mut buf).map_err(object_err)?;
            FieldKey::Bytes(Cow::Owned(buf))
        }
        _ => return Err(type_mismatch(field, value)),
    })
}

fn encoded_key<'a>(r: &mut ByteReader<'a>, field: &Field) -> std::result::Result<FieldKey<'a>, DecodeError> {
    Ok(match &field.field_type {
        FieldType::Int32 | FieldType::VarInt32 => FieldKey::Int(i64::from(unzigzag32(r.read_uvarint32()?))),
        FieldType::VarInt64 => FieldKey::Int(unzigzag64(r.read_uvarint()?)),
        FieldType::Int64    => FieldKey::Int(BigEndian::read_i64(r.read_slice(8)?)),
        FieldType::Float32  => FieldKey::F32(BigEndian::read_f32(r.read_slice(4)?)),
        FieldType::Float64  => FieldKey::F64(BigEndian::read_f64(r.read_slice(8)?)),
        FieldType::Boolean  => match r.read_u8()? {
            0 => FieldKey::Bool(false),
            1 => FieldKey::Bool(true),
            byte => return Err(DecodeError::InvalidBoolean { field: field.name.clone(), byte }),
        },
        FieldType::Enum(_) => FieldKey::Ordinal(r.read_uvarint32()?),
        FieldType::Utf8 | FieldType::Bytes | FieldType::Object { .. } =>
            FieldKey::Bytes(Cow::Borrowed(r.read_len_prefixed()?)),
    })
}

fn type_mismatch(field: &Field, value: &Value) -> EncodeError {
    EncodeError::TypeMismatch {
        field:    field.name.clone(),
        expected: field.field_type.to_string(),
        actual:   value.type_name().into(),
    }
}

/// NULL 的位置由 null 策略决定，与升降序无关
fn null_ordering(sort: &SortField, a_null: bool, b_null: bool) -> Option<Ordering> {
    let null_side = match sort.null_order {
        NullOrder::First => Ordering::Less,
        NullOrder::Last  => Ordering::Greater,
    };
    match (a_null, b_null) {
        (true, true)   => Some(Ordering::Equal),
        (true, false)  => Some(null_side),
        (false, true)  => Some(null_side.reverse()),
        (false, false) => None,
    }
}

// ── 比较核心 ──────────────────────────────────────────────────────────────────

/// 一次比较覆盖的范围
#[derive(Debug, Clone, Copy)]
struct Span {
    /// 比较的公共字段个数
    fields: usize,
    /// 是否继续比较数据源顺序与二级排序
    sources: bool,
}

struct CompareCore {
    layout:             Arc<DerivedLayout>,
    common_null_bits:   Vec<Option<usize>>,
    specific_null_bits: Vec<Vec<Option<usize>>>,
}

impl CompareCore {
    fn new(layout: Arc<DerivedLayout>) -> Self {
        let common_null_bits = null_bits(layout.common_schema());
        let specific_null_bits = (0..layout.num_sources() as SourceId)
            .map(|s| null_bits(layout.specific_schema(s)))
            .collect();
        Self { layout, common_null_bits, specific_null_bits }
    }

    // ── 对象模式 ──────────────────────────────────────────────────────────────

    fn compare_values(
        field: &Field,
        codec: Option<&dyn ObjectCodec>,
        sort:  &SortField,
        a:     &Value,
        b:     &Value,
    ) -> std::result::Result<Ordering, EncodeError> {
        if let Some(ord) = null_ordering(sort, a.is_null(), b.is_null()) {
            return Ok(ord);
        }
        let ord = match &sort.comparator {
            Some(cmp) => {
                for v in [a, b] {
                    if !field.field_type.accepts(v) {
                        return Err(type_mismatch(field, v));
                    }
                }
                cmp.compare(a, b)
            }
            None => cmp_keys(&value_key(field, codec, a)?, &value_key(field, codec, b)?),
        };
        Ok(sort.order.apply(ord))
    }

    fn compare_records(&self, a: &Record, b: &Record, span: Span) -> Result<Ordering> {
        let layout = &*self.layout;
        let a = layout.bind(a)?;
        let b = layout.bind(b)?;

        let common = layout.common_schema();
        let a_pos = layout.common_to_source(a.source);
        let b_pos = layout.common_to_source(b.source);
        for i in 0..span.fields {
            let ord = Self::compare_values(
                common.field(i), layout.common_codecs()[i].as_deref(), &layout.common_sort()[i],
                a.value(a_pos[i]), b.value(b_pos[i]),
            )?;
            if ord != Ordering::Equal {
                return Ok(ord);
            }
        }
        if !span.sources {
            return Ok(Ordering::Equal);
        }
        self.compare_sources(&a, &b)
    }

    fn compare_sources(&self, a: &BoundRecord<'_>, b: &BoundRecord<'_>) -> Result<Ordering> {
        let layout = &*self.layout;
        let Some(order) = layout.source_order() else { return Ok(Ordering::Equal) };
        let ord = order.apply(a.source.cmp(&b.source));
        if ord != Ordering::Equal {
            return Ok(ord);
        }
        let s = a.source;
        let specific = layout.specific_schema(s);
        let pos = layout.specific_to_source(s);
        for (j, sort) in layout.secondary_sort(s).iter().enumerate() {
            let ord = Self::compare_values(
                specific.field(j), layout.specific_codecs(s)[j].as_deref(), sort,
                a.value(pos[j]), b.value(pos[j]),
            )?;
            if ord != Ordering::Equal {
                return Ok(ord);
            }
        }
        Ok(Ordering::Equal)
    }

    // ── 字节模式 ──────────────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    fn compare_encoded_field<'a, 'b>(
        field:  &Field,
        codec:  Option<&dyn ObjectCodec>,
        sort:   &SortField,
        nulls:  (bool, bool),
        ra:     &mut ByteReader<'a>,
        data_a: &'a [u8],
        rb:     &mut ByteReader<'b>,
        data_b: &'b [u8],
    ) -> std::result::Result<Ordering, DecodeError> {
        if let Some(ord) = null_ordering(sort, nulls.0, nulls.1) {
            return Ok(ord);
        }
        let ord = match &sort.comparator {
            Some(cmp) => {
                let (start_a, start_b) = (ra.position(), rb.position());
                let pa = read_payload(ra, &field.field_type)?;
                let pb = read_payload(rb, &field.field_type)?;
                match cmp.compare_encoded(pa, pb) {
                    Some(ord) => ord,
                    None => {
                        // 只解码这一个字段
                        let (mut va, mut vb) = (Value::Null, Value::Null);
                        read_value(&mut ByteReader::new(&data_a[start_a..ra.position()]), field, codec, &mut va)?;
                        read_value(&mut ByteReader::new(&data_b[start_b..rb.position()]), field, codec, &mut vb)?;
                        cmp.compare(&va, &vb)
                    }
                }
            }
            None => cmp_keys(&encoded_key(ra, field)?, &encoded_key(rb, field)?),
        };
        Ok(sort.order.apply(ord))
    }

    fn compare_encoded(&self, a: &[u8], b: &[u8], span: Span) -> Result<Ordering> {
        let layout = &*self.layout;
        let mut ra = ByteReader::new(a);
        let mut rb = ByteReader::new(b);

        let common = layout.common_schema();
        let nb = bitmap_len(common.nullable_count());
        let (bm_a, bm_b) = (ra.read_slice(nb)?, rb.read_slice(nb)?);
        for i in 0..span.fields {
            let nulls = match self.common_null_bits[i] {
                Some(bit) => (is_null_bit(bm_a, bit), is_null_bit(bm_b, bit)),
                None      => (false, false),
            };
            let ord = Self::compare_encoded_field(
                common.field(i), layout.common_codecs()[i].as_deref(), &layout.common_sort()[i],
                nulls, &mut ra, a, &mut rb, b,
            )?;
            if ord != Ordering::Equal {
                return Ok(ord);
            }
        }
        if !span.sources {
            return Ok(Ordering::Equal);
        }
        let Some(order) = layout.source_order() else { return Ok(Ordering::Equal) };

        // 多数据源时公共 schema 恰好是公共排序字段，读完即到数据源编号
        let sa = ra.read_uvarint()?;
        let sb = rb.read_uvarint()?;
        for id in [sa, sb] {
            if id >= layout.num_sources() as u64 {
                return Err(DecodeError::UnknownSource(id).into());
            }
        }
        let ord = order.apply(sa.cmp(&sb));
        if ord != Ordering::Equal {
            return Ok(ord);
        }
        let s = sa as SourceId;
        let specific = layout.specific_schema(s);
        let bits = &self.specific_null_bits[s as usize];
        let nb = bitmap_len(specific.nullable_count());
        let (bm_a, bm_b) = (ra.read_slice(nb)?, rb.read_slice(nb)?);
        for (j, sort) in layout.secondary_sort(s).iter().enumerate() {
            let nulls = match bits[j] {
                Some(bit) => (is_null_bit(bm_a, bit), is_null_bit(bm_b, bit)),
                None      => (false, false),
            };
            let ord = Self::compare_encoded_field(
                specific.field(j), layout.specific_codecs(s)[j].as_deref(), sort,
                nulls, &mut ra, a, &mut rb, b,
            )?;
            if ord != Ordering::Equal {
                return Ok(ord);
            }
        }
        Ok(Ordering::Equal)
    }
}

fn slice_of(buf: &[u8], off: usize, len: usize) -> std::result::Result<&[u8], DecodeError> {
    off.checked_add(len)
        .and_then(|end| buf.get(off..end))
        .ok_or(DecodeError::Truncated(buf.len()))
}

// ── SortComparator ────────────────────────────────────────────────────────────

/// 全序：公共排序字段 → 数据源顺序 → 二级排序字段
pub struct SortComparator {
    core: CompareCore,
}

impl SortComparator {
    pub fn new(layout: Arc<DerivedLayout>) -> Self { Self { core: CompareCore::new(layout) } }

    fn span(&self) -> Span {
        Span { fields: self.core.layout.common_sort().len(), sources: true }
    }

    pub fn compare_records(&self, a: &Record, b: &Record) -> Result<Ordering> {
        self.core.compare_records(a, b, self.span())
    }

    pub fn compare_encoded(&self, a: &[u8], b: &[u8]) -> Result<Ordering> {
        self.core.compare_encoded(a, b, self.span())
    }

    pub fn compare_raw(
        &self,
        buf_a: &[u8], off_a: usize, len_a: usize,
        buf_b: &[u8], off_b: usize, len_b: usize,
    ) -> Result<Ordering> {
        self.compare_encoded(slice_of(buf_a, off_a, len_a)?, slice_of(buf_b, off_b, len_b)?)
    }

    /// 原地排序；任一次比较失败时返回第一个错误，此时顺序未定义
    pub fn sort_records(&self, records: &mut [Record]) -> Result<()> {
        let mut failure = None;
        records.sort_by(|a, b| match self.compare_records(a, b) {
            Ok(ord) => ord,
            Err(e) => {
                failure.get_or_insert(e);
                Ordering::Equal
            }
        });
        failure.map_or(Ok(()), Err)
    }
}

// ── GroupComparator ───────────────────────────────────────────────────────────

/// 只比较分组字段，判断两条记录是否属于同一组
pub struct GroupComparator {
    core: CompareCore,
}

impl GroupComparator {
    pub fn new(layout: Arc<DerivedLayout>) -> Self { Self { core: CompareCore::new(layout) } }

    pub fn group_schema(&self) -> &Arc<FieldSchema> { self.core.layout.group_schema() }

    fn span(&self, depth: usize) -> Span {
        Span { fields: (depth + 1).min(self.core.layout.group_len()), sources: false }
    }

    fn full(&self) -> Span { Span { fields: self.core.layout.group_len(), sources: false } }

    pub fn compare_records(&self, a: &Record, b: &Record) -> Result<Ordering> {
        self.core.compare_records(a, b, self.full())
    }

    /// 只比较分组字段 `0..=depth`
    pub fn compare_records_at_depth(&self, a: &Record, b: &Record, depth: usize) -> Result<Ordering> {
        self.core.compare_records(a, b, self.span(depth))
    }

    pub fn compare_encoded(&self, a: &[u8], b: &[u8]) -> Result<Ordering> {
        self.core.compare_encoded(a, b, self.full())
    }

    pub fn compare_encoded_at_depth(&self, a: &[u8], b: &[u8], depth: usize) -> Result<Ordering> {
        self.core.compare_encoded(a, b, self.span(depth))
    }

    pub fn compare_raw(
        &self,
        buf_a: &[u8], off_a: usize, len_a: usize,
        buf_b: &[u8], off_b: usize, len_b: usize,
    ) -> Result<Ordering> {
        self.compare_encoded(slice_of(buf_a, off_a, len_a)?, slice_of(buf_b, off_b, len_b)?)
    }
}
