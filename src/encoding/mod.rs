//! 字段级编码原语
//!
//! - **定长**：Int64 / Float32 / Float64 大端，Boolean 1 字节
//! - **变长**：Int32 / VarInt32 / VarInt64 使用 zig-zag LEB128；
//!   枚举序号、长度前缀、数据源编号使用无符号 LEB128
//! - **带长度前缀**：Utf8 / Bytes / Object（Object 的负载由 `ObjectCodec` 产生）
//! - **null bitmap**：每个可为 NULL 的字段占 1 位（按 schema 顺序，字节内低位在前），
//!   置位表示 NULL，此时该字段不写任何字节

use byteorder::{BigEndian, ByteOrder};

use crate::capability::ObjectCodec;
use crate::common::{DecodeError, EncodeError};
use crate::field_type::{FieldType, Value};
use crate::schema::{Field, FieldSchema};

/// u64 的 LEB128 最多 10 字节
const MAX_VARINT_LEN: usize = 10;

// ── 写入 ──────────────────────────────────────────────────────────────────────

pub fn write_uvarint(out: &mut Vec<u8>, mut v: u64) {
    loop {
        let byte = (v & 0x7F) as u8;
        v >>= 7;
        if v == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

pub fn zigzag32(v: i32) -> u32 { ((v << 1) ^ (v >> 31)) as u32 }
pub fn zigzag64(v: i64) -> u64 { ((v << 1) ^ (v >> 63)) as u64 }
pub fn unzigzag32(v: u32) -> i32 { ((v >> 1) as i32) ^ -((v & 1) as i32) }
pub fn unzigzag64(v: u64) -> i64 { ((v >> 1) as i64) ^ -((v & 1) as i64) }

fn write_len_prefixed(out: &mut Vec<u8>, bytes: &[u8]) {
    write_uvarint(out, bytes.len() as u64);
    out.extend_from_slice(bytes);
}

/// null bitmap 占用的字节数
pub fn bitmap_len(nullable_fields: usize) -> usize { nullable_fields.div_ceil(8) }

pub fn is_null_bit(bitmap: &[u8], bit: usize) -> bool { bitmap[bit / 8] & (1 << (bit % 8)) != 0 }

/// 每个字段在 null bitmap 中的位序；不可为 NULL 的字段为 None
pub fn null_bits(schema: &FieldSchema) -> Vec<Option<usize>> {
    let mut next = 0;
    schema.fields().iter()
        .map(|f| f.nullable.then(|| { next += 1; next - 1 }))
        .collect()
}

fn type_mismatch(field: &Field, value: &Value) -> EncodeError {
    EncodeError::TypeMismatch {
        field:    field.name.clone(),
        expected: field.field_type.to_string(),
        actual:   value.type_name().into(),
    }
}

/// 写一个非 NULL 值
pub fn write_value(
    out:   &mut Vec<u8>,
    field: &Field,
    codec: Option<&dyn ObjectCodec>,
    value: &Value,
) -> Result<(), EncodeError> {
    match (&field.field_type, value) {
        (FieldType::Int32 | FieldType::VarInt32, Value::Int32(v)) =>
            write_uvarint(out, u64::from(zigzag32(*v))),
        (FieldType::VarInt64, Value::Int64(v)) => write_uvarint(out, zigzag64(*v)),
        (FieldType::Int64, Value::Int64(v)) => {
            let mut buf = [0u8; 8];
            BigEndian::write_i64(&mut buf, *v);
            out.extend_from_slice(&buf);
        }
        (FieldType::Float32, Value::Float32(v)) => {
            let mut buf = [0u8; 4];
            BigEndian::write_f32(&mut buf, *v);
            out.extend_from_slice(&buf);
        }
        (FieldType::Float64, Value::Float64(v)) => {
            let mut buf = [0u8; 8];
            BigEndian::write_f64(&mut buf, *v);
            out.extend_from_slice(&buf);
        }
        (FieldType::Boolean, Value::Boolean(v)) => out.push(u8::from(*v)),
        (FieldType::Utf8, Value::Utf8(s))       => write_len_prefixed(out, s.as_bytes()),
        (FieldType::Bytes, Value::Bytes(b))     => write_len_prefixed(out, b),
        (FieldType::Enum(e), Value::Enum(ord)) => {
            if *ord as usize >= e.variants.len() {
                return Err(EncodeError::TypeMismatch {
                    field:    field.name.clone(),
                    expected: field.field_type.to_string(),
                    actual:   format!("ordinal {ord}"),
                });
            }
            write_uvarint(out, u64::from(*ord));
        }
        (FieldType::Object { codec: tag }, Value::Object(obj)) => {
            let codec = codec.ok_or_else(|| EncodeError::ObjectCodec {
                field: field.name.clone(), codec: tag.clone(), reason: "codec not resolved".into(),
            })?;
            let mut payload = Vec::new();
            codec.encode(obj, &mut payload).map_err(|reason| EncodeError::ObjectCodec {
                field: field.name.clone(), codec: tag.clone(), reason,
            })?;
            write_len_prefixed(out, &payload);
        }
        (_, Value::Null) => return Err(EncodeError::NullNotAllowed(field.name.clone())),
        _ => return Err(type_mismatch(field, value)),
    }
    Ok(())
}

// ── 读取 ──────────────────────────────────────────────────────────────────────

/// 在字节切片上前进的游标
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos:  usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self { Self { data, pos: 0 } }

    pub fn position(&self)  -> usize { self.pos }
    pub fn remaining(&self) -> usize { self.data.len() - self.pos }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        let b = *self.data.get(self.pos).ok_or(DecodeError::Truncated(self.pos))?;
        self.pos += 1;
        Ok(b)
    }

    pub fn read_slice(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if len > self.remaining() {
            return Err(DecodeError::Truncated(self.data.len()));
        }
        let s = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(s)
    }

    pub fn read_uvarint(&mut self) -> Result<u64, DecodeError> {
        let start = self.pos;
        let mut result = 0u64;
        for i in 0..MAX_VARINT_LEN {
            let byte = self.read_u8()?;
            let payload = u64::from(byte & 0x7F);
            // 第 10 个字节只能携带最高 1 位
            if i == MAX_VARINT_LEN - 1 && payload > 1 {
                return Err(DecodeError::VarIntOverflow(start));
            }
            result |= payload << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(result);
            }
        }
        Err(DecodeError::VarIntOverflow(start))
    }

    pub fn read_uvarint32(&mut self) -> Result<u32, DecodeError> {
        let start = self.pos;
        u32::try_from(self.read_uvarint()?).map_err(|_| DecodeError::VarIntOverflow(start))
    }

    /// 读长度前缀并返回对应的字节
    pub fn read_len_prefixed(&mut self) -> Result<&'a [u8], DecodeError> {
        let offset = self.pos;
        let len = self.read_uvarint()?;
        if len > self.remaining() as u64 {
            return Err(DecodeError::InvalidLength { offset, len });
        }
        self.read_slice(len as usize)
    }
}

/// 读取单个字段的负载字节：变长类型去掉长度前缀，定长类型为其原始字节，
/// 整型/枚举为 varint 本身
pub fn read_payload<'a>(r: &mut ByteReader<'a>, ty: &FieldType) -> Result<&'a [u8], DecodeError> {
    match ty {
        FieldType::Utf8 | FieldType::Bytes | FieldType::Object { .. } => r.read_len_prefixed(),
        FieldType::Int64 | FieldType::Float64 => r.read_slice(8),
        FieldType::Float32                    => r.read_slice(4),
        FieldType::Boolean                    => r.read_slice(1),
        FieldType::Int32 | FieldType::VarInt32 | FieldType::VarInt64 | FieldType::Enum(_) => {
            let start = r.position();
            r.read_uvarint()?;
            let end = r.position();
            Ok(&r.data[start..end])
        }
    }
}

/// 读一个非 NULL 值到 `slot`，尽量复用 slot 中已有的缓冲
pub fn read_value(
    r:     &mut ByteReader<'_>,
    field: &Field,
    codec: Option<&dyn ObjectCodec>,
    slot:  &mut Value,
) -> Result<(), DecodeError> {
    match &field.field_type {
        FieldType::Int32 | FieldType::VarInt32 => *slot = Value::Int32(unzigzag32(r.read_uvarint32()?)),
        FieldType::VarInt64 => *slot = Value::Int64(unzigzag64(r.read_uvarint()?)),
        FieldType::Int64    => *slot = Value::Int64(BigEndian::read_i64(r.read_slice(8)?)),
        FieldType::Float32  => *slot = Value::Float32(BigEndian::read_f32(r.read_slice(4)?)),
        FieldType::Float64  => *slot = Value::Float64(BigEndian::read_f64(r.read_slice(8)?)),
        FieldType::Boolean  => {
            *slot = match r.read_u8()? {
                0 => Value::Boolean(false),
                1 => Value::Boolean(true),
                byte => return Err(DecodeError::InvalidBoolean { field: field.name.clone(), byte }),
            };
        }
        FieldType::Enum(e) => {
            let ordinal = r.read_uvarint()?;
            if ordinal >= e.variants.len() as u64 {
                return Err(DecodeError::InvalidOrdinal { field: field.name.clone(), ordinal });
            }
            *slot = Value::Enum(ordinal as u32);
        }
        FieldType::Utf8 => {
            let bytes = r.read_len_prefixed()?;
            let s = std::str::from_utf8(bytes).map_err(|_| DecodeError::InvalidUtf8(field.name.clone()))?;
            match slot {
                Value::Utf8(buf) => { buf.clear(); buf.push_str(s); }
                _ => *slot = Value::Utf8(s.to_string()),
            }
        }
        FieldType::Bytes => {
            let bytes = r.read_len_prefixed()?;
            match slot {
                Value::Bytes(buf) => { buf.clear(); buf.extend_from_slice(bytes); }
                _ => *slot = Value::Bytes(bytes.to_vec()),
            }
        }
        FieldType::Object { codec: tag } => {
            let bytes = r.read_len_prefixed()?;
            let codec = codec.ok_or_else(|| DecodeError::ObjectCodec {
                field: field.name.clone(), codec: tag.clone(), reason: "codec not resolved".into(),
            })?;
            let obj = codec.decode(bytes).map_err(|reason| DecodeError::ObjectCodec {
                field: field.name.clone(), codec: tag.clone(), reason,
            })?;
            *slot = Value::Object(obj);
        }
    }
    Ok(())
}
