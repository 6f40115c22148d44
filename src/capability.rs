//! 可注入的能力：自定义字段比较器与 Object 字段编解码器
//!
//! 配置阶段按 tag 注册，`DerivedLayout` 构建时解析，运行期不再按名字查找。

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::field_type::{ObjectValue, Value};

/// 自定义字段比较器
///
/// 对象模式下直接拿到完整的值；字节模式下先尝试 `compare_encoded`
/// （参数是单个字段去掉长度前缀后的负载字节），返回 None 时引擎只解码该字段再调用 `compare`。
/// 两个入口必须给出同一个全序。NULL 不会传进来，由排序元素的 null 策略处理。
pub trait FieldComparator: Send + Sync {
    fn compare(&self, a: &Value, b: &Value) -> Ordering;

    fn compare_encoded(&self, _a: &[u8], _b: &[u8]) -> Option<Ordering> { None }
}

/// Object 字段的编解码器
pub trait ObjectCodec: Send + Sync {
    fn encode(&self, value: &ObjectValue, out: &mut Vec<u8>) -> Result<(), String>;

    fn decode(&self, bytes: &[u8]) -> Result<ObjectValue, String>;
}

/// 以 JSON 编码任意 serde 类型的 Object 编解码器
pub struct SerdeJsonCodec<T>(PhantomData<fn() -> T>);

impl<T> SerdeJsonCodec<T> {
    pub fn new() -> Self { Self(PhantomData) }
}

impl<T> Default for SerdeJsonCodec<T> {
    fn default() -> Self { Self::new() }
}

impl<T> ObjectCodec for SerdeJsonCodec<T>
where
    T: Serialize + DeserializeOwned + PartialEq + Send + Sync + 'static,
{
    fn encode(&self, value: &ObjectValue, out: &mut Vec<u8>) -> Result<(), String> {
        let v = value.downcast_ref::<T>()
            .ok_or_else(|| format!("expected {}", std::any::type_name::<T>()))?;
        serde_json::to_writer(out, v).map_err(|e| e.to_string())
    }

    fn decode(&self, bytes: &[u8]) -> Result<ObjectValue, String> {
        serde_json::from_slice::<T>(bytes)
            .map(ObjectValue::new)
            .map_err(|e| e.to_string())
    }
}

/// tag → 能力实例
#[derive(Clone, Default)]
pub struct Capabilities {
    comparators:   BTreeMap<String, Arc<dyn FieldComparator>>,
    object_codecs: BTreeMap<String, Arc<dyn ObjectCodec>>,
}

impl Capabilities {
    pub fn new() -> Self { Self::default() }

    pub fn register_comparator(&mut self, tag: &str, cmp: Arc<dyn FieldComparator>) {
        self.comparators.insert(tag.into(), cmp);
    }

    pub fn register_object_codec(&mut self, tag: &str, codec: Arc<dyn ObjectCodec>) {
        self.object_codecs.insert(tag.into(), codec);
    }

    pub fn comparator(&self, tag: &str) -> Option<&Arc<dyn FieldComparator>> {
        self.comparators.get(tag)
    }

    pub fn object_codec(&self, tag: &str) -> Option<&Arc<dyn ObjectCodec>> {
        self.object_codecs.get(tag)
    }
}

impl std::fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capabilities")
            .field("comparators", &self.comparators.keys().collect::<Vec<_>>())
            .field("object_codecs", &self.object_codecs.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Point { x: i32, y: i32 }

    #[test]
    fn serde_json_codec_round_trip() {
        let codec = SerdeJsonCodec::<Point>::new();
        let mut buf = Vec::new();
        codec.encode(&ObjectValue::new(Point { x: 1, y: -2 }), &mut buf).unwrap();
        let back = codec.decode(&buf).unwrap();
        assert_eq!(back.downcast_ref::<Point>(), Some(&Point { x: 1, y: -2 }));
    }

    #[test]
    fn serde_json_codec_rejects_foreign_type() {
        let codec = SerdeJsonCodec::<Point>::new();
        let mut buf = Vec::new();
        assert!(codec.encode(&ObjectValue::new(5u8), &mut buf).is_err());
        assert!(codec.decode(b"not json").is_err());
    }
}
