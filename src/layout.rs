//! 派生布局：由数据源 schema 与已校验配置一次性计算，之后只读共享
//!
//! ```text
//! CommonSchema        公共排序字段（数据源顺序标记之前）；单数据源时追加其余字段
//! SpecificSchema[s]   数据源 s 的其余字段：先二级排序字段，再按源顺序（仅多数据源）
//! GroupSchema         CommonSchema 的前 |group_by| 个字段
//! *_to_source[s]      各 schema 位置 → 数据源 s 的字段位置
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use crate::capability::{Capabilities, FieldComparator, ObjectCodec};
use crate::common::{ConfigError, EncodeError, FieldMatching, Fingerprint, NullOrder, Order, SourceId};
use crate::config::{check_common_field, CoGroupConfig};
use crate::criteria::{SortElement, SortSpec};
use crate::field_type::{FieldType, Value};
use crate::record::Record;
use crate::schema::{Field, FieldSchema};

/// 每个字段解析后的 Object 编解码器（非 Object 字段为 None）
pub type FieldCodecs = Vec<Option<Arc<dyn ObjectCodec>>>;

static NULL: Value = Value::Null;

/// 解析后的排序字段，下标与所在 schema 的字段位置一致
#[derive(Clone)]
pub struct SortField {
    pub order:      Order,
    pub null_order: NullOrder,
    pub comparator: Option<Arc<dyn FieldComparator>>,
}

impl std::fmt::Debug for SortField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SortField")
            .field("order", &self.order)
            .field("null_order", &self.null_order)
            .field("custom", &self.comparator.is_some())
            .finish()
    }
}

pub struct DerivedLayout {
    config:             CoGroupConfig,
    capabilities:       Capabilities,
    sources:            Vec<Arc<FieldSchema>>,
    source_ids:         HashMap<String, SourceId>,
    common_schema:      Arc<FieldSchema>,
    specific_schemas:   Vec<Arc<FieldSchema>>,
    group_schema:       Arc<FieldSchema>,
    common_to_source:   Vec<Vec<usize>>,
    group_to_source:    Vec<Vec<usize>>,
    specific_to_source: Vec<Vec<usize>>,
    common_codecs:      FieldCodecs,
    specific_codecs:    Vec<FieldCodecs>,
    common_sort:        Vec<SortField>,
    source_order:       Option<Order>,
    secondary_sort:     Vec<Vec<SortField>>,
    partition_fields:   Vec<String>,
    partition_to_source: Vec<Vec<usize>>,
    rollup_start_depth: usize,
    fingerprint:        Fingerprint,
}

impl DerivedLayout {
    pub fn new(config: CoGroupConfig, capabilities: Capabilities) -> Result<Self, ConfigError> {
        let sources: Vec<Arc<FieldSchema>> = config.sources.iter().cloned().map(Arc::new).collect();
        let multi = sources.len() > 1;
        let source_ids = sources.iter().enumerate()
            .map(|(i, s)| (s.name().to_string(), i as SourceId))
            .collect();

        // CommonSchema
        let mut common_fields = Vec::new();
        for name in config.order_by.field_names() {
            check_common_field(&config.sources, name)?;
            let nullable = sources.iter().any(|s| s.field_by_name(name).is_some_and(|f| f.nullable));
            let proto = sources[0].field_by_name(name)
                .ok_or_else(|| ConfigError::FieldNotFound { field: name.into(), source_name: sources[0].name().into() })?;
            common_fields.push(Field { nullable, ..proto.clone() });
        }
        let common_sort_len = common_fields.len();
        if !multi {
            for f in sources[0].fields() {
                if !common_fields.iter().any(|c| c.name == f.name) {
                    common_fields.push(f.clone());
                }
            }
        }
        let common_schema = Arc::new(FieldSchema::new("common", common_fields)?);

        // SpecificSchema
        let mut specific_schemas = Vec::with_capacity(sources.len());
        for s in &sources {
            let mut fields: Vec<Field> = Vec::new();
            if multi {
                if let Some(spec) = config.secondary_order_by.get(s.name()) {
                    for name in spec.field_names() {
                        let f = s.field_by_name(name).ok_or_else(|| ConfigError::FieldNotFound {
                            field: name.into(), source_name: s.name().into(),
                        })?;
                        fields.push(f.clone());
                    }
                }
                for f in s.fields() {
                    if !common_schema.contains(&f.name) && !fields.iter().any(|x| x.name == f.name) {
                        fields.push(f.clone());
                    }
                }
            }
            specific_schemas.push(Arc::new(FieldSchema::new(s.name(), fields)?));
        }

        let group_len = config.group_by.len();
        let group_schema = Arc::new(FieldSchema::new("group", common_schema.fields()[..group_len].to_vec())?);

        let translate = |schema: &FieldSchema, source: &FieldSchema| -> Result<Vec<usize>, ConfigError> {
            // 由上面的构造保证每个字段都能找到，这里是权威检查
            schema.fields().iter()
                .map(|f| source.index_of(&f.name).ok_or_else(|| ConfigError::FieldNotFound {
                    field: f.name.clone(), source_name: source.name().into(),
                }))
                .collect()
        };
        let mut common_to_source   = Vec::with_capacity(sources.len());
        let mut group_to_source    = Vec::with_capacity(sources.len());
        let mut specific_to_source = Vec::with_capacity(sources.len());
        for (s, specific) in sources.iter().zip(&specific_schemas) {
            common_to_source.push(translate(&common_schema, s)?);
            group_to_source.push(translate(&group_schema, s)?);
            specific_to_source.push(translate(specific, s)?);
        }

        let common_codecs = resolve_codecs(&common_schema, &capabilities)?;
        let specific_codecs = specific_schemas.iter()
            .map(|s| resolve_codecs(s, &capabilities))
            .collect::<Result<Vec<_>, _>>()?;

        // 排序计划
        let common_sort = resolve_sort(&config.order_by, &capabilities)?;
        debug_assert_eq!(common_sort.len(), common_sort_len);
        let source_order = config.order_by.elements().iter().find_map(|e| match e {
            SortElement::SourceOrder { order } => Some(*order),
            SortElement::Field { .. } => None,
        });
        let secondary_sort = sources.iter()
            .map(|s| match config.secondary_order_by.get(s.name()) {
                Some(spec) => resolve_sort(spec, &capabilities),
                None       => Ok(Vec::new()),
            })
            .collect::<Result<Vec<_>, _>>()?;

        // 分区字段与 rollup 起始深度
        let rollup_start_depth = config.rollup_from.as_ref()
            .and_then(|r| config.group_by.iter().position(|g| g == r))
            .unwrap_or(0);
        let partition_fields = match (&config.partition_fields, &config.rollup_from) {
            (Some(fields), _) => fields.clone(),
            (None, Some(_))   => config.group_by[..=rollup_start_depth].to_vec(),
            (None, None)      => config.group_by.clone(),
        };
        let partition_to_source = sources.iter()
            .map(|s| partition_fields.iter()
                .map(|f| s.index_of(f).ok_or_else(|| ConfigError::FieldNotFound {
                    field: f.clone(), source_name: s.name().into(),
                }))
                .collect::<Result<Vec<_>, _>>())
            .collect::<Result<Vec<_>, _>>()?;
        for f in &partition_fields {
            if common_schema.field_by_name(f).is_some_and(|x| x.nullable) {
                log::warn!("partition field '{f}' is nullable; all NULL keys land in one partition");
            }
        }

        let fingerprint = crc32fast::hash(
            canonical_text(&config, &common_schema, &specific_schemas).as_bytes(),
        );

        log::debug!(
            "derived layout: sources={} common=[{}] group=[{}] partition={:?} rollup_depth={} fingerprint={:#010x}",
            sources.len(), common_schema, group_schema, partition_fields, rollup_start_depth, fingerprint,
        );
        for specific in specific_schemas.iter().filter(|s| !s.is_empty()) {
            log::debug!("specific schema '{}': [{}]", specific.name(), specific);
        }

        Ok(Self {
            config, capabilities, sources, source_ids,
            common_schema, specific_schemas, group_schema,
            common_to_source, group_to_source, specific_to_source,
            common_codecs, specific_codecs,
            common_sort, source_order, secondary_sort,
            partition_fields, partition_to_source,
            rollup_start_depth, fingerprint,
        })
    }

    // ── 访问器 ────────────────────────────────────────────────────────────────

    pub fn config(&self)       -> &CoGroupConfig  { &self.config }
    pub fn capabilities(&self) -> &Capabilities   { &self.capabilities }
    pub fn num_sources(&self)  -> usize           { self.sources.len() }
    pub fn is_multi_source(&self) -> bool         { self.sources.len() > 1 }
    pub fn fingerprint(&self)  -> Fingerprint     { self.fingerprint }

    pub fn source_schema(&self, id: SourceId) -> &Arc<FieldSchema> { &self.sources[id as usize] }
    pub fn source_id(&self, name: &str) -> Option<SourceId> { self.source_ids.get(name).copied() }

    pub fn common_schema(&self) -> &Arc<FieldSchema> { &self.common_schema }
    pub fn group_schema(&self)  -> &Arc<FieldSchema> { &self.group_schema }
    pub fn specific_schema(&self, id: SourceId) -> &Arc<FieldSchema> { &self.specific_schemas[id as usize] }

    pub fn common_to_source(&self, id: SourceId)   -> &[usize] { &self.common_to_source[id as usize] }
    pub fn group_to_source(&self, id: SourceId)    -> &[usize] { &self.group_to_source[id as usize] }
    pub fn specific_to_source(&self, id: SourceId) -> &[usize] { &self.specific_to_source[id as usize] }

    pub fn common_codecs(&self) -> &FieldCodecs { &self.common_codecs }
    pub fn specific_codecs(&self, id: SourceId) -> &FieldCodecs { &self.specific_codecs[id as usize] }

    /// 公共排序字段，对应 CommonSchema 的前缀
    pub fn common_sort(&self) -> &[SortField] { &self.common_sort }
    pub fn source_order(&self) -> Option<Order> { self.source_order }
    /// 数据源的二级排序字段，对应其 SpecificSchema 的前缀
    pub fn secondary_sort(&self, id: SourceId) -> &[SortField] { &self.secondary_sort[id as usize] }

    pub fn group_len(&self) -> usize { self.group_schema.len() }
    pub fn rollup_start_depth(&self) -> usize { self.rollup_start_depth }

    pub fn partition_fields(&self) -> &[String] { &self.partition_fields }
    pub fn partition_to_source(&self, id: SourceId) -> &[usize] { &self.partition_to_source[id as usize] }

    // ── 记录绑定 ──────────────────────────────────────────────────────────────

    /// 确定记录所属的数据源；严格模式下记录 schema 必须与注册的一致
    pub(crate) fn bind<'a>(&'a self, record: &'a Record) -> Result<BoundRecord<'a>, EncodeError> {
        let name = record.schema().name();
        let id = self.source_id(name).ok_or_else(|| EncodeError::UnknownSource(name.into()))?;
        let source_schema = &self.sources[id as usize];
        let exact = Arc::ptr_eq(record.schema(), source_schema) || **record.schema() == **source_schema;
        if !exact && self.config.field_matching == FieldMatching::Strict {
            return Err(EncodeError::SchemaMismatch(name.into()));
        }
        Ok(BoundRecord { source: id, record, source_schema, exact })
    }

    /// 用 GroupSchema 构造记录的分组键
    pub fn group_key(&self, record: &Record) -> Result<Record, EncodeError> {
        let bound = self.bind(record)?;
        let mut key = Record::new(Arc::clone(&self.group_schema));
        for (i, &pos) in self.group_to_source(bound.source).iter().enumerate() {
            key.set(i, bound.value(pos).clone());
        }
        Ok(key)
    }
}

impl std::fmt::Debug for DerivedLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivedLayout")
            .field("common", &self.common_schema.to_string())
            .field("group", &self.group_schema.to_string())
            .field("specific", &self.specific_schemas.iter().map(ToString::to_string).collect::<Vec<_>>())
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

/// 绑定到数据源后的记录视图；宽松模式下按字段名取值，缺失字段视为 NULL
pub(crate) struct BoundRecord<'a> {
    pub source:    SourceId,
    record:        &'a Record,
    source_schema: &'a FieldSchema,
    exact:         bool,
}

impl<'a> BoundRecord<'a> {
    pub fn value(&self, source_pos: usize) -> &'a Value {
        if self.exact {
            return self.record.get(source_pos);
        }
        self.record.get_by_name(&self.source_schema.field(source_pos).name).unwrap_or(&NULL)
    }

    /// 记录中有、但数据源 schema 中没有的字段名
    pub fn extra_fields(&self) -> impl Iterator<Item = &'a str> + '_ {
        self.record.schema().fields().iter()
            .map(|f| f.name.as_str())
            .filter(|n| !self.source_schema.contains(n))
    }

    pub fn is_exact(&self) -> bool { self.exact }
}

/// 为 schema 的每个字段解析 Object 编解码器
pub fn resolve_codecs(schema: &FieldSchema, caps: &Capabilities) -> Result<FieldCodecs, ConfigError> {
    schema.fields().iter()
        .map(|f| match &f.field_type {
            FieldType::Object { codec } => caps.object_codec(codec)
                .cloned()
                .map(Some)
                .ok_or_else(|| ConfigError::UnknownObjectCodec(codec.clone())),
            _ => Ok(None),
        })
        .collect()
}

fn resolve_sort(spec: &SortSpec, caps: &Capabilities) -> Result<Vec<SortField>, ConfigError> {
    spec.elements().iter()
        .filter_map(|e| match e {
            SortElement::Field { order, null_order, comparator, .. } => Some((order, null_order, comparator)),
            SortElement::SourceOrder { .. } => None,
        })
        .map(|(order, null_order, comparator)| -> Result<SortField, ConfigError> {
            let comparator = match comparator {
                Some(tag) => Some(Arc::clone(
                    caps.comparator(tag).ok_or_else(|| ConfigError::UnknownComparator(tag.clone()))?,
                )),
                None => None,
            };
            Ok(SortField { order: *order, null_order: *null_order, comparator })
        })
        .collect()
}

/// 决定线上格式与排序语义的规范文本，用于计算指纹
fn canonical_text(config: &CoGroupConfig, common: &FieldSchema, specific: &[Arc<FieldSchema>]) -> String {
    let mut text = format!("common[{common}]");
    for (i, s) in specific.iter().enumerate() {
        text.push_str(&format!(";{i}:{}[{s}]", s.name()));
    }
    text.push_str(&format!(";sort[{}]", config.order_by));
    for (source, spec) in &config.secondary_order_by {
        text.push_str(&format!(";{source}[{spec}]"));
    }
    text
}
