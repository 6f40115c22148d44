//! 配置模型：数据源、分组、排序、分区与 rollup
//!
//! `ConfigBuilder` 收集设置，`build()` 一次性校验并产出不可变的 `DerivedLayout`。
//! 校验失败时 builder 被消费，不会留下半成品。校验通过的配置以 `CoGroupConfig`
//! 保存，可序列化为 JSON 并原样解析回来。

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::capability::{Capabilities, FieldComparator, ObjectCodec};
use crate::common::{ConfigError, FieldMatching, Order, Result};
use crate::criteria::{SortElement, SortSpec};
use crate::field_type::FieldType;
use crate::layout::DerivedLayout;
use crate::schema::FieldSchema;

// ── 已校验的配置 ──────────────────────────────────────────────────────────────

/// 已校验、可序列化的配置快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoGroupConfig {
    pub sources:            Vec<FieldSchema>,
    pub group_by:           Vec<String>,
    /// 生效的公共排序（未显式设置时为分组字段升序 + 多源时的数据源顺序）
    pub order_by:           SortSpec,
    /// 排序是否由调用方显式设置
    pub explicit_order_by:  bool,
    #[serde(default)]
    pub secondary_order_by: BTreeMap<String, SortSpec>,
    #[serde(default)]
    pub partition_fields:   Option<Vec<String>>,
    #[serde(default)]
    pub rollup_from:        Option<String>,
    #[serde(default)]
    pub field_matching:     FieldMatching,
}

impl CoGroupConfig {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// 只做结构解析；语义校验在 `ConfigBuilder::from_config(..).build()` 中完成
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

// ── Builder ───────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct ConfigBuilder {
    sources:          Vec<FieldSchema>,
    group_by:         Option<Vec<String>>,
    order_by:         Option<SortSpec>,
    secondary:        Vec<(String, SortSpec)>,
    partition_fields: Option<Vec<String>>,
    rollup_from:      Option<String>,
    field_matching:   FieldMatching,
    capabilities:     Capabilities,
}

impl ConfigBuilder {
    pub fn new() -> Self { Self::default() }

    /// 从已保存的配置恢复；自定义比较器和 Object 编解码器需要重新注入
    pub fn from_config(config: CoGroupConfig, capabilities: Capabilities) -> Self {
        let mut b = Self {
            sources: config.sources,
            group_by: Some(config.group_by),
            order_by: None,
            secondary: config.secondary_order_by.into_iter().collect(),
            partition_fields: config.partition_fields,
            rollup_from: config.rollup_from,
            field_matching: config.field_matching,
            capabilities,
        };
        if config.explicit_order_by {
            b.order_by = Some(config.order_by);
        }
        b
    }

    /// 数据源编号按注册顺序分配，数据源名即 schema 名
    pub fn add_source(&mut self, schema: FieldSchema) -> &mut Self {
        self.sources.push(schema); self
    }

    pub fn set_group_by(&mut self, fields: &[&str]) -> &mut Self {
        self.group_by = Some(fields.iter().map(|f| (*f).to_string()).collect()); self
    }

    pub fn set_order_by(&mut self, spec: SortSpec) -> &mut Self {
        self.order_by = Some(spec); self
    }

    pub fn set_secondary_order_by(&mut self, source: &str, spec: SortSpec) -> &mut Self {
        self.secondary.push((source.into(), spec)); self
    }

    pub fn set_partition_fields(&mut self, fields: &[&str]) -> &mut Self {
        self.partition_fields = Some(fields.iter().map(|f| (*f).to_string()).collect()); self
    }

    pub fn set_rollup_from(&mut self, field: &str) -> &mut Self {
        self.rollup_from = Some(field.into()); self
    }

    pub fn set_field_matching(&mut self, matching: FieldMatching) -> &mut Self {
        self.field_matching = matching; self
    }

    pub fn with_comparator(&mut self, tag: &str, cmp: Arc<dyn FieldComparator>) -> &mut Self {
        self.capabilities.register_comparator(tag, cmp); self
    }

    pub fn with_object_codec(&mut self, tag: &str, codec: Arc<dyn ObjectCodec>) -> &mut Self {
        self.capabilities.register_object_codec(tag, codec); self
    }

    /// 校验并构建布局
    pub fn build(&mut self) -> std::result::Result<Arc<DerivedLayout>, ConfigError> {
        let this = std::mem::take(self);
        let capabilities = this.capabilities.clone();
        let config = this.validate()?;
        DerivedLayout::new(config, capabilities).map(Arc::new)
    }

    fn validate(self) -> std::result::Result<CoGroupConfig, ConfigError> {
        let sources = self.sources;
        if sources.is_empty() {
            return Err(ConfigError::NoSources);
        }
        let mut names = HashSet::new();
        for s in &sources {
            if !names.insert(s.name()) {
                return Err(ConfigError::DuplicateSource(s.name().into()));
            }
            for f in s.fields() {
                if let FieldType::Object { codec } = &f.field_type {
                    if self.capabilities.object_codec(codec).is_none() {
                        return Err(ConfigError::UnknownObjectCodec(codec.clone()));
                    }
                }
            }
        }
        let multi = sources.len() > 1;

        // 分组字段
        let group_by = self.group_by.filter(|g| !g.is_empty()).ok_or(ConfigError::GroupByNotSet)?;
        check_unique(group_by.iter().map(String::as_str))?;
        for f in &group_by {
            check_common_field(&sources, f)?;
        }

        // 公共排序
        let explicit_order_by = self.order_by.is_some();
        let mut order_by = match self.order_by {
            Some(spec) => {
                check_sort_elements(&spec, &self.capabilities)?;
                match spec.source_order_position() {
                    Some(_) if !multi => return Err(ConfigError::SourceOrderWithSingleSource),
                    Some(pos) if pos + 1 != spec.len() => return Err(ConfigError::SourceOrderNotLast),
                    _ => {}
                }
                for f in spec.field_names() {
                    check_common_field(&sources, f)?;
                }
                let sort_fields: Vec<&str> = spec.field_names().collect();
                let is_prefix = group_by.len() <= sort_fields.len()
                    && group_by.iter().zip(&sort_fields).all(|(g, s)| g == s);
                if !is_prefix {
                    return Err(ConfigError::GroupByNotPrefixOfSort(spec.to_string()));
                }
                spec
            }
            None => group_by.iter().fold(SortSpec::new(), |s, f| s.add(f, Order::Asc)),
        };
        let has_source_order = order_by.source_order_position().is_some();

        // 各数据源的二级排序
        let mut secondary_order_by = BTreeMap::new();
        for (source, spec) in self.secondary {
            let schema = sources.iter().find(|s| s.name() == source)
                .ok_or_else(|| ConfigError::UnknownSource(source.clone()))?;
            if !has_source_order {
                return Err(ConfigError::SecondarySortWithoutSourceOrder(source));
            }
            if spec.source_order_position().is_some() {
                return Err(ConfigError::SourceOrderInSecondarySort);
            }
            check_sort_elements(&spec, &self.capabilities)?;
            for f in spec.field_names() {
                if !schema.contains(f) {
                    return Err(ConfigError::FieldNotFound { field: f.into(), source_name: source.clone() });
                }
                if order_by.field_names().any(|c| c == f) {
                    return Err(ConfigError::SecondarySortDuplicatesCommon { source_name: source.clone(), field: f.into() });
                }
            }
            if !spec.is_empty() {
                secondary_order_by.insert(source, spec);
            }
        }

        if multi && !has_source_order {
            order_by.push(SortElement::SourceOrder { order: Order::Asc });
        }

        // rollup
        if let Some(field) = &self.rollup_from {
            if !explicit_order_by {
                return Err(ConfigError::RollupRequiresExplicitSort);
            }
            if !group_by.contains(field) {
                return Err(ConfigError::RollupFieldNotInGroupBy(field.clone()));
            }
        }

        // 自定义分区字段
        if let Some(fields) = &self.partition_fields {
            check_unique(fields.iter().map(String::as_str))?;
            if let Some(f) = fields.iter().find(|f| !group_by.contains(f)) {
                return Err(ConfigError::PartitionFieldNotInGroupBy(f.clone()));
            }
        }

        Ok(CoGroupConfig {
            sources, group_by, order_by, explicit_order_by, secondary_order_by,
            partition_fields: self.partition_fields,
            rollup_from:      self.rollup_from,
            field_matching:   self.field_matching,
        })
    }
}

/// 字段必须存在于每个数据源且类型一致（以第一个数据源为准）
pub(crate) fn check_common_field(sources: &[FieldSchema], name: &str) -> std::result::Result<(), ConfigError> {
    let mut expected: Option<&FieldType> = None;
    for s in sources {
        let f = s.field_by_name(name).ok_or_else(|| ConfigError::FieldNotFound {
            field: name.into(), source_name: s.name().into(),
        })?;
        match expected {
            None => expected = Some(&f.field_type),
            Some(ty) if *ty != f.field_type => {
                return Err(ConfigError::FieldTypeMismatch {
                    field:       name.into(),
                    source_name: s.name().into(),
                    expected:    ty.to_string(),
                    actual:      f.field_type.to_string(),
                });
            }
            Some(_) => {}
        }
    }
    Ok(())
}

fn check_unique<'a>(fields: impl Iterator<Item = &'a str>) -> std::result::Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for f in fields {
        if !seen.insert(f) {
            return Err(ConfigError::DuplicateReference(f.into()));
        }
    }
    Ok(())
}

fn check_sort_elements(spec: &SortSpec, caps: &Capabilities) -> std::result::Result<(), ConfigError> {
    if spec.is_empty() {
        return Err(ConfigError::InvalidSortSpec("empty sort".into()));
    }
    check_unique(spec.field_names())?;
    if spec.elements().iter().filter(|e| e.is_source_order()).count() > 1 {
        return Err(ConfigError::DuplicateSourceOrder);
    }
    for e in spec.elements() {
        if let SortElement::Field { comparator: Some(tag), .. } = e {
            if caps.comparator(tag).is_none() {
                return Err(ConfigError::UnknownComparator(tag.clone()));
            }
        }
    }
    Ok(())
}
