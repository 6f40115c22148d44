//! 排序规则
//!
//! 文本语法（逗号分隔）：
//! ```text
//! field [asc|desc] [nulls first|nulls last] [using <comparator-tag>]
//! @source [asc|desc]
//! ```
//! `@source` 是数据源顺序标记：比较记录所属的数据源编号而不是某个字段。

use serde::{Deserialize, Serialize};

use crate::common::{ConfigError, NullOrder, Order};

/// 数据源顺序标记的文本形式
pub const SOURCE_ORDER_TOKEN: &str = "@source";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SortElement {
    Field {
        field:      String,
        order:      Order,
        #[serde(default)]
        null_order: NullOrder,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        comparator: Option<String>,
    },
    SourceOrder { order: Order },
}

impl SortElement {
    pub fn field(name: &str, order: Order) -> Self {
        Self::Field { field: name.into(), order, null_order: NullOrder::First, comparator: None }
    }

    pub fn field_name(&self) -> Option<&str> {
        match self {
            Self::Field { field, .. } => Some(field),
            Self::SourceOrder { .. } => None,
        }
    }

    pub fn order(&self) -> Order {
        match self {
            Self::Field { order, .. } | Self::SourceOrder { order } => *order,
        }
    }

    pub fn is_source_order(&self) -> bool { matches!(self, Self::SourceOrder { .. }) }

    fn parse(item: &str) -> Result<Self, ConfigError> {
        let err = |msg: &str| ConfigError::InvalidSortSpec(format!("{msg} in '{item}'"));
        let mut tokens = item.split_whitespace();
        let name = tokens.next().ok_or_else(|| err("empty element"))?;

        let mut order      = Order::Asc;
        let mut null_order = NullOrder::First;
        let mut comparator = None;
        let mut seen_order = false;

        while let Some(tok) = tokens.next() {
            match tok.to_ascii_lowercase().as_str() {
                "asc" | "desc" if !seen_order => {
                    order = if tok.eq_ignore_ascii_case("asc") { Order::Asc } else { Order::Desc };
                    seen_order = true;
                }
                "nulls" => {
                    null_order = match tokens.next().map(str::to_ascii_lowercase).as_deref() {
                        Some("first") => NullOrder::First,
                        Some("last")  => NullOrder::Last,
                        _ => return Err(err("expected 'first' or 'last' after 'nulls'")),
                    };
                }
                "using" => {
                    comparator = Some(tokens.next().ok_or_else(|| err("missing comparator tag"))?.to_string());
                }
                _ => return Err(err(&format!("unexpected token '{tok}'"))),
            }
        }

        if name == SOURCE_ORDER_TOKEN {
            if comparator.is_some() || null_order != NullOrder::First {
                return Err(err("source order takes only a direction"));
            }
            return Ok(Self::SourceOrder { order });
        }
        Ok(Self::Field { field: name.into(), order, null_order, comparator })
    }
}

impl std::fmt::Display for SortElement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SourceOrder { order } => write!(f, "{SOURCE_ORDER_TOKEN} {order}"),
            Self::Field { field, order, null_order, comparator } => {
                write!(f, "{field} {order}")?;
                if *null_order == NullOrder::Last { write!(f, " nulls last")?; }
                if let Some(tag) = comparator { write!(f, " using {tag}")?; }
                Ok(())
            }
        }
    }
}

// ── SortSpec ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SortSpec(Vec<SortElement>);

impl SortSpec {
    pub fn new() -> Self { Self::default() }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        text.split(',').map(SortElement::parse).collect::<Result<Vec<_>, _>>().map(Self)
    }

    pub fn add(mut self, field: &str, order: Order) -> Self {
        self.0.push(SortElement::field(field, order)); self
    }

    pub fn add_with(
        mut self,
        field:      &str,
        order:      Order,
        null_order: NullOrder,
        comparator: Option<&str>,
    ) -> Self {
        self.0.push(SortElement::Field {
            field: field.into(), order, null_order,
            comparator: comparator.map(Into::into),
        });
        self
    }

    pub fn add_source_order(mut self, order: Order) -> Self {
        self.0.push(SortElement::SourceOrder { order }); self
    }

    pub(crate) fn push(&mut self, element: SortElement) { self.0.push(element); }

    pub fn elements(&self) -> &[SortElement] { &self.0 }
    pub fn len(&self)      -> usize          { self.0.len() }
    pub fn is_empty(&self) -> bool           { self.0.is_empty() }

    /// 按顺序列出字段名（不含数据源顺序标记）
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.0.iter().filter_map(SortElement::field_name)
    }

    pub fn source_order_position(&self) -> Option<usize> {
        self.0.iter().position(SortElement::is_source_order)
    }
}

impl std::fmt::Display for SortSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, e) in self.0.iter().enumerate() {
            if i > 0 { write!(f, ", ")?; }
            write!(f, "{e}")?;
        }
        Ok(())
    }
}
