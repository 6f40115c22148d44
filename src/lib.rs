//! # cogroup-engine
//!
//! 多数据源协同分组（co-group）与二级排序的核心，挂在外部的分布式 shuffle
//! 执行器之下：执行器负责分区、排序、归并，本 crate 提供它需要插入的部分。
//!
//! ## 整体架构
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  ConfigBuilder ── add_source / set_group_by / set_order_by …  │
//! │        │ build()：校验                                          │
//! │        ▼                                                       │
//! │  DerivedLayout (Arc，只读共享)                                  │
//! │   CommonSchema · SpecificSchema[s] · GroupSchema · 指纹         │
//! │        │                                                       │
//! │   ┌────┴─────────────┬────────────────────┬────────────────┐   │
//! │   ▼                  ▼                    ▼                ▼   │
//! │ RecordSerializer  SortComparator   PartitionKeyDeriver  Rollup │
//! │ RecordDeserializer GroupComparator  (FNV-1a)            Engine │
//! │   │  对象 ⇄ 字节      │ 对象模式 = 字节模式                  │   │
//! │   └──────────────────┴─────────── 每个任务一个实例 ────────┘   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! 执行器侧：`partition` 决定记录去向，`SortComparator::compare_raw` 排序并归并
//! 已编码记录；下游的 `RollupEngine` 把排好序的流变成嵌套的 open/element/close 事件。

// ── 模型 ──────────────────────────────────────────────────────────────────────
pub mod common;
pub mod field_type;
pub mod schema;
pub mod record;
pub mod criteria;
pub mod capability;
pub mod config;
pub mod layout;

// ── 运行期 ────────────────────────────────────────────────────────────────────
pub mod encoding;
pub mod serializer;
pub mod comparator;
pub mod partition;
pub mod rollup;

pub use capability::{Capabilities, FieldComparator, ObjectCodec, SerdeJsonCodec};
pub use common::{CoGroupError, ConfigError, DecodeError, EncodeError, FieldMatching, NullOrder, Order, Result};
pub use comparator::{GroupComparator, SortComparator};
pub use config::{CoGroupConfig, ConfigBuilder};
pub use criteria::SortSpec;
pub use field_type::{FieldType, ObjectValue, Value};
pub use layout::DerivedLayout;
pub use partition::PartitionKeyDeriver;
pub use record::Record;
pub use rollup::{RollupEngine, RollupHandler};
pub use schema::{Field, FieldSchema};
pub use serializer::{RecordDeserializer, RecordSerializer};
