//! Rollup 分组：把已排序的记录流变成嵌套的分组事件
//!
//! 深度 d 对应分组字段前缀 `0..=d`，0 最粗。对 `start..=full` 的每个深度：
//! ```text
//! 首条记录       open(start..=full) → element
//! 前缀相同       element
//! 在 d0 处不同   close(full..=d0, 上一条) → open(d0..=full, 当前) → element
//! 流结束         close(full..=start, 最后一条)
//! ```
//! 记录槽位双缓冲复用，回调中拿到的记录只在本次调用内有效；需要保留时用 `Record::copy_from`。

use std::cmp::Ordering;
use std::sync::Arc;

use crate::common::{CoGroupError, Result};
use crate::comparator::GroupComparator;
use crate::layout::DerivedLayout;
use crate::record::Record;
use crate::serializer::RecordDeserializer;

/// 分组事件回调；`field` 为该深度最内层的分组字段名
pub trait RollupHandler {
    fn on_open_group(&mut self, _depth: usize, _field: &str, _first: &Record) -> Result<()> { Ok(()) }

    fn on_element(&mut self, record: &Record) -> Result<()>;

    fn on_close_group(&mut self, _depth: usize, _field: &str, _last: &Record) -> Result<()> { Ok(()) }
}

pub struct RollupEngine {
    layout:      Arc<DerivedLayout>,
    comparator:  GroupComparator,
    start_depth: usize,
    full_depth:  usize,
    current:     Record,
    previous:    Record,
    /// `previous` 中是否有上一条记录
    in_group:    bool,
    seen:        u64,
}

impl RollupEngine {
    /// 从 rollup 字段所在深度开始发出事件；未配置 rollup 时从 0 开始
    pub fn new(layout: Arc<DerivedLayout>) -> Self {
        let start = layout.rollup_start_depth();
        Self::with_start_depth(layout, start)
    }

    /// 只在最细的分组上发出事件
    pub fn plain(layout: Arc<DerivedLayout>) -> Self {
        let full = layout.group_len().saturating_sub(1);
        Self::with_start_depth(layout, full)
    }

    fn with_start_depth(layout: Arc<DerivedLayout>, start_depth: usize) -> Self {
        let full_depth = layout.group_len().saturating_sub(1);
        let slot = || Record::new(Arc::clone(layout.source_schema(0)));
        Self {
            comparator: GroupComparator::new(Arc::clone(&layout)),
            start_depth: start_depth.min(full_depth),
            full_depth,
            current:  slot(),
            previous: slot(),
            in_group: false,
            seen:     0,
            layout,
        }
    }

    pub fn start_depth(&self) -> usize { self.start_depth }
    pub fn full_depth(&self)  -> usize { self.full_depth }
    pub fn records_seen(&self) -> u64  { self.seen }

    pub fn push<H: RollupHandler + ?Sized>(&mut self, record: &Record, handler: &mut H) -> Result<()> {
        self.current.copy_from(record);
        self.advance(handler)
    }

    /// 直接解码到内部槽位，不分配新记录
    pub fn push_encoded<H: RollupHandler + ?Sized>(
        &mut self,
        bytes:        &[u8],
        deserializer: &mut RecordDeserializer,
        handler:      &mut H,
    ) -> Result<()> {
        deserializer.deserialize_into(bytes, &mut self.current)?;
        self.advance(handler)
    }

    /// 关闭所有仍打开的分组；之后引擎可以处理新的流
    pub fn finish<H: RollupHandler + ?Sized>(&mut self, handler: &mut H) -> Result<()> {
        if self.in_group {
            self.close_down_to(self.start_depth, handler)?;
            log::trace!("rollup finished after {} records", self.seen);
        }
        self.in_group = false;
        self.seen = 0;
        Ok(())
    }

    pub fn run<'r, H, I>(&mut self, records: I, handler: &mut H) -> Result<()>
    where
        H: RollupHandler + ?Sized,
        I: IntoIterator<Item = &'r Record>,
    {
        for record in records {
            self.push(record, handler)?;
        }
        self.finish(handler)
    }

    fn field_name(&self, depth: usize) -> &str { &self.layout.group_schema().field(depth).name }

    /// `current` 中已是新记录
    fn advance<H: RollupHandler + ?Sized>(&mut self, handler: &mut H) -> Result<()> {
        self.seen += 1;
        if !self.in_group {
            self.open_from(self.start_depth, handler)?;
        } else if let Some(d0) = self.first_difference()? {
            log::trace!("rollup: group change at depth {d0} (record #{})", self.seen);
            self.close_down_to(d0, handler)?;
            self.open_from(d0, handler)?;
        }
        handler.on_element(&self.current)?;
        std::mem::swap(&mut self.current, &mut self.previous);
        self.in_group = true;
        Ok(())
    }

    /// 最浅的前缀不同的深度；新记录排在上一条之前时报错
    fn first_difference(&self) -> Result<Option<usize>> {
        let full = self.comparator.compare_records(&self.previous, &self.current)?;
        if full == Ordering::Equal {
            return Ok(None);
        }
        if full == Ordering::Greater {
            return Err(CoGroupError::UnsortedInput(self.seen));
        }
        for d in self.start_depth..self.full_depth {
            if self.comparator.compare_records_at_depth(&self.previous, &self.current, d)? != Ordering::Equal {
                return Ok(Some(d));
            }
        }
        Ok(Some(self.full_depth))
    }

    fn open_from<H: RollupHandler + ?Sized>(&self, depth: usize, handler: &mut H) -> Result<()> {
        for d in depth..=self.full_depth {
            handler.on_open_group(d, self.field_name(d), &self.current)?;
        }
        Ok(())
    }

    fn close_down_to<H: RollupHandler + ?Sized>(&self, depth: usize, handler: &mut H) -> Result<()> {
        for d in (depth..=self.full_depth).rev() {
            handler.on_close_group(d, self.field_name(d), &self.previous)?;
        }
        Ok(())
    }
}
