use std::cmp::Ordering;
use std::sync::Arc;

use cogroup_engine::{
    CoGroupError, ConfigBuilder, DerivedLayout, FieldSchema, GroupComparator, ObjectValue,
    PartitionKeyDeriver, Record, RecordDeserializer, RecordSerializer, Result, RollupEngine,
    RollupHandler, SerdeJsonCodec, SortComparator, SortSpec, Value,
};
use proptest::prelude::*;

// ── 布局 ──────────────────────────────────────────────────────────────────────

#[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
struct Point { x: i32, y: i32 }

/// 两个数据源，公共字段 k / name，各自带二级排序
fn two_source_layout() -> Arc<DerivedLayout> {
    let mut b = ConfigBuilder::new();
    b.add_source(FieldSchema::parse("a", "k:int?,name:string,score:double,flag:boolean,pos:point?").unwrap())
     .add_source(FieldSchema::parse("b", "tag:bytes?,k:int?,level:enum(Level;LOW|MID|HIGH),name:string,big:long").unwrap())
     .set_group_by(&["k"])
     .set_order_by(SortSpec::parse("k desc nulls last, name asc, @source desc").unwrap())
     .set_secondary_order_by("a", SortSpec::parse("score desc").unwrap())
     .set_secondary_order_by("b", SortSpec::parse("level asc, tag asc nulls last").unwrap())
     .with_object_codec("point", Arc::new(SerdeJsonCodec::<Point>::new()));
    b.build().unwrap()
}

fn three_level_layout() -> Arc<DerivedLayout> {
    let mut b = ConfigBuilder::new();
    b.add_source(FieldSchema::parse("s", "a:int,b:int,c:int,payload:vlong").unwrap())
     .set_group_by(&["a", "b", "c"])
     .set_order_by(SortSpec::parse("a asc, b asc, c asc").unwrap())
     .set_rollup_from("a");
    b.build().unwrap()
}

// ── 策略 ──────────────────────────────────────────────────────────────────────

/// (数据源编号, 按该数据源 schema 顺序的值)
type Row = (u32, Vec<Value>);

fn key_strategy() -> BoxedStrategy<Value> {
    prop::option::of(-3i32..3).prop_map(|k| k.map_or(Value::Null, Value::Int32)).boxed()
}

fn name_strategy() -> BoxedStrategy<Value> {
    "[ab]{0,2}".prop_map(Value::Utf8).boxed()
}

fn row_strategy() -> BoxedStrategy<Row> {
    let pos = prop::option::of((any::<i32>(), any::<i32>()))
        .prop_map(|p| p.map_or(Value::Null, |(x, y)| Value::Object(ObjectValue::new(Point { x, y }))));
    let a = (key_strategy(), name_strategy(), any::<f64>(), any::<bool>(), pos)
        .prop_map(|(k, name, score, flag, pos)| (0u32, vec![k, name, Value::Float64(score), Value::Boolean(flag), pos]));
    let b = (
        prop::option::of(prop::collection::vec(any::<u8>(), 0..3)),
        key_strategy(),
        0u32..3,
        name_strategy(),
        any::<i64>(),
    )
        .prop_map(|(tag, k, level, name, big)| (1u32, vec![
            tag.map_or(Value::Null, Value::Bytes), k, Value::Enum(level), name, Value::Int64(big),
        ]));
    prop_oneof![a, b].boxed()
}

fn record(layout: &DerivedLayout, (source, values): Row) -> Record {
    Record::with_values(Arc::clone(layout.source_schema(source)), values).unwrap()
}

fn small_row_strategy() -> BoxedStrategy<Vec<Value>> {
    (0i32..3, 0i32..3, 0i32..3, any::<i64>())
        .prop_map(|(a, b, c, p)| vec![Value::Int32(a), Value::Int32(b), Value::Int32(c), Value::Int64(p)])
        .boxed()
}

// ── Rollup 检查器 ─────────────────────────────────────────────────────────────

/// 校验事件的嵌套关系，并统计 element 数
struct NestingChecker {
    start:    usize,
    full:     usize,
    open:     Vec<usize>,
    elements: usize,
    events:   usize,
}

impl NestingChecker {
    fn new(start: usize, full: usize) -> Self {
        Self { start, full, open: Vec::new(), elements: 0, events: 0 }
    }

    fn violation(msg: String) -> Result<()> { Err(CoGroupError::Handler(msg)) }
}

impl RollupHandler for NestingChecker {
    fn on_open_group(&mut self, depth: usize, _field: &str, _first: &Record) -> Result<()> {
        self.events += 1;
        let expected = self.open.last().map_or(self.start, |d| d + 1);
        if depth != expected {
            return Self::violation(format!("open({depth}) while expecting {expected}"));
        }
        self.open.push(depth);
        Ok(())
    }

    fn on_element(&mut self, _record: &Record) -> Result<()> {
        self.events += 1;
        self.elements += 1;
        if self.open.last() != Some(&self.full) {
            return Self::violation(format!("element with open depths {:?}", self.open));
        }
        Ok(())
    }

    fn on_close_group(&mut self, depth: usize, _field: &str, _last: &Record) -> Result<()> {
        self.events += 1;
        match self.open.pop() {
            Some(d) if d == depth => Ok(()),
            other => Self::violation(format!("close({depth}) but innermost open is {other:?}")),
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(512))]

    #[test]
    fn serialize_then_deserialize_is_identity(row in row_strategy()) {
        let layout = two_source_layout();
        let input = record(&layout, row);
        let bytes = RecordSerializer::new(Arc::clone(&layout)).to_bytes(&input).unwrap();
        let mut slot = Record::new(Arc::clone(layout.source_schema(0)));
        let used = RecordDeserializer::new(Arc::clone(&layout)).deserialize_into(&bytes, &mut slot).unwrap();
        prop_assert_eq!(used, bytes.len());
        prop_assert_eq!(slot, input);
    }

    #[test]
    fn object_and_byte_comparison_agree(x in row_strategy(), y in row_strategy()) {
        let layout = two_source_layout();
        let (x, y) = (record(&layout, x), record(&layout, y));
        let mut ser = RecordSerializer::new(Arc::clone(&layout));
        let (bx, by) = (ser.to_bytes(&x).unwrap(), ser.to_bytes(&y).unwrap());

        let sort = SortComparator::new(Arc::clone(&layout));
        prop_assert_eq!(sort.compare_records(&x, &y).unwrap(), sort.compare_encoded(&bx, &by).unwrap());

        let group = GroupComparator::new(Arc::clone(&layout));
        prop_assert_eq!(group.compare_records(&x, &y).unwrap(), group.compare_encoded(&bx, &by).unwrap());
    }

    #[test]
    fn sort_order_is_antisymmetric(x in row_strategy(), y in row_strategy()) {
        let layout = two_source_layout();
        let (x, y) = (record(&layout, x), record(&layout, y));
        let sort = SortComparator::new(Arc::clone(&layout));
        prop_assert_eq!(sort.compare_records(&x, &y).unwrap(), sort.compare_records(&y, &x).unwrap().reverse());
        prop_assert_eq!(sort.compare_records(&x, &x).unwrap(), Ordering::Equal);
    }

    #[test]
    fn equal_group_keys_share_a_partition(x in row_strategy(), y in row_strategy()) {
        let layout = two_source_layout();
        let (x, y) = (record(&layout, x), record(&layout, y));
        let group = GroupComparator::new(Arc::clone(&layout));
        let deriver = PartitionKeyDeriver::new(Arc::clone(&layout));
        if group.compare_records(&x, &y).unwrap() == Ordering::Equal {
            prop_assert_eq!(deriver.partition_key(&x).unwrap(), deriver.partition_key(&y).unwrap());
        }
    }

    #[test]
    fn rollup_events_are_well_nested(rows in prop::collection::vec(small_row_strategy(), 0..40)) {
        let layout = three_level_layout();
        let mut records: Vec<Record> = rows.into_iter().map(|v| record(&layout, (0, v))).collect();
        SortComparator::new(Arc::clone(&layout)).sort_records(&mut records).unwrap();

        let mut engine = RollupEngine::new(Arc::clone(&layout));
        let mut checker = NestingChecker::new(engine.start_depth(), engine.full_depth());
        engine.run(&records, &mut checker).unwrap();

        prop_assert!(checker.open.is_empty());
        prop_assert_eq!(checker.elements, records.len());
        if records.is_empty() {
            prop_assert_eq!(checker.events, 0);
        }
    }
}
