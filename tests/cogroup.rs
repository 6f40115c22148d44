use std::sync::Arc;

use cogroup_engine::{
    ConfigBuilder, FieldSchema, PartitionKeyDeriver, Record, RecordDeserializer, RecordSerializer,
    Result, RollupEngine, RollupHandler, SortComparator, SortSpec, Value,
};

/// 每个分组收集 (数据源名, 主键) 序列
#[derive(Default)]
struct Groups {
    current: Vec<String>,
    done:    Vec<(String, Vec<String>)>,
}

impl RollupHandler for Groups {
    fn on_open_group(&mut self, _depth: usize, _field: &str, _first: &Record) -> Result<()> {
        self.current.clear();
        Ok(())
    }

    fn on_element(&mut self, record: &Record) -> Result<()> {
        let id = record.get_by_name("id").map(ToString::to_string).unwrap_or_default();
        self.current.push(format!("{}:{id}", record.schema().name()));
        Ok(())
    }

    fn on_close_group(&mut self, _depth: usize, _field: &str, last: &Record) -> Result<()> {
        let key = last.get_by_name("country").map(ToString::to_string).unwrap_or_default();
        self.done.push((key, std::mem::take(&mut self.current)));
        Ok(())
    }
}

#[test]
fn shuffle_then_rollup_cogroups_sources() {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut b = ConfigBuilder::new();
    b.add_source(FieldSchema::parse("users", "id:int,country:string").unwrap())
     .add_source(FieldSchema::parse("orders", "country:string,id:int,amount:double").unwrap())
     .set_group_by(&["country"])
     .set_order_by(SortSpec::parse("country asc, @source asc").unwrap())
     .set_secondary_order_by("orders", SortSpec::parse("amount desc").unwrap());
    let layout = b.build().unwrap();

    let users  = layout.source_schema(0);
    let orders = layout.source_schema(1);
    let input = vec![
        Record::with_values(Arc::clone(orders), vec![Value::from("US"), Value::Int32(10), Value::Float64(5.0)]),
        Record::with_values(Arc::clone(users),  vec![Value::Int32(1), Value::from("US")]),
        Record::with_values(Arc::clone(orders), vec![Value::from("ES"), Value::Int32(11), Value::Float64(1.0)]),
        Record::with_values(Arc::clone(orders), vec![Value::from("US"), Value::Int32(12), Value::Float64(50.0)]),
        Record::with_values(Arc::clone(users),  vec![Value::Int32(2), Value::from("ES")]),
    ]
    .into_iter()
    .map(Option::unwrap)
    .collect::<Vec<_>>();

    // 两个分区，每个分区内按字节排序
    let deriver = PartitionKeyDeriver::new(Arc::clone(&layout));
    let mut ser = RecordSerializer::new(Arc::clone(&layout));
    let mut partitions: Vec<Vec<Vec<u8>>> = vec![Vec::new(), Vec::new()];
    for r in &input {
        let p = deriver.partition(r, 2).unwrap() as usize;
        partitions[p].push(ser.to_bytes(r).unwrap());
    }
    let cmp = SortComparator::new(Arc::clone(&layout));
    let mut groups = Groups::default();
    let mut de = RecordDeserializer::new(Arc::clone(&layout));
    for part in &mut partitions {
        part.sort_by(|a, b| cmp.compare_encoded(a, b).unwrap());
        let mut engine = RollupEngine::new(Arc::clone(&layout));
        for bytes in part.iter() {
            engine.push_encoded(bytes, &mut de, &mut groups).unwrap();
        }
        engine.finish(&mut groups).unwrap();
    }

    groups.done.sort();
    assert_eq!(groups.done, [
        ("ES".to_string(), vec!["users:2".to_string(), "orders:11".to_string()]),
        ("US".to_string(), vec!["users:1".to_string(), "orders:12".to_string(), "orders:10".to_string()]),
    ]);
}

#[test]
fn config_json_rebuilds_identical_layout() {
    let mut b = ConfigBuilder::new();
    b.add_source(FieldSchema::parse("users", "id:int,country:string?").unwrap())
     .add_source(FieldSchema::parse("orders", "country:string,amount:double").unwrap())
     .set_group_by(&["country"])
     .set_partition_fields(&["country"]);
    let layout = b.build().unwrap();

    let json = layout.config().to_json().unwrap();
    let parsed = cogroup_engine::CoGroupConfig::from_json(&json).unwrap();
    assert_eq!(parsed.to_json().unwrap(), json);
    let rebuilt = ConfigBuilder::from_config(parsed, layout.capabilities().clone()).build().unwrap();
    assert_eq!(rebuilt.fingerprint(), layout.fingerprint());
}
