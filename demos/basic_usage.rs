//! # cogroup-engine 完整使用案例
//!
//! 1. 定义两个数据源并构建布局
//! 2. 序列化 / 反序列化记录
//! 3. 计算分区
//! 4. 按字节排序（模拟 shuffle）
//! 5. Rollup 分组回调
//! 6. 配置 JSON 往返
//!
//! 运行：`RUST_LOG=debug cargo run --example basic_usage`

use std::sync::Arc;

use cogroup_engine::{
    ConfigBuilder, CoGroupConfig, FieldSchema, PartitionKeyDeriver, Record, RecordDeserializer,
    RecordSerializer, Result, RollupEngine, RollupHandler, SortComparator, SortSpec, Value,
};

/// 打印缩进后的分组事件
struct Printer;

impl RollupHandler for Printer {
    fn on_open_group(&mut self, depth: usize, field: &str, first: &Record) -> Result<()> {
        println!("    {}open  [{depth}] {field} = {}", "  ".repeat(depth), first.get_by_name(field).unwrap_or(&Value::Null));
        Ok(())
    }

    fn on_element(&mut self, record: &Record) -> Result<()> {
        println!("    {}· {record}", "  ".repeat(3));
        Ok(())
    }

    fn on_close_group(&mut self, depth: usize, field: &str, _last: &Record) -> Result<()> {
        println!("    {}close [{depth}] {field}", "  ".repeat(depth));
        Ok(())
    }
}

fn main() -> Result<()> {
    env_logger::init();

    println!("═══════════════════════════════════════════════════════════");
    println!("   cogroup-engine 演示                                     ");
    println!("═══════════════════════════════════════════════════════════\n");

    // =========================================================================
    // 1. 数据源与布局
    // =========================================================================
    println!("【1】定义数据源 users / orders，按 country 协同分组 ...");
    let mut builder = ConfigBuilder::new();
    builder
        .add_source(FieldSchema::parse("users", "name:string,country:string,age:int?")?)
        .add_source(FieldSchema::parse("orders", "order_id:long,country:string,amount:double")?)
        .set_group_by(&["country"])
        .set_order_by(SortSpec::parse("country asc, @source asc")?)
        .set_secondary_order_by("orders", SortSpec::parse("amount desc")?);
    let layout = builder.build()?;
    println!("    common   = [{}]", layout.common_schema());
    println!("    users    = [{}]", layout.specific_schema(0));
    println!("    orders   = [{}]", layout.specific_schema(1));
    println!("    指纹     = {:#010x}\n", layout.fingerprint());

    let users  = Arc::clone(layout.source_schema(0));
    let orders = Arc::clone(layout.source_schema(1));
    let user = |name: &str, country: &str, age: Option<i32>| {
        Record::with_values(Arc::clone(&users), vec![
            Value::from(name), Value::from(country), age.map_or(Value::Null, Value::Int32),
        ])
    };
    let order = |id: i64, country: &str, amount: f64| {
        Record::with_values(Arc::clone(&orders), vec![
            Value::Int64(id), Value::from(country), Value::Float64(amount),
        ])
    };
    let records: Vec<Record> = [
        order(7, "US", 12.5), user("ana", "ES", Some(31)), order(3, "ES", 99.0),
        user("bo", "US", None), order(9, "ES", 120.0), user("chen", "XE", Some(22)),
    ]
    .into_iter()
    .flatten()
    .collect();

    // =========================================================================
    // 2. 序列化
    // =========================================================================
    println!("【2】序列化 {} 条记录 ...", records.len());
    let mut ser = RecordSerializer::new(Arc::clone(&layout));
    let mut de  = RecordDeserializer::new(Arc::clone(&layout));
    let mut encoded = Vec::with_capacity(records.len());
    for r in &records {
        let bytes = ser.to_bytes(r)?;
        let back = de.deserialize(&bytes)?;
        assert_eq!(&back, r);
        println!("    {:>2} 字节  {r}", bytes.len());
        encoded.push(bytes);
    }
    println!("    ✓ 往返一致\n");

    // =========================================================================
    // 3. 分区
    // =========================================================================
    println!("【3】按分组键分区（4 个分区）...");
    let partitioner = PartitionKeyDeriver::new(Arc::clone(&layout));
    for r in &records {
        println!("    p{}  {r}", partitioner.partition(r, 4)?);
    }
    println!();

    // =========================================================================
    // 4. 字节排序
    // =========================================================================
    println!("【4】在编码后的字节上排序 ...");
    let comparator = SortComparator::new(Arc::clone(&layout));
    let mut failure = None;
    encoded.sort_by(|a, b| comparator.compare_encoded(a, b).unwrap_or_else(|e| {
        failure.get_or_insert(e);
        std::cmp::Ordering::Equal
    }));
    if let Some(e) = failure {
        return Err(e);
    }
    for bytes in &encoded {
        println!("    {}", de.deserialize(bytes)?);
    }
    println!();

    // =========================================================================
    // 5. Rollup
    // =========================================================================
    println!("【5】按 country 分组回调 ...");
    let mut engine = RollupEngine::new(Arc::clone(&layout));
    for bytes in &encoded {
        engine.push_encoded(bytes, &mut de, &mut Printer)?;
    }
    engine.finish(&mut Printer)?;
    println!();

    println!("【5b】单数据源三级 rollup（country → age → name）...");
    let mut people = ConfigBuilder::new();
    people
        .add_source(FieldSchema::parse("people", "country:string,age:int,name:string,height:int")?)
        .set_group_by(&["country", "age", "name"])
        .set_order_by(SortSpec::parse("country asc, age asc, name asc")?)
        .set_rollup_from("country");
    let people = people.build()?;
    let rows: Vec<Record> = [
        ("ES", 20, "listo", 250), ("US", 14, "beber", 202), ("US", 14, "perro", 180),
        ("US", 14, "perro", 170), ("US", 15, "jauja", 160), ("US", 16, "listo", 160),
        ("XE", 20, "listo", 230),
    ]
    .into_iter()
    .filter_map(|(c, a, n, h)| Record::with_values(
        Arc::clone(people.source_schema(0)),
        vec![Value::from(c), Value::Int32(a), Value::from(n), Value::Int32(h)],
    ))
    .collect();
    RollupEngine::new(Arc::clone(&people)).run(&rows, &mut Printer)?;
    println!();

    // =========================================================================
    // 6. 配置 JSON
    // =========================================================================
    println!("【6】配置 JSON 往返 ...");
    let json = layout.config().to_json()?;
    let parsed = CoGroupConfig::from_json(&json)?;
    assert_eq!(parsed.to_json()?, json);
    let rebuilt = ConfigBuilder::from_config(parsed, layout.capabilities().clone()).build()?;
    println!("    {} 字节 JSON，重建后指纹 {:#010x}", json.len(), rebuilt.fingerprint());
    println!("    ✓ {}\n", if rebuilt.fingerprint() == layout.fingerprint() { "指纹一致" } else { "指纹不同" });

    println!("═══════════════════════════════════════════════════════════");
    println!("   演示完成                                                ");
    println!("═══════════════════════════════════════════════════════════");
    Ok(())
}
