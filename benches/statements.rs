use criterion::{black_box, criterion_group, criterion_main, Criterion};
use sqlweave::dialects::{MySqlDialect, PostgresDialect, SqliteDialect};
use sqlweave::prelude::*;

#[derive(Default)]
struct Customer {
    id: i64,
    name: String,
    city_id: i64,
    city_name: Option<String>,
    credit: i64,
    version: i64,
}

#[derive(Default)]
struct City {
    id: i64,
    name: String,
}

impl Entity for City {
    fn define() -> EntityDef<Self> {
        EntityDef::table("city")
            .id("id", ColumnType::Long, |c: &City| &c.id, |c| &mut c.id)
            .field("name", ColumnType::String, |c| &c.name, |c| &mut c.name)
    }
}

impl Entity for Customer {
    fn define() -> EntityDef<Self> {
        EntityDef::table("customer")
            .id("id", ColumnType::Long, |c: &Customer| &c.id, |c| &mut c.id)
            .field("name", ColumnType::String, |c| &c.name, |c| &mut c.name)
            .field("city_id", ColumnType::Long, |c| &c.city_id, |c| &mut c.city_id)
            .references::<City>()
            .list_only(
                "city_name",
                ColumnType::String,
                "city_id",
                "name",
                |c| &c.city_name,
                |c| &mut c.city_name,
            )
            .field("credit", ColumnType::Long, |c| &c.credit, |c| &mut c.credit)
            .version("version", ColumnType::Long, |c| &c.version, |c| &mut c.version)
    }
}

fn search() -> Query<Customer> {
    Query::new()
        .filter(Restriction::or(vec![
            Restriction::begins_with("name", "Ad"),
            Restriction::between("credit", 100i64, 500i64),
        ]))
        .where_in("city_id", vec![1i64, 2, 3, 5, 8, 13])
        .order_by("name", OrderDirection::Asc)
        .limit(50)
}

fn benchmark_find_statements(c: &mut Criterion) {
    let rules = NamingRules::new(true, None);
    let dialects: Vec<(&str, Box<dyn SqlDialect>)> = vec![
        ("sqlite", Box::new(SqliteDialect::new(rules.clone()))),
        ("postgres", Box::new(PostgresDialect::new(rules.clone()))),
        ("mysql", Box::new(MySqlDialect::new(rules))),
    ];
    let query = search();

    for (name, dialect) in &dialects {
        let schema = dialect.registry().resolve::<Customer>().unwrap();
        c.bench_function(&format!("{}_find_statement", name), |b| {
            b.iter(|| {
                let stmt = dialect
                    .prepare_find_statement(&schema, black_box(query.criteria()), false)
                    .unwrap();
                black_box(stmt);
            })
        });
    }
}

fn benchmark_write_statements(c: &mut Criterion) {
    let dialect = PostgresDialect::new(NamingRules::new(true, None));
    let schema = dialect.registry().resolve::<Customer>().unwrap();
    let customer = Customer {
        id: 42,
        name: "Ada".to_string(),
        city_id: 3,
        credit: 250,
        version: 4,
        ..Default::default()
    };
    let expected = SqlValue::BigInt(3);

    c.bench_function("postgres_create_statement", |b| {
        b.iter(|| {
            let stmt = dialect
                .prepare_create_statement(&schema, black_box(&customer))
                .unwrap();
            black_box(stmt);
        })
    });

    c.bench_function("postgres_versioned_update_statement", |b| {
        b.iter(|| {
            let stmt = dialect
                .prepare_update_by_id_version_statement(&schema, black_box(&customer), &expected)
                .unwrap();
            black_box(stmt);
        })
    });
}

fn benchmark_schema_registry(c: &mut Criterion) {
    c.bench_function("registry_resolve_cached", |b| {
        let dialect = SqliteDialect::new(NamingRules::new(true, None));
        dialect.registry().resolve::<Customer>().unwrap();
        b.iter(|| {
            let schema = dialect.registry().resolve::<Customer>().unwrap();
            black_box(schema);
        })
    });
}

criterion_group!(
    benches,
    benchmark_find_statements,
    benchmark_write_statements,
    benchmark_schema_registry
);
criterion_main!(benches);
