//! Benchmark utilities.

#![warn(missing_docs)]

use rand::Rng;
use tabula_core::{ColumnDef, ColumnType, Database, TableSchema, Value};

/// Name of the benchmark table.
pub const BENCH_TABLE: &str = "bench";

/// Generate random bytes of the specified size.
pub fn random_data(size: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..size).map(|_| rng.gen()).collect()
}

/// Generate `count` distinct row ids in random order.
pub fn shuffled_ids(count: u32) -> Vec<u32> {
    let mut rng = rand::thread_rng();
    let mut ids: Vec<u32> = (0..count).collect();
    for i in (1..ids.len()).rev() {
        let j = rng.gen_range(0..=i);
        ids.swap(i, j);
    }
    ids
}

/// Opens an in-memory database holding an empty benchmark table with an
/// indexed integer key and a binary payload.
pub fn bench_db() -> Database {
    let db = Database::open_in_memory().expect("Failed to open database");
    db.transaction(|txn| {
        txn.create_table(
            TableSchema::new(BENCH_TABLE)
                .column(ColumnDef::new("key", ColumnType::Integer).not_null().indexed())
                .column(ColumnDef::new("payload", ColumnType::Binary)),
        )
    })
    .expect("Failed to create benchmark table");
    db
}

/// A benchmark row.
pub fn bench_row(key: i64, payload: &[u8]) -> Vec<Value> {
    vec![Value::Integer(key), Value::Binary(payload.to_vec())]
}
