use std::io::{Read, Write};
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use mastercache::protocol::stream::{ReadExt, WriteExt};
use mastercache::{
    CacheControl, CachedTable, ProtocolVersion, Result, Row, RowSource, TableId, TableRows, Value,
};
use rand::prelude::*;
use rand::rngs::SmallRng;

const ROWS: i32 = 10_000;
const DOMAINS: i32 = 100;

struct EmailAddress {
    id: i32,
    domain: i32,
    address: String,
}

impl Row for EmailAddress {
    type Key = i32;
    const TABLE_ID: TableId = TableId(30);
    const TABLE_NAME: &'static str = "email_addresses";
    const COLUMN_COUNT: usize = 3;

    fn key(&self) -> i32 {
        self.id
    }

    fn column(&self, index: usize) -> Option<Value> {
        match index {
            0 => Some(self.id.into()),
            1 => Some(self.domain.into()),
            2 => Some(self.address.as_str().into()),
            _ => None,
        }
    }

    fn read_from<R: Read + ?Sized>(reader: &mut R, _version: ProtocolVersion) -> Result<Self> {
        Ok(EmailAddress {
            id: reader.read_compressed_int()?,
            domain: reader.read_compressed_int()?,
            address: reader.read_utf()?,
        })
    }

    fn write_to<W: Write + ?Sized>(&self, writer: &mut W, _version: ProtocolVersion) -> Result<()> {
        writer.write_compressed_int(self.id)?;
        writer.write_compressed_int(self.domain)?;
        writer.write_utf(&self.address)
    }
}

/// serves the same pre-encoded table on every fetch
struct Prepared(Vec<Vec<u8>>);

impl Prepared {
    fn new() -> Self {
        let rows = (0..ROWS)
            .map(|id| {
                EmailAddress {
                    id,
                    domain: id % DOMAINS,
                    address: format!("user{}@domain{}.example", id, id % DOMAINS),
                }
                .to_bytes(ProtocolVersion::CURRENT)
                .unwrap()
            })
            .collect();
        Prepared(rows)
    }
}

impl RowSource for Prepared {
    fn fetch_table(&self, _table: TableId) -> Result<TableRows> {
        Ok(TableRows {
            version: ProtocolVersion::CURRENT,
            rows: self.0.clone(),
        })
    }
}

fn lookup_bench(c: &mut Criterion) {
    let table = CachedTable::<EmailAddress>::new(Arc::new(Prepared::new()));
    table.rows().unwrap();
    let mut rng = SmallRng::from_seed([0; 32]);

    c.bench_function("cached get by key", |b| {
        b.iter(|| {
            let id = rng.gen_range(0..ROWS);
            table.get(&id).unwrap()
        })
    });

    c.bench_function("cached get by unique column", |b| {
        b.iter(|| {
            let id = rng.gen_range(0..ROWS);
            let address = format!("user{}@domain{}.example", id, id % DOMAINS);
            table.get_unique(2, &Value::Text(address)).unwrap()
        })
    });

    c.bench_function("cached get by indexed column", |b| {
        b.iter(|| {
            let domain = rng.gen_range(0..DOMAINS);
            table.get_indexed(1, &Value::from(domain)).unwrap().len()
        })
    });
}

fn reload_bench(c: &mut Criterion) {
    let table = CachedTable::<EmailAddress>::new(Arc::new(Prepared::new()));

    c.bench_function("reload after invalidation", |b| {
        b.iter_batched(
            || table.clear_cache(),
            |_| table.len().unwrap(),
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, lookup_bench, reload_bench);
criterion_main!(benches);
