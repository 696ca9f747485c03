//! OBLIVION - Partition Engine REPL
//! Interactive shell over a demo table:
//! `pk blob, ck int, s text static, v int, PRIMARY KEY (pk, ck)`.

use std::io::{self, BufRead, Write};

use oblivion_partition::config::Config;
use oblivion_partition::engine::cell::{AtomicCell, CellValue};
use oblivion_partition::engine::compaction::AlwaysGc;
use oblivion_partition::engine::partition::MutationPartition;
use oblivion_partition::engine::query::{PartitionSlice, QueryResult, ResultCell, ResultValue};
use oblivion_partition::engine::range_tombstone::RangeTombstone;
use oblivion_partition::engine::Engine;
use oblivion_partition::error::Result;
use oblivion_partition::keys::ClusteringKeyPrefix;
use oblivion_partition::schema::{ColumnKind, ColumnType, Schema};
use oblivion_partition::tombstone::Tombstone;
use oblivion_partition::types::{gc_clock_now, int32, now_micros, text};

fn demo_schema() -> Schema {
    Schema::builder("demo", "events")
        .with_column("pk", ColumnType::Blob, ColumnKind::PartitionKey)
        .with_column("ck", ColumnType::Int32, ColumnKind::ClusteringKey)
        .with_column("s", ColumnType::Text, ColumnKind::Static)
        .with_column("v", ColumnType::Int32, ColumnKind::Regular)
        .build()
}

fn parse_ck(arg: &str) -> Option<ClusteringKeyPrefix> {
    arg.parse::<i32>()
        .ok()
        .map(|v| ClusteringKeyPrefix::from_i32s(&[v]))
}

fn format_cell(cell: &Option<ResultCell>) -> String {
    match cell {
        None => "null".to_string(),
        Some(c) => match &c.value {
            ResultValue::Atomic(v) => match <[u8; 4]>::try_from(v.as_ref()) {
                Ok(raw) => i32::from_be_bytes(raw).to_string(),
                Err(_) => format!("'{}'", String::from_utf8_lossy(v)),
            },
            ResultValue::Collection(elems) => format!("{{{} elements}}", elems.len()),
        },
    }
}

fn print_result(result: &QueryResult) {
    if result.partitions.is_empty() {
        println!("  (empty)");
    }
    for partition in &result.partitions {
        let statics: Vec<String> = partition.static_cells.iter().map(format_cell).collect();
        println!(
            "  {} static=[{}]",
            String::from_utf8_lossy(&partition.key),
            statics.join(", ")
        );
        for row in &partition.rows {
            let cells: Vec<String> = row.cells.iter().map(format_cell).collect();
            let key = row.key.as_ref().map(|k| k.to_string()).unwrap_or_default();
            println!("    {} -> [{}]", key, cells.join(", "));
        }
    }
    println!("  ({} rows)", result.row_count);
}

/// Slice for a scan command: `query`, `rev` or `values`.
fn slice_for(schema: &Schema, cmd: &str) -> Option<PartitionSlice> {
    let full = PartitionSlice::full(schema);
    match cmd {
        "query" | "scan" => Some(full),
        "rev" => Some(full.reversed()),
        "values" => {
            let value_id = schema.find_column("v")?.id;
            Some(full.with_static_columns(Vec::new()).with_regular_columns(vec![value_id]))
        }
        _ => None,
    }
}

/// Build the fragment one command writes. `None` means bad arguments.
fn fragment_for(schema: &Schema, cmd: &str, args: &[&str]) -> Option<Result<MutationPartition>> {
    let value_id = schema.find_column("v")?.id;
    let static_id = schema.find_column("s")?.id;
    let mut fragment = MutationPartition::new();
    let ts = now_micros();
    let now = gc_clock_now();
    let result = match (cmd, args) {
        ("set", [ck, v]) => {
            let ck = parse_ck(ck)?;
            let v = v.parse::<i32>().ok()?;
            fragment.set_clustered_cell(schema, ck, value_id, CellValue::Atomic(AtomicCell::live(ts, int32(v))))
        }
        ("setttl", [ck, v, ttl]) => {
            let ck = parse_ck(ck)?;
            let v = v.parse::<i32>().ok()?;
            let ttl = ttl.parse::<i64>().ok()?;
            let cell = AtomicCell::live_expiring(ts, int32(v), now + ttl, ttl);
            fragment.set_clustered_cell(schema, ck, value_id, CellValue::Atomic(cell))
        }
        ("static", rest) if !rest.is_empty() => fragment.set_static_cell(
            schema,
            static_id,
            CellValue::Atomic(AtomicCell::live(ts, text(&rest.join(" ")))),
        ),
        ("ins", [ck]) => {
            fragment.apply_insert(schema, parse_ck(ck)?, ts);
            Ok(())
        }
        ("del", []) => {
            fragment.apply_tombstone(Tombstone::new(ts, now));
            Ok(())
        }
        ("del", [ck]) => {
            fragment.apply_row_tombstone(schema, parse_ck(ck)?, Tombstone::new(ts, now));
            Ok(())
        }
        ("delr", [from, to]) => {
            let rt = RangeTombstone::inclusive(parse_ck(from)?, parse_ck(to)?, Tombstone::new(ts, now));
            fragment.apply_delete(schema, rt);
            Ok(())
        }
        _ => return None,
    };
    Some(result.map(|()| fragment))
}

fn main() {
    env_logger::init();

    println!();
    println!("  ╔═══════════════════════════════════════════╗");
    println!("  ║        OBLIVION Partition Engine          ║");
    println!("  ║   Merge & Compaction Core v1.0.0          ║");
    println!("  ╚═══════════════════════════════════════════╝");
    println!();
    println!("  Commands:");
    println!("    set <pk> <ck> <v>           - Write v in row ck");
    println!("    setttl <pk> <ck> <v> <ttl>  - Write v expiring after ttl seconds");
    println!("    static <pk> <text>          - Write the static column");
    println!("    ins <pk> <ck>               - Insert an empty row");
    println!("    del <pk> [ck]               - Delete a partition or a row");
    println!("    delr <pk> <from> <to>       - Delete rows from..=to");
    println!("    get <pk>                    - Dump a partition");
    println!("    read <pk>                   - Read one partition");
    println!("    query [rows]                - Read all partitions");
    println!("    rev [rows]                  - Read all partitions, rows descending");
    println!("    values [rows]               - Read only column v");
    println!("    compact                     - Compact with GC now");
    println!("    info                        - Show engine statistics");
    println!("    exit                        - Shutdown engine");
    println!();

    let schema = demo_schema();
    let mut engine = match Engine::open(schema.clone(), Config::default()) {
        Ok(e) => e,
        Err(err) => {
            eprintln!("[ERROR] Failed to open engine: {}", err);
            std::process::exit(1);
        }
    };

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        print!("oblivion> ");
        let _ = stdout.flush();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break, // EOF
            Ok(_) => {}
            Err(e) => {
                eprintln!("[ERROR] {}", e);
                break;
            }
        }

        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.is_empty() {
            continue;
        }
        let cmd = parts[0].to_lowercase();

        match cmd.as_str() {
            "set" | "setttl" | "static" | "ins" | "del" | "delr" => {
                if parts.len() < 2 {
                    println!("  Usage: {} <pk> ...", cmd);
                    continue;
                }
                let key = parts[1].as_bytes().to_vec();
                match fragment_for(&schema, &cmd, &parts[2..]) {
                    None => println!("  Bad arguments for '{}'", cmd),
                    Some(Err(e)) => println!("  ERROR: {}", e),
                    Some(Ok(fragment)) => match engine.apply(key, fragment) {
                        Ok(()) => println!("  OK"),
                        Err(e) => println!("  ERROR: {}", e),
                    },
                }
            }
            "get" => {
                if parts.len() < 2 {
                    println!("  Usage: get <pk>");
                    continue;
                }
                match engine.get(parts[1].as_bytes()) {
                    None => println!("  (nil)"),
                    Some(p) => {
                        println!("  partition tombstone: {}", p.partition_tombstone());
                        for rt in p.row_tombstones() {
                            println!("  range tombstone: {}", rt);
                        }
                        for entry in p.rows() {
                            println!(
                                "  row {} deleted_at={} cells={} live={}",
                                entry.key,
                                entry.row.deleted_at,
                                entry.row.cells.len(),
                                entry.row.is_live(
                                    p.range_tombstone_for_row(&schema, &entry.key),
                                    gc_clock_now()
                                )
                            );
                        }
                        println!("  ({} bytes)", p.memory_usage());
                    }
                }
            }
            "read" => {
                if parts.len() < 2 {
                    println!("  Usage: read <pk>");
                    continue;
                }
                let slice = PartitionSlice::full(&schema);
                print_result(&engine.query_partition(parts[1].as_bytes(), &slice, gc_clock_now()));
            }
            "query" | "scan" | "rev" | "values" => {
                let limit = parts
                    .get(1)
                    .and_then(|l| l.parse::<u32>().ok())
                    .unwrap_or(u32::MAX);
                match slice_for(&schema, &cmd) {
                    None => println!("  Bad slice for '{}'", cmd),
                    Some(slice) => {
                        print_result(&engine.query_with_limits(&slice, gc_clock_now(), limit, u32::MAX))
                    }
                }
            }
            "compact" => {
                let purged = engine.compact(&AlwaysGc, gc_clock_now());
                println!("  OK ({} partitions purged)", purged);
            }
            "info" | "stats" => {
                println!("  Partitions:    {}", engine.len());
                println!("  MemTable size: {} bytes", engine.memtable_size());
                println!("{}", engine.metrics().report());
            }
            "exit" | "quit" | "q" => {
                println!("  Shutting down OBLIVION...");
                break;
            }
            _ => {
                println!("  Unknown command: '{}'. Type 'exit' to quit.", parts[0]);
            }
        }
    }
}
