/// recordkeep API Demo
///
/// Walks through the main operations against a toy in-memory store:
/// - Writes with change notification
/// - Search language
/// - Row edit locks
/// - Change watching
/// - Statistics and health checks

use recordkeep::core::config::Config;
use recordkeep::core::database::{Database, RecordStore};
use recordkeep::core::error::Result;
use recordkeep::core::types::{Collection, Row, RowId, SqlValue};
use std::collections::HashMap;
use std::time::Duration;

/// Keeps inserted rows per table and answers every SELECT with the whole table.
#[derive(Default)]
struct ToyStore {
    tables: HashMap<String, Vec<Row>>,
}

impl RecordStore for ToyStore {
    fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
        println!("    store <- {} {:?}", sql, params);
        let table = sql.split_whitespace().nth(3).unwrap_or_default();
        Ok(self.tables.get(table).cloned().unwrap_or_default())
    }

    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        println!("    store <- {} {:?}", sql, params);
        if let Some(table) = sql.split_whitespace().nth(2) {
            self.tables.entry(table.to_string()).or_default().push(params.to_vec());
        }
        Ok(1)
    }
}

fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    println!("\n╔═══════════════════════════════════════════════╗");
    println!("║        recordkeep - API Demo                 ║");
    println!("╚═══════════════════════════════════════════════╝\n");

    let root = tempfile::tempdir()?;

    // Step 1: Open
    println!("Step 1: Opening database at {}...", root.path().display());
    let config = Config {
        serializer_poll_interval: Duration::from_millis(10),
        edit_lock_poll_interval: Duration::from_millis(50),
        change_poll_interval: Duration::from_millis(50),
        ..Config::with_storage_path(root.path())
    };
    let db = Database::open(ToyStore::default(), config)?;
    let watcher = db.watch_changes()?;
    println!("Done!\n");

    // Step 2: Writes
    println!("Step 2: INSERT - Adding records...");
    db.execute(
        "INSERT INTO Persons (first_name, last_name) VALUES (?, ?)",
        &[SqlValue::from("Tim"), SqlValue::from("Meyer")],
    )?;
    db.execute_many(
        "INSERT INTO Documents (document_name) VALUES (?)",
        &[vec![SqlValue::from("lease.pdf")], vec![SqlValue::from("contract.pdf")]],
    )?;
    println!("  Change log now {} bytes\n", db.change_log().size()?);

    // Step 3: Search
    println!("Step 3: SEARCH - Query language...");
    for query in [
        "Tim",
        "user{last_name}= Meyer",
        "user: Tim & {first_name}: Ann | docu: lease",
        "name: Tim '",
    ] {
        match db.search(query) {
            Ok(rows) => println!("  {:?}: {} rows", query, rows.len()),
            Err(e) => println!("  {:?}: {}", query, e),
        }
    }
    println!();

    // Step 4: Edit locks
    println!("Step 4: EDIT LOCKS - Editing Documents row 7...");
    let first = db.edit_locks().stage(Collection::Documents, RowId(7), || {
        println!("  First editor holds the row");
    });
    first.wait()?;

    let second = db.edit_locks().stage(Collection::Documents, RowId(7), || {
        println!("  Second editor got the row after release");
    });
    std::thread::sleep(Duration::from_millis(120));
    println!("  Second editor state: {:?}", db.edit_locks().state(Collection::Documents, RowId(7)));
    db.edit_locks().release(Collection::Documents, RowId(7))?;
    println!("  Second editor outcome: {:?}", second.wait()?);
    println!("  Release: {:?}", db.edit_locks().release(Collection::Documents, RowId(7))?);
    println!("  Release again: {:?}\n", db.edit_locks().release(Collection::Documents, RowId(7))?);

    // Step 5: Change events
    println!("Step 5: CHANGES - Events seen by the watcher:");
    while let Ok(event) = watcher.events().recv_timeout(Duration::from_millis(200)) {
        println!("  {} -> {}", event.previous, event.cursor);
    }
    watcher.stop();
    println!();

    // Step 6: Stats
    println!("Step 6: STATISTICS - Database metrics:");
    println!("  ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    let stats = db.stats()?;
    println!("  Queries:            {}", stats.query_count);
    println!("  Writes:             {}", stats.write_count);
    println!("  Searches:           {}", stats.search_count);
    println!("  Parse Failures:     {}", stats.parse_failures);
    println!("  Cache Hit Rate:     {:.2}", stats.cache_stats.hit_rate());
    println!("  Change Log Bytes:   {}", stats.change_log_bytes);
    println!();

    // Step 7: Health
    println!("Step 7: HEALTH CHECK - System status:");
    println!("  ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    let health = db.health_check();
    println!("  Status: {:?}", health.status);
    for check in &health.checks {
        println!("    - {}: {:?}", check.name, check.status);
    }

    println!("\n╔════════════════════════════════════════╗");
    println!("║    All API Operations Completed!      ║");
    println!("╚════════════════════════════════════════╝\n");

    Ok(())
}
