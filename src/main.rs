use serde_json::json;
use tether_db::{AdapterConfig, DbKey, EngineCore, IndexSnapshot, KeyType, Row, ScanBounds, StorageAdapter, TableDefinition};

fn row(value: serde_json::Value) -> Row {
    value.as_object().cloned().unwrap_or_default()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    println!("\n╔════════════════════════════════════════════════════╗");
    println!("║  TETHER - Storage adapter over an isolated engine  ║");
    println!("╚════════════════════════════════════════════════════╝\n");

    let config = AdapterConfig::from_env()?;
    println!("▶ Engine mode: {:?}, yield every {} rows", config.engine_mode, config.yield_every);

    // Leftover rows from an earlier session, to show hydration
    let mut core = EngineCore::new();
    core.seed("users", "id", vec![row(json!({"id": 1, "name": "Alice"}))])?;

    let tables = vec![
        TableDefinition::new("users", "id", KeyType::Int).auto_increment(),
        TableDefinition::new("sessions", "token", KeyType::Uuid),
    ];
    let adapter = StorageAdapter::open(config, core, tables).await?;
    println!("✓ Adapter ready\n");

    println!("▶ Performing WRITE operations...");
    let bob = adapter.write("users", None, row(json!({"name": "Bob"})), false).await?;
    println!("  ✓ WRITE users {}", serde_json::Value::Object(bob));
    let carol = adapter.write("users", None, row(json!({"name": "Carol"})), false).await?;
    println!("  ✓ WRITE users {}", serde_json::Value::Object(carol));
    let session = adapter
        .write("sessions", None, row(json!({"user": 2})), true)
        .await?;
    println!("  ✓ WRITE sessions {}\n", serde_json::Value::Object(session));

    println!("▶ Performing partial UPDATE (merged with stored row)...");
    let alice = adapter
        .write("users", Some(DbKey::Int(1)), row(json!({"role": "admin"})), false)
        .await?;
    println!("  ✓ users/1 = {}\n", serde_json::Value::Object(alice));

    println!("▶ Performing READ operations...");
    match adapter.read("users", &DbKey::Int(2)).await? {
        Some(found) => println!("  ✓ READ users/2 = {}", serde_json::Value::Object(found)),
        None => println!("  ✓ READ users/2 = <not found>"),
    }
    match adapter.read("users", &DbKey::Int(999)).await? {
        Some(found) => println!("  ✓ READ users/999 = {}", serde_json::Value::Object(found)),
        None => println!("  ✓ READ users/999 = <not found>"),
    }
    println!();

    println!("▶ Performing DELETE operation...");
    adapter.delete("users", &DbKey::Int(3)).await?;
    println!("  ✓ DELETE users/3\n");

    println!("▶ Performing RANGE READ...");
    let delivered = adapter
        .range_read_each("users", ScanBounds::Full, |found, position| {
            println!("    - [{}] {}", position, serde_json::Value::Object(found));
        })
        .await?;
    println!("  ✓ {} rows delivered\n", delivered);

    if let IndexSnapshot::Length(len) = adapter.get_index_snapshot("users", true)? {
        println!("▶ users index holds {} keys", len);
    }

    println!("▶ Destroying all tables...");
    adapter.destroy_all().await?;
    println!("  ✓ Tables cleared: {:?}\n", adapter.table_names());

    println!("✅ All operations completed successfully!");
    Ok(())
}
