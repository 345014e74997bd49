use serde_json::json;
use std::env;
use std::time::Instant;
use tether_db::{AdapterConfig, EngineCore, IndexSnapshot, KeyType, ScanBounds, StorageAdapter, TableDefinition};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    println!("\n🌊 FLOOD: bulk writes and a full range read 🌊");
    println!("==================================================");

    // 1. Parameters
    let total_rows: usize = match env::var("FLOOD_ROWS") {
        Ok(val) => val.parse()?,
        Err(_) => 10_000,
    };
    let config = AdapterConfig::from_env()?;
    println!("▶ Engine: {:?} | rows: {} | yield every: {}", config.engine_mode, total_rows, config.yield_every);

    let adapter = StorageAdapter::open(
        config,
        EngineCore::new(),
        vec![TableDefinition::new("drops", "id", KeyType::Int).auto_increment()],
    )
    .await?;

    // 2. Inflow
    let start = Instant::now();
    for i in 0..total_rows {
        let row = json!({ "payload": format!("drop-{:06}", i) });
        let row = row.as_object().cloned().unwrap_or_default();
        adapter.write("drops", None, row, true).await?;

        if (i + 1) % 1000 == 0 {
            println!("  💧 {} rows written | {} requests in flight", i + 1, adapter.pending_requests());
        }
    }
    let duration = start.elapsed();
    println!("\n✅ Inflow complete in {:.2?}", duration);
    println!("   Rate: {:.2} writes/sec", total_rows as f64 / duration.as_secs_f64());

    // 3. Outflow
    let start = Instant::now();
    let mut last_position = None;
    let delivered = adapter
        .range_read_each("drops", ScanBounds::Full, |_, position| {
            last_position = Some(position);
        })
        .await?;
    let duration = start.elapsed();
    println!("\n✅ Range read delivered {} rows in {:.2?} (last position {:?})", delivered, duration, last_position);

    if let IndexSnapshot::Length(len) = adapter.get_index_snapshot("drops", true)? {
        println!("📊 Index holds {} keys", len);
    }

    // 4. Drain
    adapter.destroy_all().await?;
    println!("✓ Table dropped.");

    Ok(())
}
