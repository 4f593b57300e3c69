//! Publish Load Tool
//!
//! Publishes sample `movement.created` events to the configured exchange.
//!
//! Run with: cargo run --bin publish_load --release -- --events 1000 --batch 50

use std::time::Instant;

use chrono::Utc;
use ledger_events::domain::{LedgerPayload, MovementCreated, MovementKind};
use ledger_events::{Config, Event, EventManager};
use rust_decimal::Decimal;
use uuid::Uuid;

fn arg<T: std::str::FromStr>(args: &[String], name: &str, default: T) -> T {
    args.iter()
        .position(|a| a == name)
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn sample_event(i: u64) -> anyhow::Result<Event> {
    let payload = MovementCreated {
        movement_id: Uuid::new_v4(),
        account_id: Uuid::new_v4(),
        kind: if i % 2 == 0 { MovementKind::Credit } else { MovementKind::Debit },
        amount: Decimal::new(i64::try_from(i % 10_000)? + 1, 2),
        description: Some(format!("load test movement {}", i)),
        created_at: Utc::now(),
    };
    Ok(payload.into_event()?.with_correlation_id(format!("load-{}", i)))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let args: Vec<String> = std::env::args().collect();
    let event_count: u64 = arg(&args, "--events", 1000);
    let batch_size: usize = arg(&args, "--batch", 1).max(1);

    let config = Config::from_env()?;
    println!(
        "Publish Load - {} events to exchange {} (batch size {})",
        event_count, config.exchange, batch_size
    );

    let manager = EventManager::amqp(config);
    manager.initialize().await?;

    let start = Instant::now();
    let mut success_count = 0u64;
    let mut rejected_count = 0u64;
    let mut batch = Vec::with_capacity(batch_size);

    for i in 0..event_count {
        batch.push(sample_event(i)?);
        if batch.len() < batch_size && i + 1 < event_count {
            continue;
        }

        match manager.publish_batch(&batch).await {
            Ok(()) => success_count += batch.len() as u64,
            Err(ledger_events::MessagingError::BatchPublishFailed { index, .. }) => {
                success_count += index as u64;
                rejected_count += (batch.len() - index) as u64;
            }
            Err(e) if e.is_transient() => rejected_count += batch.len() as u64,
            Err(e) => return Err(e.into()),
        }
        batch.clear();

        if (i + 1) % 1000 == 0 {
            println!("Published {} events...", i + 1);
        }
    }

    let elapsed = start.elapsed();
    let rate = success_count as f64 / elapsed.as_secs_f64();

    manager.shutdown().await;

    println!("\n=== Publish Load Results ===");
    println!("Total events: {}", event_count);
    println!("Successful: {}", success_count);
    println!("Rejected: {}", rejected_count);
    println!("Time: {:.2}s", elapsed.as_secs_f64());
    println!("Rate: {:.0} events/sec", rate);

    Ok(())
}
