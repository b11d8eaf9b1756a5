//! Show all downloads the store knows about.

use anyhow::Result;

use surge_core::store::StateStore;

pub async fn run_status(store: &StateStore) -> Result<()> {
    let entries = store.list_all().await?;
    if entries.is_empty() {
        println!("no downloads");
        return Ok(());
    }

    println!(
        "{:<14} {:<12} {:>12} {:>12}  {}",
        "ID", "STATUS", "DOWNLOADED", "TOTAL", "FILE"
    );
    for e in entries {
        let total = e
            .total_size
            .map(|n| n.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<14} {:<12} {:>12} {:>12}  {}",
            e.id,
            e.status.as_str(),
            e.downloaded,
            total,
            e.filename
        );
        if let Some(err) = e.error {
            println!("{:<14} error: {}", "", err);
        }
    }
    Ok(())
}
