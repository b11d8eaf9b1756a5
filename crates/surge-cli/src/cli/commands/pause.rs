//! Park a stored download as paused.

use anyhow::Result;

use surge_core::store::{DownloadStatusKind, StateStore, StoreError};

pub async fn run_pause(store: &StateStore, id_prefix: &str) -> Result<()> {
    let id = store.resolve_by_prefix(id_prefix).await?;
    let entry = store.get_entry(&id).await?.ok_or(StoreError::NotFound)?;
    if entry.status == DownloadStatusKind::Completed {
        anyhow::bail!("download {} is already complete", id);
    }
    store
        .update_status(&id, DownloadStatusKind::Paused, None)
        .await?;
    println!("paused {}", id);
    Ok(())
}
