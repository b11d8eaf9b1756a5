//! Remove a download from the store, optionally deleting its files.

use anyhow::Result;
use std::path::PathBuf;

use surge_core::storage;
use surge_core::store::{StateStore, StoreError};

pub async fn run_remove(store: &StateStore, id_prefix: &str, delete_files: bool) -> Result<()> {
    let id = store.resolve_by_prefix(id_prefix).await?;
    let entry = store.get_entry(&id).await?.ok_or(StoreError::NotFound)?;

    store.delete_state(&entry.url_hash, &entry.dest_path).await?;
    store.remove_entry(&id).await?;

    if delete_files {
        let dest = PathBuf::from(&entry.dest_path);
        storage::remove_working_file(&dest)?;
        match std::fs::remove_file(&dest) {
            Ok(()) => println!("deleted {}", dest.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    println!("removed {}", id);
    Ok(())
}
