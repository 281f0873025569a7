use super::{json_pretty, EXIT_SUCCESS};
use pollapo_core::CacheLock;
use pollapo_store::{CacheLayout, CacheStore};
use std::path::Path;

pub fn run(cache_dir: &Path, json: bool) -> Result<u8, String> {
    let layout = CacheLayout::new(cache_dir);
    let _lock = CacheLock::acquire(&layout.lock_file()).map_err(|e| format!("cache lock: {e}"))?;
    let store = CacheStore::new(layout);

    let entries = store.list().map_err(|e| format!("store error: {e}"))?.len();
    store.clear().map_err(|e| format!("store error: {e}"))?;

    if json {
        let payload = serde_json::json!({
            "cache_dir": cache_dir,
            "entries_removed": entries,
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!("removed {entries} cached entries from {}", cache_dir.display());
    }
    Ok(EXIT_SUCCESS)
}
