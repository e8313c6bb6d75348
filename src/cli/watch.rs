//! Watch command: load plugins and hot reload them as their files change.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;

use super::common::{create_manager, load_config, print_load_report, TrustArgs};

pub(crate) async fn cmd_watch(
    config_path: Option<PathBuf>,
    dir: Option<PathBuf>,
    trust: TrustArgs,
) -> Result<()> {
    let config = load_config(config_path.as_deref(), dir)?;
    let manager = create_manager(config, &trust)?;

    let report = manager.load_all().await?;
    print_load_report(&report);

    manager.enable_hot_reload()?;
    println!(
        "Watching {} plugin(s) in {}",
        manager.hot_reload().watched_plugins().len(),
        manager.config().plugin_dir.display()
    );
    println!("Press Ctrl+C to stop.");
    println!();

    let mut last_seen = chrono::Utc::now();
    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                // History is newest first.
                let history = manager.reload_history(0);
                let fresh: Vec<_> = history
                    .iter()
                    .take_while(|e| e.timestamp > last_seen)
                    .collect();
                if let Some(newest) = fresh.first() {
                    last_seen = newest.timestamp;
                }
                for event in fresh.into_iter().rev() {
                    println!(
                        "[{}] {} {} -> {} ({}, {}ms){}",
                        event.timestamp.format("%H:%M:%S"),
                        event.plugin_id,
                        event.old_version,
                        event.new_version.as_deref().unwrap_or("?"),
                        event.status,
                        event.duration.as_millis(),
                        event
                            .error
                            .as_deref()
                            .map(|e| format!(": {}", e))
                            .unwrap_or_default()
                    );
                }
            }
        }
    }

    println!();
    println!("Stopping...");
    manager.shutdown().await;
    Ok(())
}
