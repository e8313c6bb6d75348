//! Check command: load every plugin and report problems.

use std::path::PathBuf;

use anyhow::Result;

use super::common::{create_manager, load_config, print_load_report, TrustArgs};

pub(crate) async fn cmd_check(
    config_path: Option<PathBuf>,
    dir: Option<PathBuf>,
    trust: TrustArgs,
    dot: bool,
) -> Result<()> {
    let config = load_config(config_path.as_deref(), dir)?;
    let manager = create_manager(config, &trust)?;

    let report = manager.load_all().await?;
    print_load_report(&report);

    let conflicts = manager.detect_dependency_conflicts();
    if conflicts.is_empty() {
        println!("No dependency conflicts");
    } else {
        println!("{} dependency conflict(s):", conflicts.len());
        for conflict in &conflicts {
            println!("  - {}", conflict);
        }
    }

    if dot {
        println!();
        print!("{}", manager.dependency_graph_dot());
    }

    println!();
    println!("{}", serde_json::to_string_pretty(&manager.stats())?);

    manager.shutdown().await;

    if !report.failed.is_empty() || !conflicts.is_empty() {
        anyhow::bail!(
            "{} plugin(s) failed to load, {} dependency conflict(s)",
            report.failed.len(),
            conflicts.len()
        );
    }
    Ok(())
}
