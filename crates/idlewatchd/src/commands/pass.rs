use tokio::sync::watch;
use tracing::{info, warn};

use idlewatch_engine::{ExecutionResult, PassReport};

use super::{human_secs, Context};

pub async fn pass(ctx: &Context) -> anyhow::Result<()> {
    let watcher = ctx.watcher(true)?;
    let report = watcher.run_pass().await?;
    ctx.emit(&report, print_report)
}

pub async fn run(ctx: &Context) -> anyhow::Result<()> {
    let watcher = ctx.watcher(true)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("shutdown signal received"),
            Err(e) => warn!(error = %e, "failed to listen for ctrl-c"),
        }
        let _ = shutdown_tx.send(true);
    });

    watcher.run(shutdown_rx).await;
    Ok(())
}

pub fn check(ctx: &Context) -> anyhow::Result<()> {
    let file = ctx.load_config()?;
    for inst in &file.instances {
        inst.validate()?;
    }
    if file.control.is_none() {
        warn!("no [control] section; passes will refuse to run");
    }
    ctx.emit(&file, |file| {
        println!(
            "✓ {} ({} instances)",
            ctx.config.display(),
            file.instances.len()
        );
    })
}

pub fn print_report(report: &PassReport) {
    println!(
        "pass: {} instances, {} proposed, {} executed, {} cancelled, {} failed, {} errors{}",
        report.instances.len(),
        report.proposed(),
        report.executed(),
        report.cancelled(),
        report.failed(),
        report.errors(),
        if report.enabled { "" } else { " (disabled)" },
    );
    for inst in &report.instances {
        let idle = inst
            .idle_secs
            .map(human_secs)
            .unwrap_or_else(|| "-".to_string());
        let action = match (&inst.execution, &inst.held, &inst.error) {
            (_, _, Some(err)) => format!("error: {err}"),
            (Some(ExecutionResult::Executed { already_down: true, .. }), _, _) => {
                "already down".to_string()
            }
            (Some(ExecutionResult::Executed { attempts, .. }), _, _) => {
                format!("stopped ({attempts} attempts)")
            }
            (Some(ExecutionResult::Cancelled { reason }), _, _) => format!("cancelled: {reason}"),
            (Some(ExecutionResult::Failed { error, .. }), _, _) => format!("stop failed: {error}"),
            (Some(ExecutionResult::Skipped { reason }), _, _) => format!("skipped: {reason}"),
            (None, Some(held), _) => format!("held: {held}"),
            (None, None, None) => "ok".to_string(),
        };
        println!("  {:<24} idle {:>8}  {}", inst.instance_id, idle, action);
    }
}
