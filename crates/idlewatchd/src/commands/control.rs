use idlewatch_engine::InstanceStatus;
use idlewatch_state::Settings;

use super::{human_secs, Context};

pub fn status(ctx: &Context, instance: Option<&str>) -> anyhow::Result<()> {
    let surface = ctx.surface()?;
    let settings = surface.settings()?;
    match instance {
        Some(id) => {
            let status = surface.status(id)?;
            ctx.emit(&status, print_status)
        }
        None => {
            let all = surface.list_status()?;
            ctx.emit(&all, |all| {
                print_settings(&settings);
                for status in all {
                    print_status(status);
                }
            })
        }
    }
}

pub fn enable(ctx: &Context) -> anyhow::Result<()> {
    let settings = ctx.surface()?.enable()?;
    ctx.emit(&settings, print_settings)
}

pub fn disable(ctx: &Context) -> anyhow::Result<()> {
    let settings = ctx.surface()?.disable()?;
    ctx.emit(&settings, print_settings)
}

pub fn set_threshold(ctx: &Context, minutes: u64) -> anyhow::Result<()> {
    let settings = ctx.surface()?.set_threshold(minutes)?;
    ctx.emit(&settings, print_settings)
}

pub fn set_override(ctx: &Context, instance: &str, minutes: u64) -> anyhow::Result<()> {
    let record = ctx.surface()?.set_override(instance, minutes)?;
    ctx.emit(&record, |_| {
        println!("✓ {instance}: idle shutdown suppressed for {minutes} min")
    })
}

pub fn clear_override(ctx: &Context, instance: &str) -> anyhow::Result<()> {
    let record = ctx.surface()?.clear_override(instance)?;
    ctx.emit(&record, |_| println!("✓ {instance}: override cleared"))
}

pub fn forget(ctx: &Context, instance: &str) -> anyhow::Result<()> {
    let existed = ctx.surface()?.forget(instance)?;
    ctx.emit(&serde_json::json!({ "instance_id": instance, "existed": existed }), |_| {
        if existed {
            println!("✓ {instance}: state removed");
        } else {
            println!("{instance}: nothing tracked");
        }
    })
}

fn print_settings(settings: &Settings) {
    println!(
        "idle shutdown {}; threshold {} min; poll every {} min",
        if settings.enabled { "enabled" } else { "disabled" },
        settings.threshold_minutes,
        settings.poll_period_minutes
    );
}

fn print_status(status: &InstanceStatus) {
    let idle = status
        .idle_secs
        .map(human_secs)
        .unwrap_or_else(|| "untracked".to_string());
    let threshold = status
        .threshold_minutes
        .map(|m| format!("{m} min"))
        .unwrap_or_else(|| "not configured".to_string());
    println!("{}  idle {}  threshold {}", status.instance_id, idle, threshold);

    if let Some(remaining) = status.override_remaining_secs {
        println!("  override: {} left", human_secs(remaining));
    }
    if let Some(decision) = &status.last_decision {
        println!(
            "  last decision {}: {} ({})",
            decision.decision_id, decision.status, decision.reason
        );
        if let Some(err) = &decision.last_error {
            println!("    last error: {err}");
        }
    }
    if let Some(err) = &status.last_error {
        println!("  error [{:?}] at {}: {}", err.kind, err.at, err.message);
    }
}
