use anyhow::{Context, Result};
use std::io::{self, BufRead, Write};

use crate::access::{Collaborators, ExternalToolRunner, HostEnvironment};
use crate::config::{find_temp_folder, ContextBuilder, MigrationContext};
use crate::consts::SHUTDOWN;
use crate::lock::try_acquire_run_lock;
use crate::metrics::metrics_snapshot;
use crate::pipeline::{MigrationPipeline, PipelineReport, RunOutcome};

use super::PlanArgs;

/// Plan from the system drive, then env, then command-line flags.
pub(super) fn build_context(plan: &PlanArgs, host: &dyn HostEnvironment) -> Result<MigrationContext> {
    let system = host.system_drive().context("inspect system drive")?;
    let temp = match &plan.temp_dir {
        Some(dir) => Some(dir.clone()),
        None => find_temp_folder(host).context("look for a temporary folder")?,
    };

    let mut b = ContextBuilder::from_context(
        MigrationContext::plan(plan.mode, &system, temp).merge_env(),
    );
    if let Some(dir) = &plan.temp_dir {
        b = b.temp_folder(dir);
    }
    if let Some(dir) = &plan.dest_dir {
        b = b.dest_folder(Some(dir));
    }
    if let Some(name) = &plan.image_name {
        b = b.image_name(name);
    }
    if let Some(t) = plan.container_type {
        b = b.container_type(t);
    }
    if plan.add_to_boot {
        b = b.add_to_boot(true);
    }
    if plan.keep_temp {
        b = b.delete_temp(false);
    }
    Ok(b.build())
}

fn print_report(report: &PipelineReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    if report.ok {
        println!("All prerequisites are met.");
    } else {
        println!("Migration cannot start:");
        for m in &report.messages {
            println!("  - {}", m);
        }
    }
    Ok(())
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{}", prompt);
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    let answer = line.trim().to_ascii_lowercase();
    Ok(answer == "y" || answer == "yes")
}

pub(super) fn cmd_check(plan: &PlanArgs, co: Collaborators<'_>, json: bool) -> Result<i32> {
    let ctx = build_context(plan, co.host)?;
    if !json {
        println!("{}\n", ctx);
    }
    let report = MigrationPipeline::new(&ctx, co).check_prerequisites();
    print_report(&report, json)?;
    Ok(if report.ok { 0 } else { 1 })
}

pub(super) fn cmd_migrate(
    plan: &PlanArgs,
    co: Collaborators<'_>,
    yes: bool,
    reboot: bool,
    json: bool,
) -> Result<i32> {
    let mut ctx = build_context(plan, co.host)?;
    if reboot {
        ctx = ctx.with_auto_reboot(true);
    }
    println!("{}\n", ctx);

    if !yes && !confirm("Start the migration? [y/N] ")? {
        println!("Aborted.");
        return Ok(1);
    }

    let _lock = try_acquire_run_lock(&std::env::temp_dir())?;
    let mut pipeline = MigrationPipeline::new(&ctx, co);
    match pipeline.run()? {
        RunOutcome::Blocked(report) => {
            print_report(&report, json)?;
            Ok(1)
        }
        RunOutcome::Completed(metrics) => {
            if json {
                let out = serde_json::json!({
                    "pipeline": metrics,
                    "counters": metrics_snapshot(),
                });
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                println!(
                    "Migration finished in {:.1} s ({} steps).",
                    metrics.total_duration_ms as f64 / 1000.0,
                    metrics.steps.len()
                );
                let image = ctx.final_image_path()?;
                println!("Image: {}", image.display());
            }
            if ctx.auto_reboot {
                println!("Restarting...");
                co.tools.run_checked(SHUTDOWN, &["/r", "/t", "0"])?;
            }
            Ok(0)
        }
    }
}
