//! Ordered execution of migration steps.
//!
//! - `check_prerequisites` asks every step and collects all messages (no short-circuit).
//! - `run` validates the context, refuses to start while any check fails, then performs the steps
//!   in order and stops at the first error. Completed steps are not rolled back.

use std::time::Instant;

use log::{error, info};
use serde::Serialize;

use crate::access::Collaborators;
use crate::config::MigrationContext;
use crate::error::Result;
use crate::metrics::record_step;
use crate::steps::{
    CloneOperatingSystem, CloneToFinalImage, CreateFinalImage, CreateTemporaryImage,
    FixClonedVolume, MigrationStep, PrepareMigration, RegisterBootEntry, ShrinkTemporaryVolume,
};

/// Aggregated prerequisite answer of all steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineReport {
    pub ok: bool,
    pub messages: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepMetrics {
    pub name: &'static str,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineMetrics {
    pub total_duration_ms: u64,
    pub steps: Vec<StepMetrics>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Prerequisites failed; nothing was performed.
    Blocked(PipelineReport),
    Completed(PipelineMetrics),
}

pub struct MigrationPipeline<'a> {
    steps: Vec<Box<dyn MigrationStep + 'a>>,
    ctx: Option<&'a MigrationContext>,
}

impl<'a> MigrationPipeline<'a> {
    /// The full migration, in order.
    pub fn new(ctx: &'a MigrationContext, co: Collaborators<'a>) -> Self {
        let steps: Vec<Box<dyn MigrationStep + 'a>> = vec![
            Box::new(PrepareMigration::new(ctx, co)),
            Box::new(CreateTemporaryImage::new(ctx, co)),
            Box::new(CloneOperatingSystem::new(ctx, co)),
            Box::new(FixClonedVolume::new(ctx, co)),
            Box::new(ShrinkTemporaryVolume::new(ctx, co)),
            Box::new(CreateFinalImage::new(ctx, co)),
            Box::new(CloneToFinalImage::new(ctx, co)),
            Box::new(RegisterBootEntry::new(ctx, co)),
        ];
        Self {
            steps,
            ctx: Some(ctx),
        }
    }

    /// Arbitrary steps, without context validation.
    pub fn from_steps(steps: Vec<Box<dyn MigrationStep + 'a>>) -> Self {
        Self { steps, ctx: None }
    }

    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    pub fn check_prerequisites(&self) -> PipelineReport {
        let mut ok = true;
        let mut messages = Vec::new();
        for step in &self.steps {
            let check = step.check_prerequisites();
            ok &= check.ok;
            if !check.ok {
                info!(
                    "pipeline: {} not ready ({} issue(s))",
                    step.name(),
                    check.messages.len()
                );
            }
            messages.extend(check.messages);
        }
        PipelineReport { ok, messages }
    }

    pub fn run(&mut self) -> Result<RunOutcome> {
        if let Some(ctx) = self.ctx {
            ctx.validate()?;
        }

        let report = self.check_prerequisites();
        if !report.ok {
            return Ok(RunOutcome::Blocked(report));
        }

        let started = Instant::now();
        let mut metrics = PipelineMetrics::default();
        for step in self.steps.iter_mut() {
            let name = step.name();
            info!("pipeline: step {} started", name);
            let t0 = Instant::now();
            let res = step.perform();
            record_step(res.is_ok());
            if let Err(e) = res {
                error!("pipeline: step {} failed: {}", name, e);
                return Err(e);
            }
            let duration_ms = t0.elapsed().as_millis() as u64;
            info!("pipeline: step {} done in {} ms", name, duration_ms);
            metrics.steps.push(StepMetrics { name, duration_ms });
        }
        metrics.total_duration_ms = started.elapsed().as_millis() as u64;
        Ok(RunOutcome::Completed(metrics))
    }
}
