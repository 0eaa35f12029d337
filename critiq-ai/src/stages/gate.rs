//! `gate` stage: paired comparison of two benchmark runs

use super::{StageContext, StageReport};
use crate::benchmark::ScoredRow;
use crate::gate::gate;
use crate::run::{ResolvedRun, RunDir, DECISION_FILE};
use crate::sampler::Split;
use critiq_common::manifest::{ManifestDraft, RunStatus, Stage, UsageSummary};
use critiq_common::{Error, Result};
use serde::Serialize;

#[derive(Debug, Clone)]
pub struct GateArgs {
    pub old_run: String,
    pub new_run: String,
    pub split: Split,
    /// Overrides `gate.alpha`
    pub alpha: Option<f64>,
}

#[derive(Serialize)]
struct GateRunConfig {
    split: Split,
    alpha: f64,
}

pub async fn run_gate(ctx: &StageContext, args: &GateArgs) -> Result<StageReport> {
    let alpha = args.alpha.unwrap_or(ctx.config.gate.alpha);
    if !(alpha > 0.0 && alpha < 1.0) {
        return Err(Error::Config(format!("alpha must be in (0, 1), got {}", alpha)));
    }

    let old_run = ResolvedRun::resolve(&ctx.registry, &args.old_run).await?;
    let new_run = ResolvedRun::resolve(&ctx.registry, &args.new_run).await?;
    old_run.expect_stage(&[Stage::ClassifyBenchmark])?;
    new_run.expect_stage(&[Stage::ClassifyBenchmark])?;

    let old_rows: Vec<ScoredRow> = old_run.read_rows("scored")?;
    let new_rows: Vec<ScoredRow> = new_run.read_rows("scored")?;
    let decision = gate(old_run.run_id(), &old_rows, new_run.run_id(), &new_rows, args.split, alpha)?;

    let snapshot = GateRunConfig {
        split: args.split,
        alpha,
    };
    let mut draft = ManifestDraft::new(Stage::Gate, &ctx.code_version, &snapshot)?;
    draft.add_upstream("old", old_run.run_id());
    draft.add_upstream("new", new_run.run_id());
    let mut old_input = old_run.input_artifact("scored")?;
    old_input.role = format!("old.{}", old_input.role);
    let mut new_input = new_run.input_artifact("scored")?;
    new_input.role = format!("new.{}", new_input.role);
    draft.add_input(old_input);
    draft.add_input(new_input);

    let run_dir = RunDir::create(&ctx.root, draft.run_id())?;
    run_dir.write_json(&mut draft, "decision", DECISION_FILE, &decision)?;

    draft.set_count("joined", decision.joined);
    draft.set_count("eligible", decision.eligible);
    draft.set_count("b", decision.b);
    draft.set_count("c", decision.c);
    draft.set_count("accepted", u64::from(decision.verdict == crate::gate::Verdict::Accept));

    ctx.finalize(&run_dir, draft, UsageSummary::default(), RunStatus::Completed).await
}
