//! Statistical gate between two benchmark runs on the same split
//!
//! Decision rule: reject if new F1 < old F1; otherwise accept iff the new
//! configuration wins more discordant pairs (`c > b`) and the exact McNemar
//! p-value is below alpha. The label-shift test is informational.

pub mod stats;

pub use stats::{chi_square_independence, mcnemar_exact, ChiSquareTest};

use crate::benchmark::{BinaryCounts, BinaryMetrics, MetricsPolicy, ScoredRow};
use crate::sampler::Split;
use critiq_common::schema::Label;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Gold disagreements listed in the error message, at most
const MAX_LISTED_DISAGREEMENTS: usize = 20;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum GateError {
    #[error("Runs {old_run_id} and {new_run_id} share no scored items")]
    EmptyJoin { old_run_id: String, new_run_id: String },

    #[error("Run {run_id} was scored on split {found}, gate requested split {expected}")]
    SplitMismatch {
        run_id: String,
        expected: Split,
        found: Split,
    },

    #[error("Gold labels disagree on {count} joined items: {}", .item_ids.join(", "))]
    GoldDisagreement { count: usize, item_ids: Vec<String> },
}

impl From<GateError> for critiq_common::Error {
    fn from(err: GateError) -> Self {
        critiq_common::Error::Precondition(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Accept,
    Reject,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DecisionReason {
    F1Regressed { old_f1: f64, new_f1: f64 },
    NoNetImprovement { b: u64, c: u64 },
    NotSignificant { p_value: f64, alpha: f64 },
    SignificantImprovement { b: u64, c: u64, p_value: f64, alpha: f64 },
}

/// One item scored by both runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairedRow {
    pub item_id: String,
    pub context_id: String,
    pub gold: Label,
    pub old_predicted: Label,
    pub new_predicted: Label,
    /// Gold and both predictions non-unknown
    pub eligible: bool,
    pub old_correct: Option<bool>,
    pub new_correct: Option<bool>,
}

/// Old vs new predicted-label counts on the joined rows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelShift {
    pub labels: Vec<Label>,
    pub old_counts: [u64; 3],
    pub new_counts: [u64; 3],
    pub test: ChiSquareTest,
}

/// Gate artifact; contains no timestamps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateDecision {
    pub old_run_id: String,
    pub new_run_id: String,
    pub split: Split,
    pub alpha: f64,
    pub joined: u64,
    pub only_in_old: u64,
    pub only_in_new: u64,
    pub eligible: u64,
    pub both_correct: u64,
    pub both_wrong: u64,
    /// Old correct, new wrong
    pub b: u64,
    /// Old wrong, new correct
    pub c: u64,
    pub mcnemar_p_value: f64,
    pub old_metrics: BinaryMetrics,
    pub new_metrics: BinaryMetrics,
    pub label_shift: LabelShift,
    pub verdict: Verdict,
    pub reasons: Vec<DecisionReason>,
    pub rows: Vec<PairedRow>,
}

/// Compare two runs' scored rows on `split`
pub fn gate(
    old_run_id: &str,
    old_rows: &[ScoredRow],
    new_run_id: &str,
    new_rows: &[ScoredRow],
    split: Split,
    alpha: f64,
) -> Result<GateDecision, GateError> {
    check_split(old_run_id, old_rows, split)?;
    check_split(new_run_id, new_rows, split)?;

    let old: BTreeMap<&str, &ScoredRow> = old_rows.iter().map(|r| (r.item_id.as_str(), r)).collect();
    let new: BTreeMap<&str, &ScoredRow> = new_rows.iter().map(|r| (r.item_id.as_str(), r)).collect();

    let joined: Vec<(&ScoredRow, &ScoredRow)> = old
        .iter()
        .filter_map(|(id, o)| new.get(id).map(|n| (*o, *n)))
        .collect();

    if joined.is_empty() {
        return Err(GateError::EmptyJoin {
            old_run_id: old_run_id.to_string(),
            new_run_id: new_run_id.to_string(),
        });
    }

    let disagreements: Vec<String> = joined
        .iter()
        .filter(|(o, n)| o.gold != n.gold)
        .map(|(o, _)| o.item_id.clone())
        .collect();
    if !disagreements.is_empty() {
        let count = disagreements.len();
        let item_ids = disagreements.into_iter().take(MAX_LISTED_DISAGREEMENTS).collect();
        return Err(GateError::GoldDisagreement { count, item_ids });
    }

    let mut rows = Vec::with_capacity(joined.len());
    let mut old_counts = BinaryCounts::default();
    let mut new_counts = BinaryCounts::default();
    let mut old_labels = [0u64; 3];
    let mut new_labels = [0u64; 3];
    let (mut b, mut c, mut both_correct, mut both_wrong) = (0u64, 0u64, 0u64, 0u64);

    for (o, n) in &joined {
        old_labels[o.predicted.index()] += 1;
        new_labels[n.predicted.index()] += 1;

        let eligible = o.gold.is_known() && o.predicted.is_known() && n.predicted.is_known();
        let (old_correct, new_correct) = if eligible {
            old_counts.add(MetricsPolicy::ExcludeUnknown.outcome(o.gold, o.predicted));
            new_counts.add(MetricsPolicy::ExcludeUnknown.outcome(n.gold, n.predicted));
            let oc = o.predicted == o.gold;
            let nc = n.predicted == n.gold;
            match (oc, nc) {
                (true, true) => both_correct += 1,
                (true, false) => b += 1,
                (false, true) => c += 1,
                (false, false) => both_wrong += 1,
            }
            (Some(oc), Some(nc))
        } else {
            (None, None)
        };

        rows.push(PairedRow {
            item_id: o.item_id.clone(),
            context_id: o.context_id.clone(),
            gold: o.gold,
            old_predicted: o.predicted,
            new_predicted: n.predicted,
            eligible,
            old_correct,
            new_correct,
        });
    }

    let p_value = mcnemar_exact(b, c);
    let old_metrics = old_counts.summary();
    let new_metrics = new_counts.summary();

    let mut reasons = Vec::new();
    let verdict = if new_metrics.f1 < old_metrics.f1 {
        reasons.push(DecisionReason::F1Regressed {
            old_f1: old_metrics.f1,
            new_f1: new_metrics.f1,
        });
        Verdict::Reject
    } else {
        if c <= b {
            reasons.push(DecisionReason::NoNetImprovement { b, c });
        }
        if p_value >= alpha {
            reasons.push(DecisionReason::NotSignificant { p_value, alpha });
        }
        if reasons.is_empty() {
            reasons.push(DecisionReason::SignificantImprovement { b, c, p_value, alpha });
            Verdict::Accept
        } else {
            Verdict::Reject
        }
    };

    let label_shift = LabelShift {
        labels: Label::ALL.to_vec(),
        old_counts: old_labels,
        new_counts: new_labels,
        test: chi_square_independence(&[old_labels, new_labels]),
    };

    let eligible = rows.iter().filter(|r| r.eligible).count() as u64;
    let joined_count = joined.len() as u64;

    tracing::info!(
        old_run = old_run_id,
        new_run = new_run_id,
        joined = joined_count,
        eligible,
        b,
        c,
        p_value,
        verdict = ?verdict,
        "Gate decision"
    );

    Ok(GateDecision {
        old_run_id: old_run_id.to_string(),
        new_run_id: new_run_id.to_string(),
        split,
        alpha,
        joined: joined_count,
        only_in_old: old.len() as u64 - joined_count,
        only_in_new: new.len() as u64 - joined_count,
        eligible,
        both_correct,
        both_wrong,
        b,
        c,
        mcnemar_p_value: p_value,
        old_metrics,
        new_metrics,
        label_shift,
        verdict,
        reasons,
        rows,
    })
}

fn check_split(run_id: &str, rows: &[ScoredRow], split: Split) -> Result<(), GateError> {
    match rows.iter().find(|r| r.split != split) {
        Some(row) => Err(GateError::SplitMismatch {
            run_id: run_id.to_string(),
            expected: split,
            found: row.split,
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: &str, gold: Label, predicted: Label, split: Split) -> ScoredRow {
        ScoredRow {
            item_id: id.to_string(),
            context_id: "C".into(),
            split,
            gold_split: split.as_str().into(),
            gold,
            predicted,
            confidence: 0.5,
            outcome: MetricsPolicy::ExcludeUnknown.outcome(gold, predicted),
            parse_error: false,
            schema_error: false,
            used_fallback: false,
            service_failure: false,
            ambiguity_flag: false,
        }
    }

    #[test]
    fn test_unknown_pairs_not_eligible() {
        let old = vec![row("a", Label::Positive, Label::Unknown, Split::A)];
        let new = vec![row("a", Label::Positive, Label::Positive, Split::A)];
        let decision = gate("old", &old, "new", &new, Split::A, 0.05).unwrap();
        assert_eq!(decision.eligible, 0);
        assert_eq!(decision.mcnemar_p_value, 1.0);
        assert_eq!(decision.verdict, Verdict::Reject);
        assert_eq!(decision.rows[0].old_correct, None);
    }

    #[test]
    fn test_f1_regression_rejects() {
        let old = vec![
            row("a", Label::Positive, Label::Positive, Split::A),
            row("b", Label::Negative, Label::Negative, Split::A),
        ];
        let new = vec![
            row("a", Label::Positive, Label::Negative, Split::A),
            row("b", Label::Negative, Label::Negative, Split::A),
        ];
        let decision = gate("old", &old, "new", &new, Split::A, 0.05).unwrap();
        assert_eq!(decision.verdict, Verdict::Reject);
        assert!(matches!(decision.reasons[0], DecisionReason::F1Regressed { .. }));
        assert_eq!(decision.b, 1);
        assert_eq!(decision.old_metrics.counts.tp, 1);
        assert_eq!(decision.new_metrics.counts.fn_, 1);
    }

    fn paired_scenario() -> (Vec<ScoredRow>, Vec<ScoredRow>) {
        let mut old = Vec::new();
        let mut new = Vec::new();
        for i in 0..20 {
            let id = format!("item-{:02}", i);
            let gold = if i % 2 == 0 { Label::Positive } else { Label::Negative };
            let wrong = if gold == Label::Positive { Label::Negative } else { Label::Positive };
            // items 0..6 improve, 6..8 stay wrong, rest stay correct
            let old_pred = if i < 8 { wrong } else { gold };
            let new_pred = if i < 6 { gold } else { old_pred };
            old.push(row(&id, gold, old_pred, Split::A));
            new.push(row(&id, gold, new_pred, Split::A));
        }
        (old, new)
    }

    #[test]
    fn test_six_discordant_wins_accept() {
        let (old, new) = paired_scenario();
        let decision = gate("old", &old, "new", &new, Split::A, 0.05).unwrap();
        assert_eq!(decision.joined, 20);
        assert_eq!(decision.eligible, 20);
        assert_eq!((decision.b, decision.c), (0, 6));
        assert_eq!(decision.both_wrong, 2);
        assert_eq!(decision.both_correct, 12);
        assert!((decision.mcnemar_p_value - 0.03125).abs() < 1e-12);
        assert!(decision.new_metrics.f1 >= decision.old_metrics.f1);
        assert_eq!(decision.verdict, Verdict::Accept);
        assert!(matches!(
            decision.reasons.as_slice(),
            [DecisionReason::SignificantImprovement { .. }]
        ));
    }

    #[test]
    fn test_same_inputs_same_decision_json() {
        let (old, new) = paired_scenario();
        let a = gate("old", &old, "new", &new, Split::A, 0.05).unwrap();
        let mut shuffled = new.clone();
        shuffled.reverse();
        let b = gate("old", &old, "new", &shuffled, Split::A, 0.05).unwrap();
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }

    #[test]
    fn test_strict_alpha_rejects_as_not_significant() {
        let (old, new) = paired_scenario();
        let decision = gate("old", &old, "new", &new, Split::A, 0.01).unwrap();
        assert_eq!(decision.verdict, Verdict::Reject);
        assert!(matches!(decision.reasons[0], DecisionReason::NotSignificant { .. }));
    }

    #[test]
    fn test_disjoint_runs_fail() {
        let old = vec![row("a", Label::Positive, Label::Positive, Split::A)];
        let new = vec![row("b", Label::Positive, Label::Positive, Split::A)];
        assert!(matches!(
            gate("old", &old, "new", &new, Split::A, 0.05),
            Err(GateError::EmptyJoin { .. })
        ));
    }

    #[test]
    fn test_gold_disagreement_fails() {
        let old = vec![row("a", Label::Positive, Label::Positive, Split::A)];
        let new = vec![row("a", Label::Negative, Label::Positive, Split::A)];
        assert!(matches!(
            gate("old", &old, "new", &new, Split::A, 0.05),
            Err(GateError::GoldDisagreement { count: 1, .. })
        ));
    }

    #[test]
    fn test_split_mismatch() {
        let old = vec![row("a", Label::Positive, Label::Positive, Split::B)];
        let new = vec![row("a", Label::Positive, Label::Positive, Split::A)];
        assert!(matches!(
            gate("old", &old, "new", &new, Split::A, 0.05),
            Err(GateError::SplitMismatch { found: Split::B, .. })
        ));
    }
}
