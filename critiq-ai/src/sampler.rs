//! Deterministic stratified sampler
//!
//! Items are bucketed by `(context_id, length_bucket)`. Within a bucket the
//! draw order is `sha256(seed ‖ "draw" ‖ item_id)`, and the selected items
//! are split by `sha256(seed ‖ "split" ‖ item_id)`, so the result depends
//! only on the seed and the set of items, never on corpus order.

use critiq_common::hash::hash_parts;
use critiq_common::schema::{token_count, Item};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use thiserror::Error;

/// Benchmark split
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Split {
    A,
    B,
}

impl Split {
    /// Accepts `A`, `a`, `split_a` and the same for B
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "a" | "split_a" => Some(Split::A),
            "b" | "split_b" => Some(Split::B),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Split::A => "A",
            Split::B => "B",
        }
    }

    /// Output role of this split in a sample run
    pub fn role(self) -> &'static str {
        match self {
            Split::A => "split_a",
            Split::B => "split_b",
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Token-count length buckets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LengthBuckets {
    boundaries: Vec<usize>,
    names: Vec<String>,
}

impl LengthBuckets {
    /// `boundaries` are the exclusive upper bounds of every bucket but the last
    pub fn new(boundaries: &[usize]) -> Result<Self, SampleError> {
        if boundaries.windows(2).any(|w| w[0] >= w[1]) || boundaries.first() == Some(&0) {
            return Err(SampleError::InvalidBoundaries(boundaries.to_vec()));
        }
        let names = if boundaries.len() == 2 {
            vec!["short".to_string(), "medium".to_string(), "long".to_string()]
        } else {
            let mut names = Vec::with_capacity(boundaries.len() + 1);
            let mut lo = 0;
            for &hi in boundaries {
                names.push(format!("tokens_{}_{}", lo, hi));
                lo = hi;
            }
            names.push(format!("tokens_{}_plus", lo));
            names
        };
        Ok(Self {
            boundaries: boundaries.to_vec(),
            names,
        })
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn bucket_of(&self, text: &str) -> &str {
        let tokens = token_count(text);
        let index = self.boundaries.iter().take_while(|b| tokens >= **b).count();
        &self.names[index]
    }
}

/// Stratification key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BucketKey {
    pub context_id: String,
    pub length_bucket: String,
}

impl BucketKey {
    pub fn new(context_id: impl Into<String>, length_bucket: impl Into<String>) -> Self {
        Self {
            context_id: context_id.into(),
            length_bucket: length_bucket.into(),
        }
    }

    /// Parse `context_id/length_bucket`
    pub fn parse(s: &str) -> Option<Self> {
        let (context_id, bucket) = s.rsplit_once('/')?;
        if context_id.is_empty() || bucket.is_empty() {
            return None;
        }
        Some(Self::new(context_id, bucket))
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.context_id, self.length_bucket)
    }
}

/// Requested sample size of the general pool
#[derive(Debug, Clone, PartialEq)]
pub enum SampleTargets {
    /// Allocated proportionally across buckets by largest remainder
    Total(usize),
    /// Explicit per-bucket counts; unlisted buckets get zero
    PerBucket(BTreeMap<BucketKey, usize>),
}

/// Sampler inputs besides the corpus
#[derive(Debug, Clone, PartialEq)]
pub struct SampleParams {
    pub seed: u64,
    pub targets: SampleTargets,
    pub focus_context: Option<String>,
    pub length_boundaries: Vec<usize>,
    pub split_ratio: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Shortfall {
    pub bucket: String,
    pub requested: usize,
    pub available: usize,
}

impl fmt::Display for Shortfall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (requested {}, available {})", self.bucket, self.requested, self.available)
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SampleError {
    #[error("Duplicate item_id in corpus: {0}")]
    DuplicateItemId(String),

    #[error("Split ratio must be in (0, 1), got {0}")]
    InvalidRatio(f64),

    #[error("Length boundaries must be positive and strictly increasing: {0:?}")]
    InvalidBoundaries(Vec<usize>),

    #[error("Requested total {requested} exceeds the general pool of {available} items")]
    TotalExceedsPool { requested: usize, available: usize },

    #[error("Target buckets not present in the general pool: {}", .0.join(", "))]
    UnknownBuckets(Vec<String>),

    #[error("Insufficient items: {}", format_shortfalls(.0))]
    Shortfalls(Vec<Shortfall>),
}

fn format_shortfalls(shortfalls: &[Shortfall]) -> String {
    shortfalls
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<SampleError> for critiq_common::Error {
    fn from(err: SampleError) -> Self {
        match err {
            SampleError::InvalidRatio(_) | SampleError::InvalidBoundaries(_) => {
                critiq_common::Error::Config(err.to_string())
            }
            _ => critiq_common::Error::Precondition(err.to_string()),
        }
    }
}

/// Per-bucket accounting
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BucketReport {
    #[serde(flatten)]
    pub bucket: BucketKey,
    pub focus: bool,
    pub available: usize,
    pub requested: usize,
    pub selected: usize,
    pub split_a: usize,
    pub split_b: usize,
}

/// Everything needed to audit a sample
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampleReport {
    pub seed: u64,
    pub tokenizer: &'static str,
    pub length_boundaries: Vec<usize>,
    pub length_buckets: Vec<String>,
    pub split_ratio: f64,
    pub focus_context: Option<String>,
    pub target_mode: &'static str,
    pub requested_total: usize,
    pub corpus_size: usize,
    pub pool_size: usize,
    pub focus_count: usize,
    pub selected_total: usize,
    pub split_a_count: usize,
    pub split_b_count: usize,
    pub buckets: Vec<BucketReport>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SampleOutcome {
    /// Sorted by `item_id`
    pub split_a: Vec<Item>,
    /// Sorted by `item_id`
    pub split_b: Vec<Item>,
    pub report: SampleReport,
}

/// Draw a stratified sample and split it in two
pub fn sample(corpus: &[Item], params: &SampleParams) -> Result<SampleOutcome, SampleError> {
    if !(params.split_ratio > 0.0 && params.split_ratio < 1.0) {
        return Err(SampleError::InvalidRatio(params.split_ratio));
    }
    let lengths = LengthBuckets::new(&params.length_boundaries)?;

    let mut seen = HashSet::with_capacity(corpus.len());
    for item in corpus {
        if !seen.insert(item.item_id.as_str()) {
            return Err(SampleError::DuplicateItemId(item.item_id.clone()));
        }
    }

    let mut pool: BTreeMap<BucketKey, Vec<&Item>> = BTreeMap::new();
    let mut focus: BTreeMap<BucketKey, Vec<&Item>> = BTreeMap::new();
    for item in corpus {
        let key = BucketKey::new(item.context_id.as_str(), lengths.bucket_of(&item.text));
        let is_focus = params.focus_context.as_deref() == Some(item.context_id.as_str());
        let target = if is_focus { &mut focus } else { &mut pool };
        target.entry(key).or_default().push(item);
    }

    let pool_size: usize = pool.values().map(Vec::len).sum();
    let focus_count: usize = focus.values().map(Vec::len).sum();
    let requested = allocate(&pool, pool_size, &params.targets)?;
    let requested_total: usize = requested.values().sum();

    let seed = params.seed.to_string();
    let mut split_a = Vec::new();
    let mut split_b = Vec::new();
    let mut buckets = Vec::new();

    let all_buckets = pool
        .iter()
        .map(|(key, items)| (key, items, false, requested.get(key).copied().unwrap_or(0)))
        .chain(focus.iter().map(|(key, items)| (key, items, true, items.len())));

    let mut drawn = Vec::new();
    for (key, items, is_focus, want) in all_buckets {
        let mut ranked: Vec<(String, &Item)> = items
            .iter()
            .map(|item| (hash_parts([seed.as_str(), "draw", item.item_id.as_str()]), *item))
            .collect();
        ranked.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.item_id.cmp(&b.1.item_id)));
        ranked.truncate(want);

        let mut by_split: Vec<(String, &Item)> = ranked
            .into_iter()
            .map(|(_, item)| (hash_parts([seed.as_str(), "split", item.item_id.as_str()]), item))
            .collect();
        by_split.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.item_id.cmp(&b.1.item_id)));
        drawn.push((key, items.len(), is_focus, want, by_split));
    }

    let selected_counts: Vec<usize> = drawn.iter().map(|(_, _, _, _, by_split)| by_split.len()).collect();
    let to_a_counts = split_counts(&selected_counts, params.split_ratio);

    for ((key, available, is_focus, want, by_split), to_a) in drawn.into_iter().zip(to_a_counts) {
        let selected = by_split.len();
        for (position, (_, item)) in by_split.into_iter().enumerate() {
            if position < to_a {
                split_a.push(item.clone());
            } else {
                split_b.push(item.clone());
            }
        }

        buckets.push(BucketReport {
            bucket: key.clone(),
            focus: is_focus,
            available,
            requested: want,
            selected,
            split_a: to_a,
            split_b: selected - to_a,
        });
    }

    split_a.sort_by(|a, b| a.item_id.cmp(&b.item_id));
    split_b.sort_by(|a, b| a.item_id.cmp(&b.item_id));

    let report = SampleReport {
        seed: params.seed,
        tokenizer: "unicode_whitespace",
        length_boundaries: params.length_boundaries.clone(),
        length_buckets: lengths.names().to_vec(),
        split_ratio: params.split_ratio,
        focus_context: params.focus_context.clone(),
        target_mode: match params.targets {
            SampleTargets::Total(_) => "total",
            SampleTargets::PerBucket(_) => "per_bucket",
        },
        requested_total,
        corpus_size: corpus.len(),
        pool_size,
        focus_count,
        selected_total: split_a.len() + split_b.len(),
        split_a_count: split_a.len(),
        split_b_count: split_b.len(),
        buckets,
    };

    tracing::info!(
        seed = params.seed,
        selected = report.selected_total,
        split_a = report.split_a_count,
        split_b = report.split_b_count,
        focus = focus_count,
        "Sample drawn"
    );

    Ok(SampleOutcome {
        split_a,
        split_b,
        report,
    })
}

/// Per-bucket draw counts for the general pool
fn allocate(
    pool: &BTreeMap<BucketKey, Vec<&Item>>,
    pool_size: usize,
    targets: &SampleTargets,
) -> Result<BTreeMap<BucketKey, usize>, SampleError> {
    match targets {
        SampleTargets::Total(total) => {
            if *total > pool_size {
                return Err(SampleError::TotalExceedsPool {
                    requested: *total,
                    available: pool_size,
                });
            }
            Ok(largest_remainder(pool, pool_size, *total))
        }
        SampleTargets::PerBucket(explicit) => {
            let unknown: Vec<String> = explicit
                .keys()
                .filter(|key| !pool.contains_key(*key))
                .map(|key| key.to_string())
                .collect();
            if !unknown.is_empty() {
                return Err(SampleError::UnknownBuckets(unknown));
            }
            let shortfalls: Vec<Shortfall> = explicit
                .iter()
                .filter_map(|(key, &want)| {
                    let available = pool.get(key).map(Vec::len).unwrap_or(0);
                    (want > available).then(|| Shortfall {
                        bucket: key.to_string(),
                        requested: want,
                        available,
                    })
                })
                .collect();
            if !shortfalls.is_empty() {
                return Err(SampleError::Shortfalls(shortfalls));
            }
            Ok(explicit.clone())
        }
    }
}

/// Split-A count per bucket
///
/// `round(total * ratio)` is apportioned over the buckets by largest
/// remainder of `selected * ratio`; ties go to the earlier bucket.
fn split_counts(selected: &[usize], ratio: f64) -> Vec<usize> {
    let total: usize = selected.iter().sum();
    let target = ((total as f64) * ratio).round() as usize;
    let target = target.min(total);

    let mut counts: Vec<usize> = Vec::with_capacity(selected.len());
    let mut remainders: Vec<(f64, usize)> = Vec::with_capacity(selected.len());
    for (index, &k) in selected.iter().enumerate() {
        let quota = (k as f64) * ratio;
        let floor = (quota.floor() as usize).min(k);
        counts.push(floor);
        if floor < k {
            remainders.push((quota - floor as f64, index));
        }
    }

    let assigned: usize = counts.iter().sum();
    remainders.sort_by(|a, b| b.0.total_cmp(&a.0));
    for (_, index) in remainders.into_iter().take(target.saturating_sub(assigned)) {
        counts[index] += 1;
    }
    counts
}

/// Hamilton apportionment; remainder ties go to the smaller bucket key
fn largest_remainder(
    pool: &BTreeMap<BucketKey, Vec<&Item>>,
    pool_size: usize,
    total: usize,
) -> BTreeMap<BucketKey, usize> {
    let mut allocation = BTreeMap::new();
    if pool_size == 0 {
        return allocation;
    }

    let mut remainders = Vec::with_capacity(pool.len());
    let mut assigned = 0;
    for (key, items) in pool {
        let scaled = (total as u128) * (items.len() as u128);
        let floor = (scaled / pool_size as u128) as usize;
        let remainder = scaled % pool_size as u128;
        allocation.insert(key.clone(), floor);
        assigned += floor;
        remainders.push((remainder, key));
    }

    // BTreeMap iteration already ordered keys ascending; stable sort keeps that for ties
    remainders.sort_by(|a, b| b.0.cmp(&a.0));
    for (_, key) in remainders.into_iter().take(total - assigned) {
        if let Some(count) = allocation.get_mut(key) {
            *count += 1;
        }
    }
    allocation
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str, context: &str, tokens: usize) -> Item {
        Item {
            item_id: id.to_string(),
            context_id: context.to_string(),
            text: vec!["w"; tokens].join(" "),
            numeric_filter_score: 0.0,
        }
    }

    fn params(targets: SampleTargets) -> SampleParams {
        SampleParams {
            seed: 7,
            targets,
            focus_context: None,
            length_boundaries: vec![16, 48],
            split_ratio: 0.5,
        }
    }

    #[test]
    fn test_bucket_boundaries() {
        let lengths = LengthBuckets::new(&[16, 48]).unwrap();
        assert_eq!(lengths.bucket_of(&vec!["w"; 15].join(" ")), "short");
        assert_eq!(lengths.bucket_of(&vec!["w"; 16].join(" ")), "medium");
        assert_eq!(lengths.bucket_of(&vec!["w"; 48].join(" ")), "long");
        assert_eq!(lengths.bucket_of(""), "short");
    }

    #[test]
    fn test_generic_bucket_names() {
        let lengths = LengthBuckets::new(&[10]).unwrap();
        assert_eq!(lengths.names(), &["tokens_0_10".to_string(), "tokens_10_plus".to_string()]);
        assert!(LengthBuckets::new(&[10, 10]).is_err());
    }

    #[test]
    fn test_largest_remainder_allocation() {
        // 5 / 3 / 2 items; total 5 → quotas 2.5 / 1.5 / 1.0
        let mut corpus = Vec::new();
        for i in 0..5 {
            corpus.push(item(&format!("a{}", i), "A", 3));
        }
        for i in 0..3 {
            corpus.push(item(&format!("b{}", i), "B", 3));
        }
        for i in 0..2 {
            corpus.push(item(&format!("c{}", i), "C", 3));
        }
        let outcome = sample(&corpus, &params(SampleTargets::Total(5))).unwrap();
        let requested: Vec<usize> = outcome.report.buckets.iter().map(|b| b.requested).collect();
        // Tie between A and B remainders goes to A (smaller key)
        assert_eq!(requested, vec![3, 1, 1]);
        assert_eq!(outcome.report.selected_total, 5);
    }

    #[test]
    fn test_per_bucket_shortfalls_all_reported() {
        let corpus = vec![item("a", "A", 3), item("b", "B", 3)];
        let mut targets = BTreeMap::new();
        targets.insert(BucketKey::new("A", "short"), 2);
        targets.insert(BucketKey::new("B", "short"), 5);
        let err = sample(&corpus, &params(SampleTargets::PerBucket(targets))).unwrap_err();
        match err {
            SampleError::Shortfalls(shortfalls) => assert_eq!(shortfalls.len(), 2),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unknown_bucket_rejected() {
        let corpus = vec![item("a", "A", 3)];
        let mut targets = BTreeMap::new();
        targets.insert(BucketKey::new("A", "long"), 1);
        assert!(matches!(
            sample(&corpus, &params(SampleTargets::PerBucket(targets))),
            Err(SampleError::UnknownBuckets(_))
        ));
    }

    #[test]
    fn test_total_exceeding_pool_rejected() {
        let corpus = vec![item("a", "A", 3)];
        assert!(matches!(
            sample(&corpus, &params(SampleTargets::Total(2))),
            Err(SampleError::TotalExceedsPool { requested: 2, available: 1 })
        ));
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let corpus = vec![item("a", "A", 3), item("a", "B", 3)];
        assert_eq!(
            sample(&corpus, &params(SampleTargets::Total(1))).unwrap_err(),
            SampleError::DuplicateItemId("a".into())
        );
    }

    #[test]
    fn test_focus_context_kept_whole() {
        let mut corpus: Vec<Item> = (0..10).map(|i| item(&format!("g{}", i), "G", 3)).collect();
        corpus.extend((0..4).map(|i| item(&format!("f{}", i), "F", 3)));
        let mut p = params(SampleTargets::Total(6));
        p.focus_context = Some("F".into());

        let outcome = sample(&corpus, &p).unwrap();
        assert_eq!(outcome.report.pool_size, 10);
        assert_eq!(outcome.report.focus_count, 4);
        assert_eq!(outcome.report.selected_total, 10);
        let focus_selected = outcome
            .split_a
            .iter()
            .chain(outcome.split_b.iter())
            .filter(|i| i.context_id == "F")
            .count();
        assert_eq!(focus_selected, 4);
    }

    #[test]
    fn test_split_ratio_holds_across_single_item_buckets() {
        // 12 contexts x 2 items; drawing 12 leaves one item per bucket
        let corpus: Vec<Item> = (0..24)
            .map(|i| item(&format!("s{:02}", i), &format!("C{:02}", i / 2), 3))
            .collect();
        let outcome = sample(&corpus, &params(SampleTargets::Total(12))).unwrap();
        assert!(outcome.report.buckets.iter().all(|b| b.selected == 1));
        assert_eq!(outcome.split_a.len(), 6);
        assert_eq!(outcome.split_b.len(), 6);
        let per_bucket_a: usize = outcome.report.buckets.iter().map(|b| b.split_a).sum();
        assert_eq!(per_bucket_a, 6);
    }

    #[test]
    fn test_split_ratio_within_one_of_target() {
        // Odd bucket sizes: 3 + 5 + 1 + 7 + 1 = 17 items
        let sizes = [3usize, 5, 1, 7, 1];
        let mut corpus = Vec::new();
        for (b, &n) in sizes.iter().enumerate() {
            for i in 0..n {
                corpus.push(item(&format!("b{}-{}", b, i), &format!("K{}", b), 3));
            }
        }
        for ratio in [0.3, 0.5, 0.7] {
            let mut p = params(SampleTargets::Total(17));
            p.split_ratio = ratio;
            let outcome = sample(&corpus, &p).unwrap();
            let expected = (17.0 * ratio).round() as i64;
            assert!(
                (outcome.split_a.len() as i64 - expected).abs() <= 1,
                "ratio {}: split_a {} expected about {}",
                ratio,
                outcome.split_a.len(),
                expected
            );
            assert_eq!(outcome.split_a.len() + outcome.split_b.len(), 17);
        }
    }

    #[test]
    fn test_split_counts_apportion_remainders() {
        assert_eq!(split_counts(&[1, 1, 1, 1], 0.5), vec![1, 1, 0, 0]);
        assert_eq!(split_counts(&[3, 5], 0.5), vec![2, 2]);
        assert_eq!(split_counts(&[4, 0, 2], 0.5), vec![2, 0, 1]);
        assert!(split_counts(&[], 0.5).is_empty());
    }

    #[test]
    fn test_split_ratio_rounding() {
        let corpus: Vec<Item> = (0..5).map(|i| item(&format!("x{}", i), "X", 3)).collect();
        let mut p = params(SampleTargets::Total(5));
        p.split_ratio = 0.6;
        let outcome = sample(&corpus, &p).unwrap();
        assert_eq!(outcome.split_a.len(), 3);
        assert_eq!(outcome.split_b.len(), 2);
    }
}
