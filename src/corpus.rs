//! Parallel corpus loading and seeded partitioning.

use std::fmt;
use std::path::Path;

use anyhow::{anyhow, Context};
use encoding_rs::UTF_8;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// One aligned line pair. Both sides are trimmed and non-empty once filtered.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SentencePair {
    pub source_text: String,
    pub target_text: String,
}

impl SentencePair {
    pub fn new(source_text: impl Into<String>, target_text: impl Into<String>) -> Self {
        Self {
            source_text: source_text.into(),
            target_text: target_text.into(),
        }
    }

    pub fn is_complete(&self) -> bool {
        !self.source_text.is_empty() && !self.target_text.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PartitionRole {
    Train,
    Valid,
    Test,
}

impl PartitionRole {
    pub const ALL: [PartitionRole; 3] = [Self::Train, Self::Valid, Self::Test];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Valid => "valid",
            Self::Test => "test",
        }
    }

    pub fn file_name(&self) -> String {
        format!("{}.tsv", self.name())
    }
}

impl fmt::Display for PartitionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Debug)]
pub struct Partition {
    pub role: PartitionRole,
    pub records: Vec<SentencePair>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SplitPlan {
    pub train_size: usize,
    pub valid_size: usize,
    pub test_size: usize,
    pub seed: u64,
}

impl SplitPlan {
    /// `None` when the sizes do not fit in `usize` together.
    pub fn total(&self) -> Option<usize> {
        self.train_size.checked_add(self.holdout()?)
    }

    pub fn holdout(&self) -> Option<usize> {
        self.valid_size.checked_add(self.test_size)
    }
}

impl Default for SplitPlan {
    fn default() -> Self {
        Self {
            train_size: 25_000,
            valid_size: 5_000,
            test_size: 5_000,
            seed: 1234,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PairingStats {
    pub source_lines: usize,
    pub target_lines: usize,
    pub kept: usize,
    pub dropped_empty: usize,
    pub dropped_missing: usize,
}

pub fn read_lines(path: &Path) -> anyhow::Result<Vec<String>> {
    let bytes = std::fs::read(path).with_context(|| format!("read lines: {}", path.display()))?;
    let text = UTF_8
        .decode_without_bom_handling_and_without_replacement(&bytes)
        .ok_or_else(|| anyhow!("invalid utf-8: {}", path.display()))?;
    Ok(split_universal_lines(&text)
        .into_iter()
        .map(|line| line.trim().to_string())
        .collect())
}

/// Splits on `\n`, `\r\n` and lone `\r`. A trailing terminator does not yield an empty line.
pub fn split_universal_lines(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let bytes = text.as_bytes();
    let mut start = 0usize;
    let mut i = 0usize;
    while i < bytes.len() {
        match bytes[i] {
            b'\n' => {
                out.push(&text[start..i]);
                i += 1;
                start = i;
            }
            b'\r' => {
                out.push(&text[start..i]);
                i += if bytes.get(i + 1) == Some(&b'\n') { 2 } else { 1 };
                start = i;
            }
            _ => i += 1,
        }
    }
    if start < bytes.len() {
        out.push(&text[start..]);
    }
    out
}

/// Zips two line sequences by position and keeps the complete pairs.
///
/// Unequal lengths are an error unless `allow_unaligned`, in which case the positions
/// present on only one side count as missing and are dropped.
pub fn pair_lines(
    source: Vec<String>,
    target: Vec<String>,
    allow_unaligned: bool,
) -> anyhow::Result<(Vec<SentencePair>, PairingStats)> {
    let mut stats = PairingStats {
        source_lines: source.len(),
        target_lines: target.len(),
        ..PairingStats::default()
    };
    if source.len() != target.len() {
        if !allow_unaligned {
            return Err(anyhow!(
                "unaligned input: {} source lines vs {} target lines",
                source.len(),
                target.len()
            ));
        }
        stats.dropped_missing = source.len().abs_diff(target.len());
    }

    let mut pairs = Vec::with_capacity(source.len().min(target.len()));
    for (s, t) in source.into_iter().zip(target) {
        let pair = SentencePair::new(s.trim(), t.trim());
        if pair.is_complete() {
            pairs.push(pair);
        } else {
            stats.dropped_empty += 1;
        }
    }
    stats.kept = pairs.len();
    Ok((pairs, stats))
}

/// Draws two disjoint subsets of exactly `first_size` and `second_size` items.
///
/// A seeded permutation decides membership: its first `second_size` entries form the
/// second subset and the next `first_size` the first. Whatever is left is discarded.
pub fn seeded_split<T: Clone>(
    items: &[T],
    first_size: usize,
    second_size: usize,
    seed: u64,
) -> anyhow::Result<(Vec<T>, Vec<T>)> {
    if first_size == 0 || second_size == 0 {
        return Err(anyhow!(
            "split sizes must be positive (got {first_size} and {second_size})"
        ));
    }
    let needed = first_size
        .checked_add(second_size)
        .ok_or_else(|| anyhow!("split sizes overflow: {first_size} + {second_size}"))?;
    if needed > items.len() {
        return Err(anyhow!(
            "not enough records: have {}, need {} ({} + {})",
            items.len(),
            needed,
            first_size,
            second_size
        ));
    }

    let mut order: Vec<usize> = (0..items.len()).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    order.shuffle(&mut rng);

    let second = order[..second_size].iter().map(|&i| items[i].clone()).collect();
    let first = order[second_size..needed]
        .iter()
        .map(|&i| items[i].clone())
        .collect();
    Ok((first, second))
}

/// Two-stage split: `train` vs holdout, then holdout into `valid` and `test`.
pub fn split_corpus(pool: &[SentencePair], plan: &SplitPlan) -> anyhow::Result<[Partition; 3]> {
    let (Some(total), Some(holdout)) = (plan.total(), plan.holdout()) else {
        return Err(anyhow!(
            "split sizes overflow: {} train + {} valid + {} test",
            plan.train_size,
            plan.valid_size,
            plan.test_size
        ));
    };
    if pool.len() < total {
        return Err(anyhow!(
            "split: pool has {} records, need {} ({} train + {} valid + {} test)",
            pool.len(),
            total,
            plan.train_size,
            plan.valid_size,
            plan.test_size
        ));
    }
    let (train, holdout) = seeded_split(pool, plan.train_size, holdout, plan.seed)
        .context("split train/holdout")?;
    let (valid, test) = seeded_split(&holdout, plan.valid_size, plan.test_size, plan.seed)
        .context("split valid/test")?;
    Ok([
        Partition {
            role: PartitionRole::Train,
            records: train,
        },
        Partition {
            role: PartitionRole::Valid,
            records: valid,
        },
        Partition {
            role: PartitionRole::Test,
            records: test,
        },
    ])
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn numbered_pool(n: usize) -> Vec<SentencePair> {
        (0..n)
            .map(|i| SentencePair::new(format!("src {i}"), format!("tgt {i}")))
            .collect()
    }

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn universal_newlines() {
        assert_eq!(split_universal_lines("a\nb\r\nc\rd"), vec!["a", "b", "c", "d"]);
        assert_eq!(split_universal_lines("a\n"), vec!["a"]);
        assert_eq!(split_universal_lines("a\n\nb\n"), vec!["a", "", "b"]);
        assert!(split_universal_lines("").is_empty());
    }

    #[test]
    fn read_lines_trims_and_rejects_bad_utf8() {
        let dir = tempfile::tempdir().expect("tempdir");
        let good = dir.path().join("a.en");
        std::fs::write(&good, "  hello \n\t\nworld\r\n").expect("write");
        assert_eq!(read_lines(&good).expect("read"), strings(&["hello", "", "world"]));

        let bad = dir.path().join("b.en");
        std::fs::write(&bad, [0x66, 0xff, 0x0a]).expect("write");
        assert!(read_lines(&bad).is_err());
        assert!(read_lines(&dir.path().join("missing")).is_err());
    }

    #[test]
    fn drops_pairs_with_an_empty_side() {
        let (pairs, stats) = pair_lines(
            strings(&["hello", "", "world"]),
            strings(&["hej", "tom", "verden"]),
            false,
        )
        .expect("pair");
        assert_eq!(
            pairs,
            vec![SentencePair::new("hello", "hej"), SentencePair::new("world", "verden")]
        );
        assert_eq!(stats.kept, 2);
        assert_eq!(stats.dropped_empty, 1);
    }

    #[test]
    fn unaligned_inputs_fail_unless_allowed() {
        let err = pair_lines(strings(&["a", "b"]), strings(&["x"]), false).unwrap_err();
        assert!(err.to_string().contains("unaligned"));

        let (pairs, stats) = pair_lines(strings(&["a", "b"]), strings(&["x"]), true).expect("pair");
        assert_eq!(pairs, vec![SentencePair::new("a", "x")]);
        assert_eq!(stats.dropped_missing, 1);
    }

    #[test]
    fn seeded_split_is_exact_disjoint_and_reproducible() {
        let items: Vec<u32> = (0..100).collect();
        let (a, b) = seeded_split(&items, 60, 30, 1234).expect("split");
        assert_eq!(a.len(), 60);
        assert_eq!(b.len(), 30);
        let sa: HashSet<_> = a.iter().collect();
        let sb: HashSet<_> = b.iter().collect();
        assert!(sa.is_disjoint(&sb));

        let (a2, b2) = seeded_split(&items, 60, 30, 1234).expect("split");
        assert_eq!(a, a2);
        assert_eq!(b, b2);

        let (a3, _) = seeded_split(&items, 60, 30, 99).expect("split");
        assert_ne!(a, a3);
    }

    #[test]
    fn seeded_split_rejects_impossible_sizes() {
        let items: Vec<u32> = (0..10).collect();
        assert!(seeded_split(&items, 8, 3, 1).is_err());
        assert!(seeded_split(&items, 0, 3, 1).is_err());
        assert!(seeded_split(&items, 7, 3, 1).is_ok());
        assert!(seeded_split(&items, usize::MAX, 3, 1).is_err());
    }

    #[test]
    fn split_corpus_sizes_and_membership() {
        let pool = numbered_pool(500);
        let plan = SplitPlan {
            train_size: 250,
            valid_size: 50,
            test_size: 50,
            seed: 1234,
        };
        let parts = split_corpus(&pool, &plan).expect("split");
        let sizes: Vec<usize> = parts.iter().map(|p| p.records.len()).collect();
        assert_eq!(sizes, vec![250, 50, 50]);

        let pool_set: HashSet<_> = pool.iter().collect();
        let mut seen = HashSet::new();
        for part in &parts {
            for r in &part.records {
                assert!(r.is_complete());
                assert!(pool_set.contains(r));
                assert!(seen.insert(r.clone()), "record in two partitions: {r:?}");
            }
        }
    }

    #[test]
    fn exact_pool_size_leaves_nothing_behind() {
        let pool = numbered_pool(35_000);
        let parts = split_corpus(&pool, &SplitPlan::default()).expect("split");
        let sizes: Vec<usize> = parts.iter().map(|p| p.records.len()).collect();
        assert_eq!(sizes, vec![25_000, 5_000, 5_000]);

        let used: HashSet<_> = parts.iter().flat_map(|p| p.records.iter()).collect();
        assert_eq!(used.len(), pool.len());
    }

    #[test]
    fn short_pool_is_a_data_error() {
        let pool = numbered_pool(34_999);
        let err = split_corpus(&pool, &SplitPlan::default()).unwrap_err();
        assert!(err.to_string().contains("need 35000"), "{err}");
    }

    #[test]
    fn oversized_plan_is_an_error_not_a_panic() {
        let pool = numbered_pool(10);
        let plan = SplitPlan {
            train_size: usize::MAX,
            valid_size: usize::MAX,
            test_size: 1,
            seed: 1234,
        };
        assert_eq!(plan.total(), None);
        let err = split_corpus(&pool, &plan).unwrap_err();
        assert!(err.to_string().contains("overflow"), "{err}");
    }
}
