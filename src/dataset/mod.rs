pub mod manifest;

use std::collections::BTreeMap;

use manifest::ManifestRow;

/// Train/test partition of the fragment list. Piece-disjoint by
/// construction: every fragment of a piece lands on one side.
#[derive(Debug, Default)]
pub struct DatasetSplit {
    pub train: Vec<ManifestRow>,
    pub test: Vec<ManifestRow>,
}

#[derive(Debug, Clone, Copy)]
pub struct SplitOptions {
    /// Target share of fragments (by count, not by piece) in the test
    /// set.
    pub test_fraction: f64,
    /// Drop fragments whose repeat pointer is set before grouping.
    pub remove_duplicates: bool,
}

impl Default for SplitOptions {
    fn default() -> Self {
        Self {
            test_fraction: 0.1,
            remove_duplicates: true,
        }
    }
}

struct PieceGroup {
    pos: usize,
    neg: usize,
    rows: Vec<ManifestRow>,
}

/// Partition fragments into train/test sets, keeping whole pieces
/// together and greedily balancing the positive/negative label counts
/// of the test side.
///
/// At each step the unassigned piece minimizing
/// `|running_pos - running_neg|` after inclusion is moved to the test
/// set; ties prefer fewer fragments, then the lower piece id. Selection
/// stops once the test set holds `test_fraction` of all fragments.
/// The procedure is fully deterministic; no randomness is involved.
pub fn split(rows: &[ManifestRow], opts: &SplitOptions) -> DatasetSplit {
    let kept: Vec<&ManifestRow> = rows
        .iter()
        .filter(|r| !(opts.remove_duplicates && r.is_duplicate()))
        .collect();

    // BTreeMap keeps piece iteration in id order for determinism.
    let mut groups: BTreeMap<u32, PieceGroup> = BTreeMap::new();
    for row in kept {
        let group = groups.entry(row.id).or_insert_with(|| PieceGroup {
            pos: 0,
            neg: 0,
            rows: Vec::new(),
        });
        if row.emotion_label().is_positive() {
            group.pos += 1;
        } else {
            group.neg += 1;
        }
        group.rows.push(row.clone());
    }

    let total: usize = groups.values().map(|g| g.rows.len()).sum();
    let target = opts.test_fraction * total as f64;

    let mut split = DatasetSplit::default();
    let mut test_count = 0usize;
    let mut running_pos = 0i64;
    let mut running_neg = 0i64;

    while (test_count as f64) < target && !groups.is_empty() {
        let best = groups
            .iter()
            .map(|(&id, g)| {
                let balance =
                    (running_pos + g.pos as i64 - running_neg - g.neg as i64).abs();
                (balance, g.rows.len(), id)
            })
            .min()
            .map(|(_, _, id)| id);

        let Some(group) = best.and_then(|id| groups.remove(&id)) else {
            break;
        };
        test_count += group.rows.len();
        running_pos += group.pos as i64;
        running_neg += group.neg as i64;
        split.test.extend(group.rows);
    }

    for (_, group) in groups {
        split.train.extend(group.rows);
    }

    split.train.sort_by_key(|r| (r.id, r.part));
    split.test.sort_by_key(|r| (r.id, r.part));
    split
}
