pub mod tsmath;

use clap::ValueEnum;
use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConsensusError {
    #[error("no rater series to cluster")]
    NoSeries,
    #[error("selected cluster {0} is empty")]
    EmptyCluster(usize),
}

/// How rater curves are grouped before picking the majority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Partition by the sign of each curve's mean (>= 0 vs < 0).
    SignPartition,
    /// Time-series k-means with a fixed cluster count.
    Kmeans,
}

/// Distance between two curves, used by k-means assignment and
/// nearest-to-centroid extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Distance {
    Euclidean,
    /// Dynamic time warping (elastic alignment).
    Dtw,
}

impl Distance {
    fn apply(self, a: &[f64], b: &[f64]) -> f64 {
        match self {
            Distance::Euclidean => tsmath::euclidean(a, b),
            Distance::Dtw => tsmath::dtw(a, b),
        }
    }
}

/// How the representative curve is derived from the winning cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Extraction {
    /// Per-measure arithmetic mean of the cluster members.
    Mean,
    /// Per-measure median of the cluster members.
    Median,
    /// The member curve closest to the cluster's mean curve.
    NearestCentroid,
}

#[derive(Debug, Clone, Copy)]
pub struct ConsensusOptions {
    pub strategy: Strategy,
    pub distance: Distance,
    pub extraction: Extraction,
    /// Cluster count for k-means.
    pub clusters: usize,
    /// Moving-average window applied before k-means assignment.
    /// Clustering only; extraction always uses the raw curves.
    pub smoothing: usize,
    pub max_iterations: usize,
}

impl Default for ConsensusOptions {
    fn default() -> Self {
        Self {
            strategy: Strategy::SignPartition,
            distance: Distance::Euclidean,
            extraction: Extraction::Mean,
            clusters: 2,
            smoothing: 2,
            max_iterations: 50,
        }
    }
}

/// Outcome of picking the majority cluster. The tie flag is returned to
/// the caller instead of being logged here, so selection stays pure.
#[derive(Debug, Clone)]
pub struct Selection {
    /// Index of the winning cluster.
    pub index: usize,
    /// True when more than one cluster had the maximal size.
    pub tie: bool,
    /// The tied candidates as (cluster index, |grand mean|) pairs.
    pub candidates: Vec<(usize, f64)>,
}

/// Collapse a set of rater curves into one representative curve.
///
/// Returns the curve together with the `Selection` describing which
/// cluster won and whether a size tie had to be broken. The returned
/// curve always has the same length as the input curves.
pub fn consensus_curve(
    series: &[Vec<f64>],
    opts: &ConsensusOptions,
) -> Result<(Vec<f64>, Selection), ConsensusError> {
    if series.is_empty() {
        return Err(ConsensusError::NoSeries);
    }

    let clusters = match opts.strategy {
        Strategy::SignPartition => sign_partition(series),
        Strategy::Kmeans => kmeans(series, opts),
    };

    let selection = select_majority(&clusters, series);

    let members: Vec<&[f64]> = clusters[selection.index]
        .iter()
        .map(|&i| series[i].as_slice())
        .collect();
    if members.is_empty() {
        return Err(ConsensusError::EmptyCluster(selection.index));
    }

    // A singleton cluster is its own representative under any method.
    if members.len() == 1 {
        return Ok((members[0].to_vec(), selection));
    }

    let curve = match opts.extraction {
        Extraction::Mean => tsmath::pointwise_mean(&members),
        Extraction::Median => tsmath::pointwise_median(&members),
        Extraction::NearestCentroid => {
            let centroid = tsmath::pointwise_mean(&members);
            let nearest = members
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| {
                    let da = opts.distance.apply(a, &centroid);
                    let db = opts.distance.apply(b, &centroid);
                    da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|(i, _)| i)
                .unwrap_or(0);
            members[nearest].to_vec()
        }
    };

    Ok((curve, selection))
}

/// Split curves into [negative-mean, non-negative-mean] groups of
/// indices into `series`.
fn sign_partition(series: &[Vec<f64>]) -> Vec<Vec<usize>> {
    let mut negative = Vec::new();
    let mut positive = Vec::new();

    for (i, s) in series.iter().enumerate() {
        if tsmath::mean(s) >= 0.0 {
            positive.push(i);
        } else {
            negative.push(i);
        }
    }

    vec![negative, positive]
}

/// Lloyd's k-means over the (smoothed) curves with deterministic
/// initialization: the first k curves seed the centroids, so repeated
/// runs over the same input produce identical clusters.
fn kmeans(series: &[Vec<f64>], opts: &ConsensusOptions) -> Vec<Vec<usize>> {
    let k = opts.clusters.max(1).min(series.len());

    let smoothed: Vec<Vec<f64>> = series
        .iter()
        .map(|s| tsmath::moving_average(s, opts.smoothing))
        .collect();

    let mut centroids: Vec<Vec<f64>> = smoothed[..k].to_vec();
    let mut assignment = vec![0usize; smoothed.len()];

    for _ in 0..opts.max_iterations {
        let mut changed = false;

        for (i, s) in smoothed.iter().enumerate() {
            let nearest = centroids
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| {
                    let da = opts.distance.apply(s, a);
                    let db = opts.distance.apply(s, b);
                    da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|(c, _)| c)
                .unwrap_or(0);
            if assignment[i] != nearest {
                assignment[i] = nearest;
                changed = true;
            }
        }

        if !changed {
            break;
        }

        // Recompute centroids; a cluster that lost all members keeps
        // its previous centroid.
        for (c, centroid) in centroids.iter_mut().enumerate() {
            let members: Vec<&[f64]> = smoothed
                .iter()
                .enumerate()
                .filter(|(i, _)| assignment[*i] == c)
                .map(|(_, s)| s.as_slice())
                .collect();
            if !members.is_empty() {
                *centroid = tsmath::pointwise_mean(&members);
            }
        }
    }

    let mut clusters = vec![Vec::new(); k];
    for (i, &c) in assignment.iter().enumerate() {
        clusters[c].push(i);
    }
    clusters
}

/// Pick the largest cluster. Equal sizes are broken by the higher
/// absolute grand mean of the member curves, then by the lowest cluster
/// index; the tie is reported, not resolved silently.
fn select_majority(clusters: &[Vec<usize>], series: &[Vec<f64>]) -> Selection {
    let max_len = clusters.iter().map(|c| c.len()).max().unwrap_or(0);

    let candidates: Vec<(usize, f64)> = clusters
        .iter()
        .enumerate()
        .filter(|(_, c)| c.len() == max_len)
        .map(|(i, c)| (i, grand_mean_abs(c, series)))
        .collect();

    let mut winner = candidates[0];
    for &(i, score) in &candidates[1..] {
        if score > winner.1 {
            winner = (i, score);
        }
    }

    Selection {
        index: winner.0,
        tie: candidates.len() > 1,
        candidates,
    }
}

/// Absolute value of the mean over every value of every member curve.
fn grand_mean_abs(cluster: &[usize], series: &[Vec<f64>]) -> f64 {
    let mut sum = 0.0;
    let mut count = 0usize;
    for &i in cluster {
        sum += series[i].iter().sum::<f64>();
        count += series[i].len();
    }
    if count == 0 {
        0.0
    } else {
        (sum / count as f64).abs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> ConsensusOptions {
        ConsensusOptions::default()
    }

    #[test]
    fn test_sign_partition_majority_wins() {
        let series = vec![
            vec![0.5, 0.6, 0.4],
            vec![0.3, 0.2, 0.4],
            vec![-0.5, -0.6, -0.4],
        ];
        let (curve, sel) = consensus_curve(&series, &opts()).unwrap();
        assert!(!sel.tie);
        assert_eq!(sel.index, 1); // positive group
        assert!((curve[0] - 0.4).abs() < 1e-12);
        assert_eq!(curve.len(), 3);
    }

    #[test]
    fn test_tie_broken_by_higher_abs_mean_and_reported() {
        // One strong negative rater vs one weak positive rater.
        let series = vec![vec![-0.8, -0.8], vec![0.1, 0.1]];
        let (curve, sel) = consensus_curve(&series, &opts()).unwrap();
        assert!(sel.tie);
        assert_eq!(sel.candidates.len(), 2);
        assert_eq!(sel.index, 0); // negative group has |mean| 0.8 > 0.1
        assert_eq!(curve, vec![-0.8, -0.8]);
    }

    #[test]
    fn test_singleton_cluster_returns_sole_member() {
        let series = vec![vec![0.2, -0.7, 0.1]];
        for extraction in [Extraction::Mean, Extraction::Median, Extraction::NearestCentroid] {
            let o = ConsensusOptions { extraction, ..opts() };
            let (curve, _) = consensus_curve(&series, &o).unwrap();
            assert_eq!(curve, series[0]);
        }
    }

    #[test]
    fn test_no_series_fails() {
        assert!(matches!(
            consensus_curve(&[], &opts()),
            Err(ConsensusError::NoSeries)
        ));
    }

    #[test]
    fn test_median_extraction_ignores_outlier() {
        let series = vec![
            vec![0.5, 0.5],
            vec![0.5, 0.5],
            vec![0.9, 0.9], // outlier rater, same sign
        ];
        let o = ConsensusOptions { extraction: Extraction::Median, ..opts() };
        let (curve, _) = consensus_curve(&series, &o).unwrap();
        assert_eq!(curve, vec![0.5, 0.5]);
    }

    #[test]
    fn test_nearest_centroid_picks_a_member() {
        let series = vec![
            vec![0.4, 0.4, 0.4],
            vec![0.6, 0.6, 0.6],
            vec![0.5, 0.49, 0.51],
        ];
        let o = ConsensusOptions { extraction: Extraction::NearestCentroid, ..opts() };
        let (curve, _) = consensus_curve(&series, &o).unwrap();
        // Representative must be one of the raw input curves.
        assert!(series.contains(&curve));
        // The middle-of-the-road rater is closest to the mean.
        assert_eq!(curve, series[2]);
    }

    #[test]
    fn test_kmeans_separates_opposed_groups() {
        let series = vec![
            vec![0.8, 0.7, 0.9, 0.8],
            vec![0.7, 0.8, 0.8, 0.9],
            vec![-0.8, -0.7, -0.9, -0.8],
        ];
        let o = ConsensusOptions { strategy: Strategy::Kmeans, ..opts() };
        let (curve, sel) = consensus_curve(&series, &o).unwrap();
        assert!(!sel.tie);
        // Majority cluster is the two positive raters; consensus keeps
        // the full measure count despite the smoothing window.
        assert_eq!(curve.len(), 4);
        assert!(curve.iter().all(|&v| v > 0.0));
    }

    #[test]
    fn test_kmeans_deterministic() {
        let series = vec![
            vec![0.1, 0.2, 0.3, 0.1],
            vec![0.2, 0.1, 0.2, 0.2],
            vec![-0.4, -0.5, -0.3, -0.4],
            vec![0.15, 0.18, 0.25, 0.12],
        ];
        let o = ConsensusOptions { strategy: Strategy::Kmeans, ..opts() };
        let (a, _) = consensus_curve(&series, &o).unwrap();
        let (b, _) = consensus_curve(&series, &o).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_kmeans_dtw_assignment() {
        let series = vec![
            vec![0.0, 0.9, 0.0, 0.0, 0.0],
            vec![0.0, 0.0, 0.9, 0.0, 0.0], // same bump, shifted
            vec![-0.9, -0.9, -0.9, -0.9, -0.9],
        ];
        let o = ConsensusOptions {
            strategy: Strategy::Kmeans,
            distance: Distance::Dtw,
            smoothing: 1,
            ..opts()
        };
        let (curve, _) = consensus_curve(&series, &o).unwrap();
        // The two shifted-bump raters should cluster together.
        assert!(tsmath::mean(&curve) > 0.0);
    }
}
