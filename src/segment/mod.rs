use std::collections::VecDeque;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// How each measure's (valence, arousal) pair maps to a label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LabelScheme {
    /// Independent sign bits per dimension, with context resolution
    /// for near-zero values.
    Signs,
    /// Four moods partitioning the valence/arousal plane by angle.
    Mood,
}

/// Quadrant-style mood labels derived from the angle of the
/// (valence, arousal) vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mood {
    Happy,
    Agitated,
    Suspense,
    Calm,
}

impl Mood {
    /// Angle of (v, a) in degrees, wrapped to [0, 360):
    /// [0, 90) happy, [90, 135) agitated, [135, 270) suspense,
    /// [270, 360) calm.
    pub fn from_values(valence: f64, arousal: f64) -> Mood {
        let mut angle = arousal.atan2(valence).to_degrees();
        if angle < 0.0 {
            angle += 360.0;
        }

        if angle < 90.0 {
            Mood::Happy
        } else if angle < 135.0 {
            Mood::Agitated
        } else if angle < 270.0 {
            Mood::Suspense
        } else {
            Mood::Calm
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Mood::Happy => "happy",
            Mood::Agitated => "agitated",
            Mood::Suspense => "suspense",
            Mood::Calm => "calm",
        }
    }
}

impl std::str::FromStr for Mood {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "happy" => Ok(Mood::Happy),
            "agitated" => Ok(Mood::Agitated),
            "suspense" => Ok(Mood::Suspense),
            "calm" => Ok(Mood::Calm),
            other => Err(format!("unknown mood label: {other}")),
        }
    }
}

/// Discretized emotion of one measure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Label {
    Signs { valence: i8, arousal: i8 },
    Mood(Mood),
}

impl Label {
    /// Whether the label counts toward the positive side of the
    /// train/test balance.
    pub fn is_positive(&self) -> bool {
        match self {
            Label::Signs { valence, .. } => *valence > 0,
            Label::Mood(m) => matches!(m, Mood::Happy | Mood::Calm),
        }
    }
}

/// A maximal run of consecutive measures sharing one label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmotionSegment {
    pub start: usize,
    pub len: usize,
    pub label: Label,
}

/// Bounded history of resolved states for one dimension, used to
/// settle ambiguous measures. Explicit value passed through the
/// discretization calls, never hidden state.
#[derive(Debug, Clone)]
pub struct History {
    states: VecDeque<i8>,
    capacity: usize,
}

impl History {
    pub fn new(capacity: usize) -> Self {
        Self {
            states: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
        }
    }

    /// Record a resolved non-zero state, evicting the oldest entry
    /// once the buffer is full.
    pub fn push(&mut self, state: i8) {
        if state == 0 {
            return;
        }
        if self.states.len() == self.capacity {
            self.states.pop_front();
        }
        self.states.push_back(state);
    }

    /// Most frequent non-zero state; an exact count tie resolves to
    /// the most recent state. Empty history returns None.
    pub fn majority(&self) -> Option<i8> {
        if self.states.is_empty() {
            return None;
        }
        let pos = self.states.iter().filter(|&&s| s > 0).count();
        let neg = self.states.len() - pos;
        if pos > neg {
            Some(1)
        } else if neg > pos {
            Some(-1)
        } else {
            self.states.back().copied()
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SegmentOptions {
    pub scheme: LabelScheme,
    /// Values with magnitude below this are ambiguous. Arousal uses
    /// half the threshold.
    pub ambiguity_threshold: f64,
    /// Maximum tolerated fraction of ambiguous measures per dimension
    /// before the whole piece is rejected.
    pub ambiguity_allowed: f64,
    /// Capacity of the per-dimension context buffer.
    pub history: usize,
}

impl Default for SegmentOptions {
    fn default() -> Self {
        Self {
            scheme: LabelScheme::Signs,
            ambiguity_threshold: 0.0,
            ambiguity_allowed: 1.0,
            history: 8,
        }
    }
}

/// A full tiling of a piece: the segments plus the per-measure labels
/// they were built from (the labels drive granularity re-tiling).
#[derive(Debug, Clone)]
pub struct Segmentation {
    pub segments: Vec<EmotionSegment>,
    pub labels: Vec<Label>,
}

/// Result of segmenting one piece's consensus curves.
#[derive(Debug, Clone)]
pub enum SegmentOutcome {
    Segments(Segmentation),
    /// The piece had too many near-neutral measures in one dimension
    /// and emits nothing.
    TooAmbiguous { valence_ratio: f64, arousal_ratio: f64 },
}

/// Discretize one dimension's value: >= +t is +1, <= -t is -1,
/// otherwise ambiguous and resolved from the history, falling back to
/// the raw sign (an exact zero stays 0).
pub fn discretize(value: f64, threshold: f64, history: &History) -> i8 {
    if value >= threshold {
        return 1;
    }
    if value <= -threshold {
        return -1;
    }

    if let Some(state) = history.majority() {
        return state;
    }

    if value > 0.0 {
        1
    } else if value < 0.0 {
        -1
    } else {
        0
    }
}

/// Turn a pair of consensus curves into a gapless segment sequence,
/// or reject the piece outright when too many measures sit inside the
/// ambiguity band.
pub fn segment_curves(
    valence: &[f64],
    arousal: &[f64],
    opts: &SegmentOptions,
) -> SegmentOutcome {
    debug_assert_eq!(valence.len(), arousal.len());
    let measures = valence.len();
    if measures == 0 {
        return SegmentOutcome::Segments(Segmentation {
            segments: Vec::new(),
            labels: Vec::new(),
        });
    }

    let v_threshold = opts.ambiguity_threshold;
    let a_threshold = opts.ambiguity_threshold / 2.0;

    let ambiguous_v = valence.iter().filter(|v| v.abs() < v_threshold).count();
    let ambiguous_a = arousal.iter().filter(|a| a.abs() < a_threshold).count();
    let valence_ratio = ambiguous_v as f64 / measures as f64;
    let arousal_ratio = ambiguous_a as f64 / measures as f64;

    if valence_ratio > opts.ambiguity_allowed || arousal_ratio > opts.ambiguity_allowed {
        return SegmentOutcome::TooAmbiguous {
            valence_ratio,
            arousal_ratio,
        };
    }

    let labels: Vec<Label> = match opts.scheme {
        LabelScheme::Signs => {
            let mut v_history = History::new(opts.history);
            let mut a_history = History::new(opts.history);
            valence
                .iter()
                .zip(arousal.iter())
                .map(|(&v, &a)| {
                    let dv = discretize(v, v_threshold, &v_history);
                    let da = discretize(a, a_threshold, &a_history);
                    v_history.push(dv);
                    a_history.push(da);
                    Label::Signs {
                        valence: dv,
                        arousal: da,
                    }
                })
                .collect()
        }
        LabelScheme::Mood => valence
            .iter()
            .zip(arousal.iter())
            .map(|(&v, &a)| Label::Mood(Mood::from_values(v, a)))
            .collect(),
    };

    SegmentOutcome::Segments(Segmentation {
        segments: run_length(&labels),
        labels,
    })
}

/// Merge consecutive equal labels into segments. The output covers
/// `[0, labels.len())` with no gaps or overlaps.
fn run_length(labels: &[Label]) -> Vec<EmotionSegment> {
    let mut segments: Vec<EmotionSegment> = Vec::new();
    for (i, &label) in labels.iter().enumerate() {
        match segments.last_mut() {
            Some(seg) if seg.label == label => seg.len += 1,
            _ => segments.push(EmotionSegment {
                start: i,
                len: 1,
                label,
            }),
        }
    }
    segments
}

/// Alternative tilings of the same curve at power-of-two granularities
/// 1, 2, 4, ... up to `max_granularity`. Granularity g chops each
/// segment into sub-runs of `max(1, len / g)` measures, labeled by the
/// sub-run's first measure. Granularity 1 is the canonical
/// segmentation itself; each tiling is a separate emission pass.
pub fn granularity_tilings(
    segmentation: &Segmentation,
    max_granularity: usize,
) -> Vec<Vec<EmotionSegment>> {
    let mut tilings = Vec::new();

    let mut g = 1usize;
    while g <= max_granularity {
        if g == 1 {
            tilings.push(segmentation.segments.clone());
        } else {
            let mut tiling = Vec::new();
            for seg in &segmentation.segments {
                let step = (seg.len / g).max(1);
                let mut start = seg.start;
                let end = seg.start + seg.len;
                while start < end {
                    let len = step.min(end - start);
                    tiling.push(EmotionSegment {
                        start,
                        len,
                        label: segmentation.labels[start],
                    });
                    start += len;
                }
            }
            tilings.push(tiling);
        }
        g <<= 1;
    }

    tilings
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signs(valence: i8, arousal: i8) -> Label {
        Label::Signs { valence, arousal }
    }

    /// Segments must cover [0, M) exactly, in order, with no overlap,
    /// and the segment count equals label changes + 1.
    fn assert_partition(segments: &[EmotionSegment], measures: usize) {
        let mut next = 0usize;
        for seg in segments {
            assert_eq!(seg.start, next);
            assert!(seg.len > 0);
            next += seg.len;
        }
        assert_eq!(next, measures);
    }

    #[test]
    fn test_threshold_scenario() {
        // valence [0.5, 0.6, -0.5, -0.6, -0.4], threshold 0.3
        // -> states [+1,+1,-1,-1,-1] -> [0,2) +1 and [2,5) -1.
        let valence = [0.5, 0.6, -0.5, -0.6, -0.4];
        let arousal = [0.5, 0.5, 0.5, 0.5, 0.5];
        let opts = SegmentOptions {
            ambiguity_threshold: 0.3,
            ..SegmentOptions::default()
        };

        let SegmentOutcome::Segments(s) = segment_curves(&valence, &arousal, &opts) else {
            panic!("piece unexpectedly rejected");
        };

        assert_partition(&s.segments, 5);
        assert_eq!(s.segments.len(), 2);
        assert_eq!(s.segments[0].start, 0);
        assert_eq!(s.segments[0].len, 2);
        assert_eq!(s.segments[0].label, signs(1, 1));
        assert_eq!(s.segments[1].start, 2);
        assert_eq!(s.segments[1].len, 3);
        assert_eq!(s.segments[1].label, signs(-1, 1));
    }

    #[test]
    fn test_segment_count_equals_changes_plus_one() {
        let valence = [0.5, -0.5, 0.5, -0.5];
        let arousal = [0.5, 0.5, 0.5, 0.5];
        let opts = SegmentOptions::default();

        let SegmentOutcome::Segments(s) = segment_curves(&valence, &arousal, &opts) else {
            panic!("piece unexpectedly rejected");
        };
        assert_partition(&s.segments, 4);
        assert_eq!(s.segments.len(), 4); // 3 changes + 1
    }

    #[test]
    fn test_ambiguity_resolved_from_history() {
        let mut history = History::new(4);
        history.push(-1);
        history.push(-1);
        history.push(1);
        // Majority of [-1,-1,1] is -1; 0.1 is inside the band.
        assert_eq!(discretize(0.1, 0.3, &history), -1);
    }

    #[test]
    fn test_ambiguity_without_history_falls_back_to_sign() {
        let history = History::new(4);
        assert_eq!(discretize(0.1, 0.3, &history), 1);
        assert_eq!(discretize(-0.1, 0.3, &history), -1);
        assert_eq!(discretize(0.0, 0.3, &history), 0);
    }

    #[test]
    fn test_history_is_bounded_and_ties_go_to_recent() {
        let mut history = History::new(2);
        history.push(1);
        history.push(1);
        history.push(-1); // evicts the first +1 -> [1, -1]
        assert_eq!(history.majority(), Some(-1));
    }

    #[test]
    fn test_ambiguous_piece_rejected() {
        // Every valence measure inside the band, allowed ratio 0.5.
        let valence = [0.1, -0.1, 0.05, -0.05];
        let arousal = [0.9, 0.9, 0.9, 0.9];
        let opts = SegmentOptions {
            ambiguity_threshold: 0.3,
            ambiguity_allowed: 0.5,
            ..SegmentOptions::default()
        };

        match segment_curves(&valence, &arousal, &opts) {
            SegmentOutcome::TooAmbiguous { valence_ratio, .. } => {
                assert!((valence_ratio - 1.0).abs() < 1e-12);
            }
            SegmentOutcome::Segments(_) => panic!("expected rejection"),
        }
    }

    #[test]
    fn test_mood_quadrants() {
        assert_eq!(Mood::from_values(0.5, 0.5), Mood::Happy);
        assert_eq!(Mood::from_values(-0.2, 0.8), Mood::Agitated);
        assert_eq!(Mood::from_values(-0.5, -0.5), Mood::Suspense);
        assert_eq!(Mood::from_values(0.5, -0.5), Mood::Calm);
        // Boundary: straight up (90 degrees) is agitated.
        assert_eq!(Mood::from_values(0.0, 1.0), Mood::Agitated);
        // Straight right (0 degrees) is happy.
        assert_eq!(Mood::from_values(1.0, 0.0), Mood::Happy);
    }

    #[test]
    fn test_mood_scheme_segments() {
        let valence = [0.5, 0.5, -0.5, -0.5];
        let arousal = [0.5, 0.5, -0.5, -0.5];
        let opts = SegmentOptions {
            scheme: LabelScheme::Mood,
            ..SegmentOptions::default()
        };

        let SegmentOutcome::Segments(s) = segment_curves(&valence, &arousal, &opts) else {
            panic!("piece unexpectedly rejected");
        };
        assert_partition(&s.segments, 4);
        assert_eq!(s.segments.len(), 2);
        assert_eq!(s.segments[0].label, Label::Mood(Mood::Happy));
        assert_eq!(s.segments[1].label, Label::Mood(Mood::Suspense));
    }

    #[test]
    fn test_granularity_tilings_cover_curve() {
        let valence = [0.5, 0.5, 0.5, 0.5, -0.5, -0.5, -0.5, -0.5];
        let arousal = [0.5; 8];
        let opts = SegmentOptions::default();

        let SegmentOutcome::Segments(s) = segment_curves(&valence, &arousal, &opts) else {
            panic!("piece unexpectedly rejected");
        };

        let tilings = granularity_tilings(&s, 4);
        assert_eq!(tilings.len(), 3); // granularities 1, 2, 4

        // Every tiling independently partitions the full curve.
        for tiling in &tilings {
            assert_partition(tiling, 8);
        }

        // Granularity 2 halves each 4-measure segment.
        assert_eq!(tilings[1].len(), 4);
        assert!(tilings[1].iter().all(|seg| seg.len == 2));
        // Granularity 4 quarters them.
        assert_eq!(tilings[2].len(), 8);
    }

    #[test]
    fn test_granularity_one_is_canonical() {
        let valence = [0.5, -0.5, -0.5];
        let arousal = [0.5; 3];
        let opts = SegmentOptions::default();
        let SegmentOutcome::Segments(s) = segment_curves(&valence, &arousal, &opts) else {
            panic!("piece unexpectedly rejected");
        };
        let tilings = granularity_tilings(&s, 1);
        assert_eq!(tilings.len(), 1);
        assert_eq!(tilings[0], s.segments);
    }
}
