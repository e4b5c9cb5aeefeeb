//! Small time-series math helpers shared by the consensus strategies.
//! All curves are plain `&[f64]` slices, one value per measure.

/// Mean of a single curve.
pub fn mean(x: &[f64]) -> f64 {
    if x.is_empty() {
        return 0.0;
    }
    x.iter().sum::<f64>() / x.len() as f64
}

/// Population variance of a single curve.
pub fn variance(x: &[f64]) -> f64 {
    if x.is_empty() {
        return 0.0;
    }
    let m = mean(x);
    x.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / x.len() as f64
}

/// Per-measure mean across a set of equal-length curves.
pub fn pointwise_mean(xs: &[&[f64]]) -> Vec<f64> {
    let len = xs.first().map(|x| x.len()).unwrap_or(0);
    let mut out = vec![0.0; len];
    for x in xs {
        for (acc, v) in out.iter_mut().zip(x.iter()) {
            *acc += v;
        }
    }
    for acc in &mut out {
        *acc /= xs.len() as f64;
    }
    out
}

/// Per-measure median across a set of equal-length curves.
/// Even member counts average the two middle values.
pub fn pointwise_median(xs: &[&[f64]]) -> Vec<f64> {
    let len = xs.first().map(|x| x.len()).unwrap_or(0);
    let mut out = Vec::with_capacity(len);
    let mut column = Vec::with_capacity(xs.len());

    for i in 0..len {
        column.clear();
        column.extend(xs.iter().map(|x| x[i]));
        column.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let mid = column.len() / 2;
        let median = if column.len() % 2 == 0 {
            (column[mid - 1] + column[mid]) / 2.0
        } else {
            column[mid]
        };
        out.push(median);
    }
    out
}

/// Moving average with window `w`, "valid" mode: output length is
/// `len - w + 1`. A window of 0 or 1 returns the input unchanged.
pub fn moving_average(x: &[f64], w: usize) -> Vec<f64> {
    if w <= 1 || x.len() < w {
        return x.to_vec();
    }
    let mut out = Vec::with_capacity(x.len() - w + 1);
    let mut sum: f64 = x[..w].iter().sum();
    out.push(sum / w as f64);
    for i in w..x.len() {
        sum += x[i] - x[i - w];
        out.push(sum / w as f64);
    }
    out
}

/// Euclidean distance between two curves.
/// Trailing values of the longer curve are ignored.
pub fn euclidean(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f64>()
        .sqrt()
}

/// Dynamic time warping distance between two curves.
/// Classic O(n*m) dynamic program with a two-row working set.
pub fn dtw(a: &[f64], b: &[f64]) -> f64 {
    if a.is_empty() || b.is_empty() {
        return f64::INFINITY;
    }

    let mut prev = vec![f64::INFINITY; b.len() + 1];
    let mut curr = vec![f64::INFINITY; b.len() + 1];
    prev[0] = 0.0;

    for &av in a {
        curr[0] = f64::INFINITY;
        for (j, &bv) in b.iter().enumerate() {
            let cost = (av - bv) * (av - bv);
            curr[j + 1] = cost + prev[j + 1].min(curr[j]).min(prev[j]);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()].sqrt()
}
