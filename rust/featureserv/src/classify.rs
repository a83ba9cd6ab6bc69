//! Numeric classification helpers behind `generateRenderer`.

/// Largest number of values fed to the Jenks optimiser.
pub const MAX_JENKS_SAMPLE: usize = 1_000;

pub fn equal_interval(min: f64, max: f64, count: usize) -> Vec<f64> {
    let count = count.max(1);
    let step = (max - min) / count as f64;
    let mut breaks: Vec<f64> = (0..count).map(|i| min + step * i as f64).collect();
    breaks.push(max);
    breaks
}

pub fn quantile(sorted: &[f64], count: usize) -> Vec<f64> {
    let (Some(first), Some(last)) = (sorted.first(), sorted.last()) else {
        return Vec::new();
    };
    let count = count.clamp(1, sorted.len());
    let mut breaks = Vec::with_capacity(count + 1);
    breaks.push(*first);
    for class in 1..count {
        breaks.push(sorted[class * sorted.len() / count]);
    }
    breaks.push(*last);
    breaks
}

/// Jenks natural breaks over a sorted sample.
pub fn natural_breaks(sorted: &[f64], count: usize) -> Vec<f64> {
    let n = sorted.len();
    if n == 0 {
        return Vec::new();
    }
    let classes = count.clamp(1, n);

    // 1-based matrices as in the published algorithm; row and column 0 are unused.
    let mut lower = vec![vec![0usize; classes + 1]; n + 1];
    let mut variance = vec![vec![f64::INFINITY; classes + 1]; n + 1];
    for j in 1..=classes {
        lower[1][j] = 1;
        variance[1][j] = 0.0;
    }

    for l in 2..=n {
        let (mut sum, mut sum_sq, mut weight) = (0.0, 0.0, 0.0);
        let mut v = 0.0;
        for m in 1..=l {
            let start = l - m + 1;
            let value = sorted[start - 1];
            sum_sq += value * value;
            sum += value;
            weight += 1.0;
            v = sum_sq - (sum * sum) / weight;
            let before = start - 1;
            if before != 0 {
                for j in 2..=classes {
                    let candidate = v + variance[before][j - 1];
                    if variance[l][j] >= candidate {
                        lower[l][j] = start;
                        variance[l][j] = candidate;
                    }
                }
            }
        }
        lower[l][1] = 1;
        variance[l][1] = v;
    }

    let mut breaks = vec![0.0; classes + 1];
    breaks[0] = sorted[0];
    breaks[classes] = sorted[n - 1];
    let mut k = n;
    for j in (2..=classes).rev() {
        let start = lower[k][j];
        if start < 2 {
            break;
        }
        breaks[j - 1] = sorted[start - 2];
        k = start - 1;
    }
    breaks
}

pub fn sample_evenly(sorted: &[f64], max: usize) -> Vec<f64> {
    if sorted.len() <= max || max < 2 {
        return sorted.to_vec();
    }
    let last = sorted.len() - 1;
    (0..max)
        .map(|i| sorted[i * last / (max - 1)])
        .collect()
}
