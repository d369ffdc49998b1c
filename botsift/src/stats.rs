// botsift/src/stats.rs
//
// Streaming distribution statistics over bounded numeric windows.
//
// Moments are recomputed from the window on demand (the window is at most
// MAX_SERIES long) with the small-sample bias corrections used by the stored
// historical data:
//
//   var      = M2 / (n-1)
//   skew     = c1 · (M3/n) / var^1.5             c1 = √(n(n-1)) / (n-1)
//   kurtosis = c2 · (M4/n) / var² − 3·c3         c2 = n(n+1) / ((n-1)(n-2)(n-3))
//                                                c3 = (n-1)² / ((n-2)(n-3))
//
// kurtosis is 0 for n ≤ 3. skew and kurtosis are 0 when var == 0.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Capacity of every per-key delta window.
pub const MAX_SERIES: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Moments {
    pub n:        usize,
    pub sum:      f64,
    pub mean:     f64,
    pub var:      f64,
    pub skew:     f64,
    pub kurtosis: f64,
}

/// Distribution moments, or `None` when there are fewer than two values.
pub fn moments<I>(values: I) -> Option<Moments>
where
    I: IntoIterator<Item = f64>,
    I::IntoIter: Clone,
{
    let iter = values.into_iter();
    let (count, sum) = iter.clone().fold((0usize, 0.0f64), |(c, s), v| (c + 1, s + v));
    if count <= 1 {
        return None;
    }

    let n    = count as f64;
    let mean = sum / n;
    let (mut m2, mut m3, mut m4) = (0.0f64, 0.0f64, 0.0f64);
    for v in iter {
        let d  = v - mean;
        let d2 = d * d;
        m2 += d2;
        m3 += d2 * d;
        m4 += d2 * d2;
    }

    let var = m2 / (n - 1.0);
    let (skew, kurtosis) = if var != 0.0 {
        let c1   = (n * (n - 1.0)).sqrt() / (n - 1.0);
        let skew = c1 * (m3 / n) / var.powf(1.5);
        let kurtosis = if count > 3 {
            let c2 = (n * (n + 1.0)) / ((n - 1.0) * (n - 2.0) * (n - 3.0));
            let c3 = (n - 1.0).powi(2) / ((n - 2.0) * (n - 3.0));
            c2 * (m4 / n) / var.powi(2) - 3.0 * c3
        } else {
            0.0
        };
        (skew, kurtosis)
    } else {
        (0.0, 0.0)
    };

    Some(Moments { n: count, sum, mean, var, skew, kurtosis })
}

// ── Bounded series ────────────────────────────────────────────────────────────

/// Window element. Millisecond deltas are i64, which has no lossless `Into<f64>`.
pub trait Sample: Copy {
    fn as_f64(self) -> f64;
}

impl Sample for i64 { fn as_f64(self) -> f64 { self as f64 } }
impl Sample for i32 { fn as_f64(self) -> f64 { self as f64 } }
impl Sample for u32 { fn as_f64(self) -> f64 { self as f64 } }
impl Sample for u8  { fn as_f64(self) -> f64 { self as f64 } }
impl Sample for f64 { fn as_f64(self) -> f64 { self } }

/// Ordered window with FIFO eviction once `MAX_SERIES` values are held.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Series<T> {
    values: VecDeque<T>,
}

impl<T: Sample> Series<T> {
    pub fn new() -> Self {
        Self { values: VecDeque::new() }
    }

    pub fn push(&mut self, v: T) {
        if self.values.len() >= MAX_SERIES {
            self.values.pop_front();
        }
        self.values.push_back(v);
    }

    pub fn len(&self) -> usize { self.values.len() }
    pub fn is_empty(&self) -> bool { self.values.is_empty() }

    pub fn iter(&self) -> impl Iterator<Item = &T> + Clone {
        self.values.iter()
    }

    pub fn to_vec(&self) -> Vec<T> {
        self.values.iter().copied().collect()
    }

    pub fn moments(&self) -> Option<Moments> {
        moments(self.values.iter().map(|&v| v.as_f64()))
    }
}

/// Moments of a fixed histogram, treating bucket counts as the sample.
pub fn histogram_moments(buckets: &[u64]) -> Option<Moments> {
    moments(buckets.iter().map(|&c| c as f64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn single_value_has_no_statistics() {
        assert!(moments(vec![42.0]).is_none());
        assert!(moments(Vec::<f64>::new()).is_none());
    }

    #[test]
    fn symmetric_sample() {
        let m = moments(vec![1.0, 2.0, 3.0, 4.0, 5.0]).unwrap();
        assert_eq!(m.n, 5);
        assert!(close(m.sum, 15.0));
        assert!(close(m.mean, 3.0));
        assert!(close(m.var, 2.5));
        assert!(close(m.skew, 0.0));
        // c2 = 30/24, c3 = 16/6, M4/n = 34/5
        assert!(close(m.kurtosis, 1.25 * 6.8 / 6.25 - 8.0));
    }

    #[test]
    fn right_skewed_sample() {
        // mean 1, deviations (-1,-1,2): M2 = 6, M3 = 6, var = 3
        let m = moments(vec![0.0, 0.0, 3.0]).unwrap();
        assert!(close(m.var, 3.0));
        assert!(close(m.skew, 2.0f64.sqrt() / 3.0));
    }

    #[test]
    fn three_values_have_zero_kurtosis() {
        for sample in [vec![1.0, 50.0, 7.0], vec![-3.0, 0.5, 1e6], vec![0.0, 0.0, 3.0]] {
            assert_eq!(moments(sample).unwrap().kurtosis, 0.0);
        }
    }

    #[test]
    fn constant_sample_has_zero_shape() {
        let m = moments(vec![7.0; 10]).unwrap();
        assert_eq!(m.var, 0.0);
        assert_eq!(m.skew, 0.0);
        assert_eq!(m.kurtosis, 0.0);
    }

    #[test]
    fn series_evicts_oldest() {
        let mut s = Series::<i32>::new();
        for i in 0..(MAX_SERIES as i32 + 5) {
            s.push(i);
        }
        assert_eq!(s.len(), MAX_SERIES);
        assert_eq!(s.iter().next().copied(), Some(5));
        assert_eq!(s.to_vec().last().copied(), Some(MAX_SERIES as i32 + 4));
    }

    #[test]
    fn histogram_is_a_count_distribution() {
        let mut hours = [0u64; 24];
        hours[10] = 2;
        let m = histogram_moments(&hours).unwrap();
        assert_eq!(m.n, 24);
        assert!(close(m.mean, 2.0 / 24.0));
    }

    proptest! {
        #[test]
        fn mean_is_arithmetic_mean(values in prop::collection::vec(-1e6f64..1e6, 2..200)) {
            let m = moments(values.clone()).unwrap();
            let expected = values.iter().sum::<f64>() / values.len() as f64;
            prop_assert!((m.mean - expected).abs() <= 1e-6 * expected.abs().max(1.0));
            prop_assert_eq!(m.n, values.len());
            prop_assert!(m.var >= 0.0);
        }

        #[test]
        fn series_never_exceeds_capacity(pushes in 0usize..2500) {
            let mut s = Series::<u32>::new();
            for i in 0..pushes {
                s.push(i as u32);
            }
            prop_assert_eq!(s.len(), pushes.min(MAX_SERIES));
        }
    }
}
