//! Lloyd's k-means with k-means++ seeding and multiple restarts.
//!
//! Used to split chemicals into groups so that acquisitions can be spread
//! across structurally different regions of chemical space.

use ndarray::parallel::prelude::*;
use ndarray::{Array2, ArrayView1, ArrayView2, Axis};
use rand::Rng;
use rand::distributions::{Distribution, WeightedIndex};
use thiserror::Error;

const MAX_ITERATIONS: usize = 300;
/// Convergence threshold on the total squared centroid shift, relative to the
/// mean per-feature variance of the data.
const RELATIVE_TOLERANCE: f64 = 1e-4;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum KMeansError {
    #[error("k-means requires at least one cluster.")]
    ZeroClusters,
    #[error("k-means requires at least one initialization.")]
    ZeroRestarts,
    #[error("Cannot form {clusters} clusters from only {samples} samples.")]
    TooFewSamples { samples: usize, clusters: usize },
    #[error("Non-finite feature value in sample {0}.")]
    NonFiniteFeature(usize),
}

/// The best clustering found across all restarts.
#[derive(Debug, Clone)]
pub struct KMeansFit {
    pub labels: Vec<usize>,
    pub centroids: Array2<f64>,
    pub inertia: f64,
}

/// Clusters the rows of `data` into `k` groups, keeping the lowest-inertia
/// result out of `n_init` k-means++ initializations.
pub fn kmeans<R: Rng>(
    data: ArrayView2<f64>,
    k: usize,
    n_init: usize,
    rng: &mut R,
) -> Result<KMeansFit, KMeansError> {
    if k == 0 {
        return Err(KMeansError::ZeroClusters);
    }
    if n_init == 0 {
        return Err(KMeansError::ZeroRestarts);
    }
    if data.nrows() < k {
        return Err(KMeansError::TooFewSamples {
            samples: data.nrows(),
            clusters: k,
        });
    }
    for (i, row) in data.axis_iter(Axis(0)).enumerate() {
        if row.iter().any(|v| !v.is_finite()) {
            return Err(KMeansError::NonFiniteFeature(i));
        }
    }

    let tolerance = RELATIVE_TOLERANCE * mean_feature_variance(data);

    let mut best: Option<KMeansFit> = None;
    for restart in 0..n_init {
        let centroids = seed_plus_plus(data, k, rng);
        let fit = lloyd(data, centroids, tolerance);
        log::debug!(
            "k-means restart {}/{}: inertia {:.6}",
            restart + 1,
            n_init,
            fit.inertia
        );
        if best.as_ref().is_none_or(|b| fit.inertia < b.inertia) {
            best = Some(fit);
        }
    }

    // n_init >= 1 was checked above, so at least one fit exists.
    best.ok_or(KMeansError::ZeroRestarts)
}

fn squared_distance(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

fn mean_feature_variance(data: ArrayView2<f64>) -> f64 {
    if data.ncols() == 0 || data.nrows() == 0 {
        return 0.0;
    }
    data.var_axis(Axis(0), 0.0).mean().unwrap_or(0.0)
}

/// k-means++: the first centre is uniform, each further centre is drawn with
/// probability proportional to its squared distance from the nearest centre.
fn seed_plus_plus<R: Rng>(data: ArrayView2<f64>, k: usize, rng: &mut R) -> Array2<f64> {
    let n = data.nrows();
    let mut centroids = Array2::zeros((k, data.ncols()));

    let first = rng.gen_range(0..n);
    centroids.row_mut(0).assign(&data.row(first));

    let mut nearest: Vec<f64> = data
        .axis_iter(Axis(0))
        .map(|row| squared_distance(row, data.row(first)))
        .collect();

    for c in 1..k {
        let next = match WeightedIndex::new(&nearest) {
            Ok(dist) => dist.sample(rng),
            // Every remaining point coincides with a centre.
            Err(_) => rng.gen_range(0..n),
        };
        centroids.row_mut(c).assign(&data.row(next));
        for (i, row) in data.axis_iter(Axis(0)).enumerate() {
            let d = squared_distance(row, data.row(next));
            if d < nearest[i] {
                nearest[i] = d;
            }
        }
    }

    centroids
}

fn assign(data: ArrayView2<f64>, centroids: &Array2<f64>) -> Vec<(usize, f64)> {
    data.axis_iter(Axis(0))
        .into_par_iter()
        .map(|row| {
            let mut best = (0usize, f64::INFINITY);
            for (c, centroid) in centroids.axis_iter(Axis(0)).enumerate() {
                let d = squared_distance(row, centroid);
                if d < best.1 {
                    best = (c, d);
                }
            }
            best
        })
        .collect()
}

fn lloyd(data: ArrayView2<f64>, mut centroids: Array2<f64>, tolerance: f64) -> KMeansFit {
    let k = centroids.nrows();
    let mut assignment = assign(data, &centroids);

    for iteration in 0..MAX_ITERATIONS {
        let mut sums = Array2::<f64>::zeros(centroids.raw_dim());
        let mut counts = vec![0usize; k];
        for (row, &(label, _)) in data.axis_iter(Axis(0)).zip(assignment.iter()) {
            let mut target = sums.row_mut(label);
            target += &row;
            counts[label] += 1;
        }

        let mut next = centroids.clone();
        for c in 0..k {
            if counts[c] > 0 {
                let mean = &sums.row(c) / counts[c] as f64;
                next.row_mut(c).assign(&mean);
            } else {
                // Relocate an empty cluster to the point farthest from its centre.
                let (far, _) = assignment
                    .iter()
                    .enumerate()
                    .fold((0usize, f64::NEG_INFINITY), |acc, (i, &(_, d))| {
                        if d > acc.1 { (i, d) } else { acc }
                    });
                next.row_mut(c).assign(&data.row(far));
            }
        }

        let shift: f64 = next
            .axis_iter(Axis(0))
            .zip(centroids.axis_iter(Axis(0)))
            .map(|(a, b)| squared_distance(a, b))
            .sum();
        centroids = next;
        assignment = assign(data, &centroids);

        if shift <= tolerance {
            log::trace!("k-means converged after {} iterations", iteration + 1);
            break;
        }
    }

    KMeansFit {
        labels: assignment.iter().map(|&(label, _)| label).collect(),
        inertia: assignment.iter().map(|&(_, d)| d).sum(),
        centroids,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn three_blobs() -> Array2<f64> {
        let mut rows = Vec::new();
        for (cx, cy) in [(0.0, 0.0), (10.0, 10.0), (-10.0, 10.0)] {
            for i in 0..8 {
                let jitter = (i as f64) * 0.05;
                rows.push([cx + jitter, cy - jitter]);
            }
        }
        Array2::from(rows)
    }

    #[test]
    fn test_separates_well_separated_blobs() {
        let data = three_blobs();
        let mut rng = StdRng::seed_from_u64(7);
        let fit = kmeans(data.view(), 3, 3, &mut rng).unwrap();

        assert_eq!(fit.labels.len(), 24);
        for blob in 0..3 {
            let labels = &fit.labels[blob * 8..(blob + 1) * 8];
            assert!(labels.iter().all(|&l| l == labels[0]));
        }
        assert_ne!(fit.labels[0], fit.labels[8]);
        assert_ne!(fit.labels[8], fit.labels[16]);
        assert_ne!(fit.labels[0], fit.labels[16]);
        assert!(fit.inertia < 1.0);
    }

    #[test]
    fn test_every_cluster_is_used_when_k_equals_samples() {
        let data = Array2::from(vec![[0.0], [1.0], [5.0], [9.0]]);
        let mut rng = StdRng::seed_from_u64(11);
        let fit = kmeans(data.view(), 4, 2, &mut rng).unwrap();
        let mut labels = fit.labels.clone();
        labels.sort_unstable();
        labels.dedup();
        assert_eq!(labels.len(), 4);
        assert!(fit.inertia.abs() < 1e-12);
    }

    #[test]
    fn test_invalid_requests() {
        let data = Array2::from(vec![[0.0], [1.0]]);
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(
            kmeans(data.view(), 0, 3, &mut rng).unwrap_err(),
            KMeansError::ZeroClusters
        );
        assert_eq!(
            kmeans(data.view(), 3, 3, &mut rng).unwrap_err(),
            KMeansError::TooFewSamples {
                samples: 2,
                clusters: 3
            }
        );
        assert_eq!(
            kmeans(data.view(), 1, 0, &mut rng).unwrap_err(),
            KMeansError::ZeroRestarts
        );
        let bad = Array2::from(vec![[0.0], [f64::NAN]]);
        assert_eq!(
            kmeans(bad.view(), 1, 1, &mut rng).unwrap_err(),
            KMeansError::NonFiniteFeature(1)
        );
    }
}
