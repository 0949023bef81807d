use nalgebra::{Matrix3, Vector3};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Components per color model
pub const COMPONENTS: usize = 5;

const KMEANS_ITERATIONS: usize = 10;

/// Added to the covariance diagonal when a component collapses
const REGULARIZATION: f64 = 0.01;

pub type Color = Vector3<f64>;

#[derive(Debug, Clone)]
struct Component {
    weight: f64,
    mean: Color,
    inverse: Matrix3<f64>,
    det: f64,
}

/// Full-covariance Gaussian mixture over RGB colors
#[derive(Debug, Clone)]
pub struct Gmm {
    components: Vec<Component>,
}

impl Gmm {
    /// Fit one component per label value from pre-assigned samples.
    ///
    /// Components with no samples get zero weight.
    pub fn fit(samples: &[Color], assignment: &[usize]) -> Self {
        let mut counts = [0usize; COMPONENTS];
        let mut sums = [Color::zeros(); COMPONENTS];
        let mut products = [Matrix3::<f64>::zeros(); COMPONENTS];

        for (color, &k) in samples.iter().zip(assignment) {
            let k = k % COMPONENTS;
            counts[k] += 1;
            sums[k] += color;
            products[k] += color * color.transpose();
        }

        let total = samples.len().max(1) as f64;
        let components = (0..COMPONENTS)
            .map(|k| {
                if counts[k] == 0 {
                    return Component::empty();
                }
                let n = counts[k] as f64;
                let mean = sums[k] / n;
                let mut cov = products[k] / n - mean * mean.transpose();
                let mut det = cov.determinant();
                if det <= f64::EPSILON {
                    cov += Matrix3::identity() * REGULARIZATION;
                    det = cov.determinant();
                }
                match cov.try_inverse() {
                    Some(inverse) if det > 0.0 => Component {
                        weight: n / total,
                        mean,
                        inverse,
                        det,
                    },
                    _ => Component::empty(),
                }
            })
            .collect();

        Self { components }
    }

    /// Unweighted density of component `k` (without the 2π constant)
    pub fn component_density(&self, k: usize, color: &Color) -> f64 {
        let Some(c) = self.components.get(k) else {
            return 0.0;
        };
        if c.weight <= 0.0 {
            return 0.0;
        }
        let d = color - c.mean;
        let mahalanobis = (d.transpose() * c.inverse * d)[(0, 0)];
        (-0.5 * mahalanobis).exp() / c.det.sqrt()
    }

    /// Mixture density at `color`
    pub fn probability(&self, color: &Color) -> f64 {
        self.components
            .iter()
            .enumerate()
            .map(|(k, c)| c.weight * self.component_density(k, color))
            .sum()
    }

    /// Index of the component that best explains `color`
    pub fn most_likely_component(&self, color: &Color) -> usize {
        (0..COMPONENTS)
            .max_by(|&a, &b| {
                self.component_density(a, color)
                    .total_cmp(&self.component_density(b, color))
            })
            .unwrap_or(0)
    }
}

impl Component {
    fn empty() -> Self {
        Self {
            weight: 0.0,
            mean: Color::zeros(),
            inverse: Matrix3::identity(),
            det: 1.0,
        }
    }
}

/// k-means with k-means++ seeding; returns a cluster index per sample
pub fn kmeans(samples: &[Color], k: usize, seed: u64) -> Vec<usize> {
    if samples.is_empty() || k == 0 {
        return vec![0; samples.len()];
    }
    let k = k.min(samples.len());
    let mut rng = ChaCha8Rng::seed_from_u64(seed);

    let mut centers = vec![samples[rng.gen_range(0..samples.len())]];
    let mut nearest: Vec<f64> = samples
        .iter()
        .map(|s| (s - centers[0]).norm_squared())
        .collect();
    while centers.len() < k {
        let total: f64 = nearest.iter().sum();
        let next = if total <= 0.0 {
            rng.gen_range(0..samples.len())
        } else {
            let mut target = rng.gen::<f64>() * total;
            let mut chosen = samples.len() - 1;
            for (i, d) in nearest.iter().enumerate() {
                target -= d;
                if target <= 0.0 {
                    chosen = i;
                    break;
                }
            }
            chosen
        };
        let center = samples[next];
        for (d, s) in nearest.iter_mut().zip(samples) {
            *d = d.min((s - center).norm_squared());
        }
        centers.push(center);
    }

    let mut labels = vec![0usize; samples.len()];
    for _ in 0..KMEANS_ITERATIONS {
        for (label, s) in labels.iter_mut().zip(samples) {
            *label = closest(&centers, s);
        }

        let mut sums = vec![Color::zeros(); k];
        let mut counts = vec![0usize; k];
        for (&label, s) in labels.iter().zip(samples) {
            sums[label] += s;
            counts[label] += 1;
        }
        for ((center, sum), count) in centers.iter_mut().zip(sums).zip(counts) {
            if count > 0 {
                *center = sum / count as f64;
            }
        }
    }
    labels
}

fn closest(centers: &[Color], s: &Color) -> usize {
    centers
        .iter()
        .enumerate()
        .min_by(|a, b| (s - a.1).norm_squared().total_cmp(&(s - b.1).norm_squared()))
        .map(|(i, _)| i)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_clusters() -> Vec<Color> {
        let mut samples = Vec::new();
        for i in 0..50 {
            let j = (i % 7) as f64;
            samples.push(Color::new(200.0 + j, 30.0 - j, 40.0));
            samples.push(Color::new(20.0, 180.0 + j, 60.0 + j));
        }
        samples
    }

    #[test]
    fn test_kmeans_separates_clusters() {
        let samples = two_clusters();
        let labels = kmeans(&samples, 2, 7);
        assert_ne!(labels[0], labels[1]);
        for pair in labels.chunks(2) {
            assert_eq!(pair[0], labels[0]);
            assert_eq!(pair[1], labels[1]);
        }
    }

    #[test]
    fn test_kmeans_with_fewer_samples_than_clusters() {
        let samples = vec![Color::new(1.0, 2.0, 3.0), Color::new(9.0, 9.0, 9.0)];
        let labels = kmeans(&samples, COMPONENTS, 1);
        assert_eq!(labels.len(), 2);
        assert!(labels.iter().all(|&l| l < 2));
    }

    #[test]
    fn test_density_prefers_own_cluster() {
        let samples = two_clusters();
        let labels = kmeans(&samples, COMPONENTS, 3);
        let gmm = Gmm::fit(&samples, &labels);
        let red = Color::new(203.0, 27.0, 40.0);
        let far = Color::new(0.0, 0.0, 255.0);
        assert!(gmm.probability(&red) > gmm.probability(&far));
        assert!(gmm.probability(&red).is_finite());
    }

    #[test]
    fn test_constant_samples_are_regularized() {
        let samples = vec![Color::new(10.0, 10.0, 10.0); 20];
        let gmm = Gmm::fit(&samples, &vec![0; 20]);
        let p = gmm.probability(&Color::new(10.0, 10.0, 10.0));
        assert!(p.is_finite() && p > 0.0);
    }
}
