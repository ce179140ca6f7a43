//! Vivaldi network coordinates
//!
//! Each ping round trip nudges the local coordinate towards a position
//! whose distance to the remote coordinate matches the observed RTT.
//! Distances order members inside an affinity group.

use fidias_common::{COORDINATE_DIMENSIONS, Coordinate};
use parking_lot::Mutex;
use rand::Rng;

/// Tuning for the coordinate update
#[derive(Clone, Debug)]
pub struct VivaldiConfig {
    /// Error ceiling
    pub max_error: f64,
    /// Error adjustment gain
    pub ce: f64,
    /// Position adjustment gain
    pub cc: f64,
    /// Minimum height
    pub height_min: f64,
    /// Samples with RTT above this (seconds) are ignored
    pub max_rtt: f64,
}

impl Default for VivaldiConfig {
    fn default() -> Self {
        Self {
            max_error: 1.5,
            ce: 0.25,
            cc: 0.25,
            height_min: 10.0e-6,
            max_rtt: 10.0,
        }
    }
}

const ZERO_THRESHOLD: f64 = 1.0e-6;

/// Local coordinate maintained from ping samples
#[derive(Debug)]
pub struct VivaldiClient {
    coord: Mutex<Coordinate>,
    config: VivaldiConfig,
}

impl Default for VivaldiClient {
    fn default() -> Self {
        Self::new(VivaldiConfig::default())
    }
}

impl VivaldiClient {
    #[must_use]
    pub fn new(config: VivaldiConfig) -> Self {
        Self {
            coord: Mutex::new(Coordinate::default()),
            config,
        }
    }

    /// Current local coordinate
    #[must_use]
    pub fn coordinate(&self) -> Coordinate {
        self.coord.lock().clone()
    }

    /// Fold in one RTT sample against `other`; returns the new coordinate
    pub fn update(&self, other: &Coordinate, rtt_secs: f64) -> Coordinate {
        let mut coord = self.coord.lock();
        if !(rtt_secs.is_finite() && rtt_secs > 0.0 && rtt_secs <= self.config.max_rtt)
            || !is_valid(other)
        {
            return coord.clone();
        }
        let dist = coord.distance_to(other);
        let wrongness = (dist - rtt_secs).abs() / rtt_secs;
        let total_error = (coord.error + other.error).max(ZERO_THRESHOLD);
        let weight = coord.error / total_error;

        coord.error = (self.config.ce * weight)
            .mul_add(wrongness, coord.error * self.config.ce.mul_add(-weight, 1.0))
            .min(self.config.max_error);

        let force = self.config.cc * weight * (rtt_secs - dist);
        apply_force(&mut coord, other, force, self.config.height_min);
        coord.clone()
    }
}

fn is_valid(c: &Coordinate) -> bool {
    c.vec.len() == COORDINATE_DIMENSIONS
        && c.vec.iter().all(|v| v.is_finite())
        && c.height.is_finite()
        && c.error.is_finite()
}

fn apply_force(coord: &mut Coordinate, other: &Coordinate, force: f64, height_min: f64) {
    let diff: Vec<f64> = coord.vec.iter().zip(&other.vec).map(|(a, b)| a - b).collect();
    let mag = diff.iter().map(|d| d * d).sum::<f64>().sqrt();
    let unit: Vec<f64> = if mag > ZERO_THRESHOLD {
        diff.iter().map(|d| d / mag).collect()
    } else {
        random_unit()
    };
    for (v, u) in coord.vec.iter_mut().zip(&unit) {
        *v += u * force;
    }
    if mag > ZERO_THRESHOLD {
        coord.height = ((coord.height + other.height) * force / mag + coord.height).max(height_min);
    }
}

fn random_unit() -> Vec<f64> {
    let mut rng = rand::thread_rng();
    loop {
        let v: Vec<f64> = (0..COORDINATE_DIMENSIONS)
            .map(|_| rng.gen_range(-0.5..0.5))
            .collect();
        let mag = v.iter().map(|d| d * d).sum::<f64>().sqrt();
        if mag > ZERO_THRESHOLD {
            return v.into_iter().map(|d| d / mag).collect();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_converges_towards_rtt() {
        let a = VivaldiClient::default();
        let b = VivaldiClient::default();
        let rtt = 0.050;
        for _ in 0..1000 {
            let cb = b.coordinate();
            let ca = a.update(&cb, rtt);
            b.update(&ca, rtt);
        }
        let d = a.coordinate().distance_to(&b.coordinate());
        assert!((d - rtt).abs() < 0.015, "distance {d} far from {rtt}");
        assert!(a.coordinate().error < 1.5);
    }

    #[test]
    fn test_rejects_bad_samples() {
        let a = VivaldiClient::default();
        let before = a.coordinate();
        assert_eq!(a.update(&Coordinate::default(), 0.0), before);
        assert_eq!(a.update(&Coordinate::default(), f64::NAN), before);
        let mut bad = Coordinate::default();
        bad.vec.pop();
        assert_eq!(a.update(&bad, 0.01), before);
    }
}
