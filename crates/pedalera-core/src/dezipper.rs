//! dB-targeted gain smoothing for the pedalboard's input and output stages.
//!
//! A step change in gain produces an audible click; the dezipper turns the
//! step into a short exponential ramp. It is a one-pole lowpass on the
//! linear gain:
//!
//! ```text
//! g[n] = g[n-1] + coeff * (target - g[n-1])
//! coeff = 1 - exp(-1 / (tau * sample_rate))
//! ```
//!
//! The time constant is fixed at 2 ms, so a full-scale step is within 0.7 %
//! of its target after 10 ms (five time constants) at any block size - the
//! ramp is a function of sample rate only, never of timer cadence. The
//! approach is monotonic and never overshoots; once within a small epsilon
//! the gain snaps to the target exactly.

use libm::expf;

use crate::math::db_to_linear;

/// Time constant of the one-pole ramp. Five of these settle a step.
const TAU_SECONDS: f32 = 0.002;

/// Snap threshold: below this distance the gain locks to the target.
const SETTLE_EPSILON: f32 = 1e-6;

/// One-pole gain smoother with dB-denominated targets.
#[derive(Debug, Clone)]
pub struct DbDezipper {
    current: f32,
    target: f32,
    coeff: f32,
}

impl DbDezipper {
    /// Create a dezipper resting at `initial_db`.
    pub fn new(sample_rate: f64, initial_db: f32) -> Self {
        let gain = db_to_linear(initial_db);
        Self {
            current: gain,
            target: gain,
            coeff: 1.0 - expf(-1.0 / (TAU_SECONDS * sample_rate as f32)),
        }
    }

    /// Set a new target in dB; the gain ramps from its current value.
    #[inline]
    pub fn set_db(&mut self, db: f32) {
        self.target = db_to_linear(db);
    }

    /// Jump to `db` with no ramp. Only used before the pedalboard is live.
    pub fn set_db_immediate(&mut self, db: f32) {
        let gain = db_to_linear(db);
        self.current = gain;
        self.target = gain;
    }

    /// The gain applied to the most recent sample.
    #[inline]
    pub fn gain(&self) -> f32 {
        self.current
    }

    /// The linear gain currently being approached.
    #[inline]
    pub fn target(&self) -> f32 {
        self.target
    }

    /// True once the ramp has locked onto the target.
    #[inline]
    pub fn is_settled(&self) -> bool {
        self.current == self.target
    }

    /// Advance one sample and return the gain for it.
    #[inline]
    pub fn next_gain(&mut self) -> f32 {
        if self.current != self.target {
            self.current += self.coeff * (self.target - self.current);
            if (self.current - self.target).abs() < SETTLE_EPSILON {
                self.current = self.target;
            }
        }
        self.current
    }

    /// Fill `ramp` with per-sample gains, advancing the smoother.
    ///
    /// The same ramp multiplies every channel of a block so channels stay
    /// gain-matched sample for sample.
    pub fn fill_ramp(&mut self, ramp: &mut [f32]) {
        if self.is_settled() {
            ramp.fill(self.current);
            return;
        }
        for slot in ramp.iter_mut() {
            *slot = self.next_gain();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_settled_at_initial_db() {
        let dz = DbDezipper::new(48000.0, -6.0206);
        assert!(dz.is_settled());
        assert!((dz.gain() - 0.5).abs() < 1e-4);
    }

    #[test]
    fn approach_is_monotonic_and_never_overshoots() {
        let mut dz = DbDezipper::new(48000.0, -120.0);
        dz.set_db(0.0);
        let mut last = dz.gain();
        for _ in 0..48000 {
            let g = dz.next_gain();
            assert!(g >= last, "gain went backwards: {last} -> {g}");
            assert!(g <= 1.0 + 1e-6, "overshoot: {g}");
            last = g;
        }
        assert!(dz.is_settled());
        assert!((dz.gain() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn full_scale_step_settles_within_ten_ms() {
        let sample_rate = 48000.0;
        let mut dz = DbDezipper::new(sample_rate, -120.0);
        dz.set_db(0.0);
        let ten_ms = (sample_rate * 0.010) as usize;
        for _ in 0..ten_ms {
            dz.next_gain();
        }
        assert!(
            (dz.gain() - 1.0).abs() < 0.01,
            "gain after 10 ms: {}",
            dz.gain()
        );
    }

    #[test]
    fn block_count_bound_holds_for_any_period() {
        // The §8-style bound: within ceil(10ms * sr / F) blocks of F frames.
        let sample_rate = 48000.0;
        for frames in [16usize, 64, 256, 1024] {
            let mut dz = DbDezipper::new(sample_rate, 0.0);
            dz.set_db(-20.0);
            let blocks = ((0.010 * sample_rate) / frames as f64).ceil() as usize;
            let mut ramp = vec![0.0f32; frames];
            for _ in 0..blocks {
                dz.fill_ramp(&mut ramp);
            }
            let target = db_to_linear(-20.0);
            assert!(
                (dz.gain() - target).abs() / target < 0.02,
                "frames={frames}: gain {} vs target {target}",
                dz.gain()
            );
        }
    }

    #[test]
    fn ramp_fill_matches_per_sample_advance() {
        let mut a = DbDezipper::new(48000.0, 0.0);
        let mut b = a.clone();
        a.set_db(-12.0);
        b.set_db(-12.0);

        let mut ramp = [0.0f32; 128];
        a.fill_ramp(&mut ramp);
        for (i, &g) in ramp.iter().enumerate() {
            let expected = b.next_gain();
            assert!((g - expected).abs() < 1e-9, "sample {i}");
        }
    }
}
