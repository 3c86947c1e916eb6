//! Trapezoidal step timing profile
//!
//! Maps a step index to the inter-step interval for a move of known length:
//! accelerate at constant steps/s² until cruise speed or the halfway point,
//! cruise, then decelerate so velocity lands back at the entry speed exactly
//! on the final step. Short moves never reach cruise and become triangular.

use std::time::Duration;

pub struct StepProfile {
    total_steps: u64,
    accel_steps: u64,
    decel_start: u64,
    v_start: f64,
    v_max: f64,
    accel: f64,
}

impl StepProfile {
    pub fn new(total_steps: u64, max_sps: u32, accel_sps2: u32) -> Self {
        let accel = (accel_sps2.max(1)) as f64;
        let v_max = (max_sps.max(1)) as f64;
        // Entry velocity consistent with constant acceleration across the
        // first step from rest: 1 = a*t²/2  =>  v = sqrt(2a).
        let v_start = (2.0 * accel).sqrt().min(v_max);

        // Steps needed to ramp v_start -> v_max, capped by the halfway point.
        let ramp = ((v_max * v_max - v_start * v_start) / (2.0 * accel)).ceil() as u64;
        let accel_steps = ramp.min(total_steps / 2);

        Self {
            total_steps,
            accel_steps,
            decel_start: total_steps - accel_steps,
            v_start,
            v_max,
            accel,
        }
    }

    /// Instantaneous velocity at `step_index`, in steps per second
    pub fn velocity(&self, step_index: u64) -> f64 {
        let v = if step_index < self.accel_steps {
            let n = step_index as f64;
            (self.v_start * self.v_start + 2.0 * self.accel * n).sqrt()
        } else if step_index >= self.decel_start {
            let remaining = (self.total_steps - step_index) as f64;
            (self.v_start * self.v_start + 2.0 * self.accel * remaining).sqrt()
        } else {
            self.v_max
        };
        v.min(self.v_max)
    }

    /// Inter-step interval after emitting step `step_index`
    pub fn interval(&self, step_index: u64) -> Duration {
        Duration::from_secs_f64(1.0 / self.velocity(step_index))
    }
}
