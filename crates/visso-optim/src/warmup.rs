//! KL-weighting warm-up schedule

/// Values in effect after a warm-up adjustment
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KlSchedule {
    pub kl_weighting: f64,
    pub l2_reg: f64,
    pub std_scale: f64,
}

/// Linear ramp of the KL weighting from `init` to `target`
///
/// `l2_reg` scales with `kl / init` and `std_scale` with its square root,
/// starting from the values computed at construction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KlWarmup {
    pub init: f64,
    pub target: f64,
    pub steps: u64,
    pub base_l2_reg: f64,
    pub base_std_scale: f64,
}

impl KlWarmup {
    /// Schedule at `step`, or `None` once the warm-up is over
    pub fn at(&self, step: u64) -> Option<KlSchedule> {
        if self.steps < step {
            return None;
        }
        let progress = if self.steps == 0 {
            1.0
        } else {
            step as f64 / self.steps as f64
        };
        let kl_weighting = self.init + progress * (self.target - self.init);
        let rate = kl_weighting / self.init;
        Some(KlSchedule {
            kl_weighting,
            l2_reg: rate * self.base_l2_reg,
            std_scale: rate.sqrt() * self.base_std_scale,
        })
    }
}
