//! The log-odds sensor model: classification thresholds, hit/miss update
//! magnitudes and clamping limits.

/// `ln(p / (1 - p))`. Log-odds are additive under independent updates,
/// which is what makes the per-voxel update a single addition.
#[inline]
pub fn logit(probability: f32) -> f32 {
    (probability / (1.0 - probability)).ln()
}

/// The inverse of [`logit`].
#[inline]
pub fn probability(logit: f32) -> f32 {
    1.0 - (1.0 / (1.0 + logit.exp()))
}

/// All sensor-model parameters, stored as log-odds.
#[derive(Clone, Copy, Debug)]
pub(crate) struct SensorModel {
    pub occupancy_thres_log: f32,
    pub free_thres_log: f32,
    pub prob_hit_log: f32,
    pub prob_miss_log: f32,
    pub clamp_min_log: f32,
    pub clamp_max_log: f32,
}

impl SensorModel {
    #[inline]
    pub fn clamp(&self, logit: f32) -> f32 {
        logit.clamp(self.clamp_min_log, self.clamp_max_log)
    }

    #[inline]
    pub fn is_occupied_logit(&self, logit: f32) -> bool {
        logit > self.occupancy_thres_log
    }

    #[inline]
    pub fn is_free_logit(&self, logit: f32) -> bool {
        logit < self.free_thres_log
    }

    #[inline]
    pub fn is_unknown_logit(&self, logit: f32) -> bool {
        self.free_thres_log <= logit && logit <= self.occupancy_thres_log
    }
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝

#[cfg(test)]
mod tests {
    use super::*;

    use approx::assert_relative_eq;

    fn model() -> SensorModel {
        SensorModel {
            occupancy_thres_log: logit(0.5),
            free_thres_log: logit(0.5),
            prob_hit_log: logit(0.7),
            prob_miss_log: logit(0.4),
            clamp_min_log: logit(0.1192),
            clamp_max_log: logit(0.971),
        }
    }

    #[test]
    fn logit_round_trips_through_probability() {
        for p in [0.1, 0.4, 0.5, 0.7, 0.971] {
            assert_relative_eq!(probability(logit(p)), p, epsilon = 1e-6);
        }
    }

    #[test]
    fn the_three_states_partition_the_value_range() {
        let m = model();

        for l in [-3.5, -0.1, 0.0, 0.1, 3.5] {
            let states = [
                m.is_occupied_logit(l),
                m.is_free_logit(l),
                m.is_unknown_logit(l),
            ];
            assert_eq!(states.iter().filter(|&&s| s).count(), 1, "logit {}", l);
        }
    }

    #[test]
    fn fresh_voxels_are_unknown() {
        assert!(model().is_unknown_logit(0.0));
    }
}
