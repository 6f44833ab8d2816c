use anyhow::{bail, Result};

pub type VolumeResolution = [usize; 3];

/// Upper bound on the occupancy-grid size used for alpha-mask updates.
const MASK_VOXEL_LIMIT: usize = 256 * 256 * 256;

/// Precomputed progression of voxel-count targets, log-uniformly
/// interpolated between the initial and final budget and consumed one
/// entry at a time at fixed iteration checkpoints.
pub struct VolumeSchedule {
    checkpoints: Vec<usize>,
    targets: Vec<usize>,
    consumed: usize,
}

impl VolumeSchedule {
    pub fn new(
        initial_voxels: usize,
        final_voxels: usize,
        checkpoints: Vec<usize>,
    ) -> Result<Self> {
        if initial_voxels == 0 || final_voxels <= initial_voxels {
            bail!(
                "Voxel budget must grow from a non-zero initial count \
                ({} -> {})",
                initial_voxels,
                final_voxels
            );
        }
        if checkpoints.windows(2).any(|pair| pair[1] <= pair[0]) {
            bail!("Upsample checkpoints must be strictly increasing");
        }

        let steps = checkpoints.len() + 1;
        let log_initial = (initial_voxels as f64).ln();
        let log_final = (final_voxels as f64).ln();
        let targets = (1..=checkpoints.len())
            .map(|step| {
                let log_target = log_initial
                    + (log_final - log_initial) * (step as f64 / steps as f64);
                log_target.exp().round() as usize
            })
            .collect();

        Ok(Self {
            checkpoints,
            targets,
            consumed: 0,
        })
    }

    pub fn targets(&self) -> &[usize] {
        &self.targets
    }

    /// The next voxel target when `iteration` is an upsample checkpoint.
    pub fn upsample_at(&mut self, iteration: usize) -> Option<usize> {
        if self.consumed < self.checkpoints.len()
            && self.checkpoints[self.consumed] == iteration
        {
            let target = self.targets[self.consumed];
            self.consumed += 1;
            Some(target)
        } else {
            None
        }
    }
}

/// Derives a per-axis grid resolution from a voxel budget and the scene
/// extents, assuming cubical voxels.
pub fn voxels_to_resolution(n_voxels: usize, extents: [f32; 3]) -> VolumeResolution {
    let volume = (extents[0] * extents[1] * extents[2]) as f64;
    let voxel_size = (volume / n_voxels as f64).cbrt();
    let mut resolution = [1; 3];
    for (axis, extent) in extents.iter().enumerate() {
        resolution[axis] = ((*extent as f64 / voxel_size).round() as usize).max(1);
    }
    resolution
}

/// Per-ray sample count from the grid diagonal, capped by configuration.
pub fn samples_for_resolution(
    resolution: VolumeResolution,
    step_ratio: f64,
    cap: usize,
) -> usize {
    let diagonal = resolution
        .iter()
        .map(|&extent| (extent * extent) as f64)
        .sum::<f64>()
        .sqrt();
    ((diagonal / step_ratio) as usize).clamp(1, cap)
}

/// Per-iteration multiplicative factor reaching `target_ratio` after
/// `decay_iterations` applications. Shared by the learning-rate schedule
/// and the total-variation weights.
pub fn decay_factor(target_ratio: f64, decay_iterations: usize) -> f64 {
    target_ratio.powf((decay_iterations as f64).recip())
}

/// Learning-rate scale applied when the optimizer is rebuilt mid-run
/// without a reset to the initial rate.
pub fn decayed_scale(target_ratio: f64, iteration: usize, total_iterations: usize) -> f64 {
    target_ratio.powf(iteration as f64 / total_iterations as f64)
}

pub struct PruneStep {
    /// Shrink the model bounds to the non-empty region and switch the
    /// density-L1 weight to its sustained value.
    pub shrink_bounds: bool,
    /// Discard training rays that miss the non-empty bounds and rebuild
    /// the uniform sampler.
    pub filter_rays: bool,
}

/// Fires alpha-mask updates at fixed iteration checkpoints. The mask
/// grid resolution follows the training resolution while it stays under
/// the voxel limit and holds at the last admissible value beyond it.
pub struct AlphaPruneSchedule {
    checkpoints: Vec<usize>,
    fired: usize,
    mask_resolution: VolumeResolution,
}

impl AlphaPruneSchedule {
    pub fn new(checkpoints: Vec<usize>, initial_resolution: VolumeResolution) -> Result<Self> {
        if checkpoints.windows(2).any(|pair| pair[1] <= pair[0]) {
            bail!("Alpha-mask checkpoints must be strictly increasing");
        }
        Ok(Self {
            checkpoints,
            fired: 0,
            mask_resolution: initial_resolution,
        })
    }

    pub fn mask_resolution(&mut self, current: VolumeResolution) -> VolumeResolution {
        if current.iter().product::<usize>() < MASK_VOXEL_LIMIT {
            self.mask_resolution = current;
        }
        self.mask_resolution
    }

    pub fn step_at(&mut self, iteration: usize, ndc_rays: bool) -> Option<PruneStep> {
        if self.fired < self.checkpoints.len()
            && self.checkpoints[self.fired] == iteration
        {
            let step = PruneStep {
                shrink_bounds: self.fired == 0,
                filter_rays: self.fired == 1 && !ndc_rays,
            };
            self.fired += 1;
            Some(step)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_schedule_reaches_the_final_budget() {
        let schedule =
            VolumeSchedule::new(128 * 128 * 128, 300 * 300 * 300, vec![2000, 3000, 4000, 5500, 7000])
                .unwrap();

        assert_eq!(schedule.targets().len(), 5);
        assert_eq!(*schedule.targets().last().unwrap(), 300 * 300 * 300);
        assert!(schedule
            .targets()
            .windows(2)
            .all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn volume_schedule_fires_only_at_checkpoints() {
        let mut schedule = VolumeSchedule::new(1_000, 8_000, vec![10, 20]).unwrap();

        assert!(schedule.upsample_at(5).is_none());
        let first = schedule.upsample_at(10).unwrap();
        assert!(schedule.upsample_at(10).is_none());
        let second = schedule.upsample_at(20).unwrap();
        assert!(first < second);
        assert_eq!(second, 8_000);
        assert!(schedule.upsample_at(30).is_none());
    }

    #[test]
    fn volume_schedule_rejects_shrinking_budgets() {
        assert!(VolumeSchedule::new(4_000, 4_000, vec![10]).is_err());
        assert!(VolumeSchedule::new(0, 4_000, vec![10]).is_err());
        assert!(VolumeSchedule::new(1_000, 8_000, vec![20, 10]).is_err());
    }

    #[test]
    fn resolution_matches_the_voxel_budget() {
        assert_eq!(voxels_to_resolution(512, [2.0, 2.0, 2.0]), [8, 8, 8]);
        assert_eq!(voxels_to_resolution(512, [4.0, 2.0, 1.0]), [16, 8, 4]);
    }

    #[test]
    fn sample_count_follows_the_grid_diagonal() {
        assert_eq!(samples_for_resolution([30, 40, 120], 0.5, 1_000), 260);
        assert_eq!(samples_for_resolution([30, 40, 120], 0.5, 200), 200);
        assert_eq!(samples_for_resolution([1, 1, 1], 10.0, 200), 1);
    }

    #[test]
    fn decay_compounds_to_the_target_ratio() {
        let factor = decay_factor(0.1, 30_000);
        let mut weight = 1.0f64;
        for _ in 0..30_000 {
            weight *= factor;
        }
        assert!((weight - 0.1).abs() < 1e-9);

        assert!((decayed_scale(0.1, 15_000, 30_000) - 0.1f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn prune_schedule_orders_shrink_then_filter() {
        let mut schedule =
            AlphaPruneSchedule::new(vec![2000, 4000, 6000], [128, 128, 128]).unwrap();

        assert!(schedule.step_at(1999, false).is_none());

        let first = schedule.step_at(2000, false).unwrap();
        assert!(first.shrink_bounds && !first.filter_rays);

        let second = schedule.step_at(4000, false).unwrap();
        assert!(!second.shrink_bounds && second.filter_rays);

        let third = schedule.step_at(6000, false).unwrap();
        assert!(!third.shrink_bounds && !third.filter_rays);
    }

    #[test]
    fn prune_schedule_keeps_rays_in_ndc_mode() {
        let mut schedule = AlphaPruneSchedule::new(vec![10, 20], [64, 64, 64]).unwrap();
        schedule.step_at(10, true);
        let second = schedule.step_at(20, true).unwrap();
        assert!(!second.filter_rays);
    }

    #[test]
    fn mask_resolution_saturates_at_the_voxel_limit() {
        let mut schedule = AlphaPruneSchedule::new(vec![10], [64, 64, 64]).unwrap();

        assert_eq!(schedule.mask_resolution([128, 128, 128]), [128, 128, 128]);
        assert_eq!(schedule.mask_resolution([300, 300, 300]), [128, 128, 128]);
        assert_eq!(schedule.mask_resolution([200, 200, 200]), [200, 200, 200]);
    }
}
