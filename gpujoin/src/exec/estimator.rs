// Copyright 2018-2022 Clemens Lutz
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::chunk::{row_store_len, slot_store_len};
use crate::config::JoinConfig;
use crate::control::{index_row_len, ControlBlock};
use crate::error::{ErrorKind, Result};
use crate::plan::{JoinPlan, ResultFormat};
use crate::tuple::to_u32;
use tracing::info;

/// Row counts observed by successful tasks.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RuntimeStats {
    /// Admitted source rows.
    pub source_nitems: u64,

    /// Rows produced per depth.
    pub outer_nitems: Vec<u64>,
}

impl RuntimeStats {
    pub fn new(num_rels: usize) -> Self {
        Self {
            source_nitems: 0,
            outer_nitems: vec![0; num_rels + 1],
        }
    }

    pub fn record(&mut self, control: &ControlBlock) {
        self.source_nitems += control.oitems_nums as u64;
        for (total, &nitems) in self.outer_nitems.iter_mut().zip(control.outer_nitems.iter()) {
            *total += nitems as u64;
        }
    }

    /// Largest growth of the intermediate results per source row.
    pub fn kresults_ratio(&self) -> Option<f64> {
        if self.source_nitems == 0 {
            return None;
        }
        let peak = self.outer_nitems.iter().copied().max().unwrap_or(0);
        Some(f64::max(peak as f64 / self.source_nitems as f64, 1.0))
    }

    /// Result rows per source row.
    pub fn dst_ratio(&self) -> Option<f64> {
        if self.source_nitems == 0 {
            return None;
        }
        let last = self.outer_nitems.last().copied().unwrap_or(0);
        Some(last as f64 / self.source_nitems as f64)
    }
}

/// What failed attempts of a task needed.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PriorAttempt {
    kresults_ratio: f64,
    dst_ratio: f64,
    kresults_needed: usize,
    dst_needed: usize,
}

impl PriorAttempt {
    /// Records an overflowed attempt. Earlier records are never lowered.
    pub fn record(&mut self, control: &ControlBlock) {
        let admitted = control.oitems_nums as f64;
        if admitted > 0.0 {
            self.kresults_ratio = f64::max(
                self.kresults_ratio,
                control.kresults_needed as f64 / admitted,
            );
            self.dst_ratio = f64::max(self.dst_ratio, control.dst_needed as f64 / admitted);
        }
        self.kresults_needed = std::cmp::max(self.kresults_needed, control.kresults_needed as usize);
        self.dst_needed = std::cmp::max(self.dst_needed, control.dst_needed as usize);
    }

    /// Keeps the per-row ratios, but forgets absolute counts, as they refer
    /// to other rows.
    pub fn for_continuation(&self) -> Self {
        Self {
            kresults_needed: 0,
            dst_needed: 0,
            ..*self
        }
    }
}

/// Buffer sizes of one task attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Estimate {
    /// Admitted source rows.
    pub oitems_nums: u32,

    /// Rooms of each result index region.
    pub kresults_nrooms: u32,

    /// Rooms of the destination.
    pub dst_nrooms: u32,
}

/// Predicts the buffer sizes of a task.
///
/// Until `progress_threshold` of the planned outer rows have been
/// processed, the planner's ratios are blended with the observed ones by
/// `observed_rows / (progress_threshold * planned_rows)`. Afterwards, only
/// the observed ratios count. All predictions are multiplied by the
/// configured margin.
#[derive(Debug)]
pub struct SizeEstimator<'a> {
    plan: &'a JoinPlan,
    config: &'a JoinConfig,
}

impl<'a> SizeEstimator<'a> {
    pub fn new(plan: &'a JoinPlan, config: &'a JoinConfig) -> Self {
        Self { plan, config }
    }

    /// Returns the blended (intermediate, destination) ratios.
    pub fn ratios(&self, stats: Option<&RuntimeStats>) -> (f64, f64) {
        let plan_kr = f64::max(self.plan.kresults_ratio, 1.0);
        let plan_dr = self
            .plan
            .depths
            .last()
            .map_or(1.0, |depth| depth.nrows_ratio);

        let stats = match stats {
            Some(stats) if stats.source_nitems > 0 => stats,
            _ => return (plan_kr, plan_dr),
        };
        let exec_kr = stats.kresults_ratio().unwrap_or(plan_kr);
        let exec_dr = stats.dst_ratio().unwrap_or(plan_dr);

        let threshold = self.config.progress_threshold * self.plan.outer_plan_rows;
        let processed = stats.source_nitems as f64;
        if processed >= threshold {
            (exec_kr, exec_dr)
        } else {
            let merge = processed / threshold;
            (
                plan_kr * (1.0 - merge) + exec_kr * merge,
                plan_dr * (1.0 - merge) + exec_dr * merge,
            )
        }
    }

    /// Sizes a task over `nitems` source rows.
    ///
    /// Runtime statistics are not applicable to sweep tasks, which pass
    /// `None`.
    pub fn estimate(
        &self,
        nitems: usize,
        stats: Option<&RuntimeStats>,
        prior: Option<&PriorAttempt>,
    ) -> Result<Estimate> {
        let margin = self.config.chunk_size_margin;
        let (mut kr, mut dr) = self.ratios(stats);
        if let Some(prior) = prior {
            kr = f64::max(kr, prior.kresults_ratio);
            dr = f64::max(dr, prior.dst_ratio);
        }

        let rooms = |ratio: f64| (nitems as f64 * ratio * margin).ceil() as usize;
        let mut oitems = nitems;
        let mut kresults_nrooms = std::cmp::max(rooms(kr), nitems);
        let mut dst_nrooms = rooms(dr);
        if let Some(prior) = prior {
            let at_least = |needed: usize| (needed as f64 * margin).ceil() as usize;
            kresults_nrooms = std::cmp::max(kresults_nrooms, at_least(prior.kresults_needed));
            dst_nrooms = std::cmp::max(dst_nrooms, at_least(prior.dst_needed));
        }

        let max_kresults = self.config.chunk_size / index_row_len(self.plan.num_rels());
        if kresults_nrooms > max_kresults {
            let reduced = (oitems as f64 * max_kresults as f64 / kresults_nrooms as f64) as usize;
            info!(
                nitems = oitems,
                admitted = reduced,
                kresults_nrooms,
                max_kresults,
                "Reduction of outer rows to fit the intermediate results"
            );
            dst_nrooms = (dst_nrooms as f64 * reduced as f64 / oitems.max(1) as f64).ceil() as usize;
            oitems = reduced;
            kresults_nrooms = max_kresults;
        }

        let ncols = self.plan.target_list.len();
        match self.plan.result_format {
            ResultFormat::Slot if ncols == 0 => {
                dst_nrooms = u32::MAX as usize;
            }
            format => {
                let dst_len = |nrooms: usize| match format {
                    ResultFormat::Row => row_store_len(ncols, nrooms),
                    ResultFormat::Slot => slot_store_len(ncols, nrooms),
                };
                let min_rooms = rooms_within(self.config.chunk_size / 4, &dst_len);
                let max_rooms = rooms_within(self.config.chunk_size_limit, &dst_len);

                dst_nrooms = std::cmp::max(dst_nrooms, min_rooms);
                if dst_nrooms > max_rooms {
                    let reduced = (oitems as f64 * max_rooms as f64 / dst_nrooms as f64) as usize;
                    info!(
                        nitems = oitems,
                        admitted = reduced,
                        dst_nrooms,
                        max_rooms,
                        "Reduction of outer rows to fit the destination"
                    );
                    oitems = reduced;
                    dst_nrooms = max_rooms;
                }
            }
        }

        if oitems == 0 && nitems > 0 {
            Err(ErrorKind::ResultGrowthTooLarge(format!(
                "Not a single outer row fits the result buffers (growth ratio {:.2}, result ratio {:.2})",
                kr, dr
            )))?;
        }

        Ok(Estimate {
            oitems_nums: to_u32(oitems, "Admitted rows")?,
            kresults_nrooms: to_u32(kresults_nrooms, "Result index rooms")?,
            dst_nrooms: to_u32(dst_nrooms, "Destination rooms")?,
        })
    }
}

/// Largest room count whose buffer fits into `bytes`.
fn rooms_within<F>(bytes: usize, len: &F) -> usize
where
    F: Fn(usize) -> usize,
{
    if len(0) > bytes {
        return 0;
    }
    let per_room = std::cmp::max(len(1) - len(0), 1);
    let mut rooms = (bytes - len(0)) / per_room;
    while rooms > 0 && len(rooms) > bytes {
        rooms -= 1;
    }
    rooms
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{ColumnRef, DepthPlan, JoinType};
    use assert_approx_eq::assert_approx_eq;

    fn plan() -> JoinPlan {
        JoinPlan::new(
            1,
            vec![
                DepthPlan::hash(JoinType::Inner, 1, vec![ColumnRef::new(0, 0)], vec![0])
                    .nrows_ratio(2.0),
            ],
            vec![ColumnRef::new(0, 0), ColumnRef::new(1, 0)],
        )
        .outer_plan_rows(10_000.0)
        .kresults_ratio(3.0)
    }

    fn observed(source: u64, depth1: u64) -> RuntimeStats {
        RuntimeStats {
            source_nitems: source,
            outer_nitems: vec![source, depth1],
        }
    }

    #[test]
    fn planner_ratios_without_statistics() -> Result<()> {
        let plan = plan();
        let config = JoinConfig::default();
        let estimator = SizeEstimator::new(&plan, &config);

        let (kr, dr) = estimator.ratios(None);
        assert_approx_eq!(kr, 3.0);
        assert_approx_eq!(dr, 2.0);

        let estimate = estimator.estimate(1000, None, None)?;
        assert_eq!(estimate.oitems_nums, 1000);
        assert_eq!(estimate.kresults_nrooms, 3750);
        Ok(())
    }

    #[test]
    fn ratios_blend_below_threshold() {
        let plan = plan();
        let config = JoinConfig::default();
        let estimator = SizeEstimator::new(&plan, &config);

        // Half of the 30 % threshold of 10,000 planned rows.
        let (kr, dr) = estimator.ratios(Some(&observed(1500, 6000)));
        assert_approx_eq!(kr, 0.5 * 3.0 + 0.5 * 4.0);
        assert_approx_eq!(dr, 0.5 * 2.0 + 0.5 * 4.0);
    }

    #[test]
    fn observed_ratios_rule_above_threshold() {
        let plan = plan();
        let config = JoinConfig::default();
        let estimator = SizeEstimator::new(&plan, &config);

        let (kr, dr) = estimator.ratios(Some(&observed(5000, 2500)));
        assert_approx_eq!(kr, 1.0);
        assert_approx_eq!(dr, 0.5);
    }

    #[test]
    fn overflow_never_shrinks_prediction() -> Result<()> {
        let plan = plan();
        let config = JoinConfig::default();
        let estimator = SizeEstimator::new(&plan, &config);

        let mut control = ControlBlock::new(1, 1)?;
        control.oitems_nums = 100;
        control.kresults_needed = 5000;
        let mut prior = PriorAttempt::default();
        prior.record(&control);

        let estimate = estimator.estimate(100, None, Some(&prior))?;
        assert!(estimate.kresults_nrooms >= 5000);
        Ok(())
    }

    #[test]
    fn oversized_results_reduce_admitted_rows() -> Result<()> {
        let plan = plan();
        let config = JoinConfig::default().chunk_size(64 * 1024);
        let estimator = SizeEstimator::new(&plan, &config);

        let estimate = estimator.estimate(100_000, None, None)?;
        let max_kresults = 64 * 1024 / index_row_len(1);

        assert_eq!(estimate.kresults_nrooms as usize, max_kresults);
        assert!((estimate.oitems_nums as usize) < 100_000);
        assert!(estimate.oitems_nums > 0);
        Ok(())
    }

    #[test]
    fn destination_has_a_minimum_size() -> Result<()> {
        let plan = plan();
        let config = JoinConfig::default();
        let estimator = SizeEstimator::new(&plan, &config);

        let estimate = estimator.estimate(1, None, None)?;
        let len = row_store_len(2, estimate.dst_nrooms as usize);
        assert!(len <= config.chunk_size / 4);
        assert!(len + 100 > config.chunk_size / 4);
        Ok(())
    }

    #[test]
    fn single_row_beyond_limits_is_fatal() {
        let plan = plan().kresults_ratio(1e9);
        let config = JoinConfig::default();
        let estimator = SizeEstimator::new(&plan, &config);

        match estimator.estimate(10, None, None) {
            Err(e) => match e.kind() {
                ErrorKind::ResultGrowthTooLarge(_) => {}
                other => panic!("Unexpected error: {}", other),
            },
            Ok(estimate) => panic!("Expected an error, got {:?}", estimate),
        }
    }
}
