//! Step-ladder decisions
//!
//! The ladder moves at most one rung per tick. Rung granularity, not the size
//! of the growth-rate deviation, sets the step size.

use serde::Serialize;
use std::fmt;

use vialstat_common::{stats, GrowthRateRecord, SelectionLadder, SelectionParams};

/// Trailing growth-rate statistics for a vial
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GrowthWindow {
    /// Median rate over the last `min_curves_per_step` curves
    pub trailing_rate: f64,
    /// Time of the newest growth-rate sample
    pub last_sample_time: f64,
    /// Curves completed since the step last changed
    pub curves_this_step: usize,
}

impl GrowthWindow {
    /// Summarize growth records; `None` when there are none
    pub fn from_records(
        records: &[GrowthRateRecord],
        min_curves_per_step: u32,
        step_changed_time: f64,
    ) -> Option<Self> {
        let last = records.last()?;
        let tail = records.len().saturating_sub(min_curves_per_step as usize);
        let rates: Vec<f64> = records[tail..].iter().map(|r| r.rate).collect();

        Some(Self {
            trailing_rate: stats::median(&rates)?,
            last_sample_time: last.time,
            curves_this_step: records
                .iter()
                .filter(|r| r.time > step_changed_time)
                .count(),
        })
    }
}

/// Why the ladder moved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeReason {
    GrowthStalled,
    LowGrowthRate,
    HighGrowthRate,
}

impl fmt::Display for ChangeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeReason::GrowthStalled => f.write_str("growth stalled"),
            ChangeReason::LowGrowthRate => f.write_str("-LOW GROWTH RATE-"),
            ChangeReason::HighGrowthRate => f.write_str("-HIGH GROWTH RATE-"),
        }
    }
}

/// Transition chosen for this tick
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "change", content = "reasons", rename_all = "snake_case")]
pub enum Decision {
    Stay,
    Decrease(Vec<ChangeReason>),
    Increase(Vec<ChangeReason>),
}

impl Decision {
    pub fn label(&self) -> Option<&'static str> {
        match self {
            Decision::Stay => None,
            Decision::Decrease(_) => Some("DECREASE"),
            Decision::Increase(_) => Some("INCREASE"),
        }
    }

    pub fn reasons(&self) -> &[ChangeReason] {
        match self {
            Decision::Stay => &[],
            Decision::Decrease(reasons) | Decision::Increase(reasons) => reasons,
        }
    }
}

/// Choose a transition from trailing growth statistics.
///
/// A stall decreases regardless of curve counts; rate-based moves need
/// `min_curves_per_step` curves on the current step. A decrease is never
/// replaced by an increase.
pub fn decide(params: &SelectionParams, window: &GrowthWindow, elapsed: f64) -> Decision {
    let enough_curves = window.curves_this_step >= params.min_curves_per_step as usize;

    let mut reasons = Vec::new();
    if elapsed - window.last_sample_time > params.growth_stalled_time {
        reasons.push(ChangeReason::GrowthStalled);
    }
    if window.trailing_rate < params.min_growthrate && enough_curves {
        reasons.push(ChangeReason::LowGrowthRate);
    }
    if !reasons.is_empty() {
        return Decision::Decrease(reasons);
    }

    if window.trailing_rate > params.max_growthrate && enough_curves {
        return Decision::Increase(vec![ChangeReason::HighGrowthRate]);
    }

    Decision::Stay
}

/// Ladder position worth warning about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LadderEdge {
    /// Decreased below the first rung; target is now zero
    ClampedToZero,
    /// Decreased onto the first rung
    ReachedFirst,
    /// Increased from the second-to-last rung
    SecondToLast,
    /// Already on the top rung
    Maximum,
}

/// One ladder transition
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LadderMove {
    pub from: f64,
    pub to: f64,
    pub edge: Option<LadderEdge>,
}

impl LadderMove {
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

/// Move one rung down from the rung nearest `current`
pub fn step_down(ladder: &SelectionLadder, current: f64) -> LadderMove {
    let index = ladder.closest_index(current);
    let (to, edge) = match index {
        0 => (0.0, Some(LadderEdge::ClampedToZero)),
        1 => (ladder.step(0), Some(LadderEdge::ReachedFirst)),
        _ => (ladder.step(index - 1), None),
    };
    LadderMove {
        from: current,
        to,
        edge,
    }
}

/// Move one rung up from the rung nearest `current`
pub fn step_up(ladder: &SelectionLadder, current: f64) -> LadderMove {
    let index = ladder.closest_index(current);
    let last = ladder.last_index();

    let to = if current < ladder.first() || ladder.len() == 1 {
        ladder.first()
    } else if index < last {
        ladder.step(index + 1)
    } else {
        current
    };

    let edge = if ladder.len() > 1 && index == last - 1 {
        Some(LadderEdge::SecondToLast)
    } else if ladder.len() > 1 && index == last {
        Some(LadderEdge::Maximum)
    } else {
        None
    };

    LadderMove {
        from: current,
        to,
        edge,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> SelectionParams {
        SelectionParams {
            stock_concentration: 100.0,
            curves_to_start: 2,
            min_curves_per_step: 3,
            min_step_time: 0.0,
            growth_stalled_time: 8.0,
            min_growthrate: 0.1,
            max_growthrate: 0.3,
            rescue_dilutions: 2,
            rescue_threshold: 0.5,
            selection_units: "ug/mL".to_string(),
        }
    }

    fn ladder() -> SelectionLadder {
        SelectionLadder::new(0, vec![5.0, 10.0, 20.0, 40.0]).unwrap()
    }

    fn window(rate: f64, curves: usize, last: f64) -> GrowthWindow {
        GrowthWindow {
            trailing_rate: rate,
            last_sample_time: last,
            curves_this_step: curves,
        }
    }

    #[test]
    fn test_growth_window() {
        let records: Vec<GrowthRateRecord> = [(1.0, 0.9), (2.0, 0.2), (3.0, 0.3), (4.0, 0.1)]
            .iter()
            .map(|&(t, r)| GrowthRateRecord::new(t, r))
            .collect();
        let w = GrowthWindow::from_records(&records, 3, 1.5).unwrap();
        assert_eq!(w.trailing_rate, 0.2);
        assert_eq!(w.last_sample_time, 4.0);
        assert_eq!(w.curves_this_step, 3);
        assert_eq!(GrowthWindow::from_records(&[], 3, 0.0), None);
    }

    #[test]
    fn test_low_growth_decreases() {
        let d = decide(&params(), &window(0.05, 4, 10.0), 10.5);
        assert_eq!(d, Decision::Decrease(vec![ChangeReason::LowGrowthRate]));
    }

    #[test]
    fn test_low_growth_needs_curves() {
        let d = decide(&params(), &window(0.05, 2, 10.0), 10.5);
        assert_eq!(d, Decision::Stay);
    }

    #[test]
    fn test_stall_overrides_curve_count_and_high_rate() {
        let d = decide(&params(), &window(0.9, 5, 1.0), 12.0);
        assert_eq!(d, Decision::Decrease(vec![ChangeReason::GrowthStalled]));
    }

    #[test]
    fn test_high_growth_increases() {
        let d = decide(&params(), &window(0.5, 3, 10.0), 10.5);
        assert_eq!(d, Decision::Increase(vec![ChangeReason::HighGrowthRate]));
        assert_eq!(d.label(), Some("INCREASE"));
    }

    #[test]
    fn test_step_down() {
        let l = ladder();
        assert_eq!(step_down(&l, 20.0).to, 10.0);
        assert_eq!(step_down(&l, 20.0).edge, None);

        let first = step_down(&l, 10.0);
        assert_eq!(first.to, 5.0);
        assert_eq!(first.edge, Some(LadderEdge::ReachedFirst));

        let zero = step_down(&l, 5.0);
        assert_eq!(zero.to, 0.0);
        assert_eq!(zero.edge, Some(LadderEdge::ClampedToZero));

        // Repeated decreases at zero stay at zero
        let again = step_down(&l, 0.0);
        assert_eq!(again.to, 0.0);
        assert!(!again.changed());
    }

    #[test]
    fn test_step_up() {
        let l = ladder();
        assert_eq!(step_up(&l, 0.0).to, 5.0);
        assert_eq!(step_up(&l, 5.0).to, 10.0);

        let near_top = step_up(&l, 20.0);
        assert_eq!(near_top.to, 40.0);
        assert_eq!(near_top.edge, Some(LadderEdge::SecondToLast));

        let top = step_up(&l, 40.0);
        assert_eq!(top.to, 40.0);
        assert!(!top.changed());
        assert_eq!(top.edge, Some(LadderEdge::Maximum));
    }

    #[test]
    fn test_step_up_off_ladder_snaps_to_next_rung() {
        let l = ladder();
        // 13 is nearest 10, so the next rung is 20
        assert_eq!(step_up(&l, 13.0).to, 20.0);
    }

    #[test]
    fn test_single_rung_ladder() {
        let l = SelectionLadder::new(0, vec![8.0]).unwrap();
        let up = step_up(&l, 8.0);
        assert_eq!(up.to, 8.0);
        assert_eq!(up.edge, None);
        assert_eq!(step_down(&l, 8.0).to, 0.0);
    }

    #[test]
    fn test_moves_stay_on_ladder() {
        let l = ladder();
        let mut target = 0.0;
        for _ in 0..10 {
            target = step_up(&l, target).to;
            assert!(l.steps().contains(&target));
        }
        assert_eq!(target, 40.0);
        for _ in 0..10 {
            target = step_down(&l, target).to;
            assert!(target == 0.0 || l.steps().contains(&target));
        }
        assert_eq!(target, 0.0);
    }
}
