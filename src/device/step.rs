//! step.rs
//! Step-response run: WARMUP -> BASELINE -> STEP.
//!
//! The commanded duration stays in `StepParams`; the run keeps its own tick
//! deadline derived from it at activation.

use crate::device::params::StepParams;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepPhase {
    Warmup,
    Baseline,
    Step,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepTick {
    pub phase: StepPhase,
    pub drive: u16,
    pub applied: f64,
    pub emit: bool,
    /// Last tick of the run; the caller stops the motor after emitting.
    pub finished: bool,
}

#[derive(Debug, Clone)]
pub struct StepRun {
    phase: StepPhase,
    warmup_left: u32,
    baseline_left: u32,
    step_ticks: u64,
    deadline_ticks: u64,
}

impl StepRun {
    pub fn start(params: &StepParams, period_ms: u64) -> Self {
        // whole milliseconds, so 16.1 s is 16100 ms and not one float ulp above it
        let duration_ms = (params.duration_s.max(0.0) * 1000.0).round() as u64;
        let deadline_ticks = duration_ms.div_ceil(period_ms.max(1)).max(1);
        let mut run = Self {
            phase: StepPhase::Warmup,
            warmup_left: params.warmup_samples,
            baseline_left: params.baseline_samples,
            step_ticks: 0,
            deadline_ticks,
        };
        run.skip_empty_phases();
        run
    }

    fn skip_empty_phases(&mut self) {
        if self.phase == StepPhase::Warmup && self.warmup_left == 0 {
            self.phase = StepPhase::Baseline;
        }
        if self.phase == StepPhase::Baseline && self.baseline_left == 0 {
            self.phase = StepPhase::Step;
        }
    }

    pub fn phase(&self) -> StepPhase {
        self.phase
    }

    pub fn deadline_ticks(&self) -> u64 {
        self.deadline_ticks
    }

    pub fn tick(&mut self, params: &StepParams) -> StepTick {
        let phase = self.phase;
        let out = match phase {
            StepPhase::Warmup => {
                self.warmup_left -= 1;
                StepTick { phase, drive: 0, applied: 0.0, emit: false, finished: false }
            }
            StepPhase::Baseline => {
                self.baseline_left -= 1;
                StepTick { phase, drive: 0, applied: 0.0, emit: true, finished: false }
            }
            StepPhase::Step => {
                self.step_ticks += 1;
                let finished = self.step_ticks >= self.deadline_ticks;
                if finished {
                    self.phase = StepPhase::Done;
                }
                StepTick {
                    phase,
                    drive: params.drive_for(params.amplitude),
                    applied: params.amplitude,
                    emit: true,
                    finished,
                }
            }
            StepPhase::Done => {
                return StepTick { phase, drive: 0, applied: 0.0, emit: false, finished: true };
            }
        };
        self.skip_empty_phases();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> StepParams {
        StepParams {
            amplitude: 4.2,
            duration_s: 0.1,
            warmup_samples: 3,
            baseline_samples: 4,
            ..StepParams::default()
        }
    }

    #[test]
    fn phases_run_in_order() {
        let p = params();
        let mut run = StepRun::start(&p, 20);
        assert_eq!(run.deadline_ticks(), 5);

        let ticks: Vec<StepTick> = (0..12).map(|_| run.tick(&p)).collect();
        assert!(ticks[..3].iter().all(|t| !t.emit && t.drive == 0));
        assert!(ticks[3..7].iter().all(|t| t.emit && t.applied == 0.0 && t.drive == 0));
        assert!(ticks[7..12].iter().all(|t| t.emit && t.applied == 4.2));
        assert!(ticks[11].finished);
        assert!(!ticks[10].finished);
        assert_eq!(run.phase(), StepPhase::Done);
    }

    #[test]
    fn deadline_is_exact_for_decimal_durations() {
        let p = StepParams {
            duration_s: 16.1,
            ..params()
        };
        assert_eq!(StepRun::start(&p, 20).deadline_ticks(), 805);
        let p = StepParams {
            duration_s: 0.11,
            ..params()
        };
        assert_eq!(StepRun::start(&p, 20).deadline_ticks(), 6);
    }

    #[test]
    fn run_leaves_commanded_duration_alone() {
        let p = params();
        let mut run = StepRun::start(&p, 20);
        while !run.tick(&p).finished {}
        assert_eq!(p.duration_s, 0.1);
    }

    #[test]
    fn zero_warmup_and_baseline_go_straight_to_step() {
        let p = StepParams {
            warmup_samples: 0,
            baseline_samples: 0,
            ..params()
        };
        let mut run = StepRun::start(&p, 20);
        assert_eq!(run.phase(), StepPhase::Step);
        assert_eq!(run.tick(&p).applied, 4.2);
    }
}
