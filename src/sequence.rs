/*!
 # Staged dimming sequencer

 One trigger produces at most one run: a synchronous go/no-go decision
 followed by a timed sequence of brightness steps toward full, with a
 cooperative interrupt consulted at every step boundary.
*/

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Weekday;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument};

use crate::lights::{LightService, FULL_LEVEL, MANUAL_LIGHT_THRESHOLD};
use crate::timer::Clock;

/// Minutes between brightness steps.
pub const STEP_MINUTES: u32 = 1;

/// How a multi-fixture room is brought to its starting point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DimMode {
    /// Equalize every fixture to the brightest current reading, then ramp
    /// them together.
    #[default]
    Scale,
    /// Ramp each fixture independently from its own current level.
    Level,
}

/// Trajectory state for a single wake-up ramp.
///
/// Levels accumulate a fixed per-fixture delta each stage rather than
/// being recomputed, so rounding error cannot compound past the final
/// stage, and the final stage writes the exact target regardless.
#[derive(Debug)]
pub struct SequenceRun {
    levels: Vec<f64>,
    deltas: Vec<f64>,
    stage_count: u32,
    current_stage: u32,
}

impl SequenceRun {
    /// Plans a ramp from `levels` to full brightness over `lead_in_min`
    /// minutes, one stage per step interval.
    pub fn plan(levels: Vec<f64>, lead_in_min: u32) -> Self {
        let stage_count = lead_in_min.div_ceil(STEP_MINUTES).max(1);
        let deltas = levels
            .iter()
            .map(|level| (FULL_LEVEL - level) / f64::from(stage_count))
            .collect();
        Self {
            levels,
            deltas,
            stage_count,
            current_stage: 1,
        }
    }

    /// Advances one stage and returns the new level of every fixture. The
    /// final stage lands each fixture exactly on full brightness.
    fn advance(&mut self) -> &[f64] {
        let last = self.current_stage >= self.stage_count;
        for (level, delta) in self.levels.iter_mut().zip(&self.deltas) {
            *level = if last { FULL_LEVEL } else { *level + *delta };
        }
        self.current_stage += 1;
        &self.levels
    }

    fn finished(&self) -> bool {
        self.current_stage > self.stage_count
    }

    /// Total number of stages in the ramp.
    pub fn stage_count(&self) -> u32 {
        self.stage_count
    }
}

struct ActiveRun {
    id: u64,
    interrupt: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

/// Executes one staged brightness ramp per trigger, or declines to run.
pub struct Sequencer {
    lights: Arc<dyn LightService>,
    clock: Arc<dyn Clock>,
    fixtures: Arc<[String]>,
    mode: DimMode,
    step_interval: Duration,
    active: Arc<Mutex<Option<ActiveRun>>>,
    next_run_id: AtomicU64,
}

impl Sequencer {
    pub(crate) fn new(
        lights: Arc<dyn LightService>,
        clock: Arc<dyn Clock>,
        fixtures: Vec<String>,
        mode: DimMode,
        step_interval: Duration,
    ) -> Self {
        Self {
            lights,
            clock,
            fixtures: fixtures.into(),
            mode,
            step_interval,
            active: Arc::new(Mutex::new(None)),
            next_run_id: AtomicU64::new(0),
        }
    }

    /// Whether a ramp is currently in progress.
    pub fn is_running(&self) -> bool {
        self.active.lock().is_some()
    }

    /// Asks the active run, if any, to stop at its next step boundary.
    ///
    /// Cancellation is cooperative: the run notices the request only when
    /// it next wakes up, up to one step interval later.
    pub fn interrupt(&self) {
        if let Some(run) = self.active.lock().as_ref() {
            debug!("interrupt requested for active sequence");
            run.interrupt.store(true, Ordering::SeqCst);
        }
    }

    /// Evaluates the run-start decision and, if it passes, starts a ramp.
    #[instrument(skip_all)]
    pub async fn trigger(&self, lead_in_min: u32, weekends_enabled: bool) {
        let (_, weekday) = self.clock.now();
        let weekend = matches!(weekday, Weekday::Sat | Weekday::Sun);
        if weekend && !weekends_enabled {
            debug!("weekend and weekends are disabled, skipping");
            return;
        }

        info!("alarm trip, starting sequence");

        let mut levels: Vec<f64> = Vec::with_capacity(self.fixtures.len());
        let mut peak: u8 = 0;
        for fixture in self.fixtures.iter() {
            let level = self.lights.brightness(fixture).unwrap_or(0);
            if level > MANUAL_LIGHT_THRESHOLD {
                info!("room already lit to {level}, aborting");
                return;
            }
            peak = peak.max(level);
            levels.push(f64::from(level));
        }

        // A fresh trigger replaces any run still in flight; two ramps must
        // never write the same fixtures.
        self.halt_active().await;

        if self.mode == DimMode::Scale && self.fixtures.len() > 1 {
            debug!("equalizing {} fixtures to {peak}", self.fixtures.len());
            for (fixture, level) in self.fixtures.iter().zip(levels.iter_mut()) {
                self.lights.set_brightness(fixture, f64::from(peak));
                *level = f64::from(peak);
            }
        }

        let run = SequenceRun::plan(levels, lead_in_min);
        debug!(
            "ramping over {} stages of {}s",
            run.stage_count(),
            self.step_interval.as_secs()
        );

        let id = self.next_run_id.fetch_add(1, Ordering::Relaxed);
        let interrupt = Arc::new(AtomicBool::new(false));

        // Hold the slot lock across the spawn so a run short enough to
        // finish immediately still finds its own entry to clear.
        let mut slot = self.active.lock();
        let task = tokio::spawn(drive(
            run,
            self.lights.clone(),
            self.fixtures.clone(),
            self.step_interval,
            interrupt.clone(),
            self.active.clone(),
            id,
        ));
        if let Some(previous) = slot.replace(ActiveRun {
            id,
            interrupt,
            task,
        }) {
            previous.interrupt.store(true, Ordering::SeqCst);
            previous.task.abort();
        }
    }

    /// Force-interrupts any in-flight run and waits for its task to end.
    async fn halt_active(&self) {
        let previous = self.active.lock().take();
        if let Some(run) = previous {
            info!("replacing an in-flight sequence");
            run.interrupt.store(true, Ordering::SeqCst);
            run.task.abort();
            let _ = run.task.await;
        }
    }

    /// Abandons any in-flight run without waiting; used on shutdown.
    pub(crate) fn shutdown(&self) {
        if let Some(run) = self.active.lock().take() {
            run.interrupt.store(true, Ordering::SeqCst);
            run.task.abort();
        }
    }
}

/// Step loop for one ramp. Owns the trajectory; the sleep below is the
/// single pending step delay, replaced each stage.
async fn drive(
    mut run: SequenceRun,
    lights: Arc<dyn LightService>,
    fixtures: Arc<[String]>,
    step_interval: Duration,
    interrupt: Arc<AtomicBool>,
    active: Arc<Mutex<Option<ActiveRun>>>,
    id: u64,
) {
    loop {
        // The flag is consumed, not just read: one request stops one run.
        if interrupt.swap(false, Ordering::SeqCst) {
            info!("interrupt signal received, aborting sequence");
            break;
        }

        let levels = run.advance();
        for (fixture, level) in fixtures.iter().zip(levels) {
            debug!("adjusting {fixture} to {level:.1}");
            lights.set_brightness(fixture, *level);
        }

        if run.finished() {
            info!("wake-up sequence complete");
            break;
        }
        tokio::time::sleep(step_interval).await;
    }

    // Release the run slot if it is still ours; a replacement run may
    // already own it.
    let mut slot = active.lock();
    if slot.as_ref().is_some_and(|r| r.id == id) {
        *slot = None;
    }
}
