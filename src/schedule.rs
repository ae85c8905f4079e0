/*!
 # Alarm scheduling

 The schedule manager owns the wake time, lead-in duration, and the
 enable/weekend toggles. It keeps exactly one armed daily trigger
 consistent with them and hands trigger fires to the sequencer.
*/

use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveTime, TimeDelta};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::lights::LightService;
use crate::sequence::{DimMode, Sequencer, STEP_MINUTES};
use crate::store::{Change, ConfigStore};
use crate::timer::{schedule_daily, Clock, TimerHandle};
use crate::{Error, Result};

/// Minimum fade-in time in minutes.
pub const MIN_LEAD_IN_MIN: u32 = 10;

/// Lead-in used when no lead-in entity is configured.
pub const DEFAULT_LEAD_IN_MIN: u32 = 30;

/// Wake-time format the store is expected to hold.
const WAKE_TIME_FORMAT: &str = "%H:%M:%S";

/// Entities and fixed settings for one alarm.
#[derive(Debug, Clone)]
pub struct AlarmConfig {
    /// Store entity holding the wake time (`%H:%M:%S`).
    pub time_entity: String,
    /// Candidate light fixtures; entries unknown to the store are dropped
    /// at startup.
    pub lights: Vec<String>,
    /// Optional store entity holding the lead-in minutes.
    pub lead_in_entity: Option<String>,
    /// Optional store entity enabling/disabling the alarm (`"on"`/`"off"`).
    pub enabled_entity: Option<String>,
    /// Optional store entity enabling the alarm on weekends.
    pub weekend_entity: Option<String>,
    /// Dimming strategy.
    pub dim_mode: DimMode,
    /// Delay between brightness steps. One minute unless accelerated for
    /// demos.
    pub step_interval: Duration,
}

impl AlarmConfig {
    /// Config with the required entities and every option at its default.
    pub fn new(
        time_entity: impl Into<String>,
        lights: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            time_entity: time_entity.into(),
            lights: lights.into_iter().map(Into::into).collect(),
            lead_in_entity: None,
            enabled_entity: None,
            weekend_entity: None,
            dim_mode: DimMode::default(),
            step_interval: Duration::from_secs(u64::from(STEP_MINUTES) * 60),
        }
    }
}

/// Point-in-time view of the alarm for status displays.
#[derive(Debug, Clone)]
pub struct AlarmStatus {
    /// Configured wake time
    pub wake_time: NaiveTime,
    /// Fade-in duration in minutes
    pub lead_in_min: u32,
    /// Whether the alarm fires at all
    pub enabled: bool,
    /// Whether the alarm fires on Saturday and Sunday
    pub weekends_enabled: bool,
    /// Daily time the ramp starts
    pub trigger_time: NaiveTime,
    /// Whether a daily trigger is armed
    pub armed: bool,
    /// Whether a ramp is in progress right now
    pub running: bool,
}

/// The daily time-of-day the ramp must start so it completes at `wake`,
/// wrapping past midnight.
pub fn trigger_time(wake: NaiveTime, lead_in_min: u32) -> NaiveTime {
    wake.overflowing_sub_signed(TimeDelta::minutes(i64::from(lead_in_min)))
        .0
}

struct ArmedTimer {
    at: NaiveTime,
    handle: TimerHandle,
}

struct ScheduleState {
    wake_time: NaiveTime,
    lead_in_min: u32,
    enabled: bool,
    weekends_enabled: bool,
    daily: Option<ArmedTimer>,
}

struct AlarmInner {
    store: Arc<dyn ConfigStore>,
    clock: Arc<dyn Clock>,
    lead_in_entity: Option<String>,
    sequencer: Arc<Sequencer>,
    sched: Arc<Mutex<ScheduleState>>,
}

/// One wake-up alarm: the schedule manager plus its sequencer.
///
/// Dropping the alarm disarms the daily trigger, stops listening for
/// store changes, and abandons any ramp in progress.
pub struct SunriseAlarm {
    inner: Arc<AlarmInner>,
    listeners: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for SunriseAlarm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SunriseAlarm")
            .field("listeners", &self.listeners.len())
            .finish_non_exhaustive()
    }
}

impl SunriseAlarm {
    /// Reads configuration, validates fixtures, subscribes to changes,
    /// and arms the daily trigger if the alarm is enabled.
    ///
    /// Must be called from within a tokio runtime.
    #[instrument(skip_all)]
    pub fn start(
        config: AlarmConfig,
        store: Arc<dyn ConfigStore>,
        lights: Arc<dyn LightService>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        info!("sunrise alarm starting up");

        if !store.entity_exists(&config.time_entity) {
            return Err(Error::UnknownEntity(config.time_entity));
        }
        let raw = store
            .get(&config.time_entity)
            .ok_or_else(|| Error::MissingEntity(config.time_entity.clone()))?;
        let wake_time =
            NaiveTime::parse_from_str(&raw, WAKE_TIME_FORMAT).map_err(|source| {
                Error::InvalidWakeTime {
                    value: raw.clone(),
                    source,
                }
            })?;

        let fixtures: Vec<String> = config
            .lights
            .iter()
            .filter(|fixture| {
                let ok = store.entity_exists(fixture);
                if !ok {
                    warn!("{fixture} entity does not exist and cannot be used");
                }
                ok
            })
            .cloned()
            .collect();
        if fixtures.is_empty() {
            return Err(Error::NoFixtures);
        }

        let lead_in_entity = optional_entity(store.as_ref(), config.lead_in_entity, "lead-in");
        let enabled_entity = optional_entity(store.as_ref(), config.enabled_entity, "enable");
        let weekend_entity = optional_entity(store.as_ref(), config.weekend_entity, "weekend");

        let lead_in_min = match &lead_in_entity {
            Some(entity) => {
                let minutes = startup_lead_in(store.as_ref(), entity);
                info!("alarm starting up with {minutes} minutes of lead-in");
                minutes
            }
            None => {
                info!("alarm starting up with the default {DEFAULT_LEAD_IN_MIN} minutes of lead-in");
                DEFAULT_LEAD_IN_MIN
            }
        };

        let enabled = match &enabled_entity {
            Some(entity) => {
                let on = store.get(entity).as_deref() == Some("on");
                info!("alarm starting up in {} state", if on { "enabled" } else { "disabled" });
                on
            }
            None => {
                warn!("no enable entity provided, alarm will not be controllable");
                true
            }
        };

        let weekends_enabled = match &weekend_entity {
            Some(entity) => {
                let on = store.get(entity).as_deref() == Some("on");
                info!("alarm starting up with weekends {}", if on { "on" } else { "off" });
                on
            }
            None => {
                warn!("no weekend entity provided, alarm will run every day");
                true
            }
        };

        let sequencer = Arc::new(Sequencer::new(
            lights,
            clock.clone(),
            fixtures,
            config.dim_mode,
            config.step_interval,
        ));

        let inner = Arc::new(AlarmInner {
            store: store.clone(),
            clock,
            lead_in_entity: lead_in_entity.clone(),
            sequencer,
            sched: Arc::new(Mutex::new(ScheduleState {
                wake_time,
                lead_in_min,
                enabled,
                weekends_enabled,
                daily: None,
            })),
        });

        info!("alarm starting up set to {wake_time}");

        let mut listeners = Vec::new();
        listeners.push(spawn_listener(store.subscribe(&config.time_entity), {
            let inner = inner.clone();
            move |change| inner.on_time_change(&change.new)
        }));
        if let Some(entity) = &lead_in_entity {
            listeners.push(spawn_listener(store.subscribe(entity), {
                let inner = inner.clone();
                move |change| inner.on_lead_in_change(&change.new)
            }));
        }
        if let Some(entity) = &enabled_entity {
            listeners.push(spawn_listener(store.subscribe(entity), {
                let inner = inner.clone();
                move |change| inner.on_enabled_change(&change.new)
            }));
        }
        if let Some(entity) = &weekend_entity {
            listeners.push(spawn_listener(store.subscribe(entity), {
                let inner = inner.clone();
                move |change| inner.on_weekend_change(&change.new)
            }));
        }

        if enabled {
            inner.resync(&mut inner.sched.lock());
        }

        Ok(Self { inner, listeners })
    }

    /// Current schedule and run state.
    pub fn status(&self) -> AlarmStatus {
        let sched = self.inner.sched.lock();
        AlarmStatus {
            wake_time: sched.wake_time,
            lead_in_min: sched.lead_in_min,
            enabled: sched.enabled,
            weekends_enabled: sched.weekends_enabled,
            trigger_time: trigger_time(sched.wake_time, sched.lead_in_min),
            armed: sched.daily.is_some(),
            running: self.inner.sequencer.is_running(),
        }
    }

    /// Fires the trigger immediately, as if the daily timer had elapsed.
    /// The usual run-start decision still applies.
    pub async fn trigger_now(&self) {
        self.inner.on_trigger().await;
    }
}

impl Drop for SunriseAlarm {
    fn drop(&mut self) {
        self.inner.disarm(&mut self.inner.sched.lock());
        for listener in &self.listeners {
            listener.abort();
        }
        self.inner.sequencer.shutdown();
    }
}

impl AlarmInner {
    fn on_time_change(&self, new: &str) {
        info!("wake time changed to {new}");
        match NaiveTime::parse_from_str(new, WAKE_TIME_FORMAT) {
            Ok(time) => {
                let mut sched = self.sched.lock();
                sched.wake_time = time;
                self.resync(&mut sched);
            }
            // Bad input never tears down a valid schedule.
            Err(e) => warn!("ignoring unparseable wake time {new:?}: {e}"),
        }
    }

    fn on_lead_in_change(&self, new: &str) {
        let raw = match new.trim().parse::<f64>() {
            Ok(minutes) => minutes,
            Err(e) => {
                warn!("ignoring unparseable lead-in {new:?}: {e}");
                return;
            }
        };
        let minutes = if raw >= f64::from(MIN_LEAD_IN_MIN) {
            raw.round() as u32
        } else {
            warn!("lead-in below the {MIN_LEAD_IN_MIN} minute minimum, correcting");
            if let Some(entity) = &self.lead_in_entity {
                self.store.set(entity, &MIN_LEAD_IN_MIN.to_string());
            }
            MIN_LEAD_IN_MIN
        };

        info!("lead-in changed to {minutes} minutes");
        let mut sched = self.sched.lock();
        sched.lead_in_min = minutes;
        self.resync(&mut sched);
    }

    fn on_enabled_change(&self, new: &str) {
        info!("alarm enable switched to {new}");
        let enabled = new == "on";
        let mut sched = self.sched.lock();
        sched.enabled = enabled;
        if enabled {
            self.resync(&mut sched);
        } else {
            self.disarm(&mut sched);
            // Disabling must also stop an active fade, not just future
            // ones. The run notices at its next step boundary.
            self.sequencer.interrupt();
        }
    }

    fn on_weekend_change(&self, new: &str) {
        info!("alarm on weekends switched to {new}");
        self.sched.lock().weekends_enabled = new == "on";
    }

    /// Brings the armed daily timer in line with the current schedule.
    /// A timer already armed at the unchanged trigger time is left alone.
    fn resync(&self, sched: &mut ScheduleState) {
        if !sched.enabled {
            self.disarm(sched);
            return;
        }

        let at = trigger_time(sched.wake_time, sched.lead_in_min);
        if let Some(armed) = &sched.daily {
            if armed.at == at {
                debug!("already armed for {at}");
                return;
            }
        }
        self.disarm(sched);

        let sequencer = self.sequencer.clone();
        let shared = self.sched.clone();
        let handle = schedule_daily(self.clock.clone(), at, move || {
            let sequencer = sequencer.clone();
            let shared = shared.clone();
            async move { fire(&sequencer, &shared).await }
        });
        info!("armed daily trigger for {at}");
        sched.daily = Some(ArmedTimer { at, handle });
    }

    fn disarm(&self, sched: &mut ScheduleState) {
        if let Some(armed) = sched.daily.take() {
            debug!("disarmed daily trigger for {}", armed.at);
            armed.handle.cancel();
        }
    }

    async fn on_trigger(&self) {
        fire(&self.sequencer, &self.sched).await;
    }
}

/// Reads the settings a trigger fire depends on and runs the sequencer's
/// start decision.
async fn fire(sequencer: &Sequencer, sched: &Mutex<ScheduleState>) {
    let (lead_in_min, weekends_enabled) = {
        let sched = sched.lock();
        (sched.lead_in_min, sched.weekends_enabled)
    };
    sequencer.trigger(lead_in_min, weekends_enabled).await;
}

/// Resolves an optional entity, dropping it with a warning when the store
/// does not know it.
fn optional_entity(
    store: &dyn ConfigStore,
    entity: Option<String>,
    what: &str,
) -> Option<String> {
    match entity {
        Some(entity) if store.entity_exists(&entity) => Some(entity),
        Some(entity) => {
            warn!("{entity} is an invalid entity, {what} falls back to its default");
            None
        }
        None => None,
    }
}

/// Reads the startup lead-in, falling back to the default on a missing or
/// unparseable value and correcting a below-minimum one in the store.
fn startup_lead_in(store: &dyn ConfigStore, entity: &str) -> u32 {
    let Some(raw) = store.get(entity) else {
        warn!("{entity} has no value, using the default lead-in");
        return DEFAULT_LEAD_IN_MIN;
    };
    match raw.trim().parse::<f64>() {
        Ok(minutes) if minutes >= f64::from(MIN_LEAD_IN_MIN) => minutes.round() as u32,
        Ok(_) => {
            warn!("lead-in below the {MIN_LEAD_IN_MIN} minute minimum, correcting");
            store.set(entity, &MIN_LEAD_IN_MIN.to_string());
            MIN_LEAD_IN_MIN
        }
        Err(e) => {
            warn!("ignoring unparseable lead-in {raw:?}: {e}");
            DEFAULT_LEAD_IN_MIN
        }
    }
}

fn spawn_listener<F>(mut rx: mpsc::UnboundedReceiver<Change>, handler: F) -> JoinHandle<()>
where
    F: Fn(Change) + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(change) = rx.recv().await {
            handler(change);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lights::MemoryLights;
    use crate::store::MemoryStore;
    use chrono::Weekday;

    struct MondayMorning;

    impl Clock for MondayMorning {
        fn now(&self) -> (NaiveTime, Weekday) {
            (t(5, 0, 0), Weekday::Mon)
        }
    }

    fn t(h: u32, m: u32, s: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, s).unwrap()
    }

    fn store_with_defaults() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store.set("input_datetime.wake_time", "06:30:00");
        store.set("input_number.lead_in", "30");
        store.set("input_boolean.alarm_on", "on");
        store.set("input_boolean.weekends", "off");
        store.register("light.a");
        store.register("light.b");
        store
    }

    fn config() -> AlarmConfig {
        let mut config = AlarmConfig::new("input_datetime.wake_time", ["light.a", "light.b"]);
        config.lead_in_entity = Some("input_number.lead_in".into());
        config.enabled_entity = Some("input_boolean.alarm_on".into());
        config.weekend_entity = Some("input_boolean.weekends".into());
        config
    }

    fn alarm(store: Arc<MemoryStore>, lights: Arc<MemoryLights>) -> SunriseAlarm {
        SunriseAlarm::start(config(), store, lights, Arc::new(MondayMorning)).unwrap()
    }

    /// Lets listener tasks drain their pending change notifications.
    async fn settle() {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn trigger_time_subtracts_the_lead_in() {
        assert_eq!(trigger_time(t(6, 30, 0), 30), t(6, 0, 0));
        assert_eq!(trigger_time(t(6, 30, 0), 90), t(5, 0, 0));
        // recomputation is pure
        assert_eq!(
            trigger_time(t(6, 30, 0), 30),
            trigger_time(t(6, 30, 0), 30)
        );
    }

    #[test]
    fn trigger_time_wraps_past_midnight() {
        assert_eq!(trigger_time(t(0, 5, 0), 10), t(23, 55, 0));
        assert_eq!(trigger_time(t(0, 0, 0), 10), t(23, 50, 0));
    }

    #[tokio::test]
    async fn starts_armed_with_the_derived_trigger_time() {
        let alarm = alarm(store_with_defaults(), Arc::new(MemoryLights::new()));
        let status = alarm.status();
        assert!(status.armed);
        assert_eq!(status.trigger_time, t(6, 0, 0));
        assert_eq!(status.lead_in_min, 30);
        assert!(status.enabled);
        assert!(!status.weekends_enabled);
        assert!(!status.running);
    }

    #[tokio::test]
    async fn startup_rejects_bad_wake_time_configuration() {
        let lights = Arc::new(MemoryLights::new());

        let store = Arc::new(MemoryStore::new());
        store.register("light.a");
        let err = SunriseAlarm::start(
            AlarmConfig::new("input_datetime.wake_time", ["light.a"]),
            store.clone(),
            lights.clone(),
            Arc::new(MondayMorning),
        )
        .unwrap_err();
        assert!(matches!(err, Error::UnknownEntity(_)));

        store.register("input_datetime.wake_time");
        let err = SunriseAlarm::start(
            AlarmConfig::new("input_datetime.wake_time", ["light.a"]),
            store.clone(),
            lights.clone(),
            Arc::new(MondayMorning),
        )
        .unwrap_err();
        assert!(matches!(err, Error::MissingEntity(_)));

        store.set("input_datetime.wake_time", "tomorrow-ish");
        let err = SunriseAlarm::start(
            AlarmConfig::new("input_datetime.wake_time", ["light.a"]),
            store,
            lights,
            Arc::new(MondayMorning),
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidWakeTime { .. }));
    }

    #[tokio::test]
    async fn startup_requires_at_least_one_valid_fixture() {
        let store = Arc::new(MemoryStore::new());
        store.set("input_datetime.wake_time", "06:30:00");
        let err = SunriseAlarm::start(
            AlarmConfig::new("input_datetime.wake_time", ["light.ghost"]),
            store,
            Arc::new(MemoryLights::new()),
            Arc::new(MondayMorning),
        )
        .unwrap_err();
        assert!(matches!(err, Error::NoFixtures));
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_fixtures_are_excluded_at_startup() {
        let store = Arc::new(MemoryStore::new());
        store.set("input_datetime.wake_time", "06:30:00");
        store.register("light.a");
        let lights = Arc::new(MemoryLights::new());

        let alarm = SunriseAlarm::start(
            AlarmConfig::new("input_datetime.wake_time", ["light.a", "light.ghost"]),
            store,
            lights.clone(),
            Arc::new(MondayMorning),
        )
        .unwrap();

        alarm.trigger_now().await;
        tokio::time::sleep(Duration::from_secs(31 * 60)).await;
        settle().await;

        assert!(!lights.commands().is_empty());
        assert!(lights.commands().iter().all(|(fixture, _)| fixture == "light.a"));
    }

    #[tokio::test]
    async fn wake_time_change_rearms_at_the_new_trigger() {
        let store = store_with_defaults();
        let alarm = alarm(store.clone(), Arc::new(MemoryLights::new()));

        store.set("input_datetime.wake_time", "07:00:00");
        settle().await;

        let status = alarm.status();
        assert!(status.armed);
        assert_eq!(status.wake_time, t(7, 0, 0));
        assert_eq!(status.trigger_time, t(6, 30, 0));
    }

    #[tokio::test]
    async fn malformed_wake_time_keeps_the_previous_schedule() {
        let store = store_with_defaults();
        let alarm = alarm(store.clone(), Arc::new(MemoryLights::new()));

        store.set("input_datetime.wake_time", "not a time");
        settle().await;

        let status = alarm.status();
        assert!(status.armed);
        assert_eq!(status.wake_time, t(6, 30, 0));
        assert_eq!(status.trigger_time, t(6, 0, 0));
    }

    #[tokio::test]
    async fn unchanged_wake_time_leaves_the_trigger_in_place() {
        let store = store_with_defaults();
        let alarm = alarm(store.clone(), Arc::new(MemoryLights::new()));

        store.set("input_datetime.wake_time", "06:30:00");
        settle().await;

        let status = alarm.status();
        assert!(status.armed);
        assert_eq!(status.trigger_time, t(6, 0, 0));
    }

    #[tokio::test]
    async fn short_lead_ins_clamp_and_write_back() {
        let store = store_with_defaults();
        let alarm = alarm(store.clone(), Arc::new(MemoryLights::new()));

        for raw in ["3", "0", "-5"] {
            store.set("input_number.lead_in", raw);
            settle().await;
            assert_eq!(alarm.status().lead_in_min, 10);
            assert_eq!(store.get("input_number.lead_in").as_deref(), Some("10"));
        }
        assert_eq!(alarm.status().trigger_time, t(6, 20, 0));
    }

    #[tokio::test]
    async fn startup_clamps_a_below_minimum_lead_in() {
        let store = store_with_defaults();
        store.set("input_number.lead_in", "5");
        let alarm = alarm(store.clone(), Arc::new(MemoryLights::new()));

        assert_eq!(alarm.status().lead_in_min, 10);
        assert_eq!(store.get("input_number.lead_in").as_deref(), Some("10"));
    }

    #[tokio::test]
    async fn disabling_disarms_and_enabling_rearms() {
        let store = store_with_defaults();
        let alarm = alarm(store.clone(), Arc::new(MemoryLights::new()));

        store.set("input_boolean.alarm_on", "off");
        settle().await;
        assert!(!alarm.status().armed);

        store.set("input_boolean.alarm_on", "on");
        settle().await;
        let status = alarm.status();
        assert!(status.armed);
        assert_eq!(status.trigger_time, t(6, 0, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn disabling_interrupts_an_active_fade() {
        let store = store_with_defaults();
        let lights = Arc::new(MemoryLights::new());
        lights.seed("light.a", 0);
        lights.seed("light.b", 0);
        let alarm = alarm(store.clone(), lights.clone());

        alarm.trigger_now().await;
        settle().await;
        assert!(alarm.status().running);
        assert_eq!(lights.commands().len(), 4);

        store.set("input_boolean.alarm_on", "off");
        settle().await;
        assert!(!alarm.status().armed);

        // the fade stops at the next step boundary, not immediately
        tokio::time::advance(Duration::from_secs(60)).await;
        settle().await;
        assert!(!alarm.status().running);
        assert_eq!(lights.commands().len(), 4);
    }

    #[tokio::test]
    async fn weekend_toggle_has_no_scheduling_effect() {
        let store = store_with_defaults();
        let alarm = alarm(store.clone(), Arc::new(MemoryLights::new()));

        store.set("input_boolean.weekends", "on");
        settle().await;

        let status = alarm.status();
        assert!(status.weekends_enabled);
        assert!(status.armed);
        assert_eq!(status.trigger_time, t(6, 0, 0));
    }

    #[tokio::test]
    async fn absent_optional_entities_fall_back_to_defaults() {
        let store = Arc::new(MemoryStore::new());
        store.set("input_datetime.wake_time", "06:30:00");
        store.register("light.a");

        let alarm = SunriseAlarm::start(
            AlarmConfig::new("input_datetime.wake_time", ["light.a"]),
            store,
            Arc::new(MemoryLights::new()),
            Arc::new(MondayMorning),
        )
        .unwrap();

        let status = alarm.status();
        assert_eq!(status.lead_in_min, DEFAULT_LEAD_IN_MIN);
        assert!(status.enabled);
        assert!(status.weekends_enabled);
        assert!(status.armed);
        assert_eq!(status.trigger_time, t(6, 0, 0));
    }
}
