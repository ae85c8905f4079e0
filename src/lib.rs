/*!
 # Wakelight Controller Library

 A Rust library for waking up a room with light: given a wake time and a
 lead-in duration, it gradually fades a set of light fixtures from their
 current brightness to full brightness, finishing exactly at wake time.

 ## Features

 * Daily trigger derived from a wake time and a lead-in duration
 * Staged brightness ramp at one-minute granularity
 * Manual-override detection (declines when the room is already lit)
 * Enable/disable and weekend toggles, editable while armed
 * Scale and Level dimming strategies
 * Cooperative mid-ramp cancellation

 ## Example

 ```rust
 use wakelight_controller::*;
 use std::sync::Arc;

 #[tokio::main]
 async fn main() -> Result<()> {
     // Initialize tracing for logs
     tracing_subscriber::fmt::init();

     // Back the controller with the in-process collaborators
     let store = Arc::new(MemoryStore::new());
     store.register("light.bedroom");
     store.set("input_datetime.wake_time", "06:30:00");

     let lights = Arc::new(MemoryLights::new());

     // Arms a daily trigger at 06:00 (30 minute default lead-in)
     let alarm = SunriseAlarm::start(
         AlarmConfig::new("input_datetime.wake_time", ["light.bedroom"]),
         store,
         lights,
         Arc::new(SystemClock),
     )?;
     println!("alarm armed for {}", alarm.status().trigger_time);

     Ok(())
 }
 ```
*/

use thiserror::Error;

/// Custom error types for the wakelight controller library
#[derive(Error, Debug)]
pub enum Error {
    /// Required entity missing from the configuration store
    #[error("required entity {0} has no value in the store")]
    MissingEntity(String),

    /// Entity is not known to the configuration store
    #[error("{0} is an invalid entity")]
    UnknownEntity(String),

    /// Wake time string could not be parsed
    #[error("invalid wake time {value:?}: {source}")]
    InvalidWakeTime {
        /// The raw store value
        value: String,
        /// Underlying parse failure
        source: chrono::ParseError,
    },

    /// No configured fixture survived validation
    #[error("no usable light fixtures configured")]
    NoFixtures,
}

pub type Result<T> = std::result::Result<T, Error>;

// Re-export modules
pub mod lights;
pub mod schedule;
pub mod sequence;
pub mod store;
pub mod timer;

// Re-export key types
pub use lights::{LightService, MemoryLights, FULL_LEVEL, MANUAL_LIGHT_THRESHOLD};
pub use schedule::{
    trigger_time, AlarmConfig, AlarmStatus, SunriseAlarm, DEFAULT_LEAD_IN_MIN, MIN_LEAD_IN_MIN,
};
pub use sequence::{DimMode, SequenceRun, Sequencer, STEP_MINUTES};
pub use store::{Change, ConfigStore, MemoryStore};
pub use timer::{schedule_after, schedule_daily, Clock, SystemClock, TimerHandle};
