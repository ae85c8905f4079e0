/*!
 # Light fixture service boundary

 Brightness reads and writes go through the [`LightService`] trait. Calls
 are fire-and-forget: a failed or undelivered command is not retried and
 the caller proceeds regardless of the outcome.
*/

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;
use tracing::trace;

/// Full brightness on the 255-point scale every ramp drives toward.
pub const FULL_LEVEL: f64 = 255.0;

/// Readings above half scale mean the room was lit by hand; the controller
/// must not override that.
pub const MANUAL_LIGHT_THRESHOLD: u8 = 127;

/// Service that reads and drives fixture brightness.
pub trait LightService: Send + Sync {
    /// Current brightness of a fixture (0-255), if the service has a reading.
    fn brightness(&self, fixture: &str) -> Option<u8>;

    /// Command a fixture to the given brightness level.
    fn set_brightness(&self, fixture: &str, level: f64);
}

/// In-process [`LightService`] that keeps levels in memory and records
/// every command it receives, in order. Used by the binaries and tests.
#[derive(Default)]
pub struct MemoryLights {
    levels: RwLock<HashMap<String, f64>>,
    history: RwLock<Vec<(String, f64)>>,
    reads: AtomicUsize,
}

impl MemoryLights {
    /// Creates a service with no fixture readings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a fixture with a current brightness reading.
    pub fn seed(&self, fixture: &str, level: u8) {
        self.levels
            .write()
            .insert(fixture.to_string(), f64::from(level));
    }

    /// Every set-brightness command received so far, in order.
    pub fn commands(&self) -> Vec<(String, f64)> {
        self.history.read().clone()
    }

    /// How many brightness readings have been served.
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }
}

impl LightService for MemoryLights {
    fn brightness(&self, fixture: &str) -> Option<u8> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.levels
            .read()
            .get(fixture)
            .map(|level| level.round().clamp(0.0, FULL_LEVEL) as u8)
    }

    fn set_brightness(&self, fixture: &str, level: f64) {
        trace!("{fixture} commanded to {level:.1}");
        self.levels.write().insert(fixture.to_string(), level);
        self.history.write().push((fixture.to_string(), level));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_are_recorded_in_order() {
        let lights = MemoryLights::new();
        lights.set_brightness("light.a", 10.0);
        lights.set_brightness("light.b", 20.0);
        lights.set_brightness("light.a", 30.5);

        assert_eq!(
            lights.commands(),
            vec![
                ("light.a".to_string(), 10.0),
                ("light.b".to_string(), 20.0),
                ("light.a".to_string(), 30.5),
            ]
        );
    }

    #[test]
    fn readings_round_to_the_integer_scale() {
        let lights = MemoryLights::new();
        lights.set_brightness("light.a", 79.5);
        assert_eq!(lights.brightness("light.a"), Some(80));
        assert_eq!(lights.brightness("light.missing"), None);
        assert_eq!(lights.read_count(), 2);
    }
}
