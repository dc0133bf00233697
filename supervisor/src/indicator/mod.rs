// Indicator State Module
// The closed vocabulary of light patterns and the guarded shared state the router, the OTA task
// and the watchdog publish into. The render task only ever reads a snapshot.

pub mod engine;

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use log::{debug, info, warn};
use serde_json::Value;

use crate::error::SupervisorError;

pub use engine::{IndicatorEngine, PwmOutputs, Waveform};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Color {
    Red,
    Green,
    Blue,
    White,
    Yellow,
    Cyan,
    Magenta,
    Orange,
}

impl Color {
    pub const ALL: [Color; 8] = [
        Color::Red,
        Color::Green,
        Color::Blue,
        Color::White,
        Color::Yellow,
        Color::Cyan,
        Color::Magenta,
        Color::Orange,
    ];

    /// Additive mix on the red / green / blue channels, 0-255 each
    pub const fn rgb(self) -> [u8; 3] {
        match self {
            Color::Red => [255, 0, 0],
            Color::Green => [0, 255, 0],
            Color::Blue => [0, 0, 255],
            Color::White => [255, 255, 255],
            Color::Yellow => [255, 255, 0],
            Color::Cyan => [0, 255, 255],
            Color::Magenta => [255, 0, 255],
            Color::Orange => [255, 165, 0],
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Color::Red => "RED",
            Color::Green => "GREEN",
            Color::Blue => "BLUE",
            Color::White => "WHITE",
            Color::Yellow => "YELLOW",
            Color::Cyan => "CYAN",
            Color::Magenta => "MAGENTA",
            Color::Orange => "ORANGE",
        }
    }

    fn from_name(name: &str) -> Option<Color> {
        Color::ALL.into_iter().find(|color| color.name() == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndicatorState {
    Off,
    Solid(Color),
    Flashing(Color),
    Pulsating(Color),
}

impl IndicatorState {
    /// Shown from power-on until the first status message arrives
    pub const BOOTING: IndicatorState = IndicatorState::Flashing(Color::White);
    /// Sticky while an update is being downloaded and applied
    pub const UPDATE_IN_PROGRESS: IndicatorState = IndicatorState::Flashing(Color::Green);
    /// Shown by the liveness watchdog after prolonged broker silence
    pub const ORPHANED: IndicatorState = IndicatorState::Flashing(Color::Magenta);

    /// Parse a state name from the status topic.
    ///
    /// Accepts `LED_OFF`, `LED_SOLID_<COLOR>`, `LED_BLINK_<COLOR>`, `LED_PULSE_<COLOR>`
    /// (with `FLASHING` / `PULSATING` spellings and without the `LED_` prefix) and the
    /// coop door state names published by older broker rules.
    pub fn from_name(name: &str) -> Option<IndicatorState> {
        match name {
            "CHICKEN_COOP_DOOR_OPEN_IN_DAYTIME_OK" => return Some(IndicatorState::Solid(Color::Red)),
            "CHICKEN_COOP_DOOR_CLOSED_AT_NIGHT_OK" => return Some(IndicatorState::Solid(Color::Green)),
            "CHICKEN_COOP_DOOR_CLOSED_IN_DAYTIME_ERROR"
            | "CHICKEN_COOP_DOOR_OPEN_AT_NIGHT_ERROR"
            | "CHICKEN_COOP_DOOR_SENSOR_FAILURE_ERROR" => {
                return Some(IndicatorState::Flashing(Color::Red))
            }
            _ => {}
        }

        let name = name.strip_prefix("LED_").unwrap_or(name);
        if name == "OFF" {
            return Some(IndicatorState::Off);
        }

        let (pattern, color) = name.split_once('_')?;
        let color = Color::from_name(color)?;
        match pattern {
            "SOLID" => Some(IndicatorState::Solid(color)),
            "BLINK" | "FLASHING" => Some(IndicatorState::Flashing(color)),
            "PULSE" | "PULSATING" => Some(IndicatorState::Pulsating(color)),
            _ => None,
        }
    }

    /// Canonical name, as published back to the broker side
    pub fn name(&self) -> String {
        match self {
            IndicatorState::Off => "LED_OFF".to_string(),
            IndicatorState::Solid(color) => format!("LED_SOLID_{}", color.name()),
            IndicatorState::Flashing(color) => format!("LED_BLINK_{}", color.name()),
            IndicatorState::Pulsating(color) => format!("LED_PULSE_{}", color.name()),
        }
    }

    /// Flashing in any color but green sounds the audio alert
    pub fn is_alert(&self) -> bool {
        matches!(self, IndicatorState::Flashing(color) if *color != Color::Green)
    }
}

impl core::fmt::Display for IndicatorState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.name())
    }
}

/// Extract the indicator state from a `{"LED": "<state-name>"}` status payload
pub fn parse_status_payload(payload: &[u8]) -> Result<IndicatorState, SupervisorError> {
    let json: Value = serde_json::from_slice(payload)
        .map_err(|e| SupervisorError::malformed(format!("invalid status JSON: {}", e)))?;

    let led = match json.get("LED") {
        Some(Value::String(led)) => led,
        Some(_) => return Err(SupervisorError::malformed("\"LED\" field is not a string")),
        None => return Err(SupervisorError::malformed("missing \"LED\" field")),
    };

    IndicatorState::from_name(led)
        .ok_or_else(|| SupervisorError::malformed(format!("unknown indicator state '{}'", led)))
}

#[derive(Debug)]
struct IndicatorShared {
    state: IndicatorState,
    sticky: bool,
    resync_pending: bool,
}

/// Shared indicator target state.
///
/// Writers go through the accessors below; the render task takes a snapshot with
/// [`Indicator::current`]. All access happens inside a critical section, so a reader
/// never sees a half-applied update.
pub struct Indicator {
    inner: Mutex<CriticalSectionRawMutex, RefCell<IndicatorShared>>,
}

impl Indicator {
    pub const fn new(initial: IndicatorState) -> Self {
        Self {
            inner: Mutex::new(RefCell::new(IndicatorShared {
                state: initial,
                sticky: false,
                resync_pending: false,
            })),
        }
    }

    pub fn current(&self) -> IndicatorState {
        self.inner.lock(|shared| shared.borrow().state)
    }

    pub fn is_sticky(&self) -> bool {
        self.inner.lock(|shared| shared.borrow().sticky)
    }

    /// Apply a routine state (status message, watchdog alert).
    /// Returns false when the sticky update indicator suppressed it.
    pub fn apply(&self, state: IndicatorState) -> bool {
        self.inner.lock(|shared| {
            let mut shared = shared.borrow_mut();
            if shared.sticky {
                if !shared.resync_pending {
                    debug!("📌 Update indicator is sticky, ignoring {}", state);
                    return false;
                }
                info!("🔄 Status refresh clears sticky update indicator");
                shared.sticky = false;
                shared.resync_pending = false;
            }
            if shared.state != state {
                info!("💡 Indicator {} -> {}", shared.state, state);
            }
            shared.state = state;
            true
        })
    }

    /// Show the update-in-progress pattern and pin it until an explicit refresh
    pub fn set_update_in_progress(&self) {
        self.inner.lock(|shared| {
            let mut shared = shared.borrow_mut();
            shared.state = IndicatorState::UPDATE_IN_PROGRESS;
            shared.sticky = true;
            shared.resync_pending = false;
        });
        info!("📌 Indicator pinned to {}", IndicatorState::UPDATE_IN_PROGRESS);
    }

    /// Let the next status message replace a sticky indicator.
    /// Armed when a fresh status has been requested from the broker side.
    pub fn request_resync(&self) {
        self.inner.lock(|shared| {
            let mut shared = shared.borrow_mut();
            if shared.sticky && !shared.resync_pending {
                shared.resync_pending = true;
                info!("🔄 Indicator resync armed");
            }
        });
    }

    /// Set a state unconditionally (self-test). Clears stickiness.
    pub fn force(&self, state: IndicatorState) {
        self.inner.lock(|shared| {
            let mut shared = shared.borrow_mut();
            if shared.sticky {
                warn!("📌 Forcing {} over sticky update indicator", state);
            }
            shared.state = state;
            shared.sticky = false;
            shared.resync_pending = false;
        });
    }
}

impl Default for Indicator {
    fn default() -> Self {
        Self::new(IndicatorState::BOOTING)
    }
}
