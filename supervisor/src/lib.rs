// Coop monitor device supervisor
// Hardware-independent core: event routing, update lifecycle, liveness watchdog and the
// visual / audio indicator channels. Collaborators are consumed through the traits below.

pub mod audio;
pub mod broker;
pub mod config;
pub mod context;
pub mod error;
pub mod identity;
pub mod indicator;
pub mod ota;
pub mod router;
pub mod storage;
pub mod system;
pub mod watchdog;

#[cfg(test)]
mod testing;

pub use audio::{AudioAlert, AudioChannel, AudioDevice, DecodedFrame};
pub use broker::{BrokerClient, BrokerErrorKind, BrokerEvent, BrokerEventChannel, QoS, SharedBroker};
pub use config::{InactiveTransportPolicy, SupervisorConfig, TopicConfig, WatchdogPolicy};
pub use context::SupervisorContext;
pub use error::SupervisorError;
pub use identity::DeviceIdentity;
pub use indicator::{Color, Indicator, IndicatorEngine, IndicatorState, PwmOutputs};
pub use ota::{run_update_task, OtaManager, SecureUpdater, StepStatus, TaskState};
pub use router::{run_router, ConnectionState, Router};
pub use storage::{detect_post_update_boot, KeyValueStore};
pub use system::{fatal_recovery, SystemControl};
pub use watchdog::{run_watchdog, Watchdog};
