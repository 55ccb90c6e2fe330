pub mod app;
pub mod button;
pub mod captive_dns;
pub mod config;
pub mod credentials;
pub mod relay;
pub mod store;
pub mod sync;
pub mod types;

pub use app::{run_session_events, save_settings, FenceController};
pub use button::{HoldDetector, HoldStatus};
pub use config::{ActiveLevel, TargetProfile};
pub use credentials::{NetworkCredentials, SettingsForm};
pub use relay::{OutputError, RelayController, RelayOutputs};
pub use store::{FileStore, RelayStore, StoreError};
pub use sync::{ClientCommand, ClientSync, SessionEvent, SessionId, SessionSink, SinkError};
pub use types::{ControllerStatus, Relay, RelayState, WifiMode};
