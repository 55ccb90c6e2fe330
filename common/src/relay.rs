use log::{info, warn};
use thiserror::Error;

use crate::{
    store::RelayStore,
    types::{Relay, RelayState},
};

#[derive(Debug, Error)]
#[error("failed to drive {relay} relay: {message}")]
pub struct OutputError {
    pub relay: &'static str,
    pub message: String,
}

/// Physical relay pins. Implementations translate ON/OFF into the board's
/// active level.
pub trait RelayOutputs {
    fn drive(&mut self, relay: Relay, on: bool) -> Result<(), OutputError>;
}

/// Owns the authoritative relay state and keeps pins and storage in step with it.
pub struct RelayController<O, S> {
    outputs: O,
    store: S,
    state: RelayState,
}

impl<O: RelayOutputs, S: RelayStore> RelayController<O, S> {
    /// Seeds the state from storage and drives both pins to match.
    pub fn new(mut outputs: O, store: S) -> Self {
        let state = store.load_relay_state();
        for relay in Relay::ALL {
            if let Err(err) = outputs.drive(relay, state.get(relay)) {
                warn!("{err}");
            }
        }
        info!(
            "relays restored: fence={} siren={}",
            state.fence, state.siren
        );
        Self {
            outputs,
            store,
            state,
        }
    }

    /// Flips one relay, drives its pin, then persists. A failed save is
    /// logged and the in-memory state keeps the new value.
    pub fn toggle(&mut self, relay: Relay) -> RelayState {
        let on = !self.state.get(relay);
        self.state.set(relay, on);

        if let Err(err) = self.outputs.drive(relay, on) {
            warn!("{err}");
        }
        if let Err(err) = self.store.save_relay_state(self.state) {
            warn!("relay state not persisted: {err}");
        }

        info!("{} relay switched {}", relay.as_str(), if on { "on" } else { "off" });
        self.state
    }

    pub fn current_state(&self) -> RelayState {
        self.state
    }

    pub fn outputs(&self) -> &O {
        &self.outputs
    }
}
