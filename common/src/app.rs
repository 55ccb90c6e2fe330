use std::sync::{mpsc::Receiver, Mutex, PoisonError};

use log::{debug, info, warn};

use crate::{
    credentials::{NetworkCredentials, SettingsForm},
    relay::{RelayController, RelayOutputs},
    store::{FileStore, RelayStore, StoreError},
    sync::{ClientCommand, ClientSync, SessionEvent, SessionId, SessionSink},
    types::{ControllerStatus, RelayState},
};

/// Everything the request handlers share: the relays and the open sessions.
/// Front ends keep one of these behind a single lock so a toggle and its
/// broadcast are never interleaved with another toggle.
pub struct FenceController<O, S, K> {
    relays: RelayController<O, S>,
    clients: ClientSync<K>,
}

impl<O, S, K> FenceController<O, S, K>
where
    O: RelayOutputs,
    S: RelayStore,
    K: SessionSink,
{
    pub fn new(relays: RelayController<O, S>) -> Self {
        Self {
            relays,
            clients: ClientSync::new(),
        }
    }

    pub fn relay_state(&self) -> RelayState {
        self.relays.current_state()
    }

    pub fn clients(&self) -> &ClientSync<K> {
        &self.clients
    }

    pub fn connect(&mut self, id: SessionId, sink: K) {
        self.clients.connect(id, sink);
    }

    pub fn disconnect(&mut self, id: SessionId) {
        self.clients.disconnect(id);
    }

    pub fn handle_text(&mut self, id: SessionId, text: &str) -> Option<ClientCommand> {
        self.clients.handle_text(id, text, &mut self.relays)
    }

    pub fn apply(&mut self, event: SessionEvent<K>) -> Option<ClientCommand> {
        match event {
            SessionEvent::Opened(id, sink) => {
                self.connect(id, sink);
                None
            }
            SessionEvent::Text(id, text) => self.handle_text(id, &text),
            SessionEvent::Closed(id) => {
                self.disconnect(id);
                None
            }
        }
    }

    pub fn status(&self, creds: &NetworkCredentials) -> ControllerStatus {
        let state = self.relays.current_state();
        ControllerStatus {
            fence: state.fence,
            siren: state.siren,
            mode: creds.mode(),
            ssid: creds.ssid().to_string(),
        }
    }
}

/// Applies session events in arrival order until every producer hangs up.
///
/// This is the only place that takes `controller` for session traffic, so a
/// sink that blocks until its transport thread runs the write never waits on
/// a transport thread that is itself waiting for the lock. Producers must
/// only enqueue.
pub fn run_session_events<O, S, K>(
    controller: &Mutex<FenceController<O, S, K>>,
    events: Receiver<SessionEvent<K>>,
) where
    O: RelayOutputs,
    S: RelayStore,
    K: SessionSink,
{
    for event in events {
        controller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .apply(event);
    }
    debug!("session event producers closed");
}

/// Merges a settings form over the stored credentials and persists the result.
pub fn save_settings(
    store: &FileStore,
    form: &SettingsForm,
) -> Result<NetworkCredentials, StoreError> {
    let current = store.load_credentials();
    let (updated, truncated) = form.apply_to(&current);
    if truncated {
        warn!("ssid or password longer than 31 bytes was truncated");
    }
    store.save_credentials(&updated)?;
    info!(
        "saved network settings: ssid=`{}` mode={}",
        updated.ssid(),
        updated.mode().as_str()
    );
    Ok(updated)
}
