use std::collections::BTreeMap;

use log::{debug, info, warn};
use thiserror::Error;

use crate::{
    relay::{RelayController, RelayOutputs},
    store::RelayStore,
    types::Relay,
};

/// Transport-assigned WebSocket session id.
pub type SessionId = i32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientCommand {
    GetStatus,
    Toggle(Relay),
}

impl ClientCommand {
    /// Parses a text frame. Tokens match exactly; only trailing NULs, which
    /// some clients append as a C string terminator, are ignored.
    pub fn parse(text: &str) -> Option<Self> {
        match text.trim_end_matches('\0') {
            "getStatus" => Some(Self::GetStatus),
            "toggle1" => Some(Self::Toggle(Relay::Fence)),
            "toggle2" => Some(Self::Toggle(Relay::Siren)),
            _ => None,
        }
    }
}

/// Something a WebSocket transport observed on one session.
#[derive(Debug)]
pub enum SessionEvent<K> {
    Opened(SessionId, K),
    Text(SessionId, String),
    Closed(SessionId),
}

#[derive(Debug, Error)]
#[error("websocket session unavailable: {0}")]
pub struct SinkError(pub String);

/// Outbound half of one WebSocket session.
pub trait SessionSink {
    fn send_text(&mut self, text: &str) -> Result<(), SinkError>;
}

/// Table of open sessions and the text protocol spoken over them.
pub struct ClientSync<K> {
    sessions: BTreeMap<SessionId, K>,
}

impl<K> Default for ClientSync<K> {
    fn default() -> Self {
        Self {
            sessions: BTreeMap::new(),
        }
    }
}

impl<K: SessionSink> ClientSync<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&mut self, id: SessionId, sink: K) {
        self.sessions.insert(id, sink);
        info!("websocket session {id} opened ({} open)", self.sessions.len());
    }

    pub fn disconnect(&mut self, id: SessionId) -> bool {
        let removed = self.sessions.remove(&id).is_some();
        if removed {
            info!("websocket session {id} closed ({} open)", self.sessions.len());
        }
        removed
    }

    pub fn is_connected(&self, id: SessionId) -> bool {
        self.sessions.contains_key(&id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Handles one inbound text frame from `id`.
    ///
    /// `getStatus` answers the sender only. A toggle broadcasts the new state
    /// to every session, the sender included. Anything else is dropped
    /// without a reply.
    pub fn handle_text<O, S>(
        &mut self,
        id: SessionId,
        text: &str,
        relays: &mut RelayController<O, S>,
    ) -> Option<ClientCommand>
    where
        O: RelayOutputs,
        S: RelayStore,
    {
        let Some(command) = ClientCommand::parse(text) else {
            debug!("ignoring websocket message from session {id}: {text:?}");
            return None;
        };

        match command {
            ClientCommand::GetStatus => {
                let status = relays.current_state().status_text();
                self.send_to(id, &status);
            }
            ClientCommand::Toggle(relay) => {
                let status = relays.toggle(relay).status_text();
                self.broadcast(&status);
            }
        }
        Some(command)
    }

    /// Sends `text` to one session, dropping it if the write fails.
    pub fn send_to(&mut self, id: SessionId, text: &str) {
        let Some(sink) = self.sessions.get_mut(&id) else {
            return;
        };
        if let Err(err) = sink.send_text(text) {
            warn!("dropping session {id}: {err}");
            self.sessions.remove(&id);
        }
    }

    /// Sends `text` to every session. Sessions whose write fails are dropped.
    pub fn broadcast(&mut self, text: &str) {
        self.sessions.retain(|id, sink| match sink.send_text(text) {
            Ok(()) => true,
            Err(err) => {
                warn!("dropping session {id}: {err}");
                false
            }
        });
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::{cell::RefCell, rc::Rc};

    use super::*;

    /// Sink that records every frame into a shared inbox.
    #[derive(Debug, Default, Clone)]
    pub struct Inbox {
        pub frames: Rc<RefCell<Vec<String>>>,
        pub broken: bool,
    }

    impl Inbox {
        pub fn received(&self) -> Vec<String> {
            self.frames.borrow().clone()
        }
    }

    impl SessionSink for Inbox {
        fn send_text(&mut self, text: &str) -> Result<(), SinkError> {
            if self.broken {
                return Err(SinkError("peer went away".to_string()));
            }
            self.frames.borrow_mut().push(text.to_string());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::testing::Inbox;
    use super::*;
    use crate::relay::testing::{MemoryStore, RecordingOutputs};

    type Relays = RelayController<RecordingOutputs, MemoryStore>;

    fn relays() -> Relays {
        RelayController::new(RecordingOutputs::default(), MemoryStore::default())
    }

    #[test]
    fn commands_parse_exactly() {
        assert_eq!(ClientCommand::parse("getStatus"), Some(ClientCommand::GetStatus));
        assert_eq!(
            ClientCommand::parse("toggle1"),
            Some(ClientCommand::Toggle(Relay::Fence))
        );
        assert_eq!(
            ClientCommand::parse("toggle2\0"),
            Some(ClientCommand::Toggle(Relay::Siren))
        );
        assert_eq!(ClientCommand::parse("toggle3"), None);
        assert_eq!(ClientCommand::parse("GETSTATUS"), None);
        assert_eq!(ClientCommand::parse(""), None);
    }

    #[test]
    fn padded_tokens_are_not_commands() {
        assert_eq!(ClientCommand::parse(" toggle1\n"), None);
        assert_eq!(ClientCommand::parse("toggle1 "), None);
        assert_eq!(ClientCommand::parse("\0getStatus"), None);
        assert_eq!(
            ClientCommand::parse("getStatus\0\0"),
            Some(ClientCommand::GetStatus)
        );
    }

    #[test]
    fn get_status_answers_only_the_requester() {
        let mut relays = relays();
        let mut sync = ClientSync::new();
        let (a, b) = (Inbox::default(), Inbox::default());
        sync.connect(1, a.clone());
        sync.connect(2, b.clone());

        sync.handle_text(1, "getStatus", &mut relays);

        assert_eq!(a.received(), vec!["OFF,ON"]);
        assert!(b.received().is_empty());
    }

    #[test]
    fn toggle_from_defaults_broadcasts_on_on() {
        let mut relays = relays();
        let mut sync = ClientSync::new();
        let (a, b) = (Inbox::default(), Inbox::default());
        sync.connect(1, a.clone());
        sync.connect(2, b.clone());

        sync.handle_text(1, "toggle1", &mut relays);

        assert_eq!(a.received(), vec!["ON,ON"]);
        assert_eq!(b.received(), vec!["ON,ON"]);
    }

    #[test]
    fn second_session_sees_fresh_state_after_toggle() {
        let mut relays = relays();
        let mut sync = ClientSync::new();
        let second = Inbox::default();
        sync.connect(1, Inbox::default());
        sync.connect(2, second.clone());

        sync.handle_text(1, "toggle1", &mut relays);
        sync.handle_text(2, "getStatus", &mut relays);

        assert_eq!(second.received().last().map(String::as_str), Some("ON,ON"));
    }

    #[test]
    fn unknown_text_changes_nothing_and_sends_nothing() {
        let mut relays = relays();
        let mut sync = ClientSync::new();
        let inbox = Inbox::default();
        sync.connect(1, inbox.clone());
        let before = relays.current_state();

        assert_eq!(sync.handle_text(1, "hello", &mut relays), None);

        assert_eq!(relays.current_state(), before);
        assert!(inbox.received().is_empty());
    }

    #[test]
    fn broken_session_is_dropped_on_broadcast() {
        let mut relays = relays();
        let mut sync = ClientSync::new();
        let healthy = Inbox::default();
        sync.connect(1, healthy.clone());
        sync.connect(
            2,
            Inbox {
                broken: true,
                ..Default::default()
            },
        );

        sync.handle_text(1, "toggle2", &mut relays);

        assert_eq!(healthy.received(), vec!["OFF,OFF"]);
        assert!(!sync.is_connected(2));
        assert_eq!(sync.session_count(), 1);
    }

    #[test]
    fn disconnect_leaves_relay_state_untouched() {
        let mut relays = relays();
        let mut sync = ClientSync::new();
        sync.connect(7, Inbox::default());
        sync.handle_text(7, "toggle1", &mut relays);
        let state = relays.current_state();

        assert!(sync.disconnect(7));
        assert!(!sync.disconnect(7));
        assert_eq!(relays.current_state(), state);
    }
}
