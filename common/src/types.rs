use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Relay {
    Fence,
    Siren,
}

impl Relay {
    pub const ALL: [Relay; 2] = [Relay::Fence, Relay::Siren];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fence => "fence",
            Self::Siren => "siren",
        }
    }
}

/// Energization state of both relay outputs. `true` means ON.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayState {
    pub fence: bool,
    pub siren: bool,
}

impl Default for RelayState {
    fn default() -> Self {
        Self {
            fence: false,
            siren: true,
        }
    }
}

impl RelayState {
    pub fn get(&self, relay: Relay) -> bool {
        match relay {
            Relay::Fence => self.fence,
            Relay::Siren => self.siren,
        }
    }

    pub fn set(&mut self, relay: Relay, on: bool) {
        match relay {
            Relay::Fence => self.fence = on,
            Relay::Siren => self.siren = on,
        }
    }

    /// Wire form pushed to WebSocket clients, e.g. `ON,OFF` (fence first).
    pub fn status_text(&self) -> String {
        format!("{},{}", on_off(self.fence), on_off(self.siren))
    }
}

fn on_off(on: bool) -> &'static str {
    if on {
        "ON"
    } else {
        "OFF"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WifiMode {
    /// Device runs its own access point.
    Host,
    /// Device joins an existing network.
    Client,
}

impl WifiMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::Client => "client",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ControllerStatus {
    pub fence: bool,
    pub siren: bool,
    pub mode: WifiMode,
    pub ssid: String,
}
