use serde::Serialize;

/// A reset button held at least this long triggers a factory reset.
pub const HOLD_THRESHOLD_MS: u32 = 5_000;
/// Pause between acknowledging a settings change and restarting.
pub const RESTART_DELAY_MS: u64 = 2_000;
pub const HTTP_PORT: u16 = 80;
pub const WS_PORT: u16 = 81;
pub const DNS_PORT: u16 = 53;
pub const MDNS_HOSTNAME: &str = "fence-controller";
pub const MDNS_INSTANCE_NAME: &str = "Fence Controller";
/// Longest WebSocket text frame the device will read.
pub const MAX_WS_FRAME: usize = 128;

pub const DEFAULT_AP_SSID: &str = match option_env!("FENCE_AP_SSID") {
    Some(ssid) => ssid,
    None => "FenceController",
};

pub const DEFAULT_AP_PASSWORD: &str = match option_env!("FENCE_AP_PASSWORD") {
    Some(password) => password,
    None => "fence1234",
};

/// Logic level that energizes a relay coil on a given board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActiveLevel {
    High,
    Low,
}

impl ActiveLevel {
    /// Pin level to write for the requested relay state.
    pub fn pin_high(self, on: bool) -> bool {
        match self {
            Self::High => on,
            Self::Low => !on,
        }
    }
}

/// Board wiring. Resolved once at startup and never changed afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetProfile {
    pub name: &'static str,
    pub fence_pin: i32,
    pub siren_pin: i32,
    pub reset_pin: i32,
    pub relay_active: ActiveLevel,
}

impl TargetProfile {
    pub const fn esp32() -> Self {
        Self {
            name: "esp32",
            fence_pin: 15,
            siren_pin: 2,
            reset_pin: 4,
            relay_active: ActiveLevel::Low,
        }
    }

    /// Pinout of the older ESP8266 board, kept for controllers rewired onto
    /// an ESP32 module with the same numbering.
    pub const fn esp8266() -> Self {
        Self {
            name: "esp8266",
            fence_pin: 0,
            siren_pin: 2,
            reset_pin: 3,
            relay_active: ActiveLevel::High,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "esp32" => Some(Self::esp32()),
            "esp8266" => Some(Self::esp8266()),
            _ => None,
        }
    }

    /// Profile picked at build time through `FENCE_BOARD`, `esp32` otherwise.
    pub fn resolve() -> Self {
        match option_env!("FENCE_BOARD") {
            Some(name) => Self::from_name(name).unwrap_or_else(|| {
                log::warn!("unknown board profile `{name}`, using esp32 wiring");
                Self::esp32()
            }),
            None => Self::esp32(),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn active_low_inverts_pin_level() {
        assert!(!ActiveLevel::Low.pin_high(true));
        assert!(ActiveLevel::Low.pin_high(false));
        assert!(ActiveLevel::High.pin_high(true));
        assert!(!ActiveLevel::High.pin_high(false));
    }

    #[test]
    fn profiles_resolve_by_name() {
        assert_eq!(TargetProfile::from_name(" ESP32 "), Some(TargetProfile::esp32()));
        assert_eq!(TargetProfile::from_name("esp8266"), Some(TargetProfile::esp8266()));
        assert_eq!(TargetProfile::from_name("rp2040"), None);
    }

    #[test]
    fn esp32_profile_matches_board_wiring() {
        let profile = TargetProfile::esp32();
        assert_eq!(
            (profile.fence_pin, profile.siren_pin, profile.reset_pin),
            (15, 2, 4)
        );
        assert_eq!(profile.relay_active, ActiveLevel::Low);
    }

    #[test]
    fn default_access_point_password_is_wpa2_length() {
        assert!(DEFAULT_AP_PASSWORD.len() >= 8);
        assert!(DEFAULT_AP_SSID.len() <= 31);
    }
}
