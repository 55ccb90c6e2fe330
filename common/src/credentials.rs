use serde::Deserialize;

use crate::{
    config::{DEFAULT_AP_PASSWORD, DEFAULT_AP_SSID},
    types::WifiMode,
};

/// Longest SSID or password the device keeps, in bytes.
pub const MAX_FIELD_LEN: usize = 31;
const FIELD_SLOT: usize = MAX_FIELD_LEN + 1;
/// Size of the stored credentials record: two NUL-padded slots and a mode byte.
pub const CREDENTIALS_RECORD_LEN: usize = FIELD_SLOT * 2 + 1;

const MODE_HOST: u8 = b'1';
const MODE_CLIENT: u8 = b'0';

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkCredentials {
    ssid: String,
    password: String,
    mode: WifiMode,
}

impl Default for NetworkCredentials {
    fn default() -> Self {
        Self::new(DEFAULT_AP_SSID, DEFAULT_AP_PASSWORD, WifiMode::Host).0
    }
}

impl NetworkCredentials {
    /// Builds credentials, cutting either field down to `MAX_FIELD_LEN` bytes.
    /// The flag reports whether anything was cut.
    pub fn new(ssid: &str, password: &str, mode: WifiMode) -> (Self, bool) {
        let (ssid, ssid_cut) = bounded(ssid);
        let (password, password_cut) = bounded(password);
        (
            Self {
                ssid: ssid.to_string(),
                password: password.to_string(),
                mode,
            },
            ssid_cut || password_cut,
        )
    }

    pub fn ssid(&self) -> &str {
        &self.ssid
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn mode(&self) -> WifiMode {
        self.mode
    }

    pub fn encode(&self) -> [u8; CREDENTIALS_RECORD_LEN] {
        let mut record = [0_u8; CREDENTIALS_RECORD_LEN];
        record[..self.ssid.len()].copy_from_slice(self.ssid.as_bytes());
        record[FIELD_SLOT..FIELD_SLOT + self.password.len()]
            .copy_from_slice(self.password.as_bytes());
        record[FIELD_SLOT * 2] = match self.mode {
            WifiMode::Host => MODE_HOST,
            WifiMode::Client => MODE_CLIENT,
        };
        record
    }

    /// Decodes a stored record. `None` when the record is too short.
    pub fn decode(record: &[u8]) -> Option<Self> {
        if record.len() < CREDENTIALS_RECORD_LEN {
            return None;
        }
        let ssid = decode_field(&record[..FIELD_SLOT]);
        let password = decode_field(&record[FIELD_SLOT..FIELD_SLOT * 2]);
        let mode = if record[FIELD_SLOT * 2] == MODE_HOST {
            WifiMode::Host
        } else {
            WifiMode::Client
        };
        Some(Self::new(&ssid, &password, mode).0)
    }
}

fn bounded(value: &str) -> (&str, bool) {
    if value.len() <= MAX_FIELD_LEN {
        return (value, false);
    }
    let mut end = MAX_FIELD_LEN;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    (&value[..end], true)
}

fn decode_field(slot: &[u8]) -> String {
    let end = slot
        .iter()
        .position(|byte| *byte == 0)
        .unwrap_or(MAX_FIELD_LEN)
        .min(MAX_FIELD_LEN);
    String::from_utf8_lossy(&slot[..end]).into_owned()
}

/// Fields submitted by the settings page. Absent fields keep their stored value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SettingsForm {
    #[serde(default)]
    pub ssid: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub mode: Option<String>,
}

impl SettingsForm {
    /// Parses an `application/x-www-form-urlencoded` body. Unknown fields
    /// are ignored; a repeated field is an error.
    pub fn parse_urlencoded(body: &[u8]) -> Result<Self, serde_urlencoded::de::Error> {
        serde_urlencoded::from_bytes(body)
    }

    /// Merges the submitted fields over `current`. The flag reports truncation.
    pub fn apply_to(&self, current: &NetworkCredentials) -> (NetworkCredentials, bool) {
        let mode = match self.mode.as_deref() {
            Some("host") => WifiMode::Host,
            Some(_) => WifiMode::Client,
            None => current.mode(),
        };
        NetworkCredentials::new(
            self.ssid.as_deref().unwrap_or(current.ssid()),
            self.password.as_deref().unwrap_or(current.password()),
            mode,
        )
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn default_credentials_start_in_host_mode() {
        let creds = NetworkCredentials::default();
        assert_eq!(creds.mode(), WifiMode::Host);
        assert_eq!(creds.ssid(), DEFAULT_AP_SSID);
    }

    #[test]
    fn record_keeps_fields_in_fixed_slots() {
        let (creds, _) = NetworkCredentials::new("Net", "Pass1234", WifiMode::Client);
        let record = creds.encode();

        assert_eq!(&record[..4], b"Net\0");
        assert_eq!(&record[32..41], b"Pass1234\0");
        assert_eq!(record[64], b'0');
        assert_eq!(NetworkCredentials::decode(&record), Some(creds));
    }

    #[test]
    fn host_mode_is_stored_as_ascii_one() {
        let (creds, _) = NetworkCredentials::new("Fence", "", WifiMode::Host);
        assert_eq!(creds.encode()[64], b'1');
    }

    #[test]
    fn overlong_fields_are_cut_to_31_bytes() {
        let long = "x".repeat(40);
        let (creds, truncated) = NetworkCredentials::new(&long, &long, WifiMode::Client);

        assert!(truncated);
        assert_eq!(creds.ssid().len(), MAX_FIELD_LEN);
        assert_eq!(creds.password().len(), MAX_FIELD_LEN);
        assert_eq!(creds.encode()[31], 0);
        assert_eq!(creds.encode()[63], 0);
    }

    #[test]
    fn truncation_never_splits_a_character() {
        let ssid = format!("{}é", "a".repeat(30));
        let (creds, truncated) = NetworkCredentials::new(&ssid, "", WifiMode::Host);
        assert!(truncated);
        assert_eq!(creds.ssid(), "a".repeat(30));
    }

    #[test]
    fn short_record_does_not_decode() {
        assert_eq!(NetworkCredentials::decode(&[b'a'; 10]), None);
    }

    #[test]
    fn unterminated_slot_reads_at_most_31_bytes() {
        let mut record = [b'z'; CREDENTIALS_RECORD_LEN];
        record[64] = b'7';
        let creds = NetworkCredentials::decode(&record).expect("decode");
        assert_eq!(creds.ssid().len(), MAX_FIELD_LEN);
        assert_eq!(creds.mode(), WifiMode::Client);
    }

    #[test]
    fn form_body_is_percent_decoded() {
        let form = SettingsForm::parse_urlencoded(b"mode=client&ssid=My+Net%21&password=p%26ss")
            .expect("form");
        assert_eq!(
            form,
            SettingsForm {
                ssid: Some("My Net!".to_string()),
                password: Some("p&ss".to_string()),
                mode: Some("client".to_string()),
            }
        );
    }

    #[test]
    fn malformed_escape_is_kept_literally() {
        let form = SettingsForm::parse_urlencoded(b"ssid=100%&password=%zz").expect("form");
        assert_eq!(form.ssid.as_deref(), Some("100%"));
        assert_eq!(form.password.as_deref(), Some("%zz"));
    }

    #[test]
    fn unknown_fields_are_ignored_and_missing_ones_stay_absent() {
        let form = SettingsForm::parse_urlencoded(b"ssid=&submit=Save").expect("form");
        assert_eq!(
            form,
            SettingsForm {
                ssid: Some(String::new()),
                ..Default::default()
            }
        );
    }

    #[test]
    fn repeated_field_is_rejected() {
        assert!(SettingsForm::parse_urlencoded(b"ssid=a&ssid=b").is_err());
    }

    #[test]
    fn only_host_selects_host_mode() {
        let current = NetworkCredentials::default();
        let form = SettingsForm {
            mode: Some("HOST".to_string()),
            ..Default::default()
        };
        assert_eq!(form.apply_to(&current).0.mode(), WifiMode::Client);

        let form = SettingsForm {
            mode: Some("host".to_string()),
            ..Default::default()
        };
        assert_eq!(form.apply_to(&current).0.mode(), WifiMode::Host);
    }

    #[test]
    fn absent_fields_keep_current_values() {
        let (current, _) = NetworkCredentials::new("Old", "secret99", WifiMode::Client);
        let form = SettingsForm {
            ssid: Some("New".to_string()),
            ..Default::default()
        };
        let (updated, truncated) = form.apply_to(&current);
        assert!(!truncated);
        assert_eq!(updated.ssid(), "New");
        assert_eq!(updated.password(), "secret99");
        assert_eq!(updated.mode(), WifiMode::Client);
    }
}
