//! Boot selection announced by a booting machine
//!
//! iPXE fills these in from its own variables when it chains to the boot
//! service, e.g. `/ipxe?uuid=${uuid}&ip=${ip}&mac=${mac:hexhyp}&type=worker`.
//! Variables iPXE does not know arrive as empty strings.

use serde::Deserialize;
use std::net::Ipv4Addr;

/// Role chosen from the boot menu
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BootType {
    /// First control-plane node, bootstraps the cluster
    Init,
    Controlplane,
    Worker,
    #[default]
    #[serde(other)]
    Unknown,
}

impl BootType {
    /// Whether a machine booting with this role becomes a control-plane endpoint
    pub fn elects_controlplane(self) -> bool {
        matches!(self, BootType::Init | BootType::Controlplane)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BootType::Init => "init",
            BootType::Controlplane => "controlplane",
            BootType::Worker => "worker",
            BootType::Unknown => "",
        }
    }
}

/// Query parameters of a boot request
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BootSelection {
    pub uuid: Option<String>,
    pub mac: Option<String>,
    pub ip: Option<String>,
    pub hostname: Option<String>,
    pub serial: Option<String>,
    pub domain: Option<String>,
    #[serde(rename = "type")]
    pub boot_type: BootType,
}

impl BootSelection {
    /// The announced address, when it is a valid IPv4 address
    pub fn announced_ipv4(&self) -> Option<Ipv4Addr> {
        self.ip.as_deref().and_then(|ip| ip.trim().parse().ok())
    }

    /// The IPv4 address to register under the control-plane name, if any
    pub fn controlplane_candidate(&self) -> Option<Ipv4Addr> {
        if self.boot_type.elects_controlplane() {
            self.announced_ipv4()
        } else {
            None
        }
    }

    /// Value of a selector attribute, normalised for matching
    pub fn attribute(&self, key: &str) -> Option<String> {
        let value = match key {
            "uuid" => self.uuid.as_deref(),
            "mac" => return self.mac.as_deref().and_then(normalize_mac),
            "ip" => self.ip.as_deref(),
            "hostname" => self.hostname.as_deref(),
            "serial" => self.serial.as_deref(),
            "domain" => self.domain.as_deref(),
            "type" => Some(self.boot_type.as_str()),
            _ => None,
        }?;
        let value = value.trim();
        (!value.is_empty()).then(|| value.to_ascii_lowercase())
    }
}

/// Lower-case, colon-separated form of a hyphen- or colon-separated MAC
pub fn normalize_mac(mac: &str) -> Option<String> {
    let parts: Vec<&str> = mac.trim().split(|c| c == ':' || c == '-').collect();
    let valid = parts.len() == 6
        && parts
            .iter()
            .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()));
    valid.then(|| parts.join(":").to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selection(json: &str) -> BootSelection {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_boot_type_decoding() {
        assert_eq!(selection(r#"{"type":"init"}"#).boot_type, BootType::Init);
        assert_eq!(
            selection(r#"{"type":"controlplane"}"#).boot_type,
            BootType::Controlplane
        );
        assert_eq!(selection(r#"{"type":"bogus"}"#).boot_type, BootType::Unknown);
        assert_eq!(selection("{}").boot_type, BootType::Unknown);
    }

    #[test]
    fn test_controlplane_candidate() {
        let s = selection(r#"{"type":"controlplane","ip":"192.168.123.10"}"#);
        assert_eq!(
            s.controlplane_candidate(),
            Some(Ipv4Addr::new(192, 168, 123, 10))
        );

        let worker = selection(r#"{"type":"worker","ip":"192.168.123.10"}"#);
        assert_eq!(worker.controlplane_candidate(), None);

        let bad_ip = selection(r#"{"type":"init","ip":"not-an-ip"}"#);
        assert_eq!(bad_ip.controlplane_candidate(), None);
    }

    #[test]
    fn test_attribute_normalisation() {
        let s = selection(r#"{"mac":"52-54-00-AA-BB-CC","hostname":"","uuid":"ABC"}"#);
        assert_eq!(s.attribute("mac").as_deref(), Some("52:54:00:aa:bb:cc"));
        assert_eq!(s.attribute("hostname"), None);
        assert_eq!(s.attribute("uuid").as_deref(), Some("abc"));
        assert_eq!(s.attribute("type"), None);
        assert_eq!(normalize_mac("52:54:00"), None);
    }
}
