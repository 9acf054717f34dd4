//! Core domain types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::ConfigError;

/// Local IPC surface through which the agent is exposed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Cygwin / MSYS2 emulated unix socket
    Cygwin,
    /// Windows Subsystem for Linux
    Wsl,
    /// Windows OpenSSH named pipe
    WinSsh,
    /// Hyper-V socket (WSL2 and other guests)
    HyperV,
    /// SecureCRT (shares the OpenSSH pipe)
    SecureCrt,
    /// PuTTY's Pageant window protocol
    Pageant,
    /// Xshell's agent protocol
    Xshell,
}

impl TransportKind {
    /// Every transport, in id order
    pub const ALL: [TransportKind; 7] = [
        TransportKind::Cygwin,
        TransportKind::Wsl,
        TransportKind::WinSsh,
        TransportKind::HyperV,
        TransportKind::SecureCrt,
        TransportKind::Pageant,
        TransportKind::Xshell,
    ];

    /// Stable numeric id, never reused
    pub fn id(&self) -> u8 {
        match self {
            TransportKind::Cygwin => 0,
            TransportKind::Wsl => 1,
            TransportKind::WinSsh => 2,
            TransportKind::HyperV => 3,
            TransportKind::SecureCrt => 4,
            TransportKind::Pageant => 5,
            TransportKind::Xshell => 6,
        }
    }

    /// Short label
    pub fn name(&self) -> &'static str {
        match self {
            TransportKind::Cygwin => "Cygwin",
            TransportKind::Wsl => "WSL",
            TransportKind::WinSsh => "WinSSH",
            TransportKind::HyperV => "Hyper-V",
            TransportKind::SecureCrt => "SecureCRT",
            TransportKind::Pageant => "Pageant",
            TransportKind::Xshell => "XShell",
        }
    }

    /// Descriptive label
    pub fn full_name(&self) -> &'static str {
        match self {
            TransportKind::Cygwin => "Cygwin (MinGW64 & MSYS2)",
            TransportKind::Wsl => "Windows Subsystem for Linux",
            TransportKind::WinSsh => "Windows OpenSSH",
            TransportKind::HyperV => "Hyper-V",
            TransportKind::SecureCrt => "SecureCRT",
            TransportKind::Pageant => "Pageant",
            TransportKind::Xshell => "XShell",
        }
    }

    /// Whether this build can serve the transport
    pub fn is_supported(&self) -> bool {
        match self {
            TransportKind::Cygwin | TransportKind::Wsl | TransportKind::Xshell => true,
            TransportKind::HyperV => cfg!(any(windows, target_os = "linux")),
            TransportKind::WinSsh | TransportKind::SecureCrt | TransportKind::Pageant => {
                cfg!(windows)
            }
        }
    }

    /// Transports enabled when the configuration does not list any
    ///
    /// On Windows every surface is served. Elsewhere the agent runs as a
    /// guest relay, so only the unix socket and the VM socket make sense.
    pub fn platform_defaults() -> Vec<TransportKind> {
        if cfg!(windows) {
            Self::ALL.to_vec()
        } else {
            Self::ALL
                .into_iter()
                .filter(|k| matches!(k, TransportKind::Wsl | TransportKind::HyperV))
                .filter(|k| k.is_supported())
                .collect()
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TransportKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Self::ALL
            .into_iter()
            .find(|k| {
                k.name().eq_ignore_ascii_case(wanted)
                    || k.name().replace('-', "").eq_ignore_ascii_case(wanted)
            })
            .ok_or_else(|| ConfigError::UnknownTransport(s.to_string()))
    }
}

/// Identity of a Hyper-V virtual machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VmId(pub Uuid);

impl VmId {
    /// Wildcard identity: any partition
    pub const WILDCARD: VmId = VmId(Uuid::nil());

    /// Parse a GUID, with or without surrounding braces
    pub fn parse(s: &str) -> Option<Self> {
        let trimmed = s.trim().trim_start_matches('{').trim_end_matches('}');
        Uuid::parse_str(trimmed).ok().map(VmId)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for VmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl From<Uuid> for VmId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// How the Xshell proxy forwards agent responses
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum XshellWriteMode {
    /// Write bytes through as they come
    #[default]
    Passthrough,
    /// Hold writes until one whole length-prefixed message is buffered
    Reassemble,
}

impl FromStr for XshellWriteMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "passthrough" => Ok(XshellWriteMode::Passthrough),
            "reassemble" => Ok(XshellWriteMode::Reassemble),
            other => Err(ConfigError::Invalid(format!(
                "unknown xshell write mode: {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_ids_unique() {
        let mut ids: Vec<u8> = TransportKind::ALL.iter().map(|k| k.id()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), TransportKind::ALL.len());
    }

    #[test]
    fn test_transport_names() {
        assert_eq!(TransportKind::Cygwin.full_name(), "Cygwin (MinGW64 & MSYS2)");
        assert_eq!(TransportKind::Wsl.name(), "WSL");
        assert_eq!(TransportKind::HyperV.to_string(), "Hyper-V");
    }

    #[test]
    fn test_transport_from_str() {
        assert_eq!("winssh".parse::<TransportKind>().unwrap(), TransportKind::WinSsh);
        assert_eq!("Hyper-V".parse::<TransportKind>().unwrap(), TransportKind::HyperV);
        assert_eq!("hyperv".parse::<TransportKind>().unwrap(), TransportKind::HyperV);
        assert!("putty".parse::<TransportKind>().is_err());
    }

    #[test]
    fn test_platform_defaults_are_supported() {
        for kind in TransportKind::platform_defaults() {
            assert!(kind.is_supported(), "{} enabled but unsupported", kind);
        }
    }

    #[test]
    fn test_vm_id_parse_braced() {
        let id = VmId::parse("{4D2B6F0A-1C3E-4F5A-9B8C-7D6E5F4A3B2C}").unwrap();
        assert_eq!(id.to_string(), "4d2b6f0a-1c3e-4f5a-9b8c-7d6e5f4a3b2c");
        assert_eq!(VmId::parse("4d2b6f0a-1c3e-4f5a-9b8c-7d6e5f4a3b2c"), Some(id));
        assert!(VmId::parse("--parent").is_none());
    }

    #[test]
    fn test_write_mode_serde_names() {
        let mode: XshellWriteMode = serde_json::from_str("\"reassemble\"").unwrap();
        assert_eq!(mode, XshellWriteMode::Reassemble);
        assert_eq!("Passthrough".parse::<XshellWriteMode>().unwrap(), XshellWriteMode::Passthrough);
    }
}
