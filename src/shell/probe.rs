//! Host OS version detection.

use std::fmt;
use std::str::FromStr;

/// Lowest major version with a native pseudo-console.
pub const NATIVE_CONSOLE_MIN_MAJOR: u32 = 10;
/// Lowest build with a native pseudo-console (Windows 10 1809).
pub const NATIVE_CONSOLE_MIN_BUILD: u32 = 17763;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct OsVersion {
    pub major: u32,
    pub minor: u32,
    pub build: u32,
}

impl OsVersion {
    pub const fn new(major: u32, minor: u32, build: u32) -> Self {
        Self { major, minor, build }
    }

    /// Version reported for hosts whose pseudo-terminals are always native.
    pub const fn native_baseline() -> Self {
        Self::new(NATIVE_CONSOLE_MIN_MAJOR, 0, NATIVE_CONSOLE_MIN_BUILD)
    }

    pub fn supports_native_console(&self) -> bool {
        self.major >= NATIVE_CONSOLE_MIN_MAJOR && self.build >= NATIVE_CONSOLE_MIN_BUILD
    }
}

impl fmt::Display for OsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.build)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid OS version {0:?}, expected major.minor.build")]
pub struct ParseOsVersionError(String);

impl FromStr for OsVersion {
    type Err = ParseOsVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // A fourth component (revision) is allowed and ignored.
        let fields: Vec<u32> = s
            .trim()
            .split('.')
            .take(3)
            .map(str::parse)
            .collect::<Result<_, _>>()
            .map_err(|_| ParseOsVersionError(s.to_string()))?;
        match fields[..] {
            [major, minor, build] => Ok(Self::new(major, minor, build)),
            _ => Err(ParseOsVersionError(s.to_string())),
        }
    }
}

/// Source of the host OS version used for backend selection.
pub trait CapabilityProbe: Send + Sync {
    fn os_version(&self) -> OsVersion;
}

/// Probe that always reports the same version.
#[derive(Debug, Clone, Copy)]
pub struct FixedProbe(pub OsVersion);

impl CapabilityProbe for FixedProbe {
    fn os_version(&self) -> OsVersion {
        self.0
    }
}

/// Probe that asks the running host.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostProbe;

impl CapabilityProbe for HostProbe {
    #[cfg(windows)]
    fn os_version(&self) -> OsVersion {
        use std::sync::OnceLock;

        static DETECTED: OnceLock<OsVersion> = OnceLock::new();
        *DETECTED.get_or_init(|| match detect_windows_version() {
            Some(version) => {
                tracing::debug!(%version, "detected host version");
                version
            }
            None => {
                tracing::warn!("could not determine host version, assuming no native console");
                OsVersion::new(0, 0, 0)
            }
        })
    }

    #[cfg(not(windows))]
    fn os_version(&self) -> OsVersion {
        OsVersion::native_baseline()
    }
}

#[cfg(windows)]
fn detect_windows_version() -> Option<OsVersion> {
    let output = std::process::Command::new("cmd")
        .args(["/C", "ver"])
        .output()
        .ok()?;
    parse_ver_output(&String::from_utf8_lossy(&output.stdout))
}

/// Extract the version from `ver` output such as
/// `Microsoft Windows [Version 10.0.19045.3803]`.
#[cfg_attr(not(windows), allow(dead_code))]
pub(crate) fn parse_ver_output(text: &str) -> Option<OsVersion> {
    let start = text.find("Version ")? + "Version ".len();
    let rest = &text[start..];
    let end = rest.find(']').unwrap_or(rest.len());
    rest[..end].parse().ok()
}
