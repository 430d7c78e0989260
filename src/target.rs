//! Target selection for platform ABI profiles.

use std::env;
use std::fmt;

/// Supported architecture families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetArch {
    X86_64,
    Aarch64,
    Ppc64,
}

impl TargetArch {
    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "x86_64" | "amd64" => Some(TargetArch::X86_64),
            "aarch64" | "arm64" => Some(TargetArch::Aarch64),
            "ppc64" | "powerpc64" | "ppc64le" | "powerpc64le" => Some(TargetArch::Ppc64),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            TargetArch::X86_64 => "x86_64",
            TargetArch::Aarch64 => "aarch64",
            TargetArch::Ppc64 => "ppc64",
        }
    }
}

/// Supported operating systems.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetOs {
    Macos,
    Linux,
    Windows,
    Aix,
    None,
    Other(String),
}

impl TargetOs {
    pub fn parse(token: &str) -> Self {
        match token {
            "darwin" | "macos" | "ios" => TargetOs::Macos,
            "linux" => TargetOs::Linux,
            "windows" | "win" => TargetOs::Windows,
            "aix" => TargetOs::Aix,
            "none" | "unknown" => TargetOs::None,
            other => TargetOs::Other(other.to_string()),
        }
    }

    fn triple_component(&self) -> &str {
        match self {
            TargetOs::Macos => "macos",
            TargetOs::Linux => "linux",
            TargetOs::Windows => "windows",
            TargetOs::Aix => "aix",
            TargetOs::None => "none",
            TargetOs::Other(value) => value.as_str(),
        }
    }
}

/// Target triple description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    arch: TargetArch,
    os: TargetOs,
    triple: String,
}

impl Target {
    /// Construct the target representing the current host.
    #[must_use]
    pub fn host() -> Self {
        let arch = TargetArch::parse(env::consts::ARCH).unwrap_or(TargetArch::X86_64);
        let os = TargetOs::parse(env::consts::OS);
        Self::from_components(arch, os)
    }

    /// Parse a target triple or shorthand.
    ///
    /// # Errors
    ///
    /// Returns [`TargetError::Empty`] when the input is blank or comprised of
    /// whitespace, and [`TargetError::UnsupportedArch`] when the architecture
    /// prefix is not recognised.
    pub fn parse(spec: &str) -> Result<Self, TargetError> {
        let trimmed = spec.trim().to_ascii_lowercase();
        if trimmed.is_empty() {
            return Err(TargetError::Empty);
        }

        let mut parts = trimmed.splitn(2, '-');
        let arch_token = parts.next().unwrap_or_default();
        let arch = TargetArch::parse(arch_token)
            .ok_or_else(|| TargetError::UnsupportedArch(arch_token.to_string()))?;

        if let Some(rest) = parts.next() {
            let mut rest_iter = rest.split('-');
            let vendor = rest_iter.next().unwrap_or_default();
            let os_token = rest_iter.next().unwrap_or("none");
            let os = TargetOs::parse(os_token);
            let triple = format!("{arch_token}-{vendor}-{os_token}");
            Ok(Self { arch, os, triple })
        } else {
            Ok(Self::from_components(arch, TargetOs::None))
        }
    }

    /// Construct a target from explicit components.
    #[must_use]
    pub fn from_components(arch: TargetArch, os: TargetOs) -> Self {
        let vendor = match os {
            TargetOs::Macos => "apple",
            TargetOs::Windows => "pc",
            TargetOs::Aix => "ibm",
            TargetOs::Linux | TargetOs::None | TargetOs::Other(_) => "unknown",
        };
        let triple = format!("{}-{}-{}", arch.as_str(), vendor, os.triple_component());
        Self { arch, os, triple }
    }

    /// Return the architecture family.
    #[must_use]
    pub fn arch(&self) -> TargetArch {
        self.arch
    }

    /// Return the target operating system.
    #[must_use]
    pub fn os(&self) -> &TargetOs {
        &self.os
    }

    /// Return the canonical triple for this target.
    #[must_use]
    pub fn triple(&self) -> &str {
        &self.triple
    }
}

impl Default for Target {
    fn default() -> Self {
        Self::host()
    }
}

/// Errors encountered while parsing a target specification.
#[derive(Debug, Clone)]
pub enum TargetError {
    Empty,
    UnsupportedArch(String),
}

impl fmt::Display for TargetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetError::Empty => write!(f, "target string must not be empty"),
            TargetError::UnsupportedArch(arch) => {
                write!(
                    f,
                    "unsupported architecture '{arch}'; expected one of x86_64, amd64, aarch64, arm64, ppc64"
                )
            }
        }
    }
}

impl std::error::Error for TargetError {}
