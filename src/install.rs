//! Detects how the running binary was installed. The npm custom-provider
//! loader skips module plugins under installs that ship no Node module
//! tree, and `doctor` reports the method for upgrade guidance.

use std::fmt;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallMethod {
    Cargo,
    Homebrew,
    Standalone,
    Source,
}

impl InstallMethod {
    /// npm module providers need a module tree next to the binary; the
    /// standalone and Homebrew layouts ship none.
    pub fn supports_npm_providers(&self) -> bool {
        !matches!(self, InstallMethod::Homebrew | InstallMethod::Standalone)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstallMethod::Cargo => "cargo",
            InstallMethod::Homebrew => "homebrew",
            InstallMethod::Standalone => "standalone",
            InstallMethod::Source => "source",
        }
    }
}

impl fmt::Display for InstallMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn detect() -> InstallMethod {
    match std::env::current_exe() {
        Ok(exe) => classify(&exe),
        Err(_) => InstallMethod::Standalone,
    }
}

pub fn classify(exe: &Path) -> InstallMethod {
    let path = exe.to_string_lossy();
    if path.contains("/.cargo/bin/") {
        InstallMethod::Cargo
    } else if path.contains("/Cellar/") || path.contains("/homebrew/") || path.contains("/linuxbrew/")
    {
        InstallMethod::Homebrew
    } else if path.contains("/target/debug/") || path.contains("/target/release/") {
        InstallMethod::Source
    } else {
        InstallMethod::Standalone
    }
}
