//! Version and build information
//!
//! Values are embedded by `build.rs` at compile time.

use std::fmt;

/// Build information embedded at compile time
#[derive(Debug, Clone)]
pub struct BuildInfo {
    /// Package version from Cargo.toml
    pub version: &'static str,
    /// Package name
    pub name: &'static str,
    /// Git commit hash (short)
    pub git_hash: &'static str,
    /// Git branch name
    pub git_branch: &'static str,
    git_dirty_str: &'static str,
    /// Build timestamp
    pub build_timestamp: &'static str,
    /// Target triple
    pub target: &'static str,
    /// Build profile (debug/release)
    pub profile: &'static str,
    /// Rustc version used to build
    pub rustc_version: &'static str,
    /// Host triple of the build machine
    pub host: &'static str,
}

impl BuildInfo {
    pub const fn current() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION"),
            name: env!("CARGO_PKG_NAME"),
            git_hash: env!("HIERAVG_GIT_HASH"),
            git_branch: env!("HIERAVG_GIT_BRANCH"),
            git_dirty_str: env!("HIERAVG_GIT_DIRTY"),
            build_timestamp: env!("HIERAVG_BUILD_TIMESTAMP"),
            target: env!("HIERAVG_TARGET"),
            profile: env!("HIERAVG_PROFILE"),
            rustc_version: env!("HIERAVG_RUSTC_VERSION"),
            host: env!("HIERAVG_HOST"),
        }
    }

    /// Whether the working tree was dirty at build time
    pub fn git_dirty(&self) -> bool {
        self.git_dirty_str == "true"
    }

    /// Version plus git hash, e.g. "0.1.0-abc1234"
    pub fn full_version(&self) -> String {
        if self.git_dirty() {
            format!("{}-{}-dirty", self.version, self.git_hash)
        } else {
            format!("{}-{}", self.version, self.git_hash)
        }
    }
}

impl fmt::Display for BuildInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} {}", self.name, self.full_version())?;
        writeln!(f)?;
        writeln!(f, "Build Information:")?;
        writeln!(f, "  Version:    {}", self.version)?;
        writeln!(
            f,
            "  Git Hash:   {}{}",
            self.git_hash,
            if self.git_dirty() { " (dirty)" } else { "" }
        )?;
        writeln!(f, "  Git Branch: {}", self.git_branch)?;
        writeln!(f, "  Built:      {}", self.build_timestamp)?;
        writeln!(f, "  Profile:    {}", self.profile)?;
        writeln!(f, "  Target:     {}", self.target)?;
        writeln!(f, "  Host:       {}", self.host)?;
        writeln!(f, "  Compiler:   {}", self.rustc_version)?;
        Ok(())
    }
}

pub fn build_info() -> BuildInfo {
    BuildInfo::current()
}

/// Print version information to stdout
pub fn print_version() {
    print!("{}", build_info());
}
