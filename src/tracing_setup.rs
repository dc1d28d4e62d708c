//! Tracing subscriber initialization for the `dirspool` binary.
//!
//! # Priority (highest to lowest)
//!
//! 1. `DIRSPOOL_LOG` (per-target directives, e.g. `dirspool=debug,warn`)
//! 2. `RUST_LOG`
//! 3. CLI flags (`-v` → debug, `-q` → error)
//! 4. Default level: `info` for this crate, `warn` for everything else

use tracing::Level;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

/// Verbosity level derived from CLI flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    Quiet,
    Normal,
    Verbose,
}

impl Verbosity {
    /// Verbose wins when both flags are given.
    pub const fn from_flags(verbose: bool, quiet: bool) -> Self {
        if verbose {
            Self::Verbose
        } else if quiet {
            Self::Quiet
        } else {
            Self::Normal
        }
    }

    /// Level applied to this crate's own targets.
    pub const fn crate_level(self) -> Level {
        match self {
            Self::Quiet => Level::ERROR,
            Self::Normal => Level::INFO,
            Self::Verbose => Level::DEBUG,
        }
    }
}

/// Installs the global subscriber, writing to stderr.
///
/// Call once, before anything logs.
pub fn init_subscriber(verbosity: Verbosity) {
    let ansi = std::io::IsTerminal::is_terminal(&std::io::stderr());
    tracing_subscriber::registry()
        .with(build_env_filter(verbosity))
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(ansi)
                .with_target(verbosity == Verbosity::Verbose),
        )
        .init();
}

fn build_env_filter(verbosity: Verbosity) -> EnvFilter {
    // An unparseable DIRSPOOL_LOG falls through rather than failing startup
    if let Ok(directives) = std::env::var("DIRSPOOL_LOG")
        && let Ok(filter) = EnvFilter::try_new(&directives)
    {
        return filter;
    }
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }

    let own = verbosity.crate_level();
    let others = if verbosity == Verbosity::Quiet {
        Level::ERROR
    } else {
        Level::WARN
    };
    EnvFilter::try_new(format!("{others},dirspool={own}"))
        .unwrap_or_else(|_| EnvFilter::new(others.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbose_wins_over_quiet() {
        assert_eq!(Verbosity::from_flags(true, true), Verbosity::Verbose);
        assert_eq!(Verbosity::from_flags(false, true), Verbosity::Quiet);
        assert_eq!(Verbosity::from_flags(false, false), Verbosity::Normal);
    }

    #[test]
    fn crate_levels() {
        assert_eq!(Verbosity::Quiet.crate_level(), Level::ERROR);
        assert_eq!(Verbosity::Normal.crate_level(), Level::INFO);
        assert_eq!(Verbosity::Verbose.crate_level(), Level::DEBUG);
    }

    #[test]
    fn fallback_filters_build() {
        for v in [Verbosity::Quiet, Verbosity::Normal, Verbosity::Verbose] {
            let _filter = build_env_filter(v);
        }
    }
}
