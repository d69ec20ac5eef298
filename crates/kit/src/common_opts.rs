//! Command-line options

use camino::Utf8PathBuf;
use clap::Parser;

use crate::config::Overrides;

/// Options that take precedence over `container-host.config.json`
#[derive(Parser, Debug, Clone, Default)]
pub struct RunOpts {
    #[clap(long, help = "Target architecture (e.g. aarch64, x86_64)")]
    pub arch: Option<String>,

    #[clap(long, help = "Fedora CoreOS version")]
    pub version: Option<String>,

    #[clap(
        long,
        value_name = "PATH",
        help = "Configuration file (default: ./container-host.config.json)"
    )]
    pub config: Option<Utf8PathBuf>,
}

impl RunOpts {
    pub fn overrides(&self) -> Overrides {
        Overrides {
            architecture: self.arch.clone(),
            version: self.version.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_overrides() {
        let opts = RunOpts::try_parse_from(["fcvk", "--arch", "x86_64", "--version", "42.0.0.0"])
            .unwrap();
        let overrides = opts.overrides();
        assert_eq!(overrides.architecture.as_deref(), Some("x86_64"));
        assert_eq!(overrides.version.as_deref(), Some("42.0.0.0"));
        assert_eq!(opts.config, None);
    }

    #[test]
    fn test_no_flags() {
        let opts = RunOpts::try_parse_from(["fcvk"]).unwrap();
        assert!(opts.arch.is_none());
        assert!(opts.version.is_none());
    }
}
