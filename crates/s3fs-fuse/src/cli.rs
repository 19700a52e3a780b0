//! Command-line surface: bucket + mountpoint positionals, a config file,
//! backend selection, FUSE mount options, and verbosity — deliberately
//! small next to the subsystem it drives.

use std::path::PathBuf;

use clap::{ColorChoice, Parser};

/// Mount an S3/GS-compatible bucket as a POSIX filesystem via FUSE.
#[derive(Parser, Debug)]
#[command(name = "s3mount")]
#[command(author, version, about)]
#[command(color = ColorChoice::Auto)]
pub struct Cli {
    /// Name of the bucket to mount.
    pub bucket: String,

    /// Local directory to mount the bucket at.
    pub mountpoint: PathBuf,

    /// Path to the key-value config file (bucket credentials, chunk sizes, ...).
    #[arg(long, value_name = "PATH")]
    pub config: PathBuf,

    /// Backend to talk to.
    #[arg(long, value_enum, default_value = "aws")]
    pub service: ServiceArg,

    /// Extra FUSE mount option, e.g. `-o allow_other`. Repeatable.
    #[arg(short = 'o', value_name = "OPTION")]
    pub mount_options: Vec<String>,

    /// Stay in the foreground instead of daemonizing.
    #[arg(short, long)]
    pub foreground: bool,

    /// Increase log verbosity (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ServiceArg {
    Aws,
    Gs,
    Fvs,
}

impl From<ServiceArg> for s3fs_core::Service {
    fn from(value: ServiceArg) -> Self {
        match value {
            ServiceArg::Aws => s3fs_core::Service::Aws,
            ServiceArg::Gs => s3fs_core::Service::Gs,
            ServiceArg::Fvs => s3fs_core::Service::Fvs,
        }
    }
}

impl Cli {
    /// `tracing_subscriber::EnvFilter` directive implied by `-v` repeats,
    /// absent an explicit `RUST_LOG` override.
    pub fn log_filter(&self) -> &'static str {
        match self.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_invocation() {
        let cli = Cli::parse_from(["s3mount", "my-bucket", "/mnt/b", "--config", "s3fs.conf"]);
        assert_eq!(cli.bucket, "my-bucket");
        assert_eq!(cli.mountpoint, PathBuf::from("/mnt/b"));
        assert_eq!(cli.service, ServiceArg::Aws);
        assert!(!cli.foreground);
    }

    #[test]
    fn repeated_mount_options_accumulate() {
        let cli = Cli::parse_from([
            "s3mount", "b", "/mnt/b", "--config", "c", "-o", "allow_other", "-o", "ro",
        ]);
        assert_eq!(cli.mount_options, vec!["allow_other", "ro"]);
    }

    #[test]
    fn verbose_count_maps_to_filter() {
        let mut cli = Cli::parse_from(["s3mount", "b", "/mnt/b", "--config", "c"]);
        assert_eq!(cli.log_filter(), "warn");
        cli.verbose = 2;
        assert_eq!(cli.log_filter(), "debug");
    }
}
