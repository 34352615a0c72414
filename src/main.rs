use anyhow::Result;
use clap::{Parser, Subcommand};

mod run;

/// Install staged package images into a root filesystem
///
/// An image is a directory tree laid out exactly as it should appear under
/// the root. `check` walks it without touching anything and reports every
/// collision that would abort the install. `merge` runs the same check and
/// then moves (or copies) each entry into place, honoring config
/// protection: existing files under a protected prefix are never
/// overwritten, the new version lands beside them as `._cfgNNNN_<name>`.
///
/// QUICK START:
///
///   imerge check --image /var/tmp/pkg/image --root /
///   imerge merge --image /var/tmp/pkg/image --root / \
///       --contents /var/db/pkg/app-misc/foo-1.0/CONTENTS
///
/// CONFIGURATION:
///
///   /etc/imerge/config.toml (or --config). CONFIG_PROTECT and
///   CONFIG_PROTECT_MASK append to the protection lists. IMERGE_LOG sets
///   the log filter; IMERGE_LOG_FORMAT=json switches logs to JSON.
#[derive(Parser)]
#[command(name = "imerge")]
#[command(version, about)]
#[command(propagate_version = true)]
#[command(after_help = "See 'imerge <command> --help' for more information on a specific command.")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check whether an image can be merged without collisions
    ///
    /// Exits 1 when the check fails. Nothing on disk is modified.
    Check {
        #[command(flatten)]
        args: run::MergeArgs,

        /// Print the problem report as JSON instead of progress output
        #[arg(long)]
        json: bool,
    },

    /// Merge an image into the root
    ///
    /// Runs the check first unless --skip-check is given.
    Merge {
        #[command(flatten)]
        args: run::MergeArgs,

        /// Write the contents record of installed entries to this file
        #[arg(long)]
        contents: Option<std::path::PathBuf>,

        /// Skip the collision check
        #[arg(long)]
        skip_check: bool,
    },
}

fn main() -> Result<()> {
    imerge::telemetry::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Check { args, json } => {
            if !run::check(&args, json)? {
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::Merge {
            args,
            contents,
            skip_check,
        } => run::merge(&args, contents.as_deref(), skip_check),
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory as _;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn package_version_does_not_clash_with_version_flag() {
        let cli = Cli::try_parse_from([
            "imerge",
            "merge",
            "--image",
            "/var/tmp/image",
            "--name",
            "foo",
            "--pkg-version",
            "1.0-r1",
        ])
        .unwrap();
        let Commands::Merge { args, .. } = cli.command else {
            panic!("expected merge");
        };
        assert_eq!(args.package().unwrap().version, "1.0-r1");
    }
}
