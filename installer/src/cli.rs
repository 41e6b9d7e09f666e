// Command-line surface

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::{RunOptions, TlsRequest};
use crate::installation::certificates::SslMode;
use crate::reconcile::validator::MismatchPolicy;

#[derive(Debug, Parser)]
#[command(
    name = "stack-installer",
    version,
    about = "Provision and reconcile a single-host multi-service deployment"
)]
pub struct Cli {
    /// Configuration file (default: <install-dir>/installer.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Installation directory holding the descriptor and compose file
    #[arg(long, global = true)]
    pub install_dir: Option<PathBuf>,

    /// Also write human-readable logs to stdout
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Install or update the stack (default)
    Install(InstallArgs),
    /// Show classification, volumes, port plan and service states without changing anything
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Inspect the effective configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
}

#[derive(Debug, Clone, Default, Args)]
pub struct InstallArgs {
    /// Public domain name
    #[arg(long)]
    pub domain: Option<String>,

    /// Administrator email
    #[arg(long)]
    pub email: Option<String>,

    /// Registration token
    #[arg(long)]
    pub token: Option<String>,

    /// Regenerate credentials; existing volumes are kept
    #[arg(long)]
    pub force: bool,

    /// Remove existing stack volumes and regenerate credentials
    #[arg(long)]
    pub clean: bool,

    /// Never prompt; use documented defaults
    #[arg(long)]
    pub non_interactive: bool,

    /// Classify, reconcile and render only; write and start nothing
    #[arg(long)]
    pub dry_run: bool,

    /// Policy when preserved credentials do not match existing data
    #[arg(long, value_enum)]
    pub on_mismatch: Option<MismatchPolicy>,

    #[arg(long, value_enum, default_value_t = SslMode::SelfSigned)]
    pub ssl_mode: SslMode,

    /// Certificate file (with --ssl-mode provided)
    #[arg(long, requires = "key")]
    pub cert: Option<PathBuf>,

    /// Private key file (with --ssl-mode provided)
    #[arg(long, requires = "cert")]
    pub key: Option<PathBuf>,

    /// Image tag to deploy (default from configuration)
    #[arg(long)]
    pub image_tag: Option<String>,

    /// Print the final report as JSON
    #[arg(long)]
    pub json: bool,
}

impl InstallArgs {
    pub fn to_options(&self) -> RunOptions {
        RunOptions {
            domain: self.domain.clone(),
            email: self.email.clone(),
            token: self.token.clone(),
            force: self.force,
            clean: self.clean,
            non_interactive: self.non_interactive,
            dry_run: self.dry_run,
            on_mismatch: self.on_mismatch,
            tls: TlsRequest {
                mode: self.ssl_mode,
                cert: self.cert.clone(),
                key: self.key.clone(),
            },
            image_tag: self.image_tag.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_flags_map_to_run_options() {
        let cli = Cli::parse_from([
            "stack-installer",
            "--install-dir",
            "/srv/stack",
            "install",
            "--domain",
            "app.example.com",
            "--force",
            "--non-interactive",
            "--on-mismatch",
            "reset-volume",
            "--ssl-mode",
            "provided",
            "--cert",
            "/etc/ssl/app.crt",
            "--key",
            "/etc/ssl/app.key",
        ]);
        assert_eq!(cli.install_dir, Some(PathBuf::from("/srv/stack")));
        let Some(Command::Install(args)) = cli.command else {
            panic!("expected install");
        };
        let opts = args.to_options();
        assert_eq!(opts.domain.as_deref(), Some("app.example.com"));
        assert!(opts.force && opts.non_interactive && !opts.clean);
        assert_eq!(opts.on_mismatch, Some(MismatchPolicy::ResetVolume));
        assert_eq!(opts.tls.mode, SslMode::Provided);
        assert_eq!(opts.tls.key, Some(PathBuf::from("/etc/ssl/app.key")));
    }

    #[test]
    fn cert_without_key_is_rejected() {
        let res = Cli::try_parse_from(["stack-installer", "install", "--cert", "/a.crt"]);
        assert!(res.is_err());
    }

    #[test]
    fn no_subcommand_is_accepted() {
        let cli = Cli::parse_from(["stack-installer", "--verbose"]);
        assert!(cli.command.is_none());
        assert!(cli.verbose);
    }
}
