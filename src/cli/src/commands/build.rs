//! `lockbox build` command.

use std::path::PathBuf;

use clap::{ArgAction, Args};
use lockbox_core::config::{BuildConfig, RegistryLogins, TieBreak, DEFAULT_OUTPUT_DIR, DEFAULT_PLATFORMS};
use lockbox_runtime::LockboxBuilder;

#[derive(Args, Debug)]
pub struct BuildArgs {
    /// Lockbox name as defined at the OTA server, or a local `.json`
    /// offline-targets file
    pub lockbox_name: String,

    /// Credentials package (credentials.zip) of the OTA account
    #[arg(short = 'c', long, value_name = "FILE")]
    pub credentials: PathBuf,

    /// Directory the lockbox is written to
    #[arg(long = "output-directory", value_name = "DIR", default_value = DEFAULT_OUTPUT_DIR)]
    pub output_dir: PathBuf,

    /// Remove the output directory first if it exists
    #[arg(long)]
    pub force: bool,

    /// Platform selected for multi-platform images whose compose service
    /// names none (repeatable; default linux/arm/v7 and linux/arm64)
    #[arg(long = "platform", value_name = "PLATFORM", conflicts_with = "all_platforms")]
    pub platforms: Vec<String>,

    /// Select every platform of multi-platform images
    #[arg(long)]
    pub all_platforms: bool,

    /// What to do when two manifests match a platform equally well
    #[arg(long, value_name = "POLICY", default_value_t = TieBreak::Fail)]
    pub tie_break: TieBreak,

    /// Login for the default container registry
    #[arg(long, num_args = 2, value_names = ["USERNAME", "PASSWORD"])]
    pub login: Option<Vec<String>>,

    /// Login for another container registry (repeatable)
    #[arg(
        long = "login-to",
        num_args = 3,
        value_names = ["REGISTRY", "USERNAME", "PASSWORD"],
        action = ArgAction::Append
    )]
    pub login_to: Vec<String>,

    /// Do not validate the offline-update metadata
    #[arg(long, hide = true)]
    pub no_validate: bool,

    /// Fetch metadata only
    #[arg(long, hide = true)]
    pub no_fetch_targets: bool,
}

impl BuildArgs {
    fn registry_logins(&self) -> Result<RegistryLogins, Box<dyn std::error::Error>> {
        let mut logins = RegistryLogins::default();
        if let Some([username, password]) = self.login.as_deref() {
            logins = logins.with_default(username, password);
        }
        for triple in self.login_to.chunks(3) {
            if let [registry, username, password] = triple {
                logins = logins.with_registry(registry, username, password)?;
            }
        }
        Ok(logins)
    }

    /// Translate the arguments into a build configuration.
    pub fn to_config(&self) -> Result<BuildConfig, Box<dyn std::error::Error>> {
        let mut config = BuildConfig::new(&self.lockbox_name, &self.credentials);
        config.output_dir = self.output_dir.clone();
        config.force = self.force;
        config.validate = !self.no_validate;
        config.fetch_targets = !self.no_fetch_targets;
        config.tie_break = self.tie_break;
        config.docker_platforms = if self.all_platforms {
            None
        } else if self.platforms.is_empty() {
            Some(DEFAULT_PLATFORMS.iter().map(|p| p.to_string()).collect())
        } else {
            Some(self.platforms.clone())
        };
        config.logins = self.registry_logins()?;
        Ok(config)
    }
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

pub async fn execute(args: BuildArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = args.to_config()?;
    let mut builder = LockboxBuilder::new(config)?;

    let report = builder.build_with_shutdown(shutdown_signal()).await?;

    println!(
        "Lockbox '{}' created in {} ({} targets)",
        report.lockbox_name,
        report.output_dir.display(),
        report.targets.len()
    );
    Ok(())
}
