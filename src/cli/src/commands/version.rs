//! `lockbox version` command.

use clap::Args;

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn execute(args: VersionArgs) -> Result<(), Box<dyn std::error::Error>> {
    if args.json {
        let info = serde_json::json!({
            "lockbox": lockbox_core::VERSION,
            "runtime": lockbox_runtime::VERSION,
        });
        println!("{}", serde_json::to_string_pretty(&info)?);
    } else {
        println!("lockbox version {}", lockbox_core::VERSION);
    }
    Ok(())
}
