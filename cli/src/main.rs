use activator_cli::Cli;
use activator_cli::Command;
use activator_cli::activation_command;
use activator_cli::describe_boot_outcome;
use activator_cli::logging;
use activator_cli::run_boot;
use activator_cli::run_status;
use activator_core::ActivatorConfig;
use activator_utils_home_dir::find_activator_home;
use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let home = find_activator_home()?;
    let config = ActivatorConfig::load(&home)?;

    match cli.command {
        Command::Command(args) => {
            println!("{}", activation_command(&config, &args));
        }
        Command::Boot(args) => {
            let _guard = logging::init(Some(&home));
            let outcome = run_boot(&home, &config, &args).await;
            println!("{}", describe_boot_outcome(&outcome));
        }
        Command::Status => {
            let _guard = logging::init(None);
            for line in run_status(&home, &config).await.lines() {
                println!("{line}");
            }
        }
    }
    Ok(())
}
