use clap::Parser;

use pollcast::cli::{self, Cli, Command, ConfigCommand};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        None => cli::handle_start(None, None).await,
        Some(Command::Start { port, bind }) => cli::handle_start(port, bind).await,
        Some(Command::Config(ConfigCommand::Show)) => cli::handle_config_show(),
        Some(Command::Config(ConfigCommand::Path)) => {
            cli::handle_config_path();
            Ok(())
        }
        Some(Command::Version) => {
            cli::handle_version();
            Ok(())
        }
    };

    if let Err(err) = result {
        eprintln!("Error: {}", err);
        std::process::exit(1);
    }
}
