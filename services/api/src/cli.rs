use crate::ops::{export_ledger, reset_spend, LedgerExportArgs, SpendResetArgs};
use crate::server;
use canopy::error::AppError;
use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "canopy",
    about = "Plant trees from Shopify orders and manage the shared impact ledger",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the HTTP service (default command)
    Serve(ServeArgs),
    /// Inspect a shop's impact ledger
    Ledger {
        #[command(subcommand)]
        command: LedgerCommand,
    },
    /// Manage a shop's monthly spend
    Spend {
        #[command(subcommand)]
        command: SpendCommand,
    },
}

#[derive(Subcommand, Debug)]
enum LedgerCommand {
    /// Write a shop's ledger rows as CSV
    Export(LedgerExportArgs),
}

#[derive(Subcommand, Debug)]
enum SpendCommand {
    /// Zero the current month's spend so planting can resume
    Reset(SpendResetArgs),
}

#[derive(Args, Debug, Default)]
pub(crate) struct ServeArgs {
    /// Override the configured host for the HTTP server
    #[arg(long)]
    pub(crate) host: Option<String>,
    /// Override the configured port for the HTTP server
    #[arg(long)]
    pub(crate) port: Option<u16>,
}

pub(crate) async fn run() -> Result<(), AppError> {
    let cli = Cli::parse();
    let command = cli
        .command
        .unwrap_or_else(|| Command::Serve(ServeArgs::default()));

    match command {
        Command::Serve(args) => server::run(args).await,
        Command::Ledger {
            command: LedgerCommand::Export(args),
        } => export_ledger(args).await,
        Command::Spend {
            command: SpendCommand::Reset(args),
        } => reset_spend(args).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_is_the_default_command() {
        let cli = Cli::try_parse_from(["canopy"]).expect("parses");
        assert!(cli.command.is_none());
    }

    #[test]
    fn ledger_export_takes_a_shop_and_output() {
        let cli = Cli::try_parse_from([
            "canopy",
            "ledger",
            "export",
            "--shop",
            "maple-and-moss.myshopify.com",
            "--output",
            "ledger.csv",
        ])
        .expect("parses");

        match cli.command {
            Some(Command::Ledger {
                command: LedgerCommand::Export(args),
            }) => {
                assert_eq!(args.shop, "maple-and-moss.myshopify.com");
                assert_eq!(
                    args.output.as_deref(),
                    Some(std::path::Path::new("ledger.csv"))
                );
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn spend_reset_requires_a_shop() {
        assert!(Cli::try_parse_from(["canopy", "spend", "reset"]).is_err());
    }
}
