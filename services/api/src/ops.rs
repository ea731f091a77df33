use crate::infra::build_service;
use canopy::config::AppConfig;
use canopy::error::AppError;
use canopy::impact::write_ledger_csv;
use canopy::telemetry;
use clap::Args;
use std::fs::File;
use std::io::{self, BufWriter};
use std::path::PathBuf;
use tracing::info;

#[derive(Args, Debug)]
pub(crate) struct LedgerExportArgs {
    /// Shop domain, e.g. example.myshopify.com
    #[arg(long)]
    pub(crate) shop: String,
    /// Destination file (defaults to stdout)
    #[arg(long)]
    pub(crate) output: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub(crate) struct SpendResetArgs {
    /// Shop domain, e.g. example.myshopify.com
    #[arg(long)]
    pub(crate) shop: String,
}

pub(crate) async fn export_ledger(args: LedgerExportArgs) -> Result<(), AppError> {
    let config = AppConfig::load()?;
    telemetry::init(&config.telemetry)?;
    let service = build_service(&config).await?;

    let entries = service.ledger_entries(&args.shop).await?;
    match args.output {
        Some(path) => {
            let file = File::create(&path)?;
            write_ledger_csv(BufWriter::new(file), &entries)?;
            info!(shop = %args.shop, rows = entries.len(), path = %path.display(), "ledger exported");
        }
        None => write_ledger_csv(io::stdout().lock(), &entries)?,
    }
    Ok(())
}

pub(crate) async fn reset_spend(args: SpendResetArgs) -> Result<(), AppError> {
    let config = AppConfig::load()?;
    telemetry::init(&config.telemetry)?;
    let service = build_service(&config).await?;

    let settings = service.reset_spend(&args.shop).await?;
    println!(
        "Monthly spend for {} reset (period {}, planting {})",
        args.shop,
        settings.spend_period.as_deref().unwrap_or("-"),
        if settings.is_paused { "paused" } else { "active" }
    );
    Ok(())
}
