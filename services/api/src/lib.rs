mod cli;
mod infra;
mod ops;
mod routes;
mod server;

use canopy::error::AppError;

pub async fn run() -> Result<(), AppError> {
    cli::run().await
}
