use anyhow::Result;

use crate::api;
use crate::task::TaskConfig;

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: String,
    pub sweep_interval_seconds: u64,
}

/// Execute the server action.
///
/// # Errors
/// Returns an error if the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    let task_config =
        TaskConfig::new().with_sweep_interval_seconds(args.sweep_interval_seconds);

    api::new(args.port, args.dsn, task_config).await
}
