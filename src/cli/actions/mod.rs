pub mod maintenance;
pub mod server;

use anyhow::Result;
use serde_json::Value;

/// Parsed CLI action, executed by the binary.
#[derive(Debug)]
pub enum Action {
    Server(server::Args),
    Set {
        dsn: String,
        group: String,
        key: String,
        value: Value,
    },
    Unset {
        dsn: String,
        group: String,
        key: String,
    },
    ResetId {
        dsn: String,
    },
    ClearLogs {
        dsn: String,
    },
    ExportSsh {
        dsn: String,
    },
    Version,
}

impl Action {
    /// Execute the action.
    ///
    /// # Errors
    /// Returns an error if the action fails.
    pub async fn execute(self) -> Result<()> {
        match self {
            Self::Server(args) => server::execute(args).await,
            Self::Set {
                dsn,
                group,
                key,
                value,
            } => maintenance::set(&dsn, &group, &key, &value).await,
            Self::Unset { dsn, group, key } => maintenance::unset(&dsn, &group, &key).await,
            Self::ResetId { dsn } => maintenance::reset_id(&dsn).await,
            Self::ClearLogs { dsn } => maintenance::clear_logs(&dsn).await,
            Self::ExportSsh { dsn } => maintenance::export_ssh(&dsn).await,
            Self::Version => {
                println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
                Ok(())
            }
        }
    }
}
