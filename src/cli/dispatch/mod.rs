use anyhow::{Context, Result};
use serde_json::Value;

use crate::cli::actions::{Action, server::Args};
use crate::cli::commands;

fn dsn(matches: &clap::ArgMatches) -> Result<String> {
    matches
        .get_one::<String>(commands::ARG_DSN)
        .cloned()
        .context("missing required argument: --dsn")
}

/// Map parsed arguments onto an `Action`.
///
/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let (name, sub) = matches
        .subcommand()
        .context("missing subcommand")?;

    match name {
        "start" => {
            let port = sub
                .get_one::<u16>(commands::ARG_PORT)
                .copied()
                .unwrap_or(9700);
            let sweep_interval_seconds = sub
                .get_one::<u64>(commands::ARG_SWEEP_INTERVAL)
                .copied()
                .unwrap_or(60);
            Ok(Action::Server(Args {
                port,
                dsn: dsn(matches)?,
                sweep_interval_seconds,
            }))
        }
        "set" => {
            let group = sub
                .get_one::<String>("group")
                .cloned()
                .context("missing settings group")?;
            let key = sub
                .get_one::<String>("key")
                .cloned()
                .context("missing settings key")?;
            let raw = sub
                .get_one::<String>("value")
                .cloned()
                .context("missing settings value")?;
            let value: Value = serde_json::from_str(&raw)
                .with_context(|| format!("settings value is not valid JSON: {raw}"))?;
            Ok(Action::Set {
                dsn: dsn(matches)?,
                group,
                key,
                value,
            })
        }
        "unset" => Ok(Action::Unset {
            dsn: dsn(matches)?,
            group: sub
                .get_one::<String>("group")
                .cloned()
                .context("missing settings group")?,
            key: sub
                .get_one::<String>("key")
                .cloned()
                .context("missing settings key")?,
        }),
        "reset-id" => Ok(Action::ResetId { dsn: dsn(matches)? }),
        "clear-logs" => Ok(Action::ClearLogs { dsn: dsn(matches)? }),
        "export-ssh" => Ok(Action::ExportSsh { dsn: dsn(matches)? }),
        "version" => Ok(Action::Version),
        other => anyhow::bail!("unknown subcommand: {other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::handler;
    use crate::cli::actions::Action;
    use crate::cli::commands;

    #[test]
    fn start_requires_dsn() {
        temp_env::with_vars([("GARDISTO_DSN", None::<&str>)], || {
            let command = commands::new();
            let matches = command.get_matches_from(vec!["gardisto", "start"]);
            let result = handler(&matches);
            assert!(result.is_err());
            if let Err(err) = result {
                assert!(err.to_string().contains("--dsn"));
            }
        });
    }

    #[test]
    fn start_dispatches_with_defaults() {
        let command = commands::new();
        let matches = command.get_matches_from(vec![
            "gardisto",
            "--dsn",
            "postgres://localhost/gardisto",
            "start",
        ]);
        let action = handler(&matches).expect("action");
        match action {
            Action::Server(args) => {
                assert_eq!(args.port, 9700);
                assert_eq!(args.dsn, "postgres://localhost/gardisto");
                assert_eq!(args.sweep_interval_seconds, 60);
            }
            other => panic!("expected server action, got {other:?}"),
        }
    }

    #[test]
    fn set_parses_json_value() {
        let command = commands::new();
        let matches = command.get_matches_from(vec![
            "gardisto",
            "--dsn",
            "postgres://localhost/gardisto",
            "set",
            "session",
            "admin_expire_minutes",
            "60",
        ]);
        let action = handler(&matches).expect("action");
        match action {
            Action::Set {
                group, key, value, ..
            } => {
                assert_eq!(group, "session");
                assert_eq!(key, "admin_expire_minutes");
                assert_eq!(value, serde_json::json!(60));
            }
            other => panic!("expected set action, got {other:?}"),
        }
    }

    #[test]
    fn set_rejects_invalid_json() {
        let command = commands::new();
        let matches = command.get_matches_from(vec![
            "gardisto",
            "--dsn",
            "postgres://localhost/gardisto",
            "set",
            "auth",
            "server",
            "not json",
        ]);
        assert!(handler(&matches).is_err());
    }

    #[test]
    fn version_needs_no_dsn() {
        temp_env::with_vars([("GARDISTO_DSN", None::<&str>)], || {
            let command = commands::new();
            let matches = command.get_matches_from(vec!["gardisto", "version"]);
            let action = handler(&matches).expect("action");
            assert!(matches!(action, Action::Version));
        });
    }
}
