//! Schema bootstrap.
//!
//! The gateway owns its schema; every statement is idempotent and runs at
//! startup so a fresh database is usable without an external migration
//! step.

use anyhow::{Context, Result};
use sqlx::PgPool;
use tracing::info;

const SCHEMA: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS settings (
        grp TEXT NOT NULL,
        key TEXT NOT NULL,
        value JSONB NOT NULL,
        PRIMARY KEY (grp, key)
    )",
    r"
    CREATE TABLE IF NOT EXISTS users (
        id UUID PRIMARY KEY,
        kind TEXT NOT NULL,
        username TEXT NOT NULL,
        password_hash TEXT,
        token TEXT,
        secret TEXT,
        roles TEXT[] NOT NULL DEFAULT '{}',
        administrator TEXT NOT NULL DEFAULT '',
        permissions TEXT[] NOT NULL DEFAULT '{}',
        disabled BOOLEAN NOT NULL DEFAULT FALSE,
        active_until TIMESTAMPTZ,
        last_active TIMESTAMPTZ,
        theme TEXT NOT NULL DEFAULT '',
        keybase TEXT NOT NULL DEFAULT '',
        keybase_id TEXT NOT NULL DEFAULT '',
        UNIQUE (kind, username)
    )",
    "CREATE INDEX IF NOT EXISTS users_keybase_idx ON users (keybase) WHERE keybase <> ''",
    r"
    CREATE TABLE IF NOT EXISTS providers (
        id UUID PRIMARY KEY,
        kind TEXT NOT NULL,
        label TEXT NOT NULL DEFAULT '',
        domain TEXT NOT NULL DEFAULT '',
        tenant TEXT NOT NULL DEFAULT '',
        client_id TEXT NOT NULL DEFAULT '',
        client_secret TEXT NOT NULL DEFAULT '',
        default_roles TEXT[] NOT NULL DEFAULT '{}',
        auto_create BOOLEAN NOT NULL DEFAULT FALSE,
        role_management TEXT NOT NULL DEFAULT 'merge'
    )",
    r"
    CREATE TABLE IF NOT EXISTS secondary_providers (
        id UUID PRIMARY KEY,
        kind TEXT NOT NULL,
        label TEXT NOT NULL DEFAULT '',
        push_factor BOOLEAN NOT NULL DEFAULT FALSE,
        phone_factor BOOLEAN NOT NULL DEFAULT FALSE,
        passcode_factor BOOLEAN NOT NULL DEFAULT FALSE,
        sms_factor BOOLEAN NOT NULL DEFAULT FALSE
    )",
    r"
    CREATE TABLE IF NOT EXISTS policies (
        id UUID PRIMARY KEY,
        name TEXT NOT NULL DEFAULT '',
        disabled BOOLEAN NOT NULL DEFAULT FALSE,
        kind TEXT NOT NULL,
        roles TEXT[] NOT NULL DEFAULT '{}',
        services UUID[] NOT NULL DEFAULT '{}',
        authorities UUID[] NOT NULL DEFAULT '{}',
        admin_secondary UUID,
        user_secondary UUID,
        proxy_secondary UUID,
        authority_secondary UUID,
        keybase_mode TEXT NOT NULL DEFAULT 'optional',
        rules JSONB NOT NULL DEFAULT '{}'
    )",
    r"
    CREATE TABLE IF NOT EXISTS authorities (
        id UUID PRIMARY KEY,
        name TEXT NOT NULL DEFAULT '',
        kind TEXT NOT NULL DEFAULT 'local',
        key_alg TEXT NOT NULL DEFAULT '',
        match_roles BOOLEAN NOT NULL DEFAULT FALSE,
        roles TEXT[] NOT NULL DEFAULT '{}',
        expire INTEGER NOT NULL DEFAULT 600,
        host_expire INTEGER NOT NULL DEFAULT 600,
        private_key TEXT NOT NULL DEFAULT '',
        public_key TEXT NOT NULL DEFAULT '',
        host_domain TEXT NOT NULL DEFAULT '',
        host_proxy TEXT NOT NULL DEFAULT '',
        host_certificates BOOLEAN NOT NULL DEFAULT FALSE,
        strict_host_checking BOOLEAN NOT NULL DEFAULT FALSE,
        host_tokens TEXT[] NOT NULL DEFAULT '{}'
    )",
    r"
    CREATE TABLE IF NOT EXISTS services (
        id UUID PRIMARY KEY,
        name TEXT NOT NULL DEFAULT '',
        roles TEXT[] NOT NULL DEFAULT '{}'
    )",
    r"
    CREATE TABLE IF NOT EXISTS tokens (
        id TEXT PRIMARY KEY,
        kind TEXT NOT NULL,
        secret TEXT NOT NULL DEFAULT '',
        timestamp TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        payload JSONB NOT NULL DEFAULT '{}'
    )",
    "CREATE INDEX IF NOT EXISTS tokens_kind_timestamp_idx ON tokens (kind, timestamp)",
    r"
    CREATE TABLE IF NOT EXISTS nonces (
        id TEXT PRIMARY KEY,
        timestamp TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )",
    r"
    CREATE TABLE IF NOT EXISTS sessions (
        id TEXT PRIMARY KEY,
        scope TEXT NOT NULL,
        user_id UUID NOT NULL,
        timestamp TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        last_active TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        removed BOOLEAN NOT NULL DEFAULT FALSE,
        agent JSONB NOT NULL DEFAULT '{}'
    )",
    "CREATE INDEX IF NOT EXISTS sessions_user_idx ON sessions (user_id)",
    r"
    CREATE TABLE IF NOT EXISTS ssh_certificates (
        id UUID PRIMARY KEY,
        user_id UUID NOT NULL,
        authority_ids UUID[] NOT NULL DEFAULT '{}',
        certificates_info JSONB NOT NULL DEFAULT '[]',
        agent JSONB NOT NULL DEFAULT '{}',
        timestamp TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )",
    r"
    CREATE TABLE IF NOT EXISTS audits (
        id UUID PRIMARY KEY,
        user_id UUID NOT NULL,
        kind TEXT NOT NULL,
        fields JSONB NOT NULL DEFAULT '{}',
        agent JSONB NOT NULL DEFAULT '{}',
        timestamp TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )",
    r"
    CREATE TABLE IF NOT EXISTS events (
        id BIGSERIAL PRIMARY KEY,
        channel TEXT NOT NULL,
        data JSONB,
        timestamp TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )",
    "CREATE INDEX IF NOT EXISTS events_channel_id_idx ON events (channel, id)",
];

/// Apply the schema.
///
/// # Errors
/// Returns an error if any statement fails.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement)
            .execute(pool)
            .await
            .with_context(|| format!("schema statement failed: {statement}"))?;
    }
    info!("Database schema up to date");
    Ok(())
}
