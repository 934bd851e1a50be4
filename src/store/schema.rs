//! DDL for the three cache relations (spec §3 / §6): `stations`, `variables`,
//! `measurements`. Applied once at startup, mirroring the teacher's
//! `schema.rs::create_schema` (idempotent `CREATE TABLE IF NOT EXISTS`).

use anyhow::Result;
use sqlx::PgPool;

/// Create or update the cache schema (idempotent). Safe to call on every
/// startup; no-op if the relations already exist.
pub async fn create_schema(pool: &PgPool) -> Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS stations (
            id              BIGSERIAL PRIMARY KEY,
            provider        TEXT        NOT NULL,
            external_id     TEXT        NOT NULL,
            name            TEXT,
            latitude        DOUBLE PRECISION,
            longitude       DOUBLE PRECISION,
            elevation       DOUBLE PRECISION,
            metadata_json   JSONB       NOT NULL DEFAULT '{}'::jsonb,
            UNIQUE (provider, external_id)
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS variables (
            id          BIGSERIAL PRIMARY KEY,
            name        TEXT NOT NULL UNIQUE,
            unit        TEXT,
            description TEXT
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS measurements (
            id          BIGSERIAL PRIMARY KEY,
            station_id  BIGINT      NOT NULL REFERENCES stations(id),
            variable_id BIGINT      NOT NULL REFERENCES variables(id),
            model       TEXT        NOT NULL DEFAULT '',
            datetime    TIMESTAMPTZ NOT NULL,
            value       DOUBLE PRECISION,
            UNIQUE (station_id, variable_id, model, datetime)
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // Composite index supporting the common "all rows for (station, variable)
    // within an instant range" read path (spec §4.1).
    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_measurements_station_variable_datetime
            ON measurements (station_id, variable_id, datetime);
        "#,
    )
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}
