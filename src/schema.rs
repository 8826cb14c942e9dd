//! Knowledge base schema for PostgreSQL.
//!
//! Applied by the `migrate` phase through `PgTargetStore::migrate`. The
//! whole schema, seed data and version marker go in one transaction, so a
//! failed migration leaves nothing behind. A recorded marker short-circuits
//! the migration entirely.

use sqlx::PgPool;

use crate::store::MigrationOutcome;

// ---

pub const SCHEMA_VERSION: &str = "knowledge_base_v1.0.0";

/// Schemas owned by the knowledge base.
pub const KB_SCHEMAS: [&str; 4] = ["curated", "external", "features", "analytics"];

/// Tables reported by the status endpoint.
pub const KB_TABLES: [&str; 9] = [
    "curated.incidents",
    "curated.cells",
    "curated.cell_neighborhoods",
    "curated.neighborhood_cells",
    "external.holidays",
    "external.weather",
    "features.cell_hourly",
    "analytics.quality_reports",
    "analytics.pipeline_logs",
];

const STATEMENTS: &[&str] = &[
    "CREATE SCHEMA IF NOT EXISTS curated",
    "CREATE SCHEMA IF NOT EXISTS external",
    "CREATE SCHEMA IF NOT EXISTS features",
    "CREATE SCHEMA IF NOT EXISTS analytics",
    r#"
    CREATE TABLE IF NOT EXISTS public.schema_migrations (
        version    TEXT        PRIMARY KEY,
        applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    // Curated incidents; cell_id stays NULL until the assignment phase
    r#"
    CREATE TABLE IF NOT EXISTS curated.incidents (
        id              TEXT             PRIMARY KEY,
        occurred_at     TIMESTAMPTZ      NOT NULL,
        category        TEXT             NOT NULL CHECK (category IN ('Hediondo', 'Comum')),
        severity        INTEGER          NOT NULL,
        latitude        DOUBLE PRECISION NOT NULL,
        longitude       DOUBLE PRECISION NOT NULL,
        neighborhood    TEXT,
        confidence      DOUBLE PRECISION NOT NULL CHECK (confidence >= 0.1 AND confidence <= 1.0),
        source          TEXT             NOT NULL,
        cell_id         TEXT,
        cell_resolution INTEGER,
        created_at      TIMESTAMPTZ      NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_incidents_cell_time
        ON curated.incidents (cell_resolution, occurred_at)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_incidents_unassigned
        ON curated.incidents (id) WHERE cell_id IS NULL
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS curated.cells (
        cell_id         TEXT             PRIMARY KEY,
        cell_resolution INTEGER          NOT NULL,
        city            TEXT             NOT NULL,
        sequence        INTEGER          NOT NULL,
        min_lat         DOUBLE PRECISION NOT NULL,
        min_lon         DOUBLE PRECISION NOT NULL,
        max_lat         DOUBLE PRECISION NOT NULL,
        max_lon         DOUBLE PRECISION NOT NULL,
        center_lat      DOUBLE PRECISION NOT NULL,
        center_lon      DOUBLE PRECISION NOT NULL,
        created_at      TIMESTAMPTZ      NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_cells_resolution
        ON curated.cells (cell_resolution, sequence)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS curated.cell_neighborhoods (
        cell_id           TEXT             PRIMARY KEY REFERENCES curated.cells (cell_id),
        neighborhood_id   BIGINT           NOT NULL,
        neighborhood_name TEXT             NOT NULL,
        distance_deg      DOUBLE PRECISION NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS curated.neighborhood_cells (
        neighborhood_id BIGINT  NOT NULL,
        cell_resolution INTEGER NOT NULL,
        cell_id         TEXT    NOT NULL REFERENCES curated.cells (cell_id),
        PRIMARY KEY (neighborhood_id, cell_resolution)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS external.holidays (
        date DATE NOT NULL,
        name TEXT NOT NULL,
        kind TEXT NOT NULL,
        city TEXT NOT NULL DEFAULT 'Campinas',
        PRIMARY KEY (date, city)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS external.weather (
        ts       TIMESTAMPTZ      NOT NULL,
        city     TEXT             NOT NULL DEFAULT 'Campinas',
        rain_mm  DOUBLE PRECISION,
        temp_c   DOUBLE PRECISION,
        humidity DOUBLE PRECISION,
        PRIMARY KEY (ts, city)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS features.cell_hourly (
        cell_id            TEXT        NOT NULL,
        ts                 TIMESTAMPTZ NOT NULL,
        y_count            INTEGER     NOT NULL DEFAULT 0,
        lag_1h             INTEGER     NOT NULL DEFAULT 0,
        lag_24h            INTEGER     NOT NULL DEFAULT 0,
        lag_7d             INTEGER     NOT NULL DEFAULT 0,
        roll_3h_sum        INTEGER     NOT NULL DEFAULT 0,
        roll_24h_sum       INTEGER     NOT NULL DEFAULT 0,
        roll_7d_sum        INTEGER     NOT NULL DEFAULT 0,
        dow                SMALLINT    NOT NULL,
        hour               SMALLINT    NOT NULL,
        is_weekend         BOOLEAN     NOT NULL,
        is_business_hours  BOOLEAN     NOT NULL,
        holiday            BOOLEAN     NOT NULL DEFAULT FALSE,
        day_before_holiday BOOLEAN     NOT NULL DEFAULT FALSE,
        day_after_holiday  BOOLEAN     NOT NULL DEFAULT FALSE,
        weather_rain_mm    DOUBLE PRECISION,
        weather_temp_c     DOUBLE PRECISION,
        PRIMARY KEY (cell_id, ts)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS analytics.quality_reports (
        report_date DATE        PRIMARY KEY,
        metrics     JSONB       NOT NULL,
        created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS analytics.pipeline_logs (
        execution_id      UUID        PRIMARY KEY,
        phase             TEXT        NOT NULL,
        status            TEXT        NOT NULL CHECK (status IN ('running', 'success', 'failed')),
        started_at        TIMESTAMPTZ NOT NULL,
        finished_at       TIMESTAMPTZ,
        records_processed BIGINT      NOT NULL DEFAULT 0,
        error_message     TEXT
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_pipeline_logs_started
        ON analytics.pipeline_logs (started_at DESC)
    "#,
    // 2025 national holidays plus the Campinas municipal one
    r#"
    INSERT INTO external.holidays (date, name, kind) VALUES
        ('2025-01-01', 'Ano Novo', 'nacional'),
        ('2025-04-21', 'Tiradentes', 'nacional'),
        ('2025-05-01', 'Dia do Trabalho', 'nacional'),
        ('2025-07-11', 'Fundação de Campinas', 'municipal'),
        ('2025-09-07', 'Independência', 'nacional'),
        ('2025-10-12', 'Nossa Senhora Aparecida', 'nacional'),
        ('2025-11-02', 'Finados', 'nacional'),
        ('2025-11-15', 'Proclamação da República', 'nacional'),
        ('2025-12-25', 'Natal', 'nacional')
    ON CONFLICT (date, city) DO NOTHING
    "#,
];

/// Create the knowledge base schema unless it is already recorded.
///
/// Errors are propagated untouched; the transaction rolls back on drop.
pub async fn migrate(pool: &PgPool) -> Result<MigrationOutcome, sqlx::Error> {
    // ---
    if is_applied(pool).await? {
        tracing::info!("Schema {} already applied", SCHEMA_VERSION);
        return Ok(MigrationOutcome::AlreadyApplied);
    }

    tracing::info!("Applying schema {}", SCHEMA_VERSION);
    let mut tx = pool.begin().await?;

    for statement in STATEMENTS {
        sqlx::query(statement).execute(&mut *tx).await?;
    }

    sqlx::query(
        r#"
        INSERT INTO public.schema_migrations (version) VALUES ($1)
        ON CONFLICT (version) DO NOTHING
        "#,
    )
    .bind(SCHEMA_VERSION)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(MigrationOutcome::Applied)
}

async fn is_applied(pool: &PgPool) -> Result<bool, sqlx::Error> {
    // ---
    let (marker_table,): (bool,) = sqlx::query_as(
        r#"
        SELECT EXISTS (
            SELECT 1 FROM pg_tables
            WHERE schemaname = 'public' AND tablename = 'schema_migrations'
        )
        "#,
    )
    .fetch_one(pool)
    .await?;

    if !marker_table {
        return Ok(false);
    }

    let (applied,): (bool,) = sqlx::query_as(
        "SELECT EXISTS (SELECT 1 FROM public.schema_migrations WHERE version = $1)",
    )
    .bind(SCHEMA_VERSION)
    .fetch_one(pool)
    .await?;

    Ok(applied)
}

/// Number of knowledge base schemas present.
pub async fn count_schemas(pool: &PgPool) -> Result<i64, sqlx::Error> {
    // ---
    let (count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM pg_namespace WHERE nspname = ANY($1)")
            .bind(&KB_SCHEMAS[..])
            .fetch_one(pool)
            .await?;
    Ok(count)
}
