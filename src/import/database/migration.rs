//! Schema migrations, applied before the server or the CLI touches the database.

use rocket_db_pools::sqlx::{self, PgPool, migrate::Migrator};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Apply pending migrations. Already applied ones are skipped; checksum drift
/// is reported as an error.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    log::info!("checking database migration state");

    MIGRATOR.run(pool).await?;

    log::info!("database migrations up to date");
    Ok(())
}
