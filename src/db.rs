use rocket_db_pools::{Database, sqlx};

#[derive(Database)]
#[database("import_db")]
pub struct ImportDb(sqlx::PgPool);
