use std::error::Error;
use std::path::{Path, PathBuf};

use chrono::Utc;
use clap::Parser;
use sqlx::postgres::PgPoolOptions;

use import_server::import::{
    ActorId, ColumnMapping, ImportRequest, RunOutcome, run_migrations,
};

/// Run an import in the foreground, waiting out throttling pauses in place.
#[derive(Parser, Debug)]
#[command(name = "import_rows", about = "Import catalog rows from a JSON file")]
struct Args {
    /// JSON file holding an array of rows; the first row is the header.
    #[arg(long)]
    rows: PathBuf,

    /// Actor the run is checkpointed under.
    #[arg(long, default_value = "cli")]
    actor: String,

    /// Column holding the product name.
    #[arg(long)]
    name: String,

    /// Column holding the unique external id.
    #[arg(long)]
    external_id: String,

    #[arg(long)]
    price: Option<String>,

    #[arg(long)]
    description: Option<String>,

    /// Column holding attachment URLs separated by '|', ';' or ','.
    #[arg(long)]
    images: Option<String>,

    /// Column holding the category label.
    #[arg(long)]
    category: Option<String>,

    /// Category used for rows without a label.
    #[arg(long)]
    category_id: Option<i32>,

    /// Continue after the last completed row instead of restarting.
    #[arg(long)]
    resume: bool,
}

/// Read a JSON array of rows. A file without rows is an error.
fn load_rows(path: &Path) -> Result<Vec<Vec<String>>, Box<dyn Error>> {
    let raw = std::fs::read_to_string(path)?;
    let rows: Vec<Vec<String>> = serde_json::from_str(&raw)?;
    if rows.is_empty() {
        return Err(format!("{} holds no rows", path.display()).into());
    }
    Ok(rows)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    import_server::init_logger();

    let args = Args::parse();

    let rows = load_rows(&args.rows)?;

    let request = ImportRequest {
        rows,
        mapping: ColumnMapping {
            name: Some(args.name),
            price: args.price,
            description: args.description,
            external_id: Some(args.external_id),
            attachment_refs: args.images,
            category_label: args.category,
        },
        fallback_category_id: args.category_id,
    };

    let database_url = std::env::var("DATABASE_URL")?;
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await?;
    run_migrations(&pool).await?;

    let controller = import_server::build_controller(pool)?;
    let actor = ActorId::new(args.actor);

    let mut result = if args.resume {
        controller.resume(&actor, &request).await?
    } else {
        controller.start(&actor, &request).await?
    };

    while matches!(result.status, RunOutcome::Paused | RunOutcome::Waiting) {
        let wait = result
            .wait_until
            .map(|until| (until - Utc::now()).to_std().unwrap_or_default())
            .unwrap_or_default();
        log::info!(
            "run {:?} at row {}, waiting {}s",
            result.status,
            result.last_success_row,
            wait.as_secs()
        );
        tokio::time::sleep(wait).await;
        result = controller.resume(&actor, &request).await?;
    }

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
