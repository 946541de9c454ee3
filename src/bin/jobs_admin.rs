//! One-shot queue administration.
//!
//! `jobs-admin monitor` reports job counts by status plus running jobs with
//! expired leases. `jobs-admin recover` requeues expired-lease jobs now.
//! Normal operation is self-healing; these exist for operators.

use hl_ingest::config::Config;
use hl_ingest::db::pool;
use hl_ingest::jobs::store::JobStore;
use hl_ingest::logging;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let config = Config::load()?;
    logging::structured::init_logging(&config.logging);

    let org_id = config.org_uuid()?;
    let db_pool = pool::create_pool(&config.database.url).await?;
    let store = JobStore::new(db_pool);

    let command = std::env::args().nth(1).unwrap_or_else(|| "monitor".into());
    match command.as_str() {
        "monitor" => {
            let counts = store.counts_by_status(org_id).await?;
            let expired = store.expired_running(org_id).await?;
            println!("jobs by status:");
            if counts.is_empty() {
                println!("  (none)");
            }
            for (status, count) in counts {
                println!("  {status:<10} {count}");
            }
            println!("running with expired lease: {expired}");
        }
        "recover" => {
            let recovered = store.recover_stuck(org_id).await?;
            println!("recovered {recovered} jobs");
        }
        other => {
            eprintln!("unknown command {other:?}; usage: jobs-admin [monitor|recover]");
            std::process::exit(2);
        }
    }

    Ok(())
}
