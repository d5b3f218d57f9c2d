//! socialgraph-postprocessor: change-stream consumer
//!
//! Reads change-feed records as JSON lines on stdin and feeds them to the
//! postprocessor worker pool until EOF.
//!
//! ## Architecture
//! ```text
//! [change feed] --(JSON lines)--> stdin --> [PostprocessorPool] --> store
//! ```
//!
//! ## Configuration
//! - First argument: path to a YAML config file (optional)
//! - SOCIALGRAPH_CONFIG: path to a YAML config file (optional)
//! - SOCIALGRAPH_LOG: tracing filter (default: info)

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use socialgraph::config::Config;
use socialgraph::postprocess::PostprocessorPool;
use socialgraph::registry::{Clients, Managers};
use socialgraph::storage::change::ChangeRecord;
use socialgraph::storage::init_store;
use socialgraph::utils::bootstrap::init_tracing;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config_path = std::env::args().nth(1);
    let config = Config::load(config_path.as_deref())?;

    let tables = init_store(&config.store).await?;
    let managers = Managers::new(Clients::new(tables, config.limits.clone()));
    let pool = PostprocessorPool::start(Arc::new(managers.postprocessor()), &config.postprocessor);

    info!("socialgraph-postprocessor started");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut line_number = 0usize;
    while let Some(line) = lines.next_line().await? {
        line_number += 1;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ChangeRecord>(&line) {
            Ok(record) => pool.submit(record).await?,
            Err(e) => warn!(line = line_number, error = %e, "Skipping unparseable change record"),
        }
    }

    let stats = pool.shutdown().await;
    info!(
        processed = stats.processed,
        ignored = stats.ignored,
        failed = stats.failed,
        "socialgraph-postprocessor finished"
    );
    Ok(())
}
