//! The worker binary: `capsul-worker <execution-id>` (spec.md §6).
//!
//! Grounded on the original `engine/local.py`'s
//! `if __name__ == '__main__'` block — a single positional argument
//! naming the execution, reading `CAPSUL_DATABASE`/`CAPSUL_TMP` from the
//! environment, claiming and running jobs until none remain.

mod compiler;
mod conf;
mod engine;
mod storage;

use engine::{LocalExecutor, ENV_DATABASE};
use storage::ExecutionDatabase;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let mut args = std::env::args();
    let _argv0 = args.next();
    let execution_id = match args.next() {
        Some(id) => id,
        None => {
            eprintln!("capsul-worker must be called with a single execution id argument");
            std::process::exit(1);
        }
    };

    let db_path = std::env::var(ENV_DATABASE).unwrap_or_else(|_| "/tmp/capsul.db".to_string());

    let database = match ExecutionDatabase::new(&db_path).await {
        Ok(db) => db,
        Err(e) => {
            eprintln!("capsul-worker: could not open database {db_path}: {e}");
            std::process::exit(1);
        }
    };

    let executor = LocalExecutor { database: &database };
    if let Err(e) = executor.run_to_completion(&execution_id).await {
        eprintln!("capsul-worker: execution {execution_id} failed: {e}");
        std::process::exit(1);
    }
}
