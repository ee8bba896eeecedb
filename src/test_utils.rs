use std::sync::{Mutex, MutexGuard, OnceLock};
use tempfile::TempDir;

use crate::config::PipelineConfig;
use crate::database::StaticSchema;
use crate::persistence::Stores;

/// Serializes tests that mutate process-wide state such as environment
/// variables.
pub fn env_lock() -> MutexGuard<'static, ()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Fresh stores under a temporary directory, without seeded memories.
/// Keep the returned directory alive for as long as the stores are used.
pub fn create_test_stores() -> (TempDir, Stores) {
    let dir = tempfile::tempdir().expect("temp dir");
    let pipeline = PipelineConfig {
        seed_default_memories: false,
        ..PipelineConfig::default()
    };
    let stores = Stores::open(dir.path(), &pipeline).expect("open test stores");
    (dir, stores)
}

/// Schema context for a single NYC-style payroll table.
pub fn payroll_schema() -> StaticSchema {
    StaticSchema::new(
        "### Table: payroll\n\
         ### Column Insights (Use these values for filtering):\n\
         - **agency_name** (VARCHAR): Values: [\"FIRE DEPARTMENT\", \"POLICE DEPARTMENT\"]\n\
         - **base_salary** (DOUBLE): Sample values: [\"85000.5\", \"91000.0\"]\n\
         - **fiscal_year** (INTEGER): Sample values: [\"2022\", \"2023\"]",
    )
    .with_tables(["payroll"])
}
