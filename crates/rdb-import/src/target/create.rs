//! Table creation with rate-limit backoff.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, info, warn};

use crate::error::{Result, TargetError};
use crate::target::{TableDescription, TargetStore, TargetTable};

/// Substring of the innermost issue message that marks a retryable
/// schema operation.
pub const RATE_LIMIT_MARKER: &str = "Request exceeded a limit ";

/// Blocking sleep used between schema operation retries.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

/// Sleeps the current worker thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Random backoff between 1 and 5 seconds.
pub fn jittered_delay() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(1_000..=5_000))
}

/// Whether a failed schema operation hit the rate limit.
pub fn is_rate_limited(err: &TargetError) -> bool {
    err.innermost_message()
        .is_some_and(|msg| msg.contains(RATE_LIMIT_MARKER))
}

/// Run a schema operation, retrying for as long as it fails with the rate
/// limit signal. Any other failure is returned at once.
pub fn run_schema_op<F>(sleeper: &dyn Sleeper, what: &str, mut op: F) -> std::result::Result<(), TargetError>
where
    F: FnMut() -> std::result::Result<(), TargetError>,
{
    loop {
        match op() {
            Ok(()) => return Ok(()),
            Err(err) if is_rate_limited(&err) => {
                let delay = jittered_delay();
                debug!("{}: rate limited, retrying in {:?}", what, delay);
                sleeper.sleep(delay);
            }
            Err(err) => return Err(err),
        }
    }
}

/// Ensures one target table exists.
pub struct CreateTableTask {
    store: Arc<dyn TargetStore>,
    sleeper: Arc<dyn Sleeper>,
    replace_existing: bool,
}

impl CreateTableTask {
    pub fn new(store: Arc<dyn TargetStore>, sleeper: Arc<dyn Sleeper>, replace_existing: bool) -> Self {
        Self {
            store,
            sleeper,
            replace_existing,
        }
    }

    /// Create the table, dropping an existing one first when replacement is
    /// requested. Returns the physical layout of a kept existing table.
    pub fn run(&self, table: &TargetTable) -> Result<Option<TableDescription>> {
        if let Some(existing) = self.store.describe_table(&table.path)? {
            if !self.replace_existing {
                info!("{}: table {} already exists, keeping it", table.owner, table.path);
                return Ok(Some(existing));
            }
            warn!("{}: dropping existing table {}", table.owner, table.path);
            let what = format!("drop {}", table.path);
            run_schema_op(self.sleeper.as_ref(), &what, || {
                self.store.drop_table(&table.path)
            })?;
        }

        let what = format!("create {}", table.path);
        run_schema_op(self.sleeper.as_ref(), &what, || {
            self.store.execute_schema(&table.ddl)
        })?;
        info!("{}: created table {}", table.owner, table.path);
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schema::TableIdentity;
    use crate::error::{ImportError, Issue, StatusCode};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSleeper {
        sleeps: Mutex<Vec<Duration>>,
    }

    impl Sleeper for RecordingSleeper {
        fn sleep(&self, duration: Duration) {
            self.sleeps.lock().unwrap().push(duration);
        }
    }

    fn rate_limited() -> TargetError {
        TargetError::new(
            StatusCode::Overloaded,
            vec![Issue::new("Schema operation failed")
                .with_child(Issue::new("Request exceeded a limit on the number of schema operations"))],
        )
    }

    #[test]
    fn test_retries_rate_limit_until_success() {
        let sleeper = RecordingSleeper::default();
        let calls = AtomicUsize::new(0);
        let result = run_schema_op(&sleeper, "create t", || {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(rate_limited())
            } else {
                Ok(())
            }
        });
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let sleeps = sleeper.sleeps.lock().unwrap();
        assert!(sleeps.len() >= 2);
        assert!(sleeps
            .iter()
            .all(|d| *d >= Duration::from_secs(1) && *d <= Duration::from_secs(5)));
    }

    #[test]
    fn test_other_errors_are_not_retried() {
        let sleeper = RecordingSleeper::default();
        let calls = AtomicUsize::new(0);
        let result = run_schema_op(&sleeper, "create t", || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(TargetError::message(StatusCode::SchemeError, "Column type mismatch"))
        });
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(sleeper.sleeps.lock().unwrap().is_empty());
    }

    #[test]
    fn test_marker_only_counts_in_innermost_issue() {
        let outer_only = TargetError::new(
            StatusCode::Overloaded,
            vec![Issue::new("Request exceeded a limit ").with_child(Issue::new("lock conflict"))],
        );
        assert!(!is_rate_limited(&outer_only));
        assert!(is_rate_limited(&rate_limited()));
    }

    fn table() -> TargetTable {
        TargetTable::new(
            TableIdentity::new("s", "t"),
            "db/s/t".into(),
            "CREATE TABLE `db/s/t` (\n  `a` Int32 NOT NULL,\n  PRIMARY KEY (`a`)\n);\n".into(),
            vec![crate::core::value::Field::new(
                "a",
                crate::core::value::TargetType::Int32,
                false,
            )],
        )
    }

    #[test]
    fn test_creates_missing_table() {
        let store = Arc::new(crate::target::MemoryTarget::new());
        let task = CreateTableTask::new(store.clone(), Arc::new(RecordingSleeper::default()), false);
        assert!(task.run(&table()).unwrap().is_none());
        assert!(store.table("db/s/t").is_some());
    }

    #[test]
    fn test_keeps_existing_table() {
        let store = Arc::new(crate::target::MemoryTarget::new());
        store.execute_schema(&table().ddl).unwrap();
        let task = CreateTableTask::new(store.clone(), Arc::new(RecordingSleeper::default()), false);
        let existing = task.run(&table()).unwrap().unwrap();
        assert_eq!(existing.primary_key, vec!["a".to_string()]);
        assert_eq!(store.drop_count(), 0);
    }

    #[test]
    fn test_replaces_existing_table() {
        let store = Arc::new(crate::target::MemoryTarget::new());
        store.execute_schema(&table().ddl).unwrap();
        let task = CreateTableTask::new(store.clone(), Arc::new(RecordingSleeper::default()), true);
        assert!(task.run(&table()).unwrap().is_none());
        assert_eq!(store.drop_count(), 1);
        assert!(store.table("db/s/t").is_some());
    }

    #[test]
    fn test_create_failure_is_reported() {
        let store = Arc::new(crate::target::MemoryTarget::new());
        store.fail_next_schema_ops(vec![TargetError::message(StatusCode::SchemeError, "bad type")]);
        let task = CreateTableTask::new(store.clone(), Arc::new(RecordingSleeper::default()), false);
        assert!(matches!(task.run(&table()), Err(ImportError::Target(_))));
        assert!(store.table("db/s/t").is_none());
    }
}
