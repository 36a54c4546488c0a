use serde_json::Value;
use thiserror::Error;

use crate::state::SyncState;

/// Destination tables and their declared primary keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Units,
    UnitQuestions,
    UnitAttempts,
    UnitQuestionAttempts,
}

impl Table {
    pub const ALL: [Table; 4] = [
        Table::Units,
        Table::UnitQuestions,
        Table::UnitAttempts,
        Table::UnitQuestionAttempts,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Units => "units",
            Table::UnitQuestions => "unit_questions",
            Table::UnitAttempts => "unit_attempts",
            Table::UnitQuestionAttempts => "unit_question_attempts",
        }
    }

    pub fn primary_key(&self) -> &'static [&'static str] {
        match self {
            Table::Units => &["unit_id"],
            // A question that changes after attempts exist must keep its
            // older version alongside the new one.
            Table::UnitQuestions => &["question_id", "updated_at"],
            Table::UnitAttempts => &["user_id", "unit_id", "attempt_num"],
            Table::UnitQuestionAttempts => &["user_response_id"],
        }
    }
}

/// One step of the emitted operation stream: either a batch of rows for a
/// table, or the checkpoint that seals a run.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOp {
    Upsert { table: Table, rows: Vec<Value> },
    Checkpoint { state: SyncState },
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("XDG data directory is unavailable")]
    MissingDataDir,
    #[error("invalid payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("row for {table} is missing key column {column}")]
    MissingKey {
        table: &'static str,
        column: &'static str,
    },
}

#[allow(async_fn_in_trait)]
pub trait SyncSink {
    async fn apply(&mut self, op: SyncOp) -> Result<(), SinkError>;
}

/// Records the operation stream without applying it. Backs dry runs and the
/// engine tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    ops: Vec<SyncOp>,
}

impl MemorySink {
    pub fn ops(&self) -> &[SyncOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<SyncOp> {
        self.ops
    }
}

impl SyncSink for MemorySink {
    async fn apply(&mut self, op: SyncOp) -> Result<(), SinkError> {
        self.ops.push(op);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn table_names_match_declared_keys() {
        assert_eq!(Table::Units.as_str(), "units");
        assert_eq!(Table::Units.primary_key(), ["unit_id"]);
        assert_eq!(
            Table::UnitQuestions.primary_key(),
            ["question_id", "updated_at"]
        );
        assert_eq!(
            Table::UnitAttempts.primary_key(),
            ["user_id", "unit_id", "attempt_num"]
        );
        assert_eq!(
            Table::UnitQuestionAttempts.primary_key(),
            ["user_response_id"]
        );
    }

    #[tokio::test]
    async fn memory_sink_records_ops_in_order() {
        let mut sink = MemorySink::default();
        sink.apply(SyncOp::Upsert {
            table: Table::Units,
            rows: vec![json!({ "unit_id": "u-1" })],
        })
        .await
        .unwrap();
        sink.apply(SyncOp::Checkpoint {
            state: crate::state::SyncState::default(),
        })
        .await
        .unwrap();

        assert_eq!(sink.ops().len(), 2);
        assert!(matches!(sink.ops()[0], SyncOp::Upsert { table: Table::Units, .. }));
        assert!(matches!(sink.ops()[1], SyncOp::Checkpoint { .. }));
    }
}
