use serde_json::Value;
use socratease_core::{Attempt, SocrateaseClient, SocrateaseError, Unit};
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::{info, warn};

use crate::sink::{SinkError, SyncOp, SyncSink, Table};
use crate::state::SyncState;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("api error: {0}")]
    Api(#[from] SocrateaseError),
    #[error("sink error: {0}")]
    Sink(#[from] SinkError),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("time parse error: {0}")]
    Time(#[from] time::error::Parse),
    #[error("time format error: {0}")]
    TimeFormat(#[from] time::error::Format),
}

/// Sequential sync over the unit hierarchy: units, then per unit its
/// questions, attempts, and per-attempt question responses. Emits typed
/// operations into the sink as it goes and checkpoints once at the end.
pub struct SyncEngine<S> {
    client: SocrateaseClient,
    sink: S,
    page_size: u32,
}

impl<S: SyncSink> SyncEngine<S> {
    pub fn new(client: SocrateaseClient, sink: S, page_size: u32) -> Self {
        Self {
            client,
            sink,
            page_size,
        }
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    pub async fn run(&mut self, prior: SyncState) -> Result<SyncState, EngineError> {
        let mut state = prior;

        // One full enumeration serves both the incremental units batch and
        // the per-unit child syncs.
        let units = self.client.list_units(self.page_size, None).await?;
        self.sync_units(&units, &mut state).await?;

        for unit in &units {
            self.sync_unit_questions(unit).await?;
            let (attempts, attempts_watermark) = self.sync_unit_attempts(unit, &state).await?;
            for attempt in &attempts {
                self.sync_question_attempts(unit, attempt).await?;
            }
            // The per-unit watermark moves only once every attempt's
            // responses have been emitted.
            state.advance_attempts(&unit.unit_id, attempts_watermark);
        }

        self.sink
            .apply(SyncOp::Checkpoint {
                state: state.clone(),
            })
            .await?;
        Ok(state)
    }

    async fn sync_units(
        &mut self,
        units: &[Unit],
        state: &mut SyncState,
    ) -> Result<(), EngineError> {
        let watermark = state.units_watermark();
        let mut new_watermark = watermark;
        let mut batch = Vec::new();
        for unit in units {
            match parse_ts(unit.created_at.as_deref())? {
                Some(created) if created >= watermark => {
                    if created > new_watermark {
                        new_watermark = created;
                    }
                    batch.push(serde_json::to_value(unit)?);
                }
                Some(_) => {}
                // A unit with no creation timestamp can never advance the
                // watermark, so it rides along in every batch.
                None => batch.push(serde_json::to_value(unit)?),
            }
        }
        info!(total = units.len(), fresh = batch.len(), "fetched units");

        if !batch.is_empty() {
            self.sink
                .apply(SyncOp::Upsert {
                    table: Table::Units,
                    rows: batch,
                })
                .await?;
        }
        state.advance_units(new_watermark);
        Ok(())
    }

    async fn sync_unit_questions(&mut self, unit: &Unit) -> Result<(), EngineError> {
        let questions = self.client.get_unit_questions(&unit.unit_id).await?;
        info!(unit_id = %unit.unit_id, count = questions.len(), "fetched questions");
        if questions.is_empty() {
            return Ok(());
        }

        let rows = questions
            .into_iter()
            .map(|mut question| {
                question.insert("unit_id".to_string(), Value::String(unit.unit_id.clone()));
                Value::Object(question)
            })
            .collect();
        self.sink
            .apply(SyncOp::Upsert {
                table: Table::UnitQuestions,
                rows,
            })
            .await?;
        Ok(())
    }

    async fn sync_unit_attempts(
        &mut self,
        unit: &Unit,
        state: &SyncState,
    ) -> Result<(Vec<Attempt>, OffsetDateTime), EngineError> {
        let since = state.attempts_watermark(&unit.unit_id);
        let since_param = format_ts(since)?;
        let mut attempts = self
            .client
            .list_unit_attempts(&unit.unit_id, self.page_size, Some(&since_param))
            .await?;
        info!(unit_id = %unit.unit_id, count = attempts.len(), "fetched attempts");

        let mut new_watermark = since;
        for attempt in &mut attempts {
            attempt.unit_id = Some(unit.unit_id.clone());
            let ts = attempt
                .finished_at
                .as_deref()
                .or(attempt.updated_at.as_deref());
            if let Some(ts) = parse_ts(ts)? {
                if ts > new_watermark {
                    new_watermark = ts;
                }
            }
        }

        if !attempts.is_empty() {
            let rows = attempts
                .iter()
                .map(serde_json::to_value)
                .collect::<Result<Vec<_>, _>>()?;
            self.sink
                .apply(SyncOp::Upsert {
                    table: Table::UnitAttempts,
                    rows,
                })
                .await?;
        }
        Ok((attempts, new_watermark))
    }

    async fn sync_question_attempts(
        &mut self,
        unit: &Unit,
        attempt: &Attempt,
    ) -> Result<(), EngineError> {
        let (Some(user_id), Some(attempt_num)) = (attempt.user_id.as_deref(), attempt.attempt_num)
        else {
            warn!(
                unit_id = %unit.unit_id,
                "skipping question attempts: attempt is missing user id or attempt number"
            );
            return Ok(());
        };

        let responses = self
            .client
            .get_question_attempts(user_id, &unit.unit_id, attempt_num)
            .await?;

        let mut rows = Vec::new();
        for (_question_id, mut responses) in responses {
            // Earlier entries are superseded edits; only the final response
            // counts.
            let Some(mut response) = responses.pop() else {
                continue;
            };
            response.insert("user_id".to_string(), Value::String(user_id.to_string()));
            response.insert("unit_id".to_string(), Value::String(unit.unit_id.clone()));
            response.insert("attempt_num".to_string(), Value::from(attempt_num));
            rows.push(Value::Object(response));
        }

        if rows.is_empty() {
            return Ok(());
        }
        self.sink
            .apply(SyncOp::Upsert {
                table: Table::UnitQuestionAttempts,
                rows,
            })
            .await?;
        Ok(())
    }
}

fn parse_ts(value: Option<&str>) -> Result<Option<OffsetDateTime>, time::error::Parse> {
    let Some(value) = value else {
        return Ok(None);
    };
    let parsed = OffsetDateTime::parse(value, &Rfc3339)?;
    Ok(Some(parsed))
}

fn format_ts(value: OffsetDateTime) -> Result<String, time::error::Format> {
    value.format(&Rfc3339)
}
