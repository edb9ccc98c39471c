//! Runs a workflow for a user: optional credit charge, the engine call, and
//! an execution record written off the response path.

use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::PgPool;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::billing::ledger::{self, DeductRequest};
use crate::errors::AppError;
use crate::models::workflow::{ExecutionStatus, WorkflowRow};
use crate::state::AppState;

#[derive(Debug, Clone)]
pub struct InvokeRequest {
    pub workflow_id: Uuid,
    pub user_id: Uuid,
    pub resume_id: Option<Uuid>,
    pub inputs: Value,
}

/// Engine call result as seen by callers. A refused charge is an outcome,
/// an engine failure is [`AppError::Upstream`].
#[derive(Debug, Clone, PartialEq)]
pub enum Invocation {
    Completed(Value),
    Rejected(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl From<Invocation> for RunOutcome {
    fn from(invocation: Invocation) -> Self {
        match invocation {
            Invocation::Completed(data) => RunOutcome {
                success: true,
                data: Some(data),
                message: None,
            },
            Invocation::Rejected(message) => RunOutcome {
                success: false,
                data: None,
                message: Some(message),
            },
        }
    }
}

pub async fn get_workflow(pool: &PgPool, id: Uuid) -> Result<WorkflowRow, AppError> {
    sqlx::query_as::<_, WorkflowRow>("SELECT * FROM workflows WHERE id = $1 AND active")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Workflow {id} not found")))
}

pub async fn invoke(state: &AppState, request: &InvokeRequest) -> Result<Invocation, AppError> {
    let workflow = get_workflow(&state.db, request.workflow_id).await?;

    if let Some(action_key) = &workflow.action_key {
        let charge = ledger::deduct(
            &state.db,
            state.clock.now(),
            &DeductRequest {
                user_id: request.user_id,
                action_key: action_key.clone(),
                resource_type: Some("workflow".to_string()),
                resource_id: Some(workflow.id.to_string()),
            },
        )
        .await?;
        if !charge.success {
            return Ok(Invocation::Rejected(
                charge.message.unwrap_or_else(|| "insufficient credits".to_string()),
            ));
        }
    }

    let started_at = state.clock.now();
    let timer = Instant::now();
    let result = state
        .workflow
        .run(&workflow.api_key, &request.inputs, request.user_id)
        .await;
    let execution_time_ms = timer.elapsed().as_millis() as i64;

    let (outputs, error_message) = match &result {
        Ok(data) => (Some(data.clone()), String::new()),
        Err(e) => (None, e.to_string()),
    };
    let record = ExecutionRecord {
        workflow_id: workflow.id,
        user_id: request.user_id,
        resume_id: request.resume_id,
        inputs: request.inputs.clone(),
        outputs,
        error_message,
        execution_time_ms,
        created_at: started_at,
    };
    let pool = state.db.clone();
    tokio::spawn(async move {
        if let Err(e) = record_execution(&pool, record).await {
            error!("Failed to record workflow execution: {e}");
        }
    });

    match result {
        Ok(data) => {
            info!(
                "Workflow {} ran for user {} in {}ms",
                workflow.id, request.user_id, execution_time_ms
            );
            Ok(Invocation::Completed(data))
        }
        Err(e) => {
            warn!("Workflow {} failed for user {}: {e}", workflow.id, request.user_id);
            Err(AppError::Upstream(e.to_string()))
        }
    }
}

struct ExecutionRecord {
    workflow_id: Uuid,
    user_id: Uuid,
    resume_id: Option<Uuid>,
    inputs: Value,
    outputs: Option<Value>,
    error_message: String,
    execution_time_ms: i64,
    created_at: DateTime<Utc>,
}

impl ExecutionRecord {
    fn status(&self) -> ExecutionStatus {
        if self.outputs.is_some() {
            ExecutionStatus::Success
        } else {
            ExecutionStatus::Failed
        }
    }
}

async fn record_execution(pool: &PgPool, record: ExecutionRecord) -> Result<(), sqlx::Error> {
    let status = record.status();

    sqlx::query(
        r#"
        INSERT INTO workflow_executions
            (workflow_id, user_id, resume_id, inputs, outputs, status, error_message, execution_time_ms, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(record.workflow_id)
    .bind(record.user_id)
    .bind(record.resume_id)
    .bind(&record.inputs)
    .bind(&record.outputs)
    .bind(status)
    .bind(&record.error_message)
    .bind(record.execution_time_ms)
    .bind(record.created_at)
    .execute(pool)
    .await?;

    if status == ExecutionStatus::Success {
        sqlx::query("UPDATE workflows SET used = used + 1 WHERE id = $1")
            .bind(record.workflow_id)
            .execute(pool)
            .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_rejection_becomes_unsuccessful_outcome() {
        let outcome = RunOutcome::from(Invocation::Rejected("need 5, have 3".to_string()));
        assert!(!outcome.success);
        assert!(outcome.data.is_none());
        assert_eq!(outcome.message.as_deref(), Some("need 5, have 3"));
    }

    #[test]
    fn test_completion_carries_data() {
        let outcome = RunOutcome::from(Invocation::Completed(json!({"summary": "ok"})));
        assert!(outcome.success);
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["data"]["summary"], "ok");
        assert!(value.get("message").is_none());
    }

    #[test]
    fn test_execution_status_follows_outputs() {
        let mut record = ExecutionRecord {
            workflow_id: Uuid::nil(),
            user_id: Uuid::nil(),
            resume_id: None,
            inputs: json!({}),
            outputs: Some(json!({})),
            error_message: String::new(),
            execution_time_ms: 12,
            created_at: Utc::now(),
        };
        assert_eq!(record.status(), ExecutionStatus::Success);
        record.outputs = None;
        assert_eq!(record.status(), ExecutionStatus::Failed);
    }
}
