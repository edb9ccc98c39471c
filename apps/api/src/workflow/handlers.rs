//! Axum route handlers for the Workflow API.

use axum::extract::State;
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use crate::extract::{Json, Path};
use crate::identity::Caller;
use crate::response::{ok, ApiResult};
use crate::state::AppState;
use crate::workflow::invoker::{self, InvokeRequest, RunOutcome};

#[derive(Debug, Deserialize)]
pub struct RunBody {
    #[serde(default)]
    pub inputs: Value,
    pub resume_id: Option<Uuid>,
}

/// POST /workflows/:id/run
pub async fn handle_run(
    State(state): State<AppState>,
    caller: Caller,
    Path(workflow_id): Path<Uuid>,
    Json(body): Json<RunBody>,
) -> ApiResult<RunOutcome> {
    let inputs = match body.inputs {
        Value::Null => Value::Object(Default::default()),
        other => other,
    };
    let request = InvokeRequest {
        workflow_id,
        user_id: caller.user_id,
        resume_id: body.resume_id,
        inputs,
    };
    ok(invoker::invoke(&state, &request).await?.into())
}
