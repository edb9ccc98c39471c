pub mod health;

use axum::{
    routing::{get, post, put},
    Router,
};

use crate::asr::handlers as asr;
use crate::billing::handlers as billing;
use crate::export::handlers as export;
use crate::interview::handlers as interview;
use crate::invitations::handlers as invitations;
use crate::state::AppState;
use crate::workflow::handlers as workflow;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        // Billing: public catalog
        .route("/billing/action-prices", get(billing::handle_list_action_prices))
        .route("/billing/packages", get(billing::handle_list_public_packages))
        // Billing: caller
        .route("/user/billing/credits", get(billing::handle_get_credits))
        .route("/user/billing/packages", get(billing::handle_list_my_packages))
        .route("/user/billing/usage", get(billing::handle_list_my_usage))
        // Billing: admin
        .route(
            "/admin/billing/packages",
            get(billing::handle_admin_list_templates).post(billing::handle_create_template),
        )
        .route("/admin/billing/packages/:id", put(billing::handle_update_template))
        .route(
            "/admin/billing/action-prices",
            get(billing::handle_admin_list_action_prices).post(billing::handle_create_action_price),
        )
        .route(
            "/admin/billing/action-prices/:id",
            put(billing::handle_update_action_price),
        )
        .route(
            "/admin/billing/user-packages",
            get(billing::handle_admin_list_user_packages).post(billing::handle_assign_package),
        )
        .route(
            "/admin/billing/user-packages/:id/activate",
            post(billing::handle_activate_package),
        )
        .route("/admin/billing/sweep", post(billing::handle_sweep))
        // Billing: service-to-service
        .route("/internal/billing/credits/check", post(billing::handle_check_credits))
        .route("/internal/billing/credits/deduct", post(billing::handle_deduct_credits))
        // Invitations
        .route("/invitations/validate", post(invitations::handle_validate))
        .route("/invitations/use", post(invitations::handle_use))
        .route(
            "/admin/invitations",
            get(invitations::handle_list).post(invitations::handle_create),
        )
        .route("/admin/invitations/batch", put(invitations::handle_batch_update))
        .route(
            "/admin/invitations/:code",
            get(invitations::handle_detail).put(invitations::handle_update),
        )
        .route(
            "/admin/invitations/:code/activate",
            post(invitations::handle_activate),
        )
        .route(
            "/admin/invitations/:code/deactivate",
            post(invitations::handle_deactivate),
        )
        .route("/admin/invitations/:code/uses", get(invitations::handle_list_uses))
        // ASR tasks
        .route("/asr/tasks", get(asr::handle_list).post(asr::handle_submit))
        .route("/asr/tasks/:id", get(asr::handle_get).delete(asr::handle_delete))
        .route("/asr/tasks/:id/poll", post(asr::handle_poll))
        .route("/asr/tasks/:id/retry", post(asr::handle_retry))
        // Interview reviews
        .route(
            "/interview/reviews",
            get(interview::handle_list).post(interview::handle_create),
        )
        .route("/interview/reviews/:id", get(interview::handle_get))
        .route("/interview/reviews/:id/analyze", post(interview::handle_analyze))
        // PDF export
        .route("/resume/export", post(export::handle_create))
        .route("/resume/export/:task_id", get(export::handle_status))
        .route(
            "/resume/export/download/:task_id",
            get(export::handle_download),
        )
        .route("/export/:task_id", get(export::handle_render_data))
        // Workflows
        .route("/workflows/:id/run", post(workflow::handle_run))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::Value;
    use tower::ServiceExt;

    use crate::identity::{INTERNAL_TOKEN_HEADER, USER_ID_HEADER, USER_ROLE_HEADER};
    use crate::state::test_state;

    const USER: &str = "0190a2b4-7c1e-7d2a-9f00-000000000001";

    async fn send(request: Request<Body>) -> (StatusCode, Value) {
        let response = build_router(test_state()).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn json_request(method: &str, uri: &str, headers: &[(&str, &str)], body: Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json");
        for (k, v) in headers {
            builder = builder.header(*k, *v);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = send(Request::get("/health").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_caller_routes_require_identity() {
        let (status, body) = send(
            Request::get("/user/billing/credits")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], 40100);
        assert_eq!(body["data"], Value::Null);
    }

    #[tokio::test]
    async fn test_admin_routes_reject_plain_users() {
        let (status, body) = send(
            Request::get("/admin/billing/packages")
                .header(USER_ID_HEADER, USER)
                .header(USER_ROLE_HEADER, "user")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["code"], 40300);
    }

    #[tokio::test]
    async fn test_internal_routes_require_token() {
        let payload = serde_json::json!({"user_id": USER, "action_key": "ai_chat"});

        let (status, _) = send(json_request(
            "POST",
            "/internal/billing/credits/deduct",
            &[],
            payload.clone(),
        ))
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = send(json_request(
            "POST",
            "/internal/billing/credits/deduct",
            &[(INTERNAL_TOKEN_HEADER, "wrong-secret")],
            payload,
        ))
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_asr_submit_rejects_unknown_format() {
        let (status, body) = send(json_request(
            "POST",
            "/asr/tasks",
            &[(USER_ID_HEADER, USER)],
            serde_json::json!({"audio_url": "https://cdn.example.com/a.flac", "audio_format": "flac"}),
        ))
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], 40000);
    }

    #[tokio::test]
    async fn test_malformed_body_uses_error_envelope() {
        let (status, body) = send(json_request(
            "POST",
            "/asr/tasks",
            &[(USER_ID_HEADER, USER)],
            serde_json::json!({"audio_url": "x"}),
        ))
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], 40000);
        assert_eq!(body["data"], Value::Null);
        assert!(body["msg"].as_str().unwrap().contains("audio_format"));

        let request = Request::post("/invitations/use")
            .header("content-type", "application/json")
            .header(USER_ID_HEADER, USER)
            .body(Body::from("{not json"))
            .unwrap();
        let (status, body) = send(request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], 40000);
    }

    #[tokio::test]
    async fn test_malformed_path_and_query_use_error_envelope() {
        let (status, body) = send(
            Request::get("/asr/tasks/not-a-uuid")
                .header(USER_ID_HEADER, USER)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], 40000);

        let (status, body) = send(
            Request::get("/asr/tasks?page=abc")
                .header(USER_ID_HEADER, USER)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], 40000);
    }

    #[tokio::test]
    async fn test_invitation_batch_size_is_bounded() {
        let admin = [(USER_ID_HEADER, USER), (USER_ROLE_HEADER, "admin")];
        for count in [0, 101] {
            let (status, body) = send(json_request(
                "POST",
                "/admin/invitations",
                &admin,
                serde_json::json!({"count": count, "max_uses": 1}),
            ))
            .await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "count={count}");
            assert_eq!(body["code"], 40000);
        }
    }

    #[tokio::test]
    async fn test_batch_update_route_is_not_shadowed_by_code_route() {
        let (status, body) = send(json_request(
            "PUT",
            "/admin/invitations/batch",
            &[(USER_ID_HEADER, USER), (USER_ROLE_HEADER, "admin")],
            serde_json::json!({"codes": [], "max_uses": 3}),
        ))
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["msg"], "codes cannot be empty");
    }
}
