use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// `GET /api/v1/config`
pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config
    })))
}

/// `PUT /api/v1/config`: partial update of the runtime-adjustable fields.
pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> Result<HttpResponse, AppError> {
    let json_str = serde_json::to_string(&body.into_inner())?;
    let updated = state
        .update_config(&json_str)
        .map_err(|e| AppError::Validation(e.to_string()))?;

    tracing::info!(
        "Configuration updated: threshold {}, {:?} bridge mode",
        updated.game.elimination_threshold,
        updated.bridge.mode
    );

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": updated
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests::test_state;
    use actix_web::{http::StatusCode, test, App};

    #[actix_web::test]
    async fn test_update_config_validates() {
        let state = web::Data::new(test_state());
        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .route("/config", web::get().to(get_config))
                .route("/config", web::put().to(update_config)),
        )
        .await;

        let req = test::TestRequest::put()
            .uri("/config")
            .set_json(json!({"game": {"min_players": 50}}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let req = test::TestRequest::put()
            .uri("/config")
            .set_json(json!({"bridge": {"mode": "batch"}, "batch": {"chunks_per_batch": 4}}))
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["updated_config"]["bridge"]["mode"], "batch");

        let req = test::TestRequest::get().uri("/config").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["config"]["batch"]["chunks_per_batch"], 4);
        assert_eq!(body["config"]["game"]["min_players"], 2);
    }
}
