use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// `GET /api/v1/games`: ids of the games currently hosted.
pub async fn list_games(state: web::Data<AppState>) -> HttpResponse {
    let relay = state.relay();
    HttpResponse::Ok().json(json!({
        "default_game": relay.hub().default_game_id(),
        "games": relay.hub().game_ids()
    }))
}

/// `GET /api/v1/games/{id}`: read-only snapshot of one game.
pub async fn get_game(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let snapshot = state.relay().hub().snapshot(&path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(snapshot))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests::test_state;
    use actix_web::{http::StatusCode, test, App};

    #[actix_web::test]
    async fn test_snapshot_of_default_and_unknown_game() {
        let state = web::Data::new(test_state());
        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .route("/games", web::get().to(list_games))
                .route("/games/{id}", web::get().to(get_game)),
        )
        .await;

        let req = test::TestRequest::get().uri("/games").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["default_game"], "main");

        let req = test::TestRequest::get().uri("/games/main").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["id"], "main");
        assert_eq!(body["round"], 0);

        let req = test::TestRequest::get().uri("/games/nope").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
