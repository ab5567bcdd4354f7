//! One-shot clip analysis outside of any game.
//!
//! The clip is transcribed and classified exactly like a batch-mode
//! session's accumulated audio, then judged against the live elimination
//! threshold.

use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Deserialize)]
pub struct AnalyzeRequest {
    /// Base64 PCM16, in the same format as `audioData` frames
    pub audio: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeResponse {
    pub transcription: String,
    pub has_laughter: bool,
    /// 0 to 1
    pub confidence: f32,
    pub laughter_type: Option<String>,
    pub duration_secs: f64,
}

/// `POST /api/v1/analyze`
pub async fn analyze_audio(
    state: web::Data<AppState>,
    body: web::Json<AnalyzeRequest>,
) -> Result<HttpResponse, AppError> {
    let relay = state.relay();
    let pcm = relay.processor().decode_chunk(&body.audio)?;
    let duration_secs = relay.processor().duration_secs(pcm.len());
    let (transcript, event) = relay.analyze_clip(&pcm).await?;

    let threshold = state.get_config().game.elimination_threshold;
    let confidence = event.as_ref().map_or(0.0, |e| e.confidence);
    let response = AnalyzeResponse {
        transcription: transcript.text.trim().to_string(),
        has_laughter: confidence > threshold,
        confidence,
        laughter_type: event.map(|e| e.category),
        duration_secs,
    };
    info!(
        "Analyzed {:.2}s clip: laughter={} confidence={:.2}",
        duration_secs, response.has_laughter, response.confidence
    );

    Ok(HttpResponse::Ok().json(response))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests::test_state;
    use actix_web::{http::StatusCode, test, App};
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde_json::json;

    #[actix_web::test]
    async fn test_analyze_classifies_transcript() {
        let state = web::Data::new(test_state());
        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .route("/analyze", web::post().to(analyze_audio)),
        )
        .await;

        let audio = STANDARD.encode(vec![0u8; 3200]);
        let req = test::TestRequest::post()
            .uri("/analyze")
            .set_json(json!({ "audio": audio }))
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["transcription"], "hahaha");
        assert_eq!(body["hasLaughter"], true);
        assert_eq!(body["confidence"], 1.0);
        assert_eq!(body["laughterType"], "laughter_syllables");
    }

    #[actix_web::test]
    async fn test_analyze_rejects_bad_audio() {
        let state = web::Data::new(test_state());
        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .route("/analyze", web::post().to(analyze_audio)),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/analyze")
            .set_json(json!({ "audio": "***" }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
