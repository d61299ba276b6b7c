use std::sync::Arc;

use axum::extract::multipart::MultipartRejection;
use axum::extract::rejection::{FormRejection, JsonRejection};
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::StatusCode;
use axum::response::Html;
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use serde_json::Value;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::bail_api;
use crate::error::{ApiResult, PredictionError};
use crate::service::{DiabetesPrediction, HealthStatus, PredictionService, TumourPrediction};

/// Multipart field carrying the scan for tumour prediction
const IMAGE_FIELD: &str = "image";

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) service: Arc<PredictionService>,
}

pub(crate) fn router(service: Arc<PredictionService>, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/predict-diabetes", post(handle_diabetes_request))
        .route("/predict-tumour", post(handle_tumour_request))
        .route("/predict", get(handle_legacy_page).post(handle_legacy_form))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { service })
}

/// Runs a CPU-bound prediction off the async executor. A panicked task counts as an inference failure.
async fn run_blocking<T, F>(service: Arc<PredictionService>, job: F) -> Result<T, PredictionError>
where
    T: Send + 'static,
    F: FnOnce(&PredictionService) -> Result<T, PredictionError> + Send + 'static,
{
    let result = tokio::task::spawn_blocking(move || job(&service))
        .await
        .unwrap_or_else(|err| Err(PredictionError::inference(err)));
    if let Err(err) = &result {
        if err.status().is_server_error() {
            tracing::error!("Prediction failed: {}", err);
        } else {
            tracing::debug!("Rejected prediction request: {}", err);
        }
    }
    result
}

#[axum_macros::debug_handler]
async fn handle_health(State(state): State<AppState>) -> Json<HealthStatus> {
    Json(state.service.health())
}

#[axum_macros::debug_handler]
async fn handle_diabetes_request(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<DiabetesPrediction>)> {
    state.service.ensure_diabetes_model()?;

    let record = match payload {
        Ok(Json(Value::Object(record))) if !record.is_empty() => record,
        Ok(_) => bail_api!(StatusCode::BAD_REQUEST, "Request must be a non-empty JSON object."),
        Err(rejection) => {
            tracing::debug!("Rejected diabetes payload: {}", rejection.body_text());
            bail_api!(StatusCode::BAD_REQUEST, "Request must be JSON.")
        }
    };

    let prediction =
        run_blocking(state.service, move |service| service.predict_diabetes(&record)).await?;
    Ok((StatusCode::OK, Json(prediction)))
}

#[axum_macros::debug_handler]
async fn handle_tumour_request(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> ApiResult<(StatusCode, Json<TumourPrediction>)> {
    state.service.ensure_tumour_model()?;

    let mut multipart = multipart.map_err(|rejection| {
        PredictionError::MalformedRequest(format!(
            "Expected a multipart form: {}",
            rejection.body_text()
        ))
    })?;

    let mut opt_image = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| PredictionError::MalformedRequest(err.body_text()))?
    {
        match field.name() {
            Some(IMAGE_FIELD) => {
                opt_image = Some(
                    field
                        .bytes()
                        .await
                        .map_err(|err| PredictionError::MalformedRequest(err.body_text()))?,
                );
            }
            name => tracing::debug!("Ignoring multipart field {:?}", name),
        }
    }

    let Some(image) = opt_image else {
        return Err(PredictionError::MissingInput(format!(
            "No image file provided under key '{IMAGE_FIELD}'"
        ))
        .into());
    };

    let prediction =
        run_blocking(state.service, move |service| service.predict_tumour(&image)).await?;
    Ok((StatusCode::OK, Json(prediction)))
}

#[axum_macros::debug_handler]
async fn handle_legacy_page() -> Html<String> {
    Html(legacy::render(None))
}

/// Deprecated form front-end. Fields are read in submission order and every outcome renders the page.
#[axum_macros::debug_handler]
async fn handle_legacy_form(
    State(state): State<AppState>,
    form: Result<Form<Vec<(String, String)>>, FormRejection>,
) -> Html<String> {
    let values = match form {
        Ok(Form(fields)) => fields
            .iter()
            .map(|(name, value)| {
                value.trim().parse::<f32>().map_err(|_| {
                    PredictionError::validation(name, format!("'{value}' is not a number"))
                })
            })
            .collect::<Result<Vec<f32>, PredictionError>>(),
        Err(rejection) => Err(PredictionError::MalformedRequest(rejection.body_text())),
    };

    let outcome = match values {
        Ok(values) => run_blocking(state.service, move |service| service.assess_risk(&values)).await,
        Err(err) => Err(err),
    };
    Html(legacy::render(Some(outcome.map_err(|err| err.to_string()))))
}

mod legacy {
    use crate::service::RiskAssessment;

    const TEMPLATE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <title>Diabetes Risk Predictor</title>
</head>
<body>
  <h1>Diabetes Risk Predictor</h1>
  <form action="/predict" method="post">
    <input name="gender_male" placeholder="Male (1 or 0)" required>
    <input name="age" placeholder="Age" required>
    <input name="hypertension" placeholder="Hypertension (1 or 0)" required>
    <input name="heart_disease" placeholder="Heart disease (1 or 0)" required>
    <input name="smoking_current" placeholder="Current smoker (1 or 0)" required>
    <input name="bmi" placeholder="BMI" required>
    <input name="hba1c" placeholder="HbA1c" required>
    <input name="glucose" placeholder="Blood glucose" required>
    <button type="submit">Predict probability</button>
  </form>
  <p class="prediction">{{pred}}</p>
  <p class="hint">{{hint}}</p>
</body>
</html>
"#;

    pub(super) fn render(outcome: Option<Result<RiskAssessment, String>>) -> String {
        let (pred, hint) = match outcome {
            None => (String::new(), String::new()),
            Some(Ok(assessment)) if assessment.elevated => (
                format!(
                    "Elevated risk. Probability of diabetes is {:.3}.",
                    assessment.probability
                ),
                "Please consult a doctor about further tests.".to_string(),
            ),
            Some(Ok(assessment)) => (
                format!(
                    "Low risk. Probability of diabetes is {:.3}.",
                    assessment.probability
                ),
                "You are safe for now.".to_string(),
            ),
            Some(Err(message)) => (
                format!("Error: {message}"),
                "Please check your input values.".to_string(),
            ),
        };
        TEMPLATE
            .replace("{{pred}}", &escape(&pred))
            .replace("{{hint}}", &escape(&hint))
    }

    fn escape(text: &str) -> String {
        let mut escaped = String::with_capacity(text.len());
        for c in text.chars() {
            match c {
                '&' => escaped.push_str("&amp;"),
                '<' => escaped.push_str("&lt;"),
                '>' => escaped.push_str("&gt;"),
                '"' => escaped.push_str("&quot;"),
                '\'' => escaped.push_str("&#39;"),
                _ => escaped.push(c),
            }
        }
        escaped
    }
}

#[cfg(test)]
mod tests {
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request};
    use axum::response::Response;
    use image::ImageFormat;
    use serde_json::json;
    use tower::ServiceExt;

    use super::*;
    use crate::inference::adapter::stubs::Failing;
    use crate::inference::adapter::TabularModel;
    use crate::inference::preprocess::fixtures::solid_image;
    use crate::service::tests::{probabilistic, service_with, vision};
    use crate::service::ModelSlot;

    const BOUNDARY: &str = "X-PREDICTOR-BOUNDARY";

    fn app(service: PredictionService) -> Router {
        router(Arc::new(service), 10_000_000)
    }

    fn loaded_app() -> Router {
        app(service_with(probabilistic(vec![0.2, 0.8]), vision(vec![0.82])))
    }

    fn unavailable_app() -> Router {
        app(service_with(
            ModelSlot::Unavailable("No such file or directory".into()),
            ModelSlot::Unavailable("No such file or directory".into()),
        ))
    }

    fn multipart_body(field: &str, bytes: &[u8]) -> Body {
        let mut body = format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"scan.jpg\"\r\nContent-Type: image/jpeg\r\n\r\n"
        )
        .into_bytes();
        body.extend_from_slice(bytes);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
        Body::from(body)
    }

    fn tumour_request(field: &str, bytes: &[u8]) -> Request<Body> {
        Request::post("/predict-tumour")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(multipart_body(field, bytes))
            .unwrap()
    }

    fn diabetes_request(body: impl Into<Body>) -> Request<Body> {
        Request::post("/predict-diabetes")
            .header(header::CONTENT_TYPE, "application/json")
            .body(body.into())
            .unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn text_body(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn health_reports_model_state() {
        let response = unavailable_app()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            json_body(response).await,
            json!({ "status": "ok", "diabetesModelLoaded": false, "cnnModelLoaded": false })
        );
    }

    #[tokio::test]
    async fn diabetes_prediction() {
        let body = json!({
            "gender": "male",
            "age": 45,
            "hypertension": true,
            "heart_disease": false,
            "smoking_history": "current",
            "bmi": 28.5,
            "hba1c": 6.1,
            "glucose": 140
        });
        let response = loaded_app()
            .oneshot(diabetes_request(body.to_string()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            json_body(response).await,
            json!({ "prediction": "Diabetic", "confidence": 0.8 })
        );
    }

    #[tokio::test]
    async fn diabetes_empty_body_is_bad_request() {
        let response = loaded_app()
            .oneshot(diabetes_request(Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(json_body(response).await["error"].is_string());
    }

    #[tokio::test]
    async fn diabetes_empty_object_is_bad_request() {
        let response = loaded_app()
            .oneshot(diabetes_request("{}"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn diabetes_invalid_field_is_bad_request() {
        let response = loaded_app()
            .oneshot(diabetes_request(json!({ "age": "old" }).to_string()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert!(body["error"].as_str().unwrap().contains("age"));
    }

    #[tokio::test]
    async fn diabetes_unavailable_model_is_server_error() {
        let response = unavailable_app()
            .oneshot(diabetes_request(json!({ "age": 30 }).to_string()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(response).await;
        assert!(body["error"].as_str().unwrap().contains("unavailable"));
        assert_eq!(body["detail"], "No such file or directory");
    }

    #[tokio::test]
    async fn tumour_prediction_from_jpeg() {
        let jpeg = solid_image(120, 90, [200, 180, 160], ImageFormat::Jpeg);
        let response = loaded_app()
            .oneshot(tumour_request(IMAGE_FIELD, &jpeg))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            json_body(response).await,
            json!({ "prediction": "Tumour", "confidence": 0.82 })
        );
    }

    #[tokio::test]
    async fn tumour_softmax_prediction() {
        let service = service_with(probabilistic(vec![0.5]), vision(vec![0.3, 0.7]));
        let jpeg = solid_image(16, 16, [10, 10, 10], ImageFormat::Jpeg);
        let response = app(service)
            .oneshot(tumour_request(IMAGE_FIELD, &jpeg))
            .await
            .unwrap();
        assert_eq!(
            json_body(response).await,
            json!({ "prediction": "Tumour", "confidence": 0.7 })
        );
    }

    #[tokio::test]
    async fn tumour_missing_image_field_is_bad_request() {
        let jpeg = solid_image(16, 16, [10, 10, 10], ImageFormat::Jpeg);
        let response = loaded_app()
            .oneshot(tumour_request("scan", &jpeg))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            json_body(response).await["error"],
            "No image file provided under key 'image'"
        );
    }

    #[tokio::test]
    async fn tumour_without_multipart_is_bad_request() {
        let response = loaded_app()
            .oneshot(Request::post("/predict-tumour").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn tumour_undecodable_image_is_bad_request() {
        let response = loaded_app()
            .oneshot(tumour_request(IMAGE_FIELD, b"not an image"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn tumour_unavailable_model_is_server_error() {
        let jpeg = solid_image(16, 16, [10, 10, 10], ImageFormat::Jpeg);
        let response = unavailable_app()
            .oneshot(tumour_request(IMAGE_FIELD, &jpeg))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(response).await;
        assert!(body["error"].as_str().unwrap().contains("unavailable"));
    }

    fn legacy_form(body: &str) -> Request<Body> {
        Request::post("/predict")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn legacy_page_renders_form() {
        let response = loaded_app()
            .oneshot(Request::get("/predict").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(text_body(response).await.contains("<form action=\"/predict\""));
    }

    #[tokio::test]
    async fn legacy_form_reports_elevated_risk() {
        let response = loaded_app()
            .oneshot(legacy_form(
                "gender_male=1&age=45&hypertension=1&heart_disease=0&smoking_current=1&bmi=28.5&hba1c=6.1&glucose=140",
            ))
            .await
            .unwrap();
        let page = text_body(response).await;
        assert!(page.contains("Elevated risk. Probability of diabetes is 0.800."));
    }

    #[tokio::test]
    async fn legacy_form_reports_low_risk() {
        let service = service_with(probabilistic(vec![0.99, 0.01]), vision(vec![0.5]));
        let response = app(service)
            .oneshot(legacy_form(
                "a=0&b=25&c=0&d=0&e=0&f=21&g=4.9&h=85",
            ))
            .await
            .unwrap();
        let page = text_body(response).await;
        assert!(page.contains("Low risk. Probability of diabetes is 0.010."));
    }

    #[tokio::test]
    async fn legacy_form_rejects_non_finite_values() {
        let response = loaded_app()
            .oneshot(legacy_form("a=NaN&b=25&c=0&d=0&e=0&f=21&g=4.9&h=85"))
            .await
            .unwrap();
        let page = text_body(response).await;
        assert!(page.contains("Invalid value for field &#39;gender_male&#39;: must be a finite number"));
        assert!(!page.contains("Probability of diabetes"));
    }

    #[tokio::test]
    async fn legacy_form_shows_inference_failure() {
        let service = service_with(
            ModelSlot::Loaded(TabularModel::Probabilistic(Box::new(Failing))),
            vision(vec![0.5]),
        );
        let response = app(service)
            .oneshot(legacy_form("a=0&b=25&c=0&d=0&e=0&f=21&g=4.9&h=85"))
            .await
            .unwrap();
        let page = text_body(response).await;
        assert!(page.contains("Error: Model inference failed: shape mismatch"));
        assert!(page.contains("Please check your input values."));
    }

    #[tokio::test]
    async fn legacy_form_errors_render_the_page() {
        let response = loaded_app()
            .oneshot(legacy_form("age=<b>old</b>"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let page = text_body(response).await;
        assert!(page.contains("Please check your input values."));
        assert!(page.contains("&lt;b&gt;old&lt;/b&gt;"));
        assert!(!page.contains("<b>old</b>"));
    }
}
