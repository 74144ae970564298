use std::time::Duration;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sprinkler_common::{
    DeviceConfig, DispatcherHandle, ElementConfig, Error, ProgramConfig, ScheduleConfig,
};
use tower_http::trace::TraceLayer;
use tracing::warn;

#[derive(Clone)]
struct AppState {
    dispatcher: DispatcherHandle,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Deserialize)]
struct DeviceUpdate {
    pin: u32,
    #[serde(default)]
    on: bool,
}

#[derive(Debug, Deserialize)]
struct ProgramCreate {
    name: String,
    #[serde(default)]
    elements: Vec<ElementBody>,
}

/// One program element on the wire. The duration is either a human
/// readable string (`"1m30s"`) or a plain millisecond count.
#[derive(Debug, Deserialize)]
struct ElementBody {
    device: String,
    #[serde(default)]
    duration: Option<String>,
    #[serde(default)]
    duration_ms: Option<u64>,
}

impl ElementBody {
    fn duration(&self) -> Result<Duration, ApiError> {
        match (&self.duration, self.duration_ms) {
            (Some(text), None) => parse_duration(text)
                .ok_or_else(|| ApiError::BadRequest(format!("invalid duration '{text}'"))),
            (None, Some(ms)) => Ok(Duration::from_millis(ms)),
            (Some(_), Some(_)) => Err(ApiError::BadRequest(
                "give either 'duration' or 'duration_ms', not both".to_string(),
            )),
            (None, None) => Err(ApiError::BadRequest("missing 'duration'".to_string())),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ScheduleUpdate {
    spec: String,
    #[serde(default)]
    program: Option<String>,
    #[serde(default)]
    enabled: bool,
}

#[derive(Debug)]
enum ApiError {
    Core(Error),
    BadRequest(String),
    NotFound(String),
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self::Core(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::Core(err) => {
                let status = status_for(&err);
                if status.is_server_error() {
                    warn!(error = %err, "request failed");
                }
                error_response(status, &err.to_string())
            }
            Self::BadRequest(message) => error_response(StatusCode::BAD_REQUEST, &message),
            Self::NotFound(message) => error_response(StatusCode::NOT_FOUND, &message),
        }
    }
}

fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::NotFound { .. } | Error::OutOfRange { .. } => StatusCode::NOT_FOUND,
        Error::AlreadyExists { .. } | Error::DeviceInUse { .. } | Error::ProgramInUse { .. } => {
            StatusCode::NOT_ACCEPTABLE
        }
        Error::InvalidSpec { .. } => StatusCode::BAD_REQUEST,
        Error::DispatcherClosed => StatusCode::SERVICE_UNAVAILABLE,
        Error::Io(_) | Error::Corrupt(_) | Error::DanglingReference { .. } => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

type ApiResult<T = ()> = Result<T, ApiError>;

pub fn router(dispatcher: DispatcherHandle) -> Router {
    Router::new()
        .route("/v1", get(handle_list_devices))
        .route(
            "/v1/devices",
            get(handle_list_devices).post(handle_add_device),
        )
        .route(
            "/v1/devices/{name}",
            get(handle_get_device)
                .put(handle_set_device)
                .delete(handle_del_device),
        )
        .route(
            "/v1/programs",
            get(handle_list_programs).post(handle_create_program),
        )
        .route(
            "/v1/programs/{name}",
            get(handle_get_program).delete(handle_del_program),
        )
        .route("/v1/programs/{name}/start", post(handle_start_program))
        .route("/v1/programs/{name}/stop", post(handle_stop_program))
        .route(
            "/v1/programs/{name}/devices",
            post(handle_program_add_device),
        )
        .route(
            "/v1/programs/{name}/devices/{idx}",
            delete(handle_program_del_device),
        )
        .route(
            "/v1/schedules",
            get(handle_list_schedules).post(handle_create_schedule),
        )
        .route(
            "/v1/schedules/{name}",
            get(handle_get_schedule)
                .put(handle_set_schedule)
                .delete(handle_del_schedule),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { dispatcher })
}

async fn handle_list_devices(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.dispatcher.device_list().await?))
}

async fn handle_add_device(
    State(state): State<AppState>,
    body: Result<Json<DeviceConfig>, JsonRejection>,
) -> ApiResult {
    let Json(device) = body?;
    if device.name.is_empty() {
        return Err(ApiError::BadRequest("device name cannot be empty".to_string()));
    }
    state.dispatcher.device_add(device).await?;
    Ok(())
}

async fn handle_get_device(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.dispatcher.device_get(name).await?))
}

async fn handle_set_device(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Result<Json<DeviceUpdate>, JsonRejection>,
) -> ApiResult {
    let Json(update) = body?;
    let device = DeviceConfig {
        name: name.clone(),
        on: update.on,
        pin: update.pin,
        // Polarity is fixed at creation and ignored by set.
        switch_on_low: false,
    };
    state.dispatcher.device_set(name, device).await?;
    Ok(())
}

async fn handle_del_device(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult {
    state.dispatcher.device_del(name).await?;
    Ok(())
}

async fn handle_list_programs(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.dispatcher.program_list().await?))
}

async fn handle_create_program(
    State(state): State<AppState>,
    body: Result<Json<ProgramCreate>, JsonRejection>,
) -> ApiResult {
    let Json(body) = body?;
    if body.name.is_empty() {
        return Err(ApiError::BadRequest("program name cannot be empty".to_string()));
    }

    let elements = body
        .elements
        .iter()
        .map(|element| {
            Ok(ElementConfig {
                device: element.device.clone(),
                duration_ms: duration_ms(element.duration()?),
            })
        })
        .collect::<ApiResult<Vec<_>>>()?;

    state
        .dispatcher
        .program_create(ProgramConfig {
            name: body.name,
            elements,
        })
        .await?;
    Ok(())
}

async fn handle_get_program(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.dispatcher.program_get(name).await?))
}

async fn handle_del_program(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult {
    state.dispatcher.program_del(name).await?;
    Ok(())
}

async fn handle_start_program(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult {
    state.dispatcher.program_start(name).await?;
    Ok(())
}

async fn handle_stop_program(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult {
    state.dispatcher.program_stop(name).await?;
    Ok(())
}

async fn handle_program_add_device(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Result<Json<ElementBody>, JsonRejection>,
) -> ApiResult {
    let Json(element) = body?;
    let duration = element.duration()?;
    state
        .dispatcher
        .program_add_device(name, element.device, duration)
        .await?;
    Ok(())
}

async fn handle_program_del_device(
    State(state): State<AppState>,
    Path((name, idx)): Path<(String, String)>,
) -> ApiResult {
    let Ok(index) = idx.parse::<i64>() else {
        return Err(ApiError::BadRequest(format!("invalid index '{idx}'")));
    };
    // A negative index never addresses an element.
    let Ok(index) = usize::try_from(index) else {
        return Err(ApiError::NotFound(format!("element {index} out of range")));
    };
    state.dispatcher.program_del_device(name, index).await?;
    Ok(())
}

async fn handle_list_schedules(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.dispatcher.schedule_list().await?))
}

async fn handle_create_schedule(
    State(state): State<AppState>,
    body: Result<Json<ScheduleConfig>, JsonRejection>,
) -> ApiResult {
    let Json(schedule) = body?;
    if schedule.name.is_empty() {
        return Err(ApiError::BadRequest("schedule name cannot be empty".to_string()));
    }
    state.dispatcher.schedule_create(schedule).await?;
    Ok(())
}

async fn handle_get_schedule(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.dispatcher.schedule_get(name).await?))
}

async fn handle_set_schedule(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Result<Json<ScheduleUpdate>, JsonRejection>,
) -> ApiResult {
    let Json(update) = body?;
    let schedule = ScheduleConfig {
        name: name.clone(),
        spec: update.spec,
        program: update.program,
        enabled: update.enabled,
    };
    state.dispatcher.schedule_set(name, schedule).await?;
    Ok(())
}

async fn handle_del_schedule(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult {
    state.dispatcher.schedule_del(name).await?;
    Ok(())
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Accepts `90s`, `1m30s`, `2h45m`, `500ms` and the like. A bare `0` is
/// also taken, as Go's duration syntax allows it.
fn parse_duration(text: &str) -> Option<Duration> {
    match text.trim() {
        "0" => Some(Duration::ZERO),
        text => humantime::parse_duration(text).ok(),
    }
}
