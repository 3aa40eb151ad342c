//! API module for the belfry server.

use std::sync::Arc;

use actix_web::{web, HttpResponse, Responder};
use belfry_core::{
    BelfryError, DeleteType, NotifyHttpParam, RunHistory, TimerDefinition, TimerService,
    TimerStatus, TimerType, TriggerType,
};
use serde::{Deserialize, Serialize};

/// Application state shared across handlers.
pub struct AppState {
    pub service: Arc<TimerService>,
}

/// Response for health check.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

/// Generic API response.
#[derive(Serialize)]
pub struct ApiResponse {
    pub success: bool,
    pub message: String,
}

/// Request body for creating a timer.
#[derive(Deserialize)]
pub struct CreateTimerRequest {
    pub app: String,
    pub name: String,
    #[serde(default)]
    pub creator: String,
    pub timer_type: TimerType,
    #[serde(default)]
    pub cron: String,
    #[serde(default)]
    pub delay_time: String,
    pub trigger_type: TriggerType,
    #[serde(default = "default_delete_type")]
    pub delete_type: DeleteType,
    #[serde(default)]
    pub end_time: String,
    pub notify_http_param: NotifyHttpParam,
    #[serde(default)]
    pub execute_time_limit: u64,
}

fn default_delete_type() -> DeleteType {
    DeleteType::NotDelete
}

impl CreateTimerRequest {
    fn into_definition(self) -> TimerDefinition {
        let mut def = TimerDefinition::new(self.app, self.name);
        def.creator = self.creator;
        def.timer_type = self.timer_type;
        def.cron = self.cron;
        def.delay_time = self.delay_time;
        def.trigger_type = self.trigger_type;
        def.delete_type = self.delete_type;
        def.end_time = self.end_time;
        def.notify_http_param = self.notify_http_param;
        def.execute_time_limit = self.execute_time_limit;
        def
    }
}

/// Response for timer creation.
#[derive(Serialize)]
pub struct CreateTimerResponse {
    pub success: bool,
    pub def_id: String,
}

/// Query parameters for timer list.
#[derive(Deserialize)]
pub struct TimerListQuery {
    #[serde(default)]
    pub app: String,
    #[serde(default = "default_limit")]
    pub limit: u64,
    #[serde(default)]
    pub offset: u64,
}

fn default_limit() -> u64 {
    20
}

/// Response for listing timers.
#[derive(Serialize)]
pub struct TimerListResponse {
    pub timers: Vec<TimerDefinition>,
    pub total: u64,
}

/// Response for listing run history.
#[derive(Serialize)]
pub struct HistoryListResponse {
    pub runs: Vec<RunHistory>,
    pub total: u64,
}

/// Response for engine statistics.
#[derive(Serialize)]
pub struct StatsResponse {
    pub enabled: u64,
    pub pending: usize,
}

/// Response for a manual trigger.
#[derive(Serialize)]
pub struct TriggerResponse {
    pub success: bool,
    pub output: String,
}

fn error_response(e: BelfryError) -> HttpResponse {
    let body = ApiResponse {
        success: false,
        message: e.to_string(),
    };
    match e {
        BelfryError::TimerNotFound(_) => HttpResponse::NotFound().json(body),
        BelfryError::Validation(_) | BelfryError::Cron(_) => HttpResponse::BadRequest().json(body),
        _ => HttpResponse::InternalServerError().json(body),
    }
}

/// Configure API routes.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("")
            .route("/health", web::get().to(health))
            .service(
                web::scope("/api")
                    .route("/stats", web::get().to(stats))
                    .route("/timers", web::post().to(create_timer))
                    .route("/timers", web::get().to(list_timers))
                    .route("/timers/{id}", web::get().to(get_timer))
                    .route("/timers/{id}", web::delete().to(delete_timer))
                    .route("/timers/{id}/enable", web::post().to(enable_timer))
                    .route("/timers/{id}/disable", web::post().to(disable_timer))
                    .route("/timers/{id}/trigger", web::post().to(trigger_timer))
                    .route("/timers/{id}/history", web::get().to(timer_history)),
            ),
    );
}

/// Health check endpoint.
async fn health() -> impl Responder {
    HttpResponse::Ok().json(HealthResponse { status: "ok" })
}

/// Engine statistics: enabled timers and pending marks.
async fn stats(state: web::Data<AppState>) -> impl Responder {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default();

    let enabled = match state.service.count_enabled_timers().await {
        Ok(count) => count,
        Err(e) => return error_response(e),
    };
    let pending = match state.service.count_pending_timers(now).await {
        Ok(count) => count,
        Err(e) => return error_response(e),
    };
    HttpResponse::Ok().json(StatsResponse { enabled, pending })
}

/// Create a new timer definition.
async fn create_timer(
    state: web::Data<AppState>,
    body: web::Json<CreateTimerRequest>,
) -> impl Responder {
    let def = body.into_inner().into_definition();
    match state.service.create_definition(&def).await {
        Ok(()) => HttpResponse::Ok().json(CreateTimerResponse {
            success: true,
            def_id: def.def_id,
        }),
        Err(e) => error_response(e),
    }
}

/// List timers, optionally filtered by app.
async fn list_timers(
    state: web::Data<AppState>,
    query: web::Query<TimerListQuery>,
) -> impl Responder {
    match state
        .service
        .page_definitions(&query.app, query.offset, query.limit)
        .await
    {
        Ok((timers, total)) => HttpResponse::Ok().json(TimerListResponse { timers, total }),
        Err(e) => error_response(e),
    }
}

/// Get a single timer definition.
async fn get_timer(state: web::Data<AppState>, path: web::Path<String>) -> impl Responder {
    match state.service.get_definition(&path.into_inner()).await {
        Ok(def) => HttpResponse::Ok().json(def),
        Err(e) => error_response(e),
    }
}

/// Delete a timer and withdraw its scheduling state.
async fn delete_timer(state: web::Data<AppState>, path: web::Path<String>) -> impl Responder {
    let def_id = path.into_inner();
    match state.service.delete_definition(&def_id).await {
        Ok(()) => HttpResponse::Ok().json(ApiResponse {
            success: true,
            message: format!("Timer {} deleted", def_id),
        }),
        Err(e) => error_response(e),
    }
}

/// Enable a timer; registers its first upcoming occurrence.
async fn enable_timer(state: web::Data<AppState>, path: web::Path<String>) -> impl Responder {
    change_status(state, path.into_inner(), TimerStatus::Enabled).await
}

/// Disable a timer; withdraws any scheduled occurrence.
async fn disable_timer(state: web::Data<AppState>, path: web::Path<String>) -> impl Responder {
    change_status(state, path.into_inner(), TimerStatus::Disabled).await
}

async fn change_status(
    state: web::Data<AppState>,
    def_id: String,
    status: TimerStatus,
) -> HttpResponse {
    match state.service.change_status(&def_id, status).await {
        Ok(()) => HttpResponse::Ok().json(ApiResponse {
            success: true,
            message: format!("Timer {} updated", def_id),
        }),
        Err(e) => error_response(e),
    }
}

/// Fire a timer's callback immediately.
async fn trigger_timer(state: web::Data<AppState>, path: web::Path<String>) -> impl Responder {
    match state.service.manual_trigger(&path.into_inner()).await {
        Ok(output) => HttpResponse::Ok().json(TriggerResponse {
            success: true,
            output,
        }),
        Err(e) => error_response(e),
    }
}

/// List run history for a timer.
async fn timer_history(
    state: web::Data<AppState>,
    path: web::Path<String>,
    query: web::Query<TimerListQuery>,
) -> impl Responder {
    match state
        .service
        .page_history(&path.into_inner(), query.offset, query.limit)
        .await
    {
        Ok((runs, total)) => HttpResponse::Ok().json(HistoryListResponse { runs, total }),
        Err(e) => error_response(e),
    }
}
