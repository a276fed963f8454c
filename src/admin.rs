use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{Query, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::config::AdminConfig;
use crate::pipeline::PriceSettings;
use crate::store::settings::{load_price_settings, save_price_settings};
use crate::store::{SqliteStore, StoredError, TargetMapping};

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 500;

pub struct AdminState {
    pub store: SqliteStore,
    /// Used when a stored setting is missing or unreadable.
    pub defaults: PriceSettings,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    limit: Option<usize>,
}

impl LimitQuery {
    fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }
}

/// Partial update; absent fields keep their current value.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct SettingsUpdate {
    pub pro_delta: Option<i64>,
    pub default_delta: Option<i64>,
    pub zero_floor: Option<bool>,
    pub ignore_below: Option<i64>,
}

impl SettingsUpdate {
    fn apply(&self, current: PriceSettings) -> Result<PriceSettings, AdminError> {
        let merged = PriceSettings {
            pro_delta: self.pro_delta.unwrap_or(current.pro_delta),
            default_delta: self.default_delta.unwrap_or(current.default_delta),
            zero_floor: self.zero_floor.unwrap_or(current.zero_floor),
            ignore_below: self.ignore_below.unwrap_or(current.ignore_below),
        };
        if merged.pro_delta < 0 || merged.default_delta < 0 {
            return Err(AdminError::BadRequest("deltas must not be negative".to_string()));
        }
        if merged.ignore_below < 0 {
            return Err(AdminError::BadRequest("ignore_below must not be negative".to_string()));
        }
        Ok(merged)
    }
}

#[derive(Debug)]
pub enum AdminError {
    BadRequest(String),
    Internal(anyhow::Error),
}

impl From<anyhow::Error> for AdminError {
    fn from(err: anyhow::Error) -> Self {
        AdminError::Internal(err)
    }
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        match self {
            AdminError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            AdminError::Internal(e) => {
                error!("Admin request failed: {:#}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
            }
        }
    }
}

pub fn router(state: Arc<AdminState>) -> Router {
    Router::new()
        .route("/api/mappings", get(list_mappings))
        .route("/api/errors", get(list_errors))
        .route("/api/settings", get(get_settings).post(update_settings))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_basic_auth))
        .with_state(state)
}

/// Serve the admin API until the task is dropped.
pub async fn serve(config: &AdminConfig, state: Arc<AdminState>) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("Failed to bind admin API to {}", config.bind))?;
    info!("Admin API listening on http://{}", config.bind);
    axum::serve(listener, router(state))
        .await
        .context("Admin API server error")?;
    Ok(())
}

async fn require_basic_auth(
    State(state): State<Arc<AdminState>>,
    request: Request,
    next: Next,
) -> Response {
    if is_authorized(request.headers(), &state.username, &state.password) {
        return next.run(request).await;
    }
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Basic realm=\"admin\"")],
        "Unauthorized",
    )
        .into_response()
}

pub fn is_authorized(headers: &HeaderMap, username: &str, password: &str) -> bool {
    let value = match headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        Some(v) => v,
        None => return false,
    };
    let encoded = match value.strip_prefix("Basic ") {
        Some(e) => e.trim(),
        None => return false,
    };
    let decoded = match STANDARD.decode(encoded).ok().and_then(|b| String::from_utf8(b).ok()) {
        Some(d) => d,
        None => return false,
    };
    match decoded.split_once(':') {
        Some((user, pass)) => user == username && pass == password,
        None => false,
    }
}

async fn list_mappings(
    State(state): State<Arc<AdminState>>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<TargetMapping>>, AdminError> {
    Ok(Json(state.store.recent_mappings(query.limit()).await?))
}

async fn list_errors(
    State(state): State<Arc<AdminState>>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<StoredError>>, AdminError> {
    Ok(Json(state.store.recent_errors(query.limit()).await?))
}

async fn get_settings(State(state): State<Arc<AdminState>>) -> Result<Json<PriceSettings>, AdminError> {
    Ok(Json(load_price_settings(&state.store, &state.defaults).await?))
}

async fn update_settings(
    State(state): State<Arc<AdminState>>,
    Json(update): Json<SettingsUpdate>,
) -> Result<Json<PriceSettings>, AdminError> {
    let current = load_price_settings(&state.store, &state.defaults).await?;
    let merged = update.apply(current)?;
    save_price_settings(&state.store, &merged).await?;
    info!("Price settings updated via admin API: {:?}", merged);
    Ok(Json(merged))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MessageKind, SourceKey};
    use axum::http::HeaderValue;
    use chrono::Utc;

    fn defaults() -> PriceSettings {
        PriceSettings {
            pro_delta: 2000,
            default_delta: 1000,
            zero_floor: true,
            ignore_below: 10000,
        }
    }

    fn state() -> Arc<AdminState> {
        Arc::new(AdminState {
            store: SqliteStore::open_in_memory().unwrap(),
            defaults: defaults(),
            username: "admin".to_string(),
            password: "s3cret".to_string(),
        })
    }

    fn basic(user_pass: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let value = format!("Basic {}", STANDARD.encode(user_pass));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_str(&value).unwrap());
        headers
    }

    #[test]
    fn test_basic_auth() {
        assert!(is_authorized(&basic("admin:s3cret"), "admin", "s3cret"));
        assert!(is_authorized(&basic("admin:pa:ss"), "admin", "pa:ss"));
        assert!(!is_authorized(&basic("admin:wrong"), "admin", "s3cret"));
        assert!(!is_authorized(&basic("admins3cret"), "admin", "s3cret"));
        assert!(!is_authorized(&HeaderMap::new(), "admin", "s3cret"));

        let mut bearer = HeaderMap::new();
        bearer.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert!(!is_authorized(&bearer, "admin", "s3cret"));
    }

    #[test]
    fn test_limit_clamped() {
        assert_eq!(LimitQuery { limit: None }.limit(), DEFAULT_LIMIT);
        assert_eq!(LimitQuery { limit: Some(0) }.limit(), 1);
        assert_eq!(LimitQuery { limit: Some(10_000) }.limit(), MAX_LIMIT);
    }

    #[tokio::test]
    async fn test_partial_settings_update() {
        let state = state();
        let update = SettingsUpdate {
            pro_delta: Some(3500),
            ..Default::default()
        };
        let Json(saved) = update_settings(State(state.clone()), Json(update)).await.unwrap();
        assert_eq!(saved.pro_delta, 3500);
        assert_eq!(saved.default_delta, 1000);

        let Json(read) = get_settings(State(state)).await.unwrap();
        assert_eq!(read, saved);
    }

    #[tokio::test]
    async fn test_negative_delta_rejected() {
        let update = SettingsUpdate {
            default_delta: Some(-5),
            ..Default::default()
        };
        let err = update_settings(State(state()), Json(update)).await.unwrap_err();
        assert!(matches!(err, AdminError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_list_mappings() {
        let state = state();
        state
            .store
            .save_mapping(&TargetMapping {
                source: SourceKey {
                    channel: -100,
                    message: 7,
                },
                target_message: 70,
                kind: MessageKind::Text,
                summary: "12.05.2024 iPhone 15 Pro 102.000".to_string(),
                delivered_text: "12.05.2024 iPhone 15 Pro 102.000".to_string(),
                processed_at: Utc::now(),
            })
            .await
            .unwrap();

        let Json(mappings) = list_mappings(State(state.clone()), Query(LimitQuery { limit: Some(5) }))
            .await
            .unwrap();
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0].target_message, 70);

        let Json(errors) = list_errors(State(state), Query(LimitQuery { limit: None }))
            .await
            .unwrap();
        assert!(errors.is_empty());
    }
}
