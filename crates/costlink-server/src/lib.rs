pub mod audit;
pub mod context;
pub mod dictionary;
pub mod gateway;
pub mod lifecycle;
pub mod notify;
pub mod poster;
pub mod processing_log;
pub mod resolver;
pub mod store;

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path as UrlPath, Query, State};
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::{Datelike, Utc};
use costlink_config::Config;
use costlink_contracts::{
    ActivationPayload, AddCategoryRequest, AddCategoryResponse, CategoriesResponse,
    ErrorResponse, PanelContext, ProcessExpensesRequest, ProcessExpensesResponse,
    StatusResponse, SERVICE_NAME, SERVICE_VERSION,
};
use serde_json::{json, Value};
use thiserror::Error;
use tower_http::trace::TraceLayer;

pub use audit::{verify_audit_chain, verify_audit_chain_with_mirror};

use audit::{AuditJsonl, AuditRecord};
use context::ContextVerifier;
use dictionary::{AddOutcome, DictionaryError, DictionaryManager};
use gateway::Gateway;
use lifecycle::Lifecycle;
use notify::Notifier;
use poster::{ExpenseBatch, ExpensePoster, TenantContext};
use resolver::{ResolveError, ResolvedTenant, TenantResolver};
use store::{Store, StoreError};

pub async fn serve(cfg: Config) -> Result<(), String> {
    let addr: SocketAddr = cfg
        .server
        .listen_addr
        .parse()
        .map_err(|e| format!("invalid listen_addr: {e}"))?;

    let app = build_app(cfg).await?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("bind failed: {e}"))?;
    tracing::info!(%addr, "costlink listening");
    axum::serve(listener, app)
        .await
        .map_err(|e| format!("serve failed: {e}"))
}

pub async fn build_app(cfg: Config) -> Result<Router, String> {
    let debug_endpoints = cfg.server.debug_endpoints;
    let state = AppState::new(cfg).await?;

    let mut router = Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/api/expense-categories", get(list_categories).post(add_category))
        .route("/api/process-expenses", post(process_expenses))
        .nest("/vendor", vendor_routes())
        .nest("/api/moysklad/vendor/1.0", vendor_routes());
    if debug_endpoints {
        router = router.route("/debug/accounts", get(debug_accounts));
    }
    Ok(router
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .with_state(state))
}

fn vendor_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/apps/{app_id}/{account_id}",
            put(activate).delete(deactivate),
        )
        .route("/apps/{app_id}/{account_id}/status", get(app_status))
}

#[derive(Clone)]
struct AppState {
    cfg: Arc<Config>,
    store: Store,
    gateway: Arc<Gateway>,
    verifier: Arc<ContextVerifier>,
    audit: Arc<AuditJsonl>,
    notifier: Arc<Notifier>,
}

impl AppState {
    async fn new(cfg: Config) -> Result<Self, String> {
        let store = match cfg.store.kind.as_str() {
            "json" => {
                let dir = cfg
                    .store
                    .data_dir
                    .clone()
                    .ok_or_else(|| "store.data_dir is required for json store".to_string())?;
                Store::json(dir, cfg.store.session_map_limit)
            }
            _ => Store::memory(cfg.store.session_map_limit),
        };
        Ok(Self {
            store,
            gateway: Arc::new(Gateway::new(&cfg.erp)?),
            verifier: Arc::new(ContextVerifier::new(cfg.vendor.clone())),
            audit: Arc::new(
                AuditJsonl::new(
                    &cfg.audit.jsonl_path,
                    cfg.audit.immutable_mirror_path.as_deref(),
                )
                .await?,
            ),
            notifier: Arc::new(Notifier::from_config(&cfg.notify)?),
            cfg: Arc::new(cfg),
        })
    }

    fn dictionary(&self) -> DictionaryManager<'_> {
        DictionaryManager::new(&self.store, &self.gateway, &self.cfg.expenses.dictionary_name)
    }

    fn lifecycle(&self) -> Lifecycle<'_> {
        Lifecycle::new(&self.store, self.dictionary())
    }

    async fn resolve(&self, ctx: &PanelContext) -> Result<ResolvedTenant, ApiError> {
        let resolved = TenantResolver::new(&self.store, &self.gateway, &self.verifier)
            .resolve(ctx.session_key(), ctx.tenant_hint())
            .await?;
        tracing::debug!(
            account_id = %resolved.account_id,
            via = resolved.via.as_str(),
            "tenant resolved"
        );
        Ok(resolved)
    }

    async fn process_expenses(
        &self,
        req: ProcessExpensesRequest,
    ) -> Result<ProcessExpensesResponse, ApiError> {
        let tenant = self.resolve(&req.context).await?;
        let batch = ExpenseBatch {
            category: req
                .category
                .as_deref()
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .unwrap_or(self.cfg.expenses.default_category.as_str())
                .to_string(),
            year: req.year.unwrap_or_else(|| Utc::now().year()),
            currency: req.currency.filter(|c| !c.trim().is_empty()),
            items: req.expenses,
        };
        let report = ExpensePoster::new(&self.gateway)
            .process_batch(
                &tenant.credential,
                &TenantContext {
                    account_id: tenant.account_id.clone(),
                    account_name: tenant.account_name.clone(),
                },
                &batch,
            )
            .await;

        if let Some(dir) = &self.cfg.audit.log_dir {
            match report.log.persist(Path::new(dir)).await {
                Ok(path) => tracing::debug!(path = %path.display(), "processing log saved"),
                Err(e) => tracing::warn!(error = %e, "processing log not saved"),
            }
        }
        self.notifier.send(&report.log.render()).await;
        self.audit
            .append(AuditRecord::new(
                &tenant.account_id,
                "process_expenses",
                if report.errors == 0 { "ok" } else { "partial" },
                report.log.summary().unwrap_or_default(),
            ))
            .await;

        Ok(ProcessExpensesResponse {
            success: true,
            processed: report.processed,
            errors: report.errors,
            results: report.results,
            error_details: report.error_details,
        })
    }
}

#[derive(Debug, Error)]
enum ApiError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Dictionary(#[from] DictionaryError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("bad request: {0}")]
    BadRequest(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            ApiError::Resolve(e) => (StatusCode::BAD_REQUEST, e.code(), e.user_message()),
            ApiError::Dictionary(DictionaryError::EmptyName) => (
                StatusCode::BAD_REQUEST,
                "validation_error",
                "Название категории не может быть пустым".to_string(),
            ),
            ApiError::Dictionary(e) => {
                tracing::warn!(error = %e, "erp dictionary call failed");
                (
                    StatusCode::BAD_GATEWAY,
                    "erp_error",
                    format!("Ошибка обращения к МойСклад: {e}"),
                )
            }
            ApiError::Store(e) => {
                tracing::error!(error = %e, "store write failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "store_error",
                    "Внутренняя ошибка хранилища".to_string(),
                )
            }
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.clone()),
        };
        (
            status,
            Json(ErrorResponse {
                success: false,
                error: code.to_string(),
                message,
            }),
        )
            .into_response()
    }
}

async fn root() -> Json<Value> {
    Json(json!({
        "app": SERVICE_NAME,
        "status": "running",
        "version": SERVICE_VERSION,
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

async fn health() -> Json<Value> {
    Json(json!({"status": "healthy"}))
}

async fn debug_accounts(State(state): State<AppState>) -> Json<Value> {
    let tenants = state.store.tenants().await;
    Json(json!({
        "total_accounts": tenants.len(),
        "accounts": tenants.keys().collect::<Vec<_>>(),
    }))
}

async fn not_found(uri: Uri) -> (StatusCode, Json<Value>) {
    tracing::warn!(path = %uri, "route not found");
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": "Not Found", "path": uri.to_string()})),
    )
}

async fn activate(
    State(state): State<AppState>,
    UrlPath((app_id, account_id)): UrlPath<(String, String)>,
    body: Bytes,
) -> Result<Json<StatusResponse>, ApiError> {
    let payload: ActivationPayload = if body.is_empty() {
        ActivationPayload::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::BadRequest(format!("invalid activation payload: {e}")))?
    };
    if app_id != state.cfg.vendor.app_id {
        tracing::warn!(%app_id, expected = %state.cfg.vendor.app_id, "activation for unexpected app id");
    }

    let status = state
        .lifecycle()
        .on_activate(&account_id, &app_id, &payload)
        .await?;
    state
        .audit
        .append(AuditRecord::new(
            &account_id,
            "activate",
            "ok",
            format!("{status:?}"),
        ))
        .await;
    Ok(Json(StatusResponse { status }))
}

async fn deactivate(
    State(state): State<AppState>,
    UrlPath((app_id, account_id)): UrlPath<(String, String)>,
) -> Result<StatusCode, ApiError> {
    let known = state.lifecycle().on_deactivate(&account_id).await?;
    state
        .audit
        .append(AuditRecord::new(
            &account_id,
            "deactivate",
            if known { "ok" } else { "unknown_tenant" },
            app_id,
        ))
        .await;
    Ok(StatusCode::OK)
}

async fn app_status(
    State(state): State<AppState>,
    UrlPath((_app_id, account_id)): UrlPath<(String, String)>,
) -> Json<StatusResponse> {
    Json(StatusResponse {
        status: state.lifecycle().on_status_query(&account_id).await,
    })
}

async fn list_categories(
    State(state): State<AppState>,
    Query(ctx): Query<PanelContext>,
) -> Result<Json<CategoriesResponse>, ApiError> {
    let tenant = state.resolve(&ctx).await?;
    let dictionary = state.dictionary();
    let dictionary_id = dictionary
        .ensure_dictionary(&tenant.credential, &tenant.account_id)
        .await?;
    let categories = dictionary
        .list_categories(&tenant.credential, &dictionary_id)
        .await?;
    Ok(Json(CategoriesResponse {
        categories,
        account_id: tenant.account_id,
        account_name: tenant.account_name,
    }))
}

async fn add_category(
    State(state): State<AppState>,
    Query(query): Query<PanelContext>,
    Json(req): Json<AddCategoryRequest>,
) -> Result<Json<AddCategoryResponse>, ApiError> {
    if req.name.trim().is_empty() {
        return Err(DictionaryError::EmptyName.into());
    }
    let ctx = query.merged(req.context);
    let tenant = state.resolve(&ctx).await?;
    let dictionary = state.dictionary();
    let dictionary_id = dictionary
        .ensure_dictionary(&tenant.credential, &tenant.account_id)
        .await?;
    let outcome = dictionary
        .add_category(&tenant.credential, &dictionary_id, &req.name)
        .await?;
    Ok(Json(AddCategoryResponse {
        success: true,
        already_exists: matches!(outcome, AddOutcome::AlreadyExists(_)),
        category: outcome.category().clone(),
    }))
}

async fn process_expenses(
    State(state): State<AppState>,
    Query(query): Query<PanelContext>,
    Json(mut req): Json<ProcessExpensesRequest>,
) -> Result<Json<ProcessExpensesResponse>, ApiError> {
    req.context = query.merged(req.context);
    state.process_expenses(req).await.map(Json)
}
