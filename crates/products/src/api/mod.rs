// Product write API HTTP routes

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, routing::post, Json, Router};
use serde::{Deserialize, Serialize};

use crate::domain::{Category, CreateCategoryRequest, CreateProductRequest, Product};
use crate::service::{ProductService, ServiceError};

/// Standard error response for API endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error message describing what went wrong.
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }

    /// Convert to axum response tuple
    pub fn into_response(self, status: StatusCode) -> (StatusCode, Json<Self>) {
        (status, Json(self))
    }
}

type ApiError = (StatusCode, Json<ErrorResponse>);

impl From<ServiceError> for ApiError {
    fn from(e: ServiceError) -> Self {
        match e {
            ServiceError::InvalidInput(msg) => {
                ErrorResponse::new(msg).into_response(StatusCode::BAD_REQUEST)
            }
            ServiceError::Internal(msg) => {
                tracing::error!("Request failed: {}", msg);
                ErrorResponse::new("internal error").into_response(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }
}

/// App state for product routes
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ProductService>,
}

impl AppState {
    pub fn new(service: Arc<ProductService>) -> Self {
        Self { service }
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Create product and category routes plus `/health`
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/products", post(create_product))
        .route("/v1/categories", post(create_category))
        .with_state(state)
}

/// POST /v1/products - Create a product and queue its CREATE_PRODUCT event
pub async fn create_product(
    State(state): State<AppState>,
    Json(req): Json<CreateProductRequest>,
) -> Result<(StatusCode, Json<Product>), ApiError> {
    let product = state.service.create_product(req).await?;
    Ok((StatusCode::CREATED, Json(product)))
}

/// POST /v1/categories - Create a category
pub async fn create_category(
    State(state): State<AppState>,
    Json(req): Json<CreateCategoryRequest>,
) -> Result<(StatusCode, Json<Category>), ApiError> {
    let category = state.service.create_category(req).await?;
    Ok((StatusCode::CREATED, Json(category)))
}
