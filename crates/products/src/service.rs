// Product service: write-path business logic
//
// Every product creation is a single atomic dual write of the product row and
// its CREATE_PRODUCT outbox event. Validation and id generation happen before
// anything touches the store.

use std::sync::Arc;

use chrono::SubsecRound;
use relay_outbox::{
    Clock, EventRecord, IdError, IdGenerator, OutboxStore, Partitioner, WriteError,
};
use tracing::{info, instrument, warn};

use crate::domain::{
    Category, CreateCategoryRequest, CreateProductRequest, Product, ProductCreated,
};

/// Service errors
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// Request rejected before any write
    #[error("{0}")]
    InvalidInput(String),

    /// Id generation, serialization or storage failed; nothing was written
    #[error("{0}")]
    Internal(String),
}

impl From<WriteError> for ServiceError {
    fn from(e: WriteError) -> Self {
        Self::Internal(format!("failed to persist: {e}"))
    }
}

impl From<IdError> for ServiceError {
    fn from(e: IdError) -> Self {
        Self::Internal(format!("failed to generate id: {e}"))
    }
}

pub struct ProductService {
    store: Arc<dyn OutboxStore>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    partitioner: Partitioner,
}

impl ProductService {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
        partitioner: Partitioner,
    ) -> Self {
        Self {
            store,
            ids,
            clock,
            partitioner,
        }
    }

    #[instrument(skip(self, req), fields(category_id = req.category_id, name = %req.name))]
    pub async fn create_product(&self, req: CreateProductRequest) -> Result<Product, ServiceError> {
        validate_product(&req)?;

        let id = self.ids.next_id()?;
        // Postgres keeps microseconds; trim so the response matches the stored row.
        let now = self.clock.now().trunc_subsecs(6);
        let product = Product {
            id,
            name: req.name,
            description: req.description,
            price: req.price,
            stock: req.stock,
            category_id: req.category_id,
            created_at: now,
            updated_at: now,
        };

        let event = EventRecord::for_event(
            self.partitioner.key_for(now),
            &ProductCreated(product.clone()),
            now,
        )
        .map_err(|e| ServiceError::Internal(format!("failed to encode event: {e}")))?;

        self.store
            .atomic_dual_write(&product, &event)
            .await
            .map_err(|e| {
                warn!(product_id = id, error = %e, "Product dual write failed");
                ServiceError::from(e)
            })?;

        info!(
            product_id = id,
            event_id = %event.id,
            partition = %event.partition_key,
            "Product created"
        );
        Ok(product)
    }

    #[instrument(skip(self, req), fields(name = %req.name))]
    pub async fn create_category(
        &self,
        req: CreateCategoryRequest,
    ) -> Result<Category, ServiceError> {
        if req.name.is_empty() || req.description.is_empty() {
            return Err(ServiceError::InvalidInput(
                "name and description are required".into(),
            ));
        }

        let category = Category {
            id: self.ids.next_id()?,
            name: req.name,
            description: req.description,
            created_at: self.clock.now().trunc_subsecs(6),
        };
        self.store.write_domain(&category).await?;

        info!(category_id = category.id, "Category created");
        Ok(category)
    }
}

fn validate_product(req: &CreateProductRequest) -> Result<(), ServiceError> {
    let problem = if req.category_id <= 0 {
        "category_id must be positive"
    } else if req.name.is_empty() {
        "name is required"
    } else if req.description.is_empty() {
        "description is required"
    } else if !(req.price > 0.0 && req.price.is_finite()) {
        "price must be a positive number"
    } else if req.stock < 0 {
        "stock cannot be negative"
    } else {
        return Ok(());
    };
    Err(ServiceError::InvalidInput(problem.into()))
}
