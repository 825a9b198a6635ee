// Products service with a transactional outbox
//
// The write path (HTTP -> ProductService -> OutboxStore) commits each product
// together with its CREATE_PRODUCT event. The relay side lives in relay-outbox
// and is wired up by the binary.

pub mod api;
pub mod config;
pub mod domain;
pub mod service;

pub use config::{AppConfig, BrokerKind, ConfigError};
pub use domain::{
    event_registry, Category, CreateCategoryRequest, CreateProductRequest, Product,
    ProductCreated,
};
pub use service::{ProductService, ServiceError};
