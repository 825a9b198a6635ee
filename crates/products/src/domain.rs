// Product catalog domain types
//
// Products are created together with a CREATE_PRODUCT outbox event whose
// payload is a full snapshot of the product. Categories are plain rows.

use chrono::{DateTime, Utc};
use relay_outbox::{DomainRecord, EventRegistry, OutboxEvent};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::Postgres;

/// A product in the catalog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub price: f64,
    pub stock: i32,
    pub category_id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A product category
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

/// Request to create a product
#[derive(Debug, Clone, Deserialize)]
pub struct CreateProductRequest {
    pub category_id: i64,
    pub name: String,
    pub description: String,
    pub price: f64,
    #[serde(default)]
    pub stock: i32,
}

/// Request to create a category
#[derive(Debug, Clone, Deserialize)]
pub struct CreateCategoryRequest {
    pub name: String,
    pub description: String,
}

/// Emitted when a product is created; carries the product as it was written
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProductCreated(pub Product);

impl OutboxEvent for ProductCreated {
    const EVENT_TYPE: &'static str = "CREATE_PRODUCT";

    fn entity_id(&self) -> String {
        self.0.id.to_string()
    }
}

/// Registry of every event this service writes to the outbox
pub fn event_registry() -> EventRegistry {
    EventRegistry::new().register::<ProductCreated>()
}

impl DomainRecord for Product {
    fn collection(&self) -> &'static str {
        "products"
    }

    fn key(&self) -> i64 {
        self.id
    }

    fn snapshot(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    fn insert_query(&self) -> Query<'static, Postgres, PgArguments> {
        sqlx::query(
            r#"
            INSERT INTO products (id, name, description, price, stock, category_id, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(self.id)
        .bind(self.name.clone())
        .bind(self.description.clone())
        .bind(self.price)
        .bind(self.stock)
        .bind(self.category_id)
        .bind(self.created_at)
        .bind(self.updated_at)
    }
}

impl DomainRecord for Category {
    fn collection(&self) -> &'static str {
        "categories"
    }

    fn key(&self) -> i64 {
        self.id
    }

    fn snapshot(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    fn insert_query(&self) -> Query<'static, Postgres, PgArguments> {
        sqlx::query(
            r#"
            INSERT INTO categories (id, name, description, created_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(self.id)
        .bind(self.name.clone())
        .bind(self.description.clone())
        .bind(self.created_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use relay_outbox::EventRecord;

    fn record(product: &Product) -> EventRecord {
        EventRecord::for_event(
            "2024-05-01".into(),
            &ProductCreated(product.clone()),
            product.created_at,
        )
        .unwrap()
    }

    fn product() -> Product {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        Product {
            id: 1001,
            name: "Kettle".into(),
            description: "1.7l steel kettle".into(),
            price: 9.99,
            stock: 5,
            category_id: 3,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_event_payload_is_product_snapshot() {
        let product = product();
        let record = record(&product);

        assert_eq!(record.event_type, "CREATE_PRODUCT");
        let decoded: Product = serde_json::from_slice(&record.payload).unwrap();
        assert_eq!(decoded, product);
    }

    #[test]
    fn test_registry_routes_product_created() {
        let product = product();
        let routed = event_registry().route(&record(&product)).unwrap();

        assert_eq!(routed.key, "CREATE_PRODUCT:1001");
        let decoded: Product = serde_json::from_slice(&routed.payload).unwrap();
        assert_eq!(decoded, product);
    }

    #[test]
    fn test_stock_defaults_to_zero() {
        let req: CreateProductRequest = serde_json::from_str(
            r#"{"category_id": 1, "name": "n", "description": "d", "price": 1.5}"#,
        )
        .unwrap();
        assert_eq!(req.stock, 0);
    }
}
