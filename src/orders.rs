use anyhow::Result;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::info;
use uuid::Uuid;

use crate::error::{EngineError, constraint_violation};
use crate::types::{Order, OrderStatus};

const ORDER_COLUMNS: &str =
    "id, user_id, total, status, is_joining_order, paid_at, commission_processed_at, created_at";

/// An order as handed over by checkout.
#[derive(Debug, Clone)]
pub struct NewOrder {
    /// Caller-chosen id, so checkout can retry safely.
    pub id: Option<Uuid>,
    pub user_id: i64,
    pub total: i64,
    pub is_joining_order: bool,
}

pub async fn create_order(pool: &PgPool, new: NewOrder) -> Result<Order> {
    if new.total <= 0 {
        return Err(EngineError::InvalidAmount("total must be > 0".into()).into());
    }
    let id = new.id.unwrap_or_else(Uuid::new_v4);

    let order = sqlx::query_as::<_, Order>(&format!(
        "INSERT INTO orders (id, user_id, total, status, is_joining_order)
         VALUES ($1, $2, $3, $4, $5) RETURNING {ORDER_COLUMNS}"
    ))
    .bind(id)
    .bind(new.user_id)
    .bind(new.total)
    .bind(OrderStatus::Pending.as_str())
    .bind(new.is_joining_order)
    .fetch_one(pool)
    .await
    .map_err(|e| {
        constraint_violation(
            e,
            || EngineError::Conflict("order already exists".into()),
            || EngineError::NotFound(format!("user {}", new.user_id)),
        )
    })?;

    info!(order_id = %order.id, user_id = order.user_id, total = order.total, "order created");
    Ok(order)
}

pub async fn get(pool: &PgPool, order_id: Uuid) -> Result<Order> {
    let order = sqlx::query_as::<_, Order>(&format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1"))
        .bind(order_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("order {order_id}")))?;
    Ok(order)
}

/// Reads the order with a row lock held until the transaction ends.
pub(crate) async fn lock(tx: &mut Transaction<'_, Postgres>, order_id: Uuid) -> Result<Order> {
    let order = sqlx::query_as::<_, Order>(&format!(
        "SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1 FOR UPDATE"
    ))
    .bind(order_id)
    .fetch_optional(tx.as_mut())
    .await?
    .ok_or_else(|| EngineError::NotFound(format!("order {order_id}")))?;
    Ok(order)
}

/// `pending -> paid`. The order must already be locked by `tx`.
pub(crate) async fn mark_paid(tx: &mut Transaction<'_, Postgres>, order: &mut Order) -> Result<()> {
    if order.status != OrderStatus::Pending {
        return Ok(());
    }
    let paid_at = sqlx::query_scalar::<_, chrono::DateTime<chrono::Utc>>(
        r#"UPDATE orders SET status = $2, paid_at = NOW() WHERE id = $1 RETURNING paid_at"#,
    )
    .bind(order.id)
    .bind(OrderStatus::Paid.as_str())
    .fetch_one(tx.as_mut())
    .await?;

    order.status = OrderStatus::Paid;
    order.paid_at = Some(paid_at);
    info!(order_id = %order.id, "order paid");
    Ok(())
}

/// `paid -> delivered`.
pub async fn mark_delivered(pool: &PgPool, order_id: Uuid) -> Result<Order> {
    let mut tx = pool.begin().await?;
    let order = lock(&mut tx, order_id).await?;
    if order.status != OrderStatus::Paid {
        return Err(EngineError::InvalidState(format!(
            "order {order_id} is {}, only paid orders can be delivered",
            order.status
        ))
        .into());
    }

    let order = sqlx::query_as::<_, Order>(&format!(
        "UPDATE orders SET status = $2 WHERE id = $1 RETURNING {ORDER_COLUMNS}"
    ))
    .bind(order_id)
    .bind(OrderStatus::Delivered.as_str())
    .fetch_one(tx.as_mut())
    .await?;
    tx.commit().await?;
    Ok(order)
}
