//! Contact hints — "this recipient already knows that sender".
//!
//! Decides whether a forwarded envelope needs `senderEncPublicKey` attached.
//! Rows are written the first time the key is attached, so exactly the first
//! contact from a stranger carries the key.

use sqlx::PgPool;

pub async fn exists(pool: &PgPool, owner_id: &str, contact_id: &str) -> Result<bool, sqlx::Error> {
    let row: Option<(i64,)> =
        sqlx::query_as("SELECT 1 FROM contact_hints WHERE owner_id = $1 AND contact_id = $2")
            .bind(owner_id)
            .bind(contact_id)
            .fetch_optional(pool)
            .await?;
    Ok(row.is_some())
}

pub async fn record(pool: &PgPool, owner_id: &str, contact_id: &str) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO contact_hints (owner_id, contact_id)
        VALUES ($1, $2)
        ON CONFLICT (owner_id, contact_id) DO NOTHING
        "#,
    )
    .bind(owner_id)
    .bind(contact_id)
    .execute(pool)
    .await?;
    Ok(())
}
