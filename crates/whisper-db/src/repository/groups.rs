//! Group repository — lifecycle, membership, roles.
//!
//! Membership mutations run in one transaction so a concurrent send observes
//! the group either before or after a change, never mid-delta.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct GroupRow {
    pub group_id: Uuid,
    pub title: String,
    pub creator_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct GroupMemberRow {
    pub group_id: Uuid,
    pub whisper_id: String,
    pub role: String,
    pub joined_at: DateTime<Utc>,
    pub removed_at: Option<DateTime<Utc>>,
}

/// Create a group: creator becomes owner, every listed id becomes a member.
pub async fn create(
    pool: &PgPool,
    group_id: Uuid,
    title: &str,
    creator_id: &str,
    member_ids: &[&str],
) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;

    sqlx::query("INSERT INTO groups (group_id, title, creator_id) VALUES ($1, $2, $3)")
        .bind(group_id)
        .bind(title)
        .bind(creator_id)
        .execute(&mut *tx)
        .await?;

    sqlx::query("INSERT INTO group_members (group_id, whisper_id, role) VALUES ($1, $2, 'owner')")
        .bind(group_id)
        .bind(creator_id)
        .execute(&mut *tx)
        .await?;

    for member in member_ids {
        sqlx::query(
            "INSERT INTO group_members (group_id, whisper_id, role) VALUES ($1, $2, 'member')",
        )
        .bind(group_id)
        .bind(member)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await
}

pub async fn find(pool: &PgPool, group_id: Uuid) -> Result<Option<GroupRow>, sqlx::Error> {
    sqlx::query_as::<_, GroupRow>("SELECT * FROM groups WHERE group_id = $1")
        .bind(group_id)
        .fetch_optional(pool)
        .await
}

/// All active members, owner first then by join time.
pub async fn active_members(
    pool: &PgPool,
    group_id: Uuid,
) -> Result<Vec<GroupMemberRow>, sqlx::Error> {
    sqlx::query_as::<_, GroupMemberRow>(
        r#"
        SELECT * FROM group_members
        WHERE group_id = $1 AND removed_at IS NULL
        ORDER BY (role = 'owner') DESC, joined_at
        "#,
    )
    .bind(group_id)
    .fetch_all(pool)
    .await
}

/// Role of an active member, `None` for strangers and removed members.
pub async fn member_role(
    pool: &PgPool,
    group_id: Uuid,
    whisper_id: &str,
) -> Result<Option<String>, sqlx::Error> {
    let row: Option<(String,)> = sqlx::query_as(
        "SELECT role FROM group_members WHERE group_id = $1 AND whisper_id = $2 AND removed_at IS NULL",
    )
    .bind(group_id)
    .bind(whisper_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|(r,)| r))
}

/// Membership/title delta applied in one transaction.
pub struct GroupDelta<'a> {
    pub title: Option<&'a str>,
    pub add_members: &'a [&'a str],
    pub remove_members: &'a [&'a str],
    /// (whisperId, role) pairs; role ∈ {admin, member}. Idempotent.
    pub role_changes: &'a [(&'a str, &'a str)],
    /// Active-member ceiling checked after adds.
    pub max_members: i64,
}

/// Errors a delta can hit beyond sqlx failures.
#[derive(Debug, thiserror::Error)]
pub enum GroupUpdateError {
    #[error("group member limit exceeded")]
    TooManyMembers,
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

/// Apply a validated delta. Re-adding a removed member reactivates the row
/// with a fresh join time and plain member role; removing sets `removed_at`.
pub async fn apply_delta(
    pool: &PgPool,
    group_id: Uuid,
    delta: GroupDelta<'_>,
) -> Result<(), GroupUpdateError> {
    let mut tx = pool.begin().await?;

    if let Some(title) = delta.title {
        sqlx::query("UPDATE groups SET title = $2 WHERE group_id = $1")
            .bind(group_id)
            .bind(title)
            .execute(&mut *tx)
            .await?;
    }

    for member in delta.add_members {
        sqlx::query(
            r#"
            INSERT INTO group_members (group_id, whisper_id, role)
            VALUES ($1, $2, 'member')
            ON CONFLICT (group_id, whisper_id) DO UPDATE SET
                removed_at = NULL,
                role = 'member',
                joined_at = NOW()
            "#,
        )
        .bind(group_id)
        .bind(member)
        .execute(&mut *tx)
        .await?;
    }

    for member in delta.remove_members {
        sqlx::query(
            r#"
            UPDATE group_members SET removed_at = NOW()
            WHERE group_id = $1 AND whisper_id = $2 AND removed_at IS NULL AND role <> 'owner'
            "#,
        )
        .bind(group_id)
        .bind(member)
        .execute(&mut *tx)
        .await?;
    }

    for (member, role) in delta.role_changes {
        sqlx::query(
            r#"
            UPDATE group_members SET role = $3
            WHERE group_id = $1 AND whisper_id = $2 AND removed_at IS NULL AND role <> 'owner'
            "#,
        )
        .bind(group_id)
        .bind(member)
        .bind(role)
        .execute(&mut *tx)
        .await?;
    }

    let (active,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM group_members WHERE group_id = $1 AND removed_at IS NULL AND role <> 'owner'",
    )
    .bind(group_id)
    .fetch_one(&mut *tx)
    .await?;
    if active > delta.max_members {
        tx.rollback().await?;
        return Err(GroupUpdateError::TooManyMembers);
    }

    tx.commit().await?;
    Ok(())
}
