//! PostgreSQL store backend.
//!
//! Queries are plain runtime `sqlx::query_as` calls over tuples, so the
//! crate builds without a live database. The schema lives in
//! `migrations/` and is applied by [`PostgresStore::connect`].

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

use super::{ChatStore, InvitationStore, MembershipStore, TripStore, UserStore};
use crate::domain::{
    ChatMessage, CursorUpdate, Destination, Invitation, InvitationId, InvitationStatus,
    MemberRole, Membership, MembershipStatus, MessageId, Reaction, ReadCursor, Trip, TripId,
    TripStatus, User, UserId, ensure_owner_survives,
};
use crate::error::AppError;

type UserRow = (
    Uuid,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    Option<DateTime<Utc>>,
    bool,
);

type TripRow = (
    Uuid,
    String,
    String,
    serde_json::Value,
    DateTime<Utc>,
    DateTime<Utc>,
    String,
    Uuid,
    DateTime<Utc>,
    DateTime<Utc>,
);

type MembershipRow = (Uuid, Uuid, String, String, DateTime<Utc>, DateTime<Utc>);

type MessageRow = (Uuid, Uuid, Uuid, String, String, Option<Uuid>, DateTime<Utc>);

type InvitationRow = (
    Uuid,
    Uuid,
    Uuid,
    String,
    Option<Uuid>,
    String,
    String,
    Option<String>,
    DateTime<Utc>,
    DateTime<Utc>,
    DateTime<Utc>,
);

const USER_COLUMNS: &str =
    "id, subject, email, username, display_name, avatar_url, last_seen_at, is_online";
const TRIP_COLUMNS: &str = "id, name, description, destination, start_date, end_date, status, \
                            created_by, created_at, updated_at";
const MEMBERSHIP_COLUMNS: &str = "trip_id, user_id, role, status, created_at, updated_at";
const MESSAGE_COLUMNS: &str =
    "id, trip_id, sender_id, content, content_type, reply_to_id, created_at";
const INVITATION_COLUMNS: &str = "id, trip_id, inviter_id, invitee_email, invitee_id, role, \
                                  status, token, expires_at, created_at, updated_at";

fn db_err(e: sqlx::Error) -> AppError {
    AppError::Persistence(e.to_string())
}

fn user_from_row(row: UserRow) -> User {
    let (id, subject, email, username, display_name, avatar_url, last_seen_at, is_online) = row;
    User {
        id: UserId::from_uuid(id),
        subject,
        email,
        username,
        display_name,
        avatar_url,
        last_seen_at,
        is_online,
    }
}

fn trip_from_row(row: TripRow) -> Result<Trip, AppError> {
    let (
        id,
        name,
        description,
        destination,
        start_date,
        end_date,
        status,
        created_by,
        created_at,
        updated_at,
    ) = row;
    let destination: Destination = serde_json::from_value(destination)
        .map_err(|e| AppError::Persistence(format!("corrupt destination for trip {id}: {e}")))?;
    Ok(Trip {
        id: TripId::from_uuid(id),
        name,
        description,
        destination,
        start_date,
        end_date,
        status: status.parse()?,
        created_by: UserId::from_uuid(created_by),
        created_at,
        updated_at,
    })
}

fn parse_membership_status(raw: &str) -> Result<MembershipStatus, AppError> {
    match raw {
        "ACTIVE" => Ok(MembershipStatus::Active),
        "INACTIVE" => Ok(MembershipStatus::Inactive),
        other => Err(AppError::Persistence(format!(
            "unknown membership status: {other}"
        ))),
    }
}

fn membership_from_row(row: MembershipRow) -> Result<Membership, AppError> {
    let (trip_id, user_id, role, status, created_at, updated_at) = row;
    Ok(Membership {
        trip_id: TripId::from_uuid(trip_id),
        user_id: UserId::from_uuid(user_id),
        role: role.parse()?,
        status: parse_membership_status(&status)?,
        created_at,
        updated_at,
    })
}

fn message_from_row(row: MessageRow) -> ChatMessage {
    let (id, trip_id, sender_id, content, content_type, reply_to_id, created_at) = row;
    ChatMessage {
        id: MessageId::from_uuid(id),
        trip_id: TripId::from_uuid(trip_id),
        sender_id: UserId::from_uuid(sender_id),
        content,
        content_type,
        reply_to_id: reply_to_id.map(MessageId::from_uuid),
        created_at,
    }
}

fn invitation_from_row(row: InvitationRow) -> Result<Invitation, AppError> {
    let (
        id,
        trip_id,
        inviter_id,
        invitee_email,
        invitee_id,
        role,
        status,
        token,
        expires_at,
        created_at,
        updated_at,
    ) = row;
    Ok(Invitation {
        id: InvitationId::from_uuid(id),
        trip_id: TripId::from_uuid(trip_id),
        inviter_id: UserId::from_uuid(inviter_id),
        invitee_email,
        invitee_id: invitee_id.map(UserId::from_uuid),
        role: role.parse()?,
        status: status.parse()?,
        token,
        expires_at,
        created_at,
        updated_at,
    })
}

/// PostgreSQL-backed store using `sqlx::PgPool`.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Wraps an existing pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Opens a pool and applies pending migrations.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Persistence`] if the database is unreachable or
    /// a migration fails.
    pub async fn connect(
        url: &str,
        max_connections: u32,
        min_connections: u32,
        connect_timeout: Duration,
    ) -> Result<Self, AppError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(connect_timeout)
            .connect(url)
            .await
            .map_err(db_err)?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| AppError::Persistence(format!("migration failed: {e}")))?;
        tracing::info!(max_connections, "postgres store ready");
        Ok(Self { pool })
    }
}

#[async_trait]
impl UserStore for PostgresStore {
    async fn get_user(&self, id: UserId) -> Result<Option<User>, AppError> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.map(user_from_row))
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, AppError> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE LOWER(email) = LOWER($1)"
        ))
        .bind(email.trim())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.map(user_from_row))
    }

    async fn find_user_by_subject(&self, subject: &str) -> Result<Option<User>, AppError> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE subject = $1"
        ))
        .bind(subject)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.map(user_from_row))
    }
}

#[async_trait]
impl TripStore for PostgresStore {
    async fn get_trip(&self, id: TripId) -> Result<Option<Trip>, AppError> {
        let row = sqlx::query_as::<_, TripRow>(&format!(
            "SELECT {TRIP_COLUMNS} FROM trips WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(trip_from_row).transpose()
    }

    async fn compare_and_set_trip_status(
        &self,
        id: TripId,
        from: TripStatus,
        to: TripStatus,
    ) -> Result<Trip, AppError> {
        let row = sqlx::query_as::<_, TripRow>(&format!(
            "UPDATE trips SET status = $3, updated_at = NOW() \
             WHERE id = $1 AND status = $2 RETURNING {TRIP_COLUMNS}"
        ))
        .bind(id.as_uuid())
        .bind(from.as_str())
        .bind(to.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        match row {
            Some(row) => trip_from_row(row),
            None => {
                let current = self
                    .get_trip(id)
                    .await?
                    .ok_or_else(|| AppError::NotFound(format!("trip {id}")))?;
                Err(AppError::InvalidTransition {
                    from: current.status.to_string(),
                    to: to.to_string(),
                })
            }
        }
    }
}

#[async_trait]
impl MembershipStore for PostgresStore {
    async fn get_membership(
        &self,
        trip: TripId,
        user: UserId,
    ) -> Result<Option<Membership>, AppError> {
        let row = sqlx::query_as::<_, MembershipRow>(&format!(
            "SELECT {MEMBERSHIP_COLUMNS} FROM trip_memberships WHERE trip_id = $1 AND user_id = $2"
        ))
        .bind(trip.as_uuid())
        .bind(user.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(membership_from_row).transpose()
    }

    async fn list_members(&self, trip: TripId) -> Result<Vec<Membership>, AppError> {
        let rows = sqlx::query_as::<_, MembershipRow>(&format!(
            "SELECT {MEMBERSHIP_COLUMNS} FROM trip_memberships WHERE trip_id = $1 ORDER BY created_at"
        ))
        .bind(trip.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter().map(membership_from_row).collect()
    }

    async fn list_active_trips(&self, user: UserId) -> Result<Vec<TripId>, AppError> {
        let rows = sqlx::query_scalar::<_, Uuid>(
            "SELECT trip_id FROM trip_memberships \
             WHERE user_id = $1 AND status = 'ACTIVE' AND role <> 'NONE'",
        )
        .bind(user.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows.into_iter().map(TripId::from_uuid).collect())
    }

    async fn update_membership(
        &self,
        trip: TripId,
        user: UserId,
        role: MemberRole,
        status: MembershipStatus,
    ) -> Result<Membership, AppError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let rows = sqlx::query_as::<_, MembershipRow>(&format!(
            "SELECT {MEMBERSHIP_COLUMNS} FROM trip_memberships WHERE trip_id = $1 FOR UPDATE"
        ))
        .bind(trip.as_uuid())
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?;
        let members = rows
            .into_iter()
            .map(membership_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        if !members.iter().any(|m| m.user_id == user) {
            return Err(AppError::NotFound(format!("member {user} in trip {trip}")));
        }
        ensure_owner_survives(&members, user, role, status)?;

        let row = sqlx::query_as::<_, MembershipRow>(&format!(
            "UPDATE trip_memberships SET role = $3, status = $4, updated_at = NOW() \
             WHERE trip_id = $1 AND user_id = $2 RETURNING {MEMBERSHIP_COLUMNS}"
        ))
        .bind(trip.as_uuid())
        .bind(user.as_uuid())
        .bind(role.as_str())
        .bind(status.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        membership_from_row(row)
    }
}

#[async_trait]
impl ChatStore for PostgresStore {
    async fn insert_message(&self, message: &ChatMessage) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO chat_messages (id, trip_id, sender_id, content, content_type, reply_to_id, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) ON CONFLICT (id) DO NOTHING",
        )
        .bind(message.id.as_uuid())
        .bind(message.trip_id.as_uuid())
        .bind(message.sender_id.as_uuid())
        .bind(&message.content)
        .bind(&message.content_type)
        .bind(message.reply_to_id.map(|id| *id.as_uuid()))
        .bind(message.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_message(&self, id: MessageId) -> Result<Option<ChatMessage>, AppError> {
        let row = sqlx::query_as::<_, MessageRow>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM chat_messages WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.map(message_from_row))
    }

    async fn list_messages(
        &self,
        trip: TripId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ChatMessage>, AppError> {
        let rows = sqlx::query_as::<_, MessageRow>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM chat_messages WHERE trip_id = $1 \
             ORDER BY created_at DESC, id DESC LIMIT $2 OFFSET $3"
        ))
        .bind(trip.as_uuid())
        .bind(i64::from(limit))
        .bind(i64::from(offset))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows.into_iter().map(message_from_row).collect())
    }

    async fn latest_message_at(&self, trip: TripId) -> Result<Option<DateTime<Utc>>, AppError> {
        sqlx::query_scalar::<_, Option<DateTime<Utc>>>(
            "SELECT MAX(created_at) FROM chat_messages WHERE trip_id = $1",
        )
        .bind(trip.as_uuid())
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn add_reaction(&self, reaction: &Reaction) -> Result<bool, AppError> {
        let result = sqlx::query(
            "INSERT INTO chat_reactions (message_id, user_id, emoji) VALUES ($1, $2, $3) \
             ON CONFLICT DO NOTHING",
        )
        .bind(reaction.message_id.as_uuid())
        .bind(reaction.user_id.as_uuid())
        .bind(&reaction.emoji)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn remove_reaction(&self, reaction: &Reaction) -> Result<bool, AppError> {
        let result = sqlx::query(
            "DELETE FROM chat_reactions WHERE message_id = $1 AND user_id = $2 AND emoji = $3",
        )
        .bind(reaction.message_id.as_uuid())
        .bind(reaction.user_id.as_uuid())
        .bind(&reaction.emoji)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_reactions(&self, message: MessageId) -> Result<Vec<Reaction>, AppError> {
        let rows = sqlx::query_as::<_, (Uuid, Uuid, String)>(
            "SELECT message_id, user_id, emoji FROM chat_reactions WHERE message_id = $1 \
             ORDER BY created_at",
        )
        .bind(message.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows
            .into_iter()
            .map(|(message_id, user_id, emoji)| Reaction {
                message_id: MessageId::from_uuid(message_id),
                user_id: UserId::from_uuid(user_id),
                emoji,
            })
            .collect())
    }

    async fn advance_read_cursor(
        &self,
        trip: TripId,
        user: UserId,
        message: &ChatMessage,
    ) -> Result<CursorUpdate, AppError> {
        // Upsert that only overwrites an older position; RETURNING yields no
        // row when the stored cursor is already ahead.
        let advanced = sqlx::query_as::<_, (Uuid, DateTime<Utc>)>(
            "INSERT INTO chat_read_cursors (trip_id, user_id, last_read_message_id, last_read_at) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (trip_id, user_id) DO UPDATE \
             SET last_read_message_id = EXCLUDED.last_read_message_id, \
                 last_read_at = EXCLUDED.last_read_at \
             WHERE (chat_read_cursors.last_read_at, chat_read_cursors.last_read_message_id) \
                 < (EXCLUDED.last_read_at, EXCLUDED.last_read_message_id) \
             RETURNING last_read_message_id, last_read_at",
        )
        .bind(trip.as_uuid())
        .bind(user.as_uuid())
        .bind(message.id.as_uuid())
        .bind(message.created_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        let (advanced, (message_id, read_at)) = match advanced {
            Some(row) => (true, row),
            None => {
                let row = sqlx::query_as::<_, (Uuid, DateTime<Utc>)>(
                    "SELECT last_read_message_id, last_read_at FROM chat_read_cursors \
                     WHERE trip_id = $1 AND user_id = $2",
                )
                .bind(trip.as_uuid())
                .bind(user.as_uuid())
                .fetch_one(&self.pool)
                .await
                .map_err(db_err)?;
                (false, row)
            }
        };
        Ok(CursorUpdate {
            advanced,
            cursor: ReadCursor {
                trip_id: trip,
                user_id: user,
                last_read_message_id: MessageId::from_uuid(message_id),
                last_read_at: read_at,
            },
        })
    }
}

#[async_trait]
impl InvitationStore for PostgresStore {
    async fn insert_invitation(&self, invitation: &Invitation) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO trip_invitations \
             (id, trip_id, inviter_id, invitee_email, invitee_id, role, status, token, expires_at, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(invitation.id.as_uuid())
        .bind(invitation.trip_id.as_uuid())
        .bind(invitation.inviter_id.as_uuid())
        .bind(&invitation.invitee_email)
        .bind(invitation.invitee_id.map(|id| *id.as_uuid()))
        .bind(invitation.role.as_str())
        .bind(invitation.status.as_str())
        .bind(invitation.token.as_deref())
        .bind(invitation.expires_at)
        .bind(invitation.created_at)
        .bind(invitation.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(db) = &e {
                if db.is_unique_violation() {
                    return AppError::Conflict(format!(
                        "a pending invitation for {} already exists",
                        invitation.invitee_email
                    ));
                }
            }
            db_err(e)
        })?;
        Ok(())
    }

    async fn get_invitation(&self, id: InvitationId) -> Result<Option<Invitation>, AppError> {
        let row = sqlx::query_as::<_, InvitationRow>(&format!(
            "SELECT {INVITATION_COLUMNS} FROM trip_invitations WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(invitation_from_row).transpose()
    }

    async fn list_invitations(&self, trip: TripId) -> Result<Vec<Invitation>, AppError> {
        let rows = sqlx::query_as::<_, InvitationRow>(&format!(
            "SELECT {INVITATION_COLUMNS} FROM trip_invitations WHERE trip_id = $1 \
             ORDER BY created_at DESC"
        ))
        .bind(trip.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter().map(invitation_from_row).collect()
    }

    async fn accept_invitation(
        &self,
        id: InvitationId,
        user: UserId,
        now: DateTime<Utc>,
    ) -> Result<(Invitation, Membership), AppError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let row = sqlx::query_as::<_, InvitationRow>(&format!(
            "SELECT {INVITATION_COLUMNS} FROM trip_invitations WHERE id = $1 FOR UPDATE"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?
        .ok_or_else(|| AppError::NotFound(format!("invitation {id}")))?;
        let invitation = invitation_from_row(row)?;
        if invitation.status != InvitationStatus::Pending {
            return Err(AppError::NotPending(invitation.status));
        }

        let existing = sqlx::query_as::<_, MembershipRow>(&format!(
            "SELECT {MEMBERSHIP_COLUMNS} FROM trip_memberships \
             WHERE trip_id = $1 AND user_id = $2 FOR UPDATE"
        ))
        .bind(invitation.trip_id.as_uuid())
        .bind(user.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?
        .map(membership_from_row)
        .transpose()?;
        if existing.as_ref().is_some_and(Membership::is_effective) {
            return Err(AppError::AlreadyMember);
        }

        let membership_row = sqlx::query_as::<_, MembershipRow>(&format!(
            "INSERT INTO trip_memberships (trip_id, user_id, role, status, created_at, updated_at) \
             VALUES ($1, $2, $3, 'ACTIVE', $4, $4) \
             ON CONFLICT (trip_id, user_id) DO UPDATE \
             SET role = EXCLUDED.role, status = 'ACTIVE', updated_at = EXCLUDED.updated_at \
             RETURNING {MEMBERSHIP_COLUMNS}"
        ))
        .bind(invitation.trip_id.as_uuid())
        .bind(user.as_uuid())
        .bind(invitation.role.as_str())
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;

        let invitation_row = sqlx::query_as::<_, InvitationRow>(&format!(
            "UPDATE trip_invitations SET status = 'ACCEPTED', invitee_id = $2, updated_at = $3 \
             WHERE id = $1 RETURNING {INVITATION_COLUMNS}"
        ))
        .bind(id.as_uuid())
        .bind(user.as_uuid())
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok((
            invitation_from_row(invitation_row)?,
            membership_from_row(membership_row)?,
        ))
    }

    async fn finish_invitation(
        &self,
        id: InvitationId,
        to: InvitationStatus,
        now: DateTime<Utc>,
    ) -> Result<Invitation, AppError> {
        let row = sqlx::query_as::<_, InvitationRow>(&format!(
            "UPDATE trip_invitations SET status = $2, updated_at = $3 \
             WHERE id = $1 AND status = 'PENDING' RETURNING {INVITATION_COLUMNS}"
        ))
        .bind(id.as_uuid())
        .bind(to.as_str())
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        match row {
            Some(row) => invitation_from_row(row),
            None => {
                let current = self
                    .get_invitation(id)
                    .await?
                    .ok_or_else(|| AppError::NotFound(format!("invitation {id}")))?;
                Err(AppError::NotPending(current.status))
            }
        }
    }

    async fn expire_pending(&self, now: DateTime<Utc>) -> Result<u64, AppError> {
        let result = sqlx::query(
            "UPDATE trip_invitations SET status = 'EXPIRED', updated_at = $1 \
             WHERE status = 'PENDING' AND expires_at < $1",
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn membership_status_parsing() {
        assert_eq!(parse_membership_status("ACTIVE").ok(), Some(MembershipStatus::Active));
        assert!(parse_membership_status("BANNED").is_err());
    }

    #[test]
    fn invitation_row_maps_enums() {
        let now = Utc::now();
        let row: InvitationRow = (
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            "a@example.com".to_string(),
            None,
            "ADMIN".to_string(),
            "DECLINED".to_string(),
            None,
            now,
            now,
            now,
        );
        let parsed = invitation_from_row(row);
        let Ok(inv) = parsed else {
            panic!("row should parse");
        };
        assert_eq!(inv.role, MemberRole::Admin);
        assert_eq!(inv.status, InvitationStatus::Declined);
    }

    #[test]
    fn trip_row_with_bad_status_is_rejected() {
        let now = Utc::now();
        let row: TripRow = (
            Uuid::new_v4(),
            "Lisbon".to_string(),
            String::new(),
            serde_json::json!({}),
            now,
            now,
            "PAUSED".to_string(),
            Uuid::new_v4(),
            now,
            now,
        );
        assert!(trip_from_row(row).is_err());
    }
}
