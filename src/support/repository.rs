// Repository pattern - isolates all ticket storage side effects
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, OptionalExtension, Row};

use super::domain::{EmailAddress, StaffRole};
use super::stats::{self, MessageTotals, StaffActivity, SupportStats, TicketTotals};
use crate::db::models::{StaffLink, Ticket, TicketMessage, User};
use crate::db::{immediate_transaction, RepositoryError};
use crate::gateway::{Attachment, MediaKind, MessageKind, Payload, Sender};
use crate::ids::{MessageId, ThreadId, TicketId, TicketMessageId, UserId};
use crate::state::DbPool;

#[derive(Debug, Clone)]
pub struct NewTicket {
    pub user_id: UserId,
    pub email: EmailAddress,
    pub payload: Payload,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub ticket_id: TicketId,
    pub sender_id: UserId,
    /// `None` for the attendee, the staff role otherwise
    pub role: Option<StaffRole>,
    pub payload: Payload,
}

#[derive(Debug, Clone)]
pub struct CreatedTicket {
    pub ticket: Ticket,
    pub first_message: TicketMessage,
    /// Open tickets of the same user that were force-closed
    pub closed: Vec<TicketId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusFilter {
    Open,
    Closed,
}

#[derive(Debug, Clone, Default)]
pub struct TicketQuery {
    /// Substring of the initial message or the owner's name
    pub text: Option<String>,
    pub user: Option<UserId>,
    pub status: Option<StatusFilter>,
    pub limit: Option<usize>,
}

#[async_trait]
pub trait SupportRepository: Send + Sync {
    /// Create or refresh the user's profile and bump last activity
    async fn upsert_user(&self, sender: &Sender, now: DateTime<Utc>) -> Result<(), RepositoryError>;

    async fn get_user(&self, id: UserId) -> Result<Option<User>, RepositoryError>;

    /// Append to the audit trail
    async fn log_action(
        &self,
        user: UserId,
        action: &str,
        details: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError>;

    /// Atomically close the user's open tickets, insert the new ticket and its first message
    async fn create_ticket(
        &self,
        ticket: &NewTicket,
        now: DateTime<Utc>,
    ) -> Result<CreatedTicket, RepositoryError>;

    /// Returns false when the ticket was already closed or does not exist
    async fn close_ticket(&self, id: TicketId, now: DateTime<Utc>) -> Result<bool, RepositoryError>;

    async fn get_ticket(&self, id: TicketId) -> Result<Option<Ticket>, RepositoryError>;

    async fn find_open_by_user(&self, user: UserId) -> Result<Option<Ticket>, RepositoryError>;

    async fn find_by_thread(&self, thread: ThreadId) -> Result<Option<Ticket>, RepositoryError>;

    async fn set_staff_link(&self, id: TicketId, link: StaffLink) -> Result<(), RepositoryError>;

    async fn open_tickets(&self) -> Result<Vec<Ticket>, RepositoryError>;

    async fn search(&self, query: &TicketQuery) -> Result<Vec<Ticket>, RepositoryError>;

    /// Append a message to an open ticket and bump the matching timestamp
    async fn append_message(
        &self,
        message: &NewMessage,
        now: DateTime<Utc>,
    ) -> Result<TicketMessage, RepositoryError>;

    /// Remember where a stored message was relayed to
    async fn set_relay_link(
        &self,
        id: TicketMessageId,
        relayed: MessageId,
    ) -> Result<(), RepositoryError>;

    /// Chronological page of a ticket's messages
    async fn list_messages(
        &self,
        ticket: TicketId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<TicketMessage>, RepositoryError>;

    /// The newest `count` messages, oldest first
    async fn recent_messages(
        &self,
        ticket: TicketId,
        count: usize,
    ) -> Result<Vec<TicketMessage>, RepositoryError>;

    async fn count_messages(&self, ticket: TicketId) -> Result<i64, RepositoryError>;

    async fn stats(&self, now: DateTime<Utc>) -> Result<SupportStats, RepositoryError>;
}

const TICKET_COLUMNS: &str = "t.id, t.user_id, t.email, t.message, t.is_closed, t.created_at, \
     t.closed_at, t.last_user_message_at, t.last_staff_response_at, t.thread_id, t.anchor_message_id";

const MESSAGE_COLUMNS: &str = "id, ticket_id, user_id, is_staff, is_admin, body, photo_file_id, \
     document_file_id, video_file_id, kind, relay_message_id, created_at";

fn ticket_from_row(row: &Row<'_>) -> rusqlite::Result<Ticket> {
    let thread_id: Option<ThreadId> = row.get(9)?;
    let anchor: Option<MessageId> = row.get(10)?;
    Ok(Ticket {
        id: row.get(0)?,
        user_id: row.get(1)?,
        email: row.get(2)?,
        message: row.get(3)?,
        is_closed: row.get(4)?,
        created_at: row.get(5)?,
        closed_at: row.get(6)?,
        last_user_message_at: row.get(7)?,
        last_staff_response_at: row.get(8)?,
        staff_link: anchor.map(|anchor_message_id| StaffLink {
            thread_id,
            anchor_message_id,
        }),
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<TicketMessage> {
    let photo: Option<String> = row.get(6)?;
    let document: Option<String> = row.get(7)?;
    let video: Option<String> = row.get(8)?;
    let attachment = photo
        .map(|f| Attachment::new(MediaKind::Photo, f))
        .or_else(|| document.map(|f| Attachment::new(MediaKind::Document, f)))
        .or_else(|| video.map(|f| Attachment::new(MediaKind::Video, f)));

    let kind: MessageKind = row
        .get::<_, String>(9)?
        .parse()
        .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(9, Type::Text, e.into()))?;

    Ok(TicketMessage {
        id: row.get(0)?,
        ticket_id: row.get(1)?,
        sender_id: row.get(2)?,
        is_staff: row.get(3)?,
        is_admin: row.get(4)?,
        payload: Payload {
            text: row.get(5)?,
            attachment,
        },
        kind,
        relay_message_id: row.get(10)?,
        created_at: row.get(11)?,
    })
}

/// Column values for the three media slots of a message row
fn media_columns(payload: &Payload) -> (Option<&str>, Option<&str>, Option<&str>) {
    match &payload.attachment {
        Some(a) => match a.kind {
            MediaKind::Photo => (Some(a.file_ref.as_str()), None, None),
            MediaKind::Document => (None, Some(a.file_ref.as_str()), None),
            MediaKind::Video => (None, None, Some(a.file_ref.as_str())),
        },
        None => (None, None, None),
    }
}

fn insert_message(
    conn: &rusqlite::Connection,
    message: &NewMessage,
    now: DateTime<Utc>,
) -> Result<TicketMessage, RepositoryError> {
    let (photo, document, video) = media_columns(&message.payload);
    let is_staff = message.role.is_some();
    let is_admin = message.role.is_some_and(StaffRole::is_admin);

    conn.execute(
        "INSERT INTO ticket_messages
            (ticket_id, user_id, is_staff, is_admin, body, photo_file_id, document_file_id,
             video_file_id, kind, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            message.ticket_id,
            message.sender_id,
            is_staff,
            is_admin,
            message.payload.text,
            photo,
            document,
            video,
            message.payload.kind().as_str(),
            now,
        ],
    )?;

    Ok(TicketMessage {
        id: TicketMessageId(conn.last_insert_rowid()),
        ticket_id: message.ticket_id,
        sender_id: message.sender_id,
        is_staff,
        is_admin,
        payload: message.payload.clone(),
        kind: message.payload.kind(),
        relay_message_id: None,
        created_at: now,
    })
}

/// SQLite implementation
pub struct SqliteSupportRepository {
    pool: DbPool,
}

impl SqliteSupportRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn query_tickets(
        &self,
        sql: &str,
        values: Vec<Value>,
    ) -> Result<Vec<Ticket>, RepositoryError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(sql)?;
        let tickets = stmt
            .query_map(params_from_iter(values), ticket_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tickets)
    }

    fn query_ticket(&self, filter: &str, value: i64) -> Result<Option<Ticket>, RepositoryError> {
        let sql = format!(
            "SELECT {TICKET_COLUMNS} FROM tickets t WHERE {filter} ORDER BY t.created_at DESC, t.id DESC LIMIT 1"
        );
        Ok(self.query_tickets(&sql, vec![Value::Integer(value)])?.pop())
    }
}

#[async_trait]
impl SupportRepository for SqliteSupportRepository {
    async fn upsert_user(&self, sender: &Sender, now: DateTime<Utc>) -> Result<(), RepositoryError> {
        let conn = self.pool.get()?;

        conn.execute(
            "INSERT INTO users (id, username, display_name, locale, created_at, last_activity)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT(id) DO UPDATE SET
               username = excluded.username,
               display_name = excluded.display_name,
               locale = excluded.locale,
               last_activity = excluded.last_activity",
            params![
                sender.id,
                sender.username,
                sender.display_name,
                sender.locale,
                now
            ],
        )?;

        Ok(())
    }

    async fn get_user(&self, id: UserId) -> Result<Option<User>, RepositoryError> {
        let conn = self.pool.get()?;

        let user = conn
            .query_row(
                "SELECT id, username, display_name, locale, created_at, last_activity
                 FROM users WHERE id = ?1",
                params![id],
                |row| {
                    Ok(User {
                        id: row.get(0)?,
                        username: row.get(1)?,
                        display_name: row.get(2)?,
                        locale: row.get(3)?,
                        created_at: row.get(4)?,
                        last_activity: row.get(5)?,
                    })
                },
            )
            .optional()?;

        Ok(user)
    }

    async fn log_action(
        &self,
        user: UserId,
        action: &str,
        details: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let conn = self.pool.get()?;

        let details = details.map(|d| serde_json::to_string(&d)).transpose()?;
        conn.execute(
            "INSERT INTO action_log (user_id, action, details, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![user, action, details, now],
        )?;

        Ok(())
    }

    async fn create_ticket(
        &self,
        ticket: &NewTicket,
        now: DateTime<Utc>,
    ) -> Result<CreatedTicket, RepositoryError> {
        let conn = self.pool.get()?;

        immediate_transaction(&conn, |conn| {
            // The owner normally exists already; keep the foreign key satisfied regardless
            conn.execute(
                "INSERT OR IGNORE INTO users (id, display_name, created_at, last_activity)
                 VALUES (?1, '', ?2, ?2)",
                params![ticket.user_id, now],
            )?;

            let closed: Vec<TicketId> = {
                let mut stmt =
                    conn.prepare("SELECT id FROM tickets WHERE user_id = ?1 AND is_closed = 0")?;
                let ids = stmt
                    .query_map(params![ticket.user_id], |row| row.get(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                ids
            };
            conn.execute(
                "UPDATE tickets SET is_closed = 1, closed_at = ?2
                 WHERE user_id = ?1 AND is_closed = 0",
                params![ticket.user_id, now],
            )?;

            conn.execute(
                "INSERT INTO tickets (user_id, email, message, is_closed, created_at, last_user_message_at)
                 VALUES (?1, ?2, ?3, 0, ?4, ?4)",
                params![
                    ticket.user_id,
                    ticket.email.as_str(),
                    ticket.payload.text_or_empty(),
                    now
                ],
            )?;
            let id = TicketId(conn.last_insert_rowid());

            let first_message = insert_message(
                conn,
                &NewMessage {
                    ticket_id: id,
                    sender_id: ticket.user_id,
                    role: None,
                    payload: ticket.payload.clone(),
                },
                now,
            )?;

            Ok(CreatedTicket {
                ticket: Ticket {
                    id,
                    user_id: ticket.user_id,
                    email: ticket.email.as_str().to_string(),
                    message: ticket.payload.text_or_empty().to_string(),
                    is_closed: false,
                    created_at: now,
                    closed_at: None,
                    last_user_message_at: Some(now),
                    last_staff_response_at: None,
                    staff_link: None,
                },
                first_message,
                closed,
            })
        })
    }

    async fn close_ticket(&self, id: TicketId, now: DateTime<Utc>) -> Result<bool, RepositoryError> {
        let conn = self.pool.get()?;

        let rows = conn.execute(
            "UPDATE tickets SET is_closed = 1, closed_at = ?2 WHERE id = ?1 AND is_closed = 0",
            params![id, now],
        )?;

        Ok(rows > 0)
    }

    async fn get_ticket(&self, id: TicketId) -> Result<Option<Ticket>, RepositoryError> {
        self.query_ticket("t.id = ?1", id.get())
    }

    async fn find_open_by_user(&self, user: UserId) -> Result<Option<Ticket>, RepositoryError> {
        self.query_ticket("t.user_id = ?1 AND t.is_closed = 0", user.get())
    }

    async fn find_by_thread(&self, thread: ThreadId) -> Result<Option<Ticket>, RepositoryError> {
        self.query_ticket("t.thread_id = ?1", thread.get())
    }

    async fn set_staff_link(&self, id: TicketId, link: StaffLink) -> Result<(), RepositoryError> {
        let conn = self.pool.get()?;

        let rows = conn.execute(
            "UPDATE tickets SET thread_id = ?2, anchor_message_id = ?3 WHERE id = ?1",
            params![id, link.thread_id, link.anchor_message_id],
        )?;
        if rows == 0 {
            return Err(RepositoryError::NotFound(format!("ticket {id}")));
        }

        Ok(())
    }

    async fn open_tickets(&self) -> Result<Vec<Ticket>, RepositoryError> {
        self.query_tickets(
            &format!(
                "SELECT {TICKET_COLUMNS} FROM tickets t WHERE t.is_closed = 0 ORDER BY t.created_at"
            ),
            Vec::new(),
        )
    }

    async fn search(&self, query: &TicketQuery) -> Result<Vec<Ticket>, RepositoryError> {
        let mut sql = format!(
            "SELECT {TICKET_COLUMNS} FROM tickets t LEFT JOIN users u ON u.id = t.user_id WHERE 1 = 1"
        );
        let mut values = Vec::new();

        if let Some(text) = query.text.as_deref().filter(|t| !t.trim().is_empty()) {
            values.push(Value::Text(format!("%{}%", text.trim())));
            let n = values.len();
            sql.push_str(&format!(
                " AND (t.message LIKE ?{n} OR u.display_name LIKE ?{n} OR u.username LIKE ?{n})"
            ));
        }
        if let Some(user) = query.user {
            values.push(Value::Integer(user.get()));
            sql.push_str(&format!(" AND t.user_id = ?{}", values.len()));
        }
        match query.status {
            Some(StatusFilter::Open) => sql.push_str(" AND t.is_closed = 0"),
            Some(StatusFilter::Closed) => sql.push_str(" AND t.is_closed = 1"),
            None => {}
        }
        sql.push_str(" ORDER BY t.created_at DESC, t.id DESC");
        values.push(Value::Integer(query.limit.unwrap_or(50) as i64));
        sql.push_str(&format!(" LIMIT ?{}", values.len()));

        self.query_tickets(&sql, values)
    }

    async fn append_message(
        &self,
        message: &NewMessage,
        now: DateTime<Utc>,
    ) -> Result<TicketMessage, RepositoryError> {
        let conn = self.pool.get()?;

        immediate_transaction(&conn, |conn| {
            let closed: Option<bool> = conn
                .query_row(
                    "SELECT is_closed FROM tickets WHERE id = ?1",
                    params![message.ticket_id],
                    |row| row.get(0),
                )
                .optional()?;
            match closed {
                None => {
                    return Err(RepositoryError::NotFound(format!(
                        "ticket {}",
                        message.ticket_id
                    )))
                }
                Some(true) => {
                    return Err(RepositoryError::Conflict(format!(
                        "ticket {} is closed",
                        message.ticket_id
                    )))
                }
                Some(false) => {}
            }

            let stored = insert_message(conn, message, now)?;
            let column = if message.role.is_some() {
                "last_staff_response_at"
            } else {
                "last_user_message_at"
            };
            conn.execute(
                &format!("UPDATE tickets SET {column} = ?2 WHERE id = ?1"),
                params![message.ticket_id, now],
            )?;
            Ok(stored)
        })
    }

    async fn set_relay_link(
        &self,
        id: TicketMessageId,
        relayed: MessageId,
    ) -> Result<(), RepositoryError> {
        let conn = self.pool.get()?;

        conn.execute(
            "UPDATE ticket_messages SET relay_message_id = ?2
             WHERE id = ?1 AND relay_message_id IS NULL",
            params![id, relayed],
        )?;

        Ok(())
    }

    async fn list_messages(
        &self,
        ticket: TicketId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<TicketMessage>, RepositoryError> {
        let conn = self.pool.get()?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM ticket_messages
             WHERE ticket_id = ?1 ORDER BY created_at, id LIMIT ?2 OFFSET ?3"
        ))?;
        let messages = stmt
            .query_map(
                params![ticket, limit as i64, offset as i64],
                message_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(messages)
    }

    async fn recent_messages(
        &self,
        ticket: TicketId,
        count: usize,
    ) -> Result<Vec<TicketMessage>, RepositoryError> {
        let conn = self.pool.get()?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM ticket_messages
             WHERE ticket_id = ?1 ORDER BY created_at DESC, id DESC LIMIT ?2"
        ))?;
        let mut messages = stmt
            .query_map(params![ticket, count as i64], message_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        messages.reverse();

        Ok(messages)
    }

    async fn count_messages(&self, ticket: TicketId) -> Result<i64, RepositoryError> {
        let conn = self.pool.get()?;

        let count = conn.query_row(
            "SELECT COUNT(*) FROM ticket_messages WHERE ticket_id = ?1",
            params![ticket],
            |row| row.get(0),
        )?;

        Ok(count)
    }

    async fn stats(&self, now: DateTime<Utc>) -> Result<SupportStats, RepositoryError> {
        let conn = self.pool.get()?;

        let today_start = now
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc())
            .unwrap_or(now);
        let week_ago = now - Duration::days(7);
        let month_ago = now - Duration::days(30);

        let count_since = |since: DateTime<Utc>| -> rusqlite::Result<i64> {
            conn.query_row(
                "SELECT COUNT(*) FROM tickets WHERE created_at >= ?1",
                params![since],
                |row| row.get(0),
            )
        };

        let (total, open): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(CASE WHEN is_closed = 0 THEN 1 ELSE 0 END), 0)
             FROM tickets",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let tickets = TicketTotals {
            total,
            open,
            closed: total - open,
            today: count_since(today_start)?,
            week: count_since(week_ago)?,
            month: count_since(month_ago)?,
        };

        let messages = conn.query_row(
            "SELECT COALESCE(SUM(CASE WHEN is_staff = 0 THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN is_staff = 1 THEN 1 ELSE 0 END), 0)
             FROM ticket_messages",
            [],
            |row| {
                Ok(MessageTotals {
                    from_users: row.get(0)?,
                    from_staff: row.get(1)?,
                })
            },
        )?;

        let response_pairs: Vec<(DateTime<Utc>, DateTime<Utc>)> = {
            let mut stmt = conn.prepare(
                "SELECT t.created_at,
                        (SELECT MIN(m.created_at) FROM ticket_messages m
                         WHERE m.ticket_id = t.id AND m.is_staff = 1) AS first_reply
                 FROM tickets t
                 WHERE t.created_at >= ?1 AND first_reply IS NOT NULL",
            )?;
            let pairs = stmt
                .query_map(params![week_ago], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            pairs
        };

        let staff: Vec<StaffActivity> = {
            let mut stmt = conn.prepare(
                "SELECT m.user_id, u.display_name, MAX(m.is_admin), COUNT(*) AS n
                 FROM ticket_messages m LEFT JOIN users u ON u.id = m.user_id
                 WHERE m.is_staff = 1
                 GROUP BY m.user_id ORDER BY n DESC",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(StaffActivity {
                        user_id: row.get(0)?,
                        display_name: row.get(1)?,
                        is_admin: row.get(2)?,
                        messages: row.get(3)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        let (created, closed) = {
            let mut stmt = conn.prepare("SELECT created_at FROM tickets WHERE created_at >= ?1")?;
            let created = stmt
                .query_map(params![week_ago], |row| row.get(0))?
                .collect::<Result<Vec<DateTime<Utc>>, _>>()?;
            let mut stmt = conn.prepare("SELECT closed_at FROM tickets WHERE closed_at >= ?1")?;
            let closed = stmt
                .query_map(params![week_ago], |row| row.get(0))?
                .collect::<Result<Vec<DateTime<Utc>>, _>>()?;
            (created, closed)
        };

        Ok(SupportStats {
            tickets,
            messages,
            avg_response_minutes: stats::average_response_minutes(&response_pairs),
            staff,
            daily: stats::daily_metrics(&created, &closed, now, 7),
        })
    }
}
