// Ticket domain - pure rules, no I/O
use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;
use thiserror::Error;

use crate::config::StaffConfig;
use crate::db::models::Ticket;
use crate::ids::{TicketId, UserId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("'{0}' is not an e-mail address")]
pub struct InvalidEmail(pub String);

/// Contact address collected during ticket intake.
/// The check is deliberately loose: an '@' and a '.' somewhere.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EmailAddress(String);

impl EmailAddress {
    pub fn parse(raw: &str) -> Result<Self, InvalidEmail> {
        let trimmed = raw.trim();
        if trimmed.contains('@') && trimmed.contains('.') {
            Ok(Self(trimmed.to_string()))
        } else {
            Err(InvalidEmail(trimmed.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EmailAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StaffRole {
    Admin,
    Support,
}

impl StaffRole {
    /// Admin wins when an id is listed in both places
    pub fn of(staff: &StaffConfig, user: UserId) -> Option<Self> {
        if staff.is_admin(user) {
            Some(Self::Admin)
        } else if staff.is_support_staff(user) {
            Some(Self::Support)
        } else {
            None
        }
    }

    /// What the attendee sees instead of the staff member's name
    pub fn label(self) -> &'static str {
        match self {
            Self::Admin => "Администратор Поддержки",
            Self::Support => "Сотрудник Поддержки",
        }
    }

    pub fn emoji(self) -> &'static str {
        match self {
            Self::Admin => "👨‍💼",
            Self::Support => "🧑‍💼",
        }
    }

    pub fn is_admin(self) -> bool {
        self == Self::Admin
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketState {
    Open,
    Closed,
}

impl TicketState {
    pub fn of(ticket: &Ticket) -> Self {
        if ticket.is_closed {
            Self::Closed
        } else {
            Self::Open
        }
    }
}

static TICKET_REFERENCE: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"#(\d+)").ok());

/// How tickets are referenced in staff-facing text
pub fn ticket_reference(id: TicketId) -> String {
    format!("#{id}")
}

/// Callback payload of the close button on a ticket's staff post
pub const STAFF_CLOSE_PREFIX: &str = "staff_close_";

pub fn staff_close_payload(id: TicketId) -> String {
    format!("{STAFF_CLOSE_PREFIX}{id}")
}

/// Find the first `#<id>` in a staff-side message
pub fn parse_ticket_reference(text: &str) -> Option<TicketId> {
    let regex = TICKET_REFERENCE.as_ref()?;
    regex
        .captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .map(TicketId)
}

/// Open, waiting on staff, and the attendee's last word is older than `sla`
pub fn needs_attention(ticket: &Ticket, now: DateTime<Utc>, sla: Duration) -> bool {
    if ticket.is_closed {
        return false;
    }
    let Some(last_user) = ticket.last_user_message_at else {
        return false;
    };
    let unanswered = match ticket.last_staff_response_at {
        None => true,
        Some(last_staff) => last_user > last_staff,
    };
    unanswered && last_user < now - sla
}

/// Open, answered at least once, and silent on the attendee side since `cutoff`
pub fn is_stale(ticket: &Ticket, cutoff: DateTime<Utc>) -> bool {
    !ticket.is_closed
        && ticket.last_staff_response_at.is_some()
        && ticket.last_user_message_at.is_some_and(|t| t < cutoff)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ticket(
        last_user: Option<DateTime<Utc>>,
        last_staff: Option<DateTime<Utc>>,
    ) -> Ticket {
        Ticket {
            id: TicketId(1),
            user_id: UserId(1),
            email: "a@b.c".into(),
            message: "help".into(),
            is_closed: false,
            created_at: Utc.with_ymd_and_hms(2025, 7, 1, 0, 0, 0).unwrap(),
            closed_at: None,
            last_user_message_at: last_user,
            last_staff_response_at: last_staff,
            staff_link: None,
        }
    }

    #[test]
    fn email_needs_at_and_dot() {
        assert!(EmailAddress::parse("  fan@fest.ru ").is_ok());
        assert_eq!(EmailAddress::parse("fan@fest.ru").unwrap().as_str(), "fan@fest.ru");
        assert!(EmailAddress::parse("fan.fest.ru").is_err());
        assert!(EmailAddress::parse("fan@festru").is_err());
        assert!(EmailAddress::parse("").is_err());
    }

    #[test]
    fn admin_role_wins_over_support() {
        let staff = StaffConfig {
            admin_ids: vec![UserId(1)],
            support_staff_ids: vec![UserId(1), UserId(2)],
        };
        assert_eq!(StaffRole::of(&staff, UserId(1)), Some(StaffRole::Admin));
        assert_eq!(StaffRole::of(&staff, UserId(2)), Some(StaffRole::Support));
        assert_eq!(StaffRole::of(&staff, UserId(3)), None);
        assert_eq!(StaffRole::Admin.label(), "Администратор Поддержки");
        assert_eq!(StaffRole::Support.label(), "Сотрудник Поддержки");
    }

    #[test]
    fn ticket_reference_parses_first_hash_number() {
        assert_eq!(parse_ticket_reference("🆕 Обращение #42 от Ann"), Some(TicketId(42)));
        assert_eq!(parse_ticket_reference("#7 and #8"), Some(TicketId(7)));
        assert_eq!(parse_ticket_reference("no reference"), None);
        assert_eq!(
            parse_ticket_reference(&ticket_reference(TicketId(13))),
            Some(TicketId(13))
        );
    }

    #[test]
    fn attention_requires_unanswered_message_past_sla() {
        let now = Utc.with_ymd_and_hms(2025, 7, 12, 12, 0, 0).unwrap();
        let sla = Duration::hours(2);

        assert!(needs_attention(&ticket(Some(now - Duration::hours(3)), None), now, sla));
        assert!(!needs_attention(&ticket(Some(now - Duration::hours(1)), None), now, sla));
        assert!(needs_attention(
            &ticket(Some(now - Duration::hours(3)), Some(now - Duration::hours(4))),
            now,
            sla
        ));
        assert!(!needs_attention(
            &ticket(Some(now - Duration::hours(4)), Some(now - Duration::hours(3))),
            now,
            sla
        ));

        let mut closed = ticket(Some(now - Duration::hours(5)), None);
        closed.is_closed = true;
        assert!(!needs_attention(&closed, now, sla));
    }

    #[test]
    fn stale_requires_a_staff_response() {
        let now = Utc.with_ymd_and_hms(2025, 7, 12, 12, 0, 0).unwrap();
        let cutoff = now - Duration::days(7);
        let old = Some(now - Duration::days(8));

        assert!(is_stale(&ticket(old, Some(now - Duration::days(7))), cutoff));
        assert!(!is_stale(&ticket(old, None), cutoff));
        assert!(!is_stale(&ticket(Some(now), Some(now)), cutoff));
    }
}
