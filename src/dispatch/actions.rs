// Inline button payloads, both directions
use std::fmt;
use std::str::FromStr;

use crate::feedback::{FeedbackCategory, Rating};
use crate::ids::{FeedbackId, TicketId};
use crate::support::domain::STAFF_CLOSE_PREFIX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackAction {
    MainMenu,
    Support,
    NewTicket,
    ContinueDialog(TicketId),
    ShowHistory(TicketId),
    CloseTicket(TicketId),
    ConfirmClose(TicketId),
    BackToTicket(TicketId),
    Feedback,
    FeedbackCategory(FeedbackCategory),
    Rating(Rating),
    SkipComment,
    AdminSupportDashboard,
    AdminAttention,
    AdminCriticalFeedback,
    ResolveFeedback(FeedbackId),
    /// Pressed on a ticket's post in the staff group
    StaffClose(TicketId),
}

fn id_after<T: From<i64>>(data: &str, prefix: &str) -> Option<T> {
    data.strip_prefix(prefix)?.parse::<i64>().ok().map(T::from)
}

impl FromStr for CallbackAction {
    type Err = String;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let action = match data {
            "main_menu" => Some(Self::MainMenu),
            "support" | "retry_support" => Some(Self::Support),
            "new_ticket" => Some(Self::NewTicket),
            "feedback" => Some(Self::Feedback),
            "skip_comment" => Some(Self::SkipComment),
            "admin_support_dashboard" => Some(Self::AdminSupportDashboard),
            "admin_attention" => Some(Self::AdminAttention),
            "admin_critical_feedback" => Some(Self::AdminCriticalFeedback),
            _ => None,
        };
        if let Some(action) = action {
            return Ok(action);
        }

        let parsed = id_after(data, "continue_dialog_")
            .map(Self::ContinueDialog)
            .or_else(|| id_after(data, "show_history_").map(Self::ShowHistory))
            .or_else(|| id_after(data, "close_ticket_").map(Self::CloseTicket))
            .or_else(|| id_after(data, "confirm_close_").map(Self::ConfirmClose))
            .or_else(|| id_after(data, "back_to_ticket_").map(Self::BackToTicket))
            .or_else(|| id_after(data, "resolve_feedback_").map(Self::ResolveFeedback))
            .or_else(|| id_after(data, STAFF_CLOSE_PREFIX).map(Self::StaffClose))
            .or_else(|| {
                data.strip_prefix("rating_")?
                    .parse::<i64>()
                    .ok()
                    .and_then(|r| Rating::try_from(r).ok())
                    .map(Self::Rating)
            })
            .or_else(|| {
                data.strip_prefix("feedback_")?
                    .parse()
                    .ok()
                    .map(Self::FeedbackCategory)
            });

        parsed.ok_or_else(|| format!("unknown action: {data}"))
    }
}

impl fmt::Display for CallbackAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MainMenu => f.write_str("main_menu"),
            Self::Support => f.write_str("support"),
            Self::NewTicket => f.write_str("new_ticket"),
            Self::ContinueDialog(id) => write!(f, "continue_dialog_{id}"),
            Self::ShowHistory(id) => write!(f, "show_history_{id}"),
            Self::CloseTicket(id) => write!(f, "close_ticket_{id}"),
            Self::ConfirmClose(id) => write!(f, "confirm_close_{id}"),
            Self::BackToTicket(id) => write!(f, "back_to_ticket_{id}"),
            Self::Feedback => f.write_str("feedback"),
            Self::FeedbackCategory(c) => write!(f, "feedback_{c}"),
            Self::Rating(r) => write!(f, "rating_{r}"),
            Self::SkipComment => f.write_str("skip_comment"),
            Self::AdminSupportDashboard => f.write_str("admin_support_dashboard"),
            Self::AdminAttention => f.write_str("admin_attention"),
            Self::AdminCriticalFeedback => f.write_str("admin_critical_feedback"),
            Self::ResolveFeedback(id) => write!(f, "resolve_feedback_{id}"),
            Self::StaffClose(id) => write!(f, "{STAFF_CLOSE_PREFIX}{id}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ticket_actions_with_ids() {
        assert_eq!(
            "continue_dialog_42".parse(),
            Ok(CallbackAction::ContinueDialog(TicketId(42)))
        );
        assert_eq!(
            "confirm_close_7".parse(),
            Ok(CallbackAction::ConfirmClose(TicketId(7)))
        );
        assert_eq!(
            "resolve_feedback_3".parse(),
            Ok(CallbackAction::ResolveFeedback(FeedbackId(3)))
        );
        assert_eq!(
            "staff_close_12".parse(),
            Ok(CallbackAction::StaffClose(TicketId(12)))
        );
    }

    #[test]
    fn feedback_prefix_does_not_swallow_plain_feedback() {
        assert_eq!("feedback".parse(), Ok(CallbackAction::Feedback));
        assert_eq!(
            "feedback_food".parse(),
            Ok(CallbackAction::FeedbackCategory(FeedbackCategory::Food))
        );
        assert!("feedback_parking".parse::<CallbackAction>().is_err());
    }

    #[test]
    fn ratings_outside_range_are_rejected() {
        assert!("rating_0".parse::<CallbackAction>().is_err());
        assert!("rating_6".parse::<CallbackAction>().is_err());
        assert!(matches!(
            "rating_4".parse::<CallbackAction>(),
            Ok(CallbackAction::Rating(r)) if r.get() == 4
        ));
    }

    #[test]
    fn rendered_actions_parse_back() {
        let actions = [
            CallbackAction::ShowHistory(TicketId(5)),
            CallbackAction::BackToTicket(TicketId(5)),
            CallbackAction::FeedbackCategory(FeedbackCategory::Infrastructure),
            CallbackAction::AdminAttention,
            CallbackAction::StaffClose(TicketId(9)),
        ];
        for action in actions {
            assert_eq!(action.to_string().parse(), Ok(action));
        }
        assert!("close_ticket_abc".parse::<CallbackAction>().is_err());
    }
}
