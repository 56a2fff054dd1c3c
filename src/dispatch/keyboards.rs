use super::actions::CallbackAction;
use crate::feedback::{FeedbackCategory, Rating};
use crate::gateway::{Button, Keyboard};
use crate::ids::{FeedbackId, TicketId};

fn button(label: &str, action: CallbackAction) -> Button {
    Button::callback(label, action.to_string())
}

fn home() -> Button {
    button("🏠 Главное меню", CallbackAction::MainMenu)
}

/// `map_url` adds a link to the festival grounds when coordinates are configured
pub fn main_menu(has_open_ticket: bool, map_url: Option<&str>) -> Keyboard {
    let support = if has_open_ticket {
        "🆘 Поддержка 🔴"
    } else {
        "🆘 Поддержка"
    };
    let mut rows = vec![
        vec![button(support, CallbackAction::Support)],
        vec![button("💭 Обратная связь", CallbackAction::Feedback)],
    ];
    if let Some(url) = map_url {
        rows.push(vec![Button::url("🗺 Карта фестиваля", url)]);
    }
    Keyboard { rows }
}

pub fn back_to_main() -> Keyboard {
    Keyboard::column([home()])
}

pub fn open_ticket_menu(ticket: TicketId) -> Keyboard {
    Keyboard::column([
        button("💬 Продолжить диалог", CallbackAction::ContinueDialog(ticket)),
        button("📋 История сообщений", CallbackAction::ShowHistory(ticket)),
        button("✅ Закрыть обращение", CallbackAction::CloseTicket(ticket)),
        button("🆕 Новое обращение", CallbackAction::NewTicket),
        home(),
    ])
}

pub fn no_ticket_menu() -> Keyboard {
    Keyboard::column([
        button("🆕 Создать обращение", CallbackAction::NewTicket),
        home(),
    ])
}

pub fn active_dialog(ticket: TicketId) -> Keyboard {
    Keyboard::column([
        button("📋 История сообщений", CallbackAction::ShowHistory(ticket)),
        button("✅ Закрыть обращение", CallbackAction::CloseTicket(ticket)),
        button("◀️ Назад к тикету", CallbackAction::BackToTicket(ticket)),
        home(),
    ])
}

pub fn history(ticket: TicketId) -> Keyboard {
    Keyboard::column([
        button("💬 Продолжить диалог", CallbackAction::ContinueDialog(ticket)),
        button("◀️ Назад к тикету", CallbackAction::BackToTicket(ticket)),
        home(),
    ])
}

pub fn confirm_close(ticket: TicketId) -> Keyboard {
    Keyboard::column([
        button("✅ Да, закрыть", CallbackAction::ConfirmClose(ticket)),
        button("❌ Отмена", CallbackAction::BackToTicket(ticket)),
    ])
}

pub fn after_close() -> Keyboard {
    Keyboard::column([
        button("🆕 Новое обращение", CallbackAction::NewTicket),
        button("💭 Оставить отзыв", CallbackAction::Feedback),
        home(),
    ])
}

pub fn rate_limited() -> Keyboard {
    Keyboard::column([
        Button::callback("🔄 Попробовать снова", "retry_support"),
        home(),
    ])
}

pub fn feedback_categories() -> Keyboard {
    Keyboard::column(
        FeedbackCategory::ALL
            .into_iter()
            .map(|c| button(c.label(), CallbackAction::FeedbackCategory(c)))
            .chain([home()]),
    )
}

pub fn ratings() -> Keyboard {
    Keyboard::column(
        (1..=5i64)
            .filter_map(|value| Rating::try_from(value).ok())
            .map(|r| {
                button(
                    &format!("{} {}", r.stars(), r),
                    CallbackAction::Rating(r),
                )
            })
            .chain([home()]),
    )
}

pub fn skip_comment() -> Keyboard {
    Keyboard::column([
        button("➡️ Пропустить комментарий", CallbackAction::SkipComment),
        home(),
    ])
}

pub fn after_feedback() -> Keyboard {
    Keyboard::column([
        button("💭 Оставить ещё отзыв", CallbackAction::Feedback),
        button("🆘 Обратиться в поддержку", CallbackAction::Support),
        home(),
    ])
}

pub fn admin_menu() -> Keyboard {
    Keyboard::column([
        button("🎛 Панель поддержки", CallbackAction::AdminSupportDashboard),
        button("🚨 Требуют внимания", CallbackAction::AdminAttention),
        button("🚨 Критические отзывы", CallbackAction::AdminCriticalFeedback),
        home(),
    ])
}

pub fn resolve_feedback(ids: &[FeedbackId]) -> Keyboard {
    Keyboard::column(
        ids.iter()
            .map(|id| button(&format!("✅ Решено #{id}"), CallbackAction::ResolveFeedback(*id)))
            .chain([button("🔄 Обновить", CallbackAction::AdminCriticalFeedback)]),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_button_parses_back_to_an_action() {
        let keyboards = [
            main_menu(true, Some("https://maps.example/?q=1,2")),
            open_ticket_menu(TicketId(3)),
            active_dialog(TicketId(3)),
            confirm_close(TicketId(3)),
            after_close(),
            rate_limited(),
            feedback_categories(),
            ratings(),
            skip_comment(),
            admin_menu(),
            resolve_feedback(&[FeedbackId(1)]),
        ];
        for keyboard in keyboards {
            for data in keyboard.callbacks() {
                assert!(data.parse::<CallbackAction>().is_ok(), "{data}");
            }
        }
    }

    #[test]
    fn open_ticket_marker_in_main_menu() {
        let menu = main_menu(true, None);
        assert_eq!(menu.rows[0][0].label, "🆘 Поддержка 🔴");
        assert_eq!(menu.rows.len(), 2);
        assert_eq!(main_menu(false, Some("u")).rows.len(), 3);
    }

    #[test]
    fn rating_keyboard_has_five_stars_and_home() {
        let keyboard = ratings();
        assert_eq!(keyboard.rows.len(), 6);
        assert_eq!(keyboard.rows[4][0].label, "⭐⭐⭐⭐⭐ 5");
    }
}
