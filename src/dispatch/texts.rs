// User- and staff-facing message templates
use chrono::{DateTime, Utc};

use crate::db::models::{Feedback, Ticket, TicketMessage};
use crate::feedback::{FeedbackCategory, FeedbackStats};
use crate::support::stats::SupportStats;
use crate::support::{TicketHistory, TicketSummary};

const TIME_FORMAT: &str = "%d.%m %H:%M";

pub fn welcome(festival: &str, user_name: &str) -> String {
    format!(
        "🎵 Добро пожаловать на {festival}!\n\n\
         Привет, {user_name}! 👋\n\n\
         Этот бот поможет тебе:\n\
         • 🆘 Связаться с поддержкой\n\
         • 💭 Оставить отзыв\n\n\
         Выбери нужный раздел в меню ниже ⬇️"
    )
}

pub fn main_menu() -> &'static str {
    "🏠 Главное меню\n\nВыберите раздел ⬇️"
}

pub fn ask_email(replacing: Option<&Ticket>) -> String {
    let mut text = String::from(
        "📧 Укажите email для связи.\n\n\
         Он понадобится, если ответ не удастся доставить в бот.",
    );
    if let Some(ticket) = replacing {
        text.push_str(&format!(
            "\n\n⚠️ Текущее обращение #{} будет закрыто после создания нового.",
            ticket.id
        ));
    }
    text
}

pub fn invalid_email(input: &str) -> String {
    format!(
        "❌ «{input}» не похоже на email.\n\n\
         Адрес должен содержать «@» и «.», например: name@example.com"
    )
}

pub fn ask_message() -> &'static str {
    "✍️ Опишите вашу проблему или вопрос.\n\n\
     Можно приложить фото, документ или видео."
}

pub fn empty_message() -> &'static str {
    "❌ Сообщение пустое. Отправьте текст или файл."
}

pub fn ticket_created(ticket: &Ticket, sla_hours: i64) -> String {
    format!(
        "✅ Ваше обращение #{} принято!\n\n\
         ⏱ Мы ответим в течение {} часов.\n\
         📱 Ответ придет прямо в этот бот.\n\
         🔔 Включите уведомления, чтобы не пропустить ответ!\n\n\
         💬 Вы можете продолжать писать сообщения - они будут добавлены к этому обращению.",
        ticket.id, sla_hours
    )
}

pub fn message_added(ticket: &Ticket) -> String {
    format!("✅ Сообщение добавлено к обращению #{}", ticket.id)
}

pub fn continue_dialog(ticket: &Ticket) -> String {
    format!(
        "💬 Обращение #{}\n\nПишите сообщение - оно будет передано в поддержку.",
        ticket.id
    )
}

fn message_line(message: &TicketMessage) -> String {
    let who = match (message.is_staff, message.is_admin) {
        (true, true) => "👨‍💼 Администратор Поддержки",
        (true, false) => "🧑‍💼 Сотрудник Поддержки",
        _ => "👤 Вы",
    };
    let body = match (&message.payload.text, &message.payload.attachment) {
        (Some(text), Some(_)) => format!("📎 {text}"),
        (Some(text), None) => text.clone(),
        (None, Some(a)) => format!("📎 {}", a.kind.as_str()),
        (None, None) => String::new(),
    };
    format!(
        "{} · {}\n{}",
        who,
        message.created_at.format(TIME_FORMAT),
        body
    )
}

pub fn ticket_summary(summary: &TicketSummary) -> String {
    let ticket = &summary.ticket;
    let mut text = format!(
        "🔓 Открытое обращение #{}\n\
         📅 Создано: {}\n\
         💬 Сообщений: {}\n",
        ticket.id,
        ticket.created_at.format(TIME_FORMAT),
        summary.total_messages
    );
    if !summary.recent.is_empty() {
        text.push_str("\n📋 Последние сообщения:\n");
        for message in &summary.recent {
            text.push('\n');
            text.push_str(&message_line(message));
            text.push('\n');
        }
    }
    text
}

pub fn ticket_history(history: &TicketHistory) -> String {
    let mut text = format!(
        "📋 История обращения #{} ({} сообщ.)\n",
        history.ticket.id, history.total
    );
    for message in &history.messages {
        text.push('\n');
        text.push_str(&message_line(message));
        text.push('\n');
    }
    text
}

pub fn confirm_close(ticket: &Ticket) -> String {
    format!("❓ Закрыть обращение #{}?", ticket.id)
}

pub fn ticket_closed(ticket: &Ticket) -> String {
    format!(
        "✅ Обращение #{} закрыто\n\n\
         Спасибо за обращение!\n\
         Если возникнут новые вопросы, создайте новое обращение.\n\n\
         🌟 Оцените нашу работу в разделе \"💭 Обратная связь\"",
        ticket.id
    )
}

pub fn ticket_already_closed(ticket: &Ticket) -> String {
    format!("🔒 Обращение #{} уже закрыто.", ticket.id)
}

pub fn ticket_unavailable() -> &'static str {
    "❌ Обращение не найдено или уже закрыто."
}

pub fn rate_limited(reason: &str, wait_seconds: i64) -> String {
    format!(
        "⏳ {reason}\n\n\
         Пожалуйста, подождите {wait_seconds} секунд перед отправкой следующего сообщения."
    )
}

pub fn retry_later() -> &'static str {
    "😔 Произошла ошибка. Попробуйте ещё раз чуть позже."
}

pub fn use_menu() -> &'static str {
    "🤖 Я не понял сообщение. Воспользуйтесь меню ⬇️"
}

pub fn staff_ticket_not_found() -> &'static str {
    "⚠️ Не удалось определить обращение для этого ответа.\n\
     Отвечайте в теме обращения или на сообщение с номером #ID."
}

pub fn staff_ticket_closed(ticket_id: impl std::fmt::Display) -> String {
    format!("🔒 Обращение #{ticket_id} уже закрыто. Сообщение не доставлено пользователю.")
}

pub fn choose_category() -> &'static str {
    "💭 Обратная связь\n\nВыберите, что хотите оценить:"
}

pub fn choose_rating(category: FeedbackCategory) -> String {
    format!("{}\n\nПоставьте оценку от 1 до 5:", category.label())
}

pub fn ask_comment() -> &'static str {
    "💬 Хотите добавить комментарий? Напишите его одним сообщением или пропустите этот шаг."
}

pub fn admin_menu() -> &'static str {
    "🎛 Панель администратора\n\n\
     🔍 Поиск обращений: /search [open|closed] <текст>"
}

pub fn search_usage() -> &'static str {
    "🔍 Использование: /search [open|closed] <текст>\n\
     Ищет по тексту обращения и имени пользователя."
}

pub fn search_results(tickets: &[Ticket]) -> String {
    if tickets.is_empty() {
        return "🔍 Ничего не найдено".to_string();
    }
    let mut text = format!("🔍 Найдено обращений: {}\n", tickets.len());
    for ticket in tickets {
        let status = if ticket.is_closed { "🔒" } else { "🟢" };
        text.push_str(&format!(
            "\n{status} #{} · {} · {}\n{}\n",
            ticket.id,
            ticket.email,
            ticket.created_at.format(TIME_FORMAT),
            crate::support::engine::preview(&ticket.message, 80)
        ));
    }
    text
}

pub fn support_dashboard(stats: &SupportStats) -> String {
    let t = &stats.tickets;
    let mut text = format!(
        "🎛 Панель поддержки\n\n\
         🎫 Обращения: {} (открыто {}, закрыто {})\n\
         📅 Сегодня: {} · неделя: {} · месяц: {}\n\
         💬 Сообщения: от пользователей {}, от сотрудников {}\n",
        t.total,
        t.open,
        t.closed,
        t.today,
        t.week,
        t.month,
        stats.messages.from_users,
        stats.messages.from_staff
    );
    match stats.avg_response_minutes {
        Some(minutes) => text.push_str(&format!("⏱ Среднее время ответа: {minutes:.0} мин\n")),
        None => text.push_str("⏱ Среднее время ответа: нет данных\n"),
    }

    if !stats.staff.is_empty() {
        text.push_str("\n👥 Активность сотрудников:\n");
        for member in &stats.staff {
            text.push_str(&format!(
                "{} {} · {}\n",
                if member.is_admin { "👨‍💼" } else { "🧑‍💼" },
                member
                    .display_name
                    .clone()
                    .unwrap_or_else(|| member.user_id.to_string()),
                member.messages
            ));
        }
    }

    if !stats.daily.is_empty() {
        text.push_str("\n📈 По дням (создано / закрыто):\n");
        for day in &stats.daily {
            text.push_str(&format!(
                "{} · {} / {}\n",
                day.date.format("%d.%m"),
                day.created,
                day.closed
            ));
        }
    }
    text
}

pub fn attention_list(tickets: &[Ticket], now: DateTime<Utc>, sla_hours: i64) -> String {
    if tickets.is_empty() {
        return format!("✅ Нет обращений без ответа дольше {sla_hours} ч");
    }
    let mut text = format!("🚨 Требуют внимания: {}\n", tickets.len());
    for ticket in tickets {
        let waiting = ticket
            .last_user_message_at
            .map(|t| (now - t).num_minutes())
            .unwrap_or_default();
        text.push_str(&format!(
            "\n#{} · {} · ждёт {} ч {} мин\n{}\n",
            ticket.id,
            ticket.email,
            waiting / 60,
            waiting % 60,
            crate::support::engine::preview(&ticket.message, 80)
        ));
    }
    text
}

pub fn critical_feedback(items: &[Feedback], stats: &FeedbackStats) -> String {
    let mut text = format!(
        "🚨 Критические отзывы без решения: {}\n\
         📊 Всего отзывов: {} · средняя оценка: {}\n",
        items.len(),
        stats.total,
        stats
            .average_rating
            .map(|a| format!("{a:.1}"))
            .unwrap_or_else(|| "нет".to_string())
    );
    for item in items {
        text.push_str(&format!(
            "\n#{} · {} · {}/5 · {}\n",
            item.id,
            item.category.label(),
            item.rating,
            item.created_at.format(TIME_FORMAT)
        ));
        if let Some(comment) = &item.comment {
            text.push_str(&format!("💬 {comment}\n"));
        }
    }
    text
}

pub fn feedback_resolved(feedback: &Feedback) -> String {
    format!("✅ Отзыв #{} отмечен как решённый", feedback.id)
}
