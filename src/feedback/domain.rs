// Feedback triage - pure classification, no I/O
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackCategory {
    Festival,
    Food,
    Workshops,
    Lectures,
    Infrastructure,
}

impl FeedbackCategory {
    pub const ALL: [Self; 5] = [
        Self::Festival,
        Self::Food,
        Self::Workshops,
        Self::Lectures,
        Self::Infrastructure,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Festival => "festival",
            Self::Food => "food",
            Self::Workshops => "workshops",
            Self::Lectures => "lectures",
            Self::Infrastructure => "infrastructure",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Festival => "🎪 Фестиваль в целом",
            Self::Food => "🍕 Фудкорты",
            Self::Workshops => "🎨 Мастер-классы",
            Self::Lectures => "🎓 Лекторий",
            Self::Infrastructure => "🏗 Инфраструктура",
        }
    }

    /// What staff should look at first when this category gets a low rating
    pub fn recommendations(self) -> &'static [&'static str] {
        match self {
            Self::Festival => &[
                "Проверить общую организацию и навигацию по территории",
                "Уточнить у пользователя, какой момент испортил впечатление",
            ],
            Self::Food => &[
                "Проверить очереди и санитарное состояние фудкортов",
                "Связаться с ответственным за кейтеринг",
            ],
            Self::Workshops => &[
                "Проверить расписание и наполненность мастер-классов",
                "Передать отзыв ведущим мастер-классов",
            ],
            Self::Lectures => &[
                "Проверить звук и рассадку в лектории",
                "Сверить фактическое время лекций с расписанием",
            ],
            Self::Infrastructure => &[
                "Проверить туалеты, зоны отдыха и освещение",
                "Отправить техническую службу на осмотр",
            ],
        }
    }
}

impl fmt::Display for FeedbackCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FeedbackCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown feedback category: {s}"))
    }
}

/// Added after the category-specific recommendations for every critical review
pub const BASE_RECOMMENDATIONS: [&str; 2] = [
    "Связаться с пользователем в течение часа",
    "Зафиксировать принятые меры в ответе на отзыв",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("rating must be between 1 and 5, got {0}")]
pub struct InvalidRating(pub i64);

/// A 1-5 star rating
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct Rating(u8);

impl Rating {
    pub fn get(self) -> i64 {
        i64::from(self.0)
    }

    pub fn stars(self) -> String {
        "⭐".repeat(usize::from(self.0))
    }
}

impl TryFrom<i64> for Rating {
    type Error = InvalidRating;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match u8::try_from(value) {
            Ok(v @ 1..=5) => Ok(Self(v)),
            _ => Err(InvalidRating(value)),
        }
    }
}

impl From<Rating> for i64 {
    fn from(rating: Rating) -> Self {
        rating.get()
    }
}

impl fmt::Display for Rating {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Urgent,
    High,
    Medium,
    Normal,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Urgent => "urgent",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Normal => "normal",
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "urgent" => Ok(Self::Urgent),
            "high" => Ok(Self::High),
            "medium" => Ok(Self::Medium),
            "normal" => Ok(Self::Normal),
            other => Err(format!("unknown priority: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackStatus {
    New,
    RequiresAttention,
    Resolved,
}

impl FeedbackStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::RequiresAttention => "requires_attention",
            Self::Resolved => "resolved",
        }
    }
}

impl FromStr for FeedbackStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(Self::New),
            "requires_attention" => Ok(Self::RequiresAttention),
            "resolved" => Ok(Self::Resolved),
            other => Err(format!("unknown feedback status: {other}")),
        }
    }
}

/// Flags derived from the rating once, at submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub is_critical: bool,
    pub priority: Priority,
    pub status: FeedbackStatus,
}

pub fn classify(rating: Rating) -> Classification {
    let (is_critical, priority, status) = match rating.0 {
        1 => (true, Priority::Urgent, FeedbackStatus::RequiresAttention),
        2 => (true, Priority::High, FeedbackStatus::RequiresAttention),
        3 => (false, Priority::Medium, FeedbackStatus::New),
        _ => (false, Priority::Normal, FeedbackStatus::New),
    };
    Classification {
        is_critical,
        priority,
        status,
    }
}

/// Category-specific recommendations followed by the base ones
pub fn recommendations_for(category: FeedbackCategory) -> Vec<&'static str> {
    category
        .recommendations()
        .iter()
        .copied()
        .chain(BASE_RECOMMENDATIONS)
        .collect()
}

pub fn severity_emoji(rating: Rating) -> &'static str {
    match rating.0 {
        1 | 2 => "🔴",
        3 => "🟡",
        _ => "🟢",
    }
}

/// Thank-you text for the submitter; the tone follows the rating
pub fn acknowledgment(category: FeedbackCategory, rating: Rating, has_comment: bool) -> String {
    let closing = match rating.0 {
        1 | 2 => {
            "😔 Нам очень жаль, что вы остались недовольны.\n\
             Ваш отзыв уже передан организаторам, мы разберёмся и постараемся всё исправить."
        }
        3 => "🤔 Спасибо за честную оценку! Мы учтём ваши замечания, чтобы стать лучше.",
        _ => "🎉 Мы рады, что вам понравилось! Ваше мнение поможет нам стать лучше 🙏",
    };
    format!(
        "✅ Спасибо за отзыв!\n\n\
         📊 Категория: {}\n\
         🌟 Оценка: {} ({}/5)\n\
         💬 Комментарий: {}\n\n\
         {}",
        category.label(),
        rating.stars(),
        rating,
        if has_comment { "есть" } else { "нет" },
        closing
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rating(value: i64) -> Rating {
        Rating::try_from(value).unwrap()
    }

    #[test]
    fn classification_is_total_over_ratings() {
        let expected = [
            (1, true, Priority::Urgent, FeedbackStatus::RequiresAttention),
            (2, true, Priority::High, FeedbackStatus::RequiresAttention),
            (3, false, Priority::Medium, FeedbackStatus::New),
            (4, false, Priority::Normal, FeedbackStatus::New),
            (5, false, Priority::Normal, FeedbackStatus::New),
        ];
        for (value, is_critical, priority, status) in expected {
            assert_eq!(
                classify(rating(value)),
                Classification {
                    is_critical,
                    priority,
                    status
                },
                "rating {value}"
            );
        }
    }

    #[test]
    fn rating_outside_one_to_five_is_rejected() {
        assert_eq!(Rating::try_from(0_i64), Err(InvalidRating(0)));
        assert_eq!(Rating::try_from(6_i64), Err(InvalidRating(6)));
        assert_eq!(Rating::try_from(-300_i64), Err(InvalidRating(-300)));
        assert!(serde_json::from_str::<Rating>("7").is_err());
        assert_eq!(serde_json::from_str::<Rating>("4").unwrap(), rating(4));
    }

    #[test]
    fn category_names_parse_back() {
        for category in FeedbackCategory::ALL {
            assert_eq!(category.as_str().parse::<FeedbackCategory>(), Ok(category));
        }
        assert!("parking".parse::<FeedbackCategory>().is_err());
    }

    #[test]
    fn recommendations_end_with_base_list() {
        let list = recommendations_for(FeedbackCategory::Food);
        assert_eq!(list.len(), FeedbackCategory::Food.recommendations().len() + 2);
        assert_eq!(&list[list.len() - 2..], &BASE_RECOMMENDATIONS);
    }

    #[test]
    fn acknowledgment_tone_depends_on_tier() {
        let low = acknowledgment(FeedbackCategory::Food, rating(1), true);
        let mid = acknowledgment(FeedbackCategory::Food, rating(3), false);
        let high = acknowledgment(FeedbackCategory::Food, rating(5), false);
        assert!(low.contains("жаль"));
        assert!(mid.contains("честную"));
        assert!(high.contains("рады"));
        assert!(high.contains("⭐⭐⭐⭐⭐ (5/5)"));
        assert_ne!(low, mid);
    }

    #[test]
    fn severity_emoji_per_tier() {
        assert_eq!(severity_emoji(rating(2)), "🔴");
        assert_eq!(severity_emoji(rating(3)), "🟡");
        assert_eq!(severity_emoji(rating(4)), "🟢");
    }
}
