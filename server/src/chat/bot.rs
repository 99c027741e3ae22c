//! Keyword FAQ bot that answers customers while a session is in `bot`.

pub const GREETING: &str = "Hi! I'm the Rideline assistant. Ask me about pricing, \
     cancellation, license requirements, pickup and return, or opening hours. \
     Type \"agent\" at any time to talk to a person.";

pub const HANDOFF_NOTICE: &str =
    "I'm connecting you with a support agent. Someone will join this chat shortly.";

const FALLBACK: &str = "Sorry, I didn't catch that. Could you rephrase? \
     You can also type \"agent\" to talk to a person.";

/// What the bot does with one customer message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BotReply {
    Answer(&'static str),
    /// The customer asked for a human.
    Escalate,
    /// No FAQ entry matched.
    Miss,
}

impl BotReply {
    pub fn text(&self) -> &'static str {
        match self {
            Self::Answer(text) => text,
            Self::Escalate => HANDOFF_NOTICE,
            Self::Miss => FALLBACK,
        }
    }
}

const HUMAN_KEYWORDS: &[&str] = &["agent", "human", "person", "representative", "operator"];

const FAQ: &[(&[&str], &str)] = &[
    (
        &["price", "pricing", "cost", "rate", "fee"],
        "Prices are shown per day on each car and include insurance and taxes. \
         The total for your booking is fixed when you confirm it.",
    ),
    (
        &["cancel", "refund"],
        "You can cancel free of charge up to 24 hours before pickup from \
         My Bookings. Later cancellations are charged one rental day.",
    ),
    (
        &["license", "licence", "documents", "id"],
        "Bring a driving license held for at least one year and a valid ID. \
         International licenses must be accompanied by the original.",
    ),
    (
        &["pickup", "pick up", "return", "drop off", "dropoff", "deliver"],
        "Your driver brings the car to the pickup location at the booked time \
         and collects it at the end of the rental. You'll get a notification \
         when a driver accepts.",
    ),
    (
        &["hours", "open", "opening"],
        "Support and deliveries run every day from 07:00 to 22:00.",
    ),
];

/// Decide a reply by keyword. Matching is case-insensitive on whole words,
/// except multi-word keywords which match as phrases.
pub fn respond(message: &str) -> BotReply {
    let lower = message.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    let matches = |keyword: &str| {
        if keyword.contains(' ') {
            lower.contains(keyword)
        } else {
            words.contains(&keyword)
        }
    };

    if HUMAN_KEYWORDS.iter().any(|k| matches(k)) {
        return BotReply::Escalate;
    }
    FAQ.iter()
        .find(|(keywords, _)| keywords.iter().any(|k| matches(k)))
        .map(|(_, answer)| BotReply::Answer(answer))
        .unwrap_or(BotReply::Miss)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn answers_known_topics() {
        assert!(matches!(respond("How much does it COST?"), BotReply::Answer(_)));
        assert!(matches!(respond("can I cancel my booking"), BotReply::Answer(_)));
        assert!(matches!(respond("where is the drop off"), BotReply::Answer(_)));
    }

    #[test]
    fn asking_for_a_person_escalates() {
        assert_eq!(respond("I want to talk to a human"), BotReply::Escalate);
        assert_eq!(respond("agent please"), BotReply::Escalate);
    }

    #[test]
    fn unknown_text_is_a_miss() {
        assert_eq!(respond("blue elephants"), BotReply::Miss);
        // substring of a keyword does not count
        assert_eq!(respond("operational"), BotReply::Miss);
    }
}
