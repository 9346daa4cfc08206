//! Affirmation detection for short replies
//!
//! Keyword matching misreads nuanced answers, so the detector sits behind a
//! trait and the engine accepts any implementation.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Affirmation {
    Affirm,
    Deny,
    Ambiguous,
}

pub trait AffirmationDetector: Send + Sync + std::fmt::Debug {
    fn classify(&self, reply: &str) -> Affirmation;
}

lazy_static! {
    static ref UNCERTAIN: Regex = Regex::new(
        r"\b(not sure|unsure|maybe|perhaps|possibly|i don't know|i dont know|don't know|dont know|no idea|not certain|depends|kind of|sort of|i think so|i guess)\b"
    )
    .unwrap();
    static ref AFFIRM: Regex = Regex::new(
        r"\b(yes|yeah|yep|yup|ya|correct|that's right|that is right|you're right|sure|absolutely|definitely|certainly|indeed|affirmative|true|of course|i am|i'm a|i do|i have|i did|i own|i hold)\b"
    )
    .unwrap();
    /// Negated verb phrases; these outrank the affirm phrases they contain
    static ref NEGATION: Regex = Regex::new(
        r"\b(i am not|i'm not|am not|do not|did not|have not|not a|don't|dont|didn't|didnt|haven't|havent|not really)\b"
    )
    .unwrap();
    static ref DENY: Regex = Regex::new(
        r"\b(no|nope|nah|not|never|none|negative|false|don't|dont|didn't|didnt|haven't|havent|isn't|aren't|wasn't|doesn't|do not|did not|have not)\b"
    )
    .unwrap();
}

/// Default keyword-based detector
#[derive(Debug, Clone, Default)]
pub struct KeywordAffirmation;

impl KeywordAffirmation {
    pub fn new() -> Self {
        Self
    }
}

impl AffirmationDetector for KeywordAffirmation {
    fn classify(&self, reply: &str) -> Affirmation {
        let text = reply.trim().to_lowercase().replace('\u{2019}', "'");
        match text.trim_end_matches(['.', '!']) {
            "y" => return Affirmation::Affirm,
            "n" => return Affirmation::Deny,
            _ => {}
        }

        if text.is_empty() || UNCERTAIN.is_match(&text) {
            return Affirmation::Ambiguous;
        }

        let without_negations = NEGATION.replace_all(&text, " ~ ");
        match (AFFIRM.is_match(&without_negations), DENY.is_match(&text)) {
            (true, false) => Affirmation::Affirm,
            (false, true) => Affirmation::Deny,
            _ => Affirmation::Ambiguous,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(s: &str) -> Affirmation {
        KeywordAffirmation::new().classify(s)
    }

    #[test]
    fn test_affirmations() {
        for reply in ["Yes", "yes!", "Yeah, that's correct", "Y", "I am a U.S. citizen", "Sure"] {
            assert_eq!(classify(reply), Affirmation::Affirm, "{}", reply);
        }
    }

    #[test]
    fn test_denials() {
        for reply in ["No", "nope", "I don't own a business", "Never", "N", "I\u{2019}ve never done that, no"] {
            assert_eq!(classify(reply), Affirmation::Deny, "{}", reply);
        }
    }

    #[test]
    fn test_ambiguous_never_triggers() {
        for reply in ["Not sure", "maybe", "I don't know", "yes and no", "", "It depends on the year"] {
            assert_eq!(classify(reply), Affirmation::Ambiguous, "{}", reply);
        }
    }

    #[test]
    fn test_negation_outranks_contained_affirmation() {
        for reply in ["I do not", "I have not", "I did not", "I am not a resident", "I do not own any shares"] {
            assert_eq!(classify(reply), Affirmation::Deny, "{}", reply);
        }
    }

    #[test]
    fn test_right_alone_is_not_affirmation() {
        assert_eq!(classify("Right now I live only in Germany"), Affirmation::Ambiguous);
        assert_eq!(classify("That's right"), Affirmation::Affirm);
    }

    #[test]
    fn test_unrelated_text_is_ambiguous() {
        assert_eq!(classify("I moved to Toronto in 2019"), Affirmation::Ambiguous);
    }
}
