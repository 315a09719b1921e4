//! Topic-exchange routing key patterns.
//!
//! Routing keys are dot-separated words (`payment.completed`). A binding
//! pattern may use `*` to match exactly one word and `#` to match zero or
//! more words.

/// Check whether `routing_key` matches `pattern`.
///
/// ```
/// use boxoffice_core::routing::matches;
///
/// assert!(matches("payment.*", "payment.completed"));
/// assert!(matches("#", "account.deleted"));
/// assert!(!matches("payment.*", "booking.created"));
/// ```
#[must_use]
pub fn matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match (pattern.split_first(), key.split_first()) {
        (None, None) => true,
        (Some((&"#", rest)), _) => {
            // `#` swallows zero words, or one word and stays in place.
            match_words(rest, key) || (!key.is_empty() && match_words(pattern, &key[1..]))
        }
        (Some((&"*", rest)), Some((_, key_rest))) => match_words(rest, key_rest),
        (Some((word, rest)), Some((key_word, key_rest))) => {
            word == key_word && match_words(rest, key_rest)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn exact_keys_match() {
        assert!(matches("booking.created", "booking.created"));
        assert!(!matches("booking.created", "booking.updated"));
    }

    #[test]
    fn star_matches_exactly_one_word() {
        assert!(matches("payment.*", "payment.refunded"));
        assert!(!matches("payment.*", "payment"));
        assert!(!matches("payment.*", "payment.card.failed"));
        assert!(matches("*.deleted", "account.deleted"));
    }

    #[test]
    fn hash_matches_zero_or_more_words() {
        assert!(matches("#", "booking.created"));
        assert!(matches("payment.#", "payment"));
        assert!(matches("payment.#", "payment.card.failed"));
        assert!(matches("#.failed", "payment.card.failed"));
        assert!(!matches("#.failed", "payment.completed"));
    }

    fn word() -> impl Strategy<Value = String> {
        "[a-z]{1,6}"
    }

    proptest! {
        #[test]
        fn hash_matches_every_key(words in prop::collection::vec(word(), 1..5)) {
            let key = words.join(".");
            prop_assert!(matches("#", &key));
        }

        #[test]
        fn key_matches_itself(words in prop::collection::vec(word(), 1..5)) {
            let key = words.join(".");
            prop_assert!(matches(&key, &key));
        }

        #[test]
        fn star_pattern_matches_same_length_only(
            words in prop::collection::vec(word(), 1..5),
            extra in word(),
        ) {
            let key = words.join(".");
            let stars = vec!["*"; words.len()].join(".");
            prop_assert!(matches(&stars, &key));

            let longer = format!("{key}.{extra}");
            prop_assert!(!matches(&stars, &longer));
        }
    }
}
