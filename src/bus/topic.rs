//! AMQP topic pattern matching.

/// Check if a routing key matches a topic binding pattern.
///
/// Matching rules (words are dot-separated):
/// - `*` matches exactly one word
/// - `#` matches zero or more words
/// - anything else matches the word literally
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = if routing_key.is_empty() {
        Vec::new()
    } else {
        routing_key.split('.').collect()
    };
    matches_words(&pattern, &key)
}

fn matches_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => {
            // Collapse consecutive hashes
            if rest.first() == Some(&"#") {
                return matches_words(rest, key);
            }
            (0..=key.len()).any(|skip| matches_words(rest, &key[skip..]))
        }
        Some((&word, rest)) => match key.split_first() {
            Some((&first, key_rest)) if word == "*" || word == first => {
                matches_words(rest, key_rest)
            }
            _ => false,
        },
    }
}
