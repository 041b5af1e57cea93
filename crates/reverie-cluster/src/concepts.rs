//! Keyword extraction for cluster concepts.
//!
//! Concepts are a pure function of member text: the same members always
//! yield the same concepts, in the same order.  Terms are ranked by how many
//! times they occur across all member texts, ties broken alphabetically.

use std::collections::HashMap;

/// Lowercase, split on anything that is not a letter or digit, and drop
/// short tokens, numbers and stop words.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .map(|w| w.to_lowercase())
        .filter(|w| w.chars().count() > 2)
        .filter(|w| !w.chars().all(|c| c.is_ascii_digit()))
        .filter(|w| !is_stop_word(w))
        .collect()
}

/// Count terms across every member's token list.
pub fn count_terms<'a>(members: impl IntoIterator<Item = &'a [String]>) -> HashMap<String, usize> {
    let mut counts = HashMap::new();
    for terms in members {
        for term in terms {
            *counts.entry(term.clone()).or_insert(0) += 1;
        }
    }
    counts
}

/// The `limit` most frequent terms, most frequent first, ties alphabetical.
pub fn top_concepts(counts: &HashMap<String, usize>, limit: usize) -> Vec<(String, usize)> {
    let mut ranked: Vec<(String, usize)> = counts.iter().map(|(t, c)| (t.clone(), *c)).collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.truncate(limit);
    ranked
}

fn is_stop_word(word: &str) -> bool {
    matches!(
        word,
        "the"
            | "and"
            | "for"
            | "are"
            | "but"
            | "not"
            | "you"
            | "all"
            | "can"
            | "had"
            | "her"
            | "him"
            | "his"
            | "she"
            | "was"
            | "one"
            | "our"
            | "out"
            | "has"
            | "have"
            | "been"
            | "from"
            | "this"
            | "that"
            | "with"
            | "they"
            | "them"
            | "will"
            | "each"
            | "which"
            | "their"
            | "said"
            | "what"
            | "its"
            | "into"
            | "more"
            | "other"
            | "about"
            | "again"
            | "also"
            | "just"
            | "really"
            | "very"
            | "much"
            | "some"
            | "than"
            | "then"
            | "there"
            | "these"
            | "those"
            | "when"
            | "where"
            | "while"
            | "would"
            | "could"
            | "should"
            | "being"
            | "did"
            | "does"
            | "doing"
            | "got"
            | "get"
            | "feel"
            | "feeling"
            | "felt"
            | "today"
            | "yesterday"
            | "myself"
            | "like"
            | "how"
            | "who"
            | "why"
            | "were"
            | "over"
            | "after"
            | "before"
            | "because"
            | "still"
            | "even"
            | "ever"
            | "any"
            | "don"
            | "didn"
            | "doesn"
            | "isn"
            | "wasn"
            | "won"
            | "way"
            | "too"
            | "now"
    )
}
