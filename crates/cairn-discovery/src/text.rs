//! Shared tokenizer for queries and tool descriptors.
//!
//! Both sides of a match go through [`tokenize`] so that query terms and
//! descriptor terms live in one vocabulary: lowercase, split on anything that
//! is not alphanumeric, drop stop words, fold simple plurals.

/// Function words that carry no retrieval signal.
const STOPWORDS: &[&str] = &[
    "a", "about", "all", "also", "am", "an", "and", "any", "are", "as", "at", "be", "been",
    "but", "by", "can", "could", "do", "does", "for", "from", "have", "has", "i", "if", "in",
    "into", "is", "it", "its", "just", "let", "like", "me", "my", "need", "of", "on", "or",
    "our", "please", "should", "so", "some", "that", "the", "their", "them", "then", "these",
    "this", "those", "to", "up", "us", "want", "was", "we", "were", "will", "with", "would",
    "you", "your",
];

pub fn is_stopword(word: &str) -> bool {
    STOPWORDS.contains(&word)
}

/// Lowercased, stop-word-free, plural-folded terms of `text`, in order.
///
/// ```
/// use cairn_discovery::text::tokenize;
///
/// assert_eq!(
///     tokenize("Send e-mail messages to the Recipients"),
///     vec!["send", "e", "mail", "message", "recipient"]
/// );
/// ```
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .filter(|w| !is_stopword(w))
        .map(|w| fold(&w))
        .collect()
}

/// Fold a lowercase word to its singular form.
///
/// Deliberately shallow: `-ies` → `-y`, a trailing `s` is dropped unless the
/// word ends in `ss`, `us` or `is`.  Words of three letters or fewer are
/// left alone.
pub fn fold(word: &str) -> String {
    if word.len() <= 3 || !word.is_ascii() {
        return word.to_string();
    }
    if let Some(stem) = word.strip_suffix("ies")
        && stem.len() >= 2
    {
        return format!("{stem}y");
    }
    if word.ends_with('s') && !(word.ends_with("ss") || word.ends_with("us") || word.ends_with("is"))
    {
        return word[..word.len() - 1].to_string();
    }
    word.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_punctuation_and_underscores() {
        assert_eq!(tokenize("email_sender"), vec!["email", "sender"]);
        assert_eq!(tokenize("calendar/event, v2!"), vec!["calendar", "event", "v2"]);
    }

    #[test]
    fn drops_stopwords() {
        assert_eq!(tokenize("Can you send it to my team"), vec!["send", "team"]);
        assert!(tokenize("to the and of").is_empty());
    }

    #[test]
    fn folds_plurals() {
        assert_eq!(fold("recipients"), "recipient");
        assert_eq!(fold("queries"), "query");
        assert_eq!(fold("address"), "address");
        assert_eq!(fold("status"), "status");
        assert_eq!(fold("analysis"), "analysis");
        assert_eq!(fold("bus"), "bus");
    }

    #[test]
    fn non_ascii_is_kept_intact() {
        assert_eq!(tokenize("Café Menüs"), vec!["café", "menüs"]);
    }
}
