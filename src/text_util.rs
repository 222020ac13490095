/// Maximum number of characters in a result preview before truncation.
pub const DEFAULT_PREVIEW_CHARS: usize = 200;

/// Words too common to carry meaning in a file-finding query.
const STOP_WORDS: &[&str] = &[
    "a", "about", "all", "an", "and", "any", "are", "as", "at", "be", "by",
    "can", "did", "do", "does", "file", "files", "find", "for", "from", "get",
    "had", "has", "have", "i", "in", "is", "it", "its", "me", "my", "of",
    "on", "or", "please", "show", "that", "the", "their", "this", "to", "was",
    "what", "where", "which", "with", "you", "your",
];

/// Lowercase query terms with punctuation stripped and stop words removed.
///
/// Terms shorter than two characters are dropped unless they are digits.
///
/// # Examples
///
/// ```
/// use deskindex::text_util::extract_keywords;
///
/// assert_eq!(
///     extract_keywords("Where is my 2024 Budget?"),
///     vec!["2024".to_string(), "budget".to_string()],
/// );
/// ```
pub fn extract_keywords(query: &str) -> Vec<String> {
    let mut keywords: Vec<String> = Vec::new();
    for word in query
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '-' && c != '_')
        .map(|w| w.trim_matches(|c: char| c == '-' || c == '_'))
    {
        let short = word.chars().count() < 2
            && !word.chars().all(|c| c.is_ascii_digit());
        if word.is_empty() || short || STOP_WORDS.contains(&word) {
            continue;
        }
        if !keywords.iter().any(|k| k == word) {
            keywords.push(word.to_string());
        }
    }
    keywords
}

/// Fraction of `keywords` that occur as substrings of `text`, ignoring case.
///
/// Returns 0 when there are no keywords.
pub fn keyword_score(keywords: &[String], text: &str) -> f32 {
    if keywords.is_empty() {
        return 0.0;
    }
    let haystack = text.to_lowercase();
    let hits = keywords
        .iter()
        .filter(|k| haystack.contains(k.as_str()))
        .count();
    hits as f32 / keywords.len() as f32
}

/// First `max_chars` characters of `text` on a single line, with an
/// ellipsis when truncated.
pub fn preview(text: &str, max_chars: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        return flat;
    }
    let mut out: String = flat.chars().take(max_chars).collect();
    out.push_str("...");
    out
}

/// Prefix of `text` holding at most `max_chars` characters.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Apply line offset and optional line limit to a block of text.
///
/// `start_line` is 1-indexed. If `max_lines` is `Some(n)`, at most `n` lines
/// are returned with a truncation notice appended.
pub fn apply_line_limits(
    text: &str,
    start_line: usize,
    max_lines: Option<usize>,
) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start_idx = start_line.saturating_sub(1);
    if start_idx >= lines.len() {
        return String::new();
    }

    let end_idx = max_lines
        .map_or(lines.len(), |max| (start_idx + max).min(lines.len()));

    let mut slice = lines[start_idx..end_idx].join("\n");
    if end_idx < lines.len() {
        slice.push_str(&format!(
            "\n\n[... truncated {} more lines]",
            lines.len() - end_idx
        ));
    }
    slice
}
