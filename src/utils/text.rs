/// Turns a free-form topic into something safe to use as a file name.
/// Runs of path separators, reserved characters and whitespace collapse
/// into a single `_`; the result is capped at `max_chars` characters.
pub fn sanitize_filename(name: &str, max_chars: usize) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_was_sep = false;

    for c in name.chars() {
        let illegal = matches!(c, '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|')
            || c.is_whitespace();
        if illegal {
            if !last_was_sep {
                out.push('_');
                last_was_sep = true;
            }
        } else {
            out.push(c);
            last_was_sep = false;
        }
    }

    let trimmed = out.trim_matches('_');
    let capped: String = trimmed.chars().take(max_chars).collect();
    let capped = capped.trim_end_matches('_');

    if capped.is_empty() {
        "untitled".to_string()
    } else {
        capped.to_string()
    }
}

/// First `max_chars` characters of `text`, with an ellipsis when cut.
pub fn preview(text: &str, max_chars: usize) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{}…", head)
    } else {
        head
    }
}
