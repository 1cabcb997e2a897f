//! Pure text normalization and chunking helpers (§4.5, §4.8), applied
//! identically across every source kind before a document reaches the
//! indexer's embedding step.

/// Decode common escape sequences, unify newlines, collapse runs of 3+ blank
/// lines down to 2, and trim whitespace-only lines. Pure function: same
/// input always produces the same output, no I/O.
pub fn normalize_text(input: &str) -> String {
    let unified = input.replace("\r\n", "\n").replace('\r', "\n");
    let decoded = decode_escapes(&unified);

    let mut out = String::with_capacity(decoded.len());
    let mut blank_run = 0usize;
    for line in decoded.split('\n') {
        let trimmed = line.trim_end();
        if trimmed.trim().is_empty() {
            blank_run += 1;
            if blank_run <= 2 {
                out.push('\n');
            }
        } else {
            blank_run = 0;
            out.push_str(trimmed);
            out.push('\n');
        }
    }
    out.trim_end_matches('\n').to_string()
}

fn decode_escapes(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.peek() {
                Some('n') => {
                    chars.next();
                    out.push('\n');
                }
                Some('t') => {
                    chars.next();
                    out.push('\t');
                }
                _ => out.push(c),
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Rough token estimate: ~4 characters per token, the same heuristic used
/// across the LLM provider implementations for context-window budgeting.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Split normalized text into chunks whose estimated token count stays under
/// `max_tokens * safety_margin` (≤90% of the model's context by default),
/// splitting on paragraph boundaries where possible so a chunk doesn't cut a
/// sentence in half.
pub fn chunk_by_tokens(text: &str, max_tokens: usize, safety_margin: f64) -> Vec<String> {
    let budget = ((max_tokens as f64) * safety_margin).floor() as usize;
    if budget == 0 || text.is_empty() {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    for paragraph in text.split("\n\n") {
        let candidate = if current.is_empty() {
            paragraph.to_string()
        } else {
            format!("{current}\n\n{paragraph}")
        };
        if estimate_tokens(&candidate) > budget && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
            current = paragraph.to_string();
        } else {
            current = candidate;
        }

        // A single paragraph larger than the budget gets hard-split by chars.
        while estimate_tokens(&current) > budget {
            let char_budget = budget * 4;
            let split_at = current
                .char_indices()
                .nth(char_budget)
                .map(|(i, _)| i)
                .unwrap_or(current.len());
            let (head, tail) = current.split_at(split_at);
            chunks.push(head.to_string());
            current = tail.to_string();
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    if chunks.is_empty() {
        chunks.push(String::new());
    }
    chunks
}
