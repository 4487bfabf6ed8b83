/// Markdown-safe text chunking for channels with per-message limits.
///
/// Long text is split on the best available boundary (paragraph, then
/// newline, then sentence) within `[min_chars, max_chars]`. When a split
/// lands inside a fenced code block, the fence is closed on the current
/// chunk and reopened with the same language tag on the next, so every
/// chunk parses as a closed Markdown document.

const FENCE: &str = "```";

pub fn chunk_text(text: &str, min_chars: usize, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(8);
    let min_chars = min_chars.min(max_chars / 2);
    if text.chars().count() <= max_chars {
        return vec![text.to_string()];
    }

    // Reserve room for a closing fence on every chunk; cheaper than
    // tracking whether each flush will need one.
    let budget = max_chars.saturating_sub(FENCE.len() + 1);

    let mut raw_chunks: Vec<String> = Vec::new();
    let mut current = String::new();

    for piece in split_pieces(text, budget, min_chars) {
        let piece_len = piece.chars().count();
        let current_len = current.chars().count();
        if current_len > 0 && current_len + piece_len > budget {
            raw_chunks.push(std::mem::take(&mut current));
        }
        current.push_str(&piece);
    }
    if !current.trim().is_empty() {
        raw_chunks.push(current);
    }

    balance_fences(raw_chunks)
}

/// Break the text into flushable pieces: paragraphs, then lines, then
/// sentence/hard splits for anything still over budget.
fn split_pieces(text: &str, budget: usize, min_chars: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    for paragraph in split_paragraphs(text) {
        if paragraph.chars().count() <= budget {
            pieces.push(paragraph);
            continue;
        }
        for line in split_keep_newlines(&paragraph) {
            if line.chars().count() <= budget {
                pieces.push(line);
                continue;
            }
            pieces.extend(split_long_line(&line, min_chars, budget));
        }
    }
    pieces
}

/// Split on blank lines, keeping the separators attached to the preceding
/// paragraph so rejoining is lossless.
fn split_paragraphs(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut blank_run = false;
    for line in split_keep_newlines(text) {
        let is_blank = line.trim().is_empty();
        if blank_run && !is_blank && !current.is_empty() {
            out.push(std::mem::take(&mut current));
        }
        blank_run = is_blank;
        current.push_str(&line);
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

fn split_keep_newlines(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut start = 0;
    for (i, c) in text.char_indices() {
        if c == '\n' {
            out.push(text[start..=i].to_string());
            start = i + c.len_utf8();
        }
    }
    if start < text.len() {
        out.push(text[start..].to_string());
    }
    out
}

/// Split an oversized single line, preferring sentence boundaries.
fn split_long_line(line: &str, min_chars: usize, max_chars: usize) -> Vec<String> {
    let mut out = Vec::new();
    let chars: Vec<char> = line.chars().collect();
    let mut start = 0;
    while start < chars.len() {
        let remaining = chars.len() - start;
        if remaining <= max_chars {
            out.push(chars[start..].iter().collect());
            break;
        }
        let window_end = start + max_chars;
        let floor = start + min_chars.min(max_chars / 2);
        let mut cut = window_end;
        let mut i = window_end - 1;
        while i > floor {
            if chars[i - 1] == '.' && chars[i] == ' ' {
                cut = i + 1;
                break;
            }
            i -= 1;
        }
        out.push(chars[start..cut].iter().collect());
        start = cut;
    }
    out
}

/// Close any fence left open at a chunk boundary and reopen it (with the
/// same language tag) at the start of the next chunk. Each chunk is
/// scanned from a closed state, which is exactly how a Markdown renderer
/// will see it.
fn balance_fences(raw: Vec<String>) -> Vec<String> {
    let mut out = Vec::new();
    let mut carry: Option<String> = None; // language of a fence to reopen

    for chunk in raw {
        let mut text = match carry.take() {
            Some(lang) => format!("{FENCE}{lang}\n{chunk}"),
            None => chunk,
        };
        let end = scan_fences(&text);
        if let Some(lang) = end {
            if !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(FENCE);
            carry = Some(lang);
        }
        let text = text.trim_end_matches('\n').to_string();
        if !text.trim().is_empty() {
            out.push(text);
        }
    }

    out
}

/// Returns `Some(language)` when the text ends inside an open fence.
fn scan_fences(text: &str) -> Option<String> {
    let mut open: Option<String> = None;
    for line in text.lines() {
        let trimmed = line.trim_start();
        if let Some(rest) = trimmed.strip_prefix(FENCE) {
            open = match open {
                Some(_) => None,
                None => Some(rest.trim().to_string()),
            };
        }
    }
    open
}

/// Every chunk must contain an even number of fence markers.
pub fn is_closed_markdown(chunk: &str) -> bool {
    scan_fences(chunk).is_none()
}
