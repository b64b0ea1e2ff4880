use crate::differ::CONTEXT_LINES;

/// What to search for in a document.
#[derive(Debug, Clone, Copy)]
pub struct Needle<'a> {
    /// The block's lines as the document currently shows them.
    pub lines: &'a [String],
    pub context_before: &'a [String],
    pub context_after: &'a [String],
    /// Last known start of the block; breaks ties between repeated content.
    pub preferred_index: usize,
}

/// Result of a locate operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    /// 0-based line where the block starts (or would be inserted).
    pub start_index: usize,
    /// 1-based line to reveal for this block.
    pub anchor_line: usize,
    /// `false` when nothing matched and `start_index` is the clamped hint.
    pub matched: bool,
}

/// Find the most plausible current start of a block in `document`.
///
/// A start offset matches when the last lines of the before-context end
/// right there, the needle follows, and the first lines of the
/// after-context follow the needle. Empty inputs are not checked. Among
/// all matches the one closest to `preferred_index` wins (the earliest on
/// a tie). Without any match, `preferred_index` is clamped into the
/// document.
///
/// Never cache the result across document edits.
pub fn locate(document: &[String], needle: &Needle<'_>) -> Location {
    let context_before = tail(needle.context_before);
    let context_after = head(needle.context_after);
    let preferred = needle.preferred_index;

    let mut best: Option<usize> = None;
    for start in 0..=document.len() {
        if !matches_at(document, start, context_before, needle.lines, context_after) {
            continue;
        }
        best = match best {
            Some(current) if current.abs_diff(preferred) <= start.abs_diff(preferred) => {
                Some(current)
            }
            _ => Some(start),
        };
    }

    let start_index = best.unwrap_or_else(|| preferred.min(document.len()));
    Location {
        start_index,
        anchor_line: anchor_line(start_index, document.len()),
        matched: best.is_some(),
    }
}

fn matches_at(
    document: &[String],
    start: usize,
    context_before: &[String],
    lines: &[String],
    context_after: &[String],
) -> bool {
    if start < context_before.len() || document[start - context_before.len()..start] != *context_before
    {
        return false;
    }
    let end = start + lines.len();
    if end > document.len() || document[start..end] != *lines {
        return false;
    }
    let context_end = end + context_after.len();
    context_end <= document.len() && document[end..context_end] == *context_after
}

fn tail(lines: &[String]) -> &[String] {
    &lines[lines.len().saturating_sub(CONTEXT_LINES)..]
}

fn head(lines: &[String]) -> &[String] {
    &lines[..lines.len().min(CONTEXT_LINES)]
}

fn anchor_line(start_index: usize, len: usize) -> usize {
    if len == 0 {
        1
    } else if start_index >= len {
        len
    } else {
        start_index + 1
    }
}
