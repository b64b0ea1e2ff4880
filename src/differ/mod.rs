use crate::{Block, BlockAction, ChangeType, split_lines};

/// Above this many DP cells a diff degrades to one whole-file block.
pub const MAX_DIFF_CELLS: usize = 2_000_000;

/// Unchanged lines captured on each side of a block.
pub const CONTEXT_LINES: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Equal,
    Delete,
    Insert,
}

/// Whether an `m x n` comparison is too large for the full LCS table.
pub(crate) fn exceeds_limit(m: usize, n: usize) -> bool {
    m.saturating_mul(n) > MAX_DIFF_CELLS
}

/// Dense LCS length table, `(m + 1) x (n + 1)`, row-major.
struct LcsTable {
    cols: usize,
    cells: Vec<u32>,
}

impl LcsTable {
    fn build(a: &[String], b: &[String]) -> Self {
        let cols = b.len() + 1;
        let mut cells = vec![0u32; (a.len() + 1) * cols];
        for i in 1..=a.len() {
            for j in 1..=b.len() {
                cells[i * cols + j] = if a[i - 1] == b[j - 1] {
                    cells[(i - 1) * cols + j - 1] + 1
                } else {
                    cells[(i - 1) * cols + j].max(cells[i * cols + j - 1])
                };
            }
        }
        Self { cols, cells }
    }

    fn get(&self, i: usize, j: usize) -> u32 {
        self.cells[i * self.cols + j]
    }
}

/// Backtrace the LCS table into a forward edit script.
///
/// Ties between an insertion and a deletion resolve to the insertion so
/// the same inputs always produce the same block boundaries.
fn edit_script(a: &[String], b: &[String]) -> Vec<Op> {
    let table = LcsTable::build(a, b);
    let (mut i, mut j) = (a.len(), b.len());
    let mut ops = Vec::with_capacity(i + j);

    while i > 0 || j > 0 {
        if i > 0 && j > 0 && a[i - 1] == b[j - 1] {
            ops.push(Op::Equal);
            i -= 1;
            j -= 1;
        } else if j > 0 && (i == 0 || table.get(i, j - 1) >= table.get(i - 1, j)) {
            ops.push(Op::Insert);
            j -= 1;
        } else {
            ops.push(Op::Delete);
            i -= 1;
        }
    }

    ops.reverse();
    ops
}

/// Compute the change blocks between two texts.
///
/// Blocks come out in file order with ids `block-0`, `block-1`, ... and
/// action `Pending`. An empty side yields a single added/deleted block, and
/// comparisons larger than [`MAX_DIFF_CELLS`] yield one `Modified` block
/// spanning both files (low fidelity, but bounded in time and memory).
pub fn diff_lines(before: &str, after: &str) -> Vec<Block> {
    let a = split_lines(before);
    let b = split_lines(after);
    diff_line_slices(&a, &b)
}

/// Same as [`diff_lines`], over already split lines.
pub fn diff_line_slices(a: &[String], b: &[String]) -> Vec<Block> {
    if a.is_empty() && b.is_empty() {
        return Vec::new();
    }
    if a.is_empty() || b.is_empty() || exceeds_limit(a.len(), b.len()) {
        return vec![make_block(0, a, b, 0..a.len(), 0..b.len())];
    }

    let mut blocks = Vec::new();
    let (mut bi, mut ai) = (0usize, 0usize);
    let mut open: Option<(usize, usize)> = None;

    for op in edit_script(a, b) {
        match op {
            Op::Equal => {
                if let Some((before_start, after_start)) = open.take() {
                    blocks.push(make_block(
                        blocks.len(),
                        a,
                        b,
                        before_start..bi,
                        after_start..ai,
                    ));
                }
                bi += 1;
                ai += 1;
            }
            Op::Delete => {
                open.get_or_insert((bi, ai));
                bi += 1;
            }
            Op::Insert => {
                open.get_or_insert((bi, ai));
                ai += 1;
            }
        }
    }
    if let Some((before_start, after_start)) = open.take() {
        blocks.push(make_block(
            blocks.len(),
            a,
            b,
            before_start..bi,
            after_start..ai,
        ));
    }

    attach_context(&mut blocks, b);
    blocks
}

fn make_block(
    index: usize,
    a: &[String],
    b: &[String],
    before: std::ops::Range<usize>,
    after: std::ops::Range<usize>,
) -> Block {
    let before_lines = a[before.clone()].to_vec();
    let after_lines = b[after.clone()].to_vec();
    Block {
        id: format!("block-{index}"),
        before_start: before.start,
        before_end: before.end,
        after_start: after.start,
        after_end: after.end,
        change_type: ChangeType::classify(before_lines.len(), after_lines.len()),
        before_lines,
        after_lines,
        action: BlockAction::Pending,
        context_before: Vec::new(),
        context_after: Vec::new(),
    }
}

/// Fill each block's context windows from the after-sequence.
///
/// A window never reaches past a neighbouring block's boundary, so it only
/// ever holds lines no decision can change.
fn attach_context(blocks: &mut [Block], after: &[String]) {
    let bounds: Vec<(usize, usize)> = blocks.iter().map(|b| (b.after_start, b.after_end)).collect();

    for (k, block) in blocks.iter_mut().enumerate() {
        let (start, end) = bounds[k];
        let lower = if k > 0 { bounds[k - 1].1 } else { 0 };
        let upper = bounds.get(k + 1).map_or(after.len(), |next| next.0);

        let ctx_start = start.saturating_sub(CONTEXT_LINES).max(lower);
        let ctx_end = (end + CONTEXT_LINES).min(upper);
        block.context_before = after[ctx_start..start].to_vec();
        block.context_after = after[end..ctx_end].to_vec();
    }
}
