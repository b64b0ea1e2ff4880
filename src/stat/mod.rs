use crate::differ::exceeds_limit;
use crate::{DiffStat, split_lines};

/// Count added and removed lines between two texts.
///
/// Applies the same degenerate-case handling and size guard as
/// [`crate::differ::diff_lines`], so the counts always equal the line
/// counts of the blocks the differ would emit for the same inputs.
pub fn diff_stat(before: &str, after: &str) -> DiffStat {
    let a = split_lines(before);
    let b = split_lines(after);
    line_stat(&a, &b)
}

/// Same as [`diff_stat`], over already split lines.
pub fn line_stat(a: &[String], b: &[String]) -> DiffStat {
    let (m, n) = (a.len(), b.len());
    if m == 0 {
        return DiffStat { added: n, removed: 0 };
    }
    if n == 0 {
        return DiffStat { added: 0, removed: m };
    }
    if exceeds_limit(m, n) {
        return DiffStat { added: n, removed: m };
    }

    let common = lcs_length(a, b);
    DiffStat {
        added: n - common,
        removed: m - common,
    }
}

/// LCS length with two rolling rows.
fn lcs_length(a: &[String], b: &[String]) -> usize {
    let mut prev = vec![0u32; b.len() + 1];
    let mut curr = vec![0u32; b.len() + 1];
    for line in a {
        for j in 1..=b.len() {
            curr[j] = if *line == b[j - 1] {
                prev[j - 1] + 1
            } else {
                prev[j].max(curr[j - 1])
            };
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()] as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::differ::{diff_line_slices, diff_lines};

    #[test]
    fn single_modification() {
        assert_eq!(
            diff_stat("a\nb\nc", "a\nX\nc"),
            DiffStat {
                added: 1,
                removed: 1
            }
        );
    }

    #[test]
    fn empty_before_counts_every_line_added() {
        assert_eq!(
            diff_stat("", "hello"),
            DiffStat {
                added: 1,
                removed: 0
            }
        );
    }

    #[test]
    fn empty_after_counts_every_line_removed() {
        assert_eq!(
            diff_stat("x\ny\nz", ""),
            DiffStat {
                added: 0,
                removed: 3
            }
        );
    }

    #[test]
    fn identical_texts() {
        assert_eq!(diff_stat("same\ntext", "same\ntext"), DiffStat::default());
    }

    #[test]
    fn agrees_with_block_line_counts() {
        let before = "fn a() {}\nfn b() {}\n\nfn c() {}\nfn d() {}";
        let after = "fn a() {}\nfn b2() {}\n\nfn c() {}\nfn e() {}\nfn d() {}\n";
        let stat = diff_stat(before, after);
        let blocks = diff_lines(before, after);
        let added: usize = blocks.iter().map(|b| b.after_lines.len()).sum();
        let removed: usize = blocks.iter().map(|b| b.before_lines.len()).sum();
        assert_eq!(stat, DiffStat { added, removed });
    }

    #[test]
    fn oversized_counts_match_fallback_block() {
        let before: Vec<String> = (0..2000).map(|i| format!("line {i}")).collect();
        let after: Vec<String> = (0..1001).map(|i| format!("line {i}")).collect();
        let stat = line_stat(&before, &after);
        let blocks = diff_line_slices(&before, &after);
        assert_eq!(blocks.len(), 1);
        assert_eq!(
            stat,
            DiffStat {
                added: blocks[0].after_lines.len(),
                removed: blocks[0].before_lines.len()
            }
        );
    }
}
