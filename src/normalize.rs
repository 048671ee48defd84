//! Text normalization shared by the exact cache, the rule filter and batch
//! grouping.
//!
//! Two texts that normalize to the same string are treated as the same
//! content: they share an exact-cache entry and, inside one queue batch,
//! a single orchestrator call.

/// Runs of the same character longer than this are cut back to it.
const MAX_CHAR_RUN: usize = 2;

/// Longest repeated unit ("ha", "23", "lo") collapsed by [`normalize`].
const MAX_UNIT_LEN: usize = 3;

/// Normalize user text for keying.
///
/// - trims and lowercases
/// - collapses any whitespace run to a single space
/// - collapses runs of the same punctuation mark to one (`"!!!"` → `"!"`)
/// - cuts other repeated characters to two (`"哈哈哈哈"` → `"哈哈"`)
/// - cuts repeated short units to two (`"hahahaha"` → `"haha"`)
///
/// # Panics
///
/// This function never panics.
pub fn normalize(text: &str) -> String {
    let lowered = text.trim().to_lowercase();
    let spaced: Vec<char> = lowered
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .collect();

    let mut collapsed = collapse_char_runs(&spaced);
    for unit in 2..=MAX_UNIT_LEN {
        collapsed = collapse_repeated_units(&collapsed, unit);
    }
    collapsed.into_iter().collect()
}

/// `true` for ASCII punctuation and the common full-width marks.
pub fn is_punctuation(c: char) -> bool {
    c.is_ascii_punctuation()
        || matches!(
            c,
            '！' | '？' | '。' | '，' | '、' | '；' | '：' | '～' | '…' | '·' | '「' | '」' | '【' | '】'
        )
}

/// `true` for CJK ideographs, kana and hangul.
pub fn is_cjk(c: char) -> bool {
    matches!(
        c as u32,
        0x3040..=0x30FF      // hiragana, katakana
            | 0x3400..=0x4DBF // CJK extension A
            | 0x4E00..=0x9FFF // CJK unified ideographs
            | 0xAC00..=0xD7AF // hangul syllables
            | 0xF900..=0xFAFF // CJK compatibility ideographs
            | 0x20000..=0x2A6DF
    )
}

fn collapse_char_runs(chars: &[char]) -> Vec<char> {
    let mut out = Vec::with_capacity(chars.len());
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let mut run = 1;
        while i + run < chars.len() && chars[i + run] == c {
            run += 1;
        }
        let keep = if is_punctuation(c) || c == ' ' {
            1
        } else {
            run.min(MAX_CHAR_RUN)
        };
        out.extend(std::iter::repeat(c).take(keep));
        i += run;
    }
    out
}

fn collapse_repeated_units(chars: &[char], unit: usize) -> Vec<char> {
    let mut out = Vec::with_capacity(chars.len());
    let mut i = 0;
    while i < chars.len() {
        if i + unit * 3 <= chars.len() {
            let pattern = &chars[i..i + unit];
            let mut reps = 1;
            while i + (reps + 1) * unit <= chars.len()
                && &chars[i + reps * unit..i + (reps + 1) * unit] == pattern
            {
                reps += 1;
            }
            if reps >= 3 && pattern.iter().any(|c| *c != ' ') {
                out.extend_from_slice(pattern);
                out.extend_from_slice(pattern);
                i += reps * unit;
                continue;
            }
        }
        out.push(chars[i]);
        i += 1;
    }
    out
}
