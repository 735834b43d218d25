//! Character-level diffing.
//!
//! Myers' O(ND) bisection with the usual speedups (common prefix/suffix
//! trimming, half-match splitting, line-mode pre-pass for long texts) and the
//! cleanup passes that turn a minimal diff into a human-shaped one.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Time budget for a single top-level diff before falling back to a
/// coarser (but still valid) result.
pub const DIFF_TIMEOUT: Duration = Duration::from_secs(1);

/// Cost of an empty edit operation in terms of edit characters.
pub const DIFF_EDIT_COST: usize = 4;

/// Below this length on both sides, line mode is not worth it.
const LINE_MODE_THRESHOLD: usize = 100;

/// Largest line index representable as a scalar value once the surrogate
/// block is skipped.
const MAX_LINES: usize = 0x10FFFF - 0x800;

/// Kind of a diff segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    Delete,
    Insert,
    Equal,
}

/// One segment of a diff: an operation and the characters it covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diff {
    pub op: Operation,
    pub text: Vec<char>,
}

impl Diff {
    pub fn new(op: Operation, text: impl Into<Vec<char>>) -> Self {
        Self {
            op,
            text: text.into(),
        }
    }

    pub fn equal(text: &[char]) -> Self {
        Self::new(Operation::Equal, text.to_vec())
    }

    pub fn insert(text: &[char]) -> Self {
        Self::new(Operation::Insert, text.to_vec())
    }

    pub fn delete(text: &[char]) -> Self {
        Self::new(Operation::Delete, text.to_vec())
    }

    pub fn text_string(&self) -> String {
        self.text.iter().collect()
    }
}

/// Compute the diff between two texts.
///
/// `checklines` enables the line-level pre-pass for long inputs, which is
/// faster but may produce a slightly less minimal result.
pub fn diff_main(text1: &[char], text2: &[char], checklines: bool) -> Vec<Diff> {
    diff_until(text1, text2, checklines, Instant::now() + DIFF_TIMEOUT)
}

fn diff_until(text1: &[char], text2: &[char], checklines: bool, deadline: Instant) -> Vec<Diff> {
    if text1 == text2 {
        if text1.is_empty() {
            return Vec::new();
        }
        return vec![Diff::equal(text1)];
    }

    let prefix_len = common_prefix(text1, text2);
    let prefix = &text1[..prefix_len];
    let text1 = &text1[prefix_len..];
    let text2 = &text2[prefix_len..];

    let suffix_len = common_suffix(text1, text2);
    let suffix = &text1[text1.len() - suffix_len..];
    let text1 = &text1[..text1.len() - suffix_len];
    let text2 = &text2[..text2.len() - suffix_len];

    let mut diffs = compute(text1, text2, checklines, deadline);

    if !prefix.is_empty() {
        diffs.insert(0, Diff::equal(prefix));
    }
    if !suffix.is_empty() {
        diffs.push(Diff::equal(suffix));
    }
    cleanup_merge(&mut diffs);
    diffs
}

/// Diff two texts that share no common prefix or suffix.
fn compute(text1: &[char], text2: &[char], checklines: bool, deadline: Instant) -> Vec<Diff> {
    if text1.is_empty() {
        return vec![Diff::insert(text2)];
    }
    if text2.is_empty() {
        return vec![Diff::delete(text1)];
    }

    let (long, short) = if text1.len() > text2.len() {
        (text1, text2)
    } else {
        (text2, text1)
    };

    if let Some(i) = find(long, short, 0) {
        // Shorter text is inside the longer one.
        let op = if text1.len() > text2.len() {
            Operation::Delete
        } else {
            Operation::Insert
        };
        return vec![
            Diff::new(op, long[..i].to_vec()),
            Diff::equal(short),
            Diff::new(op, long[i + short.len()..].to_vec()),
        ];
    }

    if short.len() == 1 {
        // Single character string, and it is not inside the other one.
        return vec![Diff::delete(text1), Diff::insert(text2)];
    }

    if let Some(hm) = half_match(text1, text2) {
        let mut diffs = diff_until(hm.text1_a, hm.text2_a, checklines, deadline);
        diffs.push(Diff::equal(hm.common));
        diffs.extend(diff_until(hm.text1_b, hm.text2_b, checklines, deadline));
        return diffs;
    }

    if checklines && text1.len() > LINE_MODE_THRESHOLD && text2.len() > LINE_MODE_THRESHOLD {
        return line_mode(text1, text2, deadline);
    }

    bisect(text1, text2, deadline)
}

/// Quick line-level diff, then rediff the replaced blocks character by
/// character.
fn line_mode(text1: &[char], text2: &[char], deadline: Instant) -> Vec<Diff> {
    let encoded = lines_to_chars(text1, text2);
    let mut diffs = diff_until(&encoded.chars1, &encoded.chars2, false, deadline);
    chars_to_lines(&mut diffs, &encoded.lines);
    cleanup_semantic(&mut diffs);

    // Dummy equality flushes the final run.
    diffs.push(Diff::new(Operation::Equal, Vec::new()));
    let mut out: Vec<Diff> = Vec::with_capacity(diffs.len());
    let mut text_delete: Vec<char> = Vec::new();
    let mut text_insert: Vec<char> = Vec::new();
    let mut count_delete = 0usize;
    let mut count_insert = 0usize;
    for diff in diffs {
        match diff.op {
            Operation::Insert => {
                count_insert += 1;
                text_insert.extend_from_slice(&diff.text);
                out.push(diff);
            }
            Operation::Delete => {
                count_delete += 1;
                text_delete.extend_from_slice(&diff.text);
                out.push(diff);
            }
            Operation::Equal => {
                if count_delete >= 1 && count_insert >= 1 {
                    out.truncate(out.len() - count_delete - count_insert);
                    out.extend(diff_until(&text_delete, &text_insert, false, deadline));
                }
                count_delete = 0;
                count_insert = 0;
                text_delete.clear();
                text_insert.clear();
                out.push(diff);
            }
        }
    }
    out.pop();
    out
}

/// Find the 'middle snake' of a diff, split the problem in two and return
/// the recursively constructed diff.
fn bisect(text1: &[char], text2: &[char], deadline: Instant) -> Vec<Diff> {
    let len1 = text1.len() as isize;
    let len2 = text2.len() as isize;
    let max_d = (len1 + len2 + 1) / 2;
    let v_offset = max_d;
    let v_length = 2 * max_d;
    let mut v1 = vec![-1isize; v_length as usize];
    let mut v2 = vec![-1isize; v_length as usize];
    v1[(v_offset + 1) as usize] = 0;
    v2[(v_offset + 1) as usize] = 0;
    let delta = len1 - len2;
    // If the total number of characters is odd, then the front path will
    // collide with the reverse path.
    let front = delta % 2 != 0;
    let mut k1start = 0isize;
    let mut k1end = 0isize;
    let mut k2start = 0isize;
    let mut k2end = 0isize;

    for d in 0..max_d {
        if Instant::now() > deadline {
            break;
        }

        let mut k1 = -d + k1start;
        while k1 <= d - k1end {
            let k1_offset = (v_offset + k1) as usize;
            let mut x1 = if k1 == -d || (k1 != d && v1[k1_offset - 1] < v1[k1_offset + 1]) {
                v1[k1_offset + 1]
            } else {
                v1[k1_offset - 1] + 1
            };
            let mut y1 = x1 - k1;
            while x1 < len1 && y1 < len2 && text1[x1 as usize] == text2[y1 as usize] {
                x1 += 1;
                y1 += 1;
            }
            v1[k1_offset] = x1;
            if x1 > len1 {
                // Ran off the right of the graph.
                k1end += 2;
            } else if y1 > len2 {
                // Ran off the bottom of the graph.
                k1start += 2;
            } else if front {
                let k2_offset = v_offset + delta - k1;
                if k2_offset >= 0 && k2_offset < v_length && v2[k2_offset as usize] != -1 {
                    // Mirror x2 onto top-left coordinate system.
                    let x2 = len1 - v2[k2_offset as usize];
                    if x1 >= x2 {
                        return bisect_split(text1, text2, x1 as usize, y1 as usize, deadline);
                    }
                }
            }
            k1 += 2;
        }

        let mut k2 = -d + k2start;
        while k2 <= d - k2end {
            let k2_offset = (v_offset + k2) as usize;
            let mut x2 = if k2 == -d || (k2 != d && v2[k2_offset - 1] < v2[k2_offset + 1]) {
                v2[k2_offset + 1]
            } else {
                v2[k2_offset - 1] + 1
            };
            let mut y2 = x2 - k2;
            while x2 < len1
                && y2 < len2
                && text1[(len1 - x2 - 1) as usize] == text2[(len2 - y2 - 1) as usize]
            {
                x2 += 1;
                y2 += 1;
            }
            v2[k2_offset] = x2;
            if x2 > len1 {
                k2end += 2;
            } else if y2 > len2 {
                k2start += 2;
            } else if !front {
                let k1_offset = v_offset + delta - k2;
                if k1_offset >= 0 && k1_offset < v_length && v1[k1_offset as usize] != -1 {
                    let x1 = v1[k1_offset as usize];
                    let y1 = v_offset + x1 - k1_offset;
                    let x2 = len1 - x2;
                    if x1 >= x2 {
                        return bisect_split(text1, text2, x1 as usize, y1 as usize, deadline);
                    }
                }
            }
            k2 += 2;
        }
    }

    // Out of time or no commonality at all.
    vec![Diff::delete(text1), Diff::insert(text2)]
}

fn bisect_split(text1: &[char], text2: &[char], x: usize, y: usize, deadline: Instant) -> Vec<Diff> {
    let mut diffs = diff_until(&text1[..x], &text2[..y], false, deadline);
    diffs.extend(diff_until(&text1[x..], &text2[y..], false, deadline));
    diffs
}

struct HalfMatch<'a> {
    text1_a: &'a [char],
    text1_b: &'a [char],
    text2_a: &'a [char],
    text2_b: &'a [char],
    common: &'a [char],
}

/// Do the two texts share a substring which is at least half the length of
/// the longer text? This speedup can produce non-minimal diffs.
fn half_match<'a>(text1: &'a [char], text2: &'a [char]) -> Option<HalfMatch<'a>> {
    let (long, short) = if text1.len() > text2.len() {
        (text1, text2)
    } else {
        (text2, text1)
    };
    if long.len() < 4 || short.len() * 2 < long.len() {
        return None;
    }

    // Check if the second quarter is the seed for a half-match, then the
    // third quarter.
    let hm1 = half_match_at(long, short, (long.len() + 3) / 4);
    let hm2 = half_match_at(long, short, (long.len() + 1) / 2);
    let hm = match (hm1, hm2) {
        (None, None) => return None,
        (Some(hm), None) | (None, Some(hm)) => hm,
        (Some(a), Some(b)) => {
            if a.common.len() > b.common.len() {
                a
            } else {
                b
            }
        }
    };

    if text1.len() > text2.len() {
        Some(hm)
    } else {
        Some(HalfMatch {
            text1_a: hm.text2_a,
            text1_b: hm.text2_b,
            text2_a: hm.text1_a,
            text2_b: hm.text1_b,
            common: hm.common,
        })
    }
}

/// Does a substring of `short` exist within `long` such that it is at least
/// half the length of `long`? The seed starts at index `i` of `long`.
/// In the returned match `text1_*` refers to `long` and `text2_*` to `short`.
fn half_match_at<'a>(long: &'a [char], short: &'a [char], i: usize) -> Option<HalfMatch<'a>> {
    let seed = &long[i..i + long.len() / 4];
    let mut best: Option<(usize, usize, usize, usize)> = None;
    let mut best_len = 0usize;

    let mut from = 0usize;
    while let Some(j) = find(short, seed, from) {
        let prefix_len = common_prefix(&long[i..], &short[j..]);
        let suffix_len = common_suffix(&long[..i], &short[..j]);
        if best_len < suffix_len + prefix_len {
            best_len = suffix_len + prefix_len;
            best = Some((i - suffix_len, i + prefix_len, j - suffix_len, j + prefix_len));
        }
        from = j + 1;
    }

    let (long_a_end, long_b_start, short_a_end, short_b_start) = best?;
    if best_len * 2 >= long.len() {
        Some(HalfMatch {
            text1_a: &long[..long_a_end],
            text1_b: &long[long_b_start..],
            text2_a: &short[..short_a_end],
            text2_b: &short[short_b_start..],
            common: &short[short_a_end..short_b_start],
        })
    } else {
        None
    }
}

struct LineEncoding {
    chars1: Vec<char>,
    chars2: Vec<char>,
    lines: Vec<Vec<char>>,
}

fn lines_to_chars(text1: &[char], text2: &[char]) -> LineEncoding {
    // Index zero is reserved so that no line encodes to '\0'.
    let mut lines: Vec<Vec<char>> = vec![Vec::new()];
    let mut index: HashMap<Vec<char>, usize> = HashMap::new();
    let chars1 = encode_lines(text1, &mut lines, &mut index);
    let chars2 = encode_lines(text2, &mut lines, &mut index);
    LineEncoding {
        chars1,
        chars2,
        lines,
    }
}

fn encode_lines(
    text: &[char],
    lines: &mut Vec<Vec<char>>,
    index: &mut HashMap<Vec<char>, usize>,
) -> Vec<char> {
    let mut chars = Vec::new();
    let mut start = 0usize;
    while start < text.len() {
        let mut end = text[start..]
            .iter()
            .position(|&c| c == '\n')
            .map_or(text.len(), |offset| start + offset + 1);
        if lines.len() >= MAX_LINES {
            // Out of code points; the rest of the text becomes one line.
            end = text.len();
        }
        let line = &text[start..end];
        let line_index = match index.get(line) {
            Some(&existing) => existing,
            None => {
                lines.push(line.to_vec());
                index.insert(line.to_vec(), lines.len() - 1);
                lines.len() - 1
            }
        };
        chars.push(encode_line_index(line_index));
        start = end;
    }
    chars
}

fn encode_line_index(index: usize) -> char {
    let code = if index < 0xD800 { index } else { index + 0x800 };
    char::from_u32(code as u32).unwrap_or(char::REPLACEMENT_CHARACTER)
}

fn decode_line_index(c: char) -> usize {
    let code = c as usize;
    if code >= 0xE000 {
        code - 0x800
    } else {
        code
    }
}

fn chars_to_lines(diffs: &mut [Diff], lines: &[Vec<char>]) {
    for diff in diffs.iter_mut() {
        let mut text = Vec::new();
        for &c in &diff.text {
            if let Some(line) = lines.get(decode_line_index(c)) {
                text.extend_from_slice(line);
            }
        }
        diff.text = text;
    }
}

/// Length of the common prefix of two texts.
pub fn common_prefix(text1: &[char], text2: &[char]) -> usize {
    text1
        .iter()
        .zip(text2.iter())
        .take_while(|(a, b)| a == b)
        .count()
}

/// Length of the common suffix of two texts.
pub fn common_suffix(text1: &[char], text2: &[char]) -> usize {
    text1
        .iter()
        .rev()
        .zip(text2.iter().rev())
        .take_while(|(a, b)| a == b)
        .count()
}

/// Length of the longest suffix of `text1` that is a prefix of `text2`.
fn common_overlap(text1: &[char], text2: &[char]) -> usize {
    if text1.is_empty() || text2.is_empty() {
        return 0;
    }
    let text_len = text1.len().min(text2.len());
    let text1 = &text1[text1.len() - text_len..];
    let text2 = &text2[..text_len];
    if text1 == text2 {
        return text_len;
    }

    // Start by looking for a single character match and increase length
    // until no match is found.
    let mut best = 0;
    let mut length = 1;
    loop {
        let pattern = &text1[text_len - length..];
        let found = match find(text2, pattern, 0) {
            Some(found) => found,
            None => return best,
        };
        length += found;
        if found == 0 || text1[text_len - length..] == text2[..length] {
            best = length;
            length += 1;
        }
        if length > text_len {
            return best;
        }
    }
}

/// Reorder and merge like edit sections, merge equalities. Any edit section
/// can move as long as it doesn't cross an equality.
pub fn cleanup_merge(diffs: &mut Vec<Diff>) {
    // Dummy entry at the end.
    diffs.push(Diff::new(Operation::Equal, Vec::new()));
    let mut pointer = 0usize;
    let mut count_delete = 0usize;
    let mut count_insert = 0usize;
    let mut text_delete: Vec<char> = Vec::new();
    let mut text_insert: Vec<char> = Vec::new();

    while pointer < diffs.len() {
        match diffs[pointer].op {
            Operation::Insert => {
                count_insert += 1;
                text_insert.extend_from_slice(&diffs[pointer].text);
                pointer += 1;
            }
            Operation::Delete => {
                count_delete += 1;
                text_delete.extend_from_slice(&diffs[pointer].text);
                pointer += 1;
            }
            Operation::Equal => {
                if count_delete + count_insert > 1 {
                    if count_delete != 0 && count_insert != 0 {
                        // Factor out any common prefix.
                        let common = common_prefix(&text_insert, &text_delete);
                        if common != 0 {
                            let run_start = pointer - count_delete - count_insert;
                            if run_start > 0 && diffs[run_start - 1].op == Operation::Equal {
                                diffs[run_start - 1]
                                    .text
                                    .extend_from_slice(&text_insert[..common]);
                            } else {
                                diffs.insert(0, Diff::equal(&text_insert[..common]));
                                pointer += 1;
                            }
                            text_insert.drain(..common);
                            text_delete.drain(..common);
                        }
                        // Factor out any common suffix.
                        let common = common_suffix(&text_insert, &text_delete);
                        if common != 0 {
                            let split = text_insert.len() - common;
                            let mut merged = text_insert[split..].to_vec();
                            merged.extend_from_slice(&diffs[pointer].text);
                            diffs[pointer].text = merged;
                            text_insert.truncate(split);
                            text_delete.truncate(text_delete.len() - common);
                        }
                    }
                    // Delete the offending records and add the merged ones.
                    pointer -= count_delete + count_insert;
                    diffs.drain(pointer..pointer + count_delete + count_insert);
                    if !text_delete.is_empty() {
                        diffs.insert(pointer, Diff::delete(&text_delete));
                        pointer += 1;
                    }
                    if !text_insert.is_empty() {
                        diffs.insert(pointer, Diff::insert(&text_insert));
                        pointer += 1;
                    }
                    pointer += 1;
                } else if pointer != 0 && diffs[pointer - 1].op == Operation::Equal {
                    // Merge this equality with the previous one.
                    let text = diffs.remove(pointer).text;
                    diffs[pointer - 1].text.extend(text);
                } else {
                    pointer += 1;
                }
                count_insert = 0;
                count_delete = 0;
                text_delete.clear();
                text_insert.clear();
            }
        }
    }
    if diffs.last().map_or(false, |d| d.text.is_empty()) {
        diffs.pop();
    }

    // Second pass: look for single edits surrounded on both sides by
    // equalities which can be shifted sideways to eliminate an equality.
    // e.g: A<ins>BA</ins>C -> <ins>AB</ins>AC
    let mut changes = false;
    let mut pointer = 1usize;
    while pointer + 1 < diffs.len() {
        if diffs[pointer - 1].op == Operation::Equal && diffs[pointer + 1].op == Operation::Equal {
            let prev = diffs[pointer - 1].text.clone();
            let next = diffs[pointer + 1].text.clone();
            if diffs[pointer].text.ends_with(&prev) {
                // Shift the edit over the previous equality.
                let edit_len = diffs[pointer].text.len();
                let mut shifted = prev.clone();
                shifted.extend_from_slice(&diffs[pointer].text[..edit_len - prev.len()]);
                diffs[pointer].text = shifted;
                let mut grown = prev;
                grown.extend_from_slice(&next);
                diffs[pointer + 1].text = grown;
                diffs.remove(pointer - 1);
                changes = true;
            } else if diffs[pointer].text.starts_with(&next) {
                // Shift the edit over the next equality.
                diffs[pointer - 1].text.extend_from_slice(&next);
                let mut shifted = diffs[pointer].text[next.len()..].to_vec();
                shifted.extend_from_slice(&next);
                diffs[pointer].text = shifted;
                diffs.remove(pointer + 1);
                changes = true;
            }
        }
        pointer += 1;
    }
    if changes {
        cleanup_merge(diffs);
    }
}

/// Reduce the number of edits by eliminating semantically trivial
/// equalities.
pub fn cleanup_semantic(diffs: &mut Vec<Diff>) {
    let mut changes = false;
    // Stack of indices where equalities are found.
    let mut equalities: Vec<usize> = Vec::new();
    let mut last_equality: Option<Vec<char>> = None;
    let mut pointer: isize = 0;
    // Edit lengths before and after the last equality.
    let mut insertions1 = 0usize;
    let mut deletions1 = 0usize;
    let mut insertions2 = 0usize;
    let mut deletions2 = 0usize;

    while (pointer as usize) < diffs.len() {
        let p = pointer as usize;
        if diffs[p].op == Operation::Equal {
            equalities.push(p);
            insertions1 = insertions2;
            deletions1 = deletions2;
            insertions2 = 0;
            deletions2 = 0;
            last_equality = Some(diffs[p].text.clone());
        } else {
            if diffs[p].op == Operation::Insert {
                insertions2 += diffs[p].text.len();
            } else {
                deletions2 += diffs[p].text.len();
            }
            // Eliminate an equality that is smaller or equal to the edits on
            // both sides of it.
            if let Some(equality) = last_equality.take() {
                if equality.len() <= insertions1.max(deletions1)
                    && equality.len() <= insertions2.max(deletions2)
                {
                    if let Some(&at) = equalities.last() {
                        diffs.insert(at, Diff::new(Operation::Delete, equality));
                        diffs[at + 1].op = Operation::Insert;
                    }
                    // Drop the equality just deleted and the one before it,
                    // which needs to be reevaluated.
                    equalities.pop();
                    equalities.pop();
                    pointer = equalities.last().map_or(-1, |&at| at as isize);
                    insertions1 = 0;
                    deletions1 = 0;
                    insertions2 = 0;
                    deletions2 = 0;
                    changes = true;
                } else {
                    last_equality = Some(equality);
                }
            }
        }
        pointer += 1;
    }

    if changes {
        cleanup_merge(diffs);
    }
    cleanup_semantic_lossless(diffs);

    // Find any overlaps between deletions and insertions.
    // e.g: <del>abcxxx</del><ins>xxxdef</ins>
    //   -> <del>abc</del>xxx<ins>def</ins>
    // e.g: <del>xxxabc</del><ins>defxxx</ins>
    //   -> <ins>def</ins>xxx<del>abc</del>
    // Only extract an overlap if it is as big as the edit ahead or behind it.
    let mut pointer = 1usize;
    while pointer < diffs.len() {
        if diffs[pointer - 1].op == Operation::Delete && diffs[pointer].op == Operation::Insert {
            let deletion = diffs[pointer - 1].text.clone();
            let insertion = diffs[pointer].text.clone();
            let overlap1 = common_overlap(&deletion, &insertion);
            let overlap2 = common_overlap(&insertion, &deletion);
            if overlap1 >= overlap2 {
                if overlap1 * 2 >= deletion.len() || overlap1 * 2 >= insertion.len() {
                    diffs.insert(pointer, Diff::equal(&insertion[..overlap1]));
                    diffs[pointer - 1].text = deletion[..deletion.len() - overlap1].to_vec();
                    diffs[pointer + 1].text = insertion[overlap1..].to_vec();
                    pointer += 1;
                }
            } else if overlap2 * 2 >= deletion.len() || overlap2 * 2 >= insertion.len() {
                // Reverse overlap: swap and trim the surrounding edits.
                diffs.insert(pointer, Diff::equal(&deletion[..overlap2]));
                diffs[pointer - 1] = Diff::insert(&insertion[..insertion.len() - overlap2]);
                diffs[pointer + 1] = Diff::delete(&deletion[overlap2..]);
                pointer += 1;
            }
            pointer += 1;
        }
        pointer += 1;
    }
}

/// Look for single edits surrounded on both sides by equalities which can be
/// shifted sideways to align the edit to a word boundary.
/// e.g: The c<ins>at c</ins>ame. -> The <ins>cat </ins>came.
pub fn cleanup_semantic_lossless(diffs: &mut Vec<Diff>) {
    let mut pointer: isize = 1;
    while pointer + 1 < diffs.len() as isize {
        let p = pointer as usize;
        if pointer >= 1
            && diffs[p - 1].op == Operation::Equal
            && diffs[p + 1].op == Operation::Equal
        {
            let mut equality1 = diffs[p - 1].text.clone();
            let mut edit = diffs[p].text.clone();
            let mut equality2 = diffs[p + 1].text.clone();

            // First, shift the edit as far left as possible.
            let offset = common_suffix(&equality1, &edit);
            if offset > 0 {
                let common = edit[edit.len() - offset..].to_vec();
                equality1.truncate(equality1.len() - offset);
                let mut shifted = common.clone();
                shifted.extend_from_slice(&edit[..edit.len() - offset]);
                edit = shifted;
                let mut grown = common;
                grown.extend_from_slice(&equality2);
                equality2 = grown;
            }

            // Second, step character by character right, looking for the
            // best fit.
            let mut best_equality1 = equality1.clone();
            let mut best_edit = edit.clone();
            let mut best_equality2 = equality2.clone();
            let mut best_score = semantic_score(&equality1, &edit) + semantic_score(&edit, &equality2);
            while !edit.is_empty() && !equality2.is_empty() && edit[0] == equality2[0] {
                equality1.push(edit[0]);
                edit.remove(0);
                edit.push(equality2.remove(0));
                let score = semantic_score(&equality1, &edit) + semantic_score(&edit, &equality2);
                // >= encourages trailing rather than leading whitespace.
                if score >= best_score {
                    best_score = score;
                    best_equality1 = equality1.clone();
                    best_edit = edit.clone();
                    best_equality2 = equality2.clone();
                }
            }

            if diffs[p - 1].text != best_equality1 {
                let mut p = p;
                if !best_equality1.is_empty() {
                    diffs[p - 1].text = best_equality1;
                } else {
                    diffs.remove(p - 1);
                    p -= 1;
                    pointer -= 1;
                }
                diffs[p].text = best_edit;
                if !best_equality2.is_empty() {
                    diffs[p + 1].text = best_equality2;
                } else {
                    diffs.remove(p + 1);
                    pointer -= 1;
                }
            }
        }
        pointer += 1;
    }
}

/// Score how well the boundary between `one` and `two` falls on a logical
/// boundary. Higher is better; 6 for the edges of the text.
fn semantic_score(one: &[char], two: &[char]) -> u32 {
    let (Some(&char1), Some(&char2)) = (one.last(), two.first()) else {
        return 6;
    };

    let non_alphanumeric1 = !char1.is_alphanumeric();
    let non_alphanumeric2 = !char2.is_alphanumeric();
    let whitespace1 = non_alphanumeric1 && char1.is_whitespace();
    let whitespace2 = non_alphanumeric2 && char2.is_whitespace();
    let line_break1 = whitespace1 && char1.is_control();
    let line_break2 = whitespace2 && char2.is_control();
    let blank_line1 = line_break1 && ends_with_blank_line(one);
    let blank_line2 = line_break2 && starts_with_blank_line(two);

    if blank_line1 || blank_line2 {
        5
    } else if line_break1 || line_break2 {
        4
    } else if non_alphanumeric1 && !whitespace1 && whitespace2 {
        // End of sentence.
        3
    } else if whitespace1 || whitespace2 {
        2
    } else if non_alphanumeric1 || non_alphanumeric2 {
        1
    } else {
        0
    }
}

/// `\n\r?\n$`
fn ends_with_blank_line(text: &[char]) -> bool {
    text.ends_with(&['\n', '\n']) || text.ends_with(&['\n', '\r', '\n'])
}

/// `^\r?\n\r?\n`
fn starts_with_blank_line(text: &[char]) -> bool {
    let rest = text.strip_prefix(&['\r']).unwrap_or(text);
    let Some(rest) = rest.strip_prefix(&['\n']) else {
        return false;
    };
    let rest = rest.strip_prefix(&['\r']).unwrap_or(rest);
    rest.first() == Some(&'\n')
}

/// Reduce the number of edits by eliminating operationally trivial
/// equalities.
pub fn cleanup_efficiency(diffs: &mut Vec<Diff>) {
    let mut changes = false;
    let mut equalities: Vec<usize> = Vec::new();
    let mut last_equality: Option<Vec<char>> = None;
    let mut pointer: isize = 0;
    // Is there an insertion/deletion operation before/after the last equality.
    let mut pre_ins = false;
    let mut pre_del = false;
    let mut post_ins = false;
    let mut post_del = false;

    while (pointer as usize) < diffs.len() {
        let p = pointer as usize;
        if diffs[p].op == Operation::Equal {
            if diffs[p].text.len() < DIFF_EDIT_COST && (post_ins || post_del) {
                // Candidate found.
                equalities.push(p);
                pre_ins = post_ins;
                pre_del = post_del;
                last_equality = Some(diffs[p].text.clone());
            } else {
                // Not a candidate, and can never become one.
                equalities.clear();
                last_equality = None;
            }
            post_ins = false;
            post_del = false;
        } else {
            if diffs[p].op == Operation::Delete {
                post_del = true;
            } else {
                post_ins = true;
            }

            // Five types to be split:
            // <ins>A</ins><del>B</del>XY<ins>C</ins><del>D</del>
            // <ins>A</ins>X<ins>C</ins><del>D</del>
            // <ins>A</ins><del>B</del>X<ins>C</ins>
            // <ins>A</del>X<ins>C</ins><del>D</del>
            // <ins>A</ins><del>B</del>X<del>C</del>
            if let Some(equality) = last_equality.take() {
                let flags = [pre_ins, pre_del, post_ins, post_del]
                    .iter()
                    .filter(|f| **f)
                    .count();
                if (pre_ins && pre_del && post_ins && post_del)
                    || (equality.len() < DIFF_EDIT_COST / 2 && flags == 3)
                {
                    if let Some(&at) = equalities.last() {
                        diffs.insert(at, Diff::new(Operation::Delete, equality));
                        diffs[at + 1].op = Operation::Insert;
                    }
                    equalities.pop();
                    if pre_ins && pre_del {
                        // No changes made which could affect the previous
                        // entry, keep going.
                        post_ins = true;
                        post_del = true;
                        equalities.clear();
                    } else {
                        equalities.pop();
                        pointer = equalities.last().map_or(-1, |&at| at as isize);
                        post_ins = false;
                        post_del = false;
                    }
                    changes = true;
                } else {
                    last_equality = Some(equality);
                }
            }
        }
        pointer += 1;
    }

    if changes {
        cleanup_merge(diffs);
    }
}

/// Translate a location in the source text to the equivalent location in the
/// destination text of `diffs`.
pub fn x_index(diffs: &[Diff], loc: usize) -> usize {
    let mut chars1 = 0usize;
    let mut chars2 = 0usize;
    let mut last_chars1 = 0usize;
    let mut last_chars2 = 0usize;
    let mut overshoot: Option<&Diff> = None;
    for diff in diffs {
        if diff.op != Operation::Insert {
            chars1 += diff.text.len();
        }
        if diff.op != Operation::Delete {
            chars2 += diff.text.len();
        }
        if chars1 > loc {
            overshoot = Some(diff);
            break;
        }
        last_chars1 = chars1;
        last_chars2 = chars2;
    }
    match overshoot {
        // The location was deleted.
        Some(diff) if diff.op == Operation::Delete => last_chars2,
        _ => last_chars2 + (loc - last_chars1),
    }
}

/// Number of inserted, deleted or substituted characters.
pub fn levenshtein(diffs: &[Diff]) -> usize {
    let mut distance = 0;
    let mut insertions = 0;
    let mut deletions = 0;
    for diff in diffs {
        match diff.op {
            Operation::Insert => insertions += diff.text.len(),
            Operation::Delete => deletions += diff.text.len(),
            Operation::Equal => {
                distance += insertions.max(deletions);
                insertions = 0;
                deletions = 0;
            }
        }
    }
    distance + insertions.max(deletions)
}

/// Source text of a diff (all equalities and deletions).
pub fn source_text(diffs: &[Diff]) -> Vec<char> {
    diffs
        .iter()
        .filter(|d| d.op != Operation::Insert)
        .flat_map(|d| d.text.iter().copied())
        .collect()
}

/// Destination text of a diff (all equalities and insertions).
pub fn destination_text(diffs: &[Diff]) -> Vec<char> {
    diffs
        .iter()
        .filter(|d| d.op != Operation::Delete)
        .flat_map(|d| d.text.iter().copied())
        .collect()
}

/// First occurrence of `needle` in `haystack` starting at or after `from`.
/// An empty needle matches at `from`.
pub fn find(haystack: &[char], needle: &[char], from: usize) -> Option<usize> {
    if from > haystack.len() {
        return None;
    }
    if needle.is_empty() {
        return Some(from);
    }
    if needle.len() > haystack.len() {
        return None;
    }
    (from..=haystack.len() - needle.len()).find(|&i| haystack[i..i + needle.len()] == *needle)
}

/// Last occurrence of `needle` in `haystack` starting at or before `from`.
/// An empty needle matches at `min(from, haystack.len())`.
pub fn rfind(haystack: &[char], needle: &[char], from: usize) -> Option<usize> {
    if needle.is_empty() {
        return Some(from.min(haystack.len()));
    }
    if needle.len() > haystack.len() {
        return None;
    }
    let last_start = from.min(haystack.len() - needle.len());
    (0..=last_start)
        .rev()
        .find(|&i| haystack[i..i + needle.len()] == *needle)
}
