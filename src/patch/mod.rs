//! Text patches in the diff-match-patch style.
//!
//! This is the primitive every replica and the owner use to describe and
//! replay edits:
//! - [`make`] diffs two texts and packages the edits into context-carrying
//!   hunks
//! - [`apply`] replays hunks onto a (possibly drifted) text, locating each
//!   hunk by its context with a fuzzy matcher, and reports per-hunk success
//!
//! Both functions are deterministic, so every peer applying the same patch
//! list to the same text ends up with the same result.

pub mod diff;
pub mod matching;

use std::fmt;

use serde::{Deserialize, Serialize};

use diff::{Diff, Operation};
use matching::MATCH_MAX_BITS;

/// Chunk size for context length.
pub const PATCH_MARGIN: usize = 4;

/// When deleting a large block of text (over ~64 characters), how close do
/// the contents have to be to match the expected contents (0.0 = perfection,
/// 1.0 = very loose).
pub const PATCH_DELETE_THRESHOLD: f64 = 0.5;

/// One hunk: a run of diffs plus its location in the source and destination
/// texts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    pub diffs: Vec<Diff>,
    pub start1: usize,
    pub start2: usize,
    pub length1: usize,
    pub length2: usize,
}

/// Result of replaying a patch list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    pub text: String,
    /// One flag per hunk actually tried; false when the hunk could not be
    /// located.
    pub flags: Vec<bool>,
}

impl Applied {
    /// Whether every hunk applied.
    pub fn is_clean(&self) -> bool {
        self.flags.iter().all(|applied| *applied)
    }
}

/// Compute the patch list turning `old` into `new`.
pub fn make(old: &str, new: &str) -> Vec<Patch> {
    let text1: Vec<char> = old.chars().collect();
    let text2: Vec<char> = new.chars().collect();
    let mut diffs = diff::diff_main(&text1, &text2, true);
    if diffs.len() > 2 {
        diff::cleanup_semantic(&mut diffs);
        diff::cleanup_efficiency(&mut diffs);
    }
    make_from_diffs(&text1, &diffs)
}

/// Package a diff of `text1` into hunks with surrounding context.
fn make_from_diffs(text1: &[char], diffs: &[Diff]) -> Vec<Patch> {
    let mut patches = Vec::new();
    if diffs.is_empty() {
        return patches;
    }

    let mut patch = Patch::default();
    let mut char_count1 = 0usize;
    let mut char_count2 = 0usize;
    // Recreate the patches to determine context info.
    let mut prepatch: Vec<char> = text1.to_vec();
    let mut postpatch: Vec<char> = text1.to_vec();

    for (x, diff) in diffs.iter().enumerate() {
        if patch.diffs.is_empty() && diff.op != Operation::Equal {
            // A new patch starts here.
            patch.start1 = char_count1;
            patch.start2 = char_count2;
        }

        match diff.op {
            Operation::Insert => {
                patch.diffs.push(diff.clone());
                patch.length2 += diff.text.len();
                postpatch.splice(char_count2..char_count2, diff.text.iter().copied());
            }
            Operation::Delete => {
                patch.length1 += diff.text.len();
                patch.diffs.push(diff.clone());
                postpatch.drain(char_count2..char_count2 + diff.text.len());
            }
            Operation::Equal => {
                if diff.text.len() <= 2 * PATCH_MARGIN
                    && !patch.diffs.is_empty()
                    && diffs.len() != x + 1
                {
                    // Small equality inside a patch.
                    patch.diffs.push(diff.clone());
                    patch.length1 += diff.text.len();
                    patch.length2 += diff.text.len();
                } else if diff.text.len() >= 2 * PATCH_MARGIN && !patch.diffs.is_empty() {
                    // Time for a new patch.
                    add_context(&mut patch, &prepatch);
                    patches.push(std::mem::take(&mut patch));
                    // The second text becomes the reference for the
                    // following hunks.
                    prepatch = postpatch.clone();
                    char_count1 = char_count2;
                }
            }
        }

        if diff.op != Operation::Insert {
            char_count1 += diff.text.len();
        }
        if diff.op != Operation::Delete {
            char_count2 += diff.text.len();
        }
    }

    // Pick up the leftover patch if not empty.
    if !patch.diffs.is_empty() {
        add_context(&mut patch, &prepatch);
        patches.push(patch);
    }
    patches
}

/// Grow a hunk's context until its pattern is unique in `text` (or the
/// matcher's bit width is reached), then add one more margin.
fn add_context(patch: &mut Patch, text: &[char]) {
    if text.is_empty() {
        return;
    }
    let mut pattern = &text[patch.start2..patch.start2 + patch.length1];
    let mut padding = 0usize;

    while diff::find(text, pattern, 0) != diff::rfind(text, pattern, text.len())
        && pattern.len() < MATCH_MAX_BITS - 2 * PATCH_MARGIN
    {
        padding += PATCH_MARGIN;
        let from = patch.start2.saturating_sub(padding);
        let to = (patch.start2 + patch.length1 + padding).min(text.len());
        pattern = &text[from..to];
    }
    // Add one chunk for good luck.
    padding += PATCH_MARGIN;

    let prefix = &text[patch.start2.saturating_sub(padding)..patch.start2];
    if !prefix.is_empty() {
        patch.diffs.insert(0, Diff::equal(prefix));
    }
    let suffix_start = patch.start2 + patch.length1;
    let suffix = &text[suffix_start..(suffix_start + padding).min(text.len())];
    if !suffix.is_empty() {
        patch.diffs.push(Diff::equal(suffix));
    }

    patch.start1 -= prefix.len();
    patch.start2 -= prefix.len();
    patch.length1 += prefix.len() + suffix.len();
    patch.length2 += prefix.len() + suffix.len();
}

/// Replay `patches` onto `text`.
///
/// Hunks are located near their expected position, corrected by the drift
/// observed for earlier hunks. A hunk whose context cannot be found is
/// skipped and reported as `false`.
pub fn apply(patches: &[Patch], text: &str) -> Applied {
    if patches.is_empty() {
        return Applied {
            text: text.to_string(),
            flags: Vec::new(),
        };
    }

    let mut patches = patches.to_vec();
    let null_padding = add_padding(&mut patches);
    let patches = split_max(patches);

    let mut text: Vec<char> = null_padding
        .iter()
        .copied()
        .chain(text.chars())
        .chain(null_padding.iter().copied())
        .collect();

    // Offset between the expected and actual location of the previous hunk.
    let mut delta: isize = 0;
    let mut flags = vec![false; patches.len()];

    for (x, patch) in patches.iter().enumerate() {
        let expected_loc = (patch.start2 as isize + delta).max(0) as usize;
        let text1 = diff::source_text(&patch.diffs);
        let mut end_loc: Option<usize> = None;

        let start_loc = if text1.len() > MATCH_MAX_BITS {
            // Only a monster delete survives split_max at this size; match
            // its head and tail separately.
            let head = matching::match_main(&text, &text1[..MATCH_MAX_BITS], expected_loc);
            match head {
                Some(start) => {
                    let tail = matching::match_main(
                        &text,
                        &text1[text1.len() - MATCH_MAX_BITS..],
                        expected_loc + text1.len() - MATCH_MAX_BITS,
                    );
                    match tail {
                        Some(end) if start < end => {
                            end_loc = Some(end);
                            Some(start)
                        }
                        // Can't find valid trailing context.
                        _ => None,
                    }
                }
                None => None,
            }
        } else {
            matching::match_main(&text, &text1, expected_loc)
        };

        let Some(start_loc) = start_loc else {
            // Subtract the delta for this failed hunk from subsequent ones.
            delta -= patch.length2 as isize - patch.length1 as isize;
            continue;
        };

        flags[x] = true;
        delta = start_loc as isize - expected_loc as isize;
        let text2_end = match end_loc {
            None => (start_loc + text1.len()).min(text.len()),
            Some(end) => (end + MATCH_MAX_BITS).min(text.len()),
        };
        let text2 = text[start_loc..text2_end].to_vec();

        if text1 == text2 {
            // Perfect match, just shove the replacement text in.
            let replacement = diff::destination_text(&patch.diffs);
            text.splice(start_loc..start_loc + text1.len(), replacement);
            continue;
        }

        // Imperfect match. Run a diff to get a framework of equivalent
        // indices.
        let mut diffs = diff::diff_main(&text1, &text2, false);
        if text1.len() > MATCH_MAX_BITS
            && diff::levenshtein(&diffs) as f64 / text1.len() as f64 > PATCH_DELETE_THRESHOLD
        {
            // The end points match, but the content is unacceptably bad.
            flags[x] = false;
            continue;
        }
        diff::cleanup_semantic_lossless(&mut diffs);

        let mut index1 = 0usize;
        for hunk_diff in &patch.diffs {
            if hunk_diff.op != Operation::Equal {
                let index2 = diff::x_index(&diffs, index1);
                match hunk_diff.op {
                    Operation::Insert => {
                        let at = (start_loc + index2).min(text.len());
                        text.splice(at..at, hunk_diff.text.iter().copied());
                    }
                    Operation::Delete => {
                        let from = (start_loc + index2).min(text.len());
                        let to = (start_loc + diff::x_index(&diffs, index1 + hunk_diff.text.len()))
                            .min(text.len())
                            .max(from);
                        text.drain(from..to);
                    }
                    Operation::Equal => {}
                }
            }
            if hunk_diff.op != Operation::Delete {
                index1 += hunk_diff.text.len();
            }
        }
    }

    // Strip the padding off.
    let pad = null_padding.len();
    let end = text.len().saturating_sub(pad).max(pad);
    Applied {
        text: text[pad..end].iter().collect(),
        flags,
    }
}

/// Add padding on text start and end so that edges can match something.
/// Returns the padding string added to each side.
fn add_padding(patches: &mut [Patch]) -> Vec<char> {
    let padding_len = PATCH_MARGIN;
    let null_padding: Vec<char> = (1..=padding_len as u32).filter_map(char::from_u32).collect();

    // Bump all the patches forward.
    for patch in patches.iter_mut() {
        patch.start1 += padding_len;
        patch.start2 += padding_len;
    }

    if let Some(patch) = patches.first_mut() {
        match patch.diffs.first_mut() {
            Some(first) if first.op == Operation::Equal => {
                if padding_len > first.text.len() {
                    // Grow first equality.
                    let extra = padding_len - first.text.len();
                    let mut grown = null_padding[first.text.len()..].to_vec();
                    grown.extend_from_slice(&first.text);
                    first.text = grown;
                    patch.start1 -= extra;
                    patch.start2 -= extra;
                    patch.length1 += extra;
                    patch.length2 += extra;
                }
            }
            _ => {
                patch.diffs.insert(0, Diff::equal(&null_padding));
                patch.start1 -= padding_len;
                patch.start2 -= padding_len;
                patch.length1 += padding_len;
                patch.length2 += padding_len;
            }
        }
    }

    if let Some(patch) = patches.last_mut() {
        match patch.diffs.last_mut() {
            Some(last) if last.op == Operation::Equal => {
                if padding_len > last.text.len() {
                    // Grow last equality.
                    let extra = padding_len - last.text.len();
                    last.text.extend_from_slice(&null_padding[..extra]);
                    patch.length1 += extra;
                    patch.length2 += extra;
                }
            }
            _ => {
                patch.diffs.push(Diff::equal(&null_padding));
                patch.length1 += padding_len;
                patch.length2 += padding_len;
            }
        }
    }

    null_padding
}

/// Break up any hunk longer than the matcher's bit width into smaller
/// hunks, each carrying its own context.
fn split_max(patches: Vec<Patch>) -> Vec<Patch> {
    let patch_size = MATCH_MAX_BITS;
    let mut out = Vec::with_capacity(patches.len());

    for mut bigpatch in patches {
        if bigpatch.length1 <= patch_size {
            out.push(bigpatch);
            continue;
        }

        let mut start1 = bigpatch.start1;
        let mut start2 = bigpatch.start2;
        let mut precontext: Vec<char> = Vec::new();
        let mut remaining: std::collections::VecDeque<Diff> = bigpatch.diffs.drain(..).collect();

        while !remaining.is_empty() {
            // Create one of several smaller patches.
            let mut patch = Patch {
                start1: start1 - precontext.len(),
                start2: start2 - precontext.len(),
                ..Patch::default()
            };
            let mut empty = true;
            if !precontext.is_empty() {
                patch.length1 = precontext.len();
                patch.length2 = precontext.len();
                patch.diffs.push(Diff::equal(&precontext));
            }

            while patch.length1 < patch_size - PATCH_MARGIN {
                let Some(front) = remaining.front_mut() else {
                    break;
                };
                let diff_type = front.op;
                if diff_type == Operation::Insert {
                    // Insertions are harmless.
                    patch.length2 += front.text.len();
                    start2 += front.text.len();
                    if let Some(diff) = remaining.pop_front() {
                        patch.diffs.push(diff);
                    }
                    empty = false;
                } else if diff_type == Operation::Delete
                    && patch.diffs.len() == 1
                    && patch.diffs[0].op == Operation::Equal
                    && front.text.len() > 2 * patch_size
                {
                    // This is a large deletion. Let it pass in one chunk.
                    patch.length1 += front.text.len();
                    start1 += front.text.len();
                    empty = false;
                    if let Some(diff) = remaining.pop_front() {
                        patch.diffs.push(diff);
                    }
                } else {
                    // Deletion or equality. Only take as much as we can
                    // stomach.
                    let take = front
                        .text
                        .len()
                        .min(patch_size - patch.length1 - PATCH_MARGIN);
                    let piece: Vec<char> = front.text[..take].to_vec();
                    patch.length1 += piece.len();
                    start1 += piece.len();
                    if diff_type == Operation::Equal {
                        patch.length2 += piece.len();
                        start2 += piece.len();
                    } else {
                        empty = false;
                    }
                    if piece.len() == front.text.len() {
                        remaining.pop_front();
                    } else {
                        front.text.drain(..piece.len());
                    }
                    patch.diffs.push(Diff::new(diff_type, piece));
                }
            }

            // Compute the head context for the next patch.
            let text2 = diff::destination_text(&patch.diffs);
            precontext = text2[text2.len().saturating_sub(PATCH_MARGIN)..].to_vec();

            // Append the end context for this patch.
            let rest: Vec<Diff> = remaining.iter().cloned().collect();
            let rest_text1 = diff::source_text(&rest);
            let postcontext = &rest_text1[..rest_text1.len().min(PATCH_MARGIN)];
            if !postcontext.is_empty() {
                patch.length1 += postcontext.len();
                patch.length2 += postcontext.len();
                match patch.diffs.last_mut() {
                    Some(last) if last.op == Operation::Equal => {
                        last.text.extend_from_slice(postcontext);
                    }
                    _ => patch.diffs.push(Diff::equal(postcontext)),
                }
            }

            if !empty {
                out.push(patch);
            }
        }
    }
    out
}

impl fmt::Display for Patch {
    /// GNU diff style header followed by one line per diff, with `%`, line
    /// breaks and other control characters percent-encoded.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let coords = |start: usize, length: usize| match length {
            0 => format!("{},0", start),
            1 => format!("{}", start + 1),
            _ => format!("{},{}", start + 1, length),
        };
        writeln!(
            f,
            "@@ -{} +{} @@",
            coords(self.start1, self.length1),
            coords(self.start2, self.length2)
        )?;
        for diff in &self.diffs {
            let sign = match diff.op {
                Operation::Insert => '+',
                Operation::Delete => '-',
                Operation::Equal => ' ',
            };
            write!(f, "{}", sign)?;
            for &c in &diff.text {
                if c == '%' || c.is_control() {
                    let mut buf = [0u8; 4];
                    for byte in c.encode_utf8(&mut buf).bytes() {
                        write!(f, "%{:02X}", byte)?;
                    }
                } else {
                    write!(f, "{}", c)?;
                }
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// Render a patch list as text, mostly for logging.
pub fn to_text(patches: &[Patch]) -> String {
    patches.iter().map(|p| p.to_string()).collect()
}
