//! Fuzzy location of a pattern in a text (Bitap / shift-or with errors).

use std::collections::HashMap;

use super::diff::{find, rfind};

/// At what point is no match declared (0.0 = perfection, 1.0 = very loose).
pub const MATCH_THRESHOLD: f64 = 0.5;

/// How far to search for a match (0 = exact location, 1000+ = broad match).
/// A match this many characters away from the expected location adds 1.0 to
/// the score.
pub const MATCH_DISTANCE: usize = 1000;

/// Number of bits in the bitap mask, and so the longest pattern.
pub const MATCH_MAX_BITS: usize = 32;

/// Locate the best instance of `pattern` in `text` near `loc`.
///
/// Returns `None` when nothing scores under [`MATCH_THRESHOLD`].
pub fn match_main(text: &[char], pattern: &[char], loc: usize) -> Option<usize> {
    let loc = loc.min(text.len());
    if text == pattern {
        // Shortcut (potentially not guaranteed by the algorithm).
        Some(0)
    } else if text.is_empty() {
        None
    } else if loc + pattern.len() <= text.len() && text[loc..loc + pattern.len()] == *pattern {
        // Perfect match at the perfect spot.
        Some(loc)
    } else {
        match_bitap(text, pattern, loc)
    }
}

/// Bitap search for `pattern` in `text` around `loc`.
///
/// Patterns longer than [`MATCH_MAX_BITS`] cannot be expressed in the mask
/// and never match.
pub fn match_bitap(text: &[char], pattern: &[char], loc: usize) -> Option<usize> {
    if pattern.is_empty() || pattern.len() > MATCH_MAX_BITS {
        return None;
    }

    let alphabet = alphabet(pattern);
    let score = |errors: usize, x: isize| bitap_score(errors, x, loc, pattern.len());

    // Highest score beyond which we give up.
    let mut threshold = MATCH_THRESHOLD;
    // Is there a nearby exact match? (speedup)
    if let Some(exact) = find(text, pattern, loc) {
        threshold = threshold.min(score(0, exact as isize));
        // What about in the other direction? (speedup)
        if let Some(exact) = rfind(text, pattern, loc + pattern.len()) {
            threshold = threshold.min(score(0, exact as isize));
        }
    }

    let match_mask: u32 = 1 << (pattern.len() - 1);
    let mut best_loc: Option<usize> = None;
    let loc_i = loc as isize;
    let text_len = text.len() as isize;
    let pattern_len = pattern.len() as isize;

    let mut bin_max = pattern_len + text_len;
    let mut last_rd: Vec<u32> = Vec::new();
    for d in 0..pattern.len() {
        // Scan for the best match; each iteration allows for one more error.
        // Run a binary search to determine how far from `loc` we can stray
        // at this error level.
        let mut bin_min = 0isize;
        let mut bin_mid = bin_max;
        while bin_min < bin_mid {
            if score(d, loc_i + bin_mid) <= threshold {
                bin_min = bin_mid;
            } else {
                bin_max = bin_mid;
            }
            bin_mid = (bin_max - bin_min) / 2 + bin_min;
        }
        // Use the result from this iteration as the maximum for the next.
        bin_max = bin_mid;
        let mut start = (loc_i - bin_mid + 1).max(1);
        let finish = (loc_i + bin_mid).min(text_len) + pattern_len;

        let mut rd = vec![0u32; (finish + 2) as usize];
        rd[(finish + 1) as usize] = (1u32 << d) - 1;
        let mut j = finish;
        while j >= start {
            let ju = j as usize;
            let char_match = text
                .get(ju - 1)
                .and_then(|c| alphabet.get(c))
                .copied()
                .unwrap_or(0);
            if d == 0 {
                // First pass: exact match.
                rd[ju] = ((rd[ju + 1] << 1) | 1) & char_match;
            } else {
                // Subsequent passes: fuzzy match.
                let last_j = last_rd.get(ju).copied().unwrap_or(0);
                let last_j1 = last_rd.get(ju + 1).copied().unwrap_or(0);
                rd[ju] = (((rd[ju + 1] << 1) | 1) & char_match)
                    | (((last_j1 | last_j) << 1) | 1)
                    | last_j1;
            }
            if rd[ju] & match_mask != 0 {
                let candidate = score(d, j - 1);
                // This match will almost certainly be better than any
                // existing match, but check anyway.
                if candidate <= threshold {
                    threshold = candidate;
                    best_loc = Some((j - 1) as usize);
                    if j - 1 > loc_i {
                        // When passing loc, don't exceed our current distance
                        // from loc.
                        start = (2 * loc_i - (j - 1)).max(1);
                    } else {
                        // Already passed loc, downhill from here on in.
                        break;
                    }
                }
            }
            j -= 1;
        }
        // No hope for a (better) match at greater error levels.
        if score(d + 1, loc_i) > threshold {
            break;
        }
        last_rd = rd;
    }
    best_loc
}

/// Score for a match with `errors` errors at location `x`.
fn bitap_score(errors: usize, x: isize, loc: usize, pattern_len: usize) -> f64 {
    let accuracy = errors as f64 / pattern_len as f64;
    let proximity = (loc as isize - x).unsigned_abs();
    if MATCH_DISTANCE == 0 {
        // Dodge divide by zero.
        return if proximity == 0 { accuracy } else { 1.0 };
    }
    accuracy + proximity as f64 / MATCH_DISTANCE as f64
}

/// Bit masks of the positions each character occupies in `pattern`.
fn alphabet(pattern: &[char]) -> HashMap<char, u32> {
    let mut masks: HashMap<char, u32> = HashMap::new();
    let len = pattern.len();
    for (i, &c) in pattern.iter().enumerate() {
        *masks.entry(c).or_insert(0) |= 1 << (len - i - 1);
    }
    masks
}
