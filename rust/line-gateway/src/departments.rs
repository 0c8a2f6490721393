/*
 * DPIS Line Assistant - LINE registration and AI relay gateway
 * Copyright (C) 2025–2026 Neven Kordic <neven@broodlink.ai>
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Fuzzy search over the department catalog.
//!
//! Scoring is the Ratcliff/Obershelp "gestalt" ratio: twice the number of
//! characters in matching blocks divided by the combined length. It works
//! on Unicode scalar values, so Thai names without word spacing still match
//! on substrings (`สรรพากร` finds `กรมสรรพากร`).

use std::collections::{HashMap, HashSet};

use dpisline_config::RegistrationConfig;
use tracing::warn;

/// LINE rejects quick-reply labels longer than 20 characters.
pub const MAX_LABEL_CHARS: usize = 20;

// ---------------------------------------------------------------------------
// Similarity ratio
// ---------------------------------------------------------------------------

/// Longest common block of `a[alo..ahi]` and `b[blo..bhi]` as `(i, j, len)`.
/// Ties go to the block that ends first in `a`, then first in `b`.
fn longest_match(
    a: &[char],
    b: &[char],
    (alo, ahi): (usize, usize),
    (blo, bhi): (usize, usize),
) -> (usize, usize, usize) {
    let (mut best_i, mut best_j, mut best_len) = (alo, blo, 0);
    // prev[j + 1 - blo]: length of the common run ending at a[i - 1] and b[j]
    let mut prev = vec![0usize; bhi - blo + 1];
    let mut cur = vec![0usize; bhi - blo + 1];
    for i in alo..ahi {
        for j in blo..bhi {
            let k = j + 1 - blo;
            if a[i] == b[j] {
                cur[k] = prev[k - 1] + 1;
                if cur[k] > best_len {
                    best_len = cur[k];
                    best_i = i + 1 - best_len;
                    best_j = j + 1 - best_len;
                }
            } else {
                cur[k] = 0;
            }
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    (best_i, best_j, best_len)
}

/// Total length of all matching blocks between `a` and `b`.
fn matched_chars(a: &[char], b: &[char]) -> usize {
    let mut total = 0;
    let mut queue = vec![((0, a.len()), (0, b.len()))];
    while let Some(((alo, ahi), (blo, bhi))) = queue.pop() {
        if alo >= ahi || blo >= bhi {
            continue;
        }
        let (i, j, k) = longest_match(a, b, (alo, ahi), (blo, bhi));
        if k == 0 {
            continue;
        }
        total += k;
        queue.push(((alo, i), (blo, j)));
        queue.push(((i + k, ahi), (j + k, bhi)));
    }
    total
}

#[allow(clippy::cast_precision_loss)]
fn ratio_of(matches: usize, total_len: usize) -> f64 {
    if total_len == 0 {
        return 1.0;
    }
    2.0 * matches as f64 / total_len as f64
}

/// Similarity of two character sequences in `0.0..=1.0`.
fn char_ratio(a: &[char], b: &[char]) -> f64 {
    ratio_of(matched_chars(a, b), a.len() + b.len())
}

/// Upper bound on [`char_ratio`] from lengths alone.
fn length_bound(a: &[char], b: &[char]) -> f64 {
    ratio_of(a.len().min(b.len()), a.len() + b.len())
}

/// Upper bound on [`char_ratio`] from shared characters, ignoring order.
fn multiset_bound(a: &[char], b: &[char]) -> f64 {
    let mut avail: HashMap<char, usize> = HashMap::new();
    for c in b {
        *avail.entry(*c).or_default() += 1;
    }
    let mut shared = 0;
    for c in a {
        if let Some(n) = avail.get_mut(c) {
            if *n > 0 {
                *n -= 1;
                shared += 1;
            }
        }
    }
    ratio_of(shared, a.len() + b.len())
}

// ---------------------------------------------------------------------------
// Catalog and matcher
// ---------------------------------------------------------------------------

/// One quick-reply choice: what the button shows and what tapping it sends.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplyOption {
    pub label: String,
    pub text: String,
}

/// Fixed list of canonical department names plus optional display aliases.
pub struct DepartmentMatcher {
    names: Vec<String>,
    aliases: HashMap<String, String>,
    max_matches: usize,
    cutoff: f64,
}

impl DepartmentMatcher {
    pub fn new(
        names: impl IntoIterator<Item = String>,
        aliases: impl IntoIterator<Item = (String, String)>,
        max_matches: usize,
        cutoff: f64,
    ) -> Self {
        let mut seen = HashSet::new();
        let mut unique = Vec::new();
        for name in names {
            let name = name.trim().to_string();
            if name.is_empty() {
                continue;
            }
            if seen.insert(name.clone()) {
                unique.push(name);
            } else {
                warn!(department = %name, "duplicate department in catalog, keeping first");
            }
        }
        Self {
            names: unique,
            aliases: aliases.into_iter().collect(),
            max_matches,
            cutoff,
        }
    }

    pub fn from_config(cfg: &RegistrationConfig) -> Self {
        Self::new(
            cfg.departments.iter().cloned(),
            cfg.aliases
                .iter()
                .map(|a| (a.name.clone(), a.label.clone())),
            cfg.max_matches,
            cfg.similarity_cutoff,
        )
    }

    pub fn catalog_size(&self) -> usize {
        self.names.len()
    }

    /// Whether `name` is one of the canonical names.
    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }

    /// Up to `max_matches` canonical names scoring at least the cutoff,
    /// best first. Equal scores keep catalog order.
    pub fn search(&self, query: &str) -> Vec<&str> {
        let query: Vec<char> = query.trim().chars().collect();
        if query.is_empty() {
            return Vec::new();
        }

        let mut scored: Vec<(f64, usize)> = Vec::new();
        for (idx, name) in self.names.iter().enumerate() {
            let candidate: Vec<char> = name.chars().collect();
            if length_bound(&candidate, &query) < self.cutoff
                || multiset_bound(&candidate, &query) < self.cutoff
            {
                continue;
            }
            let score = char_ratio(&candidate, &query);
            if score >= self.cutoff {
                scored.push((score, idx));
            }
        }

        scored.sort_by(|x, y| y.0.total_cmp(&x.0).then(x.1.cmp(&y.1)));
        scored
            .into_iter()
            .take(self.max_matches)
            .map(|(_, idx)| self.names[idx].as_str())
            .collect()
    }

    /// Button label for a canonical name: its alias if configured, cut to
    /// the platform's label limit.
    pub fn label_for(&self, name: &str) -> String {
        let label = self.aliases.get(name).map_or(name, String::as_str);
        label.chars().take(MAX_LABEL_CHARS).collect()
    }

    /// Quick-reply options for `matches`, at most `max_options`. The text
    /// sent back always carries the canonical name, never the alias.
    pub fn options(
        &self,
        matches: &[&str],
        confirm_prefix: &str,
        max_options: usize,
    ) -> Vec<ReplyOption> {
        matches
            .iter()
            .take(max_options)
            .map(|name| ReplyOption {
                label: self.label_for(name),
                text: format!("{confirm_prefix}{name}"),
            })
            .collect()
    }
}
