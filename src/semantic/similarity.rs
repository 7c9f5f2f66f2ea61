//! Near-duplicate and version grouping.
//!
//! Two files are linked when their vectors are at least `threshold` similar
//! or their content is byte-identical. Connected components of two or more
//! files form a group, and one member of each group is proposed as keeper.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::Serialize;

use super::vectors::{cosine_similarity, IndexedFile};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum KeeperReason {
    Pinned,
    Newest,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GroupMember {
    pub path: String,
    /// Similarity to the keeper
    pub similarity: f32,
    /// Same content as the keeper
    pub identical: bool,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DuplicateGroup {
    pub keeper: String,
    pub keeper_modified: DateTime<Utc>,
    pub reason: KeeperReason,
    pub candidates: Vec<GroupMember>,
}

/// Where a candidate would go if archived. Never executed here.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MoveProposal {
    pub from: String,
    pub to: PathBuf,
    pub keeper: String,
}

/// Disjoint-set forest with path halving.
struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        UnionFind {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            // smaller index becomes the root so components are stable
            let (lo, hi) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent[hi] = lo;
        }
    }
}

fn similarity(a: &IndexedFile<'_>, b: &IndexedFile<'_>) -> Option<f32> {
    if a.record.fingerprint == b.record.fingerprint {
        return Some(1.0);
    }
    match (a.vector, b.vector) {
        (Some(va), Some(vb)) => Some(cosine_similarity(va, vb)),
        _ => None,
    }
}

/// Newest first, then path ascending.
fn newest_first(a: &IndexedFile<'_>, b: &IndexedFile<'_>) -> Ordering {
    b.record
        .mtime_ns
        .cmp(&a.record.mtime_ns)
        .then_with(|| a.record.path.cmp(&b.record.path))
}

/// Group `files` (as produced by [`super::vectors::join`]).
pub fn find_groups(
    files: &[IndexedFile<'_>],
    threshold: f32,
    pinned: &HashSet<String>,
) -> Vec<DuplicateGroup> {
    let n = files.len();
    let edges: Vec<(usize, usize)> = (0..n)
        .into_par_iter()
        .flat_map_iter(|i| {
            (i + 1..n).filter_map(move |j| {
                let linked = files[i].record.fingerprint == files[j].record.fingerprint
                    || similarity(&files[i], &files[j]).is_some_and(|s| s >= threshold);
                linked.then_some((i, j))
            })
        })
        .collect();

    let mut components = UnionFind::new(n);
    for (i, j) in edges {
        components.union(i, j);
    }

    let mut members: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for i in 0..n {
        let root = components.find(i);
        members.entry(root).or_default().push(i);
    }

    let mut groups: Vec<DuplicateGroup> = members
        .into_values()
        .filter(|m| m.len() >= 2)
        .filter_map(|indices| {
            let group: Vec<&IndexedFile<'_>> = indices.iter().map(|i| &files[*i]).collect();

            let pinned_members: Vec<&&IndexedFile<'_>> = group
                .iter()
                .filter(|f| pinned.contains(&f.record.path))
                .collect();
            let (keeper, reason) = if pinned_members.is_empty() {
                (*group.iter().min_by(|a, b| newest_first(a, b))?, KeeperReason::Newest)
            } else {
                (
                    *pinned_members.into_iter().min_by(|a, b| newest_first(a, b))?,
                    KeeperReason::Pinned,
                )
            };

            let mut candidates: Vec<GroupMember> = group
                .iter()
                .filter(|f| f.record.path != keeper.record.path)
                .map(|f| GroupMember {
                    path: f.record.path.clone(),
                    similarity: similarity(keeper, f).unwrap_or(0.0),
                    identical: f.record.fingerprint == keeper.record.fingerprint,
                    size: f.record.size,
                    modified: f.record.modified(),
                })
                .collect();
            candidates.sort_by(|a, b| {
                b.similarity
                    .partial_cmp(&a.similarity)
                    .unwrap_or(Ordering::Equal)
                    .then_with(|| a.path.cmp(&b.path))
            });

            Some(DuplicateGroup {
                keeper: keeper.record.path.clone(),
                keeper_modified: keeper.record.modified(),
                reason,
                candidates,
            })
        })
        .collect();

    groups.sort_by(|a, b| a.keeper.cmp(&b.keeper));
    groups
}

/// Map each candidate to `archive_dir/<relative path>`.
pub fn propose_moves(groups: &[DuplicateGroup], archive_dir: &Path) -> Vec<MoveProposal> {
    groups
        .iter()
        .flat_map(|group| {
            group.candidates.iter().map(|candidate| MoveProposal {
                from: candidate.path.clone(),
                to: candidate
                    .path
                    .split('/')
                    .fold(archive_dir.to_path_buf(), |acc, part| acc.join(part)),
                keeper: group.keeper.clone(),
            })
        })
        .collect()
}
