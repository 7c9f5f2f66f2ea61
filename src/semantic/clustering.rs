//! k-means clustering over cached file vectors.
//!
//! - k defaults to round(sqrt(n)), optionally capped by settings
//! - k-means++ seeding from a fixed seed, so runs are reproducible
//! - Cosine distance; assignment ties go to the lowest centroid index
//! - Labels come from file names, then directories, then extensions

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::vectors::{cosine_distance, mean};
use crate::config::ClusteringConfig;
use crate::storage::BackendLocal;

pub const CLUSTERS_FILE: &str = "clusters.json";
/// Fewer embedded files than this cannot be clustered
pub const MIN_POINTS: usize = 2;
const KEYWORD_COUNT: usize = 3;

const LABEL_STOP_WORDS: &[&str] = &[
    "the", "and", "but", "for", "with", "from", "have", "does", "will", "would", "could",
    "should", "might", "must", "shall", "need", "used", "index", "main", "test", "spec", "temp",
    "copy", "final", "draft", "this", "that", "file", "files",
];

#[derive(thiserror::Error, Debug)]
pub enum ClusteringError {
    #[error("vector {index} has {got} dimensions, expected {expected}")]
    DimensionMismatch {
        index: usize,
        expected: usize,
        got: usize,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    /// Position within one clustering run
    pub id: usize,
    pub label: Option<String>,
    pub keywords: Vec<String>,
    pub size: usize,
    /// Member paths, sorted
    pub members: Vec<String>,
    pub centroid: Vec<f32>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ClusterOutcome {
    Clustered {
        clusters: Vec<Cluster>,
        k: usize,
        iterations: usize,
        converged: bool,
        embedded_files: usize,
        created_at: DateTime<Utc>,
    },
    InsufficientData {
        embedded_files: usize,
        required: usize,
    },
}

#[derive(Clone, Copy, Debug)]
pub struct KMeansParams {
    pub k: usize,
    pub seed: u64,
    pub max_iterations: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct KMeansResult {
    /// Centroid index per point
    pub assignments: Vec<usize>,
    pub centroids: Vec<Vec<f32>>,
    pub iterations: usize,
    pub converged: bool,
}

/// round(sqrt(n)) clamped to [1, n] and capped by `max_k`; an explicit
/// request is only clamped.
pub fn choose_k(n: usize, requested: Option<usize>, max_k: Option<usize>) -> usize {
    if n == 0 {
        return 0;
    }
    match requested {
        Some(k) => k.clamp(1, n),
        None => {
            let k = ((n as f64).sqrt().round() as usize).clamp(1, n);
            max_k.map_or(k, |cap| k.min(cap.max(1)))
        }
    }
}

fn nearest(point: &[f32], centroids: &[Vec<f32>]) -> usize {
    let mut best = 0;
    let mut best_distance = f32::INFINITY;
    for (j, centroid) in centroids.iter().enumerate() {
        let distance = cosine_distance(point, centroid);
        // strict comparison keeps the lowest index on ties
        if distance < best_distance {
            best_distance = distance;
            best = j;
        }
    }
    best
}

/// k-means++ seeding: each next centroid is drawn with probability
/// proportional to its squared distance from the closest chosen one.
fn seed_centroids(points: &[&[f32]], k: usize, rng: &mut StdRng) -> Vec<Vec<f32>> {
    let mut centroids: Vec<Vec<f32>> = Vec::with_capacity(k);
    let mut chosen = vec![false; points.len()];

    let first = rng.random_range(0..points.len());
    chosen[first] = true;
    centroids.push(points[first].to_vec());

    let mut closest: Vec<f64> = points
        .iter()
        .map(|p| f64::from(cosine_distance(p, &centroids[0])).powi(2))
        .collect();

    while centroids.len() < k {
        let total: f64 = closest.iter().sum();
        let next = if total <= f64::EPSILON {
            // every remaining point coincides with a centroid
            chosen.iter().position(|c| !c)
        } else {
            let mut target = rng.random::<f64>() * total;
            let mut pick = None;
            for (i, weight) in closest.iter().enumerate() {
                if *weight <= 0.0 {
                    continue;
                }
                pick = Some(i);
                if target < *weight {
                    break;
                }
                target -= weight;
            }
            pick
        };

        let Some(next) = next else { break };
        chosen[next] = true;
        centroids.push(points[next].to_vec());

        for (i, point) in points.iter().enumerate() {
            let d = f64::from(cosine_distance(point, points[next])).powi(2);
            if d < closest[i] {
                closest[i] = d;
            }
        }
        closest[next] = 0.0;
    }

    centroids
}

pub fn kmeans(points: &[&[f32]], params: KMeansParams) -> Result<KMeansResult, ClusteringError> {
    let Some(first) = points.first() else {
        return Ok(KMeansResult {
            assignments: vec![],
            centroids: vec![],
            iterations: 0,
            converged: true,
        });
    };
    let dimensions = first.len();
    if let Some((index, p)) = points.iter().enumerate().find(|(_, p)| p.len() != dimensions) {
        return Err(ClusteringError::DimensionMismatch {
            index,
            expected: dimensions,
            got: p.len(),
        });
    }

    let k = params.k.clamp(1, points.len());
    let mut rng = StdRng::seed_from_u64(params.seed);
    let mut centroids = seed_centroids(points, k, &mut rng);

    let mut assignments = vec![usize::MAX; points.len()];
    let mut iterations = 0;
    let mut converged = false;

    while iterations < params.max_iterations {
        iterations += 1;

        let next: Vec<usize> = points.par_iter().map(|p| nearest(p, &centroids)).collect();
        if next == assignments {
            converged = true;
            break;
        }
        assignments = next;

        for (j, centroid) in centroids.iter_mut().enumerate() {
            let members = points
                .iter()
                .zip(&assignments)
                .filter(|(_, a)| **a == j)
                .map(|(p, _)| *p);
            // an empty cluster keeps its previous centroid
            if let Some(updated) = mean(members, dimensions) {
                *centroid = updated;
            }
        }
    }

    Ok(KMeansResult {
        assignments,
        centroids,
        iterations,
        converged,
    })
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Most frequent key; ties go to the smallest key.
fn most_common(counts: &BTreeMap<String, usize>, min_count: usize) -> Option<&str> {
    counts
        .iter()
        .filter(|(_, c)| **c >= min_count)
        .fold(None::<(&String, usize)>, |best, (key, count)| match best {
            Some((_, best_count)) if best_count >= *count => best,
            _ => Some((key, *count)),
        })
        .map(|(key, _)| key.as_str())
}

fn extension_label(extension: &str) -> Option<&'static str> {
    let label = match extension {
        "md" => "Docs",
        "rs" => "Rust",
        "ts" | "tsx" => "TypeScript",
        "js" | "jsx" => "JavaScript",
        "py" => "Python",
        "json" | "yaml" | "yml" | "toml" => "Config",
        "css" | "scss" => "Styles",
        "html" => "HTML",
        "sql" => "Database",
        "sh" | "bash" => "Scripts",
        "txt" => "Text",
        _ => return None,
    };
    Some(label)
}

fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn stem_and_extension(path: &str) -> (&str, &str) {
    let name = file_name(path);
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, ext),
        _ => (name, ""),
    }
}

fn words(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
}

/// Name a cluster from its member paths.
pub fn label_for(paths: &[String], id: usize) -> String {
    let mut word_counts = BTreeMap::new();
    let mut dir_counts = BTreeMap::new();
    let mut ext_counts = BTreeMap::new();

    for path in paths {
        let (stem, ext) = stem_and_extension(path);
        for word in words(stem) {
            if word.chars().count() > 3 && !LABEL_STOP_WORDS.contains(&word.as_str()) {
                *word_counts.entry(word).or_insert(0) += 1;
            }
        }

        let mut parts = path.rsplit('/');
        parts.next();
        if let Some(dir) = parts.next() {
            if dir.chars().count() > 2 {
                *dir_counts.entry(dir.to_lowercase()).or_insert(0) += 1;
            }
        }

        if !ext.is_empty() {
            *ext_counts.entry(ext.to_lowercase()).or_insert(0) += 1;
        }
    }

    if let Some(word) = most_common(&word_counts, 2) {
        return capitalize(word);
    }
    if let Some(dir) = most_common(&dir_counts, 1) {
        return capitalize(dir);
    }
    if let Some(label) = most_common(&ext_counts, 1).and_then(extension_label) {
        return label.to_string();
    }
    format!("Group {}", id + 1)
}

/// The most frequent tokens across member paths.
pub fn keywords_for(paths: &[String]) -> Vec<String> {
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for path in paths {
        let (stem, _) = stem_and_extension(path);
        let dirs = path.rsplit_once('/').map(|(dirs, _)| dirs).unwrap_or("");
        for word in words(dirs).chain(words(stem)) {
            if word.chars().count() > 2
                && !LABEL_STOP_WORDS.contains(&word.as_str())
                && !super::lexical::STOP_WORDS.contains(&word.as_str())
            {
                *counts.entry(word).or_insert(0) += 1;
            }
        }
    }

    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked
        .into_iter()
        .take(KEYWORD_COUNT)
        .map(|(word, _)| word)
        .collect()
}

/// Cluster `points` (path, vector), which must be sorted by path.
pub fn cluster_points(
    points: &[(String, &[f32])],
    requested_k: Option<usize>,
    settings: &ClusteringConfig,
) -> Result<ClusterOutcome, ClusteringError> {
    if points.len() < MIN_POINTS {
        return Ok(ClusterOutcome::InsufficientData {
            embedded_files: points.len(),
            required: MIN_POINTS,
        });
    }

    let k = choose_k(points.len(), requested_k, settings.max_k);
    let vectors: Vec<&[f32]> = points.iter().map(|(_, v)| *v).collect();
    let result = kmeans(
        &vectors,
        KMeansParams {
            k,
            seed: settings.seed,
            max_iterations: settings.max_iterations,
        },
    )?;

    let clusters: Vec<Cluster> = result
        .centroids
        .iter()
        .enumerate()
        .filter_map(|(j, centroid)| {
            let members: Vec<String> = points
                .iter()
                .zip(&result.assignments)
                .filter(|(_, a)| **a == j)
                .map(|((path, _), _)| path.clone())
                .collect();
            (!members.is_empty()).then(|| (centroid, members))
        })
        .enumerate()
        .map(|(id, (centroid, members))| Cluster {
            id,
            label: Some(label_for(&members, id)),
            keywords: keywords_for(&members),
            size: members.len(),
            members,
            centroid: centroid.clone(),
        })
        .collect();

    log::info!(
        "clustering points={} k={} clusters={} iterations={} converged={}",
        points.len(),
        k,
        clusters.len(),
        result.iterations,
        result.converged
    );

    Ok(ClusterOutcome::Clustered {
        clusters,
        k,
        iterations: result.iterations,
        converged: result.converged,
        embedded_files: points.len(),
        created_at: Utc::now(),
    })
}

pub fn load_last(storage: &BackendLocal) -> std::io::Result<Option<ClusterOutcome>> {
    storage.read_json(CLUSTERS_FILE)
}

pub fn save(storage: &BackendLocal, outcome: &ClusterOutcome) -> std::io::Result<()> {
    storage.write_json(CLUSTERS_FILE, outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> ClusteringConfig {
        ClusteringConfig::default()
    }

    fn two_blobs() -> Vec<(String, Vec<f32>)> {
        let mut points = vec![];
        for i in 0..4 {
            points.push((format!("a/{i}.md"), vec![1.0, 0.05 * i as f32, 0.0]));
            points.push((format!("b/{i}.md"), vec![0.0, 0.05 * i as f32, 1.0]));
        }
        points.sort_by(|a, b| a.0.cmp(&b.0));
        points
    }

    fn borrowed(points: &[(String, Vec<f32>)]) -> Vec<(String, &[f32])> {
        points.iter().map(|(p, v)| (p.clone(), v.as_slice())).collect()
    }

    #[test]
    fn test_choose_k() {
        assert_eq!(choose_k(0, None, None), 0);
        assert_eq!(choose_k(1, None, None), 1);
        assert_eq!(choose_k(10, None, None), 3);
        assert_eq!(choose_k(100, None, None), 10);
        assert_eq!(choose_k(100, None, Some(4)), 4);
        assert_eq!(choose_k(5, Some(9), None), 5);
        assert_eq!(choose_k(5, Some(0), None), 1);
    }

    #[test]
    fn test_insufficient_data() {
        let v = vec![1.0, 0.0];
        let points = vec![("a.md".to_string(), v.as_slice())];
        let outcome = cluster_points(&points, None, &settings()).unwrap();
        assert_eq!(
            outcome,
            ClusterOutcome::InsufficientData {
                embedded_files: 1,
                required: 2
            }
        );
    }

    #[test]
    fn test_two_blobs_separate() {
        let owned = two_blobs();
        let points = borrowed(&owned);
        let outcome = cluster_points(&points, Some(2), &settings()).unwrap();

        let ClusterOutcome::Clustered { clusters, .. } = outcome else {
            panic!("expected clusters");
        };
        assert_eq!(clusters.len(), 2);
        for cluster in &clusters {
            let prefix = &cluster.members[0][..2];
            assert!(cluster.members.iter().all(|m| m.starts_with(prefix)));
            assert_eq!(cluster.size, 4);
        }
    }

    #[test]
    fn test_deterministic_for_seed() {
        let owned = two_blobs();
        let points = borrowed(&owned);
        let a = cluster_points(&points, Some(3), &settings()).unwrap();
        let b = cluster_points(&points, Some(3), &settings()).unwrap();

        let members = |o: &ClusterOutcome| match o {
            ClusterOutcome::Clustered { clusters, .. } => {
                clusters.iter().map(|c| c.members.clone()).collect::<Vec<_>>()
            }
            _ => vec![],
        };
        assert_eq!(members(&a), members(&b));
    }

    #[test]
    fn test_identical_points_single_centroid_ties() {
        let v = vec![0.5f32, 0.5];
        let points: Vec<&[f32]> = vec![&v, &v, &v];
        let result = kmeans(
            &points,
            KMeansParams {
                k: 2,
                seed: 7,
                max_iterations: 10,
            },
        )
        .unwrap();
        // ties go to centroid 0, centroid 1 stays empty
        assert_eq!(result.assignments, vec![0, 0, 0]);
        assert!(result.converged);
    }

    #[test]
    fn test_dimension_mismatch() {
        let a = vec![1.0f32, 0.0];
        let b = vec![1.0f32];
        let err = kmeans(
            &[&a, &b],
            KMeansParams {
                k: 1,
                seed: 1,
                max_iterations: 5,
            },
        )
        .unwrap_err();
        assert!(matches!(err, ClusteringError::DimensionMismatch { index: 1, .. }));
    }

    #[test]
    fn test_labels() {
        let by_word = vec![
            "x/budget-2023.xlsx".to_string(),
            "y/budget-2024.xlsx".to_string(),
        ];
        assert_eq!(label_for(&by_word, 0), "Budget");

        let by_dir = vec!["notes/a.md".to_string(), "notes/b.md".to_string()];
        assert_eq!(label_for(&by_dir, 0), "Notes");

        let by_ext = vec!["a.rs".to_string(), "b.rs".to_string()];
        assert_eq!(label_for(&by_ext, 0), "Rust");

        let fallback = vec!["a.zzz".to_string()];
        assert_eq!(label_for(&fallback, 4), "Group 5");
    }

    #[test]
    fn test_keywords() {
        let paths = vec![
            "reports/budget-q1.md".to_string(),
            "reports/budget-q2.md".to_string(),
            "reports/summary.md".to_string(),
        ];
        assert_eq!(keywords_for(&paths), vec!["reports", "budget", "summary"]);
    }
}
