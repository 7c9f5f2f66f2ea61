use std::sync::Arc;

use super::{embed, fixture, write_tree, Fixture, DIMS};
use crate::batch::{BatchStatus, EmbedOptions};
use crate::provider::{EmbeddingProvider, HashingProvider, ProviderError};
use crate::search::SearchRequest;

/// Same space as the hashing provider, but every call fails.
struct Unreachable(HashingProvider);

impl EmbeddingProvider for Unreachable {
    fn id(&self) -> &str {
        self.0.id()
    }

    fn model(&self) -> &str {
        self.0.model()
    }

    fn dimensions(&self) -> usize {
        self.0.dimensions()
    }

    fn max_batch_size(&self) -> usize {
        self.0.max_batch_size()
    }

    fn embed(&self, _inputs: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        Err(ProviderError::Network {
            provider: "hashing".into(),
            message: "connection refused".into(),
        })
    }
}

fn notes() -> Fixture {
    fixture(&[
        ("rust_notes.md", "compiler notes for rust"),
        ("rust/guide.md", "the rust book, chapter one"),
        ("tomatoes.md", "garden tomatoes need sun"),
        ("car.md", "a trusty old car"),
    ])
}

fn request(query: &str, weight: f32) -> SearchRequest {
    SearchRequest {
        query: query.to_string(),
        top_k: Some(10),
        semantic_weight: Some(weight),
    }
}

#[test]
fn test_keyword_only_ranks_by_lexical_score() {
    let fx = notes();
    let response = fx.service.search(&fx.dir, &request("rust", 0.0)).unwrap();

    assert!(!response.semantic_used);
    assert_eq!(response.semantic_weight, 0.0);
    assert_eq!(response.results[0].path, "rust_notes.md");
    assert!(response.results.iter().all(|hit| hit.path != "tomatoes.md"));
    assert_eq!(response.total_candidates, response.results.len());

    for hit in &response.results {
        assert_eq!(hit.score, hit.lexical);
        assert!(hit.semantic.is_none());
        assert!(hit.lexical > 0.0);
    }
    for pair in response.results.windows(2) {
        assert!(
            pair[0].score > pair[1].score
                || (pair[0].score == pair[1].score && pair[0].path < pair[1].path)
        );
    }
}

#[test]
fn test_preview_surrounds_first_hit() {
    let fx = notes();
    let response = fx.service.search(&fx.dir, &request("tomatoes", 0.0)).unwrap();

    assert_eq!(response.results.len(), 1);
    let preview = response.results[0].preview.as_deref().unwrap();
    assert!(preview.contains("tomatoes"));
}

#[test]
fn test_semantic_only_skips_files_without_vectors() {
    let fx = notes();
    let done = embed(
        &fx,
        Arc::new(HashingProvider::new(DIMS)),
        &EmbedOptions {
            max_files: Some(3),
            batch_size: None,
        },
    );
    assert_eq!(done.status, BatchStatus::Complete);

    let provider = HashingProvider::new(DIMS);
    let response = fx
        .service
        .search_with(&fx.dir, Some(&provider), &request("rust compiler", 1.0))
        .unwrap();

    assert!(response.semantic_used);
    assert_eq!(response.results.len(), 3);
    assert_eq!(response.total_candidates, 3);
    for hit in &response.results {
        let semantic = hit.semantic.unwrap();
        assert!((hit.score - semantic).abs() < 1e-6);
        assert!(hit.preview.is_none());
    }
}

#[test]
fn test_blended_search_keeps_keyword_only_files() {
    let fx = notes();
    embed(&fx, Arc::new(HashingProvider::new(DIMS)), &EmbedOptions::default());
    // scanned after the run, so it has no vector
    write_tree(fx.root.path(), &[("tomatoes_late.md", "late tomatoes")]);
    fx.rescan();

    let provider = HashingProvider::new(DIMS);
    let response = fx
        .service
        .search_with(&fx.dir, Some(&provider), &request("tomatoes", 0.5))
        .unwrap();

    assert!(response.semantic_used);
    assert_eq!(response.semantic_weight, 0.5);
    let late = response
        .results
        .iter()
        .find(|hit| hit.path == "tomatoes_late.md")
        .unwrap();
    assert!(late.semantic.is_none());
    assert!((late.score - 0.5 * late.lexical).abs() < 1e-6);
}

#[test]
fn test_nothing_embedded_ranks_by_keywords() {
    let fx = notes();
    let provider = HashingProvider::new(DIMS);
    let response = fx
        .service
        .search_with(&fx.dir, Some(&provider), &request("tomatoes", 0.5))
        .unwrap();

    assert!(!response.semantic_used);
    assert_eq!(response.semantic_weight, 0.0);
    assert!(response.message.unwrap().contains("no embeddings"));
    assert_eq!(response.results.len(), 1);
    assert_eq!(response.results[0].score, response.results[0].lexical);
}

#[test]
fn test_semantic_only_without_provider_falls_back_to_keywords() {
    let fx = notes();
    let response = fx
        .service
        .search_with(&fx.dir, None, &request("rust", 1.0))
        .unwrap();

    assert!(!response.semantic_used);
    assert_eq!(response.semantic_weight, 0.0);
    assert!(response.message.unwrap().contains("keyword-only"));
    assert_eq!(response.results[0].path, "rust_notes.md");
    assert!(response.results.iter().all(|hit| hit.score == hit.lexical));
}

#[test]
fn test_semantic_only_with_failing_provider_falls_back_to_keywords() {
    let fx = notes();
    embed(&fx, Arc::new(HashingProvider::new(DIMS)), &EmbedOptions::default());

    let provider = Unreachable(HashingProvider::new(DIMS));
    let response = fx
        .service
        .search_with(&fx.dir, Some(&provider), &request("rust", 1.0))
        .unwrap();

    assert!(!response.semantic_used);
    assert_eq!(response.semantic_weight, 0.0);
    assert!(response.message.unwrap().contains("connection refused"));
    assert_eq!(response.results[0].path, "rust_notes.md");
    assert!(response.results.iter().all(|hit| hit.semantic.is_none()));
    assert!(response.results.iter().all(|hit| hit.path != "tomatoes.md"));
}

#[test]
fn test_weight_is_clamped() {
    let fx = notes();
    let response = fx.service.search(&fx.dir, &request("rust", -3.0)).unwrap();
    assert_eq!(response.semantic_weight, 0.0);
    assert!(!response.results.is_empty());
}

#[test]
fn test_empty_index_reports_message() {
    let fx = fixture(&[]);
    let response = fx.service.search(&fx.dir, &request("anything", 0.0)).unwrap();
    assert!(response.results.is_empty());
    assert!(response.message.unwrap().contains("empty"));
}
