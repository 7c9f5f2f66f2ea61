//! Hybrid search over one index.

use rayon::prelude::*;
use serde::Serialize;

use crate::errors::Result;
use crate::index::Index;
use crate::provider::EmbeddingProvider;
use crate::semantic::hybrid;
use crate::semantic::lexical::{self, LexicalFields};
use crate::semantic::preprocess::{preview, read_text};
use crate::semantic::vectors::{cosine_similarity, join};

#[derive(Clone, Debug, Default)]
pub struct SearchRequest {
    pub query: String,
    /// Falls back to `search.top_k`
    pub top_k: Option<usize>,
    /// Falls back to `search.semantic_weight`; clamped to [0, 1]
    pub semantic_weight: Option<f32>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SearchHit {
    pub path: String,
    pub name: String,
    pub score: f32,
    pub lexical: f32,
    pub semantic: Option<f32>,
    pub preview: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SearchResponse {
    pub query: String,
    pub semantic_weight: f32,
    /// Whether the query was embedded and compared against file vectors
    pub semantic_used: bool,
    pub total_candidates: usize,
    pub results: Vec<SearchHit>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Rank files for `request`. Without a usable provider, or with nothing
/// embedded yet, the search is keyword-only: `semantic_used` is false and
/// `semantic_weight` reports the 0 actually applied.
pub fn search(
    index: &Index,
    provider: Option<&dyn EmbeddingProvider>,
    request: &SearchRequest,
) -> Result<SearchResponse> {
    let settings = &index.config().search;
    let weight = request
        .semantic_weight
        .unwrap_or(settings.semantic_weight)
        .clamp(0.0, 1.0);
    let top_k = request.top_k.unwrap_or(settings.top_k);
    let terms = lexical::tokenize(&request.query);

    let table = index.load_records()?.table;
    let mut response = SearchResponse {
        query: request.query.clone(),
        semantic_weight: weight,
        semantic_used: false,
        total_candidates: 0,
        results: vec![],
        message: None,
    };
    if table.is_empty() {
        response.message = Some("index is empty; run a scan first".to_string());
        return Ok(response);
    }

    let semantic = match provider {
        Some(provider) if weight > 0.0 && !request.query.trim().is_empty() => {
            let (space, snapshot) = index.preferred_vectors(provider.spaces(), &table)?;
            if snapshot.is_empty() {
                response.message = Some("no embeddings yet; results are keyword-only".to_string());
                None
            } else {
                match provider.embed_query(&space, &request.query) {
                    Ok(vector) => Some((vector, snapshot)),
                    Err(e) => {
                        log::warn!("search: query embedding failed, keyword-only: {e}");
                        response.message = Some(format!(
                            "semantic scoring unavailable ({e}); results are keyword-only"
                        ));
                        None
                    }
                }
            }
        }
        None if weight > 0.0 && !request.query.trim().is_empty() => {
            response.message =
                Some("semantic scoring unavailable; results are keyword-only".to_string());
            None
        }
        _ => None,
    };

    // Nothing can score semantically: rank on keywords alone.
    let weight = if semantic.is_some() { weight } else { 0.0 };
    response.semantic_weight = weight;
    response.semantic_used = semantic.is_some();
    let (query_vector, snapshot) = match semantic {
        Some((vector, snapshot)) => (Some(vector), Some(snapshot)),
        None => (None, None),
    };

    let empty = Default::default();
    let files = join(&table, snapshot.as_ref().unwrap_or(&empty));
    let root = index.root();

    // (file index, semantic, lexical, text)
    let scored: Vec<(usize, Option<f32>, f32, Option<String>)> = files
        .par_iter()
        .enumerate()
        .map(|(i, file)| {
            let text = if terms.is_empty() || weight >= 1.0 {
                None
            } else {
                read_text(&file.record.absolute(root), settings.max_text_bytes)
            };
            let lexical = lexical::score_terms(
                &terms,
                LexicalFields {
                    name: file.record.name(),
                    path: &file.record.path,
                    text: text.as_deref(),
                },
            );
            let semantic = match (&query_vector, file.vector) {
                (Some(q), Some(v)) => Some(cosine_similarity(q, v)),
                _ => None,
            };
            (i, semantic, lexical, text)
        })
        .collect();

    let mut texts: Vec<Option<String>> = Vec::with_capacity(scored.len());
    let inputs: Vec<(usize, Option<f32>, f32)> = scored
        .into_iter()
        .map(|(i, semantic, lexical, text)| {
            texts.push(text);
            (i, semantic, lexical)
        })
        .collect();

    response.total_candidates = inputs
        .iter()
        .filter(|(_, semantic, lexical)| hybrid::is_candidate(*semantic, *lexical, weight))
        .count();

    let ranked = hybrid::rank(inputs, weight, top_k, |i| files[*i].record.path.clone());

    response.results = ranked
        .into_iter()
        .map(|scored| {
            let record = files[scored.item].record;
            SearchHit {
                path: record.path.clone(),
                name: record.name().to_string(),
                score: scored.score,
                lexical: scored.lexical,
                semantic: scored.semantic,
                preview: texts[scored.item]
                    .as_deref()
                    .and_then(|text| preview(text, &terms)),
            }
        })
        .collect();

    log::debug!(
        "search query={:?} weight={} semantic_used={} candidates={} returned={}",
        request.query,
        weight,
        response.semantic_used,
        response.total_candidates,
        response.results.len()
    );

    Ok(response)
}
