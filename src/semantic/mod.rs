//! Vector-side building blocks: the embedding cache, clustering, similarity
//! grouping and hybrid ranking.

pub mod cache;
pub mod clustering;
pub mod hybrid;
pub mod lexical;
pub mod preprocess;
pub mod similarity;
pub mod vectors;
