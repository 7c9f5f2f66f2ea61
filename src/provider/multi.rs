//! Ordered fallback over several providers of the same width.
//!
//! Vectors keep the identity of the member that produced them: a batch served
//! by a fallback lands in that member's space, never in a shared one.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use super::{EmbeddingProvider, ProviderError};
use crate::config::ConfigError;
use crate::semantic::cache::EmbeddingSpace;

const PROVIDER: &str = "multi";

pub struct MultiProvider {
    members: Vec<Arc<dyn EmbeddingProvider>>,
    model: String,
    dimensions: usize,
    /// Members that failed authentication; skipped until the next run begins
    disabled: Mutex<HashSet<usize>>,
}

impl MultiProvider {
    pub fn new(members: Vec<Arc<dyn EmbeddingProvider>>) -> Result<Self, ConfigError> {
        let first = members.first().ok_or(ConfigError::MissingField {
            provider: "multi",
            field: "providers",
        })?;
        let dimensions = first.dimensions();
        if let Some(other) = members.iter().find(|m| m.dimensions() != dimensions) {
            return Err(ConfigError::DimensionMismatch {
                expected: dimensions,
                got: other.dimensions(),
            });
        }

        let model = members
            .iter()
            .map(|m| format!("{}:{}", m.id(), m.model()))
            .collect::<Vec<_>>()
            .join("|");

        Ok(MultiProvider {
            members,
            model,
            dimensions,
            disabled: Mutex::new(HashSet::new()),
        })
    }

    fn is_disabled(&self, idx: usize) -> bool {
        self.disabled
            .lock()
            .map(|set| set.contains(&idx))
            .unwrap_or(false)
    }

    fn disable(&self, idx: usize) {
        if let Ok(mut set) = self.disabled.lock() {
            set.insert(idx);
        }
    }
}

impl EmbeddingProvider for MultiProvider {
    fn id(&self) -> &str {
        PROVIDER
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn max_batch_size(&self) -> usize {
        self.members
            .iter()
            .map(|m| m.max_batch_size())
            .min()
            .unwrap_or(1)
    }

    fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        self.embed_tagged(inputs).map(|(_, vectors)| vectors)
    }

    fn spaces(&self) -> Vec<EmbeddingSpace> {
        self.members.iter().map(|m| m.space()).collect()
    }

    fn embed_tagged(
        &self,
        inputs: &[String],
    ) -> Result<(EmbeddingSpace, Vec<Vec<f32>>), ProviderError> {
        let mut failures = vec![];

        for (idx, member) in self.members.iter().enumerate() {
            if self.is_disabled(idx) {
                failures.push(format!("{}: skipped after authentication failure", member.id()));
                continue;
            }

            match member.embed(inputs) {
                Ok(vectors) => {
                    if idx > 0 {
                        log::info!(
                            "provider=multi served by fallback #{idx} ({}) inputs={}",
                            member.id(),
                            inputs.len()
                        );
                    }
                    return Ok((member.space(), vectors));
                }
                Err(e) => {
                    log::warn!("provider=multi member={} failed: {e}", member.id());
                    if e.is_auth() {
                        self.disable(idx);
                    }
                    failures.push(e.to_string());
                }
            }
        }

        Err(ProviderError::Exhausted(failures))
    }

    /// Only the member owning `space` can embed a comparable query.
    fn embed_query(&self, space: &EmbeddingSpace, query: &str) -> Result<Vec<f32>, ProviderError> {
        match self.members.iter().find(|m| m.space() == *space) {
            Some(member) => member.embed_query(space, query),
            None => Err(ProviderError::SpaceUnavailable {
                provider: PROVIDER.to_string(),
                space: space.label(),
            }),
        }
    }

    fn begin_run(&self) {
        if let Ok(mut set) = self.disabled.lock() {
            set.clear();
        }
    }
}
