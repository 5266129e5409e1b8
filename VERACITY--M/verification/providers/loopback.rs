use std::{fs, path::Path};

use anyhow::{Context, Result};
use async_trait::async_trait;

use super::{ProviderPayload, SearchProvider};
use crate::{error::ProviderError, model::Evidence, text::significant_terms};

/// Deterministic provider over an in-memory corpus. Used offline and in tests.
#[derive(Debug, Clone, Default)]
pub struct LoopbackSearchProvider {
    corpus: Vec<Evidence>,
}

impl LoopbackSearchProvider {
    /// Provider over `corpus`.
    #[must_use]
    pub fn new(corpus: Vec<Evidence>) -> Self {
        Self { corpus }
    }

    /// Loads a JSON array of `{url, title, snippet}` documents.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading corpus {}", path.display()))?;
        let corpus: Vec<Evidence> = serde_json::from_str(&raw)
            .with_context(|| format!("parsing corpus {}", path.display()))?;
        Ok(Self::new(
            corpus
                .into_iter()
                .map(|doc| Evidence::new(doc.url, doc.title, doc.snippet))
                .collect(),
        ))
    }

    /// Documents in the corpus.
    #[must_use]
    pub fn len(&self) -> usize {
        self.corpus.len()
    }

    /// Whether the corpus is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.corpus.is_empty()
    }
}

#[async_trait]
impl SearchProvider for LoopbackSearchProvider {
    fn name(&self) -> &str {
        "loopback"
    }

    async fn search(&self, query: &str, limit: usize) -> Result<ProviderPayload, ProviderError> {
        // Site-restricted clauses carry no content terms.
        let content = query.split(" OR (site:").next().unwrap_or(query);
        let terms = significant_terms(content);
        let mut scored = self
            .corpus
            .iter()
            .enumerate()
            .filter_map(|(idx, doc)| {
                let haystack = significant_terms(&format!("{} {}", doc.title, doc.snippet));
                let score = terms.iter().filter(|term| haystack.contains(term)).count();
                (score > 0).then_some((score, idx))
            })
            .collect::<Vec<_>>();
        scored.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        Ok(ProviderPayload::Evidence(
            scored
                .into_iter()
                .take(limit)
                .map(|(_, idx)| self.corpus[idx].clone())
                .collect(),
        ))
    }
}
