//! Budget-bounded chunking of source files.
//!
//! [`Chunker`] walks files in their given order and packs them into
//! [`Chunk`]s whose estimated size stays within the map-token budget. Files
//! are costed as they render into the prompt, header and separator included,
//! and [`Chunker::reserve`] takes the prompt's own overhead out of the budget
//! first. A file is never split across chunks: when one file alone exceeds the budget it
//! becomes its own chunk and its content is truncated with a visible marker.
//!
//! The packing rule itself lives in [`pack_by_budget`] so the reduce stage
//! can group summaries exactly the way files are grouped here.

use crate::error::ConfigError;
use crate::models::{Chunk, SourceFile};
use crate::tokens::TokenEstimator;

/// Greedy, order-preserving bin-packing.
///
/// An item joins the current group while `running + cost <= budget` and the
/// group holds fewer than `max_items`; otherwise the group is closed and a
/// new one starts with the item. An item costing more than `budget` on its
/// own always forms a singleton group. No group is empty, and concatenating
/// the groups reproduces the input.
pub fn pack_by_budget<T, F>(
    items: impl IntoIterator<Item = T>,
    budget: usize,
    max_items: usize,
    cost: F,
) -> Vec<Vec<T>>
where
    F: Fn(&T) -> usize,
{
    let max_items = max_items.max(1);
    let mut groups = Vec::new();
    let mut current: Vec<T> = Vec::new();
    let mut running = 0usize;

    for item in items {
        let c = cost(&item);

        if !current.is_empty() && (running + c > budget || current.len() >= max_items) {
            groups.push(std::mem::take(&mut current));
            running = 0;
        }

        if c > budget {
            groups.push(vec![item]);
            continue;
        }

        running += c;
        current.push(item);
    }

    if !current.is_empty() {
        groups.push(current);
    }

    groups
}

/// Budget left for content once `overhead` tokens of fixed prompt text are
/// set aside. Nothing left is a configuration error naming `field`.
pub fn content_budget(
    field: &'static str,
    budget: usize,
    overhead: usize,
) -> Result<usize, ConfigError> {
    match budget.checked_sub(overhead) {
        Some(left) if left > 0 => Ok(left),
        _ => Err(ConfigError::BudgetExhausted {
            field,
            budget,
            overhead,
        }),
    }
}

// Newline closing each rendered file plus the blank line between files.
const RENDER_GAP: &str = "\n\n";

/// Partitions files into map-sized chunks.
#[derive(Debug, Clone)]
pub struct Chunker {
    estimator: TokenEstimator,
    budget: usize,
}

impl Chunker {
    /// A zero budget is rejected here, before any chunking happens.
    pub fn new(estimator: TokenEstimator, budget: usize) -> Result<Self, ConfigError> {
        if budget == 0 {
            return Err(ConfigError::NonPositive {
                field: "pipeline.map_token_budget",
            });
        }
        Ok(Self { estimator, budget })
    }

    /// Same chunker with `overhead` tokens of the budget set aside for the
    /// prompt that will carry each chunk.
    pub fn reserve(&self, overhead: usize) -> Result<Self, ConfigError> {
        Ok(Self {
            estimator: self.estimator,
            budget: content_budget("pipeline.map_token_budget", self.budget, overhead)?,
        })
    }

    /// Tokens available to rendered files in one chunk.
    pub fn budget(&self) -> usize {
        self.budget
    }

    /// Estimated cost of `file` inside [`Chunk::render`]: header, content
    /// and separator. Summing it over a chunk bounds the rendered estimate.
    pub fn file_cost(&self, file: &SourceFile) -> usize {
        self.estimator.estimate(&file.header())
            + self.estimator.estimate(&file.content)
            + self.estimator.estimate(RENDER_GAP)
    }

    /// Split `files` into chunks, preserving order. Empty input yields no chunks.
    pub fn chunk(&self, files: Vec<SourceFile>) -> Vec<Chunk> {
        let costed: Vec<(usize, SourceFile)> = files
            .into_iter()
            .map(|f| (self.file_cost(&f), f))
            .collect();

        pack_by_budget(costed, self.budget, usize::MAX, |(c, _)| *c)
            .into_iter()
            .enumerate()
            .map(|(index, group)| self.build_chunk(index, group))
            .collect()
    }

    fn build_chunk(&self, index: usize, group: Vec<(usize, SourceFile)>) -> Chunk {
        let tokens: usize = group.iter().map(|(c, _)| c).sum();

        if tokens <= self.budget {
            return Chunk {
                index,
                files: group.into_iter().map(|(_, f)| f).collect(),
                tokens,
                truncated: false,
            };
        }

        // Only a lone oversized file can exceed the budget.
        let files: Vec<SourceFile> = group
            .into_iter()
            .map(|(original, mut file)| {
                let framing = self.file_cost(&SourceFile::new(file.path.as_str(), ""));
                let room = self.budget.saturating_sub(framing).max(1);
                let cut = self.estimator.truncate(&file.content, room).into_owned();
                tracing::info!(
                    path = %file.path,
                    original_tokens = original,
                    budget = self.budget,
                    "truncated oversized file to fit the chunk budget"
                );
                file.content = cut;
                file
            })
            .collect();
        let tokens = files.iter().map(|f| self.file_cost(f)).sum();

        Chunk {
            index,
            files,
            tokens,
            truncated: true,
        }
    }
}
