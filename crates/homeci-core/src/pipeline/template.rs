//! Branch name templates.

use glob::{MatchOptions, Pattern};

use super::PipelineError;
use crate::config::BranchPipelineConfig;

/// `*` and `?` never match `/`, so `feature/*` does not match `feature/a/b`.
const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Compiled templates of one repository, in configuration order.
#[derive(Debug, Clone)]
pub struct BranchMatcher {
    patterns: Vec<Pattern>,
}

impl BranchMatcher {
    /// Compile every template. The first malformed one is reported.
    pub fn compile(pipelines: &[BranchPipelineConfig]) -> Result<Self, PipelineError> {
        let patterns = pipelines
            .iter()
            .map(|p| {
                Pattern::new(&p.template).map_err(|e| PipelineError::InvalidTemplate {
                    template: p.template.clone(),
                    message: e.msg.to_string(),
                })
            })
            .collect::<Result<_, _>>()?;
        Ok(Self { patterns })
    }

    /// Index of the first pipeline whose template matches `branch`.
    pub fn match_branch(&self, branch: &str) -> Option<usize> {
        self.patterns
            .iter()
            .position(|p| p.matches_with(branch, MATCH_OPTIONS))
    }
}
