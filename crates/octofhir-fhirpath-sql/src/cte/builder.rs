//! Fragment to CTE conversion.

use std::sync::Arc;

use tracing::{debug, trace};

use super::Cte;
use crate::Result;
use crate::dialect::Dialect;
use crate::fragment::{ELEMENT_ALIAS, FragmentShape, SqlFragment, meta, select_unnest, select_value};

/// Converts fragments into CTEs, threading each stage into the next.
#[derive(Debug)]
pub struct CteBuilder {
    dialect: Arc<dyn Dialect>,
    prefix: String,
    counter: usize,
}

impl CteBuilder {
    pub fn new(dialect: Arc<dyn Dialect>) -> Self {
        Self::with_prefix(dialect, "cte")
    }

    /// Builder naming unaliased fragments `{prefix}_{n}`.
    pub fn with_prefix(dialect: Arc<dyn Dialect>, prefix: impl Into<String>) -> Self {
        Self {
            dialect,
            prefix: prefix.into(),
            counter: 0,
        }
    }

    /// Wrap one fragment in a CTE.
    ///
    /// `previous` takes precedence over the fragment's own source table. The
    /// CTE depends on `previous` plus every fragment dependency, without
    /// duplicates, and receives a copy of the fragment metadata.
    pub fn fragment_to_cte(
        &mut self,
        fragment: &SqlFragment,
        previous: Option<&Cte>,
    ) -> Result<Cte> {
        fragment.validate(self.counter)?;

        let source = previous
            .map(|cte| cte.name.as_str())
            .or(fragment.source_table.as_deref());
        let keyed = fragment.is_keyed();

        let query = match (fragment.shape, fragment.requires_unnest) {
            (FragmentShape::Query, _) => fragment.expression.clone(),
            (FragmentShape::Column, true) => {
                let Some(source) = source else {
                    return Err(crate::error::ValidationError::EmptyQuery {
                        cte: self.peek_name(fragment),
                    }
                    .into());
                };
                let lateral = self.dialect.unnest_json_array(
                    &fragment.expression,
                    &fragment.array_path(),
                    ELEMENT_ALIAS,
                )?;
                let source_ordered = previous
                    .is_some_and(|cte| cte.metadata.contains_key(meta::POSITION_COLUMN));
                select_unnest(source, keyed, source_ordered, &lateral, ELEMENT_ALIAS)
            }
            (FragmentShape::Column, false) => {
                select_value(source, keyed, fragment.is_ordered(), &fragment.expression)
            }
        };

        let name = self.next_name(fragment);
        let mut cte = Cte::new(name, query)?;
        if let Some(previous) = previous {
            cte.add_dependency(previous.name.clone());
        }
        for dependency in &fragment.dependencies {
            cte.add_dependency(dependency.clone());
        }
        cte.requires_unnest = fragment.requires_unnest;
        cte.metadata = fragment.metadata.clone();
        cte.source_fragment = Some(Box::new(fragment.clone()));

        trace!(cte = %cte.name, deps = ?cte.depends_on, "built CTE");
        Ok(cte)
    }

    /// Fold fragments left to right into a linear chain of CTEs.
    ///
    /// Returns the CTEs and whether any of them flattens an array.
    pub fn build_cte_chain(&mut self, fragments: &[SqlFragment]) -> Result<(Vec<Cte>, bool)> {
        for (index, fragment) in fragments.iter().enumerate() {
            fragment.validate(index)?;
        }

        let mut ctes: Vec<Cte> = Vec::with_capacity(fragments.len());
        let mut requires_unnest = false;
        for fragment in fragments {
            let cte = self.fragment_to_cte(fragment, ctes.last())?;
            requires_unnest |= cte.requires_unnest;
            ctes.push(cte);
        }

        debug!(ctes = ctes.len(), requires_unnest, "built CTE chain");
        Ok((ctes, requires_unnest))
    }

    fn peek_name(&self, fragment: &SqlFragment) -> String {
        fragment
            .result_alias()
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}_{}", self.prefix, self.counter + 1))
    }

    fn next_name(&mut self, fragment: &SqlFragment) -> String {
        let name = self.peek_name(fragment);
        self.counter += 1;
        name
    }
}
