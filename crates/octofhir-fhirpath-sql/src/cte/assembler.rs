//! Dependency ordering and `WITH` clause rendering.

use std::collections::VecDeque;

use indexmap::IndexMap;
use tracing::{debug, trace};

use super::Cte;
use crate::Result;
use crate::error::AssemblyError;

/// Orders CTEs by their dependencies and renders the final statement.
#[derive(Debug, Default, Clone, Copy)]
pub struct CteAssembler;

impl CteAssembler {
    pub fn new() -> Self {
        Self
    }

    /// Assemble `WITH ... SELECT * FROM <last>;` from a CTE collection.
    pub fn assemble_query(&self, ctes: &[Cte]) -> Result<String> {
        if ctes.is_empty() {
            return Err(AssemblyError::EmptyCteList.into());
        }
        for cte in ctes {
            cte.validate()?;
        }

        let ordered = self.order_ctes_by_dependencies(ctes)?;
        let sql = render(&ordered);
        debug!(ctes = ordered.len(), "assembled query");
        Ok(sql)
    }

    /// Kahn's algorithm. Independent CTEs keep their input order.
    pub fn order_ctes_by_dependencies<'a>(
        &self,
        ctes: &'a [Cte],
    ) -> std::result::Result<Vec<&'a Cte>, AssemblyError> {
        let mut index: IndexMap<&str, usize> = IndexMap::with_capacity(ctes.len());
        for (i, cte) in ctes.iter().enumerate() {
            if index.insert(cte.name.as_str(), i).is_some() {
                return Err(AssemblyError::DuplicateCte {
                    name: cte.name.clone(),
                });
            }
        }

        let mut in_degree = vec![0usize; ctes.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); ctes.len()];
        for (i, cte) in ctes.iter().enumerate() {
            let mut seen: Vec<usize> = Vec::with_capacity(cte.depends_on.len());
            for dependency in &cte.depends_on {
                let Some(&d) = index.get(dependency.as_str()) else {
                    return Err(AssemblyError::MissingDependency {
                        cte: cte.name.clone(),
                        missing: dependency.clone(),
                    });
                };
                if seen.contains(&d) {
                    continue;
                }
                seen.push(d);
                in_degree[i] += 1;
                dependents[d].push(i);
            }
        }

        let mut queue: VecDeque<usize> = (0..ctes.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut ordered = Vec::with_capacity(ctes.len());
        let mut visited = vec![false; ctes.len()];

        while let Some(i) = queue.pop_front() {
            trace!(cte = %ctes[i].name, "ordered CTE");
            visited[i] = true;
            ordered.push(&ctes[i]);
            for &dependent in &dependents[i] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    queue.push_back(dependent);
                }
            }
        }

        if ordered.len() < ctes.len() {
            return Err(AssemblyError::CircularDependency {
                cycle: find_cycle(ctes, &index, &visited),
            });
        }

        Ok(ordered)
    }
}

/// Walk `depends_on` edges through unvisited CTEs until a name repeats.
///
/// Every CTE left unvisited by Kahn's algorithm still has an unvisited
/// dependency, so the walk always closes a loop.
fn find_cycle(ctes: &[Cte], index: &IndexMap<&str, usize>, visited: &[bool]) -> Vec<String> {
    let Some(start) = visited.iter().position(|v| !v) else {
        return Vec::new();
    };

    let mut path: Vec<usize> = vec![start];
    let mut current = start;
    loop {
        let next = ctes[current]
            .depends_on
            .iter()
            .filter_map(|name| index.get(name.as_str()).copied())
            .find(|&d| !visited[d]);
        let Some(next) = next else {
            break;
        };
        if let Some(pos) = path.iter().position(|&p| p == next) {
            let mut cycle: Vec<String> = path[pos..].iter().map(|&i| ctes[i].name.clone()).collect();
            cycle.push(ctes[next].name.clone());
            return cycle;
        }
        path.push(next);
        current = next;
    }

    path.iter().map(|&i| ctes[i].name.clone()).collect()
}

fn render(ordered: &[&Cte]) -> String {
    let definitions: Vec<String> = ordered
        .iter()
        .map(|cte| format!("{} AS (\n  {}\n)", cte.name, cte.query))
        .collect();
    let last = ordered.last().map(|cte| cte.name.as_str()).unwrap_or_default();
    format!("WITH {}\nSELECT * FROM {last};", definitions.join(", "))
}
