use std::collections::{HashMap, HashSet};

use crate::error::Result;
use crate::expand::leading_int;
use crate::traits::PageTree;

/// Depth used for `pid+` without an explicit depth.
pub const UNBOUNDED_DEPTH: i64 = 99;

/// Memoized expansion of exclude strings such as `12, 40+2, 7+`.
///
/// Entries live as long as the cache does; the generator owns one per pass.
#[derive(Debug, Default)]
pub struct ExcludeCache {
    expanded: HashMap<String, Vec<i64>>,
    subtrees: HashMap<(i64, i64), Vec<i64>>,
}

impl ExcludeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Page ids covered by an exclude string, unique in first-seen order.
    pub async fn expand(&mut self, exclude: &str, tree: &dyn PageTree) -> Result<Vec<i64>> {
        if let Some(cached) = self.expanded.get(exclude) {
            return Ok(cached.clone());
        }

        let mut pids = Vec::new();
        for part in exclude.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (pid, depth) = parse_part(part);
            pids.push(pid);

            if depth > 0 {
                pids.extend(self.subtree(pid, depth, tree).await?);
            }
        }

        let mut seen = HashSet::new();
        pids.retain(|pid| seen.insert(*pid));

        self.expanded.insert(exclude.to_string(), pids.clone());
        Ok(pids)
    }

    pub async fn contains(&mut self, exclude: &str, page_id: i64, tree: &dyn PageTree) -> Result<bool> {
        if exclude.trim().is_empty() {
            return Ok(false);
        }
        Ok(self.expand(exclude, tree).await?.contains(&page_id))
    }

    async fn subtree(&mut self, pid: i64, depth: i64, tree: &dyn PageTree) -> Result<Vec<i64>> {
        if let Some(cached) = self.subtrees.get(&(pid, depth)) {
            return Ok(cached.clone());
        }
        let uids: Vec<i64> = tree.subtree(pid, depth).await?.iter().map(|p| p.uid).collect();
        self.subtrees.insert((pid, depth), uids.clone());
        Ok(uids)
    }

    pub fn len(&self) -> usize {
        self.expanded.len()
    }

    pub fn is_empty(&self) -> bool {
        self.expanded.is_empty()
    }
}

/// `pid` is depth 0, `pid+d` depth d, `pid+` unbounded.
fn parse_part(part: &str) -> (i64, i64) {
    match part.split_once('+') {
        None => (leading_int(part), 0),
        Some((pid, depth)) => {
            let depth = leading_int(depth.trim());
            let depth = if depth == 0 { UNBOUNDED_DEPTH } else { depth };
            (leading_int(pid.trim()), depth)
        }
    }
}
