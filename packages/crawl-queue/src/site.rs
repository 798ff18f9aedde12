use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::path::Path;

use crate::configuration::CrawlConfiguration;
use crate::error::{CrawlerError, Result};
use crate::exclude::UNBOUNDED_DEPTH;
use crate::traits::{ConfigurationSource, PageTree, RecordLookup, RecordQuery};
use crate::types::PageRow;

lazy_static! {
    static ref AND_SEPARATOR: Regex = Regex::new(r"(?i)\s+AND\s+").unwrap();
    static ref EQUALS_CONDITION: Regex = Regex::new(r"^\s*(\w+)\s*=\s*'?([^']*?)'?\s*$").unwrap();
}

const TRANSLATION_POINTER_FIELD: &str = "l10n_parent";
const DELETED_FIELD: &str = "deleted";

/// A configuration attached to a page of the site and inherited by its subtree.
#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfiguration {
    /// Page the configuration is attached to, `None` for the whole site
    #[serde(default)]
    pub root: Option<i64>,
    #[serde(flatten)]
    pub configuration: CrawlConfiguration,
}

/// A whole site described in one JSON document: the page tree, the crawl
/// configurations and the records reachable through `_TABLE:` directives.
///
/// ```json
/// {
///   "pages": [{ "uid": 1, "pid": 0, "title": "Home" }, { "uid": 5, "pid": 1 }],
///   "configurations": [{ "root": 1, "key": "default", "parameters": "&p=[1-3]" }],
///   "tables": { "tx_news": [{ "uid": 3, "pid": 5 }] }
/// }
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StaticSite {
    #[serde(default)]
    pub pages: Vec<PageRow>,
    #[serde(default)]
    pub configurations: Vec<SiteConfiguration>,
    #[serde(default)]
    pub tables: BTreeMap<String, Vec<Map<String, Value>>>,
}

impl StaticSite {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    fn find_page(&self, page_id: i64) -> Option<&PageRow> {
        self.pages.iter().find(|p| p.uid == page_id)
    }

    /// Page ids from `page_id` up to the root.
    fn rootline(&self, page_id: i64) -> Vec<i64> {
        let mut line = Vec::new();
        let mut current = self.find_page(page_id);
        while let Some(page) = current {
            if line.contains(&page.uid) {
                break;
            }
            line.push(page.uid);
            current = self.find_page(page.pid);
        }
        line
    }
}

#[async_trait]
impl PageTree for StaticSite {
    async fn page(&self, page_id: i64) -> Result<Option<PageRow>> {
        Ok(self.find_page(page_id).cloned())
    }

    async fn subtree(&self, root: i64, depth: i64) -> Result<Vec<PageRow>> {
        let max_depth = if depth >= UNBOUNDED_DEPTH { i64::MAX } else { depth };
        let mut pages = Vec::new();
        let mut visited = HashSet::from([root]);
        let mut queue = VecDeque::from([(root, 0_i64)]);

        while let Some((parent, level)) = queue.pop_front() {
            if level >= max_depth {
                continue;
            }
            for child in self.pages.iter().filter(|p| p.pid == parent) {
                if visited.insert(child.uid) {
                    pages.push(child.clone());
                    queue.push_back((child.uid, level + 1));
                }
            }
        }

        Ok(pages)
    }
}

#[async_trait]
impl ConfigurationSource for StaticSite {
    async fn configurations_for_page(&self, page_id: i64) -> Result<Vec<CrawlConfiguration>> {
        let rootline = self.rootline(page_id);
        Ok(self
            .configurations
            .iter()
            .filter(|c| c.root.map_or(true, |root| rootline.contains(&root)))
            .map(|c| c.configuration.clone())
            .collect())
    }
}

#[async_trait]
impl RecordLookup for StaticSite {
    /// Only `field = value` conditions joined by `AND` are understood in
    /// `where_clause`; `add_table` is ignored.
    async fn lookup(&self, query: &RecordQuery) -> Result<Vec<String>> {
        let Some(rows) = self.tables.get(&query.table) else {
            return Ok(Vec::new());
        };
        let conditions = parse_where(&query.where_clause)?;

        Ok(rows
            .iter()
            .filter(|row| {
                row.get(&query.pid_field)
                    .and_then(as_int)
                    .map_or(false, |pid| query.scope_page_ids.contains(&pid))
            })
            .filter(|row| !row.get(DELETED_FIELD).map_or(false, is_set))
            .filter(|row| {
                !query.exclude_translations
                    || row
                        .get(TRANSLATION_POINTER_FIELD)
                        .and_then(as_int)
                        .unwrap_or(0)
                        <= 0
            })
            .filter(|row| {
                conditions.iter().all(|(field, expected)| {
                    row.get(field).map(stringify).as_deref() == Some(expected.as_str())
                })
            })
            .filter_map(|row| row.get(&query.project_field).map(stringify))
            .collect())
    }
}

fn parse_where(clause: &str) -> Result<Vec<(String, String)>> {
    if clause.trim().is_empty() {
        return Ok(Vec::new());
    }
    AND_SEPARATOR
        .split(clause.trim())
        .map(|condition| {
            EQUALS_CONDITION
                .captures(condition)
                .map(|c| (c[1].to_string(), c[2].to_string()))
                .ok_or_else(|| {
                    CrawlerError::Lookup(format!("unsupported where condition: {}", condition))
                })
        })
        .collect()
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => if *b { "1" } else { "0" }.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn as_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(i64::from(*b)),
        _ => None,
    }
}

fn is_set(value: &Value) -> bool {
    as_int(value).map_or(false, |n| n != 0)
}
