use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::expand::{leading_int, ParameterSpec};
use crate::hash::full_hash;

/// One named job-generation configuration attached to a page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlConfiguration {
    pub key: String,
    /// Query-string form, e.g. `&L=0&p=[1-3]`
    pub parameters: String,
    /// Comma separated processing instructions
    pub proc_instr_filter: String,
    pub proc_instr_params: Option<serde_json::Value>,
    pub base_url: Option<String>,
    pub force_ssl: bool,
    /// Comma separated frontend user group ids
    pub user_groups: String,
    /// Comma separated `pid`, `pid+depth` or `pid+`
    pub exclude: String,
    /// Comma separated page ids the configuration is limited to
    pub pids_only: String,
}

impl CrawlConfiguration {
    pub fn new(key: impl Into<String>, parameters: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            parameters: parameters.into(),
            ..Default::default()
        }
    }

    pub fn parameter_spec(&self) -> ParameterSpec {
        ParameterSpec::parse(&self.parameters)
    }

    /// True unless `pids_only` is set and does not list the page.
    pub fn applies_to_page(&self, page_id: i64) -> bool {
        let pids: Vec<&str> = split_trimmed(&self.pids_only)
            .into_iter()
            .filter(|p| !p.is_empty())
            .collect();
        pids.is_empty() || pids.iter().any(|p| *p == page_id.to_string())
    }

    /// Processing instructions as stored in the job payload. An empty
    /// filter still yields one empty instruction.
    pub fn proc_instructions(&self) -> Vec<String> {
        split_trimmed(&self.proc_instr_filter)
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    /// Filter with whitespace around the list items removed.
    pub fn normalized_filter(&self) -> String {
        if self.proc_instr_filter.is_empty() {
            return String::new();
        }
        split_trimmed(&self.proc_instr_filter).join(",")
    }

    /// Unique user group ids, `None` when no group is set.
    pub fn user_group_list(&self) -> Option<String> {
        let mut seen = HashSet::new();
        let groups: Vec<String> = split_trimmed(&self.user_groups)
            .into_iter()
            .filter(|g| !g.is_empty())
            .map(leading_int)
            .filter(|g| seen.insert(*g))
            .map(|g| g.to_string())
            .collect();

        let list = groups.join(",");
        (!list.is_empty() && list != "0").then_some(list)
    }

    /// Whether the configuration serves one of the requested processing
    /// instructions. No request accepts everything.
    pub fn accepts_instructions(&self, requested: &[String]) -> bool {
        if requested.is_empty() {
            return true;
        }
        let filter = split_trimmed(&self.proc_instr_filter);
        requested
            .iter()
            .any(|pi| filter.iter().any(|f| *f == pi.as_str()))
    }

    /// Stable hash of the configuration and its parsed parameters.
    ///
    /// Expanded values and compiled URLs are not part of it, so it stays
    /// constant while the records behind a `_TABLE:` directive change.
    pub fn configuration_hash(&self) -> String {
        let spec = self.parameter_spec();
        let parsed: Vec<(&str, &str)> = spec.iter().collect();
        let payload = serde_json::json!({
            "configuration": self,
            "parameters": parsed,
        });
        full_hash(&payload.to_string())
    }
}

fn split_trimmed(value: &str) -> Vec<&str> {
    value.split(',').map(str::trim).collect()
}

/// Keep only configurations named in `selection`; an empty selection keeps all.
pub fn filter_selection(
    configurations: Vec<CrawlConfiguration>,
    selection: &[String],
) -> Vec<CrawlConfiguration> {
    if selection.is_empty() {
        return configurations;
    }
    configurations
        .into_iter()
        .filter(|c| selection.iter().any(|s| *s == c.key))
        .collect()
}
