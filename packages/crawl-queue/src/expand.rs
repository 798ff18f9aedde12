use lazy_static::lazy_static;
use regex::Regex;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use crate::error::Result;
use crate::traits::{ExpansionContext, ExpansionHook, PageTree, RecordLookup, RecordQuery};

lazy_static! {
    static ref INTEGER_RANGE: Regex = Regex::new(r"^(-?[0-9]+)\s*-\s*(-?[0-9]+)$").unwrap();
}

/// Maximum number of values a single range part may emit.
pub const RANGE_LIMIT: usize = 1000;

const TABLE_DIRECTIVE: &str = "_TABLE:";

/// Parameter name to raw expression, in the order the parameters were declared.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterSpec {
    entries: Vec<(String, String)>,
}

impl ParameterSpec {
    /// Parse a query string such as `&L=0&p=[1-3]`.
    ///
    /// Keys and values are URL-decoded. A repeated key overwrites the earlier
    /// value but keeps its position. Pairs with an empty key are ignored.
    pub fn parse(query: &str) -> Self {
        let mut spec = Self::default();
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let key = decode(key);
            if key.is_empty() {
                continue;
            }
            spec.insert(key, decode(value));
        }
        spec
    }

    pub fn insert(&mut self, name: impl Into<String>, expression: impl Into<String>) {
        let name = name.into();
        let expression = expression.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = expression,
            None => self.entries.push((name, expression)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, e)| (n.as_str(), e.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ParameterSpec {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut spec = Self::default();
        for (k, v) in iter {
            spec.insert(k, v);
        }
        spec
    }
}

fn decode(raw: &str) -> String {
    let plus_as_space = raw.replace('+', " ");
    urlencoding::decode(&plus_as_space)
        .map(|s| s.into_owned())
        .unwrap_or(plus_as_space)
}

/// Parameter name to its unique values, keyed in ascending name order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpandedParameters(BTreeMap<String, Vec<String>>);

impl ExpandedParameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the values of a parameter, dropping repeated values.
    pub fn insert(&mut self, name: impl Into<String>, values: Vec<String>) {
        self.0.insert(name.into(), unique(values));
    }

    pub fn get(&self, name: &str) -> Option<&[String]> {
        self.0.get(name).map(Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<String>)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of URLs the full cartesian product would produce.
    pub fn combinations(&self) -> usize {
        self.0
            .values()
            .fold(1usize, |acc, values| acc.saturating_mul(values.len()))
    }
}

/// Remove repeated values, keeping the first occurrence.
fn unique(values: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    values
        .into_iter()
        .filter(|v| seen.insert(v.clone()))
        .collect()
}

/// Expands bracketed parameter expressions into concrete value sets.
///
/// Grammar inside `[...]`, parts separated by `|`:
/// - `A-B` integer range (swapped when `A > B`, at most [`RANGE_LIMIT`] values)
/// - `_TABLE:name;_PID:p;_RECURSIVE:d;_PIDFIELD:f;_WHERE:w;_ADDTABLE:t;_FIELD:f;_ENABLELANG:1`
/// - anything else is a literal value
pub struct ParameterExpander {
    lookup: Arc<dyn RecordLookup>,
    tree: Arc<dyn PageTree>,
    hooks: Vec<Arc<dyn ExpansionHook>>,
}

impl ParameterExpander {
    pub fn new(lookup: Arc<dyn RecordLookup>, tree: Arc<dyn PageTree>) -> Self {
        Self {
            lookup,
            tree,
            hooks: Vec::new(),
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn ExpansionHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Expand every parameter of `spec` in the context of `page_id`.
    ///
    /// Only record lookup and page tree failures are errors.
    pub async fn expand(&self, spec: &ParameterSpec, page_id: i64) -> Result<ExpandedParameters> {
        let mut expanded = ExpandedParameters::new();

        for (name, raw) in spec.iter() {
            let trimmed = raw.trim();
            let Some(inner) = trimmed
                .strip_prefix('[')
                .and_then(|rest| rest.strip_suffix(']'))
            else {
                expanded.insert(name, vec![trimmed.to_string()]);
                continue;
            };

            let mut values = Vec::new();
            for part in inner.split('|') {
                if let Some(range) = expand_range(part) {
                    values.extend(range);
                } else if part.trim().starts_with(TABLE_DIRECTIVE) {
                    values.extend(self.expand_table(part, page_id).await?);
                } else {
                    values.push(part.to_string());
                }

                let context = ExpansionContext {
                    parameter: name,
                    part,
                    page_id,
                };
                for hook in &self.hooks {
                    hook.after_part(&context, &mut values);
                }
            }

            expanded.insert(name, values);
        }

        Ok(expanded)
    }

    async fn expand_table(&self, part: &str, page_id: i64) -> Result<Vec<String>> {
        let directive = TableDirective::parse(part);
        let Some(table) = directive.get("_TABLE").filter(|t| !t.is_empty()) else {
            return Ok(Vec::new());
        };

        let lookup_pid = directive.get("_PID").map(leading_int).unwrap_or(page_id);
        let recursion_depth = directive.get("_RECURSIVE").map(leading_int).unwrap_or(0);

        let mut scope_page_ids = vec![lookup_pid];
        if recursion_depth > 0 {
            let subtree = self.tree.subtree(lookup_pid, recursion_depth).await?;
            scope_page_ids.extend(subtree.iter().map(|p| p.uid));
        }

        let query = RecordQuery {
            table: table.to_string(),
            scope_page_ids,
            recursion_depth,
            pid_field: directive.get("_PIDFIELD").unwrap_or("pid").to_string(),
            where_clause: directive.get("_WHERE").unwrap_or_default().to_string(),
            add_table: directive.get("_ADDTABLE").unwrap_or_default().to_string(),
            project_field: directive
                .get("_FIELD")
                .filter(|f| !f.is_empty())
                .unwrap_or("uid")
                .to_string(),
            exclude_translations: directive
                .get("_ENABLELANG")
                .map(|v| !v.is_empty() && v != "0")
                .unwrap_or(false),
        };

        Ok(unique(self.lookup.lookup(&query).await?))
    }
}

/// Emit the integers of an `A-B` part, or `None` when the part is no range.
fn expand_range(part: &str) -> Option<Vec<String>> {
    let captures = INTEGER_RANGE.captures(part.trim())?;
    let a: i64 = captures[1].parse().ok()?;
    let b: i64 = captures[2].parse().ok()?;
    let (low, high) = if a > b { (b, a) } else { (a, b) };

    Some(
        (low..=high)
            .take(RANGE_LIMIT)
            .map(|n| n.to_string())
            .collect(),
    )
}

/// Key/value pairs of a `_TABLE:` part.
///
/// Each `;` separated piece is split on `:` and only its first two fields
/// are kept, so values cannot contain a colon.
struct TableDirective(Vec<(String, Option<String>)>);

impl TableDirective {
    fn parse(part: &str) -> Self {
        let mut pairs: Vec<(String, Option<String>)> = Vec::new();
        for piece in part.split(';').map(str::trim) {
            let mut fields = piece.split(':').map(str::trim);
            let key = fields.next().unwrap_or_default().to_string();
            let value = fields.next().map(str::to_string);
            match pairs.iter_mut().find(|(k, _)| *k == key) {
                Some(existing) => existing.1 = value,
                None => pairs.push((key, value)),
            }
        }
        Self(pairs)
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .and_then(|(_, v)| v.as_deref())
    }
}

/// Integer prefix of a string (`"12abc"` is 12, garbage is 0).
pub fn leading_int(raw: &str) -> i64 {
    let trimmed = raw.trim_start();
    let (sign, digits) = match trimmed.as_bytes().first() {
        Some(b'-') => (-1, &trimmed[1..]),
        Some(b'+') => (1, &trimmed[1..]),
        _ => (1, trimmed),
    };
    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    digits[..end]
        .parse::<i64>()
        .map(|n| sign * n)
        .unwrap_or(0)
}
