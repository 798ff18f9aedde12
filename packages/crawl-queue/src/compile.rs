use crate::expand::ExpandedParameters;

/// Builds the cartesian product of expanded parameters onto seed URLs.
#[derive(Debug, Clone, Copy)]
pub struct UrlCompiler {
    max_urls: usize,
}

impl UrlCompiler {
    pub fn new(max_urls: usize) -> Self {
        Self {
            max_urls: max_urls.max(1),
        }
    }

    pub fn max_urls(&self) -> usize {
        self.max_urls
    }

    /// Append `&key=value` for every combination of values, one key at a
    /// time in ascending key order.
    ///
    /// Output never exceeds the cap; past it, combinations are dropped
    /// silently. Empty values consume their key without appending anything.
    pub fn compile(&self, expanded: &ExpandedParameters, seed_urls: Vec<String>) -> Vec<String> {
        let keys: Vec<_> = expanded.iter().collect();
        self.compile_keys(&keys, seed_urls)
    }

    fn compile_keys(&self, keys: &[(&String, &Vec<String>)], urls: Vec<String>) -> Vec<String> {
        let Some(((name, values), rest)) = keys.split_first() else {
            return urls;
        };

        let encoded_name = urlencoding::encode(name);
        let mut new_urls = Vec::new();
        'outer: for url in &urls {
            for value in values.iter() {
                if new_urls.len() >= self.max_urls {
                    break 'outer;
                }
                if value.is_empty() {
                    new_urls.push(url.clone());
                } else {
                    new_urls.push(format!(
                        "{}&{}={}",
                        url,
                        encoded_name,
                        urlencoding::encode(value)
                    ));
                }
            }
        }

        self.compile_keys(rest, new_urls)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expanded(pairs: &[(&str, &[&str])]) -> ExpandedParameters {
        let mut expanded = ExpandedParameters::new();
        for (name, values) in pairs {
            expanded.insert(*name, values.iter().map(|v| v.to_string()).collect());
        }
        expanded
    }

    #[test]
    fn test_single_range() {
        let urls = UrlCompiler::new(10_000).compile(
            &expanded(&[("p", &["1", "2", "3"])]),
            vec!["?id=5".to_string()],
        );
        assert_eq!(urls, vec!["?id=5&p=1", "?id=5&p=2", "?id=5&p=3"]);
    }

    #[test]
    fn test_cartesian_product_in_key_order() {
        let urls = UrlCompiler::new(10_000).compile(
            &expanded(&[("b", &["x", "y"]), ("a", &["1", "2"])]),
            vec!["?id=1".to_string()],
        );
        assert_eq!(
            urls,
            vec![
                "?id=1&a=1&b=x",
                "?id=1&a=1&b=y",
                "?id=1&a=2&b=x",
                "?id=1&a=2&b=y",
            ]
        );
    }

    #[test]
    fn test_empty_value_consumes_key() {
        let urls = UrlCompiler::new(10_000).compile(
            &expanded(&[("L", &["", "1"])]),
            vec!["?id=1".to_string()],
        );
        assert_eq!(urls, vec!["?id=1", "?id=1&L=1"]);
    }

    #[test]
    fn test_values_are_encoded() {
        let urls = UrlCompiler::new(10_000).compile(
            &expanded(&[("tx[a]", &["a b/c"])]),
            vec!["?id=1".to_string()],
        );
        assert_eq!(urls, vec!["?id=1&tx%5Ba%5D=a%20b%2Fc"]);
    }

    #[test]
    fn test_cap_applies_across_compilation() {
        let values: Vec<String> = (0..50).map(|n| n.to_string()).collect();
        let refs: Vec<&str> = values.iter().map(String::as_str).collect();
        let params = expanded(&[("a", refs.as_slice()), ("b", refs.as_slice()), ("c", refs.as_slice())]);

        let compiler = UrlCompiler::new(7);
        let urls = compiler.compile(&params, vec!["?id=1".to_string()]);
        assert_eq!(urls.len(), 7);
        assert_eq!(urls[0], "?id=1&a=0&b=0&c=0");

        // Deterministic for identical input
        assert_eq!(urls, compiler.compile(&params, vec!["?id=1".to_string()]));
    }

    #[test]
    fn test_parameter_without_values_yields_nothing() {
        let urls = UrlCompiler::new(10).compile(
            &expanded(&[("a", &[])]),
            vec!["?id=1".to_string()],
        );
        assert!(urls.is_empty());
    }

    #[test]
    fn test_no_parameters_returns_seed() {
        let urls = UrlCompiler::new(10).compile(&ExpandedParameters::new(), vec!["?id=1".to_string()]);
        assert_eq!(urls, vec!["?id=1"]);
    }
}
