//! Logical endpoint table and target URL resolution

use std::collections::BTreeMap;

use crate::error::{GatewayError, Result};

/// Immutable mapping from logical endpoint name to upstream base URL
#[derive(Debug, Clone)]
pub struct EndpointTable {
    endpoints: BTreeMap<String, String>,
}

impl EndpointTable {
    pub fn new<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let endpoints = entries
            .into_iter()
            .map(|(name, base)| {
                let base: String = base.into();
                (name.into(), base.trim_end_matches('/').to_string())
            })
            .collect();

        Self { endpoints }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.endpoints.get(name).map(String::as_str)
    }

    /// Endpoint names in sorted order
    pub fn names(&self) -> Vec<String> {
        self.endpoints.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.endpoints
            .iter()
            .map(|(name, base)| (name.as_str(), base.as_str()))
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Resolve `/<endpoint>/<rest>` into `base + "/" + rest`, keeping the query.
    ///
    /// The remainder is appended as received, so percent-escapes are not
    /// encoded a second time.
    pub fn resolve(&self, path: &str, query: Option<&str>) -> Result<String> {
        let trimmed = path.strip_prefix('/').unwrap_or(path);
        let (key, rest) = match trimmed.split_once('/') {
            Some((key, rest)) => (key, rest),
            None => (trimmed, ""),
        };

        let base = self
            .get(key)
            .ok_or_else(|| GatewayError::InvalidEndpoint(key.to_string()))?;

        let mut target = String::with_capacity(base.len() + rest.len() + 2);
        target.push_str(base);
        target.push('/');
        target.push_str(rest);

        if let Some(query) = query {
            target.push('?');
            target.push_str(query);
        }

        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jito_table() -> EndpointTable {
        EndpointTable::new([
            ("jitoNY", "https://ny.mainnet.block-engine.jito.wtf"),
            ("local", "http://127.0.0.1:9000/"),
        ])
    }

    #[test]
    fn test_resolve_with_path_and_query() {
        let table = jito_table();
        let target = table.resolve("/jitoNY/api/v1/bundles", Some("x=1")).unwrap();
        assert_eq!(
            target,
            "https://ny.mainnet.block-engine.jito.wtf/api/v1/bundles?x=1"
        );
    }

    #[test]
    fn test_resolve_empty_remainder_defaults_to_root() {
        let table = jito_table();
        assert_eq!(
            table.resolve("/jitoNY", None).unwrap(),
            "https://ny.mainnet.block-engine.jito.wtf/"
        );
        assert_eq!(
            table.resolve("/jitoNY/", None).unwrap(),
            "https://ny.mainnet.block-engine.jito.wtf/"
        );
        assert_eq!(
            table.resolve("/jitoNY", Some("a=b")).unwrap(),
            "https://ny.mainnet.block-engine.jito.wtf/?a=b"
        );
    }

    #[test]
    fn test_resolve_trims_base_trailing_slash() {
        let table = jito_table();
        assert_eq!(
            table.resolve("/local/status", None).unwrap(),
            "http://127.0.0.1:9000/status"
        );
    }

    #[test]
    fn test_resolve_keeps_escapes_and_query_verbatim() {
        let table = jito_table();
        let target = table
            .resolve("/local/a%20b/c%2Fd", Some("q=%7Bx%7D&y=1+2"))
            .unwrap();
        assert_eq!(target, "http://127.0.0.1:9000/a%20b/c%2Fd?q=%7Bx%7D&y=1+2");
    }

    #[test]
    fn test_resolve_unknown_endpoint() {
        let table = jito_table();
        let err = table.resolve("/jitoMARS/api", None).unwrap_err();
        assert!(matches!(err, GatewayError::InvalidEndpoint(ref key) if key == "jitoMARS"));

        let err = table.resolve("/", None).unwrap_err();
        assert!(matches!(err, GatewayError::InvalidEndpoint(ref key) if key.is_empty()));
    }

    #[test]
    fn test_resolve_is_case_sensitive() {
        let table = jito_table();
        assert!(table.resolve("/jitony/api", None).is_err());
    }

    #[test]
    fn test_names_sorted() {
        let table = jito_table();
        assert_eq!(table.names(), vec!["jitoNY".to_string(), "local".to_string()]);
        assert_eq!(table.len(), 2);
    }
}
