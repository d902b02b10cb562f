//! Cache key derivation: a pure, deterministic function of request identity and the
//! vary-by rules selected for the matched resource.

use std::collections::BTreeMap;

use http::Method;

/// Record separator: joins the distinct sections of a vary-by key (header block, query
/// block, custom block) and joins distinct entries within a section.
const SECTION_SEP: char = '\u{1e}';
/// Unit separator: joins a dimension's name to its canonicalized value(s), and joins
/// multiple values of the same dimension.
const UNIT_SEP: char = '\u{1f}';

/// The vary-by rules active for a matched resource: which request headers, which query
/// parameters, and which caller-supplied custom dimensions segment its cache namespace.
///
/// Header and query-key order matters (it is the order the rule was declared in); value
/// order within a single header/key never affects the resulting key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VaryByRules {
    /// Extra string prepended to the base key, e.g. a route-group discriminator.
    pub prefix: String,
    /// Request header names (in declaration order) whose values segment the cache.
    pub headers: Vec<String>,
    /// Query parameter names (in declaration order) whose values segment the cache.
    pub query_keys: Vec<String>,
    /// Caller-supplied `(dimension, value)` pairs, e.g. a resolved tenant id.
    pub custom: BTreeMap<String, String>,
}

impl VaryByRules {
    /// True if no vary-by dimension is active; the base key alone identifies the entry.
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
            && self.query_keys.is_empty()
            && self.custom.is_empty()
    }
}

/// Minimal request identity the key provider needs: enough to compute both the base key
/// and the vary-by key without requiring a concrete HTTP framework type.
pub trait KeyableRequest {
    /// The request method.
    fn method(&self) -> &Method;
    /// The request scheme, e.g. `"https"`.
    fn scheme(&self) -> &str;
    /// The request host, e.g. `"example.com"`.
    fn host(&self) -> &str;
    /// The request path, e.g. `"/orders/42"`.
    fn path(&self) -> &str;
    /// All values of the named request header, in the order they appear on the wire.
    fn header_values(&self, name: &str) -> Vec<&str>;
    /// All values of the named query parameter, in the order they appear in the query
    /// string.
    fn query_values(&self, name: &str) -> Vec<&str>;
}

/// Computes deterministic cache keys from a request plus its vary-by rules.
pub trait KeyProvider: Send + Sync + 'static {
    /// The base key: request identity alone, ignoring vary-by rules.
    fn create_base_key<R: KeyableRequest + ?Sized>(
        &self,
        req: &R,
        use_case_sensitive_paths: bool,
    ) -> String;

    /// The full key: base key plus the canonicalized vary-by dimensions, or exactly the
    /// base key when `rules.is_empty()`.
    fn create_vary_by_key<R: KeyableRequest + ?Sized>(
        &self,
        req: &R,
        rules: &VaryByRules,
        use_case_sensitive_paths: bool,
    ) -> String;
}

/// The default key provider implementing §4.3's canonicalization rules.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultKeyProvider;

impl KeyProvider for DefaultKeyProvider {
    fn create_base_key<R: KeyableRequest + ?Sized>(
        &self,
        req: &R,
        use_case_sensitive_paths: bool,
    ) -> String {
        let path = normalize_path(req.path(), use_case_sensitive_paths);
        format!(
            "{}{SECTION_SEP}{}{SECTION_SEP}{}{}",
            req.method(),
            req.scheme(),
            req.host(),
            path
        )
    }

    fn create_vary_by_key<R: KeyableRequest + ?Sized>(
        &self,
        req: &R,
        rules: &VaryByRules,
        use_case_sensitive_paths: bool,
    ) -> String {
        let base = self.create_base_key(req, use_case_sensitive_paths);
        if rules.is_empty() {
            return base;
        }

        let headers_part = rules
            .headers
            .iter()
            .map(|name| {
                let values = req.header_values(name);
                format!(
                    "{}{UNIT_SEP}{}",
                    name.to_ascii_uppercase(),
                    canonicalize_values(&values)
                )
            })
            .collect::<Vec<_>>()
            .join(&SECTION_SEP.to_string());

        let query_part = rules
            .query_keys
            .iter()
            .map(|name| {
                let values = req.query_values(name);
                format!(
                    "{}{UNIT_SEP}{}",
                    name.to_ascii_uppercase(),
                    canonicalize_values(&values)
                )
            })
            .collect::<Vec<_>>()
            .join(&SECTION_SEP.to_string());

        let mut custom_entries: Vec<String> = rules
            .custom
            .iter()
            .map(|(k, v)| format!("{}{UNIT_SEP}{}", k.to_ascii_uppercase(), v))
            .collect();
        custom_entries.sort();
        let custom_part = custom_entries.join(&SECTION_SEP.to_string());

        format!(
            "{}{SECTION_SEP}{}{SECTION_SEP}{}{SECTION_SEP}{}{SECTION_SEP}{}",
            base, rules.prefix, headers_part, query_part, custom_part
        )
    }
}

/// Uppercases each value; sorts by byte order when more than one is present, so that
/// value order on the wire never affects the resulting key.
fn canonicalize_values(values: &[&str]) -> String {
    match values {
        [] => String::new(),
        [single] => single.to_ascii_uppercase(),
        many => {
            let mut upper: Vec<String> =
                many.iter().map(|v| v.to_ascii_uppercase()).collect();
            upper.sort();
            upper.join(&UNIT_SEP.to_string())
        }
    }
}

fn normalize_path(path: &str, use_case_sensitive_paths: bool) -> String {
    if use_case_sensitive_paths {
        path.to_string()
    } else {
        path.to_ascii_lowercase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubRequest {
        method: Method,
        scheme: &'static str,
        host: &'static str,
        path: &'static str,
        headers: Vec<(&'static str, Vec<&'static str>)>,
        query: Vec<(&'static str, Vec<&'static str>)>,
    }

    impl KeyableRequest for StubRequest {
        fn method(&self) -> &Method {
            &self.method
        }
        fn scheme(&self) -> &str {
            self.scheme
        }
        fn host(&self) -> &str {
            self.host
        }
        fn path(&self) -> &str {
            self.path
        }
        fn header_values(&self, name: &str) -> Vec<&str> {
            self.headers
                .iter()
                .find(|(n, _)| n.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.clone())
                .unwrap_or_default()
        }
        fn query_values(&self, name: &str) -> Vec<&str> {
            self.query
                .iter()
                .find(|(n, _)| *n == name)
                .map(|(_, v)| v.clone())
                .unwrap_or_default()
        }
    }

    fn base_request() -> StubRequest {
        StubRequest {
            method: Method::GET,
            scheme: "https",
            host: "example.com",
            path: "/widgets",
            headers: vec![("accept-language", vec!["en"])],
            query: vec![("page", vec!["1"])],
        }
    }

    #[test]
    fn base_key_ignores_unselected_headers() {
        let provider = DefaultKeyProvider;
        let req = base_request();
        let key = provider.create_base_key(&req, true);
        assert_eq!(key, "GET\u{1e}https\u{1e}example.com/widgets");
    }

    #[test]
    fn vary_by_key_equals_base_key_when_rules_empty() {
        let provider = DefaultKeyProvider;
        let req = base_request();
        let base = provider.create_base_key(&req, true);
        let key = provider.create_vary_by_key(&req, &VaryByRules::default(), true);
        assert_eq!(key, base);
    }

    #[test]
    fn vary_by_key_is_deterministic_under_value_permutation() {
        let provider = DefaultKeyProvider;
        let rules = VaryByRules {
            headers: vec!["accept-language".into()],
            ..Default::default()
        };

        let req_a = StubRequest {
            headers: vec![("accept-language", vec!["en", "fr"])],
            ..base_request()
        };
        let req_b = StubRequest {
            headers: vec![("accept-language", vec!["fr", "en"])],
            ..base_request()
        };

        assert_eq!(
            provider.create_vary_by_key(&req_a, &rules, true),
            provider.create_vary_by_key(&req_b, &rules, true)
        );
    }

    #[test]
    fn vary_by_key_differs_for_different_header_values() {
        let provider = DefaultKeyProvider;
        let rules = VaryByRules {
            headers: vec!["accept-language".into()],
            ..Default::default()
        };

        let req_en = base_request();
        let req_fr = StubRequest {
            headers: vec![("accept-language", vec!["fr"])],
            ..base_request()
        };

        assert_ne!(
            provider.create_vary_by_key(&req_en, &rules, true),
            provider.create_vary_by_key(&req_fr, &rules, true)
        );
    }

    #[test]
    fn case_insensitive_path_policy_lowercases() {
        let provider = DefaultKeyProvider;
        let req = StubRequest { path: "/Widgets", ..base_request() };
        let key = provider.create_base_key(&req, false);
        assert!(key.ends_with("/widgets"));
    }
}
