#![forbid(unsafe_code)]

use std::collections::HashMap;

use hyper::HeaderMap;
use hyper::Uri;

/// Decoded query string, first value per key, keys lowercased.
pub(crate) fn query_params(uri: &Uri) -> HashMap<String, String> {
	let mut out = HashMap::new();
	let Some(query) = uri.query() else {
		return out;
	};
	for (k, v) in url::form_urlencoded::parse(query.as_bytes()) {
		out.entry(k.to_ascii_lowercase()).or_insert_with(|| v.into_owned());
	}
	out
}

/// Read a parameter by precedence: first matching header from the alias
/// list, then first matching query parameter. Alias lists start with the
/// `x-`-prefixed header name.
pub(crate) fn read_param(headers: &HeaderMap, query: &HashMap<String, String>, names: &[&str]) -> String {
	for name in names {
		if let Some(value) = headers.get(*name).and_then(|v| v.to_str().ok()) {
			let value = value.trim();
			if !value.is_empty() {
				return value.to_string();
			}
		}
	}
	for name in names {
		if let Some(value) = query.get(*name) {
			let value = value.trim();
			if !value.is_empty() {
				return value.to_string();
			}
		}
	}
	String::new()
}

pub(crate) fn read_bool_param(headers: &HeaderMap, query: &HashMap<String, String>, default: bool, names: &[&str]) -> bool {
	let value = read_param(headers, query, names).to_ascii_lowercase();
	match value.as_str() {
		"" => default,
		"1" | "yes" | "true" => true,
		_ => false,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn uri(s: &str) -> Uri {
		s.parse().expect("uri")
	}

	#[test]
	fn header_beats_query() {
		let mut headers = HeaderMap::new();
		headers.insert("x-title", "from header".parse().unwrap());
		let query = query_params(&uri("/t?title=from+query"));
		assert_eq!(read_param(&headers, &query, &["x-title", "title", "t"]), "from header");
	}

	#[test]
	fn query_aliases_in_order() {
		let headers = HeaderMap::new();
		let query = query_params(&uri("/t?po=1&priority=high"));
		assert_eq!(read_param(&headers, &query, &["x-priority", "priority", "prio", "p"]), "high");
		assert!(read_bool_param(&headers, &query, false, &["x-poll", "poll", "po"]));
	}

	#[test]
	fn bool_param_defaults() {
		let headers = HeaderMap::new();
		let query = query_params(&uri("/t?cache=no"));
		assert!(!read_bool_param(&headers, &query, true, &["x-cache", "cache"]));
		assert!(read_bool_param(&headers, &query, true, &["x-firebase", "firebase"]));
	}

	#[test]
	fn query_decoding() {
		let headers = HeaderMap::new();
		let query = query_params(&uri("/t/publish?message=hello%20world&tags=a,b"));
		assert_eq!(read_param(&headers, &query, &["x-message", "message", "m"]), "hello world");
		assert_eq!(read_param(&headers, &query, &["x-tags", "tags", "tag", "ta"]), "a,b");
	}
}
