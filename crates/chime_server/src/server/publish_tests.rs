#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use chime_protocol::unix_now;
use hyper::{Method, StatusCode};

use crate::config::ServerConfig;
use crate::server::cache::MemCache;
use crate::server::file_cache::FileCache;
use crate::server::server::Server;
use crate::server::testutil::{body_bytes, body_json, request, test_config, test_ip, test_server};

async fn server_with_attachments(config: ServerConfig, dir: &std::path::Path) -> Arc<Server> {
	let file_cache = FileCache::new(dir, config.attachment_total_size_limit, config.attachment_file_size_limit)
		.expect("file cache");
	Server::new(config, Arc::new(MemCache::new()), Some(Arc::new(file_cache)), None, None, None)
		.await
		.expect("server")
}

#[tokio::test]
async fn post_body_becomes_the_message() {
	let server = test_server().await;
	let resp = server.handle(request(Method::POST, "/mytopic", "hello"), test_ip()).await;
	assert_eq!(resp.status(), StatusCode::OK);
	assert_eq!(resp.headers().get("access-control-allow-origin").unwrap(), "*");

	let m = body_json(resp).await;
	assert_eq!(m["topic"], "mytopic");
	assert_eq!(m["message"], "hello");
	assert_eq!(m["event"], "message");
	assert_eq!(m["id"].as_str().unwrap().len(), 10);
	let now = unix_now();
	let time = m["time"].as_i64().unwrap();
	assert!((now - time).abs() <= 2, "time {time} should be about now {now}");
}

#[tokio::test]
async fn empty_body_defaults_to_triggered() {
	let server = test_server().await;
	let m = body_json(server.handle(request(Method::POST, "/mytopic", ""), test_ip()).await).await;
	assert_eq!(m["message"], "triggered");
}

#[tokio::test]
async fn get_publish_reads_query_parameters() {
	let server = test_server().await;
	let resp = server
		.handle(
			request(
				Method::GET,
				"/mytopic/send?message=hi%20there&title=Greeting&priority=high&tags=work,alert&click=https://example.com",
				"",
			),
			test_ip(),
		)
		.await;
	assert_eq!(resp.status(), StatusCode::OK);
	let m = body_json(resp).await;
	assert_eq!(m["message"], "hi there");
	assert_eq!(m["title"], "Greeting");
	assert_eq!(m["priority"], 4);
	assert_eq!(m["tags"], serde_json::json!(["work", "alert"]));
	assert_eq!(m["click"], "https://example.com");
}

#[tokio::test]
async fn header_parameters_win_over_query() {
	let server = test_server().await;
	let req = hyper::Request::builder()
		.method(Method::POST)
		.uri("/mytopic?title=from%20query")
		.header("X-Title", "from header")
		.body(http_body_util::Full::new(bytes::Bytes::from_static(b"body")))
		.expect("request");
	let m = body_json(server.handle(req, test_ip()).await).await;
	assert_eq!(m["title"], "from header");
}

#[tokio::test]
async fn invalid_priority_is_rejected() {
	let server = test_server().await;
	let resp = server.handle(request(Method::POST, "/mytopic?priority=99", "x"), test_ip()).await;
	assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
	let err = body_json(resp).await;
	assert_eq!(err["code"], 40001);
	assert_eq!(err["http"], 400);
}

#[tokio::test]
async fn reserved_topics_never_become_topics() {
	let server = test_server().await;
	for topic in ["docs", "static", "file", "app", "settings"] {
		let resp = server.handle(request(Method::PUT, &format!("/{topic}"), "x"), test_ip()).await;
		assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "{topic}");
		let err = body_json(resp).await;
		assert_eq!(err["code"], 40004, "{topic}");
	}
	let state = server.state.lock().expect("lock");
	assert!(state.topics.is_empty());
}

#[tokio::test]
async fn json_publish_on_root_is_rewritten() {
	let server = test_server().await;
	let body = r#"{"topic":"mytopic","message":"json hello","title":"From JSON","priority":4,"tags":["a","b"]}"#;
	let resp = server.handle(request(Method::PUT, "/", body), test_ip()).await;
	assert_eq!(resp.status(), StatusCode::OK);
	let m = body_json(resp).await;
	assert_eq!(m["topic"], "mytopic");
	assert_eq!(m["message"], "json hello");
	assert_eq!(m["title"], "From JSON");
	assert_eq!(m["priority"], 4);
	assert_eq!(m["tags"], serde_json::json!(["a", "b"]));
}

#[tokio::test]
async fn json_publish_requires_valid_json_and_topic() {
	let server = test_server().await;
	let resp = server.handle(request(Method::POST, "/", "this is not json"), test_ip()).await;
	assert_eq!(body_json(resp).await["code"], 40010);

	let resp = server
		.handle(request(Method::POST, "/", r#"{"topic":"not/valid","message":"x"}"#), test_ip())
		.await;
	assert_eq!(body_json(resp).await["code"], 40003);
}

#[tokio::test]
async fn unifiedpush_binary_body_is_base64_encoded() {
	let server = test_server().await;
	let resp = server
		.handle(request(Method::POST, "/mytopic?up=1", &b"\xff\xfe\x00"[..]), test_ip())
		.await;
	let m = body_json(resp).await;
	assert_eq!(m["message"], "//4A");
	assert_eq!(m["encoding"], "base64");
}

#[tokio::test]
async fn unifiedpush_text_body_stays_plain() {
	let server = test_server().await;
	let m = body_json(server.handle(request(Method::POST, "/mytopic?up=1", "  spaced  "), test_ip()).await).await;
	// UnifiedPush bodies are opaque; no trimming.
	assert_eq!(m["message"], "  spaced  ");
	assert!(m.get("encoding").is_none());
}

#[tokio::test]
async fn delayed_publish_sets_future_time() {
	let server = test_server().await;
	let resp = server.handle(request(Method::POST, "/mytopic?delay=30s", "later"), test_ip()).await;
	assert_eq!(resp.status(), StatusCode::OK);
	let m = body_json(resp).await;
	let time = m["time"].as_i64().unwrap();
	let now = unix_now();
	assert!((now + 28..=now + 32).contains(&time), "time {time} should be about now+30");
}

#[tokio::test]
async fn delay_validation() {
	let server = test_server().await;
	let cases = [
		("/mytopic?delay=1s", 40006),
		("/mytopic?delay=30d", 40007),
		("/mytopic?delay=30s&cache=no", 40008),
		("/mytopic?delay=30s&email=test@example.com", 40016), // email disabled before delay check
		("/mytopic?delay=soon", 40005),
	];
	for (path, code) in cases {
		let resp = server.handle(request(Method::POST, path, "x"), test_ip()).await;
		assert_eq!(body_json(resp).await["code"], code, "{path}");
	}
}

#[tokio::test]
async fn oversized_body_without_file_cache_is_rejected() {
	let server = test_server().await;
	let payload = vec![0u8; 10_000];
	let resp = server.handle(request(Method::PUT, "/mytopic", payload), test_ip()).await;
	assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
	assert_eq!(body_json(resp).await["code"], 40013);
}

#[tokio::test]
async fn oversized_body_becomes_an_attachment() {
	let dir = tempfile::tempdir().expect("tempdir");
	let config = ServerConfig {
		base_url: Some("https://chime.example.com".to_string()),
		attachment_cache_dir: Some(dir.path().to_path_buf()),
		..test_config()
	};
	let server = server_with_attachments(config, dir.path()).await;

	let payload: Vec<u8> = (0..10_240u32).map(|i| (i % 256) as u8).collect();
	let resp = server.handle(request(Method::PUT, "/mytopic", payload.clone()), test_ip()).await;
	assert_eq!(resp.status(), StatusCode::OK);
	let m = body_json(resp).await;
	let id = m["id"].as_str().unwrap().to_string();
	let attachment = m["attachment"].as_object().expect("attachment");
	assert_eq!(attachment["size"], 10_240);
	assert!(
		attachment["url"]
			.as_str()
			.unwrap()
			.starts_with(&format!("https://chime.example.com/file/{id}")),
		"unexpected url: {}",
		attachment["url"]
	);
	assert!(!attachment.contains_key("owner"));
	assert_eq!(m["message"], format!("You received a file: {}", attachment["name"].as_str().unwrap()));

	// Download the blob through the file endpoint.
	let resp = server.handle(request(Method::GET, &format!("/file/{id}"), ""), test_ip()).await;
	assert_eq!(resp.status(), StatusCode::OK);
	assert_eq!(resp.headers().get("content-length").unwrap(), "10240");
	let body = body_bytes(resp).await;
	assert_eq!(body, payload);
}

#[tokio::test]
async fn named_short_body_is_still_an_attachment() {
	let dir = tempfile::tempdir().expect("tempdir");
	let config = ServerConfig {
		base_url: Some("https://chime.example.com".to_string()),
		attachment_cache_dir: Some(dir.path().to_path_buf()),
		..test_config()
	};
	let server = server_with_attachments(config, dir.path()).await;

	let resp = server
		.handle(request(Method::PUT, "/mytopic?filename=note.txt", "short text"), test_ip())
		.await;
	let m = body_json(resp).await;
	let attachment = m["attachment"].as_object().expect("attachment");
	assert_eq!(attachment["name"], "note.txt");
	assert_eq!(attachment["size"], 10);
	assert_eq!(attachment["type"], "text/plain; charset=utf-8");
}

#[tokio::test]
async fn external_attach_url_keeps_body_as_text() {
	let server = test_server().await;
	let resp = server
		.handle(
			request(Method::PUT, "/mytopic?attach=https://example.com/pic.jpg", "look at this"),
			test_ip(),
		)
		.await;
	let m = body_json(resp).await;
	assert_eq!(m["message"], "look at this");
	let attachment = m["attachment"].as_object().expect("attachment");
	assert_eq!(attachment["url"], "https://example.com/pic.jpg");
	assert_eq!(attachment["name"], "pic.jpg");

	let resp = server
		.handle(request(Method::PUT, "/mytopic?attach=ftp://example.com/pic.jpg", "x"), test_ip())
		.await;
	assert_eq!(body_json(resp).await["code"], 40015);
}

#[tokio::test]
async fn attachment_over_file_size_limit_is_rejected() {
	let dir = tempfile::tempdir().expect("tempdir");
	let config = ServerConfig {
		base_url: Some("https://chime.example.com".to_string()),
		attachment_cache_dir: Some(dir.path().to_path_buf()),
		attachment_file_size_limit: 1_000,
		..test_config()
	};
	let server = server_with_attachments(config, dir.path()).await;

	let payload = vec![0u8; 50_000];
	let resp = server.handle(request(Method::PUT, "/mytopic", payload), test_ip()).await;
	assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
	assert_eq!(body_json(resp).await["code"], 41301);
}

#[tokio::test]
async fn attachment_quota_counts_prior_uploads() {
	let dir = tempfile::tempdir().expect("tempdir");
	let config = ServerConfig {
		base_url: Some("https://chime.example.com".to_string()),
		attachment_cache_dir: Some(dir.path().to_path_buf()),
		visitor_attachment_total_size_limit: 12_000,
		..test_config()
	};
	let server = server_with_attachments(config, dir.path()).await;

	let payload = vec![0u8; 10_000];
	let resp = server.handle(request(Method::PUT, "/mytopic", payload.clone()), test_ip()).await;
	assert_eq!(resp.status(), StatusCode::OK);

	// Quota exhausted by the first upload.
	let resp = server.handle(request(Method::PUT, "/mytopic", payload), test_ip()).await;
	assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn rate_limited_publish_consumes_no_budget() {
	let server = crate::server::testutil::test_server_with(ServerConfig {
		visitor_request_limit_burst: 1,
		visitor_request_limit_replenish: Duration::from_secs(3600),
		..test_config()
	})
	.await;

	let resp = server.handle(request(Method::POST, "/mytopic", "one"), test_ip()).await;
	assert_eq!(resp.status(), StatusCode::OK);

	let resp = server.handle(request(Method::POST, "/mytopic", "two"), test_ip()).await;
	assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
	assert_eq!(body_json(resp).await["code"], 42901);

	// The refused publish must not have been fanned out or cached.
	use chime_protocol::SinceMarker;
	let cached = server
		.cache
		.messages("mytopic", &SinceMarker::All, true)
		.await
		.expect("messages");
	assert_eq!(cached.len(), 1);
	assert_eq!(cached[0].message, "one");
}
