#![forbid(unsafe_code)]

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Frame;
use hyper::{Method, Request, Response};
use tokio::time::timeout;

use crate::config::ServerConfig;
use crate::server::cache::MemCache;
use crate::server::router::ResponseBody;
use crate::server::server::Server;

pub(crate) fn test_ip() -> IpAddr {
	IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

pub(crate) fn test_config() -> ServerConfig {
	ServerConfig {
		keepalive_interval: Duration::from_secs(30),
		..ServerConfig::default()
	}
}

pub(crate) async fn test_server() -> Arc<Server> {
	test_server_with(test_config()).await
}

pub(crate) async fn test_server_with(config: ServerConfig) -> Arc<Server> {
	Server::new(config, Arc::new(MemCache::new()), None, None, None, None)
		.await
		.expect("server")
}

pub(crate) fn request(method: Method, path_and_query: &str, body: impl Into<Bytes>) -> Request<Full<Bytes>> {
	Request::builder()
		.method(method)
		.uri(path_and_query)
		.body(Full::new(body.into()))
		.expect("request")
}

/// Collect a full (non-streaming) response body as a string.
pub(crate) async fn body_string(resp: Response<ResponseBody>) -> String {
	let collected = resp.into_body().collect().await.expect("collect body");
	String::from_utf8(collected.to_bytes().to_vec()).expect("utf-8 body")
}

/// Collect a full response body as raw bytes.
pub(crate) async fn body_bytes(resp: Response<ResponseBody>) -> Vec<u8> {
	let collected = resp.into_body().collect().await.expect("collect body");
	collected.to_bytes().to_vec()
}

/// Parse a full response body as JSON.
pub(crate) async fn body_json(resp: Response<ResponseBody>) -> serde_json::Value {
	serde_json::from_str(&body_string(resp).await).expect("json body")
}

/// Read the next data frame from a streaming response body as a string;
/// `None` when the stream has ended.
pub(crate) async fn next_frame(body: &mut ResponseBody, wait: Duration) -> Option<String> {
	loop {
		let frame = timeout(wait, body.frame()).await.expect("frame within timeout")?;
		let frame: Frame<Bytes> = frame.expect("frame ok");
		if let Ok(data) = frame.into_data() {
			return Some(String::from_utf8(data.to_vec()).expect("utf-8 frame"));
		}
	}
}

/// Assert that no frame arrives within `wait`.
pub(crate) async fn expect_no_frame(body: &mut ResponseBody, wait: Duration) {
	let got = timeout(wait, body.frame()).await;
	assert!(got.is_err(), "expected no frame within {wait:?}");
}
