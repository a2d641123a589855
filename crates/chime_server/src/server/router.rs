#![forbid(unsafe_code)]

use std::net::IpAddr;
use std::sync::Arc;
use std::sync::LazyLock;

use bytes::Bytes;
use futures_util::TryStreamExt as _;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Body, Frame};
use hyper::{Method, Request, Response, StatusCode};
use regex::Regex;
use tokio_util::io::ReaderStream;
use tracing::warn;

use crate::config::WebRoot;
use crate::server::auth::{Permission, extract_user_pass};
use crate::server::errors::HttpError;
use crate::server::params::{query_params, read_bool_param};
use crate::server::server::{DISALLOWED_TOPICS, Server};
use crate::server::visitor::Visitor;
use crate::util::peek::BoxError;

pub(crate) type ResponseBody = BoxBody<Bytes, BoxError>;

static TOPIC_PATH: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^/[-_A-Za-z0-9]{1,64}$").expect("topic regex"));
static JSON_PATH: LazyLock<Regex> =
	LazyLock::new(|| Regex::new(r"^/[-_A-Za-z0-9]{1,64}(,[-_A-Za-z0-9]{1,64})*/json$").expect("json regex"));
static SSE_PATH: LazyLock<Regex> =
	LazyLock::new(|| Regex::new(r"^/[-_A-Za-z0-9]{1,64}(,[-_A-Za-z0-9]{1,64})*/sse$").expect("sse regex"));
static RAW_PATH: LazyLock<Regex> =
	LazyLock::new(|| Regex::new(r"^/[-_A-Za-z0-9]{1,64}(,[-_A-Za-z0-9]{1,64})*/raw$").expect("raw regex"));
static WS_PATH: LazyLock<Regex> =
	LazyLock::new(|| Regex::new(r"^/[-_A-Za-z0-9]{1,64}(,[-_A-Za-z0-9]{1,64})*/ws$").expect("ws regex"));
static AUTH_PATH: LazyLock<Regex> =
	LazyLock::new(|| Regex::new(r"^/[-_A-Za-z0-9]{1,64}(,[-_A-Za-z0-9]{1,64})*/auth$").expect("auth regex"));
static PUBLISH_PATH: LazyLock<Regex> =
	LazyLock::new(|| Regex::new(r"^/[-_A-Za-z0-9]{1,64}/(publish|send|trigger)$").expect("publish regex"));
static FILE_PATH: LazyLock<Regex> =
	LazyLock::new(|| Regex::new(r"^/file/([-_A-Za-z0-9]{1,64})(?:\.[A-Za-z0-9]{1,16})?$").expect("file regex"));

const EXAMPLE_HTML: &str = r#"<!DOCTYPE html>
<html>
<head><title>chime example</title></head>
<body>
<p>Publish a message:</p>
<pre>curl -d "backup finished" chime.example.com/mytopic</pre>
<p>Subscribe:</p>
<pre>curl -s chime.example.com/mytopic/json</pre>
</body>
</html>
"#;

pub(crate) fn full_body(data: impl Into<Bytes>) -> ResponseBody {
	Full::new(data.into()).map_err(|e| match e {}).boxed()
}

pub(crate) fn empty_body() -> ResponseBody {
	Full::new(Bytes::new()).map_err(|e| match e {}).boxed()
}

pub(crate) fn json_response(status: StatusCode, body: String) -> Response<ResponseBody> {
	Response::builder()
		.status(status)
		.header("Content-Type", "application/json")
		.body(full_body(body))
		.expect("response")
}

fn text_response(content_type: &str, body: impl Into<Bytes>) -> Response<ResponseBody> {
	Response::builder()
		.status(StatusCode::OK)
		.header("Content-Type", content_type)
		.body(full_body(body.into()))
		.expect("response")
}

impl Server {
	/// Entry point for every request: resolve the visitor, dispatch, map
	/// errors to the JSON error shape, stamp CORS headers.
	pub async fn handle<B>(&self, req: Request<B>, peer_ip: IpAddr) -> Response<ResponseBody>
	where
		B: Body<Data = Bytes> + Send + Unpin,
		B::Error: Into<BoxError> + Send,
	{
		let method = req.method().clone();
		let path = req.uri().path().to_string();
		let forwarded = req
			.headers()
			.get("x-forwarded-for")
			.and_then(|v| v.to_str().ok())
			.map(|s| s.to_string());
		let v = self.visitor(peer_ip, forwarded.as_deref());

		let mut resp = match self.handle_internal(req, &v).await {
			Ok(resp) => resp,
			Err(e) => {
				warn!(ip = %v.ip(), method = %method, path = %path, http = e.http, code = e.code, error = %e, "request failed");
				let status = StatusCode::from_u16(e.http).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
				json_response(status, e.json() + "\n")
			}
		};
		resp.headers_mut()
			.entry("Access-Control-Allow-Origin")
			.or_insert_with(|| "*".parse().expect("cors header"));
		resp
	}

	async fn handle_internal<B>(&self, req: Request<B>, v: &Arc<Visitor>) -> Result<Response<ResponseBody>, HttpError>
	where
		B: Body<Data = Bytes> + Send + Unpin,
		B::Error: Into<BoxError> + Send,
	{
		let method = req.method().clone();
		let path = req.uri().path().to_string();

		if method == Method::GET && path == "/" {
			return self.handle_home();
		}
		if method == Method::HEAD && path == "/" {
			return Ok(Response::builder().status(StatusCode::OK).body(empty_body()).expect("response"));
		}
		if method == Method::GET && path == "/example.html" {
			return Ok(text_response("text/html", EXAMPLE_HTML));
		}
		if method == Method::GET && path == "/config.js" {
			return self.handle_web_config();
		}
		if method == Method::GET && path == "/user/stats" {
			return self.handle_user_stats(v).await;
		}
		if method == Method::GET && FILE_PATH.is_match(&path) && self.file_cache.is_some() {
			self.limit_requests(v)?;
			return self.handle_file(&path, v).await;
		}
		if method == Method::OPTIONS {
			return handle_options();
		}
		if (method == Method::PUT || method == Method::POST) && path == "/" {
			self.limit_requests(v)?;
			let req = self.transform_body_json(req, v).await?;
			self.check_auth(&req, Permission::Write).await?;
			return self.handle_publish(req, v).await;
		}
		if (method == Method::PUT || method == Method::POST) && TOPIC_PATH.is_match(&path) {
			self.limit_requests(v)?;
			self.check_auth(&req, Permission::Write).await?;
			return self.handle_publish(req, v).await;
		}
		if method == Method::GET && PUBLISH_PATH.is_match(&path) {
			self.limit_requests(v)?;
			self.check_auth(&req, Permission::Write).await?;
			return self.handle_publish(req, v).await;
		}
		if method == Method::GET && JSON_PATH.is_match(&path) {
			self.limit_requests(v)?;
			self.check_auth(&req, Permission::Read).await?;
			return self.handle_subscribe_http(req, v, crate::server::subscribe::StreamFormat::Json).await;
		}
		if method == Method::GET && SSE_PATH.is_match(&path) {
			self.limit_requests(v)?;
			self.check_auth(&req, Permission::Read).await?;
			return self.handle_subscribe_http(req, v, crate::server::subscribe::StreamFormat::Sse).await;
		}
		if method == Method::GET && RAW_PATH.is_match(&path) {
			self.limit_requests(v)?;
			self.check_auth(&req, Permission::Read).await?;
			return self.handle_subscribe_http(req, v, crate::server::subscribe::StreamFormat::Raw).await;
		}
		if method == Method::GET && WS_PATH.is_match(&path) {
			self.limit_requests(v)?;
			self.check_auth(&req, Permission::Read).await?;
			return self.handle_subscribe_ws(req, v).await;
		}
		if method == Method::GET && AUTH_PATH.is_match(&path) {
			self.limit_requests(v)?;
			self.check_auth(&req, Permission::Read).await?;
			return Ok(json_response(StatusCode::OK, "{\"success\":true}\n".to_string()));
		}
		if method == Method::GET && TOPIC_PATH.is_match(&path) {
			return self.handle_topic(&req);
		}
		Err(HttpError::not_found())
	}

	fn handle_home(&self) -> Result<Response<ResponseBody>, HttpError> {
		match self.config.web_root {
			WebRoot::Disabled => Err(HttpError::not_found()),
			WebRoot::Home | WebRoot::App => Ok(text_response(
				"text/html",
				"<!DOCTYPE html><html><body><h1>chime</h1><p>HTTP pub/sub notification service.</p></body></html>\n",
			)),
		}
	}

	/// `GET /<topic>`: unifiedpush discovery with `?up=1`, otherwise the
	/// topic's web page (when web serving is enabled).
	fn handle_topic<B>(&self, req: &Request<B>) -> Result<Response<ResponseBody>, HttpError> {
		let query = query_params(req.uri());
		let unifiedpush = read_bool_param(req.headers(), &query, false, &["x-unifiedpush", "unifiedpush", "up"]);
		if unifiedpush {
			return Ok(json_response(StatusCode::OK, "{\"unifiedpush\":{\"version\":1}}\n".to_string()));
		}
		self.handle_home()
	}

	fn handle_web_config(&self) -> Result<Response<ResponseBody>, HttpError> {
		let app_root = match self.config.web_root {
			WebRoot::App => "/",
			_ => "/app",
		};
		let disallowed = DISALLOWED_TOPICS
			.iter()
			.map(|t| format!("\"{t}\""))
			.collect::<Vec<_>>()
			.join(", ");
		let body = format!(
			"// Generated server configuration\nvar config = {{\n  appRoot: \"{app_root}\",\n  disallowedTopics: [{disallowed}]\n}};"
		);
		Ok(text_response("text/javascript", body))
	}

	async fn handle_user_stats(&self, v: &Arc<Visitor>) -> Result<Response<ResponseBody>, HttpError> {
		let stats = v.stats().await.map_err(|e| {
			warn!(ip = %v.ip(), error = %e, "visitor stats failed");
			HttpError::internal()
		})?;
		let body = serde_json::to_string(&stats).map_err(|_| HttpError::internal())?;
		Ok(json_response(StatusCode::OK, body + "\n"))
	}

	/// `GET /file/<msgid>[.ext]`: bandwidth-limited attachment download.
	async fn handle_file(&self, path: &str, v: &Arc<Visitor>) -> Result<Response<ResponseBody>, HttpError> {
		let file_cache = self.file_cache.as_ref().ok_or_else(HttpError::internal)?;
		let id = FILE_PATH
			.captures(path)
			.and_then(|c| c.get(1))
			.map(|m| m.as_str().to_string())
			.ok_or_else(HttpError::not_found)?;
		let (file, size) = file_cache.open_read(&id).await.map_err(|_| HttpError::not_found())?;
		if v.bandwidth_limiter().allow(size).is_err() {
			return Err(HttpError::too_many_requests_limit_bandwidth());
		}
		// The blob is streamed without buffering, so only the URL's
		// extension is available for the content type.
		let content_type = crate::util::content_type::from_extension(path).unwrap_or("application/octet-stream");
		let stream = ReaderStream::new(file)
			.map_ok(Frame::data)
			.map_err(|e| BoxError::from(e));
		let body = BodyExt::boxed(StreamBody::new(stream));
		Ok(Response::builder()
			.status(StatusCode::OK)
			.header("Content-Type", content_type)
			.header("Content-Length", size.to_string())
			.body(body)
			.expect("response"))
	}

	fn limit_requests(&self, v: &Arc<Visitor>) -> Result<(), HttpError> {
		if self.request_exempt(v) {
			return Ok(());
		}
		v.request_allowed().map_err(|_| HttpError::too_many_requests_limit_requests())
	}

	/// Per-topic access check; a no-op without an injected auth provider.
	async fn check_auth<B>(&self, req: &Request<B>, permission: Permission) -> Result<(), HttpError> {
		let Some(auther) = self.auther.as_ref() else {
			return Ok(());
		};
		let (_, topics_str) = self.topics_from_path(req.uri().path())?;

		let query = query_params(req.uri());
		let header = req.headers().get("authorization").and_then(|h| h.to_str().ok());
		let auth_query = query.get("authorization").or_else(|| query.get("auth")).map(|s| s.as_str());

		let user = match extract_user_pass(header, auth_query) {
			Some((username, password)) => Some(auther.authenticate(&username, &password).await.map_err(|e| {
				warn!(error = %e, "authentication failed");
				HttpError::unauthorized()
			})?),
			None => None,
		};

		for topic in topics_str.split(',') {
			// Denied access is 403 no matter who asked; 401 is reserved for
			// bad credentials.
			if auther.authorize(user.as_ref(), topic, permission).await.is_err() {
				return Err(HttpError::forbidden());
			}
		}
		Ok(())
	}
}

fn handle_options() -> Result<Response<ResponseBody>, HttpError> {
	Ok(Response::builder()
		.status(StatusCode::OK)
		.header("Access-Control-Allow-Methods", "GET, PUT, POST")
		.header("Access-Control-Allow-Headers", "*")
		.body(empty_body())
		.expect("response"))
}
