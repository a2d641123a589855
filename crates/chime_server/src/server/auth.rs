#![forbid(unsafe_code)]

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};

/// Access being requested on a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
	Read,
	Write,
}

/// An authenticated account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
	pub name: String,
}

/// Credential provider seam. Supplied by the embedder; `None` disables all
/// access checks. `authorize` is called with `None` for anonymous visitors.
#[async_trait]
pub trait Auther: Send + Sync {
	/// Verify a username/password pair.
	async fn authenticate(&self, username: &str, password: &str) -> anyhow::Result<User>;

	/// Check topic access; an error means denied.
	async fn authorize(&self, user: Option<&User>, topic: &str, permission: Permission) -> anyhow::Result<()>;
}

/// Read credentials from the `Authorization: Basic` header, falling back to
/// the `auth` query parameter. The query parameter exists because the
/// browser WebSocket API cannot set headers on the upgrade request; its
/// value is `base64url(Basic base64(user:pass))`.
pub fn extract_user_pass(authorization_header: Option<&str>, auth_query: Option<&str>) -> Option<(String, String)> {
	if let Some(header) = authorization_header
		&& let Some(creds) = decode_basic(header)
	{
		return Some(creds);
	}
	let query = auth_query?;
	let decoded = URL_SAFE_NO_PAD.decode(query.trim()).ok()?;
	let header = String::from_utf8(decoded).ok()?;
	decode_basic(&header)
}

fn decode_basic(header: &str) -> Option<(String, String)> {
	let rest = header.strip_prefix("Basic ").or_else(|| header.strip_prefix("basic "))?;
	let decoded = STANDARD.decode(rest.trim()).ok()?;
	let pair = String::from_utf8(decoded).ok()?;
	let (user, pass) = pair.split_once(':')?;
	Some((user.to_string(), pass.to_string()))
}
