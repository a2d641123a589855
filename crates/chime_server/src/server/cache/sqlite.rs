#![forbid(unsafe_code)]

use std::path::Path;

use anyhow::Context as _;
use async_trait::async_trait;
use chime_protocol::{Attachment, EventKind, Message, SinceMarker, unix_now};
use sqlx::Row as _;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};

use crate::server::cache::MessageCache;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS messages (
	sequence INTEGER PRIMARY KEY AUTOINCREMENT,
	id TEXT NOT NULL,
	time INTEGER NOT NULL,
	topic TEXT NOT NULL,
	message TEXT NOT NULL,
	title TEXT NOT NULL,
	priority INTEGER NOT NULL,
	tags TEXT NOT NULL,
	click TEXT NOT NULL,
	actions TEXT NOT NULL,
	attachment_name TEXT NOT NULL,
	attachment_type TEXT NOT NULL,
	attachment_size INTEGER NOT NULL,
	attachment_expires INTEGER NOT NULL,
	attachment_url TEXT NOT NULL,
	attachment_owner TEXT NOT NULL,
	attachment_deleted INTEGER NOT NULL,
	encoding TEXT NOT NULL,
	published INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_messages_topic ON messages (topic);
CREATE INDEX IF NOT EXISTS idx_messages_id ON messages (id);
"#;

/// Durable, file-backed message cache.
pub struct SqliteCache {
	pool: SqlitePool,
}

impl SqliteCache {
	pub async fn open(path: &Path) -> anyhow::Result<Self> {
		let options = SqliteConnectOptions::new().filename(path).create_if_missing(true);
		let pool = SqlitePool::connect_with(options).await.context("connect sqlite cache")?;
		Self::init(pool).await
	}

	/// In-memory database; a single connection so all queries see one store.
	pub async fn memory() -> anyhow::Result<Self> {
		let pool = SqlitePoolOptions::new()
			.max_connections(1)
			.connect("sqlite::memory:")
			.await
			.context("connect in-memory sqlite cache")?;
		Self::init(pool).await
	}

	async fn init(pool: SqlitePool) -> anyhow::Result<Self> {
		sqlx::raw_sql(SCHEMA).execute(&pool).await.context("create cache schema")?;
		Ok(Self { pool })
	}
}

fn row_to_message(row: &SqliteRow) -> anyhow::Result<Message> {
	let tags: String = row.try_get("tags")?;
	let actions: String = row.try_get("actions")?;
	let attachment_name: String = row.try_get("attachment_name")?;
	let attachment = if attachment_name.is_empty() {
		None
	} else {
		Some(Attachment {
			name: attachment_name,
			content_type: row.try_get("attachment_type")?,
			size: row.try_get("attachment_size")?,
			expires: row.try_get("attachment_expires")?,
			url: row.try_get("attachment_url")?,
			owner: row.try_get("attachment_owner")?,
		})
	};
	Ok(Message {
		id: row.try_get("id")?,
		time: row.try_get("time")?,
		event: EventKind::Message,
		topic: row.try_get("topic")?,
		title: row.try_get("title")?,
		message: row.try_get("message")?,
		encoding: row.try_get("encoding")?,
		priority: row.try_get::<i64, _>("priority")? as u8,
		tags: if tags.is_empty() {
			Vec::new()
		} else {
			tags.split(',').map(|s| s.to_string()).collect()
		},
		click: row.try_get("click")?,
		actions: if actions.is_empty() {
			Vec::new()
		} else {
			serde_json::from_str(&actions).context("parse cached actions")?
		},
		attachment,
	})
}

#[async_trait]
impl MessageCache for SqliteCache {
	async fn add_message(&self, m: &Message) -> anyhow::Result<()> {
		let (att_name, att_type, att_size, att_expires, att_url, att_owner) = match &m.attachment {
			Some(a) => (
				a.name.clone(),
				a.content_type.clone(),
				a.size,
				a.expires,
				a.url.clone(),
				a.owner.clone(),
			),
			None => (String::new(), String::new(), 0, 0, String::new(), String::new()),
		};
		let actions = if m.actions.is_empty() {
			String::new()
		} else {
			serde_json::to_string(&m.actions).context("encode actions")?
		};
		let published = m.time <= unix_now();

		sqlx::query(
			"INSERT INTO messages (id, time, topic, message, title, priority, tags, click, actions, \
			attachment_name, attachment_type, attachment_size, attachment_expires, attachment_url, \
			attachment_owner, attachment_deleted, encoding, published) \
			VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?)",
		)
		.bind(&m.id)
		.bind(m.time)
		.bind(&m.topic)
		.bind(&m.message)
		.bind(&m.title)
		.bind(m.priority as i64)
		.bind(m.tags.join(","))
		.bind(&m.click)
		.bind(actions)
		.bind(att_name)
		.bind(att_type)
		.bind(att_size)
		.bind(att_expires)
		.bind(att_url)
		.bind(att_owner)
		.bind(&m.encoding)
		.bind(published)
		.execute(&self.pool)
		.await
		.context("insert message")?;
		Ok(())
	}

	async fn messages(&self, topic: &str, since: &SinceMarker, include_scheduled: bool) -> anyhow::Result<Vec<Message>> {
		if since.is_none() {
			return Ok(Vec::new());
		}
		let now = unix_now();
		let scheduled_clause = if include_scheduled { "" } else { " AND time <= ?" };
		let rows = match since {
			SinceMarker::Time(t) => {
				let sql = format!("SELECT * FROM messages WHERE topic = ? AND time >= ?{scheduled_clause} ORDER BY time ASC, sequence ASC");
				let mut q = sqlx::query(&sql).bind(topic).bind(t);
				if !include_scheduled {
					q = q.bind(now);
				}
				q.fetch_all(&self.pool).await.context("select messages since time")?
			}
			SinceMarker::Id(id) => {
				// An unknown id falls back to the full history.
				let sql = format!(
					"SELECT * FROM messages WHERE topic = ? AND sequence > \
					COALESCE((SELECT sequence FROM messages WHERE id = ? AND topic = ? LIMIT 1), 0)\
					{scheduled_clause} ORDER BY time ASC, sequence ASC"
				);
				let mut q = sqlx::query(&sql).bind(topic).bind(id).bind(topic);
				if !include_scheduled {
					q = q.bind(now);
				}
				q.fetch_all(&self.pool).await.context("select messages since id")?
			}
			_ => {
				let sql =
					format!("SELECT * FROM messages WHERE topic = ?{scheduled_clause} ORDER BY time ASC, sequence ASC");
				let mut q = sqlx::query(&sql).bind(topic);
				if !include_scheduled {
					q = q.bind(now);
				}
				q.fetch_all(&self.pool).await.context("select all messages")?
			}
		};
		rows.iter().map(row_to_message).collect()
	}

	async fn message_count(&self, topic: &str) -> anyhow::Result<usize> {
		let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE topic = ?")
			.bind(topic)
			.fetch_one(&self.pool)
			.await
			.context("count messages")?;
		Ok(count as usize)
	}

	async fn topics(&self) -> anyhow::Result<Vec<String>> {
		let topics: Vec<String> = sqlx::query_scalar("SELECT DISTINCT topic FROM messages")
			.fetch_all(&self.pool)
			.await
			.context("select topics")?;
		Ok(topics)
	}

	async fn messages_due(&self) -> anyhow::Result<Vec<Message>> {
		let rows = sqlx::query("SELECT * FROM messages WHERE published = 0 AND time <= ? ORDER BY time ASC, sequence ASC")
			.bind(unix_now())
			.fetch_all(&self.pool)
			.await
			.context("select due messages")?;
		rows.iter().map(row_to_message).collect()
	}

	async fn mark_published(&self, m: &Message) -> anyhow::Result<()> {
		sqlx::query("UPDATE messages SET published = 1 WHERE id = ?")
			.bind(&m.id)
			.execute(&self.pool)
			.await
			.context("mark message published")?;
		Ok(())
	}

	async fn prune(&self, older_than: i64) -> anyhow::Result<()> {
		sqlx::query("DELETE FROM messages WHERE time < ?")
			.bind(older_than)
			.execute(&self.pool)
			.await
			.context("prune messages")?;
		Ok(())
	}

	async fn attachments_expired(&self) -> anyhow::Result<Vec<String>> {
		let ids: Vec<String> = sqlx::query_scalar(
			"SELECT id FROM messages WHERE attachment_name != '' AND attachment_deleted = 0 \
			AND attachment_expires > 0 AND attachment_expires <= ?",
		)
		.bind(unix_now())
		.fetch_all(&self.pool)
		.await
		.context("select expired attachments")?;
		Ok(ids)
	}

	async fn mark_attachments_deleted(&self, ids: &[String]) -> anyhow::Result<()> {
		for id in ids {
			sqlx::query("UPDATE messages SET attachment_deleted = 1 WHERE id = ?")
				.bind(id)
				.execute(&self.pool)
				.await
				.context("mark attachment deleted")?;
		}
		Ok(())
	}

	async fn attachment_bytes_used(&self, owner: &str) -> anyhow::Result<i64> {
		let used: i64 = sqlx::query_scalar(
			"SELECT COALESCE(SUM(attachment_size), 0) FROM messages \
			WHERE attachment_owner = ? AND attachment_expires > ?",
		)
		.bind(owner)
		.bind(unix_now())
		.fetch_one(&self.pool)
		.await
		.context("sum attachment bytes")?;
		Ok(used)
	}
}
