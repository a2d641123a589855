#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use bytes::Bytes;
use chime_protocol::valid_message_id;
use hyper::body::Body;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::util::limit::{FixedLimiter, Limiter};
use crate::util::peek::{BoxError, PeekedBody};

/// Attachment blob store: one file per message id, size-capped per file and
/// in total.
pub struct FileCache {
	dir: PathBuf,
	total_size_limit: i64,
	file_size_limit: i64,
}

#[derive(Debug, Error)]
pub enum FileError {
	#[error("attachment size limit reached")]
	LimitReached,
	#[error("invalid attachment id")]
	InvalidId,
	#[error(transparent)]
	Io(#[from] std::io::Error),
}

impl FileCache {
	pub fn new(dir: impl Into<PathBuf>, total_size_limit: i64, file_size_limit: i64) -> anyhow::Result<Self> {
		let dir = dir.into();
		std::fs::create_dir_all(&dir).with_context(|| format!("create attachment dir {}", dir.display()))?;
		Ok(Self {
			dir,
			total_size_limit,
			file_size_limit,
		})
	}

	fn path(&self, id: &str) -> PathBuf {
		self.dir.join(id)
	}

	/// Stream a request body into the blob for `id`, enforcing the per-file
	/// cap, the store-wide cap, and every passed limiter per chunk. On any
	/// breach the partial file is removed.
	pub async fn write<B>(
		&self,
		id: &str,
		body: &mut PeekedBody<B>,
		limiters: &[Arc<dyn Limiter>],
	) -> Result<i64, FileError>
	where
		B: Body<Data = Bytes> + Unpin,
		B::Error: Into<BoxError>,
	{
		if !valid_message_id(id) {
			return Err(FileError::InvalidId);
		}
		let remaining_total = (self.total_size_limit - self.size().await?).max(0);
		let total_limiter = FixedLimiter::new(remaining_total as u64);

		let path = self.path(id);
		let mut file = fs::File::create(&path).await?;
		let mut written: i64 = 0;

		let mut first = Some(Bytes::copy_from_slice(body.peeked()));
		let result: Result<(), FileError> = async {
			loop {
				let chunk = match first.take() {
					Some(chunk) => chunk,
					None => match body.next_chunk().await.map_err(std::io::Error::other)? {
						Some(chunk) => chunk,
						None => return Ok(()),
					},
				};
				if chunk.is_empty() {
					continue;
				}
				written += chunk.len() as i64;
				if written > self.file_size_limit {
					return Err(FileError::LimitReached);
				}
				if total_limiter.allow(chunk.len() as u64).is_err() {
					return Err(FileError::LimitReached);
				}
				for limiter in limiters {
					if limiter.allow(chunk.len() as u64).is_err() {
						return Err(FileError::LimitReached);
					}
				}
				file.write_all(&chunk).await?;
			}
		}
		.await;

		match result {
			Ok(()) => {
				file.flush().await?;
				Ok(written)
			}
			Err(e) => {
				drop(file);
				let _ = fs::remove_file(&path).await;
				Err(e)
			}
		}
	}

	/// Open a blob for download, returning the file handle and its size.
	pub async fn open_read(&self, id: &str) -> Result<(fs::File, u64), FileError> {
		if !valid_message_id(id) {
			return Err(FileError::InvalidId);
		}
		let path = self.path(id);
		let meta = fs::metadata(&path).await?;
		let file = fs::File::open(&path).await?;
		Ok((file, meta.len()))
	}

	/// Remove blobs; missing files are ignored.
	pub async fn remove(&self, ids: &[String]) -> anyhow::Result<()> {
		for id in ids {
			if !valid_message_id(id) {
				continue;
			}
			match fs::remove_file(self.path(id)).await {
				Ok(()) => {}
				Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
				Err(e) => return Err(anyhow::Error::new(e).context(format!("remove attachment {id}"))),
			}
		}
		Ok(())
	}

	/// Total bytes currently stored.
	pub async fn size(&self) -> Result<i64, std::io::Error> {
		let mut total: i64 = 0;
		let mut entries = fs::read_dir(&self.dir).await?;
		while let Some(entry) = entries.next_entry().await? {
			let meta = entry.metadata().await?;
			if meta.is_file() {
				total += meta.len() as i64;
			}
		}
		Ok(total)
	}
}
