#![forbid(unsafe_code)]

use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::Body;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A request body with its first `limit` bytes read ahead. The peeked prefix
/// is used to classify the body (message vs. attachment); the remainder can
/// still be streamed out chunk by chunk.
pub struct PeekedBody<B> {
	peeked: Vec<u8>,
	limit_reached: bool,
	overflow: Bytes,
	rest: Option<B>,
}

/// Read up to `limit` bytes from `body` without consuming the rest.
pub async fn peek<B>(mut body: B, limit: usize) -> Result<PeekedBody<B>, BoxError>
where
	B: Body<Data = Bytes> + Unpin,
	B::Error: Into<BoxError>,
{
	let mut peeked = Vec::with_capacity(limit.min(4096));
	loop {
		if peeked.len() >= limit {
			// Check whether anything beyond the limit is still pending.
			let mut overflow = Bytes::new();
			let mut reached = false;
			while let Some(frame) = body.frame().await {
				if let Ok(data) = frame.map_err(Into::into)?.into_data() {
					if !data.is_empty() {
						overflow = data;
						reached = true;
						break;
					}
				}
			}
			return Ok(PeekedBody {
				peeked,
				limit_reached: reached,
				overflow,
				rest: if reached { Some(body) } else { None },
			});
		}
		match body.frame().await {
			None => {
				return Ok(PeekedBody {
					peeked,
					limit_reached: false,
					overflow: Bytes::new(),
					rest: None,
				});
			}
			Some(frame) => {
				let Some(mut data) = frame.map_err(Into::into)?.into_data().ok() else {
					continue;
				};
				let room = limit - peeked.len();
				if data.len() > room {
					peeked.extend_from_slice(&data.split_to(room));
					return Ok(PeekedBody {
						peeked,
						limit_reached: true,
						overflow: data,
						rest: Some(body),
					});
				}
				peeked.extend_from_slice(&data);
			}
		}
	}
}

impl<B> PeekedBody<B>
where
	B: Body<Data = Bytes> + Unpin,
	B::Error: Into<BoxError>,
{
	pub fn peeked(&self) -> &[u8] {
		&self.peeked
	}

	/// Whether the body holds more data than the peek limit.
	pub fn limit_reached(&self) -> bool {
		self.limit_reached
	}

	/// Next chunk of the not-yet-peeked remainder, `None` at the end.
	pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, BoxError> {
		if !self.overflow.is_empty() {
			return Ok(Some(std::mem::take(&mut self.overflow)));
		}
		let Some(body) = self.rest.as_mut() else {
			return Ok(None);
		};
		loop {
			match body.frame().await {
				None => {
					self.rest = None;
					return Ok(None);
				}
				Some(frame) => {
					if let Ok(data) = frame.map_err(Into::into)?.into_data() {
						if data.is_empty() {
							continue;
						}
						return Ok(Some(data));
					}
				}
			}
		}
	}
}
