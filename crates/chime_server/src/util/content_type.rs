#![forbid(unsafe_code)]

/// Detect a content type from the first bytes of a blob plus its filename,
/// returning `(mime, extension-with-dot)`. Falls back to the filename's own
/// extension, then to `application/octet-stream`.
pub fn detect(peeked: &[u8], filename: &str) -> (String, String) {
	if let Some((mime, ext)) = sniff(peeked) {
		return (mime.to_string(), ext.to_string());
	}
	if std::str::from_utf8(peeked).is_ok() {
		let ext = filename_extension(filename).unwrap_or(".txt");
		return ("text/plain; charset=utf-8".to_string(), ext.to_string());
	}
	let ext = filename_extension(filename).unwrap_or("");
	("application/octet-stream".to_string(), ext.to_string())
}

fn sniff(b: &[u8]) -> Option<(&'static str, &'static str)> {
	if b.starts_with(b"\xff\xd8\xff") {
		return Some(("image/jpeg", ".jpg"));
	}
	if b.starts_with(b"\x89PNG\r\n\x1a\n") {
		return Some(("image/png", ".png"));
	}
	if b.starts_with(b"GIF87a") || b.starts_with(b"GIF89a") {
		return Some(("image/gif", ".gif"));
	}
	if b.len() >= 12 && &b[0..4] == b"RIFF" && &b[8..12] == b"WEBP" {
		return Some(("image/webp", ".webp"));
	}
	if b.starts_with(b"%PDF-") {
		return Some(("application/pdf", ".pdf"));
	}
	if b.starts_with(b"PK\x03\x04") {
		return Some(("application/zip", ".zip"));
	}
	if b.starts_with(b"\x1f\x8b") {
		return Some(("application/gzip", ".gz"));
	}
	if b.len() >= 12 && &b[4..8] == b"ftyp" {
		return Some(("video/mp4", ".mp4"));
	}
	if b.starts_with(b"OggS") {
		return Some(("audio/ogg", ".ogg"));
	}
	if b.starts_with(b"ID3") || b.starts_with(b"\xff\xfb") {
		return Some(("audio/mpeg", ".mp3"));
	}
	None
}

/// Best-effort mime from a filename extension; used when serving blobs
/// (only the name is available without reading the file).
pub fn from_extension(filename: &str) -> Option<&'static str> {
	let ext = filename_extension(filename)?.to_ascii_lowercase();
	match ext.as_str() {
		".jpg" | ".jpeg" => Some("image/jpeg"),
		".png" => Some("image/png"),
		".gif" => Some("image/gif"),
		".webp" => Some("image/webp"),
		".pdf" => Some("application/pdf"),
		".zip" => Some("application/zip"),
		".gz" => Some("application/gzip"),
		".mp4" => Some("video/mp4"),
		".ogg" => Some("audio/ogg"),
		".mp3" => Some("audio/mpeg"),
		".txt" => Some("text/plain; charset=utf-8"),
		_ => None,
	}
}

fn filename_extension(filename: &str) -> Option<&str> {
	let dot = filename.rfind('.')?;
	let ext = &filename[dot..];
	if ext.len() < 2 || ext.len() > 17 || !ext[1..].bytes().all(|b| b.is_ascii_alphanumeric()) {
		return None;
	}
	Some(ext)
}
