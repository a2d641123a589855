#![forbid(unsafe_code)]

use chime_protocol::{
	Attachment, EventKind, Message, default_attachment_message, parse_priority, random_message_id, valid_message_id,
	valid_topic,
};

#[test]
fn message_ids_are_alphanumeric_and_unique_enough() {
	let a = random_message_id();
	let b = random_message_id();
	assert_eq!(a.len(), 10);
	assert!(a.bytes().all(|c| c.is_ascii_alphanumeric()));
	assert_ne!(a, b);
	assert!(valid_message_id(&a));
}

#[test]
fn message_id_validation_rejects_bad_shapes() {
	assert!(!valid_message_id(""));
	assert!(!valid_message_id("short"));
	assert!(!valid_message_id("elevenchars"));
	assert!(!valid_message_id("has space1"));
	assert!(valid_message_id("aB3dE6gH9k"));
}

#[test]
fn topic_validation() {
	assert!(valid_topic("mytopic"));
	assert!(valid_topic("under_scores-and-dashes_123"));
	assert!(valid_topic(&"a".repeat(64)));
	assert!(!valid_topic(""));
	assert!(!valid_topic(&"a".repeat(65)));
	assert!(!valid_topic("has/slash"));
	assert!(!valid_topic("has space"));
	assert!(!valid_topic("unicöde"));
}

#[test]
fn priority_parsing() {
	assert_eq!(parse_priority("").unwrap(), 3);
	assert_eq!(parse_priority("1").unwrap(), 1);
	assert_eq!(parse_priority("min").unwrap(), 1);
	assert_eq!(parse_priority("low").unwrap(), 2);
	assert_eq!(parse_priority("default").unwrap(), 3);
	assert_eq!(parse_priority("high").unwrap(), 4);
	assert_eq!(parse_priority("max").unwrap(), 5);
	assert_eq!(parse_priority("urgent").unwrap(), 5);
	assert!(parse_priority("0").is_err());
	assert!(parse_priority("6").is_err());
	assert!(parse_priority("yes").is_err());
}

#[test]
fn default_message_json_omits_empty_fields() {
	let mut m = Message::new("mytopic");
	m.id = "aaaaaaaaaa".to_string();
	m.time = 1_700_000_000;
	m.message = "hi there".to_string();

	let json = serde_json::to_value(&m).unwrap();
	let obj = json.as_object().unwrap();
	assert_eq!(obj["id"], "aaaaaaaaaa");
	assert_eq!(obj["time"], 1_700_000_000);
	assert_eq!(obj["event"], "message");
	assert_eq!(obj["topic"], "mytopic");
	assert_eq!(obj["message"], "hi there");
	assert!(!obj.contains_key("title"));
	assert!(!obj.contains_key("priority"));
	assert!(!obj.contains_key("tags"));
	assert!(!obj.contains_key("click"));
	assert!(!obj.contains_key("actions"));
	assert!(!obj.contains_key("attachment"));
	assert!(!obj.contains_key("encoding"));
}

#[test]
fn attachment_owner_never_serializes() {
	let mut m = Message::new("t");
	m.attachment = Some(Attachment {
		name: "flower.jpg".to_string(),
		content_type: "image/jpeg".to_string(),
		size: 12_345,
		expires: 1_700_003_600,
		url: "https://chime.example.com/file/aaaaaaaaaa.jpg".to_string(),
		owner: "203.0.113.1".to_string(),
	});

	let json = serde_json::to_value(&m).unwrap();
	let att = json["attachment"].as_object().unwrap();
	assert_eq!(att["name"], "flower.jpg");
	assert_eq!(att["type"], "image/jpeg");
	assert_eq!(att["size"], 12_345);
	assert!(!att.contains_key("owner"));

	// And it round-trips (minus the owner).
	let back: Message = serde_json::from_value(json).unwrap();
	assert_eq!(back.attachment.as_ref().unwrap().owner, "");
	assert_eq!(back.attachment.as_ref().unwrap().name, "flower.jpg");
}

#[test]
fn event_kinds_on_the_wire() {
	assert_eq!(serde_json::to_value(EventKind::Open).unwrap(), "open");
	assert_eq!(serde_json::to_value(EventKind::Keepalive).unwrap(), "keepalive");
	assert_eq!(serde_json::to_value(EventKind::PollRequest).unwrap(), "poll_request");
	let open = Message::open("t1,t2");
	assert_eq!(open.event, EventKind::Open);
	assert_eq!(open.topic, "t1,t2");
}

#[test]
fn attachment_fallback_text() {
	assert_eq!(default_attachment_message("a.bin"), "You received a file: a.bin");
}
