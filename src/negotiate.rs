//! Content negotiation: pick a deserializer by declared content type and turn
//! the buffered body into an [`Entity`].
//!
//! A route may register its own deserializers per media type. A route that
//! registers none gets the built-in defaults:
//!
//! | media type                         | deserializer            | entity                  |
//! |------------------------------------|-------------------------|-------------------------|
//! | `application/json`, `*/*+json`     | [`JsonDeserializer`]    | `Entity::Json(value)`   |
//! | `text/*`                           | [`TextDeserializer`]    | `{"text": <decoded>}`   |
//! | anything else                      | [`BinaryDeserializer`]  | `Entity::Binary(bytes)` |
//!
//! Character sets go through a closed alias table: the `charset` parameter is
//! looked up case-insensitively, mapped to its canonical decoder name, and
//! passed through unchanged when no alias matches. A name no decoder answers
//! to is a 415.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use http::StatusCode;
use serde_json::json;

use crate::response::{Entity, Interrupt, Outcome, ServiceResponse};

// ── Deserializer ──────────────────────────────────────────────────────────────

/// Converts raw body bytes into an [`Entity`], or raises a client error.
///
/// Implemented for any `Fn(&[u8], Option<&str>) -> Outcome<Entity>`.
pub trait Deserializer: Send + Sync {
    fn deserialize(&self, body: &[u8], content_type: Option<&str>) -> Outcome<Entity>;
}

impl<F> Deserializer for F
where
    F: Fn(&[u8], Option<&str>) -> Outcome<Entity> + Send + Sync,
{
    fn deserialize(&self, body: &[u8], content_type: Option<&str>) -> Outcome<Entity> {
        self(body, content_type)
    }
}

/// Reference text deserializer. Yields `{"text": <decoded>}`.
pub struct TextDeserializer;

impl Deserializer for TextDeserializer {
    fn deserialize(&self, body: &[u8], content_type: Option<&str>) -> Outcome<Entity> {
        let text = decode_text(body, content_type).map_err(unsupported)?;
        Ok(Entity::Json(json!({ "text": text })))
    }
}

/// JSON deserializer. Honors a non-UTF-8 `charset` parameter.
pub struct JsonDeserializer;

impl Deserializer for JsonDeserializer {
    fn deserialize(&self, body: &[u8], content_type: Option<&str>) -> Outcome<Entity> {
        let parsed = match content_type.and_then(charset_param) {
            Some(label) if resolve(&label) != "utf-8" => {
                let text = decode_text(body, content_type).map_err(unsupported)?;
                serde_json::from_str(&text)
            }
            _ => serde_json::from_slice(body),
        };
        parsed.map(Entity::Json).map_err(|e| {
            Interrupt::Abort(ServiceResponse::error(
                StatusCode::BAD_REQUEST,
                format!("malformed JSON body: {e}"),
            ))
        })
    }
}

/// Passes the bytes through untouched.
pub struct BinaryDeserializer;

impl Deserializer for BinaryDeserializer {
    fn deserialize(&self, body: &[u8], _content_type: Option<&str>) -> Outcome<Entity> {
        Ok(Entity::Binary(Bytes::copy_from_slice(body)))
    }
}

fn unsupported(err: DecodeError) -> Interrupt {
    Interrupt::Abort(ServiceResponse::error(StatusCode::UNSUPPORTED_MEDIA_TYPE, err.to_string()))
}

// ── Per-route table ───────────────────────────────────────────────────────────

/// The media-type → deserializer map a route registers.
#[derive(Clone, Default)]
pub struct Deserializers {
    by_type: HashMap<String, Arc<dyn Deserializer>>,
}

impl Deserializers {
    pub fn insert(&mut self, media_type: &str, d: impl Deserializer + 'static) {
        self.by_type.insert(media_type.trim().to_ascii_lowercase(), Arc::new(d));
    }

    pub fn is_empty(&self) -> bool {
        self.by_type.is_empty()
    }

    /// Decodes `body` according to `content_type`. An empty body is always
    /// [`Entity::Empty`].
    pub fn negotiate(&self, body: &[u8], content_type: Option<&str>) -> Outcome<Entity> {
        if body.is_empty() {
            return Ok(Entity::Empty);
        }
        let essence = content_type.map(media_type).unwrap_or_else(|| "application/octet-stream".to_owned());

        if !self.is_empty() {
            return match self.by_type.get(&essence) {
                Some(d) => d.deserialize(body, content_type),
                None => Err(Interrupt::Abort(ServiceResponse::error(
                    StatusCode::UNSUPPORTED_MEDIA_TYPE,
                    format!("unsupported content type: {essence}"),
                ))),
            };
        }

        if essence == "application/json" || essence.ends_with("+json") {
            JsonDeserializer.deserialize(body, content_type)
        } else if essence.starts_with("text/") {
            TextDeserializer.deserialize(body, content_type)
        } else {
            BinaryDeserializer.deserialize(body, content_type)
        }
    }
}

// ── Content-type parsing ──────────────────────────────────────────────────────

/// The lowercase `type/subtype` of a content-type header.
pub fn media_type(content_type: &str) -> String {
    content_type.split(';').next().unwrap_or("").trim().to_ascii_lowercase()
}

/// The `charset` parameter, quoted or unquoted.
pub fn charset_param(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (name, value) = param.split_once('=')?;
        if !name.trim().eq_ignore_ascii_case("charset") {
            return None;
        }
        let value = value.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .unwrap_or(value);
        (!value.is_empty()).then(|| value.to_owned())
    })
}

// ── Character sets ────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("unsupported charset: {0}")]
    Unsupported(String),
    #[error("malformed {charset} input: {detail}")]
    Malformed { charset: &'static str, detail: String },
}

/// Decoders portico knows how to run.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Charset {
    Utf8,
    Utf16Le,
    Utf16Be,
    Latin1,
    Ascii,
}

/// Alias → canonical decoder name. Keys are lowercase.
const ALIASES: &[(&str, &str)] = &[
    ("utf-8",             "utf-8"),
    ("utf8",              "utf-8"),
    ("unicode-1-1-utf-8", "utf-8"),
    ("utf-16le",          "utf-16le"),
    ("utf16le",           "utf-16le"),
    ("ucs-2",             "utf-16le"),
    ("utf-16be",          "utf-16be"),
    ("utf16be",           "utf-16be"),
    ("iso-8859-1",        "iso-8859-1"),
    ("iso8859-1",         "iso-8859-1"),
    ("iso_8859-1",        "iso-8859-1"),
    ("latin1",            "iso-8859-1"),
    ("l1",                "iso-8859-1"),
    ("cp819",             "iso-8859-1"),
    ("us-ascii",          "us-ascii"),
    ("ascii",             "us-ascii"),
    ("us",                "us-ascii"),
    ("iso646-us",         "us-ascii"),
];

/// Maps a charset label to its canonical decoder name, or returns the label
/// unchanged when it is not a known alias.
pub fn resolve(label: &str) -> String {
    let lower = label.trim().to_ascii_lowercase();
    ALIASES
        .iter()
        .find(|(alias, _)| *alias == lower)
        .map(|(_, canonical)| (*canonical).to_owned())
        .unwrap_or_else(|| label.trim().to_owned())
}

impl Charset {
    pub fn for_label(label: &str) -> Result<Self, DecodeError> {
        match resolve(label).to_ascii_lowercase().as_str() {
            "utf-8"      => Ok(Self::Utf8),
            "utf-16le"   => Ok(Self::Utf16Le),
            "utf-16be"   => Ok(Self::Utf16Be),
            "iso-8859-1" => Ok(Self::Latin1),
            "us-ascii"   => Ok(Self::Ascii),
            _            => Err(DecodeError::Unsupported(label.trim().to_owned())),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Utf8    => "utf-8",
            Self::Utf16Le => "utf-16le",
            Self::Utf16Be => "utf-16be",
            Self::Latin1  => "iso-8859-1",
            Self::Ascii   => "us-ascii",
        }
    }

    pub fn decode(self, bytes: &[u8]) -> Result<String, DecodeError> {
        let malformed = |detail: String| DecodeError::Malformed { charset: self.name(), detail };
        match self {
            Self::Utf8 => {
                let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
                std::str::from_utf8(bytes)
                    .map(str::to_owned)
                    .map_err(|e| malformed(e.to_string()))
            }
            Self::Ascii => match bytes.iter().position(|b| !b.is_ascii()) {
                Some(at) => Err(malformed(format!("non-ASCII byte at offset {at}"))),
                None => Ok(bytes.iter().map(|&b| char::from(b)).collect()),
            },
            Self::Latin1 => Ok(bytes.iter().map(|&b| char::from(b)).collect()),
            Self::Utf16Le | Self::Utf16Be => {
                if bytes.len() % 2 != 0 {
                    return Err(malformed("odd number of bytes".to_owned()));
                }
                let units = bytes.chunks_exact(2).map(|pair| {
                    let pair = [pair[0], pair[1]];
                    if self == Self::Utf16Le { u16::from_le_bytes(pair) } else { u16::from_be_bytes(pair) }
                });
                char::decode_utf16(units)
                    .collect::<Result<String, _>>()
                    .map(|s| s.strip_prefix('\u{FEFF}').map(str::to_owned).unwrap_or(s))
                    .map_err(|e| malformed(e.to_string()))
            }
        }
    }
}

/// Decodes `body` with the charset named by `content_type`, UTF-8 if none.
pub fn decode_text(body: &[u8], content_type: Option<&str>) -> Result<String, DecodeError> {
    let charset = match content_type.and_then(charset_param) {
        Some(label) => Charset::for_label(&label)?,
        None => Charset::Utf8,
    };
    charset.decode(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn abort_of(outcome: Outcome<Entity>) -> ServiceResponse {
        match outcome {
            Err(Interrupt::Abort(res)) => res,
            other => panic!("expected abort, got {other:?}"),
        }
    }

    #[test]
    fn utf8_text_decodes_to_text_entity() {
        let entity = TextDeserializer
            .deserialize("café".as_bytes(), Some("text/plain; charset=UTF-8"))
            .unwrap();
        assert_eq!(entity, Entity::Json(json!({ "text": "café" })));
    }

    #[test]
    fn bogus_charset_is_415_with_structured_body() {
        let res = abort_of(TextDeserializer.deserialize("café".as_bytes(), Some("text/plain; charset=BOGUS")));
        assert_eq!(res.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
        assert_eq!(
            res.entity().as_json(),
            Some(&json!({ "errorCode": "X2-415", "errorMessage": "unsupported charset: BOGUS" }))
        );
    }

    #[test]
    fn charset_param_forms() {
        assert_eq!(charset_param("text/plain; charset=utf-8").as_deref(), Some("utf-8"));
        assert_eq!(charset_param("text/plain;CHARSET=\"Latin1\"").as_deref(), Some("Latin1"));
        assert_eq!(charset_param("text/plain; format=flowed"), None);
        assert_eq!(charset_param("text/plain; charset=\"\""), None);
    }

    #[test]
    fn aliases_resolve_case_insensitively_and_fall_back_to_raw() {
        assert_eq!(resolve("LATIN1"), "iso-8859-1");
        assert_eq!(resolve("Utf8"), "utf-8");
        assert_eq!(resolve("x-Klingon"), "x-Klingon");
        assert_eq!(Charset::for_label("UTF-8").unwrap(), Charset::Utf8);
        assert!(matches!(Charset::for_label("x-Klingon"), Err(DecodeError::Unsupported(l)) if l == "x-Klingon"));
    }

    #[test]
    fn latin1_and_utf16() {
        let latin1 = decode_text(&[0x63, 0x61, 0x66, 0xE9], Some("text/plain; charset=\"l1\"")).unwrap();
        assert_eq!(latin1, "café");

        let utf16: Vec<u8> = "hé".encode_utf16().flat_map(u16::to_be_bytes).collect();
        assert_eq!(decode_text(&utf16, Some("text/plain; charset=utf-16be")).unwrap(), "hé");
        assert!(decode_text(&utf16[..3], Some("text/plain; charset=utf-16be")).is_err());
    }

    #[test]
    fn invalid_utf8_is_415() {
        let res = abort_of(TextDeserializer.deserialize(&[0xFF, 0xFE, 0x41], Some("text/plain")));
        assert_eq!(res.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[test]
    fn ascii_rejects_high_bytes() {
        assert!(decode_text("é".as_bytes(), Some("text/plain; charset=us-ascii")).is_err());
    }

    #[test]
    fn defaults_by_media_type() {
        let d = Deserializers::default();
        assert_eq!(
            d.negotiate(br#"{"a":1}"#, Some("application/vnd.api+json")).unwrap(),
            Entity::Json(json!({ "a": 1 }))
        );
        assert_eq!(
            d.negotiate(b"\x00\x01", Some("image/png")).unwrap(),
            Entity::Binary(Bytes::from_static(b"\x00\x01"))
        );
        assert_eq!(d.negotiate(b"", Some("application/json")).unwrap(), Entity::Empty);
        let res = abort_of(d.negotiate(b"{nope", Some("application/json")));
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn route_table_rejects_undeclared_types() {
        let mut d = Deserializers::default();
        d.insert("Text/CSV", |body: &[u8], _: Option<&str>| -> Outcome<Entity> {
            Ok(Entity::Text(String::from_utf8_lossy(body).into_owned()))
        });
        assert_eq!(
            d.negotiate(b"a,b", Some("text/csv; charset=utf-8")).unwrap(),
            Entity::Text("a,b".to_owned())
        );
        let res = abort_of(d.negotiate(b"{}", Some("application/json")));
        assert_eq!(res.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }
}
