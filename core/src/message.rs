//! Classifies inbound WebSocket text frames and decodes the SockJS/Shiny
//! wire envelope.
//!
//! Three jobs live here: strip the optional reconnect message-id prefix
//! SockJS frames carry, decode the doubly-JSON-encoded Shiny payload inside
//! an `a["...")]` data frame, and decide whether a frame is operational
//! noise (heartbeats, ACKs, busy/progress markers, the empty diff) that the
//! session run-loop should never hand to a scripted `WS_RECV`.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::error::ShinyError;

static RECONNECT_PREFIX_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"^a\["[0-9A-F]+#"#).unwrap());
static INNER_MESSAGE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^a\["(\*#)?0\|m\|(.*)"\]$"#).unwrap());
static ACK_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"^a?\["ACK.*$"#).unwrap());

/// Strips a leading `<HEX>#` reconnect message-id prefix, replacing it with
/// a normalized `*#` marker so the inner-message pattern only needs to
/// account for the prefix's presence, not its value.
fn normalize(msg: &str) -> std::borrow::Cow<'_, str> {
    RECONNECT_PREFIX_RE.replace(msg, r#"a["*#"#)
}

/// Decodes a SockJS/Shiny text frame.
///
/// Returns `Ok(None)` for the bare SockJS open frame `"o"` (not a payload
/// object). Returns `Ok(Some(value))` for a decoded Shiny inner message, or
/// for a message that parses directly as a JSON object (the framing-less
/// shape seen against a bare Shiny dev server). Anything else is a protocol
/// error.
pub fn parse_message(msg: &str) -> Result<Option<Value>, ShinyError> {
    let normalized = normalize(msg);

    if let Some(caps) = INNER_MESSAGE_RE.captures(normalized.as_ref()) {
        let escaped = &caps[2];
        let quoted = format!("\"{escaped}\"");
        let inner_json: String = serde_json::from_str(&quoted).map_err(|e| {
            ShinyError::WsProtocol(format!("inner message was not a JSON string: {e}"))
        })?;
        let value: Value = serde_json::from_str(&inner_json)?;
        return Ok(Some(value));
    }

    if msg == "o" {
        return Ok(None);
    }

    let value: Value = serde_json::from_str(msg)
        .map_err(|e| ShinyError::WsProtocol(format!("unrecognized frame {msg:?}: {e}")))?;
    if !value.is_object() {
        return Err(ShinyError::WsProtocol(format!(
            "expected a JSON object, got {msg:?}"
        )));
    }
    Ok(Some(value))
}

/// True if this frame carries operational metadata rather than a scripted
/// message: heartbeats, ACKs, busy/progress/recalculating notices, the
/// `reactlog` custom message, or an empty diff.
pub fn can_ignore(msg: &str) -> Result<bool, ShinyError> {
    if msg == "o" {
        return Ok(false);
    }
    if msg == "h" || ACK_RE.is_match(msg) {
        return Ok(true);
    }

    let value = parse_message(msg)?.ok_or_else(|| {
        ShinyError::WsProtocol("ignorability check received a null/open frame".into())
    })?;

    let Value::Object(map) = &value else {
        return Ok(false);
    };

    if map
        .keys()
        .any(|k| matches!(k.as_str(), "busy" | "progress" | "recalculating"))
    {
        return Ok(true);
    }

    if map.len() == 1 {
        if let Some(Value::Object(custom)) = map.get("custom") {
            if custom.len() == 1 && custom.contains_key("reactlog") {
                return Ok(true);
            }
        }
    }

    if is_empty_diff(map) {
        return Ok(true);
    }

    Ok(false)
}

fn is_empty_diff(map: &serde_json::Map<String, Value>) -> bool {
    if map.len() != 3 {
        return false;
    }
    let empty_array = |key: &str| matches!(map.get(key), Some(Value::Array(a)) if a.is_empty());
    empty_array("errors") && empty_array("values") && empty_array("inputMessages")
}
