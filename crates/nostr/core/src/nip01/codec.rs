use super::error::{Nip01Error, Result};
use super::model::{Close, Event, Request};
use crate::identity::Identity;
use bitcoin::secp256k1::{Message, Secp256k1, XOnlyPublicKey, schnorr};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in unix seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}

/// Event id: lowercase hex sha256 of `[0,pubkey,created_at,kind,tags,content]`
/// serialized as compact JSON.
pub fn compute_id(event: &Event) -> Result<String> {
    let pubkey = event
        .pubkey
        .as_deref()
        .ok_or(Nip01Error::MissingField("pubkey"))?;
    let created_at = event
        .created_at
        .ok_or(Nip01Error::MissingField("created_at"))?;

    let canonical = serde_json::to_string(&(
        0,
        pubkey,
        created_at,
        event.kind,
        &event.tags,
        &event.content,
    ))?;

    Ok(hex::encode(Sha256::digest(canonical.as_bytes())))
}

/// Fill `pubkey`, `created_at`, `id` and `sig` where they are still `None`.
///
/// Fields that are already set are never touched, so calling this on a
/// prepared event is a no-op.
pub fn prepare(event: &mut Event, identity: &Identity) -> Result<()> {
    if event.pubkey.is_none() {
        event.pubkey = Some(identity.public_key_hex()?);
    }
    if event.created_at.is_none() {
        event.created_at = Some(unix_now());
    }
    if event.id.is_none() {
        event.id = Some(compute_id(event)?);
    }
    if event.sig.is_none() {
        let id = event.id.as_deref().ok_or(Nip01Error::MissingField("id"))?;
        let digest = decode_digest(id)?;
        event.sig = Some(hex::encode(identity.sign(&digest)?));
    }
    Ok(())
}

/// Check that `id` matches the event fields and that `sig` verifies against
/// `pubkey`.
pub fn verify_event(event: &Event) -> Result<bool> {
    let id = event.id.as_deref().ok_or(Nip01Error::MissingField("id"))?;
    let sig = event.sig.as_deref().ok_or(Nip01Error::MissingField("sig"))?;
    let pubkey = event
        .pubkey
        .as_deref()
        .ok_or(Nip01Error::MissingField("pubkey"))?;

    if compute_id(event)? != id {
        return Ok(false);
    }

    let digest = decode_digest(id)?;
    let sig_bytes = hex::decode(sig).map_err(|e| Nip01Error::InvalidHex(format!("sig: {e}")))?;
    let pubkey_bytes =
        hex::decode(pubkey).map_err(|e| Nip01Error::InvalidHex(format!("pubkey: {e}")))?;

    let Ok(signature) = schnorr::Signature::from_slice(&sig_bytes) else {
        return Ok(false);
    };
    let Ok(pubkey) = XOnlyPublicKey::from_slice(&pubkey_bytes) else {
        return Ok(false);
    };

    let secp = Secp256k1::verification_only();
    Ok(secp
        .verify_schnorr(&signature, &Message::from_digest(digest), &pubkey)
        .is_ok())
}

/// Wire object for an event. All seven keys are always present; fields that
/// were never filled are written as empty strings or zero.
pub fn event_object(event: &Event) -> Value {
    json!({
        "id": event.id.as_deref().unwrap_or_default(),
        "pubkey": event.pubkey.as_deref().unwrap_or_default(),
        "created_at": event.created_at.unwrap_or_default(),
        "kind": event.kind,
        "tags": event.tags,
        "content": event.content,
        "sig": event.sig.as_deref().unwrap_or_default(),
    })
}

/// `["EVENT",<event>]`
pub fn serialize_event(event: &Event) -> Result<String> {
    Ok(serde_json::to_string(&json!(["EVENT", event_object(event)]))?)
}

/// `["REQ",<subscription id>,<filter>]`
pub fn serialize_request(request: &Request) -> Result<String> {
    let subscription_id = request.subscription_id.as_deref().unwrap_or_default();
    Ok(serde_json::to_string(&("REQ", subscription_id, request))?)
}

/// `["CLOSE",<subscription id>]`
pub fn serialize_close(close: &Close) -> Result<String> {
    Ok(serde_json::to_string(&("CLOSE", &close.subscription_id))?)
}

/// Read an event object received from a relay. Missing or mistyped fields
/// fall back to empty/zero values.
pub fn deserialize_event(object: &Value) -> Event {
    let text = |key: &str| {
        object
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };

    let tags = object
        .get("tags")
        .and_then(Value::as_array)
        .map(|tags| {
            tags.iter()
                .map(|tag| {
                    tag.as_array()
                        .map(|fields| {
                            fields
                                .iter()
                                .map(|field| field.as_str().unwrap_or_default().to_string())
                                .collect()
                        })
                        .unwrap_or_default()
                })
                .collect()
        })
        .unwrap_or_default();

    Event {
        id: Some(text("id")),
        pubkey: Some(text("pubkey")),
        created_at: Some(
            object
                .get("created_at")
                .and_then(Value::as_u64)
                .unwrap_or_default(),
        ),
        kind: object
            .get("kind")
            .and_then(Value::as_u64)
            .and_then(|kind| u16::try_from(kind).ok())
            .unwrap_or_default(),
        tags,
        content: text("content"),
        sig: Some(text("sig")),
    }
}

fn decode_digest(id: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(id).map_err(|e| Nip01Error::InvalidHex(format!("id: {e}")))?;
    <[u8; 32]>::try_from(bytes.as_slice())
        .map_err(|_| Nip01Error::InvalidHex(format!("id must be 32 bytes, got {}", bytes.len())))
}
