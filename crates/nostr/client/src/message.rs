//! Inbound relay envelopes.

use crate::error::{ClientError, Result};
use nostr::{Event, deserialize_event};
use serde_json::Value;

/// Message received from a relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayMessage {
    /// `["EVENT", <subscription id>, <event>]`
    Event(String, Event),
    /// `["OK", <event id>, <accepted>, <reason>?]`
    Ok(String, bool, String),
    /// `["EOSE", <subscription id>]`
    Eose(String),
    /// `["NOTICE", <message>]`
    Notice(String),
}

impl RelayMessage {
    /// Parse a relay text frame.
    ///
    /// Dispatch is on the literal first element. Returns `Ok(None)` for empty
    /// arrays and unknown commands.
    pub fn parse(text: &str) -> Result<Option<Self>> {
        let value: Value = serde_json::from_str(text)?;
        let array = value
            .as_array()
            .ok_or_else(|| ClientError::Protocol("expected JSON array relay message".to_string()))?;
        let Some(first) = array.first() else {
            return Ok(None);
        };
        let command = first
            .as_str()
            .ok_or_else(|| ClientError::Protocol("missing relay message kind".to_string()))?;

        match command {
            "EVENT" => {
                if array.len() < 3 {
                    return Err(ClientError::Protocol("invalid EVENT message".to_string()));
                }
                let subscription_id = string_at(array, 1, "invalid EVENT subscription id")?;
                if !array[2].is_object() {
                    return Err(ClientError::Protocol("invalid EVENT payload".to_string()));
                }
                Ok(Some(Self::Event(subscription_id, deserialize_event(&array[2]))))
            }
            "OK" => {
                if array.len() < 3 {
                    return Err(ClientError::Protocol("invalid OK message".to_string()));
                }
                let event_id = string_at(array, 1, "invalid OK event id")?;
                let accepted = array[2]
                    .as_bool()
                    .ok_or_else(|| ClientError::Protocol("invalid OK accepted flag".to_string()))?;
                let reason = match array.get(3) {
                    None => String::new(),
                    Some(_) => string_at(array, 3, "invalid OK message text")?,
                };
                Ok(Some(Self::Ok(event_id, accepted, reason)))
            }
            "EOSE" => {
                if array.len() < 2 {
                    return Err(ClientError::Protocol("invalid EOSE message".to_string()));
                }
                let subscription_id = string_at(array, 1, "invalid EOSE subscription id")?;
                Ok(Some(Self::Eose(subscription_id)))
            }
            "NOTICE" => {
                if array.len() < 2 {
                    return Err(ClientError::Protocol("invalid NOTICE message".to_string()));
                }
                let message = string_at(array, 1, "invalid NOTICE message text")?;
                Ok(Some(Self::Notice(message)))
            }
            _ => Ok(None),
        }
    }
}

fn string_at(array: &[Value], index: usize, error: &str) -> Result<String> {
    array
        .get(index)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ClientError::Protocol(error.to_string()))
}
