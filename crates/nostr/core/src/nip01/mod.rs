//! NIP-01: event envelope, canonical id and signing.
//!
//! Internal module boundaries:
//! - `model`: `Event`, `Request` (filter + subscription id) and `Close`
//! - `codec`: canonical id, event preparation, wire envelopes
//! - `tests`: golden vectors and envelope coverage
//!
//! Events are built with only `kind`, `tags` and `content`; [`prepare`] fills in
//! `pubkey`, `created_at`, `id` and `sig`, leaving any field the caller already
//! set untouched:
//!
//! ```text
//! [0, pubkey, created_at, kind, tags, content]  --sha256-->  id  --schnorr-->  sig
//! ```

mod codec;
mod error;
mod model;

pub use codec::{
    compute_id, deserialize_event, event_object, prepare, serialize_close, serialize_event,
    serialize_request, unix_now, verify_event,
};
pub use error::{Nip01Error, Result};
pub use model::{Close, DEFAULT_LIMIT, Event, KIND_SHORT_TEXT_NOTE, Request};
