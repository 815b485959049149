//! Nostr protocol primitives: author identity and the NIP-01 event envelope.

mod identity;
pub mod nip01;

pub use identity::{Identity, IdentityError, frame_pem, generate_secret, strip_pem_framing};
pub use nip01::{
    Close, Event, KIND_SHORT_TEXT_NOTE, Nip01Error, Request, compute_id, deserialize_event,
    prepare, serialize_close, serialize_event, serialize_request, verify_event,
};
