use serde::Serialize;

/// Kind 1: short text note.
pub const KIND_SHORT_TEXT_NOTE: u16 = 1;

/// Filter `limit` used when the caller does not pick one.
pub const DEFAULT_LIMIT: u32 = 1;

/// A Nostr event.
///
/// `id`, `pubkey`, `created_at` and `sig` stay `None` until the event is
/// prepared; a caller may pre-fill any of them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Event {
    /// 32-bytes lowercase hex-encoded sha256 of the serialized event data
    pub id: Option<String>,
    /// 32-bytes lowercase hex-encoded x-only public key of the author
    pub pubkey: Option<String>,
    /// Unix timestamp in seconds
    pub created_at: Option<u64>,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    /// 64-bytes lowercase hex Schnorr signature over `id`
    pub sig: Option<String>,
}

impl Event {
    pub fn new(kind: u16, tags: Vec<Vec<String>>, content: impl Into<String>) -> Self {
        Self {
            kind,
            tags,
            content: content.into(),
            ..Self::default()
        }
    }

    /// Unprepared kind-1 note with no tags.
    pub fn text_note(content: impl Into<String>) -> Self {
        Self::new(KIND_SHORT_TEXT_NOTE, Vec::new(), content)
    }

    /// True once every field filled by preparation is present.
    pub fn is_prepared(&self) -> bool {
        self.id.is_some()
            && self.pubkey.is_some()
            && self.created_at.is_some()
            && self.sig.is_some()
    }

    /// Recompute the id and check the signature against `pubkey`.
    pub fn verify(&self) -> super::Result<bool> {
        super::verify_event(self)
    }
}

/// A subscription request: one filter plus the subscription id it runs under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Request {
    /// Assigned on first send when absent.
    #[serde(skip)]
    pub subscription_id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ids: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub authors: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub kinds: Vec<u16>,
    /// `#e` tag values
    #[serde(rename = "#e", skip_serializing_if = "Vec::is_empty")]
    pub e: Vec<String>,
    /// `#p` tag values
    #[serde(rename = "#p", skip_serializing_if = "Vec::is_empty")]
    pub p: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,
    pub limit: u32,
}

impl Default for Request {
    fn default() -> Self {
        Self {
            subscription_id: None,
            ids: Vec::new(),
            authors: Vec::new(),
            kinds: Vec::new(),
            e: Vec::new(),
            p: Vec::new(),
            since: None,
            until: None,
            limit: DEFAULT_LIMIT,
        }
    }
}

impl Request {
    pub fn with_subscription_id(mut self, subscription_id: impl Into<String>) -> Self {
        self.subscription_id = Some(subscription_id.into());
        self
    }

    pub fn authors(mut self, authors: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.authors = authors.into_iter().map(Into::into).collect();
        self
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = u16>) -> Self {
        self.kinds = kinds.into_iter().collect();
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }
}

/// Ends a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Close {
    pub subscription_id: String,
}

impl Close {
    pub fn new(subscription_id: impl Into<String>) -> Self {
        Self {
            subscription_id: subscription_id.into(),
        }
    }
}

impl From<&Request> for Close {
    fn from(request: &Request) -> Self {
        Self::new(request.subscription_id.clone().unwrap_or_default())
    }
}

impl From<&str> for Close {
    fn from(subscription_id: &str) -> Self {
        Self::new(subscription_id)
    }
}
