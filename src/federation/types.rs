//! ActivityStreams wire types
//!
//! Only the subset of the vocabulary the pipeline understands is modelled:
//! actors, notes, ordered collections and the Follow/Undo/Create/Accept
//! activities. Inbound payloads are decoded in two steps. First into the
//! loose [`ActivityEnvelope`], then by type tag into a [`TypedActivity`].

use lazy_static::lazy_static;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::data::EntityId;
use crate::error::AppError;

/// The ActivityStreams JSON-LD context
pub const ACTIVITY_STREAMS_CONTEXT: &str = "https://www.w3.org/ns/activitystreams";

/// Security vocabulary context (publicKey on actors)
pub const SECURITY_CONTEXT: &str = "https://w3id.org/security/v1";

/// Special collection addressing everyone
pub const PUBLIC_ADDRESS: &str = "https://www.w3.org/ns/activitystreams#Public";

/// Content type of every federation body
pub const ACTIVITY_CONTENT_TYPE: &str = "application/activity+json; charset=utf-8";

pub const FOLLOW: &str = "Follow";
pub const UNDO: &str = "Undo";
pub const CREATE: &str = "Create";
pub const ACCEPT: &str = "Accept";
pub const NOTE: &str = "Note";

lazy_static! {
    /// Context attached to local actor documents
    pub static ref ACTOR_CONTEXT: Context =
        Context::from_iris(&[ACTIVITY_STREAMS_CONTEXT, SECURITY_CONTEXT]);
}

// =============================================================================
// JSON-LD context
// =============================================================================

/// One member of a JSON-LD `@context`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContextEntry {
    Iri(String),
    Definition(serde_json::Map<String, Value>),
    Other(Value),
}

/// A JSON-LD `@context`: a single entry or an array of mixed entries
///
/// The original shape is kept so that re-serialising a payload yields the
/// same structure that was received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Context {
    Many(Vec<ContextEntry>),
    One(ContextEntry),
}

impl Context {
    /// `"https://www.w3.org/ns/activitystreams"`
    pub fn activity_streams() -> Self {
        Context::One(ContextEntry::Iri(ACTIVITY_STREAMS_CONTEXT.to_string()))
    }

    pub fn from_iris(iris: &[&str]) -> Self {
        Context::Many(
            iris.iter()
                .map(|iri| ContextEntry::Iri((*iri).to_string()))
                .collect(),
        )
    }

    fn entries(&self) -> &[ContextEntry] {
        match self {
            Context::Many(entries) => entries,
            Context::One(entry) => std::slice::from_ref(entry),
        }
    }

    /// Whether any string member equals `iri`
    pub fn contains(&self, iri: &str) -> bool {
        self.entries()
            .iter()
            .any(|entry| matches!(entry, ContextEntry::Iri(value) if value == iri))
    }

    /// First string member, used as the stored context column
    pub fn primary_iri(&self) -> Option<&str> {
        self.entries().iter().find_map(|entry| match entry {
            ContextEntry::Iri(value) => Some(value.as_str()),
            _ => None,
        })
    }
}

/// Accept `"x"` or `["x", "y"]` for address lists
fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
        Null(Option<()>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(value) => vec![value],
        OneOrMany::Many(values) => values,
        OneOrMany::Null(_) => Vec::new(),
    })
}

// =============================================================================
// Activities
// =============================================================================

/// The `actor` property of an inbound activity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ActorRef {
    /// `"actor": "https://remote/users/bob"`
    Id(String),
    /// `"actor": {"id": "https://remote/users/bob", ...}`
    Embedded {
        id: String,
        #[serde(flatten)]
        rest: serde_json::Map<String, Value>,
    },
    /// Anything else; kept so the envelope still decodes
    Unsupported(Value),
}

impl ActorRef {
    /// Actor ID, if the shape carries one
    pub fn id(&self) -> Option<&str> {
        match self {
            ActorRef::Id(id) | ActorRef::Embedded { id, .. } if !id.is_empty() => Some(id),
            _ => None,
        }
    }
}

/// Loosely typed activity, enough to route on `type`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEnvelope {
    #[serde(rename = "@context", default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Context>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<ActorRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published: Option<String>,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub to: Vec<String>,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub cc: Vec<String>,
}

/// An activity after branching on its type tag
#[derive(Debug, Clone, PartialEq)]
pub enum TypedActivity {
    Follow,
    /// The undone activity, re-decoded as an envelope
    Undo(Box<ActivityEnvelope>),
    Create(Box<Note>),
    Other(String),
}

impl ActivityEnvelope {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, AppError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn actor_id(&self) -> Option<&str> {
        self.actor.as_ref().and_then(ActorRef::id)
    }

    /// Whether the `to` list addresses the public collection
    pub fn is_public(&self) -> bool {
        self.to.iter().any(|address| address == PUBLIC_ADDRESS)
    }

    /// Decode the `object` payload according to `type`
    ///
    /// # Errors
    /// `Validation` if a Follow/Undo/Create payload has the wrong shape
    pub fn decode(&self) -> Result<TypedActivity, AppError> {
        match self.kind.as_str() {
            FOLLOW => Ok(TypedActivity::Follow),
            UNDO => {
                let object = match &self.object {
                    Some(object @ Value::Object(_)) => object.clone(),
                    _ => {
                        return Err(AppError::Validation(
                            "Undo must embed the activity it undoes".to_string(),
                        ));
                    }
                };
                let inner: ActivityEnvelope = serde_json::from_value(object)?;
                Ok(TypedActivity::Undo(Box::new(inner)))
            }
            CREATE => {
                let object = self.object.clone().ok_or_else(|| {
                    AppError::Validation("Create must embed an object".to_string())
                })?;
                let note: Note = serde_json::from_value(object)?;
                Ok(TypedActivity::Create(Box::new(note)))
            }
            other => Ok(TypedActivity::Other(other.to_string())),
        }
    }
}

/// Outbound activity with a typed object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity<T> {
    #[serde(rename = "@context")]
    pub context: Context,
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    pub actor: String,
    pub object: T,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published: Option<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub to: Vec<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub cc: Vec<String>,
}

/// `{actor_id}/activities/{ulid}`
pub fn new_activity_id(actor_id: &str) -> String {
    format!("{}/activities/{}", actor_id, EntityId::new().0)
}

impl Activity<Note> {
    /// Wrap an authored note in a Create activity with matching addressing
    pub fn create(actor_id: &str, note: Note) -> Self {
        Activity {
            context: Context::activity_streams(),
            kind: CREATE.to_string(),
            id: new_activity_id(actor_id),
            actor: actor_id.to_string(),
            published: Some(note.published.clone()),
            to: note.to.clone(),
            cc: note.cc.clone(),
            object: note,
        }
    }
}

impl Activity<String> {
    /// Accept the activity `object_id`, addressed to the remote actor
    pub fn accept(actor_id: &str, object_id: &str, remote_actor_id: &str) -> Self {
        Activity {
            context: Context::activity_streams(),
            kind: ACCEPT.to_string(),
            id: new_activity_id(actor_id),
            actor: actor_id.to_string(),
            object: object_id.to_string(),
            published: Some(now_rfc3339()),
            to: vec![remote_actor_id.to_string()],
            cc: Vec::new(),
        }
    }
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

// =============================================================================
// Objects
// =============================================================================

/// An ActivityStreams Note
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    #[serde(rename = "@context", default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Context>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub id: String,
    #[serde(
        rename = "attributedTo",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub attributed_to: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub published: String,
    #[serde(default, deserialize_with = "one_or_many")]
    pub to: Vec<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub cc: Vec<String>,
}

impl Note {
    /// A freshly authored note with a server-assigned ID and publish time
    ///
    /// The ID is `{actor_id}/notes/{ulid}`; the ULID doubles as the note's
    /// record ID.
    pub fn new(actor_id: &str, content: String, to: Vec<String>, cc: Vec<String>) -> Self {
        Note {
            context: Some(Context::activity_streams()),
            kind: NOTE.to_string(),
            id: format!("{}/notes/{}", actor_id, EntityId::new().0),
            attributed_to: actor_id.to_string(),
            content,
            published: now_rfc3339(),
            to,
            cc,
        }
    }
}

/// An actor's published RSA key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKey {
    pub id: String,
    #[serde(default)]
    pub owner: String,
    pub public_key_pem: String,
}

/// Profile image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Image {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub url: String,
}

/// An ActivityPub actor document
///
/// Remote documents vary a lot, so everything except `id` is optional on
/// the way in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
    #[serde(rename = "@context", default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Context>,
    #[serde(rename = "type", default)]
    pub kind: String,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inbox: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outbox: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub following: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub followers: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<Image>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<PublicKey>,
}

impl Actor {
    /// Inbox URL if the actor publishes a usable one
    pub fn inbox_url(&self) -> Option<&str> {
        self.inbox.as_deref().map(str::trim).filter(|inbox| !inbox.is_empty())
    }
}

/// An ActivityStreams OrderedCollection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderedCollection<T> {
    #[serde(rename = "@context")]
    pub context: Context,
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub total_items: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last: Option<String>,
    #[serde(default = "Vec::new", skip_serializing_if = "Vec::is_empty")]
    pub ordered_items: Vec<T>,
}

impl<T> OrderedCollection<T> {
    pub fn new(id: String, items: Vec<T>) -> Self {
        OrderedCollection {
            context: Context::activity_streams(),
            id,
            kind: "OrderedCollection".to_string(),
            total_items: items.len(),
            first: None,
            last: None,
            ordered_items: items,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn context_accepts_single_string() {
        let context: Context = serde_json::from_value(json!(ACTIVITY_STREAMS_CONTEXT)).unwrap();
        assert!(context.contains(ACTIVITY_STREAMS_CONTEXT));
        assert_eq!(
            serde_json::to_value(&context).unwrap(),
            json!(ACTIVITY_STREAMS_CONTEXT)
        );
    }

    #[test]
    fn context_mixed_array_round_trips_and_stays_searchable() {
        let raw = json!([
            ACTIVITY_STREAMS_CONTEXT,
            SECURITY_CONTEXT,
            {"manuallyApprovesFollowers": "as:manuallyApprovesFollowers", "toot": "http://joinmastodon.org/ns#"}
        ]);
        let context: Context = serde_json::from_value(raw.clone()).unwrap();

        assert!(context.contains(ACTIVITY_STREAMS_CONTEXT));
        assert!(context.contains(SECURITY_CONTEXT));
        assert!(!context.contains("http://joinmastodon.org/ns#"));

        let reencoded = serde_json::to_value(&context).unwrap();
        assert_eq!(reencoded, raw);
        let again: Context = serde_json::from_value(reencoded).unwrap();
        assert!(again.contains(SECURITY_CONTEXT));
    }

    #[test]
    fn context_object_is_tolerated() {
        let context: Context = serde_json::from_value(json!({"@vocab": "https://x/"})).unwrap();
        assert!(!context.contains(ACTIVITY_STREAMS_CONTEXT));
        assert_eq!(context.primary_iri(), None);
    }

    #[test]
    fn actor_ref_accepts_string_and_embedded_object() {
        let bare: ActivityEnvelope = serde_json::from_value(json!({
            "type": "Follow", "id": "https://x/1", "actor": "https://x/alice"
        }))
        .unwrap();
        let embedded: ActivityEnvelope = serde_json::from_value(json!({
            "type": "Follow", "id": "https://x/1", "actor": {"id": "https://x/alice", "type": "Person"}
        }))
        .unwrap();

        assert_eq!(bare.actor_id(), Some("https://x/alice"));
        assert_eq!(embedded.actor_id(), Some("https://x/alice"));
    }

    #[test]
    fn actor_ref_other_shapes_decode_without_id() {
        let envelope: ActivityEnvelope = serde_json::from_value(json!({
            "type": "Follow", "id": "https://x/1", "actor": ["https://x/alice"]
        }))
        .unwrap();
        assert_eq!(envelope.actor_id(), None);

        let nameless: ActivityEnvelope = serde_json::from_value(json!({
            "type": "Follow", "id": "https://x/1", "actor": {"name": "alice"}
        }))
        .unwrap();
        assert_eq!(nameless.actor_id(), None);
    }

    #[test]
    fn undo_decodes_embedded_follow() {
        let envelope: ActivityEnvelope = serde_json::from_value(json!({
            "type": "Undo",
            "id": "https://x/undo/1",
            "actor": "https://x/alice",
            "object": {"type": "Follow", "id": "https://x/follow/1", "actor": "https://x/alice", "object": "https://local/~me"}
        }))
        .unwrap();

        match envelope.decode().unwrap() {
            TypedActivity::Undo(inner) => {
                assert_eq!(inner.kind, FOLLOW);
                assert_eq!(inner.actor_id(), Some("https://x/alice"));
            }
            other => panic!("expected undo, got {other:?}"),
        }
    }

    #[test]
    fn undo_with_bare_object_id_is_rejected() {
        let envelope: ActivityEnvelope = serde_json::from_value(json!({
            "type": "Undo", "id": "https://x/undo/1", "actor": "https://x/alice", "object": "https://x/follow/1"
        }))
        .unwrap();
        assert!(matches!(envelope.decode(), Err(AppError::Validation(_))));
    }

    #[test]
    fn unknown_types_decode_as_other() {
        let envelope: ActivityEnvelope =
            serde_json::from_value(json!({"type": "Like", "id": "https://x/like/1"})).unwrap();
        assert_eq!(
            envelope.decode().unwrap(),
            TypedActivity::Other("Like".to_string())
        );
    }

    #[test]
    fn addresses_accept_single_string() {
        let note: Note = serde_json::from_value(json!({
            "type": "Note", "content": "hi", "to": PUBLIC_ADDRESS
        }))
        .unwrap();
        assert_eq!(note.to, vec![PUBLIC_ADDRESS.to_string()]);
        assert!(note.cc.is_empty());
    }

    #[test]
    fn create_wraps_note_with_same_addressing() {
        let actor = "https://pub.example.com/~alice";
        let note = Note::new(
            actor,
            "hello".to_string(),
            vec![PUBLIC_ADDRESS.to_string()],
            vec![format!("{actor}/followers")],
        );
        let activity = Activity::create(actor, note.clone());

        assert_eq!(activity.kind, CREATE);
        assert!(activity.id.starts_with("https://pub.example.com/~alice/activities/"));
        assert!(note.id.starts_with("https://pub.example.com/~alice/notes/"));
        assert_eq!(activity.to, note.to);
        assert_eq!(activity.published.as_deref(), Some(note.published.as_str()));
    }

    #[test]
    fn ordered_collection_omits_empty_items() {
        let collection: OrderedCollection<String> =
            OrderedCollection::new("https://x/~a/following".to_string(), Vec::new());
        let value = serde_json::to_value(&collection).unwrap();
        assert_eq!(value["totalItems"], 0);
        assert!(value.get("orderedItems").is_none());
        assert_eq!(value["type"], "OrderedCollection");
    }

    #[test]
    fn remote_actor_without_inbox_has_no_inbox_url() {
        let actor: Actor =
            serde_json::from_value(json!({"id": "https://x/alice", "type": "Person", "inbox": ""}))
                .unwrap();
        assert_eq!(actor.inbox_url(), None);
    }
}
