//! Aggregation of many subscribers into Klippy's single object subscription.
//!
//! Klippy keeps one subscription per client connection and each
//! `objects/subscribe` call replaces it. The bridge therefore keeps every
//! subscriber's request, sends the merge of all of them upstream, and prunes
//! each status push back down to what an individual subscriber asked for.
//!
//! Merge rule, per object: the union of requested fields, except that a
//! single "all fields" request (`null` on the wire) makes the merged entry
//! "all fields" no matter what anyone else asked for. The merge is always
//! recomputed from scratch over every request rather than updated
//! incrementally.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    fmt,
    result::Result as StdResult,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use klippy_protocol::StatusPayload;
use parking_lot::Mutex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use tokio::sync::{
    Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard,
    mpsc::{self, UnboundedReceiver, UnboundedSender},
};
use tracing::{debug, trace};

use crate::{Error, Result};

/// Fields requested for one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldSet {
    /// Every field of the object.
    All,
    /// Only the named fields.
    Fields(BTreeSet<String>),
}

impl Serialize for FieldSet {
    fn serialize<S: Serializer>(&self, s: S) -> StdResult<S::Ok, S::Error> {
        match self {
            Self::All => s.serialize_none(),
            Self::Fields(fields) => fields.serialize(s),
        }
    }
}

impl<'de> Deserialize<'de> for FieldSet {
    fn deserialize<D: Deserializer<'de>>(d: D) -> StdResult<Self, D::Error> {
        Ok(match Option::<BTreeSet<String>>::deserialize(d)? {
            None => Self::All,
            Some(fields) => Self::Fields(fields),
        })
    }
}

/// Object name → requested fields, as sent in `objects/subscribe`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectRequest(BTreeMap<String, FieldSet>);

impl ObjectRequest {
    /// An empty request.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request every field of `object`.
    pub fn with_all(mut self, object: impl Into<String>) -> Self {
        self.0.insert(object.into(), FieldSet::All);
        self
    }

    /// Request the given fields of `object`, replacing any earlier entry.
    pub fn with_fields<I, S>(mut self, object: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let fields = fields.into_iter().map(Into::into).collect();
        self.0.insert(object.into(), FieldSet::Fields(fields));
        self
    }

    /// Parse the `objects` argument of a subscribe request.
    pub fn from_json(value: &Value) -> Result<Self> {
        serde_json::from_value(value.clone())
            .map_err(|e| Error::InvalidParams(format!("invalid objects request: {e}")))
    }

    /// Render as the `objects` argument of a subscribe request.
    pub fn to_json(&self) -> Value {
        let map = self
            .0
            .iter()
            .map(|(name, fields)| {
                let v = match fields {
                    FieldSet::All => Value::Null,
                    FieldSet::Fields(f) => Value::from(f.iter().cloned().collect::<Vec<_>>()),
                };
                (name.clone(), v)
            })
            .collect();
        Value::Object(map)
    }

    /// Requested fields for `object`, if any.
    pub fn get(&self, object: &str) -> Option<&FieldSet> {
        self.0.get(object)
    }

    /// True when no object is requested.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate `(object, fields)` pairs in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldSet)> {
        self.0.iter()
    }

    /// Merge any number of requests.
    ///
    /// First pass finds every object somebody wants in full; second pass
    /// unions field lists for the rest.
    pub fn merge<'a, I>(requests: I) -> Self
    where
        I: IntoIterator<Item = &'a ObjectRequest>,
        I::IntoIter: Clone,
    {
        let requests = requests.into_iter();
        let all: HashSet<&String> = requests
            .clone()
            .flat_map(|r| r.0.iter())
            .filter(|(_, f)| **f == FieldSet::All)
            .map(|(name, _)| name)
            .collect();

        let mut merged = BTreeMap::new();
        for (name, fields) in requests.flat_map(|r| r.0.iter()) {
            if all.contains(name) {
                merged.insert(name.clone(), FieldSet::All);
                continue;
            }
            if let FieldSet::Fields(f) = fields {
                let entry = merged
                    .entry(name.clone())
                    .or_insert_with(|| FieldSet::Fields(BTreeSet::new()));
                if let FieldSet::Fields(acc) = entry {
                    acc.extend(f.iter().cloned());
                }
            }
        }
        Self(merged)
    }

    /// Reduce a status map to the objects and fields this request names.
    ///
    /// Objects absent from `status` get no entry, and neither do objects
    /// whose requested fields are all absent.
    pub fn prune(&self, status: &Map<String, Value>) -> Map<String, Value> {
        let mut out = Map::new();
        for (name, fields) in &self.0 {
            let Some(value) = status.get(name) else {
                continue;
            };
            match fields {
                FieldSet::All => {
                    out.insert(name.clone(), value.clone());
                }
                FieldSet::Fields(wanted) => {
                    let Value::Object(obj) = value else {
                        continue;
                    };
                    let picked: Map<String, Value> = obj
                        .iter()
                        .filter(|(k, _)| wanted.contains(*k))
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect();
                    if !picked.is_empty() {
                        out.insert(name.clone(), Value::Object(picked));
                    }
                }
            }
        }
        out
    }
}

/// Stable identity of one subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl SubscriberId {
    /// Allocate a process-unique id.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Destination for the pruned status of one subscriber.
pub trait StatusSink: Send + Sync + 'static {
    /// Identity used to replace or remove this subscriber's request.
    fn subscriber_id(&self) -> SubscriberId;

    /// Deliver one pruned update. Return `false` once the subscriber is gone;
    /// the bridge then forgets it.
    fn send_status(&self, update: StatusPayload) -> bool;
}

/// [`StatusSink`] backed by an unbounded channel.
pub struct ChannelSink {
    /// Subscriber identity.
    id: SubscriberId,
    /// Delivery channel.
    tx: UnboundedSender<StatusPayload>,
}

impl ChannelSink {
    /// Create a sink with a fresh id and the receiving end of its channel.
    pub fn new() -> (Arc<Self>, UnboundedReceiver<StatusPayload>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                id: SubscriberId::next(),
                tx,
            }),
            rx,
        )
    }
}

impl StatusSink for ChannelSink {
    fn subscriber_id(&self) -> SubscriberId {
        self.id
    }

    fn send_status(&self, update: StatusPayload) -> bool {
        self.tx.send(update).is_ok()
    }
}

/// One subscriber's current request and delivery sink.
struct Subscriber {
    /// Latest request, replaced wholesale on re-subscription.
    request: ObjectRequest,
    /// Where pruned updates go.
    sink: Arc<dyn StatusSink>,
}

/// State behind the aggregator's sync lock.
#[derive(Default)]
struct State {
    /// External subscribers.
    subscribers: HashMap<SubscriberId, Subscriber>,
    /// Objects the bridge itself needs (e.g. `webhooks`), never delivered.
    pinned: ObjectRequest,
    /// Cached merge of `pinned` and every subscriber.
    merged: ObjectRequest,
}

impl State {
    /// Recompute `merged` from scratch.
    fn remerge(&mut self) {
        let requests: Vec<&ObjectRequest> = self
            .subscribers
            .values()
            .map(|s| &s.request)
            .chain([&self.pinned])
            .collect();
        self.merged = ObjectRequest::merge(requests.iter().copied());
    }
}

/// Subscriber registry plus merge cache.
pub(crate) struct SubscriptionAggregator {
    /// Registry; never held across an await.
    state: Mutex<State>,
    /// Serializes upstream re-issues so the last request Klippy sees is
    /// always the newest merge.
    upstream: AsyncMutex<()>,
}

impl SubscriptionAggregator {
    /// No subscribers, nothing pinned.
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            upstream: AsyncMutex::new(()),
        }
    }

    /// Hold while changing requests and sending the merge upstream.
    pub(crate) async fn lock_upstream(&self) -> AsyncMutexGuard<'_, ()> {
        self.upstream.lock().await
    }

    /// Replace a subscriber's request and return the new merge.
    pub(crate) fn set(&self, sink: Arc<dyn StatusSink>, request: ObjectRequest) -> ObjectRequest {
        let mut state = self.state.lock();
        state
            .subscribers
            .insert(sink.subscriber_id(), Subscriber { request, sink });
        state.remerge();
        state.merged.clone()
    }

    /// Replace the bridge's own request and return the new merge.
    pub(crate) fn pin(&self, request: ObjectRequest) -> ObjectRequest {
        let mut state = self.state.lock();
        state.pinned = request;
        state.remerge();
        state.merged.clone()
    }

    /// Forget a subscriber. The upstream subscription is left as is.
    pub(crate) fn remove(&self, id: SubscriberId) -> bool {
        let mut state = self.state.lock();
        let removed = state.subscribers.remove(&id).is_some();
        if removed {
            state.remerge();
        }
        removed
    }

    /// Current merged request.
    #[cfg(test)]
    pub(crate) fn merged(&self) -> ObjectRequest {
        self.state.lock().merged.clone()
    }

    /// Number of external subscribers.
    pub(crate) fn len(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    /// Drop every subscriber and the pinned request.
    pub(crate) fn clear(&self) {
        let mut state = self.state.lock();
        let dropped = state.subscribers.len();
        *state = State::default();
        if dropped > 0 {
            debug!(dropped, "cleared status subscribers");
        }
    }

    /// Fan a status push out to every subscriber. Returns how many
    /// subscribers received something.
    pub(crate) fn deliver(&self, payload: &StatusPayload) -> usize {
        let outgoing: Vec<(SubscriberId, Arc<dyn StatusSink>, Map<String, Value>)> = {
            let state = self.state.lock();
            state
                .subscribers
                .iter()
                .map(|(id, sub)| (*id, sub.sink.clone(), sub.request.prune(&payload.status)))
                .filter(|(_, _, pruned)| !pruned.is_empty())
                .collect()
        };

        let mut delivered = 0;
        for (id, sink, status) in outgoing {
            let update = StatusPayload {
                eventtime: payload.eventtime,
                status,
            };
            if sink.send_status(update) {
                delivered += 1;
            } else {
                trace!(subscriber = %id, "status sink closed; dropping subscriber");
                self.remove(id);
            }
        }
        delivered
    }
}
