//! In-memory [`ClusterStore`] used by synchronizer, discovery and status tests
//!
//! Mimics the API-server behavior the syncer depends on: resourceVersion
//! preconditions, generation bumps on spec changes only, a status
//! subresource that ignores everything but `status`, and watch streams that
//! replay current state before live events. Faults can be injected per
//! operation.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::DynamicObject;
use kube::core::ErrorResponse;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use tether_common::{Error, ObjectKey, ResourceType, Result};

use super::{selector_matches, ClusterStore, Side};

/// Operation a fault applies to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    Get,
    List,
    Create,
    Replace,
    ReplaceStatus,
    Delete,
}

/// Injected failure
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fault {
    /// HTTP 409
    Conflict,
    /// Connection failure
    Transient,
    /// HTTP 422
    Invalid,
    /// HTTP 403
    Forbidden,
}

impl Fault {
    fn to_error(self, side: Side) -> Error {
        let api = |code: u16, reason: &str| {
            Error::from(kube::Error::Api(ErrorResponse {
                status: "Failure".to_string(),
                message: format!("injected {}", reason),
                reason: reason.to_string(),
                code,
            }))
        };
        match self {
            Fault::Conflict => api(409, "Conflict"),
            Fault::Transient => Error::connectivity(side.to_string(), "connection refused"),
            Fault::Invalid => api(422, "Invalid"),
            Fault::Forbidden => api(403, "Forbidden"),
        }
    }
}

type StoreKey = (String, ObjectKey);

#[derive(Default)]
struct State {
    objects: BTreeMap<StoreKey, DynamicObject>,
    next_rv: u64,
    next_uid: u64,
    faults: VecDeque<(Op, Fault)>,
    unreachable: bool,
    served: Vec<ResourceType>,
    namespaces: BTreeSet<String>,
    writes: u64,
    no_generation: bool,
}

impl State {
    fn bump_rv(&mut self) -> String {
        self.next_rv += 1;
        self.next_rv.to_string()
    }

    /// Generation after a write; `None` for types the server does not version
    fn generation(&self, stored: Option<i64>, spec_changed: bool) -> Option<i64> {
        if self.no_generation {
            return None;
        }
        match stored {
            None => Some(1),
            Some(g) if spec_changed => Some(g + 1),
            Some(g) => Some(g),
        }
    }

    fn check(&mut self, side: Side, op: Op) -> Result<()> {
        if self.unreachable {
            return Err(Fault::Transient.to_error(side));
        }
        if let Some(pos) = self.faults.iter().position(|(o, _)| *o == op) {
            if let Some((_, fault)) = self.faults.remove(pos) {
                return Err(fault.to_error(side));
            }
        }
        Ok(())
    }
}

/// In-memory cluster
pub struct MemoryStore {
    side: Side,
    state: Mutex<State>,
    events: broadcast::Sender<(String, DynamicObject)>,
}

fn type_key(rt: &ResourceType) -> String {
    format!("{}/{}", rt.api_version(), rt.kind)
}

fn spec_part(obj: &DynamicObject) -> serde_json::Value {
    let mut data = obj.data.clone();
    if let Some(map) = data.as_object_mut() {
        map.remove("status");
    }
    data
}

fn api_error(code: u16, reason: &str, message: String) -> Error {
    Error::from(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message,
        reason: reason.to_string(),
        code,
    }))
}

impl MemoryStore {
    pub fn new(side: Side) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            side,
            state: Mutex::new(State::default()),
            events,
        }
    }

    /// Types reported by `served_types`
    pub fn with_types(self, types: Vec<ResourceType>) -> Self {
        self.state.lock().served = types;
        self
    }

    /// Never set `metadata.generation`, like ConfigMap or Secret on a real
    /// API server
    pub fn without_generation(self) -> Self {
        self.state.lock().no_generation = true;
        self
    }

    pub fn set_served_types(&self, types: Vec<ResourceType>) {
        self.state.lock().served = types;
    }

    /// Fail the next call of `op` with `fault`
    pub fn inject(&self, op: Op, fault: Fault) {
        self.state.lock().faults.push_back((op, fault));
    }

    /// Fail every call while set
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unreachable = unreachable;
    }

    /// Successful writes issued through the trait
    pub fn write_count(&self) -> u64 {
        self.state.lock().writes
    }

    pub fn object(&self, rt: &ResourceType, key: &ObjectKey) -> Option<DynamicObject> {
        self.state
            .lock()
            .objects
            .get(&(type_key(rt), key.clone()))
            .cloned()
    }

    pub fn objects(&self, rt: &ResourceType) -> Vec<DynamicObject> {
        let tk = type_key(rt);
        self.state
            .lock()
            .objects
            .iter()
            .filter(|((t, _), _)| *t == tk)
            .map(|(_, o)| o.clone())
            .collect()
    }

    pub fn has_namespace(&self, name: &str) -> bool {
        self.state.lock().namespaces.contains(name)
    }

    /// Out-of-band create (a user or another controller)
    pub fn insert(&self, rt: &ResourceType, mut obj: DynamicObject) -> DynamicObject {
        let stored = {
            let mut state = self.state.lock();
            state.next_uid += 1;
            obj.metadata.uid = Some(format!("uid-{}", state.next_uid));
            obj.metadata.resource_version = Some(state.bump_rv());
            obj.metadata.generation = state.generation(None, true);
            obj.metadata.creation_timestamp = Some(Time(chrono::Utc::now()));
            state
                .objects
                .insert((type_key(rt), ObjectKey::of(&obj)), obj.clone());
            obj
        };
        let _ = self.events.send((type_key(rt), stored.clone()));
        stored
    }

    /// Out-of-band edit; bumps generation when anything outside status changed
    pub fn edit(
        &self,
        rt: &ResourceType,
        key: &ObjectKey,
        f: impl FnOnce(&mut DynamicObject),
    ) -> Option<DynamicObject> {
        let updated = {
            let mut state = self.state.lock();
            let sk = (type_key(rt), key.clone());
            let mut obj = state.objects.get(&sk)?.clone();
            let before = spec_part(&obj);
            f(&mut obj);
            obj.metadata.generation =
                state.generation(obj.metadata.generation, spec_part(&obj) != before);
            obj.metadata.resource_version = Some(state.bump_rv());
            state.objects.insert(sk, obj.clone());
            obj
        };
        let _ = self.events.send((type_key(rt), updated.clone()));
        Some(updated)
    }

    /// Out-of-band status write (the physical cluster's own controllers)
    pub fn set_status(
        &self,
        rt: &ResourceType,
        key: &ObjectKey,
        status: serde_json::Value,
    ) -> Option<DynamicObject> {
        let updated = {
            let mut state = self.state.lock();
            let sk = (type_key(rt), key.clone());
            let mut obj = state.objects.get(&sk)?.clone();
            obj.data["status"] = status;
            obj.metadata.resource_version = Some(state.bump_rv());
            state.objects.insert(sk, obj.clone());
            obj
        };
        let _ = self.events.send((type_key(rt), updated.clone()));
        Some(updated)
    }

    /// Out-of-band delete
    pub fn remove(&self, rt: &ResourceType, key: &ObjectKey) -> Option<DynamicObject> {
        let removed = self.state.lock().objects.remove(&(type_key(rt), key.clone()))?;
        let _ = self.events.send((type_key(rt), removed.clone()));
        Some(removed)
    }

    fn precondition(stored: &DynamicObject, requested: Option<&str>, key: &ObjectKey) -> Result<()> {
        match requested {
            Some(rv) if stored.metadata.resource_version.as_deref() != Some(rv) => Err(api_error(
                409,
                "Conflict",
                format!("{}: resourceVersion {} is stale", key, rv),
            )),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl ClusterStore for MemoryStore {
    fn side(&self) -> Side {
        self.side
    }

    async fn get(&self, rt: &ResourceType, key: &ObjectKey) -> Result<Option<DynamicObject>> {
        let mut state = self.state.lock();
        state.check(self.side, Op::Get)?;
        Ok(state.objects.get(&(type_key(rt), key.clone())).cloned())
    }

    async fn list(&self, rt: &ResourceType, selector: &str) -> Result<Vec<DynamicObject>> {
        let mut state = self.state.lock();
        state.check(self.side, Op::List)?;
        let tk = type_key(rt);
        Ok(state
            .objects
            .iter()
            .filter(|((t, _), o)| *t == tk && selector_matches(selector, o))
            .map(|(_, o)| o.clone())
            .collect())
    }

    async fn create(&self, rt: &ResourceType, obj: &DynamicObject) -> Result<DynamicObject> {
        let created = {
            let mut state = self.state.lock();
            state.check(self.side, Op::Create)?;
            let key = ObjectKey::of(obj);
            let sk = (type_key(rt), key.clone());
            if state.objects.contains_key(&sk) {
                return Err(api_error(409, "AlreadyExists", format!("{} already exists", key)));
            }
            if let Some(ns) = &key.namespace {
                if self.side == Side::Physical && !state.namespaces.contains(ns) {
                    return Err(api_error(404, "NotFound", format!("namespace {} not found", ns)));
                }
            }
            let mut created = obj.clone();
            state.next_uid += 1;
            created.metadata.uid = Some(format!("uid-{}", state.next_uid));
            created.metadata.resource_version = Some(state.bump_rv());
            created.metadata.generation = state.generation(None, true);
            created.metadata.creation_timestamp = Some(Time(chrono::Utc::now()));
            state.objects.insert(sk, created.clone());
            state.writes += 1;
            created
        };
        let _ = self.events.send((type_key(rt), created.clone()));
        Ok(created)
    }

    async fn replace(&self, rt: &ResourceType, obj: &DynamicObject) -> Result<DynamicObject> {
        let replaced = {
            let mut state = self.state.lock();
            state.check(self.side, Op::Replace)?;
            let key = ObjectKey::of(obj);
            let sk = (type_key(rt), key.clone());
            let stored = state
                .objects
                .get(&sk)
                .cloned()
                .ok_or_else(|| api_error(404, "NotFound", format!("{} not found", key)))?;
            Self::precondition(&stored, obj.metadata.resource_version.as_deref(), &key)?;

            let mut replaced = obj.clone();
            if rt.status_subresource {
                match stored.data.get("status") {
                    Some(status) => replaced.data["status"] = status.clone(),
                    None => {
                        if let Some(map) = replaced.data.as_object_mut() {
                            map.remove("status");
                        }
                    }
                }
            }
            replaced.metadata.uid = stored.metadata.uid.clone();
            replaced.metadata.creation_timestamp = stored.metadata.creation_timestamp.clone();
            replaced.metadata.generation = state.generation(
                stored.metadata.generation,
                spec_part(&replaced) != spec_part(&stored),
            );
            replaced.metadata.resource_version = Some(state.bump_rv());
            state.objects.insert(sk, replaced.clone());
            state.writes += 1;
            replaced
        };
        let _ = self.events.send((type_key(rt), replaced.clone()));
        Ok(replaced)
    }

    async fn replace_status(
        &self,
        rt: &ResourceType,
        obj: &DynamicObject,
    ) -> Result<DynamicObject> {
        let updated = {
            let mut state = self.state.lock();
            state.check(self.side, Op::ReplaceStatus)?;
            let key = ObjectKey::of(obj);
            let sk = (type_key(rt), key.clone());
            let mut stored = state
                .objects
                .get(&sk)
                .cloned()
                .ok_or_else(|| api_error(404, "NotFound", format!("{} not found", key)))?;
            Self::precondition(&stored, obj.metadata.resource_version.as_deref(), &key)?;

            match obj.data.get("status") {
                Some(status) => stored.data["status"] = status.clone(),
                None => {
                    if let Some(map) = stored.data.as_object_mut() {
                        map.remove("status");
                    }
                }
            }
            stored.metadata.resource_version = Some(state.bump_rv());
            state.objects.insert(sk, stored.clone());
            state.writes += 1;
            stored
        };
        let _ = self.events.send((type_key(rt), updated.clone()));
        Ok(updated)
    }

    async fn delete(
        &self,
        rt: &ResourceType,
        key: &ObjectKey,
        resource_version: Option<&str>,
    ) -> Result<()> {
        let removed = {
            let mut state = self.state.lock();
            state.check(self.side, Op::Delete)?;
            let sk = (type_key(rt), key.clone());
            let Some(stored) = state.objects.get(&sk).cloned() else {
                return Ok(());
            };
            Self::precondition(&stored, resource_version, key)?;
            state.objects.remove(&sk);
            state.writes += 1;
            stored
        };
        let _ = self.events.send((type_key(rt), removed));
        Ok(())
    }

    async fn ensure_namespace(&self, name: &str, _labels: &[(&str, &str)]) -> Result<()> {
        let mut state = self.state.lock();
        state.check(self.side, Op::Create)?;
        state.namespaces.insert(name.to_string());
        Ok(())
    }

    fn watch(&self, rt: &ResourceType, selector: &str) -> BoxStream<'static, Result<DynamicObject>> {
        let tk = type_key(rt);
        let selector = selector.to_string();
        let live = BroadcastStream::new(self.events.subscribe());

        let initial: Vec<DynamicObject> = self
            .state
            .lock()
            .objects
            .iter()
            .filter(|((t, _), o)| *t == tk && selector_matches(&selector, o))
            .map(|(_, o)| o.clone())
            .collect();

        let live = live.filter_map(move |event| {
            let item = match event {
                Ok((t, obj)) if t == tk && selector_matches(&selector, &obj) => Some(Ok(obj)),
                _ => None,
            };
            futures::future::ready(item)
        });

        futures::stream::iter(initial.into_iter().map(Ok))
            .chain(live)
            .boxed()
    }

    async fn probe(&self) -> Result<String> {
        if self.state.lock().unreachable {
            return Err(Fault::Transient.to_error(self.side));
        }
        Ok("v1.32.0".to_string())
    }

    async fn served_types(&self) -> Result<Vec<ResourceType>> {
        let state = self.state.lock();
        if state.unreachable {
            return Err(Fault::Transient.to_error(self.side));
        }
        Ok(state.served.clone())
    }
}
