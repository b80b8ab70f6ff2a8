//! Versioned state container and its registered command table
//!
//! A [`Store`] holds the data fields of one state replica together with a shared
//! [`ActionTable`]. Actions never see the store directly: each dispatch hands the
//! handler an [`ActionContext`] over a working copy of the data, and only when the
//! handler returns successfully is the copy diffed against the previous state and
//! committed. A failing action therefore leaves the store untouched.

use crate::error::{ActionError, Result, SyncError};
use crate::patch::{self, ApplyReport, Patch};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Sender identity used for actions that originate from the server itself
pub const SERVER_SENDER: &str = "server";

/// Reserved key that is never treated as data
pub const ACTIONS_KEY: &str = "actions";

/// Positional arguments of one action call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args(Vec<Value>);

impl Args {
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[Value] {
        &self.0
    }

    pub fn into_inner(self) -> Vec<Value> {
        self.0
    }

    /// Decodes a required argument
    pub fn get<T: DeserializeOwned>(&self, index: usize) -> std::result::Result<T, ActionError> {
        let raw = self.0.get(index).ok_or_else(|| ActionError::InvalidArgument {
            index,
            reason: "missing".to_string(),
        })?;
        T::deserialize(raw).map_err(|e| ActionError::InvalidArgument {
            index,
            reason: e.to_string(),
        })
    }

    /// Decodes an optional argument; absent and `null` both yield `None`
    pub fn opt<T: DeserializeOwned>(
        &self,
        index: usize,
    ) -> std::result::Result<Option<T>, ActionError> {
        match self.0.get(index) {
            None | Some(Value::Null) => Ok(None),
            Some(_) => self.get(index).map(Some),
        }
    }
}

impl From<Vec<Value>> for Args {
    fn from(values: Vec<Value>) -> Self {
        Self(values)
    }
}

pub type ActionHandler = Arc<
    dyn Fn(&mut ActionContext<'_>, &Args) -> std::result::Result<(), ActionError> + Send + Sync,
>;

/// A registered handler plus its declared argument count
#[derive(Clone)]
pub struct Action {
    handler: ActionHandler,
    arity: Option<usize>,
}

impl Action {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&mut ActionContext<'_>, &Args) -> std::result::Result<(), ActionError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            handler: Arc::new(handler),
            arity: None,
        }
    }

    pub fn with_arity(mut self, arity: usize) -> Self {
        self.arity = Some(arity);
        self
    }

    pub fn arity(&self) -> Option<usize> {
        self.arity
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action").field("arity", &self.arity).finish()
    }
}

/// Name → handler registry shared by every store built from the same blueprint
#[derive(Debug, Clone, Default)]
pub struct ActionTable {
    actions: BTreeMap<String, Action>,
}

impl ActionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler that takes exactly `arity` arguments
    pub fn with<F>(mut self, name: &str, arity: usize, handler: F) -> Self
    where
        F: Fn(&mut ActionContext<'_>, &Args) -> std::result::Result<(), ActionError>
            + Send
            + Sync
            + 'static,
    {
        self.insert(name, Action::new(handler).with_arity(arity));
        self
    }

    /// Registers a handler with no arity check
    pub fn with_variadic<F>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(&mut ActionContext<'_>, &Args) -> std::result::Result<(), ActionError>
            + Send
            + Sync
            + 'static,
    {
        self.insert(name, Action::new(handler));
        self
    }

    pub fn insert(&mut self, name: &str, action: Action) {
        self.actions.insert(name.to_string(), action);
    }

    pub fn get(&self, name: &str) -> Option<&Action> {
        self.actions.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.actions.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

/// Explicit accessor object handed to every action call
///
/// Replaces captured `set`/`get` closures: the action reads the working copy
/// through [`current`](Self::current) or [`get`](Self::get) and writes through
/// [`set`](Self::set), [`merge`](Self::merge), [`mutate`](Self::mutate) or
/// [`replace`](Self::replace).
pub struct ActionContext<'a> {
    state: Value,
    sender: Option<&'a str>,
    local_client_id: Option<&'a str>,
}

impl<'a> ActionContext<'a> {
    pub fn new(state: Value, sender: Option<&'a str>, local_client_id: Option<&'a str>) -> Self {
        Self {
            state,
            sender,
            local_client_id,
        }
    }

    pub fn current(&self) -> &Value {
        &self.state
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.state.get(name)
    }

    /// Decodes a top-level field
    pub fn get<T: DeserializeOwned>(&self, name: &str) -> std::result::Result<T, ActionError> {
        let raw = self.state.get(name).ok_or_else(|| ActionError::MalformedState {
            field: name.to_string(),
            reason: "missing".to_string(),
        })?;
        T::deserialize(raw).map_err(|e| ActionError::MalformedState {
            field: name.to_string(),
            reason: e.to_string(),
        })
    }

    /// Encodes and assigns a top-level field
    pub fn set<T: Serialize>(&mut self, name: &str, value: T) -> std::result::Result<(), ActionError> {
        let encoded = serde_json::to_value(value).map_err(|e| ActionError::Failed(e.to_string()))?;
        self.data_mut()?.insert(name.to_string(), encoded);
        Ok(())
    }

    /// Shallow-assigns every field of `partial` onto the state
    pub fn merge(&mut self, partial: Value) -> std::result::Result<(), ActionError> {
        let Value::Object(fields) = partial else {
            return Err(ActionError::Failed(
                "merge expects an object of fields".to_string(),
            ));
        };
        let data = self.data_mut()?;
        for (key, value) in fields {
            if key != ACTIONS_KEY {
                data.insert(key, value);
            }
        }
        Ok(())
    }

    /// Runs an arbitrary in-place edit on the working copy
    pub fn mutate<R>(&mut self, edit: impl FnOnce(&mut Value) -> R) -> R {
        edit(&mut self.state)
    }

    pub fn replace(&mut self, state: Value) {
        self.state = state;
    }

    pub fn sender(&self) -> Option<&'a str> {
        self.sender
    }

    /// True when the call was issued by the server itself
    pub fn is_authoritative(&self) -> bool {
        self.sender == Some(SERVER_SENDER)
    }

    /// True for optimistic local calls and for network calls whose sender is `id`
    pub fn is_sender_or_local(&self, id: &str) -> bool {
        self.sender.map_or(true, |sender| sender == id)
    }

    /// The client this call acts for: its network sender, or the replica's own id locally
    pub fn acting_client(&self) -> Option<&'a str> {
        match self.sender {
            Some(SERVER_SENDER) => None,
            Some(sender) => Some(sender),
            None => self.local_client_id,
        }
    }

    pub fn into_state(self) -> Value {
        self.state
    }

    fn data_mut(&mut self) -> std::result::Result<&mut Map<String, Value>, ActionError> {
        match &mut self.state {
            Value::Object(map) => Ok(map),
            _ => Err(ActionError::MalformedState {
                field: "<root>".to_string(),
                reason: "state root is not an object".to_string(),
            }),
        }
    }
}

/// Initial data plus action table; every room instantiates its own store from it
#[derive(Debug, Clone)]
pub struct Blueprint {
    initial: Value,
    actions: Arc<ActionTable>,
}

impl Blueprint {
    pub fn new(initial: Value, actions: ActionTable) -> Self {
        Self {
            initial: strip_actions(initial),
            actions: Arc::new(actions),
        }
    }

    pub fn initial(&self) -> &Value {
        &self.initial
    }

    pub fn actions(&self) -> &Arc<ActionTable> {
        &self.actions
    }

    pub fn instantiate(&self) -> Store {
        Store::new(self.initial.clone(), Arc::clone(&self.actions))
    }
}

/// In-memory, versioned state container
#[derive(Debug, Clone)]
pub struct Store {
    data: Value,
    actions: Arc<ActionTable>,
    version: u64,
}

impl Store {
    pub fn new(initial: Value, actions: Arc<ActionTable>) -> Self {
        Self {
            data: strip_actions(initial),
            actions,
            version: 0,
        }
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    /// Full copy of the data fields, never containing action bindings
    pub fn snapshot(&self) -> Value {
        self.data.clone()
    }

    /// Bumped on every committed change
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn actions(&self) -> &ActionTable {
        &self.actions
    }

    /// Runs a named action and returns the patches it produced
    ///
    /// Unknown names and arity mismatches are rejected before the action runs.
    /// An action error discards the working copy. An action that changes
    /// nothing returns an empty list.
    pub fn dispatch_locally(
        &mut self,
        name: &str,
        args: &Args,
        sender: Option<&str>,
    ) -> Result<Vec<Patch>> {
        self.dispatch_as(name, args, sender, None)
    }

    /// Like [`dispatch_locally`](Self::dispatch_locally), exposing the replica's own id to the action
    pub fn dispatch_as(
        &mut self,
        name: &str,
        args: &Args,
        sender: Option<&str>,
        local_client_id: Option<&str>,
    ) -> Result<Vec<Patch>> {
        let action = self
            .actions
            .get(name)
            .ok_or_else(|| SyncError::UnknownAction(name.to_string()))?;

        if let Some(expected) = action.arity {
            if args.len() != expected {
                return Err(SyncError::ArityMismatch {
                    action: name.to_string(),
                    expected,
                    got: args.len(),
                });
            }
        }

        let handler = Arc::clone(&action.handler);
        let mut ctx = ActionContext::new(self.data.clone(), sender, local_client_id);
        handler(&mut ctx, args).map_err(|source| SyncError::Action {
            action: name.to_string(),
            source,
        })?;

        let after = strip_actions(ctx.into_state());
        let patches = patch::diff(&self.data, &after);
        if !patches.is_empty() {
            self.data = after;
            self.version += 1;
        }
        Ok(patches)
    }

    /// Replays a patch batch from the authoritative side
    ///
    /// Any `actions` key the batch writes, whether by full replacement or by
    /// an incremental edit, is dropped so the local bindings stay intact.
    pub fn apply_patches(&mut self, patches: &[Patch]) -> ApplyReport {
        let report = patch::apply_patches(&mut self.data, patches);
        let data = std::mem::take(&mut self.data);
        self.data = strip_actions(data);
        if report.applied > 0 {
            self.version += 1;
        }
        report
    }

    /// Replaces the data fields with a snapshot
    pub fn replace_data(&mut self, snapshot: Value) {
        self.data = strip_actions(snapshot);
        self.version += 1;
    }
}

fn strip_actions(mut value: Value) -> Value {
    if let Value::Object(map) = &mut value {
        map.remove(ACTIONS_KEY);
    }
    value
}
