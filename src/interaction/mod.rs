//! Follow-up actions on generated images: upscale, rerun, delete.

use crate::config::PermissionsConfig;
use crate::dispatch::{GenerationDispatcher, GenerationRecord, RecordId};
use crate::error::{BotError, BotResult};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Records kept for follow-up actions; older results stop offering them.
pub const MAX_RECORDS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InteractionKind {
    Upscale,
    Rerun,
    Delete,
}

impl fmt::Display for InteractionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Upscale => "upscale",
            Self::Rerun => "rerun",
            Self::Delete => "delete",
        })
    }
}

impl FromStr for InteractionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "upscale" => Ok(Self::Upscale),
            "rerun" => Ok(Self::Rerun),
            "delete" => Ok(Self::Delete),
            other => Err(format!("unknown action '{other}'")),
        }
    }
}

/// Whoever triggered an event, with the platform roles they hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub id: String,
    pub name: String,
    pub roles: Vec<String>,
}

pub trait Permissions: Send + Sync {
    fn is_moderator(&self, actor: &Actor) -> bool;

    fn can_generate(&self, actor: &Actor) -> bool;
}

/// Capabilities derived from configured role ids.
#[derive(Debug, Clone, Default)]
pub struct RolePermissions {
    moderator_roles: HashSet<String>,
    /// Empty means everyone may generate
    generation_roles: HashSet<String>,
}

impl RolePermissions {
    pub fn from_config(config: &PermissionsConfig) -> Self {
        Self {
            moderator_roles: config.moderator_role_ids.iter().cloned().collect(),
            generation_roles: config.generation_role_ids.iter().cloned().collect(),
        }
    }
}

impl Permissions for RolePermissions {
    fn is_moderator(&self, actor: &Actor) -> bool {
        actor.roles.iter().any(|r| self.moderator_roles.contains(r))
    }

    fn can_generate(&self, actor: &Actor) -> bool {
        self.generation_roles.is_empty()
            || actor.roles.iter().any(|r| self.generation_roles.contains(r))
    }
}

#[derive(Debug, Clone)]
pub enum InteractionOutcome {
    /// A new result to render with its own controls
    Generated(GenerationRecord),
    /// The result message should be removed
    Deleted(RecordId),
}

#[derive(Default)]
struct RecordStore {
    records: HashMap<RecordId, GenerationRecord>,
    order: VecDeque<RecordId>,
}

pub struct InteractionRouter {
    dispatcher: Arc<GenerationDispatcher>,
    permissions: Arc<dyn Permissions>,
    store: Mutex<RecordStore>,
}

impl InteractionRouter {
    pub fn new(dispatcher: Arc<GenerationDispatcher>, permissions: Arc<dyn Permissions>) -> Self {
        Self {
            dispatcher,
            permissions,
            store: Mutex::new(RecordStore::default()),
        }
    }

    pub fn permissions(&self) -> &dyn Permissions {
        self.permissions.as_ref()
    }

    /// Keep a fresh result so its controls can act on it.
    pub fn register(&self, record: GenerationRecord) {
        let mut store = self.store.lock();
        store.order.push_back(record.id.clone());
        store.records.insert(record.id.clone(), record);
        while store.order.len() > MAX_RECORDS {
            if let Some(old) = store.order.pop_front() {
                store.records.remove(&old);
            }
        }
    }

    pub fn get(&self, id: &RecordId) -> Option<GenerationRecord> {
        self.store.lock().records.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.store.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Actions offered on a result; upscale is left out once applied.
    pub fn controls_for(record: &GenerationRecord) -> Vec<InteractionKind> {
        let mut controls = Vec::with_capacity(3);
        if !record.request.upscale {
            controls.push(InteractionKind::Upscale);
        }
        controls.push(InteractionKind::Rerun);
        controls.push(InteractionKind::Delete);
        controls
    }

    pub async fn handle(
        &self,
        kind: InteractionKind,
        id: &RecordId,
        actor: &Actor,
    ) -> BotResult<InteractionOutcome> {
        let record = self
            .get(id)
            .ok_or_else(|| BotError::RecordNotFound(id.to_string()))?;
        tracing::info!(record = %id, actor = %actor.id, action = %kind, "interaction");

        match kind {
            InteractionKind::Delete => self.delete(&record, actor),
            InteractionKind::Upscale => {
                if record.request.upscale {
                    return Err(BotError::ActionUnavailable(
                        "this image is already upscaled".into(),
                    ));
                }
                let request = record.request.upscaled(record.seed);
                self.redispatch(request, actor).await
            }
            InteractionKind::Rerun => {
                let request = record.request.rerolled();
                self.redispatch(request, actor).await
            }
        }
    }

    fn delete(&self, record: &GenerationRecord, actor: &Actor) -> BotResult<InteractionOutcome> {
        if actor.id != record.requester && !self.permissions.is_moderator(actor) {
            tracing::warn!(record = %record.id, actor = %actor.id, "delete refused");
            return Err(BotError::Authorization(actor.id.clone()));
        }
        let mut store = self.store.lock();
        store.records.remove(&record.id);
        store.order.retain(|id| id != &record.id);
        Ok(InteractionOutcome::Deleted(record.id.clone()))
    }

    async fn redispatch(
        &self,
        request: crate::prompt::GenerationRequest,
        actor: &Actor,
    ) -> BotResult<InteractionOutcome> {
        let record = self.dispatcher.dispatch(request, &actor.id).await?;
        self.register(record.clone());
        Ok(InteractionOutcome::Generated(record))
    }
}
