// Actor hub
// Registry of actor types and the lazily created host of every room

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use crate::api::tokens::TokenService;
use crate::engine::host::{ActorHost, HostConfig};
use crate::engine::machine::MachineDefinition;
use crate::engine::storage::SnapshotStore;
use crate::{LiveStateError, Result};

struct ActorType {
    machine: Arc<MachineDefinition>,
    store: Option<Arc<dyn SnapshotStore>>,
}

/// Every actor type served by a process and one [`ActorHost`] per room.
///
/// Hosts are created on first request for a room and live for the rest of
/// the process; there is never more than one host for the same room.
pub struct ActorHub {
    types: HashMap<String, ActorType>,
    rooms: DashMap<(String, String), Arc<ActorHost>>,
    tokens: TokenService,
    config: HostConfig,
}

impl ActorHub {
    pub fn new(tokens: TokenService, config: HostConfig) -> Self {
        Self {
            types: HashMap::new(),
            rooms: DashMap::new(),
            tokens,
            config,
        }
    }

    /// Register an actor type; `store` enables persistence for its rooms
    pub fn register(
        mut self,
        machine: MachineDefinition,
        store: Option<Arc<dyn SnapshotStore>>,
    ) -> Self {
        let actor_type = machine.actor_type().to_string();
        info!(
            "Registered actor type {} (persistence {})",
            actor_type,
            if store.is_some() { "on" } else { "off" }
        );
        self.types.insert(
            actor_type,
            ActorType {
                machine: Arc::new(machine),
                store,
            },
        );
        self
    }

    pub fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    pub fn actor_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.types.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn machine(&self, actor_type: &str) -> Option<Arc<MachineDefinition>> {
        self.types.get(actor_type).map(|t| t.machine.clone())
    }

    /// Get or create the host for a room
    pub fn host(&self, actor_type: &str, room_id: &str) -> Result<Arc<ActorHost>> {
        let registered = self
            .types
            .get(actor_type)
            .ok_or_else(|| LiveStateError::NotFound(format!("actor type {}", actor_type)))?;
        if room_id.is_empty() {
            return Err(LiveStateError::InvalidInput("room id is empty".to_string()));
        }

        let host = self
            .rooms
            .entry((actor_type.to_string(), room_id.to_string()))
            .or_insert_with(|| {
                Arc::new(ActorHost::new(
                    room_id,
                    registered.machine.clone(),
                    registered.store.clone(),
                    self.tokens.clone(),
                    self.config.clone(),
                ))
            })
            .clone();
        Ok(host)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub async fn shutdown(&self) {
        let hosts: Vec<Arc<ActorHost>> = self.rooms.iter().map(|e| e.value().clone()).collect();
        for host in hosts {
            host.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StateNode;

    fn hub() -> ActorHub {
        ActorHub::new(TokenService::new("secret"), HostConfig::default()).register(
            MachineDefinition::builder("echo", StateNode::compound("idle", [("idle", StateNode::atomic())]))
                .build(),
            None,
        )
    }

    #[test]
    fn test_one_host_per_room() {
        let hub = hub();
        let a = hub.host("echo", "r1").unwrap();
        let b = hub.host("echo", "r1").unwrap();
        let c = hub.host("echo", "r2").unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(hub.room_count(), 2);
    }

    #[test]
    fn test_unknown_type_is_not_found() {
        assert!(matches!(
            hub().host("missing", "r1"),
            Err(LiveStateError::NotFound(_))
        ));
        assert_eq!(hub().actor_types(), vec!["echo".to_string()]);
    }
}
