//! Directory of entities authorized to open a session (§4.4 "the server
//! looks the entity id up against a directory of authorized entities").
//! Loading this from a config file or the data service's own settings store
//! is out of scope (§6 "CLI, environment, config files"); callers populate
//! it directly, e.g. from a fixture in tests or a startup routine that reads
//! it from wherever the deployment keeps it.

use hashbrown::HashMap;

use agentd_crypto::PublicKey;
use agentd_types::EntityId;

#[derive(Default)]
pub struct EntityDirectory {
    entries: HashMap<EntityId, PublicKey>,
}

impl EntityDirectory {
    pub fn new() -> EntityDirectory {
        EntityDirectory::default()
    }

    pub fn register(&mut self, entity_id: EntityId, public_key: PublicKey) {
        self.entries.insert(entity_id, public_key);
    }

    pub fn lookup(&self, entity_id: EntityId) -> Option<&PublicKey> {
        self.entries.get(&entity_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_entity_is_not_found() {
        let directory = EntityDirectory::new();
        assert!(directory.lookup(EntityId::random()).is_none());
    }

    #[test]
    fn registered_entity_is_found() {
        let mut directory = EntityDirectory::new();
        let id = EntityId::random();
        let key = agentd_crypto::generate_keypair().public;
        directory.register(id, key);
        assert!(directory.lookup(id).is_some());
    }
}
