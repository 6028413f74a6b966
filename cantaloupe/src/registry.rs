use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use cantaloupe_proto::{ClientId, Subject};

use crate::sub::Subscription;

/// Thread safe map of connected clients
///
/// The registry lock only guards the id map; each client record has
/// its own lock for its subscription list and heartbeat counter, and
/// neither lock is ever held across a bus or store callout.
#[derive(Debug, Default)]
pub(crate) struct ClientRegistry {
    clients: Mutex<HashMap<ClientId, Arc<Client>>>,
}

/// One connected client
#[derive(Debug)]
pub(crate) struct Client {
    pub(crate) id: ClientId,
    pub(crate) hb_inbox: Subject,
    state: Mutex<ClientState>,
}

#[derive(Debug, Default)]
struct ClientState {
    subs: Vec<Arc<Subscription>>,
    failed_heartbeats: u32,
}

impl ClientRegistry {
    fn lock(&self) -> MutexGuard<'_, HashMap<ClientId, Arc<Client>>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new client, failing with the existing record if the
    /// id is taken
    pub(crate) fn register(
        &self,
        id: ClientId,
        hb_inbox: Subject,
    ) -> Result<Arc<Client>, Arc<Client>> {
        let mut clients = self.lock();
        if let Some(existing) = clients.get(&id) {
            return Err(Arc::clone(existing));
        }

        let client = Arc::new(Client {
            id: id.clone(),
            hb_inbox,
            state: Mutex::new(ClientState::default()),
        });
        clients.insert(id, Arc::clone(&client));
        Ok(client)
    }

    pub(crate) fn unregister(&self, id: &ClientId) -> Option<Arc<Client>> {
        self.lock().remove(id)
    }

    pub(crate) fn lookup(&self, id: &ClientId) -> Option<Arc<Client>> {
        self.lock().get(id).map(Arc::clone)
    }

    pub(crate) fn list(&self) -> Vec<Arc<Client>> {
        self.lock().values().map(Arc::clone).collect()
    }

    pub(crate) fn ids(&self) -> Vec<ClientId> {
        let mut ids = self.lock().keys().cloned().collect::<Vec<_>>();
        ids.sort();
        ids
    }

    pub(crate) fn count(&self) -> usize {
        self.lock().len()
    }
}

impl Client {
    fn lock(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn add_sub(&self, sub: Arc<Subscription>) {
        self.lock().subs.push(sub);
    }

    pub(crate) fn remove_sub(&self, sub_id: u64) {
        self.lock().subs.retain(|sub| sub.id != sub_id);
    }

    pub(crate) fn subs(&self) -> Vec<Arc<Subscription>> {
        self.lock().subs.clone()
    }

    /// Record a missed heartbeat, returning the new consecutive count
    pub(crate) fn heartbeat_missed(&self) -> u32 {
        let mut state = self.lock();
        state.failed_heartbeats += 1;
        state.failed_heartbeats
    }

    pub(crate) fn heartbeat_ok(&self) {
        self.lock().failed_heartbeats = 0;
    }
}

#[cfg(test)]
mod tests {
    use cantaloupe_proto::{ClientId, Subject};
    use claims::{assert_none, assert_ok, assert_some};

    use super::ClientRegistry;

    fn id(s: &'static str) -> ClientId {
        ClientId::from_static(s)
    }

    #[test]
    fn register_is_exclusive() {
        let registry = ClientRegistry::default();

        let first = assert_ok!(registry.register(id("me"), Subject::from_static("_INBOX.a")));
        let existing = registry
            .register(id("me"), Subject::from_static("_INBOX.b"))
            .unwrap_err();
        assert_eq!("_INBOX.a", existing.hb_inbox.as_str());
        assert_eq!(first.id, existing.id);
        assert_eq!(1, registry.count());
    }

    #[test]
    fn unregister_frees_the_id() {
        let registry = ClientRegistry::default();

        assert_ok!(registry.register(id("me"), Subject::from_static("_INBOX.a")));
        assert_some!(registry.unregister(&id("me")));
        assert_none!(registry.lookup(&id("me")));
        assert_ok!(registry.register(id("me"), Subject::from_static("_INBOX.b")));
    }

    #[test]
    fn heartbeat_counter() {
        let registry = ClientRegistry::default();
        let client = assert_ok!(registry.register(id("me"), Subject::from_static("_INBOX.a")));

        assert_eq!(1, client.heartbeat_missed());
        assert_eq!(2, client.heartbeat_missed());
        client.heartbeat_ok();
        assert_eq!(1, client.heartbeat_missed());
    }
}
