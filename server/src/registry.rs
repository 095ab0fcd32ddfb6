//! §4.F Session Registry — public_port → owning client session, looked up
//! by the virtual-host router (§4.I) and the INSPECT_DATA shipper (§4.J).

use std::sync::Arc;

use dashmap::DashMap;

use crate::session::ClientSessionHandle;

#[derive(Default)]
pub struct SessionRegistry {
    by_port: DashMap<u16, Arc<ClientSessionHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, public_port: u16, session: Arc<ClientSessionHandle>) {
        self.by_port.insert(public_port, session);
    }

    pub fn unregister(&self, public_port: u16) {
        self.by_port.remove(&public_port);
    }

    pub fn get(&self, public_port: u16) -> Option<Arc<ClientSessionHandle>> {
        self.by_port.get(&public_port).map(|e| e.value().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unregister_is_idempotent() {
        let reg = SessionRegistry::new();
        reg.unregister(9001);
        assert!(reg.get(9001).is_none());
    }
}
