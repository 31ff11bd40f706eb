// Client-session identity
//
// A session node id sets the client bit, carries the gateway's own
// instance in the group field so two gateways of one deployment can never
// mint the same id, and a 24-bit counter below. The counter wraps and
// skips ids that are still live.

use crate::packet::{NodeId, MAX_SESSION_ID};
use crate::transport::Endpoint;
use std::any::Any;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;

pub fn session_to_node(gateway: NodeId, sid: u32) -> NodeId {
    let group = (gateway.instance() & 0x7F) as u8;
    NodeId::session(group, sid)
}

pub fn node_to_session(node: NodeId) -> u32 {
    node.session_id()
}

/// Per-session bookkeeping hung off the endpoint.
#[derive(Default)]
pub struct SessionUserData {
    userid: AtomicI64,
    session: AtomicU32,
}

impl SessionUserData {
    pub fn userid(&self) -> i64 {
        self.userid.load(Ordering::Relaxed)
    }

    pub fn set_userid(&self, userid: i64) {
        self.userid.store(userid, Ordering::Relaxed);
    }

    pub fn session(&self) -> u32 {
        self.session.load(Ordering::Relaxed)
    }

    pub fn set_session(&self, session: u32) {
        self.session.store(session, Ordering::Relaxed);
    }
}

/// The bookkeeping record of a session endpoint, if one was attached.
pub fn session_user_data(endpoint: &Arc<dyn Endpoint>) -> Option<Arc<SessionUserData>> {
    let data: Arc<dyn Any + Send + Sync> = endpoint.user_data()?;
    data.downcast().ok()
}

impl super::Gateway {
    /// Allocate the next session id, skipping any that is currently live.
    pub(super) fn next_session(&self) -> NodeId {
        let mut sid = self.next_sid.lock();
        loop {
            *sid += 1;
            if *sid >= MAX_SESSION_ID {
                *sid = 1;
            }
            let node = session_to_node(self.core.node(), *sid);
            if self.sessions.get(node).is_none() {
                return node;
            }
        }
    }

    /// Peak concurrent sessions; a dirty write is tolerated.
    pub(super) fn track_pcu(&self) {
        let count = (self.sessions.len() + 1) as u32;
        if count > self.pcu.load(Ordering::Relaxed) {
            self.pcu.store(count, Ordering::Relaxed);
        }
    }

    pub fn peak_sessions(&self) -> u32 {
        self.pcu.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_node_layout() {
        let gateway = NodeId::backend(0x01, 0x0003);
        let node = session_to_node(gateway, 77);
        assert!(node.is_session());
        assert_eq!(node.group(), 3);
        assert_eq!(node_to_session(node), 77);
    }

    #[test]
    fn groups_do_not_collide() {
        let a = session_to_node(NodeId::backend(1, 1), 500);
        let b = session_to_node(NodeId::backend(1, 2), 500);
        assert_ne!(a, b);
    }

    #[test]
    fn user_data_defaults() {
        let data = SessionUserData::default();
        assert_eq!(data.userid(), 0);
        data.set_userid(42);
        data.set_session(7);
        assert_eq!(data.userid(), 42);
        assert_eq!(data.session(), 7);
    }
}
