// Gateway message handlers: heartbeats, pings, kicks, subscriptions and
// the backend half of the login handoff.

use super::session::session_user_data;
use super::Gateway;
use crate::error::Result;
use crate::packet::{Body, MessageEndpoint, NodeId, Packet};
use crate::protocol::{
    ClientPingReq, ClientPongAck, ForwardClientMsg, KeepAliveAck, KeepAliveReq, KickClientAck,
    KickClientReq, SubscribeAck, SubscribeReq, MSG_CLIENT_PING_REQ, MSG_FORWARD_CLIENT_ACK,
    MSG_KEEP_ALIVE_REQ, MSG_KICK_CLIENT_REQ, MSG_SUBSCRIBE_REQ,
};

impl Gateway {
    pub(super) fn handle_message(&self, mut pkt: Packet) -> Result<()> {
        match pkt.command {
            MSG_KEEP_ALIVE_REQ => self.handle_keep_alive(&mut pkt),
            MSG_CLIENT_PING_REQ => self.handle_ping(&mut pkt),
            MSG_KICK_CLIENT_REQ => self.handle_kick_session(&mut pkt),
            MSG_SUBSCRIBE_REQ => self.handle_subscribe(&mut pkt),
            MSG_FORWARD_CLIENT_ACK => self.handle_forward_msg_back(&mut pkt),
            other => {
                tracing::debug!("unhandled message {other} dropped");
                Ok(())
            }
        }
    }

    /// Backend heartbeat.
    fn handle_keep_alive(&self, pkt: &mut Packet) -> Result<()> {
        let req: KeepAliveReq = pkt.decode_msg()?;
        let from = pkt.endpoint.as_ref().map(|e| e.node()).unwrap_or_default();
        tracing::debug!("recv ping {} from {}", req.time, from);
        pkt.reply(KeepAliveAck {
            time: self.core.context().clock().unix_secs(),
        })
    }

    /// Client heartbeat.
    fn handle_ping(&self, pkt: &mut Packet) -> Result<()> {
        let req: ClientPingReq = pkt.decode_msg()?;
        let from = pkt.endpoint.as_ref().map(|e| e.node()).unwrap_or_default();
        tracing::debug!("recv ping {} from {}", req.time, from);
        pkt.reply(ClientPongAck {
            time: self.core.context().clock().unix_secs(),
        })
    }

    /// A backend asks for client sessions to be dropped.
    fn handle_kick_session(&self, pkt: &mut Packet) -> Result<()> {
        let req: KickClientReq = pkt.decode_msg()?;
        let mut ack = KickClientAck::default();
        for sid in &req.sessions {
            if let Some(session) = self.sessions.get(NodeId(*sid)) {
                self.kick(&session, req.reason, true);
                ack.count += 1;
            }
        }
        pkt.reply(ack)
    }

    /// A backend subscribes to a client command range.
    fn handle_subscribe(&self, pkt: &mut Packet) -> Result<()> {
        let mut req: SubscribeReq = pkt.decode_msg()?;
        let Some(node) = pkt.endpoint.as_ref().map(|e| e.node()) else {
            tracing::error!("subscribe without an endpoint dropped");
            return Ok(());
        };
        if req.msg_end < req.msg_start {
            std::mem::swap(&mut req.msg_start, &mut req.msg_end);
        }
        self.core
            .context()
            .router()
            .subscriber()
            .add_range(req.msg_start, req.msg_end, node);
        tracing::info!(
            "backend {node} subscribed [{}, {}]",
            req.msg_start,
            req.msg_end
        );
        pkt.reply(SubscribeAck::default())
    }

    /// A backend answers a forwarded client packet: stamp the user id,
    /// mark the session logged in, and relay the payload under the
    /// original command and sequence.
    fn handle_forward_msg_back(&self, pkt: &mut Packet) -> Result<()> {
        let msg: ForwardClientMsg = pkt.decode_msg()?;
        let Some(session) = self.sessions.get(NodeId(msg.session)) else {
            tracing::error!("session {:08x} not found for forwarded reply", msg.session);
            return Ok(());
        };
        if let Some(ud) = session_user_data(&session) {
            ud.set_userid(msg.user_id);
            ud.set_session(msg.session);
        }
        self.sessions.add(session.node(), session.clone());
        let reply = Packet::new(
            self.core.node(),
            msg.msg_id,
            0,
            pkt.seq,
            Body::from(msg.msg_data),
        );
        session.send_packet(reply)
    }
}
