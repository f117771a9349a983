//! Server-side table of peer-to-peer rooms.
//!
//! A room is keyed by a shared token and holds at most two members, each identified by the
//! connection id its client picked. A member owns the data sessions it relays through and, while
//! it is trying to rendezvous, the private and public addresses the other member should dial.

use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use parking_lot::Mutex;
use snova_proto::auth::AuthRequest;
use tracing::{info, warn};

use crate::{
    error::{Error, Result},
    mux::MuxSession,
};

pub const MAX_ROOM_MEMBERS: usize = 2;

#[derive(Default)]
struct Member {
    sessions: HashMap<u64, Arc<MuxSession>>,
    pri_addr: String,
    pub_addr: String,
}

#[derive(Default)]
pub struct RoomTable {
    rooms: Mutex<HashMap<String, HashMap<String, Member>>>,
}

impl RoomTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `session` to its room, as declared by `request`. Signaling sessions (those declaring a
    /// private address) record the member's candidate addresses instead of joining the session
    /// set; the public address is the declared one or, failing that, `observed`.
    ///
    /// Fails without touching the room if the room already has two other members.
    pub fn join(&self, request: &AuthRequest, session: &Arc<MuxSession>, observed: Option<SocketAddr>) -> Result<()> {
        let mut rooms = self.rooms.lock();
        let room = rooms.entry(request.p2p_token.clone()).or_default();

        if !room.contains_key(&request.p2p_conn_id) && room.len() >= MAX_ROOM_MEMBERS {
            warn!(room = request.p2p_token, "Rejecting '{}', room already has two members", request.p2p_conn_id);
            return Err(Error::AuthFailed(format!("room {} is full", request.p2p_token)));
        }

        let member = room.entry(request.p2p_conn_id.clone()).or_insert_with(|| {
            info!(room = request.p2p_token, "'{}' joined", request.p2p_conn_id);
            Member::default()
        });

        if request.is_p2p_exchange() {
            member.pri_addr = request.p2p_pri_addr.clone();
            member.pub_addr = match (request.p2p_pub_addr.is_empty(), observed) {
                (false, _) => request.p2p_pub_addr.clone(),
                (true, Some(addr)) => addr.to_string(),
                (true, None) => String::new(),
            };
        } else {
            member.sessions.insert(session.id(), Arc::clone(session));
        }

        Ok(())
    }

    /// Undoes [`join`](Self::join) for a session that ended. A member without sessions leaves the
    /// room, and an empty room is dropped.
    pub fn leave(&self, request: &AuthRequest, session_id: u64) {
        let mut rooms = self.rooms.lock();
        let Some(room) = rooms.get_mut(&request.p2p_token) else {
            return;
        };

        let Some(member) = room.get_mut(&request.p2p_conn_id) else {
            return;
        };

        if request.is_p2p_exchange() {
            member.pri_addr.clear();
            member.pub_addr.clear();
        }

        member.sessions.remove(&session_id);
        if member.sessions.is_empty() {
            room.remove(&request.p2p_conn_id);
            info!(room = request.p2p_token, "'{}' left, {} member(s) remain", request.p2p_conn_id, room.len());
            if room.is_empty() {
                rooms.remove(&request.p2p_token);
            }
        }
    }

    /// The private and public addresses of the other member of `token`'s room, if it has declared
    /// any.
    pub fn peer_addrs(&self, token: &str, conn_id: &str) -> Option<(String, String)> {
        let rooms = self.rooms.lock();
        rooms
            .get(token)?
            .iter()
            .find(|(id, member)| id.as_str() != conn_id && !member.pri_addr.is_empty())
            .map(|(_, member)| (member.pri_addr.clone(), member.pub_addr.clone()))
    }

    /// A live data session of the other member of `token`'s room.
    pub fn peer_session(&self, token: &str, conn_id: &str) -> Option<Arc<MuxSession>> {
        let rooms = self.rooms.lock();
        rooms
            .get(token)?
            .iter()
            .filter(|(id, _)| id.as_str() != conn_id)
            .flat_map(|(_, member)| member.sessions.values())
            .find(|session| !session.is_closed())
            .cloned()
    }

    pub fn members(&self, token: &str) -> usize {
        self.rooms.lock().get(token).map_or(0, HashMap::len)
    }
}
