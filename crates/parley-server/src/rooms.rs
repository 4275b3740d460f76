//! Room membership and broadcast routing.
//!
//! The registry owns every live session's delivery handle and the set of
//! rooms. There is exactly one public room for the server's lifetime;
//! private rooms are created pairwise and dropped the moment their last
//! member leaves. A session is always in exactly one room.
//!
//! All state sits behind one mutex. Delivery pushes onto each session's
//! unbounded outbound queue, which never blocks, so the lock is never held
//! across an await point.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};

use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use parley_shared::commands::{connected_users, PeerRef};
use parley_shared::{
    Availability, Command, CommandCode, Entity, EntityHeader, InstanceId, ReasonCode, UserId,
    UserSummary,
};

use crate::transport::Outbound;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RoomId(pub u64);

impl RoomId {
    pub const PUBLIC: RoomId = RoomId(0);

    pub fn is_public(self) -> bool {
        self == Self::PUBLIC
    }
}

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_public() {
            f.write_str("public")
        } else {
            write!(f, "private-{}", self.0)
        }
    }
}

/// What the registry needs to reach a session from the outside.
pub struct SessionHandle {
    pub instance_id: InstanceId,
    pub addr: SocketAddr,
    pub outbound: Outbound,
    /// Set once to ask the session to close; the first reason wins.
    pub close: watch::Sender<Option<ReasonCode>>,
}

struct Member {
    handle: SessionHandle,
    username: String,
    user_id: UserId,
    availability: Availability,
    verified: bool,
    room: RoomId,
}

impl Member {
    fn deliver(&self, entity: Entity) -> bool {
        if self.handle.outbound.send(entity).is_err() {
            warn!(
                instance = %self.handle.instance_id,
                "Dropping entity for closed session"
            );
            return false;
        }
        true
    }

    fn peer_ref(&self) -> PeerRef {
        PeerRef {
            instance_id: self.handle.instance_id,
            username: self.username.clone(),
        }
    }
}

struct Room {
    is_public: bool,
    members: HashSet<InstanceId>,
}

impl Room {
    fn new(is_public: bool) -> Self {
        Self {
            is_public,
            members: HashSet::new(),
        }
    }
}

/// Returned by [`RoomRegistry::leave`] so the caller can announce the
/// departure to the room that was vacated.
#[derive(Debug, Clone)]
pub struct Departure {
    pub username: String,
    pub room: RoomId,
    pub was_verified: bool,
}

/// Admin view of one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub instance_id: u64,
    pub username: String,
    pub address: String,
    pub verified: bool,
    pub room: RoomId,
    pub availability: String,
}

struct RegistryState {
    members: HashMap<InstanceId, Member>,
    rooms: HashMap<RoomId, Room>,
    next_room: u64,
    /// Outstanding private-chatroom requests as (requester, target).
    pending: HashSet<(InstanceId, InstanceId)>,
    /// Set by `disconnect_all`; no session is admitted afterwards.
    closing: bool,
}

impl RegistryState {
    fn verified(&self, id: InstanceId) -> Option<&Member> {
        self.members.get(&id).filter(|m| m.verified)
    }

    /// A verified session sitting in the public room.
    fn available_for_private(&self, id: InstanceId) -> Option<&Member> {
        self.verified(id).filter(|m| m.room.is_public())
    }

    fn create_room(&mut self) -> RoomId {
        self.next_room += 1;
        let id = RoomId(self.next_room);
        self.rooms.insert(id, Room::new(false));
        info!(room = %id, "Created private room");
        id
    }

    /// Remove a private room if nobody is left in it.
    fn close_if_empty(&mut self, room: RoomId) -> bool {
        let empty_private = self
            .rooms
            .get(&room)
            .map(|r| !r.is_public && r.members.is_empty())
            .unwrap_or(false);

        if empty_private {
            self.rooms.remove(&room);
            info!(room = %room, "Removed empty private room");
        }
        empty_private
    }

    /// Move a session into `target`, leaving its old room in the same step.
    fn join(&mut self, id: InstanceId, target: RoomId) -> bool {
        if !self.rooms.contains_key(&target) {
            return false;
        }
        let Some(member) = self.members.get_mut(&id) else {
            return false;
        };
        let previous = member.room;
        if previous == target {
            return true;
        }
        member.room = target;

        if let Some(room) = self.rooms.get_mut(&previous) {
            room.members.remove(&id);
        }
        if let Some(room) = self.rooms.get_mut(&target) {
            room.members.insert(id);
        }
        self.close_if_empty(previous);

        debug!(instance = %id, from = %previous, to = %target, "Session changed room");
        true
    }

    fn broadcast(&self, entity: &Entity, room: RoomId) -> usize {
        let Some(room) = self.rooms.get(&room) else {
            return 0;
        };
        room.members
            .iter()
            .filter_map(|id| self.verified(*id))
            .filter(|m| m.deliver(entity.clone()))
            .count()
    }

    fn broadcast_global(&self, entity: &Entity) -> usize {
        self.members
            .values()
            .filter(|m| m.verified)
            .filter(|m| m.deliver(entity.clone()))
            .count()
    }

    fn snapshot(&self) -> Vec<UserSummary> {
        let mut users: Vec<UserSummary> = self
            .members
            .values()
            .filter(|m| m.verified)
            .map(|m| UserSummary {
                instance_id: m.handle.instance_id,
                username: m.username.clone(),
                availability: m.availability.public(),
            })
            .collect();
        users.sort_by_key(|u| u.instance_id);
        users
    }

    fn send_to(&self, id: InstanceId, entity: Entity) -> bool {
        self.members
            .get(&id)
            .map(|m| m.deliver(entity))
            .unwrap_or(false)
    }
}

pub struct RoomRegistry {
    state: Mutex<RegistryState>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        let mut rooms = HashMap::new();
        rooms.insert(RoomId::PUBLIC, Room::new(true));
        Self {
            state: Mutex::new(RegistryState {
                members: HashMap::new(),
                rooms,
                next_room: 0,
                pending: HashSet::new(),
                closing: false,
            }),
        }
    }

    /// Register a freshly accepted, not yet authenticated session in the
    /// public room. Capacity (`max_sessions`, 0 = unlimited) counts
    /// unauthenticated sessions too.
    ///
    /// Every admission check runs under the same lock as the insert, so a
    /// concurrent `disconnect_all` or blacklist sweep either sees the new
    /// session or refuses it here.
    pub async fn admit<F>(
        &self,
        handle: SessionHandle,
        max_sessions: usize,
        is_denied: F,
    ) -> Result<(), ReasonCode>
    where
        F: FnOnce(&IpAddr) -> bool,
    {
        let mut state = self.state.lock().await;
        if state.closing {
            return Err(ReasonCode::ServerClosed);
        }
        if is_denied(&handle.addr.ip()) {
            return Err(ReasonCode::Blacklisted);
        }
        if max_sessions > 0 && state.members.len() >= max_sessions {
            return Err(ReasonCode::ServerFull);
        }

        let id = handle.instance_id;
        state.members.insert(
            id,
            Member {
                handle,
                username: String::new(),
                user_id: UserId::UNASSIGNED,
                availability: Availability::Available,
                verified: false,
                room: RoomId::PUBLIC,
            },
        );
        if let Some(public) = state.rooms.get_mut(&RoomId::PUBLIC) {
            public.members.insert(id);
        }
        debug!(instance = %id, sessions = state.members.len(), "Session admitted");
        Ok(())
    }

    /// Record the identity issued at authentication. From here on the
    /// session shows up in snapshots and receives room broadcasts.
    pub async fn mark_verified(&self, id: InstanceId, username: &str, user_id: UserId) -> bool {
        let mut state = self.state.lock().await;
        let Some(member) = state.members.get_mut(&id) else {
            return false;
        };
        member.username = username.to_string();
        member.user_id = user_id;
        member.verified = true;
        true
    }

    /// Remove a session from its room and from the registry.
    pub async fn leave(&self, id: InstanceId) -> Option<Departure> {
        let mut state = self.state.lock().await;
        let member = state.members.remove(&id)?;

        if let Some(room) = state.rooms.get_mut(&member.room) {
            room.members.remove(&id);
        }
        state.close_if_empty(member.room);
        state.pending.retain(|(from, to)| *from != id && *to != id);

        debug!(instance = %id, sessions = state.members.len(), "Session left registry");
        Some(Departure {
            username: member.username,
            room: member.room,
            was_verified: member.verified,
        })
    }

    pub async fn join(&self, id: InstanceId, room: RoomId) -> bool {
        self.state.lock().await.join(id, room)
    }

    pub async fn create_private_room(&self) -> RoomId {
        self.state.lock().await.create_room()
    }

    pub async fn close_if_empty(&self, room: RoomId) -> bool {
        self.state.lock().await.close_if_empty(room)
    }

    /// Deliver to every verified member of `room`. Returns the number of
    /// sessions reached.
    pub async fn broadcast(&self, entity: &Entity, room: RoomId) -> usize {
        self.state.lock().await.broadcast(entity, room)
    }

    /// Deliver to the room the sender is currently in.
    pub async fn broadcast_from(&self, sender: InstanceId, entity: &Entity) -> usize {
        let state = self.state.lock().await;
        match state.members.get(&sender) {
            Some(member) => state.broadcast(entity, member.room),
            None => 0,
        }
    }

    /// Deliver to every verified session on the server.
    pub async fn broadcast_global(&self, entity: &Entity) -> usize {
        self.state.lock().await.broadcast_global(entity)
    }

    /// Send the current `CONNECTED_USERS` list to everyone.
    pub async fn broadcast_snapshot(&self) {
        let state = self.state.lock().await;
        let entity = Entity::from(connected_users(state.snapshot()));
        state.broadcast_global(&entity);
    }

    pub async fn send_to(&self, id: InstanceId, entity: Entity) -> bool {
        self.state.lock().await.send_to(id, entity)
    }

    pub async fn snapshot(&self) -> Vec<UserSummary> {
        self.state.lock().await.snapshot()
    }

    pub async fn set_availability(&self, id: InstanceId, availability: Availability) -> bool {
        let mut state = self.state.lock().await;
        match state.members.get_mut(&id) {
            Some(member) => {
                member.availability = availability;
                true
            }
            None => false,
        }
    }

    pub async fn room_of(&self, id: InstanceId) -> Option<RoomId> {
        self.state.lock().await.members.get(&id).map(|m| m.room)
    }

    /// Members of `room`, sorted.
    pub async fn members(&self, room: RoomId) -> Vec<InstanceId> {
        let state = self.state.lock().await;
        let mut ids: Vec<InstanceId> = state
            .rooms
            .get(&room)
            .map(|r| r.members.iter().copied().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    pub async fn room_exists(&self, room: RoomId) -> bool {
        self.state.lock().await.rooms.contains_key(&room)
    }

    /// Number of rooms, the public one included.
    pub async fn room_count(&self) -> usize {
        self.state.lock().await.rooms.len()
    }

    pub async fn session_count(&self) -> usize {
        self.state.lock().await.members.len()
    }

    pub async fn sessions_from(&self, ip: IpAddr) -> Vec<InstanceId> {
        let state = self.state.lock().await;
        state
            .members
            .values()
            .filter(|m| m.handle.addr.ip() == ip)
            .map(|m| m.handle.instance_id)
            .collect()
    }

    pub async fn list_sessions(&self) -> Vec<SessionInfo> {
        let state = self.state.lock().await;
        let mut sessions: Vec<SessionInfo> = state
            .members
            .values()
            .map(|m| SessionInfo {
                instance_id: m.handle.instance_id.0,
                username: m.username.clone(),
                address: m.handle.addr.to_string(),
                verified: m.verified,
                room: m.room,
                availability: m.availability.to_string(),
            })
            .collect();
        sessions.sort_by_key(|s| s.instance_id);
        sessions
    }

    // -----------------------------------------------------------------------
    // Private chatrooms
    // -----------------------------------------------------------------------

    /// Record `requester`'s request and relay it to `target`. Returns
    /// `false` (nothing recorded) if the target is unknown, unverified or
    /// the requester itself, or if either side is already in a private room.
    pub async fn request_private(&self, requester: InstanceId, target: InstanceId) -> bool {
        let mut state = self.state.lock().await;
        if requester == target {
            return false;
        }
        let (Some(from), Some(to)) = (
            state.available_for_private(requester),
            state.available_for_private(target),
        ) else {
            return false;
        };

        let relay = from.peer_ref().relay(CommandCode::PrivateChatroomRequest);
        if !to.deliver(relay.into()) {
            return false;
        }
        state.pending.insert((requester, target));
        debug!(from = %requester, to = %target, "Private chatroom requested");
        true
    }

    /// `responder` accepted `requester`'s pending request: create a room,
    /// move both sessions into it and tell the requester.
    ///
    /// If either side has entered another private room since the request was
    /// made, the requester is told the request was denied and nobody moves.
    pub async fn accept_private(&self, requester: InstanceId, responder: InstanceId) -> Option<RoomId> {
        let mut state = self.state.lock().await;
        if !state.pending.remove(&(requester, responder)) {
            warn!(from = %requester, to = %responder, "Accept for unknown private request");
            return None;
        }
        let responder_ref = state.verified(responder)?.peer_ref();
        state.verified(requester)?;

        if state.available_for_private(requester).is_none()
            || state.available_for_private(responder).is_none()
        {
            warn!(from = %requester, to = %responder, "Accept while already in a private room");
            state.send_to(
                requester,
                responder_ref.relay(CommandCode::PrivateChatroomDenied).into(),
            );
            return None;
        }

        let room = state.create_room();
        state.join(requester, room);
        state.join(responder, room);
        state.send_to(
            requester,
            responder_ref
                .relay(CommandCode::PrivateChatroomAuthorized)
                .into(),
        );

        info!(room = %room, a = %requester, b = %responder, "Private chatroom opened");
        Some(room)
    }

    /// `responder` turned the request down. Nothing but the pending entry
    /// changes. Returns `false` if there was no such request.
    pub async fn deny_private(&self, requester: InstanceId, responder: InstanceId) -> bool {
        let mut state = self.state.lock().await;
        if !state.pending.remove(&(requester, responder)) {
            warn!(from = %requester, to = %responder, "Denial for unknown private request");
            return false;
        }
        let Some(responder_ref) = state.members.get(&responder).map(Member::peer_ref) else {
            return false;
        };
        state.send_to(
            requester,
            responder_ref.relay(CommandCode::PrivateChatroomDenied).into(),
        )
    }

    /// Tell `requester` its request cannot be served.
    pub async fn refuse_private(&self, requester: InstanceId, target: InstanceId) {
        let state = self.state.lock().await;
        let target_ref = state
            .members
            .get(&target)
            .map(Member::peer_ref)
            .unwrap_or(PeerRef {
                instance_id: target,
                username: String::new(),
            });
        state.send_to(
            requester,
            target_ref.relay(CommandCode::PrivateChatroomDenied).into(),
        );
    }

    /// Close the private room `member` is in: relay the exit, move everyone
    /// back to the public room, drop the room. Returns the closed room and
    /// who was in it, or `None` if `member` is in the public room.
    pub async fn exit_private(&self, member: InstanceId) -> Option<(RoomId, Vec<InstanceId>)> {
        let mut state = self.state.lock().await;
        let exiting = state.members.get(&member)?;
        let room = exiting.room;
        if room.is_public() {
            return None;
        }

        let exit = Entity::from(
            Command::new(
                EntityHeader::new(exiting.username.clone(), exiting.user_id),
                CommandCode::PrivateChatroomExit,
            )
            .with_reason(ReasonCode::RoomClosed),
        );
        state.broadcast(&exit, room);

        let mut members: Vec<InstanceId> = state
            .rooms
            .get(&room)
            .map(|r| r.members.iter().copied().collect())
            .unwrap_or_default();
        members.sort();
        for id in &members {
            state.join(*id, RoomId::PUBLIC);
        }
        // join() already dropped the room with its last member.
        debug_assert!(!state.rooms.contains_key(&room));

        info!(room = %room, by = %member, "Private chatroom closed");
        Some((room, members))
    }

    // -----------------------------------------------------------------------
    // Disconnection
    // -----------------------------------------------------------------------

    /// Ask a session to close. Idempotent: later reasons never override the
    /// first.
    pub async fn disconnect(&self, id: InstanceId, reason: ReasonCode) -> bool {
        let state = self.state.lock().await;
        match state.members.get(&id) {
            Some(member) => {
                signal_close(&member.handle.close, reason);
                true
            }
            None => false,
        }
    }

    /// Close every session and refuse all later admissions.
    pub async fn disconnect_all(&self, reason: ReasonCode) -> usize {
        let mut state = self.state.lock().await;
        state.closing = true;
        for member in state.members.values() {
            signal_close(&member.handle.close, reason);
        }
        state.members.len()
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn signal_close(close: &watch::Sender<Option<ReasonCode>>, reason: ReasonCode) {
    close.send_if_modified(|current| {
        if current.is_some() {
            return false;
        }
        *current = Some(reason);
        true
    });
}
