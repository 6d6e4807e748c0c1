//! Room membership and event forwarding
//!
//! [`Relay`] is transport-agnostic: it takes an inbound event from a
//! connection and returns the deliveries to perform. The hub owns one and
//! does the actual sending.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use serde_json::json;
use tracing::{debug, info};

use crate::error::EventError;
use crate::events::{
    self, FileMeta, FileRaw, FsStart, OutboundEvent, Payload, ReceiverJoin, SenderJoin,
};

/// Opaque identifier assigned to a connection when it opens
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Generate a fresh random identifier (16 hex chars)
    pub fn generate() -> Result<Self, getrandom::Error> {
        let mut bytes = [0u8; 8];
        getrandom::fill(&mut bytes)?;
        Ok(Self(hex::encode(bytes)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Group membership table
///
/// Kept in both directions so forwarding looks up a room directly and
/// disconnect clears every room of a connection without a scan.
#[derive(Debug, Default)]
pub struct Membership {
    rooms: HashMap<String, BTreeSet<ConnectionId>>,
    joined: HashMap<ConnectionId, BTreeSet<String>>,
}

impl Membership {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `conn` to room `uid`. Returns false if it was already a member.
    pub fn join(&mut self, conn: &ConnectionId, uid: &str) -> bool {
        let added = self
            .rooms
            .entry(uid.to_owned())
            .or_default()
            .insert(conn.clone());
        self.joined
            .entry(conn.clone())
            .or_default()
            .insert(uid.to_owned());
        added
    }

    /// Remove `conn` from every room, pruning rooms left empty.
    /// Returns the rooms it was in.
    pub fn leave_all(&mut self, conn: &ConnectionId) -> BTreeSet<String> {
        let uids = self.joined.remove(conn).unwrap_or_default();
        for uid in &uids {
            if let Some(members) = self.rooms.get_mut(uid) {
                members.remove(conn);
                if members.is_empty() {
                    self.rooms.remove(uid);
                    debug!("Room {:?} removed (empty)", uid);
                }
            }
        }
        uids
    }

    /// Members of `uid` other than `except`, in a stable order
    pub fn members_except(&self, uid: &str, except: &ConnectionId) -> Vec<ConnectionId> {
        self.rooms
            .get(uid)
            .map(|members| members.iter().filter(|c| *c != except).cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_member(&self, conn: &ConnectionId, uid: &str) -> bool {
        self.rooms.get(uid).is_some_and(|m| m.contains(conn))
    }

    /// Number of non-empty rooms
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Total (connection, room) pairs
    pub fn membership_count(&self) -> usize {
        self.rooms.values().map(BTreeSet::len).sum()
    }
}

/// One outbound event, the binary frames that follow it, and the connections
/// that should receive them
#[derive(Clone, Debug, PartialEq)]
pub struct Delivery {
    pub targets: Vec<ConnectionId>,
    pub event: OutboundEvent,
    pub attachments: Vec<Vec<u8>>,
}

impl Delivery {
    /// Forward `event` to every member of `uid` except the sender. Yields
    /// nothing when nobody else is in the room.
    fn to_room(
        membership: &Membership,
        uid: &str,
        sender: &ConnectionId,
        event: OutboundEvent,
        attachments: Vec<Vec<u8>>,
    ) -> Vec<Delivery> {
        let targets = membership.members_except(uid, sender);
        if targets.is_empty() {
            debug!("No recipients in room {:?} for {}", uid, event.name());
            return Vec::new();
        }
        vec![Delivery {
            targets,
            event,
            attachments,
        }]
    }
}

/// Handler for one inbound event type
pub type Handler =
    fn(&ConnectionId, &mut Membership, Payload) -> Result<Vec<Delivery>, EventError>;

/// Inbound event name to handler
pub const DISPATCH_TABLE: &[(&str, Handler)] = &[
    (events::SENDER_JOIN, sender_join),
    (events::RECEIVER_JOIN, receiver_join),
    (events::FILE_META, file_meta),
    (events::FS_START, fs_start),
    (events::FILE_RAW, file_raw),
];

fn sender_join(
    conn: &ConnectionId,
    membership: &mut Membership,
    payload: Payload,
) -> Result<Vec<Delivery>, EventError> {
    let SenderJoin { uid } = events::decode(events::SENDER_JOIN, payload.data)?;
    info!("Sender {} joined with uid {:?}", conn, uid);
    membership.join(conn, &uid);
    Ok(Vec::new())
}

fn receiver_join(
    conn: &ConnectionId,
    membership: &mut Membership,
    payload: Payload,
) -> Result<Vec<Delivery>, EventError> {
    let ReceiverJoin { uid, sender_uid } = events::decode(events::RECEIVER_JOIN, payload.data)?;
    info!("Receiver {} joined with uid {:?}", conn, uid);
    membership.join(conn, &uid);

    // The sender is expected to have joined `sender_uid` under its own uid;
    // nothing here checks that.
    Ok(Delivery::to_room(
        membership,
        &sender_uid,
        conn,
        OutboundEvent::Init(uid),
        Vec::new(),
    ))
}

fn file_meta(
    conn: &ConnectionId,
    membership: &mut Membership,
    payload: Payload,
) -> Result<Vec<Delivery>, EventError> {
    let FileMeta { uid, metadata } = events::decode(events::FILE_META, payload.data)?;
    debug!("File metadata from {} for {:?}: {}", conn, uid, metadata);
    Ok(Delivery::to_room(
        membership,
        &uid,
        conn,
        OutboundEvent::FsMeta(metadata),
        payload.attachments,
    ))
}

fn fs_start(
    conn: &ConnectionId,
    membership: &mut Membership,
    payload: Payload,
) -> Result<Vec<Delivery>, EventError> {
    let FsStart { uid } = events::decode(events::FS_START, payload.data)?;
    debug!("File sharing started by {} for {:?}", conn, uid);
    Ok(Delivery::to_room(
        membership,
        &uid,
        conn,
        OutboundEvent::FsShare(json!({})),
        Vec::new(),
    ))
}

fn file_raw(
    conn: &ConnectionId,
    membership: &mut Membership,
    payload: Payload,
) -> Result<Vec<Delivery>, EventError> {
    let FileRaw { uid, buffer } = events::decode(events::FILE_RAW, payload.data)?;
    debug!(
        "File chunk from {} for {:?} ({} binary frame(s))",
        conn,
        uid,
        payload.attachments.len()
    );
    Ok(Delivery::to_room(
        membership,
        &uid,
        conn,
        OutboundEvent::FsShare(buffer),
        payload.attachments,
    ))
}

/// The relay: a membership table plus the dispatch table that drives it
#[derive(Debug, Default)]
pub struct Relay {
    membership: Membership,
}

impl Relay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle one inbound event from `conn`
    pub fn dispatch(
        &mut self,
        conn: &ConnectionId,
        event: &str,
        payload: impl Into<Payload>,
    ) -> Result<Vec<Delivery>, EventError> {
        let handler = DISPATCH_TABLE
            .iter()
            .find(|(name, _)| *name == event)
            .map(|(_, handler)| *handler)
            .ok_or_else(|| EventError::UnknownEvent(event.to_owned()))?;

        handler(conn, &mut self.membership, payload.into())
    }

    /// Forget a closed connection
    pub fn disconnect(&mut self, conn: &ConnectionId) {
        let rooms = self.membership.leave_all(conn);
        debug!("Connection {} left {} room(s)", conn, rooms.len());
    }

    pub fn membership(&self) -> &Membership {
        &self.membership
    }
}
