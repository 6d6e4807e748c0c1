//! Dispatcher task
//!
//! The hub owns the [`Relay`] and one outbox per open connection. Every
//! connection feeds its events into a single command channel, so events are
//! handled one at a time and each handler runs to completion before the next.

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::events::Payload;
use crate::relay::{ConnectionId, Delivery, Relay};

/// Queue of frames waiting to be written to one connection
pub type Outbox = mpsc::UnboundedSender<Message>;

/// Commands accepted by the hub
#[derive(Debug)]
pub enum HubCommand {
    /// A connection opened
    Connect { conn: ConnectionId, outbox: Outbox },

    /// A connection sent an event
    Event {
        conn: ConnectionId,
        event: String,
        payload: Payload,
    },

    /// A connection closed
    Disconnect { conn: ConnectionId },

    /// Snapshot counters
    Stats { reply: oneshot::Sender<RelayStats> },
}

/// Counters reported on `/health` and `/stats`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub connections: usize,
    pub rooms: usize,
    pub memberships: usize,
}

/// Cloneable handle used by connection tasks to talk to the hub
#[derive(Clone, Debug)]
pub struct HubHandle {
    tx: mpsc::UnboundedSender<HubCommand>,
}

impl HubHandle {
    pub fn connect(&self, conn: ConnectionId, outbox: Outbox) {
        self.send(HubCommand::Connect { conn, outbox });
    }

    pub fn event(&self, conn: ConnectionId, event: String, payload: impl Into<Payload>) {
        self.send(HubCommand::Event {
            conn,
            event,
            payload: payload.into(),
        });
    }

    pub fn disconnect(&self, conn: ConnectionId) {
        self.send(HubCommand::Disconnect { conn });
    }

    /// Current counters, or `None` once the hub has stopped
    pub async fn stats(&self) -> Option<RelayStats> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::Stats { reply });
        rx.await.ok()
    }

    fn send(&self, cmd: HubCommand) {
        if self.tx.send(cmd).is_err() {
            debug!("Hub stopped, dropping command");
        }
    }
}

/// The dispatcher: relay state plus the outbox registry
pub struct Hub {
    relay: Relay,
    outboxes: HashMap<ConnectionId, Outbox>,
    rx: mpsc::UnboundedReceiver<HubCommand>,
}

impl Hub {
    /// Create a hub around `relay` and the handle that feeds it
    pub fn new(relay: Relay) -> (Self, HubHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let hub = Self {
            relay,
            outboxes: HashMap::new(),
            rx,
        };
        (hub, HubHandle { tx })
    }

    /// Create a hub and run it on its own task
    pub fn spawn(relay: Relay) -> HubHandle {
        let (hub, handle) = Self::new(relay);
        tokio::spawn(hub.run());
        handle
    }

    /// Process commands until every handle has been dropped
    pub async fn run(mut self) {
        while let Some(cmd) = self.rx.recv().await {
            self.handle(cmd);
        }
        debug!("Hub stopped");
    }

    fn handle(&mut self, cmd: HubCommand) {
        match cmd {
            HubCommand::Connect { conn, outbox } => {
                info!("Client connected: {}", conn);
                self.outboxes.insert(conn, outbox);
            }

            HubCommand::Event {
                conn,
                event,
                payload,
            } => {
                match self.relay.dispatch(&conn, &event, payload) {
                    Ok(deliveries) => {
                        for delivery in deliveries {
                            self.deliver(delivery);
                        }
                    }
                    Err(e) => warn!("Dropping event from {}: {}", conn, e),
                }
            }

            HubCommand::Disconnect { conn } => {
                self.relay.disconnect(&conn);
                self.outboxes.remove(&conn);
                info!("Client disconnected: {}", conn);
            }

            HubCommand::Stats { reply } => {
                let membership = self.relay.membership();
                let _ = reply.send(RelayStats {
                    connections: self.outboxes.len(),
                    rooms: membership.room_count(),
                    memberships: membership.membership_count(),
                });
            }
        }
    }

    fn deliver(&self, delivery: Delivery) {
        let Delivery {
            targets,
            event,
            attachments,
        } = delivery;
        let name = event.name();

        let json = match event.into_envelope().to_json() {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to encode {}: {}", name, e);
                return;
            }
        };

        for target in &targets {
            match self.outboxes.get(target) {
                // A closed outbox means the disconnect is already queued
                Some(outbox) => {
                    let _ = outbox.send(Message::Text(json.clone()));
                    for bytes in &attachments {
                        let _ = outbox.send(Message::Binary(bytes.clone()));
                    }
                }
                None => debug!("No outbox for {}", target),
            }
        }
        debug!("Forwarded {} to {} connection(s)", name, targets.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::events::{self, Envelope};

    fn open(hub: &HubHandle, id: &str) -> (ConnectionId, mpsc::UnboundedReceiver<Message>) {
        let conn = ConnectionId::from(id);
        let (tx, rx) = mpsc::unbounded_channel();
        hub.connect(conn.clone(), tx);
        (conn, rx)
    }

    fn received(rx: &mut mpsc::UnboundedReceiver<Message>) -> Option<Envelope> {
        match rx.try_recv().ok()? {
            Message::Text(text) => Some(Envelope::from_json(&text).unwrap()),
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_forward_through_outboxes() {
        let hub = Hub::spawn(Relay::new());
        let (s, mut s_rx) = open(&hub, "s");
        let (r, mut r_rx) = open(&hub, "r");

        hub.event(s, events::SENDER_JOIN.into(), json!({ "uid": "abc" }));
        hub.event(r.clone(), events::SENDER_JOIN.into(), json!({ "uid": "abc" }));
        hub.event(
            r,
            events::FILE_META.into(),
            json!({ "uid": "abc", "metadata": { "name": "a.txt", "size": 10 } }),
        );

        // Stats is queued behind the events, so they have all been handled
        let stats = hub.stats().await.unwrap();
        assert_eq!(
            stats,
            RelayStats {
                connections: 2,
                rooms: 1,
                memberships: 2,
            }
        );

        let env = received(&mut s_rx).unwrap();
        assert_eq!(env.event, events::FS_META);
        assert_eq!(env.data, json!({ "name": "a.txt", "size": 10 }));
        assert!(received(&mut r_rx).is_none());
    }

    #[tokio::test]
    async fn test_attachments_follow_their_envelope() {
        let hub = Hub::spawn(Relay::new());
        let (s, _s_rx) = open(&hub, "s");
        let (r, mut r_rx) = open(&hub, "r");

        hub.event(s.clone(), events::SENDER_JOIN.into(), json!({ "uid": "abc" }));
        hub.event(r, events::SENDER_JOIN.into(), json!({ "uid": "abc" }));
        hub.event(
            s,
            events::FILE_RAW.into(),
            Payload::with_attachments(
                json!({ "uid": "abc", "buffer": { "_placeholder": true, "num": 0 } }),
                vec![vec![7, 0, 255]],
            ),
        );
        hub.stats().await.unwrap();

        let env = received(&mut r_rx).unwrap();
        assert_eq!(env.event, events::FS_SHARE);
        assert_eq!(env.data, json!({ "_placeholder": true, "num": 0 }));
        match r_rx.try_recv().unwrap() {
            Message::Binary(bytes) => assert_eq!(bytes, vec![7, 0, 255]),
            other => panic!("expected binary frame, got {:?}", other),
        }
        assert!(r_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disconnect_prunes_rooms() {
        let hub = Hub::spawn(Relay::new());
        let (a, mut a_rx) = open(&hub, "a");
        let (b, _b_rx) = open(&hub, "b");

        hub.event(a.clone(), events::SENDER_JOIN.into(), json!({ "uid": "g" }));
        hub.event(b.clone(), events::SENDER_JOIN.into(), json!({ "uid": "g" }));
        hub.disconnect(a);
        hub.event(b, events::FS_START.into(), json!({ "uid": "g" }));

        let stats = hub.stats().await.unwrap();
        assert_eq!(stats.connections, 1);
        assert_eq!(stats.memberships, 1);
        assert!(received(&mut a_rx).is_none());
    }

    #[tokio::test]
    async fn test_bad_events_do_not_stop_hub() {
        let hub = Hub::spawn(Relay::new());
        let (c, _rx) = open(&hub, "c");

        hub.event(c.clone(), "nonsense".into(), json!({}));
        hub.event(c.clone(), events::SENDER_JOIN.into(), json!(17));
        hub.event(c, events::SENDER_JOIN.into(), json!({ "uid": "still-works" }));

        let stats = hub.stats().await.unwrap();
        assert_eq!(stats.rooms, 1);
    }

    #[tokio::test]
    async fn test_closed_outbox_is_ignored() {
        let hub = Hub::spawn(Relay::new());
        let (a, a_rx) = open(&hub, "a");
        let (b, _b_rx) = open(&hub, "b");
        drop(a_rx);

        hub.event(a, events::SENDER_JOIN.into(), json!({ "uid": "g" }));
        hub.event(b, events::FILE_RAW.into(), json!({ "uid": "g", "buffer": "chunk" }));

        assert!(hub.stats().await.is_some());
    }
}
