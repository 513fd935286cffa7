//! Channel membership registry.
//!
//! Maps channel ids to the parties currently joined. Each party is
//! represented by the mpsc sender feeding its connection's write pump, so
//! broadcasting is just cloning a frame into the other members' queues.

use std::collections::HashMap;

use axum::extract::ws::Message;
use tokio::sync::{RwLock, mpsc};

use canvaslink_protocol::{ChannelId, WireMessage};

/// Connection-scoped identity assigned by the relay.
pub type PartyId = String;

/// Outbound frame queue for one connected party.
pub type PartySender = mpsc::Sender<Message>;

#[derive(Debug, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined,
    /// Rejoining is a no-op, not a duplicate registration.
    AlreadyJoined,
}

#[derive(Default)]
pub struct ChannelRegistry {
    channels: RwLock<HashMap<ChannelId, HashMap<PartyId, PartySender>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a party to a channel, creating the channel on first join.
    pub async fn join(&self, channel: &str, party: &str, sender: PartySender) -> JoinOutcome {
        let mut channels = self.channels.write().await;
        let members = channels.entry(channel.to_string()).or_default();
        if members.contains_key(party) {
            return JoinOutcome::AlreadyJoined;
        }
        members.insert(party.to_string(), sender);
        JoinOutcome::Joined
    }

    /// Broadcast a frame to every member of the channel except `from`.
    /// Returns how many members the frame reached. A channel with no other
    /// members is a silent no-op: senders may join before the opposite party.
    pub async fn relay(&self, channel: &str, from: &str, frame: &WireMessage) -> usize {
        let targets: Vec<PartySender> = {
            let channels = self.channels.read().await;
            match channels.get(channel) {
                Some(members) => members
                    .iter()
                    .filter(|(party, _)| party.as_str() != from)
                    .map(|(_, tx)| tx.clone())
                    .collect(),
                None => Vec::new(),
            }
        };
        if targets.is_empty() {
            return 0;
        }

        let json = match serde_json::to_string(frame) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode relay frame");
                return 0;
            }
        };

        let mut delivered = 0;
        for tx in targets {
            if tx.send(Message::text(json.clone())).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Remove a party from every channel it joined. Channels left empty are
    /// destroyed. Returns the ids of the channels the party left.
    pub async fn leave(&self, party: &str) -> Vec<ChannelId> {
        let mut channels = self.channels.write().await;
        let mut left = Vec::new();
        channels.retain(|channel, members| {
            if members.remove(party).is_some() {
                left.push(channel.clone());
            }
            !members.is_empty()
        });
        left
    }

    /// Channels a party is currently a member of.
    pub async fn channels_of(&self, party: &str) -> Vec<ChannelId> {
        self.channels
            .read()
            .await
            .iter()
            .filter(|(_, members)| members.contains_key(party))
            .map(|(channel, _)| channel.clone())
            .collect()
    }

    pub async fn is_member(&self, channel: &str, party: &str) -> bool {
        self.channels
            .read()
            .await
            .get(channel)
            .is_some_and(|members| members.contains_key(party))
    }

    pub async fn member_count(&self, channel: &str) -> usize {
        self.channels
            .read()
            .await
            .get(channel)
            .map(|members| members.len())
            .unwrap_or(0)
    }

    pub async fn channel_count(&self) -> usize {
        self.channels.read().await.len()
    }
}
