//! Re-announces local state to the supervisor after a reconciliation.

use std::sync::Arc;

use crate::bridge::protocol::{CommandManifest, EventType, ReadyClient};
use crate::channel::ControlChannel;
use crate::resources::ResourceSource;
use crate::state::WorkerIdentity;
use crate::version::BuildInfo;

/// Static facts advertised in `READY_CLIENT`.
#[derive(Debug, Clone, Default)]
pub struct ReadyInfo {
    pub name: String,
    pub avatar: String,
    pub env: String,
    pub process_tag: Option<String>,
    pub commands: CommandManifest,
    pub build: BuildInfo,
}

impl ReadyInfo {
    pub fn payload(&self, identity: &WorkerIdentity) -> ReadyClient {
        ReadyClient {
            avatar: self.avatar.clone(),
            all_commands: self.commands.all.clone(),
            commands: self.commands.enabled.clone(),
            name: self.name.clone(),
            id: identity.cluster_id(),
            env: self.env.clone(),
            commit: self.build.commit.clone(),
            uuid: self.process_tag.clone(),
        }
    }
}

#[derive(Clone)]
pub struct Rebroadcaster {
    channel: ControlChannel,
    resources: Arc<dyn ResourceSource>,
    ready: Arc<ReadyInfo>,
}

impl Rebroadcaster {
    pub fn new(
        channel: ControlChannel,
        resources: Arc<dyn ResourceSource>,
        ready: ReadyInfo,
    ) -> Self {
        Self {
            channel,
            resources,
            ready: Arc::new(ready),
        }
    }

    /// Send one `GUILD_CREATE` per owned resource. Returns how many were queued.
    ///
    /// Failures are logged and skipped; the channel's reconnect is what
    /// recovers lost announcements.
    pub fn announce_owned(&self) -> usize {
        let mut announced = 0;
        for record in self.resources.owned() {
            match self.channel.send_event(EventType::GuildCreate, &record) {
                Ok(()) => announced += 1,
                Err(e) => {
                    tracing::warn!(guild_id = %record.id, error = %e, "Failed to announce guild");
                }
            }
        }
        announced
    }

    /// Send `READY_CLIENT` and `DISCOVERY_UPDATE`. Returns whether the
    /// readiness envelope was queued.
    pub fn announce_ready(&self, identity: &WorkerIdentity) -> bool {
        let ready = self
            .channel
            .send_event(EventType::ReadyClient, &self.ready.payload(identity));
        if let Err(e) = &ready {
            tracing::warn!(error = %e, "Failed to send ready handshake");
        }

        let discoverable = self.resources.discoverable();
        let count = discoverable.len();
        match self
            .channel
            .send_event(EventType::DiscoveryUpdate, &discoverable)
        {
            Ok(()) => tracing::debug!(count, "Sent discovery update"),
            Err(e) => tracing::warn!(error = %e, "Failed to send discovery update"),
        }

        ready.is_ok()
    }
}
