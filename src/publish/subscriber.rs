//! Subscriber side of the exclusive-ownership channel
//!
//! Receives every publisher's units but delivers only those of the current
//! owner, so downstream consumers see exactly one authoritative stream and
//! failover is invisible beyond a sequence-number reset.

use std::time::{Duration, Instant};

use iceoryx2::node::NodeBuilder;
use iceoryx2::port::subscriber::Subscriber;
use iceoryx2::prelude::*;

use super::ownership::{OwnerTable, PublisherId};
use super::{PublishError, PublishInitError, UnitHeader, FLAG_KEYFRAME};

/// One unit delivered from the channel's current owner.
#[derive(Debug, Clone)]
pub struct ReceivedUnit {
    pub publisher_id: PublisherId,
    pub strength: i32,
    pub sequence: u64,
    pub keyframe: bool,
    pub pts_ns: Option<u64>,
    pub data: Vec<u8>,
}

/// Owner-filtered subscriber for one channel.
pub struct ChannelSubscriber {
    subscriber: Subscriber<ipc::Service, [u8], UnitHeader>,
    table: OwnerTable,
    last_owner: Option<PublisherId>,
    _node: Node<ipc::Service>,
}

impl ChannelSubscriber {
    /// Connect to a channel with the given liveliness contract.
    pub fn connect(
        channel_name: &str,
        liveliness_timeout: Duration,
    ) -> Result<Self, PublishInitError> {
        let node = NodeBuilder::new()
            .create::<ipc::Service>()
            .map_err(|e| PublishInitError::Node(format!("{:?}", e)))?;

        let service_name: ServiceName = channel_name
            .try_into()
            .map_err(|e| PublishInitError::ChannelName(channel_name.to_string(), format!("{:?}", e)))?;

        let service = node
            .service_builder(&service_name)
            .publish_subscribe::<[u8]>()
            .user_header::<UnitHeader>()
            .open_or_create()
            .map_err(|e| PublishInitError::Service(format!("{:?}", e)))?;

        let subscriber = service
            .subscriber_builder()
            .create()
            .map_err(|e| PublishInitError::Port(format!("{:?}", e)))?;

        Ok(Self {
            subscriber,
            table: OwnerTable::new(liveliness_timeout),
            last_owner: None,
            _node: node,
        })
    }

    /// Drain pending samples and return the current owner's units.
    ///
    /// Units from non-owning publishers still feed the liveliness table (a
    /// standby publisher proves it is alive by emitting) but are not
    /// delivered.
    pub fn poll(&mut self) -> Result<Vec<ReceivedUnit>, PublishError> {
        let now = Instant::now();
        let mut batch = Vec::new();

        while let Some(sample) = self
            .subscriber
            .receive()
            .map_err(|e| PublishError::Receive(format!("{:?}", e)))?
        {
            let header = *sample.user_header();
            self.table
                .observe(header.publisher_id, header.strength, header.sequence, now);
            batch.push(ReceivedUnit {
                publisher_id: header.publisher_id,
                strength: header.strength,
                sequence: header.sequence,
                keyframe: header.flags & FLAG_KEYFRAME != 0,
                pts_ns: (header.pts_ns != u64::MAX).then_some(header.pts_ns),
                data: sample.payload().to_vec(),
            });
        }

        let owner = self.table.current_owner(now).map(|(id, _)| id);
        if owner != self.last_owner {
            match owner {
                Some(id) => log::info!("channel owner is now {}", uuid::Uuid::from_bytes(id)),
                None => log::warn!("channel has no live publisher"),
            }
            self.last_owner = owner;
        }
        if let Some(strength) = self.table.strength_conflict(now) {
            log::error!(
                "two live publishers share strength {}; ownership is non-deterministic",
                strength
            );
        }
        self.table.prune(now);

        let Some(owner) = owner else {
            return Ok(Vec::new());
        };
        batch.retain(|unit| unit.publisher_id == owner);
        Ok(batch)
    }

    /// Current owner as of the last poll's observations.
    pub fn current_owner(&self) -> Option<(PublisherId, i32)> {
        self.table.current_owner(Instant::now())
    }
}
