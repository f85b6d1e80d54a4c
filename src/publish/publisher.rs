//! Publisher side of the exclusive-ownership channel

use std::time::{Duration, Instant};

use iceoryx2::node::NodeBuilder;
use iceoryx2::port::publisher::Publisher;
use iceoryx2::prelude::*;

use super::{
    EncodedUnit, OwnershipIdentity, PublishError, PublishInitError, UnitHeader, FLAG_KEYFRAME,
    INITIAL_MAX_UNIT_BYTES,
};

/// Cap on the startup peer scan so a conflict-free start stays fast
const PEER_SCAN_CAP: Duration = Duration::from_millis(500);

/// A publisher instance bound to one channel with a fixed strength.
///
/// `publish` is called from the pipeline's worker thread; it never blocks on
/// the preview path and per-unit failures are reported, not escalated.
pub struct OwnershipPublisher {
    identity: OwnershipIdentity,
    publisher_id: [u8; 16],
    publisher: Publisher<ipc::Service, [u8], UnitHeader>,
    // The node owns the bus resources the ports were created from; it must
    // outlive the publisher port.
    _node: Node<ipc::Service>,
}

impl OwnershipPublisher {
    /// Create the channel service and this instance's publisher port.
    ///
    /// Before the port is created, the channel is scanned for a bounded
    /// window: observing another live publisher advertising the same
    /// strength aborts startup, because equal strengths make ownership
    /// arbitration non-deterministic.
    pub fn initialize(identity: OwnershipIdentity) -> Result<Self, PublishInitError> {
        let node = NodeBuilder::new()
            .create::<ipc::Service>()
            .map_err(|e| PublishInitError::Node(format!("{:?}", e)))?;

        let service_name: ServiceName = identity.channel_name.as_str().try_into().map_err(|e| {
            PublishInitError::ChannelName(identity.channel_name.clone(), format!("{:?}", e))
        })?;

        let service = node
            .service_builder(&service_name)
            .publish_subscribe::<[u8]>()
            .user_header::<UnitHeader>()
            .open_or_create()
            .map_err(|e| PublishInitError::Service(format!("{:?}", e)))?;

        let publisher_id = *uuid::Uuid::new_v4().as_bytes();
        scan_for_strength_conflict(&service, &identity, &publisher_id)?;

        let publisher = service
            .publisher_builder()
            .initial_max_slice_len(INITIAL_MAX_UNIT_BYTES)
            .allocation_strategy(AllocationStrategy::PowerOfTwo)
            .create()
            .map_err(|e| PublishInitError::Port(format!("{:?}", e)))?;

        log::info!(
            "publisher {} on channel {:?} with strength {} (liveliness {} ms)",
            uuid::Uuid::from_bytes(publisher_id),
            identity.channel_name,
            identity.strength,
            identity.liveliness_timeout.as_millis()
        );

        Ok(Self {
            identity,
            publisher_id,
            publisher,
            _node: node,
        })
    }

    pub fn identity(&self) -> &OwnershipIdentity {
        &self.identity
    }

    pub fn publisher_id(&self) -> [u8; 16] {
        self.publisher_id
    }

    /// Publish one encoded unit.
    ///
    /// Fire-and-forget from the pipeline's perspective: the caller logs
    /// failures and keeps the pipeline running.
    pub fn publish(&self, unit: &EncodedUnit) -> Result<(), PublishError> {
        let size = unit.data.len();
        let mut sample =
            self.publisher
                .loan_slice_uninit(size)
                .map_err(|e| PublishError::Loan {
                    size,
                    message: format!("{:?}", e),
                })?;

        let header = sample.user_header_mut();
        header.publisher_id = self.publisher_id;
        header.strength = self.identity.strength;
        header.sequence = unit.sequence;
        header.pts_ns = unit.pts_ns.unwrap_or(u64::MAX);
        header.flags = if unit.keyframe { FLAG_KEYFRAME } else { 0 };

        let sample = sample.write_from_slice(&unit.data);
        sample.send().map_err(|e| PublishError::Send {
            sequence: unit.sequence,
            message: format!("{:?}", e),
        })?;

        Ok(())
    }
}

type ChannelService = iceoryx2::service::port_factory::publish_subscribe::PortFactory<
    ipc::Service,
    [u8],
    UnitHeader,
>;

/// Watch the channel briefly for a live peer claiming our strength.
///
/// Only an actively emitting peer is detectable; that is exactly the case
/// where equal strengths would corrupt arbitration.
fn scan_for_strength_conflict(
    service: &ChannelService,
    identity: &OwnershipIdentity,
    own_id: &[u8; 16],
) -> Result<(), PublishInitError> {
    let subscriber = service
        .subscriber_builder()
        .create()
        .map_err(|e| PublishInitError::Port(format!("{:?}", e)))?;

    let window = identity.liveliness_timeout.min(PEER_SCAN_CAP);
    let deadline = Instant::now() + window;

    while Instant::now() < deadline {
        while let Ok(Some(sample)) = subscriber.receive() {
            let header = sample.user_header();
            if header.strength == identity.strength && &header.publisher_id != own_id {
                return Err(PublishInitError::StrengthConflict {
                    strength: identity.strength,
                });
            }
        }
        std::thread::sleep(Duration::from_millis(20));
    }

    Ok(())
}
