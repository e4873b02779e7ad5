//! Lane addressing.
//!
//! A lane resolves to the bus address `namespace::lane`. The lane type and
//! its `p2p` flag decide how the bus delivers to that address.

use crate::definition::{IoLane, IoLaneType};

/// Separator between namespace and lane name.
pub const ADDRESS_SEPARATOR: &str = "::";

/// Bus address of `lane` within `namespace`.
pub fn address(namespace: &str, lane: &str) -> String {
    format!("{namespace}{ADDRESS_SEPARATOR}{lane}")
}

/// Lane name part of an address: everything after the last separator.
pub fn lane_name_from_address(address: &str) -> &str {
    address
        .rsplit_once(ADDRESS_SEPARATOR)
        .map_or(address, |(_, lane)| lane)
}

/// How the bus delivers on a lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryMode {
    /// Every current subscriber receives a copy.
    Broadcast,
    /// Exactly one subscriber receives it.
    PointToPoint,
    /// One responder; the caller awaits one reply.
    RequestReply,
    /// Not routed by the bus (DATA lanes).
    Unrouted,
}

impl DeliveryMode {
    pub fn of(lane: &IoLane) -> Self {
        match lane.lane_type {
            IoLaneType::Event if lane.p2p => DeliveryMode::PointToPoint,
            IoLaneType::Event => DeliveryMode::Broadcast,
            IoLaneType::Interactive => DeliveryMode::RequestReply,
            IoLaneType::Data => DeliveryMode::Unrouted,
        }
    }
}
