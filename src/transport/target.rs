//! Outbound target descriptors

use serde::{Deserialize, Serialize};
use std::fmt;

use super::{EndpointId, PartitionId};
use crate::protocol::Side;

/// A point in a partition plus a radius, for proximity delivery
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TargetPoint {
    pub partition: PartitionId,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub range: f64,
}

impl TargetPoint {
    pub fn new(partition: PartitionId, x: f64, y: f64, z: f64, range: f64) -> Self {
        Self {
            partition,
            x,
            y,
            z,
            range,
        }
    }

    /// Strictly inside the sphere, in the same partition
    pub fn contains(&self, partition: PartitionId, position: Position) -> bool {
        if partition != self.partition {
            return false;
        }
        let dx = self.x - position.x;
        let dy = self.y - position.y;
        let dz = self.z - position.z;
        dx * dx + dy * dy + dz * dz < self.range * self.range
    }
}

/// Location of an endpoint, maintained by the host application
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Position {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }
}

/// Which connection(s) an outbound message is delivered to.
///
/// Built right before a send and consumed by it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Target {
    /// Every connected client
    All,
    /// The client behind one endpoint
    Single(EndpointId),
    /// Clients near a point
    AroundPoint(TargetPoint),
    /// Clients in one partition
    Partition(PartitionId),
    /// The server, from a client
    ToOriginatingEndpoint,
}

impl Target {
    /// Side that processes a message sent with this target
    pub fn processing_side(&self) -> Side {
        match self {
            Target::ToOriginatingEndpoint => Side::Originating,
            _ => Side::Receiving,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Target::All => "all",
            Target::Single(_) => "single",
            Target::AroundPoint(_) => "around-point",
            Target::Partition(_) => "partition",
            Target::ToOriginatingEndpoint => "to-server",
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::All => f.write_str("all"),
            Target::Single(endpoint) => write!(f, "{}", endpoint),
            Target::AroundPoint(p) => write!(
                f,
                "{} around ({}, {}, {}) r={}",
                p.partition, p.x, p.y, p.z, p.range
            ),
            Target::Partition(partition) => write!(f, "{}", partition),
            Target::ToOriginatingEndpoint => f.write_str("server"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_processing_side() {
        assert_eq!(Target::All.processing_side(), Side::Receiving);
        assert_eq!(Target::Partition(PartitionId(-1)).processing_side(), Side::Receiving);
        assert_eq!(
            Target::ToOriginatingEndpoint.processing_side(),
            Side::Originating
        );
    }

    #[test]
    fn test_point_range_is_exclusive() {
        let point = TargetPoint::new(PartitionId(0), 0.0, 64.0, 0.0, 10.0);
        assert!(point.contains(PartitionId(0), Position::new(3.0, 64.0, 4.0)));
        assert!(!point.contains(PartitionId(0), Position::new(10.0, 64.0, 0.0)));
        assert!(!point.contains(PartitionId(1), Position::new(0.0, 64.0, 0.0)));
    }
}
