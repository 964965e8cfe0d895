use std::any::Any;

use bytes::Bytes;

use crate::stream::Rational;

/// Coded packet copied out of the engine.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PacketData {
    pub data: Bytes,
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    pub duration: i64,
    pub key: bool,
    pub time_base: Rational,
}

/// Opaque engine-owned packet. Dropping it releases the native packet.
pub struct PacketPtr(Box<dyn Any + Send>);

impl PacketPtr {
    pub fn new<T: Any + Send>(inner: T) -> Self {
        Self(Box::new(inner))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }

    pub fn downcast_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.0.downcast_mut()
    }

    pub fn downcast<T: Any>(self) -> Result<T, Self> {
        match self.0.downcast::<T>() {
            Ok(inner) => Ok(*inner),
            Err(inner) => Err(Self(inner)),
        }
    }
}

impl std::fmt::Debug for PacketPtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PacketPtr(..)")
    }
}

#[derive(Debug)]
pub enum Packet {
    Value(PacketData),
    Ptr(PacketPtr),
}

impl Packet {
    pub fn is_ptr(&self) -> bool {
        matches!(self, Packet::Ptr(_))
    }
}

impl From<PacketData> for Packet {
    fn from(data: PacketData) -> Self {
        Packet::Value(data)
    }
}

#[derive(Debug)]
pub struct StreamPacket {
    pub stream_index: usize,
    pub packet: Packet,
}

impl StreamPacket {
    pub fn new(stream_index: usize, packet: impl Into<Packet>) -> Self {
        Self {
            stream_index,
            packet: packet.into(),
        }
    }
}
