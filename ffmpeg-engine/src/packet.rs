use avchain::{
    packet::{Packet, PacketData, PacketPtr},
    stream::Rational,
};
use bytes::Bytes;
use ffmpeg_next::codec::packet;

use crate::stream::av_rational;

/// Native packet carried behind a [`PacketPtr`].
#[derive(Clone)]
pub struct RawPacket {
    packet: packet::Packet,
    time_base: Rational,
}

impl RawPacket {
    pub fn pts(&self) -> Option<i64> {
        self.packet.pts()
    }

    pub fn size(&self) -> usize {
        self.packet.size()
    }

    pub fn time_base(&self) -> Rational {
        self.time_base
    }

    pub fn get_mut(&mut self) -> &mut packet::Packet {
        &mut self.packet
    }

    pub fn packet(&self) -> &packet::Packet {
        &self.packet
    }

    /// Rescales timestamps in place and adopts `time_base`.
    pub fn rescale(&mut self, time_base: Rational) {
        if time_base != self.time_base {
            self.packet
                .rescale_ts(av_rational(self.time_base), av_rational(time_base));
            self.time_base = time_base;
        }
    }

    pub fn from_data(data: &PacketData) -> Self {
        let mut packet = packet::Packet::copy(&data.data);
        packet.set_pts(data.pts);
        packet.set_dts(data.dts);
        packet.set_duration(data.duration);
        if data.key {
            packet.set_flags(packet::Flags::KEY);
        }
        Self {
            packet,
            time_base: data.time_base,
        }
    }

    pub fn to_data(&self) -> PacketData {
        PacketData {
            data: self
                .packet
                .data()
                .map(Bytes::copy_from_slice)
                .unwrap_or_default(),
            pts: self.packet.pts(),
            dts: self.packet.dts(),
            duration: self.packet.duration(),
            key: self.packet.is_key(),
            time_base: self.time_base,
        }
    }

    /// Takes ownership of a pipeline packet in either representation.
    pub fn from_packet(packet: Packet) -> anyhow::Result<Self> {
        match packet {
            Packet::Value(data) => Ok(Self::from_data(&data)),
            Packet::Ptr(ptr) => ptr
                .downcast::<RawPacket>()
                .map_err(|_| anyhow::anyhow!("packet pointer was not created by this engine")),
        }
    }

    pub fn into_packet(self, ptr: bool) -> Packet {
        if ptr {
            Packet::Ptr(PacketPtr::new(self))
        } else {
            Packet::Value(self.to_data())
        }
    }
}

impl From<(packet::Packet, Rational)> for RawPacket {
    fn from((packet, time_base): (packet::Packet, Rational)) -> Self {
        Self { packet, time_base }
    }
}
