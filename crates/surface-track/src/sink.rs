//! Pose consumers.

use std::io::{self, Write};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs, UdpSocket};

use log::info;
use rosc::{encoder, OscMessage, OscPacket, OscType};

use crate::convention::PoseSample;

#[derive(thiserror::Error, Debug)]
pub enum SinkError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("OSC encoding failed: {0}")]
    Osc(#[from] rosc::OscError),
}

/// Receives one sample per tracked marker per cycle.
pub trait PoseSink {
    fn emit(&mut self, sample: &PoseSample) -> Result<(), SinkError>;

    /// Called once per cycle after all samples were emitted.
    fn flush(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

impl<K: PoseSink + ?Sized> PoseSink for Box<K> {
    fn emit(&mut self, sample: &PoseSample) -> Result<(), SinkError> {
        (**self).emit(sample)
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        (**self).flush()
    }
}

/// Logs every sample at `info`.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogSink;

impl PoseSink for LogSink {
    fn emit(&mut self, s: &PoseSample) -> Result<(), SinkError> {
        info!(
            "id={} center=({:.1}, {:.1}) angle={:.1} [{:?}]",
            s.id, s.x, s.y, s.angle_deg, s.status
        );
        Ok(())
    }
}

/// Writes `id x y angle` lines.
#[derive(Debug)]
pub struct TextSink<W: Write> {
    out: W,
}

impl<W: Write> TextSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> PoseSink for TextSink<W> {
    fn emit(&mut self, s: &PoseSample) -> Result<(), SinkError> {
        writeln!(self.out, "{} {:.3} {:.3} {:.3}", s.id, s.x, s.y, s.angle_deg)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        self.out.flush()?;
        Ok(())
    }
}

/// Fire-and-forget OSC over UDP: `/marker/<id>` with float args `x, y, angle`.
#[derive(Debug)]
pub struct OscSink {
    socket: UdpSocket,
}

impl OscSink {
    /// Resolve `target` and send from an ephemeral port of the same address family.
    pub fn connect(target: impl ToSocketAddrs) -> Result<Self, SinkError> {
        let target = target.to_socket_addrs()?.next().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "OSC target resolved to no address")
        })?;
        let socket = UdpSocket::bind(local_addr_for(&target))?;
        socket.connect(target)?;
        Ok(Self { socket })
    }

    pub fn message(sample: &PoseSample) -> OscMessage {
        OscMessage {
            addr: format!("/marker/{}", sample.id),
            args: vec![
                OscType::Float(sample.x as f32),
                OscType::Float(sample.y as f32),
                OscType::Float(sample.angle_deg as f32),
            ],
        }
    }
}

fn local_addr_for(target: &SocketAddr) -> SocketAddr {
    match target {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    }
}

impl PoseSink for OscSink {
    fn emit(&mut self, sample: &PoseSample) -> Result<(), SinkError> {
        let data = encoder::encode(&OscPacket::Message(Self::message(sample)))?;
        self.socket.send(&data)?;
        Ok(())
    }
}

/// Keeps every sample in memory, grouped by cycle.
#[derive(Clone, Debug, Default)]
pub struct RecordingSink {
    samples: Vec<PoseSample>,
    cycles: Vec<usize>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn samples(&self) -> &[PoseSample] {
        &self.samples
    }

    /// Samples grouped per flushed cycle; cycles that emitted nothing are empty.
    pub fn cycles(&self) -> Vec<&[PoseSample]> {
        let mut start = 0;
        self.cycles
            .iter()
            .map(|&end| {
                let chunk = &self.samples[start..end];
                start = end;
                chunk
            })
            .collect()
    }
}

impl PoseSink for RecordingSink {
    fn emit(&mut self, sample: &PoseSample) -> Result<(), SinkError> {
        self.samples.push(*sample);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        self.cycles.push(self.samples.len());
        Ok(())
    }
}
