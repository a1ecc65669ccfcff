use crate::buffer_pool::SendBufferPool;
use crate::packet_header::{PacketHeader, PacketType, StatusCode};
use anyhow::Context;
use async_trait::async_trait;
use bytes::BufMut;
#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::trace;

/// This is an abstraction for sending a buffer on a UDP socket, introduced to facilitate mocking
///  the I/O part away for testing
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: Send + Sync + 'static {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]) -> anyhow::Result<()>;

    fn local_addr(&self) -> SocketAddr;
}

#[async_trait]
impl SendSocket for Arc<UdpSocket> {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]) -> anyhow::Result<()> {
        trace!("UDP socket: sending packet to {:?}", to);

        self.send_to(packet_buf, to).await
            .with_context(|| format!("sending UDP packet to {:?}", to))?;
        Ok(())
    }

    fn local_addr(&self) -> SocketAddr {
        self.as_ref().local_addr()
            .expect("UdpSocket should have an initialized local addr")
    }
}

/// Assembles and transmits outgoing PDUs. There is no retry at this level - whether a failed
///  or unacknowledged send is repeated is the call layer's decision.
pub struct SendPipeline {
    socket: Arc<dyn SendSocket>,
    buffer_pool: Arc<SendBufferPool>,
}

impl SendPipeline {
    pub fn new(socket: Arc<dyn SendSocket>, buffer_pool: Arc<SendBufferPool>) -> SendPipeline {
        SendPipeline {
            socket,
            buffer_pool,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    /// Send one or more buffer segments as a single datagram.
    pub async fn send_segments(&self, to: SocketAddr, segments: &[&[u8]]) -> anyhow::Result<()> {
        let mut send_buf = self.buffer_pool.get_from_pool();
        for segment in segments {
            send_buf.put_slice(segment);
        }

        let result = self.socket.do_send_packet(to, &send_buf).await;
        self.buffer_pool.return_to_pool(send_buf);
        result
    }

    /// Send a control PDU carrying no body, e.g. ACK, NOCALL or WORKING.
    pub async fn send_header_only(
        &self,
        to: SocketAddr,
        header: &PacketHeader,
        packet_type: PacketType,
    ) -> anyhow::Result<()> {
        trace!("sending {} packet to {:?}", packet_type.name(), to);

        let mut send_buf = self.buffer_pool.get_from_pool();
        header.with_packet_type(packet_type).ser(&mut send_buf);

        let result = self.socket.do_send_packet(to, &send_buf).await;
        self.buffer_pool.return_to_pool(send_buf);
        result
    }

    /// Send a PDU rejecting or faulting a call, carrying the status code as its body.
    pub async fn send_error_body(
        &self,
        to: SocketAddr,
        header: &PacketHeader,
        packet_type: PacketType,
        status: StatusCode,
    ) -> anyhow::Result<()> {
        trace!("sending {} packet with status {} to {:?}", packet_type.name(), status, to);

        let mut send_buf = self.buffer_pool.get_from_pool();
        header.with_packet_type(packet_type).ser(&mut send_buf);
        send_buf.put_u32(status.0);

        let result = self.socket.do_send_packet(to, &send_buf).await;
        self.buffer_pool.return_to_pool(send_buf);
        result
    }
}
