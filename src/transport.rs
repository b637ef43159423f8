//! Diameter transport layer
//!
//! A transport is a framed, bidirectional byte stream: TCP, or a kernel
//! one-to-one SCTP socket which presents the same stream interface. Framing
//! follows RFC 6733 Section 2.1: the first four header bytes carry the
//! version and the 3-byte message length; the reader buffers partial reads
//! until a full message is available, regardless of transport.

use bytes::{Bytes, BytesMut};
use std::net::{IpAddr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};

use crate::error::{DiameterError, DiameterResult};
use crate::message::{DiameterMessage, DIAMETER_HEADER_SIZE};

/// Maximum Diameter message size; the length field is 24 bits
const MAX_MESSAGE_SIZE: usize = 0x00ff_ffff;

/// Transport protocol selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportKind {
    #[default]
    Tcp,
    Sctp,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Tcp => write!(f, "tcp"),
            TransportKind::Sctp => write!(f, "sctp"),
        }
    }
}

/// Extract one complete message frame from the buffer, if present
fn take_frame(buf: &mut BytesMut) -> DiameterResult<Option<Bytes>> {
    if buf.len() < DIAMETER_HEADER_SIZE {
        return Ok(None);
    }
    let msg_len = ((buf[1] as usize) << 16) | ((buf[2] as usize) << 8) | buf[3] as usize;
    if msg_len < DIAMETER_HEADER_SIZE {
        return Err(DiameterError::MalformedMessage(format!(
            "framed length {msg_len} below header size"
        )));
    }
    if msg_len > MAX_MESSAGE_SIZE {
        return Err(DiameterError::MalformedMessage(format!(
            "framed length {msg_len} exceeds maximum"
        )));
    }
    if buf.len() < msg_len {
        return Ok(None);
    }
    Ok(Some(buf.split_to(msg_len).freeze()))
}

/// Read one message from the stream, buffering partial reads.
/// `Ok(None)` is a clean end of stream at a frame boundary.
async fn read_message<R: AsyncRead + Unpin>(
    stream: &mut R,
    buf: &mut BytesMut,
) -> DiameterResult<Option<DiameterMessage>> {
    loop {
        if let Some(frame) = take_frame(buf)? {
            let mut bytes = frame;
            return Ok(Some(DiameterMessage::decode(&mut bytes)?));
        }
        let n = stream.read_buf(buf).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(DiameterError::Transport(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed mid-message",
            )));
        }
    }
}

/// A connected Diameter transport
pub struct Transport {
    stream: TcpStream,
    read_buf: BytesMut,
    peer_addr: SocketAddr,
    kind: TransportKind,
}

impl Transport {
    /// Wrap an established stream
    pub fn new(stream: TcpStream, kind: TransportKind) -> DiameterResult<Self> {
        let peer_addr = stream.peer_addr()?;
        Ok(Self {
            stream,
            read_buf: BytesMut::with_capacity(4096),
            peer_addr,
            kind,
        })
    }

    /// Connect to a peer, trying each address in order. For SCTP the
    /// address list is the multi-homed address set.
    pub async fn connect(
        addrs: Vec<IpAddr>,
        port: u16,
        kind: TransportKind,
    ) -> DiameterResult<Self> {
        if addrs.is_empty() {
            return Err(DiameterError::Transport(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "no addresses to connect to",
            )));
        }
        match kind {
            TransportKind::Tcp => {
                let mut last_err: Option<std::io::Error> = None;
                for ip in &addrs {
                    match TcpStream::connect((*ip, port)).await {
                        Ok(stream) => return Self::new(stream, kind),
                        Err(e) => last_err = Some(e),
                    }
                }
                Err(DiameterError::Transport(last_err.expect("addresses checked")))
            }
            TransportKind::Sctp => {
                let std_stream =
                    tokio::task::spawn_blocking(move || sctp::connect_stream(&addrs, port))
                        .await
                        .map_err(|e| {
                            DiameterError::Transport(std::io::Error::other(e.to_string()))
                        })??;
                std_stream.set_nonblocking(true)?;
                let stream = TcpStream::from_std(std_stream)?;
                Self::new(stream, kind)
            }
        }
    }

    /// Remote peer address
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Local socket address
    pub fn local_addr(&self) -> DiameterResult<SocketAddr> {
        Ok(self.stream.local_addr()?)
    }

    /// Transport protocol of this connection
    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Send a Diameter message
    pub async fn send(&mut self, msg: &DiameterMessage) -> DiameterResult<()> {
        let encoded = msg.encode();
        self.stream.write_all(&encoded).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Receive the next Diameter message; `None` means the peer closed the
    /// connection cleanly
    pub async fn recv(&mut self) -> DiameterResult<Option<DiameterMessage>> {
        read_message(&mut self.stream, &mut self.read_buf).await
    }

    /// Shut down the transport
    pub async fn shutdown(&mut self) -> DiameterResult<()> {
        self.stream.shutdown().await?;
        Ok(())
    }

    /// Split into independently owned read and write halves
    pub fn into_split(self) -> (FrameReader, FrameWriter) {
        let (read_half, write_half) = self.stream.into_split();
        (
            FrameReader {
                half: read_half,
                buf: self.read_buf,
            },
            FrameWriter { half: write_half },
        )
    }
}

/// Read half of a split transport, with the framing buffer
pub struct FrameReader {
    half: OwnedReadHalf,
    buf: BytesMut,
}

impl FrameReader {
    /// Receive the next message; `None` is a clean close
    pub async fn recv(&mut self) -> DiameterResult<Option<DiameterMessage>> {
        read_message(&mut self.half, &mut self.buf).await
    }
}

/// Write half of a split transport
pub struct FrameWriter {
    half: OwnedWriteHalf,
}

impl FrameWriter {
    /// Write pre-encoded frame bytes
    pub async fn send_bytes(&mut self, frame: &[u8]) -> DiameterResult<()> {
        self.half.write_all(frame).await?;
        self.half.flush().await?;
        Ok(())
    }

    /// Shut down the write direction
    pub async fn shutdown(&mut self) -> DiameterResult<()> {
        self.half.shutdown().await?;
        Ok(())
    }
}

/// A listening socket accepting Diameter transports
pub struct Listener {
    inner: TcpListener,
    kind: TransportKind,
}

impl Listener {
    /// Bind a listener on the given address and port
    pub async fn bind(addr: IpAddr, port: u16, kind: TransportKind) -> DiameterResult<Self> {
        match kind {
            TransportKind::Tcp => {
                let inner = TcpListener::bind((addr, port)).await?;
                Ok(Self { inner, kind })
            }
            TransportKind::Sctp => {
                let std_listener = sctp::listen_stream(SocketAddr::new(addr, port), 128)?;
                std_listener.set_nonblocking(true)?;
                let inner = TcpListener::from_std(std_listener)?;
                Ok(Self { inner, kind })
            }
        }
    }

    /// Accept the next incoming connection
    pub async fn accept(&self) -> DiameterResult<Transport> {
        let (stream, _addr) = self.inner.accept().await?;
        Transport::new(stream, self.kind)
    }

    /// Bound local address
    pub fn local_addr(&self) -> DiameterResult<SocketAddr> {
        Ok(self.inner.local_addr()?)
    }
}

/// Kernel one-to-one SCTP sockets. The fd behaves as a byte stream, so the
/// standard stream wrappers adopt it; SCTP-level tunables are not exposed.
#[cfg(target_os = "linux")]
mod sctp {
    use std::io;
    use std::mem;
    use std::net::{IpAddr, SocketAddr, TcpListener as StdTcpListener, TcpStream as StdTcpStream};
    use std::os::fd::FromRawFd;

    use libc::{
        c_int, sa_family_t, sockaddr, sockaddr_in, sockaddr_in6, socklen_t, AF_INET, AF_INET6,
        IPPROTO_SCTP, SOCK_STREAM, SOL_SOCKET, SO_REUSEADDR,
    };

    fn with_sockaddr<T>(
        addr: SocketAddr,
        f: impl FnOnce(*const sockaddr, socklen_t) -> T,
    ) -> T {
        match addr {
            SocketAddr::V4(v4) => {
                let sin = sockaddr_in {
                    sin_family: AF_INET as sa_family_t,
                    sin_port: v4.port().to_be(),
                    sin_addr: libc::in_addr {
                        s_addr: u32::from_ne_bytes(v4.ip().octets()),
                    },
                    sin_zero: [0; 8],
                };
                f(
                    &sin as *const sockaddr_in as *const sockaddr,
                    mem::size_of::<sockaddr_in>() as socklen_t,
                )
            }
            SocketAddr::V6(v6) => {
                let sin6 = sockaddr_in6 {
                    sin6_family: AF_INET6 as sa_family_t,
                    sin6_port: v6.port().to_be(),
                    sin6_flowinfo: 0,
                    sin6_addr: libc::in6_addr {
                        s6_addr: v6.ip().octets(),
                    },
                    sin6_scope_id: 0,
                };
                f(
                    &sin6 as *const sockaddr_in6 as *const sockaddr,
                    mem::size_of::<sockaddr_in6>() as socklen_t,
                )
            }
        }
    }

    fn sctp_socket(addr: SocketAddr) -> io::Result<c_int> {
        let family = match addr {
            SocketAddr::V4(_) => AF_INET,
            SocketAddr::V6(_) => AF_INET6,
        };
        let fd = unsafe { libc::socket(family, SOCK_STREAM, IPPROTO_SCTP) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(fd)
    }

    pub fn connect_stream(addrs: &[IpAddr], port: u16) -> io::Result<StdTcpStream> {
        let mut last_err = None;
        for ip in addrs {
            let addr = SocketAddr::new(*ip, port);
            match connect_one(addr) {
                Ok(stream) => return Ok(stream),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no addresses")))
    }

    fn connect_one(addr: SocketAddr) -> io::Result<StdTcpStream> {
        let fd = sctp_socket(addr)?;
        let rc = with_sockaddr(addr, |sa, len| unsafe { libc::connect(fd, sa, len) });
        if rc != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }
        Ok(unsafe { StdTcpStream::from_raw_fd(fd) })
    }

    pub fn listen_stream(addr: SocketAddr, backlog: c_int) -> io::Result<StdTcpListener> {
        let fd = sctp_socket(addr)?;
        let one: c_int = 1;
        let rc = unsafe {
            libc::setsockopt(
                fd,
                SOL_SOCKET,
                SO_REUSEADDR,
                &one as *const c_int as *const libc::c_void,
                mem::size_of::<c_int>() as socklen_t,
            )
        };
        if rc != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }
        let rc = with_sockaddr(addr, |sa, len| unsafe { libc::bind(fd, sa, len) });
        if rc != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }
        let rc = unsafe { libc::listen(fd, backlog) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }
        Ok(unsafe { StdTcpListener::from_raw_fd(fd) })
    }
}

#[cfg(not(target_os = "linux"))]
mod sctp {
    use std::io;
    use std::net::{IpAddr, SocketAddr, TcpListener as StdTcpListener, TcpStream as StdTcpStream};

    pub fn connect_stream(_addrs: &[IpAddr], _port: u16) -> io::Result<StdTcpStream> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "kernel SCTP is only available on Linux",
        ))
    }

    pub fn listen_stream(_addr: SocketAddr, _backlog: i32) -> io::Result<StdTcpListener> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "kernel SCTP is only available on Linux",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::avp::{Avp, AvpValue};
    use crate::common::{avp_code, base_cmd};
    use tokio::io::AsyncWriteExt as _;

    #[tokio::test]
    async fn test_transport_send_recv() {
        let listener = Listener::bind("127.0.0.1".parse().unwrap(), 0, TransportKind::Tcp)
            .await
            .unwrap();
        let listen_addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let mut server = listener.accept().await.unwrap();
            let msg = server.recv().await.unwrap().unwrap();
            let answer = DiameterMessage::new_answer(&msg);
            server.send(&answer).await.unwrap();
            server.shutdown().await.unwrap();
        });

        let mut client = Transport::connect(
            vec![listen_addr.ip()],
            listen_addr.port(),
            TransportKind::Tcp,
        )
        .await
        .unwrap();

        let mut req = DiameterMessage::new_request(base_cmd::CAPABILITIES_EXCHANGE, 0);
        req.add_avp(Avp::mandatory(
            avp_code::ORIGIN_HOST,
            AvpValue::Identity("client.example.net".to_string()),
        ));
        req.header.hop_by_hop_id = 1;
        req.header.end_to_end_id = 1;
        client.send(&req).await.unwrap();

        let answer = client.recv().await.unwrap().unwrap();
        assert!(answer.header.is_answer());
        assert_eq!(answer.header.command_code, base_cmd::CAPABILITIES_EXCHANGE);
        assert_eq!(answer.header.hop_by_hop_id, 1);

        // clean close yields None
        assert!(client.recv().await.unwrap().is_none());
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_framing_reassembles_partial_reads() {
        let listener = Listener::bind("127.0.0.1".parse().unwrap(), 0, TransportKind::Tcp)
            .await
            .unwrap();
        let listen_addr = listener.local_addr().unwrap();

        let mut msg = DiameterMessage::new_request(base_cmd::DEVICE_WATCHDOG, 0);
        msg.add_avp(Avp::mandatory(
            avp_code::ORIGIN_HOST,
            AvpValue::Identity("dribbler.example.net".to_string()),
        ));
        let encoded = msg.encode().freeze();

        let bytes = encoded.clone();
        let handle = tokio::spawn(async move {
            let mut raw = TcpStream::connect(listen_addr).await.unwrap();
            // drip the message a few bytes at a time
            for chunk in bytes.chunks(7) {
                raw.write_all(chunk).await.unwrap();
                raw.flush().await.unwrap();
                tokio::time::sleep(std::time::Duration::from_millis(2)).await;
            }
            raw.shutdown().await.unwrap();
        });

        let mut server = listener.accept().await.unwrap();
        let received = server.recv().await.unwrap().unwrap();
        assert_eq!(received.header.command_code, base_cmd::DEVICE_WATCHDOG);
        assert_eq!(received.origin_host(), Some("dribbler.example.net"));
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_mid_message_eof_is_an_error() {
        let listener = Listener::bind("127.0.0.1".parse().unwrap(), 0, TransportKind::Tcp)
            .await
            .unwrap();
        let listen_addr = listener.local_addr().unwrap();

        let msg = DiameterMessage::new_request(base_cmd::DEVICE_WATCHDOG, 0);
        let encoded = msg.encode().freeze();

        let handle = tokio::spawn(async move {
            let mut raw = TcpStream::connect(listen_addr).await.unwrap();
            raw.write_all(&encoded[..10]).await.unwrap();
            raw.shutdown().await.unwrap();
        });

        let mut server = listener.accept().await.unwrap();
        assert!(server.recv().await.is_err());
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_split_halves() {
        let listener = Listener::bind("127.0.0.1".parse().unwrap(), 0, TransportKind::Tcp)
            .await
            .unwrap();
        let listen_addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let mut server = listener.accept().await.unwrap();
            for _ in 0..3 {
                let msg = server.recv().await.unwrap().unwrap();
                let answer = DiameterMessage::new_answer(&msg);
                server.send(&answer).await.unwrap();
            }
        });

        let client = Transport::connect(
            vec![listen_addr.ip()],
            listen_addr.port(),
            TransportKind::Tcp,
        )
        .await
        .unwrap();
        let (mut reader, mut writer) = client.into_split();

        for i in 0..3u32 {
            let mut req = DiameterMessage::new_request(base_cmd::DEVICE_WATCHDOG, 0);
            req.header.hop_by_hop_id = i;
            writer.send_bytes(&req.encode()).await.unwrap();
            let answer = reader.recv().await.unwrap().unwrap();
            assert_eq!(answer.header.hop_by_hop_id, i);
        }
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_connection_refused() {
        // port 1 should refuse on loopback
        let result = Transport::connect(
            vec!["127.0.0.1".parse().unwrap()],
            1,
            TransportKind::Tcp,
        )
        .await;
        assert!(result.is_err());
    }

    #[test]
    fn test_take_frame_rejects_bad_length() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[1, 0, 0, 4]);
        buf.extend_from_slice(&[0u8; 16]);
        assert!(take_frame(&mut buf).is_err());
    }
}
