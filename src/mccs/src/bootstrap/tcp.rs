use std::net::SocketAddr;

use byteorder::{ByteOrder, LittleEndian};
use bytes::buf::{Buf, BufMut};
use smol::io::{AsyncReadExt, AsyncWriteExt};
use smol::lock::Mutex;
use smol::net::{TcpListener, TcpStream};
use socket2::Socket;

use super::{check_all_gather_size, Bootstrap, BootstrapError, BootstrapHandle};
use crate::utils::tcp::{self, SOCK_ADDR_ENCODE_SIZE};

const EXCHANGE_INFO_SEND_SIZE: usize = 80;

struct BootstrapExchangeInfo {
    rank: usize,
    num_ranks: usize,
    listen_addr_root: SocketAddr,
    listen_addr: SocketAddr,
}

impl BootstrapExchangeInfo {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u64(self.rank as u64);
        buf.put_u64(self.num_ranks as u64);
        tcp::encode_socket_addr(&self.listen_addr_root, buf);
        tcp::encode_socket_addr(&self.listen_addr, buf);
    }

    fn decode<B: Buf>(buf: &mut B) -> std::io::Result<Self> {
        let rank = buf.get_u64() as usize;
        let num_ranks = buf.get_u64() as usize;
        let listen_addr_root = tcp::decode_socket_addr(buf)?;
        let listen_addr = tcp::decode_socket_addr(buf)?;
        Ok(Self {
            rank,
            num_ranks,
            listen_addr_root,
            listen_addr,
        })
    }
}

struct UnexpectedConn {
    stream: TcpStream,
    peer: usize,
    tag: u32,
}

struct BootstrapRing {
    ring_recv: TcpStream,
    ring_send: TcpStream,
}

async fn bootstrap_net_send(stream: &mut TcpStream, data: &[u8]) -> Result<(), BootstrapError> {
    let mut buf = [0u8; 4];
    LittleEndian::write_u32(&mut buf, data.len() as u32);
    stream.write_all(&buf).await?;
    stream.write_all(data).await?;
    Ok(())
}

async fn bootstrap_net_recv(stream: &mut TcpStream) -> Result<Vec<u8>, BootstrapError> {
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).await?;
    let recv_size = LittleEndian::read_u32(&buf);
    let mut data = vec![0u8; recv_size as usize];
    stream.read_exact(&mut data).await?;
    Ok(data)
}

async fn bootstrap_net_recv_exact(
    stream: &mut TcpStream,
    data: &mut [u8],
) -> Result<(), BootstrapError> {
    let received = bootstrap_net_recv(stream).await?;
    if received.len() != data.len() {
        return Err(BootstrapError::AllGatherSize(received.len(), 1, data.len()));
    }
    data.copy_from_slice(&received);
    Ok(())
}

/// Binds the root listener and draws a fresh magic number.
pub fn bootstrap_create_root(
    listen_addr: &SocketAddr,
) -> Result<(Socket, BootstrapHandle), BootstrapError> {
    let socket = if listen_addr.is_ipv4() {
        Socket::new(socket2::Domain::IPV4, socket2::Type::STREAM, None)?
    } else {
        Socket::new(socket2::Domain::IPV6, socket2::Type::STREAM, None)?
    };
    socket.set_reuse_address(true)?;
    socket.set_reuse_port(true)?;
    socket.bind(&listen_addr.to_owned().into())?;
    socket.set_nonblocking(true)?;

    let addr = socket.local_addr()?.as_socket().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::AddrNotAvailable,
            "root socket is not bound to an inet address",
        )
    })?;
    let magic = rand::random();
    let handle = BootstrapHandle { addr, magic };
    Ok((socket, handle))
}

/// Collects every rank's listen addresses and tells each rank its ring successor.
pub async fn bootstrap_root(listen_sock: Socket, magic: u64) -> Result<(), BootstrapError> {
    listen_sock.listen(16384)?;
    let listener: std::net::TcpListener = listen_sock.into();
    let listener = TcpListener::try_from(listener)?;

    let mut rank_addrs: Vec<Option<SocketAddr>> = Vec::new();
    let mut rank_addrs_root: Vec<Option<SocketAddr>> = Vec::new();
    let mut num_ranks = 0;
    let mut received = 0;
    loop {
        let mut stream = tcp::async_accept(&listener, magic).await?;
        let recv_buf = bootstrap_net_recv(&mut stream).await?;
        let exchange_info = BootstrapExchangeInfo::decode(&mut recv_buf.as_slice())?;
        if received == 0 {
            num_ranks = exchange_info.num_ranks;
            rank_addrs = vec![None; num_ranks];
            rank_addrs_root = vec![None; num_ranks];
        } else if exchange_info.num_ranks != num_ranks {
            return Err(BootstrapError::NumRanksMismatch(
                exchange_info.num_ranks,
                num_ranks,
            ));
        }
        if exchange_info.rank >= num_ranks {
            return Err(BootstrapError::RankOverflow(exchange_info.rank));
        }
        if rank_addrs[exchange_info.rank].is_some() {
            return Err(BootstrapError::DuplicatedCheckIn(exchange_info.rank));
        }
        rank_addrs[exchange_info.rank] = Some(exchange_info.listen_addr);
        rank_addrs_root[exchange_info.rank] = Some(exchange_info.listen_addr_root);
        received += 1;
        log::trace!(
            "Bootstrap root received check-in from rank {}",
            exchange_info.rank
        );
        if received == num_ranks {
            break;
        }
    }

    let rank_addrs = rank_addrs.into_iter().flatten().collect::<Vec<_>>();
    let rank_addrs_root = rank_addrs_root.into_iter().flatten().collect::<Vec<_>>();
    for r in 0..num_ranks {
        let next = (r + 1) % num_ranks;
        let connect_addr = &rank_addrs_root[r];
        log::trace!("Bootstrap root connecting to {:?}", connect_addr);
        let mut stream = tcp::async_connect(connect_addr, magic).await?;
        let mut send_buf = [0u8; SOCK_ADDR_ENCODE_SIZE];
        let mut buf = send_buf.as_mut_slice();
        tcp::encode_socket_addr(&rank_addrs[next], &mut buf);
        bootstrap_net_send(&mut stream, send_buf.as_slice()).await?;
    }
    log::trace!("Bootstrap root has sent out all peer addresses");
    Ok(())
}

/// Runs the bootstrap root on a dedicated thread.
pub fn spawn_root(
    listen_addr: &SocketAddr,
) -> Result<
    (
        BootstrapHandle,
        std::thread::JoinHandle<Result<(), BootstrapError>>,
    ),
    BootstrapError,
> {
    let (socket, handle) = bootstrap_create_root(listen_addr)?;
    let magic = handle.magic;
    let root = std::thread::Builder::new()
        .name("bootstrap-root".to_string())
        .spawn(move || smol::block_on(bootstrap_root(socket, magic)))?;
    Ok((handle, root))
}

/// TCP bootstrap: a root collects listen addresses, ranks form a ring for
/// collectives and open a fresh connection per point-to-point message.
pub struct TcpBootstrap {
    listener: TcpListener,
    ring: Mutex<BootstrapRing>,
    peer_addrs: Vec<SocketAddr>,
    unexpected_connections: Mutex<Vec<UnexpectedConn>>,
    rank: usize,
    num_ranks: usize,
    num_ranks_per_node: usize,
    magic: u64,
}

impl TcpBootstrap {
    /// Joins the bootstrap rooted at `handle`. Blocks until every rank checked in.
    pub fn init(
        handle: BootstrapHandle,
        listen_addr: SocketAddr,
        rank: usize,
        num_ranks: usize,
        num_ranks_per_node: usize,
    ) -> Result<Self, BootstrapError> {
        smol::block_on(Self::init_async(
            handle,
            listen_addr,
            rank,
            num_ranks,
            num_ranks_per_node,
        ))
    }

    async fn init_async(
        handle: BootstrapHandle,
        listen_addr: SocketAddr,
        rank: usize,
        num_ranks: usize,
        num_ranks_per_node: usize,
    ) -> Result<Self, BootstrapError> {
        let mut listen_addr = listen_addr.to_owned();
        listen_addr.set_port(0);

        let peer_listener = tcp::async_listen(&listen_addr)?;
        let peer_listen_addr = peer_listener.local_addr()?;
        let root_listener = tcp::async_listen(&listen_addr)?;
        let root_listen_addr = root_listener.local_addr()?;
        log::trace!(
            "Rank {} of {} root listening on {:?}",
            rank,
            num_ranks,
            root_listen_addr
        );

        if num_ranks > 128 {
            let dura = std::time::Duration::from_millis(rank as u64);
            log::trace!("Rank {} delaying connection to root by {} ms", rank, rank);
            smol::Timer::after(dura).await;
        }

        log::trace!(
            "Rank {} of {} connecting to root {:?}",
            rank,
            num_ranks,
            handle.addr
        );
        let mut stream = tcp::async_connect(&handle.addr, handle.magic).await?;
        let info = BootstrapExchangeInfo {
            rank,
            num_ranks,
            listen_addr_root: root_listen_addr,
            listen_addr: peer_listen_addr,
        };

        // send info on my listening socket to root
        let mut send_buf = [0u8; EXCHANGE_INFO_SEND_SIZE];
        let mut buf = send_buf.as_mut_slice();
        info.encode(&mut buf);
        bootstrap_net_send(&mut stream, send_buf.as_slice()).await?;

        // get info on my next rank in the bootstrap ring from root
        let mut stream = tcp::async_accept(&root_listener, handle.magic).await?;
        let recv_buf = bootstrap_net_recv(&mut stream).await?;
        let next_addr = tcp::decode_socket_addr(&mut recv_buf.as_slice())?;

        let mut ring_send = tcp::async_connect(&next_addr, handle.magic).await?;
        let mut ring_recv = tcp::async_accept(&peer_listener, handle.magic).await?;

        let mut all_addrs_buf = vec![0u8; SOCK_ADDR_ENCODE_SIZE * num_ranks];
        let mut my_buf =
            &mut all_addrs_buf[rank * SOCK_ADDR_ENCODE_SIZE..(rank + 1) * SOCK_ADDR_ENCODE_SIZE];
        tcp::encode_socket_addr(&peer_listen_addr, &mut my_buf);
        ring_all_gather_internal(
            &mut ring_send,
            &mut ring_recv,
            rank,
            num_ranks,
            all_addrs_buf.as_mut_slice(),
            SOCK_ADDR_ENCODE_SIZE,
        )
        .await?;
        let mut peer_addrs = Vec::with_capacity(num_ranks);
        for i in 0..num_ranks {
            let mut buf = &all_addrs_buf[i * SOCK_ADDR_ENCODE_SIZE..(i + 1) * SOCK_ADDR_ENCODE_SIZE];
            peer_addrs.push(tcp::decode_socket_addr(&mut buf)?);
        }
        log::debug!("Bootstrap rank {} of {} joined the ring", rank, num_ranks);
        Ok(TcpBootstrap {
            listener: peer_listener,
            ring: Mutex::new(BootstrapRing {
                ring_send,
                ring_recv,
            }),
            peer_addrs,
            unexpected_connections: Mutex::new(Vec::new()),
            rank,
            num_ranks,
            num_ranks_per_node,
            magic: handle.magic,
        })
    }

    async fn unexpected_dequeue(&self, peer: usize, tag: u32) -> Option<TcpStream> {
        let mut connections = self.unexpected_connections.lock().await;
        let idx = connections
            .iter()
            .position(|c| c.peer == peer && c.tag == tag);
        // keep arrival order among connections with the same peer and tag
        idx.map(|idx| connections.remove(idx).stream)
    }

    async fn send_async(&self, data: &[u8], peer: usize, tag: u32) -> Result<(), BootstrapError> {
        log::trace!(
            "Bootstrap rank {:?} send to peer {} ({:?}) tag {}",
            self.rank,
            peer,
            self.peer_addrs[peer],
            tag
        );
        let mut stream = tcp::async_connect(&self.peer_addrs[peer], self.magic).await?;
        let mut buf = [0u8; 8];
        LittleEndian::write_u64(&mut buf, self.rank as u64);
        stream.write_all(&buf).await?;
        let mut buf = [0u8; 4];
        LittleEndian::write_u32(&mut buf, tag);
        stream.write_all(&buf).await?;
        bootstrap_net_send(&mut stream, data).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn recv_async(&self, peer: usize, tag: u32) -> Result<Vec<u8>, BootstrapError> {
        if let Some(mut stream) = self.unexpected_dequeue(peer, tag).await {
            return bootstrap_net_recv(&mut stream).await;
        }
        loop {
            let mut stream = tcp::async_accept(&self.listener, self.magic).await?;
            let mut buf = [0u8; 8];
            stream.read_exact(&mut buf).await?;
            let recv_peer = LittleEndian::read_u64(&buf) as usize;
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await?;
            let recv_tag = LittleEndian::read_u32(&buf);
            log::trace!(
                "Bootstrap rank {:?} accepted peer {} tag {} while waiting for peer {} tag {}",
                self.rank,
                recv_peer,
                recv_tag,
                peer,
                tag
            );

            if recv_peer == peer && recv_tag == tag {
                return bootstrap_net_recv(&mut stream).await;
            } else {
                let conn = UnexpectedConn {
                    stream,
                    peer: recv_peer,
                    tag: recv_tag,
                };
                self.unexpected_connections.lock().await.push(conn);
            }
        }
    }

    async fn all_gather_async(&self, data: &mut [u8], size: usize) -> Result<(), BootstrapError> {
        let mut ring = self.ring.lock().await;
        let ring = &mut *ring;
        ring_all_gather_internal(
            &mut ring.ring_send,
            &mut ring.ring_recv,
            self.rank,
            self.num_ranks,
            data,
            size,
        )
        .await?;
        log::trace!(
            "Bootstrap AllGather done: rank {} of {}, size: {}",
            self.rank,
            self.num_ranks,
            size
        );
        Ok(())
    }
}

async fn ring_all_gather_internal(
    ring_send: &mut TcpStream,
    ring_recv: &mut TcpStream,
    rank: usize,
    num_ranks: usize,
    data: &mut [u8],
    size: usize,
) -> Result<(), BootstrapError> {
    check_all_gather_size(data, size, num_ranks)?;
    for i in 0..(num_ranks - 1) {
        let recv_slice_idx = (rank + num_ranks - i - 1) % num_ranks;
        let send_slice_idx = (rank + num_ranks - i) % num_ranks;

        let send_data = &data[send_slice_idx * size..(send_slice_idx + 1) * size];
        // send slice to the right
        bootstrap_net_send(ring_send, send_data).await?;
        let recv_data = &mut data[recv_slice_idx * size..(recv_slice_idx + 1) * size];
        // recv slice from the left
        bootstrap_net_recv_exact(ring_recv, recv_data).await?;
    }
    Ok(())
}

impl Bootstrap for TcpBootstrap {
    fn rank(&self) -> usize {
        self.rank
    }

    fn num_ranks(&self) -> usize {
        self.num_ranks
    }

    fn num_ranks_per_node(&self) -> usize {
        self.num_ranks_per_node
    }

    fn send(&self, data: &[u8], peer: usize, tag: u32) -> Result<(), BootstrapError> {
        if peer >= self.num_ranks {
            return Err(BootstrapError::InvalidPeer(peer));
        }
        smol::block_on(self.send_async(data, peer, tag))
    }

    fn recv(&self, peer: usize, tag: u32) -> Result<Vec<u8>, BootstrapError> {
        if peer >= self.num_ranks {
            return Err(BootstrapError::InvalidPeer(peer));
        }
        smol::block_on(self.recv_async(peer, tag))
    }

    fn all_gather(&self, data: &mut [u8], size: usize) -> Result<(), BootstrapError> {
        smol::block_on(self.all_gather_async(data, size))
    }
}
