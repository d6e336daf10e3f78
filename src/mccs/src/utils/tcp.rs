use std::net::SocketAddr;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};

use byteorder::{ByteOrder, LittleEndian};
use bytes::{Buf, BufMut};
use smol::io::{AsyncReadExt, AsyncWriteExt};
use smol::net::{TcpListener, TcpStream};
use socket2::Socket;

// tag(1) + ipv6(16) + port(2) + flowinfo(4) + scope_id(4)
pub const SOCK_ADDR_ENCODE_SIZE: usize = 32;

pub fn async_listen(addr: &SocketAddr) -> std::io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        Socket::new(socket2::Domain::IPV4, socket2::Type::STREAM, None)?
    } else {
        Socket::new(socket2::Domain::IPV6, socket2::Type::STREAM, None)?
    };
    socket.set_reuse_address(true)?;
    socket.set_reuse_port(true)?;
    socket.bind(&addr.to_owned().into())?;
    socket.listen(16384)?;
    socket.set_nonblocking(true)?;
    let listener: std::net::TcpListener = socket.into();
    TcpListener::try_from(listener)
}

pub async fn async_accept(listener: &TcpListener, magic: u64) -> std::io::Result<TcpStream> {
    let mut buf = [0u8; std::mem::size_of::<u64>()];
    let stream = loop {
        let (mut stream, _) = listener.accept().await?;
        stream.read_exact(buf.as_mut_slice()).await?;
        let recv_magic = LittleEndian::read_u64(&buf);
        if recv_magic == magic {
            break stream;
        } else {
            log::warn!(
                "TCP listener accept: invalid magic {} != {}",
                recv_magic,
                magic
            );
        }
    };
    Ok(stream)
}

pub async fn async_connect(addr: &SocketAddr, magic: u64) -> std::io::Result<TcpStream> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    let mut buf = [0u8; std::mem::size_of::<u64>()];
    LittleEndian::write_u64(&mut buf, magic);
    stream.write_all(&buf).await?;
    Ok(stream)
}

pub fn encode_socket_addr<B: BufMut>(sock_addr: &SocketAddr, buf: &mut B) {
    match sock_addr {
        SocketAddr::V4(addr) => {
            buf.put_u8(4);
            buf.put_slice(&addr.ip().octets());
            buf.put_u16(addr.port());
        }
        SocketAddr::V6(addr) => {
            buf.put_u8(6);
            buf.put_slice(&addr.ip().octets());
            buf.put_u16(addr.port());
            buf.put_u32(addr.flowinfo());
            buf.put_u32(addr.scope_id());
        }
    }
}

pub fn decode_socket_addr<B: Buf>(buf: &mut B) -> std::io::Result<SocketAddr> {
    let addr_type = buf.get_u8();
    match addr_type {
        4 => {
            let mut octets = [0u8; 4];
            buf.copy_to_slice(&mut octets);
            let port = buf.get_u16();
            Ok(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(octets), port)))
        }
        6 => {
            let mut octets = [0u8; 16];
            buf.copy_to_slice(&mut octets);
            let port = buf.get_u16();
            let flowinfo = buf.get_u32();
            let scope_id = buf.get_u32();
            Ok(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(octets),
                port,
                flowinfo,
                scope_id,
            )))
        }
        other => Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("unexpected address type {}", other),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_addr_encoding() {
        let addrs: [SocketAddr; 2] = [
            "10.0.0.3:9000".parse().unwrap(),
            "[fe80::1]:31337".parse().unwrap(),
        ];
        for addr in addrs {
            let mut send_buf = [0u8; SOCK_ADDR_ENCODE_SIZE];
            let mut buf = send_buf.as_mut_slice();
            encode_socket_addr(&addr, &mut buf);
            let mut buf = send_buf.as_slice();
            assert_eq!(decode_socket_addr(&mut buf).unwrap(), addr);
        }
    }

    #[test]
    fn unknown_address_family() {
        let raw = [9u8; SOCK_ADDR_ENCODE_SIZE];
        assert!(decode_socket_addr(&mut raw.as_slice()).is_err());
    }
}
