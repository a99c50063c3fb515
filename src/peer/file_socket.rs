//! The raw socket handed to whoever claims an "F" connection.
//!
//! "F" connections carry no framing past the handshake, so once the
//! handshake message (`PeerInit` or `PierceFirewall`) has been decoded we
//! switch back to the bare `TcpStream`. The handshake was read through a
//! buffered `Framed<_, HandshakeCodec>`, though, and a peer that pipelines
//! its next write (e.g. a downloader that writes `token || offset`
//! immediately after `PeerInit` in the same TCP segment) may already have
//! landed bytes in that buffer. [`FileSocket`] re-presents any such
//! leftover bytes as a prefix read before falling through to the live
//! socket, the same way the teacher's `peer.rs` reused `Framed`'s read
//! buffer across a handshake-to-steady-state codec swap.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

pub struct FileSocket {
    prefix: Vec<u8>,
    prefix_pos: usize,
    inner: TcpStream,
}

impl FileSocket {
    pub fn new(inner: TcpStream, leftover: Vec<u8>) -> Self {
        Self {
            prefix: leftover,
            prefix_pos: 0,
            inner,
        }
    }

    fn remaining_prefix(&self) -> &[u8] {
        &self.prefix[self.prefix_pos..]
    }
}

impl AsyncRead for FileSocket {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let remaining = self.remaining_prefix();
        if !remaining.is_empty() {
            let n = remaining.len().min(buf.len());
            buf[..n].copy_from_slice(&remaining[..n]);
            self.prefix_pos += n;
            return Poll::Ready(Ok(n));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for FileSocket {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn leftover_prefix_is_read_before_the_live_socket() {
        let mut listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, (server, _)) =
            tokio::join!(TcpStream::connect(addr), listener.accept());
        let mut client = client.unwrap();
        let server = server.unwrap();

        let mut socket = FileSocket::new(server, vec![1, 2, 3]);

        use tokio::io::AsyncWriteExt;
        client.write_all(&[4, 5, 6]).await.unwrap();

        let mut buf = [0u8; 6];
        socket.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [1, 2, 3, 4, 5, 6]);
    }
}
