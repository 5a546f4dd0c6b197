//! Transparent wrappers that count bytes for a [`TrafficCounter`].
//!
//! The protocol server only sees the [`Accept`] seam and an
//! `AsyncRead + AsyncWrite` stream, so the decoration is invisible to it.

use std::future::{poll_fn, Future};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::traffic::TrafficCounter;

/// Upper bound for the best-effort flush performed when a listener closes
pub const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Accept failures seen by a serving loop
#[derive(Debug, thiserror::Error)]
pub enum AcceptError {
    /// The listener was closed on purpose; the loop should exit quietly
    #[error("listener closed")]
    Closed,

    #[error("accept failed: {0}")]
    Io(#[from] io::Error),
}

/// Source of inbound connections for a protocol server
pub trait Accept: Send + Sync + 'static {
    type Conn: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn accept(
        &self,
    ) -> impl Future<Output = Result<(Self::Conn, SocketAddr), AcceptError>> + Send + '_;
}

/// Stream wrapper that mirrors every successful read and write into a counter.
///
/// Reads are counted as download, writes as upload. Bytes and errors pass
/// through unchanged.
#[derive(Debug)]
pub struct InstrumentedStream<S> {
    inner: S,
    counter: Arc<TrafficCounter>,
}

impl<S> InstrumentedStream<S> {
    pub fn new(inner: S, counter: Arc<TrafficCounter>) -> Self {
        Self { inner, counter }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for InstrumentedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let res = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = res {
            let n = buf.filled().len() - before;
            if n > 0 {
                self.counter.count_download(n as u64);
            }
        }
        res
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for InstrumentedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let res = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = res {
            if n > 0 {
                self.counter.count_upload(n as u64);
            }
        }
        res
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let res = Pin::new(&mut self.inner).poll_write_vectored(cx, bufs);
        if let Poll::Ready(Ok(n)) = res {
            if n > 0 {
                self.counter.count_upload(n as u64);
            }
        }
        res
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

struct ListenerShared {
    socket: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    counter: Arc<TrafficCounter>,
    closed: watch::Sender<bool>,
}

/// TCP listener whose accepted connections are counted.
///
/// Clones share the same socket: the lifecycle manager keeps one to close,
/// the serving loop keeps one to accept. Closing drops the socket right away
/// so the port is free for the next bind.
#[derive(Clone)]
pub struct InstrumentedListener {
    shared: Arc<ListenerShared>,
}

impl InstrumentedListener {
    pub fn new(listener: TcpListener, counter: Arc<TrafficCounter>) -> io::Result<Self> {
        let local_addr = listener.local_addr()?;
        let (closed, _) = watch::channel(false);
        Ok(Self {
            shared: Arc::new(ListenerShared {
                socket: Mutex::new(Some(listener)),
                local_addr,
                counter,
                closed,
            }),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    pub fn is_closed(&self) -> bool {
        *self.shared.closed.borrow()
    }

    /// Flush the counter (bounded by [`CLOSE_FLUSH_TIMEOUT`]) and close the socket.
    ///
    /// Must be called without the registry lock held. Closing twice reports
    /// an error.
    pub async fn close(&self) -> io::Result<()> {
        self.flush_bounded().await;
        self.close_now()
    }

    /// Best-effort flush of the counter, giving up after [`CLOSE_FLUSH_TIMEOUT`].
    ///
    /// The flush takes the registry lock, so the caller must not hold it.
    pub async fn flush_bounded(&self) {
        let counter = Arc::clone(&self.shared.counter);
        let flush = tokio::task::spawn_blocking(move || counter.flush());
        if tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, flush).await.is_err() {
            warn!(
                "Traffic flush for {} timed out, closing anyway",
                self.shared.counter.rule_id()
            );
        }
    }

    /// Close the socket without flushing. Safe under the registry lock.
    pub fn close_now(&self) -> io::Result<()> {
        let socket = self.socket().take();
        self.shared.closed.send_replace(true);
        match socket {
            Some(socket) => {
                drop(socket);
                debug!("Listener {} closed", self.shared.local_addr);
                Ok(())
            }
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                format!("listener {} already closed", self.shared.local_addr),
            )),
        }
    }

    fn socket(&self) -> MutexGuard<'_, Option<TcpListener>> {
        self.shared.socket.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn poll_accept(&self, cx: &mut Context<'_>) -> Poll<Result<(TcpStream, SocketAddr), AcceptError>> {
        match self.socket().as_ref() {
            Some(socket) => socket.poll_accept(cx).map_err(AcceptError::Io),
            None => Poll::Ready(Err(AcceptError::Closed)),
        }
    }

    async fn accept_counted(
        &self,
    ) -> Result<(InstrumentedStream<TcpStream>, SocketAddr), AcceptError> {
        let mut closed = self.shared.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(AcceptError::Closed);
        }

        let (stream, peer) = tokio::select! {
            biased;
            _ = closed.changed() => return Err(AcceptError::Closed),
            res = poll_fn(|cx| self.poll_accept(cx)) => res?,
        };
        Ok((
            InstrumentedStream::new(stream, Arc::clone(&self.shared.counter)),
            peer,
        ))
    }
}

impl Accept for InstrumentedListener {
    type Conn = InstrumentedStream<TcpStream>;

    fn accept(
        &self,
    ) -> impl Future<Output = Result<(Self::Conn, SocketAddr), AcceptError>> + Send + '_ {
        self.accept_counted()
    }
}

impl std::fmt::Debug for InstrumentedListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstrumentedListener")
            .field("local_addr", &self.shared.local_addr)
            .field("rule_id", &self.shared.counter.rule_id())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traffic::FlushTarget;
    use std::sync::Weak;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct Totals(Mutex<(u64, u64)>);

    impl FlushTarget for Totals {
        fn absorb(&self, counter: &TrafficCounter) -> bool {
            let mut totals = self.0.lock().unwrap();
            let (up, down) = counter.drain();
            totals.0 += up;
            totals.1 += down;
            true
        }

        fn persist_in_background(&self) {}
    }

    fn counter(totals: &Arc<Totals>) -> Arc<TrafficCounter> {
        let weak: Weak<dyn FlushTarget> = Arc::downgrade(totals) as Weak<dyn FlushTarget>;
        Arc::new(TrafficCounter::with_interval("rule_1", weak, Duration::from_secs(3600)))
    }

    async fn bound(counter: Arc<TrafficCounter>) -> InstrumentedListener {
        let socket = TcpListener::bind("127.0.0.1:0").await.unwrap();
        InstrumentedListener::new(socket, counter).unwrap()
    }

    #[tokio::test]
    async fn test_stream_counts_reads_and_writes() {
        let totals = Arc::new(Totals(Mutex::new((0, 0))));
        let counter = counter(&totals);
        let (client, server) = tokio::io::duplex(4096);
        let mut server = InstrumentedStream::new(server, Arc::clone(&counter));
        let mut client = client;

        client.write_all(&[7u8; 1000]).await.unwrap();
        let mut buf = vec![0u8; 1000];
        server.read_exact(&mut buf).await.unwrap();
        assert!(buf.iter().all(|&b| b == 7));

        server.write_all(&[9u8; 500]).await.unwrap();
        let mut out = vec![0u8; 500];
        client.read_exact(&mut out).await.unwrap();
        assert!(out.iter().all(|&b| b == 9));

        assert_eq!(counter.pending(), (500, 1000));
    }

    #[tokio::test]
    async fn test_stream_passes_eof_through() {
        let totals = Arc::new(Totals(Mutex::new((0, 0))));
        let counter = counter(&totals);
        let (client, server) = tokio::io::duplex(64);
        let mut server = InstrumentedStream::new(server, Arc::clone(&counter));
        drop(client);

        let mut buf = [0u8; 16];
        assert_eq!(server.read(&mut buf).await.unwrap(), 0);
        assert_eq!(counter.pending(), (0, 0));
    }

    #[tokio::test]
    async fn test_accepted_connections_are_counted() {
        let totals = Arc::new(Totals(Mutex::new((0, 0))));
        let counter = counter(&totals);
        let listener = bound(Arc::clone(&counter)).await;
        let addr = listener.local_addr();

        let client = tokio::spawn(async move {
            let mut s = TcpStream::connect(addr).await.unwrap();
            s.write_all(b"hello").await.unwrap();
            let mut reply = [0u8; 3];
            s.read_exact(&mut reply).await.unwrap();
            reply
        });

        let (mut conn, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 5];
        conn.read_exact(&mut buf).await.unwrap();
        conn.write_all(b"bye").await.unwrap();

        assert_eq!(&client.await.unwrap(), b"bye");
        assert_eq!(counter.pending(), (3, 5));
    }

    #[tokio::test]
    async fn test_close_unblocks_accept_and_frees_port() {
        let totals = Arc::new(Totals(Mutex::new((0, 0))));
        let counter = counter(&totals);
        let listener = bound(Arc::clone(&counter)).await;
        let addr = listener.local_addr();

        let serving = listener.clone();
        let accept = tokio::spawn(async move { serving.accept().await.map(|_| ()) });
        tokio::time::sleep(Duration::from_millis(20)).await;

        counter.count_upload(42);
        listener.close().await.unwrap();

        let res = accept.await.unwrap();
        assert!(matches!(res, Err(AcceptError::Closed)));
        assert!(listener.is_closed());
        assert_eq!(*totals.0.lock().unwrap(), (42, 0));

        // Port is released immediately
        TcpListener::bind(addr).await.unwrap();
    }

    #[tokio::test]
    async fn test_second_close_is_an_error() {
        let totals = Arc::new(Totals(Mutex::new((0, 0))));
        let listener = bound(counter(&totals)).await;

        listener.close_now().unwrap();
        assert!(listener.close().await.is_err());
        assert!(matches!(listener.accept().await, Err(AcceptError::Closed)));
    }
}
