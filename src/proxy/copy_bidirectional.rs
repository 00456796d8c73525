//! Full-duplex byte relay between a client and its backend.
//!
//! Both directions run inside one future. When one side reaches EOF its
//! counterpart is shut down promptly instead of waiting for the peer to
//! notice, which releases half-closed connections early.

use std::future::poll_fn;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    ClientToBackend,
    BackendToClient,
}

/// A relay error attributed to the side whose socket produced it.
#[derive(Debug, Error)]
pub enum ErrorSource {
    #[error("client i/o error: {0}")]
    Client(#[source] io::Error),
    #[error("backend i/o error: {0}")]
    Backend(#[source] io::Error),
}

impl ErrorSource {
    fn read(dir: Direction, err: io::Error) -> Self {
        match dir {
            Direction::ClientToBackend => ErrorSource::Client(err),
            Direction::BackendToClient => ErrorSource::Backend(err),
        }
    }

    fn write(dir: Direction, err: io::Error) -> Self {
        match dir {
            Direction::ClientToBackend => ErrorSource::Backend(err),
            Direction::BackendToClient => ErrorSource::Client(err),
        }
    }
}

enum TransferState {
    Running(CopyBuffer),
    ShuttingDown { dir: Direction, amt: u64 },
    Done(u64),
}

fn transfer_one_direction<A, B>(
    cx: &mut Context<'_>,
    state: &mut TransferState,
    r: &mut A,
    w: &mut B,
) -> Poll<Result<u64, ErrorSource>>
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let mut r = Pin::new(r);
    let mut w = Pin::new(w);
    loop {
        match state {
            TransferState::Running(buf) => {
                let amt = ready!(buf.poll_copy(cx, r.as_mut(), w.as_mut()))?;
                *state = TransferState::ShuttingDown { dir: buf.dir, amt };
            }
            TransferState::ShuttingDown { dir, amt } => {
                ready!(w.as_mut().poll_shutdown(cx)).map_err(|e| ErrorSource::write(*dir, e))?;
                *state = TransferState::Done(*amt);
            }
            TransferState::Done(amt) => return Poll::Ready(Ok(*amt)),
        }
    }
}

/// Relay bytes until both directions have finished. Returns the totals
/// copied client→backend and backend→client.
pub async fn copy_bidirectional<Client, Backend>(
    client: &mut Client,
    backend: &mut Backend,
) -> Result<(u64, u64), ErrorSource>
where
    Client: AsyncRead + AsyncWrite + Unpin + ?Sized,
    Backend: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let mut client_to_backend =
        TransferState::Running(CopyBuffer::new(Direction::ClientToBackend));
    let mut backend_to_client =
        TransferState::Running(CopyBuffer::new(Direction::BackendToClient));

    poll_fn(|cx| {
        let mut client_to_backend_result =
            transfer_one_direction(cx, &mut client_to_backend, client, backend)?;
        let mut backend_to_client_result =
            transfer_one_direction(cx, &mut backend_to_client, backend, client)?;

        // Once one side is done, shut the other down rather than waiting
        // for its peer to close.
        if let TransferState::Done(_) = backend_to_client {
            if let TransferState::Running(buf) = &client_to_backend {
                debug!("backend finished, shutting down client side");
                client_to_backend = TransferState::ShuttingDown {
                    dir: buf.dir,
                    amt: buf.amt,
                };
                client_to_backend_result =
                    transfer_one_direction(cx, &mut client_to_backend, client, backend)?;
            }
        }

        if let TransferState::Done(_) = client_to_backend {
            if let TransferState::Running(buf) = &backend_to_client {
                debug!("client finished, shutting down backend side");
                backend_to_client = TransferState::ShuttingDown {
                    dir: buf.dir,
                    amt: buf.amt,
                };
                backend_to_client_result =
                    transfer_one_direction(cx, &mut backend_to_client, backend, client)?;
            }
        }

        let tx = ready!(client_to_backend_result);
        let rx = ready!(backend_to_client_result);
        Poll::Ready(Ok((tx, rx)))
    })
    .await
}

const DEFAULT_BUF_SIZE: usize = 8 * 1024;

struct CopyBuffer {
    dir: Direction,
    amt: u64,
    read_done: bool,
    need_flush: bool,
    pos: usize,
    cap: usize,
    buf: Box<[u8]>,
}

impl CopyBuffer {
    fn new(dir: Direction) -> Self {
        Self {
            dir,
            amt: 0,
            read_done: false,
            need_flush: false,
            pos: 0,
            cap: 0,
            buf: vec![0; DEFAULT_BUF_SIZE].into_boxed_slice(),
        }
    }

    fn poll_fill_buf<R>(
        &mut self,
        cx: &mut Context<'_>,
        reader: Pin<&mut R>,
    ) -> Poll<Result<(), ErrorSource>>
    where
        R: AsyncRead + ?Sized,
    {
        let me = &mut *self;
        let mut buf = ReadBuf::new(&mut me.buf);
        buf.set_filled(me.cap);

        let res = reader.poll_read(cx, &mut buf);
        if let Poll::Ready(Ok(())) = res {
            let filled_len = buf.filled().len();
            me.read_done = me.cap == filled_len;
            me.cap = filled_len;
        }
        res.map_err(|e| ErrorSource::read(me.dir, e))
    }

    fn poll_write_buf<R, W>(
        &mut self,
        cx: &mut Context<'_>,
        mut reader: Pin<&mut R>,
        mut writer: Pin<&mut W>,
    ) -> Poll<Result<(), ErrorSource>>
    where
        R: AsyncRead + ?Sized,
        W: AsyncWrite + ?Sized,
    {
        let me = &mut *self;
        match writer.as_mut().poll_write(cx, &me.buf[me.pos..me.cap]) {
            Poll::Pending => {
                // Top up the buffer while the writer is busy to improve the
                // chances of a large write later.
                if !me.read_done && me.cap < me.buf.len() {
                    ready!(me.poll_fill_buf(cx, reader.as_mut()))?;
                }
                Poll::Pending
            }
            Poll::Ready(Ok(0)) => {
                let err = io::Error::new(io::ErrorKind::WriteZero, "write zero byte into writer");
                Poll::Ready(Err(ErrorSource::write(me.dir, err)))
            }
            Poll::Ready(Ok(i)) => {
                me.pos += i;
                me.amt += i as u64;
                me.need_flush = true;
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(ErrorSource::write(me.dir, e))),
        }
    }

    fn poll_copy<R, W>(
        &mut self,
        cx: &mut Context<'_>,
        mut reader: Pin<&mut R>,
        mut writer: Pin<&mut W>,
    ) -> Poll<Result<u64, ErrorSource>>
    where
        R: AsyncRead + ?Sized,
        W: AsyncWrite + ?Sized,
    {
        loop {
            // Keep the buffer as full as we can before writing.
            if self.cap < self.buf.len() && !self.read_done {
                match self.poll_fill_buf(cx, reader.as_mut()) {
                    Poll::Ready(Ok(())) => (),
                    Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
                    Poll::Pending => {
                        if self.pos == self.cap {
                            // The reader has no progress for us. Flush any
                            // buffered writes so a peer that waits on them
                            // cannot deadlock us.
                            if self.need_flush {
                                ready!(writer.as_mut().poll_flush(cx))
                                    .map_err(|e| ErrorSource::write(self.dir, e))?;
                                self.need_flush = false;
                            }
                            return Poll::Pending;
                        }
                    }
                }
            }

            while self.pos < self.cap {
                ready!(self.poll_write_buf(cx, reader.as_mut(), writer.as_mut()))?;
            }

            debug_assert!(
                self.pos <= self.cap,
                "writer returned length larger than input slice"
            );

            self.pos = 0;
            self.cap = 0;

            if self.read_done {
                ready!(writer.as_mut().poll_flush(cx))
                    .map_err(|e| ErrorSource::write(self.dir, e))?;
                return Poll::Ready(Ok(self.amt));
            }
        }
    }
}
