//! Byte-stream backend.
//!
//! Carries framed messages over any `AsyncRead + AsyncWrite` pair: a pipe, a
//! TCP stream, or an in-memory duplex. Streams cannot carry descriptors, so
//! messages with attachments are refused and bodies always travel inline.

use std::collections::VecDeque;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

use super::{BackendKind, BackendReceiver, BackendSender, BoxFuture, ChannelBackend, Envelope, Limits};
use crate::channel::ChannelConfig;
use crate::error::{IpcError, Result};
use crate::protocol::{Frame, FrameBuffer, OutboundFrame};

/// Read buffer size (64KB).
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Channel backend over a byte stream.
pub struct StreamBackend<R, W> {
    reader: R,
    writer: W,
    limits: Limits,
}

impl<S> StreamBackend<ReadHalf<S>, WriteHalf<S>>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Split a bidirectional stream into a backend.
    pub fn from_stream(stream: S) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(reader, writer)
    }
}

impl<R, W> StreamBackend<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader,
            writer,
            limits: Limits::default(),
        }
    }
}

impl<R, W> ChannelBackend for StreamBackend<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    fn kind(&self) -> BackendKind {
        BackendKind::Stream
    }

    fn configure(&mut self, config: &ChannelConfig) {
        self.limits = Limits::from(config);
    }

    fn into_split(self: Box<Self>) -> (Box<dyn BackendReceiver>, Box<dyn BackendSender>) {
        let this = *self;
        let receiver = StreamReceiver {
            reader: this.reader,
            frames: FrameBuffer::with_limits(this.limits.max_message_size, 0),
            ready: VecDeque::new(),
            buf: vec![0u8; READ_BUFFER_SIZE],
        };
        let sender = StreamSender {
            writer: this.writer,
            limits: this.limits,
        };
        (Box::new(receiver), Box::new(sender))
    }
}

struct StreamReceiver<R> {
    reader: R,
    frames: FrameBuffer,
    ready: VecDeque<Frame>,
    buf: Vec<u8>,
}

impl<R> StreamReceiver<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn next_envelope(&mut self) -> Result<Option<Envelope>> {
        loop {
            if let Some(frame) = self.ready.pop_front() {
                return frame_to_envelope(frame).map(Some);
            }

            let n = self.reader.read(&mut self.buf).await?;
            if n == 0 {
                if self.frames.has_partial_frame() {
                    return Err(IpcError::Protocol("stream closed mid-frame".into()));
                }
                return Ok(None);
            }
            self.ready.extend(self.frames.push(&self.buf[..n])?);
        }
    }
}

impl<R> BackendReceiver for StreamReceiver<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    fn receive(&mut self) -> BoxFuture<'_, Result<Option<Envelope>>> {
        Box::pin(self.next_envelope())
    }
}

fn frame_to_envelope(frame: Frame) -> Result<Envelope> {
    if frame.attachment_count() > 0 || frame.is_body_out_of_line() {
        return Err(IpcError::Protocol(
            "stream transport cannot carry attachments".into(),
        ));
    }
    Ok(Envelope::new(frame.body, Vec::new()))
}

struct StreamSender<W> {
    writer: W,
    limits: Limits,
}

impl<W> StreamSender<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn transmit(&mut self, envelope: Envelope) -> Result<()> {
        if !envelope.attachments.is_empty() {
            return Err(IpcError::Unsupported(
                "stream transport cannot carry attachments".into(),
            ));
        }
        self.limits.check(&envelope)?;

        let frame = OutboundFrame::new(&[], envelope.body, 0);
        write_frame(&mut self.writer, &frame).await
    }
}

impl<W> BackendSender for StreamSender<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    fn send(&mut self, envelope: Envelope) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.transmit(envelope))
    }
}

/// Write one frame using scatter/gather I/O (write_vectored).
///
/// The fast path is a single vectored write. A partial write continues from
/// where the kernel stopped.
async fn write_frame<W>(writer: &mut W, frame: &OutboundFrame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let total_size = frame.size();
    let mut total_written = 0;

    while total_written < total_size {
        let slices = frame.remaining_slices(total_written);
        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(IpcError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}
