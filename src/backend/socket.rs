//! Unix-domain socket backend.
//!
//! Frames travel over a `SOCK_STREAM` socket. Descriptors ride along as
//! `SCM_RIGHTS` ancillary data on the first `sendmsg` of their frame, in the
//! same stack order as the attachment infos. A body above the inline
//! threshold is copied into a fresh shared-memory region and sent as one
//! extra trailing `MappedMemory` attachment; the receiver maps it read-only
//! and wraps the mapping as the body without copying.

use std::collections::VecDeque;
use std::io::{self, IoSlice};
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::ptr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::Interest;
use tokio::net::UnixStream;

use super::{BackendKind, BackendReceiver, BackendSender, BoxFuture, ChannelBackend, Envelope, Limits};
use crate::attachment::{Attachment, AttachmentKind};
use crate::channel::ChannelConfig;
use crate::error::{IpcError, Result};
use crate::protocol::{frame_flags, AttachmentInfo, Frame, FrameBuffer, OutboundFrame};
use crate::shared_memory::{Handle, Protection, SharedMemory};

/// Read buffer size (64KB).
const READ_BUFFER_SIZE: usize = 64 * 1024;

#[cfg(target_os = "linux")]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(target_os = "linux"))]
const SEND_FLAGS: libc::c_int = 0;

#[cfg(target_os = "linux")]
const RECV_FLAGS: libc::c_int = libc::MSG_CMSG_CLOEXEC;
#[cfg(not(target_os = "linux"))]
const RECV_FLAGS: libc::c_int = 0;

/// Channel backend over a connected Unix stream socket.
pub struct SocketBackend {
    stream: UnixStream,
    limits: Limits,
}

impl SocketBackend {
    pub fn new(stream: UnixStream) -> Self {
        Self {
            stream,
            limits: Limits::default(),
        }
    }

    /// A connected pair, one end per peer.
    pub fn pair() -> Result<(Self, Self)> {
        let (a, b) = UnixStream::pair()?;
        Ok((Self::new(a), Self::new(b)))
    }

    /// Adopt a socket inherited from a parent process.
    pub fn from_std(stream: std::os::unix::net::UnixStream) -> Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self::new(UnixStream::from_std(stream)?))
    }

    /// Connect to a listening rendezvous path.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let stream = UnixStream::connect(path.as_ref()).await?;
        tracing::debug!("Connected to {}", path.as_ref().display());
        Ok(Self::new(stream))
    }
}

impl ChannelBackend for SocketBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Socket
    }

    fn configure(&mut self, config: &ChannelConfig) {
        self.limits = Limits::from(config);
    }

    fn into_split(self: Box<Self>) -> (Box<dyn BackendReceiver>, Box<dyn BackendSender>) {
        let stream = Arc::new(self.stream);
        let receiver = SocketReceiver {
            stream: stream.clone(),
            frames: FrameBuffer::with_limits(
                self.limits.max_message_size,
                self.limits.max_attachments,
            ),
            ready: VecDeque::new(),
            fds: VecDeque::new(),
            buf: vec![0u8; READ_BUFFER_SIZE],
            limits: self.limits,
        };
        let sender = SocketSender {
            stream,
            limits: self.limits,
        };
        (Box::new(receiver), Box::new(sender))
    }
}

struct SocketReceiver {
    stream: Arc<UnixStream>,
    frames: FrameBuffer,
    ready: VecDeque<Frame>,
    /// Descriptors received but not yet claimed by a frame.
    fds: VecDeque<OwnedFd>,
    buf: Vec<u8>,
    limits: Limits,
}

impl SocketReceiver {
    async fn next_envelope(&mut self) -> Result<Option<Envelope>> {
        loop {
            if let Some(frame) = self.ready.pop_front() {
                return self.assemble(frame).map(Some);
            }

            self.stream.readable().await?;
            let raw = self.stream.as_raw_fd();
            let capacity = self.limits.max_attachments as usize;
            let result = self.stream.try_io(Interest::READABLE, || {
                recv_with_fds(raw, &mut self.buf, &mut self.fds, capacity)
            });
            let n = match result {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e.into()),
            };

            if n == 0 {
                if self.frames.has_partial_frame() {
                    return Err(IpcError::Protocol("socket closed mid-frame".into()));
                }
                return Ok(None);
            }
            let frames = self.frames.push(&self.buf[..n])?;
            self.ready.extend(frames);
        }
    }

    /// Pair a frame with its descriptors and restore push order.
    fn assemble(&mut self, frame: Frame) -> Result<Envelope> {
        let out_of_line = frame.is_body_out_of_line();
        let mut attachments = Vec::with_capacity(frame.infos.len());
        for info in &frame.infos {
            let fd = match info.kind {
                AttachmentKind::Socket | AttachmentKind::MappedMemory => {
                    self.fds.pop_front().ok_or_else(|| {
                        IpcError::Protocol("attachment info without a descriptor".into())
                    })?
                }
                kind => {
                    return Err(IpcError::Protocol(format!(
                        "socket transport cannot carry {:?} attachments",
                        kind
                    )))
                }
            };
            attachments.push(match info.kind {
                AttachmentKind::Socket => Attachment::Socket {
                    fd,
                    size: info.size,
                },
                _ => Attachment::MappedMemory {
                    fd,
                    size: info.size,
                },
            });
        }
        attachments.reverse();

        let body = if out_of_line {
            match attachments.pop() {
                Some(Attachment::MappedMemory { fd, size }) => self.map_body(fd, size)?,
                _ => {
                    return Err(IpcError::Protocol(
                        "out-of-line body without a memory region".into(),
                    ))
                }
            }
        } else {
            frame.body
        };
        Ok(Envelope::new(body, attachments))
    }

    fn map_body(&self, fd: OwnedFd, size: u64) -> Result<Bytes> {
        if size > u64::from(self.limits.max_message_size) {
            return Err(IpcError::Protocol(format!(
                "Body size {} exceeds maximum {}",
                size, self.limits.max_message_size
            )));
        }
        let handle = Handle::from_fd(fd, size, Protection::ReadOnly);
        let region = SharedMemory::map(handle, Protection::ReadOnly)?;
        Ok(Bytes::from_owner(region))
    }
}

impl BackendReceiver for SocketReceiver {
    fn receive(&mut self) -> BoxFuture<'_, Result<Option<Envelope>>> {
        Box::pin(self.next_envelope())
    }
}

struct SocketSender {
    stream: Arc<UnixStream>,
    limits: Limits,
}

impl SocketSender {
    async fn transmit(&mut self, envelope: Envelope) -> Result<()> {
        self.limits.check(&envelope)?;
        let Envelope {
            mut body,
            mut attachments,
        } = envelope;

        if let Some(attachment) = attachments
            .iter()
            .find(|a| !BackendKind::Socket.carries(a.kind()))
        {
            return Err(IpcError::Unsupported(format!(
                "socket transport cannot carry {:?} attachments",
                attachment.kind()
            )));
        }

        let mut flags = 0;
        if body.len() > self.limits.inline_threshold {
            attachments.push(out_of_line_body(&body)?);
            body = Bytes::new();
            flags |= frame_flags::BODY_IS_OUT_OF_LINE;
        }

        let infos: Vec<AttachmentInfo> = attachments
            .iter()
            .map(|a| AttachmentInfo::new(a.kind(), a.size()))
            .collect();
        // Descriptors go in stack order, matching the infos on the wire
        let fds: Vec<RawFd> = attachments
            .iter()
            .rev()
            .filter_map(Attachment::fd)
            .map(AsRawFd::as_raw_fd)
            .collect();

        let frame = OutboundFrame::new(&infos, body, flags);
        self.write_frame(&frame, &fds).await?;

        tracing::trace!(
            "Sent frame of {} bytes with {} descriptors",
            frame.size(),
            fds.len()
        );
        // Our copies of the descriptors close here; the peer holds its own
        drop(attachments);
        Ok(())
    }

    async fn write_frame(&self, frame: &OutboundFrame, fds: &[RawFd]) -> Result<()> {
        let raw = self.stream.as_raw_fd();
        let total_size = frame.size();
        let mut total_written = 0;

        while total_written < total_size {
            self.stream.writable().await?;
            let slices = frame.remaining_slices(total_written);
            // Descriptors attach to the first byte of the frame only
            let pending_fds = if total_written == 0 { fds } else { &[] };
            let result = self.stream.try_io(Interest::WRITABLE, || {
                send_with_fds(raw, &slices, pending_fds)
            });
            match result {
                Ok(0) => {
                    return Err(IpcError::Io(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "sendmsg returned 0",
                    )))
                }
                Ok(n) => total_written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

impl BackendSender for SocketSender {
    fn send(&mut self, envelope: Envelope) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.transmit(envelope))
    }
}

/// Copy a large body into a region the peer maps read-only.
fn out_of_line_body(body: &[u8]) -> Result<Attachment> {
    let mut region = SharedMemory::allocate(body.len())?;
    region
        .data_mut()
        .ok_or_else(|| IpcError::Resource("fresh region is not writable".into()))?
        .copy_from_slice(body);

    let fd = region
        .create_handle(Protection::ReadOnly)?
        .into_fd()
        .ok_or_else(|| IpcError::Resource("region handle has no descriptor".into()))?;
    Ok(Attachment::MappedMemory {
        fd,
        size: body.len() as u64,
    })
}

/// u64-aligned buffer large enough for `count` descriptors of ancillary data.
fn control_buffer(count: usize) -> Vec<u64> {
    let payload = (count.max(1) * mem::size_of::<RawFd>()) as u32;
    // SAFETY: CMSG_SPACE only does arithmetic
    let space = unsafe { libc::CMSG_SPACE(payload) } as usize;
    vec![0u64; space.div_ceil(mem::size_of::<u64>())]
}

/// `sendmsg` with the descriptors as one `SCM_RIGHTS` message.
fn send_with_fds(socket: RawFd, slices: &[IoSlice<'_>], fds: &[RawFd]) -> io::Result<usize> {
    // SAFETY: all-zero is a valid msghdr
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    // IoSlice is ABI compatible with iovec on Unix
    msg.msg_iov = slices.as_ptr() as *mut libc::iovec;
    msg.msg_iovlen = slices.len() as _;

    let mut control = if fds.is_empty() {
        Vec::new()
    } else {
        control_buffer(fds.len())
    };
    if !fds.is_empty() {
        let payload = mem::size_of_val(fds) as u32;
        msg.msg_control = control.as_mut_ptr().cast();
        // SAFETY: CMSG_SPACE only does arithmetic
        msg.msg_controllen = unsafe { libc::CMSG_SPACE(payload) } as _;

        // SAFETY: the control buffer holds CMSG_SPACE(payload) aligned bytes
        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(payload) as _;
            ptr::copy_nonoverlapping(fds.as_ptr(), libc::CMSG_DATA(cmsg).cast::<RawFd>(), fds.len());
        }
    }

    // SAFETY: msg points at live slices and control data
    let n = unsafe { libc::sendmsg(socket, &msg, SEND_FLAGS) };
    drop(control);
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// `recvmsg` into `buf`, queueing any received descriptors on `fds`.
fn recv_with_fds(
    socket: RawFd,
    buf: &mut [u8],
    fds: &mut VecDeque<OwnedFd>,
    max_fds: usize,
) -> io::Result<usize> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast(),
        iov_len: buf.len(),
    };
    let mut control = control_buffer(max_fds);

    // SAFETY: all-zero is a valid msghdr
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr().cast();
    msg.msg_controllen = mem::size_of_val(control.as_slice()) as _;

    // SAFETY: msg points at live buffers
    let n = unsafe { libc::recvmsg(socket, &mut msg, RECV_FLAGS) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: the kernel filled the control buffer described by msg
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let data = libc::CMSG_DATA(cmsg).cast::<RawFd>();
                let len = (*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize;
                for i in 0..len / mem::size_of::<RawFd>() {
                    fds.push_back(OwnedFd::from_raw_fd(ptr::read_unaligned(data.add(i))));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    if msg.msg_flags & libc::MSG_CTRUNC != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "ancillary data truncated",
        ));
    }
    Ok(n as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::PortSpace;
    use std::io::{Read, Seek, SeekFrom, Write};

    fn split_pair() -> (
        (Box<dyn BackendReceiver>, Box<dyn BackendSender>),
        (Box<dyn BackendReceiver>, Box<dyn BackendSender>),
    ) {
        let (a, b) = SocketBackend::pair().unwrap();
        (Box::new(a).into_split(), Box::new(b).into_split())
    }

    fn file_with(contents: &[u8]) -> OwnedFd {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(contents).unwrap();
        OwnedFd::from(file)
    }

    fn read_back(fd: OwnedFd) -> Vec<u8> {
        let mut file = std::fs::File::from(fd);
        file.seek(SeekFrom::Start(0)).unwrap();
        let mut contents = Vec::new();
        file.read_to_end(&mut contents).unwrap();
        contents
    }

    #[tokio::test]
    async fn test_descriptors_arrive_in_push_order() {
        let ((_, mut tx), (mut rx, _)) = split_pair();

        let attachments = vec![
            Attachment::Socket {
                fd: file_with(b"first"),
                size: 0,
            },
            Attachment::Socket {
                fd: file_with(b"second"),
                size: 0,
            },
        ];
        tx.send(Envelope::new(Bytes::from_static(b"body"), attachments))
            .await
            .unwrap();

        let envelope = rx.receive().await.unwrap().unwrap();
        assert_eq!(&envelope.body[..], b"body");

        let contents: Vec<Vec<u8>> = envelope
            .attachments
            .into_iter()
            .map(|a| match a {
                Attachment::Socket { fd, .. } => read_back(fd),
                other => panic!("unexpected {:?}", other.kind()),
            })
            .collect();
        assert_eq!(contents, vec![b"first".to_vec(), b"second".to_vec()]);
    }

    #[tokio::test]
    async fn test_large_body_goes_out_of_line() {
        let ((_, mut tx), (mut rx, _)) = split_pair();

        let body: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        tx.send(Envelope::new(Bytes::from(body.clone()), Vec::new()))
            .await
            .unwrap();

        let envelope = rx.receive().await.unwrap().unwrap();
        assert!(envelope.attachments.is_empty());
        assert_eq!(&envelope.body[..], &body[..]);
    }

    #[tokio::test]
    async fn test_port_attachments_are_refused() {
        let ((_, mut tx), _) = split_pair();
        let space = PortSpace::new();
        let receive = space.allocate_receive();

        let envelope = Envelope::new(Bytes::new(), vec![Attachment::Port(receive.make_send())]);
        assert!(matches!(
            tx.send(envelope).await,
            Err(IpcError::Unsupported(_))
        ));
    }

    #[tokio::test]
    async fn test_many_frames_back_to_back() {
        let ((_, mut tx), (mut rx, _)) = split_pair();

        let sender = tokio::spawn(async move {
            for i in 0..200u32 {
                let fd = file_with(&i.to_ne_bytes());
                let attachments = vec![Attachment::Socket { fd, size: 0 }];
                tx.send(Envelope::new(Bytes::from(i.to_ne_bytes().to_vec()), attachments))
                    .await
                    .unwrap();
            }
            tx
        });

        for i in 0..200u32 {
            let mut envelope = rx.receive().await.unwrap().unwrap();
            assert_eq!(&envelope.body[..], &i.to_ne_bytes());
            match envelope.attachments.pop() {
                Some(Attachment::Socket { fd, .. }) => assert_eq!(read_back(fd), i.to_ne_bytes()),
                _ => panic!("descriptor missing for frame {}", i),
            }
        }
        sender.await.unwrap();
    }

    #[tokio::test]
    async fn test_peer_close_is_end_of_stream() {
        let (a, b) = SocketBackend::pair().unwrap();
        let (mut rx, _tx) = Box::new(b).into_split();
        drop(a);
        assert!(rx.receive().await.unwrap().is_none());
    }
}
