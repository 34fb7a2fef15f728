//! Ping - two processes talking over a socket channel.
//!
//! This example demonstrates:
//! - Rendezvous through a Unix socket path
//! - A sync call answered by a handler in another process
//! - Handing a read-only shared-memory region to the peer
//!
//! # Running
//!
//! ```text
//! cargo run --example ping
//! ```
//!
//! The parent binds a socket, re-runs its own executable as the child, and
//! pings it a few times before closing the channel.

use std::time::Instant;

use procwire_ipc::backend::SocketBackend;
use procwire_ipc::message::{Message, SyncMessage};
use procwire_ipc::shared_memory::{Handle, Protection, SharedMemory};
use procwire_ipc::transport::{generate_socket_path, SocketListener};
use procwire_ipc::{ChannelBuilder, Role};

struct Ping;

impl Message for Ping {
    const RECEIVER: &'static str = "Pinger";
    const NAME: &'static str = "Ping";
    type Arguments = (u32,);
}

impl SyncMessage for Ping {
    type Reply = (u32, u32);
}

/// Child reads a region the parent filled.
struct ReadBanner;

impl Message for ReadBanner {
    const RECEIVER: &'static str = "Pinger";
    const NAME: &'static str = "ReadBanner";
    type Arguments = (Handle, u64);
}

impl SyncMessage for ReadBanner {
    type Reply = (String,);
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1);
    match (args.next().as_deref(), args.next()) {
        (Some("child"), Some(path)) => run_child(&path).await,
        _ => run_parent().await,
    }
}

async fn run_parent() -> Result<(), Box<dyn std::error::Error>> {
    let path = generate_socket_path();
    let listener = SocketListener::bind(&path)?;

    let mut child = tokio::process::Command::new(std::env::current_exe()?)
        .arg("child")
        .arg(&path)
        .spawn()?;

    let channel = ChannelBuilder::new().open(listener.accept().await?, Role::Server)?;

    for sequence in 0..5 {
        let started = Instant::now();
        let (echoed, pid) = channel.send_sync::<Ping>(0, (sequence,)).await?;
        println!(
            "pong {} from pid {} in {:?}",
            echoed,
            pid,
            started.elapsed()
        );
    }

    let banner = b"hello from the parent";
    let mut region = SharedMemory::allocate(4096)?;
    if let Some(data) = region.data_mut() {
        data[..banner.len()].copy_from_slice(banner);
    }
    let handle = region.create_handle(Protection::ReadOnly)?;
    let (text,) = channel
        .send_sync::<ReadBanner>(0, (handle, banner.len() as u64))
        .await?;
    println!("child read: {}", text);

    drop(channel);
    child.wait().await?;
    Ok(())
}

async fn run_child(path: &str) -> Result<(), Box<dyn std::error::Error>> {
    let backend = SocketBackend::connect(path).await?;
    let channel = ChannelBuilder::new()
        .handle_sync::<Ping, _>(|sequence: u32| (sequence, std::process::id()))
        .handle_sync::<ReadBanner, _>(|handle: Handle, len: u64| {
            let text = SharedMemory::map(handle, Protection::ReadOnly)
                .ok()
                .and_then(|region| {
                    let bytes = region.data().get(..len as usize)?;
                    Some(String::from_utf8_lossy(bytes).into_owned())
                })
                .unwrap_or_default();
            (text,)
        })
        .open(backend, Role::Client)?;

    // Parent closes the channel when it is done
    channel.wait_closed().await;
    Ok(())
}
