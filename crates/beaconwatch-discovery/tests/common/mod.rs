//! Shared helpers for engine integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use beaconwatch_discovery::{encode_beacon, BeaconTransport, DiscoveryEvent, EventReceiver};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::Mutex;

/// Feeds datagrams to the engine from a test
pub type BeaconSender = mpsc::UnboundedSender<io::Result<Vec<u8>>>;

/// In-memory transport driven by a channel.
///
/// Each item is either a datagram or a receive error. Once the sending side
/// is dropped, receives stay pending like an idle socket.
pub struct ChannelTransport {
    rx: Mutex<mpsc::UnboundedReceiver<io::Result<Vec<u8>>>>,
    addr: SocketAddr,
}

impl ChannelTransport {
    pub fn new() -> (Self, BeaconSender) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Self {
            rx: Mutex::new(rx),
            addr: "127.0.0.1:6".parse().unwrap(),
        };
        (transport, tx)
    }
}

#[async_trait]
impl BeaconTransport for ChannelTransport {
    async fn recv_beacon(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let next = self.rx.lock().await.recv().await;
        match next {
            Some(Ok(datagram)) => {
                let len = datagram.len().min(buf.len());
                buf[..len].copy_from_slice(&datagram[..len]);
                Ok((len, "192.168.1.10:6".parse().unwrap()))
            }
            Some(Err(e)) => Err(e),
            None => std::future::pending().await,
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.addr)
    }
}

/// Sends a beacon carrying `text`
pub fn send_beacon(sender: &BeaconSender, text: &str) {
    sender.send(Ok(encode_beacon(text))).unwrap();
}

/// Waits for the next event, failing the test if none arrives
pub async fn next_event(events: &EventReceiver) -> DiscoveryEvent {
    tokio::time::timeout(Duration::from_secs(120), events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

/// Asserts that nothing is delivered within `window`
pub async fn assert_quiet(events: &EventReceiver, window: Duration) {
    if let Ok(event) = tokio::time::timeout(window, events.recv()).await {
        panic!("unexpected event: {:?}", event);
    }
}

/// Polls `condition` until it holds
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached");
}
