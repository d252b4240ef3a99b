//! Common test utilities and helpers
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio::time::Instant;

use port_mirror::allocator::PortAllocator;
use port_mirror::config::ForwardConfig;
use port_mirror::control::{Command, StateSnapshot};
use port_mirror::reconciler::Reconciler;
use port_mirror::registry::TunnelRegistry;
use port_mirror::scanner::{InventoryScanner, RemotePortRecord, ScanError};
use port_mirror::transport::{ByteStream, ExecOutput, Transport, TransportError};

/// Scanner whose inventory the test sets directly.
pub struct FakeScanner {
    inventory: Mutex<Vec<RemotePortRecord>>,
    errors: Mutex<VecDeque<ScanError>>,
}

impl FakeScanner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inventory: Mutex::new(Vec::new()),
            errors: Mutex::new(VecDeque::new()),
        })
    }

    pub fn set_ports(&self, ports: &[(u16, &str)]) {
        let records = ports
            .iter()
            .map(|&(port, name)| RemotePortRecord {
                port,
                process_name: Some(name.to_string()),
            })
            .collect();
        *self.inventory.lock().unwrap() = records;
    }

    pub fn clear(&self) {
        self.inventory.lock().unwrap().clear();
    }

    /// Queue one scan failure; subsequent scans succeed again.
    pub fn fail_next(&self, reason: &str) {
        self.errors.lock().unwrap().push_back(ScanError {
            reason: reason.to_string(),
        });
    }
}

#[async_trait]
impl InventoryScanner for FakeScanner {
    async fn scan(&self) -> Result<Vec<RemotePortRecord>, ScanError> {
        if let Some(err) = self.errors.lock().unwrap().pop_front() {
            return Err(err);
        }
        Ok(self.inventory.lock().unwrap().clone())
    }
}

/// Transport whose channels echo every byte back, with scriptable failures.
pub struct FakeTransport {
    connected: AtomicBool,
    refusals: Mutex<HashMap<u16, u32>>,
    channels_opened: AtomicUsize,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            connected: AtomicBool::new(true),
            refusals: Mutex::new(HashMap::new()),
            channels_opened: AtomicUsize::new(0),
        })
    }

    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Make the next `times` channel opens for `port` fail.
    pub fn refuse_port(&self, port: u16, times: u32) {
        self.refusals.lock().unwrap().insert(port, times);
    }

    pub fn channels_opened(&self) -> usize {
        self.channels_opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn execute(&self, _command: &str) -> Result<ExecOutput, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::ConnectionLost);
        }
        Ok(ExecOutput {
            stdout: String::new(),
            exit_code: Some(0),
        })
    }

    async fn open_channel(
        &self,
        host: &str,
        port: u16,
    ) -> Result<Box<dyn ByteStream>, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::ConnectionLost);
        }
        if let Some(left) = self.refusals.lock().unwrap().get_mut(&port) {
            if *left > 0 {
                *left -= 1;
                return Err(TransportError::ChannelOpen {
                    host: host.to_string(),
                    port,
                    message: "refused by test".to_string(),
                });
            }
        }

        self.channels_opened.fetch_add(1, Ordering::SeqCst);
        let (near, far) = tokio::io::duplex(256 * 1024);
        tokio::spawn(echo(far));
        Ok(Box::new(near))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

async fn echo(stream: tokio::io::DuplexStream) {
    let (mut reader, mut writer) = tokio::io::split(stream);
    let _ = tokio::io::copy(&mut reader, &mut writer).await;
    let _ = writer.shutdown().await;
}

/// A reconciler wired to fakes, driven tick by tick from the test.
pub struct Rig {
    pub scanner: Arc<FakeScanner>,
    pub transport: Arc<FakeTransport>,
    pub registry: TunnelRegistry,
    pub reconciler: Reconciler,
    pub snapshots: watch::Receiver<StateSnapshot>,
}

impl Rig {
    pub fn new(config: ForwardConfig) -> Self {
        let scanner = FakeScanner::new();
        let transport = FakeTransport::new();
        let registry = TunnelRegistry::new();
        let (snapshot_tx, snapshots) = watch::channel(StateSnapshot::default());
        let reconciler = Reconciler::new(
            config.clone(),
            scanner.clone(),
            transport.clone(),
            registry.clone(),
            PortAllocator::new(config.port_range),
            snapshot_tx,
        );
        Self {
            scanner,
            transport,
            registry,
            reconciler,
            snapshots,
        }
    }

    /// A timer tick: fresh scan, no commands.
    pub async fn tick(&mut self) -> port_mirror::Result<()> {
        self.reconciler.tick(Vec::new(), true).await
    }

    /// A command-driven tick without a fresh scan, as the monitor runs them.
    pub async fn command(&mut self, command: Command) -> port_mirror::Result<()> {
        self.reconciler.tick(vec![command], false).await
    }

    pub fn snapshot(&self) -> StateSnapshot {
        self.snapshots.borrow().clone()
    }
}

/// Config confined to a dedicated port block so tests don't collide.
pub fn test_config(port_range: (u16, u16)) -> ForwardConfig {
    ForwardConfig {
        port_range,
        // The block sits above the default auto-forward ceiling; lift the
        // ceiling so ports inside it stay eligible.
        max_auto_port: port_range.1,
        drain_timeout: Duration::from_millis(500),
        ..ForwardConfig::default()
    }
}

/// Poll `condition` until it holds or `timeout_ms` elapses.
pub async fn wait_until(condition: impl Fn() -> bool, timeout_ms: u64) -> bool {
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Find an available TCP port for testing
pub fn find_available_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind to random port");
    listener.local_addr().unwrap().port()
}
