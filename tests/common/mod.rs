#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use thermocal_lib::config::AppSettings;
use thermocal_lib::engine::{CaptureOutcome, ProbeEngineBuilder, ProbeEvent, ProbeHandle};
use thermocal_lib::persistence::CalibrationStore;
use thermocal_lib::serial::{SerialInterface, SerialPortIO};
use tokio::sync::{broadcast, mpsc};

/// Transport fed by the test through a channel. Dropping the sender looks
/// like the device going away.
pub struct ScriptedTransport {
    incoming: mpsc::UnboundedReceiver<Vec<u8>>,
    pending: Vec<u8>,
    sent: Arc<Mutex<Vec<String>>>,
    closed: Arc<AtomicBool>,
}

#[async_trait::async_trait]
impl SerialPortIO for ScriptedTransport {
    async fn send_data(&mut self, data: &[u8]) -> thermocal_lib::serial::Result<()> {
        self.sent.lock().unwrap().push(String::from_utf8_lossy(data).into_owned());
        Ok(())
    }

    async fn read_chunk(&mut self, buf: &mut [u8]) -> thermocal_lib::serial::Result<usize> {
        if self.pending.is_empty() {
            match self.incoming.recv().await {
                Some(chunk) => self.pending = chunk,
                None => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }

    async fn close(&mut self) -> thermocal_lib::serial::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Test side of a scripted transport.
pub struct ProbeLink {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    sent: Arc<Mutex<Vec<String>>>,
    closed: Arc<AtomicBool>,
}

impl ProbeLink {
    pub fn line(&self, line: &str) {
        self.bytes(format!("{}\n", line).as_bytes());
    }

    pub fn bytes(&self, bytes: &[u8]) {
        assert!(!bytes.is_empty());
        self.tx.send(bytes.to_vec()).expect("transport dropped");
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

pub fn scripted() -> (SerialInterface, ProbeLink) {
    let (tx, incoming) = mpsc::unbounded_channel();
    let sent = Arc::new(Mutex::new(Vec::new()));
    let closed = Arc::new(AtomicBool::new(false));
    let transport = ScriptedTransport {
        incoming,
        pending: Vec::new(),
        sent: sent.clone(),
        closed: closed.clone(),
    };
    (SerialInterface::from_io(Box::new(transport)), ProbeLink { tx, sent, closed })
}

pub async fn start_engine(store: Arc<dyn CalibrationStore>) -> (ProbeHandle, ProbeLink) {
    let (interface, link) = scripted();
    let handle = ProbeEngineBuilder::new(interface, AppSettings::default(), store)
        .start()
        .await
        .expect("engine start");
    (handle, link)
}

/// Wait until a logical channel shows the given raw value.
pub async fn wait_for_raw(handle: &ProbeHandle, logical_id: u8, raw: f64) {
    let mut rx = handle.snapshot_receiver();
    rx.wait_for(|s| s.channel(logical_id).map(|c| c.raw_value == raw).unwrap_or(false))
        .await
        .expect("engine stopped");
}

pub async fn next_committed(events: &mut broadcast::Receiver<ProbeEvent>) -> CaptureOutcome {
    loop {
        match events.recv().await {
            Ok(ProbeEvent::CaptureCommitted(outcome)) => return outcome,
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(e) => panic!("event stream ended: {}", e),
        }
    }
}
