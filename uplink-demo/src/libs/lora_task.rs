//! Network stack on top of the iFrogLab LoRa USB dongle:
//! - Join by attaching to the dongle, reading its node ID and switching to RX mode.
//! - Use a background task to send queued uplink frames and poll downlink data.
//! - Report every outcome as a [`LoraEvent`] through the dispatcher.

use std::{
    collections::VecDeque,
    io::{Error as IoError, ErrorKind},
    sync::{Arc, Mutex},
    time::Duration,
};

use log::{debug, error, info, warn};
use tokio::{
    sync::mpsc::{self, Receiver, Sender, error::TrySendError},
    task::{self, JoinHandle},
    time::{self, Instant},
};

use super::{
    Task,
    dispatcher::EventPoster,
    lora_usb::{IfroglabLora, MAX_WRITE, Mode},
    stack::{
        ConnectParams, ConnectStatus, LoraEvent, MsgFlags, SendResult, Stack, StackError,
        Transport,
    },
};

pub struct Options {
    /// Serial port device path such as `/dev/ttyACM0` or `COM1`.
    pub dev_path: String,
    /// Frequency in 10 kHz.
    pub freq: u32,
    pub power: u8,
    /// Minimum quiet time between two accepted uplinks.
    pub tx_gap: Duration,
}

pub struct IfroglabStack {
    opts: OptionsInner,
    tx_gap: Duration,

    port: Option<IfroglabLora>,
    events: Option<EventPoster<Task>>,
    tx_queue: Option<Sender<TxFrame>>,
    last_tx: Option<Instant>,
    confirmed_retries: u8,

    node_id: Arc<Mutex<Option<u32>>>,
    rx_queue: Arc<Mutex<VecDeque<Vec<u8>>>>,
    task_handle: Option<JoinHandle<()>>,
}

#[derive(Clone)]
struct OptionsInner {
    dev_path: String,
    freq: u32,
    power: u8,
}

struct TxFrame {
    port: u8,
    payload: Vec<u8>,
}

/// Resources owned by the background task.
struct Worker {
    opts: OptionsInner,
    nb_trials: u8,
    events: EventPoster<Task>,
    node_id: Arc<Mutex<Option<u32>>>,
    rx_queue: Arc<Mutex<VecDeque<Vec<u8>>>>,
}

/// Frame header: node ID (4 bytes), port (1 byte), reserved (3 bytes).
const HEADER_LEN: usize = 8;
/// Maximum application payload per frame.
pub const MAX_APP_PAYLOAD: usize = MAX_WRITE - HEADER_LEN;
const MAX_RX_QUEUE: usize = 4;
const BROADCAST_ID: u32 = 0;
const MAX_CONFIRMED_MSG_RETRIES: u8 = 255;
const SLEEP_IDLE_MS: u64 = 100;
const JOIN_RETRY_MS: u64 = 1000;

impl IfroglabStack {
    pub fn new(opts: Options) -> Self {
        IfroglabStack {
            opts: OptionsInner {
                dev_path: opts.dev_path,
                freq: opts.freq,
                power: opts.power,
            },
            tx_gap: opts.tx_gap,
            port: None,
            events: None,
            tx_queue: None,
            last_tx: None,
            confirmed_retries: 0,
            node_id: Arc::new(Mutex::new(None)),
            rx_queue: Arc::new(Mutex::new(VecDeque::new())),
            task_handle: None,
        }
    }
}

impl Drop for IfroglabStack {
    fn drop(&mut self) {
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

impl Transport for IfroglabStack {
    fn send(&mut self, port: u8, data: &[u8], flags: MsgFlags) -> SendResult {
        const FN_NAME: &'static str = "IfroglabStack::send";

        if port < 1 || port > 223 {
            return SendResult::Error(StackError::PortInvalid);
        } else if data.len() < 1 || data.len() > MAX_APP_PAYLOAD {
            return SendResult::Error(StackError::LengthError);
        }
        let tx_queue = match self.tx_queue.as_ref() {
            None => return SendResult::Error(StackError::NoActiveSessions),
            Some(tx_queue) => tx_queue,
        };
        if self.node_id.lock().unwrap().is_none() {
            return SendResult::Error(StackError::NoActiveSessions);
        }
        if let Some(last_tx) = self.last_tx {
            if last_tx.elapsed() < self.tx_gap {
                return SendResult::Backpressure;
            }
        }
        if flags.contains(MsgFlags::CONFIRMED) {
            debug!(
                "[{}] no acknowledgement on raw LoRa, send as unconfirmed (retries {})",
                FN_NAME, self.confirmed_retries
            );
        }

        let frame = TxFrame {
            port,
            payload: data.to_vec(),
        };
        match tx_queue.try_send(frame) {
            Err(TrySendError::Full(_)) => SendResult::Backpressure,
            Err(TrySendError::Closed(_)) => SendResult::Error(StackError::NoActiveSessions),
            Ok(_) => {
                self.last_tx = Some(Instant::now());
                SendResult::Accepted(data.len())
            }
        }
    }

    fn receive(&mut self, _port: u8, buf: &mut [u8], _flags: MsgFlags) -> Result<usize, StackError> {
        const FN_NAME: &'static str = "IfroglabStack::receive";

        let data = match self.rx_queue.lock().unwrap().pop_front() {
            None => return Err(StackError::WouldBlock),
            Some(data) => data,
        };
        let size = data.len().min(buf.len());
        if size < data.len() {
            warn!(
                "[{}] truncate {} bytes to {} bytes",
                FN_NAME,
                data.len(),
                size
            );
        }
        buf[..size].copy_from_slice(&data[..size]);
        Ok(size)
    }
}

impl Stack for IfroglabStack {
    fn initialize(&mut self, events: EventPoster<Task>) -> Result<(), StackError> {
        const FN_NAME: &'static str = "IfroglabStack::initialize";

        if self.events.is_some() {
            return Err(StackError::Busy);
        }
        let port = match IfroglabLora::new(self.opts.dev_path.as_str()) {
            Err(e) => {
                error!("[{}] create port error: {}", FN_NAME, e);
                return Err(StackError::from(e));
            }
            Ok(port) => port,
        };
        self.port = Some(port);
        self.events = Some(events);
        Ok(())
    }

    fn set_confirmed_msg_retries(&mut self, count: u8) -> Result<(), StackError> {
        if count >= MAX_CONFIRMED_MSG_RETRIES {
            return Err(StackError::ParameterInvalid);
        }
        self.confirmed_retries = count;
        Ok(())
    }

    fn set_adaptive_datarate(&mut self, enabled: bool) -> Result<(), StackError> {
        match enabled {
            false => Ok(()),
            true => Err(StackError::Unsupported),
        }
    }

    fn connect(&mut self, params: &ConnectParams) -> Result<ConnectStatus, StackError> {
        let events = match self.events.as_ref() {
            None => return Err(StackError::NotInitialized),
            Some(events) => events.clone(),
        };
        if self.task_handle.is_some() {
            return Err(StackError::AlreadyConnected);
        } else if params.nb_trials == 0 {
            return Err(StackError::ParameterInvalid);
        }
        let port = match self.port.take() {
            None => return Err(StackError::NotInitialized),
            Some(port) => port,
        };

        let (tx, rx) = mpsc::channel(1);
        let worker = Worker {
            opts: self.opts.clone(),
            nb_trials: params.nb_trials,
            events,
            node_id: self.node_id.clone(),
            rx_queue: self.rx_queue.clone(),
        };
        self.tx_queue = Some(tx);
        self.task_handle = Some(create_event_loop(worker, port, rx));
        Ok(ConnectStatus::InProgress)
    }
}

/// To create an event loop runtime task.
fn create_event_loop(
    worker: Worker,
    port: IfroglabLora,
    mut tx_queue: Receiver<TxFrame>,
) -> JoinHandle<()> {
    task::spawn(async move {
        const FN_NAME: &'static str = "event_loop";

        let (mut port, mut node_id, mut counter) = match worker.join(Some(port)).await {
            None => {
                worker.events.post(LoraEvent::JoinFailure);
                return;
            }
            Some(joined) => joined,
        };
        *worker.node_id.lock().unwrap() = Some(node_id);
        worker.events.post(LoraEvent::Connected);

        loop {
            let frame = tokio::select! {
                frame = tx_queue.recv() => match frame {
                    None => break,
                    Some(frame) => Some(frame),
                },
                _ = time::sleep(Duration::from_millis(SLEEP_IDLE_MS)) => None,
            };
            let result = match frame {
                Some(frame) => worker.transmit(&mut port, node_id, frame).await,
                None => worker.poll_rx(&mut port, node_id, &mut counter).await,
            };
            if let Err(e) = result {
                error!("[{}] port error: {}, reconnect", FN_NAME, e);
                *worker.node_id.lock().unwrap() = None;
                (port, node_id, counter) = match worker.join(None).await {
                    None => {
                        worker.events.post(LoraEvent::Disconnected);
                        return;
                    }
                    Some(joined) => joined,
                };
                *worker.node_id.lock().unwrap() = Some(node_id);
            }
        }
        debug!("[{}] stack dropped, stop", FN_NAME);
    })
}

impl Worker {
    /// Attach to the dongle in at most `nb_trials` attempts.
    async fn join(&self, mut port: Option<IfroglabLora>) -> Option<(IfroglabLora, u32, u16)> {
        const FN_NAME: &'static str = "Worker::join";

        for trial in 1..=self.nb_trials {
            if trial > 1 {
                time::sleep(Duration::from_millis(JOIN_RETRY_MS)).await;
            }
            let mut dev = match port.take() {
                Some(dev) => dev,
                None => match IfroglabLora::new(self.opts.dev_path.as_str()) {
                    Err(e) => {
                        error!("[{}] create port error: {}", FN_NAME, e);
                        continue;
                    }
                    Ok(dev) => dev,
                },
            };
            let chip_info = match dev.chip_info().await {
                Err(e) => {
                    error!("[{}] read chip info error: {}", FN_NAME, e);
                    continue;
                }
                Ok(info) => info,
            };
            if let Err(e) = dev.set_mode(Mode::Rx, self.opts.freq, self.opts.power).await {
                error!("[{}] set RX mode error: {}", FN_NAME, e);
                continue;
            }
            let counter = match dev.read_data_counter().await {
                Err(e) => {
                    error!("[{}] get counter error: {}", FN_NAME, e);
                    continue;
                }
                Ok(counter) => counter,
            };
            info!(
                "[{}] joined as node {:08x?} (chip {:02x?}, fw {}) after {} trial(s)",
                FN_NAME, chip_info.node_id, chip_info.chip_id, chip_info.fw_ver, trial
            );
            return Some((dev, chip_info.node_id, counter));
        }
        None
    }

    /// Send one frame. Returns an error only when the port needs reconnecting.
    async fn transmit(
        &self,
        port: &mut IfroglabLora,
        node_id: u32,
        frame: TxFrame,
    ) -> Result<(), IoError> {
        const FN_NAME: &'static str = "Worker::transmit";

        let buff = build_tx_frame(node_id, frame.port, frame.payload.as_slice());
        let event = match port.set_mode(Mode::Tx, self.opts.freq, self.opts.power).await {
            Err(e) => {
                error!("[{}] set TX mode error: {}", FN_NAME, e);
                LoraEvent::TxError
            }
            Ok(_) => match port.write_data(buff.as_slice()).await {
                Err(e) => {
                    error!("[{}] send cmd05 error: {}", FN_NAME, e);
                    match e.kind() {
                        ErrorKind::TimedOut => LoraEvent::TxTimeout,
                        _ => LoraEvent::TxError,
                    }
                }
                Ok(_) => LoraEvent::TxDone,
            },
        };
        self.events.post(event);

        if let Err(e) = port.set_mode(Mode::Rx, self.opts.freq, self.opts.power).await {
            error!("[{}] set back RX mode error: {}", FN_NAME, e);
            return Err(e);
        }
        Ok(())
    }

    /// Read new data if the data counter moved. Returns an error only when the port needs
    /// reconnecting.
    async fn poll_rx(
        &self,
        port: &mut IfroglabLora,
        node_id: u32,
        counter: &mut u16,
    ) -> Result<(), IoError> {
        const FN_NAME: &'static str = "Worker::poll_rx";

        let new_counter = port.read_data_counter().await?;
        if new_counter == *counter {
            return Ok(());
        }
        *counter = new_counter;

        let read_data = match port.read_data().await {
            Err(e) => {
                error!("[{}] read data error: {}", FN_NAME, e);
                self.events.post(LoraEvent::RxError);
                return Ok(());
            }
            Ok(None) => return Ok(()),
            Ok(Some(data)) => data,
        };
        let payload = match parse_rx_frame(read_data.data.as_slice(), node_id) {
            Err(e) => {
                warn!("[{}] parse data error: {}", FN_NAME, e);
                self.events.post(LoraEvent::RxError);
                return Ok(());
            }
            Ok(None) => {
                debug!("[{}] skip other device data", FN_NAME);
                return Ok(());
            }
            Ok(Some(payload)) => payload,
        };
        debug!(
            "[{}] get data {}, RSSI: {}",
            FN_NAME,
            hex::encode(payload.as_slice()),
            read_data.rssi
        );
        {
            let mut queue = self.rx_queue.lock().unwrap();
            if queue.len() >= MAX_RX_QUEUE {
                warn!("[{}] downlink queue full, drop the oldest", FN_NAME);
                queue.pop_front();
            }
            queue.push_back(payload);
        }
        self.events.post(LoraEvent::RxDone);
        Ok(())
    }
}

fn build_tx_frame(node_id: u32, port: u8, payload: &[u8]) -> Vec<u8> {
    let mut buff = Vec::with_capacity(HEADER_LEN + payload.len());
    buff.extend_from_slice(&node_id.to_be_bytes());
    buff.extend_from_slice(&[port, 0, 0, 0]);
    buff.extend_from_slice(payload);
    buff
}

/// Returns the payload if the frame is addressed to `node_id` or broadcast.
fn parse_rx_frame(raw: &[u8], node_id: u32) -> Result<Option<Vec<u8>>, IoError> {
    if raw.len() < HEADER_LEN {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("frame with only {} bytes", raw.len()),
        ));
    }

    let dst = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]);
    match dst == node_id || dst == BROADCAST_ID {
        false => Ok(None),
        true => Ok(Some(raw[HEADER_LEN..].to_vec())),
    }
}
