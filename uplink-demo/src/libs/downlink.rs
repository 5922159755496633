//! Downlink handler: one bounded read per receive-ready event.

use log::{error, info};

use super::{
    MAX_PAYLOAD,
    stack::{MsgFlags, Transport},
};

pub struct Downlink {
    port: u8,
}

impl Downlink {
    pub fn new(port: u8) -> Self {
        Downlink { port }
    }

    /// Reads one message and logs it in hex. Errors are logged and swallowed.
    pub fn receive_message<T: Transport>(&self, transport: &mut T) -> Option<Vec<u8>> {
        const FN_NAME: &'static str = "Downlink::receive_message";

        let mut buff = [0u8; MAX_PAYLOAD];
        let size = match transport.receive(
            self.port,
            &mut buff,
            MsgFlags::CONFIRMED | MsgFlags::UNCONFIRMED,
        ) {
            Err(e) => {
                error!("[{}] receive error: {}, code: {}", FN_NAME, e, e.code());
                return None;
            }
            Ok(size) => size.min(buff.len()),
        };

        info!("[{}] {}", FN_NAME, rx_data_line(&buff[..size]));
        Some(buff[..size].to_vec())
    }
}

fn rx_data_line(data: &[u8]) -> String {
    format!("RX data ({} bytes): {}", data.len(), hex::encode(data))
}
