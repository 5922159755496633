//! Uplink scheduler: one sample and one send attempt per invocation, then exactly one re-arm.

use std::time::Duration;

use log::{debug, error, info, warn};

use super::{
    MAX_PAYLOAD, Task,
    dispatcher::{Dispatcher, TaskId},
    lpp::LppPayload,
    sensor::Sensor,
    stack::{MsgFlags, SendResult, Transport},
};

pub struct Options {
    pub port: u8,
    /// LPP channel of the temperature record.
    pub channel: u8,
    pub confirmed: bool,
    /// Delay between regular uplinks and after errors.
    pub steady_interval: Duration,
    /// Delay after a duty-cycle restriction.
    pub backoff: Duration,
}

pub const DEF_STEADY_INTERVAL: Duration = Duration::from_millis(10000);
pub const DEF_BACKOFF: Duration = Duration::from_millis(3000);

impl Default for Options {
    fn default() -> Self {
        Options {
            port: 15,
            channel: 1,
            confirmed: false,
            steady_interval: DEF_STEADY_INTERVAL,
            backoff: DEF_BACKOFF,
        }
    }
}

pub struct Uplink {
    opts: Options,
    pending: Option<TaskId>,
}

impl Uplink {
    pub fn new(opts: Options) -> Self {
        Uplink {
            opts,
            pending: None,
        }
    }

    pub fn steady_interval(&self) -> Duration {
        self.opts.steady_interval
    }

    /// The outstanding uplink task, if any.
    pub fn pending(&self) -> Option<TaskId> {
        self.pending
    }

    /// Schedules the next uplink after `delay`, replacing any outstanding one.
    pub fn arm(&mut self, dispatcher: &mut Dispatcher<Task>, delay: Duration) -> TaskId {
        const FN_NAME: &'static str = "Uplink::arm";

        if let Some(id) = self.pending.take() {
            if dispatcher.cancel(id) {
                debug!("[{}] replace pending uplink", FN_NAME);
            }
        }
        let id = dispatcher.schedule_after(delay, Task::SendUplink);
        self.pending = Some(id);
        id
    }

    /// Marks the outstanding task as run.
    pub fn fired(&mut self) {
        self.pending = None;
    }

    /// Cancels the outstanding task without re-arming.
    pub fn cancel(&mut self, dispatcher: &mut Dispatcher<Task>) {
        if let Some(id) = self.pending.take() {
            dispatcher.cancel(id);
        }
    }

    /// Samples the sensor, attempts one send and re-arms. Returns the armed delay.
    pub fn send_message<S: Sensor, T: Transport>(
        &mut self,
        sensor: &mut S,
        transport: &mut T,
        dispatcher: &mut Dispatcher<Task>,
    ) -> Duration {
        let delay = self.attempt(sensor, transport);
        self.arm(dispatcher, delay);
        delay
    }

    fn attempt<S: Sensor, T: Transport>(&self, sensor: &mut S, transport: &mut T) -> Duration {
        const FN_NAME: &'static str = "Uplink::attempt";

        let temperature = match sensor.read() {
            None => {
                warn!("[{}] no sensor reading, skip this uplink", FN_NAME);
                return self.opts.steady_interval;
            }
            Some(temperature) => temperature,
        };
        info!("[{}] temperature is {:.2} C", FN_NAME, temperature);

        let mut payload = LppPayload::new(MAX_PAYLOAD);
        if let Err(e) = payload.add_temperature(self.opts.channel, temperature) {
            error!("[{}] encode payload error: {}", FN_NAME, e);
            return self.opts.steady_interval;
        }

        let flags = match self.opts.confirmed {
            false => MsgFlags::UNCONFIRMED,
            true => MsgFlags::CONFIRMED,
        };
        match transport.send(self.opts.port, payload.as_bytes(), flags) {
            SendResult::Accepted(size) => {
                info!("[{}] {} bytes scheduled for transmission", FN_NAME, size);
                self.opts.steady_interval
            }
            SendResult::Backpressure => {
                warn!(
                    "[{}] duty cycle restricted, retry in {} ms",
                    FN_NAME,
                    self.opts.backoff.as_millis()
                );
                self.opts.backoff
            }
            SendResult::Error(e) => {
                error!("[{}] send error: {}, code: {}", FN_NAME, e, e.code());
                self.opts.steady_interval
            }
        }
    }
}
