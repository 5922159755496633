//! Application controller. Owns all scheduling state and is the only dispatcher handler.

use std::time::Duration;

use log::{debug, error, info};

use super::{
    Task,
    dispatcher::{Dispatcher, Handler},
    downlink::Downlink,
    link::{Action, ConnectionState, Link},
    sensor::Sensor,
    stack::{ConnectParams, ConnectStatus, Stack, StackError},
    uplink::{Options as UplinkOptions, Uplink},
};

pub struct App<S: Sensor, T: Stack> {
    sensor: S,
    stack: T,
    link: Link,
    uplink: Uplink,
    downlink: Downlink,
    join_failed: bool,
}

impl<S: Sensor, T: Stack> App<S, T> {
    pub fn new(sensor: S, stack: T, opts: UplinkOptions) -> Self {
        let downlink = Downlink::new(opts.port);
        App {
            sensor,
            stack,
            link: Link::new(),
            uplink: Uplink::new(opts),
            downlink,
            join_failed: false,
        }
    }

    /// Starts joining. A returned error is a fatal connect error.
    pub fn connect(&mut self, params: &ConnectParams) -> Result<ConnectStatus, StackError> {
        const FN_NAME: &'static str = "App::connect";

        if self.link.state() != ConnectionState::Idle {
            return Err(StackError::AlreadyConnected);
        }
        let status = self.stack.connect(params)?;
        self.link.initiate();
        info!("[{}] connection in progress, {:?}", FN_NAME, params);
        Ok(status)
    }

    pub fn state(&self) -> ConnectionState {
        self.link.state()
    }

    /// `true` if the session ended with a join failure.
    pub fn join_failed(&self) -> bool {
        self.join_failed
    }

    pub fn stack(&self) -> &T {
        &self.stack
    }

    pub fn uplink(&self) -> &Uplink {
        &self.uplink
    }

    fn on_stack_event(&mut self, action: Action, dispatcher: &mut Dispatcher<Task>) {
        const FN_NAME: &'static str = "App::on_stack_event";

        match action {
            Action::None => (),
            Action::ArmFirstUplink => {
                let delay = self.uplink.steady_interval();
                self.uplink.arm(dispatcher, delay);
            }
            Action::SendNow => {
                self.uplink.arm(dispatcher, Duration::ZERO);
            }
            Action::Receive => {
                let _ = self.downlink.receive_message(&mut self.stack);
            }
            Action::JoinFailed => {
                error!("[{}] join failed, stop dispatching", FN_NAME);
                self.join_failed = true;
                self.uplink.cancel(dispatcher);
                dispatcher.stop();
            }
            Action::Stop => {
                info!("[{}] disconnected, stop dispatching", FN_NAME);
                self.uplink.cancel(dispatcher);
                dispatcher.stop();
            }
        }
    }
}

impl<S: Sensor, T: Stack> Handler<Task> for App<S, T> {
    fn handle(&mut self, task: Task, dispatcher: &mut Dispatcher<Task>) {
        const FN_NAME: &'static str = "App::handle";

        match task {
            Task::SendUplink => {
                self.uplink.fired();
                if self.link.state() != ConnectionState::Connected {
                    debug!("[{}] drop uplink in state {:?}", FN_NAME, self.link.state());
                    return;
                }
                self.uplink
                    .send_message(&mut self.sensor, &mut self.stack, dispatcher);
            }
            Task::Stack(event) => {
                let action = self.link.on_event(event);
                self.on_stack_event(action, dispatcher);
            }
        }
    }
}
