//! Connection lifecycle tracking. Maps stack events to application actions.

use log::{error, info, warn};

use super::stack::LoraEvent;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Connected,
    Disconnected,
}

/// What the controller must do in response to an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    None,
    /// Arm the first uplink after the steady interval.
    ArmFirstUplink,
    /// Send an uplink now, in addition to the regular cadence.
    SendNow,
    /// Read one downlink.
    Receive,
    /// The join attempt failed. Stop dispatching.
    JoinFailed,
    /// The session ended. Stop dispatching.
    Stop,
}

#[derive(Debug, Default)]
pub struct Link {
    state: ConnectionState,
}

impl Link {
    pub fn new() -> Self {
        Link::default()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Idle -> Connecting. Returns `false` in any other state.
    pub fn initiate(&mut self) -> bool {
        match self.state {
            ConnectionState::Idle => {
                self.state = ConnectionState::Connecting;
                true
            }
            _ => false,
        }
    }

    pub fn on_event(&mut self, event: LoraEvent) -> Action {
        const FN_NAME: &'static str = "Link::on_event";

        match (self.state, event) {
            (ConnectionState::Connecting, LoraEvent::Connected) => {
                info!("[{}] connection successful", FN_NAME);
                self.state = ConnectionState::Connected;
                Action::ArmFirstUplink
            }
            (ConnectionState::Connecting, LoraEvent::JoinFailure) => {
                error!("[{}] join failed, check keys", FN_NAME);
                self.state = ConnectionState::Disconnected;
                Action::JoinFailed
            }
            (
                ConnectionState::Connecting | ConnectionState::Connected,
                LoraEvent::Disconnected,
            ) => {
                info!("[{}] disconnected", FN_NAME);
                self.state = ConnectionState::Disconnected;
                Action::Stop
            }
            (ConnectionState::Connected, LoraEvent::UplinkRequired) => {
                info!("[{}] uplink required by network server", FN_NAME);
                Action::SendNow
            }
            (_, LoraEvent::TxDone) => {
                info!("[{}] message sent to network server", FN_NAME);
                Action::None
            }
            (
                _,
                LoraEvent::TxTimeout
                | LoraEvent::TxError
                | LoraEvent::TxCryptoError
                | LoraEvent::TxSchedulingError,
            ) => {
                warn!(
                    "[{}] transmission error, event code: {}",
                    FN_NAME,
                    event.code()
                );
                Action::None
            }
            (_, LoraEvent::RxDone) => {
                info!("[{}] received message from network server", FN_NAME);
                Action::Receive
            }
            (_, LoraEvent::RxTimeout | LoraEvent::RxError) => {
                warn!("[{}] reception error, event code: {}", FN_NAME, event.code());
                Action::None
            }
            (_, LoraEvent::Unknown(code)) => {
                error!("[{}] unknown event code: {}", FN_NAME, code);
                Action::None
            }
            (state, event) => {
                warn!(
                    "[{}] ignore unexpected event {:?} in state {:?}",
                    FN_NAME, event, state
                );
                Action::None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_EVENTS: [LoraEvent; 13] = [
        LoraEvent::Connected,
        LoraEvent::Disconnected,
        LoraEvent::TxDone,
        LoraEvent::TxTimeout,
        LoraEvent::TxError,
        LoraEvent::TxCryptoError,
        LoraEvent::TxSchedulingError,
        LoraEvent::RxDone,
        LoraEvent::RxTimeout,
        LoraEvent::RxError,
        LoraEvent::JoinFailure,
        LoraEvent::UplinkRequired,
        LoraEvent::Unknown(99),
    ];

    fn link_in(state: ConnectionState) -> Link {
        Link { state }
    }

    #[test]
    fn initiate_only_from_idle() {
        let mut link = Link::new();
        assert_eq!(link.state(), ConnectionState::Idle);
        assert!(link.initiate());
        assert_eq!(link.state(), ConnectionState::Connecting);
        assert!(!link.initiate());
        assert_eq!(link.state(), ConnectionState::Connecting);
    }

    #[test]
    fn connected_only_from_connecting() {
        let mut link = link_in(ConnectionState::Connecting);
        assert_eq!(link.on_event(LoraEvent::Connected), Action::ArmFirstUplink);
        assert_eq!(link.state(), ConnectionState::Connected);

        for state in [ConnectionState::Idle, ConnectionState::Disconnected] {
            let mut link = link_in(state);
            assert_eq!(link.on_event(LoraEvent::Connected), Action::None);
            assert_eq!(link.state(), state);
        }
    }

    #[test]
    fn join_failure_disconnects() {
        let mut link = link_in(ConnectionState::Connecting);
        assert_eq!(link.on_event(LoraEvent::JoinFailure), Action::JoinFailed);
        assert_eq!(link.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn disconnect_stops() {
        let mut link = link_in(ConnectionState::Connected);
        assert_eq!(link.on_event(LoraEvent::Disconnected), Action::Stop);
        assert_eq!(link.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn uplink_required_only_when_connected() {
        let mut link = link_in(ConnectionState::Connected);
        assert_eq!(link.on_event(LoraEvent::UplinkRequired), Action::SendNow);
        assert_eq!(link.state(), ConnectionState::Connected);

        let mut link = link_in(ConnectionState::Connecting);
        assert_eq!(link.on_event(LoraEvent::UplinkRequired), Action::None);
    }

    #[test]
    fn rx_done_receives_in_any_state() {
        for state in [ConnectionState::Connecting, ConnectionState::Connected] {
            let mut link = link_in(state);
            assert_eq!(link.on_event(LoraEvent::RxDone), Action::Receive);
        }
    }

    #[test]
    fn only_lifecycle_events_change_state() {
        let lifecycle = [
            LoraEvent::Connected,
            LoraEvent::Disconnected,
            LoraEvent::JoinFailure,
        ];
        for state in [
            ConnectionState::Idle,
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Disconnected,
        ] {
            for event in ALL_EVENTS.iter().filter(|e| !lifecycle.contains(e)) {
                let mut link = link_in(state);
                link.on_event(*event);
                assert_eq!(link.state(), state, "{:?} changed {:?}", event, state);
            }
        }
    }

    #[test]
    fn unknown_event_is_ignored() {
        let mut link = link_in(ConnectionState::Connected);
        assert_eq!(link.on_event(LoraEvent::from(200)), Action::None);
        assert_eq!(link.state(), ConnectionState::Connected);
    }
}
