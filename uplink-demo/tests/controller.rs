use std::{collections::VecDeque, time::Duration};

use tokio::time::{self, Instant};

use uplink_demo::libs::{
    Task,
    app::App,
    dispatcher::{Dispatcher, EventPoster, Handler},
    link::ConnectionState,
    sensor::Sensor,
    stack::{
        ConnectParams, ConnectStatus, LoraEvent, MsgFlags, SendResult, Stack, StackError,
        Transport,
    },
    uplink::Options as UplinkOptions,
};

const STEADY: Duration = Duration::from_millis(10000);
const BACKOFF: Duration = Duration::from_millis(3000);

struct FakeSensor(VecDeque<Option<f32>>);

impl Sensor for FakeSensor {
    fn read(&mut self) -> Option<f32> {
        self.0.pop_front().unwrap_or(Some(21.5))
    }
}

struct FakeStack {
    events: Option<EventPoster<Task>>,
    join_ok: bool,
    results: VecDeque<SendResult>,
    start: Instant,
    sent: Vec<(Duration, u8, Vec<u8>)>,
    downlinks: VecDeque<Vec<u8>>,
    receive_calls: usize,
}

impl FakeStack {
    fn new(join_ok: bool, results: Vec<SendResult>) -> Self {
        FakeStack {
            events: None,
            join_ok,
            results: results.into(),
            start: Instant::now(),
            sent: vec![],
            downlinks: VecDeque::new(),
            receive_calls: 0,
        }
    }

    fn send_times(&self) -> Vec<Duration> {
        self.sent.iter().map(|s| s.0).collect()
    }
}

impl Transport for FakeStack {
    fn send(&mut self, port: u8, data: &[u8], _flags: MsgFlags) -> SendResult {
        self.sent.push((self.start.elapsed(), port, data.to_vec()));
        self.results
            .pop_front()
            .unwrap_or(SendResult::Accepted(data.len()))
    }

    fn receive(&mut self, _port: u8, buf: &mut [u8], _flags: MsgFlags) -> Result<usize, StackError> {
        self.receive_calls += 1;
        let data = self.downlinks.pop_front().ok_or(StackError::WouldBlock)?;
        buf[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }
}

impl Stack for FakeStack {
    fn initialize(&mut self, events: EventPoster<Task>) -> Result<(), StackError> {
        self.events = Some(events);
        Ok(())
    }

    fn set_confirmed_msg_retries(&mut self, _count: u8) -> Result<(), StackError> {
        Ok(())
    }

    fn set_adaptive_datarate(&mut self, _enabled: bool) -> Result<(), StackError> {
        Ok(())
    }

    fn connect(&mut self, _params: &ConnectParams) -> Result<ConnectStatus, StackError> {
        let events = self.events.as_ref().ok_or(StackError::NotInitialized)?;
        events.post(match self.join_ok {
            false => LoraEvent::JoinFailure,
            true => LoraEvent::Connected,
        });
        Ok(ConnectStatus::InProgress)
    }
}

/// Runs the controller and checks the single-pending-uplink invariant after every task.
struct Observer {
    app: App<FakeSensor, FakeStack>,
    delays: Vec<Duration>,
    stop_after_sends: usize,
}

impl Handler<Task> for Observer {
    fn handle(&mut self, task: Task, dispatcher: &mut Dispatcher<Task>) {
        self.app.handle(task, dispatcher);

        match self.app.state() {
            ConnectionState::Connected => {
                assert_eq!(dispatcher.pending(), 1, "after {:?}", task);
                assert!(self.app.uplink().pending().is_some());
            }
            ConnectionState::Disconnected => {
                assert_eq!(dispatcher.pending(), 0);
                assert!(self.app.uplink().pending().is_none());
            }
            _ => (),
        }
        if task == Task::SendUplink {
            let id = self.app.uplink().pending().unwrap();
            self.delays.push(dispatcher.due_in(id).unwrap());
            if self.delays.len() >= self.stop_after_sends {
                dispatcher.stop();
            }
        }
    }
}

fn params() -> ConnectParams {
    ConnectParams {
        dev_eui: [0x00, 0xa7, 0x7c, 0x67, 0xd2, 0xb1, 0x7f, 0xb3],
        app_eui: [0x70, 0xb3, 0xd5, 0x7e, 0xd0, 0x00, 0xaa, 0xdf],
        app_key: [0x88; 16],
        nb_trials: 10,
    }
}

fn setup(
    stack: FakeStack,
    readings: Vec<Option<f32>>,
    stop_after_sends: usize,
) -> (Dispatcher<Task>, Observer) {
    let mut dispatcher = Dispatcher::new();
    let mut stack = stack;
    stack.initialize(dispatcher.poster()).unwrap();
    let opts = UplinkOptions {
        steady_interval: STEADY,
        backoff: BACKOFF,
        ..Default::default()
    };
    let mut app = App::new(FakeSensor(readings.into()), stack, opts);
    app.connect(&params()).unwrap();
    (
        dispatcher,
        Observer {
            app,
            delays: vec![],
            stop_after_sends,
        },
    )
}

fn post_at(dispatcher: &Dispatcher<Task>, at: Duration, event: LoraEvent) {
    let poster = dispatcher.poster();
    tokio::spawn(async move {
        time::sleep(at).await;
        poster.post(event);
    });
}

#[tokio::test(start_paused = true)]
async fn cadence_follows_send_results() {
    let stack = FakeStack::new(
        true,
        vec![
            SendResult::Accepted(4),
            SendResult::Backpressure,
            SendResult::Error(StackError::Busy),
        ],
    );
    let (mut dispatcher, mut observer) = setup(stack, vec![], 3);

    dispatcher.run_forever(&mut observer).await;

    assert_eq!(observer.delays, vec![STEADY, BACKOFF, STEADY]);
    assert_eq!(
        observer.app.stack().send_times(),
        vec![
            Duration::from_millis(10000),
            Duration::from_millis(20000),
            Duration::from_millis(23000),
        ]
    );
    let (_, port, payload) = &observer.app.stack().sent[0];
    assert_eq!(*port, 15);
    assert_eq!(payload, &vec![0x01, 0x67, 0x00, 0xd7]);
}

#[tokio::test(start_paused = true)]
async fn every_result_sequence_keeps_one_pending_uplink() {
    let results = vec![
        SendResult::Backpressure,
        SendResult::Backpressure,
        SendResult::Error(StackError::LengthError),
        SendResult::Accepted(4),
        SendResult::Error(StackError::NoActiveSessions),
        SendResult::Backpressure,
        SendResult::Accepted(4),
    ];
    let expected: Vec<Duration> = results
        .iter()
        .map(|r| match r {
            SendResult::Backpressure => BACKOFF,
            _ => STEADY,
        })
        .collect();
    let (mut dispatcher, mut observer) = setup(FakeStack::new(true, results), vec![], 7);

    dispatcher.run_forever(&mut observer).await;

    assert_eq!(observer.delays, expected);
    assert_eq!(dispatcher.pending(), 1);
}

#[tokio::test(start_paused = true)]
async fn uplink_required_sends_immediately_and_cadence_continues() {
    let (mut dispatcher, mut observer) = setup(FakeStack::new(true, vec![]), vec![], 3);
    post_at(&dispatcher, Duration::from_millis(15000), LoraEvent::UplinkRequired);

    dispatcher.run_forever(&mut observer).await;

    assert_eq!(
        observer.app.stack().send_times(),
        vec![
            Duration::from_millis(10000),
            Duration::from_millis(15000),
            Duration::from_millis(25000),
        ]
    );
    assert_eq!(observer.delays, vec![STEADY, STEADY, STEADY]);
}

#[tokio::test(start_paused = true)]
async fn disconnect_stops_dispatching() {
    let (mut dispatcher, mut observer) = setup(FakeStack::new(true, vec![]), vec![], usize::MAX);
    post_at(&dispatcher, Duration::from_millis(25000), LoraEvent::Disconnected);

    dispatcher.run_forever(&mut observer).await;

    assert_eq!(observer.app.state(), ConnectionState::Disconnected);
    assert!(!observer.app.join_failed());
    assert_eq!(observer.app.stack().sent.len(), 2);
    assert_eq!(dispatcher.pending(), 0);
    assert!(observer.app.uplink().pending().is_none());
}

#[tokio::test(start_paused = true)]
async fn join_failure_ends_session_without_sending() {
    let (mut dispatcher, mut observer) = setup(FakeStack::new(false, vec![]), vec![], usize::MAX);

    dispatcher.run_forever(&mut observer).await;

    assert_eq!(observer.app.state(), ConnectionState::Disconnected);
    assert!(observer.app.join_failed());
    assert!(observer.app.stack().sent.is_empty());
    assert_eq!(dispatcher.pending(), 0);
}

#[tokio::test(start_paused = true)]
async fn downlink_is_read_once_without_follow_up() {
    let mut stack = FakeStack::new(true, vec![]);
    stack.downlinks.push_back(vec![0xca, 0xfe]);
    stack.downlinks.push_back(vec![0x01]);
    let (mut dispatcher, mut observer) = setup(stack, vec![], 1);
    post_at(&dispatcher, Duration::from_millis(4000), LoraEvent::RxDone);

    dispatcher.run_forever(&mut observer).await;

    assert_eq!(observer.app.stack().receive_calls, 1);
    assert_eq!(observer.app.stack().downlinks.len(), 1);
    assert_eq!(observer.app.stack().send_times(), vec![STEADY]);
}

#[tokio::test(start_paused = true)]
async fn unknown_and_error_events_are_ignored() {
    let (mut dispatcher, mut observer) = setup(FakeStack::new(true, vec![]), vec![], 2);
    post_at(&dispatcher, Duration::from_millis(1000), LoraEvent::from(77));
    post_at(&dispatcher, Duration::from_millis(2000), LoraEvent::TxTimeout);
    post_at(&dispatcher, Duration::from_millis(3000), LoraEvent::RxError);

    dispatcher.run_forever(&mut observer).await;

    assert_eq!(observer.app.state(), ConnectionState::Connected);
    assert_eq!(
        observer.app.stack().send_times(),
        vec![Duration::from_millis(10000), Duration::from_millis(20000)]
    );
}

#[tokio::test(start_paused = true)]
async fn missing_reading_keeps_cadence() {
    let (mut dispatcher, mut observer) = setup(FakeStack::new(true, vec![]), vec![None], 2);

    dispatcher.run_forever(&mut observer).await;

    assert_eq!(observer.delays, vec![STEADY, STEADY]);
    assert_eq!(
        observer.app.stack().send_times(),
        vec![Duration::from_millis(20000)]
    );
}

#[tokio::test(start_paused = true)]
async fn connect_only_once() {
    let (_dispatcher, mut observer) = setup(FakeStack::new(true, vec![]), vec![], 1);

    assert_eq!(observer.app.state(), ConnectionState::Connecting);
    assert_eq!(
        observer.app.connect(&params()).unwrap_err(),
        StackError::AlreadyConnected
    );
}
