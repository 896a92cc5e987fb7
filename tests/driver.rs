//! End-to-end driver scenarios against a scripted controller on an
//! in-memory duplex pipe.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use zwave_driver::core::constants::*;
use zwave_driver::{
    ControllerCommand, ControllerState, Driver, DriverOptions, Message, NotificationKind,
    Notifications, SendQueue, StreamTransport, ValueId,
};

const TEST_HOME_ID: u32 = 0xc0ffee01;

/// Fail a test instead of hanging it.
async fn within<T>(what: &str, fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}

/// What the mock controller reports for one node.
#[derive(Clone)]
struct Profile {
    protocol_info: [u8; 6],
    classes: Vec<u8>,
}

impl Profile {
    /// A mains-powered static controller.
    fn controller() -> Self {
        Profile {
            protocol_info: [0xd3, 0x00, 0x00, 0x02, 0x02, 0x01],
            classes: vec![],
        }
    }

    /// A battery-powered, non-listening sensor with the wake-up class.
    fn battery_sensor() -> Self {
        Profile {
            protocol_info: [0x53, 0x00, 0x00, 0x04, 0x21, 0x01],
            classes: vec![COMMAND_CLASS_WAKE_UP],
        }
    }
}

/// The controller end of the serial pipe.
struct MockController {
    stream: DuplexStream,
}

impl MockController {
    fn checksum(bytes: &[u8]) -> u8 {
        bytes.iter().fold(0xff, |chk, b| chk ^ b)
    }

    async fn read_byte(&mut self) -> u8 {
        within("a byte from the driver", self.stream.read_u8()).await.unwrap()
    }

    /// Read the next data frame, skipping control tokens. Returns the body
    /// `<type> <func> <payload…>` without the checksum. Does not ACK.
    async fn read_request(&mut self) -> Vec<u8> {
        loop {
            let byte = self.read_byte().await;
            match byte {
                SOF => {
                    let length = self.read_byte().await as usize;
                    let mut body = vec![0u8; length];
                    within("a frame body", self.stream.read_exact(&mut body))
                        .await
                        .unwrap();
                    body.truncate(length - 1);
                    return body;
                }
                ACK | NAK | CAN => continue,
                other => panic!("unexpected byte from driver: 0x{other:02x}"),
            }
        }
    }

    async fn write_raw(&mut self, bytes: &[u8]) {
        within("write to the driver", self.stream.write_all(bytes))
            .await
            .unwrap();
    }

    async fn ack(&mut self) {
        self.write_raw(&[ACK]).await;
    }

    async fn nak(&mut self) {
        self.write_raw(&[NAK]).await;
    }

    async fn send_frame(&mut self, msg_type: u8, function_id: u8, payload: &[u8]) {
        let mut frame = Vec::with_capacity(payload.len() + 5);
        frame.push(SOF);
        frame.push((payload.len() + 3) as u8);
        frame.push(msg_type);
        frame.push(function_id);
        frame.extend_from_slice(payload);
        let chk = Self::checksum(&frame[1..]);
        frame.push(chk);
        self.write_raw(&frame).await;
    }

    async fn respond(&mut self, function_id: u8, payload: &[u8]) {
        self.send_frame(RESPONSE, function_id, payload).await;
    }

    async fn request(&mut self, function_id: u8, payload: &[u8]) {
        self.send_frame(REQUEST, function_id, payload).await;
    }

    /// Handle one request from the driver the way a well-behaved
    /// controller would. Returns the function id served.
    async fn serve(&mut self, profiles: &BTreeMap<u8, Profile>) -> u8 {
        let body = self.read_request().await;
        let function_id = body[1];
        self.ack().await;

        match function_id {
            FUNC_ID_ZW_GET_VERSION => {
                let mut payload = b"Z-Wave 3.95".to_vec();
                payload.push(0);
                payload.push(0x01); // static controller library
                self.respond(function_id, &payload).await;
            }
            FUNC_ID_ZW_MEMORY_GET_ID => {
                let mut payload = TEST_HOME_ID.to_be_bytes().to_vec();
                payload.push(0x01); // our node id
                self.respond(function_id, &payload).await;
            }
            FUNC_ID_ZW_GET_CONTROLLER_CAPABILITIES => {
                self.respond(function_id, &[0x00]).await;
            }
            FUNC_ID_SERIAL_API_GET_CAPABILITIES => {
                let mut payload = vec![3, 7, 0x00, 0x86, 0x00, 0x02, 0x00, 0x5a];
                payload.extend_from_slice(&[0xff; 32]);
                self.respond(function_id, &payload).await;
            }
            FUNC_ID_ZW_GET_SUC_NODE_ID => {
                // A SUC exists, so the driver does not elect itself.
                self.respond(function_id, &[0x01]).await;
            }
            FUNC_ID_SERIAL_API_GET_INIT_DATA => {
                let mut bitmap = [0u8; NUM_NODE_BITFIELD_BYTES];
                for &node_id in profiles.keys() {
                    let bit = node_id as usize - 1;
                    bitmap[bit / 8] |= 1 << (bit % 8);
                }
                let mut payload = vec![5, 0x08, NUM_NODE_BITFIELD_BYTES as u8];
                payload.extend_from_slice(&bitmap);
                self.respond(function_id, &payload).await;
            }
            FUNC_ID_ZW_GET_NODE_PROTOCOL_INFO => {
                let node_id = body[2];
                let profile = &profiles[&node_id];
                self.respond(function_id, &profile.protocol_info).await;
            }
            FUNC_ID_ZW_REQUEST_NODE_INFO => {
                let node_id = body[2];
                self.respond(function_id, &[0x01]).await;

                let profile = &profiles[&node_id];
                let mut payload = vec![
                    UPDATE_STATE_NODE_INFO_RECEIVED,
                    node_id,
                    (3 + profile.classes.len()) as u8,
                    profile.protocol_info[3],
                    profile.protocol_info[4],
                    profile.protocol_info[5],
                ];
                payload.extend_from_slice(&profile.classes);
                self.request(FUNC_ID_ZW_APPLICATION_UPDATE, &payload).await;
            }
            FUNC_ID_ZW_SEND_DATA => {
                let node_id = body[2];
                let length = body[3] as usize;
                let data = body[4..4 + length].to_vec();
                let callback_id = body[5 + length];

                self.respond(function_id, &[0x01]).await;
                self.request(function_id, &[callback_id, TRANSMIT_COMPLETE_OK])
                    .await;

                if data == [COMMAND_CLASS_WAKE_UP, WAKE_UP_INTERVAL_GET] {
                    // Wake-up Interval Report: 3600 seconds.
                    self.request(
                        FUNC_ID_APPLICATION_COMMAND_HANDLER,
                        &[0x00, node_id, 5, COMMAND_CLASS_WAKE_UP, 0x06, 0x00, 0x0e, 0x10],
                    )
                    .await;
                }
            }
            other => panic!("mock controller cannot serve function 0x{other:02x}"),
        }
        function_id
    }

    /// Serve the five identification requests plus the init data request.
    async fn serve_init(&mut self, profiles: &BTreeMap<u8, Profile>) {
        let mut served = Vec::new();
        for _ in 0..6 {
            served.push(self.serve(profiles).await);
        }
        assert_eq!(
            served,
            vec![
                FUNC_ID_ZW_GET_VERSION,
                FUNC_ID_ZW_MEMORY_GET_ID,
                FUNC_ID_ZW_GET_CONTROLLER_CAPABILITIES,
                FUNC_ID_SERIAL_API_GET_CAPABILITIES,
                FUNC_ID_ZW_GET_SUC_NODE_ID,
                FUNC_ID_SERIAL_API_GET_INIT_DATA,
            ]
        );
    }
}

fn start_driver(options: DriverOptions) -> (Driver, Notifications, MockController) {
    let (host_side, controller_side) = tokio::io::duplex(4096);
    let transport = StreamTransport::new(host_side, "mock controller");
    let (driver, notifications) = Driver::start(transport, options);
    (
        driver,
        notifications,
        MockController {
            stream: controller_side,
        },
    )
}

fn scratch_options() -> DriverOptions {
    static COUNTER: std::sync::atomic::AtomicU32 = std::sync::atomic::AtomicU32::new(0);
    let dir = std::env::temp_dir().join(format!(
        "zwave-driver-e2e-{}-{}",
        std::process::id(),
        COUNTER.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    ));
    std::fs::create_dir_all(&dir).unwrap();
    DriverOptions::new().user_path(dir).save_configuration(false)
}

async fn drain_notifications(notifications: &mut Notifications, until: NotificationKind) -> Vec<NotificationKind> {
    let mut kinds = Vec::new();
    loop {
        let notification = within("a notification", notifications.recv())
            .await
            .expect("notification stream closed");
        assert_eq!(notification.home_id, TEST_HOME_ID);
        kinds.push(notification.kind.clone());
        if kinds.last() == Some(&until) {
            return kinds;
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn init_interrogates_all_nodes() {
    let mut profiles = BTreeMap::new();
    profiles.insert(1, Profile::controller());
    profiles.insert(7, Profile::battery_sensor());

    let (driver, mut notifications, mut mock) = start_driver(scratch_options());

    mock.serve_init(&profiles).await;
    // Two interrogation requests per node, plus the battery node's
    // wake-up interval query.
    for _ in 0..5 {
        mock.serve(&profiles).await;
    }

    let kinds = drain_notifications(&mut notifications, NotificationKind::AllNodesQueried).await;
    assert_eq!(kinds[0], NotificationKind::DriverReady { node_id: 1 });
    assert!(kinds.contains(&NotificationKind::NodeNew { node_id: 1 }));
    assert!(kinds.contains(&NotificationKind::NodeAdded { node_id: 7 }));

    let sensor = driver.node_summary(7).expect("node 7 exists");
    assert!(!sensor.listening);
    assert!(sensor.command_classes.contains(&COMMAND_CLASS_WAKE_UP));
    assert_eq!(sensor.query_stage.name(), "Complete");

    let own = driver.node_summary(1).expect("node 1 exists");
    assert!(own.listening);
    assert_eq!(own.basic, 0x02);

    assert_eq!(driver.home_id(), TEST_HOME_ID);
    assert!(driver.identity().supports_function(FUNC_ID_ZW_GET_ROUTING_INFO));

    // Poll bookkeeping is idempotent both ways.
    let value = ValueId {
        node_id: 7,
        class_id: COMMAND_CLASS_WAKE_UP,
        instance: 1,
        index: 0,
    };
    assert!(driver.enable_poll(value));
    assert!(driver.enable_poll(value));
    assert!(driver.is_polled(value));
    assert!(driver.disable_poll(value));
    assert!(!driver.disable_poll(value));
    assert!(!driver.is_polled(value));

    driver.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn nak_three_times_drops_the_message() {
    let profiles = BTreeMap::new();
    let (driver, _notifications, mut mock) = start_driver(scratch_options());
    mock.serve_init(&profiles).await;

    let msg = Message::request("Probe", CONTROLLER_NODE_ID, FUNC_ID_ZW_GET_VERSION);
    driver.send_msg(msg, SendQueue::Send);

    // Three transmissions, each answered with a NAK; the fourth intent to
    // send drops the message instead.
    for attempt in 1..=3 {
        let body = mock.read_request().await;
        assert_eq!(body[1], FUNC_ID_ZW_GET_VERSION, "attempt {attempt}");
        mock.nak().await;
    }

    within("the message to be dropped", async {
        loop {
            let stats = driver.statistics();
            if stats.dropped == 1 {
                assert_eq!(stats.nak_count, 3);
                assert!(stats.writes >= 9); // six init frames + three attempts
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn corrupt_frame_is_nakked_and_dropped() {
    let profiles = BTreeMap::new();
    let (driver, _notifications, mut mock) = start_driver(scratch_options());
    mock.serve_init(&profiles).await;

    // A GET_VERSION response with a flipped checksum.
    mock.write_raw(&[SOF, 0x04, RESPONSE, FUNC_ID_ZW_GET_VERSION, 0x01, 0x00])
        .await;

    assert_eq!(mock.read_byte().await, NAK);

    within("the bad checksum to be counted", async {
        loop {
            if driver.statistics().bad_checksums == 1 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sleeping_node_diverts_and_replays_in_order() {
    let mut profiles = BTreeMap::new();
    profiles.insert(7, Profile::battery_sensor());

    let (driver, mut notifications, mut mock) = start_driver(scratch_options());
    mock.serve_init(&profiles).await;
    for _ in 0..3 {
        mock.serve(&profiles).await;
    }
    drain_notifications(&mut notifications, NotificationKind::AllNodesQueried).await;

    // Send A; once it is on the wire, queue B and C behind the open
    // transaction.
    let set = |label: &str, value: u8| {
        Message::send_data(label, 7, &[COMMAND_CLASS_BASIC, BASIC_SET, value])
    };
    driver.send_msg(set("set A", 0x01), SendQueue::Send);

    let body = mock.read_request().await;
    assert_eq!(body[1], FUNC_ID_ZW_SEND_DATA);
    let callback_id = body[body.len() - 1];
    mock.ack().await;

    driver.send_msg(set("set B", 0x02), SendQueue::Send);
    driver.send_msg(set("set C", 0x03), SendQueue::Send);

    // The device does not answer: NO_ACK. Everything for node 7 must move
    // to its wake-up queue.
    mock.respond(FUNC_ID_ZW_SEND_DATA, &[0x01]).await;
    mock.request(FUNC_ID_ZW_SEND_DATA, &[callback_id, TRANSMIT_COMPLETE_NO_ACK])
        .await;

    within("the node to fall asleep", async {
        loop {
            let summary = driver.node_summary(7).unwrap();
            if !summary.awake && summary.pending_wake_up_messages == 3 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;

    // Messages queued while asleep go straight to the wake-up queue.
    driver.send_msg(set("set D", 0x04), SendQueue::Send);
    within("the new message to be parked", async {
        loop {
            if driver.node_summary(7).unwrap().pending_wake_up_messages == 4 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;

    // The node wakes: deferred messages replay in original order, then the
    // no-more-information command lets it sleep again.
    mock.request(
        FUNC_ID_APPLICATION_COMMAND_HANDLER,
        &[0x00, 7, 2, COMMAND_CLASS_WAKE_UP, WAKE_UP_NOTIFICATION],
    )
    .await;

    for expected_value in [0x01, 0x02, 0x03, 0x04] {
        let body = mock.read_request().await;
        assert_eq!(body[1], FUNC_ID_ZW_SEND_DATA);
        assert_eq!(
            &body[4..7],
            &[COMMAND_CLASS_BASIC, BASIC_SET, expected_value]
        );
        let callback_id = body[body.len() - 1];
        mock.ack().await;
        mock.respond(FUNC_ID_ZW_SEND_DATA, &[0x01]).await;
        mock.request(FUNC_ID_ZW_SEND_DATA, &[callback_id, TRANSMIT_COMPLETE_OK])
            .await;
    }

    let body = mock.read_request().await;
    assert_eq!(body[1], FUNC_ID_ZW_SEND_DATA);
    assert_eq!(
        &body[4..6],
        &[COMMAND_CLASS_WAKE_UP, WAKE_UP_NO_MORE_INFORMATION]
    );

    driver.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn add_device_walks_the_inclusion_states() {
    let mut profiles = BTreeMap::new();
    profiles.insert(1, Profile::controller());

    let (driver, mut notifications, mut mock) = start_driver(scratch_options());
    mock.serve_init(&profiles).await;
    for _ in 0..2 {
        mock.serve(&profiles).await;
    }
    drain_notifications(&mut notifications, NotificationKind::AllNodesQueried).await;

    let (state_tx, mut state_rx) = tokio::sync::mpsc::unbounded_channel();
    let callback: zwave_driver::ControllerCallback =
        std::sync::Arc::new(move |state: ControllerState| {
            let _ = state_tx.send(state);
        });

    driver
        .begin_controller_command(ControllerCommand::AddDevice, Some(callback), false, 0, 0)
        .expect("no command should be active");

    // Exactly one command at a time.
    assert!(matches!(
        driver.begin_controller_command(ControllerCommand::RemoveDevice, None, false, 0, 0),
        Err(zwave_driver::ControllerError::Busy)
    ));

    let body = mock.read_request().await;
    assert_eq!(body[1], FUNC_ID_ZW_ADD_NODE_TO_NETWORK);
    assert_eq!(body[2], ADD_NODE_SLAVE); // low power
    let callback_id = body[3];
    mock.ack().await;

    let progress = |status: u8, node: u8| [callback_id, status, node, 0];
    mock.request(
        FUNC_ID_ZW_ADD_NODE_TO_NETWORK,
        &progress(ADD_NODE_STATUS_LEARN_READY, 0),
    )
    .await;
    mock.request(
        FUNC_ID_ZW_ADD_NODE_TO_NETWORK,
        &progress(ADD_NODE_STATUS_NODE_FOUND, 0),
    )
    .await;
    mock.request(
        FUNC_ID_ZW_ADD_NODE_TO_NETWORK,
        &progress(ADD_NODE_STATUS_ADDING_SLAVE, 9),
    )
    .await;
    mock.request(
        FUNC_ID_ZW_ADD_NODE_TO_NETWORK,
        &progress(ADD_NODE_STATUS_PROTOCOL_DONE, 9),
    )
    .await;

    // Protocol done makes the driver leave add mode.
    let body = mock.read_request().await;
    assert_eq!(body[1], FUNC_ID_ZW_ADD_NODE_TO_NETWORK);
    assert_eq!(body[2], ADD_NODE_STOP);
    let stop_callback_id = body[3];
    mock.ack().await;
    mock.request(
        FUNC_ID_ZW_ADD_NODE_TO_NETWORK,
        &[stop_callback_id, ADD_NODE_STATUS_DONE, 9, 0],
    )
    .await;

    let mut states = Vec::new();
    while states.last() != Some(&ControllerState::Completed) {
        states.push(
            within("a controller state", state_rx.recv())
                .await
                .expect("callback channel closed"),
        );
    }
    assert_eq!(
        states,
        vec![
            ControllerState::Waiting,
            ControllerState::InProgress,
            ControllerState::Completed,
        ]
    );

    // The new node exists and is being interrogated from the top.
    within("node 9 to appear", async {
        loop {
            if let Some(summary) = driver.node_summary(9) {
                assert_eq!(summary.query_stage.name(), "ProtocolInfo");
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;

    // A fresh command is accepted once the previous one completed.
    assert!(driver
        .begin_controller_command(ControllerCommand::HasNodeFailed, None, false, 9, 0)
        .is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transactions_notify_when_enabled() {
    let profiles = BTreeMap::new();
    let (driver, mut notifications, mut mock) =
        start_driver(scratch_options().notify_transactions(true));
    mock.serve_init(&profiles).await;

    // Every init exchange before the init-data reply is a completed
    // transaction (the init-data transaction itself completes just after
    // AllNodesQueried is queued).
    let kinds = drain_notifications(&mut notifications, NotificationKind::AllNodesQueried).await;
    let completions = kinds
        .iter()
        .filter(|kind| **kind == NotificationKind::MsgComplete)
        .count();
    assert!(completions >= 5, "saw {completions} MsgComplete notifications");

    driver.shutdown().await;
}
