use std::cell::{Cell, RefCell};
use std::path::Path;
use std::time::Duration;

use autopipette_compiler::CompilerError;
use autopipette_control::{
    Bridge, DispatchError, Dispatcher, MachineConfig, Reply, Submission, EMERGENCY_STOP,
    PRINT_START,
};
use autopipette_transport::{BridgeEvent, TransportError, UploadError};
use serde_json::{json, Value};

const DECK: &str = r#"
[volume]
max_vol = 50

[triggers]
light = "led_pin"

[[location]]
name = "tips"
x = 100
y = 20
z = 40
[location.plate]
type = "tipbox"
rows = 8
cols = 12
spacing_row = 9
spacing_col = 9
dip_top = 55

[[location]]
name = "waste"
x = 10
y = 10
z = 30
[location.plate]
type = "waste_container"
dip_top = 30

[[location]]
name = "wellA"
x = 50
y = 50
z = 10

[[location]]
name = "wellB"
x = 60
y = 50
z = 10
"#;

#[derive(Default)]
struct MockBridge {
    offline: Cell<bool>,
    uploads: RefCell<Vec<(String, String)>>,
    requests: RefCell<Vec<(String, Value)>>,
    notifications: RefCell<Vec<(String, Value)>>,
    events: RefCell<Vec<BridgeEvent>>,
}

impl MockBridge {
    fn upload_count(&self) -> usize {
        self.uploads.borrow().len()
    }

    fn last_upload(&self) -> String {
        self.uploads
            .borrow()
            .last()
            .map(|(_, text)| text.clone())
            .expect("an upload should have happened")
    }
}

impl Bridge for MockBridge {
    fn is_connected(&self) -> bool {
        !self.offline.get()
    }

    fn request(&self, method: &str, params: Value, _: Duration) -> Result<Value, TransportError> {
        if self.offline.get() {
            return Err(TransportError::NotConnected);
        }
        self.requests
            .borrow_mut()
            .push((method.to_string(), params.clone()));
        Ok(json!({"echo": params}))
    }

    fn notify(&self, method: &str, params: Value) -> Result<(), TransportError> {
        self.notifications
            .borrow_mut()
            .push((method.to_string(), params));
        Ok(())
    }

    fn upload(&self, name: &str, bytes: Vec<u8>, _: Duration) -> Result<String, UploadError> {
        let text = String::from_utf8(bytes).expect("gcode should be utf8");
        self.uploads.borrow_mut().push((name.to_string(), text));
        Ok(format!("gcodes/{name}"))
    }

    fn drain_events(&self) -> Vec<BridgeEvent> {
        std::mem::take(&mut *self.events.borrow_mut())
    }
}

fn dispatcher<'a>(bridge: &'a MockBridge, dir: &Path, deck: &str) -> Dispatcher<&'a MockBridge> {
    let config = MachineConfig::parse(deck, "test deck").expect("deck should parse");
    Dispatcher::new(config, Some(bridge), dir.join("jobs")).expect("dispatcher should build")
}

#[test]
fn motion_before_homing_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let bridge = MockBridge::default();
    let mut d = dispatcher(&bridge, dir.path(), DECK);

    let err = d.dispatch("move 1 2 3").expect_err("not homed");
    assert!(matches!(err, DispatchError::NotHomed));
    let err = d.dispatch("pipette 10 wellA wellB").expect_err("not homed");
    assert!(matches!(err, DispatchError::NotHomed));
    assert_eq!(bridge.upload_count(), 0);
}

#[test]
fn home_uploads_and_starts_a_job() {
    let dir = tempfile::tempdir().expect("tempdir");
    let bridge = MockBridge::default();
    let mut d = dispatcher(&bridge, dir.path(), DECK);

    let reply = d.dispatch("home").expect("home");
    let Reply::Job(Submission::Started { job, server_path, .. }) = reply else {
        panic!("expected a started job");
    };
    assert_eq!(server_path, format!("gcodes/{job}.gcode"));
    assert!(dir.path().join("jobs").join(format!("{job}.gcode")).exists());

    let text = bridge.last_upload();
    assert!(text.starts_with("G28 Z\nG28 X Y\n"));
    assert_eq!(
        bridge.requests.borrow()[0],
        (PRINT_START.to_string(), json!({"filename": server_path}))
    );
    assert!(d.compiler().state().homed);
}

#[test]
fn transfer_is_one_job_with_one_pair() {
    let dir = tempfile::tempdir().expect("tempdir");
    let bridge = MockBridge::default();
    let mut d = dispatcher(&bridge, dir.path(), DECK);
    d.dispatch("home").expect("home");

    d.dispatch("pipette 10 wellA wellB").expect("pipette");
    assert_eq!(bridge.upload_count(), 2);
    let text = bridge.last_upload();
    assert_eq!(text.matches("; aspirate 10 uL from wellA").count(), 1);
    assert_eq!(text.matches("; dispense 10 uL to wellB").count(), 1);
    assert_eq!(text.matches("; eject tip").count(), 1);
    assert!(!d.compiler().state().has_tip);
}

#[test]
fn missing_waste_blocks_transfers_unless_tip_is_kept() {
    let deck = DECK.replace("type = \"waste_container\"", "type = \"singleton\"");
    let dir = tempfile::tempdir().expect("tempdir");
    let bridge = MockBridge::default();
    let mut d = dispatcher(&bridge, dir.path(), &deck);
    d.dispatch("home").expect("home");

    let err = d.dispatch("pipette 10 wellA wellB").expect_err("no waste");
    assert!(matches!(
        err,
        DispatchError::Compiler(CompilerError::NoWasteContainer)
    ));
    let err = d.dispatch("eject_tip").expect_err("no waste");
    assert!(matches!(
        err,
        DispatchError::Compiler(CompilerError::NoWasteContainer)
    ));

    d.dispatch("pipette 10 wellA wellB --keep_tip")
        .expect("kept tip needs no waste");
    assert!(d.compiler().state().has_tip);
}

#[test]
fn failed_hand_off_is_kept_and_retried() {
    let dir = tempfile::tempdir().expect("tempdir");
    let bridge = MockBridge::default();
    let mut d = dispatcher(&bridge, dir.path(), DECK);
    d.dispatch("home").expect("home");

    bridge.offline.set(true);
    let err = d.dispatch("move 5 5 5").expect_err("bridge offline");
    assert!(matches!(err, DispatchError::Handoff { .. }));
    let pending = d.jobs().pending().expect("job kept").name.clone();

    let Reply::List(state) = d.dispatch("ls state").expect("ls state") else {
        panic!("expected a list");
    };
    assert!(state.contains(&format!("pending_job: {pending}")));

    bridge.offline.set(false);
    let reply = d.dispatch("retry").expect("retry");
    assert!(matches!(reply, Reply::Job(Submission::Started { ref job, .. }) if *job == pending));
    assert!(bridge.last_upload().contains("G1 X5 Y5 F10000"));
    assert!(matches!(
        d.dispatch("retry"),
        Err(DispatchError::NothingToRetry)
    ));
}

#[test]
fn protocol_runs_as_one_job_with_header() {
    let dir = tempfile::tempdir().expect("tempdir");
    let bridge = MockBridge::default();
    let mut d = dispatcher(&bridge, dir.path(), DECK);

    let protocol = dir.path().join("transfer.txt");
    std::fs::write(
        &protocol,
        "# simple transfer\nhome\n\npipette 10 wellA wellB\nprint done\n",
    )
    .expect("write protocol");

    let reply = d
        .dispatch(&format!("run {}", protocol.display()))
        .expect("protocol runs");
    let Reply::Protocol(report) = reply else {
        panic!("expected a protocol report");
    };
    assert_eq!(report.name, "transfer");
    assert_eq!(report.commands, 3);
    assert!(matches!(
        report.submission,
        Some(Submission::Started { ref job, .. }) if job == "transfer"
    ));

    assert_eq!(bridge.upload_count(), 1);
    let text = bridge.last_upload();
    assert!(text.starts_with("; AutoPipette settings loaded from defaults\n"));
    assert!(text.contains("; aspirate 10 uL from wellA"));
    assert!(text.ends_with("M117 done\n"));
    assert!(!d.jobs().is_collecting());
}

#[test]
fn failing_protocol_line_transmits_nothing_and_rolls_back() {
    let dir = tempfile::tempdir().expect("tempdir");
    let bridge = MockBridge::default();
    let mut d = dispatcher(&bridge, dir.path(), DECK);

    let protocol = dir.path().join("broken.txt");
    std::fs::write(&protocol, "home\npipette 10 wellA wellB\nmove_loc nowhere\n")
        .expect("write protocol");

    let err = d
        .dispatch(&format!("run {}", protocol.display()))
        .expect_err("line 3 fails");
    match &err {
        DispatchError::Protocol { line, source } => {
            assert_eq!(*line, 3);
            assert!(matches!(
                **source,
                DispatchError::Compiler(CompilerError::NotALocation(_))
            ));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(bridge.upload_count(), 0);
    assert!(!d.jobs().is_collecting());
    assert!(!d.compiler().state().homed, "compiler state should roll back");
}

#[test]
fn nested_protocols_share_one_job() {
    let dir = tempfile::tempdir().expect("tempdir");
    let bridge = MockBridge::default();
    let mut d = dispatcher(&bridge, dir.path(), DECK);

    let inner = dir.path().join("inner.txt");
    std::fs::write(&inner, "print inner\n").expect("write inner");
    let outer = dir.path().join("outer.txt");
    std::fs::write(&outer, format!("home\nrun {}\nprint outer\n", inner.display()))
        .expect("write outer");

    d.dispatch(&format!("run {}", outer.display()))
        .expect("protocol runs");
    assert_eq!(bridge.upload_count(), 1);
    let text = bridge.last_upload();
    assert!(text.contains("M117 inner\nM117 outer\n"));
}

#[test]
fn compile_protocol_sends_nothing() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = MachineConfig::parse(DECK, "test deck").expect("deck");
    let mut d: Dispatcher<MockBridge> =
        Dispatcher::new(config, None, dir.path().join("jobs")).expect("offline dispatcher");

    let protocol = dir.path().join("plan.txt");
    std::fs::write(&protocol, "home\npipette 120 wellA wellB\n").expect("write protocol");

    let job = d.compile_protocol(&protocol).expect("compile");
    assert_eq!(job.name, "plan");
    let text = job.text();
    assert!(text.starts_with("; AutoPipette settings loaded from defaults\n"));
    assert_eq!(text.matches("; aspirate").count(), 3);
    assert!(!dir.path().join("jobs").exists());
}

#[test]
fn bridge_commands_need_a_bridge() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = MachineConfig::parse(DECK, "test deck").expect("deck");
    let mut d: Dispatcher<MockBridge> =
        Dispatcher::new(config, None, dir.path()).expect("offline dispatcher");

    for line in ["stop", "send server.info", "messages", "notify x"] {
        let err = d.dispatch(line).expect_err("offline");
        assert!(matches!(err, DispatchError::Offline(_)), "{line}: {err}");
    }
}

#[test]
fn raw_requests_and_control_commands() {
    let dir = tempfile::tempdir().expect("tempdir");
    let bridge = MockBridge::default();
    let mut d = dispatcher(&bridge, dir.path(), DECK);

    let reply = d
        .dispatch(r#"send printer.gcode.script '{"script": "G28"}'"#)
        .expect("send");
    assert_eq!(reply, Reply::Json(json!({"echo": {"script": "G28"}})));

    d.dispatch("stop").expect("stop");
    assert_eq!(
        bridge.requests.borrow().last().map(|(m, _)| m.clone()),
        Some(EMERGENCY_STOP.to_string())
    );

    d.dispatch("notify client.ping '[1]'").expect("notify");
    assert_eq!(
        bridge.notifications.borrow()[0],
        ("client.ping".to_string(), json!([1]))
    );

    let err = d.dispatch("send x '{broken'").expect_err("bad json");
    assert!(matches!(err, DispatchError::Json(_)));
}

#[test]
fn messages_drain_bridge_events() {
    let dir = tempfile::tempdir().expect("tempdir");
    let bridge = MockBridge::default();
    bridge.events.borrow_mut().push(BridgeEvent::Notification {
        method: "notify_klippy_ready".to_string(),
        params: Value::Null,
    });
    let mut d = dispatcher(&bridge, dir.path(), DECK);

    let Reply::List(items) = d.dispatch("messages").expect("messages") else {
        panic!("expected a list");
    };
    assert_eq!(items.len(), 1);
    assert!(items[0].starts_with("notify_klippy_ready"));
    assert_eq!(d.dispatch("messages").expect("messages"), Reply::List(Vec::new()));
}

#[test]
fn deck_commands_register_locations_and_plates() {
    let dir = tempfile::tempdir().expect("tempdir");
    let bridge = MockBridge::default();
    let mut d = dispatcher(&bridge, dir.path(), DECK);

    d.dispatch("coor reservoir 200 30 5").expect("coor");
    d.dispatch("plate reservoir singleton --dip_top 30 --dip_btm 60 --diameter 20 --strategy cylinder")
        .expect("plate");
    let Reply::List(plates) = d.dispatch("ls plates").expect("ls") else {
        panic!("expected a list");
    };
    assert!(plates.contains(&"reservoir".to_string()));

    let err = d.dispatch("plate nowhere array").expect_err("unknown location");
    assert!(matches!(
        err,
        DispatchError::Compiler(CompilerError::NotALocation(_))
    ));

    d.dispatch("tipbox tips").expect("pin tipbox");
    assert_eq!(d.compiler().active_tipbox(), Some("tips"));
    d.dispatch("tipbox").expect("unpin");
    assert_eq!(d.compiler().active_tipbox(), None);
}

#[test]
fn settings_and_triggers() {
    let dir = tempfile::tempdir().expect("tempdir");
    let bridge = MockBridge::default();
    let mut d = dispatcher(&bridge, dir.path(), DECK);

    d.dispatch("set speed_factor 50").expect("set");
    assert!(bridge.last_upload().contains("M220 S50"));
    assert_eq!(
        d.dispatch("set max_vol 20").expect("set"),
        Reply::Message("set max_vol = 20".to_string())
    );
    assert_eq!(d.compiler().params().max_vol, 20.0);

    d.dispatch("trigger light on").expect("trigger");
    assert!(bridge.last_upload().contains("SET_PIN PIN=led_pin VALUE=1"));
    let err = d.dispatch("trigger laser on").expect_err("unknown channel");
    assert!(matches!(err, DispatchError::Compiler(CompilerError::Validation(_))));
}

#[test]
fn profile_switch_reloads_configuration() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(
        dir.path().join("machine.toml"),
        format!("{DECK}\n[profiles]\nsmall = \"small.toml\"\n"),
    )
    .expect("write machine");
    std::fs::write(dir.path().join("small.toml"), "[volume]\nmax_vol = 10\n").expect("write small");

    let bridge = MockBridge::default();
    let config = MachineConfig::load(dir.path().join("machine.toml")).expect("load");
    let mut d = Dispatcher::new(config, Some(&bridge), dir.path().join("jobs")).expect("build");
    d.dispatch("home").expect("home");

    d.dispatch("profile small").expect("profile");
    assert_eq!(d.compiler().params().max_vol, 10.0);
    assert!(!d.compiler().state().homed);
    assert!(d.compiler().location("tips").is_none());

    let err = d.dispatch("profile huge").expect_err("unknown profile");
    assert!(matches!(err, DispatchError::Config(_)));
}

#[test]
fn unknown_commands_and_usage_errors() {
    let dir = tempfile::tempdir().expect("tempdir");
    let bridge = MockBridge::default();
    let mut d = dispatcher(&bridge, dir.path(), DECK);

    assert!(matches!(
        d.dispatch("teleport wellA"),
        Err(DispatchError::UnknownCommand(_))
    ));
    assert!(matches!(d.dispatch("move 1 2"), Err(DispatchError::Usage(_))));
    assert_eq!(d.dispatch("").expect("blank"), Reply::Done);
}
