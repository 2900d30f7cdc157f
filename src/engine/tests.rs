use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::*;
use crate::device::mock::MockPorts;
use crate::midi::encode_sysex;
use crate::protocol::{format_precision, Outbound, SCENE_HASH, VALUE_PRECISION};
use crate::state::{Field, Origin, OUTPUT_COUNT};

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

fn key(scene: u8, output: u8, field: Field) -> FieldKey {
    FieldKey {
        scene,
        output,
        field,
    }
}

fn updates(outbox: &[Outbound]) -> Vec<Outbound> {
    outbox
        .iter()
        .filter(|m| matches!(m, Outbound::Update { .. }))
        .cloned()
        .collect()
}

/// Core that is connected with its initial scene query already drained
fn connected_core(t0: Instant) -> SyncCore {
    let mut core = SyncCore::new(SyncTiming::default()).unwrap();
    core.on_connected(t0);
    assert_eq!(core.drain_outbox(), vec![Outbound::SceneQuery]);
    core
}

fn record_events(core: &mut SyncCore) -> Arc<Mutex<Vec<StateEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    core.subscribe_state(Arc::new(move |event: &StateEvent| sink.lock().push(*event)));
    events
}

// =============================================================================
// SyncCore scenarios
// =============================================================================

#[test]
fn test_burst_of_edits_sends_once() {
    let t0 = Instant::now();
    let mut core = connected_core(t0);
    let k = key(0, 1, Field::ClockTempo);

    for (i, value) in [121.0, 125.0, 130.0, 140.0, 150.0].into_iter().enumerate() {
        core.set_field(k, value, t0 + ms(10 * i as u64)).unwrap();
    }

    // Last edit at 40ms restarts the window
    core.poll(t0 + ms(339));
    assert!(updates(&core.drain_outbox()).is_empty());

    core.poll(t0 + ms(340));
    assert_eq!(
        updates(&core.drain_outbox()),
        vec![Outbound::Update {
            scene: 0,
            output: 1,
            hash: Field::ClockTempo.hash(),
            value: 150.0,
        }]
    );

    // Acknowledged: nothing further goes out
    core.handle_payload(&format!("0_1_{}_150.0", Field::ClockTempo.hash()), t0 + ms(360));
    core.poll(t0 + ms(2000));
    assert!(updates(&core.drain_outbox()).is_empty());
    assert_eq!(core.stats().acknowledged, 1);
}

#[test]
fn test_unacknowledged_update_retries_three_times() {
    let t0 = Instant::now();
    let mut core = connected_core(t0);
    core.set_field(key(2, 3, Field::Attack), 0.25, t0).unwrap();

    let mut sent = Vec::new();
    for step in 0..20 {
        core.poll(t0 + ms(300 + 100 * step));
        sent.extend(updates(&core.drain_outbox()));
    }

    let expected = Outbound::Update {
        scene: 2,
        output: 3,
        hash: Field::Attack.hash(),
        value: 0.25,
    };
    assert_eq!(sent, vec![expected.clone(), expected.clone(), expected]);
    assert_eq!(core.stats().abandoned, 2); // the update and the unanswered scene query
    assert_eq!(core.next_deadline(), None);
}

#[test]
fn test_inbound_scene_select_resyncs_scene() {
    let t0 = Instant::now();
    let mut core = connected_core(t0);
    let events = record_events(&mut core);

    core.handle_payload(&format!("0_0_{}_3", SCENE_HASH), t0);
    assert_eq!(core.store().active_scene(), 3);
    assert_eq!(
        events.lock()[0],
        StateEvent::SceneSelected {
            scene: 3,
            origin: Origin::Device
        }
    );

    // The device answers every query; only one is ever outstanding
    let mut queried = std::collections::HashSet::new();
    let mut now = t0;
    loop {
        let outbox = core.drain_outbox();
        if outbox.is_empty() {
            break;
        }
        assert_eq!(outbox.len(), 1);
        let Outbound::Query { scene, output, hash } = outbox[0] else {
            panic!("expected a query, got {:?}", outbox[0]);
        };
        assert_eq!(scene, 3);
        assert!(queried.insert((output, hash)));

        now += ms(5);
        let value = if hash == Field::Probability.hash() { 42.0 } else { 0.0 };
        core.handle_payload(&format!("{}_{}_{}_{}", scene, output, hash, value), now);
    }

    assert_eq!(queried.len(), OUTPUT_COUNT * Field::ALL.len());
    assert_eq!(core.queued(), 0);
    assert_eq!(core.store().get(key(3, 6, Field::Probability)), Some(42.0));

    // Device-sourced values never go back out
    assert_eq!(core.debouncing(), 0);
    core.poll(now + ms(1000));
    assert!(updates(&core.drain_outbox()).is_empty());

    // Once per connection
    core.handle_payload(&format!("0_0_{}_3", SCENE_HASH), now);
    assert!(core.drain_outbox().is_empty());
}

#[test]
fn test_unknown_hash_leaves_state_unchanged() {
    let t0 = Instant::now();
    let mut core = connected_core(t0);
    let events = record_events(&mut core);
    let before = core.store().output(1, 1).cloned();

    core.handle_payload("1_1_12345_3.0", t0);
    core.handle_payload(&format!("9_1_{}_3.0", Field::Mode.hash()), t0);
    core.handle_payload(&format!("1_x_{}_3.0", Field::Mode.hash()), t0);
    core.handle_payload("spark_11_0.5", t0);

    assert_eq!(core.store().output(1, 1).cloned(), before);
    assert!(events.lock().is_empty());
    assert!(core.drain_outbox().is_empty());
}

#[test]
fn test_inbound_change_is_not_echoed() {
    let t0 = Instant::now();
    let mut core = connected_core(t0);
    let events = record_events(&mut core);

    core.handle_payload(&format!("0 2 {} 90", Field::ClockTempo.hash()), t0);
    assert_eq!(core.store().get(key(0, 2, Field::ClockTempo)), Some(90.0));

    let recorded = events.lock().clone();
    assert_eq!(recorded.len(), 1);
    let StateEvent::Field(change) = recorded[0] else {
        panic!("expected a field change");
    };
    assert_eq!(change.origin, Origin::Device);
    assert_eq!(change.old, 120.0);

    assert_eq!(core.debouncing(), 0);
    assert_eq!(core.queued(), 0);
    core.poll(t0 + ms(1000));
    assert!(updates(&core.drain_outbox()).is_empty());
}

#[test]
fn test_scene_select_supersedes_previous() {
    let t0 = Instant::now();
    let mut core = connected_core(t0);

    core.select_scene(1, t0).unwrap();
    core.select_scene(2, t0 + ms(10)).unwrap();
    let outbox = core.drain_outbox();
    assert_eq!(outbox[0], Outbound::SceneSelect { scene: 1 });
    assert!(outbox.contains(&Outbound::SceneSelect { scene: 2 }));
    assert_eq!(
        core.scene_slot.current().map(|d| d.message.clone()),
        Some(Outbound::SceneSelect { scene: 2 })
    );

    core.handle_payload(&format!("0_0_{}_2", SCENE_HASH), t0 + ms(20));
    assert!(!core.scene_slot.is_busy());
    assert_eq!(core.store().active_scene(), 2);

    // Field-class work stays one at a time while scenes are switched
    let in_flight = core.drain_outbox();
    assert!(in_flight.len() <= 1);
    assert!(core.field_slot.is_busy());
}

#[test]
fn test_late_reply_to_superseded_scene_is_ignored() {
    let t0 = Instant::now();
    let mut core = connected_core(t0);
    let events = record_events(&mut core);

    core.select_scene(1, t0).unwrap();
    core.select_scene(2, t0 + ms(10)).unwrap();
    core.drain_outbox();
    events.lock().clear();

    // Device confirms the first select after the second went out
    core.handle_payload(&format!("0_0_{}_1", SCENE_HASH), t0 + ms(20));
    assert_eq!(
        core.scene_slot.current().map(|d| d.message.clone()),
        Some(Outbound::SceneSelect { scene: 2 })
    );
    assert_eq!(core.store().active_scene(), 2);
    assert!(events.lock().is_empty());

    // Still unconfirmed, so scene 2 goes out again
    core.poll(t0 + ms(210));
    assert!(core
        .drain_outbox()
        .contains(&Outbound::SceneSelect { scene: 2 }));

    core.handle_payload(&format!("0_0_{}_2", SCENE_HASH), t0 + ms(230));
    assert!(!core.scene_slot.is_busy());
    assert_eq!(core.store().active_scene(), 2);
}

#[test]
fn test_local_edits_wait_for_connection() {
    let t0 = Instant::now();
    let mut core = SyncCore::new(SyncTiming::default()).unwrap();

    core.set_field(key(0, 0, Field::Decay), 0.5, t0).unwrap();
    core.select_scene(4, t0).unwrap();
    core.poll(t0 + ms(400));
    assert!(core.drain_outbox().is_empty());
    assert_eq!(core.queued(), 1);
    assert_eq!(core.store().active_scene(), 4);

    core.on_connected(t0 + ms(500));
    let outbox = core.drain_outbox();
    assert_eq!(outbox[0], Outbound::SceneQuery);
    assert_eq!(
        updates(&outbox),
        vec![Outbound::Update {
            scene: 0,
            output: 0,
            hash: Field::Decay.hash(),
            value: 0.5,
        }]
    );
}

#[test]
fn test_disconnect_cancels_waits() {
    let t0 = Instant::now();
    let mut core = connected_core(t0);
    core.set_field(key(0, 0, Field::Decay), 0.5, t0).unwrap();
    core.poll(t0 + ms(300));
    assert!(core.field_slot.is_busy());

    core.on_disconnected();
    assert!(!core.field_slot.is_busy());
    assert!(!core.scene_slot.is_busy());
    core.drain_outbox();
    core.poll(t0 + ms(5000));
    assert!(core.drain_outbox().is_empty());
}

#[test]
fn test_mode_change_sends_dependent_fields() {
    let t0 = Instant::now();
    let mut core = connected_core(t0);

    let changes = core.set_field(key(1, 0, Field::Mode), 4.0, t0).unwrap();
    assert_eq!(changes.len(), 2);
    assert_eq!(core.debouncing(), 2);

    core.poll(t0 + ms(300));
    let first = updates(&core.drain_outbox());
    assert_eq!(first.len(), 1);
    assert_eq!(core.queued(), 1);
}

#[test]
fn test_telemetry_reaches_hook() {
    let t0 = Instant::now();
    let mut core = connected_core(t0);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    core.subscribe_telemetry(Arc::new(move |index: usize, samples: &[f64]| {
        sink.lock().push((index, samples.to_vec()));
    }));

    core.handle_payload("spark_2_0.5", t0);
    core.handle_payload("spark_2_0.75", t0);
    core.handle_payload("spark_2_oops", t0);

    let seen = seen.lock();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[1], (2, vec![0.5, 0.75]));
}

#[test]
fn test_reset_is_fire_and_forget() {
    let t0 = Instant::now();
    let mut core = connected_core(t0);
    core.reset_device();
    assert_eq!(core.drain_outbox(), vec![Outbound::DiskMode]);
    assert_eq!(core.next_deadline(), Some(t0 + ms(200)));
}

// =============================================================================
// Runner with mock ports
// =============================================================================

const DEVICE: &str = "yoctocore MIDI 1";

fn payloads(ports: &MockPorts) -> Vec<String> {
    ports
        .take_sent()
        .into_iter()
        .filter_map(|(_, bytes)| crate::midi::decode_sysex(&bytes))
        .collect()
}

fn start(
    ports: &MockPorts,
    settings: EngineSettings,
) -> (
    tokio::task::JoinHandle<Result<()>>,
    EngineHandle,
    Arc<Mutex<Vec<ConnectionStatus>>>,
) {
    let (engine, handle) = SyncEngine::new(ports.clone(), settings).unwrap();
    let statuses = Arc::new(Mutex::new(Vec::new()));
    let sink = statuses.clone();
    handle.on_status(Arc::new(move |status: &ConnectionStatus| {
        sink.lock().push(status.clone())
    }));
    (tokio::spawn(engine.run()), handle, statuses)
}

#[tokio::test(start_paused = true)]
async fn test_connect_sends_scene_query() {
    let ports = MockPorts::new(&[DEVICE], &[DEVICE]);
    let (task, handle, statuses) = start(&ports, EngineSettings::default());

    tokio::time::sleep(ms(10)).await;
    assert!(handle.is_connected());
    assert_eq!(payloads(&ports), vec![format!("0_0_{}", SCENE_HASH)]);
    assert_eq!(
        statuses.lock().clone(),
        vec![ConnectionStatus::Connected {
            port: DEVICE.to_string()
        }]
    );

    handle.shutdown();
    task.await.unwrap().unwrap();
    assert!(!handle.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_handle_edit_is_debounced_and_sent() {
    let ports = MockPorts::new(&[DEVICE], &[DEVICE]);
    let (task, handle, _) = start(&ports, EngineSettings::default());
    tokio::time::sleep(ms(10)).await;
    ports.take_sent();

    let k = key(0, 5, Field::MaxVoltage);
    for value in [7.0, 8.0, 12.0] {
        handle.set_field(k, value).await.unwrap();
    }
    tokio::time::sleep(ms(250)).await;
    assert!(payloads(&ports).iter().all(|p| !p.ends_with("_10.00")));

    tokio::time::sleep(ms(100)).await;
    let expected = format!(
        "0_5_{}_{}",
        Field::MaxVoltage.hash(),
        format_precision(10.0, VALUE_PRECISION)
    );
    assert!(payloads(&ports).contains(&expected));

    let output = handle.get_output(0, 5).await.unwrap();
    assert_eq!(output.get(Field::MaxVoltage), 10.0);
    assert!(handle.set_field(k, f64::INFINITY).await.is_err());

    handle.shutdown();
    task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_probe_after_short_silence() {
    let ports = MockPorts::new(&[DEVICE], &[DEVICE]);
    let (task, handle, _) = start(&ports, EngineSettings::default());

    tokio::time::sleep(ms(2100)).await;
    ports.inject(DEVICE, &encode_sysex("v1.0.0"));
    ports.take_sent();

    tokio::time::sleep(ms(800)).await;
    assert!(payloads(&ports).contains(&"version0".to_string()));
    assert!(handle.is_connected());

    handle.shutdown();
    task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_silence_disconnects_and_rediscovers() {
    let ports = MockPorts::new(&[DEVICE], &[DEVICE]);
    let (task, handle, statuses) = start(&ports, EngineSettings::default());

    tokio::time::sleep(ms(100)).await;
    assert!(handle.is_connected());
    ports.set_ports(&[], &[]);

    tokio::time::sleep(ms(2400)).await;
    assert!(!handle.is_connected());

    // Device comes back; picked up by the periodic rediscovery
    ports.set_ports(&[DEVICE], &[DEVICE]);
    tokio::time::sleep(ms(1500)).await;
    assert!(handle.is_connected());

    let connected = ConnectionStatus::Connected {
        port: DEVICE.to_string(),
    };
    assert_eq!(
        statuses.lock().clone(),
        vec![
            connected.clone(),
            ConnectionStatus::Disconnected,
            connected
        ]
    );

    handle.shutdown();
    task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_aux_toggle_survives_rescans_without_device() {
    let ports = MockPorts::new(&["Pads"], &[]);
    let (task, handle, statuses) = start(&ports, EngineSettings::default());
    tokio::time::sleep(ms(10)).await;
    assert_eq!(handle.toggle_aux("Pads").await, Some(true));

    // Several rescan cycles with no device present
    tokio::time::sleep(ms(6000)).await;
    assert!(!handle.is_connected());
    assert!(ports.is_open("Pads"));

    let status = handle.status().await.unwrap();
    assert_eq!(status.aux.len(), 1);
    assert!(status.aux[0].1.active);
    assert!(statuses.lock().is_empty());

    handle.shutdown();
    task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_active_aux_input_is_forwarded() {
    let ports = MockPorts::new(&[DEVICE, "Keystep", "Pads"], &[DEVICE]);
    let settings = EngineSettings {
        auto_activate: vec!["keystep".to_string()],
        ..EngineSettings::default()
    };
    let (task, handle, _) = start(&ports, settings);
    tokio::time::sleep(ms(10)).await;
    ports.take_sent();

    ports.inject("Keystep", &[0x90, 60, 100]);
    ports.inject("Pads", &[0x90, 36, 100]);
    ports.inject("Keystep", &[0xF0, 0x01, 0xF7]);
    tokio::time::sleep(ms(10)).await;

    let raw: Vec<Vec<u8>> = ports.take_sent().into_iter().map(|(_, b)| b).collect();
    assert_eq!(raw, vec![vec![0x90, 60, 100]]);

    assert_eq!(handle.toggle_aux("Pads").await, Some(true));
    assert_eq!(handle.toggle_aux("Nope").await, None);

    let status = handle.status().await.unwrap();
    assert_eq!(status.aux.len(), 2);
    assert_eq!(status.aux[0].1.last_message.as_deref(), Some("f001f7"));

    handle.shutdown();
    task.await.unwrap().unwrap();
}
