use std::{sync::Arc, time::Duration};

use pretty_assertions::assert_eq;
use sprinkler_common::{
    spawn_writer, CoreConfig, DeviceConfig, ElementConfig, Error, ProgramConfig, ScheduleConfig,
    SimulatedGpio, Snapshot, StateStore,
};
use tokio::sync::watch;

fn sample() -> Snapshot {
    Snapshot {
        devices: vec![
            DeviceConfig {
                name: "zone-b".to_string(),
                on: true,
                pin: 27,
                switch_on_low: true,
            },
            DeviceConfig {
                name: "zone-a".to_string(),
                on: false,
                pin: 17,
                switch_on_low: false,
            },
        ],
        programs: vec![ProgramConfig {
            name: "lawn".to_string(),
            elements: vec![
                ElementConfig {
                    device: "zone-b".to_string(),
                    duration_ms: 90_000,
                },
                ElementConfig {
                    device: "zone-a".to_string(),
                    duration_ms: 30_000,
                },
            ],
        }],
        schedules: vec![
            ScheduleConfig {
                name: "weekend".to_string(),
                spec: "0 8 * * sat,sun".to_string(),
                program: None,
                enabled: false,
            },
            ScheduleConfig {
                name: "morning".to_string(),
                spec: "7 1 */2 * *".to_string(),
                program: Some("lawn".to_string()),
                enabled: true,
            },
        ],
    }
}

#[tokio::test]
async fn store_load_store_is_byte_identical() {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::new(dir.path().join("state.json"));

    store.store(&sample()).await.unwrap();
    let first = tokio::fs::read(store.path()).await.unwrap();

    let state = store
        .load_state(Arc::new(SimulatedGpio::new()), &CoreConfig::default())
        .await
        .unwrap();
    store.store(&state.snapshot()).await.unwrap();
    let second = tokio::fs::read(store.path()).await.unwrap();

    assert_eq!(
        String::from_utf8(first).unwrap(),
        String::from_utf8(second).unwrap()
    );
}

#[tokio::test]
async fn loading_reapplies_device_state_to_the_pins() {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::new(dir.path().join("state.json"));
    store.store(&sample()).await.unwrap();

    let gpio = Arc::new(SimulatedGpio::new());
    let state = store
        .load_state(gpio.clone(), &CoreConfig::default())
        .await
        .unwrap();

    // zone-b is on and active-low.
    assert!(state.devices.get("zone-b").unwrap().is_on());
    assert!(!gpio.is_high(27));
    assert!(gpio.pin(27).unwrap().output);
    assert!(!gpio.is_high(17));
    assert!(!state.schedules.get("morning").unwrap().is_armed());
}

#[tokio::test]
async fn missing_file_loads_as_empty() {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::new(dir.path().join("nested").join("state.json"));

    assert!(store.load().await.unwrap().is_none());
    let state = store
        .load_state(Arc::new(SimulatedGpio::new()), &CoreConfig::default())
        .await
        .unwrap();
    assert_eq!(state.snapshot(), Snapshot::default());

    // Parent directories are created on first store.
    store.store(&Snapshot::default()).await.unwrap();
    assert!(store.path().exists());
}

#[tokio::test]
async fn corrupt_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::new(dir.path().join("state.json"));
    tokio::fs::write(store.path(), b"{\"devices\": [").await.unwrap();

    let err = store.load().await.unwrap_err();
    assert!(matches!(err, Error::Corrupt(_)));
}

#[tokio::test]
async fn dangling_reference_rejects_the_whole_file() {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::new(dir.path().join("state.json"));
    let mut snapshot = sample();
    snapshot.devices.retain(|device| device.name != "zone-a");
    store.store(&snapshot).await.unwrap();

    let gpio = Arc::new(SimulatedGpio::new());
    let result = store.load_state(gpio.clone(), &CoreConfig::default()).await;
    assert!(matches!(result, Err(Error::DanglingReference { .. })));
    // Nothing was applied to the hardware.
    assert!(gpio.pin(27).is_none());
}

#[tokio::test]
async fn quarantine_moves_the_rejected_file_aside() {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::new(dir.path().join("state.json"));
    tokio::fs::write(store.path(), b"garbage").await.unwrap();

    let moved = store.quarantine().await.unwrap();
    assert_eq!(moved, dir.path().join("state.json.rejected"));
    assert_eq!(tokio::fs::read(&moved).await.unwrap(), b"garbage");
    assert!(store.load().await.unwrap().is_none());
}

#[tokio::test]
async fn writer_coalesces_bursts_into_the_latest_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::new(dir.path().join("state.json"));
    let (tx, rx) = watch::channel(Snapshot::default());
    let writer = spawn_writer(store.clone(), rx, Duration::from_millis(200));

    let mut first = sample();
    first.schedules.clear();
    tx.send_replace(first);
    tx.send_replace(sample());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!store.path().exists());

    let mut stored = None;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if let Ok(bytes) = tokio::fs::read(store.path()).await {
            stored = Some(bytes);
            break;
        }
    }
    assert_eq!(stored.unwrap(), sample().encode().unwrap());

    drop(tx);
    writer.await.unwrap();
}
