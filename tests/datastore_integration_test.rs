//! Integration tests for the datastore contract over the in-memory backend
//!
//! These exercise the freeze latch, duplicate handling, axis validation,
//! event ordering and partial-coordinate queries the way an acquisition
//! producer and a viewer would use them together.

use parking_lot::Mutex;
use planestore::{
    Coords, DataError, DataEvent, DataManager, Datastore, Image, Metadata, PixelType,
    RamStorage, SummaryMetadata, CHANNEL, DEFAULT_PRIORITY,
};
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn tcz(t: u32, c: u32, z: u32) -> Coords {
    Coords::builder()
        .time(t)
        .channel(c)
        .z(z)
        .build()
        .expect("Failed to build coordinate")
}

fn plane(coords: Coords, fill: u8) -> Image {
    Image::new(vec![fill; 16], 4, 4, PixelType::Gray8, coords, Metadata::new())
        .expect("Failed to build image")
}

fn ram_store() -> Datastore {
    DataManager::new()
        .create_ram_datastore()
        .expect("Failed to create RAM datastore")
}

fn event_log(store: &Datastore) -> Arc<Mutex<Vec<String>>> {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    store.register_listener(move |event: &DataEvent| {
        let tag = match event {
            DataEvent::NewSummaryMetadata(_) => "summary".to_string(),
            DataEvent::NewImage(image) => format!("new {}", image.coords()),
            DataEvent::ImageOverwritten { new_image, old_image } => format!(
                "overwritten {} {}->{}",
                new_image.coords(),
                old_image.pixels()[0],
                new_image.pixels()[0]
            ),
            DataEvent::ImageDeleted(image) => format!("deleted {}", image.coords()),
            DataEvent::Frozen => "frozen".to_string(),
            DataEvent::AnnotationChanged { name, .. } => format!("annotation {}", name),
            DataEvent::Closing => "closing".to_string(),
        };
        sink.lock().push(tag);
    });
    log
}

/// Writes after freeze fail; a second freeze publishes nothing
#[test]
fn test_freeze_latch() {
    init_tracing();
    let store = ram_store();
    let log = event_log(&store);

    store.put_image(plane(tcz(0, 0, 0), 1)).expect("Failed to insert image");
    store.freeze().expect("Failed to freeze");
    store.freeze().expect("Second freeze should be a no-op");

    let err = store.put_image(plane(tcz(1, 0, 0), 1)).unwrap_err();
    assert!(matches!(err, DataError::Frozen));
    assert!(matches!(
        store.set_summary_metadata(SummaryMetadata::new()),
        Err(DataError::Frozen)
    ));

    let frozen_events = log.lock().iter().filter(|e| *e == "frozen").count();
    assert_eq!(frozen_events, 1);
    assert_eq!(store.num_images(), 1);
    assert!(store.get_image(&tcz(0, 0, 0)).unwrap().is_some());

    println!("✓ Freeze latch holds, {} events", log.lock().len());
}

/// A frozen datastore is frozen for every thread once freeze returns
#[test]
fn test_freeze_visible_across_threads() {
    let store = Arc::new(ram_store());
    store.freeze().expect("Failed to freeze");
    let handle = {
        let store = Arc::clone(&store);
        std::thread::spawn(move || store.put_image(plane(tcz(0, 0, 0), 0)))
    };
    let result = handle.join().expect("Writer thread panicked");
    assert!(matches!(result, Err(DataError::Frozen)));
}

/// Duplicate coordinates fail unless the datastore is rewritable
#[test]
fn test_duplicate_and_overwrite() {
    let store = ram_store();
    store.put_image(plane(tcz(0, 0, 0), 1)).unwrap();
    match store.put_image(plane(tcz(0, 0, 0), 2)) {
        Err(DataError::DuplicateCoordinate(coords)) => assert_eq!(coords, tcz(0, 0, 0)),
        other => panic!("Expected DuplicateCoordinate, got {:?}", other),
    }

    let rewritable = DataManager::new()
        .create_rewritable_ram_datastore()
        .expect("Failed to create rewritable datastore");
    let log = event_log(&rewritable);
    rewritable.put_image(plane(tcz(0, 0, 0), 1)).unwrap();
    rewritable.put_image(plane(tcz(0, 0, 0), 2)).unwrap();

    assert_eq!(
        *log.lock(),
        vec![
            "new <channel=0,time=0,z=0>".to_string(),
            "overwritten <channel=0,time=0,z=0> 1->2".to_string(),
        ]
    );
    let stored = rewritable.get_image(&tcz(0, 0, 0)).unwrap().unwrap();
    assert_eq!(stored.pixels()[0], 2);
    assert_eq!(rewritable.num_images(), 1);
}

/// Once the dataset has axes, images must stay within them
#[test]
fn test_axis_set_enforced() {
    let store = ram_store();
    let first = Coords::builder().time(0).channel(0).build().unwrap();
    store.put_image(plane(first, 0)).unwrap();

    let with_z = tcz(1, 0, 0);
    assert!(matches!(store.put_image(plane(with_z, 0)), Err(DataError::InvalidAxis(_))));

    let fewer = Coords::builder().time(1).build().unwrap();
    store.put_image(plane(fewer, 0)).expect("Subset of axes should be accepted");
    assert_eq!(store.axes(), vec!["channel", "time"]);
}

/// Plane geometry must stay the same for the whole dataset
#[test]
fn test_size_mismatch_rejected() {
    let store = ram_store();
    store.put_image(plane(tcz(0, 0, 0), 0)).unwrap();
    let wide = Image::new(vec![0u8; 32], 8, 4, PixelType::Gray8, tcz(0, 1, 0), Metadata::new())
        .unwrap();
    assert!(matches!(store.put_image(wide), Err(DataError::SizeMismatch(_))));

    let declared = ram_store();
    declared
        .set_summary_metadata(SummaryMetadata::new().with_image_format(planestore::ImageFormat::new(
            4,
            4,
            PixelType::Gray16,
        )))
        .unwrap();
    assert!(matches!(
        declared.put_image(plane(tcz(0, 0, 0), 0)),
        Err(DataError::SizeMismatch(_))
    ));
}

/// Partial coordinates match every image agreeing on the axes they define
#[test]
fn test_matching_queries() {
    let store = ram_store();
    for t in 0..2 {
        for c in 0..2 {
            store.put_image(plane(tcz(t, c, 0), (t * 2 + c) as u8)).unwrap();
        }
    }

    let by_channel = store
        .get_images_matching(&Coords::builder().channel(1).build().unwrap())
        .unwrap();
    let coords: HashSet<Coords> = by_channel.iter().map(|i| i.coords().clone()).collect();
    assert_eq!(coords, HashSet::from([tcz(0, 1, 0), tcz(1, 1, 0)]));

    let by_plane = store
        .get_images_matching(&Coords::builder().time(1).z(0).build().unwrap())
        .unwrap();
    assert_eq!(by_plane.len(), 2);
    assert!(by_plane.iter().all(|i| i.coords().time() == Some(1)));

    let all_channels = store
        .get_images_ignoring_axes(&Coords::builder().time(0).z(0).build().unwrap(), &[CHANNEL])
        .unwrap();
    assert_eq!(all_channels.len(), 2);

    let all_times = store
        .get_images_ignoring_axes(&Coords::builder().channel(1).z(0).build().unwrap(), &["time"])
        .unwrap();
    assert_eq!(all_times.len(), 2);

    assert!(store.get_image(&tcz(5, 0, 0)).unwrap().is_none());
    assert_eq!(store.get_images_matching(&tcz(5, 0, 0)).unwrap().len(), 0);
}

/// Max indices never shrink on delete; a full clear resets them
#[test]
fn test_max_index_after_delete() {
    let store = DataManager::new().create_rewritable_ram_datastore().unwrap();
    let log = event_log(&store);
    for t in 0..3 {
        store.put_image(plane(tcz(t, 0, 0), 0)).unwrap();
    }
    assert_eq!(store.max_index("time"), Some(2));

    let deleted = store.delete_image(&tcz(2, 0, 0)).unwrap();
    assert!(deleted.is_some());
    assert!(store.delete_image(&tcz(2, 0, 0)).unwrap().is_none());
    assert_eq!(store.max_index("time"), Some(2));
    assert_eq!(store.num_images(), 2);
    assert!(log.lock().contains(&"deleted <channel=0,time=2,z=0>".to_string()));

    store.delete_all_images().unwrap();
    assert_eq!(store.max_index("time"), None);
    assert_eq!(store.num_images(), 0);
}

/// The backend has indexed an event before any consumer hears of it
#[test]
fn test_backend_notified_before_consumers() {
    let store = Arc::new(ram_store());
    let observed = Arc::new(Mutex::new(Vec::new()));
    {
        let weak: Weak<Datastore> = Arc::downgrade(&store);
        let observed = Arc::clone(&observed);
        store.register_listener_at(
            move |event: &DataEvent| {
                let Some(store) = weak.upgrade() else { return };
                match event {
                    DataEvent::NewSummaryMetadata(_) => {
                        observed.lock().push(store.summary_metadata().prefix.clone());
                    }
                    DataEvent::NewImage(image) => {
                        let seen = store.has_image(image.coords());
                        observed.lock().push(Some(seen.to_string()));
                    }
                    _ => {}
                }
            },
            DEFAULT_PRIORITY - 50,
        );
    }

    store
        .set_summary_metadata(SummaryMetadata::new().with_prefix("run"))
        .unwrap();
    store.put_image(plane(tcz(0, 0, 0), 0)).unwrap();
    assert_eq!(
        *observed.lock(),
        vec![Some("run".to_string()), Some("true".to_string())]
    );
}

fn prefix_watcher(store: &Arc<Datastore>, seen: &Arc<Mutex<Vec<Option<String>>>>, priority: i32) {
    let weak: Weak<Datastore> = Arc::downgrade(store);
    let seen = Arc::clone(seen);
    store.register_listener_at(
        move |event: &DataEvent| {
            if let (DataEvent::NewSummaryMetadata(_), Some(store)) = (event, weak.upgrade()) {
                seen.lock().push(store.summary_metadata().prefix.clone());
            }
        },
        priority,
    );
}

/// No listener priority, however low, runs ahead of the backend, and
/// listeners registered before the backend is bound still follow it
#[test]
fn test_backend_precedes_low_priority_and_early_listeners() {
    init_tracing();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let bound = Arc::new(ram_store());
    prefix_watcher(&bound, &seen, -1);
    prefix_watcher(&bound, &seen, i32::MIN);

    let unbound = Arc::new(Datastore::new());
    prefix_watcher(&unbound, &seen, 0);
    unbound.set_storage(Arc::new(RamStorage::new())).unwrap();

    for store in [&bound, &unbound] {
        store
            .set_summary_metadata(SummaryMetadata::new().with_prefix("run"))
            .unwrap();
    }
    assert_eq!(*seen.lock(), vec![Some("run".to_string()); 3]);
}

/// Listeners can be removed again
#[test]
fn test_unregister_listener() {
    let store = ram_store();
    let count = Arc::new(Mutex::new(0));
    let id = {
        let count = Arc::clone(&count);
        store.register_listener(move |_: &DataEvent| *count.lock() += 1)
    };
    store.put_image(plane(tcz(0, 0, 0), 0)).unwrap();
    assert!(store.unregister_listener(id));
    store.put_image(plane(tcz(1, 0, 0), 0)).unwrap();
    assert_eq!(*count.lock(), 1);
}

/// Annotations are memoized by name and publish changes
#[test]
fn test_annotations_on_datastore() {
    let store = ram_store();
    let log = event_log(&store);
    assert!(!store.has_annotation("comments"));
    let created = store.create_annotation("comments").expect("Failed to create annotation");
    assert!(store.has_annotation("comments"));
    assert!(matches!(
        store.create_annotation("comments"),
        Err(DataError::AlreadyExists(_))
    ));
    let loaded = store.load_annotation("comments").unwrap();
    assert!(Arc::ptr_eq(&created, &loaded));

    let mut record = planestore::PropertyMap::new();
    record.put_string("note", "focus drift");
    loaded.set_image_annotation(&tcz(0, 0, 0), record);
    assert_eq!(*log.lock(), vec!["annotation comments".to_string()]);
}

/// Closing notifies listeners and releases the backend
#[test]
fn test_close() {
    let store = ram_store();
    let log = event_log(&store);
    store.put_image(plane(tcz(0, 0, 0), 0)).unwrap();
    store.close().expect("Failed to close");
    assert_eq!(log.lock().last().map(String::as_str), Some("closing"));
    assert!(matches!(store.get_image(&tcz(0, 0, 0)), Err(DataError::Closed)));
}

/// Acquisition and display threads can use one datastore at the same time
#[test]
fn test_concurrent_producer_and_viewer() {
    let store = Arc::new(Datastore::new());
    store.set_storage(Arc::new(RamStorage::new())).unwrap();

    let producer = {
        let store = Arc::clone(&store);
        std::thread::spawn(move || {
            for t in 0..100 {
                for c in 0..2 {
                    store.put_image(plane(tcz(t, c, 0), c as u8)).expect("Insert failed");
                }
            }
            store.freeze().expect("Freeze failed");
        })
    };

    let query = Coords::builder().channel(1).build().unwrap();
    while !store.is_frozen() {
        let found = store.get_images_matching(&query).expect("Query failed");
        assert!(found.iter().all(|i| i.pixels()[0] == 1));
    }
    producer.join().expect("Producer panicked");

    assert_eq!(store.num_images(), 200);
    assert_eq!(store.get_images_matching(&query).unwrap().len(), 100);
    println!("✓ {} images written while querying", store.num_images());
}
