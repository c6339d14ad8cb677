//! planestore - coordinate-indexed storage for microscopy image datasets
//!
//! A dataset is a set of 2D image planes, each addressed by a [`Coords`]
//! (time point, channel, z slice, stage position or any named axis), plus
//! dataset-wide [`SummaryMetadata`] and named [`Annotation`]s.
//!
//! # Features
//!
//! - Immutable, axis-order-independent coordinates with partial matching
//! - [`Datastore`] façade with a write-once freeze latch, axis validation
//!   and priority-ordered event listeners
//! - Pluggable [`Storage`] backends: in memory ([`RamStorage`]) and one TIFF
//!   file per plane with a JSON journal ([`SinglePlaneTiffSeries`])
//! - Loading of partially written and older-format datasets
//!
//! All I/O is synchronous.
//!
//! # Example
//!
//! ```rust,no_run
//! use planestore::{Coords, DataManager, Image, Metadata};
//!
//! # fn example() -> planestore::Result<()> {
//! let manager = DataManager::new();
//! let store = manager.create_ram_datastore()?;
//!
//! let coords = Coords::builder().time(0).channel(1).build()?;
//! let image = Image::from_gray16(&[0; 64 * 64], 64, 64, coords, Metadata::new())?;
//! store.put_image(image)?;
//! store.freeze()?;
//!
//! store.save(planestore::SaveMode::SinglePlaneTiffSeries, "/data/acq_1")?;
//! let reloaded = manager.load_data("/data/acq_1", false)?;
//! assert_eq!(reloaded.num_images(), 1);
//! # Ok(())
//! # }
//! ```

pub mod annotation;
pub mod coords;
pub mod datastore;
pub mod error;
pub mod events;
pub mod file_series;
pub mod image;
pub mod manager;
pub mod metadata;
pub mod property_map;
pub mod ram;
pub mod storage;
pub mod tiff;
pub mod types;
pub mod utils;

// Re-exports
pub use annotation::Annotation;
pub use coords::{Coords, CoordsBuilder, CHANNEL, STAGE_POSITION, TIME_POINT, Z_SLICE};
pub use datastore::{DatasetStats, Datastore};
pub use error::{DataError, Result};
pub use events::{DataEvent, DataListener, EventBus, ListenerId, DEFAULT_PRIORITY};
pub use file_series::SinglePlaneTiffSeries;
pub use image::Image;
pub use manager::{DataManager, DataManagerConfig};
pub use metadata::{Metadata, StagePosition, SummaryMetadata};
pub use property_map::{PropertyMap, PropertyValue};
pub use ram::RamStorage;
pub use storage::{SaveMode, Storage};
pub use types::{ImageFormat, PixelType};

/// Version of this crate
pub const PLANESTORE_VERSION: &str = env!("CARGO_PKG_VERSION");
