//! `drivecore-middleware` – The Nervous System
//!
//! Moves data in and out of the per-vehicle pipelines without caring about
//! its meaning.
//!
//! # Modules
//!
//! - [`slots`] – single-slot, drop-to-latest ingestion buffers, one per
//!   modality, plus the driving-context slot.
//! - [`bus`] – Headless, typed, topic-based publish/subscribe event bus built
//!   on Tokio broadcast channels.

pub mod bus;
pub mod slots;

pub use bus::{EventBus, SourceSubscriber, Topic, TopicReceiver};
pub use slots::{IngestHandle, SlotReader, ingest_slots};
