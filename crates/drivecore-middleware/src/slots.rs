//! Single-slot, drop-to-latest ingestion buffers.
//!
//! Each modality gets one [`tokio::sync::watch`] slot. Producers overwrite
//! the slot with every new sample and never wait; the pipeline takes
//! whatever changed since its last cycle. A sample overwritten before the
//! pipeline saw it is simply lost, which keeps a slow cycle from building a
//! backlog.
//!
//! The driving context (lanes, lateral gaps, weather) has its own slot and
//! is read every cycle whether or not it changed.

use std::sync::Arc;

use drivecore_types::{DriveError, DrivingContext, Modality, SensorSample, VehicleId};
use tokio::sync::watch;
use tracing::trace;

struct Senders {
    samples: [watch::Sender<Option<SensorSample>>; Modality::COUNT],
    context: watch::Sender<DrivingContext>,
}

/// Producer side. Cheap to clone; every clone feeds the same slots.
#[derive(Clone)]
pub struct IngestHandle {
    vehicle_id: VehicleId,
    senders: Arc<Senders>,
}

/// Pipeline side.
pub struct SlotReader {
    samples: [watch::Receiver<Option<SensorSample>>; Modality::COUNT],
    context: watch::Receiver<DrivingContext>,
}

/// Create the slots for one vehicle.
pub fn ingest_slots(vehicle_id: VehicleId) -> (IngestHandle, SlotReader) {
    let pairs: [(watch::Sender<Option<SensorSample>>, watch::Receiver<Option<SensorSample>>); Modality::COUNT] =
        std::array::from_fn(|_| watch::channel(None));
    let (context_tx, context_rx) = watch::channel(DrivingContext::default());

    let [a, b, c, d, e] = pairs;
    let senders = Senders {
        samples: [a.0, b.0, c.0, d.0, e.0],
        context: context_tx,
    };
    let reader = SlotReader {
        samples: [a.1, b.1, c.1, d.1, e.1],
        context: context_rx,
    };
    (
        IngestHandle {
            vehicle_id,
            senders: Arc::new(senders),
        },
        reader,
    )
}

impl IngestHandle {
    pub fn vehicle_id(&self) -> &VehicleId {
        &self.vehicle_id
    }

    /// Overwrite the slot of the sample's modality.
    ///
    /// Fails with [`DriveError::VehicleMismatch`] when the sample belongs to
    /// another vehicle.
    pub fn push(&self, sample: SensorSample) -> Result<(), DriveError> {
        if sample.vehicle_id != self.vehicle_id {
            return Err(DriveError::VehicleMismatch {
                expected: self.vehicle_id.clone(),
                got: sample.vehicle_id,
            });
        }
        let modality = sample.modality;
        let replaced = self.senders.samples[modality.index()].send_replace(Some(sample));
        if replaced.is_some() {
            trace!(vehicle = %self.vehicle_id, %modality, "slot overwritten");
        }
        Ok(())
    }

    pub fn update_context(&self, context: DrivingContext) {
        self.senders.context.send_replace(context);
    }
}

impl SlotReader {
    /// Samples pushed since the previous call, at most one per modality.
    pub fn take_fresh(&mut self) -> Vec<SensorSample> {
        self.samples
            .iter_mut()
            .filter(|rx| rx.has_changed().unwrap_or(false))
            .filter_map(|rx| rx.borrow_and_update().clone())
            .collect()
    }

    /// The latest driving context.
    pub fn context(&mut self) -> DrivingContext {
        *self.context.borrow_and_update()
    }
}
