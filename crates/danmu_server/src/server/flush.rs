#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use danmu_domain::DanmuRecord;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use super::sink::PersistenceSink;

/// Append-only record buffer shared by every room watcher and drained by the flush task.
#[derive(Debug, Default)]
pub struct FlushBuffer {
	records: Mutex<Vec<DanmuRecord>>,
}

impl FlushBuffer {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn push(&self, record: DanmuRecord) {
		let len = {
			let mut records = self.records.lock();
			records.push(record);
			records.len()
		};
		metrics::gauge!("danmu_flush_buffer_len").set(len as f64);
	}

	/// Take every buffered record, leaving the buffer empty.
	pub fn drain(&self) -> Vec<DanmuRecord> {
		let drained = std::mem::take(&mut *self.records.lock());
		metrics::gauge!("danmu_flush_buffer_len").set(0.0);
		drained
	}

	pub fn len(&self) -> usize {
		self.records.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.records.lock().is_empty()
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
	pub attempted: usize,
	pub failed: usize,
}

/// Drain the buffer and hand each record to the sink, in buffer order.
///
/// A failed append is logged and counted; the record is not re-buffered.
pub async fn flush_once(buffer: &FlushBuffer, sink: &dyn PersistenceSink) -> FlushReport {
	let batch = buffer.drain();
	if batch.is_empty() {
		return FlushReport::default();
	}

	let mut report = FlushReport {
		attempted: batch.len(),
		failed: 0,
	};
	for record in &batch {
		if let Err(e) = sink.append(record).await {
			report.failed += 1;
			metrics::counter!("danmu_sink_errors_total").increment(1);
			warn!(error = %e, room_id = %record.room_id, "failed to persist danmu record");
		}
	}

	metrics::counter!("danmu_flush_records_total").increment(report.attempted as u64);
	debug!(attempted = report.attempted, failed = report.failed, "flushed danmu buffer");
	report
}

/// Periodic flush. The first flush happens one full interval after spawn; the
/// task exits when `shutdown` fires or its sender is dropped.
pub fn spawn_flush_task(
	buffer: Arc<FlushBuffer>,
	sink: Arc<dyn PersistenceSink>,
	interval: Duration,
	mut shutdown: oneshot::Receiver<()>,
) -> JoinHandle<()> {
	let period = interval.max(Duration::from_millis(1));
	tokio::spawn(async move {
		let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
		ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
		loop {
			tokio::select! {
				_ = &mut shutdown => break,
				_ = ticker.tick() => {
					flush_once(&buffer, sink.as_ref()).await;
				}
			}
		}
		debug!("flush task stopped");
	})
}
