//! Down-sampling from the primary step to the publish step.
//!
//! Each meter gets a consolidator that buffers the last `multiple` primary
//! samples and combines them into one value per publish interval. The
//! combine algebra depends on the statistic: rates average (missing
//! sub-intervals diluting toward zero), maxima take the largest sample,
//! gauges report the most recent one.

use atlas_metrics::Measurement;

/// One buffered primary sample: the primary bucket index and the value.
#[derive(Debug, Clone, Copy)]
struct Slot {
    index: u64,
    value: f64,
}

#[derive(Debug)]
struct Ring {
    primary_ms: u64,
    multiple: usize,
    slots: Vec<Option<Slot>>,
}

impl Ring {
    fn new(primary_ms: u64, multiple: usize) -> Self {
        Ring {
            primary_ms,
            multiple,
            slots: vec![None; multiple],
        }
    }

    fn update(&mut self, timestamp: u64, value: f64) {
        let index = timestamp / self.primary_ms;
        let slot = &mut self.slots[(index % self.multiple as u64) as usize];
        match slot {
            // A bucket that already rolled over stays as it was; only the
            // same time index may be rewritten.
            Some(existing) if existing.index > index => {}
            _ => *slot = Some(Slot { index, value }),
        }
    }

    /// Samples in the consolidated interval ending at `timestamp`.
    fn window(&self, timestamp: u64) -> impl Iterator<Item = Slot> + '_ {
        let end = timestamp / self.primary_ms;
        let start = end.saturating_sub(self.multiple as u64);
        self.slots
            .iter()
            .flatten()
            .copied()
            .filter(move |s| s.index >= start && s.index < end && !s.value.is_nan())
    }

    fn is_empty(&self) -> bool {
        self.slots
            .iter()
            .all(|s| s.map(|s| s.value.is_nan()).unwrap_or(true))
    }
}

#[derive(Debug)]
enum Kind {
    /// Pass-through for a publish step equal to the primary step.
    None { primary_ms: u64, last: Option<Slot> },
    /// Average over the window, missing sub-intervals count as zero.
    Avg(Ring),
    /// Maximum over the window, empty slots skipped.
    Max(Ring),
    /// Most recent sample in the window.
    Last(Ring),
}

/// Converts primary-step samples into one publish-step value.
#[derive(Debug)]
pub struct Consolidator {
    kind: Kind,
}

impl Consolidator {
    /// Consolidator for a statistic, selected by the `statistic` tag of
    /// the measurement id. Rates average, maxima take the max, everything
    /// gauge-like reports the last value.
    pub fn for_statistic(statistic: Option<&str>, primary_ms: u64, multiple: usize) -> Consolidator {
        let kind = if multiple <= 1 {
            Kind::None {
                primary_ms,
                last: None,
            }
        } else {
            let ring = Ring::new(primary_ms, multiple);
            match statistic {
                Some("count") | Some("totalAmount") | Some("totalTime")
                | Some("totalOfSquares") | Some("percentile") => Kind::Avg(ring),
                Some("max") | Some("duration") | Some("activeTasks") => Kind::Max(ring),
                _ => Kind::Last(ring),
            }
        };
        Consolidator { kind }
    }

    /// Record one primary-step sample.
    pub fn update(&mut self, timestamp: u64, value: f64) {
        match &mut self.kind {
            Kind::None { primary_ms, last } => {
                let index = timestamp / *primary_ms;
                match last {
                    Some(slot) if slot.index > index => {}
                    _ => *last = Some(Slot { index, value }),
                }
            }
            Kind::Avg(ring) | Kind::Max(ring) | Kind::Last(ring) => {
                ring.update(timestamp, value)
            }
        }
    }

    /// Record a measurement.
    pub fn update_measurement(&mut self, m: &Measurement) {
        self.update(m.timestamp(), m.value());
    }

    /// Consolidated value for the publish interval ending at `timestamp`.
    /// NaN when the window holds no data.
    pub fn value(&self, timestamp: u64) -> f64 {
        match &self.kind {
            Kind::None { primary_ms, last } => {
                let end = timestamp / *primary_ms;
                match last {
                    Some(slot) if slot.index >= end.saturating_sub(1) && slot.index < end => {
                        slot.value
                    }
                    _ => f64::NAN,
                }
            }
            Kind::Avg(ring) => {
                let mut sum = f64::NAN;
                for s in ring.window(timestamp) {
                    sum = if sum.is_nan() { s.value } else { sum + s.value };
                }
                // Missing sub-intervals dilute the average toward zero as
                // long as at least one sample is present.
                if sum.is_nan() {
                    f64::NAN
                } else {
                    sum / ring.multiple as f64
                }
            }
            Kind::Max(ring) => ring.window(timestamp).fold(f64::NAN, |acc, s| {
                if acc.is_nan() || s.value > acc {
                    s.value
                } else {
                    acc
                }
            }),
            Kind::Last(ring) => {
                let mut best: Option<Slot> = None;
                for s in ring.window(timestamp) {
                    match best {
                        Some(b) if b.index >= s.index => {}
                        _ => best = Some(s),
                    }
                }
                best.map(|s| s.value).unwrap_or(f64::NAN)
            }
        }
    }

    /// True when nothing has been recorded, or everything recorded was
    /// NaN.
    pub fn is_empty(&self) -> bool {
        match &self.kind {
            Kind::None { last, .. } => last.map(|s| s.value.is_nan()).unwrap_or(true),
            Kind::Avg(ring) | Kind::Max(ring) | Kind::Last(ring) => ring.is_empty(),
        }
    }
}
