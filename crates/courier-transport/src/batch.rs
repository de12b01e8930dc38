//! The unit of delivery.

/// An ordered group of events ("page") sent and acknowledged as one unit.
///
/// Workers forward the batch they received, not the encoded bytes, so the registrar
/// sees exactly what the producer submitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch<E> {
    events: Vec<E>,
}

impl<E> Batch<E> {
    /// Wraps events in submission order.
    pub fn new(events: Vec<E>) -> Self {
        Self { events }
    }

    /// The events in submission order.
    pub fn events(&self) -> &[E] {
        &self.events
    }

    /// Number of events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether the batch carries no events.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Unwraps the events.
    pub fn into_events(self) -> Vec<E> {
        self.events
    }
}

impl<E> From<Vec<E>> for Batch<E> {
    fn from(events: Vec<E>) -> Self {
        Self::new(events)
    }
}
