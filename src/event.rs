use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Graph lifecycle notifications, recorded by the store when enabled with
/// [`GraphStore::set_event_recording`](crate::world::GraphStore::set_event_recording).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GraphEvent {
    /// A new graph id came into existence (new node or split).
    Created(u64),
    /// Links changed without changing which graph owns which node.
    Updated(u64),
    /// Leaving memory, still on disk.
    Unloading(u64),
    /// Gone for good: emptied, absorbed by a merge, or destroyed.
    Destroyed(u64),
}

impl GraphEvent {
    pub fn graph_id(&self) -> u64 {
        match self {
            GraphEvent::Created(id)
            | GraphEvent::Updated(id)
            | GraphEvent::Unloading(id)
            | GraphEvent::Destroyed(id) => *id,
        }
    }
}

impl Display for GraphEvent {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            GraphEvent::Created(id) => write!(f, "Created({id:016X})"),
            GraphEvent::Updated(id) => write!(f, "Updated({id:016X})"),
            GraphEvent::Unloading(id) => write!(f, "Unloading({id:016X})"),
            GraphEvent::Destroyed(id) => write!(f, "Destroyed({id:016X})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_json_shape() {
        let event = GraphEvent::Destroyed(0x2A);
        assert_eq!(serde_json::to_string(&event).unwrap(), r#"{"Destroyed":42}"#);
        assert_eq!(event.to_string(), "Destroyed(000000000000002A)");
        assert_eq!(event.graph_id(), 42);
    }
}
