//! In-memory transport.

mod transport;

pub use transport::{
    //
    create_memory_transport,
    create_memory_transport_with_probe,
    TransportEvent,
    TransportProbe,
};
