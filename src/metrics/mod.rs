//! Metrics and observability.
//!
//! - `events`: internal event types and the `InternalEvent` trait
//! - `server`: Prometheus recorder and the `/metrics` + `/health` endpoints

pub mod events;
pub mod server;

pub use server::init;

/// Emit an internal event.
///
/// ```ignore
/// use dockside::metrics::events::RowsCommitted;
///
/// emit!(RowsCommitted { feed: "station_status".into(), count: 2100 });
/// ```
#[macro_export]
macro_rules! emit {
    ($event:expr) => {
        $crate::metrics::events::InternalEvent::emit($event)
    };
}
