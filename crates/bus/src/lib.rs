//! switchyard: a process-local message bus.
//!
//! Envelopes travel through named channels. Input adapters bring them in from
//! files, memory queues and other transports; endpoint activators hand them to
//! handler methods and their strategies; output adapters deliver them back out
//! with retries; the scheduler feeds channels from periodic method calls.
//!
//! ```rust,ignore
//! use switchyard::{Bus, dispatch::{Endpoint, EndpointBinding, HandlerMethod}};
//!
//! let bus = Bus::builder()
//!     .endpoint(Endpoint::new("echo").method(HandlerMethod::new("echo", |text: String| async move {
//!         Ok::<_, switchyard::Error>(text)
//!     })))
//!     .activator(EndpointBinding::deferred("orders", "echo").output_channel("echoed"))
//!     .build()?;
//! bus.start().await?;
//! ```

pub mod bus;
pub mod telemetry;

pub use {
    bus::{ActivatorStatus, Bus, BusBuilder, BusStatus, ChannelStatus},
    switchyard_adapters as adapters,
    switchyard_channels as channels,
    switchyard_common as common,
    switchyard_common::{BusEvent, Envelope, Error, EventHub, EventKind, EventObserver, Payload, Result},
    switchyard_config as config,
    switchyard_dispatch as dispatch,
    switchyard_metrics as metrics,
    switchyard_scheduler as scheduler,
};
