pub use std::fmt::{Debug, Display};
pub use std::pin::Pin;
pub use std::sync::{Arc, Mutex};
pub use std::task::{Context, Poll, ready};
pub use std::time::{Duration, Instant};

pub use bytes::{Bytes, BytesMut};
pub use tracing::{Instrument, debug, error, info, trace, warn};
