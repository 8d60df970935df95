pub use anyhow::{anyhow, bail, Result};
pub use log::{debug, error, info, trace, warn};
pub use std::io::Write;
pub use tokio::sync::{broadcast, mpsc, oneshot};

pub use crate::channels::Channels;
pub use crate::config::{self, Config};
pub use crate::modbus::{self, Adu, Connection, FunctionCall};
pub use crate::mqtt;
pub use crate::options::Options;
pub use crate::solar::{self, Telemetry};
