pub mod broadcast;
pub mod device_info;
pub mod login;
pub mod telemetry;

use std::sync::Arc;
use std::time::Duration;

use crate::modbus::FunctionCall;

pub use broadcast::broadcast_hello;
pub use device_info::{DeviceInfo, DeviceInfoObject, ObjectKind};
pub use login::LoginState;
pub use telemetry::{status_text, Telemetry};

const DEFAULT_LOGIN_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_LOGIN_TIMEOUT: Duration = Duration::from_secs(15);

/// Inverter level operations over any [`FunctionCall`] transport.
pub struct Client<C: ?Sized> {
    login_delay: Duration,
    login_timeout: Duration,
    conn: Arc<C>,
}

impl<C> Client<C>
where
    C: FunctionCall + ?Sized,
{
    pub fn new(conn: Arc<C>) -> Self {
        Self {
            login_delay: DEFAULT_LOGIN_DELAY,
            login_timeout: DEFAULT_LOGIN_TIMEOUT,
            conn,
        }
    }

    /// Pause between the two login steps.
    pub fn with_login_delay(mut self, delay: Duration) -> Self {
        self.login_delay = delay;
        self
    }

    pub fn with_login_timeout(mut self, timeout: Duration) -> Self {
        self.login_timeout = timeout;
        self
    }

    pub fn connection(&self) -> &Arc<C> {
        &self.conn
    }
}
