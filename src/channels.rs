use crate::prelude::*;

#[derive(Debug, Clone)]
pub struct Channels {
    pub to_mqtt: broadcast::Sender<mqtt::ChannelData>,
}

impl Default for Channels {
    fn default() -> Self {
        Self::new()
    }
}

impl Channels {
    pub fn new() -> Self {
        Self {
            to_mqtt: Self::channel(),
        }
    }

    // stale samples are dropped rather than queued
    fn channel<T: Clone>() -> broadcast::Sender<T> {
        broadcast::channel(10).0
    }
}
