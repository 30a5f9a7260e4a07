//! Canned channel factories.

use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;

use sshmux_conn::{Channel, ChannelFactory, ChannelSink};
use sshmux_core::{Error, Result};

use crate::sinks::CollectSink;

/// Factory accepting every open with a fresh [`CollectSink`].
pub struct AcceptFactory {
    channel_type: String,
    sinks: Mutex<Vec<Arc<CollectSink>>>,
}

impl AcceptFactory {
    pub fn new(channel_type: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            channel_type: channel_type.into(),
            sinks: Mutex::new(Vec::new()),
        })
    }

    /// Sinks handed out so far, in accept order.
    pub fn sinks(&self) -> Vec<Arc<CollectSink>> {
        self.sinks.lock().unwrap().clone()
    }

    pub fn last_sink(&self) -> Option<Arc<CollectSink>> {
        self.sinks.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl ChannelFactory for AcceptFactory {
    fn channel_type(&self) -> &str {
        &self.channel_type
    }

    async fn accept(
        &self,
        _channel: &Arc<Channel>,
        _type_data: Bytes,
    ) -> Result<Arc<dyn ChannelSink>> {
        let sink = CollectSink::new();
        self.sinks.lock().unwrap().push(Arc::clone(&sink));
        Ok(sink as Arc<dyn ChannelSink>)
    }
}

/// Factory refusing every open with a fixed reason.
pub struct RefuseFactory {
    channel_type: String,
    code: u32,
    message: String,
}

impl RefuseFactory {
    pub fn new(channel_type: impl Into<String>, code: u32, message: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            channel_type: channel_type.into(),
            code,
            message: message.into(),
        })
    }
}

#[async_trait]
impl ChannelFactory for RefuseFactory {
    fn channel_type(&self) -> &str {
        &self.channel_type
    }

    async fn accept(
        &self,
        _channel: &Arc<Channel>,
        _type_data: Bytes,
    ) -> Result<Arc<dyn ChannelSink>> {
        Err(Error::OpenFailed {
            code: self.code,
            message: self.message.clone(),
        })
    }
}
