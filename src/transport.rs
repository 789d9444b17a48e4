use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;
use uuid::Uuid;

use crate::{error::Result, types::PeripheralIdentity, DEVICE_NAME_PREFIXES, SERVICE_UUID};

/// Which advertisements count as a Modspresso controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryFilter {
    /// Advertised service identifier
    pub service: Uuid,
    /// Accepted advertised-name prefixes
    pub name_prefixes: Vec<String>,
}

impl DiscoveryFilter {
    /// Filter on `service` or any of `name_prefixes`
    #[must_use]
    pub const fn new(service: Uuid, name_prefixes: Vec<String>) -> Self {
        Self {
            service,
            name_prefixes,
        }
    }

    /// Whether an advertisement with this name and service list matches
    #[must_use]
    pub fn matches(&self, name: Option<&str>, services: &[Uuid]) -> bool {
        if services.contains(&self.service) {
            return true;
        }
        name.is_some_and(|name| {
            self.name_prefixes
                .iter()
                .any(|prefix| name.starts_with(prefix.as_str()))
        })
    }
}

impl Default for DiscoveryFilter {
    fn default() -> Self {
        Self::new(
            SERVICE_UUID,
            DEVICE_NAME_PREFIXES.iter().map(ToString::to_string).collect(),
        )
    }
}

/// Event observed on an open link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Value-changed notification on the subscribed characteristic
    Notification(Vec<u8>),
    /// The peer dropped the link
    Disconnected,
}

/// Host radio capability
#[async_trait]
pub trait Transport: Send + Sync {
    /// Discover peripherals matching `filter`
    ///
    /// # Errors
    ///
    /// Returns [`crate::ModspressoError::NotSupported`] if the host has no usable
    /// radio, or [`crate::ModspressoError::NoDeviceChosen`] /
    /// [`crate::ModspressoError::UserCancelled`] if nothing was selected.
    async fn scan(&self, filter: &DiscoveryFilter) -> Result<Vec<PeripheralIdentity>>;

    /// Open a link to a previously discovered peripheral
    ///
    /// # Errors
    ///
    /// Returns [`crate::ModspressoError::ConnectError`] if the link cannot be opened.
    async fn open(&self, peripheral: &PeripheralIdentity) -> Result<Arc<dyn GattLink>>;
}

/// An open link to one peripheral
#[async_trait]
pub trait GattLink: Send + Sync {
    /// Resolve the service and its characteristic; must precede any other call
    async fn resolve(&self, service: Uuid, characteristic: Uuid) -> Result<()>;

    /// Enable notifications and return the event stream
    ///
    /// The stream ends, or yields [`LinkEvent::Disconnected`], when the peer goes away.
    async fn subscribe(&self) -> Result<BoxStream<'static, LinkEvent>>;

    /// Disable notifications
    async fn unsubscribe(&self) -> Result<()>;

    /// Write one frame and wait for the transport acknowledgement
    async fn write(&self, frame: &[u8]) -> Result<()>;

    /// Close the link and release platform handles
    async fn close(&self) -> Result<()>;
}
