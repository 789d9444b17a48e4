use async_trait::async_trait;
use btleplug::{
    api::{
        Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, PeripheralProperties,
        ScanFilter, WriteType,
    },
    platform::{Adapter, Manager, Peripheral},
};
use futures::{
    future,
    stream::{self, BoxStream, StreamExt},
};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    error::{ModspressoError, Result},
    transport::{DiscoveryFilter, GattLink, LinkEvent, Transport},
    types::PeripheralIdentity,
};

/// [`Transport`] backed by the host Bluetooth adapter
pub struct BtleplugTransport {
    central: Adapter,
    scan_duration: Duration,
    peripherals: Arc<Mutex<HashMap<String, Peripheral>>>,
}

impl BtleplugTransport {
    /// Bind to the first Bluetooth adapter on the host
    ///
    /// # Errors
    ///
    /// Returns [`ModspressoError::NotSupported`] if the platform Bluetooth stack cannot
    /// be opened or the host has no adapter.
    pub async fn new(scan_duration: Duration) -> Result<Self> {
        let manager = Manager::new()
            .await
            .map_err(|e| ModspressoError::NotSupported(e.to_string()))?;
        let central = manager
            .adapters()
            .await
            .map_err(|e| ModspressoError::NotSupported(e.to_string()))?
            .into_iter()
            .next()
            .ok_or_else(|| ModspressoError::NotSupported("no Bluetooth adapter found".to_string()))?;

        Ok(Self {
            central,
            scan_duration,
            peripherals: Arc::new(Mutex::new(HashMap::new())),
        })
    }
}

#[async_trait]
impl Transport for BtleplugTransport {
    async fn scan(&self, filter: &DiscoveryFilter) -> Result<Vec<PeripheralIdentity>> {
        debug!("Scanning for {:?}", self.scan_duration);

        // Name-prefix matches may not advertise the service, so filter after the fact
        self.central.start_scan(ScanFilter::default()).await?;
        tokio::time::sleep(self.scan_duration).await;
        self.central.stop_scan().await?;

        let mut found = Vec::new();
        let mut peripherals = self.peripherals.lock().await;
        peripherals.clear();

        for peripheral in self.central.peripherals().await? {
            let Ok(Some(properties)) = peripheral.properties().await else {
                continue;
            };
            if !advertises(filter, &properties) {
                continue;
            }

            let identity = identity_of(peripheral_key(&peripheral), &properties);
            info!("Found Modspresso device: {}", identity.name);
            peripherals.insert(identity.id.clone(), peripheral);
            found.push(identity);
        }

        if found.is_empty() {
            return Err(ModspressoError::NoDeviceChosen);
        }
        Ok(found)
    }

    async fn open(&self, peripheral: &PeripheralIdentity) -> Result<Arc<dyn GattLink>> {
        let handle = self
            .peripherals
            .lock()
            .await
            .get(&peripheral.id)
            .cloned()
            .ok_or_else(|| {
                ModspressoError::ConnectError(format!("{} was not discovered", peripheral.name))
            })?;

        handle
            .connect()
            .await
            .map_err(|e| ModspressoError::ConnectError(e.to_string()))?;

        Ok(Arc::new(BtleplugLink {
            central: self.central.clone(),
            peripheral: handle,
            characteristic: RwLock::new(None),
        }))
    }
}

fn peripheral_key(peripheral: &Peripheral) -> String {
    format!("{:?}", peripheral.id())
}

fn advertises(filter: &DiscoveryFilter, properties: &PeripheralProperties) -> bool {
    filter.matches(properties.local_name.as_deref(), &properties.services)
}

fn identity_of(id: String, properties: &PeripheralProperties) -> PeripheralIdentity {
    PeripheralIdentity {
        id,
        name: properties
            .local_name
            .clone()
            .unwrap_or_else(|| "Unknown Modspresso".to_string()),
        rssi: properties.rssi,
    }
}

/// Open GATT connection to one peripheral
struct BtleplugLink {
    central: Adapter,
    peripheral: Peripheral,
    characteristic: RwLock<Option<Characteristic>>,
}

impl BtleplugLink {
    async fn characteristic(&self) -> Result<Characteristic> {
        self.characteristic
            .read()
            .await
            .clone()
            .ok_or_else(|| ModspressoError::ConnectError("characteristic not resolved".to_string()))
    }
}

#[async_trait]
impl GattLink for BtleplugLink {
    async fn resolve(&self, service: Uuid, characteristic: Uuid) -> Result<()> {
        self.peripheral
            .discover_services()
            .await
            .map_err(|e| ModspressoError::ConnectError(e.to_string()))?;

        let found = self
            .peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.service_uuid == service && c.uuid == characteristic)
            .ok_or_else(|| {
                ModspressoError::ConnectError(format!(
                    "characteristic {characteristic} not found in service {service}"
                ))
            })?;

        *self.characteristic.write().await = Some(found);
        Ok(())
    }

    async fn subscribe(&self) -> Result<BoxStream<'static, LinkEvent>> {
        let characteristic = self.characteristic().await?;
        self.peripheral
            .subscribe(&characteristic)
            .await
            .map_err(|e| ModspressoError::ConnectError(e.to_string()))?;

        let uuid = characteristic.uuid;
        let notifications = self
            .peripheral
            .notifications()
            .await?
            .filter_map(move |n| {
                future::ready((n.uuid == uuid).then_some(LinkEvent::Notification(n.value)))
            });

        let peer = self.peripheral.id();
        let disconnects = self.central.events().await?.filter_map(move |event| {
            future::ready(match event {
                CentralEvent::DeviceDisconnected(id) if id == peer => Some(LinkEvent::Disconnected),
                _ => None,
            })
        });

        Ok(stream::select(notifications, disconnects).boxed())
    }

    async fn unsubscribe(&self) -> Result<()> {
        let characteristic = self.characteristic.read().await.clone();
        if let Some(characteristic) = characteristic {
            if self.peripheral.is_connected().await.unwrap_or(false) {
                self.peripheral.unsubscribe(&characteristic).await?;
            }
        }
        Ok(())
    }

    async fn write(&self, frame: &[u8]) -> Result<()> {
        let characteristic = self
            .characteristic()
            .await
            .map_err(|e| ModspressoError::WriteFailed(e.to_string()))?;

        self.peripheral
            .write(&characteristic, frame, WriteType::WithResponse)
            .await
            .map_err(|e| ModspressoError::WriteFailed(e.to_string()))
    }

    async fn close(&self) -> Result<()> {
        self.characteristic.write().await.take();
        if self.peripheral.is_connected().await.unwrap_or(false) {
            self.peripheral.disconnect().await?;
        }
        Ok(())
    }
}
