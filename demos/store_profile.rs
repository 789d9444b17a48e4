use tracing::{error, info};
use modspresso::{
    protocol, ConnectionParams, EspressoDevice, HardwareButton, Profile, ProfileSegment, Result,
    MAX_WRITE_SIZE,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("💾 Modspresso Store Profile Example");

    let profile = Profile::new(
        "lever-decline",
        "Declining Lever Pull",
        vec![
            ProfileSegment::new(0.0, 6.0, 1.0, 3.0),
            ProfileSegment::new(6.0, 10.0, 3.0, 9.0),
            ProfileSegment::new(10.0, 20.0, 9.0, 9.0),
            ProfileSegment::new(20.0, 35.0, 9.0, 5.0),
        ],
    );
    profile.validate()?;

    let frame = protocol::shrink_store_profile(2, &profile, MAX_WRITE_SIZE)?;
    info!(
        "Encoded '{}' ({:.0}s) into {} bytes",
        profile.name,
        profile.total_duration(),
        frame.len()
    );

    let device = EspressoDevice::with_bluetooth(ConnectionParams::default()).await?;
    if let Err(e) = device.connect_first().await {
        error!("❌ Failed to connect to device: {}", e);
        return Err(e);
    }

    device.store_profile(2, &profile).await?;
    device.assign_button_default(HardwareButton::One, 2).await?;
    info!("✅ Stored in slot 2 and assigned to button 1");

    device.request_profile_status().await?;
    tokio::time::sleep(std::time::Duration::from_secs(2)).await;
    if let Some(inventory) = device.profile_inventory().await {
        info!("Device now holds {} profile(s)", inventory.profile_count);
    }

    device.disconnect().await?;
    Ok(())
}
