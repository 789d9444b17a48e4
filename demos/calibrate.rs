use std::time::Duration;
use tracing::info;
use modspresso::{
    pressure_for_level, CalibrationCurve, ConnectionParams, EspressoDevice, Result,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("🔧 Modspresso Calibration Example");

    // Manometer readings taken at each dimmer level
    let curve = CalibrationCurve::from_samples([
        (10, 0.8),
        (20, 1.9),
        (30, 3.1),
        (50, 6.5),
        (70, 8.2),
        (100, 9.4),
    ])?;

    for level in [15, 40, 85] {
        info!(
            "Level {level}% -> {:.2} bar",
            pressure_for_level(&curve, level)
        );
    }

    let device = EspressoDevice::with_bluetooth(ConnectionParams::default()).await?;
    device.connect_first().await?;

    device.start_calibration().await?;
    device.push_calibration_data(&curve).await?;
    device.request_calibration_status().await?;

    for bar in [3.0, 6.0, 9.0] {
        let level = device.set_target_pressure(bar).await?;
        info!("Holding {bar:.1} bar at level {level}%");
        tokio::time::sleep(Duration::from_secs(3)).await;
    }

    device.set_control_level(0).await?;
    device.disconnect().await?;
    info!("✅ Calibration pushed");
    Ok(())
}
